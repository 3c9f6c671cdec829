//! Async client transport for an AMQP-style message broker.
//!
//! One reader task per connection pulls frames off the socket and routes
//! them by channel id; callers send methods through shared handles and
//! block on ordered reply queues. Consumed and returned messages arrive as
//! streams, polled gets as futures, and publisher confirms as a waitable
//! count. The pure protocol logic lives in `amqwire-proto`; this crate
//! adds the sockets, tasks and synchronization around it.
//!
//! ```no_run
//! use amqwire::{ConnectOptions, PublishOptions, Properties};
//! use bytes::Bytes;
//!
//! fn main() -> amqwire::Result<()> {
//!     amqwire::run(async {
//!         amqwire::with_connection(ConnectOptions::default(), |conn| async move {
//!             conn.with_channel(|channel| async move {
//!                 channel
//!                     .basic_publish(
//!                         "",
//!                         "work",
//!                         Properties::default(),
//!                         Bytes::from_static(b"hello"),
//!                         PublishOptions::default(),
//!                     )
//!                     .await
//!             })
//!             .await
//!         })
//!         .await
//!     })
//! }
//! ```

mod channel;
mod config;
mod connection;
mod error;
mod runtime;
mod sync;

pub use amqwire_proto::{DeliveryInfo, Message, Properties, ProtocolError};
pub use channel::{Channel, Messages, QueueInfo};
pub use config::{
    ConnectOptions, ConsumeOptions, ExchangeDeclareOptions, ExchangeType, PublishOptions,
    QueueDeclareOptions,
};
pub use connection::{with_connection, Connection};
pub use error::{Error, Result};
pub use runtime::run;
