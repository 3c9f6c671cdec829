//! Sans-io engine for an AMQP-style messaging protocol.
//!
//! This crate owns the pure protocol logic: the frame codec, the method
//! codec, content assembly, and the per-connection / per-channel state
//! machines. It never touches a socket: callers feed it inbound frames via
//! `handle_frame`, drain outbound bytes via `data_to_send`, and learn from
//! each method call whether the peer owes a reply. The async transport
//! layer lives in the `amqwire` crate.

pub mod channel;
pub mod connection;
pub mod content;
pub mod error;
pub mod frame;
pub mod method;
pub mod wire;

pub use channel::{ChannelCore, FrameOutcome};
pub use connection::{ConnectionCore, DEFAULT_CHANNEL_MAX, DEFAULT_FRAME_MAX};
pub use content::{ContentHeader, DeliveryInfo, Message, Properties};
pub use error::{ProtoError, ProtocolError, Result};
pub use frame::{
    decode_frame, Frame, FramePayload, FRAME_MIN_SIZE, FRAME_OVERHEAD, PROTOCOL_HEADER,
};
pub use method::{Method, REPLY_SUCCESS};
