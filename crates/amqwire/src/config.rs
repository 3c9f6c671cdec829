use std::net::SocketAddr;
use std::time::Duration;

/// Connection parameters for [`crate::Connection::open`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    /// Bind the client side of the socket before connecting.
    pub local_addr: Option<SocketAddr>,
    /// Read buffer size hint. Defaults to ten maximum-size frames.
    pub read_buffer_size: Option<usize>,
    pub connect_timeout: Duration,
    /// How long close handshakes wait for the reader task before it is
    /// aborted outright.
    pub shutdown_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            local_addr: None,
            read_buffer_size: None,
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExchangeDeclareOptions {
    pub exchange_type: ExchangeType,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    /// Skip the broker's reply and return immediately.
    pub no_wait: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeType {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueDeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Ask the broker to return the message if it cannot be routed.
    pub mandatory: bool,
    /// Ask the broker to return the message if it cannot be delivered
    /// immediately.
    pub immediate: bool,
}
