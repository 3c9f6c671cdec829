use std::fmt;

/// Errors raised while parsing or validating protocol data.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The frame end octet was not 0xCE.
    #[error("bad frame end (expected 0xCE, got {0:#04x})")]
    BadFrameEnd(u8),

    /// Unknown frame type octet.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// The frame payload exceeds the negotiated maximum.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Unknown class/method id pair.
    #[error("unknown method (class {class_id}, method {method_id})")]
    UnknownMethod { class_id: u16, method_id: u16 },

    /// A field could not be decoded from the payload.
    #[error("malformed {0} field")]
    MalformedField(&'static str),

    /// A frame arrived that the current state does not allow.
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    /// An operation was attempted on a closed entity.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// A string field exceeds its wire-format length limit.
    #[error("{field} too long ({len} bytes, max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

/// A negative acknowledgment reported by the broker, carrying the
/// reply code and text from a `connection.close` or `channel.close`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ProtocolError {
    pub code: u16,
    pub text: String,
    /// Class id of the method that caused the error, 0 if none.
    pub class_id: u16,
    /// Method id of the method that caused the error, 0 if none.
    pub method_id: u16,
}

impl ProtocolError {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            class_id: 0,
            method_id: 0,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker error {}: {}", self.code, self.text)
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
