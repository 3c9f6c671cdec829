use std::time::Duration;

use amqwire_proto::{ProtoError, ProtocolError};

/// Errors surfaced by the async transport layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection went away (socket EOF, I/O failure in the reader, or
    /// an explicit close) while a caller was still waiting on it.
    #[error("connection aborted")]
    ConnectionAborted,

    /// The broker refused an operation and closed the channel or
    /// connection with a reply code.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer violated the wire protocol.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// A frame arrived for a channel id this connection never opened.
    #[error("frame for unknown channel {0}")]
    UnknownChannel(u16),

    #[error("i/o error")]
    Io(#[from] std::io::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// `wait_for_confirmations` called on a channel that never sent
    /// `confirm.select`.
    #[error("publisher confirms not enabled on this channel")]
    ConfirmsNotEnabled,

    /// `run` called from inside an existing async runtime.
    #[error("already inside a tokio runtime; await the future directly")]
    RuntimeActive,

    /// The run harness was stopped by ctrl-c before the main future
    /// finished.
    #[error("interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;
