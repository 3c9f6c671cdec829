//! Connection-level protocol state machine (sans-io).
//!
//! Drives the opening negotiation (start, tune, open) with automatic
//! replies, negotiates `frame_max`/`channel_max`, allocates channel ids and
//! handles the close handshake. Like [`crate::channel::ChannelCore`], it
//! performs no I/O.

use bytes::{BufMut, Bytes, BytesMut};

use crate::channel::FrameOutcome;
use crate::error::{ProtoError, ProtocolError, Result};
use crate::frame::{Frame, FramePayload, FRAME_MIN_SIZE, PROTOCOL_HEADER};
use crate::method::Method;

/// frame-max offered to the broker during tuning.
pub const DEFAULT_FRAME_MAX: u32 = 131_072;
/// channel-max offered to the broker during tuning.
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Idle,
    AwaitingStart,
    AwaitingTune,
    AwaitingOpenOk,
    Open,
    Closing,
    Closed,
}

pub struct ConnectionCore {
    state: ConnectionState,
    virtual_host: String,
    username: String,
    password: String,
    frame_max: u32,
    channel_max: u16,
    heartbeat: u16,
    next_channel_id: u16,
    outbound: BytesMut,
}

impl ConnectionCore {
    pub fn new(virtual_host: &str, username: &str, password: &str) -> Self {
        Self {
            state: ConnectionState::Idle,
            virtual_host: virtual_host.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            frame_max: FRAME_MIN_SIZE,
            channel_max: DEFAULT_CHANNEL_MAX,
            heartbeat: 0,
            next_channel_id: 0,
            outbound: BytesMut::new(),
        }
    }

    /// Negotiated maximum frame size. Until tuning completes this is the
    /// protocol minimum, which every peer must accept.
    pub fn frame_max(&self) -> u32 {
        self.frame_max
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnectionState::Closed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Open)
    }

    /// Drain the bytes queued by method calls and frame handling.
    pub fn data_to_send(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    /// Queue the protocol preamble and start waiting for `connection.start`.
    pub fn initiate(&mut self) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(ProtoError::UnexpectedFrame("connection already initiated"));
        }
        self.outbound.put_slice(&PROTOCOL_HEADER);
        self.state = ConnectionState::AwaitingStart;
        Ok(())
    }

    /// Allocate the next channel id.
    pub fn allocate_channel_id(&mut self) -> Result<u16> {
        if self.next_channel_id >= self.channel_max {
            return Err(ProtoError::UnexpectedFrame("channel-max exhausted"));
        }
        self.next_channel_id += 1;
        Ok(self.next_channel_id)
    }

    /// Begin the close handshake. Returns true: `connection.close-ok` is owed.
    pub fn close(&mut self, reply_code: u16, reply_text: &str) -> Result<bool> {
        self.state = ConnectionState::Closing;
        self.queue_method(Method::ConnectionClose {
            reply_code,
            reply_text: reply_text.to_string(),
            class_id: 0,
            method_id: 0,
        })?;
        Ok(true)
    }

    fn queue_method(&mut self, method: Method) -> Result<()> {
        Frame::method(0, method).encode(&mut self.outbound)
    }

    /// Process one inbound frame addressed to channel 0.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<FrameOutcome> {
        let method = match frame.payload {
            FramePayload::Method(method) => method,
            FramePayload::Heartbeat => return Ok(FrameOutcome::default()),
            _ => return Err(ProtoError::UnexpectedFrame("content on channel 0")),
        };

        use Method::*;
        let outcome = match method {
            ConnectionStart { .. } => {
                if self.state != ConnectionState::AwaitingStart {
                    return Err(ProtoError::UnexpectedFrame("connection.start"));
                }
                let mut response = Vec::with_capacity(
                    self.username.len() + self.password.len() + 2,
                );
                response.push(0);
                response.extend_from_slice(self.username.as_bytes());
                response.push(0);
                response.extend_from_slice(self.password.as_bytes());
                self.queue_method(ConnectionStartOk {
                    mechanism: "PLAIN".to_string(),
                    response: Bytes::from(response),
                    locale: "en_US".to_string(),
                })?;
                self.state = ConnectionState::AwaitingTune;
                FrameOutcome::default()
            }
            ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                if self.state != ConnectionState::AwaitingTune {
                    return Err(ProtoError::UnexpectedFrame("connection.tune"));
                }
                self.channel_max = negotiate_max(DEFAULT_CHANNEL_MAX as u32, channel_max as u32) as u16;
                self.frame_max = negotiate_max(DEFAULT_FRAME_MAX, frame_max);
                self.heartbeat = heartbeat;
                self.queue_method(ConnectionTuneOk {
                    channel_max: self.channel_max,
                    frame_max: self.frame_max,
                    heartbeat: self.heartbeat,
                })?;
                self.queue_method(ConnectionOpen {
                    virtual_host: self.virtual_host.clone(),
                })?;
                self.state = ConnectionState::AwaitingOpenOk;
                FrameOutcome::default()
            }
            ConnectionOpenOk => {
                if self.state != ConnectionState::AwaitingOpenOk {
                    return Err(ProtoError::UnexpectedFrame("connection.open-ok"));
                }
                self.state = ConnectionState::Open;
                FrameOutcome {
                    reply: Some(Ok(ConnectionOpenOk)),
                    ..FrameOutcome::default()
                }
            }
            ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                self.state = ConnectionState::Closed;
                self.queue_method(ConnectionCloseOk)?;
                FrameOutcome {
                    reply: Some(Err(ProtocolError {
                        code: reply_code,
                        text: reply_text,
                        class_id,
                        method_id,
                    })),
                    ..FrameOutcome::default()
                }
            }
            ConnectionCloseOk => {
                self.state = ConnectionState::Closed;
                FrameOutcome {
                    reply: Some(Ok(ConnectionCloseOk)),
                    ..FrameOutcome::default()
                }
            }
            _ => return Err(ProtoError::UnexpectedFrame("method on channel 0")),
        };
        Ok(outcome)
    }
}

/// Pick the negotiated value: zero means "no limit", otherwise the smaller
/// of the two proposals wins.
fn negotiate_max(ours: u32, theirs: u32) -> u32 {
    match (ours, theirs) {
        (0, theirs) => theirs,
        (ours, 0) => ours,
        (ours, theirs) => ours.min(theirs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_frame;

    fn drain_methods(core: &mut ConnectionCore) -> Vec<Method> {
        let mut buf = BytesMut::from(core.data_to_send().as_ref());
        let mut methods = Vec::new();
        while let Some(frame) = decode_frame(&mut buf, DEFAULT_FRAME_MAX as usize).unwrap() {
            if let FramePayload::Method(method) = frame.payload {
                methods.push(method);
            }
        }
        methods
    }

    fn start_frame() -> Frame {
        Frame::method(
            0,
            Method::ConnectionStart {
                version_major: 0,
                version_minor: 9,
                mechanisms: "PLAIN".into(),
                locales: "en_US".into(),
            },
        )
    }

    #[test]
    fn initiate_queues_protocol_header() {
        let mut core = ConnectionCore::new("/", "guest", "guest");
        core.initiate().unwrap();
        assert_eq!(core.data_to_send().as_ref(), PROTOCOL_HEADER);
    }

    #[test]
    fn negotiation_auto_replies() {
        let mut core = ConnectionCore::new("/vhost", "guest", "guest");
        core.initiate().unwrap();
        core.data_to_send();

        let outcome = core.handle_frame(start_frame()).unwrap();
        assert!(outcome.reply.is_none());
        let methods = drain_methods(&mut core);
        assert!(matches!(
            &methods[0],
            Method::ConnectionStartOk { mechanism, .. } if mechanism == "PLAIN"
        ));

        let outcome = core
            .handle_frame(Frame::method(
                0,
                Method::ConnectionTune {
                    channel_max: 0,
                    frame_max: 65536,
                    heartbeat: 60,
                },
            ))
            .unwrap();
        assert!(outcome.reply.is_none());
        assert_eq!(core.frame_max(), 65536);

        let methods = drain_methods(&mut core);
        assert!(matches!(
            methods[0],
            Method::ConnectionTuneOk { frame_max: 65536, .. }
        ));
        assert!(matches!(
            &methods[1],
            Method::ConnectionOpen { virtual_host } if virtual_host == "/vhost"
        ));

        let outcome = core.handle_frame(Frame::method(0, Method::ConnectionOpenOk)).unwrap();
        assert!(matches!(outcome.reply, Some(Ok(Method::ConnectionOpenOk))));
        assert!(core.is_open());
    }

    #[test]
    fn frame_max_negotiation_prefers_smaller_nonzero() {
        assert_eq!(negotiate_max(131_072, 65_536), 65_536);
        assert_eq!(negotiate_max(131_072, 0), 131_072);
        assert_eq!(negotiate_max(0, 65_536), 65_536);
    }

    #[test]
    fn out_of_order_negotiation_rejected() {
        let mut core = ConnectionCore::new("/", "guest", "guest");
        core.initiate().unwrap();
        let err = core
            .handle_frame(Frame::method(0, Method::ConnectionOpenOk))
            .unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedFrame(_)));
    }

    #[test]
    fn broker_close_answers_close_ok() {
        let mut core = ConnectionCore::new("/", "guest", "guest");
        core.initiate().unwrap();
        core.handle_frame(start_frame()).unwrap();
        core.data_to_send();

        let outcome = core
            .handle_frame(Frame::method(
                0,
                Method::ConnectionClose {
                    reply_code: 320,
                    reply_text: "CONNECTION_FORCED".into(),
                    class_id: 0,
                    method_id: 0,
                },
            ))
            .unwrap();
        match outcome.reply {
            Some(Err(err)) => assert_eq!(err.code, 320),
            other => panic!("expected broker error, got {other:?}"),
        }
        assert!(core.is_closed());
        let methods = drain_methods(&mut core);
        assert!(matches!(methods[0], Method::ConnectionCloseOk));
    }

    #[test]
    fn channel_ids_are_unique_and_bounded() {
        let mut core = ConnectionCore::new("/", "guest", "guest");
        let first = core.allocate_channel_id().unwrap();
        let second = core.allocate_channel_id().unwrap();
        assert_ne!(first, second);
        assert!(first >= 1 && second >= 1);
    }

    #[test]
    fn heartbeat_on_channel_zero_is_ignored() {
        let mut core = ConnectionCore::new("/", "guest", "guest");
        core.initiate().unwrap();
        let outcome = core
            .handle_frame(Frame {
                channel_id: 0,
                payload: FramePayload::Heartbeat,
            })
            .unwrap();
        assert!(outcome.reply.is_none());
        assert!(outcome.message.is_none());
    }
}
