//! Per-channel protocol state machine (sans-io).
//!
//! A `ChannelCore` validates and encodes outbound methods, reporting for
//! each one whether the peer owes a reply, and turns inbound frames into
//! [`FrameOutcome`]s for the transport layer to act on. It performs no I/O:
//! encoded bytes accumulate until [`ChannelCore::data_to_send`] is drained.

use std::collections::BTreeSet;

use bytes::{Bytes, BytesMut};

use crate::content::{ContentHeader, DeliveryInfo, Message, Properties};
use crate::error::{ProtoError, ProtocolError, Result};
use crate::frame::{Frame, FramePayload, FRAME_OVERHEAD};
use crate::method::{class, Method};

/// What handling one inbound frame produced.
///
/// The sans-io rendition of "a frame yields pending work and/or a delivered
/// message": at most one reply for the waiting caller, at most one fully
/// assembled message for the router, plus two signaling flags.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// A synchronous reply for the ordered reply queue. `Err` carries a
    /// broker-reported close.
    pub reply: Option<std::result::Result<Method, ProtocolError>>,
    /// A fully assembled inbound message, ready for class routing.
    pub message: Option<Message>,
    /// The broker answered a `basic.get` with get-empty; the poller must be
    /// handed an explicit "no message" sentinel.
    pub get_empty: bool,
    /// The unconfirmed-publish set just transitioned from nonzero to zero.
    pub confirmations_settled: bool,
}

impl FrameOutcome {
    fn reply(method: Method) -> Self {
        Self {
            reply: Some(Ok(method)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

/// In-progress assembly of a method + header + body sequence.
#[derive(Debug)]
struct Assembly {
    delivery_info: DeliveryInfo,
    header: Option<ContentHeader>,
    body: BytesMut,
}

pub struct ChannelCore {
    id: u16,
    state: ChannelState,
    frame_max: u32,
    confirm_mode: bool,
    /// Sequence number the broker will assign to the next confirmed publish.
    publish_seq: u64,
    unconfirmed: BTreeSet<u64>,
    outbound: BytesMut,
    assembly: Option<Assembly>,
}

impl ChannelCore {
    pub fn new(id: u16, frame_max: u32) -> Self {
        Self {
            id,
            state: ChannelState::Idle,
            frame_max,
            confirm_mode: false,
            publish_seq: 0,
            unconfirmed: BTreeSet::new(),
            outbound: BytesMut::new(),
            assembly: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ChannelState::Closed)
    }

    pub fn in_confirm_mode(&self) -> bool {
        self.confirm_mode
    }

    pub fn unconfirmed_count(&self) -> usize {
        self.unconfirmed.len()
    }

    /// Drain the bytes queued by method calls and frame handling.
    pub fn data_to_send(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ChannelState::Open => Ok(()),
            _ => Err(ProtoError::Closed("channel")),
        }
    }

    fn queue_frame(&mut self, payload: FramePayload) -> Result<()> {
        Frame {
            channel_id: self.id,
            payload,
        }
        .encode(&mut self.outbound)
    }

    /// Begin the open handshake. Returns true: `channel.open-ok` is owed.
    pub fn open(&mut self) -> Result<bool> {
        if self.state != ChannelState::Idle {
            return Err(ProtoError::UnexpectedFrame("channel already opened"));
        }
        self.state = ChannelState::Opening;
        self.queue_frame(FramePayload::Method(Method::ChannelOpen))?;
        Ok(true)
    }

    /// Begin the close handshake. Returns true: `channel.close-ok` is owed.
    pub fn close(&mut self, reply_code: u16, reply_text: &str) -> Result<bool> {
        self.state = ChannelState::Closing;
        self.queue_frame(FramePayload::Method(Method::ChannelClose {
            reply_code,
            reply_text: reply_text.to_string(),
            class_id: 0,
            method_id: 0,
        }))?;
        Ok(true)
    }

    /// Validate and encode an outbound method, reporting whether the broker
    /// owes a reply. `no-wait` variants and fire-and-forget methods do not
    /// expect one.
    pub fn send_method(&mut self, method: Method) -> Result<bool> {
        self.ensure_open()?;
        let has_reply = expects_reply(&method);
        if matches!(method, Method::ConfirmSelect { .. }) {
            self.confirm_mode = true;
        }
        self.queue_frame(FramePayload::Method(method))?;
        Ok(has_reply)
    }

    /// Encode a publish: the method frame, a content header and as many
    /// body frames as `frame_max` requires. Fire-and-forget (returns false).
    pub fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        properties: Properties,
        body: Bytes,
    ) -> Result<bool> {
        self.ensure_open()?;
        self.queue_frame(FramePayload::Method(Method::BasicPublish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory,
            immediate,
        }))?;
        self.queue_frame(FramePayload::Header(ContentHeader {
            class_id: class::BASIC,
            body_size: body.len() as u64,
            properties,
        }))?;

        let chunk_size = (self.frame_max as usize).saturating_sub(FRAME_OVERHEAD).max(1);
        let mut rest = body;
        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(chunk_size));
            self.queue_frame(FramePayload::Body(chunk))?;
        }

        if self.confirm_mode {
            self.publish_seq += 1;
            self.unconfirmed.insert(self.publish_seq);
        }
        Ok(false)
    }

    /// Process one inbound frame addressed to this channel.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<FrameOutcome> {
        debug_assert_eq!(frame.channel_id, self.id);
        match frame.payload {
            FramePayload::Method(method) => self.handle_method(method),
            FramePayload::Header(header) => self.handle_header(header),
            FramePayload::Body(chunk) => self.handle_body(chunk),
            FramePayload::Heartbeat => {
                Err(ProtoError::UnexpectedFrame("heartbeat on nonzero channel"))
            }
        }
    }

    fn handle_method(&mut self, method: Method) -> Result<FrameOutcome> {
        use Method::*;
        let outcome = match method {
            ChannelOpenOk => {
                self.state = ChannelState::Open;
                FrameOutcome::reply(ChannelOpenOk)
            }
            ChannelCloseOk => {
                self.state = ChannelState::Closed;
                FrameOutcome::reply(ChannelCloseOk)
            }
            ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                // The broker closed us: acknowledge and surface the error
                // as the reply the caller is waiting on.
                self.state = ChannelState::Closed;
                self.queue_frame(FramePayload::Method(ChannelCloseOk))?;
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
            ChannelFlow { active } => {
                // Broker-initiated flow control; acknowledge in kind.
                self.queue_frame(FramePayload::Method(ChannelFlowOk { active }))?;
                FrameOutcome::default()
            }
            ConfirmSelectOk => {
                self.confirm_mode = true;
                FrameOutcome::reply(ConfirmSelectOk)
            }
            BasicGetOk {
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
                message_count,
            } => {
                self.begin_assembly(DeliveryInfo::GetOk {
                    delivery_tag,
                    redelivered,
                    exchange: exchange.clone(),
                    routing_key: routing_key.clone(),
                    message_count,
                })?;
                FrameOutcome::reply(BasicGetOk {
                    delivery_tag,
                    redelivered,
                    exchange,
                    routing_key,
                    message_count,
                })
            }
            BasicGetEmpty => FrameOutcome {
                reply: Some(Ok(BasicGetEmpty)),
                get_empty: true,
                ..FrameOutcome::default()
            },
            BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                self.begin_assembly(DeliveryInfo::Delivered {
                    consumer_tag,
                    delivery_tag,
                    redelivered,
                    exchange,
                    routing_key,
                })?;
                FrameOutcome::default()
            }
            BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                self.begin_assembly(DeliveryInfo::Returned {
                    reply_code,
                    reply_text,
                    exchange,
                    routing_key,
                })?;
                FrameOutcome::default()
            }
            BasicAck {
                delivery_tag,
                multiple,
            } => self.settle(delivery_tag, multiple),
            BasicNack {
                delivery_tag,
                multiple,
                ..
            } => self.settle(delivery_tag, multiple),
            ChannelFlowOk { .. }
            | ExchangeDeclareOk
            | ExchangeDeleteOk
            | ExchangeBindOk
            | ExchangeUnbindOk
            | QueueDeclareOk { .. }
            | QueueBindOk
            | QueuePurgeOk { .. }
            | QueueDeleteOk { .. }
            | QueueUnbindOk
            | BasicQosOk
            | BasicConsumeOk { .. }
            | BasicCancelOk { .. }
            | BasicRecoverOk
            | TxSelectOk
            | TxCommitOk
            | TxRollbackOk => FrameOutcome::reply(method),
            _ => return Err(ProtoError::UnexpectedFrame("client-bound method on channel")),
        };
        Ok(outcome)
    }

    fn begin_assembly(&mut self, delivery_info: DeliveryInfo) -> Result<()> {
        if self.assembly.is_some() {
            return Err(ProtoError::UnexpectedFrame("content already in flight"));
        }
        self.assembly = Some(Assembly {
            delivery_info,
            header: None,
            body: BytesMut::new(),
        });
        Ok(())
    }

    fn handle_header(&mut self, header: ContentHeader) -> Result<FrameOutcome> {
        let assembly = self
            .assembly
            .as_mut()
            .ok_or(ProtoError::UnexpectedFrame("header without content method"))?;
        if assembly.header.is_some() {
            return Err(ProtoError::UnexpectedFrame("duplicate content header"));
        }
        let complete = header.body_size == 0;
        assembly.header = Some(header);
        if complete {
            return Ok(self.finish_assembly());
        }
        Ok(FrameOutcome::default())
    }

    fn handle_body(&mut self, chunk: Bytes) -> Result<FrameOutcome> {
        let assembly = self
            .assembly
            .as_mut()
            .ok_or(ProtoError::UnexpectedFrame("body without content method"))?;
        let header = assembly
            .header
            .as_ref()
            .ok_or(ProtoError::UnexpectedFrame("body before content header"))?;
        if assembly.body.len() + chunk.len() > header.body_size as usize {
            return Err(ProtoError::UnexpectedFrame("body exceeds declared size"));
        }
        assembly.body.extend_from_slice(&chunk);
        if assembly.body.len() == header.body_size as usize {
            return Ok(self.finish_assembly());
        }
        Ok(FrameOutcome::default())
    }

    fn finish_assembly(&mut self) -> FrameOutcome {
        // Callers only invoke this with a populated assembly + header.
        let Some(assembly) = self.assembly.take() else {
            return FrameOutcome::default();
        };
        let properties = assembly
            .header
            .map(|header| header.properties)
            .unwrap_or_default();
        FrameOutcome {
            message: Some(Message {
                delivery_info: assembly.delivery_info,
                properties,
                body: assembly.body.freeze(),
            }),
            ..FrameOutcome::default()
        }
    }

    fn settle(&mut self, delivery_tag: u64, multiple: bool) -> FrameOutcome {
        let was_pending = !self.unconfirmed.is_empty();
        if multiple {
            // Tag 0 with multiple set means "everything outstanding".
            if delivery_tag == 0 {
                self.unconfirmed.clear();
            } else {
                self.unconfirmed.retain(|&tag| tag > delivery_tag);
            }
        } else {
            self.unconfirmed.remove(&delivery_tag);
        }
        FrameOutcome {
            confirmations_settled: was_pending && self.unconfirmed.is_empty(),
            ..FrameOutcome::default()
        }
    }
}

fn expects_reply(method: &Method) -> bool {
    use Method::*;
    match method {
        BasicPublish { .. }
        | BasicAck { .. }
        | BasicNack { .. }
        | BasicReject { .. }
        | BasicRecoverAsync { .. } => false,
        ExchangeDeclare { no_wait, .. }
        | ExchangeDelete { no_wait, .. }
        | ExchangeBind { no_wait, .. }
        | ExchangeUnbind { no_wait, .. }
        | QueueDeclare { no_wait, .. }
        | QueueBind { no_wait, .. }
        | QueuePurge { no_wait, .. }
        | QueueDelete { no_wait, .. }
        | BasicConsume { no_wait, .. }
        | BasicCancel { no_wait, .. }
        | ConfirmSelect { no_wait } => !no_wait,
        _ => true,
    }
}
