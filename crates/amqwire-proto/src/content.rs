//! Content headers, message properties and delivered messages.
//!
//! A published or delivered message travels as a method frame, followed by
//! one content header frame, followed by zero or more body frames.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, Result};
use crate::wire;

// Property flag bits (protocol section 4.2.6.1), high bit first.
const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_MESSAGE_ID: u16 = 1 << 7;

/// Basic message properties carried in the content header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub content_type: Option<String>,
    /// 1 = transient, 2 = persistent.
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
}

impl Properties {
    fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.content_type.is_some() {
            flags |= FLAG_CONTENT_TYPE;
        }
        if self.delivery_mode.is_some() {
            flags |= FLAG_DELIVERY_MODE;
        }
        if self.priority.is_some() {
            flags |= FLAG_PRIORITY;
        }
        if self.correlation_id.is_some() {
            flags |= FLAG_CORRELATION_ID;
        }
        if self.reply_to.is_some() {
            flags |= FLAG_REPLY_TO;
        }
        if self.message_id.is_some() {
            flags |= FLAG_MESSAGE_ID;
        }
        flags
    }
}

/// Payload of a content header frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub body_size: u64,
    pub properties: Properties,
}

impl ContentHeader {
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u16(self.class_id);
        dst.put_u16(0); // weight, unused
        dst.put_u64(self.body_size);
        dst.put_u16(self.properties.flags());
        let props = &self.properties;
        if let Some(value) = &props.content_type {
            wire::put_short_str(dst, "content-type", value)?;
        }
        if let Some(value) = props.delivery_mode {
            dst.put_u8(value);
        }
        if let Some(value) = props.priority {
            dst.put_u8(value);
        }
        if let Some(value) = &props.correlation_id {
            wire::put_short_str(dst, "correlation-id", value)?;
        }
        if let Some(value) = &props.reply_to {
            wire::put_short_str(dst, "reply-to", value)?;
        }
        if let Some(value) = &props.message_id {
            wire::put_short_str(dst, "message-id", value)?;
        }
        Ok(())
    }

    pub fn decode(mut src: Bytes) -> Result<Self> {
        let class_id = wire::get_u16(&mut src, "class-id")?;
        let weight = wire::get_u16(&mut src, "weight")?;
        if weight != 0 {
            return Err(ProtoError::MalformedField("weight"));
        }
        let body_size = wire::get_u64(&mut src, "body-size")?;
        let flags = wire::get_u16(&mut src, "property-flags")?;

        let mut properties = Properties::default();
        if flags & FLAG_CONTENT_TYPE != 0 {
            properties.content_type = Some(wire::get_short_str(&mut src)?);
        }
        if flags & FLAG_DELIVERY_MODE != 0 {
            properties.delivery_mode = Some(wire::get_u8(&mut src, "delivery-mode")?);
        }
        if flags & FLAG_PRIORITY != 0 {
            properties.priority = Some(wire::get_u8(&mut src, "priority")?);
        }
        if flags & FLAG_CORRELATION_ID != 0 {
            properties.correlation_id = Some(wire::get_short_str(&mut src)?);
        }
        if flags & FLAG_REPLY_TO != 0 {
            properties.reply_to = Some(wire::get_short_str(&mut src)?);
        }
        if flags & FLAG_MESSAGE_ID != 0 {
            properties.message_id = Some(wire::get_short_str(&mut src)?);
        }

        Ok(Self {
            class_id,
            body_size,
            properties,
        })
    }
}

/// How a delivered message reached us; decides its routing destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryInfo {
    /// Response to an explicit `basic.get` poll.
    GetOk {
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
        message_count: u32,
    },
    /// Undeliverable message bounced back by the broker.
    Returned {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    /// Message pushed to an active consumer.
    Delivered {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
}

impl DeliveryInfo {
    /// The broker-assigned delivery tag, if this class carries one.
    pub fn delivery_tag(&self) -> Option<u64> {
        match self {
            Self::GetOk { delivery_tag, .. } | Self::Delivered { delivery_tag, .. } => {
                Some(*delivery_tag)
            }
            Self::Returned { .. } => None,
        }
    }
}

/// A fully assembled inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub delivery_info: DeliveryInfo,
    pub properties: Properties,
    pub body: Bytes,
}
