//! Method codec.
//!
//! A method frame payload is `class-id u16, method-id u16` followed by the
//! method's fields. Class and method ids follow AMQP 0.9.1. Reserved
//! (deprecated) fields and field-table arguments are not carried.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, Result};
use crate::wire;

pub mod class {
    pub const CONNECTION: u16 = 10;
    pub const CHANNEL: u16 = 20;
    pub const EXCHANGE: u16 = 40;
    pub const QUEUE: u16 = 50;
    pub const BASIC: u16 = 60;
    pub const CONFIRM: u16 = 85;
    pub const TX: u16 = 90;
}

/// Reply code for a clean close.
pub const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    // connection (class 10)
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        mechanisms: String,
        locales: String,
    },
    ConnectionStartOk {
        mechanism: String,
        response: Bytes,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,

    // channel (class 20)
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,

    // exchange (class 40)
    ExchangeDeclare {
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
    },
    ExchangeDeclareOk,
    ExchangeDelete {
        exchange: String,
        if_unused: bool,
        no_wait: bool,
    },
    ExchangeDeleteOk,
    ExchangeBind {
        destination: String,
        source: String,
        routing_key: String,
        no_wait: bool,
    },
    ExchangeBindOk,
    ExchangeUnbind {
        destination: String,
        source: String,
        routing_key: String,
        no_wait: bool,
    },
    ExchangeUnbindOk,

    // queue (class 50)
    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
    },
    QueueBindOk,
    QueuePurge {
        queue: String,
        no_wait: bool,
    },
    QueuePurgeOk {
        message_count: u32,
    },
    QueueDelete {
        queue: String,
        if_unused: bool,
        if_empty: bool,
        no_wait: bool,
    },
    QueueDeleteOk {
        message_count: u32,
    },
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    QueueUnbindOk,

    // basic (class 60)
    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicReturn {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicGet {
        queue: String,
        no_ack: bool,
    },
    BasicGetOk {
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
        message_count: u32,
    },
    BasicGetEmpty,
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
    BasicRecoverAsync {
        requeue: bool,
    },
    BasicRecover {
        requeue: bool,
    },
    BasicRecoverOk,
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },

    // confirm (class 85)
    ConfirmSelect {
        no_wait: bool,
    },
    ConfirmSelectOk,

    // tx (class 90)
    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,
}

impl Method {
    /// The `(class-id, method-id)` pair identifying this method on the wire.
    pub fn class_method(&self) -> (u16, u16) {
        use Method::*;
        match self {
            ConnectionStart { .. } => (class::CONNECTION, 10),
            ConnectionStartOk { .. } => (class::CONNECTION, 11),
            ConnectionTune { .. } => (class::CONNECTION, 30),
            ConnectionTuneOk { .. } => (class::CONNECTION, 31),
            ConnectionOpen { .. } => (class::CONNECTION, 40),
            ConnectionOpenOk => (class::CONNECTION, 41),
            ConnectionClose { .. } => (class::CONNECTION, 50),
            ConnectionCloseOk => (class::CONNECTION, 51),

            ChannelOpen => (class::CHANNEL, 10),
            ChannelOpenOk => (class::CHANNEL, 11),
            ChannelFlow { .. } => (class::CHANNEL, 20),
            ChannelFlowOk { .. } => (class::CHANNEL, 21),
            ChannelClose { .. } => (class::CHANNEL, 40),
            ChannelCloseOk => (class::CHANNEL, 41),

            ExchangeDeclare { .. } => (class::EXCHANGE, 10),
            ExchangeDeclareOk => (class::EXCHANGE, 11),
            ExchangeDelete { .. } => (class::EXCHANGE, 20),
            ExchangeDeleteOk => (class::EXCHANGE, 21),
            ExchangeBind { .. } => (class::EXCHANGE, 30),
            ExchangeBindOk => (class::EXCHANGE, 31),
            ExchangeUnbind { .. } => (class::EXCHANGE, 40),
            ExchangeUnbindOk => (class::EXCHANGE, 51),

            QueueDeclare { .. } => (class::QUEUE, 10),
            QueueDeclareOk { .. } => (class::QUEUE, 11),
            QueueBind { .. } => (class::QUEUE, 20),
            QueueBindOk => (class::QUEUE, 21),
            QueuePurge { .. } => (class::QUEUE, 30),
            QueuePurgeOk { .. } => (class::QUEUE, 31),
            QueueDelete { .. } => (class::QUEUE, 40),
            QueueDeleteOk { .. } => (class::QUEUE, 41),
            QueueUnbind { .. } => (class::QUEUE, 50),
            QueueUnbindOk => (class::QUEUE, 51),

            BasicQos { .. } => (class::BASIC, 10),
            BasicQosOk => (class::BASIC, 11),
            BasicConsume { .. } => (class::BASIC, 20),
            BasicConsumeOk { .. } => (class::BASIC, 21),
            BasicCancel { .. } => (class::BASIC, 30),
            BasicCancelOk { .. } => (class::BASIC, 31),
            BasicPublish { .. } => (class::BASIC, 40),
            BasicReturn { .. } => (class::BASIC, 50),
            BasicDeliver { .. } => (class::BASIC, 60),
            BasicGet { .. } => (class::BASIC, 70),
            BasicGetOk { .. } => (class::BASIC, 71),
            BasicGetEmpty => (class::BASIC, 72),
            BasicAck { .. } => (class::BASIC, 80),
            BasicReject { .. } => (class::BASIC, 90),
            BasicRecoverAsync { .. } => (class::BASIC, 100),
            BasicRecover { .. } => (class::BASIC, 110),
            BasicRecoverOk => (class::BASIC, 111),
            BasicNack { .. } => (class::BASIC, 120),

            ConfirmSelect { .. } => (class::CONFIRM, 10),
            ConfirmSelectOk => (class::CONFIRM, 11),

            TxSelect => (class::TX, 10),
            TxSelectOk => (class::TX, 11),
            TxCommit => (class::TX, 20),
            TxCommitOk => (class::TX, 21),
            TxRollback => (class::TX, 30),
            TxRollbackOk => (class::TX, 31),
        }
    }

    /// Serialize the method into a frame payload.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        use Method::*;
        let (class_id, method_id) = self.class_method();
        dst.put_u16(class_id);
        dst.put_u16(method_id);

        match self {
            ConnectionStart {
                version_major,
                version_minor,
                mechanisms,
                locales,
            } => {
                dst.put_u8(*version_major);
                dst.put_u8(*version_minor);
                wire::put_long_str(dst, mechanisms.as_bytes());
                wire::put_long_str(dst, locales.as_bytes());
            }
            ConnectionStartOk {
                mechanism,
                response,
                locale,
            } => {
                wire::put_short_str(dst, "mechanism", mechanism)?;
                wire::put_long_str(dst, response);
                wire::put_short_str(dst, "locale", locale)?;
            }
            ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                dst.put_u16(*channel_max);
                dst.put_u32(*frame_max);
                dst.put_u16(*heartbeat);
            }
            ConnectionOpen { virtual_host } => {
                wire::put_short_str(dst, "virtual-host", virtual_host)?;
            }
            ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                dst.put_u16(*reply_code);
                wire::put_short_str(dst, "reply-text", reply_text)?;
                dst.put_u16(*class_id);
                dst.put_u16(*method_id);
            }
            ChannelFlow { active } | ChannelFlowOk { active } => {
                wire::put_bits(dst, &[*active]);
            }
            ExchangeDeclare {
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
            } => {
                wire::put_short_str(dst, "exchange", exchange)?;
                wire::put_short_str(dst, "type", kind)?;
                wire::put_bits(dst, &[*passive, *durable, *auto_delete, *internal, *no_wait]);
            }
            ExchangeDelete {
                exchange,
                if_unused,
                no_wait,
            } => {
                wire::put_short_str(dst, "exchange", exchange)?;
                wire::put_bits(dst, &[*if_unused, *no_wait]);
            }
            ExchangeBind {
                destination,
                source,
                routing_key,
                no_wait,
            }
            | ExchangeUnbind {
                destination,
                source,
                routing_key,
                no_wait,
            } => {
                wire::put_short_str(dst, "destination", destination)?;
                wire::put_short_str(dst, "source", source)?;
                wire::put_short_str(dst, "routing-key", routing_key)?;
                wire::put_bits(dst, &[*no_wait]);
            }
            QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
            } => {
                wire::put_short_str(dst, "queue", queue)?;
                wire::put_bits(
                    dst,
                    &[*passive, *durable, *exclusive, *auto_delete, *no_wait],
                );
            }
            QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            } => {
                wire::put_short_str(dst, "queue", queue)?;
                dst.put_u32(*message_count);
                dst.put_u32(*consumer_count);
            }
            QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait,
            } => {
                wire::put_short_str(dst, "queue", queue)?;
                wire::put_short_str(dst, "exchange", exchange)?;
                wire::put_short_str(dst, "routing-key", routing_key)?;
                wire::put_bits(dst, &[*no_wait]);
            }
            QueuePurge { queue, no_wait } => {
                wire::put_short_str(dst, "queue", queue)?;
                wire::put_bits(dst, &[*no_wait]);
            }
            QueuePurgeOk { message_count } | QueueDeleteOk { message_count } => {
                dst.put_u32(*message_count);
            }
            QueueDelete {
                queue,
                if_unused,
                if_empty,
                no_wait,
            } => {
                wire::put_short_str(dst, "queue", queue)?;
                wire::put_bits(dst, &[*if_unused, *if_empty, *no_wait]);
            }
            QueueUnbind {
                queue,
                exchange,
                routing_key,
            } => {
                wire::put_short_str(dst, "queue", queue)?;
                wire::put_short_str(dst, "exchange", exchange)?;
                wire::put_short_str(dst, "routing-key", routing_key)?;
            }
            BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            } => {
                dst.put_u32(*prefetch_size);
                dst.put_u16(*prefetch_count);
                wire::put_bits(dst, &[*global]);
            }
            BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
            } => {
                wire::put_short_str(dst, "queue", queue)?;
                wire::put_short_str(dst, "consumer-tag", consumer_tag)?;
                wire::put_bits(dst, &[*no_local, *no_ack, *exclusive, *no_wait]);
            }
            BasicConsumeOk { consumer_tag } | BasicCancelOk { consumer_tag } => {
                wire::put_short_str(dst, "consumer-tag", consumer_tag)?;
            }
            BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                wire::put_short_str(dst, "consumer-tag", consumer_tag)?;
                wire::put_bits(dst, &[*no_wait]);
            }
            BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            } => {
                wire::put_short_str(dst, "exchange", exchange)?;
                wire::put_short_str(dst, "routing-key", routing_key)?;
                wire::put_bits(dst, &[*mandatory, *immediate]);
            }
            BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                dst.put_u16(*reply_code);
                wire::put_short_str(dst, "reply-text", reply_text)?;
                wire::put_short_str(dst, "exchange", exchange)?;
                wire::put_short_str(dst, "routing-key", routing_key)?;
            }
            BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                wire::put_short_str(dst, "consumer-tag", consumer_tag)?;
                dst.put_u64(*delivery_tag);
                wire::put_bits(dst, &[*redelivered]);
                wire::put_short_str(dst, "exchange", exchange)?;
                wire::put_short_str(dst, "routing-key", routing_key)?;
            }
            BasicGet { queue, no_ack } => {
                wire::put_short_str(dst, "queue", queue)?;
                wire::put_bits(dst, &[*no_ack]);
            }
            BasicGetOk {
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
                message_count,
            } => {
                dst.put_u64(*delivery_tag);
                wire::put_bits(dst, &[*redelivered]);
                wire::put_short_str(dst, "exchange", exchange)?;
                wire::put_short_str(dst, "routing-key", routing_key)?;
                dst.put_u32(*message_count);
            }
            BasicAck {
                delivery_tag,
                multiple,
            } => {
                dst.put_u64(*delivery_tag);
                wire::put_bits(dst, &[*multiple]);
            }
            BasicReject {
                delivery_tag,
                requeue,
            } => {
                dst.put_u64(*delivery_tag);
                wire::put_bits(dst, &[*requeue]);
            }
            BasicRecoverAsync { requeue } | BasicRecover { requeue } => {
                wire::put_bits(dst, &[*requeue]);
            }
            BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                dst.put_u64(*delivery_tag);
                wire::put_bits(dst, &[*multiple, *requeue]);
            }
            ConfirmSelect { no_wait } => {
                wire::put_bits(dst, &[*no_wait]);
            }
            // Methods with no fields.
            ConnectionOpenOk
            | ConnectionCloseOk
            | ChannelOpen
            | ChannelOpenOk
            | ChannelCloseOk
            | ExchangeDeclareOk
            | ExchangeDeleteOk
            | ExchangeBindOk
            | ExchangeUnbindOk
            | QueueBindOk
            | QueueUnbindOk
            | BasicQosOk
            | BasicGetEmpty
            | BasicRecoverOk
            | ConfirmSelectOk
            | TxSelect
            | TxSelectOk
            | TxCommit
            | TxCommitOk
            | TxRollback
            | TxRollbackOk => {}
        }
        Ok(())
    }

    /// Deserialize a method from a frame payload.
    pub fn decode(mut src: Bytes) -> Result<Method> {
        let class_id = wire::get_u16(&mut src, "class-id")?;
        let method_id = wire::get_u16(&mut src, "method-id")?;

        let method = match (class_id, method_id) {
            (class::CONNECTION, 10) => Method::ConnectionStart {
                version_major: wire::get_u8(&mut src, "version-major")?,
                version_minor: wire::get_u8(&mut src, "version-minor")?,
                mechanisms: long_string(&mut src)?,
                locales: long_string(&mut src)?,
            },
            (class::CONNECTION, 11) => Method::ConnectionStartOk {
                mechanism: wire::get_short_str(&mut src)?,
                response: wire::get_long_str(&mut src)?,
                locale: wire::get_short_str(&mut src)?,
            },
            (class::CONNECTION, 30) => Method::ConnectionTune {
                channel_max: wire::get_u16(&mut src, "channel-max")?,
                frame_max: wire::get_u32(&mut src, "frame-max")?,
                heartbeat: wire::get_u16(&mut src, "heartbeat")?,
            },
            (class::CONNECTION, 31) => Method::ConnectionTuneOk {
                channel_max: wire::get_u16(&mut src, "channel-max")?,
                frame_max: wire::get_u32(&mut src, "frame-max")?,
                heartbeat: wire::get_u16(&mut src, "heartbeat")?,
            },
            (class::CONNECTION, 40) => Method::ConnectionOpen {
                virtual_host: wire::get_short_str(&mut src)?,
            },
            (class::CONNECTION, 41) => Method::ConnectionOpenOk,
            (class::CONNECTION, 50) => Method::ConnectionClose {
                reply_code: wire::get_u16(&mut src, "reply-code")?,
                reply_text: wire::get_short_str(&mut src)?,
                class_id: wire::get_u16(&mut src, "class-id")?,
                method_id: wire::get_u16(&mut src, "method-id")?,
            },
            (class::CONNECTION, 51) => Method::ConnectionCloseOk,

            (class::CHANNEL, 10) => Method::ChannelOpen,
            (class::CHANNEL, 11) => Method::ChannelOpenOk,
            (class::CHANNEL, 20) => {
                let [active] = wire::get_bits(&mut src)?;
                Method::ChannelFlow { active }
            }
            (class::CHANNEL, 21) => {
                let [active] = wire::get_bits(&mut src)?;
                Method::ChannelFlowOk { active }
            }
            (class::CHANNEL, 40) => Method::ChannelClose {
                reply_code: wire::get_u16(&mut src, "reply-code")?,
                reply_text: wire::get_short_str(&mut src)?,
                class_id: wire::get_u16(&mut src, "class-id")?,
                method_id: wire::get_u16(&mut src, "method-id")?,
            },
            (class::CHANNEL, 41) => Method::ChannelCloseOk,

            (class::EXCHANGE, 10) => {
                let exchange = wire::get_short_str(&mut src)?;
                let kind = wire::get_short_str(&mut src)?;
                let [passive, durable, auto_delete, internal, no_wait] =
                    wire::get_bits(&mut src)?;
                Method::ExchangeDeclare {
                    exchange,
                    kind,
                    passive,
                    durable,
                    auto_delete,
                    internal,
                    no_wait,
                }
            }
            (class::EXCHANGE, 11) => Method::ExchangeDeclareOk,
            (class::EXCHANGE, 20) => {
                let exchange = wire::get_short_str(&mut src)?;
                let [if_unused, no_wait] = wire::get_bits(&mut src)?;
                Method::ExchangeDelete {
                    exchange,
                    if_unused,
                    no_wait,
                }
            }
            (class::EXCHANGE, 21) => Method::ExchangeDeleteOk,
            (class::EXCHANGE, 30) => {
                let destination = wire::get_short_str(&mut src)?;
                let source = wire::get_short_str(&mut src)?;
                let routing_key = wire::get_short_str(&mut src)?;
                let [no_wait] = wire::get_bits(&mut src)?;
                Method::ExchangeBind {
                    destination,
                    source,
                    routing_key,
                    no_wait,
                }
            }
            (class::EXCHANGE, 31) => Method::ExchangeBindOk,
            (class::EXCHANGE, 40) => {
                let destination = wire::get_short_str(&mut src)?;
                let source = wire::get_short_str(&mut src)?;
                let routing_key = wire::get_short_str(&mut src)?;
                let [no_wait] = wire::get_bits(&mut src)?;
                Method::ExchangeUnbind {
                    destination,
                    source,
                    routing_key,
                    no_wait,
                }
            }
            (class::EXCHANGE, 51) => Method::ExchangeUnbindOk,

            (class::QUEUE, 10) => {
                let queue = wire::get_short_str(&mut src)?;
                let [passive, durable, exclusive, auto_delete, no_wait] =
                    wire::get_bits(&mut src)?;
                Method::QueueDeclare {
                    queue,
                    passive,
                    durable,
                    exclusive,
                    auto_delete,
                    no_wait,
                }
            }
            (class::QUEUE, 11) => Method::QueueDeclareOk {
                queue: wire::get_short_str(&mut src)?,
                message_count: wire::get_u32(&mut src, "message-count")?,
                consumer_count: wire::get_u32(&mut src, "consumer-count")?,
            },
            (class::QUEUE, 20) => {
                let queue = wire::get_short_str(&mut src)?;
                let exchange = wire::get_short_str(&mut src)?;
                let routing_key = wire::get_short_str(&mut src)?;
                let [no_wait] = wire::get_bits(&mut src)?;
                Method::QueueBind {
                    queue,
                    exchange,
                    routing_key,
                    no_wait,
                }
            }
            (class::QUEUE, 21) => Method::QueueBindOk,
            (class::QUEUE, 30) => {
                let queue = wire::get_short_str(&mut src)?;
                let [no_wait] = wire::get_bits(&mut src)?;
                Method::QueuePurge { queue, no_wait }
            }
            (class::QUEUE, 31) => Method::QueuePurgeOk {
                message_count: wire::get_u32(&mut src, "message-count")?,
            },
            (class::QUEUE, 40) => {
                let queue = wire::get_short_str(&mut src)?;
                let [if_unused, if_empty, no_wait] = wire::get_bits(&mut src)?;
                Method::QueueDelete {
                    queue,
                    if_unused,
                    if_empty,
                    no_wait,
                }
            }
            (class::QUEUE, 41) => Method::QueueDeleteOk {
                message_count: wire::get_u32(&mut src, "message-count")?,
            },
            (class::QUEUE, 50) => Method::QueueUnbind {
                queue: wire::get_short_str(&mut src)?,
                exchange: wire::get_short_str(&mut src)?,
                routing_key: wire::get_short_str(&mut src)?,
            },
            (class::QUEUE, 51) => Method::QueueUnbindOk,

            (class::BASIC, 10) => {
                let prefetch_size = wire::get_u32(&mut src, "prefetch-size")?;
                let prefetch_count = wire::get_u16(&mut src, "prefetch-count")?;
                let [global] = wire::get_bits(&mut src)?;
                Method::BasicQos {
                    prefetch_size,
                    prefetch_count,
                    global,
                }
            }
            (class::BASIC, 11) => Method::BasicQosOk,
            (class::BASIC, 20) => {
                let queue = wire::get_short_str(&mut src)?;
                let consumer_tag = wire::get_short_str(&mut src)?;
                let [no_local, no_ack, exclusive, no_wait] = wire::get_bits(&mut src)?;
                Method::BasicConsume {
                    queue,
                    consumer_tag,
                    no_local,
                    no_ack,
                    exclusive,
                    no_wait,
                }
            }
            (class::BASIC, 21) => Method::BasicConsumeOk {
                consumer_tag: wire::get_short_str(&mut src)?,
            },
            (class::BASIC, 30) => {
                let consumer_tag = wire::get_short_str(&mut src)?;
                let [no_wait] = wire::get_bits(&mut src)?;
                Method::BasicCancel {
                    consumer_tag,
                    no_wait,
                }
            }
            (class::BASIC, 31) => Method::BasicCancelOk {
                consumer_tag: wire::get_short_str(&mut src)?,
            },
            (class::BASIC, 40) => {
                let exchange = wire::get_short_str(&mut src)?;
                let routing_key = wire::get_short_str(&mut src)?;
                let [mandatory, immediate] = wire::get_bits(&mut src)?;
                Method::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory,
                    immediate,
                }
            }
            (class::BASIC, 50) => Method::BasicReturn {
                reply_code: wire::get_u16(&mut src, "reply-code")?,
                reply_text: wire::get_short_str(&mut src)?,
                exchange: wire::get_short_str(&mut src)?,
                routing_key: wire::get_short_str(&mut src)?,
            },
            (class::BASIC, 60) => {
                let consumer_tag = wire::get_short_str(&mut src)?;
                let delivery_tag = wire::get_u64(&mut src, "delivery-tag")?;
                let [redelivered] = wire::get_bits(&mut src)?;
                let exchange = wire::get_short_str(&mut src)?;
                let routing_key = wire::get_short_str(&mut src)?;
                Method::BasicDeliver {
                    consumer_tag,
                    delivery_tag,
                    redelivered,
                    exchange,
                    routing_key,
                }
            }
            (class::BASIC, 70) => {
                let queue = wire::get_short_str(&mut src)?;
                let [no_ack] = wire::get_bits(&mut src)?;
                Method::BasicGet { queue, no_ack }
            }
            (class::BASIC, 71) => {
                let delivery_tag = wire::get_u64(&mut src, "delivery-tag")?;
                let [redelivered] = wire::get_bits(&mut src)?;
                let exchange = wire::get_short_str(&mut src)?;
                let routing_key = wire::get_short_str(&mut src)?;
                let message_count = wire::get_u32(&mut src, "message-count")?;
                Method::BasicGetOk {
                    delivery_tag,
                    redelivered,
                    exchange,
                    routing_key,
                    message_count,
                }
            }
            (class::BASIC, 72) => Method::BasicGetEmpty,
            (class::BASIC, 80) => {
                let delivery_tag = wire::get_u64(&mut src, "delivery-tag")?;
                let [multiple] = wire::get_bits(&mut src)?;
                Method::BasicAck {
                    delivery_tag,
                    multiple,
                }
            }
            (class::BASIC, 90) => {
                let delivery_tag = wire::get_u64(&mut src, "delivery-tag")?;
                let [requeue] = wire::get_bits(&mut src)?;
                Method::BasicReject {
                    delivery_tag,
                    requeue,
                }
            }
            (class::BASIC, 100) => {
                let [requeue] = wire::get_bits(&mut src)?;
                Method::BasicRecoverAsync { requeue }
            }
            (class::BASIC, 110) => {
                let [requeue] = wire::get_bits(&mut src)?;
                Method::BasicRecover { requeue }
            }
            (class::BASIC, 111) => Method::BasicRecoverOk,
            (class::BASIC, 120) => {
                let delivery_tag = wire::get_u64(&mut src, "delivery-tag")?;
                let [multiple, requeue] = wire::get_bits(&mut src)?;
                Method::BasicNack {
                    delivery_tag,
                    multiple,
                    requeue,
                }
            }

            (class::CONFIRM, 10) => {
                let [no_wait] = wire::get_bits(&mut src)?;
                Method::ConfirmSelect { no_wait }
            }
            (class::CONFIRM, 11) => Method::ConfirmSelectOk,

            (class::TX, 10) => Method::TxSelect,
            (class::TX, 11) => Method::TxSelectOk,
            (class::TX, 20) => Method::TxCommit,
            (class::TX, 21) => Method::TxCommitOk,
            (class::TX, 30) => Method::TxRollback,
            (class::TX, 31) => Method::TxRollbackOk,

            (class_id, method_id) => {
                return Err(ProtoError::UnknownMethod {
                    class_id,
                    method_id,
                })
            }
        };

        Ok(method)
    }
}

fn long_string(src: &mut Bytes) -> Result<String> {
    let raw = wire::get_long_str(src)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::MalformedField("long string utf8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(method: Method) {
        let mut buf = BytesMut::new();
        method.encode(&mut buf).unwrap();
        let decoded = Method::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, method);
    }

    #[test]
    fn connection_methods_roundtrip() {
        roundtrip(Method::ConnectionStart {
            version_major: 0,
            version_minor: 9,
            mechanisms: "PLAIN".into(),
            locales: "en_US".into(),
        });
        roundtrip(Method::ConnectionStartOk {
            mechanism: "PLAIN".into(),
            response: Bytes::from_static(b"\x00guest\x00guest"),
            locale: "en_US".into(),
        });
        roundtrip(Method::ConnectionTune {
            channel_max: 2047,
            frame_max: 131072,
            heartbeat: 60,
        });
        roundtrip(Method::ConnectionOpen {
            virtual_host: "/".into(),
        });
        roundtrip(Method::ConnectionClose {
            reply_code: 320,
            reply_text: "CONNECTION_FORCED".into(),
            class_id: 0,
            method_id: 0,
        });
        roundtrip(Method::ConnectionCloseOk);
    }

    #[test]
    fn channel_methods_roundtrip() {
        roundtrip(Method::ChannelOpen);
        roundtrip(Method::ChannelFlow { active: false });
        roundtrip(Method::ChannelClose {
            reply_code: 406,
            reply_text: "PRECONDITION_FAILED".into(),
            class_id: 50,
            method_id: 10,
        });
    }

    #[test]
    fn exchange_and_queue_methods_roundtrip() {
        roundtrip(Method::ExchangeDeclare {
            exchange: "events".into(),
            kind: "topic".into(),
            passive: false,
            durable: true,
            auto_delete: false,
            internal: false,
            no_wait: false,
        });
        roundtrip(Method::ExchangeBind {
            destination: "audit".into(),
            source: "events".into(),
            routing_key: "#".into(),
            no_wait: false,
        });
        roundtrip(Method::QueueDeclare {
            queue: "q1".into(),
            passive: false,
            durable: false,
            exclusive: true,
            auto_delete: true,
            no_wait: false,
        });
        roundtrip(Method::QueueDeclareOk {
            queue: "q1".into(),
            message_count: 3,
            consumer_count: 1,
        });
        roundtrip(Method::QueueDelete {
            queue: "q1".into(),
            if_unused: true,
            if_empty: false,
            no_wait: false,
        });
        roundtrip(Method::QueueUnbind {
            queue: "q1".into(),
            exchange: "events".into(),
            routing_key: "k".into(),
        });
    }

    #[test]
    fn basic_methods_roundtrip() {
        roundtrip(Method::BasicQos {
            prefetch_size: 0,
            prefetch_count: 10,
            global: false,
        });
        roundtrip(Method::BasicConsume {
            queue: "q1".into(),
            consumer_tag: "".into(),
            no_local: false,
            no_ack: true,
            exclusive: false,
            no_wait: false,
        });
        roundtrip(Method::BasicPublish {
            exchange: "".into(),
            routing_key: "q1".into(),
            mandatory: true,
            immediate: false,
        });
        roundtrip(Method::BasicDeliver {
            consumer_tag: "ctag-1".into(),
            delivery_tag: 42,
            redelivered: true,
            exchange: "events".into(),
            routing_key: "orders.created".into(),
        });
        roundtrip(Method::BasicGetOk {
            delivery_tag: 7,
            redelivered: false,
            exchange: "".into(),
            routing_key: "q1".into(),
            message_count: 0,
        });
        roundtrip(Method::BasicGetEmpty);
        roundtrip(Method::BasicAck {
            delivery_tag: 7,
            multiple: false,
        });
        roundtrip(Method::BasicNack {
            delivery_tag: 9,
            multiple: true,
            requeue: false,
        });
    }

    #[test]
    fn confirm_and_tx_methods_roundtrip() {
        roundtrip(Method::ConfirmSelect { no_wait: false });
        roundtrip(Method::TxSelect);
        roundtrip(Method::TxCommit);
        roundtrip(Method::TxRollback);
    }

    #[test]
    fn unknown_method_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(10);
        buf.put_u16(99);
        let err = Method::decode(buf.freeze()).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::UnknownMethod {
                class_id: 10,
                method_id: 99
            }
        ));
    }

    #[test]
    fn truncated_method_rejected() {
        let mut buf = BytesMut::new();
        Method::BasicAck {
            delivery_tag: 1,
            multiple: false,
        }
        .encode(&mut buf)
        .unwrap();
        buf.truncate(buf.len() - 2);
        let err = Method::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtoError::MalformedField(_)));
    }
}
