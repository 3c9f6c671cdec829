//! The channel handle: every protocol operation a caller performs after
//! the connection is up goes through a [`Channel`].
//!
//! A channel owns one [`amqwire_proto::ChannelCore`] behind a mutex, an
//! ordered reply queue, a get-result queue and two message streams. The
//! reader task feeds all of them through [`ChannelInner::handle_frame`];
//! callers drive the other side through [`ChannelInner::call`].

use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use amqwire_proto::channel::ChannelCore;
use amqwire_proto::{DeliveryInfo, Frame, Message, Method, Properties, REPLY_SUCCESS};
use bytes::Bytes;
use futures_core::Stream;
use tokio::sync::mpsc;

use crate::config::{
    ConsumeOptions, ExchangeDeclareOptions, PublishOptions, QueueDeclareOptions,
};
use crate::connection::ConnectionInner;
use crate::error::{Error, Result};
use crate::sync::{ConfirmSignal, Mailbox, ReplyCorrelator};

/// Reply from a `queue.declare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

pub(crate) struct ChannelInner {
    core: Mutex<ChannelCore>,
    connection: Weak<ConnectionInner>,
    replies: ReplyCorrelator,
    /// One entry per answered `basic.get`: the message, or `None` for
    /// get-empty.
    get_results: Mailbox<Option<Message>>,
    deliveries_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    deliveries_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    returns_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    returns_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    confirms: ConfirmSignal,
}

impl ChannelInner {
    pub(crate) fn new(id: u16, frame_max: u32, connection: Weak<ConnectionInner>) -> Self {
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let (returns_tx, returns_rx) = mpsc::unbounded_channel();
        Self {
            core: Mutex::new(ChannelCore::new(id, frame_max)),
            connection,
            replies: ReplyCorrelator::new(),
            get_results: Mailbox::new(),
            deliveries_tx: Mutex::new(Some(deliveries_tx)),
            deliveries_rx: Mutex::new(Some(deliveries_rx)),
            returns_tx: Mutex::new(Some(returns_tx)),
            returns_rx: Mutex::new(Some(returns_rx)),
            confirms: ConfirmSignal::new(),
        }
    }

    fn connection(&self) -> Result<Arc<ConnectionInner>> {
        self.connection.upgrade().ok_or(Error::ConnectionAborted)
    }

    /// Send the channel-open method and wait for open-ok.
    pub(crate) async fn open(&self) -> Result<()> {
        let conn = self.connection()?;
        let bytes = {
            let mut core = self.core.lock().unwrap();
            core.open()?;
            core.data_to_send()
        };
        conn.write(bytes).await?;
        self.replies.recv().await?;
        Ok(())
    }

    /// Send one method and, if the broker owes a reply, wait for it.
    async fn call(&self, method: Method) -> Result<Option<Method>> {
        let conn = self.connection()?;
        let (has_reply, bytes) = {
            let mut core = self.core.lock().unwrap();
            let has_reply = core.send_method(method)?;
            (has_reply, core.data_to_send())
        };
        conn.write(bytes).await?;
        if has_reply {
            Ok(Some(self.replies.recv().await?))
        } else {
            Ok(None)
        }
    }

    /// Process one inbound frame, returning any auto-reply bytes the state
    /// machine queued. Runs on the reader task.
    pub(crate) fn handle_frame(&self, frame: Frame) -> Result<Bytes> {
        let (outcome, bytes, closed) = {
            let mut core = self.core.lock().unwrap();
            let outcome = core.handle_frame(frame)?;
            (outcome, core.data_to_send(), core.is_closed())
        };

        if let Some(reply) = outcome.reply {
            self.replies.deliver(reply);
        }
        if let Some(message) = outcome.message {
            match &message.delivery_info {
                DeliveryInfo::GetOk { .. } => self.get_results.push(Some(message)),
                DeliveryInfo::Delivered { .. } => {
                    if let Some(tx) = &*self.deliveries_tx.lock().unwrap() {
                        // Receiver dropped means the caller stopped
                        // consuming; the message is discarded.
                        let _ = tx.send(message);
                    }
                }
                DeliveryInfo::Returned { .. } => {
                    if let Some(tx) = &*self.returns_tx.lock().unwrap() {
                        let _ = tx.send(message);
                    }
                }
            }
        }
        if outcome.get_empty {
            self.get_results.push(None);
        }
        if outcome.confirmations_settled {
            self.confirms.settled();
        }
        if closed {
            self.shutdown();
        }
        Ok(bytes)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.core.lock().unwrap().is_closed()
    }

    /// Release every waiter and end both message streams. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.replies.abort();
        self.get_results.close();
        self.confirms.abort();
        self.deliveries_tx.lock().unwrap().take();
        self.returns_tx.lock().unwrap().take();
    }
}

/// A single multiplexed channel on an open connection.
///
/// Cloning yields another handle to the same channel. All methods are
/// cancel-safe up to the point the method frame hits the socket; a caller
/// that gives up mid-wait leaves the reply for nobody, so prefer running
/// one synchronous operation at a time per channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> u16 {
        self.inner.core.lock().unwrap().id()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// The stream of messages delivered to consumers on this channel.
    ///
    /// The stream can be taken once; later calls yield an exhausted stream.
    /// It ends when the channel or connection closes.
    pub fn deliveries(&self) -> Messages {
        Messages {
            rx: self.inner.deliveries_rx.lock().unwrap().take(),
        }
    }

    /// The stream of mandatory/immediate publishes the broker returned
    /// undeliverable. Same take-once semantics as [`Channel::deliveries`].
    pub fn returns(&self) -> Messages {
        Messages {
            rx: self.inner.returns_rx.lock().unwrap().take(),
        }
    }

    pub async fn exchange_declare(
        &self,
        exchange: &str,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        self.inner
            .call(Method::ExchangeDeclare {
                exchange: exchange.to_string(),
                kind: options.exchange_type.as_str().to_string(),
                passive: options.passive,
                durable: options.durable,
                auto_delete: options.auto_delete,
                internal: options.internal,
                no_wait: options.no_wait,
            })
            .await?;
        Ok(())
    }

    pub async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<()> {
        self.inner
            .call(Method::ExchangeDelete {
                exchange: exchange.to_string(),
                if_unused,
                no_wait: false,
            })
            .await?;
        Ok(())
    }

    pub async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.inner
            .call(Method::ExchangeBind {
                destination: destination.to_string(),
                source: source.to_string(),
                routing_key: routing_key.to_string(),
                no_wait: false,
            })
            .await?;
        Ok(())
    }

    pub async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.inner
            .call(Method::ExchangeUnbind {
                destination: destination.to_string(),
                source: source.to_string(),
                routing_key: routing_key.to_string(),
                no_wait: false,
            })
            .await?;
        Ok(())
    }

    /// Declare a queue. With `no_wait` (or a no-reply broker) the returned
    /// counts are zero and the name is echoed back unchanged.
    pub async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
    ) -> Result<QueueInfo> {
        let reply = self
            .inner
            .call(Method::QueueDeclare {
                queue: queue.to_string(),
                passive: options.passive,
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                no_wait: options.no_wait,
            })
            .await?;
        match reply {
            Some(Method::QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            }) => Ok(QueueInfo {
                queue,
                message_count,
                consumer_count,
            }),
            None => Ok(QueueInfo {
                queue: queue.to_string(),
                message_count: 0,
                consumer_count: 0,
            }),
            Some(_) => Err(unexpected_reply("queue.declare")),
        }
    }

    pub async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .call(Method::QueueBind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                no_wait: false,
            })
            .await?;
        Ok(())
    }

    pub async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .call(Method::QueueUnbind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Drop all messages from a queue, returning how many were purged.
    pub async fn queue_purge(&self, queue: &str) -> Result<u32> {
        let reply = self
            .inner
            .call(Method::QueuePurge {
                queue: queue.to_string(),
                no_wait: false,
            })
            .await?;
        match reply {
            Some(Method::QueuePurgeOk { message_count }) => Ok(message_count),
            _ => Err(unexpected_reply("queue.purge")),
        }
    }

    /// Delete a queue, returning how many messages it still held.
    pub async fn queue_delete(&self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        let reply = self
            .inner
            .call(Method::QueueDelete {
                queue: queue.to_string(),
                if_unused,
                if_empty,
                no_wait: false,
            })
            .await?;
        match reply {
            Some(Method::QueueDeleteOk { message_count }) => Ok(message_count),
            _ => Err(unexpected_reply("queue.delete")),
        }
    }

    pub async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<()> {
        self.inner
            .call(Method::BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            })
            .await?;
        Ok(())
    }

    /// Start a consumer; delivered messages arrive on
    /// [`Channel::deliveries`]. Returns the consumer tag (broker-assigned
    /// if the requested tag was empty).
    pub async fn basic_consume(&self, queue: &str, options: ConsumeOptions) -> Result<String> {
        let reply = self
            .inner
            .call(Method::BasicConsume {
                queue: queue.to_string(),
                consumer_tag: options.consumer_tag.clone(),
                no_local: options.no_local,
                no_ack: options.no_ack,
                exclusive: options.exclusive,
                no_wait: options.no_wait,
            })
            .await?;
        match reply {
            Some(Method::BasicConsumeOk { consumer_tag }) => Ok(consumer_tag),
            None => Ok(options.consumer_tag),
            Some(_) => Err(unexpected_reply("basic.consume")),
        }
    }

    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .call(Method::BasicCancel {
                consumer_tag: consumer_tag.to_string(),
                no_wait: false,
            })
            .await?;
        Ok(())
    }

    /// Publish a message. Fire-and-forget: completion means the frames
    /// were flushed, not that the broker stored anything. Pair with
    /// [`Channel::confirm_select`] and [`Channel::wait_for_confirmations`]
    /// for delivery guarantees.
    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Bytes,
        options: PublishOptions,
    ) -> Result<()> {
        let conn = self.inner.connection()?;
        let bytes = {
            let mut core = self.inner.core.lock().unwrap();
            core.publish(
                exchange,
                routing_key,
                options.mandatory,
                options.immediate,
                properties,
                body,
            )?;
            core.data_to_send()
        };
        conn.write(bytes).await
    }

    /// Synchronously poll one message from a queue. `Ok(None)` means the
    /// queue was empty.
    pub async fn basic_get(&self, queue: &str, no_ack: bool) -> Result<Option<Message>> {
        self.inner
            .call(Method::BasicGet {
                queue: queue.to_string(),
                no_ack,
            })
            .await?;
        match self.inner.get_results.pop().await {
            Some(result) => Ok(result),
            None => Err(Error::ConnectionAborted),
        }
    }

    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.inner
            .call(Method::BasicAck {
                delivery_tag,
                multiple,
            })
            .await?;
        Ok(())
    }

    pub async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.inner
            .call(Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            })
            .await?;
        Ok(())
    }

    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner
            .call(Method::BasicReject {
                delivery_tag,
                requeue,
            })
            .await?;
        Ok(())
    }

    /// Redeliver all unacknowledged messages on this channel.
    pub async fn basic_recover(&self, requeue: bool) -> Result<()> {
        self.inner.call(Method::BasicRecover { requeue }).await?;
        Ok(())
    }

    /// Fire-and-forget variant of [`Channel::basic_recover`], kept for
    /// brokers that still expect the deprecated async form.
    pub async fn basic_recover_async(&self, requeue: bool) -> Result<()> {
        self.inner
            .call(Method::BasicRecoverAsync { requeue })
            .await?;
        Ok(())
    }

    /// Put this channel into publisher-confirm mode.
    pub async fn confirm_select(&self) -> Result<()> {
        self.inner
            .call(Method::ConfirmSelect { no_wait: false })
            .await?;
        Ok(())
    }

    /// Wait until every publish sent in confirm mode has been acked or
    /// nacked by the broker. Returns immediately when nothing is pending.
    pub async fn wait_for_confirmations(&self) -> Result<()> {
        if !self.inner.core.lock().unwrap().in_confirm_mode() {
            return Err(Error::ConfirmsNotEnabled);
        }
        loop {
            // Register before checking: an ack landing between the count
            // check and the await must still wake us.
            let notified = self.inner.confirms.notified();
            if self.inner.confirms.is_aborted() {
                return Err(Error::ConnectionAborted);
            }
            if self.inner.core.lock().unwrap().unconfirmed_count() == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    pub async fn tx_select(&self) -> Result<()> {
        self.inner.call(Method::TxSelect).await?;
        Ok(())
    }

    pub async fn tx_commit(&self) -> Result<()> {
        self.inner.call(Method::TxCommit).await?;
        Ok(())
    }

    pub async fn tx_rollback(&self) -> Result<()> {
        self.inner.call(Method::TxRollback).await?;
        Ok(())
    }

    /// Ask the broker to pause (`active = false`) or resume deliveries.
    /// Returns the flow state the broker acknowledged.
    pub async fn flow(&self, active: bool) -> Result<bool> {
        let reply = self.inner.call(Method::ChannelFlow { active }).await?;
        match reply {
            Some(Method::ChannelFlowOk { active }) => Ok(active),
            _ => Err(unexpected_reply("channel.flow")),
        }
    }

    /// Close the channel with a normal reply code.
    pub async fn close(&self) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "").await
    }

    /// Close the channel, reporting `reply_code`/`reply_text` to the
    /// broker. No-op if the channel is already closed.
    pub async fn close_with(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        let conn = self.inner.connection()?;
        let bytes = {
            let mut core = self.inner.core.lock().unwrap();
            if core.is_closed() {
                return Ok(());
            }
            core.close(reply_code, reply_text)?;
            core.data_to_send()
        };
        conn.write(bytes).await?;
        let result = self.inner.replies.recv().await;
        conn.remove_channel(self.id());
        self.inner.shutdown();
        result.map(|_| ())
    }
}

fn unexpected_reply(method: &'static str) -> Error {
    Error::Proto(amqwire_proto::ProtoError::UnexpectedFrame(method))
}

/// A stream of inbound messages, ended by channel or connection close.
pub struct Messages {
    rx: Option<mpsc::UnboundedReceiver<Message>>,
}

impl Stream for Messages {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}
