//! End-to-end tests against a scripted broker on an in-memory duplex
//! stream. Each test spawns the broker side as a task that plays its half
//! of the conversation and asserts on what the client sent.

use std::time::Duration;

use amqwire::{
    ConnectOptions, Connection, ConsumeOptions, DeliveryInfo, Error, ExchangeDeclareOptions,
    Properties, PublishOptions, QueueDeclareOptions,
};
use amqwire_proto::method::class;
use amqwire_proto::{
    decode_frame, ContentHeader, Frame, FramePayload, Method, PROTOCOL_HEADER,
};
use bytes::{Bytes, BytesMut};
use futures_util::{FutureExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const TEST_FRAME_MAX: u32 = 65_536;

fn options() -> ConnectOptions {
    ConnectOptions {
        connect_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(1),
        ..ConnectOptions::default()
    }
}

struct Broker {
    stream: DuplexStream,
    buf: BytesMut,
}

impl Broker {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn send_frame(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        frame.encode(&mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    async fn send_method(&mut self, channel: u16, method: Method) {
        self.send_frame(Frame::method(channel, method)).await;
    }

    /// Send a content header plus one body frame.
    async fn send_content(&mut self, channel: u16, body: &'static [u8]) {
        self.send_frame(Frame {
            channel_id: channel,
            payload: FramePayload::Header(ContentHeader {
                class_id: class::BASIC,
                body_size: body.len() as u64,
                properties: Properties::default(),
            }),
        })
        .await;
        if !body.is_empty() {
            self.send_frame(Frame {
                channel_id: channel,
                payload: FramePayload::Body(Bytes::from_static(body)),
            })
            .await;
        }
    }

    async fn read_frame(&mut self) -> Frame {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, TEST_FRAME_MAX as usize).unwrap() {
                return frame;
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "client hung up mid-script");
        }
    }

    async fn read_method(&mut self, channel: u16) -> Method {
        let frame = self.read_frame().await;
        assert_eq!(frame.channel_id, channel, "frame on wrong channel");
        match frame.payload {
            FramePayload::Method(method) => method,
            other => panic!("expected method frame, got {other:?}"),
        }
    }

    /// Read a content header and its body frames, returning the body.
    async fn read_content(&mut self, channel: u16) -> Vec<u8> {
        let frame = self.read_frame().await;
        assert_eq!(frame.channel_id, channel);
        let header = match frame.payload {
            FramePayload::Header(header) => header,
            other => panic!("expected content header, got {other:?}"),
        };
        let mut body = Vec::new();
        while (body.len() as u64) < header.body_size {
            match self.read_frame().await.payload {
                FramePayload::Body(chunk) => body.extend_from_slice(&chunk),
                other => panic!("expected body frame, got {other:?}"),
            }
        }
        body
    }

    /// Play the broker's half of the opening negotiation.
    async fn handshake(&mut self) {
        let mut preamble = [0u8; 8];
        self.stream.read_exact(&mut preamble).await.unwrap();
        assert_eq!(preamble, PROTOCOL_HEADER);

        self.send_method(
            0,
            Method::ConnectionStart {
                version_major: 0,
                version_minor: 9,
                mechanisms: "PLAIN".into(),
                locales: "en_US".into(),
            },
        )
        .await;
        match self.read_method(0).await {
            Method::ConnectionStartOk {
                mechanism,
                response,
                ..
            } => {
                assert_eq!(mechanism, "PLAIN");
                assert_eq!(response.as_ref(), b"\0guest\0guest");
            }
            other => panic!("expected start-ok, got {other:?}"),
        }

        self.send_method(
            0,
            Method::ConnectionTune {
                channel_max: 0,
                frame_max: TEST_FRAME_MAX,
                heartbeat: 0,
            },
        )
        .await;
        assert!(matches!(
            self.read_method(0).await,
            Method::ConnectionTuneOk {
                frame_max: TEST_FRAME_MAX,
                ..
            }
        ));
        assert!(matches!(
            self.read_method(0).await,
            Method::ConnectionOpen { .. }
        ));
        self.send_method(0, Method::ConnectionOpenOk).await;
    }

    async fn accept_channel(&mut self, channel: u16) {
        assert!(matches!(self.read_method(channel).await, Method::ChannelOpen));
        self.send_method(channel, Method::ChannelOpenOk).await;
    }

    /// Expect the client's channel close, returning the reply code it sent.
    async fn finish_channel(&mut self, channel: u16) -> u16 {
        let reply_code = match self.read_method(channel).await {
            Method::ChannelClose { reply_code, .. } => reply_code,
            other => panic!("expected channel.close, got {other:?}"),
        };
        self.send_method(channel, Method::ChannelCloseOk).await;
        reply_code
    }

    async fn finish_connection(&mut self) {
        assert!(matches!(
            self.read_method(0).await,
            Method::ConnectionClose { .. }
        ));
        self.send_method(0, Method::ConnectionCloseOk).await;
    }
}

fn pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(256 * 1024)
}

#[test]
fn connect_future_is_send() {
    fn assert_send<F: Send>(_: F) {}
    let (client_end, _server_end) = pair();
    // Callers must be able to spawn the connect onto a runtime.
    assert_send(Connection::open_with_stream(client_end, options()));
}

#[tokio::test]
async fn declare_publish_consume_ack() {
    let (client_end, server_end) = pair();
    let broker = tokio::spawn(async move {
        let mut b = Broker::new(server_end);
        b.handshake().await;
        b.accept_channel(1).await;

        // A stray heartbeat must not disturb anything.
        b.send_frame(Frame {
            channel_id: 0,
            payload: FramePayload::Heartbeat,
        })
        .await;

        match b.read_method(1).await {
            Method::QueueDeclare { queue, durable, .. } => {
                assert_eq!(queue, "work");
                assert!(durable);
            }
            other => panic!("expected queue.declare, got {other:?}"),
        }
        b.send_method(
            1,
            Method::QueueDeclareOk {
                queue: "work".into(),
                message_count: 3,
                consumer_count: 0,
            },
        )
        .await;

        assert!(matches!(
            b.read_method(1).await,
            Method::BasicConsume { .. }
        ));
        b.send_method(
            1,
            Method::BasicConsumeOk {
                consumer_tag: "ctag-1".into(),
            },
        )
        .await;

        match b.read_method(1).await {
            Method::BasicPublish { routing_key, .. } => assert_eq!(routing_key, "work"),
            other => panic!("expected basic.publish, got {other:?}"),
        }
        assert_eq!(b.read_content(1).await, b"ping");

        // Echo the message back as a delivery.
        b.send_method(
            1,
            Method::BasicDeliver {
                consumer_tag: "ctag-1".into(),
                delivery_tag: 1,
                redelivered: false,
                exchange: "".into(),
                routing_key: "work".into(),
            },
        )
        .await;
        b.send_content(1, b"ping").await;

        assert!(matches!(
            b.read_method(1).await,
            Method::BasicAck {
                delivery_tag: 1,
                multiple: false,
            }
        ));

        assert_eq!(b.finish_channel(1).await, 200);
        b.finish_connection().await;
    });

    let conn = Connection::open_with_stream(client_end, options())
        .await
        .unwrap();
    let channel = conn.channel().await.unwrap();
    let mut deliveries = channel.deliveries();

    let info = channel
        .queue_declare(
            "work",
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(info.queue, "work");
    assert_eq!(info.message_count, 3);

    let tag = channel
        .basic_consume("work", ConsumeOptions::default())
        .await
        .unwrap();
    assert_eq!(tag, "ctag-1");

    channel
        .basic_publish(
            "",
            "work",
            Properties::default(),
            Bytes::from_static(b"ping"),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    let message = deliveries.next().await.unwrap();
    assert_eq!(message.body.as_ref(), b"ping");
    let delivery_tag = match &message.delivery_info {
        DeliveryInfo::Delivered { delivery_tag, .. } => *delivery_tag,
        other => panic!("expected delivery, got {other:?}"),
    };
    channel.basic_ack(delivery_tag, false).await.unwrap();

    channel.close().await.unwrap();
    conn.close().await.unwrap();
    assert!(conn.is_closed());
    broker.await.unwrap();

    // The delivery stream ends once the channel is gone.
    assert!(deliveries.next().await.is_none());
}

#[tokio::test]
async fn publisher_confirms_settle() {
    let (client_end, server_end) = pair();
    let broker = tokio::spawn(async move {
        let mut b = Broker::new(server_end);
        b.handshake().await;
        b.accept_channel(1).await;

        assert!(matches!(
            b.read_method(1).await,
            Method::ConfirmSelect { no_wait: false }
        ));
        b.send_method(1, Method::ConfirmSelectOk).await;

        for _ in 0..3 {
            assert!(matches!(
                b.read_method(1).await,
                Method::BasicPublish { .. }
            ));
            b.read_content(1).await;
        }
        // Settle the first two, then answer the flow barrier the client
        // uses to observe the partial state, then settle the last one.
        b.send_method(
            1,
            Method::BasicAck {
                delivery_tag: 2,
                multiple: true,
            },
        )
        .await;
        assert!(matches!(
            b.read_method(1).await,
            Method::ChannelFlow { active: true }
        ));
        b.send_method(1, Method::ChannelFlowOk { active: true }).await;
        // The final ack is held back until the client signals (via qos)
        // that it has observed the partial state.
        assert!(matches!(b.read_method(1).await, Method::BasicQos { .. }));
        b.send_method(
            1,
            Method::BasicAck {
                delivery_tag: 3,
                multiple: false,
            },
        )
        .await;
        b.send_method(1, Method::BasicQosOk).await;

        b.finish_channel(1).await;
        b.finish_connection().await;
    });

    let conn = Connection::open_with_stream(client_end, options())
        .await
        .unwrap();
    let channel = conn.channel().await.unwrap();

    // Waiting before confirm mode is an error.
    assert!(matches!(
        channel.wait_for_confirmations().await,
        Err(Error::ConfirmsNotEnabled)
    ));

    channel.confirm_select().await.unwrap();
    for _ in 0..3 {
        channel
            .basic_publish(
                "",
                "work",
                Properties::default(),
                Bytes::from_static(b"m"),
                PublishOptions::default(),
            )
            .await
            .unwrap();
    }

    // Round-trip a flow method to guarantee the partial ack has been
    // processed, then verify the wait does not resolve early. The broker
    // withholds the final ack until the qos round-trip.
    assert!(channel.flow(true).await.unwrap());
    assert!(channel.wait_for_confirmations().now_or_never().is_none());
    channel.basic_qos(0, 0, false).await.unwrap();

    channel.wait_for_confirmations().await.unwrap();
    // Nothing pending: returns immediately.
    channel.wait_for_confirmations().await.unwrap();

    channel.close().await.unwrap();
    conn.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn declare_publish_get_ack_roundtrip() {
    let (client_end, server_end) = pair();
    let broker = tokio::spawn(async move {
        let mut b = Broker::new(server_end);
        b.handshake().await;
        b.accept_channel(1).await;

        assert!(matches!(
            b.read_method(1).await,
            Method::QueueDeclare { .. }
        ));
        b.send_method(
            1,
            Method::QueueDeclareOk {
                queue: "q1".into(),
                message_count: 0,
                consumer_count: 0,
            },
        )
        .await;

        match b.read_method(1).await {
            Method::BasicPublish {
                exchange,
                routing_key,
                ..
            } => {
                assert_eq!(exchange, "");
                assert_eq!(routing_key, "q1");
            }
            other => panic!("expected basic.publish, got {other:?}"),
        }
        assert_eq!(b.read_content(1).await, b"hello");

        assert!(matches!(b.read_method(1).await, Method::BasicGet { .. }));
        b.send_method(
            1,
            Method::BasicGetOk {
                delivery_tag: 7,
                redelivered: false,
                exchange: "".into(),
                routing_key: "q1".into(),
                message_count: 0,
            },
        )
        .await;
        b.send_content(1, b"hello").await;

        assert!(matches!(
            b.read_method(1).await,
            Method::BasicAck {
                delivery_tag: 7,
                multiple: false,
            }
        ));

        assert!(matches!(b.read_method(1).await, Method::BasicGet { .. }));
        b.send_method(1, Method::BasicGetEmpty).await;

        b.finish_channel(1).await;
        b.finish_connection().await;
    });

    let conn = Connection::open_with_stream(client_end, options())
        .await
        .unwrap();
    let channel = conn.channel().await.unwrap();

    channel
        .queue_declare("q1", QueueDeclareOptions::default())
        .await
        .unwrap();
    channel
        .basic_publish(
            "",
            "q1",
            Properties::default(),
            Bytes::from_static(b"hello"),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    let message = channel.basic_get("q1", false).await.unwrap().unwrap();
    assert_eq!(message.body.as_ref(), b"hello");
    assert!(matches!(
        message.delivery_info,
        DeliveryInfo::GetOk { delivery_tag: 7, .. }
    ));
    channel.basic_ack(7, false).await.unwrap();

    // An empty queue yields the sentinel exactly once.
    assert!(channel.basic_get("q1", false).await.unwrap().is_none());

    channel.close().await.unwrap();
    conn.close().await.unwrap();
    assert!(conn.is_closed());
    // Closing an already-closed connection is a no-op.
    conn.close().await.unwrap();
    assert!(conn.is_closed());
    broker.await.unwrap();
}

#[tokio::test]
async fn returned_messages_reach_their_stream() {
    let (client_end, server_end) = pair();
    let broker = tokio::spawn(async move {
        let mut b = Broker::new(server_end);
        b.handshake().await;
        b.accept_channel(1).await;

        match b.read_method(1).await {
            Method::BasicPublish { mandatory, .. } => assert!(mandatory),
            other => panic!("expected basic.publish, got {other:?}"),
        }
        b.read_content(1).await;

        b.send_method(
            1,
            Method::BasicReturn {
                reply_code: 312,
                reply_text: "NO_ROUTE".into(),
                exchange: "".into(),
                routing_key: "nowhere".into(),
            },
        )
        .await;
        b.send_content(1, b"lost").await;

        b.finish_channel(1).await;
        b.finish_connection().await;
    });

    let conn = Connection::open_with_stream(client_end, options())
        .await
        .unwrap();
    let channel = conn.channel().await.unwrap();
    let mut returns = channel.returns();

    channel
        .basic_publish(
            "",
            "nowhere",
            Properties::default(),
            Bytes::from_static(b"lost"),
            PublishOptions {
                mandatory: true,
                ..PublishOptions::default()
            },
        )
        .await
        .unwrap();

    let returned = returns.next().await.unwrap();
    assert_eq!(returned.body.as_ref(), b"lost");
    match &returned.delivery_info {
        DeliveryInfo::Returned {
            reply_code,
            reply_text,
            ..
        } => {
            assert_eq!(*reply_code, 312);
            assert_eq!(reply_text, "NO_ROUTE");
        }
        other => panic!("expected returned message, got {other:?}"),
    }

    channel.close().await.unwrap();
    conn.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn broker_channel_close_surfaces_as_error() {
    let (client_end, server_end) = pair();
    let broker = tokio::spawn(async move {
        let mut b = Broker::new(server_end);
        b.handshake().await;
        b.accept_channel(1).await;

        assert!(matches!(
            b.read_method(1).await,
            Method::QueueDeclare { passive: true, .. }
        ));
        b.send_method(
            1,
            Method::ChannelClose {
                reply_code: 404,
                reply_text: "NOT_FOUND".into(),
                class_id: class::QUEUE,
                method_id: 10,
            },
        )
        .await;
        assert!(matches!(
            b.read_method(1).await,
            Method::ChannelCloseOk
        ));

        // The connection survives: a fresh channel still works.
        b.accept_channel(2).await;
        b.finish_channel(2).await;
        b.finish_connection().await;
    });

    let conn = Connection::open_with_stream(client_end, options())
        .await
        .unwrap();
    let channel = conn.channel().await.unwrap();

    let err = channel
        .queue_declare(
            "missing",
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        Error::Protocol(err) => {
            assert_eq!(err.code, 404);
            assert_eq!(err.text, "NOT_FOUND");
        }
        other => panic!("expected broker error, got {other}"),
    }
    assert!(channel.is_closed());

    // Further use of the dead channel fails locally.
    assert!(channel
        .exchange_declare("amq.direct", ExchangeDeclareOptions::default())
        .await
        .is_err());
    // Closing it again is a no-op.
    channel.close().await.unwrap();

    let fresh = conn.channel().await.unwrap();
    fresh.close().await.unwrap();
    conn.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn scoped_channel_reports_broker_error_code() {
    let (client_end, server_end) = pair();
    let broker = tokio::spawn(async move {
        let mut b = Broker::new(server_end);
        b.handshake().await;

        // Success path: the scoped close carries the plain closure code.
        b.accept_channel(1).await;
        assert!(matches!(b.read_method(1).await, Method::QueueBind { .. }));
        b.send_method(1, Method::QueueBindOk).await;
        assert_eq!(b.finish_channel(1).await, 0);

        // Error path: the broker closes the channel; no client close
        // follows, only the acknowledgment.
        b.accept_channel(2).await;
        assert!(matches!(b.read_method(2).await, Method::QueuePurge { .. }));
        b.send_method(
            2,
            Method::ChannelClose {
                reply_code: 406,
                reply_text: "PRECONDITION_FAILED".into(),
                class_id: class::QUEUE,
                method_id: 30,
            },
        )
        .await;
        assert!(matches!(b.read_method(2).await, Method::ChannelCloseOk));

        b.finish_connection().await;
    });

    let conn = Connection::open_with_stream(client_end, options())
        .await
        .unwrap();

    conn.with_channel(|channel| async move {
        channel.queue_bind("work", "amq.direct", "work").await
    })
    .await
    .unwrap();

    let err = conn
        .with_channel(|channel| async move { channel.queue_purge("work").await })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(err) if err.code == 406));

    conn.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn eof_releases_pending_waiters() {
    let (client_end, server_end) = pair();
    let broker = tokio::spawn(async move {
        let mut b = Broker::new(server_end);
        b.handshake().await;
        b.accept_channel(1).await;
        assert!(matches!(b.read_method(1).await, Method::BasicGet { .. }));
        // Hang up instead of answering.
    });

    let conn = Connection::open_with_stream(client_end, options())
        .await
        .unwrap();
    let channel = conn.channel().await.unwrap();

    let err = channel.basic_get("work", false).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionAborted));

    // Closing a dead connection succeeds without a handshake.
    conn.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn frame_for_unknown_channel_fails_the_connection() {
    let (client_end, server_end) = pair();
    let broker = tokio::spawn(async move {
        let mut b = Broker::new(server_end);
        b.handshake().await;
        b.accept_channel(1).await;
        // Channel 5 was never opened.
        b.send_method(
            5,
            Method::BasicDeliver {
                consumer_tag: "ghost".into(),
                delivery_tag: 1,
                redelivered: false,
                exchange: "".into(),
                routing_key: "work".into(),
            },
        )
        .await;
        b
    });

    let conn = Connection::open_with_stream(client_end, options())
        .await
        .unwrap();
    let channel = conn.channel().await.unwrap();
    let mut deliveries = channel.deliveries();

    // The reader fails the connection; the stream ending proves it.
    assert!(deliveries.next().await.is_none());
    assert!(matches!(
        channel.basic_get("work", false).await,
        Err(Error::ConnectionAborted)
    ));

    conn.close().await.unwrap();
    drop(broker.await.unwrap());
}
