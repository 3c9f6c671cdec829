//! Connection handling: socket setup, the reader task, frame routing and
//! the close handshake.
//!
//! One task owns the read half of the socket and runs [`io_loop`]; every
//! caller-facing handle shares the write half behind an async mutex so a
//! method frame and its content frames reach the wire contiguously. Frames
//! are routed by channel id: channel 0 to the connection state machine,
//! everything else to the owning [`ChannelInner`].

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use amqwire_proto::{decode_frame, ConnectionCore, Frame, REPLY_SUCCESS};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::channel::{Channel, ChannelInner};
use crate::config::ConnectOptions;
use crate::error::{Error, Result};
use crate::sync::ReplyCorrelator;

/// Readahead multiplier for the socket buffer: keep up to this many
/// maximum-size frames in flight per read.
const READAHEAD_FRAMES: usize = 10;

pub(crate) struct ConnectionInner {
    core: Mutex<ConnectionCore>,
    writer: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    replies: ReplyCorrelator,
    channels: Mutex<HashMap<u16, Arc<ChannelInner>>>,
    read_buffer_size: Option<usize>,
    eof: AtomicBool,
}

impl ConnectionInner {
    /// Write and flush one batch of outbound bytes. Holding the writer
    /// lock across the flush keeps multi-frame batches contiguous on the
    /// wire.
    pub(crate) async fn write(&self, bytes: Bytes) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.eof.load(Ordering::SeqCst) {
            return Err(Error::ConnectionAborted);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionAborted)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    pub(crate) fn remove_channel(&self, id: u16) {
        self.channels.lock().unwrap().remove(&id);
    }

    /// Mark the connection dead and release every waiter on every channel.
    /// Idempotent; runs when the reader task stops for any reason.
    pub(crate) fn shutdown(&self) {
        self.eof.store(true, Ordering::SeqCst);
        self.replies.abort();
        let channels: Vec<Arc<ChannelInner>> = {
            let mut map = self.channels.lock().unwrap();
            map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.shutdown();
        }
    }

    fn is_closed(&self) -> bool {
        self.core.lock().unwrap().is_closed()
    }

    /// Route one inbound frame. Errors here are fatal to the connection.
    async fn dispatch(&self, frame: Frame) -> Result<()> {
        if frame.channel_id == 0 {
            let (outcome, bytes) = {
                let mut core = self.core.lock().unwrap();
                let outcome = core.handle_frame(frame)?;
                (outcome, core.data_to_send())
            };
            // Deliver the reply before the auto-reply write: a broker
            // close must reach the waiter even if the socket is half dead.
            if let Some(reply) = outcome.reply {
                self.replies.deliver(reply);
            }
            self.write(bytes).await?;
            Ok(())
        } else {
            let id = frame.channel_id;
            let channel = self
                .channels
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or(Error::UnknownChannel(id))?;
            let bytes = channel.handle_frame(frame)?;
            self.write(bytes).await?;
            if channel.is_closed() {
                self.remove_channel(id);
            }
            Ok(())
        }
    }
}

/// The reader task: pull bytes off the socket, cut them into frames and
/// dispatch each one. Exits on EOF, read error, protocol violation or a
/// completed close handshake, then releases every waiter.
async fn io_loop<R>(inner: Arc<ConnectionInner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::new();
    'read: loop {
        let frame_max = inner.core.lock().unwrap().frame_max() as usize;
        let readahead = inner
            .read_buffer_size
            .unwrap_or(frame_max * READAHEAD_FRAMES)
            .max(frame_max);
        buf.reserve(readahead);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::debug!("socket closed by peer");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(error = %err, "socket read failed");
                break;
            }
        }
        loop {
            match decode_frame(&mut buf, frame_max) {
                Ok(Some(frame)) => {
                    if let Err(err) = inner.dispatch(frame).await {
                        tracing::warn!(error = %err, "failing connection");
                        break 'read;
                    }
                    if inner.is_closed() {
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "protocol violation from peer");
                    break 'read;
                }
            }
        }
    }
    inner.shutdown();
}

/// An open connection to the broker.
///
/// Cloning yields another handle to the same connection. Dropping the last
/// handle without calling [`Connection::close`] abandons the socket; the
/// reader task then exits on the resulting EOF.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
    reader: Arc<Mutex<Option<JoinHandle<()>>>>,
    options: ConnectOptions,
}

impl Connection {
    /// Connect over TCP and complete the opening negotiation.
    pub async fn open(options: ConnectOptions) -> Result<Self> {
        let addr = format!("{}:{}", options.host, options.port);
        let stream = match options.local_addr {
            Some(local) => {
                let socket = match local {
                    SocketAddr::V4(_) => TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => TcpSocket::new_v6()?,
                };
                socket.bind(local)?;
                let remote = lookup_host(&addr).await?.next().ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "hostname resolved to no addresses",
                    ))
                })?;
                timeout(options.connect_timeout, socket.connect(remote))
                    .await
                    .map_err(|_| Error::ConnectTimeout(options.connect_timeout))??
            }
            None => timeout(options.connect_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| Error::ConnectTimeout(options.connect_timeout))??,
        };
        stream.set_nodelay(true)?;
        Self::open_with_stream(stream, options).await
    }

    /// Complete the opening negotiation over an already-established
    /// stream. This is the seam for TLS wrappers and test harnesses.
    pub async fn open_with_stream<S>(stream: S, options: ConnectOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut core =
            ConnectionCore::new(&options.virtual_host, &options.username, &options.password);
        core.initiate()?;
        let preamble = core.data_to_send();

        let inner = Arc::new(ConnectionInner {
            core: Mutex::new(core),
            writer: tokio::sync::Mutex::new(Some(
                Box::new(write_half) as Box<dyn AsyncWrite + Send + Unpin>
            )),
            replies: ReplyCorrelator::new(),
            channels: Mutex::new(HashMap::new()),
            read_buffer_size: options.read_buffer_size,
            eof: AtomicBool::new(false),
        });
        let reader = tokio::spawn(io_loop(Arc::clone(&inner), read_half));
        let connection = Self {
            inner: Arc::clone(&inner),
            reader: Arc::new(Mutex::new(Some(reader))),
            options: options.clone(),
        };

        inner.write(preamble).await?;
        // The reader task answers start and tune by itself; the first
        // queued reply is open-ok or the broker's refusal.
        match timeout(options.connect_timeout, inner.replies.recv()).await {
            Ok(Ok(_open_ok)) => {
                tracing::debug!(virtual_host = %options.virtual_host, "connection open");
                Ok(connection)
            }
            Ok(Err(err)) => {
                connection.abort().await;
                Err(err)
            }
            Err(_) => {
                connection.abort().await;
                Err(Error::ConnectTimeout(options.connect_timeout))
            }
        }
    }

    /// True once the close handshake finished or the peer went away.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed() || self.inner.eof.load(Ordering::SeqCst)
    }

    /// Open a new channel on this connection.
    pub async fn channel(&self) -> Result<Channel> {
        let (id, frame_max) = {
            let mut core = self.inner.core.lock().unwrap();
            if !core.is_open() {
                return Err(Error::ConnectionAborted);
            }
            (core.allocate_channel_id()?, core.frame_max())
        };
        let inner = Arc::new(ChannelInner::new(id, frame_max, Arc::downgrade(&self.inner)));
        self.inner
            .channels
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&inner));
        match inner.open().await {
            Ok(()) => Ok(Channel::new(inner)),
            Err(err) => {
                self.inner.remove_channel(id);
                Err(err)
            }
        }
    }

    /// Open a channel, run `f` on it, then close the channel whatever the
    /// outcome. A broker error from `f` is reported back in the close and
    /// takes precedence over any close failure.
    pub async fn with_channel<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let channel = self.channel().await?;
        let result = f(channel.clone()).await;
        let (code, text) = close_code_for(&result);
        let close_result = channel.close_with(code, &text).await;
        match result {
            Ok(value) => close_result.map(|_| value),
            Err(err) => Err(err),
        }
    }

    /// Close the connection with a normal reply code.
    pub async fn close(&self) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "").await
    }

    /// Run the close handshake (skipped when the socket is already dead),
    /// wait for the reader task to stop, then release the socket. The
    /// reader wait is bounded by `shutdown_timeout`; a stuck reader is
    /// aborted rather than hanging the close.
    pub async fn close_with(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        let handshake = {
            let mut core = self.inner.core.lock().unwrap();
            if core.is_closed() || self.inner.eof.load(Ordering::SeqCst) {
                None
            } else {
                core.close(reply_code, reply_text)?;
                Some(core.data_to_send())
            }
        };
        if let Some(bytes) = handshake {
            match self.inner.write(bytes).await {
                Ok(()) => match self.inner.replies.recv().await {
                    // A broker close crossing ours still means closed.
                    Ok(_) | Err(Error::ConnectionAborted) | Err(Error::Protocol(_)) => {}
                    Err(err) => tracing::debug!(error = %err, "close handshake failed"),
                },
                Err(_) => {}
            }
        }
        self.join_reader().await;
        self.inner.shutdown();
        self.inner.writer.lock().await.take();
        Ok(())
    }

    async fn join_reader(&self) {
        let handle = self.reader.lock().unwrap().take();
        if let Some(mut handle) = handle {
            match timeout(self.options.shutdown_timeout, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("reader task did not stop in time, aborting it");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
    }

    /// Tear down without a handshake: stop the reader, release waiters,
    /// drop the socket.
    async fn abort(&self) {
        // Take the handle out before awaiting so the lock guard is not
        // held across a suspension point.
        let handle = self.reader.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.inner.shutdown();
        self.inner.writer.lock().await.take();
    }
}

/// Open a connection, run `f` on it, then close the connection whatever
/// the outcome. The closure's error wins over any close failure.
pub async fn with_connection<F, Fut, T>(options: ConnectOptions, f: F) -> Result<T>
where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let connection = Connection::open(options).await?;
    let result = f(connection.clone()).await;
    let (code, text) = close_code_for(&result);
    let close_result = connection.close_with(code, &text).await;
    match result {
        Ok(value) => close_result.map(|_| value),
        Err(err) => Err(err),
    }
}

/// Reply code and text to report when closing after `result`: a broker
/// error is echoed back, anything else is a plain `(0, "")` closure.
fn close_code_for<T>(result: &Result<T>) -> (u16, String) {
    match result {
        Err(Error::Protocol(err)) => (err.code, err.text.clone()),
        _ => (0, String::new()),
    }
}
