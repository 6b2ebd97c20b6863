//! Transport engine: one TCP connection driven by a readiness loop.
//!
//! [`TransportEngine::start`] parks nothing on the caller: it spawns a
//! dedicated `bj-net-io` thread running a current-thread tokio runtime and
//! returns. The runtime's reactor is the readiness primitive; each loop
//! iteration ticks the [`Protocol`], then waits (bounded by the tick
//! interval) for the socket to become readable, for queued frames to become
//! writable, or for new outbound work from the caller.
//!
//! The protocol is moved into the loop on start and handed back when the
//! loop is joined, so everything it owns is touched by exactly one thread.
//! Callers only reach the loop through the ingress queue and the shutdown
//! signal.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};

use crate::framing::{self, FrameConfig, LineBuffer};
use crate::platform::{self, SocketConfig};

/// Configuration for [`TransportEngine`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on one readiness wait; the protocol is ticked at least
    /// this often. Default: 100 ms.
    pub tick_interval: Duration,
    /// Size of the per-read scratch buffer. Default: 512 bytes.
    pub read_buffer_size: usize,
    /// Reassembly limits.
    pub frame: FrameConfig,
    /// Options applied to the connected socket.
    pub socket: SocketConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            read_buffer_size: 512,
            frame: FrameConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

/// Why a connection's loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    /// The caller asked for the stop (or a reconnect).
    Requested(String),
    /// The protocol asked for the stop through [`Link::stop`].
    Protocol(String),
    /// The peer closed the connection (zero-length read).
    PeerClosed,
    /// Connect, read or write failed.
    Fault(String),
}

impl StopCause {
    /// Human-readable reason.
    pub fn reason(&self) -> &str {
        match self {
            Self::Requested(reason) | Self::Protocol(reason) | Self::Fault(reason) => reason,
            Self::PeerClosed => "peer closed",
        }
    }

    /// Whether the connection was lost rather than deliberately closed.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::PeerClosed | Self::Fault(_))
    }
}

/// Errors returned synchronously by [`TransportEngine`] operations.
///
/// Connection failures are not reported here; they end the loop and reach
/// the protocol as a [`StopCause`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Port 0 is not a connectable port.
    #[error("port must be in 1..=65535")]
    InvalidPort,
    /// No host was given.
    #[error("host is empty")]
    EmptyHost,
    /// A loop is already running for this engine.
    #[error("transport loop is already running")]
    AlreadyRunning,
    /// No loop is running, so nothing can be queued.
    #[error("transport is not running")]
    NotRunning,
    /// `reconnect` was called before any `start`.
    #[error("transport was never started")]
    NoEndpoint,
    /// The protocol did not come back from the loop thread.
    #[error("protocol state was lost with the transport thread")]
    ProtocolLost,
    /// The loop thread could not be spawned.
    #[error("failed to spawn transport thread: {0}")]
    Spawn(#[source] io::Error),
}

/// The line-level protocol driven by the transport loop.
///
/// All methods run on the loop thread, strictly sequentially.
pub trait Protocol: Send + 'static {
    /// Caller-side work item delivered through [`TransportEngine::submit`].
    type Request: Send + 'static;

    /// A fresh connection attempt is about to begin.
    fn on_connecting(&mut self, now: Instant);

    /// One complete inbound line, delimiter stripped, in arrival order.
    fn on_line(&mut self, line: &str, now: Instant, link: &mut Link);

    /// A request submitted by the caller, in submission order.
    fn on_request(&mut self, request: Self::Request, now: Instant, link: &mut Link);

    /// Called once per loop iteration regardless of I/O activity.
    fn on_tick(&mut self, now: Instant, link: &mut Link);

    /// The loop has ended; the connection is already closed.
    fn on_stopped(&mut self, cause: &StopCause);
}

/// The protocol's view of the live connection during a callback.
///
/// Frames appended with [`send`](Self::send) join the outbound queue behind
/// everything queued before them.
#[derive(Debug, Default)]
pub struct Link {
    outbound: VecDeque<Vec<u8>>,
    stop: Option<String>,
}

impl Link {
    /// Queue a frame, appending the delimiter if it is missing.
    pub fn send(&mut self, frame: impl Into<String>) {
        self.outbound
            .push_back(framing::ensure_delimited(frame).into_bytes());
    }

    /// Ask the loop to close the connection after this callback.
    /// The first reason wins.
    pub fn stop(&mut self, reason: impl Into<String>) {
        if self.stop.is_none() {
            self.stop = Some(reason.into());
        }
    }

    /// Number of frames waiting to be written.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// The pending stop reason, if any.
    pub fn stop_requested(&self) -> Option<&str> {
        self.stop.as_deref()
    }

    fn push_raw(&mut self, frame: Vec<u8>) {
        self.outbound.push_back(frame);
    }

    fn take_stop(&mut self) -> Option<String> {
        self.stop.take()
    }

    /// Drain queued frames as text, oldest first.
    #[cfg(test)]
    pub(crate) fn drain_sent(&mut self) -> Vec<String> {
        self.outbound
            .drain(..)
            .map(|frame| String::from_utf8_lossy(&frame).into_owned())
            .collect()
    }
}

enum Ingress<R> {
    Frame(Vec<u8>),
    Request(R),
}

struct Worker<P: Protocol> {
    thread: JoinHandle<P>,
    ingress: mpsc::UnboundedSender<Ingress<P::Request>>,
    shutdown: watch::Sender<Option<String>>,
}

struct LoopContext<R> {
    host: String,
    port: u16,
    config: TransportConfig,
    ingress: mpsc::UnboundedReceiver<Ingress<R>>,
    shutdown: watch::Receiver<Option<String>>,
    running: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the connection, its reassembly buffer and its outbound queue.
pub struct TransportEngine<P: Protocol> {
    config: TransportConfig,
    endpoint: Mutex<Option<(String, u16)>>,
    /// The protocol while no loop is running.
    protocol: Mutex<Option<P>>,
    worker: Mutex<Option<Worker<P>>>,
    /// Held for the whole of `start`, `stop` and `reconnect`.
    lifecycle: Mutex<()>,
    running: Arc<AtomicBool>,
}

impl<P: Protocol> TransportEngine<P> {
    /// Create an idle engine around `protocol`.
    pub fn new(config: TransportConfig, protocol: P) -> Self {
        Self {
            config,
            endpoint: Mutex::new(None),
            protocol: Mutex::new(Some(protocol)),
            worker: Mutex::new(None),
            lifecycle: Mutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Begin connecting to `host:port` on a background thread.
    ///
    /// Returns as soon as the thread is running; an unreachable host or a
    /// refused port ends the loop with [`StopCause::Fault`] later.
    pub fn start(&self, host: &str, port: u16) -> Result<(), TransportError> {
        let _lifecycle = lock(&self.lifecycle);
        self.start_locked(host, port)
    }

    fn start_locked(&self, host: &str, port: u16) -> Result<(), TransportError> {
        if host.trim().is_empty() {
            return Err(TransportError::EmptyHost);
        }
        if port == 0 {
            return Err(TransportError::InvalidPort);
        }

        let mut worker = lock(&self.worker);
        if let Some(current) = worker.as_ref()
            && !current.thread.is_finished()
        {
            return Err(TransportError::AlreadyRunning);
        }
        if let Some(finished) = worker.take() {
            self.park(finished);
        }

        let mut protocol = lock(&self.protocol)
            .take()
            .ok_or(TransportError::ProtocolLost)?;
        *lock(&self.endpoint) = Some((host.to_string(), port));

        protocol.on_connecting(Instant::now());

        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let ctx = LoopContext {
            host: host.to_string(),
            port,
            config: self.config.clone(),
            ingress: ingress_rx,
            shutdown: shutdown_rx,
            running: Arc::clone(&self.running),
        };

        self.running.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("bj-net-io".into())
            .spawn(move || run_worker(protocol, ctx));

        match spawned {
            Ok(thread) => {
                *worker = Some(Worker {
                    thread,
                    ingress: ingress_tx,
                    shutdown: shutdown_tx,
                });
                tracing::info!("Transport started for {host}:{port}");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                tracing::error!("Failed to spawn transport thread: {e}");
                Err(TransportError::Spawn(e))
            }
        }
    }

    /// [`start`](Self::start) reported as a success flag plus diagnostic text.
    pub fn start_report(&self, host: &str, port: u16) -> (bool, String) {
        match self.start(host, port) {
            Ok(()) => (true, "Network thread started.".to_string()),
            Err(e) => (false, format!("Socket creation failed: {e}")),
        }
    }

    /// Queue a raw message for transmission. The delimiter is appended when
    /// missing. Never blocks on the socket.
    pub fn send(&self, message: impl Into<String>) -> Result<(), TransportError> {
        let frame = framing::ensure_delimited(message).into_bytes();
        self.push(Ingress::Frame(frame))
    }

    /// Hand a request to the protocol on the loop thread.
    pub fn submit(&self, request: P::Request) -> Result<(), TransportError> {
        self.push(Ingress::Request(request))
    }

    fn push(&self, item: Ingress<P::Request>) -> Result<(), TransportError> {
        let worker = lock(&self.worker);
        match worker.as_ref() {
            Some(current) if self.running.load(Ordering::SeqCst) => current
                .ingress
                .send(item)
                .map_err(|_| TransportError::NotRunning),
            _ => Err(TransportError::NotRunning),
        }
    }

    /// Stop the loop, close the connection and discard queued frames.
    ///
    /// Waits for the loop to finish its current iteration. Safe to call any
    /// number of times.
    pub fn stop(&self, reason: &str) {
        let _lifecycle = lock(&self.lifecycle);
        self.stop_locked(reason);
    }

    fn stop_locked(&self, reason: &str) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        let _ = worker.shutdown.send(Some(reason.to_string()));
        self.park(worker);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Tear down the current connection and start a fresh one to the same
    /// endpoint with empty buffers.
    pub fn reconnect(&self) -> Result<(), TransportError> {
        let _lifecycle = lock(&self.lifecycle);
        let (host, port) = lock(&self.endpoint)
            .clone()
            .ok_or(TransportError::NoEndpoint)?;
        tracing::info!("Reconnecting to {host}:{port}");
        self.stop_locked("reconnect");
        self.start_locked(&host, port)
    }

    /// Whether a loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The endpoint of the last `start`.
    pub fn endpoint(&self) -> Option<(String, u16)> {
        lock(&self.endpoint).clone()
    }

    /// Inspect the protocol while no loop holds it.
    pub fn with_protocol<R>(&self, f: impl FnOnce(&P) -> R) -> Option<R> {
        lock(&self.protocol).as_ref().map(f)
    }

    fn park(&self, worker: Worker<P>) {
        drop(worker.ingress);
        match worker.thread.join() {
            Ok(protocol) => *lock(&self.protocol) = Some(protocol),
            Err(_) => tracing::error!("Transport thread panicked; protocol state lost"),
        }
    }
}

impl<P: Protocol> Drop for TransportEngine<P> {
    fn drop(&mut self) {
        self.stop("transport dropped");
    }
}

fn run_worker<P: Protocol>(mut protocol: P, ctx: LoopContext<P::Request>) -> P {
    let running = Arc::clone(&ctx.running);
    let cause = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(readiness_loop(&mut protocol, ctx)),
        Err(e) => StopCause::Fault(format!("failed to build I/O runtime: {e}")),
    };
    running.store(false, Ordering::SeqCst);

    if cause.is_fault() {
        tracing::warn!("Connection closed: {}", cause.reason());
    } else {
        tracing::info!("Connection closed: {}", cause.reason());
    }
    protocol.on_stopped(&cause);
    protocol
}

fn shutdown_requested(shutdown: &watch::Receiver<Option<String>>) -> Option<StopCause> {
    shutdown
        .borrow()
        .as_ref()
        .map(|reason| StopCause::Requested(reason.clone()))
}

fn accept<P: Protocol>(protocol: &mut P, item: Ingress<P::Request>, link: &mut Link) {
    match item {
        Ingress::Frame(frame) => link.push_raw(frame),
        Ingress::Request(request) => protocol.on_request(request, Instant::now(), link),
    }
}

/// Write queued frames in order until the socket would block.
/// A partial write leaves the unwritten tail at the front of the queue.
fn flush_outbound(writer: &OwnedWriteHalf, link: &mut Link) -> io::Result<()> {
    while let Some(frame) = link.outbound.front_mut() {
        match writer.try_write(frame) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) if n < frame.len() => {
                frame.drain(..n);
                return Ok(());
            }
            Ok(n) => {
                tracing::trace!("Wrote {n} bytes");
                link.outbound.pop_front();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn readiness_loop<P: Protocol>(
    protocol: &mut P,
    mut ctx: LoopContext<P::Request>,
) -> StopCause {
    let tick = ctx.config.tick_interval;
    let addr = format!("{}:{}", ctx.host, ctx.port);
    let mut link = Link::default();

    // Connecting: timers keep running while the handshake is in flight.
    let connect = TcpStream::connect(addr.clone());
    tokio::pin!(connect);
    let stream = loop {
        if let Some(cause) = shutdown_requested(&ctx.shutdown) {
            return cause;
        }
        protocol.on_tick(Instant::now(), &mut link);
        if let Some(reason) = link.take_stop() {
            return StopCause::Protocol(reason);
        }

        tokio::select! {
            result = &mut connect => match result {
                Ok(stream) => break stream,
                Err(e) => return StopCause::Fault(format!("connect to {addr} failed: {e}")),
            },
            changed = ctx.shutdown.changed() => {
                if changed.is_err() {
                    return StopCause::Requested("transport handle dropped".to_string());
                }
            }
            _ = tokio::time::sleep(tick) => {}
        }
    };

    if let Err(e) = platform::configure_stream(&stream, &ctx.config.socket) {
        tracing::warn!("Failed to apply socket options: {e}");
    }
    tracing::info!("Connected to {addr}");

    let (mut reader, writer) = stream.into_split();
    let mut inbound = LineBuffer::new(&ctx.config.frame);
    let mut buf = vec![0u8; ctx.config.read_buffer_size.max(1)];

    loop {
        if let Some(cause) = shutdown_requested(&ctx.shutdown) {
            return cause;
        }
        protocol.on_tick(Instant::now(), &mut link);
        if let Some(reason) = link.take_stop() {
            return StopCause::Protocol(reason);
        }

        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => return StopCause::PeerClosed,
                Ok(n) => {
                    tracing::trace!("Read {n} bytes");
                    let lines = match inbound.push(&buf[..n]) {
                        Ok(lines) => lines,
                        Err(e) => return StopCause::Fault(e.to_string()),
                    };
                    for line in lines {
                        protocol.on_line(&line, Instant::now(), &mut link);
                        if let Some(reason) = link.take_stop() {
                            return StopCause::Protocol(reason);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return StopCause::Fault(format!("read error: {e}")),
            },
            Some(item) = ctx.ingress.recv() => {
                accept(protocol, item, &mut link);
                while let Ok(item) = ctx.ingress.try_recv() {
                    accept(protocol, item, &mut link);
                }
                if let Some(reason) = link.take_stop() {
                    return StopCause::Protocol(reason);
                }
            }
            ready = writer.writable(), if link.queued() > 0 => {
                if let Err(e) = ready.and_then(|()| flush_outbound(&writer, &mut link)) {
                    return StopCause::Fault(format!("write error: {e}"));
                }
            }
            changed = ctx.shutdown.changed() => {
                if changed.is_err() {
                    return StopCause::Requested("transport handle dropped".to_string());
                }
            }
            _ = tokio::time::sleep(tick) => {}
        }
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
