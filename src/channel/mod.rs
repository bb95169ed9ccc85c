//! Framed point-to-point message channel over a stream transport.

pub mod frame;
pub mod proto;

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use frame::FrameError;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("peer closed the connection")]
    Closed,
}

impl ChannelError {
    /// Dial failures mean the peer was unreachable before any exchange
    /// started; everything else aborted an in-flight session.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ChannelError::Dial { .. })
    }
}

/// One serialized message each way per call, framed per [`frame`].
///
/// Every read and write first arms the socket deadline; exceeding it
/// fails the operation and poisons the session.
#[derive(Debug)]
pub struct MessageChannel {
    stream: TcpStream,
    io_deadline: Duration,
    max_frame_bytes: usize,
}

impl MessageChannel {
    pub fn dial(
        addr: &str,
        dial_deadline: Duration,
        io_deadline: Duration,
        max_frame_bytes: usize,
    ) -> Result<Self, ChannelError> {
        let resolved = addr
            .to_socket_addrs()
            .map_err(|source| ChannelError::Dial {
                addr: addr.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| ChannelError::Dial {
                addr: addr.to_string(),
                source: std::io::Error::new(ErrorKind::AddrNotAvailable, "no address resolved"),
            })?;

        let stream = TcpStream::connect_timeout(&resolved, dial_deadline).map_err(|source| {
            ChannelError::Dial {
                addr: addr.to_string(),
                source,
            }
        })?;
        Self::from_stream(stream, io_deadline, max_frame_bytes)
    }

    pub fn from_stream(
        stream: TcpStream,
        io_deadline: Duration,
        max_frame_bytes: usize,
    ) -> Result<Self, ChannelError> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            io_deadline,
            max_frame_bytes,
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ChannelError> {
        self.stream.set_write_timeout(Some(self.io_deadline))?;
        let payload = serde_json::to_vec(message)?;
        frame::write_frame(&mut self.stream, &payload, self.max_frame_bytes)?;
        Ok(())
    }

    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<T, ChannelError> {
        self.stream.set_read_timeout(Some(self.io_deadline))?;
        let payload =
            frame::read_frame(&mut self.stream, self.max_frame_bytes)?.ok_or(ChannelError::Closed)?;
        Ok(serde_json::from_slice(&payload)?)
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Handler invoked for each accepted connection. Owns the channel and
/// must close it.
pub type InboundHandler = dyn Fn(SocketAddr, MessageChannel) + Send + Sync;

/// Accept loop on a nonblocking listener. One worker thread per
/// connection, bounded by a session cap; excess connections are dropped.
pub struct Acceptor {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl Acceptor {
    pub fn start(
        bind_addr: &str,
        io_deadline: Duration,
        max_frame_bytes: usize,
        max_sessions: usize,
        handler: Arc<InboundHandler>,
    ) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));

        let loop_shutdown = Arc::clone(&shutdown);
        let loop_active = Arc::clone(&active);
        let join = thread::Builder::new()
            .name("gossip-acceptor".to_string())
            .spawn(move || {
                run_accept_loop(
                    listener,
                    loop_shutdown,
                    loop_active,
                    io_deadline,
                    max_frame_bytes,
                    max_sessions,
                    handler,
                )
            })?;

        Ok(Self {
            local_addr,
            shutdown,
            active,
            join: Some(join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stop accepting and join the accept loop. In-flight session
    /// workers finish on their own; callers poll `active_sessions`.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SessionGuard {
    active: Arc<AtomicUsize>,
}

impl SessionGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Self {
                        active: Arc::clone(active),
                    });
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

fn run_accept_loop(
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    io_deadline: Duration,
    max_frame_bytes: usize,
    max_sessions: usize,
    handler: Arc<InboundHandler>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let Some(guard) = SessionGuard::try_acquire(&active, max_sessions) else {
                    tracing::warn!(peer = %peer_addr, "inbound session limit reached, dropping connection");
                    continue;
                };

                // The accepted socket inherits nonblocking from the listener.
                if let Err(err) = stream.set_nonblocking(false) {
                    tracing::warn!(peer = %peer_addr, "failed to set blocking mode: {err}");
                    continue;
                }

                let handler = Arc::clone(&handler);
                let spawn = thread::Builder::new()
                    .name("gossip-session".to_string())
                    .spawn(move || {
                        let _guard = guard;
                        match MessageChannel::from_stream(stream, io_deadline, max_frame_bytes) {
                            Ok(channel) => handler(peer_addr, channel),
                            Err(err) => {
                                tracing::warn!(peer = %peer_addr, "inbound channel setup failed: {err}");
                            }
                        }
                    });
                if let Err(err) = spawn {
                    tracing::error!(peer = %peer_addr, "failed to spawn session worker: {err}");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                tracing::warn!("accept error: {err}");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}
