//! Client-side connection to the mesh daemon's control socket.
//!
//! The broker treats the connection as an opaque resource: it can be opened
//! against `host:port` and closed. Everything spoken over it (the daemon's
//! own framed protocol) belongs to the consumer, which gets plain
//! [`Read`]/[`Write`] access through [`DaemonConnection`].
//!
//! # Lifecycle
//!
//! ```text
//! broker.acquire(connect=true) ──Connector::open(host, port)──► DaemonConnection
//!                                                                   │
//!                                      caller reads/writes via SharedConnection
//!                                                                   │
//! broker.release() ──────────────────DaemonConnection::close()──────┘
//! ```
//!
//! Closing marks the handle dead. Clones of the [`SharedConnection`] that a
//! caller kept past `release()` get `NotConnected` on every further I/O call
//! instead of talking over a socket the broker no longer owns.
//!
//! The broker can also close a connection while the holder is blocked inside
//! `read`/`write` with the mutex held. It uses a [`CloseHandle`] taken when
//! the connection was opened, which flips the closed flag and shuts the
//! socket down without touching the mutex.

// Rust guideline compliant 2026-02

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Shared, thread-safe daemon connection.
///
/// Wrapped in `Arc<Mutex<...>>` so the holder can hand the handle to worker
/// threads while the broker keeps its own reference for teardown.
pub type SharedConnection = Arc<Mutex<DaemonConnection>>;

/// Byte stream underneath a [`DaemonConnection`].
///
/// Implemented for [`TcpStream`]; tests and alternative transports provide
/// their own.
pub trait Link: Read + Write + Send + fmt::Debug {
    /// Tear the stream down. Called at most once per link by the broker.
    fn close(&mut self) -> io::Result<()>;

    /// Side channel that can shut the stream down from another thread
    /// while a `read` or `write` is in progress.
    ///
    /// Links without one are only marked closed on a forced release; the
    /// blocked call finishes on its own and the next one fails.
    fn shutdown_handle(&self) -> Option<Box<dyn LinkShutdown>> {
        None
    }
}

/// Out-of-band shutdown for a [`Link`].
pub trait LinkShutdown: Send + Sync + fmt::Debug {
    /// Unblock pending I/O and tear the stream down.
    fn shutdown(&self) -> io::Result<()>;
}

impl Link for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn shutdown_handle(&self) -> Option<Box<dyn LinkShutdown>> {
        match self.try_clone() {
            Ok(clone) => Some(Box::new(clone)),
            Err(e) => {
                log::debug!("[gate] no out-of-band shutdown for socket: {e}");
                None
            }
        }
    }
}

impl LinkShutdown for TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Opens links to the daemon.
///
/// The broker owns one connector for its whole life and calls [`open`]
/// only while it holds the gate.
///
/// [`open`]: Connector::open
pub trait Connector: Send + Sync + fmt::Debug {
    /// Dial `host:port`.
    ///
    /// Connecting must not take longer than the connector's own connect
    /// timeout in total, however many addresses the host resolves to. Name
    /// resolution runs before that clock starts and is bounded only by the
    /// system resolver.
    fn open(&self, host: &str, port: u16) -> io::Result<Box<dyn Link>>;
}

/// Default connector: plain TCP with a bounded connect.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Default connect timeout.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a connector with the given connect timeout and a read/write
    /// timeout of the same length.
    ///
    /// A zero timeout means [`DEFAULT_CONNECT_TIMEOUT`](Self::DEFAULT_CONNECT_TIMEOUT);
    /// sockets reject a zero timeout outright.
    pub fn new(connect_timeout: Duration) -> Self {
        let connect_timeout = if connect_timeout.is_zero() {
            Self::DEFAULT_CONNECT_TIMEOUT
        } else {
            connect_timeout
        };
        Self {
            connect_timeout,
            io_timeout: Some(connect_timeout),
        }
    }

    /// Overrides the read/write timeout applied to opened streams.
    ///
    /// `None` (or a zero duration) leaves the stream fully blocking.
    pub fn with_io_timeout(mut self, io_timeout: Option<Duration>) -> Self {
        self.io_timeout = io_timeout.filter(|t| !t.is_zero());
        self
    }

    /// Connect timeout used for every dial.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Connector for TcpConnector {
    fn open(&self, host: &str, port: u16) -> io::Result<Box<dyn Link>> {
        let addrs: Vec<_> = (host, port).to_socket_addrs()?.collect();
        let deadline = Instant::now() + self.connect_timeout;
        let mut last_err = None;

        // Try every resolved address; `localhost` commonly yields ::1 first.
        for addr in addrs {
            let Some(budget) = remaining(deadline) else {
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {host}:{port} timed out"),
                ));
                break;
            };

            match TcpStream::connect_timeout(&addr, budget) {
                Ok(stream) => {
                    stream.set_read_timeout(self.io_timeout)?;
                    stream.set_write_timeout(self.io_timeout)?;
                    stream.set_nodelay(true)?;
                    log::debug!("[gate] connected to {addr}");
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    log::debug!("[gate] connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{host}:{port} did not resolve to any address"),
            )
        }))
    }
}

/// Time left before `deadline`, or `None` once nothing usable is left.
fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
}

/// Closes a [`DaemonConnection`] without locking it.
///
/// Held by the broker next to the [`SharedConnection`], so a forced release
/// never waits on a holder stuck in I/O.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    closed: Arc<AtomicBool>,
    shutdown: Option<Arc<dyn LinkShutdown>>,
}

impl CloseHandle {
    /// Marks the connection closed and shuts the link down out of band.
    ///
    /// Returns `Ok` without doing anything if it was already closed.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.shutdown {
            Some(shutdown) => shutdown.shutdown(),
            None => Ok(()),
        }
    }

    /// Whether either side has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Live connection to the daemon, owned by whoever holds the gate.
#[derive(Debug)]
pub struct DaemonConnection {
    link: Box<dyn Link>,
    target: String,
    opened_at: DateTime<Utc>,
    closed: Arc<AtomicBool>,
    shutdown: Option<Arc<dyn LinkShutdown>>,
}

impl DaemonConnection {
    /// Wraps an opened link.
    pub fn new(link: Box<dyn Link>, target: impl Into<String>) -> Self {
        let shutdown = link.shutdown_handle().map(Arc::from);
        Self {
            link,
            target: target.into(),
            opened_at: Utc::now(),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    /// `host:port` this connection was opened against.
    ///
    /// Reconfiguring the broker afterwards does not change it.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// When the link was established.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Whether the connection has been closed, here or through a
    /// [`CloseHandle`].
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handle that closes this connection without locking it.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            closed: Arc::clone(&self.closed),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Closes the underlying link. A second call is a no-op, as is a call
    /// after a [`CloseHandle`] already closed it.
    ///
    /// The handle counts as closed even when the link reports an error.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.link.close()
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection to {} was released", self.target),
            ));
        }
        Ok(())
    }
}

impl Read for DaemonConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        self.link.read(buf)
    }
}

impl Write for DaemonConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        self.link.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        self.link.flush()
    }
}
