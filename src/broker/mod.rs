//! Single-connection gate for the mesh daemon's control socket.
//!
//! # Purpose
//!
//! The daemon accepts exactly one client connection at a time. The web UI,
//! TUI, GTK front end and CLI all want to talk to it, often at once. Every
//! one of them goes through a [`ConnectionBroker`], which hands the right to
//! talk to the daemon to one holder at a time and points everyone else at
//! the fallback caches.
//!
//! # States
//!
//! ```text
//!            acquire(connect=false)            release()
//! Unlocked ─────────────────────────► Locked ──────────────► Unlocked
//!     │                                                         ▲
//!     │ acquire(connect=true)                                   │
//!     ▼                      ok                                 │
//! Locked(attempting) ──────────────► Locked(conn) ─release()────┤
//!     │                                                         │
//!     └──────── connect failed: gate released, ConnectionFailed ┘
//! ```
//!
//! `release()` is valid from every state and always ends in `Unlocked`.
//!
//! # Semantics worth knowing
//!
//! - The gate is **not reentrant**. A holder that acquires again without
//!   releasing waits like everyone else and gets [`BrokerError::Busy`] when
//!   its timeout runs out (or immediately when non-blocking).
//! - `release()` does not check ownership. Any thread may call it, any
//!   number of times; shutdown paths rely on that.
//! - Holder identity and gate state change under the same lock, so a
//!   reader of [`ConnectionBroker::info`] never sees a stale holder.
//! - An old connection is closed before the gate reopens, so the daemon
//!   never sees two clients from this process.
//! - The gate lives in this process only. Other processes are kept out by
//!   the daemon itself refusing a second client, not by this gate.
//! - `release()` never waits on the holder. A holder blocked in I/O on the
//!   connection is cut off through a [`CloseHandle`] instead.

// Rust guideline compliant 2026-02

pub mod connection;
pub mod error;
mod fallback;
mod guard;

pub use connection::{
    CloseHandle, Connector, DaemonConnection, Link, LinkShutdown, SharedConnection, TcpConnector,
};
pub use error::BrokerError;
pub use fallback::Lookup;
pub use guard::BrokerGuard;

use std::io;
use std::sync::{Arc, Condvar, LazyLock, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scopeguard::ScopeGuard;
use serde::Serialize;
use serde_json::Value;

use crate::cache::CacheStore;
use crate::config::Config;

/// Default daemon host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default daemon control port.
pub const DEFAULT_PORT: u16 = 4403;
/// Default wait for a blocking acquire.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// How to ask for the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Wait for a current holder to release (up to `timeout`) instead of
    /// failing immediately.
    pub blocking: bool,
    /// Upper bound on the wait. Ignored when `blocking` is false.
    pub timeout: Duration,
    /// Open the daemon connection as part of acquiring.
    pub connect: bool,
    /// Holder identity shown in diagnostics. Defaults to the thread name.
    pub tag: Option<String>,
}

impl AcquireOptions {
    /// Wait up to `timeout` for the gate.
    pub fn blocking(timeout: Duration) -> Self {
        Self {
            blocking: true,
            timeout,
            connect: false,
            tag: None,
        }
    }

    /// Fail with `Busy` at once if the gate is held.
    pub fn non_blocking() -> Self {
        Self {
            blocking: false,
            timeout: Duration::ZERO,
            connect: false,
            tag: None,
        }
    }

    /// Also open the daemon connection.
    pub fn establish_connection(mut self) -> Self {
        self.connect = true;
        self
    }

    /// Name the holder.
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self::blocking(DEFAULT_LOCK_TIMEOUT)
    }
}

/// Successful acquisition.
#[derive(Debug)]
pub enum Acquired {
    /// Gate held, no connection opened.
    LockOnly,
    /// Gate held with a live connection.
    Connected(SharedConnection),
}

impl Acquired {
    /// The live connection, if one was opened.
    pub fn connection(&self) -> Option<&SharedConnection> {
        match self {
            Self::LockOnly => None,
            Self::Connected(conn) => Some(conn),
        }
    }

    /// Consumes the result, keeping the connection if any.
    pub fn into_connection(self) -> Option<SharedConnection> {
        match self {
            Self::LockOnly => None,
            Self::Connected(conn) => Some(conn),
        }
    }
}

/// Point-in-time view of the broker for diagnostics and UIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerInfo {
    /// Whether someone holds the gate.
    pub locked: bool,
    /// Who holds it.
    pub holder: Option<String>,
    /// Configured daemon host.
    pub host: String,
    /// Configured daemon port.
    pub port: u16,
    /// When the current holder acquired.
    pub acquired_at: Option<DateTime<Utc>>,
    /// Whether the holder has a connection handle (weak, see
    /// [`ConnectionBroker::is_connected`]).
    pub connected: bool,
}

/// Mutable broker state. Every field changes only under `ConnectionBroker::state`.
#[derive(Debug)]
struct GateState {
    locked: bool,
    /// Set while `release()` closes the connection; the gate stays shut.
    releasing: bool,
    /// Bumped on every successful acquisition.
    generation: u64,
    holder: Option<String>,
    acquired_at: Option<DateTime<Utc>>,
    host: String,
    port: u16,
    connection: Option<HeldConnection>,
}

/// The holder's connection plus the means to close it without its mutex.
#[derive(Debug)]
struct HeldConnection {
    shared: SharedConnection,
    close: CloseHandle,
    target: String,
}

impl HeldConnection {
    fn new(conn: DaemonConnection) -> Self {
        Self {
            close: conn.close_handle(),
            target: conn.target().to_string(),
            shared: Arc::new(Mutex::new(conn)),
        }
    }

    /// Closes the connection, logging instead of returning failures.
    ///
    /// Never blocks on the connection mutex: if the holder is inside a
    /// read or write, the link is shut down out of band.
    fn close_quietly(&self) {
        let result = match self.shared.try_lock() {
            Ok(mut conn) => conn.close(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().close(),
            Err(TryLockError::WouldBlock) => {
                log::debug!("[gate] connection to {} busy, shutting down", self.target);
                self.close.close()
            }
        };
        if let Err(e) = result {
            log::warn!("[gate] error closing connection to {}: {e}", self.target);
        }
    }
}

impl GateState {
    fn new(host: String, port: u16) -> Self {
        Self {
            locked: false,
            releasing: false,
            generation: 0,
            holder: None,
            acquired_at: None,
            host,
            port,
            connection: None,
        }
    }

    /// Reopens the gate. Caller must notify waiters afterwards.
    fn clear(&mut self) -> Option<String> {
        self.locked = false;
        self.releasing = false;
        self.acquired_at = None;
        self.connection = None;
        self.holder.take()
    }
}

/// Process-wide gate guarding the one permitted daemon connection.
///
/// Construct one per process (or use [`ConnectionBroker::global`]) and share
/// it by reference or `Arc` with every component that talks to the daemon.
///
/// # Example
///
/// ```ignore
/// use meshforge_gate::{AcquireOptions, BrokerError, CacheStore, ConnectionBroker};
///
/// let broker = ConnectionBroker::new(CacheStore::for_real_user());
/// match broker.scoped(&AcquireOptions::non_blocking().establish_connection().tagged("tui")) {
///     Ok(guard) => { /* talk to the daemon through guard.connection() */ }
///     Err(BrokerError::Busy { .. }) => { let _nodes = broker.cached_nodes(); }
///     Err(e) => eprintln!("{e}"),
/// }
/// ```
#[derive(Debug)]
pub struct ConnectionBroker {
    state: Mutex<GateState>,
    released: Condvar,
    connector: Arc<dyn Connector>,
    cache: CacheStore,
}

static GLOBAL: LazyLock<ConnectionBroker> = LazyLock::new(|| match Config::load() {
    Ok(config) => config.broker(),
    Err(e) => {
        log::warn!("[gate] falling back to default config: {e:#}");
        Config::default().broker()
    }
});

impl ConnectionBroker {
    /// Broker targeting `127.0.0.1:4403` over TCP.
    pub fn new(cache: CacheStore) -> Self {
        Self {
            state: Mutex::new(GateState::new(DEFAULT_HOST.to_string(), DEFAULT_PORT)),
            released: Condvar::new(),
            connector: Arc::new(TcpConnector::default()),
            cache,
        }
    }

    /// Replaces the connector used to dial the daemon.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Sets the initial target.
    pub fn with_target(self, host: impl Into<String>, port: u16) -> Self {
        {
            let mut state = self.lock_state();
            state.host = host.into();
            state.port = port;
        }
        self
    }

    /// Process-wide default broker, built from [`Config::load`] on first use.
    ///
    /// Intended for application entry points; libraries should take a
    /// `&ConnectionBroker` instead.
    pub fn global() -> &'static ConnectionBroker {
        &GLOBAL
    }

    /// Updates the daemon target.
    ///
    /// `None` leaves a field unchanged. An already-open connection keeps
    /// talking to its original target until it is released.
    pub fn configure(&self, host: Option<&str>, port: Option<u16>) {
        let mut state = self.lock_state();
        if let Some(host) = host {
            state.host = host.to_string();
        }
        if let Some(port) = port {
            state.port = port;
        }
        log::debug!("[gate] target set to {}:{}", state.host, state.port);
    }

    /// Takes the gate.
    ///
    /// On [`BrokerError::Busy`] nothing changed. On
    /// [`BrokerError::ConnectionFailed`] the gate was taken and has already
    /// been given back. Pair every success with [`release`](Self::release),
    /// or use [`scoped`](Self::scoped) instead.
    pub fn acquire(&self, opts: &AcquireOptions) -> Result<Acquired, BrokerError> {
        self.acquire_tracked(opts).map(|(acquired, _)| acquired)
    }

    /// Like `acquire`, also returning the acquisition generation.
    fn acquire_tracked(&self, opts: &AcquireOptions) -> Result<(Acquired, u64), BrokerError> {
        let holder = opts.tag.clone().unwrap_or_else(current_identity);

        let (generation, host, port) = {
            let mut state = self.lock_state();

            if state.locked {
                if !opts.blocking {
                    log::debug!(
                        "[gate] {holder} refused, held by {}",
                        state.holder.as_deref().unwrap_or("?")
                    );
                    return Err(BrokerError::Busy {
                        holder: state.holder.clone(),
                    });
                }

                state = self
                    .released
                    .wait_timeout_while(state, opts.timeout, |s| s.locked)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;

                if state.locked {
                    log::debug!(
                        "[gate] {holder} timed out after {:?}, held by {}",
                        opts.timeout,
                        state.holder.as_deref().unwrap_or("?")
                    );
                    return Err(BrokerError::Busy {
                        holder: state.holder.clone(),
                    });
                }
            }

            state.locked = true;
            state.generation = state.generation.wrapping_add(1);
            state.holder = Some(holder.clone());
            state.acquired_at = Some(Utc::now());
            (state.generation, state.host.clone(), state.port)
        };

        log::debug!("[gate] acquired by {holder}");

        if !opts.connect {
            return Ok((Acquired::LockOnly, generation));
        }

        let target = format_target(&host, port);

        // Gives the gate back if opening fails or the connector panics.
        let pending = scopeguard::guard(generation, |generation| {
            self.release_generation(generation);
        });

        let link = match self.connector.open(&host, port) {
            Ok(link) => link,
            Err(source) => {
                drop(pending);
                log::warn!("[gate] {holder} could not connect to {target}: {source}");
                return Err(BrokerError::ConnectionFailed { target, source });
            }
        };
        let generation = ScopeGuard::into_inner(pending);

        let held = HeldConnection::new(DaemonConnection::new(link, target.clone()));

        {
            let mut state = self.lock_state();
            if state.generation == generation && state.locked && !state.releasing {
                let conn = Arc::clone(&held.shared);
                state.connection = Some(held);
                log::info!("[gate] {holder} connected to {target}");
                return Ok((Acquired::Connected(conn), generation));
            }
        }

        // Force-released while dialing: the gate is no longer ours.
        log::warn!("[gate] {holder} lost the gate while connecting to {target}");
        held.close_quietly();
        Err(BrokerError::ConnectionFailed {
            target,
            source: io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "gate was released while connecting",
            ),
        })
    }

    /// Gives the gate back.
    ///
    /// Closes the live connection if there is one (close errors are logged,
    /// never returned), clears the holder, and wakes waiters. Safe to call
    /// when nothing is held, twice in a row, concurrently, or from a thread
    /// other than the holder.
    ///
    /// Does not wait for the holder. If the holder is blocked reading or
    /// writing, its link is shut down underneath it and its next call fails
    /// with `NotConnected`.
    ///
    /// When another `release()` is already closing the connection, this one
    /// returns at once and the gate may still read as locked for the short
    /// time the other call needs to finish.
    pub fn release(&self) {
        let generation = self.lock_state().generation;
        self.release_generation(generation);
    }

    /// Releases only if acquisition `generation` still holds the gate.
    ///
    /// Guards use this so a late drop never frees someone else's hold.
    fn release_generation(&self, generation: u64) {
        let connection = {
            let mut state = self.lock_state();
            if !state.locked || state.releasing || state.generation != generation {
                return;
            }
            state.releasing = true;
            state.connection.take()
        };

        // Closed with the gate still shut so nobody can dial in parallel.
        if let Some(held) = connection {
            held.close_quietly();
        }

        let holder = self.lock_state().clear();
        self.released.notify_all();

        log::debug!(
            "[gate] released by {}",
            holder.as_deref().unwrap_or("unknown")
        );
    }

    /// Whether someone holds the gate. Never blocks on the gate itself.
    pub fn is_locked(&self) -> bool {
        self.lock_state().holder.is_some()
    }

    /// Whether the holder has a connection handle.
    ///
    /// This is a cheap, weak signal: it reports that a handle exists, not
    /// that the daemon is still answering on it.
    pub fn is_connected(&self) -> bool {
        self.lock_state().connection.is_some()
    }

    /// Snapshot of gate state and target.
    pub fn info(&self) -> BrokerInfo {
        let state = self.lock_state();
        BrokerInfo {
            locked: state.holder.is_some(),
            holder: state.holder.clone(),
            host: state.host.clone(),
            port: state.port,
            acquired_at: state.acquired_at,
            connected: state.connection.is_some(),
        }
    }

    /// Cached node table. Available whether or not the gate is held.
    pub fn cached_nodes(&self) -> Option<Value> {
        self.cache.nodes()
    }

    /// Cached device info. Available whether or not the gate is held.
    pub fn cached_device_info(&self) -> Option<Value> {
        self.cache.device_info()
    }

    /// The fallback cache this broker reads from.
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Acquires and returns a guard that releases on drop.
    pub fn scoped(&self, opts: &AcquireOptions) -> Result<BrokerGuard<'_>, BrokerError> {
        let (acquired, generation) = self.acquire_tracked(opts)?;
        Ok(BrokerGuard::new(self, acquired.into_connection(), generation))
    }

    /// Runs `f` while holding the gate, releasing on every exit path.
    ///
    /// `f` receives the connection when `opts.connect` is set, `None`
    /// otherwise. Panics inside `f` still release the gate.
    pub fn with_lock<R>(
        &self,
        opts: &AcquireOptions,
        f: impl FnOnce(Option<&SharedConnection>) -> R,
    ) -> Result<R, BrokerError> {
        let guard = self.scoped(opts)?;
        Ok(f(guard.connection()))
    }

    // Poisoning only means another thread panicked mid-update; every update
    // leaves the state valid, so keep going.
    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionBroker {
    fn drop(&mut self) {
        self.release();
    }
}

/// `host:port`, bracketing bare IPv6 literals.
fn format_target(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Identity for callers that did not tag themselves.
fn current_identity() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}
