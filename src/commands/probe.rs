//! `probe` and `hold` commands.
//!
//! `probe` takes the gate with a connection and gives it straight back,
//! which answers "could a UI talk to the daemon right now?". `hold` keeps
//! the gate until the process is signalled.
//!
//! The gate only orders callers inside one process. Other front ends notice
//! a `hold` only through the daemon connection it keeps open, so `hold
//! --connect` is the form that makes the daemon busy for them; a plain
//! `hold` affects nothing outside this process.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{AcquireOptions, BrokerError, ConnectionBroker};

/// Result of a probe, mapped to the process exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Gate obtained and daemon reachable at the given target.
    Reachable(String),
    /// Someone else holds the gate.
    Busy(Option<String>),
    /// Gate obtained but the daemon did not accept a connection.
    Unreachable(String),
}

impl ProbeOutcome {
    /// Exit code for the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Reachable(_) => 0,
            Self::Busy(_) => 2,
            Self::Unreachable(_) => 3,
        }
    }

    /// One-line description.
    pub fn message(&self) -> String {
        match self {
            Self::Reachable(target) => format!("Daemon reachable at {target}"),
            Self::Busy(holder) => format!(
                "Daemon busy (held by {}), showing cached data is advised",
                holder.as_deref().unwrap_or("unknown")
            ),
            Self::Unreachable(reason) => format!("Cannot reach daemon: {reason}"),
        }
    }
}

/// Acquires with a connection, waiting up to `timeout`, then releases.
pub fn probe(broker: &ConnectionBroker, timeout: Duration) -> ProbeOutcome {
    let opts = AcquireOptions::blocking(timeout)
        .establish_connection()
        .tagged(format!("meshforge-gate probe (pid {})", std::process::id()));

    match broker.scoped(&opts) {
        Ok(guard) => {
            let target = guard
                .connection()
                .map(|conn| match conn.lock() {
                    Ok(conn) => conn.target().to_string(),
                    Err(poisoned) => poisoned.into_inner().target().to_string(),
                })
                .unwrap_or_default();
            ProbeOutcome::Reachable(target)
        }
        Err(BrokerError::Busy { holder }) => ProbeOutcome::Busy(holder),
        Err(e @ BrokerError::ConnectionFailed { .. }) => ProbeOutcome::Unreachable(e.to_string()),
    }
}

/// Holds the gate until `shutdown` is set, then releases it.
///
/// With `connect` the daemon connection is held open too, so the daemon is
/// unavailable to every other client. Without it only callers sharing
/// `broker` are kept out.
pub fn hold(
    broker: &ConnectionBroker,
    opts: &AcquireOptions,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let acquired = broker.acquire(opts)?;
    // Released on every exit from here on, including panics.
    let _release = scopeguard::guard((), |()| broker.release());

    let holder = broker.info().holder.unwrap_or_default();
    if acquired.connection().is_some() {
        println!("Holding daemon gate and connection as '{holder}'. Ctrl-C to release.");
    } else {
        println!("Holding daemon gate as '{holder}'. Ctrl-C to release.");
    }
    log::info!("Holding gate as {holder}");

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    println!("Releasing...");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use std::net::TcpListener;
    use std::thread;
    use tempfile::TempDir;

    fn broker_for(port: u16) -> (ConnectionBroker, TempDir) {
        let temp = TempDir::new().unwrap();
        let broker =
            ConnectionBroker::new(CacheStore::new(temp.path())).with_target("127.0.0.1", port);
        (broker, temp)
    }

    #[test]
    fn test_probe_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (broker, _temp) = broker_for(port);

        let outcome = probe(&broker, Duration::from_secs(1));
        assert_eq!(outcome, ProbeOutcome::Reachable(format!("127.0.0.1:{port}")));
        assert_eq!(outcome.exit_code(), 0);
        assert!(!broker.is_locked());
    }

    #[test]
    fn test_probe_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (broker, _temp) = broker_for(port);

        let outcome = probe(&broker, Duration::from_secs(1));
        assert_eq!(outcome.exit_code(), 3);
        assert!(outcome.message().starts_with("Cannot reach daemon"));
        assert!(!broker.is_locked());
    }

    #[test]
    fn test_probe_busy() {
        let (broker, _temp) = broker_for(1);
        broker
            .acquire(&AcquireOptions::non_blocking().tagged("gtk"))
            .unwrap();

        let outcome = probe(&broker, Duration::from_millis(50));
        assert_eq!(outcome, ProbeOutcome::Busy(Some("gtk".to_string())));
        assert_eq!(outcome.exit_code(), 2);
        broker.release();
    }

    #[test]
    fn test_hold_releases_on_shutdown() {
        let (broker, _temp) = broker_for(1);
        let broker = Arc::new(broker);
        let shutdown = Arc::new(AtomicBool::new(false));

        let holder = {
            let broker = Arc::clone(&broker);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                hold(
                    &broker,
                    &AcquireOptions::non_blocking().tagged("holder"),
                    &shutdown,
                )
            })
        };

        // Wait for the holder to take the gate.
        for _ in 0..100 {
            if broker.is_locked() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(broker.info().holder.as_deref(), Some("holder"));

        shutdown.store(true, Ordering::Relaxed);
        holder.join().unwrap().unwrap();
        assert!(!broker.is_locked());
    }

    #[test]
    fn test_hold_with_connect_occupies_daemon() {
        use std::io::Read;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (broker, _temp) = broker_for(port);
        let broker = Arc::new(broker);
        let shutdown = Arc::new(AtomicBool::new(false));

        let holder = {
            let broker = Arc::clone(&broker);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                hold(
                    &broker,
                    &AcquireOptions::non_blocking().establish_connection().tagged("holder"),
                    &shutdown,
                )
            })
        };

        // The daemon side sees a client for as long as the hold lasts.
        let (mut daemon_side, _) = listener.accept().unwrap();
        assert!(broker.is_connected());

        shutdown.store(true, Ordering::Relaxed);
        holder.join().unwrap().unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(daemon_side.read(&mut buf).unwrap(), 0);
        assert!(!broker.is_locked());
    }
}
