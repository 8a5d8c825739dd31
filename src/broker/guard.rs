//! Scoped gate acquisition.
//!
//! [`BrokerGuard`] releases the gate when it goes out of scope: normal
//! return, early `?` return, or panic unwinding.

use super::{ConnectionBroker, SharedConnection};

/// Holds the daemon gate until dropped.
///
/// Obtained from [`ConnectionBroker::scoped`]. The guard only releases its
/// own acquisition: if a supervisor force-released the gate and someone
/// else has since taken it, dropping a stale guard leaves the new holder
/// alone.
///
/// # Example
///
/// ```ignore
/// fn refresh(broker: &ConnectionBroker) -> anyhow::Result<()> {
///     let guard = broker.scoped(&AcquireOptions::default().establish_connection())?;
///     let conn = guard.connection().expect("connected");
///     conn.lock().unwrap().write_all(b"...")?;
///     // Gate released here, even if write_all failed.
///     Ok(())
/// }
/// ```
#[derive(Debug)]
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct BrokerGuard<'a> {
    broker: &'a ConnectionBroker,
    connection: Option<SharedConnection>,
    generation: u64,
}

impl<'a> BrokerGuard<'a> {
    pub(super) fn new(
        broker: &'a ConnectionBroker,
        connection: Option<SharedConnection>,
        generation: u64,
    ) -> Self {
        Self {
            broker,
            connection,
            generation,
        }
    }

    /// The live connection, or `None` when acquired without connecting.
    pub fn connection(&self) -> Option<&SharedConnection> {
        self.connection.as_ref()
    }

    /// Releases now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for BrokerGuard<'_> {
    fn drop(&mut self) {
        self.connection = None;
        self.broker.release_generation(self.generation);
    }
}
