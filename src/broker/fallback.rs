//! Live-or-cached reads.
//!
//! Front ends never wait on the daemon gate just to paint a screen. They try
//! once, and if someone else is talking to the daemon they show the last
//! cached snapshot instead. [`ConnectionBroker::live_or_cached`] packages
//! that pattern.

use serde_json::Value;

use super::{AcquireOptions, BrokerError, ConnectionBroker, SharedConnection};
use crate::cache::CacheKind;

/// Where a value came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    /// Fetched from the daemon just now.
    Live(T),
    /// Gate was busy; last cached snapshot, if there is one.
    Cached(Option<Value>),
}

impl<T> Lookup<T> {
    /// Whether the value came from the daemon.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }
}

impl ConnectionBroker {
    /// Talks to the daemon if the gate is free, otherwise reads the cache.
    ///
    /// Tries a non-blocking, connected acquire tagged with `tag`. On success
    /// runs `fetch` with the connection and releases afterwards. On `Busy`
    /// returns the `kind` cache. `ConnectionFailed` is returned as is: an
    /// unreachable daemon is a different UI state than a busy one.
    pub fn live_or_cached<T>(
        &self,
        tag: &str,
        kind: CacheKind,
        fetch: impl FnOnce(&SharedConnection) -> T,
    ) -> Result<Lookup<T>, BrokerError> {
        let opts = AcquireOptions::non_blocking()
            .establish_connection()
            .tagged(tag);

        match self.scoped(&opts) {
            Ok(guard) => match guard.connection() {
                Some(conn) => Ok(Lookup::Live(fetch(conn))),
                None => Ok(Lookup::Cached(self.cache.read(kind))),
            },
            Err(BrokerError::Busy { holder }) => {
                log::debug!(
                    "[gate] {tag} using cached {kind}, daemon held by {}",
                    holder.as_deref().unwrap_or("unknown")
                );
                Ok(Lookup::Cached(self.cache.read(kind)))
            }
            Err(e) => Err(e),
        }
    }
}
