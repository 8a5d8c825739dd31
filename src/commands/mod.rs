//! Command handlers behind the `meshforge-gate` binary.
//!
//! Each handler is a thin consumer of the library: it asks the broker for
//! the gate the same way a UI would, and falls back to the cache the same
//! way a UI should.

pub mod cache;
pub mod probe;
pub mod status;
