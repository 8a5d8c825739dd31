//! `nodes` and `device-info` commands: print cached daemon state.

use anyhow::Result;

use crate::cache::{CacheKind, CacheStore};

/// Renders one cache as pretty JSON, or a "no cached data" line.
pub fn render(cache: &CacheStore, kind: CacheKind) -> Result<String> {
    Ok(match cache.read(kind) {
        Some(value) => serde_json::to_string_pretty(&value)?,
        None => format!("No cached {kind} data ({})", cache.path(kind).display()),
    })
}

/// Prints one cache. Missing data is not an error.
pub fn show(cache: &CacheStore, kind: CacheKind) -> Result<()> {
    println!("{}", render(cache, kind)?);
    Ok(())
}
