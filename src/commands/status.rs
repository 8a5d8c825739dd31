//! `status` and `config` commands.
//!
//! The gate state in a status report belongs to the broker it was collected
//! from. Run from the CLI that is a fresh process, so the gate always reads
//! free there; the cache ages are what tell you about other front ends.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broker::{BrokerInfo, ConnectionBroker};
use crate::cache::{CacheKind, CacheStore};
use crate::config::Config;

/// Gate state plus cache ages, as printed by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Broker snapshot.
    pub gate: BrokerInfo,
    /// Cache directory in use.
    pub cache_dir: String,
    /// Node cache mtime, if the file exists.
    pub nodes_cached_at: Option<DateTime<Utc>>,
    /// Device-info cache mtime, if the file exists.
    pub device_info_cached_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    /// Collects a report without touching the gate.
    ///
    /// `gate` describes `broker` only, not gates in other processes.
    pub fn collect(broker: &ConnectionBroker) -> Self {
        let cache: &CacheStore = broker.cache();
        Self {
            gate: broker.info(),
            cache_dir: cache.dir().display().to_string(),
            nodes_cached_at: cache.modified(CacheKind::Nodes),
            device_info_cached_at: cache.modified(CacheKind::DeviceInfo),
        }
    }

    /// Human-readable rendering.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Daemon:      {}:{}\n", self.gate.host, self.gate.port));

        if self.gate.locked {
            let holder = self.gate.holder.as_deref().unwrap_or("unknown");
            let since = self
                .gate
                .acquired_at
                .map(|t| format!(" since {}", t.format("%H:%M:%S")))
                .unwrap_or_default();
            let conn = if self.gate.connected { ", connected" } else { "" };
            out.push_str(&format!("Gate:        held by {holder}{since}{conn}\n"));
        } else {
            out.push_str("Gate:        free\n");
        }

        out.push_str(&format!("Cache dir:   {}\n", self.cache_dir));
        out.push_str(&format!("Nodes:       {}\n", age(self.nodes_cached_at)));
        out.push_str(&format!("Device info: {}\n", age(self.device_info_cached_at)));
        out
    }
}

fn age(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => format!("cached {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => "no cached data".to_string(),
    }
}

/// Prints the status report.
pub fn run(broker: &ConnectionBroker, json: bool) -> Result<()> {
    let report = StatusReport::collect(broker);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(())
}

/// Prints the effective configuration.
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
