//! Fallback caches of daemon state.
//!
//! Two JSON files are kept up to date by an external updater while it holds
//! the daemon connection:
//!
//! - `nodes_cache.json` - last known mesh node table
//! - `device_info.json` - last known local radio info
//!
//! UIs read them when the gate is busy. Reads never fail: a missing, empty,
//! unreadable or malformed file is simply "no cached data". The contents are
//! whatever was last written; nothing here tracks freshness beyond the file
//! mtime.
//!
//! # Location
//!
//! The files live under the cache directory of the *real* user. The tools
//! are often run through `sudo`, in which case `$HOME` points at root while
//! the updater ran as the invoking user. `SUDO_USER` wins when present.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory name under the user's cache root.
pub const CACHE_DIR_NAME: &str = "meshforge";

/// Which cache file to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// Mesh node table.
    Nodes,
    /// Local radio/device details.
    DeviceInfo,
}

impl CacheKind {
    /// File name inside the cache directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Nodes => "nodes_cache.json",
            Self::DeviceInfo => "device_info.json",
        }
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nodes => write!(f, "nodes"),
            Self::DeviceInfo => write!(f, "device info"),
        }
    }
}

/// Read access (and atomic write access for the updater) to the cache files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Cache rooted at `dir`. The directory does not need to exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache in the real invoking user's cache directory.
    pub fn for_real_user() -> Self {
        Self::new(default_cache_dir())
    }

    /// Directory holding the cache files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of one cache file.
    pub fn path(&self, kind: CacheKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Cached node table, if any.
    pub fn nodes(&self) -> Option<Value> {
        self.read(CacheKind::Nodes)
    }

    /// Cached device info, if any.
    pub fn device_info(&self) -> Option<Value> {
        self.read(CacheKind::DeviceInfo)
    }

    /// Reads one cache file.
    ///
    /// Returns `None` when the file is missing, unreadable, empty, holds
    /// invalid JSON, or holds a bare `null`.
    pub fn read(&self, kind: CacheKind) -> Option<Value> {
        let path = self.path(kind);

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                log::debug!("[cache] no {kind} cache at {}: {e}", path.display());
                return None;
            }
        };

        if content.trim().is_empty() {
            log::debug!("[cache] {kind} cache at {} is empty", path.display());
            return None;
        }

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("[cache] ignoring malformed {kind} cache {}: {e}", path.display());
                None
            }
        }
    }

    /// Last modification time of a cache file.
    pub fn modified(&self, kind: CacheKind) -> Option<DateTime<Utc>> {
        fs::metadata(self.path(kind))
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from)
    }

    /// Replaces a cache file atomically.
    ///
    /// Writes a sibling temp file and renames it over the target, so readers
    /// see either the old or the new contents, never a torn write.
    pub fn store(&self, kind: CacheKind, value: &Value) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache dir {}", self.dir.display()))?;

        let target = self.path(kind);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", kind.file_name(), std::process::id()));

        let body = serde_json::to_vec_pretty(value)?;
        fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;

        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("Failed to replace {}", target.display()));
        }

        log::debug!("[cache] stored {kind} cache at {}", target.display());
        Ok(())
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::for_real_user()
    }
}

/// Cache directory for the real invoking user, `.../meshforge`.
///
/// Under `sudo` this is `<invoking user's home>/.cache/meshforge`; otherwise
/// the platform cache dir (XDG on Linux).
pub fn default_cache_dir() -> PathBuf {
    if let Some(user) = sudo_user() {
        return user_home(&user)
            .unwrap_or_else(|| PathBuf::from("/home").join(&user))
            .join(".cache")
            .join(CACHE_DIR_NAME);
    }

    dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .unwrap_or_else(|| {
            log::warn!("[cache] could not determine a cache directory, using ./.cache");
            PathBuf::from(".cache")
        })
        .join(CACHE_DIR_NAME)
}

/// Home directory of the real invoking user.
pub fn real_user_home() -> Option<PathBuf> {
    match sudo_user() {
        Some(user) => Some(user_home(&user).unwrap_or_else(|| PathBuf::from("/home").join(user))),
        None => dirs::home_dir(),
    }
}

/// User that invoked `sudo`, ignoring root-to-root escalation.
fn sudo_user() -> Option<String> {
    std::env::var("SUDO_USER")
        .ok()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty() && u != "root")
}

#[cfg(unix)]
fn user_home(user: &str) -> Option<PathBuf> {
    use std::ffi::{CStr, CString};
    use std::os::unix::ffi::OsStrExt;

    let name = CString::new(user).ok()?;
    // SAFETY: `name` is a valid NUL-terminated string that outlives the call.
    // getpwnam returns either null or a pointer into static storage; pw_dir is
    // copied out before any other passwd lookup can overwrite it.
    unsafe {
        let entry = libc::getpwnam(name.as_ptr());
        if entry.is_null() || (*entry).pw_dir.is_null() {
            return None;
        }
        let dir = CStr::from_ptr((*entry).pw_dir);
        Some(PathBuf::from(std::ffi::OsStr::from_bytes(dir.to_bytes())))
    }
}

#[cfg(not(unix))]
fn user_home(_user: &str) -> Option<PathBuf> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_missing_cache_is_none() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path().join("does-not-exist"));
        assert!(cache.nodes().is_none());
        assert!(cache.device_info().is_none());
        assert!(cache.modified(CacheKind::Nodes).is_none());
    }

    #[test]
    fn test_malformed_and_empty_cache_is_none() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path());

        fs::write(cache.path(CacheKind::Nodes), "{not json").unwrap();
        fs::write(cache.path(CacheKind::DeviceInfo), "   \n").unwrap();

        assert!(cache.nodes().is_none());
        assert!(cache.device_info().is_none());
    }

    #[test]
    fn test_null_cache_is_none() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path());
        fs::write(cache.path(CacheKind::Nodes), "null").unwrap();
        assert!(cache.nodes().is_none());
    }

    #[test]
    fn test_store_then_read() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path().join("nested").join("meshforge"));

        let nodes = json!({"!a1b2c3d4": {"user": {"longName": "Base"}, "snr": 6.5}});
        cache.store(CacheKind::Nodes, &nodes).unwrap();

        assert_eq!(cache.nodes(), Some(nodes));
        assert!(cache.device_info().is_none());
        assert!(cache.modified(CacheKind::Nodes).is_some());

        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(cache.dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_store_overwrites() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path());

        cache.store(CacheKind::DeviceInfo, &json!({"hw": "T-Beam"})).unwrap();
        cache.store(CacheKind::DeviceInfo, &json!({"hw": "RAK4631"})).unwrap();

        assert_eq!(cache.device_info(), Some(json!({"hw": "RAK4631"})));
    }

    #[test]
    fn test_file_names() {
        let cache = CacheStore::new("/var/cache/x");
        assert_eq!(
            cache.path(CacheKind::Nodes),
            PathBuf::from("/var/cache/x/nodes_cache.json")
        );
        assert_eq!(
            cache.path(CacheKind::DeviceInfo),
            PathBuf::from("/var/cache/x/device_info.json")
        );
    }

    #[test]
    #[serial]
    fn test_sudo_user_root_is_ignored() {
        std::env::set_var("SUDO_USER", "root");
        assert!(sudo_user().is_none());
        std::env::set_var("SUDO_USER", "  ");
        assert!(sudo_user().is_none());
        std::env::remove_var("SUDO_USER");
        assert!(sudo_user().is_none());
    }

    #[test]
    #[serial]
    fn test_sudo_user_cache_dir() {
        std::env::set_var("SUDO_USER", "meshforge-no-such-user");
        let dir = default_cache_dir();
        std::env::remove_var("SUDO_USER");

        assert_eq!(
            dir,
            PathBuf::from("/home/meshforge-no-such-user/.cache/meshforge")
        );
    }

    #[test]
    #[serial]
    fn test_default_cache_dir_ends_with_meshforge() {
        std::env::remove_var("SUDO_USER");
        assert!(default_cache_dir().ends_with(CACHE_DIR_NAME));
    }
}
