//! Store configuration
//!
//! Built in code with the `with_*` setters or read from the environment
//! with [`StoreConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

/// Default SQLite busy timeout.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a SQLite-backed store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Database file; `None` for a private in-memory database
    pub path: Option<PathBuf>,
    /// Maintain FTS5 shadow tables for `match` queries (default: true)
    pub full_text: bool,
    /// How long SQLite waits on a locked database file
    pub busy_timeout: Duration,
    /// Deadline applied to every store operation (default: none)
    pub op_timeout: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl StoreConfig {
    /// Private in-memory database
    pub fn in_memory() -> Self {
        Self {
            path: None,
            full_text: true,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            op_timeout: None,
        }
    }

    /// Database file at `path` (created if missing)
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::in_memory()
        }
    }

    /// Enable or disable full-text indexing
    pub fn with_full_text(mut self, enabled: bool) -> Self {
        self.full_text = enabled;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Bound every operation by `timeout`
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - KINDSTORE_DB_PATH (optional, default: in-memory)
    /// - KINDSTORE_FULL_TEXT (optional, default: "true")
    /// - KINDSTORE_BUSY_TIMEOUT_MS (optional, default: 5000)
    /// - KINDSTORE_OP_TIMEOUT_MS (optional, default: unset)
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> std::result::Result<Self, String> {
        let mut config = match get("KINDSTORE_DB_PATH").filter(|p| !p.is_empty()) {
            Some(path) => Self::at_path(path),
            None => Self::in_memory(),
        };

        if let Some(flag) = get("KINDSTORE_FULL_TEXT") {
            config.full_text = match flag.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                other => return Err(format!("KINDSTORE_FULL_TEXT: invalid flag {other:?}")),
            };
        }

        if let Some(ms) = get("KINDSTORE_BUSY_TIMEOUT_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|_| format!("KINDSTORE_BUSY_TIMEOUT_MS: not a number: {ms:?}"))?;
            config.busy_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = get("KINDSTORE_OP_TIMEOUT_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|_| format!("KINDSTORE_OP_TIMEOUT_MS: not a number: {ms:?}"))?;
            config.op_timeout = Some(Duration::from_millis(ms));
        }

        Ok(config)
    }
}
