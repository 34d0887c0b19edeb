use serde::Deserialize;
use std::time::Duration;

/// Engine configuration.
///
/// Deserializable so it can ride along in a JSON settings document;
/// every field has a default.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Database id handed to the adapter before connect.
    pub id: String,
    /// Keep posting lists and search indexes in memory and persist them lazily.
    pub cache: bool,
    /// Cadence of the background flush when `cache` is on.
    pub flush_interval_ms: u64,
    /// Rows pulled per batch on scans and range reads.
    pub scan_batch: usize,
    /// Maximum nesting of WHERE trees.
    pub max_where_depth: usize,
    /// Tokenizer used by `search` columns that do not name one.
    pub default_tokenizer: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: "tabel".to_string(),
            cache: true,
            flush_interval_ms: 100,
            scan_batch: 1000,
            max_where_depth: 32,
            default_tokenizer: "english".to_string(),
        }
    }
}

impl Config {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Same config with index caching turned off (synchronous read-modify-write).
    pub fn uncached(mut self) -> Self {
        self.cache = false;
        self
    }
}
