//! Connection and operation settings.
//!
//! Every struct deserializes from JSON with defaults for missing keys, so a
//! config file only needs to name what it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SOLR_DOMAIN: &str = "localhost";
pub const DEFAULT_SOLR_PORT: u16 = 8983;

/// Where the server lives.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub domain: String,
    pub port: u16,
    /// Per-request timeout. `None` waits forever, which streamed uploads need.
    pub request_timeout_ms: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_SOLR_DOMAIN.to_string(),
            port: DEFAULT_SOLR_PORT,
            request_timeout_ms: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(domain: impl Into<String>, port: u16) -> Self {
        Self {
            domain: domain.into(),
            port,
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Options for one `load_docs` batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Merge incoming child documents into stored ones by id instead of
    /// replacing the stored children wholesale.
    pub merge_child_docs: bool,
    /// Number of concurrent upload connections.
    pub parallel: usize,
    /// Idle time after which an upload connection is fed a blank separator.
    pub keepalive_ms: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            merge_child_docs: false,
            parallel: 1,
            keepalive_ms: 5_000,
        }
    }
}

impl LoadOptions {
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_merge_child_docs(mut self, merge: bool) -> Self {
        self.merge_child_docs = merge;
        self
    }
}

/// Paging for `select_all` and the list helpers built on it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectOptions {
    /// Maximum number of rows returned overall.
    pub limit: Option<usize>,
    /// Rows per page after the first one.
    pub blocksize: usize,
    /// Pages requested at the same time.
    pub parallel: usize,
    /// Rows in the first page, kept small so short result sets return fast.
    pub start_blocksize: usize,
    /// Sort parameter passed through to the server. Forces `parallel = 1`.
    pub sort: String,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            limit: None,
            blocksize: 10_000,
            parallel: 6,
            start_blocksize: 100,
            sort: String::new(),
        }
    }
}

impl SelectOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Timing of replication start/poll/wait.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationPolicy {
    /// Pause between asking for fetchindex attempts.
    pub poll_interval_ms: u64,
    /// fetchindex attempts before giving up.
    pub max_attempts: u32,
    /// How long a running replication may take.
    pub timeout_ms: u64,
    /// Pause between `details` polls while a replication is running.
    pub status_poll_ms: u64,
    /// Pause after reading the start timestamp. Server timestamps have one
    /// second resolution.
    pub settle_ms: u64,
    /// Network errors tolerated while polling.
    pub max_network_errors: u32,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            max_attempts: 10,
            timeout_ms: 3_600_000,
            status_poll_ms: 5_000,
            settle_ms: 1_000,
            max_network_errors: 10,
        }
    }
}

impl ReplicationPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}
