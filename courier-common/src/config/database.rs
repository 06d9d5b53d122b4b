use serde::{Deserialize, Serialize};

/// Where the queue tables live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL, e.g. `sqlite:///var/lib/courier/queue.db`.
    #[serde(default = "defaults::url")]
    pub url: String,

    /// Connections kept in the pool on top of one per worker thread.
    #[serde(default = "defaults::pool_headroom")]
    pub pool_headroom: u32,
}

impl DatabaseConfig {
    /// Pool size needed to serve `threads` work threads, the task thread and
    /// the headroom.
    #[must_use]
    pub const fn pool_size(&self, threads: u32) -> u32 {
        threads + self.pool_headroom
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: defaults::url(),
            pool_headroom: defaults::pool_headroom(),
        }
    }
}

mod defaults {
    pub fn url() -> String {
        "sqlite://courier.db".to_string()
    }

    pub const fn pool_headroom() -> u32 {
        3
    }
}
