//! The worker's configuration document.
//!
//! Every section and field has a default, so `()` is a complete
//! configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use courier_common::config::{DatabaseConfig, DeliveryConfig, DnsConfig, SmtpClientTimeouts};
use courier_delivery::DeliverySettings;
use courier_metrics::MetricsConfig;
use serde::Deserialize;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

const DEFAULT_PATHS: [&str; 2] = ["./courier.config.ron", "/etc/courier/courier.config.ron"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub smtp_client: SmtpClientTimeouts,

    /// Relay URLs, e.g. `smtp://relay.example.com:587?ssl_mode=STARTTLS`.
    /// Appended to any listed under `delivery`.
    #[serde(default)]
    pub smtp_relays: Vec<String>,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub smtp_server: SmtpServerConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerConfig {
    /// Number of work threads.
    #[serde(default = "defaults::threads")]
    pub threads: u32,

    /// Sleep between work passes that found nothing to do.
    #[serde(default = "defaults::work_sleep_secs")]
    pub work_sleep_secs: u64,

    /// Sleep between scheduled task passes.
    #[serde(default = "defaults::task_sleep_secs")]
    pub task_sleep_secs: u64,
}

impl WorkerConfig {
    #[must_use]
    pub const fn work_sleep(&self) -> Duration {
        Duration::from_secs(self.work_sleep_secs)
    }

    #[must_use]
    pub const fn task_sleep(&self) -> Duration {
        Duration::from_secs(self.task_sleep_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: defaults::threads(),
            work_sleep_secs: defaults::work_sleep_secs(),
            task_sleep_secs: defaults::task_sleep_secs(),
        }
    }
}

/// The inbound side's identity, used as the HELO fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SmtpServerConfig {
    #[serde(default)]
    pub hostname: Option<String>,
}

mod defaults {
    pub const fn threads() -> u32 {
        2
    }

    pub const fn work_sleep_secs() -> u64 {
        5
    }

    pub const fn task_sleep_secs() -> u64 {
        60
    }
}

impl CourierConfig {
    /// Parses a RON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid RON for this shape.
    pub fn from_ron(document: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(document)?)
    }

    /// Reads and parses the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let document = std::fs::read_to_string(path).map_err(|err| {
            anyhow::anyhow!("Failed to read config from {}: {err}", path.display())
        })?;

        Self::from_ron(&document)
            .map_err(|err| anyhow::anyhow!("Failed to parse {}: {err}", path.display()))
    }

    /// The delivery section with the top-level relays and the server hostname
    /// folded in.
    #[must_use]
    pub fn effective_delivery(&self) -> DeliveryConfig {
        let mut delivery = self.delivery.clone();
        delivery.smtp_relays.extend(self.smtp_relays.iter().cloned());
        if delivery.smtp_hostname.is_none() {
            delivery.smtp_hostname.clone_from(&self.smtp_server.hostname);
        }
        delivery
    }

    /// # Errors
    ///
    /// Fails on a malformed relay URL or an unreadable DKIM key.
    pub fn delivery_settings(&self) -> anyhow::Result<DeliverySettings> {
        Ok(DeliverySettings::from_config(
            &self.dns,
            &self.effective_delivery(),
            self.smtp_client,
        )?)
    }

    /// Connections the queue pool needs for this many threads.
    #[must_use]
    pub const fn pool_size(&self) -> u32 {
        // The task thread shares the headroom.
        self.database.pool_size(self.worker.threads)
    }
}

/// Finds the configuration file using the following precedence:
/// 1. `COURIER_CONFIG` environment variable
/// 2. ./courier.config.ron (current working directory)
/// 3. /etc/courier/courier.config.ron (system-wide config)
///
/// # Errors
///
/// Returns an error if `COURIER_CONFIG` names a missing file, or if no
/// default location has one.
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    find_config_file_from(std::env::var(CONFIG_ENV).ok(), &DEFAULT_PATHS)
}

fn find_config_file_from(env_path: Option<String>, defaults: &[&str]) -> anyhow::Result<PathBuf> {
    if let Some(env_path) = env_path {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    for path in defaults.iter().map(PathBuf::from) {
        if path.exists() {
            return Ok(path);
        }
    }

    let paths_tried = defaults
        .iter()
        .map(|path| format!("  - {path}"))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}
