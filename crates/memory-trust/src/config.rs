//! Pipeline configuration loaded from TOML and environment.
//!
//! Precedence: env `MEMTRUST__*` > file (`MEMTRUST_CONFIG` path, else `config/memory_trust`) > defaults.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | storage_path | ./data/memory_trust | Sled directory holding entries and the pattern vault. |
//! | ruleset_version | 1 | Active detection ruleset; entries stamped under older versions are re-scanned. |
//! | scan_timeout_ms | 100 | Hard per-entry scan budget. Overruns yield `suspicious`. |
//! | batch_size / max_batch_size | 16 / 128 | Drain batch size floor and backpressure ceiling. |
//! | workers / max_workers | 1 / 4 | Validator worker floor and backpressure ceiling. |
//! | backlog_per_worker | 64 | Queue depth per worker before another worker is spawned. |
//! | conflict_retries | 3 | Reload-and-retry attempts on a version conflict. |
//! | flagged_policy | manual | `manual` or `{ expire_after_secs = N }`. |
//! | vault_retention_secs | 2592000 | How long vault records outlive a deleted owner (30 days). |
//! | telemetry_window_secs | 86400 | Rolling telemetry window (24 h). |
//! | idle_poll_ms | 250 | How long an idle worker waits before re-checking shutdown. |
//! | sweep_interval_secs | 60 | How often the supervisor re-derives pending work from the store. |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/memory_trust";

/// Whether FLAGGED entries drift back into the validation queue on their own.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlaggedPolicy {
    /// Re-validation only through `MemoryStore::request_revalidation` or a ruleset bump.
    #[default]
    Manual,
    /// Re-validate once the flag is older than N seconds.
    ExpireAfterSecs(u64),
}

impl FlaggedPolicy {
    pub fn expiry(&self) -> Option<chrono::Duration> {
        match self {
            Self::Manual => None,
            Self::ExpireAfterSecs(secs) => Some(chrono::Duration::seconds(*secs as i64)),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data/memory_trust")
}
fn default_ruleset_version() -> u32 {
    1
}
fn default_scan_timeout_ms() -> u64 {
    100
}
fn default_batch_size() -> usize {
    16
}
fn default_max_batch_size() -> usize {
    128
}
fn default_workers() -> usize {
    1
}
fn default_max_workers() -> usize {
    4
}
fn default_backlog_per_worker() -> usize {
    64
}
fn default_conflict_retries() -> u32 {
    3
}
fn default_vault_retention_secs() -> u64 {
    30 * 24 * 3600
}
fn default_telemetry_window_secs() -> u64 {
    24 * 3600
}
fn default_idle_poll_ms() -> u64 {
    250
}
fn default_sweep_interval_secs() -> u64 {
    60
}

/// Runtime configuration for the store, validator, vault and telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default = "default_ruleset_version")]
    pub ruleset_version: u32,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_backlog_per_worker")]
    pub backlog_per_worker: usize,
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
    #[serde(default)]
    pub flagged_policy: FlaggedPolicy,
    #[serde(default = "default_vault_retention_secs")]
    pub vault_retention_secs: u64,
    #[serde(default = "default_telemetry_window_secs")]
    pub telemetry_window_secs: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            ruleset_version: default_ruleset_version(),
            scan_timeout_ms: default_scan_timeout_ms(),
            batch_size: default_batch_size(),
            max_batch_size: default_max_batch_size(),
            workers: default_workers(),
            max_workers: default_max_workers(),
            backlog_per_worker: default_backlog_per_worker(),
            conflict_retries: default_conflict_retries(),
            flagged_policy: FlaggedPolicy::default(),
            vault_retention_secs: default_vault_retention_secs(),
            telemetry_window_secs: default_telemetry_window_secs(),
            idle_poll_ms: default_idle_poll_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl TrustConfig {
    /// Load config from file and environment. See the module table for keys and defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("MEMTRUST_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load with `path` as the file layer (skipped when it does not exist).
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder();
        let builder = if path.exists() || path.with_extension("toml").exists() {
            builder.add_source(config::File::from(path).required(false))
        } else {
            builder
        };
        let built = builder
            .add_source(config::Environment::with_prefix("MEMTRUST").separator("__"))
            .build()?;
        let cfg: Self = built.try_deserialize()?;
        Ok(cfg.normalized())
    }

    /// Clamp floors and ceilings so the validator never runs with an empty pool or batch.
    pub fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.max_batch_size = self.max_batch_size.max(self.batch_size);
        self.workers = self.workers.max(1);
        self.max_workers = self.max_workers.max(self.workers);
        self.backlog_per_worker = self.backlog_per_worker.max(1);
        self.scan_timeout_ms = self.scan_timeout_ms.max(1);
        self
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn vault_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.vault_retention_secs as i64)
    }

    pub fn telemetry_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.telemetry_window_secs as i64)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(10))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Effective configuration as TOML, for startup logs and `--print-config`.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = TrustConfig::default();
        assert_eq!(cfg.scan_timeout_ms, 100);
        assert_eq!(cfg.telemetry_window_secs, 86_400);
        assert_eq!(cfg.flagged_policy, FlaggedPolicy::Manual);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory_trust.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "ruleset_version = 7").unwrap();
        writeln!(f, "batch_size = 0").unwrap();
        writeln!(f, "[flagged_policy]").unwrap();
        writeln!(f, "expire_after_secs = 600").unwrap();
        drop(f);

        let cfg = TrustConfig::load_from(&path).unwrap();
        assert_eq!(cfg.ruleset_version, 7);
        assert_eq!(cfg.batch_size, 1, "floor applied");
        assert_eq!(cfg.flagged_policy, FlaggedPolicy::ExpireAfterSecs(600));
        assert_eq!(cfg.scan_timeout_ms, 100);
    }

    #[test]
    fn effective_config_renders_as_toml() {
        let cfg = TrustConfig {
            flagged_policy: FlaggedPolicy::ExpireAfterSecs(30),
            ..TrustConfig::default()
        };
        let text = cfg.to_toml_string().unwrap();
        assert!(text.contains("scan_timeout_ms = 100"));
        assert!(text.contains("expire_after_secs = 30"));
    }
}
