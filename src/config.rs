//! Service configuration
//!
//! All knobs come from the environment with a `SUPERVISOR_` prefix
//! (e.g. `SUPERVISOR_ARTIFACT_DIR`), with sensible defaults for local runs.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Port the control API listens on.
    pub listen_port: u16,
    /// Base config template every subscriber artifact derives from.
    pub template_path: PathBuf,
    /// Directory holding per-subscriber config artifacts.
    pub artifact_dir: PathBuf,
    /// Worker binary spawned per subscriber.
    pub worker_bin: PathBuf,
    /// How often the monitor refreshes a live worker's heartbeat.
    pub heartbeat_interval_secs: u64,
    /// Graceful-shutdown budget before a worker is force-killed.
    pub stop_grace_secs: u64,
    /// Crash restarts before a worker settles into Failed.
    pub max_restarts: u32,
    pub restart_backoff_base_ms: u64,
    pub restart_backoff_max_ms: u64,
    /// Bound on a single balance query to the worker.
    pub balance_timeout_ms: u64,
    /// How long a fetched balance stays servable from cache.
    pub balance_cache_ttl_ms: u64,
    /// Worker API ports are assigned from [base, base + span).
    pub api_port_base: u16,
    pub api_port_span: u16,
}

impl ManagerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let cfg = config::Config::builder()
            .set_default("listen_port", 3000_i64)?
            .set_default("template_path", "base_config.json")?
            .set_default("artifact_dir", "artifacts")?
            .set_default("worker_bin", "/usr/local/bin/trade-worker")?
            .set_default("heartbeat_interval_secs", 15_i64)?
            .set_default("stop_grace_secs", 10_i64)?
            .set_default("max_restarts", 3_i64)?
            .set_default("restart_backoff_base_ms", 2000_i64)?
            .set_default("restart_backoff_max_ms", 30000_i64)?
            .set_default("balance_timeout_ms", 5000_i64)?
            .set_default("balance_cache_ttl_ms", 10000_i64)?
            .set_default("api_port_base", 18000_i64)?
            .set_default("api_port_span", 2000_i64)?
            .add_source(config::Environment::with_prefix("SUPERVISOR").try_parsing(true))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn balance_timeout(&self) -> Duration {
        Duration::from_millis(self.balance_timeout_ms)
    }

    pub fn balance_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.balance_cache_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load() {
        let cfg = ManagerConfig::load().unwrap();
        assert_eq!(cfg.listen_port, 3000);
        assert_eq!(cfg.max_restarts, 3);
        assert_eq!(cfg.stop_grace(), Duration::from_secs(10));
        assert!(cfg.api_port_span > 0);
    }
}
