//! Config synthesizer
//!
//! Merges the base template with a subscriber's exchange credentials, tier
//! limits, and resolved strategy into a per-subscriber artifact. Artifacts
//! are keyed deterministically by subscriber id (`config_user_{id}.json`)
//! so no two subscribers can collide, and are written via temp-then-rename
//! so a concurrent reader never sees a partial document.

use std::path::PathBuf;

use serde_json::{json, Map, Value};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::SynthError;
use crate::subscriber::Subscriber;
use crate::tiers::TierPolicy;

/// The synthesized, write-once-per-start configuration a worker consumes.
#[derive(Debug, Clone)]
pub struct ConfigArtifact {
    pub subscriber_id: Uuid,
    pub path: PathBuf,
    pub exchange: String,
    pub strategy: String,
    pub max_open_trades: u32,
    pub tradable_balance_ratio: f64,
    pub api_port: u16,
}

pub struct ConfigSynthesizer {
    template_path: PathBuf,
    artifact_dir: PathBuf,
    api_port_base: u16,
    api_port_span: u16,
}

impl ConfigSynthesizer {
    pub fn new(cfg: &ManagerConfig) -> Self {
        Self {
            template_path: cfg.template_path.clone(),
            artifact_dir: cfg.artifact_dir.clone(),
            api_port_base: cfg.api_port_base,
            api_port_span: cfg.api_port_span,
        }
    }

    /// Deterministic artifact location for a subscriber.
    pub fn artifact_path(&self, subscriber_id: Uuid) -> PathBuf {
        self.artifact_dir
            .join(format!("config_user_{}.json", subscriber_id))
    }

    /// Stable per-subscriber port for the worker's local API, folded from
    /// the subscriber id into the configured range. Computed in `u32` and
    /// clamped so a range reaching past 65535 cannot overflow.
    pub fn api_port(&self, subscriber_id: Uuid) -> u16 {
        let folded = subscriber_id
            .as_bytes()
            .iter()
            .fold(0u32, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u32));
        let span = self.api_port_span.max(1) as u32;
        let port = self.api_port_base as u32 + folded % span;
        port.min(u16::MAX as u32) as u16
    }

    /// Build and persist the artifact for one subscriber.
    ///
    /// The result is fully determined by the subscriber snapshot and the
    /// policy; re-synthesis overwrites the previous artifact atomically.
    pub async fn synthesize(
        &self,
        subscriber: &Subscriber,
        policy: &TierPolicy,
    ) -> Result<ConfigArtifact, SynthError> {
        let mut doc = self.load_template().await?;

        let exchange_name = normalize_exchange(&subscriber.exchange.exchange);
        let strategy = policy.resolve_strategy(&subscriber.strategy).to_string();
        let api_port = self.api_port(subscriber.id);

        // Keep whatever else the template carries for the exchange section,
        // overriding only the binding fields.
        let mut exchange = doc
            .get("exchange")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(Map::new);
        exchange.insert("name".to_string(), json!(exchange_name));
        exchange.insert("key".to_string(), json!(subscriber.exchange.api_key));
        exchange.insert("secret".to_string(), json!(subscriber.exchange.api_secret));
        doc.insert("exchange".to_string(), Value::Object(exchange));

        doc.insert("max_open_trades".to_string(), json!(policy.max_open_trades));
        doc.insert(
            "tradable_balance_ratio".to_string(),
            json!(policy.risk_ratio),
        );
        doc.insert("strategy".to_string(), json!(strategy));
        doc.insert(
            "api_server".to_string(),
            json!({
                "enabled": true,
                "listen_ip_address": "127.0.0.1",
                "listen_port": api_port,
            }),
        );

        let path = self.artifact_path(subscriber.id);
        self.write_atomic(&path, &Value::Object(doc)).await?;

        info!(
            subscriber = %subscriber.id,
            exchange = %exchange_name,
            strategy = %strategy,
            max_open_trades = policy.max_open_trades,
            "synthesized config artifact"
        );

        Ok(ConfigArtifact {
            subscriber_id: subscriber.id,
            path,
            exchange: exchange_name,
            strategy,
            max_open_trades: policy.max_open_trades,
            tradable_balance_ratio: policy.risk_ratio,
            api_port,
        })
    }

    async fn load_template(&self) -> Result<Map<String, Value>, SynthError> {
        let missing = || SynthError::TemplateMissing {
            path: self.template_path.clone(),
        };

        let raw = fs::read_to_string(&self.template_path)
            .await
            .map_err(|_| missing())?;
        let parsed: Value = serde_json::from_str(&raw).map_err(|_| missing())?;
        match parsed {
            Value::Object(map) => Ok(map),
            _ => Err(missing()),
        }
    }

    async fn write_atomic(&self, path: &PathBuf, doc: &Value) -> Result<(), SynthError> {
        let persistence = |source: std::io::Error| SynthError::Persistence {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.artifact_dir)
            .await
            .map_err(persistence)?;

        let body = serde_json::to_string_pretty(doc)
            .map_err(|e| persistence(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).await.map_err(persistence)?;
        fs::rename(&tmp, path).await.map_err(persistence)?;

        debug!("wrote {}", path.display());
        Ok(())
    }
}

/// Strip environment suffixes so sandbox and live accounts share policy.
fn normalize_exchange(raw: &str) -> String {
    let name = raw.trim().to_ascii_lowercase();
    name.strip_suffix("_testnet")
        .or_else(|| name.strip_suffix("_sandbox"))
        .unwrap_or(&name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::ExchangeCredentials;
    use crate::tiers::TierPolicyRegistry;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> ManagerConfig {
        ManagerConfig {
            listen_port: 0,
            template_path: dir.join("base_config.json"),
            artifact_dir: dir.join("artifacts"),
            worker_bin: PathBuf::from("/bin/true"),
            heartbeat_interval_secs: 15,
            stop_grace_secs: 1,
            max_restarts: 3,
            restart_backoff_base_ms: 10,
            restart_backoff_max_ms: 50,
            balance_timeout_ms: 100,
            balance_cache_ttl_ms: 100,
            api_port_base: 18000,
            api_port_span: 2000,
        }
    }

    fn write_template(dir: &std::path::Path) {
        let template = json!({
            "stake_currency": "USDT",
            "dry_run": true,
            "exchange": { "pair_whitelist": ["BTC/USDT", "ETH/USDT"] },
        });
        std::fs::write(
            dir.join("base_config.json"),
            serde_json::to_string_pretty(&template).unwrap(),
        )
        .unwrap();
    }

    fn subscriber(tier: &str, risk: &str, strategy: &str, key: &str) -> Subscriber {
        Subscriber {
            id: Uuid::new_v4(),
            tier: tier.to_string(),
            risk_level: risk.to_string(),
            strategy: strategy.to_string(),
            exchange: ExchangeCredentials {
                exchange: "binance_testnet".to_string(),
                api_key: key.to_string(),
                api_secret: format!("{}-secret", key),
            },
        }
    }

    async fn read_artifact(path: &std::path::Path) -> Value {
        let raw = tokio::fs::read_to_string(path).await.unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_pro_moderate_artifact_matches_policy() {
        let dir = tempdir().unwrap();
        write_template(dir.path());
        let synth = ConfigSynthesizer::new(&test_config(dir.path()));
        let registry = TierPolicyRegistry::new();

        let sub = subscriber("pro", "moderate", "dca", "key-1");
        let policy = registry.resolve(&sub.tier, &sub.risk_level);
        let artifact = synth.synthesize(&sub, &policy).await.unwrap();

        assert_eq!(artifact.max_open_trades, 3);
        assert_eq!(artifact.tradable_balance_ratio, 0.10);
        assert_eq!(artifact.strategy, "DCAStrategy");
        assert_eq!(artifact.exchange, "binance");

        let doc = read_artifact(&artifact.path).await;
        assert_eq!(doc["max_open_trades"], json!(3));
        assert_eq!(doc["tradable_balance_ratio"], json!(0.10));
        assert_eq!(doc["strategy"], json!("DCAStrategy"));
        assert_eq!(doc["exchange"]["name"], json!("binance"));
        assert_eq!(doc["exchange"]["key"], json!("key-1"));
        // Template fields survive the merge
        assert_eq!(doc["stake_currency"], json!("USDT"));
        assert_eq!(doc["exchange"]["pair_whitelist"][0], json!("BTC/USDT"));
    }

    #[tokio::test]
    async fn test_missing_template_fails_without_artifact() {
        let dir = tempdir().unwrap();
        let synth = ConfigSynthesizer::new(&test_config(dir.path()));
        let registry = TierPolicyRegistry::new();

        let sub = subscriber("pro", "moderate", "dca", "key-1");
        let policy = registry.resolve(&sub.tier, &sub.risk_level);
        let err = synth.synthesize(&sub, &policy).await.unwrap_err();

        assert!(matches!(err, SynthError::TemplateMissing { .. }));
        assert!(!synth.artifact_path(sub.id).exists());
    }

    #[tokio::test]
    async fn test_malformed_template_is_template_missing() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("base_config.json"), "[1, 2, 3]").unwrap();
        let synth = ConfigSynthesizer::new(&test_config(dir.path()));
        let registry = TierPolicyRegistry::new();

        let sub = subscriber("starter", "safe", "dca", "key-1");
        let policy = registry.resolve(&sub.tier, &sub.risk_level);
        let err = synth.synthesize(&sub, &policy).await.unwrap_err();
        assert!(matches!(err, SynthError::TemplateMissing { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_synthesis_is_isolated() {
        let dir = tempdir().unwrap();
        write_template(dir.path());
        let synth = ConfigSynthesizer::new(&test_config(dir.path()));
        let registry = TierPolicyRegistry::new();

        let u1 = subscriber("starter", "safe", "dca", "alice-key");
        let u2 = subscriber("elite", "aggressive", "momentum", "bob-key");
        let p1 = registry.resolve(&u1.tier, &u1.risk_level);
        let p2 = registry.resolve(&u2.tier, &u2.risk_level);

        let (a1, a2) = tokio::join!(synth.synthesize(&u1, &p1), synth.synthesize(&u2, &p2));
        let (a1, a2) = (a1.unwrap(), a2.unwrap());
        assert_ne!(a1.path, a2.path);

        let d1 = read_artifact(&a1.path).await;
        let d2 = read_artifact(&a2.path).await;
        assert_eq!(d1["exchange"]["key"], json!("alice-key"));
        assert_eq!(d2["exchange"]["key"], json!("bob-key"));
        assert_eq!(d1["max_open_trades"], json!(2));
        assert_eq!(d2["max_open_trades"], json!(5));
        assert_eq!(d2["strategy"], json!("MomentumStrategy"));
    }

    #[tokio::test]
    async fn test_resynthesis_overwrites_idempotently() {
        let dir = tempdir().unwrap();
        write_template(dir.path());
        let synth = ConfigSynthesizer::new(&test_config(dir.path()));
        let registry = TierPolicyRegistry::new();

        let mut sub = subscriber("starter", "safe", "dca", "key-1");
        let policy = registry.resolve(&sub.tier, &sub.risk_level);
        let first = synth.synthesize(&sub, &policy).await.unwrap();

        sub.tier = "elite".to_string();
        let upgraded = registry.resolve(&sub.tier, &sub.risk_level);
        let second = synth.synthesize(&sub, &upgraded).await.unwrap();

        assert_eq!(first.path, second.path);
        let doc = read_artifact(&second.path).await;
        assert_eq!(doc["max_open_trades"], json!(5));
        // No temp file left behind
        assert!(!second.path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_api_port_is_stable_and_in_range() {
        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path());
        let synth = ConfigSynthesizer::new(&cfg);

        let id = Uuid::new_v4();
        let port = synth.api_port(id);
        assert_eq!(port, synth.api_port(id));
        assert!(port >= cfg.api_port_base);
        assert!(port < cfg.api_port_base + cfg.api_port_span);
    }

    #[test]
    fn test_api_port_range_at_top_of_u16_does_not_overflow() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.api_port_base = 65000;
        cfg.api_port_span = 2000; // base + span reaches past u16::MAX
        let synth = ConfigSynthesizer::new(&cfg);

        for _ in 0..64 {
            let port = synth.api_port(Uuid::new_v4());
            assert!(port >= cfg.api_port_base);
        }
    }

    #[test]
    fn test_exchange_normalization() {
        assert_eq!(normalize_exchange("binance_testnet"), "binance");
        assert_eq!(normalize_exchange("Kraken_sandbox"), "kraken");
        assert_eq!(normalize_exchange("  bybit "), "bybit");
        assert_eq!(normalize_exchange("okx"), "okx");
    }
}
