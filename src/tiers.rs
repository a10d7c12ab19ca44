//! Tier policy registry
//!
//! Pure lookup from (tier, risk level) to resource and risk limits. The
//! table is built once at construction and never mutated at runtime.
//! Unknown tiers or risk levels resolve to the most conservative policy
//! instead of failing, so a malformed upstream value never blocks a user
//! from running with safe defaults.

use std::collections::HashMap;

use tracing::warn;

/// Strategy identifier the worker falls back to when the requested key is
/// unknown or not allowed for the tier.
pub const BASELINE_STRATEGY: &str = "DCAStrategy";

/// Public strategy keys and the worker-side class they resolve to.
const STRATEGY_TABLE: &[(&str, &str)] = &[
    ("dca", "DCAStrategy"),
    ("scalping", "ScalpingStrategy"),
    ("momentum", "MomentumStrategy"),
];

/// All public strategy keys. Every tier currently offers the full set; the
/// allow-list still gates unknown or future keys down to the baseline.
const ALL_STRATEGY_KEYS: &[&str] = &["dca", "scalping", "momentum"];

const FALLBACK_TIER: &str = "starter";
const FALLBACK_RISK: &str = "safe";

/// Resolved limits for one (tier, risk level) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TierPolicy {
    pub max_open_trades: u32,
    pub risk_ratio: f64,
    pub allowed_strategies: &'static [&'static str],
}

impl TierPolicy {
    /// Resolve a requested strategy key to the worker-side identifier,
    /// falling back to [`BASELINE_STRATEGY`] when the key is unknown or not
    /// in this policy's allow-list.
    pub fn resolve_strategy(&self, requested: &str) -> &'static str {
        if !self.allowed_strategies.contains(&requested) {
            warn!(strategy = %requested, "strategy not allowed for tier, using baseline");
            return BASELINE_STRATEGY;
        }
        match STRATEGY_TABLE.iter().find(|(key, _)| *key == requested) {
            Some((_, resolved)) => resolved,
            None => {
                warn!(strategy = %requested, "unknown strategy key, using baseline");
                BASELINE_STRATEGY
            }
        }
    }
}

/// Immutable (tier, risk) → policy lookup.
pub struct TierPolicyRegistry {
    max_trades_by_tier: HashMap<&'static str, u32>,
    risk_ratio_by_level: HashMap<&'static str, f64>,
}

impl TierPolicyRegistry {
    pub fn new() -> Self {
        let max_trades_by_tier = HashMap::from([("starter", 2), ("pro", 3), ("elite", 5)]);
        let risk_ratio_by_level =
            HashMap::from([("safe", 0.05), ("moderate", 0.10), ("aggressive", 0.20)]);
        Self {
            max_trades_by_tier,
            risk_ratio_by_level,
        }
    }

    /// Resolve the policy for a tier and risk level. Never fails: unknown
    /// values are logged and mapped to starter/safe.
    pub fn resolve(&self, tier: &str, risk_level: &str) -> TierPolicy {
        let max_open_trades = match self.max_trades_by_tier.get(tier) {
            Some(limit) => *limit,
            None => {
                warn!(tier = %tier, "unknown tier, falling back to {}", FALLBACK_TIER);
                self.max_trades_by_tier[FALLBACK_TIER]
            }
        };

        let risk_ratio = match self.risk_ratio_by_level.get(risk_level) {
            Some(ratio) => *ratio,
            None => {
                warn!(risk_level = %risk_level, "unknown risk level, falling back to {}", FALLBACK_RISK);
                self.risk_ratio_by_level[FALLBACK_RISK]
            }
        };

        TierPolicy {
            max_open_trades,
            risk_ratio,
            allowed_strategies: ALL_STRATEGY_KEYS,
        }
    }
}

impl Default for TierPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_table_exact_values() {
        let registry = TierPolicyRegistry::new();

        let expected = [
            ("starter", 2),
            ("pro", 3),
            ("elite", 5),
        ];
        let ratios = [("safe", 0.05), ("moderate", 0.10), ("aggressive", 0.20)];

        for (tier, max_trades) in expected {
            for (risk, ratio) in ratios {
                let policy = registry.resolve(tier, risk);
                assert_eq!(policy.max_open_trades, max_trades, "tier {}", tier);
                assert_eq!(policy.risk_ratio, ratio, "risk {}", risk);
            }
        }
    }

    #[test]
    fn test_unknown_tier_and_risk_fall_back_conservatively() {
        let registry = TierPolicyRegistry::new();

        let policy = registry.resolve("platinum", "yolo");
        assert_eq!(policy.max_open_trades, 2);
        assert_eq!(policy.risk_ratio, 0.05);

        // Deterministic: same garbage in, same policy out
        let again = registry.resolve("platinum", "yolo");
        assert_eq!(policy, again);
    }

    #[test]
    fn test_strategy_resolution() {
        let registry = TierPolicyRegistry::new();
        let policy = registry.resolve("pro", "moderate");

        assert_eq!(policy.resolve_strategy("dca"), "DCAStrategy");
        assert_eq!(policy.resolve_strategy("scalping"), "ScalpingStrategy");
        assert_eq!(policy.resolve_strategy("momentum"), "MomentumStrategy");
        assert_eq!(policy.resolve_strategy("martingale"), BASELINE_STRATEGY);
        assert_eq!(policy.resolve_strategy(""), BASELINE_STRATEGY);
    }
}
