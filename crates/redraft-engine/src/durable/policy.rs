use std::collections::HashMap;
use std::time::Duration;

use redraft_core::config::{DurableConfig, UnitPolicyConfig};

/// Retry and timeout policy for one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_coefficient: f64,
    pub max_backoff: Duration,
    /// Upper bound for a single attempt.
    pub start_to_close: Duration,
}

impl Default for UnitPolicy {
    fn default() -> Self {
        Self::from(&UnitPolicyConfig::default())
    }
}

impl From<&UnitPolicyConfig> for UnitPolicy {
    fn from(config: &UnitPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            backoff_coefficient: config.backoff_coefficient,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            start_to_close: Duration::from_secs(config.start_to_close_timeout_secs),
        }
    }
}

impl UnitPolicy {
    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let ms = self.initial_backoff.as_millis() as f64 * self.backoff_coefficient.powi(exp);
        let capped = ms.min(self.max_backoff.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// `base_backoff` with 0.8x to 1.2x jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((self.base_backoff(attempt).as_millis() as f64 * jitter) as u64)
    }
}

/// Default policy plus per-node overrides.
#[derive(Debug, Clone, Default)]
pub struct UnitPolicies {
    default: UnitPolicy,
    per_node: HashMap<String, UnitPolicy>,
}

impl UnitPolicies {
    pub fn new(default: UnitPolicy) -> Self {
        Self {
            default,
            per_node: HashMap::new(),
        }
    }

    pub fn with_override(mut self, node_id: impl Into<String>, policy: UnitPolicy) -> Self {
        self.per_node.insert(node_id.into(), policy);
        self
    }

    /// Policies from the `[durable]` config section.
    pub fn from_config(config: &DurableConfig) -> Self {
        let per_node = config
            .units
            .keys()
            .map(|id| (id.clone(), UnitPolicy::from(&config.policy_for(id))))
            .collect();
        Self {
            default: UnitPolicy::from(&config.default_policy),
            per_node,
        }
    }

    pub fn for_node(&self, node_id: &str) -> &UnitPolicy {
        self.per_node.get(node_id).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redraft_core::config::UnitPolicyOverride;

    #[test]
    fn test_exponential_and_capped() {
        let policy = UnitPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            backoff_coefficient: 2.0,
            max_backoff: Duration::from_millis(350),
            start_to_close: Duration::from_secs(1),
        };
        assert_eq!(policy.base_backoff(1), Duration::from_millis(100));
        assert_eq!(policy.base_backoff(2), Duration::from_millis(200));
        assert_eq!(policy.base_backoff(3), Duration::from_millis(350));
        assert_eq!(policy.base_backoff(40), Duration::from_millis(350));

        for _ in 0..20 {
            let d = policy.backoff(2).as_millis();
            assert!((160..=240).contains(&d));
        }
    }

    #[test]
    fn test_defaults_match_config_defaults() {
        let policy = UnitPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.start_to_close, Duration::from_secs(120));
    }

    #[test]
    fn test_per_node_override() {
        let mut config = DurableConfig::default();
        config.units.insert(
            "generate".into(),
            UnitPolicyOverride {
                max_attempts: Some(5),
                start_to_close_timeout_secs: Some(300),
                ..Default::default()
            },
        );
        let policies = UnitPolicies::from_config(&config);
        assert_eq!(policies.for_node("generate").max_attempts, 5);
        assert_eq!(
            policies.for_node("generate").start_to_close,
            Duration::from_secs(300)
        );
        assert_eq!(policies.for_node("planner").max_attempts, 3);
    }
}
