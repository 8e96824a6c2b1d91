//! Engine tuning. Every field has a default so partial config files work.

use serde::Deserialize;

pub const DEFAULT_SCOPE_NAME: &str = "testScope";
pub const DEFAULT_TEST_TYPE: &str = "MANUAL";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Name of the scope exported after each finish cycle.
    pub scope_name: String,
    /// Test type recorded on exported scope tests.
    pub test_type: String,
    /// Lock shards in each probe aggregator.
    pub probe_shards: usize,
    /// Probe buffer slots reserved per class announced by `INIT`.
    pub probe_slots_per_class: usize,
    pub min_probe_capacity: usize,
    pub max_probe_capacity: usize,
    /// Pending events per target before senders block.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scope_name: DEFAULT_SCOPE_NAME.to_string(),
            test_type: DEFAULT_TEST_TYPE.to_string(),
            probe_shards: 16,
            probe_slots_per_class: 8,
            min_probe_capacity: 1_024,
            max_probe_capacity: 1_000_000,
            queue_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    /// Probe buffer bound for a generation announcing `classes_count` classes.
    pub fn probe_capacity(&self, classes_count: usize) -> usize {
        classes_count
            .saturating_mul(self.probe_slots_per_class)
            .max(self.min_probe_capacity)
            .min(self.max_probe_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_clamped() {
        let config = EngineConfig::default();
        assert_eq!(config.probe_capacity(0), 1_024);
        assert_eq!(config.probe_capacity(1_000), 8_000);
        assert_eq!(config.probe_capacity(usize::MAX), 1_000_000);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
scope_name = "nightly"
probe_shards = 4
"#,
        )
        .expect("parse config");
        assert_eq!(config.scope_name, "nightly");
        assert_eq!(config.probe_shards, 4);
        assert_eq!(config.test_type, DEFAULT_TEST_TYPE);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<EngineConfig>("shards = 4").is_err());
    }
}
