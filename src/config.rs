//! Fabric configuration
//!
//! One aggregate struct combining every component's knobs, with
//! file/environment layering through the `config` crate: values come
//! from defaults, then an optional TOML file, then `FABRIC_*`
//! environment variables (double underscore as the section separator,
//! e.g. `FABRIC_SCHEDULER__LOOKAHEAD_DEPTH=4`).

use crate::balancer::BalancerConfig;
use crate::coordinator::CoordinatorConfig;
use crate::health::HealthConfig;
use crate::registry::RegistryConfig;
use crate::scheduler::SchedulerConfig;
use crate::types::{FabricError, FabricResult};
use serde::{Deserialize, Serialize};

/// Aggregate configuration for the whole fabric
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Priority scheduler knobs
    pub scheduler: SchedulerConfig,
    /// Load balancer knobs
    pub balancer: BalancerConfig,
    /// Agent registry knobs
    pub registry: RegistryConfig,
    /// Health monitor knobs
    pub health: HealthConfig,
    /// Coordinator knobs
    pub coordinator: CoordinatorConfig,
}

impl FabricConfig {
    /// Load configuration by layering an optional TOML file and the
    /// `FABRIC_*` environment over the defaults.
    pub fn load(path: Option<&str>) -> FabricResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FABRIC")
                .separator("__")
                .try_parsing(true),
        );
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FabricError::Validation(format!("configuration: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_load_without_sources() {
        let config = FabricConfig::load(None).unwrap();
        assert_eq!(config.scheduler.lookahead_depth, 8);
        assert_eq!(config.balancer.failure_threshold, 5);
        assert_eq!(config.health.check_interval_ms, 30_000);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[scheduler]\nlookahead_depth = 3\n\n[balancer]\ncooldown_ms = 5000"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let config = FabricConfig::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.lookahead_depth, 3);
        assert_eq!(config.balancer.cooldown_ms, 5_000);
        // Untouched sections keep defaults.
        assert_eq!(config.registry.heartbeat_timeout_ms, 60_000);
    }
}
