//! Configuration for the mesh control plane.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A periodic task interval was set to zero.
    #[error("invalid interval for {task}: must be greater than zero")]
    ZeroInterval { task: String },

    /// Certificate validity window is shorter than the rotation threshold.
    #[error("certificate validity ({validity_days}d) must exceed rotation threshold ({threshold_days}d)")]
    ValidityBelowRotationThreshold {
        validity_days: u64,
        threshold_days: u64,
    },
}

/// Mesh configuration loaded at startup and adjustable at runtime
/// through [`crate::mesh::ServiceMesh::update_config`].
///
/// Each subsystem can be toggled independently; disabling the mesh as a
/// whole makes `call` execute operations directly.
///
/// # Environment Variables
///
/// * `MESH_ENABLED` - Master switch (default: true)
/// * `MESH_DISCOVERY_ENABLED` - Service discovery (default: true)
/// * `MESH_RETRIES_ENABLED` - Retry engine (default: true)
/// * `MESH_ROUTING_ENABLED` - Traffic routing (default: true)
/// * `MESH_AUTH_ENABLED` - Request signing and ACLs (default: true)
/// * `MESH_HEALTH_CHECKS_ENABLED` - Health flag tracking (default: true)
/// * `MESH_CIRCUIT_BREAKER_ENABLED` - Per-service breakers (default: true)
/// * `MESH_OBSERVABILITY_ENABLED` - Prometheus recording (default: true)
/// * `MESH_CANARY_INTERVAL_SECS` - Canary auto-increment tick (default: 60)
/// * `MESH_ROTATION_SCAN_INTERVAL_SECS` - Certificate scan tick (default: 3600)
/// * `MESH_ROTATION_THRESHOLD_DAYS` - Flag certificates expiring within (default: 7)
/// * `MESH_CERTIFICATE_VALIDITY_DAYS` - Issued certificate lifetime (default: 90)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Master switch for the whole mesh.
    pub enabled: bool,
    /// Whether discovery/load balancing is active.
    pub discovery_enabled: bool,
    /// Whether the retry engine wraps calls.
    pub retries_enabled: bool,
    /// Whether the traffic router is consulted.
    pub routing_enabled: bool,
    /// Whether requests are signed and checked against ACLs.
    pub auth_enabled: bool,
    /// Whether instance health flags are honored by discovery.
    pub health_checks_enabled: bool,
    /// Whether per-service circuit breakers guard calls.
    pub circuit_breaker_enabled: bool,
    /// Whether calls are recorded into the Prometheus registry.
    pub observability_enabled: bool,
    /// Interval between canary auto-increment ticks.
    pub canary_interval: Duration,
    /// Interval between certificate rotation scans.
    pub rotation_scan_interval: Duration,
    /// Certificates expiring within this window are flagged for rotation.
    pub rotation_threshold: Duration,
    /// Validity window for newly issued certificates.
    pub certificate_validity: Duration,
}

const SECS_PER_DAY: u64 = 86_400;

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            discovery_enabled: true,
            retries_enabled: true,
            routing_enabled: true,
            auth_enabled: true,
            health_checks_enabled: true,
            circuit_breaker_enabled: true,
            observability_enabled: true,
            canary_interval: Duration::from_secs(60),
            rotation_scan_interval: Duration::from_secs(3600),
            rotation_threshold: Duration::from_secs(7 * SECS_PER_DAY),
            certificate_validity: Duration::from_secs(90 * SECS_PER_DAY),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl MeshConfig {
    /// Loads configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            enabled: env_bool("MESH_ENABLED", defaults.enabled),
            discovery_enabled: env_bool("MESH_DISCOVERY_ENABLED", defaults.discovery_enabled),
            retries_enabled: env_bool("MESH_RETRIES_ENABLED", defaults.retries_enabled),
            routing_enabled: env_bool("MESH_ROUTING_ENABLED", defaults.routing_enabled),
            auth_enabled: env_bool("MESH_AUTH_ENABLED", defaults.auth_enabled),
            health_checks_enabled: env_bool(
                "MESH_HEALTH_CHECKS_ENABLED",
                defaults.health_checks_enabled,
            ),
            circuit_breaker_enabled: env_bool(
                "MESH_CIRCUIT_BREAKER_ENABLED",
                defaults.circuit_breaker_enabled,
            ),
            observability_enabled: env_bool(
                "MESH_OBSERVABILITY_ENABLED",
                defaults.observability_enabled,
            ),
            canary_interval: env_secs("MESH_CANARY_INTERVAL_SECS", defaults.canary_interval),
            rotation_scan_interval: env_secs(
                "MESH_ROTATION_SCAN_INTERVAL_SECS",
                defaults.rotation_scan_interval,
            ),
            rotation_threshold: env::var("MESH_ROTATION_THRESHOLD_DAYS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(|d| Duration::from_secs(d * SECS_PER_DAY))
                .unwrap_or(defaults.rotation_threshold),
            certificate_validity: env::var("MESH_CERTIFICATE_VALIDITY_DAYS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(|d| Duration::from_secs(d * SECS_PER_DAY))
                .unwrap_or(defaults.certificate_validity),
        }
    }

    /// Loads configuration from environment variables and validates it.
    pub fn from_env_validated() -> Result<Self, ConfigError> {
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The canary or rotation-scan interval is zero
    /// - The certificate validity does not exceed the rotation threshold
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.canary_interval.is_zero() {
            return Err(ConfigError::ZeroInterval {
                task: "canary auto-increment".to_string(),
            });
        }

        if self.rotation_scan_interval.is_zero() {
            return Err(ConfigError::ZeroInterval {
                task: "certificate rotation scan".to_string(),
            });
        }

        if self.certificate_validity <= self.rotation_threshold {
            return Err(ConfigError::ValidityBelowRotationThreshold {
                validity_days: self.certificate_validity.as_secs() / SECS_PER_DAY,
                threshold_days: self.rotation_threshold.as_secs() / SECS_PER_DAY,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert!(config.enabled);
        assert!(config.auth_enabled);
        assert_eq!(config.canary_interval, Duration::from_secs(60));
        assert_eq!(config.rotation_scan_interval, Duration::from_secs(3600));
        assert_eq!(
            config.certificate_validity,
            Duration::from_secs(90 * SECS_PER_DAY)
        );
    }

    #[test]
    fn test_validate_valid_config() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_canary_interval() {
        let config = MeshConfig {
            canary_interval: Duration::ZERO,
            ..Default::default()
        };
        let result = config.validate();
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ZeroInterval { .. }
        ));
    }

    #[test]
    fn test_validate_validity_below_threshold() {
        let config = MeshConfig {
            certificate_validity: Duration::from_secs(3 * SECS_PER_DAY),
            rotation_threshold: Duration::from_secs(7 * SECS_PER_DAY),
            ..Default::default()
        };
        let result = config.validate();
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidityBelowRotationThreshold { .. }
        ));
    }

    #[test]
    fn test_from_env_defaults() {
        let config = MeshConfig::from_env();
        assert!(config.validate().is_ok());
    }
}
