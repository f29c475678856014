//! Configuration for the protocol engine.
//!
//! The engine is configured with plain serde-deserializable structs; how
//! they are loaded (file, database, environment) is the embedding
//! application's concern. All sections have defaults so a minimal
//! deployment only needs the service-provider identifiers.
//!
//! # Example
//!
//! ```toml
//! [sp]
//! entity_id = "https://sp.example.com"
//! acs_url = "https://sp.example.com/saml/acs"
//!
//! [revocation]
//! interval_secs = 600
//! grace_period_secs = 86400
//! ```

mod revocation;
mod sp;

pub use revocation::*;
use serde::{Deserialize, Serialize};
pub use sp::*;
use thiserror::Error;

/// A structurally valid but semantically unusable configuration value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Root configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Service-provider identity and validation policy.
    pub sp: SpConfig,

    /// Correlation-registry and replay-cache bounds.
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Certificate revocation checking.
    #[serde(default)]
    pub revocation: RevocationConfig,
}

impl EngineConfig {
    /// Validate every section. Call once after deserialization; later
    /// stages assume a validated config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sp.validate()?;
        self.replay.validate()?;
        self.revocation.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> EngineConfig {
        EngineConfig {
            sp: SpConfig {
                entity_id: "https://sp.example.com".into(),
                acs_url: "https://sp.example.com/saml/acs".into(),
                ..SpConfig::default()
            },
            replay: ReplayConfig::default(),
            revocation: RevocationConfig::default(),
        }
    }

    #[test]
    fn default_sections_validate() {
        base_config().validate().unwrap();
    }

    #[test]
    fn empty_entity_id_rejected() {
        let mut config = base_config();
        config.sp.entity_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_breaker_threshold_rejected() {
        let mut config = base_config();
        config.revocation.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
