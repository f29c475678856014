use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Service-provider identity and per-flow validation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpConfig {
    /// Our entity ID — the audience value IdPs assert to.
    pub entity_id: String,

    /// Assertion Consumer Service URL. Responses must be addressed here,
    /// and bearer subject confirmations must name it as Recipient.
    pub acs_url: String,

    /// Single Logout endpoint, if SLO is offered.
    pub slo_url: Option<String>,

    /// Sign outbound AuthnRequests and LogoutRequests/Responses.
    pub sign_requests: bool,

    /// Accept a plaintext assertion even though the deployment mandates
    /// encrypted ones. Off by default: a plaintext assertion where
    /// encryption was expected is a hard failure.
    pub allow_unencrypted_assertions: bool,

    /// Accept unsolicited (IdP-initiated) responses carrying no
    /// InResponseTo. Off by default.
    pub allow_idp_initiated: bool,

    /// Tolerated clock difference between SP and IdP when evaluating
    /// NotBefore/NotOnOrAfter, in seconds.
    pub clock_skew_secs: u64,

    /// Name of the assertion attribute that overrides NameID as the
    /// subject identity, if any.
    pub identity_attribute: Option<String>,

    /// Name of the assertion attribute carrying the subject's email.
    pub email_attribute: Option<String>,

    /// Name of the assertion attribute carrying the display name.
    pub name_attribute: Option<String>,

    /// Name of the assertion attribute carrying group memberships.
    pub groups_attribute: Option<String>,

    /// NameID format requested in AuthnRequests and used for logout.
    pub name_id_format: Option<String>,
}

impl Default for SpConfig {
    fn default() -> Self {
        Self {
            entity_id: String::new(),
            acs_url: String::new(),
            slo_url: None,
            sign_requests: true,
            allow_unencrypted_assertions: true,
            allow_idp_initiated: false,
            clock_skew_secs: default_clock_skew_secs(),
            identity_attribute: None,
            email_attribute: None,
            name_attribute: None,
            groups_attribute: None,
            name_id_format: None,
        }
    }
}

fn default_clock_skew_secs() -> u64 {
    300
}

impl SpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entity_id.is_empty() {
            return Err(ConfigError::invalid("sp.entity_id", "must not be empty"));
        }
        if self.acs_url.is_empty() {
            return Err(ConfigError::invalid("sp.acs_url", "must not be empty"));
        }
        if self.clock_skew_secs > 3600 {
            return Err(ConfigError::invalid(
                "sp.clock_skew_secs",
                "more than an hour of skew defeats the validity window",
            ));
        }
        Ok(())
    }
}

/// Bounds for the correlation registry and the consumed-assertion set.
///
/// Correctness only requires a correlation entry to outlive the IdP's
/// expected response latency; everything older is evictable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReplayConfig {
    /// Maximum outstanding request IDs before oldest-first eviction.
    pub max_outstanding_requests: usize,

    /// Age after which an unconsumed correlation entry is purged, in
    /// seconds.
    pub request_ttl_secs: u64,

    /// Number of most-recent consumed assertion IDs retained for replay
    /// rejection.
    pub consumed_capacity: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_outstanding_requests: 10_000,
            request_ttl_secs: 900,
            consumed_capacity: 100_000,
        }
    }
}

impl ReplayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_outstanding_requests == 0 {
            return Err(ConfigError::invalid(
                "replay.max_outstanding_requests",
                "must be at least 1",
            ));
        }
        if self.consumed_capacity == 0 {
            return Err(ConfigError::invalid(
                "replay.consumed_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
