use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Certificate revocation checking policy.
///
/// Revocation depends on third-party OCSP/CRL infrastructure outside our
/// control. The breaker and grace settings below are the middle ground
/// between failing closed on every network blip (federation-wide outage)
/// and failing open forever (no revocation at all).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RevocationConfig {
    /// Master switch. When disabled, every metadata certificate is
    /// treated as valid.
    pub enabled: bool,

    /// Background re-check interval, in seconds.
    pub interval_secs: u64,

    /// How long a certificate keeps its last known-valid status while
    /// checks are failing, measured from the last successful validation.
    pub grace_period_secs: u64,

    /// Delay between the OCSP attempt and the CRL fallback within one
    /// check cycle, in seconds. Fixed, not exponential.
    pub retry_delay_secs: u64,

    /// Timeout applied to every outbound OCSP/CRL/CA-certificate request,
    /// in seconds.
    pub http_timeout_secs: u64,

    /// Trust self-signed certificates without any network check. A
    /// diagnostic/development escape hatch.
    pub trust_self_signed: bool,

    /// Certificate subjects matching one of these substrings are treated
    /// as test CAs and skipped.
    pub test_ca_patterns: Vec<String>,

    /// Overrides the OCSP responder URL from the certificate's
    /// Authority-Information-Access extension.
    pub ocsp_responder_override: Option<String>,

    /// Overrides the CRL distribution point from the certificate.
    pub crl_url_override: Option<String>,

    /// Overrides the CA-issuer download URL from the certificate.
    pub ca_issuer_override: Option<String>,

    /// Verify downloaded CRL signatures against the issuing CA
    /// certificate before trusting their contents.
    pub verify_crl_signature: bool,

    /// Per-certificate circuit breaker.
    pub breaker: BreakerConfig,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 600,
            grace_period_secs: 86_400,
            retry_delay_secs: 5,
            http_timeout_secs: 10,
            trust_self_signed: false,
            test_ca_patterns: Vec::new(),
            ocsp_responder_override: None,
            crl_url_override: None,
            ca_issuer_override: None,
            verify_crl_signature: true,
            breaker: BreakerConfig::default(),
        }
    }
}

impl RevocationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.interval_secs == 0 {
            return Err(ConfigError::invalid(
                "revocation.interval_secs",
                "must be at least 1",
            ));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "revocation.http_timeout_secs",
                "outbound calls must carry a bounded timeout",
            ));
        }
        self.breaker.validate()
    }
}

/// Circuit-breaker thresholds for a single certificate's check endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BreakerConfig {
    /// Failures within the rolling window that open the breaker.
    pub failure_threshold: u32,

    /// Rolling window over which failures are counted, in seconds.
    pub window_secs: u64,

    /// How long an open breaker short-circuits checks before allowing a
    /// half-open probe, in seconds.
    pub reset_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 600,
            reset_secs: 1_800,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "revocation.breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.window_secs == 0 {
            return Err(ConfigError::invalid(
                "revocation.breaker.window_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
