//! Certificate revocation checking.
//!
//! IdP signing certificates are re-validated on a background schedule
//! and on demand. Checks depend on third-party OCSP/CRL infrastructure:
//! failing closed on any error would turn every network blip into a
//! federation-wide outage, and failing open forever would make
//! revocation checking pointless. The middle ground is a per-certificate
//! circuit breaker plus a remain-valid grace period — a certificate
//! keeps its last known-good status while checks fail, until the grace
//! period from its last successful validation has elapsed. A definitive
//! revocation verdict overrides the grace period immediately.

mod breaker;
mod fetch;

use std::sync::{Arc, Mutex};

pub use breaker::*;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
pub use fetch::*;
use openssl::x509::X509;
use tokio_util::sync::CancellationToken;

use crate::config::RevocationConfig;
use crate::metadata::MetadataStore;

#[derive(Debug, Clone, Copy)]
struct StateFields {
    last_success: Option<DateTime<Utc>>,
    valid: bool,
    first_seen: DateTime<Utc>,
}

/// Per-certificate revocation state: last successful validation, the
/// current valid/invalid flag, and the circuit breaker. Created on first
/// sight of a certificate, dropped only on metadata reload.
#[derive(Debug)]
pub struct RevocationState {
    fields: Mutex<StateFields>,
    breaker: CircuitBreaker,
}

impl RevocationState {
    fn new(config: &RevocationConfig, now: DateTime<Utc>) -> Self {
        Self {
            fields: Mutex::new(StateFields {
                last_success: None,
                valid: true,
                first_seen: now,
            }),
            breaker: CircuitBreaker::new(&config.breaker),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.fields.lock().expect("state lock poisoned").valid
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.fields.lock().expect("state lock poisoned").last_success
    }

    fn snapshot(&self) -> StateFields {
        *self.fields.lock().expect("state lock poisoned")
    }

    fn record_success(&self, now: DateTime<Utc>) {
        let mut fields = self.fields.lock().expect("state lock poisoned");
        fields.last_success = Some(now);
        fields.valid = true;
    }

    fn mark_invalid(&self) {
        self.fields.lock().expect("state lock poisoned").valid = false;
    }
}

/// The revocation checker: per-certificate state plus the status source.
pub struct RevocationChecker {
    config: RevocationConfig,
    source: Box<dyn StatusSource>,
    states: DashMap<String, Arc<RevocationState>>,
}

impl RevocationChecker {
    /// Production checker with the HTTP OCSP/CRL source.
    pub fn new(config: RevocationConfig) -> Self {
        let source = HttpStatusSource::new(config.clone());
        Self::with_source(config, Box::new(source))
    }

    /// Checker with a custom status source.
    pub fn with_source(config: RevocationConfig, source: Box<dyn StatusSource>) -> Self {
        Self {
            config,
            source,
            states: DashMap::new(),
        }
    }

    /// Check every certificate and return the currently-valid set.
    ///
    /// Certificates are checked sequentially; per-certificate breakers
    /// keep an unreachable endpoint from being hammered, and the grace
    /// period keeps transient infrastructure failures from invalidating
    /// a working federation.
    pub async fn check_all(&self, certificates: &[X509]) -> Vec<X509> {
        let mut valid = Vec::new();
        for certificate in certificates {
            if self.check_one(certificate).await {
                valid.push(certificate.clone());
            }
        }
        valid
    }

    /// Read the current validity of the given certificates without any
    /// network traffic. A certificate never yet checked is treated as
    /// valid until its first check completes, consistent with the
    /// grace-period posture.
    pub fn filter_valid(&self, certificates: &[X509]) -> Vec<X509> {
        certificates
            .iter()
            .filter(|certificate| {
                let Some(key) = fingerprint(certificate) else {
                    return false;
                };
                self.states
                    .get(&key)
                    .map(|state| state.is_valid())
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Drop all per-certificate state (metadata reload).
    pub fn reset(&self) {
        self.states.clear();
    }

    async fn check_one(&self, certificate: &X509) -> bool {
        if !self.config.enabled {
            return true;
        }
        let Some(key) = fingerprint(certificate) else {
            tracing::error!("certificate cannot be fingerprinted, excluding from valid set");
            return false;
        };
        let now = Utc::now();
        let state = self.state_for(&key, now);

        if self.config.trust_self_signed && is_self_signed(certificate) {
            tracing::debug!(fingerprint = %key, "self-signed certificate trusted by configuration");
            state.record_success(now);
            return true;
        }
        if self.matches_test_ca(certificate) {
            tracing::debug!(fingerprint = %key, "certificate matches test-CA allowlist");
            state.record_success(now);
            return true;
        }

        if let Err(e) = state.breaker.check(now) {
            tracing::warn!(fingerprint = %key, error = %e, "revocation check short-circuited");
            return self.apply_failure_policy(&key, &state, now);
        }

        match self.source.check(certificate).await {
            Ok(CertStatus::Good) => {
                state.breaker.record_success(now);
                state.record_success(now);
                true
            }
            Ok(CertStatus::Revoked) => {
                // A definitive finding, not a failure: the infrastructure
                // worked, and the grace period does not apply.
                state.breaker.record_success(now);
                state.mark_invalid();
                tracing::warn!(fingerprint = %key, "certificate is revoked");
                false
            }
            Err(e) => {
                state.breaker.record_failure(now);
                tracing::warn!(fingerprint = %key, error = %e, "revocation check failed");
                self.apply_failure_policy(&key, &state, now)
            }
        }
    }

    /// On any failure path, keep the certificate's previous validity
    /// while inside the grace window measured from the last successful
    /// validation (or first sight, for a certificate never validated);
    /// after that, mark invalid.
    fn apply_failure_policy(
        &self,
        key: &str,
        state: &RevocationState,
        now: DateTime<Utc>,
    ) -> bool {
        let grace = Duration::seconds(self.config.grace_period_secs as i64);
        let fields = state.snapshot();
        let reference = fields.last_success.unwrap_or(fields.first_seen);

        if now - reference < grace {
            if fields.valid {
                tracing::warn!(
                    fingerprint = %key,
                    "revocation check failing, certificate kept valid within grace period"
                );
                return true;
            }
            return false;
        }

        tracing::warn!(
            fingerprint = %key,
            grace_secs = self.config.grace_period_secs,
            "grace period elapsed without successful re-validation, marking invalid"
        );
        state.mark_invalid();
        false
    }

    fn state_for(&self, key: &str, now: DateTime<Utc>) -> Arc<RevocationState> {
        self.states
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(RevocationState::new(&self.config, now)))
            .clone()
    }

    fn matches_test_ca(&self, certificate: &X509) -> bool {
        if self.config.test_ca_patterns.is_empty() {
            return false;
        }
        let subject = subject_string(certificate);
        self.config
            .test_ca_patterns
            .iter()
            .any(|pattern| subject.contains(pattern.as_str()))
    }
}

fn fingerprint(certificate: &X509) -> Option<String> {
    certificate
        .digest(openssl::hash::MessageDigest::sha256())
        .ok()
        .map(hex::encode)
}

fn is_self_signed(certificate: &X509) -> bool {
    certificate
        .public_key()
        .and_then(|key| certificate.verify(&key))
        .unwrap_or(false)
}

fn subject_string(certificate: &X509) -> String {
    certificate
        .subject_name()
        .entries()
        .filter_map(|entry| {
            let name = entry.object().nid().short_name().ok()?;
            let value = entry.data().as_utf8().ok()?;
            Some(format!("{name}={value}"))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Start the periodic revocation worker.
///
/// Runs an immediate pass (the on-demand startup check), then re-checks
/// every `interval_secs`. Cancel the token to stop; the task finishes
/// its in-flight pass and exits cleanly.
pub fn start_revocation_worker(
    checker: Arc<RevocationChecker>,
    metadata: MetadataStore,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval_secs = checker.config.interval_secs.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("revocation worker stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let certificates = metadata.all_signing_certificates();
                    if certificates.is_empty() {
                        continue;
                    }
                    let valid = checker.check_all(&certificates).await;
                    tracing::debug!(
                        total = certificates.len(),
                        valid = valid.len(),
                        "revocation pass complete"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::credentials::test_support::generate_keypair;
    use crate::error::RevocationCheckError;

    /// Scripted status source: plays back a fixed sequence of results,
    /// then repeats the last one. The shared counter tells tests how
    /// often the network would have been touched.
    struct ScriptedSource {
        script: Vec<Result<CertStatus, ()>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn check(&self, _certificate: &X509) -> Result<CertStatus, RevocationCheckError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .get(index)
                .or_else(|| self.script.last())
                .copied()
                .unwrap_or(Err(()));
            step.map_err(|_| RevocationCheckError::Network("scripted failure".into()))
        }
    }

    fn scripted(
        script: Vec<Result<CertStatus, ()>>,
    ) -> (Box<ScriptedSource>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(ScriptedSource {
                script,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    fn config() -> RevocationConfig {
        RevocationConfig {
            retry_delay_secs: 0,
            ..RevocationConfig::default()
        }
    }

    fn cert() -> X509 {
        generate_keypair("idp.example.com").1
    }

    #[tokio::test]
    async fn good_certificate_is_in_the_valid_set() {
        let (source, _) = scripted(vec![Ok(CertStatus::Good)]);
        let checker = RevocationChecker::with_source(config(), source);
        let certificate = cert();
        let valid = checker.check_all(std::slice::from_ref(&certificate)).await;
        assert_eq!(valid.len(), 1);
        assert_eq!(checker.filter_valid(&[certificate]).len(), 1);
    }

    #[tokio::test]
    async fn revoked_certificate_is_excluded_immediately_despite_grace() {
        let mut cfg = config();
        cfg.grace_period_secs = 86_400;
        let (source, _) = scripted(vec![Ok(CertStatus::Good), Ok(CertStatus::Revoked)]);
        let checker = RevocationChecker::with_source(cfg, source);
        let certificate = cert();

        let valid = checker.check_all(std::slice::from_ref(&certificate)).await;
        assert_eq!(valid.len(), 1);

        // Second pass: definitive revocation. Grace does not apply.
        let valid = checker.check_all(std::slice::from_ref(&certificate)).await;
        assert!(valid.is_empty());
        assert!(checker.filter_valid(&[certificate]).is_empty());
    }

    #[tokio::test]
    async fn check_failures_keep_validity_within_grace() {
        let mut cfg = config();
        cfg.grace_period_secs = 3_600;
        let (source, _) = scripted(vec![Ok(CertStatus::Good), Err(()), Err(())]);
        let checker = RevocationChecker::with_source(cfg, source);
        let certificate = cert();

        assert_eq!(
            checker.check_all(std::slice::from_ref(&certificate)).await.len(),
            1
        );
        // Failing checks inside the grace window: still valid.
        assert_eq!(
            checker.check_all(std::slice::from_ref(&certificate)).await.len(),
            1
        );
        assert_eq!(
            checker.check_all(std::slice::from_ref(&certificate)).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn grace_elapsed_marks_invalid() {
        let mut cfg = config();
        // Zero grace: the first failure after a success already falls
        // outside the window.
        cfg.grace_period_secs = 0;
        let (source, _) = scripted(vec![Ok(CertStatus::Good), Err(())]);
        let checker = RevocationChecker::with_source(cfg, source);
        let certificate = cert();

        assert_eq!(
            checker.check_all(std::slice::from_ref(&certificate)).await.len(),
            1
        );
        assert!(
            checker
                .check_all(std::slice::from_ref(&certificate))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_touching_the_network() {
        let mut cfg = config();
        cfg.grace_period_secs = 86_400;
        cfg.breaker.failure_threshold = 2;
        cfg.breaker.reset_secs = 3_600;
        let (source, calls) = scripted(vec![Err(())]);
        let checker = RevocationChecker::with_source(cfg, source);
        let certificate = cert();

        // Two failing passes trip the breaker.
        checker.check_all(std::slice::from_ref(&certificate)).await;
        checker.check_all(std::slice::from_ref(&certificate)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Further passes short-circuit: zero additional network calls.
        checker.check_all(std::slice::from_ref(&certificate)).await;
        let valid = checker.check_all(std::slice::from_ref(&certificate)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Never-validated certificate stays valid within the grace
        // posture measured from first sight.
        assert_eq!(valid.len(), 1);
    }

    #[tokio::test]
    async fn breaker_reset_admits_a_probe() {
        let mut cfg = config();
        cfg.breaker.failure_threshold = 1;
        cfg.breaker.reset_secs = 0;
        let (source, calls) = scripted(vec![Err(()), Ok(CertStatus::Good)]);
        let checker = RevocationChecker::with_source(cfg, source);
        let certificate = cert();

        checker.check_all(std::slice::from_ref(&certificate)).await;
        // Breaker opened, but reset_secs=0 admits the next probe, which
        // succeeds and closes it.
        let valid = checker.check_all(std::slice::from_ref(&certificate)).await;
        assert_eq!(valid.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn self_signed_escape_hatch_skips_network_checks() {
        let mut cfg = config();
        cfg.trust_self_signed = true;
        let (source, calls) = scripted(vec![Err(())]);
        let checker = RevocationChecker::with_source(cfg, source);
        // Test certificates are self-signed.
        let certificate = cert();

        let valid = checker.check_all(std::slice::from_ref(&certificate)).await;
        assert_eq!(valid.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ca_allowlist_skips_network_checks() {
        let mut cfg = config();
        cfg.test_ca_patterns = vec!["CN=idp.example.com".into()];
        let (source, calls) = scripted(vec![Err(())]);
        let checker = RevocationChecker::with_source(cfg, source);
        let certificate = cert();

        let valid = checker.check_all(std::slice::from_ref(&certificate)).await;
        assert_eq!(valid.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_checker_trusts_everything() {
        let mut cfg = config();
        cfg.enabled = false;
        let (source, calls) = scripted(vec![Err(())]);
        let checker = RevocationChecker::with_source(cfg, source);
        let certificate = cert();
        assert_eq!(
            checker.check_all(std::slice::from_ref(&certificate)).await.len(),
            1
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reset_drops_state() {
        let (source, _) = scripted(vec![Ok(CertStatus::Revoked)]);
        let checker = RevocationChecker::with_source(config(), source);
        let certificate = cert();
        checker.check_all(std::slice::from_ref(&certificate)).await;
        assert!(
            checker
                .filter_valid(std::slice::from_ref(&certificate))
                .is_empty()
        );

        checker.reset();
        // Unknown again: valid until first check.
        assert_eq!(
            checker.filter_valid(std::slice::from_ref(&certificate)).len(),
            1
        );
    }

    #[tokio::test]
    async fn worker_runs_startup_pass_and_stops_cleanly() {
        let (source, calls) = scripted(vec![Ok(CertStatus::Good)]);
        let checker = Arc::new(RevocationChecker::with_source(config(), source));
        let metadata = MetadataStore::new();
        let (_, certificate) = generate_keypair("idp.example.com");
        metadata.insert(crate::metadata::IdpDescriptor {
            entity_id: "https://idp.example.com".into(),
            sso_endpoints: vec![],
            slo_endpoints: vec![],
            signing_certificates: vec![certificate.clone()],
        });

        let shutdown = CancellationToken::new();
        let handle = start_revocation_worker(checker.clone(), metadata, shutdown.clone());

        // The immediate first tick runs the startup pass.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(checker.filter_valid(&[certificate]).len(), 1);

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop after cancellation")
            .unwrap();
    }
}
