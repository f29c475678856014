//! Error taxonomy for the protocol engine.
//!
//! Four families, per the trust boundary they sit on:
//!
//! - [`InternalError`]: our own misconfiguration. Never the peer's fault,
//!   always fatal to the operation, logged at error level.
//! - [`ExternalError`]: malformed, forged, expired, or otherwise
//!   untrustworthy peer input. Expected under adversarial conditions,
//!   logged at warn/info, surfaced to the user as a generic failure.
//! - [`ValidationFailure`]: a named sub-kind of [`ExternalError`] — exactly
//!   one check tripped, and the name is recorded for audit.
//! - [`RevocationCheckError`]: a third-party infrastructure hiccup. Handled
//!   by the circuit-breaker/grace-period policy, never surfaced per-request.

use thiserror::Error;

/// A local fault: bad keystore, missing metadata, unreachable code paths.
///
/// Internal errors are never attributable to the peer.
#[derive(Debug, Error)]
pub enum InternalError {
    /// No destination, binding, or credential could be resolved from
    /// configuration or metadata.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A credential could not be loaded or used.
    #[error("credential error: {0}")]
    Credential(String),

    /// An outbound message could not be serialized or signed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Untrustworthy input from the peer side of the federation.
#[derive(Debug, Error)]
pub enum ExternalError {
    /// The payload could not be decoded, inflated, or parsed at all.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A well-formed message failed a specific validation check.
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
}

/// The specific check that rejected a message, named for audit purposes.
///
/// The variant is logged and reported to the audit sink; the user-facing
/// message is always [`EngineError::public_message`], which deliberately
/// does not reveal which check tripped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    /// Status code was not Success (and not an allowed passive refusal).
    #[error("status mismatch: {status} (sub-status {sub_status:?})")]
    StatusMismatch {
        status: String,
        sub_status: Option<String>,
    },

    /// The message's Destination does not equal the expected endpoint.
    #[error("destination mismatch: expected {expected}, got {actual}")]
    DestinationMismatch { expected: String, actual: String },

    /// No usable issuer on an unsolicited response, or an issuer that is
    /// not a known federation peer.
    #[error("issuer mismatch: {actual:?}")]
    IssuerMismatch { actual: Option<String> },

    /// NotOnOrAfter (conditions or logout request) is in the past.
    #[error("message or assertion has expired")]
    Expired,

    /// NotBefore is in the future beyond the allowed clock skew.
    #[error("message or assertion is not yet valid")]
    NotYetValid,

    /// Our entity ID appears in no audience restriction.
    #[error("audience mismatch: {expected} not present in any restriction")]
    AudienceMismatch { expected: String },

    /// Bearer subject-confirmation Recipient differs from the ACS URL.
    #[error("recipient mismatch: expected {expected}, got {actual:?}")]
    RecipientMismatch {
        expected: String,
        actual: Option<String>,
    },

    /// An already-consumed assertion ID, or an InResponseTo with no
    /// outstanding correlation entry (the at-most-once property tripped:
    /// either the request was never issued or its response was already
    /// accepted).
    #[error("replay detected for id {id}")]
    ReplayDetected { id: String },

    /// No trusted signature on either the response or the assertion, or a
    /// signature that failed structural or cryptographic verification.
    #[error("signature invalid")]
    SignatureInvalid,

    /// The encrypted assertion could not be decrypted with any configured
    /// credential, or a plaintext assertion arrived where encryption was
    /// mandated.
    #[error("decryption failed")]
    DecryptionFailed,
}

impl ValidationFailure {
    /// Stable audit identifier for the failed check.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusMismatch { .. } => "status-mismatch",
            Self::DestinationMismatch { .. } => "destination-mismatch",
            Self::IssuerMismatch { .. } => "issuer-mismatch",
            Self::Expired => "expired",
            Self::NotYetValid => "not-yet-valid",
            Self::AudienceMismatch { .. } => "audience-mismatch",
            Self::RecipientMismatch { .. } => "recipient-mismatch",
            Self::ReplayDetected { .. } => "replay-detected",
            Self::SignatureInvalid => "signature-invalid",
            Self::DecryptionFailed => "decryption-failed",
        }
    }
}

/// A revocation-infrastructure failure: OCSP responder unreachable, CRL
/// download failed, breaker open. Not a revocation finding.
#[derive(Debug, Error)]
pub enum RevocationCheckError {
    #[error("network failure talking to revocation infrastructure: {0}")]
    Network(String),

    /// No OCSP responder or CRL distribution point could be resolved for
    /// the certificate, from configuration or its extensions.
    #[error("no revocation source available for certificate")]
    NoSource,

    /// The per-certificate circuit breaker is open; the check was
    /// short-circuited without network I/O.
    #[error("circuit breaker open (retry in {retry_after_secs}s)")]
    BreakerOpen { retry_after_secs: u64 },

    /// The responder or CRL answered, but the answer could not be
    /// cryptographically evaluated.
    #[error("revocation response could not be evaluated: {0}")]
    Crypto(String),
}

/// Top-level error for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Internal(#[from] InternalError),

    #[error(transparent)]
    External(#[from] ExternalError),
}

impl EngineError {
    /// The generic user-facing message.
    ///
    /// Deliberately identical for every failure so a caller relaying it
    /// cannot be used as an oracle for which check rejected the message.
    pub fn public_message(&self) -> &'static str {
        "authentication failed"
    }

    /// Audit identifier: the validation kind when one tripped, otherwise
    /// the error family.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Internal(_) => "internal",
            Self::External(ExternalError::MalformedMessage(_)) => "malformed-message",
            Self::External(ExternalError::Validation(v)) => v.kind(),
        }
    }
}

impl From<ValidationFailure> for EngineError {
    fn from(failure: ValidationFailure) -> Self {
        Self::External(ExternalError::Validation(failure))
    }
}
