//! # trajan
//!
//! A SAML 2.0 Service Provider protocol engine: it authenticates end
//! users against an external Identity Provider in a federated
//! single-sign-on scheme and tears sessions down via single logout.
//!
//! The crate owns the protocol and security core — message construction
//! and signing, binding codecs, inbound validation, assertion
//! decryption, replay protection, and failure-tolerant certificate
//! revocation checking. HTTP routing, configuration loading, metadata
//! XML parsing, and session persistence are the embedding application's
//! concern; the engine consumes already-parsed metadata and reports
//! outcomes to an audit sink.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trajan::{
//!     AuthnOptions, Credential, CredentialRole, CredentialStore, EngineConfig,
//!     MetadataStore, SpEngine, TracingAuditSink,
//! };
//!
//! let credentials = CredentialStore::new(
//!     Credential::from_pem(&key_pem, &cert_pem, CredentialRole::OwnPrimary)?,
//!     None,
//! );
//! let metadata = MetadataStore::new();
//! metadata.insert(parsed_idp_descriptor);
//!
//! let engine = SpEngine::new(config, credentials, metadata, Arc::new(TracingAuditSink))?;
//! let shutdown = tokio_util::sync::CancellationToken::new();
//! let _worker = engine.start_revocation_worker(shutdown.clone());
//!
//! let start = engine.login_start(None, Some("/dashboard"), &AuthnOptions::default())?;
//! ```

pub mod binding;
pub mod builder;
pub mod config;
pub mod credentials;
pub mod decrypt;
pub mod engine;
pub mod error;
pub mod messages;
pub mod metadata;
pub mod replay;
pub mod revocation;
pub mod signature;
pub mod validation;
pub mod xml;

#[cfg(test)]
mod tests;

pub use builder::{AuthnOptions, RequestBuilder};
pub use config::{BreakerConfig, EngineConfig, ReplayConfig, RevocationConfig, SpConfig};
pub use credentials::{Credential, CredentialRole, CredentialStore};
pub use engine::{
    AuditSink, AuthenticatedSubject, Dispatch, LoginOutcome, LoginStart, LogoutConsume,
    ProtocolAction, SpEngine, TracingAuditSink,
};
pub use error::{
    EngineError, ExternalError, InternalError, RevocationCheckError, ValidationFailure,
};
pub use metadata::{Endpoint, IdpDescriptor, MetadataStore, SamlBinding};
pub use revocation::{CertStatus, RevocationChecker, StatusSource, start_revocation_worker};
pub use validation::{ResponseOutcome, SessionSnapshot, ValidatedAssertion};
