//! The engine: one explicitly constructed value wiring every service.
//!
//! There are no process-wide globals and no service locators — the
//! embedding application constructs an [`SpEngine`] with its config,
//! credentials, parsed metadata, and an audit sink, and passes it by
//! reference into its HTTP dispatch layer. The engine exposes one
//! operation per protocol action and owns none of the HTTP routing,
//! cookie handling, or persistence around them.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::binding::{self, PostForm};
use crate::builder::{AuthnOptions, RequestBuilder};
use crate::config::EngineConfig;
use crate::credentials::CredentialStore;
use crate::error::{EngineError, ExternalError, InternalError, ValidationFailure};
use crate::messages::{Assertion, LogoutRequest, LogoutResponse, Status};
use crate::metadata::{IdpDescriptor, MetadataStore, SamlBinding, sp_metadata_xml};
use crate::replay::{ConsumedAssertionSet, CorrelationRegistry};
use crate::revocation::{RevocationChecker, start_revocation_worker};
use crate::signature::verify_query;
use crate::validation::{
    ResponseOutcome, SessionSnapshot, ValidationContext, validate_logout_request,
    validate_logout_response, validate_response,
};
use crate::xml::{Element, ns, parse_document};

/// The protocol actions the engine handles for the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolAction {
    LoginStart,
    AssertionConsume,
    LogoutStart,
    LogoutConsume,
    LogoutResponseConsume,
}

impl ProtocolAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginStart => "login-start",
            Self::AssertionConsume => "assertion-consume",
            Self::LogoutStart => "logout-start",
            Self::LogoutConsume => "logout-consume",
            Self::LogoutResponseConsume => "logout-response-consume",
        }
    }
}

/// Where the engine reports operation outcomes. The embedding
/// application owns formatting and transport.
pub trait AuditSink: Send + Sync {
    fn record(&self, action: ProtocolAction, outcome: &str, message_id: Option<&str>);
}

/// Default sink: structured log records.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, action: ProtocolAction, outcome: &str, message_id: Option<&str>) {
        tracing::info!(
            action = action.as_str(),
            outcome,
            message_id,
            "protocol action"
        );
    }
}

/// How a login-start or logout-start message leaves the process.
#[derive(Debug)]
pub enum Dispatch {
    /// Redirect the browser to this URL.
    Redirect(Url),
    /// Render this auto-submitting POST form.
    Post(PostForm),
}

/// A started login flow.
#[derive(Debug)]
pub struct LoginStart {
    pub dispatch: Dispatch,
    pub request_id: String,
}

/// The authenticated subject handed to the application layer after full
/// validation, with configured attribute mappings applied.
#[derive(Debug)]
pub struct AuthenticatedSubject {
    /// Identity: the configured identity attribute when present,
    /// otherwise the subject NameID.
    pub identity: String,
    pub name_id: String,
    pub name_id_format: Option<String>,
    pub issuer: String,
    pub session_index: Option<String>,
    pub authn_context_class: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub groups: Vec<String>,
    pub assertion: Assertion,
}

/// Terminal outcome of consuming a login response.
#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated(Box<AuthenticatedSubject>),
    /// The IdP refused passive authentication; not an error.
    PassiveRefused,
}

/// Outcome of consuming an IdP-initiated LogoutRequest.
#[derive(Debug)]
pub struct LogoutConsume {
    /// Acknowledge the IdP by dispatching this LogoutResponse.
    pub dispatch: Dispatch,
    /// Whether the named session matched and should be torn down.
    pub tear_down_session: bool,
    pub request: LogoutRequest,
}

/// The SAML SP protocol engine.
pub struct SpEngine {
    config: EngineConfig,
    credentials: CredentialStore,
    metadata: MetadataStore,
    builder: RequestBuilder,
    correlation: Arc<CorrelationRegistry>,
    consumed: Arc<ConsumedAssertionSet>,
    revocation: Arc<RevocationChecker>,
    audit: Arc<dyn AuditSink>,
}

impl SpEngine {
    pub fn new(
        config: EngineConfig,
        credentials: CredentialStore,
        metadata: MetadataStore,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, InternalError> {
        config
            .validate()
            .map_err(|e| InternalError::Configuration(e.to_string()))?;
        let correlation = Arc::new(CorrelationRegistry::new(&config.replay));
        let consumed = Arc::new(ConsumedAssertionSet::new(&config.replay));
        let revocation = Arc::new(RevocationChecker::new(config.revocation.clone()));
        let builder = RequestBuilder::new(config.sp.clone(), correlation.clone());
        Ok(Self {
            config,
            credentials,
            metadata,
            builder,
            correlation,
            consumed,
            revocation,
            audit,
        })
    }

    /// Swap in a custom revocation checker (tests, alternate sources).
    pub fn with_revocation_checker(mut self, checker: RevocationChecker) -> Self {
        self.revocation = Arc::new(checker);
        self
    }

    /// Start the periodic revocation worker. Returns the task handle;
    /// cancel the token for a clean stop.
    pub fn start_revocation_worker(
        &self,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        start_revocation_worker(self.revocation.clone(), self.metadata.clone(), shutdown)
    }

    /// Run an on-demand revocation pass over all known certificates.
    pub async fn check_revocation_now(&self) {
        let certificates = self.metadata.all_signing_certificates();
        if !certificates.is_empty() {
            self.revocation.check_all(&certificates).await;
        }
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Our SP metadata document for IdP auto-configuration.
    pub fn sp_metadata(&self) -> Result<String, InternalError> {
        sp_metadata_xml(&self.config.sp, Some(self.credentials.primary()))
    }

    // ── login-start ─────────────────────────────────────────────────

    /// Begin an SP-initiated login against the given (or sole) IdP.
    pub fn login_start(
        &self,
        idp_entity_id: Option<&str>,
        relay_state: Option<&str>,
        options: &AuthnOptions,
    ) -> Result<LoginStart, EngineError> {
        let idp = self.resolve_idp(idp_entity_id)?;
        let (request, binding) = self.builder.build_authn_request(&idp, options)?;
        let signing = self.signing_credential();

        let dispatch = match binding {
            SamlBinding::HttpRedirect => Dispatch::Redirect(binding::encode_redirect(
                &request,
                &request.destination,
                relay_state,
                signing,
            )?),
            _ => Dispatch::Post(binding::encode_post(
                &request,
                &request.destination,
                relay_state,
                signing,
            )?),
        };

        self.audit
            .record(ProtocolAction::LoginStart, "dispatched", Some(&request.id));
        Ok(LoginStart {
            dispatch,
            request_id: request.id,
        })
    }

    // ── assertion-consume ───────────────────────────────────────────

    /// Consume a POST-binding login response at the ACS endpoint.
    pub fn assertion_consume(
        &self,
        saml_response_b64: &str,
        allow_passive: bool,
    ) -> Result<LoginOutcome, EngineError> {
        let result = self.assertion_consume_inner(saml_response_b64, allow_passive);
        match &result {
            Ok(LoginOutcome::Authenticated(subject)) => self.audit.record(
                ProtocolAction::AssertionConsume,
                "accepted",
                Some(&subject.assertion.id),
            ),
            Ok(LoginOutcome::PassiveRefused) => {
                self.audit
                    .record(ProtocolAction::AssertionConsume, "passive-refused", None)
            }
            Err(e) => self
                .audit
                .record(ProtocolAction::AssertionConsume, e.kind(), None),
        }
        result
    }

    fn assertion_consume_inner(
        &self,
        saml_response_b64: &str,
        allow_passive: bool,
    ) -> Result<LoginOutcome, EngineError> {
        let xml = binding::decode_post(saml_response_b64)?;
        let trusted = self.trusted_certificates();
        let ctx = ValidationContext {
            sp: &self.config.sp,
            correlation: &self.correlation,
            consumed: &self.consumed,
            credentials: &self.credentials,
            trusted_certificates: &trusted,
            allow_passive,
        };

        match validate_response(&xml, &ctx)? {
            ResponseOutcome::PassiveRefused => Ok(LoginOutcome::PassiveRefused),
            ResponseOutcome::Accepted(validated) => {
                let subject = self.map_subject(*validated)?;
                Ok(LoginOutcome::Authenticated(Box::new(subject)))
            }
        }
    }

    fn map_subject(
        &self,
        validated: crate::validation::ValidatedAssertion,
    ) -> Result<AuthenticatedSubject, EngineError> {
        let assertion = validated.assertion;
        let sp = &self.config.sp;

        let name_id = assertion
            .subject_name_id
            .clone()
            .ok_or_else(|| ExternalError::MalformedMessage("assertion has no NameID".into()))?;

        let single = |attribute_name: &Option<String>| -> Option<String> {
            attribute_name
                .as_deref()
                .and_then(|name| assertion.attribute(name))
                .and_then(|attr| attr.values.first().cloned())
        };

        let identity = single(&sp.identity_attribute).unwrap_or_else(|| name_id.value.clone());
        let email = single(&sp.email_attribute);
        let display_name = single(&sp.name_attribute);
        let groups = sp
            .groups_attribute
            .as_deref()
            .and_then(|name| assertion.attribute(name))
            .map(|attr| attr.values.clone())
            .unwrap_or_default();

        let session_index = assertion.session_index().map(str::to_owned);
        let authn_context_class = assertion
            .authn_statements
            .iter()
            .find_map(|s| s.context_class_ref.clone());

        Ok(AuthenticatedSubject {
            identity,
            name_id: name_id.value,
            name_id_format: name_id.format,
            issuer: validated.issuer,
            session_index,
            authn_context_class,
            email,
            display_name,
            groups,
            assertion,
        })
    }

    // ── logout-start ────────────────────────────────────────────────

    /// Begin SP-initiated single logout for the given session.
    pub fn logout_start(
        &self,
        idp_entity_id: Option<&str>,
        session: &SessionSnapshot,
        relay_state: Option<&str>,
    ) -> Result<Dispatch, EngineError> {
        let idp = self.resolve_idp(idp_entity_id)?;
        let (request, binding) = self.builder.build_logout_request(&idp, session)?;
        let signing = self.signing_credential();
        let destination = request.destination.clone().unwrap_or_default();

        let dispatch = match binding {
            SamlBinding::HttpRedirect => Dispatch::Redirect(binding::encode_redirect(
                &request,
                &destination,
                relay_state,
                signing,
            )?),
            _ => Dispatch::Post(binding::encode_post(
                &request,
                &destination,
                relay_state,
                signing,
            )?),
        };

        self.audit
            .record(ProtocolAction::LogoutStart, "dispatched", Some(&request.id));
        Ok(dispatch)
    }

    // ── logout-consume (IdP-initiated) ──────────────────────────────

    /// Consume an IdP-initiated LogoutRequest from the Redirect binding
    /// and produce the LogoutResponse acknowledging it.
    pub fn logout_consume(
        &self,
        raw_query: &str,
        session: Option<&SessionSnapshot>,
    ) -> Result<LogoutConsume, EngineError> {
        let decoded = binding::decode_redirect(raw_query)?;
        let doc = parse_document(&decoded.xml)
            .map_err(|e| ExternalError::MalformedMessage(e.to_string()))?;
        let idp = self.peer_for_message(&doc)?;
        let trusted = self.trusted_certificates_for(&idp);

        if let (Some(payload), Some(signature), Some(sig_alg)) = (
            decoded.signed_payload.as_deref(),
            decoded.signature.as_deref(),
            decoded.sig_alg.as_deref(),
        ) {
            let keys: Vec<_> = trusted
                .iter()
                .filter_map(|cert| cert.public_key().ok())
                .collect();
            if !verify_query(payload, sig_alg, signature, &keys) {
                self.audit.record(
                    ProtocolAction::LogoutConsume,
                    "signature-invalid",
                    None,
                );
                return Err(ValidationFailure::SignatureInvalid.into());
            }
        }

        let ctx = ValidationContext {
            sp: &self.config.sp,
            correlation: &self.correlation,
            consumed: &self.consumed,
            credentials: &self.credentials,
            trusted_certificates: &trusted,
            allow_passive: false,
        };
        let outcome = validate_logout_request(&doc, &ctx, session)?;

        let (response, binding_kind) =
            self.builder
                .build_logout_response(&idp, &outcome.request.id, Status::success())?;
        let signing = self.signing_credential();
        let destination = response.destination.clone().unwrap_or_default();
        let dispatch = match binding_kind {
            SamlBinding::HttpRedirect => Dispatch::Redirect(binding::encode_redirect(
                &response,
                &destination,
                decoded.relay_state.as_deref(),
                signing,
            )?),
            _ => Dispatch::Post(binding::encode_post(
                &response,
                &destination,
                decoded.relay_state.as_deref(),
                signing,
            )?),
        };

        self.audit.record(
            ProtocolAction::LogoutConsume,
            if outcome.matches_session {
                "accepted"
            } else {
                "acknowledged-unknown-session"
            },
            Some(&outcome.request.id),
        );
        Ok(LogoutConsume {
            dispatch,
            tear_down_session: outcome.matches_session,
            request: outcome.request,
        })
    }

    /// Consume a SOAP-bound LogoutRequest (back-channel logout) and
    /// return the SOAP envelope answering it.
    pub fn logout_consume_soap(
        &self,
        envelope_xml: &str,
        session: Option<&SessionSnapshot>,
    ) -> Result<(String, bool), EngineError> {
        let message = binding::decode_soap(envelope_xml)?;
        let idp = self.peer_for_message(&message)?;
        let trusted = self.trusted_certificates_for(&idp);

        let ctx = ValidationContext {
            sp: &self.config.sp,
            correlation: &self.correlation,
            consumed: &self.consumed,
            credentials: &self.credentials,
            trusted_certificates: &trusted,
            allow_passive: false,
        };
        let outcome = validate_logout_request(&message, &ctx, session)?;

        let (response, _) =
            self.builder
                .build_logout_response(&idp, &outcome.request.id, Status::success())?;
        let envelope = binding::encode_soap(&response);

        self.audit.record(
            ProtocolAction::LogoutConsume,
            "acknowledged-soap",
            Some(&outcome.request.id),
        );
        Ok((envelope, outcome.matches_session))
    }

    // ── logout-response-consume ─────────────────────────────────────

    /// Consume the LogoutResponse answering our SP-initiated
    /// LogoutRequest.
    pub fn logout_response_consume(
        &self,
        raw_query: &str,
    ) -> Result<LogoutResponse, EngineError> {
        let decoded = binding::decode_redirect(raw_query)?;
        let doc = parse_document(&decoded.xml)
            .map_err(|e| ExternalError::MalformedMessage(e.to_string()))?;
        let idp = self.peer_for_message(&doc)?;
        let trusted = self.trusted_certificates_for(&idp);

        if let (Some(payload), Some(signature), Some(sig_alg)) = (
            decoded.signed_payload.as_deref(),
            decoded.signature.as_deref(),
            decoded.sig_alg.as_deref(),
        ) {
            let keys: Vec<_> = trusted
                .iter()
                .filter_map(|cert| cert.public_key().ok())
                .collect();
            if !verify_query(payload, sig_alg, signature, &keys) {
                self.audit.record(
                    ProtocolAction::LogoutResponseConsume,
                    "signature-invalid",
                    None,
                );
                return Err(ValidationFailure::SignatureInvalid.into());
            }
        }

        let ctx = ValidationContext {
            sp: &self.config.sp,
            correlation: &self.correlation,
            consumed: &self.consumed,
            credentials: &self.credentials,
            trusted_certificates: &trusted,
            allow_passive: false,
        };
        let response = validate_logout_response(&doc, &ctx);
        match &response {
            Ok(r) => self.audit.record(
                ProtocolAction::LogoutResponseConsume,
                "accepted",
                Some(&r.id),
            ),
            Err(e) => self
                .audit
                .record(ProtocolAction::LogoutResponseConsume, e.kind(), None),
        }
        response
    }

    // ── shared plumbing ─────────────────────────────────────────────

    fn resolve_idp(&self, entity_id: Option<&str>) -> Result<Arc<IdpDescriptor>, InternalError> {
        match entity_id {
            Some(id) => self.metadata.get(id).ok_or_else(|| {
                InternalError::Configuration(format!("no metadata for IdP `{id}`"))
            }),
            None => self.metadata.sole_peer().ok_or_else(|| {
                InternalError::Configuration(
                    "no IdP named and the metadata store holds none or several".into(),
                )
            }),
        }
    }

    /// Resolve the peer a message claims to come from, by its Issuer.
    fn peer_for_message(&self, doc: &Element) -> Result<Arc<IdpDescriptor>, EngineError> {
        let issuer = doc
            .child(ns::SAML, "Issuer")
            .map(|i| i.text())
            .filter(|i| !i.is_empty());
        match issuer {
            Some(issuer) => self.metadata.get(&issuer).ok_or_else(|| {
                ValidationFailure::IssuerMismatch {
                    actual: Some(issuer),
                }
                .into()
            }),
            None => self.resolve_idp(None).map_err(EngineError::from),
        }
    }

    fn signing_credential(&self) -> Option<&crate::credentials::Credential> {
        self.config
            .sp
            .sign_requests
            .then(|| self.credentials.primary())
    }

    /// All currently-valid signing certificates across the federation.
    fn trusted_certificates(&self) -> Vec<openssl::x509::X509> {
        self.revocation
            .filter_valid(&self.metadata.all_signing_certificates())
    }

    fn trusted_certificates_for(&self, idp: &IdpDescriptor) -> Vec<openssl::x509::X509> {
        self.revocation.filter_valid(&idp.signing_certificates)
    }
}
