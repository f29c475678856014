//! Protocol request construction.
//!
//! Every outbound message gets a cryptographically random, 160-bit
//! opaque identifier — never sequential — a UTC issue instant, and our
//! entity ID as issuer. Requests are registered with the correlation
//! registry *before* being handed back: registration must happen-before
//! the message can leave the process, or an unregistered InResponseTo
//! could race validation of a fast response.

use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;

use crate::config::SpConfig;
use crate::error::InternalError;
use crate::messages::{
    AuthnRequest, ContextComparison, LogoutRequest, LogoutResponse, NameId, RequestedContext,
    Status,
};
use crate::metadata::{Endpoint, IdpDescriptor, SamlBinding};
use crate::replay::CorrelationRegistry;
use crate::validation::SessionSnapshot;

/// Options for an authentication request.
#[derive(Debug, Clone, Default)]
pub struct AuthnOptions {
    pub is_passive: bool,
    pub force_authn: bool,
    /// Minimum assurance level the IdP must satisfy (e.g. an NSIS level
    /// URI). Emitted as a RequestedAuthnContext with comparison MINIMUM;
    /// omitted entirely when absent, since absence means "any context
    /// satisfies".
    pub required_level: Option<String>,
    /// Requested attribute profile URI, carried alongside the level.
    pub attribute_profile: Option<String>,
}

/// Builds protocol requests and registers their IDs for correlation.
pub struct RequestBuilder {
    sp: SpConfig,
    correlation: Arc<CorrelationRegistry>,
}

impl RequestBuilder {
    pub fn new(sp: SpConfig, correlation: Arc<CorrelationRegistry>) -> Self {
        Self { sp, correlation }
    }

    /// Build an AuthnRequest addressed to the IdP's SSO endpoint.
    pub fn build_authn_request(
        &self,
        idp: &IdpDescriptor,
        options: &AuthnOptions,
    ) -> Result<(AuthnRequest, SamlBinding), InternalError> {
        let endpoint = sso_endpoint(idp)?;

        let mut class_refs = Vec::new();
        if let Some(level) = &options.required_level {
            class_refs.push(level.clone());
        }
        if let Some(profile) = &options.attribute_profile {
            class_refs.push(profile.clone());
        }
        let requested_context = if class_refs.is_empty() {
            None
        } else {
            Some(RequestedContext {
                class_refs,
                comparison: ContextComparison::Minimum,
            })
        };

        let request = AuthnRequest {
            id: random_id(),
            issue_instant: Utc::now(),
            destination: endpoint.location.clone(),
            issuer: self.sp.entity_id.clone(),
            acs_url: self.sp.acs_url.clone(),
            is_passive: options.is_passive,
            force_authn: options.force_authn,
            name_id_policy_format: self.sp.name_id_format.clone(),
            requested_context,
        };

        // Happens-before dispatch: the ID is correlatable from here on.
        self.correlation.register(&request.id, &idp.entity_id);
        tracing::debug!(
            request_id = %request.id,
            idp = %idp.entity_id,
            destination = %request.destination,
            "built authentication request"
        );
        Ok((request, endpoint.binding))
    }

    /// Build a LogoutRequest for the session being torn down.
    pub fn build_logout_request(
        &self,
        idp: &IdpDescriptor,
        session: &SessionSnapshot,
    ) -> Result<(LogoutRequest, SamlBinding), InternalError> {
        let endpoint = slo_endpoint(idp)?;

        let request = LogoutRequest {
            id: random_id(),
            issue_instant: Some(Utc::now()),
            destination: Some(endpoint.location.clone()),
            issuer: Some(self.sp.entity_id.clone()),
            name_id: Some(NameId {
                value: session.name_id.clone(),
                format: self.sp.name_id_format.clone(),
            }),
            session_indexes: session.session_index.iter().cloned().collect(),
            not_on_or_after: None,
            has_signature: false,
        };

        self.correlation.register(&request.id, &idp.entity_id);
        tracing::debug!(
            request_id = %request.id,
            idp = %idp.entity_id,
            "built logout request"
        );
        Ok((request, endpoint.binding))
    }

    /// Build the LogoutResponse answering an inbound LogoutRequest.
    pub fn build_logout_response(
        &self,
        idp: &IdpDescriptor,
        in_response_to: &str,
        status: Status,
    ) -> Result<(LogoutResponse, SamlBinding), InternalError> {
        let endpoint = slo_endpoint(idp)?;

        let response = LogoutResponse {
            id: random_id(),
            in_response_to: Some(in_response_to.to_owned()),
            issue_instant: Some(Utc::now()),
            destination: Some(endpoint.location.clone()),
            issuer: Some(self.sp.entity_id.clone()),
            status,
            has_signature: false,
        };
        Ok((response, endpoint.binding))
    }
}

fn sso_endpoint(idp: &IdpDescriptor) -> Result<&Endpoint, InternalError> {
    idp.sso_endpoint(SamlBinding::HttpRedirect)
        .or_else(|| idp.sso_endpoint(SamlBinding::HttpPost))
        .ok_or_else(|| {
            InternalError::Configuration(format!(
                "IdP {} publishes no usable SSO endpoint",
                idp.entity_id
            ))
        })
}

fn slo_endpoint(idp: &IdpDescriptor) -> Result<&Endpoint, InternalError> {
    idp.slo_endpoint(SamlBinding::HttpRedirect)
        .or_else(|| idp.slo_endpoint(SamlBinding::HttpPost))
        .or_else(|| idp.slo_endpoint(SamlBinding::Soap))
        .ok_or_else(|| {
            InternalError::Configuration(format!(
                "IdP {} publishes no usable SLO endpoint",
                idp.entity_id
            ))
        })
}

/// 160 bits of randomness, hex-encoded, with the leading underscore XML
/// NCName IDs require.
fn random_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::ReplayConfig;
    use crate::credentials::test_support::generate_keypair;

    fn sp_config() -> SpConfig {
        SpConfig {
            entity_id: "https://sp.example.com".into(),
            acs_url: "https://sp.example.com/saml/acs".into(),
            slo_url: Some("https://sp.example.com/saml/slo".into()),
            ..SpConfig::default()
        }
    }

    fn idp() -> IdpDescriptor {
        let (_, cert) = generate_keypair("idp.example.com");
        IdpDescriptor {
            entity_id: "https://idp.example.com".into(),
            sso_endpoints: vec![Endpoint {
                binding: SamlBinding::HttpRedirect,
                location: "https://idp.example.com/sso".into(),
            }],
            slo_endpoints: vec![Endpoint {
                binding: SamlBinding::HttpRedirect,
                location: "https://idp.example.com/slo".into(),
            }],
            signing_certificates: vec![cert],
        }
    }

    fn builder() -> (RequestBuilder, Arc<CorrelationRegistry>) {
        let correlation = Arc::new(CorrelationRegistry::new(&ReplayConfig::default()));
        (RequestBuilder::new(sp_config(), correlation.clone()), correlation)
    }

    #[test]
    fn ids_are_long_random_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = random_id();
            assert!(id.starts_with('_'));
            assert_eq!(id.len(), 41); // "_" + 40 hex chars = 160 bits
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn authn_request_is_registered_before_return() {
        let (builder, correlation) = builder();
        let (request, binding) = builder
            .build_authn_request(&idp(), &AuthnOptions::default())
            .unwrap();
        assert_eq!(binding, SamlBinding::HttpRedirect);
        assert!(correlation.contains(&request.id));
        assert_eq!(
            correlation.consume(&request.id).as_deref(),
            Some("https://idp.example.com")
        );
    }

    #[test]
    fn required_level_emits_minimum_comparison() {
        let (builder, _) = builder();
        let options = AuthnOptions {
            required_level: Some("https://data.gov.dk/concept/core/nsis/Substantial".into()),
            ..AuthnOptions::default()
        };
        let (request, _) = builder.build_authn_request(&idp(), &options).unwrap();
        let context = request.requested_context.unwrap();
        assert_eq!(context.comparison, ContextComparison::Minimum);
        assert_eq!(context.class_refs.len(), 1);
    }

    #[test]
    fn no_level_means_no_requested_context() {
        let (builder, _) = builder();
        let (request, _) = builder
            .build_authn_request(&idp(), &AuthnOptions::default())
            .unwrap();
        assert!(request.requested_context.is_none());
    }

    #[test]
    fn missing_endpoint_is_a_configuration_error() {
        let (builder, _) = builder();
        let mut descriptor = idp();
        descriptor.sso_endpoints.clear();
        let err = builder
            .build_authn_request(&descriptor, &AuthnOptions::default())
            .unwrap_err();
        assert!(matches!(err, InternalError::Configuration(_)));
    }

    #[test]
    fn logout_request_carries_session_identity() {
        let (builder, correlation) = builder();
        let session = SessionSnapshot {
            name_id: "user@example.com".into(),
            session_index: Some("_sess42".into()),
        };
        let (request, _) = builder.build_logout_request(&idp(), &session).unwrap();
        assert_eq!(request.name_id.as_ref().unwrap().value, "user@example.com");
        assert_eq!(request.session_indexes, vec!["_sess42".to_string()]);
        assert!(correlation.contains(&request.id));
    }

    #[test]
    fn logout_response_is_not_registered() {
        let (builder, correlation) = builder();
        let (response, _) = builder
            .build_logout_response(&idp(), "_inbound1", Status::success())
            .unwrap();
        assert_eq!(response.in_response_to.as_deref(), Some("_inbound1"));
        assert!(!correlation.contains(&response.id));
    }
}
