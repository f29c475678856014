//! Federation metadata at the engine boundary.
//!
//! The engine does not parse metadata XML; the embedding application
//! hands it already-parsed endpoint and certificate data. What lives
//! here is the in-memory descriptor model, the store keyed by entity ID,
//! and the rendering of our own SP metadata document for IdP
//! auto-configuration.

use std::sync::Arc;

use dashmap::DashMap;
use openssl::x509::X509;

use crate::config::SpConfig;
use crate::credentials::Credential;
use crate::error::InternalError;
use crate::xml::escape_attr;

/// SAML binding identifiers we speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamlBinding {
    HttpRedirect,
    HttpPost,
    Soap,
}

impl SamlBinding {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::HttpRedirect => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect",
            Self::HttpPost => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST",
            Self::Soap => "urn:oasis:names:tc:SAML:2.0:bindings:SOAP",
        }
    }
}

/// One protocol endpoint published by a peer.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub binding: SamlBinding,
    pub location: String,
}

/// Parsed descriptor for one identity provider.
#[derive(Debug, Clone)]
pub struct IdpDescriptor {
    pub entity_id: String,
    /// Single sign-on endpoints, in preference order.
    pub sso_endpoints: Vec<Endpoint>,
    /// Single logout endpoints, in preference order.
    pub slo_endpoints: Vec<Endpoint>,
    /// Signing certificates currently published by the IdP. More than
    /// one is normal during a certificate rollover.
    pub signing_certificates: Vec<X509>,
}

impl IdpDescriptor {
    /// First endpoint for the requested binding.
    pub fn sso_endpoint(&self, binding: SamlBinding) -> Option<&Endpoint> {
        self.sso_endpoints.iter().find(|e| e.binding == binding)
    }

    pub fn slo_endpoint(&self, binding: SamlBinding) -> Option<&Endpoint> {
        self.slo_endpoints.iter().find(|e| e.binding == binding)
    }
}

/// Store of federation peers, keyed by entity ID.
///
/// Reload replaces the whole map; the revocation checker observes the
/// reload and drops state for certificates that disappeared.
#[derive(Clone, Default)]
pub struct MetadataStore {
    peers: Arc<DashMap<String, Arc<IdpDescriptor>>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: IdpDescriptor) {
        self.peers
            .insert(descriptor.entity_id.clone(), Arc::new(descriptor));
    }

    pub fn get(&self, entity_id: &str) -> Option<Arc<IdpDescriptor>> {
        self.peers.get(entity_id).map(|r| r.value().clone())
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Replace the full peer set (metadata reload).
    pub fn reload(&self, descriptors: Vec<IdpDescriptor>) {
        self.peers.clear();
        for descriptor in descriptors {
            self.insert(descriptor);
        }
    }

    /// Every signing certificate across all peers, for revocation
    /// checking.
    pub fn all_signing_certificates(&self) -> Vec<X509> {
        self.peers
            .iter()
            .flat_map(|entry| entry.value().signing_certificates.clone())
            .collect()
    }

    /// The single configured peer, for deployments federated with exactly
    /// one IdP.
    pub fn sole_peer(&self) -> Option<Arc<IdpDescriptor>> {
        if self.peers.len() == 1 {
            self.peers.iter().next().map(|e| e.value().clone())
        } else {
            None
        }
    }
}

/// Render our SP metadata document for IdP auto-configuration.
///
/// Includes the entity ID, the ACS endpoint with HTTP-POST binding, the
/// SLO endpoint when configured, the signing certificate, and the
/// requested NameID format.
pub fn sp_metadata_xml(
    sp: &SpConfig,
    signing_credential: Option<&Credential>,
) -> Result<String, InternalError> {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
  <md:SPSSODescriptor AuthnRequestsSigned="{}" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#,
        escape_attr(&sp.entity_id),
        sp.sign_requests,
    );

    if let Some(credential) = signing_credential {
        let cert = credential.certificate_base64()?;
        xml.push_str(&format!(
            r#"
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
        <ds:X509Data>
          <ds:X509Certificate>{cert}</ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>"#
        ));
    }

    if let Some(slo_url) = &sp.slo_url {
        xml.push_str(&format!(
            r#"
    <md:SingleLogoutService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{}"/>"#,
            escape_attr(slo_url)
        ));
    }

    let name_id_format = sp
        .name_id_format
        .as_deref()
        .unwrap_or("urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress");
    xml.push_str(&format!(
        r#"
    <md:NameIDFormat>{name_id_format}</md:NameIDFormat>"#
    ));

    xml.push_str(&format!(
        r#"
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{}" index="0"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
        escape_attr(&sp.acs_url)
    ));

    Ok(xml)
}
