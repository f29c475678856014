//! Shared fixtures: an in-memory IdP side built from throwaway openssl
//! credentials, and a response builder that produces the documents a
//! real IdP would send.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, Utc};
use openssl::x509::X509;
use rand::RngCore;

use crate::config::SpConfig;
use crate::credentials::test_support::generate_keypair;
use crate::credentials::{Credential, CredentialRole, CredentialStore};
use crate::decrypt::test_support::{KeyPlacement, encrypt_assertion_xml};
use crate::messages::{consts, format_instant};
use crate::metadata::{Endpoint, IdpDescriptor, SamlBinding};
use crate::signature::sign_enveloped;
use crate::xml::{escape_attr, escape_text};

pub(crate) const IDP_ENTITY_ID: &str = "https://idp.example.com";
pub(crate) const SP_ENTITY_ID: &str = "https://sp.example.com";
pub(crate) const ACS_URL: &str = "https://sp.example.com/saml/acs";
pub(crate) const SLO_URL: &str = "https://sp.example.com/saml/slo";


fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The two sides of a test federation.
pub(crate) struct SamlTestKit {
    pub idp_credential: Credential,
    pub sp_credentials: CredentialStore,
    pub sp_config: SpConfig,
}

impl SamlTestKit {
    pub fn new() -> Self {
        let (idp_key, idp_cert) = generate_keypair("idp.example.com");
        let (sp_key, sp_cert) = generate_keypair("sp.example.com");
        Self {
            idp_credential: Credential::new(idp_key, idp_cert, CredentialRole::TrustedPeer),
            sp_credentials: CredentialStore::new(
                Credential::new(sp_key, sp_cert, CredentialRole::OwnPrimary),
                None,
            ),
            sp_config: SpConfig {
                entity_id: SP_ENTITY_ID.into(),
                acs_url: ACS_URL.into(),
                slo_url: Some(SLO_URL.into()),
                ..SpConfig::default()
            },
        }
    }

    pub fn idp_certificate(&self) -> &X509 {
        self.idp_credential.certificate()
    }

    pub fn idp_descriptor(&self) -> IdpDescriptor {
        IdpDescriptor {
            entity_id: IDP_ENTITY_ID.into(),
            sso_endpoints: vec![Endpoint {
                binding: SamlBinding::HttpRedirect,
                location: format!("{IDP_ENTITY_ID}/sso"),
            }],
            slo_endpoints: vec![Endpoint {
                binding: SamlBinding::HttpRedirect,
                location: format!("{IDP_ENTITY_ID}/slo"),
            }],
            signing_certificates: vec![self.idp_certificate().clone()],
        }
    }

    /// A response builder preloaded with everything a valid, solicited,
    /// assertion-signed response needs.
    pub fn response(&self) -> ResponseBuilder<'_> {
        let now = Utc::now();
        ResponseBuilder {
            kit: self,
            response_id: format!("_r{}", random_suffix()),
            assertion_id: format!("_a{}", random_suffix()),
            issuer: Some(IDP_ENTITY_ID.to_owned()),
            assertion_issuer: Some(IDP_ENTITY_ID.to_owned()),
            destination: Some(ACS_URL.to_owned()),
            in_response_to: None,
            status: (consts::STATUS_SUCCESS.to_owned(), None),
            name_id: "user@example.com".to_owned(),
            session_index: Some("_sess1".to_owned()),
            audience: Some(SP_ENTITY_ID.to_owned()),
            recipient: Some(ACS_URL.to_owned()),
            not_before: Some(now - Duration::minutes(5)),
            not_on_or_after: Some(now + Duration::minutes(5)),
            version: "2.0".to_owned(),
            attributes: Vec::new(),
            sign_assertion: true,
            sign_response: false,
            encrypt_to: None,
            assertion_count: 1,
        }
    }
}

pub(crate) struct ResponseBuilder<'a> {
    kit: &'a SamlTestKit,
    pub response_id: String,
    pub assertion_id: String,
    issuer: Option<String>,
    assertion_issuer: Option<String>,
    destination: Option<String>,
    in_response_to: Option<String>,
    status: (String, Option<String>),
    name_id: String,
    session_index: Option<String>,
    audience: Option<String>,
    recipient: Option<String>,
    not_before: Option<DateTime<Utc>>,
    not_on_or_after: Option<DateTime<Utc>>,
    version: String,
    attributes: Vec<(String, Vec<String>)>,
    sign_assertion: bool,
    sign_response: bool,
    encrypt_to: Option<X509>,
    assertion_count: usize,
}

impl ResponseBuilder<'_> {
    pub fn solicited(mut self, request_id: &str) -> Self {
        self.in_response_to = Some(request_id.to_owned());
        self
    }

    pub fn destination(mut self, destination: Option<&str>) -> Self {
        self.destination = destination.map(str::to_owned);
        self
    }

    pub fn status(mut self, code: &str, sub_code: Option<&str>) -> Self {
        self.status = (code.to_owned(), sub_code.map(str::to_owned));
        self
    }

    pub fn issuer(mut self, issuer: Option<&str>) -> Self {
        self.issuer = issuer.map(str::to_owned);
        self
    }

    pub fn assertion_issuer(mut self, issuer: Option<&str>) -> Self {
        self.assertion_issuer = issuer.map(str::to_owned);
        self
    }

    pub fn audience(mut self, audience: Option<&str>) -> Self {
        self.audience = audience.map(str::to_owned);
        self
    }

    pub fn recipient(mut self, recipient: Option<&str>) -> Self {
        self.recipient = recipient.map(str::to_owned);
        self
    }

    pub fn window(
        mut self,
        not_before: Option<DateTime<Utc>>,
        not_on_or_after: Option<DateTime<Utc>>,
    ) -> Self {
        self.not_before = not_before;
        self.not_on_or_after = not_on_or_after;
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_owned();
        self
    }

    pub fn attribute(mut self, name: &str, values: &[&str]) -> Self {
        self.attributes
            .push((name.to_owned(), values.iter().map(|v| (*v).to_owned()).collect()));
        self
    }

    pub fn unsigned_assertion(mut self) -> Self {
        self.sign_assertion = false;
        self
    }

    pub fn signed_response(mut self) -> Self {
        self.sign_response = true;
        self
    }

    pub fn encrypted_to(mut self, certificate: &X509) -> Self {
        self.encrypt_to = Some(certificate.clone());
        self
    }

    pub fn assertion_count(mut self, count: usize) -> Self {
        self.assertion_count = count;
        self
    }

    fn assertion_xml(&self) -> String {
        let mut xml = format!(
            r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="{version}" IssueInstant="{instant}">"#,
            id = escape_attr(&self.assertion_id),
            version = escape_attr(&self.version),
            instant = format_instant(Utc::now()),
        );
        if let Some(issuer) = &self.assertion_issuer {
            xml.push_str(&format!(
                "<saml:Issuer>{}</saml:Issuer>",
                escape_text(issuer)
            ));
        }

        xml.push_str(&format!(
            r#"<saml:Subject><saml:NameID Format="{format}">{name_id}</saml:NameID><saml:SubjectConfirmation Method="{method}"><saml:SubjectConfirmationData{recipient}{noa}{irt}/></saml:SubjectConfirmation></saml:Subject>"#,
            format = consts::NAME_ID_EMAIL,
            name_id = escape_text(&self.name_id),
            method = consts::CONFIRMATION_BEARER,
            recipient = self
                .recipient
                .as_ref()
                .map(|r| format!(r#" Recipient="{}""#, escape_attr(r)))
                .unwrap_or_default(),
            noa = self
                .not_on_or_after
                .map(|t| format!(r#" NotOnOrAfter="{}""#, format_instant(t)))
                .unwrap_or_default(),
            irt = self
                .in_response_to
                .as_ref()
                .map(|v| format!(r#" InResponseTo="{}""#, escape_attr(v)))
                .unwrap_or_default(),
        ));

        xml.push_str("<saml:Conditions");
        if let Some(not_before) = self.not_before {
            xml.push_str(&format!(
                r#" NotBefore="{}""#,
                format_instant(not_before)
            ));
        }
        if let Some(not_on_or_after) = self.not_on_or_after {
            xml.push_str(&format!(
                r#" NotOnOrAfter="{}""#,
                format_instant(not_on_or_after)
            ));
        }
        xml.push('>');
        if let Some(audience) = &self.audience {
            xml.push_str(&format!(
                "<saml:AudienceRestriction><saml:Audience>{}</saml:Audience></saml:AudienceRestriction>",
                escape_text(audience)
            ));
        }
        xml.push_str("</saml:Conditions>");

        xml.push_str(&format!(
            r#"<saml:AuthnStatement AuthnInstant="{instant}"{index}><saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement>"#,
            instant = format_instant(Utc::now()),
            index = self
                .session_index
                .as_ref()
                .map(|i| format!(r#" SessionIndex="{}""#, escape_attr(i)))
                .unwrap_or_default(),
        ));

        if !self.attributes.is_empty() {
            xml.push_str("<saml:AttributeStatement>");
            for (name, values) in &self.attributes {
                xml.push_str(&format!(r#"<saml:Attribute Name="{}">"#, escape_attr(name)));
                for value in values {
                    xml.push_str(&format!(
                        "<saml:AttributeValue>{}</saml:AttributeValue>",
                        escape_text(value)
                    ));
                }
                xml.push_str("</saml:Attribute>");
            }
            xml.push_str("</saml:AttributeStatement>");
        }

        xml.push_str("</saml:Assertion>");
        xml
    }

    /// Build the full Response document.
    pub fn build_xml(&self) -> String {
        let mut assertion = self.assertion_xml();
        if self.sign_assertion {
            assertion = sign_enveloped(&assertion, &self.kit.idp_credential).unwrap();
        }
        if let Some(recipient_cert) = &self.encrypt_to {
            assertion = encrypt_assertion_xml(
                &assertion,
                recipient_cert,
                crate::decrypt::alg::AES128_CBC,
                KeyPlacement::Inline,
            );
        }

        let mut response = format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{instant}""#,
            id = escape_attr(&self.response_id),
            instant = format_instant(Utc::now()),
        );
        if let Some(destination) = &self.destination {
            response.push_str(&format!(r#" Destination="{}""#, escape_attr(destination)));
        }
        if let Some(in_response_to) = &self.in_response_to {
            response.push_str(&format!(
                r#" InResponseTo="{}""#,
                escape_attr(in_response_to)
            ));
        }
        response.push('>');
        if let Some(issuer) = &self.issuer {
            response.push_str(&format!(
                "<saml:Issuer>{}</saml:Issuer>",
                escape_text(issuer)
            ));
        }

        let (code, sub_code) = &self.status;
        response.push_str(&format!(
            r#"<samlp:Status><samlp:StatusCode Value="{}""#,
            escape_attr(code)
        ));
        match sub_code {
            Some(sub) => response.push_str(&format!(
                r#"><samlp:StatusCode Value="{}"/></samlp:StatusCode>"#,
                escape_attr(sub)
            )),
            None => response.push_str("/>"),
        }
        response.push_str("</samlp:Status>");

        for _ in 0..self.assertion_count {
            response.push_str(&assertion);
        }
        response.push_str("</samlp:Response>");

        if self.sign_response {
            sign_enveloped(&response, &self.kit.idp_credential).unwrap()
        } else {
            response
        }
    }

    /// The POST-binding form value.
    pub fn build_b64(&self) -> String {
        STANDARD.encode(self.build_xml())
    }
}
