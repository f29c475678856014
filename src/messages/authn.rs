use chrono::{DateTime, Utc};

use super::{MessageParameter, ProtocolMessage, format_instant};
use crate::xml::{escape_attr, escape_text};

/// How a RequestedAuthnContext constrains the IdP's choice of
/// authentication means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextComparison {
    /// The asserted context must be at least as strong as the requested
    /// one.
    Minimum,
    Exact,
}

impl ContextComparison {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Minimum => "minimum",
            Self::Exact => "exact",
        }
    }
}

/// A requested authentication context. Absent entirely when the caller
/// imposes no constraint — absence means "anything satisfies", which is
/// not the same as requesting the weakest level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedContext {
    pub class_refs: Vec<String>,
    pub comparison: ContextComparison,
}

/// An outbound authentication request.
#[derive(Debug, Clone)]
pub struct AuthnRequest {
    pub id: String,
    pub issue_instant: DateTime<Utc>,
    pub destination: String,
    pub issuer: String,
    /// Where the IdP must deliver the response.
    pub acs_url: String,
    pub is_passive: bool,
    pub force_authn: bool,
    pub name_id_policy_format: Option<String>,
    pub requested_context: Option<RequestedContext>,
}

impl ProtocolMessage for AuthnRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn destination(&self) -> Option<&str> {
        Some(&self.destination)
    }

    fn to_xml(&self) -> String {
        let mut xml = format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}" AssertionConsumerServiceURL="{acs}" ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" ForceAuthn="{force}" IsPassive="{passive}"><saml:Issuer>{issuer}</saml:Issuer>"#,
            id = escape_attr(&self.id),
            instant = format_instant(self.issue_instant),
            destination = escape_attr(&self.destination),
            acs = escape_attr(&self.acs_url),
            force = self.force_authn,
            passive = self.is_passive,
            issuer = escape_text(&self.issuer),
        );

        if let Some(format) = &self.name_id_policy_format {
            xml.push_str(&format!(
                r#"<samlp:NameIDPolicy Format="{}" AllowCreate="true"/>"#,
                escape_attr(format)
            ));
        }

        if let Some(context) = &self.requested_context {
            xml.push_str(&format!(
                r#"<samlp:RequestedAuthnContext Comparison="{}">"#,
                context.comparison.as_str()
            ));
            for class_ref in &context.class_refs {
                xml.push_str(&format!(
                    "<saml:AuthnContextClassRef>{}</saml:AuthnContextClassRef>",
                    escape_text(class_ref)
                ));
            }
            xml.push_str("</samlp:RequestedAuthnContext>");
        }

        xml.push_str("</samlp:AuthnRequest>");
        xml
    }

    fn parameter(&self) -> MessageParameter {
        MessageParameter::Request
    }
}
