use chrono::{DateTime, Utc};

use super::{
    MessageParameter, NameId, ProtocolMessage, Status, format_instant, parse_instant,
};
use crate::xml::{Element, XmlError, escape_attr, escape_text, ns};

/// A LogoutRequest, SP-initiated (outbound) or IdP-initiated (inbound).
#[derive(Debug, Clone)]
pub struct LogoutRequest {
    pub id: String,
    pub issue_instant: Option<DateTime<Utc>>,
    pub destination: Option<String>,
    pub issuer: Option<String>,
    pub name_id: Option<NameId>,
    pub session_indexes: Vec<String>,
    /// The request is void once this instant has passed.
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// Whether the inbound document carried a Signature element.
    pub has_signature: bool,
}

impl LogoutRequest {
    pub fn from_element(el: &Element) -> Result<Self, XmlError> {
        if !el.is(ns::SAMLP, "LogoutRequest") {
            return Err(XmlError::Malformed(format!(
                "expected LogoutRequest, found {}",
                el.local
            )));
        }
        let id = el
            .attr("ID")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| XmlError::Malformed("LogoutRequest without ID".into()))?
            .to_owned();

        let name_id = el.child(ns::SAML, "NameID").map(|n| NameId {
            value: n.text(),
            format: n.attr("Format").map(str::to_owned),
        });

        Ok(Self {
            id,
            issue_instant: parse_instant(el.attr("IssueInstant")),
            destination: el.attr("Destination").map(str::to_owned),
            issuer: el.child(ns::SAML, "Issuer").map(|i| i.text()),
            name_id,
            session_indexes: el
                .children_named(ns::SAMLP, "SessionIndex")
                .map(|s| s.text())
                .collect(),
            not_on_or_after: parse_instant(el.attr("NotOnOrAfter")),
            has_signature: el.child(ns::DSIG, "Signature").is_some(),
        })
    }
}

impl ProtocolMessage for LogoutRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    fn to_xml(&self) -> String {
        let mut xml = format!(
            r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0""#,
            id = escape_attr(&self.id),
        );
        if let Some(instant) = self.issue_instant {
            xml.push_str(&format!(r#" IssueInstant="{}""#, format_instant(instant)));
        }
        if let Some(destination) = &self.destination {
            xml.push_str(&format!(r#" Destination="{}""#, escape_attr(destination)));
        }
        if let Some(not_on_or_after) = self.not_on_or_after {
            xml.push_str(&format!(
                r#" NotOnOrAfter="{}""#,
                format_instant(not_on_or_after)
            ));
        }
        xml.push('>');

        if let Some(issuer) = &self.issuer {
            xml.push_str(&format!(
                "<saml:Issuer>{}</saml:Issuer>",
                escape_text(issuer)
            ));
        }
        if let Some(name_id) = &self.name_id {
            match &name_id.format {
                Some(format) => xml.push_str(&format!(
                    r#"<saml:NameID Format="{}">{}</saml:NameID>"#,
                    escape_attr(format),
                    escape_text(&name_id.value)
                )),
                None => xml.push_str(&format!(
                    "<saml:NameID>{}</saml:NameID>",
                    escape_text(&name_id.value)
                )),
            }
        }
        for index in &self.session_indexes {
            xml.push_str(&format!(
                "<samlp:SessionIndex>{}</samlp:SessionIndex>",
                escape_text(index)
            ));
        }
        xml.push_str("</samlp:LogoutRequest>");
        xml
    }

    fn parameter(&self) -> MessageParameter {
        MessageParameter::Request
    }
}

/// A LogoutResponse, either direction.
#[derive(Debug, Clone)]
pub struct LogoutResponse {
    pub id: String,
    pub in_response_to: Option<String>,
    pub issue_instant: Option<DateTime<Utc>>,
    pub destination: Option<String>,
    pub issuer: Option<String>,
    pub status: Status,
    pub has_signature: bool,
}

impl LogoutResponse {
    pub fn from_element(el: &Element) -> Result<Self, XmlError> {
        if !el.is(ns::SAMLP, "LogoutResponse") {
            return Err(XmlError::Malformed(format!(
                "expected LogoutResponse, found {}",
                el.local
            )));
        }
        let id = el
            .attr("ID")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| XmlError::Malformed("LogoutResponse without ID".into()))?
            .to_owned();

        let status = el
            .child(ns::SAMLP, "Status")
            .map(Status::from_element)
            .ok_or_else(|| XmlError::Malformed("LogoutResponse without Status".into()))?;

        Ok(Self {
            id,
            in_response_to: el.attr("InResponseTo").map(str::to_owned),
            issue_instant: parse_instant(el.attr("IssueInstant")),
            destination: el.attr("Destination").map(str::to_owned),
            issuer: el.child(ns::SAML, "Issuer").map(|i| i.text()),
            status,
            has_signature: el.child(ns::DSIG, "Signature").is_some(),
        })
    }
}

impl ProtocolMessage for LogoutResponse {
    fn id(&self) -> &str {
        &self.id
    }

    fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    fn to_xml(&self) -> String {
        let mut xml = format!(
            r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="{id}" Version="2.0""#,
            id = escape_attr(&self.id),
        );
        if let Some(instant) = self.issue_instant {
            xml.push_str(&format!(r#" IssueInstant="{}""#, format_instant(instant)));
        }
        if let Some(in_response_to) = &self.in_response_to {
            xml.push_str(&format!(
                r#" InResponseTo="{}""#,
                escape_attr(in_response_to)
            ));
        }
        if let Some(destination) = &self.destination {
            xml.push_str(&format!(r#" Destination="{}""#, escape_attr(destination)));
        }
        xml.push('>');

        if let Some(issuer) = &self.issuer {
            xml.push_str(&format!(
                "<saml:Issuer>{}</saml:Issuer>",
                escape_text(issuer)
            ));
        }
        xml.push_str(&self.status.to_xml());
        xml.push_str("</samlp:LogoutResponse>");
        xml
    }

    fn parameter(&self) -> MessageParameter {
        MessageParameter::Response
    }
}

#[cfg(test)]
mod tests {
    use super::super::consts;
    use super::*;
    use crate::xml::parse_document;

    #[test]
    fn logout_request_round_trips() {
        let request = LogoutRequest {
            id: "_lr1".into(),
            issue_instant: Some(Utc::now()),
            destination: Some("https://idp.example.com/slo".into()),
            issuer: Some("https://sp.example.com".into()),
            name_id: Some(NameId {
                value: "user@example.com".into(),
                format: Some(consts::NAME_ID_EMAIL.into()),
            }),
            session_indexes: vec!["_session1".into()],
            not_on_or_after: None,
            has_signature: false,
        };

        let doc = parse_document(&request.to_xml()).unwrap();
        let parsed = LogoutRequest::from_element(&doc).unwrap();
        assert_eq!(parsed.id, "_lr1");
        assert_eq!(parsed.issuer.as_deref(), Some("https://sp.example.com"));
        assert_eq!(parsed.name_id.as_ref().unwrap().value, "user@example.com");
        assert_eq!(parsed.session_indexes, vec!["_session1".to_string()]);
        assert!(!parsed.has_signature);
    }

    #[test]
    fn logout_response_round_trips() {
        let response = LogoutResponse {
            id: "_lrsp1".into(),
            in_response_to: Some("_lr1".into()),
            issue_instant: Some(Utc::now()),
            destination: Some("https://sp.example.com/saml/slo".into()),
            issuer: Some("https://idp.example.com".into()),
            status: Status::success(),
            has_signature: false,
        };

        let doc = parse_document(&response.to_xml()).unwrap();
        let parsed = LogoutResponse::from_element(&doc).unwrap();
        assert_eq!(parsed.in_response_to.as_deref(), Some("_lr1"));
        assert_eq!(parsed.status.code, consts::STATUS_SUCCESS);
    }

    #[test]
    fn logout_request_without_id_is_malformed() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" Version="2.0"/>"#;
        let doc = parse_document(xml).unwrap();
        assert!(LogoutRequest::from_element(&doc).is_err());
    }
}
