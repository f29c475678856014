use chrono::{DateTime, Utc};

use super::{Assertion, consts, parse_instant};
use crate::xml::{Element, XmlError, escape_attr, escape_text, ns};

/// Protocol status: top-level code, optional nested sub-code, optional
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: String,
    pub sub_code: Option<String>,
    pub message: Option<String>,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: consts::STATUS_SUCCESS.to_owned(),
            sub_code: None,
            message: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == consts::STATUS_SUCCESS
    }

    pub fn from_element(el: &Element) -> Self {
        let status_code = el.child(ns::SAMLP, "StatusCode");
        let code = status_code
            .and_then(|c| c.attr("Value"))
            .unwrap_or_default()
            .to_owned();
        let sub_code = status_code
            .and_then(|c| c.child(ns::SAMLP, "StatusCode"))
            .and_then(|c| c.attr("Value"))
            .map(str::to_owned);
        let message = el
            .child(ns::SAMLP, "StatusMessage")
            .map(|m| m.text())
            .filter(|m| !m.is_empty());
        Self {
            code,
            sub_code,
            message,
        }
    }

    pub fn to_xml(&self) -> String {
        let mut xml = format!(
            r#"<samlp:Status><samlp:StatusCode Value="{}""#,
            escape_attr(&self.code)
        );
        match &self.sub_code {
            Some(sub) => xml.push_str(&format!(
                r#"><samlp:StatusCode Value="{}"/></samlp:StatusCode>"#,
                escape_attr(sub)
            )),
            None => xml.push_str("/>"),
        }
        if let Some(message) = &self.message {
            xml.push_str(&format!(
                "<samlp:StatusMessage>{}</samlp:StatusMessage>",
                escape_text(message)
            ));
        }
        xml.push_str("</samlp:Status>");
        xml
    }
}

/// An inbound authentication Response.
///
/// Encrypted assertions are kept as raw subtrees for the decrypter; the
/// validator decides whether plaintext, encrypted, or neither is
/// acceptable.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: String,
    pub version: Option<String>,
    pub in_response_to: Option<String>,
    pub destination: Option<String>,
    pub issue_instant: Option<DateTime<Utc>>,
    pub issuer: Option<String>,
    pub status: Status,
    pub has_signature: bool,
    pub assertions: Vec<Assertion>,
    /// Raw `EncryptedAssertion` elements, scope-merged so they can be
    /// processed standalone.
    pub encrypted_assertions: Vec<Element>,
}

impl Response {
    pub fn from_element(el: &Element) -> Result<Self, XmlError> {
        if !el.is(ns::SAMLP, "Response") {
            return Err(XmlError::Malformed(format!(
                "expected Response, found {}",
                el.local
            )));
        }
        let id = el
            .attr("ID")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| XmlError::Malformed("Response without ID".into()))?
            .to_owned();

        let status = el
            .child(ns::SAMLP, "Status")
            .map(Status::from_element)
            .ok_or_else(|| XmlError::Malformed("Response without Status".into()))?;

        let assertions = el
            .children_named(ns::SAML, "Assertion")
            .map(Assertion::from_element)
            .collect::<Result<Vec<_>, _>>()?;

        let encrypted_assertions = el
            .children_named(ns::SAML, "EncryptedAssertion")
            .map(|enc| {
                // Re-anchor inherited namespace declarations so the
                // subtree survives extraction from the document.
                el.find_with_scope(&|candidate| std::ptr::eq(candidate, enc))
                    .unwrap_or_else(|| enc.clone())
            })
            .collect();

        Ok(Self {
            id,
            version: el.attr("Version").map(str::to_owned),
            in_response_to: el.attr("InResponseTo").map(str::to_owned),
            destination: el.attr("Destination").map(str::to_owned),
            issue_instant: parse_instant(el.attr("IssueInstant")),
            issuer: el.child(ns::SAML, "Issuer").map(|i| i.text()),
            status,
            has_signature: el.child(ns::DSIG, "Signature").is_some(),
            assertions,
            encrypted_assertions,
        })
    }

    /// Number of assertions of either kind the response carries.
    pub fn assertion_count(&self) -> usize {
        self.assertions.len() + self.encrypted_assertions.len()
    }
}
