use chrono::{DateTime, Utc};

use super::{NameId, parse_instant};
use crate::xml::{Element, XmlError, ns};

/// Validity window and audience restrictions.
#[derive(Debug, Clone, Default)]
pub struct Conditions {
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// One entry per AudienceRestriction element, each holding its
    /// audience URIs. The SP must appear in at least one restriction.
    pub audience_restrictions: Vec<Vec<String>>,
}

/// One SubjectConfirmation with the data fields the bearer profile
/// checks.
#[derive(Debug, Clone)]
pub struct SubjectConfirmation {
    pub method: Option<String>,
    pub recipient: Option<String>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub in_response_to: Option<String>,
}

/// One authentication statement.
#[derive(Debug, Clone)]
pub struct AuthnStatement {
    pub authn_instant: Option<DateTime<Utc>>,
    pub session_index: Option<String>,
    pub session_not_on_or_after: Option<DateTime<Utc>>,
    pub context_class_ref: Option<String>,
}

/// One attribute with all of its values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub friendly_name: Option<String>,
    pub values: Vec<String>,
}

/// A plaintext assertion.
#[derive(Debug, Clone)]
pub struct Assertion {
    pub id: String,
    pub version: Option<String>,
    pub issue_instant: Option<DateTime<Utc>>,
    pub issuer: Option<String>,
    pub subject_name_id: Option<NameId>,
    pub subject_confirmations: Vec<SubjectConfirmation>,
    pub conditions: Option<Conditions>,
    pub authn_statements: Vec<AuthnStatement>,
    pub attributes: Vec<Attribute>,
    pub has_signature: bool,
}

impl Assertion {
    pub fn from_element(el: &Element) -> Result<Self, XmlError> {
        if !el.is(ns::SAML, "Assertion") {
            return Err(XmlError::Malformed(format!(
                "expected Assertion, found {}",
                el.local
            )));
        }
        let id = el.attr("ID").unwrap_or_default().to_owned();

        let subject = el.child(ns::SAML, "Subject");
        let subject_name_id = subject
            .and_then(|s| s.child(ns::SAML, "NameID"))
            .map(|n| NameId {
                value: n.text(),
                format: n.attr("Format").map(str::to_owned),
            });
        let subject_confirmations = subject
            .map(|s| {
                s.children_named(ns::SAML, "SubjectConfirmation")
                    .map(|sc| {
                        let data = sc.child(ns::SAML, "SubjectConfirmationData");
                        SubjectConfirmation {
                            method: sc.attr("Method").map(str::to_owned),
                            recipient: data
                                .and_then(|d| d.attr("Recipient"))
                                .map(str::to_owned),
                            not_on_or_after: parse_instant(
                                data.and_then(|d| d.attr("NotOnOrAfter")),
                            ),
                            in_response_to: data
                                .and_then(|d| d.attr("InResponseTo"))
                                .map(str::to_owned),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let conditions = el.child(ns::SAML, "Conditions").map(|c| Conditions {
            not_before: parse_instant(c.attr("NotBefore")),
            not_on_or_after: parse_instant(c.attr("NotOnOrAfter")),
            audience_restrictions: c
                .children_named(ns::SAML, "AudienceRestriction")
                .map(|ar| {
                    ar.children_named(ns::SAML, "Audience")
                        .map(|a| a.text())
                        .collect()
                })
                .collect(),
        });

        let authn_statements = el
            .children_named(ns::SAML, "AuthnStatement")
            .map(|stmt| AuthnStatement {
                authn_instant: parse_instant(stmt.attr("AuthnInstant")),
                session_index: stmt.attr("SessionIndex").map(str::to_owned),
                session_not_on_or_after: parse_instant(stmt.attr("SessionNotOnOrAfter")),
                context_class_ref: stmt
                    .child(ns::SAML, "AuthnContext")
                    .and_then(|c| c.child(ns::SAML, "AuthnContextClassRef"))
                    .map(|r| r.text()),
            })
            .collect();

        let attributes = el
            .children_named(ns::SAML, "AttributeStatement")
            .flat_map(|stmt| stmt.children_named(ns::SAML, "Attribute"))
            .filter_map(|attr| {
                attr.attr("Name").map(|name| Attribute {
                    name: name.to_owned(),
                    friendly_name: attr.attr("FriendlyName").map(str::to_owned),
                    values: attr
                        .children_named(ns::SAML, "AttributeValue")
                        .map(|v| v.text())
                        .collect(),
                })
            })
            .collect();

        Ok(Self {
            id,
            version: el.attr("Version").map(str::to_owned),
            issue_instant: parse_instant(el.attr("IssueInstant")),
            issuer: el.child(ns::SAML, "Issuer").map(|i| i.text()),
            subject_name_id,
            subject_confirmations,
            conditions,
            authn_statements,
            attributes,
            has_signature: el.child(ns::DSIG, "Signature").is_some(),
        })
    }

    /// First attribute matching the given name or friendly name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name == name || a.friendly_name.as_deref() == Some(name))
    }

    /// Session index of the first authentication statement, used for SLO.
    pub fn session_index(&self) -> Option<&str> {
        self.authn_statements
            .iter()
            .find_map(|s| s.session_index.as_deref())
    }
}
