//! SAML 2.0 protocol messages as plain structs.
//!
//! Outbound messages (`AuthnRequest`, `LogoutRequest`, `LogoutResponse`)
//! carry a hand-written XML serialization; inbound messages (`Response`,
//! `LogoutRequest`, `LogoutResponse`) are read from the parsed document
//! tree. There is no inheritance tree — what the messages share is the
//! [`ProtocolMessage`] capability the binding codecs and the signature
//! service compose over.

mod assertion;
mod authn;
mod logout;
mod response;

pub use assertion::*;
pub use authn::*;
use chrono::{DateTime, SecondsFormat, Utc};
pub use logout::*;
pub use response::*;

/// Well-known SAML URN constants.
pub mod consts {
    pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
    pub const STATUS_REQUESTER: &str = "urn:oasis:names:tc:SAML:2.0:status:Requester";
    pub const STATUS_RESPONDER: &str = "urn:oasis:names:tc:SAML:2.0:status:Responder";
    pub const STATUS_NO_PASSIVE: &str = "urn:oasis:names:tc:SAML:2.0:status:NoPassive";

    pub const CONFIRMATION_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

    pub const NAME_ID_EMAIL: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
    pub const NAME_ID_PERSISTENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent";
}

/// Which wire parameter a message travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageParameter {
    /// `SAMLRequest`
    Request,
    /// `SAMLResponse`
    Response,
}

impl MessageParameter {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Request => "SAMLRequest",
            Self::Response => "SAMLResponse",
        }
    }
}

/// The capability shared by every signable, encodable protocol message.
pub trait ProtocolMessage {
    /// The message's unique, opaque identifier.
    fn id(&self) -> &str;

    /// Destination URL the message is addressed to, if any.
    fn destination(&self) -> Option<&str>;

    /// Serialize to XML without an embedded signature.
    fn to_xml(&self) -> String;

    /// The wire parameter this message is carried in.
    fn parameter(&self) -> MessageParameter;
}

/// A subject NameID with its optional format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
}

/// Format a timestamp the way SAML messages carry them: UTC,
/// millisecond precision, `Z` suffix.
pub(crate) fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a SAML instant. Returns `None` for absent or unparseable input;
/// callers decide whether that is tolerable.
pub(crate) fn parse_instant(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
