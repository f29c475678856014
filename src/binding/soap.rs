//! SOAP 1.1 binding for back-channel exchange.
//!
//! Used for ArtifactResolve and SOAP-bound LogoutRequest/Response:
//! server-to-server, synchronous, no RelayState. The protocol message is
//! the sole child of the SOAP Body.

use crate::error::ExternalError;
use crate::messages::ProtocolMessage;
use crate::xml::{Element, ns, parse_document};

/// Wrap a message in a SOAP 1.1 envelope.
pub fn encode_soap(message: &dyn ProtocolMessage) -> String {
    format!(
        r#"<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://schemas.xmlsoap.org/soap/envelope/"><SOAP-ENV:Body>{}</SOAP-ENV:Body></SOAP-ENV:Envelope>"#,
        message.to_xml()
    )
}

/// Unwrap the protocol message from a SOAP 1.1 envelope.
///
/// The Body must carry exactly one child element; the returned element
/// is scope-merged so it can be processed standalone.
pub fn decode_soap(envelope_xml: &str) -> Result<Element, ExternalError> {
    let envelope = parse_document(envelope_xml)
        .map_err(|e| ExternalError::MalformedMessage(format!("bad SOAP envelope: {e}")))?;
    if !envelope.is(ns::SOAP_ENV, "Envelope") {
        return Err(ExternalError::MalformedMessage(
            "document is not a SOAP 1.1 envelope".into(),
        ));
    }

    let body = envelope.child(ns::SOAP_ENV, "Body").ok_or_else(|| {
        ExternalError::MalformedMessage("SOAP envelope has no Body".into())
    })?;

    let mut children = body.child_elements();
    let message = children.next().ok_or_else(|| {
        ExternalError::MalformedMessage("SOAP Body carries no message".into())
    })?;
    if children.next().is_some() {
        return Err(ExternalError::MalformedMessage(
            "SOAP Body must carry exactly one message".into(),
        ));
    }

    envelope
        .find_with_scope(&|el| std::ptr::eq(el, message))
        .ok_or_else(|| ExternalError::MalformedMessage("SOAP Body extraction failed".into()))
}
