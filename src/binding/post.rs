//! HTTP-POST binding.
//!
//! The message XML travels base64-encoded (no deflate) in a form field.
//! There is no detached query signature; trust comes from the XML
//! signature embedded in the message itself, so encoding signs the
//! document when a credential is supplied.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::{MAX_MESSAGE_BYTES, MAX_RELAY_STATE_BYTES};
use crate::credentials::Credential;
use crate::error::{ExternalError, InternalError};
use crate::messages::{MessageParameter, ProtocolMessage};
use crate::signature;
use crate::xml::escape_attr;

/// An encoded POST-binding message, ready to render as an
/// auto-submitting HTML form.
#[derive(Debug, Clone)]
pub struct PostForm {
    pub action: String,
    pub parameter: MessageParameter,
    pub value: String,
    pub relay_state: Option<String>,
}

impl PostForm {
    /// Auto-submitting HTML form delivering the message through the
    /// user's browser.
    pub fn render_html(&self) -> String {
        let relay_state_input = self
            .relay_state
            .as_ref()
            .map(|rs| {
                format!(
                    r#"<input type="hidden" name="RelayState" value="{}" />"#,
                    escape_attr(rs)
                )
            })
            .unwrap_or_default();
        format!(
            r#"<!DOCTYPE html>
<html><body onload="document.forms[0].submit()">
<form method="POST" action="{action}">
<input type="hidden" name="{name}" value="{value}" />
{relay_state_input}
</form></body></html>"#,
            action = escape_attr(&self.action),
            name = self.parameter.name(),
            value = escape_attr(&self.value),
        )
    }
}

/// Encode a message for the POST binding, signing the XML when a
/// credential is supplied.
pub fn encode_post(
    message: &dyn ProtocolMessage,
    endpoint: &str,
    relay_state: Option<&str>,
    signing: Option<&Credential>,
) -> Result<PostForm, InternalError> {
    if let Some(relay_state) = relay_state {
        if relay_state.len() > MAX_RELAY_STATE_BYTES {
            return Err(InternalError::Serialization(format!(
                "RelayState exceeds {MAX_RELAY_STATE_BYTES} bytes"
            )));
        }
    }

    let xml = match signing {
        Some(credential) => signature::sign_enveloped(&message.to_xml(), credential)?,
        None => message.to_xml(),
    };

    Ok(PostForm {
        action: endpoint.to_owned(),
        parameter: message.parameter(),
        value: STANDARD.encode(xml.as_bytes()),
        relay_state: relay_state.map(str::to_owned),
    })
}

/// Decode the base64 form field of an inbound POST-binding message.
pub fn decode_post(form_value: &str) -> Result<String, ExternalError> {
    // Browsers and IdPs line-wrap long form values.
    let compact: String = form_value.split_whitespace().collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ExternalError::MalformedMessage(format!("bad base64 form field: {e}")))?;
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ExternalError::MalformedMessage(
            "decoded message exceeds size bound".into(),
        ));
    }
    String::from_utf8(bytes)
        .map_err(|_| ExternalError::MalformedMessage("message is not valid UTF-8".into()))
}
