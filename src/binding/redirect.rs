//! HTTP-Redirect binding.
//!
//! Encoding: marshal to XML, UTF-8, raw deflate (no zlib header or
//! trailer), base64, URL-encode as `SAMLRequest`/`SAMLResponse`.
//! RelayState is appended *before* signing. The detached signature is
//! computed over the literal query-string bytes
//! `SAMLRequest=..&RelayState=..&SigAlg=..` in exactly that order, and
//! appended as `Signature`.
//!
//! Decoding keeps the raw percent-encoded parameter fragments so the
//! signed payload can be reconstructed byte-for-byte for verification.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use url::Url;
use url::form_urlencoded;

use super::{MAX_MESSAGE_BYTES, MAX_RELAY_STATE_BYTES};
use crate::credentials::Credential;
use crate::error::{ExternalError, InternalError};
use crate::messages::{MessageParameter, ProtocolMessage};
use crate::signature;

/// A decoded Redirect-binding message plus the material needed to verify
/// its detached signature.
#[derive(Debug)]
pub struct DecodedRedirect {
    pub xml: String,
    pub parameter: MessageParameter,
    pub relay_state: Option<String>,
    /// The literal bytes the peer signed, when a signature is present.
    pub signed_payload: Option<Vec<u8>>,
    pub signature: Option<Vec<u8>>,
    pub sig_alg: Option<String>,
}

impl DecodedRedirect {
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

/// Encode a message onto a Redirect URL, optionally signing the query
/// string.
pub fn encode_redirect(
    message: &dyn ProtocolMessage,
    endpoint: &str,
    relay_state: Option<&str>,
    signing: Option<&Credential>,
) -> Result<Url, InternalError> {
    if let Some(relay_state) = relay_state {
        if relay_state.len() > MAX_RELAY_STATE_BYTES {
            return Err(InternalError::Serialization(format!(
                "RelayState exceeds {MAX_RELAY_STATE_BYTES} bytes"
            )));
        }
    }

    let xml = message.to_xml();
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .and_then(|_| encoder.finish())
        .map(|deflated| STANDARD.encode(deflated))
        .map_err(|e| InternalError::Serialization(format!("deflate failed: {e}")))
        .and_then(|encoded| {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            serializer.append_pair(message.parameter().name(), &encoded);
            if let Some(relay_state) = relay_state {
                serializer.append_pair("RelayState", relay_state);
            }

            let query = match signing {
                Some(credential) => {
                    let sig_alg = signature::query_signature_algorithm(credential);
                    serializer.append_pair("SigAlg", sig_alg);
                    let payload = serializer.finish();
                    let sig = signature::sign_query(payload.as_bytes(), credential)?;
                    let mut tail = form_urlencoded::Serializer::new(String::new());
                    tail.append_pair("Signature", &STANDARD.encode(sig));
                    format!("{payload}&{}", tail.finish())
                }
                None => serializer.finish(),
            };

            let mut url = Url::parse(endpoint).map_err(|e| {
                InternalError::Configuration(format!("bad endpoint URL `{endpoint}`: {e}"))
            })?;
            let full_query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
                _ => query,
            };
            url.set_query(Some(&full_query));
            Ok(url)
        })
}

/// Decode the query string of an inbound Redirect-binding request.
pub fn decode_redirect(raw_query: &str) -> Result<DecodedRedirect, ExternalError> {
    // Keep raw fragments: the signature is over the bytes as they
    // appeared on the wire, not over any re-encoding of them.
    let mut raw_message: Option<(&str, MessageParameter)> = None;
    let mut raw_relay_state: Option<&str> = None;
    let mut raw_sig_alg: Option<&str> = None;
    let mut raw_signature: Option<&str> = None;

    for fragment in raw_query.split('&').filter(|f| !f.is_empty()) {
        let (key, _) = fragment.split_once('=').unwrap_or((fragment, ""));
        match key {
            "SAMLRequest" => set_once(&mut raw_message, (fragment, MessageParameter::Request))?,
            "SAMLResponse" => set_once(&mut raw_message, (fragment, MessageParameter::Response))?,
            "RelayState" => set_once(&mut raw_relay_state, fragment)?,
            "SigAlg" => set_once(&mut raw_sig_alg, fragment)?,
            "Signature" => set_once(&mut raw_signature, fragment)?,
            _ => {}
        }
    }

    let (message_fragment, parameter) = raw_message.ok_or_else(|| {
        ExternalError::MalformedMessage("query carries no SAMLRequest or SAMLResponse".into())
    })?;

    let encoded = decoded_value(message_fragment)?;
    let deflated = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| ExternalError::MalformedMessage(format!("bad base64 payload: {e}")))?;
    let xml = inflate(&deflated)?;

    let relay_state = raw_relay_state.map(decoded_value).transpose()?;
    let sig_alg = raw_sig_alg.map(decoded_value).transpose()?;

    let (signed_payload, signature) = match raw_signature {
        Some(signature_fragment) => {
            if sig_alg.is_none() {
                return Err(ExternalError::MalformedMessage(
                    "Signature present without SigAlg".into(),
                ));
            }
            // Fixed field order, raw bytes as received.
            let mut payload = message_fragment.to_owned();
            if let Some(relay_fragment) = raw_relay_state {
                payload.push('&');
                payload.push_str(relay_fragment);
            }
            if let Some(sig_alg_fragment) = raw_sig_alg {
                payload.push('&');
                payload.push_str(sig_alg_fragment);
            }
            let signature_b64 = decoded_value(signature_fragment)?;
            let signature = STANDARD.decode(signature_b64.as_bytes()).map_err(|e| {
                ExternalError::MalformedMessage(format!("bad base64 signature: {e}"))
            })?;
            (Some(payload.into_bytes()), Some(signature))
        }
        None => (None, None),
    };

    Ok(DecodedRedirect {
        xml,
        parameter,
        relay_state,
        signed_payload,
        signature,
        sig_alg,
    })
}

fn set_once<T>(slot: &mut Option<T>, value: T) -> Result<(), ExternalError> {
    if slot.is_some() {
        return Err(ExternalError::MalformedMessage(
            "duplicate query parameter".into(),
        ));
    }
    *slot = Some(value);
    Ok(())
}

/// Percent-decode the value half of a raw `key=value` fragment.
fn decoded_value(fragment: &str) -> Result<String, ExternalError> {
    let mut parsed = form_urlencoded::parse(fragment.as_bytes());
    parsed
        .next()
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| ExternalError::MalformedMessage("empty query parameter".into()))
}

fn inflate(deflated: &[u8]) -> Result<String, ExternalError> {
    let mut inflated = Vec::new();
    let mut decoder = DeflateDecoder::new(deflated).take((MAX_MESSAGE_BYTES + 1) as u64);
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| ExternalError::MalformedMessage(format!("inflate failed: {e}")))?;
    if inflated.len() > MAX_MESSAGE_BYTES {
        return Err(ExternalError::MalformedMessage(
            "inflated message exceeds size bound".into(),
        ));
    }
    String::from_utf8(inflated)
        .map_err(|_| ExternalError::MalformedMessage("message is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialRole;
    use crate::credentials::test_support::generate_keypair;
    use crate::messages::{AuthnRequest, consts};

    fn request() -> AuthnRequest {
        AuthnRequest {
            id: "_redirect1".into(),
            issue_instant: chrono::Utc::now(),
            destination: "https://idp.example.com/sso".into(),
            issuer: "https://sp.example.com".into(),
            acs_url: "https://sp.example.com/saml/acs".into(),
            is_passive: false,
            force_authn: false,
            name_id_policy_format: Some(consts::NAME_ID_EMAIL.into()),
            requested_context: None,
        }
    }

    fn credential() -> Credential {
        let (key, cert) = generate_keypair("sp.example.com");
        Credential::new(key, cert, CredentialRole::OwnPrimary)
    }

    #[test]
    fn unsigned_round_trip_preserves_payload() {
        let message = request();
        let url = encode_redirect(
            &message,
            "https://idp.example.com/sso",
            Some("return-here"),
            None,
        )
        .unwrap();
        assert!(url.as_str().starts_with("https://idp.example.com/sso?"));

        let decoded = decode_redirect(url.query().unwrap()).unwrap();
        assert_eq!(decoded.parameter, MessageParameter::Request);
        assert_eq!(decoded.relay_state.as_deref(), Some("return-here"));
        assert!(!decoded.is_signed());
        // Modulo nothing: our writer emits no inter-element whitespace.
        assert_eq!(decoded.xml, message.to_xml());
    }

    #[test]
    fn signed_url_verifies_and_rejects_other_keys() {
        let signer = credential();
        let url = encode_redirect(
            &request(),
            "https://idp.example.com/sso",
            Some("rs"),
            Some(&signer),
        )
        .unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("SigAlg="));
        assert!(query.contains("Signature="));

        let decoded = decode_redirect(query).unwrap();
        assert!(decoded.is_signed());
        let payload = decoded.signed_payload.as_deref().unwrap();
        // The signed payload is the literal prefix of the wire query.
        assert!(query.as_bytes().starts_with(payload));

        let own_key = signer.certificate().public_key().unwrap();
        assert!(signature::verify_query(
            payload,
            decoded.sig_alg.as_deref().unwrap(),
            decoded.signature.as_deref().unwrap(),
            &[own_key],
        ));

        let other = credential();
        let other_key = other.certificate().public_key().unwrap();
        assert!(!signature::verify_query(
            payload,
            decoded.sig_alg.as_deref().unwrap(),
            decoded.signature.as_deref().unwrap(),
            &[other_key],
        ));
    }

    #[test]
    fn endpoint_with_existing_query_is_preserved() {
        let url = encode_redirect(
            &request(),
            "https://idp.example.com/sso?tenant=acme",
            None,
            None,
        )
        .unwrap();
        let query = url.query().unwrap();
        assert!(query.starts_with("tenant=acme&SAMLRequest="));
    }

    #[test]
    fn oversized_relay_state_is_rejected_locally() {
        let relay_state = "x".repeat(MAX_RELAY_STATE_BYTES + 1);
        let err = encode_redirect(
            &request(),
            "https://idp.example.com/sso",
            Some(&relay_state),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, InternalError::Serialization(_)));
    }

    #[test]
    fn garbage_payload_is_the_peers_fault() {
        let err = decode_redirect("SAMLRequest=%25%25not-base64").unwrap_err();
        assert!(matches!(err, ExternalError::MalformedMessage(_)));

        let err = decode_redirect("Foo=bar").unwrap_err();
        assert!(matches!(err, ExternalError::MalformedMessage(_)));
    }

    #[test]
    fn duplicate_parameters_are_rejected() {
        let url = encode_redirect(&request(), "https://idp.example.com/sso", None, None).unwrap();
        let query = format!("{q}&{q}", q = url.query().unwrap());
        assert!(decode_redirect(&query).is_err());
    }

    #[test]
    fn signature_without_sig_alg_is_malformed() {
        let url = encode_redirect(&request(), "https://idp.example.com/sso", None, None).unwrap();
        let query = format!("{}&Signature=YWJj", url.query().unwrap());
        assert!(decode_redirect(&query).is_err());
    }
}
