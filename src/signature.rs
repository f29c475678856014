//! XML and query-string signatures.
//!
//! Outbound messages get an enveloped XML-DSIG signature (RSA-SHA256,
//! exclusive canonicalization) inserted after the Issuer element.
//! Inbound verification performs SAML-profile structural validation of
//! the Signature element *before* any cryptography: exactly one
//! SignedInfo and Reference, the Reference addressed to the enclosing
//! element's ID, and only the enveloped-signature and exclusive-c14n
//! transforms. A structurally invalid signature fails even if its bytes
//! would verify.
//!
//! Verification accepts a collection of trusted keys and succeeds when
//! any of them validates the signature, so an IdP certificate rollover
//! with overlapping certificates does not interrupt the federation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::sign::{Signer, Verifier};

use crate::credentials::Credential;
use crate::error::InternalError;
use crate::xml::c14n::canonicalize;
use crate::xml::{Element, Node, escape_attr, ns, parse_document, serialize};

/// Signature and digest algorithm URIs.
pub mod alg {
    pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
    pub const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";
    pub const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
    pub const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";

    pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
    pub const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";
    pub const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";

    pub const ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
    pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
}

fn digest_for_signature_alg(uri: &str) -> Option<MessageDigest> {
    match uri {
        alg::RSA_SHA256 | alg::ECDSA_SHA256 => Some(MessageDigest::sha256()),
        alg::RSA_SHA512 => Some(MessageDigest::sha512()),
        alg::RSA_SHA1 => Some(MessageDigest::sha1()),
        _ => None,
    }
}

fn digest_for_digest_alg(uri: &str) -> Option<MessageDigest> {
    match uri {
        alg::DIGEST_SHA256 => Some(MessageDigest::sha256()),
        alg::DIGEST_SHA512 => Some(MessageDigest::sha512()),
        alg::DIGEST_SHA1 => Some(MessageDigest::sha1()),
        _ => None,
    }
}

/// Sign a serialized message with an enveloped signature.
///
/// The document's root element must carry an `ID` attribute; the
/// signature references it and is inserted directly after the Issuer
/// element, where the SAML signature profile expects it.
pub fn sign_enveloped(xml: &str, credential: &Credential) -> Result<String, InternalError> {
    let mut doc = parse_document(xml)
        .map_err(|e| InternalError::Serialization(format!("cannot parse own message: {e}")))?;
    let id = doc
        .attr("ID")
        .ok_or_else(|| InternalError::Serialization("message has no ID to reference".into()))?
        .to_owned();

    let canonical = canonicalize(&doc, &[])
        .map_err(|e| InternalError::Serialization(format!("canonicalization failed: {e}")))?;
    let digest = openssl::hash::hash(MessageDigest::sha256(), canonical.as_bytes())
        .map_err(|e| InternalError::Serialization(format!("digest failed: {e}")))?;

    let signed_info = format!(
        r##"<ds:SignedInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:CanonicalizationMethod Algorithm="{c14n}"></ds:CanonicalizationMethod><ds:SignatureMethod Algorithm="{sig}"></ds:SignatureMethod><ds:Reference URI="#{id}"><ds:Transforms><ds:Transform Algorithm="{enveloped}"></ds:Transform><ds:Transform Algorithm="{c14n}"></ds:Transform></ds:Transforms><ds:DigestMethod Algorithm="{dig}"></ds:DigestMethod><ds:DigestValue>{value}</ds:DigestValue></ds:Reference></ds:SignedInfo>"##,
        c14n = alg::EXC_C14N,
        sig = alg::RSA_SHA256,
        enveloped = alg::ENVELOPED,
        dig = alg::DIGEST_SHA256,
        id = escape_attr(&id),
        value = STANDARD.encode(&digest),
    );

    let signed_info_doc = parse_document(&signed_info)
        .map_err(|e| InternalError::Serialization(format!("SignedInfo parse failed: {e}")))?;
    let sign_input = canonicalize(&signed_info_doc, &[])
        .map_err(|e| InternalError::Serialization(format!("SignedInfo c14n failed: {e}")))?;

    let mut signer = Signer::new(MessageDigest::sha256(), credential.key())
        .map_err(|e| InternalError::Credential(format!("signer init failed: {e}")))?;
    signer
        .update(sign_input.as_bytes())
        .map_err(|e| InternalError::Credential(format!("signing failed: {e}")))?;
    let signature_value = signer
        .sign_to_vec()
        .map_err(|e| InternalError::Credential(format!("signing failed: {e}")))?;

    let signature_xml = format!(
        r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">{signed_info}<ds:SignatureValue>{value}</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>"#,
        value = STANDARD.encode(&signature_value),
        cert = credential.certificate_base64()?,
    );
    let signature_el = parse_document(&signature_xml)
        .map_err(|e| InternalError::Serialization(format!("Signature parse failed: {e}")))?;

    // Insert after Issuer per the SAML signature profile; first child
    // position when the message carries no Issuer.
    let issuer_position = doc.children.iter().position(
        |node| matches!(node, Node::Element(el) if el.is(ns::SAML, "Issuer")),
    );
    let insert_at = issuer_position.map(|i| i + 1).unwrap_or(0);
    doc.children.insert(insert_at, Node::Element(signature_el));

    Ok(serialize(&doc))
}

/// Verify the enveloped signature on the element with the given ID.
///
/// Returns `false` — never an error — when the element carries no
/// signature, when the signature is structurally invalid, or when no
/// trusted key validates it.
pub fn verify_enveloped(
    root: &Element,
    target_ns: &str,
    target_local: &str,
    target_id: &str,
    trusted_keys: &[PKey<Public>],
) -> bool {
    let Some(target) = root.find_with_scope(&|el| {
        el.is(target_ns, target_local) && el.attr("ID") == Some(target_id)
    }) else {
        tracing::debug!(target_id, "signature target element not found");
        return false;
    };

    let Some(signature) = target.child(ns::DSIG, "Signature") else {
        return false;
    };

    let Some(params) = structural_check(signature, target_id) else {
        tracing::warn!(target_id, "signature failed SAML-profile structural validation");
        return false;
    };

    // Digest: canonicalize the target with its signature removed.
    let mut unsigned = target.clone();
    unsigned.children.retain(
        |node| !matches!(node, Node::Element(el) if el.is(ns::DSIG, "Signature")),
    );
    let Ok(canonical) = canonicalize(&unsigned, &params.reference_prefixes) else {
        return false;
    };
    let Ok(actual_digest) = openssl::hash::hash(params.digest_method, canonical.as_bytes()) else {
        return false;
    };
    let Ok(expected_digest) = STANDARD.decode(&params.digest_value) else {
        return false;
    };
    if actual_digest.as_ref() != expected_digest.as_slice() {
        tracing::debug!(target_id, "reference digest mismatch");
        return false;
    }

    // Signature: canonicalize SignedInfo as it sits in the document.
    // Pinned by node identity to the Signature element that passed the
    // structural check, so a decoy SignedInfo elsewhere in the subtree
    // cannot be substituted.
    let Some(checked_signed_info) = signature.child(ns::DSIG, "SignedInfo") else {
        return false;
    };
    let Some(signed_info) =
        target.find_with_scope(&|el| std::ptr::eq(el, checked_signed_info))
    else {
        return false;
    };
    let Ok(sign_input) = canonicalize(&signed_info, &params.signed_info_prefixes) else {
        return false;
    };
    let Ok(signature_bytes) = STANDARD.decode(&params.signature_value) else {
        return false;
    };

    trusted_keys.iter().any(|key| {
        verify_bytes(
            params.signature_method,
            key,
            sign_input.as_bytes(),
            &signature_bytes,
        )
    })
}

struct SignatureParams {
    signature_method: MessageDigest,
    digest_method: MessageDigest,
    digest_value: String,
    signature_value: String,
    reference_prefixes: Vec<String>,
    signed_info_prefixes: Vec<String>,
}

/// SAML-profile structural validation of a Signature element. Returns
/// `None` when the structure is unacceptable, regardless of whether the
/// cryptographic material would verify.
fn structural_check(signature: &Element, target_id: &str) -> Option<SignatureParams> {
    if signature.children_named(ns::DSIG, "SignedInfo").count() != 1
        || signature.children_named(ns::DSIG, "SignatureValue").count() != 1
        || signature.children_named(ns::DSIG, "KeyInfo").count() > 1
    {
        return None;
    }
    let signed_info = signature.child(ns::DSIG, "SignedInfo")?;

    let c14n_method = signed_info.child(ns::DSIG, "CanonicalizationMethod")?;
    if c14n_method.attr("Algorithm") != Some(alg::EXC_C14N) {
        return None;
    }
    let signed_info_prefixes = inclusive_prefixes(c14n_method);

    let signature_method = signed_info
        .child(ns::DSIG, "SignatureMethod")
        .and_then(|m| m.attr("Algorithm"))
        .and_then(digest_for_signature_alg)?;

    if signed_info.children_named(ns::DSIG, "Reference").count() != 1 {
        return None;
    }
    let reference = signed_info.child(ns::DSIG, "Reference")?;
    let expected_uri = format!("#{target_id}");
    if reference.attr("URI") != Some(expected_uri.as_str()) {
        return None;
    }

    let transforms: Vec<&Element> = reference
        .child(ns::DSIG, "Transforms")
        .map(|t| t.children_named(ns::DSIG, "Transform").collect())
        .unwrap_or_default();
    if transforms.is_empty() || transforms.len() > 2 {
        return None;
    }
    let mut has_enveloped = false;
    let mut reference_prefixes = Vec::new();
    for transform in &transforms {
        match transform.attr("Algorithm") {
            Some(alg::ENVELOPED) => has_enveloped = true,
            Some(alg::EXC_C14N) => reference_prefixes = inclusive_prefixes(transform),
            _ => return None,
        }
    }
    if !has_enveloped {
        return None;
    }

    let digest_method = reference
        .child(ns::DSIG, "DigestMethod")
        .and_then(|m| m.attr("Algorithm"))
        .and_then(digest_for_digest_alg)?;

    let digest_value = compact(&reference.child(ns::DSIG, "DigestValue")?.text());
    let signature_value = compact(&signature.child(ns::DSIG, "SignatureValue")?.text());

    Some(SignatureParams {
        signature_method,
        digest_method,
        digest_value,
        signature_value,
        reference_prefixes,
        signed_info_prefixes,
    })
}

fn inclusive_prefixes(method: &Element) -> Vec<String> {
    method
        .child(ns::EXC_C14N, "InclusiveNamespaces")
        .and_then(|el| el.attr("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default()
}

/// Base64 payloads arrive line-wrapped from some IdPs.
fn compact(value: &str) -> String {
    value.split_whitespace().collect()
}

fn verify_bytes(
    digest: MessageDigest,
    key: &PKey<Public>,
    data: &[u8],
    signature: &[u8],
) -> bool {
    let Ok(mut verifier) = Verifier::new(digest, key) else {
        return false;
    };
    if verifier.update(data).is_err() {
        return false;
    }
    verifier.verify(signature).unwrap_or(false)
}

/// The `SigAlg` URI this credential's key type signs Redirect payloads
/// with. Needed before signing: the URI itself is part of the signed
/// query string.
pub fn query_signature_algorithm(credential: &Credential) -> &'static str {
    if credential.key().ec_key().is_ok() {
        alg::ECDSA_SHA256
    } else {
        alg::RSA_SHA256
    }
}

/// Sign the literal query-string bytes of a Redirect binding message.
/// The payload must already contain the `SigAlg` parameter.
pub fn sign_query(payload: &[u8], credential: &Credential) -> Result<Vec<u8>, InternalError> {
    let mut signer = Signer::new(MessageDigest::sha256(), credential.key())
        .map_err(|e| InternalError::Credential(format!("signer init failed: {e}")))?;
    signer
        .update(payload)
        .map_err(|e| InternalError::Credential(format!("signing failed: {e}")))?;
    signer
        .sign_to_vec()
        .map_err(|e| InternalError::Credential(format!("signing failed: {e}")))
}

/// Verify a Redirect-binding detached signature over the literal signed
/// payload. Succeeds if any trusted key validates it.
pub fn verify_query(
    payload: &[u8],
    sig_alg: &str,
    signature: &[u8],
    trusted_keys: &[PKey<Public>],
) -> bool {
    let Some(digest) = digest_for_signature_alg(sig_alg) else {
        tracing::debug!(sig_alg, "unsupported query signature algorithm");
        return false;
    };
    trusted_keys
        .iter()
        .any(|key| verify_bytes(digest, key, payload, signature))
}
