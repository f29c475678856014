//! EncryptedAssertion decryption.
//!
//! The encrypted symmetric key is located through a resolver chain, in
//! priority order: an EncryptedKey inline in the EncryptedData's
//! KeyInfo, then EncryptedKey elements alongside the EncryptedData
//! inside the EncryptedAssertion, then a KeyInfo RetrievalMethod
//! reference. The first resolver producing a usable key wins.
//!
//! Key transport is tried against the primary credential and then the
//! secondary, so a decryption-credential rotation needs no downtime.
//! Every cryptographic failure collapses into a single
//! [`ValidationFailure::DecryptionFailed`]; no partial plaintext ever
//! leaves this module.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use openssl::rsa::Padding;
use openssl::symm::{Cipher, Crypter, Mode};

use crate::credentials::CredentialStore;
use crate::error::ValidationFailure;
use crate::messages::Assertion;
use crate::xml::{Element, ns, parse_document};

/// xmlenc algorithm URIs.
pub mod alg {
    pub const AES128_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes128-cbc";
    pub const AES256_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes256-cbc";
    pub const AES128_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes128-gcm";
    pub const AES256_GCM: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";

    pub const RSA_OAEP: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p";
    pub const RSA_1_5: &str = "http://www.w3.org/2001/04/xmlenc#rsa-1_5";
}

/// Decrypt an EncryptedAssertion element into the plaintext assertion.
///
/// Returns the parsed assertion together with its document element so
/// the caller can verify the signature the plaintext carries.
pub fn decrypt_assertion(
    encrypted: &Element,
    credentials: &CredentialStore,
) -> Result<(Assertion, Element), ValidationFailure> {
    let encrypted_data = encrypted
        .child(ns::XENC, "EncryptedData")
        .ok_or(ValidationFailure::DecryptionFailed)?;

    let data_algorithm = encrypted_data
        .child(ns::XENC, "EncryptionMethod")
        .and_then(|m| m.attr("Algorithm"))
        .ok_or(ValidationFailure::DecryptionFailed)?
        .to_owned();

    let ciphertext = cipher_value(encrypted_data)?;
    let key = resolve_symmetric_key(encrypted, encrypted_data, &data_algorithm, credentials)?;
    let plaintext = decrypt_data(&data_algorithm, &key, &ciphertext)?;

    let plaintext = String::from_utf8(plaintext).map_err(|_| {
        tracing::warn!("decrypted assertion is not valid UTF-8");
        ValidationFailure::DecryptionFailed
    })?;
    let element = parse_document(&plaintext).map_err(|e| {
        tracing::warn!(error = %e, "decrypted assertion is not well-formed XML");
        ValidationFailure::DecryptionFailed
    })?;
    let assertion =
        Assertion::from_element(&element).map_err(|_| ValidationFailure::DecryptionFailed)?;

    Ok((assertion, element))
}

/// Locate and unwrap the symmetric key via the resolver chain.
fn resolve_symmetric_key(
    encrypted: &Element,
    encrypted_data: &Element,
    data_algorithm: &str,
    credentials: &CredentialStore,
) -> Result<Vec<u8>, ValidationFailure> {
    let expected_len = key_length(data_algorithm)?;
    let key_info = encrypted_data.child(ns::DSIG, "KeyInfo");

    // 1. Inline: EncryptedKey directly inside the KeyInfo.
    let inline = key_info
        .into_iter()
        .flat_map(|ki| ki.children_named(ns::XENC, "EncryptedKey"));

    // 2. Encrypted-element-type: EncryptedKey elements alongside the
    //    EncryptedData inside the EncryptedAssertion.
    let siblings = encrypted.children_named(ns::XENC, "EncryptedKey");

    // 3. RetrievalMethod: a KeyInfo reference to an EncryptedKey by Id.
    let retrieved = key_info
        .into_iter()
        .flat_map(|ki| ki.children_named(ns::DSIG, "RetrievalMethod"))
        .filter_map(|rm| rm.attr("URI"))
        .filter_map(|uri| uri.strip_prefix('#'))
        .filter_map(|id| {
            find_encrypted_key_by_id(encrypted, id)
        });

    for encrypted_key in inline.chain(siblings).chain(retrieved) {
        if let Some(key) = try_unwrap(encrypted_key, expected_len, credentials) {
            return Ok(key);
        }
    }

    tracing::warn!("no resolver produced a usable decryption key");
    Err(ValidationFailure::DecryptionFailed)
}

fn find_encrypted_key_by_id<'a>(scope: &'a Element, id: &str) -> Option<&'a Element> {
    if scope.is(ns::XENC, "EncryptedKey")
        && (scope.attr("Id") == Some(id) || scope.attr("ID") == Some(id))
    {
        return Some(scope);
    }
    scope
        .child_elements()
        .find_map(|child| find_encrypted_key_by_id(child, id))
}

/// Try the primary then the secondary credential against one
/// EncryptedKey candidate.
fn try_unwrap(
    encrypted_key: &Element,
    expected_len: usize,
    credentials: &CredentialStore,
) -> Option<Vec<u8>> {
    let transport = encrypted_key
        .child(ns::XENC, "EncryptionMethod")
        .and_then(|m| m.attr("Algorithm"))?;
    let padding = match transport {
        alg::RSA_OAEP => Padding::PKCS1_OAEP,
        alg::RSA_1_5 => Padding::PKCS1,
        _ => {
            tracing::debug!(transport, "unsupported key transport algorithm");
            return None;
        }
    };
    let wrapped = cipher_value(encrypted_key).ok()?;

    for credential in credentials.decryption_candidates() {
        let Ok(rsa) = credential.key().rsa() else {
            continue;
        };
        let mut buf = vec![0u8; rsa.size() as usize];
        if let Ok(len) = rsa.private_decrypt(&wrapped, &mut buf, padding) {
            if len == expected_len {
                buf.truncate(len);
                return Some(buf);
            }
        }
    }
    None
}

fn cipher_value(parent: &Element) -> Result<Vec<u8>, ValidationFailure> {
    let value = parent
        .child(ns::XENC, "CipherData")
        .and_then(|cd| cd.child(ns::XENC, "CipherValue"))
        .map(|cv| cv.text())
        .ok_or(ValidationFailure::DecryptionFailed)?;
    let compact: String = value.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|_| ValidationFailure::DecryptionFailed)
}

fn key_length(algorithm: &str) -> Result<usize, ValidationFailure> {
    match algorithm {
        alg::AES128_CBC | alg::AES128_GCM => Ok(16),
        alg::AES256_CBC | alg::AES256_GCM => Ok(32),
        _ => {
            tracing::warn!(algorithm, "unsupported data encryption algorithm");
            Err(ValidationFailure::DecryptionFailed)
        }
    }
}

fn decrypt_data(
    algorithm: &str,
    key: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>, ValidationFailure> {
    match algorithm {
        alg::AES128_CBC => decrypt_cbc(Cipher::aes_128_cbc(), key, payload),
        alg::AES256_CBC => decrypt_cbc(Cipher::aes_256_cbc(), key, payload),
        alg::AES128_GCM => decrypt_gcm(Cipher::aes_128_gcm(), key, payload),
        alg::AES256_GCM => decrypt_gcm(Cipher::aes_256_gcm(), key, payload),
        _ => Err(ValidationFailure::DecryptionFailed),
    }
}

/// xmlenc CBC: IV prefixed, ISO-like padding with the count in the last
/// byte. openssl's PKCS#7 unpadding would reject it, so unpad by hand.
fn decrypt_cbc(cipher: Cipher, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, ValidationFailure> {
    let block = cipher.block_size();
    if payload.len() < block * 2 || payload.len() % block != 0 {
        return Err(ValidationFailure::DecryptionFailed);
    }
    let (iv, ciphertext) = payload.split_at(block);

    let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv))
        .map_err(|_| ValidationFailure::DecryptionFailed)?;
    crypter.pad(false);
    let mut plaintext = vec![0u8; ciphertext.len() + block];
    let mut written = crypter
        .update(ciphertext, &mut plaintext)
        .map_err(|_| ValidationFailure::DecryptionFailed)?;
    written += crypter
        .finalize(&mut plaintext[written..])
        .map_err(|_| ValidationFailure::DecryptionFailed)?;
    plaintext.truncate(written);

    let pad_len = *plaintext.last().ok_or(ValidationFailure::DecryptionFailed)? as usize;
    if pad_len == 0 || pad_len > block || pad_len > plaintext.len() {
        return Err(ValidationFailure::DecryptionFailed);
    }
    plaintext.truncate(plaintext.len() - pad_len);
    Ok(plaintext)
}

/// xmlenc11 GCM: 12-byte IV prefixed, 16-byte tag appended.
fn decrypt_gcm(cipher: Cipher, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, ValidationFailure> {
    const IV_LEN: usize = 12;
    const TAG_LEN: usize = 16;
    if payload.len() < IV_LEN + TAG_LEN {
        return Err(ValidationFailure::DecryptionFailed);
    }
    let (iv, rest) = payload.split_at(IV_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

    openssl::symm::decrypt_aead(cipher, key, Some(iv), &[], ciphertext, tag)
        .map_err(|_| ValidationFailure::DecryptionFailed)
}
