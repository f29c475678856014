//! Signing and decryption credentials.
//!
//! A [`Credential`] is an asymmetric keypair plus its X.509 certificate,
//! tagged with the role it plays in the federation. Credentials are
//! immutable after loading; every service borrows them through the
//! [`CredentialStore`], never copies them.

use std::fmt;
use std::sync::Arc;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use crate::error::InternalError;

/// The role a credential plays for this service provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialRole {
    /// The active signing/decryption keypair.
    OwnPrimary,
    /// The previous keypair, kept alive through a rotation so in-flight
    /// messages and re-encrypted assertions still decrypt.
    OwnSecondary,
    /// A federation peer's certificate; public material only.
    TrustedPeer,
}

/// An immutable keypair + certificate.
pub struct Credential {
    key: PKey<Private>,
    certificate: X509,
    role: CredentialRole,
}

impl Credential {
    pub fn new(key: PKey<Private>, certificate: X509, role: CredentialRole) -> Self {
        Self {
            key,
            certificate,
            role,
        }
    }

    /// Load a credential from PEM-encoded private key and certificate.
    ///
    /// The key must be PEM (PKCS#8 or PKCS#1); failure to parse is a
    /// local misconfiguration, never the peer's fault.
    pub fn from_pem(
        key_pem: &[u8],
        certificate_pem: &[u8],
        role: CredentialRole,
    ) -> Result<Self, InternalError> {
        let key = PKey::private_key_from_pem(key_pem).map_err(|e| {
            InternalError::Credential(format!("failed to parse private key PEM: {e}"))
        })?;
        let certificate = X509::from_pem(certificate_pem).map_err(|e| {
            InternalError::Credential(format!("failed to parse certificate PEM: {e}"))
        })?;
        Ok(Self::new(key, certificate, role))
    }

    pub fn key(&self) -> &PKey<Private> {
        &self.key
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn role(&self) -> CredentialRole {
        self.role
    }

    /// Base64 certificate body without PEM armor, as embedded in
    /// KeyInfo/X509Certificate elements and metadata documents.
    pub fn certificate_base64(&self) -> Result<String, InternalError> {
        use base64::Engine;
        let der = self.certificate.to_der().map_err(|e| {
            InternalError::Credential(format!("failed to DER-encode certificate: {e}"))
        })?;
        Ok(base64::engine::general_purpose::STANDARD.encode(der))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Configuration-scoped store of our own credentials.
///
/// Holds the primary keypair and, during rotation, the outgoing
/// secondary. Decryption tries primary then secondary; signing always
/// uses primary.
#[derive(Clone)]
pub struct CredentialStore {
    primary: Arc<Credential>,
    secondary: Option<Arc<Credential>>,
}

impl CredentialStore {
    pub fn new(primary: Credential, secondary: Option<Credential>) -> Self {
        Self {
            primary: Arc::new(primary),
            secondary: secondary.map(Arc::new),
        }
    }

    pub fn primary(&self) -> &Credential {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&Credential> {
        self.secondary.as_deref()
    }

    /// Decryption key candidates in the order they must be tried.
    pub fn decryption_candidates(&self) -> impl Iterator<Item = &Credential> {
        std::iter::once(self.primary.as_ref()).chain(self.secondary.as_deref())
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("has_secondary", &self.secondary.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::x509::{X509, X509Builder, X509NameBuilder};

    /// Generate a throwaway self-signed certificate and key pair.
    pub fn generate_keypair(common_name: &str) -> (PKey<Private>, X509) {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", common_name).unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(rand::random::<u32>() | 1).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        (key, builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::generate_keypair;
    use super::*;

    #[test]
    fn from_pem_round_trip() {
        let (key, cert) = generate_keypair("sp.example.com");
        let key_pem = key.private_key_to_pem_pkcs8().unwrap();
        let cert_pem = cert.to_pem().unwrap();

        let credential =
            Credential::from_pem(&key_pem, &cert_pem, CredentialRole::OwnPrimary).unwrap();
        assert_eq!(credential.role(), CredentialRole::OwnPrimary);
        assert!(
            credential
                .certificate()
                .public_key()
                .unwrap()
                .public_eq(credential.key())
        );
    }

    #[test]
    fn from_pem_rejects_garbage_key() {
        let (_, cert) = generate_keypair("sp.example.com");
        let err = Credential::from_pem(
            b"not a key",
            &cert.to_pem().unwrap(),
            CredentialRole::OwnPrimary,
        )
        .unwrap_err();
        assert!(matches!(err, InternalError::Credential(_)));
    }

    #[test]
    fn decryption_candidates_order_primary_first() {
        let (key_a, cert_a) = generate_keypair("a");
        let (key_b, cert_b) = generate_keypair("b");
        let store = CredentialStore::new(
            Credential::new(key_a, cert_a, CredentialRole::OwnPrimary),
            Some(Credential::new(key_b, cert_b, CredentialRole::OwnSecondary)),
        );
        let roles: Vec<_> = store.decryption_candidates().map(|c| c.role()).collect();
        assert_eq!(
            roles,
            vec![CredentialRole::OwnPrimary, CredentialRole::OwnSecondary]
        );
    }

    #[test]
    fn certificate_base64_has_no_pem_armor() {
        let (key, cert) = generate_keypair("sp.example.com");
        let credential = Credential::new(key, cert, CredentialRole::OwnPrimary);
        let b64 = credential.certificate_base64().unwrap();
        assert!(!b64.contains("BEGIN"));
        assert!(!b64.contains('\n'));
    }
}
