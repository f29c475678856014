//! Revocation status sources: OCSP with CRL fallback.
//!
//! [`StatusSource`] is the seam between the checker's state machine and
//! the network. The production [`HttpStatusSource`] resolves responder
//! and CRL URLs from configuration overrides or the certificate's own
//! extensions, downloads and caches CA-issuer certificates by URL, and
//! treats only a definitive revocation verdict as `Revoked` — every
//! other OCSP problem falls through to CRL, and a CRL problem is a
//! check failure, not a revocation finding.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use openssl::hash::MessageDigest;
use openssl::ocsp::{OcspCertId, OcspCertStatus, OcspFlag, OcspRequest, OcspResponse,
    OcspResponseStatus};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{CrlStatus, X509, X509Crl};

use crate::config::RevocationConfig;
use crate::error::RevocationCheckError;

/// Outcome of a completed revocation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Good,
    Revoked,
}

/// Where certificate status answers come from.
///
/// The production implementation talks OCSP/CRL over HTTP; tests swap in
/// scripted fakes.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn check(&self, certificate: &X509) -> Result<CertStatus, RevocationCheckError>;
}

/// OCSP-preferring, CRL-falling-back status source.
pub struct HttpStatusSource {
    client: reqwest::Client,
    config: RevocationConfig,
    /// Downloaded CA-issuer certificates, cached by URL.
    ca_cache: DashMap<String, X509>,
}

impl HttpStatusSource {
    pub fn new(config: RevocationConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            ca_cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn check(&self, certificate: &X509) -> Result<CertStatus, RevocationCheckError> {
        match self.check_ocsp(certificate).await {
            Ok(status) => return Ok(status),
            Err(e) => {
                // Any OCSP trouble short of a definitive revocation
                // verdict falls through to CRL.
                tracing::warn!(error = %e, "OCSP check failed, falling back to CRL");
            }
        }

        if self.config.retry_delay_secs > 0 {
            tokio::time::sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
        }

        self.check_crl(certificate).await
    }
}

impl HttpStatusSource {
    async fn check_ocsp(&self, certificate: &X509) -> Result<CertStatus, RevocationCheckError> {
        let responder = self
            .config
            .ocsp_responder_override
            .clone()
            .or_else(|| ocsp_responder_from_cert(certificate))
            .ok_or(RevocationCheckError::NoSource)?;

        let issuer = self
            .resolve_issuer(certificate)
            .await?
            .ok_or(RevocationCheckError::NoSource)?;

        let request_der = build_ocsp_request(certificate, &issuer)?;
        let response_bytes = self
            .client
            .post(&responder)
            .header("Content-Type", "application/ocsp-request")
            .body(request_der)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RevocationCheckError::Network(format!("OCSP POST failed: {e}")))?
            .bytes()
            .await
            .map_err(|e| RevocationCheckError::Network(format!("OCSP read failed: {e}")))?;

        evaluate_ocsp_response(&response_bytes, certificate, &issuer)
    }

    async fn check_crl(&self, certificate: &X509) -> Result<CertStatus, RevocationCheckError> {
        let url = self
            .config
            .crl_url_override
            .clone()
            .or_else(|| crl_url_from_cert(certificate))
            .ok_or(RevocationCheckError::NoSource)?;

        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RevocationCheckError::Network(format!("CRL fetch failed: {e}")))?
            .bytes()
            .await
            .map_err(|e| RevocationCheckError::Network(format!("CRL read failed: {e}")))?;

        let crl = X509Crl::from_der(&bytes)
            .or_else(|_| X509Crl::from_pem(&bytes))
            .map_err(|e| RevocationCheckError::Crypto(format!("unparseable CRL: {e}")))?;

        if self.config.verify_crl_signature {
            match self.resolve_issuer(certificate).await? {
                Some(issuer) => {
                    let key = issuer.public_key().map_err(|e| {
                        RevocationCheckError::Crypto(format!("issuer key unavailable: {e}"))
                    })?;
                    let valid = crl.verify(&key).map_err(|e| {
                        RevocationCheckError::Crypto(format!("CRL verify errored: {e}"))
                    })?;
                    if !valid {
                        return Err(RevocationCheckError::Crypto(
                            "CRL signature does not verify against issuing CA".into(),
                        ));
                    }
                }
                None => {
                    tracing::warn!(url = %url, "no issuer certificate available, using unverified CRL");
                }
            }
        }

        match crl.get_by_cert(certificate) {
            CrlStatus::Revoked(_) => Ok(CertStatus::Revoked),
            CrlStatus::NotRevoked | CrlStatus::RemoveFromCrl(_) => Ok(CertStatus::Good),
        }
    }

    /// Resolve the issuing CA certificate: configured override URL or
    /// the certificate's AIA ca-issuers entry, downloaded once and
    /// cached by URL.
    async fn resolve_issuer(
        &self,
        certificate: &X509,
    ) -> Result<Option<X509>, RevocationCheckError> {
        let Some(url) = self
            .config
            .ca_issuer_override
            .clone()
            .or_else(|| ca_issuer_from_cert(certificate))
        else {
            return Ok(None);
        };

        if let Some(cached) = self.ca_cache.get(&url) {
            return Ok(Some(cached.clone()));
        }

        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RevocationCheckError::Network(format!("CA fetch failed: {e}")))?
            .bytes()
            .await
            .map_err(|e| RevocationCheckError::Network(format!("CA read failed: {e}")))?;

        let issuer = X509::from_der(&bytes)
            .or_else(|_| X509::from_pem(&bytes))
            .map_err(|e| {
                RevocationCheckError::Crypto(format!("unparseable CA certificate: {e}"))
            })?;
        self.ca_cache.insert(url, issuer.clone());
        Ok(Some(issuer))
    }
}

fn build_ocsp_request(
    certificate: &X509,
    issuer: &X509,
) -> Result<Vec<u8>, RevocationCheckError> {
    let cert_id = OcspCertId::from_cert(MessageDigest::sha1(), certificate, issuer)
        .map_err(|e| RevocationCheckError::Crypto(format!("OCSP cert id failed: {e}")))?;
    let mut request = OcspRequest::new()
        .map_err(|e| RevocationCheckError::Crypto(format!("OCSP request init failed: {e}")))?;
    request
        .add_id(cert_id)
        .map_err(|e| RevocationCheckError::Crypto(format!("OCSP request build failed: {e}")))?;
    request
        .to_der()
        .map_err(|e| RevocationCheckError::Crypto(format!("OCSP request encode failed: {e}")))
}

fn evaluate_ocsp_response(
    bytes: &[u8],
    certificate: &X509,
    issuer: &X509,
) -> Result<CertStatus, RevocationCheckError> {
    let response = OcspResponse::from_der(bytes)
        .map_err(|e| RevocationCheckError::Crypto(format!("unparseable OCSP response: {e}")))?;
    if response.status() != OcspResponseStatus::SUCCESSFUL {
        return Err(RevocationCheckError::Crypto(format!(
            "OCSP responder status {:?}",
            response.status()
        )));
    }
    let basic = response
        .basic()
        .map_err(|e| RevocationCheckError::Crypto(format!("OCSP basic decode failed: {e}")))?;

    let mut trusted = Stack::new()
        .map_err(|e| RevocationCheckError::Crypto(e.to_string()))?;
    trusted
        .push(issuer.clone())
        .map_err(|e| RevocationCheckError::Crypto(e.to_string()))?;
    let mut store = X509StoreBuilder::new()
        .map_err(|e| RevocationCheckError::Crypto(e.to_string()))?;
    store
        .add_cert(issuer.clone())
        .map_err(|e| RevocationCheckError::Crypto(e.to_string()))?;
    basic
        .verify(&trusted, &store.build(), OcspFlag::TRUST_OTHER)
        .map_err(|e| {
            RevocationCheckError::Crypto(format!("OCSP response signature invalid: {e}"))
        })?;

    let cert_id = OcspCertId::from_cert(MessageDigest::sha1(), certificate, issuer)
        .map_err(|e| RevocationCheckError::Crypto(e.to_string()))?;
    let status = basic.find_status(&cert_id).ok_or_else(|| {
        RevocationCheckError::Crypto("OCSP response answers a different certificate".into())
    })?;

    // A definitive revocation verdict, as opposed to a failed check.
    if status.status == OcspCertStatus::REVOKED {
        return Ok(CertStatus::Revoked);
    }
    if status.status == OcspCertStatus::GOOD {
        return Ok(CertStatus::Good);
    }
    Err(RevocationCheckError::Crypto(
        "OCSP responder does not know the certificate".into(),
    ))
}

fn ocsp_responder_from_cert(certificate: &X509) -> Option<String> {
    access_uris(certificate, openssl::nid::Nid::AD_OCSP)
        .into_iter()
        .next()
}

fn ca_issuer_from_cert(certificate: &X509) -> Option<String> {
    access_uris(certificate, openssl::nid::Nid::AD_CA_ISSUERS)
        .into_iter()
        .next()
}

fn access_uris(certificate: &X509, method: openssl::nid::Nid) -> Vec<String> {
    certificate
        .authority_info()
        .map(|descriptions| {
            descriptions
                .iter()
                .filter(|d| d.method().nid() == method)
                .filter_map(|d| d.location().uri().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

fn crl_url_from_cert(certificate: &X509) -> Option<String> {
    certificate.crl_distribution_points().and_then(|points| {
        points
            .iter()
            .filter_map(|dp| dp.distpoint())
            .filter_map(|name| name.fullname())
            .flat_map(|names| names.iter())
            .filter_map(|general_name| general_name.uri().map(str::to_owned))
            .next()
    })
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::credentials::test_support::generate_keypair;

    fn config_with(
        ocsp: Option<String>,
        crl: Option<String>,
        ca: Option<String>,
    ) -> RevocationConfig {
        RevocationConfig {
            ocsp_responder_override: ocsp,
            crl_url_override: crl,
            ca_issuer_override: ca,
            retry_delay_secs: 0,
            http_timeout_secs: 2,
            verify_crl_signature: false,
            ..RevocationConfig::default()
        }
    }

    #[tokio::test]
    async fn no_sources_at_all_is_a_check_failure() {
        let (_, cert) = generate_keypair("bare.example.com");
        let source = HttpStatusSource::new(config_with(None, None, None));
        // The test certificate carries no AIA and no CRL distribution
        // points, so both legs report NoSource.
        assert!(matches!(
            source.check(&cert).await,
            Err(RevocationCheckError::NoSource)
        ));
    }

    #[tokio::test]
    async fn garbage_crl_is_a_crypto_failure_not_a_revocation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/crl.der"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not a crl".to_vec()))
            .mount(&server)
            .await;

        let (_, cert) = generate_keypair("idp.example.com");
        let source = HttpStatusSource::new(config_with(
            None,
            Some(format!("{}/crl.der", server.uri())),
            None,
        ));
        assert!(matches!(
            source.check(&cert).await,
            Err(RevocationCheckError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_crl_endpoint_is_a_network_failure() {
        let (_, cert) = generate_keypair("idp.example.com");
        // Nothing listens on this port.
        let source = HttpStatusSource::new(config_with(
            None,
            Some("http://127.0.0.1:1/crl.der".into()),
            None,
        ));
        assert!(matches!(
            source.check(&cert).await,
            Err(RevocationCheckError::Network(_))
        ));
    }

    #[tokio::test]
    async fn ca_certificate_is_downloaded_once_and_cached() {
        let server = MockServer::start().await;
        let (_, ca_cert) = generate_keypair("ca.example.com");
        Mock::given(method("GET"))
            .and(path("/ca.der"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(ca_cert.to_der().unwrap()),
            )
            .expect(1)
            .mount(&server)
            .await;
        // The OCSP responder answers garbage; the interesting part is
        // the CA download on the way there.
        Mock::given(method("POST"))
            .and(path("/ocsp"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"garbage".to_vec()))
            .mount(&server)
            .await;

        let (_, cert) = generate_keypair("idp.example.com");
        let source = HttpStatusSource::new(config_with(
            Some(format!("{}/ocsp", server.uri())),
            None,
            Some(format!("{}/ca.der", server.uri())),
        ));

        for _ in 0..3 {
            let result = source.check(&cert).await;
            assert!(result.is_err());
        }
        // wiremock verifies expect(1) on drop.
    }

    #[tokio::test]
    async fn ocsp_failure_falls_back_to_crl() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ocsp"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/crl.der"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"junk".to_vec()))
            .expect(1..)
            .mount(&server)
            .await;

        let (_, ca_cert) = generate_keypair("ca.example.com");
        Mock::given(method("GET"))
            .and(path("/ca.der"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(ca_cert.to_der().unwrap()),
            )
            .mount(&server)
            .await;

        let (_, cert) = generate_keypair("idp.example.com");
        let source = HttpStatusSource::new(config_with(
            Some(format!("{}/ocsp", server.uri())),
            Some(format!("{}/crl.der", server.uri())),
            Some(format!("{}/ca.der", server.uri())),
        ));

        // OCSP POST returns 500; the CRL leg runs and fails on junk.
        assert!(matches!(
            source.check(&cert).await,
            Err(RevocationCheckError::Crypto(_))
        ));
    }
}
