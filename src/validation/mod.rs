//! Response and assertion validation.
//!
//! The validator is an explicit ordered chain of named checks; each
//! returns a value and the chain stops at the first failure — no
//! exception unwinding, no generic errors. Checks are ordered so the
//! cheap non-cryptographic ones (status, destination, correlation) run
//! before signature verification and decryption: a malformed or
//! malicious message is rejected before any CPU is spent on crypto.

mod logout;

use openssl::pkey::{PKey, Public};
use openssl::x509::X509;

pub use logout::*;

use crate::config::SpConfig;
use crate::credentials::CredentialStore;
use crate::decrypt::decrypt_assertion;
use crate::error::{EngineError, ExternalError, ValidationFailure};
use crate::messages::{Assertion, Response, consts};
use crate::replay::{ConsumedAssertionSet, CorrelationRegistry};
use crate::signature::verify_enveloped;
use crate::xml::{Element, ns, parse_document};

/// Everything a validation pass needs, borrowed from the engine.
pub struct ValidationContext<'a> {
    pub sp: &'a SpConfig,
    pub correlation: &'a CorrelationRegistry,
    pub consumed: &'a ConsumedAssertionSet,
    pub credentials: &'a CredentialStore,
    /// The peer's currently-valid (non-revoked) signing certificates.
    pub trusted_certificates: &'a [X509],
    /// The caller asked for passive authentication, making a NoPassive
    /// refusal an acceptable terminal outcome.
    pub allow_passive: bool,
}

impl ValidationContext<'_> {
    fn trusted_keys(&self) -> Vec<PKey<Public>> {
        self.trusted_certificates
            .iter()
            .filter_map(|cert| cert.public_key().ok())
            .collect()
    }

    fn skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sp.clock_skew_secs as i64)
    }
}

/// The accepted end state of a validated login response.
#[derive(Debug)]
pub enum ResponseOutcome {
    Accepted(Box<ValidatedAssertion>),
    /// The IdP refused passive authentication and the caller allowed
    /// passive mode: a distinct terminal outcome, not an error and not
    /// an assertion-bearing success.
    PassiveRefused,
}

/// A fully validated assertion plus the facts established on the way.
#[derive(Debug)]
pub struct ValidatedAssertion {
    pub assertion: Assertion,
    /// Issuer taken from the response or, failing that, the assertion.
    pub issuer: String,
    /// Entity ID the original request was sent to; `None` for accepted
    /// unsolicited responses.
    pub solicited_by: Option<String>,
}

/// Validate an authentication Response end to end.
///
/// Check order (first failure aborts): status, destination,
/// correlation, presence, response signature, decryption, assertion
/// structure, assertion signature, conditions, subject confirmation,
/// replay.
pub fn validate_response(
    xml: &str,
    ctx: &ValidationContext<'_>,
) -> Result<ResponseOutcome, EngineError> {
    let doc = parse_document(xml)
        .map_err(|e| ExternalError::MalformedMessage(format!("unparseable response: {e}")))?;
    let response = Response::from_element(&doc)
        .map_err(|e| ExternalError::MalformedMessage(e.to_string()))?;

    // 1. Status.
    match status_check(&response, ctx)? {
        StatusOutcome::PassiveRefused => {
            tracing::info!(response_id = %response.id, "IdP refused passive authentication");
            return Ok(ResponseOutcome::PassiveRefused);
        }
        StatusOutcome::Success => {}
    }

    // 2. Destination.
    destination_check(response.destination.as_deref(), &ctx.sp.acs_url)?;

    // 3. Correlation.
    let solicited_by = correlation_check(&response, ctx)?;

    // 4. Presence.
    if response.assertion_count() != 1 {
        return Err(ExternalError::MalformedMessage(format!(
            "expected exactly one assertion, found {}",
            response.assertion_count()
        ))
        .into());
    }

    let trusted_keys = ctx.trusted_keys();

    // 5. Response signature.
    if response.has_signature
        && !verify_enveloped(&doc, ns::SAMLP, "Response", &response.id, &trusted_keys)
    {
        fail(ValidationFailure::SignatureInvalid, &response.id)?;
    }

    // 6. Decryption.
    let (assertion, decrypted_element) = if let Some(encrypted) =
        response.encrypted_assertions.first()
    {
        let (assertion, element) = decrypt_assertion(encrypted, ctx.credentials)
            .map_err(|failure| fail_err(failure, &response.id))?;
        (assertion, Some(element))
    } else {
        if !ctx.sp.allow_unencrypted_assertions {
            tracing::warn!(
                response_id = %response.id,
                "plaintext assertion received where encryption is mandated"
            );
            fail(ValidationFailure::DecryptionFailed, &response.id)?;
        }
        (response.assertions[0].clone(), None)
    };

    // 7. Assertion structure.
    if assertion.version.as_deref() != Some("2.0") {
        return Err(ExternalError::MalformedMessage(format!(
            "assertion version {:?} is not 2.0",
            assertion.version
        ))
        .into());
    }
    if assertion.id.is_empty() {
        return Err(ExternalError::MalformedMessage("assertion has empty ID".into()).into());
    }

    // 8. Assertion signature. Either the response or the assertion must
    //    carry a valid signature; each one present must verify.
    if assertion.has_signature {
        let valid = match &decrypted_element {
            Some(element) => {
                verify_enveloped(element, ns::SAML, "Assertion", &assertion.id, &trusted_keys)
            }
            None => verify_enveloped(&doc, ns::SAML, "Assertion", &assertion.id, &trusted_keys),
        };
        if !valid {
            fail(ValidationFailure::SignatureInvalid, &assertion.id)?;
        }
    } else if !response.has_signature {
        tracing::warn!(
            response_id = %response.id,
            "neither response nor assertion is signed"
        );
        fail(ValidationFailure::SignatureInvalid, &response.id)?;
    }

    // 9. Conditions.
    conditions_check(&assertion, ctx)?;

    // 10. Subject confirmation.
    subject_confirmation_check(&assertion, ctx)?;

    // 11. Replay. Atomic insert: at most one concurrent validation of
    //     the same assertion ID gets past this line.
    if !ctx.consumed.mark_consumed(&assertion.id) {
        fail(
            ValidationFailure::ReplayDetected {
                id: assertion.id.clone(),
            },
            &assertion.id,
        )?;
    }

    let issuer = response
        .issuer
        .clone()
        .or_else(|| assertion.issuer.clone())
        .unwrap_or_default();

    tracing::info!(
        assertion_id = %assertion.id,
        issuer = %issuer,
        solicited = solicited_by.is_some(),
        "response validated"
    );

    Ok(ResponseOutcome::Accepted(Box::new(ValidatedAssertion {
        assertion,
        issuer,
        solicited_by,
    })))
}

enum StatusOutcome {
    Success,
    PassiveRefused,
}

fn status_check(
    response: &Response,
    ctx: &ValidationContext<'_>,
) -> Result<StatusOutcome, EngineError> {
    if response.status.is_success() {
        return Ok(StatusOutcome::Success);
    }
    if ctx.allow_passive && response.status.sub_code.as_deref() == Some(consts::STATUS_NO_PASSIVE)
    {
        return Ok(StatusOutcome::PassiveRefused);
    }
    Err(fail_err(
        ValidationFailure::StatusMismatch {
            status: response.status.code.clone(),
            sub_status: response.status.sub_code.clone(),
        },
        &response.id,
    )
    .into())
}

pub(crate) fn destination_check(
    destination: Option<&str>,
    expected: &str,
) -> Result<(), ValidationFailure> {
    match destination {
        // Absent Destination is tolerated for backward compatibility
        // with older IdPs and treated as a match.
        None => Ok(()),
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => {
            let failure = ValidationFailure::DestinationMismatch {
                expected: expected.to_owned(),
                actual: actual.to_owned(),
            };
            tracing::warn!(kind = failure.kind(), expected, actual, "validation failed");
            Err(failure)
        }
    }
}

/// Consume the correlation entry for a solicited response; vet the
/// issuer of an unsolicited one.
fn correlation_check(
    response: &Response,
    ctx: &ValidationContext<'_>,
) -> Result<Option<String>, EngineError> {
    match &response.in_response_to {
        Some(request_id) => {
            let Some(idp_entity_id) = ctx.correlation.consume(request_id) else {
                // Never issued, already answered, or evicted: either way
                // the at-most-once property is what tripped.
                return Err(fail_err(
                    ValidationFailure::ReplayDetected {
                        id: request_id.clone(),
                    },
                    &response.id,
                )
                .into());
            };
            if let Some(issuer) = &response.issuer {
                if issuer != &idp_entity_id {
                    return Err(fail_err(
                        ValidationFailure::IssuerMismatch {
                            actual: Some(issuer.clone()),
                        },
                        &response.id,
                    )
                    .into());
                }
            }
            Ok(Some(idp_entity_id))
        }
        None => {
            let issuer = response
                .issuer
                .clone()
                .or_else(|| response.assertions.first().and_then(|a| a.issuer.clone()));
            if issuer.is_none() {
                return Err(fail_err(
                    ValidationFailure::IssuerMismatch { actual: None },
                    &response.id,
                )
                .into());
            }
            if !ctx.sp.allow_idp_initiated {
                tracing::warn!(
                    response_id = %response.id,
                    "unsolicited response refused: IdP-initiated SSO is disabled"
                );
                return Err(fail_err(
                    ValidationFailure::IssuerMismatch { actual: issuer },
                    &response.id,
                )
                .into());
            }
            Ok(None)
        }
    }
}

fn conditions_check(
    assertion: &Assertion,
    ctx: &ValidationContext<'_>,
) -> Result<(), EngineError> {
    let now = chrono::Utc::now();
    let skew = ctx.skew();

    let Some(conditions) = &assertion.conditions else {
        // No conditions means no audience restriction names us.
        return Err(fail_err(
            ValidationFailure::AudienceMismatch {
                expected: ctx.sp.entity_id.clone(),
            },
            &assertion.id,
        )
        .into());
    };

    if let Some(not_before) = conditions.not_before {
        if not_before - now > skew {
            fail(ValidationFailure::NotYetValid, &assertion.id)?;
        }
    }
    if let Some(not_on_or_after) = conditions.not_on_or_after {
        if now - not_on_or_after >= skew {
            fail(ValidationFailure::Expired, &assertion.id)?;
        }
    }

    let audience_matches = conditions
        .audience_restrictions
        .iter()
        .any(|restriction| restriction.iter().any(|a| a == &ctx.sp.entity_id));
    if !audience_matches {
        fail(
            ValidationFailure::AudienceMismatch {
                expected: ctx.sp.entity_id.clone(),
            },
            &assertion.id,
        )?;
    }
    Ok(())
}

fn subject_confirmation_check(
    assertion: &Assertion,
    ctx: &ValidationContext<'_>,
) -> Result<(), EngineError> {
    let now = chrono::Utc::now();
    let skew = ctx.skew();

    for confirmation in &assertion.subject_confirmations {
        if confirmation.method.as_deref() != Some(consts::CONFIRMATION_BEARER) {
            continue;
        }
        if confirmation.recipient.as_deref() != Some(ctx.sp.acs_url.as_str()) {
            fail(
                ValidationFailure::RecipientMismatch {
                    expected: ctx.sp.acs_url.clone(),
                    actual: confirmation.recipient.clone(),
                },
                &assertion.id,
            )?;
        }
        if let Some(not_on_or_after) = confirmation.not_on_or_after {
            if now - not_on_or_after >= skew {
                fail(ValidationFailure::Expired, &assertion.id)?;
            }
        }
    }
    Ok(())
}

/// Log and return a validation failure.
fn fail(failure: ValidationFailure, message_id: &str) -> Result<(), EngineError> {
    Err(fail_err(failure, message_id).into())
}

fn fail_err(failure: ValidationFailure, message_id: &str) -> ValidationFailure {
    tracing::warn!(
        kind = failure.kind(),
        message_id,
        %failure,
        "validation failed"
    );
    failure
}

/// Helper shared with the logout validator: verify whichever enveloped
/// signature the message carries.
pub(crate) fn verify_message_signature(
    doc: &Element,
    message_ns: &str,
    local: &str,
    id: &str,
    ctx: &ValidationContext<'_>,
) -> bool {
    verify_enveloped(doc, message_ns, local, id, &ctx.trusted_keys())
}
