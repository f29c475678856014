//! Logout message validation.
//!
//! The same ordered-check skeleton as the response validator, minus the
//! assertion-specific steps, plus the logout-only ones: expiry of the
//! LogoutRequest's NotOnOrAfter and the session-index match against the
//! session being torn down.

use super::{ValidationContext, destination_check, fail, fail_err, verify_message_signature};
use crate::error::{EngineError, ExternalError, ValidationFailure};
use crate::messages::{LogoutRequest, LogoutResponse};
use crate::xml::{Element, ns};

/// The session the application wants torn down, as the engine knows it.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub name_id: String,
    pub session_index: Option<String>,
}

/// Outcome of validating an inbound IdP-initiated LogoutRequest.
#[derive(Debug)]
pub struct LogoutRequestOutcome {
    pub request: LogoutRequest,
    /// Whether the request named the session the caller holds. Logout of
    /// an unknown session is acknowledged with success anyway — logout
    /// is idempotent — but only a match tears the local session down.
    pub matches_session: bool,
}

/// Validate an inbound LogoutRequest (IdP-initiated logout).
pub fn validate_logout_request(
    doc: &Element,
    ctx: &ValidationContext<'_>,
    session: Option<&SessionSnapshot>,
) -> Result<LogoutRequestOutcome, EngineError> {
    let request = LogoutRequest::from_element(doc)
        .map_err(|e| ExternalError::MalformedMessage(e.to_string()))?;

    // Destination: must name our SLO endpoint when present.
    if let Some(slo_url) = &ctx.sp.slo_url {
        destination_check(request.destination.as_deref(), slo_url)?;
    }

    // Issuer must be present for a back-channel/IdP-initiated request.
    if request.issuer.is_none() {
        return Err(
            fail_err(ValidationFailure::IssuerMismatch { actual: None }, &request.id).into(),
        );
    }

    // Expiry.
    if let Some(not_on_or_after) = request.not_on_or_after {
        let now = chrono::Utc::now();
        if now - not_on_or_after >= ctx.skew() {
            fail(ValidationFailure::Expired, &request.id)?;
        }
    }

    // Signature, when the document carries one.
    if request.has_signature
        && !verify_message_signature(doc, ns::SAMLP, "LogoutRequest", &request.id, ctx)
    {
        fail(ValidationFailure::SignatureInvalid, &request.id)?;
    }

    // Session-index match.
    let matches_session = match session {
        Some(session) => {
            let index_matches = request.session_indexes.is_empty()
                || session
                    .session_index
                    .as_deref()
                    .is_some_and(|index| request.session_indexes.iter().any(|i| i == index));
            let name_matches = request
                .name_id
                .as_ref()
                .is_none_or(|name_id| name_id.value == session.name_id);
            index_matches && name_matches
        }
        None => false,
    };

    if !matches_session {
        tracing::info!(
            request_id = %request.id,
            "logout request names no session we hold; acknowledging without teardown"
        );
    }

    Ok(LogoutRequestOutcome {
        request,
        matches_session,
    })
}

/// Validate an inbound LogoutResponse against the outstanding
/// LogoutRequest it answers.
pub fn validate_logout_response(
    doc: &Element,
    ctx: &ValidationContext<'_>,
) -> Result<LogoutResponse, EngineError> {
    let response = LogoutResponse::from_element(doc)
        .map_err(|e| ExternalError::MalformedMessage(e.to_string()))?;

    // 1. Status.
    if !response.status.is_success() {
        return Err(fail_err(
            ValidationFailure::StatusMismatch {
                status: response.status.code.clone(),
                sub_status: response.status.sub_code.clone(),
            },
            &response.id,
        )
        .into());
    }

    // 2. Destination: logout responses come back to our SLO endpoint.
    if let Some(slo_url) = &ctx.sp.slo_url {
        destination_check(response.destination.as_deref(), slo_url)?;
    }

    // 3. Correlation: a logout response answers a request we issued;
    //    there is no unsolicited variant.
    let Some(request_id) = &response.in_response_to else {
        return Err(
            ExternalError::MalformedMessage("LogoutResponse without InResponseTo".into()).into(),
        );
    };
    let Some(idp_entity_id) = ctx.correlation.consume(request_id) else {
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

    // 4. Signature, when present.
    if response.has_signature
        && !verify_message_signature(doc, ns::SAMLP, "LogoutResponse", &response.id, ctx)
    {
        fail(ValidationFailure::SignatureInvalid, &response.id)?;
    }

    tracing::info!(
        response_id = %response.id,
        in_response_to = %request_id,
        "logout response validated"
    );
    Ok(response)
}
