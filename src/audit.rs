//! Audit logging for token lifecycle and access decisions.
//!
//! Every event is emitted via `tracing::info!` with the event serialized as
//! JSON in the `audit` field, so the trail can be queried by any log
//! aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `token.issued` | An access or refresh token is minted |
//! | `token.refreshed` | A refresh token is redeemed for a new access token |
//! | `token.revoked` | A token is blocked via logout |
//! | `request.rejected` | The pipeline refused a request |
//! | `request.forwarded` | The pipeline passed a request to its upstream |
//!
//! Raw tokens never appear in events; see [`mask_token`].

use serde::Serialize;

use crate::token::{ClaimSet, TokenUse};

/// Structured audit event.
#[derive(Debug, Default, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.issued"`).
    pub event: &'static str,
    /// Subject of the token involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Role claim of the token involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// JTI of the affected token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_jti: Option<String>,
    /// Access or refresh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_use: Option<TokenUse>,
    /// Expiry of the affected token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Masked token, for rejected requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Request method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Service the request was routed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Numeric rejection code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
    /// Human-readable reason for rejection events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn for_claims(event: &'static str, claims: &ClaimSet) -> Self {
        Self {
            event,
            subject: Some(claims.sub.clone()),
            role: claims.role.clone(),
            token_jti: Some(claims.jti.clone()),
            token_use: Some(claims.token_use),
            exp: Some(claims.exp),
            ..Self::default()
        }
    }

    /// Construct a `token.issued` event.
    #[must_use]
    pub fn issued(claims: &ClaimSet) -> Self {
        Self::for_claims("token.issued", claims)
    }

    /// Construct a `token.refreshed` event for the new access token.
    #[must_use]
    pub fn refreshed(claims: &ClaimSet) -> Self {
        Self::for_claims("token.refreshed", claims)
    }

    /// Construct a `token.revoked` event.
    #[must_use]
    pub fn revoked(claims: &ClaimSet) -> Self {
        Self::for_claims("token.revoked", claims)
    }

    /// Construct a `request.rejected` event.
    #[must_use]
    pub fn rejected(
        method: &str,
        path: &str,
        code: u32,
        reason: impl Into<String>,
        token: Option<&str>,
    ) -> Self {
        Self {
            event: "request.rejected",
            method: Some(method.to_string()),
            path: Some(path.to_string()),
            code: Some(code),
            reason: Some(reason.into()),
            token: token.map(mask_token),
            ..Self::default()
        }
    }

    /// Construct a `request.forwarded` event.
    #[must_use]
    pub fn forwarded(method: &str, path: &str, service: &str, claims: &ClaimSet) -> Self {
        Self {
            event: "request.forwarded",
            subject: Some(claims.sub.clone()),
            role: claims.role.clone(),
            token_jti: Some(claims.jti.clone()),
            method: Some(method.to_string()),
            path: Some(path.to_string()),
            service: Some(service.to_string()),
            ..Self::default()
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// ```text
/// INFO jwe_gateway::audit audit={"event":"token.issued","subject":...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "gateway audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

/// First six and last four characters of a token, `***` when too short to
/// mask meaningfully.
#[must_use]
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() < 10 {
        return "***".to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
