//! Gateway-owned endpoints: health and the token lifecycle.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use super::auth::extract_bearer;
use super::rejection::{ApiResponse, Rejection};
use super::router::AppState;
use crate::audit::{self, AuditEvent};
use crate::token::{IssuedToken, TokenError, TokenUse, now_secs};

/// `POST /auth/token` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRequest {
    /// Identity the tokens are minted for
    pub subject: String,
    /// Role carried by both tokens
    pub role: String,
}

/// `POST /auth/refresh` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// Refresh token to redeem
    pub refresh_token: String,
}

/// `POST /auth/logout` body; may be omitted entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogoutRequest {
    /// Refresh token to revoke along with the access token
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Tokens handed to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Access token for `Authorization: Bearer`
    pub access_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Refresh token, only on issuance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Refresh token lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_in: Option<u64>,
}

impl TokenResponse {
    fn new(access: &IssuedToken, refresh: Option<&IssuedToken>) -> Self {
        Self {
            access_token: access.token.clone(),
            token_type: "Bearer".to_string(),
            expires_in: access.expires_in(),
            refresh_token: refresh.map(|r| r.token.clone()),
            refresh_expires_in: refresh.map(IssuedToken::expires_in),
        }
    }
}

/// `GET /health`
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": state.pipeline.policy().len(),
        "revocation": state.pipeline.revocations().store().backend_name(),
    }))
}

/// `POST /auth/token`: mint an access and refresh token pair.
///
/// Guarded by the configured admin bearer token, compared in constant time.
pub async fn issue_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return ApiResponse::error(StatusCode::FORBIDDEN, 40_301, "Token issuance is disabled");
    };
    let presented = extract_bearer(&headers).unwrap_or_default();
    if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        warn!("Token issuance refused: bad admin credential");
        return ApiResponse::error(
            StatusCode::UNAUTHORIZED,
            40_105,
            "Administrator credential is required",
        );
    }

    let request: IssueRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if request.subject.trim().is_empty() || request.role.trim().is_empty() {
        return bad_request("subject and role must not be empty");
    }
    if !state.pipeline.policy().is_known_role(&request.role) {
        return bad_request("role is not a configured role");
    }

    let codec = state.pipeline.codec();
    let now = now_secs();
    let issued = codec
        .issue_access_token_at(&request.subject, &request.role, now)
        .and_then(|access| {
            codec
                .issue_refresh_token_at(&request.subject, &request.role, now)
                .map(|refresh| (access, refresh))
        });

    match issued {
        Ok((access, refresh)) => {
            audit::emit(&AuditEvent::issued(&access.claims));
            audit::emit(&AuditEvent::issued(&refresh.claims));
            (StatusCode::OK, Json(TokenResponse::new(&access, Some(&refresh)))).into_response()
        }
        Err(e) => issuance_failed(&e),
    }
}

/// `POST /auth/refresh`: exchange a live refresh token for an access token.
pub async fn refresh_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: RefreshRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let now = now_secs();
    let claims = match state
        .pipeline
        .authenticate(request.refresh_token.trim(), TokenUse::Refresh, now)
        .await
    {
        Ok(claims) => claims,
        Err(rejection) => return rejection.into_response(),
    };

    match state.pipeline.codec().reissue_access_at(&claims, now) {
        Ok(access) => {
            audit::emit(&AuditEvent::refreshed(&access.claims));
            (StatusCode::OK, Json(TokenResponse::new(&access, None))).into_response()
        }
        Err(TokenError::MissingClaim(_)) => Rejection::ClaimsInvalid.into_response(),
        Err(e) => issuance_failed(&e),
    }
}

/// `POST /auth/logout`: revoke the presented access token and, optionally,
/// a refresh token of the same subject.
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(token) = extract_bearer(&headers) else {
        return Rejection::NoToken.into_response();
    };
    let request: LogoutRequest = if body.is_empty() {
        LogoutRequest::default()
    } else {
        match parse_body(&body) {
            Ok(request) => request,
            Err(response) => return response,
        }
    };

    let pipeline = &state.pipeline;
    let now = now_secs();
    let access = match pipeline.authenticate(token, TokenUse::Access, now).await {
        Ok(claims) => claims,
        Err(rejection) => return rejection.into_response(),
    };

    // Validate everything before revoking anything.
    let refresh = match request.refresh_token.as_deref().map(str::trim) {
        None => None,
        Some(refresh_token) => match pipeline.codec().verify_at(refresh_token, TokenUse::Refresh, now) {
            Ok(claims) if claims.sub == access.sub => Some((refresh_token, claims)),
            Ok(_) => return bad_request("refresh token belongs to another subject"),
            Err(_) => return bad_request("refresh token is invalid"),
        },
    };

    for (raw, claims) in std::iter::once((token, &access)).chain(refresh.as_ref().map(|(t, c)| (*t, c))) {
        match pipeline.revocations().revoke(raw, claims, now).await {
            Ok(_) => audit::emit(&AuditEvent::revoked(claims)),
            Err(e) => {
                error!(error = %e, jti = %claims.jti, "Failed to record revocation");
                return Rejection::RevocationCheckUnavailable.into_response();
            }
        }
    }

    StatusCode::NO_CONTENT.into_response()
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| bad_request(&format!("invalid request body: {e}")))
}

fn bad_request(message: &str) -> Response {
    ApiResponse::error(StatusCode::BAD_REQUEST, 40_000, message)
}

fn issuance_failed(err: &TokenError) -> Response {
    error!(error = %err, "Token issuance failed");
    ApiResponse::error(
        StatusCode::INTERNAL_SERVER_ERROR,
        50_000,
        "Token issuance failed",
    )
}
