//! Request pipeline: the per-request authorization state machine.
//!
//! ```text
//! route known? -> bearer present? -> decrypts? -> claims valid? -> not revoked? -> role permitted? -> forward
//!      |               |                |              |               |                |
//!   NoRoute         NoToken      Malformed/Decrypt  ClaimsInvalid   Blocked/Unavail.  Forbidden
//! ```
//!
//! Every step runs in order and a rejection is final. The revocation lookup
//! is the only suspension point before forwarding.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, header},
    response::{IntoResponse, Response},
};
use gateway_core::{AccessPolicyTable, Decision, PolicyEntry};
use tracing::{debug, error, warn};

use super::rejection::Rejection;
use super::router::AppState;
use crate::audit::{self, AuditEvent, mask_token};
use crate::revocation::Revocations;
use crate::token::{ClaimSet, ClaimsViolation, TokenCodec, TokenError, TokenUse, now_secs};

/// Header carrying the caller's role to the upstream service.
pub static USER_ROLE_HEADER: HeaderName = HeaderName::from_static("x-user-role");

/// A request that passed every check.
#[derive(Debug, Clone)]
pub struct Authorized {
    /// Claims of the presented access token
    pub claims: ClaimSet,
    /// Route the request matched
    pub route: Arc<PolicyEntry>,
}

/// The authorization steps, wired to the process-wide codec, blocklist and
/// route table.
#[derive(Debug, Clone)]
pub struct AuthPipeline {
    codec: Arc<TokenCodec>,
    revocations: Revocations,
    policy: Arc<AccessPolicyTable>,
}

impl AuthPipeline {
    /// Assemble a pipeline from already built components.
    #[must_use]
    pub fn new(
        codec: Arc<TokenCodec>,
        revocations: Revocations,
        policy: Arc<AccessPolicyTable>,
    ) -> Self {
        Self {
            codec,
            revocations,
            policy,
        }
    }

    /// Token codec.
    #[must_use]
    pub fn codec(&self) -> &Arc<TokenCodec> {
        &self.codec
    }

    /// Blocklist.
    #[must_use]
    pub fn revocations(&self) -> &Revocations {
        &self.revocations
    }

    /// Route table.
    #[must_use]
    pub fn policy(&self) -> &Arc<AccessPolicyTable> {
        &self.policy
    }

    /// Run every check for a request to `path` carrying `headers`.
    pub async fn authorize(&self, path: &str, headers: &HeaderMap) -> Result<Authorized, Rejection> {
        self.authorize_at(path, headers, now_secs()).await
    }

    /// [`authorize`](Self::authorize) with an explicit clock.
    pub async fn authorize_at(
        &self,
        path: &str,
        headers: &HeaderMap,
        now: u64,
    ) -> Result<Authorized, Rejection> {
        if self.policy.resolve(path).is_none() {
            return Err(Rejection::NoRoute);
        }

        let token = extract_bearer(headers).ok_or(Rejection::NoToken)?;
        let claims = self.authenticate(token, TokenUse::Access, now).await?;

        match self.policy.decide(path, claims.role.as_deref()) {
            Decision::Allow(route) => Ok(Authorized { claims, route }),
            Decision::Deny(route) => {
                debug!(
                    pattern = %route.pattern(),
                    role = claims.role.as_deref().unwrap_or("-"),
                    "Role not permitted"
                );
                Err(Rejection::Forbidden)
            }
            Decision::NoRoute => Err(Rejection::NoRoute),
        }
    }

    /// Decrypt, validate and check revocation for a token of kind `expected`.
    ///
    /// Shared with the token endpoints, which need the same guarantees for
    /// refresh and logout.
    pub async fn authenticate(
        &self,
        token: &str,
        expected: TokenUse,
        now: u64,
    ) -> Result<ClaimSet, Rejection> {
        // One canonical form for both decryption and the blocklist key.
        let token = token.trim();
        let claims = match self.codec.decrypt_and_parse(token) {
            Ok(claims) => claims,
            Err(e) => {
                log_token_error(&e, token);
                return Err(Rejection::from(&e));
            }
        };

        if let Err(violation) = self.codec.check_claims_at(&claims, now) {
            debug!(jti = %claims.jti, reason = %violation, "Token claims rejected");
            return Err(Rejection::ClaimsInvalid);
        }
        if claims.token_use != expected {
            let violation = ClaimsViolation::WrongTokenUse {
                expected,
                found: claims.token_use,
            };
            debug!(jti = %claims.jti, reason = %violation, "Token claims rejected");
            return Err(Rejection::ClaimsInvalid);
        }

        match self.revocations.is_revoked(token, &claims).await {
            Ok(false) => Ok(claims),
            Ok(true) => {
                debug!(jti = %claims.jti, "Token is revoked");
                Err(Rejection::Blocked)
            }
            Err(e) => {
                error!(error = %e, jti = %claims.jti, "Revocation check failed, refusing request");
                Err(Rejection::RevocationCheckUnavailable)
            }
        }
    }
}

fn log_token_error(err: &TokenError, token: &str) {
    match err {
        TokenError::KeyUnavailable(_) => {
            error!(error = %err, "Gateway cannot decrypt tokens: no private key loaded");
        }
        _ => warn!(error = %err, token = %mask_token(token), "Token rejected"),
    }
}

/// Bearer credential from the `Authorization` header.
#[must_use]
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Replace any client-supplied role header with the authenticated role.
pub fn set_role_header(headers: &mut HeaderMap, role: Option<&str>) {
    headers.remove(&USER_ROLE_HEADER);
    if let Some(value) = role.and_then(|r| HeaderValue::from_str(r).ok()) {
        headers.insert(USER_ROLE_HEADER.clone(), value);
    }
}

/// Fallback handler: everything that is not a gateway endpoint goes through
/// the pipeline and, on success, to the upstream service.
pub async fn gateway_handler(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();

    let authorized = match state.pipeline.authorize(&path, &parts.headers).await {
        Ok(authorized) => authorized,
        Err(rejection) => {
            audit::emit(&AuditEvent::rejected(
                method.as_str(),
                &path,
                rejection.code(),
                rejection.reason(),
                extract_bearer(&parts.headers),
            ));
            return rejection.into_response();
        }
    };

    set_role_header(&mut parts.headers, authorized.claims.role.as_deref());

    audit::emit(&AuditEvent::forwarded(
        method.as_str(),
        &path,
        authorized.route.service_name(),
        &authorized.claims,
    ));

    match state
        .upstream
        .forward(&authorized.route, Request::from_parts(parts, body))
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(
                service = %authorized.route.service_name(),
                error = %e,
                "Upstream request failed"
            );
            e.into_response()
        }
    }
}
