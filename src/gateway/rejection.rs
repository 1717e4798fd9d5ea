//! Terminal outcomes of the request pipeline and the JSON error body.
//!
//! Every refusal is rendered as `{status, code, message}` with a generic
//! message; the underlying cause stays in the server log.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::token::TokenError;

/// Error body returned for every refused request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// HTTP status code, repeated in the body
    pub status: u16,
    /// Domain error code
    pub code: u32,
    /// Generic, client-safe message
    pub message: String,
}

impl ApiResponse {
    /// Render with `status` as both the HTTP status and the body field.
    #[must_use]
    pub fn error(status: StatusCode, code: u32, message: impl Into<String>) -> Response {
        let body = Self {
            status: status.as_u16(),
            code,
            message: message.into(),
        };
        (status, Json(body)).into_response()
    }
}

/// Why a request was not forwarded. Every variant is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No `Authorization: Bearer` credential
    NoToken,
    /// Credential is not a well-formed token
    MalformedToken,
    /// Token could not be decrypted with the gateway's key
    DecryptionFailed,
    /// Token decrypted but is expired, not yet valid, foreign, or not an access token
    ClaimsInvalid,
    /// Token was revoked
    Blocked,
    /// Revocation status could not be determined
    RevocationCheckUnavailable,
    /// Role not permitted on this path
    Forbidden,
    /// Path matches no configured route
    NoRoute,
}

impl Rejection {
    /// HTTP status.
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::NoToken
            | Self::MalformedToken
            | Self::DecryptionFailed
            | Self::ClaimsInvalid
            | Self::Blocked => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NoRoute => StatusCode::NOT_FOUND,
            Self::RevocationCheckUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Domain error code.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::NoToken => 40_100,
            Self::MalformedToken => 40_101,
            Self::DecryptionFailed => 40_102,
            Self::ClaimsInvalid => 40_103,
            Self::Blocked => 40_104,
            Self::Forbidden => 40_300,
            Self::NoRoute => 40_400,
            Self::RevocationCheckUnavailable => 50_300,
        }
    }

    /// Client-facing message.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::NoToken => "Authentication token is required",
            Self::MalformedToken | Self::DecryptionFailed => "Authentication token is invalid",
            Self::ClaimsInvalid => "Authentication token is expired or invalid",
            Self::Blocked => "Authentication token has been revoked",
            Self::Forbidden => "Access to this resource is not permitted",
            Self::NoRoute => "No route for this path",
            Self::RevocationCheckUnavailable => "Authentication is temporarily unavailable",
        }
    }

    /// Stable name for logs and audit events.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::NoToken => "no_token",
            Self::MalformedToken => "malformed_token",
            Self::DecryptionFailed => "decryption_failed",
            Self::ClaimsInvalid => "claims_invalid",
            Self::Blocked => "blocked",
            Self::RevocationCheckUnavailable => "revocation_check_unavailable",
            Self::Forbidden => "forbidden",
            Self::NoRoute => "no_route",
        }
    }
}

impl From<&TokenError> for Rejection {
    fn from(err: &TokenError) -> Self {
        match err {
            TokenError::Malformed(_) | TokenError::MissingClaim(_) | TokenError::Encryption(_) => {
                Self::MalformedToken
            }
            TokenError::DecryptionFailed(_) | TokenError::KeyUnavailable(_) => {
                Self::DecryptionFailed
            }
            TokenError::ClaimsInvalid(_) => Self::ClaimsInvalid,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut response = ApiResponse::error(self.status(), self.code(), self.message());
        if self.status() == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::ClaimsViolation;
    use pretty_assertions::assert_eq;

    #[test]
    fn authentication_failures_are_401() {
        for r in [
            Rejection::NoToken,
            Rejection::MalformedToken,
            Rejection::DecryptionFailed,
            Rejection::ClaimsInvalid,
            Rejection::Blocked,
        ] {
            assert_eq!(r.status(), StatusCode::UNAUTHORIZED, "{r:?}");
        }
        assert_eq!(Rejection::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(Rejection::NoRoute.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Rejection::RevocationCheckUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn token_errors_map_to_their_class() {
        assert_eq!(
            Rejection::from(&TokenError::Malformed("x".into())),
            Rejection::MalformedToken
        );
        assert_eq!(
            Rejection::from(&TokenError::DecryptionFailed("tag".into())),
            Rejection::DecryptionFailed
        );
        assert_eq!(
            Rejection::from(&TokenError::ClaimsInvalid(ClaimsViolation::Expired)),
            Rejection::ClaimsInvalid
        );
    }

    #[tokio::test]
    async fn response_body_is_generic_json() {
        let response = Rejection::DecryptionFailed.into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ApiResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body,
            ApiResponse {
                status: 401,
                code: 40_102,
                message: "Authentication token is invalid".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn forbidden_has_no_challenge_header() {
        let response = Rejection::Forbidden.into_response();
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    }
}
