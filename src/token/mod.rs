//! Token codec: issues, decrypts and validates confidential identity tokens.
//!
//! Tokens are encrypted JWTs: the [`ClaimSet`] is serialized to JSON and
//! sealed as a compact JWE (see [`jwe`]). Only the holder of the private key
//! can read a token, and any tampering is detected by the GCM tag.
//!
//! # Failure classes
//!
//! | Error | Meaning |
//! |-------|---------|
//! | [`TokenError::Malformed`] | Not a five-part JWE with the expected header |
//! | [`TokenError::DecryptionFailed`] | Wrong key, or tag / ciphertext mismatch |
//! | [`TokenError::ClaimsInvalid`] | Decrypts fine but the assertion is not acceptable now |
//!
//! Callers must never read claims from a token that has not passed both
//! decryption and [`TokenCodec::check_claims_at`]; [`TokenCodec::verify`] and
//! [`TokenCodec::get_claim`] enforce that.

pub mod claims;
pub mod jwe;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

pub use claims::{ClaimSet, ClaimsViolation, TokenUse};
pub use jwe::CompactJwe;

use crate::config::JwtConfig;
use crate::keys::KeyMaterial;
use crate::Error;

/// Token codec failures.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Structural parse failure.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Authentication tag mismatch, wrong key or corrupted ciphertext.
    #[error("token decryption failed: {0}")]
    DecryptionFailed(String),

    /// Valid ciphertext, unacceptable assertion.
    #[error("token claims rejected: {0}")]
    ClaimsInvalid(#[from] ClaimsViolation),

    /// A requested claim is absent from an otherwise valid token.
    #[error("claim {0:?} not present")]
    MissingClaim(String),

    /// The key half needed for this direction was not configured.
    #[error("no {0} key loaded")]
    KeyUnavailable(&'static str),

    /// Sealing a new token failed.
    #[error("token encryption failed: {0}")]
    Encryption(String),
}

/// A freshly minted token together with the claims sealed inside it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Compact serialization handed to the client
    pub token: String,
    /// Claims inside `token`
    pub claims: ClaimSet,
}

impl IssuedToken {
    /// Lifetime of the token in seconds.
    #[must_use]
    pub fn expires_in(&self) -> u64 {
        self.claims.exp.saturating_sub(self.claims.iat)
    }
}

/// Current wall-clock time as a `NumericDate`.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Issues and validates tokens against one key pair, issuer and audience.
#[derive(Debug)]
pub struct TokenCodec {
    keys: Arc<KeyMaterial>,
    issuer: String,
    audience: Vec<String>,
    audience_set: BTreeSet<String>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenCodec {
    /// Build a codec from the `jwt` configuration section.
    pub fn new(keys: Arc<KeyMaterial>, config: &JwtConfig) -> crate::Result<Self> {
        if config.issuer.trim().is_empty() {
            return Err(Error::Config("jwt.issuer must not be empty".to_string()));
        }
        if config.audience.is_empty() {
            return Err(Error::Config("jwt.audience must list at least one audience".to_string()));
        }
        for (name, ttl) in [("access_ttl", config.access_ttl), ("refresh_ttl", config.refresh_ttl)] {
            if ttl.as_secs() == 0 {
                return Err(Error::Config(format!("jwt.{name} must be at least one second")));
            }
        }

        Ok(Self {
            keys,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            audience_set: config.audience.iter().cloned().collect(),
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
        })
    }

    /// Configured issuer.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Lifetime of access tokens.
    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Lifetime of refresh tokens.
    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Issue an access token for `subject` holding `role`.
    pub fn issue_access_token(&self, subject: &str, role: &str) -> Result<IssuedToken, TokenError> {
        self.issue_access_token_at(subject, role, now_secs())
    }

    /// [`issue_access_token`](Self::issue_access_token) with an explicit clock.
    pub fn issue_access_token_at(
        &self,
        subject: &str,
        role: &str,
        now: u64,
    ) -> Result<IssuedToken, TokenError> {
        self.issue(subject, Some(role), TokenUse::Access, self.access_ttl, now)
    }

    /// Issue a refresh token. The role is carried so redemption can re-issue
    /// an access token without consulting another system.
    pub fn issue_refresh_token(&self, subject: &str, role: &str) -> Result<IssuedToken, TokenError> {
        self.issue_refresh_token_at(subject, role, now_secs())
    }

    /// [`issue_refresh_token`](Self::issue_refresh_token) with an explicit clock.
    pub fn issue_refresh_token_at(
        &self,
        subject: &str,
        role: &str,
        now: u64,
    ) -> Result<IssuedToken, TokenError> {
        self.issue(subject, Some(role), TokenUse::Refresh, self.refresh_ttl, now)
    }

    /// Exchange a valid refresh token for a new access token.
    pub fn redeem_refresh(&self, refresh_token: &str) -> Result<IssuedToken, TokenError> {
        self.redeem_refresh_at(refresh_token, now_secs())
    }

    /// [`redeem_refresh`](Self::redeem_refresh) with an explicit clock.
    pub fn redeem_refresh_at(&self, refresh_token: &str, now: u64) -> Result<IssuedToken, TokenError> {
        let claims = self.verify_at(refresh_token, TokenUse::Refresh, now)?;
        self.reissue_access_at(&claims, now)
    }

    /// Mint an access token for the identity in already verified refresh
    /// claims.
    pub fn reissue_access_at(&self, refresh: &ClaimSet, now: u64) -> Result<IssuedToken, TokenError> {
        if refresh.token_use != TokenUse::Refresh {
            return Err(ClaimsViolation::WrongTokenUse {
                expected: TokenUse::Refresh,
                found: refresh.token_use,
            }
            .into());
        }
        let role = refresh
            .role
            .as_deref()
            .ok_or_else(|| TokenError::MissingClaim("role".to_string()))?;
        debug!(jti = %refresh.jti, "Redeeming refresh token");
        self.issue_access_token_at(&refresh.sub, role, now)
    }

    /// Parse and decrypt without judging the claims.
    pub fn decrypt_and_parse(&self, token: &str) -> Result<ClaimSet, TokenError> {
        let jwe = CompactJwe::parse(token)?;
        let private = self
            .keys
            .private_key()
            .ok_or(TokenError::KeyUnavailable("private"))?;
        let payload = jwe.decrypt(private)?;
        serde_json::from_slice(&payload)
            .map_err(|e| TokenError::Malformed(format!("payload is not a claim set: {e}")))
    }

    /// Issuer, audience and validity window checks against the current time.
    #[must_use]
    pub fn validate_claims(&self, claims: &ClaimSet) -> bool {
        self.validate_claims_at(claims, now_secs())
    }

    /// [`validate_claims`](Self::validate_claims) with an explicit clock.
    #[must_use]
    pub fn validate_claims_at(&self, claims: &ClaimSet, now: u64) -> bool {
        self.check_claims_at(claims, now).is_ok()
    }

    /// Like [`validate_claims_at`](Self::validate_claims_at) but reports which
    /// check failed.
    pub fn check_claims_at(&self, claims: &ClaimSet, now: u64) -> Result<(), ClaimsViolation> {
        claims.check(&self.issuer, &self.audience_set, now)
    }

    /// Decrypt and fully validate a token of any kind.
    pub fn verify(&self, token: &str) -> Result<ClaimSet, TokenError> {
        let claims = self.decrypt_and_parse(token)?;
        self.check_claims_at(&claims, now_secs())?;
        Ok(claims)
    }

    /// Decrypt and fully validate a token, requiring it to be of kind `expected`.
    pub fn verify_at(&self, token: &str, expected: TokenUse, now: u64) -> Result<ClaimSet, TokenError> {
        let claims = self.decrypt_and_parse(token)?;
        self.check_claims_at(&claims, now)?;
        if claims.token_use != expected {
            return Err(ClaimsViolation::WrongTokenUse {
                expected,
                found: claims.token_use,
            }
            .into());
        }
        Ok(claims)
    }

    /// Read one claim from a fully validated token.
    pub fn get_claim(&self, token: &str, name: &str) -> Result<serde_json::Value, TokenError> {
        self.verify(token)?
            .get(name)
            .ok_or_else(|| TokenError::MissingClaim(name.to_string()))
    }

    /// Expiration of a fully validated token.
    pub fn token_expiration(&self, token: &str) -> Result<u64, TokenError> {
        Ok(self.verify(token)?.exp)
    }

    fn issue(
        &self,
        subject: &str,
        role: Option<&str>,
        token_use: TokenUse,
        ttl: Duration,
        now: u64,
    ) -> Result<IssuedToken, TokenError> {
        let public = self
            .keys
            .public_key()
            .ok_or(TokenError::KeyUnavailable("public"))?;

        let claims = ClaimSet {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            aud: self.audience.clone(),
            role: role.map(str::to_string),
            nbf: now,
            iat: now,
            exp: now + ttl.as_secs(),
            jti: uuid::Uuid::new_v4().to_string(),
            token_use,
        };

        let payload =
            serde_json::to_vec(&claims).map_err(|e| TokenError::Encryption(e.to_string()))?;
        let token = CompactJwe::encrypt(&payload, public)?.serialize();

        Ok(IssuedToken { token, claims })
    }
}

#[cfg(test)]
pub(crate) mod test_keys {
    //! Key pairs shared by every unit test in the crate. RSA key generation
    //! dominates test time, so each pair is generated once.

    use std::sync::{Arc, LazyLock};

    use crate::keys::KeyMaterial;

    static PRIMARY: LazyLock<Arc<KeyMaterial>> =
        LazyLock::new(|| Arc::new(KeyMaterial::generate(2048).unwrap()));
    static SECONDARY: LazyLock<Arc<KeyMaterial>> =
        LazyLock::new(|| Arc::new(KeyMaterial::generate(2048).unwrap()));

    pub(crate) fn primary() -> Arc<KeyMaterial> {
        Arc::clone(&PRIMARY)
    }

    pub(crate) fn secondary() -> Arc<KeyMaterial> {
        Arc::clone(&SECONDARY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    pub(crate) fn codec_with(keys: Arc<KeyMaterial>) -> TokenCodec {
        TokenCodec::new(keys, &JwtConfig::default()).unwrap()
    }

    fn codec() -> TokenCodec {
        codec_with(test_keys::primary())
    }

    #[test]
    fn issued_access_token_round_trips() {
        let codec = codec();

        let issued = codec.issue_access_token("user-123", "member").unwrap();
        let claims = codec.decrypt_and_parse(&issued.token).unwrap();

        assert_eq!(claims, issued.claims);
        assert_eq!(claims.sub, "user-123");
        assert_eq!(claims.role.as_deref(), Some("member"));
        assert_eq!(claims.aud, vec!["prompt oven service".to_string()]);
        assert_eq!(claims.iss, "Prompt Oven Service development group");
        assert_eq!(claims.token_use, TokenUse::Access);
        assert!(codec.validate_claims(&claims));
    }

    #[test]
    fn access_token_lifetime_follows_config() {
        let codec = codec();
        let issued = codec.issue_access_token_at("user-123", "member", 1_000).unwrap();

        assert_eq!(issued.claims.iat, 1_000);
        assert_eq!(issued.claims.nbf, 1_000);
        assert_eq!(issued.claims.exp, 1_000 + 30 * 60);
        assert_eq!(issued.expires_in(), 30 * 60);
        assert!(issued.claims.exp > issued.claims.iat);
    }

    #[test]
    fn token_ids_are_unique() {
        let codec = codec();
        let a = codec.issue_access_token("user-123", "member").unwrap();
        let b = codec.issue_access_token("user-123", "member").unwrap();
        assert_ne!(a.claims.jti, b.claims.jti);
        assert_ne!(a.token, b.token);
        assert!(uuid::Uuid::parse_str(&a.claims.jti).is_ok());
    }

    #[test]
    fn validation_fails_at_and_after_expiration() {
        let codec = codec();
        let issued = codec.issue_access_token_at("user-123", "member", 1_000).unwrap();
        let claims = codec.decrypt_and_parse(&issued.token).unwrap();
        let exp = claims.exp;

        assert!(codec.validate_claims_at(&claims, 1_000));
        assert!(codec.validate_claims_at(&claims, exp - 1));
        assert!(!codec.validate_claims_at(&claims, exp));
        assert!(!codec.validate_claims_at(&claims, exp + 3600));
        assert_eq!(codec.check_claims_at(&claims, exp), Err(ClaimsViolation::Expired));
    }

    #[test]
    fn foreign_issuer_or_audience_is_rejected() {
        let keys = test_keys::primary();
        let other = TokenCodec::new(
            Arc::clone(&keys),
            &JwtConfig {
                issuer: "someone else".to_string(),
                ..JwtConfig::default()
            },
        )
        .unwrap();
        let token = other.issue_access_token("user-123", "member").unwrap().token;
        let err = codec().verify(&token).unwrap_err();
        assert!(matches!(err, TokenError::ClaimsInvalid(ClaimsViolation::Issuer)));

        let other = TokenCodec::new(
            keys,
            &JwtConfig {
                audience: vec!["prompt oven service".to_string(), "extra".to_string()],
                ..JwtConfig::default()
            },
        )
        .unwrap();
        let token = other.issue_access_token("user-123", "member").unwrap().token;
        let err = codec().verify(&token).unwrap_err();
        assert!(matches!(err, TokenError::ClaimsInvalid(ClaimsViolation::Audience)));
    }

    #[test]
    fn wrong_key_is_decryption_failure() {
        let issuer = codec_with(test_keys::secondary());
        let token = issuer.issue_access_token("user-123", "admin").unwrap().token;

        let err = codec().decrypt_and_parse(&token).unwrap_err();

        assert!(matches!(err, TokenError::DecryptionFailed(_)));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = codec().decrypt_and_parse("Bearer nonsense").unwrap_err();
        assert!(matches!(err, TokenError::Malformed(_)));
    }

    #[test]
    fn refresh_redeems_to_access_token_with_same_identity() {
        let codec = codec();
        let refresh = codec.issue_refresh_token("user-123", "seller").unwrap();
        assert_eq!(refresh.claims.token_use, TokenUse::Refresh);
        assert_eq!(refresh.expires_in(), 24 * 60 * 60);

        let access = codec.redeem_refresh(&refresh.token).unwrap();

        assert_eq!(access.claims.sub, "user-123");
        assert_eq!(access.claims.role.as_deref(), Some("seller"));
        assert_eq!(access.claims.token_use, TokenUse::Access);
        assert_ne!(access.claims.jti, refresh.claims.jti);
    }

    #[test]
    fn expired_refresh_token_is_not_redeemed() {
        let codec = codec();
        let refresh = codec.issue_refresh_token_at("user-123", "member", 1_000).unwrap();

        let err = codec.redeem_refresh(&refresh.token).unwrap_err();

        assert!(matches!(err, TokenError::ClaimsInvalid(ClaimsViolation::Expired)));
    }

    #[test]
    fn access_token_cannot_be_redeemed() {
        let codec = codec();
        let access = codec.issue_access_token("user-123", "member").unwrap();

        let err = codec.redeem_refresh(&access.token).unwrap_err();

        assert!(matches!(
            err,
            TokenError::ClaimsInvalid(ClaimsViolation::WrongTokenUse {
                expected: TokenUse::Refresh,
                found: TokenUse::Access,
            })
        ));
    }

    #[test]
    fn get_claim_requires_valid_token() {
        let codec = codec();
        let valid = codec.issue_access_token("user-123", "member").unwrap().token;
        assert_eq!(codec.get_claim(&valid, "sub").unwrap(), json!("user-123"));
        assert_eq!(codec.get_claim(&valid, "role").unwrap(), json!("member"));
        assert!(matches!(
            codec.get_claim(&valid, "email"),
            Err(TokenError::MissingClaim(_))
        ));

        let expired = codec.issue_access_token_at("user-123", "member", 1_000).unwrap().token;
        assert!(matches!(
            codec.get_claim(&expired, "sub"),
            Err(TokenError::ClaimsInvalid(ClaimsViolation::Expired))
        ));
    }

    #[test]
    fn token_expiration_reports_exp() {
        let codec = codec();
        let issued = codec.issue_access_token("user-123", "member").unwrap();
        assert_eq!(codec.token_expiration(&issued.token).unwrap(), issued.claims.exp);
    }

    #[test]
    fn public_only_codec_issues_but_cannot_decrypt() {
        let public = test_keys::primary().encode_public().unwrap();
        let keys = Arc::new(KeyMaterial::from_encoded(None, Some(&public)).unwrap());
        let issuer = codec_with(keys);

        let token = issuer.issue_access_token("user-123", "member").unwrap().token;

        assert!(matches!(
            issuer.decrypt_and_parse(&token),
            Err(TokenError::KeyUnavailable("private"))
        ));
        assert!(codec().verify(&token).is_ok());
    }

    #[test]
    fn zero_ttl_is_a_config_error() {
        let err = TokenCodec::new(
            test_keys::primary(),
            &JwtConfig {
                access_ttl: Duration::ZERO,
                ..JwtConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
