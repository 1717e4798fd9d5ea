//! Identity claim set carried inside a token.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Which of the two token kinds a claim set belongs to.
///
/// Tokens minted before this claim existed carry no `token_use` and are
/// treated as access tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    /// Short-lived bearer credential presented on every request.
    #[default]
    Access,
    /// Long-lived credential redeemable only for a new access token.
    Refresh,
}

impl fmt::Display for TokenUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// Registered claims plus the gateway's `role` and `token_use`.
///
/// Timestamps are JWT `NumericDate` values (seconds since the Unix epoch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSet {
    /// Issuer
    pub iss: String,
    /// Subject (opaque user identifier)
    pub sub: String,
    /// Audience. Accepts a bare string on input, always written as an array.
    #[serde(deserialize_with = "string_or_list")]
    pub aud: Vec<String>,
    /// Role identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Not before
    pub nbf: u64,
    /// Issued at
    pub iat: u64,
    /// Expiration
    pub exp: u64,
    /// Token identifier (UUID v4)
    pub jti: String,
    /// Access or refresh
    #[serde(default)]
    pub token_use: TokenUse,
}

/// The specific claim check that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimsViolation {
    /// `iss` differs from the configured issuer.
    #[error("issuer mismatch")]
    Issuer,
    /// `aud` is not exactly the configured audience set.
    #[error("audience mismatch")]
    Audience,
    /// The current time is at or after `exp`.
    #[error("token expired")]
    Expired,
    /// The current time is before `nbf`.
    #[error("token not yet valid")]
    NotYetValid,
    /// An access token was presented where a refresh token is required, or
    /// the other way round.
    #[error("expected {expected} token, found {found} token")]
    WrongTokenUse {
        /// Kind the caller required
        expected: TokenUse,
        /// Kind the token declares
        found: TokenUse,
    },
}

impl ClaimSet {
    /// Run the four mandatory checks against `now`.
    ///
    /// Expiry is strict: a token is already invalid at the second of `exp`.
    pub fn check(
        &self,
        issuer: &str,
        audience: &BTreeSet<String>,
        now: u64,
    ) -> Result<(), ClaimsViolation> {
        if self.iss != issuer {
            return Err(ClaimsViolation::Issuer);
        }
        let presented: BTreeSet<&str> = self.aud.iter().map(String::as_str).collect();
        let expected: BTreeSet<&str> = audience.iter().map(String::as_str).collect();
        if presented != expected {
            return Err(ClaimsViolation::Audience);
        }
        if now >= self.exp {
            return Err(ClaimsViolation::Expired);
        }
        if now < self.nbf {
            return Err(ClaimsViolation::NotYetValid);
        }
        Ok(())
    }

    /// Seconds of validity left at `now` (zero once expired).
    #[must_use]
    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.exp.saturating_sub(now)
    }

    /// Look a claim up by its JSON name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => map.remove(name),
            _ => None,
        }
    }
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}
