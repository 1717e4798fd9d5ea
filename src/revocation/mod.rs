//! Revocation store: the out-of-band blocklist consulted on every request.
//!
//! A token can be cryptographically valid and still refused because it was
//! revoked (logout, compromise). The [`RevocationStore`] trait is a plain
//! key-existence check with a TTL on write; absence means "not blocked" and
//! is never an error.
//!
//! [`Revocations`] wraps a store with the gateway's policy around it: which
//! key a token is stored under, a bounded timeout per query, and a small
//! number of retries with exponential backoff inside that timeout. When the
//! store cannot answer, callers get [`RevocationError`] and must fail closed.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use memory::{InMemoryRevocationStore, spawn_reaper};

use crate::config::{RevocationBackend, RevocationConfig};
use crate::token::ClaimSet;

/// Revocation store failures. The store never reports "not found" as an error.
#[derive(Debug, Clone, Error)]
pub enum RevocationError {
    /// The backing store returned an error or is unreachable.
    #[error("revocation backend error: {0}")]
    Backend(String),

    /// No answer within the configured budget.
    #[error("revocation check timed out after {0:?}")]
    Timeout(Duration),
}

/// Key-existence check with TTL, shared across request tasks.
#[async_trait::async_trait]
pub trait RevocationStore: Send + Sync + 'static {
    /// `true` while `key` is blocked.
    async fn is_blocked(&self, key: &str) -> Result<bool, RevocationError>;

    /// Block `key` for `ttl`. Blocking an already blocked key keeps whichever
    /// expiry is later.
    async fn block(&self, key: &str, ttl: Duration) -> Result<(), RevocationError>;

    /// Drop expired entries. Stores whose backend expires keys on its own
    /// have nothing to do.
    async fn reap_expired(&self) -> usize {
        0
    }

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// What a token is stored under in the blocklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationKey {
    /// The full serialized token.
    #[default]
    Token,
    /// The `jti` claim. Shorter keys, but only usable once the token has been
    /// decrypted.
    TokenId,
}

/// Blocklist access with key derivation, timeout and retry applied.
#[derive(Clone)]
pub struct Revocations {
    store: Arc<dyn RevocationStore>,
    key: RevocationKey,
    key_prefix: String,
    timeout: Duration,
    max_retries: usize,
}

impl std::fmt::Debug for Revocations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Revocations")
            .field("backend", &self.store.backend_name())
            .field("key", &self.key)
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl Revocations {
    /// Wrap an existing store.
    #[must_use]
    pub fn new(store: Arc<dyn RevocationStore>, config: &RevocationConfig) -> Self {
        Self {
            store,
            key: config.key,
            key_prefix: config.key_prefix.clone(),
            timeout: config.timeout,
            max_retries: config.max_retries,
        }
    }

    /// Build the configured backend. The Redis backend is pinged here so an
    /// unreachable store stops startup instead of failing every request.
    pub async fn connect(config: &RevocationConfig) -> crate::Result<Self> {
        let store: Arc<dyn RevocationStore> = match config.backend {
            RevocationBackend::Memory => Arc::new(InMemoryRevocationStore::new()),
            #[cfg(feature = "redis")]
            RevocationBackend::Redis => {
                let url = config.redis_url.as_deref().ok_or_else(|| {
                    crate::Error::Config(
                        "revocation.redis_url is required for the redis backend".to_string(),
                    )
                })?;
                Arc::new(redis::RedisRevocationStore::connect(url).await?)
            }
            #[cfg(not(feature = "redis"))]
            RevocationBackend::Redis => {
                return Err(crate::Error::Config(
                    "revocation.backend is redis but the redis feature is not compiled in"
                        .to_string(),
                ));
            }
        };
        info!(
            backend = store.backend_name(),
            key = ?config.key,
            timeout_ms = config.timeout.as_millis(),
            "Revocation store ready"
        );
        Ok(Self::new(store, config))
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RevocationStore> {
        &self.store
    }

    /// Store key for a token. Surrounding whitespace is not part of a
    /// compact token and never changes the key.
    #[must_use]
    pub fn key_for(&self, token: &str, claims: &ClaimSet) -> String {
        match self.key {
            RevocationKey::Token => format!("{}{}", self.key_prefix, token.trim()),
            RevocationKey::TokenId => format!("{}{}", self.key_prefix, claims.jti),
        }
    }

    /// Whether the token has been revoked.
    ///
    /// Retries transient backend errors with backoff; the whole exchange is
    /// bounded by the configured timeout.
    pub async fn is_revoked(&self, token: &str, claims: &ClaimSet) -> Result<bool, RevocationError> {
        let key = self.key_for(token, claims);
        let store = Arc::clone(&self.store);

        let query = (|| {
            let store = Arc::clone(&store);
            let key = key.clone();
            async move { store.is_blocked(&key).await }
        })
        .retry(self.backoff())
        .when(|e| matches!(e, RevocationError::Backend(_)))
        .notify(|e, delay| {
            debug!(error = %e, delay_ms = delay.as_millis(), "Retrying revocation check");
        });

        match tokio::time::timeout(self.timeout, query).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis(), "Revocation check timed out");
                Err(RevocationError::Timeout(self.timeout))
            }
        }
    }

    /// Block a token for the rest of its validity.
    ///
    /// Returns `false` without touching the store when the token has already
    /// expired at `now`: there is nothing left to revoke.
    pub async fn revoke(
        &self,
        token: &str,
        claims: &ClaimSet,
        now: u64,
    ) -> Result<bool, RevocationError> {
        let remaining = claims.remaining_secs(now);
        if remaining == 0 {
            return Ok(false);
        }
        let key = self.key_for(token, claims);
        let ttl = Duration::from_secs(remaining);

        match tokio::time::timeout(self.timeout, self.store.block(&key, ttl)).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Err(RevocationError::Timeout(self.timeout)),
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(self.timeout / 2)
            .with_max_times(self.max_retries)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use pretty_assertions::assert_eq;

    use crate::token::TokenUse;

    fn claims(jti: &str, exp: u64) -> ClaimSet {
        ClaimSet {
            iss: "issuer".to_string(),
            sub: "user-123".to_string(),
            aud: vec!["aud".to_string()],
            role: Some("member".to_string()),
            nbf: 0,
            iat: 0,
            exp,
            jti: jti.to_string(),
            token_use: TokenUse::Access,
        }
    }

    fn config(key: RevocationKey) -> RevocationConfig {
        RevocationConfig {
            key,
            key_prefix: "blocked:".to_string(),
            ..RevocationConfig::default()
        }
    }

    /// Fails the first `failures` queries, then reports everything as blocked.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RevocationStore for Flaky {
        async fn is_blocked(&self, _key: &str) -> Result<bool, RevocationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(RevocationError::Backend("connection reset".to_string()))
            } else {
                Ok(true)
            }
        }

        async fn block(&self, _key: &str, _ttl: Duration) -> Result<(), RevocationError> {
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    /// Never answers.
    struct Hanging;

    #[async_trait::async_trait]
    impl RevocationStore for Hanging {
        async fn is_blocked(&self, _key: &str) -> Result<bool, RevocationError> {
            std::future::pending().await
        }

        async fn block(&self, _key: &str, _ttl: Duration) -> Result<(), RevocationError> {
            std::future::pending().await
        }

        fn backend_name(&self) -> &'static str {
            "hanging"
        }
    }

    #[test]
    fn key_derivation_follows_config() {
        let c = claims("jti-1", 100);
        let store: Arc<dyn RevocationStore> = Arc::new(InMemoryRevocationStore::new());

        let by_token = Revocations::new(Arc::clone(&store), &config(RevocationKey::Token));
        assert_eq!(by_token.key_for("a.b.c.d.e", &c), "blocked:a.b.c.d.e");

        let by_id = Revocations::new(store, &config(RevocationKey::TokenId));
        assert_eq!(by_id.key_for("a.b.c.d.e", &c), "blocked:jti-1");
    }

    #[tokio::test(start_paused = true)]
    async fn revoke_blocks_for_remaining_validity() {
        // GIVEN: a token valid for another 60 seconds
        let revocations = Revocations::new(
            Arc::new(InMemoryRevocationStore::new()),
            &config(RevocationKey::Token),
        );
        let c = claims("jti-1", 1_060);

        // WHEN: it is revoked at t=1000
        assert!(revocations.revoke("tok", &c, 1_000).await.unwrap());

        // THEN: it is blocked until the remaining validity has elapsed
        assert!(revocations.is_revoked("tok", &c).await.unwrap());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(revocations.is_revoked("tok", &c).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!revocations.is_revoked("tok", &c).await.unwrap());
    }

    #[tokio::test]
    async fn surrounding_whitespace_maps_to_the_same_entry() {
        let revocations = Revocations::new(
            Arc::new(InMemoryRevocationStore::new()),
            &config(RevocationKey::Token),
        );
        let c = claims("jti-1", 1_060);

        assert!(revocations.revoke(" tok\n", &c, 1_000).await.unwrap());

        for presented in ["tok", "tok ", "\ttok", " tok \r\n"] {
            assert_eq!(revocations.key_for(presented, &c), "blocked:tok");
            assert!(revocations.is_revoked(presented, &c).await.unwrap(), "{presented:?}");
        }
    }

    #[tokio::test]
    async fn revoking_an_expired_token_is_a_no_op() {
        let revocations = Revocations::new(
            Arc::new(InMemoryRevocationStore::new()),
            &config(RevocationKey::Token),
        );
        let c = claims("jti-1", 1_000);

        assert!(!revocations.revoke("tok", &c, 1_000).await.unwrap());
        assert!(!revocations.is_revoked("tok", &c).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_backend_errors_are_retried() {
        // GIVEN: a store that fails twice before answering
        let store = Arc::new(Flaky {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let revocations = Revocations::new(store.clone(), &config(RevocationKey::Token));

        // WHEN: the token is checked
        let blocked = revocations.is_revoked("tok", &claims("j", 10)).await;

        // THEN: the third attempt's answer is returned
        assert!(blocked.unwrap());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_backend_errors_surface() {
        let store = Arc::new(Flaky {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let revocations = Revocations::new(store.clone(), &config(RevocationKey::Token));

        let err = revocations.is_revoked("tok", &claims("j", 10)).await.unwrap_err();

        assert!(matches!(err, RevocationError::Backend(_)));
        // one attempt plus the configured retries
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_backend_times_out() {
        let revocations = Revocations::new(Arc::new(Hanging), &config(RevocationKey::Token));

        let err = revocations.is_revoked("tok", &claims("j", 10)).await.unwrap_err();
        assert!(matches!(err, RevocationError::Timeout(_)));

        let err = revocations.revoke("tok", &claims("j", 10), 0).await.unwrap_err();
        assert!(matches!(err, RevocationError::Timeout(_)));
    }
}
