//! Configuration management

use std::{collections::HashMap, env, fmt, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use gateway_core::RoleSets;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::revocation::RevocationKey;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` and
    /// `env:VAR` resolution.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Token codec configuration
    pub jwt: JwtConfig,
    /// Role names accepted per tier
    pub authority: RoleSets,
    /// Backend services behind the gateway
    pub services: ServicesConfig,
    /// Revocation store
    pub revocation: RevocationConfig,
    /// Token endpoint protection
    pub admin: AdminConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // JWE_GATEWAY_JWT__ACCESS_TTL=15m and friends
        figment = figment.merge(Env::prefixed("JWE_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files first so ${VAR} can see what they define
        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in secret and address values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in [
            self.jwt.private_key.as_mut(),
            self.jwt.public_key.as_mut(),
            self.admin.bearer_token.as_mut(),
            self.revocation.redis_url.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(&re, value);
        }

        for url in self.services.upstreams.values_mut() {
            *url = Self::expand_string(&re, url);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Resolve `env:VAR_NAME` indirection. Unset variables resolve to `None`.
fn resolve_secret(value: Option<&String>) -> Option<String> {
    let value = value?;
    match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).ok(),
        None => Some(value.clone()),
    }
    .filter(|v| !v.trim().is_empty())
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout, upstream round trip included
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Token issuance and validation settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// `iss` written into and required on every token
    pub issuer: String,
    /// `aud` written into every token; presented tokens must carry exactly this set
    pub audience: Vec<String>,
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_ttl: Duration,
    /// Refresh token lifetime
    #[serde(with = "humantime_serde")]
    pub refresh_ttl: Duration,
    /// Base64 PKCS#8 DER (or PEM) private key. Supports `env:VAR_NAME`.
    pub private_key: Option<String>,
    /// Base64 X.509 DER (or PEM) public key. Supports `env:VAR_NAME`.
    pub public_key: Option<String>,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            issuer: "Prompt Oven Service development group".to_string(),
            audience: vec!["prompt oven service".to_string()],
            access_ttl: Duration::from_secs(30 * 60),
            refresh_ttl: Duration::from_secs(24 * 60 * 60),
            private_key: None,
            public_key: None,
        }
    }
}

impl JwtConfig {
    /// Private key after `env:` resolution.
    #[must_use]
    pub fn resolve_private_key(&self) -> Option<String> {
        resolve_secret(self.private_key.as_ref())
    }

    /// Public key after `env:` resolution.
    #[must_use]
    pub fn resolve_public_key(&self) -> Option<String> {
        resolve_secret(self.public_key.as_ref())
    }
}

impl fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("public_key", &self.public_key.is_some())
            .finish()
    }
}

/// Backend services and where to reach them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Service names as registered (e.g. `CATALOG-SERVICE`)
    pub names: Vec<String>,
    /// Leading path segment of every route
    pub version: String,
    /// Suffix stripped from the lower-cased name to form the route id
    pub suffix: String,
    /// Service name to base URL. Unlisted services go to `http://<name>`.
    pub upstreams: HashMap<String, String>,
    /// Upstream round trip timeout
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            version: "v1".to_string(),
            suffix: "-service".to_string(),
            upstreams: HashMap::new(),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

impl ServicesConfig {
    /// Base URL requests for `service_name` are forwarded to.
    #[must_use]
    pub fn upstream_for(&self, service_name: &str) -> String {
        self.upstreams
            .get(service_name)
            .cloned()
            .unwrap_or_else(|| format!("http://{}", service_name.to_lowercase()))
    }
}

/// Where the blocklist lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevocationBackend {
    /// In-process map; single instance only
    #[default]
    Memory,
    /// Shared Redis instance
    Redis,
}

/// Revocation store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// Store implementation
    pub backend: RevocationBackend,
    /// `redis://host:port/db`, required for the redis backend
    pub redis_url: Option<String>,
    /// Budget for one revocation check, retries included
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Retries after a failed query
    pub max_retries: usize,
    /// Whether tokens are blocked by full token or by `jti`
    pub key: RevocationKey,
    /// Prepended to every store key
    pub key_prefix: String,
    /// How often the in-memory store drops expired entries
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            backend: RevocationBackend::Memory,
            redis_url: None,
            timeout: Duration::from_millis(200),
            max_retries: 2,
            key: RevocationKey::Token,
            key_prefix: String::new(),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Protection of the token issuance endpoint
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token required on `POST /auth/token`. Supports `env:VAR_NAME`.
    /// Issuance over HTTP is disabled when unset.
    pub bearer_token: Option<String>,
}

impl AdminConfig {
    /// Bearer token after `env:` resolution.
    #[must_use]
    pub fn resolve_bearer_token(&self) -> Option<String> {
        resolve_secret(self.bearer_token.as_ref())
    }
}

impl fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminConfig")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Human-readable durations (`30s`, `15m`, `24h`, `200ms`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to the shortest exact unit
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        let rendered = if duration.subsec_nanos() != 0 {
            format!("{}ms", duration.as_millis())
        } else if secs != 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        };
        serializer.serialize_str(&rendered)
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string; a bare number is seconds.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
