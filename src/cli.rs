//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::token::{TokenCodec, TokenError};

/// JWE Gateway - encrypted identity tokens, revocation and role-tiered routing
#[derive(Parser, Debug)]
#[command(name = "jwe-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "JWE_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "JWE_GATEWAY_PORT", global = true)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "JWE_GATEWAY_HOST", global = true)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "JWE_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "JWE_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Generate an RSA key pair and print it as a `jwt:` config section
    Keygen {
        /// Modulus size in bits
        #[arg(long, default_value_t = 2048)]
        bits: usize,
    },

    /// Mint a token offline with the configured key
    Issue {
        /// Subject (user identifier)
        #[arg(long)]
        subject: String,

        /// Role claim
        #[arg(long)]
        role: String,

        /// Mint a refresh token instead of an access token
        #[arg(long)]
        refresh: bool,
    },

    /// Decrypt and validate a token, printing its claims
    Inspect {
        /// The compact token
        #[arg(required = true)]
        token: String,
    },
}

/// Decrypt and validate `token` for `inspect`.
///
/// Claims are rendered only once they pass validation; returns the pretty
/// JSON and the seconds of validity left.
pub fn inspect_token(
    codec: &TokenCodec,
    token: &str,
    now: u64,
) -> Result<(String, u64), TokenError> {
    let claims = codec.decrypt_and_parse(token.trim())?;
    codec.check_claims_at(&claims, now)?;
    let rendered = serde_json::to_string_pretty(&claims)
        .map_err(|e| TokenError::Malformed(format!("cannot render claims: {e}")))?;
    Ok((rendered, claims.remaining_secs(now)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwtConfig;
    use crate::token::test_keys;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["jwe-gateway", "--port", "9000"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    fn issue_takes_subject_and_role() {
        let cli = Cli::try_parse_from([
            "jwe-gateway",
            "issue",
            "--subject",
            "user-123",
            "--role",
            "member",
            "--refresh",
        ])
        .unwrap();

        match cli.command {
            Some(Command::Issue {
                subject,
                role,
                refresh,
            }) => {
                assert_eq!(subject, "user-123");
                assert_eq!(role, "member");
                assert!(refresh);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn server_flags_follow_the_serve_subcommand() {
        let cli = Cli::try_parse_from([
            "jwe-gateway",
            "serve",
            "--port",
            "9000",
            "--host",
            "0.0.0.0",
        ])
        .unwrap();

        assert!(matches!(cli.command, Some(Command::Serve)));
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn inspect_renders_only_valid_tokens() {
        let codec = TokenCodec::new(test_keys::primary(), &JwtConfig::default()).unwrap();
        let issued = codec.issue_access_token_at("user-123", "member", 1_000).unwrap();

        let (rendered, remaining) = inspect_token(&codec, &issued.token, 1_100).unwrap();
        assert!(rendered.contains("\"user-123\""));
        assert_eq!(remaining, issued.claims.exp - 1_100);

        // expired
        let err = inspect_token(&codec, &issued.token, issued.claims.exp).unwrap_err();
        assert!(matches!(err, TokenError::ClaimsInvalid(_)));

        // sealed for someone else
        let foreign = TokenCodec::new(test_keys::secondary(), &JwtConfig::default())
            .unwrap()
            .issue_access_token("user-123", "admin")
            .unwrap();
        let err = inspect_token(&codec, &foreign.token, 1_100).unwrap_err();
        assert!(matches!(err, TokenError::DecryptionFailed(_)));
    }
}
