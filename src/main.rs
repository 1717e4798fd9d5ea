//! JWE Gateway - encrypted identity tokens, revocation and role-tiered routing

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info};

use jwe_gateway::{
    cli::{Cli, Command, inspect_token},
    config::Config,
    gateway::Gateway,
    keys::KeyMaterial,
    setup_tracing,
    token::TokenCodec,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Keygen { bits }) => run_keygen(bits),
        Some(Command::Issue {
            ref subject,
            ref role,
            refresh,
        }) => run_issue(&cli, subject, role, refresh),
        Some(Command::Inspect { ref token }) => run_inspect(&cli, token),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// `jwt:` section printed by `keygen`
#[derive(Serialize)]
struct KeygenOutput {
    jwt: KeygenKeys,
}

#[derive(Serialize)]
struct KeygenKeys {
    private_key: String,
    public_key: String,
}

fn run_keygen(bits: usize) -> ExitCode {
    let keys = match KeyMaterial::generate(bits) {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("Key generation failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (Some(private_key), Some(public_key)) = (keys.encode_private(), keys.encode_public()) else {
        eprintln!("Failed to encode generated key pair");
        return ExitCode::FAILURE;
    };

    match serde_yaml::to_string(&KeygenOutput {
        jwt: KeygenKeys {
            private_key,
            public_key,
        },
    }) {
        Ok(yaml) => {
            print!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render key pair: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Load config and build a codec from it, for the offline subcommands.
fn load_codec(cli: &Cli) -> Result<(Config, TokenCodec), jwe_gateway::Error> {
    let config = Config::load(cli.config.as_deref())?;
    let keys = Arc::new(KeyMaterial::from_config(&config.jwt)?);
    let codec = TokenCodec::new(keys, &config.jwt)?;
    Ok((config, codec))
}

fn run_issue(cli: &Cli, subject: &str, role: &str, refresh: bool) -> ExitCode {
    let (config, codec) = match load_codec(cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if !config.authority.contains(role) {
        eprintln!("Role {role:?} is not configured under authority");
        return ExitCode::FAILURE;
    }

    let issued = if refresh {
        codec.issue_refresh_token(subject, role)
    } else {
        codec.issue_access_token(subject, role)
    };

    match issued {
        Ok(issued) => {
            println!("{}", issued.token);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Token issuance failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_inspect(cli: &Cli, token: &str) -> ExitCode {
    let (_, codec) = match load_codec(cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match inspect_token(&codec, token, jwe_gateway::token::now_secs()) {
        Ok((claims, remaining)) => {
            println!("{claims}");
            eprintln!("valid for {remaining}s");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("INVALID: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        services = config.services.names.len(),
        revocation = ?config.revocation.backend,
        "Starting JWE Gateway"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
