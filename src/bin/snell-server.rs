//! snell server binary.
//!
//! Usage: snell-server [-c FILE] [-l ADDR] [-obfs TYPE] [-k PSK]
//!                     [-version]
//!
//! When a config file is given its `[snell-server]` table overrides the
//! other flags entirely.

use std::env;
use std::process::ExitCode;

use anyhow::{bail, Context};
use snell::{config, ObfsMode, ServerConfig, SnellServer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn parse_args() -> anyhow::Result<ServerConfig> {
    let mut config_file: Option<String> = None;
    let mut config = ServerConfig::default();
    let mut obfs = String::new();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .with_context(|| format!("flag {flag} needs a value"))
        };
        match arg.as_str() {
            "-c" => config_file = Some(value("-c")?),
            "-l" => config.listen = value("-l")?,
            "-obfs" => obfs = value("-obfs")?,
            "-k" => config.psk = value("-k")?,
            "-version" => {
                println!("snell-server {VERSION}");
                std::process::exit(0);
            }
            other => bail!("unknown flag {other}"),
        }
    }

    if let Some(path) = config_file {
        tracing::info!("configuration file specified, ignoring other flags");
        return Ok(config::load_server_config(&path)?);
    }

    config.obfs = ObfsMode::parse(&obfs)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    tracing::info!("snell server, version {VERSION}");

    let config = match parse_args() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let server = match SnellServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("failed to initialize snell server: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!("server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
    ExitCode::SUCCESS
}
