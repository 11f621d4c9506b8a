//! snell client binary.
//!
//! Usage: snell-client [-c FILE] [-l ADDR] [-s ADDR] [-obfs TYPE]
//!                     [-obfs-host NAME] [-k PSK] [-version]
//!
//! When a config file is given its `[snell-client]` table overrides the
//! other flags entirely.

use std::env;
use std::process::ExitCode;

use anyhow::{bail, Context};
use snell::{config, ClientConfig, ObfsMode, SnellClient};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn parse_args() -> anyhow::Result<ClientConfig> {
    let mut config_file: Option<String> = None;
    let mut config = ClientConfig::default();
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
            "-s" => config.server = value("-s")?,
            "-obfs" => obfs = value("-obfs")?,
            "-obfs-host" => config.obfs_host = value("-obfs-host")?,
            "-k" => config.psk = value("-k")?,
            "-version" => {
                println!("snell-client {VERSION}");
                std::process::exit(0);
            }
            other => bail!("unknown flag {other}"),
        }
    }

    if let Some(path) = config_file {
        tracing::info!("configuration file specified, ignoring other flags");
        return Ok(config::load_client_config(&path)?);
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

    tracing::info!("snell client, version {VERSION}");

    let config = match parse_args() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let client = match SnellClient::bind(config).await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("failed to initialize snell client: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = client.run() => {
            if let Err(e) = result {
                tracing::error!("client stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            client.close();
        }
    }
    ExitCode::SUCCESS
}
