#![warn(missing_docs)]

//! `spaudit` command-line entry point.

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, LogFormat};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "spaudit starting");
    cli.run().await
}
