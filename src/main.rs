//! `httpcap` binary entry point: parse CLI arguments, initialize logging,
//! and hand off to [`httpcap::run::run`]. Exit code 0 on normal
//! termination, non-zero on fatal configuration or capture errors (spec
//! §6).

use clap::Parser;
use httpcap::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = httpcap::run::run(cli).await {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}
