pub mod cli;
pub mod config;
pub mod pipeline;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

pub fn run() -> ExitCode {
    let cli = cli::Cli::parse();

    // stdout is the worker → supervisor channel; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("TableGrid starting v{}", config::APP_VERSION);

    cli::execute(cli)
}
