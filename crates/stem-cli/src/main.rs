//! `stem` - demo workspace を実行する CLI

use std::process::ExitCode;

use clap::Parser;
use stem_cli::{Cli, demo};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // stdout carries results and worker envelopes, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("STEM_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let workspace = match demo::workspace() {
        Ok(workspace) => workspace,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match stem_cli::run(cli, &workspace) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
