mod cli;
mod commands;
mod output;
mod utils;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::commands::handle_command;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;
    handle_command(cli).await
}

/// Filter directives for the requested verbosity. `RUST_LOG` overrides them.
fn log_directives(debug: bool, verbose: bool) -> &'static str {
    match (debug, verbose) {
        (true, _) => "meshprov=debug,meshprov_core=debug",
        (false, true) => "meshprov=info,meshprov_core=info",
        (false, false) => "warn",
    }
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_tracing(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_directives(cli.debug, cli.verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_wins_over_verbose() {
        assert_eq!(log_directives(true, true), log_directives(true, false));
        assert_eq!(log_directives(false, true), "meshprov=info,meshprov_core=info");
        assert_eq!(log_directives(false, false), "warn");
    }
}
