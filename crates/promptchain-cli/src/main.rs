//! PromptChain CLI entry point.
//!
//! Binary name: `pchain`
//!
//! Parses CLI arguments, initializes tracing, and dispatches to the run
//! command. Exit codes: 0 on success, 2 on configuration errors or stage
//! failures.

mod cli;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,promptchain=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => match cli::run::execute(args).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                eprintln!("{} {error}", console::style("Error:").red().bold());
                ExitCode::from(2)
            }
        },
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "pchain", &mut std::io::stdout());
            ExitCode::SUCCESS
        }
    }
}
