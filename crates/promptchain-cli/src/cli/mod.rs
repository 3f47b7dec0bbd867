//! CLI command definitions for the `pchain` binary.
//!
//! Uses clap derive macros. Unknown `--<name> <value>` pairs after the
//! known flags are treated as user parameters and bound into the pipeline
//! context.

pub mod run;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

/// Local-first orchestrator for multi-stage prompt pipelines.
#[derive(Parser)]
#[command(name = "pchain", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline.
    Run(RunArgs),

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the pipeline YAML definition.
    #[arg(long)]
    pub pipeline: PathBuf,

    /// Resume into an existing run directory.
    #[arg(long)]
    pub run_dir: Option<PathBuf>,

    /// Root directory for fresh runs.
    #[arg(long, default_value = "runs")]
    pub runs_root: PathBuf,

    /// Run exactly one stage.
    #[arg(long)]
    pub stage: Option<String>,

    /// Start from this stage (inclusive). Requires --run-dir unless it is
    /// the first stage.
    #[arg(long)]
    pub from_stage: Option<String>,

    /// Stop after this stage (inclusive).
    #[arg(long)]
    pub stop_after: Option<String>,

    /// Override concurrent-mode fan-out width for this invocation.
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    /// User parameters as `--name value` or `--name=value` pairs.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub params: Vec<String>,
}
