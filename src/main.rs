//! stampede: staged virtual-user load testing from a TOML scenario.
//!
//! Exit codes: 0 when every threshold passed, 1 when any threshold failed,
//! 2 when the configuration or setup was invalid and no load was generated.

use std::process::ExitCode;

use clap::{Args, Parser};
use tracing_subscriber::EnvFilter;

mod commands;

/// Staged virtual-user load generator
#[derive(Parser)]
#[command(name = "stampede")]
#[command(about = "Run staged HTTP load tests with pass/fail thresholds", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalFlags,

    #[command(subcommand)]
    command: commands::Command,
}

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct GlobalFlags {
    /// Log run progress (stage transitions, sink output) to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable the live progress display
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR", value_parser = clap::builder::BoolishValueParser::new())]
    pub no_color: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    // A missing .env is fine; placeholders are checked when the workload compiles.
    dotenvy::dotenv().ok();

    match cli.command.execute(&cli.global) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(commands::EXIT_CONFIG_ERROR)
        },
    }
}

/// Logs go to stderr so they never interleave with the summary on stdout.
fn init_tracing(verbose: bool) {
    let fallback = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
