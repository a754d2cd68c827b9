//! `stampede` CLI subcommands.
//!
//! Provides `run` (execute a load test), `validate` (check a config without
//! generating load) and `init` (generate a starter config).

mod init;
mod run;
mod validate;

use anyhow::Result;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::GlobalFlags;

/// Config file name looked up by auto-discovery and written by `init`.
pub const CONFIG_FILE_NAME: &str = "stampede.toml";

pub const EXIT_THRESHOLD_FAILED: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test
    ///
    /// Executes the scenario defined in stampede.toml (or a custom config
    /// path), prints a summary and writes a JSON report. The exit code is 0
    /// when every threshold passed and 1 otherwise.
    Run {
        /// Path to config file (default: auto-discover stampede.toml)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Base URL for scenario paths (overrides config)
        #[arg(long)]
        url: Option<String>,

        /// Number of virtual users for a flat load (overrides config)
        #[arg(long)]
        vus: Option<u32>,

        /// Test duration, e.g. "30s" or "2m" (overrides config; caps staged runs)
        #[arg(long)]
        duration: Option<String>,

        /// Iteration limit across all VUs (overrides config)
        #[arg(long)]
        iterations: Option<u64>,

        /// JSON report path template; {name} and {timestamp} are substituted
        #[arg(long)]
        out: Option<String>,

        /// Disable JSON report output
        #[arg(long)]
        no_report: bool,
    },

    /// Validate a config file and its threshold expressions
    Validate {
        /// Path to config file (default: auto-discover stampede.toml)
        config: Option<PathBuf>,
    },

    /// Generate a starter stampede.toml
    Init {
        /// Target base URL written into the template
        #[arg(long)]
        url: Option<String>,

        /// Directory to write the config into (defaults to current directory)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

impl Command {
    /// Execute the selected subcommand. Errors map to exit code 2.
    pub fn execute(self, global: &GlobalFlags) -> Result<ExitCode> {
        match self {
            Command::Run {
                config,
                url,
                vus,
                duration,
                iterations,
                out,
                no_report,
            } => {
                let overrides = run::Overrides {
                    url,
                    vus,
                    duration,
                    iterations,
                    out,
                    no_report,
                };
                let runtime = tokio::runtime::Runtime::new()?;
                let passed = runtime.block_on(run::execute_run(config, overrides, global))?;
                Ok(if passed {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(EXIT_THRESHOLD_FAILED)
                })
            },
            Command::Validate { config } => {
                validate::execute_validate(config)?;
                Ok(ExitCode::SUCCESS)
            },
            Command::Init { url, path, force } => {
                init::execute_init(url, path, force)?;
                Ok(ExitCode::SUCCESS)
            },
        }
    }
}

/// Use `explicit` if given, else discover `stampede.toml`.
fn locate_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: {}\nUse `stampede init` to create one.",
                    path.display()
                );
            }
            Ok(path)
        },
        None => {
            let cwd = std::env::current_dir()?;
            discover_config(&cwd).ok_or_else(|| {
                anyhow::anyhow!(
                    "No {CONFIG_FILE_NAME} found.\n\
                     Run `stampede init` to create one,\n\
                     or use `--config path/to/file.toml` to specify one."
                )
            })
        },
    }
}

/// Discover `stampede.toml` by walking parent directories.
///
/// Starts from `start` and walks up until either the file is found or the
/// filesystem root is reached. This matches `.git` directory discovery
/// semantics.
fn discover_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}
