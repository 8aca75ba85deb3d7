//! Command-line interface definitions.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Top-level CLI entry point.
#[derive(Parser, Debug)]
#[command(
    name = "converge",
    about = "Drive remote hosts toward declared packages, services and files",
    version
)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Options shared by every subcommand.
    #[command(flatten)]
    pub global: GlobalOpts,
}

/// Options shared across all subcommands.
#[derive(Parser, Debug, Clone)]
pub struct GlobalOpts {
    /// Directory holding one TOML file per host
    #[arg(short, long = "config-dir", global = true, default_value = "conf")]
    pub config_dir: PathBuf,

    /// TOML file whose install, run and files entries apply to every host
    #[arg(long, global = true)]
    pub defaults: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reconcile every configured host
    Apply(ApplyOpts),
    /// Print the merged configuration of every host without connecting
    Plan(ApplyOpts),
    /// Print version information
    Version,
}

/// Options for the `apply` and `plan` subcommands.
#[derive(Parser, Debug, Clone, Default)]
pub struct ApplyOpts {
    /// Only handle hosts whose address contains one of these values
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,
}

impl ApplyOpts {
    /// `true` if `address` passes the `--only` filter.
    #[must_use]
    pub fn selects(&self, address: &str) -> bool {
        self.only.is_empty() || self.only.iter().any(|o| address.contains(o.as_str()))
    }
}
