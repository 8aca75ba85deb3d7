//! `converge` command-line entry point.

use anyhow::Result;
use clap::Parser;

use converge_cli::{cli, commands, logging};

fn main() -> Result<()> {
    let _ = enable_ansi_support::enable_ansi_support();
    let args = cli::Cli::parse();

    match args.command {
        cli::Command::Apply(opts) => {
            logging::init_subscriber(args.verbose, "apply");
            let log = logging::Logger::new("apply");
            commands::apply::run(&args.global, &opts, &log)
        }
        cli::Command::Plan(opts) => {
            logging::init_subscriber(args.verbose, "plan");
            let log = logging::Logger::new("plan");
            commands::plan::run(&args.global, &opts, &log)
        }
        cli::Command::Version => {
            commands::version::run();
            Ok(())
        }
    }
}
