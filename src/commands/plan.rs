//! Command: print the merged per-host configuration without connecting.
use anyhow::{Context as _, Result};

use crate::cli::{ApplyOpts, GlobalOpts};
use crate::config::Config;
use crate::logging::Logger;

/// Render `config` as TOML with secrets masked.
///
/// # Errors
///
/// Returns an error if the config cannot be serialized.
pub fn render(config: &Config) -> Result<String> {
    let shown = Config {
        host: config.host.redacted(),
        ..config.clone()
    };
    toml::to_string(&shown).with_context(|| format!("rendering {}", config.source.display()))
}

/// Run the plan command.
///
/// # Errors
///
/// Returns an error if configuration loading or rendering fails.
pub fn run(global: &GlobalOpts, opts: &ApplyOpts, log: &Logger) -> Result<()> {
    let configs = super::load_configs(global, opts, log)?;
    for config in &configs {
        log.stage(&config.host.socket_address());
        println!("{}", render(config)?);
    }
    Ok(())
}
