//! Top-level subcommand orchestration.
pub mod apply;
pub mod plan;
pub mod version;

use anyhow::{Context as _, Result};

use crate::cli::{ApplyOpts, GlobalOpts};
use crate::config::{self, Config};
use crate::logging::Log;

/// Load every host config selected by `opts`.
///
/// # Errors
///
/// Returns an error if the config directory or any host file is invalid.
pub fn load_configs(global: &GlobalOpts, opts: &ApplyOpts, log: &dyn Log) -> Result<Vec<Config>> {
    log.stage("Loading configuration");
    let configs = config::load_all(&global.config_dir, global.defaults.as_deref())
        .with_context(|| format!("loading hosts from {}", global.config_dir.display()))?;

    let selected: Vec<Config> = configs
        .into_iter()
        .filter(|c| opts.selects(&c.host.address))
        .collect();
    for config in &selected {
        log.debug(&format!(
            "{}: {} install, {} remove, {} run, {} restart, {} files",
            config.source.display(),
            config.install.len(),
            config.remove.len(),
            config.run.len(),
            config.restart.len(),
            config.files.len()
        ));
    }
    log.info(&format!("loaded {} hosts", selected.len()));
    Ok(selected)
}

/// Version string embedded at build time.
#[must_use]
pub fn version() -> &'static str {
    option_env!("CONVERGE_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}
