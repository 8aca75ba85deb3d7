//! Host configuration loading.
//!
//! A config directory holds one TOML file per host. An optional defaults file
//! contributes `install`, `run` and `files` entries to every host.
pub mod host;
pub mod toml_loader;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::distribute::FileSpec;
use crate::error::ConfigError;

pub use host::{HostConfig, TransportKind};

/// Minimum length for octal mode strings.
const OCTAL_MODE_MIN_LEN: usize = 3;

/// Maximum length for octal mode strings.
const OCTAL_MODE_MAX_LEN: usize = 4;

/// A file to distribute, as written in a host file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileEntry {
    /// Source path; relative paths resolve against the declaring file's directory.
    pub local_path: PathBuf,
    /// Destination path on the host.
    pub remote_path: PathBuf,
    /// Owner name, resolved on the host.
    pub owner: String,
    /// Group name, resolved on the host.
    pub group: String,
    /// Octal permission string such as `"644"`.
    pub mode: String,
}

impl FileEntry {
    /// Convert to a transfer descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMode`] if `mode` is not 3 or 4 octal digits.
    pub fn to_spec(&self, file: &str) -> Result<FileSpec, ConfigError> {
        Ok(FileSpec {
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            owner: self.owner.clone(),
            group: self.group.clone(),
            mode: parse_mode(&self.mode).ok_or_else(|| ConfigError::InvalidMode {
                file: file.to_string(),
                path: self.remote_path.display().to_string(),
                mode: self.mode.clone(),
            })?,
        })
    }
}

/// Parse an octal mode string (e.g. `"644"`, `"0755"`).
#[must_use]
pub fn parse_mode(mode: &str) -> Option<u32> {
    if !(OCTAL_MODE_MIN_LEN..=OCTAL_MODE_MAX_LEN).contains(&mode.len()) {
        return None;
    }
    if !mode.chars().all(|c| ('0'..='7').contains(&c)) {
        return None;
    }
    u32::from_str_radix(mode, 8).ok()
}

/// Package or service name: alphanumeric first, then the Debian package
/// charset plus `@` and `:` for template units and architecture qualifiers.
fn is_rule_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || "@._+:-".contains(c))
}

/// Portable user or group name, optionally ending in `$`.
fn is_account_name(name: &str) -> bool {
    let body = name.strip_suffix('$').unwrap_or(name);
    let mut chars = body.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
}

/// Reject names that would not survive being spliced into a shell command.
fn check_names<'a>(
    file: &str,
    field: &'static str,
    names: impl IntoIterator<Item = &'a String>,
    valid: fn(&str) -> bool,
) -> Result<(), ConfigError> {
    names
        .into_iter()
        .find(|name| !valid(name))
        .map_or(Ok(()), |name| {
            Err(ConfigError::InvalidName {
                file: file.to_string(),
                field,
                name: name.clone(),
            })
        })
}

fn check_files(file: &str, files: &[FileEntry]) -> Result<(), ConfigError> {
    check_names(file, "owner", files.iter().map(|f| &f.owner), is_account_name)?;
    check_names(file, "group", files.iter().map(|f| &f.group), is_account_name)?;
    for entry in files {
        entry.to_spec(file)?;
    }
    Ok(())
}

/// Desired state of one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Connection parameters.
    #[serde(default)]
    pub host: HostConfig,
    /// Packages to install.
    #[serde(default)]
    pub install: Vec<String>,
    /// Packages to purge.
    #[serde(default)]
    pub remove: Vec<String>,
    /// Services to start.
    #[serde(default)]
    pub run: Vec<String>,
    /// Services to restart.
    #[serde(default)]
    pub restart: Vec<String>,
    /// Files to distribute.
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// File this config was loaded from.
    #[serde(skip)]
    pub source: PathBuf,
}

/// Entries appended to every host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct Defaults {
    #[serde(default)]
    install: Vec<String>,
    #[serde(default)]
    run: Vec<String>,
    #[serde(default)]
    files: Vec<FileEntry>,
}

impl Config {
    /// Transfer descriptors for every file entry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMode`] for the first bad mode.
    pub fn file_specs(&self) -> Result<Vec<FileSpec>, ConfigError> {
        let source = self.source.display().to_string();
        self.files.iter().map(|f| f.to_spec(&source)).collect()
    }

    /// `true` if there is nothing to reconcile.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.install.is_empty()
            && self.remove.is_empty()
            && self.run.is_empty()
            && self.restart.is_empty()
            && self.files.is_empty()
    }

    /// Load one host file, resolve relative local paths and validate modes
    /// and names.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml_loader::load_config(path)?;
        config.source = path.to_path_buf();
        resolve_local_paths(&mut config.files, path);
        let source = path.display().to_string();
        check_names(&source, "install", &config.install, is_rule_name)?;
        check_names(&source, "remove", &config.remove, is_rule_name)?;
        check_names(&source, "run", &config.run, is_rule_name)?;
        check_names(&source, "restart", &config.restart, is_rule_name)?;
        check_files(&source, &config.files)?;
        Ok(config)
    }

    fn merge_defaults(&mut self, defaults: &Defaults) {
        self.install.extend(defaults.install.iter().cloned());
        self.run.extend(defaults.run.iter().cloned());
        self.files.extend(defaults.files.iter().cloned());
    }
}

fn resolve_local_paths(files: &mut [FileEntry], declared_in: &Path) {
    let Some(base) = declared_in.parent() else {
        return;
    };
    for file in files {
        if file.local_path.is_relative() {
            file.local_path = base.join(&file.local_path);
        }
    }
}

fn load_defaults(path: &Path) -> Result<Defaults, ConfigError> {
    let mut defaults: Defaults = toml_loader::load_config(path)?;
    resolve_local_paths(&mut defaults.files, path);
    let source = path.display().to_string();
    check_names(&source, "install", &defaults.install, is_rule_name)?;
    check_names(&source, "run", &defaults.run, is_rule_name)?;
    check_files(&source, &defaults.files)?;
    Ok(defaults)
}

/// Load every `*.toml` host file in `dir`, in file-name order.
///
/// Entries from `defaults` are appended to each host. Files whose host has
/// an empty address are skipped.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the directory cannot be listed or any file
/// is invalid.
pub fn load_all(dir: &Path, defaults: Option<&Path>) -> Result<Vec<Config>, ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: dir.display().to_string(),
        source,
    };
    let defaults = defaults.map(load_defaults).transpose()?.unwrap_or_default();

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut configs = Vec::with_capacity(paths.len());
    for path in paths {
        let mut config = Config::load(&path)?;
        if config.host.address.is_empty() {
            tracing::debug!("skipping {}: no host address", path.display());
            continue;
        }
        config.merge_defaults(&defaults);
        configs.push(config);
    }
    Ok(configs)
}
