//! Package and service reconciliation against the dpkg database.
//!
//! A rule is checked with a single `dpkg-query` call. When the reported state
//! differs from the desired one, the matching corrective `apt` or `service`
//! command is issued. A host that already matches sees no corrective command,
//! so repeated runs are idempotent for packages. Services are the exception:
//! dpkg knows nothing about whether a daemon is running, so `start` and
//! `restart` are always issued.
use std::fmt;

use crate::error::ReconcileError;
use crate::exec::{Executor, run_quiet};

/// Desired state of a package or service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DesiredStatus {
    /// The package is installed.
    Installed,
    /// The package is absent (purged).
    NotInstalled,
    /// The service is started.
    Started,
    /// The service is restarted.
    Restarted,
}

impl DesiredStatus {
    /// `true` for the service-type statuses, which act through the service
    /// manager instead of the package manager.
    #[must_use]
    pub const fn is_service(self) -> bool {
        matches!(self, Self::Started | Self::Restarted)
    }

    /// Current-status letter that dpkg reports (second character of
    /// `${db:Status-Abbrev}`) when this status already holds.
    ///
    /// Services have no dpkg counterpart.
    #[must_use]
    pub const fn expected_abbrev(self) -> Option<u8> {
        match self {
            Self::Installed => Some(b'i'),
            Self::NotInstalled => Some(b'n'),
            Self::Started | Self::Restarted => None,
        }
    }

    /// Corrective action that moves a host toward this status.
    #[must_use]
    pub const fn action(self) -> Action {
        match self {
            Self::Installed => Action::Install,
            Self::NotInstalled => Action::Purge,
            Self::Started => Action::Start,
            Self::Restarted => Action::Restart,
        }
    }
}

impl fmt::Display for DesiredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Installed => write!(f, "installed"),
            Self::NotInstalled => write!(f, "not-installed"),
            Self::Started => write!(f, "started"),
            Self::Restarted => write!(f, "restarted"),
        }
    }
}

/// A corrective command family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// `apt install`.
    Install,
    /// `apt purge` followed by `apt autoremove`.
    Purge,
    /// `service start`.
    Start,
    /// `service restart`.
    Restart,
}

impl Action {
    /// Verb passed to `apt` or `service`.
    #[must_use]
    pub const fn verb(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Purge => "purge",
            Self::Start => "start",
            Self::Restart => "restart",
        }
    }

    /// Shell command that applies this action to `name`.
    ///
    /// `name` is spliced in unquoted; host files are checked for shell-safe
    /// names when they are loaded.
    #[must_use]
    pub fn command(self, name: &str) -> String {
        match self {
            Self::Install => format!("apt install {name} -y"),
            // Purging leaves orphaned dependencies behind; clean them up too.
            Self::Purge => format!("apt purge {name} -y && apt autoremove -y"),
            Self::Start | Self::Restart => format!("sudo service {name} {}", self.verb()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// One package or service to reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptRule {
    /// Package (or service) name.
    pub name: String,
    /// Desired status.
    pub status: DesiredStatus,
    /// User the rule is applied as.
    pub user: String,
}

impl AptRule {
    /// Create a rule.
    #[must_use]
    pub fn new(name: impl Into<String>, status: DesiredStatus, user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            user: user.into(),
        }
    }

    /// `true` if this rule targets a service.
    #[must_use]
    pub const fn is_service(&self) -> bool {
        self.status.is_service()
    }
}

/// Result of a reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The check or the corrective command failed.
    Failed,
    /// Already in the desired state; nothing was changed.
    Satisfied,
    /// A corrective command ran and succeeded.
    Enforced,
}

impl Outcome {
    /// `true` for [`Outcome::Satisfied`] and [`Outcome::Enforced`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Satisfied | Self::Enforced)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "failed"),
            Self::Satisfied => write!(f, "satisfied"),
            Self::Enforced => write!(f, "enforced"),
        }
    }
}

/// What the check found, relative to the desired status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageState {
    /// Matches the desired status.
    Correct,
    /// dpkg knows the package but it should be absent.
    Present,
    /// dpkg does not know the package but it should be installed.
    Missing,
    /// dpkg reported a different (or no) status letter.
    Incorrect {
        /// Status letter reported by dpkg, if one could be parsed.
        current: Option<char>,
    },
}

impl PackageState {
    /// `true` unless the state is [`PackageState::Correct`].
    #[must_use]
    pub const fn needs_change(&self) -> bool {
        !matches!(self, Self::Correct)
    }
}

/// Command that prints the dpkg database entry for `name`.
#[must_use]
pub fn query_command(name: &str) -> String {
    format!(r"dpkg-query -f '${{Package}}\t${{db:Status-Abbrev}}\t${{Version}}\t${{Name}}' -W {name}")
}

/// Extract the current-status letter from `dpkg-query` output.
///
/// The output is tab separated; the second field is the status abbreviation
/// (e.g. `ii `), whose second character is the current status.
#[must_use]
pub fn parse_status_abbrev(stdout: &[u8]) -> Option<u8> {
    stdout
        .split(|&b| b == b'\t')
        .nth(1)
        .and_then(|field| field.get(1))
        .copied()
}

/// Classify query results against `status`.
///
/// A successful query for a package that should be absent, or a failed
/// query for one that should be installed, is a mismatch on its own.
/// Everything else is decided by the parsed status letter; output without a
/// letter never matches.
#[must_use]
pub fn classify(status: DesiredStatus, query_ok: bool, stdout: &[u8]) -> PackageState {
    match (status, query_ok) {
        (DesiredStatus::NotInstalled, true) => PackageState::Present,
        (DesiredStatus::Installed, false) => PackageState::Missing,
        _ => {
            let current = parse_status_abbrev(stdout);
            match (current, status.expected_abbrev()) {
                (Some(got), Some(want)) if got == want => PackageState::Correct,
                _ => PackageState::Incorrect {
                    current: current.map(char::from),
                },
            }
        }
    }
}

/// Drives packages and services on one host toward their desired status.
pub struct Reconciler<'a> {
    executor: &'a dyn Executor,
    host: &'a str,
}

impl fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler that runs its commands through `executor`.
    #[must_use]
    pub const fn new(executor: &'a dyn Executor, host: &'a str) -> Self {
        Self { executor, host }
    }

    /// Query dpkg and classify the current state of `rule`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Check`] if the query cannot be executed.
    pub fn check(&self, rule: &AptRule) -> Result<PackageState, ReconcileError> {
        let result = run_quiet(self.executor, &query_command(&rule.name)).map_err(|e| {
            ReconcileError::Check {
                rule: rule.name.clone(),
                host: self.host.to_string(),
                source: e.into(),
            }
        })?;
        Ok(classify(rule.status, result.success(), &result.stdout))
    }

    /// Bring `rule` into its desired status.
    ///
    /// Returns [`Outcome::Satisfied`] without further commands when a package
    /// rule already holds, [`Outcome::Enforced`] when the corrective command
    /// succeeded. Service rules always run their corrective command.
    ///
    /// # Errors
    ///
    /// Returns a [`ReconcileError`] when the check or the corrective command
    /// fails; the caller should treat this as [`Outcome::Failed`].
    pub fn ensure(&self, rule: &AptRule) -> Result<Outcome, ReconcileError> {
        let state = self.check(rule)?;
        if !state.needs_change() && !rule.is_service() {
            tracing::debug!(host = self.host, rule = %rule.name, "already {}", rule.status);
            return Ok(Outcome::Satisfied);
        }

        let action = rule.status.action();
        let command = action.command(&rule.name);
        tracing::debug!(host = self.host, rule = %rule.name, ?state, %command, "enforcing");

        let result = run_quiet(self.executor, &command).map_err(|e| ReconcileError::Exec {
            action: action.to_string(),
            rule: rule.name.clone(),
            host: self.host.to_string(),
            source: e.into(),
        })?;
        if !result.success() {
            return Err(ReconcileError::CommandFailed {
                action: action.to_string(),
                rule: rule.name.clone(),
                host: self.host.to_string(),
                exit_status: result.exit_status,
                stderr: result.stderr_lossy(),
            });
        }
        Ok(Outcome::Enforced)
    }
}

/// Scripted executors for reconciliation tests.
#[cfg(test)]
pub mod test_helpers {
    use std::collections::HashSet;
    use std::sync::{Mutex, PoisonError};

    use super::query_command;
    use crate::exec::{CommandResult, Executor};

    /// A tiny dpkg/apt emulation: tracks installed packages and answers
    /// `dpkg-query` the way a Debian host would.
    #[derive(Debug, Default)]
    pub struct FakeDpkg {
        installed: Mutex<HashSet<String>>,
        log: Mutex<Vec<String>>,
        /// Packages whose `apt install` fails.
        pub broken: HashSet<String>,
    }

    impl FakeDpkg {
        /// Start with `packages` installed.
        #[must_use]
        pub fn with_installed(packages: &[&str]) -> Self {
            Self {
                installed: Mutex::new(packages.iter().map(ToString::to_string).collect()),
                ..Self::default()
            }
        }

        /// Mark `package` as failing to install.
        #[must_use]
        pub fn with_broken(mut self, package: &str) -> Self {
            self.broken.insert(package.to_string());
            self
        }

        /// Every command run so far, in order.
        #[must_use]
        pub fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        /// Commands run so far that are not dpkg queries.
        #[must_use]
        pub fn corrective_commands(&self) -> Vec<String> {
            self.commands()
                .into_iter()
                .filter(|c| !c.starts_with("dpkg-query"))
                .collect()
        }

        /// `true` if `package` is currently installed.
        #[must_use]
        pub fn is_installed(&self, package: &str) -> bool {
            self.installed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(package)
        }
    }

    impl Executor for FakeDpkg {
        fn run(&self, command: &str, _stdin: &[u8]) -> anyhow::Result<CommandResult> {
            self.log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(command.to_string());
            let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
            let words: Vec<&str> = command.split_whitespace().collect();

            if let Some(name) = words.last().filter(|_| command.starts_with("dpkg-query")) {
                debug_assert_eq!(command, query_command(name));
                return Ok(if installed.contains(*name) {
                    CommandResult::new(format!("{name}\tii \t1.0\t{name}"), "", 0)
                } else {
                    CommandResult::new(
                        "",
                        format!("dpkg-query: no packages found matching {name}"),
                        1,
                    )
                });
            }

            match words.as_slice() {
                ["apt", "install", name, "-y"] => {
                    if self.broken.contains(*name) {
                        return Ok(CommandResult::new(
                            "",
                            format!("E: Unable to locate package {name}"),
                            100,
                        ));
                    }
                    installed.insert((*name).to_string());
                    Ok(CommandResult::default())
                }
                ["apt", "purge", name, "-y", "&&", "apt", "autoremove", "-y"] => {
                    installed.remove(*name);
                    Ok(CommandResult::default())
                }
                ["sudo", "service", name, _] => Ok(if installed.contains(*name) {
                    CommandResult::default()
                } else {
                    CommandResult::new("", format!("{name}: unrecognized service"), 1)
                }),
                _ => Ok(CommandResult::new("", "unexpected command", 127)),
            }
        }
    }
}
