//! Command: reconcile every configured host.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::batch::{BatchReport, BatchStats};
use crate::cli::{ApplyOpts, GlobalOpts};
use crate::config::{Config, HostConfig};
use crate::distribute::FileSpec;
use crate::error::ConnectionError;
use crate::host::Host;
use crate::logging::{Log, Logger, TaskStatus};
use crate::transport;

/// What happened on one host.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostSummary {
    /// Rule outcome counts across all four batches.
    pub stats: BatchStats,
    /// Number of files pushed.
    pub files: usize,
    /// Error from the file push, if any.
    pub push_error: Option<String>,
    /// Error from closing the session, if any.
    pub close_error: Option<String>,
    /// `true` if cancellation cut the run short.
    pub cancelled: bool,
}

impl HostSummary {
    fn add_batch(&mut self, report: &BatchReport) {
        self.stats += report.stats();
        self.cancelled |= report.cancelled;
    }

    /// Summary status for the run report.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        if self.stats.failed > 0 || self.push_error.is_some() {
            TaskStatus::Failed
        } else if self.cancelled {
            TaskStatus::Skipped
        } else {
            TaskStatus::Ok
        }
    }

    /// One-line detail for the run report.
    #[must_use]
    pub fn message(&self) -> String {
        let mut parts = vec![self.stats.summary()];
        if self.files > 0 {
            parts.push(format!("{} files", self.files));
        }
        if self.push_error.is_some() {
            parts.push("push failed".to_string());
        }
        if self.cancelled {
            parts.push("cancelled".to_string());
        }
        parts.join(", ")
    }
}

/// Run Remove, Install, Run, Restart and Push against `host`, then close it.
///
/// Every step runs even if an earlier one reported failures.
pub fn apply_host(
    host: &dyn Host,
    config: &Config,
    files: &[FileSpec],
    cancel: &AtomicBool,
    log: &dyn Log,
) -> HostSummary {
    let mut summary = HostSummary::default();

    let steps: [(&str, fn(&dyn Host, &[String], &AtomicBool) -> BatchReport, &[String]); 4] = [
        ("remove", |h, r, c| h.remove(r, c), config.remove.as_slice()),
        ("install", |h, r, c| h.install(r, c), config.install.as_slice()),
        ("run", |h, r, c| h.run(r, c), config.run.as_slice()),
        ("restart", |h, r, c| h.restart(r, c), config.restart.as_slice()),
    ];
    for (label, step, rules) in steps {
        if rules.is_empty() {
            continue;
        }
        let report = step(host, rules, cancel);
        for failure in report.failures() {
            log.warn(&format!(
                "{label} {}: {}",
                failure.name,
                failure.error.as_deref().unwrap_or("failed")
            ));
        }
        log.info(&format!("{label}: {}", report.stats().summary()));
        summary.add_batch(&report);
    }

    if !files.is_empty() {
        match host.push(files, cancel) {
            Ok(()) => {
                summary.files = files.len();
                log.info(&format!("pushed {} files", files.len()));
            }
            Err(e) => {
                log.error(&format!("push: {e}"));
                summary.push_error = Some(e.to_string());
                summary.cancelled |= cancel.load(Ordering::SeqCst);
            }
        }
    }

    if let Err(e) = host.close() {
        log.warn(&format!("{e}"));
        summary.close_error = Some(e.to_string());
    }
    summary
}

/// Install a Ctrl-C handler that sets the returned flag.
fn cancel_flag(log: &dyn Log) -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        log.warn(&format!("could not install Ctrl-C handler: {e}"));
    }
    cancel
}

/// Reconcile each config in turn, recording one task per host in `log`.
///
/// A host whose file entries are invalid or which cannot be reached is
/// recorded as failed; the remaining hosts still run.
pub fn apply_all(
    configs: &[Config],
    cancel: &AtomicBool,
    log: &dyn Log,
    connect: &dyn Fn(&HostConfig) -> Result<Box<dyn Host>, ConnectionError>,
) {
    for config in configs {
        let address = config.host.socket_address();
        if cancel.load(Ordering::SeqCst) {
            log.record_task(&address, TaskStatus::Skipped, Some("cancelled"));
            continue;
        }
        log.stage(&address);

        let files = match config.file_specs() {
            Ok(files) => files,
            Err(e) => {
                log.error(&format!("{e}"));
                log.record_task(&address, TaskStatus::Failed, Some("invalid config"));
                continue;
            }
        };
        let host = match connect(&config.host) {
            Ok(host) => host,
            Err(e) => {
                log.error(&format!("{e}"));
                log.record_task(&address, TaskStatus::Failed, Some("unreachable"));
                continue;
            }
        };

        let summary = apply_host(host.as_ref(), config, &files, cancel, log);
        log.record_task(&address, summary.status(), Some(&summary.message()));
    }
}

/// Run the apply command.
///
/// # Errors
///
/// Returns an error if configuration loading fails or any host had failures.
pub fn run(global: &GlobalOpts, opts: &ApplyOpts, log: &Logger) -> Result<()> {
    log.info(&format!("converge {}", super::version()));
    let configs = super::load_configs(global, opts, log)?;
    let cancel = cancel_flag(log);

    apply_all(&configs, &cancel, log, &transport::connect);
    log.print_summary();

    if log.has_failures() {
        anyhow::bail!("one or more hosts failed");
    }
    Ok(())
}
