//! The capability surface of a reconciled host.
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use crate::batch::{BatchReport, apply_rules};
use crate::distribute::{Distributor, FileSpec};
use crate::error::{ReconcileError, SessionError, TransferError};
use crate::exec::{CommandResult, Executor};
use crate::reconcile::{AptRule, DesiredStatus, Outcome, Reconciler};
use crate::transport::{Connection, Remote};

/// Everything a run can do against one host.
///
/// [`Remote`] implements this for every connection backend; command handlers
/// only see `dyn Host`, so they can be driven by a mock in tests.
#[cfg_attr(test, mockall::automock)]
pub trait Host: Send + Sync {
    /// Address the host was reached at.
    fn address(&self) -> String;

    /// Run an arbitrary command with `stdin`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be executed at all.
    fn run_cmd(&self, command: &str, stdin: &[u8]) -> Result<CommandResult>;

    /// Push `files` concurrently as the acting user.
    ///
    /// # Errors
    ///
    /// Returns one representative [`TransferError`] after every file was
    /// attempted.
    fn push(&self, files: &[FileSpec], cancel: &AtomicBool) -> Result<(), TransferError>;

    /// Reconcile a single rule.
    ///
    /// # Errors
    ///
    /// Returns a [`ReconcileError`] when the check or corrective command fails.
    fn ensure(&self, rule: &AptRule) -> Result<Outcome, ReconcileError>;

    /// Purge every package in `rules`.
    fn remove(&self, rules: &[String], cancel: &AtomicBool) -> BatchReport;

    /// Install every package in `rules`.
    fn install(&self, rules: &[String], cancel: &AtomicBool) -> BatchReport;

    /// Start every service in `rules`.
    fn run(&self, rules: &[String], cancel: &AtomicBool) -> BatchReport;

    /// Restart every service in `rules`.
    fn restart(&self, rules: &[String], cancel: &AtomicBool) -> BatchReport;

    /// Release every channel and the connection.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] on teardown failure or a second close.
    fn close(&self) -> Result<(), SessionError>;
}

impl<C: Connection> Remote<C> {
    fn batch(&self, status: DesiredStatus, rules: &[String], cancel: &AtomicBool) -> BatchReport {
        apply_rules(self, self.address(), self.active_user(), status, rules, cancel)
    }
}

impl<C: Connection> Host for Remote<C> {
    fn address(&self) -> String {
        Self::address(self).to_string()
    }

    fn run_cmd(&self, command: &str, stdin: &[u8]) -> Result<CommandResult> {
        Executor::run(self, command, stdin)
    }

    fn push(&self, files: &[FileSpec], cancel: &AtomicBool) -> Result<(), TransferError> {
        if files.is_empty() {
            return Ok(());
        }
        let channel = self.file_channel(self.active_user())?;
        Distributor::new(self, channel.as_ref(), Self::address(self)).push(files, cancel)
    }

    fn ensure(&self, rule: &AptRule) -> Result<Outcome, ReconcileError> {
        Reconciler::new(self, Self::address(self)).ensure(rule)
    }

    fn remove(&self, rules: &[String], cancel: &AtomicBool) -> BatchReport {
        self.batch(DesiredStatus::NotInstalled, rules, cancel)
    }

    fn install(&self, rules: &[String], cancel: &AtomicBool) -> BatchReport {
        self.batch(DesiredStatus::Installed, rules, cancel)
    }

    fn run(&self, rules: &[String], cancel: &AtomicBool) -> BatchReport {
        self.batch(DesiredStatus::Started, rules, cancel)
    }

    fn restart(&self, rules: &[String], cancel: &AtomicBool) -> BatchReport {
        self.batch(DesiredStatus::Restarted, rules, cancel)
    }

    fn close(&self) -> Result<(), SessionError> {
        Self::close(self)
    }
}
