//! Ordered, continue-on-failure reconciliation of rule lists.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::exec::Executor;
use crate::reconcile::{AptRule, DesiredStatus, Outcome, Reconciler};

/// Result of reconciling one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleReport {
    /// Rule name.
    pub name: String,
    /// Outcome of the attempt.
    pub outcome: Outcome,
    /// Error message when the outcome is [`Outcome::Failed`].
    pub error: Option<String>,
}

/// Per-rule results of one batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Status every rule in the batch was driven toward.
    pub status: DesiredStatus,
    /// One entry per attempted rule, in declaration order.
    pub rules: Vec<RuleReport>,
    /// `true` if cancellation stopped the batch before every rule ran.
    pub cancelled: bool,
}

impl BatchReport {
    /// An empty report for `status`.
    #[must_use]
    pub const fn new(status: DesiredStatus) -> Self {
        Self {
            status,
            rules: Vec::new(),
            cancelled: false,
        }
    }

    /// Rules that failed.
    pub fn failures(&self) -> impl Iterator<Item = &RuleReport> {
        self.rules
            .iter()
            .filter(|r| r.outcome == Outcome::Failed)
    }

    /// `true` if no rule failed and the batch was not cancelled.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.cancelled && self.failures().next().is_none()
    }

    /// Count of rules by outcome.
    #[must_use]
    pub fn stats(&self) -> BatchStats {
        self.rules.iter().fold(BatchStats::default(), |mut acc, r| {
            match r.outcome {
                Outcome::Enforced => acc.enforced += 1,
                Outcome::Satisfied => acc.satisfied += 1,
                Outcome::Failed => acc.failed += 1,
            }
            acc
        })
    }
}

/// Outcome counters for a [`BatchReport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Rules that needed and received a corrective command.
    pub enforced: u32,
    /// Rules already in the desired state.
    pub satisfied: u32,
    /// Rules whose check or corrective command failed.
    pub failed: u32,
}

impl BatchStats {
    /// Format the summary string (e.g. "2 enforced, 5 already ok, 1 failed").
    ///
    /// # Examples
    ///
    /// ```
    /// use converge_cli::batch::BatchStats;
    ///
    /// let stats = BatchStats { enforced: 2, satisfied: 5, failed: 0 };
    /// assert_eq!(stats.summary(), "2 enforced, 5 already ok");
    /// ```
    #[must_use]
    pub fn summary(&self) -> String {
        if self.failed > 0 {
            format!(
                "{} enforced, {} already ok, {} failed",
                self.enforced, self.satisfied, self.failed
            )
        } else {
            format!("{} enforced, {} already ok", self.enforced, self.satisfied)
        }
    }
}

impl std::ops::AddAssign for BatchStats {
    fn add_assign(&mut self, rhs: Self) {
        self.enforced += rhs.enforced;
        self.satisfied += rhs.satisfied;
        self.failed += rhs.failed;
    }
}

impl fmt::Display for BatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Reconcile every rule in `rules` toward `status`, in order.
///
/// A failing rule is logged and recorded; the remaining rules still run.
/// Nothing already enforced is rolled back. When `cancel` is set the batch
/// stops before the next rule and the report is marked cancelled.
pub fn apply_rules(
    executor: &dyn Executor,
    host: &str,
    user: &str,
    status: DesiredStatus,
    rules: &[String],
    cancel: &AtomicBool,
) -> BatchReport {
    let reconciler = Reconciler::new(executor, host);
    let mut report = BatchReport::new(status);

    for name in rules {
        if cancel.load(Ordering::SeqCst) {
            tracing::warn!(host, "cancelled before {status} {name}");
            report.cancelled = true;
            break;
        }
        let rule = AptRule::new(name.as_str(), status, user);
        let entry = match reconciler.ensure(&rule) {
            Ok(outcome) => {
                tracing::debug!(host, rule = %name, %outcome);
                RuleReport {
                    name: name.clone(),
                    outcome,
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(host, rule = %name, "{e}");
                RuleReport {
                    name: name.clone(),
                    outcome: Outcome::Failed,
                    error: Some(e.to_string()),
                }
            }
        };
        report.rules.push(entry);
    }
    report
}
