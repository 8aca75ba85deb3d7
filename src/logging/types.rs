//! Core logging types: task entries, status, and the [`Log`] trait.

/// Per-host result for summary reporting.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    /// Host address or task name.
    pub name: String,
    /// Final status.
    pub status: TaskStatus,
    /// Optional detail message (e.g., failure counts or an error).
    pub message: Option<String>,
}

/// Status of a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Everything was applied.
    Ok,
    /// Work was not attempted, e.g. after cancellation.
    Skipped,
    /// The host was unreachable or at least one operation failed.
    Failed,
}

/// Abstraction over logging backends.
///
/// Command handlers log through this trait so they can be exercised with a
/// test double.
pub trait Log: Send + Sync {
    /// Log a stage header (major section).
    fn stage(&self, msg: &str);
    /// Log an informational message.
    fn info(&self, msg: &str);
    /// Log a debug message (may be suppressed on console).
    fn debug(&self, msg: &str);
    /// Log a warning message.
    fn warn(&self, msg: &str);
    /// Log an error message.
    fn error(&self, msg: &str);
    /// Record a task result for the summary.
    fn record_task(&self, name: &str, status: TaskStatus, message: Option<&str>);
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn task_status_equality() {
        assert_eq!(TaskStatus::Ok, TaskStatus::Ok);
        assert_ne!(TaskStatus::Ok, TaskStatus::Failed);
        assert_ne!(TaskStatus::Skipped, TaskStatus::Failed);
    }
}
