//! Command execution seam shared by every transport.
use anyhow::Result;

/// Exit status recorded when the remote process terminated without
/// reporting an exit code (e.g. killed by a signal).
pub const EXIT_MISSING: i32 = -1;

/// Result of a command execution.
///
/// Output is kept as raw bytes: package queries and `id` lookups are parsed
/// from it, and nothing guarantees the remote side speaks UTF-8.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// Exit status, or [`EXIT_MISSING`].
    pub exit_status: i32,
}

impl CommandResult {
    /// Build a result from its parts.
    #[must_use]
    pub fn new(stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>, exit_status: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_status,
        }
    }

    /// `true` when the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Standard output decoded lossily.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily and trimmed.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs a single shell command on a target.
///
/// Every call gets its own execution context; nothing is shared between two
/// commands. A non-zero exit is **not** an error: it is reported through
/// [`CommandResult::exit_status`]. `Err` is reserved for failures to run the
/// command at all (closed session, channel failure, spawn failure).
#[cfg_attr(test, mockall::automock)]
pub trait Executor: Send + Sync {
    /// Run `command`, feeding `stdin` to it, and wait for completion.
    ///
    /// # Errors
    ///
    /// Returns an error if no execution context could be opened or the
    /// transport failed mid-command.
    fn run(&self, command: &str, stdin: &[u8]) -> Result<CommandResult>;
}

/// Run `command` with empty stdin.
///
/// # Errors
///
/// Propagates execution errors from [`Executor::run`].
pub fn run_quiet(executor: &dyn Executor, command: &str) -> Result<CommandResult> {
    executor.run(command, &[])
}
