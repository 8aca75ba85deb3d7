//! Domain-specific error types for the reconciliation engine.
//!
//! This module provides a structured error hierarchy using [`thiserror`].
//! Core components return typed errors (e.g., [`ReconcileError`],
//! [`TransferError`]) while command handlers at the CLI boundary convert them
//! to [`anyhow::Error`] via the standard `?` operator.
//!
//! # Error hierarchy
//!
//! ```text
//! ConvergeError
//! ├── Config(ConfigError)          host file loading and validation
//! ├── Connection(ConnectionError)  dial, handshake, host key, auth
//! ├── Session(SessionError)        closed session, channel failures
//! ├── Reconcile(ReconcileError)    package/service check and enforcement
//! └── Transfer(TransferError)      file push, chmod, chown
//! ```

use thiserror::Error;

/// Boxed source error carried by variants that wrap transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error type for the engine.
#[derive(Error, Debug)]
pub enum ConvergeError {
    /// Configuration-related error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Could not establish a connection to a host.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// An established session could not serve a request.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// A package or service rule could not be reconciled.
    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// A file could not be distributed.
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// Errors that arise from loading host configuration files.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A file mode is not a valid octal permission string.
    #[error("invalid mode '{mode}' for {path} in {file}: expected octal such as 644")]
    InvalidMode {
        /// Config file containing the entry.
        file: String,
        /// Remote path of the offending entry.
        path: String,
        /// The rejected mode string.
        mode: String,
    },

    /// A package, service, owner or group name has characters that cannot
    /// appear in a name of that kind.
    #[error("invalid {field} name '{name}' in {file}")]
    InvalidName {
        /// Config file containing the entry.
        file: String,
        /// Which list or field the name came from.
        field: &'static str,
        /// The rejected name.
        name: String,
    },

    /// The config file is not valid TOML for the expected schema.
    #[error("invalid config {file}: {message}")]
    InvalidSyntax {
        /// Path of the config file.
        file: String,
        /// Parser message.
        message: String,
    },

    /// An I/O error occurred while reading a config file or directory.
    #[error("IO error reading {path}: {source}")]
    Io {
        /// Path that could not be read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Errors that prevent a session from being opened.
///
/// None of these are fatal to a run: the host is skipped and the remaining
/// hosts are still reconciled.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// TCP connection could not be established.
    #[error("unable to reach {address}: {source}")]
    Dial {
        /// Target address (`host:port`).
        address: String,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// SSH protocol negotiation failed.
    #[error("ssh handshake with {address} failed: {source}")]
    Handshake {
        /// Target address.
        address: String,
        /// Transport error.
        source: BoxError,
    },

    /// The host key verifier refused the key presented by the server.
    #[error("host key for {address} rejected: {reason}")]
    HostKeyRejected {
        /// Target address.
        address: String,
        /// Why the key was rejected.
        reason: String,
    },

    /// Authentication was refused.
    #[error("authentication as {user} on {address} failed: {reason}")]
    Auth {
        /// Login user.
        user: String,
        /// Target address.
        address: String,
        /// Server or client side reason.
        reason: String,
    },
}

/// Errors raised by an open session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was closed; no further requests are possible.
    #[error("session to {address} is closed")]
    Closed {
        /// Target address.
        address: String,
    },

    /// An execution context could not be created or failed mid-command.
    #[error("could not run `{command}` on {address}: {source}")]
    Exec {
        /// Command being run.
        command: String,
        /// Target address.
        address: String,
        /// Transport error.
        source: BoxError,
    },

    /// A file-transfer channel could not be opened.
    #[error("could not open file channel for {user} on {address}: {source}")]
    Channel {
        /// Acting user the channel was requested for.
        user: String,
        /// Target address.
        address: String,
        /// Transport error.
        source: BoxError,
    },

    /// Tearing down channels or the connection failed.
    #[error("could not close session to {address}: {source}")]
    Close {
        /// Target address.
        address: String,
        /// Transport error.
        source: BoxError,
    },
}

/// Errors that arise while reconciling a package or service rule.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The state query could not be executed.
    #[error("could not check {rule} on {host}: {source}")]
    Check {
        /// Package or service name.
        rule: String,
        /// Host address.
        host: String,
        /// Underlying execution error.
        source: BoxError,
    },

    /// The corrective command could not be executed.
    #[error("could not {action} {rule} on {host}: {source}")]
    Exec {
        /// Corrective action verb.
        action: String,
        /// Package or service name.
        rule: String,
        /// Host address.
        host: String,
        /// Underlying execution error.
        source: BoxError,
    },

    /// The corrective command ran but exited non-zero.
    #[error("could not {action} {rule} on {host} (exit {exit_status}): {stderr}")]
    CommandFailed {
        /// Corrective action verb.
        action: String,
        /// Package or service name.
        rule: String,
        /// Host address.
        host: String,
        /// Exit status reported by the remote side.
        exit_status: i32,
        /// Captured standard error.
        stderr: String,
    },
}

/// Errors that arise while pushing a single file.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The local source could not be opened or inspected.
    #[error("unable to open local file {path}: {source}")]
    LocalOpen {
        /// Local path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file channel for the acting user is unavailable.
    #[error(transparent)]
    Channel(#[from] SessionError),

    /// Creating or writing the remote file failed.
    #[error("unable to copy to remote file {path}: {source}")]
    Upload {
        /// Remote path.
        path: String,
        /// Transport error.
        source: BoxError,
    },

    /// Fewer bytes reached the remote file than the local file holds.
    #[error("wrote {written} of {expected} bytes to {path}")]
    ShortWrite {
        /// Remote path.
        path: String,
        /// Bytes written.
        written: u64,
        /// Size of the local source.
        expected: u64,
    },

    /// Applying the permission mode failed.
    #[error("chmod {mode:o} {path} failed: {source}")]
    Chmod {
        /// Remote path.
        path: String,
        /// Requested mode.
        mode: u32,
        /// Transport error.
        source: BoxError,
    },

    /// A user or group name could not be resolved to a numeric id.
    #[error("could not resolve {kind} '{name}': {reason}")]
    ResolveId {
        /// `"owner"` or `"group"`.
        kind: &'static str,
        /// Name being resolved.
        name: String,
        /// Stderr of the lookup or a parse failure.
        reason: String,
    },

    /// Applying ownership failed.
    #[error("chown {uid}:{gid} {path} failed: {source}")]
    Chown {
        /// Remote path.
        path: String,
        /// Resolved user id.
        uid: u32,
        /// Resolved group id.
        gid: u32,
        /// Transport error.
        source: BoxError,
    },

    /// The push was not started because cancellation was requested.
    #[error("push to {host} cancelled before start")]
    Cancelled {
        /// Host address.
        host: String,
    },
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::io;

    // -----------------------------------------------------------------------
    // ConfigError
    // -----------------------------------------------------------------------

    #[test]
    fn config_error_invalid_mode_display() {
        let e = ConfigError::InvalidMode {
            file: "web.toml".to_string(),
            path: "/etc/motd".to_string(),
            mode: "9z".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "invalid mode '9z' for /etc/motd in web.toml: expected octal such as 644"
        );
    }

    #[test]
    fn config_error_io_has_source() {
        use std::error::Error as StdError;
        let e = ConfigError::Io {
            path: "conf".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such dir"),
        };
        assert!(e.source().is_some());
        assert!(e.to_string().contains("conf"));
    }

    // -----------------------------------------------------------------------
    // ConnectionError
    // -----------------------------------------------------------------------

    #[test]
    fn connection_error_dial_display() {
        let e = ConnectionError::Dial {
            address: "10.0.0.5:22".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(e.to_string(), "unable to reach 10.0.0.5:22: refused");
    }

    #[test]
    fn connection_error_auth_display() {
        let e = ConnectionError::Auth {
            user: "root".to_string(),
            address: "web:22".to_string(),
            reason: "password rejected".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "authentication as root on web:22 failed: password rejected"
        );
    }

    // -----------------------------------------------------------------------
    // ReconcileError
    // -----------------------------------------------------------------------

    #[test]
    fn reconcile_error_command_failed_display() {
        let e = ReconcileError::CommandFailed {
            action: "install".to_string(),
            rule: "apache2".to_string(),
            host: "web:22".to_string(),
            exit_status: 100,
            stderr: "E: Unable to locate package".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "could not install apache2 on web:22 (exit 100): E: Unable to locate package"
        );
    }

    #[test]
    fn reconcile_error_check_has_source() {
        use std::error::Error as StdError;
        let e = ReconcileError::Check {
            rule: "apache2".to_string(),
            host: "web:22".to_string(),
            source: "channel closed".into(),
        };
        assert!(e.source().is_some());
    }

    // -----------------------------------------------------------------------
    // TransferError
    // -----------------------------------------------------------------------

    #[test]
    fn transfer_error_short_write_display() {
        let e = TransferError::ShortWrite {
            path: "/var/www/index.php".to_string(),
            written: 10,
            expected: 42,
        };
        assert_eq!(e.to_string(), "wrote 10 of 42 bytes to /var/www/index.php");
    }

    #[test]
    fn transfer_error_chmod_shows_octal_mode() {
        let e = TransferError::Chmod {
            path: "/etc/motd".to_string(),
            mode: 0o644,
            source: "permission denied".into(),
        };
        assert!(e.to_string().starts_with("chmod 644 /etc/motd"));
    }

    #[test]
    fn transfer_error_wraps_session_error_transparently() {
        let e: TransferError = SessionError::Closed {
            address: "web:22".to_string(),
        }
        .into();
        assert_eq!(e.to_string(), "session to web:22 is closed");
    }

    // -----------------------------------------------------------------------
    // ConvergeError conversions
    // -----------------------------------------------------------------------

    #[test]
    fn converge_error_from_transfer_error() {
        let e: ConvergeError = TransferError::Cancelled {
            host: "web:22".to_string(),
        }
        .into();
        assert!(e.to_string().starts_with("Transfer error"));
    }

    #[test]
    fn converge_error_from_connection_error() {
        let e: ConvergeError = ConnectionError::HostKeyRejected {
            address: "web:22".to_string(),
            reason: "fingerprint mismatch".to_string(),
        }
        .into();
        assert!(e.to_string().contains("fingerprint mismatch"));
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn all_error_types_are_send_sync() {
        assert_send_sync::<ConvergeError>();
        assert_send_sync::<ConfigError>();
        assert_send_sync::<ConnectionError>();
        assert_send_sync::<SessionError>();
        assert_send_sync::<ReconcileError>();
        assert_send_sync::<TransferError>();
    }

    #[test]
    fn reconcile_error_converts_to_anyhow() {
        let e = ReconcileError::CommandFailed {
            action: "purge".to_string(),
            rule: "nginx".to_string(),
            host: "web:22".to_string(),
            exit_status: 1,
            stderr: String::new(),
        };
        let _anyhow_err: anyhow::Error = e.into();
    }
}
