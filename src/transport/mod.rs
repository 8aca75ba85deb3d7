//! Sessions to a single target host.
//!
//! A [`Remote`] owns one live [`Connection`] and a per-user cache of
//! [`FileChannel`]s. Commands always get a fresh execution context from the
//! connection; file channels are opened lazily on first use and reused for
//! the lifetime of the session.
#[cfg(unix)]
pub mod local;
pub mod ssh;

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;

use crate::config::{HostConfig, TransportKind};
use crate::error::{ConnectionError, SessionError};
use crate::exec::{CommandResult, Executor};
use crate::host::Host;

/// A live link to one host, able to run commands and open file channels.
pub trait Connection: Send + Sync {
    /// Channel type produced by [`Connection::open_file_channel`].
    type Channel: FileChannel;

    /// Run one command in a fresh execution context.
    ///
    /// # Errors
    ///
    /// Returns an error when the context cannot be opened or breaks while
    /// the command runs. Non-zero exits are returned as results.
    fn exec(&self, command: &str, stdin: &[u8]) -> Result<CommandResult>;

    /// Open a new file-transfer channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses the channel.
    fn open_file_channel(&self) -> Result<Self::Channel>;

    /// Tear down the underlying connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport reports a failure while closing.
    fn disconnect(&self) -> Result<()>;
}

/// File operations on the target side of a connection.
///
/// One channel may be shared by several concurrent pushes, so every method
/// takes `&self`.
pub trait FileChannel: Send + Sync {
    /// Create or truncate `remote` and stream `source` into it.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or a write fails.
    fn upload(&self, source: &mut dyn Read, remote: &Path) -> Result<u64>;

    /// Set the permission bits of `remote`.
    ///
    /// # Errors
    ///
    /// Returns an error if the attributes cannot be changed.
    fn chmod(&self, remote: &Path, mode: u32) -> Result<()>;

    /// Set the numeric owner and group of `remote`.
    ///
    /// # Errors
    ///
    /// Returns an error if the attributes cannot be changed.
    fn chown(&self, remote: &Path, uid: u32, gid: u32) -> Result<()>;

    /// Release the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport reports a failure while closing.
    fn close(&self) -> Result<()>;
}

/// A session to one host over connection backend `C`.
pub struct Remote<C: Connection> {
    address: String,
    active_user: String,
    conn: C,
    channels: Mutex<HashMap<String, Arc<C::Channel>>>,
    closed: AtomicBool,
}

impl<C: Connection> std::fmt::Debug for Remote<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("address", &self.address)
            .field("active_user", &self.active_user)
            .field("conn", &"<Connection>")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Remote<C> {
    /// Wrap an established connection. The login user becomes the acting user.
    #[must_use]
    pub fn new(address: impl Into<String>, user: impl Into<String>, conn: C) -> Self {
        Self {
            address: address.into(),
            active_user: user.into(),
            conn,
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Address this session is connected to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// User the session currently acts as.
    #[must_use]
    pub fn active_user(&self) -> &str {
        &self.active_user
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed {
                address: self.address.clone(),
            });
        }
        Ok(())
    }

    /// Return the file channel for `user`, opening and caching it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] after [`close`](Self::close), or
    /// [`SessionError::Channel`] if the transport refuses a new channel.
    pub fn file_channel(&self, user: &str) -> Result<Arc<C::Channel>, SessionError> {
        self.ensure_open()?;
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get(user) {
            return Ok(Arc::clone(channel));
        }

        let channel = self
            .conn
            .open_file_channel()
            .map_err(|e| SessionError::Channel {
                user: user.to_string(),
                address: self.address.clone(),
                source: e.into(),
            })?;
        tracing::debug!(host = %self.address, user, "opened file channel");
        let channel = Arc::new(channel);
        channels.insert(user.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    #[cfg(test)]
    pub(crate) const fn connection(&self) -> &C {
        &self.conn
    }

    /// Number of cached file channels.
    #[must_use]
    pub fn open_channel_count(&self) -> usize {
        self.channels
            .lock()
            .map_or(0, |channels| channels.len())
    }

    /// Close every cached file channel, then the connection.
    ///
    /// All channels are attempted even if one fails to close; the first
    /// failure is reported.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] when called a second time, or
    /// [`SessionError::Close`] if the transport reports a teardown failure.
    pub fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Closed {
                address: self.address.clone(),
            });
        }

        let channels: Vec<Arc<C::Channel>> = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, channel)| channel)
            .collect();

        let mut first_err = None;
        for channel in channels {
            if let Err(e) = channel.close() {
                tracing::warn!(host = %self.address, "failed to close file channel: {e:#}");
                first_err.get_or_insert(e);
            }
        }

        let disconnected = self.conn.disconnect();
        match first_err.map_or(disconnected, Err) {
            Ok(()) => Ok(()),
            Err(e) => Err(SessionError::Close {
                address: self.address.clone(),
                source: e.into(),
            }),
        }
    }
}

impl<C: Connection> Executor for Remote<C> {
    fn run(&self, command: &str, stdin: &[u8]) -> Result<CommandResult> {
        self.ensure_open()?;
        tracing::debug!(host = %self.address, command, "running command");
        self.conn.exec(command, stdin).map_err(|e| {
            SessionError::Exec {
                command: command.to_string(),
                address: self.address.clone(),
                source: e.into(),
            }
            .into()
        })
    }
}

/// Open a session to the host described by `host`.
///
/// # Errors
///
/// Returns a [`ConnectionError`] if the host cannot be reached, verified or
/// authenticated.
pub fn connect(host: &HostConfig) -> Result<Box<dyn Host>, ConnectionError> {
    match host.transport {
        TransportKind::Ssh => {
            let address = host.socket_address();
            let conn = ssh::SshConnection::open(
                &address,
                &host.user,
                &host.credential(),
                host.verifier().as_ref(),
                host.connect_timeout(),
            )?;
            Ok(Box::new(Remote::new(address, host.user.clone(), conn)))
        }
        #[cfg(unix)]
        TransportKind::Local => Ok(Box::new(Remote::new(
            host.address.clone(),
            host.user.clone(),
            local::LocalConnection::new(),
        ))),
        #[cfg(not(unix))]
        TransportKind::Local => Err(ConnectionError::Dial {
            address: host.address.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "local transport requires a unix controller",
            ),
        }),
    }
}
