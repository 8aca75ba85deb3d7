//! SSH connection backend built on `ssh2` (libssh2).
//!
//! Commands run on their own `session` channel; file transfer goes over SFTP.
//! libssh2 sessions are not re-entrant, so each SFTP channel serializes its
//! requests behind a mutex before they reach the wire.
//!
//! Command I/O runs with the session in non-blocking mode, which libssh2
//! applies to the whole session. A shared io lock keeps SFTP requests off the
//! session while a command is in flight.
use std::io::{self, Read, Write as _};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result};
use base64::Engine as _;
use sha2::{Digest as _, Sha256};
use ssh2::{Channel, FileStat, Session, Sftp};

use super::{Connection, FileChannel};
use crate::error::ConnectionError;
use crate::exec::{CommandResult, EXIT_MISSING};

/// How the session authenticates once the handshake is done.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Password authentication.
    Password(String),
    /// Public key authentication from a private key file.
    KeyFile {
        /// Path to the private key.
        path: PathBuf,
        /// Passphrase protecting the key, if any.
        passphrase: Option<String>,
    },
    /// Ask a running SSH agent.
    Agent,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyFile { path, .. } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .finish_non_exhaustive(),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

/// Decides whether the key presented by a server is trusted.
pub trait HostKeyVerifier: Send + Sync {
    /// Accept or reject `key` (raw wire encoding) presented by `address`.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason when the key is not trusted.
    fn verify(&self, address: &str, key: &[u8]) -> Result<(), String>;
}

/// Trusts every host key. Only suitable for lab networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, address: &str, key: &[u8]) -> Result<(), String> {
        tracing::warn!(
            host = address,
            fingerprint = %fingerprint_sha256(key),
            "host key accepted without verification"
        );
        Ok(())
    }
}

/// Trusts exactly one key, identified by its OpenSSH `SHA256:` fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedFingerprint {
    expected: String,
}

impl PinnedFingerprint {
    /// Pin `fingerprint`, with or without the `SHA256:` prefix.
    #[must_use]
    pub fn new(fingerprint: &str) -> Self {
        let trimmed = fingerprint.trim();
        let expected = if trimmed.starts_with("SHA256:") {
            trimmed.to_string()
        } else {
            format!("SHA256:{trimmed}")
        };
        Self { expected }
    }
}

impl HostKeyVerifier for PinnedFingerprint {
    fn verify(&self, _address: &str, key: &[u8]) -> Result<(), String> {
        let observed = fingerprint_sha256(key);
        if observed == self.expected {
            Ok(())
        } else {
            Err(format!("expected {}, got {observed}", self.expected))
        }
    }
}

/// OpenSSH-style fingerprint of a raw host key: `SHA256:<unpadded base64>`.
#[must_use]
pub fn fingerprint_sha256(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}

fn resolve(address: &str) -> Result<SocketAddr, ConnectionError> {
    address
        .to_socket_addrs()
        .and_then(|mut addrs| {
            addrs.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "address did not resolve")
            })
        })
        .map_err(|source| ConnectionError::Dial {
            address: address.to_string(),
            source,
        })
}

/// Pause between polls when a command produced no output and took no input.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Serializes use of one libssh2 session between command I/O and SFTP.
type IoLock = Arc<Mutex<()>>;

fn hold(lock: &IoLock) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One authenticated SSH connection.
pub struct SshConnection {
    address: String,
    session: Session,
    io: IoLock,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl SshConnection {
    /// Dial `address`, verify the host key and authenticate as `user`.
    ///
    /// No SFTP subsystem is requested here; channels are opened on demand.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] describing the stage that failed.
    pub fn open(
        address: &str,
        user: &str,
        credential: &Credential,
        verifier: &dyn HostKeyVerifier,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let dial_err = |source| ConnectionError::Dial {
            address: address.to_string(),
            source,
        };
        let handshake_err = |e: ssh2::Error| ConnectionError::Handshake {
            address: address.to_string(),
            source: e.into(),
        };

        let tcp = TcpStream::connect_timeout(&resolve(address)?, timeout).map_err(dial_err)?;
        tcp.set_read_timeout(Some(timeout)).map_err(dial_err)?;
        tcp.set_write_timeout(Some(timeout)).map_err(dial_err)?;

        let mut session = Session::new().map_err(handshake_err)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(handshake_err)?;

        let (key, _) = session
            .host_key()
            .ok_or_else(|| ConnectionError::HostKeyRejected {
                address: address.to_string(),
                reason: "server presented no host key".to_string(),
            })?;
        verifier
            .verify(address, key)
            .map_err(|reason| ConnectionError::HostKeyRejected {
                address: address.to_string(),
                reason,
            })?;

        let auth = match credential {
            Credential::Password(password) => session.userauth_password(user, password),
            Credential::KeyFile { path, passphrase } => {
                session.userauth_pubkey_file(user, None, path, passphrase.as_deref())
            }
            Credential::Agent => session.userauth_agent(user),
        };
        let auth_err = |reason: String| ConnectionError::Auth {
            user: user.to_string(),
            address: address.to_string(),
            reason,
        };
        auth.map_err(|e| auth_err(e.message().to_string()))?;
        if !session.authenticated() {
            return Err(auth_err("server did not accept credentials".to_string()));
        }

        // Commands may legitimately run for minutes (apt); only the dial and
        // handshake are bounded.
        session.set_timeout(0);
        tracing::debug!(host = address, user, "ssh session established");

        Ok(Self {
            address: address.to_string(),
            session,
            io: IoLock::default(),
        })
    }
}

impl Connection for SshConnection {
    type Channel = SftpChannel;

    fn exec(&self, command: &str, stdin: &[u8]) -> Result<CommandResult> {
        let _io = hold(&self.io);
        let mut channel = self
            .session
            .channel_session()
            .context("unable to create new session")?;
        channel.exec(command).context("run of command failed")?;

        let (stdout, stderr) = {
            let _nonblocking = NonBlocking::enter(&self.session);
            pump(&mut channel, stdin).context("exchanging command i/o")?
        };
        channel.wait_close().context("waiting for command to exit")?;

        let signal = channel.exit_signal().ok().and_then(|s| s.exit_signal);
        // libssh2 reports 0 when the server closed the channel without an
        // exit-status message; that case cannot be told apart from success.
        let status = channel.exit_status().context("reading exit status")?;

        Ok(CommandResult {
            stdout,
            stderr,
            exit_status: exit_code(signal.as_deref(), status),
        })
    }

    fn open_file_channel(&self) -> Result<SftpChannel> {
        let sftp = {
            let _io = hold(&self.io);
            self.session
                .sftp()
                .with_context(|| format!("could not start sftp on {}", self.address))?
        };
        Ok(SftpChannel {
            sftp: Mutex::new(Some(sftp)),
            io: Arc::clone(&self.io),
        })
    }

    fn disconnect(&self) -> Result<()> {
        let _io = hold(&self.io);
        self.session
            .disconnect(None, "closing", None)
            .with_context(|| format!("disconnecting from {}", self.address))
    }
}

/// Restores blocking mode when a command's I/O loop ends, on every path.
struct NonBlocking<'a>(&'a Session);

impl<'a> NonBlocking<'a> {
    fn enter(session: &'a Session) -> Self {
        session.set_blocking(false);
        Self(session)
    }
}

impl Drop for NonBlocking<'_> {
    fn drop(&mut self) {
        self.0.set_blocking(true);
    }
}

/// Feed `stdin` to a running command while collecting its stdout and stderr.
///
/// The three streams are serviced in turn so that neither side stalls on a
/// full window. Returns once the server signals end of output; input the
/// command never read is dropped.
fn pump(channel: &mut Channel, stdin: &[u8]) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut pending = stdin;
    let mut eof_sent = false;

    loop {
        let mut progressed = drain(channel, &mut stdout)?;
        progressed |= drain(&mut channel.stderr(), &mut stderr)?;
        if channel.eof() {
            drain(channel, &mut stdout)?;
            drain(&mut channel.stderr(), &mut stderr)?;
            return Ok((stdout, stderr));
        }

        if !pending.is_empty() {
            match channel.write(pending) {
                Ok(n) => {
                    progressed |= n > 0;
                    pending = pending.get(n..).unwrap_or_default();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                // The command exited without reading the rest of its input.
                Err(_) if channel.eof() => pending = &[],
                Err(e) => return Err(e),
            }
        }
        if pending.is_empty() && !eof_sent {
            match channel.send_eof().map_err(io::Error::from) {
                Ok(()) => {
                    eof_sent = true;
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) if channel.eof() => eof_sent = true,
                Err(e) => return Err(e),
            }
        }

        if !progressed {
            thread::sleep(IDLE_POLL);
        }
    }
}

/// Read everything currently available on `stream`. Returns whether any
/// bytes arrived.
fn drain(stream: &mut impl Read, into: &mut Vec<u8>) -> io::Result<bool> {
    let mut buf = [0u8; 32 * 1024];
    let mut any = false;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(any),
            Ok(n) => {
                into.extend_from_slice(buf.get(..n).unwrap_or_default());
                any = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(any),
            Err(e) => return Err(e),
        }
    }
}

/// Exit code to report for a finished channel. A command terminated by a
/// signal has no exit code of its own.
const fn exit_code(signal: Option<&str>, status: i32) -> i32 {
    if signal.is_some() {
        EXIT_MISSING
    } else {
        status
    }
}

/// An SFTP subsystem channel. Requests are serialized per channel.
pub struct SftpChannel {
    sftp: Mutex<Option<Sftp>>,
    io: IoLock,
}

impl std::fmt::Debug for SftpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpChannel").finish_non_exhaustive()
    }
}

impl SftpChannel {
    fn with_sftp<T>(&self, op: impl FnOnce(&Sftp) -> Result<T>) -> Result<T> {
        let guard = self.sftp.lock().unwrap_or_else(PoisonError::into_inner);
        let sftp = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("sftp channel is closed"))?;
        let _io = hold(&self.io);
        op(sftp)
    }

    fn setstat(&self, remote: &Path, stat: FileStat) -> Result<()> {
        self.with_sftp(|sftp| {
            sftp.setstat(remote, stat)
                .with_context(|| format!("setstat {}", remote.display()))
        })
    }
}

impl FileChannel for SftpChannel {
    fn upload(&self, source: &mut dyn Read, remote: &Path) -> Result<u64> {
        self.with_sftp(|sftp| {
            let mut file = sftp
                .create(remote)
                .with_context(|| format!("unable to create file {}", remote.display()))?;
            let written = io::copy(source, &mut file)
                .with_context(|| format!("unable to copy to file {}", remote.display()))?;
            file.flush()?;
            Ok(written)
        })
    }

    fn chmod(&self, remote: &Path, mode: u32) -> Result<()> {
        self.setstat(
            remote,
            FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode & 0o7777),
                atime: None,
                mtime: None,
            },
        )
    }

    fn chown(&self, remote: &Path, uid: u32, gid: u32) -> Result<()> {
        self.setstat(
            remote,
            FileStat {
                size: None,
                uid: Some(uid),
                gid: Some(gid),
                perm: None,
                atime: None,
                mtime: None,
            },
        )
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.sftp.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut sftp) = guard.take() {
            let _io = hold(&self.io);
            sftp.shutdown().context("closing sftp channel")?;
        }
        Ok(())
    }
}
