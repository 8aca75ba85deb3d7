//! Local connection backend: runs commands through `sh -c` on this machine.
//!
//! Useful for converging the controller itself and for exercising the full
//! session stack without an SSH server.
use std::fs;
use std::io::{self, Read, Write as _};
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::process::{ChildStdin, Command, Stdio};
use std::thread;

use anyhow::{Context as _, Result};

use super::{Connection, FileChannel};
use crate::exec::{CommandResult, EXIT_MISSING};

/// Executes commands on the local host.
#[derive(Debug, Clone)]
pub struct LocalConnection {
    shell: String,
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalConnection {
    /// Create a connection that runs commands with `/bin/sh`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl Connection for LocalConnection {
    type Channel = LocalChannel;

    fn exec(&self, command: &str, stdin: &[u8]) -> Result<CommandResult> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to execute: {command}"))?;

        // Stdin is written on its own thread while the output pipes drain.
        let pipe = child.stdin.take();
        let output = thread::scope(|scope| {
            let writer =
                scope.spawn(move || pipe.map_or(Ok(()), |mut pipe| feed(&mut pipe, stdin)));
            let output = child
                .wait_with_output()
                .with_context(|| format!("waiting for: {command}"))?;
            writer
                .join()
                .map_err(|_| io::Error::other("stdin writer panicked"))?
                .context("writing stdin")?;
            Ok::<_, anyhow::Error>(output)
        })?;
        Ok(CommandResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_status: output.status.code().unwrap_or(EXIT_MISSING),
        })
    }

    fn open_file_channel(&self) -> Result<LocalChannel> {
        Ok(LocalChannel)
    }

    fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Write all of `stdin` to the child. A command that never reads its input
/// closes the pipe early, which is not an error.
fn feed(pipe: &mut ChildStdin, stdin: &[u8]) -> io::Result<()> {
    match pipe.write_all(stdin) {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

/// File operations against the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalChannel;

impl FileChannel for LocalChannel {
    fn upload(&self, source: &mut dyn Read, remote: &Path) -> Result<u64> {
        let mut file = fs::File::create(remote)
            .with_context(|| format!("unable to create file {}", remote.display()))?;
        let written = io::copy(source, &mut file)
            .with_context(|| format!("unable to copy to file {}", remote.display()))?;
        file.flush()?;
        Ok(written)
    }

    fn chmod(&self, remote: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(remote, fs::Permissions::from_mode(mode & 0o7777))
            .with_context(|| format!("set permissions: {}", remote.display()))
    }

    fn chown(&self, remote: &Path, uid: u32, gid: u32) -> Result<()> {
        std::os::unix::fs::chown(remote, Some(uid), Some(gid))
            .with_context(|| format!("set ownership: {}", remote.display()))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn exec_echo() {
        let result = LocalConnection::new().exec("echo hello", &[]).unwrap();
        assert!(result.success(), "echo command should succeed");
        assert_eq!(result.stdout_lossy().trim(), "hello");
    }

    #[test]
    fn exec_reports_exit_code() {
        let result = LocalConnection::new().exec("exit 3", &[]).unwrap();
        assert_eq!(result.exit_status, 3);
        assert!(!result.success());
    }

    #[test]
    fn exec_captures_stderr() {
        let result = LocalConnection::new()
            .exec("echo oops >&2; false", &[])
            .unwrap();
        assert_eq!(result.stderr_lossy(), "oops");
        assert_eq!(result.exit_status, 1);
    }

    #[test]
    fn exec_feeds_stdin() {
        let result = LocalConnection::new().exec("cat", b"piped").unwrap();
        assert_eq!(result.stdout, b"piped");
    }

    #[test]
    fn exec_ignores_unread_stdin() {
        let big = vec![b'x'; 1 << 20];
        let result = LocalConnection::new().exec("true", &big).unwrap();
        assert!(result.success());
    }

    #[test]
    fn exec_echoes_large_stdin() {
        let big = vec![b'x'; 1 << 20];
        let result = LocalConnection::new().exec("cat", &big).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.len(), big.len());
    }

    #[test]
    fn exec_signal_maps_to_missing_status() {
        let result = LocalConnection::new().exec("kill -9 $$", &[]).unwrap();
        assert_eq!(result.exit_status, EXIT_MISSING);
    }

    #[test]
    fn channel_upload_chmod_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("motd");
        let written = LocalChannel
            .upload(&mut &b"welcome"[..], &target)
            .unwrap();
        assert_eq!(written, 7);
        LocalChannel.chmod(&target, 0o640).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"welcome");
        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn channel_upload_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("motd");
        fs::write(&target, "a much longer previous body").unwrap();
        LocalChannel.upload(&mut &b"short"[..], &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"short");
    }
}
