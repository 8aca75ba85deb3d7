//! Concurrent file distribution with ownership and permission enforcement.
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use crate::error::TransferError;
use crate::exec::{Executor, run_quiet};
use crate::transport::FileChannel;

/// One file to push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    /// Source path on the controller.
    pub local_path: PathBuf,
    /// Destination path on the host.
    pub remote_path: PathBuf,
    /// Owner name, resolved on the host with `id -u`.
    pub owner: String,
    /// Group name, resolved on the host with `id -g`.
    pub group: String,
    /// Permission bits.
    pub mode: u32,
}

/// Pushes batches of files through one file channel.
pub struct Distributor<'a> {
    executor: &'a dyn Executor,
    channel: &'a dyn FileChannel,
    host: &'a str,
}

impl std::fmt::Debug for Distributor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl<'a> Distributor<'a> {
    /// Create a distributor. `executor` runs the id lookups, `channel`
    /// carries the file data.
    #[must_use]
    pub const fn new(
        executor: &'a dyn Executor,
        channel: &'a dyn FileChannel,
        host: &'a str,
    ) -> Self {
        Self {
            executor,
            channel,
            host,
        }
    }

    /// Push every file concurrently, one task per file.
    ///
    /// Tasks run on the current rayon pool: the global pool, or whichever
    /// pool the caller entered with [`rayon::ThreadPool::install`]. All
    /// tasks run to completion even when some fail. Files that succeeded
    /// stay in place.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Cancelled`] without touching the host if
    /// `cancel` is already set. Otherwise returns the error of the first
    /// failed file in declaration order.
    pub fn push(&self, files: &[FileSpec], cancel: &AtomicBool) -> Result<(), TransferError> {
        if cancel.load(Ordering::SeqCst) {
            return Err(TransferError::Cancelled {
                host: self.host.to_string(),
            });
        }
        if files.is_empty() {
            return Ok(());
        }

        let results = self.push_all(files);

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(host = self.host, "{failed} of {} files failed to push", files.len());
        }
        results.into_iter().collect()
    }

    fn push_all(&self, files: &[FileSpec]) -> Vec<Result<(), TransferError>> {
        files
            .par_iter()
            .map(|file| {
                let result = self.push_one(file);
                match &result {
                    Ok(()) => tracing::debug!(
                        host = self.host,
                        path = %file.remote_path.display(),
                        "pushed"
                    ),
                    Err(e) => tracing::error!(
                        host = self.host,
                        path = %file.remote_path.display(),
                        "{e}"
                    ),
                }
                result
            })
            .collect()
    }

    fn push_one(&self, file: &FileSpec) -> Result<(), TransferError> {
        let local_err = |source| TransferError::LocalOpen {
            path: file.local_path.display().to_string(),
            source,
        };
        let remote = file.remote_path.display().to_string();

        let source = fs::File::open(&file.local_path).map_err(local_err)?;
        let expected = source.metadata().map_err(local_err)?.len();

        let written = self
            .channel
            .upload(&mut BufReader::new(source), &file.remote_path)
            .map_err(|e| TransferError::Upload {
                path: remote.clone(),
                source: e.into(),
            })?;
        if written != expected {
            return Err(TransferError::ShortWrite {
                path: remote,
                written,
                expected,
            });
        }

        self.channel
            .chmod(&file.remote_path, file.mode)
            .map_err(|e| TransferError::Chmod {
                path: remote.clone(),
                mode: file.mode,
                source: e.into(),
            })?;

        let uid = self.resolve_id("owner", "-u", &file.owner)?;
        let gid = self.resolve_id("group", "-g", &file.group)?;
        self.channel
            .chown(&file.remote_path, uid, gid)
            .map_err(|e| TransferError::Chown {
                path: remote,
                uid,
                gid,
                source: e.into(),
            })
    }

    /// Resolve a user or group name to its numeric id on the host.
    fn resolve_id(&self, kind: &'static str, flag: &str, name: &str) -> Result<u32, TransferError> {
        let fail = |reason: String| TransferError::ResolveId {
            kind,
            name: name.to_string(),
            reason,
        };
        let result =
            run_quiet(self.executor, &format!("id {flag} {name}")).map_err(|e| fail(format!("{e:#}")))?;
        if !result.success() {
            return Err(fail(result.stderr_lossy()));
        }
        let stdout = result.stdout_lossy();
        stdout
            .trim()
            .parse()
            .map_err(|e| fail(format!("unexpected output {:?}: {e}", stdout.trim())))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::exec::{CommandResult, MockExecutor};
    use crate::transport::test_helpers::MemoryChannel;
    use std::path::Path;

    const HOST: &str = "web:22";

    fn ids() -> MockExecutor {
        let mut mock = MockExecutor::new();
        mock.expect_run().returning(|cmd, _| {
            Ok(match cmd {
                "id -u www-data" | "id -g www-data" => CommandResult::new("33\n", "", 0),
                "id -u root" | "id -g root" => CommandResult::new("0\n", "", 0),
                _ => CommandResult::new("", "id: no such user", 1),
            })
        });
        mock
    }

    fn spec(local: &Path, remote: &str, owner: &str, mode: u32) -> FileSpec {
        FileSpec {
            local_path: local.to_path_buf(),
            remote_path: PathBuf::from(remote),
            owner: owner.to_string(),
            group: owner.to_string(),
            mode,
        }
    }

    #[test]
    fn push_applies_contents_mode_and_owner() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("index.php");
        fs::write(&local, "<?php phpinfo();").unwrap();
        let channel = MemoryChannel::default();
        let executor = ids();

        Distributor::new(&executor, &channel, HOST)
            .push(
                &[spec(&local, "/var/www/html/index.php", "www-data", 0o644)],
                &AtomicBool::new(false),
            )
            .unwrap();

        let stored = channel.file("/var/www/html/index.php").unwrap();
        assert_eq!(stored.contents, b"<?php phpinfo();");
        assert_eq!(stored.mode, Some(0o644));
        assert_eq!(stored.owner, Some((33, 33)));
    }

    #[test]
    fn missing_source_does_not_stop_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.conf");
        let third = dir.path().join("c.conf");
        fs::write(&first, "a").unwrap();
        fs::write(&third, "c").unwrap();
        let channel = MemoryChannel::default();
        let executor = ids();

        let err = Distributor::new(&executor, &channel, HOST)
            .push(
                &[
                    spec(&first, "/etc/a.conf", "root", 0o600),
                    spec(&dir.path().join("missing.conf"), "/etc/b.conf", "root", 0o600),
                    spec(&third, "/etc/c.conf", "root", 0o600),
                ],
                &AtomicBool::new(false),
            )
            .unwrap_err();

        assert!(matches!(err, TransferError::LocalOpen { .. }), "got {err}");
        assert!(err.to_string().contains("missing.conf"));
        assert_eq!(channel.file("/etc/a.conf").unwrap().contents, b"a");
        assert_eq!(channel.file("/etc/c.conf").unwrap().contents, b"c");
        assert!(channel.file("/etc/b.conf").is_none());
    }

    #[test]
    fn first_error_in_declaration_order_wins() {
        let dir = tempfile::tempdir().unwrap();
        let ok = dir.path().join("ok");
        fs::write(&ok, "x").unwrap();
        let channel = MemoryChannel::default();
        let executor = ids();

        let err = Distributor::new(&executor, &channel, HOST)
            .push(
                &[
                    spec(&ok, "/tmp/ok", "nobody-here", 0o644),
                    spec(&dir.path().join("gone"), "/tmp/gone", "root", 0o644),
                ],
                &AtomicBool::new(false),
            )
            .unwrap_err();
        assert!(
            matches!(err, TransferError::ResolveId { kind: "owner", ref name, .. } if name == "nobody-here"),
            "got {err}"
        );
    }

    #[test]
    fn short_write_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big");
        fs::write(&local, "0123456789").unwrap();
        let channel = MemoryChannel {
            truncate_to: Some(4),
            ..MemoryChannel::default()
        };
        let executor = ids();

        let err = Distributor::new(&executor, &channel, HOST)
            .push(&[spec(&local, "/srv/big", "root", 0o644)], &AtomicBool::new(false))
            .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"wrote 4 of 10 bytes to /srv/big");
    }

    #[test]
    fn unparsable_id_output_is_a_resolve_error() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("f");
        fs::write(&local, "f").unwrap();
        let channel = MemoryChannel::default();
        let mut executor = MockExecutor::new();
        executor
            .expect_run()
            .returning(|_, _| Ok(CommandResult::new("uid=0(root)\n", "", 0)));

        let err = Distributor::new(&executor, &channel, HOST)
            .push(&[spec(&local, "/f", "root", 0o644)], &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, TransferError::ResolveId { kind: "owner", .. }), "got {err}");
        // Contents and mode are applied before ownership.
        assert_eq!(channel.file("/f").unwrap().mode, Some(0o644));
    }

    #[test]
    fn push_runs_on_the_callers_pool() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<FileSpec> = (0..16)
            .map(|i| {
                let local = dir.path().join(format!("f{i}"));
                fs::write(&local, "x").unwrap();
                spec(&local, &format!("/srv/f{i}"), "root", 0o644)
            })
            .collect();
        let channel = MemoryChannel::default();
        let executor = ids();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();

        pool.install(|| {
            Distributor::new(&executor, &channel, HOST).push(&files, &AtomicBool::new(false))
        })
        .unwrap();

        let sizes = channel.pool_sizes.lock().unwrap();
        assert_eq!(sizes.len(), files.len());
        assert!(sizes.iter().all(|&n| n == 2), "uploads ran on pools of {sizes:?}");
    }

    #[test]
    fn cancelled_push_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("f");
        fs::write(&local, "f").unwrap();
        let channel = MemoryChannel::default();
        let executor = MockExecutor::new();

        let err = Distributor::new(&executor, &channel, HOST)
            .push(&[spec(&local, "/f", "root", 0o644)], &AtomicBool::new(true))
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled { .. }));
        assert!(channel.file("/f").is_none());
    }

    #[test]
    fn empty_batch_is_ok() {
        let channel = MemoryChannel::default();
        let executor = MockExecutor::new();
        Distributor::new(&executor, &channel, HOST)
            .push(&[], &AtomicBool::new(false))
            .unwrap();
    }
}
