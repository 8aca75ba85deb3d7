// Shared helpers for integration tests.
//
// Sessions here run against the local shell and filesystem, so the whole
// session stack is exercised without an SSH server.
//
// Used by all integration test binaries that declare `mod common;`.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use converge_cli::distribute::FileSpec;
use converge_cli::transport::Remote;
use converge_cli::transport::local::LocalConnection;

/// Output of `id <flag>` for the user running the tests.
#[allow(clippy::expect_used)]
pub fn current_id(flag: &str) -> String {
    let output = Command::new("id").arg(flag).output().expect("run id");
    String::from_utf8(output.stdout)
        .expect("id output is utf-8")
        .trim()
        .to_string()
}

/// A session to the local host acting as the current user.
pub fn local_session() -> Remote<LocalConnection> {
    Remote::new("localhost", current_id("-un"), LocalConnection::new())
}

/// A file owned by the current user and group.
pub fn owned_file(local: &Path, remote: &Path, mode: u32) -> FileSpec {
    FileSpec {
        local_path: local.to_path_buf(),
        remote_path: remote.to_path_buf(),
        owner: current_id("-un"),
        group: current_id("-gn"),
        mode,
    }
}

/// Source and destination directories for a push.
pub struct PushFixture {
    pub source: tempfile::TempDir,
    pub dest: tempfile::TempDir,
}

#[allow(clippy::expect_used)]
impl PushFixture {
    pub fn new() -> Self {
        Self {
            source: tempfile::tempdir().expect("source dir"),
            dest: tempfile::tempdir().expect("dest dir"),
        }
    }

    /// Write a source file and return its path.
    pub fn source_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.source.path().join(name);
        std::fs::write(&path, contents).expect("write source file");
        path
    }

    pub fn dest_path(&self, name: &str) -> PathBuf {
        self.dest.path().join(name)
    }
}
