//! Connection parameters for one host.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::ssh::{AcceptAnyHostKey, Credential, HostKeyVerifier, PinnedFingerprint};

/// Default SSH port.
const DEFAULT_PORT: u16 = 22;

/// Default connect timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Which connection backend reaches the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// SSH with SFTP for files.
    #[default]
    Ssh,
    /// Shell and filesystem of the controller itself.
    Local,
}

/// The `[host]` table of a host file.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Hostname or IP address. Hosts with an empty address are skipped.
    #[serde(default)]
    pub address: String,
    /// SSH port, 22 unless set.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user; also the acting user for file pushes.
    #[serde(default)]
    pub user: String,
    /// Password for password authentication; takes precedence over a key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Private key file; `~/` is expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,
    /// Passphrase for `private_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Connection backend.
    #[serde(default)]
    pub transport: TransportKind,
    /// Pinned `SHA256:` host key fingerprint. Any key is accepted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
    /// Bound on dialing and the SSH handshake.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

const fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .field("transport", &self.transport)
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .finish_non_exhaustive()
    }
}

impl HostConfig {
    /// `address:port`, with IPv6 literals bracketed.
    #[must_use]
    pub fn socket_address(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Credential to authenticate with: password, then key file, then agent.
    #[must_use]
    pub fn credential(&self) -> Credential {
        if let Some(password) = &self.password {
            return Credential::Password(password.clone());
        }
        if let Some(key) = &self.private_key {
            return Credential::KeyFile {
                path: expand_tilde(key),
                passphrase: self.passphrase.clone(),
            };
        }
        Credential::Agent
    }

    /// Host key policy for this host.
    #[must_use]
    pub fn verifier(&self) -> Box<dyn HostKeyVerifier> {
        match &self.host_key_fingerprint {
            Some(fingerprint) => Box::new(PinnedFingerprint::new(fingerprint)),
            None => Box::new(AcceptAnyHostKey),
        }
    }

    /// [`connect_timeout_secs`](Self::connect_timeout_secs) as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// A copy with secrets replaced, for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mask = |s: &Option<String>| s.as_ref().map(|_| "<redacted>".to_string());
        Self {
            password: mask(&self.password),
            passphrase: mask(&self.passphrase),
            ..self.clone()
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn host(address: &str) -> HostConfig {
        HostConfig {
            address: address.to_string(),
            port: 2222,
            user: "root".to_string(),
            ..HostConfig::default()
        }
    }

    #[test]
    fn defaults_from_empty_table() {
        let parsed: HostConfig = toml::from_str("address = \"10.0.0.5\"").unwrap();
        assert_eq!(parsed.port, 22);
        assert_eq!(parsed.transport, TransportKind::Ssh);
        assert_eq!(parsed.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn transport_is_lowercase() {
        let parsed: HostConfig = toml::from_str("transport = \"local\"").unwrap();
        assert_eq!(parsed.transport, TransportKind::Local);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<HostConfig>("adress = \"typo\"").is_err());
    }

    #[test]
    fn socket_address_formats() {
        assert_eq!(host("10.0.0.5").socket_address(), "10.0.0.5:2222");
        assert_eq!(host("::1").socket_address(), "[::1]:2222");
    }

    #[test]
    fn credential_precedence() {
        let mut h = host("web");
        assert!(matches!(h.credential(), Credential::Agent));

        h.private_key = Some(PathBuf::from("/keys/id_ed25519"));
        assert!(matches!(
            h.credential(),
            Credential::KeyFile { ref path, passphrase: None } if path == Path::new("/keys/id_ed25519")
        ));

        h.password = Some("hunter2".to_string());
        assert!(matches!(h.credential(), Credential::Password(ref p) if p == "hunter2"));
    }

    #[test]
    fn tilde_is_expanded_in_key_path() {
        let Some(home) = std::env::var_os("HOME") else {
            return;
        };
        let expanded = expand_tilde(Path::new("~/.ssh/id_ed25519"));
        assert_eq!(expanded, PathBuf::from(home).join(".ssh/id_ed25519"));
    }

    #[test]
    fn debug_and_redacted_hide_password() {
        let mut h = host("web");
        h.password = Some("hunter2".to_string());
        assert!(!format!("{h:?}").contains("hunter2"));
        assert_eq!(h.redacted().password.as_deref(), Some("<redacted>"));
        assert_eq!(h.redacted().address, "web");
    }

    #[test]
    fn pinned_fingerprint_verifier_rejects_other_keys() {
        let mut h = host("web");
        h.host_key_fingerprint = Some("SHA256:AAAA".to_string());
        assert!(h.verifier().verify("web:22", b"some key").is_err());
    }
}
