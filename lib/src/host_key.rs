//! Trust decisions for remote host identities.

use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use russh::keys::HashAlg;
use russh::keys::PublicKey;
use strum::Display;
use strum::EnumString;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// How an unknown or changed host key is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum HostKeyPolicy {
    /// Accept any host key. Nothing is read from or written to known_hosts.
    #[default]
    #[strum(to_string = "accept-all", serialize = "no", serialize = "off")]
    AcceptAll,

    /// Trust on first use: unknown hosts are accepted and recorded, changed
    /// keys are rejected.
    #[strum(to_string = "accept-new", serialize = "tofu")]
    AcceptNew,

    /// Only keys already present in known_hosts are accepted.
    #[strum(to_string = "strict", serialize = "yes")]
    Strict,
}

/// `~/.ssh/known_hosts`, if a home directory is known.
#[must_use]
pub fn default_known_hosts_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

/// Checks a server key for one `host:port` against a [`HostKeyPolicy`].
#[derive(Debug, Clone)]
pub struct HostKeyVerifier {
    policy: HostKeyPolicy,
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

impl HostKeyVerifier {
    /// Falls back to [`default_known_hosts_path`] when `known_hosts` is unset.
    #[must_use]
    pub fn new(
        policy: HostKeyPolicy,
        host: impl Into<String>,
        port: u16,
        known_hosts: Option<PathBuf>,
    ) -> Self {
        Self {
            policy,
            host: host.into(),
            port,
            known_hosts: known_hosts.or_else(default_known_hosts_path),
        }
    }

    #[must_use]
    pub fn policy(&self) -> HostKeyPolicy {
        self.policy
    }

    /// # Errors
    ///
    /// If the key is not trusted under the policy, or known_hosts cannot be
    /// read or updated.
    pub fn verify(&self, key: &PublicKey) -> Result<()> {
        let fingerprint = key.fingerprint(HashAlg::Sha256);
        match self.policy {
            HostKeyPolicy::AcceptAll => {
                warn!(host = %self.host, %fingerprint, "accepting host key without verification");
                Ok(())
            }
            HostKeyPolicy::Strict => {
                let path = self.known_hosts_path()?;
                if self.is_known(key, path)? {
                    debug!(host = %self.host, %fingerprint, "host key found in known_hosts");
                    return Ok(());
                }
                bail!(
                    "host key {fingerprint} for {}:{} not found in {}",
                    self.host,
                    self.port,
                    path.display()
                );
            }
            HostKeyPolicy::AcceptNew => {
                let path = self.known_hosts_path()?;
                if self.is_known(key, path)? {
                    debug!(host = %self.host, %fingerprint, "host key found in known_hosts");
                    return Ok(());
                }
                russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, key, path)
                    .with_context(|| format!("unable to record host key in {}", path.display()))?;
                info!(host = %self.host, %fingerprint, path = %path.display(), "learned new host key");
                Ok(())
            }
        }
    }

    fn known_hosts_path(&self) -> Result<&Path> {
        self.known_hosts
            .as_deref()
            .context("unable to determine known_hosts path")
    }

    /// `Ok(false)` for an unknown host, an error for a changed key.
    fn is_known(&self, key: &PublicKey, path: &Path) -> Result<bool> {
        russh::keys::check_known_hosts_path(&self.host, self.port, key, path).with_context(|| {
            format!(
                "host key for {}:{} does not match {}",
                self.host,
                self.port,
                path.display()
            )
        })
    }
}
