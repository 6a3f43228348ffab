//! Resolution of run parameters from the calling environment.
//!
//! Every input is optional at the [`ConfigInputs`] level so that a missing
//! value can be reported by name instead of failing somewhere deeper.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bon::Builder;

use crate::auth::Passphrase;
use crate::error::RunError;
use crate::error::Stage;
use crate::error::StageContext;
use crate::host_key::HostKeyPolicy;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Environment variable names read by [`ConfigInputs::from_env`].
pub mod env {
    pub const SCRIPT_PATH: &str = "SCRIPT_PATH";
    pub const SSH_HOST: &str = "SSH_HOST";
    pub const SSH_USER: &str = "SSH_USER";
    pub const SSH_KEY_PATH: &str = "SSH_KEY_PATH";
    pub const SSH_PORT: &str = "SSH_PORT";
    pub const SSH_CONNECT_TIMEOUT: &str = "SSH_CONNECT_TIMEOUT";
    pub const SSH_HOST_KEY_POLICY: &str = "SSH_HOST_KEY_POLICY";
    pub const SSH_KNOWN_HOSTS: &str = "SSH_KNOWN_HOSTS";
    pub const SSH_KEY_PASSPHRASE: &str = "SSH_KEY_PASSPHRASE";
}

// Inputs ---------------------------------------------------------------------

/// Raw, unvalidated run parameters.
#[derive(Default, Clone)]
pub struct ConfigInputs {
    pub script_path: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub key_path: Option<String>,
    pub port: Option<String>,
    pub connect_timeout: Option<String>,
    pub host_key_policy: Option<String>,
    pub known_hosts: Option<String>,
    pub key_passphrase: Option<String>,
}

impl fmt::Debug for ConfigInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigInputs")
            .field("script_path", &self.script_path)
            .field("host", &self.host)
            .field("user", &self.user)
            .field("key_path", &self.key_path)
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .field("host_key_policy", &self.host_key_policy)
            .field("known_hosts", &self.known_hosts)
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ConfigInputs {
    /// Reads all inputs from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads all inputs through `lookup`, keyed by the names in [`env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            script_path: lookup(env::SCRIPT_PATH),
            host: lookup(env::SSH_HOST),
            user: lookup(env::SSH_USER),
            key_path: lookup(env::SSH_KEY_PATH),
            port: lookup(env::SSH_PORT),
            connect_timeout: lookup(env::SSH_CONNECT_TIMEOUT),
            host_key_policy: lookup(env::SSH_HOST_KEY_POLICY),
            known_hosts: lookup(env::SSH_KNOWN_HOSTS),
            key_passphrase: lookup(env::SSH_KEY_PASSPHRASE),
        }
    }

    /// Validates the inputs and reads the script payload.
    ///
    /// # Errors
    ///
    /// [`RunError::Configuration`] naming the first missing or invalid item.
    pub fn resolve(self) -> Result<(Config, Script), RunError> {
        self.resolve_inner().stage(Stage::Configuration)
    }

    fn resolve_inner(self) -> Result<(Config, Script)> {
        let script_path = required(self.script_path, env::SCRIPT_PATH)?;
        let script = Script::read(script_path)?;

        let host = required(self.host, env::SSH_HOST)?;
        let user = required(self.user, env::SSH_USER)?;
        let key_path = required(self.key_path, env::SSH_KEY_PATH)?;

        let config = Config::builder()
            .host(host)
            .user(user)
            .key_path(key_path)
            .port(parse_port(self.port)?)
            .connect_timeout(parse_timeout(self.connect_timeout)?)
            .host_key_policy(parse_policy(self.host_key_policy)?)
            .maybe_known_hosts(optional(self.known_hosts).map(PathBuf::from))
            .maybe_key_passphrase(optional(self.key_passphrase).map(Passphrase::from))
            .build();

        Ok((config, script))
    }
}

// Resolved -------------------------------------------------------------------

/// Fully populated connection parameters.
#[derive(Debug, Clone, Builder)]
pub struct Config {
    #[builder(into)]
    pub host: String,
    #[builder(default = DEFAULT_PORT)]
    pub port: u16,
    #[builder(into)]
    pub user: String,
    #[builder(into)]
    pub key_path: PathBuf,
    pub key_passphrase: Option<Passphrase>,
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,
    #[builder(default)]
    pub host_key_policy: HostKeyPolicy,
    /// Overrides `~/.ssh/known_hosts`.
    pub known_hosts: Option<PathBuf>,
}

/// Local script payload, read verbatim.
#[derive(Clone, PartialEq, Eq)]
pub struct Script {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("path", &self.path)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Script {
    /// # Errors
    ///
    /// If `path` is not an existing regular file or cannot be read.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("script not found at {}", path.display());
        }
        let bytes = std::fs::read(path)
            .with_context(|| format!("unable to read script at {}", path.display()))?;
        Ok(Self {
            path: path.to_owned(),
            bytes,
        })
    }
}

// Parsing --------------------------------------------------------------------

fn optional(value: Option<String>) -> Option<String> {
    value.filter(|x| !x.trim().is_empty())
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    optional(value).with_context(|| format!("{name} not set"))
}

fn parse_port(value: Option<String>) -> Result<u16> {
    let Some(value) = optional(value) else {
        return Ok(DEFAULT_PORT);
    };
    let port = u16::from_str(value.trim())
        .with_context(|| format!("invalid {}: {value:?}", env::SSH_PORT))?;
    if port == 0 {
        bail!("invalid {}: port must be non-zero", env::SSH_PORT);
    }
    Ok(port)
}

/// Accepts humantime durations (`20s`, `1m 30s`) or bare seconds.
fn parse_timeout(value: Option<String>) -> Result<Duration> {
    let Some(value) = optional(value) else {
        return Ok(DEFAULT_CONNECT_TIMEOUT);
    };
    let value = value.trim();
    let timeout = match u64::from_str(value) {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => humantime::parse_duration(value)
            .with_context(|| format!("invalid {}: {value:?}", env::SSH_CONNECT_TIMEOUT))?,
    };
    if timeout.is_zero() {
        bail!("invalid {}: timeout must be non-zero", env::SSH_CONNECT_TIMEOUT);
    }
    Ok(timeout)
}

fn parse_policy(value: Option<String>) -> Result<HostKeyPolicy> {
    let Some(value) = optional(value) else {
        return Ok(HostKeyPolicy::default());
    };
    HostKeyPolicy::from_str(value.trim())
        .with_context(|| format!("invalid {}: {value:?}", env::SSH_HOST_KEY_POLICY))
}

// Tests ----------------------------------------------------------------------
