use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use russh::client::Handle;
use russh::client::Msg;
use russh::Channel;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::auth::Credential;
use crate::config::Config;
use crate::error::RunError;
use crate::error::Stage;
use crate::error::StageContext;
use crate::host_key::HostKeyVerifier;

/// Interval between keepalives once the session is up. Remote scripts may be
/// silent for a long time, so idle sessions are kept rather than timed out.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_MAX: usize = 4;

// Transport ------------------------------------------------------------------

/// Opens authenticated SSH sessions.
#[derive(Debug, Clone)]
pub struct Transport {
    connect_timeout: Duration,
    verifier: HostKeyVerifier,
}

impl Transport {
    #[must_use]
    pub fn new(connect_timeout: Duration, verifier: HostKeyVerifier) -> Self {
        Self {
            connect_timeout,
            verifier,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let verifier = HostKeyVerifier::new(
            config.host_key_policy,
            &config.host,
            config.port,
            config.known_hosts.clone(),
        );
        Self::new(config.connect_timeout, verifier)
    }

    /// Resolves, connects, negotiates and authenticates, all bounded by the
    /// connect timeout.
    ///
    /// # Errors
    ///
    /// [`RunError::Connection`] on timeout, refusal, host key rejection or
    /// authentication rejection.
    #[instrument(skip_all, fields(host = %config.host, port = config.port, user = %config.user))]
    pub async fn connect(&self, config: &Config, credential: Credential) -> Result<Session, RunError> {
        let establish = self.establish(config, credential);
        let result = match timeout(self.connect_timeout, establish).await {
            Ok(result) => result,
            Err(_elapsed) => Err(anyhow!(
                "timed out after {}",
                humantime::format_duration(self.connect_timeout)
            )),
        };
        result.stage(Stage::Connection)
    }

    async fn establish(&self, config: &Config, credential: Credential) -> Result<Session> {
        let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("unable to resolve {}", config.host))?
            .next()
            .with_context(|| format!("no addresses found for {}", config.host))?;

        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("TCP connect to {addr} failed"))?;
        debug!(%addr, "TCP connected");

        let ssh_config = Arc::new(russh::client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });
        let handler = ClientHandler::new(self.verifier.clone());

        let mut handle = russh::client::connect_stream(ssh_config, stream, handler)
            .await
            .context("SSH handshake failed")?;

        let hash_alg = if credential.is_rsa() {
            handle
                .best_supported_rsa_hash()
                .await
                .context("unable to negotiate RSA signature hash")?
                .flatten()
        } else {
            None
        };

        let authenticated = handle
            .authenticate_publickey(&config.user, credential.with_hash_alg(hash_alg))
            .await
            .context("publickey authentication failed")?;
        if !authenticated.success() {
            bail!(
                "ssh authentication failed: {} rejected key {} for user {}",
                config.host,
                credential.fingerprint(),
                config.user
            );
        }
        debug!(fingerprint = %credential.fingerprint(), "ssh authenticated");

        Ok(Session::new(handle, addr, config.user.clone()))
    }
}

// Session --------------------------------------------------------------------

/// Live authenticated SSH session.
///
/// [`Session::close`] consumes the session, so it can be closed at most once.
pub struct Session {
    handle: Handle<ClientHandler>,
    addr: SocketAddr,
    user: String,
    closed: bool,
}

impl Session {
    fn new(handle: Handle<ClientHandler>, addr: SocketAddr, user: String) -> Self {
        Self {
            handle,
            addr,
            user,
            closed: false,
        }
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Opens a new session channel.
    ///
    /// # Errors
    ///
    /// If the server refuses the channel or the connection is gone.
    pub async fn open_channel(&self) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_session()
            .await
            .context("unable to open session channel")
    }

    /// Sends an SSH disconnect.
    ///
    /// # Errors
    ///
    /// If the disconnect message cannot be sent.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
            .context("failed sending disconnect")?;
        debug!(addr = %self.addr, "ssh session closed");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            warn!(addr = %self.addr, "ssh session dropped without close");
        }
    }
}

// russh details --------------------------------------------------------------

struct ClientHandler {
    verifier: HostKeyVerifier,
}

impl ClientHandler {
    fn new(verifier: HostKeyVerifier) -> Self {
        Self { verifier }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        self.verifier
            .verify(server_public_key)
            .context("host key verification failed")?;
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        debug!(banner = banner.trim_end(), "ssh auth banner");
        Ok(())
    }
}

// Tests ----------------------------------------------------------------------
