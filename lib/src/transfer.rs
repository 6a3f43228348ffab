//! Upload of the script payload to the remote filesystem.

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use russh_sftp::protocol::OpenFlags;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::config::Script;
use crate::error::RunError;
use crate::error::Stage;
use crate::error::StageContext;
use crate::transport::Session;

/// Fixed upload location. Every run overwrites the same file.
pub const REMOTE_SCRIPT_PATH: &str = "/tmp/remote_script.py";

/// `rwxr-xr-x`
pub const REMOTE_SCRIPT_MODE: u32 = 0o755;

/// The uploaded script as it exists on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub path: String,
    pub len: usize,
    pub mode: u32,
}

/// Minimal remote filesystem surface needed for an upload.
#[async_trait]
pub trait RemoteFs {
    /// Creates or truncates `path` and writes `contents` to it.
    async fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<()>;

    /// Sets the permission bits of `path`.
    async fn set_permissions(&mut self, path: &str, mode: u32) -> Result<()>;
}

/// Writes the script verbatim to [`REMOTE_SCRIPT_PATH`] and makes it
/// executable.
///
/// # Errors
///
/// [`RunError::Transfer`] if the write or the permission change fails.
#[instrument(skip_all, fields(path = REMOTE_SCRIPT_PATH, len = script.bytes.len()))]
pub async fn upload_script<F>(fs: &mut F, script: &Script) -> Result<RemoteArtifact, RunError>
where
    F: RemoteFs + Send,
{
    upload(fs, REMOTE_SCRIPT_PATH, &script.bytes)
        .await
        .stage(Stage::Transfer)
}

async fn upload<F>(fs: &mut F, path: &str, contents: &[u8]) -> Result<RemoteArtifact>
where
    F: RemoteFs + Send,
{
    fs.write_file(path, contents)
        .await
        .with_context(|| format!("unable to write {path}"))?;
    fs.set_permissions(path, REMOTE_SCRIPT_MODE)
        .await
        .with_context(|| format!("unable to set mode {REMOTE_SCRIPT_MODE:o} on {path}"))?;
    debug!(path, len = contents.len(), "uploaded script");

    Ok(RemoteArtifact {
        path: path.to_owned(),
        len: contents.len(),
        mode: REMOTE_SCRIPT_MODE,
    })
}

/// Opens an SFTP channel on `session`, uploads the script, and closes the
/// channel again.
///
/// # Errors
///
/// [`RunError::Transfer`] if the SFTP subsystem is unavailable or the upload
/// fails.
pub async fn upload_over_sftp(
    session: &Session,
    script: &Script,
) -> Result<RemoteArtifact, RunError> {
    let mut sftp = SftpFs::open(session).await.stage(Stage::Transfer)?;
    let result = upload_script(&mut sftp, script).await;
    if let Err(error) = sftp.close().await {
        warn!(?error, "failed closing sftp channel");
    }
    result
}

// SFTP -----------------------------------------------------------------------

/// [`RemoteFs`] backed by the `sftp` subsystem of an SSH session.
///
/// The remote sshd must enable the subsystem, for example with
/// `Subsystem sftp internal-sftp`.
pub struct SftpFs {
    sftp: SftpSession,
}

impl SftpFs {
    /// # Errors
    ///
    /// If the channel cannot be opened or the subsystem request is refused.
    pub async fn open(session: &Session) -> Result<Self> {
        let channel = session.open_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .context("sftp subsystem request failed")?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .context("sftp handshake failed")?;
        Ok(Self { sftp })
    }

    /// # Errors
    ///
    /// If the close request fails.
    pub async fn close(self) -> Result<()> {
        self.sftp.close().await.context("sftp close failed")
    }
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<()> {
        let mut file = self
            .sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.shutdown().await?;
        Ok(())
    }

    async fn set_permissions(&mut self, path: &str, mode: u32) -> Result<()> {
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode);
        self.sftp.set_metadata(path, attrs).await?;
        Ok(())
    }
}

// Tests ----------------------------------------------------------------------
