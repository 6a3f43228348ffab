//! End-to-end orchestration of a single run.

use strum::Display;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::auth::Credential;
use crate::config::Config;
use crate::config::ConfigInputs;
use crate::config::Script;
use crate::error::RunError;
use crate::error::Stage;
use crate::error::StageContext;
use crate::exec;
use crate::exec::ExecutionOutcome;
use crate::exec::SshExecChannel;
use crate::sink::OutputSink;
use crate::transfer;
use crate::transfer::REMOTE_SCRIPT_PATH;
use crate::transport::Session;
use crate::transport::Transport;

pub const BEGIN_OUTPUT: &str = "--- BEGIN REMOTE OUTPUT ---";
pub const END_OUTPUT: &str = "--- END REMOTE OUTPUT ---";

/// Progress of a [`Runner`]. Only moves forward; `Done` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Configured,
    Authenticated,
    Connected,
    Uploaded,
    Executing,
    Done,
    Failed,
}

impl RunState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Drives configuration, authentication, connection, upload and execution in
/// order, reporting progress to an [`OutputSink`].
#[derive(Debug)]
pub struct Runner<S> {
    sink: S,
    state: RunState,
}

impl<S> Runner<S>
where
    S: OutputSink,
{
    #[must_use]
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: RunState::Idle,
        }
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    #[must_use]
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Runs every stage once. The SSH session, if one was opened, is closed
    /// before this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// The [`RunError`] of the first stage that failed.
    #[instrument(skip_all)]
    pub async fn run(&mut self, inputs: ConfigInputs) -> Result<ExecutionOutcome, RunError> {
        let result = self.run_stages(inputs).await;
        match &result {
            Ok(outcome) => {
                self.transition(RunState::Done);
                info!(
                    exit_status = ?outcome.exit_status,
                    lines = outcome.lines.len(),
                    "run finished"
                );
            }
            Err(error) => {
                self.transition(RunState::Failed);
                debug!(stage = %error.stage(), "run failed");
            }
        }
        result
    }

    async fn run_stages(&mut self, inputs: ConfigInputs) -> Result<ExecutionOutcome, RunError> {
        let (config, script) = inputs.resolve()?;
        self.transition(RunState::Configured);

        let credential = Credential::load(&config.key_path, config.key_passphrase.as_ref())?;
        self.transition(RunState::Authenticated);

        self.progress(&format!(
            "Connecting to {}@{}:{}...",
            config.user, config.host, config.port
        ));
        let session = Transport::from_config(&config)
            .connect(&config, credential)
            .await?;
        self.transition(RunState::Connected);
        self.progress("SSH connection OK.");

        let result = self.on_session(&session, &config, &script).await;
        if let Err(error) = session.close().await {
            warn!(?error, "failed closing ssh session");
        }
        result
    }

    async fn on_session(
        &mut self,
        session: &Session,
        config: &Config,
        script: &Script,
    ) -> Result<ExecutionOutcome, RunError> {
        self.progress(&format!("Uploading script to {REMOTE_SCRIPT_PATH}..."));
        let artifact = transfer::upload_over_sftp(session, script).await?;
        self.transition(RunState::Uploaded);
        debug!(host = %config.host, path = %artifact.path, len = artifact.len, "script uploaded");

        self.progress("Running script on remote host...");
        self.progress(BEGIN_OUTPUT);
        self.transition(RunState::Executing);

        let mut channel = SshExecChannel::open(session)
            .await
            .stage(Stage::Execution)?;
        let command = exec::command_for(&artifact);
        let outcome = exec::execute(&mut channel, &command, &mut self.sink).await?;

        self.progress(END_OUTPUT);
        Ok(outcome)
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "run state");
        self.state = next;
    }

    /// Progress is informational; a failed write never fails the run.
    fn progress(&mut self, message: &str) {
        if let Err(error) = self.sink.progress(message) {
            warn!(?error, message, "unable to write progress");
        }
    }
}
