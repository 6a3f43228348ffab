//! Remote invocation of the uploaded script and relay of its output.
//!
//! Both output streams are drained by one loop over the channel's messages,
//! so lines are forwarded in the order they arrive and a busy stderr can never
//! stall stdout. Stdout is not forwarded ahead of stderr; a stderr line that
//! arrives first is forwarded first.

use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use bstr::ByteSlice;
use russh::client::Msg;
use russh::Channel;
use russh::ChannelMsg;
use strum::Display;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::error::RunError;
use crate::error::Stage;
use crate::error::StageContext;
use crate::sink::OutputSink;
use crate::transfer::RemoteArtifact;
use crate::transport::Session;

/// Interpreter the uploaded script is run with.
pub const INTERPRETER: &str = "python3";

/// Builds `<interpreter> <remote path>`.
#[must_use]
pub fn command_for(artifact: &RemoteArtifact) -> String {
    format!("{INTERPRETER} {}", artifact.path)
}

// Output model ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of remote output, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
    /// Time since the command was dispatched.
    pub elapsed: Duration,
}

/// Result of one remote invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Every line from both streams, in arrival order.
    pub lines: Vec<OutputLine>,
    pub exit_status: Option<u32>,
    pub exit_signal: Option<String>,
}

impl ExecutionOutcome {
    pub fn stdout(&self) -> impl Iterator<Item = &str> {
        self.stream(OutputStream::Stdout)
    }

    pub fn stderr(&self) -> impl Iterator<Item = &str> {
        self.stream(OutputStream::Stderr)
    }

    fn stream(&self, stream: OutputStream) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(move |line| line.stream == stream)
            .map(|line| line.text.as_str())
    }

    /// Whether the remote process reported exit status zero.
    #[must_use]
    pub fn exited_cleanly(&self) -> bool {
        self.exit_status == Some(0) && self.exit_signal.is_none()
    }
}

// Channel --------------------------------------------------------------------

/// Channel events relevant to a single exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    /// The server accepted the exec request.
    Accepted,
    /// The server refused the exec request.
    Refused,
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    ExitSignal(String),
    Eof,
    Close,
}

/// Channel able to run one command and report what happens to it.
#[async_trait]
pub trait ExecChannel {
    /// Sends the exec request.
    async fn dispatch(&mut self, command: &str) -> Result<()>;

    /// Next event, or `None` once the channel is gone.
    async fn next_event(&mut self) -> Option<ExecEvent>;
}

/// [`ExecChannel`] on a russh session channel.
pub struct SshExecChannel {
    channel: Channel<Msg>,
}

impl SshExecChannel {
    /// # Errors
    ///
    /// If the session refuses to open a channel.
    pub async fn open(session: &Session) -> Result<Self> {
        let channel = session.open_channel().await?;
        Ok(Self { channel })
    }
}

#[async_trait]
impl ExecChannel for SshExecChannel {
    async fn dispatch(&mut self, command: &str) -> Result<()> {
        self.channel
            .exec(true, command)
            .await
            .context("unable to send exec request")
    }

    async fn next_event(&mut self) -> Option<ExecEvent> {
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Success => ExecEvent::Accepted,
                ChannelMsg::Failure => ExecEvent::Refused,
                ChannelMsg::Data { ref data } => ExecEvent::Stdout(data.to_vec()),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => ExecEvent::Stderr(data.to_vec()),
                ChannelMsg::ExitStatus { exit_status } => ExecEvent::ExitStatus(exit_status),
                ChannelMsg::ExitSignal {
                    signal_name,
                    error_message,
                    ..
                } => ExecEvent::ExitSignal(format!("{signal_name:?} {error_message}").trim().to_owned()),
                ChannelMsg::Eof => ExecEvent::Eof,
                ChannelMsg::Close => ExecEvent::Close,
                other => {
                    debug!(?other, "ignoring channel message");
                    continue;
                }
            };
            return Some(event);
        }
    }
}

// Drain ----------------------------------------------------------------------

/// Dispatches `command` and forwards its output line by line to `sink` until
/// both streams are exhausted.
///
/// # Errors
///
/// [`RunError::Execution`] if the request is refused, the channel closes
/// before the remote command finished, or forwarding to `sink` fails. Output
/// captured before the failure is not returned.
#[instrument(skip(channel, sink))]
pub async fn execute<C, S>(
    channel: &mut C,
    command: &str,
    sink: &mut S,
) -> Result<ExecutionOutcome, RunError>
where
    C: ExecChannel + Send,
    S: OutputSink + ?Sized,
{
    drain(channel, command, sink).await.stage(Stage::Execution)
}

async fn drain<C, S>(channel: &mut C, command: &str, sink: &mut S) -> Result<ExecutionOutcome>
where
    C: ExecChannel + Send,
    S: OutputSink + ?Sized,
{
    channel.dispatch(command).await?;
    let started = Instant::now();

    let mut outcome = ExecutionOutcome::default();
    let mut stdout = LineBuffer::default();
    let mut stderr = LineBuffer::default();
    let mut eof = false;

    while let Some(event) = channel.next_event().await {
        match event {
            ExecEvent::Accepted => debug!("exec request accepted"),
            ExecEvent::Refused => bail!("remote host refused to run {command:?}"),
            ExecEvent::Stdout(data) => {
                for text in stdout.push(&data) {
                    forward(sink, &mut outcome, OutputStream::Stdout, text, started)?;
                }
            }
            ExecEvent::Stderr(data) => {
                for text in stderr.push(&data) {
                    forward(sink, &mut outcome, OutputStream::Stderr, text, started)?;
                }
            }
            // More data may still follow an exit status.
            ExecEvent::ExitStatus(code) => outcome.exit_status = Some(code),
            ExecEvent::ExitSignal(signal) => outcome.exit_signal = Some(signal),
            ExecEvent::Eof => eof = true,
            ExecEvent::Close => break,
        }
    }

    let finished = eof || outcome.exit_status.is_some() || outcome.exit_signal.is_some();
    if !finished {
        bail!("channel closed before the remote command finished");
    }

    if let Some(text) = stdout.finish() {
        forward(sink, &mut outcome, OutputStream::Stdout, text, started)?;
    }
    if let Some(text) = stderr.finish() {
        forward(sink, &mut outcome, OutputStream::Stderr, text, started)?;
    }

    match (outcome.exit_status, &outcome.exit_signal) {
        (_, Some(signal)) => warn!(%signal, "remote command killed by signal"),
        (Some(0), None) => debug!("remote command exited cleanly"),
        (Some(code), None) => warn!(code, "remote command exited with non-zero status"),
        (None, None) => warn!("remote command did not report an exit status"),
    }

    Ok(outcome)
}

fn forward<S>(
    sink: &mut S,
    outcome: &mut ExecutionOutcome,
    stream: OutputStream,
    text: String,
    started: Instant,
) -> Result<()>
where
    S: OutputSink + ?Sized,
{
    let line = OutputLine {
        stream,
        text,
        elapsed: started.elapsed(),
    };
    sink.line(&line)
        .with_context(|| format!("unable to forward remote {stream}"))?;
    outcome.lines.push(line);
    Ok(())
}

/// Splits a byte stream into lines, holding back any trailing partial line.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find_byte(b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let line = std::mem::replace(&mut self.pending, rest);
            lines.push(decode(&line));
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(decode(&line))
    }
}

fn decode(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    line.to_str_lossy().into_owned()
}

// Tests ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use rstest::rstest;

    use super::*;
    use crate::sink::CaptureSink;
    use crate::sink::Captured;

    /// Replays a fixed script of events.
    #[derive(Debug, Default)]
    struct ScriptedChannel {
        events: VecDeque<ExecEvent>,
        dispatched: Vec<String>,
        refuse_dispatch: bool,
    }

    impl ScriptedChannel {
        fn new(events: impl IntoIterator<Item = ExecEvent>) -> Self {
            Self {
                events: events.into_iter().collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ExecChannel for ScriptedChannel {
        async fn dispatch(&mut self, command: &str) -> Result<()> {
            if self.refuse_dispatch {
                bail!("channel closed");
            }
            self.dispatched.push(command.to_owned());
            Ok(())
        }

        async fn next_event(&mut self) -> Option<ExecEvent> {
            self.events.pop_front()
        }
    }

    fn out(s: &str) -> ExecEvent {
        ExecEvent::Stdout(s.as_bytes().to_vec())
    }

    fn err(s: &str) -> ExecEvent {
        ExecEvent::Stderr(s.as_bytes().to_vec())
    }

    fn finished(mut events: Vec<ExecEvent>) -> Vec<ExecEvent> {
        events.extend([ExecEvent::ExitStatus(0), ExecEvent::Eof, ExecEvent::Close]);
        events
    }

    async fn run(events: Vec<ExecEvent>) -> (Result<ExecutionOutcome, RunError>, CaptureSink) {
        let mut channel = ScriptedChannel::new(events);
        let mut sink = CaptureSink::default();
        let result = execute(&mut channel, "python3 /tmp/remote_script.py", &mut sink).await;
        (result, sink)
    }

    #[test]
    fn command_uses_fixed_interpreter() {
        let artifact = RemoteArtifact {
            path: "/tmp/remote_script.py".into(),
            len: 0,
            mode: 0o755,
        };
        assert_eq!(command_for(&artifact), "python3 /tmp/remote_script.py");
    }

    #[tokio::test]
    async fn dispatches_command_once() {
        let mut channel = ScriptedChannel::new(finished(vec![]));
        let mut sink = CaptureSink::default();
        execute(&mut channel, "python3 /tmp/remote_script.py", &mut sink)
            .await
            .unwrap();
        assert_eq!(channel.dispatched, vec!["python3 /tmp/remote_script.py"]);
    }

    #[tokio::test]
    async fn stdout_and_stderr_are_routed_separately() {
        let (result, sink) = run(finished(vec![out("A\n"), err("B\n")])).await;
        let outcome = result.unwrap();

        assert_eq!(sink.lines(OutputStream::Stdout), vec!["A"]);
        assert_eq!(sink.lines(OutputStream::Stderr), vec!["B"]);
        assert_eq!(
            sink.entries,
            vec![
                Captured::Line(OutputStream::Stdout, "A".into()),
                Captured::Line(OutputStream::Stderr, "B".into()),
            ]
        );
        assert_eq!(outcome.stdout().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(outcome.stderr().collect::<Vec<_>>(), vec!["B"]);
        assert!(outcome.exited_cleanly());
    }

    #[tokio::test]
    async fn interleaved_streams_keep_arrival_order() {
        let events = finished(vec![
            err("warming up\n"),
            out("epoch 1\n"),
            err("loss=0.5\n"),
            out("epoch 2\n"),
        ]);
        let (result, sink) = run(events).await;
        result.unwrap();

        assert_eq!(
            sink.entries,
            vec![
                Captured::Line(OutputStream::Stderr, "warming up".into()),
                Captured::Line(OutputStream::Stdout, "epoch 1".into()),
                Captured::Line(OutputStream::Stderr, "loss=0.5".into()),
                Captured::Line(OutputStream::Stdout, "epoch 2".into()),
            ]
        );
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_joined() {
        let events = finished(vec![out("hel"), out("lo\nwor"), out("ld\r\n"), out("\n")]);
        let (result, _) = run(events).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.stdout().collect::<Vec<_>>(), vec!["hello", "world", ""]);
    }

    #[tokio::test]
    async fn trailing_partial_lines_are_flushed() {
        let events = finished(vec![out("no newline"), err("also none")]);
        let (result, sink) = run(events).await;
        result.unwrap();
        assert_eq!(sink.lines(OutputStream::Stdout), vec!["no newline"]);
        assert_eq!(sink.lines(OutputStream::Stderr), vec!["also none"]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let events = finished(vec![ExecEvent::Stdout(b"caf\xff\n".to_vec())]);
        let (result, _) = run(events).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.stdout().collect::<Vec<_>>(), vec!["caf\u{FFFD}"]);
    }

    #[tokio::test]
    async fn data_after_exit_status_is_kept() {
        let events = vec![
            ExecEvent::Accepted,
            ExecEvent::ExitStatus(3),
            out("late\n"),
            ExecEvent::Eof,
            ExecEvent::Close,
        ];
        let (result, _) = run(events).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.exit_status, Some(3));
        assert!(!outcome.exited_cleanly());
        assert_eq!(outcome.stdout().collect::<Vec<_>>(), vec!["late"]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let events = vec![err("Traceback\n"), ExecEvent::ExitStatus(1), ExecEvent::Eof];
        let (result, _) = run(events).await;
        assert_eq!(result.unwrap().exit_status, Some(1));
    }

    #[tokio::test]
    async fn exit_signal_is_recorded() {
        let events = vec![
            ExecEvent::ExitSignal("KILL".into()),
            ExecEvent::Close,
        ];
        let (result, _) = run(events).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.exit_signal.as_deref(), Some("KILL"));
        assert!(!outcome.exited_cleanly());
    }

    #[rstest]
    #[case(vec![out("partial\n")])]
    #[case(vec![out("partial\n"), ExecEvent::Close])]
    #[case(vec![])]
    #[tokio::test]
    async fn closed_mid_read_is_execution_error(#[case] events: Vec<ExecEvent>) {
        let (result, _) = run(events).await;
        let error = result.unwrap_err();
        assert_eq!(error.stage(), Stage::Execution);
        assert_eq!(
            error.cause().to_string(),
            "channel closed before the remote command finished"
        );
    }

    #[tokio::test]
    async fn refused_request_is_execution_error() {
        let (result, sink) = run(vec![ExecEvent::Refused, ExecEvent::Close]).await;
        let error = result.unwrap_err();
        assert_eq!(error.stage(), Stage::Execution);
        assert!(error.cause().to_string().starts_with("remote host refused"));
        assert!(sink.entries.is_empty());
    }

    #[tokio::test]
    async fn dispatch_failure_is_execution_error() {
        let mut channel = ScriptedChannel {
            refuse_dispatch: true,
            ..Default::default()
        };
        let mut sink = CaptureSink::default();
        let error = execute(&mut channel, "python3 x", &mut sink)
            .await
            .unwrap_err();
        assert_eq!(error.stage(), Stage::Execution);
    }

    struct BrokenSink;

    impl OutputSink for BrokenSink {
        fn progress(&mut self, _message: &str) -> io::Result<()> {
            Ok(())
        }

        fn line(&mut self, _line: &OutputLine) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    #[tokio::test]
    async fn sink_failure_is_execution_error() {
        let mut channel = ScriptedChannel::new(finished(vec![out("A\n")]));
        let error = execute(&mut channel, "python3 x", &mut BrokenSink)
            .await
            .unwrap_err();
        assert_eq!(error.stage(), Stage::Execution);
        assert_eq!(error.cause().to_string(), "unable to forward remote stdout");
    }

    #[test]
    fn line_buffer_holds_partial_line() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"abc").is_empty());
        assert_eq!(buffer.push(b"def\nxy"), vec!["abcdef"]);
        assert_eq!(buffer.finish().as_deref(), Some("xy"));
        assert_eq!(buffer.finish(), None);
    }
}
