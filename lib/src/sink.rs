//! Destinations for progress messages and forwarded remote output.

use std::io;
use std::io::Write;

use crate::exec::OutputLine;
use crate::exec::OutputStream;

/// Receives progress messages and remote output lines as they happen.
pub trait OutputSink {
    /// Human-readable status line about the run itself.
    ///
    /// # Errors
    ///
    /// If the underlying writer fails.
    fn progress(&mut self, message: &str) -> io::Result<()>;

    /// One complete line of remote output.
    ///
    /// # Errors
    ///
    /// If the underlying writer fails.
    fn line(&mut self, line: &OutputLine) -> io::Result<()>;
}

/// Progress and remote stdout go to local stdout, remote stderr to local
/// stderr. Both are flushed per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioSink;

impl OutputSink for StdioSink {
    fn progress(&mut self, message: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{message}")?;
        stdout.flush()
    }

    fn line(&mut self, line: &OutputLine) -> io::Result<()> {
        match line.stream {
            OutputStream::Stdout => {
                let mut stdout = io::stdout().lock();
                writeln!(stdout, "{}", line.text)?;
                stdout.flush()
            }
            OutputStream::Stderr => {
                let mut stderr = io::stderr().lock();
                writeln!(stderr, "{}", line.text)?;
                stderr.flush()
            }
        }
    }
}

/// Something written to a [`CaptureSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Captured {
    Progress(String),
    Line(OutputStream, String),
}

/// Keeps everything in memory, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct CaptureSink {
    pub entries: Vec<Captured>,
}

impl CaptureSink {
    /// Lines forwarded on one stream, in order.
    #[must_use]
    pub fn lines(&self, stream: OutputStream) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                Captured::Line(s, text) if *s == stream => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn progress_messages(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                Captured::Progress(text) => Some(text.as_str()),
                Captured::Line(..) => None,
            })
            .collect()
    }
}

impl OutputSink for CaptureSink {
    fn progress(&mut self, message: &str) -> io::Result<()> {
        self.entries.push(Captured::Progress(message.to_owned()));
        Ok(())
    }

    fn line(&mut self, line: &OutputLine) -> io::Result<()> {
        self.entries
            .push(Captured::Line(line.stream, line.text.clone()));
        Ok(())
    }
}

impl<S> OutputSink for &mut S
where
    S: OutputSink + ?Sized,
{
    fn progress(&mut self, message: &str) -> io::Result<()> {
        (**self).progress(message)
    }

    fn line(&mut self, line: &OutputLine) -> io::Result<()> {
        (**self).line(line)
    }
}
