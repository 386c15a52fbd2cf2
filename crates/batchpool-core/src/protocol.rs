//! The progress-channel wire protocol.
//!
//! Worker processes report cumulative absolute progress as newline-terminated
//! decimal integers on a dedicated pipe, out of band from stdout/stderr. The
//! runner parses each received line back into an absolute value and derives
//! deltas itself; the worker side never reports increments directly.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Child fd the progress pipe is mapped to unless the caller overrides it.
///
/// The number itself is a convention, not a requirement: the runner passes
/// the handle explicitly at process-creation time and worker-side writers
/// take the fd as a parameter.
pub const DEFAULT_PROGRESS_FD: RawFd = 3;

#[allow(clippy::expect_used)]
static TRAILING_INT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)$").expect("trailing-integer pattern is valid"));

/// Violations of the progress wire protocol.
///
/// These are integration faults, not worker diagnostics: a malformed report
/// means the spawned command does not speak the protocol at all, and the
/// affected run is aborted rather than patched over.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The chunk carried no trailing decimal integer.
    #[error("Unexpected progress chunk: {chunk:?}")]
    MalformedChunk { chunk: String },

    /// The reported value does not fit the progress counter.
    #[error("Progress value out of range: {chunk:?}")]
    ValueOutOfRange { chunk: String },
}

/// Parse one progress report: the trailing decimal integer of the trimmed
/// chunk. Surrounding whitespace and any non-numeric prefix are tolerated;
/// a chunk without a trailing integer is a protocol violation.
pub fn parse_progress_line(line: &str) -> Result<u64, ProtocolError> {
    let trimmed = line.trim();
    let caps = TRAILING_INT
        .captures(trimmed)
        .ok_or_else(|| ProtocolError::MalformedChunk {
            chunk: line.to_string(),
        })?;
    caps[1].parse().map_err(|_| ProtocolError::ValueOutOfRange {
        chunk: line.to_string(),
    })
}

/// Worker-side progress reporter.
///
/// Owns the write end of the progress pipe and a tracked cumulative counter.
/// Each report is written as `<decimal>\n` and flushed immediately so the
/// runner observes it without buffering delays.
#[derive(Debug)]
pub struct ProgressWriter<W: Write = File> {
    sink: W,
    current: u64,
}

impl ProgressWriter<File> {
    /// Take ownership of an inherited pipe fd, usually [`DEFAULT_PROGRESS_FD`]
    /// in a worker process spawned by the runner.
    ///
    /// The fd must be open, writable, and not owned by anything else in the
    /// process; it is closed when the writer is dropped.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        // SAFETY: the caller designates an fd inherited from the spawning
        // runner for exclusive use by this writer; ownership transfers here
        // and the fd is released on drop.
        #[allow(unsafe_code)]
        let sink = unsafe { File::from_raw_fd(fd) };
        Self::new(sink)
    }
}

impl<W: Write> ProgressWriter<W> {
    /// Wrap an arbitrary sink. The counter starts at 0.
    pub const fn new(sink: W) -> Self {
        Self { sink, current: 0 }
    }

    /// Report an absolute cumulative progress value.
    pub fn set(&mut self, current: u64) -> io::Result<()> {
        self.current = current;
        writeln!(self.sink, "{current}")?;
        self.sink.flush()
    }

    /// Increment the tracked counter and report the new value.
    pub fn advance(&mut self, steps: u64) -> io::Result<()> {
        self.set(self.current + steps)
    }

    /// Emit a non-fatal diagnostic on stderr, where the runner collects it
    /// into the run's error log.
    pub fn error(&mut self, message: &str) -> io::Result<()> {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{message}")?;
        stderr.flush()
    }

    /// The last reported cumulative value.
    pub const fn current(&self) -> u64 {
        self.current
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_integer_line() {
        assert_eq!(parse_progress_line("42\n").unwrap(), 42);
        assert_eq!(parse_progress_line("0").unwrap(), 0);
    }

    #[test]
    fn parses_trailing_integer_with_prefix() {
        // Only the trailing integer counts, matching writers that prefix
        // their reports with labels.
        assert_eq!(parse_progress_line("processed 120\n").unwrap(), 120);
    }

    #[test]
    fn tolerates_surrounding_whitespace() {
        assert_eq!(parse_progress_line("  7 \t\n").unwrap(), 7);
    }

    #[test]
    fn rejects_non_numeric_chunk() {
        let err = parse_progress_line("abc\n").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedChunk { .. }));
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn rejects_empty_chunk() {
        assert!(matches!(
            parse_progress_line(""),
            Err(ProtocolError::MalformedChunk { .. })
        ));
    }

    #[test]
    fn rejects_trailing_non_digit() {
        assert!(parse_progress_line("42%").is_err());
    }

    #[test]
    fn rejects_value_beyond_u64() {
        let err = parse_progress_line("99999999999999999999999").unwrap_err();
        assert!(matches!(err, ProtocolError::ValueOutOfRange { .. }));
    }

    #[test]
    fn writer_emits_newline_terminated_decimals() {
        let mut writer = ProgressWriter::new(Vec::new());
        writer.set(10).unwrap();
        writer.set(42).unwrap();
        assert_eq!(writer.sink, b"10\n42\n");
    }

    #[test]
    fn advance_accumulates_from_tracked_counter() {
        let mut writer = ProgressWriter::new(Vec::new());
        writer.advance(3).unwrap();
        writer.advance(4).unwrap();
        assert_eq!(writer.current(), 7);
        assert_eq!(writer.sink, b"3\n7\n");
    }

    #[test]
    fn set_resynchronises_the_counter() {
        let mut writer = ProgressWriter::new(Vec::new());
        writer.advance(5).unwrap();
        writer.set(100).unwrap();
        writer.advance(1).unwrap();
        assert_eq!(writer.sink, b"5\n100\n101\n");
    }

    #[test]
    fn written_reports_parse_back() {
        let mut writer = ProgressWriter::new(Vec::new());
        writer.set(1234).unwrap();
        let line = String::from_utf8(writer.sink.clone()).unwrap();
        assert_eq!(parse_progress_line(&line).unwrap(), 1234);
    }
}
