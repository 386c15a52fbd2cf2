//! Worker process lifecycle wrapper.
//!
//! A [`Worker`] owns one spawned batch process and demultiplexes its four
//! endpoints — stdin (unused), stdout, stderr, and the dedicated progress
//! pipe — into typed [`WorkerEvent`]s published on an `mpsc` channel tagged
//! with the batch index. One tokio task per worker drives all read endpoints
//! concurrently, so no endpoint ever blocks another, and the terminal event
//! (`Finished` or a fault) is published strictly after every progress and
//! diagnostic event of that worker.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use batchpool_core::Batch;
use batchpool_core::protocol::{ProtocolError, parse_progress_line};

/// Event published by a worker, tagged with its batch index on the wire.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The worker reported cumulative progress on its progress pipe.
    /// `delta` is derived runner-side from the previous report.
    Progress { current: u64, delta: i64 },
    /// One trimmed stderr line; non-fatal, collected into the run's error
    /// log.
    Diagnostic(String),
    /// The process exited with code 0. Published exactly once, mutually
    /// exclusive with `Faulted`.
    Finished,
    /// The worker hard-failed; the run must abort.
    Faulted(WorkerError),
}

/// Fatal worker faults, distinct from the non-fatal diagnostic channel.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker process: {reason}")]
    SpawnFailed { reason: String },

    /// The process wrote something other than a decimal progress report on
    /// the progress pipe.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Non-zero exit. The message is the worker's buffered stdout, or a
    /// placeholder when it produced none.
    #[error("Worker failed ({status}): {message}")]
    Exit { status: ExitStatus, message: String },

    #[error("I/O error on worker channel: {0}")]
    Io(#[from] io::Error),
}

/// Handle to one live batch worker.
///
/// The spawned process and its endpoints are owned by the worker's monitor
/// task; dropping the handle aborts that task, which kills the process
/// (`kill_on_drop`), so an aborted run never leaks children.
#[derive(Debug)]
pub struct Worker {
    batch: Batch,
    monitor: JoinHandle<()>,
}

impl Worker {
    /// Spawn the batch process and start demultiplexing its endpoints.
    ///
    /// The write end of a fresh pipe is mapped to `progress_fd` in the
    /// child, stdout/stderr are piped, and stdin is closed. Events are
    /// published on `events` tagged with the batch index.
    pub fn spawn(
        mut command: Command,
        batch: Batch,
        progress_fd: RawFd,
        events: mpsc::Sender<(u64, WorkerEvent)>,
    ) -> Result<Self, WorkerError> {
        let (pipe_tx, pipe_rx) = pipe::pipe()?;
        let child_end = pipe_tx.into_blocking_fd()?;
        let raw_child_end = child_end.as_raw_fd();

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // SAFETY: dup2 is async-signal-safe and `raw_child_end` remains a
        // valid fd across the fork because `child_end` is only dropped after
        // spawn returns. dup2 clears CLOEXEC on the duplicate, so the child
        // inherits exactly one progress handle at `progress_fd`.
        #[allow(unsafe_code)]
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(raw_child_end, progress_fd) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| WorkerError::SpawnFailed {
            reason: e.to_string(),
        })?;
        // The parent must not hold the write end, or progress EOF never
        // arrives.
        drop(child_end);

        let stdout = child.stdout.take().ok_or_else(|| WorkerError::SpawnFailed {
            reason: "Failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| WorkerError::SpawnFailed {
            reason: "Failed to capture stderr".to_string(),
        })?;

        debug!(batch_index = batch.index, offset = batch.offset, limit = batch.limit, "Worker spawned");

        let batch_index = batch.index;
        let monitor = tokio::spawn(async move {
            let outcome = demux(batch_index, child, stdout, stderr, pipe_rx, &events).await;
            let terminal = match outcome {
                Ok(()) => WorkerEvent::Finished,
                Err(e) => WorkerEvent::Faulted(e),
            };
            if events.send((batch_index, terminal)).await.is_err() {
                debug!(batch_index, "Worker event channel closed before exit");
            }
        });

        Ok(Self { batch, monitor })
    }

    /// The batch this worker executes.
    pub const fn batch(&self) -> Batch {
        self.batch
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

/// Drive all read endpoints to EOF, then reap the exit status.
///
/// Progress and diagnostic events are published as they occur; the caller
/// publishes the terminal event from the returned result, which keeps the
/// within-worker ordering guarantee without any synchronisation.
async fn demux(
    batch_index: u64,
    mut child: Child,
    stdout: impl AsyncRead + Unpin,
    stderr: impl AsyncRead + Unpin,
    progress: pipe::Receiver,
    events: &mpsc::Sender<(u64, WorkerEvent)>,
) -> Result<(), WorkerError> {
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut progress_lines = BufReader::new(progress).lines();

    let mut output: Vec<String> = Vec::new();
    let mut last_progress: u64 = 0;
    let (mut stdout_done, mut stderr_done, mut progress_done) = (false, false, false);

    while !(stdout_done && stderr_done && progress_done) {
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => match line? {
                // Buffered only; surfaced as the fault message on non-zero
                // exit, never live.
                Some(line) => output.push(line),
                None => stdout_done = true,
            },
            line = stderr_lines.next_line(), if !stderr_done => match line? {
                Some(line) => {
                    let message = line.trim().to_string();
                    if events
                        .send((batch_index, WorkerEvent::Diagnostic(message)))
                        .await
                        .is_err()
                    {
                        stderr_done = true;
                    }
                }
                None => stderr_done = true,
            },
            line = progress_lines.next_line(), if !progress_done => match line? {
                Some(line) => {
                    // Blank lines are chunking artifacts, not reports.
                    if line.trim().is_empty() {
                        continue;
                    }
                    let current = parse_progress_line(&line)?;
                    #[allow(clippy::cast_possible_wrap)]
                    let delta = current as i64 - last_progress as i64;
                    if delta < 0 {
                        warn!(
                            batch_index,
                            current,
                            last = last_progress,
                            "Worker reported regressing progress"
                        );
                    }
                    last_progress = current;
                    if events
                        .send((batch_index, WorkerEvent::Progress { current, delta }))
                        .await
                        .is_err()
                    {
                        progress_done = true;
                    }
                }
                None => progress_done = true,
            },
        }
    }

    let status = child.wait().await?;
    if status.success() {
        debug!(batch_index, "Worker finished");
        return Ok(());
    }

    let message = if output.is_empty() {
        format!("Worker exited with {status} without any further output")
    } else {
        output.join("\n")
    };
    Err(WorkerError::Exit { status, message })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn batch() -> Batch {
        Batch {
            index: 0,
            offset: 0,
            limit: 10,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<(u64, WorkerEvent)>) -> Vec<WorkerEvent> {
        let mut collected = Vec::new();
        while let Some((_, event)) = rx.recv().await {
            let terminal = matches!(
                event,
                WorkerEvent::Finished | WorkerEvent::Faulted(_)
            );
            collected.push(event);
            if terminal {
                break;
            }
        }
        collected
    }

    #[tokio::test]
    async fn successful_worker_publishes_finished_last() {
        let (tx, rx) = mpsc::channel(16);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo 4 >&3; echo 10 >&3; exit 0");
        let _worker = Worker::spawn(cmd, batch(), 3, tx).unwrap();

        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(WorkerEvent::Finished)));
        let progress: Vec<(u64, i64)> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Progress { current, delta } => Some((*current, *delta)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(4, 4), (10, 6)]);
    }

    #[tokio::test]
    async fn batch_accessor_reports_the_spawned_range() {
        let (tx, rx) = mpsc::channel(16);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("true");
        let worker = Worker::spawn(cmd, batch(), 3, tx).unwrap();
        assert_eq!(worker.batch(), batch());
        drain(rx).await;
    }

    #[tokio::test]
    async fn stderr_lines_become_diagnostics() {
        let (tx, rx) = mpsc::channel(16);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo first warning >&2; echo second >&2");
        let _worker = Worker::spawn(cmd, batch(), 3, tx).unwrap();

        let events = drain(rx).await;
        let diagnostics: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Diagnostic(m) => Some(m.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(diagnostics, vec!["first warning", "second"]);
        assert!(matches!(events.last(), Some(WorkerEvent::Finished)));
    }

    #[tokio::test]
    async fn nonzero_exit_faults_with_buffered_stdout() {
        let (tx, rx) = mpsc::channel(16);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo out of disk space; exit 3");
        let _worker = Worker::spawn(cmd, batch(), 3, tx).unwrap();

        let events = drain(rx).await;
        match events.last() {
            Some(WorkerEvent::Faulted(WorkerError::Exit { status, message })) => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(message, "out of disk space");
            }
            other => panic!("Expected exit fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_without_output_uses_placeholder() {
        let (tx, rx) = mpsc::channel(16);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("exit 1");
        let _worker = Worker::spawn(cmd, batch(), 3, tx).unwrap();

        let events = drain(rx).await;
        match events.last() {
            Some(WorkerEvent::Faulted(WorkerError::Exit { message, .. })) => {
                assert!(message.contains("without any further output"), "{message}");
            }
            other => panic!("Expected exit fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_progress_chunk_is_a_protocol_fault() {
        let (tx, rx) = mpsc::channel(16);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo abc >&3; sleep 5");
        let _worker = Worker::spawn(cmd, batch(), 3, tx).unwrap();

        let events = drain(rx).await;
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Faulted(WorkerError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn stdout_is_not_surfaced_on_success() {
        let (tx, rx) = mpsc::channel(16);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo plain output; echo 1 >&3");
        let _worker = Worker::spawn(cmd, batch(), 3, tx).unwrap();

        let events = drain(rx).await;
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, WorkerEvent::Diagnostic(_))),
            "stdout must stay buffered, got {events:?}"
        );
    }

    #[tokio::test]
    async fn custom_progress_fd_is_honoured() {
        let (tx, rx) = mpsc::channel(16);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo 9 >&7");
        let _worker = Worker::spawn(cmd, batch(), 7, tx).unwrap();

        let events = drain(rx).await;
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::Progress { current: 9, .. }
        )));
    }

    #[tokio::test]
    async fn progress_regression_passes_through_unclamped() {
        let (tx, rx) = mpsc::channel(16);
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo 10 >&3; echo 4 >&3");
        let _worker = Worker::spawn(cmd, batch(), 3, tx).unwrap();

        let events = drain(rx).await;
        let progress: Vec<(u64, i64)> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Progress { current, delta } => Some((*current, *delta)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(10, 10), (4, -6)]);
    }
}
