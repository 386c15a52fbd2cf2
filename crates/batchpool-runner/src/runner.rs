//! Bounded pool scheduler for batch workers.
//!
//! [`BatchRunner`] partitions a workload into batches, keeps up to
//! `pool_size` workers alive, refills the pool from the FIFO queue as
//! workers finish, forwards progress to the [`ProgressHandler`], collects
//! non-fatal diagnostics into the run's error log, and reports completion
//! exactly once. A worker fault aborts the run immediately; the remaining
//! live workers are killed when the pool is dropped.

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use batchpool_core::protocol::DEFAULT_PROGRESS_FD;
use batchpool_core::{ArgTemplate, Batch, NullProgressHandler, ProgressHandler, partition};

use crate::command::CommandBuilder;
use crate::worker::{Worker, WorkerError, WorkerEvent};

/// Default number of items per batch.
pub const BATCH_SIZE_DEFAULT: u64 = 500;

/// Default maximum number of concurrent workers.
pub const POOL_SIZE_DEFAULT: usize = 5;

/// Worker event channel buffer size.
const EVENT_CHANNEL_CAPACITY: usize = 256;

type FinishHook = Box<dyn FnMut(&[String]) + Send>;
type ErrorHook = Box<dyn FnMut(&str) + Send>;

/// Errors aborting a batch run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A worker hard-failed (spawn failure, protocol violation, or
    /// non-zero exit). Diagnostics on stderr never produce this; they are
    /// collected into the error log instead.
    #[error("Batch {batch_index} failed: {source}")]
    Worker {
        batch_index: u64,
        #[source]
        source: WorkerError,
    },

    #[error("Worker event channel closed with live workers in the pool")]
    ChannelClosed,
}

/// Pool scheduler covering an indexed workload exactly once.
pub struct BatchRunner {
    builder: Box<dyn CommandBuilder>,
    template: ArgTemplate,
    handler: Box<dyn ProgressHandler + Send>,
    batch_size: u64,
    pool_size: usize,
    progress_fd: RawFd,
    finish_hooks: Vec<FinishHook>,
    error_hooks: Vec<ErrorHook>,
}

impl BatchRunner {
    /// Create a runner for the given command builder and argument template,
    /// with default batch/pool sizes and no progress rendering.
    pub fn new(builder: impl CommandBuilder + 'static, template: ArgTemplate) -> Self {
        Self {
            builder: Box::new(builder),
            template,
            handler: Box::new(NullProgressHandler),
            batch_size: BATCH_SIZE_DEFAULT,
            pool_size: POOL_SIZE_DEFAULT,
            progress_fd: DEFAULT_PROGRESS_FD,
            finish_hooks: Vec::new(),
            error_hooks: Vec::new(),
        }
    }

    /// Replace the progress handler.
    #[must_use]
    pub fn with_handler(mut self, handler: impl ProgressHandler + Send + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Set the number of items per batch. 0 falls back to the default.
    pub fn set_batch_size(&mut self, batch_size: u64) {
        self.batch_size = if batch_size == 0 {
            BATCH_SIZE_DEFAULT
        } else {
            batch_size
        };
    }

    /// Set the maximum number of concurrent workers. 0 falls back to the
    /// default.
    pub fn set_pool_size(&mut self, pool_size: usize) {
        self.pool_size = if pool_size == 0 {
            POOL_SIZE_DEFAULT
        } else {
            pool_size
        };
    }

    /// Map the progress pipe to a different child fd.
    pub fn set_progress_fd(&mut self, fd: RawFd) {
        self.progress_fd = fd;
    }

    /// The configured batch size.
    pub const fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// The configured pool bound.
    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Register a hook invoked once per completed run with the accumulated
    /// error log. Hooks run in registration order.
    pub fn on_finish(&mut self, hook: impl FnMut(&[String]) + Send + 'static) {
        self.finish_hooks.push(Box::new(hook));
    }

    /// Register a hook invoked for every collected diagnostic, in arrival
    /// order. Hooks run in registration order and never pause scheduling.
    pub fn on_error(&mut self, hook: impl FnMut(&str) + Send + 'static) {
        self.error_hooks.push(Box::new(hook));
    }

    /// Run the workload of `total` items to completion.
    ///
    /// Returns the accumulated error log (possibly empty) once every batch
    /// finished, or the first fatal worker fault. Each call starts from a
    /// clean queue, pool, and error log.
    pub async fn run(&mut self, total: u64) -> Result<Vec<String>, RunError> {
        let mut queue: VecDeque<Batch> = partition(total, self.batch_size).into();
        let mut pool: HashMap<u64, Worker> = HashMap::new();
        let mut errors: Vec<String> = Vec::new();

        info!(
            total,
            batch_size = self.batch_size,
            pool_size = self.pool_size,
            batches = queue.len(),
            "Starting batch run"
        );
        self.handler.start(total, self.pool_size);

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.populate_pool(&mut queue, &mut pool, &events_tx)?;

        if pool.is_empty() {
            // An empty workload completes without spawning anything.
            self.handler.finish();
            self.dispatch_finish(&errors);
            return Ok(errors);
        }

        while let Some((batch_index, event)) = events_rx.recv().await {
            match event {
                WorkerEvent::Progress { current, delta } => {
                    debug!(batch_index, current, delta, "Batch progress");
                    self.handler.batch_progress(batch_index, current);
                }
                WorkerEvent::Diagnostic(message) => {
                    warn!(batch_index, diagnostic = %message, "Worker diagnostic");
                    errors.push(message.clone());
                    for hook in &mut self.error_hooks {
                        hook(&message);
                    }
                }
                WorkerEvent::Finished => {
                    self.handler.batch_finish(batch_index);
                    if let Some(worker) = pool.remove(&batch_index) {
                        let batch = worker.batch();
                        debug!(
                            batch_index,
                            offset = batch.offset,
                            limit = batch.limit,
                            remaining = queue.len(),
                            "Batch complete"
                        );
                    }
                    if queue.is_empty() && pool.is_empty() {
                        info!(total, errors = errors.len(), "Batch run finished");
                        self.handler.finish();
                        self.dispatch_finish(&errors);
                        return Ok(errors);
                    }
                    self.populate_pool(&mut queue, &mut pool, &events_tx)?;
                }
                WorkerEvent::Faulted(source) => {
                    // Not caught: the fault aborts the whole run. Dropping
                    // `pool` kills the remaining live workers.
                    return Err(RunError::Worker {
                        batch_index,
                        source,
                    });
                }
            }
        }

        Err(RunError::ChannelClosed)
    }

    /// Dequeue and spawn batches until the pool is full or the queue is
    /// empty.
    fn populate_pool(
        &mut self,
        queue: &mut VecDeque<Batch>,
        pool: &mut HashMap<u64, Worker>,
        events: &mpsc::Sender<(u64, WorkerEvent)>,
    ) -> Result<(), RunError> {
        while pool.len() < self.pool_size {
            let Some(batch) = queue.pop_front() else {
                return Ok(());
            };
            let worker = self.spawn_batch(batch, events)?;
            pool.insert(batch.index, worker);
        }
        Ok(())
    }

    fn spawn_batch(
        &mut self,
        batch: Batch,
        events: &mpsc::Sender<(u64, WorkerEvent)>,
    ) -> Result<Worker, RunError> {
        let args = self.template.resolve(batch.offset, batch.limit);
        let command = self.builder.build(&args);
        self.handler.batch_start(batch.index, batch.offset, batch.limit);
        Worker::spawn(command, batch, self.progress_fd, events.clone()).map_err(|source| {
            RunError::Worker {
                batch_index: batch.index,
                source,
            }
        })
    }

    fn dispatch_finish(&mut self, errors: &[String]) {
        for hook in &mut self.finish_hooks {
            hook(errors);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::command::ProcessCommand;

    fn runner(script: &str) -> BatchRunner {
        BatchRunner::new(
            ProcessCommand::new("/bin/sh").arg("-c").arg(script),
            ArgTemplate::new(vec![]),
        )
    }

    #[test]
    fn defaults_match_conventions() {
        let r = runner("true");
        assert_eq!(r.batch_size(), 500);
        assert_eq!(r.pool_size(), 5);
    }

    #[test]
    fn zero_sizes_fall_back_to_defaults() {
        let mut r = runner("true");
        r.set_batch_size(0);
        r.set_pool_size(0);
        assert_eq!(r.batch_size(), BATCH_SIZE_DEFAULT);
        assert_eq!(r.pool_size(), POOL_SIZE_DEFAULT);
    }

    #[tokio::test]
    async fn empty_workload_finishes_without_spawning() {
        let mut r = runner("exit 1");
        let (tx, rx) = std::sync::mpsc::channel();
        r.on_finish(move |errors| {
            let _ = tx.send(errors.len());
        });
        let errors = r.run(0).await.unwrap();
        assert!(errors.is_empty());
        // The finish hook fired exactly once, with an empty error log.
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0]);
    }

    #[tokio::test]
    async fn finish_hooks_run_in_registration_order() {
        let mut r = runner("true");
        r.set_batch_size(10);
        let (tx, rx) = std::sync::mpsc::channel();
        let tx2 = tx.clone();
        r.on_finish(move |_| {
            let _ = tx.send("first");
        });
        r.on_finish(move |_| {
            let _ = tx2.send("second");
        });
        r.run(0).await.unwrap();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["first", "second"]);
    }
}
