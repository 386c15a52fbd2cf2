//! The `ProgressHandler` lifecycle sink.
//!
//! The runner reports its run through five calls: `start` exactly once
//! before anything else, `batch_start`/`batch_progress`/`batch_finish` per
//! batch, and `finish` exactly once after the last `batch_finish`. Rendering
//! is an external concern; implementations range from the no-op default to
//! terminal progress bars.

/// Sink for batch run lifecycle callbacks.
///
/// All methods default to no-ops so renderers only override the calls they
/// care about. Handlers own their display/aggregation state exclusively and
/// are mutated only through these five calls.
pub trait ProgressHandler {
    /// A run over `total` items begins, with at most `pool_size` concurrent
    /// workers. Called exactly once, before any `batch_start`.
    fn start(&mut self, total: u64, pool_size: usize) {
        let _ = (total, pool_size);
    }

    /// The batch covering `[offset, offset + limit)` was dispatched.
    fn batch_start(&mut self, batch_index: u64, offset: u64, limit: u64) {
        let _ = (batch_index, offset, limit);
    }

    /// A worker reported `current` items processed within its batch.
    fn batch_progress(&mut self, batch_index: u64, current: u64) {
        let _ = (batch_index, current);
    }

    /// The batch's worker exited successfully.
    fn batch_finish(&mut self, batch_index: u64) {
        let _ = batch_index;
    }

    /// All batches finished. Called exactly once, after the last
    /// `batch_finish`.
    fn finish(&mut self) {}
}

/// Handler that ignores every callback; the default when no rendering is
/// wanted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgressHandler;

impl ProgressHandler for NullProgressHandler {}
