//! Terminal progress rendering.
//!
//! One aggregate bar tracks the whole run; when the pool allows more than
//! one concurrent worker, each live batch additionally gets an ephemeral
//! bar that appears on dispatch and is cleared when the batch finishes.

use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use batchpool_core::ProgressHandler;

/// Rendering `ProgressHandler` backed by an indicatif [`MultiProgress`].
pub struct ProgressBarHandler {
    multi: MultiProgress,
    main: ProgressBar,
    pool_size: usize,
    bars: HashMap<u64, ProgressBar>,
    last_values: HashMap<u64, u64>,
    limits: HashMap<u64, u64>,
}

impl ProgressBarHandler {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let main = multi.add(ProgressBar::no_length());
        main.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] [{bar:40.green}] {pos}/{len} ({per_sec}, eta {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("●●◌"),
        );
        Self {
            multi,
            main,
            pool_size: 1,
            bars: HashMap::new(),
            last_values: HashMap::new(),
            limits: HashMap::new(),
        }
    }
}

impl Default for ProgressBarHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHandler for ProgressBarHandler {
    fn start(&mut self, total: u64, pool_size: usize) {
        self.pool_size = pool_size;
        self.main.set_length(total);
        self.main.set_position(0);
    }

    fn batch_start(&mut self, batch_index: u64, offset: u64, limit: u64) {
        self.limits.insert(batch_index, limit);
        if self.pool_size == 1 {
            return;
        }
        let bar = self.multi.add(ProgressBar::new(limit));
        bar.set_style(
            ProgressStyle::with_template("     [{bar:40}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("●●◌"),
        );
        bar.set_message(format!("{offset} - {}", offset + limit));
        self.bars.insert(batch_index, bar);
    }

    fn batch_progress(&mut self, batch_index: u64, current: u64) {
        let last = self.last_values.insert(batch_index, current).unwrap_or(0);
        self.main.inc(current.saturating_sub(last));
        if let Some(bar) = self.bars.get(&batch_index) {
            bar.set_position(current);
        }
    }

    fn batch_finish(&mut self, batch_index: u64) {
        // Top the aggregate up to the batch's full range, covering workers
        // that finished without reporting to the very end.
        let last = self.last_values.get(&batch_index).copied().unwrap_or(0);
        let limit = self.limits.get(&batch_index).copied().unwrap_or(0);
        self.main.inc(limit.saturating_sub(last));
        if let Some(bar) = self.bars.remove(&batch_index) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
    }

    fn finish(&mut self) {
        self.main.finish();
    }
}
