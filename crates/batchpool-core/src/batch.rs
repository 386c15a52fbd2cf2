//! Batch partitioning of an indexed workload.
//!
//! A run over `total` items is split into contiguous `[offset, offset+limit)`
//! slices, each handed to one worker process. The batch index is a stable key
//! from creation through queue and pool membership; it is never recycled
//! within a run.

/// One contiguous slice of the total workload, executed by a single worker
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Batch {
    /// Position of this batch within the run, starting at 0.
    pub index: u64,
    /// First item index covered by this batch.
    pub offset: u64,
    /// Number of items covered by this batch.
    pub limit: u64,
}

impl Batch {
    /// One-past-the-end item index of this batch.
    pub const fn end(&self) -> u64 {
        self.offset + self.limit
    }
}

/// Split `[0, total)` into contiguous batches of at most `batch_size` items.
///
/// Every batch but the last covers exactly `batch_size` items; the last
/// covers the remainder, so the limits always sum to `total`. `total == 0`
/// yields no batches. A `batch_size` of 0 is treated as 1.
pub fn partition(total: u64, batch_size: u64) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let count = total.div_ceil(batch_size);
    (0..count)
        .map(|index| {
            let offset = index * batch_size;
            Batch {
                index,
                offset,
                limit: batch_size.min(total - offset),
            }
        })
        .collect()
}
