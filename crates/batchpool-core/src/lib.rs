//! `batchpool` Core Library
//!
//! Runtime-independent building blocks shared by the runner and by worker
//! binaries:
//! - Batch partitioning of an indexed workload
//! - Argument template substitution for batch commands
//! - The progress-channel wire protocol (parser and worker-side writer)
//! - The `ProgressHandler` lifecycle sink

pub mod batch;
pub mod handler;
pub mod protocol;
pub mod template;

pub use batch::{Batch, partition};
pub use handler::{NullProgressHandler, ProgressHandler};
pub use protocol::{DEFAULT_PROGRESS_FD, ProgressWriter, ProtocolError, parse_progress_line};
pub use template::{ArgTemplate, ArgValue};
