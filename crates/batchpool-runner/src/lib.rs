//! `batchpool` Runner Library
//!
//! Executes an index-partitionable workload as a bounded pool of external
//! worker processes:
//! - Worker lifecycle wrapper demultiplexing stdout, stderr, exit status and
//!   the out-of-band progress pipe into typed events
//! - Command-builder collaborator for constructing worker invocations
//! - Pool scheduler covering the whole workload exactly once
//!
//! Process plumbing relies on Unix fd inheritance for the progress pipe, so
//! this crate is Unix-only.

pub mod command;
pub mod runner;
pub mod worker;

pub use command::{CommandBuilder, ProcessCommand};
pub use runner::{BatchRunner, RunError};
pub use worker::{Worker, WorkerError, WorkerEvent};
