//! `batchpool` CLI
//!
//! Runs a command over an indexed workload as a bounded pool of batch worker
//! processes. Workers receive their `--offset`/`--limit` range as arguments
//! and report progress on the inherited pipe fd.

mod render;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use batchpool_core::template::{ArgTemplate, ArgValue, LIMIT_MARKER, OFFSET_MARKER};
use batchpool_runner::{BatchRunner, ProcessCommand};

use crate::render::ProgressBarHandler;

#[derive(Parser, Debug)]
#[command(name = "batchpool")]
#[command(version, about = "Run an indexed workload as a pool of batch worker processes")]
struct Args {
    /// Total number of items to cover
    #[arg(long, env = "BATCHPOOL_TOTAL")]
    total: u64,

    /// Items per batch
    #[arg(long, default_value_t = 500, env = "BATCHPOOL_BATCH_SIZE")]
    batch_size: u64,

    /// Maximum concurrent worker processes
    #[arg(long, default_value_t = 5, env = "BATCHPOOL_POOL_SIZE")]
    pool_size: usize,

    /// Flag passed to the worker before the batch offset
    #[arg(long, default_value = "--offset", allow_hyphen_values = true)]
    offset_flag: String,

    /// Flag passed to the worker before the batch limit
    #[arg(long, default_value = "--limit", allow_hyphen_values = true)]
    limit_flag: String,

    /// Child fd the progress pipe is mapped to
    #[arg(long, default_value_t = 3, env = "BATCHPOOL_PROGRESS_FD")]
    progress_fd: i32,

    /// Working directory for worker processes
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Suppress progress rendering
    #[arg(short, long)]
    quiet: bool,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, default_value = "warn", env = "BATCHPOOL_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, env = "BATCHPOOL_LOG_JSON")]
    log_json: bool,

    /// Worker program to spawn per batch
    program: PathBuf,

    /// Worker arguments. `{offset}` and `{limit}` markers are substituted
    /// per batch; without markers, `<offset-flag> <offset> <limit-flag>
    /// <limit>` is appended instead.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Args {
    fn template(&self) -> ArgTemplate {
        let has_markers = self
            .args
            .iter()
            .any(|a| a.contains(OFFSET_MARKER) || a.contains(LIMIT_MARKER));
        let mut template =
            ArgTemplate::new(self.args.iter().map(|a| ArgValue::from(a.as_str())).collect());
        if !has_markers {
            template.push(self.offset_flag.as_str());
            template.push(OFFSET_MARKER);
            template.push(self.limit_flag.as_str());
            template.push(LIMIT_MARKER);
        }
        template
    }
}

fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
#[allow(clippy::print_stderr)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    let mut builder = ProcessCommand::new(&args.program);
    if let Some(dir) = &args.working_dir {
        builder = builder.current_dir(dir);
    }

    let mut runner = if args.quiet {
        BatchRunner::new(builder, args.template())
    } else {
        BatchRunner::new(builder, args.template()).with_handler(ProgressBarHandler::new())
    };
    runner.set_batch_size(args.batch_size);
    runner.set_pool_size(args.pool_size);
    runner.set_progress_fd(args.progress_fd);

    let errors = runner.run(args.total).await?;
    if !errors.is_empty() {
        eprintln!("{} worker diagnostic(s):", errors.len());
        for error in &errors {
            eprintln!("  {error}");
        }
    }

    Ok(())
}
