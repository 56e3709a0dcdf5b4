//! Shared utilities for the xbrelay tools: progress reporting, the per-job
//! log file, human formatting and the runtime/tracing harness used by the
//! binary.

pub mod fmt;
pub mod logfile;
pub mod progress;

pub use logfile::{JobLog, Module};
pub use progress::{Progress, ProgressSink};

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
}

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

fn init_tracing(output: &OutputConfig) {
    let level = match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Build the runtime, install the tracing subscriber and run `func` to
/// completion. Returns `None` on failure so binaries can map it to a
/// non-zero exit.
pub fn run<F, Fut, T>(output: &OutputConfig, runtime: &RuntimeConfig, func: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    init_tracing(output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("Error: failed to build runtime: {error}");
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(value) => Some(value),
        Err(error) => {
            if !output.quiet {
                eprintln!("Error: {error:#}");
            }
            None
        }
    }
}
