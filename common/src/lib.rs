//! Shared library for the fdist file distribution tools.
//!
//! The crate holds everything the daemon (`fdist-dird`) and the `furl` helper have in common:
//!
//! - [`url`] parses, compares and rewrites recipient URLs
//! - [`dirconfig`] compiles rule files into directory, job and host tables
//! - [`options`] runs the per-job local option pipeline over a staging batch
//! - [`filter`] matches file names against file-group filters
//! - [`log`] writes the production and delete line logs
//!
//! [`run`] wraps an async entry point with runtime setup and logging, the same way for every
//! binary in the workspace.

#[macro_use]
mod bits;

pub mod config;
pub mod dirconfig;
pub mod filter;
pub mod log;
pub mod options;
pub mod url;
pub mod version;

#[cfg(test)]
pub mod testutils;

pub use config::{
    CompileSettings, OutputConfig, RuntimeConfig, ScanConfig, TracingConfig,
};

use anyhow::Context;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn default_level(output: &OutputConfig) -> &'static str {
    if output.quiet {
        return "off";
    }
    match output.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` overrides the level derived from `--verbose`/`--quiet`. When a log file is
/// configured every event is also appended to it without ANSI colors.
pub fn init_logging(output: &OutputConfig, tracing: &TracingConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level(output)));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let file_layer = match &tracing.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .boxed(),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install the tracing subscriber")?;
    Ok(())
}

/// Builds the tokio runtime, installs logging and drives `func` to completion.
///
/// Returns `None` when anything failed; the error has been reported by then, so callers only
/// need to pick an exit code.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display + std::fmt::Debug,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    if let Err(error) = init_logging(&output, &tracing) {
        if !output.quiet {
            eprintln!("{:#}", error);
        }
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(error) => {
            tracing::error!("failed to start the tokio runtime: {}", error);
            return None;
        }
    };
    let res = rt.block_on(func());
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{}", summary);
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            if !output.quiet {
                eprintln!("{:#}", error);
            }
            None
        }
    }
}
