use anyhow::Context;
use clap::Parser;

fn parse_mode(value: &str) -> Result<u32, String> {
    u32::from_str_radix(value, 8).map_err(|error| format!("invalid octal mode '{}': {}", value, error))
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "fdist-dird",
    version,
    about = "Watch directories and dispatch newly arrived files as transfer jobs",
    long_about = "`fdist-dird` watches the directories named in the rule files and hands every new
file to the jobs whose file filters want it. Each job runs its local options (rename, exec,
convert, ...) in a staging directory before the job is appended to the queue file for the
transfer layer.

Single-byte commands can be written to the command FIFO:
    0x01 - shut down
    0x02 - check all directories now
    0x03 - log exec statistics

EXIT CODES:
    0 - Orderly shutdown
    1 - Fatal error

EXAMPLES:
    # Watch the directories of two rule files
    fdist-dird --rules /etc/fdist/dir.rules --rules /etc/fdist/extra.rules --work-dir /var/spool/fdist

    # Distribute what is there now and exit
    fdist-dird --rules dir.rules --work-dir work --once --summary"
)]
struct Args {
    // Rules
    /// Rule file describing watched directories; may be given several times
    #[arg(long = "rules", required = true, value_name = "PATH", help_heading = "Rules")]
    rules: Vec<std::path::PathBuf>,

    /// File with the named rename rules used by the `rename` option
    #[arg(long, value_name = "PATH", help_heading = "Rules")]
    rename_rules: Option<std::path::PathBuf>,

    /// Priority of jobs without a `priority` option
    #[arg(long, default_value = "9", value_name = "DIGIT", value_parser = clap::value_parser!(u8).range(0..=9), help_heading = "Rules")]
    default_priority: u8,

    /// Do not create missing local source directories; such directories are dropped
    #[arg(long, help_heading = "Rules")]
    no_create_source_dir: bool,

    /// Mode of created source directories
    #[arg(long, default_value = "755", value_name = "OCTAL", value_parser = parse_mode, help_heading = "Rules")]
    source_dir_mode: u32,

    /// Drop hosts no recipient refers to anymore when recompiling
    #[arg(long, help_heading = "Rules")]
    remove_unused_hosts: bool,

    /// Default bound on workers per directory
    #[arg(long, default_value = "3", value_name = "N", help_heading = "Rules")]
    default_max_process: usize,

    /// Default age after which files no job wants are deleted, 0 keeps them
    ///
    /// This option accepts a human readable duration, e.g. "12h", "2days" etc.
    #[arg(long, default_value = "0s", value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Rules")]
    default_delete_unknown: std::time::Duration,

    /// Default time without new files after which a directory is reported, 0 disables
    #[arg(long, default_value = "0s", value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Rules")]
    default_warn_time: std::time::Duration,

    // Scanning
    /// How often directories are checked for new files
    #[arg(long, default_value = "5s", value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Scanning")]
    check_interval: std::time::Duration,

    /// How often rule files are checked for changes
    #[arg(long, default_value = "10s", value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Scanning")]
    reread_interval: std::time::Duration,

    /// How often finished workers are collected and old files deleted
    #[arg(long, default_value = "1h", value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Scanning")]
    sweep_interval: std::time::Duration,

    /// Upper bound of one pass over all directories
    #[arg(long, default_value = "30s", value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Scanning")]
    full_scan_timeout: std::time::Duration,

    /// Upper bound spent on one directory within a pass
    #[arg(long, default_value = "10s", value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Scanning")]
    one_dir_timeout: std::time::Duration,

    /// Files per chunk; directories holding more are handed to worker tasks
    #[arg(long, default_value = "100", value_name = "N", help_heading = "Scanning")]
    max_copied_files: usize,

    /// Bytes per chunk; directories holding more are handed to worker tasks
    #[arg(long, default_value = "100MiB", value_name = "SIZE", help_heading = "Scanning")]
    max_copied_size: bytesize::ByteSize,

    /// Bound on concurrent worker tasks, 0 processes everything inline
    #[arg(long, default_value = "10", value_name = "N", help_heading = "Scanning")]
    max_process: usize,

    /// Consecutive errors after which a directory is flagged
    #[arg(long, default_value = "10", value_name = "N", help_heading = "Scanning")]
    max_errors: u32,

    /// Check all directories once, wait for the workers and exit
    #[arg(long, help_heading = "Scanning")]
    once: bool,

    // Files & interfaces
    /// Work directory for pools, staging directories and holding areas
    #[arg(long, value_name = "PATH", help_heading = "Files & interfaces")]
    work_dir: std::path::PathBuf,

    /// Where the compiled tables are stored, defaults to `<work dir>/job_table.json`
    #[arg(long, value_name = "PATH", help_heading = "Files & interfaces")]
    table_path: Option<std::path::PathBuf>,

    /// Stored table size above which its backup is dropped, 0 means no limit
    #[arg(long, default_value = "10MiB", value_name = "SIZE", help_heading = "Files & interfaces")]
    table_budget: bytesize::ByteSize,

    /// Queue file receiving one JSON line per job, defaults to `<work dir>/messages.jsonl`
    #[arg(long, value_name = "PATH", help_heading = "Files & interfaces")]
    queue_file: Option<std::path::PathBuf>,

    /// Command FIFO, created when missing
    #[arg(long, value_name = "PATH", help_heading = "Files & interfaces")]
    fifo: Option<std::path::PathBuf>,

    /// Log of files options turned into other files
    #[arg(long, value_name = "PATH", help_heading = "Files & interfaces")]
    production_log: Option<std::path::PathBuf>,

    /// Log of files deleted without being sent
    #[arg(long, value_name = "PATH", help_heading = "Files & interfaces")]
    delete_log: Option<std::path::PathBuf>,

    /// Directory receiving files that failed an `exec -s` option
    #[arg(long, value_name = "PATH", help_heading = "Files & interfaces")]
    error_store: Option<std::path::PathBuf>,

    // Output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: WARN)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
    quiet: bool,

    /// Append log events to this file as well
    #[arg(long, value_name = "PATH", help_heading = "Output")]
    log_file: Option<std::path::PathBuf>,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Advanced settings")]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Advanced settings")]
    max_blocking_threads: usize,
}

impl Args {
    fn daemon_config(&self) -> dird::DaemonConfig {
        let mut config = dird::DaemonConfig::new(self.rules.clone(), &self.work_dir);
        config.rename_rules = self.rename_rules.clone();
        if let Some(table_path) = &self.table_path {
            config.table_path = table_path.clone();
        }
        config.table_budget = self.table_budget.0;
        config.scan = common::ScanConfig {
            check_interval: self.check_interval,
            reread_interval: self.reread_interval,
            sweep_interval: self.sweep_interval,
            full_scan_timeout: self.full_scan_timeout,
            one_dir_copy_timeout: self.one_dir_timeout,
            max_copied_files: self.max_copied_files,
            max_copied_size: self.max_copied_size.0,
            max_workers: self.max_process,
            max_errors: self.max_errors,
        };
        config.compile.default_priority = self.default_priority;
        config.compile.create_source_dir = !self.no_create_source_dir;
        config.compile.source_dir_mode = self.source_dir_mode;
        config.compile.remove_unused_hosts = self.remove_unused_hosts;
        config.compile.default_max_process = self.default_max_process;
        config.compile.default_delete_unknown = self.default_delete_unknown.as_secs();
        config.compile.default_warn_time = self.default_warn_time.as_secs();
        config
    }
}

async fn wait_for_signal(shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install the SIGTERM handler")?;
    tokio::select! {
        _ = terminate.recv() => tracing::info!("SIGTERM received"),
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = shutdown.cancelled() => return Ok(()),
    }
    shutdown.cancel();
    Ok(())
}

async fn async_main(args: Args) -> Result<dird::Summary, dird::DaemonError> {
    tracing::info!(
        "fdist-dird {} starting",
        common::version::BuildVersion::current().display()
    );
    let env = common::options::PipelineEnv::new(
        common::log::LineLog::open(args.production_log.as_deref()).await?,
        common::log::LineLog::open(args.delete_log.as_deref()).await?,
        args.error_store.clone(),
    );
    let queue_file = args
        .queue_file
        .clone()
        .unwrap_or_else(|| args.work_dir.join("messages.jsonl"));
    let sink = std::sync::Arc::new(dird::sink::QueueFileSink::open(&queue_file).await?);
    let mut daemon = dird::Daemon::new(
        args.daemon_config(),
        env,
        sink,
        std::sync::Arc::new(dird::clock::SystemClock),
    )
    .await?;
    if args.once {
        daemon.check_directories().await;
        daemon.wait_for_workers().await;
        return daemon.shutdown().await;
    }
    let shutdown = tokio_util::sync::CancellationToken::new();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));
    let (command_sender, commands) = tokio::sync::mpsc::channel(16);
    let fifo_task = match &args.fifo {
        Some(fifo) => {
            dird::command::ensure_fifo(fifo)?;
            let fifo = fifo.clone();
            let shutdown = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(error) =
                    dird::command::read_fifo(&fifo, command_sender, shutdown.clone()).await
                {
                    tracing::error!("command FIFO failed: {:#}", error);
                    shutdown.cancel();
                }
            }))
        }
        None => None,
    };
    // host pause/resume comes from the transfer layer, which is not part of this binary
    let (_host_sender, host_updates) = tokio::sync::mpsc::channel(16);
    let result = daemon.run(commands, host_updates, shutdown.clone()).await;
    shutdown.cancel();
    if let Some(fifo_task) = fifo_task {
        let _ = fifo_task.await;
    }
    match signals.await {
        Ok(Err(error)) => tracing::warn!("{:#}", error),
        Err(error) => tracing::warn!("signal task failed: {}", error),
        Ok(Ok(())) => {}
    }
    result
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let tracing = common::TracingConfig {
        log_file: args.log_file.clone(),
    };
    let res = common::run(output, runtime, tracing, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
