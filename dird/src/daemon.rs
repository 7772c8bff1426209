//! The scan-and-dispatch loop
//!
//! One [`Daemon::tick`] runs every step whose due time arrived:
//!
//! 1. reread the rule files and rename rules, recompiling when they changed
//! 2. sweep: collect finished workers, delete aged unknown and queued files, check warn times
//! 3. release held files of time jobs whose window arrived
//! 4. check the watched directories for new files
//!
//! Between ticks [`Daemon::run`] waits on the command channel, worker completions, host
//! updates and the shutdown token, whichever comes first.

use anyhow::Context;
use common::dirconfig::{
    CompileError, Compiled, DefaultOptionChecker, JobEntry, OptionChecker, compile, load, store,
};
use common::options::{Batch, PipelineEnv, RenameRules};
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::command::{Command, HostUpdate};
use crate::scan::{
    ChunkReport, Shared, WorkPaths, chunk_files, match_jobs, process_chunk, release_held,
};
use crate::schedule::{Schedule, Step};
use crate::sink::MessageSink;
use crate::slots::{WorkerCompletion, WorkerOutcome, WorkerSlots};
use crate::status::{self, DirState, DirStatus, StatusCell, StatusTable};
use crate::timejobs::TimeJobs;
use crate::worker::WorkerTask;

/// Everything the daemon is started with
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub rule_files: Vec<std::path::PathBuf>,
    pub rename_rules: Option<std::path::PathBuf>,
    /// holds pools, staging directories and holding areas
    pub work_dir: std::path::PathBuf,
    /// where the compiled tables are stored
    pub table_path: std::path::PathBuf,
    /// serialized size above which the table backup is dropped, 0 = unbounded
    pub table_budget: u64,
    pub scan: common::ScanConfig,
    pub compile: common::CompileSettings,
}

impl DaemonConfig {
    /// Defaults with every generated path below `work_dir`.
    pub fn new(rule_files: Vec<std::path::PathBuf>, work_dir: &std::path::Path) -> Self {
        Self {
            rule_files,
            rename_rules: None,
            work_dir: work_dir.to_path_buf(),
            table_path: work_dir.join("job_table.json"),
            table_budget: 10 * 1024 * 1024,
            scan: Default::default(),
            compile: common::CompileSettings {
                spool_root: work_dir.join("spool"),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("invalid settings: {0}")]
    Config(String),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub ticks: usize,
    pub checks: usize,
    pub directories_scanned: usize,
    pub rereads: usize,
    pub compile_warnings: usize,
    pub workers_started: usize,
    pub worker_failures: usize,
    pub files_deleted: usize,
    pub dispatched: ChunkReport,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            ticks: self.ticks + other.ticks,
            checks: self.checks + other.checks,
            directories_scanned: self.directories_scanned + other.directories_scanned,
            rereads: self.rereads + other.rereads,
            compile_warnings: self.compile_warnings + other.compile_warnings,
            workers_started: self.workers_started + other.workers_started,
            worker_failures: self.worker_failures + other.worker_failures,
            files_deleted: self.files_deleted + other.files_deleted,
            dispatched: self.dispatched + other.dispatched,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "ticks: {}\n\
            directory checks: {}\n\
            directories scanned: {}\n\
            rule rereads: {}\n\
            compile warnings: {}\n\
            workers started: {}\n\
            worker failures: {}\n\
            files claimed: {}\n\
            bytes claimed: {}\n\
            jobs sent: {}\n\
            files sent: {}\n\
            bytes sent: {}\n\
            files held: {}\n\
            files queued: {}\n\
            files deleted: {}\n\
            failed pipelines: {}\n\
            {}",
            self.ticks,
            self.checks,
            self.directories_scanned,
            self.rereads,
            self.compile_warnings,
            self.workers_started,
            self.worker_failures,
            self.dispatched.files_claimed,
            bytesize::ByteSize(self.dispatched.bytes_claimed),
            self.dispatched.messages_sent,
            self.dispatched.files_sent,
            bytesize::ByteSize(self.dispatched.bytes_sent),
            self.dispatched.files_held,
            self.dispatched.files_queued,
            self.files_deleted,
            self.dispatched.jobs_failed,
            self.dispatched.pipeline,
        )
    }
}

async fn modified(path: &std::path::Path) -> Option<std::time::SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

async fn rule_stamps(paths: &[std::path::PathBuf]) -> Vec<Option<std::time::SystemTime>> {
    let mut stamps = Vec::with_capacity(paths.len());
    for path in paths {
        stamps.push(modified(path).await);
    }
    stamps
}

fn mtime_secs(metadata: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    metadata.mtime()
}

pub struct Daemon {
    config: DaemonConfig,
    shared: std::sync::Arc<Shared>,
    checker: Box<dyn OptionChecker>,
    compiled: std::sync::Arc<Compiled>,
    statuses: StatusTable,
    time_jobs: TimeJobs,
    slots: WorkerSlots,
    completion_sender: mpsc::UnboundedSender<WorkerCompletion>,
    completions: mpsc::UnboundedReceiver<WorkerCompletion>,
    schedule: Schedule,
    /// directories postponed by a time budget, scanned first on the next check
    retry: std::collections::VecDeque<u32>,
    rule_stamps: Vec<Option<std::time::SystemTime>>,
    rename_stamp: Option<std::time::SystemTime>,
    last_now: i64,
    check_requested: bool,
    cancel: tokio_util::sync::CancellationToken,
    summary: Summary,
}

impl Daemon {
    /// Compiles the rule files, stores the tables and prepares the work directory.
    ///
    /// A host table stored by a previous run is carried over so host settings survive restarts.
    pub async fn new(
        config: DaemonConfig,
        env: PipelineEnv,
        sink: std::sync::Arc<dyn MessageSink>,
        clock: std::sync::Arc<dyn Clock>,
    ) -> Result<Self, DaemonError> {
        config.scan.validate().map_err(DaemonError::Config)?;
        if config.scan.max_workers == 0 {
            tracing::info!("no worker tasks configured, every directory is processed inline");
        }
        let paths = WorkPaths::new(&config.work_dir);
        paths.create().await?;
        let rename_stamp = match &config.rename_rules {
            Some(path) => {
                env.set_rename_rules(RenameRules::load(path).await?);
                modified(path).await
            }
            None => None,
        };
        let previous = match load(&config.table_path) {
            Ok(table) => Some(table.hosts),
            Err(error) => {
                tracing::debug!("starting without a previous host table: {:#}", error);
                None
            }
        };
        let checker: Box<dyn OptionChecker> = Box::new(DefaultOptionChecker);
        let compiled = compile(
            &config.rule_files,
            &config.compile,
            checker.as_ref(),
            previous.as_ref(),
        )?;
        compiled.validate()?;
        store(&compiled, &config.table_path, config.table_budget)?;
        let now = clock.now();
        let rule_stamps = rule_stamps(&config.rule_files).await;
        let statuses = StatusTable::new(&compiled.directories, now);
        let time_jobs = TimeJobs::new(&compiled.jobs, now);
        let (completion_sender, completions) = mpsc::unbounded_channel();
        let summary = Summary {
            compile_warnings: compiled.warning_count(),
            ..Default::default()
        };
        tracing::info!(
            "watching {} directories with {} jobs for {} hosts",
            compiled.directories.len(),
            compiled.jobs.len(),
            compiled.hosts.len()
        );
        Ok(Self {
            schedule: Schedule::new(&config.scan, now),
            slots: WorkerSlots::new(config.scan.max_workers),
            shared: std::sync::Arc::new(Shared::new(env, sink, paths, clock)),
            checker,
            compiled: std::sync::Arc::new(compiled),
            statuses,
            time_jobs,
            completion_sender,
            completions,
            retry: Default::default(),
            rule_stamps,
            rename_stamp,
            last_now: now,
            check_requested: false,
            cancel: tokio_util::sync::CancellationToken::new(),
            summary,
            config,
        })
    }

    pub fn compiled(&self) -> &Compiled {
        &self.compiled
    }

    pub fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn summary(&self) -> Summary {
        self.summary
    }

    pub fn live_workers(&self) -> usize {
        self.slots.live()
    }

    pub fn retry_list(&self) -> Vec<u32> {
        self.retry.iter().copied().collect()
    }

    /// Snapshot of the status of the directory called `alias`.
    pub fn status(&self, alias: &str) -> Option<DirStatus> {
        let index = self
            .compiled
            .directories
            .iter()
            .position(|dir| dir.alias == alias)?;
        self.statuses
            .get(index)
            .map(|cell| status::lock(cell).clone())
    }

    /// Marks the next tick to check every directory regardless of its due time.
    pub fn request_check(&mut self) {
        self.check_requested = true;
    }

    /// Runs every step whose time has come.
    pub async fn tick(&mut self) -> Result<(), DaemonError> {
        let now = self.shared.clock.now();
        if now < self.last_now {
            self.clock_went_backward(now);
        }
        self.last_now = now;
        let due = self.schedule.take_due(now);
        if due.contains(&Step::Reread) {
            self.reread().await?;
        }
        if due.contains(&Step::Sweep) {
            self.sweep().await;
        }
        if due.contains(&Step::TimeJobs) {
            self.run_time_jobs().await;
        }
        if due.contains(&Step::Check) || std::mem::take(&mut self.check_requested) {
            self.check_directories().await;
        }
        self.summary.ticks += 1;
        Ok(())
    }

    fn clock_went_backward(&mut self, now: i64) {
        let clamped = self.statuses.clamp_future(now);
        tracing::warn!(
            "time went backward by {} s, reset the search time of {} directories",
            self.last_now - now,
            clamped
        );
        self.schedule.reset(now);
        self.time_jobs = TimeJobs::new(&self.compiled.jobs, now);
    }

    /// Recompiles when a rule file changed and reloads changed rename rules.
    ///
    /// A failed compile keeps the running tables. A compile producing inconsistent tables, or
    /// tables that cannot be stored, is fatal.
    pub async fn reread(&mut self) -> Result<(), DaemonError> {
        if let Some(path) = &self.config.rename_rules {
            let stamp = modified(path).await;
            if stamp != self.rename_stamp {
                self.rename_stamp = stamp;
                match RenameRules::load(path).await {
                    Ok(rules) => self.shared.env.set_rename_rules(rules),
                    Err(error) => {
                        tracing::warn!("keeping the previous rename rules: {:#}", error);
                    }
                }
            }
        }
        let stamps = rule_stamps(&self.config.rule_files).await;
        if stamps == self.rule_stamps {
            return Ok(());
        }
        self.rule_stamps = stamps;
        tracing::info!("rule files changed, recompiling");
        let compiled = match compile(
            &self.config.rule_files,
            &self.config.compile,
            self.checker.as_ref(),
            Some(&self.compiled.hosts),
        ) {
            Ok(compiled) => compiled,
            Err(error) => {
                tracing::error!("recompile failed, keeping the current tables: {}", error);
                return Ok(());
            }
        };
        compiled.validate()?;
        let stored = store(&compiled, &self.config.table_path, self.config.table_budget)?;
        tracing::debug!("stored {} of job table", bytesize::ByteSize(stored.bytes));
        self.install(compiled);
        Ok(())
    }

    fn install(&mut self, compiled: Compiled) {
        let now = self.shared.clock.now();
        self.statuses = StatusTable::rebuild(&self.statuses, &compiled.directories, now);
        self.time_jobs = self.time_jobs.rebuild(&compiled.jobs, now);
        self.retry
            .retain(|id| compiled.directories.iter().any(|dir| dir.id == *id));
        self.summary.rereads += 1;
        self.summary.compile_warnings += compiled.warning_count();
        tracing::info!(
            "now watching {} directories with {} jobs",
            compiled.directories.len(),
            compiled.jobs.len()
        );
        self.compiled = std::sync::Arc::new(compiled);
    }

    fn dir_error(&mut self, cell: &StatusCell, alias: &str, message: &str) {
        let crossed = status::lock(cell).record_error(self.config.scan.max_errors);
        if crossed {
            tracing::error!(
                "{}: {} consecutive errors, last: {}",
                alias,
                self.config.scan.max_errors,
                message
            );
        } else {
            tracing::warn!("{}: {}", alias, message);
        }
    }

    fn on_completion(&mut self, done: WorkerCompletion) {
        self.slots.release(done.worker_id, done.generation);
        self.summary.dispatched = self.summary.dispatched + done.report;
        let Some(cell) = self.statuses.by_id(done.dir_id) else {
            tracing::debug!("worker {} finished for a removed directory", done.worker_id);
            return;
        };
        let alias = self
            .compiled
            .directories
            .iter()
            .find(|dir| dir.id == done.dir_id)
            .map(|dir| dir.alias.clone())
            .unwrap_or_default();
        match done.outcome {
            WorkerOutcome::Done => status::lock(&cell).record_success(),
            WorkerOutcome::Cancelled => tracing::debug!("worker {} was cancelled", done.worker_id),
            WorkerOutcome::Failed(message) => {
                self.summary.worker_failures += 1;
                self.dir_error(&cell, &alias, &message);
            }
        }
        if self.slots.live_for(done.dir_id) == 0 {
            let mut status = status::lock(&cell);
            if status.state == DirState::Active {
                status.state = DirState::Idle;
            }
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(done) = self.completions.try_recv() {
            self.on_completion(done);
        }
    }

    /// Frees slots of workers that ended without reporting.
    async fn reap_workers(&mut self) {
        self.drain_completions();
        for (worker_id, dir_id, result) in self.slots.reap().await {
            let Err(error) = result else {
                // its completion was sent after the drain above and releases nothing
                tracing::debug!("worker {} finished, completion pending", worker_id);
                continue;
            };
            self.summary.worker_failures += 1;
            let message = format!("worker {} died: {}", worker_id, error);
            match self.statuses.by_id(dir_id) {
                Some(cell) => self.dir_error(&cell, &format!("{:08x}", dir_id), &message),
                None => tracing::error!("{}", message),
            }
        }
    }

    /// Blocks until every live worker reported back.
    pub async fn wait_for_workers(&mut self) {
        self.drain_completions();
        while self.slots.live() > 0 {
            match tokio::time::timeout(std::time::Duration::from_secs(1), self.completions.recv())
                .await
            {
                Ok(Some(done)) => self.on_completion(done),
                Ok(None) => break,
                Err(_) => self.reap_workers().await,
            }
        }
    }

    /// Deletes aged files, checks warn times and retries failed hand-offs.
    pub async fn sweep(&mut self) {
        self.reap_workers().await;
        let compiled = self.compiled.clone();
        for job in compiled.jobs.iter() {
            if job.schedules.is_empty() && !self.shared.is_paused(&job.host_alias) {
                self.release_queue(job).await;
            }
        }
        let now = self.shared.clock.now();
        for (dir_index, dir) in compiled.directories.iter().enumerate() {
            if let Some(max_age) = dir.options.delete_unknown_files {
                match crate::sweep::delete_unknown(&self.shared, &compiled, dir_index, max_age)
                    .await
                {
                    Ok(deleted) => self.summary.files_deleted += deleted,
                    Err(error) => tracing::warn!("{}: sweep failed: {:#}", dir.alias, error),
                }
            }
            if let Some(max_age) = dir.options.delete_queued_files {
                match crate::sweep::delete_queued(&self.shared, &compiled, dir_index, max_age)
                    .await
                {
                    Ok(deleted) => self.summary.files_deleted += deleted,
                    Err(error) => tracing::warn!("{}: queue sweep failed: {:#}", dir.alias, error),
                }
            }
            if let Some(cell) = self.statuses.get(dir_index) {
                crate::sweep::check_warn_time(
                    &dir.alias,
                    dir.options.warn_time,
                    &mut status::lock(cell),
                    now,
                );
            }
        }
    }

    /// Sends the held files of every time job whose window arrived.
    pub async fn run_time_jobs(&mut self) {
        let compiled = self.compiled.clone();
        let now = self.shared.clock.now();
        for job_index in self.time_jobs.take_due(&compiled.jobs, now) {
            let Some(job) = compiled.jobs.get(job_index) else {
                continue;
            };
            let hold = self.shared.paths.time_hold(job.job_id);
            match release_held(&self.shared, job, &hold).await {
                Ok(report) => self.summary.dispatched = self.summary.dispatched + report,
                Err(error) => {
                    tracing::warn!("job {:08x}: time window missed: {:#}", job.job_id, error)
                }
            }
        }
    }

    /// Pauses or resumes a host; resuming releases its queued files.
    pub async fn on_host_update(&mut self, update: HostUpdate) {
        if !self.shared.set_paused(&update.alias, update.paused) {
            return;
        }
        if update.paused {
            tracing::info!("host {} paused", update.alias);
            return;
        }
        tracing::info!("host {} resumed", update.alias);
        let compiled = self.compiled.clone();
        for job in compiled.jobs.iter().filter(|job| job.host_alias == update.alias) {
            if !job.schedules.is_empty() {
                continue;
            }
            self.release_queue(job).await;
        }
    }

    async fn release_queue(&mut self, job: &JobEntry) {
        let hold = self.shared.paths.queue_hold(job.job_id);
        match release_held(&self.shared, job, &hold).await {
            Ok(report) => self.summary.dispatched = self.summary.dispatched + report,
            Err(error) => tracing::warn!(
                "job {:08x}: queued files not released: {:#}",
                job.job_id,
                error
            ),
        }
    }

    /// One pass over all directories, bounded by the full scan timeout.
    ///
    /// Directories on the retry list go first. Whatever the budget does not cover is put on
    /// the retry list for the next pass.
    pub async fn check_directories(&mut self) {
        self.drain_completions();
        let compiled = self.compiled.clone();
        let started = std::time::Instant::now();
        let full_deadline = started + self.config.scan.full_scan_timeout;
        let mut order: Vec<usize> = self
            .retry
            .iter()
            .filter_map(|id| compiled.directories.iter().position(|dir| dir.id == *id))
            .collect();
        for dir_index in 0..compiled.directories.len() {
            if !order.contains(&dir_index) {
                order.push(dir_index);
            }
        }
        for (position, &dir_index) in order.iter().enumerate() {
            let now = std::time::Instant::now();
            if now >= full_deadline {
                let postponed = &order[position..];
                tracing::warn!(
                    "full scan took longer than {}, {} directories postponed",
                    humantime::format_duration(self.config.scan.full_scan_timeout),
                    postponed.len()
                );
                for &index in postponed {
                    let id = compiled.directories[index].id;
                    if !self.retry.contains(&id) {
                        self.retry.push_back(id);
                    }
                }
                break;
            }
            let deadline = full_deadline.min(now + self.config.scan.one_dir_copy_timeout);
            self.check_directory(&compiled, dir_index, deadline).await;
        }
        self.summary.checks += 1;
    }

    async fn check_directory(
        &mut self,
        compiled: &std::sync::Arc<Compiled>,
        dir_index: usize,
        deadline: std::time::Instant,
    ) {
        let Some(dir) = compiled.directories.get(dir_index) else {
            return;
        };
        let Some(cell) = self.statuses.get(dir_index).cloned() else {
            return;
        };
        if !status::lock(&cell).is_enabled() || self.slots.live_for(dir.id) > 0 {
            return;
        }
        let path = dir.scan_path();
        let mtime = match tokio::fs::metadata(path).await {
            Ok(metadata) => mtime_secs(&metadata),
            Err(error) => {
                self.dir_error(&cell, &dir.alias, &format!("cannot stat {:?}: {}", path, error));
                return;
            }
        };
        // files rewritten in place leave the directory mtime alone
        let always = self.retry.contains(&dir.id) || dir.options.do_not_remove;
        {
            let mut status = status::lock(&cell);
            if !always && !status.needs_scan(mtime) {
                return;
            }
            status.search_time = mtime;
            status.scanned_at = self.shared.clock.now();
            status.state = DirState::Active;
        }
        self.retry.retain(|id| *id != dir.id);
        self.summary.directories_scanned += 1;
        let listing = match Batch::from_dir(path).await {
            Ok(listing) => listing,
            Err(error) => {
                self.dir_error(&cell, &dir.alias, &format!("{:#}", error));
                status::lock(&cell).state = DirState::Idle;
                return;
            }
        };
        if dir.options.do_not_remove {
            status::lock(&cell)
                .retrieved
                .retain(|name, _| listing.position(name).is_some());
        }
        let wanted: Vec<_> = listing
            .files
            .into_iter()
            .filter(|file| !match_jobs(compiled, dir_index, &file.name).is_empty())
            .collect();
        let max_files = dir
            .options
            .max_files
            .unwrap_or(self.config.scan.max_copied_files);
        let max_size = dir
            .options
            .max_size
            .unwrap_or(self.config.scan.max_copied_size);
        let chunks = chunk_files(wanted, max_files, max_size);
        if chunks.len() > 1 {
            let available = self.slots.available_for(dir.id, dir.options.max_process);
            if available > 0 {
                self.start_workers(compiled, dir_index, &cell, chunks, available);
                return;
            }
            tracing::debug!(
                "{}: {} chunks but no free worker slot, processing inline",
                dir.alias,
                chunks.len()
            );
        }
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            match process_chunk(&self.shared, compiled, dir_index, &cell, chunk).await {
                Ok(report) => {
                    self.summary.dispatched = self.summary.dispatched + report;
                    status::lock(&cell).record_success();
                }
                Err(error) => {
                    self.dir_error(&cell, &dir.alias, &format!("{:#}", error));
                    break;
                }
            }
            let left = total - index - 1;
            if left > 0 && std::time::Instant::now() >= deadline {
                tracing::info!("{}: time budget used up with {} chunks left", dir.alias, left);
                self.retry.push_back(dir.id);
                break;
            }
        }
        status::lock(&cell).state = DirState::Idle;
    }

    /// Spreads `chunks` over up to `count` new workers.
    fn start_workers(
        &mut self,
        compiled: &std::sync::Arc<Compiled>,
        dir_index: usize,
        cell: &StatusCell,
        chunks: Vec<Vec<common::options::BatchFile>>,
        count: usize,
    ) {
        let Some(dir) = compiled.directories.get(dir_index) else {
            return;
        };
        let count = count.min(chunks.len()).max(1);
        let mut shares: Vec<Vec<_>> = (0..count).map(|_| Vec::new()).collect();
        for (index, chunk) in chunks.into_iter().enumerate() {
            if let Some(share) = shares.get_mut(index % count) {
                share.push(chunk);
            }
        }
        for share in shares {
            let Some((worker_id, generation)) = self.slots.reserve() else {
                break;
            };
            let task = WorkerTask {
                worker_id,
                generation,
                dir_id: dir.id,
                dir_index,
                shared: self.shared.clone(),
                compiled: compiled.clone(),
                status: cell.clone(),
                chunks: share,
                cancel: self.cancel.clone(),
                completions: self.completion_sender.clone(),
            };
            self.slots
                .attach(worker_id, generation, dir.id, tokio::spawn(task.run()));
            self.summary.workers_started += 1;
            tracing::debug!("{}: started worker {}", dir.alias, worker_id);
        }
    }

    pub fn report_exec_stats(&self) -> common::options::ExecReport {
        let report = self.shared.env.exec_stats.report();
        tracing::info!("{}", report);
        report
    }

    /// Acts on one command byte; returns false on shutdown.
    pub async fn handle_command(&mut self, byte: u8) -> Result<bool, DaemonError> {
        match Command::from_byte(byte) {
            Some(Command::Shutdown) => {
                tracing::info!("shutdown command received");
                return Ok(false);
            }
            Some(Command::CheckNow) => self.request_check(),
            Some(Command::ExecStats) => {
                self.report_exec_stats();
            }
            None => return Err(DaemonError::UnknownCommand(byte)),
        }
        Ok(true)
    }

    /// Cancels the workers, waits for them and flushes the logs.
    pub async fn shutdown(mut self) -> Result<Summary, DaemonError> {
        self.cancel.cancel();
        for (worker_id, _, result) in self.slots.join_all().await {
            if let Err(error) = result {
                self.summary.worker_failures += 1;
                tracing::error!("worker {} died during shutdown: {}", worker_id, error);
            }
        }
        self.drain_completions();
        self.shared
            .env
            .production_log
            .flush()
            .await
            .context("failed to flush the production log")?;
        self.shared
            .env
            .delete_log
            .flush()
            .await
            .context("failed to flush the delete log")?;
        tracing::info!("shutdown complete");
        Ok(self.summary)
    }

    /// Ticks until a shutdown command, a cancelled `shutdown` token or a fatal error.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<u8>,
        mut host_updates: mpsc::Receiver<HostUpdate>,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Result<Summary, DaemonError> {
        loop {
            if let Err(error) = self.tick().await {
                // workers still get to finish what they claimed
                let _ = self.shutdown().await;
                return Err(error);
            }
            let wait = self
                .schedule
                .until_next(self.shared.clock.now())
                .max(std::time::Duration::from_millis(10));
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown signal received");
                    break;
                }
                Some(byte) = commands.recv() => {
                    match self.handle_command(byte).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(error) => {
                            let _ = self.shutdown().await;
                            return Err(error);
                        }
                    }
                }
                Some(done) = self.completions.recv() => self.on_completion(done),
                Some(update) = host_updates.recv() => self.on_host_update(update).await,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_add_up() {
        let a = Summary {
            ticks: 1,
            workers_started: 2,
            dispatched: ChunkReport {
                files_sent: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let total = a + a;
        assert_eq!(total.ticks, 2);
        assert_eq!(total.workers_started, 4);
        assert_eq!(total.dispatched.files_sent, 6);
        assert!(total.to_string().contains("files sent: 6"));
    }

    #[tokio::test]
    async fn unknown_command_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        crate::testutils::compile_rules(tmp.path(), "[destination]\n[recipient]\nfile:///tmp/x\n");
        let config = DaemonConfig::new(vec![tmp.path().join("rules")], &tmp.path().join("work"));
        let mut daemon = Daemon::new(
            config,
            PipelineEnv::default(),
            std::sync::Arc::new(crate::sink::MemorySink::default()),
            std::sync::Arc::new(crate::clock::SystemClock),
        )
        .await
        .unwrap();
        assert!(daemon.handle_command(Command::CheckNow.byte()).await.unwrap());
        assert!(!daemon.handle_command(Command::Shutdown.byte()).await.unwrap());
        assert!(matches!(
            daemon.handle_command(0x42).await,
            Err(DaemonError::UnknownCommand(0x42))
        ));
    }
}
