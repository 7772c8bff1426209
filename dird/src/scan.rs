//! Moving new files out of watched directories and into per-job staging areas
//!
//! A file is claimed by renaming it into the directory's pool (copying it for `do not remove`
//! directories). Claiming is atomic, so a file listed by two scans is only taken once; the
//! loser sees `NotFound` and moves on. From the pool every job whose filter wants the file gets
//! a hard link in its own staging directory, where the option pipeline runs before the staging
//! directory is handed to the [`MessageSink`](crate::sink::MessageSink).

use anyhow::{Context, Result};
use common::dirconfig::{Compiled, JobEntry};
use common::options::{Batch, BatchFile, PipelineContext, PipelineEnv};
use tracing::instrument;

use crate::clock::Clock;
use crate::sink::{JobMessage, MessageSink};
use crate::status::{self, RetrievedFile, StatusCell};

/// Layout of the daemon's work directory
#[derive(Debug, Clone)]
pub struct WorkPaths {
    root: std::path::PathBuf,
}

impl WorkPaths {
    pub fn new(root: &std::path::Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Claimed files of one directory waiting to be linked to their jobs.
    pub fn pool(&self, dir_id: u32) -> std::path::PathBuf {
        self.root.join("pool").join(format!("{:08x}", dir_id))
    }

    /// Staging directories handed to the transfer layer.
    pub fn outgoing(&self) -> std::path::PathBuf {
        self.root.join("outgoing")
    }

    /// Files of a scheduled job waiting for its time window.
    pub fn time_hold(&self, job_id: u32) -> std::path::PathBuf {
        self.root.join("time").join(format!("{:08x}", job_id))
    }

    /// Files of a job whose host is paused.
    pub fn queue_hold(&self, job_id: u32) -> std::path::PathBuf {
        self.root.join("queue").join(format!("{:08x}", job_id))
    }

    pub async fn create(&self) -> Result<()> {
        for dir in ["pool", "outgoing", "time", "queue"] {
            let path = self.root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .with_context(|| format!("failed to create work directory {:?}", path))?;
        }
        Ok(())
    }
}

/// State every dispatch needs, shared by the dispatcher and its workers
#[derive(Debug)]
pub struct Shared {
    pub env: PipelineEnv,
    pub sink: std::sync::Arc<dyn MessageSink>,
    pub paths: WorkPaths,
    pub clock: std::sync::Arc<dyn Clock>,
    paused_hosts: std::sync::Mutex<std::collections::HashSet<String>>,
    sequence: std::sync::atomic::AtomicU32,
}

impl Shared {
    pub fn new(
        env: PipelineEnv,
        sink: std::sync::Arc<dyn MessageSink>,
        paths: WorkPaths,
        clock: std::sync::Arc<dyn Clock>,
    ) -> Self {
        Self {
            env,
            sink,
            paths,
            clock,
            paused_hosts: Default::default(),
            sequence: Default::default(),
        }
    }

    pub fn is_paused(&self, host_alias: &str) -> bool {
        self.paused_hosts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(host_alias)
    }

    /// Returns whether the pause state changed.
    pub fn set_paused(&self, host_alias: &str, paused: bool) -> bool {
        let mut hosts = self
            .paused_hosts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if paused {
            hosts.insert(host_alias.to_string())
        } else {
            hosts.remove(host_alias)
        }
    }

    async fn new_staging(&self, job: &JobEntry) -> Result<std::path::PathBuf> {
        let sequence = self
            .sequence
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let name = format!(
            "{}_{:x}_{:04x}_{:08x}",
            job.priority,
            self.clock.now(),
            sequence & 0xffff,
            job.job_id
        );
        let staging = self.paths.outgoing().join(name);
        tokio::fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("failed to create staging directory {:?}", staging))?;
        Ok(staging)
    }
}

/// What processing one chunk of files achieved
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub files_claimed: usize,
    pub bytes_claimed: u64,
    pub messages_sent: usize,
    pub files_sent: usize,
    pub bytes_sent: u64,
    /// parked for a time window
    pub files_held: usize,
    /// parked because the host is paused or the hand-off failed
    pub files_queued: usize,
    pub jobs_failed: usize,
    pub pipeline: common::options::Summary,
}

impl std::ops::Add for ChunkReport {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_claimed: self.files_claimed + other.files_claimed,
            bytes_claimed: self.bytes_claimed + other.bytes_claimed,
            messages_sent: self.messages_sent + other.messages_sent,
            files_sent: self.files_sent + other.files_sent,
            bytes_sent: self.bytes_sent + other.bytes_sent,
            files_held: self.files_held + other.files_held,
            files_queued: self.files_queued + other.files_queued,
            jobs_failed: self.jobs_failed + other.jobs_failed,
            pipeline: self.pipeline + other.pipeline,
        }
    }
}

/// Jobs of the directory whose filter wants `name`.
pub fn match_jobs(compiled: &Compiled, dir_index: usize, name: &str) -> Vec<usize> {
    compiled
        .jobs
        .dir_range(dir_index)
        .filter(|&index| {
            compiled
                .jobs
                .get(index)
                .is_some_and(|job| job.filter.is_match(name))
        })
        .collect()
}

/// Splits files into chunks of at most `max_files` files and `max_size` bytes.
///
/// A file larger than `max_size` still forms a chunk of its own.
pub fn chunk_files(files: Vec<BatchFile>, max_files: usize, max_size: u64) -> Vec<Vec<BatchFile>> {
    let max_files = max_files.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<BatchFile> = Vec::new();
    let mut current_size = 0;
    for file in files {
        let full = current.len() >= max_files
            || (!current.is_empty() && current_size + file.size > max_size);
        if full {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += file.size;
        current.push(file);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Links `from` to `to`, replacing `to`; falls back to copying across filesystems.
async fn link_file(from: &std::path::Path, to: &std::path::Path) -> Result<()> {
    match tokio::fs::remove_file(to).await {
        Ok(()) => tracing::debug!("replacing {:?}", to),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => {
            return Err(error).with_context(|| format!("failed to replace {:?}", to));
        }
    }
    if let Err(error) = tokio::fs::hard_link(from, to).await {
        tracing::debug!("cannot link {:?} to {:?} ({}), copying", from, to, error);
        tokio::fs::copy(from, to)
            .await
            .with_context(|| format!("failed copying {:?} to {:?}", from, to))?;
    }
    Ok(())
}

async fn remove_staging(staging: &std::path::Path) {
    if let Err(error) = tokio::fs::remove_dir_all(staging).await {
        tracing::warn!("failed to remove staging directory {:?}: {}", staging, error);
    }
}

/// Runs the option pipeline over a filled staging directory and hands the result off.
///
/// A staging directory the pipeline emptied is removed without sending anything.
pub async fn send_staging(
    shared: &Shared,
    job: &JobEntry,
    staging: std::path::PathBuf,
) -> Result<ChunkReport> {
    let mut report = ChunkReport::default();
    let batch = Batch::from_dir(&staging).await?;
    let mut ctx = PipelineContext::new(&shared.env, job, staging.clone(), batch);
    match common::options::apply(&mut ctx).await {
        Ok(summary) => report.pipeline = summary,
        Err(error) => {
            tracing::warn!("job {:08x}: option pipeline failed: {}", job.job_id, error);
            report.pipeline = error.summary;
            report.jobs_failed += 1;
            remove_staging(&staging).await;
            return Ok(report);
        }
    }
    let batch = ctx.batch;
    if batch.is_empty() {
        tracing::debug!("job {:08x}: nothing left to send", job.job_id);
        remove_staging(&staging).await;
        return Ok(report);
    }
    let name = staging
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let message = JobMessage {
        name,
        job_id: job.job_id,
        dir_id: job.dir_id,
        dir_alias: job.dir_alias.clone(),
        priority: job.priority,
        recipient: job.recipient.clone(),
        host_alias: job.host_alias.clone(),
        staging,
        files: batch.names().map(str::to_string).collect(),
        total_size: batch.total_size(),
        standard_options: job.standard_options.clone(),
        created: shared.clock.now(),
    };
    shared
        .sink
        .send(message)
        .await
        .with_context(|| format!("failed to hand off job {:08x}", job.job_id))?;
    tracing::info!(
        "job {:08x}: {} files ({}) for {}",
        job.job_id,
        batch.len(),
        bytesize::ByteSize(batch.total_size()),
        job.host_alias
    );
    report.messages_sent += 1;
    report.files_sent += batch.len();
    report.bytes_sent += batch.total_size();
    Ok(report)
}

/// Sends whatever waits in a time or queue holding area of `job`.
pub async fn release_held(
    shared: &Shared,
    job: &JobEntry,
    hold: &std::path::Path,
) -> Result<ChunkReport> {
    if !tokio::fs::try_exists(hold).await.unwrap_or(false) {
        return Ok(ChunkReport::default());
    }
    let held = Batch::from_dir(hold).await?;
    if held.is_empty() {
        return Ok(ChunkReport::default());
    }
    let staging = shared.new_staging(job).await?;
    // held files go away only once the job was handed off
    let sent = async {
        for name in held.names() {
            link_file(&hold.join(name), &staging.join(name)).await?;
        }
        tracing::info!(
            "job {:08x}: releasing {} held files from {:?}",
            job.job_id,
            held.len(),
            hold
        );
        Ok::<ChunkReport, anyhow::Error>(send_staging(shared, job, staging.clone()).await?)
    };
    let report = match sent.await {
        Ok(report) => report,
        Err(error) => {
            remove_staging(&staging).await;
            return Err(error);
        }
    };
    for name in held.names() {
        if let Err(error) = tokio::fs::remove_file(hold.join(name)).await {
            tracing::warn!("failed to remove {:?} from {:?}: {}", name, hold, error);
        }
    }
    Ok(report)
}

/// Where files of `job` wait when handing them off failed.
fn fallback_hold(shared: &Shared, job: &JobEntry) -> std::path::PathBuf {
    if job.schedules.is_empty() {
        shared.paths.queue_hold(job.job_id)
    } else {
        shared.paths.time_hold(job.job_id)
    }
}

/// Keeps the pool files `names` for `job` after its dispatch failed; returns how many were kept.
///
/// Queued files are retried by the next sweep, held files go with the next time window.
async fn park_failed(
    shared: &Shared,
    job: &JobEntry,
    pool: &std::path::Path,
    names: &[&str],
) -> usize {
    let hold = fallback_hold(shared, job);
    if let Err(error) = tokio::fs::create_dir_all(&hold).await {
        tracing::error!(
            "job {:08x}: {} files lost, cannot create {:?}: {}",
            job.job_id,
            names.len(),
            hold,
            error
        );
        return 0;
    }
    let mut parked = 0;
    for name in names {
        match link_file(&pool.join(name), &hold.join(name)).await {
            Ok(()) => parked += 1,
            Err(error) => tracing::error!("job {:08x}: {} lost: {:#}", job.job_id, name, error),
        }
    }
    parked
}

/// Places the claimed `names` of the pool where `job` wants them.
async fn dispatch(
    shared: &Shared,
    job: &JobEntry,
    pool: &std::path::Path,
    names: &[&str],
) -> Result<ChunkReport> {
    let mut report = ChunkReport::default();
    let hold = if !job.schedules.is_empty() {
        report.files_held = names.len();
        Some(shared.paths.time_hold(job.job_id))
    } else if shared.is_paused(&job.host_alias) {
        report.files_queued = names.len();
        Some(shared.paths.queue_hold(job.job_id))
    } else {
        None
    };
    let target = match hold {
        Some(hold) => {
            tokio::fs::create_dir_all(&hold)
                .await
                .with_context(|| format!("failed to create holding area {:?}", hold))?;
            hold
        }
        None => shared.new_staging(job).await?,
    };
    let parked = report.files_held + report.files_queued > 0;
    let linked = async {
        for name in names {
            link_file(&pool.join(name), &target.join(name)).await?;
        }
        Ok::<(), anyhow::Error>(())
    };
    if let Err(error) = linked.await {
        if !parked {
            remove_staging(&target).await;
        }
        return Err(error);
    }
    if parked {
        tracing::debug!(
            "job {:08x}: {} files parked in {:?}",
            job.job_id,
            names.len(),
            target
        );
        return Ok(report);
    }
    match send_staging(shared, job, target.clone()).await {
        Ok(sent) => Ok(sent),
        Err(error) => {
            remove_staging(&target).await;
            Err(error)
        }
    }
}

/// Claims `files` of one directory and dispatches them to every job that wants them.
///
/// Files no job wants stay where they are. A job whose dispatch fails keeps its files in a
/// holding area and does not stop the other jobs; the first such error is returned.
#[instrument(skip_all, fields(dir_index = dir_index, files = files.len()))]
pub async fn process_chunk(
    shared: &Shared,
    compiled: &Compiled,
    dir_index: usize,
    status: &StatusCell,
    files: &[BatchFile],
) -> Result<ChunkReport> {
    let dir = compiled
        .directories
        .get(dir_index)
        .with_context(|| format!("no directory at index {}", dir_index))?;
    let source = dir.scan_path();
    let pool = shared.paths.pool(dir.id);
    tokio::fs::create_dir_all(&pool)
        .await
        .with_context(|| format!("failed to create pool {:?}", pool))?;
    let mut report = ChunkReport::default();
    let mut claimed: Vec<(&str, Vec<usize>)> = Vec::new();
    for file in files {
        let wanted = match_jobs(compiled, dir_index, &file.name);
        if wanted.is_empty() {
            continue;
        }
        let from = source.join(&file.name);
        let to = pool.join(&file.name);
        let retrieved = RetrievedFile {
            size: file.size,
            mtime: file.mtime,
        };
        let taken = if dir.options.do_not_remove {
            if status::lock(status).retrieved.get(&file.name) == Some(&retrieved) {
                continue;
            }
            tokio::fs::copy(&from, &to).await.map(|_| ())
        } else {
            tokio::fs::rename(&from, &to).await
        };
        match taken {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{:?} vanished before it was claimed", from);
                continue;
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to claim {:?} into {:?}", from, pool));
            }
        }
        if dir.options.do_not_remove {
            status::lock(status)
                .retrieved
                .insert(file.name.clone(), retrieved);
        }
        report.files_claimed += 1;
        report.bytes_claimed += file.size;
        claimed.push((&file.name, wanted));
    }
    if claimed.is_empty() {
        return Ok(report);
    }
    status::lock(status).record_retrieval(
        shared.clock.now(),
        report.files_claimed as u64,
        report.bytes_claimed,
    );
    let mut result = Ok(());
    for job_index in compiled.jobs.dir_range(dir_index) {
        let names: Vec<&str> = claimed
            .iter()
            .filter(|(_, wanted)| wanted.contains(&job_index))
            .map(|(name, _)| *name)
            .collect();
        let Some(job) = compiled.jobs.get(job_index) else {
            continue;
        };
        if names.is_empty() {
            continue;
        }
        match dispatch(shared, job, &pool, &names).await {
            Ok(dispatched) => report = report + dispatched,
            Err(error) => {
                tracing::warn!("job {:08x}: dispatch failed: {:#}", job.job_id, error);
                report.jobs_failed += 1;
                let parked = park_failed(shared, job, &pool, &names).await;
                if job.schedules.is_empty() {
                    report.files_queued += parked;
                } else {
                    report.files_held += parked;
                }
                if result.is_ok() {
                    result = Err(error.context(format!("job {:08x}", job.job_id)));
                }
            }
        }
    }
    for (name, _) in &claimed {
        if let Err(error) = tokio::fs::remove_file(pool.join(name)).await {
            tracing::warn!("failed to remove {:?} from pool {:?}: {}", name, pool, error);
        }
    }
    status::lock(status).files_queued += report.files_queued as u64;
    result.map(|()| report)
}
