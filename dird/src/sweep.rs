//! Periodic clean-up of files nobody is going to send

use anyhow::Result;
use common::dirconfig::Compiled;
use common::log::{DeleteReason, DeleteRecord};
use common::options::Batch;

use crate::scan::{Shared, match_jobs};
use crate::status::DirStatus;

async fn delete_aged(
    shared: &Shared,
    dir: &std::path::Path,
    dir_id: u32,
    job_id: Option<u32>,
    keep: impl Fn(&str) -> bool,
    max_age: u64,
    reason: DeleteReason,
) -> Result<usize> {
    let now = shared.clock.now();
    let batch = Batch::from_dir(dir).await?;
    let mut deleted = 0;
    for file in &batch.files {
        if keep(&file.name) || now - file.mtime <= max_age as i64 {
            continue;
        }
        let path = dir.join(&file.name);
        if let Err(error) = tokio::fs::remove_file(&path).await {
            tracing::warn!("failed to delete aged file {:?}: {}", path, error);
            continue;
        }
        deleted += 1;
        let record = DeleteRecord {
            time: now,
            dir_id,
            job_id,
            file_name: file.name.clone(),
            size: file.size,
            reason,
            detail: format!(
                "older than {}",
                humantime::format_duration(std::time::Duration::from_secs(max_age))
            ),
        };
        if let Err(error) = shared.env.delete_log.write(&record).await {
            tracing::warn!("failed to write delete record: {:#}", error);
        }
    }
    Ok(deleted)
}

/// Deletes files of the directory that no job wants once they are older than `max_age`.
pub async fn delete_unknown(
    shared: &Shared,
    compiled: &Compiled,
    dir_index: usize,
    max_age: u64,
) -> Result<usize> {
    let Some(dir) = compiled.directories.get(dir_index) else {
        return Ok(0);
    };
    let deleted = delete_aged(
        shared,
        dir.scan_path(),
        dir.id,
        None,
        |name| !match_jobs(compiled, dir_index, name).is_empty(),
        max_age,
        DeleteReason::UnknownFileAged,
    )
    .await?;
    if deleted > 0 {
        tracing::info!("{}: deleted {} unknown files", dir.alias, deleted);
    }
    Ok(deleted)
}

/// Deletes files waiting for a paused host once they are older than `max_age`.
pub async fn delete_queued(
    shared: &Shared,
    compiled: &Compiled,
    dir_index: usize,
    max_age: u64,
) -> Result<usize> {
    let Some(dir) = compiled.directories.get(dir_index) else {
        return Ok(0);
    };
    let mut deleted = 0;
    for job in compiled.jobs.dir_jobs(dir_index) {
        let hold = shared.paths.queue_hold(job.job_id);
        if !tokio::fs::try_exists(&hold).await.unwrap_or(false) {
            continue;
        }
        deleted += delete_aged(
            shared,
            &hold,
            dir.id,
            Some(job.job_id),
            |_| false,
            max_age,
            DeleteReason::QueuedFileAged,
        )
        .await?;
    }
    if deleted > 0 {
        tracing::info!("{}: deleted {} queued files", dir.alias, deleted);
    }
    Ok(deleted)
}

/// Logs once when nothing arrived for longer than `warn_time` seconds.
pub fn check_warn_time(alias: &str, warn_time: u64, status: &mut DirStatus, now: i64) -> bool {
    if warn_time == 0 || status.warned || now - status.last_retrieval <= warn_time as i64 {
        return false;
    }
    status.warned = true;
    tracing::warn!(
        "{}: no files received for {}",
        alias,
        humantime::format_duration(std::time::Duration::from_secs(
            (now - status.last_retrieval).max(0) as u64
        ))
    );
    true
}
