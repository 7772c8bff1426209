//! Append-only JSON line logs describing file lineage
//!
//! The production log gets one [`ProductionRecord`] per file an option turned into something
//! else; the delete log gets one [`DeleteRecord`] per file removed without being sent. Both are
//! consumed by reporting tools; nothing in this workspace reads them back except tests.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionRecord {
    /// seconds since the epoch
    pub time: i64,
    pub dir_id: u32,
    pub job_id: u32,
    pub original_name: String,
    pub original_size: u64,
    /// empty when the option consumed the file without producing one
    pub new_name: String,
    pub new_size: u64,
    /// option line that produced this record
    pub option: String,
    pub exit_code: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteReason {
    OptionFailed,
    ExecFailed,
    UnknownFileAged,
    QueuedFileAged,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRecord {
    pub time: i64,
    pub dir_id: u32,
    /// `None` for files that never belonged to a job
    pub job_id: Option<u32>,
    pub file_name: String,
    pub size: u64,
    pub reason: DeleteReason,
    pub detail: String,
}

/// Shared handle to a JSON-lines file; a disabled log accepts and drops records.
#[derive(Debug, Clone, Default)]
pub struct LineLog {
    log_opt: Option<std::sync::Arc<tokio::sync::Mutex<tokio::io::BufWriter<tokio::fs::File>>>>,
}

impl LineLog {
    pub async fn open(log_path_opt: Option<&std::path::Path>) -> Result<Self> {
        let Some(log_path) = log_path_opt else {
            return Ok(Self::disabled());
        };
        let log_file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_path)
            .await
            .with_context(|| format!("Failed to open log file: {:?}", log_path))?;
        let log = std::sync::Arc::new(tokio::sync::Mutex::new(tokio::io::BufWriter::new(log_file)));
        Ok(Self { log_opt: Some(log) })
    }

    pub fn disabled() -> Self {
        Self { log_opt: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.log_opt.is_some()
    }

    pub async fn write<T: Serialize>(&self, record: &T) -> Result<()> {
        if let Some(log) = &self.log_opt {
            let mut line = serde_json::to_vec(record).context("Failed to serialize log record")?;
            line.push(b'\n');
            let mut log = log.lock().await;
            log.write_all(&line)
                .await
                .context("Failed to write to log file")?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        if let Some(log) = &self.log_opt {
            let mut log = log.lock().await;
            log.flush().await.context("Failed to flush log file")?;
        }
        Ok(())
    }
}

/// Current time as seconds since the epoch, the timestamp format of every record.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
