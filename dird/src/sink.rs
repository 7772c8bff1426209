//! Hand-off of finished jobs to the transfer layer

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// One staging directory ready to be sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    /// name of the staging directory below the outgoing area
    pub name: String,
    pub job_id: u32,
    pub dir_id: u32,
    pub dir_alias: String,
    pub priority: u8,
    pub recipient: String,
    pub host_alias: String,
    pub staging: std::path::PathBuf,
    pub files: Vec<String>,
    pub total_size: u64,
    pub standard_options: Vec<String>,
    pub created: i64,
}

/// Receives every job that passed the option pipeline.
pub trait MessageSink: Send + Sync + std::fmt::Debug {
    fn send(&self, message: JobMessage) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Appends one JSON line per message to a queue file
#[derive(Debug, Clone)]
pub struct QueueFileSink {
    log: common::log::LineLog,
}

impl QueueFileSink {
    pub async fn open(path: &std::path::Path) -> anyhow::Result<Self> {
        Ok(Self {
            log: common::log::LineLog::open(Some(path)).await?,
        })
    }
}

impl MessageSink for QueueFileSink {
    fn send(&self, message: JobMessage) -> BoxFuture<'_, anyhow::Result<()>> {
        async move {
            self.log.write(&message).await?;
            self.log.flush().await
        }
        .boxed()
    }
}

/// Keeps messages in memory, for embedding and tests
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: std::sync::Mutex<Vec<JobMessage>>,
}

impl MemorySink {
    pub fn messages(&self) -> Vec<JobMessage> {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<JobMessage> {
        std::mem::take(
            &mut *self
                .messages
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

impl MessageSink for MemorySink {
    fn send(&self, message: JobMessage) -> BoxFuture<'_, anyhow::Result<()>> {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(message);
        futures::future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(job_id: u32) -> JobMessage {
        JobMessage {
            name: format!("9_{:08x}", job_id),
            job_id,
            dir_id: 1,
            dir_alias: "in".to_string(),
            priority: 9,
            recipient: "ftp://user@host/out".to_string(),
            host_alias: "host".to_string(),
            staging: std::path::PathBuf::from("/tmp/x"),
            files: vec!["a".to_string()],
            total_size: 3,
            standard_options: vec![],
            created: 10,
        }
    }

    #[tokio::test]
    async fn queue_file_gets_one_line_per_message() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("queue");
        let sink = QueueFileSink::open(&path).await?;
        sink.send(message(1)).await?;
        sink.send(message(2)).await?;
        let content = tokio::fs::read_to_string(&path).await?;
        let parsed: Vec<JobMessage> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(parsed, vec![message(1), message(2)]);
        Ok(())
    }

    #[tokio::test]
    async fn memory_sink_collects() {
        let sink = MemorySink::default();
        sink.send(message(3)).await.unwrap();
        assert_eq!(sink.take().len(), 1);
        assert!(sink.messages().is_empty());
    }
}
