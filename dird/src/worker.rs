//! Worker tasks for directories holding more than one chunk

use common::dirconfig::Compiled;
use common::options::BatchFile;

use crate::scan::{ChunkReport, Shared, process_chunk};
use crate::slots::{WorkerCompletion, WorkerOutcome};
use crate::status::StatusCell;

/// Everything one worker owns
pub struct WorkerTask {
    pub worker_id: usize,
    pub generation: u64,
    pub dir_id: u32,
    pub dir_index: usize,
    pub shared: std::sync::Arc<Shared>,
    pub compiled: std::sync::Arc<Compiled>,
    pub status: StatusCell,
    pub chunks: Vec<Vec<BatchFile>>,
    pub cancel: tokio_util::sync::CancellationToken,
    pub completions: tokio::sync::mpsc::UnboundedSender<WorkerCompletion>,
}

impl WorkerTask {
    /// Processes the chunks in order, checking for cancellation between them.
    pub async fn run(self) {
        let mut report = ChunkReport::default();
        let mut outcome = WorkerOutcome::Done;
        for (index, chunk) in self.chunks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    "worker {} cancelled with {} chunks left",
                    self.worker_id,
                    self.chunks.len() - index
                );
                outcome = WorkerOutcome::Cancelled;
                break;
            }
            match process_chunk(
                &self.shared,
                &self.compiled,
                self.dir_index,
                &self.status,
                chunk,
            )
            .await
            {
                Ok(chunk_report) => report = report + chunk_report,
                Err(error) => {
                    outcome = WorkerOutcome::Failed(format!("{:#}", error));
                    break;
                }
            }
        }
        let completion = WorkerCompletion {
            worker_id: self.worker_id,
            generation: self.generation,
            dir_id: self.dir_id,
            report,
            outcome,
        };
        if self.completions.send(completion).is_err() {
            tracing::debug!("worker {} finished after the dispatcher", self.worker_id);
        }
    }
}
