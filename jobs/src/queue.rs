use thiserror::Error;
use tokio::sync::mpsc;

use kb_core::error::{ErrorCode, KbError};

/// The single job kind this workspace's worker pool handles (spec §4.5, §5).
/// `attempt` is 1 on first enqueue and incremented by the pool on retry.
#[derive(Debug, Clone)]
pub enum Job {
    ConvertDocument { document_id: i64, attempt: u32 },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
    #[error("job queue is at capacity")]
    Full,
}

impl KbError for QueueError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::StorageError
    }
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;
}

/// Bounded in-memory queue (spec §5: "a bounded, durable-at-least-once
/// queue"). Durability for in-flight jobs comes from the document's own
/// `conversion_status` gating (§4.6): a crash mid-job leaves the document
/// `processing`, and the reconciliation path (C8) or an operator retry
/// requeues it — the channel itself does not persist across restarts.
pub struct ChannelJobQueue {
    sender: mpsc::Sender<Job>,
}

impl ChannelJobQueue {
    pub fn new(sender: mpsc::Sender<Job>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        self.sender.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}
