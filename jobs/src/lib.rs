pub mod queue;
pub mod worker;

pub use queue::{ChannelJobQueue, Job, JobQueue, QueueError};
pub use worker::{ConversionWorkerConfig, ConversionWorkerPool};
