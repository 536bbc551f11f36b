pub mod endpoint;
pub mod engine;
pub mod error;
pub mod lease;
pub mod manager;
pub mod sink;
pub mod task;

pub use endpoint::{EndpointRegistry, EndpointStatus};
pub use engine::{
    ChunkWriter, DownloadEngine, Resolver, StreamLocation, TransferExecutor, TransferOutcome,
    TransferSink,
};
pub use error::{QueueError, TransferError};
pub use lease::{JobLease, TransferTarget};
pub use manager::{DownloadManager, QueueSettings, QueueStats};
pub use sink::FileSink;
pub use task::{DownloadJob, JobSpec, JobStatus, QualityTier};
