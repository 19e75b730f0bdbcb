mod analytics;
mod errors;
mod manager;
mod planner;
mod queue;
mod resume;
mod throttle;
mod traits;
mod transfer;
mod types;
mod worker;

pub use analytics::{AnalyticsAggregator, AnalyticsSnapshot};
pub use errors::{EngineError, Result};
pub use manager::{UploadEngine, UploadEngineBuilder};
pub use planner::{plan_chunks, total_chunks};
pub use queue::PendingQueue;
pub use resume::{JsonResumeStore, MemoryResumeStore, ResumeRecord, ResumeStore};
pub use throttle::{BandwidthThrottle, QuietHours, ThrottleConfig};
pub use traits::{SourceReader, Transport};
pub use types::{
    Chunk, EngineSnapshot, FileDescriptor, MAX_CONCURRENT_UPLOADS, MAX_PRIORITY,
    MIN_CONCURRENT_UPLOADS, MIN_PRIORITY, UploadEvent, UploadId, UploadJob, UploadOptions,
    UploadState,
};
