pub mod config;
pub mod engine;
pub mod source;
pub mod transport;
pub mod utils;

// 重新导出核心类型
pub use config::EngineConfig;
pub use engine::{
    AnalyticsAggregator, AnalyticsSnapshot, BandwidthThrottle, Chunk, EngineError, EngineSnapshot,
    FileDescriptor, JsonResumeStore, MemoryResumeStore, QuietHours, Result, ResumeRecord,
    ResumeStore, SourceReader, ThrottleConfig, Transport, UploadEngine, UploadEngineBuilder,
    UploadEvent, UploadId, UploadJob, UploadOptions, UploadState,
};
pub use source::{BufferSourceReader, FileSourceReader};
pub use transport::HttpChunkTransport;
