use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::errors::Result;
use super::throttle::ThrottleConfig;
use super::traits::SourceReader;

/// 优先级范围：1 最低，10 最高
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

/// 引擎级并发数的允许区间
pub const MIN_CONCURRENT_UPLOADS: usize = 1;
pub const MAX_CONCURRENT_UPLOADS: usize = 10;

/// 上传任务唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 上传状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum UploadState {
    /// 等待中（在队列中）
    Queued,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl UploadState {
    /// 终态的任务不再参与调度
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 文件描述信息，入队后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
    }
}

/// 单个任务的上传配置，入队后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOptions {
    /// 优先级（1-10，10 最高）
    pub priority: u8,
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 单个任务内的分片并发数
    pub max_concurrent_chunks: usize,
    /// 是否记录断点续传信息
    pub resumable: bool,
    /// 是否为每个分片计算 SHA-256 校验值
    pub checksum_chunks: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            chunk_size: 5 * 1024 * 1024, // 5MB
            max_concurrent_chunks: 3,
            resumable: true,
            checksum_chunks: false,
        }
    }
}

/// 分片信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// 0 起始的分片序号
    pub index: u32,
    /// 起始字节偏移（含）
    pub start: u64,
    /// 结束字节偏移（不含）
    pub end: u64,
    /// 分片大小（字节）
    pub size: u64,
    /// 是否已上传，置 true 后不会回退
    pub uploaded: bool,
    /// 分片内容的十六进制 SHA-256（可选）
    pub hash: Option<String>,
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: UploadId,
    pub descriptor: FileDescriptor,
    pub options: UploadOptions,
    pub state: UploadState,
    /// 任务启动后才会填充
    pub chunks: Vec<Chunk>,
    /// 不变式：等于所有已上传分片的大小之和
    pub bytes_uploaded: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 仅当 state == Failed 时为 Some
    pub error: Option<String>,
}

impl UploadJob {
    pub fn new(id: UploadId, descriptor: FileDescriptor, options: UploadOptions) -> Self {
        Self {
            id,
            descriptor,
            options,
            state: UploadState::Queued,
            chunks: Vec::new(),
            bytes_uploaded: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// 还未上传完成的分片数量
    pub fn remaining_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| !c.uploaded).count()
    }
}

/// 上传事件，任务的每次状态迁移都会广播
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 任务已入队
    Queued { upload_id: UploadId },
    /// 任务开始传输
    Started { upload_id: UploadId },
    /// 进度更新（每个分片完成时）
    Progress {
        upload_id: UploadId,
        bytes_uploaded: u64,
        total_bytes: u64,
    },
    /// 任务完成
    Completed {
        upload_id: UploadId,
        bytes_uploaded: u64,
    },
    /// 任务失败
    Failed { upload_id: UploadId, error: String },
    /// 任务已取消
    Cancelled { upload_id: UploadId },
    /// 任务已暂停
    Paused { upload_id: UploadId },
    /// 任务重新入队
    Resumed { upload_id: UploadId },
}

/// 队列与活跃集合的只读快照
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    /// 按调度顺序排列的等待任务
    pub queued: Vec<UploadId>,
    /// 正在传输的任务
    pub active: Vec<UploadId>,
    pub max_concurrent_uploads: usize,
}

/// 引擎命令
pub enum EngineCommand {
    /// 添加上传任务
    Enqueue {
        descriptor: FileDescriptor,
        options: UploadOptions,
        reader: Arc<dyn SourceReader>,
        /// 复用已有 ResumeRecord 时携带的任务标识
        resume_token: Option<UploadId>,
        reply: oneshot::Sender<Result<UploadId>>,
    },

    /// 暂停任务（保留续传记录）
    Pause {
        upload_id: UploadId,
        reply: oneshot::Sender<bool>,
    },

    /// 取消任务
    Cancel {
        upload_id: UploadId,
        reply: oneshot::Sender<bool>,
    },

    /// 重新入队暂停/失败的任务
    Resume {
        upload_id: UploadId,
        reply: oneshot::Sender<bool>,
    },

    /// 调整引擎级并发上限，返回钳制后的值
    SetMaxConcurrentUploads {
        limit: usize,
        reply: oneshot::Sender<usize>,
    },

    /// 更新限速配置
    SetThrottle {
        config: ThrottleConfig,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 获取任务信息
    GetJob {
        upload_id: UploadId,
        reply: oneshot::Sender<Option<UploadJob>>,
    },

    /// 获取所有任务
    GetAllJobs {
        reply: oneshot::Sender<Vec<UploadJob>>,
    },

    /// 获取队列/活跃集合快照
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },

    /// 关闭引擎
    Shutdown,
}

// 静态断言确保类型是 Send 的
const _: () = {
    fn assert_send<T: Send>() {}
    fn assert_types() {
        assert_send::<UploadJob>();
        assert_send::<UploadEvent>();
        assert_send::<EngineCommand>();
    }
};
