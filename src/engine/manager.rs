use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;

use super::analytics::{AnalyticsAggregator, AnalyticsSnapshot};
use super::errors::{EngineError, Result};
use super::resume::{MemoryResumeStore, ResumeStore};
use super::throttle::{BandwidthThrottle, ThrottleConfig};
use super::traits::{SourceReader, Transport};
use super::types::{
    EngineCommand, EngineSnapshot, FileDescriptor, UploadEvent, UploadId, UploadJob, UploadOptions,
};
use super::worker::EngineWorker;

/// 上传引擎句柄
///
/// 真正的调度在后台的 [`EngineWorker`] 里进行，句柄只负责
/// 发送命令并等待回执。由应用启动流程显式构造并注入依赖，
/// 测试中每个用例使用独立实例。
pub struct UploadEngine {
    command_tx: mpsc::Sender<EngineCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
    analytics: Arc<AnalyticsAggregator>,
    throttle: Arc<BandwidthThrottle>,
    analytics_rx: watch::Receiver<AnalyticsSnapshot>,
    shutdown_token: CancellationToken,
    worker_handle: JoinHandle<()>,
    reporter_handle: JoinHandle<()>,
}

impl UploadEngine {
    pub fn builder() -> UploadEngineBuilder {
        UploadEngineBuilder::new()
    }

    async fn send_command<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> EngineCommand,
    ) -> Result<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::Shutdown)?;
        reply_rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Add upload task
    pub async fn enqueue(
        &self,
        descriptor: FileDescriptor,
        reader: Arc<dyn SourceReader>,
        options: UploadOptions,
    ) -> Result<UploadId> {
        self.send_command(|reply| EngineCommand::Enqueue {
            descriptor,
            options,
            reader,
            resume_token: None,
            reply,
        })
        .await?
    }

    /// Add upload task, reusing the resume record stored under `resume_token`
    ///
    /// 调用方需要提供新的数据源；记录存在时只会重传未完成的分片。
    pub async fn enqueue_resumable(
        &self,
        descriptor: FileDescriptor,
        reader: Arc<dyn SourceReader>,
        options: UploadOptions,
        resume_token: UploadId,
    ) -> Result<UploadId> {
        self.send_command(|reply| EngineCommand::Enqueue {
            descriptor,
            options,
            reader,
            resume_token: Some(resume_token),
            reply,
        })
        .await?
    }

    /// Pause upload task
    pub async fn pause(&self, upload_id: UploadId) -> Result<bool> {
        self.send_command(|reply| EngineCommand::Pause { upload_id, reply })
            .await
    }

    /// Cancel upload task
    pub async fn cancel(&self, upload_id: UploadId) -> Result<bool> {
        self.send_command(|reply| EngineCommand::Cancel { upload_id, reply })
            .await
    }

    /// Re-queue a paused or failed upload task
    pub async fn resume(&self, upload_id: UploadId) -> Result<bool> {
        self.send_command(|reply| EngineCommand::Resume { upload_id, reply })
            .await
    }

    /// 调整引擎级并发上限（钳制到 1-10），返回生效值
    pub async fn set_max_concurrent_uploads(&self, limit: usize) -> Result<usize> {
        self.send_command(|reply| EngineCommand::SetMaxConcurrentUploads { limit, reply })
            .await
    }

    /// 更新限速配置；校验失败时保留原有设置
    pub async fn set_bandwidth_throttle(&self, config: ThrottleConfig) -> Result<()> {
        self.send_command(|reply| EngineCommand::SetThrottle { config, reply })
            .await?
    }

    pub async fn get_job(&self, upload_id: UploadId) -> Option<UploadJob> {
        self.send_command(|reply| EngineCommand::GetJob { upload_id, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn all_jobs(&self) -> Vec<UploadJob> {
        self.send_command(|reply| EngineCommand::GetAllJobs { reply })
            .await
            .unwrap_or_default()
    }

    /// 队列与活跃集合的当前快照
    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        self.send_command(|reply| EngineCommand::Snapshot { reply })
            .await
    }

    /// 订阅任务状态事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    /// 按需计算分析快照，不经过调度路径
    pub fn analytics(&self) -> AnalyticsSnapshot {
        self.analytics.snapshot(self.throttle.bandwidth_usage())
    }

    /// 定时上报的分析快照流
    pub fn watch_analytics(&self) -> watch::Receiver<AnalyticsSnapshot> {
        self.analytics_rx.clone()
    }

    /// 停止引擎：不再接受命令，在途任务被协作式取消
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.command_tx.send(EngineCommand::Shutdown).await;
        self.shutdown_token.cancel();
        let _ = self.worker_handle.await;
        let _ = self.reporter_handle.await;
        Ok(())
    }
}

/// 引擎构造器
pub struct UploadEngineBuilder {
    config: EngineConfig,
    throttle: Option<ThrottleConfig>,
    transport: Option<Arc<dyn Transport>>,
    resume_store: Option<Arc<dyn ResumeStore>>,
}

impl UploadEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            throttle: None,
            transport: None,
            resume_store: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 覆盖 [`EngineConfig`] 里的限速配置
    pub fn throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 不设置时使用内存存储（不跨进程保留续传记录）
    pub fn resume_store(mut self, resume_store: Arc<dyn ResumeStore>) -> Self {
        self.resume_store = Some(resume_store);
        self
    }

    pub fn build(self) -> Result<UploadEngine> {
        let transport = self
            .transport
            .ok_or_else(|| EngineError::validation("transport is required"))?;
        let resume_store = self
            .resume_store
            .unwrap_or_else(|| Arc::new(MemoryResumeStore::new()));

        let throttle_config = self
            .throttle
            .unwrap_or_else(|| self.config.throttle.clone());
        let throttle = Arc::new(BandwidthThrottle::new(throttle_config)?);
        let analytics = Arc::new(AnalyticsAggregator::new());
        let (event_tx, _) = broadcast::channel(self.config.event_channel_capacity.max(16));
        let (command_tx, command_rx) = mpsc::channel(100);
        let (snapshot_tx, analytics_rx) = watch::channel(AnalyticsSnapshot::default());
        let shutdown_token = CancellationToken::new();

        let worker = EngineWorker::new(
            transport,
            resume_store,
            throttle.clone(),
            analytics.clone(),
            event_tx.clone(),
            self.config.max_concurrent_uploads,
        );
        let worker_handle = tokio::spawn(worker.run(command_rx));

        let reporter_handle = analytics.start_reporter(
            throttle.clone(),
            self.config.analytics_interval,
            snapshot_tx,
            shutdown_token.clone(),
        );

        Ok(UploadEngine {
            command_tx,
            event_tx,
            analytics,
            throttle,
            analytics_rx,
            shutdown_token,
            worker_handle,
            reporter_handle,
        })
    }
}

impl Default for UploadEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
