use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::analytics::AnalyticsAggregator;
use super::errors::{EngineError, Result};
use super::planner::plan_chunks;
use super::queue::PendingQueue;
use super::resume::ResumeStore;
use super::throttle::BandwidthThrottle;
use super::traits::{SourceReader, Transport};
use super::transfer::{ChunkProgress, JobRunner};
use super::types::{
    EngineCommand, EngineSnapshot, FileDescriptor, MAX_CONCURRENT_UPLOADS, MAX_PRIORITY,
    MIN_CONCURRENT_UPLOADS, MIN_PRIORITY, UploadEvent, UploadId, UploadJob, UploadOptions,
    UploadState,
};

struct JobHandle {
    job: UploadJob,
    reader: Arc<dyn SourceReader>,
    cancellation_token: Option<CancellationToken>,
    join_handle: Option<JoinHandle<Result<()>>>,
    /// 旧执行器还在收尾时收到的 resume 请求，结算后重新入队
    pending_resume: bool,
}

/// 任务结算后的后续动作（在释放 jobs 的可变借用之后执行）
enum SettleOutcome {
    Completed { bytes_uploaded: u64, resumable: bool },
    Failed { error: String },
    Stopped,
}

/// 引擎主循环
///
/// 队列与活跃集合只在这里被修改；每处理完一条命令或一次
/// 任务/分片结算，就同步重新评估一次派发。
pub(crate) struct EngineWorker {
    transport: Arc<dyn Transport>,
    resume_store: Arc<dyn ResumeStore>,
    throttle: Arc<BandwidthThrottle>,
    analytics: Arc<AnalyticsAggregator>,
    event_tx: broadcast::Sender<UploadEvent>,

    max_concurrent_uploads: usize,
    jobs: HashMap<UploadId, JobHandle>,
    queue: PendingQueue,
    active: HashSet<UploadId>,

    progress_tx: mpsc::UnboundedSender<ChunkProgress>,
    progress_rx: mpsc::UnboundedReceiver<ChunkProgress>,
    settled_tx: mpsc::UnboundedSender<UploadId>,
    settled_rx: mpsc::UnboundedReceiver<UploadId>,
}

impl EngineWorker {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        resume_store: Arc<dyn ResumeStore>,
        throttle: Arc<BandwidthThrottle>,
        analytics: Arc<AnalyticsAggregator>,
        event_tx: broadcast::Sender<UploadEvent>,
        max_concurrent_uploads: usize,
    ) -> Self {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();

        Self {
            transport,
            resume_store,
            throttle,
            analytics,
            event_tx,
            max_concurrent_uploads: clamp_concurrency(max_concurrent_uploads),
            jobs: HashMap::new(),
            queue: PendingQueue::new(),
            active: HashSet::new(),
            progress_tx,
            progress_rx,
            settled_tx,
            settled_rx,
        }
    }

    /// 主事件循环
    pub(crate) async fn run(mut self, mut command_rx: mpsc::Receiver<EngineCommand>) {
        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(EngineCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                Some(progress) = self.progress_rx.recv() => {
                    self.apply_chunk_progress(progress);
                }
                Some(upload_id) = self.settled_rx.recv() => {
                    self.handle_job_settled(upload_id).await;
                }
            }

            self.dispatch();
            self.analytics.set_depth(self.queue.len(), self.active.len());
        }

        // 关闭时停止所有在途任务
        for handle in self.jobs.values() {
            if let Some(token) = &handle.cancellation_token {
                token.cancel();
            }
        }
        info!("engine worker stopped");
    }

    /// 只要有空闲槽位且队列非空就继续派发
    fn dispatch(&mut self) {
        while self.active.len() < self.max_concurrent_uploads {
            let Some(upload_id) = self.queue.pop() else {
                break;
            };
            self.start_upload(upload_id);
        }
    }

    fn start_upload(&mut self, upload_id: UploadId) {
        let Some(handle) = self.jobs.get_mut(&upload_id) else {
            return;
        };
        if handle.job.state != UploadState::Queued {
            return;
        }

        if handle.job.chunks.is_empty() {
            handle.job.chunks =
                plan_chunks(handle.job.descriptor.size, handle.job.options.chunk_size);
        }

        let token = CancellationToken::new();
        handle.cancellation_token = Some(token.clone());
        handle.job.state = UploadState::Uploading;
        handle.job.started_at = Some(chrono::Utc::now());

        let runner = JobRunner {
            transport: self.transport.clone(),
            reader: handle.reader.clone(),
            resume_store: self.resume_store.clone(),
            throttle: self.throttle.clone(),
            cancellation_token: token,
            progress_tx: self.progress_tx.clone(),
        };

        let job = handle.job.clone();
        let initial_bytes = handle.job.bytes_uploaded;
        let chunk_count = handle.job.chunks.len();
        let settled_tx = self.settled_tx.clone();
        handle.join_handle = Some(tokio::spawn(async move {
            let result = runner.run(job).await;
            let _ = settled_tx.send(upload_id);
            result
        }));

        self.active.insert(upload_id);
        self.analytics.job_started(upload_id, initial_bytes);
        self.emit(UploadEvent::Started { upload_id });
        debug!(%upload_id, chunks = chunk_count, "upload started");
    }

    fn apply_chunk_progress(&mut self, progress: ChunkProgress) {
        let upload_id = progress.upload_id;
        let (bytes_uploaded, total_bytes, delta) = {
            let Some(handle) = self.jobs.get_mut(&upload_id) else {
                return;
            };
            let Some(chunk) = handle.job.chunks.get_mut(progress.chunk_index as usize) else {
                return;
            };
            if chunk.uploaded {
                // 重复通知，保持单调
                return;
            }
            chunk.uploaded = true;
            chunk.hash = progress.hash;
            handle.job.bytes_uploaded += progress.bytes;

            (
                handle.job.bytes_uploaded,
                handle.job.descriptor.size,
                progress.bytes,
            )
        };

        self.analytics
            .update_progress(upload_id, bytes_uploaded, delta);
        self.emit(UploadEvent::Progress {
            upload_id,
            bytes_uploaded,
            total_bytes,
        });
    }

    async fn handle_job_settled(&mut self, upload_id: UploadId) {
        // 先排空积压的分片通知，结算时字节数才是最终值
        while let Ok(progress) = self.progress_rx.try_recv() {
            self.apply_chunk_progress(progress);
        }

        let outcome = {
            let Some(handle) = self.jobs.get_mut(&upload_id) else {
                return;
            };
            let Some(join_handle) = handle.join_handle.take() else {
                return;
            };
            handle.cancellation_token = None;

            let result = match join_handle.await {
                Ok(result) => result,
                Err(err) => Err(EngineError::internal(format!("job task panicked: {err}"))),
            };

            match result {
                Ok(()) if handle.job.state == UploadState::Uploading => {
                    handle.job.state = UploadState::Completed;
                    handle.job.completed_at = Some(chrono::Utc::now());
                    SettleOutcome::Completed {
                        bytes_uploaded: handle.job.bytes_uploaded,
                        resumable: handle.job.options.resumable,
                    }
                }
                Ok(()) | Err(EngineError::Cancelled) => {
                    // 状态已经由 pause/cancel 命令设置，这里只收尾
                    SettleOutcome::Stopped
                }
                Err(err) => {
                    if matches!(
                        handle.job.state,
                        UploadState::Paused | UploadState::Cancelled
                    ) {
                        // 用户先停了任务，传输错误不再改变状态
                        SettleOutcome::Stopped
                    } else {
                        let message = err.to_string();
                        handle.job.state = UploadState::Failed;
                        handle.job.error = Some(message.clone());
                        handle.job.completed_at = Some(chrono::Utc::now());
                        SettleOutcome::Failed { error: message }
                    }
                }
            }
        };

        self.active.remove(&upload_id);

        // 收尾期间收到过 resume 请求的任务重新入队
        if matches!(outcome, SettleOutcome::Stopped) {
            if let Some(handle) = self.jobs.get_mut(&upload_id) {
                if handle.pending_resume {
                    handle.pending_resume = false;
                    handle.job.state = UploadState::Queued;
                    handle.job.error = None;
                    handle.job.completed_at = None;
                    self.queue.push(upload_id, handle.job.options.priority);
                }
            }
        }

        match outcome {
            SettleOutcome::Completed {
                bytes_uploaded,
                resumable,
            } => {
                self.analytics.job_completed(upload_id);
                if resumable {
                    if let Err(err) = self.resume_store.delete(upload_id).await {
                        warn!(%upload_id, %err, "failed to delete resume record");
                    }
                }
                self.emit(UploadEvent::Completed {
                    upload_id,
                    bytes_uploaded,
                });
                info!(%upload_id, bytes = bytes_uploaded, "upload completed");
            }
            SettleOutcome::Failed { error } => {
                self.analytics.job_failed(upload_id);
                self.emit(UploadEvent::Failed {
                    upload_id,
                    error: error.clone(),
                });
                warn!(%upload_id, %error, "upload failed");
            }
            SettleOutcome::Stopped => {
                self.analytics.job_stopped(upload_id);
            }
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Enqueue {
                descriptor,
                options,
                reader,
                resume_token,
                reply,
            } => {
                let result = self
                    .enqueue(descriptor, options, reader, resume_token)
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::Pause { upload_id, reply } => {
                let stopped = self.stop_job(upload_id, UploadState::Paused);
                if stopped {
                    self.emit(UploadEvent::Paused { upload_id });
                }
                let _ = reply.send(stopped);
            }
            EngineCommand::Cancel { upload_id, reply } => {
                let stopped = self.stop_job(upload_id, UploadState::Cancelled);
                if stopped {
                    self.emit(UploadEvent::Cancelled { upload_id });
                }
                let _ = reply.send(stopped);
            }
            EngineCommand::Resume { upload_id, reply } => {
                let resumed = self.resume_job(upload_id);
                if resumed {
                    self.emit(UploadEvent::Resumed { upload_id });
                }
                let _ = reply.send(resumed);
            }
            EngineCommand::SetMaxConcurrentUploads { limit, reply } => {
                self.max_concurrent_uploads = clamp_concurrency(limit);
                let _ = reply.send(self.max_concurrent_uploads);
            }
            EngineCommand::SetThrottle { config, reply } => {
                let _ = reply.send(self.throttle.set_config(config));
            }
            EngineCommand::GetJob { upload_id, reply } => {
                let job = self.jobs.get(&upload_id).map(|handle| handle.job.clone());
                let _ = reply.send(job);
            }
            EngineCommand::GetAllJobs { reply } => {
                let jobs: Vec<_> = self
                    .jobs
                    .values()
                    .map(|handle| handle.job.clone())
                    .collect();
                let _ = reply.send(jobs);
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(EngineSnapshot {
                    queued: self.queue.ids(),
                    active: self.active.iter().copied().collect(),
                    max_concurrent_uploads: self.max_concurrent_uploads,
                });
            }
            EngineCommand::Shutdown => unreachable!("handled by the event loop"),
        }
    }

    async fn enqueue(
        &mut self,
        descriptor: FileDescriptor,
        options: UploadOptions,
        reader: Arc<dyn SourceReader>,
        resume_token: Option<UploadId>,
    ) -> Result<UploadId> {
        validate_request(&descriptor, &options, reader.as_ref())?;

        let upload_id = resume_token.unwrap_or_else(UploadId::new);
        if self.jobs.contains_key(&upload_id) {
            return Err(EngineError::validation(format!(
                "upload {upload_id} already exists"
            )));
        }

        let mut job = UploadJob::new(upload_id, descriptor, options);

        // 存在续传记录时预先标记已完成的分片
        if job.options.resumable && resume_token.is_some() {
            let record = match self.resume_store.get(upload_id).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(%upload_id, %err, "failed to load resume record");
                    None
                }
            };

            if let Some(record) = record {
                job.chunks = plan_chunks(job.descriptor.size, job.options.chunk_size);
                for chunk in job.chunks.iter_mut() {
                    if record.completed_chunks.contains(&chunk.index) {
                        chunk.uploaded = true;
                        job.bytes_uploaded += chunk.size;
                    }
                }
                debug!(
                    %upload_id,
                    resumed = record.completed_chunks.len(),
                    "resume record applied"
                );
            }
        }

        self.queue.push(upload_id, job.options.priority);
        self.jobs.insert(
            upload_id,
            JobHandle {
                job,
                reader,
                cancellation_token: None,
                join_handle: None,
                pending_resume: false,
            },
        );
        self.emit(UploadEvent::Queued { upload_id });

        Ok(upload_id)
    }

    /// 暂停或取消一个任务；对未知或已结束的任务返回 false
    fn stop_job(&mut self, upload_id: UploadId, to_state: UploadState) -> bool {
        let Some(handle) = self.jobs.get_mut(&upload_id) else {
            return false;
        };

        match handle.job.state {
            UploadState::Queued => {
                // 还没开始传输，直接从队列移除
                self.queue.remove(&upload_id);
            }
            UploadState::Uploading => {
                // 协作式停止：在途分片允许完成，不再启动新分片
                if let Some(token) = &handle.cancellation_token {
                    token.cancel();
                }
            }
            UploadState::Paused if to_state == UploadState::Cancelled => {}
            _ => return false,
        }

        handle.job.state = to_state;
        if to_state.is_terminal() {
            handle.job.completed_at = Some(chrono::Utc::now());
        }
        true
    }

    /// 重新入队暂停/失败/取消的任务；续传记录里的分片不会重传
    fn resume_job(&mut self, upload_id: UploadId) -> bool {
        let Some(handle) = self.jobs.get_mut(&upload_id) else {
            return false;
        };
        if !matches!(
            handle.job.state,
            UploadState::Paused | UploadState::Failed | UploadState::Cancelled
        ) {
            return false;
        }

        if handle.join_handle.is_some() {
            // 旧执行器还在收尾，等结算后再重新入队
            handle.pending_resume = true;
            return true;
        }

        handle.job.state = UploadState::Queued;
        handle.job.error = None;
        handle.job.completed_at = None;
        self.queue.push(upload_id, handle.job.options.priority);
        true
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn clamp_concurrency(limit: usize) -> usize {
    limit.clamp(MIN_CONCURRENT_UPLOADS, MAX_CONCURRENT_UPLOADS)
}

fn validate_request(
    descriptor: &FileDescriptor,
    options: &UploadOptions,
    reader: &dyn SourceReader,
) -> Result<()> {
    if descriptor.name.is_empty() {
        return Err(EngineError::validation("file name must not be empty"));
    }
    if descriptor.size == 0 {
        return Err(EngineError::validation("file size must be greater than zero"));
    }
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&options.priority) {
        return Err(EngineError::validation(format!(
            "priority must be within {MIN_PRIORITY}-{MAX_PRIORITY}"
        )));
    }
    if options.chunk_size == 0 {
        return Err(EngineError::validation("chunk_size must be greater than zero"));
    }
    if options.max_concurrent_chunks == 0 {
        return Err(EngineError::validation(
            "max_concurrent_chunks must be at least 1",
        ));
    }
    if reader.len() != descriptor.size {
        return Err(EngineError::validation(format!(
            "source length {} does not match descriptor size {}",
            reader.len(),
            descriptor.size
        )));
    }

    Ok(())
}
