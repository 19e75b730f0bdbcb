use std::sync::Arc;

use futures::future::join_all;
use sha2::{Digest, Sha256};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::errors::{EngineError, Result};
use super::resume::ResumeStore;
use super::throttle::BandwidthThrottle;
use super::traits::{SourceReader, Transport};
use super::types::{Chunk, UploadId, UploadJob};
use crate::utils::retry::{RetryConfig, retry_with_config};

/// 分片完成通知（发往引擎主循环）
#[derive(Debug)]
pub(crate) struct ChunkProgress {
    pub upload_id: UploadId,
    pub chunk_index: u32,
    pub bytes: u64,
    pub hash: Option<String>,
}

/// 单个任务的分片执行器
///
/// 维护一个受 `max_concurrent_chunks` 约束的 worker 池：
/// 任意分片结束后立即释放信号量，下一个未调度的分片马上补位。
pub(crate) struct JobRunner {
    pub transport: Arc<dyn Transport>,
    pub reader: Arc<dyn SourceReader>,
    pub resume_store: Arc<dyn ResumeStore>,
    pub throttle: Arc<BandwidthThrottle>,
    pub cancellation_token: CancellationToken,
    pub progress_tx: mpsc::UnboundedSender<ChunkProgress>,
}

impl JobRunner {
    pub(crate) async fn run(self, job: UploadJob) -> Result<()> {
        let upload_id = job.id;
        let total_chunks = job.chunks.len() as u32;
        let chunk_size = job.options.chunk_size;
        let checksum_chunks = job.options.checksum_chunks;
        let resumable = job.options.resumable;
        let filename = job.descriptor.name.clone();

        // 续传时已完成的分片不参与调度
        let pending: Vec<Chunk> = job
            .chunks
            .iter()
            .filter(|chunk| !chunk.uploaded)
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        debug!(
            %upload_id,
            pending = pending.len(),
            total = total_chunks,
            "starting chunk transfer"
        );

        let semaphore = Arc::new(Semaphore::new(job.options.max_concurrent_chunks.max(1)));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<ChunkProgress>();

        // 收集循环：同一条续传记录只有这一个写入者
        let collector = tokio::spawn({
            let resume_store = self.resume_store.clone();
            let progress_tx = self.progress_tx.clone();

            async move {
                while let Some(progress) = done_rx.recv().await {
                    if resumable {
                        let chunk_index = progress.chunk_index;
                        let persist = retry_with_config(RetryConfig::default(), || {
                            let resume_store = resume_store.clone();
                            let filename = filename.clone();
                            async move {
                                resume_store
                                    .record_chunk_complete(
                                        upload_id,
                                        chunk_index,
                                        chunk_size,
                                        total_chunks,
                                        &filename,
                                    )
                                    .await
                            }
                        })
                        .await;

                        if let Err(err) = persist {
                            // 分片已经发送成功，丢记录的代价只是续传时重传该分片
                            warn!(
                                %upload_id,
                                chunk = chunk_index,
                                %err,
                                "failed to persist resume record"
                            );
                        }
                    }

                    let _ = progress_tx.send(progress);
                }
            }
        });

        let mut chunk_futures = Vec::with_capacity(pending.len());
        for chunk in pending {
            let transport = self.transport.clone();
            let reader = self.reader.clone();
            let throttle = self.throttle.clone();
            let semaphore = semaphore.clone();
            let token = self.cancellation_token.clone();
            let done_tx = done_tx.clone();

            chunk_futures.push(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| EngineError::Shutdown)?;

                // 取消后不再启动新分片，在途的允许完成
                if token.is_cancelled() {
                    return Ok(false);
                }

                throttle.acquire(chunk.size).await;

                let bytes = match reader.read_range(chunk.start, chunk.size).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        token.cancel();
                        return Err(err);
                    }
                };

                let hash = checksum_chunks.then(|| hex::encode(Sha256::digest(&bytes)));

                if let Err(err) = transport.send(upload_id, chunk.index, bytes).await {
                    // 让尚未启动的分片跳过执行
                    token.cancel();
                    return Err(match err {
                        err @ EngineError::Transport { .. } => err,
                        other => EngineError::transport(chunk.index, other.to_string()),
                    });
                }

                let _ = done_tx.send(ChunkProgress {
                    upload_id,
                    chunk_index: chunk.index,
                    bytes: chunk.size,
                    hash,
                });

                Ok(true)
            });
        }
        drop(done_tx);

        let results = join_all(chunk_futures).await;

        // 等收集循环排空所有完成通知再结算
        if collector.await.is_err() {
            warn!(%upload_id, "resume record collector panicked");
        }

        let mut skipped = false;
        for result in results {
            match result {
                Ok(true) => {}
                Ok(false) => skipped = true,
                Err(err) => return Err(err),
            }
        }

        if skipped || self.cancellation_token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        Ok(())
    }
}
