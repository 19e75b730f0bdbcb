use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::throttle::BandwidthThrottle;
use super::types::UploadId;

/// 分析快照，供外部上报使用
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    /// 已结束的任务总数（完成 + 失败）
    pub total_uploads: u64,
    pub completed_uploads: u64,
    pub failed_uploads: u64,
    /// 累计传输字节数
    pub total_bytes: u64,
    /// 活跃任务的聚合速度（字节/秒）
    pub average_speed: f64,
    /// completed / total，无任务时为 0
    pub success_rate: f64,
    pub active_uploads: usize,
    pub queue_length: usize,
    /// 限速器最近窗口的实测吞吐
    pub bandwidth_usage: f64,
    /// 进程常驻内存（字节），仅 Linux 下可用
    pub memory_usage: u64,
    pub generated_at: DateTime<Utc>,
}

impl Default for AnalyticsSnapshot {
    fn default() -> Self {
        Self {
            total_uploads: 0,
            completed_uploads: 0,
            failed_uploads: 0,
            total_bytes: 0,
            average_speed: 0.0,
            success_rate: 0.0,
            active_uploads: 0,
            queue_length: 0,
            bandwidth_usage: 0.0,
            memory_usage: 0,
            generated_at: Utc::now(),
        }
    }
}

/// 活跃任务的进度跟踪
struct JobTracker {
    bytes_uploaded: AtomicU64,
    started_at: Instant,
}

/// 进度更新消息
struct ProgressUpdate {
    upload_id: UploadId,
    bytes_uploaded: u64,
}

/// 分析聚合器
///
/// 引擎在每次任务状态迁移时调用对应钩子；快照计算不经过
/// 调度路径，不会阻塞派发。
pub struct AnalyticsAggregator {
    /// 活跃任务注册表（只在任务启动/结束时写）
    registry: RwLock<HashMap<UploadId, Arc<JobTracker>>>,

    /// 进度更新通道，分片完成路径上只做一次无锁发送
    update_tx: crossbeam_channel::Sender<ProgressUpdate>,
    update_rx: crossbeam_channel::Receiver<ProgressUpdate>,

    completed_uploads: AtomicU64,
    failed_uploads: AtomicU64,
    total_bytes: AtomicU64,
    queue_length: AtomicUsize,
    active_uploads: AtomicUsize,
}

impl AnalyticsAggregator {
    pub fn new() -> Self {
        let (update_tx, update_rx) = crossbeam_channel::unbounded();
        Self {
            registry: RwLock::new(HashMap::new()),
            update_tx,
            update_rx,
            completed_uploads: AtomicU64::new(0),
            failed_uploads: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            queue_length: AtomicUsize::new(0),
            active_uploads: AtomicUsize::new(0),
        }
    }

    /// 队列长度与活跃数由引擎主循环在每轮调度后刷新
    pub(crate) fn set_depth(&self, queue_length: usize, active_uploads: usize) {
        self.queue_length.store(queue_length, Ordering::Relaxed);
        self.active_uploads.store(active_uploads, Ordering::Relaxed);
    }

    pub(crate) fn job_started(&self, upload_id: UploadId, initial_bytes: u64) {
        let tracker = Arc::new(JobTracker {
            bytes_uploaded: AtomicU64::new(initial_bytes),
            started_at: Instant::now(),
        });
        self.registry.write().insert(upload_id, tracker);
    }

    pub(crate) fn update_progress(&self, upload_id: UploadId, bytes_uploaded: u64, delta: u64) {
        self.total_bytes.fetch_add(delta, Ordering::Relaxed);
        let _ = self.update_tx.send(ProgressUpdate {
            upload_id,
            bytes_uploaded,
        });
    }

    pub(crate) fn job_completed(&self, upload_id: UploadId) {
        self.registry.write().remove(&upload_id);
        self.completed_uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_failed(&self, upload_id: UploadId) {
        self.registry.write().remove(&upload_id);
        self.failed_uploads.fetch_add(1, Ordering::Relaxed);
    }

    /// 取消与暂停不计入成功率
    pub(crate) fn job_stopped(&self, upload_id: UploadId) {
        self.registry.write().remove(&upload_id);
    }

    /// 把积压的进度更新应用到注册表
    fn drain_updates(&self) {
        let registry = self.registry.read();
        while let Ok(update) = self.update_rx.try_recv() {
            if let Some(tracker) = registry.get(&update.upload_id) {
                tracker
                    .bytes_uploaded
                    .store(update.bytes_uploaded, Ordering::Relaxed);
            }
        }
    }

    /// 计算当前快照
    pub fn snapshot(&self, bandwidth_usage: f64) -> AnalyticsSnapshot {
        self.drain_updates();

        let registry = self.registry.read();
        let mut average_speed = 0.0;
        for tracker in registry.values() {
            let elapsed = tracker.started_at.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                average_speed += tracker.bytes_uploaded.load(Ordering::Relaxed) as f64 / elapsed;
            }
        }
        drop(registry);

        let completed = self.completed_uploads.load(Ordering::Relaxed);
        let failed = self.failed_uploads.load(Ordering::Relaxed);
        let total = completed + failed;
        let success_rate = if total > 0 {
            completed as f64 / total as f64
        } else {
            0.0
        };

        AnalyticsSnapshot {
            total_uploads: total,
            completed_uploads: completed,
            failed_uploads: failed,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            average_speed,
            success_rate,
            active_uploads: self.active_uploads.load(Ordering::Relaxed),
            queue_length: self.queue_length.load(Ordering::Relaxed),
            bandwidth_usage,
            memory_usage: process_memory_bytes(),
            generated_at: Utc::now(),
        }
    }

    /// 启动定时上报任务，通过 watch 通道发布最新快照
    pub(crate) fn start_reporter(
        self: &Arc<Self>,
        throttle: Arc<BandwidthThrottle>,
        period: Duration,
        snapshot_tx: watch::Sender<AnalyticsSnapshot>,
        cancellation_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let aggregator = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = aggregator.snapshot(throttle.bandwidth_usage());
                        debug!(
                            active = snapshot.active_uploads,
                            queued = snapshot.queue_length,
                            speed = snapshot.average_speed,
                            "analytics tick"
                        );
                        let _ = snapshot_tx.send(snapshot);
                    }
                }
            }
        })
    }
}

impl Default for AnalyticsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// 进程常驻内存（字节）；读取失败或非 Linux 平台返回 0
fn process_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(rss_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|value| value.parse::<u64>().ok())
            {
                return rss_pages * 4096;
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_zero_when_no_uploads() {
        let aggregator = AnalyticsAggregator::new();
        let snapshot = aggregator.snapshot(0.0);
        assert_eq!(snapshot.total_uploads, 0);
        assert_eq!(snapshot.success_rate, 0.0);
    }

    #[test]
    fn test_counters_after_transitions() {
        let aggregator = AnalyticsAggregator::new();

        let done = UploadId::new();
        let failed = UploadId::new();
        aggregator.job_started(done, 0);
        aggregator.job_started(failed, 0);
        aggregator.update_progress(done, 1000, 1000);
        aggregator.update_progress(failed, 200, 200);
        aggregator.job_completed(done);
        aggregator.job_failed(failed);

        let snapshot = aggregator.snapshot(0.0);
        assert_eq!(snapshot.total_uploads, 2);
        assert_eq!(snapshot.completed_uploads, 1);
        assert_eq!(snapshot.failed_uploads, 1);
        assert_eq!(snapshot.total_bytes, 1200);
        assert_eq!(snapshot.success_rate, 0.5);
    }

    #[test]
    fn test_progress_drained_into_speed() {
        let aggregator = AnalyticsAggregator::new();
        let upload_id = UploadId::new();
        aggregator.job_started(upload_id, 0);

        std::thread::sleep(Duration::from_millis(20));
        aggregator.update_progress(upload_id, 5_000, 5_000);

        let snapshot = aggregator.snapshot(0.0);
        assert_eq!(snapshot.total_bytes, 5_000);
        assert!(snapshot.average_speed > 0.0);
    }

    #[test]
    fn test_depth_gauges() {
        let aggregator = AnalyticsAggregator::new();
        aggregator.set_depth(4, 2);
        let snapshot = aggregator.snapshot(123.0);
        assert_eq!(snapshot.queue_length, 4);
        assert_eq!(snapshot.active_uploads, 2);
        assert_eq!(snapshot.bandwidth_usage, 123.0);
    }
}
