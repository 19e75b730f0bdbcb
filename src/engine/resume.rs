use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use super::errors::{EngineError, Result};
use super::types::UploadId;

/// 断点续传记录
///
/// 可续传任务的第一个分片完成时创建，之后对 `completed_chunks`
/// 只追加；任务完成后删除。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub upload_id: UploadId,
    pub total_chunks: u32,
    pub completed_chunks: BTreeSet<u32>,
    pub chunk_size: u64,
    pub filename: String,
}

impl ResumeRecord {
    pub fn is_complete(&self) -> bool {
        self.completed_chunks.len() as u32 >= self.total_chunks
    }
}

/// 续传记录的持久化能力
///
/// 同一条记录的写入由任务的收集循环串行发起，实现无需处理
/// 单条记录上的并发写。
#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn get(&self, upload_id: UploadId) -> Result<Option<ResumeRecord>>;

    /// 幂等：记录已包含该分片序号时不做任何事
    async fn record_chunk_complete(
        &self,
        upload_id: UploadId,
        chunk_index: u32,
        chunk_size: u64,
        total_chunks: u32,
        filename: &str,
    ) -> Result<()>;

    async fn delete(&self, upload_id: UploadId) -> Result<()>;

    async fn list(&self) -> Result<Vec<ResumeRecord>>;
}

/// 内存续传存储（用于测试和不需要持久化的场景）
#[derive(Default)]
pub struct MemoryResumeStore {
    records: RwLock<HashMap<UploadId, ResumeRecord>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResumeStore for MemoryResumeStore {
    async fn get(&self, upload_id: UploadId) -> Result<Option<ResumeRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&upload_id).cloned())
    }

    async fn record_chunk_complete(
        &self,
        upload_id: UploadId,
        chunk_index: u32,
        chunk_size: u64,
        total_chunks: u32,
        filename: &str,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.entry(upload_id).or_insert_with(|| ResumeRecord {
            upload_id,
            total_chunks,
            completed_chunks: BTreeSet::new(),
            chunk_size,
            filename: filename.to_string(),
        });
        record.completed_chunks.insert(chunk_index);
        Ok(())
    }

    async fn delete(&self, upload_id: UploadId) -> Result<()> {
        self.records.write().await.remove(&upload_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ResumeRecord>> {
        let records = self.records.read().await;
        Ok(records.values().cloned().collect())
    }
}

/// 文件续传存储：目录下每个任务一个 JSON 文件
///
/// 写入先落到 `.tmp` 再原子重命名，崩溃重启后读到的
/// 要么是完整记录，要么没有记录。
pub struct JsonResumeStore {
    dir: PathBuf,
}

impl JsonResumeStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| EngineError::store(format!("Failed to create resume dir: {err}")))?;
        Ok(Self { dir })
    }

    fn record_path(&self, upload_id: UploadId) -> PathBuf {
        self.dir.join(format!("{upload_id}.json"))
    }

    async fn read_record(&self, upload_id: UploadId) -> Result<Option<ResumeRecord>> {
        let path = self.record_path(upload_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(EngineError::store(format!(
                    "Failed to read resume record: {err}"
                )));
            }
        };

        match serde_json::from_str(&data) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                // 原子替换下不应出现，按缺失处理而不是让任务无法启动
                warn!(%upload_id, %err, "corrupt resume record, ignoring");
                Ok(None)
            }
        }
    }

    async fn write_record(&self, record: &ResumeRecord) -> Result<()> {
        let path = self.record_path(record.upload_id);
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&tmp_path, data)
            .await
            .map_err(|err| EngineError::store(format!("Failed to write resume record: {err}")))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|err| EngineError::store(format!("Failed to commit resume record: {err}")))?;

        Ok(())
    }
}

#[async_trait]
impl ResumeStore for JsonResumeStore {
    async fn get(&self, upload_id: UploadId) -> Result<Option<ResumeRecord>> {
        self.read_record(upload_id).await
    }

    async fn record_chunk_complete(
        &self,
        upload_id: UploadId,
        chunk_index: u32,
        chunk_size: u64,
        total_chunks: u32,
        filename: &str,
    ) -> Result<()> {
        let mut record = self
            .read_record(upload_id)
            .await?
            .unwrap_or_else(|| ResumeRecord {
                upload_id,
                total_chunks,
                completed_chunks: BTreeSet::new(),
                chunk_size,
                filename: filename.to_string(),
            });

        if !record.completed_chunks.insert(chunk_index) {
            return Ok(());
        }

        self.write_record(&record).await
    }

    async fn delete(&self, upload_id: UploadId) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(upload_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(EngineError::store(format!(
                "Failed to delete resume record: {err}"
            ))),
        }
    }

    async fn list(&self) -> Result<Vec<ResumeRecord>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|err| EngineError::store(format!("Failed to read resume dir: {err}")))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| EngineError::store(format!("Failed to read resume dir: {err}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let data = match tokio::fs::read_to_string(&path).await {
                Ok(data) => data,
                Err(_) => continue,
            };
            if let Ok(record) = serde_json::from_str::<ResumeRecord>(&data) {
                records.push(record);
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_and_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = JsonResumeStore::open(dir.path()).await.unwrap();
        let upload_id = UploadId::new();

        store
            .record_chunk_complete(upload_id, 0, 1024, 5, "video.mp4")
            .await
            .unwrap();
        store
            .record_chunk_complete(upload_id, 2, 1024, 5, "video.mp4")
            .await
            .unwrap();

        // 新的存储实例重新读取目录，模拟进程重启
        let reopened = JsonResumeStore::open(dir.path()).await.unwrap();
        let record = reopened.get(upload_id).await.unwrap().unwrap();
        assert_eq!(record.upload_id, upload_id);
        assert_eq!(record.total_chunks, 5);
        assert_eq!(record.chunk_size, 1024);
        assert_eq!(record.filename, "video.mp4");
        assert_eq!(
            record.completed_chunks.iter().copied().collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert!(!record.is_complete());
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = JsonResumeStore::open(dir.path()).await.unwrap();
        let upload_id = UploadId::new();

        for _ in 0..3 {
            store
                .record_chunk_complete(upload_id, 1, 512, 4, "a.bin")
                .await
                .unwrap();
        }

        let record = store.get(upload_id).await.unwrap().unwrap();
        assert_eq!(record.completed_chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_get_absent_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonResumeStore::open(dir.path()).await.unwrap();
        assert!(store.get(UploadId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let dir = TempDir::new().unwrap();
        let store = JsonResumeStore::open(dir.path()).await.unwrap();
        let upload_id = UploadId::new();

        store
            .record_chunk_complete(upload_id, 0, 256, 2, "b.bin")
            .await
            .unwrap();
        store.delete(upload_id).await.unwrap();
        assert!(store.get(upload_id).await.unwrap().is_none());

        // 删除不存在的记录不报错
        store.delete(upload_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_returns_all_records() {
        let dir = TempDir::new().unwrap();
        let store = JsonResumeStore::open(dir.path()).await.unwrap();

        let first = UploadId::new();
        let second = UploadId::new();
        store
            .record_chunk_complete(first, 0, 256, 2, "a.bin")
            .await
            .unwrap();
        store
            .record_chunk_complete(second, 1, 256, 3, "b.bin")
            .await
            .unwrap();

        let mut records = store.list().await.unwrap();
        records.sort_by_key(|r| r.upload_id);
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryResumeStore::new();
        let upload_id = UploadId::new();

        store
            .record_chunk_complete(upload_id, 3, 128, 4, "c.bin")
            .await
            .unwrap();
        let record = store.get(upload_id).await.unwrap().unwrap();
        assert!(record.completed_chunks.contains(&3));

        store.delete(upload_id).await.unwrap();
        assert!(store.get(upload_id).await.unwrap().is_none());
    }
}
