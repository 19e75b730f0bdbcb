use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::engine::{EngineError, FileDescriptor, Result, SourceReader};

/// 随机访问文件数据源
///
/// 每次读取独立打开文件句柄，分片 worker 之间互不影响。
pub struct FileSourceReader {
    path: PathBuf,
    size: u64,
}

impl FileSourceReader {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(EngineError::validation(format!(
                "{} is not a file",
                path.display()
            )));
        }

        Ok(Self {
            size: metadata.len(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 根据文件名生成描述信息
    pub fn descriptor(&self, mime_type: impl Into<String>) -> FileDescriptor {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        FileDescriptor::new(name, self.size, mime_type)
    }
}

#[async_trait]
impl SourceReader for FileSourceReader {
    async fn read_range(&self, start: u64, size: u64) -> Result<Bytes> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut buffer = vec![0u8; size as usize];
        file.read_exact(&mut buffer).await?;

        Ok(Bytes::from(buffer))
    }

    fn len(&self) -> u64 {
        self.size
    }
}

/// 内存缓冲数据源（测试和小文件场景）
pub struct BufferSourceReader {
    data: Bytes,
}

impl BufferSourceReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl SourceReader for BufferSourceReader {
    async fn read_range(&self, start: u64, size: u64) -> Result<Bytes> {
        let end = start
            .checked_add(size)
            .filter(|end| *end <= self.data.len() as u64)
            .ok_or_else(|| {
                EngineError::validation(format!(
                    "range {start}+{size} out of bounds for source of {} bytes",
                    self.data.len()
                ))
            })?;

        Ok(self.data.slice(start as usize..end as usize))
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_buffer_reader_slices() {
        let reader = BufferSourceReader::new(&b"0123456789"[..]);
        assert_eq!(reader.len(), 10);

        let bytes = reader.read_range(2, 4).await.unwrap();
        assert_eq!(&bytes[..], b"2345");

        let tail = reader.read_range(8, 2).await.unwrap();
        assert_eq!(&tail[..], b"89");
    }

    #[tokio::test]
    async fn test_buffer_reader_rejects_out_of_bounds() {
        let reader = BufferSourceReader::new(&b"abc"[..]);
        assert!(reader.read_range(1, 5).await.is_err());
        assert!(reader.read_range(u64::MAX, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_file_reader_reads_ranges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"AABBCCDDEE").await.unwrap();

        let reader = FileSourceReader::open(&path).await.unwrap();
        assert_eq!(reader.len(), 10);

        let middle = reader.read_range(4, 4).await.unwrap();
        assert_eq!(&middle[..], b"CCDD");

        let descriptor = reader.descriptor("application/octet-stream");
        assert_eq!(descriptor.name, "data.bin");
        assert_eq!(descriptor.size, 10);
    }

    #[tokio::test]
    async fn test_file_reader_rejects_directory() {
        let dir = TempDir::new().unwrap();
        assert!(FileSourceReader::open(dir.path()).await.is_err());
    }
}
