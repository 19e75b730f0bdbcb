use async_trait::async_trait;
use bytes::Bytes;

use super::errors::Result;
use super::types::UploadId;

/// 传输能力 - 负责把单个分片的字节发送到远端
///
/// 引擎不关心具体的网络协议，超时与重试由实现方自理；
/// 返回错误会使所属任务整体失败（已完成分片的续传记录保留）。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发送一个分片，携带任务标识与分片序号
    async fn send(&self, upload_id: UploadId, chunk_index: u32, bytes: Bytes) -> Result<()>;
}

/// 数据源读取能力 - 按字节区间读取上传内容
///
/// 入队时选择具体实现（内存缓冲或可定位的文件句柄）。
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// 从 `start` 开始精确读取 `size` 个字节
    async fn read_range(&self, start: u64, size: u64) -> Result<Bytes>;

    /// 数据源总长度（字节）
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
