use async_trait::async_trait;
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::debug;
use url::Url;

use crate::engine::{EngineError, Result, Transport, UploadId};

/// 基于 HTTP 的分片传输
///
/// 每个分片 `PUT {endpoint}/chunk`，任务标识与分片序号
/// 通过请求头携带，文件名元数据按 base64 编码。
#[derive(Clone)]
pub struct HttpChunkTransport {
    client: Client,
    endpoint: String,
    metadata: HeaderMap,
}

impl HttpChunkTransport {
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::with_client(Client::new(), endpoint)
    }

    pub fn with_client(client: Client, endpoint: &str) -> Result<Self> {
        Url::parse(endpoint)
            .map_err(|_| EngineError::validation(format!("Invalid endpoint url: {endpoint}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            metadata: HeaderMap::new(),
        })
    }

    /// 为所有分片请求附加文件名元数据
    pub fn with_filename(mut self, filename: &str) -> Self {
        let encoded = format!("filename {}", BASE64_STANDARD.encode(filename));
        if let Ok(value) = HeaderValue::from_str(&encoded) {
            self.metadata.insert("Upload-Metadata", value);
        }
        self
    }
}

#[async_trait]
impl Transport for HttpChunkTransport {
    async fn send(&self, upload_id: UploadId, chunk_index: u32, bytes: Bytes) -> Result<()> {
        let size = bytes.len();
        let response = self
            .client
            .put(format!("{}/chunk", self.endpoint))
            .headers(self.metadata.clone())
            .header("X-Upload-Id", upload_id.to_string())
            .header("X-Chunk-Index", chunk_index.to_string())
            .body(bytes)
            .send()
            .await
            .map_err(|err| EngineError::transport(chunk_index, err.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::transport(
                chunk_index,
                format!("server returned status {}", response.status().as_u16()),
            ));
        }

        debug!(%upload_id, chunk = chunk_index, size, "chunk sent");
        Ok(())
    }
}
