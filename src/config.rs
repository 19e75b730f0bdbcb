use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{EngineError, Result, ThrottleConfig};

// 用于序列化 Duration
fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

/// 引擎配置
///
/// 由应用启动流程构造后注入，也可以从 TOML 文件载入。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 同时传输的任务数上限
    pub max_concurrent_uploads: usize,
    /// 事件广播通道容量
    pub event_channel_capacity: usize,
    /// 分析快照的上报间隔（秒）
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub analytics_interval: Duration,
    /// 限速配置
    pub throttle: ThrottleConfig,
    /// 续传记录目录；None 表示使用内存存储
    pub resume_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 3,
            event_channel_capacity: 256,
            analytics_interval: Duration::from_secs(5),
            throttle: ThrottleConfig::default(),
            resume_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Config(format!("Failed to read {}: {err}", path.display()))
        })?;
        toml::from_str(&data).map_err(|err| {
            EngineError::Config(format!("Failed to parse {}: {err}", path.display()))
        })
    }
}
