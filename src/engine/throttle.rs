use std::time::{Duration, Instant};

use chrono::Timelike;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::errors::{EngineError, Result};

/// 吞吐测量窗口长度
const MEASURE_WINDOW: Duration = Duration::from_secs(1);

/// 自适应模式的调整参数
const ADAPTIVE_SHRINK: f64 = 0.75;
const ADAPTIVE_GROW: f64 = 1.05;
const ADAPTIVE_FLOOR_RATIO: f64 = 0.25;

/// 静默时段（本地时间，`[start, end)` 小时，支持跨午夜）
///
/// 窗口内使用该时段自己的速率上限替代全局配置。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub max_bytes_per_second: u64,
}

impl QuietHours {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            // 跨午夜，例如 22 点到次日 6 点
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// 限速配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// 全局速率上限，None 表示不限速
    pub max_bytes_per_second: Option<u64>,
    /// 实测吞吐超出预算时自动收紧速率，低于预算时谨慎放宽
    pub adaptive: bool,
    pub quiet_hours: Option<QuietHours>,
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.max_bytes_per_second {
            if rate == 0 {
                return Err(EngineError::Throttle(
                    "max_bytes_per_second must be greater than zero".to_string(),
                ));
            }
        }

        if let Some(quiet) = &self.quiet_hours {
            if quiet.start_hour > 23 || quiet.end_hour > 23 {
                return Err(EngineError::Throttle(
                    "quiet hours must be within 0-23".to_string(),
                ));
            }
            if quiet.start_hour == quiet.end_hour {
                return Err(EngineError::Throttle(
                    "quiet hours window is empty".to_string(),
                ));
            }
            if quiet.max_bytes_per_second == 0 {
                return Err(EngineError::Throttle(
                    "quiet hours max_bytes_per_second must be greater than zero".to_string(),
                ));
            }
        }

        Ok(())
    }
}

struct ThrottleState {
    config: ThrottleConfig,
    /// 令牌桶余量（字节），允许为负表示欠账
    available: f64,
    last_refill: Instant,
    /// 自适应模式下的有效速率
    effective_rate: Option<f64>,
    window_start: Instant,
    window_bytes: u64,
    measured_rate: f64,
}

impl ThrottleState {
    fn new(config: ThrottleConfig) -> Self {
        let now = Instant::now();
        Self {
            available: config.max_bytes_per_second.unwrap_or(0) as f64,
            effective_rate: config.max_bytes_per_second.map(|r| r as f64),
            config,
            last_refill: now,
            window_start: now,
            window_bytes: 0,
            measured_rate: 0.0,
        }
    }

    /// 当前小时应生效的速率；None 表示不限速
    fn current_rate(&self, hour: u32) -> Option<f64> {
        if let Some(quiet) = &self.config.quiet_hours {
            if quiet.contains(hour) {
                return Some(quiet.max_bytes_per_second as f64);
            }
        }

        let cap = self.config.max_bytes_per_second? as f64;
        if self.config.adaptive {
            Some(self.effective_rate.unwrap_or(cap))
        } else {
            Some(cap)
        }
    }

    /// 记录一次发送并滚动测量窗口
    fn note_sent(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed >= MEASURE_WINDOW {
            self.measured_rate = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.window_start = Instant::now();
            self.window_bytes = 0;

            if self.config.adaptive {
                if let Some(cap) = self.config.max_bytes_per_second {
                    let cap = cap as f64;
                    let effective = self.effective_rate.unwrap_or(cap);
                    let adjusted = adjusted_rate(effective, self.measured_rate, cap);
                    if (adjusted - effective).abs() > f64::EPSILON {
                        debug!(
                            measured = self.measured_rate,
                            effective = adjusted,
                            "adaptive throttle adjusted"
                        );
                    }
                    self.effective_rate = Some(adjusted);
                }
            }
        }
    }
}

/// 实测超出预算则收紧 25%，低于预算九成则放宽 5%，下限为预算的四分之一
fn adjusted_rate(effective: f64, measured: f64, cap: f64) -> f64 {
    if measured > cap {
        (effective * ADAPTIVE_SHRINK).max(cap * ADAPTIVE_FLOOR_RATIO)
    } else if measured < cap * 0.9 {
        (effective * ADAPTIVE_GROW).min(cap)
    } else {
        effective
    }
}

/// 带宽限速器
///
/// 所有活跃任务的分片 worker 共享同一份预算，预定在锁内完成，
/// 等待在锁外进行；聚合速率最多超出上限一个在途分片。
pub struct BandwidthThrottle {
    state: Mutex<ThrottleState>,
}

impl BandwidthThrottle {
    pub fn new(config: ThrottleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(ThrottleState::new(config)),
        })
    }

    pub fn unthrottled() -> Self {
        Self {
            state: Mutex::new(ThrottleState::new(ThrottleConfig::default())),
        }
    }

    /// 发送 `bytes` 字节前调用，等待计算出的延迟
    pub async fn acquire(&self, bytes: u64) {
        let delay = self.reserve(bytes, chrono::Local::now().hour());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// 预定 `bytes` 字节的预算并返回需要等待的时长
    pub(crate) fn reserve(&self, bytes: u64, hour: u32) -> Duration {
        let mut state = self.state.lock();
        state.note_sent(bytes);

        let Some(rate) = state.current_rate(hour) else {
            return Duration::ZERO;
        };

        // 补充令牌，突发上限为一秒的预算
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.available = (state.available + elapsed * rate).min(rate);
        state.last_refill = now;

        state.available -= bytes as f64;
        if state.available >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.available / rate)
        }
    }

    /// 替换配置；校验失败时保留原有设置
    pub fn set_config(&self, config: ThrottleConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.state.lock();
        *state = ThrottleState::new(config);
        Ok(())
    }

    pub fn config(&self) -> ThrottleConfig {
        self.state.lock().config.clone()
    }

    /// 最近窗口的实测吞吐（字节/秒）
    pub fn bandwidth_usage(&self) -> f64 {
        let mut state = self.state.lock();
        let elapsed = state.window_start.elapsed();
        if elapsed >= MEASURE_WINDOW {
            state.measured_rate = state.window_bytes as f64 / elapsed.as_secs_f64();
            state.window_start = Instant::now();
            state.window_bytes = 0;
        }
        state.measured_rate
    }
}
