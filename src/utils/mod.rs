pub mod format;
pub mod retry;

pub use format::{format_bytes, format_duration, format_speed};
pub use retry::{RetryBuilder, RetryConfig, RetryStrategy, retry, retry_with_config};
