//! Command-line and environment configuration.
//!
//! Every option can also be set through an `NPROBE_*` environment variable.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::satellite::RetryPolicy;

/// Head settings.
#[derive(Debug, Clone, Args)]
pub struct HeadConfig {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "NPROBE_CONFIG", default_value = "nprobe.json")]
    pub config: PathBuf,

    /// HTTP port for the head API
    #[arg(long, env = "NPROBE_HTTP_PORT", default_value_t = 8000)]
    pub http_port: u16,

    /// Capacity of the queue between ingestion and the metric sink
    #[arg(long, default_value_t = 1024)]
    pub sink_queue: usize,
}

/// Satellite settings. The shared secret is read from `NPROBE_SECRET`.
#[derive(Debug, Clone, Args)]
pub struct SatelliteConfig {
    /// Base URL of the head
    #[arg(long, env = "NPROBE_HEAD")]
    pub head: String,

    /// Name this satellite is registered under
    #[arg(long, env = "NPROBE_NAME")]
    pub name: String,

    /// Submission attempts per report, including the first
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// Seconds between submission attempts
    #[arg(long, default_value_t = 5)]
    pub retry_backoff: u64,

    /// Seconds before a crashed worker is restarted
    #[arg(long, default_value_t = 1)]
    pub restart_backoff: u64,

    /// Timeout in seconds for each request to the head
    #[arg(long, default_value_t = 10)]
    pub request_timeout: u64,
}

impl SatelliteConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_secs(self.retry_backoff),
        }
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}
