//! Probe module for latency measurement.
//!
//! Supports ICMP echo and HTTP GET probes. Each transport implements
//! [`Prober`]; the concrete prober is chosen once per target through
//! [`ProbeKind`].

mod engine;
mod http;
mod ping;
mod stats;
#[cfg(test)]
pub(crate) mod testing;

pub use engine::*;
pub use http::*;
pub use ping::*;
pub use stats::*;

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::models::{ProbeType, Target};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Capability to measure one batch against a fixed destination.
///
/// Individual sample failures are folded into `Samples::lost`. An `Err` means
/// the prober could not acquire what it needs to run at all (address
/// resolution, socket or client construction).
pub trait Prober: Send + Sync + 'static {
    fn run_batch(&self, count: u32) -> impl Future<Output = Result<Samples, ProbeError>> + Send;
}

/// Prober selected from a target's probe type.
#[derive(Debug, Clone)]
pub enum ProbeKind {
    Icmp(IcmpProber),
    Http(HttpProber),
}

impl ProbeKind {
    pub fn for_target(target: &Target) -> Self {
        match target.probe_type {
            ProbeType::Icmp => ProbeKind::Icmp(IcmpProber::new(&target.host, target.timeout())),
            ProbeType::Http => ProbeKind::Http(HttpProber::new(&target.host, target.timeout())),
        }
    }
}

impl Prober for ProbeKind {
    async fn run_batch(&self, count: u32) -> Result<Samples, ProbeError> {
        match self {
            ProbeKind::Icmp(p) => p.run_batch(count).await,
            ProbeKind::Http(p) => p.run_batch(count).await,
        }
    }
}

/// Random delay up to `max`, used to spread out targets that start together.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::random::<u64>() % max_ms)
}
