//! Satellite: fetches its targets from the head and runs one supervised
//! worker per target until shutdown.

mod client;
mod supervisor;
#[cfg(test)]
pub(crate) mod testing;
mod worker;

pub use client::*;
pub use supervisor::*;
pub use worker::*;

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::config::SatelliteConfig;
use crate::probe::ProbeKind;

/// Why the satellite stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The head holds a newer configuration; restart to pick it up.
    StaleConfig,
    /// Signal from the operator.
    Interrupted,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::StaleConfig => f.write_str("configuration is stale"),
            ShutdownReason::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Shared shutdown signal. The first recorded reason wins.
#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            tracing::info!("Shutting down: {}", reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Run the satellite until `shutdown` fires.
pub async fn run(
    cfg: &SatelliteConfig,
    secret: &str,
    shutdown: Shutdown,
) -> Result<ShutdownReason, SubmitError> {
    let client = Arc::new(HeadClient::new(
        &cfg.head,
        &cfg.name,
        secret,
        cfg.request_timeout(),
        cfg.retry_policy(),
    )?);

    let targets = client.fetch_targets().await?;
    for target in &targets {
        tracing::info!(
            target_name = %target.name,
            probe_type = %target.probe_type,
            "Monitoring {} every {}s",
            target.host,
            target.report_interval
        );
    }

    let supervisor = Supervisor::new(
        &cfg.name,
        client,
        ProbeKind::for_target,
        shutdown,
        cfg.restart_backoff(),
    );
    Ok(supervisor.run(targets).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert_eq!(shutdown.reason(), None);

        shutdown.trigger(ShutdownReason::StaleConfig);
        shutdown.clone().trigger(ShutdownReason::Interrupted);
        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::StaleConfig));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_for_clones() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };
        shutdown.trigger(ShutdownReason::Interrupted);
        waiter.await.unwrap();
    }
}
