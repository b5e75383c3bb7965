//! Drives a prober through one reporting cycle.

use super::{aggregate, Prober, Samples};
use crate::models::{ProbeBatch, ReportPacket, Target};

/// Attempts to acquire a prober before a batch is given up as fully lost.
pub const MAX_ACQUIRE_ATTEMPTS: u32 = 3;

/// Runs `batch_size` batches of `probes` samples against one target.
pub struct ProbeEngine<'a, P> {
    target: &'a Target,
    prober: &'a P,
}

impl<'a, P: Prober> ProbeEngine<'a, P> {
    pub fn new(target: &'a Target, prober: &'a P) -> Self {
        Self { target, prober }
    }

    /// Produce a packet with exactly `batch_size` batches, in sampling order.
    ///
    /// Sleeps the target's interval between batches, not before the first.
    pub async fn run(&self, satellite_name: &str) -> ReportPacket {
        let target = self.target;
        let mut batches = Vec::with_capacity(target.batch_size as usize);

        for i in 0..target.batch_size {
            if i != 0 {
                tracing::debug!(
                    target_name = %target.name,
                    interval = target.interval,
                    "Sleeping between batches"
                );
                tokio::time::sleep(target.interval()).await;
            }
            batches.push(self.run_batch().await);
        }

        ReportPacket {
            satellite_name: satellite_name.to_string(),
            target_name: target.name.clone(),
            probe_type: target.probe_type,
            probes: batches,
        }
    }

    async fn run_batch(&self) -> ProbeBatch {
        let target = self.target;
        let mut attempt = 1;

        let samples = loop {
            match self.prober.run_batch(target.probes).await {
                Ok(samples) => break samples,
                Err(e) if attempt < MAX_ACQUIRE_ATTEMPTS => {
                    tracing::warn!(
                        target_name = %target.name,
                        attempt,
                        "Prober unavailable, retrying batch: {}",
                        e
                    );
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        target_name = %target.name,
                        "Prober unavailable after {} attempts, reporting full loss: {}",
                        attempt,
                        e
                    );
                    break Samples::all_lost(target.probes);
                }
            }
        };

        let batch = aggregate(&samples, target.probes);
        tracing::debug!(
            target_name = %target.name,
            probe_type = %target.probe_type,
            min = batch.min,
            max = batch.max,
            median = batch.median,
            loss = batch.loss,
            "Batch complete"
        );
        batch
    }
}
