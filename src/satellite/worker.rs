//! Per-target probe-and-report loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{Shutdown, ShutdownReason, SubmitOutcome, Submitter};
use crate::models::Target;
use crate::probe::{ProbeEngine, Prober};

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Sleeping,
    Probing,
    Submitting,
    /// Ended without a shutdown; the supervisor restarts it.
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Sleeping => "sleeping",
            WorkerState::Probing => "probing",
            WorkerState::Submitting => "submitting",
            WorkerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Repeatedly sleeps `report_interval`, probes one packet and submits it.
pub struct Worker<P, S> {
    target: Target,
    satellite: String,
    prober: P,
    submitter: Arc<S>,
    shutdown: Shutdown,
    initial_delay: Duration,
    state: WorkerState,
}

impl<P: Prober, S: Submitter> Worker<P, S> {
    pub fn new(target: Target, satellite: &str, prober: P, submitter: Arc<S>, shutdown: Shutdown) -> Self {
        Self {
            target,
            satellite: satellite.to_string(),
            prober,
            submitter,
            shutdown,
            initial_delay: Duration::ZERO,
            state: WorkerState::Idle,
        }
    }

    /// Extra delay before the first cycle.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::trace!(target_name = %self.target.name, "{} -> {}", self.state, next);
        self.state = next;
    }

    /// Run until shutdown. Returns early only when the head reports the
    /// configuration as stale, after triggering shutdown.
    pub async fn run(mut self) {
        self.transition(WorkerState::Sleeping);
        let mut delay = self.initial_delay + self.target.report_interval();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.target.report_interval();

            self.transition(WorkerState::Probing);
            let engine = ProbeEngine::new(&self.target, &self.prober);
            let packet = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                packet = engine.run(&self.satellite) => packet,
            };

            self.transition(WorkerState::Submitting);
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                outcome = self.submitter.submit(&packet) => outcome,
            };

            match outcome {
                Ok(SubmitOutcome::Delivered) => {
                    tracing::debug!(target_name = %self.target.name, "Report delivered");
                }
                Ok(SubmitOutcome::StaleConfig) => {
                    tracing::info!(
                        target_name = %self.target.name,
                        "Head has a newer configuration"
                    );
                    self.shutdown.trigger(ShutdownReason::StaleConfig);
                    return;
                }
                Ok(SubmitOutcome::Rejected(status)) => {
                    tracing::warn!(
                        target_name = %self.target.name,
                        "Head rejected report with status {}",
                        status
                    );
                }
                Ok(SubmitOutcome::Discarded { attempts }) => {
                    tracing::warn!(
                        target_name = %self.target.name,
                        "Report discarded after {} attempts",
                        attempts
                    );
                }
                Err(e) => {
                    tracing::error!(target_name = %self.target.name, "Failed to submit report: {}", e);
                }
            }

            self.transition(WorkerState::Sleeping);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::{target, ScriptedProber};
    use crate::satellite::testing::FakeSubmitter;

    fn worker(submitter: Arc<FakeSubmitter>, shutdown: &Shutdown) -> Worker<ScriptedProber, FakeSubmitter> {
        // 2 batches 30s apart, reported every 60s
        Worker::new(target("web1", 3, 2), "sat-a", ScriptedProber::steady(4.0), submitter, shutdown.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_on_schedule() {
        let submitter = Arc::new(FakeSubmitter::delivering());
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(worker(submitter.clone(), &shutdown).run());

        // first packet lands at 60s sleep + 30s between batches
        tokio::time::sleep(Duration::from_secs(89)).await;
        assert_eq!(submitter.count(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(submitter.count(), 1);

        let packets = submitter.packets();
        assert_eq!(packets[0].satellite_name, "sat-a");
        assert_eq!(packets[0].probes.len(), 2);
        assert!(packets[0].probes.iter().all(|b| b.num_probes == 3 && b.loss == 0.0));

        // next one after another 60s + 30s
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(submitter.count(), 2);

        shutdown.trigger(ShutdownReason::Interrupted);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_config_triggers_shutdown() {
        let submitter = Arc::new(FakeSubmitter::with_outcomes(vec![SubmitOutcome::StaleConfig]));
        let shutdown = Shutdown::new();
        worker(submitter.clone(), &shutdown).run().await;

        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::StaleConfig));
        assert_eq!(submitter.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_is_not_fatal() {
        let submitter = Arc::new(FakeSubmitter::with_outcomes(vec![
            SubmitOutcome::Discarded { attempts: 3 },
            SubmitOutcome::Rejected(400),
        ]));
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(worker(submitter.clone(), &shutdown).run());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(submitter.count(), 3);
        assert!(!handle.is_finished());
        assert!(!shutdown.is_triggered());

        shutdown.trigger(ShutdownReason::Interrupted);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep() {
        let submitter = Arc::new(FakeSubmitter::delivering());
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(worker(submitter.clone(), &shutdown).with_initial_delay(Duration::from_secs(5)).run());

        tokio::time::sleep(Duration::from_secs(10)).await;
        shutdown.trigger(ShutdownReason::Interrupted);
        handle.await.unwrap();
        assert_eq!(submitter.count(), 0);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(WorkerState::Failed.to_string(), "failed");
        assert_eq!(WorkerState::Idle.to_string(), "idle");
    }
}
