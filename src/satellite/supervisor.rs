//! Supervision of per-target workers.
//!
//! Each worker runs in its own task. A monitor task awaits it and reports the
//! exit on a completion channel, so a panic in one target never reaches the
//! others. The supervisor relaunches exited workers after a backoff until
//! shutdown, then aborts everything that is still running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError};

use super::{Shutdown, ShutdownReason, Submitter, Worker, WorkerState};
use crate::models::Target;
use crate::probe::{jitter, Prober};

/// Upper bound of the random delay before a worker's first cycle.
const START_JITTER: Duration = Duration::from_secs(1);

struct WorkerExit {
    target: String,
    outcome: Result<(), JoinError>,
}

pub struct Supervisor<S, F> {
    satellite: String,
    submitter: Arc<S>,
    make_prober: F,
    shutdown: Shutdown,
    restart_backoff: Duration,
}

impl<S, F, P> Supervisor<S, F>
where
    S: Submitter,
    F: Fn(&Target) -> P,
    P: Prober,
{
    pub fn new(
        satellite: &str,
        submitter: Arc<S>,
        make_prober: F,
        shutdown: Shutdown,
        restart_backoff: Duration,
    ) -> Self {
        Self {
            satellite: satellite.to_string(),
            submitter,
            make_prober,
            shutdown,
            restart_backoff,
        }
    }

    /// Supervise one worker per target until shutdown.
    pub async fn run(self, targets: Vec<Target>) -> ShutdownReason {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let mut workers: HashMap<String, AbortHandle> = HashMap::new();
        let targets: HashMap<String, Target> =
            targets.into_iter().map(|t| (t.name.clone(), t)).collect();

        tracing::info!("Starting {} workers", targets.len());
        for target in targets.values() {
            let delay = jitter(START_JITTER.min(target.report_interval()));
            let handle = self.launch(target.clone(), delay, &exit_tx);
            workers.insert(target.name.clone(), handle);
        }

        loop {
            let exit: WorkerExit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(exit) = exit_rx.recv() => exit,
            };
            if self.shutdown.is_triggered() {
                break;
            }

            match &exit.outcome {
                Err(e) if e.is_panic() => {
                    tracing::error!(
                        target_name = %exit.target,
                        state = %WorkerState::Failed,
                        "Worker panicked, restarting in {:?}",
                        self.restart_backoff
                    );
                }
                Err(e) => {
                    tracing::error!(
                        target_name = %exit.target,
                        state = %WorkerState::Failed,
                        "Worker stopped ({}), restarting in {:?}",
                        e,
                        self.restart_backoff
                    );
                }
                Ok(()) => {
                    tracing::warn!(
                        target_name = %exit.target,
                        state = %WorkerState::Failed,
                        "Worker returned without shutdown, restarting in {:?}",
                        self.restart_backoff
                    );
                }
            }

            if let Some(target) = targets.get(&exit.target) {
                let handle = self.launch(target.clone(), self.restart_backoff, &exit_tx);
                workers.insert(exit.target, handle);
            }
        }

        for handle in workers.values() {
            handle.abort();
        }
        let reason = self.shutdown.reason().unwrap_or(ShutdownReason::Interrupted);
        tracing::info!("Stopped {} workers: {}", workers.len(), reason);
        reason
    }

    fn launch(
        &self,
        target: Target,
        delay: Duration,
        exit_tx: &mpsc::UnboundedSender<WorkerExit>,
    ) -> AbortHandle {
        let name = target.name.clone();
        let prober = (self.make_prober)(&target);
        let worker = Worker::new(
            target,
            &self.satellite,
            prober,
            self.submitter.clone(),
            self.shutdown.clone(),
        )
        .with_initial_delay(delay);

        let handle = tokio::spawn(worker.run());
        let abort = handle.abort_handle();
        let exit_tx = exit_tx.clone();
        tokio::spawn(async move {
            let outcome = handle.await;
            let _ = exit_tx.send(WorkerExit {
                target: name,
                outcome,
            });
        });
        abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::{target, ScriptedProber};
    use crate::satellite::testing::FakeSubmitter;
    use crate::satellite::SubmitOutcome;
    use std::sync::atomic::Ordering;

    fn one_batch(name: &str) -> Target {
        // reported every 60s
        target(name, 2, 1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_worker_is_isolated_and_restarted() {
        let submitter = Arc::new(FakeSubmitter::delivering());
        let shutdown = Shutdown::new();
        let flaky = Arc::new(ScriptedProber::panicking_on(1));
        let steady = Arc::new(ScriptedProber::steady(2.0));

        let supervisor = {
            let (flaky, steady) = (flaky.clone(), steady.clone());
            Supervisor::new(
                "sat-a",
                submitter.clone(),
                move |t: &Target| if t.name == "a" { flaky.clone() } else { steady.clone() },
                shutdown.clone(),
                Duration::from_secs(1),
            )
        };

        let driver = async {
            // "a" panics at ~60s and restarts 1s later
            tokio::time::sleep(Duration::from_secs(200)).await;
            shutdown.trigger(ShutdownReason::Interrupted);
        };
        let (reason, ()) = tokio::join!(supervisor.run(vec![one_batch("a"), one_batch("b")]), driver);

        assert_eq!(reason, ShutdownReason::Interrupted);
        assert_eq!(submitter.count_for("b"), 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(submitter.count_for("a"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_config_ends_supervision() {
        let submitter = Arc::new(FakeSubmitter::with_outcomes(vec![SubmitOutcome::StaleConfig]));
        let shutdown = Shutdown::new();
        let supervisor = Supervisor::new(
            "sat-a",
            submitter.clone(),
            |_: &Target| ScriptedProber::steady(1.0),
            shutdown.clone(),
            Duration::from_secs(1),
        );

        let reason = supervisor.run(vec![one_batch("a"), one_batch("b")]).await;
        assert_eq!(reason, ShutdownReason::StaleConfig);
        assert_eq!(shutdown.reason(), Some(ShutdownReason::StaleConfig));
        // the other worker is aborted rather than drained
        assert!(submitter.count() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_before_first_cycle() {
        let submitter = Arc::new(FakeSubmitter::delivering());
        let shutdown = Shutdown::new();
        shutdown.trigger(ShutdownReason::Interrupted);

        let supervisor = Supervisor::new(
            "sat-a",
            submitter.clone(),
            |_: &Target| ScriptedProber::steady(1.0),
            shutdown,
            Duration::ZERO,
        );
        assert_eq!(supervisor.run(vec![one_batch("a")]).await, ShutdownReason::Interrupted);
        assert_eq!(submitter.count(), 0);
    }
}
