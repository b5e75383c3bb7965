//! Test doubles for probers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{ProbeError, Prober, Samples};
use crate::models::{ProbeType, Target};

/// Prober that replays scripted results, then returns steady samples.
pub(crate) struct ScriptedProber {
    pub script: parking_lot::Mutex<VecDeque<Result<Samples, ProbeError>>>,
    pub calls: AtomicU32,
    pub latency: f64,
    /// Panic on this call number (1-based), to exercise crash isolation.
    pub panic_on_call: Option<u32>,
}

impl ScriptedProber {
    pub(crate) fn steady(latency: f64) -> Self {
        Self {
            script: parking_lot::Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            latency,
            panic_on_call: None,
        }
    }

    pub(crate) fn with_script(script: Vec<Result<Samples, ProbeError>>) -> Self {
        Self {
            script: parking_lot::Mutex::new(script.into()),
            ..Self::steady(1.0)
        }
    }

    pub(crate) fn panicking_on(call: u32) -> Self {
        Self {
            panic_on_call: Some(call),
            ..Self::steady(1.0)
        }
    }
}

impl Prober for ScriptedProber {
    async fn run_batch(&self, count: u32) -> Result<Samples, ProbeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_on_call == Some(call) {
            panic!("scripted prober panic on call {}", call);
        }
        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        Ok(Samples {
            latencies: vec![self.latency; count as usize],
            lost: 0,
        })
    }
}

pub(crate) fn target(name: &str, probes: u32, batch_size: u32) -> Target {
    Target {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        probe_type: ProbeType::Http,
        probes,
        batch_size,
        interval: 30,
        report_interval: 60,
        timeout: 1,
    }
}

impl Prober for std::sync::Arc<ScriptedProber> {
    fn run_batch(&self, count: u32) -> impl std::future::Future<Output = Result<Samples, ProbeError>> + Send {
        self.as_ref().run_batch(count)
    }
}
