//! Test doubles for submitters.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::{SubmitError, SubmitOutcome, Submitter};
use crate::models::ReportPacket;

/// Records packets and replays scripted outcomes, then reports delivery.
pub(crate) struct FakeSubmitter {
    packets: Mutex<Vec<ReportPacket>>,
    outcomes: Mutex<VecDeque<SubmitOutcome>>,
}

impl FakeSubmitter {
    pub(crate) fn delivering() -> Self {
        Self::with_outcomes(Vec::new())
    }

    pub(crate) fn with_outcomes(outcomes: Vec<SubmitOutcome>) -> Self {
        Self {
            packets: Mutex::new(Vec::new()),
            outcomes: Mutex::new(outcomes.into()),
        }
    }

    pub(crate) fn packets(&self) -> Vec<ReportPacket> {
        self.packets.lock().clone()
    }

    pub(crate) fn count(&self) -> usize {
        self.packets.lock().len()
    }

    pub(crate) fn count_for(&self, target: &str) -> usize {
        self.packets
            .lock()
            .iter()
            .filter(|p| p.target_name == target)
            .count()
    }
}

impl Submitter for FakeSubmitter {
    async fn submit(&self, packet: &ReportPacket) -> Result<SubmitOutcome, SubmitError> {
        self.packets.lock().push(packet.clone());
        Ok(self
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(SubmitOutcome::Delivered))
    }
}
