//! Shared data types exchanged between the head and its satellites.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel stored in `ProbeBatch::min` when no sample in the batch succeeded.
pub const NO_SAMPLE_MIN: f64 = f64::MAX;

/// Transport used to measure a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeType {
    #[default]
    Icmp,
    Http,
}

impl ProbeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeType::Icmp => "icmp",
            ProbeType::Http => "http",
        }
    }
}

impl fmt::Display for ProbeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully normalized monitoring target.
///
/// Every field is populated; defaults are filled in once when the head loads
/// its configuration, so satellites never see a partially specified target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub host: String,
    pub probe_type: ProbeType,
    /// Samples per batch.
    pub probes: u32,
    /// Batches per report.
    pub batch_size: u32,
    /// Seconds between two batches of one report.
    pub interval: u64,
    /// Seconds slept before each reporting cycle.
    pub report_interval: u64,
    /// Per-sample timeout in seconds.
    pub timeout: u64,
}

impl Target {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// A remote agent and the targets it is allowed to pull.
#[derive(Debug, Clone, PartialEq)]
pub struct Satellite {
    pub name: String,
    pub secret: String,
    pub active: bool,
    pub targets: BTreeSet<String>,
}

/// Outward view of a satellite. The secret never leaves the head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteView {
    pub name: String,
    pub active: bool,
    pub targets: Vec<String>,
}

impl From<&Satellite> for SatelliteView {
    fn from(s: &Satellite) -> Self {
        Self {
            name: s.name.clone(),
            active: s.active,
            targets: s.targets.iter().cloned().collect(),
        }
    }
}

/// One aggregate measurement over `num_probes` samples. Latencies are in
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeBatch {
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub mean: f64,
    pub stddev: f64,
    /// Fraction of samples lost, 0.0 to 1.0.
    pub loss: f64,
    pub num_probes: u32,
    pub timestamp: DateTime<Utc>,
}

impl ProbeBatch {
    /// True when at least one sample in the batch came back.
    pub fn has_samples(&self) -> bool {
        self.loss < 1.0
    }
}

/// The bundle of batches submitted for one target in one reporting cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPacket {
    pub satellite_name: String,
    pub target_name: String,
    pub probe_type: ProbeType,
    pub probes: Vec<ProbeBatch>,
}
