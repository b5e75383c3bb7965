//! Satellite authorization and liveness.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use thiserror::Error;

use super::config::ConfigSnapshot;
use super::store::Liveness;
use crate::models::Satellite;

/// Authorization failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("satellite {0} is not configured")]
    UnknownSatellite(String),
    #[error("missing or invalid secret")]
    BadSecret,
    #[error("satellite {0} is inactive")]
    Inactive(String),
}

/// Compare secrets without stopping at the first differing byte.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0 && !expected.is_empty()
}

/// Check a satellite-scoped request: the satellite must exist, the secret
/// must match, and it must be active.
pub fn authorize_satellite<'a>(
    snapshot: &'a ConfigSnapshot,
    name: &str,
    presented: Option<&str>,
) -> Result<&'a Satellite, AuthError> {
    let satellite = snapshot
        .satellites
        .get(name)
        .ok_or_else(|| AuthError::UnknownSatellite(name.to_string()))?;

    if !presented.is_some_and(|p| secrets_match(&satellite.secret, p)) {
        return Err(AuthError::BadSecret);
    }
    if !satellite.active {
        return Err(AuthError::Inactive(name.to_string()));
    }
    Ok(satellite)
}

/// Check an administrative request.
pub fn authorize_admin(snapshot: &ConfigSnapshot, presented: Option<&str>) -> Result<(), AuthError> {
    if presented.is_some_and(|p| secrets_match(&snapshot.admin_secret, p)) {
        Ok(())
    } else {
        Err(AuthError::BadSecret)
    }
}

/// Liveness of one satellite.
#[derive(Debug, Clone, Serialize)]
pub struct SatelliteHealth {
    pub name: String,
    pub last_report: DateTime<Utc>,
    pub elapsed_secs: i64,
    /// Smallest report interval among the satellite's targets.
    pub threshold_secs: u64,
    pub healthy: bool,
    /// Target with the smallest report interval.
    pub target: String,
}

/// Liveness of all active satellites.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub satellites: Vec<SatelliteHealth>,
}

impl HealthReport {
    pub fn failing(&self) -> impl Iterator<Item = &SatelliteHealth> {
        self.satellites.iter().filter(|s| !s.healthy)
    }
}

/// Derive health at `now`.
///
/// A satellite is degraded once the time since its last report exceeds the
/// smallest report interval among its targets. Inactive satellites and
/// satellites without targets are not expected to report.
pub fn evaluate_health(
    snapshot: &ConfigSnapshot,
    liveness: &HashMap<String, Liveness>,
    now: DateTime<Utc>,
) -> HealthReport {
    let mut satellites = Vec::new();

    for satellite in snapshot.satellites.values().filter(|s| s.active) {
        let Some(fastest) = snapshot
            .targets_for(satellite)
            .into_iter()
            .min_by_key(|t| t.report_interval)
        else {
            continue;
        };

        let last_report = liveness
            .get(&satellite.name)
            .map(|l| l.last_report)
            .unwrap_or(now);
        let elapsed = now - last_report;
        let threshold = ChronoDuration::seconds(fastest.report_interval as i64);

        satellites.push(SatelliteHealth {
            name: satellite.name.clone(),
            last_report,
            elapsed_secs: elapsed.num_seconds(),
            threshold_secs: fastest.report_interval,
            healthy: elapsed <= threshold,
            target: fastest.name,
        });
    }

    HealthReport {
        healthy: satellites.iter().all(|s| s.healthy),
        satellites,
    }
}
