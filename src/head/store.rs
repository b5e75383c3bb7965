//! Authoritative, versioned head state behind one lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::config::{ConfigError, ConfigFile, ConfigSnapshot};

/// Live per-satellite state, kept outside the persisted configuration.
#[derive(Debug, Clone)]
pub struct Liveness {
    /// Last accepted report, or the time the satellite entered the configuration.
    pub last_report: DateTime<Utc>,
    /// Hash of the last accepted body per target.
    last_hashes: HashMap<String, String>,
}

impl Liveness {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            last_report: at,
            last_hashes: HashMap::new(),
        }
    }
}

/// Result of recording a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportReceipt {
    /// First time this body was seen; it should be ingested.
    Accepted,
    /// Same body as the previous accepted report for this target.
    Duplicate,
}

struct StoreState {
    snapshot: Arc<ConfigSnapshot>,
    liveness: HashMap<String, Liveness>,
}

/// Thread-safe configuration store.
///
/// Reads, mutations and persistence all go through one mutex, so readers see
/// either the old or the new snapshot and a write to disk never races a swap.
pub struct ConfigStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl ConfigStore {
    /// Load the configuration file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let file = read_file(&path)?;
        let store = Self::build(file, Some(path))?;
        let snap = store.get();
        tracing::info!(
            "Loaded configuration version {} ({} satellites, {} targets)",
            snap.version,
            snap.satellites.len(),
            snap.targets.len()
        );
        Ok(store)
    }

    /// A store with no backing file. Mutations are kept in memory only.
    #[cfg(test)]
    pub fn in_memory(file: ConfigFile) -> Result<Self, ConfigError> {
        Self::build(file, None)
    }

    fn build(file: ConfigFile, path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let version = next_version(file.version);
        let snapshot = Arc::new(ConfigSnapshot::build(file, version)?);
        let mut liveness = HashMap::new();
        reconcile_liveness(&snapshot, &mut liveness, Utc::now());
        Ok(Self {
            path,
            state: Mutex::new(StoreState { snapshot, liveness }),
        })
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<ConfigSnapshot> {
        self.state.lock().snapshot.clone()
    }

    /// Re-read the backing file. On failure the current configuration stays.
    pub fn reload(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("no configuration file to reload".to_string()))?;

        let mut state = self.state.lock();
        let file = read_file(path)?;
        let version = next_version(state.snapshot.version.max(file.version));
        let snapshot = Arc::new(ConfigSnapshot::build(file, version)?);
        self.swap(&mut state, snapshot.clone());
        tracing::info!("Reloaded configuration, now version {}", snapshot.version);
        Ok(snapshot)
    }

    /// Replace the whole configuration.
    pub fn replace(&self, file: ConfigFile) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        self.update(|current| {
            *current = file;
            Ok::<(), ConfigError>(())
        })
    }

    /// Apply `mutate` to a copy of the current file, then validate, persist
    /// and swap. Nothing changes if any step fails.
    pub fn update<F, E>(&self, mutate: F) -> Result<Arc<ConfigSnapshot>, E>
    where
        F: FnOnce(&mut ConfigFile) -> Result<(), E>,
        E: From<ConfigError>,
    {
        let mut state = self.state.lock();
        let mut file = state.snapshot.to_file();
        mutate(&mut file)?;

        let snapshot = Arc::new(ConfigSnapshot::build(file, next_version(state.snapshot.version))?);
        if let Some(path) = &self.path {
            write_file(path, &snapshot.to_file())?;
        }
        self.swap(&mut state, snapshot.clone());
        tracing::info!("Configuration replaced, now version {}", snapshot.version);
        Ok(snapshot)
    }

    fn swap(&self, state: &mut StoreState, snapshot: Arc<ConfigSnapshot>) {
        reconcile_liveness(&snapshot, &mut state.liveness, Utc::now());
        state.snapshot = snapshot;
    }

    /// Record a successful report from `satellite` for `target`.
    pub fn record_report(
        &self,
        satellite: &str,
        target: &str,
        hash: &str,
        at: DateTime<Utc>,
    ) -> ReportReceipt {
        let mut state = self.state.lock();
        let entry = state
            .liveness
            .entry(satellite.to_string())
            .or_insert_with(|| Liveness::new(at));
        entry.last_report = at;

        match entry.last_hashes.insert(target.to_string(), hash.to_string()) {
            Some(previous) if previous == hash => ReportReceipt::Duplicate,
            _ => ReportReceipt::Accepted,
        }
    }

    /// Snapshot and liveness taken under the same lock.
    pub fn liveness(&self) -> (Arc<ConfigSnapshot>, HashMap<String, Liveness>) {
        let state = self.state.lock();
        (state.snapshot.clone(), state.liveness.clone())
    }
}

/// Next version stamp: wall-clock milliseconds, always above `previous`.
fn next_version(previous: i64) -> i64 {
    Utc::now().timestamp_millis().max(previous + 1)
}

/// Keep liveness for satellites that survive, start the clock for new ones,
/// drop the rest.
fn reconcile_liveness(
    snapshot: &ConfigSnapshot,
    liveness: &mut HashMap<String, Liveness>,
    now: DateTime<Utc>,
) {
    liveness.retain(|name, _| snapshot.satellites.contains_key(name));
    for name in snapshot.satellites.keys() {
        liveness
            .entry(name.clone())
            .or_insert_with(|| Liveness::new(now));
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Write through a temporary file and rename, so readers never see a torn file.
fn write_file(path: &Path, file: &ConfigFile) -> Result<(), ConfigError> {
    let data = serde_json::to_vec_pretty(file)?;
    let tmp = path.with_extension("tmp");
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(&tmp, data).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
