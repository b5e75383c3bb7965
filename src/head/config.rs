//! Head configuration file and the validated snapshot built from it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ProbeType, Satellite, SatelliteView, Target};

pub const DEFAULT_PROBES: u32 = 5;
pub const DEFAULT_BATCH_SIZE: u32 = 5;
pub const DEFAULT_INTERVAL: u64 = 30;
pub const DEFAULT_TIMEOUT: u64 = 5;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// On-disk layout of the head configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Version stamp of the last write. Loaded versions only ever move past it.
    #[serde(default)]
    pub version: i64,
    pub admin_secret: String,
    #[serde(default)]
    pub sink: SinkSettings,
    #[serde(default)]
    pub satellites: Vec<SatelliteSpec>,
    /// Targets keyed by name.
    #[serde(default)]
    pub targets: BTreeMap<String, TargetSpec>,
}

/// Where accepted reports are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSettings {
    /// SQLite database file (default: "nprobe.db")
    #[serde(default = "default_sink_path")]
    pub path: PathBuf,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            path: default_sink_path(),
        }
    }
}

fn default_sink_path() -> PathBuf {
    PathBuf::from("nprobe.db")
}

fn default_true() -> bool {
    true
}

/// A target as written in the file. Absent fields take documented defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_type: Option<ProbeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl TargetSpec {
    /// Fill defaults and check values. `name` comes from the map key.
    pub fn normalize(&self, name: &str) -> Result<Target, ConfigError> {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid("target name must not be empty".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("target {}: host must not be empty", name)));
        }

        let interval = positive(name, "interval", self.interval, DEFAULT_INTERVAL)?;
        Ok(Target {
            name: name.to_string(),
            host: self.host.trim().to_string(),
            probe_type: self.probe_type.unwrap_or_default(),
            probes: positive(name, "probes", self.probes, DEFAULT_PROBES)?,
            batch_size: positive(name, "batch_size", self.batch_size, DEFAULT_BATCH_SIZE)?,
            interval,
            report_interval: positive(name, "report_interval", self.report_interval, interval)?,
            timeout: positive(name, "timeout", self.timeout, DEFAULT_TIMEOUT)?,
        })
    }
}

fn positive<T>(target: &str, field: &str, value: Option<T>, default: T) -> Result<T, ConfigError>
where
    T: Copy + PartialEq + Default,
{
    match value {
        None => Ok(default),
        Some(v) if v == T::default() => Err(ConfigError::Invalid(format!(
            "target {}: {} must be greater than zero",
            target, field
        ))),
        Some(v) => Ok(v),
    }
}

/// A satellite as written in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatelliteSpec {
    pub name: String,
    pub secret: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub targets: BTreeSet<String>,
}

/// Validated, immutable view of one configuration version.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: i64,
    pub admin_secret: String,
    pub sink: SinkSettings,
    pub satellites: BTreeMap<String, Satellite>,
    pub targets: BTreeMap<String, Target>,
    source: ConfigFile,
}

impl ConfigSnapshot {
    /// Normalize and validate `file`, stamping it with `version`.
    pub fn build(mut file: ConfigFile, version: i64) -> Result<Self, ConfigError> {
        if file.admin_secret.is_empty() {
            return Err(ConfigError::Invalid("admin_secret must not be empty".to_string()));
        }

        let targets = file
            .targets
            .iter()
            .map(|(name, spec)| spec.normalize(name).map(|t| (name.clone(), t)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let mut satellites = BTreeMap::new();
        for spec in &file.satellites {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::Invalid("satellite name must not be empty".to_string()));
            }
            if spec.secret.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "satellite {}: secret must not be empty",
                    spec.name
                )));
            }
            if let Some(missing) = spec.targets.iter().find(|t| !targets.contains_key(*t)) {
                return Err(ConfigError::Invalid(format!(
                    "satellite {} references unknown target {}",
                    spec.name, missing
                )));
            }
            let satellite = Satellite {
                name: spec.name.clone(),
                secret: spec.secret.clone(),
                active: spec.active,
                targets: spec.targets.clone(),
            };
            if satellites.insert(spec.name.clone(), satellite).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "satellite {} is defined twice",
                    spec.name
                )));
            }
        }

        file.version = version;
        Ok(Self {
            version,
            admin_secret: file.admin_secret.clone(),
            sink: file.sink.clone(),
            satellites,
            targets,
            source: file,
        })
    }

    /// The file this snapshot was built from, carrying its version.
    pub fn to_file(&self) -> ConfigFile {
        self.source.clone()
    }

    /// Targets assigned to `satellite`, ordered by name.
    pub fn targets_for(&self, satellite: &Satellite) -> Vec<Target> {
        satellite
            .targets
            .iter()
            .filter_map(|name| self.targets.get(name))
            .cloned()
            .collect()
    }

    /// Configuration without secrets, for the admin API.
    pub fn redacted(&self) -> ConfigView {
        ConfigView {
            version: self.version,
            sink: self.sink.clone(),
            satellites: self.satellites.values().map(SatelliteView::from).collect(),
            targets: self.targets.values().cloned().collect(),
        }
    }
}

/// Outward view of the configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub version: i64,
    pub sink: SinkSettings,
    pub satellites: Vec<SatelliteView>,
    pub targets: Vec<Target>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_file() -> ConfigFile {
        serde_json::from_str(
            r#"{
                "admin_secret": "admin",
                "satellites": [
                    {"name": "sat-a", "secret": "sa", "targets": ["web1", "icmp1"]},
                    {"name": "sat-b", "secret": "sb", "active": false, "targets": ["icmp1"]}
                ],
                "targets": {
                    "web1": {"host": "http://example.com", "probe_type": "http", "probes": 3, "batch_size": 2, "interval": 30},
                    "icmp1": {"host": "192.0.2.1", "interval": 60}
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_are_filled() {
        let snap = ConfigSnapshot::build(sample_file(), 1).unwrap();
        let icmp = &snap.targets["icmp1"];
        assert_eq!(icmp.name, "icmp1");
        assert_eq!(icmp.probe_type, ProbeType::Icmp);
        assert_eq!(icmp.probes, DEFAULT_PROBES);
        assert_eq!(icmp.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(icmp.interval, 60);
        assert_eq!(icmp.report_interval, 60);
        assert_eq!(icmp.timeout, DEFAULT_TIMEOUT);

        let web = &snap.targets["web1"];
        assert_eq!(web.probe_type, ProbeType::Http);
        assert_eq!(web.probes, 3);
        assert_eq!(web.batch_size, 2);
    }

    #[test]
    fn test_interval_default() {
        let spec = TargetSpec {
            host: "h".to_string(),
            ..Default::default()
        };
        let t = spec.normalize("t").unwrap();
        assert_eq!(t.interval, DEFAULT_INTERVAL);
        assert_eq!(t.report_interval, DEFAULT_INTERVAL);
    }

    #[test]
    fn test_dangling_target_is_rejected() {
        let mut file = sample_file();
        file.satellites[0].targets.insert("nope".to_string());
        let err = ConfigSnapshot::build(file, 1).unwrap_err();
        assert!(err.to_string().contains("unknown target nope"));
    }

    #[test]
    fn test_zero_is_not_a_default() {
        let mut file = sample_file();
        file.targets.get_mut("web1").unwrap().probes = Some(0);
        assert!(matches!(ConfigSnapshot::build(file, 1), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_satellite_is_rejected() {
        let mut file = sample_file();
        let dup = file.satellites[0].clone();
        file.satellites.push(dup);
        assert!(ConfigSnapshot::build(file, 1).is_err());
    }

    #[test]
    fn test_missing_admin_secret_is_rejected() {
        let mut file = sample_file();
        file.admin_secret.clear();
        assert!(ConfigSnapshot::build(file, 1).is_err());
    }

    #[test]
    fn test_unknown_probe_type_fails_to_parse() {
        let raw = r#"{"admin_secret": "a", "targets": {"x": {"host": "h", "probe_type": "dns"}}}"#;
        assert!(serde_json::from_str::<ConfigFile>(raw).is_err());
    }

    #[test]
    fn test_redacted_view_has_no_secrets() {
        let snap = ConfigSnapshot::build(sample_file(), 7).unwrap();
        let json = serde_json::to_string(&snap.redacted()).unwrap();
        assert!(!json.contains("\"sa\""));
        assert!(!json.contains("admin"));
        assert!(json.contains("\"version\":7"));
    }

    #[test]
    fn test_round_trip_keeps_absent_fields_absent() {
        let snap = ConfigSnapshot::build(sample_file(), 9).unwrap();
        let file = snap.to_file();
        assert_eq!(file.version, 9);
        assert_eq!(file.targets["icmp1"].probes, None);
    }
}
