//! SQLite metric sink.

#[cfg(test)]
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;

use super::{MetricSink, SinkError};
use crate::models::ReportPacket;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// A batch as stored. Statistics are `None` for batches without samples.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBatch {
    pub time: DateTime<Utc>,
    pub probe_type: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub median: Option<f64>,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    pub loss: f64,
    pub num_probes: u32,
}

/// Thread-safe SQLite sink, one row per batch.
#[derive(Clone)]
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    /// Open (or create) the database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        Self::with_connection(Connection::open(path)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SinkError> {
        conn.execute_batch(include_str!("../../migrations/0001_probe_batches.sql"))
            .map_err(|e| SinkError::Migration(format!("schema setup failed: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[cfg(test)]
impl SqliteSink {
    pub fn in_memory() -> Result<Self, SinkError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Batches stored for a satellite/target pair, oldest first.
    pub fn batches(&self, satellite: &str, target: &str) -> Result<Vec<StoredBatch>, SinkError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, probe_type, min, max, median, mean, stddev, loss, num_probes
             FROM probe_batches WHERE satellite = ?1 AND target = ?2 ORDER BY time ASC, id ASC",
        )?;

        let rows = stmt
            .query_map(params![satellite, target], |row| {
                let time: String = row.get(0)?;
                Ok(StoredBatch {
                    time: parse_db_time(&time).unwrap_or_else(Utc::now),
                    probe_type: row.get(1)?,
                    min: row.get(2)?,
                    max: row.get(3)?,
                    median: row.get(4)?,
                    mean: row.get(5)?,
                    stddev: row.get(6)?,
                    loss: row.get(7)?,
                    num_probes: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }
}

impl MetricSink for SqliteSink {
    fn write(&self, packets: &[ReportPacket]) -> Result<(), SinkError> {
        if packets.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO probe_batches
                 (time, satellite, target, probe_type, min, max, median, mean, stddev, loss, num_probes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;

            for packet in packets {
                for batch in &packet.probes {
                    let stat = |v: f64| batch.has_samples().then_some(v);
                    stmt.execute(params![
                        batch.timestamp.format(TIME_FORMAT).to_string(),
                        packet.satellite_name,
                        packet.target_name,
                        packet.probe_type.as_str(),
                        stat(batch.min),
                        stat(batch.max),
                        stat(batch.median),
                        stat(batch.mean),
                        stat(batch.stddev),
                        batch.loss,
                        batch.num_probes,
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .ok()
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
}
