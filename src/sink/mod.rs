//! Metric sink for accepted reports.
//!
//! Handlers push packets onto a bounded channel; a single writer task buffers
//! them and flushes to the sink in batches.

mod sqlite;

pub use sqlite::*;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::ReportPacket;

/// Packets buffered before a forced flush.
pub const FLUSH_THRESHOLD: usize = 100;
/// Time between periodic flushes.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Sink error types.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Destination for accepted reports.
pub trait MetricSink: Send + Sync + 'static {
    fn write(&self, packets: &[ReportPacket]) -> Result<(), SinkError>;
}

/// Start the batch writer. The task ends once every sender is dropped and the
/// remaining buffer is flushed.
pub fn spawn_writer<S: MetricSink>(
    sink: Arc<S>,
    capacity: usize,
) -> (mpsc::Sender<ReportPacket>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(run_batch_writer(rx, sink));
    (tx, handle)
}

async fn run_batch_writer<S: MetricSink>(mut rx: mpsc::Receiver<ReportPacket>, sink: Arc<S>) {
    let mut buffer: Vec<ReportPacket> = Vec::with_capacity(FLUSH_THRESHOLD);
    let start = tokio::time::Instant::now() + FLUSH_INTERVAL;
    let mut interval = tokio::time::interval_at(start, FLUSH_INTERVAL);

    loop {
        tokio::select! {
            packet = rx.recv() => {
                match packet {
                    Some(p) => {
                        buffer.push(p);
                        if buffer.len() >= FLUSH_THRESHOLD {
                            flush_buffer(sink.as_ref(), &mut buffer);
                        }
                    }
                    None => {
                        flush_buffer(sink.as_ref(), &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(sink.as_ref(), &mut buffer);
            }
        }
    }
    tracing::debug!("Metric writer stopped");
}

fn flush_buffer<S: MetricSink>(sink: &S, buffer: &mut Vec<ReportPacket>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = sink.write(buffer) {
        tracing::error!("Failed to flush {} reports: {}", buffer.len(), e);
    }

    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProbeType;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        flushes: Mutex<Vec<usize>>,
        fail: bool,
    }

    impl MetricSink for RecordingSink {
        fn write(&self, packets: &[ReportPacket]) -> Result<(), SinkError> {
            self.flushes.lock().push(packets.len());
            if self.fail {
                return Err(SinkError::Migration("unavailable".to_string()));
            }
            Ok(())
        }
    }

    fn packet(n: usize) -> ReportPacket {
        ReportPacket {
            satellite_name: "sat-a".to_string(),
            target_name: format!("t{}", n),
            probe_type: ProbeType::Icmp,
            probes: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_at_threshold_and_on_close() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, handle) = spawn_writer(sink.clone(), 256);
        for n in 0..150 {
            tx.send(packet(n)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
        assert_eq!(*sink.flushes.lock(), vec![100, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_periodically() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, handle) = spawn_writer(sink.clone(), 16);
        tx.send(packet(0)).await.unwrap();

        tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(100)).await;
        assert_eq!(*sink.flushes.lock(), vec![1]);

        drop(tx);
        handle.await.unwrap();
        assert_eq!(*sink.flushes.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_stop_writer() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let (tx, handle) = spawn_writer(sink.clone(), 256);
        for n in 0..101 {
            tx.send(packet(n)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();
        assert_eq!(*sink.flushes.lock(), vec![100, 1]);
    }

    #[tokio::test]
    async fn test_writer_feeds_sqlite() {
        let sink = Arc::new(SqliteSink::in_memory().unwrap());
        let (tx, handle) = spawn_writer(sink.clone(), 8);
        let mut p = packet(0);
        p.probes.push(crate::probe::aggregate(&crate::probe::Samples::all_lost(3), 3));
        tx.send(p).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let rows = sink.batches("sat-a", "t0").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].loss, 1.0);
    }
}
