//! Streaming scan progress.
//!
//! Snapshots are built and emitted on the coordinating thread only, after
//! every completed job, so a sink never observes a torn update.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::pool::PoolStats;

/// Point-in-time view of a running scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub files_scanned: u64,
    pub bytes_read: u64,
    pub detections: u64,
    pub errors: u64,
    pub in_flight: usize,
    pub queued: usize,
    pub busy_workers: usize,
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

/// Callback receiving progress snapshots.
pub type ProgressSink = Arc<dyn Fn(&ScanProgress) + Send + Sync>;

/// Coordinator-side progress state.
pub(crate) struct Telemetry {
    started: Instant,
    progress: ScanProgress,
    sink: Option<ProgressSink>,
}

impl Telemetry {
    pub(crate) fn new(sink: Option<ProgressSink>) -> Self {
        Self {
            started: Instant::now(),
            progress: ScanProgress::default(),
            sink,
        }
    }

    pub(crate) fn file_done(
        &mut self,
        bytes_read: u64,
        detections: usize,
        failed: bool,
        pool: PoolStats,
    ) {
        self.progress.files_scanned += 1;
        self.progress.bytes_read += bytes_read;
        self.progress.detections += detections as u64;
        if failed {
            self.progress.errors += 1;
        }
        self.set_pool(pool);
        self.emit();
    }

    pub(crate) fn walk_error(&mut self) {
        self.progress.errors += 1;
        self.emit();
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn set_pool(&mut self, pool: PoolStats) {
        self.progress.in_flight = pool.in_flight;
        self.progress.queued = pool.queued;
        self.progress.busy_workers = pool.busy_workers;
    }

    fn emit(&mut self) {
        if let Some(sink) = &self.sink {
            self.progress.elapsed = self.started.elapsed();
            sink(&self.progress);
        }
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn sink_sees_every_update() {
        let seen: Arc<Mutex<Vec<ScanProgress>>> = Arc::default();
        let captured = Arc::clone(&seen);
        let sink: ProgressSink = Arc::new(move |p| captured.lock().unwrap().push(p.clone()));

        let mut t = Telemetry::new(Some(sink));
        let stats = PoolStats {
            in_flight: 3,
            busy_workers: 2,
            queued: 1,
        };
        t.file_done(10, 2, false, stats);
        t.walk_error();
        t.file_done(5, 0, true, PoolStats::default());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].in_flight, 3);
        assert_eq!(seen[0].queued, 1);
        let last = &seen[2];
        assert_eq!(last.files_scanned, 2);
        assert_eq!(last.bytes_read, 15);
        assert_eq!(last.detections, 2);
        assert_eq!(last.errors, 2);
        assert_eq!(last.busy_workers, 0);
    }

    #[test]
    fn progress_serializes_elapsed_as_millis() {
        let p = ScanProgress {
            elapsed: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["elapsed"], 1500);
        assert_eq!(json["filesScanned"], 0);
    }
}
