//! Fixed-size worker pool for file matching.
//!
//! Each worker owns a handle to the shared, immutable handler and pulls jobs
//! from one FIFO queue. Completions come back on a single channel and are
//! only ever consumed by the coordinating thread, which keeps every counter
//! single-writer. A panic inside a handler is caught at the worker boundary
//! and reported as a per-job error; the worker keeps serving jobs.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::engine::{self, FileError, FileScan};
use crate::error::{Result, ScanError};
use crate::signature::CompiledProfile;

/// Jobs admitted per worker before `submit` waits for completions.
pub const ADMISSION_FACTOR: usize = 4;

/// `clamp(cores - 1, 2, 32)`.
pub fn default_threads() -> usize {
    let cores = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cores.saturating_sub(1).clamp(2, 32)
}

/// Work performed for each submitted file.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, path: &Path, size: u64) -> FileScan;
}

/// Runs the matching engine against a compiled profile.
pub struct ProfileMatcher {
    profile: Arc<CompiledProfile>,
    max_bytes: u64,
}

impl ProfileMatcher {
    pub fn new(profile: Arc<CompiledProfile>, max_bytes: u64) -> Self {
        Self { profile, max_bytes }
    }
}

impl JobHandler for ProfileMatcher {
    fn handle(&self, path: &Path, size: u64) -> FileScan {
        engine::scan_file(path, size, &self.profile, self.max_bytes)
    }
}

struct Job {
    id: u64,
    path: PathBuf,
    size: u64,
}

/// A finished job.
#[derive(Debug)]
pub struct JobResult {
    pub id: u64,
    pub path: PathBuf,
    pub size: u64,
    pub scan: FileScan,
}

/// Pool occupancy as seen by the coordinator after a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub in_flight: usize,
    pub busy_workers: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Busy,
    Terminated,
}

pub struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    result_rx: Receiver<JobResult>,
    workers: Vec<JoinHandle<()>>,
    threads: usize,
    next_id: u64,
    in_flight: usize,
}

impl WorkerPool {
    pub fn new<H: JobHandler>(handler: Arc<H>, threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let (job_tx, job_rx) = unbounded::<Job>();
        let (result_tx, result_rx) = unbounded::<JobResult>();

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let handler = Arc::clone(&handler);
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("npmioc-worker-{id}"))
                .spawn(move || run_worker(id, handler.as_ref(), jobs, results))
                .map_err(|e| ScanError::Pool(format!("failed to spawn worker {id}: {e}")))?;
            workers.push(handle);
        }

        tracing::debug!(threads, "worker pool started");

        Ok(Self {
            job_tx: Some(job_tx),
            result_rx,
            workers,
            threads,
            next_id: 0,
            in_flight: 0,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Maximum number of jobs awaiting completion at once.
    pub fn admission_limit(&self) -> usize {
        self.threads * ADMISSION_FACTOR
    }

    pub fn stats(&self) -> PoolStats {
        let busy = self.in_flight.min(self.threads);
        PoolStats {
            in_flight: self.in_flight,
            busy_workers: busy,
            queued: self.in_flight - busy,
        }
    }

    /// Queue a file. While the admission limit is reached, blocks on the
    /// oldest outstanding work and hands each completion to `on_complete`.
    pub fn submit<F>(&mut self, path: PathBuf, size: u64, mut on_complete: F) -> Result<u64>
    where
        F: FnMut(JobResult, PoolStats),
    {
        while self.in_flight >= self.admission_limit() {
            match self.recv() {
                Some(result) => on_complete(result, self.stats()),
                None => break,
            }
        }

        let tx = self
            .job_tx
            .as_ref()
            .ok_or_else(|| ScanError::Pool("pool is terminated".into()))?;
        let id = self.next_id;
        tx.send(Job { id, path, size })
            .map_err(|_| ScanError::Pool("all workers have exited".into()))?;
        self.next_id += 1;
        self.in_flight += 1;
        Ok(id)
    }

    /// Block for the next completion. `None` when nothing is outstanding.
    pub fn recv(&mut self) -> Option<JobResult> {
        if self.in_flight == 0 {
            return None;
        }
        match self.result_rx.recv() {
            Ok(result) => {
                self.in_flight -= 1;
                Some(result)
            }
            Err(_) => {
                tracing::error!(lost = self.in_flight, "workers exited with jobs outstanding");
                self.in_flight = 0;
                None
            }
        }
    }

    /// Wait until the queue is empty and no worker is busy.
    pub fn drain<F>(&mut self, mut on_complete: F)
    where
        F: FnMut(JobResult, PoolStats),
    {
        while let Some(result) = self.recv() {
            on_complete(result, self.stats());
        }
    }

    /// Stop accepting work and join every worker. Jobs already queued are
    /// still processed; their results are discarded unless drained first.
    pub fn terminate(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<H: JobHandler + ?Sized>(
    id: usize,
    handler: &H,
    jobs: Receiver<Job>,
    results: Sender<JobResult>,
) {
    let mut state = WorkerState::Idle;
    while let Ok(job) = jobs.recv() {
        state = WorkerState::Busy;
        tracing::trace!(worker = id, job = job.id, ?state, path = %job.path.display());

        let scan = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&job.path, job.size)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::warn!(
                    worker = id,
                    path = %job.path.display(),
                    error = %message,
                    "worker fault"
                );
                FileScan {
                    error: Some(FileError::worker_fault(format!("worker fault: {message}"))),
                    ..Default::default()
                }
            });

        let result = JobResult {
            id: job.id,
            path: job.path,
            size: job.size,
            scan,
        };
        if results.send(result).is_err() {
            break;
        }
        state = WorkerState::Idle;
    }
    tracing::trace!(worker = id, previous = ?state, state = ?WorkerState::Terminated);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".into()
    }
}
