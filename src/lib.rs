//! npmioc: scanner for npm supply-chain malware indicators.
//!
//! Walks one or more directory trees and matches every file against a
//! compiled signature pack: path globs, literal strings, regexes, SHA-256
//! digests and compromised `name@version` lockfile pins. Matching runs on a
//! fixed worker pool; the coordinating thread owns every counter.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::PathBuf;
//! use npmioc::{scan, ScanOptions};
//!
//! let options = ScanOptions {
//!     roots: vec![PathBuf::from("./my-app")],
//!     ..Default::default()
//! };
//! let report = scan(&options).unwrap();
//! println!("Detections: {}", report.summary.detections.len());
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod output;
pub mod pool;
pub mod signature;
pub mod telemetry;
pub mod walker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use config::{Config, ScanConfig, CONFIG_FILE_NAME};
use engine::{Detection, DEFAULT_MAX_BYTES};
use error::Result;
use output::OutputFormat;
use pool::{JobResult, PoolStats, ProfileMatcher, WorkerPool};
use signature::{CompiledProfile, ProfileLoader, ProfileSummary};
use telemetry::{ProgressSink, Telemetry};
use walker::{WalkEntry, WalkOptions};

/// Options for a scan invocation. `None` fields fall back to the config file.
#[derive(Clone, Default)]
pub struct ScanOptions {
    /// Directories or files to scan (defaults to the working directory).
    pub roots: Vec<PathBuf>,
    /// Path to config file (defaults to `.npmioc.toml` in the working directory).
    pub config_path: Option<PathBuf>,
    /// Profile id or manifest path.
    pub profile: Option<String>,
    /// Exclusion substrings, added to those from the config file.
    pub excludes: Vec<String>,
    pub threads: Option<usize>,
    pub max_depth: Option<usize>,
    pub max_bytes: Option<u64>,
    pub progress: Option<ProgressSink>,
}

impl std::fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOptions")
            .field("roots", &self.roots)
            .field("config_path", &self.config_path)
            .field("profile", &self.profile)
            .field("excludes", &self.excludes)
            .field("threads", &self.threads)
            .field("max_depth", &self.max_depth)
            .field("max_bytes", &self.max_bytes)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Fully resolved traversal and matching parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub excludes: Vec<String>,
    pub threads: usize,
    pub max_depth: Option<usize>,
    pub max_bytes: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            excludes: Vec::new(),
            threads: pool::default_threads(),
            max_depth: None,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl ScanSettings {
    /// Config values, overridden by whatever the caller set explicitly.
    pub fn resolve(config: &ScanConfig, options: &ScanOptions) -> Self {
        let mut excludes = config.exclude.clone();
        for ex in &options.excludes {
            if !excludes.contains(ex) {
                excludes.push(ex.clone());
            }
        }
        Self {
            excludes,
            threads: options
                .threads
                .or(config.threads)
                .unwrap_or_else(pool::default_threads)
                .max(1),
            max_depth: options.max_depth.or(config.max_depth),
            max_bytes: options.max_bytes.unwrap_or(config.max_bytes).max(1),
        }
    }
}

/// A path that could not be enumerated or matched.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ScanErrorRecord {
    pub path: PathBuf,
    pub message: String,
}

/// How a finished scan should be reported to automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanOutcome {
    Clean,
    Detections,
    Errors,
}

impl ScanOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::Detections => 1,
            Self::Errors => 2,
        }
    }
}

/// Aggregate results, frozen when the pool has drained.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub files_scanned: u64,
    pub bytes_read: u64,
    #[serde(rename = "durationMs", with = "telemetry::millis")]
    pub duration: Duration,
    pub detections: Vec<Detection>,
    pub errors: Vec<ScanErrorRecord>,
}

impl ScanSummary {
    /// Detections take precedence over errors.
    pub fn outcome(&self) -> ScanOutcome {
        if !self.detections.is_empty() {
            ScanOutcome::Detections
        } else if !self.errors.is_empty() {
            ScanOutcome::Errors
        } else {
            ScanOutcome::Clean
        }
    }
}

/// Complete scan report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub roots: Vec<PathBuf>,
    pub profile: ProfileSummary,
    pub summary: ScanSummary,
}

impl ScanReport {
    pub fn outcome(&self) -> ScanOutcome {
        self.summary.outcome()
    }
}

/// Run a complete scan: load config, resolve the profile, walk and match.
pub fn scan(options: &ScanOptions) -> Result<ScanReport> {
    let config_path = options
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let config = Config::load(&config_path)?;
    scan_with_config(&config, options)
}

/// Like [`scan`], with an already loaded config.
pub fn scan_with_config(config: &Config, options: &ScanOptions) -> Result<ScanReport> {
    let reference = options
        .profile
        .clone()
        .unwrap_or_else(|| config.scan.profile.clone());
    let mut loader =
        ProfileLoader::new().with_profile_dirs(config.scan.profile_dirs.iter().cloned());
    let profile = Arc::new(loader.load(&reference)?);

    let settings = ScanSettings::resolve(&config.scan, options);
    let roots = if options.roots.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        options.roots.clone()
    };

    let started_at = Utc::now();
    let summary = scan_with_profile(
        &roots,
        Arc::clone(&profile),
        &settings,
        options.progress.clone(),
    )?;

    Ok(ScanReport {
        run_id: Uuid::new_v4(),
        started_at,
        roots,
        profile: profile.summary(),
        summary,
    })
}

/// Walk `roots` and match every file against `profile` on a worker pool.
///
/// Only fatal setup failures (spawning threads) are returned as errors.
/// Everything that goes wrong with an individual path lands in
/// [`ScanSummary::errors`].
pub fn scan_with_profile(
    roots: &[PathBuf],
    profile: Arc<CompiledProfile>,
    settings: &ScanSettings,
    progress: Option<ProgressSink>,
) -> Result<ScanSummary> {
    let mut telemetry = Telemetry::new(progress);
    let mut acc = SummaryBuilder::default();

    let matcher = Arc::new(ProfileMatcher::new(Arc::clone(&profile), settings.max_bytes));
    let mut pool = WorkerPool::new(matcher, settings.threads)?;
    let walk = walker::walk(
        roots.to_vec(),
        WalkOptions {
            excludes: settings.excludes.clone(),
            max_depth: settings.max_depth,
            ..Default::default()
        },
    )?;

    tracing::info!(
        profile = %profile.id,
        signatures = profile.signatures().len(),
        threads = pool.threads(),
        roots = roots.len(),
        "scan started"
    );

    for entry in walk {
        match entry {
            WalkEntry::File { path, size } => {
                if profile.is_profile_file(&path) {
                    tracing::debug!(path = %path.display(), "skipping signature pack file");
                    continue;
                }
                pool.submit(path, size, |result, stats| {
                    acc.record(result, stats, &mut telemetry)
                })?;
            }
            WalkEntry::Error { path, message } => {
                tracing::warn!(path = %path.display(), error = %message, "walk error");
                acc.errors.push(ScanErrorRecord { path, message });
                telemetry.walk_error();
            }
        }
    }

    pool.drain(|result, stats| acc.record(result, stats, &mut telemetry));
    pool.terminate();

    let summary = acc.finish(telemetry.elapsed());
    tracing::info!(
        files = summary.files_scanned,
        bytes = summary.bytes_read,
        detections = summary.detections.len(),
        errors = summary.errors.len(),
        duration_ms = summary.duration.as_millis() as u64,
        "scan complete"
    );
    Ok(summary)
}

/// Render a scan report in the specified format.
pub fn render_report(report: &ScanReport, format: OutputFormat) -> Result<String> {
    output::render(report, format)
}

#[derive(Default)]
struct SummaryBuilder {
    files_scanned: u64,
    bytes_read: u64,
    detections: Vec<Detection>,
    errors: Vec<ScanErrorRecord>,
}

impl SummaryBuilder {
    fn record(&mut self, result: JobResult, stats: PoolStats, telemetry: &mut Telemetry) {
        let JobResult { path, scan, .. } = result;

        self.files_scanned += 1;
        self.bytes_read += scan.bytes_read;
        telemetry.file_done(scan.bytes_read, scan.detections.len(), scan.error.is_some(), stats);

        for d in &scan.detections {
            tracing::debug!(
                path = %d.path.display(),
                signature = %d.signature_id,
                indicator = %d.indicator_type,
                "detection"
            );
        }
        self.detections.extend(scan.detections);

        if let Some(err) = scan.error {
            tracing::warn!(path = %path.display(), error = %err, "file not scanned");
            self.errors.push(ScanErrorRecord {
                path,
                message: err.message,
            });
        }
    }

    fn finish(mut self, duration: Duration) -> ScanSummary {
        self.detections.sort_by(|a, b| {
            a.path
                .cmp(&b.path)
                .then_with(|| a.signature_id.cmp(&b.signature_id))
                .then_with(|| a.indicator_type.cmp(&b.indicator_type))
                .then_with(|| a.indicator_value.cmp(&b.indicator_value))
        });
        self.errors.sort();
        ScanSummary {
            files_scanned: self.files_scanned,
            bytes_read: self.bytes_read,
            duration,
            detections: self.detections,
            errors: self.errors,
        }
    }
}
