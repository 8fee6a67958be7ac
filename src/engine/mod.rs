//! Per-file matching engine.
//!
//! Given one file and the compiled profile, decides which signatures apply,
//! reads as little of the file as the eligible signatures need, and records
//! the first matching indicator of each signature.
//!
//! Indicator priority within a signature is fixed: glob, string, regex,
//! sha256, package. Changing it changes which indicator a detection reports.

pub mod hash;
pub mod lockfile;

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::signature::{CompiledProfile, CompiledSignature, IndicatorKind, Severity};

/// Files above this size are only read up to the limit, unless they are lockfiles.
pub const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// One match of a signature against a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub path: PathBuf,
    pub signature_id: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub indicator_type: IndicatorKind,
    pub indicator_value: String,
    /// Threats annotating the signature.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threats: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileErrorKind {
    /// The file vanished between enumeration and read.
    Missing,
    /// Permission denied or another I/O fault.
    Read,
    /// The worker evaluating the file failed.
    WorkerFault,
}

/// A recoverable per-file failure. Never aborts a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub kind: FileErrorKind,
    pub message: String,
}

impl FileError {
    fn from_io(e: &io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            Self {
                kind: FileErrorKind::Missing,
                message: "file disappeared before it could be read".into(),
            }
        } else {
            Self {
                kind: FileErrorKind::Read,
                message: e.to_string(),
            }
        }
    }

    pub fn worker_fault(message: impl Into<String>) -> Self {
        Self {
            kind: FileErrorKind::WorkerFault,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Outcome of scanning one file.
#[derive(Debug, Clone, Default)]
pub struct FileScan {
    /// Content bytes read for string, regex and package matching.
    pub bytes_read: u64,
    pub detections: Vec<Detection>,
    pub error: Option<FileError>,
}

/// Scan a single file against the profile. Read-only and deterministic.
pub fn scan_file(path: &Path, size: u64, profile: &CompiledProfile, max_bytes: u64) -> FileScan {
    let path_str = path.to_string_lossy();
    let signatures = profile.signatures();
    let mut recorder = Recorder::new(path);

    // Glob filter and glob-only short-circuit.
    let mut eligible: Vec<usize> = Vec::new();
    for (idx, sig) in signatures.iter().enumerate() {
        if !sig.globs.is_empty() {
            let Some(glob) = sig.matching_glob(&path_str) else {
                continue;
            };
            if sig.is_glob_only() {
                recorder.record(sig, IndicatorKind::Glob, glob.as_str());
                continue;
            }
        }
        eligible.push(idx);
    }

    let needs_text = eligible.iter().any(|&i| signatures[i].needs_text());
    let needs_digest = eligible.iter().any(|&i| signatures[i].needs_digest());

    let mut scan = FileScan::default();

    if needs_text {
        let content = match read_content(path, size, max_bytes) {
            Ok(content) => content,
            Err(e) => {
                scan.error = Some(FileError::from_io(&e));
                scan.detections = recorder.finish();
                return scan;
            }
        };
        scan.bytes_read = content.bytes.len() as u64;

        let text = String::from_utf8_lossy(&content.bytes);
        let lowered = text.to_lowercase();
        let mut digest = DigestCache::new(path, content.complete.then_some(&content.bytes[..]));
        let mut matched: HashSet<usize> = HashSet::new();

        for &idx in &eligible {
            let sig = &signatures[idx];
            if let Some(literal) = sig.literals.iter().find(|l| lowered.contains(l.as_str())) {
                recorder.record(sig, IndicatorKind::String, literal);
            } else if let Some(re) = sig.patterns.iter().find(|re| re.is_match(&text)) {
                recorder.record(sig, IndicatorKind::Regex, re.as_str());
            } else if let Some(hash) = digest.matching(&sig.digests) {
                recorder.record(sig, IndicatorKind::Sha256, &hash);
            } else {
                continue;
            }
            matched.insert(idx);
        }

        if profile.has_package_indicators()
            && eligible.iter().any(|&i| !signatures[i].packages.is_empty())
        {
            let hits = lockfile::find_compromised_packages(path, &text, profile.package_index());
            for hit in hits {
                if matched.contains(&hit.signature) || !eligible.contains(&hit.signature) {
                    continue;
                }
                recorder.record(&signatures[hit.signature], IndicatorKind::Package, &hit.pin.key());
            }
        }

        scan.error = digest.error;
    } else if needs_digest {
        let mut digest = DigestCache::new(path, None);
        for &idx in &eligible {
            let sig = &signatures[idx];
            if let Some(hash) = digest.matching(&sig.digests) {
                recorder.record(sig, IndicatorKind::Sha256, &hash);
            }
        }
        scan.error = digest.error;
    }

    scan.detections = recorder.finish();
    scan
}

struct Content {
    bytes: Vec<u8>,
    /// Whether `bytes` holds the whole file.
    complete: bool,
}

/// Lockfiles and files within `max_bytes` are read whole; anything larger is
/// streamed up to `max_bytes`.
fn read_content(path: &Path, size: u64, max_bytes: u64) -> io::Result<Content> {
    let mut file = File::open(path)?;
    if size > max_bytes && !lockfile::is_lockfile_name(path) {
        let mut bytes = Vec::with_capacity(max_bytes as usize);
        file.by_ref().take(max_bytes).read_to_end(&mut bytes)?;
        return Ok(Content {
            bytes,
            complete: false,
        });
    }

    let mut bytes = Vec::with_capacity(size as usize);
    file.read_to_end(&mut bytes)?;
    Ok(Content {
        bytes,
        complete: true,
    })
}

/// Lazily computed digest, shared by every signature evaluated for one file.
struct DigestCache<'a> {
    path: &'a Path,
    in_memory: Option<&'a [u8]>,
    value: Option<Option<String>>,
    error: Option<FileError>,
}

impl<'a> DigestCache<'a> {
    fn new(path: &'a Path, in_memory: Option<&'a [u8]>) -> Self {
        Self {
            path,
            in_memory,
            value: None,
            error: None,
        }
    }

    /// The file digest if it equals one of `candidates`.
    fn matching(&mut self, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let digest = self.get()?;
        candidates.iter().find(|c| **c == digest).cloned()
    }

    fn get(&mut self) -> Option<String> {
        if self.value.is_none() {
            let computed = match self.in_memory {
                Some(bytes) => Some(hash::sha256_bytes(bytes)),
                None => match hash::sha256_file(self.path) {
                    Ok(digest) => Some(digest),
                    Err(e) => {
                        self.error = Some(FileError::from_io(&e));
                        None
                    }
                },
            };
            self.value = Some(computed);
        }
        self.value.clone().flatten()
    }
}

/// Collects detections for one file, dropping duplicates.
struct Recorder<'a> {
    path: &'a Path,
    seen: HashSet<(String, IndicatorKind, String)>,
    detections: Vec<Detection>,
}

impl<'a> Recorder<'a> {
    fn new(path: &'a Path) -> Self {
        Self {
            path,
            seen: HashSet::new(),
            detections: Vec::new(),
        }
    }

    fn record(&mut self, sig: &CompiledSignature, kind: IndicatorKind, value: &str) {
        if !self
            .seen
            .insert((sig.id.clone(), kind, value.to_string()))
        {
            return;
        }
        self.detections.push(Detection {
            path: self.path.to_path_buf(),
            signature_id: sig.id.clone(),
            severity: sig.severity,
            title: sig.title.clone(),
            description: sig.description.clone(),
            indicator_type: kind,
            indicator_value: value.to_string(),
            threats: sig.threat_ids.clone(),
        });
    }

    fn finish(self) -> Vec<Detection> {
        self.detections
    }
}
