//! Directory traversal feeding the scan driver.
//!
//! The walk runs on its own thread and hands entries over a bounded channel,
//! so a slow consumer blocks the walker instead of letting entries pile up.

use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use walkdir::{DirEntry, WalkDir};

/// Entries buffered between the walker thread and the consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry {
    File { path: PathBuf, size: u64 },
    Error { path: PathBuf, message: String },
}

#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Any path component containing one of these substrings is pruned.
    pub excludes: Vec<String>,
    /// Maximum depth below each root; `None` is unbounded.
    pub max_depth: Option<usize>,
    pub channel_capacity: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            excludes: Vec::new(),
            max_depth: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// A running walk. Iterating yields entries until every root is exhausted.
/// Dropping it early stops the walker thread.
pub struct Walk {
    rx: Option<Receiver<WalkEntry>>,
    handle: Option<JoinHandle<()>>,
}

/// Start walking `roots` on a background thread.
pub fn walk(roots: Vec<PathBuf>, options: WalkOptions) -> io::Result<Walk> {
    let (tx, rx) = bounded(options.channel_capacity.max(1));
    let handle = thread::Builder::new()
        .name("npmioc-walker".into())
        .spawn(move || walk_roots(&roots, &options, &tx))?;
    Ok(Walk {
        rx: Some(rx),
        handle: Some(handle),
    })
}

impl Iterator for Walk {
    type Item = WalkEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for Walk {
    fn drop(&mut self) {
        // Disconnect first so a blocked walker sees a send error and exits.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn walk_roots(roots: &[PathBuf], options: &WalkOptions, tx: &Sender<WalkEntry>) {
    for root in roots {
        if !walk_root(root, options, tx) {
            tracing::debug!("walk consumer went away, stopping");
            return;
        }
    }
}

/// Walk one root. Returns false once the consumer has hung up.
fn walk_root(root: &Path, options: &WalkOptions, tx: &Sender<WalkEntry>) -> bool {
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .follow_root_links(false);
    if let Some(depth) = options.max_depth {
        walker = walker.max_depth(depth);
    }

    let iter = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e, &options.excludes));

    for item in iter {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                if tx
                    .send(WalkEntry::Error {
                        path,
                        message: e.to_string(),
                    })
                    .is_err()
                {
                    return false;
                }
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() || !file_type.is_file() {
            continue;
        }

        let message = match entry.metadata() {
            Ok(meta) => WalkEntry::File {
                path: entry.into_path(),
                size: meta.len(),
            },
            Err(e) => WalkEntry::Error {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            },
        };
        if tx.send(message).is_err() {
            return false;
        }
    }

    true
}

fn is_excluded(entry: &DirEntry, excludes: &[String]) -> bool {
    let name = entry.file_name().to_string_lossy();
    excludes
        .iter()
        .any(|ex| !ex.is_empty() && name.contains(ex.as_str()))
}
