//! Detection of pinned compromised dependencies in lockfiles.
//!
//! JSON lockfiles (`package-lock.json`, `npm-shrinkwrap.json`, or any other
//! `.json` file routed here by a signature glob) are walked structurally. Every
//! other format is searched for literal `name@version` tokens, which is
//! deliberately permissive.

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;

use crate::signature::{PackageIndex, PackagePin};

/// Dependency lockfile basenames. These are always read in full.
pub const LOCKFILE_NAMES: &[&str] = &[
    "package-lock.json",
    "npm-shrinkwrap.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "pnpm-lock.yml",
    "bun.lock",
    "bun.lockb",
];

/// True if the file name is a known lockfile (case-insensitive).
pub fn is_lockfile_name(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .is_some_and(|n| LOCKFILE_NAMES.contains(&n.as_str()))
}

/// A compromised pin found in a lockfile, with the owning signature's index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageHit {
    pub signature: usize,
    pub pin: PackagePin,
}

/// Find every `(signature, pin)` pair of `index` present in `content`.
/// Malformed JSON yields no hits.
pub fn find_compromised_packages(
    path: &Path,
    content: &str,
    index: &PackageIndex,
) -> Vec<PackageHit> {
    if index.is_empty() {
        return Vec::new();
    }

    let mut hits = HitSet::default();

    if is_json(path) {
        let Ok(doc) = serde_json::from_str::<Value>(content) else {
            tracing::debug!(path = %path.display(), "not a parseable JSON lockfile");
            return Vec::new();
        };
        if let Some(packages) = doc.get("packages").and_then(Value::as_object) {
            for (install_path, entry) in packages {
                let Some(name) = package_name(install_path, entry) else {
                    continue;
                };
                if let Some(version) = entry.get("version").and_then(Value::as_str) {
                    hits.check(index, name, version);
                }
            }
        }
        if let Some(deps) = doc.get("dependencies") {
            walk_dependencies(deps, index, &mut hits);
        }
    } else {
        for (token, pin) in index.tokens() {
            if content.contains(token) {
                hits.check(index, &pin.name, &pin.version);
            }
        }
    }

    hits.hits
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Name of a `packages` entry: the segment after the last `node_modules/`.
/// Entries without one (workspace links) fall back to their `name` field.
fn package_name<'a>(install_path: &'a str, entry: &'a Value) -> Option<&'a str> {
    let from_path = install_path
        .rfind("node_modules/")
        .map(|i| &install_path[i + "node_modules/".len()..])
        .filter(|n| !n.is_empty());
    from_path.or_else(|| {
        if install_path.is_empty() {
            None
        } else {
            entry.get("name").and_then(Value::as_str)
        }
    })
}

/// Lockfile v1 `dependencies` tree: `{ name: { version, dependencies? } }`.
fn walk_dependencies(deps: &Value, index: &PackageIndex, hits: &mut HitSet) {
    let Some(deps) = deps.as_object() else {
        return;
    };
    for (name, entry) in deps {
        // package.json style `"name": "^1.0.0"` ranges are not pins.
        if !entry.is_object() {
            continue;
        }
        if let Some(version) = entry.get("version").and_then(Value::as_str) {
            hits.check(index, name, version);
        }
        if let Some(nested) = entry.get("dependencies") {
            walk_dependencies(nested, index, hits);
        }
    }
}

#[derive(Default)]
struct HitSet {
    seen: HashSet<(usize, String, String)>,
    hits: Vec<PackageHit>,
}

impl HitSet {
    fn check(&mut self, index: &PackageIndex, name: &str, version: &str) {
        if !index.contains_name(name) {
            return;
        }
        let version = version.trim();
        for &signature in index.lookup(name, version) {
            if self
                .seen
                .insert((signature, name.to_string(), version.to_string()))
            {
                self.hits.push(PackageHit {
                    signature,
                    pin: PackagePin {
                        name: name.to_string(),
                        version: version.to_string(),
                    },
                });
            }
        }
    }
}
