//! Signature pack loading: `extends` resolution, compromised-package and
//! threat merging, and compilation into a [`CompiledProfile`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::manifest::{self, PackManifest, SignatureOverride};
use super::profile::Resolution;
use super::{union_into, CompiledProfile, Indicator, PackagePin, Severity, Signature, Threat};
use crate::engine::lockfile::LOCKFILE_NAMES;
use crate::error::{Result, ScanError};

/// Packs compiled into the binary, by file name.
const BUILTIN_FILES: &[(&str, &str)] = &[
    ("default.json", include_str!("../../profiles/default.json")),
    ("shai-hulud.json", include_str!("../../profiles/shai-hulud.json")),
    (
        "shai-hulud-packages.txt",
        include_str!("../../profiles/shai-hulud-packages.txt"),
    ),
    ("qix-2025.json", include_str!("../../profiles/qix-2025.json")),
    ("threats.json", include_str!("../../profiles/threats.json")),
];

/// Ids of the built-in packs.
pub const BUILTIN_PROFILES: &[&str] = &["default", "shai-hulud", "qix-2025"];

/// Where a manifest or side file lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Location {
    File(PathBuf),
    Builtin(&'static str),
}

impl Location {
    fn builtin(name: &str) -> Option<Self> {
        let name = name.trim_start_matches("./");
        BUILTIN_FILES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(n, _)| Self::Builtin(*n))
    }

    fn file(path: &Path) -> Result<Self> {
        match std::fs::canonicalize(path) {
            Ok(p) => Ok(Self::File(p)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ScanError::ManifestNotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a path reference relative to this location.
    fn join(&self, relative: &str) -> Result<Self> {
        match self {
            Self::File(path) => {
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                Self::file(&base.join(relative))
            }
            Self::Builtin(_) => Self::builtin(relative)
                .ok_or_else(|| ScanError::ManifestNotFound(PathBuf::from(relative))),
        }
    }

    fn stem(&self) -> String {
        let name = match self {
            Self::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Self::Builtin(name) => name.to_string(),
        };
        name.trim_end_matches(".json").to_string()
    }

    fn read(&self) -> Result<String> {
        match self {
            Self::File(path) => std::fs::read_to_string(path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ScanError::ManifestNotFound(path.clone())
                } else {
                    e.into()
                }
            }),
            Self::Builtin(name) => BUILTIN_FILES
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, content)| content.to_string())
                .ok_or_else(|| ScanError::ManifestNotFound(PathBuf::from(*name))),
        }
    }

    fn disk_path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path.as_path()),
            Self::Builtin(_) => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Builtin(name) => write!(f, "builtin:{name}"),
        }
    }
}

/// Parsed manifests keyed by location, for the lifetime of the loader.
#[derive(Default)]
struct ManifestCache {
    manifests: HashMap<Location, Arc<PackManifest>>,
}

impl ManifestCache {
    fn get_or_parse(&mut self, location: &Location) -> Result<Arc<PackManifest>> {
        if let Some(m) = self.manifests.get(location) {
            return Ok(Arc::clone(m));
        }
        let content = location.read()?;
        let manifest: PackManifest =
            serde_json::from_str(&content).map_err(|e| ScanError::ManifestParse {
                location: location.to_string(),
                message: e.to_string(),
            })?;
        let manifest = Arc::new(manifest);
        self.manifests.insert(location.clone(), Arc::clone(&manifest));
        Ok(manifest)
    }
}

/// Signatures, threats and sources collected while walking an extends chain.
#[derive(Default)]
struct Accumulator {
    profile_ids: Vec<String>,
    sources: Vec<String>,
    signatures: Vec<Signature>,
    threats: Vec<Threat>,
    threat_slots: HashMap<String, usize>,
    /// Compromised pins from every pack in the chain, in resolution order.
    pins: Vec<PackagePin>,
    pin_signature: SignatureOverride,
    loaded_files: Vec<PathBuf>,
}

impl Accumulator {
    fn add_threat(&mut self, threat: Threat) {
        match self.threat_slots.get(&threat.id) {
            Some(&slot) => self.threats[slot].merge(threat),
            None => {
                self.threat_slots
                    .insert(threat.id.clone(), self.threats.len());
                self.threats.push(threat);
            }
        }
    }

    fn add_loaded_file(&mut self, location: &Location) {
        if let Some(path) = location.disk_path() {
            if !self.loaded_files.iter().any(|p| p == path) {
                self.loaded_files.push(path.to_path_buf());
            }
        }
    }
}

/// Loads signature packs by id or path.
pub struct ProfileLoader {
    profile_dirs: Vec<PathBuf>,
    cache: ManifestCache,
}

impl ProfileLoader {
    pub fn new() -> Self {
        Self {
            profile_dirs: Vec::new(),
            cache: ManifestCache::default(),
        }
    }

    /// Additional directories searched for `<id>.json` before the built-ins.
    pub fn with_profile_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.profile_dirs.extend(dirs);
        self
    }

    /// Resolve and compile a profile id or manifest path.
    pub fn load(&mut self, reference: &str) -> Result<CompiledProfile> {
        let location = self.locate(reference, None)?;
        let mut acc = Accumulator::default();
        let mut stack: Vec<Location> = Vec::new();
        self.resolve(&location, &mut stack, &mut acc)?;

        let root = self.cache.get_or_parse(&location)?;
        let id = root.id.clone().unwrap_or_else(|| location.stem());

        if !acc.pins.is_empty() {
            let label = root.title.clone().unwrap_or_else(|| id.clone());
            let pins = std::mem::take(&mut acc.pins);
            let meta = std::mem::take(&mut acc.pin_signature);
            let signature =
                compromised_packages_signature(&id, &label, meta, pins, &location.to_string())?;
            tracing::debug!(
                signature = %signature.id,
                indicators = signature.indicators.len(),
                "synthesized compromised-packages signature"
            );
            acc.signatures.push(signature);
        }

        let signature_count = acc.signatures.len();
        let signatures = dedupe_keep_last(acc.signatures);

        tracing::info!(
            profile = %id,
            packs = acc.profile_ids.len(),
            signatures = signatures.len(),
            overridden = signature_count - signatures.len(),
            "signature profile resolved"
        );

        CompiledProfile::compile(Resolution {
            id,
            title: root.title.clone(),
            summary: root.summary.clone(),
            profile_ids: acc.profile_ids,
            sources: acc.sources,
            threats: acc.threats,
            signatures,
            loaded_files: acc.loaded_files,
        })
    }

    /// Ids and titles of the built-in packs.
    pub fn builtin_profiles(&mut self) -> Vec<(String, Option<String>)> {
        BUILTIN_PROFILES
            .iter()
            .map(|id| {
                let title = Location::builtin(&format!("{id}.json"))
                    .and_then(|loc| self.cache.get_or_parse(&loc).ok())
                    .and_then(|m| m.title.clone());
                (id.to_string(), title)
            })
            .collect()
    }

    fn locate(&self, reference: &str, referrer: Option<&Location>) -> Result<Location> {
        let reference = reference.trim();
        let looks_like_path =
            reference.ends_with(".json") || reference.contains('/') || reference.contains('\\');

        if looks_like_path {
            return match referrer {
                Some(from) => from.join(reference),
                None => Location::file(Path::new(reference)),
            };
        }

        for dir in &self.profile_dirs {
            let candidate = dir.join(format!("{reference}.json"));
            if candidate.is_file() {
                return Location::file(&candidate);
            }
        }

        if BUILTIN_PROFILES.contains(&reference) {
            if let Some(loc) = Location::builtin(&format!("{reference}.json")) {
                return Ok(loc);
            }
        }

        Err(ScanError::UnknownProfile {
            reference: reference.to_string(),
            referrer: referrer
                .map(|r| r.to_string())
                .unwrap_or_else(|| "command line".into()),
        })
    }

    fn resolve(
        &mut self,
        location: &Location,
        stack: &mut Vec<Location>,
        acc: &mut Accumulator,
    ) -> Result<()> {
        if let Some(pos) = stack.iter().position(|l| l == location) {
            let mut chain: Vec<String> = stack[pos..].iter().map(|l| l.to_string()).collect();
            chain.push(location.to_string());
            return Err(ScanError::CircularExtends { chain });
        }

        let manifest = self.cache.get_or_parse(location)?;
        acc.add_loaded_file(location);
        stack.push(location.clone());

        for parent in &manifest.extends {
            let parent_location = self.locate(parent, Some(location))?;
            self.resolve(&parent_location, stack, acc)?;
        }

        let id = manifest.id.clone().unwrap_or_else(|| location.stem());
        let where_ = location.to_string();
        tracing::debug!(profile = %id, location = %where_, "resolving signature pack");

        if !acc.profile_ids.contains(&id) {
            acc.profile_ids.push(id.clone());
        }
        union_into(&mut acc.sources, manifest.sources.clone());

        if let Some(file) = &manifest.threats_file {
            let threats_location = location.join(file)?;
            let threats =
                manifest::parse_threats(&threats_location.read()?, &threats_location.to_string())?;
            acc.add_loaded_file(&threats_location);
            for threat in threats {
                acc.add_threat(threat);
            }
        }
        for threat in manifest.threats.iter().cloned() {
            acc.add_threat(threat);
        }

        for raw in manifest.signatures.iter().cloned() {
            acc.signatures.push(raw.into_signature(&where_)?);
        }

        if let Some(file) = &manifest.compromised_packages_file {
            let list_location = location.join(file)?;
            acc.pins.extend(manifest::parse_package_list(
                &list_location.read()?,
                &list_location.to_string(),
            )?);
            acc.add_loaded_file(&list_location);
        }
        acc.pins
            .extend(manifest.compromised_packages.iter().flat_map(|e| e.pins()));
        if let Some(meta) = &manifest.compromised_packages_signature {
            acc.pin_signature.merge(meta.clone());
        }

        stack.pop();
        Ok(())
    }
}

impl Default for ProfileLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Lockfile globs attached to compromised-packages signatures by default.
pub fn default_lockfile_globs() -> Vec<String> {
    LOCKFILE_NAMES.iter().map(|n| format!("**/{n}")).collect()
}

/// The single compromised-packages signature of a resolved chain. Pins are
/// deduplicated by `name@version` across every pack.
fn compromised_packages_signature(
    pack_id: &str,
    label: &str,
    meta: SignatureOverride,
    pins: Vec<PackagePin>,
    location: &str,
) -> Result<Signature> {
    let severity = match meta.severity.as_deref() {
        None => Severity::Critical,
        Some(s) => Severity::from_str_lenient(s).ok_or_else(|| ScanError::ManifestParse {
            location: location.to_string(),
            message: format!("compromisedPackagesSignature: unknown severity '{s}'"),
        })?,
    };

    let globs = if meta.globs.is_empty() {
        default_lockfile_globs()
    } else {
        meta.globs
    };

    let mut indicators: Vec<Indicator> = globs
        .into_iter()
        .map(|pattern| Indicator::Glob { pattern })
        .collect();

    let mut seen: HashSet<String> = HashSet::new();
    for pin in pins {
        if seen.insert(pin.key()) {
            indicators.push(Indicator::Package {
                name: pin.name,
                version: pin.version,
            });
        }
    }

    Ok(Signature {
        id: meta
            .id
            .unwrap_or_else(|| format!("{pack_id}:compromised-packages")),
        title: meta
            .title
            .unwrap_or_else(|| format!("Compromised npm package ({label})")),
        severity,
        description: meta.description.unwrap_or_else(|| {
            format!("Dependency pinned to a package version published by the {label} compromise")
        }),
        indicators,
    })
}

/// Deduplicate by id, keeping the last definition at its own position.
fn dedupe_keep_last(signatures: Vec<Signature>) -> Vec<Signature> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept: Vec<Signature> = signatures
        .into_iter()
        .rev()
        .filter(|s| seen.insert(s.id.clone()))
        .collect();
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::IndicatorKind;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn load(path: &Path) -> Result<CompiledProfile> {
        ProfileLoader::new().load(path.to_str().unwrap())
    }

    #[test]
    fn child_overrides_parent_signature_by_id() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "base.json",
            r#"{"id": "base", "signatures": [
                {"id": "shared", "title": "Parent", "indicators": [{"type": "string", "value": "a"}]},
                {"id": "base-only", "indicators": [{"type": "string", "value": "b"}]}
            ]}"#,
        );
        let child = write(
            &dir,
            "child.json",
            r#"{"id": "child", "extends": ["./base.json"], "signatures": [
                {"id": "shared", "title": "Child", "indicators": [{"type": "string", "value": "c"}]}
            ]}"#,
        );

        let profile = load(&child).unwrap();
        let shared: Vec<_> = profile
            .signatures()
            .iter()
            .filter(|s| s.id == "shared")
            .collect();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].title, "Child");
        assert_eq!(shared[0].literals, vec!["c"]);
        assert!(profile.signature("base-only").is_some());
        assert_eq!(profile.profile_ids, vec!["base", "child"]);
    }

    #[test]
    fn mutual_extends_is_circular() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.json", r#"{"id": "a", "extends": ["b.json"]}"#);
        write(&dir, "b.json", r#"{"id": "b", "extends": ["a.json"]}"#);

        match load(&a) {
            Err(ScanError::CircularExtends { chain }) => assert_eq!(chain.len(), 3),
            other => panic!("expected circular extends, got {other:?}"),
        }
    }

    #[test]
    fn self_extends_is_circular() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.json", r#"{"extends": ["a.json"]}"#);
        assert!(matches!(load(&a), Err(ScanError::CircularExtends { .. })));
    }

    #[test]
    fn diamond_extends_is_not_a_cycle() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "root.json",
            r#"{"id": "root", "signatures": [{"id": "r", "indicators": [{"type": "string", "value": "r"}]}]}"#,
        );
        write(&dir, "left.json", r#"{"id": "left", "extends": ["root.json"]}"#);
        write(&dir, "right.json", r#"{"id": "right", "extends": ["root.json"]}"#);
        let top = write(
            &dir,
            "top.json",
            r#"{"id": "top", "extends": ["left.json", "right.json"]}"#,
        );

        let profile = load(&top).unwrap();
        assert_eq!(profile.signatures().len(), 1);
        assert_eq!(profile.profile_ids, vec!["root", "left", "right", "top"]);
    }

    #[test]
    fn missing_manifest_and_unknown_id() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(load(&missing), Err(ScanError::ManifestNotFound(_))));

        let bad_ref = write(&dir, "bad.json", r#"{"extends": ["no-such-profile"]}"#);
        assert!(matches!(
            load(&bad_ref),
            Err(ScanError::UnknownProfile { .. })
        ));
        assert!(matches!(
            ProfileLoader::new().load("no-such-profile"),
            Err(ScanError::UnknownProfile { .. })
        ));
    }

    #[test]
    fn malformed_manifest_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "broken.json", "{ not json");
        assert!(matches!(load(&path), Err(ScanError::ManifestParse { .. })));
    }

    #[test]
    fn compromised_packages_signature_is_synthesized() {
        let dir = TempDir::new().unwrap();
        write(&dir, "list.txt", "left-pad@1.3.37\nleft-pad@1.3.37\n");
        let path = write(
            &dir,
            "pack.json",
            r#"{"id": "campaign", "compromisedPackagesFile": "list.txt",
                "compromisedPackages": [{"name": "debug", "versions": ["4.4.2", "4.4.2 "]}]}"#,
        );

        let profile = load(&path).unwrap();
        let sig = profile.signature("campaign:compromised-packages").unwrap();
        assert_eq!(sig.severity, Severity::Critical);
        assert_eq!(sig.packages.len(), 2);
        assert_eq!(sig.globs.len(), LOCKFILE_NAMES.len());
        assert!(sig.matching_glob("/app/package-lock.json").is_some());
        assert_eq!(profile.loaded_files().len(), 2);
    }

    #[test]
    fn compromised_packages_signature_metadata_override() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "pack.json",
            r#"{"id": "campaign",
                "compromisedPackagesSignature": {"id": "bad-pins", "severity": "high", "globs": ["**/yarn.lock"]},
                "compromisedPackages": [{"name": "debug", "version": "4.4.2"}]}"#,
        );
        let profile = load(&path).unwrap();
        let sig = profile.signature("bad-pins").unwrap();
        assert_eq!(sig.severity, Severity::High);
        assert_eq!(sig.globs.len(), 1);
    }

    #[test]
    fn compromised_packages_merge_into_one_signature_across_chain() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "base.json",
            r#"{"id": "base",
                "compromisedPackagesSignature": {"title": "Base pins", "severity": "high"},
                "compromisedPackages": [
                    {"name": "left-pad", "version": "1.3.37"},
                    {"name": "debug", "version": "4.4.2"}
                ]}"#,
        );
        let child = write(
            &dir,
            "child.json",
            r#"{"id": "child", "extends": ["base.json"],
                "compromisedPackagesSignature": {"title": "Child pins"},
                "compromisedPackages": [
                    {"name": "left-pad", "version": "1.3.37"},
                    {"name": "chalk", "version": "5.6.1"}
                ]}"#,
        );

        let profile = load(&child).unwrap();
        let ids: Vec<&str> = profile
            .signatures()
            .iter()
            .filter(|s| !s.packages.is_empty())
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ids, vec!["child:compromised-packages"]);

        let sig = profile.signature("child:compromised-packages").unwrap();
        let mut keys: Vec<String> = sig.packages.iter().map(|p| p.key()).collect();
        keys.sort();
        assert_eq!(keys, vec!["chalk@5.6.1", "debug@4.4.2", "left-pad@1.3.37"]);
        assert_eq!(sig.title, "Child pins");
        assert_eq!(sig.severity, Severity::High);
        assert_eq!(profile.package_index().lookup("left-pad", "1.3.37").len(), 1);
    }

    #[test]
    fn builtin_default_has_one_compromised_packages_signature() {
        let profile = ProfileLoader::new().load("default").unwrap();
        let pinned: Vec<&str> = profile
            .signatures()
            .iter()
            .filter(|s| !s.packages.is_empty())
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(pinned, vec!["default:compromised-packages"]);

        let sig = profile.signature("default:compromised-packages").unwrap();
        assert_eq!(sig.threat_ids, vec!["shai-hulud", "qix-2025"]);
        assert!(!profile.package_index().lookup("debug", "4.4.2").is_empty());
    }

    #[test]
    fn threats_merge_across_chain() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "threats.json",
            r#"[{"id": "worm", "title": "Old", "tags": ["npm"], "signatures": ["s1"]}]"#,
        );
        write(
            &dir,
            "base.json",
            r#"{"id": "base", "threatsFile": "threats.json", "sources": ["https://a"],
                "signatures": [{"id": "s1", "indicators": [{"type": "string", "value": "x"}]}]}"#,
        );
        let child = write(
            &dir,
            "child.json",
            r#"{"id": "child", "extends": ["base"], "sources": ["https://a", "https://b"],
                "threats": [{"id": "worm", "title": "New", "tags": ["worm"], "signatures": ["s2"]}],
                "signatures": [{"id": "s2", "indicators": [{"type": "string", "value": "y"}]}]}"#,
        );

        let profile = ProfileLoader::new()
            .with_profile_dirs([dir.path().to_path_buf()])
            .load(child.to_str().unwrap())
            .unwrap();

        assert_eq!(profile.threats.len(), 1);
        let worm = &profile.threats[0];
        assert_eq!(worm.title.as_deref(), Some("New"));
        assert_eq!(worm.tags, vec!["npm", "worm"]);
        assert_eq!(worm.signatures, vec!["s1", "s2"]);
        assert_eq!(profile.sources, vec!["https://a", "https://b"]);
        assert_eq!(profile.signature("s1").unwrap().threat_ids, vec!["worm"]);
    }

    #[test]
    fn builtin_profiles_load() {
        let mut loader = ProfileLoader::new();
        let profile = loader.load("default").unwrap();
        assert!(profile.profile_ids.contains(&"shai-hulud".to_string()));
        assert!(profile.profile_ids.contains(&"qix-2025".to_string()));
        assert!(profile.has_package_indicators());
        assert!(profile.loaded_files().is_empty());
        assert!(profile
            .declared_signatures()
            .iter()
            .flat_map(|s| &s.indicators)
            .any(|i| i.kind() == IndicatorKind::Sha256));
        assert_eq!(loader.builtin_profiles().len(), BUILTIN_PROFILES.len());
    }

    #[test]
    fn invalid_regex_fails_load() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "pack.json",
            r#"{"signatures": [{"id": "s", "indicators": [{"type": "regex", "pattern": "(oops"}]}]}"#,
        );
        assert!(matches!(load(&path), Err(ScanError::InvalidPattern { .. })));
    }
}
