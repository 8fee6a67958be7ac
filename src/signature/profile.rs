//! The resolved, compiled signature set and its package pin index.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{CompiledSignature, PackagePin, Signature, Threat};
use crate::error::Result;

/// `name -> version -> [signature index]`, plus the `name@version` tokens used
/// for unstructured lockfile search.
#[derive(Debug, Clone, Default)]
pub struct PackageIndex {
    by_name: HashMap<String, HashMap<String, Vec<usize>>>,
    tokens: Vec<(String, PackagePin)>,
}

impl PackageIndex {
    pub fn build(signatures: &[CompiledSignature]) -> Self {
        let mut index = Self::default();
        let mut seen: HashSet<PackagePin> = HashSet::new();

        for (idx, sig) in signatures.iter().enumerate() {
            for pin in &sig.packages {
                let owners = index
                    .by_name
                    .entry(pin.name.clone())
                    .or_default()
                    .entry(pin.version.clone())
                    .or_default();
                if !owners.contains(&idx) {
                    owners.push(idx);
                }
                if seen.insert(pin.clone()) {
                    index.tokens.push((pin.key(), pin.clone()));
                }
            }
        }

        index
    }

    /// Indexes of the signatures pinning `name@version`.
    pub fn lookup(&self, name: &str, version: &str) -> &[usize] {
        self.by_name
            .get(name)
            .and_then(|versions| versions.get(version.trim()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Every distinct pin with its `name@version` token.
    pub fn tokens(&self) -> impl Iterator<Item = (&str, &PackagePin)> {
        self.tokens.iter().map(|(t, p)| (t.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Result of resolving a pack and its full `extends` chain. Immutable once
/// built; shared read-only by every worker.
#[derive(Debug)]
pub struct CompiledProfile {
    pub id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    /// Every pack id that contributed, in resolution order.
    pub profile_ids: Vec<String>,
    pub sources: Vec<String>,
    pub threats: Vec<Threat>,
    declared: Vec<Signature>,
    signatures: Vec<CompiledSignature>,
    package_index: PackageIndex,
    loaded_files: Vec<PathBuf>,
}

/// Flattened, not yet compiled, output of the loader.
#[derive(Debug, Default)]
pub struct Resolution {
    pub id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub profile_ids: Vec<String>,
    pub sources: Vec<String>,
    pub threats: Vec<Threat>,
    pub signatures: Vec<Signature>,
    pub loaded_files: Vec<PathBuf>,
}

impl CompiledProfile {
    /// Compile a resolution. Signatures must already be unique by id.
    pub fn compile(resolution: Resolution) -> Result<Self> {
        let mut threat_ids: HashMap<&str, Vec<String>> = HashMap::new();
        for threat in &resolution.threats {
            for sig_id in &threat.signatures {
                let ids = threat_ids.entry(sig_id.as_str()).or_default();
                if !ids.contains(&threat.id) {
                    ids.push(threat.id.clone());
                }
            }
        }

        let signatures = resolution
            .signatures
            .iter()
            .map(|sig| {
                let threats = threat_ids.get(sig.id.as_str()).cloned().unwrap_or_default();
                CompiledSignature::compile(sig, threats)
            })
            .collect::<Result<Vec<_>>>()?;

        let package_index = PackageIndex::build(&signatures);

        Ok(Self {
            id: resolution.id,
            title: resolution.title,
            summary: resolution.summary,
            profile_ids: resolution.profile_ids,
            sources: resolution.sources,
            threats: resolution.threats,
            declared: resolution.signatures,
            signatures,
            package_index,
            loaded_files: resolution.loaded_files,
        })
    }

    pub fn signatures(&self) -> &[CompiledSignature] {
        &self.signatures
    }

    /// Signatures as declared in the packs, for listing.
    pub fn declared_signatures(&self) -> &[Signature] {
        &self.declared
    }

    pub fn signature(&self, id: &str) -> Option<&CompiledSignature> {
        self.signatures.iter().find(|s| s.id == id)
    }

    pub fn package_index(&self) -> &PackageIndex {
        &self.package_index
    }

    pub fn has_package_indicators(&self) -> bool {
        !self.package_index.is_empty()
    }

    /// On-disk files the loader read (manifests and side files).
    pub fn loaded_files(&self) -> &[PathBuf] {
        &self.loaded_files
    }

    /// True if `path` is one of the files this profile was loaded from.
    /// Only canonicalizes when the file name matches, to keep this cheap.
    pub fn is_profile_file(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        self.loaded_files
            .iter()
            .filter(|f| f.file_name() == Some(name))
            .any(|f| std::fs::canonicalize(path).is_ok_and(|p| &p == f))
    }

    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            profile_ids: self.profile_ids.clone(),
            sources: self.sources.clone(),
            signature_count: self.signatures.len(),
            package_pin_count: self.package_index.len(),
            threats: self.threats.clone(),
        }
    }
}

/// What the reporting layer needs to know about the profile.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub id: String,
    pub title: Option<String>,
    pub profile_ids: Vec<String>,
    pub sources: Vec<String>,
    pub signature_count: usize,
    pub package_pin_count: usize,
    pub threats: Vec<Threat>,
}
