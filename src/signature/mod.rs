//! Signature data model: indicators, signatures, threats, and their compiled forms.
//!
//! Packs are parsed into [`Signature`]s (see [`manifest`]), resolved and merged
//! by the [`loader`], and compiled once into [`CompiledSignature`]s that the
//! matching engine reads concurrently without further mutation.

pub mod glob;
pub mod loader;
pub mod manifest;
pub mod profile;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

pub use glob::GlobPattern;
pub use loader::ProfileLoader;
pub use profile::{CompiledProfile, PackageIndex, ProfileSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_str_lenient(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" | "info" => Some(Self::Low),
            "medium" | "med" | "moderate" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" | "crit" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Indicator kind as it appears in manifests and detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    Glob,
    String,
    Regex,
    Sha256,
    Package,
}

impl std::fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Glob => write!(f, "glob"),
            Self::String => write!(f, "string"),
            Self::Regex => write!(f, "regex"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Package => write!(f, "package"),
        }
    }
}

/// A single indicator of compromise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Indicator {
    /// Case-insensitive substring of decoded file text.
    #[serde(rename = "string")]
    Literal { value: String },
    /// Case-insensitive regular expression over decoded file text.
    #[serde(rename = "regex")]
    Pattern { pattern: String },
    /// Path glob; needs no file content.
    Glob { pattern: String },
    /// Lowercase hex SHA-256 of the full file.
    #[serde(rename = "sha256")]
    Digest { hash: String },
    /// Exact dependency pin.
    Package { name: String, version: String },
}

impl Indicator {
    pub fn kind(&self) -> IndicatorKind {
        match self {
            Self::Literal { .. } => IndicatorKind::String,
            Self::Pattern { .. } => IndicatorKind::Regex,
            Self::Glob { .. } => IndicatorKind::Glob,
            Self::Digest { .. } => IndicatorKind::Sha256,
            Self::Package { .. } => IndicatorKind::Package,
        }
    }

    /// The indicator value as reported in detections.
    pub fn value(&self) -> String {
        match self {
            Self::Literal { value } => value.clone(),
            Self::Pattern { pattern } | Self::Glob { pattern } => pattern.clone(),
            Self::Digest { hash } => hash.clone(),
            Self::Package { name, version } => package_key(name, version),
        }
    }
}

/// `name@version`, the form used in detections and unstructured lockfile search.
pub fn package_key(name: &str, version: &str) -> String {
    format!("{name}@{version}")
}

/// A named detection rule, as declared in a pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signature {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    pub description: String,
    pub indicators: Vec<Indicator>,
}

/// Grouping metadata that annotates signatures for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threat {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Ids of the signatures this threat annotates.
    #[serde(default, alias = "signatureIds")]
    pub signatures: Vec<String>,
}

impl Threat {
    /// Merge a later definition of the same threat into this one. Scalars take
    /// the later value, lists are unioned preserving first-seen order.
    pub fn merge(&mut self, later: Threat) {
        if later.title.is_some() {
            self.title = later.title;
        }
        if later.summary.is_some() {
            self.summary = later.summary;
        }
        union_into(&mut self.sources, later.sources);
        union_into(&mut self.tags, later.tags);
        union_into(&mut self.signatures, later.signatures);
    }
}

pub(crate) fn union_into(target: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

/// A dependency pin carried by a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackagePin {
    pub name: String,
    pub version: String,
}

impl PackagePin {
    pub fn key(&self) -> String {
        package_key(&self.name, &self.version)
    }
}

/// Matcher-ready signature: indicators partitioned per kind, regexes and
/// globs compiled, literals and digests lowercased.
#[derive(Debug, Clone)]
pub struct CompiledSignature {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    pub description: String,
    pub threat_ids: Vec<String>,
    pub globs: Vec<GlobPattern>,
    pub literals: Vec<String>,
    pub patterns: Vec<Regex>,
    pub digests: Vec<String>,
    pub packages: Vec<PackagePin>,
}

impl CompiledSignature {
    pub fn compile(signature: &Signature, threat_ids: Vec<String>) -> Result<Self> {
        let mut compiled = Self {
            id: signature.id.clone(),
            title: signature.title.clone(),
            severity: signature.severity,
            description: signature.description.clone(),
            threat_ids,
            globs: Vec::new(),
            literals: Vec::new(),
            patterns: Vec::new(),
            digests: Vec::new(),
            packages: Vec::new(),
        };

        for indicator in &signature.indicators {
            match indicator {
                Indicator::Literal { value } => compiled.literals.push(value.to_lowercase()),
                Indicator::Pattern { pattern } => {
                    let regex = RegexBuilder::new(pattern)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| invalid(&signature.id, "regex", pattern, e))?;
                    compiled.patterns.push(regex);
                }
                Indicator::Glob { pattern } => {
                    let glob = GlobPattern::compile(pattern)
                        .map_err(|e| invalid(&signature.id, "glob", pattern, e))?;
                    compiled.globs.push(glob);
                }
                Indicator::Digest { hash } => {
                    compiled.digests.push(hash.trim().to_lowercase());
                }
                Indicator::Package { name, version } => compiled.packages.push(PackagePin {
                    name: name.clone(),
                    version: version.clone(),
                }),
            }
        }

        Ok(compiled)
    }

    /// True when the signature has globs and nothing else.
    pub fn is_glob_only(&self) -> bool {
        !self.globs.is_empty()
            && self.literals.is_empty()
            && self.patterns.is_empty()
            && self.digests.is_empty()
            && self.packages.is_empty()
    }

    /// Literal, pattern, and package indicators need decoded file text.
    pub fn needs_text(&self) -> bool {
        !self.literals.is_empty() || !self.patterns.is_empty() || !self.packages.is_empty()
    }

    pub fn needs_digest(&self) -> bool {
        !self.digests.is_empty()
    }

    /// First glob matching `path`, or `None`. Signatures without globs are
    /// eligible for every path; callers check `globs.is_empty()` first.
    pub fn matching_glob(&self, path: &str) -> Option<&GlobPattern> {
        self.globs.iter().find(|g| g.is_match_str(path))
    }
}

fn invalid(signature_id: &str, kind: &'static str, pattern: &str, e: regex::Error) -> ScanError {
    ScanError::InvalidPattern {
        signature_id: signature_id.to_string(),
        kind,
        pattern: pattern.to_string(),
        message: e.to_string(),
    }
}
