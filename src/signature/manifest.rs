//! Raw serde model of signature pack manifests and their side files.

use serde::Deserialize;

use super::{Indicator, PackagePin, Severity, Signature, Threat};
use crate::error::{Result, ScanError};

/// A signature pack manifest, as written on disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackManifest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub extends: Vec<String>,
    #[serde(default)]
    pub compromised_packages_file: Option<String>,
    #[serde(default)]
    pub compromised_packages: Vec<PackageEntry>,
    #[serde(default)]
    pub compromised_packages_signature: Option<SignatureOverride>,
    #[serde(default)]
    pub threats_file: Option<String>,
    #[serde(default)]
    pub threats: Vec<Threat>,
    #[serde(default)]
    pub signatures: Vec<RawSignature>,
}

/// One compromised package with a single version or a list of versions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageEntry {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub versions: Vec<String>,
}

impl PackageEntry {
    pub fn pins(&self) -> impl Iterator<Item = PackagePin> + '_ {
        let name = self.name.trim();
        self.version
            .iter()
            .chain(self.versions.iter())
            .map(|v| v.trim())
            .filter(move |v| !v.is_empty() && !name.is_empty())
            .map(move |v| PackagePin {
                name: name.to_string(),
                version: v.to_string(),
            })
    }
}

/// Manifest-supplied metadata for the synthesized compromised-packages signature.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignatureOverride {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub globs: Vec<String>,
}

impl SignatureOverride {
    /// Fold a later pack's metadata into this one; set fields win.
    pub fn merge(&mut self, later: SignatureOverride) {
        if later.id.is_some() {
            self.id = later.id;
        }
        if later.title.is_some() {
            self.title = later.title;
        }
        if later.severity.is_some() {
            self.severity = later.severity;
        }
        if later.description.is_some() {
            self.description = later.description;
        }
        if !later.globs.is_empty() {
            self.globs = later.globs;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSignature {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub indicators: Vec<RawIndicator>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RawIndicator {
    String {
        value: String,
    },
    Regex {
        #[serde(alias = "value")]
        pattern: String,
    },
    Glob {
        #[serde(alias = "value")]
        pattern: String,
    },
    Sha256 {
        #[serde(alias = "value")]
        hash: String,
    },
    Package {
        name: String,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        versions: Vec<String>,
    },
}

impl RawSignature {
    pub fn into_signature(self, location: &str) -> Result<Signature> {
        let severity = match self.severity.as_deref() {
            None => Severity::Medium,
            Some(s) => Severity::from_str_lenient(s).ok_or_else(|| ScanError::ManifestParse {
                location: location.to_string(),
                message: format!("signature {}: unknown severity '{}'", self.id, s),
            })?,
        };

        let mut indicators = Vec::with_capacity(self.indicators.len());
        for raw in self.indicators {
            match raw {
                RawIndicator::String { value } => indicators.push(Indicator::Literal { value }),
                RawIndicator::Regex { pattern } => indicators.push(Indicator::Pattern { pattern }),
                RawIndicator::Glob { pattern } => indicators.push(Indicator::Glob { pattern }),
                RawIndicator::Sha256 { hash } => indicators.push(Indicator::Digest {
                    hash: hash.trim().to_lowercase(),
                }),
                RawIndicator::Package {
                    name,
                    version,
                    versions,
                } => {
                    let entry = PackageEntry {
                        name,
                        version,
                        versions,
                    };
                    indicators.extend(entry.pins().map(|p| Indicator::Package {
                        name: p.name,
                        version: p.version,
                    }));
                }
            }
        }

        Ok(Signature {
            title: self.title.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            severity,
            description: self.description.unwrap_or_default(),
            indicators,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PackageListDocument {
    List(Vec<PackageEntry>),
    Wrapped { packages: Vec<PackageEntry> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ThreatsDocument {
    List(Vec<Threat>),
    Wrapped { threats: Vec<Threat> },
}

/// Parse a compromised-packages side file. JSON documents are either an array
/// of entries or `{ "packages": [...] }`; anything else is read as a text list
/// with one `name@version` or `name:version` per line.
pub fn parse_package_list(content: &str, location: &str) -> Result<Vec<PackagePin>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        let doc: PackageListDocument =
            serde_json::from_str(content).map_err(|e| ScanError::ManifestParse {
                location: location.to_string(),
                message: e.to_string(),
            })?;
        let entries = match doc {
            PackageListDocument::List(entries) => entries,
            PackageListDocument::Wrapped { packages } => packages,
        };
        return Ok(entries.iter().flat_map(|e| e.pins()).collect());
    }

    Ok(content.lines().filter_map(parse_package_line).collect())
}

fn parse_package_line(line: &str) -> Option<PackagePin> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    // The leading '@' of a scoped name is never the separator.
    let split = line
        .rfind('@')
        .filter(|&i| i > 0)
        .or_else(|| line.rfind(':').filter(|&i| i > 0))?;
    let name = line[..split].trim();
    let version = line[split + 1..].trim();
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some(PackagePin {
        name: name.to_string(),
        version: version.to_string(),
    })
}

pub fn parse_threats(content: &str, location: &str) -> Result<Vec<Threat>> {
    let doc: ThreatsDocument =
        serde_json::from_str(content).map_err(|e| ScanError::ManifestParse {
            location: location.to_string(),
            message: e.to_string(),
        })?;
    Ok(match doc {
        ThreatsDocument::List(threats) => threats,
        ThreatsDocument::Wrapped { threats } => threats,
    })
}
