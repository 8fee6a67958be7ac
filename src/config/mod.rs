use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::DEFAULT_MAX_BYTES;
use crate::error::{Result, ScanError};
use crate::output::OutputFormat;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = ".npmioc.toml";

/// Top-level configuration from `.npmioc.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Signature pack id or manifest path.
    pub profile: String,
    /// Path components containing any of these substrings are skipped.
    pub exclude: Vec<String>,
    pub threads: Option<usize>,
    pub max_depth: Option<usize>,
    /// Non-lockfile files larger than this are matched on their prefix only.
    pub max_bytes: u64,
    /// Extra directories searched for `<id>.json` packs before the built-ins.
    pub profile_dirs: Vec<PathBuf>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            profile: "default".into(),
            exclude: Vec::new(),
            threads: None,
            max_depth: None,
            max_bytes: DEFAULT_MAX_BYTES,
            profile_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub format: OutputFormat,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Console,
        }
    }
}

impl Config {
    /// The explicit config path, or `.npmioc.toml` in the working directory.
    pub fn path_or_default(explicit: Option<PathBuf>) -> PathBuf {
        explicit.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
    }

    /// Load config from a TOML file. Returns default if file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.validate()?;

        // Relative pack directories are relative to the config file.
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for dir in &mut config.scan.profile_dirs {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scan.threads == Some(0) {
            return Err(ScanError::Config("scan.threads must be at least 1".into()));
        }
        if self.scan.max_bytes == 0 {
            return Err(ScanError::Config("scan.max_bytes must be positive".into()));
        }
        if self.scan.profile.trim().is_empty() {
            return Err(ScanError::Config("scan.profile must not be empty".into()));
        }
        Ok(())
    }

    /// Generate a starter config file.
    pub fn starter_toml() -> &'static str {
        r#"# npmioc configuration

[scan]
# Signature pack: a built-in id (default, shai-hulud, qix-2025), an id found
# in one of profile_dirs, or a path to a pack manifest.
profile = "default"

# Skip any path component containing one of these substrings.
# Beware that ".git" also matches ".github".
# exclude = ["node_modules.bak", "dist"]

# Worker threads (default: cores - 1, between 2 and 32).
# threads = 8

# max_depth = 12

# Files above this size are matched on their first max_bytes only.
# Lockfiles are always read in full.
max_bytes = 5242880

# Directories searched for <id>.json packs before the built-ins.
# profile_dirs = ["./signatures"]

[report]
# console or json
format = "console"
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_path_overrides_default_location() {
        assert_eq!(Config::path_or_default(None), PathBuf::from(".npmioc.toml"));
        assert_eq!(
            Config::path_or_default(Some(PathBuf::from("ci/npmioc.toml"))),
            PathBuf::from("ci/npmioc.toml")
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.scan.profile, "default");
        assert_eq!(config.scan.max_bytes, DEFAULT_MAX_BYTES);
    }

    #[test]
    fn starter_config_parses_to_defaults() {
        let config: Config = toml::from_str(Config::starter_toml()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "[scan]\nexclude = [\"dist\"]\nprofile_dirs = [\"packs\"]\n[report]\nformat = \"json\"\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.scan.exclude, vec!["dist".to_string()]);
        assert_eq!(config.scan.profile, "default");
        assert_eq!(config.scan.profile_dirs, vec![dir.path().join("packs")]);
        assert_eq!(config.report.format, OutputFormat::Json);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[scan]\nthreads = 0\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ScanError::Config(_))));
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[scan\nprofile = ").unwrap();
        assert!(matches!(Config::load(&path), Err(ScanError::Toml(_))));
    }
}
