//! Framework configuration
//!
//! [`FrameworkConfig`] carries every tunable of the runtime with sensible
//! defaults. It can be loaded from a TOML, JSON or YAML file (format chosen
//! by extension) and every field can be overridden through environment
//! variables with the `HOTSWAP_` prefix, e.g. `HOTSWAP_PLUGIN_DIR=/opt/plugins`
//! or `HOTSWAP_ARTIFACT_EXTENSIONS=zip,jar`.

use config::{Config as Cfg, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default environment prefix.
pub const ENV_PREFIX: &str = "HOTSWAP";

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    /// Flat directory of live artifacts; scanned and installed into
    pub plugin_dir: PathBuf,
    /// Where nested archives are extracted; the system temp dir when unset
    pub scratch_dir: Option<PathBuf>,
    /// Zip of modules shipped with the host, unpacked into [`Self::bundled_dir`] on start
    pub bundled_archive: Option<PathBuf>,
    /// JSON file holding enablement overrides; in-memory only when unset
    pub overrides_file: Option<PathBuf>,
    /// File extensions the scanner treats as artifacts
    pub artifact_extensions: Vec<String>,
    /// Entry-name prefix marking nested archives inside an artifact
    pub nested_prefix: String,
    /// Extension of nested archives
    pub nested_extension: String,
    /// Prefix prepended to a file name to form its backup name
    pub backup_prefix: String,
    /// Poll interval of the scan poller
    pub scan_interval_ms: u64,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            scratch_dir: None,
            bundled_archive: None,
            overrides_file: None,
            artifact_extensions: vec!["zip".to_string(), "jar".to_string()],
            nested_prefix: "bundled-libs/".to_string(),
            nested_extension: "zip".to_string(),
            backup_prefix: ".bak-".to_string(),
            scan_interval_ms: 5_000,
        }
    }
}

impl FrameworkConfig {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn with_bundled_archive(mut self, archive: impl Into<PathBuf>) -> Self {
        self.bundled_archive = Some(archive.into());
        self
    }

    pub fn with_overrides_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.overrides_file = Some(file.into());
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Scratch directory, falling back to the system temp dir.
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Where the bundled archive is unpacked, kept apart from `plugin_dir`
    /// so a re-extraction never touches installed artifacts.
    pub fn bundled_dir(&self) -> PathBuf {
        self.scratch_dir().join("bundled-plugins")
    }

    /// Whether `path` has one of the configured artifact extensions.
    pub fn is_artifact(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.artifact_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.plugin_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("plugin_dir cannot be empty".into()));
        }
        if self.artifact_extensions.iter().all(|e| e.trim().is_empty()) {
            return Err(ConfigError::Invalid("artifact_extensions cannot be empty".into()));
        }
        if self.nested_extension.trim().is_empty() {
            return Err(ConfigError::Invalid("nested_extension cannot be empty".into()));
        }
        if self.backup_prefix.is_empty() || self.backup_prefix.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "backup_prefix '{}' must be a non-empty file name prefix",
                self.backup_prefix
            )));
        }
        if self.scan_interval_ms == 0 {
            return Err(ConfigError::Invalid("scan_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Load configuration from an optional file plus `HOTSWAP_*` variables.
pub fn load_config(path: Option<&Path>) -> ConfigResult<FrameworkConfig> {
    load_config_with_prefix(path, ENV_PREFIX)
}

/// Like [`load_config`] with a custom environment prefix.
pub fn load_config_with_prefix(path: Option<&Path>, env_prefix: &str) -> ConfigResult<FrameworkConfig> {
    let mut builder = Cfg::builder();

    if let Some(path) = path {
        let format = detect_format(path)?;
        builder = builder.add_source(File::from(path).format(format).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(env_prefix)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("artifact_extensions"),
    );

    let config: FrameworkConfig = builder
        .build()
        .and_then(|cfg| cfg.try_deserialize())
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    config.validate()?;
    Ok(config)
}
