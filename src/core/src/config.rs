use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConvertError, Result};

/// Environment variable overriding the builder binary path.
pub const ENV_NYDUS_BUILDER: &str = "NYDUS_BUILDER";

/// Environment variable overriding the root of per-call work directories.
pub const ENV_NYDUS_WORKDIR: &str = "NYDUS_WORKDIR";

/// Builder binary used when nothing else is configured.
pub const DEFAULT_BUILDER: &str = "nydus-image";

/// RAFS format version used when nothing else is configured.
pub const DEFAULT_FS_VERSION: &str = "5";

/// Converter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ConvertConfig {
    /// Path to the builder binary (`nydus-image`)
    pub builder_path: PathBuf,

    /// Root directory for per-call temporary work directories
    pub work_dir: PathBuf,

    /// RAFS format version: "5", or "6" (EROFS-compatible)
    pub fs_version: String,

    /// Chunk compressor passed to the builder (e.g. "none", "lz4_block", "zstd")
    pub compressor: Option<String>,

    /// Bootstrap of a chunk dictionary image
    pub chunk_dict_path: Option<PathBuf>,

    /// File path patterns to prefetch, newline separated
    pub prefetch_patterns: String,

    /// Deadline for each builder invocation, in seconds (unset = no deadline)
    pub timeout_secs: Option<u64>,

    /// Compression of OCI layers produced by reconversion: "gzip", "zstd", "uncompressed"
    pub oci_compressor: String,

    /// How converted manifests are marked inside an image index
    pub index_marker: IndexMarker,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            builder_path: PathBuf::from(DEFAULT_BUILDER),
            work_dir: std::env::temp_dir(),
            fs_version: DEFAULT_FS_VERSION.to_string(),
            compressor: None,
            chunk_dict_path: None,
            prefetch_patterns: "/".to_string(),
            timeout_secs: None,
            oci_compressor: "gzip".to_string(),
            index_marker: IndexMarker::OsFeature,
        }
    }
}

impl ConvertConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ConvertError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: ConvertConfig = serde_yaml::from_str(&data).map_err(|e| {
            ConvertError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `NYDUS_BUILDER` and `NYDUS_WORKDIR` overrides from the environment.
    pub fn with_env(self) -> Self {
        self.with_overrides(
            std::env::var_os(ENV_NYDUS_BUILDER).map(PathBuf::from),
            std::env::var_os(ENV_NYDUS_WORKDIR).map(PathBuf::from),
        )
    }

    fn with_overrides(mut self, builder: Option<PathBuf>, work_dir: Option<PathBuf>) -> Self {
        if let Some(builder) = builder.filter(|p| !p.as_os_str().is_empty()) {
            self.builder_path = builder;
        }
        if let Some(work_dir) = work_dir.filter(|p| !p.as_os_str().is_empty()) {
            self.work_dir = work_dir;
        }
        self
    }

    /// Builder deadline as a `Duration`.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Check that option values are understood.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.fs_version.as_str(), "5" | "6") {
            return Err(ConvertError::ConfigError(format!(
                "unsupported fs version '{}' (supported: 5, 6)",
                self.fs_version
            )));
        }
        if !matches!(
            self.oci_compressor.as_str(),
            "gzip" | "zstd" | "uncompressed"
        ) {
            return Err(ConvertError::ConfigError(format!(
                "unsupported OCI compressor '{}' (supported: gzip, zstd, uncompressed)",
                self.oci_compressor
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConvertError::ConfigError(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Marker added to converted manifests inside an image index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexMarker {
    /// Append `nydus.remoteimage.v1` to the platform's `os.features`
    #[default]
    OsFeature,
    /// Set the descriptor's `artifactType`
    ArtifactType,
}

impl std::fmt::Display for IndexMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OsFeature => write!(f, "os-feature"),
            Self::ArtifactType => write!(f, "artifact-type"),
        }
    }
}

impl std::str::FromStr for IndexMarker {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "os-feature" => Ok(Self::OsFeature),
            "artifact-type" => Ok(Self::ArtifactType),
            _ => Err(format!(
                "unknown index marker: '{}' (supported: os-feature, artifact-type)",
                s
            )),
        }
    }
}
