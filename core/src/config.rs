use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MergeError, Result};

/// Fixed author/committer date for replayed layer commits.
pub const DEFAULT_COMMIT_DATE: &str = "1523820568 -0700";

/// Merge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Parent directory for per-operation working directories
    pub work_root: PathBuf,

    /// Local image store directory
    pub store_dir: PathBuf,

    /// Architecture recorded in the merged image config (OCI name, e.g. amd64)
    pub architecture: String,

    /// OS recorded in the merged image config
    pub os: String,

    /// Where source images are read from
    pub source: SourceKind,

    /// Filesystem history backend
    pub backend: BackendKind,

    /// Where the merged image is loaded
    pub loader: LoaderKind,

    /// Pull source images from their registry when absent from the store
    pub pull: bool,

    /// Settings for the git history backend
    pub git: GitConfig,

    /// Docker CLI used by the docker source and loader
    pub docker_binary: String,

    /// Stage timeouts
    pub timeouts: TimeoutConfig,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir(),
            store_dir: default_home().join("images"),
            architecture: host_architecture().to_string(),
            os: "linux".to_string(),
            source: SourceKind::default(),
            backend: BackendKind::default(),
            loader: LoaderKind::default(),
            pull: true,
            git: GitConfig::default(),
            docker_binary: "docker".to_string(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl MergeConfig {
    /// Default configuration file location (`~/.imagemerge/config.yaml`).
    pub fn default_path() -> PathBuf {
        default_home().join("config.yaml")
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MergeError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: MergeConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load an explicit config file, or the default one if it exists.
    ///
    /// A missing default file yields the built-in defaults; a missing
    /// explicit file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    tracing::debug!(path = %path.display(), "No config file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Check field values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.architecture.is_empty() {
            return Err(MergeError::ConfigError(
                "architecture must not be empty".to_string(),
            ));
        }
        if self.os.is_empty() {
            return Err(MergeError::ConfigError("os must not be empty".to_string()));
        }
        if self.git.binary.is_empty() {
            return Err(MergeError::ConfigError(
                "git.binary must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Filesystem history backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Content-addressed snapshots kept under `.history/` (no external tools).
    #[default]
    Embedded,
    /// The `git` binary.
    Git,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedded => write!(f, "embedded"),
            Self::Git => write!(f, "git"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "embedded" => Ok(Self::Embedded),
            "git" => Ok(Self::Git),
            _ => Err(format!(
                "unknown history backend: '{}' (supported: embedded, git)",
                s
            )),
        }
    }
}

/// Source image provider selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// The local OCI image store, pulling from registries when enabled.
    #[default]
    Store,
    /// A Docker daemon via `docker save`.
    Docker,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store => write!(f, "store"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "store" => Ok(Self::Store),
            "docker" => Ok(Self::Docker),
            _ => Err(format!("unknown image source: '{}' (supported: store, docker)", s)),
        }
    }
}

/// Image loader selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoaderKind {
    /// The local OCI image store.
    #[default]
    Store,
    /// A Docker daemon via `docker load`.
    Docker,
}

impl std::fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store => write!(f, "store"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for LoaderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "store" => Ok(Self::Store),
            "docker" => Ok(Self::Docker),
            _ => Err(format!("unknown loader: '{}' (supported: store, docker)", s)),
        }
    }
}

/// Git backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Git executable
    pub binary: String,

    /// Commit author name
    pub author_name: String,

    /// Commit author email
    pub author_email: String,

    /// Author and committer date applied to every commit
    pub commit_date: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: "git".to_string(),
            author_name: "imagemerge".to_string(),
            author_email: "imagemerge@localhost".to_string(),
            commit_date: DEFAULT_COMMIT_DATE.to_string(),
        }
    }
}

/// Timeouts in seconds. 0 disables a timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Resolving and pulling one source image
    pub fetch_secs: u64,

    /// One external command (git, docker)
    pub command_secs: u64,

    /// Loading the merged image
    pub load_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch_secs: 600,
            command_secs: 300,
            load_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn fetch(&self) -> Option<std::time::Duration> {
        secs(self.fetch_secs)
    }

    pub fn command(&self) -> Option<std::time::Duration> {
        secs(self.command_secs)
    }

    pub fn load(&self) -> Option<std::time::Duration> {
        secs(self.load_secs)
    }
}

fn secs(value: u64) -> Option<std::time::Duration> {
    (value > 0).then(|| std::time::Duration::from_secs(value))
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".imagemerge")
}

/// Host architecture in OCI naming.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}
