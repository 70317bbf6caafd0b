use thiserror::Error;

/// Pipeline stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Parsing the destination tag and source references
    References,
    /// Pulling layer blobs onto local disk
    Extract,
    /// Replaying layers as per-image branches
    History,
    /// Merging the per-image branches
    Merge,
    /// Packing the merged tree into an image artifact
    Assemble,
    /// Handing the artifact to the local image store
    Load,
}

impl PipelineStage {
    /// Short stage name used in error chains and log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::References => "references",
            Self::Extract => "extract",
            Self::History => "history",
            Self::Merge => "merge",
            Self::Assemble => "assemble",
            Self::Load => "load",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Coarse classification of a [`MergeError`], independent of stage wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidReference,
    InsufficientSources,
    BlobFetch,
    BlobWrite,
    HistoryReplay,
    MergeConflictUnresolved,
    Archive,
    Serialization,
    Load,
    Timeout,
    Cancelled,
    CommandFailed,
    HistoryBackend,
    OciImage,
    Registry,
    Config,
    Io,
    Other,
}

/// imagemerge error types
#[derive(Error, Debug)]
pub enum MergeError {
    /// A destination tag or source reference could not be parsed
    #[error("Invalid reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// Fewer source images than a merge needs
    #[error("Insufficient sources: need at least {required} images, got {given}")]
    InsufficientSources { required: usize, given: usize },

    /// A layer blob could not be retrieved from its image source
    #[error("Blob fetch failed for {image} ({digest}): {message}")]
    BlobFetchError {
        image: String,
        digest: String,
        message: String,
    },

    /// A layer blob could not be written to local storage
    #[error("Blob write failed for {digest}: {message}")]
    BlobWriteError { digest: String, message: String },

    /// A layer could not be applied or committed to its branch
    #[error("History replay failed for {image} at layer {layer}: {message}")]
    HistoryReplayError {
        image: String,
        layer: String,
        message: String,
    },

    /// The merge primitive could not resolve a conflict even under its policy
    #[error("Unresolved merge conflict merging {branch}: {}", paths.join(", "))]
    MergeConflictUnresolved { branch: String, paths: Vec<String> },

    /// Archiving the merged tree failed
    #[error("Archive error: {0}")]
    ArchiveError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The local image store rejected the artifact
    #[error("Load error: {0}")]
    LoadError(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// The operation was cancelled at a stage or layer boundary
    #[error("Cancelled before {0}")]
    Cancelled(String),

    /// An external command exited unsuccessfully
    #[error("Command `{command}` exited with {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// History backend error other than a merge conflict
    #[error("History backend error: {0}")]
    HistoryBackendError(String),

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// An error annotated with the pipeline stage it came from
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: PipelineStage,
        #[source]
        source: Box<MergeError>,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MergeError {
    /// Wrap this error with the stage that produced it.
    ///
    /// An error already tagged with the same stage is returned unchanged.
    pub fn in_stage(self, stage: PipelineStage) -> Self {
        match self {
            MergeError::Stage { stage: s, .. } if s == stage => self,
            other => MergeError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, with all stage annotations removed.
    pub fn root(&self) -> &MergeError {
        let mut current = self;
        while let MergeError::Stage { source, .. } = current {
            current = source;
        }
        current
    }

    /// The outermost stage annotation, if any.
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            MergeError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Classify the root cause.
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            MergeError::InvalidReference { .. } => ErrorKind::InvalidReference,
            MergeError::InsufficientSources { .. } => ErrorKind::InsufficientSources,
            MergeError::BlobFetchError { .. } => ErrorKind::BlobFetch,
            MergeError::BlobWriteError { .. } => ErrorKind::BlobWrite,
            MergeError::HistoryReplayError { .. } => ErrorKind::HistoryReplay,
            MergeError::MergeConflictUnresolved { .. } => ErrorKind::MergeConflictUnresolved,
            MergeError::ArchiveError(_) => ErrorKind::Archive,
            MergeError::SerializationError(_) => ErrorKind::Serialization,
            MergeError::LoadError(_) => ErrorKind::Load,
            MergeError::TimeoutError(_) => ErrorKind::Timeout,
            MergeError::Cancelled(_) => ErrorKind::Cancelled,
            MergeError::CommandFailed { .. } => ErrorKind::CommandFailed,
            MergeError::HistoryBackendError(_) => ErrorKind::HistoryBackend,
            MergeError::OciImageError(_) => ErrorKind::OciImage,
            MergeError::RegistryError { .. } => ErrorKind::Registry,
            MergeError::ConfigError(_) => ErrorKind::Config,
            MergeError::IoError(_) => ErrorKind::Io,
            MergeError::Other(_) => ErrorKind::Other,
            MergeError::Stage { .. } => unreachable!("root() strips stage wrappers"),
        }
    }
}

impl From<serde_json::Error> for MergeError {
    fn from(err: serde_json::Error) -> Self {
        MergeError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for MergeError {
    fn from(err: serde_yaml::Error) -> Self {
        MergeError::SerializationError(err.to_string())
    }
}

/// Attach pipeline stage context to a result.
pub trait ResultExt<T> {
    /// Tag the error, if any, with `stage`.
    fn stage(self, stage: PipelineStage) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn stage(self, stage: PipelineStage) -> Result<T> {
        self.map_err(|e| e.in_stage(stage))
    }
}

/// Result type alias for imagemerge operations
pub type Result<T> = std::result::Result<T, MergeError>;
