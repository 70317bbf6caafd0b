//! imagemerge runtime - the merge pipeline.
//!
//! Source images are extracted layer by layer, replayed as per-layer commit
//! histories on branches of a working repository, merged in source order
//! with earlier sources winning, and packed as a single-layer image that is
//! loaded into an image store.

#![allow(clippy::result_large_err)]

pub mod assemble;
pub mod extract;
pub mod history;
pub mod loader;
pub mod merge;
pub mod oci;
pub mod operation;
pub mod references;
pub mod source;

// Re-export common types
pub use assemble::{merge_container_configs, ImageAssembler, MergedImage};
pub use extract::{ExtractedImage, ExtractedLayer, LayerExtractor};
pub use history::{
    open_backend, GitBackend, HistoryBackend, HistoryBuilder, ImageHistory, MergeOutcome,
    MergePolicy, SnapshotBackend, MERGED_BRANCH, ROOT_BRANCH,
};
pub use loader::{loader_from_config, DockerLoader, ImageLoader, LoadedImage, StoreLoader};
pub use merge::{MergeEngine, MergeResult};
pub use oci::{ImagePuller, ImageReference, ImageStore, OciImage, OciImageConfig, RegistryAuth, StoredImage};
pub use operation::{remove_work_dir, MergeOperation, MergeReport};
pub use references::{ReferenceSet, MIN_SOURCES};
pub use source::{
    source_from_config, DockerSourceProvider, ImageSource, ImageSourceProvider, LayoutImageSource,
    StoreSourceProvider,
};

/// imagemerge runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
