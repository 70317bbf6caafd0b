//! imagemerge core - foundational types
//!
//! Error type and stage context, configuration, cancellation and the
//! command-execution seam shared by the runtime and the CLI.

pub mod cancel;
pub mod config;
pub mod error;
pub mod exec;

// Re-export commonly used types
pub use cancel::CancelFlag;
pub use config::{BackendKind, GitConfig, LoaderKind, MergeConfig, SourceKind, TimeoutConfig};
pub use error::{ErrorKind, MergeError, PipelineStage, Result, ResultExt};
pub use exec::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};

/// imagemerge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
