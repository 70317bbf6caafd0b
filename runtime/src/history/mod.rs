//! Filesystem history: per-layer commits on per-image branches.
//!
//! A [`HistoryBackend`] owns a working tree plus a metadata directory inside
//! it. Two backends exist:
//!
//! - [`SnapshotBackend`]: content-addressed snapshots under `.history/`,
//!   no external tools.
//! - [`GitBackend`]: drives the `git` binary through a [`CommandRunner`].

mod builder;
mod git;
mod snapshot;

use std::path::Path;
use std::sync::Arc;

use imagemerge_core::config::{BackendKind, MergeConfig};
use imagemerge_core::error::Result;
use imagemerge_core::exec::CommandRunner;
use tokio::runtime::Handle;

pub use builder::{HistoryBuilder, ImageHistory, LayerCommit};
pub use git::GitBackend;
pub use snapshot::SnapshotBackend;

/// Branch holding the empty super-root commit every image branch starts from.
pub const ROOT_BRANCH: &str = "root";

/// Branch that receives the merge result.
pub const MERGED_BRANCH: &str = "merged";

/// How path-level conflicts are resolved during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Paths changed on both sides keep the checked-out branch's version.
    Ours,
}

/// Result of merging one branch into the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Commit the current branch points at after the merge
    pub commit: String,
    /// The merge only moved the branch pointer
    pub fast_forward: bool,
    /// Paths changed on both sides where our version was kept
    pub resolved_ours: Vec<String>,
}

/// Versioned working tree with branches, commits and merges.
pub trait HistoryBackend: Send {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Directory the tree is materialized in.
    fn work_tree(&self) -> &Path;

    /// Top-level metadata directory inside the work tree, excluded from
    /// packing and protected from layer content.
    fn metadata_dir(&self) -> &'static str;

    /// Create the repository with a single empty commit on [`ROOT_BRANCH`],
    /// checked out. Returns that commit.
    fn init(&mut self) -> Result<String>;

    /// Create branch `name` pointing at the tip of branch `from`.
    fn create_branch(&mut self, name: &str, from: &str) -> Result<()>;

    /// Switch the work tree to branch `name`.
    fn checkout(&mut self, name: &str) -> Result<()>;

    /// Record the current work tree on the current branch.
    fn commit(&mut self, message: &str) -> Result<String>;

    /// Merge `branch` into the current branch.
    fn merge(&mut self, branch: &str, policy: MergePolicy) -> Result<MergeOutcome>;

    /// Commit at the tip of the current branch.
    fn head(&self) -> Result<String>;
}

/// Open the backend selected by `config` on `repo_dir`. External commands
/// run on `handle`.
pub fn open_backend(
    config: &MergeConfig,
    repo_dir: &Path,
    runner: Arc<dyn CommandRunner>,
    handle: Handle,
) -> Box<dyn HistoryBackend> {
    match config.backend {
        BackendKind::Embedded => Box::new(SnapshotBackend::new(repo_dir, &config.git.commit_date)),
        BackendKind::Git => Box::new(GitBackend::new(
            repo_dir,
            config.git.clone(),
            runner,
            config.timeouts.command(),
            handle,
        )),
    }
}
