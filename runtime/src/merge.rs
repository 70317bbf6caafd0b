//! Ordered ours-wins merge of replayed image branches.

use imagemerge_core::cancel::CancelFlag;
use imagemerge_core::error::{MergeError, Result};

use crate::history::{HistoryBackend, ImageHistory, MergePolicy, MERGED_BRANCH};

/// Outcome of merging all image branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// Branch holding the merged tree
    pub branch: String,
    /// Commit at the tip of that branch
    pub head: String,
    /// Source branches, in merge order
    pub merged_branches: Vec<String>,
    /// Paths where an earlier source's version won
    pub resolved_ours: Vec<String>,
}

/// Merges image branches in source order; earlier sources win.
pub struct MergeEngine {
    cancel: CancelFlag,
}

impl MergeEngine {
    pub fn new(cancel: CancelFlag) -> Self {
        Self { cancel }
    }

    /// Start [`MERGED_BRANCH`] at the first history and fold in the rest.
    pub fn merge(
        &self,
        backend: &mut dyn HistoryBackend,
        histories: &[ImageHistory],
    ) -> Result<MergeResult> {
        let Some((first, rest)) = histories.split_first() else {
            return Err(MergeError::Other("No image histories to merge".to_string()));
        };

        backend.create_branch(MERGED_BRANCH, &first.branch)?;
        backend.checkout(MERGED_BRANCH)?;

        let mut resolved_ours = Vec::new();
        let mut merged_branches = vec![first.branch.clone()];
        for history in rest {
            self.cancel.check(&format!("merging {}", history.branch))?;

            let outcome = backend.merge(&history.branch, MergePolicy::Ours)?;
            tracing::info!(
                branch = %history.branch,
                commit = %outcome.commit,
                fast_forward = outcome.fast_forward,
                kept_ours = outcome.resolved_ours.len(),
                "Merged image branch"
            );
            resolved_ours.extend(outcome.resolved_ours);
            merged_branches.push(history.branch.clone());
        }
        resolved_ours.sort();
        resolved_ours.dedup();

        Ok(MergeResult {
            branch: MERGED_BRANCH.to_string(),
            head: backend.head()?,
            merged_branches,
            resolved_ours,
        })
    }
}
