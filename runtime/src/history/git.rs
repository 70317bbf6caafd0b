//! `git`-backed history.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use imagemerge_core::config::GitConfig;
use imagemerge_core::error::{MergeError, Result};
use imagemerge_core::exec::{CommandOutput, CommandRunner, CommandSpec};
use tokio::runtime::Handle;
use walkdir::WalkDir;

use super::{HistoryBackend, MergeOutcome, MergePolicy, ROOT_BRANCH};
use crate::oci::archive::make_tree_writable;

const METADATA_DIR: &str = ".git";

/// Disables every content transformation git could apply on add/checkout.
const ATTRIBUTES: &str = "* -text -eol -filter -ident -working-tree-encoding\n";

/// [`HistoryBackend`] that shells out to `git`.
///
/// Author and committer dates are pinned so replays are reproducible.
/// Layer content is recorded verbatim: ignore rules (the layer's own
/// `.gitignore` files and the user's global excludes) do not apply, and
/// every checkout removes untracked files.
///
/// The backend is synchronous; commands are driven on `handle`, so it must
/// be used from a thread outside the runtime's async workers (for example
/// inside `spawn_blocking`).
pub struct GitBackend {
    work_tree: PathBuf,
    config: GitConfig,
    runner: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
    handle: Handle,
}

impl GitBackend {
    pub fn new(
        work_tree: &Path,
        config: GitConfig,
        runner: Arc<dyn CommandRunner>,
        timeout: Option<Duration>,
        handle: Handle,
    ) -> Self {
        Self {
            work_tree: work_tree.to_path_buf(),
            config,
            runner,
            timeout,
            handle,
        }
    }

    fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(&self.config.binary)
            .args(args)
            .current_dir(&self.work_tree)
            .env("GIT_AUTHOR_NAME", &self.config.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.config.author_email)
            .env("GIT_AUTHOR_DATE", &self.config.commit_date)
            .env("GIT_COMMITTER_NAME", &self.config.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.config.author_email)
            .env("GIT_COMMITTER_DATE", &self.config.commit_date)
            .timeout(self.timeout)
    }

    fn git<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.command(args);
        tracing::trace!(command = %spec.display(), "Running git");
        self.handle.block_on(self.runner.run_checked(&spec))
    }

    /// Refuse nested repositories and make every file readable so `git add`
    /// can hash it. Git records only the executable bit, so the read bit is
    /// not part of the layer's recorded content.
    fn prepare_tree(&self) -> Result<()> {
        make_tree_writable(&self.work_tree)?;
        let walker = WalkDir::new(&self.work_tree)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && e.file_name() == METADATA_DIR));
        for entry in walker {
            let entry = entry.map_err(|e| MergeError::HistoryBackendError(e.to_string()))?;
            if entry.file_name() == METADATA_DIR {
                let rel = entry.path().strip_prefix(&self.work_tree).unwrap_or(entry.path());
                return Err(MergeError::HistoryBackendError(format!(
                    "Layer content contains a nested git repository at {}; \
                     use the embedded backend for this image",
                    rel.display()
                )));
            }
            if entry.file_type().is_file() {
                ensure_owner_readable(entry.path())?;
            }
        }
        Ok(())
    }

    fn rev_parse(&self, rev: &str) -> Result<String> {
        let output = self.git(["rev-parse", rev])?;
        let id = output.stdout_str().trim().to_string();
        if id.is_empty() {
            return Err(MergeError::HistoryBackendError(format!(
                "git rev-parse {} returned nothing",
                rev
            )));
        }
        Ok(id)
    }

    fn unmerged_paths(&self) -> Result<Vec<String>> {
        let output = self.git(["diff", "--name-only", "--diff-filter=U"])?;
        Ok(output
            .stdout_str()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

impl HistoryBackend for GitBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    fn metadata_dir(&self) -> &'static str {
        METADATA_DIR
    }

    fn init(&mut self) -> Result<String> {
        std::fs::create_dir_all(&self.work_tree)?;
        self.git(["init", "-q"])?;
        self.git(["symbolic-ref", "HEAD", &format!("refs/heads/{}", ROOT_BRANCH)])?;
        self.git(["config", "user.name", &self.config.author_name])?;
        self.git(["config", "user.email", &self.config.author_email])?;
        self.git(["config", "core.autocrlf", "false"])?;
        self.git(["config", "commit.gpgsign", "false"])?;
        let info = self.work_tree.join(METADATA_DIR).join("info");
        std::fs::create_dir_all(&info)?;
        std::fs::write(info.join("attributes"), ATTRIBUTES)?;
        self.git(["commit", "-q", "--allow-empty", "-m", ROOT_BRANCH])?;
        let id = self.rev_parse("HEAD")?;
        tracing::debug!(work_tree = %self.work_tree.display(), root = %id, "Initialized git history");
        Ok(id)
    }

    fn create_branch(&mut self, name: &str, from: &str) -> Result<()> {
        self.git(["branch", name, from])?;
        Ok(())
    }

    fn checkout(&mut self, name: &str) -> Result<()> {
        make_tree_writable(&self.work_tree)?;
        self.git(["checkout", "-q", "-f", name])?;
        self.git(["clean", "-q", "-ffdx"])?;
        Ok(())
    }

    fn commit(&mut self, message: &str) -> Result<String> {
        self.prepare_tree()?;
        self.git(["-c", "core.excludesFile=/dev/null", "add", "-A", "--force"])?;
        self.git(["commit", "-q", "--allow-empty", "-m", message])?;
        self.rev_parse("HEAD")
    }

    fn merge(&mut self, branch: &str, policy: MergePolicy) -> Result<MergeOutcome> {
        let MergePolicy::Ours = policy;
        let before = self.rev_parse("HEAD")?;
        make_tree_writable(&self.work_tree)?;

        let spec = self.command(["merge", "-q", "--no-edit", "-X", "ours", branch]);
        let output = self.handle.block_on(self.runner.run(&spec))?;
        if !output.success() {
            let paths = self.unmerged_paths()?;
            if paths.is_empty() {
                return Err(MergeError::CommandFailed {
                    command: spec.display(),
                    code: output.exit_code,
                    stderr: output.stderr_str().trim().to_string(),
                });
            }
            return Err(MergeError::MergeConflictUnresolved {
                branch: branch.to_string(),
                paths,
            });
        }

        let commit = self.rev_parse("HEAD")?;
        let fast_forward = commit != before && self.rev_parse(branch)? == commit;
        Ok(MergeOutcome {
            commit,
            fast_forward,
            resolved_ours: Vec::new(),
        })
    }

    fn head(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }
}

#[cfg(unix)]
fn ensure_owner_readable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::symlink_metadata(path)?.permissions();
    if perms.mode() & 0o400 == 0 {
        perms.set_mode(perms.mode() | 0o400);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_owner_readable(_path: &Path) -> Result<()> {
    Ok(())
}
