//! Embedded history backend.
//!
//! Each commit records a full snapshot of the work tree as a sorted map of
//! relative path to entry. File contents live once in a content-addressed
//! object directory. Commit ids are the sha256 of the serialized commit, so
//! identical content, parents, message and date give identical ids.
//!
//! ```text
//!  <work_tree>/.history/
//!  ├── HEAD              (current branch name)
//!  ├── refs/<branch>     (commit id)
//!  ├── commits/<id>.json
//!  └── objects/<sha256>  (file contents)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};

use imagemerge_core::error::{MergeError, Result};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::{HistoryBackend, MergeOutcome, MergePolicy, ROOT_BRANCH};
use crate::oci::archive::{make_tree_writable, open_for_read};
use crate::oci::digest::{sha256_bytes, HashingWriter};

const METADATA_DIR: &str = ".history";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TreeEntry {
    Dir { mode: u32 },
    File { mode: u32, object: String, size: u64 },
    Symlink { target: String },
}

impl TreeEntry {
    fn is_dir(&self) -> bool {
        matches!(self, TreeEntry::Dir { .. })
    }
}

type Tree = BTreeMap<String, TreeEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Commit {
    tree: Tree,
    parents: Vec<String>,
    message: String,
    date: String,
}

/// Snapshot-based [`HistoryBackend`] needing no external tools.
pub struct SnapshotBackend {
    work_tree: PathBuf,
    meta: PathBuf,
    commit_date: String,
}

impl SnapshotBackend {
    pub fn new(work_tree: &Path, commit_date: &str) -> Self {
        Self {
            work_tree: work_tree.to_path_buf(),
            meta: work_tree.join(METADATA_DIR),
            commit_date: commit_date.to_string(),
        }
    }

    fn current_branch(&self) -> Result<String> {
        let head = std::fs::read_to_string(self.meta.join("HEAD"))
            .map_err(|e| backend_error(format!("Failed to read HEAD: {}", e)))?;
        Ok(head.trim().to_string())
    }

    fn ref_path(&self, branch: &str) -> Result<PathBuf> {
        let valid = !branch.is_empty()
            && !branch.starts_with('.')
            && !branch.contains('/')
            && !branch.contains("..");
        if !valid {
            return Err(backend_error(format!("Invalid branch name '{}'", branch)));
        }
        Ok(self.meta.join("refs").join(branch))
    }

    fn read_ref(&self, branch: &str) -> Result<String> {
        let path = self.ref_path(branch)?;
        let id = std::fs::read_to_string(&path)
            .map_err(|_| backend_error(format!("Unknown branch '{}'", branch)))?;
        Ok(id.trim().to_string())
    }

    fn write_ref(&self, branch: &str, id: &str) -> Result<()> {
        std::fs::write(self.ref_path(branch)?, id)
            .map_err(|e| backend_error(format!("Failed to update branch '{}': {}", branch, e)))
    }

    fn load_commit(&self, id: &str) -> Result<Commit> {
        let path = self.meta.join("commits").join(format!("{}.json", id));
        let data = std::fs::read(&path)
            .map_err(|e| backend_error(format!("Failed to read commit {}: {}", id, e)))?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn store_commit(&self, commit: &Commit) -> Result<String> {
        let data = serde_json::to_vec(commit)?;
        let id = sha256_bytes(&data);
        let path = self.meta.join("commits").join(format!("{}.json", id));
        if !path.exists() {
            std::fs::write(&path, &data)
                .map_err(|e| backend_error(format!("Failed to write commit {}: {}", id, e)))?;
        }
        Ok(id)
    }

    /// Hash and copy a file into the object directory in one pass. Objects
    /// are written with default permissions; the tree entry keeps the mode.
    fn store_object(&self, path: &Path) -> Result<String> {
        let objects = self.meta.join("objects");
        let partial = objects.join(format!("incoming-{}", uuid::Uuid::new_v4()));
        let stored = (|| -> std::io::Result<String> {
            let mut source = open_for_read(path)?;
            let mut writer = HashingWriter::new(File::create(&partial)?);
            std::io::copy(&mut source, &mut writer)?;
            let (file, hash, _) = writer.finish();
            file.sync_all()?;
            let target = objects.join(&hash);
            if target.exists() {
                std::fs::remove_file(&partial)?;
            } else {
                std::fs::rename(&partial, &target)?;
            }
            Ok(hash)
        })();
        if stored.is_err() && partial.exists() {
            let _ = std::fs::remove_file(&partial);
        }
        stored.map_err(|e| backend_error(format!("Failed to store {}: {}", path.display(), e)))
    }

    /// Record the current work tree.
    fn snapshot(&self) -> Result<Tree> {
        let mut tree = Tree::new();
        let walker = WalkDir::new(&self.work_tree)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() != 1 || e.file_name() != METADATA_DIR);

        for entry in walker {
            let entry = entry.map_err(|e| backend_error(format!("Failed to walk work tree: {}", e)))?;
            let rel = entry
                .path()
                .strip_prefix(&self.work_tree)
                .map_err(|e| backend_error(e.to_string()))?;
            let key = rel
                .to_str()
                .ok_or_else(|| backend_error(format!("Non UTF-8 path {}", rel.display())))?
                .to_string();
            let metadata = entry.path().symlink_metadata()?;
            let file_type = metadata.file_type();

            let value = if file_type.is_dir() {
                TreeEntry::Dir {
                    mode: file_mode(&metadata),
                }
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                TreeEntry::Symlink {
                    target: target.to_string_lossy().into_owned(),
                }
            } else if file_type.is_file() {
                TreeEntry::File {
                    mode: file_mode(&metadata),
                    object: self.store_object(entry.path())?,
                    size: metadata.len(),
                }
            } else {
                tracing::debug!(path = %key, "Not recording special file");
                continue;
            };
            tree.insert(key, value);
        }
        Ok(tree)
    }

    /// Replace the work tree with `tree`, keeping the metadata directory.
    fn materialize(&self, tree: &Tree) -> Result<()> {
        for entry in std::fs::read_dir(&self.work_tree)? {
            let entry = entry?;
            if entry.file_name() == METADATA_DIR {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                make_tree_writable(&path)?;
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }

        let mut dirs = Vec::new();
        for (key, entry) in tree {
            let path = self.work_tree.join(key);
            match entry {
                TreeEntry::Dir { mode } => {
                    std::fs::create_dir_all(&path)?;
                    dirs.push((path, *mode));
                }
                TreeEntry::File { mode, object, .. } => {
                    std::fs::copy(self.meta.join("objects").join(object), &path).map_err(|e| {
                        backend_error(format!("Failed to restore {}: {}", key, e))
                    })?;
                    set_mode(&path, *mode)?;
                }
                TreeEntry::Symlink { target } => make_symlink(target, &path)?,
            }
        }

        // Children first, so read-only directories are filled before locking.
        for (path, mode) in dirs.iter().rev() {
            set_mode(path, *mode)?;
        }
        Ok(())
    }

    fn ancestors(&self, id: &str) -> Result<HashSet<String>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            queue.extend(self.load_commit(&current)?.parents);
        }
        Ok(seen)
    }

    /// Nearest common ancestor, searching breadth-first from `theirs`.
    fn merge_base(&self, ours: &str, theirs: &str) -> Result<Option<String>> {
        let ours_ancestors = self.ancestors(ours)?;
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([theirs.to_string()]);
        while let Some(current) = queue.pop_front() {
            if ours_ancestors.contains(&current) {
                return Ok(Some(current));
            }
            if seen.insert(current.clone()) {
                queue.extend(self.load_commit(&current)?.parents);
            }
        }
        Ok(None)
    }
}

impl HistoryBackend for SnapshotBackend {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    fn metadata_dir(&self) -> &'static str {
        METADATA_DIR
    }

    fn init(&mut self) -> Result<String> {
        if self.meta.join("HEAD").exists() {
            return Err(backend_error(format!(
                "{} is already a repository",
                self.work_tree.display()
            )));
        }
        for dir in ["objects", "commits", "refs"] {
            std::fs::create_dir_all(self.meta.join(dir))?;
        }
        let populated = std::fs::read_dir(&self.work_tree)?
            .filter_map(|e| e.ok())
            .any(|e| e.file_name() != METADATA_DIR);
        if populated {
            return Err(backend_error(format!(
                "{} is not empty",
                self.work_tree.display()
            )));
        }

        let root = Commit {
            tree: Tree::new(),
            parents: Vec::new(),
            message: ROOT_BRANCH.to_string(),
            date: self.commit_date.clone(),
        };
        let id = self.store_commit(&root)?;
        self.write_ref(ROOT_BRANCH, &id)?;
        std::fs::write(self.meta.join("HEAD"), ROOT_BRANCH)?;

        tracing::debug!(work_tree = %self.work_tree.display(), root = %id, "Initialized snapshot history");
        Ok(id)
    }

    fn create_branch(&mut self, name: &str, from: &str) -> Result<()> {
        if self.ref_path(name)?.exists() {
            return Err(backend_error(format!("Branch '{}' already exists", name)));
        }
        let id = self.read_ref(from)?;
        self.write_ref(name, &id)
    }

    fn checkout(&mut self, name: &str) -> Result<()> {
        let id = self.read_ref(name)?;
        let commit = self.load_commit(&id)?;
        self.materialize(&commit.tree)?;
        std::fs::write(self.meta.join("HEAD"), name)?;
        Ok(())
    }

    fn commit(&mut self, message: &str) -> Result<String> {
        let branch = self.current_branch()?;
        let parent = self.read_ref(&branch)?;
        let commit = Commit {
            tree: self.snapshot()?,
            parents: vec![parent],
            message: message.to_string(),
            date: self.commit_date.clone(),
        };
        let id = self.store_commit(&commit)?;
        self.write_ref(&branch, &id)?;
        Ok(id)
    }

    fn merge(&mut self, branch: &str, policy: MergePolicy) -> Result<MergeOutcome> {
        let MergePolicy::Ours = policy;
        let current = self.current_branch()?;
        let ours_id = self.read_ref(&current)?;
        let theirs_id = self.read_ref(branch)?;
        let base_id = self.merge_base(&ours_id, &theirs_id)?;

        if base_id.as_deref() == Some(theirs_id.as_str()) {
            tracing::debug!(branch, "Already up to date");
            return Ok(MergeOutcome {
                commit: ours_id,
                fast_forward: false,
                resolved_ours: Vec::new(),
            });
        }
        if base_id.as_deref() == Some(ours_id.as_str()) {
            let theirs = self.load_commit(&theirs_id)?;
            self.materialize(&theirs.tree)?;
            self.write_ref(&current, &theirs_id)?;
            return Ok(MergeOutcome {
                commit: theirs_id,
                fast_forward: true,
                resolved_ours: Vec::new(),
            });
        }

        let base = match &base_id {
            Some(id) => self.load_commit(id)?.tree,
            None => Tree::new(),
        };
        let ours = self.load_commit(&ours_id)?.tree;
        let theirs = self.load_commit(&theirs_id)?.tree;

        let merged = merge_trees(&base, &ours, &theirs);
        if !merged.conflicts.is_empty() {
            return Err(MergeError::MergeConflictUnresolved {
                branch: branch.to_string(),
                paths: merged.conflicts,
            });
        }

        let commit = Commit {
            tree: merged.tree,
            parents: vec![ours_id, theirs_id],
            message: format!("Merge branch '{}'", branch),
            date: self.commit_date.clone(),
        };
        let id = self.store_commit(&commit)?;
        self.materialize(&commit.tree)?;
        self.write_ref(&current, &id)?;

        Ok(MergeOutcome {
            commit: id,
            fast_forward: false,
            resolved_ours: merged.resolved_ours,
        })
    }

    fn head(&self) -> Result<String> {
        self.read_ref(&self.current_branch()?)
    }
}

#[derive(Debug, Default)]
struct TreeMerge {
    tree: Tree,
    resolved_ours: Vec<String>,
    conflicts: Vec<String>,
}

/// Three-way merge of snapshots at path granularity, ours winning.
fn merge_trees(base: &Tree, ours: &Tree, theirs: &Tree) -> TreeMerge {
    let mut result = TreeMerge::default();
    let paths: BTreeSet<&String> = base.keys().chain(ours.keys()).chain(theirs.keys()).collect();

    for path in paths {
        let b = base.get(path);
        let o = ours.get(path);
        let t = theirs.get(path);

        let chosen = if o == t || t == b {
            o
        } else if o == b {
            t
        } else {
            match (o, t) {
                (Some(o), Some(t)) if o.is_dir() == t.is_dir() => {
                    result.resolved_ours.push(path.clone());
                    Some(o)
                }
                // Directory against non-directory, or modify/delete.
                _ => {
                    result.conflicts.push(path.clone());
                    continue;
                }
            }
        };
        if let Some(entry) = chosen {
            result.tree.insert(path.clone(), entry.clone());
        }
    }

    for path in result.tree.keys() {
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !result.tree.get(parent).is_some_and(TreeEntry::is_dir) {
                result.conflicts.push(path.clone());
            }
        }
    }
    result.conflicts.sort();
    result.conflicts.dedup();
    result
}

fn backend_error(message: String) -> MergeError {
    MergeError::HistoryBackendError(message)
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &str, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(target: &str, path: &Path) -> Result<()> {
    Err(backend_error(format!(
        "Cannot restore symlink {} -> {} on this platform",
        path.display(),
        target
    )))
}
