//! OCI layer decoding and application.
//!
//! Layer blobs are detected by magic bytes (gzip, bzip2, xz or plain tar)
//! and applied to a directory with whiteout semantics:
//! `.wh.<name>` deletes `<name>` from lower layers and `.wh..wh..opq`
//! empties its directory.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use imagemerge_core::error::{MergeError, Result};
use tar::{Archive, EntryType};

/// Whiteout file prefix.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Opaque directory marker.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Compression of a layer blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
    None,
}

impl Compression {
    /// Detect compression from the first bytes of a blob.
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if magic.starts_with(b"BZh") {
            Self::Bzip2
        } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Self::Xz
        } else {
            Self::None
        }
    }
}

/// Wrap a blob reader in the decoder its magic bytes call for.
pub fn decompressing_reader(
    reader: Box<dyn Read + Send>,
) -> std::io::Result<(Compression, Box<dyn Read + Send>)> {
    let mut buffered = BufReader::new(reader);
    let compression = Compression::detect(buffered.fill_buf()?);
    let decoded: Box<dyn Read + Send> = match compression {
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(buffered)),
        Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(buffered)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(buffered)),
        Compression::None => Box::new(buffered),
    };
    Ok((compression, decoded))
}

/// Counters from applying one layer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LayerStats {
    /// Entries written to the tree
    pub applied: usize,
    /// Whiteouts processed (including opaque markers)
    pub whiteouts: usize,
    /// Device, FIFO and reserved-path entries skipped
    pub skipped: usize,
}

/// Apply an uncompressed layer tar to `root`.
///
/// All whiteouts of the layer are processed before its other entries, so a
/// whiteout only ever hides content from lower layers.
pub fn apply_layer(tar_path: &Path, root: &Path) -> Result<LayerStats> {
    apply_layer_protected(tar_path, root, &[])
}

/// [`apply_layer`], leaving the top-level entries named in `protected`
/// untouched. Layer entries under a protected name are skipped.
pub fn apply_layer_protected(
    tar_path: &Path,
    root: &Path,
    protected: &[&str],
) -> Result<LayerStats> {
    let is_protected = |rel: &Path| {
        rel.components().next().is_some_and(|first| {
            protected
                .iter()
                .any(|name| first.as_os_str() == std::ffi::OsStr::new(name))
        })
    };

    // Directories without owner rwx are opened up while the layer is
    // applied and get their recorded mode back afterwards.
    let mut modes = DirModes::default();
    modes.unlock_tree(root, root, &is_protected)?;
    let applied = apply_entries(tar_path, root, protected, &is_protected, &mut modes);
    let restored = modes.restore();
    let stats = applied?;
    restored?;

    tracing::debug!(
        layer = %tar_path.display(),
        applied = stats.applied,
        whiteouts = stats.whiteouts,
        skipped = stats.skipped,
        "Applied layer"
    );

    Ok(stats)
}

fn apply_entries(
    tar_path: &Path,
    root: &Path,
    protected: &[&str],
    is_protected: &dyn Fn(&Path) -> bool,
    modes: &mut DirModes,
) -> Result<LayerStats> {
    let mut stats = LayerStats::default();

    for_each_entry(tar_path, |_entry, rel| {
        let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };
        if !name.starts_with(WHITEOUT_PREFIX) {
            return Ok(());
        }
        let parent_rel = rel.parent().unwrap_or(Path::new(""));
        let parent = root.join(parent_rel);
        if name == WHITEOUT_OPAQUE {
            let keep: &[&str] = if parent_rel.as_os_str().is_empty() {
                protected
            } else {
                &[]
            };
            clear_dir(&parent, keep)?;
        } else if is_protected(&parent_rel.join(&name[WHITEOUT_PREFIX.len()..])) {
            stats.skipped += 1;
            return Ok(());
        } else {
            remove_path(&parent.join(&name[WHITEOUT_PREFIX.len()..]))?;
        }
        stats.whiteouts += 1;
        Ok(())
    })?;

    for_each_entry(tar_path, |entry, rel| {
        let is_whiteout = rel
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(WHITEOUT_PREFIX));
        if is_whiteout || rel.as_os_str().is_empty() {
            return Ok(());
        }
        if is_protected(rel) {
            tracing::warn!(path = %rel.display(), "Skipping layer entry under a reserved path");
            stats.skipped += 1;
            return Ok(());
        }

        let entry_type = entry.header().entry_type();
        if matches!(
            entry_type,
            EntryType::Char | EntryType::Block | EntryType::Fifo
        ) {
            tracing::debug!(path = %rel.display(), "Skipping device entry");
            stats.skipped += 1;
            return Ok(());
        }

        let target = root.join(rel);
        if let Ok(existing) = std::fs::symlink_metadata(&target) {
            let replacing_dir_with_dir = existing.is_dir() && entry_type.is_dir();
            if !replacing_dir_with_dir {
                remove_path(&target)?;
            }
        }

        entry.unpack_in(root).map_err(|e| {
            MergeError::Other(format!("Failed to unpack {}: {}", rel.display(), e))
        })?;

        if entry_type.is_dir() {
            let mode = entry.header().mode().map_err(|e| {
                MergeError::Other(format!("Invalid mode for {}: {}", rel.display(), e))
            })?;
            modes.unpacked(&target, mode)?;
        }
        stats.applied += 1;
        Ok(())
    })?;

    Ok(stats)
}

/// Modes of directories that lack owner rwx in the finished tree.
#[derive(Default)]
struct DirModes {
    recorded: BTreeMap<PathBuf, u32>,
}

impl DirModes {
    /// Unlock every directory under `dir` that lacks owner rwx, remembering
    /// its mode.
    fn unlock_tree(
        &mut self,
        root: &Path,
        dir: &Path,
        is_protected: &dyn Fn(&Path) -> bool,
    ) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap_or(&path);
            if is_protected(rel) {
                continue;
            }
            let metadata = std::fs::symlink_metadata(&path)?;
            if !metadata.is_dir() {
                continue;
            }
            let mode = dir_mode(&metadata);
            if mode & 0o700 != 0o700 {
                set_dir_mode(&path, mode | 0o700)?;
                self.recorded.insert(path.clone(), mode);
            }
            self.unlock_tree(root, &path, is_protected)?;
        }
        Ok(())
    }

    /// A directory entry was unpacked at `path` with header `mode`.
    fn unpacked(&mut self, path: &Path, mode: u32) -> Result<()> {
        let mode = mode & 0o7777;
        if mode & 0o700 == 0o700 {
            self.recorded.remove(path);
            return Ok(());
        }
        set_dir_mode(path, mode | 0o700)?;
        self.recorded.insert(path.to_path_buf(), mode);
        Ok(())
    }

    /// Put recorded modes back, deepest directories first. The owner keeps
    /// read and search access so the tree stays walkable.
    fn restore(self) -> Result<()> {
        let mut dirs: Vec<(PathBuf, u32)> = self.recorded.into_iter().collect();
        dirs.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (path, mode) in dirs {
            match std::fs::symlink_metadata(&path) {
                Ok(metadata) if metadata.is_dir() => set_dir_mode(&path, mode | 0o500)?,
                _ => {}
            }
        }
        Ok(())
    }
}

fn for_each_entry<F>(tar_path: &Path, mut visit: F) -> Result<()>
where
    F: FnMut(&mut tar::Entry<'_, File>, &Path) -> Result<()>,
{
    let file = File::open(tar_path).map_err(|e| {
        MergeError::Other(format!(
            "Failed to open layer {}: {}",
            tar_path.display(),
            e
        ))
    })?;
    let mut archive = Archive::new(file);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    let entries = archive
        .entries()
        .map_err(|e| MergeError::Other(format!("Failed to read layer entries: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| MergeError::Other(format!("Failed to read layer entry: {}", e)))?;
        let raw = entry
            .path()
            .map_err(|e| MergeError::Other(format!("Invalid entry path: {}", e)))?
            .into_owned();
        let rel = normalize_entry_path(&raw)?;
        visit(&mut entry, &rel)?;
    }
    Ok(())
}

/// Strip leading `/` and `./`, rejecting paths that climb out of the tree.
pub(crate) fn normalize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(MergeError::Other(format!(
                    "Layer entry escapes the tree: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(normalized)
}

fn remove_path(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn clear_dir(dir: &Path, keep: &[&str]) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if keep.iter().any(|name| entry.file_name() == *name) {
            continue;
        }
        remove_path(&entry.path())?;
    }
    Ok(())
}

#[cfg(unix)]
fn dir_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn dir_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o755
}

#[cfg(unix)]
fn set_dir_mode(dir: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_dir: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
