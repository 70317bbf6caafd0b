//! Deterministic tar packing.
//!
//! Entries are emitted in sorted path order with zeroed timestamps and
//! ownership, so the same tree always produces the same bytes.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use imagemerge_core::error::{MergeError, Result};
use tar::{EntryType, Header};
use walkdir::WalkDir;

/// Pack the contents of `root` into a tar stream written to `writer`.
///
/// Top-level entries named in `exclude` are skipped along with everything
/// beneath them. Sockets and device files are not packed.
pub fn pack_dir<W: Write>(root: &Path, exclude: &[&str], writer: W) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.mode(tar::HeaderMode::Deterministic);

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() != 1
                || !exclude
                    .iter()
                    .any(|name| entry.file_name().to_str() == Some(name))
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            MergeError::ArchiveError(format!("Failed to walk {}: {}", root.display(), e))
        })?;
        let rel = entry.path().strip_prefix(root).map_err(|e| {
            MergeError::ArchiveError(format!(
                "Failed to compute relative path for {}: {}",
                entry.path().display(),
                e
            ))
        })?;
        let metadata = entry.path().symlink_metadata().map_err(|e| {
            MergeError::ArchiveError(format!(
                "Failed to read metadata for {}: {}",
                entry.path().display(),
                e
            ))
        })?;

        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(file_mode(&metadata));

        let file_type = metadata.file_type();
        let appended = if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, rel, std::io::empty())
        } else if file_type.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(metadata.len());
            let file = open_for_read(entry.path())?;
            builder.append_data(&mut header, rel, file)
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, rel, &target)
        } else {
            tracing::debug!(path = %rel.display(), "Skipping special file");
            continue;
        };

        appended.map_err(|e| {
            MergeError::ArchiveError(format!("Failed to add {} to archive: {}", rel.display(), e))
        })?;
    }

    builder
        .into_inner()
        .map_err(|e| MergeError::ArchiveError(format!("Failed to finalize archive: {}", e)))
}

/// Unpack a plain tar archive into `dest`.
pub fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| {
        MergeError::ArchiveError(format!(
            "Failed to open archive {}: {}",
            archive_path.display(),
            e
        ))
    })?;
    std::fs::create_dir_all(dest)?;
    tar::Archive::new(file).unpack(dest).map_err(|e| {
        MergeError::ArchiveError(format!(
            "Failed to unpack {} into {}: {}",
            archive_path.display(),
            dest.display(),
            e
        ))
    })
}

/// Open a file for reading even when its mode denies the owner read access.
/// The original mode is put back as soon as the file is open.
#[cfg(unix)]
pub fn open_for_read(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::PermissionsExt;
    match File::open(path) {
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            let original = std::fs::symlink_metadata(path)?.permissions();
            if original.mode() & 0o400 != 0 {
                return Err(e);
            }
            std::fs::set_permissions(
                path,
                std::fs::Permissions::from_mode(original.mode() | 0o400),
            )?;
            let opened = File::open(path);
            std::fs::set_permissions(path, original)?;
            opened
        }
        other => other,
    }
}

#[cfg(not(unix))]
pub fn open_for_read(path: &Path) -> std::io::Result<File> {
    File::open(path)
}

/// Give the owner full access to every directory under `path`.
///
/// Read-only directories restored from image layers would otherwise block
/// removal of their contents.
#[cfg(unix)]
pub fn make_tree_writable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in WalkDir::new(path).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if entry.file_type().is_dir() {
            let mut perms = entry.metadata().map_err(std::io::Error::from)?.permissions();
            if perms.mode() & 0o700 != 0o700 {
                perms.set_mode(perms.mode() | 0o700);
                std::fs::set_permissions(entry.path(), perms)?;
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn make_tree_writable(_path: &Path) -> Result<()> {
    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("b/nested")).unwrap();
        fs::write(root.join("b/nested/file"), "nested").unwrap();
        fs::write(root.join("a"), "first").unwrap();
        fs::create_dir_all(root.join(".history/objects")).unwrap();
        fs::write(root.join(".history/HEAD"), "merged").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("a", root.join("link")).unwrap();
    }

    fn entry_names(data: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_pack_dir_sorted_and_excluded() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());

        let data = pack_dir(tmp.path(), &[".history"], Vec::new()).unwrap();
        let names = entry_names(&data);

        assert!(names.iter().all(|n| !n.starts_with(".history")));
        let a = names.iter().position(|n| n == "a").unwrap();
        let nested = names.iter().position(|n| n.starts_with("b/nested/file")).unwrap();
        assert!(a < nested);
    }

    #[test]
    fn test_pack_dir_zeroes_metadata() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());

        let data = pack_dir(tmp.path(), &[], Vec::new()).unwrap();
        let mut archive = tar::Archive::new(&data[..]);
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.mtime().unwrap(), 0);
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
        }
    }

    #[test]
    fn test_pack_dir_is_reproducible() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        populate(first.path());
        populate(second.path());

        let a = pack_dir(first.path(), &[".history"], Vec::new()).unwrap();
        let b = pack_dir(second.path(), &[".history"], Vec::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unpack_archive() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir(&src).unwrap();
        populate(&src);

        let tar_path = tmp.path().join("out.tar");
        pack_dir(&src, &[], File::create(&tar_path).unwrap()).unwrap();

        let dest = tmp.path().join("dest");
        unpack_archive(&tar_path, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("b/nested/file")).unwrap(), "nested");
        assert_eq!(fs::read_to_string(dest.join(".history/HEAD")).unwrap(), "merged");
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_files_are_packed_with_their_mode() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("secret"), "hidden").unwrap();
        fs::set_permissions(root.join("secret"), fs::Permissions::from_mode(0o000)).unwrap();

        let data = pack_dir(&root, &[], Vec::new()).unwrap();

        let mut archive = tar::Archive::new(&data[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().mode().unwrap() & 0o777, 0o000);
        let mut content = String::new();
        std::io::Read::read_to_string(&mut entry, &mut content).unwrap();
        assert_eq!(content, "hidden");
        let mode = fs::metadata(root.join("secret")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o000);
    }
}
