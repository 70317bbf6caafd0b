//! `docker save` archives.
//!
//! Both the legacy format (`manifest.json`, `<id>.json`, `<id>/layer.tar`)
//! and the OCI flavoured one written by newer daemons carry a top-level
//! `manifest.json`. That file is the only part read here, so both convert
//! the same way.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use imagemerge_core::error::{MergeError, Result};
use serde::Deserialize;

use super::layers::Compression;
use super::layout::{LayoutWriter, MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER, MEDIA_TYPE_LAYER_GZIP};
use super::OciImage;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

/// Rewrite the unpacked `docker save` output in `archive_dir` as an OCI
/// layout in `layout_dir`. Layer files are moved, not copied.
pub fn layout_from_docker_archive(archive_dir: &Path, layout_dir: &Path) -> Result<OciImage> {
    let manifest_path = archive_dir.join("manifest.json");
    let data = std::fs::read(&manifest_path).map_err(|e| {
        archive_error(format!("Failed to read {}: {}", manifest_path.display(), e))
    })?;
    let entries: Vec<ManifestEntry> = serde_json::from_slice(&data).map_err(|e| {
        archive_error(format!("Failed to parse {}: {}", manifest_path.display(), e))
    })?;
    let Some(entry) = entries.into_iter().next() else {
        return Err(archive_error(format!(
            "{} lists no images",
            manifest_path.display()
        )));
    };

    let writer = LayoutWriter::create(layout_dir)?;
    let config = std::fs::read(member(archive_dir, &entry.config)?)?;
    let config_ref = writer.write_blob(&config, MEDIA_TYPE_CONFIG)?;

    let mut layers = Vec::with_capacity(entry.layers.len());
    for layer in &entry.layers {
        let path = member(archive_dir, layer)?;
        let media_type = match layer_compression(&path)? {
            Compression::Gzip => MEDIA_TYPE_LAYER_GZIP,
            _ => MEDIA_TYPE_LAYER,
        };
        layers.push(writer.add_blob_file(&path, media_type)?);
    }

    let tag = entry.repo_tags.as_ref().and_then(|tags| tags.first()).cloned();
    writer.finish_with_config(config_ref, &layers, tag.as_deref())?;
    tracing::debug!(
        archive = %archive_dir.display(),
        layers = layers.len(),
        tag = tag.as_deref().unwrap_or("-"),
        "Converted docker archive"
    );
    OciImage::from_path(layout_dir)
}

/// Resolve a `manifest.json` member path, refusing anything that leaves
/// the archive.
fn member(archive_dir: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || name.is_empty() {
        return Err(archive_error(format!("Invalid archive member path: {}", name)));
    }
    let path = archive_dir.join(relative);
    if !path.is_file() {
        return Err(archive_error(format!("Archive member {} is missing", name)));
    }
    Ok(path)
}

fn layer_compression(path: &Path) -> Result<Compression> {
    let mut magic = [0u8; 6];
    let mut file = std::fs::File::open(path)?;
    let mut filled = 0;
    while filled < magic.len() {
        match file.read(&mut magic[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(Compression::detect(&magic[..filled]))
}

fn archive_error(message: String) -> MergeError {
    MergeError::ArchiveError(message)
}
