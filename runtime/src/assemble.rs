//! Packs a merged tree into a single-layer image over an empty base.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::GzBuilder;
use imagemerge_core::config::MergeConfig;
use imagemerge_core::error::{MergeError, Result};

use crate::extract::ExtractedImage;
use crate::oci::archive::pack_dir;
use crate::oci::digest::{prefixed, HashingWriter};
use crate::oci::layout::MEDIA_TYPE_LAYER_GZIP;
use crate::oci::{BlobRef, ImageReference, LayoutWriter, OciImageConfig};

/// Timestamp recorded in the merged config and its history entry.
const EPOCH: &str = "1970-01-01T00:00:00Z";

/// File name of the packed artifact inside the build directory.
pub const ARTIFACT_NAME: &str = "output.tar";

/// The assembled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedImage {
    pub reference: ImageReference,
    /// Packed OCI layout, loadable with `docker load`
    pub artifact: PathBuf,
    /// Unpacked OCI layout the artifact was made from
    pub layout_dir: PathBuf,
    pub manifest_digest: String,
    pub config_digest: String,
    /// The single filesystem layer
    pub layer: BlobRef,
    /// Digest of the uncompressed layer tar
    pub diff_id: String,
    pub architecture: String,
    pub os: String,
    pub config: OciImageConfig,
}

/// Builds the merged image from the merged working tree.
#[derive(Debug, Clone)]
pub struct ImageAssembler {
    architecture: String,
    os: String,
}

impl ImageAssembler {
    pub fn new(architecture: impl Into<String>, os: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
        }
    }

    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(&config.architecture, &config.os)
    }

    /// Pack `tree` (minus top-level `exclude` entries) as one layer and
    /// write the image to `<build_dir>/output.tar`.
    ///
    /// `sources` supply the container config, earliest source first.
    pub fn assemble(
        &self,
        tree: &Path,
        exclude: &[&str],
        sources: &[ExtractedImage],
        destination: &ImageReference,
        build_dir: &Path,
    ) -> Result<MergedImage> {
        let layout_dir = build_dir.join("image");
        let writer = LayoutWriter::create(&layout_dir)?;

        let layer_path = build_dir.join("layer.tar.gz");
        let diff_id = write_layer(tree, exclude, &layer_path)?;
        let layer = writer.add_blob_file(&layer_path, MEDIA_TYPE_LAYER_GZIP)?;

        let configs: Vec<OciImageConfig> = sources.iter().map(|s| s.config.clone()).collect();
        let container_config = merge_container_configs(&configs);
        let created_by = format!(
            "imagemerge {}",
            sources
                .iter()
                .map(|s| s.reference.familiar())
                .collect::<Vec<_>>()
                .join(" ")
        );
        let config = serde_json::json!({
            "architecture": self.architecture,
            "os": self.os,
            "created": EPOCH,
            "config": container_config.to_json(),
            "rootfs": {
                "type": "layers",
                "diff_ids": [diff_id],
            },
            "history": [{
                "created": EPOCH,
                "created_by": created_by,
            }],
        });

        let ref_name = destination.familiar();
        let written = writer.finish(&config, std::slice::from_ref(&layer), Some(ref_name.as_str()))?;

        let artifact = build_dir.join(ARTIFACT_NAME);
        let file = File::create(&artifact).map_err(|e| {
            MergeError::ArchiveError(format!("Failed to create {}: {}", artifact.display(), e))
        })?;
        let mut out = pack_dir(&layout_dir, &[], BufWriter::new(file))?;
        out.flush()
            .map_err(|e| MergeError::ArchiveError(format!("Failed to write artifact: {}", e)))?;

        tracing::info!(
            reference = %ref_name,
            manifest = %written.manifest.digest,
            layer = %layer.digest,
            size = layer.size,
            architecture = %self.architecture,
            "Assembled merged image"
        );

        Ok(MergedImage {
            reference: destination.clone(),
            artifact,
            layout_dir,
            manifest_digest: written.manifest.digest,
            config_digest: written.config.digest,
            layer,
            diff_id,
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            config: container_config,
        })
    }
}

/// Write the gzip layer and return its diff_id.
fn write_layer(tree: &Path, exclude: &[&str], layer_path: &Path) -> Result<String> {
    let file = File::create(layer_path).map_err(|e| {
        MergeError::ArchiveError(format!("Failed to create {}: {}", layer_path.display(), e))
    })?;
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(BufWriter::new(file), flate2::Compression::default());

    let (encoder, diff_hex, _) = pack_dir(tree, exclude, HashingWriter::new(encoder))?.finish();
    let mut out = encoder
        .finish()
        .map_err(|e| MergeError::ArchiveError(format!("Failed to finish gzip stream: {}", e)))?;
    out.flush()
        .map_err(|e| MergeError::ArchiveError(format!("Failed to write layer: {}", e)))?;
    Ok(prefixed(&diff_hex))
}

/// Combine container configs with the filesystem merge's precedence.
///
/// `Env` and `Labels` merge per key with the earliest source winning,
/// `ExposedPorts` are unioned, and `Entrypoint`, `Cmd`, `WorkingDir` and
/// `User` come from the first source that sets them.
pub fn merge_container_configs(configs: &[OciImageConfig]) -> OciImageConfig {
    let mut merged = OciImageConfig::default();
    let mut ports = BTreeSet::new();

    for config in configs {
        for (key, value) in &config.env {
            if merged.env_var(key).is_none() {
                merged.env.push((key.clone(), value.clone()));
            }
        }
        for (key, value) in &config.labels {
            merged
                .labels
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        ports.extend(config.exposed_ports.iter().cloned());

        if merged.entrypoint.is_none() {
            merged.entrypoint = config.entrypoint.clone();
        }
        if merged.cmd.is_none() {
            merged.cmd = config.cmd.clone();
        }
        if merged.working_dir.is_none() {
            merged.working_dir = config.working_dir.clone();
        }
        if merged.user.is_none() {
            merged.user = config.user.clone();
        }
    }

    merged.exposed_ports = ports.into_iter().collect();
    merged
}
