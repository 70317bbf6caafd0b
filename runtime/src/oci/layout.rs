//! OCI image layout writer.
//!
//! Produces `oci-layout`, `index.json` and `blobs/sha256/*`, plus a
//! Docker-compatible `manifest.json` so the same directory can be fed to
//! `docker load` once packed.

use std::path::{Path, PathBuf};

use imagemerge_core::error::{MergeError, Result};

use super::digest::{hex_part, prefixed, sha256_bytes, sha256_file};

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Annotation carrying the image reference in `index.json`.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// A blob stored in the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    /// `sha256:<hex>`
    pub digest: String,
    pub size: u64,
    pub media_type: String,
}

/// Digests of a written image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenImage {
    pub manifest: BlobRef,
    pub config: BlobRef,
    pub layers: Vec<BlobRef>,
}

/// Writes a single-image OCI layout into a directory.
pub struct LayoutWriter {
    root: PathBuf,
}

impl LayoutWriter {
    /// Create the layout skeleton under `root`.
    pub fn create(root: &Path) -> Result<Self> {
        let blobs_dir = root.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).map_err(|e| {
            MergeError::ArchiveError(format!(
                "Failed to create blobs dir {}: {}",
                blobs_dir.display(),
                e
            ))
        })?;
        std::fs::write(root.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).map_err(
            |e| MergeError::ArchiveError(format!("Failed to write oci-layout: {}", e)),
        )?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Path of a blob by digest.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join("blobs").join("sha256").join(hex_part(digest))
    }

    /// Store bytes as a blob.
    pub fn write_blob(&self, data: &[u8], media_type: &str) -> Result<BlobRef> {
        let digest = prefixed(&sha256_bytes(data));
        std::fs::write(self.blob_path(&digest), data).map_err(|e| {
            MergeError::ArchiveError(format!("Failed to write blob {}: {}", digest, e))
        })?;
        Ok(BlobRef {
            digest,
            size: data.len() as u64,
            media_type: media_type.to_string(),
        })
    }

    /// Move an existing file into the blob store.
    pub fn add_blob_file(&self, path: &Path, media_type: &str) -> Result<BlobRef> {
        let digest = prefixed(&sha256_file(path)?);
        let size = std::fs::metadata(path)?.len();
        let target = self.blob_path(&digest);
        if std::fs::rename(path, &target).is_err() {
            std::fs::copy(path, &target).map_err(|e| {
                MergeError::ArchiveError(format!("Failed to copy blob {}: {}", digest, e))
            })?;
        }
        Ok(BlobRef {
            digest,
            size,
            media_type: media_type.to_string(),
        })
    }

    /// Write config, manifest, `index.json` and `manifest.json`.
    ///
    /// `ref_name` becomes the index annotation and the Docker repo tag.
    pub fn finish(
        self,
        config: &serde_json::Value,
        layers: &[BlobRef],
        ref_name: Option<&str>,
    ) -> Result<WrittenImage> {
        let config_ref = self.write_blob(&serde_json::to_vec(config)?, MEDIA_TYPE_CONFIG)?;
        self.finish_with_config(config_ref, layers, ref_name)
    }

    /// [`finish`](Self::finish) for a config blob that is already stored.
    pub fn finish_with_config(
        self,
        config_ref: BlobRef,
        layers: &[BlobRef],
        ref_name: Option<&str>,
    ) -> Result<WrittenImage> {
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST,
            "config": descriptor(&config_ref),
            "layers": layers.iter().map(descriptor).collect::<Vec<_>>(),
        });
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_ref = self.write_blob(&manifest_bytes, MEDIA_TYPE_MANIFEST)?;

        let mut manifest_entry = descriptor(&manifest_ref);
        if let Some(name) = ref_name {
            manifest_entry["annotations"] = serde_json::json!({ ANNOTATION_REF_NAME: name });
        }
        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_INDEX,
            "manifests": [manifest_entry],
        });
        std::fs::write(self.root.join("index.json"), serde_json::to_vec(&index)?).map_err(|e| {
            MergeError::ArchiveError(format!("Failed to write index.json: {}", e))
        })?;

        let blob_name = |digest: &str| format!("blobs/sha256/{}", hex_part(digest));
        let docker_manifest = serde_json::json!([{
            "Config": blob_name(&config_ref.digest),
            "RepoTags": ref_name.into_iter().collect::<Vec<_>>(),
            "Layers": layers.iter().map(|l| blob_name(&l.digest)).collect::<Vec<_>>(),
        }]);
        std::fs::write(
            self.root.join("manifest.json"),
            serde_json::to_vec(&docker_manifest)?,
        )
        .map_err(|e| MergeError::ArchiveError(format!("Failed to write manifest.json: {}", e)))?;

        Ok(WrittenImage {
            manifest: manifest_ref,
            config: config_ref,
            layers: layers.to_vec(),
        })
    }
}

fn descriptor(blob: &BlobRef) -> serde_json::Value {
    serde_json::json!({
        "mediaType": blob.media_type,
        "digest": blob.digest,
        "size": blob.size,
    })
}
