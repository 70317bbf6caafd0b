//! Local image store.
//!
//! Each image is an OCI layout under `sha256/<manifest hex>/`. References
//! map to layouts through `index.json`; several references may share one
//! layout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use imagemerge_core::error::{MergeError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;

/// A reference recorded in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    /// Fully qualified reference, e.g. `docker.io/library/merged:latest`
    pub reference: String,
    /// Manifest digest of the layout
    pub digest: String,
    pub size_bytes: u64,
    pub stored_at: DateTime<Utc>,
    /// Layout directory
    pub path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    images: Vec<StoredImage>,
}

pub struct ImageStore {
    root: PathBuf,
    entries: RwLock<BTreeMap<String, StoredImage>>,
}

impl ImageStore {
    /// Open the store at `root`, creating it when missing.
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            store_error(format!("Failed to create image store {}: {}", root.display(), e))
        })?;
        let entries = read_index(&root.join(INDEX_FILE))?;
        tracing::debug!(root = %root.display(), images = entries.len(), "Opened image store");
        Ok(Self {
            root: root.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        self.entries.read().await.get(reference).cloned()
    }

    /// Record `reference` as pointing at the layout in `layout_dir`.
    ///
    /// The layout is copied in unless `digest` is already stored. A layout
    /// left without references after a re-tag is deleted.
    pub async fn put(&self, reference: &str, digest: &str, layout_dir: &Path) -> Result<StoredImage> {
        self.ingest(digest, layout_dir)?;
        self.record(reference, digest).await
    }

    /// Copy `layout_dir` into the store as `digest` without recording any
    /// reference. Returns the layout path and whether it was newly created.
    ///
    /// Blocking; callers on the runtime run it through `spawn_blocking`.
    pub fn ingest(&self, digest: &str, layout_dir: &Path) -> Result<(PathBuf, bool)> {
        let target = self.layout_path(digest);
        if target.is_dir() {
            return Ok((target, false));
        }
        self.copy_in(layout_dir, &target)?;
        Ok((target, true))
    }

    /// Point `reference` at the already ingested layout `digest`.
    pub async fn record(&self, reference: &str, digest: &str) -> Result<StoredImage> {
        let target = self.layout_path(digest);
        if !target.is_dir() {
            return Err(store_error(format!("Layout {} is not in the image store", digest)));
        }

        let image = StoredImage {
            reference: reference.to_string(),
            digest: digest.to_string(),
            size_bytes: tree_size(&target),
            stored_at: Utc::now(),
            path: target,
        };

        let orphan = {
            let mut entries = self.entries.write().await;
            match entries.insert(reference.to_string(), image.clone()) {
                Some(old) if !entries.values().any(|e| e.digest == old.digest) => Some(old),
                _ => None,
            }
        };
        if let Some(old) = orphan {
            tracing::debug!(reference, digest = %old.digest, "Removing unreferenced layout");
            if old.path.exists() {
                std::fs::remove_dir_all(&old.path)?;
            }
        }

        self.write_index().await?;
        tracing::info!(reference, digest, "Stored image");
        Ok(image)
    }

    /// Delete an ingested layout that no reference points at.
    pub async fn discard(&self, digest: &str) -> Result<()> {
        if self.entries.read().await.values().any(|e| e.digest == digest) {
            return Ok(());
        }
        let target = self.layout_path(digest);
        if target.exists() {
            tracing::debug!(digest, "Discarding unreferenced layout");
            std::fs::remove_dir_all(&target)?;
        }
        Ok(())
    }

    /// Stored images in reference order.
    pub async fn list(&self) -> Vec<StoredImage> {
        self.entries.read().await.values().cloned().collect()
    }

    /// A fresh path under the store's scratch area. Nothing is created.
    pub fn scratch_path(&self, label: &str) -> PathBuf {
        self.root
            .join("tmp")
            .join(format!("{}-{}", label, uuid::Uuid::new_v4()))
    }

    fn layout_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.root.join("sha256").join(hex)
    }

    /// Copy into a staging directory, then rename into place.
    fn copy_in(&self, layout_dir: &Path, target: &Path) -> Result<()> {
        let staging = self.scratch_path("ingest");
        let copied = copy_tree(layout_dir, &staging).and_then(|_| {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&staging, target)
        });
        if copied.is_err() && staging.exists() {
            let _ = std::fs::remove_dir_all(&staging);
        }
        copied.map_err(|e| {
            store_error(format!(
                "Failed to copy {} into image store: {}",
                layout_dir.display(),
                e
            ))
        })
    }

    async fn write_index(&self) -> Result<()> {
        let file = IndexFile {
            version: INDEX_VERSION,
            images: self.list().await,
        };
        let path = self.root.join(INDEX_FILE);
        let data = serde_json::to_vec_pretty(&file)?;
        tokio::fs::write(&path, data).await.map_err(|e| {
            store_error(format!("Failed to write store index {}: {}", path.display(), e))
        })
    }
}

fn store_error(message: String) -> MergeError {
    MergeError::OciImageError(message)
}

/// Entries whose layout directory has disappeared are dropped.
fn read_index(path: &Path) -> Result<BTreeMap<String, StoredImage>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            return Err(store_error(format!(
                "Failed to read store index {}: {}",
                path.display(),
                e
            )))
        }
    };
    let file: IndexFile = serde_json::from_slice(&data)
        .map_err(|e| store_error(format!("Corrupt store index {}: {}", path.display(), e)))?;
    if file.version != INDEX_VERSION {
        return Err(store_error(format!(
            "Unsupported store index version {} in {}",
            file.version,
            path.display()
        )));
    }

    Ok(file
        .images
        .into_iter()
        .filter(|image| image.path.is_dir())
        .map(|image| (image.reference.clone(), image))
        .collect())
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&out)?;
        } else {
            std::fs::copy(entry.path(), &out)?;
        }
    }
    Ok(())
}

fn tree_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
