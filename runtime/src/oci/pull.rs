//! Cache-first image pulls.
//!
//! Combines the registry puller and image store: images are looked up in the
//! local store first and only pulled from the registry when missing.

use std::sync::Arc;

use imagemerge_core::error::Result;

use super::image::OciImage;
use super::reference::ImageReference;
use super::registry::{RegistryAuth, RegistryPuller};
use super::store::ImageStore;

/// High-level image puller with caching.
pub struct ImagePuller {
    store: Arc<ImageStore>,
    puller: RegistryPuller,
}

impl ImagePuller {
    /// Create a puller that resolves multi-arch images to `architecture`.
    pub fn new(store: Arc<ImageStore>, auth: RegistryAuth, architecture: &str) -> Self {
        Self {
            store,
            puller: RegistryPuller::new(auth, architecture),
        }
    }

    /// Pull an image, using the local store if it already holds it.
    pub async fn pull(&self, reference: &ImageReference) -> Result<OciImage> {
        let full_ref = reference.full_reference();

        if let Some(stored) = self.store.get(&full_ref).await {
            tracing::info!(
                reference = %full_ref,
                digest = %stored.digest,
                "Using cached image"
            );
            return OciImage::from_path(&stored.path);
        }

        let tmp_dir = self.store.scratch_path("pull");

        let result = self.pull_into(reference, &tmp_dir).await;
        let _ = std::fs::remove_dir_all(&tmp_dir);
        result
    }

    async fn pull_into(
        &self,
        reference: &ImageReference,
        tmp_dir: &std::path::Path,
    ) -> Result<OciImage> {
        let digest = self.puller.pull(reference, tmp_dir).await?;
        let stored = self
            .store
            .put(&reference.full_reference(), &digest, tmp_dir)
            .await?;
        OciImage::from_path(&stored.path)
    }
}
