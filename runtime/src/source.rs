//! Image sources: where source images and their layer blobs come from.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imagemerge_core::config::{MergeConfig, SourceKind};
use imagemerge_core::error::{MergeError, Result};
use imagemerge_core::exec::{CommandRunner, CommandSpec};

use crate::oci::archive::unpack_archive;
use crate::oci::docker_archive::layout_from_docker_archive;
use crate::oci::{
    ImagePuller, ImageReference, ImageStore, LayerInfo, OciImage, OciImageConfig, RegistryAuth,
};

/// A resolved source image.
pub trait ImageSource: Send + Sync {
    /// Reference the image was resolved from.
    fn reference(&self) -> &ImageReference;

    /// Layers in build order, bottom first.
    fn layers(&self) -> Vec<LayerInfo>;

    /// Open the raw (possibly compressed) blob of a layer.
    fn open_blob(&self, layer: &LayerInfo) -> Result<Box<dyn Read + Send>>;

    /// Container configuration of the image.
    fn config(&self) -> OciImageConfig;
}

/// Resolves references to image sources.
#[async_trait]
pub trait ImageSourceProvider: Send + Sync {
    async fn resolve(&self, reference: &ImageReference) -> Result<Box<dyn ImageSource>>;
}

/// Build the provider selected by `config`. The docker source keeps its
/// converted layouts under `<work_dir>/sources`.
pub fn source_from_config(
    config: &MergeConfig,
    store: Arc<ImageStore>,
    runner: Arc<dyn CommandRunner>,
    work_dir: &Path,
) -> Arc<dyn ImageSourceProvider> {
    match config.source {
        SourceKind::Store => {
            let mut provider =
                StoreSourceProvider::new(store.clone()).with_fetch_timeout(config.timeouts.fetch());
            if config.pull {
                provider = provider.with_puller(ImagePuller::new(
                    store,
                    RegistryAuth::from_env(),
                    &config.architecture,
                ));
            }
            Arc::new(provider)
        }
        SourceKind::Docker => Arc::new(DockerSourceProvider::new(
            &config.docker_binary,
            runner,
            &work_dir.join("sources"),
            config.timeouts.fetch(),
        )),
    }
}

/// An image backed by an OCI layout on disk.
pub struct LayoutImageSource {
    reference: ImageReference,
    image: OciImage,
}

impl LayoutImageSource {
    pub fn new(reference: ImageReference, image: OciImage) -> Self {
        Self { reference, image }
    }
}

impl ImageSource for LayoutImageSource {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn layers(&self) -> Vec<LayerInfo> {
        self.image.layers().to_vec()
    }

    fn open_blob(&self, layer: &LayerInfo) -> Result<Box<dyn Read + Send>> {
        let path = self.image.blob_path(&layer.digest);
        let file = std::fs::File::open(&path).map_err(|e| MergeError::BlobFetchError {
            image: self.reference.to_string(),
            digest: layer.digest.clone(),
            message: format!("Failed to open {}: {}", path.display(), e),
        })?;
        Ok(Box::new(file))
    }

    fn config(&self) -> OciImageConfig {
        self.image.config().clone()
    }
}

/// Resolves images from the local store, pulling missing ones when allowed.
pub struct StoreSourceProvider {
    store: Arc<ImageStore>,
    puller: Option<ImagePuller>,
    fetch_timeout: Option<Duration>,
}

impl StoreSourceProvider {
    /// Store-only provider.
    pub fn new(store: Arc<ImageStore>) -> Self {
        Self {
            store,
            puller: None,
            fetch_timeout: None,
        }
    }

    /// Pull images missing from the store through `puller`.
    pub fn with_puller(mut self, puller: ImagePuller) -> Self {
        self.puller = Some(puller);
        self
    }

    /// Bound each registry fetch.
    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    async fn fetch(&self, reference: &ImageReference) -> Result<OciImage> {
        if let Some(stored) = self.store.get(&reference.full_reference()).await {
            tracing::debug!(reference = %reference, path = %stored.path.display(), "Resolved from store");
            return OciImage::from_path(&stored.path);
        }

        let Some(puller) = &self.puller else {
            return Err(MergeError::OciImageError(format!(
                "{} is not in the local store and pulling is disabled",
                reference
            )));
        };

        match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, puller.pull(reference))
                .await
                .map_err(|_| {
                    MergeError::TimeoutError(format!("fetching {} exceeded {:?}", reference, limit))
                })?,
            None => puller.pull(reference).await,
        }
    }
}

#[async_trait]
impl ImageSourceProvider for StoreSourceProvider {
    async fn resolve(&self, reference: &ImageReference) -> Result<Box<dyn ImageSource>> {
        let image = self.fetch(reference).await.map_err(|e| match e {
            MergeError::TimeoutError(_) | MergeError::Cancelled(_) => e,
            other => MergeError::BlobFetchError {
                image: reference.to_string(),
                digest: reference
                    .digest
                    .clone()
                    .unwrap_or_else(|| "manifest".to_string()),
                message: other.to_string(),
            },
        })?;
        Ok(Box::new(LayoutImageSource::new(reference.clone(), image)))
    }
}

/// Resolves images from a Docker daemon through `docker save`.
///
/// Each resolve exports the image into its own directory under
/// `scratch_root` and converts it to an OCI layout there. The layout stays
/// on disk for as long as the returned source is read.
pub struct DockerSourceProvider {
    binary: String,
    runner: Arc<dyn CommandRunner>,
    scratch_root: PathBuf,
    timeout: Option<Duration>,
}

impl DockerSourceProvider {
    pub fn new(
        binary: &str,
        runner: Arc<dyn CommandRunner>,
        scratch_root: &Path,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            binary: binary.to_string(),
            runner,
            scratch_root: scratch_root.to_path_buf(),
            timeout,
        }
    }

    async fn export(&self, reference: &ImageReference) -> Result<OciImage> {
        let dir = self
            .scratch_root
            .join(format!("docker-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        let archive = dir.join("image.tar");

        let spec = CommandSpec::new(&self.binary)
            .arg("save")
            .arg("-o")
            .arg(archive.to_string_lossy())
            .arg(reference.familiar())
            .timeout(self.timeout);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(MergeError::CommandFailed {
                command: spec.display(),
                code: output.exit_code,
                stderr: output.stderr_str().trim().to_string(),
            });
        }

        let image = tokio::task::spawn_blocking(move || {
            let unpacked = dir.join("archive");
            unpack_archive(&archive, &unpacked)?;
            std::fs::remove_file(&archive)?;
            let image = layout_from_docker_archive(&unpacked, &dir.join("layout"))?;
            std::fs::remove_dir_all(&unpacked)?;
            Ok::<_, MergeError>(image)
        })
        .await
        .map_err(|e| MergeError::Other(format!("Export task failed: {}", e)))??;

        tracing::info!(
            reference = %reference,
            manifest = %image.manifest_digest(),
            layers = image.layers().len(),
            "Exported image from docker"
        );
        Ok(image)
    }
}

#[async_trait]
impl ImageSourceProvider for DockerSourceProvider {
    async fn resolve(&self, reference: &ImageReference) -> Result<Box<dyn ImageSource>> {
        let image = self.export(reference).await.map_err(|e| match e {
            MergeError::TimeoutError(_) | MergeError::Cancelled(_) => e,
            other => MergeError::BlobFetchError {
                image: reference.to_string(),
                digest: reference
                    .digest
                    .clone()
                    .unwrap_or_else(|| "manifest".to_string()),
                message: other.to_string(),
            },
        })?;
        Ok(Box::new(LayoutImageSource::new(reference.clone(), image)))
    }
}
