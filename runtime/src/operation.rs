//! One end-to-end merge: extract, replay, merge, assemble, load.
//!
//! Stages run strictly in order. A failing stage aborts the operation and
//! leaves the work directory in place for inspection; [`MergeOperation::cleanup`]
//! or [`remove_work_dir`] release it explicitly.
//!
//! ```text
//!  <work_root>/imagemerge-<uuid>/
//!  ├── blobs/sha256/<hex>.tar   (uncompressed source layers)
//!  ├── sources/                 (layouts exported by the docker source)
//!  ├── repo/                    (working repository)
//!  └── build/
//!      ├── image/               (OCI layout of the merged image)
//!      └── output.tar           (artifact handed to the loader)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use imagemerge_core::cancel::CancelFlag;
use imagemerge_core::config::MergeConfig;
use imagemerge_core::error::{MergeError, PipelineStage, Result, ResultExt};
use imagemerge_core::exec::{CommandRunner, SystemRunner};
use tokio::runtime::Handle;

use crate::assemble::{ImageAssembler, MergedImage};
use crate::extract::{ExtractedImage, LayerExtractor};
use crate::history::{open_backend, HistoryBuilder};
use crate::loader::{loader_from_config, ImageLoader, LoadedImage};
use crate::merge::{MergeEngine, MergeResult};
use crate::oci::archive::make_tree_writable;
use crate::oci::{ImageReference, ImageStore};
use crate::references::ReferenceSet;
use crate::source::{source_from_config, ImageSourceProvider};

/// Prefix of every operation work directory.
pub const WORK_DIR_PREFIX: &str = "imagemerge-";

/// Everything a successful merge produced.
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub image: MergedImage,
    pub loaded: LoadedImage,
    pub merge: MergeResult,
    pub work_dir: PathBuf,
}

/// A single merge of a [`ReferenceSet`] into one image.
pub struct MergeOperation {
    references: ReferenceSet,
    config: MergeConfig,
    work_dir: PathBuf,
    artifact: Option<PathBuf>,
    cancel: CancelFlag,
    store: Arc<ImageStore>,
    provider: Option<Arc<dyn ImageSourceProvider>>,
    loader: Option<Arc<dyn ImageLoader>>,
    runner: Arc<dyn CommandRunner>,
}

impl MergeOperation {
    /// Prepare an operation with the collaborators `config` selects.
    ///
    /// Nothing is written to the work root until [`run`](Self::run).
    pub fn new(references: ReferenceSet, config: MergeConfig) -> Result<Self> {
        let store = Arc::new(ImageStore::new(&config.store_dir)?);
        let work_dir = config
            .work_root
            .join(format!("{}{}", WORK_DIR_PREFIX, uuid::Uuid::new_v4()));

        Ok(Self {
            references,
            config,
            work_dir,
            artifact: None,
            cancel: CancelFlag::new(),
            store,
            provider: None,
            loader: None,
            runner: Arc::new(SystemRunner::new()),
        })
    }

    /// Resolve source images through `provider` instead of the one
    /// `config.source` selects.
    pub fn with_provider(mut self, provider: Arc<dyn ImageSourceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Load the merged image through `loader`.
    pub fn with_loader(mut self, loader: Arc<dyn ImageLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Run external commands (git, docker) through `runner`.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Packed image, once the assemble stage has finished.
    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run every stage in order.
    pub async fn run(&mut self) -> Result<MergeReport> {
        let cancel = self.cancel.clone();
        let blobs_dir = self.work_dir.join("blobs");
        let repo_dir = self.work_dir.join("repo");
        let build_dir = self.work_dir.join("build");

        cancel.check("extraction").stage(PipelineStage::Extract)?;
        for dir in [&blobs_dir, &repo_dir, &build_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| {
                    MergeError::BlobWriteError {
                        digest: String::new(),
                        message: format!("Failed to create {}: {}", dir.display(), e),
                    }
                })
                .stage(PipelineStage::Extract)?;
        }
        tracing::info!(
            destination = %self.references.destination(),
            sources = self.references.sources().len(),
            work_dir = %self.work_dir.display(),
            source = %self.config.source,
            backend = %self.config.backend,
            "Starting merge"
        );

        let provider = self.provider.clone().unwrap_or_else(|| {
            source_from_config(&self.config, self.store.clone(), self.runner.clone(), &self.work_dir)
        });
        let extractor = LayerExtractor::new(provider, &self.work_dir);
        let mut images = Vec::with_capacity(self.references.sources().len());
        for (index, reference) in self.references.sources().iter().enumerate() {
            cancel
                .check(&format!("extracting {}", reference))
                .stage(PipelineStage::Extract)?;
            let image = extractor
                .extract(reference, index)
                .await
                .stage(PipelineStage::Extract)?;
            images.push(image);
        }

        let job = BuildJob {
            config: self.config.clone(),
            repo_dir,
            build_dir,
            destination: self.references.destination().clone(),
            runner: self.runner.clone(),
            cancel: cancel.clone(),
        };
        let handle = Handle::current();
        let (merge, image) = tokio::task::spawn_blocking(move || job.run(images, handle))
            .await
            .map_err(|e| MergeError::Other(format!("Merge worker failed: {}", e)))??;
        self.artifact = Some(image.artifact.clone());

        cancel.check("load").stage(PipelineStage::Load)?;
        let loader = self.loader.clone().unwrap_or_else(|| {
            loader_from_config(&self.config, self.store.clone(), self.runner.clone())
        });
        let loaded = loader
            .load(&image.artifact, self.references.destination())
            .await
            .stage(PipelineStage::Load)?;

        tracing::info!(
            reference = %loaded.reference,
            loader = loader.name(),
            manifest = %image.manifest_digest,
            "Merge complete"
        );
        Ok(MergeReport {
            image,
            loaded,
            merge,
            work_dir: self.work_dir.clone(),
        })
    }

    /// Remove the work directory.
    pub fn cleanup(self) -> Result<()> {
        if self.work_dir.exists() {
            remove_work_dir(&self.work_dir)?;
        }
        Ok(())
    }
}

/// The synchronous middle of the pipeline: history replay, merge and
/// assembly, run on a blocking thread.
struct BuildJob {
    config: MergeConfig,
    repo_dir: PathBuf,
    build_dir: PathBuf,
    destination: ImageReference,
    runner: Arc<dyn CommandRunner>,
    cancel: CancelFlag,
}

impl BuildJob {
    fn run(self, images: Vec<ExtractedImage>, handle: Handle) -> Result<(MergeResult, MergedImage)> {
        let cancel = &self.cancel;
        cancel.check("history replay").stage(PipelineStage::History)?;
        let mut backend = open_backend(&self.config, &self.repo_dir, self.runner.clone(), handle);
        let builder = HistoryBuilder::new(cancel.clone());
        builder
            .init(backend.as_mut())
            .stage(PipelineStage::History)?;
        let mut histories = Vec::with_capacity(images.len());
        for image in &images {
            let history = builder
                .replay(backend.as_mut(), image)
                .stage(PipelineStage::History)?;
            histories.push(history);
        }

        cancel.check("merge").stage(PipelineStage::Merge)?;
        let merge = MergeEngine::new(cancel.clone())
            .merge(backend.as_mut(), &histories)
            .stage(PipelineStage::Merge)?;

        cancel.check("assembly").stage(PipelineStage::Assemble)?;
        let image = ImageAssembler::from_config(&self.config)
            .assemble(
                backend.work_tree(),
                &[backend.metadata_dir()],
                &images,
                &self.destination,
                &self.build_dir,
            )
            .stage(PipelineStage::Assemble)?;
        Ok((merge, image))
    }
}

/// Delete a work directory left behind by an operation.
///
/// Refuses directories that do not look like one.
pub fn remove_work_dir(path: &Path) -> Result<()> {
    let named_like_work_dir = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(WORK_DIR_PREFIX));
    let has_layout = ["blobs", "repo", "build"]
        .iter()
        .any(|d| path.join(d).is_dir());
    if !named_like_work_dir || !has_layout {
        return Err(MergeError::Other(format!(
            "{} is not an imagemerge work directory",
            path.display()
        )));
    }

    make_tree_writable(path)?;
    std::fs::remove_dir_all(path)?;
    tracing::info!(path = %path.display(), "Removed work directory");
    Ok(())
}
