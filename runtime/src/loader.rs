//! Loading the merged artifact into an image store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use imagemerge_core::cancel::CancelFlag;
use imagemerge_core::config::{LoaderKind, MergeConfig};
use imagemerge_core::error::{MergeError, Result};
use imagemerge_core::exec::{CommandRunner, CommandSpec};

use crate::oci::archive::unpack_archive;
use crate::oci::{ImageReference, ImageStore, OciImage};

/// Where a merged image ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    /// Reference the image is available under
    pub reference: String,
    /// Manifest digest, when the loader reports one
    pub digest: Option<String>,
    /// Location in the local store, for store-backed loaders
    pub path: Option<PathBuf>,
}

/// Makes an assembled artifact available under a reference.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    /// Loader name for logs.
    fn name(&self) -> &'static str;

    async fn load(&self, artifact: &Path, reference: &ImageReference) -> Result<LoadedImage>;
}

/// Build the loader selected by `config`.
pub fn loader_from_config(
    config: &MergeConfig,
    store: Arc<ImageStore>,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn ImageLoader> {
    match config.loader {
        LoaderKind::Store => Arc::new(StoreLoader::new(store).with_timeout(config.timeouts.load())),
        LoaderKind::Docker => Arc::new(DockerLoader::new(
            &config.docker_binary,
            runner,
            config.timeouts.load(),
        )),
    }
}

/// Loads into the local [`ImageStore`].
pub struct StoreLoader {
    store: Arc<ImageStore>,
    timeout: Option<Duration>,
}

impl StoreLoader {
    pub fn new(store: Arc<ImageStore>) -> Self {
        Self {
            store,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of the blocking half of a store load.
struct Staged {
    digest: String,
    /// The layout was copied in by this load
    created: bool,
}

/// Unpack `artifact` into scratch, validate it and copy the layout into the
/// store. Scratch is always removed. `checkpoint` runs between steps.
fn stage_artifact(
    store: &ImageStore,
    artifact: &Path,
    checkpoint: impl Fn() -> Result<()>,
) -> Result<Staged> {
    let scratch = store.scratch_path("load");
    let result = (|| -> Result<Staged> {
        checkpoint()?;
        unpack_archive(artifact, &scratch).map_err(|e| MergeError::LoadError(e.to_string()))?;
        let image = OciImage::from_path(&scratch)
            .map_err(|e| MergeError::LoadError(format!("Artifact is not a valid image: {}", e)))?;
        checkpoint()?;
        let (_, created) = store
            .ingest(image.manifest_digest(), &scratch)
            .map_err(|e| MergeError::LoadError(e.to_string()))?;
        Ok(Staged {
            digest: image.manifest_digest().to_string(),
            created,
        })
    })();
    if scratch.exists() {
        if let Err(e) = std::fs::remove_dir_all(&scratch) {
            tracing::warn!(path = %scratch.display(), error = %e, "Failed to remove load scratch directory");
        }
    }
    result
}

#[async_trait]
impl ImageLoader for StoreLoader {
    fn name(&self) -> &'static str {
        "store"
    }

    /// The store index is only touched once the blocking work has finished
    /// inside the time limit. A load that runs out of time leaves neither a
    /// reference nor a new layout behind.
    async fn load(&self, artifact: &Path, reference: &ImageReference) -> Result<LoadedImage> {
        let timed_out = {
            let reference = reference.to_string();
            let limit = self.timeout;
            move || {
                MergeError::TimeoutError(format!(
                    "loading {} exceeded {:?}",
                    reference,
                    limit.unwrap_or_default()
                ))
            }
        };
        let abandoned = CancelFlag::new();
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let mut job = tokio::task::spawn_blocking({
            let store = self.store.clone();
            let artifact = artifact.to_path_buf();
            let abandoned = abandoned.clone();
            let timed_out = timed_out.clone();
            move || {
                stage_artifact(&store, &artifact, || {
                    let expired = deadline.is_some_and(|d| Instant::now() >= d);
                    if abandoned.is_cancelled() || expired {
                        return Err(timed_out());
                    }
                    Ok(())
                })
            }
        });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut job).await {
                Ok(joined) => joined,
                Err(_) => {
                    abandoned.cancel();
                    if let Ok(Ok(staged)) = job.await {
                        if staged.created {
                            if let Err(e) = self.store.discard(&staged.digest).await {
                                tracing::warn!(digest = %staged.digest, error = %e, "Failed to discard abandoned layout");
                            }
                        }
                    }
                    return Err(timed_out());
                }
            },
            None => job.await,
        };
        let staged =
            joined.map_err(|e| MergeError::LoadError(format!("Load task failed: {}", e)))??;

        let stored = self
            .store
            .record(&reference.full_reference(), &staged.digest)
            .await
            .map_err(|e| MergeError::LoadError(e.to_string()))?;

        Ok(LoadedImage {
            reference: stored.reference,
            digest: Some(stored.digest),
            path: Some(stored.path),
        })
    }
}

/// Loads through `docker load`.
pub struct DockerLoader {
    binary: String,
    runner: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
}

impl DockerLoader {
    pub fn new(binary: &str, runner: Arc<dyn CommandRunner>, timeout: Option<Duration>) -> Self {
        Self {
            binary: binary.to_string(),
            runner,
            timeout,
        }
    }
}

#[async_trait]
impl ImageLoader for DockerLoader {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn load(&self, artifact: &Path, reference: &ImageReference) -> Result<LoadedImage> {
        let spec = CommandSpec::new(&self.binary)
            .arg("load")
            .arg("-i")
            .arg(artifact.to_string_lossy())
            .timeout(self.timeout);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(MergeError::LoadError(format!(
                "docker load exited with {}: {}",
                output.exit_code,
                output.stderr_str().trim()
            )));
        }

        let reported = output
            .stdout_str()
            .lines()
            .find_map(|l| l.strip_prefix("Loaded image: "))
            .map(|s| s.trim().to_string());
        let reference = reported.unwrap_or_else(|| reference.familiar());
        tracing::info!(reference = %reference, "Loaded image into docker");

        Ok(LoadedImage {
            reference,
            digest: None,
            path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::archive::pack_dir;
    use crate::oci::layout::{LayoutWriter, MEDIA_TYPE_LAYER_GZIP};
    use imagemerge_core::exec::CommandOutput;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn artifact(tmp: &TempDir) -> PathBuf {
        let layout = tmp.path().join("layout");
        let writer = LayoutWriter::create(&layout).unwrap();
        let layer = writer.write_blob(b"layer", MEDIA_TYPE_LAYER_GZIP).unwrap();
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": ["sha256:00"]}
        });
        writer.finish(&config, &[layer], Some("merged:latest")).unwrap();

        let path = tmp.path().join("output.tar");
        pack_dir(&layout, &[], std::fs::File::create(&path).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_store_loader_puts_image() {
        let tmp = TempDir::new().unwrap();
        let artifact = artifact(&tmp);
        let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());
        let reference = ImageReference::parse("merged:latest").unwrap();

        let loaded = StoreLoader::new(store.clone())
            .load(&artifact, &reference)
            .await
            .unwrap();

        assert_eq!(loaded.reference, "docker.io/library/merged:latest");
        let stored = store.get("docker.io/library/merged:latest").await.unwrap();
        assert_eq!(Some(stored.digest.clone()), loaded.digest);
        assert!(OciImage::from_path(&stored.path).is_ok());
        assert!(!tmp.path().join("store/tmp").read_dir().unwrap().any(|_| true));
    }

    #[tokio::test]
    async fn test_store_loader_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let bogus = tmp.path().join("bogus.tar");
        std::fs::write(&bogus, b"definitely not a tar archive").unwrap();
        let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());
        let reference = ImageReference::parse("merged:latest").unwrap();

        let err = StoreLoader::new(store.clone())
            .load(&bogus, &reference)
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::LoadError(_)));
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_store_loader_timeout_leaves_store_untouched() {
        let tmp = TempDir::new().unwrap();
        let artifact = artifact(&tmp);
        let store_root = tmp.path().join("store");
        let store = Arc::new(ImageStore::new(&store_root).unwrap());
        let reference = ImageReference::parse("merged:latest").unwrap();

        let err = StoreLoader::new(store.clone())
            .with_timeout(Some(Duration::ZERO))
            .load(&artifact, &reference)
            .await
            .unwrap_err();

        assert!(matches!(err, MergeError::TimeoutError(_)));
        assert!(store.list().await.is_empty());
        let empty = |dir: &str| {
            std::fs::read_dir(store_root.join(dir))
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true)
        };
        assert!(empty("tmp"));
        assert!(empty("sha256"));
        assert!(!store_root.join("index.json").exists());

        // The same artifact loads once the limit allows it.
        let loaded = StoreLoader::new(store.clone())
            .with_timeout(Some(Duration::from_secs(60)))
            .load(&artifact, &reference)
            .await
            .unwrap();
        assert!(loaded.path.unwrap().is_dir());
    }

    struct DockerStub {
        calls: Mutex<Vec<CommandSpec>>,
        exit_code: i32,
    }

    #[async_trait]
    impl CommandRunner for DockerStub {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            Ok(CommandOutput {
                stdout: b"Loaded image: merged:latest\n".to_vec(),
                stderr: b"daemon unavailable".to_vec(),
                exit_code: self.exit_code,
            })
        }
    }

    #[tokio::test]
    async fn test_docker_loader_runs_docker_load() {
        let stub = Arc::new(DockerStub {
            calls: Mutex::new(Vec::new()),
            exit_code: 0,
        });
        let loader = DockerLoader::new("docker", stub.clone(), None);
        let reference = ImageReference::parse("merged:latest").unwrap();

        let loaded = loader
            .load(Path::new("/work/build/output.tar"), &reference)
            .await
            .unwrap();

        assert_eq!(loaded.reference, "merged:latest");
        let calls = stub.calls.lock().unwrap();
        assert_eq!(calls[0].program, "docker");
        assert_eq!(calls[0].args, vec!["load", "-i", "/work/build/output.tar"]);
    }

    #[tokio::test]
    async fn test_docker_loader_failure_is_load_error() {
        let stub = Arc::new(DockerStub {
            calls: Mutex::new(Vec::new()),
            exit_code: 1,
        });
        let loader = DockerLoader::new("docker", stub, None);
        let reference = ImageReference::parse("merged:latest").unwrap();

        let err = loader
            .load(Path::new("/tmp/output.tar"), &reference)
            .await
            .unwrap_err();
        match err {
            MergeError::LoadError(message) => assert!(message.contains("daemon unavailable")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
