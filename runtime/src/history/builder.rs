//! Replays extracted images as per-layer commit histories.

use imagemerge_core::cancel::CancelFlag;
use imagemerge_core::error::{MergeError, Result};

use super::{HistoryBackend, ROOT_BRANCH};
use crate::extract::ExtractedImage;
use crate::oci::{apply_layer_protected, ImageReference};

/// Commit recorded for one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerCommit {
    pub digest: String,
    pub commit: String,
}

/// Branch and commits produced by replaying one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHistory {
    pub reference: ImageReference,
    pub branch: String,
    /// One entry per layer, in ordinal order
    pub commits: Vec<LayerCommit>,
}

impl ImageHistory {
    /// Commit at the tip of the image's branch, `None` for an image
    /// without layers.
    pub fn tip(&self) -> Option<&str> {
        self.commits.last().map(|c| c.commit.as_str())
    }
}

/// Turns extracted images into branches of a working repository.
pub struct HistoryBuilder {
    cancel: CancelFlag,
}

impl HistoryBuilder {
    pub fn new(cancel: CancelFlag) -> Self {
        Self { cancel }
    }

    /// Initialize the repository with its empty super-root commit.
    pub fn init(&self, backend: &mut dyn HistoryBackend) -> Result<String> {
        let root = backend.init()?;
        tracing::info!(backend = backend.name(), root = %root, "Initialized working repository");
        Ok(root)
    }

    /// Replay `image` on its own branch off the root, one commit per layer.
    pub fn replay(
        &self,
        backend: &mut dyn HistoryBackend,
        image: &ExtractedImage,
    ) -> Result<ImageHistory> {
        let replay_error = |layer: &str, e: MergeError| match e {
            MergeError::Cancelled(_) => e,
            other => MergeError::HistoryReplayError {
                image: image.reference.to_string(),
                layer: layer.to_string(),
                message: other.to_string(),
            },
        };

        backend
            .create_branch(&image.branch, ROOT_BRANCH)
            .and_then(|_| backend.checkout(&image.branch))
            .map_err(|e| replay_error("-", e))?;

        let protected = [backend.metadata_dir()];
        let mut commits = Vec::with_capacity(image.layers.len());
        for layer in &image.layers {
            let digest = layer.info.digest.as_str();
            self.cancel
                .check(&format!("layer {} of {}", digest, image.reference))?;

            let stats = apply_layer_protected(&layer.tar_path, backend.work_tree(), &protected)
                .map_err(|e| replay_error(digest, e))?;
            let commit = backend.commit(digest).map_err(|e| replay_error(digest, e))?;

            tracing::debug!(
                branch = %image.branch,
                layer = digest,
                ordinal = layer.info.ordinal,
                applied = stats.applied,
                whiteouts = stats.whiteouts,
                commit = %commit,
                "Committed layer"
            );
            commits.push(LayerCommit {
                digest: digest.to_string(),
                commit,
            });
        }

        tracing::info!(
            image = %image.reference,
            branch = %image.branch,
            layers = commits.len(),
            "Replayed image history"
        );
        Ok(ImageHistory {
            reference: image.reference.clone(),
            branch: image.branch.clone(),
            commits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractedLayer;
    use crate::history::SnapshotBackend;
    use crate::oci::{LayerInfo, OciImageConfig};
    use imagemerge_core::config::DEFAULT_COMMIT_DATE;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn write_tar(path: &Path, files: &[(&str, &[u8])]) {
        let mut builder = tar::Builder::new(fs::File::create(path).unwrap());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.finish().unwrap();
    }

    fn image(reference: &str, branch: &str, layers: Vec<PathBuf>) -> ExtractedImage {
        ExtractedImage {
            reference: ImageReference::parse(reference).unwrap(),
            branch: branch.to_string(),
            config: OciImageConfig::default(),
            layers: layers
                .into_iter()
                .enumerate()
                .map(|(ordinal, tar_path)| ExtractedLayer {
                    info: LayerInfo {
                        digest: format!("sha256:{:064x}", ordinal),
                        size: 0,
                        ordinal,
                        media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
                    },
                    tar_path,
                })
                .collect(),
        }
    }

    struct Fixture {
        _tmp: TempDir,
        repo: PathBuf,
        blobs: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        let blobs = tmp.path().join("blobs");
        fs::create_dir_all(&repo).unwrap();
        fs::create_dir_all(&blobs).unwrap();
        Fixture {
            _tmp: tmp,
            repo,
            blobs,
        }
    }

    #[test]
    fn test_replay_reproduces_filesystem() {
        let fx = fixture();
        let base = fx.blobs.join("0.tar");
        let top = fx.blobs.join("1.tar");
        write_tar(&base, &[("etc/os", b"base"), ("tmp/scratch", b"x")]);
        write_tar(&top, &[("etc/os", b"top"), ("tmp/.wh.scratch", b"")]);

        let mut backend = SnapshotBackend::new(&fx.repo, DEFAULT_COMMIT_DATE);
        let builder = HistoryBuilder::new(CancelFlag::new());
        builder.init(&mut backend).unwrap();
        let history = builder
            .replay(&mut backend, &image("team/a:1", "src-0-a", vec![base, top]))
            .unwrap();

        assert_eq!(history.commits.len(), 2);
        assert_eq!(history.tip(), Some(backend.head().unwrap().as_str()));
        assert_eq!(fs::read_to_string(fx.repo.join("etc/os")).unwrap(), "top");
        assert!(!fx.repo.join("tmp/scratch").exists());
        assert!(fx.repo.join("tmp").is_dir());
    }

    #[test]
    fn test_replay_commits_empty_layers() {
        let fx = fixture();
        let empty = fx.blobs.join("empty.tar");
        write_tar(&empty, &[]);

        let mut backend = SnapshotBackend::new(&fx.repo, DEFAULT_COMMIT_DATE);
        let builder = HistoryBuilder::new(CancelFlag::new());
        builder.init(&mut backend).unwrap();
        let history = builder
            .replay(
                &mut backend,
                &image("team/a:1", "src-0-a", vec![empty.clone(), empty]),
            )
            .unwrap();

        assert_eq!(history.commits.len(), 2);
        assert_ne!(history.commits[0].commit, history.commits[1].commit);
    }

    #[test]
    fn test_each_image_starts_from_empty_root() {
        let fx = fixture();
        let a = fx.blobs.join("a.tar");
        let b = fx.blobs.join("b.tar");
        write_tar(&a, &[("only-a", b"a")]);
        write_tar(&b, &[("only-b", b"b")]);

        let mut backend = SnapshotBackend::new(&fx.repo, DEFAULT_COMMIT_DATE);
        let builder = HistoryBuilder::new(CancelFlag::new());
        builder.init(&mut backend).unwrap();
        builder
            .replay(&mut backend, &image("team/a:1", "src-0-a", vec![a]))
            .unwrap();
        builder
            .replay(&mut backend, &image("team/b:1", "src-1-b", vec![b]))
            .unwrap();

        assert!(!fx.repo.join("only-a").exists());
        assert!(fx.repo.join("only-b").exists());
    }

    #[test]
    fn test_replay_bad_layer_names_image_and_layer() {
        let fx = fixture();
        let missing = fx.blobs.join("missing.tar");

        let mut backend = SnapshotBackend::new(&fx.repo, DEFAULT_COMMIT_DATE);
        let builder = HistoryBuilder::new(CancelFlag::new());
        builder.init(&mut backend).unwrap();
        let err = builder
            .replay(&mut backend, &image("team/a:1", "src-0-a", vec![missing]))
            .unwrap_err();

        match err {
            MergeError::HistoryReplayError { image, layer, .. } => {
                assert_eq!(image, "docker.io/team/a:1");
                assert_eq!(layer, format!("sha256:{:064x}", 0));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_replay_stops_when_cancelled() {
        let fx = fixture();
        let layer = fx.blobs.join("0.tar");
        write_tar(&layer, &[("f", b"x")]);

        let mut backend = SnapshotBackend::new(&fx.repo, DEFAULT_COMMIT_DATE);
        let cancel = CancelFlag::new();
        let builder = HistoryBuilder::new(cancel.clone());
        builder.init(&mut backend).unwrap();
        cancel.cancel();

        let err = builder
            .replay(&mut backend, &image("team/a:1", "src-0-a", vec![layer]))
            .unwrap_err();
        assert!(matches!(err, MergeError::Cancelled(_)));
        assert!(!fx.repo.join("f").exists());
    }
}
