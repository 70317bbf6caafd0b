//! End-to-end merges against a local image store.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use imagemerge_core::exec::{CommandOutput, CommandRunner, CommandSpec};
use imagemerge_core::{ErrorKind, MergeConfig, MergeError, PipelineStage, SourceKind};
use imagemerge_runtime::oci::archive::pack_dir;
use imagemerge_runtime::oci::layout::{LayoutWriter, MEDIA_TYPE_LAYER_GZIP};
use imagemerge_runtime::{ImageReference, ImageStore, MergeOperation, MergeReport, OciImage, ReferenceSet};
use tempfile::TempDir;

type Layer<'a> = &'a [(&'a str, &'a str)];

fn layer_blob(files: Layer<'_>) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), flate2::Compression::default()));
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content.as_bytes()).unwrap();
    }
    let mut encoder = builder.into_inner().unwrap();
    encoder.flush().unwrap();
    encoder.finish().unwrap()
}

/// Store an arm64 image with `layers` under `reference`.
async fn add_image(tmp: &TempDir, store: &ImageStore, reference: &str, layers: &[Layer<'_>], env: &[&str]) {
    let (layout, digest) = write_layout(tmp, reference, layers, env);
    let full = ImageReference::parse(reference).unwrap().full_reference();
    store.put(&full, &digest, &layout).await.unwrap();
}

/// Write an arm64 image layout and return it with its manifest digest.
fn write_layout(tmp: &TempDir, reference: &str, layers: &[Layer<'_>], env: &[&str]) -> (PathBuf, String) {
    let layout = tmp.path().join("layouts").join(reference.replace(&[':', '/'][..], "_"));
    let writer = LayoutWriter::create(&layout).unwrap();
    let blobs: Vec<_> = layers
        .iter()
        .map(|files| writer.write_blob(&layer_blob(files), MEDIA_TYPE_LAYER_GZIP).unwrap())
        .collect();
    let config = serde_json::json!({
        "architecture": "arm64",
        "os": "linux",
        "config": {"Env": env},
        "rootfs": {"type": "layers", "diff_ids": []}
    });
    let written = writer.finish(&config, &blobs, Some(reference)).unwrap();
    (layout, written.manifest.digest)
}

fn config(tmp: &TempDir) -> MergeConfig {
    MergeConfig {
        work_root: tmp.path().join("work"),
        store_dir: tmp.path().join("store"),
        architecture: "amd64".to_string(),
        pull: false,
        ..Default::default()
    }
}

async fn seeded(tmp: &TempDir) -> Arc<ImageStore> {
    let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());
    add_image(
        tmp,
        &store,
        "team/a:1",
        &[&[("a", "1"), ("shared", "X")]],
        &["FROM=a", "ONLY_A=yes"],
    )
    .await;
    add_image(
        tmp,
        &store,
        "team/b:1",
        &[&[("b", "2"), ("shared", "Y")]],
        &["FROM=b", "ONLY_B=yes"],
    )
    .await;
    store
}

async fn run(tmp: &TempDir, sources: &[&str]) -> Result<(MergeOperation, MergeReport), (MergeOperation, MergeError)> {
    let references = ReferenceSet::parse("merged:latest", sources).unwrap();
    let mut operation = MergeOperation::new(references, config(tmp)).unwrap();
    match operation.run().await {
        Ok(report) => Ok((operation, report)),
        Err(e) => Err((operation, e)),
    }
}

/// Path to content map of the merged image's only layer.
fn merged_files(image_dir: &Path) -> BTreeMap<String, String> {
    let image = OciImage::from_path(image_dir).unwrap();
    assert_eq!(image.layers().len(), 1);
    let blob = std::fs::File::open(image.blob_path(&image.layers()[0].digest)).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(blob));

    let mut files = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        files.insert(path, content);
    }
    files
}

#[tokio::test]
async fn test_merge_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let store = seeded(&tmp).await;

    let (_operation, report) = run(&tmp, &["team/a:1", "team/b:1"]).await.map_err(|(_, e)| e).unwrap();

    drop(store);
    let store = ImageStore::new(&tmp.path().join("store")).unwrap();
    let stored = store.get("docker.io/library/merged:latest").await.unwrap();
    assert_eq!(report.loaded.digest.as_deref(), Some(stored.digest.as_str()));

    let files = merged_files(&stored.path);
    assert_eq!(files.get("a").map(String::as_str), Some("1"));
    assert_eq!(files.get("b").map(String::as_str), Some("2"));
    assert_eq!(files.get("shared").map(String::as_str), Some("X"));
    assert_eq!(files.len(), 3);

    let image = OciImage::from_path(&stored.path).unwrap();
    assert_eq!(image.architecture(), "amd64");
    assert_eq!(image.os(), "linux");
    assert_eq!(image.config().env_var("FROM"), Some("a"));
    assert_eq!(image.config().env_var("ONLY_B"), Some("yes"));
    assert_eq!(report.merge.resolved_ours, vec!["shared"]);
    assert!(report.work_dir.join("build/output.tar").is_file());
}

#[tokio::test]
async fn test_source_order_decides_shared_paths() {
    let tmp = TempDir::new().unwrap();
    seeded(&tmp).await;

    let (_operation, report) = run(&tmp, &["team/b:1", "team/a:1"]).await.map_err(|(_, e)| e).unwrap();

    let files = merged_files(&report.image.layout_dir);
    assert_eq!(files.get("shared").map(String::as_str), Some("Y"));
    assert_eq!(files.get("a").map(String::as_str), Some("1"));
    assert_eq!(files.get("b").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn test_repeated_merges_are_byte_identical() {
    let tmp = TempDir::new().unwrap();
    seeded(&tmp).await;

    let (_first_op, first) = run(&tmp, &["team/a:1", "team/b:1"]).await.map_err(|(_, e)| e).unwrap();
    let (_second_op, second) = run(&tmp, &["team/a:1", "team/b:1"]).await.map_err(|(_, e)| e).unwrap();

    assert_ne!(first.work_dir, second.work_dir);
    assert_eq!(first.image.manifest_digest, second.image.manifest_digest);
    assert_eq!(
        std::fs::read(&first.image.artifact).unwrap(),
        std::fs::read(&second.image.artifact).unwrap()
    );
}

#[tokio::test]
async fn test_disjoint_sources_merge_the_same_in_any_order() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());
    let base: Layer<'_> = &[("etc/os-release", "base"), ("usr/lib/libc", "c")];
    add_image(&tmp, &store, "team/x:1", &[base, &[("opt/x/bin", "x")]], &[]).await;
    add_image(&tmp, &store, "team/y:1", &[base, &[("opt/y/bin", "y"), ("srv/y", "data")]], &[]).await;

    let (_xy_op, xy) = run(&tmp, &["team/x:1", "team/y:1"]).await.map_err(|(_, e)| e).unwrap();
    let (_yx_op, yx) = run(&tmp, &["team/y:1", "team/x:1"]).await.map_err(|(_, e)| e).unwrap();

    let files = merged_files(&xy.image.layout_dir);
    assert_eq!(files, merged_files(&yx.image.layout_dir));
    assert_eq!(files.len(), 5);
    assert_eq!(files.get("etc/os-release").map(String::as_str), Some("base"));
    assert_eq!(xy.image.layer.digest, yx.image.layer.digest);
    assert!(xy.merge.resolved_ours.is_empty());
    assert!(yx.merge.resolved_ours.is_empty());
}

/// Answers `docker save -o <path> <name>` from prepared layouts.
struct DaemonStub {
    layouts: BTreeMap<String, PathBuf>,
    saved: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandRunner for DaemonStub {
    async fn run(&self, spec: &CommandSpec) -> imagemerge_core::Result<CommandOutput> {
        let [save, _, target, name] = spec.args.as_slice() else {
            return Ok(CommandOutput { exit_code: 2, ..Default::default() });
        };
        let Some(layout) = self.layouts.get(name).filter(|_| save == "save") else {
            return Ok(CommandOutput {
                stderr: b"No such image".to_vec(),
                exit_code: 1,
                ..Default::default()
            });
        };
        pack_dir(layout, &[], std::fs::File::create(target).unwrap()).unwrap();
        self.saved.lock().unwrap().push(name.clone());
        Ok(CommandOutput::default())
    }
}

#[tokio::test]
async fn test_merge_from_docker_source() {
    let tmp = TempDir::new().unwrap();
    let layouts = [
        ("team/a:1", write_layout(&tmp, "team/a:1", &[&[("a", "1"), ("shared", "X")]], &["FROM=a"]).0),
        ("team/b:1", write_layout(&tmp, "team/b:1", &[&[("b", "2"), ("shared", "Y")]], &["FROM=b"]).0),
    ];
    let daemon = Arc::new(DaemonStub {
        layouts: layouts.into_iter().map(|(name, dir)| (name.to_string(), dir)).collect(),
        saved: Mutex::new(Vec::new()),
    });
    let config = MergeConfig {
        source: SourceKind::Docker,
        ..config(&tmp)
    };
    let references = ReferenceSet::parse("merged:latest", &["team/a:1", "team/b:1"]).unwrap();
    let mut operation = MergeOperation::new(references, config)
        .unwrap()
        .with_runner(daemon.clone());

    let report = operation.run().await.unwrap();

    assert_eq!(*daemon.saved.lock().unwrap(), vec!["team/a:1", "team/b:1"]);
    let files = merged_files(&report.image.layout_dir);
    assert_eq!(files.get("shared").map(String::as_str), Some("X"));
    assert_eq!(files.get("b").map(String::as_str), Some("2"));
    assert_eq!(report.image.config.env_var("FROM"), Some("a"));
    assert!(report.work_dir.join("sources").is_dir());
    assert!(ImageStore::new(&tmp.path().join("store"))
        .unwrap()
        .get("docker.io/library/team/a:1")
        .await
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_git_backend_keeps_ignored_layer_files() {
    let git = CommandSpec::new("git").arg("--version");
    if !imagemerge_core::SystemRunner::new().run(&git).await.is_ok_and(|o| o.success()) {
        eprintln!("git not installed, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());
    add_image(
        &tmp,
        &store,
        "team/logs:1",
        &[&[("app/.gitignore", "*.log\n"), ("app/boot.log", "booted"), ("shared", "L")]],
        &[],
    )
    .await;
    add_image(&tmp, &store, "team/other:1", &[&[("other", "o"), ("shared", "O")]], &[]).await;

    let config = MergeConfig {
        backend: imagemerge_core::BackendKind::Git,
        ..config(&tmp)
    };
    let references = ReferenceSet::parse("merged:latest", &["team/logs:1", "team/other:1"]).unwrap();
    let mut operation = MergeOperation::new(references, config).unwrap();
    let report = operation.run().await.unwrap();

    let files = merged_files(&report.image.layout_dir);
    assert_eq!(files.get("app/boot.log").map(String::as_str), Some("booted"));
    assert_eq!(files.get("shared").map(String::as_str), Some("L"));
    assert_eq!(files.get("other").map(String::as_str), Some("o"));
    assert!(files.keys().all(|p| !p.starts_with(".git/")));
}

#[tokio::test]
async fn test_whiteouts_replay_before_merge() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());
    add_image(
        &tmp,
        &store,
        "team/layered:1",
        &[
            &[("etc/keep", "k"), ("etc/drop", "d"), ("shared", "old")],
            &[("etc/.wh.drop", ""), ("shared", "new")],
        ],
        &[],
    )
    .await;
    add_image(&tmp, &store, "team/other:1", &[&[("other", "o")]], &[]).await;

    let (_operation, report) = run(&tmp, &["team/layered:1", "team/other:1"])
        .await
        .map_err(|(_, e)| e)
        .unwrap();

    let files = merged_files(&report.image.layout_dir);
    assert_eq!(files.get("etc/keep").map(String::as_str), Some("k"));
    assert_eq!(files.get("shared").map(String::as_str), Some("new"));
    assert_eq!(files.get("other").map(String::as_str), Some("o"));
    assert!(!files.contains_key("etc/drop"));
    assert!(files.keys().all(|p| !p.contains(".wh.")));
}

#[tokio::test]
async fn test_structural_conflict_is_fatal_and_keeps_work_dir() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());
    add_image(&tmp, &store, "team/file:1", &[&[("x", "file")]], &[]).await;
    add_image(&tmp, &store, "team/dir:1", &[&[("x/y", "nested")]], &[]).await;

    let (operation, err) = run(&tmp, &["team/file:1", "team/dir:1"]).await.err().unwrap();

    assert_eq!(err.stage(), Some(PipelineStage::Merge));
    assert_eq!(err.kind(), ErrorKind::MergeConflictUnresolved);
    assert!(operation.work_dir().join("repo").is_dir());
    assert!(operation.artifact().is_none());
    let reopened = ImageStore::new(&tmp.path().join("store")).unwrap();
    assert!(reopened.get("docker.io/library/merged:latest").await.is_none());
    drop(store);
}

#[test]
fn test_insufficient_sources_touch_nothing() {
    let tmp = TempDir::new().unwrap();

    let err = ReferenceSet::parse("merged:latest", &["team/a:1"]).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InsufficientSources);
    assert!(!config(&tmp).work_root.exists());
}

#[test]
fn test_invalid_source_reference() {
    let err = ReferenceSet::parse("merged:latest", &["team/a:1", "Team/B::1"]).unwrap_err();
    match err {
        MergeError::InvalidReference { reference, .. } => assert_eq!(reference, "Team/B::1"),
        other => panic!("unexpected error: {other:?}"),
    }
}
