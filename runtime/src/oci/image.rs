//! Reading images out of OCI layout directories.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use imagemerge_core::error::{MergeError, Result};
use oci_spec::image::{Config, ImageConfiguration, ImageIndex, ImageManifest};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

/// One layer of an image, in build order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    /// Compressed blob digest (`sha256:<hex>`)
    pub digest: String,
    /// Compressed size in bytes
    pub size: u64,
    /// Position in the manifest, 0 = bottom
    pub ordinal: usize,
    pub media_type: String,
}

/// Runtime settings carried by an image config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OciImageConfig {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    /// `KEY=VALUE` pairs in declaration order
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// Port specs such as `80/tcp`
    pub exposed_ports: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// An image opened from a layout directory. Blobs stay on disk.
#[derive(Debug)]
pub struct OciImage {
    root: PathBuf,
    manifest_digest: String,
    architecture: String,
    os: String,
    config: OciImageConfig,
    layers: Vec<LayerInfo>,
}

impl OciImage {
    /// Open the layout at `path`, following the first manifest in
    /// `index.json`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        check_layout(&root)?;

        let index: ImageIndex = read_json(&root.join("index.json"), "index")?;
        let manifest_digest = match index.manifests().first() {
            Some(descriptor) => descriptor.digest().to_string(),
            None => {
                return Err(MergeError::OciImageError(format!(
                    "Layout {} has an empty index",
                    root.display()
                )))
            }
        };

        let manifest: ImageManifest =
            read_json(&blob_path_in(&root, &manifest_digest), "manifest")?;
        let image_config: ImageConfiguration =
            read_json(&blob_path_in(&root, manifest.config().digest().as_str()), "config")?;

        let layers = manifest
            .layers()
            .iter()
            .enumerate()
            .map(|(ordinal, descriptor)| LayerInfo {
                digest: descriptor.digest().to_string(),
                size: u64::try_from(descriptor.size()).unwrap_or(0),
                ordinal,
                media_type: descriptor.media_type().to_string(),
            })
            .collect();

        tracing::debug!(
            layout = %root.display(),
            manifest = %manifest_digest,
            "Opened image layout"
        );
        Ok(Self {
            manifest_digest,
            architecture: image_config.architecture().to_string(),
            os: image_config.os().to_string(),
            config: OciImageConfig::from_oci_config(&image_config),
            layers,
            root,
        })
    }

    pub fn config(&self) -> &OciImageConfig {
        &self.config
    }

    /// Layers bottom to top.
    pub fn layers(&self) -> &[LayerInfo] {
        &self.layers
    }

    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        blob_path_in(&self.root, digest)
    }
}

fn check_layout(root: &Path) -> Result<()> {
    let missing = ["oci-layout", "index.json", "blobs"]
        .into_iter()
        .find(|entry| !root.join(entry).exists());
    match missing {
        Some(entry) => Err(MergeError::OciImageError(format!(
            "{} is not an OCI layout: {} is missing",
            root.display(),
            entry
        ))),
        None => Ok(()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let data = std::fs::read(path).map_err(|e| {
        MergeError::OciImageError(format!("Failed to read {} {}: {}", what, path.display(), e))
    })?;
    serde_json::from_slice(&data).map_err(|e| {
        MergeError::OciImageError(format!("Failed to parse {} {}: {}", what, path.display(), e))
    })
}

/// Digests without an algorithm prefix are taken as sha256.
fn blob_path_in(root: &Path, digest: &str) -> PathBuf {
    let (algorithm, hex) = digest.split_once(':').unwrap_or(("sha256", digest));
    root.join("blobs").join(algorithm).join(hex)
}

impl OciImageConfig {
    pub fn from_oci_config(image_config: &ImageConfiguration) -> Self {
        image_config
            .config()
            .as_ref()
            .map(Self::from_runtime_section)
            .unwrap_or_default()
    }

    fn from_runtime_section(section: &Config) -> Self {
        let env = section
            .env()
            .iter()
            .flatten()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            entrypoint: section.entrypoint().clone(),
            cmd: section.cmd().clone(),
            env,
            working_dir: section.working_dir().clone(),
            user: section.user().clone(),
            exposed_ports: section.exposed_ports().clone().unwrap_or_default(),
            labels: section
                .labels()
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// First value bound to `key`.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v.as_str()))
    }

    /// The `config` object of an image configuration. Empty fields are
    /// left out and maps are written in key order.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        if !self.env.is_empty() {
            let env: Vec<String> = self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            out.insert("Env".into(), json!(env));
        }
        let optional = [
            ("Entrypoint", self.entrypoint.as_ref().map(|v| json!(v))),
            ("Cmd", self.cmd.as_ref().map(|v| json!(v))),
            ("WorkingDir", self.working_dir.as_ref().map(|v| json!(v))),
            ("User", self.user.as_ref().map(|v| json!(v))),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                out.insert(key.into(), value);
            }
        }
        if !self.exposed_ports.is_empty() {
            let ports: BTreeMap<&str, Value> =
                self.exposed_ports.iter().map(|p| (p.as_str(), json!({}))).collect();
            out.insert("ExposedPorts".into(), json!(ports));
        }
        if !self.labels.is_empty() {
            out.insert("Labels".into(), json!(self.labels));
        }
        Value::Object(out)
    }
}
