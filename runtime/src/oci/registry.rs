//! Registry pulls into local OCI layouts.
//!
//! Config and layer blobs are stored byte for byte; the manifest is rebuilt
//! by [`LayoutWriter`], so the local manifest digest may differ from the
//! registry's.

use std::path::Path;

use imagemerge_core::error::{MergeError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use tokio::io::AsyncWriteExt;

use super::layout::{BlobRef, LayoutWriter};
use super::reference::ImageReference;

/// Environment variables holding registry credentials.
const ENV_USERNAME: &str = "REGISTRY_USERNAME";
const ENV_PASSWORD: &str = "REGISTRY_PASSWORD";

/// Credentials presented to a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RegistryAuth {
    #[default]
    Anonymous,
    Basic { username: String, password: String },
}

impl RegistryAuth {
    /// Basic credentials from `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`,
    /// anonymous unless both are set.
    pub fn from_env() -> Self {
        match (std::env::var(ENV_USERNAME), std::env::var(ENV_PASSWORD)) {
            (Ok(username), Ok(password)) => Self::Basic { username, password },
            _ => Self::Anonymous,
        }
    }

    fn to_oci(&self) -> OciRegistryAuth {
        match self {
            Self::Anonymous => OciRegistryAuth::Anonymous,
            Self::Basic { username, password } => {
                OciRegistryAuth::Basic(username.clone(), password.clone())
            }
        }
    }
}

/// Downloads one platform of an image from its registry.
pub struct RegistryPuller {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryPuller {
    /// Multi-arch indexes resolve to `linux/<architecture>`.
    pub fn new(auth: RegistryAuth, architecture: &str) -> Self {
        let architecture = architecture.to_string();
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(move |entries: &[ImageIndexEntry]| {
                select_platform(entries, &architecture)
            })),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Write `reference` as an OCI layout under `target_dir` and return the
    /// layout's manifest digest.
    pub async fn pull(&self, reference: &ImageReference, target_dir: &Path) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let failed = |what: &str, e: &dyn std::fmt::Display| MergeError::RegistryError {
            registry: reference.registry.clone(),
            message: format!("{}: {}", what, e),
        };

        tracing::info!(reference = %reference, "Pulling image");
        let (manifest, remote_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &self.auth.to_oci())
            .await
            .map_err(|e| failed("manifest", &e))?;

        let writer = LayoutWriter::create(target_dir)?;

        let mut config = Vec::new();
        self.client
            .pull_blob(&oci_ref, &manifest.config, &mut config)
            .await
            .map_err(|e| failed("config blob", &e))?;
        let config_ref = writer.write_blob(&config, &manifest.config.media_type)?;

        let layers = self.pull_layers(&oci_ref, &manifest, &writer).await?;
        let written = writer.finish_with_config(config_ref, &layers, None)?;

        tracing::info!(
            reference = %reference,
            remote = %remote_digest,
            local = %written.manifest.digest,
            layers = layers.len(),
            "Pulled image"
        );
        Ok(written.manifest.digest)
    }

    async fn pull_layers(
        &self,
        oci_ref: &Reference,
        manifest: &OciImageManifest,
        writer: &LayoutWriter,
    ) -> Result<Vec<BlobRef>> {
        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            layers.push(self.pull_layer(oci_ref, layer, writer).await.map_err(|e| {
                MergeError::BlobFetchError {
                    image: oci_ref.whole(),
                    digest: layer.digest.clone(),
                    message: e.to_string(),
                }
            })?);
        }
        Ok(layers)
    }

    async fn pull_layer(
        &self,
        oci_ref: &Reference,
        layer: &OciDescriptor,
        writer: &LayoutWriter,
    ) -> std::result::Result<BlobRef, Box<dyn std::error::Error + Send + Sync>> {
        tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
        let path = writer.blob_path(&layer.digest);
        let mut file = tokio::fs::File::create(&path).await?;
        self.client.pull_blob(oci_ref, layer, &mut file).await?;
        file.flush().await?;

        Ok(BlobRef {
            digest: layer.digest.clone(),
            size: file.metadata().await?.len(),
            media_type: layer.media_type.clone(),
        })
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let full = reference.full_reference();
    full.parse::<Reference>()
        .map_err(|e| MergeError::InvalidReference {
            reference: full.clone(),
            message: e.to_string(),
        })
}

fn select_platform(entries: &[ImageIndexEntry], architecture: &str) -> Option<String> {
    entries
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == architecture)
        })
        .map(|entry| entry.digest.clone())
}
