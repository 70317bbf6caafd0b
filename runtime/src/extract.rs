//! Layer extraction: source image blobs decompressed into the work directory.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use imagemerge_core::error::{MergeError, Result};

use crate::oci::digest::hex_part;
use crate::oci::layers::decompressing_reader;
use crate::oci::{ImageReference, LayerInfo, OciImageConfig};
use crate::references::branch_name;
use crate::source::{ImageSource, ImageSourceProvider};

/// A layer whose uncompressed tar is on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLayer {
    pub info: LayerInfo,
    /// Path of the uncompressed tar
    pub tar_path: PathBuf,
}

/// All layers of one source image, ready for replay.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub reference: ImageReference,
    /// History branch this image is replayed on
    pub branch: String,
    pub config: OciImageConfig,
    /// Layers in build order
    pub layers: Vec<ExtractedLayer>,
}

/// Fetches source images and writes their layers as plain tars under
/// `<work_dir>/blobs/sha256/<hex>.tar`.
pub struct LayerExtractor {
    provider: Arc<dyn ImageSourceProvider>,
    blobs_dir: PathBuf,
}

impl LayerExtractor {
    pub fn new(provider: Arc<dyn ImageSourceProvider>, work_dir: &Path) -> Self {
        Self {
            provider,
            blobs_dir: work_dir.join("blobs").join("sha256"),
        }
    }

    /// Directory holding extracted layer tars.
    pub fn blobs_dir(&self) -> &Path {
        &self.blobs_dir
    }

    /// Resolve the source at position `index` and extract all of its layers.
    pub async fn extract(&self, reference: &ImageReference, index: usize) -> Result<ExtractedImage> {
        let source = self.provider.resolve(reference).await?;
        let infos = source.layers();

        std::fs::create_dir_all(&self.blobs_dir).map_err(|e| MergeError::BlobWriteError {
            digest: String::new(),
            message: format!("Failed to create {}: {}", self.blobs_dir.display(), e),
        })?;

        tracing::info!(
            image = %reference,
            layers = infos.len(),
            "Extracting image layers"
        );

        let mut layers = Vec::with_capacity(infos.len());
        for info in infos {
            let tar_path = self.extract_layer(source.as_ref(), &info)?;
            layers.push(ExtractedLayer { info, tar_path });
        }

        Ok(ExtractedImage {
            reference: reference.clone(),
            branch: branch_name(index, reference),
            config: source.config(),
            layers,
        })
    }

    fn extract_layer(&self, source: &dyn ImageSource, info: &LayerInfo) -> Result<PathBuf> {
        let target = self.blobs_dir.join(format!("{}.tar", hex_part(&info.digest)));
        if target.is_file() {
            tracing::debug!(digest = %info.digest, "Layer already extracted, reusing");
            return Ok(target);
        }

        let fetch_error = |message: String| MergeError::BlobFetchError {
            image: source.reference().to_string(),
            digest: info.digest.clone(),
            message,
        };
        let write_error = |message: String| MergeError::BlobWriteError {
            digest: info.digest.clone(),
            message,
        };

        let blob = source.open_blob(info)?;
        let (compression, mut reader) = decompressing_reader(blob)
            .map_err(|e| fetch_error(format!("Failed to read blob header: {}", e)))?;

        // Write to a partial file so an interrupted extraction is never reused.
        let partial = target.with_extension("tar.partial");
        let file = File::create(&partial)
            .map_err(|e| write_error(format!("Failed to create {}: {}", partial.display(), e)))?;
        let mut writer = BufWriter::new(file);

        let bytes = copy_distinguishing_errors(&mut reader, &mut writer).map_err(|e| match e {
            CopyError::Read(e) => fetch_error(format!("Failed to decode blob: {}", e)),
            CopyError::Write(e) => write_error(format!("Failed to write layer tar: {}", e)),
        })?;
        writer
            .flush()
            .map_err(|e| write_error(format!("Failed to flush layer tar: {}", e)))?;
        drop(writer);

        std::fs::rename(&partial, &target)
            .map_err(|e| write_error(format!("Failed to finalize {}: {}", target.display(), e)))?;

        tracing::debug!(
            digest = %info.digest,
            ordinal = info.ordinal,
            compression = ?compression,
            bytes,
            "Extracted layer"
        );
        Ok(target)
    }
}

enum CopyError {
    Read(std::io::Error),
    Write(std::io::Error),
}

/// `io::copy` that tells decoding failures apart from disk failures.
fn copy_distinguishing_errors<R: std::io::Read + ?Sized, W: Write>(
    reader: &mut R,
    writer: &mut W,
) -> std::result::Result<u64, CopyError> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };
        writer.write_all(&buf[..n]).map_err(CopyError::Write)?;
        total += n as u64;
    }
}
