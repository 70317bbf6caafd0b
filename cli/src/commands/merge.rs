//! `imagemerge merge` command.

use std::path::PathBuf;

use clap::Args;
use imagemerge_core::{BackendKind, LoaderKind, MergeConfig, PipelineStage, ResultExt, SourceKind};
use imagemerge_runtime::{MergeOperation, ReferenceSet};

#[derive(Args)]
pub struct MergeArgs {
    /// Destination tag for the merged image (e.g., "merged:latest")
    pub tag: String,

    /// Source images, highest precedence first
    pub sources: Vec<String>,

    /// Architecture recorded in the merged image
    #[arg(long = "arch")]
    pub architecture: Option<String>,

    /// OS recorded in the merged image
    #[arg(long)]
    pub os: Option<String>,

    /// Where to read source images: store or docker
    #[arg(long)]
    pub source: Option<SourceKind>,

    /// Filesystem history backend: embedded or git
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Where to load the merged image: store or docker
    #[arg(long)]
    pub loader: Option<LoaderKind>,

    /// Parent directory for the operation's work directory
    #[arg(long)]
    pub work_root: Option<PathBuf>,

    /// Local image store directory
    #[arg(long)]
    pub store_dir: Option<PathBuf>,

    /// Only use images already in the local store
    #[arg(long)]
    pub no_pull: bool,

    /// Keep the work directory after a successful merge
    #[arg(long)]
    pub keep_work_dir: bool,
}

impl MergeArgs {
    /// Apply command-line overrides on top of the file configuration.
    fn apply(&self, mut config: MergeConfig) -> MergeConfig {
        if let Some(ref architecture) = self.architecture {
            config.architecture = architecture.clone();
        }
        if let Some(ref os) = self.os {
            config.os = os.clone();
        }
        if let Some(source) = self.source {
            config.source = source;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(loader) = self.loader {
            config.loader = loader;
        }
        if let Some(ref work_root) = self.work_root {
            config.work_root = work_root.clone();
        }
        if let Some(ref store_dir) = self.store_dir {
            config.store_dir = store_dir.clone();
        }
        if self.no_pull {
            config.pull = false;
        }
        config
    }
}

pub async fn execute(args: MergeArgs, config: MergeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let references =
        ReferenceSet::parse(&args.tag, &args.sources).stage(PipelineStage::References)?;
    let config = args.apply(config);
    config.validate()?;

    let mut operation = MergeOperation::new(references, config)?;

    let cancel = operation.cancel_flag();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping at the next stage boundary");
            cancel.cancel();
        }
    });

    let result = operation.run().await;
    interrupt.abort();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if operation.work_dir().exists() {
                eprintln!(
                    "Work directory preserved at {}",
                    operation.work_dir().display()
                );
            }
            return Err(e.into());
        }
    };

    if !report.merge.resolved_ours.is_empty() {
        tracing::info!(
            paths = report.merge.resolved_ours.len(),
            "Conflicting paths resolved in favor of earlier sources"
        );
    }

    match report.loaded.digest {
        Some(ref digest) => println!("{} ({})", report.loaded.reference, digest),
        None => println!("{}", report.loaded.reference),
    }

    if args.keep_work_dir {
        println!("Work directory: {}", report.work_dir.display());
    } else if let Err(e) = operation.cleanup() {
        tracing::warn!(error = %e, "Failed to remove work directory");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> MergeArgs {
        MergeArgs {
            tag: "merged:latest".to_string(),
            sources: vec!["team/a:1".to_string(), "team/b:1".to_string()],
            architecture: None,
            os: None,
            source: None,
            backend: None,
            loader: None,
            work_root: None,
            store_dir: None,
            no_pull: false,
            keep_work_dir: false,
        }
    }

    #[test]
    fn test_no_flags_keep_file_config() {
        let base = MergeConfig {
            architecture: "riscv64".to_string(),
            backend: BackendKind::Git,
            ..Default::default()
        };

        let config = args().apply(base);

        assert_eq!(config.architecture, "riscv64");
        assert_eq!(config.backend, BackendKind::Git);
        assert_eq!(config.source, SourceKind::Store);
        assert!(config.pull);
    }

    #[test]
    fn test_flags_override_file_config() {
        let mut args = args();
        args.architecture = Some("arm64".to_string());
        args.loader = Some(LoaderKind::Docker);
        args.source = Some(SourceKind::Docker);
        args.store_dir = Some(PathBuf::from("/var/lib/imagemerge"));
        args.no_pull = true;

        let config = args.apply(MergeConfig::default());

        assert_eq!(config.architecture, "arm64");
        assert_eq!(config.loader, LoaderKind::Docker);
        assert_eq!(config.source, SourceKind::Docker);
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/imagemerge"));
        assert!(!config.pull);
    }

    #[tokio::test]
    async fn test_single_source_is_rejected_before_any_work() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut args = args();
        args.sources.truncate(1);
        let config = MergeConfig {
            work_root: tmp.path().join("work"),
            store_dir: tmp.path().join("store"),
            ..Default::default()
        };

        let err = execute(args, config).await.unwrap_err();

        assert!(err.to_string().contains("Insufficient sources"));
        assert!(!tmp.path().join("work").exists());
        assert!(!tmp.path().join("store").exists());
    }
}
