//! `imagemerge images` command.

use std::path::PathBuf;

use clap::Args;
use imagemerge_core::MergeConfig;
use imagemerge_runtime::{ImageReference, ImageStore, StoredImage};

use crate::output;

const HEADERS: [&str; 5] = ["REPOSITORY", "TAG", "DIGEST", "SIZE", "STORED"];

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image references (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    /// Local image store directory
    #[arg(long)]
    pub store_dir: Option<PathBuf>,
}

pub async fn execute(args: ImagesArgs, config: MergeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store_dir = args.store_dir.unwrap_or(config.store_dir);
    let images = if store_dir.exists() {
        ImageStore::new(&store_dir)?.list().await
    } else {
        Vec::new()
    };

    if args.quiet {
        for image in &images {
            println!("{}", image.reference);
        }
        return Ok(());
    }

    let mut table = output::new_table(&HEADERS);
    for image in &images {
        table.add_row(row(image));
    }
    println!("{table}");
    Ok(())
}

fn row(image: &StoredImage) -> Vec<String> {
    let (repository, tag) = match ImageReference::parse(&image.reference) {
        Ok(r) => (
            format!("{}/{}", r.registry, r.repository),
            r.tag.unwrap_or_else(|| "<none>".to_string()),
        ),
        Err(_) => (image.reference.clone(), "<none>".to_string()),
    };
    vec![
        repository,
        tag,
        output::short_digest(&image.digest),
        output::format_bytes(image.size_bytes),
        output::format_ago(&image.stored_at),
    ]
}
