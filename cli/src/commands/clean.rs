//! `imagemerge clean` command.

use std::path::{Path, PathBuf};

use clap::Args;
use imagemerge_core::MergeConfig;
use imagemerge_runtime::operation::WORK_DIR_PREFIX;
use imagemerge_runtime::remove_work_dir;

#[derive(Args)]
pub struct CleanArgs {
    /// Work directories to remove
    #[arg(required_unless_present = "all")]
    pub work_dirs: Vec<PathBuf>,

    /// Remove every work directory under the configured work root
    #[arg(short, long, conflicts_with = "work_dirs")]
    pub all: bool,
}

pub async fn execute(args: CleanArgs, config: MergeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let targets = if args.all {
        find_work_dirs(&config.work_root)?
    } else {
        args.work_dirs
    };

    let mut failed = 0;
    for dir in &targets {
        match remove_work_dir(dir) {
            Ok(()) => println!("{}", dir.display()),
            Err(e) => {
                eprintln!("{}: {}", dir.display(), e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(format!("failed to remove {} of {} work directories", failed, targets.len()).into());
    }
    Ok(())
}

/// Work directories directly under `root`, sorted by path.
fn find_work_dirs(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let is_work_dir = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(WORK_DIR_PREFIX));
        if is_work_dir && entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn work_dir(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("repo")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_clean_all_removes_only_work_dirs() {
        let tmp = TempDir::new().unwrap();
        let first = work_dir(tmp.path(), "imagemerge-1");
        let second = work_dir(tmp.path(), "imagemerge-2");
        let unrelated = work_dir(tmp.path(), "other");
        let config = MergeConfig {
            work_root: tmp.path().to_path_buf(),
            ..Default::default()
        };

        let args = CleanArgs {
            work_dirs: Vec::new(),
            all: true,
        };
        execute(args, config).await.unwrap();

        assert!(!first.exists());
        assert!(!second.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_clean_refuses_unrelated_directory() {
        let tmp = TempDir::new().unwrap();
        let unrelated = work_dir(tmp.path(), "other");

        let args = CleanArgs {
            work_dirs: vec![unrelated.clone()],
            all: false,
        };
        assert!(execute(args, MergeConfig::default()).await.is_err());
        assert!(unrelated.exists());
    }
}
