use super::wait_for_shutdown;
use std::path::PathBuf;
use swarmvault::manager::{ArchiveManager, CreateOptions};

/// Create a new archive
///
/// Generates a keypair, imports `dir` (default: current directory) into a
/// new durable archive and starts sharing it on the upload pool. With
/// `seed`, stays online until Ctrl-C.
pub async fn execute(
    manager: &ArchiveManager,
    dir: Option<PathBuf>,
    secret_dir: Option<PathBuf>,
    seed: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let src = dir.unwrap_or_else(|| PathBuf::from("."));
    let handle = manager.create(&src, CreateOptions { secret_dir }).await?;

    println!("Created archive {}", handle.key());
    println!("  Path: {}", handle.storage());
    if let Some(port) = handle.port() {
        println!("  Port: {}", port);
    }
    let stats = handle.stats();
    println!("  Files: {} ({} bytes)", stats.files, stats.byte_length);

    if seed {
        wait_for_shutdown().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::test_support;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_from_directory() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("hello.txt"), b"hello").unwrap();
        let (manager, _engine) = test_support::manager(&temp_dir, 9000);

        execute(&manager, Some(src), None, false).await.unwrap();

        let records = manager.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].writable);
    }

    #[tokio::test]
    async fn test_create_missing_source_fails() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, _engine) = test_support::manager(&temp_dir, 9020);

        let result = execute(&manager, Some(temp_dir.path().join("nope")), None, false).await;
        assert!(result.is_err());
    }
}
