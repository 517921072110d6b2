use swarmvault::engine::ArchiveKey;
use swarmvault::manager::ArchiveManager;

/// Remove an archive
///
/// Leaves the network, deletes the index record and the archive directory.
/// The private key is kept.
pub async fn execute(manager: &ArchiveManager, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let key = ArchiveKey::from_hex(key)?;
    manager.remove(key).await?;
    println!("Removed {}", key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::test_support;
    use swarmvault::manager::CreateOptions;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_remove_created_archive() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, _engine) = test_support::manager(&temp_dir, 9120);
        let src = temp_dir.path().join("a.txt");
        std::fs::write(&src, b"a").unwrap();
        let key = manager
            .create(&src, CreateOptions::default())
            .await
            .unwrap()
            .key();

        execute(&manager, &key.to_hex()).await.unwrap();
        assert!(!manager.exists(key).await.unwrap());
        assert!(execute(&manager, &key.to_hex()).await.is_err());
    }
}
