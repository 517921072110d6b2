use swarmvault::engine::ArchiveKey;
use swarmvault::manager::ArchiveManager;

/// Show an archive's status
///
/// Loads the archive from disk if it is not live. Does not join the network.
pub async fn execute(manager: &ArchiveManager, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let key = ArchiveKey::from_hex(key)?;
    let status = manager.stats(key).await?;
    println!("{}", status);
    Ok(())
}
