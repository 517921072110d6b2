use super::wait_for_shutdown;
use swarmvault::engine::ArchiveKey;
use swarmvault::manager::{ArchiveManager, DownloadOptions};

/// Download an archive
///
/// Connects to peers for `key`, mirrors the archive into the content
/// directory and rejoins the network with the durable copy.
pub async fn execute(
    manager: &ArchiveManager,
    key: &str,
    force_port: Option<u16>,
    seed: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let key = ArchiveKey::from_hex(key)?;
    println!("Downloading {}...", key);

    let options = DownloadOptions {
        force_port,
        ..Default::default()
    };
    let handle = manager.download(key, options).await?;

    let stats = handle.stats();
    println!("Downloaded {} to {}", key, handle.storage());
    println!("  Files: {} ({} bytes)", stats.files, stats.byte_length);

    if seed {
        wait_for_shutdown().await?;
    }
    Ok(())
}
