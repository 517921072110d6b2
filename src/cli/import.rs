use std::path::Path;
use swarmvault::engine::ArchiveKey;
use swarmvault::manager::ArchiveManager;

/// Import a file or directory into a writable archive
pub async fn execute(
    manager: &ArchiveManager,
    key: &str,
    file: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let key = ArchiveKey::from_hex(key)?;
    let summary = manager.import_files(key, file).await?;

    for path in &summary.files {
        println!("  + {}", path);
    }
    println!(
        "Imported {} file(s), {} bytes into {}",
        summary.files.len(),
        summary.bytes,
        key
    );
    Ok(())
}
