use swarmvault::manager::ArchiveManager;

/// List archives recorded in the index
pub async fn execute(manager: &ArchiveManager) -> Result<(), Box<dyn std::error::Error>> {
    let records = manager.list().await?;
    if records.is_empty() {
        println!("No archives.");
        return Ok(());
    }

    for record in records {
        let mode = if record.writable { "rw" } else { "ro" };
        println!("{}  {}  {}", record.key, mode, record.path.display());
    }
    Ok(())
}
