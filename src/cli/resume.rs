use super::wait_for_shutdown;
use swarmvault::manager::ArchiveManager;

/// Rejoin every archive in the index
///
/// Archives that fail to resume are reported and skipped. With `seed`, stays
/// online until Ctrl-C.
pub async fn execute(manager: &ArchiveManager, seed: bool) -> Result<(), Box<dyn std::error::Error>> {
    let report = manager.resume_all().await?;

    for key in &report.resumed {
        let port = manager.handle(key).and_then(|h| h.port());
        match port {
            Some(port) => println!("Resumed {} on port {}", key, port),
            None => println!("Resumed {}", key),
        }
    }
    for key in &report.skipped {
        println!("Already running {}", key);
    }
    for key in &report.read_only {
        println!("Resumed read-only {}: secret key not found", key);
    }
    for (key, error) in &report.failed {
        println!("Failed {}: {}", key, error);
    }
    println!(
        "{} resumed, {} failed",
        report.resumed.len(),
        report.failed.len()
    );

    if seed && !report.resumed.is_empty() {
        wait_for_shutdown().await?;
    }
    Ok(())
}
