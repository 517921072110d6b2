mod cli;

use clap::Parser;
use cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Errors are reported, not turned into a failing exit status.
    if let Err(e) = cli::execute(cli).await {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
    }
}
