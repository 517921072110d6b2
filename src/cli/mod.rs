use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use swarmvault::config::{
    default_config_path, default_storage_path, LoggingConfig, ManagerConfig,
};
use swarmvault::manager::ArchiveManager;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub mod create;
pub mod download;
pub mod get;
pub mod import;
pub mod list;
pub mod remove;
pub mod resume;

#[derive(Parser)]
#[command(name = "swarmvault")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Create, share, and download replicated archives", long_about = None)]
pub struct Cli {
    /// Storage root (default: ~/.local/share/swarmvault)
    #[arg(long, short = 's', global = true)]
    pub storage_path: Option<PathBuf>,

    /// Path to config file (default: <storage-path>/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new archive from a directory or file
    Create {
        /// Source to import (default: current directory)
        dir: Option<PathBuf>,

        /// Stay online sharing the archive until Ctrl-C
        #[arg(long)]
        seed: bool,

        /// Directory for the archive's private key
        #[arg(long)]
        secret_dir: Option<PathBuf>,
    },

    /// Download an archive from peers
    Download {
        /// Archive key (hex)
        key: String,

        /// Stay online sharing the archive until Ctrl-C
        #[arg(long)]
        seed: bool,

        /// First port to try in the download pool
        #[arg(long)]
        force_port: Option<u16>,
    },

    /// Import a file or directory into a writable archive
    Import {
        /// Archive key (hex)
        key: String,

        /// File or directory to import
        file: PathBuf,
    },

    /// Remove an archive and its local content
    Remove {
        /// Archive key (hex)
        key: String,
    },

    /// List known archives
    List,

    /// Show an archive's status
    Get {
        /// Archive key (hex)
        key: String,
    },

    /// Rejoin every known archive and share until Ctrl-C
    Resume,
}

/// Load the config for `cli`, creating a default file on first use.
pub fn load_config(cli: &Cli) -> Result<ManagerConfig, Box<dyn std::error::Error>> {
    let storage_path = cli
        .storage_path
        .clone()
        .unwrap_or_else(default_storage_path);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&storage_path));

    if !config_path.exists() {
        ManagerConfig::create_default(&config_path, &storage_path)?;
        tracing::info!(path = %config_path.display(), "created default config");
    }
    let mut config = ManagerConfig::load(&config_path)?;
    if cli.storage_path.is_some() {
        config.storage.path = storage_path;
    }
    Ok(config)
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;

    let file_layer = match &logging.file {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(open_log(path)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Block until Ctrl-C.
pub async fn wait_for_shutdown() -> Result<(), Box<dyn std::error::Error>> {
    println!("Sharing. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;
    println!();
    Ok(())
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Logging disabled: {}", e);
    }

    let manager = ArchiveManager::open_local(config).await?;
    let result = dispatch(&manager, cli.command).await;
    if let Err(e) = manager.close().await {
        tracing::warn!(error = %e, "failed to close archive manager");
    }
    result
}

pub async fn dispatch(
    manager: &ArchiveManager,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Create {
            dir,
            seed,
            secret_dir,
        } => create::execute(manager, dir, secret_dir, seed).await,
        Commands::Download {
            key,
            seed,
            force_port,
        } => download::execute(manager, &key, force_port, seed).await,
        Commands::Import { key, file } => import::execute(manager, &key, &file).await,
        Commands::Remove { key } => remove::execute(manager, &key).await,
        Commands::List => list::execute(manager).await,
        Commands::Get { key } => get::execute(manager, &key).await,
        Commands::Resume => resume::execute(manager, true).await,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parse_create() {
        let cli = Cli::parse_from(["swarmvault", "create", "./photos", "--seed"]);

        match cli.command {
            Commands::Create {
                dir,
                seed,
                secret_dir,
            } => {
                assert_eq!(dir, Some(PathBuf::from("./photos")));
                assert!(seed);
                assert_eq!(secret_dir, None);
            }
            _ => panic!("Expected Create command"),
        }
    }

    #[test]
    fn test_cli_parse_create_defaults() {
        let cli = Cli::parse_from(["swarmvault", "create"]);

        match cli.command {
            Commands::Create { dir, seed, .. } => {
                assert_eq!(dir, None);
                assert!(!seed);
            }
            _ => panic!("Expected Create command"),
        }
    }

    #[test]
    fn test_cli_parse_download_with_options() {
        let cli = Cli::parse_from([
            "swarmvault",
            "download",
            "abcd",
            "--force-port",
            "3390",
            "-s",
            "/tmp/sv",
        ]);

        assert_eq!(cli.storage_path, Some(PathBuf::from("/tmp/sv")));
        match cli.command {
            Commands::Download {
                key,
                seed,
                force_port,
            } => {
                assert_eq!(key, "abcd");
                assert!(!seed);
                assert_eq!(force_port, Some(3390));
            }
            _ => panic!("Expected Download command"),
        }
    }

    #[test]
    fn test_cli_parse_import() {
        let cli = Cli::parse_from(["swarmvault", "import", "abcd", "notes.txt"]);

        match cli.command {
            Commands::Import { key, file } => {
                assert_eq!(key, "abcd");
                assert_eq!(file, PathBuf::from("notes.txt"));
            }
            _ => panic!("Expected Import command"),
        }
    }

    #[test]
    fn test_cli_parse_global_config() {
        let cli = Cli::parse_from(["swarmvault", "--config", "/etc/sv.toml", "list"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/sv.toml")));
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn test_cli_parse_remaining_commands() {
        assert!(matches!(
            Cli::parse_from(["swarmvault", "remove", "abcd"]).command,
            Commands::Remove { .. }
        ));
        assert!(matches!(
            Cli::parse_from(["swarmvault", "get", "abcd"]).command,
            Commands::Get { .. }
        ));
        assert!(matches!(
            Cli::parse_from(["swarmvault", "resume"]).command,
            Commands::Resume
        ));
    }

    #[test]
    fn test_load_config_creates_default() {
        let temp_dir = TempDir::new().unwrap();
        let storage = temp_dir.path().join("store");
        let cli = Cli::parse_from([
            "swarmvault",
            "-s",
            storage.to_str().unwrap(),
            "list",
        ]);

        let config = load_config(&cli).unwrap();
        assert_eq!(config.storage.path, storage);
        assert!(default_config_path(&storage).exists());
    }

    #[test]
    fn test_load_config_storage_flag_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("custom.toml");
        ManagerConfig::create_default(&config_path, Path::new("/from/file")).unwrap();

        let from_file = Cli::parse_from([
            "swarmvault",
            "--config",
            config_path.to_str().unwrap(),
            "list",
        ]);
        assert_eq!(
            load_config(&from_file).unwrap().storage.path,
            PathBuf::from("/from/file")
        );

        let overridden = Cli::parse_from([
            "swarmvault",
            "--config",
            config_path.to_str().unwrap(),
            "-s",
            "/from/flag",
            "list",
        ]);
        assert_eq!(
            load_config(&overridden).unwrap().storage.path,
            PathBuf::from("/from/flag")
        );
    }
}
