use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::Config;
use crate::pairing::PairingStore;

pub mod commands;

use commands::RunOptions;

#[derive(Parser)]
#[command(name = "clipmirror")]
#[command(about = "Mirror the clipboard between paired devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Print this device's identity")]
    Id,

    #[command(about = "Pair with a device using its pairing code")]
    Pair {
        /// Code in the form deviceId|tag|keyHex
        code: String,

        #[arg(short, long)]
        name: Option<String>,
    },

    #[command(about = "Remove a paired device")]
    Unpair {
        /// Record id as shown by `devices`
        id: String,
    },

    #[command(about = "List paired devices")]
    Devices,

    #[command(about = "Connect to the peer and mirror the clipboard")]
    Run {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Read clipboard changes from stdin instead of the system clipboard
        #[arg(long)]
        stdin: bool,
    },

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    #[command(about = "Show version and build information")]
    Version,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Generate example configuration")]
    Init {
        #[arg(long)]
        force: bool,
    },
}

pub struct CliHandler {
    config: Arc<Config>,
    config_path: Option<PathBuf>,
}

impl CliHandler {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config = Config::load_config(config_path.as_deref())
            .context("Failed to load configuration")?;

        Ok(Self {
            config: Arc::new(config),
            config_path,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn open_store(&self) -> Result<PairingStore> {
        crate::open_pairing_store(&self.config).await.with_context(|| {
            format!(
                "Failed to load pairing data from {}",
                self.config.data_dir.display()
            )
        })
    }

    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Id => self.show_id().await,
            Commands::Pair { code, name } => self.pair(&code, name.as_deref()).await,
            Commands::Unpair { id } => self.unpair(&id).await,
            Commands::Devices => self.show_devices().await,
            Commands::Run { host, port, stdin } => {
                let store = self.open_store().await?;
                commands::run_session(
                    &self.config,
                    store,
                    RunOptions {
                        host,
                        port,
                        use_stdin: stdin,
                    },
                )
                .await
            }
            Commands::Config { action } => self.handle_config_action(action),
            Commands::Version => {
                show_version();
                Ok(())
            }
        }
    }

    async fn show_id(&self) -> Result<()> {
        let store = self.open_store().await?;
        println!("{}", store.device_id().await?);
        Ok(())
    }

    async fn pair(&self, code: &str, name: Option<&str>) -> Result<()> {
        let store = self.open_store().await?;
        let device = match name {
            Some(name) => store.add_paired_device_with_name(code, name).await,
            None => store.add_paired_device(code).await,
        }
        .context("Pairing rejected")?;

        info!(remote_device_id = %device.remote_device_id, "Pairing stored");
        println!(
            "Paired with {} ({}), key fingerprint {}",
            device.name,
            device.remote_device_id,
            device.shared_key.fingerprint()
        );
        Ok(())
    }

    async fn unpair(&self, id: &str) -> Result<()> {
        let store = self.open_store().await?;
        let removed = store.remove_paired_device(id).await?;
        println!("Removed {} ({})", removed.name, removed.remote_device_id);
        Ok(())
    }

    async fn show_devices(&self) -> Result<()> {
        let store = self.open_store().await?;
        let devices = store.paired_devices().await;

        if devices.is_empty() {
            println!("No paired devices");
            return Ok(());
        }

        println!("Paired Devices ({}):", devices.len());
        for device in devices {
            println!(
                "  {}  {} - {}  key {}  added {}",
                device.id,
                device.remote_device_id,
                device.name,
                device.shared_key.fingerprint(),
                format_millis(device.date_added)
            );
        }

        Ok(())
    }

    fn handle_config_action(&self, action: ConfigAction) -> Result<()> {
        match action {
            ConfigAction::Show => {
                println!("Current Configuration:");
                print!("{}", toml::to_string_pretty(self.config.as_ref())?);
            }
            ConfigAction::Init { force } => {
                let path = match &self.config_path {
                    Some(path) => path.clone(),
                    None => Config::default_path()?,
                };
                Config::write_example(&path, force)?;
                println!("Example configuration written to {}", path.display());
            }
        }
        Ok(())
    }
}

fn show_version() {
    println!("clipmirror {}", crate::VERSION);
    println!("  Target:  {}", env!("TARGET"));
    println!("  Profile: {}", env!("PROFILE"));
    println!("  Rustc:   {}", env!("RUSTC_VERSION"));
    println!("  Built:   {}", env!("BUILD_DATE"));
}

fn format_millis(millis: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(millis) {
        Some(date) => date.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => millis.to_string(),
    }
}
