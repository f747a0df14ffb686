//! badgelink - Command-line interface for badges speaking the WebUSB protocol
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use badgelink_client::config::parse_usb_id;
use badgelink_client::{Client, ClientConfig, NusbTransport};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub type BadgeClient = Client<NusbTransport>;

#[derive(Parser)]
#[command(name = "badgelink")]
#[command(about = "Manage files, apps and settings on a badge over USB")]
#[command(version)]
pub struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "BADGELINK_CONFIG")]
    config: Option<PathBuf>,

    /// USB vendor id (hex with 0x prefix, or decimal)
    #[arg(long, value_parser = parse_id_arg)]
    vendor_id: Option<u16>,

    /// USB product id (hex with 0x prefix, or decimal)
    #[arg(long, value_parser = parse_id_arg)]
    product_id: Option<u16>,

    /// Interface number, or "auto" to pick the first vendor-specific one
    #[arg(short, long, value_parser = parse_interface_arg)]
    interface: Option<InterfaceArg>,

    /// Request timeout in milliseconds
    #[arg(long, value_name = "MS")]
    timeout: Option<u64>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceArg {
    Auto,
    Number(u8),
}

fn parse_id_arg(s: &str) -> Result<u16, String> {
    parse_usb_id(s).ok_or_else(|| format!("invalid USB id '{}'", s))
}

fn parse_interface_arg(s: &str) -> Result<InterfaceArg, String> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(InterfaceArg::Auto);
    }
    s.parse()
        .map(InterfaceArg::Number)
        .map_err(|_| format!("invalid interface '{}'", s))
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Show device, protocol and firmware information
    Info,

    /// Send data and check the echo
    Ping {
        /// Text to send
        #[arg(default_value = "badgelink")]
        data: String,
    },

    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Show storage usage
    Stat,

    /// Check whether a path exists
    Exists { path: String },

    /// Create a directory
    Mkdir { path: String },

    /// Remove a file or directory
    Rm { path: String },

    /// Download a file
    Get {
        /// Path on the badge
        remote: String,

        /// Local destination (defaults to the remote file name)
        local: Option<PathBuf>,
    },

    /// Upload a file
    Put {
        /// Local file
        local: PathBuf,

        /// Path on the badge
        remote: String,
    },

    /// List installed apps
    Apps,

    /// Download an installed app
    AppGet {
        /// App slug
        name: String,

        /// Local destination (defaults to the app name)
        local: Option<PathBuf>,
    },

    /// Install an app
    AppPut {
        /// Local app binary
        local: PathBuf,

        /// App slug
        #[arg(short, long)]
        name: String,

        /// Display title (defaults to the slug)
        #[arg(short, long)]
        title: Option<String>,

        /// Version number
        #[arg(short = 'V', long, default_value = "0")]
        version: u16,
    },

    /// Remove an installed app
    AppRm { name: String },

    /// Start an app (the badge reboots into it)
    AppRun { name: String },

    /// List stored settings
    NvsLs {
        /// Namespace to list (all if omitted)
        #[arg(default_value = "")]
        namespace: String,
    },

    /// Read a setting
    NvsGet {
        namespace: String,
        key: String,
        /// Value type: u8, i8, u16, i16, u32, i32, u64, i64, string or blob
        #[arg(value_name = "TYPE")]
        value_type: String,
    },

    /// Write a setting
    NvsSet {
        namespace: String,
        key: String,
        /// Value type: u8, i8, u16, i16, u32, i32, u64, i64, string or blob
        #[arg(value_name = "TYPE")]
        value_type: String,
        /// Value (blobs as hex)
        value: String,
    },

    /// Remove a setting
    NvsRm { namespace: String, key: String },
}

impl Cli {
    /// Loads the configuration and applies command-line overrides.
    fn client_config(&self) -> Result<ClientConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = ClientConfig::from_file(path)?;
                config.apply_env_overrides();
                config
            }
            None => ClientConfig::from_env(),
        };

        if self.vendor_id.is_some() || self.product_id.is_some() {
            let vendor_id = self.vendor_id.unwrap_or(config.usb.vendor_id);
            let product_id = self.product_id.unwrap_or(config.usb.product_id);
            config = config.with_device(vendor_id, product_id);
        }
        match self.interface {
            Some(InterfaceArg::Auto) => config = config.with_interface(None),
            Some(InterfaceArg::Number(n)) => config = config.with_interface(Some(n)),
            None => {}
        }

        if let Some(ms) = self.timeout {
            config = config.with_request_timeout(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.client_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(2);
        }
    };
    let reset = config.usb.reset_on_disconnect;
    let transport = Arc::new(NusbTransport::new(config.usb.vendor_id, config.usb.product_id));
    let client = Client::new(transport, config);

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, cli.json).await?;
        }
        Some(cmd) => {
            // Connect for one-shot command
            client.connect().await.map_err(|e| {
                eprintln!("{}: {}", "Connection failed".red(), e);
                e
            })?;

            let result = commands::execute(&client, cmd, cli.json).await;

            // Fails with NotConnected after a started app tore the link down.
            if let Err(e) = client.disconnect(reset).await {
                tracing::debug!("disconnect: {}", e);
            }

            match result {
                Ok(output) => {
                    if !output.is_empty() {
                        println!("{}", output);
                    }
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
