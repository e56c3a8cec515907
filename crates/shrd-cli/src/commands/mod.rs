//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shrd_core::config::Config;

pub mod add;
pub mod browse;
pub mod config;
pub mod devices;
pub mod info;
pub mod ping;
pub mod send;
pub mod serve;
pub mod trust;

/// Load the configuration from `path`, or from the default location.
///
/// A missing file yields the defaults; a file that exists but cannot be
/// parsed is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.map_or_else(Config::config_path, Path::to_path_buf);
    tracing::debug!(path = %path.display(), "Loading configuration");
    Config::load_from(&path).with_context(|| format!("loading {}", path.display()))
}

/// shrd - LAN device presence and encrypted file transfer
#[derive(Parser)]
#[command(name = "shrd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,

    /// Detailed logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file to use instead of the default one
    #[arg(long, global = true, env = "SHRD_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Stay reachable and receive files until Ctrl-C
    Serve(ServeArgs),

    /// Send a file to a device
    Send(SendArgs),

    /// List a directory shared by a paired device
    Browse(BrowseArgs),

    /// Download a file from a paired device's shared directory
    Get(GetArgs),

    /// Check that a device answers
    Ping(PingArgs),

    /// List devices on the network
    Devices(DevicesArgs),

    /// Pair with a device by address
    Add(AddArgs),

    /// Manage paired devices
    Trust(TrustArgs),

    /// Show this device's id, name and pairing code
    Info,

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Parser)]
pub struct ServeArgs {
    /// Accept files from any device, not only paired ones
    #[arg(long)]
    pub auto_accept: bool,

    /// Directory for received files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Let paired devices browse and download from this directory
    #[arg(long, value_name = "DIR")]
    pub share: Option<PathBuf>,
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Device id, or an address as HOST[:PORT]
    pub peer: String,

    /// File to send
    pub file: PathBuf,

    /// Give up after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Arguments for the browse command
#[derive(Parser)]
pub struct BrowseArgs {
    /// Device id, or an address as HOST[:PORT]
    pub peer: String,

    /// Directory inside the peer's shared directory
    #[arg(default_value = "")]
    pub path: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the get command
#[derive(Parser)]
pub struct GetArgs {
    /// Device id, or an address as HOST[:PORT]
    pub peer: String,

    /// File inside the peer's shared directory
    pub remote_path: String,

    /// Directory for the downloaded file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Give up after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Arguments for the ping command
#[derive(Parser)]
pub struct PingArgs {
    /// Device id, or an address as HOST[:PORT]
    pub peer: String,

    /// Number of pings
    #[arg(short, long, default_value = "1")]
    pub count: u32,
}

/// Arguments for the devices command
#[derive(Parser)]
pub struct DevicesArgs {
    /// Seconds to listen for announcements
    #[arg(short, long, default_value = "3")]
    pub wait: u64,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the add command
#[derive(Parser)]
pub struct AddArgs {
    /// Address of the device (IP, IP:PORT or [IPv6]:PORT)
    pub host: String,

    /// Transfer port, when not part of HOST
    #[arg(short, long)]
    pub port: Option<u16>,
}

/// Arguments for the trust command
#[derive(Parser)]
pub struct TrustArgs {
    /// Trust subcommand
    #[command(subcommand)]
    pub action: TrustAction,
}

/// Trust subcommands
#[derive(Subcommand)]
pub enum TrustAction {
    /// List paired devices
    List,

    /// Forget a paired device
    Remove {
        /// Device id
        device: String,
    },
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Reset to defaults
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["shrd", "send", "10.0.0.2", "a.txt", "-v"]).unwrap();
        assert!(cli.verbose);
        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.peer, "10.0.0.2");
        assert_eq!(args.file, PathBuf::from("a.txt"));
    }

    #[test]
    fn test_browse_and_get_arguments() {
        let cli = Cli::try_parse_from(["shrd", "browse", "3f9a1c2b7d4e8f60"]).unwrap();
        let Command::Browse(args) = cli.command else {
            panic!("expected browse");
        };
        assert_eq!(args.path, "");
        assert!(!args.json);

        let cli = Cli::try_parse_from([
            "shrd",
            "get",
            "10.0.0.2:9000",
            "photos/beach.jpg",
            "-o",
            "/tmp/in",
        ])
        .unwrap();
        let Command::Get(args) = cli.command else {
            panic!("expected get");
        };
        assert_eq!(args.remote_path, "photos/beach.jpg");
        assert_eq!(args.output, Some(PathBuf::from("/tmp/in")));

        let cli = Cli::try_parse_from(["shrd", "serve", "--share", "/srv/public"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.share, Some(PathBuf::from("/srv/public")));
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["shrd", "info", "-v", "-q"]).is_err());
    }

    #[test]
    fn test_load_config_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(dir.path().join("none.toml").as_path())).unwrap();
        assert_eq!(config.network.port, shrd_core::DEFAULT_PORT);
    }

    #[test]
    fn test_load_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[network\nport = ").unwrap();
        let err = load_config(Some(path.as_path())).unwrap_err();
        assert!(format!("{err:#}").contains("broken.toml"));
    }
}
