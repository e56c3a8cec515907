//! shrd CLI - find devices on the LAN and send them files
//!
//! ## Quick Start
//!
//! ```bash
//! # Keep a device reachable and accept files
//! shrd serve --auto-accept
//!
//! # On another machine
//! shrd devices
//! shrd send 192.168.1.20 ./report.pdf
//!
//! # Fetch from a paired device running `shrd serve --share ~/Public`
//! shrd browse 192.168.1.20
//! shrd get 192.168.1.20 photos/beach.jpg
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]
#![allow(clippy::cast_precision_loss)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Serve(args) => commands::serve::run(args, config_path).await,
        Command::Send(args) => commands::send::run(args, config_path).await,
        Command::Browse(args) => commands::browse::run(args, config_path).await,
        Command::Get(args) => commands::browse::get(args, config_path).await,
        Command::Ping(args) => commands::ping::run(args, config_path).await,
        Command::Devices(args) => commands::devices::run(args, config_path).await,
        Command::Add(args) => commands::add::run(args, config_path).await,
        Command::Trust(args) => commands::trust::run(args),
        Command::Info => commands::info::run(config_path),
        Command::Config(args) => commands::config::run(args, config_path),
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "info,shrd=debug,shrd_core=debug"
    } else if quiet {
        "error"
    } else {
        "warn,shrd=info,shrd_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
