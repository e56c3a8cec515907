//! Serve command implementation.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio_stream::StreamExt;

use shrd_core::node::Node;

use super::ServeArgs;
use crate::ui;

/// Run the serve command.
pub async fn run(args: ServeArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if args.auto_accept {
        config.general.auto_accept = true;
    }
    if let Some(output) = args.output {
        config.general.download_dir = output;
    }
    if let Some(share) = args.share {
        if !share.is_dir() {
            bail!("{} is not a directory", share.display());
        }
        config.general.share_dir = Some(share);
    }

    let download_dir = config.general.download_dir.clone();
    let auto_accept = config.general.auto_accept;
    let share_dir = config.general.share_dir.clone();
    let node = Node::start(config).await.context("starting node")?;
    let mut events = node.subscribe_status();

    println!();
    println!("shrd v{}", shrd_core::VERSION);
    println!("{}", "-".repeat(37));
    println!("  Device:       {} ({})", node.display_name(), node.device_id());
    println!("  Listening on: {}", node.local_addr());
    println!("  Pairing code: {}", node.pairing_code());
    println!("  Saving to:    {}", download_dir.display());
    if let Some(share_dir) = &share_dir {
        println!("  Sharing:      {} (paired devices)", share_dir.display());
    }
    if !auto_accept {
        println!("  Accepting files from paired devices only");
    }
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl+C")?;
                break;
            }
            event = events.next() => {
                let Some(event) = event else { break };
                if let Some(line) = ui::describe_event(&event) {
                    println!("  {line}");
                }
            }
        }
    }

    println!();
    println!("  Stopping...");
    node.shutdown().await;
    Ok(())
}
