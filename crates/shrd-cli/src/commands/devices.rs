//! Devices command implementation.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use shrd_core::node::Node;
use shrd_core::registry::Device;

use super::DevicesArgs;
use crate::ui;

/// Run the devices command.
pub async fn run(args: DevicesArgs, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let node = Node::start(config).await.context("starting node")?;

    if !args.json {
        println!();
        println!("  Listening for {}s...", args.wait);
    }
    tokio::time::sleep(Duration::from_secs(args.wait)).await;

    let snapshot = node.list_devices();
    let mut devices: Vec<&Device> = snapshot.iter().collect();
    devices.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));

    if args.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!();
        println!("  No devices found.");
        println!();
    } else {
        println!();
        println!(
            "  {:<18} {:<24} {:<22} {}",
            "ID", "NAME", "ADDRESS", "STATUS"
        );
        println!("  {}", "-".repeat(72));
        for device in devices {
            println!("{}", ui::device_row(device));
        }
        println!();
        println!("  * paired");
        println!();
    }

    node.shutdown().await;
    Ok(())
}
