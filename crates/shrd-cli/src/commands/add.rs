//! Add command implementation.

use std::path::Path;

use anyhow::{Context, Result};

use shrd_core::node::{parse_peer_address, Node};

use super::AddArgs;

/// Run the add command.
pub async fn run(args: AddArgs, config_path: Option<&Path>) -> Result<()> {
    let mut addr = parse_peer_address(&args.host)?;
    if let Some(port) = args.port {
        addr.set_port(port);
    }

    let mut config = super::load_config(config_path)?;
    // Pairing only needs an outbound connection.
    config.network.discovery = false;
    config.network.mdns = false;
    config.network.port = 0;
    let node = Node::start(config).await.context("starting node")?;

    let result = node
        .add_device(addr.ip(), addr.port())
        .await
        .with_context(|| format!("pairing with {addr}"));
    node.shutdown().await;
    let device = result?;

    println!();
    println!("  Paired with {} ({})", device.display_name, device.id);
    println!("  Compare this code with the one shown on the other device:");
    println!(
        "  {}",
        shrd_core::crypto::pairing_code(&device.id, addr.ip(), addr.port())
    );
    println!();
    Ok(())
}
