//! Ping command implementation.

use std::path::Path;

use anyhow::{Context, Result};

use shrd_core::node::{parse_peer_address, Node};

use super::PingArgs;

/// Run the ping command.
pub async fn run(args: PingArgs, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let node = Node::start(config).await.context("starting node")?;

    let result = ping(&node, &args).await;
    node.shutdown().await;
    result
}

async fn ping(node: &Node, args: &PingArgs) -> Result<()> {
    // Ids are pinged as they are; a device that is not online yet answers too.
    let peer_id = if parse_peer_address(&args.peer).is_ok() {
        super::send::resolve_peer(node, &args.peer).await?
    } else {
        args.peer.clone()
    };

    for round in 0..args.count {
        if round > 0 {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        let rtt = node
            .ping(&peer_id)
            .await
            .with_context(|| format!("pinging {peer_id}"))?;
        println!("  Reply from {peer_id}: time={:.1}ms", rtt.as_secs_f64() * 1000.0);
    }
    Ok(())
}
