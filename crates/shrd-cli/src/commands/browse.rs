//! Browse and get command implementations.

use std::path::Path;

use anyhow::{bail, Context, Result};

use shrd_core::node::Node;
use shrd_core::transfer::TransferState;

use super::{BrowseArgs, GetArgs};
use crate::ui;

/// Run the browse command.
pub async fn run(args: BrowseArgs, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let node = Node::start(config).await.context("starting node")?;

    let result = browse(&node, &args).await;
    node.shutdown().await;
    result
}

async fn browse(node: &Node, args: &BrowseArgs) -> Result<()> {
    let peer_id = super::send::resolve_peer(node, &args.peer).await?;
    let listing = node
        .browse(&peer_id, &args.path)
        .await
        .with_context(|| format!("browsing {peer_id}"))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    println!();
    println!("  /{}", listing.path);
    if listing.entries.is_empty() {
        println!("  (empty)");
    }
    for entry in &listing.entries {
        if entry.is_dir {
            println!("  {:>10}  {}/", "-", entry.name);
        } else {
            println!("  {:>10}  {}", ui::format_bytes(entry.size), entry.name);
        }
    }
    println!();
    Ok(())
}

/// Run the get command.
pub async fn get(args: GetArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(output) = args.output.clone() {
        config.general.download_dir = output;
    }
    let node = Node::start(config).await.context("starting node")?;

    let result = download(&node, &args).await;
    node.shutdown().await;
    result
}

async fn download(node: &Node, args: &GetArgs) -> Result<()> {
    let peer_id = super::send::resolve_peer(node, &args.peer).await?;
    let session_id = node
        .download(&peer_id, &args.remote_path)
        .with_context(|| format!("downloading from {peer_id}"))?;
    let session = super::send::follow(node, session_id, args.timeout).await?;

    if session.state != TransferState::Completed {
        bail!("download failed: {}", super::send::failure_reason(session));
    }
    let saved = session
        .saved_path
        .as_deref()
        .map_or_else(|| session.file_name.clone(), |p| p.display().to_string());
    println!(
        "  Saved {} ({}), sha256 {}",
        saved,
        ui::format_bytes(session.file_size),
        session.integrity_digest.as_deref().unwrap_or("-")
    );
    Ok(())
}
