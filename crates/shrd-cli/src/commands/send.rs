//! Send command implementation.

use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use shrd_core::node::{parse_peer_address, Node};
use shrd_core::transfer::{TransferSession, TransferState};
use uuid::Uuid;

use super::SendArgs;
use crate::ui;

/// How long to listen for the target before giving up on an id.
const DISCOVERY_WAIT: Duration = Duration::from_secs(3);

/// Run the send command.
pub async fn run(args: SendArgs, config_path: Option<&Path>) -> Result<()> {
    if !args.file.is_file() {
        bail!("{} is not a file", args.file.display());
    }

    let config = super::load_config(config_path)?;
    let node = Node::start(config).await.context("starting node")?;

    let result = send(&node, &args).await;
    node.shutdown().await;
    result
}

async fn send(node: &Node, args: &SendArgs) -> Result<()> {
    let peer_id = resolve_peer(node, &args.peer).await?;

    let session_id = node
        .send(&peer_id, &args.file)
        .with_context(|| format!("sending to {peer_id}"))?;
    let session = follow(node, session_id, args.timeout).await?;

    match session.state {
        TransferState::Completed => {
            println!(
                "  Sent {} ({}), sha256 {}",
                session.file_name,
                ui::format_bytes(session.file_size),
                session.integrity_digest.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        _ => bail!("transfer failed: {}", failure_reason(session)),
    }
}

/// Print progress of `session_id` until it ends, cancelling it after
/// `timeout` seconds.
pub(super) async fn follow(
    node: &Node,
    session_id: Uuid,
    timeout: Option<u64>,
) -> Result<TransferSession> {
    let mut watch = node.watch_session(session_id)?;

    let wait = async {
        loop {
            let session = watch.borrow_and_update().clone();
            print!("\r  {}", ui::progress_line(&session));
            let _ = io::stdout().flush();
            if session.is_terminal() {
                println!();
                return session;
            }
            if watch.changed().await.is_err() {
                println!();
                return watch.borrow().clone();
            }
        }
    };

    match timeout {
        Some(secs) => {
            if let Ok(session) = tokio::time::timeout(Duration::from_secs(secs), wait).await {
                Ok(session)
            } else {
                node.cancel(session_id)?;
                bail!("transfer did not finish within {secs} seconds");
            }
        }
        None => Ok(wait.await),
    }
}

/// One-line reason for a failed session.
pub(super) fn failure_reason(session: TransferSession) -> String {
    session.failure.map_or_else(
        || "unknown error".to_string(),
        |f| format!("{} ({})", f.reason, f.class),
    )
}

/// Device id for `peer`: an address is paired first, an id must be known.
pub(super) async fn resolve_peer(node: &Node, peer: &str) -> Result<String> {
    if let Ok(addr) = parse_peer_address(peer) {
        let device = node
            .add_device(addr.ip(), addr.port())
            .await
            .with_context(|| format!("pairing with {addr}"))?;
        println!("  Paired with {} ({})", device.display_name, device.id);
        return Ok(device.id);
    }

    // Paired devices start as Unknown; give discovery a moment to hear them.
    let deadline = tokio::time::Instant::now() + DISCOVERY_WAIT;
    loop {
        match node.registry().get(peer) {
            Some(device) if device.is_online() => return Ok(device.id),
            Some(device) if tokio::time::Instant::now() >= deadline => {
                let addr = device.socket_addr();
                let device = node
                    .add_device(addr.ip(), addr.port())
                    .await
                    .with_context(|| format!("device {peer} is {}", device.status))?;
                return Ok(device.id);
            }
            None if tokio::time::Instant::now() >= deadline => {
                bail!("unknown device '{peer}'; run `shrd devices` or pass an address")
            }
            _ => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
}
