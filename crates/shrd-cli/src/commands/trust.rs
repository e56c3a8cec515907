//! Trust command implementation.

use anyhow::{Context, Result};

use shrd_core::config::Config;
use shrd_core::node::TRUST_FILE;
use shrd_core::trust::TrustStore;

use super::{TrustAction, TrustArgs};

/// Run the trust command.
pub fn run(args: TrustArgs) -> Result<()> {
    let path = Config::data_dir().join(TRUST_FILE);
    let mut trust_store = TrustStore::load_from(path.clone())
        .with_context(|| format!("loading {}", path.display()))?;

    match args.action {
        TrustAction::List => {
            let devices = trust_store.list();
            if devices.is_empty() {
                println!("No paired devices.");
            } else {
                println!();
                println!("Paired Devices:");
                println!("{}", "─".repeat(60));
                for device in devices {
                    let address = device
                        .address()
                        .map_or_else(|| "-".to_string(), |(ip, port)| format!("{ip}:{port}"));
                    println!(
                        "  {} - {} at {} (paired {})",
                        device.device_id,
                        device.device_name,
                        address,
                        device.paired_at.format("%Y-%m-%d %H:%M")
                    );
                }
                println!("{}", "─".repeat(60));
            }
        }

        TrustAction::Remove { device } => {
            if trust_store.remove(&device)? {
                println!("Removed device: {}", device);
            } else {
                println!("Device not found: {}", device);
            }
        }
    }

    Ok(())
}
