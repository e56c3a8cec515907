//! Info command implementation.

use std::path::Path;

use anyhow::{Context, Result};

use shrd_core::config::Config;
use shrd_core::crypto::{pairing_code, DeviceIdentity};
use shrd_core::node::{advertised_ip, IDENTITY_FILE};

/// Run the info command.
pub fn run(config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let identity_path = Config::data_dir().join(IDENTITY_FILE);
    let identity = DeviceIdentity::load_or_generate(&identity_path)
        .with_context(|| format!("loading {}", identity_path.display()))?;

    let ip = advertised_ip(config.network.bind_address);
    let network = &config.network;

    println!();
    println!("shrd v{}", shrd_core::VERSION);
    println!("{}", "-".repeat(37));
    println!("  Device id:      {}", identity.device_id());
    println!("  Name:           {}", config.general.device_name);
    println!("  Public key:     {}", identity.public_key_base64());
    println!("  Address:        {}:{}", ip, network.port);
    println!("  Pairing code:   {}", pairing_code(identity.device_id(), ip, network.port));
    println!("  Discovery port: {} (UDP)", network.discovery_port);
    println!(
        "  Announcing:     {}",
        match (network.discovery, network.mdns) {
            (true, true) => "UDP beacons and mDNS",
            (true, false) => "UDP beacons",
            (false, true) => "mDNS",
            (false, false) => "off",
        }
    );
    println!("  Downloads:      {}", config.general.download_dir.display());
    println!();
    Ok(())
}
