//! UI utilities for the shrd CLI.

use shrd_core::events::StatusEvent;
use shrd_core::registry::Device;
use shrd_core::transfer::{Direction, TransferSession};

const BAR_WIDTH: usize = 30;

/// Human-readable byte count ("1.5 MB").
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// One-line progress bar for a session.
pub fn progress_line(session: &TransferSession) -> String {
    let percent = session.percentage();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let filled = ((percent / 100.0) * BAR_WIDTH as f64).round() as usize;
    let filled = filled.min(BAR_WIDTH);

    format!(
        "[{}{}] {:>5.1}%  {} / {}  {}",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled),
        percent,
        format_bytes(session.bytes_transferred),
        format_bytes(session.file_size),
        session.state
    )
}

/// Table row for a device.
pub fn device_row(device: &Device) -> String {
    let mut name = device.display_name.clone();
    if device.trusted {
        name.push_str(" *");
    }
    format!(
        "  {:<18} {:<24} {:<22} {}",
        device.id,
        name,
        device.socket_addr(),
        device.status
    )
}

/// Message for a status event, `None` for events not worth a line.
pub fn describe_event(event: &StatusEvent) -> Option<String> {
    match event {
        StatusEvent::DeviceDiscovered { device } => Some(format!(
            "Discovered {} ({}) at {}",
            device.display_name,
            device.id,
            device.socket_addr()
        )),
        StatusEvent::DeviceOnline { id } => Some(format!("Device {id} is online")),
        StatusEvent::DeviceOffline { id } => Some(format!("Device {id} went offline")),
        StatusEvent::DeviceRemoved { id } => Some(format!("Device {id} removed")),
        StatusEvent::TransferStarted { session } => Some(format!(
            "{} {} ({}) {} {}",
            match session.direction {
                Direction::Send => "Sending",
                Direction::Receive => "Receiving",
            },
            session.file_name,
            format_bytes(session.file_size),
            match session.direction {
                Direction::Send => "to",
                Direction::Receive => "from",
            },
            session.peer_id
        )),
        StatusEvent::TransferProgress { .. } => None,
        StatusEvent::TransferCompleted { session } => Some(match &session.saved_path {
            Some(path) => format!("Saved {}", path.display()),
            None => format!("Sent {}", session.file_name),
        }),
        StatusEvent::TransferAborted { session, class, reason } => Some(format!(
            "Transfer of {} aborted ({class}): {reason}",
            session.file_name
        )),
        StatusEvent::SecurityWarning {
            address,
            device_id,
            reason,
        } => Some(format!(
            "WARNING: authentication failed for {} at {}: {reason}",
            device_id.as_deref().unwrap_or("unknown device"),
            address.map_or_else(|| "unknown address".to_string(), |a| a.to_string()),
        )),
    }
}
