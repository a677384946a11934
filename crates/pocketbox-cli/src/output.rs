//! Formatted output helpers for CLI commands.
//!
//! Provides consistent colored status indicators, short identifiers,
//! and human-readable byte formatting.

use pocketbox_common::types::ContainerState;

pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const RED: &str = "\x1b[31m";
pub const YELLOW: &str = "\x1b[33m";
pub const RESET: &str = "\x1b[0m";

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// First twelve characters of an identifier or digest hex.
#[must_use]
pub fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}

/// Colors a state for terminal display.
#[must_use]
pub fn state_label(state: &ContainerState) -> String {
    let color = match state {
        ContainerState::Running => GREEN,
        ContainerState::Dead { .. } => RED,
        ContainerState::Starting | ContainerState::Stopping | ContainerState::Removing => YELLOW,
        _ => DIM,
    };
    format!("{color}{state}{RESET}")
}

/// Exit code a finished container maps to.
#[must_use]
pub const fn exit_code(state: &ContainerState) -> i32 {
    match state {
        ContainerState::Exited {
            exit_code: Some(code),
        } => *code,
        ContainerState::Exited { exit_code: None } => 0,
        _ => 1,
    }
}
