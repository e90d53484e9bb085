/// Utility functions and helpers
pub mod shutdown;

pub use shutdown::Shutdown;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{RutaError, RutaResult};

/// Split a `host:port` backend address. IPv6 hosts use brackets: `[::1]:3306`.
pub fn parse_address(addr: &str) -> RutaResult<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| RutaError::validation(format!("address '{}' must be host:port", addr)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(RutaError::validation(format!("address '{}' has no host", addr)));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| RutaError::validation(format!("address '{}' has an invalid port", addr)))?;
    Ok((host.to_string(), port))
}

/// Quote a schema or table name with backticks
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Seconds since the Unix epoch, for JSON output
pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
