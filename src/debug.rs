use crate::protocol::{DeliveryClass, Message};
use log::{debug, trace};
use serde::Serialize;
use std::env;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize debug mode from environment variables
///
/// - `CLUSTER_SYNC_DEBUG=1`: log a JSON summary of every routed message
/// - `CLUSTER_SYNC_TRACE=1`: log every transport send and receive
pub fn init_debug_mode() {
    let debug_enabled = env::var("CLUSTER_SYNC_DEBUG").is_ok();
    let trace_enabled = env::var("CLUSTER_SYNC_TRACE").is_ok();

    set_debug_mode(debug_enabled, trace_enabled);

    if debug_enabled {
        debug!("Debug mode enabled - routed messages will be logged as JSON");
    }
    if trace_enabled {
        debug!("Trace mode enabled - transport operations will be logged");
    }
}

pub fn set_debug_mode(debug_enabled: bool, trace_enabled: bool) {
    DEBUG_MODE.store(debug_enabled, Ordering::Relaxed);
    TRACE_MODE.store(trace_enabled, Ordering::Relaxed);
}

/// Check if debug mode is enabled
pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

/// Check if trace mode is enabled
pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSummary {
    pub key: String,
    pub delivery: DeliveryClass,
    pub size: usize,
    pub timestamp_ticks: i64,
}

impl fmt::Display for MessageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' ({:?}, {}, t={})",
            self.key,
            self.delivery,
            format_bytes(self.size),
            self.timestamp_ticks
        )
    }
}

/// Create a debug summary of a message
pub fn message_summary(message: &Message) -> MessageSummary {
    MessageSummary {
        key: message.key.clone(),
        delivery: message.delivery,
        size: message.content.count(),
        timestamp_ticks: message.timestamp.ticks(),
    }
}

/// Log a message summary as JSON if debug mode is enabled
pub fn log_message(direction: &str, message: &Message) {
    if !is_debug_enabled() {
        return;
    }

    match serde_json::to_string(&message_summary(message)) {
        Ok(json) => debug!("{} message: {}", direction, json),
        Err(e) => debug!("Failed to serialize message summary: {}", e),
    }
}

/// Trace a transport send
pub fn trace_transport_send(bytes: usize, destination: &str) {
    if !is_trace_enabled() {
        return;
    }

    trace!("-> Sent {} to {}", format_bytes(bytes), destination);
}

/// Trace a transport receive
pub fn trace_transport_receive(bytes: usize, source: &str) {
    if !is_trace_enabled() {
        return;
    }

    trace!("<- Received {} from {}", format_bytes(bytes), source);
}

/// Trace a snapshot cadence decision
pub fn trace_rate_limit(key: &str, allowed: bool, limit: u32) {
    if !is_trace_enabled() {
        return;
    }

    let status = if allowed { "ALLOWED" } else { "DEFERRED" };
    trace!("Snapshot for '{}' {} (limit: {}/s)", key, status, limit);
}

/// Format bytes in human-readable format (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_stack::ByteStack;
    use crate::clock::Timestamp;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 bytes");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_debug_mode_initialization() {
        // Should not crash without env vars
        init_debug_mode();
    }

    #[test]
    fn test_message_summary() {
        let message = Message::new("car/Transform", ByteStack::from_slice(&[1, 2, 3]), DeliveryClass::Unreliable)
            .with_timestamp(Timestamp::from_ticks(42));
        let summary = message_summary(&message);

        assert_eq!(summary.size, 3);
        assert_eq!(summary.to_string(), "'car/Transform' (Unreliable, 3 bytes, t=42)");

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["key"], "car/Transform");
        assert_eq!(json["delivery"], "Unreliable");
    }
}
