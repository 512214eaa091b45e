//! Heartbeat payload sizing for queued SSE connections.
//!
//! Heartbeats are SSE comments filled with random base64 so intermediaries
//! cannot buffer-collapse them. Above the load threshold the padding grows
//! quadratically, which doubles as cheap backpressure against clients that
//! hold many idle connections.

use std::time::Duration;

use base64::Engine;
use rand::RngCore;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// If the join comment cannot be flushed within this window, the socket is
/// considered dead.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive heartbeats allowed to miss the half-expected-bytes mark
/// before the connection is destroyed.
pub const MAX_MONITOR_STRIKES: u32 = 3;

const MIN_PAYLOAD: usize = 64;
const MAX_PAYLOAD: usize = 16 * 1024;
const PAYLOAD_SCALE_FACTOR: usize = 4;

/// Padding size for the current queue load.
pub fn payload_size(load: usize, load_threshold: usize) -> usize {
    if load <= load_threshold {
        return MIN_PAYLOAD;
    }
    let over = load - load_threshold;
    MIN_PAYLOAD
        .saturating_add(over * over * PAYLOAD_SCALE_FACTOR * PAYLOAD_SCALE_FACTOR)
        .min(MAX_PAYLOAD)
}

/// A heartbeat comment body of `size` base64 characters.
pub fn payload(size: usize) -> String {
    let mut raw = vec![0u8; size.div_ceil(4) * 3];
    rand::rng().fill_bytes(&mut raw);
    let mut encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(raw);
    encoded.truncate(size);
    encoded
}

/// Tracks flushed bytes between heartbeats; a client that drains less than
/// half of what was written accumulates strikes.
#[derive(Debug, Default)]
pub struct FlushMonitor {
    expected: usize,
    flushed: usize,
    strikes: u32,
}

impl FlushMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_write(&mut self, bytes: usize) {
        self.expected += bytes;
    }

    pub fn on_flush(&mut self, bytes: usize) {
        self.flushed += bytes;
    }

    /// Interval rollover. Returns `true` when the connection should be
    /// destroyed.
    pub fn on_interval(&mut self) -> bool {
        if self.expected > 0 && self.flushed * 2 < self.expected {
            self.strikes += 1;
        } else {
            self.strikes = 0;
        }
        self.expected = 0;
        self.flushed = 0;
        self.strikes >= MAX_MONITOR_STRIKES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_grows_quadratically_past_threshold() {
        assert_eq!(payload_size(10, 50), MIN_PAYLOAD);
        assert_eq!(payload_size(50, 50), MIN_PAYLOAD);
        let a = payload_size(55, 50);
        let b = payload_size(60, 50);
        assert!(a > MIN_PAYLOAD);
        assert!(b > a);
        assert!(payload_size(10_000, 50) <= MAX_PAYLOAD);
    }

    #[test]
    fn payload_has_requested_size() {
        assert_eq!(payload(64).len(), 64);
        assert_eq!(payload(100).len(), 100);
    }

    #[test]
    fn three_starved_intervals_destroy_the_connection() {
        let mut monitor = FlushMonitor::new();
        monitor.on_write(100);
        monitor.on_flush(10);
        assert!(!monitor.on_interval());
        monitor.on_write(100);
        monitor.on_flush(0);
        assert!(!monitor.on_interval());
        monitor.on_write(100);
        monitor.on_flush(49);
        assert!(monitor.on_interval());
    }

    #[test]
    fn healthy_interval_clears_strikes() {
        let mut monitor = FlushMonitor::new();
        monitor.on_write(100);
        monitor.on_flush(0);
        assert!(!monitor.on_interval());
        monitor.on_write(100);
        monitor.on_flush(100);
        assert!(!monitor.on_interval());
        monitor.on_write(100);
        monitor.on_flush(0);
        assert!(!monitor.on_interval());
    }
}
