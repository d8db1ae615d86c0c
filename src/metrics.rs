//! Metric helpers for `wirebridge`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate. Without the
//! `metrics` feature every helper is a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking channels owned by event loops.
pub const CHANNELS_ACTIVE: &str = "wirebridge_channels_active";
/// Name of the counter tracking messages crossing the bridge.
pub const MESSAGES_PROCESSED: &str = "wirebridge_messages_total";
/// Name of the counter tracking inbound messages discarded because no
/// consumer remained.
pub const INBOUND_DROPPED: &str = "wirebridge_inbound_dropped_total";
/// Name of the counter tracking captured channel errors.
pub const ERRORS_TOTAL: &str = "wirebridge_errors_total";

/// Direction of message flow.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Messages received from the peer.
    Inbound,
    /// Messages written towards the peer.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active channels gauge.
pub fn inc_channels() {
    #[cfg(feature = "metrics")]
    gauge!(CHANNELS_ACTIVE).increment(1.0);
}

/// Decrement the active channels gauge.
pub fn dec_channels() {
    #[cfg(feature = "metrics")]
    gauge!(CHANNELS_ACTIVE).decrement(1.0);
}

/// Record a message for the given direction.
pub fn inc_messages(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_PROCESSED, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record `count` inbound messages dropped for lack of a consumer.
pub fn inc_dropped(count: u64) {
    #[cfg(feature = "metrics")]
    counter!(INBOUND_DROPPED).increment(count);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Record a captured channel error.
pub fn inc_errors() {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL).increment(1);
}
