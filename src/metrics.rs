//! Metric helpers for `basalt-rpc`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled the helpers compile to no-ops.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking open connections.
pub const CONNECTIONS_OPEN: &str = "basalt_rpc_connections_open";
/// Name of the counter tracking bytes received, length prefixes included.
pub const BYTES_RECEIVED: &str = "basalt_rpc_bytes_received_total";
/// Name of the counter tracking bytes successfully written.
pub const BYTES_SENT: &str = "basalt_rpc_bytes_sent_total";
/// Name of the counter tracking fallback-to-simple authentications.
pub const AUTH_FALLBACKS: &str = "basalt_rpc_auth_fallbacks_total";
/// Name of the counter tracking connection-level errors.
pub const ERRORS_TOTAL: &str = "basalt_rpc_errors_total";

/// Increment the open connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_OPEN).increment(1.0);
}

/// Decrement the open connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_OPEN).decrement(1.0);
}

/// Record bytes received from a client.
pub fn add_received_bytes(count: u64) {
    #[cfg(feature = "metrics")]
    counter!(BYTES_RECEIVED).increment(count);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Record bytes successfully written to a client.
pub fn add_sent_bytes(count: u64) {
    #[cfg(feature = "metrics")]
    counter!(BYTES_SENT).increment(count);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Record an authentication that proceeded via fallback to simple auth.
pub fn inc_auth_fallbacks() {
    #[cfg(feature = "metrics")]
    counter!(AUTH_FALLBACKS).increment(1);
}

/// Record a connection-level error.
pub fn inc_errors() {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL).increment(1);
}
