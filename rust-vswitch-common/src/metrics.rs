//! Metrics collection for the virtual switch.
//!
//! Counters are updated from the packet pipeline and read by the daemon for
//! periodic reporting.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/* ---------------------------------------------------------------- *
 * Simple Counter
 * ---------------------------------------------------------------- */

#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        let c = Counter::new();
        c.value.store(self.value(), Ordering::Relaxed);
        c
    }
}

/* ---------------------------------------------------------------- *
 * Gauge
 * ---------------------------------------------------------------- */

#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn decrement(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Gauge {
    fn clone(&self) -> Self {
        let g = Gauge::new();
        g.value.store(self.value(), Ordering::Relaxed);
        g
    }
}

/* ---------------------------------------------------------------- *
 * Aggregate metrics for the switch
 * ---------------------------------------------------------------- */

#[derive(Debug, Default, Clone)]
pub struct SwitchMetrics {
    // Frame metrics
    pub frames_received: Counter,
    pub frames_sent: Counter,
    pub frames_dropped: Counter,
    pub broadcasts: Counter,
    pub bytes_received: Counter,
    pub bytes_sent: Counter,

    // Loop detection
    pub loops_detected: Counter,
    pub ifaces_disconnected: Counter,

    // L3 responder
    pub arp_replies: Counter,
    pub ndp_advertisements: Counter,
    pub icmp_echo_replies: Counter,
    pub icmp_errors_sent: Counter,
    /// Number of ARP/NDP requests issued to resolve an unknown mac
    pub resolutions_requested: Counter,

    // L4
    pub tcp_connections_accepted: Counter,
    pub tcp_resets_sent: Counter,
    pub tcp_retransmissions: Counter,
    pub conntrack_entries: Gauge,
}

/// Point-in-time copy of [`SwitchMetrics`], suitable for serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub broadcasts: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub loops_detected: u64,
    pub ifaces_disconnected: u64,
    pub arp_replies: u64,
    pub ndp_advertisements: u64,
    pub icmp_echo_replies: u64,
    pub icmp_errors_sent: u64,
    pub resolutions_requested: u64,
    pub tcp_connections_accepted: u64,
    pub tcp_resets_sent: u64,
    pub tcp_retransmissions: u64,
    pub conntrack_entries: u64,
}

impl SwitchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.value(),
            frames_sent: self.frames_sent.value(),
            frames_dropped: self.frames_dropped.value(),
            broadcasts: self.broadcasts.value(),
            bytes_received: self.bytes_received.value(),
            bytes_sent: self.bytes_sent.value(),
            loops_detected: self.loops_detected.value(),
            ifaces_disconnected: self.ifaces_disconnected.value(),
            arp_replies: self.arp_replies.value(),
            ndp_advertisements: self.ndp_advertisements.value(),
            icmp_echo_replies: self.icmp_echo_replies.value(),
            icmp_errors_sent: self.icmp_errors_sent.value(),
            resolutions_requested: self.resolutions_requested.value(),
            tcp_connections_accepted: self.tcp_connections_accepted.value(),
            tcp_resets_sent: self.tcp_resets_sent.value(),
            tcp_retransmissions: self.tcp_retransmissions.value(),
            conntrack_entries: self.conntrack_entries.value(),
        }
    }
}
