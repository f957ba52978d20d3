//! Process-wide traffic counters
//!
//! Every connection, negotiation and dispatcher reports into one
//! [`Metrics`] instance reachable through [`global_metrics`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),+ $(,)?) => {
        /// Monotonic counters plus the active connection gauge
        #[derive(Debug)]
        pub struct Metrics {
            $($(#[$doc])* pub $name: AtomicU64,)+
            started: Instant,
        }

        impl Metrics {
            pub fn new() -> Self {
                Self {
                    $($name: AtomicU64::new(0),)+
                    started: Instant::now(),
                }
            }

            /// Current values; counters are read independently
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)+
                    uptime_seconds: self.started.elapsed().as_secs(),
                }
            }

            /// Emit the current snapshot as one `info` event
            pub fn log_metrics(&self) {
                let snapshot = self.snapshot();
                info!(
                    $($name = snapshot.$name,)+
                    uptime_seconds = snapshot.uptime_seconds,
                    "Peerlink metrics"
                );
            }
        }

        /// Point-in-time copy of [`Metrics`]
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct MetricsSnapshot {
            $(pub $name: u64,)+
            pub uptime_seconds: u64,
        }
    };
}

counters! {
    connections_total,
    /// Gauge; decremented on close
    connections_active,
    negotiations_total,
    negotiations_success,
    negotiations_failed,
    messages_sent,
    messages_received,
    bytes_sent,
    bytes_received,
    /// Protocol messages whose id matched no declared type
    unknown_messages,
    handler_errors,
    /// Transport failures and framing violations
    connection_errors,
    /// Payloads that failed to decode
    protocol_errors,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn connection_established(&self) {
        bump(&self.connections_total);
        bump(&self.connections_active);
    }

    pub fn connection_closed(&self) {
        // Saturate so a stray double close cannot wrap the gauge
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn negotiation_started(&self) {
        bump(&self.negotiations_total);
    }

    pub fn negotiation_success(&self) {
        bump(&self.negotiations_success);
    }

    pub fn negotiation_failed(&self) {
        bump(&self.negotiations_failed);
    }

    pub fn message_sent(&self, bytes: u64) {
        bump(&self.messages_sent);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn message_received(&self, bytes: u64) {
        bump(&self.messages_received);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn unknown_message(&self) {
        bump(&self.unknown_messages);
    }

    pub fn handler_error(&self) {
        bump(&self.handler_errors);
    }

    pub fn connection_error(&self) {
        bump(&self.connection_errors);
    }

    pub fn protocol_error(&self) {
        bump(&self.protocol_errors);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Logs how long it lived, at `debug`, when dropped
pub struct Timer {
    operation: &'static str,
    started: Instant,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "Timed operation finished"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.connection_established();
        metrics.connection_closed();
        metrics.message_sent(10);
        metrics.message_received(7);
        metrics.unknown_message();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 2);
        assert_eq!(snapshot.connections_active, 1);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.bytes_sent, 10);
        assert_eq!(snapshot.bytes_received, 7);
        assert_eq!(snapshot.unknown_messages, 1);
    }

    #[test]
    fn test_active_gauge_does_not_wrap() {
        let metrics = Metrics::new();
        metrics.connection_closed();
        assert_eq!(metrics.snapshot().connections_active, 0);
    }
}
