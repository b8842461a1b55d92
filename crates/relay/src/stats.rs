//! Relay counters.
//!
//! Every counter is kept twice: in an atomic for `get_stats` and in the
//! `metrics` facade for Prometheus.

use std::sync::atomic::{AtomicU64, Ordering};

use outbox_store::{OutboxStatus, StatusCounts};
use serde::Serialize;

/// Cumulative counters since the relay was created.
#[derive(Debug, Default)]
pub struct RelayStats {
    messages_processed: AtomicU64,
    messages_published: AtomicU64,
    messages_failed_transient: AtomicU64,
    messages_dead_lettered: AtomicU64,
    leases_reclaimed: AtomicU64,
    leases_lost: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("outbox_messages_processed_total").increment(1);
    }

    pub fn record_published(&self, event_type: &str) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("outbox_messages_published_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    pub fn record_failed_transient(&self, event_type: &str) {
        self.messages_failed_transient
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("outbox_messages_failed_transient_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    pub fn record_dead_lettered(&self, event_type: &str) {
        self.messages_dead_lettered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("outbox_messages_dead_lettered_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    pub fn record_leases_reclaimed(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.leases_reclaimed.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("outbox_leases_reclaimed_total").increment(count);
    }

    pub fn record_lease_lost(&self) {
        self.leases_lost.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("outbox_leases_lost_total").increment(1);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_failed_transient: self.messages_failed_transient.load(Ordering::Relaxed),
            messages_dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
            leases_reclaimed: self.leases_reclaimed.load(Ordering::Relaxed),
            leases_lost: self.leases_lost.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub messages_processed: u64,
    pub messages_published: u64,
    pub messages_failed_transient: u64,
    pub messages_dead_lettered: u64,
    pub leases_reclaimed: u64,
    pub leases_lost: u64,
}

/// Relay counters plus the current breakdown of outbox rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    #[serde(flatten)]
    pub relay: RelayStatsSnapshot,
    pub rows: StatusCounts,
}

impl OutboxStats {
    /// Pushes the row breakdown to the `outbox_rows` gauge.
    pub fn export_gauges(&self) {
        for status in OutboxStatus::ALL {
            metrics::gauge!("outbox_rows", "status" => status.as_str())
                .set(self.rows.get(status) as f64);
        }
        metrics::gauge!("outbox_rows", "status" => "failed_transient")
            .set(self.rows.failed_transient as f64);
    }
}

impl std::fmt::Display for OutboxStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed={} published={} failed_transient={} dead_lettered={} \
             leases_reclaimed={} leases_lost={} | rows: pending={} processing={} \
             published={} dead={}",
            self.relay.messages_processed,
            self.relay.messages_published,
            self.relay.messages_failed_transient,
            self.relay.messages_dead_lettered,
            self.relay.leases_reclaimed,
            self.relay.leases_lost,
            self.rows.pending,
            self.rows.processing,
            self.rows.published,
            self.rows.dead
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = RelayStats::new();
        stats.record_processed();
        stats.record_processed();
        stats.record_published("OrderCreated");
        stats.record_failed_transient("OrderCreated");
        stats.record_dead_lettered("OrderCreated");
        stats.record_leases_reclaimed(3);
        stats.record_leases_reclaimed(0);
        stats.record_lease_lost();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_processed, 2);
        assert_eq!(snapshot.messages_published, 1);
        assert_eq!(snapshot.messages_failed_transient, 1);
        assert_eq!(snapshot.messages_dead_lettered, 1);
        assert_eq!(snapshot.leases_reclaimed, 3);
        assert_eq!(snapshot.leases_lost, 1);
    }

    #[test]
    fn stats_serialize_flat() {
        let stats = OutboxStats {
            relay: RelayStatsSnapshot {
                messages_published: 4,
                ..Default::default()
            },
            rows: StatusCounts {
                pending: 2,
                ..Default::default()
            },
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["messages_published"], 4);
        assert_eq!(json["rows"]["pending"], 2);
        assert!(stats.to_string().contains("published=4"));
    }
}
