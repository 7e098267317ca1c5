//! Process-wide counters across all conversations

use crate::protocol::KcpStats;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::LazyLock;

/// Aggregated conversation metrics
#[derive(Debug, Default)]
pub struct GlobalMetrics {
    pub conversations_created: AtomicU64,
    pub active_conversations: AtomicUsize,
    /// Conversations closed because a segment hit the dead-link limit
    pub conversations_lost: AtomicU64,
    /// Conversations closed by the keep-alive grace period
    pub conversations_timed_out: AtomicU64,
    pub total_bytes_sent: AtomicU64,
    pub total_bytes_received: AtomicU64,
    pub total_packets_sent: AtomicU64,
    pub total_packets_received: AtomicU64,
    pub total_retransmissions: AtomicU64,
}

impl GlobalMetrics {
    pub fn conversation_created(&self) {
        self.conversations_created.fetch_add(1, Ordering::Relaxed);
        self.active_conversations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed conversation and fold in its final counters.
    pub fn conversation_closed(&self, stats: &KcpStats) {
        self.active_conversations.fetch_sub(1, Ordering::Relaxed);
        self.total_bytes_sent
            .fetch_add(stats.bytes_sent, Ordering::Relaxed);
        self.total_bytes_received
            .fetch_add(stats.bytes_received, Ordering::Relaxed);
        self.total_packets_sent
            .fetch_add(stats.packets_sent, Ordering::Relaxed);
        self.total_packets_received
            .fetch_add(stats.packets_received, Ordering::Relaxed);
        self.total_retransmissions
            .fetch_add(stats.retransmissions + stats.fast_retransmissions, Ordering::Relaxed);
    }

    pub fn conversation_lost(&self) {
        self.conversations_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conversation_timed_out(&self) {
        self.conversations_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            conversations_created: self.conversations_created.load(Ordering::Relaxed),
            active_conversations: self.active_conversations.load(Ordering::Relaxed),
            conversations_lost: self.conversations_lost.load(Ordering::Relaxed),
            conversations_timed_out: self.conversations_timed_out.load(Ordering::Relaxed),
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            total_packets_sent: self.total_packets_sent.load(Ordering::Relaxed),
            total_packets_received: self.total_packets_received.load(Ordering::Relaxed),
            total_retransmissions: self.total_retransmissions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`GlobalMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub conversations_created: u64,
    pub active_conversations: usize,
    pub conversations_lost: u64,
    pub conversations_timed_out: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_packets_sent: u64,
    pub total_packets_received: u64,
    pub total_retransmissions: u64,
}

impl MetricsSnapshot {
    /// Retransmitted share of all packets sent
    pub fn retransmission_rate(&self) -> f64 {
        if self.total_packets_sent == 0 {
            0.0
        } else {
            self.total_retransmissions as f64 / self.total_packets_sent as f64
        }
    }
}

static GLOBAL_METRICS: LazyLock<GlobalMetrics> = LazyLock::new(GlobalMetrics::default);

pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

/// Human-readable summary
pub fn format_metrics(snapshot: &MetricsSnapshot) -> String {
    format!(
        "KCP Metrics:\n\
         Conversations: {} created, {} active, {} lost, {} timed out\n\
         Traffic: {} bytes sent, {} bytes received\n\
         Packets: {} sent, {} received\n\
         Retransmissions: {} ({:.2}% of packets)",
        snapshot.conversations_created,
        snapshot.active_conversations,
        snapshot.conversations_lost,
        snapshot.conversations_timed_out,
        snapshot.total_bytes_sent,
        snapshot.total_bytes_received,
        snapshot.total_packets_sent,
        snapshot.total_packets_received,
        snapshot.total_retransmissions,
        snapshot.retransmission_rate() * 100.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_accumulates() {
        let metrics = GlobalMetrics::default();
        metrics.conversation_created();
        metrics.conversation_created();
        assert_eq!(metrics.snapshot().active_conversations, 2);

        let stats = KcpStats {
            bytes_sent: 100,
            packets_sent: 4,
            retransmissions: 1,
            ..Default::default()
        };
        metrics.conversation_closed(&stats);
        metrics.conversation_lost();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_conversations, 1);
        assert_eq!(snapshot.total_bytes_sent, 100);
        assert_eq!(snapshot.conversations_lost, 1);
        assert!((snapshot.retransmission_rate() - 0.25).abs() < f64::EPSILON);
        assert!(format_metrics(&snapshot).contains("1 lost"));
    }
}
