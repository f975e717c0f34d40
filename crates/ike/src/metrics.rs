//! Metrics for IKE negotiations
//!
//! Counters and gauges for monitoring the daemon. All metrics use atomic
//! operations, so a clone handed to a monitoring task observes the same
//! values the daemon updates.
//!
//! # Example
//!
//! ```
//! use fynx_ike::metrics::IkeMetrics;
//!
//! let metrics = IkeMetrics::new();
//!
//! metrics.record_phase1_started();
//! // ... Main Mode runs ...
//! metrics.record_phase1_completed();
//!
//! let snapshot = metrics.snapshot();
//! println!("Phase 1 negotiations: {}", snapshot.phase1_started);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// IKE metrics for monitoring
///
/// Provides thread-safe atomic counters for the negotiation engine.
#[derive(Debug, Clone)]
pub struct IkeMetrics {
    /// Datagrams handed to the dispatcher
    pub packets_received: Arc<AtomicU64>,

    /// Messages refused by the dispatcher or a transition
    pub packets_rejected: Arc<AtomicU64>,

    /// Retransmitted copies of an already processed message
    pub duplicates_received: Arc<AtomicU64>,

    /// Messages sent again after a timeout or a duplicate
    pub retransmissions: Arc<AtomicU64>,

    /// Phase 1 negotiations started (either role)
    pub phase1_started: Arc<AtomicU64>,

    /// Phase 1 negotiations that reached an established ISAKMP SA
    pub phase1_completed: Arc<AtomicU64>,

    /// Phase 1 negotiations that failed
    pub phase1_failed: Arc<AtomicU64>,

    /// Quick Mode negotiations started (either role)
    pub phase2_started: Arc<AtomicU64>,

    /// Currently established ISAKMP SAs
    pub isakmp_sa_active: Arc<AtomicU64>,

    /// Currently established IPsec SAs
    pub ipsec_sa_active: Arc<AtomicU64>,

    /// ISAKMP SAs deleted
    pub isakmp_sa_deleted: Arc<AtomicU64>,

    /// IPsec SAs deleted
    pub ipsec_sa_deleted: Arc<AtomicU64>,

    /// DPD probes sent
    pub dpd_checks_total: Arc<AtomicU64>,

    /// DPD timeouts (peer not responding)
    pub dpd_timeout: Arc<AtomicU64>,

    /// Proposal selection failures
    pub proposal_negotiation_failed: Arc<AtomicU64>,

    /// Authentication failures
    pub authentication_failed: Arc<AtomicU64>,

    /// Peers that crossed the block-list threshold
    pub peers_blocked: Arc<AtomicU64>,

    /// Messages dropped because the sender is blocked
    pub blocked_packets_dropped: Arc<AtomicU64>,

    /// Notifications sent to peers
    pub notifications_sent: Arc<AtomicU64>,
}

impl IkeMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self {
            packets_received: Arc::new(AtomicU64::new(0)),
            packets_rejected: Arc::new(AtomicU64::new(0)),
            duplicates_received: Arc::new(AtomicU64::new(0)),
            retransmissions: Arc::new(AtomicU64::new(0)),
            phase1_started: Arc::new(AtomicU64::new(0)),
            phase1_completed: Arc::new(AtomicU64::new(0)),
            phase1_failed: Arc::new(AtomicU64::new(0)),
            phase2_started: Arc::new(AtomicU64::new(0)),
            isakmp_sa_active: Arc::new(AtomicU64::new(0)),
            ipsec_sa_active: Arc::new(AtomicU64::new(0)),
            isakmp_sa_deleted: Arc::new(AtomicU64::new(0)),
            ipsec_sa_deleted: Arc::new(AtomicU64::new(0)),
            dpd_checks_total: Arc::new(AtomicU64::new(0)),
            dpd_timeout: Arc::new(AtomicU64::new(0)),
            proposal_negotiation_failed: Arc::new(AtomicU64::new(0)),
            authentication_failed: Arc::new(AtomicU64::new(0)),
            peers_blocked: Arc::new(AtomicU64::new(0)),
            blocked_packets_dropped: Arc::new(AtomicU64::new(0)),
            notifications_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a datagram handed to the dispatcher
    pub fn record_packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected message
    pub fn record_packet_rejected(&self) {
        self.packets_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a duplicate message
    pub fn record_duplicate(&self) {
        self.duplicates_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retransmission
    pub fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a Phase 1 negotiation started
    pub fn record_phase1_started(&self) {
        self.phase1_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a Phase 1 negotiation completed; the ISAKMP SA is now active
    pub fn record_phase1_completed(&self) {
        self.phase1_completed.fetch_add(1, Ordering::Relaxed);
        self.isakmp_sa_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a Phase 1 negotiation failed
    pub fn record_phase1_failed(&self) {
        self.phase1_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a Quick Mode negotiation started
    pub fn record_phase2_started(&self) {
        self.phase2_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an IPsec SA established
    pub fn record_ipsec_sa_created(&self) {
        self.ipsec_sa_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an established ISAKMP SA deleted
    pub fn record_isakmp_sa_deleted(&self) {
        decrement(&self.isakmp_sa_active);
        self.isakmp_sa_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an established IPsec SA deleted
    pub fn record_ipsec_sa_deleted(&self) {
        decrement(&self.ipsec_sa_active);
        self.ipsec_sa_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record DPD check performed
    ///
    /// # Arguments
    ///
    /// * `success` - Whether peer responded
    pub fn record_dpd_check(&self, success: bool) {
        self.dpd_checks_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.dpd_timeout.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record proposal selection failure
    pub fn record_proposal_negotiation_failed(&self) {
        self.proposal_negotiation_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record authentication failure
    pub fn record_authentication_failed(&self) {
        self.authentication_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a peer entering the block list
    pub fn record_peer_blocked(&self) {
        self.peers_blocked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message dropped from a blocked peer
    pub fn record_blocked_packet(&self) {
        self.blocked_packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a notification sent
    pub fn record_notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    ///
    /// Returns a point-in-time view of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_rejected: self.packets_rejected.load(Ordering::Relaxed),
            duplicates_received: self.duplicates_received.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            phase1_started: self.phase1_started.load(Ordering::Relaxed),
            phase1_completed: self.phase1_completed.load(Ordering::Relaxed),
            phase1_failed: self.phase1_failed.load(Ordering::Relaxed),
            phase2_started: self.phase2_started.load(Ordering::Relaxed),
            isakmp_sa_active: self.isakmp_sa_active.load(Ordering::Relaxed),
            ipsec_sa_active: self.ipsec_sa_active.load(Ordering::Relaxed),
            isakmp_sa_deleted: self.isakmp_sa_deleted.load(Ordering::Relaxed),
            ipsec_sa_deleted: self.ipsec_sa_deleted.load(Ordering::Relaxed),
            dpd_checks_total: self.dpd_checks_total.load(Ordering::Relaxed),
            dpd_timeout: self.dpd_timeout.load(Ordering::Relaxed),
            proposal_negotiation_failed: self.proposal_negotiation_failed.load(Ordering::Relaxed),
            authentication_failed: self.authentication_failed.load(Ordering::Relaxed),
            peers_blocked: self.peers_blocked.load(Ordering::Relaxed),
            blocked_packets_dropped: self.blocked_packets_dropped.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        for counter in [
            &self.packets_received,
            &self.packets_rejected,
            &self.duplicates_received,
            &self.retransmissions,
            &self.phase1_started,
            &self.phase1_completed,
            &self.phase1_failed,
            &self.phase2_started,
            &self.isakmp_sa_active,
            &self.ipsec_sa_active,
            &self.isakmp_sa_deleted,
            &self.ipsec_sa_deleted,
            &self.dpd_checks_total,
            &self.dpd_timeout,
            &self.proposal_negotiation_failed,
            &self.authentication_failed,
            &self.peers_blocked,
            &self.blocked_packets_dropped,
            &self.notifications_sent,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

// gauges never wrap below zero
fn decrement(gauge: &AtomicU64) {
    let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

impl Default for IkeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all IKE metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Datagrams handed to the dispatcher
    pub packets_received: u64,
    /// Messages refused
    pub packets_rejected: u64,
    /// Duplicate messages
    pub duplicates_received: u64,
    /// Retransmissions
    pub retransmissions: u64,
    /// Phase 1 negotiations started
    pub phase1_started: u64,
    /// Phase 1 negotiations completed
    pub phase1_completed: u64,
    /// Phase 1 negotiations failed
    pub phase1_failed: u64,
    /// Quick Mode negotiations started
    pub phase2_started: u64,
    /// Established ISAKMP SAs
    pub isakmp_sa_active: u64,
    /// Established IPsec SAs
    pub ipsec_sa_active: u64,
    /// ISAKMP SAs deleted
    pub isakmp_sa_deleted: u64,
    /// IPsec SAs deleted
    pub ipsec_sa_deleted: u64,
    /// DPD probes sent
    pub dpd_checks_total: u64,
    /// DPD timeouts
    pub dpd_timeout: u64,
    /// Proposal selection failures
    pub proposal_negotiation_failed: u64,
    /// Authentication failures
    pub authentication_failed: u64,
    /// Peers blocked
    pub peers_blocked: u64,
    /// Messages dropped from blocked peers
    pub blocked_packets_dropped: u64,
    /// Notifications sent
    pub notifications_sent: u64,
}

impl MetricsSnapshot {
    /// Phase 1 success rate (0.0 to 1.0)
    pub fn phase1_success_rate(&self) -> f64 {
        if self.phase1_started == 0 {
            return 0.0;
        }
        self.phase1_completed as f64 / self.phase1_started as f64
    }

    /// Share of received messages that were rejected (0.0 to 1.0)
    pub fn rejection_rate(&self) -> f64 {
        if self.packets_received == 0 {
            return 0.0;
        }
        self.packets_rejected as f64 / self.packets_received as f64
    }

    /// Calculate DPD success rate (0.0 to 1.0)
    pub fn dpd_success_rate(&self) -> f64 {
        if self.dpd_checks_total == 0 {
            return 1.0; // No checks = no failures
        }
        let successes = self.dpd_checks_total.saturating_sub(self.dpd_timeout);
        successes as f64 / self.dpd_checks_total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = IkeMetrics::new();
        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.phase1_started, 0);
        assert_eq!(snapshot.packets_received, 0);
    }

    #[test]
    fn test_phase1_metrics() {
        let metrics = IkeMetrics::new();

        metrics.record_phase1_started();
        metrics.record_phase1_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.phase1_started, 1);
        assert_eq!(snapshot.phase1_completed, 1);
        assert_eq!(snapshot.isakmp_sa_active, 1);
        assert_eq!(snapshot.phase1_failed, 0);
    }

    #[test]
    fn test_sa_lifecycle_metrics() {
        let metrics = IkeMetrics::new();

        metrics.record_phase1_completed();
        metrics.record_ipsec_sa_created();
        metrics.record_isakmp_sa_deleted();
        metrics.record_ipsec_sa_deleted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.isakmp_sa_active, 0);
        assert_eq!(snapshot.ipsec_sa_active, 0);
        assert_eq!(snapshot.isakmp_sa_deleted, 1);
        assert_eq!(snapshot.ipsec_sa_deleted, 1);

        // a stray delete does not wrap the gauge
        metrics.record_ipsec_sa_deleted();
        assert_eq!(metrics.snapshot().ipsec_sa_active, 0);
    }

    #[test]
    fn test_dpd_metrics() {
        let metrics = IkeMetrics::new();

        metrics.record_dpd_check(true);
        metrics.record_dpd_check(true);
        metrics.record_dpd_check(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dpd_checks_total, 3);
        assert_eq!(snapshot.dpd_timeout, 1);
        assert!((snapshot.dpd_success_rate() - 0.666666).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_calculations() {
        let metrics = IkeMetrics::new();

        metrics.record_phase1_started();
        metrics.record_phase1_started();
        metrics.record_phase1_completed();
        for _ in 0..4 {
            metrics.record_packet_received();
        }
        metrics.record_packet_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.phase1_success_rate(), 0.5);
        assert_eq!(snapshot.rejection_rate(), 0.25);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = IkeMetrics::new();

        metrics.record_phase1_started();
        metrics.record_peer_blocked();
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.phase1_started, 0);
        assert_eq!(snapshot.peers_blocked, 0);
    }

    #[test]
    fn test_metrics_clone() {
        let metrics1 = IkeMetrics::new();
        metrics1.record_phase1_started();

        let metrics2 = metrics1.clone();
        metrics2.record_phase1_started();

        // Both should show 2 because they share the same Arc<AtomicU64>
        assert_eq!(metrics1.snapshot().phase1_started, 2);
        assert_eq!(metrics2.snapshot().phase1_started, 2);
    }
}
