//! Dead Peer Detection (DPD)
//!
//! Implements Dead Peer Detection for IKEv1 as described in RFC 3706.
//!
//! # Overview
//!
//! Both peers announce support with a Vendor ID in Phase 1. Once the
//! ISAKMP SA is established and the connection has a DPD delay configured,
//! the idle side sends R_U_THERE notifications in protected Informational
//! exchanges and expects an R_U_THERE_ACK carrying the same sequence
//! number.
//!
//! # Algorithm
//!
//! 1. **Idle Check**: when `delay` passes without traffic from the peer,
//!    send R_U_THERE with the next sequence number
//! 2. **Response Timeout**: wait `timeout` for the matching ACK
//! 3. **Dead Declaration**: no ACK in time means the peer is dead and the
//!    connection's states are torn down
//!
//! # Example Flow
//!
//! ```text
//! Time:  0s        30s        60s      62s        90s       120s
//!        |---------|----------|--------|----------|---------|
//!        SA up     R_U_THERE  traffic  (idle)     R_U_THERE  Dead
//!                  #1001      resets              #1002      Peer
//!                   ↓ ACK     timer                (no ACK)
//!
//! Config: delay=30s, timeout=30s
//! ```
//!
//! # Wire Format
//!
//! ```text
//! Notification: DOI=IPSEC, Protocol=ISAKMP, SPI=CKY-I|CKY-R (16 octets),
//!               Type=R_U_THERE (36136) or R_U_THERE_ACK (36137),
//!               Data=sequence number (4 octets, big-endian)
//! ```
//!
//! # References
//!
//! - [RFC 3706](https://datatracker.ietf.org/doc/html/rfc3706) - Dead Peer Detection

use crate::error::{Error, Result};
use crate::isakmp::{proto, Cookie, Notification, NotificationPayload, ISAKMP_DOI_IPSEC};
use rand::Rng;
use std::time::{Duration, Instant};

/// Vendor ID announcing RFC 3706 support (version 1.0)
pub const DPD_VENDOR_ID: [u8; 16] = [
    0xaf, 0xca, 0xd7, 0x13, 0x68, 0xa1, 0xf1, 0xc9, 0x6b, 0x86, 0x96, 0xfc, 0x77, 0x57, 0x01, 0x00,
];

/// Whether a Vendor ID payload body announces DPD
///
/// Only the first 14 octets identify DPD; the last two carry the version.
pub fn is_dpd_vendor_id(body: &[u8]) -> bool {
    body.len() == DPD_VENDOR_ID.len() && body[..14] == DPD_VENDOR_ID[..14]
}

/// DPD Configuration
///
/// Taken from the connection when the ISAKMP SA is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpdConfig {
    /// Idle time before probing
    pub delay: Duration,

    /// How long to wait for R_U_THERE_ACK
    pub timeout: Duration,
}

impl DpdConfig {
    /// Create new DPD configuration
    pub fn new(delay: Duration, timeout: Duration) -> Self {
        DpdConfig { delay, timeout }
    }

    /// DPD runs only with both values set
    pub fn is_enabled(&self) -> bool {
        !self.delay.is_zero() && !self.timeout.is_zero()
    }
}

/// What the DPD timer should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpdStatus {
    /// Peer heard from recently
    Alive,

    /// Idle long enough: send R_U_THERE
    SendRequest,

    /// Waiting for R_U_THERE_ACK
    Waiting,

    /// No R_U_THERE_ACK in time
    Dead,
}

/// Why a DPD notification was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpdReject {
    /// R_U_THERE_ACK with a sequence number we didn't send
    UnexpectedAck {
        /// Sequence number received
        got: u32,
        /// Sequence number awaited, if any
        expected: Option<u32>,
    },

    /// R_U_THERE replaying an old sequence number
    StaleRequest {
        /// Sequence number received
        got: u32,
        /// Highest sequence number seen before
        last: u32,
    },
}

/// DPD State
///
/// Per ISAKMP SA. Time is always passed in so the daemon's clock drives
/// everything.
#[derive(Debug, Clone)]
pub struct DpdState {
    /// Delay and timeout
    config: DpdConfig,

    /// Last sequence number we sent
    seqno: u32,

    /// Sequence number of the outstanding R_U_THERE
    expect_ack: Option<u32>,

    /// When the outstanding R_U_THERE was sent
    last_sent: Option<Instant>,

    /// Highest R_U_THERE sequence number received from the peer
    peer_seqno: Option<u32>,

    /// Last time we heard from the peer
    last_activity: Instant,
}

impl DpdState {
    /// Start DPD for an established ISAKMP SA
    ///
    /// The first sequence number is random.
    pub fn new(config: DpdConfig, now: Instant) -> Self {
        let seqno = rand::thread_rng().gen_range(1..0x7fff_ffff);
        DpdState {
            config,
            seqno,
            expect_ack: None,
            last_sent: None,
            peer_seqno: None,
            last_activity: now,
        }
    }

    /// Delay and timeout in use
    pub fn config(&self) -> &DpdConfig {
        &self.config
    }

    /// Check whether an R_U_THERE is due
    pub fn should_send(&self, now: Instant) -> bool {
        !self.is_waiting() && now.saturating_duration_since(self.last_activity) >= self.config.delay
    }

    /// Take the next sequence number and mark the request outstanding
    pub fn mark_sent(&mut self, now: Instant) -> u32 {
        self.seqno = self.seqno.wrapping_add(1);
        if self.seqno == 0 {
            self.seqno = 1;
        }
        self.expect_ack = Some(self.seqno);
        self.last_sent = Some(now);
        self.seqno
    }

    /// Handle R_U_THERE_ACK
    pub fn mark_received(&mut self, seqno: u32, now: Instant) -> std::result::Result<(), DpdReject> {
        if self.expect_ack != Some(seqno) {
            return Err(DpdReject::UnexpectedAck {
                got: seqno,
                expected: self.expect_ack,
            });
        }
        self.expect_ack = None;
        self.last_sent = None;
        self.last_activity = now;
        Ok(())
    }

    /// Handle R_U_THERE; on success the caller answers with an ACK carrying
    /// the same sequence number
    pub fn peer_request(&mut self, seqno: u32, now: Instant) -> std::result::Result<(), DpdReject> {
        if let Some(last) = self.peer_seqno {
            if seqno <= last && last.wrapping_sub(seqno) < 0x8000_0000 {
                return Err(DpdReject::StaleRequest { got: seqno, last });
            }
        }
        self.peer_seqno = Some(seqno);
        self.last_activity = now;
        Ok(())
    }

    /// Mark any activity from the peer
    pub fn mark_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Check if the outstanding request timed out
    pub fn is_timeout(&self, now: Instant) -> bool {
        match self.last_sent {
            Some(sent) if self.is_waiting() => now.saturating_duration_since(sent) >= self.config.timeout,
            _ => false,
        }
    }

    /// Waiting for an ACK
    pub fn is_waiting(&self) -> bool {
        self.expect_ack.is_some()
    }

    /// Sequence number awaited in R_U_THERE_ACK
    pub fn pending_seqno(&self) -> Option<u32> {
        self.expect_ack
    }

    /// Time since the peer was last heard from
    pub fn time_since_last_activity(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Time until the next probe would be due
    pub fn next_probe_in(&self, now: Instant) -> Duration {
        self.config.delay.saturating_sub(self.time_since_last_activity(now))
    }

    /// Check DPD status
    pub fn check_status(&self, now: Instant) -> DpdStatus {
        if self.is_waiting() {
            if self.is_timeout(now) {
                return DpdStatus::Dead;
            }
            return DpdStatus::Waiting;
        }
        if self.should_send(now) {
            return DpdStatus::SendRequest;
        }
        DpdStatus::Alive
    }
}

/// Build an R_U_THERE or R_U_THERE_ACK notification body
pub fn dpd_notification(kind: Notification, icookie: &Cookie, rcookie: &Cookie, seqno: u32) -> Vec<u8> {
    let mut spi = Vec::with_capacity(16);
    spi.extend_from_slice(icookie);
    spi.extend_from_slice(rcookie);
    NotificationPayload {
        doi: ISAKMP_DOI_IPSEC,
        protocol_id: proto::ISAKMP,
        notify_type: kind.to_u16(),
        spi,
        data: seqno.to_be_bytes().to_vec(),
    }
    .to_bytes()
}

/// Pull the sequence number out of an R_U_THERE / R_U_THERE_ACK, checking
/// that its SPI names this ISAKMP SA
pub fn dpd_seqno(n: &NotificationPayload, icookie: &Cookie, rcookie: &Cookie) -> Result<u32> {
    if n.spi.len() != 16 || n.spi[..8] != icookie[..] || n.spi[8..] != rcookie[..] {
        return Err(Error::InvalidPayload(format!(
            "DPD: {} has invalid SPI",
            n.notification()
        )));
    }
    if n.data.len() != 4 {
        return Err(Error::InvalidLength {
            expected: 4,
            actual: n.data.len(),
        });
    }
    Ok(u32::from_be_bytes([n.data[0], n.data[1], n.data[2], n.data[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DpdConfig {
        DpdConfig::new(Duration::from_secs(30), Duration::from_secs(10))
    }

    #[test]
    fn test_dpd_config_enabled() {
        assert!(config().is_enabled());
        assert!(!DpdConfig::new(Duration::from_secs(30), Duration::ZERO).is_enabled());
        assert!(!DpdConfig::new(Duration::ZERO, Duration::ZERO).is_enabled());
    }

    #[test]
    fn test_dpd_vendor_id() {
        assert!(is_dpd_vendor_id(&DPD_VENDOR_ID));
        let mut other_version = DPD_VENDOR_ID;
        other_version[15] = 0x07;
        assert!(is_dpd_vendor_id(&other_version));
        assert!(!is_dpd_vendor_id(&DPD_VENDOR_ID[..14]));
    }

    #[test]
    fn test_dpd_probe_cycle() {
        let start = Instant::now();
        let mut state = DpdState::new(config(), start);

        assert_eq!(state.check_status(start), DpdStatus::Alive);
        let later = start + Duration::from_secs(30);
        assert_eq!(state.check_status(later), DpdStatus::SendRequest);

        let seq = state.mark_sent(later);
        assert!(state.is_waiting());
        assert_eq!(state.pending_seqno(), Some(seq));
        assert_eq!(state.check_status(later + Duration::from_secs(5)), DpdStatus::Waiting);

        state
            .mark_received(seq, later + Duration::from_secs(1))
            .expect("matching ack");
        assert!(!state.is_waiting());
        assert_eq!(state.check_status(later + Duration::from_secs(2)), DpdStatus::Alive);

        let next = state.mark_sent(later + Duration::from_secs(60));
        assert_eq!(next, seq.wrapping_add(1));
    }

    #[test]
    fn test_dpd_timeout() {
        let start = Instant::now();
        let mut state = DpdState::new(config(), start);
        state.mark_sent(start);
        assert!(!state.is_timeout(start + Duration::from_secs(9)));
        assert!(state.is_timeout(start + Duration::from_secs(10)));
        assert_eq!(state.check_status(start + Duration::from_secs(10)), DpdStatus::Dead);
    }

    #[test]
    fn test_dpd_unexpected_ack() {
        let start = Instant::now();
        let mut state = DpdState::new(config(), start);
        assert_eq!(
            state.mark_received(5, start),
            Err(DpdReject::UnexpectedAck {
                got: 5,
                expected: None
            })
        );
        let seq = state.mark_sent(start);
        assert!(state.mark_received(seq.wrapping_add(3), start).is_err());
        assert!(state.is_waiting());
    }

    #[test]
    fn test_dpd_peer_requests_must_advance() {
        let start = Instant::now();
        let mut state = DpdState::new(config(), start);
        let later = start + Duration::from_secs(20);
        state.peer_request(100, later).expect("first request");
        assert_eq!(state.time_since_last_activity(later), Duration::ZERO);
        state.peer_request(101, later).expect("next request");
        assert_eq!(
            state.peer_request(100, later),
            Err(DpdReject::StaleRequest { got: 100, last: 101 })
        );
    }

    #[test]
    fn test_activity_defers_probe() {
        let start = Instant::now();
        let mut state = DpdState::new(config(), start);
        state.mark_activity(start + Duration::from_secs(20));
        assert!(!state.should_send(start + Duration::from_secs(30)));
        assert_eq!(
            state.next_probe_in(start + Duration::from_secs(30)),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn test_dpd_notification_roundtrip() {
        let ic = [1u8; 8];
        let rc = [2u8; 8];
        let body = dpd_notification(Notification::RUThere, &ic, &rc, 0xdead_beef);
        let n = NotificationPayload::from_bytes(&body).expect("valid notification");
        assert_eq!(n.notification(), Notification::RUThere);
        assert_eq!(dpd_seqno(&n, &ic, &rc).expect("valid seqno"), 0xdead_beef);
        assert!(dpd_seqno(&n, &rc, &ic).is_err());
    }
}
