//! Peer block list
//!
//! Counts authentication failures per peer address while the peer is in
//! one of the responder's unauthenticated Phase 1 states. Once a peer has
//! been rejected `reject_num` times it is blocked for `period`; a peer that
//! stays quiet for `period` after its last rejection is forgotten.
//!
//! A `reject_num` of 0 disables the list and drops every record.

use crate::state::StateKind;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::warn;

/// Per-peer rejection record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPeer {
    /// Peer address
    pub ip: IpAddr,
    /// Rejections counted so far
    pub reject_num: u32,
    /// When the block started, if the peer is blocked
    pub start_time: Option<Instant>,
    /// Time of the latest rejection
    pub last_reject_time: Instant,
}

/// The block list
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    peers: Vec<BlockPeer>,
    reject_num: u32,
    period: Duration,
}

/// Would entering `state` expose the peer to the block list
///
/// These are the responder states reached before the peer has proven its
/// identity.
pub fn is_block_state(state: StateKind) -> bool {
    matches!(
        state,
        StateKind::MainR1
            | StateKind::MainR2
            | StateKind::MainR3
            | StateKind::AggrR1
            | StateKind::AggrR2
    )
}

impl BlockList {
    /// Create a list with the given thresholds
    pub fn new(reject_num: u32, period: Duration) -> Self {
        BlockList {
            peers: Vec::new(),
            reject_num,
            period,
        }
    }

    /// Rejections before a block
    pub fn reject_num(&self) -> u32 {
        self.reject_num
    }

    /// Block duration
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Records currently held
    pub fn peers(&self) -> &[BlockPeer] {
        &self.peers
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when nothing is recorded
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Record for `ip`
    pub fn get(&self, ip: &IpAddr) -> Option<&BlockPeer> {
        self.peers.iter().find(|p| p.ip == *ip)
    }

    fn peer_blocked(&self, peer: &BlockPeer) -> bool {
        peer.reject_num >= self.reject_num && peer.start_time.is_some()
    }

    /// Is `ip` currently blocked
    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.get(ip).map_or(false, |p| self.peer_blocked(p))
    }

    /// Count one rejection of `ip`, starting a block when the threshold is reached
    pub fn add(&mut self, ip: IpAddr, now: Instant) {
        if self.reject_num == 0 {
            return;
        }
        let idx = match self.peers.iter().position(|p| p.ip == ip) {
            Some(idx) => {
                let peer = &mut self.peers[idx];
                peer.reject_num += 1;
                peer.last_reject_time = now;
                idx
            }
            None => {
                self.peers.push(BlockPeer {
                    ip,
                    reject_num: 1,
                    start_time: None,
                    last_reject_time: now,
                });
                warn!(peer = %ip, "IP address {} was added to block-IP list", ip);
                self.peers.len() - 1
            }
        };
        self.start_block(idx, now);
    }

    fn start_block(&mut self, idx: usize, now: Instant) {
        let reject_num = self.reject_num;
        let peer = &mut self.peers[idx];
        if peer.start_time.is_some() && peer.reject_num >= reject_num {
            return;
        }
        if peer.reject_num < reject_num {
            return;
        }
        peer.start_time = Some(now);
        warn!(peer = %peer.ip, "start block the IP address {}", peer.ip);
    }

    /// Forget `ip`
    pub fn del(&mut self, ip: &IpAddr) {
        if let Some(idx) = self.peers.iter().position(|p| p.ip == *ip) {
            let peer = self.peers.remove(idx);
            warn!(peer = %peer.ip, "IP address {} was removed from block-IP list", peer.ip);
        }
    }

    /// Forget everybody
    pub fn clear(&mut self) {
        for peer in self.peers.drain(..) {
            warn!(peer = %peer.ip, "IP address {} was removed from block-IP list", peer.ip);
        }
    }

    /// Drop blocks that have run their period and stale rejection records
    pub fn expire(&mut self, now: Instant) {
        let period = self.period;
        let reject_num = self.reject_num;
        self.peers.retain(|peer| {
            let blocked = peer.reject_num >= reject_num && peer.start_time.is_some();
            let since = match (blocked, peer.start_time) {
                (true, Some(start)) => now.saturating_duration_since(start),
                _ => now.saturating_duration_since(peer.last_reject_time),
            };
            if since >= period {
                warn!(peer = %peer.ip, "unblock IP address {}", peer.ip);
                false
            } else {
                true
            }
        });
    }

    /// Change thresholds; a `reject_num` of 0 disables the list
    pub fn set(&mut self, reject_num: u32, period: Duration) {
        self.reject_num = reject_num;
        self.period = period;
        if reject_num == 0 {
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> IpAddr {
        "198.51.100.7".parse().expect("valid address")
    }

    #[test]
    fn test_block_states() {
        assert!(is_block_state(StateKind::MainR1));
        assert!(is_block_state(StateKind::MainR3));
        assert!(is_block_state(StateKind::AggrR2));
        assert!(!is_block_state(StateKind::MainI1));
        assert!(!is_block_state(StateKind::QuickR1));
        assert!(!is_block_state(StateKind::MainR0));
    }

    #[test]
    fn test_disabled_list_records_nothing() {
        let mut list = BlockList::new(0, Duration::from_secs(60));
        list.add(peer(), Instant::now());
        assert!(list.is_empty());
        assert!(!list.is_blocked(&peer()));
    }

    #[test]
    fn test_blocked_after_threshold() {
        let now = Instant::now();
        let mut list = BlockList::new(3, Duration::from_secs(60));
        list.add(peer(), now);
        list.add(peer(), now);
        assert!(!list.is_blocked(&peer()));
        list.add(peer(), now);
        assert!(list.is_blocked(&peer()));
        assert_eq!(list.get(&peer()).map(|p| p.reject_num), Some(3));
    }

    #[test]
    fn test_block_expires_after_period() {
        let now = Instant::now();
        let mut list = BlockList::new(1, Duration::from_secs(60));
        list.add(peer(), now);
        assert!(list.is_blocked(&peer()));

        list.expire(now + Duration::from_secs(59));
        assert!(list.is_blocked(&peer()));

        list.expire(now + Duration::from_secs(60));
        assert!(!list.is_blocked(&peer()));
        assert!(list.is_empty());
    }

    #[test]
    fn test_quiet_peer_forgotten() {
        let now = Instant::now();
        let mut list = BlockList::new(5, Duration::from_secs(30));
        list.add(peer(), now);
        list.expire(now + Duration::from_secs(10));
        assert_eq!(list.len(), 1);
        list.expire(now + Duration::from_secs(30));
        assert!(list.is_empty());
    }

    #[test]
    fn test_del_and_disable() {
        let now = Instant::now();
        let other: IpAddr = "203.0.113.9".parse().expect("valid address");
        let mut list = BlockList::new(2, Duration::from_secs(30));
        list.add(peer(), now);
        list.add(other, now);
        list.del(&peer());
        assert!(list.get(&peer()).is_none());
        assert_eq!(list.len(), 1);

        list.set(0, Duration::from_secs(30));
        assert!(list.is_empty());
    }
}
