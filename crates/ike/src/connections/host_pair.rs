//! Host pairs and pending Quick Mode negotiations

use super::ConnId;
use crate::config::{IKE_UDP_PORT, NAT_T_IKE_FLOAT_PORT};
use crate::policy::Policy;
use crate::state::SerialNo;
use std::net::IpAddr;
use std::time::Instant;

/// Stable handle of a host pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPairId(pub(crate) u64);

/// One side of a host pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEnd {
    /// Address (unspecified for a wildcard peer)
    pub addr: IpAddr,
    /// IKE port
    pub port: u16,
    /// Port must match exactly
    pub port_specific: bool,
}

impl HostEnd {
    /// Does this end accept `addr`/`port`
    ///
    /// The NAT-T float port is treated as the IKE port.
    pub fn matches(&self, addr: &IpAddr, port: u16) -> bool {
        let port = normalize_port(port);
        self.addr == *addr && (!self.port_specific || normalize_port(self.port) == port)
    }
}

pub(crate) fn normalize_port(port: u16) -> u16 {
    if port == NAT_T_IKE_FLOAT_PORT {
        IKE_UDP_PORT
    } else {
        port
    }
}

/// A Quick Mode negotiation waiting for its ISAKMP SA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    /// An operator is waiting on the outcome
    pub whack: bool,
    /// ISAKMP SA being waited for
    pub isakmp_sa: SerialNo,
    /// Connection to negotiate for
    pub connection: ConnId,
    /// Policy to negotiate with
    pub policy: Policy,
    /// Keying attempt number
    pub try_: u32,
    /// IPsec SA this negotiation replaces
    pub replacing: SerialNo,
    /// When the request was queued (or last released)
    pub pend_time: Instant,
}

/// Connections sharing a (local, remote) address pair
#[derive(Debug, Clone)]
pub struct HostPair {
    /// Handle
    pub id: HostPairId,
    /// Our side
    pub me: HostEnd,
    /// Peer side
    pub him: HostEnd,
    /// We have sent to this peer at least once
    pub initial_connection_sent: bool,
    /// Connections oriented to this pair, most recently added first
    pub connections: Vec<ConnId>,
    /// Quick Mode requests queued on an ISAKMP SA of this pair
    pub pending: Vec<Pending>,
}

impl HostPair {
    /// Does the pair match the given addresses
    pub fn matches(&self, me: &IpAddr, my_port: u16, him: &IpAddr, his_port: u16) -> bool {
        self.me.matches(me, my_port) && self.him.matches(him, his_port)
    }

    /// Nothing refers to this pair any more
    pub fn is_unused(&self) -> bool {
        self.connections.is_empty() && self.pending.is_empty()
    }
}
