//! NAT Traversal for IKEv1 (RFC 3947 / RFC 3948 and the drafts before them)
//!
//! # Overview
//!
//! NAT-T is negotiated in three steps:
//!
//! 1. **Vendor IDs**: both peers announce the NAT-T revisions they speak in
//!    the first Phase 1 messages. The responder picks one and echoes it.
//! 2. **NAT Discovery**: the next messages carry NAT-D payloads, each a hash
//!    of the cookies and one address/port pair. A hash that doesn't match
//!    what we compute locally means a NAT rewrote that pair.
//! 3. **Port Floating**: when a NAT was found, the initiator moves the rest
//!    of the negotiation to UDP port 4500 and ESP gets UDP encapsulated.
//!
//! ```text
//! NAT-D = HASH(CKY-I | CKY-R | IP | Port)
//!
//! first NAT-D  : address/port the sender sent *to*   (our side)
//! other NAT-Ds : address/port the sender sent *from* (peer side)
//! ```
//!
//! # Port 4500 Framing
//!
//! ```text
//! +-------------------+
//! | UDP Header        |
//! +-------------------+
//! | Non-ESP Marker    | (4 bytes of zeros)
//! +-------------------+
//! | ISAKMP Message    |
//! +-------------------+
//! ```
//!
//! A single `0xff` byte is a NAT-T keepalive and is dropped on receipt.

use crate::crypto::HashAlgorithm;
use crate::error::{Error, Result};
use crate::isakmp::{Cookie, NatOaPayload, PayloadType};
use crate::spdb::NatEncapsulation;
use crate::state::{StateKind, StateTable};
use once_cell::sync::Lazy;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// NAT-T float port
pub const NAT_T_PORT: u16 = 4500;

/// Non-ESP marker prefixed to ISAKMP messages on the float port
pub const NON_ESP_MARKER: [u8; 4] = [0, 0, 0, 0];

/// Body of a NAT-T keepalive datagram
pub const KEEPALIVE_PACKET: [u8; 1] = [0xff];

/// NAT-T revision in use with a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatMethod {
    /// draft-ietf-ipsec-nat-t-ike-00 and -01
    Ietf0001,
    /// draft-ietf-ipsec-nat-t-ike-02 and -03
    Ietf0203,
    /// Apple's variant of the -02 draft
    Osx,
    /// RFC 3947
    Rfc,
}

impl NatMethod {
    /// Human readable name
    pub fn name(self) -> &'static str {
        match self {
            NatMethod::Ietf0001 => "draft-ietf-ipsec-nat-t-ike-00/01",
            NatMethod::Ietf0203 => "draft-ietf-ipsec-nat-t-ike-02/03",
            NatMethod::Osx => "Mac OS X",
            NatMethod::Rfc => "RFC 3947",
        }
    }

    /// Payload type used to carry NAT-D
    pub fn natd_payload(self) -> PayloadType {
        match self {
            NatMethod::Rfc => PayloadType::NatDRfc,
            NatMethod::Ietf0001 => PayloadType::NatDBadDrafts,
            NatMethod::Ietf0203 | NatMethod::Osx => PayloadType::NatDDrafts,
        }
    }

    /// Payload type used to carry NAT-OA
    pub fn natoa_payload(self) -> PayloadType {
        match self {
            NatMethod::Rfc => PayloadType::NatOaRfc,
            _ => PayloadType::NatOaDrafts,
        }
    }

    /// The oldest drafts used payload numbers that later collided with
    /// other assignments
    pub fn uses_bad_draft_values(self) -> bool {
        self == NatMethod::Ietf0001
    }

    /// Whether the negotiation moves to the float port
    pub fn port_floating(self) -> bool {
        self != NatMethod::Ietf0001
    }

    /// UDP encapsulation mode Quick Mode must propose
    pub fn encapsulation(self) -> NatEncapsulation {
        match self {
            NatMethod::Rfc => NatEncapsulation::Rfc,
            _ => NatEncapsulation::Drafts,
        }
    }
}

impl fmt::Display for NatMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// NAT-T Vendor ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatVendorId {
    /// RFC 3947
    Rfc,
    /// draft-ietf-ipsec-nat-t-ike-03
    Ietf03,
    /// draft-ietf-ipsec-nat-t-ike-02
    Ietf02,
    /// draft-ietf-ipsec-nat-t-ike-02 with a trailing newline in the hashed text
    Ietf02N,
    /// draft-ietf-ipsec-nat-t-ike-00
    Ietf00,
    /// Mac OS X
    Osx,
}

static VENDOR_IDS: Lazy<Vec<(NatVendorId, Vec<u8>)>> = Lazy::new(|| {
    NatVendorId::ALL
        .iter()
        .map(|vid| (*vid, HashAlgorithm::Md5.digest(&[vid.text().as_bytes()])))
        .collect()
});

impl NatVendorId {
    /// Every known NAT-T Vendor ID, most preferred first
    pub const ALL: [NatVendorId; 6] = [
        NatVendorId::Rfc,
        NatVendorId::Ietf03,
        NatVendorId::Ietf02,
        NatVendorId::Ietf02N,
        NatVendorId::Osx,
        NatVendorId::Ietf00,
    ];

    /// Text whose MD5 is the Vendor ID
    pub fn text(self) -> &'static str {
        match self {
            NatVendorId::Rfc => "RFC 3947",
            NatVendorId::Ietf03 => "draft-ietf-ipsec-nat-t-ike-03",
            NatVendorId::Ietf02 => "draft-ietf-ipsec-nat-t-ike-02",
            NatVendorId::Ietf02N => "draft-ietf-ipsec-nat-t-ike-02\n",
            NatVendorId::Ietf00 => "draft-ietf-ipsec-nat-t-ike-00",
            NatVendorId::Osx => "draft-ietf-ipsec-nat-t-ike",
        }
    }

    /// Vendor ID payload body
    pub fn bytes(self) -> &'static [u8] {
        VENDOR_IDS
            .iter()
            .find(|(vid, _)| *vid == self)
            .map(|(_, bytes)| bytes.as_slice())
            .unwrap_or(&[])
    }

    /// Recognize a received Vendor ID payload body
    pub fn from_bytes(body: &[u8]) -> Option<NatVendorId> {
        VENDOR_IDS
            .iter()
            .find(|(_, bytes)| bytes.as_slice() == body)
            .map(|(vid, _)| *vid)
    }

    /// NAT-T method this Vendor ID announces
    pub fn method(self) -> NatMethod {
        match self {
            NatVendorId::Rfc => NatMethod::Rfc,
            NatVendorId::Ietf03 | NatVendorId::Ietf02 | NatVendorId::Ietf02N => NatMethod::Ietf0203,
            NatVendorId::Osx => NatMethod::Osx,
            NatVendorId::Ietf00 => NatMethod::Ietf0001,
        }
    }

    pub(crate) fn preference(self) -> usize {
        NatVendorId::ALL.len()
            - NatVendorId::ALL
                .iter()
                .position(|v| *v == self)
                .unwrap_or(NatVendorId::ALL.len())
    }
}

/// Outcome of NAT discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatStatus {
    /// Nothing between us
    NoNat,
    /// Our address is translated
    LocalNat,
    /// The peer's address is translated
    RemoteNat,
    /// Both are
    BothNat,
}

impl NatStatus {
    fn from_flags(behind_me: bool, behind_peer: bool) -> Self {
        match (behind_me, behind_peer) {
            (false, false) => NatStatus::NoNat,
            (true, false) => NatStatus::LocalNat,
            (false, true) => NatStatus::RemoteNat,
            (true, true) => NatStatus::BothNat,
        }
    }

    /// Operator-facing text
    pub fn describe(self) -> &'static str {
        match self {
            NatStatus::NoNat => "no NAT detected",
            NatStatus::LocalNat => "i am NATed",
            NatStatus::RemoteNat => "peer is NATed",
            NatStatus::BothNat => "both are NATed",
        }
    }
}

/// NAT-T progress of one state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatTraversal {
    /// Vendor ID chosen for this peer
    pub vid: Option<NatVendorId>,
    /// Method in use; cleared when discovery is aborted
    pub method: Option<NatMethod>,
    /// Discovery ran
    pub natd_done: bool,
    /// A NAT translates our address
    pub behind_me: bool,
    /// A NAT translates the peer's address
    pub behind_peer: bool,
    /// Peer's original address from NAT-OA
    pub original_addr: Option<IpAddr>,
}

impl NatTraversal {
    /// Note a NAT-T Vendor ID seen from the peer; the most preferred one wins
    pub fn offer(&mut self, vid: NatVendorId) {
        let better = match self.vid {
            Some(cur) => vid.preference() > cur.preference(),
            None => true,
        };
        if better {
            debug!(vendor_id = vid.text().trim_end(), "NAT-Traversal: vendor ID accepted");
            self.vid = Some(vid);
            self.method = Some(vid.method());
        }
    }

    /// A NAT sits somewhere on the path
    pub fn detected(&self) -> bool {
        self.method.is_some() && (self.behind_me || self.behind_peer)
    }

    /// Discovery result
    pub fn status(&self) -> NatStatus {
        NatStatus::from_flags(self.behind_me, self.behind_peer)
    }

    /// Encapsulation mode Quick Mode must use
    pub fn encapsulation(&self) -> NatEncapsulation {
        match self.method {
            Some(m) if self.detected() => m.encapsulation(),
            _ => NatEncapsulation::None,
        }
    }

    /// Whether this negotiation switches to the float port
    pub fn port_floating(&self) -> bool {
        self.method.map_or(false, NatMethod::port_floating)
    }

    /// The NAT-D payload type of the method in use
    pub fn natd_payload(&self) -> Option<PayloadType> {
        self.method.map(NatMethod::natd_payload)
    }
}

/// NAT-D hash of one address/port pair
pub fn natd_hash(hash: HashAlgorithm, icookie: &Cookie, rcookie: &Cookie, addr: &IpAddr, port: u16) -> Vec<u8> {
    let port = port.to_be_bytes();
    match addr {
        IpAddr::V4(v4) => hash.digest(&[icookie, rcookie, &v4.octets(), &port]),
        IpAddr::V6(v6) => hash.digest(&[icookie, rcookie, &v6.octets(), &port]),
    }
}

/// Addressing of the message NAT-D is computed for
#[derive(Debug, Clone, Copy)]
pub struct NatdContext<'a> {
    /// Negotiated Phase 1 hash
    pub hash: HashAlgorithm,
    /// Initiator cookie
    pub icookie: &'a Cookie,
    /// Responder cookie
    pub rcookie: &'a Cookie,
    /// Our address
    pub local_addr: IpAddr,
    /// Our port
    pub local_port: u16,
    /// Peer address
    pub peer_addr: IpAddr,
    /// Peer port
    pub peer_port: u16,
    /// Pretend a NAT is present
    pub forceencaps: bool,
}

/// NAT-D payload bodies to send: the peer's pair first, then ours
///
/// With forced encapsulation the ports are zeroed so the peer always sees
/// a mismatch.
pub fn natd_payloads(ctx: &NatdContext<'_>) -> [Vec<u8>; 2] {
    let (peer_port, local_port) = if ctx.forceencaps {
        (0, 0)
    } else {
        (ctx.peer_port, ctx.local_port)
    };
    [
        natd_hash(ctx.hash, ctx.icookie, ctx.rcookie, &ctx.peer_addr, peer_port),
        natd_hash(ctx.hash, ctx.icookie, ctx.rcookie, &ctx.local_addr, local_port),
    ]
}

/// Compare received NAT-D payloads against our own view of the addressing
pub fn natd_lookup(nat: &mut NatTraversal, natd: &[&[u8]], ctx: &NatdContext<'_>) {
    if natd.len() < 2 {
        warn!(
            "NAT-Traversal: Only {} NAT-D - Aborting NAT-Traversal negotiation",
            natd.len()
        );
        nat.method = None;
        return;
    }

    let ours = natd_hash(ctx.hash, ctx.icookie, ctx.rcookie, &ctx.local_addr, ctx.local_port);
    nat.behind_me = natd[0] != ours.as_slice();

    let theirs = natd_hash(ctx.hash, ctx.icookie, ctx.rcookie, &ctx.peer_addr, ctx.peer_port);
    nat.behind_peer = !natd[1..].iter().any(|h| *h == theirs.as_slice());

    if ctx.forceencaps {
        debug!("NAT-Traversal: forceencaps enabled, pretending both are NATed");
        nat.behind_me = true;
        nat.behind_peer = true;
    }
    nat.natd_done = true;

    if let Some(method) = nat.method {
        info!(
            "NAT-Traversal: Result using {}: {}",
            method,
            nat.status().describe()
        );
    }
    if nat.behind_peer && ctx.peer_port == crate::config::IKE_UDP_PORT && !ctx.forceencaps {
        warn!(
            "Warning: peer is NATed but source port is still udp/{}. IPsec-passthrough NAT device suspected -- NAT-T may not work.",
            crate::config::IKE_UDP_PORT
        );
    }
}

/// Pick the peer's original address out of received NAT-OA payloads
pub fn natoa_lookup(nat: &mut NatTraversal, natoa: &[&[u8]]) {
    if natoa.is_empty() {
        return;
    }
    if !nat.behind_peer {
        info!(
            "NAT-Traversal: received {} NAT-OA. ignored because peer is not NATed",
            natoa.len()
        );
        return;
    }
    if natoa.len() > 1 {
        info!(
            "NAT-Traversal: received {} NAT-OA. using first, ignoring others",
            natoa.len()
        );
    }
    match NatOaPayload::from_bytes(natoa[0]) {
        Ok(oa) => {
            debug!(address = %oa.address, "NAT-Traversal: received NAT-OA");
            nat.original_addr = Some(oa.address);
        }
        Err(e) => warn!("{}", e),
    }
}

/// What arrived on the float port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatPacket<'a> {
    /// ISAKMP message with the marker stripped
    Ike(&'a [u8]),
    /// NAT-T keepalive
    Keepalive,
    /// ESP, which belongs to the kernel
    Esp,
}

/// Classify a datagram received on the float port
pub fn decapsulate(data: &[u8]) -> Result<FloatPacket<'_>> {
    if data == KEEPALIVE_PACKET {
        return Ok(FloatPacket::Keepalive);
    }
    if data.len() < NON_ESP_MARKER.len() {
        return Err(Error::BufferTooShort {
            required: NON_ESP_MARKER.len(),
            available: data.len(),
        });
    }
    if data[..4] != NON_ESP_MARKER {
        return Ok(FloatPacket::Esp);
    }
    Ok(FloatPacket::Ike(&data[4..]))
}

/// Prefix an ISAKMP message with the non-ESP marker
pub fn encapsulate(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(NON_ESP_MARKER.len() + msg.len());
    out.extend_from_slice(&NON_ESP_MARKER);
    out.extend_from_slice(msg);
    out
}

/// Whether an initiator should move to the float port before sending the
/// message that leads out of `kind`
pub fn should_float(kind: StateKind, nat: &NatTraversal, local_port: u16) -> bool {
    matches!(kind, StateKind::MainI3 | StateKind::AggrI2 | StateKind::QuickI1)
        && nat.port_floating()
        && nat.detected()
        && local_port != NAT_T_PORT
}

/// Whether an established ISAKMP state needs keepalives sent for it
pub fn needs_keepalive(kind: StateKind, nat: &NatTraversal, force: bool) -> bool {
    matches!(
        kind,
        StateKind::MainR3 | StateKind::MainI4 | StateKind::AggrR2 | StateKind::AggrI2
    ) && nat.detected()
        && (nat.behind_me || force)
}

/// The peer's NAT changed its port mapping: move every state talking to the
/// old pair to the new one
///
/// Returns how many states were updated.
pub fn new_mapping(
    states: &mut StateTable,
    old_addr: IpAddr,
    old_port: u16,
    new_addr: IpAddr,
    new_port: u16,
) -> usize {
    if old_addr != new_addr {
        warn!("nat_traversal_new_mapping: address change currently not supported");
        return 0;
    }
    if old_port == new_port {
        return 0;
    }
    info!(
        "NAT-Traversal: new NAT mapping for {}:{}, using {}:{}",
        old_addr, old_port, new_addr, new_port
    );
    let mut moved = 0;
    for serial in states.serials() {
        if let Some(st) = states.get_mut(serial) {
            if st.peer_addr == old_addr && st.peer_port == old_port {
                st.peer_port = new_port;
                moved += 1;
            }
        }
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, EndConfig};
    use crate::connections::{ConnId, ConnectionRegistry};
    use crate::state::State;
    use crate::whack::WhackLog;
    use std::time::Instant;

    fn conn_id() -> ConnId {
        let mut reg = ConnectionRegistry::new();
        let cfg = ConnectionConfig::builder("nat")
            .with_left(EndConfig::host("192.0.2.1".parse().expect("valid address")))
            .with_right(EndConfig::host("198.51.100.7".parse().expect("valid address")))
            .with_psk(b"secret".to_vec())
            .build()
            .expect("valid connection");
        reg.add(&cfg, &[], &mut WhackLog::new()).expect("connection added")
    }

    fn ctx<'a>(ic: &'a Cookie, rc: &'a Cookie, local_port: u16, peer_port: u16) -> NatdContext<'a> {
        NatdContext {
            hash: HashAlgorithm::Sha1,
            icookie: ic,
            rcookie: rc,
            local_addr: "192.0.2.1".parse().expect("valid address"),
            local_port,
            peer_addr: "198.51.100.7".parse().expect("valid address"),
            peer_port,
            forceencaps: false,
        }
    }

    /// What the peer would send us: its view of us first, then itself
    fn peer_view(c: &NatdContext<'_>) -> [Vec<u8>; 2] {
        let mirrored = NatdContext {
            local_addr: c.peer_addr,
            local_port: c.peer_port,
            peer_addr: c.local_addr,
            peer_port: c.local_port,
            ..*c
        };
        natd_payloads(&mirrored)
    }

    #[test]
    fn test_vendor_ids_are_md5() {
        assert_eq!(NatVendorId::Rfc.bytes().len(), 16);
        assert_eq!(
            hex::encode(NatVendorId::Rfc.bytes()),
            "4a131c81070358455c5728f20e95452f"
        );
        assert_eq!(NatVendorId::from_bytes(NatVendorId::Ietf02N.bytes()), Some(NatVendorId::Ietf02N));
        assert_ne!(NatVendorId::Ietf02.bytes(), NatVendorId::Ietf02N.bytes());
        assert_eq!(NatVendorId::from_bytes(&[0u8; 16]), None);
    }

    #[test]
    fn test_best_vendor_id_wins() {
        let mut nat = NatTraversal::default();
        nat.offer(NatVendorId::Ietf00);
        assert_eq!(nat.method, Some(NatMethod::Ietf0001));
        nat.offer(NatVendorId::Rfc);
        nat.offer(NatVendorId::Ietf03);
        assert_eq!(nat.vid, Some(NatVendorId::Rfc));
        assert_eq!(nat.method, Some(NatMethod::Rfc));
    }

    #[test]
    fn test_method_payload_numbers() {
        assert_eq!(NatMethod::Rfc.natd_payload(), PayloadType::NatDRfc);
        assert_eq!(NatMethod::Ietf0203.natd_payload(), PayloadType::NatDDrafts);
        assert_eq!(NatMethod::Ietf0001.natd_payload(), PayloadType::NatDBadDrafts);
        assert_eq!(NatMethod::Osx.natoa_payload(), PayloadType::NatOaDrafts);
        assert!(!NatMethod::Ietf0001.port_floating());
        assert!(NatMethod::Osx.port_floating());
    }

    #[test]
    fn test_no_nat_when_hashes_match() {
        let (ic, rc) = ([1u8; 8], [2u8; 8]);
        let c = ctx(&ic, &rc, 500, 500);
        let received = peer_view(&c);
        let mut nat = NatTraversal {
            method: Some(NatMethod::Rfc),
            ..Default::default()
        };
        natd_lookup(&mut nat, &[&received[0], &received[1]], &c);
        assert!(nat.natd_done);
        assert_eq!(nat.status(), NatStatus::NoNat);
        assert!(!nat.detected());
        assert_eq!(nat.encapsulation(), NatEncapsulation::None);
    }

    #[test]
    fn test_peer_behind_nat() {
        let (ic, rc) = ([1u8; 8], [2u8; 8]);
        // peer believes it is on port 500, we see it arrive from 1025
        let sent = ctx(&ic, &rc, 500, 500);
        let received = peer_view(&sent);
        let seen = ctx(&ic, &rc, 500, 1025);
        let mut nat = NatTraversal {
            method: Some(NatMethod::Ietf0203),
            ..Default::default()
        };
        natd_lookup(&mut nat, &[&received[0], &received[1]], &seen);
        assert_eq!(nat.status(), NatStatus::RemoteNat);
        assert!(nat.detected());
        assert_eq!(nat.encapsulation(), NatEncapsulation::Drafts);
    }

    #[test]
    fn test_single_natd_aborts() {
        let (ic, rc) = ([1u8; 8], [2u8; 8]);
        let c = ctx(&ic, &rc, 500, 500);
        let received = peer_view(&c);
        let mut nat = NatTraversal {
            method: Some(NatMethod::Rfc),
            ..Default::default()
        };
        natd_lookup(&mut nat, &[&received[0]], &c);
        assert_eq!(nat.method, None);
        assert!(!nat.natd_done);
    }

    #[test]
    fn test_forceencaps_marks_both() {
        let (ic, rc) = ([1u8; 8], [2u8; 8]);
        let mut c = ctx(&ic, &rc, 500, 500);
        let received = peer_view(&c);
        c.forceencaps = true;
        let mut nat = NatTraversal {
            method: Some(NatMethod::Rfc),
            ..Default::default()
        };
        natd_lookup(&mut nat, &[&received[0], &received[1]], &c);
        assert_eq!(nat.status(), NatStatus::BothNat);
    }

    #[test]
    fn test_natoa_needs_natted_peer() {
        let oa = NatOaPayload {
            address: "10.1.1.1".parse().expect("valid address"),
        }
        .to_bytes();
        let mut nat = NatTraversal::default();
        natoa_lookup(&mut nat, &[&oa]);
        assert_eq!(nat.original_addr, None);

        nat.behind_peer = true;
        natoa_lookup(&mut nat, &[&oa, &[1, 0, 0, 0]]);
        assert_eq!(nat.original_addr, Some("10.1.1.1".parse().expect("valid address")));

        let mut broken = NatTraversal {
            behind_peer: true,
            ..Default::default()
        };
        natoa_lookup(&mut broken, &[&[1, 0, 0, 0, 10, 1]]);
        assert_eq!(broken.original_addr, None);
    }

    #[test]
    fn test_float_port_framing() {
        let msg = [0xAAu8; 28];
        let framed = encapsulate(&msg);
        assert_eq!(&framed[..4], &NON_ESP_MARKER);
        assert_eq!(decapsulate(&framed).expect("valid framing"), FloatPacket::Ike(&msg[..]));
        assert_eq!(decapsulate(&KEEPALIVE_PACKET).expect("keepalive"), FloatPacket::Keepalive);
        assert_eq!(decapsulate(&[0, 0, 1, 0, 9]).expect("esp"), FloatPacket::Esp);
        assert!(decapsulate(&[0, 0]).is_err());
    }

    #[test]
    fn test_float_and_keepalive_decisions() {
        let nat = NatTraversal {
            method: Some(NatMethod::Rfc),
            behind_me: true,
            ..Default::default()
        };
        assert!(should_float(StateKind::MainI3, &nat, 500));
        assert!(!should_float(StateKind::MainI3, &nat, NAT_T_PORT));
        assert!(!should_float(StateKind::MainR2, &nat, 500));
        assert!(needs_keepalive(StateKind::MainI4, &nat, false));
        assert!(!needs_keepalive(StateKind::QuickI2, &nat, false));

        let peer_only = NatTraversal {
            method: Some(NatMethod::Rfc),
            behind_peer: true,
            ..Default::default()
        };
        assert!(!needs_keepalive(StateKind::MainR3, &peer_only, false));
        assert!(needs_keepalive(StateKind::MainR3, &peer_only, true));
    }

    #[test]
    fn test_new_mapping_moves_matching_states() {
        let conn = conn_id();
        let mut table = StateTable::new();
        let peer: IpAddr = "198.51.100.7".parse().expect("valid address");
        for port in [4500u16, 4500, 500] {
            let mut st = State::new(conn, StateKind::MainR3, false, Instant::now());
            st.peer_addr = peer;
            st.peer_port = port;
            table.insert(st);
        }
        assert_eq!(new_mapping(&mut table, peer, 4500, peer, 1701), 2);
        assert_eq!(table.iter().filter(|s| s.peer_port == 1701).count(), 2);
        let other: IpAddr = "198.51.100.8".parse().expect("valid address");
        assert_eq!(new_mapping(&mut table, peer, 500, other, 500), 0);
    }
}
