//! Negotiation states
//!
//! A [`State`] is one in-flight or established exchange: a Main or
//! Aggressive Mode negotiation (the ISAKMP SA), or a Quick Mode
//! negotiation running under one. States are owned by the [`StateTable`]
//! and addressed by [`SerialNo`]; connections and pending requests refer
//! to them by serial only.
//!
//! # State Kinds
//!
//! ```text
//! Main Mode        R0 -> R1 -> R2 -> R3        I1 -> I2 -> I3 -> I4
//! Aggressive Mode  R0 -> R1 -> R2              I1 -> I2
//! Quick Mode       R0 -> R1 -> R2              I1 -> I2
//! Informational    Info, InfoProtected (pseudo states, never stored)
//! ```

use crate::connections::{ConnId, Identity, Subnet};
use crate::crypto::{keys, DhKeyPair, EncryptAlgorithm, HashAlgorithm, IsakmpKeys};
use crate::dpd::DpdState;
use crate::isakmp::{Cookie, ZERO_COOKIE};
use crate::nat::NatTraversal;
use crate::policy::Policy;
use crate::spdb::{IpsecSelection, OakleyTransAttrs};
use crate::whack::RcCode;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use tracing::debug;
use zeroize::Zeroizing;

/// Serial number of a state; never reused within one daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SerialNo(pub u64);

impl SerialNo {
    /// No state
    pub const NOBODY: SerialNo = SerialNo(0);

    /// Refers to some state
    pub fn is_some(self) -> bool {
        self != SerialNo::NOBODY
    }
}

impl fmt::Display for SerialNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Position of a negotiation within its exchange
///
/// Ordering matters: the microcode table is sorted by this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateKind {
    /// Main Mode responder, expecting MI1
    MainR0,
    /// Main Mode initiator, sent MI1
    MainI1,
    /// Main Mode responder, sent MR1
    MainR1,
    /// Main Mode initiator, sent MI2
    MainI2,
    /// Main Mode responder, sent MR2
    MainR2,
    /// Main Mode initiator, sent MI3
    MainI3,
    /// Main Mode responder, established
    MainR3,
    /// Main Mode initiator, established
    MainI4,
    /// Aggressive Mode responder, expecting AI1
    AggrR0,
    /// Aggressive Mode initiator, sent AI1
    AggrI1,
    /// Aggressive Mode responder, sent AR1
    AggrR1,
    /// Aggressive Mode initiator, established
    AggrI2,
    /// Aggressive Mode responder, established
    AggrR2,
    /// Quick Mode responder, expecting QI1
    QuickR0,
    /// Quick Mode initiator, sent QI1
    QuickI1,
    /// Quick Mode responder, sent QR1
    QuickR1,
    /// Quick Mode initiator, established
    QuickI2,
    /// Quick Mode responder, established
    QuickR2,
    /// Plaintext Informational exchange
    Info,
    /// Encrypted Informational exchange
    InfoProtected,
}

impl StateKind {
    /// Every kind, in table order
    pub const ALL: [StateKind; 20] = [
        StateKind::MainR0,
        StateKind::MainI1,
        StateKind::MainR1,
        StateKind::MainI2,
        StateKind::MainR2,
        StateKind::MainI3,
        StateKind::MainR3,
        StateKind::MainI4,
        StateKind::AggrR0,
        StateKind::AggrI1,
        StateKind::AggrR1,
        StateKind::AggrI2,
        StateKind::AggrR2,
        StateKind::QuickR0,
        StateKind::QuickI1,
        StateKind::QuickR1,
        StateKind::QuickI2,
        StateKind::QuickR2,
        StateKind::Info,
        StateKind::InfoProtected,
    ];

    /// Number of kinds
    pub const COUNT: usize = StateKind::ALL.len();

    /// Zero-based position in [`StateKind::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// One-based number used on the control channel
    pub fn ordinal(self) -> u16 {
        self as u16 + 1
    }

    /// Control-channel code announcing entry into this state
    pub fn rc_code(self) -> u16 {
        RcCode::NewState.code() + self.ordinal()
    }

    /// Symbolic name
    pub fn name(self) -> &'static str {
        match self {
            StateKind::MainR0 => "STATE_MAIN_R0",
            StateKind::MainI1 => "STATE_MAIN_I1",
            StateKind::MainR1 => "STATE_MAIN_R1",
            StateKind::MainI2 => "STATE_MAIN_I2",
            StateKind::MainR2 => "STATE_MAIN_R2",
            StateKind::MainI3 => "STATE_MAIN_I3",
            StateKind::MainR3 => "STATE_MAIN_R3",
            StateKind::MainI4 => "STATE_MAIN_I4",
            StateKind::AggrR0 => "STATE_AGGR_R0",
            StateKind::AggrI1 => "STATE_AGGR_I1",
            StateKind::AggrR1 => "STATE_AGGR_R1",
            StateKind::AggrI2 => "STATE_AGGR_I2",
            StateKind::AggrR2 => "STATE_AGGR_R2",
            StateKind::QuickR0 => "STATE_QUICK_R0",
            StateKind::QuickI1 => "STATE_QUICK_I1",
            StateKind::QuickR1 => "STATE_QUICK_R1",
            StateKind::QuickI2 => "STATE_QUICK_I2",
            StateKind::QuickR2 => "STATE_QUICK_R2",
            StateKind::Info => "STATE_INFO",
            StateKind::InfoProtected => "STATE_INFO_PROTECTED",
        }
    }

    /// Operator-facing description
    pub fn story(self) -> &'static str {
        match self {
            StateKind::MainR0 => "expecting MI1",
            StateKind::MainI1 => "sent MI1, expecting MR1",
            StateKind::MainR1 => "sent MR1, expecting MI2",
            StateKind::MainI2 => "sent MI2, expecting MR2",
            StateKind::MainR2 => "sent MR2, expecting MI3",
            StateKind::MainI3 => "sent MI3, expecting MR3",
            StateKind::MainR3 => "sent MR3, ISAKMP SA established",
            StateKind::MainI4 => "ISAKMP SA established",
            StateKind::AggrR0 => "expecting AI1",
            StateKind::AggrI1 => "sent AI1, expecting AR1",
            StateKind::AggrR1 => "sent AR1, expecting AI2",
            StateKind::AggrI2 => "sent AI2, ISAKMP SA established",
            StateKind::AggrR2 => "ISAKMP SA established",
            StateKind::QuickR0 => "expecting QI1",
            StateKind::QuickI1 => "sent QI1, expecting QR1",
            StateKind::QuickR1 => "sent QR1, inbound IPsec SA installed, expecting QI2",
            StateKind::QuickI2 => "sent QI2, IPsec SA established",
            StateKind::QuickR2 => "IPsec SA established",
            StateKind::Info => "got Informational Message in clear",
            StateKind::InfoProtected => "got encrypted Informational Message",
        }
    }

    /// Main or Aggressive Mode
    pub fn is_phase1(self) -> bool {
        self <= StateKind::AggrR2
    }

    /// Quick Mode
    pub fn is_quick(self) -> bool {
        (StateKind::QuickR0..=StateKind::QuickR2).contains(&self)
    }

    /// The ISAKMP SA is usable
    pub fn is_isakmp_sa_established(self) -> bool {
        matches!(
            self,
            StateKind::MainR3 | StateKind::MainI4 | StateKind::AggrI2 | StateKind::AggrR2
        )
    }

    /// The IPsec SA is installed in both directions
    pub fn is_ipsec_sa_established(self) -> bool {
        matches!(self, StateKind::QuickI2 | StateKind::QuickR2)
    }

    /// Only the inbound IPsec SA is installed
    pub fn is_only_inbound_ipsec_sa_established(self) -> bool {
        self == StateKind::QuickR1
    }

    /// Messages in this state travel encrypted
    pub fn is_isakmp_encrypted(self) -> bool {
        matches!(
            self,
            StateKind::MainR2
                | StateKind::MainI3
                | StateKind::MainR3
                | StateKind::MainI4
                | StateKind::AggrR1
                | StateKind::AggrI2
                | StateKind::AggrR2
                | StateKind::QuickR0
                | StateKind::QuickI1
                | StateKind::QuickR1
                | StateKind::QuickI2
                | StateKind::QuickR2
                | StateKind::InfoProtected
        )
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Data kept while a transition waits for an asynchronous answer
#[derive(Debug)]
pub struct Continuation {
    /// What is being waited for
    pub reason: &'static str,
    /// Transition to run when the answer arrives
    pub resume: crate::demux::Transition,
    /// The message being processed
    pub md: Box<crate::demux::MsgDigest>,
    /// When the wait started
    pub started: Instant,
}

/// One negotiation
pub struct State {
    /// Serial number
    pub serial: SerialNo,
    /// Phase 1 state this Quick Mode state was cloned from
    pub clonedfrom: SerialNo,
    /// Current position in the exchange
    pub kind: StateKind,
    /// Connection negotiated for
    pub connection: ConnId,
    /// Initiator cookie
    pub icookie: Cookie,
    /// Responder cookie
    pub rcookie: Cookie,
    /// Message ID (0 in Phase 1)
    pub msgid: u32,
    /// Message IDs used under this ISAKMP SA
    pub used_msgids: Vec<u32>,
    /// We started the exchange
    pub initiator: bool,
    /// Policy negotiated with
    pub policy: Policy,
    /// Keying attempt number
    pub try_: u32,
    /// State this one replaces when it completes
    pub replacing: SerialNo,
    /// An operator waits on the outcome
    pub whack_waiting: bool,
    /// Peer address
    pub peer_addr: IpAddr,
    /// Peer IKE port
    pub peer_port: u16,
    /// Local address
    pub local_addr: IpAddr,
    /// Local IKE port
    pub local_port: u16,

    /// Chosen Oakley transform
    pub oakley: OakleyTransAttrs,
    /// Our Diffie-Hellman key pair
    pub dh: Option<DhKeyPair>,
    /// Initiator's public value
    pub gi: Vec<u8>,
    /// Responder's public value
    pub gr: Vec<u8>,
    /// Initiator nonce
    pub ni: Vec<u8>,
    /// Responder nonce
    pub nr: Vec<u8>,
    /// Diffie-Hellman shared secret
    pub gxy: Zeroizing<Vec<u8>>,
    /// SKEYID family
    pub keys: IsakmpKeys,
    /// CBC chaining IV for the next message
    pub iv: Vec<u8>,
    /// Last CBC block of Phase 1, seed of every Phase 2 IV
    pub ph1_iv: Vec<u8>,
    /// Initiator's Phase 1 SA payload body (for HASH_I / HASH_R)
    pub p1isa: Vec<u8>,
    /// Peer's authenticated identity
    pub peer_id: Identity,
    /// Peer's ID payload body, kept for the Aggressive Mode HASH_I check
    pub peer_id_body: Vec<u8>,
    /// Peer announced dead peer detection support
    pub peer_supports_dpd: bool,

    /// Chosen IPsec protocols
    pub ipsec: IpsecSelection,
    /// Quick Mode PFS group, if any
    pub pfs_group: Option<u16>,
    /// Our client subnet of this IPsec SA
    pub our_client: Subnet,
    /// Peer client subnet of this IPsec SA
    pub peer_client: Subnet,
    /// Transport protocol of the protected traffic
    pub protocol: u8,
    /// Our client port
    pub our_port: u16,
    /// Peer client port
    pub peer_port_client: u16,

    /// Last message received, as received
    pub rpacket: Vec<u8>,
    /// Last message sent
    pub tpacket: Vec<u8>,
    /// Retransmissions of `tpacket` so far
    pub retransmits: u32,
    /// Rekey margin chosen when the replace event was scheduled
    pub margin: Duration,
    /// Waiting for an asynchronous answer
    pub suspended: Option<Continuation>,
    /// PAYLOAD_MALFORMED notifications we sent
    pub malformed_sent: u32,
    /// PAYLOAD_MALFORMED notifications we received
    pub malformed_received: u32,
    /// NAT traversal progress
    pub nat: NatTraversal,
    /// Dead peer detection, once enabled
    pub dpd: Option<DpdState>,
    /// When the state was created
    pub created: Instant,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("serial", &self.serial)
            .field("kind", &self.kind)
            .field("connection", &self.connection)
            .field("icookie", &hex::encode(self.icookie))
            .field("rcookie", &hex::encode(self.rcookie))
            .field("msgid", &format_args!("0x{:08x}", self.msgid))
            .field("peer", &self.peer_addr)
            .field("keys", &self.keys)
            .finish()
    }
}

impl State {
    /// Fresh state with nothing negotiated
    pub fn new(connection: ConnId, kind: StateKind, initiator: bool, now: Instant) -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        State {
            serial: SerialNo::NOBODY,
            clonedfrom: SerialNo::NOBODY,
            kind,
            connection,
            icookie: ZERO_COOKIE,
            rcookie: ZERO_COOKIE,
            msgid: 0,
            used_msgids: Vec::new(),
            initiator,
            policy: Policy::default(),
            try_: 0,
            replacing: SerialNo::NOBODY,
            whack_waiting: false,
            peer_addr: any,
            peer_port: 0,
            local_addr: any,
            local_port: 0,
            oakley: OakleyTransAttrs::default(),
            dh: None,
            gi: Vec::new(),
            gr: Vec::new(),
            ni: Vec::new(),
            nr: Vec::new(),
            gxy: Zeroizing::new(Vec::new()),
            keys: IsakmpKeys::default(),
            iv: Vec::new(),
            ph1_iv: Vec::new(),
            p1isa: Vec::new(),
            peer_id: Identity::None,
            peer_id_body: Vec::new(),
            peer_supports_dpd: false,
            ipsec: IpsecSelection::default(),
            pfs_group: None,
            our_client: Subnet::all(&any),
            peer_client: Subnet::all(&any),
            protocol: 0,
            our_port: 0,
            peer_port_client: 0,
            rpacket: Vec::new(),
            tpacket: Vec::new(),
            retransmits: 0,
            margin: Duration::ZERO,
            suspended: None,
            malformed_sent: 0,
            malformed_received: 0,
            nat: NatTraversal::default(),
            dpd: None,
            created: now,
        }
    }

    /// New Quick Mode state inheriting the keys and addressing of this
    /// Phase 1 state
    pub fn duplicate(&self, kind: StateKind, initiator: bool, now: Instant) -> State {
        let mut st = State::new(self.connection, kind, initiator, now);
        st.clonedfrom = self.serial;
        st.icookie = self.icookie;
        st.rcookie = self.rcookie;
        st.peer_addr = self.peer_addr;
        st.peer_port = self.peer_port;
        st.local_addr = self.local_addr;
        st.local_port = self.local_port;
        st.oakley = self.oakley;
        st.keys = self.keys.clone();
        st.ph1_iv = self.ph1_iv.clone();
        st.peer_id = self.peer_id.clone();
        st.nat = self.nat.clone();
        st.policy = self.policy;
        st
    }

    /// Negotiated hash, once Phase 1 chose one
    pub fn hasher(&self) -> Option<HashAlgorithm> {
        HashAlgorithm::from_oakley(self.oakley.hash)
    }

    /// Negotiated cipher, once Phase 1 chose one
    pub fn encrypter(&self) -> Option<EncryptAlgorithm> {
        EncryptAlgorithm::from_oakley(self.oakley.encrypt, self.oakley.enc_key_len)
    }

    /// Lifetime negotiated for this SA, in seconds
    pub fn negotiated_life(&self) -> u32 {
        if self.kind.is_phase1() {
            return self.oakley.life_seconds;
        }
        [self.ipsec.ah, self.ipsec.esp, self.ipsec.ipcomp]
            .iter()
            .flatten()
            .map(|p| p.attrs.life_seconds)
            .min()
            .unwrap_or(0)
    }

    /// Has `msgid` been used under this ISAKMP SA
    pub fn msgid_used(&self, msgid: u32) -> bool {
        self.used_msgids.contains(&msgid)
    }

    /// Whether the SA in this state has been authenticated
    pub fn is_established(&self) -> bool {
        self.kind.is_isakmp_sa_established() || self.kind.is_ipsec_sa_established()
    }
}

/// Every live state, indexed by serial
#[derive(Debug, Default)]
pub struct StateTable {
    states: BTreeMap<SerialNo, State>,
    last_serial: u64,
}

impl StateTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of states
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// No states at all
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Add a state, assigning its serial
    pub fn insert(&mut self, mut st: State) -> SerialNo {
        self.last_serial += 1;
        let serial = SerialNo(self.last_serial);
        st.serial = serial;
        debug!(serial = %serial, kind = %st.kind, "inserting state object");
        self.states.insert(serial, st);
        serial
    }

    /// Look up by serial
    pub fn get(&self, serial: SerialNo) -> Option<&State> {
        self.states.get(&serial)
    }

    /// Look up by serial, mutably
    pub fn get_mut(&mut self, serial: SerialNo) -> Option<&mut State> {
        self.states.get_mut(&serial)
    }

    /// Remove a state
    pub fn remove(&mut self, serial: SerialNo) -> Option<State> {
        self.states.remove(&serial)
    }

    /// All serials, oldest first
    pub fn serials(&self) -> Vec<SerialNo> {
        self.states.keys().copied().collect()
    }

    /// Iterate oldest first
    pub fn iter(&self) -> impl Iterator<Item = &State> + '_ {
        self.states.values()
    }

    /// Find the state of an exchange
    ///
    /// A zero `rcookie` in the table matches whatever the peer sent, which
    /// is how an initiator's MAIN_I1 state picks up the responder's cookie.
    pub fn find(&self, icookie: &Cookie, rcookie: &Cookie, peer: &IpAddr, msgid: u32) -> Option<SerialNo> {
        self.states
            .values()
            .find(|st| {
                st.icookie == *icookie
                    && (st.rcookie == *rcookie || st.rcookie == ZERO_COOKIE)
                    && st.peer_addr == *peer
                    && st.msgid == msgid
            })
            .map(|st| st.serial)
    }

    /// Find the Phase 1 state owning the cookies
    pub fn find_phase1(&self, icookie: &Cookie, rcookie: &Cookie, peer: &IpAddr) -> Option<SerialNo> {
        self.states
            .values()
            .find(|st| {
                st.kind.is_phase1()
                    && st.icookie == *icookie
                    && st.rcookie == *rcookie
                    && st.peer_addr == *peer
            })
            .map(|st| st.serial)
    }

    /// Record `msgid` as used under the ISAKMP SA `p1`; false if it was
    /// already used
    pub fn reserve_msgid(&mut self, p1: SerialNo, msgid: u32) -> bool {
        match self.states.get_mut(&p1) {
            Some(st) if !st.msgid_used(msgid) => {
                st.used_msgids.push(msgid);
                true
            }
            _ => false,
        }
    }

    /// Pick and reserve a fresh non-zero message ID under `p1`
    pub fn generate_msgid(&mut self, p1: SerialNo) -> Option<u32> {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let msgid: u32 = rng.gen();
            if msgid != 0 && self.reserve_msgid(p1, msgid) {
                return Some(msgid);
            }
        }
        None
    }

    /// IV of a new Phase 2 or Informational exchange under `p1`
    pub fn phase2_iv(&self, p1: SerialNo, msgid: u32) -> Option<Vec<u8>> {
        let st = self.states.get(&p1)?;
        let hash = st.hasher()?;
        let enc = st.encrypter()?;
        Some(keys::phase2_iv(hash, enc, &st.ph1_iv, msgid))
    }

    /// States negotiating for `conn`
    pub fn of_connection(&self, conn: ConnId) -> Vec<SerialNo> {
        self.states
            .values()
            .filter(|st| st.connection == conn)
            .map(|st| st.serial)
            .collect()
    }

    /// Quick Mode states cloned from `p1`
    pub fn children_of(&self, p1: SerialNo) -> Vec<SerialNo> {
        self.states
            .values()
            .filter(|st| st.clonedfrom == p1)
            .map(|st| st.serial)
            .collect()
    }

    /// Established IPsec state under the same peer whose SA uses `spi` for
    /// `protocol` in either direction
    pub fn find_by_spi(&self, peer: &IpAddr, protocol: u8, spi: u32) -> Option<SerialNo> {
        use crate::isakmp::proto;
        self.states
            .values()
            .find(|st| {
                if st.peer_addr != *peer || !st.kind.is_quick() {
                    return false;
                }
                let info = match protocol {
                    proto::IPSEC_AH => st.ipsec.ah,
                    proto::IPSEC_ESP => st.ipsec.esp,
                    proto::IPCOMP => st.ipsec.ipcomp,
                    _ => None,
                };
                info.map_or(false, |i| i.our_spi == spi || i.peer_spi == spi)
            })
            .map(|st| st.serial)
    }

    /// Established ISAKMP state with the given cookies, any peer
    pub fn find_by_cookies(&self, icookie: &Cookie, rcookie: &Cookie) -> Option<SerialNo> {
        self.states
            .values()
            .find(|st| st.kind.is_phase1() && st.icookie == *icookie && st.rcookie == *rcookie)
            .map(|st| st.serial)
    }
}

/// Random cookie, never all zero
pub fn new_cookie() -> Cookie {
    let mut rng = rand::thread_rng();
    loop {
        let cookie: Cookie = rng.gen();
        if cookie != ZERO_COOKIE {
            return cookie;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionRegistry;
    use crate::config::{ConnectionConfig, EndConfig};
    use crate::whack::WhackLog;

    fn conn_id() -> ConnId {
        let mut reg = ConnectionRegistry::new();
        let cfg = ConnectionConfig::builder("test")
            .with_left(EndConfig::host("192.0.2.1".parse().expect("valid address")))
            .with_right(EndConfig::host("192.0.2.2".parse().expect("valid address")))
            .with_psk(b"secret".to_vec())
            .build()
            .expect("valid connection");
        reg.add(&cfg, &[], &mut WhackLog::new()).expect("connection added")
    }

    fn phase1(table: &mut StateTable, conn: ConnId, ic: Cookie, rc: Cookie) -> SerialNo {
        let mut st = State::new(conn, StateKind::MainR1, false, Instant::now());
        st.icookie = ic;
        st.rcookie = rc;
        st.peer_addr = "192.0.2.2".parse().expect("valid address");
        table.insert(st)
    }

    #[test]
    fn test_kind_order_and_codes() {
        for pair in StateKind::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(StateKind::MainR0.ordinal(), 1);
        assert_eq!(StateKind::MainR0.rc_code(), 101);
        assert_eq!(StateKind::QuickI2.name(), "STATE_QUICK_I2");
        assert_eq!(StateKind::ALL[StateKind::AggrR1.index()], StateKind::AggrR1);
    }

    #[test]
    fn test_kind_predicates() {
        assert!(StateKind::AggrR2.is_phase1());
        assert!(!StateKind::QuickR0.is_phase1());
        assert!(StateKind::QuickR1.is_quick());
        assert!(StateKind::MainI4.is_isakmp_sa_established());
        assert!(!StateKind::MainI3.is_isakmp_sa_established());
        assert!(StateKind::QuickR2.is_ipsec_sa_established());
        assert!(StateKind::MainR2.is_isakmp_encrypted());
        assert!(!StateKind::MainR1.is_isakmp_encrypted());
        assert!(!StateKind::AggrI1.is_isakmp_encrypted());
    }

    #[test]
    fn test_serials_are_monotonic() {
        let conn = conn_id();
        let mut table = StateTable::new();
        let a = phase1(&mut table, conn, [1; 8], [2; 8]);
        let b = phase1(&mut table, conn, [3; 8], [4; 8]);
        assert!(b > a);
        table.remove(a);
        let c = phase1(&mut table, conn, [5; 8], [6; 8]);
        assert!(c > b);
        assert_eq!(table.len(), 2);
        assert_eq!(format!("{}", c), "#3");
    }

    #[test]
    fn test_find_by_cookies_and_msgid() {
        let conn = conn_id();
        let mut table = StateTable::new();
        let peer: IpAddr = "192.0.2.2".parse().expect("valid address");
        let p1 = phase1(&mut table, conn, [1; 8], [2; 8]);
        assert_eq!(table.find(&[1; 8], &[2; 8], &peer, 0), Some(p1));
        assert_eq!(table.find(&[1; 8], &[2; 8], &peer, 7), None);
        assert_eq!(table.find(&[1; 8], &[2; 8], &"192.0.2.9".parse().expect("valid address"), 0), None);

        let mut qm = table.get(p1).expect("state exists").duplicate(StateKind::QuickR1, false, Instant::now());
        qm.msgid = 7;
        let q = table.insert(qm);
        assert_eq!(table.find(&[1; 8], &[2; 8], &peer, 7), Some(q));
        assert_eq!(table.find_phase1(&[1; 8], &[2; 8], &peer), Some(p1));
        assert_eq!(table.children_of(p1), vec![q]);
    }

    #[test]
    fn test_initiator_state_matches_any_rcookie() {
        let conn = conn_id();
        let mut table = StateTable::new();
        let peer: IpAddr = "192.0.2.2".parse().expect("valid address");
        let s = phase1(&mut table, conn, [1; 8], ZERO_COOKIE);
        assert_eq!(table.find(&[1; 8], &[9; 8], &peer, 0), Some(s));
    }

    #[test]
    fn test_msgid_reservation() {
        let conn = conn_id();
        let mut table = StateTable::new();
        let p1 = phase1(&mut table, conn, [1; 8], [2; 8]);
        assert!(table.reserve_msgid(p1, 0x1234));
        assert!(!table.reserve_msgid(p1, 0x1234));
        assert!(!table.reserve_msgid(SerialNo(99), 1));

        let fresh = table.generate_msgid(p1).expect("msgid generated");
        assert_ne!(fresh, 0);
        assert!(table.get(p1).expect("state exists").msgid_used(fresh));
    }

    #[test]
    fn test_phase2_iv_needs_keys() {
        let conn = conn_id();
        let mut table = StateTable::new();
        let p1 = phase1(&mut table, conn, [1; 8], [2; 8]);
        assert!(table.phase2_iv(p1, 1).is_none());

        let st = table.get_mut(p1).expect("state exists");
        st.oakley.hash = crate::isakmp::oakley::MD5;
        st.oakley.encrypt = crate::isakmp::oakley::DES_CBC;
        st.ph1_iv = vec![0u8; 8];
        let a = table.phase2_iv(p1, 1).expect("iv derived");
        let b = table.phase2_iv(p1, 2).expect("iv derived");
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_cookie_never_zero() {
        for _ in 0..32 {
            assert_ne!(new_cookie(), ZERO_COOKIE);
        }
    }
}
