//! State transition functions
//!
//! One function per microcode processor. Each one reads the digested
//! message, updates (or creates) the state and leaves its reply in
//! [`MsgDigest::reply`]; [`IkeDaemon::complete_state_transition`] does the
//! rest. Only pre-shared key authentication is carried out: signature rows
//! of the microcode end in INVALID_KEY_INFORMATION.

mod aggressive;
mod informational;
mod main_mode;
mod quick_mode;

use crate::connections::{ConnId, Connection, Identity};
use crate::crypto::{keys, DhGroup, DhKeyPair, IsakmpKeys};
use crate::daemon::IkeDaemon;
use crate::demux::{MsgDigest, Transition};
use crate::dpd::DPD_VENDOR_ID;
use crate::error::Error;
use crate::isakmp::{oakley, IdPayload, MessageBuilder, Notification, PayloadType};
use crate::nat::{self, NatTraversal, NatVendorId, NatdContext};
use crate::spdb::OakleyTransAttrs;
use crate::state::{Continuation, SerialNo, State};
use rand::RngCore;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Outcome of a state transition function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StfResult {
    /// Advance to the next state
    Ok,
    /// Refuse the message, telling the peer why
    Fail(Notification),
    /// Waiting for an asynchronous answer; the message is kept
    Suspend,
    /// Drop the message without a word
    Ignore,
    /// Something broke on our side
    InternalError,
}

impl From<Notification> for StfResult {
    fn from(n: Notification) -> Self {
        StfResult::Fail(n)
    }
}

impl From<Error> for StfResult {
    fn from(e: Error) -> Self {
        match e {
            Error::Notification(n) => StfResult::Fail(n),
            other => {
                debug!("transition aborted: {}", other);
                StfResult::InternalError
            }
        }
    }
}

/// A transition either finishes with a result or bails out early with one
pub(crate) type Step<T> = std::result::Result<T, StfResult>;

/// Bytes of nonce we send
pub(crate) const NONCE_SIZE: usize = 16;

/// A fresh nonce
pub(crate) fn nonce() -> Vec<u8> {
    let mut n = vec![0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut n);
    n
}

/// Constant time comparison of a received hash
pub(crate) fn hash_matches(received: Option<&[u8]>, computed: &[u8]) -> bool {
    match received {
        Some(r) => r.len() == computed.len() && bool::from(r.ct_eq(computed)),
        None => false,
    }
}

/// Lifetime for the wire, saturating
pub(crate) fn life_secs(d: Duration) -> u32 {
    u32::try_from(d.as_secs()).unwrap_or(u32::MAX)
}

/// Human readable Oakley transform for the logs
pub(crate) fn oakley_story(attrs: &OakleyTransAttrs) -> String {
    let enc = match attrs.encrypt {
        oakley::DES_CBC => "des".to_string(),
        oakley::TRIPLE_DES_CBC => "3des".to_string(),
        oakley::AES_CBC => format!("aes{}", if attrs.enc_key_len == 0 { 128 } else { attrs.enc_key_len }),
        other => other.to_string(),
    };
    let hash = match attrs.hash {
        oakley::MD5 => "md5".to_string(),
        oakley::SHA1 => "sha1".to_string(),
        other => other.to_string(),
    };
    format!(
        "cipher={} prf={} group=modp{} life={}s",
        enc,
        hash,
        DhGroup::from_oakley(attrs.group).map_or(0, |g| g.bytes() * 8),
        attrs.life_seconds
    )
}

/// Vendor IDs we announce: the chosen (or every) NAT-T id and DPD
pub(crate) fn add_vendor_ids(b: &mut MessageBuilder, nat: Option<&NatTraversal>, nat_traversal: bool, dpd: bool) {
    if nat_traversal {
        match nat.and_then(|n| n.vid) {
            Some(vid) => {
                b.add_payload(PayloadType::VID, vid.bytes());
            }
            None if nat.is_none() => {
                for vid in NatVendorId::ALL {
                    b.add_payload(PayloadType::VID, vid.bytes());
                }
            }
            None => {}
        }
    }
    if dpd {
        b.add_payload(PayloadType::VID, &DPD_VENDOR_ID);
    }
}

/// NAT-D payloads for the addressing of `st`, in the numbering the peer
/// negotiated
pub(crate) fn add_natd(b: &mut MessageBuilder, st: &State, forceencaps: bool) {
    let (Some(method), Some(hash)) = (st.nat.method, st.hasher()) else {
        return;
    };
    let ctx = NatdContext {
        hash,
        icookie: &st.icookie,
        rcookie: &st.rcookie,
        local_addr: st.local_addr,
        local_port: st.local_port,
        peer_addr: st.peer_addr,
        peer_port: st.peer_port,
        forceencaps,
    };
    for natd in nat::natd_payloads(&ctx) {
        b.add_payload(method.natd_payload(), &natd);
    }
}

/// Compare the peer's NAT-D payloads with what we see
pub(crate) fn nat_discovery(st: &mut State, md: &MsgDigest, forceencaps: bool) {
    let natd = md.bodies(PayloadType::NatDRfc);
    if st.nat.method.is_none() || natd.is_empty() {
        return;
    }
    let Some(hash) = st.hasher() else {
        return;
    };
    let (icookie, rcookie) = (st.icookie, st.rcookie);
    let ctx = NatdContext {
        hash,
        icookie: &icookie,
        rcookie: &rcookie,
        local_addr: md.local,
        local_port: md.local_port,
        peer_addr: md.sender,
        peer_port: md.sender_port,
        forceencaps,
    };
    nat::natd_lookup(&mut st.nat, &natd, &ctx);
}

/// Our key pair for an Oakley group
pub(crate) fn start_dh(group: u16) -> Step<DhKeyPair> {
    match DhGroup::from_oakley(group) {
        Some(g) => Ok(g.generate()),
        None => {
            info!("unsupported Diffie-Hellman group {}", group);
            Err(StfResult::Fail(Notification::InvalidKeyInformation))
        }
    }
}

/// The peer's public value must be exactly as long as the group's prime
pub(crate) fn check_ke(group: u16, ke: &[u8]) -> Step<()> {
    let required = DhGroup::from_oakley(group).map_or(0, DhGroup::bytes);
    if ke.len() != required {
        info!(
            "KE has {} byte DH public value; {} required",
            ke.len(),
            required
        );
        return Err(StfResult::Fail(Notification::InvalidKeyInformation));
    }
    Ok(())
}

/// Finish the Diffie-Hellman exchange of Phase 1 and derive every key
///
/// Expects both public values and both nonces in `st`.
pub(crate) fn phase1_keys(st: &mut State, psk: &[u8]) -> Step<()> {
    let hash = st.hasher().ok_or(StfResult::InternalError)?;
    let enc = st.encrypter().ok_or(StfResult::InternalError)?;
    let peer_g = if st.initiator { &st.gr } else { &st.gi };
    let dh = st.dh.as_ref().ok_or(StfResult::InternalError)?;
    let gxy = dh.compute_shared_secret(peer_g).map_err(|e| {
        info!("Diffie-Hellman failed: {}", e);
        StfResult::Fail(Notification::InvalidKeyInformation)
    })?;
    st.keys = IsakmpKeys::derive_psk(hash, enc, psk, &st.ni, &st.nr, &gxy, &st.icookie, &st.rcookie);
    st.gxy = Zeroizing::new(gxy);
    st.iv = keys::phase1_iv(hash, enc, &st.gi, &st.gr);
    Ok(())
}

/// HASH_I (`of_initiator`) or HASH_R of a Phase 1 state over `id_body`
pub(crate) fn phase1_auth_hash(st: &State, of_initiator: bool, id_body: &[u8]) -> Step<Vec<u8>> {
    let hash = st.hasher().ok_or(StfResult::InternalError)?;
    let (g_mine, g_peer, ck_mine, ck_peer) = if of_initiator {
        (&st.gi, &st.gr, &st.icookie, &st.rcookie)
    } else {
        (&st.gr, &st.gi, &st.rcookie, &st.icookie)
    };
    Ok(keys::auth_hash(
        hash,
        &st.keys.skeyid,
        g_mine,
        g_peer,
        ck_mine,
        ck_peer,
        &st.p1isa,
        id_body,
    ))
}

/// Our Phase 1 identity for a connection
pub(crate) fn our_id(c: &Connection, st: &State) -> Identity {
    if c.this.id.is_none() {
        Identity::Addr(st.local_addr)
    } else {
        c.this.id.clone()
    }
}

/// Only pre-shared keys are usable for authentication
pub(crate) fn require_psk(st: &State) -> Step<()> {
    if st.oakley.auth == oakley::PRESHARED_KEY {
        Ok(())
    } else {
        info!(
            "authentication method {} needs keys we do not hold",
            st.oakley.auth
        );
        Err(StfResult::Fail(Notification::InvalidKeyInformation))
    }
}

impl IkeDaemon {
    /// Run the transition function of a microcode row
    pub(crate) fn run_transition(&mut self, t: Transition, md: &mut MsgDigest, now: Instant) -> StfResult {
        let step = match t {
            Transition::Unexpected => Ok(self.unexpected(md)),
            Transition::Informational => self.informational(md, now),
            Transition::MainInI1OutR1 => self.main_in_i1_out_r1(md, now),
            Transition::MainInR1OutI2 => self.main_in_r1_out_i2(md),
            Transition::MainInI2OutR2 => self.main_in_i2_out_r2(md),
            Transition::MainInR2OutI3 => self.main_in_r2_out_i3(md),
            Transition::MainInI3OutR3 => self.main_in_i3_out_r3(md),
            Transition::MainInR3 => self.main_in_r3(md),
            Transition::AggrInI1OutR1 => self.aggr_in_i1_out_r1(md, now),
            Transition::AggrInR1OutI2 => self.aggr_in_r1_out_i2(md),
            Transition::AggrInI2 => self.aggr_in_i2(md),
            Transition::QuickInI1OutR1 => self.quick_in_i1_out_r1(md, now),
            Transition::QuickInR1OutI2 => self.quick_in_r1_out_i2(md),
            Transition::QuickInI2 => self.quick_in_i2(md),
        };
        step.unwrap_or_else(|r| r)
    }

    /// A message nothing is expected for
    fn unexpected(&self, md: &MsgDigest) -> StfResult {
        info!("unexpected message received in state {}", md.from_state);
        StfResult::Ignore
    }

    /// Park `md` on its state until an asynchronous answer arrives
    pub(crate) fn suspend(
        &mut self,
        md: &MsgDigest,
        reason: &'static str,
        resume: Transition,
        now: Instant,
    ) -> StfResult {
        let Some(st) = self.states.get_mut(md.st) else {
            return StfResult::InternalError;
        };
        debug!("suspending {} for {}", st.serial, reason);
        st.suspended = Some(Continuation {
            reason,
            resume,
            md: Box::new(md.clone()),
            started: now,
        });
        StfResult::Suspend
    }

    /// State of a transition, which must exist
    pub(crate) fn state_mut(&mut self, serial: SerialNo) -> Step<&mut State> {
        self.states.get_mut(serial).ok_or(StfResult::InternalError)
    }

    /// Snapshot of a connection
    pub(crate) fn conn_snapshot(&self, conn: ConnId) -> Step<Connection> {
        self.connections.get(conn).cloned().ok_or(StfResult::InternalError)
    }

    /// Pre-shared key of a connection
    pub(crate) fn conn_psk(&self, conn: ConnId) -> Step<Vec<u8>> {
        match self.connections.get(conn).and_then(Connection::psk) {
            Some(psk) => Ok(psk.to_vec()),
            None => {
                info!("no pre-shared key for {}", self.conn_name(conn));
                Err(StfResult::Fail(Notification::InvalidKeyInformation))
            }
        }
    }

    /// Decode and accept the peer's Phase 1 identity
    ///
    /// The responder may move the state to a better fitting connection,
    /// instantiating a template. The initiator insists on the identity it
    /// was configured to expect.
    pub(crate) fn accept_peer_id(&mut self, serial: SerialNo, id_body: &[u8], aggrmode: bool) -> Step<()> {
        let fail = StfResult::Fail(Notification::InvalidIdInformation);
        let peer_id = IdPayload::from_bytes(id_body)
            .and_then(|p| Identity::from_id_payload(&p))
            .map_err(|e| {
                info!("bad peer ID payload: {}", e);
                fail
            })?;
        let st = self.states.get(serial).ok_or(StfResult::InternalError)?;
        let (conn, peer, initiator) = (st.connection, st.peer_addr, st.initiator);
        let c = self.connections.get(conn).ok_or(StfResult::InternalError)?;

        if initiator {
            if !c.that.id.is_none() && !c.that.id.same_id(&peer_id) {
                info!(
                    "we require peer to have ID '{}', but peer declares '{}'",
                    c.that.id, peer_id
                );
                return Err(fail);
            }
        } else {
            let Some(r) = self
                .connections
                .refine_host_connection(conn, &peer_id, false, aggrmode, crate::policy::Policy::PSK)
            else {
                info!("no suitable connection for peer '{}'", peer_id);
                return Err(fail);
            };
            let mut target = r;
            if r != conn {
                let template = self
                    .connections
                    .get(r)
                    .map_or(false, |d| d.kind == crate::connections::ConnKind::Template);
                if template {
                    target = self.connections.rw_instantiate(r, peer, Some(&peer_id))?;
                }
                info!(
                    "switched from {} to {}",
                    self.conn_name(conn),
                    self.conn_name(target)
                );
                self.state_mut(serial)?.connection = target;
                self.discard_idle_instance(conn);
            } else if let Some(c) = self.connections.get_mut(conn) {
                if c.kind.is_instance() && c.that.id.is_none() {
                    c.that.id = peer_id.clone();
                }
            }
        }
        let st = self.state_mut(serial)?;
        st.peer_id = peer_id;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_matches_rejects_length_and_content() {
        assert!(hash_matches(Some(&[1, 2, 3]), &[1, 2, 3]));
        assert!(!hash_matches(Some(&[1, 2]), &[1, 2, 3]));
        assert!(!hash_matches(Some(&[1, 2, 4]), &[1, 2, 3]));
        assert!(!hash_matches(None, &[1, 2, 3]));
    }

    #[test]
    fn test_error_maps_to_result() {
        assert_eq!(
            StfResult::from(Error::Notification(Notification::NoProposalChosen)),
            StfResult::Fail(Notification::NoProposalChosen)
        );
        assert_eq!(
            StfResult::from(Error::Kernel("no SPI".into())),
            StfResult::InternalError
        );
    }

    #[test]
    fn test_nonce_is_fresh() {
        let a = nonce();
        let b = nonce();
        assert_eq!(a.len(), NONCE_SIZE);
        assert_ne!(a, b);
    }

    #[test]
    fn test_first_message_offers_every_nat_vendor_id() {
        use crate::isakmp::{ExchangeType, IsakmpFlags, IsakmpHeader};
        let hdr = IsakmpHeader::new([1; 8], [0; 8], ExchangeType::IdProt, IsakmpFlags::default(), 0);
        let mut b = MessageBuilder::new(&hdr);
        add_vendor_ids(&mut b, None, true, true);
        let msg = b.finish();
        for vid in NatVendorId::ALL {
            assert!(msg.windows(vid.bytes().len()).any(|w| w == vid.bytes()));
        }
        assert!(msg.windows(DPD_VENDOR_ID.len()).any(|w| w == DPD_VENDOR_ID));
    }
}
