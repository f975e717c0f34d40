//! Message digest
//!
//! A [`MsgDigest`] is an incoming message after header checks, decryption
//! and the payload walk: the (decrypted) bytes plus the position of every
//! payload body, in arrival order. Transitions read payloads through it
//! and never re-parse the chain.

use super::microcode::{Microcode, SmfFlags};
use crate::config::PAYLIMIT;
use crate::isakmp::{
    DeletePayload, GenericHeader, IdPayload, IsakmpHeader, NatOaPayload, Notification,
    NotificationPayload, PayloadType, SaHeader, GENERIC_HEADER_SIZE, ISAKMP_HEADER_SIZE,
};
use crate::nat::{NatMethod, NatVendorId};
use crate::state::{SerialNo, StateKind};
use std::net::IpAddr;
use std::time::Instant;
use tracing::debug;

/// Position of one payload body within [`MsgDigest::message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadDigest {
    /// Payload type, NAT-T draft codes already mapped to the RFC codes
    pub ptype: PayloadType,
    /// Start of the body (after the generic header)
    pub offset: usize,
    /// Body length
    pub len: usize,
}

impl PayloadDigest {
    /// Offset just past the body
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Why a message was refused during the payload walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Log text
    pub reason: String,
    /// Notification owed to the peer, if any
    pub notify: Option<Notification>,
}

impl Rejection {
    pub(crate) fn new(reason: String, notify: Option<Notification>) -> Self {
        Rejection { reason, notify }
    }
}

/// An incoming message being processed
#[derive(Debug, Clone)]
pub struct MsgDigest {
    /// Parsed ISAKMP header
    pub hdr: IsakmpHeader,
    /// The datagram as received
    pub raw: Vec<u8>,
    /// Header followed by the plaintext body
    pub message: Vec<u8>,
    /// Where the last payload ends; anything after is padding
    pub payload_end: usize,
    /// Sender address
    pub sender: IpAddr,
    /// Sender port
    pub sender_port: u16,
    /// Address the message arrived on
    pub local: IpAddr,
    /// Port the message arrived on
    pub local_port: u16,
    /// When it arrived
    pub received: Instant,
    /// State the message is processed in
    pub from_state: StateKind,
    /// Row of the microcode table
    pub smc: usize,
    /// State it belongs to, if one exists already
    pub st: SerialNo,
    /// The body was encrypted
    pub encrypted: bool,
    /// IV to install once the transition succeeds
    pub new_iv: Vec<u8>,
    /// Payloads in arrival order
    pub payloads: Vec<PayloadDigest>,
    /// Peer announced dead peer detection
    pub dpd: bool,
    /// Most preferred NAT-T vendor id the peer sent
    pub nat_vid: Option<NatVendorId>,
    /// Processed a second time after a suspension
    pub resumed: bool,
    /// Reply built by the transition
    pub reply: Vec<u8>,
}

impl MsgDigest {
    /// Digest of a header-checked message, nothing walked yet
    pub fn new(
        hdr: IsakmpHeader,
        raw: Vec<u8>,
        sender: IpAddr,
        sender_port: u16,
        local: IpAddr,
        local_port: u16,
        received: Instant,
    ) -> Self {
        let message = raw.clone();
        let payload_end = message.len();
        MsgDigest {
            hdr,
            raw,
            message,
            payload_end,
            sender,
            sender_port,
            local,
            local_port,
            received,
            from_state: StateKind::Info,
            smc: 0,
            st: SerialNo::NOBODY,
            encrypted: false,
            new_iv: Vec::new(),
            payloads: Vec::new(),
            dpd: false,
            nat_vid: None,
            resumed: false,
            reply: Vec::new(),
        }
    }

    /// Body of a digested payload
    pub fn body(&self, pd: &PayloadDigest) -> &[u8] {
        &self.message[pd.offset..pd.end()]
    }

    /// Digests of every payload of type `ptype`, in order
    pub fn chain(&self, ptype: PayloadType) -> impl Iterator<Item = &PayloadDigest> + '_ {
        let bit = ptype.bit();
        self.payloads.iter().filter(move |pd| pd.ptype.bit() == bit)
    }

    /// Bodies of every payload of type `ptype`, in order
    pub fn bodies(&self, ptype: PayloadType) -> Vec<&[u8]> {
        self.chain(ptype).map(|pd| self.body(pd)).collect()
    }

    /// First payload of type `ptype`
    pub fn first(&self, ptype: PayloadType) -> Option<&PayloadDigest> {
        self.chain(ptype).next()
    }

    /// Body of the first payload of type `ptype`
    pub fn first_body(&self, ptype: PayloadType) -> Option<&[u8]> {
        self.first(ptype).map(|pd| self.body(pd))
    }

    /// Number of payloads of type `ptype`
    pub fn count(&self, ptype: PayloadType) -> usize {
        self.chain(ptype).count()
    }

    /// Everything following `pd` up to the end of the last payload
    ///
    /// Quick Mode and Informational hashes cover exactly this range.
    pub fn after(&self, pd: &PayloadDigest) -> &[u8] {
        &self.message[pd.end()..self.payload_end]
    }

    /// Parsed notification payloads; malformed ones are skipped
    pub fn notifications(&self) -> Vec<NotificationPayload> {
        self.chain(PayloadType::N)
            .filter_map(|pd| NotificationPayload::from_bytes(self.body(pd)).ok())
            .collect()
    }
}

/// Check a payload body's fixed part
fn body_well_formed(ptype: PayloadType, body: &[u8]) -> bool {
    match ptype {
        PayloadType::SA => SaHeader::from_bytes(body).is_ok(),
        PayloadType::ID => IdPayload::from_bytes(body).is_ok(),
        PayloadType::N => NotificationPayload::from_bytes(body).is_ok(),
        PayloadType::D => DeletePayload::from_bytes(body).is_ok(),
        PayloadType::NatOaRfc => NatOaPayload::from_bytes(body).is_ok(),
        PayloadType::KE | PayloadType::NONCE | PayloadType::HASH => !body.is_empty(),
        _ => true,
    }
}

/// Map a raw next-payload code to the type used for the walk
///
/// Returns `None` for codes that may not appear at the outermost level.
fn outer_payload_type(np: u8, nat: Option<NatMethod>) -> Option<PayloadType> {
    match PayloadType::from_u8(np)? {
        PayloadType::NatDDrafts => Some(PayloadType::NatDRfc),
        PayloadType::NatOaDrafts => Some(PayloadType::NatOaRfc),
        PayloadType::NatDBadDrafts if nat.map_or(false, NatMethod::uses_bad_draft_values) => {
            Some(PayloadType::NatDRfc)
        }
        PayloadType::NatDBadDrafts
        | PayloadType::NatOaBadDrafts
        | PayloadType::P
        | PayloadType::T
        | PayloadType::None => None,
        other => Some(other),
    }
}

/// Walk the payload chain of `md.message`
///
/// Every payload must be required or optional for `smc`, or be a
/// Notification or Delete. Required payloads must all be present.
pub fn digest_payloads(md: &mut MsgDigest, smc: &Microcode, nat: Option<NatMethod>) -> Result<(), Rejection> {
    let mut excuse = if smc
        .flags
        .contains(SmfFlags::PSK_AUTH | SmfFlags::FIRST_ENCRYPTED_INPUT)
    {
        "authentication failure (mismatch of preshared secrets): "
    } else {
        ""
    };
    let allowed = smc
        .req_payloads
        .union(smc.opt_payloads)
        .with(PayloadType::N)
        .with(PayloadType::D);
    let mut needed = smc.req_payloads;
    let mut np = md.hdr.next_payload;
    let mut pos = ISAKMP_HEADER_SIZE;
    md.payloads.clear();

    while np != PayloadType::None.to_u8() {
        if md.payloads.len() == PAYLIMIT {
            return Err(Rejection::new(
                format!("more than {} payloads in message; ignored", PAYLIMIT),
                Some(Notification::PayloadMalformed),
            ));
        }

        let ptype = match outer_payload_type(np, nat) {
            Some(t) => t,
            None => {
                let name = PayloadType::from_u8(np)
                    .map(|t| t.name().to_string())
                    .unwrap_or_else(|| np.to_string());
                return Err(Rejection::new(
                    format!(
                        "{}message ignored because it contains an unknown or unexpected payload type ({}) at the outermost level",
                        excuse, name
                    ),
                    Some(Notification::InvalidPayloadType),
                ));
            }
        };

        if !allowed.contains(ptype) {
            return Err(Rejection::new(
                format!(
                    "{}message ignored because it contains an payload type ({}) unexpected in this message",
                    excuse,
                    ptype.name()
                ),
                Some(Notification::InvalidPayloadType),
            ));
        }
        needed = needed.minus(crate::isakmp::PayloadSet::of(ptype));

        let malformed = || {
            Rejection::new(
                format!("{}malformed payload in packet", excuse),
                Some(Notification::PayloadMalformed),
            )
        };
        let gen = GenericHeader::from_bytes(&md.message[pos.min(md.message.len())..])
            .map_err(|_| malformed())?;
        let end = pos + gen.length as usize;
        if end > md.message.len() {
            return Err(malformed());
        }
        let pd = PayloadDigest {
            ptype,
            offset: pos + GENERIC_HEADER_SIZE,
            len: gen.length as usize - GENERIC_HEADER_SIZE,
        };
        if !body_well_formed(ptype, md.body(&pd)) {
            return Err(malformed());
        }

        // a payload that parses is evidence the keys were right
        excuse = "";
        md.payloads.push(pd);
        np = gen.next_payload;
        pos = end;
    }

    md.payload_end = pos;
    if pos < md.message.len() {
        debug!("removing {} bytes of padding", md.message.len() - pos);
    }

    if !needed.is_empty() {
        return Err(Rejection::new(
            format!(
                "message for {} is missing payloads {}",
                smc.state.name(),
                needed
            ),
            Some(Notification::PayloadMalformed),
        ));
    }
    Ok(())
}

/// Ordering rules of RFC 2409 Section 5
pub fn check_ordering(md: &MsgDigest) -> Result<(), Rejection> {
    let reject = |reason: &str| Err(Rejection::new(reason.to_string(), None));

    if md.from_state.is_phase1() {
        if md.first(PayloadType::SA).is_some() && md.hdr.next_payload != PayloadType::SA.to_u8() {
            return reject("malformed Phase 1 message: does not start with an SA payload");
        }
    } else if md.from_state.is_quick() {
        if md.hdr.next_payload != PayloadType::HASH.to_u8() {
            return reject("malformed Quick Mode message: does not start with a HASH payload");
        }

        // SA payloads follow the HASH back to back
        for (i, pd) in md.payloads.iter().enumerate() {
            if pd.ptype == PayloadType::SA && !md.payloads[1..=i].iter().all(|p| p.ptype == PayloadType::SA) {
                return reject("malformed Quick Mode message: SA payload is in wrong position");
            }
        }

        let ids: Vec<usize> = md
            .payloads
            .iter()
            .enumerate()
            .filter(|(_, pd)| pd.ptype == PayloadType::ID)
            .map(|(i, _)| i)
            .collect();
        if !ids.is_empty() {
            if ids.len() != 2 {
                return reject(
                    "malformed Quick Mode message: if any ID payload is present, there must be exactly two",
                );
            }
            if ids[0] + 1 != ids[1] {
                return reject("malformed Quick Mode message: the ID payloads are not adjacent");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::microcode::{MicrocodeIndex, MICROCODE};
    use crate::isakmp::{ExchangeType, IsakmpFlags, MessageBuilder};

    fn smc_for(state: StateKind) -> &'static Microcode {
        let index = MicrocodeIndex::build(MICROCODE).expect("table ordered");
        &MICROCODE[index.first(state).expect("state has a row")]
    }

    fn digest(exchange: ExchangeType, msgid: u32, payloads: &[(PayloadType, Vec<u8>)]) -> MsgDigest {
        let hdr = IsakmpHeader::new([1; 8], [0; 8], exchange, IsakmpFlags::default(), msgid);
        let mut b = MessageBuilder::new(&hdr);
        for (t, body) in payloads {
            b.add_payload(*t, body);
        }
        let raw = b.finish();
        let hdr = IsakmpHeader::from_bytes(&raw).expect("valid header");
        let addr: IpAddr = "192.0.2.2".parse().expect("valid address");
        MsgDigest::new(hdr, raw, addr, 500, addr, 500, Instant::now())
    }

    fn sa_body() -> Vec<u8> {
        vec![0, 0, 0, 1, 0, 0, 0, 1]
    }

    #[test]
    fn test_walk_collects_payloads() {
        let mut md = digest(
            ExchangeType::IdProt,
            0,
            &[(PayloadType::SA, sa_body()), (PayloadType::VID, vec![7; 16])],
        );
        digest_payloads(&mut md, smc_for(StateKind::MainR0), None).expect("accepted");
        assert_eq!(md.payloads.len(), 2);
        assert_eq!(md.first_body(PayloadType::SA), Some(&sa_body()[..]));
        assert_eq!(md.count(PayloadType::VID), 1);
        assert!(check_ordering(&md).is_ok());
    }

    #[test]
    fn test_missing_required_payload() {
        let mut md = digest(ExchangeType::IdProt, 0, &[(PayloadType::VID, vec![7; 16])]);
        let err = digest_payloads(&mut md, smc_for(StateKind::MainR0), None).expect_err("rejected");
        assert_eq!(
            err.reason,
            "message for STATE_MAIN_R0 is missing payloads ISAKMP_NEXT_SA"
        );
        assert_eq!(err.notify, Some(Notification::PayloadMalformed));
    }

    #[test]
    fn test_unexpected_payload_type() {
        let mut md = digest(
            ExchangeType::IdProt,
            0,
            &[(PayloadType::SA, sa_body()), (PayloadType::HASH, vec![1; 20])],
        );
        let err = digest_payloads(&mut md, smc_for(StateKind::MainR0), None).expect_err("rejected");
        assert!(err.reason.contains("(ISAKMP_NEXT_HASH) unexpected in this message"));
        assert_eq!(err.notify, Some(Notification::InvalidPayloadType));
    }

    #[test]
    fn test_bad_draft_natd_needs_old_method() {
        let payloads = [
            (PayloadType::KE, vec![1; 96]),
            (PayloadType::NONCE, vec![2; 16]),
            (PayloadType::NatDBadDrafts, vec![3; 20]),
        ];
        let smc = smc_for(StateKind::MainR1);
        let mut md = digest(ExchangeType::IdProt, 0, &payloads);
        let err = digest_payloads(&mut md, smc, Some(NatMethod::Rfc)).expect_err("rejected");
        assert!(err.reason.contains("at the outermost level"));

        let mut md = digest(ExchangeType::IdProt, 0, &payloads);
        digest_payloads(&mut md, smc, Some(NatMethod::Ietf0001)).expect("accepted");
        assert_eq!(md.count(PayloadType::NatDRfc), 1);
        assert_eq!(md.payloads[2].ptype, PayloadType::NatDRfc);
    }

    #[test]
    fn test_draft_natd_remapped() {
        let payloads = [
            (PayloadType::KE, vec![1; 96]),
            (PayloadType::NONCE, vec![2; 16]),
            (PayloadType::NatDDrafts, vec![3; 20]),
            (PayloadType::NatDDrafts, vec![4; 20]),
        ];
        let mut md = digest(ExchangeType::IdProt, 0, &payloads);
        digest_payloads(&mut md, smc_for(StateKind::MainR1), None).expect("accepted");
        assert_eq!(md.bodies(PayloadType::NatDRfc).len(), 2);
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let mut md = digest(ExchangeType::IdProt, 0, &[(PayloadType::SA, sa_body())]);
        // claim a longer SA payload than the message holds
        md.message[ISAKMP_HEADER_SIZE + 3] = 0x40;
        let err = digest_payloads(&mut md, smc_for(StateKind::MainR0), None).expect_err("rejected");
        assert_eq!(err.reason, "malformed payload in packet");
    }

    #[test]
    fn test_psk_excuse_on_first_encrypted_input() {
        let mut md = digest(ExchangeType::IdProt, 0, &[(PayloadType::ID, vec![1])]);
        let err = digest_payloads(&mut md, smc_for(StateKind::MainR2), None).expect_err("rejected");
        assert!(err
            .reason
            .starts_with("authentication failure (mismatch of preshared secrets): "));
    }

    #[test]
    fn test_padding_is_ignored() {
        let mut md = digest(ExchangeType::IdProt, 0, &[(PayloadType::SA, sa_body())]);
        md.message.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0]);
        digest_payloads(&mut md, smc_for(StateKind::MainR0), None).expect("accepted");
        assert_eq!(md.payload_end, md.message.len() - 7);
    }

    #[test]
    fn test_quick_mode_ordering() {
        let id = vec![1, 0, 0, 0, 10, 0, 0, 1];
        let mut md = digest(
            ExchangeType::Quick,
            7,
            &[
                (PayloadType::HASH, vec![1; 20]),
                (PayloadType::SA, sa_body()),
                (PayloadType::NONCE, vec![2; 16]),
                (PayloadType::ID, id.clone()),
                (PayloadType::ID, id.clone()),
            ],
        );
        md.from_state = StateKind::QuickR0;
        digest_payloads(&mut md, smc_for(StateKind::QuickR0), None).expect("accepted");
        assert!(check_ordering(&md).is_ok());
        let hash = *md.first(PayloadType::HASH).expect("hash present");
        assert_eq!(md.after(&hash).len(), md.payload_end - hash.end());

        let mut split = digest(
            ExchangeType::Quick,
            7,
            &[
                (PayloadType::HASH, vec![1; 20]),
                (PayloadType::SA, sa_body()),
                (PayloadType::ID, id.clone()),
                (PayloadType::NONCE, vec![2; 16]),
                (PayloadType::ID, id),
            ],
        );
        split.from_state = StateKind::QuickR0;
        digest_payloads(&mut split, smc_for(StateKind::QuickR0), None).expect("accepted");
        assert_eq!(
            check_ordering(&split).expect_err("rejected").reason,
            "malformed Quick Mode message: the ID payloads are not adjacent"
        );

        let mut late_sa = digest(
            ExchangeType::Quick,
            7,
            &[
                (PayloadType::HASH, vec![1; 20]),
                (PayloadType::NONCE, vec![2; 16]),
                (PayloadType::SA, sa_body()),
            ],
        );
        late_sa.from_state = StateKind::QuickR0;
        digest_payloads(&mut late_sa, smc_for(StateKind::QuickR0), None).expect("accepted");
        assert_eq!(
            check_ordering(&late_sa).expect_err("rejected").reason,
            "malformed Quick Mode message: SA payload is in wrong position"
        );
    }

    #[test]
    fn test_phase1_must_start_with_sa() {
        let mut md = digest(
            ExchangeType::IdProt,
            0,
            &[(PayloadType::VID, vec![7; 16]), (PayloadType::SA, sa_body())],
        );
        md.from_state = StateKind::MainR0;
        digest_payloads(&mut md, smc_for(StateKind::MainR0), None).expect("accepted");
        assert_eq!(
            check_ordering(&md).expect_err("rejected").reason,
            "malformed Phase 1 message: does not start with an SA payload"
        );
    }
}
