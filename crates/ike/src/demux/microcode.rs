//! State microcode
//!
//! One row per (state, authentication method) describing what a message
//! arriving in that state must and may carry, how it is protected, what
//! the reply starts with and which transition handles it. Rows are kept in
//! [`StateKind`] order; [`MicrocodeIndex`] records the first row of every
//! state and refuses to build if the order is broken.

use crate::error::{Error, Result};
use crate::isakmp::{oakley, PayloadSet, PayloadType};
use crate::state::StateKind;
use crate::timer::EventKind;
use once_cell::sync::Lazy;
use std::fmt;

/// Microcode flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmfFlags(u32);

impl SmfFlags {
    /// Pre-shared key authentication
    pub const PSK_AUTH: u32 = 1 << oakley::PRESHARED_KEY;
    /// Digital signature authentication (DSS or RSA)
    pub const DS_AUTH: u32 = (1 << oakley::DSS_SIG) | (1 << oakley::RSA_SIG);
    /// Public key encryption authentication
    pub const PKE_AUTH: u32 = 1 << oakley::RSA_ENC;
    /// Revised public key encryption authentication
    pub const RPKE_AUTH: u32 = 1 << oakley::RSA_ENC_REV;
    /// Any authentication method, including none chosen yet
    pub const ALL_AUTH: u32 = (1 << (oakley::RSA_ENC_REV + 1)) - 1;

    /// We are the initiator of the exchange
    pub const INITIATOR: u32 = 1 << 8;
    /// First message protected by the new keys
    pub const FIRST_ENCRYPTED_INPUT: u32 = 1 << 9;
    /// The incoming message must be encrypted
    pub const INPUT_ENCRYPTED: u32 = 1 << 10;
    /// The reply is encrypted
    pub const OUTPUT_ENCRYPTED: u32 = 1 << 11;
    /// Resend the last reply when a duplicate arrives
    pub const RETRANSMIT_ON_DUPLICATE: u32 = 1 << 12;
    /// Input and output encrypted
    pub const ENCRYPTED: u32 = Self::INPUT_ENCRYPTED | Self::OUTPUT_ENCRYPTED;
    /// The transition sends a reply
    pub const REPLY: u32 = 1 << 13;
    /// Start queued Quick Mode requests once this transition succeeds
    pub const RELEASE_PENDING_P2: u32 = 1 << 14;

    /// Create from raw bits
    pub const fn new(bits: u32) -> Self {
        SmfFlags(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// All of `mask` is set
    pub const fn contains(self, mask: u32) -> bool {
        self.0 & mask == mask
    }

    /// Does this row apply to the Oakley authentication method `auth`
    ///
    /// Method 0 means "not chosen yet" and only matches `ALL_AUTH` rows.
    pub fn accepts_auth(self, auth: u16) -> bool {
        auth < 16 && self.0 & (1 << auth) != 0
    }
}

/// Transition function of a microcode row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Nothing is expected in this state
    Unexpected,
    /// Notification / Delete processing
    Informational,
    /// Main Mode responder, first message
    MainInI1OutR1,
    /// Main Mode initiator, responder's SA
    MainInR1OutI2,
    /// Main Mode responder, key exchange
    MainInI2OutR2,
    /// Main Mode initiator, responder's key exchange
    MainInR2OutI3,
    /// Main Mode responder, authentication
    MainInI3OutR3,
    /// Main Mode initiator, responder's authentication
    MainInR3,
    /// Aggressive Mode responder, first message
    AggrInI1OutR1,
    /// Aggressive Mode initiator, responder's answer
    AggrInR1OutI2,
    /// Aggressive Mode responder, initiator's authentication
    AggrInI2,
    /// Quick Mode responder, first message
    QuickInI1OutR1,
    /// Quick Mode initiator, responder's answer
    QuickInR1OutI2,
    /// Quick Mode responder, final acknowledgement
    QuickInI2,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Unexpected => "unexpected",
            Transition::Informational => "informational",
            Transition::MainInI1OutR1 => "main_inI1_outR1",
            Transition::MainInR1OutI2 => "main_inR1_outI2",
            Transition::MainInI2OutR2 => "main_inI2_outR2",
            Transition::MainInR2OutI3 => "main_inR2_outI3",
            Transition::MainInI3OutR3 => "main_inI3_outR3",
            Transition::MainInR3 => "main_inR3",
            Transition::AggrInI1OutR1 => "aggr_inI1_outR1",
            Transition::AggrInR1OutI2 => "aggr_inR1_outI2",
            Transition::AggrInI2 => "aggr_inI2",
            Transition::QuickInI1OutR1 => "quick_inI1_outR1",
            Transition::QuickInR1OutI2 => "quick_inR1_outI2",
            Transition::QuickInI2 => "quick_inI2",
        };
        f.write_str(name)
    }
}

/// One microcode row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Microcode {
    /// State the message arrives in
    pub state: StateKind,
    /// State after a successful transition (`None` when there is none)
    pub next_state: Option<StateKind>,
    /// Flags
    pub flags: SmfFlags,
    /// Payloads that must be present
    pub req_payloads: PayloadSet,
    /// Payloads that may be present
    pub opt_payloads: PayloadSet,
    /// First payload of the reply
    pub first_out_payload: PayloadType,
    /// Event scheduled after a successful transition
    pub timeout_event: Option<EventKind>,
    /// Transition function
    pub processor: Transition,
}

const fn set(types: &[PayloadType]) -> PayloadSet {
    let mut s = PayloadSet::EMPTY;
    let mut i = 0;
    while i < types.len() {
        s = s.with(types[i]);
        i += 1;
    }
    s
}

const fn row(
    state: StateKind,
    next_state: Option<StateKind>,
    flags: u32,
    req: &[PayloadType],
    opt: &[PayloadType],
    first_out_payload: PayloadType,
    timeout_event: Option<EventKind>,
    processor: Transition,
) -> Microcode {
    Microcode {
        state,
        next_state,
        flags: SmfFlags::new(flags),
        req_payloads: set(req),
        opt_payloads: set(opt),
        first_out_payload,
        timeout_event,
        processor,
    }
}

use EventKind::{Retransmit, SaReplace};
use PayloadType::{CERT, CR, HASH, ID, KE, NONCE, SA, SIG, VID};
use StateKind::*;

const NATD: PayloadType = PayloadType::NatDRfc;
const NATOA: PayloadType = PayloadType::NatOaRfc;
const NONE: PayloadType = PayloadType::None;

/// The microcode table, ordered by state
#[rustfmt::skip]
pub static MICROCODE: &[Microcode] = &[
    // Main Mode
    row(MainR0, Some(MainR1), SmfFlags::ALL_AUTH | SmfFlags::REPLY,
        &[SA], &[VID, CR], NONE, Some(Retransmit), Transition::MainInI1OutR1),
    row(MainI1, Some(MainI2), SmfFlags::ALL_AUTH | SmfFlags::INITIATOR | SmfFlags::REPLY,
        &[SA], &[VID, CR], NONE, Some(Retransmit), Transition::MainInR1OutI2),
    row(MainR1, Some(MainR2), SmfFlags::PSK_AUTH | SmfFlags::DS_AUTH | SmfFlags::REPLY,
        &[KE, NONCE], &[VID, CR, NATD], KE, Some(Retransmit), Transition::MainInI2OutR2),
    row(MainR1, None, SmfFlags::PKE_AUTH | SmfFlags::REPLY,
        &[KE, ID, NONCE], &[VID, HASH], KE, Some(Retransmit), Transition::Unexpected),
    row(MainR1, None, SmfFlags::RPKE_AUTH | SmfFlags::REPLY,
        &[NONCE, KE, ID], &[VID, HASH, CERT], NONCE, Some(Retransmit), Transition::Unexpected),
    row(MainI2, Some(MainI3),
        SmfFlags::PSK_AUTH | SmfFlags::DS_AUTH | SmfFlags::INITIATOR | SmfFlags::OUTPUT_ENCRYPTED | SmfFlags::REPLY,
        &[KE, NONCE], &[VID, CR, NATD], ID, Some(Retransmit), Transition::MainInR2OutI3),
    row(MainI2, None,
        SmfFlags::PKE_AUTH | SmfFlags::INITIATOR | SmfFlags::OUTPUT_ENCRYPTED | SmfFlags::REPLY,
        &[KE, ID, NONCE], &[VID], HASH, Some(Retransmit), Transition::Unexpected),
    row(MainI2, None,
        SmfFlags::ALL_AUTH | SmfFlags::INITIATOR | SmfFlags::OUTPUT_ENCRYPTED | SmfFlags::REPLY,
        &[NONCE, KE, ID], &[VID], HASH, Some(Retransmit), Transition::Unexpected),
    row(MainR2, Some(MainR3),
        SmfFlags::PSK_AUTH | SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::ENCRYPTED
            | SmfFlags::REPLY | SmfFlags::RELEASE_PENDING_P2,
        &[ID, HASH], &[VID], NONE, Some(SaReplace), Transition::MainInI3OutR3),
    row(MainR2, Some(MainR3),
        SmfFlags::DS_AUTH | SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::ENCRYPTED
            | SmfFlags::REPLY | SmfFlags::RELEASE_PENDING_P2,
        &[ID, SIG], &[VID, CERT, CR], NONE, Some(SaReplace), Transition::MainInI3OutR3),
    row(MainR2, None,
        SmfFlags::PKE_AUTH | SmfFlags::RPKE_AUTH | SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::ENCRYPTED
            | SmfFlags::REPLY | SmfFlags::RELEASE_PENDING_P2,
        &[HASH], &[VID], NONE, Some(SaReplace), Transition::Unexpected),
    row(MainI3, Some(MainI4),
        SmfFlags::PSK_AUTH | SmfFlags::INITIATOR | SmfFlags::FIRST_ENCRYPTED_INPUT
            | SmfFlags::ENCRYPTED | SmfFlags::RELEASE_PENDING_P2,
        &[ID, HASH], &[VID], NONE, Some(SaReplace), Transition::MainInR3),
    row(MainI3, Some(MainI4),
        SmfFlags::DS_AUTH | SmfFlags::INITIATOR | SmfFlags::FIRST_ENCRYPTED_INPUT
            | SmfFlags::ENCRYPTED | SmfFlags::RELEASE_PENDING_P2,
        &[ID, SIG], &[VID, CERT], NONE, Some(SaReplace), Transition::MainInR3),
    row(MainI3, None,
        SmfFlags::PKE_AUTH | SmfFlags::RPKE_AUTH | SmfFlags::INITIATOR | SmfFlags::FIRST_ENCRYPTED_INPUT
            | SmfFlags::ENCRYPTED | SmfFlags::RELEASE_PENDING_P2,
        &[HASH], &[VID], NONE, Some(SaReplace), Transition::Unexpected),
    row(MainR3, None,
        SmfFlags::ALL_AUTH | SmfFlags::ENCRYPTED | SmfFlags::RETRANSMIT_ON_DUPLICATE,
        &[], &[], NONE, None, Transition::Unexpected),
    row(MainI4, None,
        SmfFlags::ALL_AUTH | SmfFlags::INITIATOR | SmfFlags::ENCRYPTED,
        &[], &[], NONE, None, Transition::Unexpected),
    // Aggressive Mode
    row(AggrR0, Some(AggrR1), SmfFlags::PSK_AUTH | SmfFlags::REPLY,
        &[SA, KE, NONCE, ID], &[VID, NATD], NONE, Some(Retransmit), Transition::AggrInI1OutR1),
    row(AggrI1, Some(AggrI2),
        SmfFlags::PSK_AUTH | SmfFlags::INITIATOR | SmfFlags::OUTPUT_ENCRYPTED
            | SmfFlags::REPLY | SmfFlags::RELEASE_PENDING_P2,
        &[SA, KE, NONCE, ID, HASH], &[VID, NATD], NONE, Some(SaReplace), Transition::AggrInR1OutI2),
    row(AggrR1, Some(AggrR2),
        SmfFlags::PSK_AUTH | SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::RELEASE_PENDING_P2,
        &[HASH], &[VID, NATD], NONE, Some(SaReplace), Transition::AggrInI2),
    row(AggrI2, None,
        SmfFlags::PSK_AUTH | SmfFlags::INITIATOR | SmfFlags::RETRANSMIT_ON_DUPLICATE,
        &[], &[], NONE, None, Transition::Unexpected),
    row(AggrR2, None, SmfFlags::PSK_AUTH,
        &[], &[], NONE, None, Transition::Unexpected),
    // Quick Mode
    row(QuickR0, Some(QuickR1), SmfFlags::ALL_AUTH | SmfFlags::ENCRYPTED | SmfFlags::REPLY,
        &[HASH, SA, NONCE], &[KE, ID, NATOA], NONE, Some(Retransmit), Transition::QuickInI1OutR1),
    row(QuickI1, Some(QuickI2),
        SmfFlags::ALL_AUTH | SmfFlags::INITIATOR | SmfFlags::ENCRYPTED | SmfFlags::REPLY,
        &[HASH, SA, NONCE], &[KE, ID, NATOA], HASH, Some(SaReplace), Transition::QuickInR1OutI2),
    row(QuickR1, Some(QuickR2), SmfFlags::ALL_AUTH | SmfFlags::ENCRYPTED,
        &[HASH], &[], NONE, Some(SaReplace), Transition::QuickInI2),
    row(QuickI2, None,
        SmfFlags::ALL_AUTH | SmfFlags::INITIATOR | SmfFlags::ENCRYPTED | SmfFlags::RETRANSMIT_ON_DUPLICATE,
        &[], &[], NONE, None, Transition::Unexpected),
    row(QuickR2, None, SmfFlags::ALL_AUTH | SmfFlags::ENCRYPTED,
        &[], &[], NONE, None, Transition::Unexpected),
    // Informational
    row(Info, None, SmfFlags::ALL_AUTH,
        &[], &[], NONE, None, Transition::Informational),
    row(InfoProtected, None, SmfFlags::ALL_AUTH | SmfFlags::ENCRYPTED,
        &[HASH], &[], NONE, None, Transition::Informational),
];

/// First row of every state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicrocodeIndex {
    first: [Option<usize>; StateKind::COUNT],
}

impl MicrocodeIndex {
    /// Index `table`, failing if it is not grouped by state in
    /// [`StateKind`] order
    pub fn build(table: &[Microcode]) -> Result<Self> {
        let mut first = [None; StateKind::COUNT];
        let mut prev: Option<StateKind> = None;
        for (i, smc) in table.iter().enumerate() {
            match prev {
                Some(p) if smc.state < p => {
                    return Err(Error::Internal(format!(
                        "microcode entry {} for {} follows an entry for {}",
                        i, smc.state, p
                    )));
                }
                Some(p) if smc.state == p => {}
                _ => first[smc.state.index()] = Some(i),
            }
            prev = Some(smc.state);
        }
        Ok(MicrocodeIndex { first })
    }

    /// First row for `state`
    pub fn first(&self, state: StateKind) -> Option<usize> {
        self.first[state.index()]
    }

    /// Row for `state` applying to authentication method `auth`
    ///
    /// `auth` is `None` before any state exists, in which case the first
    /// row wins.
    pub fn select(&self, table: &[Microcode], state: StateKind, auth: Option<u16>) -> Option<usize> {
        let start = self.first(state)?;
        let Some(auth) = auth else {
            return Some(start);
        };
        table[start..]
            .iter()
            .take_while(|smc| smc.state == state)
            .position(|smc| smc.flags.accepts_auth(auth))
            .map(|offset| start + offset)
    }
}

/// Index of [`MICROCODE`], built on first use
pub static MICROCODE_INDEX: Lazy<Result<MicrocodeIndex>> =
    Lazy::new(|| MicrocodeIndex::build(MICROCODE));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_ordered() {
        let index = MicrocodeIndex::build(MICROCODE).expect("table ordered");
        for kind in StateKind::ALL {
            let first = index.first(kind).expect("every state has a row");
            assert_eq!(MICROCODE[first].state, kind);
            if first > 0 {
                assert_ne!(MICROCODE[first - 1].state, kind);
            }
        }
        assert!(MICROCODE_INDEX.is_ok());
    }

    #[test]
    fn test_out_of_order_table_rejected() {
        let table = [MICROCODE[2], MICROCODE[0]];
        assert!(matches!(
            MicrocodeIndex::build(&table),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_selection_by_auth() {
        let index = MicrocodeIndex::build(MICROCODE).expect("table ordered");
        let psk = index
            .select(MICROCODE, MainR1, Some(oakley::PRESHARED_KEY))
            .expect("psk row");
        assert_eq!(MICROCODE[psk].processor, Transition::MainInI2OutR2);

        let pke = index
            .select(MICROCODE, MainR1, Some(oakley::RSA_ENC))
            .expect("pke row");
        assert_eq!(MICROCODE[pke].processor, Transition::Unexpected);
        assert_eq!(MICROCODE[pke].next_state, None);

        let ds = index
            .select(MICROCODE, MainR2, Some(oakley::RSA_SIG))
            .expect("ds row");
        assert!(MICROCODE[ds].req_payloads.contains(SIG));

        // no auth chosen yet: only ALL_AUTH rows qualify
        let none = index.select(MICROCODE, MainI2, Some(0)).expect("all-auth row");
        assert_eq!(MICROCODE[none].processor, Transition::Unexpected);
        assert!(index.select(MICROCODE, AggrR1, Some(oakley::RSA_SIG)).is_none());
    }

    #[test]
    fn test_flags() {
        let smc = &MICROCODE[index_of(MainR2)];
        assert!(smc.flags.contains(SmfFlags::ENCRYPTED));
        assert!(smc.flags.contains(SmfFlags::FIRST_ENCRYPTED_INPUT));
        assert!(SmfFlags::new(SmfFlags::ALL_AUTH).accepts_auth(0));
        assert!(!SmfFlags::new(SmfFlags::PSK_AUTH).accepts_auth(0));

        let aggr_r1 = &MICROCODE[index_of(AggrR1)];
        assert!(!aggr_r1.flags.contains(SmfFlags::INPUT_ENCRYPTED));
        assert!(aggr_r1.opt_payloads.contains(PayloadType::NatDDrafts));
    }

    fn index_of(state: StateKind) -> usize {
        MicrocodeIndex::build(MICROCODE)
            .expect("table ordered")
            .first(state)
            .expect("state has a row")
    }
}
