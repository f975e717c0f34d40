//! Quick Mode (IPsec DOI) SA selection
//!
//! Proposals sharing a proposal number form a conjunction: at most one AH,
//! one ESP and one IPCOMP proposal that must all be accepted together.
//! Conjunctions are tried in order and the first fully acceptable one wins.
//! For each protocol the first acceptable transform is taken.

use crate::config::{IPSEC_LIFE_DEFAULT, IPSEC_LIFE_MAXIMUM};
use crate::isakmp::{
    decode_long_duration, ipsec_attr, oakley, proto, transform, AttrValue, Attribute,
    Notification, PayloadType, ProposalHeader, SaHeader, TransformHeader, IPCOMP_CPI_SIZE,
    IPCOMP_FIRST_NEGOTIATED, IPCOMP_LAST_NEGOTIATED, IPSEC_DOI_SPI_MIN, IPSEC_DOI_SPI_SIZE,
    ISAKMP_DOI_IPSEC, SIT_IDENTITY_ONLY,
};
use crate::kernel::KernelInterface;
use crate::policy::{Policy, QuickAlgorithms};
use bytes::{BufMut, BytesMut};
use rand::Rng;
use tracing::{debug, info, warn};

type NotifyResult<T> = std::result::Result<T, Notification>;

/// Attempts at making a well-known CPI unique
const CPI_UNIQUIFY_TRIES: usize = 20;

/// Decoded attributes of one IPsec transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpsecTransAttrs {
    /// Transform id
    pub transid: u8,
    /// Peer's SPI (or uniquified CPI)
    pub spi: u32,
    /// Lifetime in seconds
    pub life_seconds: u32,
    /// Lifetime in kilobytes
    pub life_kilobytes: u32,
    /// Encapsulation mode (tunnel or transport once decoded)
    pub encapsulation: u16,
    /// Integrity algorithm
    pub auth: u16,
    /// Cipher key length in bits (0 = default)
    pub key_len: u16,
    /// Cipher key rounds (0 = default)
    pub key_rounds: u16,
}

impl Default for IpsecTransAttrs {
    fn default() -> Self {
        IpsecTransAttrs {
            transid: 0,
            spi: 0,
            life_seconds: IPSEC_LIFE_DEFAULT,
            life_kilobytes: u32::MAX,
            encapsulation: 0,
            auth: ipsec_attr::AUTH_ALGORITHM_NONE,
            key_len: 0,
            key_rounds: 0,
        }
    }
}

impl IpsecTransAttrs {
    /// Tunnel mode negotiated
    pub fn is_tunnel(&self) -> bool {
        self.encapsulation == ipsec_attr::ENCAPSULATION_MODE_TUNNEL
    }
}

/// One negotiated protocol of an IPsec SA bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpsecProtoInfo {
    /// Accepted transform
    pub attrs: IpsecTransAttrs,
    /// SPI (CPI) we receive on
    pub our_spi: u32,
    /// SPI (CPI) the peer receives on
    pub peer_spi: u32,
}

/// PFS group agreed so far within one SA payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PfsGroup {
    /// No transform has spoken yet
    #[default]
    Unset,
    /// Transforms carry no GROUP_DESCRIPTION
    Disabled,
    /// Transforms carry this MODP group
    Group(u16),
}

impl PfsGroup {
    /// Group to use, if any
    pub fn group(self) -> Option<u16> {
        match self {
            PfsGroup::Group(g) => Some(g),
            _ => None,
        }
    }

    /// What an initiator committed to when proposing
    pub fn proposed(group: Option<u16>) -> Self {
        match group {
            Some(g) => PfsGroup::Group(g),
            None => PfsGroup::Disabled,
        }
    }
}

/// What the local side will accept in Quick Mode
#[derive(Debug, Clone, Copy)]
pub struct IpsecSelectContext {
    /// IPsec policy of the connection
    pub policy: Policy,
    /// Permitted algorithms
    pub algorithms: QuickAlgorithms,
    /// NAT detected between the peers
    pub nat_detected: bool,
    /// RFC 3947 encapsulation values negotiated
    pub nat_rfc_encaps: bool,
    /// PFS group already committed to (initiator) or `Unset` (responder)
    pub pfs_group: PfsGroup,
}

/// Outcome of a successful Quick Mode selection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpsecSelection {
    /// AH, if part of the chosen conjunction
    pub ah: Option<IpsecProtoInfo>,
    /// ESP, if part of the chosen conjunction
    pub esp: Option<IpsecProtoInfo>,
    /// IPCOMP, if part of the chosen conjunction
    pub ipcomp: Option<IpsecProtoInfo>,
    /// PFS group, if PFS was agreed
    pub pfs_group: Option<u16>,
    /// SA body to send back (responder only)
    pub reply_body: Option<Vec<u8>>,
}

struct RawProposal<'a> {
    header: ProposalHeader,
    spi: u32,
    transforms: &'a [u8],
}

#[derive(Default)]
struct Conjunction<'a> {
    ah: Option<RawProposal<'a>>,
    esp: Option<RawProposal<'a>>,
    ipcomp: Option<RawProposal<'a>>,
    well_known_cpi: Option<u32>,
}

struct Accepted<'a> {
    header: ProposalHeader,
    trans: TransformHeader,
    attrs: IpsecTransAttrs,
    raw_attrs: &'a [u8],
}

/// Choose a conjunction out of the peer's Quick Mode SA payload body.
///
/// With `selection` set we are the initiator reading the responder's
/// answer and nothing is echoed. Otherwise our inbound SPIs are allocated
/// from `kernel` for the winning conjunction only and the reply body is
/// built. Nothing is allocated when no conjunction is acceptable.
pub fn parse_ipsec_sa_body(
    body: &[u8],
    ctx: &IpsecSelectContext,
    selection: bool,
    kernel: &mut dyn KernelInterface,
) -> NotifyResult<IpsecSelection> {
    let sa = SaHeader::from_bytes(body).map_err(|_| Notification::PayloadMalformed)?;
    if sa.doi != ISAKMP_DOI_IPSEC {
        warn!(doi = sa.doi, "Unknown or unexpected DOI");
        return Err(Notification::DoiNotSupported);
    }
    if sa.situation != SIT_IDENTITY_ONLY {
        warn!(situation = sa.situation, "unsupported IPsec DOI situation");
        return Err(Notification::SituationNotSupported);
    }

    let mut rest = &body[SaHeader::SIZE..];
    let (first, after) = read_proposal(rest).ok_or(Notification::BadProposalSyntax)?;
    rest = after;
    let mut next = Some(first);

    while let Some(first) = next.take() {
        let propno = first.0.proposal_number;
        let mut conj = Conjunction::default();
        let mut current = first;

        loop {
            let (header, prop_body) = current;
            let np = header.next_payload;
            add_to_conjunction(&mut conj, header, prop_body, kernel)?;

            if np == PayloadType::None.to_u8() {
                break;
            }
            if np != PayloadType::P.to_u8() {
                warn!(np, "unexpected payload in Proposal");
                return Err(Notification::BadProposalSyntax);
            }
            let (following, after) = read_proposal(rest).ok_or(Notification::BadProposalSyntax)?;
            rest = after;
            if following.0.proposal_number != propno {
                next = Some(following);
                break;
            }
            current = following;
        }

        let mut pfs = ctx.pfs_group;
        if let Some(chosen) = evaluate_conjunction(&conj, ctx, selection, &mut pfs)? {
            return finish(sa, chosen, pfs, selection, kernel);
        }
    }

    warn!("no acceptable Proposal in IPsec SA");
    Err(Notification::NoProposalChosen)
}

fn read_proposal(data: &[u8]) -> Option<((ProposalHeader, &[u8]), &[u8])> {
    let header = ProposalHeader::from_bytes(data).ok()?;
    let len = header.length as usize;
    Some(((header, &data[ProposalHeader::SIZE..len]), &data[len..]))
}

fn add_to_conjunction<'a>(
    conj: &mut Conjunction<'a>,
    header: ProposalHeader,
    body: &'a [u8],
    kernel: &dyn KernelInterface,
) -> NotifyResult<()> {
    let spi_size = header.spi_size as usize;
    let spi;
    let mut rest = body;

    if header.protocol_id == proto::IPCOMP {
        if spi_size == IPSEC_DOI_SPI_SIZE {
            // CPI in the low half of an SPI-sized field
            let filler = rest.get(..IPSEC_DOI_SPI_SIZE - IPCOMP_CPI_SIZE).ok_or(Notification::InvalidSpi)?;
            if filler.iter().any(|b| *b != 0) {
                return Err(Notification::InvalidSpi);
            }
            rest = &rest[IPSEC_DOI_SPI_SIZE - IPCOMP_CPI_SIZE..];
        } else if spi_size != IPCOMP_CPI_SIZE {
            warn!(spi_size, "IPsec Proposal with improper CPI size");
            return Err(Notification::InvalidSpi);
        }
        let cpi_bytes = rest.get(..IPCOMP_CPI_SIZE).ok_or(Notification::InvalidSpi)?;
        let cpi = u32::from(u16::from_be_bytes([cpi_bytes[0], cpi_bytes[1]]));
        rest = &rest[IPCOMP_CPI_SIZE..];

        if cpi == u32::from(transform::IPCOMP_DEFLATE) {
            conj.well_known_cpi = Some(cpi);
            spi = uniquify_his_cpi(cpi, kernel).ok_or_else(|| {
                warn!("IPsec Proposal contains well-known CPI that I cannot uniquify");
                Notification::InvalidSpi
            })?;
        } else {
            if !(IPCOMP_FIRST_NEGOTIATED..=IPCOMP_LAST_NEGOTIATED).contains(&cpi) {
                warn!(
                    cpi = %format_args!("0x{:x}", cpi),
                    "IPsec Proposal contains CPI from non-negotiated range"
                );
                return Err(Notification::InvalidSpi);
            }
            spi = cpi;
        }
    } else {
        if spi_size != IPSEC_DOI_SPI_SIZE {
            warn!(spi_size, "IPsec Proposal with improper SPI size");
            return Err(Notification::InvalidSpi);
        }
        let b = rest.get(..IPSEC_DOI_SPI_SIZE).ok_or(Notification::InvalidSpi)?;
        let value = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        rest = &rest[IPSEC_DOI_SPI_SIZE..];
        // 0 is invalid and 1-255 are reserved to IANA
        if value < IPSEC_DOI_SPI_MIN {
            warn!(
                spi = %format_args!("0x{:x}", value),
                "IPsec Proposal contains invalid SPI"
            );
            return Err(Notification::InvalidSpi);
        }
        spi = value;
    }

    if header.num_transforms == 0 {
        warn!("IPsec Proposal contains no Transforms");
        return Err(Notification::BadProposalSyntax);
    }

    let raw = RawProposal {
        header,
        spi,
        transforms: rest,
    };
    let slot = match header.protocol_id {
        proto::IPSEC_AH => &mut conj.ah,
        proto::IPSEC_ESP => &mut conj.esp,
        proto::IPCOMP => &mut conj.ipcomp,
        other => {
            warn!(
                protocol = proto::name(other),
                "unexpected Protocol ID in IPsec Proposal"
            );
            return Err(Notification::InvalidProtocolId);
        }
    };
    if slot.is_some() {
        warn!(
            protocol = proto::name(header.protocol_id),
            "IPsec SA contains two simultaneous Proposals for one protocol"
        );
        return Err(Notification::BadProposalSyntax);
    }
    *slot = Some(raw);
    Ok(())
}

/// Give a well-known CPI random high bits so that SA identities stay unique
fn uniquify_his_cpi(cpi: u32, kernel: &dyn KernelInterface) -> Option<u32> {
    let mut rng = rand::thread_rng();
    for _ in 0..CPI_UNIQUIFY_TRIES {
        let candidate = (u32::from(rng.gen::<u16>()) << 16) | cpi;
        if !kernel.cpi_in_use(candidate) {
            return Some(candidate);
        }
    }
    None
}

struct Chosen<'a> {
    ah: Option<(Accepted<'a>, u32)>,
    esp: Option<(Accepted<'a>, u32)>,
    ipcomp: Option<(Accepted<'a>, u32)>,
}

fn evaluate_conjunction<'a>(
    conj: &Conjunction<'a>,
    ctx: &IpsecSelectContext,
    selection: bool,
    pfs: &mut PfsGroup,
) -> NotifyResult<Option<Chosen<'a>>> {
    let mut chosen = Chosen {
        ah: None,
        esp: None,
        ipcomp: None,
    };

    if let Some(ah) = &conj.ah {
        let mut found = None;
        for_each_transform(ah, ctx, selection, false, pfs, |acc| {
            let (ok_transid, ok_auth) = match acc.attrs.auth {
                ipsec_attr::AUTH_ALGORITHM_NONE => {
                    warn!("AUTH_ALGORITHM attribute missing in AH Transform");
                    return Err(Notification::BadProposalSyntax);
                }
                ipsec_attr::AUTH_ALGORITHM_HMAC_MD5 => (transform::AH_MD5, true),
                ipsec_attr::AUTH_ALGORITHM_KPDK => (transform::AH_MD5, false),
                ipsec_attr::AUTH_ALGORITHM_HMAC_SHA1 => (transform::AH_SHA, true),
                ipsec_attr::AUTH_ALGORITHM_DES_MAC => (transform::AH_DES, false),
                _ => (0, false),
            };
            if acc.attrs.transid != ok_transid {
                warn!(
                    auth = acc.attrs.auth,
                    transform = transform::ah_name(acc.attrs.transid),
                    "auth attribute inappropriate in AH Transform"
                );
                return Err(Notification::BadProposalSyntax);
            }
            if !ok_auth {
                debug!(
                    auth = acc.attrs.auth,
                    "auth attribute unsupported in AH Transform"
                );
                return Ok(false);
            }
            if !ctx.algorithms.allows_ah(acc.attrs.transid) {
                debug!(
                    transform = transform::ah_name(acc.attrs.transid),
                    "AH Transform not permitted by policy"
                );
                return Ok(false);
            }
            Ok(true)
        }, &mut found)?;
        match found {
            Some(acc) => chosen.ah = Some((acc, ah.spi)),
            None => return Ok(None),
        }
    }

    if let Some(esp) = &conj.esp {
        let ah_seen = conj.ah.is_some();
        let ah_encaps = chosen.ah.as_ref().map(|(a, _)| a.attrs.encapsulation);
        let mut found = None;
        for_each_transform(esp, ctx, selection, false, pfs, |acc| {
            let a = &acc.attrs;
            match a.transid {
                transform::ESP_DES | transform::ESP_3DES | transform::ESP_AES => {}
                other => {
                    debug!(
                        transform = transform::esp_name(other),
                        "unsupported ESP Transform"
                    );
                    return Ok(false);
                }
            }
            match a.auth {
                ipsec_attr::AUTH_ALGORITHM_NONE => {
                    if !ah_seen {
                        debug!("ESP must either have AUTH or be combined with AH");
                        return Ok(false);
                    }
                }
                ipsec_attr::AUTH_ALGORITHM_HMAC_MD5 | ipsec_attr::AUTH_ALGORITHM_HMAC_SHA1 => {}
                other => {
                    debug!(auth = other, "unsupported ESP auth alg");
                    return Ok(false);
                }
            }
            if let Some(encaps) = ah_encaps {
                if encaps != a.encapsulation {
                    debug!("AH and ESP transforms disagree about encapsulation; TUNNEL presumed");
                }
            }
            if !ctx.algorithms.allows_esp(a.transid, a.key_len) {
                debug!(
                    transform = transform::esp_name(a.transid),
                    key_len = a.key_len,
                    "ESP cipher not permitted by policy"
                );
                return Ok(false);
            }
            if a.auth != ipsec_attr::AUTH_ALGORITHM_NONE && !ctx.algorithms.allows_esp_auth(a.auth) {
                debug!(auth = a.auth, "ESP integrity algorithm not permitted by policy");
                return Ok(false);
            }
            Ok(true)
        }, &mut found)?;
        match found {
            Some(acc) => chosen.esp = Some((acc, esp.spi)),
            None => return Ok(None),
        }
    } else if ctx.policy.contains(Policy::AUTHENTICATE) && conj.ah.is_none() {
        debug!("policy requires authentication but none in Proposal");
        return Ok(None);
    }

    if let Some(ipcomp) = &conj.ipcomp {
        if !ctx.policy.contains(Policy::COMPRESS) {
            info!("compression proposed by peer, but policy forbids it");
            return Ok(None);
        }
        if conj.well_known_cpi.is_some() && conj.ah.is_none() && conj.esp.is_none() {
            info!("illegal proposal: bare IPCOMP used with well-known CPI");
            return Err(Notification::BadProposalSyntax);
        }
        let well_known = conj.well_known_cpi;
        let mut found = None;
        for_each_transform(ipcomp, ctx, selection, true, pfs, |acc| {
            if let Some(cpi) = well_known {
                if u32::from(acc.attrs.transid) != cpi {
                    info!("illegal proposal: IPCOMP well-known CPI disagrees with transform");
                    return Err(Notification::BadProposalSyntax);
                }
            }
            if acc.attrs.transid != transform::IPCOMP_DEFLATE {
                debug!(transid = acc.attrs.transid, "unsupported IPCOMP Transform");
                return Ok(false);
            }
            Ok(true)
        }, &mut found)?;
        match found {
            Some(acc) => chosen.ipcomp = Some((acc, ipcomp.spi)),
            None => return Ok(None),
        }
    }

    Ok(Some(chosen))
}

/// Parse the transforms of one proposal in order, stopping at the first one
/// `accept` likes. A parse failure of any transform reached is fatal.
fn for_each_transform<'a, F>(
    prop: &RawProposal<'a>,
    ctx: &IpsecSelectContext,
    selection: bool,
    is_ipcomp: bool,
    pfs: &mut PfsGroup,
    mut accept: F,
    found: &mut Option<Accepted<'a>>,
) -> NotifyResult<()>
where
    F: FnMut(&Accepted<'a>) -> NotifyResult<bool>,
{
    let mut data = prop.transforms;
    let mut previous: i32 = -1;
    let count = prop.header.num_transforms as usize;
    for tn in 0..count {
        let (acc, rest) = parse_ipsec_transform(
            data,
            prop.header,
            previous,
            selection,
            tn + 1 == count,
            is_ipcomp,
            ctx,
            pfs,
        )
        .ok_or(Notification::BadProposalSyntax)?;
        previous = i32::from(acc.trans.transform_number);
        data = rest;
        if accept(&acc)? {
            *found = Some(acc);
            return Ok(());
        }
    }
    Ok(())
}

/// Decode one transform; `None` means the proposal is malformed
#[allow(clippy::too_many_arguments)]
fn parse_ipsec_transform<'a>(
    data: &'a [u8],
    prop: ProposalHeader,
    previous: i32,
    selection: bool,
    is_last: bool,
    is_ipcomp: bool,
    ctx: &IpsecSelectContext,
    pfs: &mut PfsGroup,
) -> Option<(Accepted<'a>, &'a [u8])> {
    let trans = TransformHeader::from_bytes(data).ok()?;
    if i32::from(trans.transform_number) <= previous {
        warn!("Transform Numbers in Proposal are not monotonically increasing");
        return None;
    }
    if trans.next_payload == PayloadType::T.to_u8() {
        if is_last {
            warn!("Proposal Payload has more Transforms than specified");
            return None;
        }
    } else if trans.next_payload == PayloadType::None.to_u8() {
        if !is_last {
            warn!("Proposal Payload has fewer Transforms than specified");
            return None;
        }
    } else {
        warn!(
            np = trans.next_payload,
            "expecting Transform Payload, but found another payload in Proposal"
        );
        return None;
    }

    let len = trans.length as usize;
    let raw_attrs = &data[TransformHeader::SIZE..len];
    let list = Attribute::parse_all(raw_attrs).ok()?;

    let mut attrs = IpsecTransAttrs {
        transid: trans.transform_id,
        ..IpsecTransAttrs::default()
    };
    let mut seen: u32 = 0;
    let mut seen_durations: u32 = 0;
    let mut life_type: Option<u16> = None;
    let mut group: Option<u16> = None;

    for a in &list {
        let ty = a.attr_type;
        if ty >= 32 {
            warn!(attr = ty, "unexpected attribute in IPsec Transform");
            return None;
        }
        if seen & (1 << ty) != 0 {
            warn!(
                attr = ipsec_attr::attr_name(ty),
                transform = trans.transform_number,
                "repeated attribute in IPsec Transform"
            );
            return None;
        }
        seen |= 1 << ty;

        let val = match (&a.value, ty) {
            (AttrValue::Basic(v), _) => u32::from(*v),
            (AttrValue::Variable(bytes), ipsec_attr::SA_LIFE_DURATION) => {
                decode_long_duration(bytes)
            }
            (AttrValue::Variable(_), _) => {
                warn!(attr = ipsec_attr::attr_name(ty), "unsupported IPsec attribute");
                return None;
            }
        };
        if !valid_value(ty, val) {
            warn!(
                value = val,
                attr = ipsec_attr::attr_name(ty),
                "invalid value for attribute in IPsec Transform"
            );
            return None;
        }

        let mut ipcomp_inappropriate = is_ipcomp;
        match ty {
            ipsec_attr::SA_LIFE_TYPE => {
                ipcomp_inappropriate = false;
                if seen_durations & (1 << val) != 0 {
                    warn!(value = val, "attribute SA_LIFE_TYPE value repeated in message");
                    return None;
                }
                seen_durations |= 1 << val;
                life_type = Some(val as u16);
            }
            ipsec_attr::SA_LIFE_DURATION => {
                ipcomp_inappropriate = false;
                let lt = match life_type.take() {
                    Some(lt) => lt,
                    None => {
                        warn!("SA_LIFE_DURATION IPsec attribute not preceded by SA_LIFE_TYPE attribute");
                        return None;
                    }
                };
                seen &= !((1 << ipsec_attr::SA_LIFE_DURATION) | (1 << ipsec_attr::SA_LIFE_TYPE));
                if lt == ipsec_attr::SA_LIFE_TYPE_SECONDS {
                    // silently limited to our maximum
                    attrs.life_seconds = val.min(IPSEC_LIFE_MAXIMUM);
                } else {
                    attrs.life_kilobytes = val;
                }
            }
            ipsec_attr::GROUP_DESCRIPTION => {
                if is_ipcomp {
                    ipcomp_inappropriate = false;
                    info!("IPCA (IPcomp SA) contains GROUP_DESCRIPTION.  Ignoring inappropriate attribute.");
                }
                match val as u16 {
                    g @ (oakley::GROUP_MODP768 | oakley::GROUP_MODP1024 | oakley::GROUP_MODP1536) => {
                        group = Some(g)
                    }
                    _ => {
                        warn!("only OAKLEY_GROUP_MODP768, OAKLEY_GROUP_MODP1024 and OAKLEY_GROUP_MODP1536 supported for PFS");
                        return None;
                    }
                }
            }
            ipsec_attr::ENCAPSULATION_MODE => {
                ipcomp_inappropriate = false;
                attrs.encapsulation = decode_encapsulation(val as u16, ctx)?;
            }
            ipsec_attr::AUTH_ALGORITHM => attrs.auth = val as u16,
            ipsec_attr::KEY_LENGTH => attrs.key_len = val as u16,
            ipsec_attr::KEY_ROUNDS => attrs.key_rounds = val as u16,
            _ => {
                warn!(attr = ipsec_attr::attr_name(ty), "unsupported IPsec attribute");
                return None;
            }
        }
        if ipcomp_inappropriate {
            warn!(
                attr = ipsec_attr::attr_name(ty),
                "IPsec attribute inappropriate for IPCOMP"
            );
            return None;
        }
    }

    // An IPCOMP SA ought not carry a group, but one it does carry must agree
    let where_ = if selection {
        "the Proposal"
    } else {
        "a previous Transform"
    };
    if !is_ipcomp || group.is_some() {
        let this = PfsGroup::proposed(group);
        if *pfs == PfsGroup::Unset {
            *pfs = this;
        }
        if *pfs != this {
            warn!("GROUP_DESCRIPTION inconsistent with that of {} in IPsec SA", where_);
            return None;
        }
    } else if *pfs == PfsGroup::Unset {
        warn!("GROUP_DESCRIPTION inconsistent with that of {} in IPsec SA", where_);
        return None;
    }

    if life_type.is_some() {
        warn!("SA_LIFE_TYPE IPsec attribute not followed by SA_LIFE_DURATION attribute in message");
        return None;
    }

    if seen & (1 << ipsec_attr::ENCAPSULATION_MODE) == 0 {
        warn!("IPsec Transform must specify ENCAPSULATION_MODE");
        return None;
    }
    let want_tunnel = ctx.policy.contains(Policy::TUNNEL);
    if attrs.is_tunnel() != want_tunnel {
        warn!("Peer's encapsulation mode doesn't match local encapsulation mode");
        return None;
    }

    Some((
        Accepted {
            header: prop,
            trans,
            attrs,
            raw_attrs,
        },
        &data[len..],
    ))
}

fn valid_value(attr_type: u16, val: u32) -> bool {
    match attr_type {
        ipsec_attr::SA_LIFE_TYPE => matches!(val, 1 | 2),
        ipsec_attr::ENCAPSULATION_MODE => matches!(val, 1..=4 | 61443 | 61444),
        ipsec_attr::AUTH_ALGORITHM => (1..=7).contains(&val),
        _ => true,
    }
}

fn decode_encapsulation(val: u16, ctx: &IpsecSelectContext) -> Option<u16> {
    match val {
        ipsec_attr::ENCAPSULATION_MODE_TUNNEL | ipsec_attr::ENCAPSULATION_MODE_TRANSPORT => {
            if ctx.nat_detected {
                warn!(
                    mode = val,
                    "plain encapsulation mode must only be used if NAT-Traversal is not detected"
                );
            }
            Some(val)
        }
        ipsec_attr::ENCAPSULATION_MODE_UDP_TUNNEL_DRAFTS
        | ipsec_attr::ENCAPSULATION_MODE_UDP_TRANSPORT_DRAFTS => {
            if ctx.nat_rfc_encaps {
                warn!(mode = val, "draft UDP encapsulation must only be used with old IETF drafts");
                None
            } else if ctx.nat_detected {
                Some(val - ipsec_attr::ENCAPSULATION_MODE_UDP_TUNNEL_DRAFTS + ipsec_attr::ENCAPSULATION_MODE_TUNNEL)
            } else {
                warn!(mode = val, "UDP encapsulation must only be used if NAT-Traversal is detected");
                None
            }
        }
        ipsec_attr::ENCAPSULATION_MODE_UDP_TUNNEL_RFC
        | ipsec_attr::ENCAPSULATION_MODE_UDP_TRANSPORT_RFC => {
            if ctx.nat_detected && ctx.nat_rfc_encaps {
                Some(val - ipsec_attr::ENCAPSULATION_MODE_UDP_TUNNEL_RFC + ipsec_attr::ENCAPSULATION_MODE_TUNNEL)
            } else if ctx.nat_detected {
                warn!(mode = val, "RFC UDP encapsulation must only be used with NAT-T RFC");
                None
            } else {
                warn!(mode = val, "UDP encapsulation must only be used if NAT-Traversal is detected");
                None
            }
        }
        other => {
            warn!(mode = other, "unknown ENCAPSULATION_MODE in IPSec SA");
            None
        }
    }
}

fn finish(
    sa: SaHeader,
    chosen: Chosen<'_>,
    pfs: PfsGroup,
    selection: bool,
    kernel: &mut dyn KernelInterface,
) -> NotifyResult<IpsecSelection> {
    let mut result = IpsecSelection {
        pfs_group: pfs.group(),
        ..IpsecSelection::default()
    };

    let info = |acc: &Accepted<'_>, peer_spi: u32| IpsecProtoInfo {
        attrs: IpsecTransAttrs {
            spi: peer_spi,
            ..acc.attrs
        },
        our_spi: 0,
        peer_spi,
    };
    result.ah = chosen.ah.as_ref().map(|(a, spi)| info(a, *spi));
    result.esp = chosen.esp.as_ref().map(|(a, spi)| info(a, *spi));
    result.ipcomp = chosen.ipcomp.as_ref().map(|(a, spi)| info(a, *spi));

    if selection {
        return Ok(result);
    }

    let mut buf = BytesMut::with_capacity(128);
    sa.encode(&mut buf);
    let has_esp = chosen.esp.is_some();
    let has_ipcomp = chosen.ipcomp.is_some();

    if let (Some((acc, _)), Some(pi)) = (&chosen.ah, result.ah.as_mut()) {
        let np = if has_esp || has_ipcomp {
            PayloadType::P
        } else {
            PayloadType::None
        };
        pi.our_spi = echo_proposal(&mut buf, acc, np, kernel)?;
    }
    if let (Some((acc, _)), Some(pi)) = (&chosen.esp, result.esp.as_mut()) {
        let np = if has_ipcomp {
            PayloadType::P
        } else {
            PayloadType::None
        };
        pi.our_spi = echo_proposal(&mut buf, acc, np, kernel)?;
    }
    if let (Some((acc, _)), Some(pi)) = (&chosen.ipcomp, result.ipcomp.as_mut()) {
        pi.our_spi = echo_proposal(&mut buf, acc, PayloadType::None, kernel)?;
    }

    result.reply_body = Some(buf.to_vec());
    Ok(result)
}

/// Emit the accepted transform as a one-transform proposal with a fresh SPI
fn echo_proposal(
    buf: &mut BytesMut,
    acc: &Accepted<'_>,
    np: PayloadType,
    kernel: &mut dyn KernelInterface,
) -> NotifyResult<u32> {
    let protoid = acc.header.protocol_id;
    let (our_spi, spi_bytes) = if protoid == proto::IPCOMP {
        let cpi = kernel.get_cpi().map_err(|e| {
            warn!(error = %e, "unable to allocate CPI");
            Notification::InvalidSpi
        })?;
        (u32::from(cpi), cpi.to_be_bytes().to_vec())
    } else {
        let spi = kernel.get_spi(protoid).map_err(|e| {
            warn!(error = %e, "unable to allocate SPI");
            Notification::InvalidSpi
        })?;
        (spi, spi.to_be_bytes().to_vec())
    };

    let t_len = (TransformHeader::SIZE + acc.raw_attrs.len()) as u16;
    ProposalHeader {
        next_payload: np.to_u8(),
        length: (ProposalHeader::SIZE + spi_bytes.len()) as u16 + t_len,
        proposal_number: acc.header.proposal_number,
        protocol_id: protoid,
        spi_size: spi_bytes.len() as u8,
        num_transforms: 1,
    }
    .encode(buf);
    buf.put_slice(&spi_bytes);
    TransformHeader {
        next_payload: PayloadType::None.to_u8(),
        length: t_len,
        transform_number: acc.trans.transform_number,
        transform_id: acc.trans.transform_id,
    }
    .encode(buf);
    buf.put_slice(acc.raw_attrs);
    Ok(our_spi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isakmp::encode_attribute;
    use crate::kernel::MemoryKernel;
    use crate::spdb::{out_sa, NatEncapsulation, ProposalDatabase, SaEncodeContext};

    fn ctx(policy: u32, algorithms: QuickAlgorithms) -> IpsecSelectContext {
        IpsecSelectContext {
            policy: Policy::new(policy),
            algorithms,
            nat_detected: false,
            nat_rfc_encaps: false,
            pfs_group: PfsGroup::Unset,
        }
    }

    fn proposal_body(policy: u32, algorithms: QuickAlgorithms, pfs: Option<u16>) -> Vec<u8> {
        let db = ProposalDatabase::ipsec(Policy::new(policy), algorithms);
        let mut kernel = MemoryKernel::new();
        let tunnel = policy & Policy::TUNNEL != 0;
        let ectx = SaEncodeContext::quick(28800, pfs, tunnel, NatEncapsulation::None);
        out_sa(&db, &ectx, &mut kernel).expect("Failed to encode SA").body
    }

    /// One ESP proposal with a single transform
    fn esp_sa(spi: u32, transid: u8, attrs: &[(u16, u32)]) -> Vec<u8> {
        let mut a = BytesMut::new();
        for (t, v) in attrs {
            encode_attribute(&mut a, *t, *v);
        }
        let mut buf = BytesMut::new();
        SaHeader {
            doi: ISAKMP_DOI_IPSEC,
            situation: SIT_IDENTITY_ONLY,
        }
        .encode(&mut buf);
        let t_len = TransformHeader::SIZE + a.len();
        ProposalHeader {
            next_payload: PayloadType::None.to_u8(),
            length: (ProposalHeader::SIZE + 4 + t_len) as u16,
            proposal_number: 1,
            protocol_id: proto::IPSEC_ESP,
            spi_size: 4,
            num_transforms: 1,
        }
        .encode(&mut buf);
        buf.put_u32(spi);
        TransformHeader {
            next_payload: PayloadType::None.to_u8(),
            length: t_len as u16,
            transform_number: 0,
            transform_id: transid,
        }
        .encode(&mut buf);
        buf.put_slice(&a);
        buf.to_vec()
    }

    /// ESP followed by IPCOMP in one conjunction, one transform each
    fn esp_ipcomp_sa(esp_attrs: &[(u16, u32)], ipcomp_attrs: &[(u16, u32)]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        SaHeader {
            doi: ISAKMP_DOI_IPSEC,
            situation: SIT_IDENTITY_ONLY,
        }
        .encode(&mut buf);
        let cpi = IPCOMP_FIRST_NEGOTIATED as u16;
        let parts: [(u8, Vec<u8>, u8, &[(u16, u32)]); 2] = [
            (proto::IPSEC_ESP, 0x1000u32.to_be_bytes().to_vec(), transform::ESP_3DES, esp_attrs),
            (proto::IPCOMP, cpi.to_be_bytes().to_vec(), transform::IPCOMP_DEFLATE, ipcomp_attrs),
        ];
        for (i, (protoid, spi, transid, attrs)) in parts.iter().enumerate() {
            let mut a = BytesMut::new();
            for (t, v) in attrs.iter() {
                encode_attribute(&mut a, *t, *v);
            }
            let t_len = TransformHeader::SIZE + a.len();
            let np = if i + 1 < parts.len() { PayloadType::P } else { PayloadType::None };
            ProposalHeader {
                next_payload: np.to_u8(),
                length: (ProposalHeader::SIZE + spi.len() + t_len) as u16,
                proposal_number: 1,
                protocol_id: *protoid,
                spi_size: spi.len() as u8,
                num_transforms: 1,
            }
            .encode(&mut buf);
            buf.put_slice(spi);
            TransformHeader {
                next_payload: PayloadType::None.to_u8(),
                length: t_len as u16,
                transform_number: 0,
                transform_id: *transid,
            }
            .encode(&mut buf);
            buf.put_slice(&a);
        }
        buf.to_vec()
    }

    fn tunnel_sha1() -> Vec<(u16, u32)> {
        vec![
            (ipsec_attr::ENCAPSULATION_MODE, ipsec_attr::ENCAPSULATION_MODE_TUNNEL.into()),
            (ipsec_attr::AUTH_ALGORITHM, ipsec_attr::AUTH_ALGORITHM_HMAC_SHA1.into()),
        ]
    }

    #[test]
    fn test_round_trip_esp_and_echo() {
        let policy = Policy::ENCRYPT | Policy::TUNNEL;
        let algs = QuickAlgorithms::default();
        let body = proposal_body(policy, algs, None);

        let mut kernel = MemoryKernel::new();
        let sel = parse_ipsec_sa_body(&body, &ctx(policy, algs), false, &mut kernel)
            .expect("Failed to select");
        let esp = sel.esp.expect("ESP chosen");
        assert_eq!(esp.attrs.transid, transform::ESP_3DES);
        assert_eq!(esp.attrs.auth, ipsec_attr::AUTH_ALGORITHM_HMAC_MD5);
        assert!(esp.attrs.is_tunnel());
        assert_eq!(esp.attrs.life_seconds, 28800);
        assert!(esp.our_spi >= IPSEC_DOI_SPI_MIN);
        assert!(sel.ah.is_none());
        assert_eq!(sel.pfs_group, None);
        assert_eq!(kernel.allocated_spi_count(), 1);

        // The initiator accepts the echo as a selection
        let reply = sel.reply_body.expect("responder echoes");
        let mut kernel2 = MemoryKernel::new();
        let mut c = ctx(policy, algs);
        c.pfs_group = PfsGroup::Disabled;
        let back = parse_ipsec_sa_body(&reply, &c, true, &mut kernel2).expect("Failed to accept echo");
        let back_esp = back.esp.expect("ESP chosen");
        assert_eq!(back_esp.peer_spi, esp.our_spi);
        assert_eq!(back_esp.attrs.transid, esp.attrs.transid);
        assert_eq!(kernel2.allocated_spi_count(), 0);
    }

    #[test]
    fn test_selection_is_idempotent() {
        let policy = Policy::ENCRYPT | Policy::TUNNEL;
        let algs = QuickAlgorithms::default();
        let body = proposal_body(policy, algs, Some(oakley::GROUP_MODP1024));
        let mut kernel = MemoryKernel::new();
        let a = parse_ipsec_sa_body(&body, &ctx(policy, algs), true, &mut kernel).expect("select");
        let b = parse_ipsec_sa_body(&body, &ctx(policy, algs), true, &mut kernel).expect("select");
        assert_eq!(a, b);
        assert_eq!(a.pfs_group, Some(oakley::GROUP_MODP1024));
    }

    #[test]
    fn test_3des_against_aes_only_policy() {
        let body = esp_sa(0x1234_5678, transform::ESP_3DES, &tunnel_sha1());
        let algs = QuickAlgorithms::new(QuickAlgorithms::ESP_AES128 | QuickAlgorithms::AUTH_SHA1);
        let policy = Policy::ENCRYPT | Policy::TUNNEL;
        let mut kernel = MemoryKernel::new();
        assert_eq!(
            parse_ipsec_sa_body(&body, &ctx(policy, algs), false, &mut kernel),
            Err(Notification::NoProposalChosen)
        );
        assert_eq!(kernel.allocated_spi_count(), 0);
    }

    #[test]
    fn test_reserved_spi_rejected() {
        let body = esp_sa(0xff, transform::ESP_3DES, &tunnel_sha1());
        let policy = Policy::ENCRYPT | Policy::TUNNEL;
        let mut kernel = MemoryKernel::new();
        assert_eq!(
            parse_ipsec_sa_body(&body, &ctx(policy, QuickAlgorithms::default()), false, &mut kernel),
            Err(Notification::InvalidSpi)
        );
    }

    #[test]
    fn test_encapsulation_mismatch_is_malformed() {
        let body = esp_sa(0x1000, transform::ESP_3DES, &tunnel_sha1());
        let mut kernel = MemoryKernel::new();
        assert_eq!(
            parse_ipsec_sa_body(
                &body,
                &ctx(Policy::ENCRYPT, QuickAlgorithms::default()),
                false,
                &mut kernel
            ),
            Err(Notification::BadProposalSyntax)
        );
    }

    #[test]
    fn test_missing_encapsulation_is_malformed() {
        let attrs = [(ipsec_attr::AUTH_ALGORITHM, u32::from(ipsec_attr::AUTH_ALGORITHM_HMAC_SHA1))];
        let body = esp_sa(0x1000, transform::ESP_3DES, &attrs);
        let mut kernel = MemoryKernel::new();
        assert_eq!(
            parse_ipsec_sa_body(
                &body,
                &ctx(Policy::ENCRYPT | Policy::TUNNEL, QuickAlgorithms::default()),
                false,
                &mut kernel
            ),
            Err(Notification::BadProposalSyntax)
        );
    }

    #[test]
    fn test_esp_without_auth_needs_ah() {
        let attrs = [(ipsec_attr::ENCAPSULATION_MODE, u32::from(ipsec_attr::ENCAPSULATION_MODE_TUNNEL))];
        let body = esp_sa(0x1000, transform::ESP_3DES, &attrs);
        let mut kernel = MemoryKernel::new();
        assert_eq!(
            parse_ipsec_sa_body(
                &body,
                &ctx(Policy::ENCRYPT | Policy::TUNNEL, QuickAlgorithms::default()),
                false,
                &mut kernel
            ),
            Err(Notification::NoProposalChosen)
        );
    }

    #[test]
    fn test_lifetime_capped() {
        let mut attrs = tunnel_sha1();
        attrs.push((ipsec_attr::SA_LIFE_TYPE, ipsec_attr::SA_LIFE_TYPE_SECONDS.into()));
        attrs.push((ipsec_attr::SA_LIFE_DURATION, 200_000));
        let body = esp_sa(0x1000, transform::ESP_3DES, &attrs);
        let mut kernel = MemoryKernel::new();
        let sel = parse_ipsec_sa_body(
            &body,
            &ctx(Policy::ENCRYPT | Policy::TUNNEL, QuickAlgorithms::default()),
            false,
            &mut kernel,
        )
        .expect("Failed to select");
        assert_eq!(sel.esp.expect("ESP chosen").attrs.life_seconds, IPSEC_LIFE_MAXIMUM);
    }

    #[test]
    fn test_udp_encapsulation_requires_nat() {
        let attrs = [
            (ipsec_attr::ENCAPSULATION_MODE, u32::from(ipsec_attr::ENCAPSULATION_MODE_UDP_TUNNEL_RFC)),
            (ipsec_attr::AUTH_ALGORITHM, u32::from(ipsec_attr::AUTH_ALGORITHM_HMAC_SHA1)),
        ];
        let body = esp_sa(0x1000, transform::ESP_3DES, &attrs);
        let policy = Policy::ENCRYPT | Policy::TUNNEL;
        let mut kernel = MemoryKernel::new();
        let mut c = ctx(policy, QuickAlgorithms::default());
        assert_eq!(
            parse_ipsec_sa_body(&body, &c, false, &mut kernel),
            Err(Notification::BadProposalSyntax)
        );

        c.nat_detected = true;
        c.nat_rfc_encaps = true;
        let sel = parse_ipsec_sa_body(&body, &c, false, &mut kernel).expect("Failed to select");
        assert!(sel.esp.expect("ESP chosen").attrs.is_tunnel());
    }

    #[test]
    fn test_ah_with_compression() {
        let policy = Policy::AUTHENTICATE | Policy::COMPRESS | Policy::TUNNEL;
        let algs = QuickAlgorithms::new(QuickAlgorithms::AH_SHA1);
        let body = proposal_body(policy, algs, None);
        let mut kernel = MemoryKernel::new();
        let sel = parse_ipsec_sa_body(&body, &ctx(policy, algs), false, &mut kernel)
            .expect("Failed to select");
        assert_eq!(sel.ah.expect("AH chosen").attrs.transid, transform::AH_SHA);
        let ipcomp = sel.ipcomp.expect("IPCOMP chosen");
        assert!((IPCOMP_FIRST_NEGOTIATED..=IPCOMP_LAST_NEGOTIATED).contains(&ipcomp.our_spi));

        // Without COMPRESS in our policy the only conjunction is refused
        let mut kernel = MemoryKernel::new();
        assert_eq!(
            parse_ipsec_sa_body(
                &body,
                &ctx(Policy::AUTHENTICATE | Policy::TUNNEL, algs),
                false,
                &mut kernel
            ),
            Err(Notification::NoProposalChosen)
        );
    }

    #[test]
    fn test_ipcomp_without_encapsulation_is_malformed() {
        let esp = [
            (ipsec_attr::ENCAPSULATION_MODE, u32::from(ipsec_attr::ENCAPSULATION_MODE_TRANSPORT)),
            (ipsec_attr::AUTH_ALGORITHM, u32::from(ipsec_attr::AUTH_ALGORITHM_HMAC_SHA1)),
        ];
        let policy = Policy::ENCRYPT | Policy::COMPRESS;
        let c = ctx(policy, QuickAlgorithms::default());

        let mut kernel = MemoryKernel::new();
        assert_eq!(
            parse_ipsec_sa_body(&esp_ipcomp_sa(&esp, &[]), &c, false, &mut kernel),
            Err(Notification::BadProposalSyntax)
        );

        let ipcomp = [(ipsec_attr::ENCAPSULATION_MODE, u32::from(ipsec_attr::ENCAPSULATION_MODE_TRANSPORT))];
        let mut kernel = MemoryKernel::new();
        let sel = parse_ipsec_sa_body(&esp_ipcomp_sa(&esp, &ipcomp), &c, false, &mut kernel)
            .expect("Failed to select");
        assert!(!sel.ipcomp.expect("IPCOMP chosen").attrs.is_tunnel());
    }

    #[test]
    fn test_transport_compression_accepts_our_own_proposal() {
        let policy = Policy::ENCRYPT | Policy::COMPRESS;
        let algs = QuickAlgorithms::default();
        let body = proposal_body(policy, algs, None);
        let mut kernel = MemoryKernel::new();
        let sel = parse_ipsec_sa_body(&body, &ctx(policy, algs), false, &mut kernel)
            .expect("Failed to select");
        assert!(!sel.esp.expect("ESP chosen").attrs.is_tunnel());
        assert!(!sel.ipcomp.expect("IPCOMP chosen").attrs.is_tunnel());
    }

    #[test]
    fn test_pfs_group_must_agree() {
        let policy = Policy::ENCRYPT | Policy::TUNNEL;
        let algs = QuickAlgorithms::default();
        let body = proposal_body(policy, algs, Some(oakley::GROUP_MODP1536));
        let mut kernel = MemoryKernel::new();
        let mut c = ctx(policy, algs);
        c.pfs_group = PfsGroup::Group(oakley::GROUP_MODP1024);
        assert_eq!(
            parse_ipsec_sa_body(&body, &c, true, &mut kernel),
            Err(Notification::BadProposalSyntax)
        );
    }
}
