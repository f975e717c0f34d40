//! Phase 1 (Oakley) SA selection

use super::ProposalDatabase;
use crate::config::{OAKLEY_LIFE_DEFAULT, OAKLEY_LIFE_MAXIMUM};
use crate::isakmp::{
    decode_long_duration, oakley, proto, transform, AttrValue, Attribute, Notification,
    PayloadType, ProposalHeader, SaHeader, TransformHeader, ISAKMP_DOI_IPSEC,
    MAX_ISAKMP_SPI_SIZE, SIT_IDENTITY_ONLY,
};
use crate::policy::{MainAlgorithms, Policy};
use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

/// Decoded attributes of the chosen Oakley transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OakleyTransAttrs {
    /// Cipher (Oakley id)
    pub encrypt: u16,
    /// Cipher key length in bits (0 = algorithm default)
    pub enc_key_len: u16,
    /// Hash (Oakley id)
    pub hash: u16,
    /// Authentication method
    pub auth: u16,
    /// MODP group
    pub group: u16,
    /// Lifetime in seconds
    pub life_seconds: u32,
    /// Lifetime in kilobytes (0 = none)
    pub life_kilobytes: u32,
}

impl Default for OakleyTransAttrs {
    fn default() -> Self {
        OakleyTransAttrs {
            encrypt: 0,
            enc_key_len: 0,
            hash: 0,
            auth: 0,
            group: 0,
            life_seconds: OAKLEY_LIFE_DEFAULT,
            life_kilobytes: 0,
        }
    }
}

/// What the local side will accept in Phase 1
#[derive(Debug, Clone, Copy)]
pub struct IsakmpSelectContext {
    /// Authentication policy of the candidate connection
    pub policy: Policy,
    /// Permitted algorithms
    pub algorithms: MainAlgorithms,
    /// Whether a pre-shared secret exists for the peer
    pub has_psk: bool,
}

/// Outcome of a successful Phase 1 selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsakmpSelection {
    /// Accepted transform
    pub attrs: OakleyTransAttrs,
    /// SA body to send back (responder only)
    pub reply_body: Option<Vec<u8>>,
}

/// Oakley attributes the initiator commits to for Aggressive Mode, where the
/// KE payload is computed before the responder has chosen anything.
pub fn init_st_oakley(algorithms: MainAlgorithms, lifetime: u32) -> Option<OakleyTransAttrs> {
    let db = ProposalDatabase::aggressive(algorithms);
    let trans = db.conjs.first()?.props.first()?.trans.first()?;
    let mut attrs = OakleyTransAttrs {
        life_seconds: lifetime,
        ..OakleyTransAttrs::default()
    };
    for a in &trans.attrs {
        match a.attr_type {
            oakley::ENCRYPTION_ALGORITHM => attrs.encrypt = a.value,
            oakley::HASH_ALGORITHM => attrs.hash = a.value,
            oakley::AUTHENTICATION_METHOD => attrs.auth = a.value,
            oakley::GROUP_DESCRIPTION => attrs.group = a.value,
            oakley::KEY_LENGTH => attrs.enc_key_len = a.value,
            _ => {}
        }
    }
    Some(attrs)
}

/// Choose a transform out of the peer's Phase 1 SA payload body.
///
/// With `selection` set we are the initiator reading the responder's
/// answer: exactly one transform is allowed and nothing is echoed.
/// Otherwise the first acceptable transform is echoed back as a
/// single-transform proposal.
pub fn parse_isakmp_sa_body(
    body: &[u8],
    ctx: &IsakmpSelectContext,
    selection: bool,
) -> std::result::Result<IsakmpSelection, Notification> {
    let sa = SaHeader::from_bytes(body).map_err(|_| Notification::PayloadMalformed)?;
    if sa.doi != ISAKMP_DOI_IPSEC {
        warn!(doi = sa.doi, "Unknown/unsupported DOI");
        return Err(Notification::DoiNotSupported);
    }
    if sa.situation != SIT_IDENTITY_ONLY {
        warn!(situation = sa.situation, "unsupported IPsec DOI situation");
        return Err(Notification::SituationNotSupported);
    }

    let rest = &body[SaHeader::SIZE..];
    let prop = ProposalHeader::from_bytes(rest).map_err(|_| Notification::PayloadMalformed)?;
    if prop.next_payload != PayloadType::None.to_u8() {
        warn!(
            np = prop.next_payload,
            "Proposal Payload must be alone in Oakley SA"
        );
        return Err(Notification::PayloadMalformed);
    }
    if prop.protocol_id != proto::ISAKMP {
        warn!(
            protocol = proto::name(prop.protocol_id),
            "unexpected Protocol ID found in Oakley Proposal"
        );
        return Err(Notification::InvalidProtocolId);
    }

    let spi_size = prop.spi_size as usize;
    if spi_size > MAX_ISAKMP_SPI_SIZE {
        warn!(spi_size, "invalid SPI size in Oakley Proposal");
        return Err(Notification::InvalidSpi);
    }
    // A small SPI (it should be empty in phase 1) is tolerated and skipped
    let prop_body = &rest[ProposalHeader::SIZE..prop.length as usize];
    if prop_body.len() < spi_size {
        return Err(Notification::PayloadMalformed);
    }

    if selection && prop.num_transforms != 1 {
        warn!("a single Transform is required in a selecting Oakley Proposal");
        return Err(Notification::BadProposalSyntax);
    }

    let mut data = &prop_body[spi_size..];
    let mut trans_left = prop.num_transforms as usize;
    let mut last_transnum: i32 = -1;

    loop {
        if trans_left == 0 {
            warn!("number of Transform Payloads disagrees with Oakley Proposal Payload");
            return Err(Notification::BadProposalSyntax);
        }
        let trans = TransformHeader::from_bytes(data).map_err(|_| Notification::BadProposalSyntax)?;
        if i32::from(trans.transform_number) <= last_transnum {
            warn!("Transform Numbers are not monotonically increasing in Oakley Proposal");
            return Err(Notification::BadProposalSyntax);
        }
        last_transnum = i32::from(trans.transform_number);
        if trans.transform_id != transform::KEY_IKE {
            warn!(
                transform_id = trans.transform_id,
                "expected KEY_IKE but found another Transform ID in Oakley Transform"
            );
            return Err(Notification::InvalidTransformId);
        }

        let raw_attrs = &data[TransformHeader::SIZE..trans.length as usize];
        match evaluate_transform(raw_attrs, trans.transform_number, ctx)? {
            Ok(attrs) => {
                debug!(
                    transform = trans.transform_number,
                    "Oakley Transform accepted"
                );
                let reply_body = if selection {
                    None
                } else {
                    Some(echo(sa, &prop, &trans, raw_attrs))
                };
                return Ok(IsakmpSelection { attrs, reply_body });
            }
            Err(ugh) => {
                debug!(
                    transform = trans.transform_number,
                    reason = %ugh,
                    "Oakley Transform rejected"
                );
            }
        }

        data = &data[trans.length as usize..];
        trans_left -= 1;
        if trans.next_payload == PayloadType::None.to_u8() {
            if trans_left != 0 {
                warn!("number of Transform Payloads disagrees with Oakley Proposal Payload");
                return Err(Notification::BadProposalSyntax);
            }
            break;
        }
        if trans.next_payload != PayloadType::T.to_u8() {
            warn!(np = trans.next_payload, "unexpected payload in Oakley Proposal");
            return Err(Notification::BadProposalSyntax);
        }
    }

    warn!("no acceptable Oakley Transform");
    Err(Notification::NoProposalChosen)
}

type Verdict = std::result::Result<OakleyTransAttrs, String>;

/// Decode one transform's attributes.
///
/// Malformed input is an outer `Err`; a well-formed transform that local
/// policy refuses is an inner `Err` carrying the reason.
fn evaluate_transform(
    raw: &[u8],
    transnum: u8,
    ctx: &IsakmpSelectContext,
) -> std::result::Result<Verdict, Notification> {
    let attrs = Attribute::parse_all(raw).map_err(|_| Notification::BadProposalSyntax)?;
    let mut ta = OakleyTransAttrs::default();
    let mut seen: u32 = 0;
    let mut seen_durations: u32 = 0;
    let mut life_type: Option<u16> = None;

    for a in &attrs {
        let ty = a.attr_type;
        if ty >= 32 {
            warn!(attr = ty, transform = transnum, "unexpected attribute in Oakley Transform");
            return Err(Notification::BadProposalSyntax);
        }
        if seen & (1 << ty) != 0 {
            warn!(
                attr = oakley::attr_name(ty),
                transform = transnum,
                "repeated attribute in Oakley Transform"
            );
            return Err(Notification::BadProposalSyntax);
        }
        seen |= 1 << ty;

        let val: u32 = match (&a.value, ty) {
            (AttrValue::Basic(v), _) => u32::from(*v),
            (AttrValue::Variable(bytes), oakley::LIFE_DURATION) => decode_long_duration(bytes),
            (AttrValue::Variable(_), _) => {
                return Ok(refuse(ty, "attribute must use the short form".into()));
            }
        };

        match ty {
            oakley::ENCRYPTION_ALGORITHM => {
                let enc = val as u16;
                if !ctx.algorithms.allows_enc_any(enc) {
                    let ugh = match enc {
                        oakley::DES_CBC | oakley::TRIPLE_DES_CBC | oakley::AES_CBC => {
                            format!("{} is disabled", enc_name(enc))
                        }
                        _ => format!("{} is not supported", enc_name(enc)),
                    };
                    return Ok(refuse(ty, ugh));
                }
                ta.encrypt = enc;
            }
            oakley::HASH_ALGORITHM => {
                let hash = val as u16;
                if !ctx.algorithms.allows_hash(hash) {
                    let ugh = match hash {
                        oakley::MD5 | oakley::SHA1 => format!("{} is disabled", hash_name(hash)),
                        _ => format!("{} is not supported", hash_name(hash)),
                    };
                    return Ok(refuse(ty, ugh));
                }
                ta.hash = hash;
            }
            oakley::AUTHENTICATION_METHOD => {
                let auth = val as u16;
                match auth {
                    oakley::PRESHARED_KEY => {
                        if !ctx.policy.contains(Policy::PSK) {
                            return Ok(refuse(
                                ty,
                                "policy does not allow OAKLEY_PRESHARED_KEY authentication".into(),
                            ));
                        }
                        if !ctx.has_psk {
                            return Ok(refuse(
                                ty,
                                "Can't authenticate: no preshared key found".into(),
                            ));
                        }
                    }
                    oakley::RSA_SIG => {
                        if !ctx.policy.contains(Policy::RSASIG) {
                            return Ok(refuse(
                                ty,
                                "policy does not allow OAKLEY_RSA_SIG authentication".into(),
                            ));
                        }
                    }
                    other => {
                        return Ok(refuse(
                            ty,
                            format!("{} authentication is not supported", auth_name(other)),
                        ));
                    }
                }
                ta.auth = auth;
            }
            oakley::GROUP_DESCRIPTION => {
                let group = val as u16;
                match group {
                    oakley::GROUP_MODP768 | oakley::GROUP_MODP1024 | oakley::GROUP_MODP1536 => {
                        if !ctx.algorithms.allows_group(group) {
                            return Ok(refuse(ty, format!("{} is disabled", group_name(group))));
                        }
                    }
                    _ => {
                        return Ok(refuse(
                            ty,
                            "only OAKLEY_GROUP_MODP768, OAKLEY_GROUP_MODP1024 and OAKLEY_GROUP_MODP1536 supported"
                                .into(),
                        ));
                    }
                }
                ta.group = group;
            }
            oakley::LIFE_TYPE => {
                let lt = val as u16;
                match lt {
                    oakley::LIFE_SECONDS | oakley::LIFE_KILOBYTES => {
                        if seen_durations & (1 << lt) != 0 {
                            warn!(value = lt, "attribute OAKLEY_LIFE_TYPE value repeated");
                            return Err(Notification::BadProposalSyntax);
                        }
                        seen_durations |= 1 << lt;
                        life_type = Some(lt);
                    }
                    _ => return Ok(refuse(ty, format!("unknown value {}", lt))),
                }
            }
            oakley::LIFE_DURATION => {
                let lt = match life_type.take() {
                    Some(lt) => lt,
                    None => {
                        return Ok(refuse(
                            ty,
                            "OAKLEY_LIFE_DURATION attribute not preceded by OAKLEY_LIFE_TYPE attribute"
                                .into(),
                        ));
                    }
                };
                seen &= !((1 << oakley::LIFE_DURATION) | (1 << oakley::LIFE_TYPE));
                if lt == oakley::LIFE_SECONDS {
                    if val > OAKLEY_LIFE_MAXIMUM {
                        return Ok(refuse(
                            ty,
                            format!(
                                "peer requested {} seconds which exceeds our limit {} seconds",
                                val, OAKLEY_LIFE_MAXIMUM
                            ),
                        ));
                    }
                    ta.life_seconds = val;
                } else {
                    ta.life_kilobytes = val;
                }
            }
            oakley::KEY_LENGTH => {
                if seen & (1 << oakley::ENCRYPTION_ALGORITHM) == 0 {
                    return Ok(refuse(
                        ty,
                        "OAKLEY_KEY_LENGTH attribute not preceded by OAKLEY_ENCRYPTION_ALGORITHM attribute"
                            .into(),
                    ));
                }
                ta.enc_key_len = val as u16;
            }
            _ => return Ok(refuse(ty, "unsupported OAKLEY attribute".into())),
        }
    }

    let mandatory = (1 << oakley::ENCRYPTION_ALGORITHM)
        | (1 << oakley::HASH_ALGORITHM)
        | (1 << oakley::AUTHENTICATION_METHOD)
        | (1 << oakley::GROUP_DESCRIPTION);
    if seen & mandatory != mandatory {
        warn!(
            transform = transnum,
            "missing mandatory attribute(s) in Oakley Transform"
        );
        return Err(Notification::BadProposalSyntax);
    }

    if !ctx.algorithms.allows_enc(ta.encrypt, ta.enc_key_len) {
        return Ok(Err(format!(
            "OAKLEY proposal refused: {} with {} bit key is not allowed",
            enc_name(ta.encrypt),
            ta.enc_key_len
        )));
    }

    Ok(Ok(ta))
}

fn refuse(attr_type: u16, ugh: String) -> Verdict {
    Err(format!("{}.  Attribute {}", ugh, oakley::attr_name(attr_type)))
}

fn echo(sa: SaHeader, prop: &ProposalHeader, trans: &TransformHeader, raw_attrs: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(SaHeader::SIZE + 16 + raw_attrs.len());
    sa.encode(&mut buf);
    let t_len = (TransformHeader::SIZE + raw_attrs.len()) as u16;
    ProposalHeader {
        next_payload: PayloadType::None.to_u8(),
        length: ProposalHeader::SIZE as u16 + t_len,
        proposal_number: prop.proposal_number,
        protocol_id: proto::ISAKMP,
        spi_size: 0,
        num_transforms: 1,
    }
    .encode(&mut buf);
    TransformHeader {
        next_payload: PayloadType::None.to_u8(),
        length: t_len,
        transform_number: trans.transform_number,
        transform_id: trans.transform_id,
    }
    .encode(&mut buf);
    buf.put_slice(raw_attrs);
    buf.to_vec()
}

fn enc_name(enc: u16) -> String {
    match enc {
        oakley::DES_CBC => "OAKLEY_DES_CBC".into(),
        oakley::TRIPLE_DES_CBC => "OAKLEY_3DES_CBC".into(),
        oakley::AES_CBC => "OAKLEY_AES_CBC".into(),
        other => format!("OAKLEY_ENCRYPTION_ALGORITHM {}", other),
    }
}

fn hash_name(hash: u16) -> String {
    match hash {
        oakley::MD5 => "OAKLEY_MD5".into(),
        oakley::SHA1 => "OAKLEY_SHA".into(),
        oakley::SHA2_256 => "OAKLEY_SHA2_256".into(),
        other => format!("OAKLEY_HASH_ALGORITHM {}", other),
    }
}

fn auth_name(auth: u16) -> String {
    match auth {
        oakley::DSS_SIG => "OAKLEY_DSS_SIG".into(),
        oakley::RSA_ENC => "OAKLEY_RSA_ENC".into(),
        oakley::RSA_ENC_REV => "OAKLEY_RSA_ENC_REV".into(),
        other => format!("OAKLEY_AUTHENTICATION_METHOD {}", other),
    }
}

fn group_name(group: u16) -> &'static str {
    match group {
        oakley::GROUP_MODP768 => "OAKLEY_GROUP_MODP768",
        oakley::GROUP_MODP1024 => "OAKLEY_GROUP_MODP1024",
        _ => "OAKLEY_GROUP_MODP1536",
    }
}
