//! Rendering a proposal database into an SA payload body

use super::{DbProp, ProposalDatabase};
use crate::error::Result;
use crate::isakmp::{
    encode_attribute, ipsec_attr, oakley, proto, PayloadType, ProposalHeader, SaHeader,
    TransformHeader, ISAKMP_DOI_IPSEC, SIT_IDENTITY_ONLY,
};
use crate::kernel::KernelInterface;
use bytes::{BufMut, BytesMut};

/// UDP encapsulation flavour to announce in ENCAPSULATION_MODE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatEncapsulation {
    /// No NAT between the peers
    #[default]
    None,
    /// NAT detected, RFC 3947 values
    Rfc,
    /// NAT detected, draft values
    Drafts,
}

/// Per-negotiation knobs that are not part of the database itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaEncodeContext {
    /// Phase 1 (Oakley) rather than Quick Mode
    pub phase1: bool,
    /// Lifetime in seconds attached to every transform
    pub lifetime: u32,
    /// PFS group announced in every non-IPCOMP Quick Mode transform
    pub pfs_group: Option<u16>,
    /// Tunnel rather than transport mode
    pub tunnel: bool,
    /// NAT-T encapsulation
    pub nat: NatEncapsulation,
}

impl SaEncodeContext {
    /// Context for a Main or Aggressive Mode proposal
    pub fn phase1(lifetime: u32) -> Self {
        SaEncodeContext {
            phase1: true,
            lifetime,
            pfs_group: None,
            tunnel: false,
            nat: NatEncapsulation::None,
        }
    }

    /// Context for a Quick Mode proposal
    pub fn quick(lifetime: u32, pfs_group: Option<u16>, tunnel: bool, nat: NatEncapsulation) -> Self {
        SaEncodeContext {
            phase1: false,
            lifetime,
            pfs_group,
            tunnel,
            nat,
        }
    }

    fn encapsulation_mode(&self) -> u16 {
        match (self.nat, self.tunnel) {
            (NatEncapsulation::None, true) => ipsec_attr::ENCAPSULATION_MODE_TUNNEL,
            (NatEncapsulation::None, false) => ipsec_attr::ENCAPSULATION_MODE_TRANSPORT,
            (NatEncapsulation::Rfc, true) => ipsec_attr::ENCAPSULATION_MODE_UDP_TUNNEL_RFC,
            (NatEncapsulation::Rfc, false) => ipsec_attr::ENCAPSULATION_MODE_UDP_TRANSPORT_RFC,
            (NatEncapsulation::Drafts, true) => ipsec_attr::ENCAPSULATION_MODE_UDP_TUNNEL_DRAFTS,
            (NatEncapsulation::Drafts, false) => {
                ipsec_attr::ENCAPSULATION_MODE_UDP_TRANSPORT_DRAFTS
            }
        }
    }
}

/// An encoded SA body plus the inbound SPIs allocated for it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedSa {
    /// SA payload body (DOI onwards)
    pub body: Vec<u8>,
    /// Our AH SPI, if AH was proposed
    pub ah_spi: Option<u32>,
    /// Our ESP SPI, if ESP was proposed
    pub esp_spi: Option<u32>,
    /// Our IPCOMP CPI, if compression was proposed
    pub ipcomp_cpi: Option<u16>,
}

/// Encode `db` as an SA payload body.
///
/// Proposal numbers are the conjunction index and transform numbers the
/// index within the proposal, both from 0. Quick Mode SPIs are obtained from
/// the kernel the first time a protocol appears and shared by every
/// conjunction that proposes it.
pub fn out_sa(
    db: &ProposalDatabase,
    ctx: &SaEncodeContext,
    kernel: &mut dyn KernelInterface,
) -> Result<EncodedSa> {
    let mut encoded = EncodedSa::default();
    let mut buf = BytesMut::with_capacity(256);
    SaHeader {
        doi: ISAKMP_DOI_IPSEC,
        situation: SIT_IDENTITY_ONLY,
    }
    .encode(&mut buf);

    let total_props: usize = db.conjs.iter().map(|c| c.props.len()).sum();
    let mut emitted = 0usize;

    for (pn, conj) in db.conjs.iter().enumerate() {
        for prop in &conj.props {
            emitted += 1;
            let np = if emitted == total_props {
                PayloadType::None
            } else {
                PayloadType::P
            };
            let spi = proposal_spi(prop, ctx, &mut encoded, kernel)?;
            emit_proposal(&mut buf, prop, pn as u8, np, &spi, ctx);
        }
    }

    encoded.body = buf.to_vec();
    Ok(encoded)
}

fn proposal_spi(
    prop: &DbProp,
    ctx: &SaEncodeContext,
    encoded: &mut EncodedSa,
    kernel: &mut dyn KernelInterface,
) -> Result<Vec<u8>> {
    if ctx.phase1 {
        return Ok(Vec::new());
    }
    let spi = match prop.protoid {
        proto::IPCOMP => {
            let cpi = match encoded.ipcomp_cpi {
                Some(cpi) => cpi,
                None => {
                    let cpi = kernel.get_cpi()?;
                    encoded.ipcomp_cpi = Some(cpi);
                    cpi
                }
            };
            return Ok(cpi.to_be_bytes().to_vec());
        }
        proto::IPSEC_AH => match encoded.ah_spi {
            Some(spi) => spi,
            None => {
                let spi = kernel.get_spi(proto::IPSEC_AH)?;
                encoded.ah_spi = Some(spi);
                spi
            }
        },
        _ => match encoded.esp_spi {
            Some(spi) => spi,
            None => {
                let spi = kernel.get_spi(proto::IPSEC_ESP)?;
                encoded.esp_spi = Some(spi);
                spi
            }
        },
    };
    Ok(spi.to_be_bytes().to_vec())
}

fn emit_proposal(
    buf: &mut BytesMut,
    prop: &DbProp,
    number: u8,
    np: PayloadType,
    spi: &[u8],
    ctx: &SaEncodeContext,
) {
    let start = buf.len();
    let len_at = ProposalHeader {
        next_payload: np.to_u8(),
        length: 0,
        proposal_number: number,
        protocol_id: prop.protoid,
        spi_size: spi.len() as u8,
        num_transforms: prop.trans.len() as u8,
    }
    .encode(buf);
    buf.put_slice(spi);

    for (tn, trans) in prop.trans.iter().enumerate() {
        let t_start = buf.len();
        let np = if tn + 1 == prop.trans.len() {
            PayloadType::None
        } else {
            PayloadType::T
        };
        let t_len_at = TransformHeader {
            next_payload: np.to_u8(),
            length: 0,
            transform_number: tn as u8,
            transform_id: trans.transid,
        }
        .encode(buf);

        if ctx.phase1 {
            encode_attribute(buf, oakley::LIFE_TYPE, oakley::LIFE_SECONDS.into());
            encode_attribute(buf, oakley::LIFE_DURATION, ctx.lifetime);
        } else {
            // every transform names its mode, IPCOMP included
            let ipcomp = prop.protoid == proto::IPCOMP;
            if let Some(group) = ctx.pfs_group {
                if !ipcomp {
                    encode_attribute(buf, ipsec_attr::GROUP_DESCRIPTION, group.into());
                }
            }
            encode_attribute(
                buf,
                ipsec_attr::ENCAPSULATION_MODE,
                ctx.encapsulation_mode().into(),
            );
            encode_attribute(
                buf,
                ipsec_attr::SA_LIFE_TYPE,
                ipsec_attr::SA_LIFE_TYPE_SECONDS.into(),
            );
            encode_attribute(buf, ipsec_attr::SA_LIFE_DURATION, ctx.lifetime);
        }
        for a in &trans.attrs {
            encode_attribute(buf, a.attr_type, a.value.into());
        }

        let t_len = (buf.len() - t_start) as u16;
        buf[t_len_at..t_len_at + 2].copy_from_slice(&t_len.to_be_bytes());
    }

    let len = (buf.len() - start) as u16;
    buf[len_at..len_at + 2].copy_from_slice(&len.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isakmp::{Attribute, SaHeader};
    use crate::kernel::MemoryKernel;
    use crate::policy::{MainAlgorithms, Policy, QuickAlgorithms};

    /// Walk an encoded body and return (proposal#, protoid, spi size, [transform#])
    fn walk(body: &[u8]) -> Vec<(u8, u8, usize, Vec<u8>)> {
        let mut out = Vec::new();
        let mut rest = &body[SaHeader::SIZE..];
        loop {
            let prop = ProposalHeader::from_bytes(rest).expect("Failed to parse proposal");
            let mut trans_data =
                &rest[ProposalHeader::SIZE + prop.spi_size as usize..prop.length as usize];
            let mut numbers = Vec::new();
            while !trans_data.is_empty() {
                let t = TransformHeader::from_bytes(trans_data).expect("Failed to parse transform");
                Attribute::parse_all(&trans_data[TransformHeader::SIZE..t.length as usize])
                    .expect("Failed to parse attributes");
                numbers.push(t.transform_number);
                trans_data = &trans_data[t.length as usize..];
            }
            out.push((
                prop.proposal_number,
                prop.protocol_id,
                prop.spi_size as usize,
                numbers,
            ));
            if prop.next_payload == PayloadType::None.to_u8() {
                break;
            }
            rest = &rest[prop.length as usize..];
        }
        out
    }

    #[test]
    fn test_oakley_numbering_contiguous() {
        let db = ProposalDatabase::oakley(
            Policy::new(Policy::PSK | Policy::RSASIG),
            MainAlgorithms::default(),
        );
        let mut kernel = MemoryKernel::new();
        let sa = out_sa(&db, &SaEncodeContext::phase1(3600), &mut kernel).expect("Failed to encode");

        let props = walk(&sa.body);
        assert_eq!(props.len(), 1);
        let (pn, protoid, spi_size, numbers) = &props[0];
        assert_eq!(*pn, 0);
        assert_eq!(*protoid, proto::ISAKMP);
        assert_eq!(*spi_size, 0);
        let expected: Vec<u8> = (0..db.transform_count() as u8).collect();
        assert_eq!(numbers, &expected);
        assert_eq!(kernel.allocated_spi_count(), 0);
    }

    #[test]
    fn test_oakley_lifetime_attributes() {
        let db = ProposalDatabase::aggressive(MainAlgorithms::default());
        let mut kernel = MemoryKernel::new();
        let sa = out_sa(&db, &SaEncodeContext::phase1(28800), &mut kernel).expect("Failed to encode");
        let attrs_at = SaHeader::SIZE + ProposalHeader::SIZE + TransformHeader::SIZE;
        let attrs = Attribute::parse_all(&sa.body[attrs_at..]).expect("Failed to parse attributes");
        assert_eq!(attrs[0].attr_type, oakley::LIFE_TYPE);
        assert_eq!(attrs[1].attr_type, oakley::LIFE_DURATION);
        assert_eq!(attrs[1].basic(), Some(28800));
        assert_eq!(attrs[2].attr_type, oakley::ENCRYPTION_ALGORITHM);
    }

    #[test]
    fn test_ipsec_spis_shared_across_conjunctions() {
        let policy = Policy::new(Policy::ENCRYPT | Policy::COMPRESS | Policy::TUNNEL);
        let db = ProposalDatabase::ipsec(policy, QuickAlgorithms::default());
        let mut kernel = MemoryKernel::new();
        let ctx = SaEncodeContext::quick(28800, Some(2), true, NatEncapsulation::None);
        let sa = out_sa(&db, &ctx, &mut kernel).expect("Failed to encode");

        assert!(sa.esp_spi.is_some());
        assert!(sa.ah_spi.is_some());
        assert!(sa.ipcomp_cpi.is_some());
        assert_eq!(kernel.allocated_spi_count(), 2);

        let props = walk(&sa.body);
        // ESP + IPCOMP as proposal 0, AH + IPCOMP as proposal 1
        let layout: Vec<(u8, u8, usize)> = props.iter().map(|p| (p.0, p.1, p.2)).collect();
        assert_eq!(
            layout,
            vec![
                (0, proto::IPSEC_ESP, 4),
                (0, proto::IPCOMP, 2),
                (1, proto::IPSEC_AH, 4),
                (1, proto::IPCOMP, 2),
            ]
        );
        for (_, _, _, numbers) in &props {
            let expected: Vec<u8> = (0..numbers.len() as u8).collect();
            assert_eq!(numbers, &expected);
        }
    }

    #[test]
    fn test_ipsec_attribute_order() {
        let algs = QuickAlgorithms::new(QuickAlgorithms::ESP_AES128 | QuickAlgorithms::AUTH_SHA1);
        let db = ProposalDatabase::ipsec(Policy::new(Policy::ENCRYPT), algs);
        let mut kernel = MemoryKernel::new();
        let ctx = SaEncodeContext::quick(3600, Some(5), false, NatEncapsulation::Rfc);
        let sa = out_sa(&db, &ctx, &mut kernel).expect("Failed to encode");

        let attrs_at = SaHeader::SIZE + ProposalHeader::SIZE + 4 + TransformHeader::SIZE;
        let attrs = Attribute::parse_all(&sa.body[attrs_at..]).expect("Failed to parse attributes");
        let types: Vec<u16> = attrs.iter().map(|a| a.attr_type).collect();
        assert_eq!(
            types,
            vec![
                ipsec_attr::GROUP_DESCRIPTION,
                ipsec_attr::ENCAPSULATION_MODE,
                ipsec_attr::SA_LIFE_TYPE,
                ipsec_attr::SA_LIFE_DURATION,
                ipsec_attr::AUTH_ALGORITHM,
                ipsec_attr::KEY_LENGTH,
            ]
        );
        assert_eq!(
            attrs[1].basic(),
            Some(ipsec_attr::ENCAPSULATION_MODE_UDP_TRANSPORT_RFC)
        );
    }

    #[test]
    fn test_long_lifetime_uses_variable_form() {
        let db = ProposalDatabase::aggressive(MainAlgorithms::default());
        let mut kernel = MemoryKernel::new();
        let sa = out_sa(&db, &SaEncodeContext::phase1(100_000), &mut kernel).expect("Failed to encode");
        let attrs_at = SaHeader::SIZE + ProposalHeader::SIZE + TransformHeader::SIZE;
        let attrs = Attribute::parse_all(&sa.body[attrs_at..]).expect("Failed to parse attributes");
        assert_eq!(attrs[1].attr_type, oakley::LIFE_DURATION);
        assert!(!attrs[1].is_basic());
    }
}
