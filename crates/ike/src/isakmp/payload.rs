//! ISAKMP payload bodies (RFC 2408 Section 3.2 - 3.15, RFC 3947)
//!
//! Only the bodies are modelled here; the generic payload header is handled
//! by [`MessageBuilder`](super::MessageBuilder) on output and by the
//! dispatcher's payload walk on input.

use super::constants::*;
use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

fn need(data: &[u8], required: usize) -> Result<()> {
    if data.len() < required {
        return Err(Error::BufferTooShort {
            required,
            available: data.len(),
        });
    }
    Ok(())
}

fn be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Generic payload header
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |   RESERVED    |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericHeader {
    /// Next payload type (raw)
    pub next_payload: u8,
    /// Reserved octet; must be zero
    pub reserved: u8,
    /// Length including this header
    pub length: u16,
}

impl GenericHeader {
    /// Parse a generic payload header
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        need(data, GENERIC_HEADER_SIZE)?;
        let length = be16(data, 2);
        if (length as usize) < GENERIC_HEADER_SIZE {
            return Err(Error::InvalidLength {
                expected: GENERIC_HEADER_SIZE,
                actual: length as usize,
            });
        }
        Ok(GenericHeader {
            next_payload: data[0],
            reserved: data[1],
            length,
        })
    }
}

/// SA payload fixed part (IPsec DOI)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaHeader {
    /// Domain of Interpretation
    pub doi: u32,
    /// Situation bitmap
    pub situation: u32,
}

impl SaHeader {
    /// Size of the fixed part
    pub const SIZE: usize = 8;

    /// Parse the DOI and situation
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        need(data, Self::SIZE)?;
        Ok(SaHeader {
            doi: be32(data, 0),
            situation: be32(data, 4),
        })
    }

    /// Append to a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.doi);
        buf.put_u32(self.situation);
    }
}

/// Proposal payload header
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |   RESERVED    |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Proposal #   |  Protocol-Id  |    SPI Size   |# of Transforms|
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalHeader {
    /// Next payload (P or NONE)
    pub next_payload: u8,
    /// Length including SPI and transforms
    pub length: u16,
    /// Proposal number
    pub proposal_number: u8,
    /// Protocol id
    pub protocol_id: u8,
    /// SPI size
    pub spi_size: u8,
    /// Number of transforms
    pub num_transforms: u8,
}

impl ProposalHeader {
    /// Size of the fixed part
    pub const SIZE: usize = 8;

    /// Parse a proposal header
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        need(data, Self::SIZE)?;
        let length = be16(data, 2);
        if (length as usize) < Self::SIZE || length as usize > data.len() {
            return Err(Error::InvalidLength {
                expected: Self::SIZE,
                actual: length as usize,
            });
        }
        Ok(ProposalHeader {
            next_payload: data[0],
            length,
            proposal_number: data[4],
            protocol_id: data[5],
            spi_size: data[6],
            num_transforms: data[7],
        })
    }

    /// Append to a buffer; returns the offset of the length field
    pub fn encode(&self, buf: &mut BytesMut) -> usize {
        buf.put_u8(self.next_payload);
        buf.put_u8(0);
        let len_at = buf.len();
        buf.put_u16(self.length);
        buf.put_u8(self.proposal_number);
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.spi_size);
        buf.put_u8(self.num_transforms);
        len_at
    }
}

/// Transform payload header
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |   RESERVED    |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Transform #  |  Transform-Id |           RESERVED2           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformHeader {
    /// Next payload (T or NONE)
    pub next_payload: u8,
    /// Length including attributes
    pub length: u16,
    /// Transform number
    pub transform_number: u8,
    /// Transform id
    pub transform_id: u8,
}

impl TransformHeader {
    /// Size of the fixed part
    pub const SIZE: usize = 8;

    /// Parse a transform header
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        need(data, Self::SIZE)?;
        let length = be16(data, 2);
        if (length as usize) < Self::SIZE || length as usize > data.len() {
            return Err(Error::InvalidLength {
                expected: Self::SIZE,
                actual: length as usize,
            });
        }
        Ok(TransformHeader {
            next_payload: data[0],
            length,
            transform_number: data[4],
            transform_id: data[5],
        })
    }

    /// Append to a buffer; returns the offset of the length field
    pub fn encode(&self, buf: &mut BytesMut) -> usize {
        buf.put_u8(self.next_payload);
        buf.put_u8(0);
        let len_at = buf.len();
        buf.put_u16(self.length);
        buf.put_u8(self.transform_number);
        buf.put_u8(self.transform_id);
        buf.put_u16(0);
        len_at
    }
}

/// Value of a data attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// Short (TV) form
    Basic(u16),
    /// Long (TLV) form
    Variable(Vec<u8>),
}

/// A transform data attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute type without the AF bit
    pub attr_type: u16,
    /// Attribute value
    pub value: AttrValue,
}

impl Attribute {
    /// Parse one attribute; returns it with the number of bytes consumed
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        need(data, 4)?;
        let raw_type = be16(data, 0);
        let attr_type = raw_type & ISAKMP_ATTR_RTYPE_MASK;
        if raw_type & ISAKMP_ATTR_AF_TV != 0 {
            return Ok((
                Attribute {
                    attr_type,
                    value: AttrValue::Basic(be16(data, 2)),
                },
                4,
            ));
        }
        let len = be16(data, 2) as usize;
        need(data, 4 + len)?;
        Ok((
            Attribute {
                attr_type,
                value: AttrValue::Variable(data[4..4 + len].to_vec()),
            },
            4 + len,
        ))
    }

    /// Parse a whole attribute list
    pub fn parse_all(mut data: &[u8]) -> Result<Vec<Self>> {
        let mut attrs = Vec::new();
        while !data.is_empty() {
            let (attr, used) = Attribute::parse(data)?;
            attrs.push(attr);
            data = &data[used..];
        }
        Ok(attrs)
    }

    /// True for the short form
    pub fn is_basic(&self) -> bool {
        matches!(self.value, AttrValue::Basic(_))
    }

    /// Short-form value, or None for a variable attribute
    pub fn basic(&self) -> Option<u16> {
        match self.value {
            AttrValue::Basic(v) => Some(v),
            AttrValue::Variable(_) => None,
        }
    }
}

/// Append an attribute, choosing the short form when the value fits 16 bits
///
/// Long values are written as a four octet big-endian number.
pub fn encode_attribute(buf: &mut BytesMut, attr_type: u16, value: u32) {
    if value >> 16 == 0 {
        buf.put_u16(ISAKMP_ATTR_AF_TV | attr_type);
        buf.put_u16(value as u16);
    } else {
        buf.put_u16(attr_type & ISAKMP_ATTR_RTYPE_MASK);
        buf.put_u16(4);
        buf.put_u32(value);
    }
}

/// Decode a variable-length unsigned duration
///
/// Leading zero octets are skipped; anything still wider than 32 bits
/// saturates at `u32::MAX`.
pub fn decode_long_duration(value: &[u8]) -> u32 {
    let first = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    let significant = &value[first..];
    if significant.len() > 4 {
        return u32::MAX;
    }
    significant
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

/// Identification payload body (phase 1 and IPsec DOI forms share a layout)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    /// Identification type
    pub id_type: u8,
    /// IP protocol id (0 = any)
    pub protocol_id: u8,
    /// Port (0 = any)
    pub port: u16,
    /// Identification data
    pub data: Vec<u8>,
}

impl IdPayload {
    /// Parse an ID body
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        need(data, 4)?;
        Ok(IdPayload {
            id_type: data[0],
            protocol_id: data[1],
            port: be16(data, 2),
            data: data[4..].to_vec(),
        })
    }

    /// Serialize the ID body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.data.len());
        buf.put_u8(self.id_type);
        buf.put_u8(self.protocol_id);
        buf.put_u16(self.port);
        buf.put_slice(&self.data);
        buf.to_vec()
    }
}

/// Notification payload body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
    /// Domain of Interpretation
    pub doi: u32,
    /// Protocol id
    pub protocol_id: u8,
    /// Notify message type
    pub notify_type: u16,
    /// SPI (may be empty)
    pub spi: Vec<u8>,
    /// Notification data
    pub data: Vec<u8>,
}

impl NotificationPayload {
    /// Parse a notification body
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        need(data, 8)?;
        let spi_size = data[5] as usize;
        need(data, 8 + spi_size)?;
        Ok(NotificationPayload {
            doi: be32(data, 0),
            protocol_id: data[4],
            notify_type: be16(data, 6),
            spi: data[8..8 + spi_size].to_vec(),
            data: data[8 + spi_size..].to_vec(),
        })
    }

    /// Serialize the notification body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8 + self.spi.len() + self.data.len());
        buf.put_u32(self.doi);
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.spi.len() as u8);
        buf.put_u16(self.notify_type);
        buf.put_slice(&self.spi);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Notification type as an enum
    pub fn notification(&self) -> Notification {
        Notification::from_u16(self.notify_type)
    }
}

/// Delete payload body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Domain of Interpretation
    pub doi: u32,
    /// Protocol id
    pub protocol_id: u8,
    /// SPI size of every entry
    pub spi_size: u8,
    /// SPIs to delete
    pub spis: Vec<Vec<u8>>,
}

impl DeletePayload {
    /// Parse a delete body
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        need(data, 8)?;
        let spi_size = data[5];
        let count = be16(data, 6) as usize;
        let size = spi_size as usize;
        need(data, 8 + size * count)?;
        let spis = (0..count)
            .map(|i| data[8 + i * size..8 + (i + 1) * size].to_vec())
            .collect();
        Ok(DeletePayload {
            doi: be32(data, 0),
            protocol_id: data[4],
            spi_size,
            spis,
        })
    }

    /// Serialize the delete body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(self.doi);
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.spi_size);
        buf.put_u16(self.spis.len() as u16);
        for spi in &self.spis {
            buf.put_slice(spi);
        }
        buf.to_vec()
    }
}

/// NAT original address payload body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatOaPayload {
    /// Original address
    pub address: IpAddr,
}

impl NatOaPayload {
    /// Parse a NAT-OA body
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        need(data, 4)?;
        let addr = &data[4..];
        let address = match (data[0], addr.len()) {
            (id_type::IPV4_ADDR, 4) => IpAddr::V4(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3])),
            (id_type::IPV6_ADDR, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(addr);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            (t, len) => {
                return Err(Error::InvalidPayload(format!(
                    "NAT-Traversal: invalid NAT-OA (type {}, {} octets)",
                    t, len
                )))
            }
        };
        Ok(NatOaPayload { address })
    }

    /// Serialize the NAT-OA body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(20);
        match self.address {
            IpAddr::V4(v4) => {
                buf.put_u8(id_type::IPV4_ADDR);
                buf.put_slice(&[0, 0, 0]);
                buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.put_u8(id_type::IPV6_ADDR);
                buf.put_slice(&[0, 0, 0]);
                buf.put_slice(&v6.octets());
            }
        }
        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_basic_and_variable() {
        let mut buf = BytesMut::new();
        encode_attribute(&mut buf, oakley::LIFE_DURATION, 3600);
        encode_attribute(&mut buf, oakley::LIFE_DURATION, 0x0001_0000);
        assert_eq!(&buf[..4], &[0x80, 0x0c, 0x0e, 0x10]);
        assert_eq!(&buf[4..], &[0x00, 0x0c, 0x00, 0x04, 0x00, 0x01, 0x00, 0x00]);

        let attrs = Attribute::parse_all(&buf).expect("Failed to parse attributes");
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].basic(), Some(3600));
        assert_eq!(
            attrs[1].value,
            AttrValue::Variable(vec![0x00, 0x01, 0x00, 0x00])
        );
    }

    #[test]
    fn test_attribute_truncated() {
        assert!(Attribute::parse(&[0x00, 0x0c, 0x00, 0x08, 0x01]).is_err());
        assert!(Attribute::parse(&[0x80]).is_err());
    }

    #[test]
    fn test_decode_long_duration() {
        assert_eq!(decode_long_duration(&[0x00, 0x00, 0x70, 0x80]), 28800);
        assert_eq!(decode_long_duration(&[0, 0, 0, 0, 0, 0, 0x01, 0x00]), 256);
        assert_eq!(decode_long_duration(&[1, 0, 0, 0, 0]), u32::MAX);
        assert_eq!(decode_long_duration(&[]), 0);
    }

    #[test]
    fn test_proposal_header_length_checked() {
        let data = [0u8, 0, 0, 40, 1, 1, 0, 1];
        assert!(ProposalHeader::from_bytes(&data).is_err());

        let data = [0u8, 0, 0, 8, 1, 1, 0, 1];
        let prop = ProposalHeader::from_bytes(&data).expect("Failed to parse proposal");
        assert_eq!(prop.proposal_number, 1);
        assert_eq!(prop.num_transforms, 1);
    }

    #[test]
    fn test_notification_payload() {
        let n = NotificationPayload {
            doi: ISAKMP_DOI_IPSEC,
            protocol_id: proto::ISAKMP,
            notify_type: Notification::RUThere.to_u16(),
            spi: vec![1; 16],
            data: vec![0, 0, 0, 7],
        };
        let parsed =
            NotificationPayload::from_bytes(&n.to_bytes()).expect("Failed to parse notification");
        assert_eq!(parsed, n);
        assert_eq!(parsed.notification(), Notification::RUThere);
    }

    #[test]
    fn test_delete_payload() {
        let d = DeletePayload {
            doi: ISAKMP_DOI_IPSEC,
            protocol_id: proto::IPSEC_ESP,
            spi_size: 4,
            spis: vec![vec![0, 0, 1, 0], vec![0, 0, 2, 0]],
        };
        let parsed = DeletePayload::from_bytes(&d.to_bytes()).expect("Failed to parse delete");
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_nat_oa_payload() {
        let oa = NatOaPayload {
            address: "192.168.1.10".parse().expect("valid address"),
        };
        let parsed = NatOaPayload::from_bytes(&oa.to_bytes()).expect("Failed to parse NAT-OA");
        assert_eq!(parsed, oa);
        assert!(NatOaPayload::from_bytes(&[1, 0, 0, 0, 1, 2]).is_err());
    }
}
