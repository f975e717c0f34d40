//! ISAKMP message header and payload chain builder
//!
//! Implements the message format of RFC 2408 Section 3.1.

use super::constants::*;
use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};

/// ISAKMP message header (28 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Initiator                            |
/// |                            Cookie                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Responder                            |
/// |                            Cookie                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Message ID                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Length                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Next payload and exchange type are kept raw: the dispatcher reports
/// unknown values itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsakmpHeader {
    /// Initiator cookie
    pub icookie: Cookie,

    /// Responder cookie (zero in the first message of a phase 1 exchange)
    pub rcookie: Cookie,

    /// Type of the first payload
    pub next_payload: u8,

    /// Major/minor version (0x10 for ISAKMP 1.0)
    pub version: u8,

    /// Exchange type
    pub exchange_type: u8,

    /// Message flags
    pub flags: IsakmpFlags,

    /// Message ID (zero in phase 1)
    pub message_id: u32,

    /// Total message length in bytes (including header)
    pub length: u32,
}

impl IsakmpHeader {
    /// Create a new ISAKMP header
    pub fn new(
        icookie: Cookie,
        rcookie: Cookie,
        exchange_type: ExchangeType,
        flags: IsakmpFlags,
        message_id: u32,
    ) -> Self {
        IsakmpHeader {
            icookie,
            rcookie,
            next_payload: PayloadType::None.to_u8(),
            version: ISAKMP_VERSION,
            exchange_type: exchange_type.to_u8(),
            flags,
            message_id,
            length: ISAKMP_HEADER_SIZE as u32,
        }
    }

    /// Parse an ISAKMP header from bytes
    ///
    /// # Errors
    ///
    /// Returns `BufferTooShort` when fewer than 28 bytes are available.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ISAKMP_HEADER_SIZE {
            return Err(Error::BufferTooShort {
                required: ISAKMP_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut icookie = ZERO_COOKIE;
        let mut rcookie = ZERO_COOKIE;
        icookie.copy_from_slice(&data[0..8]);
        rcookie.copy_from_slice(&data[8..16]);

        Ok(IsakmpHeader {
            icookie,
            rcookie,
            next_payload: data[16],
            version: data[17],
            exchange_type: data[18],
            flags: IsakmpFlags::new(data[19]),
            message_id: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
            length: u32::from_be_bytes([data[24], data[25], data[26], data[27]]),
        })
    }

    /// Serialize the header
    pub fn to_bytes(&self) -> [u8; ISAKMP_HEADER_SIZE] {
        let mut bytes = [0u8; ISAKMP_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.icookie);
        bytes[8..16].copy_from_slice(&self.rcookie);
        bytes[16] = self.next_payload;
        bytes[17] = self.version;
        bytes[18] = self.exchange_type;
        bytes[19] = self.flags.value();
        bytes[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Major version nibble
    pub fn major_version(&self) -> u8 {
        self.version >> 4
    }

    /// Minor version nibble
    pub fn minor_version(&self) -> u8 {
        self.version & 0x0F
    }
}

/// Builds an outgoing ISAKMP message payload by payload.
///
/// Each added payload patches the previous payload's next-payload field
/// (the header's for the first one); `finish` patches the total length.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: BytesMut,
    np_offset: usize,
}

impl MessageBuilder {
    /// Start a message with the given header
    pub fn new(header: &IsakmpHeader) -> Self {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_slice(&header.to_bytes());
        MessageBuilder {
            buf,
            np_offset: 16,
        }
    }

    /// Append a payload with its generic header; returns the offset of the body
    pub fn add_payload(&mut self, payload_type: PayloadType, body: &[u8]) -> usize {
        self.add_raw_payload(payload_type.to_u8(), body)
    }

    /// Append a payload using a raw type code (NAT-T draft numbering)
    pub fn add_raw_payload(&mut self, payload_type: u8, body: &[u8]) -> usize {
        self.buf[self.np_offset] = payload_type;
        self.np_offset = self.buf.len();
        self.buf.put_u8(PayloadType::None.to_u8());
        self.buf.put_u8(0);
        self.buf.put_u16((GENERIC_HEADER_SIZE + body.len()) as u16);
        let body_offset = self.buf.len();
        self.buf.put_slice(body);
        body_offset
    }

    /// Current length of the message
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if only the header has been written
    pub fn is_empty(&self) -> bool {
        self.buf.len() == ISAKMP_HEADER_SIZE
    }

    /// Bytes written so far
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Overwrite bytes at `offset` (used to fill in HASH payloads)
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset + data.len();
        if end > self.buf.len() {
            return Err(Error::BufferTooShort {
                required: end,
                available: self.buf.len(),
            });
        }
        self.buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Patch the length field and return the message
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[24..28].copy_from_slice(&len.to_be_bytes());
        self.buf.to_vec()
    }
}

/// Patch the length field of a complete message in place
pub fn patch_length(message: &mut [u8]) {
    if message.len() >= ISAKMP_HEADER_SIZE {
        let len = message.len() as u32;
        message[24..28].copy_from_slice(&len.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> IsakmpHeader {
        IsakmpHeader::new(
            [1, 2, 3, 4, 5, 6, 7, 8],
            ZERO_COOKIE,
            ExchangeType::IdProt,
            IsakmpFlags::default(),
            0,
        )
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        let parsed = IsakmpHeader::from_bytes(&bytes).expect("Failed to parse header");
        assert_eq!(parsed, header);
        assert_eq!(parsed.major_version(), 1);
        assert_eq!(parsed.minor_version(), 0);
    }

    #[test]
    fn test_header_too_short() {
        let result = IsakmpHeader::from_bytes(&[0u8; 20]);
        assert!(matches!(
            result,
            Err(Error::BufferTooShort {
                required: 28,
                available: 20
            })
        ));
    }

    #[test]
    fn test_builder_chains_next_payload() {
        let mut builder = MessageBuilder::new(&sample_header());
        builder.add_payload(PayloadType::SA, &[0xAA; 8]);
        builder.add_payload(PayloadType::VID, &[0xBB; 4]);
        let msg = builder.finish();

        assert_eq!(msg.len(), 28 + 12 + 8);
        assert_eq!(msg[16], PayloadType::SA.to_u8());
        // SA generic header points at the VID
        assert_eq!(msg[28], PayloadType::VID.to_u8());
        assert_eq!(u16::from_be_bytes([msg[30], msg[31]]), 12);
        // VID is last
        assert_eq!(msg[40], PayloadType::None.to_u8());

        let hdr = IsakmpHeader::from_bytes(&msg).expect("Failed to parse header");
        assert_eq!(hdr.length as usize, msg.len());
    }

    #[test]
    fn test_write_at_bounds() {
        let mut builder = MessageBuilder::new(&sample_header());
        let off = builder.add_payload(PayloadType::HASH, &[0u8; 16]);
        assert!(builder.write_at(off, &[9u8; 16]).is_ok());
        assert!(builder.write_at(off + 1, &[9u8; 16]).is_err());
        assert_eq!(builder.bytes()[off], 9);
    }
}
