//! ISAKMP / IKEv1 protocol constants (RFC 2407, RFC 2408, RFC 2409, RFC 3947)

use std::fmt;

/// ISAKMP version 1.0 (major version = 1, minor version = 0)
pub const ISAKMP_VERSION: u8 = 0x10;

/// ISAKMP header size (28 bytes)
pub const ISAKMP_HEADER_SIZE: usize = 28;

/// Generic payload header size (4 bytes)
pub const GENERIC_HEADER_SIZE: usize = 4;

/// Cookie size
pub const COOKIE_SIZE: usize = 8;

/// An ISAKMP cookie (SPI of the ISAKMP SA)
pub type Cookie = [u8; COOKIE_SIZE];

/// All-zero cookie (responder cookie of a first message)
pub const ZERO_COOKIE: Cookie = [0u8; COOKIE_SIZE];

/// IPsec Domain of Interpretation (RFC 2407)
pub const ISAKMP_DOI_IPSEC: u32 = 1;

/// SIT_IDENTITY_ONLY situation
pub const SIT_IDENTITY_ONLY: u32 = 1;

/// Attribute Format bit: set for the short (TV) form
pub const ISAKMP_ATTR_AF_TV: u16 = 0x8000;

/// Attribute type mask
pub const ISAKMP_ATTR_RTYPE_MASK: u16 = 0x7FFF;

/// Largest SPI we are prepared to skip in an ISAKMP proposal
pub const MAX_ISAKMP_SPI_SIZE: usize = 16;

/// SPI size for AH/ESP
pub const IPSEC_DOI_SPI_SIZE: usize = 4;

/// CPI size for IPCOMP
pub const IPCOMP_CPI_SIZE: usize = 2;

/// Lowest SPI not reserved by IANA
pub const IPSEC_DOI_SPI_MIN: u32 = 0x100;

/// Lowest CPI available for private use
pub const IPCOMP_FIRST_NEGOTIATED: u32 = 256;

/// Highest CPI available for negotiation
pub const IPCOMP_LAST_NEGOTIATED: u32 = 61439;

/// Exchange Types (RFC 2408 Section 3.1, RFC 2409 Section 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// No exchange (0)
    None = 0,
    /// Base exchange (1)
    Base = 1,
    /// Identity Protection, i.e. Main Mode (2)
    IdProt = 2,
    /// Authentication Only (3)
    AuthOnly = 3,
    /// Aggressive Mode (4)
    Aggressive = 4,
    /// Informational (5)
    Informational = 5,
    /// Quick Mode (32)
    Quick = 32,
    /// New Group Mode (33)
    NewGroup = 33,
}

impl ExchangeType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ExchangeType::None),
            1 => Some(ExchangeType::Base),
            2 => Some(ExchangeType::IdProt),
            3 => Some(ExchangeType::AuthOnly),
            4 => Some(ExchangeType::Aggressive),
            5 => Some(ExchangeType::Informational),
            32 => Some(ExchangeType::Quick),
            33 => Some(ExchangeType::NewGroup),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Log name
    pub fn name(self) -> &'static str {
        match self {
            ExchangeType::None => "ISAKMP_XCHG_NONE",
            ExchangeType::Base => "ISAKMP_XCHG_BASE",
            ExchangeType::IdProt => "ISAKMP_XCHG_IDPROT",
            ExchangeType::AuthOnly => "ISAKMP_XCHG_AO",
            ExchangeType::Aggressive => "ISAKMP_XCHG_AGGR",
            ExchangeType::Informational => "ISAKMP_XCHG_INFO",
            ExchangeType::Quick => "ISAKMP_XCHG_QUICK",
            ExchangeType::NewGroup => "ISAKMP_XCHG_NGRP",
        }
    }
}

/// ISAKMP header flags (RFC 2408 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsakmpFlags(u8);

impl IsakmpFlags {
    /// Encryption bit
    pub const ENCRYPTION: u8 = 0x01;
    /// Commit bit
    pub const COMMIT: u8 = 0x02;
    /// Authentication Only bit
    pub const AUTH_ONLY: u8 = 0x04;

    /// Create new flags
    pub fn new(value: u8) -> Self {
        IsakmpFlags(value)
    }

    /// Flags with only the encryption bit set
    pub fn encrypted() -> Self {
        IsakmpFlags(Self::ENCRYPTION)
    }

    /// Check the encryption bit
    pub fn is_encrypted(self) -> bool {
        (self.0 & Self::ENCRYPTION) != 0
    }

    /// Check the commit bit
    pub fn is_commit(self) -> bool {
        (self.0 & Self::COMMIT) != 0
    }

    /// Get raw value
    pub fn value(self) -> u8 {
        self.0
    }
}

/// Payload Types (RFC 2408 Section 3.1, RFC 3947, NAT-T drafts)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// No next payload (0)
    None = 0,
    /// Security Association (1)
    SA = 1,
    /// Proposal (2)
    P = 2,
    /// Transform (3)
    T = 3,
    /// Key Exchange (4)
    KE = 4,
    /// Identification (5)
    ID = 5,
    /// Certificate (6)
    CERT = 6,
    /// Certificate Request (7)
    CR = 7,
    /// Hash (8)
    HASH = 8,
    /// Signature (9)
    SIG = 9,
    /// Nonce (10)
    NONCE = 10,
    /// Notification (11)
    N = 11,
    /// Delete (12)
    D = 12,
    /// Vendor ID (13)
    VID = 13,
    /// NAT-D as numbered by the early NAT-T drafts (15)
    NatDBadDrafts = 15,
    /// NAT-OA as numbered by the early NAT-T drafts (16)
    NatOaBadDrafts = 16,
    /// NAT-D (20, RFC 3947)
    NatDRfc = 20,
    /// NAT-OA (21, RFC 3947)
    NatOaRfc = 21,
    /// NAT-D from the private-use range used by later drafts (130)
    NatDDrafts = 130,
    /// NAT-OA from the private-use range used by later drafts (131)
    NatOaDrafts = 131,
}

impl PayloadType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadType::None),
            1 => Some(PayloadType::SA),
            2 => Some(PayloadType::P),
            3 => Some(PayloadType::T),
            4 => Some(PayloadType::KE),
            5 => Some(PayloadType::ID),
            6 => Some(PayloadType::CERT),
            7 => Some(PayloadType::CR),
            8 => Some(PayloadType::HASH),
            9 => Some(PayloadType::SIG),
            10 => Some(PayloadType::NONCE),
            11 => Some(PayloadType::N),
            12 => Some(PayloadType::D),
            13 => Some(PayloadType::VID),
            15 => Some(PayloadType::NatDBadDrafts),
            16 => Some(PayloadType::NatOaBadDrafts),
            20 => Some(PayloadType::NatDRfc),
            21 => Some(PayloadType::NatOaRfc),
            130 => Some(PayloadType::NatDDrafts),
            131 => Some(PayloadType::NatOaDrafts),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Log name
    pub fn name(self) -> &'static str {
        match self {
            PayloadType::None => "ISAKMP_NEXT_NONE",
            PayloadType::SA => "ISAKMP_NEXT_SA",
            PayloadType::P => "ISAKMP_NEXT_P",
            PayloadType::T => "ISAKMP_NEXT_T",
            PayloadType::KE => "ISAKMP_NEXT_KE",
            PayloadType::ID => "ISAKMP_NEXT_ID",
            PayloadType::CERT => "ISAKMP_NEXT_CERT",
            PayloadType::CR => "ISAKMP_NEXT_CR",
            PayloadType::HASH => "ISAKMP_NEXT_HASH",
            PayloadType::SIG => "ISAKMP_NEXT_SIG",
            PayloadType::NONCE => "ISAKMP_NEXT_NONCE",
            PayloadType::N => "ISAKMP_NEXT_N",
            PayloadType::D => "ISAKMP_NEXT_D",
            PayloadType::VID => "ISAKMP_NEXT_VID",
            PayloadType::NatDBadDrafts => "ISAKMP_NEXT_NATD_BADDRAFTS",
            PayloadType::NatOaBadDrafts => "ISAKMP_NEXT_NATOA_BADDRAFTS",
            PayloadType::NatDRfc => "ISAKMP_NEXT_NATD_RFC",
            PayloadType::NatOaRfc => "ISAKMP_NEXT_NATOA_RFC",
            PayloadType::NatDDrafts => "ISAKMP_NEXT_NATD_DRAFTS",
            PayloadType::NatOaDrafts => "ISAKMP_NEXT_NATOA_DRAFTS",
        }
    }

    /// Bit used for this payload type in a [`PayloadSet`]
    ///
    /// Draft NAT-T codes share the bits of the RFC codes they stand for.
    pub const fn bit(self) -> u32 {
        match self {
            PayloadType::NatDBadDrafts | PayloadType::NatDDrafts => 1 << (PayloadType::NatDRfc as u32),
            PayloadType::NatOaBadDrafts | PayloadType::NatOaDrafts => {
                1 << (PayloadType::NatOaRfc as u32)
            }
            other => 1 << (other as u32),
        }
    }
}

/// A set of payload types, used by the microcode tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadSet(u32);

impl PayloadSet {
    /// The empty set
    pub const EMPTY: PayloadSet = PayloadSet(0);

    /// Set containing one payload type
    pub const fn of(pt: PayloadType) -> Self {
        PayloadSet(pt.bit())
    }

    /// Set union, usable in const context
    pub const fn with(self, pt: PayloadType) -> Self {
        PayloadSet(self.0 | pt.bit())
    }

    /// Set union
    pub const fn union(self, other: PayloadSet) -> Self {
        PayloadSet(self.0 | other.0)
    }

    /// Membership test
    pub const fn contains(self, pt: PayloadType) -> bool {
        self.0 & pt.bit() != 0
    }

    /// Elements of `self` missing from `other`
    pub const fn minus(self, other: PayloadSet) -> Self {
        PayloadSet(self.0 & !other.0)
    }

    /// Is the set empty
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bitmap
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PayloadSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for code in 0u8..=21 {
            if let Some(pt) = PayloadType::from_u8(code) {
                if self.0 & (1 << code) != 0 && pt.bit() == 1 << code {
                    if !first {
                        write!(f, "+")?;
                    }
                    write!(f, "{}", pt.name())?;
                    first = false;
                }
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// Protocol identifiers (RFC 2407 Section 4.4.1)
pub mod proto {
    /// PROTO_ISAKMP
    pub const ISAKMP: u8 = 1;
    /// PROTO_IPSEC_AH
    pub const IPSEC_AH: u8 = 2;
    /// PROTO_IPSEC_ESP
    pub const IPSEC_ESP: u8 = 3;
    /// PROTO_IPCOMP
    pub const IPCOMP: u8 = 4;

    /// Log name
    pub fn name(id: u8) -> &'static str {
        match id {
            ISAKMP => "PROTO_ISAKMP",
            IPSEC_AH => "PROTO_IPSEC_AH",
            IPSEC_ESP => "PROTO_IPSEC_ESP",
            IPCOMP => "PROTO_IPCOMP",
            _ => "PROTO_UNKNOWN",
        }
    }
}

/// Transform identifiers (RFC 2407 Section 4.4.2 - 4.4.5)
pub mod transform {
    /// KEY_IKE (ISAKMP)
    pub const KEY_IKE: u8 = 1;

    /// AH_MD5
    pub const AH_MD5: u8 = 2;
    /// AH_SHA
    pub const AH_SHA: u8 = 3;
    /// AH_DES
    pub const AH_DES: u8 = 4;

    /// ESP_DES
    pub const ESP_DES: u8 = 2;
    /// ESP_3DES
    pub const ESP_3DES: u8 = 3;
    /// ESP_NULL
    pub const ESP_NULL: u8 = 11;
    /// ESP_AES
    pub const ESP_AES: u8 = 12;

    /// IPCOMP_OUI
    pub const IPCOMP_OUI: u8 = 1;
    /// IPCOMP_DEFLATE
    pub const IPCOMP_DEFLATE: u8 = 2;
    /// IPCOMP_LZS
    pub const IPCOMP_LZS: u8 = 3;

    /// Log name of an ESP transform id
    pub fn esp_name(id: u8) -> &'static str {
        match id {
            ESP_DES => "ESP_DES",
            ESP_3DES => "ESP_3DES",
            ESP_NULL => "ESP_NULL",
            ESP_AES => "ESP_AES",
            _ => "ESP_UNKNOWN",
        }
    }

    /// Log name of an AH transform id
    pub fn ah_name(id: u8) -> &'static str {
        match id {
            AH_MD5 => "AH_MD5",
            AH_SHA => "AH_SHA",
            AH_DES => "AH_DES",
            _ => "AH_UNKNOWN",
        }
    }
}

/// Oakley (phase 1) attribute types and values (RFC 2409 Appendix A)
pub mod oakley {
    /// OAKLEY_ENCRYPTION_ALGORITHM
    pub const ENCRYPTION_ALGORITHM: u16 = 1;
    /// OAKLEY_HASH_ALGORITHM
    pub const HASH_ALGORITHM: u16 = 2;
    /// OAKLEY_AUTHENTICATION_METHOD
    pub const AUTHENTICATION_METHOD: u16 = 3;
    /// OAKLEY_GROUP_DESCRIPTION
    pub const GROUP_DESCRIPTION: u16 = 4;
    /// OAKLEY_LIFE_TYPE
    pub const LIFE_TYPE: u16 = 11;
    /// OAKLEY_LIFE_DURATION
    pub const LIFE_DURATION: u16 = 12;
    /// OAKLEY_KEY_LENGTH
    pub const KEY_LENGTH: u16 = 14;

    /// OAKLEY_DES_CBC
    pub const DES_CBC: u16 = 1;
    /// OAKLEY_3DES_CBC
    pub const TRIPLE_DES_CBC: u16 = 5;
    /// OAKLEY_AES_CBC
    pub const AES_CBC: u16 = 7;

    /// OAKLEY_MD5
    pub const MD5: u16 = 1;
    /// OAKLEY_SHA
    pub const SHA1: u16 = 2;
    /// OAKLEY_SHA2_256
    pub const SHA2_256: u16 = 4;

    /// OAKLEY_PRESHARED_KEY
    pub const PRESHARED_KEY: u16 = 1;
    /// OAKLEY_DSS_SIG
    pub const DSS_SIG: u16 = 2;
    /// OAKLEY_RSA_SIG
    pub const RSA_SIG: u16 = 3;
    /// OAKLEY_RSA_ENC
    pub const RSA_ENC: u16 = 4;
    /// OAKLEY_RSA_ENC_REV
    pub const RSA_ENC_REV: u16 = 5;

    /// OAKLEY_GROUP_MODP768
    pub const GROUP_MODP768: u16 = 1;
    /// OAKLEY_GROUP_MODP1024
    pub const GROUP_MODP1024: u16 = 2;
    /// OAKLEY_GROUP_MODP1536
    pub const GROUP_MODP1536: u16 = 5;

    /// OAKLEY_LIFE_SECONDS
    pub const LIFE_SECONDS: u16 = 1;
    /// OAKLEY_LIFE_KILOBYTES
    pub const LIFE_KILOBYTES: u16 = 2;

    /// Log name of an Oakley attribute type
    pub fn attr_name(attr: u16) -> &'static str {
        match attr {
            ENCRYPTION_ALGORITHM => "OAKLEY_ENCRYPTION_ALGORITHM",
            HASH_ALGORITHM => "OAKLEY_HASH_ALGORITHM",
            AUTHENTICATION_METHOD => "OAKLEY_AUTHENTICATION_METHOD",
            GROUP_DESCRIPTION => "OAKLEY_GROUP_DESCRIPTION",
            LIFE_TYPE => "OAKLEY_LIFE_TYPE",
            LIFE_DURATION => "OAKLEY_LIFE_DURATION",
            KEY_LENGTH => "OAKLEY_KEY_LENGTH",
            _ => "OAKLEY_UNKNOWN_ATTRIBUTE",
        }
    }
}

/// IPsec DOI (phase 2) attribute types and values (RFC 2407 Section 4.5)
pub mod ipsec_attr {
    /// SA_LIFE_TYPE
    pub const SA_LIFE_TYPE: u16 = 1;
    /// SA_LIFE_DURATION
    pub const SA_LIFE_DURATION: u16 = 2;
    /// GROUP_DESCRIPTION
    pub const GROUP_DESCRIPTION: u16 = 3;
    /// ENCAPSULATION_MODE
    pub const ENCAPSULATION_MODE: u16 = 4;
    /// AUTH_ALGORITHM
    pub const AUTH_ALGORITHM: u16 = 5;
    /// KEY_LENGTH
    pub const KEY_LENGTH: u16 = 6;
    /// KEY_ROUNDS
    pub const KEY_ROUNDS: u16 = 7;

    /// SA_LIFE_TYPE_SECONDS
    pub const SA_LIFE_TYPE_SECONDS: u16 = 1;
    /// SA_LIFE_TYPE_KBYTES
    pub const SA_LIFE_TYPE_KBYTES: u16 = 2;

    /// ENCAPSULATION_MODE_TUNNEL
    pub const ENCAPSULATION_MODE_TUNNEL: u16 = 1;
    /// ENCAPSULATION_MODE_TRANSPORT
    pub const ENCAPSULATION_MODE_TRANSPORT: u16 = 2;
    /// ENCAPSULATION_MODE_UDP_TUNNEL_RFC
    pub const ENCAPSULATION_MODE_UDP_TUNNEL_RFC: u16 = 3;
    /// ENCAPSULATION_MODE_UDP_TRANSPORT_RFC
    pub const ENCAPSULATION_MODE_UDP_TRANSPORT_RFC: u16 = 4;
    /// ENCAPSULATION_MODE_UDP_TUNNEL_DRAFTS
    pub const ENCAPSULATION_MODE_UDP_TUNNEL_DRAFTS: u16 = 61443;
    /// ENCAPSULATION_MODE_UDP_TRANSPORT_DRAFTS
    pub const ENCAPSULATION_MODE_UDP_TRANSPORT_DRAFTS: u16 = 61444;

    /// AUTH_ALGORITHM_NONE (internal marker, never sent)
    pub const AUTH_ALGORITHM_NONE: u16 = 0;
    /// AUTH_ALGORITHM_HMAC_MD5
    pub const AUTH_ALGORITHM_HMAC_MD5: u16 = 1;
    /// AUTH_ALGORITHM_HMAC_SHA1
    pub const AUTH_ALGORITHM_HMAC_SHA1: u16 = 2;
    /// AUTH_ALGORITHM_DES_MAC
    pub const AUTH_ALGORITHM_DES_MAC: u16 = 3;
    /// AUTH_ALGORITHM_KPDK
    pub const AUTH_ALGORITHM_KPDK: u16 = 4;

    /// Log name of an IPsec attribute type
    pub fn attr_name(attr: u16) -> &'static str {
        match attr {
            SA_LIFE_TYPE => "SA_LIFE_TYPE",
            SA_LIFE_DURATION => "SA_LIFE_DURATION",
            GROUP_DESCRIPTION => "GROUP_DESCRIPTION",
            ENCAPSULATION_MODE => "ENCAPSULATION_MODE",
            AUTH_ALGORITHM => "AUTH_ALGORITHM",
            KEY_LENGTH => "KEY_LENGTH",
            KEY_ROUNDS => "KEY_ROUNDS",
            _ => "IPSEC_UNKNOWN_ATTRIBUTE",
        }
    }
}

/// Identification types (RFC 2407 Section 4.6.2.1)
pub mod id_type {
    /// ID_IPV4_ADDR
    pub const IPV4_ADDR: u8 = 1;
    /// ID_FQDN
    pub const FQDN: u8 = 2;
    /// ID_USER_FQDN
    pub const USER_FQDN: u8 = 3;
    /// ID_IPV4_ADDR_SUBNET
    pub const IPV4_ADDR_SUBNET: u8 = 4;
    /// ID_IPV6_ADDR
    pub const IPV6_ADDR: u8 = 5;
    /// ID_IPV6_ADDR_SUBNET
    pub const IPV6_ADDR_SUBNET: u8 = 6;
    /// ID_IPV4_ADDR_RANGE
    pub const IPV4_ADDR_RANGE: u8 = 7;
    /// ID_IPV6_ADDR_RANGE
    pub const IPV6_ADDR_RANGE: u8 = 8;
    /// ID_DER_ASN1_DN
    pub const DER_ASN1_DN: u8 = 9;
    /// ID_DER_ASN1_GN
    pub const DER_ASN1_GN: u8 = 10;
    /// ID_KEY_ID
    pub const KEY_ID: u8 = 11;
}

/// Notification message types (RFC 2408 Section 3.14.1, RFC 3706)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    /// INVALID_PAYLOAD_TYPE (1)
    InvalidPayloadType,
    /// DOI_NOT_SUPPORTED (2)
    DoiNotSupported,
    /// SITUATION_NOT_SUPPORTED (3)
    SituationNotSupported,
    /// INVALID_COOKIE (4)
    InvalidCookie,
    /// INVALID_MAJOR_VERSION (5)
    InvalidMajorVersion,
    /// INVALID_MINOR_VERSION (6)
    InvalidMinorVersion,
    /// INVALID_EXCHANGE_TYPE (7)
    InvalidExchangeType,
    /// INVALID_FLAGS (8)
    InvalidFlags,
    /// INVALID_MESSAGE_ID (9)
    InvalidMessageId,
    /// INVALID_PROTOCOL_ID (10)
    InvalidProtocolId,
    /// INVALID_SPI (11)
    InvalidSpi,
    /// INVALID_TRANSFORM_ID (12)
    InvalidTransformId,
    /// ATTRIBUTES_NOT_SUPPORTED (13)
    AttributesNotSupported,
    /// NO_PROPOSAL_CHOSEN (14)
    NoProposalChosen,
    /// BAD_PROPOSAL_SYNTAX (15)
    BadProposalSyntax,
    /// PAYLOAD_MALFORMED (16)
    PayloadMalformed,
    /// INVALID_KEY_INFORMATION (17)
    InvalidKeyInformation,
    /// INVALID_ID_INFORMATION (18)
    InvalidIdInformation,
    /// INVALID_CERT_ENCODING (19)
    InvalidCertEncoding,
    /// INVALID_CERTIFICATE (20)
    InvalidCertificate,
    /// CERT_TYPE_UNSUPPORTED (21)
    CertTypeUnsupported,
    /// INVALID_CERT_AUTHORITY (22)
    InvalidCertAuthority,
    /// INVALID_HASH_INFORMATION (23)
    InvalidHashInformation,
    /// AUTHENTICATION_FAILED (24)
    AuthenticationFailed,
    /// INVALID_SIGNATURE (25)
    InvalidSignature,
    /// ADDRESS_NOTIFICATION (26)
    AddressNotification,
    /// NOTIFY_SA_LIFETIME (27)
    NotifySaLifetime,
    /// CERTIFICATE_UNAVAILABLE (28)
    CertificateUnavailable,
    /// UNSUPPORTED_EXCHANGE_TYPE (29)
    UnsupportedExchangeType,
    /// UNEQUAL_PAYLOAD_LENGTHS (30)
    UnequalPayloadLengths,
    /// RESPONDER_LIFETIME (24576)
    ResponderLifetime,
    /// REPLAY_STATUS (24577)
    ReplayStatus,
    /// INITIAL_CONTACT (24578)
    InitialContact,
    /// R_U_THERE (36136, RFC 3706)
    RUThere,
    /// R_U_THERE_ACK (36137, RFC 3706)
    RUThereAck,
    /// Any other value
    Other(u16),
}

impl Notification {
    /// Convert from the wire value
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Notification::InvalidPayloadType,
            2 => Notification::DoiNotSupported,
            3 => Notification::SituationNotSupported,
            4 => Notification::InvalidCookie,
            5 => Notification::InvalidMajorVersion,
            6 => Notification::InvalidMinorVersion,
            7 => Notification::InvalidExchangeType,
            8 => Notification::InvalidFlags,
            9 => Notification::InvalidMessageId,
            10 => Notification::InvalidProtocolId,
            11 => Notification::InvalidSpi,
            12 => Notification::InvalidTransformId,
            13 => Notification::AttributesNotSupported,
            14 => Notification::NoProposalChosen,
            15 => Notification::BadProposalSyntax,
            16 => Notification::PayloadMalformed,
            17 => Notification::InvalidKeyInformation,
            18 => Notification::InvalidIdInformation,
            19 => Notification::InvalidCertEncoding,
            20 => Notification::InvalidCertificate,
            21 => Notification::CertTypeUnsupported,
            22 => Notification::InvalidCertAuthority,
            23 => Notification::InvalidHashInformation,
            24 => Notification::AuthenticationFailed,
            25 => Notification::InvalidSignature,
            26 => Notification::AddressNotification,
            27 => Notification::NotifySaLifetime,
            28 => Notification::CertificateUnavailable,
            29 => Notification::UnsupportedExchangeType,
            30 => Notification::UnequalPayloadLengths,
            24576 => Notification::ResponderLifetime,
            24577 => Notification::ReplayStatus,
            24578 => Notification::InitialContact,
            36136 => Notification::RUThere,
            36137 => Notification::RUThereAck,
            other => Notification::Other(other),
        }
    }

    /// Convert to the wire value
    pub fn to_u16(self) -> u16 {
        match self {
            Notification::InvalidPayloadType => 1,
            Notification::DoiNotSupported => 2,
            Notification::SituationNotSupported => 3,
            Notification::InvalidCookie => 4,
            Notification::InvalidMajorVersion => 5,
            Notification::InvalidMinorVersion => 6,
            Notification::InvalidExchangeType => 7,
            Notification::InvalidFlags => 8,
            Notification::InvalidMessageId => 9,
            Notification::InvalidProtocolId => 10,
            Notification::InvalidSpi => 11,
            Notification::InvalidTransformId => 12,
            Notification::AttributesNotSupported => 13,
            Notification::NoProposalChosen => 14,
            Notification::BadProposalSyntax => 15,
            Notification::PayloadMalformed => 16,
            Notification::InvalidKeyInformation => 17,
            Notification::InvalidIdInformation => 18,
            Notification::InvalidCertEncoding => 19,
            Notification::InvalidCertificate => 20,
            Notification::CertTypeUnsupported => 21,
            Notification::InvalidCertAuthority => 22,
            Notification::InvalidHashInformation => 23,
            Notification::AuthenticationFailed => 24,
            Notification::InvalidSignature => 25,
            Notification::AddressNotification => 26,
            Notification::NotifySaLifetime => 27,
            Notification::CertificateUnavailable => 28,
            Notification::UnsupportedExchangeType => 29,
            Notification::UnequalPayloadLengths => 30,
            Notification::ResponderLifetime => 24576,
            Notification::ReplayStatus => 24577,
            Notification::InitialContact => 24578,
            Notification::RUThere => 36136,
            Notification::RUThereAck => 36137,
            Notification::Other(v) => v,
        }
    }

    /// Error-range notification (1..=16383)
    pub fn is_error(self) -> bool {
        let v = self.to_u16();
        (1..16384).contains(&v)
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Notification::InvalidPayloadType => "INVALID_PAYLOAD_TYPE",
            Notification::DoiNotSupported => "DOI_NOT_SUPPORTED",
            Notification::SituationNotSupported => "SITUATION_NOT_SUPPORTED",
            Notification::InvalidCookie => "INVALID_COOKIE",
            Notification::InvalidMajorVersion => "INVALID_MAJOR_VERSION",
            Notification::InvalidMinorVersion => "INVALID_MINOR_VERSION",
            Notification::InvalidExchangeType => "INVALID_EXCHANGE_TYPE",
            Notification::InvalidFlags => "INVALID_FLAGS",
            Notification::InvalidMessageId => "INVALID_MESSAGE_ID",
            Notification::InvalidProtocolId => "INVALID_PROTOCOL_ID",
            Notification::InvalidSpi => "INVALID_SPI",
            Notification::InvalidTransformId => "INVALID_TRANSFORM_ID",
            Notification::AttributesNotSupported => "ATTRIBUTES_NOT_SUPPORTED",
            Notification::NoProposalChosen => "NO_PROPOSAL_CHOSEN",
            Notification::BadProposalSyntax => "BAD_PROPOSAL_SYNTAX",
            Notification::PayloadMalformed => "PAYLOAD_MALFORMED",
            Notification::InvalidKeyInformation => "INVALID_KEY_INFORMATION",
            Notification::InvalidIdInformation => "INVALID_ID_INFORMATION",
            Notification::InvalidCertEncoding => "INVALID_CERT_ENCODING",
            Notification::InvalidCertificate => "INVALID_CERTIFICATE",
            Notification::CertTypeUnsupported => "CERT_TYPE_UNSUPPORTED",
            Notification::InvalidCertAuthority => "INVALID_CERT_AUTHORITY",
            Notification::InvalidHashInformation => "INVALID_HASH_INFORMATION",
            Notification::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Notification::InvalidSignature => "INVALID_SIGNATURE",
            Notification::AddressNotification => "ADDRESS_NOTIFICATION",
            Notification::NotifySaLifetime => "NOTIFY_SA_LIFETIME",
            Notification::CertificateUnavailable => "CERTIFICATE_UNAVAILABLE",
            Notification::UnsupportedExchangeType => "UNSUPPORTED_EXCHANGE_TYPE",
            Notification::UnequalPayloadLengths => "UNEQUAL_PAYLOAD_LENGTHS",
            Notification::ResponderLifetime => "RESPONDER_LIFETIME",
            Notification::ReplayStatus => "REPLAY_STATUS",
            Notification::InitialContact => "INITIAL_CONTACT",
            Notification::RUThere => "R_U_THERE",
            Notification::RUThereAck => "R_U_THERE_ACK",
            Notification::Other(v) => return write!(f, "NOTIFICATION_{}", v),
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_type_conversion() {
        assert_eq!(ExchangeType::from_u8(2), Some(ExchangeType::IdProt));
        assert_eq!(ExchangeType::from_u8(32), Some(ExchangeType::Quick));
        assert_eq!(ExchangeType::from_u8(34), None);
        assert_eq!(ExchangeType::Aggressive.to_u8(), 4);
    }

    #[test]
    fn test_payload_set_draft_aliases() {
        let set = PayloadSet::of(PayloadType::NatDRfc);
        assert!(set.contains(PayloadType::NatDDrafts));
        assert!(set.contains(PayloadType::NatDBadDrafts));
        assert!(!set.contains(PayloadType::NatOaRfc));
    }

    #[test]
    fn test_payload_set_operations() {
        let req = PayloadSet::of(PayloadType::SA).with(PayloadType::KE);
        let seen = PayloadSet::of(PayloadType::SA);
        assert_eq!(req.minus(seen), PayloadSet::of(PayloadType::KE));
        assert!(req.minus(req).is_empty());
        assert_eq!(
            req.to_string(),
            "ISAKMP_NEXT_SA+ISAKMP_NEXT_KE"
        );
    }

    #[test]
    fn test_notification_roundtrip_values() {
        assert_eq!(Notification::from_u16(14), Notification::NoProposalChosen);
        assert_eq!(Notification::RUThere.to_u16(), 36136);
        assert_eq!(Notification::from_u16(999), Notification::Other(999));
        assert!(Notification::PayloadMalformed.is_error());
        assert!(!Notification::InitialContact.is_error());
    }

    #[test]
    fn test_flags() {
        let flags = IsakmpFlags::new(0x03);
        assert!(flags.is_encrypted());
        assert!(flags.is_commit());
        assert!(!IsakmpFlags::default().is_encrypted());
    }
}
