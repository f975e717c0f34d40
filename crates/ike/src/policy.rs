//! Connection policy bits and permitted algorithm sets
//!
//! A connection's negotiation policy is a compact bitset; the proposal
//! database expands it into full SA payloads. The algorithm sets can be
//! rendered to (and parsed from) the `enc-auth-group,...!` strings the
//! control plane exchanges.

use crate::error::{Error, Result};
use crate::isakmp::{ipsec_attr, oakley, transform};
use std::fmt;
use std::str::FromStr;

/// Negotiation policy of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Policy(u32);

impl Policy {
    /// Pre-shared key authentication
    pub const PSK: u32 = 1 << 0;
    /// RSA signature authentication
    pub const RSASIG: u32 = 1 << 1;
    /// ESP encryption
    pub const ENCRYPT: u32 = 1 << 2;
    /// AH authentication
    pub const AUTHENTICATE: u32 = 1 << 3;
    /// IPCOMP compression
    pub const COMPRESS: u32 = 1 << 4;
    /// Tunnel mode
    pub const TUNNEL: u32 = 1 << 5;
    /// Perfect Forward Secrecy in Quick Mode
    pub const PFS: u32 = 1 << 6;
    /// Let SAs expire instead of rekeying
    pub const DONT_REKEY: u32 = 1 << 7;
    /// Use Aggressive Mode for phase 1
    pub const AGGRESSIVE: u32 = 1 << 8;
    /// Opportunistic template
    pub const OPPO: u32 = 1 << 9;
    /// Bring the connection up when the daemon starts listening
    pub const UP: u32 = 1 << 10;

    /// Mask of the phase 1 authentication methods
    pub const ISAKMP_MASK: u32 = Self::PSK | Self::RSASIG;
    /// Mask of the IPsec protocols
    pub const IPSEC_MASK: u32 = Self::ENCRYPT | Self::AUTHENTICATE | Self::COMPRESS;

    /// Create from raw bits
    pub const fn new(bits: u32) -> Self {
        Policy(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when every bit of `mask` is set
    pub const fn contains(self, mask: u32) -> bool {
        self.0 & mask == mask
    }

    /// True when any bit of `mask` is set
    pub const fn intersects(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    /// Set bits
    pub const fn with(self, mask: u32) -> Self {
        Policy(self.0 | mask)
    }

    /// Clear bits
    pub const fn without(self, mask: u32) -> Self {
        Policy(self.0 & !mask)
    }

    /// A connection that never negotiates (no phase 1 authentication allowed)
    pub const fn never_negotiate(self) -> bool {
        self.0 & Self::ISAKMP_MASK == 0
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u32, &str); 11] = [
            (Policy::PSK, "PSK"),
            (Policy::RSASIG, "RSASIG"),
            (Policy::ENCRYPT, "ENCRYPT"),
            (Policy::AUTHENTICATE, "AUTHENTICATE"),
            (Policy::COMPRESS, "COMPRESS"),
            (Policy::TUNNEL, "TUNNEL"),
            (Policy::PFS, "PFS"),
            (Policy::DONT_REKEY, "DONT_REKEY"),
            (Policy::AGGRESSIVE, "AGGRESSIVE"),
            (Policy::OPPO, "OPPORTUNISTIC"),
            (Policy::UP, "UP"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("+"))
        }
    }
}

/// Phase 1 algorithms a connection permits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MainAlgorithms(u32);

const IKE_ENCS: [(u32, &str, u16, u16); 5] = [
    (MainAlgorithms::ENC_DES, "des", oakley::DES_CBC, 0),
    (MainAlgorithms::ENC_3DES, "3des", oakley::TRIPLE_DES_CBC, 0),
    (MainAlgorithms::ENC_AES128, "aes128", oakley::AES_CBC, 128),
    (MainAlgorithms::ENC_AES192, "aes192", oakley::AES_CBC, 192),
    (MainAlgorithms::ENC_AES256, "aes256", oakley::AES_CBC, 256),
];

const IKE_HASHES: [(u32, &str, u16); 2] = [
    (MainAlgorithms::HASH_MD5, "md5", oakley::MD5),
    (MainAlgorithms::HASH_SHA1, "sha", oakley::SHA1),
];

const GROUPS: [(u32, &str, u16); 3] = [
    (MainAlgorithms::GROUP_MODP768, "modp768", oakley::GROUP_MODP768),
    (MainAlgorithms::GROUP_MODP1024, "modp1024", oakley::GROUP_MODP1024),
    (MainAlgorithms::GROUP_MODP1536, "modp1536", oakley::GROUP_MODP1536),
];

impl MainAlgorithms {
    /// DES-CBC
    pub const ENC_DES: u32 = 1 << 0;
    /// 3DES-CBC
    pub const ENC_3DES: u32 = 1 << 1;
    /// AES-CBC, 128 bit key
    pub const ENC_AES128: u32 = 1 << 2;
    /// AES-CBC, 192 bit key
    pub const ENC_AES192: u32 = 1 << 3;
    /// AES-CBC, 256 bit key
    pub const ENC_AES256: u32 = 1 << 4;
    /// MD5
    pub const HASH_MD5: u32 = 1 << 8;
    /// SHA-1
    pub const HASH_SHA1: u32 = 1 << 9;
    /// MODP 768 (group 1)
    pub const GROUP_MODP768: u32 = 1 << 16;
    /// MODP 1024 (group 2)
    pub const GROUP_MODP1024: u32 = 1 << 17;
    /// MODP 1536 (group 5)
    pub const GROUP_MODP1536: u32 = 1 << 18;

    /// Create from raw bits
    pub const fn new(bits: u32) -> Self {
        MainAlgorithms(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Is this Oakley cipher (with key length, 0 = default) permitted
    pub fn allows_enc(self, enc: u16, key_len: u16) -> bool {
        IKE_ENCS.iter().any(|(bit, _, id, len)| {
            self.0 & bit != 0
                && *id == enc
                && (*len == key_len || (key_len == 0 && (*len == 0 || *len == 128)))
        })
    }

    /// Is this Oakley cipher permitted with any key length
    pub fn allows_enc_any(self, enc: u16) -> bool {
        IKE_ENCS
            .iter()
            .any(|(bit, _, id, _)| self.0 & bit != 0 && *id == enc)
    }

    /// Is this Oakley hash permitted
    pub fn allows_hash(self, hash: u16) -> bool {
        IKE_HASHES
            .iter()
            .any(|(bit, _, id)| self.0 & bit != 0 && *id == hash)
    }

    /// Is this Oakley group permitted
    pub fn allows_group(self, group: u16) -> bool {
        GROUPS
            .iter()
            .any(|(bit, _, id)| self.0 & bit != 0 && *id == group)
    }

    /// Permitted ciphers as (oakley id, key length) in enumeration order
    pub fn encs(self) -> Vec<(u16, u16)> {
        IKE_ENCS
            .iter()
            .filter(|(bit, _, _, _)| self.0 & bit != 0)
            .map(|(_, _, id, len)| (*id, *len))
            .collect()
    }

    /// Permitted hashes in enumeration order
    pub fn hashes(self) -> Vec<u16> {
        IKE_HASHES
            .iter()
            .filter(|(bit, _, _)| self.0 & bit != 0)
            .map(|(_, _, id)| *id)
            .collect()
    }

    /// Permitted groups in enumeration order
    pub fn groups(self) -> Vec<u16> {
        GROUPS
            .iter()
            .filter(|(bit, _, _)| self.0 & bit != 0)
            .map(|(_, _, id)| *id)
            .collect()
    }

    /// Check that every family has at least one algorithm
    pub fn validate(self) -> Result<()> {
        if self.encs().is_empty() || self.hashes().is_empty() || self.groups().is_empty() {
            return Err(Error::Config(format!(
                "ike algorithms \"{}\" must name a cipher, a hash and a group",
                self
            )));
        }
        Ok(())
    }
}

impl Default for MainAlgorithms {
    fn default() -> Self {
        MainAlgorithms(
            Self::ENC_3DES
                | Self::ENC_AES128
                | Self::HASH_MD5
                | Self::HASH_SHA1
                | Self::GROUP_MODP1024
                | Self::GROUP_MODP1536,
        )
    }
}

/// Renders `enc-auth-group,` for every permitted combination, the final
/// comma replaced by `!` (strict).
impl fmt::Display for MainAlgorithms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for (ebit, ename, _, _) in IKE_ENCS.iter() {
            if self.0 & ebit == 0 {
                continue;
            }
            for (hbit, hname, _) in IKE_HASHES.iter() {
                if self.0 & hbit == 0 {
                    continue;
                }
                for (gbit, gname, _) in GROUPS.iter() {
                    if self.0 & gbit == 0 {
                        continue;
                    }
                    out.push_str(&format!("{}-{}-{},", ename, hname, gname));
                }
            }
        }
        if out.ends_with(',') {
            out.pop();
            out.push('!');
        }
        write!(f, "{}", out)
    }
}

impl FromStr for MainAlgorithms {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bits = 0u32;
        for item in s.trim_end_matches('!').split(',').filter(|i| !i.is_empty()) {
            let mut parts = item.split('-');
            let enc = parts.next().unwrap_or_default();
            let (ebit, _, _, _) = IKE_ENCS
                .iter()
                .find(|(_, name, _, _)| *name == enc || (enc == "aes" && *name == "aes128"))
                .ok_or_else(|| Error::Config(format!("unknown ike cipher \"{}\"", enc)))?;
            bits |= ebit;
            if let Some(hash) = parts.next() {
                let (hbit, _, _) = IKE_HASHES
                    .iter()
                    .find(|(_, name, _)| *name == hash || (hash == "sha1" && *name == "sha"))
                    .ok_or_else(|| Error::Config(format!("unknown ike hash \"{}\"", hash)))?;
                bits |= hbit;
            }
            if let Some(group) = parts.next() {
                let (gbit, _, _) = GROUPS
                    .iter()
                    .find(|(_, name, _)| *name == group)
                    .ok_or_else(|| Error::Config(format!("unknown ike group \"{}\"", group)))?;
                bits |= gbit;
            }
        }
        if MainAlgorithms(bits).hashes().is_empty() {
            bits |= MainAlgorithms::HASH_MD5 | MainAlgorithms::HASH_SHA1;
        }
        if MainAlgorithms(bits).groups().is_empty() {
            bits |= MainAlgorithms::GROUP_MODP1024 | MainAlgorithms::GROUP_MODP1536;
        }
        Ok(MainAlgorithms(bits))
    }
}

/// Phase 2 algorithms a connection permits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuickAlgorithms(u32);

const ESP_ENCS: [(u32, &str, u8, u16); 5] = [
    (QuickAlgorithms::ESP_DES, "des", transform::ESP_DES, 0),
    (QuickAlgorithms::ESP_3DES, "3des", transform::ESP_3DES, 0),
    (QuickAlgorithms::ESP_AES128, "aes128", transform::ESP_AES, 128),
    (QuickAlgorithms::ESP_AES192, "aes192", transform::ESP_AES, 192),
    (QuickAlgorithms::ESP_AES256, "aes256", transform::ESP_AES, 256),
];

const ESP_AUTHS: [(u32, &str, u16); 2] = [
    (QuickAlgorithms::AUTH_MD5, "md5", ipsec_attr::AUTH_ALGORITHM_HMAC_MD5),
    (QuickAlgorithms::AUTH_SHA1, "sha1", ipsec_attr::AUTH_ALGORITHM_HMAC_SHA1),
];

const AH_TRANSFORMS: [(u32, u8, u16); 2] = [
    (QuickAlgorithms::AH_MD5, transform::AH_MD5, ipsec_attr::AUTH_ALGORITHM_HMAC_MD5),
    (QuickAlgorithms::AH_SHA1, transform::AH_SHA, ipsec_attr::AUTH_ALGORITHM_HMAC_SHA1),
];

const PFS_GROUPS: [(u32, &str, u16); 3] = [
    (QuickAlgorithms::PFS_MODP768, "modp768", oakley::GROUP_MODP768),
    (QuickAlgorithms::PFS_MODP1024, "modp1024", oakley::GROUP_MODP1024),
    (QuickAlgorithms::PFS_MODP1536, "modp1536", oakley::GROUP_MODP1536),
];

impl QuickAlgorithms {
    /// ESP DES
    pub const ESP_DES: u32 = 1 << 0;
    /// ESP 3DES
    pub const ESP_3DES: u32 = 1 << 1;
    /// ESP AES, 128 bit key
    pub const ESP_AES128: u32 = 1 << 2;
    /// ESP AES, 192 bit key
    pub const ESP_AES192: u32 = 1 << 3;
    /// ESP AES, 256 bit key
    pub const ESP_AES256: u32 = 1 << 4;
    /// ESP integrity HMAC-MD5
    pub const AUTH_MD5: u32 = 1 << 8;
    /// ESP integrity HMAC-SHA1
    pub const AUTH_SHA1: u32 = 1 << 9;
    /// AH HMAC-MD5
    pub const AH_MD5: u32 = 1 << 12;
    /// AH HMAC-SHA1
    pub const AH_SHA1: u32 = 1 << 13;
    /// PFS with MODP 768
    pub const PFS_MODP768: u32 = 1 << 16;
    /// PFS with MODP 1024
    pub const PFS_MODP1024: u32 = 1 << 17;
    /// PFS with MODP 1536
    pub const PFS_MODP1536: u32 = 1 << 18;

    /// Create from raw bits
    pub const fn new(bits: u32) -> Self {
        QuickAlgorithms(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Is this ESP transform (with key length, 0 = default) permitted
    pub fn allows_esp(self, transid: u8, key_len: u16) -> bool {
        ESP_ENCS.iter().any(|(bit, _, id, len)| {
            self.0 & bit != 0
                && *id == transid
                && (*len == key_len || (key_len == 0 && (*len == 0 || *len == 128)))
        })
    }

    /// Is this ESP integrity algorithm permitted
    pub fn allows_esp_auth(self, auth: u16) -> bool {
        ESP_AUTHS
            .iter()
            .any(|(bit, _, id)| self.0 & bit != 0 && *id == auth)
    }

    /// Is this AH transform permitted
    pub fn allows_ah(self, transid: u8) -> bool {
        AH_TRANSFORMS
            .iter()
            .any(|(bit, id, _)| self.0 & bit != 0 && *id == transid)
    }

    /// Permitted ESP transforms as (transform id, key length)
    pub fn esp_encs(self) -> Vec<(u8, u16)> {
        ESP_ENCS
            .iter()
            .filter(|(bit, _, _, _)| self.0 & bit != 0)
            .map(|(_, _, id, len)| (*id, *len))
            .collect()
    }

    /// Permitted ESP integrity algorithms
    pub fn esp_auths(self) -> Vec<u16> {
        ESP_AUTHS
            .iter()
            .filter(|(bit, _, _)| self.0 & bit != 0)
            .map(|(_, _, id)| *id)
            .collect()
    }

    /// Permitted AH transforms as (transform id, auth algorithm)
    pub fn ah_transforms(self) -> Vec<(u8, u16)> {
        AH_TRANSFORMS
            .iter()
            .filter(|(bit, _, _)| self.0 & bit != 0)
            .map(|(_, id, auth)| (*id, *auth))
            .collect()
    }

    /// Explicit PFS group, if one is configured
    pub fn pfs_group(self) -> Option<u16> {
        PFS_GROUPS
            .iter()
            .find(|(bit, _, _)| self.0 & bit != 0)
            .map(|(_, _, id)| *id)
    }
}

impl Default for QuickAlgorithms {
    fn default() -> Self {
        QuickAlgorithms(
            Self::ESP_3DES
                | Self::ESP_AES128
                | Self::AUTH_MD5
                | Self::AUTH_SHA1
                | Self::AH_MD5
                | Self::AH_SHA1,
        )
    }
}

/// Renders `enc-auth,` per ESP combination, the final comma replaced by
/// `!`, followed by `;group` when a PFS group is configured.
impl fmt::Display for QuickAlgorithms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for (ebit, ename, _, _) in ESP_ENCS.iter() {
            if self.0 & ebit == 0 {
                continue;
            }
            for (abit, aname, _) in ESP_AUTHS.iter() {
                if self.0 & abit == 0 {
                    continue;
                }
                out.push_str(&format!("{}-{},", ename, aname));
            }
        }
        if out.ends_with(',') {
            out.pop();
            out.push('!');
        }
        if let Some((_, gname, _)) = PFS_GROUPS.iter().find(|(bit, _, _)| self.0 & bit != 0) {
            out.push(';');
            out.push_str(gname);
        }
        write!(f, "{}", out)
    }
}

impl FromStr for QuickAlgorithms {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (list, group) = match s.split_once(';') {
            Some((list, group)) => (list, Some(group)),
            None => (s, None),
        };
        // AH stays permitted unless the caller narrows it separately
        let mut bits = QuickAlgorithms::AH_MD5 | QuickAlgorithms::AH_SHA1;
        for item in list.trim_end_matches('!').split(',').filter(|i| !i.is_empty()) {
            let mut parts = item.split('-');
            let enc = parts.next().unwrap_or_default();
            let (ebit, _, _, _) = ESP_ENCS
                .iter()
                .find(|(_, name, _, _)| *name == enc || (enc == "aes" && *name == "aes128"))
                .ok_or_else(|| Error::Config(format!("unknown esp cipher \"{}\"", enc)))?;
            bits |= ebit;
            match parts.next() {
                Some(auth) => {
                    let (abit, _, _) = ESP_AUTHS
                        .iter()
                        .find(|(_, name, _)| *name == auth || (auth == "sha" && *name == "sha1"))
                        .ok_or_else(|| Error::Config(format!("unknown esp auth \"{}\"", auth)))?;
                    bits |= abit;
                }
                None => bits |= QuickAlgorithms::AUTH_MD5 | QuickAlgorithms::AUTH_SHA1,
            }
        }
        if let Some(group) = group {
            let (gbit, _, _) = PFS_GROUPS
                .iter()
                .find(|(_, name, _)| *name == group)
                .ok_or_else(|| Error::Config(format!("unknown pfs group \"{}\"", group)))?;
            bits |= gbit;
        }
        Ok(QuickAlgorithms(bits))
    }
}
