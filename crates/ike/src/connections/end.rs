//! Connection ends: subnets, identities and the oriented `End`

use crate::config::{EndConfig, IKE_UDP_PORT};
use crate::error::{Error, Result};
use crate::isakmp::{id_type, IdPayload};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An address prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    addr: IpAddr,
    prefix: u8,
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask_addr(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(a) => {
            let bits = u32::from(a);
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(a) => {
            let bits = u128::from(a);
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}

fn unspecified_like(addr: &IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

impl Subnet {
    /// Create a subnet; host bits of `addr` are cleared
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        if prefix > max_prefix(&addr) {
            return Err(Error::InvalidParameter(format!(
                "prefix length {} too long for {}",
                prefix, addr
            )));
        }
        Ok(Subnet {
            addr: mask_addr(addr, prefix),
            prefix,
        })
    }

    /// Subnet holding exactly one address
    pub fn from_host(addr: IpAddr) -> Self {
        Subnet {
            addr,
            prefix: max_prefix(&addr),
        }
    }

    /// Subnet covering the whole address family of `addr`
    pub fn all(addr: &IpAddr) -> Self {
        Subnet {
            addr: unspecified_like(addr),
            prefix: 0,
        }
    }

    /// Network address
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Netmask as an address
    pub fn mask(&self) -> IpAddr {
        match self.addr {
            IpAddr::V4(_) => mask_addr(IpAddr::V4(Ipv4Addr::BROADCAST), self.prefix),
            IpAddr::V6(_) => mask_addr(IpAddr::V6(Ipv6Addr::from(u128::MAX)), self.prefix),
        }
    }

    /// A single address
    pub fn is_host(&self) -> bool {
        self.prefix == max_prefix(&self.addr)
    }

    /// Does the subnet contain `addr`
    pub fn contains_addr(&self, addr: &IpAddr) -> bool {
        addr.is_ipv4() == self.addr.is_ipv4() && mask_addr(*addr, self.prefix) == self.addr
    }

    /// Is `other` inside this subnet
    pub fn contains_subnet(&self, other: &Subnet) -> bool {
        other.prefix >= self.prefix && self.contains_addr(&other.addr)
    }

    /// Phase 2 identification payload for this subnet
    pub fn to_id_payload(&self, protocol: u8, port: u16) -> IdPayload {
        let host = self.is_host();
        let (id_type, mut data) = match (self.addr, host) {
            (IpAddr::V4(a), true) => (id_type::IPV4_ADDR, a.octets().to_vec()),
            (IpAddr::V4(a), false) => (id_type::IPV4_ADDR_SUBNET, a.octets().to_vec()),
            (IpAddr::V6(a), true) => (id_type::IPV6_ADDR, a.octets().to_vec()),
            (IpAddr::V6(a), false) => (id_type::IPV6_ADDR_SUBNET, a.octets().to_vec()),
        };
        if !host {
            match self.mask() {
                IpAddr::V4(m) => data.extend_from_slice(&m.octets()),
                IpAddr::V6(m) => data.extend_from_slice(&m.octets()),
            }
        }
        IdPayload {
            id_type,
            protocol_id: protocol,
            port,
            data,
        }
    }

    /// Decode a phase 2 identification payload
    pub fn from_id_payload(id: &IdPayload) -> Result<Self> {
        let bad = || {
            Error::InvalidPayload(format!(
                "ID type {} with {} bytes of data is not a client subnet",
                id.id_type,
                id.data.len()
            ))
        };
        match (id.id_type, id.data.len()) {
            (id_type::IPV4_ADDR, 4) => {
                let a: [u8; 4] = id.data[..4].try_into().map_err(|_| bad())?;
                Ok(Subnet::from_host(IpAddr::V4(Ipv4Addr::from(a))))
            }
            (id_type::IPV6_ADDR, 16) => {
                let a: [u8; 16] = id.data[..16].try_into().map_err(|_| bad())?;
                Ok(Subnet::from_host(IpAddr::V6(Ipv6Addr::from(a))))
            }
            (id_type::IPV4_ADDR_SUBNET, 8) => {
                let a: [u8; 4] = id.data[..4].try_into().map_err(|_| bad())?;
                let m: [u8; 4] = id.data[4..8].try_into().map_err(|_| bad())?;
                let prefix = mask_to_prefix(u32::from_be_bytes(m) as u128, 32).ok_or_else(bad)?;
                Subnet::new(IpAddr::V4(Ipv4Addr::from(a)), prefix)
            }
            (id_type::IPV6_ADDR_SUBNET, 32) => {
                let a: [u8; 16] = id.data[..16].try_into().map_err(|_| bad())?;
                let m: [u8; 16] = id.data[16..32].try_into().map_err(|_| bad())?;
                let prefix = mask_to_prefix(u128::from_be_bytes(m), 128).ok_or_else(bad)?;
                Subnet::new(IpAddr::V6(Ipv6Addr::from(a)), prefix)
            }
            _ => Err(bad()),
        }
    }
}

fn mask_to_prefix(mask: u128, width: u32) -> Option<u8> {
    let ones = mask.count_ones();
    let expected = if ones == 0 {
        0
    } else {
        (u128::MAX >> (128 - width)) & !((1u128 << (width - ones)) - 1)
    };
    (mask == expected).then_some(ones as u8)
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidParameter(format!("bad subnet \"{}\"", s));
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| bad())?;
                let prefix: u8 = prefix.parse().map_err(|_| bad())?;
                Subnet::new(addr, prefix)
            }
            None => Ok(Subnet::from_host(s.parse().map_err(|_| bad())?)),
        }
    }
}

/// Phase 1 identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Identity {
    /// No identity (wildcard)
    #[default]
    None,
    /// IPv4 or IPv6 address
    Addr(IpAddr),
    /// Fully qualified domain name (`@host.example`)
    Fqdn(String),
    /// user@FQDN
    UserFqdn(String),
    /// Opaque key id (`@#hex`)
    KeyId(Vec<u8>),
}

fn fqdn_eq(a: &str, b: &str) -> bool {
    a.trim_end_matches('.').eq_ignore_ascii_case(b.trim_end_matches('.'))
}

impl Identity {
    /// Is this the wildcard identity
    pub fn is_none(&self) -> bool {
        matches!(self, Identity::None)
    }

    /// Identities denote the same peer (both `None` counts as the same)
    pub fn same_id(&self, other: &Identity) -> bool {
        match (self, other) {
            (Identity::None, Identity::None) => true,
            (Identity::Addr(a), Identity::Addr(b)) => a == b,
            (Identity::Fqdn(a), Identity::Fqdn(b)) => fqdn_eq(a, b),
            (Identity::UserFqdn(a), Identity::UserFqdn(b)) => fqdn_eq(a, b),
            (Identity::KeyId(a), Identity::KeyId(b)) => a == b,
            _ => false,
        }
    }

    /// `self` (a received id) matches `pattern`; returns the number of
    /// wildcards used, or `None` for no match
    pub fn match_id(&self, pattern: &Identity) -> Option<u32> {
        if pattern.is_none() {
            Some(1)
        } else if self.same_id(pattern) {
            Some(0)
        } else {
            None
        }
    }

    /// Phase 1 identification payload (protocol and port left 0)
    pub fn to_id_payload(&self) -> IdPayload {
        let (id_type, data) = match self {
            Identity::None => (id_type::IPV4_ADDR, vec![0; 4]),
            Identity::Addr(IpAddr::V4(a)) => (id_type::IPV4_ADDR, a.octets().to_vec()),
            Identity::Addr(IpAddr::V6(a)) => (id_type::IPV6_ADDR, a.octets().to_vec()),
            Identity::Fqdn(name) => (id_type::FQDN, name.as_bytes().to_vec()),
            Identity::UserFqdn(name) => (id_type::USER_FQDN, name.as_bytes().to_vec()),
            Identity::KeyId(key) => (id_type::KEY_ID, key.clone()),
        };
        IdPayload {
            id_type,
            protocol_id: 0,
            port: 0,
            data,
        }
    }

    /// Decode a phase 1 identification payload
    pub fn from_id_payload(id: &IdPayload) -> Result<Self> {
        match id.id_type {
            id_type::IPV4_ADDR | id_type::IPV6_ADDR => {
                let subnet = Subnet::from_id_payload(id)?;
                if subnet.addr().is_unspecified() {
                    return Err(Error::InvalidPayload(
                        "peer ID is the unspecified address".into(),
                    ));
                }
                Ok(Identity::Addr(subnet.addr()))
            }
            id_type::FQDN => Ok(Identity::Fqdn(String::from_utf8_lossy(&id.data).into_owned())),
            id_type::USER_FQDN => Ok(Identity::UserFqdn(
                String::from_utf8_lossy(&id.data).into_owned(),
            )),
            id_type::KEY_ID => Ok(Identity::KeyId(id.data.clone())),
            other => Err(Error::InvalidPayload(format!(
                "unsupported phase 1 ID type {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::None => write!(f, "%any"),
            Identity::Addr(a) => write!(f, "{}", a),
            Identity::Fqdn(name) => write!(f, "@{}", name),
            Identity::UserFqdn(name) => write!(f, "{}", name),
            Identity::KeyId(key) => write!(f, "@#{}", hex::encode(key)),
        }
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s == "%any" {
            return Ok(Identity::None);
        }
        if let Some(key) = s.strip_prefix("@#") {
            return hex::decode(key)
                .map(Identity::KeyId)
                .map_err(|_| Error::InvalidParameter(format!("bad key id \"{}\"", s)));
        }
        if let Some(name) = s.strip_prefix('@') {
            return Ok(Identity::Fqdn(name.to_string()));
        }
        if s.contains('@') {
            return Ok(Identity::UserFqdn(s.to_string()));
        }
        s.parse::<IpAddr>()
            .map(Identity::Addr)
            .map_err(|_| Error::InvalidParameter(format!("malformed --id \"{}\"", s)))
    }
}

/// One oriented end of a connection (`this` is ours, `that` the peer's)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct End {
    /// Host address (unspecified means any)
    pub host_addr: IpAddr,
    /// IKE port
    pub host_port: u16,
    /// Port is significant for host pair matching
    pub host_port_specific: bool,
    /// Client subnet (the host itself when there is no client)
    pub client: Subnet,
    /// A client subnet was configured
    pub has_client: bool,
    /// Client subnet is narrowed per instance
    pub has_client_wildcard: bool,
    /// Phase 1 identity
    pub id: Identity,
    /// Transport protocol (0 = any)
    pub protocol: u8,
    /// Transport port (0 = any)
    pub port: u16,
}

impl From<&EndConfig> for End {
    fn from(cfg: &EndConfig) -> Self {
        End {
            host_addr: cfg.host,
            host_port: cfg.host_port,
            host_port_specific: cfg.host_port_specific,
            client: cfg.client.unwrap_or_else(|| Subnet::from_host(cfg.host)),
            has_client: cfg.client.is_some(),
            has_client_wildcard: cfg.client_wildcard,
            id: cfg.id.clone(),
            protocol: cfg.protocol,
            port: cfg.port,
        }
    }
}

impl End {
    /// Host address is a wildcard
    pub fn host_is_any(&self) -> bool {
        self.host_addr.is_unspecified()
    }

    /// Fill in what defaults from the host address: the id and the client
    pub fn default_end(&mut self) {
        if self.id.is_none() && !self.host_is_any() {
            self.id = Identity::Addr(self.host_addr);
        }
        if !self.has_client {
            self.client = Subnet::from_host(self.host_addr);
        }
    }

    fn wildcard_client(&self) -> bool {
        self.has_client && self.client.is_host() && self.client.addr().is_unspecified()
    }

    /// Render the end the way status output shows it
    pub fn format(&self, is_left: bool) -> String {
        let wc_client = self.wildcard_client();
        let mut client = String::new();
        let mut client_sep = "";
        let (open, close) = if self.has_client_wildcard {
            ("{", "}")
        } else {
            ("", "")
        };
        let host = if self.host_is_any() && wc_client {
            "%opportunistic".to_string()
        } else {
            if self.has_client {
                client = if wc_client {
                    "?".to_string()
                } else {
                    self.client.to_string()
                };
                client_sep = "===";
            }
            if self.host_is_any() {
                "%any".to_string()
            } else {
                self.host_addr.to_string()
            }
        };
        let host_port = if self.host_port != IKE_UDP_PORT {
            format!(":{}", self.host_port)
        } else {
            String::new()
        };
        let protoport = if self.port != 0 || self.protocol != 0 {
            format!(":{}/{}", self.protocol, self.port)
        } else {
            String::new()
        };
        let host_id = match &self.id {
            Identity::None => String::new(),
            Identity::Addr(a) if *a == self.host_addr => String::new(),
            id => format!("[{}]", id),
        };
        if is_left {
            format!(
                "{}{}{}{}{}{}{}{}",
                open, client, close, client_sep, host, host_port, host_id, protoport
            )
        } else {
            format!(
                "{}{}{}{}{}{}{}{}",
                host, host_port, host_id, protoport, client_sep, open, client, close
            )
        }
    }
}
