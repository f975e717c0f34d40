//! Daemon and connection configuration
//!
//! Provides the tunables of the negotiation engine and builder patterns for
//! [`DaemonConfig`] and [`ConnectionConfig`].

use crate::connections::{Identity, Subnet};
use crate::error::{Error, Result};
use crate::policy::{MainAlgorithms, Policy, QuickAlgorithms};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default ISAKMP SA lifetime in seconds
pub const OAKLEY_LIFE_DEFAULT: u32 = 3600;

/// Longest ISAKMP SA lifetime we accept, in seconds
pub const OAKLEY_LIFE_MAXIMUM: u32 = 28800;

/// Default IPsec SA lifetime in seconds
pub const IPSEC_LIFE_DEFAULT: u32 = 28800;

/// Longest IPsec SA lifetime we accept, in seconds
pub const IPSEC_LIFE_MAXIMUM: u32 = 86400;

/// IKE port
pub const IKE_UDP_PORT: u16 = 500;

/// Port IKE floats to once NAT-T is negotiated
pub const NAT_T_IKE_FLOAT_PORT: u16 = 4500;

/// Most payloads digested out of one message
pub const PAYLIMIT: usize = 20;

/// Retransmissions before an exchange is abandoned
pub const MAXIMUM_RETRANSMISSIONS: u32 = 2;

/// Delay before the first retransmission
pub const EVENT_RETRANSMIT_DELAY_0: Duration = Duration::from_secs(10);

/// PAYLOAD_MALFORMED notifications tolerated per state
pub const MAXIMUM_MALFORMED_NOTIFY: u32 = 16;

/// Default rekey margin
pub const SA_REPLACEMENT_MARGIN_DEFAULT: Duration = Duration::from_secs(540);

/// Default rekey fuzz, percent of the margin
pub const SA_REPLACEMENT_FUZZ_DEFAULT: u32 = 100;

/// Default keying attempts (0 means forever)
pub const SA_REPLACEMENT_RETRIES_DEFAULT: u32 = 3;

/// Default NAT-T keepalive period
pub const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(20);

/// Interval of the pending Quick Mode review
pub const PENDING_PHASE2_INTERVAL: Duration = Duration::from_secs(120);

/// Process-wide settings of the negotiation engine
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Local addresses IKE listens on
    pub interfaces: Vec<IpAddr>,

    /// IKE port
    pub ike_port: u16,

    /// Negotiate NAT traversal
    pub nat_traversal: bool,

    /// Send NAT-T keepalives when we are behind a NAT
    pub nat_keepalive: bool,

    /// Send keepalives even when no NAT was detected in front of us
    pub force_keepalive: bool,

    /// Period between NAT-T keepalives
    pub keep_alive_period: Duration,

    /// Replace older ISAKMP SAs of the same peer id
    pub uniqueids: bool,

    /// Rejections before a peer gets blocked (0 disables blocking)
    pub block_ip_reject_num: u32,

    /// How long a block (or a rejection record) lasts
    pub block_ip_period: Duration,

    /// Retransmissions before an exchange is abandoned
    pub max_retransmissions: u32,

    /// Delay before the first retransmission
    pub retransmit_delay: Duration,

    /// Interval of the pending Quick Mode review
    pub pending_phase2_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            interfaces: Vec::new(),
            ike_port: IKE_UDP_PORT,
            nat_traversal: false,
            nat_keepalive: true,
            force_keepalive: false,
            keep_alive_period: DEFAULT_KEEP_ALIVE_PERIOD,
            uniqueids: true,
            block_ip_reject_num: 0,
            block_ip_period: Duration::from_secs(0),
            max_retransmissions: MAXIMUM_RETRANSMISSIONS,
            retransmit_delay: EVENT_RETRANSMIT_DELAY_0,
            pending_phase2_interval: PENDING_PHASE2_INTERVAL,
        }
    }
}

impl DaemonConfig {
    /// Create builder for daemon configuration
    pub fn builder() -> DaemonConfigBuilder {
        DaemonConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.interfaces.is_empty() {
            return Err(Error::InvalidParameter(
                "At least one interface address required".into(),
            ));
        }
        if let Some(bad) = self.interfaces.iter().find(|a| a.is_unspecified()) {
            return Err(Error::InvalidParameter(format!(
                "interface address {} is not a host address",
                bad
            )));
        }
        if self.ike_port == 0 {
            return Err(Error::InvalidParameter("ike_port cannot be 0".into()));
        }
        if self.nat_keepalive && self.keep_alive_period.is_zero() {
            return Err(Error::InvalidParameter(
                "keep_alive_period cannot be zero".into(),
            ));
        }
        if self.block_ip_reject_num > 0 && self.block_ip_period.is_zero() {
            return Err(Error::InvalidParameter(
                "block_ip_period required when block_ip_reject_num is set".into(),
            ));
        }
        if self.retransmit_delay.is_zero() {
            return Err(Error::InvalidParameter(
                "retransmit_delay cannot be zero".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for DaemonConfig
#[derive(Default)]
pub struct DaemonConfigBuilder {
    config: DaemonConfig,
}

impl DaemonConfigBuilder {
    /// Create new daemon builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listening interface address
    pub fn with_interface(mut self, addr: IpAddr) -> Self {
        self.config.interfaces.push(addr);
        self
    }

    /// Set IKE port
    pub fn with_ike_port(mut self, port: u16) -> Self {
        self.config.ike_port = port;
        self
    }

    /// Enable or disable NAT traversal
    pub fn with_nat_traversal(mut self, enabled: bool) -> Self {
        self.config.nat_traversal = enabled;
        self
    }

    /// Configure NAT-T keepalives
    pub fn with_keepalive(mut self, enabled: bool, period: Duration) -> Self {
        self.config.nat_keepalive = enabled;
        self.config.keep_alive_period = period;
        self
    }

    /// Send keepalives even when we are not behind a NAT
    pub fn with_force_keepalive(mut self, force: bool) -> Self {
        self.config.force_keepalive = force;
        self
    }

    /// Set uniqueids
    pub fn with_uniqueids(mut self, uniqueids: bool) -> Self {
        self.config.uniqueids = uniqueids;
        self
    }

    /// Set block-list thresholds
    pub fn with_block_ip(mut self, reject_num: u32, period: Duration) -> Self {
        self.config.block_ip_reject_num = reject_num;
        self.config.block_ip_period = period;
        self
    }

    /// Set retransmission limits
    pub fn with_retransmits(mut self, max: u32, first_delay: Duration) -> Self {
        self.config.max_retransmissions = max;
        self.config.retransmit_delay = first_delay;
        self
    }

    /// Set pending Quick Mode review interval
    pub fn with_pending_phase2_interval(mut self, interval: Duration) -> Self {
        self.config.pending_phase2_interval = interval;
        self
    }

    /// Build DaemonConfig with validation
    pub fn build(self) -> Result<DaemonConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// One side of a connection as configured (`left` or `right`)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndConfig {
    /// Host address; unspecified means any (road warrior or opportunistic peer)
    pub host: IpAddr,

    /// IKE port of the host
    pub host_port: u16,

    /// Compare the IKE port when matching host pairs
    pub host_port_specific: bool,

    /// Client subnet behind the host, if any
    pub client: Option<Subnet>,

    /// Client subnet is a wildcard narrowed per instance
    pub client_wildcard: bool,

    /// Phase 1 identity (`Identity::None` defaults to the host address)
    pub id: Identity,

    /// Transport protocol of the protected traffic (0 = any)
    pub protocol: u8,

    /// Transport port of the protected traffic (0 = any)
    pub port: u16,
}

impl EndConfig {
    /// End with a fixed host address
    pub fn host(addr: IpAddr) -> Self {
        EndConfig {
            host: addr,
            host_port: IKE_UDP_PORT,
            host_port_specific: false,
            client: None,
            client_wildcard: false,
            id: Identity::None,
            protocol: 0,
            port: 0,
        }
    }

    /// End whose host is not known in advance
    pub fn any() -> Self {
        Self::host(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Set client subnet
    pub fn with_client(mut self, client: Subnet) -> Self {
        self.client = Some(client);
        self
    }

    /// Mark the client subnet as a wildcard
    pub fn with_client_wildcard(mut self) -> Self {
        self.client_wildcard = true;
        self
    }

    /// Set identity
    pub fn with_id(mut self, id: Identity) -> Self {
        self.id = id;
        self
    }

    /// Set IKE port and make it significant for host pair matching
    pub fn with_host_port(mut self, port: u16) -> Self {
        self.host_port = port;
        self.host_port_specific = true;
        self
    }

    /// Restrict to a transport protocol
    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    /// Restrict to a transport port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// True when the host address is a wildcard
    pub fn is_any(&self) -> bool {
        self.host.is_unspecified()
    }
}

/// A named connection as configured
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Connection name
    pub name: String,

    /// Left end
    pub left: EndConfig,

    /// Right end
    pub right: EndConfig,

    /// Negotiation policy
    pub policy: Policy,

    /// Phase 1 algorithms
    pub ike: MainAlgorithms,

    /// Phase 2 algorithms
    pub esp: QuickAlgorithms,

    /// Pre-shared secret
    pub psk: Option<Vec<u8>>,

    /// ISAKMP SA lifetime
    pub ike_lifetime: Duration,

    /// IPsec SA lifetime
    pub ipsec_lifetime: Duration,

    /// Rekey this long before expiry
    pub rekey_margin: Duration,

    /// Random increase of the margin, percent
    pub rekey_fuzz: u32,

    /// Keying attempts (0 means forever)
    pub keying_tries: u32,

    /// Idle time before a DPD probe (zero disables DPD)
    pub dpd_delay: Duration,

    /// Silence after which the peer is declared dead
    pub dpd_timeout: Duration,

    /// Pretend a NAT is present so ESP is always UDP encapsulated
    pub forceencaps: bool,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("left", &self.left)
            .field("right", &self.right)
            .field("policy", &format_args!("{}", self.policy))
            .field("ike", &format_args!("{}", self.ike))
            .field("esp", &format_args!("{}", self.esp))
            .field("psk", &self.psk.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ConnectionConfig {
    /// Create builder for a named connection
    pub fn builder(name: impl Into<String>) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new(name)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidParameter("name cannot be empty".into()));
        }
        if self.left.is_any() && self.right.is_any() {
            return Err(Error::Config(format!(
                "connection \"{}\": at most one end may have a wildcard host",
                self.name
            )));
        }
        if self.left.host.is_ipv4() != self.right.host.is_ipv4() {
            return Err(Error::Config(format!(
                "connection \"{}\": address family inconsistency",
                self.name
            )));
        }
        if self.policy.contains(Policy::PSK) && self.psk.as_ref().map_or(true, |k| k.is_empty()) {
            return Err(Error::Config(format!(
                "connection \"{}\": PSK authentication needs a pre-shared secret",
                self.name
            )));
        }
        if self.policy.contains(Policy::PSK | Policy::RSASIG)
            && (self.left.is_any() || self.right.is_any())
        {
            // a wildcard peer is matched on one authentication method only
            return Err(Error::Config(format!(
                "connection \"{}\": road warrior must choose one authentication method",
                self.name
            )));
        }
        if self.policy.contains(Policy::OPPO)
            && !(self.left.is_any() || self.right.is_any())
        {
            return Err(Error::Config(format!(
                "connection \"{}\": opportunistic connection needs a wildcard peer",
                self.name
            )));
        }
        if !self.policy.never_negotiate() {
            self.ike.validate()?;
        }
        if self.ike_lifetime.as_secs() > OAKLEY_LIFE_MAXIMUM as u64 {
            return Err(Error::Config(format!(
                "connection \"{}\": ikelifetime may not exceed {} seconds",
                self.name, OAKLEY_LIFE_MAXIMUM
            )));
        }
        if self.ipsec_lifetime.as_secs() > IPSEC_LIFE_MAXIMUM as u64 {
            return Err(Error::Config(format!(
                "connection \"{}\": keylife may not exceed {} seconds",
                self.name, IPSEC_LIFE_MAXIMUM
            )));
        }
        if !self.dpd_delay.is_zero() && self.dpd_timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "dpd_timeout required when dpd_delay is set".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for ConnectionConfig
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Create new connection builder
    pub fn new(name: impl Into<String>) -> Self {
        ConnectionConfigBuilder {
            config: ConnectionConfig {
                name: name.into(),
                left: EndConfig::any(),
                right: EndConfig::any(),
                policy: Policy::new(Policy::PSK | Policy::ENCRYPT | Policy::TUNNEL),
                ike: MainAlgorithms::default(),
                esp: QuickAlgorithms::default(),
                psk: None,
                ike_lifetime: Duration::from_secs(OAKLEY_LIFE_DEFAULT as u64),
                ipsec_lifetime: Duration::from_secs(IPSEC_LIFE_DEFAULT as u64),
                rekey_margin: SA_REPLACEMENT_MARGIN_DEFAULT,
                rekey_fuzz: SA_REPLACEMENT_FUZZ_DEFAULT,
                keying_tries: SA_REPLACEMENT_RETRIES_DEFAULT,
                dpd_delay: Duration::from_secs(0),
                dpd_timeout: Duration::from_secs(0),
                forceencaps: false,
            },
        }
    }

    /// Set left end
    pub fn with_left(mut self, end: EndConfig) -> Self {
        self.config.left = end;
        self
    }

    /// Set right end
    pub fn with_right(mut self, end: EndConfig) -> Self {
        self.config.right = end;
        self
    }

    /// Set policy
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Set phase 1 algorithms
    pub fn with_ike(mut self, ike: MainAlgorithms) -> Self {
        self.config.ike = ike;
        self
    }

    /// Set phase 2 algorithms
    pub fn with_esp(mut self, esp: QuickAlgorithms) -> Self {
        self.config.esp = esp;
        self
    }

    /// Set pre-shared key
    pub fn with_psk(mut self, psk: impl Into<Vec<u8>>) -> Self {
        self.config.psk = Some(psk.into());
        self
    }

    /// Set SA lifetimes
    pub fn with_lifetimes(mut self, ike: Duration, ipsec: Duration) -> Self {
        self.config.ike_lifetime = ike;
        self.config.ipsec_lifetime = ipsec;
        self
    }

    /// Set rekey margin and fuzz
    pub fn with_rekey(mut self, margin: Duration, fuzz_percent: u32) -> Self {
        self.config.rekey_margin = margin;
        self.config.rekey_fuzz = fuzz_percent;
        self
    }

    /// Set keying tries
    pub fn with_keying_tries(mut self, tries: u32) -> Self {
        self.config.keying_tries = tries;
        self
    }

    /// Set Dead Peer Detection delay and timeout
    pub fn with_dpd(mut self, delay: Duration, timeout: Duration) -> Self {
        self.config.dpd_delay = delay;
        self.config.dpd_timeout = timeout;
        self
    }

    /// Force UDP encapsulation
    pub fn with_forceencaps(mut self, force: bool) -> Self {
        self.config.forceencaps = force;
        self
    }

    /// Build ConnectionConfig with validation
    pub fn build(self) -> Result<ConnectionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build without validation; the registry validates on add
    pub fn build_unchecked(self) -> ConnectionConfig {
        self.config
    }
}
