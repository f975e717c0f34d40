//! Connection registry
//!
//! Connections live in a generation-checked arena: a `ConnId` held by a
//! state or a pending request stops resolving as soon as the connection
//! is removed. Oriented connections hang off the host pair of their two
//! IKE endpoints; the rest wait on the unoriented list until an interface
//! that matches one of their ends appears.

mod end;
mod host_pair;
mod lookup;

pub use end::{End, Identity, Subnet};
pub use host_pair::{HostEnd, HostPair, HostPairId, Pending};
pub use lookup::ClientQuery;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::policy::{MainAlgorithms, Policy, QuickAlgorithms};
use crate::state::SerialNo;
use crate::whack::{RcCode, WhackLog};
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Handle of a connection in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

/// What a connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnKind {
    /// Fully specified on both ends
    Permanent,
    /// Has a wildcard peer; instantiated per peer
    Template,
    /// Template bound to a concrete peer address
    Instance,
    /// Template with a concrete peer host but a narrowed client
    InstanceNet,
    /// Instance in the middle of being deleted
    GoingAway,
}

impl ConnKind {
    /// Created from a template
    pub fn is_instance(self) -> bool {
        matches!(
            self,
            ConnKind::Instance | ConnKind::InstanceNet | ConnKind::GoingAway
        )
    }

    /// Name used in status output
    pub fn name(self) -> &'static str {
        match self {
            ConnKind::Permanent => "CK_PERMANENT",
            ConnKind::Template => "CK_TEMPLATE",
            ConnKind::Instance => "CK_INSTANCE",
            ConnKind::InstanceNet => "CK_INSTANCE_NET",
            ConnKind::GoingAway => "CK_GOING_AWAY",
        }
    }
}

/// Routing of the connection's client traffic, in increasing order of commitment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Routing {
    /// Nothing installed
    Unrouted,
    /// Traffic is trapped and triggers negotiation
    RoutedProspective,
    /// Traffic flows through an IPsec SA
    RoutedTunnel,
}

impl Routing {
    /// The route is ours
    pub fn is_routed(self) -> bool {
        self != Routing::Unrouted
    }
}

impl fmt::Display for Routing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let story = match self {
            Routing::Unrouted => "unrouted",
            Routing::RoutedProspective => "prospective erouted",
            Routing::RoutedTunnel => "erouted",
        };
        write!(f, "{}", story)
    }
}

/// One connection
#[derive(Clone)]
pub struct Connection {
    /// Name (shared by a template and its instances)
    pub name: String,
    /// Kind
    pub kind: ConnKind,
    /// Instance number (counter on a template)
    pub instance_serial: u64,
    /// Negotiation policy
    pub policy: Policy,
    /// Phase 1 algorithms
    pub ike: MainAlgorithms,
    /// Phase 2 algorithms
    pub esp: QuickAlgorithms,
    psk: Option<Zeroizing<Vec<u8>>>,
    /// ISAKMP SA lifetime
    pub ike_lifetime: Duration,
    /// IPsec SA lifetime
    pub ipsec_lifetime: Duration,
    /// Rekey this long before expiry
    pub rekey_margin: Duration,
    /// Random extra margin, percent
    pub rekey_fuzz: u32,
    /// Keying attempts (0 = forever)
    pub keying_tries: u32,
    /// Dead peer detection probe interval
    pub dpd_delay: Duration,
    /// Dead peer detection timeout
    pub dpd_timeout: Duration,
    /// Always encapsulate in UDP
    pub forceencaps: bool,
    /// Our end
    pub this: End,
    /// Peer end
    pub that: End,
    /// Local interface the connection is oriented to
    pub interface: Option<IpAddr>,
    /// Routing
    pub routing: Routing,
    /// Operator asked for this connection to be up
    pub initiated: bool,
    /// Newest ISAKMP SA
    pub newest_isakmp_sa: SerialNo,
    /// Newest IPsec SA
    pub newest_ipsec_sa: SerialNo,
    /// State owning the installed eroute
    pub eroute_owner: SerialNo,
    /// Host pair this connection hangs off
    pub host_pair: Option<HostPairId>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("instance_serial", &self.instance_serial)
            .field("policy", &format_args!("{}", self.policy))
            .field("this", &self.this)
            .field("that", &self.that)
            .field("interface", &self.interface)
            .field("routing", &self.routing)
            .field("psk", &self.psk.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Connection {
    fn from_config(cfg: &ConnectionConfig) -> Self {
        Connection {
            name: cfg.name.clone(),
            kind: ConnKind::Permanent,
            instance_serial: 0,
            policy: cfg.policy,
            ike: cfg.ike,
            esp: cfg.esp,
            psk: cfg.psk.clone().map(Zeroizing::new),
            ike_lifetime: cfg.ike_lifetime,
            ipsec_lifetime: cfg.ipsec_lifetime,
            rekey_margin: cfg.rekey_margin,
            rekey_fuzz: cfg.rekey_fuzz,
            keying_tries: cfg.keying_tries,
            dpd_delay: cfg.dpd_delay,
            dpd_timeout: cfg.dpd_timeout,
            forceencaps: cfg.forceencaps,
            this: End::from(&cfg.left),
            that: End::from(&cfg.right),
            interface: None,
            routing: Routing::Unrouted,
            initiated: false,
            newest_isakmp_sa: SerialNo::NOBODY,
            newest_ipsec_sa: SerialNo::NOBODY,
            eroute_owner: SerialNo::NOBODY,
            host_pair: None,
        }
    }

    /// One end is a local interface
    pub fn oriented(&self) -> bool {
        self.interface.is_some()
    }

    /// Pre-shared secret
    pub fn psk(&self) -> Option<&[u8]> {
        self.psk.as_ref().map(|k| k.as_slice())
    }

    /// Policy asks for at least one IPsec protocol
    pub fn has_ipsec_policy(&self) -> bool {
        self.policy.intersects(Policy::IPSEC_MASK)
    }

    /// Peer client is the opportunistic wildcard `0.0.0.0/32`
    pub fn has_wildcard_client(&self) -> bool {
        self.that.has_client
            && self.that.client.is_host()
            && self.that.client.addr().is_unspecified()
    }

    /// Peer client, widened to the whole family for opportunistic templates
    pub fn effective_peer_client(&self) -> Subnet {
        if self.kind == ConnKind::Template && self.has_wildcard_client() {
            Subnet::all(&self.that.client.addr())
        } else {
            self.that.client
        }
    }

    /// Peer id came from instantiation rather than configuration
    pub fn his_id_was_instantiated(&self) -> bool {
        self.kind == ConnKind::Instance
            && match &self.that.id {
                Identity::Addr(a) => *a == self.that.host_addr,
                _ => true,
            }
    }

    /// `[serial] peer` suffix identifying an instance
    pub fn fmt_instance(&self) -> String {
        if !self.kind.is_instance() {
            return String::new();
        }
        let mut out = format!("[{}]", self.instance_serial);
        if self.policy.contains(Policy::OPPO) {
            let ours = fmt_client(&self.this.client, &self.this.host_addr, " ");
            out.push_str(&ours);
            out.push_str(if ours.is_empty() { " ..." } else { "=== ..." });
            out.push_str(&self.that.host_addr.to_string());
            out.push_str(&fmt_client(&self.that.client, &self.that.host_addr, "==="));
        } else {
            out.push(' ');
            out.push_str(&self.that.host_addr.to_string());
        }
        out
    }

    /// Status lines shown to the operator
    pub fn status_lines(&self) -> Vec<String> {
        let instance = if self.kind.is_instance() {
            format!("[{}]", self.instance_serial)
        } else {
            String::new()
        };
        let iface = self.interface.map(|i| i.to_string()).unwrap_or_default();
        let mut lines = vec![
            format!(
                "\"{}\"{}: {}...{}",
                self.name,
                instance,
                self.this.format(true),
                self.that.format(false)
            ),
            format!(
                "\"{}\"{}:   ike_life: {}s; ipsec_life: {}s; rekey_margin: {}s; rekey_fuzz: {}%; keyingtries: {}",
                self.name,
                instance,
                self.ike_lifetime.as_secs(),
                self.ipsec_lifetime.as_secs(),
                self.rekey_margin.as_secs(),
                self.rekey_fuzz,
                self.keying_tries
            ),
            format!(
                "\"{}\"{}:   policy: {}; interface: {}; {}",
                self.name, instance, self.policy, iface, self.routing
            ),
        ];
        if !self.dpd_timeout.is_zero() {
            lines.push(format!(
                "\"{}\"{}:   dpd: clear; delay:{}; timeout:{}; ",
                self.name,
                instance,
                self.dpd_delay.as_secs(),
                self.dpd_timeout.as_secs()
            ));
        }
        lines.push(format!(
            "\"{}\"{}:   newest ISAKMP SA: #{}; newest IPsec SA: #{}; eroute owner: #{}",
            self.name, instance, self.newest_isakmp_sa, self.newest_ipsec_sa, self.eroute_owner
        ));
        lines.push(format!(
            "\"{}\"{}:   IKE algorithms wanted: {}",
            self.name, instance, self.ike
        ));
        lines.push(format!(
            "\"{}\"{}:   ESP algorithms wanted: {}",
            self.name, instance, self.esp
        ));
        lines
    }
}

fn fmt_client(client: &Subnet, gw: &IpAddr, prefix: &str) -> String {
    if client.is_host() && client.addr() == *gw {
        String::new()
    } else if client.is_host() && client.addr().is_unspecified() {
        format!("{}?", prefix)
    } else {
        format!("{}{}", prefix, client)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// All connections, host pairs and pending Quick Mode requests
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: Vec<ConnId>,
    unoriented: Vec<ConnId>,
    host_pairs: Vec<HostPair>,
    next_host_pair: u64,
    oppo_templates: usize,
}

impl ConnectionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// No connections
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Opportunistic templates currently defined
    pub fn oppo_templates(&self) -> usize {
        self.oppo_templates
    }

    /// Resolve a handle
    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.conn.as_ref())
    }

    /// Resolve a handle mutably
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.conn.as_mut())
    }

    /// Handles in registry order (most recently used first)
    pub fn ids(&self) -> Vec<ConnId> {
        self.order.clone()
    }

    /// Connections in registry order
    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection)> + '_ {
        self.order
            .iter()
            .filter_map(move |id| self.get(*id).map(|c| (*id, c)))
    }

    /// Connections waiting for an interface
    pub fn unoriented(&self) -> &[ConnId] {
        &self.unoriented
    }

    /// Host pairs, most recently matched first
    pub fn host_pairs(&self) -> &[HostPair] {
        &self.host_pairs
    }

    /// Resolve a host pair
    pub fn host_pair(&self, id: HostPairId) -> Option<&HostPair> {
        self.host_pairs.iter().find(|hp| hp.id == id)
    }

    /// Resolve a host pair mutably
    pub fn host_pair_mut(&mut self, id: HostPairId) -> Option<&mut HostPair> {
        self.host_pairs.iter_mut().find(|hp| hp.id == id)
    }

    fn insert(&mut self, conn: Connection) -> ConnId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.conn = Some(conn);
                ConnId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    conn: Some(conn),
                });
                ConnId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.order.insert(0, id);
        id
    }

    /// Find a connection by name, moving it to the front
    ///
    /// With `strict`, instances are not considered.
    pub fn find_by_name(&mut self, name: &str, strict: bool) -> Option<ConnId> {
        let pos = self.order.iter().position(|id| {
            self.get(*id)
                .map_or(false, |c| c.name == name && (!strict || !c.kind.is_instance()))
        })?;
        let id = self.order.remove(pos);
        self.order.insert(0, id);
        Some(id)
    }

    /// Like `find_by_name` in strict mode, with the operator diagnostic
    pub fn con_by_name(&mut self, name: &str) -> Result<ConnId> {
        self.find_by_name(name, true).ok_or_else(|| {
            Error::Refused(
                RcCode::UnknownName,
                format!("no connection named \"{}\"", name),
            )
        })
    }

    /// Find the host pair for an address pair, moving it to the front
    ///
    /// `him` of `None` looks for the wildcard peer of `me`'s family.
    pub fn find_host_pair(
        &mut self,
        me: &IpAddr,
        my_port: u16,
        him: Option<&IpAddr>,
        his_port: u16,
    ) -> Option<HostPairId> {
        let any = Subnet::all(me).addr();
        let him = him.copied().unwrap_or(any);
        let pos = self
            .host_pairs
            .iter()
            .position(|hp| hp.matches(me, my_port, &him, his_port))?;
        let hp = self.host_pairs.remove(pos);
        let id = hp.id;
        self.host_pairs.insert(0, hp);
        Some(id)
    }

    /// Connections of the matching host pair, newest first
    pub fn find_host_pair_connections(
        &mut self,
        me: &IpAddr,
        my_port: u16,
        him: Option<&IpAddr>,
        his_port: u16,
    ) -> Vec<ConnId> {
        self.find_host_pair(me, my_port, him, his_port)
            .and_then(|id| self.host_pair(id))
            .map(|hp| hp.connections.clone())
            .unwrap_or_default()
    }

    fn connect_to_host_pair(&mut self, id: ConnId) {
        let Some(c) = self.get(id) else { return };
        if !c.oriented() {
            self.unoriented.insert(0, id);
            if let Some(c) = self.get_mut(id) {
                c.host_pair = None;
            }
            return;
        }
        let (me, him) = (
            HostEnd {
                addr: c.this.host_addr,
                port: c.this.host_port,
                port_specific: c.this.host_port_specific,
            },
            HostEnd {
                addr: c.that.host_addr,
                port: c.that.host_port,
                port_specific: c.that.host_port_specific,
            },
        );
        let hp_id = match self.find_host_pair(&me.addr, me.port, Some(&him.addr), him.port) {
            Some(hp_id) => hp_id,
            None => {
                self.next_host_pair += 1;
                let hp_id = HostPairId(self.next_host_pair);
                self.host_pairs.insert(
                    0,
                    HostPair {
                        id: hp_id,
                        me,
                        him,
                        initial_connection_sent: false,
                        connections: Vec::new(),
                        pending: Vec::new(),
                    },
                );
                hp_id
            }
        };
        if let Some(hp) = self.host_pair_mut(hp_id) {
            hp.connections.insert(0, id);
        }
        if let Some(c) = self.get_mut(id) {
            c.host_pair = Some(hp_id);
        }
    }

    fn disconnect_from_host_pair(&mut self, id: ConnId) {
        let hp_id = self.get(id).and_then(|c| c.host_pair);
        match hp_id {
            None => self.unoriented.retain(|c| *c != id),
            Some(hp_id) => {
                let mut remove = false;
                if let Some(hp) = self.host_pair_mut(hp_id) {
                    hp.connections.retain(|c| *c != id);
                    // a pair nobody contacted may have been created by a flood of instances
                    remove = hp.connections.is_empty()
                        && !hp.initial_connection_sent
                        && hp.pending.is_empty();
                }
                if remove {
                    self.host_pairs.retain(|hp| hp.id != hp_id);
                }
                if let Some(c) = self.get_mut(id) {
                    c.host_pair = None;
                }
            }
        }
    }

    fn check_connection_end(
        &mut self,
        cfg: &ConnectionConfig,
        this: &crate::config::EndConfig,
        that: &crate::config::EndConfig,
    ) -> Result<()> {
        let family = |a: &IpAddr| a.is_ipv4();
        let this_client = this.client.map(|s| s.addr()).unwrap_or(this.host);
        let that_client = that.client.map(|s| s.addr()).unwrap_or(that.host);
        if family(&this.host) != family(&that.host) || family(&this_client) != family(&that_client)
        {
            return Err(Error::Refused(
                RcCode::Clash,
                "address family inconsistency in connection".into(),
            ));
        }
        if that.is_any() {
            if this.is_any() {
                return Err(Error::Refused(
                    RcCode::Orient,
                    "connection must specify host IP address for our side".into(),
                ));
            }
            if !cfg.policy.contains(Policy::AGGRESSIVE) {
                // road warriors share one responder; the auth method must be known before the peer is
                let others =
                    self.find_host_pair_connections(&this.host, this.host_port, None, that.host_port);
                for d in others {
                    let Some(d) = self.get(d) else { continue };
                    if d.policy.contains(Policy::AGGRESSIVE) {
                        continue;
                    }
                    if (d.policy.bits() ^ cfg.policy.bits()) & Policy::ISAKMP_MASK != 0 {
                        return Err(Error::Refused(
                            RcCode::Clash,
                            format!(
                                "authentication method disagrees with \"{}\", which is also for an unspecified peer",
                                d.name
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Add a connection definition and orient it to `interfaces`
    pub fn add(
        &mut self,
        cfg: &ConnectionConfig,
        interfaces: &[IpAddr],
        log: &mut WhackLog,
    ) -> Result<ConnId> {
        if self.find_by_name(&cfg.name, false).is_some() {
            return Err(Error::Refused(
                RcCode::DupName,
                format!("attempt to redefine connection \"{}\"", cfg.name),
            ));
        }
        if cfg.policy.never_negotiate() {
            return Err(Error::Refused(
                RcCode::Clash,
                "must specify --rsasig or --psk for a connection".into(),
            ));
        }
        if cfg.left.protocol != cfg.right.protocol {
            return Err(Error::Refused(
                RcCode::Clash,
                "the protocol must be the same for leftport and rightport".into(),
            ));
        }
        self.check_connection_end(cfg, &cfg.right, &cfg.left)?;
        self.check_connection_end(cfg, &cfg.left, &cfg.right)?;
        cfg.validate()
            .map_err(|e| Error::Refused(RcCode::Clash, e.to_string()))?;

        let mut c = Connection::from_config(cfg);
        c.this.default_end();
        c.that.default_end();
        // any wildcard host goes to the peer side
        if c.this.host_is_any() || c.this.has_client_wildcard {
            std::mem::swap(&mut c.this, &mut c.that);
        }
        c.kind = if c.that.host_is_any() || c.that.has_client_wildcard {
            ConnKind::Template
        } else {
            ConnKind::Permanent
        };
        let is_oppo_template = c.kind == ConnKind::Template && c.policy.contains(Policy::OPPO);
        let id = self.insert(c);
        self.orient(id, interfaces, log);
        self.connect_to_host_pair(id);
        if is_oppo_template {
            self.oppo_templates += 1;
        }
        info!(connection = %cfg.name, "added connection description \"{}\"", cfg.name);
        if let Some(c) = self.get(id) {
            debug!(
                "{}...{} ike_life: {}s; ipsec_life: {}s; rekey_margin: {}s; rekey_fuzz: {}%; keyingtries: {}; policy: {}",
                c.this.format(true),
                c.that.format(false),
                c.ike_lifetime.as_secs(),
                c.ipsec_lifetime.as_secs(),
                c.rekey_margin.as_secs(),
                c.rekey_fuzz,
                c.keying_tries,
                c.policy
            );
        }
        Ok(id)
    }

    /// Remove a connection from every index
    ///
    /// The caller has already released its states and pending requests.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        self.get(id)?;
        self.disconnect_from_host_pair(id);
        self.order.retain(|c| *c != id);
        let slot = self.slots.get_mut(id.index as usize)?;
        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        if conn.kind == ConnKind::Template && conn.policy.contains(Policy::OPPO) {
            self.oppo_templates = self.oppo_templates.saturating_sub(1);
        }
        Some(conn)
    }

    /// Orient a connection: exactly one end must be one of our interfaces
    ///
    /// Ends are swapped so that `this` is local.
    pub fn orient(&mut self, id: ConnId, interfaces: &[IpAddr], log: &mut WhackLog) -> bool {
        let Some(c) = self.get_mut(id) else {
            return false;
        };
        if c.oriented() {
            return true;
        }
        for iface in interfaces {
            loop {
                if c.this.host_addr == *iface {
                    if let Some(current) = c.interface {
                        let text = if current == *iface {
                            format!("both sides of \"{}\" are our interface {}!", c.name, iface)
                        } else {
                            format!(
                                "two interfaces match \"{}\" ({}, {})",
                                c.name, current, iface
                            )
                        };
                        warn!(connection = %c.name, "{}", text);
                        log.push(RcCode::LogSerious, text);
                        c.interface = None;
                        return false;
                    }
                    c.interface = Some(*iface);
                }
                if c.that.host_addr != *iface {
                    break;
                }
                std::mem::swap(&mut c.this, &mut c.that);
            }
        }
        c.oriented()
    }

    /// Re-orient after interfaces changed
    ///
    /// Unoriented connections get another chance; connections whose peer
    /// address became one of the `added` interfaces lose their orientation.
    pub fn check_orientations(&mut self, interfaces: &[IpAddr], added: &[IpAddr], log: &mut WhackLog) {
        let waiting = std::mem::take(&mut self.unoriented);
        for id in waiting {
            self.orient(id, interfaces, log);
            self.connect_to_host_pair(id);
        }

        for iface in added {
            let hps: Vec<HostPairId> = self
                .host_pairs
                .iter()
                .filter(|hp| hp.him.addr == *iface)
                .map(|hp| hp.id)
                .collect();
            for hp_id in hps {
                let conns = match self.host_pair_mut(hp_id) {
                    Some(hp) => std::mem::take(&mut hp.connections),
                    None => continue,
                };
                for id in conns {
                    if let Some(c) = self.get_mut(id) {
                        c.interface = None;
                        c.host_pair = None;
                    }
                    self.orient(id, interfaces, log);
                    self.connect_to_host_pair(id);
                }
            }
        }
    }

    /// Interface went away: its connections move back to the unoriented list
    ///
    /// Returns the connections that were moved; instances among them
    /// should be released by the caller.
    pub fn release_interface(&mut self, iface: &IpAddr) -> Vec<ConnId> {
        let affected: Vec<ConnId> = self
            .iter()
            .filter(|(_, c)| c.interface == Some(*iface))
            .map(|(id, _)| id)
            .collect();
        for id in &affected {
            self.disconnect_from_host_pair(*id);
            if let Some(c) = self.get_mut(*id) {
                c.interface = None;
            }
            self.unoriented.insert(0, *id);
        }
        affected
    }

    /// Copy a template for a concrete peer
    ///
    /// `his_id` must agree with any peer id the template already has.
    pub fn instantiate(
        &mut self,
        template: ConnId,
        him: IpAddr,
        his_id: Option<&Identity>,
    ) -> Result<ConnId> {
        let c = self
            .get_mut(template)
            .ok_or_else(|| Error::Internal("instantiating a stale connection".into()))?;
        if c.kind != ConnKind::Template {
            return Err(Error::InvalidState(format!(
                "\"{}\" is not a template",
                c.name
            )));
        }
        if let Some(his_id) = his_id {
            if !(c.that.id.is_none() || c.that.id.same_id(his_id)) {
                return Err(Error::InvalidParameter(format!(
                    "peer id {} conflicts with \"{}\"",
                    his_id, c.name
                )));
            }
        }
        if !c.oriented() {
            return Err(Error::InvalidState(format!(
                "template \"{}\" is not oriented",
                c.name
            )));
        }
        c.instance_serial += 1;
        let mut d = c.clone();
        if let Some(his_id) = his_id {
            d.that.id = his_id.clone();
        }
        if d.that.host_is_any() {
            d.kind = ConnKind::Instance;
            d.that.host_addr = him;
        } else {
            d.kind = ConnKind::InstanceNet;
        }
        d.that.default_end();
        d.this.default_end();
        d.routing = Routing::Unrouted;
        d.initiated = false;
        d.newest_isakmp_sa = SerialNo::NOBODY;
        d.newest_ipsec_sa = SerialNo::NOBODY;
        d.eroute_owner = SerialNo::NOBODY;
        d.host_pair = None;
        let id = self.insert(d);
        self.connect_to_host_pair(id);
        Ok(id)
    }

    /// Instantiate a road warrior template for the peer at `him`
    pub fn rw_instantiate(
        &mut self,
        template: ConnId,
        him: IpAddr,
        his_id: Option<&Identity>,
    ) -> Result<ConnId> {
        let id = self.instantiate(template, him, his_id)?;
        if let Some(d) = self.get(id) {
            debug!(connection = %d.name, "instantiated \"{}\" for {}", d.name, him);
        }
        Ok(id)
    }

    /// Instantiate an opportunistic template for one pair of clients
    pub fn oppo_instantiate(
        &mut self,
        template: ConnId,
        him: IpAddr,
        his_id: Option<&Identity>,
        our_client: IpAddr,
        peer_client: IpAddr,
    ) -> Result<ConnId> {
        {
            let c = self
                .get(template)
                .ok_or_else(|| Error::Internal("instantiating a stale connection".into()))?;
            let ours_ok = if c.this.has_client {
                c.this.client.contains_addr(&our_client)
            } else {
                c.this.host_addr == our_client
            };
            if !ours_ok {
                return Err(Error::InvalidParameter(format!(
                    "our client {} is not covered by \"{}\"",
                    our_client, c.name
                )));
            }
            if !(c.policy.contains(Policy::OPPO) && c.has_wildcard_client()) {
                return Err(Error::InvalidState(format!(
                    "\"{}\" is not an opportunistic template",
                    c.name
                )));
            }
        }
        let id = self.instantiate(template, him, his_id)?;
        if let Some(d) = self.get_mut(id) {
            if d.this.has_client {
                d.this.client = Subnet::from_host(our_client);
            }
            d.that.client = Subnet::from_host(peer_client);
            if peer_client == d.that.host_addr {
                d.that.has_client = false;
            }
            debug!(
                connection = %d.name,
                "instantiated \"{}\": {}...{}",
                d.name,
                d.this.format(true),
                d.that.format(false)
            );
        }
        Ok(id)
    }

    /// Queue a Quick Mode request on the connection's host pair
    pub fn add_pending(&mut self, pending: Pending) -> bool {
        let Some(c) = self.get(pending.connection) else {
            return false;
        };
        debug!(
            connection = %c.name,
            "Queuing pending Quick Mode with {} \"{}\"",
            c.that.host_addr,
            c.name
        );
        let Some(hp_id) = c.host_pair else {
            return false;
        };
        match self.host_pair_mut(hp_id) {
            Some(hp) => {
                hp.pending.insert(0, pending);
                true
            }
            None => false,
        }
    }

    /// Pending requests queued on the host pair of `conn`
    pub fn pending_of(&self, conn: ConnId) -> &[Pending] {
        self.get(conn)
            .and_then(|c| c.host_pair)
            .and_then(|hp| self.host_pair(hp))
            .map(|hp| hp.pending.as_slice())
            .unwrap_or(&[])
    }

    fn pending_vec_mut(&mut self, conn: ConnId) -> Option<&mut Vec<Pending>> {
        let hp_id = self.get(conn)?.host_pair?;
        self.host_pair_mut(hp_id).map(|hp| &mut hp.pending)
    }

    /// Detach every request waiting on `isakmp_sa` so it can be started
    pub fn unpend(&mut self, conn: ConnId, isakmp_sa: SerialNo, now: Instant) -> Vec<Pending> {
        let Some(pending) = self.pending_vec_mut(conn) else {
            return Vec::new();
        };
        let (mut ready, rest): (Vec<Pending>, Vec<Pending>) =
            pending.drain(..).partition(|p| p.isakmp_sa == isakmp_sa);
        *pending = rest;
        for p in &mut ready {
            p.pend_time = now;
        }
        ready
    }

    /// Stop telling operators about requests waiting on `isakmp_sa`
    ///
    /// Returns how many operators were waiting.
    pub fn release_pending_whacks(&mut self, conn: ConnId, isakmp_sa: SerialNo) -> usize {
        let Some(pending) = self.pending_vec_mut(conn) else {
            return 0;
        };
        let mut released = 0;
        for p in pending.iter_mut().filter(|p| p.isakmp_sa == isakmp_sa && p.whack) {
            p.whack = false;
            released += 1;
        }
        released
    }

    /// An ISAKMP SA was replaced; move its waiters to the new one
    pub fn update_pending(&mut self, conn: ConnId, old: SerialNo, new: SerialNo) {
        if let Some(pending) = self.pending_vec_mut(conn) {
            for p in pending.iter_mut().filter(|p| p.isakmp_sa == old) {
                p.isakmp_sa = new;
            }
        }
    }

    /// Phase 1 failed; drop everything waiting on it
    pub fn flush_pending_by_state(&mut self, conn: ConnId, isakmp_sa: SerialNo) -> Vec<Pending> {
        let Some(pending) = self.pending_vec_mut(conn) else {
            return Vec::new();
        };
        let (dropped, rest): (Vec<Pending>, Vec<Pending>) =
            pending.drain(..).partition(|p| p.isakmp_sa == isakmp_sa);
        *pending = rest;
        dropped
    }

    /// A connection is going away; drop its requests
    pub fn flush_pending_by_connection(&mut self, conn: ConnId) -> usize {
        let Some(pending) = self.pending_vec_mut(conn) else {
            return 0;
        };
        let before = pending.len();
        pending.retain(|p| p.connection != conn);
        before - pending.len()
    }

    /// Some pending request refers to `conn`
    pub fn pending_uses(&self, conn: ConnId) -> bool {
        self.pending_of(conn).iter().any(|p| p.connection == conn)
    }

    /// A request on this connection's host pair has waited more than
    /// three DPD timeouts
    pub fn pending_check_timeout(&self, conn: ConnId, now: Instant) -> bool {
        let Some(c) = self.get(conn) else {
            return false;
        };
        if c.dpd_timeout.is_zero() {
            return false;
        }
        debug!(connection = %c.name, "checking connection \"{}\" for stuck phase 2s", c.name);
        self.pending_of(conn)
            .iter()
            .any(|p| p.pend_time + c.dpd_timeout * 3 <= now)
    }

    /// Mark that we have contacted the peer of this connection's host pair
    pub fn note_initial_contact(&mut self, conn: ConnId) {
        if let Some(hp_id) = self.get(conn).and_then(|c| c.host_pair) {
            if let Some(hp) = self.host_pair_mut(hp_id) {
                hp.initial_connection_sent = true;
            }
        }
    }

    /// Connection with the largest routing serving the same peer client
    ///
    /// Returns the route owner (if any is routed) and the eroute owner,
    /// which must also share our client.
    pub fn route_owner(&self, c: ConnId) -> (Option<ConnId>, Option<ConnId>) {
        let Some(cc) = self.get(c) else {
            return (None, None);
        };
        let peer_client = cc.effective_peer_client();
        let (mut best_ro, mut best_ero) = (c, c);
        for (id, d) in self.iter() {
            if d.routing == Routing::Unrouted
                || d.effective_peer_client() != peer_client
                || d.that.protocol != cc.that.protocol
                || d.that.port != cc.that.port
            {
                continue;
            }
            let ro = self.get(best_ro).map_or(Routing::Unrouted, |b| b.routing);
            if d.routing > ro {
                best_ro = id;
            }
            let ero = self.get(best_ero).map_or(Routing::Unrouted, |b| b.routing);
            if d.routing < ero {
                continue;
            }
            if d.this.client != cc.this.client
                || d.this.protocol != cc.this.protocol
                || d.this.port != cc.this.port
            {
                continue;
            }
            best_ero = id;
        }
        let routed = |id: ConnId| {
            self.get(id)
                .filter(|c| c.routing.is_routed())
                .map(|_| id)
        };
        (routed(best_ro), routed(best_ero))
    }

    /// Status lines for every connection
    pub fn status_lines(&self) -> Vec<String> {
        self.iter().flat_map(|(_, c)| c.status_lines()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndConfig;

    fn addr(s: &str) -> IpAddr {
        s.parse().expect("valid address")
    }

    fn subnet(s: &str) -> Subnet {
        s.parse().expect("valid subnet")
    }

    fn ifaces() -> Vec<IpAddr> {
        vec![addr("192.0.2.1")]
    }

    fn permanent(name: &str) -> ConnectionConfig {
        ConnectionConfig::builder(name)
            .with_left(EndConfig::host(addr("192.0.2.1")).with_client(subnet("10.1.0.0/16")))
            .with_right(EndConfig::host(addr("198.51.100.2")).with_client(subnet("10.2.0.0/16")))
            .with_psk(b"secret".to_vec())
            .build()
            .expect("valid connection")
    }

    fn road_warrior(name: &str) -> ConnectionConfig {
        ConnectionConfig::builder(name)
            .with_left(EndConfig::any())
            .with_right(EndConfig::host(addr("192.0.2.1")).with_client(subnet("10.1.0.0/16")))
            .with_psk(b"secret".to_vec())
            .build()
            .expect("valid connection")
    }

    fn pending(conn: ConnId, sa: u64) -> Pending {
        Pending {
            whack: true,
            isakmp_sa: SerialNo(sa),
            connection: conn,
            policy: Policy::new(Policy::PSK | Policy::ENCRYPT),
            try_: 1,
            replacing: SerialNo::NOBODY,
            pend_time: Instant::now(),
        }
    }

    #[test]
    fn test_add_orients_permanent() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let id = reg.add(&permanent("net"), &ifaces(), &mut log).expect("Failed to add");
        let c = reg.get(id).expect("connection exists");
        assert_eq!(c.kind, ConnKind::Permanent);
        assert_eq!(c.interface, Some(addr("192.0.2.1")));
        assert_eq!(c.this.host_addr, addr("192.0.2.1"));
        assert_eq!(c.that.id, Identity::Addr(addr("198.51.100.2")));
        assert!(c.host_pair.is_some());
        assert_eq!(reg.host_pairs().len(), 1);
    }

    #[test]
    fn test_add_swaps_to_local_end() {
        let cfg = ConnectionConfig::builder("swap")
            .with_left(EndConfig::host(addr("198.51.100.2")))
            .with_right(EndConfig::host(addr("192.0.2.1")))
            .with_psk(b"secret".to_vec())
            .build()
            .expect("valid connection");
        let mut reg = ConnectionRegistry::new();
        let id = reg.add(&cfg, &ifaces(), &mut WhackLog::new()).expect("Failed to add");
        let c = reg.get(id).expect("connection exists");
        assert_eq!(c.this.host_addr, addr("192.0.2.1"));
        assert_eq!(c.that.host_addr, addr("198.51.100.2"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        reg.add(&permanent("net"), &ifaces(), &mut log).expect("Failed to add");
        match reg.add(&permanent("net"), &ifaces(), &mut log) {
            Err(Error::Refused(RcCode::DupName, text)) => {
                assert_eq!(text, "attempt to redefine connection \"net\"")
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_road_warrior_is_template() {
        let mut reg = ConnectionRegistry::new();
        let id = reg
            .add(&road_warrior("rw"), &ifaces(), &mut WhackLog::new())
            .expect("Failed to add");
        let c = reg.get(id).expect("connection exists");
        assert_eq!(c.kind, ConnKind::Template);
        assert!(c.that.host_is_any());
        assert!(c.oriented());
    }

    #[test]
    fn test_road_warrior_auth_must_agree() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        reg.add(&road_warrior("rw"), &ifaces(), &mut log).expect("Failed to add");
        let rsa = ConnectionConfig::builder("rw-rsa")
            .with_left(EndConfig::any())
            .with_right(EndConfig::host(addr("192.0.2.1")))
            .with_policy(Policy::new(Policy::RSASIG | Policy::ENCRYPT))
            .build()
            .expect("valid connection");
        match reg.add(&rsa, &ifaces(), &mut log) {
            Err(Error::Refused(RcCode::Clash, text)) => assert!(text.contains("\"rw\"")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_both_ends_local_not_oriented() {
        let cfg = ConnectionConfig::builder("loop")
            .with_left(EndConfig::host(addr("192.0.2.1")))
            .with_right(EndConfig::host(addr("192.0.2.1")))
            .with_psk(b"secret".to_vec())
            .build()
            .expect("valid connection");
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let id = reg.add(&cfg, &ifaces(), &mut log).expect("Failed to add");
        assert!(!reg.get(id).expect("connection exists").oriented());
        assert!(!reg.orient(id, &ifaces(), &mut log));
        assert!(log.lines()[0].text.contains("both sides of \"loop\""));
        assert_eq!(reg.unoriented(), &[id]);
    }

    #[test]
    fn test_two_interfaces_match() {
        let cfg = ConnectionConfig::builder("dual")
            .with_left(EndConfig::host(addr("192.0.2.1")))
            .with_right(EndConfig::host(addr("192.0.2.9")))
            .with_psk(b"secret".to_vec())
            .build()
            .expect("valid connection");
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let both = vec![addr("192.0.2.1"), addr("192.0.2.9")];
        let id = reg.add(&cfg, &both, &mut log).expect("Failed to add");
        assert!(!reg.get(id).expect("connection exists").oriented());
        assert!(log.lines()[0].text.starts_with("two interfaces match \"dual\""));
    }

    #[test]
    fn test_check_orientations_picks_up_new_interface() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let id = reg.add(&permanent("net"), &[], &mut log).expect("Failed to add");
        assert!(!reg.get(id).expect("connection exists").oriented());
        reg.check_orientations(&ifaces(), &ifaces(), &mut log);
        assert!(reg.get(id).expect("connection exists").oriented());
        assert!(reg.unoriented().is_empty());
    }

    #[test]
    fn test_find_by_name_moves_to_front() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let a = reg.add(&permanent("a"), &ifaces(), &mut log).expect("Failed to add");
        let b = reg.add(&road_warrior("b"), &ifaces(), &mut log).expect("Failed to add");
        assert_eq!(reg.ids(), vec![b, a]);
        assert_eq!(reg.find_by_name("a", true), Some(a));
        assert_eq!(reg.ids(), vec![a, b]);
        assert!(matches!(
            reg.con_by_name("missing"),
            Err(Error::Refused(RcCode::UnknownName, _))
        ));
    }

    #[test]
    fn test_instantiate_road_warrior() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let t = reg.add(&road_warrior("rw"), &ifaces(), &mut log).expect("Failed to add");
        let peer = addr("203.0.113.5");
        let i = reg.rw_instantiate(t, peer, None).expect("Failed to instantiate");
        let inst = reg.get(i).expect("instance exists");
        assert_eq!(inst.kind, ConnKind::Instance);
        assert_eq!(inst.instance_serial, 1);
        assert_eq!(inst.that.host_addr, peer);
        assert_eq!(inst.that.id, Identity::Addr(peer));
        assert!(inst.his_id_was_instantiated());
        assert_eq!(inst.fmt_instance(), "[1] 203.0.113.5");

        // strict lookup skips the instance
        assert_eq!(reg.find_by_name("rw", true), Some(t));
        assert!(reg.instantiate(i, peer, None).is_err());
    }

    #[test]
    fn test_instantiate_rejects_conflicting_id() {
        let cfg = ConnectionConfig::builder("rw")
            .with_left(EndConfig::any().with_id(Identity::Fqdn("road".into())))
            .with_right(EndConfig::host(addr("192.0.2.1")))
            .with_psk(b"secret".to_vec())
            .build()
            .expect("valid connection");
        let mut reg = ConnectionRegistry::new();
        let t = reg.add(&cfg, &ifaces(), &mut WhackLog::new()).expect("Failed to add");
        let other = Identity::Fqdn("other".into());
        assert!(reg.instantiate(t, addr("203.0.113.5"), Some(&other)).is_err());
    }

    #[test]
    fn test_remove_invalidates_handle() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let t = reg.add(&road_warrior("rw"), &ifaces(), &mut log).expect("Failed to add");
        let i = reg.rw_instantiate(t, addr("203.0.113.5"), None).expect("Failed to instantiate");
        let pairs = reg.host_pairs().len();
        assert!(reg.remove(i).is_some());
        assert!(reg.get(i).is_none());
        assert!(reg.get_mut(i).is_none());
        // the uncontacted pair of the instance is gone
        assert_eq!(reg.host_pairs().len(), pairs - 1);

        let again = reg.rw_instantiate(t, addr("203.0.113.6"), None).expect("Failed to instantiate");
        assert_ne!(again, i);
        assert!(reg.get(i).is_none());
    }

    #[test]
    fn test_find_host_pair_float_port() {
        let mut reg = ConnectionRegistry::new();
        reg.add(&permanent("net"), &ifaces(), &mut WhackLog::new())
            .expect("Failed to add");
        let me = addr("192.0.2.1");
        let him = addr("198.51.100.2");
        assert!(reg.find_host_pair(&me, 4500, Some(&him), 4500).is_some());
        assert!(reg.find_host_pair(&me, 500, None, 500).is_none());
    }

    #[test]
    fn test_pending_queue() {
        let mut reg = ConnectionRegistry::new();
        let id = reg
            .add(&permanent("net"), &ifaces(), &mut WhackLog::new())
            .expect("Failed to add");
        assert!(reg.add_pending(pending(id, 1)));
        assert!(reg.add_pending(pending(id, 2)));
        assert!(reg.pending_uses(id));

        assert_eq!(reg.release_pending_whacks(id, SerialNo(1)), 1);
        reg.update_pending(id, SerialNo(2), SerialNo(3));
        let ready = reg.unpend(id, SerialNo(1), Instant::now());
        assert_eq!(ready.len(), 1);
        assert!(!ready[0].whack);
        assert_eq!(reg.pending_of(id)[0].isakmp_sa, SerialNo(3));

        assert_eq!(reg.flush_pending_by_state(id, SerialNo(3)).len(), 1);
        assert!(!reg.pending_uses(id));
    }

    #[test]
    fn test_pending_timeout_needs_dpd() {
        let mut cfg = permanent("net");
        let mut reg = ConnectionRegistry::new();
        let id = reg.add(&cfg, &ifaces(), &mut WhackLog::new()).expect("Failed to add");
        let now = Instant::now();
        let mut p = pending(id, 1);
        p.pend_time = now;
        reg.add_pending(p.clone());
        assert!(!reg.pending_check_timeout(id, now + Duration::from_secs(3600)));

        cfg.name = "dpd".into();
        cfg.dpd_delay = Duration::from_secs(10);
        cfg.dpd_timeout = Duration::from_secs(30);
        let mut reg = ConnectionRegistry::new();
        let id = reg.add(&cfg, &ifaces(), &mut WhackLog::new()).expect("Failed to add");
        p.connection = id;
        reg.add_pending(p);
        assert!(!reg.pending_check_timeout(id, now + Duration::from_secs(89)));
        assert!(reg.pending_check_timeout(id, now + Duration::from_secs(90)));
    }

    #[test]
    fn test_status_lines() {
        let mut reg = ConnectionRegistry::new();
        reg.add(&permanent("net"), &ifaces(), &mut WhackLog::new())
            .expect("Failed to add");
        let lines = reg.status_lines();
        assert_eq!(
            lines[0],
            "\"net\": 10.1.0.0/16===192.0.2.1...198.51.100.2===10.2.0.0/16"
        );
        assert_eq!(
            lines[1],
            "\"net\":   ike_life: 3600s; ipsec_life: 28800s; rekey_margin: 540s; rekey_fuzz: 100%; keyingtries: 3"
        );
        assert_eq!(
            lines[2],
            "\"net\":   policy: PSK+ENCRYPT+TUNNEL; interface: 192.0.2.1; unrouted"
        );
    }

    #[test]
    fn test_route_owner() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let a = reg.add(&permanent("a"), &ifaces(), &mut log).expect("Failed to add");
        assert_eq!(reg.route_owner(a), (None, None));
        if let Some(c) = reg.get_mut(a) {
            c.routing = Routing::RoutedProspective;
        }
        assert_eq!(reg.route_owner(a), (Some(a), Some(a)));
    }
}
