//! Connection lookups used while negotiating
//!
//! Phase 1 starts from the host pair of the packet's addresses and may
//! switch to a better connection once the peer's identity is known.
//! Phase 2 switches again once the proposed client subnets are known.

use super::{ConnId, ConnKind, Connection, ConnectionRegistry, Identity, Subnet};
use crate::config::IKE_UDP_PORT;
use crate::policy::Policy;
use crate::state::SerialNo;
use std::net::IpAddr;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Client traffic a Quick Mode negotiation proposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientQuery {
    /// Our client subnet
    pub our_net: Subnet,
    /// Peer client subnet
    pub peer_net: Subnet,
    /// Our transport protocol
    pub our_protocol: u8,
    /// Our transport port
    pub our_port: u16,
    /// Peer transport protocol
    pub peer_protocol: u8,
    /// Peer transport port
    pub peer_port: u16,
}

impl ClientQuery {
    /// Query for two subnets with any protocol and port
    pub fn new(our_net: Subnet, peer_net: Subnet) -> Self {
        ClientQuery {
            our_net,
            peer_net,
            our_protocol: 0,
            our_port: 0,
            peer_protocol: 0,
            peer_port: 0,
        }
    }
}

fn same_peer_ids(c: &Connection, d: &Connection, peer_id: Option<&Identity>) -> bool {
    c.this.id.same_id(&d.this.id) && peer_id.unwrap_or(&c.that.id).same_id(&d.that.id)
}

fn same_psk(a: Option<&[u8]>, b: Option<&[u8]>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.len() == b.len() && bool::from(a.ct_eq(b)),
        (None, None) => true,
        _ => false,
    }
}

impl ConnectionRegistry {
    /// First connection of the host pair that allows every bit of `policy`
    ///
    /// `him` of `None` looks among the connections for any peer.
    pub fn find_host_connection(
        &mut self,
        me: &IpAddr,
        my_port: u16,
        him: Option<&IpAddr>,
        his_port: u16,
        policy: Policy,
    ) -> Option<ConnId> {
        self.find_host_pair_connections(me, my_port, him, his_port)
            .into_iter()
            .find(|id| {
                self.get(*id)
                    .map_or(false, |c| policy.bits() == 0 || c.policy.contains(policy.bits()))
            })
    }

    /// Pick the connection that best fits the peer's phase 1 identity
    ///
    /// `auth` is the authentication method bit negotiated for the ISAKMP SA.
    /// The connection must authenticate with the secret already used in
    /// the exchange. Returns `None` when no connection fits.
    pub fn refine_host_connection(
        &mut self,
        c: ConnId,
        peer_id: &Identity,
        initiator: bool,
        aggrmode: bool,
        auth: u32,
    ) -> Option<ConnId> {
        let cur = self.get(c)?;
        if cur.that.id.same_id(peer_id) {
            return Some(c);
        }
        let psk = if auth & Policy::PSK != 0 {
            Some(cur.psk()?.to_vec())
        } else {
            // no private keys are held, signatures cannot switch connections
            return None;
        };
        let this_id = cur.this.id.clone();
        let (me, my_port, his_port) = (cur.this.host_addr, cur.this.host_port, cur.that.host_port);

        let mut candidates = self
            .get(c)
            .and_then(|c| c.host_pair)
            .and_then(|hp| self.host_pair(hp))
            .map(|hp| hp.connections.clone())
            .unwrap_or_default();
        let mut wcpip = false;
        let mut best = None;
        loop {
            for id in &candidates {
                let Some(d) = self.get(*id) else { continue };
                let exact = peer_id.same_id(&d.that.id);
                if !exact && !(wcpip && d.that.id.is_none()) {
                    continue;
                }
                if initiator && !this_id.same_id(&d.this.id) {
                    continue;
                }
                if !d.policy.intersects(auth) {
                    continue;
                }
                if d.policy.contains(Policy::AGGRESSIVE) != aggrmode {
                    continue;
                }
                if !same_psk(psk.as_deref(), d.psk()) {
                    continue;
                }
                if exact {
                    debug!(connection = %d.name, "refined to \"{}\" for peer {}", d.name, peer_id);
                    return Some(*id);
                }
                best = Some(*id);
            }
            if wcpip {
                return best;
            }
            wcpip = true;
            candidates = self.find_host_pair_connections(&me, my_port, None, his_port);
        }
    }

    fn fc_try(
        &self,
        c: &Connection,
        candidates: &[ConnId],
        peer_id: Option<&Identity>,
        query: &ClientQuery,
        oppo: bool,
    ) -> Option<ConnId> {
        let peer_net_is_host =
            query.peer_net.is_host() && query.peer_net.contains_addr(&c.that.host_addr);
        let mut unrouted = None;
        for id in candidates {
            let Some(d) = self.get(*id) else { continue };
            if !same_peer_ids(c, d, peer_id) {
                continue;
            }
            if d.this.protocol != query.our_protocol
                || d.this.port != query.our_port
                || d.that.protocol != query.peer_protocol
                || d.that.port != query.peer_port
            {
                continue;
            }
            if oppo {
                if !(d.this.client.contains_subnet(&query.our_net) && d.has_wildcard_client()) {
                    continue;
                }
            } else {
                if d.this.client != query.our_net {
                    continue;
                }
                if d.that.has_client {
                    let fits = if d.that.has_client_wildcard {
                        d.that.client.contains_subnet(&query.peer_net)
                    } else {
                        d.that.client == query.peer_net
                    };
                    if !fits {
                        continue;
                    }
                } else if !peer_net_is_host {
                    continue;
                }
            }
            if d.routing.is_routed() {
                return Some(*id);
            }
            if unrouted.is_none() {
                unrouted = Some(*id);
            }
        }
        unrouted
    }

    /// Find the connection for the client subnets of a Quick Mode proposal
    ///
    /// `c` is the connection of the ISAKMP SA. A routed connection wins
    /// over an unrouted one; templates for the same peer are tried last.
    pub fn find_client_connection(&mut self, c: ConnId, query: &ClientQuery) -> Option<ConnId> {
        let cur = self.get(c)?.clone();
        let mut unrouted = None;
        if cur.this.client == query.our_net
            && cur.that.client == query.peer_net
            && cur.this.protocol == query.our_protocol
            && cur.this.port == query.our_port
            && cur.that.protocol == query.peer_protocol
            && cur.that.port == query.peer_port
        {
            if cur.routing.is_routed() {
                return Some(c);
            }
            unrouted = Some(c);
        }

        let own = cur
            .host_pair
            .and_then(|hp| self.host_pair(hp))
            .map(|hp| hp.connections.clone())
            .unwrap_or_default();
        if let Some(d) = self.fc_try(&cur, &own, None, query, false).or(unrouted) {
            return Some(d);
        }

        let wild = self.find_host_pair_connections(
            &cur.this.host_addr,
            cur.this.host_port,
            None,
            cur.that.host_port,
        );
        if wild.is_empty() {
            return None;
        }
        let none = Identity::None;
        let mut d = self.fc_try(&cur, &wild, None, query, false);
        if d.is_none() && cur.his_id_was_instantiated() {
            d = self.fc_try(&cur, &wild, Some(&none), query, false);
        }
        if d.is_none() && query.our_net.is_host() && query.peer_net.is_host() {
            d = self.fc_try(&cur, &wild, Some(&none), query, true);
        }
        d
    }

    /// Routed connection whose clients cover a trapped packet
    ///
    /// Narrower client subnets beat wider ones; among equals, fewer
    /// protocol and port wildcards win. A connection that already has an
    /// SA is returned as soon as it is the best so far.
    pub fn find_connection_for_clients(
        &self,
        our_client: &IpAddr,
        our_port: u16,
        peer_client: &IpAddr,
        peer_port: u16,
        protocol: u8,
    ) -> Option<ConnId> {
        let mut best: Option<(ConnId, &Connection)> = None;
        let mut best_metric = 5u32;
        for (id, c) in self.iter() {
            if !(c.has_ipsec_policy()
                && c.routing.is_routed()
                && c.this.client.contains_addr(our_client)
                && c.that.client.contains_addr(peer_client)
                && (c.this.protocol == 0 || c.this.protocol == protocol)
                && (c.this.port == 0 || c.this.port == our_port)
                && (c.that.port == 0 || c.that.port == peer_port))
            {
                continue;
            }
            let metric = 2 * u32::from(c.this.port != our_port)
                + 2 * u32::from(c.that.port != peer_port)
                + u32::from(c.this.protocol != protocol);
            let take = match best {
                None => true,
                Some((_, b)) => {
                    b.routing < c.routing
                        || (b.routing == c.routing
                            && (!c.this.client.contains_subnet(&b.this.client)
                                || (b.this.client == c.this.client
                                    && (!c.that.client.contains_subnet(&b.that.client)
                                        || (b.that.client == c.that.client
                                            && metric < best_metric)))))
                }
            };
            if take {
                best = Some((id, c));
                best_metric = metric;
                if c.newest_isakmp_sa != SerialNo::NOBODY || c.newest_ipsec_sa != SerialNo::NOBODY {
                    return Some(id);
                }
            }
        }
        best.map(|(id, _)| id)
    }

    /// Instantiate the narrowest opportunistic template covering `our_client`
    ///
    /// The template must be on the wildcard host pair of one of `interfaces`.
    pub fn build_outgoing_opportunistic(
        &mut self,
        interfaces: &[IpAddr],
        gateway: IpAddr,
        our_client: IpAddr,
        peer_client: IpAddr,
    ) -> Option<ConnId> {
        let mut best: Option<ConnId> = None;
        for iface in interfaces {
            let conns = self.find_host_pair_connections(iface, IKE_UDP_PORT, None, IKE_UDP_PORT);
            for id in conns {
                let Some(c) = self.get(id) else { continue };
                if c.kind != ConnKind::Template
                    || !c.this.client.contains_addr(&our_client)
                    || !c.policy.contains(Policy::OPPO)
                    || !c.has_ipsec_policy()
                {
                    continue;
                }
                let narrower = match best.and_then(|b| self.get(b)) {
                    None => true,
                    Some(b) => !c.this.client.contains_subnet(&b.this.client),
                };
                if narrower {
                    best = Some(id);
                }
            }
        }
        let template = best?;
        self.oppo_instantiate(template, gateway, None, our_client, peer_client)
            .map_err(|e| debug!("opportunistic instantiation failed: {}", e))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, EndConfig};
    use crate::connections::Routing;
    use crate::whack::WhackLog;

    fn addr(s: &str) -> IpAddr {
        s.parse().expect("valid address")
    }

    fn subnet(s: &str) -> Subnet {
        s.parse().expect("valid subnet")
    }

    fn ifaces() -> Vec<IpAddr> {
        vec![addr("192.0.2.1")]
    }

    fn net_to_net(name: &str, peer_net: &str, peer_id: Identity, psk: &[u8]) -> ConnectionConfig {
        ConnectionConfig::builder(name)
            .with_left(EndConfig::host(addr("192.0.2.1")).with_client(subnet("10.1.0.0/16")))
            .with_right(
                EndConfig::host(addr("198.51.100.2"))
                    .with_client(subnet(peer_net))
                    .with_id(peer_id),
            )
            .with_psk(psk.to_vec())
            .build()
            .expect("valid connection")
    }

    fn road_warrior(name: &str) -> ConnectionConfig {
        ConnectionConfig::builder(name)
            .with_left(EndConfig::host(addr("192.0.2.1")).with_client(subnet("10.1.0.0/16")))
            .with_right(EndConfig::any())
            .with_psk(b"secret".to_vec())
            .build()
            .expect("valid connection")
    }

    fn opportunistic(name: &str) -> ConnectionConfig {
        ConnectionConfig::builder(name)
            .with_left(EndConfig::host(addr("192.0.2.1")).with_client(subnet("10.1.0.0/16")))
            .with_right(EndConfig::any().with_client(subnet("0.0.0.0/32")))
            .with_policy(Policy::new(
                Policy::PSK | Policy::ENCRYPT | Policy::TUNNEL | Policy::OPPO,
            ))
            .with_psk(b"secret".to_vec())
            .build()
            .expect("valid connection")
    }

    fn fqdn(s: &str) -> Identity {
        Identity::Fqdn(s.into())
    }

    #[test]
    fn test_find_host_connection() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let a = reg
            .add(&net_to_net("a", "10.2.0.0/16", Identity::None, b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        let me = addr("192.0.2.1");
        let him = addr("198.51.100.2");
        assert_eq!(
            reg.find_host_connection(&me, 500, Some(&him), 500, Policy::new(Policy::PSK)),
            Some(a)
        );
        assert_eq!(
            reg.find_host_connection(&me, 500, Some(&him), 500, Policy::new(Policy::RSASIG)),
            None
        );
        assert_eq!(
            reg.find_host_connection(&me, 500, None, 500, Policy::default()),
            None
        );
    }

    #[test]
    fn test_refine_exact_id() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let a = reg
            .add(&net_to_net("a", "10.2.0.0/16", fqdn("a.example"), b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        let b = reg
            .add(&net_to_net("b", "10.3.0.0/16", fqdn("b.example"), b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        assert_eq!(
            reg.refine_host_connection(a, &fqdn("a.example"), false, false, Policy::PSK),
            Some(a)
        );
        assert_eq!(
            reg.refine_host_connection(a, &fqdn("b.example"), false, false, Policy::PSK),
            Some(b)
        );
        // aggressive mode only matches aggressive connections
        assert_eq!(
            reg.refine_host_connection(a, &fqdn("b.example"), false, true, Policy::PSK),
            None
        );
        assert_eq!(
            reg.refine_host_connection(a, &fqdn("b.example"), false, false, Policy::RSASIG),
            None
        );
    }

    #[test]
    fn test_refine_requires_same_secret() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let a = reg
            .add(&net_to_net("a", "10.2.0.0/16", fqdn("a.example"), b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        reg.add(&net_to_net("b", "10.3.0.0/16", fqdn("b.example"), b"other"), &ifaces(), &mut log)
            .expect("Failed to add");
        assert_eq!(
            reg.refine_host_connection(a, &fqdn("b.example"), false, false, Policy::PSK),
            None
        );
    }

    #[test]
    fn test_refine_falls_back_to_wildcard_peer() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let a = reg
            .add(&net_to_net("a", "10.2.0.0/16", fqdn("a.example"), b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        let rw = reg.add(&road_warrior("rw"), &ifaces(), &mut log).expect("Failed to add");
        assert_eq!(
            reg.refine_host_connection(a, &fqdn("road.example"), false, false, Policy::PSK),
            Some(rw)
        );
    }

    #[test]
    fn test_find_client_connection() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let a = reg
            .add(&net_to_net("a", "10.2.0.0/16", Identity::None, b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        let b = reg
            .add(&net_to_net("b", "10.3.0.0/16", Identity::None, b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        let ours = subnet("10.1.0.0/16");
        assert_eq!(
            reg.find_client_connection(a, &ClientQuery::new(ours, subnet("10.2.0.0/16"))),
            Some(a)
        );
        assert_eq!(
            reg.find_client_connection(a, &ClientQuery::new(ours, subnet("10.3.0.0/16"))),
            Some(b)
        );
        assert_eq!(
            reg.find_client_connection(a, &ClientQuery::new(ours, subnet("10.4.0.0/16"))),
            None
        );
    }

    #[test]
    fn test_find_client_connection_prefers_routed() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let a = reg
            .add(&net_to_net("a", "10.2.0.0/16", Identity::None, b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        let b = reg
            .add(&net_to_net("b", "10.2.0.0/16", Identity::None, b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        if let Some(c) = reg.get_mut(b) {
            c.routing = Routing::RoutedProspective;
        }
        let query = ClientQuery::new(subnet("10.1.0.0/16"), subnet("10.2.0.0/16"));
        assert_eq!(reg.find_client_connection(a, &query), Some(b));
    }

    #[test]
    fn test_find_connection_for_clients() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let a = reg
            .add(&net_to_net("a", "10.2.0.0/16", Identity::None, b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        let ours = addr("10.1.5.5");
        let peer = addr("10.2.5.5");
        assert_eq!(reg.find_connection_for_clients(&ours, 0, &peer, 0, 0), None);

        if let Some(c) = reg.get_mut(a) {
            c.routing = Routing::RoutedProspective;
        }
        assert_eq!(reg.find_connection_for_clients(&ours, 0, &peer, 0, 0), Some(a));
        assert_eq!(
            reg.find_connection_for_clients(&ours, 0, &addr("10.9.0.1"), 0, 0),
            None
        );
    }

    #[test]
    fn test_find_connection_for_clients_prefers_narrower() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let wide = reg
            .add(&net_to_net("wide", "10.0.0.0/8", Identity::None, b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        let narrow = reg
            .add(&net_to_net("narrow", "10.2.0.0/16", Identity::None, b"secret"), &ifaces(), &mut log)
            .expect("Failed to add");
        for id in [wide, narrow] {
            if let Some(c) = reg.get_mut(id) {
                c.routing = Routing::RoutedProspective;
            }
        }
        assert_eq!(
            reg.find_connection_for_clients(&addr("10.1.0.1"), 0, &addr("10.2.0.1"), 0, 0),
            Some(narrow)
        );
        assert_eq!(
            reg.find_connection_for_clients(&addr("10.1.0.1"), 0, &addr("10.3.0.1"), 0, 0),
            Some(wide)
        );
    }

    #[test]
    fn test_build_outgoing_opportunistic() {
        let mut reg = ConnectionRegistry::new();
        let mut log = WhackLog::new();
        let t = reg.add(&opportunistic("oe"), &ifaces(), &mut log).expect("Failed to add");
        assert_eq!(reg.oppo_templates(), 1);
        assert!(reg.get(t).expect("template exists").has_wildcard_client());

        let gw = addr("198.51.100.9");
        let id = reg
            .build_outgoing_opportunistic(&ifaces(), gw, addr("10.1.2.3"), gw)
            .expect("instance built");
        let c = reg.get(id).expect("instance exists");
        assert_eq!(c.kind, ConnKind::Instance);
        assert_eq!(c.that.host_addr, gw);
        assert_eq!(c.this.client, subnet("10.1.2.3/32"));
        assert!(!c.that.has_client);

        assert!(reg
            .build_outgoing_opportunistic(&ifaces(), gw, addr("172.16.0.1"), gw)
            .is_none());
    }
}
