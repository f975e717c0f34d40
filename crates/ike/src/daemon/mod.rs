//! The negotiation daemon
//!
//! [`IkeDaemon`] owns every table of the engine: connections, states, the
//! peer block list and the timer queue. It is driven by three inputs:
//!
//! - datagrams, through [`IkeDaemon::process_datagram`]
//! - time, through [`IkeDaemon::on_timer`]
//! - operator requests, through [`IkeDaemon::handle_whack`]
//!
//! Nothing in here touches a socket. Outgoing datagrams are queued and
//! collected with [`IkeDaemon::take_outgoing`]; [`crate::server::IkeServer`]
//! pumps them over UDP.
//!
//! # Example
//!
//! ```rust,no_run
//! use fynx_ike::{DaemonConfig, IkeDaemon, MemoryKernel};
//! use std::time::Instant;
//!
//! let config = DaemonConfig::builder()
//!     .with_interface("192.0.2.1".parse().unwrap())
//!     .build()
//!     .unwrap();
//! let mut daemon = IkeDaemon::new(config, Box::new(MemoryKernel::new())).unwrap();
//! daemon.listen(Instant::now());
//! ```

mod control;
mod events;

use crate::block::BlockList;
use crate::config::DaemonConfig;
use crate::connections::{ConnId, ConnKind, ConnectionRegistry, Routing};
use crate::demux::{MicrocodeIndex, MICROCODE_INDEX};
use crate::error::{Error, Result};
use crate::isakmp::{proto, ExchangeType, IsakmpHeader, PayloadType};
use crate::kernel::{KernelInterface, RouteSpec};
use crate::logging;
use crate::metrics::IkeMetrics;
use crate::nat::{self, FloatPacket, NAT_T_PORT};
use crate::state::{SerialNo, State, StateTable};
use crate::timer::{EventKind, TimerQueue};
use crate::whack::{WhackLine, WhackLog};
use fynx_platform::{FynxError, FynxResult, SecurityModule};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::{debug, info, trace};

/// A datagram waiting to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Local address and port to send from
    pub from: SocketAddr,
    /// Destination
    pub to: SocketAddr,
    /// Bytes for the wire, non-ESP marker included on the float port
    pub data: Vec<u8>,
}

/// IKEv1 negotiation engine
pub struct IkeDaemon {
    pub(crate) config: DaemonConfig,
    pub(crate) connections: ConnectionRegistry,
    pub(crate) states: StateTable,
    pub(crate) blocks: BlockList,
    pub(crate) timers: TimerQueue,
    pub(crate) kernel: Box<dyn KernelInterface>,
    pub(crate) metrics: IkeMetrics,
    pub(crate) microcode: MicrocodeIndex,
    pub(crate) outbox: Vec<Datagram>,
    pub(crate) whack: WhackLog,
    pub(crate) listening: bool,
    pub(crate) shutdown: bool,
}

impl fmt::Debug for IkeDaemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IkeDaemon")
            .field("interfaces", &self.config.interfaces)
            .field("connections", &self.connections.len())
            .field("states", &self.states.len())
            .field("blocked_peers", &self.blocks.len())
            .field("listening", &self.listening)
            .finish()
    }
}

impl IkeDaemon {
    /// Create a daemon over `kernel`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the state
    /// microcode is not ordered by state.
    pub fn new(config: DaemonConfig, kernel: Box<dyn KernelInterface>) -> Result<Self> {
        config.validate()?;
        let microcode = MICROCODE_INDEX.as_ref().map_err(Clone::clone)?.clone();
        let blocks = BlockList::new(config.block_ip_reject_num, config.block_ip_period);
        Ok(IkeDaemon {
            config,
            connections: ConnectionRegistry::new(),
            states: StateTable::new(),
            blocks,
            timers: TimerQueue::new(),
            kernel,
            metrics: IkeMetrics::new(),
            microcode,
            outbox: Vec::new(),
            whack: WhackLog::new(),
            listening: false,
            shutdown: false,
        })
    }

    /// Daemon configuration
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Connection registry
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// State table
    pub fn states(&self) -> &StateTable {
        &self.states
    }

    /// One state
    pub fn state(&self, serial: SerialNo) -> Option<&State> {
        self.states.get(serial)
    }

    /// Peer block list
    pub fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    /// Counters
    pub fn metrics(&self) -> &IkeMetrics {
        &self.metrics
    }

    /// The kernel the daemon installs SAs into
    pub fn kernel(&self) -> &dyn KernelInterface {
        self.kernel.as_ref()
    }

    /// Accepting IKE messages
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// An operator asked the daemon to stop
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// When [`IkeDaemon::on_timer`] should next be called
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Datagrams queued since the last call
    pub fn take_outgoing(&mut self) -> Vec<Datagram> {
        std::mem::take(&mut self.outbox)
    }

    /// Operator output produced by negotiations since the last call
    pub fn take_whack_lines(&mut self) -> Vec<WhackLine> {
        self.whack.take()
    }

    /// Feed one received datagram
    ///
    /// `to` is the local address and port it arrived on. Datagrams on the
    /// NAT-T float port carry a non-ESP marker before the ISAKMP message;
    /// keepalives and ESP on that port are not ours and are dropped.
    pub fn process_datagram(&mut self, from: SocketAddr, to: SocketAddr, data: &[u8], now: Instant) {
        if !self.listening {
            trace!(peer = %from, "not listening, dropping datagram");
            return;
        }
        if to.port() != NAT_T_PORT {
            self.process_packet(data.to_vec(), from, to, now);
            return;
        }
        match nat::decapsulate(data) {
            Ok(FloatPacket::Ike(msg)) => self.process_packet(msg.to_vec(), from, to, now),
            Ok(FloatPacket::Keepalive) => trace!(peer = %from, "NAT-T keepalive"),
            Ok(FloatPacket::Esp) => debug!(peer = %from, "ESP on the float port belongs to the kernel"),
            Err(e) => {
                self.metrics.record_packet_rejected();
                logging::log_packet_rejected(&from.to_string(), &e.to_string());
            }
        }
    }

    /// Queue a message for a peer, adding the non-ESP marker on the float port
    pub(crate) fn queue_datagram(&mut self, from: SocketAddr, to: SocketAddr, msg: &[u8]) {
        let data = if from.port() == NAT_T_PORT {
            nat::encapsulate(msg)
        } else {
            msg.to_vec()
        };
        let exchange = IsakmpHeader::from_bytes(msg)
            .ok()
            .and_then(|h| ExchangeType::from_u8(h.exchange_type))
            .map_or("ISAKMP_XCHG_NONE", ExchangeType::name);
        logging::log_message_send(exchange, &to.to_string(), data.len());
        self.outbox.push(Datagram { from, to, data });
    }

    /// (Re)send the last message of a state
    pub(crate) fn send_state_packet(&mut self, serial: SerialNo) {
        let Some(st) = self.states.get(serial) else {
            return;
        };
        if st.tpacket.is_empty() {
            return;
        }
        let from = SocketAddr::new(st.local_addr, st.local_port);
        let to = SocketAddr::new(st.peer_addr, st.peer_port);
        let msg = st.tpacket.clone();
        self.queue_datagram(from, to, &msg);
    }

    /// Connection name with instance suffix, for log lines
    pub(crate) fn conn_name(&self, conn: ConnId) -> String {
        self.connections
            .get(conn)
            .map(|c| format!("\"{}\"{}", c.name, c.fmt_instance()))
            .unwrap_or_else(|| "\"?\"".to_string())
    }

    /// Tell the operator waiting on a state, if any
    pub(crate) fn whack_state(&mut self, serial: SerialNo, rc: u16, text: impl Into<String>) {
        if let Some(st) = self.states.get(serial) {
            if st.whack_waiting {
                let text = format!("{} {}: {}", serial, self.conn_name(st.connection), text.into());
                self.whack.push_raw(rc, text);
            }
        }
    }

    /// Count a rejection against `ip` in the block list
    pub(crate) fn note_rejection(&mut self, ip: IpAddr, now: Instant) {
        let was_blocked = self.blocks.is_blocked(&ip);
        self.blocks.add(ip, now);
        if !was_blocked && self.blocks.is_blocked(&ip) {
            let count = self.blocks.get(&ip).map_or(0, |p| p.reject_num);
            logging::log_peer_blocked(&ip.to_string(), count);
            self.metrics.record_peer_blocked();
        }
    }

    /// Delete a state on operator request, telling the peer
    pub fn delete_state(&mut self, serial: SerialNo) -> bool {
        self.delete_state_with(serial, true, "operator request")
    }

    /// Delete a state
    ///
    /// With `notify` set an established SA is announced to the peer with a
    /// Delete payload first. Installed kernel SAs are removed, timers are
    /// cancelled and an instance connection left without states goes too.
    pub(crate) fn delete_state_with(&mut self, serial: SerialNo, notify: bool, reason: &str) -> bool {
        let Some(st) = self.states.get(serial) else {
            return false;
        };
        let (kind, conn, established) = (st.kind, st.connection, st.is_established());
        logging::log_state_deleted(serial.0, &self.conn_name(conn), kind.name(), reason);

        if notify && established {
            if let Err(e) = self.send_delete(serial) {
                debug!("not sending Delete for {}: {}", serial, e);
            }
        }
        if kind.is_quick() {
            self.remove_ipsec_sas(serial);
        }
        if let Some(st) = self.states.get(serial) {
            if let Some(cont) = &st.suspended {
                debug!("abandoning suspended {} of {}", cont.reason, serial);
            }
        }
        if kind.is_phase1() {
            for p in self.connections.flush_pending_by_state(conn, serial) {
                debug!(
                    "dropping pending Quick Mode for {} of {}",
                    self.conn_name(p.connection),
                    serial
                );
            }
            if established {
                self.metrics.record_isakmp_sa_deleted();
            } else {
                self.metrics.record_phase1_failed();
            }
        } else if established {
            self.metrics.record_ipsec_sa_deleted();
        }

        if let Some(c) = self.connections.get_mut(conn) {
            if c.newest_isakmp_sa == serial {
                c.newest_isakmp_sa = SerialNo::NOBODY;
            }
            if c.newest_ipsec_sa == serial {
                c.newest_ipsec_sa = SerialNo::NOBODY;
            }
            if c.eroute_owner == serial {
                c.eroute_owner = SerialNo::NOBODY;
                if c.routing == Routing::RoutedTunnel {
                    c.routing = Routing::RoutedProspective;
                }
            }
        }
        self.timers.cancel_all(serial);
        self.states.remove(serial);
        self.discard_idle_instance(conn);
        true
    }

    /// Delete every state of a connection, newest first
    pub(crate) fn delete_states_by_connection(&mut self, conn: ConnId, notify: bool, reason: &str) {
        let mut serials = self.states.of_connection(conn);
        serials.sort_unstable_by(|a, b| b.cmp(a));
        for serial in serials {
            self.delete_state_with(serial, notify, reason);
        }
    }

    /// Remove the kernel SAs a Quick Mode state installed
    fn remove_ipsec_sas(&mut self, serial: SerialNo) {
        let Some(st) = self.states.get(serial) else {
            return;
        };
        let inbound = st.kind.is_ipsec_sa_established() || st.kind.is_only_inbound_ipsec_sa_established();
        let outbound = st.kind.is_ipsec_sa_established();
        let (local, peer) = (st.local_addr, st.peer_addr);
        let protos = [
            (proto::IPSEC_AH, st.ipsec.ah),
            (proto::IPSEC_ESP, st.ipsec.esp),
            (proto::IPCOMP, st.ipsec.ipcomp),
        ];
        for (protocol, info) in protos {
            let Some(info) = info else { continue };
            if inbound {
                match self.kernel.delete_sa(protocol, local, info.our_spi) {
                    Ok(()) => logging::log_kernel_sa("delete", proto::name(protocol), info.our_spi, true),
                    Err(e) => debug!("{}", e),
                }
            }
            if outbound {
                match self.kernel.delete_sa(protocol, peer, info.peer_spi) {
                    Ok(()) => logging::log_kernel_sa("delete", proto::name(protocol), info.peer_spi, false),
                    Err(e) => debug!("{}", e),
                }
            }
        }
    }

    /// An instance nobody uses any more is deleted
    pub(crate) fn discard_idle_instance(&mut self, conn: ConnId) {
        let Some(c) = self.connections.get(conn) else {
            return;
        };
        if !c.kind.is_instance()
            || c.kind == ConnKind::GoingAway
            || !self.states.of_connection(conn).is_empty()
            || self.connections.pending_uses(conn)
        {
            return;
        }
        self.delete_connection(conn, "instance no longer in use");
    }

    /// Delete a connection with everything hanging off it
    pub(crate) fn delete_connection(&mut self, conn: ConnId, reason: &str) {
        let Some(c) = self.connections.get_mut(conn) else {
            return;
        };
        let was_kind = c.kind;
        if was_kind.is_instance() {
            // keeps discard_idle_instance from recursing while states go
            c.kind = ConnKind::GoingAway;
        }
        let name = c.name.clone();
        let peer = c.that.host_addr;
        let routed = c.routing.is_routed();
        let route = route_spec(c);

        self.connections.flush_pending_by_connection(conn);
        let mut serials = self.states.of_connection(conn);
        serials.sort_unstable_by(|a, b| b.cmp(a));
        for serial in serials {
            self.delete_state_with(serial, true, reason);
        }
        if routed {
            if let Err(e) = self.kernel.unroute(&route) {
                debug!("{}", e);
            }
        }
        if was_kind != ConnKind::Template {
            self.blocks.del(&peer);
        }
        self.connections.remove(conn);
        info!(connection = %name, "deleting connection \"{}\": {}", name, reason);
    }

    /// Start listening for IKE messages and bring up connections marked up
    pub fn listen(&mut self, now: Instant) -> Vec<WhackLine> {
        self.handle_whack(
            crate::whack::WhackMessage::new().with(crate::whack::WhackCommand::Listen),
            now,
        )
    }

    /// Payload bodies of an outgoing Delete for `serial`
    pub(crate) fn delete_payloads(&self, serial: SerialNo) -> Vec<(PayloadType, Vec<u8>)> {
        use crate::isakmp::{DeletePayload, ISAKMP_DOI_IPSEC};
        let Some(st) = self.states.get(serial) else {
            return Vec::new();
        };
        if st.kind.is_phase1() {
            let mut spi = st.icookie.to_vec();
            spi.extend_from_slice(&st.rcookie);
            let d = DeletePayload {
                doi: ISAKMP_DOI_IPSEC,
                protocol_id: proto::ISAKMP,
                spi_size: 16,
                spis: vec![spi],
            };
            return vec![(PayloadType::D, d.to_bytes())];
        }
        [
            (proto::IPSEC_AH, st.ipsec.ah),
            (proto::IPSEC_ESP, st.ipsec.esp),
        ]
        .into_iter()
        .filter_map(|(protocol, info)| {
            let info = info?;
            let d = DeletePayload {
                doi: ISAKMP_DOI_IPSEC,
                protocol_id: protocol,
                spi_size: 4,
                spis: vec![info.our_spi.to_be_bytes().to_vec()],
            };
            Some((PayloadType::D, d.to_bytes()))
        })
        .collect()
    }

    /// Announce the deletion of an established SA to the peer
    fn send_delete(&mut self, serial: SerialNo) -> Result<()> {
        let p1 = self
            .established_isakmp_sa(serial)
            .ok_or_else(|| Error::SaNotFound(format!("no ISAKMP SA to delete {} under", serial)))?;
        let payloads = self.delete_payloads(serial);
        if payloads.is_empty() {
            return Ok(());
        }
        self.send_informational(p1, &payloads)
    }

    /// Established ISAKMP SA that can protect messages about `serial`
    pub(crate) fn established_isakmp_sa(&self, serial: SerialNo) -> Option<SerialNo> {
        let st = self.states.get(serial)?;
        if st.kind.is_isakmp_sa_established() {
            return Some(serial);
        }
        let usable = |s: SerialNo| {
            self.states
                .get(s)
                .filter(|p| p.kind.is_isakmp_sa_established())
                .map(|_| s)
        };
        usable(st.clonedfrom).or_else(|| {
            self.connections
                .get(st.connection)
                .and_then(|c| usable(c.newest_isakmp_sa))
        })
    }

    /// Schedule a state-bound event
    pub(crate) fn schedule(&mut self, kind: EventKind, serial: SerialNo, delay: std::time::Duration, now: Instant) {
        self.timers.schedule(kind, serial, delay, now);
    }
}

/// Kernel route for a connection's clients
pub(crate) fn route_spec(c: &crate::connections::Connection) -> RouteSpec {
    RouteSpec {
        connection: format!("{}{}", c.name, c.fmt_instance()),
        our_client: c.this.client.to_string(),
        peer_client: c.that.client.to_string(),
    }
}

impl SecurityModule for IkeDaemon {
    fn id(&self) -> &'static str {
        "ike"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &'static str {
        "IKEv1 (ISAKMP/Oakley) keying daemon"
    }

    fn init(&mut self) -> FynxResult<()> {
        self.config.validate().map_err(FynxError::from)
    }

    fn shutdown(&mut self) -> FynxResult<()> {
        let mut serials = self.states.serials();
        serials.sort_unstable_by(|a, b| b.cmp(a));
        for serial in serials {
            self.delete_state_with(serial, true, "shutting down");
        }
        self.listening = false;
        self.shutdown = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, EndConfig};
    use crate::kernel::MemoryKernel;
    use crate::whack::{WhackCommand, WhackMessage};

    fn daemon() -> IkeDaemon {
        let config = DaemonConfig::builder()
            .with_interface("192.0.2.1".parse().expect("valid address"))
            .build()
            .expect("valid config");
        IkeDaemon::new(config, Box::new(MemoryKernel::new())).expect("daemon created")
    }

    #[test]
    fn test_new_requires_interface() {
        let err = IkeDaemon::new(DaemonConfig::default(), Box::new(MemoryKernel::new()))
            .expect_err("no interface configured");
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_drops_datagrams_until_listening() {
        let mut d = daemon();
        let from: SocketAddr = "198.51.100.7:500".parse().expect("valid address");
        let to: SocketAddr = "192.0.2.1:500".parse().expect("valid address");
        d.process_datagram(from, to, &[0u8; 28], Instant::now());
        assert_eq!(d.metrics().snapshot().packets_received, 0);

        d.listen(Instant::now());
        assert!(d.is_listening());
        d.process_datagram(from, to, &[0u8; 28], Instant::now());
        assert_eq!(d.metrics().snapshot().packets_received, 1);
    }

    #[test]
    fn test_float_port_keepalive_is_dropped() {
        let mut d = daemon();
        d.listen(Instant::now());
        let from: SocketAddr = "198.51.100.7:4500".parse().expect("valid address");
        let to: SocketAddr = "192.0.2.1:4500".parse().expect("valid address");
        d.process_datagram(from, to, &nat::KEEPALIVE_PACKET, Instant::now());
        assert_eq!(d.metrics().snapshot().packets_received, 0);
        assert!(d.take_outgoing().is_empty());
    }

    #[test]
    fn test_security_module_shutdown() {
        let mut d = daemon();
        assert_eq!(d.id(), "ike");
        assert!(d.init().is_ok());
        d.shutdown().expect("shutdown succeeds");
        assert!(d.is_shutdown());
        assert!(!d.is_listening());
    }

    #[test]
    fn test_delete_connection_clears_block_entry() {
        let mut d = daemon();
        let cfg = ConnectionConfig::builder("peer")
            .with_left(EndConfig::host("192.0.2.1".parse().expect("valid address")))
            .with_right(EndConfig::host("198.51.100.7".parse().expect("valid address")))
            .with_psk(b"secret".to_vec())
            .build()
            .expect("valid connection");
        let now = Instant::now();
        d.handle_whack(WhackMessage::new().with(WhackCommand::AddConnection(cfg)), now);
        d.blocks.set(1, std::time::Duration::from_secs(60));
        let peer: IpAddr = "198.51.100.7".parse().expect("valid address");
        d.note_rejection(peer, now);
        assert!(d.blocks().is_blocked(&peer));

        let lines = d.handle_whack(
            WhackMessage::new().with(WhackCommand::DeleteConnection("peer".into())),
            now,
        );
        assert!(lines.iter().all(|l| l.rc != crate::whack::RcCode::UnknownName.code()));
        assert!(!d.blocks().is_blocked(&peer));
        assert!(d.connections().is_empty());
    }
}
