//! Operator requests

use super::{route_spec, IkeDaemon};
use crate::config::PENDING_PHASE2_INTERVAL;
use crate::connections::{ConnId, ConnKind, Pending, Routing};
use crate::error::{Error, Result};
use crate::policy::Policy;
use crate::state::SerialNo;
use crate::timer::EventKind;
use crate::whack::{RcCode, WhackCommand, WhackLine, WhackMessage};
use fynx_platform::SecurityModule;
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

impl IkeDaemon {
    /// Run every command of an operator request
    ///
    /// Commands run in their canonical order (deletes before adds, adds
    /// before initiates). A refused command is reported and the rest still
    /// run. The returned lines include what negotiations started here
    /// reported so far.
    pub fn handle_whack(&mut self, msg: WhackMessage, now: Instant) -> Vec<WhackLine> {
        for cmd in msg.ordered() {
            if let Err(e) = self.run_command(cmd, now) {
                match e {
                    Error::Refused(rc, text) => self.whack.push(rc, text),
                    other => {
                        warn!("whack request failed: {}", other);
                        self.whack.push(RcCode::InternalErr, other.to_string());
                    }
                }
            }
        }
        self.whack.take()
    }

    fn run_command(&mut self, cmd: &WhackCommand, now: Instant) -> Result<()> {
        match cmd {
            WhackCommand::DeleteConnection(name) => self.whack_delete_connection(name),
            WhackCommand::DeleteState(serial) => {
                if !self.delete_state(*serial) {
                    return Err(Error::Refused(
                        RcCode::UnknownName,
                        format!("no state {}", serial),
                    ));
                }
                Ok(())
            }
            WhackCommand::DeleteInstance { name, instance } => {
                let found = self
                    .connections
                    .iter()
                    .find(|(_, c)| c.name == *name && c.kind.is_instance() && c.instance_serial == *instance)
                    .map(|(id, _)| id);
                match found {
                    Some(id) => {
                        self.delete_connection(id, "deleted by operator");
                        Ok(())
                    }
                    None => Err(Error::Refused(
                        RcCode::UnknownName,
                        format!("no instance [{}] of \"{}\"", instance, name),
                    )),
                }
            }
            WhackCommand::AddConnection(cfg) => {
                let interfaces = self.config.interfaces.clone();
                self.connections.add(cfg, &interfaces, &mut self.whack)?;
                Ok(())
            }
            WhackCommand::Listen => {
                self.start_listening(now);
                Ok(())
            }
            WhackCommand::Unlisten => {
                info!("no longer listening for IKE messages");
                self.listening = false;
                Ok(())
            }
            WhackCommand::Route(name) => {
                let id = self.connections.con_by_name(name)?;
                self.route_connection(id)
            }
            WhackCommand::Unroute(name) => {
                let id = self.connections.con_by_name(name)?;
                self.unroute_connection(id)
            }
            WhackCommand::Initiate { name, asynchronous } => {
                let id = self.connections.con_by_name(name)?;
                self.initiate_connection(id, !asynchronous, now).map(|_| ())
            }
            WhackCommand::OppoInitiate {
                our_client,
                peer_client,
                asynchronous,
            } => self.initiate_opportunistic(*our_client, *peer_client, !asynchronous, now),
            WhackCommand::Terminate(name) => self.terminate_connection(name),
            WhackCommand::Status => {
                self.show_status(now);
                Ok(())
            }
            WhackCommand::Shutdown => {
                info!("shutting down");
                SecurityModule::shutdown(self).map_err(|e| Error::Internal(e.to_string()))
            }
            WhackCommand::BlockIp { reject_num, period } => {
                self.blocks.set(*reject_num, *period);
                self.whack.push(
                    RcCode::Comment,
                    format!(
                        "block ip: reject_num {}, period {}s",
                        reject_num,
                        period.as_secs()
                    ),
                );
                Ok(())
            }
        }
    }

    /// Every connection (template, instances) with this name goes
    fn whack_delete_connection(&mut self, name: &str) -> Result<()> {
        let mut deleted = 0;
        while let Some(id) = self.connections.find_by_name(name, false) {
            self.delete_connection(id, "deleted by operator");
            deleted += 1;
        }
        if deleted == 0 {
            return Err(Error::Refused(
                RcCode::UnknownName,
                format!("no connection named \"{}\"", name),
            ));
        }
        Ok(())
    }

    fn start_listening(&mut self, now: Instant) {
        let interfaces = self.config.interfaces.clone();
        info!("listening for IKE messages");
        for iface in &interfaces {
            info!("adding interface {}:{}", iface, self.config.ike_port);
        }
        self.connections.check_orientations(&interfaces, &[], &mut self.whack);
        self.listening = true;
        self.timers
            .schedule_global(EventKind::PendingPhase2Check, PENDING_PHASE2_INTERVAL, now);

        let up: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.policy.contains(Policy::UP) && c.kind == ConnKind::Permanent && c.oriented())
            .map(|(id, _)| id)
            .collect();
        for id in up {
            if let Err(e) = self.initiate_connection(id, false, now) {
                warn!("cannot bring up {}: {}", self.conn_name(id), e);
            }
        }
    }

    fn route_connection(&mut self, id: ConnId) -> Result<()> {
        let c = self
            .connections
            .get_mut(id)
            .ok_or_else(|| Error::ConnectionNotFound(format!("{:?}", id)))?;
        if !c.oriented() {
            return Err(Error::Refused(
                RcCode::Orient,
                "we have no interface for either end of this connection".into(),
            ));
        }
        if c.routing.is_routed() {
            return Ok(());
        }
        let route = route_spec(c);
        self.kernel
            .route(&route)
            .map_err(|e| Error::Refused(RcCode::Route, format!("could not route: {}", e)))?;
        if let Some(c) = self.connections.get_mut(id) {
            c.routing = Routing::RoutedProspective;
        }
        debug!("{} routed", route.connection);
        Ok(())
    }

    fn unroute_connection(&mut self, id: ConnId) -> Result<()> {
        let c = self
            .connections
            .get_mut(id)
            .ok_or_else(|| Error::ConnectionNotFound(format!("{:?}", id)))?;
        match c.routing {
            Routing::Unrouted => Ok(()),
            Routing::RoutedTunnel => Err(Error::Refused(
                RcCode::RtBusy,
                "cannot unroute: route busy".into(),
            )),
            Routing::RoutedProspective => {
                let route = route_spec(c);
                c.routing = Routing::Unrouted;
                self.kernel.unroute(&route)?;
                Ok(())
            }
        }
    }

    /// Start keying `id`
    ///
    /// A Quick Mode request rides on an established ISAKMP SA when there is
    /// one, otherwise it waits on a Phase 1 in progress, otherwise a new
    /// Phase 1 is started for it. Returns the state started, if any.
    pub(crate) fn initiate_connection(&mut self, id: ConnId, whack: bool, now: Instant) -> Result<Option<SerialNo>> {
        let c = self
            .connections
            .get_mut(id)
            .ok_or_else(|| Error::ConnectionNotFound(format!("{:?}", id)))?;
        if !c.oriented() {
            return Err(Error::Refused(
                RcCode::Orient,
                format!("we cannot identify ourselves with either end of \"{}\"", c.name),
            ));
        }
        if c.kind == ConnKind::Template {
            return Err(Error::Refused(
                RcCode::NoPeerIp,
                format!("cannot initiate connection \"{}\" without knowing peer IP address", c.name),
            ));
        }
        c.initiated = true;
        let has_ipsec = c.has_ipsec_policy();
        let policy = c.policy;
        self.ipsecdoi_initiate(id, policy, has_ipsec, 1, SerialNo::NOBODY, whack, now)
    }

    /// Start or join the negotiation `id` needs
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn ipsecdoi_initiate(
        &mut self,
        id: ConnId,
        policy: Policy,
        quick: bool,
        try_: u32,
        replacing: SerialNo,
        whack: bool,
        now: Instant,
    ) -> Result<Option<SerialNo>> {
        let phase1 = self
            .connections
            .get(id)
            .map(|c| c.newest_isakmp_sa)
            .unwrap_or(SerialNo::NOBODY);
        let established = self
            .states
            .get(phase1)
            .map_or(false, |st| st.kind.is_isakmp_sa_established());
        let in_progress = self
            .states
            .of_connection(id)
            .into_iter()
            .filter(|s| self.states.get(*s).map_or(false, |st| st.kind.is_phase1() && !st.kind.is_isakmp_sa_established()))
            .max();

        let pending = |isakmp_sa: SerialNo| Pending {
            whack,
            isakmp_sa,
            connection: id,
            policy,
            try_,
            replacing,
            pend_time: now,
        };

        if quick && established {
            return self.quick_out_i1(phase1, &pending(phase1), now).map(Some);
        }
        if let Some(p1) = in_progress {
            if quick {
                self.connections.add_pending(pending(p1));
            }
            info!("{} is waiting for ISAKMP SA {}", self.conn_name(id), p1);
            return Ok(None);
        }
        let serial = self.start_phase1(id, policy, try_, replacing, whack && !quick, now)?;
        if quick {
            self.connections.add_pending(pending(serial));
        }
        Ok(Some(serial))
    }

    /// Start a new Phase 1 for `id` in the mode its policy asks for
    pub(crate) fn start_phase1(
        &mut self,
        id: ConnId,
        policy: Policy,
        try_: u32,
        replacing: SerialNo,
        whack: bool,
        now: Instant,
    ) -> Result<SerialNo> {
        if policy.contains(Policy::AGGRESSIVE) {
            self.aggr_out_i1(id, try_, replacing, whack, now)
        } else {
            self.main_out_i1(id, try_, replacing, whack, now)
        }
    }

    fn initiate_opportunistic(&mut self, our_client: IpAddr, peer_client: IpAddr, whack: bool, now: Instant) -> Result<()> {
        let existing = self
            .connections
            .find_connection_for_clients(&our_client, 0, &peer_client, 0, 0)
            .filter(|id| self.connections.get(*id).map_or(false, |c| c.kind != ConnKind::Template));
        let id = match existing {
            Some(id) => id,
            None => {
                let interfaces = self.config.interfaces.clone();
                // without a key lookup the peer client is its own gateway
                self.connections
                    .build_outgoing_opportunistic(&interfaces, peer_client, our_client, peer_client)
                    .ok_or_else(|| {
                        Error::Refused(
                            RcCode::OppoFailure,
                            format!(
                                "no suitable connection for opportunism between {} and {}",
                                our_client, peer_client
                            ),
                        )
                    })?
            }
        };
        self.initiate_connection(id, whack, now).map(|_| ())
    }

    fn terminate_connection(&mut self, name: &str) -> Result<()> {
        let ids: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.name == name)
            .map(|(id, _)| id)
            .collect();
        if ids.is_empty() {
            return Err(Error::Refused(
                RcCode::UnknownName,
                format!("no connection named \"{}\"", name),
            ));
        }
        for id in ids {
            info!("terminating SAs using {}", self.conn_name(id));
            if let Some(c) = self.connections.get_mut(id) {
                c.initiated = false;
            }
            self.connections.flush_pending_by_connection(id);
            self.delete_states_by_connection(id, true, "terminated by operator");
        }
        Ok(())
    }

    fn show_status(&mut self, now: Instant) {
        let mut lines = Vec::new();
        lines.push(format!(
            "interfaces: {}; listening: {}",
            self.config
                .interfaces
                .iter()
                .map(|i| format!("{}:{}", i, self.config.ike_port))
                .collect::<Vec<_>>()
                .join(", "),
            self.listening
        ));
        lines.extend(self.connections.status_lines());

        let mut serials = self.states.serials();
        serials.sort_unstable();
        for serial in serials {
            let Some(st) = self.states.get(serial) else { continue };
            let event = self
                .timers
                .event_of(serial)
                .map(|ev| {
                    format!(
                        "; {} in {}s",
                        ev.kind,
                        ev.when.saturating_duration_since(now).as_secs()
                    )
                })
                .unwrap_or_default();
            let newest = match self.connections.get(st.connection) {
                Some(c) if c.newest_isakmp_sa == serial => "; newest ISAKMP",
                Some(c) if c.newest_ipsec_sa == serial => "; newest IPSEC",
                _ => "",
            };
            lines.push(format!(
                "{}: {}:{} {} ({}){}{}",
                serial,
                st.peer_addr,
                st.peer_port,
                st.kind,
                st.kind.story(),
                event,
                newest
            ));
        }

        if self.blocks.reject_num() > 0 {
            lines.push(format!(
                "block ip: reject_num {}, period {}s, {} peer(s) recorded",
                self.blocks.reject_num(),
                self.blocks.period().as_secs(),
                self.blocks.len()
            ));
            for p in self.blocks.peers() {
                lines.push(format!(
                    "  {} rejected {} time(s){}",
                    p.ip,
                    p.reject_num,
                    if p.start_time.is_some() { ", blocked" } else { "" }
                ));
            }
        }
        let snapshot = self.metrics.snapshot();
        lines.push(format!(
            "phase 1 success rate {:.1}%, rejection rate {:.1}%",
            snapshot.phase1_success_rate() * 100.0,
            snapshot.rejection_rate() * 100.0
        ));
        for line in lines {
            self.whack.push(RcCode::Comment, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, DaemonConfig, EndConfig};
    use crate::kernel::MemoryKernel;
    use std::time::Duration;

    fn daemon() -> IkeDaemon {
        let config = DaemonConfig::builder()
            .with_interface("192.0.2.1".parse().unwrap())
            .build()
            .unwrap();
        IkeDaemon::new(config, Box::new(MemoryKernel::new())).unwrap()
    }

    fn add(d: &mut IkeDaemon, name: &str, peer: &str) {
        let cfg = ConnectionConfig::builder(name)
            .with_left(EndConfig::host("192.0.2.1".parse().unwrap()))
            .with_right(EndConfig::host(peer.parse().unwrap()))
            .with_psk(b"secret".to_vec())
            .build()
            .unwrap();
        d.handle_whack(WhackMessage::new().with(WhackCommand::AddConnection(cfg)), Instant::now());
    }

    #[test]
    fn test_unknown_names_are_reported() {
        let mut d = daemon();
        let lines = d.handle_whack(
            WhackMessage::new()
                .with(WhackCommand::Terminate("nope".into()))
                .with(WhackCommand::DeleteState(SerialNo(42))),
            Instant::now(),
        );
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.rc == RcCode::UnknownName.code()));
    }

    #[test]
    fn test_initiate_sends_main_mode() {
        let mut d = daemon();
        add(&mut d, "west-east", "198.51.100.7");
        let now = Instant::now();
        d.listen(now);
        d.take_outgoing();
        d.handle_whack(
            WhackMessage::new().with(WhackCommand::Initiate {
                name: "west-east".into(),
                asynchronous: true,
            }),
            now,
        );
        let out = d.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, "198.51.100.7:500".parse().unwrap());
        assert_eq!(d.states().len(), 1);
        // the Quick Mode request waits on the new Phase 1
        let id = d.connections.find_by_name("west-east", true).unwrap();
        assert_eq!(d.connections().pending_of(id).len(), 1);
    }

    #[test]
    fn test_route_and_unroute() {
        let mut d = daemon();
        add(&mut d, "west-east", "198.51.100.7");
        let now = Instant::now();
        d.handle_whack(WhackMessage::new().with(WhackCommand::Route("west-east".into())), now);
        assert!(d.kernel().is_routed("west-east"));
        d.handle_whack(WhackMessage::new().with(WhackCommand::Unroute("west-east".into())), now);
        assert!(!d.kernel().is_routed("west-east"));
    }

    #[test]
    fn test_block_ip_and_status() {
        let mut d = daemon();
        let lines = d.handle_whack(
            WhackMessage::new()
                .with(WhackCommand::BlockIp {
                    reject_num: 3,
                    period: Duration::from_secs(60),
                })
                .with(WhackCommand::Status),
            Instant::now(),
        );
        assert_eq!(d.blocks().reject_num(), 3);
        assert!(lines.iter().any(|l| l.text.contains("reject_num 3")));
    }

    #[test]
    fn test_shutdown_deletes_states() {
        let mut d = daemon();
        add(&mut d, "west-east", "198.51.100.7");
        let now = Instant::now();
        d.listen(now);
        d.handle_whack(
            WhackMessage::new().with(WhackCommand::Initiate {
                name: "west-east".into(),
                asynchronous: true,
            }),
            now,
        );
        d.handle_whack(WhackMessage::new().with(WhackCommand::Shutdown), now);
        assert!(d.states().is_empty());
        assert!(d.is_shutdown());
    }
}
