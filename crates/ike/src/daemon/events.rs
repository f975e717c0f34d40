//! Timer events

use super::IkeDaemon;
use crate::config::PENDING_PHASE2_INTERVAL;
use crate::connections::ConnId;
use crate::dpd::{dpd_notification, DpdStatus};
use crate::isakmp::{Notification, PayloadType};
use crate::logging;
use crate::nat::{self, KEEPALIVE_PACKET};
use crate::policy::Policy;
use crate::state::SerialNo;
use crate::timer::{EventKind, TimerEvent};
use crate::whack::RcCode;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

impl IkeDaemon {
    /// Run every event due at `now`
    ///
    /// Returns how many events fired.
    pub fn on_timer(&mut self, now: Instant) -> usize {
        self.blocks.expire(now);
        let due = self.timers.pop_due(now);
        let fired = due.len();
        for ev in due {
            self.handle_event(ev, now);
        }
        fired
    }

    fn handle_event(&mut self, ev: TimerEvent, now: Instant) {
        debug!(serial = %ev.serial, event = %ev.kind, "handling event");
        match ev.kind {
            EventKind::Retransmit => self.retransmit(ev.serial, now),
            EventKind::SaReplace => self.sa_replace(ev.serial, now),
            EventKind::SaExpire => {
                if let Some(st) = self.states.get(ev.serial) {
                    info!("deleting {} {} (SA expired)", ev.serial, st.kind);
                    self.delete_state_with(ev.serial, true, "SA expired");
                }
            }
            EventKind::DpdProbe | EventKind::DpdTimeout => self.dpd_event(ev.serial, now),
            EventKind::NatKeepalive => self.nat_keepalive(now),
            EventKind::PendingPhase2Check => self.pending_phase2_check(now),
        }
    }

    /// Resend, or give up and maybe start another keying attempt
    fn retransmit(&mut self, serial: SerialNo, now: Instant) {
        let Some(st) = self.states.get_mut(serial) else {
            return;
        };
        let limit = self.config.max_retransmissions;
        if st.retransmits < limit {
            st.retransmits += 1;
            let delay = backoff(self.config.retransmit_delay, st.retransmits);
            let kind = st.kind;
            self.send_state_packet(serial);
            self.metrics.record_retransmission();
            self.whack_state(
                serial,
                RcCode::Retransmission.code(),
                format!("{}: retransmission; will wait {}s for response", kind, delay.as_secs()),
            );
            self.schedule(EventKind::Retransmit, serial, delay, now);
            return;
        }

        let (kind, conn, try_, policy, whack) = (st.kind, st.connection, st.try_, st.policy, st.whack_waiting);
        let text = format!("max number of retransmissions ({}) reached {}", limit, kind);
        info!("{}", text);
        self.whack_state(serial, RcCode::NoRetransmission.code(), text);

        let tries = self.connections.get(conn).map_or(0, |c| c.keying_tries);
        if try_ != 0 && (tries == 0 || try_ < tries) {
            let next = try_ + 1;
            let story = if tries == 0 {
                format!("starting keying attempt {} of an unlimited number", next)
            } else {
                format!("starting keying attempt {} of at most {}", next, tries)
            };
            info!("{}", story);
            if whack {
                self.whack_state(serial, RcCode::Comment.code(), format!("{}, but releasing whack", story));
            }
            self.connections.release_pending_whacks(conn, serial);
            if kind.is_phase1() {
                match self.start_phase1(conn, policy, next, serial, false, now) {
                    Ok(new) => self.connections.update_pending(conn, serial, new),
                    Err(e) => warn!("cannot start keying attempt {}: {}", next, e),
                }
            } else if let Err(e) = self.ipsecdoi_initiate(conn, policy, true, next, serial, false, now) {
                warn!("cannot start keying attempt {}: {}", next, e);
            }
        }
        // abandoned, but kept until its expiry so late duplicates are absorbed
        let linger = self.config.retransmit_delay;
        self.schedule(EventKind::SaExpire, serial, linger, now);
    }

    /// Start rekeying an SA that is about to expire
    fn sa_replace(&mut self, serial: SerialNo, now: Instant) {
        let Some(st) = self.states.get(serial) else {
            return;
        };
        let (kind, conn, margin, policy) = (st.kind, st.connection, st.margin, st.policy);
        let Some(c) = self.connections.get(conn) else {
            return;
        };
        let newest = if kind.is_phase1() {
            c.newest_isakmp_sa == serial
        } else {
            c.newest_ipsec_sa == serial
        };
        if !newest {
            debug!("not replacing stale {} {}", kind, serial);
        } else if c.policy.contains(Policy::DONT_REKEY) {
            debug!("{} is not rekeyed", serial);
        } else {
            info!("initiating replacement of {} {}", kind, serial);
            let quick = !kind.is_phase1();
            let policy = if quick { policy } else { c.policy };
            if let Err(e) = self.ipsecdoi_initiate(conn, policy, quick, 1, serial, false, now) {
                warn!("cannot replace {}: {}", serial, e);
            }
        }
        self.schedule(EventKind::SaExpire, serial, margin, now);
    }

    /// Probe an idle peer, or declare it dead
    fn dpd_event(&mut self, serial: SerialNo, now: Instant) {
        let Some(st) = self.states.get_mut(serial) else {
            return;
        };
        let (icookie, rcookie, conn) = (st.icookie, st.rcookie, st.connection);
        let peer = format!("{}:{}", st.peer_addr, st.peer_port);
        let Some(dpd) = st.dpd.as_mut() else {
            return;
        };
        match dpd.check_status(now) {
            DpdStatus::Alive => {
                let next = dpd.next_probe_in(now);
                self.timers.schedule(EventKind::DpdProbe, serial, next, now);
            }
            DpdStatus::SendRequest => {
                let seqno = dpd.mark_sent(now);
                let timeout = dpd.config().timeout;
                let probe = dpd_notification(Notification::RUThere, &icookie, &rcookie, seqno);
                debug!("DPD: sending R_U_THERE {} to {}", seqno, peer);
                if let Err(e) = self.send_informational(serial, &[(PayloadType::N, probe)]) {
                    logging::log_error("DPD", &e.to_string());
                }
                self.timers.schedule(EventKind::DpdTimeout, serial, timeout, now);
            }
            DpdStatus::Waiting => {
                let timeout = dpd.config().timeout;
                self.timers.schedule(EventKind::DpdTimeout, serial, timeout, now);
            }
            DpdStatus::Dead => {
                logging::log_dpd_check(&peer, false);
                self.metrics.record_dpd_check(false);
                info!("DPD: no response from peer {} - declaring peer dead", peer);
                self.dpd_clear(conn);
            }
        }
    }

    /// The peer is dead: its SAs go, an instance goes with them
    fn dpd_clear(&mut self, conn: ConnId) {
        let instance = self.connections.get(conn).map_or(false, |c| c.kind.is_instance());
        if instance {
            self.delete_connection(conn, "peer declared dead");
        } else {
            self.delete_states_by_connection(conn, false, "peer declared dead");
        }
    }

    /// Keep NAT mappings open for every ISAKMP SA behind a NAT
    fn nat_keepalive(&mut self, now: Instant) {
        let force = self.config.force_keepalive;
        let targets: Vec<(SocketAddr, SocketAddr)> = self
            .states
            .iter()
            .filter(|st| nat::needs_keepalive(st.kind, &st.nat, force))
            .map(|st| {
                (
                    SocketAddr::new(st.local_addr, st.local_port),
                    SocketAddr::new(st.peer_addr, st.peer_port),
                )
            })
            .collect();
        if targets.is_empty() {
            return;
        }
        for (from, to) in targets {
            debug!("NAT-T: sending keepalive to {}", to);
            // the keepalive byte goes without a non-ESP marker
            self.outbox.push(super::Datagram {
                from,
                to,
                data: KEEPALIVE_PACKET.to_vec(),
            });
        }
        let period = self.config.keep_alive_period;
        self.timers.schedule_global(EventKind::NatKeepalive, period, now);
    }

    /// Replace a Phase 1 that leaves Quick Mode requests waiting too long
    fn pending_phase2_check(&mut self, now: Instant) {
        let stuck: Vec<(ConnId, SerialNo)> = self
            .connections
            .iter()
            .filter(|(id, _)| self.connections.pending_check_timeout(*id, now))
            .filter_map(|(id, _)| {
                self.connections
                    .pending_of(id)
                    .iter()
                    .find(|p| p.connection == id)
                    .map(|p| (id, p.isakmp_sa))
            })
            .collect();
        for (conn, p1) in stuck {
            info!(
                "pending Quick Mode with {} took too long -- replacing phase 1",
                self.conn_name(conn)
            );
            let policy = self.connections.get(conn).map_or(Policy::default(), |c| c.policy);
            match self.start_phase1(conn, policy, 1, p1, false, now) {
                Ok(new) => {
                    self.connections.update_pending(conn, p1, new);
                    self.delete_state_with(p1, false, "replaced by a new ISAKMP SA");
                }
                Err(e) => warn!("cannot replace {}: {}", p1, e),
            }
        }
        if self.listening {
            self.timers
                .schedule_global(EventKind::PendingPhase2Check, PENDING_PHASE2_INTERVAL, now);
        }
    }
}

/// Delay before retransmission number `n`
fn backoff(base: Duration, n: u32) -> Duration {
    base * (1u32 << n.min(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, DaemonConfig, EndConfig};
    use crate::kernel::MemoryKernel;
    use crate::whack::{WhackCommand, WhackMessage};

    fn initiated(keying_tries: u32) -> (IkeDaemon, Instant) {
        let config = DaemonConfig::builder()
            .with_interface("192.0.2.1".parse().unwrap())
            .build()
            .unwrap();
        let mut d = IkeDaemon::new(config, Box::new(MemoryKernel::new())).unwrap();
        let cfg = ConnectionConfig::builder("west-east")
            .with_left(EndConfig::host("192.0.2.1".parse().unwrap()))
            .with_right(EndConfig::host("198.51.100.7".parse().unwrap()))
            .with_psk(b"secret".to_vec())
            .with_keying_tries(keying_tries)
            .build()
            .unwrap();
        let now = Instant::now();
        d.handle_whack(
            WhackMessage::new()
                .with(WhackCommand::AddConnection(cfg))
                .with(WhackCommand::Listen)
                .with(WhackCommand::Initiate {
                    name: "west-east".into(),
                    asynchronous: true,
                }),
            now,
        );
        assert_eq!(d.take_outgoing().len(), 1);
        (d, now)
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_secs(10);
        assert_eq!(backoff(base, 1), Duration::from_secs(20));
        assert_eq!(backoff(base, 2), Duration::from_secs(40));
    }

    #[test]
    fn test_retransmit_resends_last_message() {
        let (mut d, now) = initiated(1);
        let first = d.config.retransmit_delay;
        assert_eq!(d.on_timer(now + first / 2), 0);
        assert_eq!(d.on_timer(now + first), 1);
        assert_eq!(d.take_outgoing().len(), 1);
        assert_eq!(d.metrics().snapshot().retransmissions, 1);
    }

    #[test]
    fn test_exhausted_retransmits_abandon_state() {
        let (mut d, mut now) = initiated(1);
        let serial = d.states().serials()[0];
        for _ in 0..=d.config.max_retransmissions {
            now = d.next_deadline().unwrap();
            d.on_timer(now);
        }
        // abandoned: no more resends, gone once it expires
        assert_eq!(d.take_outgoing().len(), d.config.max_retransmissions as usize);
        assert!(d.state(serial).is_some());
        assert_eq!(d.timers.event_of(serial).unwrap().kind, EventKind::SaExpire);

        now = d.next_deadline().unwrap();
        d.on_timer(now);
        assert!(d.states().is_empty());
    }

    #[test]
    fn test_exhausted_retransmits_start_next_attempt() {
        let (mut d, mut now) = initiated(2);
        let serial = d.states().serials()[0];
        for _ in 0..=d.config.max_retransmissions {
            now = d.next_deadline().unwrap();
            d.on_timer(now);
        }
        let mut serials = d.states().serials();
        serials.sort_unstable();
        assert_eq!(serials.len(), 2);
        assert_eq!(serials[0], serial);
        let next = serials[1];
        assert_eq!(d.state(next).unwrap().try_, 2);
        // the Quick Mode request moved to the new attempt
        let id = d.connections.find_by_name("west-east", true).unwrap();
        assert_eq!(d.connections().pending_of(id)[0].isakmp_sa, next);
    }
}
