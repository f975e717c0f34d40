//! Informational exchanges: notifications, Delete SA and DPD
//!
//! Nothing here changes the state of the SA the message arrived on, so
//! every path returns [`StfResult::Ignore`].

use super::{hash_matches, StfResult, Step};
use crate::config::MAXIMUM_MALFORMED_NOTIFY;
use crate::daemon::IkeDaemon;
use crate::demux::MsgDigest;
use crate::dpd::{dpd_notification, dpd_seqno};
use crate::isakmp::{proto, DeletePayload, Notification, NotificationPayload, PayloadType};
use crate::logging;
use crate::state::{SerialNo, StateKind};
use crate::whack::RcCode;
use std::time::Instant;
use tracing::{debug, info, warn};

impl IkeDaemon {
    /// Informational exchange, protected or not
    pub(crate) fn informational(&mut self, md: &mut MsgDigest, now: Instant) -> Step<StfResult> {
        let protected = md.from_state == StateKind::InfoProtected;
        if protected && !self.informational_hash_ok(md) {
            info!("received HASH(1) does not match computed value in Informational Exchange");
            return Ok(StfResult::Ignore);
        }

        for n in md.notifications() {
            self.informational_notification(md, &n, protected, now);
        }
        if md.count(PayloadType::D) > 0 {
            if protected {
                for body in md.bodies(PayloadType::D) {
                    match DeletePayload::from_bytes(body) {
                        Ok(d) => self.accept_delete(md, &d),
                        Err(e) => info!("ignoring malformed Delete SA payload: {}", e),
                    }
                }
            } else {
                info!("ignoring Delete SA payload: not encrypted");
            }
        }
        Ok(StfResult::Ignore)
    }

    /// HASH(1) = prf(SKEYID_a, M-ID | payloads after HASH)
    fn informational_hash_ok(&self, md: &MsgDigest) -> bool {
        let Some(st) = self.states.get(md.st) else {
            return false;
        };
        let Some(hash) = st.hasher() else {
            return false;
        };
        let Some(pd) = md.first(PayloadType::HASH) else {
            return false;
        };
        let computed = hash.prf(
            &st.keys.skeyid_a,
            &[&md.hdr.message_id.to_be_bytes(), md.after(pd)],
        );
        hash_matches(Some(md.body(pd)), &computed)
    }

    fn informational_notification(&mut self, md: &MsgDigest, n: &NotificationPayload, protected: bool, now: Instant) {
        let peer = format!("{}:{}", md.sender, md.sender_port);
        match n.notification() {
            Notification::RUThere | Notification::RUThereAck if !protected => {
                info!("ignoring unprotected DPD notification from {}", peer);
            }
            Notification::RUThere => self.dpd_request(md.st, n, &peer, now),
            Notification::RUThereAck => self.dpd_ack(md.st, n, &peer, now),
            Notification::PayloadMalformed => {
                let Some(st) = self.states.get_mut(md.st) else {
                    info!("received PAYLOAD_MALFORMED from {}", peer);
                    return;
                };
                st.malformed_received += 1;
                let (sent, received) = (st.malformed_sent, st.malformed_received);
                info!("received {} malformed payload notifies from {}", received, peer);
                if received > MAXIMUM_MALFORMED_NOTIFY / 2 && sent + received > MAXIMUM_MALFORMED_NOTIFY {
                    debug!("too many ({}) malformed payloads; deleting state", sent + received);
                    self.delete_state_with(md.st, false, "too many malformed payloads");
                }
            }
            other => {
                info!("received and ignored informational message {} from {}", other, peer);
                if md.st.is_some() {
                    self.whack_state(
                        md.st,
                        RcCode::Notification.code().saturating_add(n.notify_type),
                        format!("received notification {}", other),
                    );
                }
            }
        }
    }

    /// Answer R_U_THERE with an ACK carrying the same sequence number
    fn dpd_request(&mut self, p1: SerialNo, n: &NotificationPayload, peer: &str, now: Instant) {
        let Some(st) = self.states.get_mut(p1) else {
            return;
        };
        let (icookie, rcookie) = (st.icookie, st.rcookie);
        let seqno = match dpd_seqno(n, &icookie, &rcookie) {
            Ok(s) => s,
            Err(e) => {
                warn!("DPD: received R_U_THERE from {} that is not for us: {}", peer, e);
                return;
            }
        };
        if let Some(dpd) = st.dpd.as_mut() {
            if let Err(reject) = dpd.peer_request(seqno, now) {
                info!("DPD: ignoring R_U_THERE from {}: {:?}", peer, reject);
                return;
            }
        }
        let ack = dpd_notification(Notification::RUThereAck, &icookie, &rcookie, seqno);
        if let Err(e) = self.send_informational(p1, &[(PayloadType::N, ack)]) {
            logging::log_error("DPD", &e.to_string());
        }
    }

    fn dpd_ack(&mut self, p1: SerialNo, n: &NotificationPayload, peer: &str, now: Instant) {
        let Some(st) = self.states.get_mut(p1) else {
            return;
        };
        let seqno = match dpd_seqno(n, &st.icookie, &st.rcookie) {
            Ok(s) => s,
            Err(e) => {
                warn!("DPD: received R_U_THERE_ACK from {} that is not for us: {}", peer, e);
                return;
            }
        };
        let Some(dpd) = st.dpd.as_mut() else {
            info!("DPD: unexpected R_U_THERE_ACK from {}", peer);
            return;
        };
        match dpd.mark_received(seqno, now) {
            Ok(()) => {
                logging::log_dpd_check(peer, true);
                self.metrics.record_dpd_check(true);
            }
            Err(reject) => info!("DPD: ignoring R_U_THERE_ACK from {}: {:?}", peer, reject),
        }
    }

    /// Delete what one Delete SA payload names
    ///
    /// Only SAs with the sender as their peer are touched. Nothing is sent
    /// back: the peer has already forgotten them.
    fn accept_delete(&mut self, md: &MsgDigest, d: &DeletePayload) {
        for spi in &d.spis {
            let victim = match d.protocol_id {
                proto::ISAKMP => {
                    if spi.len() != 16 {
                        info!("ignoring Delete SA payload: ISAKMP SPI has length {}", spi.len());
                        continue;
                    }
                    let mut icookie = [0u8; 8];
                    let mut rcookie = [0u8; 8];
                    icookie.copy_from_slice(&spi[..8]);
                    rcookie.copy_from_slice(&spi[8..]);
                    self.states
                        .find_by_cookies(&icookie, &rcookie)
                        .filter(|s| self.states.get(*s).map_or(false, |st| st.peer_addr == md.sender))
                }
                proto::IPSEC_AH | proto::IPSEC_ESP => {
                    if spi.len() != 4 {
                        info!("ignoring Delete SA payload: IPsec SPI has length {}", spi.len());
                        continue;
                    }
                    let value = u32::from_be_bytes([spi[0], spi[1], spi[2], spi[3]]);
                    self.states.find_by_spi(&md.sender, d.protocol_id, value)
                }
                other => {
                    info!("ignoring Delete SA payload for protocol {}", proto::name(other));
                    continue;
                }
            };
            match victim {
                Some(serial) => {
                    info!("received Delete SA payload: deleting {}", serial);
                    self.delete_state_with(serial, false, "received Delete SA payload");
                }
                None => info!(
                    "ignoring Delete SA payload: {} SA(s) not found",
                    proto::name(d.protocol_id)
                ),
            }
        }
    }
}
