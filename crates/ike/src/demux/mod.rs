//! Exchange dispatcher
//!
//! Every ISAKMP message goes through [`IkeDaemon::process_packet`]:
//!
//! 1. header and length checks
//! 2. state lookup, by exchange type
//! 3. microcode selection for (state, authentication method)
//! 4. block list, suspension and duplicate checks
//! 5. decryption
//! 6. payload walk and ordering rules
//! 7. the transition itself
//! 8. [`IkeDaemon::complete_state_transition`]: advance the state, send
//!    the reply, schedule the next event, release queued Quick Modes
//!
//! A message refused before step 7 never changes a state.

pub mod digest;
pub mod microcode;
mod reply;

pub use digest::{check_ordering, digest_payloads, MsgDigest, PayloadDigest, Rejection};
pub use microcode::{Microcode, MicrocodeIndex, SmfFlags, Transition, MICROCODE, MICROCODE_INDEX};

use crate::block::is_block_state;
use crate::config::NAT_T_IKE_FLOAT_PORT;
use crate::connections::Routing;
use crate::daemon::{route_spec, IkeDaemon};
use crate::dpd::{is_dpd_vendor_id, DpdConfig, DpdState};
use crate::isakmp::{ExchangeType, IsakmpHeader, Notification, PayloadType, ISAKMP_HEADER_SIZE, ZERO_COOKIE};
use crate::logging;
use crate::nat::{self, NatVendorId};
use crate::policy::Policy;
use crate::state::{SerialNo, StateKind};
use crate::timer::EventKind;
use crate::transitions::StfResult;
use crate::whack::RcCode;
use rand::Rng;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

impl IkeDaemon {
    /// Process one ISAKMP message (non-ESP marker already stripped)
    pub(crate) fn process_packet(&mut self, mut raw: Vec<u8>, from: SocketAddr, to: SocketAddr, now: Instant) {
        self.metrics.record_packet_received();
        self.blocks.expire(now);

        let hdr = match IsakmpHeader::from_bytes(&raw) {
            Ok(hdr) => hdr,
            Err(_) => {
                self.drop_packet(
                    from,
                    format!("received packet size ({}) is smaller than an ISAKMP header", raw.len()),
                );
                return;
            }
        };
        let exchange = ExchangeType::from_u8(hdr.exchange_type);
        logging::log_message_recv(
            exchange.map_or("ISAKMP_XCHG_UNKNOWN", ExchangeType::name),
            &from.to_string(),
            raw.len(),
        );

        let declared = hdr.length as usize;
        if declared < ISAKMP_HEADER_SIZE {
            self.drop_packet(
                from,
                format!("ISAKMP HDR claims a size ({}) smaller than the header", declared),
            );
            return;
        }
        if raw.len() < declared {
            self.drop_packet(
                from,
                format!(
                    "received packet size ({}) is smaller than from size specified in ISAKMP HDR ({}) - packet dropped",
                    raw.len(),
                    declared
                ),
            );
            return;
        }
        if raw.len() > declared {
            debug!(
                "size ({}) differs from size specified in ISAKMP HDR ({})",
                raw.len(),
                declared
            );
            raw.truncate(declared);
        }

        let mut md = MsgDigest::new(hdr, raw, from.ip(), from.port(), to.ip(), to.port(), now);

        if md.hdr.major_version() > 1 {
            let rej = Rejection::new(
                format!("ignoring packet with ISAKMP major version {}", md.hdr.major_version()),
                Some(Notification::InvalidMajorVersion),
            );
            self.reject(&md, rej, false, now);
            return;
        }
        if md.hdr.minor_version() > 0 {
            let rej = Rejection::new(
                format!("ignoring packet with ISAKMP minor version {}", md.hdr.minor_version()),
                Some(Notification::InvalidMinorVersion),
            );
            self.reject(&md, rej, false, now);
            return;
        }

        let from_state = match self.locate_state(&mut md) {
            Ok(kind) => kind,
            Err(rej) => {
                self.reject(&md, rej, false, now);
                return;
            }
        };
        md.from_state = from_state;

        if md.hdr.flags.is_commit() {
            debug!("IKE message has the Commit Flag set but we are not honouring it");
        }

        let auth = self.states.get(md.st).map(|st| st.oakley.auth);
        let Some(smc_index) = self.microcode.select(MICROCODE, from_state, auth) else {
            let rej = Rejection::new(
                format!("no microcode for {} with this authentication method", from_state),
                Some(Notification::InvalidPayloadType),
            );
            self.reject(&md, rej, false, now);
            return;
        };
        md.smc = smc_index;
        let smc = &MICROCODE[smc_index];
        let blockable = smc.next_state.map_or(false, is_block_state);

        if blockable && self.blocks.is_blocked(&md.sender) {
            let next = smc.next_state.map_or("", StateKind::name);
            logging::log_blocked_packet(&md.sender.to_string(), next);
            self.metrics.record_blocked_packet();
            return;
        }

        if let Some(st) = self.states.get(md.st) {
            if st.suspended.is_some() {
                info!(
                    "discarding packet received during asynchronous lookup in {}",
                    st.kind
                );
                return;
            }
        }

        if self.handle_duplicate(&md, smc) {
            return;
        }

        if md.hdr.flags.is_encrypted() {
            if let Err(rej) = self.decrypt_message(&mut md) {
                self.reject(&md, rej, blockable, now);
                return;
            }
        } else if smc.flags.contains(SmfFlags::INPUT_ENCRYPTED) {
            let rej = Rejection::new(
                "packet rejected: should have been encrypted".into(),
                Some(Notification::InvalidFlags),
            );
            self.reject(&md, rej, blockable, now);
            return;
        }

        let nat_method = self.states.get(md.st).and_then(|st| st.nat.method);
        if let Err(rej) = digest_payloads(&mut md, smc, nat_method).and_then(|()| check_ordering(&md)) {
            self.reject(&md, rej, blockable, now);
            return;
        }

        if smc.processor != Transition::Informational {
            for n in md.notifications() {
                match n.notification() {
                    Notification::RUThere | Notification::RUThereAck => {}
                    other => info!("ignoring informational payload, type {}", other),
                }
            }
            if md.count(PayloadType::D) > 0 {
                info!("ignoring Delete SA payload in {}", from_state);
            }
        }
        self.note_vendor_ids(&mut md);
        if md.encrypted {
            if let Some(dpd) = self
                .established_isakmp_sa(md.st)
                .and_then(|p1| self.states.get_mut(p1))
                .and_then(|st| st.dpd.as_mut())
            {
                dpd.mark_activity(now);
            }
        }

        let result = self.run_transition(smc.processor, &mut md, now);
        self.complete_state_transition(&mut md, result, now);
    }

    /// Find the state a message belongs to and the kind it is processed in
    ///
    /// Sets `md.st` (the Phase 1 state for a new Quick Mode or
    /// Informational exchange) and, for those, the Phase 2 IV.
    fn locate_state(&mut self, md: &mut MsgDigest) -> Result<StateKind, Rejection> {
        let hdr = md.hdr.clone();
        let msgid = hdr.message_id;
        let reject = |reason: String, notify: Option<Notification>| Err(Rejection::new(reason, notify));

        match ExchangeType::from_u8(hdr.exchange_type) {
            Some(xchg @ (ExchangeType::IdProt | ExchangeType::Aggressive)) => {
                if msgid != 0 {
                    return reject(
                        format!("Message ID was 0x{:08x} but should be zero in Phase 1", msgid),
                        Some(Notification::InvalidMessageId),
                    );
                }
                if hdr.icookie == ZERO_COOKIE {
                    return reject(
                        "Initiator Cookie must not be zero in Phase 1 message".into(),
                        Some(Notification::InvalidCookie),
                    );
                }
                if hdr.rcookie == ZERO_COOKIE {
                    if hdr.flags.is_encrypted() {
                        return reject(
                            "initial phase 1 message is invalid: its Encrypted Flag is on".into(),
                            Some(Notification::InvalidFlags),
                        );
                    }
                    let found = self
                        .states
                        .find(&hdr.icookie, &ZERO_COOKIE, &md.sender, 0)
                        .or_else(|| self.responder_for_retransmit(md));
                    return Ok(match found {
                        Some(serial) => {
                            md.st = serial;
                            self.kind_of(serial)
                        }
                        None if xchg == ExchangeType::IdProt => StateKind::MainR0,
                        None => StateKind::AggrR0,
                    });
                }
                match self.states.find(&hdr.icookie, &hdr.rcookie, &md.sender, 0) {
                    Some(serial) => {
                        md.st = serial;
                        Ok(self.kind_of(serial))
                    }
                    None => reject("Phase 1 message is part of an unknown exchange".into(), None),
                }
            }
            Some(ExchangeType::Quick) => {
                if hdr.icookie == ZERO_COOKIE {
                    return reject(
                        "Quick Mode message is invalid because it has an Initiator Cookie of 0".into(),
                        Some(Notification::InvalidCookie),
                    );
                }
                if hdr.rcookie == ZERO_COOKIE {
                    return reject(
                        "Quick Mode message is invalid because it has a Responder Cookie of 0".into(),
                        Some(Notification::InvalidCookie),
                    );
                }
                if msgid == 0 {
                    return reject(
                        "Quick Mode message is invalid because it has a Message ID of 0".into(),
                        Some(Notification::InvalidMessageId),
                    );
                }
                if let Some(serial) = self.states.find(&hdr.icookie, &hdr.rcookie, &md.sender, msgid) {
                    md.st = serial;
                    return Ok(self.kind_of(serial));
                }
                let Some(p1) = self.states.find_phase1(&hdr.icookie, &hdr.rcookie, &md.sender) else {
                    return reject(
                        "Quick Mode message is for a non-existent (expired?) ISAKMP SA".into(),
                        None,
                    );
                };
                md.st = p1;
                if !self.kind_of(p1).is_isakmp_sa_established() {
                    return reject(
                        "Quick Mode message is unacceptable because it is for an incomplete ISAKMP SA".into(),
                        Some(Notification::PayloadMalformed),
                    );
                }
                if !self.states.reserve_msgid(p1, msgid) {
                    return reject(
                        format!(
                            "Quick Mode I1 message is unacceptable because it uses a previously used Message ID 0x{:08x} (perhaps this is a duplicated packet)",
                            msgid
                        ),
                        Some(Notification::InvalidMessageId),
                    );
                }
                md.new_iv = self.states.phase2_iv(p1, msgid).unwrap_or_default();
                Ok(StateKind::QuickR0)
            }
            Some(ExchangeType::Informational) => {
                if hdr.icookie == ZERO_COOKIE {
                    return reject("Informational Exchange is for an invalid ISAKMP SA".into(), None);
                }
                let found = self.states.find(&hdr.icookie, &hdr.rcookie, &md.sender, 0);
                if hdr.flags.is_encrypted() {
                    let Some(p1) = found else {
                        return reject(
                            "Informational Exchange is for an unknown (expired?) SA".into(),
                            None,
                        );
                    };
                    md.st = p1;
                    if !self.kind_of(p1).is_isakmp_encrypted() {
                        return reject(
                            "encrypted Informational Exchange message is invalid because no key is known".into(),
                            None,
                        );
                    }
                    if msgid == 0 {
                        return reject(
                            "Informational Exchange message is invalid because it has a Message ID of 0".into(),
                            None,
                        );
                    }
                    if !self.states.reserve_msgid(p1, msgid) {
                        return reject(
                            format!(
                                "Informational Exchange message is invalid because it has a previously used Message ID (0x{:08x})",
                                msgid
                            ),
                            None,
                        );
                    }
                    md.new_iv = self.states.phase2_iv(p1, msgid).unwrap_or_default();
                    return Ok(StateKind::InfoProtected);
                }
                if let Some(st) = found {
                    if self.kind_of(st).is_isakmp_encrypted() {
                        return reject(
                            "Informational Exchange message must be encrypted".into(),
                            None,
                        );
                    }
                    md.st = st;
                }
                Ok(StateKind::Info)
            }
            Some(other) => reject(
                format!("unsupported exchange type {} in message", other.name()),
                Some(Notification::UnsupportedExchangeType),
            ),
            None => reject(
                format!("unsupported exchange type {} in message", hdr.exchange_type),
                Some(Notification::UnsupportedExchangeType),
            ),
        }
    }

    /// A first Phase 1 message we already answered: find the responder
    /// state holding exactly these bytes so the duplicate check sees it
    fn responder_for_retransmit(&self, md: &MsgDigest) -> Option<SerialNo> {
        self.states
            .iter()
            .find(|st| {
                !st.initiator
                    && st.kind.is_phase1()
                    && st.icookie == md.hdr.icookie
                    && st.peer_addr == md.sender
                    && st.rpacket == md.raw
            })
            .map(|st| st.serial)
    }

    fn kind_of(&self, serial: SerialNo) -> StateKind {
        self.states.get(serial).map_or(StateKind::Info, |st| st.kind)
    }

    /// Resend or drop a message identical to the last one received
    ///
    /// Returns true if the message was a duplicate.
    fn handle_duplicate(&mut self, md: &MsgDigest, smc: &Microcode) -> bool {
        let max = self.config.max_retransmissions;
        let Some(st) = self.states.get_mut(md.st) else {
            return false;
        };
        if st.kind != md.from_state || st.rpacket.is_empty() || st.rpacket != md.raw {
            return false;
        }
        let kind = st.kind;
        self.metrics.record_duplicate();
        if smc.flags.contains(SmfFlags::RETRANSMIT_ON_DUPLICATE) {
            if st.retransmits < max {
                st.retransmits += 1;
                info!("retransmitting in response to duplicate packet; already {}", kind);
                self.metrics.record_retransmission();
                self.send_state_packet(md.st);
            } else {
                info!(
                    "discarding duplicate packet -- exhausted retransmission; already {}",
                    kind
                );
            }
        } else {
            info!("discarding duplicate packet; already {}", kind);
        }
        true
    }

    /// Decrypt the body of `md` with the keys of `md.st`
    ///
    /// The IV is the Phase 2 IV for a new exchange and the state's running
    /// IV otherwise. The IV for the next message is parked in `md.new_iv`
    /// until the transition succeeds.
    fn decrypt_message(&mut self, md: &mut MsgDigest) -> Result<(), Rejection> {
        let Some(st) = self.states.get(md.st) else {
            return Err(Rejection::new(
                "discarding encrypted message for an unknown ISAKMP SA".into(),
                Some(Notification::PayloadMalformed),
            ));
        };
        if !st.keys.is_ready() {
            return Err(Rejection::new(
                "discarding encrypted message because we haven't yet negotiated keying materiel".into(),
                Some(Notification::InvalidFlags),
            ));
        }
        let Some(enc) = st.encrypter() else {
            return Err(Rejection::new(
                "discarding encrypted message: no cipher negotiated".into(),
                None,
            ));
        };
        let bs = enc.block_size();
        let body = &md.raw[ISAKMP_HEADER_SIZE..];
        if body.is_empty() || body.len() % bs != 0 {
            return Err(Rejection::new(
                "malformed message: not a multiple of encryption blocksize".into(),
                Some(Notification::PayloadMalformed),
            ));
        }
        let iv = if md.new_iv.is_empty() { &st.iv } else { &md.new_iv };
        let plain = enc.decrypt(&st.keys.enc_key, iv, body).map_err(|e| {
            Rejection::new(
                format!("unable to decrypt message: {}", e),
                Some(Notification::PayloadMalformed),
            )
        })?;
        md.new_iv = body[body.len() - bs..].to_vec();
        md.message.truncate(ISAKMP_HEADER_SIZE);
        md.message.extend_from_slice(&plain);
        md.payload_end = md.message.len();
        md.encrypted = true;
        Ok(())
    }

    /// Note the Vendor IDs we understand
    fn note_vendor_ids(&self, md: &mut MsgDigest) {
        let mut nat_vid: Option<NatVendorId> = None;
        let mut dpd = false;
        for body in md.bodies(PayloadType::VID) {
            if is_dpd_vendor_id(body) {
                dpd = true;
                continue;
            }
            match NatVendorId::from_bytes(body) {
                Some(vid) if self.config.nat_traversal => {
                    if nat_vid.map_or(true, |cur| vid.preference() > cur.preference()) {
                        nat_vid = Some(vid);
                    }
                }
                Some(vid) => debug!("ignoring {} Vendor ID, NAT-Traversal is disabled", vid.text().trim_end()),
                None => debug!("ignoring Vendor ID payload [{}]", hex::encode(body)),
            }
        }
        md.nat_vid = nat_vid;
        md.dpd = dpd;
    }

    /// Log and count a message dropped before any state was found
    fn drop_packet(&mut self, from: SocketAddr, reason: String) {
        self.metrics.record_packet_rejected();
        logging::log_packet_rejected(&from.to_string(), &reason);
    }

    /// Refuse a message: log it, count it against the sender when it was
    /// headed for a blockable state, and tell the peer if a notification
    /// is owed
    fn reject(&mut self, md: &MsgDigest, rej: Rejection, blockable: bool, now: Instant) {
        self.metrics.record_packet_rejected();
        logging::log_packet_rejected(&format!("{}:{}", md.sender, md.sender_port), &rej.reason);
        if blockable {
            self.note_rejection(md.sender, now);
        }
        if let Some(n) = rej.notify {
            self.send_notification(md, n);
        }
    }

    /// Act on the outcome of a transition
    pub(crate) fn complete_state_transition(&mut self, md: &mut MsgDigest, result: StfResult, now: Instant) {
        let smc = &MICROCODE[md.smc];
        match result {
            StfResult::Ignore => {}
            StfResult::Suspend => debug!("{} suspended in {}", md.st, md.from_state),
            StfResult::InternalError => {
                self.whack_state(
                    md.st,
                    RcCode::InternalErr.code(),
                    format!("{}: internal error", md.from_state),
                );
                debug!("state transition function for {} had internal error", md.from_state);
            }
            StfResult::Fail(n) => self.fail_transition(md, smc, n, now),
            StfResult::Ok => self.advance_state(md, smc, now),
        }
    }

    fn fail_transition(&mut self, md: &MsgDigest, smc: &Microcode, n: Notification, now: Instant) {
        self.metrics.record_packet_rejected();
        logging::log_packet_rejected(
            &format!("{}:{}", md.sender, md.sender_port),
            &format!("{}: {}", md.from_state, n),
        );
        if smc.next_state.map_or(false, is_block_state) {
            self.note_rejection(md.sender, now);
        }
        self.whack_state(
            md.st,
            RcCode::Notification.code() + n.to_u16(),
            format!("{}: {}", md.from_state, n),
        );
        debug!("state transition function for {} failed: {}", md.from_state, n);
        self.send_notification(md, n);

        // a responder state that never got past its first message
        if let Some(st) = self.states.get(md.st) {
            if st.kind == md.from_state && matches!(st.kind, StateKind::MainR0 | StateKind::AggrR0) {
                self.delete_state_with(md.st, false, "failed first exchange");
            }
        }
    }

    fn advance_state(&mut self, md: &mut MsgDigest, smc: &Microcode, now: Instant) {
        let serial = md.st;
        let Some(next) = smc.next_state else {
            return;
        };
        let Some(st) = self.states.get(serial) else {
            return;
        };
        let old = st.kind;

        let encrypt_reply = smc.flags.contains(SmfFlags::REPLY | SmfFlags::OUTPUT_ENCRYPTED) && !md.reply.is_empty();
        if encrypt_reply {
            let iv = if md.encrypted { md.new_iv.clone() } else { st.iv.clone() };
            let mut reply = std::mem::take(&mut md.reply);
            if let Err(e) = self.encrypt_message(serial, &iv, &mut reply) {
                logging::log_error(&smc.processor.to_string(), &e.to_string());
                self.whack_state(serial, RcCode::InternalErr.code(), format!("{}: internal error", old));
                return;
            }
            md.reply = reply;
        }

        let nat_traversal = self.config.nat_traversal;
        let Some(st) = self.states.get_mut(serial) else {
            return;
        };
        st.kind = next;
        st.rpacket = md.raw.clone();
        st.retransmits = 0;
        if md.encrypted && !encrypt_reply {
            st.iv = md.new_iv.clone();
        }
        if next.is_isakmp_sa_established() {
            st.ph1_iv = st.iv.clone();
        }
        if md.dpd && next.is_phase1() {
            st.peer_supports_dpd = true;
        }
        let (ic, rc, conn) = (st.icookie, st.rcookie, st.connection);
        logging::log_state_transition(&ic, &rc, serial.0, old.name(), next.name());

        if nat_traversal {
            self.nat_change_ports(serial, md);
        }

        if smc.flags.contains(SmfFlags::REPLY) && !md.reply.is_empty() {
            if let Some(st) = self.states.get_mut(serial) {
                st.tpacket = md.reply.clone();
            }
            self.send_state_packet(serial);
        }

        self.schedule_after_transition(serial, smc, now);

        let established = next.is_isakmp_sa_established() || next.is_ipsec_sa_established();
        let story = format!("{}: {}", next.name(), next.story());
        if established {
            logging::log_sa_established(serial.0, &self.conn_name(conn), &story);
            self.whack_state(serial, RcCode::Success.code(), story);
        } else {
            info!(serial = %serial, "{}", story);
            self.whack_state(serial, next.rc_code(), story);
        }

        if next.is_isakmp_sa_established() {
            self.isakmp_sa_established(serial, now);
        }
        if next.is_ipsec_sa_established() {
            self.ipsec_sa_established(serial);
        }

        if smc.flags.contains(SmfFlags::RELEASE_PENDING_P2) && next.is_isakmp_sa_established() {
            for p in self.connections.unpend(conn, serial, now) {
                if let Err(e) = self.quick_out_i1(serial, &p, now) {
                    warn!("cannot start pending Quick Mode for {}: {}", self.conn_name(p.connection), e);
                }
            }
        }

        if established {
            if let Some(st) = self.states.get_mut(serial) {
                st.whack_waiting = false;
            }
        }
        if next.is_ipsec_sa_established() {
            self.release_old_states(serial);
        }
        if matches!(next, StateKind::MainR3 | StateKind::AggrR2) {
            self.blocks.del(&md.sender);
        }
    }

    /// Follow the peer's NAT mapping and float to the NAT-T port
    fn nat_change_ports(&mut self, serial: SerialNo, md: &MsgDigest) {
        let Some(st) = self.states.get(serial) else {
            return;
        };
        let (peer_addr, peer_port) = (st.peer_addr, st.peer_port);
        if st.nat.detected() && peer_port != md.sender_port {
            nat::new_mapping(&mut self.states, peer_addr, peer_port, md.sender, md.sender_port);
        }
        let Some(st) = self.states.get_mut(serial) else {
            return;
        };
        if st.local_port != md.local_port {
            debug!(
                "NAT-T: updating local port from {} to {}",
                st.local_port, md.local_port
            );
            st.local_port = md.local_port;
        }
        if nat::should_float(st.kind, &st.nat, st.local_port) {
            debug!("NAT-T: floating to port {}", NAT_T_IKE_FLOAT_PORT);
            st.local_port = NAT_T_IKE_FLOAT_PORT;
            st.peer_port = NAT_T_IKE_FLOAT_PORT;
        }
    }

    /// Schedule the retransmit or replace event of the row just taken
    fn schedule_after_transition(&mut self, serial: SerialNo, smc: &Microcode, now: Instant) {
        self.timers.cancel(serial);
        match smc.timeout_event {
            Some(EventKind::Retransmit) => {
                let delay = self.config.retransmit_delay;
                self.schedule(EventKind::Retransmit, serial, delay, now);
            }
            Some(EventKind::SaReplace) => {
                let Some(st) = self.states.get(serial) else {
                    return;
                };
                let Some(c) = self.connections.get(st.connection) else {
                    return;
                };
                let configured = if st.kind.is_phase1() {
                    c.ike_lifetime
                } else {
                    c.ipsec_lifetime
                };
                let agreed = Duration::from_secs(u64::from(st.negotiated_life()));
                let mut delay = if agreed.is_zero() {
                    configured
                } else {
                    configured.min(agreed)
                };
                let mut kind = EventKind::SaReplace;
                let mut margin = Duration::ZERO;
                if c.policy.contains(Policy::DONT_REKEY) {
                    kind = EventKind::SaExpire;
                } else {
                    margin = c.rekey_margin;
                    if smc.flags.contains(SmfFlags::INITIATOR) {
                        let fuzz = f64::from(c.rekey_fuzz) / 100.0 * rand::thread_rng().gen::<f64>();
                        margin += margin.mul_f64(fuzz);
                    } else {
                        margin /= 2;
                    }
                    if delay > margin {
                        delay -= margin;
                    } else {
                        kind = EventKind::SaExpire;
                        margin = Duration::ZERO;
                    }
                }
                if let Some(st) = self.states.get_mut(serial) {
                    st.margin = margin;
                }
                self.schedule(kind, serial, delay, now);
            }
            Some(other) => self.schedule(other, serial, self.config.retransmit_delay, now),
            None => {}
        }
    }

    /// Bookkeeping for a freshly authenticated ISAKMP SA
    fn isakmp_sa_established(&mut self, serial: SerialNo, now: Instant) {
        let Some(st) = self.states.get(serial) else {
            return;
        };
        let (conn, supports_dpd, keepalive) = (
            st.connection,
            st.peer_supports_dpd,
            nat::needs_keepalive(st.kind, &st.nat, self.config.force_keepalive),
        );
        self.metrics.record_phase1_completed();
        let Some(c) = self.connections.get_mut(conn) else {
            return;
        };
        if c.newest_isakmp_sa < serial {
            c.newest_isakmp_sa = serial;
        }
        let (name, kind) = (c.name.clone(), c.kind);
        let (this_id, that_id) = (c.this.id.clone(), c.that.id.clone());
        let dpd = DpdConfig::new(c.dpd_delay, c.dpd_timeout);

        if dpd.is_enabled() {
            if supports_dpd {
                if let Some(st) = self.states.get_mut(serial) {
                    st.dpd = Some(DpdState::new(dpd, now));
                }
                self.timers.schedule(EventKind::DpdProbe, serial, dpd.delay, now);
            } else {
                info!("DPD: peer does not support dpd");
            }
        }

        if keepalive && self.config.nat_keepalive {
            let period = self.config.keep_alive_period;
            self.timers.schedule_global(EventKind::NatKeepalive, period, now);
        }

        if self.config.uniqueids {
            // an older instance of the same connection for the same peer
            // is superseded by this one
            let stale: Vec<_> = self
                .connections
                .iter()
                .filter(|(id, d)| {
                    *id != conn
                        && d.kind == kind
                        && d.name == name
                        && d.this.id.same_id(&this_id)
                        && d.that.id.same_id(&that_id)
                        && d.newest_isakmp_sa.is_some()
                })
                .map(|(id, _)| id)
                .collect();
            for d in stale {
                if kind.is_instance() {
                    self.delete_connection(d, "superseded by a newer instance (uniqueids)");
                } else {
                    self.delete_states_by_connection(d, true, "superseded (uniqueids)");
                }
            }
        }
    }

    /// Bookkeeping for a freshly installed IPsec SA
    fn ipsec_sa_established(&mut self, serial: SerialNo) {
        let Some(conn) = self.states.get(serial).map(|st| st.connection) else {
            return;
        };
        self.metrics.record_ipsec_sa_created();
        let Some(c) = self.connections.get_mut(conn) else {
            return;
        };
        if c.newest_ipsec_sa < serial {
            c.newest_ipsec_sa = serial;
        }
        c.eroute_owner = serial;
        if c.routing != Routing::RoutedTunnel {
            let needs_route = !c.routing.is_routed();
            c.routing = Routing::RoutedTunnel;
            if needs_route {
                let route = route_spec(c);
                if let Err(e) = self.kernel.route(&route) {
                    warn!("route for {} failed: {}", route.connection, e);
                }
            }
        }
    }

    /// Retire the IPsec SA a freshly established one replaces
    fn release_old_states(&mut self, serial: SerialNo) {
        let Some(st) = self.states.get(serial) else {
            return;
        };
        let (old, conn) = (st.replacing, st.connection);
        let Some(prev) = self.states.get(old) else {
            return;
        };
        if prev.connection != conn || !prev.kind.is_quick() {
            return;
        }
        self.delete_state_with(old, true, "replaced by a newer IPsec SA");
    }

    /// Continue a transition that was suspended on `serial`
    ///
    /// `approved` carries the outcome of the asynchronous lookup; a
    /// refusal fails the exchange with INVALID_ID_INFORMATION.
    pub fn resume_suspended(&mut self, serial: SerialNo, approved: bool, now: Instant) -> bool {
        let Some(cont) = self.states.get_mut(serial).and_then(|st| st.suspended.take()) else {
            return false;
        };
        debug!(
            "resuming {} of {} after {:?}",
            cont.reason,
            serial,
            now.saturating_duration_since(cont.started)
        );
        let mut md = *cont.md;
        md.resumed = true;
        let result = if approved {
            self.run_transition(cont.resume, &mut md, now)
        } else {
            StfResult::Fail(Notification::InvalidIdInformation)
        };
        self.complete_state_transition(&mut md, result, now);
        true
    }
}
