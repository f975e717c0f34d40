//! Main Mode (identity protection), pre-shared key authentication
//!
//! ```text
//! Initiator                          Responder
//! HDR, SA                      -->
//!                              <--   HDR, SA
//! HDR, KE, Ni [, NAT-D x2]     -->
//!                              <--   HDR, KE, Nr [, NAT-D x2]
//! HDR*, IDii, HASH_I           -->
//!                              <--   HDR*, IDir, HASH_R
//! ```

use super::{
    add_natd, add_vendor_ids, check_ke, hash_matches, life_secs, nonce, oakley_story, our_id,
    phase1_auth_hash, phase1_keys, require_psk, start_dh, nat_discovery, StfResult, Step,
};
use crate::connections::{ConnId, ConnKind};
use crate::daemon::IkeDaemon;
use crate::demux::MsgDigest;
use crate::dpd::DpdConfig;
use crate::error::{Error, Result};
use crate::isakmp::{
    ExchangeType, IsakmpFlags, IsakmpHeader, MessageBuilder, Notification, PayloadType, ZERO_COOKIE,
};
use crate::logging;
use crate::policy::Policy;
use crate::spdb::{out_sa, parse_isakmp_sa_body, IsakmpSelectContext, ProposalDatabase, SaEncodeContext};
use crate::state::{new_cookie, SerialNo, State, StateKind};
use crate::timer::EventKind;
use std::time::Instant;
use tracing::info;

impl IkeDaemon {
    /// Start Main Mode for `conn`
    pub(crate) fn main_out_i1(
        &mut self,
        conn: ConnId,
        try_: u32,
        replacing: SerialNo,
        whack: bool,
        now: Instant,
    ) -> Result<SerialNo> {
        let c = self
            .connections
            .get(conn)
            .cloned()
            .ok_or_else(|| Error::ConnectionNotFound(format!("{:?}", conn)))?;

        let mut st = State::new(conn, StateKind::MainI1, true, now);
        st.icookie = new_cookie();
        st.local_addr = c.this.host_addr;
        st.local_port = c.this.host_port;
        st.peer_addr = c.that.host_addr;
        st.peer_port = c.that.host_port;
        st.policy = c.policy;
        st.try_ = try_;
        st.replacing = replacing;
        st.whack_waiting = whack;

        let db = ProposalDatabase::oakley(c.policy, c.ike);
        let sa = out_sa(&db, &SaEncodeContext::phase1(life_secs(c.ike_lifetime)), self.kernel.as_mut())?;
        let hdr = IsakmpHeader::new(st.icookie, ZERO_COOKIE, ExchangeType::IdProt, IsakmpFlags::default(), 0);
        let mut b = MessageBuilder::new(&hdr);
        b.add_payload(PayloadType::SA, &sa.body);
        let dpd = DpdConfig::new(c.dpd_delay, c.dpd_timeout).is_enabled();
        add_vendor_ids(&mut b, None, self.config.nat_traversal, dpd);
        st.p1isa = sa.body;
        st.tpacket = b.finish();

        let serial = self.states.insert(st);
        if replacing.is_some() {
            info!("initiating Main Mode to replace {}", replacing);
        } else {
            info!("initiating Main Mode");
        }
        self.send_state_packet(serial);
        let delay = self.config.retransmit_delay;
        self.schedule(EventKind::Retransmit, serial, delay, now);
        self.metrics.record_phase1_started();
        self.whack_state(
            serial,
            StateKind::MainI1.rc_code(),
            format!("{}: initiate", StateKind::MainI1.name()),
        );
        Ok(serial)
    }

    /// Responder: HDR, SA --> HDR, SA
    pub(crate) fn main_in_i1_out_r1(&mut self, md: &mut MsgDigest, now: Instant) -> Step<StfResult> {
        let Some(conn) = self.phase1_responder_connection(md, Policy::default(), "Main Mode")? else {
            return Ok(StfResult::Ignore);
        };
        let c = self.conn_snapshot(conn)?;

        let mut st = State::new(conn, StateKind::MainR0, false, now);
        st.icookie = md.hdr.icookie;
        st.rcookie = new_cookie();
        st.local_addr = md.local;
        st.local_port = md.local_port;
        st.peer_addr = md.sender;
        st.peer_port = md.sender_port;
        st.policy = c.policy;
        if let Some(vid) = md.nat_vid {
            st.nat.offer(vid);
        }
        let serial = self.states.insert(st);
        md.st = serial;
        info!("responding to Main Mode");

        let sa_body = md.first_body(PayloadType::SA).ok_or(StfResult::InternalError)?.to_vec();
        let ctx = IsakmpSelectContext {
            policy: c.policy,
            algorithms: c.ike,
            has_psk: c.psk().is_some(),
        };
        let selected = match parse_isakmp_sa_body(&sa_body, &ctx, false) {
            Ok(s) => s,
            Err(n) => {
                self.metrics.record_proposal_negotiation_failed();
                logging::log_proposal_selected("Main Mode", None);
                return Err(n.into());
            }
        };
        logging::log_proposal_selected("Main Mode", Some(&oakley_story(&selected.attrs)));

        let nat_traversal = self.config.nat_traversal;
        let dpd = DpdConfig::new(c.dpd_delay, c.dpd_timeout).is_enabled();
        let st = self.state_mut(serial)?;
        st.oakley = selected.attrs;
        st.p1isa = sa_body;

        let hdr = IsakmpHeader::new(st.icookie, st.rcookie, ExchangeType::IdProt, IsakmpFlags::default(), 0);
        let mut b = MessageBuilder::new(&hdr);
        b.add_payload(PayloadType::SA, selected.reply_body.as_deref().unwrap_or_default());
        add_vendor_ids(&mut b, Some(&st.nat), nat_traversal, dpd);
        md.reply = b.finish();
        self.metrics.record_phase1_started();
        Ok(StfResult::Ok)
    }

    /// Initiator: HDR, SA --> HDR, KE, Ni [, NAT-D]
    pub(crate) fn main_in_r1_out_i2(&mut self, md: &mut MsgDigest) -> Step<StfResult> {
        let sa_body = md.first_body(PayloadType::SA).ok_or(StfResult::InternalError)?;
        let st = self.states.get(md.st).ok_or(StfResult::InternalError)?;
        let c = self.conn_snapshot(st.connection)?;
        let ctx = IsakmpSelectContext {
            policy: c.policy,
            algorithms: c.ike,
            has_psk: c.psk().is_some(),
        };
        let selected = parse_isakmp_sa_body(sa_body, &ctx, true).map_err(|n| {
            self.metrics.record_proposal_negotiation_failed();
            logging::log_proposal_selected("Main Mode", None);
            StfResult::from(n)
        })?;
        logging::log_proposal_selected("Main Mode", Some(&oakley_story(&selected.attrs)));

        let st = self.state_mut(md.st)?;
        st.rcookie = md.hdr.rcookie;
        st.oakley = selected.attrs;
        require_psk(st)?;
        if let Some(vid) = md.nat_vid {
            st.nat.offer(vid);
        }
        let dh = start_dh(st.oakley.group)?;
        st.gi = dh.public_key().to_vec();
        st.dh = Some(dh);
        st.ni = nonce();

        let hdr = IsakmpHeader::new(st.icookie, st.rcookie, ExchangeType::IdProt, IsakmpFlags::default(), 0);
        let mut b = MessageBuilder::new(&hdr);
        b.add_payload(PayloadType::KE, &st.gi);
        b.add_payload(PayloadType::NONCE, &st.ni);
        add_natd(&mut b, st, c.forceencaps);
        md.reply = b.finish();
        Ok(StfResult::Ok)
    }

    /// Responder: HDR, KE, Ni --> HDR, KE, Nr [, NAT-D]
    pub(crate) fn main_in_i2_out_r2(&mut self, md: &mut MsgDigest) -> Step<StfResult> {
        let conn = self.states.get(md.st).ok_or(StfResult::InternalError)?.connection;
        let forceencaps = self.conn_snapshot(conn)?.forceencaps;
        let psk = self.conn_psk(conn)?;
        let ke = md.first_body(PayloadType::KE).ok_or(StfResult::InternalError)?;
        let ni = md.first_body(PayloadType::NONCE).ok_or(StfResult::InternalError)?;

        let st = self.state_mut(md.st)?;
        require_psk(st)?;
        check_ke(st.oakley.group, ke)?;
        st.gi = ke.to_vec();
        st.ni = ni.to_vec();
        nat_discovery(st, md, forceencaps);

        let dh = start_dh(st.oakley.group)?;
        st.gr = dh.public_key().to_vec();
        st.dh = Some(dh);
        st.nr = nonce();
        phase1_keys(st, &psk)?;

        let hdr = IsakmpHeader::new(st.icookie, st.rcookie, ExchangeType::IdProt, IsakmpFlags::default(), 0);
        let mut b = MessageBuilder::new(&hdr);
        b.add_payload(PayloadType::KE, &st.gr);
        b.add_payload(PayloadType::NONCE, &st.nr);
        add_natd(&mut b, st, forceencaps);
        md.reply = b.finish();
        Ok(StfResult::Ok)
    }

    /// Initiator: HDR, KE, Nr --> HDR*, IDii, HASH_I
    pub(crate) fn main_in_r2_out_i3(&mut self, md: &mut MsgDigest) -> Step<StfResult> {
        let conn = self.states.get(md.st).ok_or(StfResult::InternalError)?.connection;
        let c = self.conn_snapshot(conn)?;
        let psk = self.conn_psk(conn)?;
        let ke = md.first_body(PayloadType::KE).ok_or(StfResult::InternalError)?;
        let nr = md.first_body(PayloadType::NONCE).ok_or(StfResult::InternalError)?;

        let st = self.state_mut(md.st)?;
        check_ke(st.oakley.group, ke)?;
        st.gr = ke.to_vec();
        st.nr = nr.to_vec();
        nat_discovery(st, md, c.forceencaps);
        phase1_keys(st, &psk)?;

        let idi = our_id(&c, st).to_id_payload().to_bytes();
        let hash_i = phase1_auth_hash(st, true, &idi)?;
        let hdr = IsakmpHeader::new(st.icookie, st.rcookie, ExchangeType::IdProt, IsakmpFlags::default(), 0);
        let mut b = MessageBuilder::new(&hdr);
        b.add_payload(PayloadType::ID, &idi);
        b.add_payload(PayloadType::HASH, &hash_i);
        md.reply = b.finish();
        Ok(StfResult::Ok)
    }

    /// Responder: HDR*, IDii, HASH_I --> HDR*, IDir, HASH_R
    pub(crate) fn main_in_i3_out_r3(&mut self, md: &mut MsgDigest) -> Step<StfResult> {
        let serial = md.st;
        let idi = md.first_body(PayloadType::ID).ok_or(StfResult::InternalError)?.to_vec();
        let st = self.states.get(serial).ok_or(StfResult::InternalError)?;
        require_psk(st)?;
        let computed = phase1_auth_hash(st, true, &idi)?;
        if !hash_matches(md.first_body(PayloadType::HASH), &computed) {
            self.authentication_failed(md, "received Hash Payload does not match computed value");
            return Err(StfResult::Fail(Notification::InvalidHashInformation));
        }
        self.accept_peer_id(serial, &idi, false)?;

        let st = self.states.get(serial).ok_or(StfResult::InternalError)?;
        let c = self.conn_snapshot(st.connection)?;
        let idr = our_id(&c, st).to_id_payload().to_bytes();
        let hash_r = phase1_auth_hash(st, false, &idr)?;
        let hdr = IsakmpHeader::new(st.icookie, st.rcookie, ExchangeType::IdProt, IsakmpFlags::default(), 0);
        let mut b = MessageBuilder::new(&hdr);
        b.add_payload(PayloadType::ID, &idr);
        b.add_payload(PayloadType::HASH, &hash_r);
        md.reply = b.finish();
        Ok(StfResult::Ok)
    }

    /// Initiator: HDR*, IDir, HASH_R --> done
    pub(crate) fn main_in_r3(&mut self, md: &mut MsgDigest) -> Step<StfResult> {
        let serial = md.st;
        let idr = md.first_body(PayloadType::ID).ok_or(StfResult::InternalError)?.to_vec();
        let st = self.states.get(serial).ok_or(StfResult::InternalError)?;
        require_psk(st)?;
        let computed = phase1_auth_hash(st, false, &idr)?;
        if !hash_matches(md.first_body(PayloadType::HASH), &computed) {
            self.authentication_failed(md, "received Hash Payload does not match computed value");
            return Err(StfResult::Fail(Notification::InvalidHashInformation));
        }
        self.accept_peer_id(serial, &idr, false)?;
        Ok(StfResult::Ok)
    }

    /// Connection answering the first Phase 1 message of `md`
    ///
    /// A connection for this exact peer wins; otherwise a road warrior
    /// template is instantiated. `None` when nothing is authorized.
    pub(crate) fn phase1_responder_connection(
        &mut self,
        md: &MsgDigest,
        policy: Policy,
        mode: &str,
    ) -> Step<Option<ConnId>> {
        if let Some(c) = self.connections.find_host_connection(
            &md.local,
            md.local_port,
            Some(&md.sender),
            md.sender_port,
            policy,
        ) {
            return Ok(Some(c));
        }
        let template = self
            .connections
            .find_host_connection(&md.local, md.local_port, None, md.sender_port, policy)
            .filter(|t| {
                self.connections
                    .get(*t)
                    .map_or(false, |c| c.kind == ConnKind::Template)
            });
        match template {
            Some(t) => Ok(Some(self.connections.rw_instantiate(t, md.sender, None)?)),
            None => {
                info!(
                    "initial {} message received on {}:{} but no connection has been authorized",
                    mode, md.local, md.local_port
                );
                Ok(None)
            }
        }
    }

    /// Log and count a peer that failed to authenticate
    pub(crate) fn authentication_failed(&self, md: &MsgDigest, reason: &str) {
        logging::log_authentication_failed(&format!("{}:{}", md.sender, md.sender_port), reason);
        self.metrics.record_authentication_failed();
    }
}
