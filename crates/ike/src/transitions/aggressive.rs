//! Aggressive Mode, pre-shared key authentication only
//!
//! ```text
//! Initiator                          Responder
//! HDR, SA, KE, Ni, IDii        -->
//!                              <--   HDR, SA, KE, Nr, IDir, HASH_R [, NAT-D]
//! HDR*, HASH_I [, NAT-D]       -->
//! ```
//!
//! The initiator commits to one group before hearing from the responder,
//! so the first proposal carries a single transform.

use super::{
    add_natd, add_vendor_ids, check_ke, hash_matches, life_secs, nat_discovery, nonce, oakley_story,
    our_id, phase1_auth_hash, phase1_keys, require_psk, start_dh, StfResult, Step,
};
use crate::connections::ConnId;
use crate::daemon::IkeDaemon;
use crate::demux::MsgDigest;
use crate::dpd::DpdConfig;
use crate::error::{Error, Result};
use crate::isakmp::{
    ExchangeType, IsakmpFlags, IsakmpHeader, MessageBuilder, Notification, PayloadType, ZERO_COOKIE,
};
use crate::logging;
use crate::policy::Policy;
use crate::spdb::{
    init_st_oakley, out_sa, parse_isakmp_sa_body, IsakmpSelectContext, ProposalDatabase, SaEncodeContext,
};
use crate::state::{new_cookie, SerialNo, State, StateKind};
use crate::timer::EventKind;
use std::time::Instant;
use tracing::info;

impl IkeDaemon {
    /// Start Aggressive Mode for `conn`
    pub(crate) fn aggr_out_i1(
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
        if c.psk().is_none() {
            return Err(Error::Config(format!(
                "Aggressive Mode for \"{}\" needs a pre-shared key",
                c.name
            )));
        }
        let life = life_secs(c.ike_lifetime);
        let attrs = init_st_oakley(c.ike, life)
            .ok_or_else(|| Error::Config(format!("no Aggressive Mode transform for \"{}\"", c.name)))?;

        let mut st = State::new(conn, StateKind::AggrI1, true, now);
        st.icookie = new_cookie();
        st.local_addr = c.this.host_addr;
        st.local_port = c.this.host_port;
        st.peer_addr = c.that.host_addr;
        st.peer_port = c.that.host_port;
        st.policy = c.policy;
        st.try_ = try_;
        st.replacing = replacing;
        st.whack_waiting = whack;
        st.oakley = attrs;

        let dh = start_dh(attrs.group)
            .map_err(|_| Error::Config(format!("unsupported group {} for \"{}\"", attrs.group, c.name)))?;
        st.gi = dh.public_key().to_vec();
        st.dh = Some(dh);
        st.ni = nonce();

        let db = ProposalDatabase::aggressive(c.ike);
        let sa = out_sa(&db, &SaEncodeContext::phase1(life), self.kernel.as_mut())?;
        let idi = our_id(&c, &st).to_id_payload().to_bytes();
        let hdr = IsakmpHeader::new(st.icookie, ZERO_COOKIE, ExchangeType::Aggressive, IsakmpFlags::default(), 0);
        let mut b = MessageBuilder::new(&hdr);
        b.add_payload(PayloadType::SA, &sa.body);
        b.add_payload(PayloadType::KE, &st.gi);
        b.add_payload(PayloadType::NONCE, &st.ni);
        b.add_payload(PayloadType::ID, &idi);
        let dpd = DpdConfig::new(c.dpd_delay, c.dpd_timeout).is_enabled();
        add_vendor_ids(&mut b, None, self.config.nat_traversal, dpd);
        st.p1isa = sa.body;
        st.tpacket = b.finish();

        let serial = self.states.insert(st);
        info!("initiating Aggressive Mode");
        self.send_state_packet(serial);
        let delay = self.config.retransmit_delay;
        self.schedule(EventKind::Retransmit, serial, delay, now);
        self.metrics.record_phase1_started();
        self.whack_state(
            serial,
            StateKind::AggrI1.rc_code(),
            format!("{}: initiate", StateKind::AggrI1.name()),
        );
        Ok(serial)
    }

    /// Responder: HDR, SA, KE, Ni, IDii --> HDR, SA, KE, Nr, IDir, HASH_R
    pub(crate) fn aggr_in_i1_out_r1(&mut self, md: &mut MsgDigest, now: Instant) -> Step<StfResult> {
        let policy = Policy::new(Policy::AGGRESSIVE);
        let Some(conn) = self.phase1_responder_connection(md, policy, "Aggressive Mode")? else {
            return Ok(StfResult::Ignore);
        };
        let c = self.conn_snapshot(conn)?;

        let mut st = State::new(conn, StateKind::AggrR0, false, now);
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
        info!("responding to Aggressive Mode");

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
                logging::log_proposal_selected("Aggressive Mode", None);
                return Err(n.into());
            }
        };
        logging::log_proposal_selected("Aggressive Mode", Some(&oakley_story(&selected.attrs)));
        self.metrics.record_phase1_started();

        let ke = md.first_body(PayloadType::KE).ok_or(StfResult::InternalError)?;
        let ni = md.first_body(PayloadType::NONCE).ok_or(StfResult::InternalError)?;
        let idi = md.first_body(PayloadType::ID).ok_or(StfResult::InternalError)?.to_vec();
        let st = self.state_mut(serial)?;
        st.oakley = selected.attrs;
        st.p1isa = sa_body;
        require_psk(st)?;
        check_ke(st.oakley.group, ke)?;
        st.gi = ke.to_vec();
        st.ni = ni.to_vec();

        // the peer's identity picks the connection, and with it the secret
        self.accept_peer_id(serial, &idi, true)?;
        let conn = self.states.get(serial).ok_or(StfResult::InternalError)?.connection;
        let c = self.conn_snapshot(conn)?;
        let psk = self.conn_psk(conn)?;

        let nat_traversal = self.config.nat_traversal;
        let st = self.state_mut(serial)?;
        st.peer_id_body = idi;
        let dh = start_dh(st.oakley.group)?;
        st.gr = dh.public_key().to_vec();
        st.dh = Some(dh);
        st.nr = nonce();
        phase1_keys(st, &psk)?;

        let idr = our_id(&c, st).to_id_payload().to_bytes();
        let hash_r = phase1_auth_hash(st, false, &idr)?;
        let hdr = IsakmpHeader::new(st.icookie, st.rcookie, ExchangeType::Aggressive, IsakmpFlags::default(), 0);
        let mut b = MessageBuilder::new(&hdr);
        b.add_payload(PayloadType::SA, selected.reply_body.as_deref().unwrap_or_default());
        b.add_payload(PayloadType::KE, &st.gr);
        b.add_payload(PayloadType::NONCE, &st.nr);
        b.add_payload(PayloadType::ID, &idr);
        b.add_payload(PayloadType::HASH, &hash_r);
        let dpd = DpdConfig::new(c.dpd_delay, c.dpd_timeout).is_enabled();
        add_vendor_ids(&mut b, Some(&st.nat), nat_traversal, dpd);
        add_natd(&mut b, st, c.forceencaps);
        md.reply = b.finish();
        Ok(StfResult::Ok)
    }

    /// Initiator: HDR, SA, KE, Nr, IDir, HASH_R --> HDR*, HASH_I
    pub(crate) fn aggr_in_r1_out_i2(&mut self, md: &mut MsgDigest) -> Step<StfResult> {
        let serial = md.st;
        let conn = self.states.get(serial).ok_or(StfResult::InternalError)?.connection;
        let c = self.conn_snapshot(conn)?;
        let psk = self.conn_psk(conn)?;

        let sa_body = md.first_body(PayloadType::SA).ok_or(StfResult::InternalError)?;
        let ctx = IsakmpSelectContext {
            policy: c.policy,
            algorithms: c.ike,
            has_psk: true,
        };
        let selected = parse_isakmp_sa_body(sa_body, &ctx, true).map_err(|n| {
            self.metrics.record_proposal_negotiation_failed();
            logging::log_proposal_selected("Aggressive Mode", None);
            StfResult::from(n)
        })?;
        let committed = self.states.get(serial).ok_or(StfResult::InternalError)?.oakley;
        if selected.attrs.group != committed.group || selected.attrs.auth != committed.auth {
            info!("Aggressive Mode responder chose a transform we did not offer");
            return Err(StfResult::Fail(Notification::NoProposalChosen));
        }
        logging::log_proposal_selected("Aggressive Mode", Some(&oakley_story(&selected.attrs)));

        let ke = md.first_body(PayloadType::KE).ok_or(StfResult::InternalError)?;
        let nr = md.first_body(PayloadType::NONCE).ok_or(StfResult::InternalError)?;
        let idr = md.first_body(PayloadType::ID).ok_or(StfResult::InternalError)?.to_vec();
        let st = self.state_mut(serial)?;
        st.rcookie = md.hdr.rcookie;
        st.oakley = selected.attrs;
        if let Some(vid) = md.nat_vid {
            st.nat.offer(vid);
        }
        check_ke(st.oakley.group, ke)?;
        st.gr = ke.to_vec();
        st.nr = nr.to_vec();
        phase1_keys(st, &psk)?;

        self.accept_peer_id(serial, &idr, true)?;
        let st = self.states.get(serial).ok_or(StfResult::InternalError)?;
        let computed = phase1_auth_hash(st, false, &idr)?;
        if !hash_matches(md.first_body(PayloadType::HASH), &computed) {
            self.authentication_failed(md, "received Hash Payload does not match computed value");
            return Err(StfResult::Fail(Notification::InvalidHashInformation));
        }

        let st = self.state_mut(serial)?;
        nat_discovery(st, md, c.forceencaps);
        let idi = our_id(&c, st).to_id_payload().to_bytes();
        let hash_i = phase1_auth_hash(st, true, &idi)?;
        let hdr = IsakmpHeader::new(st.icookie, st.rcookie, ExchangeType::Aggressive, IsakmpFlags::default(), 0);
        let mut b = MessageBuilder::new(&hdr);
        b.add_payload(PayloadType::HASH, &hash_i);
        add_natd(&mut b, st, c.forceencaps);
        md.reply = b.finish();
        Ok(StfResult::Ok)
    }

    /// Responder: HDR*, HASH_I --> done
    pub(crate) fn aggr_in_i2(&mut self, md: &mut MsgDigest) -> Step<StfResult> {
        let serial = md.st;
        let conn = self.states.get(serial).ok_or(StfResult::InternalError)?.connection;
        let forceencaps = self.conn_snapshot(conn)?.forceencaps;
        let st = self.states.get(serial).ok_or(StfResult::InternalError)?;
        let computed = phase1_auth_hash(st, true, &st.peer_id_body)?;
        if !hash_matches(md.first_body(PayloadType::HASH), &computed) {
            self.authentication_failed(md, "received Hash Payload does not match computed value");
            return Err(StfResult::Fail(Notification::InvalidHashInformation));
        }
        let st = self.state_mut(serial)?;
        nat_discovery(st, md, forceencaps);
        Ok(StfResult::Ok)
    }
}
