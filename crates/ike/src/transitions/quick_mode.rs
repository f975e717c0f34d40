//! Quick Mode
//!
//! ```text
//! Initiator                                   Responder
//! HDR*, HASH(1), SA, Ni [, KE] [, IDci, IDcr] -->
//!                                             <-- HDR*, HASH(2), SA, Nr [, KE] [, IDci, IDcr]
//! HDR*, HASH(3)                               -->
//! ```
//!
//! HASH(1) = prf(SKEYID_a, M-ID | SA | Ni [| KE] [| IDci | IDcr])
//! HASH(2) = prf(SKEYID_a, M-ID | Ni_b | SA | Nr [| KE] [| IDci | IDcr])
//! HASH(3) = prf(SKEYID_a, 0 | M-ID | Ni_b | Nr_b)

use super::{check_ke, hash_matches, life_secs, nonce, start_dh, StfResult, Step};
use crate::connections::{ClientQuery, ConnKind, Pending, Subnet};
use crate::crypto::keys::compute_keymat;
use crate::daemon::IkeDaemon;
use crate::demux::{MsgDigest, Transition};
use crate::error::{Error, Result};
use crate::isakmp::{
    ipsec_attr, proto, transform, ExchangeType, IdPayload, IsakmpFlags, IsakmpHeader, MessageBuilder,
    NatOaPayload, Notification, PayloadType,
};
use crate::kernel::{KernelSa, SaDirection};
use crate::logging;
use crate::nat;
use crate::policy::Policy;
use crate::spdb::{
    out_sa, parse_ipsec_sa_body, IpsecProtoInfo, IpsecSelectContext, IpsecTransAttrs, NatEncapsulation,
    PfsGroup, ProposalDatabase, SaEncodeContext,
};
use crate::state::{SerialNo, StateKind};
use crate::timer::EventKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Client identities carried by the ID payloads of Quick Mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Clients {
    initiator: Subnet,
    initiator_protocol: u8,
    initiator_port: u16,
    responder: Subnet,
    responder_protocol: u8,
    responder_port: u16,
}

/// Decode IDci / IDcr; without them the clients are the hosts themselves
fn decode_clients(md: &MsgDigest, initiator_host: IpAddr, responder_host: IpAddr) -> Step<Clients> {
    let ids = md.bodies(PayloadType::ID);
    let bad_id = StfResult::Fail(Notification::InvalidIdInformation);
    match ids.as_slice() {
        [] => Ok(Clients {
            initiator: Subnet::from_host(initiator_host),
            initiator_protocol: 0,
            initiator_port: 0,
            responder: Subnet::from_host(responder_host),
            responder_protocol: 0,
            responder_port: 0,
        }),
        [idci, idcr] => {
            let decode = |body: &[u8]| -> Step<(Subnet, u8, u16)> {
                let id = IdPayload::from_bytes(body).map_err(|_| bad_id)?;
                let net = Subnet::from_id_payload(&id).map_err(|e| {
                    info!("{}", e);
                    bad_id
                })?;
                Ok((net, id.protocol_id, id.port))
            };
            let (initiator, initiator_protocol, initiator_port) = decode(idci)?;
            let (responder, responder_protocol, responder_port) = decode(idcr)?;
            Ok(Clients {
                initiator,
                initiator_protocol,
                initiator_port,
                responder,
                responder_protocol,
                responder_port,
            })
        }
        _ => {
            info!("Quick Mode message must carry no or exactly two ID payloads");
            Err(bad_id)
        }
    }
}

/// KEYMAT bytes an SA of `protocol` with `attrs` consumes
fn keymat_len(protocol: u8, attrs: &IpsecTransAttrs) -> usize {
    let auth = match attrs.auth {
        ipsec_attr::AUTH_ALGORITHM_HMAC_MD5 => 16,
        ipsec_attr::AUTH_ALGORITHM_HMAC_SHA1 => 20,
        _ => 0,
    };
    match protocol {
        proto::IPSEC_ESP => {
            let enc = match attrs.transid {
                transform::ESP_DES => 8,
                transform::ESP_3DES => 24,
                transform::ESP_AES if attrs.key_len != 0 => usize::from(attrs.key_len / 8),
                transform::ESP_AES => 16,
                _ => 0,
            };
            enc + auth
        }
        proto::IPSEC_AH => match attrs.transid {
            transform::AH_MD5 => 16,
            transform::AH_SHA => 20,
            _ => auth,
        },
        _ => 0,
    }
}

/// Short description of a negotiated bundle for the logs
fn bundle_story(ah: Option<&IpsecProtoInfo>, esp: Option<&IpsecProtoInfo>, ipcomp: Option<&IpsecProtoInfo>) -> String {
    let mut parts = Vec::new();
    if let Some(esp) = esp {
        parts.push(format!(
            "{}/{}",
            transform::esp_name(esp.attrs.transid),
            esp.attrs.auth
        ));
    }
    if let Some(ah) = ah {
        parts.push(transform::ah_name(ah.attrs.transid).to_string());
    }
    if ipcomp.is_some() {
        parts.push("IPCOMP".to_string());
    }
    parts.join(" + ")
}

/// Keep the SPI we allocated when the peer's answer is merged in
fn merge_ours(ours: Option<IpsecProtoInfo>, theirs: Option<IpsecProtoInfo>) -> Step<Option<IpsecProtoInfo>> {
    match (ours, theirs) {
        (_, None) => Ok(None),
        (Some(o), Some(t)) => Ok(Some(IpsecProtoInfo {
            our_spi: o.our_spi,
            ..t
        })),
        (None, Some(_)) => {
            info!("Quick Mode responder accepted a protocol we did not propose");
            Err(StfResult::Fail(Notification::NoProposalChosen))
        }
    }
}

impl IkeDaemon {
    /// Start Quick Mode for `pending` under the ISAKMP SA `p1`
    pub(crate) fn quick_out_i1(&mut self, p1: SerialNo, pending: &Pending, now: Instant) -> Result<SerialNo> {
        let c = self
            .connections
            .get(pending.connection)
            .cloned()
            .ok_or_else(|| Error::ConnectionNotFound(format!("{:?}", pending.connection)))?;
        let p1st = self
            .states
            .get(p1)
            .ok_or_else(|| Error::SaNotFound(format!("ISAKMP SA {} is gone", p1)))?;
        if !p1st.kind.is_isakmp_sa_established() {
            return Err(Error::InvalidState(format!("{} is not an established ISAKMP SA", p1)));
        }
        let hash = p1st
            .hasher()
            .ok_or_else(|| Error::CryptoError("no hash negotiated".into()))?;
        let mut st = p1st.duplicate(StateKind::QuickI1, true, now);
        let pfs_group = if pending.policy.contains(Policy::PFS) {
            c.esp.pfs_group().or(Some(p1st.oakley.group))
        } else {
            None
        };
        let msgid = self
            .states
            .generate_msgid(p1)
            .ok_or_else(|| Error::Internal("no free Message ID".into()))?;

        st.connection = pending.connection;
        st.msgid = msgid;
        st.policy = pending.policy;
        st.try_ = pending.try_;
        st.replacing = pending.replacing;
        st.whack_waiting = pending.whack;
        st.pfs_group = pfs_group;
        st.our_client = c.this.client;
        st.peer_client = c.that.client;
        st.protocol = c.this.protocol;
        st.our_port = c.this.port;
        st.peer_port_client = c.that.port;

        let tunnel = pending.policy.contains(Policy::TUNNEL);
        let ctx = SaEncodeContext::quick(life_secs(c.ipsec_lifetime), pfs_group, tunnel, st.nat.encapsulation());
        let db = ProposalDatabase::ipsec(pending.policy, c.esp);
        let sa = out_sa(&db, &ctx, self.kernel.as_mut())?;
        let ours = |spi: u32| IpsecProtoInfo {
            our_spi: spi,
            ..IpsecProtoInfo::default()
        };
        st.ipsec.ah = sa.ah_spi.map(ours);
        st.ipsec.esp = sa.esp_spi.map(ours);
        st.ipsec.ipcomp = sa.ipcomp_cpi.map(|cpi| ours(u32::from(cpi)));

        st.ni = nonce();
        if let Some(group) = pfs_group {
            let dh = start_dh(group)
                .map_err(|_| Error::Config(format!("unsupported PFS group {}", group)))?;
            st.gi = dh.public_key().to_vec();
            st.dh = Some(dh);
        }

        let hdr = IsakmpHeader::new(st.icookie, st.rcookie, ExchangeType::Quick, IsakmpFlags::default(), msgid);
        let mut b = MessageBuilder::new(&hdr);
        let hash_at = b.add_payload(PayloadType::HASH, &vec![0; hash.output_len()]);
        b.add_payload(PayloadType::SA, &sa.body);
        b.add_payload(PayloadType::NONCE, &st.ni);
        if pfs_group.is_some() {
            b.add_payload(PayloadType::KE, &st.gi);
        }
        if c.this.has_client || c.that.has_client || c.this.protocol != 0 || c.this.port != 0 || c.that.port != 0 {
            let idci = c.this.client.to_id_payload(c.this.protocol, c.this.port);
            let idcr = c.that.client.to_id_payload(c.that.protocol, c.that.port);
            b.add_payload(PayloadType::ID, &idci.to_bytes());
            b.add_payload(PayloadType::ID, &idcr.to_bytes());
        }
        if let Some(method) = st.nat.method.filter(|_| st.nat.detected() && !tunnel) {
            let oa = NatOaPayload { address: st.local_addr };
            b.add_payload(method.natoa_payload(), &oa.to_bytes());
        }
        let hash_end = hash_at + hash.output_len();
        let hash1 = hash.prf(&st.keys.skeyid_a, &[&msgid.to_be_bytes(), &b.bytes()[hash_end..]]);
        b.write_at(hash_at, &hash1)?;
        let mut msg = b.finish();

        let iv = self
            .states
            .phase2_iv(p1, msgid)
            .ok_or_else(|| Error::CryptoError("ISAKMP SA has no keys".into()))?;
        let serial = self.states.insert(st);
        self.encrypt_message(serial, &iv, &mut msg)?;
        if let Some(st) = self.states.get_mut(serial) {
            st.tpacket = msg;
        }
        info!(
            "initiating Quick Mode {} to replace {} {{using isakmp {} msgid:{:08x}}}",
            serial, pending.replacing, p1, msgid
        );
        self.send_state_packet(serial);
        let delay = self.config.retransmit_delay;
        self.schedule(EventKind::Retransmit, serial, delay, now);
        self.metrics.record_phase2_started();
        self.whack_state(
            serial,
            StateKind::QuickI1.rc_code(),
            format!("{}: initiate", StateKind::QuickI1.name()),
        );
        Ok(serial)
    }

    /// Responder: HDR*, HASH(1), SA, Ni [, KE] [, IDci, IDcr] -->
    /// HDR*, HASH(2), SA, Nr [, KE] [, IDci, IDcr]
    ///
    /// No state exists until a proposal is accepted: a refusal leaves the
    /// ISAKMP SA untouched and no SPI allocated.
    pub(crate) fn quick_in_i1_out_r1(&mut self, md: &mut MsgDigest, now: Instant) -> Step<StfResult> {
        let p1 = md.st;
        let msgid = md.hdr.message_id;
        let p1st = self.states.get(p1).ok_or(StfResult::InternalError)?;
        let hash = p1st.hasher().ok_or(StfResult::InternalError)?;
        let hash_pd = *md.first(PayloadType::HASH).ok_or(StfResult::InternalError)?;
        let computed = hash.prf(&p1st.keys.skeyid_a, &[&msgid.to_be_bytes(), md.after(&hash_pd)]);
        if !hash_matches(Some(md.body(&hash_pd)), &computed) {
            self.authentication_failed(md, "received HASH(1) does not match computed value in Quick I1");
            return Err(StfResult::Fail(Notification::InvalidHashInformation));
        }
        let (p1conn, peer_id, nat_state) = (p1st.connection, p1st.peer_id.clone(), p1st.nat.clone());

        let clients = decode_clients(md, md.sender, md.local)?;
        let mut query = ClientQuery::new(clients.responder, clients.initiator);
        query.our_protocol = clients.responder_protocol;
        query.our_port = clients.responder_port;
        query.peer_protocol = clients.initiator_protocol;
        query.peer_port = clients.initiator_port;

        let Some(mut conn) = self.connections.find_client_connection(p1conn, &query) else {
            info!(
                "cannot respond to IPsec SA request because no connection is known for {}...{}",
                clients.responder, clients.initiator
            );
            return Err(StfResult::Fail(Notification::InvalidIdInformation));
        };
        let d = self.conn_snapshot(conn)?;
        let mut instantiated = false;
        if d.kind == ConnKind::Template {
            let his_id = if peer_id.is_none() { None } else { Some(&peer_id) };
            if d.policy.contains(Policy::OPPO) {
                if !md.resumed {
                    return Ok(self.suspend(md, "opportunistic lookup", Transition::QuickInI1OutR1, now));
                }
                conn = self.connections.oppo_instantiate(
                    conn,
                    md.sender,
                    his_id,
                    clients.responder.addr(),
                    clients.initiator.addr(),
                )?;
            } else {
                conn = self.connections.rw_instantiate(conn, md.sender, his_id)?;
                if let Some(i) = self.connections.get_mut(conn) {
                    if i.that.has_client_wildcard {
                        i.that.client = clients.initiator;
                        i.that.has_client = true;
                    }
                }
            }
            instantiated = true;
        }
        let d = self.conn_snapshot(conn)?;

        let sa_body = md.first_body(PayloadType::SA).ok_or(StfResult::InternalError)?;
        let ctx = IpsecSelectContext {
            policy: d.policy,
            algorithms: d.esp,
            nat_detected: nat_state.detected(),
            nat_rfc_encaps: nat_state.encapsulation() == NatEncapsulation::Rfc,
            pfs_group: PfsGroup::Unset,
        };
        let refuse = |daemon: &mut IkeDaemon, n: Notification| {
            if instantiated {
                daemon.discard_idle_instance(conn);
            }
            StfResult::Fail(n)
        };
        let mut selected = match parse_ipsec_sa_body(sa_body, &ctx, false, self.kernel.as_mut()) {
            Ok(s) => s,
            Err(n) => {
                self.metrics.record_proposal_negotiation_failed();
                logging::log_proposal_selected("Quick Mode", None);
                return Err(refuse(self, n));
            }
        };

        let ke = md.first_body(PayloadType::KE);
        match (selected.pfs_group, ke) {
            (Some(group), Some(ke)) => {
                if check_ke(group, ke).is_err() {
                    return Err(refuse(self, Notification::InvalidKeyInformation));
                }
            }
            (Some(_), None) => {
                info!("missing KE payload in Quick I1 message");
                return Err(refuse(self, Notification::InvalidKeyInformation));
            }
            (None, Some(_)) => {
                info!("KE payload unexpected in Quick I1 message: no PFS was proposed");
                return Err(refuse(self, Notification::InvalidPayloadType));
            }
            (None, None) if d.policy.contains(Policy::PFS) => {
                info!("we require PFS but Quick I1 SA specifies no GROUP_DESCRIPTION");
                return Err(refuse(self, Notification::NoProposalChosen));
            }
            (None, None) => {}
        }
        logging::log_proposal_selected(
            "Quick Mode",
            Some(&bundle_story(selected.ah.as_ref(), selected.esp.as_ref(), selected.ipcomp.as_ref())),
        );

        let p1st = self.states.get(p1).ok_or(StfResult::InternalError)?;
        let mut st = p1st.duplicate(StateKind::QuickR0, false, now);
        st.connection = conn;
        st.msgid = msgid;
        st.policy = d.policy;
        st.our_client = clients.responder;
        st.peer_client = clients.initiator;
        st.protocol = clients.responder_protocol;
        st.our_port = clients.responder_port;
        st.peer_port_client = clients.initiator_port;
        st.pfs_group = selected.pfs_group;
        st.ni = md.first_body(PayloadType::NONCE).ok_or(StfResult::InternalError)?.to_vec();
        st.nr = nonce();
        if let (Some(group), Some(ke)) = (selected.pfs_group, ke) {
            let Ok(dh) = start_dh(group) else {
                return Err(refuse(self, Notification::InvalidKeyInformation));
            };
            let gxy = match dh.compute_shared_secret(ke) {
                Ok(gxy) => gxy,
                Err(e) => {
                    info!("PFS Diffie-Hellman failed: {}", e);
                    return Err(refuse(self, Notification::InvalidKeyInformation));
                }
            };
            st.gi = ke.to_vec();
            st.gr = dh.public_key().to_vec();
            st.gxy = Zeroizing::new(gxy);
            st.dh = Some(dh);
        }
        nat::natoa_lookup(&mut st.nat, &md.bodies(PayloadType::NatOaRfc));
        let reply_sa = selected.reply_body.take().unwrap_or_default();
        st.ipsec = selected;

        let hdr = IsakmpHeader::new(st.icookie, st.rcookie, ExchangeType::Quick, IsakmpFlags::default(), msgid);
        let mut b = MessageBuilder::new(&hdr);
        let hash_at = b.add_payload(PayloadType::HASH, &vec![0; hash.output_len()]);
        b.add_payload(PayloadType::SA, &reply_sa);
        b.add_payload(PayloadType::NONCE, &st.nr);
        if st.pfs_group.is_some() {
            b.add_payload(PayloadType::KE, &st.gr);
        }
        for id in md.bodies(PayloadType::ID) {
            b.add_payload(PayloadType::ID, id);
        }
        let hash_end = hash_at + hash.output_len();
        let hash2 = hash.prf(
            &st.keys.skeyid_a,
            &[&msgid.to_be_bytes(), &st.ni, &b.bytes()[hash_end..]],
        );
        b.write_at(hash_at, &hash2)?;
        md.reply = b.finish();

        let serial = self.states.insert(st);
        md.st = serial;
        self.metrics.record_phase2_started();
        self.install_ipsec_sas(serial, true, false)?;
        Ok(StfResult::Ok)
    }

    /// Initiator: HDR*, HASH(2), SA, Nr [, KE] [, IDci, IDcr] --> HDR*, HASH(3)
    pub(crate) fn quick_in_r1_out_i2(&mut self, md: &mut MsgDigest) -> Step<StfResult> {
        let serial = md.st;
        let st = self.states.get(serial).ok_or(StfResult::InternalError)?;
        let hash = st.hasher().ok_or(StfResult::InternalError)?;
        let hash_pd = *md.first(PayloadType::HASH).ok_or(StfResult::InternalError)?;
        let computed = hash.prf(
            &st.keys.skeyid_a,
            &[&st.msgid.to_be_bytes(), &st.ni, md.after(&hash_pd)],
        );
        if !hash_matches(Some(md.body(&hash_pd)), &computed) {
            self.authentication_failed(md, "received HASH(2) does not match computed value in Quick R1");
            return Err(StfResult::Fail(Notification::InvalidHashInformation));
        }
        let c = self.conn_snapshot(st.connection)?;
        let ctx = IpsecSelectContext {
            policy: st.policy,
            algorithms: c.esp,
            nat_detected: st.nat.detected(),
            nat_rfc_encaps: st.nat.encapsulation() == NatEncapsulation::Rfc,
            pfs_group: PfsGroup::proposed(st.pfs_group),
        };
        let proposed = st.ipsec.clone();
        let sa_body = md.first_body(PayloadType::SA).ok_or(StfResult::InternalError)?;
        let selected = parse_ipsec_sa_body(sa_body, &ctx, true, self.kernel.as_mut()).map_err(|n| {
            self.metrics.record_proposal_negotiation_failed();
            logging::log_proposal_selected("Quick Mode", None);
            StfResult::from(n)
        })?;
        let ah = merge_ours(proposed.ah, selected.ah)?;
        let esp = merge_ours(proposed.esp, selected.esp)?;
        let ipcomp = merge_ours(proposed.ipcomp, selected.ipcomp)?;
        logging::log_proposal_selected("Quick Mode", Some(&bundle_story(ah.as_ref(), esp.as_ref(), ipcomp.as_ref())));

        let st = self.states.get(serial).ok_or(StfResult::InternalError)?;
        if md.count(PayloadType::ID) > 0 {
            let clients = decode_clients(md, st.local_addr, st.peer_addr)?;
            if clients.initiator != st.our_client || clients.responder != st.peer_client {
                info!("IDci, IDcr payloads returned by the responder do not match what we sent");
                return Err(StfResult::Fail(Notification::InvalidIdInformation));
            }
        }

        let nr = md.first_body(PayloadType::NONCE).ok_or(StfResult::InternalError)?;
        let ke = md.first_body(PayloadType::KE);
        let st = self.state_mut(serial)?;
        st.nr = nr.to_vec();
        match (st.pfs_group, ke) {
            (Some(group), Some(ke)) => {
                check_ke(group, ke)?;
                let dh = st.dh.as_ref().ok_or(StfResult::InternalError)?;
                let gxy = dh.compute_shared_secret(ke).map_err(|e| {
                    info!("PFS Diffie-Hellman failed: {}", e);
                    StfResult::Fail(Notification::InvalidKeyInformation)
                })?;
                st.gr = ke.to_vec();
                st.gxy = Zeroizing::new(gxy);
            }
            (Some(_), None) => {
                info!("missing KE payload in Quick R1 message");
                return Err(StfResult::Fail(Notification::InvalidKeyInformation));
            }
            (None, Some(_)) => {
                info!("KE payload unexpected in Quick R1 message: no PFS was proposed");
                return Err(StfResult::Fail(Notification::InvalidPayloadType));
            }
            (None, None) => {}
        }
        st.ipsec.ah = ah;
        st.ipsec.esp = esp;
        st.ipsec.ipcomp = ipcomp;
        st.ipsec.pfs_group = selected.pfs_group;
        nat::natoa_lookup(&mut st.nat, &md.bodies(PayloadType::NatOaRfc));

        let hash3 = hash.prf(
            &st.keys.skeyid_a,
            &[&[0], &st.msgid.to_be_bytes(), &st.ni, &st.nr],
        );
        let hdr = IsakmpHeader::new(st.icookie, st.rcookie, ExchangeType::Quick, IsakmpFlags::default(), st.msgid);
        let mut b = MessageBuilder::new(&hdr);
        b.add_payload(PayloadType::HASH, &hash3);
        md.reply = b.finish();

        self.install_ipsec_sas(serial, true, true)?;
        Ok(StfResult::Ok)
    }

    /// Responder: HDR*, HASH(3) --> done
    pub(crate) fn quick_in_i2(&mut self, md: &mut MsgDigest) -> Step<StfResult> {
        let serial = md.st;
        let st = self.states.get(serial).ok_or(StfResult::InternalError)?;
        let hash = st.hasher().ok_or(StfResult::InternalError)?;
        let computed = hash.prf(
            &st.keys.skeyid_a,
            &[&[0], &st.msgid.to_be_bytes(), &st.ni, &st.nr],
        );
        if !hash_matches(md.first_body(PayloadType::HASH), &computed) {
            self.authentication_failed(md, "received HASH(3) does not match computed value in Quick I2");
            return Err(StfResult::Fail(Notification::InvalidHashInformation));
        }
        self.install_ipsec_sas(serial, false, true)?;
        Ok(StfResult::Ok)
    }

    /// Derive KEYMAT and hand the negotiated SAs of `serial` to the kernel
    pub(crate) fn install_ipsec_sas(&mut self, serial: SerialNo, inbound: bool, outbound: bool) -> Result<()> {
        let st = self
            .states
            .get(serial)
            .ok_or_else(|| Error::SaNotFound(format!("{} is gone", serial)))?;
        let hash = st
            .hasher()
            .ok_or_else(|| Error::CryptoError("no hash negotiated".into()))?;
        let skeyid_d = Zeroizing::new(st.keys.skeyid_d.clone());
        let pfs_gxy = st.pfs_group.map(|_| st.gxy.clone());
        let (ni, nr) = (st.ni.clone(), st.nr.clone());
        let local = SocketAddr::new(st.local_addr, st.local_port);
        let peer = SocketAddr::new(st.peer_addr, st.peer_port);
        let encaps = st.nat.detected();
        let life_seconds = st.negotiated_life();
        let bundle = [
            (proto::IPSEC_AH, st.ipsec.ah),
            (proto::IPSEC_ESP, st.ipsec.esp),
            (proto::IPCOMP, st.ipsec.ipcomp),
        ];

        for (protocol, info) in bundle {
            let Some(info) = info else { continue };
            let needed = keymat_len(protocol, &info.attrs);
            let mut directions = Vec::with_capacity(2);
            if inbound {
                directions.push((SaDirection::Inbound, info.our_spi, peer, local));
            }
            if outbound {
                directions.push((SaDirection::Outbound, info.peer_spi, local, peer));
            }
            for (direction, spi, src, dst) in directions {
                let keymat = if protocol == proto::IPCOMP {
                    Vec::new()
                } else {
                    compute_keymat(
                        hash,
                        &skeyid_d,
                        pfs_gxy.as_ref().map(|g| g.as_slice()),
                        protocol,
                        &spi.to_be_bytes(),
                        &ni,
                        &nr,
                        needed,
                    )
                };
                let sa = KernelSa {
                    protocol,
                    spi,
                    direction,
                    src: src.ip(),
                    dst: dst.ip(),
                    transform_id: info.attrs.transid,
                    auth: info.attrs.auth,
                    key_len: info.attrs.key_len,
                    tunnel: info.attrs.is_tunnel(),
                    encap_ports: encaps.then_some((src.port(), dst.port())),
                    keymat,
                    life_seconds,
                };
                self.kernel.install_sa(sa)?;
                logging::log_kernel_sa("add", proto::name(protocol), spi, direction == SaDirection::Inbound);
            }
        }
        debug!("IPsec SAs of {} installed (inbound {}, outbound {})", serial, inbound, outbound);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, DaemonConfig, EndConfig};
    use crate::kernel::MemoryKernel;
    use crate::whack::{WhackCommand, WhackMessage};

    fn addr(s: &str) -> IpAddr {
        s.parse().expect("valid address")
    }

    /// Listening daemon with one opportunistic template requiring PFS
    fn oe_daemon(me: &str) -> IkeDaemon {
        let config = DaemonConfig::builder()
            .with_interface(addr(me))
            .build()
            .expect("valid config");
        let mut d = IkeDaemon::new(config, Box::new(MemoryKernel::new())).expect("daemon created");
        let oe = ConnectionConfig::builder("oe")
            .with_left(EndConfig::host(addr(me)))
            .with_right(EndConfig::any().with_client("0.0.0.0/32".parse().expect("valid subnet")))
            .with_policy(Policy::new(
                Policy::PSK | Policy::ENCRYPT | Policy::TUNNEL | Policy::PFS | Policy::OPPO,
            ))
            .with_psk(b"a shared secret".to_vec())
            .build()
            .expect("valid connection");
        d.handle_whack(
            WhackMessage::new()
                .with(WhackCommand::AddConnection(oe))
                .with(WhackCommand::Listen),
            Instant::now(),
        );
        d
    }

    #[test]
    fn test_bad_pfs_value_discards_new_instance() {
        let now = Instant::now();
        let mut west = oe_daemon("192.0.2.1");
        let mut east = oe_daemon("198.51.100.7");
        west.handle_whack(
            WhackMessage::new().with(WhackCommand::OppoInitiate {
                our_client: addr("192.0.2.1"),
                peer_client: addr("198.51.100.7"),
                asynchronous: true,
            }),
            now,
        );
        for _ in 0..16 {
            let from_west = west.take_outgoing();
            let from_east = east.take_outgoing();
            if from_west.is_empty() && from_east.is_empty() {
                break;
            }
            for d in from_west {
                east.process_datagram(d.from, d.to, &d.data, now);
            }
            for d in from_east {
                west.process_datagram(d.from, d.to, &d.data, now);
            }
        }
        let parked = east
            .states()
            .iter()
            .find(|st| st.suspended.is_some())
            .map(|st| st.serial)
            .expect("Quick I1 waits on the opportunistic lookup");

        // zero the initiator's PFS public value and recompute HASH(1) over it
        let st = east.states.get_mut(parked).expect("parked state");
        let hash = st.hasher().expect("negotiated hash");
        let skeyid_a = st.keys.skeyid_a.clone();
        let md = &mut st.suspended.as_mut().expect("continuation").md;
        let ke = *md.first(PayloadType::KE).expect("KE payload");
        md.message[ke.offset..ke.end()].fill(0);
        let hash_pd = *md.first(PayloadType::HASH).expect("HASH payload");
        let msgid = md.hdr.message_id;
        let hash1 = hash.prf(&skeyid_a, &[&msgid.to_be_bytes(), md.after(&hash_pd)]);
        md.message[hash_pd.offset..hash_pd.end()].copy_from_slice(&hash1);

        let connections = east.connections().len();
        assert!(east.resume_suspended(parked, true, now));
        assert_eq!(east.connections().len(), connections);
        assert!(east.states().iter().all(|st| !st.kind.is_quick()));
    }

    #[test]
    fn test_keymat_len_per_transform() {
        let esp = |transid, key_len, auth| IpsecTransAttrs {
            transid,
            key_len,
            auth,
            ..IpsecTransAttrs::default()
        };
        assert_eq!(
            keymat_len(proto::IPSEC_ESP, &esp(transform::ESP_3DES, 0, ipsec_attr::AUTH_ALGORITHM_HMAC_SHA1)),
            44
        );
        assert_eq!(
            keymat_len(proto::IPSEC_ESP, &esp(transform::ESP_AES, 256, ipsec_attr::AUTH_ALGORITHM_HMAC_MD5)),
            48
        );
        assert_eq!(
            keymat_len(proto::IPSEC_ESP, &esp(transform::ESP_AES, 0, ipsec_attr::AUTH_ALGORITHM_HMAC_SHA1)),
            36
        );
        assert_eq!(keymat_len(proto::IPSEC_AH, &esp(transform::AH_SHA, 0, 0)), 20);
        assert_eq!(keymat_len(proto::IPCOMP, &esp(transform::IPCOMP_DEFLATE, 0, 0)), 0);
    }

    #[test]
    fn test_merge_keeps_our_spi() {
        let ours = IpsecProtoInfo {
            our_spi: 0x1111,
            ..IpsecProtoInfo::default()
        };
        let theirs = IpsecProtoInfo {
            peer_spi: 0x2222,
            ..IpsecProtoInfo::default()
        };
        let merged = merge_ours(Some(ours), Some(theirs)).unwrap().unwrap();
        assert_eq!(merged.our_spi, 0x1111);
        assert_eq!(merged.peer_spi, 0x2222);
        assert_eq!(merge_ours(Some(ours), None).unwrap(), None);
        assert_eq!(
            merge_ours(None, Some(theirs)),
            Err(StfResult::Fail(Notification::NoProposalChosen))
        );
    }
}
