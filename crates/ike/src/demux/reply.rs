//! Outgoing protected messages and error notifications

use super::MsgDigest;
use crate::config::MAXIMUM_MALFORMED_NOTIFY;
use crate::daemon::IkeDaemon;
use crate::error::{Error, Result};
use crate::isakmp::{
    patch_length, proto, ExchangeType, IsakmpFlags, IsakmpHeader, MessageBuilder, Notification,
    NotificationPayload, PayloadType, ISAKMP_DOI_IPSEC, ISAKMP_HEADER_SIZE,
};
use crate::crypto::EncryptAlgorithm;
use crate::logging;
use crate::state::{SerialNo, StateKind};
use std::net::SocketAddr;
use tracing::debug;

/// Offset of the flags byte in the ISAKMP header
const FLAGS_OFFSET: usize = 19;

/// Encrypt everything after the header of `msg` in place
///
/// The body is zero padded to the cipher block size; the length field is
/// patched. Returns the last ciphertext block, the IV of the next message.
fn seal(enc: EncryptAlgorithm, key: &[u8], iv: &[u8], msg: &mut Vec<u8>) -> Result<Vec<u8>> {
    if msg.len() <= ISAKMP_HEADER_SIZE {
        return Err(Error::InvalidMessage("nothing to encrypt".into()));
    }
    let bs = enc.block_size();
    let mut body = msg.split_off(ISAKMP_HEADER_SIZE);
    let padded = (body.len() + bs - 1) / bs * bs;
    body.resize(padded, 0);
    let cipher = enc.encrypt(key, iv, &body)?;
    let next_iv = cipher[cipher.len() - bs..].to_vec();
    msg.extend_from_slice(&cipher);
    msg[FLAGS_OFFSET] |= IsakmpFlags::ENCRYPTION;
    patch_length(msg);
    Ok(next_iv)
}

impl IkeDaemon {
    /// Encrypt an outgoing message of `serial` starting from `iv`; the
    /// state's IV moves on to the last ciphertext block
    pub(crate) fn encrypt_message(&mut self, serial: SerialNo, iv: &[u8], msg: &mut Vec<u8>) -> Result<()> {
        let st = self
            .states
            .get_mut(serial)
            .ok_or_else(|| Error::SaNotFound(format!("{} is gone", serial)))?;
        let enc = st
            .encrypter()
            .ok_or_else(|| Error::CryptoError("no cipher negotiated".into()))?;
        st.iv = seal(enc, &st.keys.enc_key, iv, msg)?;
        Ok(())
    }

    /// Send an Informational exchange protected by the ISAKMP SA `p1`
    ///
    /// The message gets a fresh Message ID and its own Phase 2 IV, so the
    /// chaining IV of `p1` is left alone.
    pub(crate) fn send_informational(&mut self, p1: SerialNo, payloads: &[(PayloadType, Vec<u8>)]) -> Result<()> {
        let msgid = self
            .states
            .generate_msgid(p1)
            .ok_or_else(|| Error::Internal("no free Message ID".into()))?;
        let iv = self
            .states
            .phase2_iv(p1, msgid)
            .ok_or_else(|| Error::CryptoError("ISAKMP SA has no keys".into()))?;
        let st = self
            .states
            .get(p1)
            .ok_or_else(|| Error::SaNotFound(format!("{} is gone", p1)))?;
        let hash = st
            .hasher()
            .ok_or_else(|| Error::CryptoError("no hash negotiated".into()))?;
        let enc = st
            .encrypter()
            .ok_or_else(|| Error::CryptoError("no cipher negotiated".into()))?;

        let hdr = IsakmpHeader::new(
            st.icookie,
            st.rcookie,
            ExchangeType::Informational,
            IsakmpFlags::encrypted(),
            msgid,
        );
        let mut builder = MessageBuilder::new(&hdr);
        let hash_at = builder.add_payload(PayloadType::HASH, &vec![0; hash.output_len()]);
        for (ptype, body) in payloads {
            builder.add_payload(*ptype, body);
        }
        // HASH(1) = prf(SKEYID_a, M-ID | payloads after HASH)
        let hash_end = hash_at + hash.output_len();
        let digest = hash.prf(
            &st.keys.skeyid_a,
            &[&msgid.to_be_bytes(), &builder.bytes()[hash_end..]],
        );
        builder.write_at(hash_at, &digest)?;
        let mut msg = builder.finish();
        seal(enc, &st.keys.enc_key, &iv, &mut msg)?;

        let from = SocketAddr::new(st.local_addr, st.local_port);
        let to = SocketAddr::new(st.peer_addr, st.peer_port);
        self.queue_datagram(from, to, &msg);
        Ok(())
    }

    /// Tell the sender of `md` why its message was refused
    ///
    /// Under an established ISAKMP SA the notification is protected;
    /// otherwise it goes in the clear with the cookies of the refused
    /// message. Nothing is sent in answer to an Informational exchange, nor
    /// to a Phase 1 first message, whose sender is still unauthenticated.
    pub(crate) fn send_notification(&mut self, md: &MsgDigest, n: Notification) {
        if matches!(md.from_state, StateKind::Info | StateKind::InfoProtected)
            || md.hdr.exchange_type == ExchangeType::Informational.to_u8()
        {
            return;
        }
        if matches!(md.from_state, StateKind::MainR0 | StateKind::AggrR0) {
            debug!("not sending {} to {}: first message of the exchange", n, md.sender);
            return;
        }
        if n == Notification::PayloadMalformed && md.st.is_some() {
            if let Some(st) = self.states.get_mut(md.st) {
                st.malformed_sent += 1;
                let (sent, received) = (st.malformed_sent, st.malformed_received);
                if sent > MAXIMUM_MALFORMED_NOTIFY / 2 && sent + received > MAXIMUM_MALFORMED_NOTIFY {
                    debug!("too many ({}) malformed payloads; deleting state", sent + received);
                    self.delete_state_with(md.st, false, "too many malformed payloads");
                    return;
                }
            }
        }

        let body = NotificationPayload {
            doi: ISAKMP_DOI_IPSEC,
            protocol_id: proto::ISAKMP,
            notify_type: n.to_u16(),
            spi: Vec::new(),
            data: Vec::new(),
        }
        .to_bytes();

        let peer = format!("{}:{}", md.sender, md.sender_port);
        let sent = match self.established_isakmp_sa(md.st) {
            Some(p1) => self.send_informational(p1, &[(PayloadType::N, body)]),
            None => {
                let hdr = IsakmpHeader::new(
                    md.hdr.icookie,
                    md.hdr.rcookie,
                    ExchangeType::Informational,
                    IsakmpFlags::default(),
                    0,
                );
                let mut builder = MessageBuilder::new(&hdr);
                builder.add_payload(PayloadType::N, &body);
                let msg = builder.finish();
                let from = SocketAddr::new(md.local, md.local_port);
                let to = SocketAddr::new(md.sender, md.sender_port);
                self.queue_datagram(from, to, &msg);
                Ok(())
            }
        };
        match sent {
            Ok(()) => {
                logging::log_notification_sent(&peer, &n.to_string());
                self.metrics.record_notification_sent();
            }
            Err(e) => debug!("cannot send {} to {}: {}", n, peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_pads_and_sets_flag() {
        let hdr = IsakmpHeader::new([1; 8], [2; 8], ExchangeType::Informational, IsakmpFlags::default(), 7);
        let mut builder = MessageBuilder::new(&hdr);
        builder.add_payload(PayloadType::N, &[0u8; 13]);
        let mut msg = builder.finish();

        let enc = EncryptAlgorithm::AesCbc { key_bits: 128 };
        let iv = seal(enc, &[7u8; 16], &[0u8; 16], &mut msg).unwrap();

        assert_eq!(iv.len(), 16);
        assert_eq!((msg.len() - ISAKMP_HEADER_SIZE) % 16, 0);
        assert_eq!(msg[FLAGS_OFFSET] & IsakmpFlags::ENCRYPTION, IsakmpFlags::ENCRYPTION);
        let hdr = IsakmpHeader::from_bytes(&msg).unwrap();
        assert_eq!(hdr.length as usize, msg.len());
        assert_eq!(&msg[msg.len() - 16..], iv.as_slice());
    }

    #[test]
    fn test_seal_refuses_empty_body() {
        let hdr = IsakmpHeader::new([1; 8], [2; 8], ExchangeType::Informational, IsakmpFlags::default(), 7);
        let mut msg = MessageBuilder::new(&hdr).finish();
        let enc = EncryptAlgorithm::TripleDesCbc;
        assert!(seal(enc, &[7u8; 24], &[0u8; 8], &mut msg).is_err());
    }
}
