//! IKEv1 key derivation (RFC 2409 Section 5)
//!
//! Pre-shared key authentication only:
//!
//! ```text
//! SKEYID   = prf(pre-shared-key, Ni_b | Nr_b)
//! SKEYID_d = prf(SKEYID, g^xy | CKY-I | CKY-R | 0)
//! SKEYID_a = prf(SKEYID, SKEYID_d | g^xy | CKY-I | CKY-R | 1)
//! SKEYID_e = prf(SKEYID, SKEYID_a | g^xy | CKY-I | CKY-R | 2)
//! ```

use super::{EncryptAlgorithm, HashAlgorithm};
use crate::isakmp::Cookie;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Keys of an established (or establishing) ISAKMP SA
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct IsakmpKeys {
    /// SKEYID
    pub skeyid: Vec<u8>,
    /// SKEYID_d, for phase 2 KEYMAT
    pub skeyid_d: Vec<u8>,
    /// SKEYID_a, for phase 2 and informational HASHes
    pub skeyid_a: Vec<u8>,
    /// SKEYID_e
    pub skeyid_e: Vec<u8>,
    /// Encryption key cut from SKEYID_e (expanded when too short)
    pub enc_key: Vec<u8>,
}

impl std::fmt::Debug for IsakmpKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsakmpKeys")
            .field("ready", &!self.skeyid.is_empty())
            .finish()
    }
}

impl IsakmpKeys {
    /// Derive the SKEYID family for pre-shared key authentication
    ///
    /// # Arguments
    ///
    /// * `hash` - Negotiated hash (the PRF is HMAC over it)
    /// * `enc` - Negotiated cipher, fixes the encryption key length
    /// * `psk` - Pre-shared secret
    /// * `ni`, `nr` - Nonce payload bodies
    /// * `gxy` - Diffie-Hellman shared secret
    /// * `icookie`, `rcookie` - Cookies of the ISAKMP SA
    #[allow(clippy::too_many_arguments)]
    pub fn derive_psk(
        hash: HashAlgorithm,
        enc: EncryptAlgorithm,
        psk: &[u8],
        ni: &[u8],
        nr: &[u8],
        gxy: &[u8],
        icookie: &Cookie,
        rcookie: &Cookie,
    ) -> Self {
        let skeyid = hash.prf(psk, &[ni, nr]);
        let skeyid_d = hash.prf(&skeyid, &[gxy, icookie, rcookie, &[0]]);
        let skeyid_a = hash.prf(&skeyid, &[&skeyid_d, gxy, icookie, rcookie, &[1]]);
        let skeyid_e = hash.prf(&skeyid, &[&skeyid_a, gxy, icookie, rcookie, &[2]]);

        let need = enc.key_len();
        let enc_key = if skeyid_e.len() >= need {
            skeyid_e[..need].to_vec()
        } else {
            // K1 = prf(SKEYID_e, 0), Kn = prf(SKEYID_e, Kn-1)
            let mut out = Vec::with_capacity(need + hash.output_len());
            let mut k = hash.prf(&skeyid_e, &[&[0]]);
            out.extend_from_slice(&k);
            while out.len() < need {
                k = hash.prf(&skeyid_e, &[&k]);
                out.extend_from_slice(&k);
            }
            out.truncate(need);
            out
        };

        IsakmpKeys {
            skeyid,
            skeyid_d,
            skeyid_a,
            skeyid_e,
            enc_key,
        }
    }

    /// Have the keys been derived
    pub fn is_ready(&self) -> bool {
        !self.skeyid.is_empty()
    }
}

/// Initial phase 1 IV: hash(g^xi | g^xr), cut to the block size
pub fn phase1_iv(hash: HashAlgorithm, enc: EncryptAlgorithm, gi: &[u8], gr: &[u8]) -> Vec<u8> {
    let mut iv = hash.digest(&[gi, gr]);
    iv.truncate(enc.block_size());
    iv
}

/// IV of a phase 2 / informational exchange: hash(last phase 1 IV | M-ID)
pub fn phase2_iv(
    hash: HashAlgorithm,
    enc: EncryptAlgorithm,
    phase1_iv: &[u8],
    msgid: u32,
) -> Vec<u8> {
    let mut iv = hash.digest(&[phase1_iv, &msgid.to_be_bytes()]);
    iv.truncate(enc.block_size());
    iv
}

/// HASH_I / HASH_R of Main and Aggressive Mode
///
/// HASH_I = prf(SKEYID, g^xi | g^xr | CKY-I | CKY-R | SAi_b | IDii_b) and
/// HASH_R swaps the DH values and cookies; `g_mine`, `ck_mine` belong to
/// the side whose hash is being computed.
#[allow(clippy::too_many_arguments)]
pub fn auth_hash(
    hash: HashAlgorithm,
    skeyid: &[u8],
    g_mine: &[u8],
    g_peer: &[u8],
    ck_mine: &Cookie,
    ck_peer: &Cookie,
    sa_body: &[u8],
    id_body: &[u8],
) -> Vec<u8> {
    hash.prf(skeyid, &[g_mine, g_peer, ck_mine, ck_peer, sa_body, id_body])
}

/// Per-direction key material of one IPsec SA
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// KEYMAT for the SA whose SPI we chose (inbound)
    pub inbound: Vec<u8>,
    /// KEYMAT for the SA whose SPI the peer chose (outbound)
    pub outbound: Vec<u8>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("inbound_len", &self.inbound.len())
            .field("outbound_len", &self.outbound.len())
            .finish()
    }
}

/// KEYMAT for one direction of one protocol
///
/// ```text
/// K1 = prf(SKEYID_d, [ g(qm)^xy | ] protocol | SPI | Ni_b | Nr_b)
/// K2 = prf(SKEYID_d, K1 | [ g(qm)^xy | ] protocol | SPI | Ni_b | Nr_b)
/// ```
#[allow(clippy::too_many_arguments)]
pub fn compute_keymat(
    hash: HashAlgorithm,
    skeyid_d: &[u8],
    pfs_gxy: Option<&[u8]>,
    protocol: u8,
    spi: &[u8],
    ni: &[u8],
    nr: &[u8],
    needed: usize,
) -> Vec<u8> {
    let gxy = pfs_gxy.unwrap_or(&[]);
    let mut out = Vec::with_capacity(needed + hash.output_len());
    let mut k: Vec<u8> = Vec::new();
    while out.len() < needed {
        k = hash.prf(skeyid_d, &[&k, gxy, &[protocol], spi, ni, nr]);
        out.extend_from_slice(&k);
    }
    out.truncate(needed);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psk_derivation_is_symmetric() {
        let derive = || {
            IsakmpKeys::derive_psk(
                HashAlgorithm::Sha1,
                EncryptAlgorithm::TripleDesCbc,
                b"secret",
                &[1u8; 16],
                &[2u8; 16],
                &[3u8; 128],
                &[4u8; 8],
                &[5u8; 8],
            )
        };
        let a = derive();
        let b = derive();
        assert_eq!(a.skeyid_e, b.skeyid_e);
        assert_eq!(a.enc_key.len(), 24);
        assert!(a.is_ready());
        assert_ne!(a.skeyid_d, a.skeyid_a);
    }

    #[test]
    fn test_enc_key_expansion() {
        // MD5 output (16) is shorter than a 3DES key (24): expansion kicks in
        let keys = IsakmpKeys::derive_psk(
            HashAlgorithm::Md5,
            EncryptAlgorithm::TripleDesCbc,
            b"secret",
            b"ni",
            b"nr",
            b"gxy",
            &[0u8; 8],
            &[1u8; 8],
        );
        let k1 = HashAlgorithm::Md5.prf(&keys.skeyid_e, &[&[0]]);
        assert_eq!(&keys.enc_key[..16], &k1[..]);
        assert_eq!(keys.enc_key.len(), 24);
    }

    #[test]
    fn test_iv_lengths() {
        let iv = phase1_iv(HashAlgorithm::Md5, EncryptAlgorithm::DesCbc, b"gi", b"gr");
        assert_eq!(iv.len(), 8);
        let iv2 = phase2_iv(
            HashAlgorithm::Sha1,
            EncryptAlgorithm::AesCbc { key_bits: 128 },
            &[0u8; 16],
            7,
        );
        assert_eq!(iv2.len(), 16);
    }

    #[test]
    fn test_keymat_length_and_direction() {
        let inbound = compute_keymat(HashAlgorithm::Md5, b"d", None, 3, &[0, 0, 1, 0], b"ni", b"nr", 40);
        let outbound = compute_keymat(HashAlgorithm::Md5, b"d", None, 3, &[0, 0, 2, 0], b"ni", b"nr", 40);
        assert_eq!(inbound.len(), 40);
        assert_ne!(inbound, outbound);
    }
}
