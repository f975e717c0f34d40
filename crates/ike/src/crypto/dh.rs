//! MODP Diffie-Hellman groups for Oakley (RFC 2409 Section 6, RFC 3526)
//!
//! KE payloads and shared secrets are fixed-width big-endian numbers,
//! zero-padded to the length of the prime.

use crate::error::{Error, Result};
use crate::isakmp::oakley;
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use zeroize::Zeroize;

/// MODP group parameters.
mod modp {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    fn prime(hex_digits: &str) -> BigUint {
        BigUint::from_bytes_be(
            &hex::decode(hex_digits.replace([' ', '\n'], "").as_str()).expect("Invalid hex"),
        )
    }

    /// First Oakley group (768-bit)
    pub static P768: Lazy<BigUint> = Lazy::new(|| {
        prime(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF",
        )
    });

    /// Second Oakley group (1024-bit)
    pub static P1024: Lazy<BigUint> = Lazy::new(|| {
        prime(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
             FFFFFFFFFFFFFFFF",
        )
    });

    /// Group 5 (1536-bit)
    pub static P1536: Lazy<BigUint> = Lazy::new(|| {
        prime(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
             C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
             83655D23DCA3AD961C62F356208552BB9ED529077096966D\
             670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF",
        )
    });
}

/// Generator shared by all MODP groups
static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

/// A MODP Diffie-Hellman group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhGroup {
    /// Group 1, 768-bit MODP
    Modp768,
    /// Group 2, 1024-bit MODP
    Modp1024,
    /// Group 5, 1536-bit MODP
    Modp1536,
}

impl DhGroup {
    /// Map an OAKLEY_GROUP_DESCRIPTION value
    pub fn from_oakley(id: u16) -> Option<Self> {
        match id {
            oakley::GROUP_MODP768 => Some(DhGroup::Modp768),
            oakley::GROUP_MODP1024 => Some(DhGroup::Modp1024),
            oakley::GROUP_MODP1536 => Some(DhGroup::Modp1536),
            _ => None,
        }
    }

    /// OAKLEY_GROUP_DESCRIPTION value
    pub fn oakley_id(self) -> u16 {
        match self {
            DhGroup::Modp768 => oakley::GROUP_MODP768,
            DhGroup::Modp1024 => oakley::GROUP_MODP1024,
            DhGroup::Modp1536 => oakley::GROUP_MODP1536,
        }
    }

    /// Length of the prime (and of every KE payload) in bytes
    pub fn bytes(self) -> usize {
        match self {
            DhGroup::Modp768 => 96,
            DhGroup::Modp1024 => 128,
            DhGroup::Modp1536 => 192,
        }
    }

    fn prime(self) -> &'static BigUint {
        match self {
            DhGroup::Modp768 => &modp::P768,
            DhGroup::Modp1024 => &modp::P1024,
            DhGroup::Modp1536 => &modp::P1536,
        }
    }

    /// Generate an ephemeral key pair in this group
    pub fn generate(self) -> DhKeyPair {
        let mut rng = rand::thread_rng();
        let p = self.prime();

        // Random private key x (1 < x < p-1)
        let p_minus_one = p.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = G.modpow(&x, p);

        DhKeyPair {
            group: self,
            private_key: x.to_bytes_be(),
            public_key: self.pad(&y),
        }
    }

    fn pad(self, n: &BigUint) -> Vec<u8> {
        let raw = n.to_bytes_be();
        let mut out = vec![0u8; self.bytes().saturating_sub(raw.len())];
        out.extend_from_slice(&raw);
        out
    }
}

/// Ephemeral Diffie-Hellman key pair
pub struct DhKeyPair {
    group: DhGroup,
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl DhKeyPair {
    /// Group of this key pair
    pub fn group(&self) -> DhGroup {
        self.group
    }

    /// Public value g^x mod p, padded to the prime length
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Compute g^xy from the peer's KE payload
    ///
    /// # Errors
    ///
    /// Returns error if the peer value has the wrong length or lies
    /// outside 1 < y < p - 1.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> Result<Vec<u8>> {
        if peer_public.len() != self.group.bytes() {
            return Err(Error::InvalidLength {
                expected: self.group.bytes(),
                actual: peer_public.len(),
            });
        }

        let p = self.group.prime();
        let y_peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = p.clone() - 1u32;
        if y_peer <= BigUint::from(1u32) || y_peer >= p_minus_one {
            return Err(Error::CryptoError(
                "peer Diffie-Hellman public value out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let shared = y_peer.modpow(&x, p);
        Ok(self.group.pad(&shared))
    }
}

impl Drop for DhKeyPair {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("group", &self.group)
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}
