//! Oakley hash algorithms and the HMAC PRF built on them

use crate::isakmp::oakley;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Hash algorithm negotiated for an ISAKMP SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// MD5
    Md5,
    /// SHA-1
    Sha1,
    /// SHA2-256
    Sha256,
}

impl HashAlgorithm {
    /// Map an OAKLEY_HASH_ALGORITHM value
    pub fn from_oakley(id: u16) -> Option<Self> {
        match id {
            oakley::MD5 => Some(HashAlgorithm::Md5),
            oakley::SHA1 => Some(HashAlgorithm::Sha1),
            oakley::SHA2_256 => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }

    /// OAKLEY_HASH_ALGORITHM value
    pub fn oakley_id(self) -> u16 {
        match self {
            HashAlgorithm::Md5 => oakley::MD5,
            HashAlgorithm::Sha1 => oakley::SHA1,
            HashAlgorithm::Sha256 => oakley::SHA2_256,
        }
    }

    /// Output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }

    /// Plain hash of the concatenation of `parts`
    pub fn digest(self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlgorithm::Md5 => {
                let mut h = Md5::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
            HashAlgorithm::Sha1 => {
                let mut h = Sha1::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut h = Sha256::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
        }
    }

    /// Compute prf(key, parts...) as HMAC with this hash
    ///
    /// # Arguments
    ///
    /// * `key` - PRF key
    /// * `parts` - Input data, concatenated in order
    pub fn prf(self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlgorithm::Md5 => {
                let mut mac =
                    Hmac::<Md5>::new_from_slice(key).expect("HMAC can take key of any size");
                for p in parts {
                    mac.update(p);
                }
                mac.finalize().into_bytes().to_vec()
            }
            HashAlgorithm::Sha1 => {
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(key).expect("HMAC can take key of any size");
                for p in parts {
                    mac.update(p);
                }
                mac.finalize().into_bytes().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
                for p in parts {
                    mac.update(p);
                }
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_lengths() {
        assert_eq!(HashAlgorithm::Md5.digest(&[b"abc"]).len(), 16);
        assert_eq!(HashAlgorithm::Sha1.prf(b"k", &[b"abc"]).len(), 20);
        assert_eq!(HashAlgorithm::Sha256.prf(b"k", &[b"abc"]).len(), 32);
    }

    #[test]
    fn test_md5_known_answer() {
        // RFC 1321 test suite
        assert_eq!(
            hex::encode(HashAlgorithm::Md5.digest(&[b"abc"])),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_hmac_md5_known_answer() {
        // RFC 2104 test case 2
        let mac = HashAlgorithm::Md5.prf(b"Jefe", &[b"what do ya want ", b"for nothing?"]);
        assert_eq!(hex::encode(mac), "750c783e6ab0b503eaa86e310a5db738");
    }

    #[test]
    fn test_parts_are_concatenated() {
        let joined = HashAlgorithm::Sha1.prf(b"key", &[b"helloworld"]);
        let split = HashAlgorithm::Sha1.prf(b"key", &[b"hello", b"world"]);
        assert_eq!(joined, split);
    }

    #[test]
    fn test_from_oakley() {
        assert_eq!(HashAlgorithm::from_oakley(1), Some(HashAlgorithm::Md5));
        assert_eq!(HashAlgorithm::from_oakley(2), Some(HashAlgorithm::Sha1));
        assert_eq!(HashAlgorithm::from_oakley(3), None);
    }
}
