//! CBC ciphers protecting ISAKMP messages
//!
//! ISAKMP encrypts everything after the header with the negotiated cipher
//! in CBC mode; the sender pads to the block size and the receiver treats
//! whatever trails the last payload as padding, so no padding scheme is
//! applied here.

use crate::error::{Error, Result};
use crate::isakmp::oakley;
use aes::{Aes128, Aes192, Aes256};
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use des::{Des, TdesEde3};

/// Encryption algorithm negotiated for an ISAKMP SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptAlgorithm {
    /// DES-CBC
    DesCbc,
    /// 3DES-CBC (EDE3)
    TripleDesCbc,
    /// AES-CBC with a 128, 192 or 256 bit key
    AesCbc {
        /// Key length in bits
        key_bits: u16,
    },
}

impl EncryptAlgorithm {
    /// Map an OAKLEY_ENCRYPTION_ALGORITHM value and optional key length
    pub fn from_oakley(id: u16, key_bits: u16) -> Option<Self> {
        match (id, key_bits) {
            (oakley::DES_CBC, 0) => Some(EncryptAlgorithm::DesCbc),
            (oakley::TRIPLE_DES_CBC, 0) => Some(EncryptAlgorithm::TripleDesCbc),
            (oakley::AES_CBC, 0) => Some(EncryptAlgorithm::AesCbc { key_bits: 128 }),
            (oakley::AES_CBC, bits @ (128 | 192 | 256)) => {
                Some(EncryptAlgorithm::AesCbc { key_bits: bits })
            }
            _ => None,
        }
    }

    /// OAKLEY_ENCRYPTION_ALGORITHM value
    pub fn oakley_id(self) -> u16 {
        match self {
            EncryptAlgorithm::DesCbc => oakley::DES_CBC,
            EncryptAlgorithm::TripleDesCbc => oakley::TRIPLE_DES_CBC,
            EncryptAlgorithm::AesCbc { .. } => oakley::AES_CBC,
        }
    }

    /// Key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            EncryptAlgorithm::DesCbc => 8,
            EncryptAlgorithm::TripleDesCbc => 24,
            EncryptAlgorithm::AesCbc { key_bits } => key_bits as usize / 8,
        }
    }

    /// Block size in bytes
    pub fn block_size(self) -> usize {
        match self {
            EncryptAlgorithm::DesCbc | EncryptAlgorithm::TripleDesCbc => 8,
            EncryptAlgorithm::AesCbc { .. } => 16,
        }
    }

    /// Encrypt `data` (a whole number of blocks) in CBC mode
    ///
    /// # Arguments
    ///
    /// * `key` - Encryption key, exactly `key_len()` bytes
    /// * `iv` - Initialization vector, exactly `block_size()` bytes
    /// * `data` - Plaintext, already padded
    pub fn encrypt(self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.check(key, iv, data)?;
        match self {
            EncryptAlgorithm::DesCbc => cbc_encrypt::<cbc::Encryptor<Des>>(key, iv, data),
            EncryptAlgorithm::TripleDesCbc => {
                cbc_encrypt::<cbc::Encryptor<TdesEde3>>(key, iv, data)
            }
            EncryptAlgorithm::AesCbc { key_bits: 128 } => {
                cbc_encrypt::<cbc::Encryptor<Aes128>>(key, iv, data)
            }
            EncryptAlgorithm::AesCbc { key_bits: 192 } => {
                cbc_encrypt::<cbc::Encryptor<Aes192>>(key, iv, data)
            }
            EncryptAlgorithm::AesCbc { .. } => cbc_encrypt::<cbc::Encryptor<Aes256>>(key, iv, data),
        }
    }

    /// Decrypt `data` (a whole number of blocks) in CBC mode
    pub fn decrypt(self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.check(key, iv, data)?;
        match self {
            EncryptAlgorithm::DesCbc => cbc_decrypt::<cbc::Decryptor<Des>>(key, iv, data),
            EncryptAlgorithm::TripleDesCbc => {
                cbc_decrypt::<cbc::Decryptor<TdesEde3>>(key, iv, data)
            }
            EncryptAlgorithm::AesCbc { key_bits: 128 } => {
                cbc_decrypt::<cbc::Decryptor<Aes128>>(key, iv, data)
            }
            EncryptAlgorithm::AesCbc { key_bits: 192 } => {
                cbc_decrypt::<cbc::Decryptor<Aes192>>(key, iv, data)
            }
            EncryptAlgorithm::AesCbc { .. } => cbc_decrypt::<cbc::Decryptor<Aes256>>(key, iv, data),
        }
    }

    fn check(self, key: &[u8], iv: &[u8], data: &[u8]) -> Result<()> {
        if key.len() != self.key_len() {
            return Err(Error::InvalidLength {
                expected: self.key_len(),
                actual: key.len(),
            });
        }
        if iv.len() != self.block_size() {
            return Err(Error::InvalidLength {
                expected: self.block_size(),
                actual: iv.len(),
            });
        }
        if data.len() % self.block_size() != 0 {
            return Err(Error::CryptoError(format!(
                "{} bytes is not a multiple of the {} byte block size",
                data.len(),
                self.block_size()
            )));
        }
        Ok(())
    }
}

fn cbc_encrypt<E: KeyIvInit + BlockEncryptMut>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = data.to_vec();
    let len = buf.len();
    E::new_from_slices(key, iv)
        .map_err(|_| Error::CryptoError("invalid key or IV length".to_string()))?
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|_| Error::CryptoError("CBC encryption failed".to_string()))?;
    Ok(buf)
}

fn cbc_decrypt<D: KeyIvInit + BlockDecryptMut>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = data.to_vec();
    D::new_from_slices(key, iv)
        .map_err(|_| Error::CryptoError("invalid key or IV length".to_string()))?
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| Error::CryptoError("CBC decryption failed".to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_oakley() {
        assert_eq!(
            EncryptAlgorithm::from_oakley(oakley::AES_CBC, 0),
            Some(EncryptAlgorithm::AesCbc { key_bits: 128 })
        );
        assert_eq!(EncryptAlgorithm::from_oakley(oakley::AES_CBC, 100), None);
        assert_eq!(EncryptAlgorithm::from_oakley(oakley::DES_CBC, 64), None);
        assert_eq!(EncryptAlgorithm::TripleDesCbc.key_len(), 24);
    }

    #[test]
    fn test_encrypt_decrypt_all_ciphers() {
        for alg in [
            EncryptAlgorithm::DesCbc,
            EncryptAlgorithm::TripleDesCbc,
            EncryptAlgorithm::AesCbc { key_bits: 128 },
            EncryptAlgorithm::AesCbc { key_bits: 256 },
        ] {
            let key = vec![0x42u8; alg.key_len()];
            let iv = vec![0x24u8; alg.block_size()];
            let plaintext = vec![0x11u8; alg.block_size() * 3];

            let ciphertext = alg.encrypt(&key, &iv, &plaintext).expect("Encryption failed");
            assert_ne!(ciphertext, plaintext);
            let decrypted = alg.decrypt(&key, &iv, &ciphertext).expect("Decryption failed");
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_cbc_chaining_continues_from_last_block() {
        let alg = EncryptAlgorithm::AesCbc { key_bits: 128 };
        let key = [7u8; 16];
        let iv = [1u8; 16];
        let data = [9u8; 32];

        let whole = alg.encrypt(&key, &iv, &data).expect("Encryption failed");
        let first = alg.encrypt(&key, &iv, &data[..16]).expect("Encryption failed");
        let second = alg
            .encrypt(&key, &first, &data[16..])
            .expect("Encryption failed");
        assert_eq!(&whole[..16], &first[..]);
        assert_eq!(&whole[16..], &second[..]);
    }

    #[test]
    fn test_rejects_partial_block() {
        let alg = EncryptAlgorithm::DesCbc;
        let result = alg.encrypt(&[0u8; 8], &[0u8; 8], &[0u8; 12]);
        assert!(matches!(result, Err(Error::CryptoError(_))));
        let result = alg.encrypt(&[0u8; 7], &[0u8; 8], &[0u8; 8]);
        assert!(matches!(result, Err(Error::InvalidLength { .. })));
    }
}
