//! Cryptographic primitives for IKEv1
//!
//! This module provides the pieces phase 1 and Quick Mode need:
//! - Oakley hash functions and their HMAC-based PRF
//! - CBC ciphers for encrypted ISAKMP messages
//! - MODP Diffie-Hellman groups 1, 2 and 5
//! - SKEYID / IV / KEYMAT derivation (RFC 2409 Section 5)

pub mod cipher;
pub mod dh;
pub mod keys;
pub mod prf;

pub use cipher::EncryptAlgorithm;
pub use dh::{DhGroup, DhKeyPair};
pub use keys::{IsakmpKeys, KeyMaterial};
pub use prf::HashAlgorithm;
