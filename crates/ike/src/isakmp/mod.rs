//! ISAKMP wire format
//!
//! Header, payload bodies and the constants of RFC 2407/2408/2409 plus the
//! NAT-Traversal payload numbering of RFC 3947 and its drafts.

pub mod constants;
pub mod message;
pub mod payload;

pub use constants::*;
pub use message::{patch_length, IsakmpHeader, MessageBuilder};
pub use payload::{
    decode_long_duration, encode_attribute, AttrValue, Attribute, DeletePayload, GenericHeader,
    IdPayload, NatOaPayload, NotificationPayload, ProposalHeader, SaHeader, TransformHeader,
};
