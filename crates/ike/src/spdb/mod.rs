//! Proposal database (SPDB)
//!
//! A [`ProposalDatabase`] is built fresh for every negotiation from a
//! connection's policy. It is a disjunction of conjunctions:
//!
//! ```text
//! ProposalDatabase
//!   └── DbPropConj   (alternatives; protocols used together)
//!        └── DbProp  (one protocol: ISAKMP, AH, ESP or IPCOMP)
//!             └── DbTrans  (alternatives within the protocol)
//!                  └── DbAttr
//! ```
//!
//! [`out_sa`] renders a database into an SA payload body; the parse
//! functions select the first acceptable offer out of a peer's SA payload
//! and build the single-transform echo that goes back in the reply.

mod encode;
mod ipsec;
mod isakmp;

pub use encode::{out_sa, EncodedSa, NatEncapsulation, SaEncodeContext};
pub use ipsec::{
    parse_ipsec_sa_body, IpsecProtoInfo, IpsecSelectContext, IpsecSelection, IpsecTransAttrs,
    PfsGroup,
};
pub use isakmp::{
    init_st_oakley, parse_isakmp_sa_body, IsakmpSelectContext, IsakmpSelection, OakleyTransAttrs,
};

use crate::isakmp::{ipsec_attr, oakley, proto, transform};
use crate::policy::{MainAlgorithms, Policy, QuickAlgorithms};

/// Transform attribute with a short-form value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbAttr {
    /// Attribute type
    pub attr_type: u16,
    /// Attribute value
    pub value: u16,
}

/// One transform alternative
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbTrans {
    /// Transform id
    pub transid: u8,
    /// Attributes, in emission order
    pub attrs: Vec<DbAttr>,
}

impl DbTrans {
    fn new(transid: u8) -> Self {
        DbTrans {
            transid,
            attrs: Vec::new(),
        }
    }

    fn attr(mut self, attr_type: u16, value: u16) -> Self {
        self.attrs.push(DbAttr { attr_type, value });
        self
    }
}

/// One protocol's proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbProp {
    /// Protocol id
    pub protoid: u8,
    /// Transform alternatives
    pub trans: Vec<DbTrans>,
}

/// Protocols proposed together
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DbPropConj {
    /// Member proposals
    pub props: Vec<DbProp>,
}

/// Everything this side is willing to propose or accept
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProposalDatabase {
    /// Alternative conjunctions
    pub conjs: Vec<DbPropConj>,
}

impl ProposalDatabase {
    /// Phase 1 database: one ISAKMP proposal holding every
    /// hash x cipher x group x auth combination the policy permits.
    pub fn oakley(policy: Policy, algorithms: MainAlgorithms) -> Self {
        let mut auths = Vec::new();
        if policy.contains(Policy::PSK) {
            auths.push(oakley::PRESHARED_KEY);
        }
        if policy.contains(Policy::RSASIG) {
            auths.push(oakley::RSA_SIG);
        }

        let mut trans = Vec::new();
        for hash in algorithms.hashes() {
            for (enc, key_len) in algorithms.encs() {
                for group in algorithms.groups() {
                    for auth in &auths {
                        trans.push(oakley_transform(enc, key_len, hash, *auth, group));
                    }
                }
            }
        }
        if trans.is_empty() {
            return ProposalDatabase::default();
        }

        ProposalDatabase {
            conjs: vec![DbPropConj {
                props: vec![DbProp {
                    protoid: proto::ISAKMP,
                    trans,
                }],
            }],
        }
    }

    /// Aggressive Mode database: the KE travels in the first message, so
    /// only the first permitted cipher, hash and group are offered, with
    /// pre-shared key authentication.
    pub fn aggressive(algorithms: MainAlgorithms) -> Self {
        let (enc, key_len) = match algorithms.encs().first() {
            Some(e) => *e,
            None => return ProposalDatabase::default(),
        };
        let (hash, group) = match (algorithms.hashes().first(), algorithms.groups().first()) {
            (Some(h), Some(g)) => (*h, *g),
            _ => return ProposalDatabase::default(),
        };
        ProposalDatabase {
            conjs: vec![DbPropConj {
                props: vec![DbProp {
                    protoid: proto::ISAKMP,
                    trans: vec![oakley_transform(
                        enc,
                        key_len,
                        hash,
                        oakley::PRESHARED_KEY,
                        group,
                    )],
                }],
            }],
        }
    }

    /// Quick Mode database: an ESP conjunction with every cipher x
    /// integrity pair, then an AH conjunction; each gains an IPCOMP
    /// proposal when compression is wanted. A protocol with nothing
    /// permitted is left out.
    pub fn ipsec(policy: Policy, algorithms: QuickAlgorithms) -> Self {
        let compress = policy.contains(Policy::COMPRESS);
        let mut db = ProposalDatabase::default();

        let mut esp = Vec::new();
        for (transid, key_len) in algorithms.esp_encs() {
            for auth in algorithms.esp_auths() {
                let mut t = DbTrans::new(transid).attr(ipsec_attr::AUTH_ALGORITHM, auth);
                if key_len != 0 {
                    t = t.attr(ipsec_attr::KEY_LENGTH, key_len);
                }
                esp.push(t);
            }
        }
        if !esp.is_empty() {
            db.conjs.push(conjunction(proto::IPSEC_ESP, esp, compress));
        }

        let ah: Vec<DbTrans> = algorithms
            .ah_transforms()
            .into_iter()
            .map(|(transid, auth)| DbTrans::new(transid).attr(ipsec_attr::AUTH_ALGORITHM, auth))
            .collect();
        if !ah.is_empty() {
            db.conjs.push(conjunction(proto::IPSEC_AH, ah, compress));
        }

        db
    }

    /// Is there nothing to propose
    pub fn is_empty(&self) -> bool {
        self.conjs.is_empty()
    }

    /// Total number of transforms over all proposals
    pub fn transform_count(&self) -> usize {
        self.conjs
            .iter()
            .flat_map(|c| c.props.iter())
            .map(|p| p.trans.len())
            .sum()
    }
}

fn oakley_transform(enc: u16, key_len: u16, hash: u16, auth: u16, group: u16) -> DbTrans {
    let mut t = DbTrans::new(transform::KEY_IKE)
        .attr(oakley::ENCRYPTION_ALGORITHM, enc)
        .attr(oakley::HASH_ALGORITHM, hash);
    if key_len != 0 {
        t = t.attr(oakley::KEY_LENGTH, key_len);
    }
    t.attr(oakley::AUTHENTICATION_METHOD, auth)
        .attr(oakley::GROUP_DESCRIPTION, group)
}

fn conjunction(protoid: u8, trans: Vec<DbTrans>, compress: bool) -> DbPropConj {
    let mut props = vec![DbProp { protoid, trans }];
    if compress {
        props.push(DbProp {
            protoid: proto::IPCOMP,
            trans: vec![DbTrans::new(transform::IPCOMP_DEFLATE)],
        });
    }
    DbPropConj { props }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oakley_enumeration_order() {
        let algs = MainAlgorithms::new(
            MainAlgorithms::ENC_3DES
                | MainAlgorithms::ENC_AES128
                | MainAlgorithms::HASH_MD5
                | MainAlgorithms::HASH_SHA1
                | MainAlgorithms::GROUP_MODP1024,
        );
        let db = ProposalDatabase::oakley(Policy::new(Policy::PSK), algs);
        assert_eq!(db.conjs.len(), 1);
        let prop = &db.conjs[0].props[0];
        assert_eq!(prop.protoid, proto::ISAKMP);
        assert_eq!(prop.trans.len(), 4);

        // hash is the outer loop, cipher the inner one
        let first = &prop.trans[0].attrs;
        assert_eq!(first[0].value, oakley::TRIPLE_DES_CBC);
        assert_eq!(first[1].value, oakley::MD5);
        let second = &prop.trans[1].attrs;
        assert_eq!(second[0].value, oakley::AES_CBC);
        assert_eq!(second[2].attr_type, oakley::KEY_LENGTH);
        assert_eq!(second[2].value, 128);
        assert_eq!(prop.trans[2].attrs[1].value, oakley::SHA1);
    }

    #[test]
    fn test_oakley_auth_methods_multiply() {
        let db = ProposalDatabase::oakley(
            Policy::new(Policy::PSK | Policy::RSASIG),
            MainAlgorithms::default(),
        );
        // 2 ciphers x 2 hashes x 2 groups x 2 auth methods
        assert_eq!(db.transform_count(), 16);
        assert!(ProposalDatabase::oakley(Policy::new(Policy::TUNNEL), MainAlgorithms::default())
            .is_empty());
    }

    #[test]
    fn test_aggressive_single_transform() {
        let db = ProposalDatabase::aggressive(MainAlgorithms::default());
        assert_eq!(db.transform_count(), 1);
        let attrs = &db.conjs[0].props[0].trans[0].attrs;
        assert!(attrs
            .iter()
            .any(|a| a.attr_type == oakley::AUTHENTICATION_METHOD && a.value == oakley::PRESHARED_KEY));
        assert!(attrs
            .iter()
            .any(|a| a.attr_type == oakley::GROUP_DESCRIPTION && a.value == oakley::GROUP_MODP1024));
    }

    #[test]
    fn test_ipsec_conjunctions() {
        let algs = QuickAlgorithms::new(
            QuickAlgorithms::ESP_3DES
                | QuickAlgorithms::ESP_AES128
                | QuickAlgorithms::AUTH_SHA1
                | QuickAlgorithms::AH_MD5,
        );
        let db = ProposalDatabase::ipsec(Policy::new(Policy::ENCRYPT | Policy::COMPRESS), algs);
        assert_eq!(db.conjs.len(), 2);

        let esp = &db.conjs[0];
        assert_eq!(esp.props[0].protoid, proto::IPSEC_ESP);
        assert_eq!(esp.props[0].trans.len(), 2);
        assert_eq!(esp.props[1].protoid, proto::IPCOMP);
        let aes = &esp.props[0].trans[1];
        assert_eq!(aes.transid, transform::ESP_AES);
        assert_eq!(aes.attrs[0].attr_type, ipsec_attr::AUTH_ALGORITHM);
        assert_eq!(aes.attrs[1].attr_type, ipsec_attr::KEY_LENGTH);

        let ah = &db.conjs[1];
        assert_eq!(ah.props[0].protoid, proto::IPSEC_AH);
        assert_eq!(ah.props[0].trans[0].transid, transform::AH_MD5);
    }

    #[test]
    fn test_ipsec_skips_empty_protocols() {
        let algs = QuickAlgorithms::new(QuickAlgorithms::AH_SHA1);
        let db = ProposalDatabase::ipsec(Policy::new(Policy::AUTHENTICATE), algs);
        assert_eq!(db.conjs.len(), 1);
        assert_eq!(db.conjs[0].props[0].protoid, proto::IPSEC_AH);
    }
}
