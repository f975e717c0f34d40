//! IKEv1 / ISAKMP negotiation engine for the Fynx security ecosystem.
//!
//! The crate implements the Internet Key Exchange version 1 as used by
//! IPsec gateways: Main Mode and Aggressive Mode for the ISAKMP SA, Quick
//! Mode for the IPsec SAs it protects, and Informational exchanges for
//! notifications, Delete SA and Dead Peer Detection.
//!
//! The engine is a synchronous state machine. [`IkeDaemon`] takes whole UDP
//! datagrams, timer ticks and operator ([`whack`]) requests and answers with
//! datagrams to send and status lines. [`IkeServer`] wraps it in a tokio
//! UDP loop for real deployments.
//!
//! # Example
//!
//! ```rust
//! use fynx_ike::{
//!     ConnectionConfig, DaemonConfig, EndConfig, IkeDaemon, MemoryKernel, WhackCommand,
//!     WhackMessage,
//! };
//! use std::time::Instant;
//!
//! let config = DaemonConfig::builder()
//!     .with_interface("192.0.2.1".parse().unwrap())
//!     .build()
//!     .unwrap();
//! let mut daemon = IkeDaemon::new(config, Box::new(MemoryKernel::new())).unwrap();
//!
//! let conn = ConnectionConfig::builder("west-east")
//!     .with_left(EndConfig::host("192.0.2.1".parse().unwrap()))
//!     .with_right(EndConfig::host("198.51.100.7".parse().unwrap()))
//!     .with_psk(b"secret".to_vec())
//!     .build()
//!     .unwrap();
//!
//! daemon.handle_whack(
//!     WhackMessage::new()
//!         .with(WhackCommand::AddConnection(conn))
//!         .with(WhackCommand::Listen)
//!         .with(WhackCommand::Initiate { name: "west-east".into(), asynchronous: true }),
//!     Instant::now(),
//! );
//!
//! // Main Mode message 1 is ready to go out
//! assert_eq!(daemon.take_outgoing().len(), 1);
//! ```
//!
//! # Security
//!
//! - Peer input never panics; malformed messages are dropped or answered
//!   with a notification
//! - Hash and signature comparisons are constant-time (`subtle`)
//! - Keying material is wiped on drop (`zeroize`)
//! - Peers that keep failing Phase 1 are blocked for a configurable period
//!
//! # References
//!
//! - [RFC 2408](https://datatracker.ietf.org/doc/html/rfc2408) - ISAKMP
//! - [RFC 2409](https://datatracker.ietf.org/doc/html/rfc2409) - The Internet Key Exchange
//! - [RFC 3706](https://datatracker.ietf.org/doc/html/rfc3706) - Dead Peer Detection
//! - [RFC 3947](https://datatracker.ietf.org/doc/html/rfc3947) - NAT-Traversal in IKE

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod block;
pub mod config;
pub mod connections;
pub mod crypto;
pub mod daemon;
pub mod demux;
pub mod dpd;
pub mod error;
pub mod isakmp;
pub mod kernel;
pub mod logging;
pub mod metrics;
pub mod nat;
pub mod policy;
pub mod server;
pub mod spdb;
pub mod state;
pub mod timer;
pub mod whack;

mod transitions;

pub use block::BlockList;
pub use config::{ConnectionConfig, DaemonConfig, EndConfig};
pub use connections::{ConnId, Connection, ConnectionRegistry};
pub use daemon::{Datagram, IkeDaemon};
pub use error::{Error, Result};
pub use kernel::{KernelInterface, KernelSa, MemoryKernel};
pub use metrics::{IkeMetrics, MetricsSnapshot};
pub use policy::Policy;
pub use server::{IkeServer, ServerHandle};
pub use state::{SerialNo, StateKind};
pub use whack::{RcCode, WhackCommand, WhackLine, WhackMessage};
