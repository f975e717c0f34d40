//! Control plane: operator commands, their wire record and status replies
//!
//! An operator request is a fixed-layout record guarded by a magic number,
//! followed by NUL-terminated strings (connection name, both ids, the
//! algorithm strings) and a trailing key blob whose length is carried in
//! the fixed part. Replies are lines tagged with a numeric status code.

use crate::config::{ConnectionConfig, EndConfig};
use crate::connections::{Identity, Subnet};
use crate::error::{Error, Result};
use crate::policy::{MainAlgorithms, Policy, QuickAlgorithms};
use crate::state::SerialNo;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Guard at the start of every request record
pub const WHACK_MAGIC: u32 = u32::from_be_bytes(*b"whk\x14");

/// Status code attached to every line sent back to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RcCode {
    /// Non-committal utterance
    Comment = 0,
    /// Problem detected by the operator tool
    WhackProblem = 1,
    /// Message aimed at the log
    Log = 2,
    /// Serious message aimed at the log
    LogSerious = 3,
    /// Success
    Success = 4,
    /// Retransmitting
    Retransmission = 10,
    /// Connection name already in use
    DupName = 20,
    /// Unknown connection name or state number
    UnknownName = 21,
    /// Neither end of the connection is one of our interfaces
    Orient = 22,
    /// Conflicting connection definitions
    Clash = 23,
    /// Not listening yet
    Deaf = 24,
    /// Cannot route
    Route = 25,
    /// Route busy
    RtBusy = 26,
    /// Malformed identity
    BadId = 27,
    /// No key available
    NoKey = 28,
    /// Peer address unknown
    NoPeerIp = 29,
    /// Malformed request record
    BadWhackMessage = 30,
    /// Gave up retransmitting
    NoRetransmission = 31,
    /// Internal error
    InternalErr = 32,
    /// Opportunistic initiation failed
    OppoFailure = 33,
    /// Secret entry
    EnterSecret = 40,
    /// Base of the state-change range (code + state ordinal)
    NewState = 100,
    /// Base of the notification range (code + notify type)
    Notification = 200,
}

impl RcCode {
    /// Numeric value
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// One reply line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhackLine {
    /// Numeric status
    pub rc: u16,
    /// Text
    pub text: String,
}

impl fmt::Display for WhackLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03} {}", self.rc, self.text)
    }
}

/// Collected operator output
#[derive(Debug, Clone, Default)]
pub struct WhackLog {
    lines: Vec<WhackLine>,
}

impl WhackLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line with a status code
    pub fn push(&mut self, rc: RcCode, text: impl Into<String>) {
        self.push_raw(rc.code(), text);
    }

    /// Append a line with a computed code (state or notification range)
    pub fn push_raw(&mut self, rc: u16, text: impl Into<String>) {
        self.lines.push(WhackLine {
            rc,
            text: text.into(),
        });
    }

    /// Lines so far
    pub fn lines(&self) -> &[WhackLine] {
        &self.lines
    }

    /// Drain everything
    pub fn take(&mut self) -> Vec<WhackLine> {
        std::mem::take(&mut self.lines)
    }

    /// Any line carries `rc`
    pub fn contains_rc(&self, rc: u16) -> bool {
        self.lines.iter().any(|l| l.rc == rc)
    }
}

/// An operator command
#[derive(Debug, Clone)]
pub enum WhackCommand {
    /// Delete every connection with this name
    DeleteConnection(String),
    /// Delete one state by serial number
    DeleteState(SerialNo),
    /// Delete one instance of a template
    DeleteInstance {
        /// Template name
        name: String,
        /// Instance serial
        instance: u64,
    },
    /// Add a connection
    AddConnection(ConnectionConfig),
    /// Start listening for IKE
    Listen,
    /// Stop listening for IKE
    Unlisten,
    /// Route a connection
    Route(String),
    /// Unroute a connection
    Unroute(String),
    /// Initiate a connection
    Initiate {
        /// Connection name
        name: String,
        /// Do not wait for the outcome
        asynchronous: bool,
    },
    /// Opportunistic initiation between two clients
    OppoInitiate {
        /// Our client address
        our_client: IpAddr,
        /// Peer client address
        peer_client: IpAddr,
        /// Do not wait for the outcome
        asynchronous: bool,
    },
    /// Delete the states of a connection
    Terminate(String),
    /// Report status
    Status,
    /// Stop the daemon
    Shutdown,
    /// Adjust the peer block list
    BlockIp {
        /// Rejections before blocking (0 disables)
        reject_num: u32,
        /// Block duration
        period: Duration,
    },
}

impl WhackCommand {
    // commands in one request run in this order; delete before add makes a replace
    fn rank(&self) -> u8 {
        match self {
            WhackCommand::DeleteConnection(_) => 0,
            WhackCommand::DeleteState(_) => 1,
            WhackCommand::DeleteInstance { .. } => 2,
            WhackCommand::AddConnection(_) => 3,
            WhackCommand::Listen => 4,
            WhackCommand::Unlisten => 5,
            WhackCommand::Route(_) => 6,
            WhackCommand::Unroute(_) => 7,
            WhackCommand::Initiate { .. } => 8,
            WhackCommand::OppoInitiate { .. } => 9,
            WhackCommand::Terminate(_) => 10,
            WhackCommand::Status => 11,
            WhackCommand::Shutdown => 12,
            WhackCommand::BlockIp { .. } => 13,
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            WhackCommand::DeleteConnection(name)
            | WhackCommand::Route(name)
            | WhackCommand::Unroute(name)
            | WhackCommand::Terminate(name) => Some(name),
            WhackCommand::DeleteInstance { name, .. } | WhackCommand::Initiate { name, .. } => {
                Some(name)
            }
            WhackCommand::AddConnection(cfg) => Some(&cfg.name),
            _ => None,
        }
    }
}

/// One operator request
#[derive(Debug, Clone, Default)]
pub struct WhackMessage {
    commands: Vec<WhackCommand>,
}

mod flag {
    pub const CONNECTION: u32 = 1 << 0;
    pub const DELETE: u32 = 1 << 1;
    pub const DELETE_STATE: u32 = 1 << 2;
    pub const DELETE_INSTANCE: u32 = 1 << 3;
    pub const LISTEN: u32 = 1 << 4;
    pub const UNLISTEN: u32 = 1 << 5;
    pub const ROUTE: u32 = 1 << 6;
    pub const UNROUTE: u32 = 1 << 7;
    pub const INITIATE: u32 = 1 << 8;
    pub const OPPO_INITIATE: u32 = 1 << 9;
    pub const TERMINATE: u32 = 1 << 10;
    pub const STATUS: u32 = 1 << 11;
    pub const SHUTDOWN: u32 = 1 << 12;
    pub const BLOCK_IP: u32 = 1 << 13;
    pub const ASYNC: u32 = 1 << 14;
}

const ADDR_LEN: usize = 17;
const END_LEN: usize = ADDR_LEN + 2 + 1 + 1 + ADDR_LEN + 1 + 1 + 1 + 2;
const FIXED_LEN: usize = 4 + 4 + 11 * 4 + 1 + 2 * END_LEN + 8 + 8 + 2 * ADDR_LEN + 4 + 4 + 4;

fn put_addr(buf: &mut BytesMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(a) => {
            buf.put_u8(4);
            buf.put_slice(&a.octets());
            buf.put_bytes(0, 12);
        }
        IpAddr::V6(a) => {
            buf.put_u8(6);
            buf.put_slice(&a.octets());
        }
    }
}

fn get_addr(buf: &mut &[u8]) -> Result<IpAddr> {
    let family = buf.get_u8();
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    match family {
        4 => Ok(IpAddr::V4(Ipv4Addr::new(
            octets[0], octets[1], octets[2], octets[3],
        ))),
        6 => Ok(IpAddr::V6(Ipv6Addr::from(octets))),
        other => Err(Error::Refused(
            RcCode::BadWhackMessage,
            format!("message from whack has unknown address family {}", other),
        )),
    }
}

fn put_end(buf: &mut BytesMut, end: &EndConfig) {
    put_addr(buf, &end.host);
    buf.put_u16(end.host_port);
    buf.put_u8(end.host_port_specific as u8);
    buf.put_u8(end.client.is_some() as u8);
    let client = end.client.unwrap_or_else(|| Subnet::from_host(end.host));
    put_addr(buf, &client.addr());
    buf.put_u8(client.prefix());
    buf.put_u8(end.client_wildcard as u8);
    buf.put_u8(end.protocol);
    buf.put_u16(end.port);
}

fn get_end(buf: &mut &[u8]) -> Result<EndConfig> {
    let host = get_addr(buf)?;
    let host_port = buf.get_u16();
    let host_port_specific = buf.get_u8() != 0;
    let has_client = buf.get_u8() != 0;
    let client_addr = get_addr(buf)?;
    let prefix = buf.get_u8();
    let client_wildcard = buf.get_u8() != 0;
    let protocol = buf.get_u8();
    let port = buf.get_u16();
    let client = if has_client {
        Some(Subnet::new(client_addr, prefix)?)
    } else {
        None
    };
    Ok(EndConfig {
        host,
        host_port,
        host_port_specific,
        client,
        client_wildcard,
        id: Identity::None,
        protocol,
        port,
    })
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    let end = buf.iter().position(|&b| b == 0).ok_or_else(|| {
        Error::Refused(
            RcCode::BadWhackMessage,
            "message from whack contains bad string".into(),
        )
    })?;
    let s = String::from_utf8(buf[..end].to_vec()).map_err(|_| {
        Error::Refused(
            RcCode::BadWhackMessage,
            "message from whack contains bad string".into(),
        )
    })?;
    buf.advance(end + 1);
    Ok(s)
}

fn secs(d: Duration) -> u32 {
    u32::try_from(d.as_secs()).unwrap_or(u32::MAX)
}

impl WhackMessage {
    /// Empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command
    pub fn with(mut self, command: WhackCommand) -> Self {
        self.commands.push(command);
        self
    }

    /// Commands as given
    pub fn commands(&self) -> &[WhackCommand] {
        &self.commands
    }

    /// Commands in processing order
    pub fn ordered(&self) -> Vec<&WhackCommand> {
        let mut cmds: Vec<&WhackCommand> = self.commands.iter().collect();
        cmds.sort_by_key(|c| c.rank());
        cmds
    }

    /// The request also defines a connection with this name
    pub fn adds_connection(&self, name: &str) -> bool {
        self.commands
            .iter()
            .any(|c| matches!(c, WhackCommand::AddConnection(cfg) if cfg.name == name))
    }

    /// Encode the request record
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut name: Option<&str> = None;
        for cmd in &self.commands {
            if let Some(n) = cmd.name() {
                match name {
                    Some(existing) if existing != n => {
                        return Err(Error::InvalidParameter(format!(
                            "one request cannot name both \"{}\" and \"{}\"",
                            existing, n
                        )))
                    }
                    _ => name = Some(n),
                }
            }
        }

        let mut flags = 0u32;
        let mut conn: Option<&ConnectionConfig> = None;
        let mut delete_state = 0u64;
        let mut instance = 0u64;
        let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let mut oppo = (unspecified, unspecified);
        let mut block = (0u32, 0u32);
        for cmd in &self.commands {
            match cmd {
                WhackCommand::DeleteConnection(_) => flags |= flag::DELETE,
                WhackCommand::DeleteState(serial) => {
                    flags |= flag::DELETE_STATE;
                    delete_state = serial.0;
                }
                WhackCommand::DeleteInstance { instance: i, .. } => {
                    flags |= flag::DELETE_INSTANCE;
                    instance = *i;
                }
                WhackCommand::AddConnection(cfg) => {
                    flags |= flag::CONNECTION;
                    conn = Some(cfg);
                }
                WhackCommand::Listen => flags |= flag::LISTEN,
                WhackCommand::Unlisten => flags |= flag::UNLISTEN,
                WhackCommand::Route(_) => flags |= flag::ROUTE,
                WhackCommand::Unroute(_) => flags |= flag::UNROUTE,
                WhackCommand::Initiate { asynchronous, .. } => {
                    flags |= flag::INITIATE;
                    if *asynchronous {
                        flags |= flag::ASYNC;
                    }
                }
                WhackCommand::OppoInitiate {
                    our_client,
                    peer_client,
                    asynchronous,
                } => {
                    flags |= flag::OPPO_INITIATE;
                    if *asynchronous {
                        flags |= flag::ASYNC;
                    }
                    oppo = (*our_client, *peer_client);
                }
                WhackCommand::Terminate(_) => flags |= flag::TERMINATE,
                WhackCommand::Status => flags |= flag::STATUS,
                WhackCommand::Shutdown => flags |= flag::SHUTDOWN,
                WhackCommand::BlockIp { reject_num, period } => {
                    flags |= flag::BLOCK_IP;
                    block = (*reject_num, secs(*period));
                }
            }
        }

        let default_conn;
        let cfg = match conn {
            Some(cfg) => cfg,
            None => {
                default_conn = ConnectionConfig::builder("").build_unchecked();
                &default_conn
            }
        };
        let keyval: &[u8] = cfg.psk.as_deref().unwrap_or_default();

        let mut buf = BytesMut::with_capacity(FIXED_LEN + 64 + keyval.len());
        buf.put_u32(WHACK_MAGIC);
        buf.put_u32(flags);
        buf.put_u32(cfg.policy.bits());
        buf.put_u32(cfg.ike.bits());
        buf.put_u32(cfg.esp.bits());
        buf.put_u32(secs(cfg.ike_lifetime));
        buf.put_u32(secs(cfg.ipsec_lifetime));
        buf.put_u32(secs(cfg.rekey_margin));
        buf.put_u32(cfg.rekey_fuzz);
        buf.put_u32(cfg.keying_tries);
        buf.put_u32(secs(cfg.dpd_delay));
        buf.put_u32(secs(cfg.dpd_timeout));
        buf.put_u32(keyval.len() as u32);
        buf.put_u8(cfg.forceencaps as u8);
        put_end(&mut buf, &cfg.left);
        put_end(&mut buf, &cfg.right);
        buf.put_u64(delete_state);
        buf.put_u64(instance);
        put_addr(&mut buf, &oppo.0);
        put_addr(&mut buf, &oppo.1);
        buf.put_u32(block.0);
        buf.put_u32(block.1);
        buf.put_u32(0);

        put_str(&mut buf, name.unwrap_or_default());
        put_str(&mut buf, &cfg.left.id.to_string());
        put_str(&mut buf, &cfg.right.id.to_string());
        put_str(&mut buf, &cfg.ike.to_string());
        put_str(&mut buf, &cfg.esp.to_string());
        buf.put_slice(keyval);
        Ok(buf.to_vec())
    }

    /// Decode and sanity check a request record
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_LEN {
            return Err(Error::Refused(
                RcCode::BadWhackMessage,
                format!(
                    "truncated message from whack: got {} bytes; expected {}.  Message ignored.",
                    data.len(),
                    FIXED_LEN
                ),
            ));
        }
        let mut buf = data;
        let magic = buf.get_u32();
        if magic != WHACK_MAGIC {
            return Err(Error::Refused(
                RcCode::BadWhackMessage,
                format!(
                    "message from whack has bad magic {}; should be {}; probably wrong version.  Message ignored",
                    magic, WHACK_MAGIC
                ),
            ));
        }
        let flags = buf.get_u32();
        let policy = Policy::new(buf.get_u32());
        let ike_bits = MainAlgorithms::new(buf.get_u32());
        let esp_bits = QuickAlgorithms::new(buf.get_u32());
        let ike_life = Duration::from_secs(buf.get_u32() as u64);
        let ipsec_life = Duration::from_secs(buf.get_u32() as u64);
        let rekey_margin = Duration::from_secs(buf.get_u32() as u64);
        let rekey_fuzz = buf.get_u32();
        let keying_tries = buf.get_u32();
        let dpd_delay = Duration::from_secs(buf.get_u32() as u64);
        let dpd_timeout = Duration::from_secs(buf.get_u32() as u64);
        let keyval_len = buf.get_u32() as usize;
        let forceencaps = buf.get_u8() != 0;
        let mut left = get_end(&mut buf)?;
        let mut right = get_end(&mut buf)?;
        let delete_state = SerialNo(buf.get_u64());
        let instance = buf.get_u64();
        let oppo_ours = get_addr(&mut buf)?;
        let oppo_peer = get_addr(&mut buf)?;
        let block_reject = buf.get_u32();
        let block_period = Duration::from_secs(buf.get_u32() as u64);
        let _reserved = buf.get_u32();

        let name = get_str(&mut buf)?;
        let left_id = get_str(&mut buf)?;
        let right_id = get_str(&mut buf)?;
        let ike = get_str(&mut buf)?;
        let esp = get_str(&mut buf)?;
        if buf.remaining() != keyval_len {
            return Err(Error::Refused(
                RcCode::BadWhackMessage,
                "message from whack contains bad string".into(),
            ));
        }
        let keyval = buf.to_vec();

        let bad_id = |which: &str, text: &str, e: Error| {
            Error::Refused(
                RcCode::BadId,
                format!("bad {} --id \"{}\": {}", which, text, e),
            )
        };
        left.id = left_id.parse().map_err(|e| bad_id("left", &left_id, e))?;
        right.id = right_id.parse().map_err(|e| bad_id("right", &right_id, e))?;

        // empty algorithm strings fall back to the numeric sets
        let ike = if ike.is_empty() {
            ike_bits
        } else {
            ike.parse()?
        };
        let esp = if esp.is_empty() {
            esp_bits
        } else {
            esp.parse()?
        };

        let asynchronous = flags & flag::ASYNC != 0;
        let mut msg = WhackMessage::new();
        if flags & flag::DELETE != 0 {
            msg.commands.push(WhackCommand::DeleteConnection(name.clone()));
        }
        if flags & flag::DELETE_STATE != 0 {
            msg.commands.push(WhackCommand::DeleteState(delete_state));
        }
        if flags & flag::DELETE_INSTANCE != 0 {
            msg.commands.push(WhackCommand::DeleteInstance {
                name: name.clone(),
                instance,
            });
        }
        if flags & flag::CONNECTION != 0 {
            let mut builder = ConnectionConfig::builder(name.clone())
                .with_left(left)
                .with_right(right)
                .with_policy(policy)
                .with_ike(ike)
                .with_esp(esp)
                .with_lifetimes(ike_life, ipsec_life)
                .with_rekey(rekey_margin, rekey_fuzz)
                .with_keying_tries(keying_tries)
                .with_dpd(dpd_delay, dpd_timeout)
                .with_forceencaps(forceencaps);
            if !keyval.is_empty() {
                builder = builder.with_psk(keyval);
            }
            msg.commands
                .push(WhackCommand::AddConnection(builder.build_unchecked()));
        }
        if flags & flag::LISTEN != 0 {
            msg.commands.push(WhackCommand::Listen);
        }
        if flags & flag::UNLISTEN != 0 {
            msg.commands.push(WhackCommand::Unlisten);
        }
        if flags & flag::ROUTE != 0 {
            msg.commands.push(WhackCommand::Route(name.clone()));
        }
        if flags & flag::UNROUTE != 0 {
            msg.commands.push(WhackCommand::Unroute(name.clone()));
        }
        if flags & flag::INITIATE != 0 {
            msg.commands.push(WhackCommand::Initiate {
                name: name.clone(),
                asynchronous,
            });
        }
        if flags & flag::OPPO_INITIATE != 0 {
            msg.commands.push(WhackCommand::OppoInitiate {
                our_client: oppo_ours,
                peer_client: oppo_peer,
                asynchronous,
            });
        }
        if flags & flag::TERMINATE != 0 {
            msg.commands.push(WhackCommand::Terminate(name));
        }
        if flags & flag::STATUS != 0 {
            msg.commands.push(WhackCommand::Status);
        }
        if flags & flag::SHUTDOWN != 0 {
            msg.commands.push(WhackCommand::Shutdown);
        }
        if flags & flag::BLOCK_IP != 0 {
            msg.commands.push(WhackCommand::BlockIp {
                reject_num: block_reject,
                period: block_period,
            });
        }
        Ok(msg)
    }
}
