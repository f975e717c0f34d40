//! Structured logging for IKE negotiations
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! Every event carries the fields needed to correlate it with a state
//! (serial, cookies) or a peer.
//!
//! # Log Levels
//!
//! - **TRACE**: Raw message sizes and payload chains
//! - **DEBUG**: Proposal selection, timer and kernel details
//! - **INFO**: State transitions, established SAs, deletions
//! - **WARN**: Rejected messages, blocked peers, unusual peer behaviour
//! - **ERROR**: Authentication failures, internal errors
//!
//! # Example
//!
//! ```no_run
//! use fynx_ike::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("fynx_ike=debug")
//!     .init();
//!
//! logging::log_state_transition(
//!     &[0x01; 8],
//!     &[0x02; 8],
//!     3,
//!     "STATE_MAIN_R1",
//!     "STATE_MAIN_R2",
//! );
//! ```

use tracing::{debug, error, info, trace, warn};

/// Log a state moving to its next kind
///
/// # Arguments
///
/// * `icookie` - Initiator cookie
/// * `rcookie` - Responder cookie
/// * `serial` - State serial number
/// * `old_state` - Kind before the transition
/// * `new_state` - Kind after the transition
pub fn log_state_transition(icookie: &[u8], rcookie: &[u8], serial: u64, old_state: &str, new_state: &str) {
    info!(
        icookie = %hex::encode(icookie),
        rcookie = %hex::encode(rcookie),
        serial = serial,
        state_from = old_state,
        state_to = new_state,
        "state transition"
    );
}

/// Log a message refused by the dispatcher or a transition
///
/// # Arguments
///
/// * `peer_addr` - Sender address and port
/// * `reason` - Why it was refused
pub fn log_packet_rejected(peer_addr: &str, reason: &str) {
    warn!(peer = peer_addr, reason = reason, "packet rejected");
}

/// Log a peer crossing the block-list threshold
///
/// # Arguments
///
/// * `peer_addr` - Peer IP address
/// * `rejections` - Rejections counted so far
pub fn log_peer_blocked(peer_addr: &str, rejections: u32) {
    warn!(
        peer = peer_addr,
        rejections = rejections,
        "peer blocked after repeated authentication failures"
    );
}

/// Log a message dropped because its sender is blocked
///
/// # Arguments
///
/// * `peer_addr` - Peer IP address
/// * `state` - State the message would have entered
pub fn log_blocked_packet(peer_addr: &str, state: &str) {
    debug!(peer = peer_addr, state = state, "dropping packet from blocked peer");
}

/// Log the outcome of proposal selection
///
/// # Arguments
///
/// * `phase` - "Oakley" or "IPsec"
/// * `chosen` - Description of the accepted transform, or `None` if nothing fit
pub fn log_proposal_selected(phase: &str, chosen: Option<&str>) {
    match chosen {
        Some(transform) => {
            debug!(phase = phase, chosen = transform, "proposal accepted");
        }
        None => {
            warn!(phase = phase, "no acceptable proposal");
        }
    }
}

/// Log an SA becoming usable
///
/// # Arguments
///
/// * `serial` - State serial number
/// * `connection` - Connection name (with instance suffix)
/// * `story` - Operator-facing description of the state
pub fn log_sa_established(serial: u64, connection: &str, story: &str) {
    info!(serial = serial, connection = connection, "{}", story);
}

/// Log a state being deleted
///
/// # Arguments
///
/// * `serial` - State serial number
/// * `connection` - Connection name
/// * `state` - Kind the state was in
/// * `reason` - Why it goes away
pub fn log_state_deleted(serial: u64, connection: &str, state: &str, reason: &str) {
    info!(
        serial = serial,
        connection = connection,
        state = state,
        reason = reason,
        "deleting state"
    );
}

/// Log authentication failure
///
/// # Arguments
///
/// * `peer_addr` - Peer address
/// * `reason` - Failure reason
pub fn log_authentication_failed(peer_addr: &str, reason: &str) {
    error!(peer = peer_addr, reason = reason, "peer authentication failed");
}

/// Log a notification sent to a peer
///
/// # Arguments
///
/// * `peer_addr` - Peer address and port
/// * `notification` - Notification name
pub fn log_notification_sent(peer_addr: &str, notification: &str) {
    info!(peer = peer_addr, notification = notification, "sending notification");
}

/// Log DPD check
///
/// # Arguments
///
/// * `peer_addr` - Peer IP address
/// * `success` - Whether peer responded
pub fn log_dpd_check(peer_addr: &str, success: bool) {
    if success {
        debug!(peer = peer_addr, "DPD check successful");
    } else {
        warn!(peer = peer_addr, "DPD: No response from peer - declaring peer dead");
    }
}

/// Log an SA installed in or removed from the kernel
///
/// # Arguments
///
/// * `operation` - "install" or "delete"
/// * `protocol` - Protocol name ("ESP", "AH", "IPCOMP")
/// * `spi` - SPI or CPI
/// * `inbound` - Direction
pub fn log_kernel_sa(operation: &str, protocol: &str, spi: u32, inbound: bool) {
    debug!(
        operation = operation,
        protocol = protocol,
        spi = %format_args!("0x{:08x}", spi),
        direction = if inbound { "inbound" } else { "outbound" },
        "kernel SA"
    );
}

/// Log internal error with context
///
/// # Arguments
///
/// * `context` - Where it happened (transition or operation name)
/// * `error` - Error message
pub fn log_error(context: &str, error: &str) {
    error!(context = context, error = error, "internal error");
}

/// Log protocol message send
///
/// # Arguments
///
/// * `exchange` - Exchange type name
/// * `peer_addr` - Peer address and port
/// * `size_bytes` - Message size in bytes
pub fn log_message_send(exchange: &str, peer_addr: &str, size_bytes: usize) {
    trace!(
        exchange = exchange,
        peer = peer_addr,
        size_bytes = size_bytes,
        "sending ISAKMP message"
    );
}

/// Log protocol message receive
///
/// # Arguments
///
/// * `exchange` - Exchange type name
/// * `peer_addr` - Peer address and port
/// * `size_bytes` - Message size in bytes
pub fn log_message_recv(exchange: &str, peer_addr: &str, size_bytes: usize) {
    trace!(
        exchange = exchange,
        peer = peer_addr,
        size_bytes = size_bytes,
        "received ISAKMP message"
    );
}
