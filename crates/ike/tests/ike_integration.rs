//! Two in-process engines negotiating with each other
//!
//! Datagrams are moved between the daemons by hand, so every test runs
//! without sockets and at a fixed instant.

use fynx_ike::policy::{MainAlgorithms, Policy};
use fynx_ike::{
    ConnectionConfig, DaemonConfig, Datagram, EndConfig, IkeDaemon, MemoryKernel, StateKind,
    WhackCommand, WhackMessage,
};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

const WEST: &str = "192.0.2.1";
const EAST: &str = "198.51.100.7";

fn addr(s: &str) -> IpAddr {
    s.parse().expect("valid address")
}

fn daemon(iface: &str, block: Option<(u32, Duration)>) -> IkeDaemon {
    let mut builder = DaemonConfig::builder().with_interface(addr(iface));
    if let Some((reject_num, period)) = block {
        builder = builder.with_block_ip(reject_num, period);
    }
    let config = builder.build().expect("valid config");
    IkeDaemon::new(config, Box::new(MemoryKernel::new())).expect("daemon created")
}

fn connection(me: &str, him: &str, policy: u32, ike: &str) -> ConnectionConfig {
    ConnectionConfig::builder("west-east")
        .with_left(EndConfig::host(addr(me)))
        .with_right(EndConfig::host(addr(him)))
        .with_policy(Policy::new(policy))
        .with_ike(ike.parse::<MainAlgorithms>().expect("valid ike string"))
        .with_psk(b"a shared secret".to_vec())
        .build()
        .expect("valid connection")
}

fn add_and_listen(d: &mut IkeDaemon, cfg: ConnectionConfig, now: Instant) {
    d.handle_whack(
        WhackMessage::new()
            .with(WhackCommand::AddConnection(cfg))
            .with(WhackCommand::Listen),
        now,
    );
}

fn initiate(d: &mut IkeDaemon, now: Instant) {
    d.handle_whack(
        WhackMessage::new().with(WhackCommand::Initiate {
            name: "west-east".into(),
            asynchronous: true,
        }),
        now,
    );
}

fn deliver(to: &mut IkeDaemon, dgrams: Vec<Datagram>, now: Instant) -> usize {
    let n = dgrams.len();
    for d in dgrams {
        to.process_datagram(d.from, d.to, &d.data, now);
    }
    n
}

/// Move datagrams back and forth until both sides are quiet
fn pump(west: &mut IkeDaemon, east: &mut IkeDaemon, now: Instant) -> usize {
    let mut moved = 0;
    for _ in 0..32 {
        let from_west = west.take_outgoing();
        let from_east = east.take_outgoing();
        if from_west.is_empty() && from_east.is_empty() {
            break;
        }
        moved += deliver(east, from_west, now);
        moved += deliver(west, from_east, now);
    }
    moved
}

fn kinds(d: &IkeDaemon) -> Vec<StateKind> {
    let mut kinds: Vec<StateKind> = d.states().iter().map(|st| st.kind).collect();
    kinds.sort();
    kinds
}

const PSK_TUNNEL: u32 = Policy::PSK | Policy::ENCRYPT | Policy::TUNNEL;

fn established_pair(policy: u32) -> (IkeDaemon, IkeDaemon, Instant) {
    let now = Instant::now();
    let mut west = daemon(WEST, None);
    let mut east = daemon(EAST, None);
    add_and_listen(&mut west, connection(WEST, EAST, policy, "3des-sha-modp1024"), now);
    add_and_listen(&mut east, connection(EAST, WEST, policy, "3des-sha-modp1024"), now);
    initiate(&mut west, now);
    pump(&mut west, &mut east, now);
    (west, east, now)
}

#[test]
fn test_main_and_quick_mode_establish() {
    let (west, east, _) = established_pair(PSK_TUNNEL);

    assert_eq!(kinds(&west), vec![StateKind::MainI4, StateKind::QuickI2]);
    assert_eq!(kinds(&east), vec![StateKind::MainR3, StateKind::QuickR2]);

    // inbound and outbound ESP on both sides
    assert_eq!(west.kernel().sa_count(), 2);
    assert_eq!(east.kernel().sa_count(), 2);

    let w = west.metrics().snapshot();
    let e = east.metrics().snapshot();
    assert_eq!(w.phase1_completed, 1);
    assert_eq!(e.phase1_completed, 1);
    assert_eq!(w.ipsec_sa_active, 1);
    assert_eq!(e.ipsec_sa_active, 1);
    assert_eq!(e.packets_rejected, 0);
}

#[test]
fn test_aggressive_mode_establishes() {
    let (west, east, _) = established_pair(PSK_TUNNEL | Policy::AGGRESSIVE);

    assert_eq!(kinds(&west), vec![StateKind::AggrI2, StateKind::QuickI2]);
    assert_eq!(kinds(&east), vec![StateKind::AggrR2, StateKind::QuickR2]);
    assert_eq!(east.kernel().sa_count(), 2);
}

#[test]
fn test_no_proposal_chosen() {
    let now = Instant::now();
    let mut west = daemon(WEST, None);
    let mut east = daemon(EAST, None);
    add_and_listen(&mut west, connection(WEST, EAST, PSK_TUNNEL, "3des-md5-modp1024"), now);
    add_and_listen(&mut east, connection(EAST, WEST, PSK_TUNNEL, "aes128-sha-modp1536"), now);
    initiate(&mut west, now);

    let mi1 = west.take_outgoing();
    deliver(&mut east, mi1, now);

    // the responder keeps nothing and stays silent towards an unauthenticated sender
    assert!(east.states().is_empty());
    assert!(east.take_outgoing().is_empty());

    let snap = east.metrics().snapshot();
    assert_eq!(snap.proposal_negotiation_failed, 1);
    assert_eq!(snap.packets_rejected, 1);
    assert_eq!(snap.notifications_sent, 0);
    assert_eq!(snap.phase1_completed, 0);

    // the initiator is still waiting for a usable answer
    assert_eq!(kinds(&west), vec![StateKind::MainI1]);
}

#[test]
fn test_repeated_failures_block_the_peer() {
    let now = Instant::now();
    let mut west = daemon(WEST, None);
    let mut east = daemon(EAST, Some((2, Duration::from_secs(60))));
    add_and_listen(&mut west, connection(WEST, EAST, PSK_TUNNEL, "3des-md5-modp1024"), now);
    add_and_listen(&mut east, connection(EAST, WEST, PSK_TUNNEL, "aes128-sha-modp1536"), now);
    initiate(&mut west, now);
    let mi1 = west.take_outgoing().remove(0);

    for _ in 0..2 {
        east.process_datagram(mi1.from, mi1.to, &mi1.data, now);
        assert!(east.take_outgoing().is_empty());
    }
    assert!(east.blocks().is_blocked(&addr(WEST)));
    assert_eq!(east.metrics().snapshot().proposal_negotiation_failed, 2);

    // a blocked peer's message never reaches proposal selection
    east.process_datagram(mi1.from, mi1.to, &mi1.data, now);
    assert!(east.take_outgoing().is_empty());
    let snap = east.metrics().snapshot();
    assert_eq!(snap.proposal_negotiation_failed, 2);
    assert_eq!(snap.peers_blocked, 1);
    assert_eq!(snap.blocked_packets_dropped, 1);

    // the block runs out
    east.on_timer(now + Duration::from_secs(61));
    assert!(!east.blocks().is_blocked(&addr(WEST)));
}

#[test]
fn test_authenticated_peer_loses_its_block_record() {
    let now = Instant::now();
    let mut east = daemon(EAST, Some((3, Duration::from_secs(60))));
    add_and_listen(&mut east, connection(EAST, WEST, PSK_TUNNEL, "aes128-sha-modp1536"), now);

    // one refused attempt, below the threshold
    let mut wrong = daemon(WEST, None);
    add_and_listen(&mut wrong, connection(WEST, EAST, PSK_TUNNEL, "3des-md5-modp1024"), now);
    initiate(&mut wrong, now);
    deliver(&mut east, wrong.take_outgoing(), now);
    east.take_outgoing();
    assert_eq!(east.blocks().get(&addr(WEST)).map(|p| p.reject_num), Some(1));
    assert!(!east.blocks().is_blocked(&addr(WEST)));

    // the same peer then authenticates
    let mut west = daemon(WEST, None);
    add_and_listen(&mut west, connection(WEST, EAST, PSK_TUNNEL, "aes128-sha-modp1536"), now);
    initiate(&mut west, now);
    pump(&mut west, &mut east, now);

    assert_eq!(kinds(&east), vec![StateKind::MainR3, StateKind::QuickR2]);
    assert!(east.blocks().get(&addr(WEST)).is_none());
}

#[test]
fn test_duplicate_message_triggers_retransmission() {
    let now = Instant::now();
    let mut west = daemon(WEST, None);
    let mut east = daemon(EAST, None);
    add_and_listen(&mut west, connection(WEST, EAST, PSK_TUNNEL, "3des-sha-modp1024"), now);
    add_and_listen(&mut east, connection(EAST, WEST, PSK_TUNNEL, "3des-sha-modp1024"), now);
    initiate(&mut west, now);
    let mi1 = west.take_outgoing().remove(0);

    east.process_datagram(mi1.from, mi1.to, &mi1.data, now);
    let first = east.take_outgoing();
    assert_eq!(first.len(), 1);
    assert_eq!(east.states().len(), 1);

    east.process_datagram(mi1.from, mi1.to, &mi1.data, now);
    let again = east.take_outgoing();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].data, first[0].data);
    assert_eq!(east.states().len(), 1);

    let snap = east.metrics().snapshot();
    assert_eq!(snap.duplicates_received, 1);
    assert_eq!(snap.retransmissions, 1);
}

#[test]
fn test_duplicate_without_retransmit_flag_is_discarded() {
    let (west, mut east, now) = established_pair(PSK_TUNNEL);
    let qi2 = west
        .states()
        .iter()
        .find(|st| st.kind == StateKind::QuickI2)
        .map(|st| st.tpacket.clone())
        .expect("Quick Mode initiator state");
    let before = east.metrics().snapshot();

    let from = SocketAddr::new(addr(WEST), 500);
    let to = SocketAddr::new(addr(EAST), 500);
    east.process_datagram(from, to, &qi2, now);

    assert!(east.take_outgoing().is_empty());
    assert_eq!(kinds(&east), vec![StateKind::MainR3, StateKind::QuickR2]);
    let after = east.metrics().snapshot();
    assert_eq!(after.duplicates_received, before.duplicates_received + 1);
    assert_eq!(after.retransmissions, before.retransmissions);
    assert_eq!(after.packets_rejected, before.packets_rejected);
}

#[test]
fn test_replayed_quick_mode_does_not_create_sas() {
    let now = Instant::now();
    let mut west = daemon(WEST, None);
    let mut east = daemon(EAST, None);
    add_and_listen(&mut west, connection(WEST, EAST, PSK_TUNNEL, "3des-sha-modp1024"), now);
    add_and_listen(&mut east, connection(EAST, WEST, PSK_TUNNEL, "3des-sha-modp1024"), now);
    initiate(&mut west, now);

    // Main Mode: MI1 MR1 MI2 MR2 MI3 MR3, then QI1 follows from west
    let mut qi1 = None;
    for _ in 0..32 {
        let from_west = west.take_outgoing();
        let from_east = east.take_outgoing();
        if from_west.is_empty() && from_east.is_empty() {
            break;
        }
        if kinds(&west).contains(&StateKind::QuickI1) && qi1.is_none() {
            qi1 = from_west.first().cloned();
        }
        deliver(&mut east, from_west, now);
        deliver(&mut west, from_east, now);
    }
    let qi1 = qi1.expect("Quick Mode message 1 was sent");
    assert_eq!(kinds(&east), vec![StateKind::MainR3, StateKind::QuickR2]);
    let sas = east.kernel().sa_count();

    east.process_datagram(qi1.from, qi1.to, &qi1.data, now);
    assert_eq!(kinds(&east), vec![StateKind::MainR3, StateKind::QuickR2]);
    assert_eq!(east.kernel().sa_count(), sas);
}

#[test]
fn test_terminate_deletes_peer_sas() {
    let (mut west, mut east, now) = established_pair(PSK_TUNNEL);
    assert_eq!(east.kernel().sa_count(), 2);

    west.handle_whack(
        WhackMessage::new().with(WhackCommand::Terminate("west-east".into())),
        now,
    );
    assert!(west.states().is_empty());
    assert_eq!(west.kernel().sa_count(), 0);

    pump(&mut west, &mut east, now);
    assert!(east.states().is_empty());
    assert_eq!(east.kernel().sa_count(), 0);
}

#[test]
fn test_status_lists_established_states() {
    let (mut west, _east, now) = established_pair(PSK_TUNNEL);
    let lines = west.handle_whack(WhackMessage::new().with(WhackCommand::Status), now);
    let text: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    assert!(text.iter().any(|l| l.contains("\"west-east\"")));
    assert!(text.iter().any(|l| l.contains(StateKind::MainI4.name())));
    assert!(text.iter().any(|l| l.contains(StateKind::QuickI2.name())));
}

fn opportunistic(me: &str) -> ConnectionConfig {
    ConnectionConfig::builder("oe")
        .with_left(EndConfig::host(addr(me)))
        .with_right(EndConfig::any().with_client("0.0.0.0/32".parse().expect("valid subnet")))
        .with_policy(Policy::new(PSK_TUNNEL | Policy::OPPO))
        .with_psk(b"a shared secret".to_vec())
        .build()
        .expect("valid connection")
}

#[test]
fn test_opportunistic_responder_suspends_until_resumed() {
    let now = Instant::now();
    let mut west = daemon(WEST, None);
    let mut east = daemon(EAST, None);
    add_and_listen(&mut west, opportunistic(WEST), now);
    add_and_listen(&mut east, opportunistic(EAST), now);

    west.handle_whack(
        WhackMessage::new().with(WhackCommand::OppoInitiate {
            our_client: addr(WEST),
            peer_client: addr(EAST),
            asynchronous: true,
        }),
        now,
    );
    pump(&mut west, &mut east, now);

    // Phase 1 is up; Quick Mode waits on the responder's lookup
    assert_eq!(kinds(&west), vec![StateKind::MainI4, StateKind::QuickI1]);
    let parked = east
        .states()
        .iter()
        .find(|st| st.suspended.is_some())
        .map(|st| st.serial)
        .expect("a suspended state");
    assert_eq!(east.kernel().sa_count(), 0);

    assert!(east.resume_suspended(parked, true, now));
    assert!(!east.resume_suspended(parked, true, now));
    pump(&mut west, &mut east, now);

    assert_eq!(kinds(&west), vec![StateKind::MainI4, StateKind::QuickI2]);
    assert_eq!(kinds(&east), vec![StateKind::MainR3, StateKind::QuickR2]);
    assert_eq!(east.kernel().sa_count(), 2);
}
