//! The tokio front end answering over real UDP sockets

use fynx_ike::{
    ConnectionConfig, DaemonConfig, EndConfig, IkeDaemon, IkeServer, MemoryKernel, StateKind,
    WhackCommand, WhackMessage,
};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

fn addr(s: &str) -> IpAddr {
    s.parse().expect("valid address")
}

/// First Main Mode message of an initiator aimed at `server`
fn main_mode_i1(server: SocketAddr) -> Vec<u8> {
    let config = DaemonConfig::builder()
        .with_interface(addr("192.0.2.1"))
        .build()
        .expect("valid config");
    let mut west = IkeDaemon::new(config, Box::new(MemoryKernel::new())).expect("daemon created");
    let conn = ConnectionConfig::builder("to-server")
        .with_left(EndConfig::host(addr("192.0.2.1")))
        .with_right(EndConfig::host(server.ip()).with_host_port(server.port()))
        .with_psk(b"a shared secret".to_vec())
        .build()
        .expect("valid connection");
    west.handle_whack(
        WhackMessage::new()
            .with(WhackCommand::AddConnection(conn))
            .with(WhackCommand::Initiate {
                name: "to-server".into(),
                asynchronous: true,
            }),
        Instant::now(),
    );
    west.take_outgoing().remove(0).data
}

#[tokio::test]
async fn test_server_answers_main_mode_over_udp() {
    let config = DaemonConfig::builder()
        .with_interface(addr("127.0.0.1"))
        .build()
        .expect("valid config");
    let daemon = IkeDaemon::new(config, Box::new(MemoryKernel::new())).expect("daemon created");
    let server = IkeServer::bind(daemon, &["127.0.0.1:0".parse().expect("valid address")])
        .await
        .expect("bind succeeds");
    let server_addr = server.local_addrs()[0];
    let handle = server.handle();
    let task = tokio::spawn(server.run());

    let road_warrior = ConnectionConfig::builder("road-warrior")
        .with_left(EndConfig::host(addr("127.0.0.1")))
        .with_right(EndConfig::any())
        .with_psk(b"a shared secret".to_vec())
        .build()
        .expect("valid connection");
    handle
        .whack(
            WhackMessage::new()
                .with(WhackCommand::AddConnection(road_warrior))
                .with(WhackCommand::Listen),
        )
        .await
        .expect("server running");

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
    let mi1 = main_mode_i1(server_addr);
    client.send_to(&mi1, server_addr).await.expect("send");

    let mut buf = vec![0u8; 4096];
    let (len, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("reply within timeout")
        .expect("recv");
    assert_eq!(from, server_addr);
    assert!(len >= 28);
    // same initiator cookie, fresh responder cookie
    assert_eq!(buf[..8], mi1[..8]);
    assert_ne!(buf[8..16], [0u8; 8]);

    let status = handle
        .whack(WhackMessage::new().with(WhackCommand::Status))
        .await
        .expect("server running");
    assert!(status
        .iter()
        .any(|l| l.text.contains(StateKind::MainR1.name())));

    handle
        .whack(WhackMessage::new().with(WhackCommand::Shutdown))
        .await
        .expect("server running");
    let daemon = task.await.expect("server task").expect("clean shutdown");
    assert!(daemon.states().is_empty());
    assert_eq!(daemon.metrics().snapshot().packets_received, 1);
}
