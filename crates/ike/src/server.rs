//! UDP front end
//!
//! [`IkeServer`] binds the IKE sockets (port 500 and the NAT-T float port
//! 4500 in a real deployment), feeds received datagrams and timer ticks to
//! an [`IkeDaemon`] and sends whatever the daemon queued. Operator requests
//! reach the loop through a cloneable [`ServerHandle`].
//!
//! # Example
//!
//! ```rust,no_run
//! use fynx_ike::{DaemonConfig, IkeDaemon, IkeServer, MemoryKernel, WhackCommand, WhackMessage};
//!
//! # async fn demo() -> fynx_ike::Result<()> {
//! let config = DaemonConfig::builder()
//!     .with_interface("192.0.2.1".parse().unwrap())
//!     .build()?;
//! let daemon = IkeDaemon::new(config, Box::new(MemoryKernel::new()))?;
//! let server = IkeServer::bind(daemon, &["192.0.2.1:500".parse().unwrap()]).await?;
//! let handle = server.handle();
//! let task = tokio::spawn(server.run());
//!
//! handle.whack(WhackMessage::new().with(WhackCommand::Listen)).await?;
//! handle.whack(WhackMessage::new().with(WhackCommand::Shutdown)).await?;
//! let _daemon = task.await.expect("server task")?;
//! # Ok(())
//! # }
//! ```

use crate::daemon::{Datagram, IkeDaemon};
use crate::error::{Error, Result};
use crate::whack::{WhackLine, WhackMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Largest datagram we read
const MAX_DATAGRAM: usize = 65536;

/// How long the loop sleeps when no event is scheduled
const IDLE_TICK: std::time::Duration = std::time::Duration::from_secs(1);

type Received = (Vec<u8>, SocketAddr, SocketAddr);
type WhackRequest = (WhackMessage, oneshot::Sender<Vec<WhackLine>>);

/// Sends operator requests to a running [`IkeServer`]
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<WhackRequest>,
}

impl ServerHandle {
    /// Run an operator request and wait for its reply lines
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the server loop has stopped.
    pub async fn whack(&self, msg: WhackMessage) -> Result<Vec<WhackLine>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((msg, reply_tx))
            .await
            .map_err(|_| Error::Io("IKE server has stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Io("IKE server dropped the request".into()))
    }
}

/// Tokio UDP loop around an [`IkeDaemon`]
pub struct IkeServer {
    daemon: IkeDaemon,
    sockets: Vec<(SocketAddr, Arc<UdpSocket>)>,
    whack_tx: mpsc::Sender<WhackRequest>,
    whack_rx: mpsc::Receiver<WhackRequest>,
}

impl std::fmt::Debug for IkeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IkeServer")
            .field("daemon", &self.daemon)
            .field("sockets", &self.local_addrs())
            .finish()
    }
}

impl IkeServer {
    /// Bind one UDP socket per address
    ///
    /// A wildcard address is reported to the daemon as its first
    /// interface, so connections see a concrete local address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if any address cannot be bound.
    pub async fn bind(daemon: IkeDaemon, addrs: &[SocketAddr]) -> Result<Self> {
        let mut sockets = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let socket = UdpSocket::bind(addr)
                .await
                .map_err(|e| Error::Io(format!("cannot bind {}: {}", addr, e)))?;
            let mut local = socket.local_addr().map_err(|e| Error::Io(e.to_string()))?;
            if local.ip().is_unspecified() {
                if let Some(iface) = daemon.config().interfaces.first() {
                    local.set_ip(*iface);
                }
            }
            info!("adding interface {}", local);
            sockets.push((local, Arc::new(socket)));
        }
        let (whack_tx, whack_rx) = mpsc::channel(16);
        Ok(IkeServer {
            daemon,
            sockets,
            whack_tx,
            whack_rx,
        })
    }

    /// Addresses the sockets are bound to
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.iter().map(|(addr, _)| *addr).collect()
    }

    /// A handle for operator requests
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.whack_tx.clone(),
        }
    }

    /// The daemon being driven
    pub fn daemon(&self) -> &IkeDaemon {
        &self.daemon
    }

    /// Serve until an operator shuts the daemon down; returns the daemon
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if every socket reader has failed.
    pub async fn run(mut self) -> Result<IkeDaemon> {
        let (rx_tx, mut rx) = mpsc::channel::<Received>(256);
        let mut readers = Vec::with_capacity(self.sockets.len());
        for (local, socket) in &self.sockets {
            readers.push(tokio::spawn(read_loop(*local, Arc::clone(socket), rx_tx.clone())));
        }
        drop(rx_tx);

        let result = loop {
            if self.daemon.is_shutdown() {
                break Ok(());
            }
            let deadline = self
                .daemon
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_TICK);
            let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));

            tokio::select! {
                received = rx.recv() => match received {
                    Some((data, from, to)) => {
                        self.daemon.process_datagram(from, to, &data, Instant::now());
                    }
                    None => break Err(Error::Io("all IKE sockets failed".into())),
                },
                request = self.whack_rx.recv() => {
                    if let Some((msg, reply)) = request {
                        let lines = self.daemon.handle_whack(msg, Instant::now());
                        // the requester may have gone away
                        let _ = reply.send(lines);
                    }
                }
                _ = sleep => {
                    self.daemon.on_timer(Instant::now());
                }
            }
            self.flush().await;
        };

        for reader in readers {
            reader.abort();
        }
        result.map(|()| self.daemon)
    }

    /// Send every queued datagram from the socket matching its source
    async fn flush(&mut self) {
        for Datagram { from, to, data } in self.daemon.take_outgoing() {
            let Some((_, socket)) = self.sockets.iter().find(|(local, _)| *local == from) else {
                warn!("no socket bound to {} for a message to {}", from, to);
                continue;
            };
            if let Err(e) = socket.send_to(&data, to).await {
                warn!("sendto on {} to {} failed: {}", from, to, e);
            }
        }
    }
}

async fn read_loop(local: SocketAddr, socket: Arc<UdpSocket>, tx: mpsc::Sender<Received>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if tx.send((buf[..len].to_vec(), from, local)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                // ICMP errors surface here on some platforms; keep reading
                debug!("recvfrom on {} failed: {}", local, e);
            }
        }
    }
}
