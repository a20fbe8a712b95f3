//! UDP syslog listeners, one socket per vendor.

use crate::router::SyslogRouter;
use crate::shutdown::ShutdownSignal;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Largest datagram we accept. Syslog lines from intercoms are far smaller.
const MAX_DATAGRAM: usize = 8192;

/// How often an idle receive loop wakes up to look at the shutdown flag.
const RECV_POLL: Duration = Duration::from_secs(1);

/// Datagrams queued for one intercom before new ones are dropped.
const PEER_BACKLOG: usize = 256;

/// A bound syslog socket and the router that owns its datagrams.
pub struct SyslogListener {
    socket: UdpSocket,
    router: Arc<SyslogRouter>,
}

impl SyslogListener {
    /// Bind `0.0.0.0:port`. Failing to bind is fatal for the caller.
    pub async fn bind(port: u16, router: SyslogRouter) -> io::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = UdpSocket::bind(addr).await?;
        info!(vendor = router.vendor(), addr = %addr, "Syslog listener bound");
        Ok(Self {
            socket,
            router: Arc::new(router),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive datagrams until shutdown.
    ///
    /// Each source address gets its own worker on `tasks`, so lines from one
    /// intercom are routed in the order they arrived while a slow lookup for
    /// one device never stalls the socket or the others. Workers finish their
    /// backlog and exit once the loop stops.
    pub async fn run(self, tasks: TaskTracker, shutdown: ShutdownSignal) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let vendor = self.router.vendor().to_string();
        let mut peers: HashMap<IpAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = tokio::time::timeout(RECV_POLL, self.socket.recv_from(&mut buf)) => received,
            };

            let (len, peer) = match received {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    error!(vendor = %vendor, error = %e, "UDP receive failed");
                    continue;
                }
                // idle
                Err(_) => continue,
            };

            debug!(vendor = %vendor, peer = %peer, len = len, "Datagram received");
            let source = peer.ip();
            let sender = peers
                .entry(source)
                .or_insert_with(|| self.spawn_peer(source, &tasks));

            match sender.try_send(buf[..len].to_vec()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(vendor = %vendor, peer = %peer, "Peer backlog full, datagram dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(vendor = %vendor, peer = %peer, "Peer worker gone, datagram dropped");
                    peers.remove(&source);
                }
            }
        }

        drop(peers);
        info!(vendor = %vendor, "Syslog listener stopped");
    }

    fn spawn_peer(&self, source: IpAddr, tasks: &TaskTracker) -> mpsc::Sender<Vec<u8>> {
        let (sender, mut receiver) = mpsc::channel::<Vec<u8>>(PEER_BACKLOG);
        let router = Arc::clone(&self.router);
        tasks.spawn(async move {
            while let Some(datagram) = receiver.recv().await {
                router.route(&datagram, source).await;
            }
        });
        sender
    }
}
