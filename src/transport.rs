//! # UDP Datagram Transport
//!
//! Narrow transport surface consumed by the node: bind a socket, send a
//! datagram to a neighbor address, receive datagrams on a channel, and
//! toggle local-network multicast discovery.
//!
//! Links are assumed reliable-enough byte delivery; the mesh core
//! retransmits nothing but its own flood duplicates, so lost datagrams
//! degrade to missed deliveries, never to corrupted state.
//!
//! ## Discovery
//!
//! With discovery enabled the transport joins a well-known multicast
//! group and periodically sends the node's beacon datagram to it.
//! Beacons from other nodes arrive on the ordinary event channel and
//! are decoded upstream like any datagram; the transport does not
//! interpret payloads.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::MeshError;

/// Well-known multicast group for local-network discovery.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 73, 90);

/// Well-known multicast port for local-network discovery.
pub const MULTICAST_PORT: u16 = 18800;

/// Interval between discovery beacons.
pub const BEACON_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Receive buffer size. Matches the wire-level datagram budget.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Depth of the inbound event channel. Bursts beyond this are dropped
/// at the transport, bounding memory under flood.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// A datagram delivered by the transport: sender address and bytes.
#[derive(Debug)]
pub struct Datagram {
    pub from: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Transport seam the node drives. One implementation per deployment;
/// tests and embedders may substitute their own.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Local address the transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr, MeshError>;

    /// Send one datagram to a neighbor address.
    async fn send(&self, to: SocketAddr, bytes: &[u8]) -> Result<(), MeshError>;

    /// Join the discovery group and start beaconing the given datagram.
    async fn enable_discovery(&self, beacon: Vec<u8>) -> Result<(), MeshError>;

    /// Stop beaconing and leave the discovery group.
    async fn disable_discovery(&self);
}

// ============================================================================
// UdpTransport
// ============================================================================

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<Datagram>,
    discovery: Mutex<Option<DiscoveryState>>,
    recv_task: JoinHandle<()>,
}

struct DiscoveryState {
    beacon_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind the transport. Bind failure is fatal to node startup; no
    /// partial state is left running.
    pub async fn bind(
        addr: SocketAddr,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Datagram>), MeshError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| MeshError::Transport(format!("bind {}: {}", addr, e)))?;
        let socket = Arc::new(socket);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let recv_task = tokio::spawn(recv_loop(socket.clone(), event_tx.clone()));
        let transport = Arc::new(Self {
            socket,
            events: event_tx,
            discovery: Mutex::new(None),
            recv_task,
        });

        Ok((transport, event_rx))
    }
}

/// Pump datagrams from a socket into the event channel until the
/// receiver side goes away.
async fn recv_loop(socket: Arc<UdpSocket>, events: mpsc::Sender<Datagram>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let datagram = Datagram {
                    from,
                    bytes: buf[..len].to_vec(),
                };
                if events.try_send(datagram).is_err() {
                    if events.is_closed() {
                        return;
                    }
                    debug!(%from, "event queue full, dropping datagram");
                }
            }
            Err(e) => {
                // Transient errors (ICMP unreachable surfaced on the
                // socket) must not kill the receive path.
                debug!("socket receive error: {}", e);
                if events.is_closed() {
                    return;
                }
            }
        }
    }
}

/// Bind the shared discovery port with address reuse so several nodes
/// on one host can all listen for beacons.
fn bind_discovery_socket() -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MULTICAST_PORT).into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    Ok(socket.into())
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr, MeshError> {
        self.socket
            .local_addr()
            .map_err(|e| MeshError::Transport(format!("local addr: {}", e)))
    }

    async fn send(&self, to: SocketAddr, bytes: &[u8]) -> Result<(), MeshError> {
        let sent = self
            .socket
            .send_to(bytes, to)
            .await
            .map_err(|e| MeshError::Transport(format!("send to {}: {}", to, e)))?;
        if sent != bytes.len() {
            return Err(MeshError::Transport(format!(
                "short send to {}: {} of {} bytes",
                to,
                sent,
                bytes.len()
            )));
        }
        Ok(())
    }

    async fn enable_discovery(&self, beacon: Vec<u8>) -> Result<(), MeshError> {
        let mut discovery = self.discovery.lock().await;
        if discovery.is_some() {
            return Ok(());
        }

        let std_socket = bind_discovery_socket()
            .map_err(|e| MeshError::Transport(format!("discovery bind: {}", e)))?;
        let recv_socket = UdpSocket::from_std(std_socket)
            .map_err(|e| MeshError::Transport(format!("discovery socket: {}", e)))?;

        self.socket
            .set_multicast_loop_v4(true)
            .map_err(|e| MeshError::Transport(format!("multicast loop: {}", e)))?;

        let recv_task = tokio::spawn(recv_loop(Arc::new(recv_socket), self.events.clone()));

        let send_socket = self.socket.clone();
        let group = SocketAddr::from((MULTICAST_GROUP, MULTICAST_PORT));
        let beacon_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(BEACON_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = send_socket.send_to(&beacon, group).await {
                    debug!("beacon send failed: {}", e);
                }
            }
        });

        *discovery = Some(DiscoveryState {
            beacon_task,
            recv_task,
        });
        Ok(())
    }

    async fn disable_discovery(&self) {
        if let Some(state) = self.discovery.lock().await.take() {
            state.beacon_task.abort();
            state.recv_task.abort();
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
        if let Ok(mut guard) = self.discovery.try_lock() {
            if let Some(state) = guard.take() {
                state.beacon_task.abort();
                state.recv_task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn datagram_roundtrip() {
        let (a, _rx_a) = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (b, mut rx_b) = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let b_addr = b.local_addr().unwrap();
        a.send(b_addr, b"ping").await.unwrap();

        let datagram = timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .expect("receive timeout")
            .expect("channel closed");
        assert_eq!(datagram.bytes, b"ping");
        assert_eq!(datagram.from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn short_send_reports_transport_error() {
        let (a, _rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        // Sending to an unreachable-but-valid address still succeeds at
        // the datagram layer; only socket errors surface.
        let unlinked: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let result = a.send(unlinked, b"x").await;
        assert!(result.is_ok() || matches!(result, Err(MeshError::Transport(_))));
    }

    #[tokio::test]
    async fn discovery_enable_is_idempotent() {
        let (t, _rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        if t.enable_discovery(b"beacon".to_vec()).await.is_ok() {
            t.enable_discovery(b"beacon".to_vec()).await.unwrap();
        }
        t.disable_discovery().await;
        t.disable_discovery().await;
    }
}
