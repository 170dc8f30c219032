use std::net::SocketAddr;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;


/// channel carrying session control traffic: handshake, latches, module negotiation
pub const CHANNEL_CONTROL: u8 = 0;
/// channel carrying bulk file transfer traffic
pub const CHANNEL_BULK: u8 = 1;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SendTarget {
    Peer(SocketAddr),
    Broadcast,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    /// a remote peer connected; the payload is its connect greeting
    Connect { peer: SocketAddr, payload: Bytes },
    Disconnect { peer: SocketAddr },
    Receive { peer: SocketAddr, buf: Bytes },
}

/// Contract against the underlying unreliable-but-ordered channel transport. The crate
///  does not reproduce a socket implementation; hosts only rely on this interface
///  (see [crate::test_util::transport::InMemHub] for the loopback implementation).
///
/// It is passed around as an `Arc<dyn ...>` to keep [crate::net::host::Host] decoupled
///  from any concrete transport.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    async fn connect(&self, to: SocketAddr, payload: Bytes) -> anyhow::Result<()>;

    async fn disconnect(&self, peer: SocketAddr);

    async fn send(&self, to: SendTarget, channel: u8, buf: Bytes, reliable: bool) -> anyhow::Result<()>;

    /// Drains the events that are currently available, never blocking to wait for more.
    async fn poll_events(&self) -> Vec<TransportEvent>;

    /// Pushes queued sends out to the wire. Called at the end of every dispatcher step,
    ///  including for paused hosts.
    async fn flush(&self);
}
