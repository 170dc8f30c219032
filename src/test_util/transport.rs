use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::net::transport::{SendTarget, Transport, TransportEvent};


/// convenience for test code: create a socket address based on a number, the same number
///  generating the same address and different numbers different addresses
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 16384 + number).into()
}


struct Endpoint {
    queue: VecDeque<TransportEvent>,
    /// everything this endpoint has polled, kept for test assertions
    polled: Vec<TransportEvent>,
    connected: FxHashSet<SocketAddr>,
}

impl Endpoint {
    fn new() -> Endpoint {
        Endpoint {
            queue: VecDeque::new(),
            polled: Vec::new(),
            connected: FxHashSet::default(),
        }
    }
}

struct HubState {
    endpoints: FxHashMap<SocketAddr, Endpoint>,
}

/// Loopback implementation of the [Transport] contract: a hub of endpoints with ordered
///  per-endpoint event queues. Sends are buffered until `flush`, mirroring the real
///  transport's end-of-step flush semantics.
#[derive(Clone)]
pub struct InMemHub {
    state: Arc<Mutex<HubState>>,
}

impl InMemHub {
    pub fn new() -> InMemHub {
        InMemHub {
            state: Arc::new(Mutex::new(HubState {
                endpoints: FxHashMap::default(),
            })),
        }
    }

    pub fn endpoint(&self, addr: SocketAddr) -> Arc<InMemTransport> {
        self.state.lock().unwrap()
            .endpoints
            .insert(addr, Endpoint::new());
        Arc::new(InMemTransport {
            hub: self.clone(),
            addr,
            outbox: Mutex::new(Vec::new()),
        })
    }

    /// Everything the endpoint has polled so far; for assertions on wire traffic.
    pub fn drained_events(&self, addr: SocketAddr) -> Vec<TransportEvent> {
        self.state.lock().unwrap()
            .endpoints
            .get(&addr)
            .map(|e| e.polled.clone())
            .unwrap_or_default()
    }
}

impl HubState {
    fn deliver(&mut self, to: SocketAddr, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get_mut(&to) {
            endpoint.queue.push_back(event);
        }
    }
}

pub struct InMemTransport {
    hub: InMemHub,
    addr: SocketAddr,
    outbox: Mutex<Vec<(SendTarget, Bytes)>>,
}

#[async_trait::async_trait]
impl Transport for InMemTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn connect(&self, to: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        let mut state = self.hub.state.lock().unwrap();
        if !state.endpoints.contains_key(&to) {
            bail!("no endpoint listening at {}", to);
        }

        state.deliver(to, TransportEvent::Connect {
            peer: self.addr,
            payload,
        });
        state.endpoints.get_mut(&to).unwrap().connected.insert(self.addr);
        if let Some(own) = state.endpoints.get_mut(&self.addr) {
            own.connected.insert(to);
        }
        Ok(())
    }

    async fn disconnect(&self, peer: SocketAddr) {
        // pending sends to this peer still go out first: delivery stays ordered up to
        // the teardown
        let pending: Vec<Bytes> = {
            let mut outbox = self.outbox.lock().unwrap();
            let (to_peer, rest): (Vec<_>, Vec<_>) = outbox.drain(..)
                .partition(|(target, _)| *target == SendTarget::Peer(peer));
            *outbox = rest;
            to_peer.into_iter().map(|(_, buf)| buf).collect()
        };

        let mut state = self.hub.state.lock().unwrap();
        for buf in pending {
            state.deliver(peer, TransportEvent::Receive {
                peer: self.addr,
                buf,
            });
        }
        state.deliver(peer, TransportEvent::Disconnect { peer: self.addr });
        if let Some(endpoint) = state.endpoints.get_mut(&peer) {
            endpoint.connected.remove(&self.addr);
        }
        if let Some(own) = state.endpoints.get_mut(&self.addr) {
            own.connected.remove(&peer);
        }
    }

    async fn send(&self, to: SendTarget, _channel: u8, buf: Bytes, _reliable: bool) -> anyhow::Result<()> {
        // in-memory delivery is always ordered and lossless, so the reliability flag and
        // channel are irrelevant here
        self.outbox.lock().unwrap().push((to, buf));
        Ok(())
    }

    async fn poll_events(&self) -> Vec<TransportEvent> {
        let mut state = self.hub.state.lock().unwrap();
        let Some(endpoint) = state.endpoints.get_mut(&self.addr) else {
            return Vec::new();
        };
        let events: Vec<TransportEvent> = endpoint.queue.drain(..).collect();
        endpoint.polled.extend(events.iter().cloned());
        events
    }

    async fn flush(&self) {
        let batch: Vec<(SendTarget, Bytes)> = self.outbox.lock().unwrap().drain(..).collect();
        if batch.is_empty() {
            return;
        }

        let mut state = self.hub.state.lock().unwrap();
        for (target, buf) in batch {
            match target {
                SendTarget::Peer(to) => {
                    state.deliver(to, TransportEvent::Receive {
                        peer: self.addr,
                        buf,
                    });
                }
                SendTarget::Broadcast => {
                    let connected: Vec<SocketAddr> = state.endpoints.get(&self.addr)
                        .map(|e| e.connected.iter().copied().collect())
                        .unwrap_or_default();
                    for to in connected {
                        state.deliver(to, TransportEvent::Receive {
                            peer: self.addr,
                            buf: buf.clone(),
                        });
                    }
                }
            }
        }
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[tokio::test]
    async fn test_sends_are_held_until_flush() {
        let hub = InMemHub::new();
        let a = hub.endpoint(test_addr(1));
        let b = hub.endpoint(test_addr(2));

        a.send(SendTarget::Peer(test_addr(2)), 0, Bytes::from_static(b"x"), true).await.unwrap();
        assert!(b.poll_events().await.is_empty());

        a.flush().await;
        assert_eq!(b.poll_events().await, vec![TransportEvent::Receive {
            peer: test_addr(1),
            buf: Bytes::from_static(b"x"),
        }]);
    }

    #[rstest]
    #[tokio::test]
    async fn test_broadcast_reaches_all_connected_peers() {
        let hub = InMemHub::new();
        let hosting = hub.endpoint(test_addr(1));
        let first = hub.endpoint(test_addr(2));
        let second = hub.endpoint(test_addr(3));
        let stranger = hub.endpoint(test_addr(4));

        first.connect(test_addr(1), Bytes::new()).await.unwrap();
        second.connect(test_addr(1), Bytes::new()).await.unwrap();

        hosting.send(SendTarget::Broadcast, 0, Bytes::from_static(b"tick"), false).await.unwrap();
        hosting.flush().await;

        assert_eq!(first.poll_events().await.len(), 1);
        assert_eq!(second.poll_events().await.len(), 1);
        assert!(stranger.poll_events().await.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_connect_to_missing_endpoint_fails() {
        let hub = InMemHub::new();
        let a = hub.endpoint(test_addr(1));
        assert!(a.connect(test_addr(9), Bytes::new()).await.is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn test_disconnect_flushes_pending_sends_to_the_peer_first() {
        let hub = InMemHub::new();
        let a = hub.endpoint(test_addr(1));
        let b = hub.endpoint(test_addr(2));
        b.connect(test_addr(1), Bytes::new()).await.unwrap();

        a.send(SendTarget::Peer(test_addr(2)), 0, Bytes::from_static(b"bye"), true).await.unwrap();
        a.disconnect(test_addr(2)).await;

        let events = b.poll_events().await;
        assert_eq!(events, vec![
            TransportEvent::Receive { peer: test_addr(1), buf: Bytes::from_static(b"bye") },
            TransportEvent::Disconnect { peer: test_addr(1) },
        ]);
    }
}
