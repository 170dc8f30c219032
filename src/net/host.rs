use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::net::net_config::NetConfig;
use crate::net::packet_handler::{HandlerId, PacketHandler, SESSION_HANDLER_ID};
use crate::net::registry::{ConnectionSlot, HandlerRegistry, InboundTable, PeerTable};
use crate::net::request::PendingRequests;
use crate::net::transport::{SendTarget, Transport, CHANNEL_CONTROL};
use crate::net::wire::{put_header, ConnectGreeting, MsgKind, WireMessage};


/// Exactly two logical roles exist; a single process may run both concurrently (hosting
///  a session while participating in it).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Role {
    Authority,
    Participant,
}

pub(crate) struct HostState {
    pub open_count: u32,
    pub active: bool,
    pub terminating: bool,
}

/// One logical endpoint of the transport. All tables are owned exclusively by their
///  host: one stepper task drains events while any number of tasks concurrently
///  register handlers, prepare requests or enqueue sends through the per-table locks.
pub struct Host {
    role: Role,
    config: Arc<NetConfig>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: RwLock<HandlerRegistry>,
    pub(crate) fallback: RwLock<Option<Arc<dyn PacketHandler>>>,
    pub(crate) inbound: RwLock<InboundTable>,
    peers: Mutex<PeerTable>,
    requests: PendingRequests,
    pub(crate) state: Mutex<HostState>,
}

impl Debug for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Host{{{:?}@{}}}", self.role, self.transport.local_addr())
    }
}

impl Host {
    pub fn new(role: Role, config: Arc<NetConfig>, transport: Arc<dyn Transport>) -> Arc<Host> {
        Arc::new(Host {
            role,
            config: config.clone(),
            transport,
            registry: RwLock::new(HandlerRegistry::new()),
            fallback: RwLock::new(None),
            inbound: RwLock::new(InboundTable::new(config.max_connections)),
            peers: Mutex::new(PeerTable::new()),
            requests: PendingRequests::new(config.max_pending_requests, config.request_poll_interval),
            state: Mutex::new(HostState {
                open_count: 0,
                active: false,
                terminating: false,
            }),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &Arc<NetConfig> {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn requests(&self) -> &PendingRequests {
        &self.requests
    }

    /// Reference-counted start: several logical services may share one host, each
    ///  balancing its `open` with a `close`.
    pub async fn open(&self) {
        let mut state = self.state.lock().await;
        state.open_count += 1;
        if state.open_count == 1 {
            state.active = true;
            info!("{:?} host at {} opened", self.role, self.transport.local_addr());
        }
    }

    pub async fn close(&self) {
        let now_closed = {
            let mut state = self.state.lock().await;
            if state.open_count == 0 {
                return;
            }
            state.open_count -= 1;
            state.open_count == 0
        };
        if now_closed {
            self.shutdown().await;
        }
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.open_count > 0
    }

    /// A paused host keeps flushing its outbound queue but stops processing events.
    pub async fn pause(&self) {
        self.state.lock().await.active = false;
    }

    pub async fn resume(&self) {
        self.state.lock().await.active = true;
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    pub async fn is_terminating(&self) -> bool {
        self.state.lock().await.terminating
    }

    pub async fn register_handler(&self, handler: Arc<dyn PacketHandler>, explicit_id: Option<HandlerId>) -> anyhow::Result<HandlerId> {
        self.registry.write().await
            .register(handler, explicit_id)
    }

    pub async fn unregister_handler(&self, id: HandlerId) {
        self.registry.write().await
            .unregister(id)
    }

    pub async fn registered_handler(&self, id: HandlerId) -> Option<Arc<dyn PacketHandler>> {
        self.registry.read().await.find(id)
    }

    /// The fallback receives packets whose service id matches no registration.
    pub async fn set_fallback_handler(&self, handler: Arc<dyn PacketHandler>) {
        *self.fallback.write().await = Some(handler);
    }

    /// Returns the existing peer handle when one already targets this address, else
    ///  initiates a new transport connection carrying this host's greeting.
    pub async fn connect_or_reuse(&self, addr: SocketAddr, service: HandlerId) -> anyhow::Result<SocketAddr> {
        let (peer, is_new) = self.peers.lock().await.acquire(addr);
        if !is_new {
            return Ok(peer);
        }

        let greeting = ConnectGreeting {
            hostname: self.config.hostname.clone(),
            display_name: self.config.display_name.clone(),
            service,
        };
        let mut buf = BytesMut::new();
        greeting.ser(&mut buf)?;

        if let Err(e) = self.transport.connect(addr, buf.freeze()).await {
            self.peers.lock().await.release(addr);
            return Err(e);
        }
        debug!("connected to {:?}", addr);
        Ok(peer)
    }

    /// Logical disconnect: the transport connection is only reset once every service
    ///  that acquired the peer has released it.
    pub async fn release_peer(&self, addr: SocketAddr) {
        let torn_down = self.peers.lock().await.release(addr);
        if torn_down {
            self.transport.disconnect(addr).await;
            debug!("released last reference to {:?}, disconnected", addr);
        }
    }

    pub async fn peer_refs(&self, addr: SocketAddr) -> Option<u32> {
        self.peers.lock().await.refs(addr)
    }

    pub async fn send_msg<M: WireMessage>(&self, target: SendTarget, service: HandlerId, msg: &M, channel: u8, reliable: bool) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        put_header(&mut buf, msg.kind(), service);
        msg.ser_fields(&mut buf)?;
        self.transport.send(target, channel, buf.freeze(), reliable).await
    }

    pub async fn connection(&self, index: usize) -> Option<ConnectionSlot> {
        self.inbound.read().await.get(index).cloned()
    }

    pub async fn connection_index(&self, addr: SocketAddr) -> Option<usize> {
        self.inbound.read().await.index_of(addr)
    }

    pub async fn connection_count(&self) -> usize {
        self.inbound.read().await.num_occupied()
    }

    /// Removes an inbound connection (e.g. on kick) and resets the transport link.
    pub async fn drop_connection(&self, addr: SocketAddr) {
        if self.inbound.write().await.remove_addr(addr).is_some() {
            self.transport.disconnect(addr).await;
        }
    }

    /// Idempotent teardown: notify inbound peers (the authority's protocol defines a
    ///  kick message for this), flush the farewells, then reset all transport links.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            if state.terminating {
                return;
            }
            state.terminating = true;
            state.active = false;
        }
        info!("shutting down {:?} host at {}", self.role, self.transport.local_addr());

        let inbound_peers: Vec<SocketAddr> = self.inbound.read().await
            .occupied()
            .map(|(_, slot)| slot.addr)
            .collect();

        if self.role == Role::Authority {
            for addr in &inbound_peers {
                let mut buf = BytesMut::new();
                put_header(&mut buf, MsgKind::Kick, SESSION_HANDLER_ID);
                let _ = self.transport.send(SendTarget::Peer(*addr), CHANNEL_CONTROL, buf.freeze(), true).await;
            }
        }
        self.transport.flush().await;

        for addr in inbound_peers {
            self.inbound.write().await.remove_addr(addr);
            self.transport.disconnect(addr).await;
        }
        for addr in self.peers.lock().await.addrs() {
            self.transport.disconnect(addr).await;
        }
    }
}


/// Explicit replacement for process-wide host singletons: the top-level application owns
///  one context and passes it into every component, which also allows multiple contexts
///  side by side (e.g. in tests).
pub struct NetworkContext {
    config: Arc<NetConfig>,
    hosts: Mutex<Vec<Arc<Host>>>,
}

impl NetworkContext {
    pub fn new(config: NetConfig) -> anyhow::Result<NetworkContext> {
        config.validate()?;
        Ok(NetworkContext {
            config: Arc::new(config),
            hosts: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Arc<NetConfig> {
        &self.config
    }

    /// Lazily creates the host for this role on first use; subsequent opens share it
    ///  (and ignore the passed transport). Every open must be balanced by a close.
    pub async fn open(&self, role: Role, transport: Arc<dyn Transport>) -> Arc<Host> {
        let mut hosts = self.hosts.lock().await;
        let host = match hosts.iter().find(|h| h.role() == role) {
            Some(host) => host.clone(),
            None => {
                let host = Host::new(role, self.config.clone(), transport);
                hosts.push(host.clone());
                host
            }
        };
        host.open().await;
        host
    }

    pub async fn get(&self, role: Role) -> Option<Arc<Host>> {
        self.hosts.lock().await.iter()
            .find(|h| h.role() == role)
            .cloned()
    }

    pub async fn close(&self, role: Role) {
        let host = self.get(role).await;
        if let Some(host) = host {
            host.close().await;
            if !host.is_open().await {
                self.hosts.lock().await.retain(|h| h.role() != role);
            }
        }
    }
}
