use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::net::host::Host;
use crate::net::net_config::NetConfig;
use crate::net::packet_handler::{PacketEvent, PacketHandler, SESSION_HANDLER_ID};
use crate::net::transport::{SendTarget, CHANNEL_CONTROL};
use crate::net::wire::WireMessage;
use crate::session::latch::{EntityId, Latch, LatchBuffer};
use crate::session::module_catalog::ModuleCatalog;
use crate::session::session_messages::SessionMsg;


struct Player {
    display_name: String,
    entity: EntityId,
    loaded: bool,
}

struct AuthorityState {
    players: FxHashMap<SocketAddr, Player>,
    started: bool,
}

/// The authority side of a session: owns admission, module negotiation, the start
///  barrier and the authoritative latch buffer. Registered on the authority host under
///  [SESSION_HANDLER_ID].
pub struct AuthoritySession {
    config: Arc<NetConfig>,
    catalog: Arc<dyn ModuleCatalog>,
    latches: Mutex<LatchBuffer>,
    state: Mutex<AuthorityState>,
}

impl AuthoritySession {
    pub fn new(config: Arc<NetConfig>, catalog: Arc<dyn ModuleCatalog>) -> Arc<AuthoritySession> {
        Arc::new(AuthoritySession {
            config: config.clone(),
            catalog,
            latches: Mutex::new(LatchBuffer::new(&config)),
            state: Mutex::new(AuthorityState {
                players: FxHashMap::default(),
                started: false,
            }),
        })
    }

    /// Input of the authority's own player.
    pub async fn record_local(&self, entity: EntityId, tick: u32, latch: Latch) {
        self.latches.lock().await.record_local(entity, tick, latch);
    }

    /// One simulation tick: drain this tick's latches for the simulation, then
    ///  rebroadcast everything participants have not seen yet, with the replay delay
    ///  the lag window implies.
    pub async fn advance_tick(&self, host: &Host, tick: u32) -> Vec<(EntityId, Latch)> {
        let (inputs, frames) = {
            let mut latches = self.latches.lock().await;
            (latches.unbuffer(tick), latches.rebroadcast(tick))
        };

        for frame in frames {
            let msg = SessionMsg::RecvLatch { frame };
            if let Err(e) = host.send_msg(SendTarget::Broadcast, SESSION_HANDLER_ID, &msg, CHANNEL_CONTROL, false).await {
                debug!("latch rebroadcast failed: {}", e);
            }
        }
        inputs
    }

    pub async fn current(&self, entity: EntityId) -> Latch {
        self.latches.lock().await.current(entity)
    }

    pub async fn kick(&self, host: &Host, addr: SocketAddr) {
        info!("kicking {:?}", addr);
        let _ = host.send_msg(SendTarget::Peer(addr), SESSION_HANDLER_ID, &SessionMsg::Kick, CHANNEL_CONTROL, true).await;
        self.state.lock().await.players.remove(&addr);
        host.drop_connection(addr).await;
    }

    pub async fn player_count(&self) -> usize {
        self.state.lock().await.players.len()
    }

    pub async fn player_entity(&self, addr: SocketAddr) -> Option<EntityId> {
        self.state.lock().await.players.get(&addr).map(|p| p.entity)
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.started
    }

    async fn on_logon(&self, host: &Host, from: SocketAddr, display_name: String) {
        let accepted = {
            let mut state = self.state.lock().await;
            if state.started {
                info!("{:?} tried to log on to a running session - rejecting", from);
                None
            }
            else if state.players.len() >= self.config.max_players {
                info!("session is full - rejecting logon from {:?}", from);
                None
            }
            else {
                let queue_pos = state.players.len() as u8;
                let entity = Self::lowest_free_entity(&state.players);
                info!("player {:?} from {:?} logged on as entity {}", display_name, from, entity);
                state.players.insert(from, Player {
                    display_name,
                    entity,
                    loaded: false,
                });
                Some(queue_pos)
            }
        };

        let reply = match accepted {
            Some(queue_pos) => SessionMsg::Accept { queue_pos },
            None => SessionMsg::Reject,
        };
        let _ = host.send_msg(SendTarget::Peer(from), SESSION_HANDLER_ID, &reply, CHANNEL_CONTROL, true).await;
    }

    fn lowest_free_entity(players: &FxHashMap<SocketAddr, Player>) -> EntityId {
        (0..).find(|candidate| !players.values().any(|p| p.entity == *candidate))
            .expect("fewer players than entity ids")
    }

    async fn on_logoff(&self, from: SocketAddr, display_name: String) {
        match self.state.lock().await.players.remove(&from) {
            Some(player) => info!("player {:?} logged off, freeing entity {}", player.display_name, player.entity),
            None => debug!("logoff for {:?} from {:?} without a matching player - ignoring", display_name, from),
        }
    }

    async fn on_request_module(&self, host: &Host, from: SocketAddr, name: String) {
        let reply = match self.catalog.summary(&name) {
            Some(summary) => {
                debug!("answering module request for {:?} from {:?}", name, from);
                SessionMsg::ModuleInfo { summary }
            }
            None => {
                info!("module {:?} requested by {:?} is not hosted here", name, from);
                SessionMsg::ModuleBad
            }
        };
        let _ = host.send_msg(SendTarget::Peer(from), SESSION_HANDLER_ID, &reply, CHANNEL_CONTROL, true).await;
    }

    async fn on_im_loaded(&self, host: &Host, from: SocketAddr) {
        let start = {
            let mut state = self.state.lock().await;
            match state.players.get_mut(&from) {
                Some(player) => player.loaded = true,
                None => {
                    debug!("loaded report from {:?} without a logon - ignoring", from);
                    return;
                }
            }
            if !state.started && state.players.values().all(|p| p.loaded) {
                state.started = true;
                true
            }
            else {
                false
            }
        };

        if start {
            info!("all participants reported loaded - starting the session");
            let _ = host.send_msg(SendTarget::Broadcast, SESSION_HANDLER_ID, &SessionMsg::Start, CHANNEL_CONTROL, true).await;
        }
    }

    async fn on_send_latch(&self, frame: crate::session::latch::LatchFrame) {
        let mut latches = self.latches.lock().await;
        for (entity, latch) in frame.entries {
            latches.fold_incoming(entity, frame.tick, latch);
        }
    }
}

#[async_trait::async_trait]
impl PacketHandler for AuthoritySession {
    async fn handle(&self, host: &Host, event: PacketEvent<'_>) -> bool {
        match event {
            PacketEvent::Packet { from, kind, buf } => {
                let msg = match SessionMsg::try_deser(kind, buf) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("error deserializing session message from {:?}: {}", from, e);
                        return false;
                    }
                };
                match msg {
                    SessionMsg::Logon { display_name } => self.on_logon(host, from, display_name).await,
                    SessionMsg::Logoff { display_name, .. } => self.on_logoff(from, display_name).await,
                    SessionMsg::SendLatch { frame } => self.on_send_latch(frame).await,
                    SessionMsg::RequestModule { name } => self.on_request_module(host, from, name).await,
                    SessionMsg::ImLoaded => self.on_im_loaded(host, from).await,
                    other => {
                        debug!("unexpected {:?} on the authority side - ignoring", other.kind());
                        return false;
                    }
                }
                true
            }
            PacketEvent::PeerConnected { peer, slot } => {
                debug!("peer {:?} connected in slot {}", peer, slot);
                true
            }
            PacketEvent::PeerDisconnected { peer } => {
                if let Some(player) = self.state.lock().await.players.remove(&peer) {
                    info!("player {:?} dropped", player.display_name);
                }
                true
            }
        }
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::net::host::Role;
    use crate::session::module_catalog::StaticCatalog;
    use crate::test_util::transport::{test_addr, InMemHub};

    use super::*;

    async fn authority_with_host() -> (Arc<AuthoritySession>, Arc<Host>, InMemHub) {
        let hub = InMemHub::new();
        let config = Arc::new(NetConfig::new());
        let host = Host::new(Role::Authority, config.clone(), hub.endpoint(test_addr(1)));
        host.open().await;

        let session = AuthoritySession::new(config, Arc::new(StaticCatalog::empty()));
        host.register_handler(session.clone(), Some(SESSION_HANDLER_ID)).await.unwrap();
        (session, host, hub)
    }

    #[rstest]
    #[tokio::test]
    async fn test_entity_ids_are_reused() {
        let (session, host, _hub) = authority_with_host().await;

        for n in 0..3u16 {
            session.on_logon(&host, test_addr(10 + n), format!("p{}", n)).await;
        }
        assert_eq!(session.player_entity(test_addr(11)).await, Some(1));

        session.on_logoff(test_addr(11), "p1".to_string()).await;
        session.on_logon(&host, test_addr(20), "p9".to_string()).await;
        // the freed entity id is taken again
        assert_eq!(session.player_entity(test_addr(20)).await, Some(1));
    }

    #[rstest]
    #[tokio::test]
    async fn test_session_full_rejects() {
        let (session, host, _hub) = authority_with_host().await;

        for n in 0..8u16 {
            session.on_logon(&host, test_addr(10 + n), format!("p{}", n)).await;
        }
        assert_eq!(session.player_count().await, 8);

        session.on_logon(&host, test_addr(99), "late".to_string()).await;
        assert_eq!(session.player_count().await, 8);
        assert_eq!(session.player_entity(test_addr(99)).await, None);
    }

    #[rstest]
    #[tokio::test]
    async fn test_start_fires_once_when_all_loaded() {
        let (session, host, _hub) = authority_with_host().await;

        session.on_logon(&host, test_addr(10), "a".to_string()).await;
        session.on_logon(&host, test_addr(11), "b".to_string()).await;

        session.on_im_loaded(&host, test_addr(10)).await;
        assert!(!session.is_started().await);

        session.on_im_loaded(&host, test_addr(11)).await;
        assert!(session.is_started().await);

        // a running session rejects fresh logons
        session.on_logon(&host, test_addr(12), "late".to_string()).await;
        assert_eq!(session.player_count().await, 2);
    }
}
