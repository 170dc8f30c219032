use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::net::host::Host;
use crate::net::net_config::NetConfig;
use crate::net::packet_handler::{PacketEvent, PacketHandler, SESSION_HANDLER_ID};
use crate::net::request::RequestState;
use crate::net::transport::{SendTarget, CHANNEL_CONTROL};
use crate::net::wire::{MsgKind, WireMessage};
use crate::session::latch::{EntityId, Latch, LatchBuffer, LatchFrame};
use crate::session::module_catalog::ModuleSummary;
use crate::session::session_messages::SessionMsg;


#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LogonOutcome {
    Accepted(u8),
    Rejected,
    TimedOut,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ModuleOutcome {
    Info(ModuleSummary),
    Bad,
    TimedOut,
}

struct ParticipantState {
    queue_pos: Option<u8>,
    rejected: bool,
    kicked: bool,
    started: bool,
    /// cleared when the authority answers a module request with ModuleBad; a participant
    ///  in that state must not report itself loaded
    module_ok: bool,
}

/// The participant side of a session: submits local input, receives authoritative state
///  and offers the blocking logon/module calls built on the synchronous request bridge.
///  Registered on the participant host under [SESSION_HANDLER_ID].
pub struct ParticipantSession {
    config: Arc<NetConfig>,
    latches: Mutex<LatchBuffer>,
    state: Mutex<ParticipantState>,
}

impl ParticipantSession {
    pub fn new(config: Arc<NetConfig>) -> Arc<ParticipantSession> {
        Arc::new(ParticipantSession {
            config: config.clone(),
            latches: Mutex::new(LatchBuffer::new(&config)),
            state: Mutex::new(ParticipantState {
                queue_pos: None,
                rejected: false,
                kicked: false,
                started: false,
                module_ok: true,
            }),
        })
    }

    /// Blocks (by polling) until the authority accepts or rejects the logon, or the
    ///  timeout elapses. The host's dispatcher must be stepped concurrently.
    pub async fn logon(&self, host: &Host, authority: SocketAddr, timeout: Duration) -> anyhow::Result<LogonOutcome> {
        let requests = host.requests();
        let accept = requests.prepare(MsgKind::Accept, Some(authority), timeout, 16).await?;
        let reject = match requests.prepare(MsgKind::Reject, Some(authority), timeout, 0).await {
            Ok(request) => request,
            Err(e) => {
                requests.release(accept).await;
                return Err(e);
            }
        };

        let msg = SessionMsg::Logon { display_name: self.config.display_name.clone() };
        let sent = host.send_msg(SendTarget::Peer(authority), SESSION_HANDLER_ID, &msg, CHANNEL_CONTROL, true).await;

        let outcome = match sent {
            Err(e) => Err(e),
            Ok(()) => loop {
                match requests.poll(&accept).await {
                    RequestState::Satisfied(buf) => {
                        break match SessionMsg::try_deser(MsgKind::Accept, &buf) {
                            Ok(SessionMsg::Accept { queue_pos }) => Ok(LogonOutcome::Accepted(queue_pos)),
                            _ => Err(anyhow::anyhow!("malformed logon acceptance")),
                        };
                    }
                    RequestState::Expired => {
                        break match requests.poll(&reject).await {
                            RequestState::Satisfied(_) => Ok(LogonOutcome::Rejected),
                            _ => Ok(LogonOutcome::TimedOut),
                        };
                    }
                    RequestState::Waiting => {}
                }
                if let RequestState::Satisfied(_) = requests.poll(&reject).await {
                    break Ok(LogonOutcome::Rejected);
                }
                sleep(self.config.request_poll_interval).await;
            },
        };

        requests.release(accept).await;
        requests.release(reject).await;

        let outcome = outcome?;
        match &outcome {
            LogonOutcome::Accepted(queue_pos) => {
                info!("logged on to {:?} at queue position {}", authority, queue_pos);
                self.state.lock().await.queue_pos = Some(*queue_pos);
            }
            LogonOutcome::Rejected => {
                info!("logon to {:?} was rejected", authority);
                self.state.lock().await.rejected = true;
            }
            LogonOutcome::TimedOut => {
                warn!("logon to {:?} timed out", authority);
            }
        }
        Ok(outcome)
    }

    /// Asks the authority for the named module, blocking like [ParticipantSession::logon].
    pub async fn request_module(&self, host: &Host, authority: SocketAddr, name: &str, timeout: Duration) -> anyhow::Result<ModuleOutcome> {
        let requests = host.requests();
        let info = requests.prepare(MsgKind::ModuleInfo, Some(authority), timeout, 512).await?;
        let bad = match requests.prepare(MsgKind::ModuleBad, Some(authority), timeout, 0).await {
            Ok(request) => request,
            Err(e) => {
                requests.release(info).await;
                return Err(e);
            }
        };

        let msg = SessionMsg::RequestModule { name: name.to_string() };
        let sent = host.send_msg(SendTarget::Peer(authority), SESSION_HANDLER_ID, &msg, CHANNEL_CONTROL, true).await;

        let outcome = match sent {
            Err(e) => Err(e),
            Ok(()) => loop {
                match requests.poll(&info).await {
                    RequestState::Satisfied(buf) => {
                        break match SessionMsg::try_deser(MsgKind::ModuleInfo, &buf) {
                            Ok(SessionMsg::ModuleInfo { summary }) => Ok(ModuleOutcome::Info(summary)),
                            _ => Err(anyhow::anyhow!("malformed module info")),
                        };
                    }
                    RequestState::Expired => {
                        break match requests.poll(&bad).await {
                            RequestState::Satisfied(_) => Ok(ModuleOutcome::Bad),
                            _ => Ok(ModuleOutcome::TimedOut),
                        };
                    }
                    RequestState::Waiting => {}
                }
                if let RequestState::Satisfied(_) = requests.poll(&bad).await {
                    break Ok(ModuleOutcome::Bad);
                }
                sleep(self.config.request_poll_interval).await;
            },
        };

        requests.release(info).await;
        requests.release(bad).await;

        let outcome = outcome?;
        match &outcome {
            ModuleOutcome::Info(summary) => {
                debug!("module {:?} is available: {} files, {} bytes", summary.name, summary.file_count, summary.byte_size);
                self.state.lock().await.module_ok = true;
            }
            ModuleOutcome::Bad => {
                warn!("module {:?} was refused by the authority", name);
                self.state.lock().await.module_ok = false;
            }
            ModuleOutcome::TimedOut => {}
        }
        Ok(outcome)
    }

    /// Reports this participant as loaded. Refused after the authority answered a module
    ///  request with ModuleBad.
    pub async fn report_loaded(&self, host: &Host, authority: SocketAddr) -> anyhow::Result<()> {
        if !self.state.lock().await.module_ok {
            bail!("the authority refused the requested module; not reporting loaded");
        }
        host.send_msg(SendTarget::Peer(authority), SESSION_HANDLER_ID, &SessionMsg::ImLoaded, CHANNEL_CONTROL, true).await
    }

    /// Graceful leave; to be called before closing the host.
    pub async fn logoff(&self, host: &Host, authority: SocketAddr) -> anyhow::Result<()> {
        let slot = self.state.lock().await.queue_pos.unwrap_or(0) as u16;
        let msg = SessionMsg::Logoff {
            display_name: self.config.display_name.clone(),
            slot,
        };
        host.send_msg(SendTarget::Peer(authority), SESSION_HANDLER_ID, &msg, CHANNEL_CONTROL, true).await
    }

    /// Records local input for prediction and submits it to the authority (unreliable:
    ///  a lost latch is overtaken by the next one within the lag window).
    pub async fn submit_local(&self, host: &Host, authority: SocketAddr, entity: EntityId, tick: u32, latch: Latch) -> anyhow::Result<()> {
        self.latches.lock().await.record_local(entity, tick, latch);
        let msg = SessionMsg::SendLatch {
            frame: LatchFrame {
                tick,
                entries: vec![(entity, latch)],
            },
        };
        host.send_msg(SendTarget::Peer(authority), SESSION_HANDLER_ID, &msg, CHANNEL_CONTROL, false).await
    }

    /// Drains this tick's latches into the local prediction input.
    pub async fn unbuffer(&self, tick: u32) -> Vec<(EntityId, Latch)> {
        self.latches.lock().await.unbuffer(tick)
    }

    pub async fn current(&self, entity: EntityId) -> Latch {
        self.latches.lock().await.current(entity)
    }

    pub async fn queue_pos(&self) -> Option<u8> {
        self.state.lock().await.queue_pos
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.started
    }

    pub async fn was_rejected(&self) -> bool {
        self.state.lock().await.rejected
    }

    pub async fn was_kicked(&self) -> bool {
        self.state.lock().await.kicked
    }
}

#[async_trait::async_trait]
impl PacketHandler for ParticipantSession {
    async fn handle(&self, _host: &Host, event: PacketEvent<'_>) -> bool {
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
                    SessionMsg::Accept { queue_pos } => {
                        self.state.lock().await.queue_pos = Some(queue_pos);
                    }
                    SessionMsg::Reject => {
                        self.state.lock().await.rejected = true;
                    }
                    SessionMsg::Start => {
                        info!("the authority started the session");
                        self.state.lock().await.started = true;
                    }
                    SessionMsg::Kick => {
                        warn!("kicked by the authority");
                        self.state.lock().await.kicked = true;
                    }
                    SessionMsg::ModuleBad => {
                        self.state.lock().await.module_ok = false;
                    }
                    SessionMsg::RecvLatch { frame } => {
                        let mut latches = self.latches.lock().await;
                        for (entity, latch) in frame.entries {
                            latches.fold_incoming(entity, frame.tick, latch);
                        }
                    }
                    other => {
                        debug!("unexpected {:?} on the participant side - ignoring", other.kind());
                        return false;
                    }
                }
                true
            }
            PacketEvent::PeerConnected { .. } => true,
            PacketEvent::PeerDisconnected { peer } => {
                debug!("peer {:?} disconnected", peer);
                true
            }
        }
    }
}
