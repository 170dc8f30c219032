use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::net::host::Host;
use crate::net::packet_handler::{HandlerId, PacketEvent, PacketHandler, SESSION_HANDLER_ID};
use crate::net::registry::ConnectionSlot;
use crate::net::transport::{SendTarget, TransportEvent, CHANNEL_CONTROL};
use crate::net::wire::{peek_kind, put_header, ConnectGreeting, MsgKind, HEADER_LEN};


impl Host {
    /// One polling step: drain all pending transport events, classify each received
    ///  packet as an outstanding synchronous request, a lifecycle event or a routed
    ///  application packet, give every service its periodic call, and flush the
    ///  outbound queue.
    ///
    /// Never blocks. A host that was not started or was asked to terminate is a no-op
    ///  step; a paused host skips event processing but still flushes.
    pub async fn step(&self) {
        let active = {
            let state = self.state.lock().await;
            if state.open_count == 0 || state.terminating {
                return;
            }
            state.active
        };

        if active {
            for event in self.transport.poll_events().await {
                match event {
                    TransportEvent::Receive { peer, buf } => self.on_receive(peer, buf).await,
                    TransportEvent::Connect { peer, payload } => self.on_connect(peer, payload).await,
                    TransportEvent::Disconnect { peer } => self.on_disconnect(peer).await,
                }
            }

            let handlers = self.registry.read().await.handlers();
            for handler in handlers {
                handler.on_step(self).await;
            }
        }

        // paused hosts still flush so queued sends do not linger
        self.transport.flush().await;
    }

    async fn on_receive(&self, from: SocketAddr, buf: Bytes) {
        let Some(raw_kind) = peek_kind(&buf) else {
            warn!("received runt packet from {:?} - dropping", from);
            return;
        };
        let kind = match MsgKind::try_from(raw_kind) {
            Ok(kind) => kind,
            Err(_) => {
                debug!("received unknown message kind 0x{:04x} from {:?} - dropping", raw_kind, from);
                return;
            }
        };
        if buf.len() < HEADER_LEN {
            warn!("received truncated {:?} packet from {:?} - dropping", kind, from);
            return;
        }
        let payload = &buf[HEADER_LEN..];

        // a blocked synchronous caller gets first pick
        if self.requests().try_satisfy(kind, from, payload).await {
            return;
        }

        let service = HandlerId(u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]));
        let handler = self.find_handler(service).await;
        match handler {
            Some(handler) => {
                trace!("routing {:?} from {:?} to service {:?}", kind, from, service);
                handler.handle(self, PacketEvent::Packet { from, kind, buf: payload }).await;
            }
            None => {
                debug!("received {:?} for service {:?} for which there is no handler - ignoring", kind, service);
            }
        }
    }

    async fn find_handler(&self, service: HandlerId) -> Option<Arc<dyn PacketHandler>> {
        if let Some(handler) = self.registry.read().await.find(service) {
            return Some(handler);
        }
        self.fallback.read().await.clone()
    }

    async fn on_connect(&self, peer: SocketAddr, payload: Bytes) {
        let greeting = match ConnectGreeting::try_deser(&mut &payload[..]) {
            Ok(greeting) => greeting,
            Err(e) => {
                warn!("connect from {:?} with malformed greeting - rejecting: {}", peer, e);
                self.transport.disconnect(peer).await;
                return;
            }
        };

        let slot = ConnectionSlot {
            addr: peer,
            hostname: greeting.hostname,
            display_name: greeting.display_name,
            service: greeting.service,
        };
        let admitted = self.inbound.write().await.admit(slot);

        match admitted {
            Some(index) => {
                info!("admitted {:?} into connection slot {}", peer, index);
                if let Some(handler) = self.find_handler(greeting.service).await {
                    handler.handle(self, PacketEvent::PeerConnected { peer, slot: index }).await;
                }
            }
            None => {
                warn!("too many connections - rejecting {:?}", peer);
                let mut buf = BytesMut::new();
                put_header(&mut buf, MsgKind::Reject, SESSION_HANDLER_ID);
                let _ = self.transport.send(SendTarget::Peer(peer), CHANNEL_CONTROL, buf.freeze(), true).await;
                self.transport.disconnect(peer).await;
            }
        }
    }

    async fn on_disconnect(&self, peer: SocketAddr) {
        let removed = self.inbound.write().await.remove_addr(peer);
        match removed {
            Some((index, slot)) => {
                info!("{:?} disconnected, freeing connection slot {}", peer, index);
                if let Some(handler) = self.find_handler(slot.service).await {
                    handler.handle(self, PacketEvent::PeerDisconnected { peer }).await;
                }
            }
            None => {
                debug!("disconnect event for unknown peer {:?} - ignoring", peer);
            }
        }
    }
}
