use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::net::packet_handler::{HandlerId, PacketHandler};
use crate::util::random::{Random, RngRandom};


struct Registration {
    handler: Arc<dyn PacketHandler>,
    refs: u32,
}

/// Table of registered clients, keyed by the service id embedded in every application
///  packet. Registering the same handler instance twice bumps a reference count instead
///  of duplicating the entry; ids minted for anonymous registrations are non-zero and
///  unique for the table's lifetime.
pub struct HandlerRegistry {
    entries: FxHashMap<HandlerId, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry {
            entries: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn PacketHandler>, explicit_id: Option<HandlerId>) -> anyhow::Result<HandlerId> {
        self.register_with::<RngRandom>(handler, explicit_id)
    }

    pub fn register_with<R: Random>(&mut self, handler: Arc<dyn PacketHandler>, explicit_id: Option<HandlerId>) -> anyhow::Result<HandlerId> {
        if let Some((id, registration)) = self.entries.iter_mut()
            .find(|(_, r)| Arc::ptr_eq(&r.handler, &handler))
        {
            registration.refs += 1;
            return Ok(*id);
        }

        let id = match explicit_id {
            Some(id) => {
                if id.0 == 0 {
                    bail!("the zero service id is reserved");
                }
                if self.entries.contains_key(&id) {
                    bail!("registering a second handler for service id {:?}", id);
                }
                id
            }
            None => self.mint_id::<R>()?,
        };

        self.entries.insert(id, Registration {
            handler,
            refs: 1,
        });
        Ok(id)
    }

    fn mint_id<R: Random>(&self) -> anyhow::Result<HandlerId> {
        // the id space is vastly bigger than the table, so a handful of draws always suffices
        for _ in 0..64 {
            let id = HandlerId(R::next_u32());
            if id.0 != 0 && !self.entries.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(anyhow!("could not mint a fresh service id"))
    }

    /// Best-effort removal: unregistering an id that is not present is not an error.
    pub fn unregister(&mut self, id: HandlerId) {
        match self.entries.get_mut(&id) {
            Some(registration) if registration.refs > 1 => {
                registration.refs -= 1;
            }
            Some(_) => {
                self.entries.remove(&id);
            }
            None => {
                debug!("unregistering service {:?} that was not previously registered - ignoring", id);
            }
        }
    }

    pub fn find(&self, id: HandlerId) -> Option<Arc<dyn PacketHandler>> {
        self.entries.get(&id)
            .map(|r| r.handler.clone())
    }

    pub fn handlers(&self) -> Vec<Arc<dyn PacketHandler>> {
        self.entries.values()
            .map(|r| r.handler.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}


/// One remote peer that connected to this host. The slot index is stable for the
///  connection's lifetime and reused after disconnect.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionSlot {
    pub addr: SocketAddr,
    pub hostname: String,
    pub display_name: String,
    /// the service the peer named in its connect greeting
    pub service: HandlerId,
}

/// Fixed-capacity table of inbound connections.
pub struct InboundTable {
    slots: Vec<Option<ConnectionSlot>>,
}

impl InboundTable {
    pub fn new(capacity: usize) -> InboundTable {
        InboundTable {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Admits a peer into the lowest free slot, returning its stable index, or [None]
    ///  once the table is full.
    pub fn admit(&mut self, slot: ConnectionSlot) -> Option<usize> {
        let index = self.slots.iter().position(|s| s.is_none())?;
        self.slots[index] = Some(slot);
        Some(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<ConnectionSlot> {
        self.slots.get_mut(index)?.take()
    }

    pub fn remove_addr(&mut self, addr: SocketAddr) -> Option<(usize, ConnectionSlot)> {
        let index = self.index_of(addr)?;
        self.slots[index].take().map(|slot| (index, slot))
    }

    pub fn get(&self, index: usize) -> Option<&ConnectionSlot> {
        self.slots.get(index)?.as_ref()
    }

    pub fn index_of(&self, addr: SocketAddr) -> Option<usize> {
        self.slots.iter()
            .position(|s| s.as_ref().map(|c| c.addr) == Some(addr))
    }

    pub fn occupied(&self) -> impl Iterator<Item = (usize, &ConnectionSlot)> {
        self.slots.iter()
            .enumerate()
            .filter_map(|(index, s)| s.as_ref().map(|c| (index, c)))
    }

    pub fn num_occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}


struct PeerEntry {
    addr: SocketAddr,
    refs: u32,
}

/// Outbound peers, deduplicated by address and reference counted: several logical
///  services sharing a host reuse one transport connection per remote address. Dead
///  entries are compacted out on every removal.
pub struct PeerTable {
    entries: Vec<PeerEntry>,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        PeerTable {
            entries: Vec::new(),
        }
    }

    /// Returns the peer handle plus whether a new transport connection is needed.
    pub fn acquire(&mut self, addr: SocketAddr) -> (SocketAddr, bool) {
        match self.entries.iter_mut().find(|e| e.addr == addr) {
            Some(entry) => {
                entry.refs += 1;
                (entry.addr, false)
            }
            None => {
                self.entries.push(PeerEntry { addr, refs: 1 });
                (addr, true)
            }
        }
    }

    /// Returns true when the entry reached a reference count of zero and the underlying
    ///  transport connection should be torn down.
    pub fn release(&mut self, addr: SocketAddr) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.addr == addr) else {
            debug!("releasing unknown peer {:?} - ignoring", addr);
            return false;
        };

        entry.refs -= 1;
        if entry.refs > 0 {
            return false;
        }
        self.entries.retain(|e| e.refs > 0);
        true
    }

    pub fn refs(&self, addr: SocketAddr) -> Option<u32> {
        self.entries.iter()
            .find(|e| e.addr == addr)
            .map(|e| e.refs)
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.entries.iter().map(|e| e.addr).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}


#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use rstest::rstest;

    use crate::net::host::Host;
    use crate::net::packet_handler::{PacketEvent, SESSION_HANDLER_ID};
    use crate::test_util::transport::test_addr;
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};

    use super::*;

    struct NullHandler {
        handled: Mutex<usize>,
    }
    impl NullHandler {
        fn new() -> Arc<NullHandler> {
            Arc::new(NullHandler { handled: Mutex::new(0) })
        }
    }
    #[async_trait::async_trait]
    impl PacketHandler for NullHandler {
        async fn handle(&self, _host: &Host, _event: PacketEvent<'_>) -> bool {
            *self.handled.lock().unwrap() += 1;
            true
        }
    }

    #[rstest]
    fn test_register_unregister_find() {
        let mut registry = HandlerRegistry::new();
        let a = NullHandler::new();
        let b = NullHandler::new();

        let id_a = registry.register(a.clone(), Some(SESSION_HANDLER_ID)).unwrap();
        let id_b = registry.register(b.clone(), None).unwrap();
        assert_ne!(id_a, id_b);
        assert_ne!(id_b.0, 0);
        assert_eq!(registry.len(), 2);

        assert!(registry.find(id_a).is_some());
        registry.unregister(id_a);
        assert!(registry.find(id_a).is_none());
        assert!(registry.find(id_b).is_some());

        // absence is tolerated
        registry.unregister(id_a);
        assert_eq!(registry.len(), 1);
    }

    #[rstest]
    fn test_register_same_handler_bumps_refcount() {
        let mut registry = HandlerRegistry::new();
        let handler = NullHandler::new();

        let first = registry.register(handler.clone(), None).unwrap();
        let second = registry.register(handler.clone(), None).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);

        registry.unregister(first);
        assert!(registry.find(first).is_some());
        registry.unregister(first);
        assert!(registry.find(first).is_none());
    }

    #[rstest]
    fn test_register_duplicate_explicit_id_fails() {
        let mut registry = HandlerRegistry::new();
        registry.register(NullHandler::new(), Some(SESSION_HANDLER_ID)).unwrap();
        assert!(registry.register(NullHandler::new(), Some(SESSION_HANDLER_ID)).is_err());
        assert!(registry.register(NullHandler::new(), Some(HandlerId(0))).is_err());
    }

    #[rstest]
    fn test_minting_skips_zero_and_collisions() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap();
        let ctx = MockRandom::next_u32_context();
        let mut draws = vec![0u32, 17, 17, 42].into_iter();
        ctx.expect().returning(move || draws.next().unwrap());

        let mut registry = HandlerRegistry::new();
        let first = registry.register_with::<MockRandom>(NullHandler::new(), None).unwrap();
        assert_eq!(first, HandlerId(17));

        // the second draw of 17 collides with the existing entry and is skipped
        let second = registry.register_with::<MockRandom>(NullHandler::new(), None).unwrap();
        assert_eq!(second, HandlerId(42));
    }

    #[rstest]
    fn test_inbound_slot_reuse() {
        let mut table = InboundTable::new(3);
        let slot = |n: u16| ConnectionSlot {
            addr: test_addr(n),
            hostname: format!("host{}", n),
            display_name: format!("player{}", n),
            service: SESSION_HANDLER_ID,
        };

        assert_eq!(table.admit(slot(1)), Some(0));
        assert_eq!(table.admit(slot(2)), Some(1));
        assert_eq!(table.admit(slot(3)), Some(2));
        assert_eq!(table.admit(slot(4)), None);

        assert!(table.remove(1).is_some());
        // the freed index is reused rather than growing monotonically
        assert_eq!(table.admit(slot(5)), Some(1));
        assert_eq!(table.get(1).unwrap().addr, test_addr(5));
        assert_eq!(table.num_occupied(), 3);
    }

    #[rstest]
    fn test_inbound_remove_by_addr() {
        let mut table = InboundTable::new(2);
        table.admit(ConnectionSlot {
            addr: test_addr(9),
            hostname: "h".to_string(),
            display_name: "p".to_string(),
            service: SESSION_HANDLER_ID,
        });

        assert_eq!(table.index_of(test_addr(9)), Some(0));
        let (index, slot) = table.remove_addr(test_addr(9)).unwrap();
        assert_eq!(index, 0);
        assert_eq!(slot.addr, test_addr(9));
        assert!(table.remove_addr(test_addr(9)).is_none());
    }

    #[rstest]
    fn test_peer_table_dedup_and_release() {
        let mut table = PeerTable::new();

        let (first, new_first) = table.acquire(test_addr(7));
        let (second, new_second) = table.acquire(test_addr(7));
        assert_eq!(first, second);
        assert!(new_first);
        assert!(!new_second);
        assert_eq!(table.refs(test_addr(7)), Some(2));

        assert!(!table.release(test_addr(7)));
        assert_eq!(table.refs(test_addr(7)), Some(1));
        assert!(table.release(test_addr(7)));
        assert!(table.is_empty());
    }
}
