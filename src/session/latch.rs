use rustc_hash::FxHashMap;
use tracing::trace;

use crate::net::net_config::NetConfig;


pub type EntityId = u16;

pub const BUTTON_FIRE: u32 = 0x01;
pub const BUTTON_JUMP: u32 = 0x02;
pub const BUTTON_SPECIAL: u32 = 0x04;
pub const BUTTON_RESPAWN: u32 = 0x08;

/// Buttons that are consumed edge-triggered: they are masked out of the live input
///  immediately after being applied, so a single press never replays across ticks.
const ONE_SHOT_BUTTONS: u32 = BUTTON_RESPAWN;

/// One tick's worth of control input for one entity: a button bitmask plus two signed
///  8.8 fixed point movement axes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Latch {
    pub buttons: u32,
    pub axis_x: i16,
    pub axis_y: i16,
}

/// All control state the authority believes happened at one tick, batched into a single
///  network message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LatchFrame {
    pub tick: u32,
    pub entries: Vec<(EntityId, Latch)>,
}

#[derive(Copy, Clone, Default)]
struct LatchSlot {
    /// consumed by [LatchBuffer::unbuffer]
    valid: bool,
    /// consumed by [LatchBuffer::rebroadcast]
    unsent: bool,
    tick: u32,
    latch: Latch,
}

/// Fixed-size ring of per-entity control input snapshots indexed by
///  `tick % lag_window`, tolerating bounded network delay between input submission and
///  authoritative replay.
///
/// The only ordering guarantee is the stamp comparison on drain: a slot is consumed by
///  tick `t` only if its stamp is `<= t`. Input arriving for an already drained tick is
///  silently discarded by that guard - intended lag tolerance, not an error. There is
///  deliberately no generation counter beyond the stamp.
///
/// `unbuffer` and `rebroadcast` are independent consumers of the same writes (the
///  authority both applies a slot to its simulation and re-emits it to participants),
///  so each slot carries one flag per consumer.
pub struct LatchBuffer {
    lag_window: u32,
    max_lag: u32,
    rings: FxHashMap<EntityId, Vec<LatchSlot>>,
    /// the un-ringed live input actually applied to the simulation, per entity
    current: FxHashMap<EntityId, Latch>,
}

impl LatchBuffer {
    pub fn new(config: &NetConfig) -> LatchBuffer {
        LatchBuffer {
            lag_window: config.lag_window,
            max_lag: config.max_lag,
            rings: FxHashMap::default(),
            current: FxHashMap::default(),
        }
    }

    fn slot_index(&self, tick: u32) -> usize {
        (tick % self.lag_window) as usize
    }

    /// Input sampled on this machine.
    pub fn record_local(&mut self, entity: EntityId, tick: u32, latch: Latch) {
        self.record(entity, tick, latch);
    }

    /// Input arriving from a remote peer (a participant's latch packet, or a frame the
    ///  authority rebroadcast).
    pub fn fold_incoming(&mut self, entity: EntityId, tick: u32, latch: Latch) {
        self.record(entity, tick, latch);
    }

    fn record(&mut self, entity: EntityId, tick: u32, latch: Latch) {
        let lag_window = self.lag_window;
        let index = self.slot_index(tick);
        let ring = self.rings.entry(entity)
            .or_insert_with(|| vec![LatchSlot::default(); lag_window as usize]);

        ring[index] = LatchSlot {
            valid: true,
            unsent: true,
            tick,
            latch,
        };
        trace!("recorded latch for entity {} at tick {}", entity, tick);
    }

    /// Authority side: reconstructs what this host believes happened `offset` ticks ago
    ///  for every offset in the lag window, batching all entities per tick into one
    ///  frame. Emitted entries are marked sent and not emitted again.
    pub fn rebroadcast(&mut self, current_tick: u32) -> Vec<LatchFrame> {
        let mut frames = Vec::new();

        for offset in 0..self.max_lag {
            let tick = current_tick.wrapping_sub(offset);
            let index = self.slot_index(tick);

            let mut entries = Vec::new();
            for (&entity, ring) in self.rings.iter_mut() {
                let slot = &mut ring[index];
                if slot.unsent && slot.tick <= tick {
                    entries.push((entity, slot.latch));
                    slot.unsent = false;
                }
            }
            if !entries.is_empty() {
                entries.sort_by_key(|&(entity, _)| entity);
                frames.push(LatchFrame { tick, entries });
            }
        }
        frames
    }

    /// Drains the slot for `current_tick` into the live input for every entity with a
    ///  valid, non-future-stamped entry. Each entry is consumed at most once; one-shot
    ///  buttons are masked out of the live input immediately after consumption.
    pub fn unbuffer(&mut self, current_tick: u32) -> Vec<(EntityId, Latch)> {
        let index = self.slot_index(current_tick);

        let mut drained = Vec::new();
        for (&entity, ring) in self.rings.iter_mut() {
            let slot = &mut ring[index];
            if slot.valid && slot.tick <= current_tick {
                slot.valid = false;
                drained.push((entity, slot.latch));
            }
        }
        drained.sort_by_key(|&(entity, _)| entity);

        for &(entity, latch) in &drained {
            let mut applied = latch;
            applied.buttons &= !ONE_SHOT_BUTTONS;
            self.current.insert(entity, applied);
        }
        drained
    }

    /// The live input for an entity, as of the last drain that touched it.
    pub fn current(&self, entity: EntityId) -> Latch {
        self.current.get(&entity).copied().unwrap_or_default()
    }
}
