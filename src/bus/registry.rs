//! Slot arena holding the attached buses.

use std::sync::{Arc, RwLock};

use crate::types::BusId;

use super::Bus;

struct Slot {
    generation: u64,
    bus: Option<Arc<Bus>>,
}

/// Generation-checked arena of attached buses.
///
/// Slot indices are reused after detach, but each reuse bumps the slot's
/// generation, so a stale [`BusId`] held across the reuse fails to resolve
/// instead of aliasing the new occupant.
pub struct BusRegistry {
    slots: RwLock<Vec<Slot>>,
}

impl std::fmt::Debug for BusRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusRegistry").field("len", &self.len()).finish()
    }
}

impl Default for BusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BusRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Slot>> {
        self.slots.read().expect("bus registry poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Slot>> {
        self.slots.write().expect("bus registry poisoned")
    }

    /// Claim a slot and construct the bus for it.
    ///
    /// The constructor receives the [`BusId`] the new bus will answer to.
    pub fn insert_with(&self, make: impl FnOnce(BusId) -> Arc<Bus>) -> Arc<Bus> {
        let mut slots = self.write();
        let index = slots.iter().position(|s| s.bus.is_none());
        let index = match index {
            Some(i) => i,
            None => {
                slots.push(Slot {
                    generation: 0,
                    bus: None,
                });
                slots.len() - 1
            }
        };
        slots[index].generation += 1;
        let id = BusId::new(index, slots[index].generation);
        let bus = make(id);
        slots[index].bus = Some(Arc::clone(&bus));
        bus
    }

    /// Resolve a bus id, failing on stale generations.
    #[must_use]
    pub fn get(&self, id: BusId) -> Option<Arc<Bus>> {
        let slots = self.read();
        let slot = slots.get(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.bus.clone()
    }

    /// Remove a bus, returning the last registry-owned reference.
    #[must_use]
    pub fn remove(&self, id: BusId) -> Option<Arc<Bus>> {
        let mut slots = self.write();
        let slot = slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.bus.take()
    }

    /// Snapshot of all attached buses, in slot order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Bus>> {
        self.read().iter().filter_map(|s| s.bus.clone()).collect()
    }

    /// Number of attached buses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().iter().filter(|s| s.bus.is_some()).count()
    }

    /// Whether no buses are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
