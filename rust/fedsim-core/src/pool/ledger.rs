// rust/fedsim-core/src/pool/ledger.rs

//! Capacity bookkeeping for the worker pool's slots.

use std::fmt;

use serde::Serialize;

use crate::resources::ResourceVector;

/// Index of a physical execution slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSnapshot {
    pub slot: SlotId,
    pub capacity: ResourceVector,
    pub available: ResourceVector,
}

#[derive(Debug)]
struct Slot {
    capacity: ResourceVector,
    available: ResourceVector,
}

/// Per-slot capacity and remaining capacity.
///
/// Not synchronized itself; the pool keeps it inside its single critical
/// section together with the pending queue and running table.
#[derive(Debug)]
pub(crate) struct CapacityLedger {
    slots: Vec<Slot>,
}

impl CapacityLedger {
    pub(crate) fn new(capacities: &[ResourceVector]) -> Self {
        Self {
            slots: capacities
                .iter()
                .map(|c| Slot {
                    capacity: c.clone(),
                    available: c.clone(),
                })
                .collect(),
        }
    }

    /// True if some slot could hold `requirement` when idle.
    pub(crate) fn can_ever_fit(&self, requirement: &ResourceVector) -> bool {
        self.slots
            .iter()
            .any(|slot| requirement.fits_within(&slot.capacity))
    }

    /// Reserves `requirement` on the first slot with enough spare capacity
    /// in every dimension.
    pub(crate) fn try_reserve(&mut self, requirement: &ResourceVector) -> Option<SlotId> {
        let index = self
            .slots
            .iter()
            .position(|slot| requirement.fits_within(&slot.available))?;
        self.slots[index].available.take(requirement);
        Some(SlotId(index))
    }

    /// Returns `requirement` to `slot`. Never raises a slot above its
    /// capacity.
    pub(crate) fn release(&mut self, slot: SlotId, requirement: &ResourceVector) {
        if let Some(s) = self.slots.get_mut(slot.0) {
            s.available.give_back(requirement, &s.capacity);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| SlotSnapshot {
                slot: SlotId(i),
                capacity: s.capacity.clone(),
                available: s.available.clone(),
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
