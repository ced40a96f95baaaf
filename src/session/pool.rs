//! Fixed-slot connection pool.
//!
//! Slots are addressed by index plus a generation counter, so a reference
//!  held across a slot's release and reuse is detectably stale instead of
//!  silently pointing at the wrong connection.

use crate::error::UplinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub index: usize,
    pub generation: u64,
}

struct Slot {
    generation: u64,
    occupied: bool,
}

pub struct ConnectionPool {
    slots: Vec<Slot>,
}

impl ConnectionPool {
    pub fn new(slot_count: usize) -> ConnectionPool {
        ConnectionPool {
            slots: (0..slot_count).map(|_| Slot { generation: 0, occupied: false }).collect(),
        }
    }

    /// Claim a free slot. Fails with [`UplinkError::NoFreeSlot`] when every
    ///  slot is occupied, leaving all existing state untouched.
    pub fn acquire(&mut self) -> Result<SlotRef, UplinkError> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.occupied {
                slot.occupied = true;
                slot.generation += 1;
                return Ok(SlotRef { index, generation: slot.generation });
            }
        }
        Err(UplinkError::NoFreeSlot)
    }

    /// Release a slot. A stale reference (the slot was already released, or
    ///  released and re-acquired) is ignored and reported as `false`.
    pub fn release(&mut self, slot_ref: SlotRef) -> bool {
        match self.slots.get_mut(slot_ref.index) {
            Some(slot) if slot.occupied && slot.generation == slot_ref.generation => {
                slot.occupied = false;
                true
            }
            _ => false,
        }
    }

    /// Whether the reference still points at a live occupancy.
    pub fn is_current(&self, slot_ref: SlotRef) -> bool {
        self.slots
            .get(slot_ref.index)
            .map(|slot| slot.occupied && slot.generation == slot_ref.generation)
            .unwrap_or(false)
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.occupied).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let mut pool = ConnectionPool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.index, b.index);
        assert!(matches!(pool.acquire(), Err(UplinkError::NoFreeSlot)));
        assert_eq!(pool.occupied_count(), 2);
    }

    #[test]
    fn test_release_frees_the_slot() {
        let mut pool = ConnectionPool::new(1);
        let a = pool.acquire().unwrap();
        assert!(pool.release(a));
        let b = pool.acquire().unwrap();
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
    }

    #[test]
    fn test_stale_reference_is_detected() {
        let mut pool = ConnectionPool::new(1);
        let a = pool.acquire().unwrap();
        assert!(pool.is_current(a));
        pool.release(a);
        assert!(!pool.is_current(a));

        let b = pool.acquire().unwrap();
        // the old reference does not alias the new occupancy
        assert!(!pool.is_current(a));
        assert!(!pool.release(a));
        assert!(pool.is_current(b));
    }

    #[test]
    fn test_double_release_is_harmless() {
        let mut pool = ConnectionPool::new(1);
        let a = pool.acquire().unwrap();
        assert!(pool.release(a));
        assert!(!pool.release(a));
        assert_eq!(pool.occupied_count(), 0);
    }
}
