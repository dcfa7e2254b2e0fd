//! Stack slots used to hold spilled virtual registers.
//!
//! Every spill creates a new [`SpillSlot`] from a counter shared by all banks
//! of the method. The stack offset of a slot is assigned lazily, the first
//! time a spill store or reload for it is emitted, by growing the spill area
//! of the frame downwards from the frame register. Offsets are negative and
//! aligned to the slot size of the bank.
//!
//! Slots are never reused within a method. A value spilled several times gets
//! a new slot each time.

use alloc::vec::Vec;
use core::fmt;

use cranelift_entity::{entity_impl, EntityRef};

use crate::reginfo::{RegBank, SpillSlotSize};
use crate::RegAllocError;

/// A spill slot allocated for a virtual register.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpillSlot(u32);
entity_impl!(SpillSlot, "ss");

/// Spill slot table of a method.
///
/// The table is created once per method and shared by all of its blocks.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpillSlots {
    /// Number of slots created so far.
    count: u32,

    /// Stack offset of each slot, per bank, indexed by slot.
    offsets: [Vec<Option<i32>>; RegBank::COUNT],

    /// Number of bytes below the frame register used by the frame, including
    /// spill slots.
    area_size: u32,

    /// Size of the frame before any spill slots were assigned.
    initial_size: u32,
}

impl SpillSlots {
    /// Creates an empty table for a method whose frame already uses
    /// `frame_size` bytes below the frame register.
    #[must_use]
    pub fn new(frame_size: u32) -> Self {
        Self {
            count: 0,
            offsets: Default::default(),
            area_size: frame_size,
            initial_size: frame_size,
        }
    }

    /// Creates a new spill slot.
    pub fn new_slot(&mut self) -> Result<SpillSlot, RegAllocError> {
        if self.count == u32::MAX {
            return Err(RegAllocError::FunctionTooBig);
        }
        let slot = SpillSlot::from_u32(self.count);
        self.count += 1;
        Ok(slot)
    }

    /// Returns the stack offset of `slot` holding a value of `bank`,
    /// assigning one if the slot doesn't have an offset yet.
    pub fn offset(
        &mut self,
        slot: SpillSlot,
        bank: RegBank,
        size: SpillSlotSize,
    ) -> Result<i32, RegAllocError> {
        let table = &mut self.offsets[bank.index()];
        if let Some(&Some(offset)) = table.get(slot.index()) {
            return Ok(offset);
        }

        let bytes = size.bytes();
        let end = self
            .area_size
            .checked_add(bytes)
            .and_then(|end| end.checked_next_multiple_of(bytes))
            .ok_or(RegAllocError::FunctionTooBig)?;
        let offset = i32::try_from(end)
            .map(|end| -end)
            .map_err(|_| RegAllocError::FunctionTooBig)?;
        self.area_size = end;

        if table.len() <= slot.index() {
            table.resize(slot.index() + 1, None);
        }
        table[slot.index()] = Some(offset);
        trace!("Assigned offset {offset} to {slot} ({bank})");
        Ok(offset)
    }

    /// Returns the stack offset of `slot` in `bank`, if one has been assigned.
    #[must_use]
    pub fn get_offset(&self, slot: SpillSlot, bank: RegBank) -> Option<i32> {
        self.offsets[bank.index()]
            .get(slot.index())
            .copied()
            .flatten()
    }

    /// Number of spill slots created.
    #[inline]
    #[must_use]
    pub fn num_slots(&self) -> usize {
        self.count as usize
    }

    /// Total number of bytes below the frame register used by the frame,
    /// including all assigned spill slots.
    #[inline]
    #[must_use]
    pub fn area_size(&self) -> u32 {
        self.area_size
    }

    /// Number of bytes added to the frame for spill slots.
    #[inline]
    #[must_use]
    pub fn spill_area_size(&self) -> u32 {
        self.area_size - self.initial_size
    }

    /// Iterates over all slots which have been assigned a stack offset.
    ///
    /// This can be used to build GC maps from the slots of the reference bank.
    pub fn assigned(&self) -> impl Iterator<Item = (SpillSlot, RegBank, i32)> + '_ {
        RegBank::ALL.into_iter().flat_map(move |bank| {
            self.offsets[bank.index()]
                .iter()
                .enumerate()
                .filter_map(move |(index, offset)| {
                    offset.map(|offset| (SpillSlot::new(index), bank, offset))
                })
        })
    }
}

impl fmt::Display for SpillSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (slot, bank, offset) in self.assigned() {
            writeln!(f, "{slot} = {bank} [fp {offset}]")?;
        }
        writeln!(f, "spill area: {} bytes", self.spill_area_size())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    #[test]
    fn offsets_grow_downwards() {
        let mut slots = SpillSlots::new(0);
        let word = SpillSlotSize::new(4);
        let a = slots.new_slot().unwrap();
        let b = slots.new_slot().unwrap();
        assert_eq!(slots.offset(a, RegBank::Int, word).unwrap(), -4);
        assert_eq!(slots.offset(b, RegBank::Int, word).unwrap(), -8);
        // Assigned once, then stable.
        assert_eq!(slots.offset(a, RegBank::Int, word).unwrap(), -4);
        assert_eq!(slots.get_offset(b, RegBank::Int), Some(-8));
        assert_eq!(slots.get_offset(b, RegBank::Float), None);
        assert_eq!(slots.spill_area_size(), 8);
    }

    #[test]
    fn offsets_are_aligned() {
        let mut slots = SpillSlots::new(4);
        let a = slots.new_slot().unwrap();
        let b = slots.new_slot().unwrap();
        assert_eq!(slots.offset(a, RegBank::Float, SpillSlotSize::new(8)).unwrap(), -16);
        assert_eq!(slots.offset(b, RegBank::Simd, SpillSlotSize::new(16)).unwrap(), -32);
        assert_eq!(slots.area_size(), 32);
        assert_eq!(slots.spill_area_size(), 28);

        let assigned: Vec<_> = slots.assigned().collect();
        assert_eq!(assigned, [(a, RegBank::Float, -16), (b, RegBank::Simd, -32)]);
    }

    #[test]
    fn slots_are_never_reused() {
        let mut slots = SpillSlots::new(0);
        let a = slots.new_slot().unwrap();
        let b = slots.new_slot().unwrap();
        assert_ne!(a, b);
        assert_eq!(slots.num_slots(), 2);
        assert_eq!(slots.get_offset(a, RegBank::Int), None);
    }

    #[test]
    fn frame_overflow() {
        let mut slots = SpillSlots::new(i32::MAX as u32 - 2);
        let a = slots.new_slot().unwrap();
        assert!(matches!(
            slots.offset(a, RegBank::Int, SpillSlotSize::new(4)),
            Err(RegAllocError::FunctionTooBig)
        ));
    }
}
