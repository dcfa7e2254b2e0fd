//! Register selection, spilling and insertion of allocator instructions.

use super::Context;
use crate::function::{InstData, InstFlags, VReg};
use crate::reginfo::{PhysReg, PhysRegSet, RegBank, RegInfo};
use crate::spill_slots::SpillSlot;
use crate::RegAllocError;

impl<R: RegInfo> Context<'_, R> {
    /// Picks a register of `file` from `candidates` without changing the
    /// state.
    ///
    /// Free registers in `preferred` are chosen first, then any free register.
    /// If none is free then the lowest-numbered occupied register is chosen,
    /// favoring registers which don't hold an operand of the instruction.
    pub(super) fn choose_reg(
        &self,
        file: RegBank,
        candidates: PhysRegSet,
        preferred: PhysRegSet,
    ) -> Option<PhysReg> {
        let free = candidates & self.state.free_regs(file);
        if let Some(reg) = (free & preferred).first_reg().or(free.first_reg()) {
            return Some(reg);
        }
        let occupied = candidates - free;
        occupied
            .iter()
            .find(|&reg| {
                self.state
                    .occupant(file, reg)
                    .is_some_and(|vreg| !self.operands.contains(&vreg))
            })
            .or(occupied.first_reg())
    }

    /// Picks a register of `file` from `allowed` for a use of the current
    /// instruction and evicts its occupant.
    ///
    /// Registers already committed to a use are never chosen.
    pub(super) fn alloc_reg(
        &mut self,
        file: RegBank,
        allowed: PhysRegSet,
        preferred: PhysRegSet,
    ) -> Result<PhysReg, RegAllocError> {
        let allowed = allowed & self.state.local_regs(file) - self.taken[file.index()];
        let Some(reg) = self.choose_reg(file, allowed, preferred) else {
            trace!("  No register available in {allowed} for {file}");
            return Err(RegAllocError::NoSpillCandidate { inst: self.inst });
        };
        self.evict(file, reg)?;
        Ok(reg)
    }

    /// Spills the occupant of `reg`, if any.
    pub(super) fn evict(&mut self, file: RegBank, reg: PhysReg) -> Result<(), RegAllocError> {
        match self.state.occupant(file, reg) {
            Some(vreg) => self.spill_vreg(vreg, reg).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Evicts `vreg` from `reg` into a new spill slot.
    ///
    /// The value is reloaded into `reg` after the current instruction, where
    /// later instructions expect it.
    pub(super) fn spill_vreg(
        &mut self,
        vreg: VReg,
        reg: PhysReg,
    ) -> Result<SpillSlot, RegAllocError> {
        let slot = self.spill_slots.new_slot()?;
        let reload = self.reload_inst(vreg, slot, reg)?;
        let anchor = self.reload_after.unwrap_or(self.after);
        self.reload_after = Some(self.block.insert_after(anchor, reload));
        self.state.set_spilled(vreg, slot);
        trace!("  Spilled {vreg} from {reg} to {slot}");
        stat!(self.stats, spilled_vregs);
        stat!(self.stats, reloads);
        Ok(slot)
    }

    /// Inserts a copy `dst <- src` before the current instruction.
    pub(super) fn insert_copy_before(&mut self, bank: RegBank, dst: PhysReg, src: PhysReg) {
        let copy = self.copy_inst(bank, dst, src);
        self.block.insert_before(self.inst, copy);
        trace!("  Copy {dst} <- {src} before");
        stat!(self.stats, copies);
    }

    /// Inserts a copy `dst <- src` after the current instruction, before any
    /// reloads.
    pub(super) fn insert_copy_after(&mut self, bank: RegBank, dst: PhysReg, src: PhysReg) {
        let copy = self.copy_inst(bank, dst, src);
        self.after = self.block.insert_after(self.after, copy);
        trace!("  Copy {dst} <- {src} after");
        stat!(self.stats, copies);
    }

    /// Inserts a store of `vreg` from `reg` into its slot before the current
    /// instruction.
    pub(super) fn insert_store_before(
        &mut self,
        vreg: VReg,
        slot: SpillSlot,
        reg: PhysReg,
    ) -> Result<(), RegAllocError> {
        let store = self.store_inst(vreg, slot, reg)?;
        self.block.insert_before(self.inst, store);
        trace!("  Store {vreg} in {reg} to {slot} before");
        stat!(self.stats, spill_stores);
        Ok(())
    }

    /// Inserts a store of `vreg` from `reg` into its slot after the current
    /// instruction, before any reloads.
    pub(super) fn insert_store_after(
        &mut self,
        vreg: VReg,
        slot: SpillSlot,
        reg: PhysReg,
    ) -> Result<(), RegAllocError> {
        let store = self.store_inst(vreg, slot, reg)?;
        self.after = self.block.insert_after(self.after, store);
        trace!("  Store {vreg} in {reg} to {slot} after");
        stat!(self.stats, spill_stores);
        Ok(())
    }

    fn copy_inst(&self, bank: RegBank, dst: PhysReg, src: PhysReg) -> InstData {
        InstData::new(self.reginfo.bank_ops(bank).move_)
            .dest(dst)
            .srcs([src])
            .flags(InstFlags::COPY)
    }

    /// Frame offset of `slot`, which holds values of `bank`.
    ///
    /// Stores and reloads of a virtual register both use the register's own
    /// bank, whatever the bank of the operand which reads it.
    fn slot_offset(&mut self, bank: RegBank, slot: SpillSlot) -> Result<i64, RegAllocError> {
        let size = self.reginfo.spillslot_size(bank);
        self.spill_slots.offset(slot, bank, size).map(i64::from)
    }

    fn store_inst(
        &mut self,
        vreg: VReg,
        slot: SpillSlot,
        reg: PhysReg,
    ) -> Result<InstData, RegAllocError> {
        let bank = self.vregs[vreg];
        let offset = self.slot_offset(bank, slot)?;
        Ok(InstData::new(self.reginfo.bank_ops(bank).store)
            .dest(self.reginfo.frame_reg())
            .srcs([reg])
            .imm(offset)
            .flags(InstFlags::SPILL))
    }

    fn reload_inst(
        &mut self,
        vreg: VReg,
        slot: SpillSlot,
        reg: PhysReg,
    ) -> Result<InstData, RegAllocError> {
        let bank = self.vregs[vreg];
        let offset = self.slot_offset(bank, slot)?;
        Ok(InstData::new(self.reginfo.bank_ops(bank).load)
            .dest(reg)
            .srcs([self.reginfo.frame_reg()])
            .imm(offset)
            .flags(InstFlags::RELOAD))
    }
}
