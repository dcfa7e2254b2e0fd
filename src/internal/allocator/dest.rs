//! Destination operands.

use super::Context;
use crate::function::{Reg, VReg};
use crate::internal::state::Assignment;
use crate::opcode::{ClobberSpec, OperandSpec, RegPairRule};
use crate::reginfo::{PhysReg, PhysRegSet, RegBank, RegInfo};
use crate::RegAllocError;

impl<R: RegInfo> Context<'_, R> {
    /// Assigns registers to the destination and releases its virtual
    /// registers.
    ///
    /// A base address destination is read by the instruction and is handled
    /// with the sources instead.
    pub(super) fn allocate_dest(&mut self) -> Result<(), RegAllocError> {
        let Some(spec) = self.desc.dest.filter(|_| self.desc.defines_dest()) else {
            return Ok(());
        };
        let value = self.orig.dest;
        if !value.is_some() {
            return Ok(());
        }
        let high_value = self.orig.dest_high;
        if spec.pair.is_some() && !high_value.is_some() {
            return Err(RegAllocError::MissingRegPairHalf { inst: self.inst });
        }
        let file = self.file(spec.bank);

        let low = self.choose_dest_low(file, spec)?;
        let high = match spec.pair {
            Some(rule) => Some(self.choose_dest_high(file, rule, low)?),
            None => None,
        };
        trace!("  Destination in {low}");

        // Whatever else later instructions expect in the written registers
        // is reloaded after the instruction.
        let (lo_vreg, hi_vreg) = (value.vreg(), high_value.vreg());
        for reg in [Some(low), high].into_iter().flatten() {
            if let Some(occupant) = self.state.occupant(file, reg) {
                if Some(occupant) != lo_vreg && Some(occupant) != hi_vreg {
                    self.spill_vreg(occupant, reg)?;
                }
            }
        }

        let low_in_high = self.expected_in(lo_vreg, high);
        if low_in_high && self.expected_in(hi_vreg, Some(low)) {
            // Swapped halves: the high half goes through its slot.
            if let Some(vreg) = hi_vreg {
                self.spill_vreg(vreg, low)?;
            }
        }

        // The copy reading the low half must not overwrite the high half.
        if let Some(high) = high {
            if low_in_high {
                self.def_fixup(high_value, spec, high)?;
                self.def_fixup(value, spec, low)?;
            } else {
                self.def_fixup(value, spec, low)?;
                self.def_fixup(high_value, spec, high)?;
            }
        } else {
            self.def_fixup(value, spec, low)?;
        }

        self.dest_reg = Some(low);
        self.dest_high_reg = high;
        self.block[self.inst].dest = Reg::Phys(low);
        if let Some(high) = high {
            self.block[self.inst].dest_high = Reg::Phys(high);
        }

        // Uses before this instruction refer to an older definition.
        for vreg in [lo_vreg, hi_vreg].into_iter().flatten() {
            let born_in = self.liveness.record(vreg).born_in;
            debug_assert!(born_in != 0 && born_in <= self.index);
            if let Some(reg) = self.state.release(vreg) {
                trace!("  Released {vreg} from {reg}");
            }
        }

        // The destination of a two-address instruction or a register pair is
        // written while sources may still be read, so other sources can't
        // live there.
        if spec.pair.is_some() || self.desc.clobber == ClobberSpec::Dest1 {
            let local = self.state.local_regs(file);
            for reg in [Some(low), high].into_iter().flatten() {
                if local.contains(reg) {
                    self.reserved[file.index()].insert(reg);
                }
            }
        }
        Ok(())
    }

    /// Chooses the register written for the destination or the low half of a
    /// destination pair.
    fn choose_dest_low(&self, file: RegBank, spec: OperandSpec) -> Result<PhysReg, RegAllocError> {
        if let Some(fixed) = spec.fixed {
            return Ok(fixed);
        }
        let clobber = self.clobber_reg[file.index()];
        if let Reg::Phys(reg) = self.orig.dest {
            if spec.pair.is_none()
                && spec.allowed(PhysRegSet::first(64)).contains(reg)
                && !clobber.contains(reg)
            {
                return Ok(reg);
            }
        }

        let local = self.state.local_regs(file);
        let mut candidates = spec.allowed(local) - clobber;
        let mut preferred = match self.orig.dest {
            Reg::Virt(vreg) => self.preferred(vreg),
            _ => PhysRegSet::new(),
        };
        if let Some(rule) = spec.pair {
            candidates = self.valid_lows(file, rule, candidates, PhysRegSet::new());
            preferred |= self.pair_friendly_lows(file, rule, candidates, self.orig.dest_high.vreg());
        }
        self.choose_def_reg(file, candidates, preferred, self.orig.dest)
            .ok_or_else(|| self.dest_error(spec.pair.is_some()))
    }

    /// Chooses the register written for the high half of a destination pair
    /// whose low half is in `low`.
    fn choose_dest_high(
        &self,
        file: RegBank,
        rule: RegPairRule,
        low: PhysReg,
    ) -> Result<PhysReg, RegAllocError> {
        let local = self.state.local_regs(file);
        let clobber = self.clobber_reg[file.index()];
        let high = match rule {
            RegPairRule::Fixed(_) | RegPairRule::Adjacent => rule.high_mask(low, local).first_reg(),
            RegPairRule::Any => {
                let candidates = rule.high_mask(low, local) - clobber;
                self.choose_def_reg(file, candidates, PhysRegSet::new(), self.orig.dest_high)
            }
        };
        high.filter(|&reg| !clobber.contains(reg))
            .ok_or(RegAllocError::UnsupportedRegPair { inst: self.inst })
    }

    /// Picks a destination register from `candidates`, avoiding registers
    /// that uses of the instruction are pinned to when possible.
    ///
    /// A register where later instructions expect `value` is chosen first.
    fn choose_def_reg(
        &self,
        file: RegBank,
        candidates: PhysRegSet,
        preferred: PhysRegSet,
        value: Reg,
    ) -> Option<PhysReg> {
        if let Some(Assignment::Reg(reg)) = value.vreg().map(|vreg| self.state.assignment(vreg)) {
            if candidates.contains(reg) {
                return Some(reg);
            }
        }
        let unpinned = candidates - self.fixed[file.index()];
        let candidates = if unpinned.is_empty() { candidates } else { unpinned };
        self.choose_reg(file, candidates, preferred)
    }

    /// Inserts whatever is needed after the instruction to move `value`,
    /// written to `reg`, to where later instructions expect it.
    fn def_fixup(&mut self, value: Reg, spec: OperandSpec, reg: PhysReg) -> Result<(), RegAllocError> {
        let target = match value {
            Reg::None => return Ok(()),
            Reg::Phys(target) => target,
            Reg::Virt(vreg) => match self.state.assignment(vreg) {
                Assignment::Unbound => {
                    trace!("  Dead definition of {vreg} in {reg}");
                    return Ok(());
                }
                Assignment::Reg(target) => target,
                Assignment::Spilled(slot) => return self.insert_store_after(vreg, slot, reg),
            },
        };
        if target != reg {
            self.insert_copy_after(spec.bank, target, reg);
            if spec.fixed.is_some() {
                stat!(self.stats, fixed_copies);
            } else {
                stat!(self.stats, constraint_copies);
            }
        }
        Ok(())
    }

    /// Whether later instructions expect `vreg` in `reg`.
    fn expected_in(&self, vreg: Option<VReg>, reg: Option<PhysReg>) -> bool {
        match (vreg, reg) {
            (Some(vreg), Some(reg)) => self.state.assignment(vreg) == Assignment::Reg(reg),
            _ => false,
        }
    }

    /// Low registers of `rule` among `candidates` which, together with their
    /// partner high register, can be written by the instruction and aren't
    /// committed to another use.
    ///
    /// Committed registers in `held` hold a half of the same pair and remain
    /// usable.
    pub(super) fn valid_lows(
        &self,
        file: RegBank,
        rule: RegPairRule,
        candidates: PhysRegSet,
        held: PhysRegSet,
    ) -> PhysRegSet {
        let local = self.state.local_regs(file);
        let blocked = self.clobber_reg[file.index()]
            | self.reserved[file.index()]
            | (self.taken[file.index()] - held);
        (candidates & rule.low_mask(local) - blocked)
            .iter()
            .filter(|&low| !(rule.high_mask(low, local) - blocked).is_empty())
            .collect()
    }

    /// Low registers among `lows` whose partner high register is free or
    /// already holds `high`.
    pub(super) fn pair_friendly_lows(
        &self,
        file: RegBank,
        rule: RegPairRule,
        lows: PhysRegSet,
        high: Option<VReg>,
    ) -> PhysRegSet {
        let local = self.state.local_regs(file);
        lows.iter()
            .filter(|&low| {
                rule.high_mask(low, local).iter().any(|reg| {
                    let occupant = self.state.occupant(file, reg);
                    occupant.is_none() || occupant == high
                })
            })
            .collect()
    }

    fn dest_error(&self, pair: bool) -> RegAllocError {
        if pair {
            RegAllocError::UnsupportedRegPair { inst: self.inst }
        } else {
            RegAllocError::NoSpillCandidate { inst: self.inst }
        }
    }
}
