//! Operands read by the instruction: sources, base addresses and call
//! arguments.

use super::{Context, Target, Use, UseKind, UseSlot};
use crate::function::{Reg, VReg};
use crate::internal::state::Assignment;
use crate::opcode::{ClobberSpec, OperandSpec, RegPairRule};
use crate::reginfo::{PhysReg, PhysRegSet, RegBank, RegInfo};
use crate::spill_slots::SpillSlot;
use crate::RegAllocError;

impl<R: RegInfo> Context<'_, R> {
    /// Binds every operand read by the instruction.
    ///
    /// Uses pinned to a register go first, then register pairs and the first
    /// source of a two-address instruction. The remaining uses are bound from
    /// the most to the least constrained.
    pub(super) fn allocate_sources(&mut self) -> Result<(), RegAllocError> {
        self.collect_uses()?;

        for index in 0..self.uses.len() {
            if let UseKind::Fixed(reg) = self.uses[index].kind {
                self.place(index, Target::Reg(reg))?;
            }
        }
        if let Some(index) = self.uses.iter().position(|u| matches!(u.kind, UseKind::PairLow(_))) {
            if let UseKind::PairLow(rule) = self.uses[index].kind {
                self.bind_pair(index, rule)?;
            }
        }
        for index in 0..self.uses.len() {
            if let UseKind::Tied(reg) = self.uses[index].kind {
                self.bind_tied(index, reg)?;
            }
        }
        while let Some(index) = self.next_use() {
            self.bind_any(index)?;
        }
        Ok(())
    }

    /// Records the operands read by the instruction and how each of them is
    /// placed.
    fn collect_uses(&mut self) -> Result<(), RegAllocError> {
        let desc = self.desc;
        let orig = &self.orig;
        self.uses.clear();
        let mut push = |slot, value: Reg, spec, kind| {
            if value.is_some() {
                self.uses.push(Use {
                    slot,
                    value,
                    spec,
                    kind,
                    done: false,
                });
            }
        };

        if desc.dest_is_base {
            if let Some(spec) = desc.dest {
                push(UseSlot::Base, orig.dest, spec, kind_of(spec));
            }
        }
        let tied = desc.clobber == ClobberSpec::Dest1;
        for (index, spec) in desc.srcs.iter().enumerate() {
            let Some(spec) = *spec else {
                continue;
            };
            let kind = match self.dest_reg {
                Some(dest) if tied && index == 0 => UseKind::Tied(dest),
                _ => kind_of(spec),
            };
            push(UseSlot::Src(index), orig.srcs[index], spec, kind);

            if let (0, Some(rule)) = (index, spec.pair) {
                if orig.srcs[0].is_some() && !orig.src1_high.is_some() {
                    return Err(RegAllocError::MissingRegPairHalf { inst: self.inst });
                }
                let kind = match self.dest_high_reg {
                    Some(dest) if tied => UseKind::Tied(dest),
                    _ => UseKind::PairHigh(rule),
                };
                push(UseSlot::SrcHigh, orig.src1_high, spec, kind);
            }
        }
        for (index, arg) in orig.call_args.iter().enumerate() {
            let spec = OperandSpec::new(arg.bank).fixed(arg.reg);
            push(UseSlot::Arg(index), arg.value, spec, UseKind::Fixed(arg.reg));
        }
        Ok(())
    }

    /// Next unbound use without a dedicated register: the one allowing the
    /// fewest registers, with a base address last among equals.
    fn next_use(&self) -> Option<usize> {
        self.uses
            .iter()
            .enumerate()
            .filter(|(_, u)| !u.done && matches!(u.kind, UseKind::Any))
            .min_by_key(|(_, u)| {
                let local = self.state.local_regs(self.file(u.spec.bank));
                (u.spec.allowed(local).len(), u.slot == UseSlot::Base)
            })
            .map(|(index, _)| index)
    }

    /// Registers a use without a dedicated register may be placed in.
    fn any_target(&self, spec: OperandSpec, hint: PhysRegSet) -> Target {
        let file = self.file(spec.bank);
        let clobber = self.clobber_reg[file.index()];
        let local = self.state.local_regs(file);
        Target::Set {
            allowed: spec.allowed(local) - self.reserved[file.index()] - clobber,
            accepts: spec.allowed(PhysRegSet::first(64)) - clobber,
            hint,
        }
    }

    fn bind_any(&mut self, index: usize) -> Result<(), RegAllocError> {
        let Use { slot, spec, .. } = self.uses[index];
        let hint = if slot == UseSlot::Src(0) {
            self.coalesce_hint(spec)
        } else {
            PhysRegSet::new()
        };
        let reg = self.place(index, self.any_target(spec, hint))?;
        if hint.contains(reg) {
            trace!("  Coalesced move into {reg}");
            stat!(self.stats, coalesced_moves);
        }
        Ok(())
    }

    /// For a register copy, returns the destination register so that the
    /// source can be placed in the same register.
    fn coalesce_hint(&self, spec: OperandSpec) -> PhysRegSet {
        if self.options.disable_move_coalescing
            || self.orig.opcode != self.reginfo.bank_ops(spec.bank).move_
        {
            return PhysRegSet::new();
        }
        match (self.dest_reg, self.desc.dest) {
            (Some(reg), Some(dest)) if self.file(dest.bank) == self.file(spec.bank) => {
                PhysRegSet::single(reg)
            }
            _ => PhysRegSet::new(),
        }
    }

    /// Binds a register pair source: the low half, then the high half in the
    /// register the pair rule derives from it.
    fn bind_pair(&mut self, index: usize, rule: RegPairRule) -> Result<(), RegAllocError> {
        let Use { value, spec, .. } = self.uses[index];
        let file = self.file(spec.bank);
        let local = self.state.local_regs(file);
        let clobber = self.clobber_reg[file.index()];
        let Some(high_index) = self.uses.iter().position(|u| u.slot == UseSlot::SrcHigh) else {
            return Err(RegAllocError::MissingRegPairHalf { inst: self.inst });
        };
        let high_value = self.uses[high_index].value;

        let held = self.committed_reg(file, value) | self.committed_reg(file, high_value);
        let candidates = spec.allowed(local) - clobber - self.reserved[file.index()];
        let lows = self.valid_lows(file, rule, candidates, held);
        if lows.is_empty() {
            trace!("  No register pair available for {value}");
            return Err(RegAllocError::UnsupportedRegPair { inst: self.inst });
        }
        let hint = self.pair_friendly_lows(file, rule, lows, high_value.vreg());
        let low = self.place(
            index,
            Target::Set {
                allowed: lows,
                accepts: lows,
                hint,
            },
        )?;

        let target = match rule {
            RegPairRule::Fixed(_) | RegPairRule::Adjacent => {
                let Some(high) = rule.high_mask(low, local).first_reg() else {
                    return Err(RegAllocError::UnsupportedRegPair { inst: self.inst });
                };
                Target::Reg(high)
            }
            RegPairRule::Any => {
                let others = local - clobber - PhysRegSet::single(low);
                Target::Set {
                    allowed: others - self.reserved[file.index()],
                    accepts: others,
                    hint: PhysRegSet::new(),
                }
            }
        };
        self.place(high_index, target)?;
        Ok(())
    }

    /// Register committed to a use which currently holds `value`, if any.
    fn committed_reg(&self, file: RegBank, value: Reg) -> PhysRegSet {
        match value.vreg().map(|vreg| self.state.assignment(vreg)) {
            Some(Assignment::Reg(reg)) if self.taken[file.index()].contains(reg) => {
                PhysRegSet::single(reg)
            }
            _ => PhysRegSet::new(),
        }
    }

    /// Places a source of a two-address instruction in the register `dest`
    /// written by the corresponding destination.
    fn bind_tied(&mut self, index: usize, dest: PhysReg) -> Result<(), RegAllocError> {
        let Use { slot, value, spec, .. } = self.uses[index];
        let file = self.file(spec.bank);
        if self.state.local_regs(file).contains(dest) {
            self.place(index, Target::Reg(dest))?;
            return Ok(());
        }

        // A global destination is written with a copy before the instruction.
        if value != Reg::Phys(dest) {
            self.relocate_from(file, dest)?;
            let src = match value {
                Reg::Phys(reg) => reg,
                _ => self.place(index, self.any_target(spec, PhysRegSet::new()))?,
            };
            self.insert_copy_before(spec.bank, dest, src);
            stat!(self.stats, tied_copies);
        }
        self.uses[index].done = true;
        self.set_operand(slot, dest);
        Ok(())
    }

    /// Moves pending uses of the global register `reg` into another
    /// register, since `reg` is overwritten before the instruction.
    fn relocate_from(&mut self, file: RegBank, reg: PhysReg) -> Result<(), RegAllocError> {
        for index in 0..self.uses.len() {
            let Use {
                slot,
                value,
                spec,
                kind,
                done,
            } = self.uses[index];
            if done
                || !matches!(kind, UseKind::Any)
                || value != Reg::Phys(reg)
                || self.file(spec.bank) != file
            {
                continue;
            }
            let local = self.state.local_regs(file);
            let allowed =
                spec.allowed(local) - self.reserved[file.index()] - self.clobber_reg[file.index()];
            let tmp = self.claim(
                file,
                Target::Set {
                    allowed,
                    accepts: PhysRegSet::new(),
                    hint: PhysRegSet::new(),
                },
            )?;
            self.insert_copy_before(spec.bank, tmp, reg);
            stat!(self.stats, constraint_copies);
            self.uses[index].done = true;
            self.set_operand(slot, tmp);
            trace!("  Relocated {reg} to {tmp}");
        }
        Ok(())
    }

    /// Makes the value of use `index` available in a register satisfying
    /// `target` and rewrites the operand to read it.
    fn place(&mut self, index: usize, target: Target) -> Result<PhysReg, RegAllocError> {
        let Use {
            slot, value, spec, ..
        } = self.uses[index];
        let file = self.file(spec.bank);
        let reg = match value {
            Reg::None => self.claim(file, target)?,
            Reg::Phys(reg) if target.accepts(reg) => reg,
            Reg::Phys(reg) => {
                let dst = self.claim(file, target)?;
                self.copy_for_use(index, dst, reg);
                dst
            }
            Reg::Virt(vreg) => self.place_vreg(index, vreg, target)?,
        };
        self.uses[index].done = true;
        self.set_operand(slot, reg);
        Ok(reg)
    }

    fn place_vreg(
        &mut self,
        index: usize,
        vreg: VReg,
        target: Target,
    ) -> Result<PhysReg, RegAllocError> {
        let file = self.file(self.uses[index].spec.bank);
        let target = match target {
            Target::Set {
                allowed,
                accepts,
                hint,
            } => Target::Set {
                allowed,
                accepts,
                hint: hint | self.preferred(vreg),
            },
            target => target,
        };

        match self.state.assignment(vreg) {
            // Another use already committed the register holding the value.
            Assignment::Reg(reg) if self.taken[file.index()].contains(reg) => {
                if target.accepts(reg) {
                    return Ok(reg);
                }
                let dst = self.claim(file, target)?;
                self.copy_for_use(index, dst, reg);
                Ok(dst)
            }
            // The value lives across the instruction in `reg`.
            Assignment::Reg(reg) => {
                if target.accepts(reg) {
                    self.take(file, reg);
                    return Ok(reg);
                }
                if self.can_keep(index, file, reg, target) {
                    self.take(file, reg);
                    let dst = self.claim(file, target)?;
                    self.copy_for_use(index, dst, reg);
                    return Ok(dst);
                }
                let slot = self.spill_vreg(vreg, reg)?;
                self.load_spilled(vreg, file, slot, target)
            }
            Assignment::Spilled(slot) => self.load_spilled(vreg, file, slot, target),
            Assignment::Unbound => {
                let reg = self.claim(file, target)?;
                self.state.assign(vreg, reg);
                Ok(reg)
            }
        }
    }

    /// Binds a spilled `vreg` to a register satisfying `target` and stores it
    /// to its slot before the current instruction.
    fn load_spilled(
        &mut self,
        vreg: VReg,
        file: RegBank,
        slot: SpillSlot,
        target: Target,
    ) -> Result<PhysReg, RegAllocError> {
        let reg = self.claim(file, target)?;
        self.state.assign(vreg, reg);
        self.insert_store_before(vreg, slot, reg)?;
        Ok(reg)
    }

    /// Whether a value living across the instruction in `reg` can stay there
    /// while use `index` reads a copy of it, leaving enough registers for the
    /// uses which aren't bound yet.
    fn can_keep(&self, index: usize, file: RegBank, reg: PhysReg, target: Target) -> bool {
        // The pair partner of a low half placed elsewhere may be `reg`.
        if self.fixed[file.index()].contains(reg)
            || matches!(self.uses[index].kind, UseKind::PairLow(_))
        {
            return false;
        }
        let target_reg = match target {
            Target::Reg(target) => PhysRegSet::single(target),
            Target::Set { .. } => PhysRegSet::new(),
        };
        let local = self.state.local_regs(file);
        let unavailable = self.taken[file.index()]
            | self.reserved[file.index()]
            | self.clobber_reg[file.index()]
            | PhysRegSet::single(reg)
            | target_reg;
        let mut need = usize::from(target_reg.is_empty());

        for (i, u) in self.uses.iter().enumerate() {
            if i == index || u.done || self.file(u.spec.bank) != file {
                continue;
            }
            match u.kind {
                UseKind::Fixed(fixed) | UseKind::Tied(fixed) if local.contains(fixed) => {
                    if fixed == reg {
                        return false;
                    }
                }
                UseKind::Any => {
                    if (u.spec.allowed(local) - unavailable).is_empty() {
                        return false;
                    }
                    need += 1;
                }
                _ => need += 1,
            }
        }
        (local - unavailable - self.fixed[file.index()]).len() >= need
    }

    /// Inserts a copy of `src` into `dst` for use `index`.
    fn copy_for_use(&mut self, index: usize, dst: PhysReg, src: PhysReg) {
        let Use { spec, kind, .. } = self.uses[index];
        self.insert_copy_before(spec.bank, dst, src);
        match kind {
            UseKind::Fixed(_) => stat!(self.stats, fixed_copies),
            UseKind::Tied(_) => stat!(self.stats, tied_copies),
            _ => stat!(self.stats, constraint_copies),
        }
    }

    /// Rewrites the operand in `slot` to read `reg`.
    fn set_operand(&mut self, slot: UseSlot, reg: PhysReg) {
        let data = &mut self.block[self.inst];
        let reg = Reg::Phys(reg);
        match slot {
            UseSlot::Base => data.dest = reg,
            UseSlot::Src(index) => data.srcs[index] = reg,
            UseSlot::SrcHigh => data.src1_high = reg,
            UseSlot::Arg(index) => data.call_args[index].value = reg,
        }
    }
}

/// How a use with `spec` is placed when it isn't tied to the destination.
fn kind_of(spec: OperandSpec) -> UseKind {
    match (spec.pair, spec.fixed) {
        (Some(rule), _) => UseKind::PairLow(rule),
        (None, Some(reg)) => UseKind::Fixed(reg),
        (None, None) => UseKind::Any,
    }
}
