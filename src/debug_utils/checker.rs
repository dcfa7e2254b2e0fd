//! Checker which verifies that the output produced by the register allocator
//! actually matches the constraints in the input function.
//!
//! The allocated block is executed symbolically alongside the original block.
//! Every register and spill slot tracks which value it holds: either the
//! result of an original instruction or the value a non-local register held
//! on entry to the block. Each operand of an original instruction must then
//! read exactly the value that the corresponding operand of the input
//! function refers to.

use alloc::format;

use anyhow::{bail, ensure, Result};
use cranelift_entity::EntityRef;
use hashbrown::{HashMap, HashSet};
use rustc_hash::FxBuildHasher;

use crate::function::{Block, BlockData, Function, Inst, InstData, InstFlags, Reg, VReg};
use crate::opcode::{ClobberSpec, OperandSpec};
use crate::reginfo::{PhysReg, PhysRegSet, RegBank, RegInfo};
use crate::spill_slots::SpillSlots;

/// A value tracked by the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CheckerValue {
    /// Value written by an original instruction. The flag selects the high
    /// half of a register pair destination.
    Def(Inst, bool),

    /// Value held by a non-local register of a register file on entry to the
    /// block.
    Entry(RegBank, PhysReg),
}

/// A storage location: a register of a register file, or a spill slot
/// identified by its frame offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Location {
    Reg(RegBank, PhysReg),
    Stack(i64),
}

/// Checks that `allocated` is a correct register allocation of `original`.
///
/// `spill_slots` must be the spill slots returned by the allocator. This
/// checks that:
/// * Every original instruction is present, in order, with only physical
///   register operands.
/// * Each operand satisfies its fixed register, restriction, register pair and
///   two-address constraints.
/// * Each source operand holds the value the original operand refers to,
///   taking into account copies, spills, reloads and clobbers.
/// * Non-local registers hold the same values at the end of each block as
///   they would in the original function.
pub fn check_function(
    reginfo: &impl RegInfo,
    original: &Function,
    allocated: &Function,
    spill_slots: &SpillSlots,
) -> Result<()> {
    ensure!(
        original.vregs == allocated.vregs,
        "Virtual registers differ between the original and allocated functions"
    );
    ensure!(
        original.blocks.len() == allocated.blocks.len(),
        "Number of blocks differs between the original and allocated functions"
    );
    for block in original.blocks.keys() {
        check_block(reginfo, original, allocated, block, spill_slots)?;
    }
    Ok(())
}

/// Checks a single block of `allocated` against the same block of
/// `original`. See [`check_function`].
pub fn check_block(
    reginfo: &impl RegInfo,
    original: &Function,
    allocated: &Function,
    block: Block,
    spill_slots: &SpillSlots,
) -> Result<()> {
    let mut spill_offsets = HashSet::default();
    for (_slot, bank, offset) in spill_slots.assigned() {
        spill_offsets.insert((reginfo.reg_file(bank), i64::from(offset)));
    }
    let mut checker = Checker {
        reginfo,
        spill_offsets,
        state: HashMap::default(),
        current: HashMap::default(),
        globals: HashMap::default(),
    };
    checker
        .check_block(block, &original.blocks[block], &allocated.blocks[block])
        .map_err(|err| err.context(format!("In {block}")))
}

/// Banks which own a register file.
fn root_files(reginfo: &impl RegInfo) -> impl Iterator<Item = RegBank> + '_ {
    RegBank::ALL
        .into_iter()
        .filter(|&bank| reginfo.mirror_of(bank).is_none())
}

struct Checker<'a, R> {
    reginfo: &'a R,

    /// Spill slot offsets assigned by the allocator, with the register file
    /// using them.
    spill_offsets: HashSet<(RegBank, i64), FxBuildHasher>,

    /// Value held by each location of the allocated block.
    state: HashMap<Location, CheckerValue, FxBuildHasher>,

    /// Value of each virtual register of the original block.
    current: HashMap<VReg, CheckerValue, FxBuildHasher>,

    /// Values written to non-local registers by the original block.
    globals: HashMap<(RegBank, PhysReg), CheckerValue, FxBuildHasher>,
}

impl<R: RegInfo> Checker<'_, R> {
    fn check_block(
        &mut self,
        block: Block,
        original: &BlockData,
        allocated: &BlockData,
    ) -> Result<()> {
        // Non-local registers start with their entry value, local registers
        // and spill slots with garbage.
        let reginfo = self.reginfo;
        for file in root_files(reginfo) {
            for reg in self.non_local(file) {
                self.state
                    .insert(Location::Reg(file, reg), CheckerValue::Entry(file, reg));
            }
        }

        let mut expected = original.iter();
        for inst in allocated {
            let data = &allocated[inst];
            if inst.index() < original.len() {
                ensure!(
                    expected.next() == Some(inst),
                    "{inst}: Original instruction out of order"
                );
                self.check_original(inst, &original[inst], data)?;
            } else {
                self.check_inserted(inst, data)?;
            }
        }
        if let Some(inst) = expected.next() {
            bail!("{inst}: Original instruction missing from {block}");
        }

        for file in root_files(reginfo) {
            for reg in self.non_local(file) {
                let expected = self.global_value(file, reg);
                let actual = self.state.get(&Location::Reg(file, reg)).copied();
                ensure!(
                    actual == Some(expected),
                    "{file} register {reg} holds {actual:?} at the end of the block instead of \
                     {expected:?}"
                );
            }
        }
        Ok(())
    }

    fn non_local(&self, file: RegBank) -> PhysRegSet {
        PhysRegSet::first(self.reginfo.num_regs(file)) - self.reginfo.local_regs(file)
    }

    fn global_value(&self, file: RegBank, reg: PhysReg) -> CheckerValue {
        self.globals
            .get(&(file, reg))
            .copied()
            .unwrap_or(CheckerValue::Entry(file, reg))
    }

    fn phys(inst: Inst, reg: Reg) -> Result<PhysReg> {
        match reg {
            Reg::Phys(reg) => Ok(reg),
            Reg::Virt(vreg) => bail!("{inst}: {vreg} was not allocated"),
            Reg::None => bail!("{inst}: Missing operand"),
        }
    }

    /// Checks that an allocated operand satisfies the constraints of `spec`.
    ///
    /// `tied` is the original destination written through this operand by a
    /// two-address instruction, or `Reg::None`. A global destination may
    /// then be read as the operand.
    fn check_constraint(
        &self,
        inst: Inst,
        orig: Reg,
        tied: Reg,
        reg: PhysReg,
        spec: &OperandSpec,
    ) -> Result<()> {
        let file = self.reginfo.reg_file(spec.bank);
        let local = self.reginfo.local_regs(file);
        ensure!(
            orig == Reg::Phys(reg) || tied == Reg::Phys(reg) || local.contains(reg),
            "{inst}: Operand {orig} allocated to non-local register {reg}"
        );
        if let Some(fixed) = spec.fixed {
            ensure!(
                reg == fixed,
                "{inst}: Operand {orig} must be in {fixed}, got {reg}"
            );
        }
        if let Some(restrict) = spec.restrict {
            ensure!(
                restrict.contains(reg),
                "{inst}: Operand {orig} in {reg} outside of the allowed {restrict}"
            );
        }
        if let Some(rule) = spec.pair {
            ensure!(
                rule.low_mask(local).contains(reg),
                "{inst}: {reg} can't hold the low half of a register pair"
            );
        }
        Ok(())
    }

    fn check_pair_high(&self, inst: Inst, low: PhysReg, high: PhysReg, spec: &OperandSpec) -> Result<()> {
        let file = self.reginfo.reg_file(spec.bank);
        if let Some(rule) = spec.pair {
            ensure!(
                rule.high_mask(low, self.reginfo.local_regs(file)).contains(high),
                "{inst}: {high} can't hold the high half of a pair in {low}"
            );
        }
        Ok(())
    }

    /// Checks that `reg` holds the value referred to by the original operand.
    fn check_use(&self, inst: Inst, orig: Reg, reg: PhysReg, bank: RegBank) -> Result<()> {
        let file = self.reginfo.reg_file(bank);
        let expected = match orig {
            Reg::Virt(vreg) => match self.current.get(&vreg) {
                Some(&value) => value,
                None => bail!("{inst}: {vreg} used without a definition"),
            },
            Reg::Phys(reg) => self.global_value(file, reg),
            Reg::None => bail!("{inst}: Missing operand"),
        };
        let actual = self.state.get(&Location::Reg(file, reg)).copied();
        ensure!(
            actual == Some(expected),
            "{inst}: Operand {orig} in {reg} holds {actual:?} instead of {expected:?}"
        );
        Ok(())
    }

    fn define(&mut self, orig: Reg, reg: PhysReg, bank: RegBank, value: CheckerValue) {
        let file = self.reginfo.reg_file(bank);
        self.state.insert(Location::Reg(file, reg), value);
        match orig {
            Reg::Virt(vreg) => {
                self.current.insert(vreg, value);
            }
            Reg::Phys(reg) => {
                self.globals.insert((file, reg), value);
            }
            Reg::None => {}
        }
    }

    fn check_original(&mut self, inst: Inst, orig: &InstData, data: &InstData) -> Result<()> {
        ensure!(
            data.opcode == orig.opcode && data.imm == orig.imm,
            "{inst}: Original instruction modified"
        );
        ensure!(
            data.flags.is_empty(),
            "{inst}: Original instruction has allocator flags"
        );
        ensure!(
            data.call_args.len() == orig.call_args.len(),
            "{inst}: Call arguments modified"
        );
        let operands = [
            (orig.dest, data.dest),
            (orig.dest_high, data.dest_high),
            (orig.src1_high, data.src1_high),
        ]
        .into_iter()
        .chain(orig.srcs.into_iter().zip(data.srcs));
        for (orig, reg) in operands {
            ensure!(
                orig.is_some() == reg.is_some(),
                "{inst}: Operand presence modified"
            );
            if reg.is_some() {
                Self::phys(inst, reg)?;
            }
        }

        let desc = *self.reginfo.inst_desc(orig.opcode);

        // Sources, including a base destination.
        if let Some(spec) = desc.dest.filter(|_| desc.dest_is_base) {
            let reg = Self::phys(inst, data.dest)?;
            self.check_constraint(inst, orig.dest, Reg::None, reg, &spec)?;
            self.check_use(inst, orig.dest, reg, spec.bank)?;
        }
        let tied = desc.clobber == ClobberSpec::Dest1 && desc.defines_dest();
        for (index, spec) in desc.srcs.iter().enumerate() {
            let Some(spec) = spec else {
                continue;
            };
            let reg = Self::phys(inst, data.srcs[index])?;
            let tied_dest = if tied && index == 0 { orig.dest } else { Reg::None };
            self.check_constraint(inst, orig.srcs[index], tied_dest, reg, spec)?;
            self.check_use(inst, orig.srcs[index], reg, spec.bank)?;
            if index == 0 && spec.pair.is_some() {
                let high = Self::phys(inst, data.src1_high)?;
                self.check_pair_high(inst, reg, high, spec)?;
                self.check_use(inst, orig.src1_high, high, spec.bank)?;
            }
        }
        for (orig_arg, arg) in orig.call_args.iter().zip(&data.call_args) {
            let reg = Self::phys(inst, arg.value)?;
            ensure!(
                arg.bank == orig_arg.bank && arg.reg == orig_arg.reg && reg == arg.reg,
                "{inst}: Call argument {} not passed in {}",
                orig_arg.value,
                orig_arg.reg
            );
            self.check_use(inst, orig_arg.value, reg, arg.bank)?;
        }

        if tied {
            ensure!(
                data.dest == data.srcs[0] && data.dest_high == data.src1_high,
                "{inst}: Two-address destination differs from the first source"
            );
        }

        match desc.clobber {
            ClobberSpec::Call => {
                let reginfo = self.reginfo;
                for file in root_files(reginfo) {
                    for reg in reginfo.local_regs(file) {
                        self.state.remove(&Location::Reg(file, reg));
                    }
                }
            }
            ClobberSpec::Reg(bank, reg) => {
                let file = self.reginfo.reg_file(bank);
                self.state.remove(&Location::Reg(file, reg));
            }
            ClobberSpec::None | ClobberSpec::Dest1 => {}
        }

        if let Some(spec) = desc.dest.filter(|_| desc.defines_dest()) {
            let reg = Self::phys(inst, data.dest)?;
            self.check_constraint(inst, orig.dest, Reg::None, reg, &spec)?;
            if spec.pair.is_some() {
                let high = Self::phys(inst, data.dest_high)?;
                ensure!(high != reg, "{inst}: Both halves of a pair in {reg}");
                self.check_pair_high(inst, reg, high, &spec)?;
                self.define(orig.dest_high, high, spec.bank, CheckerValue::Def(inst, true));
            }
            self.define(orig.dest, reg, spec.bank, CheckerValue::Def(inst, false));
        }
        Ok(())
    }

    /// Register file whose spill code uses `data.opcode` for `flags`.
    fn spill_code_file(&self, inst: Inst, data: &InstData) -> Result<RegBank> {
        let file = RegBank::ALL.into_iter().find(|&bank| {
            let ops = self.reginfo.bank_ops(bank);
            let opcode = if data.flags == InstFlags::COPY {
                ops.move_
            } else if data.flags == InstFlags::SPILL {
                ops.store
            } else {
                ops.load
            };
            self.reginfo.num_regs(bank) != 0 && opcode == data.opcode
        });
        match file {
            Some(bank) => Ok(self.reginfo.reg_file(bank)),
            None => bail!("{inst}: {} is not a spill code opcode", data.opcode),
        }
    }

    fn check_inserted(&mut self, inst: Inst, data: &InstData) -> Result<()> {
        ensure!(
            data.flags == InstFlags::COPY
                || data.flags == InstFlags::SPILL
                || data.flags == InstFlags::RELOAD,
            "{inst}: Inserted instruction must have exactly one allocator flag"
        );
        ensure!(
            data.call_args.is_empty()
                && data.dest_high == Reg::None
                && data.src1_high == Reg::None
                && data.srcs[1..].iter().all(|&src| src == Reg::None),
            "{inst}: Malformed inserted instruction"
        );
        let file = self.spill_code_file(inst, data)?;
        let frame = self.reginfo.frame_reg();
        let dest = Self::phys(inst, data.dest)?;
        let src = Self::phys(inst, data.srcs[0])?;

        let (from, to) = if data.flags == InstFlags::COPY {
            (Location::Reg(file, src), Location::Reg(file, dest))
        } else {
            ensure!(
                self.spill_offsets.contains(&(file, data.imm)),
                "{inst}: No spill slot at offset {}",
                data.imm
            );
            if data.flags == InstFlags::SPILL {
                ensure!(dest == frame, "{inst}: Spill not relative to {frame}");
                (Location::Reg(file, src), Location::Stack(data.imm))
            } else {
                ensure!(src == frame, "{inst}: Reload not relative to {frame}");
                (Location::Stack(data.imm), Location::Reg(file, dest))
            }
        };
        let Some(&value) = self.state.get(&from) else {
            bail!("{inst}: Reading from {from:?} which holds no value");
        };
        self.state.insert(to, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_utils::GenericRegInfo;
    use crate::opcode::Opcode;
    use crate::{Options, RegisterAllocator};

    fn build() -> (Function, Block) {
        let mut func = Function::new();
        let b = func.new_block();
        let v0 = func.new_vreg(RegBank::Int);
        let v1 = func.new_vreg(RegBank::Int);
        let v2 = func.new_vreg(RegBank::Int);
        let blk = &mut func.blocks[b];
        blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(1));
        blk.push(InstData::new(Opcode::Iconst).dest(v1).imm(2));
        blk.push(InstData::new(Opcode::Iadd).dest(v2).srcs([v0, v1]));
        blk.push(InstData::new(Opcode::Move).dest(PhysReg::new(3)).srcs([v2]));
        (func, b)
    }

    #[test]
    fn accepts_allocator_output() {
        let reginfo = GenericRegInfo::x86();
        let (original, _) = build();
        let mut allocated = original.clone();
        let spill_slots = RegisterAllocator::new()
            .allocate_function(&mut allocated, &reginfo, &Options::default())
            .unwrap();
        check_function(&reginfo, &original, &allocated, &spill_slots).unwrap();
    }

    #[test]
    fn rejects_wrong_source() {
        let reginfo = GenericRegInfo::x86();
        let (original, b) = build();
        let mut allocated = original.clone();
        let spill_slots = RegisterAllocator::new()
            .allocate_function(&mut allocated, &reginfo, &Options::default())
            .unwrap();
        let add = Inst::new(2);
        let blk = &mut allocated.blocks[b];
        blk[add].srcs[1] = blk[add].srcs[0];
        assert!(check_function(&reginfo, &original, &allocated, &spill_slots).is_err());
    }

    #[test]
    fn rejects_clobbered_global() {
        let reginfo = GenericRegInfo::x86();
        let (original, b) = build();
        let mut allocated = original.clone();
        let spill_slots = RegisterAllocator::new()
            .allocate_function(&mut allocated, &reginfo, &Options::default())
            .unwrap();
        // Overwrite esi, which the original block never writes.
        allocated.blocks[b].push(
            InstData::new(Opcode::Move)
                .dest(PhysReg::new(6))
                .srcs([PhysReg::new(3)])
                .flags(InstFlags::COPY),
        );
        assert!(check_function(&reginfo, &original, &allocated, &spill_slots).is_err());
    }

    #[test]
    fn rejects_unallocated_operand() {
        let reginfo = GenericRegInfo::x86();
        let (original, _) = build();
        let spill_slots = SpillSlots::new(0);
        assert!(check_function(&reginfo, &original, &original, &spill_slots).is_err());
    }

    /// `esi = imul v0, v1` lowered by hand through a copy into `esi`.
    fn global_two_address(second: PhysReg) -> (Function, Function, Block) {
        let (eax, ecx, esi) = (PhysReg::new(0), PhysReg::new(1), PhysReg::new(6));
        let mut original = Function::new();
        let b = original.new_block();
        let v0 = original.new_vreg(RegBank::Int);
        let v1 = original.new_vreg(RegBank::Int);
        let blk = &mut original.blocks[b];
        let c0 = blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(6));
        let c1 = blk.push(InstData::new(Opcode::Iconst).dest(v1).imm(7));
        let mul = blk.push(InstData::new(Opcode::Imul).dest(esi).srcs([v0, v1]));

        let mut allocated = original.clone();
        let blk = &mut allocated.blocks[b];
        blk[c0].dest = Reg::Phys(eax);
        blk[c1].dest = Reg::Phys(ecx);
        blk[mul].srcs = [Reg::Phys(esi), Reg::Phys(second), Reg::None];
        blk.insert_before(
            mul,
            InstData::new(Opcode::Move)
                .dest(esi)
                .srcs([eax])
                .flags(InstFlags::COPY),
        );
        (original, allocated, b)
    }

    #[test]
    fn accepts_tied_global_destination() {
        let reginfo = GenericRegInfo::x86();
        let (original, allocated, _) = global_two_address(PhysReg::new(1));
        let spill_slots = SpillSlots::new(0);
        check_function(&reginfo, &original, &allocated, &spill_slots).unwrap();
    }

    #[test]
    fn rejects_global_for_untied_source() {
        let reginfo = GenericRegInfo::x86();
        let (original, allocated, _) = global_two_address(PhysReg::new(6));
        let spill_slots = SpillSlots::new(0);
        assert!(check_function(&reginfo, &original, &allocated, &spill_slots).is_err());
    }
}
