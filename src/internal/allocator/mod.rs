//! Backward allocation pass over a single block.
//!
//! Instructions are visited from the last to the first. At each instruction
//! the state describes where every virtual register used by later
//! instructions currently lives. Processing an instruction proceeds in this
//! order:
//!
//! 1. The destination is assigned a register and its virtual register is
//!    released: earlier instructions see the previous definition. Whatever
//!    else later instructions expect in the written registers is evicted.
//! 2. Clobbers are applied. For calls, every live local register is spilled.
//! 3. The operands read by the instruction are bound: first those pinned to a
//!    fixed register (including call arguments), then register pairs, then
//!    the first source of a two-address instruction, and finally the others
//!    from the most to the least constrained.
//!
//! After step 2 every virtual register still bound lives across the
//! instruction in a register the instruction doesn't write. A source found in
//! such a register is either read in place, copied into a register that
//! satisfies its constraints, or evicted when the register it occupies is
//! needed by another operand.
//!
//! Any instruction inserted *before* the current instruction sets up its
//! operands. Instructions inserted *after* it restore the state expected by
//! the later instructions: first the copies and stores reading the
//! destination, then reloads of values evicted while processing the
//! instruction.

mod dest;
mod fixed;
mod sources;
mod spill;

use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

use super::liveness::Liveness;
use super::state::AllocState;
use crate::debug_utils::DisplayInst;
use crate::function::{BlockData, Inst, InstData, Reg, VReg};
use crate::opcode::{ClobberSpec, InstDesc, Opcode, OperandSpec, RegPairRule};
use crate::reginfo::{PhysReg, PhysRegSet, RegBank, RegInfo};
use crate::spill_slots::SpillSlots;
use crate::{Options, RegAllocError, Stats};

pub struct BlockAllocator {
    liveness: Liveness,
    state: AllocState,
    uses: SmallVec<[Use; 8]>,
}

impl BlockAllocator {
    pub fn new() -> Self {
        Self {
            liveness: Liveness::new(),
            state: AllocState::new(),
            uses: SmallVec::new(),
        }
    }

    /// Replaces every virtual register operand of `block` with a physical
    /// register, inserting copies, spill stores and reloads as needed.
    pub fn run(
        &mut self,
        block: &mut BlockData,
        vregs: &PrimaryMap<VReg, RegBank>,
        reginfo: &impl RegInfo,
        spill_slots: &mut SpillSlots,
        options: &Options,
        stats: &mut Stats,
    ) -> Result<(), RegAllocError> {
        self.liveness.compute(block, reginfo)?;
        self.state.reset(vregs, reginfo);

        let mut ctx = Context {
            block,
            vregs,
            reginfo,
            spill_slots,
            options,
            stats,
            state: &mut self.state,
            liveness: &self.liveness,
            uses: &mut self.uses,
            inst: Inst::from_u32(0),
            index: 0,
            orig: InstData::new(Opcode::Iconst),
            desc: InstDesc::new(),
            taken: [PhysRegSet::new(); RegBank::COUNT],
            reserved: [PhysRegSet::new(); RegBank::COUNT],
            fixed: [PhysRegSet::new(); RegBank::COUNT],
            clobber_reg: [PhysRegSet::new(); RegBank::COUNT],
            operands: SmallVec::new(),
            dest_reg: None,
            dest_high_reg: None,
            after: Inst::from_u32(0),
            reload_after: None,
        };

        // Capture the predecessor before processing an instruction so that
        // instructions inserted around it are never visited.
        let mut index = ctx.block.len() as u32;
        let mut cursor = ctx.block.last();
        while let Some(inst) = cursor {
            cursor = ctx.block.prev(inst);
            ctx.allocate_inst(inst, index)?;
            index -= 1;
        }

        debug_assert!(self.state.all_free(), "registers still bound at block entry");
        Ok(())
    }
}

/// Operand slot of an instruction which is read by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UseSlot {
    /// Base address held in the destination operand.
    Base,
    Src(usize),
    /// High half of a register pair first source.
    SrcHigh,
    Arg(usize),
}

/// How the register of a use is chosen.
#[derive(Debug, Clone, Copy)]
enum UseKind {
    /// Must be in this register.
    Fixed(PhysReg),

    /// First source of a two-address instruction, which must be in the
    /// register written by the corresponding destination.
    Tied(PhysReg),

    /// Low half of a register pair.
    PairLow(RegPairRule),

    /// High half of a register pair, placed relative to the low half.
    PairHigh(RegPairRule),

    /// Any register allowed by the operand spec.
    Any,
}

/// An operand read by the current instruction.
#[derive(Debug, Clone, Copy)]
struct Use {
    slot: UseSlot,
    value: Reg,
    spec: OperandSpec,
    kind: UseKind,
    done: bool,
}

/// Register requirement for placing a use.
#[derive(Debug, Clone, Copy)]
enum Target {
    /// Exactly this register.
    Reg(PhysReg),

    /// A fresh register is picked from `allowed`, but a value already in a
    /// register of `accepts` is read from there.
    Set {
        allowed: PhysRegSet,
        accepts: PhysRegSet,
        hint: PhysRegSet,
    },
}

impl Target {
    fn accepts(self, reg: PhysReg) -> bool {
        match self {
            Target::Reg(fixed) => reg == fixed,
            Target::Set { accepts, .. } => accepts.contains(reg),
        }
    }
}

/// State for allocating registers in a block.
struct Context<'a, R> {
    block: &'a mut BlockData,
    vregs: &'a PrimaryMap<VReg, RegBank>,
    reginfo: &'a R,
    spill_slots: &'a mut SpillSlots,
    options: &'a Options,
    stats: &'a mut Stats,
    state: &'a mut AllocState,
    liveness: &'a Liveness,

    /// Operands read by the current instruction.
    uses: &'a mut SmallVec<[Use; 8]>,

    /// Instruction being allocated and its 1-based index in the original
    /// block.
    inst: Inst,
    index: u32,

    /// Operands of the instruction before allocation.
    orig: InstData,
    desc: InstDesc,

    /// Registers committed to a use of the current instruction, per register
    /// file. Their contents can't change until the instruction executes.
    taken: [PhysRegSet; RegBank::COUNT],

    /// Registers which only fixed and two-address uses may be placed in:
    /// a clobbered register, and the destination registers of two-address
    /// and register pair instructions.
    reserved: [PhysRegSet; RegBank::COUNT],

    /// Registers that some use of the instruction is pinned to.
    fixed: [PhysRegSet; RegBank::COUNT],

    /// Single register clobbered by the instruction, excluding calls.
    clobber_reg: [PhysRegSet; RegBank::COUNT],

    /// Virtual registers appearing in any operand of the instruction.
    operands: SmallVec<[VReg; 8]>,

    /// Registers written for the destination.
    dest_reg: Option<PhysReg>,
    dest_high_reg: Option<PhysReg>,

    /// Last instruction inserted after the current instruction which reads
    /// the destination. Reloads are always placed after these.
    after: Inst,

    /// Last reload inserted after the current instruction.
    reload_after: Option<Inst>,
}

impl<R: RegInfo> Context<'_, R> {
    /// Register file used by `bank`.
    #[inline]
    fn file(&self, bank: RegBank) -> RegBank {
        self.reginfo.reg_file(bank)
    }

    /// Commits `reg` to a use of the current instruction.
    #[inline]
    fn take(&mut self, file: RegBank, reg: PhysReg) {
        self.taken[file.index()].insert(reg);
    }

    /// Preferred registers for `vreg` from the liveness prepass.
    fn preferred(&self, vreg: VReg) -> PhysRegSet {
        if self.options.disable_preferences {
            PhysRegSet::new()
        } else {
            self.liveness.record(vreg).preferred
        }
    }

    fn allocate_inst(&mut self, inst: Inst, index: u32) -> Result<(), RegAllocError> {
        self.begin_inst(inst, index);
        trace!("Allocating {inst}: {}", DisplayInst(&self.orig));

        self.allocate_dest()?;
        self.apply_clobbers()?;
        self.allocate_sources()?;

        trace!("  -> {}", DisplayInst(&self.block[inst]));
        Ok(())
    }

    /// Resets the per-instruction state.
    fn begin_inst(&mut self, inst: Inst, index: u32) {
        self.inst = inst;
        self.index = index;
        self.orig = self.block[inst].clone();
        self.desc = *self.reginfo.inst_desc(self.orig.opcode);
        self.taken = [PhysRegSet::new(); RegBank::COUNT];
        self.reserved = [PhysRegSet::new(); RegBank::COUNT];
        self.fixed = [PhysRegSet::new(); RegBank::COUNT];
        self.clobber_reg = [PhysRegSet::new(); RegBank::COUNT];
        self.dest_reg = None;
        self.dest_high_reg = None;
        self.after = inst;
        self.reload_after = None;
        self.uses.clear();
        stat!(self.stats, input_insts);

        self.operands.clear();
        self.operands
            .extend(self.orig.regs().filter_map(Reg::vreg));

        let desc = self.desc;
        for spec in desc.uses() {
            let file = self.file(spec.bank);
            if let Some(reg) = spec.fixed {
                self.fixed[file.index()].insert(reg);
            }
            if let Some(RegPairRule::Fixed(reg)) = spec.pair {
                self.fixed[file.index()].insert(reg);
            }
        }
        for arg in &self.orig.call_args {
            let file = self.reginfo.reg_file(arg.bank);
            self.fixed[file.index()].insert(arg.reg);
        }
        if let ClobberSpec::Reg(bank, reg) = desc.clobber {
            let file = self.file(bank);
            self.clobber_reg[file.index()].insert(reg);
            self.reserved[file.index()].insert(reg);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::debug_utils::GenericRegInfo;
    use crate::function::Function;
    use crate::opcode::Opcode;

    fn run(func: &mut Function, reginfo: &GenericRegInfo) -> Result<SpillSlots, RegAllocError> {
        let mut allocator = BlockAllocator::new();
        let mut spill_slots = SpillSlots::new(0);
        let mut stats = Stats::default();
        let Function { vregs, blocks } = func;
        for block in blocks.values_mut() {
            allocator.run(
                block,
                vregs,
                reginfo,
                &mut spill_slots,
                &Options::default(),
                &mut stats,
            )?;
        }
        Ok(spill_slots)
    }

    fn opcodes(func: &Function) -> Vec<Opcode> {
        let block = &func.blocks[crate::function::Block::from_u32(0)];
        block.iter().map(|inst| block[inst].opcode).collect()
    }

    #[test]
    fn straight_line_without_spills() {
        let reginfo = GenericRegInfo::armv7();
        let mut func = Function::new();
        let b = func.new_block();
        let v0 = func.new_vreg(RegBank::Int);
        let v1 = func.new_vreg(RegBank::Int);
        let v2 = func.new_vreg(RegBank::Int);
        let blk = &mut func.blocks[b];
        blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(1));
        blk.push(InstData::new(Opcode::Iconst).dest(v1).imm(2));
        let add = blk.push(InstData::new(Opcode::Iadd).dest(v2).srcs([v0, v1]));

        let spill_slots = run(&mut func, &reginfo).unwrap();
        assert_eq!(spill_slots.num_slots(), 0);
        assert_eq!(opcodes(&func), [Opcode::Iconst, Opcode::Iconst, Opcode::Iadd]);
        let data = &func.blocks[b][add];
        assert!(data.regs().all(|reg| matches!(reg, Reg::Phys(_))));
        assert_ne!(data.srcs[0], data.srcs[1]);
    }

    #[test]
    fn undefined_use_is_reported() {
        let reginfo = GenericRegInfo::armv7();
        let mut func = Function::new();
        let b = func.new_block();
        let v0 = func.new_vreg(RegBank::Int);
        let v1 = func.new_vreg(RegBank::Int);
        let inst = func.blocks[b].push(InstData::new(Opcode::Move).dest(v1).srcs([v0]));
        assert!(matches!(
            run(&mut func, &reginfo),
            Err(RegAllocError::UndefinedVReg { inst: i, vreg }) if i == inst && vreg == v0
        ));
    }

    #[test]
    fn redefinition_uses_nearest_def() {
        let reginfo = GenericRegInfo::armv7();
        let mut func = Function::new();
        let b = func.new_block();
        let v0 = func.new_vreg(RegBank::Int);
        let v1 = func.new_vreg(RegBank::Int);
        let blk = &mut func.blocks[b];
        blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(1));
        blk.push(InstData::new(Opcode::IaddImm).dest(v0).srcs([v0]).imm(1));
        blk.push(InstData::new(Opcode::Move).dest(v1).srcs([v0]));
        run(&mut func, &reginfo).unwrap();
        assert_eq!(
            opcodes(&func),
            [Opcode::Iconst, Opcode::IaddImm, Opcode::Move]
        );
    }
}
