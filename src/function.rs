//! The [`Function`] type which holds the code being compiled.
//!
//! A function is a set of virtual registers, each belonging to a
//! [`RegBank`], and a set of independent basic blocks. The allocator processes
//! each block on its own: no virtual register may be live across a block
//! boundary. Values which must survive across blocks are expected to live in
//! global registers, which appear as [`Reg::Phys`] operands.
//!
//! # Instructions
//!
//! Each instruction has an [`Opcode`] and up to 3 source operands plus a
//! destination operand. The register constraints of each operand are not
//! stored in the instruction but are looked up from the target's
//! [`InstDesc`](crate::opcode::InstDesc) for the opcode.
//!
//! Instructions are stored in an arena owned by their [`BlockData`] and are
//! linked together in program order. New instructions can be inserted before
//! or after any existing instruction. [`Inst`] handles remain valid across
//! insertions, which means that the instructions of the original block keep
//! their handles after allocation.
//!
//! # Register pairs
//!
//! Some operands hold a 64-bit value split across two registers. The low half
//! of such a pair is the operand itself (`dest` or `srcs[0]`) and the high
//! half is held in a separate field (`dest_high` or `src1_high`). The high
//! half must always be the virtual register immediately following the low
//! half, in the same bank.
//!
//! # Non-SSA form
//!
//! Virtual registers may be defined multiple times within a block. A use
//! always refers to the closest preceding definition in the same block, and
//! every use must be preceded by at least one definition.

use core::fmt;
use core::ops::{Index, IndexMut};

use bitflags::bitflags;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

use crate::opcode::Opcode;
use crate::reginfo::{PhysReg, RegBank};

/// A virtual register.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VReg(u32);
entity_impl!(VReg, "v");

/// An instruction of a block.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// A basic block.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Block(u32);
entity_impl!(Block, "block");

impl VReg {
    /// The virtual register holding the high half of a register pair whose
    /// low half is `self`.
    #[inline]
    #[must_use]
    pub fn pair_high(self) -> VReg {
        VReg(self.0 + 1)
    }
}

/// A register operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Reg {
    /// The operand is unused.
    #[default]
    None,

    /// A virtual register, to be replaced by the allocator.
    Virt(VReg),

    /// A physical register.
    ///
    /// Before allocation this can only be a global register or the frame
    /// register. After allocation every operand is a physical register.
    Phys(PhysReg),
}

impl Reg {
    /// Whether the operand is present.
    #[inline]
    #[must_use]
    pub fn is_some(self) -> bool {
        self != Reg::None
    }

    /// Returns the virtual register, if this is one.
    #[inline]
    #[must_use]
    pub fn vreg(self) -> Option<VReg> {
        match self {
            Reg::Virt(vreg) => Some(vreg),
            _ => None,
        }
    }

    /// Returns the physical register, if this is one.
    #[inline]
    #[must_use]
    pub fn phys(self) -> Option<PhysReg> {
        match self {
            Reg::Phys(reg) => Some(reg),
            _ => None,
        }
    }
}

impl From<VReg> for Reg {
    #[inline]
    fn from(vreg: VReg) -> Self {
        Reg::Virt(vreg)
    }
}

impl From<PhysReg> for Reg {
    #[inline]
    fn from(reg: PhysReg) -> Self {
        Reg::Phys(reg)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::None => f.write_str("_"),
            Reg::Virt(vreg) => write!(f, "{vreg}"),
            Reg::Phys(reg) => write!(f, "{reg}"),
        }
    }
}

/// An outgoing argument of a call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CallArg {
    /// Value passed to the callee.
    pub value: Reg,

    /// Bank of the argument register.
    pub bank: RegBank,

    /// Register in which the callee expects the value.
    pub reg: PhysReg,
}

bitflags! {
    /// Flags describing instructions inserted by the allocator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct InstFlags: u8 {
        /// A register-to-register copy.
        const COPY = 1 << 0;

        /// A store of a register to its spill slot.
        const SPILL = 1 << 1;

        /// A load of a spilled value back into a register.
        const RELOAD = 1 << 2;
    }
}

/// An instruction together with its operands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstData {
    /// Operation performed by the instruction.
    pub opcode: Opcode,

    /// Destination operand, or base address for store instructions.
    pub dest: Reg,

    /// High half of a register pair destination.
    pub dest_high: Reg,

    /// Source operands.
    pub srcs: [Reg; 3],

    /// High half of a register pair first source.
    pub src1_high: Reg,

    /// Immediate operand: constant value or memory offset.
    pub imm: i64,

    /// Outgoing arguments of a call.
    pub call_args: SmallVec<[CallArg; 4]>,

    /// Kind of allocator-inserted instruction. Empty for original
    /// instructions.
    pub flags: InstFlags,
}

impl InstData {
    /// Creates an instruction with no operands.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            dest: Reg::None,
            dest_high: Reg::None,
            srcs: [Reg::None; 3],
            src1_high: Reg::None,
            imm: 0,
            call_args: SmallVec::new(),
            flags: InstFlags::empty(),
        }
    }

    /// Sets the destination operand.
    #[must_use]
    pub fn dest(mut self, dest: impl Into<Reg>) -> Self {
        self.dest = dest.into();
        self
    }

    /// Sets a register pair destination starting at `low`.
    #[must_use]
    pub fn dest_pair(mut self, low: VReg) -> Self {
        self.dest = Reg::Virt(low);
        self.dest_high = Reg::Virt(low.pair_high());
        self
    }

    /// Sets the source operands, in order.
    #[must_use]
    pub fn srcs<const N: usize>(mut self, srcs: [impl Into<Reg>; N]) -> Self {
        for (slot, src) in self.srcs.iter_mut().zip(srcs) {
            *slot = src.into();
        }
        self
    }

    /// Sets a register pair first source starting at `low`.
    #[must_use]
    pub fn src1_pair(mut self, low: VReg) -> Self {
        self.srcs[0] = Reg::Virt(low);
        self.src1_high = Reg::Virt(low.pair_high());
        self
    }

    /// Sets the immediate operand.
    #[must_use]
    pub fn imm(mut self, imm: i64) -> Self {
        self.imm = imm;
        self
    }

    /// Adds an outgoing call argument.
    #[must_use]
    pub fn call_arg(mut self, value: impl Into<Reg>, bank: RegBank, reg: PhysReg) -> Self {
        self.call_args.push(CallArg {
            value: value.into(),
            bank,
            reg,
        });
        self
    }

    /// Sets the allocator flags.
    #[must_use]
    pub fn flags(mut self, flags: InstFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Iterates over all register operands, including pair halves and call
    /// arguments.
    pub fn regs(&self) -> impl Iterator<Item = Reg> + '_ {
        [self.dest, self.dest_high, self.src1_high]
            .into_iter()
            .chain(self.srcs)
            .chain(self.call_args.iter().map(|arg| arg.value))
            .filter(|reg| reg.is_some())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
struct InstLinks {
    prev: PackedOption<Inst>,
    next: PackedOption<Inst>,
}

/// The instructions of a basic block, as a doubly-linked list over an
/// instruction arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockData {
    insts: PrimaryMap<Inst, InstData>,
    links: SecondaryMap<Inst, InstLinks>,
    first: PackedOption<Inst>,
    last: PackedOption<Inst>,
}

impl BlockData {
    /// Creates an empty block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instructions in the block.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    /// Whether the block has no instructions.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// First instruction of the block.
    #[inline]
    #[must_use]
    pub fn first(&self) -> Option<Inst> {
        self.first.expand()
    }

    /// Last instruction of the block.
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<Inst> {
        self.last.expand()
    }

    /// Instruction following `inst`.
    #[inline]
    #[must_use]
    pub fn next(&self, inst: Inst) -> Option<Inst> {
        self.links[inst].next.expand()
    }

    /// Instruction preceding `inst`.
    #[inline]
    #[must_use]
    pub fn prev(&self, inst: Inst) -> Option<Inst> {
        self.links[inst].prev.expand()
    }

    /// Appends an instruction at the end of the block.
    pub fn push(&mut self, data: InstData) -> Inst {
        let inst = self.insts.push(data);
        let prev = self.last.expand();
        self.links[inst] = InstLinks {
            prev: prev.into(),
            next: None.into(),
        };
        match prev {
            Some(prev) => self.links[prev].next = inst.into(),
            None => self.first = inst.into(),
        }
        self.last = inst.into();
        inst
    }

    /// Inserts an instruction immediately before `anchor`.
    pub fn insert_before(&mut self, anchor: Inst, data: InstData) -> Inst {
        let inst = self.insts.push(data);
        let prev = self.links[anchor].prev.expand();
        self.links[inst] = InstLinks {
            prev: prev.into(),
            next: anchor.into(),
        };
        self.links[anchor].prev = inst.into();
        match prev {
            Some(prev) => self.links[prev].next = inst.into(),
            None => self.first = inst.into(),
        }
        inst
    }

    /// Inserts an instruction immediately after `anchor`.
    pub fn insert_after(&mut self, anchor: Inst, data: InstData) -> Inst {
        let inst = self.insts.push(data);
        let next = self.links[anchor].next.expand();
        self.links[inst] = InstLinks {
            prev: anchor.into(),
            next: next.into(),
        };
        self.links[anchor].next = inst.into();
        match next {
            Some(next) => self.links[next].prev = inst.into(),
            None => self.last = inst.into(),
        }
        inst
    }

    /// Iterates over the instructions of the block in program order.
    #[must_use]
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            block: self,
            next: self.first(),
        }
    }
}

impl Index<Inst> for BlockData {
    type Output = InstData;

    #[inline]
    fn index(&self, inst: Inst) -> &InstData {
        &self.insts[inst]
    }
}

impl IndexMut<Inst> for BlockData {
    #[inline]
    fn index_mut(&mut self, inst: Inst) -> &mut InstData {
        &mut self.insts[inst]
    }
}

impl<'a> IntoIterator for &'a BlockData {
    type Item = Inst;
    type IntoIter = BlockIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the instructions of a block in program order.
#[derive(Clone)]
pub struct BlockIter<'a> {
    block: &'a BlockData,
    next: Option<Inst>,
}

impl Iterator for BlockIter<'_> {
    type Item = Inst;

    #[inline]
    fn next(&mut self) -> Option<Inst> {
        let inst = self.next?;
        self.next = self.block.next(inst);
        Some(inst)
    }
}

/// A function: virtual registers and the blocks using them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Function {
    /// Bank of each virtual register.
    pub vregs: PrimaryMap<VReg, RegBank>,

    /// Basic blocks of the function.
    pub blocks: PrimaryMap<Block, BlockData>,
}

impl Function {
    /// Creates an empty function.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new virtual register in `bank`.
    pub fn new_vreg(&mut self, bank: RegBank) -> VReg {
        self.vregs.push(bank)
    }

    /// Creates two consecutive virtual registers in `bank` for use as a
    /// register pair, and returns the low half.
    pub fn new_vreg_pair(&mut self, bank: RegBank) -> VReg {
        let low = self.vregs.push(bank);
        self.vregs.push(bank);
        low
    }

    /// Creates a new empty block.
    pub fn new_block(&mut self) -> Block {
        self.blocks.push(BlockData::new())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn iconst(imm: i64) -> InstData {
        InstData::new(Opcode::Iconst).imm(imm)
    }

    #[test]
    fn insertion_order() {
        let mut block = BlockData::new();
        let a = block.push(iconst(0));
        let c = block.push(iconst(2));
        let b = block.insert_before(c, iconst(1));
        let d = block.insert_after(c, iconst(3));
        let first = block.insert_before(a, iconst(-1));
        let e = block.insert_after(b, iconst(15));

        let order: Vec<_> = block.iter().collect();
        assert_eq!(order, [first, a, b, e, c, d]);
        assert_eq!(block.first(), Some(first));
        assert_eq!(block.last(), Some(d));
        assert_eq!(block.prev(c), Some(e));
        assert_eq!(block.next(d), None);
        assert_eq!(block.len(), 6);

        // Handles of earlier instructions are stable.
        assert_eq!(block[a].imm, 0);
        assert_eq!(block[d].imm, 3);
    }

    #[test]
    fn backward_walk_with_insertions() {
        let mut block = BlockData::new();
        for i in 0..4 {
            block.push(iconst(i));
        }

        // Walk backwards, inserting around each instruction. Capturing the
        // predecessor first means inserted instructions are never visited.
        let mut visited = Vec::new();
        let mut cursor = block.last();
        while let Some(inst) = cursor {
            cursor = block.prev(inst);
            visited.push(block[inst].imm);
            block.insert_before(inst, iconst(100));
            block.insert_after(inst, iconst(200));
        }
        assert_eq!(visited, [3, 2, 1, 0]);
        let imms: Vec<_> = block.iter().map(|inst| block[inst].imm).collect();
        assert_eq!(
            imms,
            [100, 0, 200, 100, 1, 200, 100, 2, 200, 100, 3, 200]
        );
    }

    #[test]
    fn pair_builders() {
        let mut func = Function::new();
        let low = func.new_vreg_pair(RegBank::Int);
        let inst = InstData::new(Opcode::Lneg).dest_pair(low).src1_pair(low);
        assert_eq!(inst.dest_high, Reg::Virt(low.pair_high()));
        assert_eq!(inst.src1_high, Reg::Virt(VReg::from_u32(1)));
        assert_eq!(func.vregs.len(), 2);
        assert_eq!(inst.regs().count(), 4);
    }
}
