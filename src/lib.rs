//! A fast local register allocator for JIT compiler backends.
//!
//! This crate is compatible with `#![no_std]` and only requires `alloc`,
//! unless the `clap` feature is enabled.
//!
//! The allocator works on one basic block at a time, in a single backward
//! pass over its instructions. It is designed for the common JIT setup where
//! values which live across blocks have already been assigned to *global*
//! registers, leaving a set of *local* registers which can be freely assigned
//! within each block.
//!
//! # Usage
//!
//! You will need an implementation of [`RegInfo`] which describes the
//! register banks of the target, which registers are local or global, and the
//! register constraints of every [`Opcode`](opcode::Opcode). See the
//! [`reginfo`] and [`opcode`] module documentation for more details.
//!
//! The code to allocate is described by a [`Function`], which holds the
//! virtual registers and the instructions of each block. See the
//! [`function`] module documentation for more details.
//!
//! The register allocator is invoked by creating an instance of
//! [`RegisterAllocator`] and then calling
//! [`RegisterAllocator::allocate_function`]. This rewrites the function in
//! place: every virtual register operand is replaced by a physical register,
//! and copies, spill stores and reloads are inserted around the original
//! instructions. The returned [`SpillSlots`] describe the stack slots used by
//! spill code.
//!
//! # Reusing allocations
//!
//! For performance reasons, the [`RegisterAllocator`] type doesn't free
//! temporary allocations after a call to
//! [`RegisterAllocator::allocate_function`].
//!
//! This allows register allocation to be run on multiple functions without the
//! need for further calls to the memory allocator, which can be slow. If the
//! memory usage is a concern or if you are finished compiling functions then
//! you can simply drop [`RegisterAllocator`] to free all temporary memory.
//!
//! # Validation
//!
//! When developing a new client of the register allocator, it is highly
//! recommended to use the validation functions in [`debug_utils`] to ensure
//! that the inputs to the register allocator are correct.
//!
//! If inputs fail validation then the register allocator may panic or just
//! produce garbage results.
//!
//! However validation is relatively expensive so you may not want to have it
//! enabled in production.
//!
//! Note that even code that passes validation may cause the register allocator
//! to return an error ([`RegAllocError`]). This is usually an indication of
//! impossible constraints on an instruction.

#![cfg_attr(not(feature = "clap"), no_std)]
#![warn(rust_2018_idioms, missing_docs)]
#![allow(
    clippy::too_many_arguments,
    clippy::collapsible_if,
    clippy::collapsible_else_if,
    clippy::single_char_add_str,
    clippy::cast_possible_truncation,
    clippy::too_many_lines,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::doc_markdown
)]
#![warn(
    clippy::explicit_iter_loop,
    clippy::range_plus_one,
    clippy::map_unwrap_or,
    clippy::cloned_instead_of_copied,
    clippy::semicolon_if_nothing_returned,
    clippy::must_use_candidate,
    clippy::iter_without_into_iter,
    clippy::uninlined_format_args,
    clippy::ignored_unit_patterns
)]

extern crate alloc;

use core::fmt;

use cranelift_entity::EntityRef;
use function::{Block, Function, Inst, VReg};
use internal::allocator::BlockAllocator;
use reginfo::RegInfo;
use spill_slots::SpillSlots;

// Even when trace logging is disabled, the trace macro has a significant
// performance cost so we disable it in release builds.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}
macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

// Macro for collecting statistics.
macro_rules! stat {
    ($stats:expr, $field:ident) => {
        $stats.$field += 1
    };
    ($stats:expr, $field:ident, $count:expr) => {
        $stats.$field += $count
    };
}

pub mod debug_utils;
pub mod function;
pub mod opcode;
pub mod reginfo;
pub mod spill_slots;

mod internal;

/// Structure holding persistent memory allocations that can be reused across
/// multiple invocations of the register allocator.
///
/// This avoids repeated calls to the memory allocator when compiling multiple
/// functions.
pub struct RegisterAllocator {
    allocator: BlockAllocator,
    stats: Stats,
}

impl Default for RegisterAllocator {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterAllocator {
    /// Creates a new `RegisterAllocator` instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            allocator: BlockAllocator::new(),
            stats: Stats::default(),
        }
    }

    /// Runs the register allocator on every block of `func`.
    ///
    /// On success, every virtual register operand has been replaced with a
    /// physical register and the spill slots used by the inserted spill code
    /// are returned. On failure, the function may be partially rewritten.
    pub fn allocate_function(
        &mut self,
        func: &mut Function,
        reginfo: &impl RegInfo,
        options: &Options,
    ) -> Result<SpillSlots, RegAllocError> {
        trace!("Input function:\n{}", debug_utils::DisplayFunction(func));

        self.stats = Stats::default();
        stat!(self.stats, vregs, func.vregs.len());

        let mut spill_slots = SpillSlots::new(options.frame_size);
        for index in 0..func.blocks.len() {
            let block = Block::new(index);
            self.allocate_block_inner(func, block, reginfo, &mut spill_slots, options)?;
        }

        stat!(self.stats, spillslots, spill_slots.num_slots());
        stat!(self.stats, spill_area_size, spill_slots.spill_area_size() as usize);
        trace!("Output function:\n{}", debug_utils::DisplayFunction(func));
        trace!("{}", self.stats);
        Ok(spill_slots)
    }

    /// Runs the register allocator on a single block of `func`.
    ///
    /// Spill slots are taken from `spill_slots`, which should be shared by
    /// all blocks of the function. Statistics accumulate across calls until
    /// the next [`RegisterAllocator::allocate_function`].
    pub fn allocate_block(
        &mut self,
        func: &mut Function,
        block: Block,
        reginfo: &impl RegInfo,
        spill_slots: &mut SpillSlots,
        options: &Options,
    ) -> Result<(), RegAllocError> {
        self.allocate_block_inner(func, block, reginfo, spill_slots, options)
    }

    fn allocate_block_inner(
        &mut self,
        func: &mut Function,
        block: Block,
        reginfo: &impl RegInfo,
        spill_slots: &mut SpillSlots,
        options: &Options,
    ) -> Result<(), RegAllocError> {
        trace!("Allocating {block}");
        stat!(self.stats, blocks);
        let Function { vregs, blocks } = func;
        self.allocator.run(
            &mut blocks[block],
            vregs,
            reginfo,
            spill_slots,
            options,
            &mut self.stats,
        )
    }

    /// Statistics collected during the last call to
    /// [`RegisterAllocator::allocate_function`], or by the blocks allocated
    /// since then.
    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

/// Configuration options for the register allocator.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct Options {
    /// Don't try to place the source of a register copy in the register of
    /// its destination.
    #[cfg_attr(feature = "clap", arg(long))]
    pub disable_move_coalescing: bool,

    /// Ignore the registers that definitions of a virtual register are fixed
    /// to when choosing a register for its uses.
    #[cfg_attr(feature = "clap", arg(long))]
    pub disable_preferences: bool,

    /// Number of bytes of the stack frame below the frame register that are
    /// already in use. Spill slots are placed below this.
    #[cfg_attr(feature = "clap", arg(long, default_value_t = 0))]
    pub frame_size: u32,
}

#[cfg(feature = "arbitrary")]
impl<'a> arbitrary::Arbitrary<'a> for Options {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self {
            disable_move_coalescing: u.arbitrary()?,
            disable_preferences: u.arbitrary()?,
            frame_size: u.int_in_range(0..=16)? * 4,
        })
    }
}

/// Error returned by the register allocator if allocation is impossible.
///
/// This does not cover errors which are returned by the register info and
/// function validators. If invalid inputs are given then register allocation
/// may panic or produce garbage results.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegAllocError {
    /// A virtual register is used in a block without a preceding definition
    /// in that block.
    UndefinedVReg {
        /// Instruction using the register.
        inst: Inst,
        /// The undefined virtual register.
        vreg: VReg,
    },

    /// The high half of a register pair operand is missing or isn't the
    /// virtual register following the low half.
    MissingRegPairHalf {
        /// Instruction with the malformed pair.
        inst: Inst,
    },

    /// Every register which could be given up for an operand is already
    /// committed to another operand of the same instruction.
    ///
    /// Generally this can only occur due to excessive and/or invalid
    /// constraints on instruction operands, and should be considered a bug in
    /// the client.
    NoSpillCandidate {
        /// Instruction which couldn't be allocated.
        inst: Inst,
    },

    /// The halves of a register pair can't be placed as required by the
    /// pair rule of the instruction.
    UnsupportedRegPair {
        /// Instruction with the pair operand.
        inst: Inst,
    },

    /// The descriptor of an instruction is inconsistent, for example a
    /// two-address instruction without a destination.
    MalformedTarget {
        /// Instruction with the inconsistent descriptor.
        inst: Inst,
    },

    /// The size of the function exceeded some internal limits in the allocator.
    ///
    /// E.g. number of spill slots or size of the stack frame.
    FunctionTooBig,
}

impl fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegAllocError::UndefinedVReg { inst, vreg } => {
                write!(f, "{vreg} used in {inst} without a preceding definition")
            }
            RegAllocError::MissingRegPairHalf { inst } => {
                write!(f, "malformed register pair operand in {inst}")
            }
            RegAllocError::NoSpillCandidate { inst } => {
                write!(f, "no register can be spilled for the operands of {inst}")
            }
            RegAllocError::UnsupportedRegPair { inst } => {
                write!(f, "unsupported register pair placement in {inst}")
            }
            RegAllocError::MalformedTarget { inst } => {
                write!(f, "inconsistent instruction descriptor for {inst}")
            }
            RegAllocError::FunctionTooBig => {
                write!(f, "function size exceeded implementation limits")
            }
        }
    }
}

impl core::error::Error for RegAllocError {}

/// Statistics collected by the register allocator.
///
/// This is an opaque type since the set of statistics may vary between
/// different versions of the register allocator, even across minor versions.
///
/// The only supported operations on this type are:
/// * Default initialization
/// * Printing with `Debug` or `Display`
#[derive(Debug, Default, Clone)]
pub struct Stats {
    // Stats from input function.
    blocks: usize,
    input_insts: usize,
    vregs: usize,

    // Stats from register allocation.
    spilled_vregs: usize,
    coalesced_moves: usize,

    // Stats from inserted instructions.
    copies: usize,
    fixed_copies: usize,
    tied_copies: usize,
    constraint_copies: usize,
    spill_stores: usize,
    reloads: usize,

    // Stats from spill slot allocation.
    spillslots: usize,
    spill_area_size: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:#?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_utils::GenericRegInfo;
    use crate::function::InstData;
    use crate::opcode::Opcode;
    use crate::reginfo::RegBank;

    #[test]
    fn block_stats_accumulate() {
        let reginfo = GenericRegInfo::x86();
        let mut func = Function::new();
        let v0 = func.new_vreg(RegBank::Int);
        let blocks = [func.new_block(), func.new_block()];
        for block in blocks {
            let blk = &mut func.blocks[block];
            blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(1));
            blk.push(InstData::new(Opcode::Ret).srcs([v0]));
        }

        let options = Options::default();
        let mut regalloc = RegisterAllocator::new();
        let mut spill_slots = SpillSlots::new(0);
        let mut allocated = func.clone();
        for block in blocks {
            regalloc
                .allocate_block(&mut allocated, block, &reginfo, &mut spill_slots, &options)
                .unwrap();
        }
        assert_eq!(regalloc.stats().blocks, 2);
        assert_eq!(regalloc.stats().input_insts, 4);

        regalloc
            .allocate_function(&mut func, &reginfo, &options)
            .unwrap();
        assert_eq!(regalloc.stats().blocks, 2);
    }
}
