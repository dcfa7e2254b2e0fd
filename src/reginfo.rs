//! Register bank catalog for the target architecture.
//!
//! The [`RegInfo`] trait describes the physical registers available to the
//! allocator, grouped into [`RegBank`]s.
//!
//! # Register banks
//!
//! Each virtual register belongs to one of a fixed set of banks: general
//! integer registers, integer registers holding GC-tracked references,
//! integer registers holding managed (interior) pointers, floating-point
//! registers and SIMD registers.
//!
//! Physical registers are numbered per bank, from 0 up to the capacity of the
//! bank. Registers are partitioned into *local* registers, which this
//! allocator freely assigns within a block, and *global* registers which are
//! owned by a cross-block allocator and are never assigned or freed here.
//!
//! # Mirrored banks
//!
//! A bank may be mirrored onto another bank with [`RegInfo::mirror_of`]. Both
//! banks then share one physical register file: allocating register `%3` in
//! one of them makes `%3` unavailable in the other. The integer reference
//! banks are normally mirrored onto the general integer bank, and on many
//! targets the SIMD bank is mirrored onto the floating-point bank.
//!
//! # Spill slots and bank operations
//!
//! Each bank specifies the size of its spill slots and the opcodes used to
//! load, store and copy a register of that bank. The allocator uses these
//! opcodes for every instruction it inserts.

use core::{fmt, ops};

use crate::opcode::{InstDesc, Opcode};

/// Maximum number of physical registers in a single bank.
pub const MAX_REGS_PER_BANK: usize = 64;

/// A class of registers with uniform size, move, load and store semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegBank {
    /// General-purpose integer registers.
    Int,

    /// Integer registers holding a reference tracked by the garbage
    /// collector.
    IntRef,

    /// Integer registers holding a managed pointer into the middle of an
    /// object.
    IntMp,

    /// Floating-point registers.
    Float,

    /// Vector registers.
    Simd,
}

impl RegBank {
    /// Number of register banks.
    pub const COUNT: usize = 5;

    /// All register banks, in index order.
    pub const ALL: [RegBank; Self::COUNT] = [
        RegBank::Int,
        RegBank::IntRef,
        RegBank::IntMp,
        RegBank::Float,
        RegBank::Simd,
    ];

    /// Index of the bank in [`RegBank::ALL`].
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Name used in the text format.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            RegBank::Int => "int",
            RegBank::IntRef => "ref",
            RegBank::IntMp => "mp",
            RegBank::Float => "float",
            RegBank::Simd => "simd",
        }
    }

    /// Looks up a bank by its text-format name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|bank| bank.name() == name)
    }
}

impl fmt::Display for RegBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A physical register, numbered within its bank.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhysReg(u8);

impl PhysReg {
    /// Creates a `PhysReg` from its index in the bank.
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        debug_assert!(index < MAX_REGS_PER_BANK);
        Self(index as u8)
    }

    /// Index of the register within its bank.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Debug for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A set of physical registers of one bank, stored as a bitmask.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhysRegSet(u64);

impl PhysRegSet {
    /// Returns an empty set.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Returns a set containing only `reg`.
    #[inline]
    #[must_use]
    pub const fn single(reg: PhysReg) -> Self {
        Self(1 << reg.0)
    }

    /// Returns a set containing the first `count` registers of a bank.
    #[inline]
    #[must_use]
    pub const fn first(count: usize) -> Self {
        if count >= 64 {
            Self(!0)
        } else {
            Self((1 << count) - 1)
        }
    }

    /// Constructs a set from its raw bitmask.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bitmask of the set.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether the set is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of registers in the set.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether `reg` is in the set.
    #[inline]
    #[must_use]
    pub const fn contains(self, reg: PhysReg) -> bool {
        self.0 & (1 << reg.0) != 0
    }

    /// Adds `reg` to the set.
    #[inline]
    pub fn insert(&mut self, reg: PhysReg) {
        self.0 |= 1 << reg.0;
    }

    /// Removes `reg` from the set.
    #[inline]
    pub fn remove(&mut self, reg: PhysReg) {
        self.0 &= !(1 << reg.0);
    }

    /// Returns the lowest-numbered register in the set.
    #[inline]
    #[must_use]
    pub const fn first_reg(self) -> Option<PhysReg> {
        if self.0 == 0 {
            None
        } else {
            Some(PhysReg(self.0.trailing_zeros() as u8))
        }
    }

    /// Whether every register of `self` is also in `other`.
    #[inline]
    #[must_use]
    pub const fn is_subset(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Iterates over the registers of the set in increasing order.
    #[inline]
    #[must_use]
    pub fn iter(self) -> PhysRegSetIter {
        PhysRegSetIter(self.0)
    }
}

impl IntoIterator for PhysRegSet {
    type Item = PhysReg;
    type IntoIter = PhysRegSetIter;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<PhysReg> for PhysRegSet {
    fn from_iter<T: IntoIterator<Item = PhysReg>>(iter: T) -> Self {
        let mut set = Self::new();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

/// Iterator over the registers of a [`PhysRegSet`].
#[derive(Clone)]
pub struct PhysRegSetIter(u64);

impl Iterator for PhysRegSetIter {
    type Item = PhysReg;

    #[inline]
    fn next(&mut self) -> Option<PhysReg> {
        if self.0 == 0 {
            return None;
        }
        let reg = PhysReg(self.0.trailing_zeros() as u8);
        self.0 &= self.0 - 1;
        Some(reg)
    }
}

impl ops::BitOr for PhysRegSet {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for PhysRegSet {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for PhysRegSet {
    type Output = Self;

    #[inline]
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl ops::BitAndAssign for PhysRegSet {
    #[inline]
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl ops::Sub for PhysRegSet {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl ops::SubAssign for PhysRegSet {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        self.0 &= !rhs.0;
    }
}

impl fmt::Debug for PhysRegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for PhysRegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, reg) in self.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{reg}")?;
        }
        write!(f, "}}")
    }
}

/// Size of a spill slot, as a power of two number of bytes.
///
/// Spill slots are always aligned to their size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpillSlotSize(u8);

impl fmt::Display for SpillSlotSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

impl SpillSlotSize {
    /// Returns a `SpillSlotSize` of `bytes` bytes.
    ///
    /// `bytes` must be a power of two.
    #[inline]
    #[must_use]
    pub const fn new(bytes: u32) -> Self {
        debug_assert!(bytes.is_power_of_two());
        Self::from_log2_bytes(bytes.trailing_zeros())
    }

    /// Returns a `SpillSlotSize` of `1 << log2_bytes` bytes.
    ///
    /// `log2_bytes` must be less than 16.
    #[inline]
    #[must_use]
    pub const fn from_log2_bytes(log2_bytes: u32) -> Self {
        debug_assert!(log2_bytes < 16);
        Self(log2_bytes as u8)
    }

    /// Returns the size of the spill slot in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u32 {
        1 << self.log2_bytes()
    }

    /// Returns the log2 of the size of the spill slot in bytes.
    #[inline]
    #[must_use]
    pub const fn log2_bytes(self) -> u32 {
        self.0 as u32
    }
}

/// Opcodes used by the allocator when inserting instructions for a bank.
///
/// * `load` has the shape `dest = load base, #offset`.
/// * `store` has the shape `base = store value, #offset` where the
///   destination is the base address register.
/// * `move_` has the shape `dest = move src`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BankOps {
    /// Load from memory into a register.
    pub load: Opcode,

    /// Store a register to memory.
    pub store: Opcode,

    /// Register-to-register copy.
    pub move_: Opcode,
}

/// Trait used by the register allocator to query the register bank catalog
/// and the instruction descriptors of the target.
///
/// The information returned by this trait must remain the same for a whole
/// compiled method.
pub trait RegInfo {
    /// Number of physical registers in `bank`.
    ///
    /// This is at most [`MAX_REGS_PER_BANK`]. A bank which the target does
    /// not support has no registers.
    fn num_regs(&self, bank: RegBank) -> usize;

    /// Registers of `bank` which the local allocator may freely assign.
    fn local_regs(&self, bank: RegBank) -> PhysRegSet;

    /// Registers of `bank` reserved for cross-block allocation.
    ///
    /// These are never assigned, freed or reassigned by the local allocator.
    fn global_regs(&self, bank: RegBank) -> PhysRegSet;

    /// Bank whose register file `bank` shares, if any.
    ///
    /// The mirrored-onto bank must not itself be mirrored.
    fn mirror_of(&self, bank: RegBank) -> Option<RegBank>;

    /// Bank which owns the register file used by `bank`.
    #[inline]
    fn reg_file(&self, bank: RegBank) -> RegBank {
        self.mirror_of(bank).unwrap_or(bank)
    }

    /// Size of the spill slots used for values of `bank`.
    fn spillslot_size(&self, bank: RegBank) -> SpillSlotSize;

    /// Opcodes used to load, store and copy registers of `bank`.
    fn bank_ops(&self, bank: RegBank) -> BankOps;

    /// Global integer register used as the base for spill slot accesses.
    fn frame_reg(&self) -> PhysReg;

    /// Register constraints of `opcode` on this target.
    fn inst_desc(&self, opcode: Opcode) -> &InstDesc;

    /// Human-readable name of a register, for diagnostics.
    fn reg_name(&self, bank: RegBank, reg: PhysReg) -> &str;
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    #[test]
    fn set_operations() {
        let mut set = PhysRegSet::first(4);
        assert_eq!(set.len(), 4);
        set.remove(PhysReg::new(1));
        assert!(!set.contains(PhysReg::new(1)));
        assert!(set.contains(PhysReg::new(3)));
        assert_eq!(set.first_reg(), Some(PhysReg::new(0)));

        let other = PhysRegSet::single(PhysReg::new(3)) | PhysRegSet::single(PhysReg::new(9));
        assert_eq!((set & other).iter().collect::<Vec<_>>(), [PhysReg::new(3)]);
        assert_eq!(
            (set - other).iter().collect::<Vec<_>>(),
            [PhysReg::new(0), PhysReg::new(2)]
        );
        assert!(PhysRegSet::single(PhysReg::new(2)).is_subset(set));
        assert!(!other.is_subset(set));
        assert_eq!(PhysRegSet::new().first_reg(), None);
        assert_eq!(PhysRegSet::first(64).len(), 64);
    }

    #[test]
    fn spillslot_size() {
        assert_eq!(SpillSlotSize::new(8).log2_bytes(), 3);
        assert_eq!(SpillSlotSize::from_log2_bytes(4).bytes(), 16);
    }

    #[test]
    fn bank_names() {
        for bank in RegBank::ALL {
            assert_eq!(RegBank::from_name(bank.name()), Some(bank));
        }
        assert_eq!(RegBank::from_name("gpr"), None);
    }
}
