//! Opcodes and per-target register constraint descriptors.
//!
//! The set of opcodes is closed: every target describes every [`Opcode`]
//! with an [`InstDesc`], usually by starting from [`Opcode::shape`] and
//! adding target-specific constraints in an exhaustive `match`. The resulting
//! [`DescTable`] is built once and is read-only afterwards, so it can be shared
//! between any number of concurrent compilations.

use core::fmt;
use core::str::FromStr;

use crate::reginfo::{PhysReg, PhysRegSet, RegBank};

macro_rules! opcodes {
    ($($(#[$attr:meta])* $name:ident => $text:literal,)*) => {
        /// Abstract operation of an instruction, as produced by instruction
        /// selection.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
        pub enum Opcode {
            $($(#[$attr])* $name,)*
        }

        impl Opcode {
            /// All opcodes, in index order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            /// Number of opcodes.
            pub const COUNT: usize = Self::ALL.len();

            /// Name of the opcode in the text format.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => $text,)*
                }
            }
        }
    };
}

opcodes! {
    /// `dest = iconst #imm`
    Iconst => "iconst",
    /// `dest = move src`
    Move => "move",
    /// `dest = fmove src`
    Fmove => "fmove",
    /// `dest = xmove src`
    Xmove => "xmove",
    /// `dest = iadd a, b`
    Iadd => "iadd",
    /// `dest = isub a, b`
    Isub => "isub",
    /// `dest = imul a, b`
    Imul => "imul",
    /// `dest = iand a, b`
    Iand => "iand",
    /// `dest = ior a, b`
    Ior => "ior",
    /// `dest = ixor a, b`
    Ixor => "ixor",
    /// `dest = iadd_imm a, #imm`
    IaddImm => "iadd_imm",
    /// `dest = ineg a`
    Ineg => "ineg",
    /// `dest = ishl a, amount`
    Ishl => "ishl",
    /// `dest = idiv a, b`
    Idiv => "idiv",
    /// `dest = irem a, b`
    Irem => "irem",
    /// `dest = iceq a, b`: 1 if equal, 0 otherwise.
    Iceq => "iceq",
    /// `dest = load_membase base, #offset`
    LoadMembase => "load_membase",
    /// `base = store_membase_reg value, #offset`
    StoreMembaseReg => "store_membase_reg",
    /// `dest = loadr8_membase base, #offset`
    LoadR8Membase => "loadr8_membase",
    /// `base = storer8_membase_reg value, #offset`
    StoreR8MembaseReg => "storer8_membase_reg",
    /// `dest = loadx_membase base, #offset`
    LoadXMembase => "loadx_membase",
    /// `base = storex_membase_reg value, #offset`
    StoreXMembaseReg => "storex_membase_reg",
    /// `dest = loadref_membase base, #offset`: loads a GC reference.
    LoadRefMembase => "loadref_membase",
    /// `base = storeref_membase_reg value, #offset`: stores a GC reference.
    StoreRefMembaseReg => "storeref_membase_reg",
    /// `dest = ldaddr base, #offset`: managed pointer into an object.
    Ldaddr => "ldaddr",
    /// `dest = fconst #bits`
    Fconst => "fconst",
    /// `dest = fadd a, b`
    Fadd => "fadd",
    /// `dest = fsub a, b`
    Fsub => "fsub",
    /// `dest = fmul a, b`
    Fmul => "fmul",
    /// `dest = xadd a, b`
    Xadd => "xadd",
    /// `dest = xsplat a`: broadcasts a float into every lane.
    Xsplat => "xsplat",
    /// `dest = fconv_to_i a`
    FconvToI => "fconv_to_i",
    /// `dest = iconv_to_f a`
    IconvToF => "iconv_to_f",
    /// `dest:dest_high = lconst #imm`
    Lconst => "lconst",
    /// `dest:dest_high = lneg a:a_high`
    Lneg => "lneg",
    /// `dest:dest_high = ladd_imm a:a_high, #imm`
    LaddImm => "ladd_imm",
    /// `dest:dest_high = loadi8_membase base, #offset`
    LoadI8Membase => "loadi8_membase",
    /// `base = storei8_membase_reg value:value_high, #offset`
    StoreI8MembaseReg => "storei8_membase_reg",
    /// `dest:dest_high = iconv_to_i8 a`: sign extension.
    IconvToI8 => "iconv_to_i8",
    /// `dest = lconv_to_i4 a:a_high`: truncation.
    LconvToI4 => "lconv_to_i4",
    /// `dest = call (args)`
    Call => "call",
    /// `dest = call_reg target (args)`
    CallReg => "call_reg",
    /// `voidcall (args)`
    VoidCall => "voidcall",
    /// `dest = fcall (args)`
    Fcall => "fcall",
    /// `dest:dest_high = lcall (args)`
    Lcall => "lcall",
    /// `dest = atomic_cas base, new, comparand`: returns the old value.
    AtomicCas => "atomic_cas",
    /// `copy_block dst, src, len`: helper call copying `len` bytes.
    CopyBlock => "copy_block",
    /// `ret value`
    Ret => "ret",
}

impl Opcode {
    /// Index of the opcode in [`Opcode::ALL`].
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Register shape of the opcode, common to all targets: which operands
    /// exist, their banks and whether they are register pairs.
    ///
    /// Register pairs default to [`RegPairRule::Any`] and calls clobber every
    /// local register. Targets add fixed registers, restrictions and
    /// two-address constraints on top of this.
    #[must_use]
    pub const fn shape(self) -> InstDesc {
        use RegBank::*;
        let int = OperandSpec::new(Int);
        let pair = OperandSpec::new(Int).pair(RegPairRule::Any);
        match self {
            Opcode::Iconst | Opcode::Lconst => {
                let dest = if matches!(self, Opcode::Lconst) {
                    pair
                } else {
                    int
                };
                InstDesc::new().dest(dest)
            }
            Opcode::Move => InstDesc::new().dest(int).src(0, int),
            Opcode::Fmove => InstDesc::unary(Float, Float),
            Opcode::Xmove => InstDesc::unary(Simd, Simd),
            Opcode::Iadd
            | Opcode::Isub
            | Opcode::Imul
            | Opcode::Iand
            | Opcode::Ior
            | Opcode::Ixor
            | Opcode::Ishl
            | Opcode::Idiv
            | Opcode::Irem
            | Opcode::Iceq => InstDesc::binary(Int),
            Opcode::IaddImm | Opcode::Ineg => InstDesc::unary(Int, Int),
            Opcode::LoadMembase => InstDesc::unary(Int, Int),
            Opcode::LoadR8Membase => InstDesc::unary(Float, Int),
            Opcode::LoadXMembase => InstDesc::unary(Simd, Int),
            Opcode::LoadRefMembase => InstDesc::unary(IntRef, Int),
            Opcode::Ldaddr => InstDesc::unary(IntMp, Int),
            Opcode::StoreMembaseReg => InstDesc::store(Int),
            Opcode::StoreR8MembaseReg => InstDesc::store(Float),
            Opcode::StoreXMembaseReg => InstDesc::store(Simd),
            Opcode::StoreRefMembaseReg => InstDesc::store(IntRef),
            Opcode::Fconst => InstDesc::new().dest(OperandSpec::new(Float)),
            Opcode::Fadd | Opcode::Fsub | Opcode::Fmul => InstDesc::binary(Float),
            Opcode::Xadd => InstDesc::binary(Simd),
            Opcode::Xsplat => InstDesc::unary(Simd, Float),
            Opcode::FconvToI => InstDesc::unary(Int, Float),
            Opcode::IconvToF => InstDesc::unary(Float, Int),
            Opcode::Lneg | Opcode::LaddImm => InstDesc::new().dest(pair).src(0, pair),
            Opcode::LoadI8Membase | Opcode::IconvToI8 => InstDesc::new().dest(pair).src(0, int),
            Opcode::StoreI8MembaseReg => {
                let mut desc = InstDesc::new().dest(int).src(0, pair);
                desc.dest_is_base = true;
                desc
            }
            Opcode::LconvToI4 => InstDesc::new().dest(int).src(0, pair),
            Opcode::Call => InstDesc::new().dest(int).clobber(ClobberSpec::Call),
            Opcode::CallReg => InstDesc::new()
                .dest(int)
                .src(0, int)
                .clobber(ClobberSpec::Call),
            Opcode::VoidCall => InstDesc::new().clobber(ClobberSpec::Call),
            Opcode::Fcall => InstDesc::new()
                .dest(OperandSpec::new(Float))
                .clobber(ClobberSpec::Call),
            Opcode::Lcall => InstDesc::new().dest(pair).clobber(ClobberSpec::Call),
            Opcode::AtomicCas => InstDesc::binary(Int).src(2, int),
            Opcode::CopyBlock => InstDesc::new()
                .src(0, int)
                .src(1, int)
                .src(2, int)
                .clobber(ClobberSpec::Call),
            Opcode::Ret => InstDesc::new().src(0, int),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown opcode name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownOpcode;

impl fmt::Display for UnknownOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown opcode")
    }
}

impl FromStr for Opcode {
    type Err = UnknownOpcode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.name() == s)
            .ok_or(UnknownOpcode)
    }
}

/// Placement rule for the high half of a register pair, relative to the
/// register chosen for the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegPairRule {
    /// The high half always lives in this register.
    Fixed(PhysReg),

    /// The low half is an even register and the high half is the next one.
    Adjacent,

    /// The high half may be any register other than the low half.
    Any,
}

impl RegPairRule {
    /// Registers of `local` that may hold the low half of a pair.
    #[must_use]
    pub fn low_mask(self, local: PhysRegSet) -> PhysRegSet {
        match self {
            RegPairRule::Fixed(high) => local - PhysRegSet::single(high),
            RegPairRule::Adjacent => {
                // Even registers whose odd partner is also available.
                let even = PhysRegSet::from_bits(0x5555_5555_5555_5555);
                PhysRegSet::from_bits((local & even).bits() & (local.bits() >> 1))
            }
            RegPairRule::Any => local,
        }
    }

    /// Registers of `local` that may hold the high half of a pair whose low
    /// half is in `low`.
    #[must_use]
    pub fn high_mask(self, low: PhysReg, local: PhysRegSet) -> PhysRegSet {
        match self {
            RegPairRule::Fixed(high) => PhysRegSet::single(high) & local,
            RegPairRule::Adjacent => {
                if low.index() % 2 == 0 && low.index() + 1 < 64 {
                    PhysRegSet::single(PhysReg::new(low.index() + 1)) & local
                } else {
                    PhysRegSet::new()
                }
            }
            RegPairRule::Any => local - PhysRegSet::single(low),
        }
    }
}

/// Register constraints on one operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OperandSpec {
    /// Bank of the operand.
    pub bank: RegBank,

    /// Physical register the operand must be placed in.
    pub fixed: Option<PhysReg>,

    /// If set, the operand is a register pair: the low half is the operand
    /// itself and the high half is the following virtual register.
    pub pair: Option<RegPairRule>,

    /// If set, the operand may only be placed in these registers.
    pub restrict: Option<PhysRegSet>,
}

impl OperandSpec {
    /// An unconstrained operand in `bank`.
    #[inline]
    #[must_use]
    pub const fn new(bank: RegBank) -> Self {
        Self {
            bank,
            fixed: None,
            pair: None,
            restrict: None,
        }
    }

    /// Pins the operand to `reg`.
    #[inline]
    #[must_use]
    pub const fn fixed(mut self, reg: PhysReg) -> Self {
        self.fixed = Some(reg);
        self
    }

    /// Makes the operand a register pair.
    #[inline]
    #[must_use]
    pub const fn pair(mut self, rule: RegPairRule) -> Self {
        self.pair = Some(rule);
        self
    }

    /// Restricts the operand to `regs`.
    #[inline]
    #[must_use]
    pub const fn restrict(mut self, regs: PhysRegSet) -> Self {
        self.restrict = Some(regs);
        self
    }

    /// Registers allowed by the restriction, or `all` if unrestricted.
    #[inline]
    #[must_use]
    pub fn allowed(&self, all: PhysRegSet) -> PhysRegSet {
        match self.restrict {
            Some(restrict) => all & restrict,
            None => all,
        }
    }
}

/// Registers clobbered by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ClobberSpec {
    /// Only the destination is written.
    #[default]
    None,

    /// Two-address encoding: the destination and the first source must be
    /// the same register.
    Dest1,

    /// A call: every local register of every bank is clobbered. Call
    /// argument registers are taken from the instruction's argument list.
    Call,

    /// A single register of the given bank is clobbered.
    Reg(RegBank, PhysReg),
}

/// Register constraints of an opcode on a particular target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstDesc {
    /// Destination operand.
    pub dest: Option<OperandSpec>,

    /// The destination is not written: it holds the base address of a store
    /// and is read like a source.
    pub dest_is_base: bool,

    /// Source operands.
    pub srcs: [Option<OperandSpec>; 3],

    /// Registers clobbered by the instruction.
    pub clobber: ClobberSpec,
}

impl Default for InstDesc {
    fn default() -> Self {
        Self::new()
    }
}

impl InstDesc {
    /// A descriptor without operands.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dest: None,
            dest_is_base: false,
            srcs: [None; 3],
            clobber: ClobberSpec::None,
        }
    }

    const fn unary(dest: RegBank, src: RegBank) -> Self {
        Self::new()
            .dest(OperandSpec::new(dest))
            .src(0, OperandSpec::new(src))
    }

    const fn binary(bank: RegBank) -> Self {
        Self::unary(bank, bank).src(1, OperandSpec::new(bank))
    }

    const fn store(value: RegBank) -> Self {
        let mut desc = Self::new()
            .dest(OperandSpec::new(RegBank::Int))
            .src(0, OperandSpec::new(value));
        desc.dest_is_base = true;
        desc
    }

    /// Replaces the destination operand.
    #[inline]
    #[must_use]
    pub const fn dest(mut self, spec: OperandSpec) -> Self {
        self.dest = Some(spec);
        self
    }

    /// Replaces source operand `index`.
    #[inline]
    #[must_use]
    pub const fn src(mut self, index: usize, spec: OperandSpec) -> Self {
        self.srcs[index] = Some(spec);
        self
    }

    /// Replaces the clobber kind.
    #[inline]
    #[must_use]
    pub const fn clobber(mut self, clobber: ClobberSpec) -> Self {
        self.clobber = clobber;
        self
    }

    /// Pins the destination to `reg`.
    #[must_use]
    pub fn fixed_dest(mut self, reg: PhysReg) -> Self {
        if let Some(dest) = &mut self.dest {
            dest.fixed = Some(reg);
        }
        self
    }

    /// Pins source `index` to `reg`.
    #[must_use]
    pub fn fixed_src(mut self, index: usize, reg: PhysReg) -> Self {
        if let Some(src) = &mut self.srcs[index] {
            src.fixed = Some(reg);
        }
        self
    }

    /// Replaces the pair rule of every register pair operand.
    #[must_use]
    pub fn pair_rule(mut self, rule: RegPairRule) -> Self {
        for spec in self.dest.iter_mut().chain(self.srcs.iter_mut().flatten()) {
            if spec.pair.is_some() {
                spec.pair = Some(rule);
            }
        }
        self
    }

    /// Iterates over the source operand specs, including a base destination.
    pub fn uses(&self) -> impl Iterator<Item = OperandSpec> + '_ {
        let base = if self.dest_is_base { self.dest } else { None };
        base.into_iter().chain(self.srcs.iter().flatten().copied())
    }

    /// Whether the instruction writes its destination operand.
    #[inline]
    #[must_use]
    pub fn defines_dest(&self) -> bool {
        self.dest.is_some() && !self.dest_is_base
    }

    /// Registers of `bank` that some operand of this instruction is pinned
    /// to, including fixed halves of register pairs.
    #[must_use]
    pub fn fixed_regs(&self, bank: RegBank) -> PhysRegSet {
        let mut set = PhysRegSet::new();
        for spec in self.dest.iter().chain(self.srcs.iter().flatten()) {
            if spec.bank != bank {
                continue;
            }
            if let Some(reg) = spec.fixed {
                set.insert(reg);
            }
            if let Some(RegPairRule::Fixed(reg)) = spec.pair {
                set.insert(reg);
            }
        }
        set
    }
}

/// Descriptor table of a target, indexed by [`Opcode`].
///
/// The table is built once from a description function and never mutated
/// afterwards.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DescTable {
    #[cfg_attr(feature = "serde", serde(with = "desc_array"))]
    descs: [InstDesc; Opcode::COUNT],
}

impl DescTable {
    /// Builds the table by calling `describe` once for every opcode.
    pub fn build(mut describe: impl FnMut(Opcode) -> InstDesc) -> Self {
        let mut descs = [InstDesc::new(); Opcode::COUNT];
        for &op in Opcode::ALL {
            descs[op.index()] = describe(op);
        }
        Self { descs }
    }

    /// Descriptor of `opcode`.
    #[inline]
    #[must_use]
    pub fn get(&self, opcode: Opcode) -> &InstDesc {
        &self.descs[opcode.index()]
    }
}

impl fmt::Debug for DescTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(Opcode::ALL.iter().map(|&op| (op, self.get(op))))
            .finish()
    }
}

#[cfg(feature = "serde")]
mod desc_array {
    use alloc::vec::Vec;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{InstDesc, Opcode};

    pub fn serialize<S: Serializer>(
        descs: &[InstDesc; Opcode::COUNT],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        descs[..].serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[InstDesc; Opcode::COUNT], D::Error> {
        let descs = Vec::<InstDesc>::deserialize(deserializer)?;
        descs
            .try_into()
            .map_err(|_| D::Error::custom("wrong number of opcode descriptors"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_names_round_trip() {
        for &op in Opcode::ALL {
            assert_eq!(op.name().parse::<Opcode>(), Ok(op));
        }
        assert_eq!("frobnicate".parse::<Opcode>(), Err(UnknownOpcode));
    }

    #[test]
    fn pair_masks() {
        let local = PhysRegSet::first(4) | PhysRegSet::single(PhysReg::new(12));
        let low = RegPairRule::Adjacent.low_mask(local);
        assert_eq!(low, PhysRegSet::single(PhysReg::new(0)) | PhysRegSet::single(PhysReg::new(2)));
        assert_eq!(
            RegPairRule::Adjacent.high_mask(PhysReg::new(2), local),
            PhysRegSet::single(PhysReg::new(3))
        );
        assert!(RegPairRule::Adjacent
            .high_mask(PhysReg::new(12), local)
            .is_empty());
        assert_eq!(
            RegPairRule::Any.high_mask(PhysReg::new(1), local).len(),
            4
        );
    }

    #[test]
    fn table_lookup() {
        let table = DescTable::build(|op| match op {
            Opcode::Iadd => op.shape().clobber(ClobberSpec::Dest1),
            _ => op.shape(),
        });
        assert_eq!(table.get(Opcode::Iadd).clobber, ClobberSpec::Dest1);
        assert!(table.get(Opcode::StoreMembaseReg).dest_is_base);
        assert!(!table.get(Opcode::StoreMembaseReg).defines_dest());
        assert_eq!(table.get(Opcode::Call).clobber, ClobberSpec::Call);
    }
}
