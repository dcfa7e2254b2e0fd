//! Generic implementation of a [`RegInfo`] which can be used for testing the
//! register allocator.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use super::DisplayRegInfo;
use crate::opcode::{DescTable, InstDesc, Opcode};
use crate::reginfo::{BankOps, PhysReg, PhysRegSet, RegBank, RegInfo, SpillSlotSize};

mod armv7;
mod x86;

/// Description of a single register bank.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BankInfo {
    /// Names of the registers of the bank. The number of names is the number
    /// of registers in the bank.
    pub reg_names: Vec<String>,

    /// Registers available to the local allocator.
    pub local: PhysRegSet,

    /// Registers reserved for cross-block allocation.
    pub global: PhysRegSet,

    /// Bank whose register file this bank shares.
    pub mirror_of: Option<RegBank>,

    /// Size of spill slots for this bank.
    pub spillslot_size: SpillSlotSize,

    /// Opcodes used for spill code and copies.
    pub ops: BankOps,
}

impl BankInfo {
    /// Register names `prefix0`, `prefix1`, ... for a bank of `count`
    /// registers.
    fn numbered(prefix: &str, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                let mut name = String::from(prefix);
                name.push_str(&i.to_string());
                name
            })
            .collect()
    }
}

/// A generic implementation of [`RegInfo`] built from plain data.
///
/// Two example targets are provided: [`GenericRegInfo::x86`], modelled after
/// 32-bit x86 with SSE2, and [`GenericRegInfo::armv7`], modelled after ARMv7
/// with VFP and NEON. The public fields can be modified to experiment with
/// other register configurations.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GenericRegInfo {
    /// Register banks, indexed by [`RegBank::index`].
    pub banks: [BankInfo; RegBank::COUNT],

    /// Integer register used as the base of spill slot accesses.
    pub frame_reg: PhysReg,

    /// Instruction descriptors.
    pub descs: DescTable,
}

impl fmt::Debug for GenericRegInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        DisplayRegInfo(self).fmt(f)
    }
}

impl fmt::Display for GenericRegInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        DisplayRegInfo(self).fmt(f)
    }
}

impl GenericRegInfo {
    /// Constructs a `GenericRegInfo` from an existing object which implements
    /// the [`RegInfo`] trait.
    pub fn from_reginfo(reginfo: &impl RegInfo) -> Self {
        let banks = RegBank::ALL.map(|bank| BankInfo {
            reg_names: (0..reginfo.num_regs(bank))
                .map(|i| reginfo.reg_name(bank, PhysReg::new(i)).to_string())
                .collect(),
            local: reginfo.local_regs(bank),
            global: reginfo.global_regs(bank),
            mirror_of: reginfo.mirror_of(bank),
            spillslot_size: reginfo.spillslot_size(bank),
            ops: reginfo.bank_ops(bank),
        });
        Self {
            banks,
            frame_reg: reginfo.frame_reg(),
            descs: DescTable::build(|opcode| *reginfo.inst_desc(opcode)),
        }
    }

    /// Returns the description of `bank`.
    #[must_use]
    pub fn bank(&self, bank: RegBank) -> &BankInfo {
        &self.banks[bank.index()]
    }

    /// Returns a mutable reference to the description of `bank`.
    pub fn bank_mut(&mut self, bank: RegBank) -> &mut BankInfo {
        &mut self.banks[bank.index()]
    }
}

impl RegInfo for GenericRegInfo {
    #[inline]
    fn num_regs(&self, bank: RegBank) -> usize {
        self.bank(bank).reg_names.len()
    }

    #[inline]
    fn local_regs(&self, bank: RegBank) -> PhysRegSet {
        self.bank(bank).local
    }

    #[inline]
    fn global_regs(&self, bank: RegBank) -> PhysRegSet {
        self.bank(bank).global
    }

    #[inline]
    fn mirror_of(&self, bank: RegBank) -> Option<RegBank> {
        self.bank(bank).mirror_of
    }

    #[inline]
    fn spillslot_size(&self, bank: RegBank) -> SpillSlotSize {
        self.bank(bank).spillslot_size
    }

    #[inline]
    fn bank_ops(&self, bank: RegBank) -> BankOps {
        self.bank(bank).ops
    }

    #[inline]
    fn frame_reg(&self) -> PhysReg {
        self.frame_reg
    }

    #[inline]
    fn inst_desc(&self, opcode: Opcode) -> &InstDesc {
        self.descs.get(opcode)
    }

    fn reg_name(&self, bank: RegBank, reg: PhysReg) -> &str {
        self.bank(bank)
            .reg_names
            .get(reg.index())
            .map_or("<invalid>", String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_utils::validate_reginfo;

    #[test]
    fn example_targets_are_valid() {
        validate_reginfo(&GenericRegInfo::x86()).unwrap();
        validate_reginfo(&GenericRegInfo::armv7()).unwrap();
    }

    #[test]
    fn from_reginfo_round_trips() {
        let x86 = GenericRegInfo::x86();
        assert!(GenericRegInfo::from_reginfo(&x86) == x86);
    }

    #[test]
    fn mirrored_banks() {
        let x86 = GenericRegInfo::x86();
        assert_eq!(x86.reg_file(RegBank::IntRef), RegBank::Int);
        assert_eq!(x86.reg_file(RegBank::Simd), RegBank::Float);
        assert_eq!(x86.reg_file(RegBank::Float), RegBank::Float);
        assert_eq!(x86.reg_name(RegBank::Int, PhysReg::new(1)), "ecx");
        assert_eq!(x86.reg_name(RegBank::Simd, PhysReg::new(3)), "xmm3");
    }

    #[test]
    fn invalid_targets_are_rejected() {
        let mut reginfo = GenericRegInfo::armv7();
        reginfo.bank_mut(RegBank::Int).global.insert(PhysReg::new(0));
        assert!(validate_reginfo(&reginfo).is_err());

        let mut reginfo = GenericRegInfo::x86();
        reginfo.frame_reg = PhysReg::new(0);
        assert!(validate_reginfo(&reginfo).is_err());

        let mut reginfo = GenericRegInfo::x86();
        reginfo.bank_mut(RegBank::Simd).mirror_of = Some(RegBank::IntRef);
        assert!(validate_reginfo(&reginfo).is_err());
    }
}
