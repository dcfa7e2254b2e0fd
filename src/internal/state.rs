//! Register assignment state maintained during the backward pass.
//!
//! Every virtual register is either unbound, bound to a local register of its
//! bank's register file, or spilled to a stack slot. The register file of a
//! mirrored bank is shared with the bank it mirrors, so the state is kept per
//! register file rather than per bank.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{PrimaryMap, SecondaryMap};

use crate::function::VReg;
use crate::reginfo::{PhysReg, PhysRegSet, RegBank, RegInfo, MAX_REGS_PER_BANK};
use crate::spill_slots::SpillSlot;

/// Current location of a virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Assignment {
    /// Not live after the current point of the backward pass.
    #[default]
    Unbound,

    /// Lives in a local register.
    Reg(PhysReg),

    /// Lives in a spill slot. The register it was evicted from is reloaded
    /// from the slot after the evicting instruction.
    Spilled(SpillSlot),
}

/// State of one register file.
#[derive(Clone)]
struct RegFile {
    /// Local registers of the file.
    local: PhysRegSet,

    /// Local registers with no occupant.
    free: PhysRegSet,

    /// Virtual register occupying each register.
    occupant: [PackedOption<VReg>; MAX_REGS_PER_BANK],
}

impl RegFile {
    fn new() -> Self {
        Self {
            local: PhysRegSet::new(),
            free: PhysRegSet::new(),
            occupant: [None.into(); MAX_REGS_PER_BANK],
        }
    }
}

pub struct AllocState {
    assignments: SecondaryMap<VReg, Assignment>,
    vreg_file: SecondaryMap<VReg, RegBank>,
    files: [RegFile; RegBank::COUNT],
}

impl AllocState {
    pub fn new() -> Self {
        Self {
            assignments: SecondaryMap::new(),
            vreg_file: SecondaryMap::with_default(RegBank::Int),
            files: core::array::from_fn(|_| RegFile::new()),
        }
    }

    /// Resets the state for a new block: every virtual register is unbound
    /// and every local register is free.
    pub fn reset(&mut self, vregs: &PrimaryMap<VReg, RegBank>, reginfo: &impl RegInfo) {
        self.assignments.clear();
        self.vreg_file.clear();
        for (vreg, &bank) in vregs {
            self.vreg_file[vreg] = reginfo.reg_file(bank);
        }
        for bank in RegBank::ALL {
            let file = &mut self.files[bank.index()];
            file.local = if reginfo.reg_file(bank) == bank {
                reginfo.local_regs(bank)
            } else {
                PhysRegSet::new()
            };
            file.free = file.local;
            file.occupant = [None.into(); MAX_REGS_PER_BANK];
        }
    }

    /// Register file holding `vreg`.
    #[inline]
    pub fn file_of(&self, vreg: VReg) -> RegBank {
        self.vreg_file[vreg]
    }

    #[inline]
    pub fn assignment(&self, vreg: VReg) -> Assignment {
        self.assignments[vreg]
    }

    /// Local registers of `file`.
    #[inline]
    pub fn local_regs(&self, file: RegBank) -> PhysRegSet {
        self.files[file.index()].local
    }

    /// Local registers of `file` with no occupant.
    #[inline]
    pub fn free_regs(&self, file: RegBank) -> PhysRegSet {
        self.files[file.index()].free
    }

    /// Local registers of `file` holding a virtual register.
    #[inline]
    pub fn occupied_regs(&self, file: RegBank) -> PhysRegSet {
        let file = &self.files[file.index()];
        file.local - file.free
    }

    #[inline]
    pub fn occupant(&self, file: RegBank, reg: PhysReg) -> Option<VReg> {
        self.files[file.index()].occupant[reg.index()].expand()
    }

    /// Binds `vreg` to the free local register `reg`, dropping any previous
    /// binding.
    pub fn assign(&mut self, vreg: VReg, reg: PhysReg) {
        self.unbind(vreg);
        let file = &mut self.files[self.vreg_file[vreg].index()];
        debug_assert!(file.free.contains(reg), "{reg} is not free");
        file.free.remove(reg);
        file.occupant[reg.index()] = vreg.into();
        self.assignments[vreg] = Assignment::Reg(reg);
    }

    /// Marks `vreg` as living in `slot`, freeing its register.
    pub fn set_spilled(&mut self, vreg: VReg, slot: SpillSlot) {
        self.unbind(vreg);
        self.assignments[vreg] = Assignment::Spilled(slot);
    }

    /// Releases `vreg` at its definition: the register it was bound to, if
    /// any, becomes free.
    pub fn release(&mut self, vreg: VReg) -> Option<PhysReg> {
        let reg = self.unbind(vreg);
        self.assignments[vreg] = Assignment::Unbound;
        reg
    }

    fn unbind(&mut self, vreg: VReg) -> Option<PhysReg> {
        let Assignment::Reg(reg) = self.assignments[vreg] else {
            return None;
        };
        let file = &mut self.files[self.vreg_file[vreg].index()];
        debug_assert_eq!(file.occupant[reg.index()].expand(), Some(vreg));
        file.free.insert(reg);
        file.occupant[reg.index()] = None.into();
        self.assignments[vreg] = Assignment::Unbound;
        Some(reg)
    }

    /// Whether every local register of every file is free.
    pub fn all_free(&self) -> bool {
        self.files.iter().all(|file| file.free == file.local)
    }
}
