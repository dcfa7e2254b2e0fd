//! Example target modelled after ARMv7 with VFP and NEON.
//!
//! Instructions are three-address and 64-bit values live in even/odd register
//! pairs.

use alloc::string::String;
use alloc::vec::Vec;

use super::{BankInfo, GenericRegInfo};
use crate::opcode::{DescTable, InstDesc, Opcode, RegPairRule};
use crate::reginfo::{BankOps, PhysReg, PhysRegSet, RegBank, SpillSlotSize};

const R0: PhysReg = PhysReg::new(0);
const R1: PhysReg = PhysReg::new(1);
const R2: PhysReg = PhysReg::new(2);
const FP: PhysReg = PhysReg::new(11);
const D0: PhysReg = PhysReg::new(0);

fn int_names() -> Vec<String> {
    let mut names = BankInfo::numbered("r", 11);
    names.extend(["fp", "ip", "sp", "lr", "pc"].map(String::from));
    names
}

fn int_bank(mirror_of: Option<RegBank>, load: Opcode, store: Opcode) -> BankInfo {
    BankInfo {
        reg_names: int_names(),
        // r0-r3 and ip.
        local: PhysRegSet::first(4) | PhysRegSet::single(PhysReg::new(12)),
        // r4-r10.
        global: PhysRegSet::from_bits(0x7f0),
        mirror_of,
        spillslot_size: SpillSlotSize::new(4),
        ops: BankOps {
            load,
            store,
            move_: Opcode::Move,
        },
    }
}

fn vfp_bank(mirror_of: Option<RegBank>, size: u32, ops: BankOps) -> BankInfo {
    BankInfo {
        reg_names: BankInfo::numbered("d", 16),
        local: PhysRegSet::first(8),
        global: PhysRegSet::from_bits(0xff00),
        mirror_of,
        spillslot_size: SpillSlotSize::new(size),
        ops,
    }
}

fn describe(opcode: Opcode) -> InstDesc {
    let desc = opcode.shape().pair_rule(RegPairRule::Adjacent);
    match opcode {
        Opcode::Call | Opcode::CallReg | Opcode::Lcall => desc.fixed_dest(R0),
        Opcode::Fcall => desc.fixed_dest(D0),
        Opcode::CopyBlock => desc.fixed_src(0, R0).fixed_src(1, R1).fixed_src(2, R2),
        Opcode::Ret => desc.fixed_src(0, R0),
        _ => desc,
    }
}

impl GenericRegInfo {
    /// Example target modelled after ARMv7 with VFP and NEON.
    ///
    /// * `r0`-`r3` and `ip` are local; `r4`-`r10` are global and `fp` is the
    ///   frame register.
    /// * `d0`-`d7` are local and `d8`-`d15` are global.
    /// * Register pairs use an even register for the low half and the
    ///   following odd register for the high half.
    /// * Calls return in `r0` (`r0:r1` for pairs) or `d0`.
    #[must_use]
    pub fn armv7() -> Self {
        let banks = [
            int_bank(None, Opcode::LoadMembase, Opcode::StoreMembaseReg),
            int_bank(
                Some(RegBank::Int),
                Opcode::LoadRefMembase,
                Opcode::StoreRefMembaseReg,
            ),
            int_bank(Some(RegBank::Int), Opcode::LoadMembase, Opcode::StoreMembaseReg),
            vfp_bank(
                None,
                8,
                BankOps {
                    load: Opcode::LoadR8Membase,
                    store: Opcode::StoreR8MembaseReg,
                    move_: Opcode::Fmove,
                },
            ),
            vfp_bank(
                Some(RegBank::Float),
                16,
                BankOps {
                    load: Opcode::LoadXMembase,
                    store: Opcode::StoreXMembaseReg,
                    move_: Opcode::Xmove,
                },
            ),
        ];
        Self {
            banks,
            frame_reg: FP,
            descs: DescTable::build(describe),
        }
    }
}
