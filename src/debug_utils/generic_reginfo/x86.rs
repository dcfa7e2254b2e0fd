//! Example target modelled after 32-bit x86 with SSE2.
//!
//! Only three integer registers are available to the local allocator, and
//! most arithmetic is two-address. Division, shifts, calls and register pairs
//! use fixed registers.

use alloc::string::String;

use super::{BankInfo, GenericRegInfo};
use crate::opcode::{ClobberSpec, DescTable, InstDesc, OperandSpec, Opcode, RegPairRule};
use crate::reginfo::{BankOps, PhysReg, PhysRegSet, RegBank, SpillSlotSize};

const EAX: PhysReg = PhysReg::new(0);
const ECX: PhysReg = PhysReg::new(1);
const EDX: PhysReg = PhysReg::new(2);
const EBX: PhysReg = PhysReg::new(3);
const EBP: PhysReg = PhysReg::new(5);
const ESI: PhysReg = PhysReg::new(6);
const EDI: PhysReg = PhysReg::new(7);
const XMM0: PhysReg = PhysReg::new(0);

const INT_NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];

fn set(regs: &[PhysReg]) -> PhysRegSet {
    regs.iter().copied().collect()
}

fn int_bank(mirror_of: Option<RegBank>, load: Opcode, store: Opcode) -> BankInfo {
    BankInfo {
        reg_names: INT_NAMES.map(String::from).into(),
        local: set(&[EAX, ECX, EDX]),
        global: set(&[EBX, ESI, EDI]),
        mirror_of,
        spillslot_size: SpillSlotSize::new(4),
        ops: BankOps {
            load,
            store,
            move_: Opcode::Move,
        },
    }
}

fn sse_bank(mirror_of: Option<RegBank>, size: u32, ops: BankOps) -> BankInfo {
    BankInfo {
        reg_names: BankInfo::numbered("xmm", 8),
        local: PhysRegSet::first(8),
        global: PhysRegSet::new(),
        mirror_of,
        spillslot_size: SpillSlotSize::new(size),
        ops,
    }
}

fn describe(opcode: Opcode) -> InstDesc {
    // Registers with an 8-bit subregister.
    let byte_regs = set(&[EAX, ECX, EDX, EBX]);
    // Divisor: anything but the dividend and remainder registers.
    let divisor = PhysRegSet::from_bits(!set(&[EAX, EDX]).bits());
    let pair = RegPairRule::Fixed(EDX);

    let desc = opcode.shape();
    match opcode {
        Opcode::Iadd
        | Opcode::Isub
        | Opcode::Imul
        | Opcode::Iand
        | Opcode::Ior
        | Opcode::Ixor
        | Opcode::IaddImm
        | Opcode::Ineg
        | Opcode::Fadd
        | Opcode::Fsub
        | Opcode::Fmul
        | Opcode::Xadd => desc.clobber(ClobberSpec::Dest1),
        Opcode::Ishl => desc
            .dest(OperandSpec::new(RegBank::Int).restrict(set(&[EAX, EDX, EBX, ESI, EDI])))
            .fixed_src(1, ECX)
            .clobber(ClobberSpec::Dest1),
        Opcode::Idiv => desc
            .fixed_dest(EAX)
            .fixed_src(0, EAX)
            .src(1, OperandSpec::new(RegBank::Int).restrict(divisor))
            .clobber(ClobberSpec::Reg(RegBank::Int, EDX)),
        Opcode::Irem => desc
            .fixed_dest(EDX)
            .fixed_src(0, EAX)
            .src(1, OperandSpec::new(RegBank::Int).restrict(divisor))
            .clobber(ClobberSpec::Reg(RegBank::Int, EAX)),
        Opcode::Iceq => desc.dest(OperandSpec::new(RegBank::Int).restrict(byte_regs)),
        Opcode::Lneg | Opcode::LaddImm => desc.pair_rule(pair).clobber(ClobberSpec::Dest1),
        Opcode::Lconst
        | Opcode::LoadI8Membase
        | Opcode::StoreI8MembaseReg
        | Opcode::LconvToI4 => desc.pair_rule(pair),
        // cdq: sign-extends eax into edx.
        Opcode::IconvToI8 => desc.pair_rule(pair).fixed_dest(EAX).fixed_src(0, EAX),
        Opcode::Call | Opcode::CallReg => desc.fixed_dest(EAX),
        Opcode::Fcall => desc.fixed_dest(XMM0),
        Opcode::Lcall => desc.pair_rule(pair).fixed_dest(EAX),
        // lock cmpxchg: the comparand and the result are in eax.
        Opcode::AtomicCas => desc.fixed_dest(EAX).fixed_src(2, EAX),
        Opcode::CopyBlock => desc.fixed_src(0, EAX).fixed_src(1, EDX).fixed_src(2, ECX),
        Opcode::Ret => desc.fixed_src(0, EAX),
        Opcode::Iconst
        | Opcode::Move
        | Opcode::Fmove
        | Opcode::Xmove
        | Opcode::LoadMembase
        | Opcode::StoreMembaseReg
        | Opcode::LoadR8Membase
        | Opcode::StoreR8MembaseReg
        | Opcode::LoadXMembase
        | Opcode::StoreXMembaseReg
        | Opcode::LoadRefMembase
        | Opcode::StoreRefMembaseReg
        | Opcode::Ldaddr
        | Opcode::Fconst
        | Opcode::Xsplat
        | Opcode::FconvToI
        | Opcode::IconvToF
        | Opcode::VoidCall => desc,
    }
}

impl GenericRegInfo {
    /// Example target modelled after 32-bit x86 with SSE2.
    ///
    /// * `eax`, `ecx` and `edx` are local; `ebx`, `esi` and `edi` are global
    ///   and `ebp` is the frame register.
    /// * Integer and float arithmetic is two-address.
    /// * Shifts take their amount in `ecx`, division uses `eax` and `edx`.
    /// * Register pairs have their high half in `edx`.
    /// * Reference and managed pointer banks are mirrored onto the integer
    ///   bank, and the SIMD bank is mirrored onto the float bank.
    #[must_use]
    pub fn x86() -> Self {
        let banks = [
            int_bank(None, Opcode::LoadMembase, Opcode::StoreMembaseReg),
            int_bank(
                Some(RegBank::Int),
                Opcode::LoadRefMembase,
                Opcode::StoreRefMembaseReg,
            ),
            int_bank(Some(RegBank::Int), Opcode::LoadMembase, Opcode::StoreMembaseReg),
            sse_bank(
                None,
                8,
                BankOps {
                    load: Opcode::LoadR8Membase,
                    store: Opcode::StoreR8MembaseReg,
                    move_: Opcode::Fmove,
                },
            ),
            sse_bank(
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
            frame_reg: EBP,
            descs: DescTable::build(describe),
        }
    }
}
