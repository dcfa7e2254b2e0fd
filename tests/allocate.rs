//! End-to-end tests: functions are validated, allocated and then verified with
//! the checker.

use local_regalloc::debug_utils::{self, GenericRegInfo};
use local_regalloc::function::{Block, Function, Inst, InstData, InstFlags, Reg};
use local_regalloc::opcode::Opcode;
use local_regalloc::reginfo::{PhysReg, PhysRegSet, RegBank, RegInfo};
use local_regalloc::spill_slots::SpillSlots;
use local_regalloc::{Options, RegAllocError, RegisterAllocator};

const EAX: PhysReg = PhysReg::new(0);
const ECX: PhysReg = PhysReg::new(1);
const EDX: PhysReg = PhysReg::new(2);
const EBX: PhysReg = PhysReg::new(3);
const ESI: PhysReg = PhysReg::new(6);

fn allocate_with(
    func: &Function,
    reginfo: &impl RegInfo,
    options: &Options,
) -> (Function, SpillSlots) {
    debug_utils::validate_function(func, reginfo).unwrap();
    let mut allocated = func.clone();
    let spill_slots = RegisterAllocator::new()
        .allocate_function(&mut allocated, reginfo, options)
        .unwrap();
    debug_utils::check_function(reginfo, func, &allocated, &spill_slots).unwrap();
    (allocated, spill_slots)
}

fn allocate(func: &Function, reginfo: &impl RegInfo) -> (Function, SpillSlots) {
    allocate_with(func, reginfo, &Options::default())
}

/// Instructions of `block` in program order.
fn insts(func: &Function, block: Block) -> Vec<(Inst, InstData)> {
    let block = &func.blocks[block];
    block.iter().map(|inst| (inst, block[inst].clone())).collect()
}

/// Position of the original instruction `inst` in the allocated block.
fn position(insts: &[(Inst, InstData)], inst: Inst) -> usize {
    insts.iter().position(|&(i, _)| i == inst).unwrap()
}

/// ARMv7 with only `r0` and `r1` available to the local allocator.
fn armv7_two_locals() -> GenericRegInfo {
    let mut reginfo = GenericRegInfo::armv7();
    let local = PhysRegSet::first(2);
    for bank in [RegBank::Int, RegBank::IntRef, RegBank::IntMp] {
        reginfo.bank_mut(bank).local = local;
    }
    reginfo
}

#[test]
fn values_live_across_call_are_spilled() {
    let reginfo = armv7_two_locals();
    let mut func = Function::new();
    let b = func.new_block();
    let v1 = func.new_vreg(RegBank::Int);
    let v2 = func.new_vreg(RegBank::Int);
    let v3 = func.new_vreg(RegBank::Int);
    let v4 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(v1).imm(5));
    blk.push(InstData::new(Opcode::Iconst).dest(v2).imm(7));
    blk.push(InstData::new(Opcode::Iadd).dest(v3).srcs([v1, v2]));
    let call =
        blk.push(InstData::new(Opcode::VoidCall).call_arg(v3, RegBank::Int, PhysReg::new(0)));
    let add = blk.push(InstData::new(Opcode::Iadd).dest(v4).srcs([v3, v1]));

    let (allocated, spill_slots) = allocate(&func, &reginfo);
    assert_eq!(spill_slots.num_slots(), 2);

    let insts = insts(&allocated, b);
    let call_pos = position(&insts, call);
    let add_pos = position(&insts, add);
    assert!(insts[..call_pos]
        .iter()
        .any(|(_, data)| data.flags == InstFlags::SPILL));
    assert!(insts[call_pos + 1..add_pos]
        .iter()
        .any(|(_, data)| data.flags == InstFlags::RELOAD));
    assert_eq!(
        insts[call_pos].1.call_args[0].value,
        Reg::Phys(PhysReg::new(0))
    );
}

#[test]
fn division_uses_fixed_registers() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let v: Vec<_> = (0..5).map(|_| func.new_vreg(RegBank::Int)).collect();
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(v[0]).imm(100));
    blk.push(InstData::new(Opcode::Iconst).dest(v[1]).imm(7));
    let div = blk.push(InstData::new(Opcode::Idiv).dest(v[2]).srcs([v[0], v[1]]));
    let rem = blk.push(InstData::new(Opcode::Irem).dest(v[3]).srcs([v[0], v[1]]));
    blk.push(InstData::new(Opcode::Iadd).dest(v[4]).srcs([v[2], v[3]]));
    blk.push(InstData::new(Opcode::Ret).srcs([v[4]]));

    let (allocated, _) = allocate(&func, &reginfo);
    let blk = &allocated.blocks[b];
    assert_eq!(blk[div].dest, Reg::Phys(EAX));
    assert_eq!(blk[div].srcs[0], Reg::Phys(EAX));
    assert_eq!(blk[rem].dest, Reg::Phys(EDX));
    assert_eq!(blk[rem].srcs[0], Reg::Phys(EAX));
    for inst in [div, rem] {
        assert_eq!(blk[inst].srcs[1], Reg::Phys(ECX));
    }
}

#[test]
fn shift_amount_in_ecx() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg(RegBank::Int);
    let v1 = func.new_vreg(RegBank::Int);
    let v2 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(1));
    blk.push(InstData::new(Opcode::Iconst).dest(v1).imm(3));
    let shl = blk.push(InstData::new(Opcode::Ishl).dest(v2).srcs([v0, v1]));
    blk.push(InstData::new(Opcode::Ret).srcs([v2]));

    let (allocated, spill_slots) = allocate(&func, &reginfo);
    assert_eq!(spill_slots.num_slots(), 0);
    let data = &allocated.blocks[b][shl];
    assert_eq!(data.srcs[1], Reg::Phys(ECX));
    assert_eq!(data.dest, data.srcs[0]);
    assert_ne!(data.dest, Reg::Phys(ECX));
}

#[test]
fn restricted_global_destination_goes_through_copy() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg(RegBank::Int);
    let v1 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(1));
    blk.push(InstData::new(Opcode::Iconst).dest(v1).imm(2));
    let iceq = blk.push(InstData::new(Opcode::Iceq).dest(ESI).srcs([v0, v1]));

    let (allocated, _) = allocate(&func, &reginfo);
    let insts = insts(&allocated, b);
    let pos = position(&insts, iceq);
    let tmp = insts[pos].1.dest;
    assert_ne!(tmp, Reg::Phys(ESI));
    let (_, copy) = &insts[pos + 1];
    assert_eq!(copy.flags, InstFlags::COPY);
    assert_eq!(copy.dest, Reg::Phys(ESI));
    assert_eq!(copy.srcs[0], tmp);
}

#[test]
fn register_pairs_use_edx_for_high_half() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg_pair(RegBank::Int);
    let v2 = func.new_vreg_pair(RegBank::Int);
    let v4 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    let lconst = blk.push(InstData::new(Opcode::Lconst).dest_pair(v0).imm(5));
    let lneg = blk.push(InstData::new(Opcode::Lneg).dest_pair(v2).src1_pair(v0));
    blk.push(InstData::new(Opcode::LconvToI4).dest(v4).src1_pair(v2));
    blk.push(InstData::new(Opcode::Ret).srcs([v4]));

    let (allocated, _) = allocate(&func, &reginfo);
    let blk = &allocated.blocks[b];
    assert_eq!(blk[lconst].dest_high, Reg::Phys(EDX));
    assert_eq!(blk[lneg].dest_high, Reg::Phys(EDX));
    assert_eq!(blk[lneg].dest, blk[lneg].srcs[0]);
    assert_eq!(blk[lneg].dest_high, blk[lneg].src1_high);
}

#[test]
fn adjacent_register_pairs() {
    let reginfo = GenericRegInfo::armv7();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg_pair(RegBank::Int);
    let v2 = func.new_vreg_pair(RegBank::Int);
    let blk = &mut func.blocks[b];
    let lconst = blk.push(InstData::new(Opcode::Lconst).dest_pair(v0).imm(-1));
    let ladd = blk.push(InstData::new(Opcode::LaddImm).dest_pair(v2).src1_pair(v0).imm(1));
    let store = blk.push(
        InstData::new(Opcode::StoreI8MembaseReg)
            .dest(PhysReg::new(4))
            .src1_pair(v2),
    );

    let (allocated, _) = allocate(&func, &reginfo);
    let blk = &allocated.blocks[b];
    for (low, high) in [
        (blk[lconst].dest, blk[lconst].dest_high),
        (blk[ladd].dest, blk[ladd].dest_high),
        (blk[ladd].srcs[0], blk[ladd].src1_high),
        (blk[store].srcs[0], blk[store].src1_high),
    ] {
        let (low, high) = (low.phys().unwrap(), high.phys().unwrap());
        assert_eq!(low.index() % 2, 0);
        assert_eq!(high.index(), low.index() + 1);
    }
    assert_eq!(blk[store].dest, Reg::Phys(PhysReg::new(4)));
}

#[test]
fn call_arguments_and_result() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg(RegBank::Int);
    let v1 = func.new_vreg(RegBank::Int);
    let v2 = func.new_vreg(RegBank::Int);
    let v3 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(1));
    blk.push(InstData::new(Opcode::Iconst).dest(v1).imm(2));
    let call = blk.push(
        InstData::new(Opcode::Call)
            .dest(v2)
            .call_arg(v0, RegBank::Int, ECX)
            .call_arg(v1, RegBank::Int, EDX),
    );
    blk.push(InstData::new(Opcode::Iadd).dest(v3).srcs([v2, v0]));
    blk.push(InstData::new(Opcode::Ret).srcs([v3]));

    let (allocated, spill_slots) = allocate(&func, &reginfo);
    assert_eq!(spill_slots.num_slots(), 1);
    let insts = insts(&allocated, b);
    let pos = position(&insts, call);
    let data = &insts[pos].1;
    assert_eq!(data.dest, Reg::Phys(EAX));
    assert_eq!(data.call_args[0].value, Reg::Phys(ECX));
    assert_eq!(data.call_args[1].value, Reg::Phys(EDX));
    assert_eq!(insts[pos + 1].1.flags, InstFlags::RELOAD);
}

#[test]
fn copy_block_moves_globals_into_fixed_registers() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(64));
    let copy = blk.push(InstData::new(Opcode::CopyBlock).srcs([
        Reg::Phys(EBX),
        Reg::Virt(v0),
        Reg::Phys(ESI),
    ]));

    let (allocated, _) = allocate(&func, &reginfo);
    assert_eq!(
        allocated.blocks[b][copy].srcs,
        [Reg::Phys(EAX), Reg::Phys(EDX), Reg::Phys(ECX)]
    );
}

#[test]
fn global_registers_are_never_overwritten() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(EBX).imm(1));
    let add = blk.push(InstData::new(Opcode::Iadd).dest(v0).srcs([EBX, EBX]));
    blk.push(InstData::new(Opcode::Ret).srcs([v0]));

    let (allocated, _) = allocate(&func, &reginfo);
    let insts = insts(&allocated, b);
    for (_, data) in &insts {
        if !data.flags.is_empty() {
            assert_ne!(data.dest, Reg::Phys(EBX));
        }
    }
    let data = &insts[position(&insts, add)].1;
    assert_eq!(data.dest, Reg::Phys(EAX));
    assert_eq!(data.srcs, [Reg::Phys(EAX), Reg::Phys(EBX), Reg::None]);
}

/// Defines `count` values and then sums them, so that all of them are live at
/// the first addition.
fn sum_of_constants(count: usize) -> (Function, Block) {
    let mut func = Function::new();
    let b = func.new_block();
    let values: Vec<_> = (0..count).map(|_| func.new_vreg(RegBank::Int)).collect();
    for (i, &v) in values.iter().enumerate() {
        func.blocks[b].push(InstData::new(Opcode::Iconst).dest(v).imm(i as i64));
    }
    let mut acc = values[0];
    for &v in &values[1..] {
        let sum = func.new_vreg(RegBank::Int);
        func.blocks[b].push(InstData::new(Opcode::Iadd).dest(sum).srcs([acc, v]));
        acc = sum;
    }
    func.blocks[b].push(InstData::new(Opcode::Ret).srcs([acc]));
    (func, b)
}

#[test]
fn spills_only_beyond_local_capacity() {
    let reginfo = GenericRegInfo::x86();

    let (func, _) = sum_of_constants(3);
    let (_, spill_slots) = allocate(&func, &reginfo);
    assert_eq!(spill_slots.num_slots(), 0);

    let (func, b) = sum_of_constants(5);
    let (allocated, spill_slots) = allocate(&func, &reginfo);
    assert!(spill_slots.num_slots() >= 1);
    let insts = insts(&allocated, b);
    assert!(insts.iter().any(|(_, data)| data.flags == InstFlags::SPILL));
    assert!(insts.iter().any(|(_, data)| data.flags == InstFlags::RELOAD));
}

#[test]
fn spill_slots_below_existing_frame() {
    let reginfo = GenericRegInfo::x86();
    let (func, _) = sum_of_constants(6);
    let options = Options {
        frame_size: 16,
        ..Options::default()
    };
    let (_, spill_slots) = allocate_with(&func, &reginfo, &options);
    assert!(spill_slots.spill_area_size() > 0);
    assert_eq!(
        spill_slots.area_size(),
        16 + spill_slots.spill_area_size()
    );
    for (_, _, offset) in spill_slots.assigned() {
        assert!(offset <= -20);
    }
}

#[test]
fn options_do_not_affect_correctness() {
    let reginfo = GenericRegInfo::armv7();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg(RegBank::Int);
    let v1 = func.new_vreg(RegBank::Int);
    let v2 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(3));
    blk.push(InstData::new(Opcode::Move).dest(v1).srcs([v0]));
    blk.push(InstData::new(Opcode::Iadd).dest(v2).srcs([v0, v1]));
    blk.push(InstData::new(Opcode::Move).dest(PhysReg::new(4)).srcs([v2]));
    blk.push(InstData::new(Opcode::Ret).srcs([v1]));

    for disable_move_coalescing in [false, true] {
        for disable_preferences in [false, true] {
            let options = Options {
                disable_move_coalescing,
                disable_preferences,
                ..Options::default()
            };
            allocate_with(&func, &reginfo, &options);
        }
    }
}

#[test]
fn blocks_share_spill_slots() {
    let reginfo = GenericRegInfo::x86();
    let (mut func, first) = sum_of_constants(5);
    // Virtual registers are local to a block, so the copy can reuse them.
    let second = func.new_block();
    func.blocks[second] = func.blocks[first].clone();

    let options = Options::default();
    let mut regalloc = RegisterAllocator::new();
    let mut spill_slots = SpillSlots::new(0);
    let mut allocated = func.clone();
    regalloc
        .allocate_block(&mut allocated, first, &reginfo, &mut spill_slots, &options)
        .unwrap();
    let first_slots = spill_slots.num_slots();
    assert!(first_slots >= 1);
    regalloc
        .allocate_block(&mut allocated, second, &reginfo, &mut spill_slots, &options)
        .unwrap();
    assert_eq!(spill_slots.num_slots(), 2 * first_slots);
    for block in [first, second] {
        debug_utils::check_block(&reginfo, &func, &allocated, block, &spill_slots).unwrap();
    }
}

#[test]
fn undefined_virtual_register() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg(RegBank::Int);
    let v1 = func.new_vreg(RegBank::Int);
    let inst = func.blocks[b].push(InstData::new(Opcode::Move).dest(v1).srcs([v0]));

    assert!(debug_utils::validate_function(&func, &reginfo).is_err());
    let err = RegisterAllocator::new()
        .allocate_function(&mut func, &reginfo, &Options::default())
        .unwrap_err();
    assert_eq!(err, RegAllocError::UndefinedVReg { inst, vreg: v0 });
}

#[test]
fn fixed_source_that_is_redefined() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg(RegBank::Int);
    let v1 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(3));
    blk.push(InstData::new(Opcode::Iconst).dest(v1).imm(1));
    let square = blk.push(InstData::new(Opcode::Ishl).dest(v0).srcs([v0, v0]));
    let shift = blk.push(InstData::new(Opcode::Ishl).dest(v1).srcs([v1, v0]));
    blk.push(InstData::new(Opcode::Ret).srcs([v1]));

    let (allocated, _) = allocate(&func, &reginfo);
    let blk = &allocated.blocks[b];
    for inst in [square, shift] {
        assert_eq!(blk[inst].srcs[1], Reg::Phys(ECX));
        assert_eq!(blk[inst].dest, blk[inst].srcs[0]);
    }
}

#[test]
fn managed_pointer_spilled_across_call() {
    let reginfo = GenericRegInfo::armv7();
    let mut func = Function::new();
    let b = func.new_block();
    let base = func.new_vreg(RegBank::Int);
    let ptr = func.new_vreg(RegBank::IntMp);
    let v2 = func.new_vreg(RegBank::Int);
    let v3 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(base).imm(64));
    blk.push(InstData::new(Opcode::Ldaddr).dest(ptr).srcs([base]).imm(8));
    blk.push(InstData::new(Opcode::IaddImm).dest(v2).srcs([ptr]).imm(1));
    blk.push(InstData::new(Opcode::VoidCall));
    blk.push(InstData::new(Opcode::IaddImm).dest(v3).srcs([ptr]).imm(2));

    let (allocated, spill_slots) = allocate(&func, &reginfo);
    assert_eq!(spill_slots.num_slots(), 1);
    let insts = insts(&allocated, b);
    let offsets = |flags| {
        insts
            .iter()
            .filter(|(_, data)| data.flags == flags)
            .map(|(_, data)| data.imm)
            .collect::<Vec<_>>()
    };
    let stores = offsets(InstFlags::SPILL);
    assert_eq!(stores.len(), 1);
    assert_eq!(stores, offsets(InstFlags::RELOAD));
}

#[test]
fn pair_low_half_reused_after_call() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let lo = func.new_vreg_pair(RegBank::Int);
    let hi = lo.pair_high();
    let sum = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    let call = blk.push(InstData::new(Opcode::Lcall).dest_pair(lo));
    blk.push(InstData::new(Opcode::IaddImm).dest(sum).srcs([lo]).imm(4));
    blk.push(InstData::new(Opcode::Iadd).dest(lo).srcs([sum, lo]));
    blk.push(InstData::new(Opcode::LoadMembase).dest(hi).srcs([sum]));

    let (allocated, _) = allocate(&func, &reginfo);
    let data = &allocated.blocks[b][call];
    assert_eq!(data.dest, Reg::Phys(EAX));
    assert_eq!(data.dest_high, Reg::Phys(EDX));
}

#[test]
fn pair_store_based_on_its_high_half() {
    let reginfo = GenericRegInfo::armv7();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg_pair(RegBank::Int);
    let v2 = func.new_vreg_pair(RegBank::Int);
    let v3 = v2.pair_high();
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Lconst).dest_pair(v0).imm(5));
    blk.push(InstData::new(Opcode::LaddImm).dest_pair(v2).src1_pair(v0).imm(1));
    let store = blk.push(InstData::new(Opcode::StoreI8MembaseReg).dest(v3).src1_pair(v2));

    let (allocated, _) = allocate(&func, &reginfo);
    let data = &allocated.blocks[b][store];
    assert_eq!(data.dest, data.src1_high);
    let low = data.srcs[0].phys().unwrap();
    assert_eq!(low.index() % 2, 0);
}

#[test]
fn live_source_moves_out_of_fixed_destination() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg(RegBank::Int);
    let v1 = func.new_vreg(RegBank::Int);
    let v2 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(10));
    blk.push(InstData::new(Opcode::Iconst).dest(v1).imm(3));
    let div = blk.push(InstData::new(Opcode::Idiv).dest(v2).srcs([v0, v1]));
    blk.push(InstData::new(Opcode::StoreMembaseReg).dest(v2).srcs([v0]));

    let (allocated, _) = allocate(&func, &reginfo);
    let data = &allocated.blocks[b][div];
    assert_eq!(data.dest, Reg::Phys(EAX));
    assert_eq!(data.srcs[0], Reg::Phys(EAX));
}

#[test]
fn two_address_into_global_register() {
    let reginfo = GenericRegInfo::x86();
    let mut func = Function::new();
    let b = func.new_block();
    let v0 = func.new_vreg(RegBank::Int);
    let v1 = func.new_vreg(RegBank::Int);
    let blk = &mut func.blocks[b];
    blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(6));
    blk.push(InstData::new(Opcode::Iconst).dest(v1).imm(7));
    let mul = blk.push(InstData::new(Opcode::Imul).dest(ESI).srcs([v0, v1]));
    let add = blk.push(
        InstData::new(Opcode::Iadd)
            .dest(ESI)
            .srcs([Reg::Virt(v1), Reg::Phys(ESI)]),
    );

    let (allocated, _) = allocate(&func, &reginfo);
    let insts = insts(&allocated, b);
    let pos = position(&insts, mul);
    let data = &insts[pos].1;
    assert_eq!(data.dest, Reg::Phys(ESI));
    assert_eq!(data.srcs[0], Reg::Phys(ESI));
    let (_, copy) = &insts[pos - 1];
    assert_eq!(copy.flags, InstFlags::COPY);
    assert_eq!(copy.dest, Reg::Phys(ESI));

    // The old value of esi is read from another register once esi has been
    // overwritten with the first source.
    let data = &insts[position(&insts, add)].1;
    assert_eq!(data.srcs[0], Reg::Phys(ESI));
    assert_ne!(data.srcs[1], Reg::Phys(ESI));
}
