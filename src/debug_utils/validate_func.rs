//! Function validation.

use anyhow::{bail, ensure, Result};
use cranelift_entity::{EntityRef, EntitySet};

use crate::function::{Block, Function, Inst, InstData, Reg, VReg};
use crate::opcode::{ClobberSpec, OperandSpec};
use crate::reginfo::{PhysRegSet, RegBank, RegInfo};

/// Checks `func` to ensure it satisfies all of the pre-conditions required by
/// the register allocator when allocating for `reginfo`.
///
/// `reginfo` is assumed to already have been checked with
/// [`validate_reginfo`](super::validate_reginfo).
pub fn validate_function(func: &Function, reginfo: &impl RegInfo) -> Result<()> {
    let mut ctx = Context {
        func,
        reginfo,
        defined: EntitySet::new(),
    };
    for block in func.blocks.keys() {
        ctx.check_block(block)?;
    }
    Ok(())
}

/// State used for validation.
struct Context<'a, R> {
    func: &'a Function,
    reginfo: &'a R,

    /// Virtual registers defined so far in the current block.
    defined: EntitySet<VReg>,
}

impl<R: RegInfo> Context<'_, R> {
    fn check_block(&mut self, block: Block) -> Result<()> {
        self.defined.clear();
        let data = &self.func.blocks[block];
        for inst in data {
            self.check_inst(inst, &data[inst])
                .map_err(|err| err.context(alloc::format!("{block}: {inst}")))?;
        }
        Ok(())
    }

    fn check_inst(&mut self, inst: Inst, data: &InstData) -> Result<()> {
        let desc = self.reginfo.inst_desc(data.opcode);
        let opcode = data.opcode;
        ensure!(
            data.flags.is_empty(),
            "{inst}: Allocator flags on an input instruction"
        );

        // Operand presence must match the descriptor.
        ensure!(
            desc.dest.is_some() == data.dest.is_some(),
            "{inst}: {opcode} destination operand mismatch"
        );
        for (index, (spec, src)) in desc.srcs.iter().zip(data.srcs).enumerate() {
            ensure!(
                spec.is_some() == src.is_some(),
                "{inst}: {opcode} source {} operand mismatch",
                index + 1
            );
        }
        let dest_pair = desc.dest.is_some_and(|spec| spec.pair.is_some());
        let src_pair = desc.srcs[0].is_some_and(|spec| spec.pair.is_some());
        ensure!(
            dest_pair == data.dest_high.is_some(),
            "{inst}: {opcode} destination register pair mismatch"
        );
        ensure!(
            src_pair == data.src1_high.is_some(),
            "{inst}: {opcode} source register pair mismatch"
        );

        // Uses are checked before the definition.
        if desc.dest_is_base {
            if let Some(spec) = desc.dest {
                self.check_use(inst, data.dest, spec.bank)?;
            }
        }
        for (spec, &src) in desc.srcs.iter().zip(&data.srcs) {
            if let Some(spec) = spec {
                self.check_use(inst, src, spec.bank)?;
            }
        }
        if let Some(spec) = desc.srcs[0].filter(|_| src_pair) {
            self.check_pair(inst, data.srcs[0], data.src1_high, spec)?;
            self.check_use(inst, data.src1_high, spec.bank)?;
        }
        self.check_call_args(inst, data, desc.clobber)?;

        if let Some(spec) = desc.dest.filter(|_| desc.defines_dest()) {
            self.check_operand(inst, data.dest, spec.bank)?;
            if dest_pair {
                self.check_pair(inst, data.dest, data.dest_high, spec)?;
                self.check_operand(inst, data.dest_high, spec.bank)?;
            }
            for reg in [data.dest, data.dest_high] {
                if let Reg::Virt(vreg) = reg {
                    self.defined.insert(vreg);
                }
            }
        }
        Ok(())
    }

    fn check_use(&self, inst: Inst, reg: Reg, bank: RegBank) -> Result<()> {
        self.check_operand(inst, reg, bank)?;
        if let Reg::Virt(vreg) = reg {
            ensure!(
                self.defined.contains(vreg),
                "{inst}: {vreg} used without a preceding definition in the block"
            );
        }
        Ok(())
    }

    /// Checks that an operand is a valid virtual register of a compatible
    /// bank, or a physical register owned by the cross-block allocator.
    fn check_operand(&self, inst: Inst, reg: Reg, bank: RegBank) -> Result<()> {
        match reg {
            Reg::None => bail!("{inst}: Missing operand"),
            Reg::Virt(vreg) => {
                ensure!(
                    vreg.index() < self.func.vregs.len(),
                    "{inst}: {vreg} is not declared"
                );
                let vreg_bank = self.func.vregs[vreg];
                // References and managed pointers are integers and may be
                // used by any integer operand.
                let compatible = vreg_bank == bank
                    || (bank == RegBank::Int
                        && matches!(vreg_bank, RegBank::IntRef | RegBank::IntMp));
                ensure!(
                    compatible,
                    "{inst}: {vreg} of bank {vreg_bank} used as a {bank} operand"
                );
            }
            Reg::Phys(reg) => {
                let file = self.reginfo.reg_file(bank);
                let frame = file == RegBank::Int && reg == self.reginfo.frame_reg();
                ensure!(
                    frame || self.reginfo.global_regs(file).contains(reg),
                    "{inst}: {reg} is neither a global register nor the frame register"
                );
            }
        }
        Ok(())
    }

    fn check_pair(&self, inst: Inst, low: Reg, high: Reg, spec: OperandSpec) -> Result<()> {
        let (Reg::Virt(low), Reg::Virt(high)) = (low, high) else {
            bail!("{inst}: Register pair operands must be virtual registers");
        };
        ensure!(
            high == low.pair_high(),
            "{inst}: High half {high} must directly follow the low half {low}"
        );
        ensure!(
            high.index() < self.func.vregs.len()
                && self.func.vregs[high] == self.func.vregs[low]
                && self.func.vregs[low] == spec.bank,
            "{inst}: Register pair halves {low} and {high} must be in bank {}",
            spec.bank
        );
        Ok(())
    }

    fn check_call_args(&self, inst: Inst, data: &InstData, clobber: ClobberSpec) -> Result<()> {
        if data.call_args.is_empty() {
            return Ok(());
        }
        ensure!(
            clobber == ClobberSpec::Call,
            "{inst}: Call arguments on a non-call instruction"
        );
        let desc = self.reginfo.inst_desc(data.opcode);
        let mut used = [PhysRegSet::new(); RegBank::COUNT];
        for arg in &data.call_args {
            let file = self.reginfo.reg_file(arg.bank);
            let reg = arg.reg;
            ensure!(
                self.reginfo.local_regs(file).contains(reg),
                "{inst}: Argument register {reg} is not a local register"
            );
            ensure!(
                !used[file.index()].contains(reg),
                "{inst}: Argument register {reg} used twice"
            );
            used[file.index()].insert(reg);

            // Sources pinned to the same register would need two values in
            // it at once.
            for spec in desc.uses() {
                ensure!(
                    self.reginfo.reg_file(spec.bank) != file || spec.fixed != Some(reg),
                    "{inst}: Argument register {reg} is also fixed for a source"
                );
            }
            self.check_use(inst, arg.value, arg.bank)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_utils::GenericRegInfo;
    use crate::function::InstData;
    use crate::opcode::Opcode;
    use crate::reginfo::PhysReg;

    #[test]
    fn valid_function() {
        let reginfo = GenericRegInfo::x86();
        let mut func = Function::new();
        let b = func.new_block();
        let v0 = func.new_vreg(RegBank::Int);
        let v1 = func.new_vreg(RegBank::IntRef);
        let pair = func.new_vreg_pair(RegBank::Int);
        let blk = &mut func.blocks[b];
        blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(3));
        blk.push(
            InstData::new(Opcode::LoadRefMembase)
                .dest(v1)
                .srcs([PhysReg::new(5)])
                .imm(8),
        );
        blk.push(InstData::new(Opcode::Iadd).dest(v0).srcs([v0, v1]));
        blk.push(InstData::new(Opcode::IconvToI8).dest_pair(pair).srcs([v0]));
        blk.push(
            InstData::new(Opcode::VoidCall)
                .call_arg(v0, RegBank::Int, PhysReg::new(1))
                .call_arg(PhysReg::new(3), RegBank::Int, PhysReg::new(2)),
        );
        validate_function(&func, &reginfo).unwrap();
    }

    #[test]
    fn undefined_use() {
        let reginfo = GenericRegInfo::x86();
        let mut func = Function::new();
        let b = func.new_block();
        let v0 = func.new_vreg(RegBank::Int);
        let v1 = func.new_vreg(RegBank::Int);
        func.blocks[b].push(InstData::new(Opcode::Move).dest(v1).srcs([v0]));
        assert!(validate_function(&func, &reginfo).is_err());
    }

    #[test]
    fn local_physical_operand() {
        let reginfo = GenericRegInfo::x86();
        let mut func = Function::new();
        let b = func.new_block();
        let v0 = func.new_vreg(RegBank::Int);
        func.blocks[b].push(InstData::new(Opcode::Move).dest(v0).srcs([PhysReg::new(0)]));
        assert!(validate_function(&func, &reginfo).is_err());
    }

    #[test]
    fn bank_mismatch() {
        let reginfo = GenericRegInfo::x86();
        let mut func = Function::new();
        let b = func.new_block();
        let f = func.new_vreg(RegBank::Float);
        let v = func.new_vreg(RegBank::Int);
        let blk = &mut func.blocks[b];
        blk.push(InstData::new(Opcode::Fconst).dest(f));
        blk.push(InstData::new(Opcode::Move).dest(v).srcs([f]));
        assert!(validate_function(&func, &reginfo).is_err());
    }

    #[test]
    fn broken_pair() {
        let reginfo = GenericRegInfo::armv7();
        let mut func = Function::new();
        let b = func.new_block();
        let v0 = func.new_vreg(RegBank::Int);
        let v1 = func.new_vreg(RegBank::Int);
        let v2 = func.new_vreg(RegBank::Int);
        let mut inst = InstData::new(Opcode::Lconst).dest(v0);
        inst.dest_high = Reg::Virt(v2);
        func.blocks[b].push(inst);
        assert!(validate_function(&func, &reginfo).is_err());

        // Missing high half.
        func.blocks[b] = Default::default();
        func.blocks[b].push(InstData::new(Opcode::Lconst).dest(v1));
        assert!(validate_function(&func, &reginfo).is_err());
    }

    #[test]
    fn conflicting_call_args() {
        let reginfo = GenericRegInfo::x86();
        let mut func = Function::new();
        let b = func.new_block();
        let v0 = func.new_vreg(RegBank::Int);
        let blk = &mut func.blocks[b];
        blk.push(InstData::new(Opcode::Iconst).dest(v0));
        blk.push(
            InstData::new(Opcode::VoidCall)
                .call_arg(v0, RegBank::Int, PhysReg::new(1))
                .call_arg(v0, RegBank::Int, PhysReg::new(1)),
        );
        assert!(validate_function(&func, &reginfo).is_err());
    }
}
