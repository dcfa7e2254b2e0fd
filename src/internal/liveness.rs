//! Forward prepass over a block which records where each virtual register is
//! first defined and which register it would like to end up in.
//!
//! Every use must follow a definition in the same block. The backward pass
//! releases a virtual register at each of its definitions, and asserts that
//! none of them precedes the first one.

use cranelift_entity::SecondaryMap;

use crate::function::{BlockData, Inst, Reg, VReg};
use crate::opcode::RegPairRule;
use crate::reginfo::{PhysRegSet, RegInfo};
use crate::RegAllocError;

/// Liveness information for one virtual register.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveRecord {
    /// 1-based index of the first instruction of the block defining the
    /// register, or 0 if it is not defined in the block.
    pub born_in: u32,

    /// Registers which the definitions would like the value to be in.
    pub preferred: PhysRegSet,
}

pub struct Liveness {
    records: SecondaryMap<VReg, LiveRecord>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            records: SecondaryMap::new(),
        }
    }

    /// Returns the liveness record of `vreg`.
    #[inline]
    pub fn record(&self, vreg: VReg) -> LiveRecord {
        self.records[vreg]
    }

    /// Walks `block` in program order, recording definitions and checking
    /// that every used virtual register has a preceding definition.
    pub fn compute(&mut self, block: &BlockData, reginfo: &impl RegInfo) -> Result<(), RegAllocError> {
        self.records.clear();

        for (index, inst) in block.iter().enumerate() {
            let index = index as u32 + 1;
            let data = &block[inst];
            let desc = reginfo.inst_desc(data.opcode);

            // Uses are checked before the definition so that an instruction
            // can't consume the value it produces.
            if desc.dest_is_base {
                self.check_use(inst, data.dest)?;
            }
            for (spec, &src) in desc.srcs.iter().zip(&data.srcs) {
                if spec.is_some() {
                    self.check_use(inst, src)?;
                }
            }
            if desc.srcs[0].is_some_and(|spec| spec.pair.is_some()) {
                check_pair(inst, data.srcs[0], data.src1_high)?;
                self.check_use(inst, data.src1_high)?;
            }
            for arg in &data.call_args {
                self.check_use(inst, arg.value)?;
            }

            let Some(spec) = desc.dest.filter(|_| desc.defines_dest()) else {
                continue;
            };
            if let Reg::Virt(vreg) = data.dest {
                let record = &mut self.records[vreg];
                if record.born_in == 0 {
                    record.born_in = index;
                }
                if let Some(reg) = spec.fixed {
                    record.preferred.insert(reg);
                }
            }
            if let Some(rule) = spec.pair {
                check_pair(inst, data.dest, data.dest_high)?;
                if let Reg::Virt(vreg) = data.dest_high {
                    let record = &mut self.records[vreg];
                    if record.born_in == 0 {
                        record.born_in = index;
                    }
                    if let RegPairRule::Fixed(reg) = rule {
                        record.preferred.insert(reg);
                    }
                }
            }
        }

        if trace_enabled!() {
            trace!("Liveness:");
            for (vreg, record) in self.records.iter() {
                if record.born_in != 0 {
                    trace!("  {vreg}: born in {} prefers {}", record.born_in, record.preferred);
                }
            }
        }
        Ok(())
    }

    fn check_use(&self, inst: Inst, reg: Reg) -> Result<(), RegAllocError> {
        if let Reg::Virt(vreg) = reg {
            if self.records[vreg].born_in == 0 {
                return Err(RegAllocError::UndefinedVReg { inst, vreg });
            }
        }
        Ok(())
    }
}

/// Checks that `high` is the virtual register following `low`, or that both
/// halves are physical registers.
fn check_pair(inst: Inst, low: Reg, high: Reg) -> Result<(), RegAllocError> {
    match (low, high) {
        (Reg::Virt(low), Reg::Virt(high)) if high == low.pair_high() => Ok(()),
        (Reg::Phys(_), Reg::Phys(_)) => Ok(()),
        _ => Err(RegAllocError::MissingRegPairHalf { inst }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_utils::GenericRegInfo;
    use crate::function::{Function, InstData};
    use crate::opcode::Opcode;
    use crate::reginfo::{PhysReg, RegBank};

    #[test]
    fn records_first_definition() {
        let reginfo = GenericRegInfo::x86();
        let mut func = Function::new();
        let b = func.new_block();
        let v0 = func.new_vreg(RegBank::Int);
        let v1 = func.new_vreg(RegBank::Int);
        let v2 = func.new_vreg(RegBank::Int);
        let blk = &mut func.blocks[b];
        blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(7));
        blk.push(InstData::new(Opcode::Iconst).dest(v1).imm(2));
        blk.push(InstData::new(Opcode::IaddImm).dest(v0).srcs([v0]).imm(1));
        blk.push(InstData::new(Opcode::Idiv).dest(v2).srcs([v0, v1]));
        blk.push(InstData::new(Opcode::Idiv).dest(v0).srcs([v2, v1]));

        let mut liveness = Liveness::new();
        liveness.compute(&func.blocks[b], &reginfo).unwrap();
        assert_eq!(liveness.record(v0).born_in, 1);
        assert_eq!(liveness.record(v1).born_in, 2);
        assert_eq!(liveness.record(v2).born_in, 4);
        assert!(liveness.record(v0).preferred.contains(PhysReg::new(0)));
        assert!(liveness.record(v1).preferred.is_empty());
    }

    #[test]
    fn use_before_definition_is_undefined() {
        let reginfo = GenericRegInfo::x86();
        let mut func = Function::new();
        let b = func.new_block();
        let v0 = func.new_vreg(RegBank::Int);
        let v1 = func.new_vreg(RegBank::Int);
        let blk = &mut func.blocks[b];
        let inst = blk.push(InstData::new(Opcode::Move).dest(v1).srcs([v0]));
        blk.push(InstData::new(Opcode::Iconst).dest(v0).imm(1));

        let mut liveness = Liveness::new();
        assert_eq!(
            liveness.compute(&func.blocks[b], &reginfo),
            Err(RegAllocError::UndefinedVReg { inst, vreg: v0 })
        );
    }
}
