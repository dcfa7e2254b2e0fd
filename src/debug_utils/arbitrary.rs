use alloc::vec::Vec;
use core::ops::RangeInclusive;

use arbitrary::{Result, Unstructured};

use crate::function::{CallArg, Function, InstData, Reg, VReg};
use crate::opcode::{ClobberSpec, InstDesc, Opcode, OperandSpec};
use crate::reginfo::{PhysReg, PhysRegSet, RegBank, RegInfo};

/// Configuration options for [`Function::arbitrary_with_config`].
///
/// These are ranges from which a value is arbitrarily chosen when generating a
/// function.
///
/// It's generally fine to just use `Default::default` for this.
#[derive(Debug, Clone)]
pub struct ArbitraryFunctionConfig {
    /// Number of blocks in the function.
    pub blocks: RangeInclusive<usize>,

    /// Number of instructions per block.
    pub insts_per_block: RangeInclusive<usize>,

    /// Number of outgoing arguments per call instruction.
    ///
    /// Calls may get fewer arguments if the target doesn't have enough free
    /// local registers.
    pub call_args: RangeInclusive<usize>,
}

impl Default for ArbitraryFunctionConfig {
    fn default() -> Self {
        Self {
            blocks: 1..=4,
            insts_per_block: 0..=40,
            call_args: 0..=4,
        }
    }
}

impl Function {
    /// Constructs a randomly-generated `Function`.
    ///
    /// This function is guaranteed to pass validation with the given (valid)
    /// [`RegInfo`] implementation.
    pub fn arbitrary_with_config(
        reginfo: &impl RegInfo,
        u: &mut Unstructured<'_>,
        config: ArbitraryFunctionConfig,
    ) -> Result<Self> {
        let mut builder = FunctionBuilder {
            u,
            reginfo,
            func: Function::new(),
            config,
            defined: Default::default(),
            pairs: Vec::new(),
        };
        let num_blocks = builder.u.int_in_range(builder.config.blocks.clone())?;
        for _ in 0..num_blocks {
            builder.gen_block()?;
        }
        Ok(builder.func)
    }
}

struct FunctionBuilder<'a, 'b, R> {
    /// Source of randomness.
    u: &'a mut Unstructured<'b>,

    /// Register description.
    reginfo: &'a R,

    /// Function that is being built.
    func: Function,

    /// Configuration options
    config: ArbitraryFunctionConfig,

    /// Virtual registers defined so far in the current block, per bank.
    defined: [Vec<VReg>; RegBank::COUNT],

    /// Low halves of register pairs defined so far in the current block.
    pairs: Vec<VReg>,
}

impl<R: RegInfo> FunctionBuilder<'_, '_, R> {
    fn gen_block(&mut self) -> Result<()> {
        for defined in &mut self.defined {
            defined.clear();
        }
        self.pairs.clear();

        let block = self.func.new_block();
        let num_insts = self.u.int_in_range(self.config.insts_per_block.clone())?;
        for _ in 0..num_insts {
            let opcodes: Vec<Opcode> = Opcode::ALL
                .iter()
                .copied()
                .filter(|&opcode| self.is_usable(self.reginfo.inst_desc(opcode)))
                .collect();
            let opcode = *self.u.choose(&opcodes)?;
            let data = self.gen_inst(opcode)?;
            self.func.blocks[block].push(data);
        }
        Ok(())
    }

    /// Whether every operand of `desc` can be generated in the current
    /// state.
    fn is_usable(&self, desc: &InstDesc) -> bool {
        let specs = desc.dest.iter().chain(desc.srcs.iter().flatten());
        if specs
            .clone()
            .any(|spec| self.reginfo.num_regs(spec.bank) == 0)
        {
            return false;
        }
        desc.uses().all(|spec| {
            if spec.pair.is_some() {
                !self.pairs.is_empty()
            } else {
                !self.source_candidates(spec.bank, true).is_empty()
            }
        })
    }

    /// Global registers and the frame register usable as a source in `bank`.
    fn source_globals(&self, bank: RegBank) -> PhysRegSet {
        let file = self.reginfo.reg_file(bank);
        let mut regs = self.reginfo.global_regs(file);
        if file == RegBank::Int {
            regs.insert(self.reginfo.frame_reg());
        }
        regs
    }

    /// Virtual registers defined in the block which can be read as `bank`,
    /// plus the global registers if `globals` is set or there are no such
    /// virtual registers.
    fn source_candidates(&self, bank: RegBank, globals: bool) -> Vec<Reg> {
        let mut out: Vec<Reg> = self.defined[bank.index()]
            .iter()
            .map(|&vreg| Reg::Virt(vreg))
            .collect();
        if bank == RegBank::Int {
            for bank in [RegBank::IntRef, RegBank::IntMp] {
                out.extend(self.defined[bank.index()].iter().map(|&vreg| Reg::Virt(vreg)));
            }
        }
        if out.is_empty() || globals {
            out.extend(self.source_globals(bank).iter().map(Reg::Phys));
        }
        out
    }

    fn gen_source(&mut self, spec: OperandSpec) -> Result<Reg> {
        let globals = self.u.ratio(1, 8)?;
        let candidates = self.source_candidates(spec.bank, globals);
        Ok(*self.u.choose(&candidates)?)
    }

    fn gen_dest(&mut self, spec: OperandSpec) -> Result<(Reg, Reg)> {
        if spec.pair.is_some() {
            let low = self.func.new_vreg_pair(spec.bank);
            self.pairs.push(low);
            self.defined[spec.bank.index()].extend([low, low.pair_high()]);
            return Ok((Reg::Virt(low), Reg::Virt(low.pair_high())));
        }

        let file = self.reginfo.reg_file(spec.bank);
        let globals = self.reginfo.global_regs(file);
        let defined = &self.defined[spec.bank.index()];
        let dest = match self.u.int_in_range(0..=9)? {
            0 if !globals.is_empty() => {
                let globals: Vec<PhysReg> = globals.iter().collect();
                Reg::Phys(*self.u.choose(&globals)?)
            }
            1..=2 if !defined.is_empty() => Reg::Virt(*self.u.choose(defined)?),
            _ => {
                let vreg = self.func.new_vreg(spec.bank);
                self.defined[spec.bank.index()].push(vreg);
                Reg::Virt(vreg)
            }
        };
        Ok((dest, Reg::None))
    }

    fn gen_call_args(&mut self, desc: &InstDesc, data: &mut InstData) -> Result<()> {
        let count = self.u.int_in_range(self.config.call_args.clone())?;
        for _ in 0..count {
            let banks: Vec<RegBank> = RegBank::ALL
                .into_iter()
                .filter(|&bank| self.reginfo.num_regs(bank) != 0)
                .collect();
            let bank = *self.u.choose(&banks)?;
            let file = self.reginfo.reg_file(bank);
            if self.source_candidates(bank, true).is_empty() {
                continue;
            }

            // Sources which aren't fixed still need a register of their own.
            let mut free = self.reginfo.local_regs(file);
            let mut unfixed = 0;
            for spec in desc.uses() {
                if self.reginfo.reg_file(spec.bank) != file {
                    continue;
                }
                match spec.fixed {
                    Some(reg) => free.remove(reg),
                    None => unfixed += 1,
                }
            }
            for arg in &data.call_args {
                if self.reginfo.reg_file(arg.bank) == file {
                    free.remove(arg.reg);
                }
            }
            if free.len() <= unfixed {
                continue;
            }
            let regs: Vec<PhysReg> = free.iter().collect();
            let reg = *self.u.choose(&regs)?;
            let value = self.gen_source(OperandSpec::new(bank))?;
            data.call_args.push(CallArg { value, bank, reg });
        }
        Ok(())
    }

    fn gen_inst(&mut self, opcode: Opcode) -> Result<InstData> {
        let desc = *self.reginfo.inst_desc(opcode);
        let mut data = InstData::new(opcode);
        if self.u.arbitrary()? {
            data.imm = self.u.int_in_range(-64..=64)?;
        }

        // Sources are generated before the destination so that they can't
        // refer to the value being defined.
        if let Some(spec) = desc.dest.filter(|_| desc.dest_is_base) {
            data.dest = self.gen_source(spec)?;
        }
        for (index, spec) in desc.srcs.iter().enumerate() {
            let Some(spec) = *spec else {
                continue;
            };
            if spec.pair.is_some() {
                let low = *self.u.choose(&self.pairs)?;
                data.srcs[index] = Reg::Virt(low);
                data.src1_high = Reg::Virt(low.pair_high());
            } else {
                data.srcs[index] = self.gen_source(spec)?;
            }
        }
        if desc.clobber == ClobberSpec::Call {
            self.gen_call_args(&desc, &mut data)?;
        }
        if let Some(spec) = desc.dest.filter(|_| desc.defines_dest()) {
            (data.dest, data.dest_high) = self.gen_dest(spec)?;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_utils::{check_function, validate_function, GenericRegInfo};
    use crate::{Options, RegisterAllocator};

    /// Deterministic input bytes for `seed`, from an xorshift generator.
    fn input(seed: u64, len: usize) -> Vec<u8> {
        let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn generated_functions_allocate() {
        let mut regalloc = RegisterAllocator::new();
        for reginfo in [GenericRegInfo::x86(), GenericRegInfo::armv7()] {
            for seed in 0..300 {
                let bytes = input(seed, 8192);
                let mut u = Unstructured::new(&bytes);
                let func = Function::arbitrary_with_config(
                    &reginfo,
                    &mut u,
                    ArbitraryFunctionConfig::default(),
                )
                .unwrap();
                let options: Options = u.arbitrary().unwrap();
                validate_function(&func, &reginfo).unwrap();

                let mut allocated = func.clone();
                let spill_slots = regalloc
                    .allocate_function(&mut allocated, &reginfo, &options)
                    .unwrap_or_else(|err| panic!("seed {seed}: {err}"));
                if let Err(err) = check_function(&reginfo, &func, &allocated, &spill_slots) {
                    panic!("seed {seed}: {err}");
                }
            }
        }
    }
}
