//! Register bank catalog and descriptor table validation.

use anyhow::{bail, ensure, Result};

use crate::opcode::{ClobberSpec, InstDesc, OperandSpec, Opcode, RegPairRule};
use crate::reginfo::{PhysRegSet, RegBank, RegInfo, MAX_REGS_PER_BANK};

/// Checks `reginfo` to ensure it satisfies all of the pre-conditions required
/// by the register allocator.
pub fn validate_reginfo(reginfo: &impl RegInfo) -> Result<()> {
    let ctx = Context { reginfo };
    ctx.check_banks()?;
    ctx.check_frame_reg()?;
    for &opcode in Opcode::ALL {
        ctx.check_desc(opcode)?;
    }
    Ok(())
}

/// State used for validation.
struct Context<'a, R> {
    reginfo: &'a R,
}

impl<R: RegInfo> Context<'_, R> {
    /// Local registers of the register file used by `bank`.
    fn local(&self, bank: RegBank) -> PhysRegSet {
        self.reginfo.local_regs(self.reginfo.reg_file(bank))
    }

    fn check_banks(&self) -> Result<()> {
        for bank in RegBank::ALL {
            let num_regs = self.reginfo.num_regs(bank);
            ensure!(
                num_regs <= MAX_REGS_PER_BANK,
                "{bank}: Too many registers: {num_regs} (max: {MAX_REGS_PER_BANK})"
            );
            let all = PhysRegSet::first(num_regs);
            let local = self.reginfo.local_regs(bank);
            let global = self.reginfo.global_regs(bank);
            ensure!(
                local.is_subset(all),
                "{bank}: Local registers {local} out of range"
            );
            ensure!(
                global.is_subset(all),
                "{bank}: Global registers {global} out of range"
            );
            ensure!(
                (local & global).is_empty(),
                "{bank}: Registers {} are both local and global",
                local & global
            );

            if let Some(root) = self.reginfo.mirror_of(bank) {
                ensure!(root != bank, "{bank}: Bank mirrors itself");
                ensure!(
                    self.reginfo.mirror_of(root).is_none(),
                    "{bank}: Mirrored onto {root} which is itself mirrored"
                );
                ensure!(
                    self.reginfo.num_regs(root) == num_regs,
                    "{bank}: Register count differs from mirrored bank {root}"
                );
                ensure!(
                    self.reginfo.local_regs(root) == local
                        && self.reginfo.global_regs(root) == global,
                    "{bank}: Local and global registers differ from mirrored bank {root}"
                );
            }

            if num_regs != 0 {
                self.check_bank_ops(bank)?;
            }
        }
        Ok(())
    }

    /// Checks that the spill code opcodes of `bank` have the shapes the
    /// allocator emits.
    fn check_bank_ops(&self, bank: RegBank) -> Result<()> {
        let file = self.reginfo.reg_file(bank);
        let ops = self.reginfo.bank_ops(bank);
        let plain = |spec: Option<OperandSpec>| {
            spec.is_some_and(|spec| {
                spec.fixed.is_none() && spec.pair.is_none() && spec.restrict.is_none()
            })
        };
        let in_file = |spec: Option<OperandSpec>, file: RegBank| {
            spec.is_some_and(|spec| self.reginfo.reg_file(spec.bank) == file)
        };

        let load = self.reginfo.inst_desc(ops.load);
        ensure!(
            load.defines_dest()
                && plain(load.dest)
                && in_file(load.dest, file)
                && plain(load.srcs[0])
                && in_file(load.srcs[0], RegBank::Int)
                && load.srcs[1..].iter().all(Option::is_none)
                && load.clobber == ClobberSpec::None,
            "{bank}: {} can't be used to reload registers",
            ops.load
        );

        let store = self.reginfo.inst_desc(ops.store);
        ensure!(
            store.dest_is_base
                && plain(store.dest)
                && in_file(store.dest, RegBank::Int)
                && plain(store.srcs[0])
                && in_file(store.srcs[0], file)
                && store.srcs[1..].iter().all(Option::is_none)
                && store.clobber == ClobberSpec::None,
            "{bank}: {} can't be used to spill registers",
            ops.store
        );

        let move_ = self.reginfo.inst_desc(ops.move_);
        ensure!(
            move_.defines_dest()
                && plain(move_.dest)
                && in_file(move_.dest, file)
                && plain(move_.srcs[0])
                && in_file(move_.srcs[0], file)
                && move_.srcs[1..].iter().all(Option::is_none)
                && move_.clobber == ClobberSpec::None,
            "{bank}: {} can't be used to copy registers",
            ops.move_
        );
        Ok(())
    }

    fn check_frame_reg(&self) -> Result<()> {
        let frame = self.reginfo.frame_reg();
        ensure!(
            frame.index() < self.reginfo.num_regs(RegBank::Int),
            "Frame register {frame} out of range"
        );
        ensure!(
            !self.reginfo.local_regs(RegBank::Int).contains(frame),
            "Frame register {frame} is a local register"
        );
        Ok(())
    }

    fn check_desc(&self, opcode: Opcode) -> Result<()> {
        let desc = self.reginfo.inst_desc(opcode);
        let specs = desc.dest.iter().chain(desc.srcs.iter().flatten());

        // Operands of banks the target doesn't support make the opcode
        // unusable, which is fine.
        if specs
            .clone()
            .any(|spec| self.reginfo.num_regs(spec.bank) == 0)
        {
            return Ok(());
        }

        for spec in specs {
            self.check_operand(opcode, spec)?;
        }

        if desc.dest_is_base {
            ensure!(desc.dest.is_some(), "{opcode}: Base destination is missing");
        }
        for (index, src) in desc.srcs.iter().enumerate().skip(1) {
            ensure!(
                src.is_none_or(|spec| spec.pair.is_none()),
                "{opcode}: Register pair on source {}",
                index + 1
            );
        }
        ensure!(
            !desc.dest_is_base || desc.dest.is_none_or(|spec| spec.pair.is_none()),
            "{opcode}: Register pair on a base destination"
        );

        // Two sources fixed to the same register would need two different
        // values in one register.
        for bank in RegBank::ALL {
            let mut seen = PhysRegSet::new();
            for spec in desc.uses() {
                if self.reginfo.reg_file(spec.bank) != bank {
                    continue;
                }
                if let Some(reg) = spec.fixed {
                    ensure!(
                        !seen.contains(reg),
                        "{opcode}: Several sources fixed to {reg}"
                    );
                    seen.insert(reg);
                }
            }
        }

        match desc.clobber {
            ClobberSpec::None | ClobberSpec::Call => {}
            ClobberSpec::Dest1 => self.check_dest1(opcode, desc)?,
            ClobberSpec::Reg(bank, reg) => {
                ensure!(
                    self.local(bank).contains(reg),
                    "{opcode}: Clobbered register {reg} is not a local register"
                );
                if let Some(dest) = desc.dest.filter(|_| desc.defines_dest()) {
                    ensure!(
                        self.reginfo.reg_file(dest.bank) != self.reginfo.reg_file(bank)
                            || dest.fixed != Some(reg),
                        "{opcode}: Destination fixed to the clobbered register {reg}"
                    );
                }
            }
        }

        self.check_free_sources(opcode, desc)
    }

    fn check_operand(&self, opcode: Opcode, spec: &OperandSpec) -> Result<()> {
        let local = self.local(spec.bank);
        if let Some(reg) = spec.fixed {
            ensure!(
                local.contains(reg),
                "{opcode}: Fixed register {reg} is not a local register"
            );
            ensure!(
                spec.restrict.is_none_or(|set| set.contains(reg)),
                "{opcode}: Fixed register {reg} not allowed by the restriction"
            );
        }
        if let Some(restrict) = spec.restrict {
            ensure!(
                !(restrict & local).is_empty(),
                "{opcode}: Restriction {restrict} excludes every local register"
            );
        }
        if let Some(rule) = spec.pair {
            ensure!(
                spec.bank == RegBank::Int,
                "{opcode}: Register pairs are only supported in the integer bank"
            );
            let lows = spec.allowed(rule.low_mask(local));
            ensure!(
                !lows.is_empty(),
                "{opcode}: No register can hold the low half of a pair"
            );
            if let RegPairRule::Fixed(high) = rule {
                ensure!(
                    local.contains(high),
                    "{opcode}: Pair register {high} is not a local register"
                );
            }
            if let Some(reg) = spec.fixed {
                ensure!(
                    lows.contains(reg) && !rule.high_mask(reg, local).is_empty(),
                    "{opcode}: Fixed register {reg} can't hold the low half of a pair"
                );
            }
        }
        Ok(())
    }

    /// Checks the two-address constraint between the destination and the
    /// first source.
    fn check_dest1(&self, opcode: Opcode, desc: &InstDesc) -> Result<()> {
        let (Some(dest), Some(src)) = (desc.dest.filter(|_| desc.defines_dest()), desc.srcs[0])
        else {
            bail!("{opcode}: Two-address instruction without destination and first source");
        };
        let file = self.reginfo.reg_file(dest.bank);
        ensure!(
            file == self.reginfo.reg_file(src.bank),
            "{opcode}: Two-address operands in different register files"
        );
        ensure!(
            dest.pair.is_some() == src.pair.is_some(),
            "{opcode}: Two-address operands must both be register pairs or neither"
        );
        ensure!(
            src.fixed.is_none() || src.fixed == dest.fixed,
            "{opcode}: Two-address first source fixed to a different register"
        );
        ensure!(
            src.restrict.is_none(),
            "{opcode}: Two-address first source can't be restricted"
        );

        // The destination register also holds the first source, so it can't
        // be needed by another source.
        let mut others = PhysRegSet::new();
        for spec in desc.srcs[1..].iter().flatten() {
            if self.reginfo.reg_file(spec.bank) == file {
                others |= spec.fixed.map_or(PhysRegSet::new(), PhysRegSet::single);
            }
        }
        let allowed = dest.allowed(self.local(dest.bank));
        ensure!(
            (allowed & others).is_empty(),
            "{opcode}: Two-address destination may be placed in a register fixed to another \
             source"
        );
        Ok(())
    }

    /// Checks that every unconstrained source has at least one usable
    /// register once the fixed and clobbered registers are taken away.
    fn check_free_sources(&self, opcode: Opcode, desc: &InstDesc) -> Result<()> {
        for bank in RegBank::ALL {
            if self.reginfo.reg_file(bank) != bank {
                continue;
            }
            let mut taken = desc.fixed_regs(bank);
            for mirror in RegBank::ALL {
                if mirror != bank && self.reginfo.reg_file(mirror) == bank {
                    taken |= desc.fixed_regs(mirror);
                }
            }
            if let ClobberSpec::Reg(clobber_bank, reg) = desc.clobber {
                if self.reginfo.reg_file(clobber_bank) == bank {
                    taken.insert(reg);
                }
            }

            // The first source of a two-address instruction uses the
            // destination register.
            let skip = usize::from(desc.clobber == ClobberSpec::Dest1);
            let base = desc.dest.filter(|_| desc.dest_is_base);
            let sources = base
                .into_iter()
                .chain(desc.srcs.iter().skip(skip).flatten().copied());

            let mut usable = self.reginfo.local_regs(bank) - taken;
            for spec in sources {
                if self.reginfo.reg_file(spec.bank) != bank || spec.fixed.is_some() {
                    continue;
                }
                let mut regs = spec.allowed(usable);
                if let Some(rule) = spec.pair {
                    regs &= rule.low_mask(self.reginfo.local_regs(bank));
                }
                let Some(reg) = regs.first_reg() else {
                    bail!("{opcode}: No register is available for a {} source", spec.bank);
                };
                usable.remove(reg);
            }
        }
        Ok(())
    }
}
