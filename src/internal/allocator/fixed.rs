//! Instruction clobbers and registers claimed for uses.

use super::{Context, Target};
use crate::opcode::ClobberSpec;
use crate::reginfo::{PhysReg, RegBank, RegInfo};
use crate::RegAllocError;

impl<R: RegInfo> Context<'_, R> {
    /// Evicts every value which later instructions expect in a register
    /// clobbered by the instruction.
    ///
    /// Afterwards every bound virtual register lives across the instruction
    /// in a register which the instruction doesn't write.
    pub(super) fn apply_clobbers(&mut self) -> Result<(), RegAllocError> {
        match self.desc.clobber {
            ClobberSpec::Call => {
                // Everything still live after the call must be reloaded from
                // the stack.
                for file in RegBank::ALL {
                    for reg in self.state.occupied_regs(file) {
                        self.evict(file, reg)?;
                    }
                }
            }
            ClobberSpec::Reg(bank, reg) => {
                let file = self.file(bank);
                self.evict(file, reg)?;
            }
            ClobberSpec::None | ClobberSpec::Dest1 => {}
        }
        Ok(())
    }

    /// Commits a register satisfying `target` to a use of the current
    /// instruction, evicting its previous occupant.
    pub(super) fn claim(&mut self, file: RegBank, target: Target) -> Result<PhysReg, RegAllocError> {
        let reg = match target {
            Target::Reg(reg) => {
                if self.taken[file.index()].contains(reg) {
                    trace!("  {reg} is already needed by another operand");
                    return Err(RegAllocError::NoSpillCandidate { inst: self.inst });
                }
                self.evict(file, reg)?;
                reg
            }
            Target::Set { allowed, hint, .. } => self.alloc_reg(file, allowed, hint)?,
        };
        self.take(file, reg);
        Ok(reg)
    }
}
