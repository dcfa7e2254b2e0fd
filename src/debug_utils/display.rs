//! Support for displaying human-readable representations of a [`Function`]
//! or of a type implementing [`RegInfo`].

use core::cell::Cell;
use core::fmt;

use crate::function::{Function, InstData, InstFlags, Reg};
use crate::opcode::{ClobberSpec, InstDesc, OperandSpec, Opcode, RegPairRule};
use crate::reginfo::{PhysReg, PhysRegSet, RegBank, RegInfo};

/// Helper type to display a comma-separated list of displayable values.
pub(crate) struct DisplayIter<T> {
    iter: Cell<Option<T>>,
    separator: &'static str,
}
impl<T: IntoIterator> fmt::Display for DisplayIter<T>
where
    T::Item: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(iter) = self.iter.take() else {
            return Ok(());
        };
        for (i, val) in iter.into_iter().enumerate() {
            if i == 0 {
                write!(f, "{val}")?;
            } else {
                write!(f, "{} {val}", self.separator)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn display_iter<I: IntoIterator<Item = impl fmt::Display>>(
    iter: I,
    separator: &'static str,
) -> DisplayIter<I> {
    DisplayIter {
        iter: Cell::new(Some(iter)),
        separator,
    }
}

/// Formats a register operand, followed by its high half if it is a
/// register pair.
struct DisplayOperand(Reg, Reg);

impl fmt::Display for DisplayOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        if self.1.is_some() {
            write!(f, ":{}", self.1)?;
        }
        Ok(())
    }
}

/// Wrapper around an [`InstData`] which formats it as a single line of the
/// function text format, without indentation.
pub struct DisplayInst<'a>(pub &'a InstData);

impl fmt::Display for DisplayInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inst = self.0;
        if inst.dest.is_some() {
            write!(f, "{} = ", DisplayOperand(inst.dest, inst.dest_high))?;
        }
        write!(f, "{}", inst.opcode)?;

        // Sources are positional: trailing unused sources are omitted but
        // gaps are printed as `_`.
        let num_srcs = inst
            .srcs
            .iter()
            .rposition(|src| src.is_some())
            .map_or(0, |last| last + 1);
        let mut first = true;
        for (index, &src) in inst.srcs[..num_srcs].iter().enumerate() {
            let high = if index == 0 {
                inst.src1_high
            } else {
                Reg::None
            };
            let sep = if first { " " } else { ", " };
            write!(f, "{sep}{}", DisplayOperand(src, high))?;
            first = false;
        }
        if inst.imm != 0 {
            let sep = if first { " " } else { ", " };
            write!(f, "{sep}#{}", inst.imm)?;
        }

        if !inst.call_args.is_empty() {
            write!(
                f,
                " ({})",
                display_iter(
                    inst.call_args
                        .iter()
                        .map(|arg| DisplayCallArg(arg.value, arg.bank, arg.reg)),
                    ","
                )
            )?;
        }

        if !inst.flags.is_empty() {
            let flags = [
                (InstFlags::COPY, "copy"),
                (InstFlags::SPILL, "spill"),
                (InstFlags::RELOAD, "reload"),
            ];
            write!(
                f,
                " [{}]",
                display_iter(
                    flags
                        .into_iter()
                        .filter(|&(flag, _)| inst.flags.contains(flag))
                        .map(|(_, name)| name),
                    ","
                )
            )?;
        }
        Ok(())
    }
}

struct DisplayCallArg(Reg, RegBank, PhysReg);

impl fmt::Display for DisplayCallArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} {}", self.0, self.1, self.2)
    }
}

/// Wrapper around a [`Function`] that provides a [`Display`] implementation
/// which dumps the function in a format that is both human-readable and
/// machine-parseable.
///
/// The returned string can be re-parsed into a function by using
/// [`Function::parse`] (requires the `parse` cargo feature).
///
/// [`Function::parse`]: crate::function::Function::parse
/// [`Display`]: core::fmt::Display
pub struct DisplayFunction<'a>(pub &'a Function);

impl fmt::Debug for DisplayFunction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for DisplayFunction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (vreg, bank) in &self.0.vregs {
            writeln!(f, "{vreg} = {bank}")?;
        }

        for (block, data) in &self.0.blocks {
            writeln!(f)?;
            writeln!(f, "{block}:")?;
            for inst in data {
                writeln!(f, "    {}", DisplayInst(&data[inst]))?;
            }
        }
        Ok(())
    }
}

/// Wrapper around a type implementing [`RegInfo`] that provides a [`Display`]
/// implementation which dumps the register banks and the descriptor of every
/// opcode.
///
/// [`Display`]: core::fmt::Display
pub struct DisplayRegInfo<'a, R: RegInfo>(pub &'a R);

impl<R: RegInfo> fmt::Debug for DisplayRegInfo<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<R: RegInfo> fmt::Display for DisplayRegInfo<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reginfo = self.0;
        writeln!(
            f,
            "frame = {}",
            reginfo.reg_name(RegBank::Int, reginfo.frame_reg())
        )?;

        for bank in RegBank::ALL {
            let num_regs = reginfo.num_regs(bank);
            if num_regs == 0 {
                continue;
            }
            let names = |set: PhysRegSet| {
                display_iter(set.into_iter().map(move |reg| reginfo.reg_name(bank, reg)), "")
            };
            writeln!(f)?;
            match reginfo.mirror_of(bank) {
                Some(root) => writeln!(f, "{bank}: {root} {{")?,
                None => writeln!(f, "{bank} {{")?,
            }
            writeln!(f, "    regs = {num_regs}")?;
            writeln!(f, "    local = {}", names(reginfo.local_regs(bank)))?;
            writeln!(f, "    global = {}", names(reginfo.global_regs(bank)))?;
            writeln!(f, "    spillslot_size = {}", reginfo.spillslot_size(bank))?;
            let ops = reginfo.bank_ops(bank);
            writeln!(f, "    load = {}", ops.load)?;
            writeln!(f, "    store = {}", ops.store)?;
            writeln!(f, "    move = {}", ops.move_)?;
            writeln!(f, "}}")?;
        }

        writeln!(f)?;
        for &opcode in Opcode::ALL {
            writeln!(
                f,
                "{opcode}:{}",
                DisplayDesc {
                    desc: reginfo.inst_desc(opcode),
                    reginfo,
                }
            )?;
        }
        Ok(())
    }
}

/// Formats an [`InstDesc`] using the register names of a target.
struct DisplayDesc<'a, R> {
    desc: &'a InstDesc,
    reginfo: &'a R,
}

impl<R: RegInfo> DisplayDesc<'_, R> {
    fn operand(&self, f: &mut fmt::Formatter<'_>, role: &str, spec: &OperandSpec) -> fmt::Result {
        let name = |reg| self.reginfo.reg_name(spec.bank, reg);
        write!(f, " {role}:{}", spec.bank)?;
        if let Some(reg) = spec.fixed {
            write!(f, " fixed({})", name(reg))?;
        }
        if let Some(restrict) = spec.restrict {
            let local = self.reginfo.local_regs(self.reginfo.reg_file(spec.bank));
            write!(
                f,
                " restrict({})",
                display_iter((restrict & local).into_iter().map(name), "")
            )?;
        }
        match spec.pair {
            Some(RegPairRule::Fixed(reg)) => write!(f, " pair({})", name(reg))?,
            Some(RegPairRule::Adjacent) => write!(f, " pair(adjacent)")?,
            Some(RegPairRule::Any) => write!(f, " pair(any)")?,
            None => {}
        }
        Ok(())
    }
}

impl<R: RegInfo> fmt::Display for DisplayDesc<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dest) = &self.desc.dest {
            let role = if self.desc.dest_is_base { "base" } else { "dest" };
            self.operand(f, role, dest)?;
        }
        for (index, src) in self.desc.srcs.iter().enumerate() {
            if let Some(src) = src {
                self.operand(f, ["src1", "src2", "src3"][index], src)?;
            }
        }
        match self.desc.clobber {
            ClobberSpec::None => {}
            ClobberSpec::Dest1 => write!(f, " dest1")?,
            ClobberSpec::Call => write!(f, " clobber(call)")?,
            ClobberSpec::Reg(bank, reg) => {
                write!(f, " clobber({})", self.reginfo.reg_name(bank, reg))?;
            }
        }
        Ok(())
    }
}
