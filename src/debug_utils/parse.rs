use core::str::FromStr;

use anyhow::Result;
use cranelift_entity::EntityRef;
use pest::error::{Error, ErrorVariant};
use pest::iterators::Pair;
use pest::{Parser, Span};
use pest_derive::Parser;

use crate::function::{CallArg, Function, InstData, InstFlags, Reg};
use crate::opcode::Opcode;
use crate::reginfo::{PhysReg, RegBank, MAX_REGS_PER_BANK};

#[derive(Parser)]
#[grammar = "debug_utils/grammar.pest"]
pub struct FunctionParser;

/// Helper function to extract N sub-pairs when the layout of a rule is fixed.
fn extract<const N: usize>(pair: Pair<'_, Rule>, expected_rules: [Rule; N]) -> [Pair<'_, Rule>; N] {
    let mut out = [(); N].map(|()| pair.clone());
    let mut i = 0;
    for pair in pair.into_inner() {
        assert_eq!(pair.as_rule(), expected_rules[i]);
        out[i] = pair;
        i += 1;
    }
    assert_eq!(i, N);
    out
}

/// Helper function to emit a custom error at the given span.
fn custom_error(span: Span<'_>, msg: &str) -> Error<Rule> {
    Error::new_from_span(
        ErrorVariant::<Rule>::CustomError {
            message: msg.into(),
        },
        span,
    )
}

fn parse_number<T: FromStr>(pair: Pair<'_, Rule>) -> Result<T> {
    Ok(pair.as_str().parse().map_err(|_| {
        // This can only fail due to integer overflow, the rule only allows
        // digits.
        custom_error(pair.as_span(), "integer overflow")
    })?)
}

fn parse_entity<T: EntityRef>(pair: Pair<'_, Rule>) -> Result<T> {
    let [number] = extract(pair, [Rule::number]);
    let index = parse_number(number)?;
    Ok(T::new(index))
}

fn parse_expected_entity<T: EntityRef>(pair: Pair<'_, Rule>, expected: T) -> Result<()> {
    let span = pair.as_span();
    let entity = parse_entity::<T>(pair)?;
    if entity != expected {
        Err(custom_error(
            span,
            "must be declared in order and with no gaps",
        ))?;
    }
    Ok(())
}

fn parse_physreg(pair: Pair<'_, Rule>) -> Result<PhysReg> {
    let span = pair.as_span();
    let [number] = extract(pair, [Rule::number]);
    let index: usize = parse_number(number)?;
    if index >= MAX_REGS_PER_BANK {
        Err(custom_error(span, "physical register out of range"))?;
    }
    Ok(PhysReg::new(index))
}

fn parse_bank(pair: Pair<'_, Rule>) -> Result<RegBank> {
    let Some(bank) = RegBank::from_name(pair.as_str()) else {
        Err(custom_error(pair.as_span(), "unknown register bank"))?
    };
    Ok(bank)
}

fn parse_reg(pair: Pair<'_, Rule>) -> Result<Reg> {
    Ok(match pair.as_rule() {
        Rule::vreg => Reg::Virt(parse_entity(pair)?),
        Rule::physreg => Reg::Phys(parse_physreg(pair)?),
        Rule::none => Reg::None,
        _ => unreachable!(),
    })
}

/// Parses an operand into its low and high halves.
fn parse_operand(pair: Pair<'_, Rule>) -> Result<(Reg, Reg)> {
    let mut low = Reg::None;
    let mut high = Reg::None;
    for (i, pair) in pair.into_inner().enumerate() {
        let reg = parse_reg(pair)?;
        if i == 0 {
            low = reg;
        } else {
            high = reg;
        }
    }
    Ok((low, high))
}

fn parse_srcs(pair: Pair<'_, Rule>, data: &mut InstData) -> Result<()> {
    let mut index = 0;
    let mut has_imm = false;
    for pair in pair.into_inner() {
        let span = pair.as_span();
        if has_imm {
            Err(custom_error(span, "the immediate must be the last operand"))?;
        }
        match pair.as_rule() {
            Rule::imm => {
                let [signed] = extract(pair, [Rule::signed]);
                data.imm = parse_number(signed)?;
                has_imm = true;
            }
            Rule::operand => {
                if index == data.srcs.len() {
                    Err(custom_error(span, "too many source operands"))?;
                }
                let (low, high) = parse_operand(pair)?;
                if high.is_some() && index != 0 {
                    Err(custom_error(
                        span,
                        "only the first source can be a register pair",
                    ))?;
                }
                data.srcs[index] = low;
                if index == 0 {
                    data.src1_high = high;
                }
                index += 1;
            }
            _ => unreachable!(),
        }
    }
    Ok(())
}

fn parse_call_arg(pair: Pair<'_, Rule>) -> Result<CallArg> {
    let span = pair.as_span();
    let [operand, bank, physreg] = extract(pair, [Rule::operand, Rule::bank, Rule::physreg]);
    let (value, high) = parse_operand(operand)?;
    if high.is_some() || !value.is_some() {
        Err(custom_error(span, "call arguments must be a single register"))?;
    }
    Ok(CallArg {
        value,
        bank: parse_bank(bank)?,
        reg: parse_physreg(physreg)?,
    })
}

fn parse_flags(pair: Pair<'_, Rule>) -> Result<InstFlags> {
    let mut flags = InstFlags::empty();
    for pair in pair.into_inner() {
        let flag = match pair.as_str() {
            "copy" => InstFlags::COPY,
            "spill" => InstFlags::SPILL,
            "reload" => InstFlags::RELOAD,
            _ => unreachable!(),
        };
        if flags.contains(flag) {
            Err(custom_error(pair.as_span(), "duplicate flag"))?;
        }
        flags |= flag;
    }
    Ok(flags)
}

fn parse_instruction(pair: Pair<'_, Rule>, func: &mut Function) -> Result<()> {
    let Some((_, block)) = func.blocks.last_mut() else {
        Err(custom_error(
            pair.as_span(),
            "instruction is not inside a block",
        ))?
    };

    let mut dest = (Reg::None, Reg::None);
    let mut data = None;
    for pair in pair.into_inner() {
        if pair.as_rule() == Rule::dest {
            let [operand] = extract(pair, [Rule::operand]);
            dest = parse_operand(operand)?;
            continue;
        }
        if pair.as_rule() == Rule::opcode {
            let Ok(opcode) = pair.as_str().parse::<Opcode>() else {
                Err(custom_error(pair.as_span(), "unknown opcode"))?
            };
            let mut inst = InstData::new(opcode);
            inst.dest = dest.0;
            inst.dest_high = dest.1;
            data = Some(inst);
            continue;
        }

        // Everything else follows the opcode.
        let Some(data) = &mut data else {
            unreachable!()
        };
        match pair.as_rule() {
            Rule::srcs => parse_srcs(pair, data)?,
            Rule::call_args => {
                for pair in pair.into_inner() {
                    data.call_args.push(parse_call_arg(pair)?);
                }
            }
            Rule::flags => data.flags = parse_flags(pair)?,
            _ => unreachable!(),
        }
    }
    if let Some(data) = data {
        block.push(data);
    }
    Ok(())
}

impl Function {
    /// Parses a textual representation of a [`Function`].
    ///
    /// The text format is the same as the one generated by
    /// [`DisplayFunction`](super::DisplayFunction). Both original and
    /// allocated functions can be parsed. The result is not validated: use
    /// [`validate_function`](super::validate_function) for that.
    pub fn parse(input: &str) -> Result<Self> {
        let parse_result = FunctionParser::parse(Rule::function, input)?;

        let mut func = Function::new();
        for pair in parse_result {
            match pair.as_rule() {
                Rule::vreg_decl => {
                    let [vreg, bank] = extract(pair, [Rule::vreg, Rule::bank]);
                    parse_expected_entity(vreg, func.vregs.next_key())?;
                    func.vregs.push(parse_bank(bank)?);
                }
                Rule::block_label => {
                    let [block] = extract(pair, [Rule::block]);
                    parse_expected_entity(block, func.blocks.next_key())?;
                    func.new_block();
                }
                Rule::instruction => parse_instruction(pair, &mut func)?,
                Rule::EOI => {}
                _ => unreachable!(),
            }
        }
        Ok(func)
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;
    use crate::debug_utils::DisplayFunction;
    use crate::function::VReg;

    const INPUT: &str = "\
v0 = int
v1 = int
v2 = int
v3 = ref

block0:
    v0 = iconst #-7
    v1:v2 = iconv_to_i8 v0 ; sign extension
    v3 = loadref_membase %5, #16
    voidcall (v1 -> int %1, %3 -> int %2)
    ret v0

block1:
    %3 = move %6 [copy]
";

    #[test]
    fn parse_and_dump() {
        let func = Function::parse(INPUT).unwrap();
        assert_eq!(func.vregs.len(), 4);
        assert_eq!(func.blocks.len(), 2);

        let block = &func.blocks[crate::function::Block::new(0)];
        let insts: alloc::vec::Vec<_> = block.iter().collect();
        assert_eq!(insts.len(), 5);
        let pair = &block[insts[1]];
        assert_eq!(pair.opcode, Opcode::IconvToI8);
        assert_eq!(pair.dest_high, Reg::Virt(VReg::new(2)));
        assert_eq!(block[insts[0]].imm, -7);
        assert_eq!(block[insts[3]].call_args.len(), 2);

        let dumped = DisplayFunction(&func).to_string();
        assert_eq!(Function::parse(&dumped).unwrap(), func);
    }

    #[test]
    fn gaps_in_declarations() {
        assert!(Function::parse("v1 = int\n").is_err());
        assert!(Function::parse("block1:\n").is_err());
        assert!(Function::parse("v0 = iconst #1\n").is_err());
    }

    #[test]
    fn malformed_instructions() {
        let parse = |inst: &str| {
            let mut input = alloc::string::String::from("v0 = int\nblock0:\n");
            input.push_str(inst);
            Function::parse(&input)
        };
        assert!(parse("v0 = frobnicate").is_err());
        assert!(parse("v0 = iadd #1, v0").is_err());
        assert!(parse("v0 = iadd v0, v0:v0").is_err());
        assert!(parse("atomic_cas v0, v0, v0, v0").is_err());
        assert!(parse("v0 = move %64").is_err());
        assert!(parse("v0 = move v0 [copy, copy]").is_err());
        assert!(parse("v0 = move v0 [copy]").is_ok());
    }
}
