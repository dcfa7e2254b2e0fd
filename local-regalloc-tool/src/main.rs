use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use arbitrary::Unstructured;
use clap::{Parser, ValueEnum};
use local_regalloc::debug_utils::{self, ArbitraryFunctionConfig, GenericRegInfo};
use local_regalloc::function::Function;
use local_regalloc::{Options, RegisterAllocator};
use rand::RngCore;

/// Example targets.
#[derive(Clone, Copy, ValueEnum)]
enum Arch {
    X86,
    Armv7,
}

impl Arch {
    fn reginfo(self) -> GenericRegInfo {
        match self {
            Arch::X86 => GenericRegInfo::x86(),
            Arch::Armv7 => GenericRegInfo::armv7(),
        }
    }
}

#[derive(Parser)]
/// Tool for testing local-regalloc.
enum Args {
    /// Run register allocation on a given function.
    Compile {
        /// Print the input function and the result of register allocation.
        #[clap(short = 'v')]
        verbose: bool,

        /// Target to allocate registers for.
        #[clap(long, value_enum, default_value_t = Arch::X86)]
        arch: Arch,

        /// File containing the function to register allocate.
        function: PathBuf,

        /// Register allocator options.
        #[clap(flatten)]
        options: Options,
    },

    /// Generate a random function.
    GenFunction {
        /// Target to generate the function for.
        #[clap(long, value_enum, default_value_t = Arch::X86)]
        arch: Arch,

        /// Number of blocks in the function.
        #[clap(long, default_value_t = 2)]
        blocks: usize,

        /// Number of instructions per block.
        #[clap(long, default_value_t = 20)]
        insts_per_block: usize,

        /// Number of outgoing arguments per call instruction.
        #[clap(long, default_value_t = 3)]
        call_args: usize,
    },

    /// Parses the given function and re-dumps it with proper formatting.
    ///
    /// Note that this will strip all comments.
    FmtFunction {
        /// Target the function is validated against.
        #[clap(long, value_enum, default_value_t = Arch::X86)]
        arch: Arch,

        /// File containing the function definition.
        function: PathBuf,
    },

    /// Dump the register banks and instruction descriptors of a target.
    DumpTarget {
        /// Target to dump.
        arch: Arch,
    },
}

fn load_reginfo(arch: Arch) -> Result<GenericRegInfo> {
    let reginfo = arch.reginfo();
    debug_utils::validate_reginfo(&reginfo).context("reginfo validation failed")?;
    Ok(reginfo)
}

fn load_function(path: &Path, reginfo: &GenericRegInfo) -> Result<Function> {
    let function = fs::read(path).context("could not read function input file")?;
    let function = String::from_utf8(function).context("function input is not UTF-8")?;
    let function = Function::parse(&function).context("could not parse function input file")?;
    debug_utils::validate_function(&function, reginfo).context("function validation failed")?;
    Ok(function)
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    match args {
        Args::Compile {
            verbose,
            arch,
            ref function,
            ref options,
        } => {
            let reginfo = load_reginfo(arch)?;
            let original = load_function(function, &reginfo)?;

            if verbose {
                println!(
                    "================ Input function ================\n{}",
                    debug_utils::DisplayFunction(&original)
                );
            }

            let mut allocated = original.clone();
            let mut regalloc = RegisterAllocator::new();
            let spill_slots = regalloc
                .allocate_function(&mut allocated, &reginfo, options)
                .context("register allocation failed")?;

            println!(
                "================ Output ================\n{}",
                debug_utils::DisplayFunction(&allocated)
            );
            println!("================ Spill slots ================\n{spill_slots}");
            println!("{}", regalloc.stats());

            debug_utils::check_function(&reginfo, &original, &allocated, &spill_slots)
                .context("register allocation result failed checker")?;
        }
        Args::GenFunction {
            arch,
            blocks,
            insts_per_block,
            call_args,
        } => {
            let reginfo = load_reginfo(arch)?;
            let config = ArbitraryFunctionConfig {
                blocks: 1..=blocks.max(1),
                insts_per_block: 0..=insts_per_block,
                call_args: 0..=call_args,
            };
            let mut bytes = [0; 4096];
            rand::rng().fill_bytes(&mut bytes);
            let function =
                Function::arbitrary_with_config(&reginfo, &mut Unstructured::new(&bytes), config)
                    .context("failed to generate arbitrary function")?;

            println!("{}", debug_utils::DisplayFunction(&function));
        }
        Args::FmtFunction { arch, ref function } => {
            let reginfo = load_reginfo(arch)?;
            let function = load_function(function, &reginfo)?;

            println!("{}", debug_utils::DisplayFunction(&function));
        }
        Args::DumpTarget { arch } => {
            let reginfo = load_reginfo(arch)?;

            print!("{}", debug_utils::DisplayRegInfo(&reginfo));
        }
    }
    Ok(())
}
