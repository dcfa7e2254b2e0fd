use std::fmt;
use std::sync::OnceLock;

use arbitrary::{Arbitrary, Result, Unstructured};
use local_regalloc::debug_utils::{self, DisplayFunction, GenericRegInfo};
use local_regalloc::function::Function;
use local_regalloc::reginfo::RegBank;
use local_regalloc::Options;

/// Example targets that are validated once.
static EXAMPLE_REGINFOS: OnceLock<Vec<(&'static str, GenericRegInfo)>> = OnceLock::new();

enum TestCaseRegInfo {
    Example {
        name: &'static str,
        reginfo: &'static GenericRegInfo,
    },
    /// An example target with some of its local integer registers taken
    /// away, to put more pressure on the allocator.
    Reduced {
        name: &'static str,
        reginfo: GenericRegInfo,
    },
}

impl TestCaseRegInfo {
    pub fn get(&self) -> &GenericRegInfo {
        match *self {
            TestCaseRegInfo::Example { name: _, reginfo } => reginfo,
            TestCaseRegInfo::Reduced { name: _, ref reginfo } => reginfo,
        }
    }
}

/// Common implementation of a test case used by all fuzz targets.
pub struct TestCase {
    reginfo: TestCaseRegInfo,
    pub func: Function,
    pub options: Options,
}

impl TestCase {
    pub fn reginfo(&self) -> &GenericRegInfo {
        self.reginfo.get()
    }
}

impl Arbitrary<'_> for TestCase {
    fn arbitrary(u: &mut Unstructured) -> Result<Self> {
        // Ensure the logger is initialized.
        let _ = pretty_env_logger::try_init();

        let example_reginfos = EXAMPLE_REGINFOS.get_or_init(|| {
            let x86 = GenericRegInfo::x86();
            let armv7 = GenericRegInfo::armv7();
            debug_utils::validate_reginfo(&x86).unwrap();
            debug_utils::validate_reginfo(&armv7).unwrap();
            vec![("x86", x86), ("armv7", armv7)]
        });
        let (name, example) = u.choose(example_reginfos)?;
        let reginfo = if u.arbitrary()? {
            log::trace!("Using example target: {name}");
            TestCaseRegInfo::Example {
                name,
                reginfo: example,
            }
        } else {
            // Remove unconstrained local registers while the target still
            // validates.
            let mut reginfo = example.clone();
            let num_removed = u.int_in_range(1..=3)?;
            for _ in 0..num_removed {
                let local = reginfo.bank(RegBank::Int).local;
                let regs: Vec<_> = local.iter().collect();
                let reg = *u.choose(&regs)?;
                let mut reduced = reginfo.clone();
                for bank in [RegBank::Int, RegBank::IntRef, RegBank::IntMp] {
                    reduced.bank_mut(bank).local.remove(reg);
                }
                if debug_utils::validate_reginfo(&reduced).is_ok() {
                    reginfo = reduced;
                }
            }
            log::trace!("Using reduced target based on {name}:\n{reginfo}");
            TestCaseRegInfo::Reduced { name, reginfo }
        };
        let func = Function::arbitrary_with_config(reginfo.get(), u, Default::default())?;
        let options = u.arbitrary()?;
        Ok(TestCase {
            reginfo,
            func,
            options,
        })
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reginfo {
            TestCaseRegInfo::Example { name, reginfo: _ } => {
                writeln!(f, "Using example target: {name}")?;
            }
            TestCaseRegInfo::Reduced { name, reginfo } => {
                writeln!(f, "Using reduced target based on {name}:\n{reginfo}")?;
            }
        }
        writeln!(f, "{:?}", self.options)?;
        writeln!(f, "{}", DisplayFunction(&self.func))
    }
}
