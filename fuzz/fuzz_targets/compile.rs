//! Runs the register allocator on arbitrary functions and checks the result.

#![no_main]

use libfuzzer_sys::fuzz_target;
use local_regalloc::{debug_utils, RegAllocError, RegisterAllocator};
use local_regalloc_fuzz::TestCase;

fuzz_target!(|t: TestCase| {
    // Ensure the logger is initialized.
    let _ = pretty_env_logger::try_init();

    let mut allocated = t.func.clone();
    let mut regalloc = RegisterAllocator::new();
    // Validated targets always leave enough registers for every
    // instruction, so only implementation limits may be hit.
    let spill_slots = match regalloc.allocate_function(&mut allocated, t.reginfo(), &t.options) {
        Ok(spill_slots) => spill_slots,
        Err(RegAllocError::FunctionTooBig) => return,
        Err(err) => panic!("allocation failed: {err}"),
    };
    debug_utils::check_function(t.reginfo(), &t.func, &allocated, &spill_slots).unwrap();
});
