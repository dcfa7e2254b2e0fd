//! Checks that dumping a function and then re-parsing it is lossless.

#![no_main]

use libfuzzer_sys::fuzz_target;
use local_regalloc::debug_utils;
use local_regalloc::function::Function;
use local_regalloc_fuzz::TestCase;

fuzz_target!(|t: TestCase| {
    // Ensure the logger is initialized.
    let _ = pretty_env_logger::try_init();

    let dumped = debug_utils::DisplayFunction(&t.func).to_string();
    let parsed = Function::parse(&dumped).unwrap();
    let dumped2 = debug_utils::DisplayFunction(&parsed).to_string();
    assert_eq!(dumped, dumped2);
    assert_eq!(parsed, t.func);
});
