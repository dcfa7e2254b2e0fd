//! Utility functions and types for debugging register allocation.
//!
//! These are not needed for normal compilation, but are useful during
//! development of both the register allocator itself and users of the register
//! allocator.

#[cfg(feature = "arbitrary")]
mod arbitrary;
mod checker;
mod display;
mod generic_reginfo;
#[cfg(feature = "parse")]
mod parse;
mod validate_func;
mod validate_reginfo;

#[cfg(feature = "arbitrary")]
pub use arbitrary::ArbitraryFunctionConfig;
pub use checker::*;
pub use display::*;
pub use generic_reginfo::*;
pub use validate_func::*;
pub use validate_reginfo::*;
