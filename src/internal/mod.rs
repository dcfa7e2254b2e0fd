//! Internal implementation details of the allocator that are not part of the
//! public API.

pub(crate) mod allocator;
pub(crate) mod liveness;
pub(crate) mod state;
