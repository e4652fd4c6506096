//! Utilities shared by the batch, culling and device code.

pub mod error_scope;
pub mod hash;
pub mod math;
pub mod typedefs;
