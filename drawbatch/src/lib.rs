//! Batched draw command compilation with GPU frustum culling.
//!
//! Draw items that share storage are grouped into a [`DrawBatch`]. The batch
//! encodes one draw command record per item into a dispatch buffer, lets the
//! GPU cull instances by rewriting their instance counts, and then issues all
//! draws with a handful of indirect calls.
//!
//! Everything goes through a [`GfxDevice`](device::GfxDevice).
//! [`HeadlessDevice`](device::HeadlessDevice) runs the whole pipeline on the
//! CPU, [`WgpuDevice`](device::WgpuDevice) runs it on a GPU.

pub mod batch;
pub mod buffer;
pub mod culling;
pub mod device;
pub mod error;
pub mod item;
pub mod layout;
pub mod options;
pub mod pass;
pub mod program;
pub mod registry;
pub mod util;

pub use batch::{DrawBatch, ValidationResult};
pub use error::*;
pub use options::BatchOptions;
pub use registry::ResourceRegistry;

/// Reexport of [`drawbatch_types`] with some added wgpu re-exports.
pub mod types {
    pub use drawbatch_types::*;
}
