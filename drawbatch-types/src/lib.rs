//! Type declarations for the drawbatch draw-command compiler.
//!
//! This is reexported in the drawbatch crate proper and includes everything
//! the scene layer needs to describe draw items: device object handles,
//! buffer arrays and the ranges into them, and geometric shader descriptors.

use std::{fmt::Debug, hash::Hash, marker::PhantomData};

/// Reexport of the glam version drawbatch is using.
pub use glam;
/// Reexport of the pipeline state types shared with wgpu.
pub use wgt::{CompareFunction, Face, TextureFormat};

mod buffer;
mod shader;

pub use buffer::*;
pub use shader::*;

/// Non-owning handle to an object living inside a graphics device.
///
/// Handles are only meaningful to the device that created them.
pub struct RawDeviceHandle<T> {
    /// Underlying value of the handle.
    pub idx: usize,
    _phantom: PhantomData<T>,
}

impl<T> RawDeviceHandle<T> {
    /// Creates a new handle with the given value
    pub const fn new(idx: usize) -> Self {
        Self {
            idx,
            _phantom: PhantomData,
        }
    }
}

// Need Debug/Copy/Clone impls that don't require T: Trait.
impl<T> Debug for RawDeviceHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawDeviceHandle").field("idx", &self.idx).finish()
    }
}

impl<T> Copy for RawDeviceHandle<T> {}

impl<T> Clone for RawDeviceHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for RawDeviceHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx
    }
}

impl<T> Eq for RawDeviceHandle<T> {}

impl<T> Hash for RawDeviceHandle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.idx.hash(state);
    }
}

/// Tag type for differentiating buffers on the type level.
#[doc(hidden)]
pub struct BufferTag;
/// Tag type for differentiating shader programs on the type level.
#[doc(hidden)]
pub struct ProgramTag;
/// Tag type for differentiating pipelines on the type level.
#[doc(hidden)]
pub struct PipelineTag;

/// Handle to a device buffer.
pub type BufferHandle = RawDeviceHandle<BufferTag>;
/// Handle to a compiled shader program.
pub type ProgramHandle = RawDeviceHandle<ProgramTag>;
/// Handle to a compute or graphics pipeline.
pub type PipelineHandle = RawDeviceHandle<PipelineTag>;

bitflags::bitflags! {
    /// How a device buffer is going to be used.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BufferUsages: u32 {
        const STORAGE = 1 << 0;
        const UNIFORM = 1 << 1;
        const VERTEX = 1 << 2;
        const INDEX = 1 << 3;
        const INDIRECT = 1 << 4;
        const COPY_SRC = 1 << 5;
        const COPY_DST = 1 << 6;
    }
}

impl BufferUsages {
    /// Usages of a dispatch buffer: written by culling, read by indirect draws
    /// and as per-draw vertex attributes.
    pub const DISPATCH: Self = Self::STORAGE
        .union(Self::VERTEX)
        .union(Self::INDIRECT)
        .union(Self::COPY_SRC)
        .union(Self::COPY_DST);
}
