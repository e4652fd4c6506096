//! The graphics device batches record work against.
//!
//! Two devices are provided: [`HeadlessDevice`], which executes everything on
//! the CPU and is what the tests run on, and [`WgpuDevice`].

use std::time::Duration;

use drawbatch_types::{
    BufferHandle, BufferUsages, CompareFunction, ElementFormat, Face, PipelineHandle, PrimitiveType, ProgramHandle,
    TextureFormat,
};

use crate::{culling::CullingShaderKey, error::DeviceError, util::typedefs::SsoString};

mod cmds;
mod headless;
mod wgpu_device;

pub use cmds::*;
pub use headless::*;
pub use wgpu_device::*;

bitflags::bitflags! {
    /// Optional device features batches branch on.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DeviceCapabilities: u32 {
        /// Draw commands can be consumed straight from a strided buffer.
        const MULTI_DRAW_INDIRECT = 1 << 0;
        /// Culling runs as one compute invocation per draw command.
        /// Without it culling uses a reset round and a per-instance count round.
        const SINGLE_PASS_CULLING = 1 << 1;
        /// Patch primitives can be rasterized.
        const HARDWARE_TESSELLATION = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: SsoString,
    pub size: u64,
    pub usage: BufferUsages,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Uniform,
    Storage { read_only: bool },
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BindingLayoutEntry {
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: ShaderStages,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VertexStep {
    PerVertex,
    /// Advances once per draw command rather than per vertex or instance.
    PerDrawCommand,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct VertexAttributeDesc {
    pub format: ElementFormat,
    pub offset: u64,
    pub location: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferDesc {
    pub slot: u32,
    pub stride: u64,
    pub step: VertexStep,
    pub attributes: Vec<VertexAttributeDesc>,
}

/// Source of a shader program.
#[derive(Debug, Clone)]
pub struct ProgramDesc {
    pub label: SsoString,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDesc {
    pub label: SsoString,
    pub program: ProgramHandle,
    pub entry_point: SsoString,
    pub bindings: Vec<BindingLayoutEntry>,
    /// The kernel the program implements, for devices that cannot run shader code.
    pub kernel: ComputeKernel,
}

/// Compute kernels with a native implementation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ComputeKernel {
    FrustumCull(CullingShaderKey),
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub label: SsoString,
    pub program: ProgramHandle,
    pub vertex_entry: SsoString,
    pub fragment_entry: Option<SsoString>,
    pub vertex_buffers: Vec<VertexBufferDesc>,
    pub bindings: Vec<BindingLayoutEntry>,
    pub primitive: PrimitiveType,
    /// Disabled for passes that only run the vertex stages for their side effects.
    pub rasterizer_enabled: bool,
    pub color_format: Option<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub depth_compare: CompareFunction,
    pub depth_write: bool,
    pub cull_face: Option<Face>,
    pub sample_count: u32,
}

/// Everything a batch needs from the graphics API.
///
/// Work is recorded into [`ComputeCmds`] and [`GraphicsCmds`]; compute work is
/// submitted through the device, graphics work is encoded by whoever owns the
/// render pass.
pub trait GfxDevice: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    fn create_buffer(&self, desc: &BufferDesc) -> BufferHandle;
    fn destroy_buffer(&self, buffer: BufferHandle);
    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64>;
    /// Queues a write that becomes visible to work submitted afterwards.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]);

    fn create_program(&self, desc: &ProgramDesc) -> Result<ProgramHandle, DeviceError>;
    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<PipelineHandle, DeviceError>;
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<PipelineHandle, DeviceError>;

    fn submit_compute(&self, cmds: ComputeCmds) -> Result<(), DeviceError>;

    /// Waits for all submitted work, then reads `size` bytes back.
    fn read_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, DeviceError>;
}
