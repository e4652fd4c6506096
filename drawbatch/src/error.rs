use std::time::Duration;

use drawbatch_types::{BufferHandle, PipelineHandle};
use thiserror::Error;

use crate::util::typedefs::SsoString;

/// Failures reported by a [`GfxDevice`](crate::device::GfxDevice).
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Buffer {0:?} does not exist")]
    UnknownBuffer(BufferHandle),
    #[error("Pipeline {0:?} does not exist")]
    UnknownPipeline(PipelineHandle),
    #[error("Access of {size} bytes at offset {offset} is out of range of buffer {buffer:?}")]
    OutOfRange { buffer: BufferHandle, offset: u64, size: u64 },
    #[error("Binding {0} has no resource bound")]
    MissingBinding(u32),
    #[error("Device does not support {0}")]
    Unsupported(SsoString),
    #[error("Shader program {label} failed to compile: {message}")]
    ProgramCompilation { label: SsoString, message: String },
    #[error("Timed out after {0:?} waiting for the GPU")]
    Timeout(Duration),
    #[error("Failed to map buffer for reading")]
    MapFailed(#[source] wgpu::BufferAsyncError),
}

/// Failures while building a drawing or culling program.
#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("Draw item has no geometric shader")]
    MissingGeometricShader,
    #[error("Shader service could not compose a program: {0}")]
    Composition(String),
    #[error("Failed to render shader template {name}")]
    Template {
        name: SsoString,
        #[source]
        source: handlebars::RenderError,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
}
