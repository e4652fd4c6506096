use std::sync::Arc;

use drawbatch_types::{BufferHandle, ElementFormat};

use crate::{
    device::{BufferDesc, GfxDevice},
    util::typedefs::SsoString,
};

/// A device buffer destroyed when dropped.
pub struct GpuBuffer {
    device: Arc<dyn GfxDevice>,
    handle: BufferHandle,
    size: u64,
}

impl GpuBuffer {
    pub fn new(device: Arc<dyn GfxDevice>, desc: &BufferDesc) -> Self {
        let handle = device.create_buffer(desc);
        Self {
            device,
            handle,
            size: desc.size,
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn write(&self, offset: u64, data: &[u8]) {
        self.device.write_buffer(self.handle, offset, data);
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.handle);
    }
}

/// Named typed window into a dispatch buffer, e.g. the drawing coordinates
/// read as per-draw vertex attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferResourceView {
    pub name: SsoString,
    pub format: ElementFormat,
    pub byte_offset: u32,
}

/// Flat array of draw command records living on the device.
#[derive(Debug)]
pub struct DispatchBuffer {
    buffer: GpuBuffer,
    count: u32,
    command_num_uints: u32,
    views: Vec<BufferResourceView>,
}

impl DispatchBuffer {
    pub(crate) fn new(buffer: GpuBuffer, count: u32, command_num_uints: u32) -> Self {
        Self {
            buffer,
            count,
            command_num_uints,
            views: Vec::new(),
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    /// Number of records.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn command_num_uints(&self) -> u32 {
        self.command_num_uints
    }

    pub fn stride_bytes(&self) -> u32 {
        self.command_num_uints * 4
    }

    /// Uploads the whole CPU side mirror.
    pub fn copy_data(&self, words: &[u32]) {
        debug_assert_eq!(words.len(), (self.count * self.command_num_uints) as usize);
        self.buffer.write(0, bytemuck::cast_slice(words));
    }

    pub fn add_resource_view(&mut self, name: &str, format: ElementFormat, byte_offset: u32) {
        self.views.push(BufferResourceView {
            name: SsoString::from(name),
            format,
            byte_offset,
        });
    }

    pub fn resource_view(&self, name: &str) -> Option<&BufferResourceView> {
        self.views.iter().find(|v| v.name == name)
    }

    pub fn resource_views(&self) -> &[BufferResourceView] {
        &self.views
    }
}
