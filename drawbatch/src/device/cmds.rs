use drawbatch_types::{BufferHandle, PipelineHandle};

use crate::util::typedefs::SsoString;

/// One buffer bound to a binding slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ResourceBindingEntry {
    pub binding: u32,
    pub buffer: BufferHandle,
    pub offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResourceBindings {
    pub entries: Vec<ResourceBindingEntry>,
}

impl ResourceBindings {
    pub fn push(&mut self, binding: u32, buffer: BufferHandle) {
        self.entries.push(ResourceBindingEntry {
            binding,
            buffer,
            offset: 0,
        });
    }

    pub fn get(&self, binding: u32) -> Option<BufferHandle> {
        self.entries.iter().find(|e| e.binding == binding).map(|e| e.buffer)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferBinding {
    pub slot: u32,
    pub buffer: BufferHandle,
    pub byte_offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComputeCmd {
    PushDebugGroup(SsoString),
    PopDebugGroup,
    /// Ordered with the surrounding dispatches, unlike a device level write.
    UpdateBuffer {
        buffer: BufferHandle,
        offset: u64,
        data: Vec<u8>,
    },
    BindPipeline(PipelineHandle),
    BindResources(ResourceBindings),
    /// One invocation per draw command.
    Dispatch { invocations: u32 },
    /// One invocation per instance of every draw command, reading instance
    /// counts from the cull input records.
    DispatchPerInstance {
        cull_input: BufferHandle,
        records: u32,
        command_num_uints: u32,
        cull_instance_count_word: u32,
    },
    MemoryBarrier,
}

/// Recorded compute work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeCmds {
    cmds: Vec<ComputeCmd>,
}

impl ComputeCmds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_debug_group(&mut self, label: SsoString) {
        self.cmds.push(ComputeCmd::PushDebugGroup(label));
    }

    pub fn pop_debug_group(&mut self) {
        self.cmds.push(ComputeCmd::PopDebugGroup);
    }

    pub fn update_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.cmds.push(ComputeCmd::UpdateBuffer {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.cmds.push(ComputeCmd::BindPipeline(pipeline));
    }

    pub fn bind_resources(&mut self, bindings: ResourceBindings) {
        self.cmds.push(ComputeCmd::BindResources(bindings));
    }

    pub fn dispatch(&mut self, invocations: u32) {
        self.cmds.push(ComputeCmd::Dispatch { invocations });
    }

    pub fn dispatch_per_instance(
        &mut self,
        cull_input: BufferHandle,
        records: u32,
        command_num_uints: u32,
        cull_instance_count_word: u32,
    ) {
        self.cmds.push(ComputeCmd::DispatchPerInstance {
            cull_input,
            records,
            command_num_uints,
            cull_instance_count_word,
        });
    }

    pub fn memory_barrier(&mut self) {
        self.cmds.push(ComputeCmd::MemoryBarrier);
    }

    pub fn commands(&self) -> &[ComputeCmd] {
        &self.cmds
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn into_commands(self) -> Vec<ComputeCmd> {
        self.cmds
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphicsCmd {
    PushDebugGroup(SsoString),
    PopDebugGroup,
    BindPipeline(PipelineHandle),
    BindResources(ResourceBindings),
    BindVertexBuffers(Vec<VertexBufferBinding>),
    Draw {
        vertex_count: u32,
        base_vertex: u32,
        instance_count: u32,
        base_instance: u32,
    },
    DrawIndexed {
        index_buffer: BufferHandle,
        index_count: u32,
        index_byte_offset: u64,
        base_vertex: u32,
        instance_count: u32,
        base_instance: u32,
    },
    DrawIndirect {
        draw_buffer: BufferHandle,
        byte_offset: u64,
        draw_count: u32,
        stride: u32,
    },
    DrawIndexedIndirect {
        index_buffer: BufferHandle,
        draw_buffer: BufferHandle,
        byte_offset: u64,
        draw_count: u32,
        stride: u32,
        /// Where `vertexDC` lives inside each record, for patch draws whose
        /// vertex bindings are offset per draw.
        patch_base_vertex_byte_offset: Option<u32>,
    },
    MemoryBarrier,
}

/// Recorded draw work for one render pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphicsCmds {
    cmds: Vec<GraphicsCmd>,
    bound_pipeline: Option<PipelineHandle>,
}

impl GraphicsCmds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_debug_group(&mut self, label: SsoString) {
        self.cmds.push(GraphicsCmd::PushDebugGroup(label));
    }

    pub fn pop_debug_group(&mut self) {
        self.cmds.push(GraphicsCmd::PopDebugGroup);
    }

    /// Binds `pipeline`. Unless `force` is set, rebinding the pipeline that is
    /// already bound is skipped.
    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle, force: bool) {
        if !force && self.bound_pipeline == Some(pipeline) {
            return;
        }
        self.bound_pipeline = Some(pipeline);
        self.cmds.push(GraphicsCmd::BindPipeline(pipeline));
    }

    pub fn bound_pipeline(&self) -> Option<PipelineHandle> {
        self.bound_pipeline
    }

    pub fn bind_resources(&mut self, bindings: ResourceBindings) {
        self.cmds.push(GraphicsCmd::BindResources(bindings));
    }

    pub fn bind_vertex_buffers(&mut self, bindings: Vec<VertexBufferBinding>) {
        self.cmds.push(GraphicsCmd::BindVertexBuffers(bindings));
    }

    pub fn draw(&mut self, vertex_count: u32, base_vertex: u32, instance_count: u32, base_instance: u32) {
        self.cmds.push(GraphicsCmd::Draw {
            vertex_count,
            base_vertex,
            instance_count,
            base_instance,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_buffer: BufferHandle,
        index_count: u32,
        index_byte_offset: u64,
        base_vertex: u32,
        instance_count: u32,
        base_instance: u32,
    ) {
        self.cmds.push(GraphicsCmd::DrawIndexed {
            index_buffer,
            index_count,
            index_byte_offset,
            base_vertex,
            instance_count,
            base_instance,
        });
    }

    pub fn draw_indirect(&mut self, draw_buffer: BufferHandle, byte_offset: u64, draw_count: u32, stride: u32) {
        self.cmds.push(GraphicsCmd::DrawIndirect {
            draw_buffer,
            byte_offset,
            draw_count,
            stride,
        });
    }

    pub fn draw_indexed_indirect(
        &mut self,
        index_buffer: BufferHandle,
        draw_buffer: BufferHandle,
        byte_offset: u64,
        draw_count: u32,
        stride: u32,
        patch_base_vertex_byte_offset: Option<u32>,
    ) {
        self.cmds.push(GraphicsCmd::DrawIndexedIndirect {
            index_buffer,
            draw_buffer,
            byte_offset,
            draw_count,
            stride,
            patch_base_vertex_byte_offset,
        });
    }

    pub fn memory_barrier(&mut self) {
        self.cmds.push(GraphicsCmd::MemoryBarrier);
    }

    pub fn commands(&self) -> &[GraphicsCmd] {
        &self.cmds
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }
}
