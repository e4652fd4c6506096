use std::{
    borrow::Cow,
    num::NonZeroU64,
    ops::Range,
    sync::Arc,
    time::{Duration, Instant},
};

use drawbatch_types::{BufferHandle, BufferUsages, ElementFormat, PipelineHandle, PrimitiveType, ProgramHandle};
use parking_lot::RwLock;
use wgpu::util::DeviceExt;

use crate::{
    culling::CULL_WORKGROUP_SIZE,
    device::{
        BindingKind, BindingLayoutEntry, BufferDesc, ComputeCmd, ComputeCmds, ComputePipelineDesc, DeviceCapabilities,
        GfxDevice, GraphicsCmd, GraphicsCmds, GraphicsPipelineDesc, ProgramDesc, ResourceBindings, ShaderStages,
        VertexStep,
    },
    error::DeviceError,
    format_sso,
    util::{
        error_scope::ValidationErrorScope,
        math::{round_up, round_up_div},
        typedefs::{FastHashMap, SsoString},
    },
};

#[derive(Clone)]
struct ComputePipelineEntry {
    pipeline: Arc<wgpu::ComputePipeline>,
    layout: Arc<wgpu::BindGroupLayout>,
    bindings: Vec<BindingLayoutEntry>,
}

#[derive(Clone)]
struct GraphicsPipelineEntry {
    pipeline: Arc<wgpu::RenderPipeline>,
    layout: Option<Arc<wgpu::BindGroupLayout>>,
    bindings: Vec<BindingLayoutEntry>,
    /// Slot and record stride of the per draw command vertex buffer.
    draw_command_slot: Option<(u32, u64)>,
}

#[derive(Default)]
struct WgpuState {
    buffers: FastHashMap<usize, Arc<wgpu::Buffer>>,
    programs: FastHashMap<usize, Arc<wgpu::ShaderModule>>,
    compute_pipelines: FastHashMap<usize, ComputePipelineEntry>,
    graphics_pipelines: FastHashMap<usize, GraphicsPipelineEntry>,
    next_id: usize,
}

impl WgpuState {
    fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, buffer: BufferHandle) -> Result<&Arc<wgpu::Buffer>, DeviceError> {
        self.buffers.get(&buffer.idx).ok_or(DeviceError::UnknownBuffer(buffer))
    }

    fn program(&self, label: &SsoString, program: ProgramHandle) -> Result<&Arc<wgpu::ShaderModule>, DeviceError> {
        self.programs
            .get(&program.idx)
            .ok_or_else(|| DeviceError::ProgramCompilation {
                label: label.clone(),
                message: format!("unknown program {}", program.idx),
            })
    }
}

/// [`GfxDevice`] backed by a wgpu device and queue.
///
/// Per-draw-command vertex buffers are bound with a zero stride and rebound at
/// each record before its draw, so multi draw indirect is expanded into one
/// indirect draw per record. Hardware tessellation is not available.
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    capabilities: DeviceCapabilities,
    state: RwLock<WgpuState>,
}

impl WgpuDevice {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let mut capabilities = DeviceCapabilities::SINGLE_PASS_CULLING;
        // records carry their batch position in baseInstance
        if device.features().contains(wgpu::Features::INDIRECT_FIRST_INSTANCE) {
            capabilities |= DeviceCapabilities::MULTI_DRAW_INDIRECT;
        }
        Self {
            device,
            queue,
            capabilities,
            state: RwLock::default(),
        }
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    /// The wgpu buffer behind `buffer`, for binding outside of batches.
    pub fn raw_buffer(&self, buffer: BufferHandle) -> Option<Arc<wgpu::Buffer>> {
        self.state.read().buffers.get(&buffer.idx).cloned()
    }

    fn create_bind_group_layout(&self, label: &str, bindings: &[BindingLayoutEntry]) -> wgpu::BindGroupLayout {
        let entries: Vec<_> = bindings
            .iter()
            .map(|entry| wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: map_stages(entry.stages),
                ty: wgpu::BindingType::Buffer {
                    ty: match entry.kind {
                        BindingKind::Uniform => wgpu::BufferBindingType::Uniform,
                        BindingKind::Storage { read_only } => wgpu::BufferBindingType::Storage { read_only },
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        })
    }

    fn create_bind_group(
        &self,
        state: &WgpuState,
        layout: &wgpu::BindGroupLayout,
        bindings: &[BindingLayoutEntry],
        resources: &ResourceBindings,
    ) -> Result<wgpu::BindGroup, DeviceError> {
        let mut buffers = Vec::with_capacity(bindings.len());
        for entry in bindings {
            let resource = resources
                .entries
                .iter()
                .find(|r| r.binding == entry.binding)
                .ok_or(DeviceError::MissingBinding(entry.binding))?;
            buffers.push((entry.binding, state.buffer(resource.buffer)?, resource.offset));
        }
        let entries: Vec<_> = buffers
            .iter()
            .map(|&(binding, buffer, offset)| wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer,
                    offset,
                    size: NonZeroU64::new(buffer.size() - offset),
                }),
            })
            .collect();
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout,
            entries: &entries,
        }))
    }

    /// Turns recorded draws into operations replayable on a wgpu render pass.
    pub fn encode_graphics(&self, cmds: &GraphicsCmds) -> Result<WgpuGraphicsEncoding, DeviceError> {
        profiling::scope!("WgpuDevice::encode_graphics");

        let state = self.state.read();
        let mut ops = Vec::new();
        let mut pipeline: Option<&GraphicsPipelineEntry> = None;
        // per draw command buffer and the offset it was bound at
        let mut draw_commands: Option<(Arc<wgpu::Buffer>, u64)> = None;
        let mut index_buffer: Option<BufferHandle> = None;

        let bind_record = |ops: &mut Vec<RenderOp>,
                           pipeline: Option<&GraphicsPipelineEntry>,
                           draw_commands: &Option<(Arc<wgpu::Buffer>, u64)>,
                           record_offset: u64| {
            if let (Some((slot, _)), Some((buffer, base))) = (pipeline.and_then(|p| p.draw_command_slot), draw_commands)
            {
                ops.push(RenderOp::SetVertexBuffer {
                    slot,
                    buffer: Arc::clone(buffer),
                    offset: base + record_offset,
                });
            }
        };
        let record_stride = |pipeline: Option<&GraphicsPipelineEntry>| {
            pipeline.and_then(|p| p.draw_command_slot).map_or(0, |(_, stride)| stride)
        };

        for cmd in cmds.commands() {
            match cmd {
                GraphicsCmd::PushDebugGroup(label) => ops.push(RenderOp::PushDebugGroup(label.clone())),
                GraphicsCmd::PopDebugGroup => ops.push(RenderOp::PopDebugGroup),
                GraphicsCmd::BindPipeline(handle) => {
                    let entry = state
                        .graphics_pipelines
                        .get(&handle.idx)
                        .ok_or(DeviceError::UnknownPipeline(*handle))?;
                    ops.push(RenderOp::SetPipeline(Arc::clone(&entry.pipeline)));
                    pipeline = Some(entry);
                }
                GraphicsCmd::BindResources(resources) => {
                    let Some(entry) = pipeline else {
                        return Err(DeviceError::Unsupported(format_sso!("binding resources without a pipeline")));
                    };
                    if let Some(layout) = &entry.layout {
                        let group = self.create_bind_group(&state, layout, &entry.bindings, resources)?;
                        ops.push(RenderOp::SetBindGroup(Arc::new(group)));
                    }
                }
                GraphicsCmd::BindVertexBuffers(bindings) => {
                    let draw_command_slot = pipeline.and_then(|p| p.draw_command_slot).map(|(slot, _)| slot);
                    for binding in bindings {
                        let buffer = Arc::clone(state.buffer(binding.buffer)?);
                        if Some(binding.slot) == draw_command_slot {
                            draw_commands = Some((buffer, binding.byte_offset));
                        } else {
                            ops.push(RenderOp::SetVertexBuffer {
                                slot: binding.slot,
                                buffer,
                                offset: binding.byte_offset,
                            });
                        }
                    }
                }
                &GraphicsCmd::Draw {
                    vertex_count,
                    base_vertex,
                    instance_count,
                    base_instance,
                } => {
                    bind_record(&mut ops, pipeline, &draw_commands, base_instance as u64 * record_stride(pipeline));
                    ops.push(RenderOp::Draw {
                        vertices: base_vertex..base_vertex + vertex_count,
                        instances: base_instance..base_instance + instance_count,
                    });
                }
                &GraphicsCmd::DrawIndexed {
                    index_buffer: indices,
                    index_count,
                    index_byte_offset,
                    base_vertex,
                    instance_count,
                    base_instance,
                } => {
                    if index_buffer != Some(indices) {
                        ops.push(RenderOp::SetIndexBuffer(Arc::clone(state.buffer(indices)?)));
                        index_buffer = Some(indices);
                    }
                    bind_record(&mut ops, pipeline, &draw_commands, base_instance as u64 * record_stride(pipeline));
                    let first_index = (index_byte_offset / 4) as u32;
                    ops.push(RenderOp::DrawIndexed {
                        indices: first_index..first_index + index_count,
                        base_vertex: base_vertex as i32,
                        instances: base_instance..base_instance + instance_count,
                    });
                }
                &GraphicsCmd::DrawIndirect {
                    draw_buffer,
                    byte_offset,
                    draw_count,
                    stride,
                } => {
                    let buffer = state.buffer(draw_buffer)?;
                    for record in 0..draw_count as u64 {
                        let offset = byte_offset + record * stride as u64;
                        bind_record(&mut ops, pipeline, &draw_commands, record * record_stride(pipeline));
                        ops.push(RenderOp::DrawIndirect {
                            buffer: Arc::clone(buffer),
                            offset,
                        });
                    }
                }
                &GraphicsCmd::DrawIndexedIndirect {
                    index_buffer: indices,
                    draw_buffer,
                    byte_offset,
                    draw_count,
                    stride,
                    patch_base_vertex_byte_offset,
                } => {
                    if patch_base_vertex_byte_offset.is_some() {
                        return Err(DeviceError::Unsupported(format_sso!("patch draws")));
                    }
                    if index_buffer != Some(indices) {
                        ops.push(RenderOp::SetIndexBuffer(Arc::clone(state.buffer(indices)?)));
                        index_buffer = Some(indices);
                    }
                    let buffer = state.buffer(draw_buffer)?;
                    for record in 0..draw_count as u64 {
                        let offset = byte_offset + record * stride as u64;
                        bind_record(&mut ops, pipeline, &draw_commands, record * record_stride(pipeline));
                        ops.push(RenderOp::DrawIndexedIndirect {
                            buffer: Arc::clone(buffer),
                            offset,
                        });
                    }
                }
                // render passes are already ordered against earlier compute work
                GraphicsCmd::MemoryBarrier => {}
            }
        }

        Ok(WgpuGraphicsEncoding { ops })
    }
}

enum RenderOp {
    PushDebugGroup(SsoString),
    PopDebugGroup,
    SetPipeline(Arc<wgpu::RenderPipeline>),
    SetBindGroup(Arc<wgpu::BindGroup>),
    SetVertexBuffer {
        slot: u32,
        buffer: Arc<wgpu::Buffer>,
        offset: u64,
    },
    SetIndexBuffer(Arc<wgpu::Buffer>),
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
    DrawIndirect {
        buffer: Arc<wgpu::Buffer>,
        offset: u64,
    },
    DrawIndexedIndirect {
        buffer: Arc<wgpu::Buffer>,
        offset: u64,
    },
}

/// Graphics work encoded for wgpu, holding every object it references.
pub struct WgpuGraphicsEncoding {
    ops: Vec<RenderOp>,
}

impl WgpuGraphicsEncoding {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn record<'a>(&'a self, rpass: &mut wgpu::RenderPass<'a>) {
        for op in &self.ops {
            match op {
                RenderOp::PushDebugGroup(label) => rpass.push_debug_group(label),
                RenderOp::PopDebugGroup => rpass.pop_debug_group(),
                RenderOp::SetPipeline(pipeline) => rpass.set_pipeline(pipeline),
                RenderOp::SetBindGroup(group) => rpass.set_bind_group(0, group, &[]),
                RenderOp::SetVertexBuffer { slot, buffer, offset } => {
                    rpass.set_vertex_buffer(*slot, buffer.slice(*offset..))
                }
                RenderOp::SetIndexBuffer(buffer) => rpass.set_index_buffer(buffer.slice(..), wgpu::IndexFormat::Uint32),
                RenderOp::Draw { vertices, instances } => rpass.draw(vertices.clone(), instances.clone()),
                RenderOp::DrawIndexed {
                    indices,
                    base_vertex,
                    instances,
                } => rpass.draw_indexed(indices.clone(), *base_vertex, instances.clone()),
                RenderOp::DrawIndirect { buffer, offset } => rpass.draw_indirect(buffer, *offset),
                RenderOp::DrawIndexedIndirect { buffer, offset } => rpass.draw_indexed_indirect(buffer, *offset),
            }
        }
    }
}

fn map_stages(stages: ShaderStages) -> wgpu::ShaderStages {
    let mut out = wgpu::ShaderStages::NONE;
    if stages.contains(ShaderStages::VERTEX) {
        out |= wgpu::ShaderStages::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        out |= wgpu::ShaderStages::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        out |= wgpu::ShaderStages::COMPUTE;
    }
    out
}

fn map_usages(usage: BufferUsages) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
    for (ours, theirs) in [
        (BufferUsages::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsages::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsages::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsages::INDEX, wgpu::BufferUsages::INDEX),
        (BufferUsages::INDIRECT, wgpu::BufferUsages::INDIRECT),
    ] {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

fn map_vertex_format(format: ElementFormat) -> Result<wgpu::VertexFormat, DeviceError> {
    Ok(match format {
        ElementFormat::Uint32 => wgpu::VertexFormat::Uint32,
        ElementFormat::Uint32x2 => wgpu::VertexFormat::Uint32x2,
        ElementFormat::Uint32x3 => wgpu::VertexFormat::Uint32x3,
        ElementFormat::Uint32x4 => wgpu::VertexFormat::Uint32x4,
        ElementFormat::Float32 => wgpu::VertexFormat::Float32,
        ElementFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        ElementFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        ElementFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        ElementFormat::Float16x2 => wgpu::VertexFormat::Float16x2,
        ElementFormat::Float32x4x4 | ElementFormat::CullData => {
            return Err(DeviceError::Unsupported(format_sso!("{format:?} vertex attributes")))
        }
    })
}

fn map_topology(primitive: PrimitiveType) -> Result<wgpu::PrimitiveTopology, DeviceError> {
    match primitive {
        PrimitiveType::Points => Ok(wgpu::PrimitiveTopology::PointList),
        PrimitiveType::Lines => Ok(wgpu::PrimitiveTopology::LineList),
        PrimitiveType::Triangles | PrimitiveType::TriQuads => Ok(wgpu::PrimitiveTopology::TriangleList),
        PrimitiveType::Quads | PrimitiveType::Patches { .. } => {
            Err(DeviceError::Unsupported(format_sso!("{primitive:?} primitives")))
        }
    }
}

fn scope_result(label: &SsoString, scope: ValidationErrorScope<'_>) -> Result<(), DeviceError> {
    scope.end().map_err(|e| DeviceError::ProgramCompilation {
        label: label.clone(),
        message: e.to_string(),
    })
}

impl GfxDevice for WgpuDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn create_buffer(&self, desc: &BufferDesc) -> BufferHandle {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size: round_up(desc.size.max(4), wgpu::COPY_BUFFER_ALIGNMENT),
            usage: map_usages(desc.usage),
            mapped_at_creation: false,
        });
        let mut state = self.state.write();
        let idx = state.next_id();
        state.buffers.insert(idx, Arc::new(buffer));
        BufferHandle::new(idx)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if let Some(buffer) = self.state.write().buffers.remove(&buffer.idx) {
            buffer.destroy();
        }
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.state.read().buffers.get(&buffer.idx).map(|b| b.size())
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let state = self.state.read();
        match state.buffer(buffer) {
            Ok(target) => self.queue.write_buffer(target, offset, data),
            Err(e) => log::error!("Buffer write failed: {e}"),
        }
    }

    fn create_program(&self, desc: &ProgramDesc) -> Result<ProgramHandle, DeviceError> {
        profiling::scope!("WgpuDevice::create_program");

        let scope = ValidationErrorScope::new(&self.device);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&desc.label),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&desc.source)),
        });
        scope_result(&desc.label, scope)?;

        let mut state = self.state.write();
        let idx = state.next_id();
        state.programs.insert(idx, Arc::new(module));
        Ok(ProgramHandle::new(idx))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<PipelineHandle, DeviceError> {
        profiling::scope!("WgpuDevice::create_compute_pipeline");

        let module = Arc::clone(self.state.read().program(&desc.label, desc.program)?);

        let scope = ValidationErrorScope::new(&self.device);
        let bgl = self.create_bind_group_layout(&desc.label, &desc.bindings);
        let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&desc.label),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&desc.label),
            layout: Some(&layout),
            module: &module,
            entry_point: &desc.entry_point,
        });
        scope_result(&desc.label, scope)?;

        let mut state = self.state.write();
        let idx = state.next_id();
        state.compute_pipelines.insert(
            idx,
            ComputePipelineEntry {
                pipeline: Arc::new(pipeline),
                layout: Arc::new(bgl),
                bindings: desc.bindings.clone(),
            },
        );
        Ok(PipelineHandle::new(idx))
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<PipelineHandle, DeviceError> {
        profiling::scope!("WgpuDevice::create_graphics_pipeline");

        let topology = map_topology(desc.primitive)?;
        let module = Arc::clone(self.state.read().program(&desc.label, desc.program)?);

        // wgpu indexes vertex buffers by position, so gaps get empty layouts
        let slot_count = desc.vertex_buffers.iter().map(|b| b.slot + 1).max().unwrap_or(0) as usize;
        let mut attributes = vec![Vec::new(); slot_count];
        let mut strides = vec![(0, wgpu::VertexStepMode::Vertex); slot_count];
        let mut draw_command_slot = None;
        for buffer in &desc.vertex_buffers {
            let slot = buffer.slot as usize;
            for attribute in &buffer.attributes {
                attributes[slot].push(wgpu::VertexAttribute {
                    format: map_vertex_format(attribute.format)?,
                    offset: attribute.offset,
                    shader_location: attribute.location,
                });
            }
            strides[slot] = match buffer.step {
                VertexStep::PerVertex => (buffer.stride, wgpu::VertexStepMode::Vertex),
                VertexStep::PerDrawCommand => {
                    draw_command_slot = Some((buffer.slot, buffer.stride));
                    (0, wgpu::VertexStepMode::Instance)
                }
            };
        }
        let vertex_buffers: Vec<_> = attributes
            .iter()
            .zip(&strides)
            .map(|(attributes, &(array_stride, step_mode))| wgpu::VertexBufferLayout {
                array_stride,
                step_mode,
                attributes,
            })
            .collect();

        let scope = ValidationErrorScope::new(&self.device);
        let bgl = (!desc.bindings.is_empty()).then(|| self.create_bind_group_layout(&desc.label, &desc.bindings));
        let bind_group_layouts: Vec<&wgpu::BindGroupLayout> = bgl.iter().collect();
        let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&desc.label),
            bind_group_layouts: &bind_group_layouts,
            push_constant_ranges: &[],
        });

        let targets: Vec<_> = desc
            .color_format
            .filter(|_| desc.rasterizer_enabled)
            .map(|format| wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })
            .into_iter()
            .map(Some)
            .collect();
        let fragment = match (&desc.fragment_entry, desc.rasterizer_enabled) {
            (Some(entry_point), true) => Some(wgpu::FragmentState {
                module: &module,
                entry_point,
                targets: &targets,
            }),
            _ => None,
        };

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&desc.label),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: &desc.vertex_entry,
                buffers: &vertex_buffers,
            },
            primitive: wgpu::PrimitiveState {
                topology,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: desc.cull_face,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: desc
                .depth_format
                .filter(|_| desc.rasterizer_enabled)
                .map(|format| wgpu::DepthStencilState {
                    format,
                    depth_write_enabled: desc.depth_write,
                    depth_compare: desc.depth_compare,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
            multisample: wgpu::MultisampleState {
                count: desc.sample_count,
                ..Default::default()
            },
            fragment,
            multiview: None,
        });
        scope_result(&desc.label, scope)?;

        let mut state = self.state.write();
        let idx = state.next_id();
        state.graphics_pipelines.insert(
            idx,
            GraphicsPipelineEntry {
                pipeline: Arc::new(pipeline),
                layout: bgl.map(Arc::new),
                bindings: desc.bindings.clone(),
                draw_command_slot,
            },
        );
        Ok(PipelineHandle::new(idx))
    }

    fn submit_compute(&self, cmds: ComputeCmds) -> Result<(), DeviceError> {
        profiling::scope!("WgpuDevice::submit_compute");

        let state = self.state.read();
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("drawbatch compute"),
        });
        let mut pipeline: Option<&ComputePipelineEntry> = None;
        let mut resources = ResourceBindings::default();

        for cmd in cmds.into_commands() {
            match cmd {
                ComputeCmd::PushDebugGroup(label) => encoder.push_debug_group(&label),
                ComputeCmd::PopDebugGroup => encoder.pop_debug_group(),
                ComputeCmd::UpdateBuffer { buffer, offset, mut data } => {
                    let target = state.buffer(buffer)?;
                    data.resize(round_up(data.len(), wgpu::COPY_BUFFER_ALIGNMENT as usize), 0);
                    let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("drawbatch update staging"),
                        contents: &data,
                        usage: wgpu::BufferUsages::COPY_SRC,
                    });
                    encoder.copy_buffer_to_buffer(&staging, 0, target, offset, data.len() as u64);
                }
                ComputeCmd::BindPipeline(handle) => {
                    pipeline = Some(
                        state
                            .compute_pipelines
                            .get(&handle.idx)
                            .ok_or(DeviceError::UnknownPipeline(handle))?,
                    );
                }
                ComputeCmd::BindResources(bindings) => resources = bindings,
                ComputeCmd::Dispatch { invocations } => {
                    let Some(entry) = pipeline else {
                        return Err(DeviceError::Unsupported(format_sso!("dispatch without a bound pipeline")));
                    };
                    let group = self.create_bind_group(&state, &entry.layout, &entry.bindings, &resources)?;
                    let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("frustum cull"),
                        timestamp_writes: None,
                    });
                    cpass.set_pipeline(&entry.pipeline);
                    cpass.set_bind_group(0, &group, &[]);
                    cpass.dispatch_workgroups(round_up_div(invocations, CULL_WORKGROUP_SIZE), 1, 1);
                }
                ComputeCmd::DispatchPerInstance { .. } => {
                    return Err(DeviceError::Unsupported(format_sso!("per-instance dispatch")));
                }
                // passes inside one encoder are already ordered
                ComputeCmd::MemoryBarrier => {}
            }
        }

        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, DeviceError> {
        profiling::scope!("WgpuDevice::read_buffer");

        let source = Arc::clone(self.state.read().buffer(buffer)?);
        if offset + size > source.size() {
            return Err(DeviceError::OutOfRange { buffer, offset, size });
        }
        let aligned = round_up(size.max(4), wgpu::COPY_BUFFER_ALIGNMENT);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("drawbatch readback staging"),
            size: aligned,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("drawbatch readback"),
        });
        encoder.copy_buffer_to_buffer(&source, offset, &staging, 0, aligned.min(source.size() - offset));
        self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = flume::bounded(1);
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        let start = Instant::now();
        loop {
            self.device.poll(wgpu::Maintain::Poll);
            match receiver.try_recv() {
                Ok(Ok(())) => break,
                Ok(Err(e)) => return Err(DeviceError::MapFailed(e)),
                Err(_) if start.elapsed() >= timeout => return Err(DeviceError::Timeout(timeout)),
                Err(_) => std::thread::yield_now(),
            }
        }

        let data = staging.slice(..).get_mapped_range()[..size as usize].to_vec();
        staging.unmap();
        Ok(data)
    }
}
