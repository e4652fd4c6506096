use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use drawbatch_types::{BufferHandle, CullData, PipelineHandle, ProgramHandle};
use glam::Mat4;
use parking_lot::Mutex;

use crate::{
    culling::{
        kernel::{self, CullBuffers},
        CullParams, CullingShaderKey, CULLED_INSTANCE_INDICES_BINDING, CULL_DATA_BINDING, CULL_INPUT_BINDING,
        DRAW_COMMANDS_BINDING, INSTANCE_INDICES_BINDING, INSTANCE_TRANSFORMS_BINDING, PARAMS_BINDING,
        VISIBLE_COUNT_BINDING,
    },
    device::{
        BufferDesc, ComputeCmd, ComputeCmds, ComputeKernel, ComputePipelineDesc, DeviceCapabilities, GfxDevice,
        GraphicsCmd, GraphicsCmds, GraphicsPipelineDesc, ProgramDesc, ResourceBindings, ShaderStages,
    },
    error::DeviceError,
    format_sso,
    util::typedefs::FastHashMap,
};

enum HeadlessPipeline {
    Compute(ComputeKernel),
    Graphics(Box<GraphicsPipelineDesc>),
}

#[derive(Default)]
struct HeadlessState {
    buffers: FastHashMap<usize, Vec<u8>>,
    programs: FastHashMap<usize, ProgramDesc>,
    pipelines: FastHashMap<usize, HeadlessPipeline>,
    next_id: usize,
    compute_submissions: usize,
}

impl HeadlessState {
    fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, buffer: BufferHandle) -> Result<&Vec<u8>, DeviceError> {
        self.buffers.get(&buffer.idx).ok_or(DeviceError::UnknownBuffer(buffer))
    }

    fn words(&self, buffer: BufferHandle) -> Result<Vec<u32>, DeviceError> {
        Ok(bytemuck::pod_collect_to_vec(self.buffer(buffer)?))
    }

    fn write(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let contents = self.buffers.get_mut(&buffer.idx).ok_or(DeviceError::UnknownBuffer(buffer))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(DeviceError::OutOfRange {
                buffer,
                offset,
                size: data.len() as u64,
            });
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// A draw as it would reach the rasterizer, after indirect arguments were
/// read and empty draws dropped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResolvedDraw {
    pub pipeline: Option<PipelineHandle>,
    pub indexed: bool,
    /// Vertex, index or patch count.
    pub count: u32,
    pub instance_count: u32,
    /// First index or patch. Zero for non-indexed draws.
    pub first_index: u32,
    pub base_vertex: u32,
    pub base_instance: u32,
}

/// Reference device executing everything on the CPU.
///
/// Compute programs run through the native kernel they were built for.
/// Graphics work is not rasterized but can be resolved into the draws it
/// would issue.
pub struct HeadlessDevice {
    capabilities: DeviceCapabilities,
    state: Mutex<HeadlessState>,
    fence_stalled: AtomicBool,
}

impl HeadlessDevice {
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            state: Mutex::default(),
            fence_stalled: AtomicBool::new(false),
        }
    }

    /// Makes every read back time out, as if the GPU never finished.
    pub fn set_fence_stalled(&self, stalled: bool) {
        self.fence_stalled.store(stalled, Ordering::Release);
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.idx).cloned()
    }

    pub fn buffer_words(&self, buffer: BufferHandle) -> Option<Vec<u32>> {
        self.state.lock().words(buffer).ok()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn program_count(&self) -> usize {
        self.state.lock().programs.len()
    }

    pub fn pipeline_count(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    pub fn compute_submissions(&self) -> usize {
        self.state.lock().compute_submissions
    }

    pub fn graphics_pipeline_desc(&self, pipeline: PipelineHandle) -> Option<GraphicsPipelineDesc> {
        match self.state.lock().pipelines.get(&pipeline.idx) {
            Some(HeadlessPipeline::Graphics(desc)) => Some((**desc).clone()),
            _ => None,
        }
    }

    /// Resolves recorded graphics work into the draws it issues, reading
    /// indirect arguments from the current buffer contents.
    pub fn resolve_draws(&self, cmds: &GraphicsCmds) -> Result<Vec<ResolvedDraw>, DeviceError> {
        let state = self.state.lock();
        let mut pipeline = None;
        let mut draws = Vec::new();
        let mut push = |draw: ResolvedDraw| {
            if draw.count != 0 && draw.instance_count != 0 {
                draws.push(draw);
            }
        };

        for cmd in cmds.commands() {
            match *cmd {
                GraphicsCmd::BindPipeline(handle) => pipeline = Some(handle),
                GraphicsCmd::Draw {
                    vertex_count,
                    base_vertex,
                    instance_count,
                    base_instance,
                } => push(ResolvedDraw {
                    pipeline,
                    indexed: false,
                    count: vertex_count,
                    instance_count,
                    first_index: 0,
                    base_vertex,
                    base_instance,
                }),
                GraphicsCmd::DrawIndexed {
                    index_count,
                    index_byte_offset,
                    base_vertex,
                    instance_count,
                    base_instance,
                    ..
                } => push(ResolvedDraw {
                    pipeline,
                    indexed: true,
                    count: index_count,
                    instance_count,
                    first_index: (index_byte_offset / 4) as u32,
                    base_vertex,
                    base_instance,
                }),
                GraphicsCmd::DrawIndirect {
                    draw_buffer,
                    byte_offset,
                    draw_count,
                    stride,
                } => {
                    let words = state.words(draw_buffer)?;
                    for draw in 0..draw_count as usize {
                        let base = (byte_offset as usize + draw * stride as usize) / 4;
                        let args = indirect_args(&words, base, 4, draw_buffer)?;
                        push(ResolvedDraw {
                            pipeline,
                            indexed: false,
                            count: args[0],
                            instance_count: args[1],
                            first_index: 0,
                            base_vertex: args[2],
                            base_instance: args[3],
                        });
                    }
                }
                GraphicsCmd::DrawIndexedIndirect {
                    draw_buffer,
                    byte_offset,
                    draw_count,
                    stride,
                    patch_base_vertex_byte_offset,
                    ..
                } => {
                    let words = state.words(draw_buffer)?;
                    for draw in 0..draw_count as usize {
                        let record = byte_offset as usize + draw * stride as usize;
                        let base = record / 4;
                        let draw = match patch_base_vertex_byte_offset {
                            // patchCount instanceCount patchStart baseInstance
                            Some(vertex_offset) => {
                                let args = indirect_args(&words, base, 4, draw_buffer)?;
                                let vertex = indirect_args(&words, (record + vertex_offset as usize) / 4, 1, draw_buffer)?;
                                ResolvedDraw {
                                    pipeline,
                                    indexed: true,
                                    count: args[0],
                                    instance_count: args[1],
                                    first_index: args[2],
                                    base_vertex: vertex[0],
                                    base_instance: args[3],
                                }
                            }
                            None => {
                                let args = indirect_args(&words, base, 5, draw_buffer)?;
                                ResolvedDraw {
                                    pipeline,
                                    indexed: true,
                                    count: args[0],
                                    instance_count: args[1],
                                    first_index: args[2],
                                    base_vertex: args[3],
                                    base_instance: args[4],
                                }
                            }
                        };
                        push(draw);
                    }
                }
                _ => {}
            }
        }

        Ok(draws)
    }

    fn run_compute(&self, state: &mut HeadlessState, cmds: ComputeCmds) -> Result<(), DeviceError> {
        let mut pipeline = None;
        let mut bindings = ResourceBindings::default();

        for cmd in cmds.into_commands() {
            match cmd {
                ComputeCmd::UpdateBuffer { buffer, offset, data } => state.write(buffer, offset, &data)?,
                ComputeCmd::BindPipeline(handle) => pipeline = Some(handle),
                ComputeCmd::BindResources(resources) => bindings = resources,
                ComputeCmd::Dispatch { invocations } => {
                    let key = frustum_cull_key(state, pipeline)?;
                    run_cull(state, &key, &bindings, |key, params, bufs| {
                        for record in 0..invocations.min(params.record_count) {
                            if params.reset_pass != 0 {
                                kernel::reset_record(key, params, bufs, record);
                            } else {
                                kernel::cull_record(key, params, bufs, record);
                            }
                        }
                    })?;
                }
                ComputeCmd::DispatchPerInstance {
                    cull_input,
                    records,
                    command_num_uints,
                    cull_instance_count_word,
                } => {
                    let key = frustum_cull_key(state, pipeline)?;
                    let input = state.words(cull_input)?;
                    run_cull(state, &key, &bindings, |key, params, bufs| {
                        for record in 0..records {
                            let index = (record * command_num_uints + cull_instance_count_word) as usize;
                            let instances = input.get(index).copied().unwrap_or(0);
                            for instance in 0..instances {
                                kernel::cull_instance(key, params, bufs, record, instance);
                            }
                        }
                    })?;
                }
                ComputeCmd::PushDebugGroup(_) | ComputeCmd::PopDebugGroup | ComputeCmd::MemoryBarrier => {}
            }
        }
        Ok(())
    }
}

fn indirect_args(words: &[u32], base: usize, len: usize, buffer: BufferHandle) -> Result<&[u32], DeviceError> {
    words.get(base..base + len).ok_or(DeviceError::OutOfRange {
        buffer,
        offset: base as u64 * 4,
        size: len as u64 * 4,
    })
}

fn frustum_cull_key(state: &HeadlessState, pipeline: Option<PipelineHandle>) -> Result<CullingShaderKey, DeviceError> {
    let Some(handle) = pipeline else {
        return Err(DeviceError::Unsupported(format_sso!("dispatch without a bound pipeline")));
    };
    match state.pipelines.get(&handle.idx) {
        Some(HeadlessPipeline::Compute(ComputeKernel::FrustumCull(key))) => Ok(*key),
        Some(HeadlessPipeline::Graphics(_)) => Err(DeviceError::Unsupported(format_sso!(
            "dispatching graphics pipeline {}",
            handle.idx
        ))),
        None => Err(DeviceError::UnknownPipeline(handle)),
    }
}

/// Gathers the buffers bound for culling, runs `f` over them and writes the
/// outputs back.
fn run_cull(
    state: &mut HeadlessState,
    key: &CullingShaderKey,
    bindings: &ResourceBindings,
    f: impl FnOnce(&CullingShaderKey, &CullParams, &mut CullBuffers<'_>),
) -> Result<(), DeviceError> {
    let required = |binding| bindings.get(binding).ok_or(DeviceError::MissingBinding(binding));
    let optional = |binding: u32, enabled: bool| -> Result<Option<BufferHandle>, DeviceError> {
        match enabled {
            true => required(binding).map(Some),
            false => Ok(None),
        }
    };

    let params_buffer = required(PARAMS_BINDING)?;
    let params = CullParams::from_bytes(state.buffer(params_buffer)?).ok_or(DeviceError::OutOfRange {
        buffer: params_buffer,
        offset: 0,
        size: CullParams::size(),
    })?;

    let cull_input = state.words(required(CULL_INPUT_BINDING)?)?;
    let draw_commands_buffer = required(DRAW_COMMANDS_BINDING)?;
    let mut draw_commands = state.words(draw_commands_buffer)?;
    let cull_data: Vec<CullData> = bytemuck::pod_collect_to_vec(state.buffer(required(CULL_DATA_BINDING)?)?);

    let instance_indices = match optional(INSTANCE_INDICES_BINDING, key.instance_culling)? {
        Some(buffer) => state.words(buffer)?,
        None => Vec::new(),
    };
    let culled_buffer = optional(CULLED_INSTANCE_INDICES_BINDING, key.instance_culling)?;
    let mut culled_instance_indices = match culled_buffer {
        Some(buffer) => state.words(buffer)?,
        None => Vec::new(),
    };
    let mut transforms: Vec<Vec<Mat4>> = Vec::new();
    if key.instance_culling {
        for level in 0..key.instancer_num_levels {
            let buffer = required(INSTANCE_TRANSFORMS_BINDING + level)?;
            transforms.push(bytemuck::pod_collect_to_vec(state.buffer(buffer)?));
        }
    }
    let levels: Vec<&[Mat4]> = transforms.iter().map(Vec::as_slice).collect();

    let count_buffer = optional(VISIBLE_COUNT_BINDING, key.count_visible)?;
    let mut visible_count = match count_buffer {
        Some(buffer) => state.words(buffer)?.first().copied().unwrap_or(0),
        None => 0,
    };

    f(
        key,
        &params,
        &mut CullBuffers {
            cull_input: &cull_input,
            draw_commands: &mut draw_commands,
            cull_data: &cull_data,
            instance_indices: &instance_indices,
            culled_instance_indices: &mut culled_instance_indices,
            instance_transforms: &levels,
            visible_count: count_buffer.is_some().then_some(&mut visible_count),
        },
    );

    state.write(draw_commands_buffer, 0, bytemuck::cast_slice(&draw_commands))?;
    if let Some(buffer) = culled_buffer {
        state.write(buffer, 0, bytemuck::cast_slice(&culled_instance_indices))?;
    }
    if let Some(buffer) = count_buffer {
        state.write(buffer, 0, &visible_count.to_le_bytes())?;
    }
    Ok(())
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(DeviceCapabilities::all())
    }
}

impl GfxDevice for HeadlessDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn create_buffer(&self, desc: &BufferDesc) -> BufferHandle {
        let mut state = self.state.lock();
        let idx = state.next_id();
        state.buffers.insert(idx, vec![0; desc.size as usize]);
        BufferHandle::new(idx)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.state.lock().buffers.remove(&buffer.idx);
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.state.lock().buffers.get(&buffer.idx).map(|b| b.len() as u64)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if let Err(e) = self.state.lock().write(buffer, offset, data) {
            log::error!("Headless buffer write failed: {e}");
        }
    }

    fn create_program(&self, desc: &ProgramDesc) -> Result<ProgramHandle, DeviceError> {
        if desc.source.trim().is_empty() {
            return Err(DeviceError::ProgramCompilation {
                label: desc.label.clone(),
                message: String::from("empty source"),
            });
        }
        let mut state = self.state.lock();
        let idx = state.next_id();
        state.programs.insert(idx, desc.clone());
        Ok(ProgramHandle::new(idx))
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<PipelineHandle, DeviceError> {
        let mut state = self.state.lock();
        if !state.programs.contains_key(&desc.program.idx) {
            return Err(DeviceError::ProgramCompilation {
                label: desc.label.clone(),
                message: format!("unknown program {}", desc.program.idx),
            });
        }
        if desc.bindings.iter().any(|b| !b.stages.contains(ShaderStages::COMPUTE)) {
            return Err(DeviceError::Unsupported(format_sso!(
                "non-compute bindings in {}",
                desc.label
            )));
        }
        let idx = state.next_id();
        state.pipelines.insert(idx, HeadlessPipeline::Compute(desc.kernel));
        Ok(PipelineHandle::new(idx))
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<PipelineHandle, DeviceError> {
        if desc.primitive.is_patches() && !self.capabilities.contains(DeviceCapabilities::HARDWARE_TESSELLATION) {
            return Err(DeviceError::Unsupported(format_sso!("patch primitives")));
        }
        let mut state = self.state.lock();
        if !state.programs.contains_key(&desc.program.idx) {
            return Err(DeviceError::ProgramCompilation {
                label: desc.label.clone(),
                message: format!("unknown program {}", desc.program.idx),
            });
        }
        let idx = state.next_id();
        state
            .pipelines
            .insert(idx, HeadlessPipeline::Graphics(Box::new(desc.clone())));
        Ok(PipelineHandle::new(idx))
    }

    fn submit_compute(&self, cmds: ComputeCmds) -> Result<(), DeviceError> {
        profiling::scope!("HeadlessDevice::submit_compute");
        let mut state = self.state.lock();
        state.compute_submissions += 1;
        self.run_compute(&mut state, cmds)
    }

    fn read_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, DeviceError> {
        if self.fence_stalled.load(Ordering::Acquire) {
            return Err(DeviceError::Timeout(timeout));
        }
        let state = self.state.lock();
        let contents = state.buffer(buffer)?;
        contents
            .get(offset as usize..(offset + size) as usize)
            .map(<[u8]>::to_vec)
            .ok_or(DeviceError::OutOfRange { buffer, offset, size })
    }
}

#[cfg(test)]
mod tests {
    use drawbatch_types::BufferUsages;

    use super::*;
    use crate::util::typedefs::SsoString;

    fn buffer(device: &HeadlessDevice, size: u64) -> BufferHandle {
        device.create_buffer(&BufferDesc {
            label: SsoString::from("test"),
            size,
            usage: BufferUsages::STORAGE,
        })
    }

    #[test]
    fn writes_are_bounds_checked() {
        let device = HeadlessDevice::default();
        let handle = buffer(&device, 8);
        device.write_buffer(handle, 4, &[1, 2, 3, 4]);
        device.write_buffer(handle, 6, &[9, 9, 9, 9]);
        assert_eq!(device.buffer_contents(handle).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);

        let read = device.read_buffer(handle, 4, 4, Duration::from_millis(1)).unwrap();
        assert_eq!(read, vec![1, 2, 3, 4]);
        assert!(device.read_buffer(handle, 6, 4, Duration::from_millis(1)).is_err());

        device.destroy_buffer(handle);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn stalled_fence_times_out() {
        let device = HeadlessDevice::default();
        let handle = buffer(&device, 4);
        device.set_fence_stalled(true);
        let timeout = Duration::from_millis(10);
        assert!(matches!(
            device.read_buffer(handle, 0, 4, timeout),
            Err(DeviceError::Timeout(t)) if t == timeout
        ));
    }

    #[test]
    fn indirect_draws_resolve_from_buffer() {
        let device = HeadlessDevice::default();
        let handle = buffer(&device, 32);
        let words: [u32; 8] = [3, 1, 0, 0, 6, 0, 3, 1];
        device.write_buffer(handle, 0, bytemuck::cast_slice(&words));

        let mut cmds = GraphicsCmds::new();
        cmds.draw_indirect(handle, 0, 2, 16);
        let draws = device.resolve_draws(&cmds).unwrap();

        // the second record has no instances left
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].count, 3);
        assert_eq!(draws[0].base_instance, 0);
    }
}
