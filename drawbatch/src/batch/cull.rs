use std::sync::Arc;

use drawbatch_types::{BufferArrayRange, BufferHandle, BufferUsages, ElementFormat, PipelineHandle};

use super::{DrawBatch, DRAW_INDIRECT_RESULT_ROLE};
use crate::{
    buffer::GpuBuffer,
    culling::{
        CullParams, CullingShaderKey, CULLED_INSTANCE_INDICES_BINDING, CULLED_INSTANCE_INDICES_RESOURCE,
        CULL_DATA_BINDING, CULL_DATA_RESOURCE, CULL_ENTRY_POINT, CULL_INPUT_BINDING, DRAW_COMMANDS_BINDING,
        INSTANCE_INDICES_BINDING, INSTANCE_INDICES_RESOURCE, INSTANCE_TRANSFORMS_BINDING, INSTANCE_TRANSFORM_RESOURCE,
        PARAMS_BINDING, VISIBLE_COUNT_BINDING,
    },
    device::{BufferDesc, ComputeCmds, ComputeKernel, ComputePipelineDesc, DeviceCapabilities, ProgramDesc, ResourceBindings},
    error::ProgramError,
    format_sso,
    item::DrawItemState,
    pass::RenderPassState,
    program::ShaderProgram,
    registry::ResourceRegistry,
    util::{hash, typedefs::SsoString},
};

const CULLING_SALT: &str = "DrawBatch frustum culling";

/// Culling program and pipeline built for one [`CullingShaderKey`].
#[derive(Debug, Clone)]
pub(super) struct CullingPipeline {
    key: CullingShaderKey,
    program: Arc<ShaderProgram>,
    pipeline: Arc<PipelineHandle>,
}

fn create_culling_pipeline(key: CullingShaderKey, registry: &ResourceRegistry) -> Result<CullingPipeline, ProgramError> {
    let program_hash = hash::combine(hash::hash_one(CULLING_SALT), &key.hash());
    let label = format_sso!("frustum culling {:016x}", key.hash());

    let program = registry
        .register_program(program_hash, || -> Result<ShaderProgram, ProgramError> {
            let source = registry
                .shader_preprocessor()
                .render_culling_shader(&key)
                .map_err(|source| ProgramError::Template {
                    name: SsoString::from("cull"),
                    source,
                })?;
            let handle = registry.device().create_program(&ProgramDesc {
                label: label.clone(),
                source,
            })?;
            Ok(ShaderProgram {
                handle,
                hash: program_hash,
            })
        })?
        .into_value();

    let pipeline = registry
        .register_compute_pipeline(program.hash, || {
            registry.device().create_compute_pipeline(&ComputePipelineDesc {
                label,
                program: program.handle,
                entry_point: SsoString::from(CULL_ENTRY_POINT),
                bindings: key.binding_layout(),
                kernel: ComputeKernel::FrustumCull(key),
            })
        })?
        .into_value();

    Ok(CullingPipeline { key, program, pipeline })
}

fn range_buffer(range: Option<&BufferArrayRange>, name: &str) -> Option<BufferHandle> {
    range?.resource(name).map(|resource| resource.buffer)
}

/// Binds the item data the culling program reads. Fails with the name of the
/// first missing resource, which is expected before the scene uploads it.
fn gather_item_bindings(
    state: &DrawItemState,
    key: &CullingShaderKey,
    bindings: &mut ResourceBindings,
) -> Result<(), &'static str> {
    let ranges = &state.ranges;
    let cull_data = range_buffer(ranges.constant.as_ref(), CULL_DATA_RESOURCE).ok_or(CULL_DATA_RESOURCE)?;
    bindings.push(CULL_DATA_BINDING, cull_data);

    if !key.instance_culling {
        return Ok(());
    }

    let instance_index = ranges.instance_index.as_ref();
    let indices = range_buffer(instance_index, INSTANCE_INDICES_RESOURCE).ok_or(INSTANCE_INDICES_RESOURCE)?;
    let culled =
        range_buffer(instance_index, CULLED_INSTANCE_INDICES_RESOURCE).ok_or(CULLED_INSTANCE_INDICES_RESOURCE)?;
    bindings.push(INSTANCE_INDICES_BINDING, indices);
    bindings.push(CULLED_INSTANCE_INDICES_BINDING, culled);

    for level in 0..key.instancer_num_levels {
        let range = ranges.instance_primvars.get(level as usize).and_then(Option::as_ref);
        let transforms = range_buffer(range, INSTANCE_TRANSFORM_RESOURCE).ok_or(INSTANCE_TRANSFORM_RESOURCE)?;
        bindings.push(INSTANCE_TRANSFORMS_BINDING + level, transforms);
    }
    Ok(())
}

impl DrawBatch {
    fn prepare_culling_pipeline(&mut self, key: CullingShaderKey, registry: &ResourceRegistry) -> Option<Arc<PipelineHandle>> {
        let stale = match &self.culling_pipeline {
            Some(cached) => self.dirty_culling_program || cached.key != key,
            None => true,
        };
        if stale {
            match create_culling_pipeline(key, registry) {
                Ok(pipeline) => {
                    log::debug!(
                        "Batch {:?} uses culling program {:016x}",
                        self.id,
                        pipeline.program.hash
                    );
                    self.culling_pipeline = Some(pipeline);
                    self.dirty_culling_program = false;
                }
                Err(e) => {
                    log::error!("Failed to create culling pipeline for batch {:?}: {e}", self.id);
                    self.culling_pipeline = None;
                    return None;
                }
            }
        }
        self.culling_pipeline.as_ref().map(|cached| Arc::clone(&cached.pipeline))
    }

    fn visible_count_buffer(&mut self, registry: &ResourceRegistry) -> BufferHandle {
        self.result_buffer
            .get_or_insert_with(|| {
                registry.register_buffer_resource(
                    DRAW_INDIRECT_RESULT_ROLE,
                    ElementFormat::Uint32,
                    1,
                    BufferUsages::STORAGE,
                )
            })
            .handle()
    }

    fn cull_params_buffer(&mut self, registry: &ResourceRegistry) -> BufferHandle {
        self.cull_params_buffer
            .get_or_insert_with(|| {
                GpuBuffer::new(
                    Arc::clone(registry.device()),
                    &BufferDesc {
                        label: SsoString::from("cull params"),
                        size: CullParams::size(),
                        usage: BufferUsages::UNIFORM,
                    },
                )
            })
            .handle()
    }

    /// Runs the culling program over the dispatch buffer, rewriting the
    /// instance counts of the primary dispatch buffer from the cull input.
    pub(super) fn execute_frustum_cull(
        &mut self,
        update_buffer_data: bool,
        pass: &RenderPassState,
        registry: &ResourceRegistry,
    ) {
        profiling::scope!("DrawBatch::execute_frustum_cull");

        // counts of partially visible instanced items cannot be zeroed per record
        if self.use_instancing && !self.use_instance_culling {
            return;
        }
        if self.options.freeze_culling && !update_buffer_data {
            return;
        }

        let (Some(layout), Some(dispatch_buffer), Some(cull_input)) =
            (self.layout, self.dispatch_buffer.as_ref(), self.cull_input_buffer.as_ref())
        else {
            log::debug!("Batch {:?} has no compiled dispatch buffer to cull", self.id);
            return;
        };
        if update_buffer_data {
            cull_input.copy_data(&self.draw_command_buffer);
        }
        let dispatch_handle = dispatch_buffer.handle();
        let cull_input_handle = cull_input.handle();
        let records = dispatch_buffer.count();

        let count_visible = self.options.enable_visible_instance_counting;
        let key = CullingShaderKey::new(&layout, self.use_tiny_prim_culling, count_visible);
        let Some(pipeline) = self.prepare_culling_pipeline(key, registry) else {
            return;
        };

        let mut bindings = ResourceBindings::default();
        let params_buffer = self.cull_params_buffer(registry);
        bindings.push(PARAMS_BINDING, params_buffer);
        bindings.push(CULL_INPUT_BINDING, cull_input_handle);
        bindings.push(DRAW_COMMANDS_BINDING, dispatch_handle);

        let gathered = match self.items.first() {
            Some(first) => gather_item_bindings(&first.draw_item().state(), &key, &mut bindings),
            None => Err("draw items"),
        };
        if let Err(missing) = gathered {
            log::debug!("Batch {:?} skips culling, {missing} is not bound", self.id);
            return;
        }

        let mut cmds = ComputeCmds::new();
        cmds.push_debug_group(SsoString::from("FrustumCulling Cmds"));

        let result_buffer = count_visible.then(|| self.visible_count_buffer(registry));
        if let Some(result_buffer) = result_buffer {
            bindings.push(VISIBLE_COUNT_BINDING, result_buffer);
            cmds.update_buffer(result_buffer, 0, bytemuck::bytes_of(&0_u32));
        }

        let params = |reset_pass| {
            CullParams {
                cull_matrix: pass.cull_matrix,
                draw_range_ndc: pass.drawing_range_ndc,
                draw_command_num_uints: layout.num_uint32,
                record_count: records,
                reset_pass,
            }
            .to_bytes()
        };

        cmds.bind_pipeline(*pipeline);
        cmds.bind_resources(bindings);

        let single_pass = registry
            .device()
            .capabilities()
            .contains(DeviceCapabilities::SINGLE_PASS_CULLING);
        if single_pass || !self.use_instance_culling {
            cmds.update_buffer(params_buffer, 0, &params(0));
            cmds.dispatch(records);
            cmds.memory_barrier();
        } else {
            cmds.update_buffer(params_buffer, 0, &params(1));
            cmds.dispatch(records);
            cmds.memory_barrier();

            cmds.update_buffer(params_buffer, 0, &params(0));
            cmds.dispatch_per_instance(
                cull_input_handle,
                records,
                layout.num_uint32,
                layout.cull_instance_count_offset / 4,
            );
            cmds.memory_barrier();
        }
        cmds.pop_debug_group();

        if let Err(e) = registry.device().submit_compute(cmds) {
            log::error!("Culling pass of batch {:?} failed: {e}", self.id);
            return;
        }
        registry.perf_counters().add_culling_pass();

        let Some(result_buffer) = result_buffer else {
            return;
        };
        let timeout = self.options.visible_count_timeout();
        self.num_visible_items = match registry.device().read_buffer(result_buffer, 0, 4, timeout) {
            Ok(bytes) => match <[u8; 4]>::try_from(bytes.as_slice()) {
                Ok(bytes) => u32::from_le_bytes(bytes) as usize,
                Err(_) => {
                    log::error!("Visible instance count of batch {:?} has {} bytes", self.id, bytes.len());
                    0
                }
            },
            Err(e) => {
                log::error!("Reading visible instance count of batch {:?} failed: {e}", self.id);
                0
            }
        };
    }
}
