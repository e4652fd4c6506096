use std::sync::Arc;

use drawbatch_types::{BufferArrayRange, BufferHandle, CompareFunction, PipelineHandle};

use super::{DrawBatch, DRAW_DISPATCH_VIEW, DRAWING_COORD_I_VIEW, INDICES_RESOURCE, TESS_FACTORS_RESOURCE};
use crate::{
    buffer::DispatchBuffer,
    device::{
        BindingKind, BindingLayoutEntry, DeviceCapabilities, GraphicsCmds, GraphicsPipelineDesc, ProgramDesc,
        ResourceBindings, ShaderStages, VertexAttributeDesc, VertexBufferBinding, VertexBufferDesc, VertexStep,
    },
    error::ProgramError,
    format_sso,
    item::DrawItemState,
    pass::RenderPassState,
    program::{DrawingProgram, ResourceBinder, ShaderProgram},
    registry::ResourceRegistry,
    util::hash,
};

const DRAW_SALT: &str = "DrawBatch draw pipeline";
const PTCS_SALT: &str = "DrawBatch post tessellation control pipeline";

/// Everything bound for the draws of one batch.
struct DrawBindings {
    resources: ResourceBindings,
    vertex_buffers: Vec<VertexBufferBinding>,
    index_buffer: Option<BufferHandle>,
}

fn storage_ranges(state: &DrawItemState) -> impl Iterator<Item = &BufferArrayRange> {
    let ranges = &state.ranges;
    [
        ranges.constant.as_ref(),
        ranges.topology_visibility.as_ref(),
        ranges.topology.as_ref(),
        ranges.element.as_ref(),
        ranges.face_varying.as_ref(),
        ranges.varying.as_ref(),
        ranges.instance_index.as_ref(),
    ]
    .into_iter()
    .chain(ranges.instance_primvars.iter().map(Option::as_ref))
    .chain(std::iter::once(state.shader_data()))
    .flatten()
}

/// Vertex primvars the program reads, one buffer slot each after the
/// dispatch buffer.
fn vertex_attributes<'a>(
    state: &'a DrawItemState,
    binder: &'a ResourceBinder,
) -> impl Iterator<Item = (&'a drawbatch_types::BufferResource, u32)> + 'a {
    state
        .ranges
        .vertex
        .iter()
        .flat_map(|range| range.array().resources())
        .filter_map(|resource| Some((resource, binder.attribute(&resource.name)?)))
}

fn vertex_buffer_descs(
    state: &DrawItemState,
    dispatch_buffer: &DispatchBuffer,
    binder: &ResourceBinder,
    instancer_num_levels: u32,
) -> Vec<VertexBufferDesc> {
    let mut draw_command_attributes = Vec::new();
    for view in dispatch_buffer.resource_views() {
        let Some(location) = binder.attribute(&view.name) else {
            continue;
        };
        let levels = match view.name == DRAWING_COORD_I_VIEW {
            true => instancer_num_levels,
            false => 1,
        };
        draw_command_attributes.extend((0..levels).map(|level| VertexAttributeDesc {
            format: view.format,
            offset: view.byte_offset as u64 + 4 * level as u64,
            location: location + level,
        }));
    }

    let mut descs = vec![VertexBufferDesc {
        slot: 0,
        stride: dispatch_buffer.stride_bytes() as u64,
        step: VertexStep::PerDrawCommand,
        attributes: draw_command_attributes,
    }];
    for (slot, (resource, location)) in (1..).zip(vertex_attributes(state, binder)) {
        descs.push(VertexBufferDesc {
            slot,
            stride: resource.format.size(),
            step: VertexStep::PerVertex,
            attributes: vec![VertexAttributeDesc {
                format: resource.format,
                offset: 0,
                location,
            }],
        });
    }
    descs
}

impl DrawBatch {
    /// Drawing program of the first item for `pass`, composed and compiled
    /// once per pipeline state.
    fn drawing_program(&mut self, pass: &RenderPassState, registry: &ResourceRegistry) -> Option<DrawingProgram> {
        let layout = self.layout?;
        let pass_hash = pass.graphics_pipeline_hash();
        if let Some(program) = &self.drawing_program {
            if program.pass_hash == pass_hash && program.layout == layout {
                return Some(program.clone());
            }
        }

        let first = self.items.first()?;
        let state = first.draw_item().state();
        let composed = state
            .geometric_shader
            .clone()
            .ok_or(ProgramError::MissingGeometricShader)
            .and_then(|geometric_shader| {
                let desc = registry
                    .shader_service()
                    .compose_drawing_program(&state, &geometric_shader, &layout, pass)?;
                let program_hash = desc.hash();
                let program = registry
                    .register_program(program_hash, || -> Result<ShaderProgram, ProgramError> {
                        let handle = registry.device().create_program(&ProgramDesc {
                            label: desc.label.clone(),
                            source: desc.source.clone(),
                        })?;
                        Ok(ShaderProgram {
                            handle,
                            hash: program_hash,
                        })
                    })?
                    .into_value();
                Ok(DrawingProgram {
                    program,
                    desc: Arc::new(desc),
                    geometric_shader,
                    layout,
                    pass_hash,
                })
            });
        drop(state);

        match composed {
            Ok(program) => {
                self.drawing_program = Some(program.clone());
                Some(program)
            }
            Err(e) => {
                log::error!("Failed to build drawing program for batch {:?}: {e}", self.id);
                None
            }
        }
    }

    fn graphics_pipeline(
        &self,
        program: &DrawingProgram,
        pass: &RenderPassState,
        registry: &ResourceRegistry,
        ptcs: bool,
    ) -> Option<Arc<PipelineHandle>> {
        let dispatch_buffer = self.dispatch_buffer.as_ref()?;
        let salt = if ptcs { PTCS_SALT } else { DRAW_SALT };
        // the vertex layout of slot 0 follows the record layout
        let layout = &program.layout;
        let pipeline_hash = hash::combine(
            hash::combine(
                hash::combine(hash::hash_one(salt), &program.program.hash),
                &(layout.num_uint32, layout.kind, layout.patch_encoding, layout.instancer_num_levels),
            ),
            &pass.graphics_pipeline_hash(),
        );

        let desc = &program.desc;
        let instancer_num_levels = layout.instancer_num_levels;
        let created = registry.register_graphics_pipeline(pipeline_hash, || {
            let vertex_buffers = {
                let first = self.items.first();
                match first {
                    Some(first) => vertex_buffer_descs(
                        &first.draw_item().state(),
                        dispatch_buffer,
                        &desc.binder,
                        instancer_num_levels,
                    ),
                    None => Vec::new(),
                }
            };
            let bindings = desc
                .binder
                .binding_slots()
                .into_iter()
                .map(|binding| BindingLayoutEntry {
                    binding,
                    kind: BindingKind::Storage { read_only: true },
                    stages: ShaderStages::VERTEX | ShaderStages::FRAGMENT,
                })
                .collect();

            registry.device().create_graphics_pipeline(&GraphicsPipelineDesc {
                label: format_sso!("{} {}", desc.label, if ptcs { "ptcs" } else { "draw" }),
                program: program.program.handle,
                vertex_entry: match ptcs {
                    true => desc.ptcs_entry.clone().unwrap_or_else(|| desc.vertex_entry.clone()),
                    false => desc.vertex_entry.clone(),
                },
                fragment_entry: if ptcs { None } else { desc.fragment_entry.clone() },
                vertex_buffers,
                bindings,
                primitive: program.geometric_shader.primitive_type(),
                rasterizer_enabled: !ptcs,
                color_format: pass.color_format,
                depth_format: pass.depth_format,
                depth_compare: if ptcs { CompareFunction::Always } else { pass.depth_compare },
                depth_write: pass.depth_write && !ptcs,
                cull_face: if ptcs { None } else { pass.cull_face },
                sample_count: if ptcs { 1 } else { pass.sample_count },
            })
        });

        match created {
            Ok(instance) => Some(instance.into_value()),
            Err(e) => {
                log::error!("Failed to create graphics pipeline for batch {:?}: {e}", self.id);
                None
            }
        }
    }

    /// Storage and vertex buffers the program declares, from the first item.
    fn draw_bindings(&self, binder: &ResourceBinder) -> Option<DrawBindings> {
        let dispatch_buffer = self.dispatch_buffer.as_ref()?;
        let first = self.items.first()?;
        let state = first.draw_item().state();

        let mut resources = ResourceBindings::default();
        for resource in storage_ranges(&state).flat_map(|range| range.array().resources()) {
            let Some(slot) = binder.binding(&resource.name) else {
                continue;
            };
            if resources.get(slot).is_none() {
                resources.push(slot, resource.buffer);
            }
        }
        if let (Some(tess_factors), Some(slot)) = (&self.tess_factors_buffer, binder.binding(TESS_FACTORS_RESOURCE)) {
            resources.push(slot, tess_factors.handle());
        }

        let mut vertex_buffers = vec![VertexBufferBinding {
            slot: 0,
            buffer: dispatch_buffer.handle(),
            byte_offset: 0,
        }];
        for (slot, (resource, _)) in (1..).zip(vertex_attributes(&state, binder)) {
            vertex_buffers.push(VertexBufferBinding {
                slot,
                buffer: resource.buffer,
                byte_offset: 0,
            });
        }

        let index_buffer = state
            .ranges
            .topology
            .as_ref()
            .and_then(|range| range.resource(INDICES_RESOURCE))
            .map(|resource| resource.buffer);

        Some(DrawBindings {
            resources,
            vertex_buffers,
            index_buffer,
        })
    }

    /// Records the draws with everything already bound.
    fn record_draws(&self, cmds: &mut GraphicsCmds, bindings: &DrawBindings, registry: &ResourceRegistry) {
        let (Some(layout), Some(dispatch_buffer)) = (self.layout.as_ref(), self.dispatch_buffer.as_ref()) else {
            return;
        };
        let index_buffer = match (self.use_draw_indexed, bindings.index_buffer) {
            (true, None) => {
                log::error!("Indexed batch {:?} has no index buffer", self.id);
                return;
            }
            (_, index_buffer) => index_buffer,
        };

        let indirect = registry
            .device()
            .capabilities()
            .contains(DeviceCapabilities::MULTI_DRAW_INDIRECT);
        if indirect {
            let Some(view) = dispatch_buffer.resource_view(DRAW_DISPATCH_VIEW) else {
                log::error!("Dispatch buffer of batch {:?} has no {DRAW_DISPATCH_VIEW} view", self.id);
                return;
            };
            let byte_offset = view.byte_offset as u64;
            let stride = dispatch_buffer.stride_bytes();
            match index_buffer {
                Some(index_buffer) => cmds.draw_indexed_indirect(
                    index_buffer,
                    dispatch_buffer.handle(),
                    byte_offset,
                    dispatch_buffer.count(),
                    stride,
                    layout.patch_encoding.then_some(layout.patch_base_vertex_offset),
                ),
                None => cmds.draw_indirect(dispatch_buffer.handle(), byte_offset, dispatch_buffer.count(), stride),
            }
            return;
        }

        for index in 0..dispatch_buffer.count() as usize {
            let Some(record) = layout.record(&self.draw_command_buffer, index) else {
                break;
            };
            if record.count() == 0 || record.instance_count() == 0 {
                continue;
            }
            match (index_buffer, record.base_index()) {
                (Some(index_buffer), Some(base_index)) => cmds.draw_indexed(
                    index_buffer,
                    record.count(),
                    base_index as u64 * 4,
                    record.base_vertex(),
                    record.instance_count(),
                    record.base_instance(),
                ),
                _ => cmds.draw(
                    record.count(),
                    record.base_vertex(),
                    record.instance_count(),
                    record.base_instance(),
                ),
            }
        }
    }

    /// Fills the tess factor buffer by running the vertex stages of the
    /// drawing program without rasterization.
    fn execute_ptcs(
        &self,
        cmds: &mut GraphicsCmds,
        program: &DrawingProgram,
        bindings: &DrawBindings,
        pass: &RenderPassState,
        registry: &ResourceRegistry,
    ) {
        profiling::scope!("DrawBatch::execute_ptcs");

        let Some(pipeline) = self.graphics_pipeline(program, pass, registry, true) else {
            return;
        };
        cmds.push_debug_group(format_sso!("PTCS batch {}", self.id.0));
        cmds.bind_pipeline(*pipeline, true);
        cmds.bind_resources(bindings.resources.clone());
        cmds.bind_vertex_buffers(bindings.vertex_buffers.clone());
        self.record_draws(cmds, bindings, registry);
        cmds.pop_debug_group();
    }

    /// Records the draws of every item into `cmds`.
    ///
    /// Draws resolve their drawing coordinates from the dispatch buffer,
    /// both through indirect draws and when falling back to one draw per
    /// record. Unless `first_draw_batch` is set, binding a pipeline that is
    /// already bound is skipped.
    pub fn execute_draw(
        &mut self,
        cmds: &mut GraphicsCmds,
        pass: &RenderPassState,
        registry: &ResourceRegistry,
        first_draw_batch: bool,
    ) {
        profiling::scope!("DrawBatch::execute_draw");

        if self.items.is_empty() {
            log::error!("Batch {:?} has no draw items", self.id);
            return;
        }
        if self.dispatch_buffer.is_none() {
            log::warn!("Batch {:?} is drawn before it was compiled", self.id);
            return;
        }
        if self.has_nothing_to_draw() {
            return;
        }

        let Some(program) = self.drawing_program(pass, registry) else {
            return;
        };
        let Some(bindings) = self.draw_bindings(&program.desc.binder) else {
            return;
        };

        if self.tess_factors_buffer.is_some() {
            self.execute_ptcs(cmds, &program, &bindings, pass, registry);
            cmds.memory_barrier();
        }

        let Some(pipeline) = self.graphics_pipeline(&program, pass, registry, false) else {
            return;
        };
        cmds.bind_pipeline(*pipeline, first_draw_batch);
        cmds.bind_resources(bindings.resources.clone());
        cmds.bind_vertex_buffers(bindings.vertex_buffers.clone());
        self.record_draws(cmds, &bindings, registry);

        registry.perf_counters().add_draw_call(self.num_visible_items as u64);
    }
}
