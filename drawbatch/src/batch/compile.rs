use std::sync::Arc;

use drawbatch_types::{BufferArrayRange, BufferUsages, ElementFormat};
use smallvec::SmallVec;

use super::{
    DrawBatch, DRAWING_COORD0_VIEW, DRAWING_COORD1_VIEW, DRAWING_COORD2_VIEW, DRAWING_COORD_I_VIEW,
    DRAW_DISPATCH_VIEW, DRAW_INDIRECT_CULL_ROLE, DRAW_INDIRECT_ROLE, INDICES_RESOURCE, TESS_FACTORS_RESOURCE,
};
use crate::{
    buffer::{DispatchBuffer, GpuBuffer},
    item::{DrawItemInstance, DrawItemState},
    layout::{DrawCommand, DrawCommandLayout, DrawingCoord, TESSELLATION_ALIGNMENT_WORDS},
    registry::ResourceRegistry,
    util::hash,
};

/// Half floats of tess factors per index buffer element.
const TESS_FACTORS_PER_ELEMENT: u64 = 6;

fn element_offset(range: Option<&BufferArrayRange>) -> u32 {
    range.map_or(0, BufferArrayRange::element_offset)
}

fn element_count(range: Option<&BufferArrayRange>) -> u32 {
    range.map_or(0, BufferArrayRange::num_elements)
}

/// Instances an item draws. An instance index range that exists but is empty
/// yields zero, not one.
pub(super) fn instance_count(instance: &DrawItemInstance, state: &DrawItemState, instance_index_width: u32) -> u32 {
    let num_instances = state.ranges.instance_index.as_ref().map_or(1, BufferArrayRange::num_elements);
    match instance.is_visible() {
        true => num_instances / instance_index_width,
        false => 0,
    }
}

struct CompiledItem {
    command: DrawCommand,
    num_elements: u32,
    vertex_count: u32,
}

fn compile_item(
    instance: &DrawItemInstance,
    state: &DrawItemState,
    layout: &DrawCommandLayout,
    base_instance: u32,
) -> CompiledItem {
    let ranges = &state.ranges;
    let drawing_coord = DrawingCoord {
        model: 0,
        constant: element_offset(ranges.constant.as_ref()),
        element: element_offset(ranges.element.as_ref()),
        primitive: element_offset(ranges.topology.as_ref()),
        face_varying: element_offset(ranges.face_varying.as_ref()),
        instance_index: element_offset(ranges.instance_index.as_ref()),
        shader: element_offset(state.shader_data()),
        vertex: element_offset(ranges.vertex.as_ref()),
        topology_visibility: element_offset(ranges.topology_visibility.as_ref()),
        varying: element_offset(ranges.varying.as_ref()),
    };

    let indices_per_primitive = state
        .geometric_shader
        .as_ref()
        .map_or(1, |shader| shader.primitive_index_size());

    let vertex_count = element_count(ranges.vertex.as_ref());
    // an item without vertex data would draw uninitialized vertices
    let num_elements = match vertex_count {
        0 => 0,
        _ => element_count(ranges.topology.as_ref()),
    };

    let (count, base_index) = match (layout.is_indexed(), layout.patch_encoding) {
        (_, true) => (num_elements, drawing_coord.primitive),
        (true, false) => (
            num_elements * indices_per_primitive,
            drawing_coord.primitive * indices_per_primitive,
        ),
        (false, false) => (vertex_count, 0),
    };

    let command = DrawCommand {
        count,
        instance_count: instance_count(instance, state, layout.instance_index_width),
        base_index,
        base_vertex: drawing_coord.vertex,
        base_instance,
        drawing_coord,
        instance_coords: ranges
            .instance_primvars
            .iter()
            .map(|range| element_offset(range.as_ref()))
            .collect::<SmallVec<_>>(),
    };

    CompiledItem {
        command,
        num_elements,
        vertex_count,
    }
}

fn add_draw_resource_views(dispatch_buffer: &mut DispatchBuffer, layout: &DrawCommandLayout) {
    dispatch_buffer.add_resource_view(DRAW_DISPATCH_VIEW, ElementFormat::Uint32, layout.count_offset);
    dispatch_buffer.add_resource_view(DRAWING_COORD0_VIEW, ElementFormat::Uint32x4, layout.drawing_coord0_offset);
    dispatch_buffer.add_resource_view(DRAWING_COORD1_VIEW, ElementFormat::Uint32x4, layout.drawing_coord1_offset);
    dispatch_buffer.add_resource_view(DRAWING_COORD2_VIEW, ElementFormat::Uint32x2, layout.drawing_coord2_offset);
    if layout.instancer_num_levels > 0 {
        dispatch_buffer.add_resource_view(DRAWING_COORD_I_VIEW, ElementFormat::Uint32, layout.drawing_coord_i_offset);
    }
}

/// Sized from the whole index buffer, not only the item's range.
fn allocate_tess_factors_buffer(state: &DrawItemState, registry: &ResourceRegistry) -> Option<Arc<GpuBuffer>> {
    let indices = state.ranges.topology.as_ref()?.resource(INDICES_RESOURCE)?;
    let byte_size = registry.device().buffer_size(indices.buffer)?;
    let num_elements = byte_size / indices.format.size();
    let half_floats = num_elements * TESS_FACTORS_PER_ELEMENT;

    Some(registry.register_buffer_resource(
        TESS_FACTORS_RESOURCE,
        ElementFormat::Float16x2,
        half_floats / 2,
        BufferUsages::STORAGE,
    ))
}

impl DrawBatch {
    /// Encodes one record per item and uploads them into a new dispatch buffer.
    ///
    /// Callers guard this with [`DrawBatch::validate`]; compiling an unchanged
    /// batch produces the same records again.
    pub fn compile(&mut self, registry: &ResourceRegistry) {
        profiling::scope!("DrawBatch::compile");

        let Some(first) = self.items.first() else {
            return;
        };
        let (instancer_num_levels, geometric_shader) = {
            let state = first.draw_item().state();
            (state.instance_primvar_num_levels(), state.geometric_shader.clone())
        };
        let use_tessellation = geometric_shader
            .as_ref()
            .map_or(false, |shader| shader.use_hardware_tessellation());

        let alignment = match use_tessellation {
            true => TESSELLATION_ALIGNMENT_WORDS,
            false => 0,
        };
        let layout = DrawCommandLayout::new(
            instancer_num_levels,
            self.use_draw_indexed,
            self.use_instance_culling,
            alignment,
        )
        .with_patch_encoding(use_tessellation);

        log::debug!(
            "Compiling dispatch buffer of batch {:?}: {} items, {} words per record, indexed {}, instance culling {}",
            self.id,
            self.items.len(),
            layout.num_uint32,
            self.use_draw_indexed,
            self.use_instance_culling,
        );

        let stride = layout.num_uint32 as usize;
        let mut words = vec![0; self.items.len() * stride];

        self.num_visible_items = 0;
        self.num_total_elements = 0;
        self.num_total_vertices = 0;
        self.element_offsets_hash = 0;

        let mut encoded = 0;
        for (index, (instance, record)) in self.items.iter().zip(words.chunks_exact_mut(stride)).enumerate() {
            let state = instance.draw_item().state();
            self.element_offsets_hash = hash::combine(self.element_offsets_hash, &state.element_offsets_hash());

            let compiled = compile_item(instance, &state, &layout, index as u32);
            layout.encode(&compiled.command, record);

            self.num_visible_items += compiled.command.instance_count as usize;
            self.num_total_elements += compiled.num_elements as usize;
            self.num_total_vertices += compiled.vertex_count as usize;
            encoded += 1;
        }
        debug_assert_eq!(encoded, self.items.len());

        log::debug!(
            "Batch {:?}: {} visible, {} elements, {} vertices",
            self.id,
            self.num_visible_items,
            self.num_total_elements,
            self.num_total_vertices
        );

        let count = self.items.len() as u32;
        let mut dispatch_buffer = registry.register_dispatch_buffer(DRAW_INDIRECT_ROLE, count, layout.num_uint32);

        self.tess_factors_buffer = None;
        if geometric_shader.as_ref().map_or(false, |shader| shader.needs_tess_factors()) {
            self.tess_factors_buffer = allocate_tess_factors_buffer(&first.draw_item().state(), registry);
            if self.tess_factors_buffer.is_none() {
                log::warn!("Batch {:?} has patches without an index buffer to size tess factors", self.id);
            }
        }

        add_draw_resource_views(&mut dispatch_buffer, &layout);
        dispatch_buffer.copy_data(&words);

        // a buffer cannot be read and written by the same culling pass
        self.cull_input_buffer = self.use_gpu_culling.then(|| {
            let cull_input = registry.register_dispatch_buffer(DRAW_INDIRECT_CULL_ROLE, count, layout.num_uint32);
            cull_input.copy_data(&words);
            cull_input
        });

        self.dispatch_buffer = Some(dispatch_buffer);
        self.draw_command_buffer = words;
        self.draw_command_buffer_dirty = false;
        self.layout = Some(layout);
    }
}

#[cfg(test)]
mod tests {
    use drawbatch_types::{BufferArray, BufferHandle, BufferResource};

    use super::*;
    use crate::item::DrawItem;

    fn range(offset: u32, count: u32) -> BufferArrayRange {
        let array = BufferArray::new(vec![BufferResource::new(
            "points",
            BufferHandle::new(1),
            ElementFormat::Float32x3,
        )]);
        BufferArrayRange::new(array, offset, count)
    }

    #[test]
    fn empty_instance_range_draws_nothing() {
        let item = DrawItem::new(DrawItemState {
            ranges: crate::item::DrawItemRanges {
                instance_index: Some(range(0, 0)),
                ..Default::default()
            },
            ..Default::default()
        });
        let instance = DrawItemInstance::new(item);
        let state = instance.draw_item().state();
        assert_eq!(instance_count(&instance, &state, 1), 0);
    }

    #[test]
    fn missing_instance_range_draws_once() {
        let instance = DrawItemInstance::new(DrawItem::new(DrawItemState::default()));
        let state = instance.draw_item().state();
        assert_eq!(instance_count(&instance, &state, 1), 1);
        instance.set_visible(false);
        assert_eq!(instance_count(&instance, &state, 1), 0);
    }

    #[test]
    fn indexed_counts_scale_with_primitive_size() {
        let item = DrawItem::new(DrawItemState {
            ranges: crate::item::DrawItemRanges {
                topology: Some(range(4, 2)),
                vertex: Some(range(10, 8)),
                ..Default::default()
            },
            geometric_shader: Some(Arc::new(drawbatch_types::GeometricShader::new(
                drawbatch_types::PrimitiveType::Triangles,
                false,
                0,
            ))),
            ..Default::default()
        });
        let instance = DrawItemInstance::new(item);
        let state = instance.draw_item().state();
        let layout = DrawCommandLayout::new(0, true, false, 0);

        let compiled = compile_item(&instance, &state, &layout, 3);
        assert_eq!(compiled.command.count, 6);
        assert_eq!(compiled.command.base_index, 12);
        assert_eq!(compiled.command.base_vertex, 10);
        assert_eq!(compiled.command.base_instance, 3);
        assert_eq!(compiled.num_elements, 2);
        assert_eq!(compiled.vertex_count, 8);

        let patches = layout.with_patch_encoding(true);
        let compiled = compile_item(&instance, &state, &patches, 3);
        assert_eq!(compiled.command.count, 2);
        assert_eq!(compiled.command.base_index, 4);
    }
}
