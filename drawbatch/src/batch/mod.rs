//! Batches of aggregated draw items compiled into one dispatch buffer.
//!
//! A batch is driven once per frame by the render pass that owns it:
//! [`DrawBatch::validate`] decides whether it is still usable,
//! [`DrawBatch::prepare_draw`] compiles, uploads and culls, and
//! [`DrawBatch::execute_draw`] records the draws.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    buffer::{DispatchBuffer, GpuBuffer},
    item::{is_aggregated, BatchId, DrawItemInstance},
    layout::{DrawCommandLayout, DrawCommandRecord},
    options::BatchOptions,
    pass::RenderPassState,
    program::DrawingProgram,
    registry::ResourceRegistry,
};

mod compile;
mod cull;
mod draw;
mod validate;

pub use validate::ValidationResult;

use cull::CullingPipeline;

/// Role of the dispatch buffer drawn from.
pub const DRAW_INDIRECT_ROLE: &str = "drawIndirect";
/// Role of the read-only copy culling reads from.
pub const DRAW_INDIRECT_CULL_ROLE: &str = "drawIndirectCull";
/// Role of the visible instance counter.
pub const DRAW_INDIRECT_RESULT_ROLE: &str = "drawIndirectResult";
/// Role of the tess factor side buffer, also the name programs bind it by.
pub const TESS_FACTORS_RESOURCE: &str = "tessFactors";
/// Index buffer resource of the topology range.
pub const INDICES_RESOURCE: &str = "indices";

/// Views of the dispatch buffer. Programs read the drawing coordinates as
/// per draw command vertex attributes under these names.
pub const DRAW_DISPATCH_VIEW: &str = "drawDispatch";
pub const DRAWING_COORD0_VIEW: &str = "drawingCoord0";
pub const DRAWING_COORD1_VIEW: &str = "drawingCoord1";
pub const DRAWING_COORD2_VIEW: &str = "drawingCoord2";
/// One `u32` per instancer level, at consecutive attribute locations.
pub const DRAWING_COORD_I_VIEW: &str = "drawingCoordI";

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

/// A set of aggregated draw item instances drawn through one dispatch buffer.
///
/// Drawing configuration is taken from the first item. Every item appended
/// later has to aggregate with it.
pub struct DrawBatch {
    id: BatchId,
    options: BatchOptions,
    items: Vec<Arc<DrawItemInstance>>,

    use_draw_indexed: bool,
    use_instancing: bool,
    use_gpu_culling: bool,
    use_instance_culling: bool,
    use_tiny_prim_culling: bool,
    dirty_culling_program: bool,

    buffer_arrays_hash: u64,
    element_offsets_hash: u64,

    layout: Option<DrawCommandLayout>,
    draw_command_buffer: Vec<u32>,
    draw_command_buffer_dirty: bool,
    dispatch_buffer: Option<DispatchBuffer>,
    cull_input_buffer: Option<DispatchBuffer>,
    tess_factors_buffer: Option<Arc<GpuBuffer>>,
    result_buffer: Option<Arc<GpuBuffer>>,
    cull_params_buffer: Option<GpuBuffer>,

    culling_pipeline: Option<CullingPipeline>,
    drawing_program: Option<DrawingProgram>,

    num_visible_items: usize,
    num_total_elements: usize,
    num_total_vertices: usize,
}

impl DrawBatch {
    pub fn new(first: Arc<DrawItemInstance>, options: BatchOptions) -> Self {
        let mut batch = Self {
            id: BatchId(NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed)),
            options,
            items: Vec::new(),
            use_draw_indexed: true,
            use_instancing: false,
            use_gpu_culling: false,
            use_instance_culling: false,
            use_tiny_prim_culling: options.enable_tiny_prim_culling,
            dirty_culling_program: false,
            buffer_arrays_hash: 0,
            element_offsets_hash: 0,
            layout: None,
            draw_command_buffer: Vec::new(),
            draw_command_buffer_dirty: false,
            dispatch_buffer: None,
            cull_input_buffer: None,
            tess_factors_buffer: None,
            result_buffer: None,
            cull_params_buffer: None,
            culling_pipeline: None,
            drawing_program: None,
            num_visible_items: 0,
            num_total_elements: 0,
            num_total_vertices: 0,
        };
        batch.init(first);
        batch
    }

    fn init(&mut self, first: Arc<DrawItemInstance>) {
        first.assign(self.id, 0);

        let (buffer_arrays_hash, indexed, instancing) = {
            let state = first.draw_item().state();
            (
                state.buffer_arrays_hash(),
                state.ranges.topology.is_some(),
                state.ranges.instance_index.is_some(),
            )
        };
        self.buffer_arrays_hash = buffer_arrays_hash;
        // recomputed by compile
        self.element_offsets_hash = 0;

        let culling_config = (self.use_draw_indexed, self.use_instance_culling);
        self.use_draw_indexed = indexed;
        self.use_instancing = instancing;
        self.use_gpu_culling = self.options.enable_gpu_frustum_culling;
        self.use_instance_culling =
            instancing && self.use_gpu_culling && self.options.enable_gpu_instance_culling;
        if culling_config != (self.use_draw_indexed, self.use_instance_culling) {
            self.culling_pipeline = None;
        }
        self.drawing_program = None;

        self.items.clear();
        self.items.push(first);

        log::debug!("Resetting dispatch buffer of batch {:?}", self.id);
        self.dispatch_buffer = None;
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub fn items(&self) -> &[Arc<DrawItemInstance>] {
        &self.items
    }

    /// Adds `instance` if it aggregates with the first item of the batch.
    pub fn append(&mut self, instance: Arc<DrawItemInstance>) -> bool {
        let Some(first) = self.items.first() else {
            return false;
        };
        if !is_aggregated(first.draw_item(), instance.draw_item()) {
            return false;
        }
        instance.assign(self.id, self.items.len());
        self.items.push(instance);
        self.dispatch_buffer = None;
        true
    }

    /// Re-initializes from the current items. Returns `false` when they no
    /// longer aggregate, in which case every batch has to be rebuilt.
    pub fn rebuild(&mut self) -> bool {
        let mut items = std::mem::take(&mut self.items).into_iter();
        let Some(first) = items.next() else {
            return false;
        };
        self.init(first);
        items.all(|instance| self.append(instance))
    }

    /// Toggles tiny-prim culling. Takes effect on the next culling pass.
    pub fn set_enable_tiny_prim_culling(&mut self, enable: bool) {
        if self.use_tiny_prim_culling != enable {
            self.use_tiny_prim_culling = enable;
            self.dirty_culling_program = true;
        }
    }

    /// Compiles if needed, uploads pending record changes and culls.
    pub fn prepare_draw(&mut self, pass: &RenderPassState, registry: &ResourceRegistry) {
        profiling::scope!("DrawBatch::prepare_draw");

        if self.dispatch_buffer.is_none() {
            self.compile(registry);
        }

        if self.has_nothing_to_draw() {
            return;
        }

        let update_buffer_data = self.draw_command_buffer_dirty;
        if update_buffer_data {
            if let Some(dispatch_buffer) = &self.dispatch_buffer {
                dispatch_buffer.copy_data(&self.draw_command_buffer);
            }
            self.draw_command_buffer_dirty = false;
        }

        if self.use_gpu_culling {
            self.execute_frustum_cull(update_buffer_data, pass, registry);
        }
    }

    /// Patches the record of `instance` after its visibility or instance
    /// count changed. The upload happens on the next [`Self::prepare_draw`].
    pub fn draw_item_instance_changed(&mut self, instance: &DrawItemInstance) {
        if self.dispatch_buffer.is_none() {
            return;
        }
        let Some(layout) = self.layout else {
            return;
        };
        debug_assert_eq!(instance.batch(), Some(self.id));

        let batch_index = instance.batch_index();
        let new_instance_count = {
            let state = instance.draw_item().state();
            compile::instance_count(instance, &state, state.instance_primvar_num_levels() + 1)
        };

        let count_index = layout.word_index(batch_index, layout.instance_count_offset);
        let cull_count_index = layout.word_index(batch_index, layout.cull_instance_count_offset);
        let Some(&old_instance_count) = self.draw_command_buffer.get(count_index) else {
            log::error!("Draw item instance {batch_index} is out of range of batch {:?}", self.id);
            return;
        };

        log::debug!("Instance count changed: {old_instance_count} -> {new_instance_count}");

        if new_instance_count != old_instance_count {
            self.num_visible_items =
                (self.num_visible_items + new_instance_count as usize).saturating_sub(old_instance_count as usize);
            // both indices are the same without instance culling
            self.draw_command_buffer[count_index] = new_instance_count;
            self.draw_command_buffer[cull_count_index] = new_instance_count;
            self.draw_command_buffer_dirty = true;
        }
    }

    /// Instances drawn, or the visible instances of the last counted culling pass.
    pub fn num_visible_items(&self) -> usize {
        self.num_visible_items
    }

    pub fn num_total_elements(&self) -> usize {
        self.num_total_elements
    }

    pub fn num_total_vertices(&self) -> usize {
        self.num_total_vertices
    }

    pub fn has_nothing_to_draw(&self) -> bool {
        (self.use_draw_indexed && self.num_total_elements == 0)
            || (!self.use_draw_indexed && self.num_total_vertices == 0)
    }

    pub fn use_draw_indexed(&self) -> bool {
        self.use_draw_indexed
    }

    pub fn use_gpu_culling(&self) -> bool {
        self.use_gpu_culling
    }

    pub fn use_instance_culling(&self) -> bool {
        self.use_instance_culling
    }

    pub fn layout(&self) -> Option<&DrawCommandLayout> {
        self.layout.as_ref()
    }

    /// CPU side mirror of the dispatch buffer.
    pub fn draw_command_buffer(&self) -> &[u32] {
        &self.draw_command_buffer
    }

    pub fn is_draw_command_buffer_dirty(&self) -> bool {
        self.draw_command_buffer_dirty
    }

    pub fn dispatch_buffer(&self) -> Option<&DispatchBuffer> {
        self.dispatch_buffer.as_ref()
    }

    pub fn cull_input_buffer(&self) -> Option<&DispatchBuffer> {
        self.cull_input_buffer.as_ref()
    }

    pub fn tess_factors_buffer(&self) -> Option<&Arc<GpuBuffer>> {
        self.tess_factors_buffer.as_ref()
    }

    /// Record `index` of the CPU side mirror.
    pub fn record(&self, index: usize) -> Option<DrawCommandRecord<'_>> {
        self.layout.as_ref()?.record(&self.draw_command_buffer, index)
    }
}
