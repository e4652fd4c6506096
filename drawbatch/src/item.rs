//! Draw items as seen by batches.
//!
//! The scene layer owns draw items and mutates their ranges when buffers are
//! reallocated. Batches only read them, and write back where each instance
//! ended up.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use drawbatch_types::{BufferArrayRange, GeometricShader};
use parking_lot::{RwLock, RwLockReadGuard};
use smallvec::SmallVec;

use crate::util::hash;

/// Shader parameters of the material bound to a draw item.
#[derive(Debug, Clone)]
pub struct MaterialShader {
    /// Per-material parameter storage.
    pub shader_data: Option<BufferArrayRange>,
    /// Identity of the material program code.
    pub hash: u64,
}

/// Buffer ranges of one draw item. Absent ranges contribute offset zero.
#[derive(Debug, Clone, Default)]
pub struct DrawItemRanges {
    pub constant: Option<BufferArrayRange>,
    pub topology: Option<BufferArrayRange>,
    pub topology_visibility: Option<BufferArrayRange>,
    pub element: Option<BufferArrayRange>,
    pub face_varying: Option<BufferArrayRange>,
    pub varying: Option<BufferArrayRange>,
    pub vertex: Option<BufferArrayRange>,
    pub instance_index: Option<BufferArrayRange>,
    /// One range per instancer level, innermost first.
    pub instance_primvars: SmallVec<[Option<BufferArrayRange>; 2]>,
}

impl DrawItemRanges {
    /// Ranges that take part in aggregation, in a fixed order.
    fn each(&self) -> impl Iterator<Item = Option<&BufferArrayRange>> {
        [
            &self.constant,
            &self.topology,
            &self.topology_visibility,
            &self.element,
            &self.face_varying,
            &self.varying,
            &self.vertex,
            &self.instance_index,
        ]
        .into_iter()
        .chain(self.instance_primvars.iter())
        .map(Option::as_ref)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DrawItemState {
    pub ranges: DrawItemRanges,
    pub geometric_shader: Option<Arc<GeometricShader>>,
    pub material_shader: Option<Arc<MaterialShader>>,
}

impl DrawItemState {
    pub fn instance_primvar_num_levels(&self) -> u32 {
        self.ranges.instance_primvars.len() as u32
    }

    pub fn shader_data(&self) -> Option<&BufferArrayRange> {
        self.material_shader.as_ref()?.shader_data.as_ref()
    }

    /// Identity of every buffer array this item reads from.
    pub fn buffer_arrays_hash(&self) -> u64 {
        let ranges = self.ranges.each().chain(std::iter::once(self.shader_data()));
        ranges.fold(0, |seed, range| hash::combine(seed, &range.map(|r| r.array().id())))
    }

    /// Where inside those arrays this item's data starts.
    pub fn element_offsets_hash(&self) -> u64 {
        let ranges = self.ranges.each().chain(std::iter::once(self.shader_data()));
        ranges.fold(0, |seed, range| {
            hash::combine(seed, &range.map(|r| (r.element_offset(), r.num_elements())))
        })
    }
}

/// One drawable surface.
#[derive(Debug, Default)]
pub struct DrawItem {
    state: RwLock<DrawItemState>,
}

impl DrawItem {
    pub fn new(state: DrawItemState) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(state),
        })
    }

    pub fn state(&self) -> RwLockReadGuard<'_, DrawItemState> {
        self.state.read()
    }

    /// Applies a scene-side change, e.g. after a buffer array was reallocated.
    pub fn update(&self, f: impl FnOnce(&mut DrawItemState)) {
        f(&mut self.state.write())
    }

    pub fn buffer_arrays_hash(&self) -> u64 {
        self.state().buffer_arrays_hash()
    }

    pub fn element_offsets_hash(&self) -> u64 {
        self.state().element_offsets_hash()
    }

    pub fn geometric_shader(&self) -> Option<Arc<GeometricShader>> {
        self.state().geometric_shader.clone()
    }
}

fn ranges_aggregated(a: Option<&BufferArrayRange>, b: Option<&BufferArrayRange>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.is_aggregated_with(b),
        (None, None) => true,
        _ => false,
    }
}

/// Whether two items can be drawn by the same batch: same shaders, and every
/// range shares storage with its counterpart.
pub fn is_aggregated(a: &DrawItem, b: &DrawItem) -> bool {
    if std::ptr::eq(a, b) {
        return true;
    }
    let a = a.state();
    let b = b.state();

    let shaders_match = match (&a.geometric_shader, &b.geometric_shader) {
        (Some(a), Some(b)) => a.hash() == b.hash(),
        _ => false,
    };
    let materials_match = match (&a.material_shader, &b.material_shader) {
        (Some(a), Some(b)) => a.hash == b.hash,
        (None, None) => true,
        _ => false,
    };
    if !shaders_match || !materials_match {
        return false;
    }
    if a.ranges.instance_primvars.len() != b.ranges.instance_primvars.len() {
        return false;
    }

    let aggregated = a
        .ranges
        .each()
        .zip(b.ranges.each())
        .chain(std::iter::once((a.shader_data(), b.shader_data())))
        .all(|(a, b)| ranges_aggregated(a, b));
    aggregated
}

/// Identifies the batch an instance was placed in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BatchId(pub u64);

/// A draw item placed in a render pass, with its own visibility.
#[derive(Debug)]
pub struct DrawItemInstance {
    draw_item: Arc<DrawItem>,
    visible: AtomicBool,
    batch_index: AtomicUsize,
    batch: AtomicU64,
}

impl DrawItemInstance {
    pub fn new(draw_item: Arc<DrawItem>) -> Arc<Self> {
        Arc::new(Self {
            draw_item,
            visible: AtomicBool::new(true),
            batch_index: AtomicUsize::new(0),
            batch: AtomicU64::new(0),
        })
    }

    pub fn draw_item(&self) -> &Arc<DrawItem> {
        &self.draw_item
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    /// Changes visibility. The owning batch must be told through
    /// [`DrawBatch::draw_item_instance_changed`](crate::batch::DrawBatch::draw_item_instance_changed).
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Release);
    }

    /// Record index inside the owning batch.
    pub fn batch_index(&self) -> usize {
        self.batch_index.load(Ordering::Acquire)
    }

    pub fn batch(&self) -> Option<BatchId> {
        match self.batch.load(Ordering::Acquire) {
            0 => None,
            id => Some(BatchId(id)),
        }
    }

    pub(crate) fn assign(&self, batch: BatchId, index: usize) {
        self.batch_index.store(index, Ordering::Release);
        self.batch.store(batch.0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use drawbatch_types::{BufferArray, BufferHandle, BufferResource, ElementFormat, PrimitiveType};

    use super::*;

    fn item(constant: &Arc<BufferArray>, offset: u32, shader: &Arc<GeometricShader>) -> Arc<DrawItem> {
        DrawItem::new(DrawItemState {
            ranges: DrawItemRanges {
                constant: Some(BufferArrayRange::new(Arc::clone(constant), offset, 1)),
                ..Default::default()
            },
            geometric_shader: Some(Arc::clone(shader)),
            material_shader: None,
        })
    }

    #[test]
    fn aggregation_needs_shared_arrays() {
        let shader = Arc::new(GeometricShader::new(PrimitiveType::Triangles, false, 1));
        let array = || {
            let cull_data = BufferResource::new("cullData", BufferHandle::new(0), ElementFormat::CullData);
            BufferArray::new(vec![cull_data])
        };
        let shared = array();

        let a = item(&shared, 0, &shader);
        let b = item(&shared, 1, &shader);
        let split = item(&array(), 0, &shader);
        assert!(is_aggregated(&a, &a));
        assert!(is_aggregated(&a, &b));
        assert!(!is_aggregated(&a, &split));

        let other_shader = Arc::new(GeometricShader::new(PrimitiveType::Triangles, false, 2));
        assert!(!is_aggregated(&a, &item(&shared, 2, &other_shader)));
    }
}
