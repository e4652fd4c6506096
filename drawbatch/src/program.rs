//! Drawing programs and the service that composes them.

use std::sync::Arc;

use drawbatch_types::{GeometricShader, ProgramHandle};

use crate::{
    error::ProgramError,
    item::DrawItemState,
    layout::DrawCommandLayout,
    pass::RenderPassState,
    util::{
        hash,
        typedefs::{FastHashMap, SsoString},
    },
};

/// Where a composed program expects each named resource.
///
/// Storage resources map to binding slots, per-draw and per-vertex
/// attributes map to vertex attribute locations. Resources a program does
/// not name are never bound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceBinder {
    bindings: FastHashMap<SsoString, u32>,
    attributes: FastHashMap<SsoString, u32>,
}

impl ResourceBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binding(mut self, name: &str, slot: u32) -> Self {
        self.bindings.insert(SsoString::from(name), slot);
        self
    }

    pub fn with_attribute(mut self, name: &str, location: u32) -> Self {
        self.attributes.insert(SsoString::from(name), location);
        self
    }

    pub fn binding(&self, name: &str) -> Option<u32> {
        self.bindings.get(name).copied()
    }

    pub fn attribute(&self, name: &str) -> Option<u32> {
        self.attributes.get(name).copied()
    }

    /// All binding slots, sorted.
    pub fn binding_slots(&self) -> Vec<u32> {
        let mut slots: Vec<u32> = self.bindings.values().copied().collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    fn hash(&self) -> u64 {
        let mut bindings: Vec<_> = self.bindings.iter().collect();
        bindings.sort_unstable();
        let mut attributes: Vec<_> = self.attributes.iter().collect();
        attributes.sort_unstable();
        hash::hash_one(&(bindings, attributes))
    }
}

/// A drawing program as composed by the [`ShaderService`].
#[derive(Debug, Clone)]
pub struct DrawingProgramDesc {
    pub label: SsoString,
    pub source: String,
    pub vertex_entry: SsoString,
    pub fragment_entry: Option<SsoString>,
    /// Vertex entry of the post tessellation control pass that fills tess
    /// factors. Falls back to `vertex_entry`.
    pub ptcs_entry: Option<SsoString>,
    pub binder: ResourceBinder,
}

impl DrawingProgramDesc {
    /// Content hash the program is registered under.
    pub fn hash(&self) -> u64 {
        hash::hash_one(&(
            &self.source,
            &self.vertex_entry,
            &self.fragment_entry,
            &self.ptcs_entry,
            self.binder.hash(),
        ))
    }
}

/// Composes drawing programs for batches.
///
/// Shader generation lives outside this crate; batches only hand over the
/// first draw item of the batch and get back source plus binding decisions.
///
/// `layout` is the batch's draw command record layout. Programs read their
/// drawing coordinates at its offsets, and read `culledInstanceIndices`
/// instead of `instanceIndices` when it carries a cull record.
pub trait ShaderService: Send + Sync {
    fn compose_drawing_program(
        &self,
        item: &DrawItemState,
        geometric_shader: &GeometricShader,
        layout: &DrawCommandLayout,
        pass: &RenderPassState,
    ) -> Result<DrawingProgramDesc, ProgramError>;
}

/// A compiled program shared through the registry.
#[derive(Debug)]
pub struct ShaderProgram {
    pub handle: ProgramHandle,
    pub hash: u64,
}

/// Drawing program cached by a batch for one render pass configuration.
#[derive(Debug, Clone)]
pub(crate) struct DrawingProgram {
    pub program: Arc<ShaderProgram>,
    pub desc: Arc<DrawingProgramDesc>,
    pub geometric_shader: Arc<GeometricShader>,
    pub layout: DrawCommandLayout,
    pub pass_hash: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binder_hash_ignores_insertion_order() {
        let a = ResourceBinder::new()
            .with_binding("constantPrimvars", 0)
            .with_binding("indices", 1)
            .with_attribute("drawingCoord0", 0);
        let b = ResourceBinder::new()
            .with_attribute("drawingCoord0", 0)
            .with_binding("indices", 1)
            .with_binding("constantPrimvars", 0);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.binding_slots(), vec![0, 1]);
        assert_eq!(a.attribute("drawingCoord1"), None);
    }
}
