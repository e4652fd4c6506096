//! GPU frustum culling of draw commands.
//!
//! The culling program reads the untouched cull input copy of the draw
//! commands and rewrites `instanceCount` in the dispatch buffer. Instance
//! culling additionally compacts the surviving instance index tuples.

use encase::{ShaderType, UniformBuffer};
use glam::{Mat4, Vec2};
use serde::Serialize;

use crate::{
    device::{BindingKind, BindingLayoutEntry, ShaderStages},
    layout::DrawCommandLayout,
    util::hash,
};

pub mod kernel;
mod shader;

pub use shader::*;

pub const PARAMS_BINDING: u32 = 0;
pub const CULL_INPUT_BINDING: u32 = 1;
pub const DRAW_COMMANDS_BINDING: u32 = 2;
pub const CULL_DATA_BINDING: u32 = 3;
pub const INSTANCE_INDICES_BINDING: u32 = 4;
pub const CULLED_INSTANCE_INDICES_BINDING: u32 = 5;
pub const VISIBLE_COUNT_BINDING: u32 = 6;
/// Instancer level `n` is bound at `INSTANCE_TRANSFORMS_BINDING + n`.
pub const INSTANCE_TRANSFORMS_BINDING: u32 = 7;

/// Workgroup width of the culling compute program.
pub const CULL_WORKGROUP_SIZE: u32 = 64;

/// Name of the per-item culling record in the constant buffer array.
pub const CULL_DATA_RESOURCE: &str = "cullData";
pub const INSTANCE_INDICES_RESOURCE: &str = "instanceIndices";
pub const CULLED_INSTANCE_INDICES_RESOURCE: &str = "culledInstanceIndices";
pub const INSTANCE_TRANSFORM_RESOURCE: &str = "instanceTransform";

/// Everything the culling program is specialized on.
///
/// Offsets are in words from the start of a draw command.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CullingShaderKey {
    pub instance_culling: bool,
    pub tiny_prim_culling: bool,
    pub count_visible: bool,
    pub instancer_num_levels: u32,
    pub draw_coord_offset: u32,
    pub instance_count_offset: u32,
    pub cull_instance_count_offset: u32,
    pub drawing_coord_i_offset: u32,
}

impl CullingShaderKey {
    pub fn new(layout: &DrawCommandLayout, tiny_prim_culling: bool, count_visible: bool) -> Self {
        Self {
            instance_culling: layout.has_cull_record(),
            tiny_prim_culling,
            count_visible,
            instancer_num_levels: layout.instancer_num_levels,
            draw_coord_offset: layout.drawing_coord0_offset / 4,
            instance_count_offset: layout.instance_count_offset / 4,
            cull_instance_count_offset: layout.cull_instance_count_offset / 4,
            drawing_coord_i_offset: layout.drawing_coord_i_offset / 4,
        }
    }

    pub fn instance_index_width(&self) -> u32 {
        self.instancer_num_levels + 1
    }

    pub fn hash(&self) -> u64 {
        hash::hash_one(self)
    }

    /// Bindings the culling program declares.
    pub fn binding_layout(&self) -> Vec<BindingLayoutEntry> {
        let entry = |binding, kind| BindingLayoutEntry {
            binding,
            kind,
            stages: ShaderStages::COMPUTE,
        };
        let read = BindingKind::Storage { read_only: true };
        let write = BindingKind::Storage { read_only: false };

        let mut entries = vec![
            entry(PARAMS_BINDING, BindingKind::Uniform),
            entry(CULL_INPUT_BINDING, read),
            entry(DRAW_COMMANDS_BINDING, write),
            entry(CULL_DATA_BINDING, read),
        ];
        if self.instance_culling {
            entries.push(entry(INSTANCE_INDICES_BINDING, read));
            entries.push(entry(CULLED_INSTANCE_INDICES_BINDING, write));
            for level in 0..self.instancer_num_levels {
                entries.push(entry(INSTANCE_TRANSFORMS_BINDING + level, read));
            }
        }
        if self.count_visible {
            entries.push(entry(VISIBLE_COUNT_BINDING, write));
        }
        entries
    }
}

/// Uniforms of one culling dispatch.
#[derive(Debug, Copy, Clone, PartialEq, ShaderType)]
pub struct CullParams {
    pub cull_matrix: Mat4,
    /// Minimum and maximum NDC extent for tiny-prim culling. A negative
    /// maximum disables the upper bound.
    pub draw_range_ndc: Vec2,
    pub draw_command_num_uints: u32,
    pub record_count: u32,
    /// Non-zero for the clearing round of two-round culling.
    pub reset_pass: u32,
}

impl CullParams {
    pub fn size() -> u64 {
        Self::min_size().get()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = UniformBuffer::new(Vec::with_capacity(Self::size() as usize));
        match buffer.write(self) {
            Ok(()) => buffer.into_inner(),
            Err(e) => {
                log::error!("Failed to encode cull params: {e}");
                vec![0; Self::size() as usize]
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        UniformBuffer::new(bytes).create().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_layout_matches_wgsl() {
        assert_eq!(CullParams::size(), 96);
        let params = CullParams {
            cull_matrix: Mat4::from_cols_array(&[
                1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0,
            ]),
            draw_range_ndc: Vec2::new(0.25, -1.0),
            draw_command_num_uints: 18,
            record_count: 3,
            reset_pass: 1,
        };
        let bytes = params.to_bytes();
        let words: Vec<u32> = bytes[64..84]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(f32::from_bits(words[0]), 0.25);
        assert_eq!(f32::from_bits(words[1]), -1.0);
        assert_eq!(&words[2..], &[18, 3, 1]);
        assert_eq!(CullParams::from_bytes(&bytes), Some(params));
    }

    #[test]
    fn key_follows_layout() {
        let layout = DrawCommandLayout::new(2, true, true, 0);
        let key = CullingShaderKey::new(&layout, false, true);
        assert!(key.instance_culling);
        assert_eq!(key.draw_coord_offset, 9);
        assert_eq!(key.instance_count_offset, 1);
        assert_eq!(key.cull_instance_count_offset, 6);
        assert_eq!(key.drawing_coord_i_offset, 19);
        assert_eq!(key.instance_index_width(), 3);

        let bindings: Vec<u32> = key.binding_layout().iter().map(|e| e.binding).collect();
        assert_eq!(bindings, vec![0, 1, 2, 3, 4, 5, 7, 8, 6]);
    }
}
