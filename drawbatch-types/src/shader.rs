use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// Primitive topology produced by a geometric shader.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Points,
    Lines,
    Triangles,
    Quads,
    /// Quads pre-split into two triangles.
    TriQuads,
    /// Control-point patches consumed by a tessellator.
    Patches { control_points: u32 },
}

impl PrimitiveType {
    /// Number of indices one primitive occupies in the index buffer.
    pub fn index_size(self) -> u32 {
        match self {
            Self::Points => 1,
            Self::Lines => 2,
            Self::Triangles => 3,
            Self::Quads => 4,
            Self::TriQuads => 6,
            Self::Patches { control_points } => control_points,
        }
    }

    pub fn is_patches(self) -> bool {
        matches!(self, Self::Patches { .. })
    }
}

/// Topology facts about the shader stage that assembles primitives for a draw item.
///
/// The program source lives with the shader service; this only carries what the
/// batch compiler needs to encode draw commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometricShader {
    primitive_type: PrimitiveType,
    use_hardware_tessellation: bool,
    hash: u64,
}

impl GeometricShader {
    /// `source_hash` identifies the shader code the shader service will compose.
    pub fn new(primitive_type: PrimitiveType, use_hardware_tessellation: bool, source_hash: u64) -> Self {
        let mut hasher = FxHasher::default();
        primitive_type.hash(&mut hasher);
        use_hardware_tessellation.hash(&mut hasher);
        source_hash.hash(&mut hasher);
        Self {
            primitive_type,
            use_hardware_tessellation,
            hash: hasher.finish(),
        }
    }

    pub fn primitive_type(&self) -> PrimitiveType {
        self.primitive_type
    }

    pub fn primitive_index_size(&self) -> u32 {
        self.primitive_type.index_size()
    }

    pub fn use_hardware_tessellation(&self) -> bool {
        self.use_hardware_tessellation
    }

    /// Whether draws need a tess factor side buffer filled before drawing.
    pub fn needs_tess_factors(&self) -> bool {
        self.use_hardware_tessellation && self.primitive_type.is_patches()
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_sizes() {
        assert_eq!(PrimitiveType::Points.index_size(), 1);
        assert_eq!(PrimitiveType::Lines.index_size(), 2);
        assert_eq!(PrimitiveType::Triangles.index_size(), 3);
        assert_eq!(PrimitiveType::Quads.index_size(), 4);
        assert_eq!(PrimitiveType::Patches { control_points: 16 }.index_size(), 16);
    }

    #[test]
    fn tess_factors_need_both() {
        let tess_tris = GeometricShader::new(PrimitiveType::Triangles, true, 0);
        let patches = GeometricShader::new(PrimitiveType::Patches { control_points: 16 }, false, 0);
        let tess_patches = GeometricShader::new(PrimitiveType::Patches { control_points: 16 }, true, 0);
        assert!(!tess_tris.needs_tess_factors());
        assert!(!patches.needs_tess_factors());
        assert!(tess_patches.needs_tess_factors());
        assert_ne!(patches.hash(), tess_patches.hash());
    }
}
