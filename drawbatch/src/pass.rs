use drawbatch_types::{CompareFunction, Face, TextureFormat};
use glam::{Mat4, Vec2};

use crate::util::hash;

/// State of the render pass a batch draws into.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassState {
    /// World to clip transform used by culling.
    pub cull_matrix: Mat4,
    /// Minimum and maximum NDC extent of items that get drawn. A negative
    /// maximum means unbounded.
    pub drawing_range_ndc: Vec2,
    pub color_format: Option<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub depth_compare: CompareFunction,
    pub depth_write: bool,
    pub cull_face: Option<Face>,
    pub sample_count: u32,
}

impl RenderPassState {
    pub fn new(cull_matrix: Mat4) -> Self {
        Self {
            cull_matrix,
            drawing_range_ndc: Vec2::new(0.0, -1.0),
            color_format: Some(TextureFormat::Rgba8UnormSrgb),
            depth_format: Some(TextureFormat::Depth32Float),
            depth_compare: CompareFunction::GreaterEqual,
            depth_write: true,
            cull_face: Some(Face::Back),
            sample_count: 1,
        }
    }

    /// Sets the drawing range from a pixel extent and viewport size.
    pub fn set_drawing_range(&mut self, min_pixels: f32, max_pixels: f32, viewport: Vec2) {
        let max = if max_pixels < 0.0 {
            -1.0
        } else {
            2.0 * max_pixels / viewport.y
        };
        self.drawing_range_ndc = Vec2::new(2.0 * min_pixels / viewport.x, max);
    }

    /// Hash of the state baked into graphics pipelines. Culling inputs do not
    /// take part.
    pub fn graphics_pipeline_hash(&self) -> u64 {
        hash::hash_one(&(
            self.color_format,
            self.depth_format,
            self.depth_compare,
            self.depth_write,
            self.cull_face,
            self.sample_count,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn culling_inputs_do_not_change_pipeline_hash() {
        let a = RenderPassState::new(Mat4::IDENTITY);
        let mut b = RenderPassState::new(Mat4::from_scale(glam::Vec3::splat(2.0)));
        b.set_drawing_range(4.0, -1.0, Vec2::new(800.0, 600.0));
        assert_eq!(a.graphics_pipeline_hash(), b.graphics_pipeline_hash());
        assert_eq!(b.drawing_range_ndc, Vec2::new(0.01, -1.0));

        b.sample_count = 4;
        assert_ne!(a.graphics_pipeline_hash(), b.graphics_pipeline_hash());
    }
}
