//! CPU implementation of the culling program.
//!
//! Mirrors `shaders/cull.wgsl` operation for operation so that devices without
//! shader execution produce the same instance counts. Out of range reads
//! return zero, as robust buffer access does on the GPU.

use drawbatch_types::CullData;
use glam::{Mat4, Vec2, Vec4, Vec4Swizzles};

use super::{CullParams, CullingShaderKey};

/// Buffers bound to one culling dispatch.
pub struct CullBuffers<'a> {
    pub cull_input: &'a [u32],
    pub draw_commands: &'a mut [u32],
    pub cull_data: &'a [CullData],
    pub instance_indices: &'a [u32],
    pub culled_instance_indices: &'a mut [u32],
    /// One slice per instancer level.
    pub instance_transforms: &'a [&'a [Mat4]],
    pub visible_count: Option<&'a mut u32>,
}

fn word(words: &[u32], index: usize) -> u32 {
    words.get(index).copied().unwrap_or(0)
}

fn store(words: &mut [u32], index: usize, value: u32) {
    if let Some(slot) = words.get_mut(index) {
        *slot = value;
    }
}

/// Clip space bounding box test, plus the optional NDC extent test.
///
/// A box with `min > max` on any axis is treated as unbounded and always passes.
pub fn is_visible(to_clip: Mat4, bbox_min: Vec4, bbox_max: Vec4, draw_range_ndc: Option<Vec2>) -> bool {
    if bbox_min.x > bbox_max.x || bbox_min.y > bbox_max.y || bbox_min.z > bbox_max.z {
        return true;
    }

    let mut outside = [0_u32; 6];
    let mut ndc_min = Vec2::splat(f32::MAX);
    let mut ndc_max = Vec2::splat(f32::MIN);
    let mut all_in_front = true;

    for i in 0..8 {
        let corner = Vec4::new(
            if i & 1 != 0 { bbox_max.x } else { bbox_min.x },
            if i & 2 != 0 { bbox_max.y } else { bbox_min.y },
            if i & 4 != 0 { bbox_max.z } else { bbox_min.z },
            1.0,
        );
        let clip = to_clip * corner;
        outside[0] += (clip.x < -clip.w) as u32;
        outside[1] += (clip.x > clip.w) as u32;
        outside[2] += (clip.y < -clip.w) as u32;
        outside[3] += (clip.y > clip.w) as u32;
        outside[4] += (clip.z < 0.0) as u32;
        outside[5] += (clip.z > clip.w) as u32;

        if clip.w > 0.0 {
            let ndc = clip.xy() / clip.w;
            ndc_min = ndc_min.min(ndc);
            ndc_max = ndc_max.max(ndc);
        } else {
            all_in_front = false;
        }
    }

    if outside.iter().any(|&count| count == 8) {
        return false;
    }

    if let (Some(range), true) = (draw_range_ndc, all_in_front) {
        let extent = ndc_max - ndc_min;
        let size = extent.x.max(extent.y);
        if size < range.x {
            return false;
        }
        if range.y >= 0.0 && size > range.y {
            return false;
        }
    }

    true
}

struct RecordView {
    base: usize,
    item: CullData,
    instance_index_base: usize,
}

fn record_view(key: &CullingShaderKey, params: &CullParams, bufs: &CullBuffers<'_>, record: u32) -> RecordView {
    let base = record as usize * params.draw_command_num_uints as usize;
    let dc0 = base + key.draw_coord_offset as usize;
    let constant = word(bufs.cull_input, dc0 + 1) as usize;
    let item = bufs
        .cull_data
        .get(constant)
        .copied()
        .unwrap_or_else(|| CullData::empty(Mat4::IDENTITY));
    RecordView {
        base,
        item,
        instance_index_base: word(bufs.cull_input, dc0 + 5) as usize,
    }
}

fn tiny_range(key: &CullingShaderKey, params: &CullParams) -> Option<Vec2> {
    key.tiny_prim_culling.then_some(params.draw_range_ndc)
}

/// Model transform of one instance, innermost instancer level first.
fn instance_transform(key: &CullingShaderKey, bufs: &CullBuffers<'_>, view: &RecordView, src: usize) -> Mat4 {
    let mut transform = view.item.transform;
    for level in 0..key.instancer_num_levels as usize {
        let level_base = word(bufs.cull_input, view.base + key.drawing_coord_i_offset as usize + level) as usize;
        let index = level_base + word(bufs.instance_indices, src + level + 1) as usize;
        let instance = bufs
            .instance_transforms
            .get(level)
            .and_then(|transforms| transforms.get(index))
            .copied()
            .unwrap_or(Mat4::ZERO);
        transform = instance * transform;
    }
    transform
}

fn copy_tuple(bufs: &mut CullBuffers<'_>, src: usize, dst: usize, width: usize) {
    for k in 0..width {
        let value = word(bufs.instance_indices, src + k);
        store(bufs.culled_instance_indices, dst + k, value);
    }
}

/// Single-round culling of one draw command.
pub fn cull_record(key: &CullingShaderKey, params: &CullParams, bufs: &mut CullBuffers<'_>, record: u32) {
    let view = record_view(key, params, bufs, record);
    let tiny = tiny_range(key, params);

    let visible = if key.instance_culling {
        let instance_count = word(bufs.cull_input, view.base + key.cull_instance_count_offset as usize);
        let width = key.instance_index_width() as usize;
        let mut visible = 0;
        for instance in 0..instance_count as usize {
            let src = view.instance_index_base + instance * width;
            let model = instance_transform(key, bufs, &view, src);
            if is_visible(params.cull_matrix * model, view.item.bbox_min, view.item.bbox_max, tiny) {
                let dst = view.instance_index_base + visible as usize * width;
                copy_tuple(bufs, src, dst, width);
                visible += 1;
            }
        }
        visible
    } else {
        let instance_count = word(bufs.cull_input, view.base + key.instance_count_offset as usize);
        let model = view.item.transform;
        match instance_count > 0 && is_visible(params.cull_matrix * model, view.item.bbox_min, view.item.bbox_max, tiny) {
            true => instance_count,
            false => 0,
        }
    };

    store(bufs.draw_commands, view.base + key.instance_count_offset as usize, visible);
    if key.count_visible {
        if let Some(count) = bufs.visible_count.as_deref_mut() {
            *count += visible;
        }
    }
}

/// Clearing round of two-round culling.
pub fn reset_record(key: &CullingShaderKey, params: &CullParams, bufs: &mut CullBuffers<'_>, record: u32) {
    let base = record as usize * params.draw_command_num_uints as usize;
    store(bufs.draw_commands, base + key.instance_count_offset as usize, 0);
}

/// Counting round of two-round culling: tests a single instance and appends
/// it to the record's compacted instance list when visible.
pub fn cull_instance(key: &CullingShaderKey, params: &CullParams, bufs: &mut CullBuffers<'_>, record: u32, instance: u32) {
    let view = record_view(key, params, bufs, record);
    let width = key.instance_index_width() as usize;
    let src = view.instance_index_base + instance as usize * width;
    let model = instance_transform(key, bufs, &view, src);
    if !is_visible(
        params.cull_matrix * model,
        view.item.bbox_min,
        view.item.bbox_max,
        tiny_range(key, params),
    ) {
        return;
    }

    let count_index = view.base + key.instance_count_offset as usize;
    let slot = word(bufs.draw_commands, count_index);
    store(bufs.draw_commands, count_index, slot + 1);
    copy_tuple(bufs, src, view.instance_index_base + slot as usize * width, width);

    if key.count_visible {
        if let Some(count) = bufs.visible_count.as_deref_mut() {
            *count += 1;
        }
    }
}
