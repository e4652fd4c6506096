//! Binary layout of draw command records.
//!
//! Every record starts with the native indirect draw arguments, optionally
//! followed by a four word cull sub-record, then the ten word drawing
//! coordinate and one word per instancer level:
//!
//! ```text
//! non-indexed:   count instanceCount baseVertex baseInstance
//! indexed:       count instanceCount baseIndex baseVertex baseInstance
//! patch indexed: patchCount instanceCount patchStart baseInstance baseVertex
//! cull:          cullCount cullInstanceCount cullBaseVertex cullBaseInstance
//! drawingCoord0: model constant element primitive
//! drawingCoord1: fvar instanceIndex shader vertex
//! drawingCoord2: topVis varying
//! drawingCoordI: instanceDC[levels]
//! ```
//!
//! GPU programs read records through views at these exact offsets, so the
//! order never changes.

use smallvec::SmallVec;

use crate::util::math::round_up;

/// Number of words in the drawing coordinate bundle.
pub const DRAWING_COORD_WORDS: u32 = 10;
/// Number of words in the cull sub-record.
pub const CULL_RECORD_WORDS: u32 = 4;
/// Record alignment, in words, when drawing hardware-tessellated patches.
pub const TESSELLATION_ALIGNMENT_WORDS: u32 = 8;

const WORD: u32 = std::mem::size_of::<u32>() as u32;

/// The four record shapes. Chosen once per batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DrawCommandKind {
    NonIndexed,
    NonIndexedInstanceCull,
    Indexed,
    IndexedInstanceCull,
}

impl DrawCommandKind {
    pub fn new(indexed: bool, instance_culling: bool) -> Self {
        match (indexed, instance_culling) {
            (false, false) => Self::NonIndexed,
            (false, true) => Self::NonIndexedInstanceCull,
            (true, false) => Self::Indexed,
            (true, true) => Self::IndexedInstanceCull,
        }
    }

    pub fn is_indexed(self) -> bool {
        matches!(self, Self::Indexed | Self::IndexedInstanceCull)
    }

    pub fn has_cull_record(self) -> bool {
        matches!(self, Self::NonIndexedInstanceCull | Self::IndexedInstanceCull)
    }

    /// Words of native indirect draw arguments.
    pub fn argument_words(self) -> u32 {
        if self.is_indexed() {
            5
        } else {
            4
        }
    }

    /// Words before the drawing coordinate.
    pub fn header_words(self) -> u32 {
        self.argument_words() + if self.has_cull_record() { CULL_RECORD_WORDS } else { 0 }
    }
}

/// Per-resource element offsets of one draw item.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DrawingCoord {
    pub model: u32,
    pub constant: u32,
    pub element: u32,
    pub primitive: u32,
    pub face_varying: u32,
    pub instance_index: u32,
    pub shader: u32,
    pub vertex: u32,
    pub topology_visibility: u32,
    pub varying: u32,
}

impl DrawingCoord {
    pub fn to_words(&self) -> [u32; DRAWING_COORD_WORDS as usize] {
        [
            self.model,
            self.constant,
            self.element,
            self.primitive,
            self.face_varying,
            self.instance_index,
            self.shader,
            self.vertex,
            self.topology_visibility,
            self.varying,
        ]
    }

    pub fn from_words(words: &[u32; DRAWING_COORD_WORDS as usize]) -> Self {
        let [model, constant, element, primitive, face_varying, instance_index, shader, vertex, topology_visibility, varying] =
            *words;
        Self {
            model,
            constant,
            element,
            primitive,
            face_varying,
            instance_index,
            shader,
            vertex,
            topology_visibility,
            varying,
        }
    }
}

/// One logical draw command, independent of its encoding.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrawCommand {
    /// Vertex count for non-indexed draws, index count for indexed draws,
    /// patch count for patch draws.
    pub count: u32,
    pub instance_count: u32,
    /// First index for indexed draws, first patch for patch draws.
    pub base_index: u32,
    pub base_vertex: u32,
    pub base_instance: u32,
    pub drawing_coord: DrawingCoord,
    pub instance_coords: SmallVec<[u32; 4]>,
}

/// Stride and field offsets shared by every record of a batch.
///
/// All offsets are in bytes from the start of a record. Without instance
/// culling the cull offsets alias the ordinary count fields.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DrawCommandLayout {
    pub kind: DrawCommandKind,
    /// Whether the argument prefix uses the patch draw ordering.
    pub patch_encoding: bool,
    pub num_uint32: u32,
    pub num_uint32_padding: u32,
    pub instancer_num_levels: u32,
    pub instance_index_width: u32,
    pub count_offset: u32,
    pub instance_count_offset: u32,
    pub base_instance_offset: u32,
    pub cull_count_offset: u32,
    pub cull_instance_count_offset: u32,
    pub drawing_coord0_offset: u32,
    pub drawing_coord1_offset: u32,
    pub drawing_coord2_offset: u32,
    pub drawing_coord_i_offset: u32,
    pub patch_base_vertex_offset: u32,
}

impl DrawCommandLayout {
    pub fn new(instancer_num_levels: u32, indexed: bool, instance_culling: bool, alignment_words: u32) -> Self {
        let kind = DrawCommandKind::new(indexed, instance_culling);
        let arguments = kind.argument_words() * WORD;
        let header = kind.header_words() * WORD;

        let unpadded = kind.header_words() + DRAWING_COORD_WORDS + instancer_num_levels;
        let num_uint32 = round_up(unpadded, alignment_words);

        let (cull_count_offset, cull_instance_count_offset) = match kind.has_cull_record() {
            true => (arguments, arguments + WORD),
            false => (0, WORD),
        };

        let drawing_coord0_offset = header;
        let drawing_coord1_offset = drawing_coord0_offset + 4 * WORD;
        let drawing_coord2_offset = drawing_coord1_offset + 4 * WORD;

        Self {
            kind,
            patch_encoding: false,
            num_uint32,
            num_uint32_padding: num_uint32 - unpadded,
            instancer_num_levels,
            instance_index_width: instancer_num_levels + 1,
            count_offset: 0,
            instance_count_offset: WORD,
            base_instance_offset: if indexed { 4 * WORD } else { 3 * WORD },
            cull_count_offset,
            cull_instance_count_offset,
            drawing_coord0_offset,
            drawing_coord1_offset,
            drawing_coord2_offset,
            drawing_coord_i_offset: drawing_coord2_offset + 2 * WORD,
            // vertex is the last field of drawingCoord1
            patch_base_vertex_offset: drawing_coord1_offset + 3 * WORD,
        }
    }

    /// Switches the argument prefix to the patch ordering used by hardware
    /// tessellation. Only moves `baseInstance` for indexed records.
    pub fn with_patch_encoding(mut self, patch_encoding: bool) -> Self {
        self.patch_encoding = patch_encoding;
        if patch_encoding {
            self.base_instance_offset = 3 * WORD;
        } else if self.kind.is_indexed() {
            self.base_instance_offset = 4 * WORD;
        }
        self
    }

    pub fn is_indexed(&self) -> bool {
        self.kind.is_indexed()
    }

    pub fn has_cull_record(&self) -> bool {
        self.kind.has_cull_record()
    }

    pub fn stride_bytes(&self) -> u32 {
        self.num_uint32 * WORD
    }

    /// Word index of a field of record `record` inside a flat buffer.
    pub fn word_index(&self, record: usize, field_offset: u32) -> usize {
        record * self.num_uint32 as usize + (field_offset / WORD) as usize
    }

    /// Writes `command` into one record sized slice.
    pub fn encode(&self, command: &DrawCommand, out: &mut [u32]) {
        debug_assert_eq!(out.len(), self.num_uint32 as usize);
        debug_assert_eq!(command.instance_coords.len(), self.instancer_num_levels as usize);

        let arguments = self.kind.argument_words() as usize;
        match (self.is_indexed(), self.patch_encoding) {
            (false, false) => out[..4].copy_from_slice(&[
                command.count,
                command.instance_count,
                command.base_vertex,
                command.base_instance,
            ]),
            (false, true) => out[..4].copy_from_slice(&[
                command.count,
                command.instance_count,
                command.base_index,
                command.base_instance,
            ]),
            (true, false) => out[..5].copy_from_slice(&[
                command.count,
                command.instance_count,
                command.base_index,
                command.base_vertex,
                command.base_instance,
            ]),
            (true, true) => out[..5].copy_from_slice(&[
                command.count,
                command.instance_count,
                command.base_index,
                command.base_instance,
                command.base_vertex,
            ]),
        }

        if self.has_cull_record() {
            // one culling invocation per record; cullBaseVertex is unused
            out[arguments..arguments + 4].copy_from_slice(&[1, command.instance_count, 0, command.base_instance]);
        }

        let dc0 = (self.drawing_coord0_offset / WORD) as usize;
        out[dc0..dc0 + DRAWING_COORD_WORDS as usize].copy_from_slice(&command.drawing_coord.to_words());

        let dci = (self.drawing_coord_i_offset / WORD) as usize;
        for (slot, &coord) in out[dci..].iter_mut().zip(command.instance_coords.iter()) {
            *slot = coord;
        }

        let padding_start = self.num_uint32 as usize - self.num_uint32_padding as usize;
        out[padding_start..].fill(0);
    }

    /// Typed read access to record `index` of a flat buffer.
    pub fn record<'a>(&'a self, words: &'a [u32], index: usize) -> Option<DrawCommandRecord<'a>> {
        let stride = self.num_uint32 as usize;
        let words = words.get(index * stride..(index + 1) * stride)?;
        Some(DrawCommandRecord { layout: self, words })
    }
}

/// Borrowed view of one encoded record.
#[derive(Debug, Copy, Clone)]
pub struct DrawCommandRecord<'a> {
    layout: &'a DrawCommandLayout,
    words: &'a [u32],
}

impl<'a> DrawCommandRecord<'a> {
    fn at(&self, offset: u32) -> u32 {
        self.words[(offset / WORD) as usize]
    }

    pub fn words(&self) -> &'a [u32] {
        self.words
    }

    pub fn count(&self) -> u32 {
        self.at(self.layout.count_offset)
    }

    pub fn instance_count(&self) -> u32 {
        self.at(self.layout.instance_count_offset)
    }

    pub fn base_instance(&self) -> u32 {
        self.at(self.layout.base_instance_offset)
    }

    /// First index of an indexed draw, or first patch of a patch draw.
    pub fn base_index(&self) -> Option<u32> {
        match (self.layout.is_indexed(), self.layout.patch_encoding) {
            (true, _) | (false, true) => Some(self.words[2]),
            (false, false) => None,
        }
    }

    pub fn base_vertex(&self) -> u32 {
        match (self.layout.is_indexed(), self.layout.patch_encoding) {
            (false, false) => self.words[2],
            (false, true) => self.drawing_coord().vertex,
            (true, false) => self.words[3],
            (true, true) => self.words[4],
        }
    }

    pub fn cull_count(&self) -> u32 {
        self.at(self.layout.cull_count_offset)
    }

    pub fn cull_instance_count(&self) -> u32 {
        self.at(self.layout.cull_instance_count_offset)
    }

    pub fn drawing_coord(&self) -> DrawingCoord {
        let start = (self.layout.drawing_coord0_offset / WORD) as usize;
        let mut words = [0; DRAWING_COORD_WORDS as usize];
        words.copy_from_slice(&self.words[start..start + DRAWING_COORD_WORDS as usize]);
        DrawingCoord::from_words(&words)
    }

    pub fn instance_coords(&self) -> &'a [u32] {
        let start = (self.layout.drawing_coord_i_offset / WORD) as usize;
        &self.words[start..start + self.layout.instancer_num_levels as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes() {
        assert_eq!(DrawCommandLayout::new(0, false, false, 0).num_uint32, 14);
        assert_eq!(DrawCommandLayout::new(0, false, true, 0).num_uint32, 18);
        assert_eq!(DrawCommandLayout::new(0, true, false, 0).num_uint32, 15);
        assert_eq!(DrawCommandLayout::new(0, true, true, 0).num_uint32, 19);
        assert_eq!(DrawCommandLayout::new(2, true, true, 0).num_uint32, 21);
    }

    #[test]
    fn alignment_pads_stride() {
        for levels in 0..5 {
            for (indexed, culling) in [(false, false), (false, true), (true, false), (true, true)] {
                let layout = DrawCommandLayout::new(levels, indexed, culling, TESSELLATION_ALIGNMENT_WORDS);
                assert_eq!(layout.num_uint32 % TESSELLATION_ALIGNMENT_WORDS, 0);
                let unpadded = DrawCommandLayout::new(levels, indexed, culling, 0);
                assert_eq!(layout.num_uint32 - layout.num_uint32_padding, unpadded.num_uint32);
                assert_eq!(layout, DrawCommandLayout::new(levels, indexed, culling, 8));
            }
        }
    }

    #[test]
    fn cull_offsets_alias_without_culling() {
        let layout = DrawCommandLayout::new(1, true, false, 0);
        assert_eq!(layout.cull_count_offset, layout.count_offset);
        assert_eq!(layout.cull_instance_count_offset, layout.instance_count_offset);

        let layout = DrawCommandLayout::new(1, true, true, 0);
        assert_eq!(layout.cull_count_offset, 20);
        assert_eq!(layout.cull_instance_count_offset, 24);
        assert_eq!(layout.drawing_coord0_offset, 36);
        assert_eq!(layout.drawing_coord1_offset, 52);
        assert_eq!(layout.drawing_coord2_offset, 68);
        assert_eq!(layout.drawing_coord_i_offset, 76);
        assert_eq!(layout.patch_base_vertex_offset, 64);
    }

    #[test]
    fn encode_reads_back_through_accessors() {
        let layout = DrawCommandLayout::new(1, true, true, 0);
        let command = DrawCommand {
            count: 36,
            instance_count: 3,
            base_index: 12,
            base_vertex: 8,
            base_instance: 2,
            drawing_coord: DrawingCoord {
                constant: 2,
                primitive: 4,
                instance_index: 6,
                vertex: 8,
                ..Default::default()
            },
            instance_coords: SmallVec::from_slice(&[5]),
        };
        let mut words = vec![0xFFFF_FFFF; layout.num_uint32 as usize * 3];
        let stride = layout.num_uint32 as usize;
        layout.encode(&command, &mut words[2 * stride..3 * stride]);

        let record = layout.record(&words, 2).unwrap();
        assert_eq!(record.count(), 36);
        assert_eq!(record.instance_count(), 3);
        assert_eq!(record.base_index(), Some(12));
        assert_eq!(record.base_vertex(), 8);
        assert_eq!(record.base_instance(), 2);
        assert_eq!(record.cull_count(), 1);
        assert_eq!(record.cull_instance_count(), 3);
        assert_eq!(record.drawing_coord(), command.drawing_coord);
        assert_eq!(record.instance_coords(), &[5]);
        assert!(layout.record(&words, 3).is_none());
    }

    #[test]
    fn patch_encoding_moves_base_instance() {
        let layout = DrawCommandLayout::new(0, true, false, TESSELLATION_ALIGNMENT_WORDS).with_patch_encoding(true);
        assert_eq!(layout.num_uint32, 16);
        assert_eq!(layout.base_instance_offset, 12);

        let command = DrawCommand {
            count: 2,
            instance_count: 1,
            base_index: 7,
            base_vertex: 30,
            base_instance: 4,
            drawing_coord: DrawingCoord {
                vertex: 30,
                ..Default::default()
            },
            instance_coords: SmallVec::new(),
        };
        let mut words = vec![0xAAAA_AAAA; 16];
        layout.encode(&command, &mut words);
        assert_eq!(&words[..5], &[2, 1, 7, 4, 30]);
        assert_eq!(&words[15..], &[0]);

        let record = layout.record(&words, 0).unwrap();
        assert_eq!(record.base_instance(), 4);
        assert_eq!(record.base_vertex(), 30);
    }
}
