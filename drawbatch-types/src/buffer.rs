use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::BufferHandle;

/// Layout of a single element of a buffer resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ElementFormat {
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Float32x4x4,
    /// Two half floats.
    Float16x2,
    /// One [`CullData`] record.
    CullData,
}

impl ElementFormat {
    /// Size of one element in bytes.
    pub const fn size(self) -> u64 {
        match self {
            Self::Uint32 | Self::Float32 | Self::Float16x2 => 4,
            Self::Uint32x2 | Self::Float32x2 => 8,
            Self::Uint32x3 | Self::Float32x3 => 12,
            Self::Uint32x4 | Self::Float32x4 => 16,
            Self::Float32x4x4 => 64,
            Self::CullData => std::mem::size_of::<CullData>() as u64,
        }
    }

    /// Number of 32 bit components in one element.
    pub const fn components(self) -> u32 {
        (self.size() / 4) as u32
    }
}

/// One named resource inside a [`BufferArray`], backed by its own device buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferResource {
    pub name: String,
    pub buffer: BufferHandle,
    pub format: ElementFormat,
}

impl BufferResource {
    pub fn new(name: impl Into<String>, buffer: BufferHandle, format: ElementFormat) -> Self {
        Self {
            name: name.into(),
            buffer,
            format,
        }
    }
}

static NEXT_ARRAY_ID: AtomicUsize = AtomicUsize::new(1);

/// Identity of a buffer array. A reallocated array always gets a new id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferArrayId(pub usize);

/// Aggregated storage shared by many draw items.
///
/// Every item holding a range into the same array shares the same resources, so
/// items whose ranges all point to the same arrays can be drawn together.
#[derive(Debug)]
pub struct BufferArray {
    id: BufferArrayId,
    resources: Vec<BufferResource>,
}

impl BufferArray {
    pub fn new(resources: Vec<BufferResource>) -> Arc<Self> {
        Arc::new(Self {
            id: BufferArrayId(NEXT_ARRAY_ID.fetch_add(1, Ordering::Relaxed)),
            resources,
        })
    }

    pub fn id(&self) -> BufferArrayId {
        self.id
    }

    pub fn resources(&self) -> &[BufferResource] {
        &self.resources
    }

    pub fn resource(&self, name: &str) -> Option<&BufferResource> {
        self.resources.iter().find(|r| r.name == name)
    }
}

/// A contiguous run of elements owned by one draw item inside a [`BufferArray`].
#[derive(Debug, Clone)]
pub struct BufferArrayRange {
    array: Arc<BufferArray>,
    element_offset: u32,
    num_elements: u32,
}

impl BufferArrayRange {
    pub fn new(array: Arc<BufferArray>, element_offset: u32, num_elements: u32) -> Self {
        Self {
            array,
            element_offset,
            num_elements,
        }
    }

    pub fn array(&self) -> &Arc<BufferArray> {
        &self.array
    }

    pub fn element_offset(&self) -> u32 {
        self.element_offset
    }

    pub fn num_elements(&self) -> u32 {
        self.num_elements
    }

    pub fn resource(&self, name: &str) -> Option<&BufferResource> {
        self.array.resource(name)
    }

    /// Two ranges are aggregated when they live in the same buffer array.
    pub fn is_aggregated_with(&self, other: &Self) -> bool {
        self.array.id == other.array.id
    }
}

/// Per-item record read by the culling pass from the constant buffer array.
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct CullData {
    /// Local to world transform of the item.
    pub transform: Mat4,
    /// Local space bounding box minimum. `w` is ignored.
    pub bbox_min: Vec4,
    /// Local space bounding box maximum. `w` is ignored.
    pub bbox_max: Vec4,
}

impl CullData {
    pub fn new(transform: Mat4, bbox_min: Vec3, bbox_max: Vec3) -> Self {
        Self {
            transform,
            bbox_min: bbox_min.extend(1.0),
            bbox_max: bbox_max.extend(1.0),
        }
    }

    /// A box that never gets culled.
    pub fn empty(transform: Mat4) -> Self {
        Self::new(transform, Vec3::splat(f32::MAX), Vec3::splat(f32::MIN))
    }
}
