use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use drawbatch::{
    device::{BufferDesc, GfxDevice},
    error::ProgramError,
    item::{DrawItem, DrawItemInstance, DrawItemRanges, DrawItemState, MaterialShader},
    layout::DrawCommandLayout,
    pass::RenderPassState,
    program::{DrawingProgramDesc, ResourceBinder, ShaderService},
    util::typedefs::SsoString,
    BatchOptions, DrawBatch,
};
use drawbatch_types::{
    BufferArray, BufferArrayRange, BufferHandle, BufferResource, BufferUsages, CullData, ElementFormat,
    GeometricShader, PrimitiveType,
};
use glam::{Mat4, Vec3};

use crate::TestRunner;

/// Composes a placeholder program whose binder names every resource the
/// scene builder creates.
#[derive(Debug, Default)]
pub struct TestShaderService {
    failing: AtomicBool,
    composed: AtomicUsize,
}

impl TestShaderService {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Number of programs composed so far.
    pub fn composed(&self) -> usize {
        self.composed.load(Ordering::Acquire)
    }

    /// Instance indices come from the culled copy when the records carry a
    /// cull sub-record.
    pub fn binder(layout: &DrawCommandLayout) -> ResourceBinder {
        let instance_indices = match layout.has_cull_record() {
            true => "culledInstanceIndices",
            false => "instanceIndices",
        };
        ResourceBinder::new()
            .with_binding("cullData", 0)
            .with_binding("indices", 1)
            .with_binding(instance_indices, 2)
            .with_binding("instanceTransform", 3)
            .with_binding("tessFactors", 4)
            .with_attribute("drawingCoord0", 0)
            .with_attribute("drawingCoord1", 1)
            .with_attribute("drawingCoord2", 2)
            .with_attribute("drawingCoordI", 3)
            .with_attribute("points", 6)
    }
}

impl ShaderService for TestShaderService {
    fn compose_drawing_program(
        &self,
        item: &DrawItemState,
        geometric_shader: &GeometricShader,
        layout: &DrawCommandLayout,
        _pass: &RenderPassState,
    ) -> Result<DrawingProgramDesc, ProgramError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(ProgramError::Composition(String::from("composition disabled by test")));
        }
        self.composed.fetch_add(1, Ordering::AcqRel);

        let material = item.material_shader.as_ref().map_or(0, |material| material.hash);
        Ok(DrawingProgramDesc {
            label: SsoString::from("test drawing program"),
            source: format!(
                "// geometric shader {:016x}\n// material {material:016x}\n// record {:?} stride {}\nfn vs_main() {{}}\nfn fs_main() {{}}\n",
                geometric_shader.hash(),
                layout.kind,
                layout.num_uint32,
            ),
            vertex_entry: SsoString::from("vs_main"),
            fragment_entry: Some(SsoString::from("fs_main")),
            ptcs_entry: geometric_shader
                .use_hardware_tessellation()
                .then(|| SsoString::from("vs_ptcs")),
            binder: Self::binder(layout),
        })
    }
}

/// One draw item to be laid out by [`SceneBuilder`].
#[derive(Debug, Clone)]
pub struct ItemDesc {
    pub vertex_count: u32,
    /// Indexed when set, in primitives.
    pub primitive_count: Option<u32>,
    pub cull_data: CullData,
    /// One instancer level with one transform per instance.
    pub instances: Option<Vec<Mat4>>,
    pub visible: bool,
}

impl ItemDesc {
    pub fn non_indexed(vertex_count: u32) -> Self {
        Self {
            vertex_count,
            primitive_count: None,
            cull_data: CullData::empty(Mat4::IDENTITY),
            instances: None,
            visible: true,
        }
    }

    pub fn indexed(vertex_count: u32, primitive_count: u32) -> Self {
        Self {
            primitive_count: Some(primitive_count),
            ..Self::non_indexed(vertex_count)
        }
    }

    /// Unit box around the origin, moved by `transform`.
    pub fn with_unit_bounds(mut self, transform: Mat4) -> Self {
        self.cull_data = CullData::new(transform, Vec3::new(-0.5, -0.5, 0.25), Vec3::new(0.5, 0.5, 0.75));
        self
    }

    pub fn with_instances(mut self, transforms: Vec<Mat4>) -> Self {
        self.instances = Some(transforms);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

/// Draw items sharing one set of buffer arrays.
pub struct Scene {
    pub instances: Vec<Arc<DrawItemInstance>>,
    pub constant_array: Arc<BufferArray>,
    pub vertex_array: Arc<BufferArray>,
    pub topology_array: Option<Arc<BufferArray>>,
    pub instance_index_array: Option<Arc<BufferArray>>,
    pub instance_transform_array: Option<Arc<BufferArray>>,
}

impl Scene {
    /// Batches every item, in order.
    pub fn batch(&self, options: BatchOptions) -> DrawBatch {
        let mut items = self.instances.iter().cloned();
        let first = items.next().expect("scene has no items");
        let mut batch = DrawBatch::new(first, options);
        for item in items {
            assert!(batch.append(item), "scene items must aggregate");
        }
        batch
    }

    /// Moves every item's vertex data into a freshly allocated array at the
    /// same offsets, as a buffer migration does.
    pub fn migrate_vertices(&mut self, runner: &TestRunner) {
        let size = self
            .vertex_array
            .resource("points")
            .and_then(|points| runner.device.buffer_size(points.buffer))
            .unwrap_or(4);
        let buffer = create_buffer(runner, "points", size, BufferUsages::VERTEX);
        let array = BufferArray::new(vec![BufferResource::new("points", buffer, ElementFormat::Float32x3)]);
        for instance in &self.instances {
            instance.draw_item().update(|state| {
                if let Some(vertex) = state.ranges.vertex.as_mut() {
                    *vertex = BufferArrayRange::new(Arc::clone(&array), vertex.element_offset(), vertex.num_elements());
                }
            });
        }
        self.vertex_array = array;
    }
}

fn create_buffer(runner: &TestRunner, label: &str, size: u64, usage: BufferUsages) -> BufferHandle {
    runner.device.create_buffer(&BufferDesc {
        label: SsoString::from(label),
        size: size.max(4),
        usage,
    })
}

fn upload(runner: &TestRunner, label: &str, data: &[u8], usage: BufferUsages) -> BufferHandle {
    let buffer = create_buffer(runner, label, data.len() as u64, usage);
    runner.device.write_buffer(buffer, 0, data);
    buffer
}

/// Lays out [`ItemDesc`]s back to back in shared buffer arrays.
pub struct SceneBuilder<'a> {
    runner: &'a TestRunner,
    geometric_shader: Arc<GeometricShader>,
    material: Option<Arc<MaterialShader>>,
    items: Vec<ItemDesc>,
}

impl<'a> SceneBuilder<'a> {
    pub fn new(runner: &'a TestRunner) -> Self {
        Self {
            runner,
            geometric_shader: Arc::new(GeometricShader::new(PrimitiveType::Triangles, false, 1)),
            material: None,
            items: Vec::new(),
        }
    }

    pub fn geometric_shader(mut self, geometric_shader: GeometricShader) -> Self {
        self.geometric_shader = Arc::new(geometric_shader);
        self
    }

    pub fn material(mut self, hash: u64) -> Self {
        self.material = Some(Arc::new(MaterialShader { shader_data: None, hash }));
        self
    }

    pub fn item(mut self, item: ItemDesc) -> Self {
        self.items.push(item);
        self
    }

    pub fn build(self) -> Scene {
        let runner = self.runner;
        let index_size = self.geometric_shader.primitive_index_size();
        let index_format = match index_size {
            1 => ElementFormat::Uint32,
            2 => ElementFormat::Uint32x2,
            3 => ElementFormat::Uint32x3,
            _ => ElementFormat::Uint32x4,
        };

        let cull_data: Vec<CullData> = self.items.iter().map(|item| item.cull_data).collect();
        let constant_array = BufferArray::new(vec![BufferResource::new(
            "cullData",
            upload(runner, "cullData", bytemuck::cast_slice(&cull_data), BufferUsages::STORAGE),
            ElementFormat::CullData,
        )]);

        let total_vertices: u32 = self.items.iter().map(|item| item.vertex_count).sum();
        let vertex_array = BufferArray::new(vec![BufferResource::new(
            "points",
            create_buffer(runner, "points", total_vertices as u64 * 12, BufferUsages::VERTEX),
            ElementFormat::Float32x3,
        )]);

        let indexed = self.items.iter().any(|item| item.primitive_count.is_some());
        let topology_array = indexed.then(|| {
            let indices: Vec<u32> = self
                .items
                .iter()
                .flat_map(|item| {
                    let count = item.primitive_count.unwrap_or(0) * index_size;
                    (0..count).map(move |i| i % item.vertex_count.max(1))
                })
                .collect();
            BufferArray::new(vec![BufferResource::new(
                "indices",
                upload(runner, "indices", bytemuck::cast_slice(&indices), BufferUsages::INDEX),
                index_format,
            )])
        });

        let instanced = self.items.iter().any(|item| item.instances.is_some());
        let (instance_index_array, instance_transform_array) = match instanced {
            true => {
                let mut tuples = Vec::new();
                let mut transforms = Vec::new();
                for item in &self.items {
                    for (local, transform) in item.instances.iter().flatten().enumerate() {
                        tuples.extend([tuples.len() as u32 / 2, local as u32]);
                        transforms.push(*transform);
                    }
                }
                let indices = upload(runner, "instanceIndices", bytemuck::cast_slice(&tuples), BufferUsages::STORAGE);
                // seeded with every instance for batches that skip instance culling
                let culled = upload(
                    runner,
                    "culledInstanceIndices",
                    bytemuck::cast_slice(&tuples),
                    BufferUsages::STORAGE,
                );
                let transforms = upload(
                    runner,
                    "instanceTransform",
                    bytemuck::cast_slice(&transforms),
                    BufferUsages::STORAGE,
                );
                (
                    Some(BufferArray::new(vec![
                        BufferResource::new("instanceIndices", indices, ElementFormat::Uint32),
                        BufferResource::new("culledInstanceIndices", culled, ElementFormat::Uint32),
                    ])),
                    Some(BufferArray::new(vec![BufferResource::new(
                        "instanceTransform",
                        transforms,
                        ElementFormat::Float32x4x4,
                    )])),
                )
            }
            false => (None, None),
        };

        let mut vertex_offset = 0;
        let mut primitive_offset = 0;
        let mut instance_offset = 0;
        let mut instances = Vec::with_capacity(self.items.len());
        for (index, item) in self.items.iter().enumerate() {
            let instance_count = item.instances.as_ref().map_or(0, Vec::len) as u32;
            let mut ranges = DrawItemRanges {
                constant: Some(BufferArrayRange::new(Arc::clone(&constant_array), index as u32, 1)),
                vertex: Some(BufferArrayRange::new(Arc::clone(&vertex_array), vertex_offset, item.vertex_count)),
                topology: topology_array.as_ref().map(|array| {
                    BufferArrayRange::new(Arc::clone(array), primitive_offset, item.primitive_count.unwrap_or(0))
                }),
                instance_index: instance_index_array.as_ref().map(|array| {
                    // two words per instance: global id, level 0 index
                    BufferArrayRange::new(Arc::clone(array), instance_offset * 2, instance_count * 2)
                }),
                ..Default::default()
            };
            if let Some(array) = &instance_transform_array {
                ranges.instance_primvars.push(Some(BufferArrayRange::new(
                    Arc::clone(array),
                    instance_offset,
                    instance_count,
                )));
            }

            let draw_item = DrawItem::new(DrawItemState {
                ranges,
                geometric_shader: Some(Arc::clone(&self.geometric_shader)),
                material_shader: self.material.clone(),
            });
            let instance = DrawItemInstance::new(draw_item);
            instance.set_visible(item.visible);
            instances.push(instance);

            vertex_offset += item.vertex_count;
            primitive_offset += item.primitive_count.unwrap_or(0);
            instance_offset += instance_count;
        }

        Scene {
            instances,
            constant_array,
            vertex_array,
            topology_array,
            instance_index_array,
            instance_transform_array,
        }
    }
}
