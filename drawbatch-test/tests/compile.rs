use drawbatch::{
    batch::{DRAWING_COORD_I_VIEW, DRAW_DISPATCH_VIEW},
    device::DeviceCapabilities,
    layout::DrawCommandLayout,
    BatchOptions,
};
use drawbatch_test::{ItemDesc, SceneBuilder, TestRunner};
use drawbatch_types::{GeometricShader, PrimitiveType};
use glam::Mat4;

#[test]
pub fn two_non_indexed_items() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = SceneBuilder::new(&runner)
        .item(ItemDesc::non_indexed(4))
        .item(ItemDesc::non_indexed(6))
        .build();
    let mut batch = scene.batch(BatchOptions::default());
    batch.compile(&runner.registry);

    assert_eq!(batch.num_total_vertices(), 10);
    assert_eq!(batch.num_visible_items(), 2);
    assert!(!batch.has_nothing_to_draw());
    assert!(!batch.use_draw_indexed());

    let first = batch.record(0).expect("record 0");
    let second = batch.record(1).expect("record 1");
    assert_eq!((first.count(), first.instance_count(), first.base_instance()), (4, 1, 0));
    assert_eq!((second.count(), second.instance_count(), second.base_instance()), (6, 1, 1));
    assert_eq!(first.base_vertex(), 0);
    assert_eq!(second.base_vertex(), 4);
    assert!(batch.record(2).is_none());

    Ok(())
}

#[test]
pub fn records_follow_item_order() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let counts = [3_u32, 1, 4, 1, 5];
    let scene = counts
        .iter()
        .fold(SceneBuilder::new(&runner), |builder, &primitives| {
            builder.item(ItemDesc::indexed(8, primitives))
        })
        .build();
    let mut batch = scene.batch(BatchOptions::default());
    batch.compile(&runner.registry);

    assert!(batch.use_draw_indexed());
    assert_eq!(batch.num_total_elements(), counts.iter().sum::<u32>() as usize);

    let mut primitive_offset = 0;
    for (index, &primitives) in counts.iter().enumerate() {
        let record = batch.record(index).expect("record");
        let coord = record.drawing_coord();
        assert_eq!(record.count(), primitives * 3);
        assert_eq!(record.base_index(), Some(primitive_offset * 3));
        assert_eq!(record.base_vertex(), index as u32 * 8);
        assert_eq!(record.base_instance(), index as u32);
        assert_eq!(coord.constant, index as u32);
        assert_eq!(coord.primitive, primitive_offset);
        assert_eq!(coord.vertex, index as u32 * 8);
        assert_eq!(scene.instances[index].batch_index(), index);
        assert_eq!(scene.instances[index].batch(), Some(batch.id()));
        primitive_offset += primitives;
    }

    Ok(())
}

#[test]
pub fn hidden_items_have_no_instances() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = SceneBuilder::new(&runner)
        .item(ItemDesc::non_indexed(3).with_instances(vec![Mat4::IDENTITY; 3]).hidden())
        .item(ItemDesc::non_indexed(3).with_instances(vec![Mat4::IDENTITY; 2]))
        .build();
    let mut batch = scene.batch(BatchOptions::default());
    batch.compile(&runner.registry);

    let hidden = batch.record(0).expect("record 0");
    assert_eq!(hidden.instance_count(), 0);
    assert_eq!(hidden.cull_instance_count(), 0);
    assert_eq!(batch.record(1).expect("record 1").instance_count(), 2);
    assert_eq!(batch.num_visible_items(), 2);

    Ok(())
}

#[test]
pub fn items_without_vertices_draw_nothing() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = SceneBuilder::new(&runner).item(ItemDesc::indexed(0, 4)).build();
    let mut batch = scene.batch(BatchOptions::default());
    batch.compile(&runner.registry);

    let record = batch.record(0).expect("record 0");
    assert_eq!(record.count(), 0);
    assert_eq!(batch.num_total_elements(), 0);
    assert!(batch.has_nothing_to_draw());

    Ok(())
}

#[test]
pub fn cull_input_matches_dispatch_after_compile() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = SceneBuilder::new(&runner)
        .item(ItemDesc::indexed(4, 2).with_instances(vec![Mat4::IDENTITY; 2]))
        .item(ItemDesc::indexed(4, 2).with_instances(vec![Mat4::IDENTITY; 1]))
        .build();
    let mut batch = scene.batch(BatchOptions::default());
    batch.compile(&runner.registry);

    let dispatch = runner.words(batch.dispatch_buffer().expect("dispatch buffer").handle());
    let cull_input = runner.words(batch.cull_input_buffer().expect("cull input").handle());
    assert_eq!(dispatch, cull_input);
    assert_eq!(dispatch, batch.draw_command_buffer());
    assert!(!batch.is_draw_command_buffer_dirty());

    Ok(())
}

#[test]
pub fn dispatch_buffer_views() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let plain = SceneBuilder::new(&runner).item(ItemDesc::non_indexed(3)).build();
    let mut batch = plain.batch(BatchOptions::default());
    batch.compile(&runner.registry);
    let dispatch = batch.dispatch_buffer().expect("dispatch buffer");
    assert_eq!(dispatch.resource_views().len(), 4);
    assert_eq!(dispatch.resource_view(DRAW_DISPATCH_VIEW).map(|v| v.byte_offset), Some(0));
    assert!(dispatch.resource_view(DRAWING_COORD_I_VIEW).is_none());

    let instanced = SceneBuilder::new(&runner)
        .item(ItemDesc::non_indexed(3).with_instances(vec![Mat4::IDENTITY]))
        .build();
    let mut batch = instanced.batch(BatchOptions::default());
    batch.compile(&runner.registry);
    let layout = *batch.layout().expect("layout");
    let dispatch = batch.dispatch_buffer().expect("dispatch buffer");
    assert_eq!(
        dispatch.resource_view(DRAWING_COORD_I_VIEW).map(|v| v.byte_offset),
        Some(layout.drawing_coord_i_offset)
    );
    assert_eq!(dispatch.stride_bytes(), layout.stride_bytes());

    Ok(())
}

#[test]
pub fn layouts_are_deterministic() -> anyhow::Result<()> {
    for levels in 0..4 {
        for indexed in [false, true] {
            for instance_culling in [false, true] {
                for alignment in [0, 8] {
                    let a = DrawCommandLayout::new(levels, indexed, instance_culling, alignment);
                    let b = DrawCommandLayout::new(levels, indexed, instance_culling, alignment);
                    assert_eq!(a, b);
                    if alignment > 0 {
                        assert_eq!(a.num_uint32 % alignment, 0);
                    }
                    assert!(a.drawing_coord_i_offset / 4 + levels <= a.num_uint32);
                }
            }
        }
    }

    Ok(())
}

#[test]
pub fn tessellated_patches() -> anyhow::Result<()> {
    let runner = TestRunner::builder().capabilities(DeviceCapabilities::all()).build();
    let scene = SceneBuilder::new(&runner)
        .geometric_shader(GeometricShader::new(
            PrimitiveType::Patches { control_points: 3 },
            true,
            7,
        ))
        .item(ItemDesc::indexed(6, 2))
        .item(ItemDesc::indexed(6, 3))
        .build();
    let mut batch = scene.batch(BatchOptions::default());
    batch.compile(&runner.registry);

    let layout = *batch.layout().expect("layout");
    assert!(layout.patch_encoding);
    assert_eq!(layout.num_uint32 % 8, 0);

    let second = batch.record(1).expect("record 1");
    assert_eq!(second.count(), 3);
    assert_eq!(second.base_index(), Some(2));
    assert_eq!(second.base_instance(), 1);
    assert_eq!(second.base_vertex(), 6);

    // five patches in the index buffer, six half floats each
    let tess_factors = batch.tess_factors_buffer().expect("tess factors");
    assert_eq!(tess_factors.size(), 5 * 6 * 2);

    Ok(())
}
