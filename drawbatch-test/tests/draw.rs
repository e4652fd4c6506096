use std::sync::Arc;

use drawbatch::{
    device::{DeviceCapabilities, GraphicsCmd, GraphicsCmds, VertexStep},
    BatchOptions,
};
use drawbatch_test::{ItemDesc, SceneBuilder, TestRunner, TestShaderService};
use drawbatch_types::{ElementFormat, GeometricShader, PipelineHandle, PrimitiveType};
use glam::{Mat4, Vec3};

fn bound_pipelines(cmds: &GraphicsCmds) -> Vec<PipelineHandle> {
    cmds.commands()
        .iter()
        .filter_map(|cmd| match cmd {
            GraphicsCmd::BindPipeline(pipeline) => Some(*pipeline),
            _ => None,
        })
        .collect()
}

fn far_away() -> Mat4 {
    Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0))
}

#[test]
pub fn indirect_non_indexed_draws() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = SceneBuilder::new(&runner)
        .item(ItemDesc::non_indexed(4))
        .item(ItemDesc::non_indexed(6))
        .build();
    let mut batch = scene.batch(BatchOptions::default());
    let cmds = runner.render(&mut batch);

    assert!(cmds
        .commands()
        .iter()
        .any(|cmd| matches!(cmd, GraphicsCmd::DrawIndirect { draw_count: 2, .. })));

    let draws = runner.resolve(&cmds)?;
    assert_eq!(draws.len(), 2);
    assert_eq!((draws[0].count, draws[0].base_vertex, draws[0].base_instance), (4, 0, 0));
    assert_eq!((draws[1].count, draws[1].base_vertex, draws[1].base_instance), (6, 4, 1));
    assert!(draws.iter().all(|draw| !draw.indexed && draw.instance_count == 1));

    Ok(())
}

#[test]
pub fn indirect_indexed_draws_skip_culled_items() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = SceneBuilder::new(&runner)
        .item(ItemDesc::indexed(4, 2).with_unit_bounds(Mat4::IDENTITY))
        .item(ItemDesc::indexed(4, 3).with_unit_bounds(far_away()))
        .item(ItemDesc::indexed(4, 1).with_unit_bounds(Mat4::IDENTITY))
        .build();
    let mut batch = scene.batch(BatchOptions::default());
    let draws = runner.resolve(&runner.render(&mut batch))?;

    assert_eq!(draws.len(), 2);
    assert!(draws.iter().all(|draw| draw.indexed));
    assert_eq!((draws[0].count, draws[0].first_index, draws[0].base_vertex), (6, 0, 0));
    assert_eq!((draws[1].count, draws[1].first_index, draws[1].base_vertex), (3, 15, 8));
    assert_eq!(draws[1].base_instance, 2);

    Ok(())
}

#[test]
pub fn immediate_draws_read_unculled_records() -> anyhow::Result<()> {
    let runner = TestRunner::builder()
        .capabilities(DeviceCapabilities::all().difference(DeviceCapabilities::MULTI_DRAW_INDIRECT))
        .build();
    let scene = SceneBuilder::new(&runner)
        .item(ItemDesc::indexed(4, 2).with_unit_bounds(far_away()))
        .item(ItemDesc::indexed(4, 2).hidden())
        .item(ItemDesc::indexed(4, 1))
        .build();
    let mut batch = scene.batch(BatchOptions::default());
    let cmds = runner.render(&mut batch);

    assert!(!cmds
        .commands()
        .iter()
        .any(|cmd| matches!(cmd, GraphicsCmd::DrawIndexedIndirect { .. })));
    // culling results live only in the dispatch buffer; hidden items are skipped
    let draws = runner.resolve(&cmds)?;
    assert_eq!(draws.len(), 2);
    assert_eq!((draws[0].count, draws[0].first_index, draws[0].base_instance), (6, 0, 0));
    assert_eq!((draws[1].count, draws[1].first_index, draws[1].base_instance), (3, 12, 2));
    assert_eq!(runner.dispatched_instance_counts(&batch), vec![0, 0, 1]);

    Ok(())
}

#[test]
pub fn pipeline_vertex_layout() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = SceneBuilder::new(&runner)
        .item(ItemDesc::non_indexed(3).with_instances(vec![Mat4::IDENTITY; 2]))
        .item(ItemDesc::non_indexed(3).with_instances(vec![Mat4::IDENTITY; 2]))
        .build();
    let mut batch = scene.batch(BatchOptions::default());
    let cmds = runner.render(&mut batch);
    let layout = *batch.layout().expect("layout");

    let pipeline = cmds.bound_pipeline().expect("a bound pipeline");
    let desc = runner.device.graphics_pipeline_desc(pipeline).expect("graphics pipeline");
    assert!(desc.rasterizer_enabled);
    assert_eq!(desc.primitive, PrimitiveType::Triangles);
    assert_eq!(desc.vertex_buffers.len(), 2);

    let draw_commands = &desc.vertex_buffers[0];
    assert_eq!(draw_commands.step, VertexStep::PerDrawCommand);
    assert_eq!(draw_commands.stride, layout.stride_bytes() as u64);
    let locations: Vec<_> = draw_commands.attributes.iter().map(|a| a.location).collect();
    assert_eq!(locations, vec![0, 1, 2, 3]);
    assert_eq!(draw_commands.attributes[3].offset, layout.drawing_coord_i_offset as u64);

    let points = &desc.vertex_buffers[1];
    assert_eq!(points.step, VertexStep::PerVertex);
    assert_eq!(points.stride, 12);
    assert_eq!(points.attributes[0].format, ElementFormat::Float32x3);
    assert_eq!(points.attributes[0].location, 6);

    Ok(())
}

#[test]
pub fn batches_share_pipelines() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let first_scene = SceneBuilder::new(&runner).item(ItemDesc::non_indexed(3)).build();
    let second_scene = SceneBuilder::new(&runner).item(ItemDesc::non_indexed(6)).build();
    let mut first = first_scene.batch(BatchOptions::default());
    let mut second = second_scene.batch(BatchOptions::default());

    first.prepare_draw(&runner.pass, &runner.registry);
    second.prepare_draw(&runner.pass, &runner.registry);
    let mut cmds = GraphicsCmds::new();
    first.execute_draw(&mut cmds, &runner.pass, &runner.registry, true);
    second.execute_draw(&mut cmds, &runner.pass, &runner.registry, false);

    assert_eq!(bound_pipelines(&cmds).len(), 1);
    // one culling program and one drawing program
    assert_eq!(runner.device.program_count(), 2);

    let draws = runner.resolve(&cmds)?;
    assert_eq!(draws.iter().map(|draw| draw.count).collect::<Vec<_>>(), vec![3, 6]);

    Ok(())
}

#[test]
pub fn pipelines_follow_record_layout() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let instanced = || {
        SceneBuilder::new(&runner)
            .item(ItemDesc::indexed(4, 2).with_instances(vec![Mat4::IDENTITY; 2]))
            .build()
    };
    let culled_scene = instanced();
    let plain_scene = instanced();
    let mut culled = culled_scene.batch(BatchOptions::default());
    let mut plain = plain_scene.batch(BatchOptions {
        enable_gpu_instance_culling: false,
        ..Default::default()
    });
    let culled_cmds = runner.render(&mut culled);
    let plain_cmds = runner.render(&mut plain);

    assert!(culled.use_instance_culling());
    assert!(!plain.use_instance_culling());
    let culled_layout = *culled.layout().expect("layout");
    let plain_layout = *plain.layout().expect("layout");
    assert_ne!(culled_layout.stride_bytes(), plain_layout.stride_bytes());

    let culled_pipeline = culled_cmds.bound_pipeline().expect("a bound pipeline");
    let plain_pipeline = plain_cmds.bound_pipeline().expect("a bound pipeline");
    assert_ne!(culled_pipeline, plain_pipeline);
    for (pipeline, layout) in [(culled_pipeline, culled_layout), (plain_pipeline, plain_layout)] {
        let desc = runner.device.graphics_pipeline_desc(pipeline).expect("graphics pipeline");
        assert_eq!(desc.vertex_buffers[0].stride, layout.stride_bytes() as u64);
        assert_eq!(
            desc.vertex_buffers[0].attributes[3].offset,
            layout.drawing_coord_i_offset as u64
        );
    }

    // only instance culled draws read the culled indices
    let instance_indices = |scene: &drawbatch_test::Scene, name: &str| {
        let array = scene.instance_index_array.as_ref().expect("instanced scene");
        array.resource(name).expect("instance indices").buffer
    };
    let bound_at = |cmds: &GraphicsCmds, slot: u32| {
        cmds.commands().iter().find_map(|cmd| match cmd {
            GraphicsCmd::BindResources(bindings) => bindings.get(slot),
            _ => None,
        })
    };
    assert_eq!(
        bound_at(&culled_cmds, 2),
        Some(instance_indices(&culled_scene, "culledInstanceIndices"))
    );
    assert_eq!(
        bound_at(&plain_cmds, 2),
        Some(instance_indices(&plain_scene, "instanceIndices"))
    );

    let draws = runner.resolve(&plain_cmds)?;
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].instance_count, 2);

    Ok(())
}

#[test]
pub fn failed_composition_skips_the_batch() -> anyhow::Result<()> {
    let service = Arc::new(TestShaderService::default());
    service.set_failing(true);
    let runner = TestRunner::builder().shader_service(service.clone()).build();
    let scene = SceneBuilder::new(&runner).item(ItemDesc::non_indexed(3)).build();
    let mut batch = scene.batch(BatchOptions::default());

    let cmds = runner.render(&mut batch);
    assert!(cmds.commands().is_empty());
    assert_eq!(runner.registry.perf_counters().snapshot().draw_calls, 0);

    // failures are not cached; the next frame retries
    service.set_failing(false);
    let draws = runner.resolve(&runner.render(&mut batch))?;
    assert_eq!(draws.len(), 1);
    assert_eq!(service.composed(), 1);

    Ok(())
}

#[test]
pub fn draw_counters() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = SceneBuilder::new(&runner)
        .item(ItemDesc::non_indexed(3).with_instances(vec![Mat4::IDENTITY; 3]))
        .item(ItemDesc::non_indexed(3).with_instances(vec![Mat4::IDENTITY; 4]))
        .build();
    let mut batch = scene.batch(BatchOptions::default());
    runner.render(&mut batch);
    runner.render(&mut batch);

    let counters = runner.registry.perf_counters().snapshot();
    assert_eq!(counters.draw_calls, 2);
    assert_eq!(counters.items_drawn, 14);
    assert_eq!(counters.culling_passes, 2);
    // the primary dispatch buffer and the cull input
    assert_eq!(counters.dispatch_buffers_registered, 2);

    runner.registry.perf_counters().reset();
    assert_eq!(runner.registry.perf_counters().snapshot().draw_calls, 0);

    Ok(())
}

fn tessellated_scene(runner: &TestRunner) -> drawbatch_test::Scene {
    SceneBuilder::new(runner)
        .geometric_shader(GeometricShader::new(
            PrimitiveType::Patches { control_points: 3 },
            true,
            11,
        ))
        .item(ItemDesc::indexed(6, 2))
        .item(ItemDesc::indexed(6, 1))
        .build()
}

#[test]
pub fn tessellation_runs_ptcs_first() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = tessellated_scene(&runner);
    let mut batch = scene.batch(BatchOptions::default());
    let cmds = runner.render(&mut batch);

    let pipelines = bound_pipelines(&cmds);
    assert_eq!(pipelines.len(), 2);
    let ptcs = runner.device.graphics_pipeline_desc(pipelines[0]).expect("ptcs pipeline");
    let draw = runner.device.graphics_pipeline_desc(pipelines[1]).expect("draw pipeline");
    assert!(!ptcs.rasterizer_enabled);
    assert!(ptcs.fragment_entry.is_none());
    assert_eq!(ptcs.vertex_entry.as_str(), "vs_ptcs");
    assert!(!ptcs.depth_write);
    assert!(draw.rasterizer_enabled);
    assert_eq!(draw.vertex_entry.as_str(), "vs_main");

    let barrier = cmds
        .commands()
        .iter()
        .position(|cmd| matches!(cmd, GraphicsCmd::MemoryBarrier))
        .expect("barrier between ptcs and draw");
    let draw_bind = cmds
        .commands()
        .iter()
        .position(|cmd| *cmd == GraphicsCmd::BindPipeline(pipelines[1]))
        .expect("draw pipeline bind");
    assert!(barrier < draw_bind);

    let tess_factors = batch.tess_factors_buffer().expect("tess factors").handle();
    assert!(cmds.commands().iter().any(|cmd| match cmd {
        GraphicsCmd::BindResources(bindings) => bindings.get(4) == Some(tess_factors),
        _ => false,
    }));

    // patch draws read baseVertex from the drawing coordinate
    let draws = runner.resolve(&cmds)?;
    assert_eq!(draws.len(), 4);
    for pass in draws.chunks(2) {
        assert_eq!((pass[0].count, pass[0].first_index, pass[0].base_vertex), (2, 0, 0));
        assert_eq!((pass[1].count, pass[1].first_index, pass[1].base_vertex), (1, 2, 6));
    }

    Ok(())
}

#[test]
pub fn patches_without_tessellation_support_draw_nothing() -> anyhow::Result<()> {
    let runner = TestRunner::builder()
        .capabilities(DeviceCapabilities::all().difference(DeviceCapabilities::HARDWARE_TESSELLATION))
        .build();
    let scene = tessellated_scene(&runner);
    let mut batch = scene.batch(BatchOptions::default());
    let cmds = runner.render(&mut batch);

    assert!(bound_pipelines(&cmds).is_empty());
    assert!(runner.resolve(&cmds)?.is_empty());
    assert_eq!(runner.registry.perf_counters().snapshot().draw_calls, 0);

    Ok(())
}
