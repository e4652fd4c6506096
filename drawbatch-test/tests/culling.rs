use drawbatch::{device::DeviceCapabilities, BatchOptions};
use drawbatch_test::{ItemDesc, Scene, SceneBuilder, TestRunner};
use glam::{Mat4, Vec2, Vec3};

fn counting() -> BatchOptions {
    BatchOptions {
        enable_visible_instance_counting: true,
        ..Default::default()
    }
}

/// Three instanced items with 2, 0 and 5 instances. The first sits outside
/// the frustum.
fn instanced_scene(runner: &TestRunner) -> Scene {
    let far_away = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
    SceneBuilder::new(runner)
        .item(
            ItemDesc::indexed(4, 2)
                .with_unit_bounds(far_away)
                .with_instances(vec![Mat4::IDENTITY; 2]),
        )
        .item(
            ItemDesc::indexed(4, 2)
                .with_unit_bounds(Mat4::IDENTITY)
                .with_instances(Vec::new()),
        )
        .item(
            ItemDesc::indexed(4, 2)
                .with_unit_bounds(Mat4::IDENTITY)
                .with_instances(vec![Mat4::IDENTITY; 5]),
        )
        .build()
}

#[test]
pub fn culls_instances_outside_frustum() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = instanced_scene(&runner);
    let mut batch = scene.batch(counting());
    batch.prepare_draw(&runner.pass, &runner.registry);

    assert!(batch.use_instance_culling());
    assert_eq!(runner.dispatched_instance_counts(&batch), vec![0, 0, 5]);
    assert_eq!(batch.num_visible_items(), 5);

    // the cull input keeps the unculled counts for the next pass
    let cull_input = runner.words(batch.cull_input_buffer().expect("cull input").handle());
    assert_eq!(cull_input, batch.draw_command_buffer());
    assert_eq!(batch.record(0).expect("record 0").instance_count(), 2);

    assert_eq!(runner.registry.perf_counters().snapshot().culling_passes, 1);

    Ok(())
}

#[test]
pub fn two_round_culling_matches_single_round() -> anyhow::Result<()> {
    let single = TestRunner::new();
    let single_scene = instanced_scene(&single);
    let mut single_batch = single_scene.batch(counting());
    single_batch.prepare_draw(&single.pass, &single.registry);

    let two_round = TestRunner::builder()
        .capabilities(DeviceCapabilities::all().difference(DeviceCapabilities::SINGLE_PASS_CULLING))
        .build();
    let two_round_scene = instanced_scene(&two_round);
    let mut two_round_batch = two_round_scene.batch(counting());
    two_round_batch.prepare_draw(&two_round.pass, &two_round.registry);

    assert_eq!(
        single.dispatched_instance_counts(&single_batch),
        two_round.dispatched_instance_counts(&two_round_batch)
    );
    assert_eq!(single_batch.num_visible_items(), two_round_batch.num_visible_items());

    let culled_indices = |runner: &TestRunner, scene: &Scene| {
        let array = scene.instance_index_array.as_ref().expect("instanced scene");
        let culled = array.resource("culledInstanceIndices").expect("culled indices");
        runner.words(culled.buffer)
    };
    assert_eq!(
        culled_indices(&single, &single_scene),
        culled_indices(&two_round, &two_round_scene)
    );

    Ok(())
}

#[test]
pub fn culls_whole_items() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = SceneBuilder::new(&runner)
        .item(ItemDesc::non_indexed(3).with_unit_bounds(Mat4::IDENTITY))
        .item(ItemDesc::non_indexed(3).with_unit_bounds(Mat4::from_translation(Vec3::new(0.0, -10.0, 0.0))))
        .item(ItemDesc::non_indexed(3))
        .build();
    let mut batch = scene.batch(BatchOptions::default());
    batch.prepare_draw(&runner.pass, &runner.registry);

    // empty bounds are never culled
    assert_eq!(runner.dispatched_instance_counts(&batch), vec![1, 0, 1]);
    // not counted, so this is still the compiled count
    assert_eq!(batch.num_visible_items(), 3);

    Ok(())
}

#[test]
pub fn instancing_without_instance_culling_is_not_culled() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = instanced_scene(&runner);
    let mut batch = scene.batch(BatchOptions {
        enable_gpu_instance_culling: false,
        ..counting()
    });
    batch.prepare_draw(&runner.pass, &runner.registry);

    assert!(!batch.use_instance_culling());
    assert_eq!(runner.device.compute_submissions(), 0);
    assert_eq!(runner.dispatched_instance_counts(&batch), vec![2, 0, 5]);
    assert_eq!(batch.num_visible_items(), 7);

    Ok(())
}

#[test]
pub fn culled_indices_start_as_every_instance() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = instanced_scene(&runner);
    let array = scene.instance_index_array.as_ref().expect("instanced scene");
    let words = |name: &str| runner.words(array.resource(name).expect("instance indices").buffer);
    assert_eq!(words("culledInstanceIndices"), vec![0, 0, 1, 1, 2, 0, 3, 1, 4, 2, 5, 3, 6, 4]);

    let mut batch = scene.batch(BatchOptions {
        enable_gpu_instance_culling: false,
        ..counting()
    });
    batch.prepare_draw(&runner.pass, &runner.registry);
    assert_eq!(words("culledInstanceIndices"), words("instanceIndices"));

    Ok(())
}

#[test]
pub fn frozen_culling_runs_only_after_changes() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = instanced_scene(&runner);
    let mut batch = scene.batch(BatchOptions {
        freeze_culling: true,
        ..counting()
    });
    batch.prepare_draw(&runner.pass, &runner.registry);
    assert_eq!(runner.device.compute_submissions(), 0);

    scene.instances[2].set_visible(false);
    batch.draw_item_instance_changed(&scene.instances[2]);
    batch.prepare_draw(&runner.pass, &runner.registry);
    assert_eq!(runner.device.compute_submissions(), 1);
    assert_eq!(runner.dispatched_instance_counts(&batch), vec![0, 0, 0]);

    batch.prepare_draw(&runner.pass, &runner.registry);
    assert_eq!(runner.device.compute_submissions(), 1);

    Ok(())
}

#[test]
pub fn stalled_read_back_counts_nothing() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = instanced_scene(&runner);
    let mut batch = scene.batch(BatchOptions {
        visible_count_timeout_ms: 10,
        ..counting()
    });
    runner.device.set_fence_stalled(true);
    batch.prepare_draw(&runner.pass, &runner.registry);

    assert_eq!(batch.num_visible_items(), 0);
    // the culling itself still went through
    assert_eq!(runner.dispatched_instance_counts(&batch), vec![0, 0, 5]);

    Ok(())
}

#[test]
pub fn tiny_prim_culling_toggles_pipeline() -> anyhow::Result<()> {
    let mut runner = TestRunner::new();
    runner.pass.drawing_range_ndc = Vec2::new(0.1, -1.0);
    let tiny = Mat4::from_scale(Vec3::new(0.01, 0.01, 1.0));
    let scene = SceneBuilder::new(&runner)
        .item(ItemDesc::non_indexed(3).with_unit_bounds(tiny))
        .item(ItemDesc::non_indexed(3).with_unit_bounds(Mat4::IDENTITY))
        .build();
    let mut batch = scene.batch(BatchOptions::default());

    batch.prepare_draw(&runner.pass, &runner.registry);
    assert_eq!(runner.dispatched_instance_counts(&batch), vec![1, 1]);
    let pipelines = runner.device.pipeline_count();

    batch.set_enable_tiny_prim_culling(true);
    batch.prepare_draw(&runner.pass, &runner.registry);
    assert_eq!(runner.dispatched_instance_counts(&batch), vec![0, 1]);
    assert_eq!(runner.device.pipeline_count(), pipelines + 1);

    Ok(())
}

#[test]
pub fn options_loaded_from_config() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = instanced_scene(&runner);
    let options: BatchOptions = serde_json::from_str(
        r#"{
            "enable_visible_instance_counting": true,
            "visible_count_timeout_ms": 100
        }"#,
    )?;
    let mut batch = scene.batch(options);
    batch.prepare_draw(&runner.pass, &runner.registry);

    assert!(batch.options().enable_gpu_instance_culling);
    assert_eq!(batch.num_visible_items(), 5);

    Ok(())
}
