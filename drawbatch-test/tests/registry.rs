use drawbatch::BatchOptions;
use drawbatch_test::{ItemDesc, SceneBuilder, TestRunner};

#[test]
pub fn garbage_collection_keeps_held_entries() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = SceneBuilder::new(&runner).item(ItemDesc::non_indexed(3)).build();
    let mut batch = scene.batch(BatchOptions::default());
    runner.render(&mut batch);

    // culling program and pipeline, drawing program, draw pipeline
    assert_eq!(runner.registry.registered_count(), 4);

    runner.registry.garbage_collect();
    assert_eq!(runner.registry.registered_count(), 4);

    // the draw pipeline is looked up per frame and not held by the batch
    runner.registry.garbage_collect();
    assert_eq!(runner.registry.registered_count(), 3);

    runner.render(&mut batch);
    assert_eq!(runner.registry.registered_count(), 4);

    drop(batch);
    runner.registry.garbage_collect();
    runner.registry.garbage_collect();
    assert_eq!(runner.registry.registered_count(), 0);

    Ok(())
}

#[test]
pub fn released_dispatch_buffers_are_destroyed() -> anyhow::Result<()> {
    let runner = TestRunner::new();
    let scene = SceneBuilder::new(&runner).item(ItemDesc::non_indexed(3)).build();
    let live = runner.device.live_buffer_count();

    let mut batch = scene.batch(BatchOptions::default());
    batch.compile(&runner.registry);
    assert_eq!(runner.device.live_buffer_count(), live + 2);

    // recompiling replaces both dispatch buffers
    batch.compile(&runner.registry);
    assert_eq!(runner.device.live_buffer_count(), live + 2);

    drop(batch);
    assert_eq!(runner.device.live_buffer_count(), live);

    Ok(())
}
