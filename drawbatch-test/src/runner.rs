use std::sync::Arc;

use drawbatch::{
    device::{DeviceCapabilities, GfxDevice, GraphicsCmds, HeadlessDevice, ResolvedDraw},
    pass::RenderPassState,
    program::ShaderService,
    DrawBatch, ResourceRegistry,
};
use drawbatch_types::BufferHandle;
use glam::Mat4;

use crate::TestShaderService;

#[derive(Default)]
pub struct TestRunnerBuilder {
    capabilities: Option<DeviceCapabilities>,
    shader_service: Option<Arc<dyn ShaderService>>,
    cull_matrix: Option<Mat4>,
}

impl TestRunnerBuilder {
    pub fn capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn shader_service(mut self, shader_service: Arc<dyn ShaderService>) -> Self {
        self.shader_service = Some(shader_service);
        self
    }

    pub fn cull_matrix(mut self, cull_matrix: Mat4) -> Self {
        self.cull_matrix = Some(cull_matrix);
        self
    }

    pub fn build(self) -> TestRunner {
        let _ = env_logger::builder().is_test(true).try_init();

        let device = Arc::new(HeadlessDevice::new(self.capabilities.unwrap_or(DeviceCapabilities::all())));
        let shader_service = self
            .shader_service
            .unwrap_or_else(|| Arc::new(TestShaderService::default()));
        let registry = ResourceRegistry::new(Arc::clone(&device) as Arc<dyn GfxDevice>, shader_service);

        TestRunner {
            device,
            registry,
            pass: RenderPassState::new(self.cull_matrix.unwrap_or(Mat4::IDENTITY)),
        }
    }
}

/// A headless device with a registry and one render pass.
pub struct TestRunner {
    pub device: Arc<HeadlessDevice>,
    pub registry: ResourceRegistry,
    pub pass: RenderPassState,
}

impl TestRunner {
    pub fn builder() -> TestRunnerBuilder {
        TestRunnerBuilder::default()
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Prepares and draws `batch` as the first batch of a pass.
    pub fn render(&self, batch: &mut DrawBatch) -> GraphicsCmds {
        batch.prepare_draw(&self.pass, &self.registry);
        let mut cmds = GraphicsCmds::new();
        batch.execute_draw(&mut cmds, &self.pass, &self.registry, true);
        cmds
    }

    pub fn resolve(&self, cmds: &GraphicsCmds) -> anyhow::Result<Vec<ResolvedDraw>> {
        Ok(self.device.resolve_draws(cmds)?)
    }

    /// Words of a device buffer. Panics if the buffer does not exist.
    pub fn words(&self, buffer: BufferHandle) -> Vec<u32> {
        self.device.buffer_words(buffer).expect("buffer does not exist")
    }

    /// Instance counts of every record currently in the dispatch buffer.
    pub fn dispatched_instance_counts(&self, batch: &DrawBatch) -> Vec<u32> {
        let (Some(layout), Some(dispatch_buffer)) = (batch.layout(), batch.dispatch_buffer()) else {
            return Vec::new();
        };
        let words = self.words(dispatch_buffer.handle());
        (0..dispatch_buffer.count() as usize)
            .filter_map(|index| layout.record(&words, index))
            .map(|record| record.instance_count())
            .collect()
    }
}

impl Default for TestRunner {
    fn default() -> Self {
        Self::new()
    }
}
