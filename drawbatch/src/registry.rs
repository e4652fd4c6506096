//! Deduplicating factory for device objects shared between batches.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use drawbatch_types::{BufferUsages, ElementFormat, PipelineHandle};
use parking_lot::Mutex;

use crate::{
    buffer::{DispatchBuffer, GpuBuffer},
    culling::ShaderPreProcessor,
    device::{BufferDesc, GfxDevice},
    program::{ShaderProgram, ShaderService},
    util::typedefs::{FastHashMap, SsoString},
};

struct Cached<T> {
    inner: Arc<T>,
    epoch: usize,
}

/// Result of registering an object under a content hash.
#[derive(Debug)]
pub struct RegistryInstance<T> {
    value: Arc<T>,
    first_instance: bool,
}

impl<T> RegistryInstance<T> {
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    pub fn into_value(self) -> Arc<T> {
        self.value
    }

    /// Whether this registration constructed the object.
    pub fn is_first_instance(&self) -> bool {
        self.first_instance
    }
}

/// Counters of work done through the registry.
#[derive(Debug, Default)]
pub struct PerfCounters {
    draw_calls: AtomicU64,
    items_drawn: AtomicU64,
    culling_passes: AtomicU64,
    dispatch_buffers_registered: AtomicU64,
}

/// Point in time copy of [`PerfCounters`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PerfCountersSnapshot {
    pub draw_calls: u64,
    pub items_drawn: u64,
    pub culling_passes: u64,
    pub dispatch_buffers_registered: u64,
}

impl PerfCounters {
    pub(crate) fn add_draw_call(&self, items: u64) {
        self.draw_calls.fetch_add(1, Ordering::Relaxed);
        self.items_drawn.fetch_add(items, Ordering::Relaxed);
    }

    pub(crate) fn add_culling_pass(&self) {
        self.culling_passes.fetch_add(1, Ordering::Relaxed);
    }

    fn add_dispatch_buffer(&self) {
        self.dispatch_buffers_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PerfCountersSnapshot {
        PerfCountersSnapshot {
            draw_calls: self.draw_calls.load(Ordering::Relaxed),
            items_drawn: self.items_drawn.load(Ordering::Relaxed),
            culling_passes: self.culling_passes.load(Ordering::Relaxed),
            dispatch_buffers_registered: self.dispatch_buffers_registered.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.draw_calls.store(0, Ordering::Relaxed);
        self.items_drawn.store(0, Ordering::Relaxed);
        self.culling_passes.store(0, Ordering::Relaxed);
        self.dispatch_buffers_registered.store(0, Ordering::Relaxed);
    }
}

type Cache<T> = Mutex<FastHashMap<u64, Cached<T>>>;

/// Shared registry of programs, pipelines and buffers.
///
/// Objects registered under the same hash are constructed once. The first
/// registration wins and every later one receives the existing value.
pub struct ResourceRegistry {
    device: Arc<dyn GfxDevice>,
    shader_service: Arc<dyn ShaderService>,
    shader_preprocessor: ShaderPreProcessor,

    programs: Cache<ShaderProgram>,
    compute_pipelines: Cache<PipelineHandle>,
    graphics_pipelines: Cache<PipelineHandle>,
    current_epoch: AtomicUsize,

    counters: PerfCounters,
}

impl ResourceRegistry {
    pub fn new(device: Arc<dyn GfxDevice>, shader_service: Arc<dyn ShaderService>) -> Self {
        Self {
            device,
            shader_service,
            shader_preprocessor: ShaderPreProcessor::new(),
            programs: Mutex::default(),
            compute_pipelines: Mutex::default(),
            graphics_pipelines: Mutex::default(),
            current_epoch: AtomicUsize::new(0),
            counters: PerfCounters::default(),
        }
    }

    pub fn device(&self) -> &Arc<dyn GfxDevice> {
        &self.device
    }

    pub fn shader_service(&self) -> &Arc<dyn ShaderService> {
        &self.shader_service
    }

    pub fn shader_preprocessor(&self) -> &ShaderPreProcessor {
        &self.shader_preprocessor
    }

    pub fn perf_counters(&self) -> &PerfCounters {
        &self.counters
    }

    fn register_in<T, E>(
        &self,
        cache: &Cache<T>,
        hash: u64,
        construct: impl FnOnce() -> Result<T, E>,
    ) -> Result<RegistryInstance<T>, E> {
        let current_epoch = self.current_epoch.load(Ordering::Acquire);
        let mut cache = cache.lock();
        if let Some(cached) = cache.get_mut(&hash) {
            cached.epoch = current_epoch;
            return Ok(RegistryInstance {
                value: Arc::clone(&cached.inner),
                first_instance: false,
            });
        }

        // Failed constructions are not cached so the next frame retries.
        let inner = Arc::new(construct()?);
        cache.insert(
            hash,
            Cached {
                inner: Arc::clone(&inner),
                epoch: current_epoch,
            },
        );
        Ok(RegistryInstance {
            value: inner,
            first_instance: true,
        })
    }

    pub fn register_program<E>(
        &self,
        hash: u64,
        construct: impl FnOnce() -> Result<ShaderProgram, E>,
    ) -> Result<RegistryInstance<ShaderProgram>, E> {
        self.register_in(&self.programs, hash, construct)
    }

    pub fn register_compute_pipeline<E>(
        &self,
        hash: u64,
        construct: impl FnOnce() -> Result<PipelineHandle, E>,
    ) -> Result<RegistryInstance<PipelineHandle>, E> {
        self.register_in(&self.compute_pipelines, hash, construct)
    }

    pub fn register_graphics_pipeline<E>(
        &self,
        hash: u64,
        construct: impl FnOnce() -> Result<PipelineHandle, E>,
    ) -> Result<RegistryInstance<PipelineHandle>, E> {
        self.register_in(&self.graphics_pipelines, hash, construct)
    }

    /// Allocates a dispatch buffer of `count` records of `command_num_uints`
    /// words. Dispatch buffers are owned by one batch and never shared.
    pub fn register_dispatch_buffer(&self, role: &str, count: u32, command_num_uints: u32) -> DispatchBuffer {
        let size = count as u64 * command_num_uints as u64 * 4;
        let buffer = GpuBuffer::new(
            Arc::clone(&self.device),
            &BufferDesc {
                label: crate::format_sso!("{role} dispatch buffer"),
                size,
                usage: BufferUsages::DISPATCH,
            },
        );
        self.counters.add_dispatch_buffer();
        DispatchBuffer::new(buffer, count, command_num_uints)
    }

    /// Allocates a standalone buffer of `count` elements of `format`.
    pub fn register_buffer_resource(
        &self,
        role: &str,
        format: ElementFormat,
        count: u64,
        usage: BufferUsages,
    ) -> Arc<GpuBuffer> {
        Arc::new(GpuBuffer::new(
            Arc::clone(&self.device),
            &BufferDesc {
                label: SsoString::from(role),
                size: format.size() * count,
                usage,
            },
        ))
    }

    /// Number of programs and pipelines currently registered.
    pub fn registered_count(&self) -> usize {
        self.programs.lock().len() + self.compute_pipelines.lock().len() + self.graphics_pipelines.lock().len()
    }

    /// Drops every entry that was neither registered since the last call nor
    /// is still held outside the registry, then starts a new epoch.
    pub fn garbage_collect(&self) {
        profiling::scope!("ResourceRegistry::garbage_collect");

        let current_epoch = self.current_epoch.fetch_add(1, Ordering::AcqRel);
        let before = self.registered_count();
        retain_live(&self.programs, current_epoch);
        retain_live(&self.compute_pipelines, current_epoch);
        retain_live(&self.graphics_pipelines, current_epoch);
        let after = self.registered_count();
        if before != after {
            log::debug!("Registry dropped {} unused programs and pipelines", before - after);
        }
    }
}

fn retain_live<T>(cache: &Cache<T>, current_epoch: usize) {
    cache
        .lock()
        .retain(|_, v| v.epoch == current_epoch || Arc::strong_count(&v.inner) > 1);
}
