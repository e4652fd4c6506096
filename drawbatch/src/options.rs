use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Feature switches for batch compilation and culling.
///
/// Resolved once by whoever owns the render passes and handed to every batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Cull whole draw items on the GPU before drawing.
    pub enable_gpu_frustum_culling: bool,
    /// Cull individual instances of instanced items. Without this, instanced
    /// batches are never culled.
    pub enable_gpu_instance_culling: bool,
    /// Also cull items whose screen extent falls outside the drawing range.
    pub enable_tiny_prim_culling: bool,
    /// Read back the number of instances surviving culling. Stalls on the GPU.
    pub enable_visible_instance_counting: bool,
    /// Keep the last culling results until the draw commands change.
    pub freeze_culling: bool,
    /// How long the visible instance read-back may wait for the GPU.
    pub visible_count_timeout_ms: u64,
}

impl BatchOptions {
    pub fn visible_count_timeout(&self) -> Duration {
        Duration::from_millis(self.visible_count_timeout_ms)
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            enable_gpu_frustum_culling: true,
            enable_gpu_instance_culling: true,
            enable_tiny_prim_culling: false,
            enable_visible_instance_counting: false,
            freeze_culling: false,
            visible_count_timeout_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BatchOptions;

    #[test]
    fn missing_fields_use_defaults() {
        let options: BatchOptions =
            serde_json::from_str(r#"{ "enable_visible_instance_counting": true }"#).unwrap();
        assert!(options.enable_visible_instance_counting);
        assert!(options.enable_gpu_frustum_culling);
        assert!(options.enable_gpu_instance_culling);
        assert!(!options.freeze_culling);
        assert_eq!(options.visible_count_timeout().as_secs(), 5);
    }

    #[test]
    fn round_trips_through_json() {
        let options = BatchOptions {
            freeze_culling: true,
            visible_count_timeout_ms: 250,
            ..Default::default()
        };
        let text = serde_json::to_string(&options).unwrap();
        let back: BatchOptions = serde_json::from_str(&text).unwrap();
        assert_eq!(options, back);
    }
}
