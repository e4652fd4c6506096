use crate::{item::is_aggregated, util::hash};

use super::DrawBatch;

/// Outcome of [`DrawBatch::validate`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    ValidBatch,
    /// Buffers moved; recompile this batch with the same items.
    RebuildBatch,
    /// The grouping of items into batches is stale.
    RebuildAllBatches,
}

impl DrawBatch {
    /// Checks whether the compiled dispatch buffer still describes the items.
    ///
    /// The cheap check compares the buffer arrays hash of the first item. The
    /// deep check walks every item.
    pub fn validate(&mut self, deep: bool) -> ValidationResult {
        profiling::scope!("DrawBatch::validate");

        let Some(first) = self.items.first() else {
            log::error!("Batch {:?} has no draw items", self.id);
            return ValidationResult::RebuildAllBatches;
        };
        let first_item = first.draw_item();

        let buffer_arrays_hash = first_item.buffer_arrays_hash();
        if self.buffer_arrays_hash != buffer_arrays_hash {
            log::debug!("Batch {:?} buffer arrays changed", self.id);
            self.buffer_arrays_hash = buffer_arrays_hash;
            return ValidationResult::RebuildBatch;
        }

        if !deep {
            return ValidationResult::ValidBatch;
        }

        let mut element_offsets_hash = 0;
        for instance in &self.items {
            let item = instance.draw_item();
            if item.geometric_shader().is_none() {
                log::error!("Draw item {} of batch {:?} has no geometric shader", instance.batch_index(), self.id);
                return ValidationResult::RebuildAllBatches;
            }
            if !is_aggregated(first_item, item) {
                log::debug!(
                    "Draw item {} no longer aggregates with batch {:?}",
                    instance.batch_index(),
                    self.id
                );
                return ValidationResult::RebuildAllBatches;
            }
            element_offsets_hash = hash::combine(element_offsets_hash, &item.element_offsets_hash());
        }

        if self.element_offsets_hash != element_offsets_hash {
            log::debug!("Batch {:?} element offsets changed", self.id);
            return ValidationResult::RebuildBatch;
        }

        ValidationResult::ValidBatch
    }
}
