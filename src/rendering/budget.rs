//! Per-frame render budget counters.
//!
//! Written during the frame's decision phase and read by everything after it.
//! The visible avatar count must be finalized before LOD selection reads it.

use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBudget {
    frame: u64,
    visible_avatars: usize,
    finalized: bool,
    lod_changes: usize,
    impostors: usize,
    regenerations: usize,
    queries_issued: usize,
    queries_resolved: usize,
    geometry_rebuilds: usize,
    draw_calls: usize,
}

impl FrameBudget {
    /// Reset every counter for `frame`.
    pub fn begin_frame(&mut self, frame: u64) {
        *self = Self {
            frame,
            ..Self::default()
        };
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn set_visible_avatars(&mut self, count: usize) {
        if self.finalized {
            warn!("Visible avatar count changed after the frame budget was finalized");
            return;
        }
        self.visible_avatars = count;
    }

    /// Freeze the inputs LOD and impostor decisions depend on.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn visible_avatars(&self) -> usize {
        debug_assert!(self.finalized, "frame budget read before finalize");
        self.visible_avatars
    }

    pub fn record_lod_changes(&mut self, count: usize) {
        self.lod_changes += count;
    }

    pub fn record_impostor(&mut self) {
        self.impostors += 1;
    }

    pub fn record_regeneration(&mut self) {
        self.regenerations += 1;
    }

    pub fn record_query_issued(&mut self) {
        self.queries_issued += 1;
    }

    pub fn record_query_resolved(&mut self) {
        self.queries_resolved += 1;
    }

    pub fn record_geometry_rebuilds(&mut self, count: usize) {
        self.geometry_rebuilds += count;
    }

    pub fn record_draw(&mut self) {
        self.draw_calls += 1;
    }

    pub fn lod_changes(&self) -> usize {
        self.lod_changes
    }

    pub fn impostors(&self) -> usize {
        self.impostors
    }

    pub fn regenerations(&self) -> usize {
        self.regenerations
    }

    pub fn queries_issued(&self) -> usize {
        self.queries_issued
    }

    pub fn queries_resolved(&self) -> usize {
        self.queries_resolved
    }

    pub fn geometry_rebuilds(&self) -> usize {
        self.geometry_rebuilds
    }

    pub fn draw_calls(&self) -> usize {
        self.draw_calls
    }

    pub fn log_summary(&self) {
        debug!(
            "Frame {}: {} avatars visible, {} impostors ({} regenerated), {} LOD changes, {} queries issued, {} resolved, {} rebuilds, {} draws",
            self.frame,
            self.visible_avatars,
            self.impostors,
            self.regenerations,
            self.lod_changes,
            self.queries_issued,
            self.queries_resolved,
            self.geometry_rebuilds,
            self.draw_calls
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_count_frozen_after_finalize() {
        let mut budget = FrameBudget::default();
        budget.begin_frame(3);
        budget.set_visible_avatars(5);
        budget.finalize();
        budget.set_visible_avatars(9);
        assert_eq!(budget.visible_avatars(), 5);

        budget.begin_frame(4);
        assert!(!budget.is_finalized());
        assert_eq!(budget.frame(), 4);
    }
}
