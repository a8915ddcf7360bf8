//! Per-camera occlusion query lifecycle on top of node state bits.
//!
//! A query issued in frame N is read back in frame N+1 at the earliest. A node
//! is only ever culled on a resolved zero-sample result; unknown or pending
//! nodes draw.

use crate::config::OcclusionSettings;
use crate::rendering::backend::RenderBackend;
use crate::rendering::budget::FrameBudget;
use crate::rendering::camera::Camera;
use crate::rendering::spatial::{NodeId, Octree, OcclusionState, PendingQuery};
use tracing::{info, trace, warn};

#[derive(Debug, Clone)]
pub struct OcclusionCuller {
    enabled: bool,
    near_field_radius: f32,
    query_padding: f32,
}

impl OcclusionCuller {
    /// Hardware support is probed once here; without it nothing is ever occlusion culled.
    pub fn new(settings: &OcclusionSettings, backend: &dyn RenderBackend) -> Self {
        let supported = backend.supports_occlusion_queries();
        if settings.enabled && !supported {
            warn!("Occlusion queries unavailable, occlusion culling disabled");
        }
        let enabled = settings.enabled && supported;
        info!("Occlusion culling {}", if enabled { "enabled" } else { "disabled" });
        Self {
            enabled,
            near_field_radius: settings.near_field_radius,
            query_padding: settings.query_padding,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Release queries of nodes that died or whose contents changed. Their results are discarded.
    pub fn drain_orphans(&self, octree: &mut Octree, backend: &mut dyn RenderBackend) -> usize {
        let orphans = octree.take_orphaned_queries();
        for handle in &orphans {
            backend.release_query(*handle);
        }
        if !orphans.is_empty() {
            trace!("Discarded {} orphaned occlusion queries", orphans.len());
        }
        orphans.len()
    }

    /// Read back, then (re)issue, the query for `id`. Returns false only when
    /// the node's last resolved query saw zero samples.
    pub fn test_node(
        &mut self,
        octree: &mut Octree,
        id: NodeId,
        camera: &Camera,
        backend: &mut dyn RenderBackend,
        budget: &mut FrameBudget,
        frame: u64,
    ) -> bool {
        if !self.enabled {
            return true;
        }
        let slot = camera.slot.index();
        let padding = self.query_padding;
        let Some(node) = octree.get_mut(id) else {
            return true;
        };

        if node.bounds.distance_to_point(camera.origin) <= self.near_field_radius {
            if let Some(pending) = node.queries[slot].take() {
                backend.release_query(pending.handle);
            }
            node.occlusion[slot] = OcclusionState::VISIBLE;
            return true;
        }

        if let Some(pending) = node.queries[slot] {
            if frame > pending.issued_frame {
                if let Some(samples) = backend.query_result(pending.handle) {
                    backend.release_query(pending.handle);
                    node.queries[slot] = None;
                    node.occlusion[slot] = if samples == 0 {
                        OcclusionState::CULLED
                    } else {
                        OcclusionState::VISIBLE
                    };
                    budget.record_query_resolved();
                    trace!("Node {} resolved {} samples for camera {}", id, samples, slot);
                }
            }
        }

        if node.queries[slot].is_none() {
            let handle = backend.issue_occlusion_query(&node.bounds.expanded(padding), camera);
            node.queries[slot] = Some(PendingQuery { handle, issued_frame: frame });
            node.occlusion[slot] |= OcclusionState::QUERY_PENDING;
            budget.record_query_issued();
        }

        !node.occlusion[slot].contains(OcclusionState::CULLED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OctreeSettings;
    use crate::rendering::backend::RecordingBackend;
    use crate::rendering::camera::CameraSlot;
    use crate::utils::math::Aabb;
    use glam::Vec3;
    use uuid::Uuid;

    fn setup() -> (Octree, NodeId, Camera) {
        let mut octree = Octree::new(OctreeSettings::default(), Vec3::ZERO);
        let node = octree
            .insert(Uuid::new_v4(), Aabb::from_center_half_extents(Vec3::new(40.0, 0.0, 0.0), Vec3::ONE))
            .unwrap();
        octree.update_bounds(octree.root());
        let camera = Camera::new(CameraSlot::WORLD, Vec3::ZERO, Vec3::X, 1.0, (256, 256));
        (octree, node, camera)
    }

    #[test]
    fn test_pending_query_counts_as_visible() {
        let (mut octree, node, camera) = setup();
        let mut backend = RecordingBackend::new();
        backend.add_occluder(Aabb::new(Vec3::splat(-100.0), Vec3::splat(100.0)));
        let mut culler = OcclusionCuller::new(&OcclusionSettings::default(), &backend);
        let mut budget = FrameBudget::default();

        backend.begin_frame(1);
        assert!(culler.test_node(&mut octree, node, &camera, &mut backend, &mut budget, 1));
        assert!(octree.get(node).unwrap().occlusion(camera.slot).contains(OcclusionState::QUERY_PENDING));

        backend.begin_frame(2);
        assert!(!culler.test_node(&mut octree, node, &camera, &mut backend, &mut budget, 2));
        assert!(octree.get(node).unwrap().is_occlusion_culled(camera.slot));
    }

    #[test]
    fn test_near_field_never_culled() {
        let (mut octree, node, _) = setup();
        let camera = Camera::new(CameraSlot::WORLD, Vec3::new(38.0, 0.0, 0.0), Vec3::X, 1.0, (256, 256));
        let mut backend = RecordingBackend::new();
        backend.add_occluder(Aabb::new(Vec3::splat(-100.0), Vec3::splat(100.0)));
        let mut culler = OcclusionCuller::new(&OcclusionSettings::default(), &backend);
        let mut budget = FrameBudget::default();
        for frame in 1..4 {
            backend.begin_frame(frame);
            assert!(culler.test_node(&mut octree, node, &camera, &mut backend, &mut budget, frame));
        }
        assert_eq!(backend.queries_issued(), 0);
    }

    #[test]
    fn test_unsupported_backend_disables_culling() {
        let backend = RecordingBackend::without_queries();
        let culler = OcclusionCuller::new(&OcclusionSettings::default(), &backend);
        assert!(!culler.is_enabled());
    }

    #[test]
    fn test_content_change_discards_pending_query() {
        let (mut octree, node, camera) = setup();
        let mut backend = RecordingBackend::new();
        let mut culler = OcclusionCuller::new(&OcclusionSettings::default(), &backend);
        let mut budget = FrameBudget::default();

        backend.begin_frame(1);
        culler.test_node(&mut octree, node, &camera, &mut backend, &mut budget, 1);
        assert_eq!(backend.outstanding_queries(), 1);

        octree.mark_dirty(node, crate::rendering::spatial::NodeState::BOUNDS_DIRTY);
        assert_eq!(octree.get(node).unwrap().occlusion(camera.slot), OcclusionState::UNKNOWN);
        assert_eq!(culler.drain_orphans(&mut octree, &mut backend), 1);
        assert_eq!(backend.outstanding_queries(), 0);
    }
}
