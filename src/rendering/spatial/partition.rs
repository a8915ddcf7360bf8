use super::node::{NodeId, NodeState};
use super::octree::{Octree, OctreeError};
use crate::config::OctreeSettings;
use crate::rendering::backend::RenderBackend;
use crate::rendering::budget::FrameBudget;
use crate::rendering::camera::Camera;
use crate::rendering::occlusion::OcclusionCuller;
use crate::utils::math::Aabb;
use glam::Vec3;
use tracing::trace;
use uuid::Uuid;

/// Drawable category; one octree each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionType {
    Volume,
    Bridge,
    Avatar,
    Tree,
    Particle,
}

impl PartitionType {
    pub const ALL: [PartitionType; 5] = [
        PartitionType::Volume,
        PartitionType::Bridge,
        PartitionType::Avatar,
        PartitionType::Tree,
        PartitionType::Particle,
    ];

    /// Whether nodes batch their members into one group render buffer.
    /// Avatars and attachment bridges draw per object.
    pub fn uses_group_geometry(&self) -> bool {
        matches!(self, PartitionType::Volume | PartitionType::Tree | PartitionType::Particle)
    }
}

/// What survived one visibility pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CullResult {
    pub visible_nodes: Vec<NodeId>,
    pub visible_elements: Vec<Uuid>,
    pub frustum_culled: usize,
    pub occlusion_culled: usize,
}

#[derive(Debug, Clone)]
pub struct SpatialPartition {
    kind: PartitionType,
    octree: Octree,
    last_cull_frame: u64,
}

impl SpatialPartition {
    pub fn new(kind: PartitionType, settings: OctreeSettings, center: Vec3) -> Self {
        Self {
            kind,
            octree: Octree::new(settings, center),
            last_cull_frame: 0,
        }
    }

    pub fn kind(&self) -> PartitionType {
        self.kind
    }

    pub fn octree(&self) -> &Octree {
        &self.octree
    }

    pub fn octree_mut(&mut self) -> &mut Octree {
        &mut self.octree
    }

    pub fn len(&self) -> usize {
        self.octree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.octree.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.octree.node_of(id).is_some()
    }

    pub fn insert(&mut self, id: Uuid, bounds: Aabb) -> Result<NodeId, OctreeError> {
        self.octree.insert(id, bounds)
    }

    pub fn remove(&mut self, id: &Uuid) -> Result<Aabb, OctreeError> {
        self.octree.remove(id)
    }

    /// Insert, or move if already present.
    pub fn upsert(&mut self, id: Uuid, bounds: Aabb) -> Result<NodeId, OctreeError> {
        if self.contains(&id) {
            self.octree.update(id, bounds)
        } else {
            self.octree.insert(id, bounds)
        }
    }

    pub fn consolidate(&mut self) -> usize {
        self.octree.consolidate()
    }

    /// Frustum and occlusion pass from the root. Culled nodes skip their subtree.
    pub fn cull(
        &mut self,
        camera: &Camera,
        culler: &mut OcclusionCuller,
        backend: &mut dyn RenderBackend,
        budget: &mut FrameBudget,
        frame: u64,
    ) -> CullResult {
        self.last_cull_frame = frame;
        let mut result = CullResult::default();
        let mut stack = vec![self.octree.root()];

        while let Some(id) = stack.pop() {
            let bounds = self.octree.update_bounds(id);
            if bounds.is_empty() {
                continue;
            }
            if !camera.is_visible(&bounds) {
                result.frustum_culled += 1;
                continue;
            }
            if !culler.test_node(&mut self.octree, id, camera, backend, budget, frame) {
                result.occlusion_culled += 1;
                continue;
            }

            let Some(node) = self.octree.get_mut(id) else {
                continue;
            };
            node.last_visible_frame[camera.slot.index()] = frame;
            result.visible_nodes.push(id);
            result
                .visible_elements
                .extend(node.elements.iter().filter(|e| camera.is_visible(&e.bounds)).map(|e| e.id));
            stack.extend(node.children());
        }

        trace!(
            "{:?} cull: {} nodes visible, {} frustum culled, {} occluded",
            self.kind,
            result.visible_nodes.len(),
            result.frustum_culled,
            result.occlusion_culled
        );
        result
    }

    /// Rebuild group geometry for at most `budget` nodes seen in the last cull.
    /// Most recently visible first; the rest wait for a later frame.
    pub fn rebuild_geometry(&mut self, budget: usize) -> Vec<NodeId> {
        if !self.kind.uses_group_geometry() {
            return Vec::new();
        }
        let frame = self.last_cull_frame;
        let mut dirty: Vec<(u64, NodeId)> = self
            .octree
            .node_ids()
            .filter_map(|id| {
                let node = self.octree.get(id)?;
                let seen = node.last_visible_frame.iter().copied().max().unwrap_or(0);
                (node.state.contains(NodeState::GEOM_DIRTY) && seen == frame && frame > 0).then_some((seen, id))
            })
            .collect();
        dirty.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        dirty.truncate(budget);

        let rebuilt: Vec<NodeId> = dirty.into_iter().map(|(_, id)| id).collect();
        for &id in &rebuilt {
            if let Some(node) = self.octree.get_mut(id) {
                node.state.remove(NodeState::GEOM_DIRTY);
            }
        }
        if !rebuilt.is_empty() {
            trace!("{:?} rebuilt geometry for {} nodes", self.kind, rebuilt.len());
        }
        rebuilt
    }
}
