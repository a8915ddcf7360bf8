use crate::rendering::backend::QueryHandle;
use crate::rendering::camera::{CameraSlot, MAX_CAMERAS};
use crate::utils::math::Aabb;
use glam::Vec3;
use std::fmt;
use uuid::Uuid;

bitflags::bitflags! {
    /// Content state of a node. Empty means clean.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeState: u8 {
        /// Something moved, arrived or left; bounds are stale.
        const BOUNDS_DIRTY = 0x01;
        /// Group render buffer needs a rebuild.
        const GEOM_DIRTY = 0x02;
        const OBJECT_COUNT_DIRTY = 0x04;
    }
}

impl NodeState {
    pub const CLEAN: NodeState = NodeState::empty();
}

bitflags::bitflags! {
    /// Occlusion state of a node for one camera. Empty means unknown.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OcclusionState: u8 {
        const QUERY_PENDING = 0x01;
        /// Last resolved query drew zero samples.
        const CULLED = 0x02;
        /// Last resolved query drew samples.
        const VISIBLE = 0x04;
    }
}

impl OcclusionState {
    pub const UNKNOWN: OcclusionState = OcclusionState::empty();
}

/// Stable arena address of a node. Stale ids never resolve after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialElement {
    pub id: Uuid,
    pub bounds: Aabb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingQuery {
    pub handle: QueryHandle,
    pub issued_frame: u64,
}

/// One octree group.
#[derive(Debug, Clone)]
pub struct SpatialNode {
    pub(crate) center: Vec3,
    pub(crate) half_size: f32,
    pub(crate) state: NodeState,
    pub(crate) occlusion: [OcclusionState; MAX_CAMERAS],
    pub(crate) queries: [Option<PendingQuery>; MAX_CAMERAS],
    pub(crate) last_visible_frame: [u64; MAX_CAMERAS],
    /// Tightest box around the elements held directly.
    pub(crate) object_bounds: Aabb,
    /// Object bounds plus every child's bounds.
    pub(crate) bounds: Aabb,
    pub(crate) elements: Vec<SpatialElement>,
    pub(crate) children: [Option<NodeId>; 8],
    pub(crate) parent: Option<NodeId>,
}

impl SpatialNode {
    pub(crate) fn new(center: Vec3, half_size: f32, parent: Option<NodeId>) -> Self {
        Self {
            center,
            half_size,
            state: NodeState::BOUNDS_DIRTY,
            occlusion: [OcclusionState::UNKNOWN; MAX_CAMERAS],
            queries: [None; MAX_CAMERAS],
            last_visible_frame: [0; MAX_CAMERAS],
            object_bounds: Aabb::empty(),
            bounds: Aabb::empty(),
            elements: Vec::new(),
            children: [None; 8],
            parent,
        }
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn half_size(&self) -> f32 {
        self.half_size
    }

    /// Cell used to route insertions.
    pub fn cell(&self) -> Aabb {
        Aabb::from_center_half_extents(self.center, Vec3::splat(self.half_size))
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.state.contains(NodeState::BOUNDS_DIRTY)
    }

    pub fn occlusion(&self, camera: CameraSlot) -> OcclusionState {
        self.occlusion[camera.index()]
    }

    pub fn is_occlusion_culled(&self, camera: CameraSlot) -> bool {
        self.occlusion[camera.index()].contains(OcclusionState::CULLED)
    }

    pub fn pending_query(&self, camera: CameraSlot) -> Option<PendingQuery> {
        self.queries[camera.index()]
    }

    pub fn last_visible_frame(&self, camera: CameraSlot) -> u64 {
        self.last_visible_frame[camera.index()]
    }

    pub fn object_bounds(&self) -> Aabb {
        self.object_bounds
    }

    /// Possibly stale unless the node is clean.
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn elements(&self) -> &[SpatialElement] {
        &self.elements
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().flatten().copied()
    }

    pub fn child_count(&self) -> usize {
        self.children.iter().flatten().count()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }

    /// Whether an element of bin `radius` belongs at this depth.
    ///
    /// A node of half size `h` holds radii in `(h, 2h]`; the root holds anything.
    pub fn fits(&self, radius: f32) -> bool {
        self.is_root() || (radius <= self.half_size * 2.0 && radius > self.half_size)
    }

    pub fn octant_for(&self, point: Vec3) -> usize {
        (point.x >= self.center.x) as usize
            | ((point.y >= self.center.y) as usize) << 1
            | ((point.z >= self.center.z) as usize) << 2
    }

    pub fn child_center(&self, octant: usize) -> Vec3 {
        let quarter = self.half_size * 0.5;
        let sign = |bit: usize| if octant & bit != 0 { quarter } else { -quarter };
        self.center + Vec3::new(sign(1), sign(2), sign(4))
    }

    /// Forget occlusion results for every camera. Returns outstanding query handles.
    pub(crate) fn reset_occlusion(&mut self) -> impl Iterator<Item = QueryHandle> {
        self.occlusion = [OcclusionState::UNKNOWN; MAX_CAMERAS];
        std::mem::take(&mut self.queries).into_iter().flatten().map(|q| q.handle)
    }
}
