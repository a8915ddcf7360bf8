//! Loose octree over an index arena.
//!
//! Nodes refer to each other by [`NodeId`]; freeing a node bumps its slot
//! generation so stale ids held elsewhere (pending queries, caches) simply stop
//! resolving.

use super::node::{NodeId, NodeState, SpatialElement, SpatialNode};
use crate::config::OctreeSettings;
use crate::rendering::backend::QueryHandle;
use crate::utils::math::Aabb;
use glam::Vec3;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Slack for float error when checking containment.
const CONTAINMENT_EPSILON: f32 = 1e-3;
/// Smallest cell a point-sized element may force into existence.
const MIN_NODE_HALF_SIZE: f32 = 1.0 / 64.0;

#[derive(Debug, Error, PartialEq)]
pub enum OctreeError {
    #[error("Element {0} is already in the octree")]
    DuplicateElement(Uuid),

    #[error("Element {0} is not in the octree")]
    UnknownElement(Uuid),

    #[error("Element bounds are not finite: {0}")]
    InvalidBounds(Aabb),

    #[error("Node {node} bounds {bounds} do not contain {what}")]
    BoundsViolation { node: NodeId, bounds: Aabb, what: String },

    #[error("Node {node} is clean but its child {child} is dirty")]
    DirtyNotPropagated { node: NodeId, child: NodeId },

    #[error("Node {0} has a broken parent/child link")]
    BrokenLink(NodeId),

    #[error("{0} live nodes are unreachable from the root")]
    OrphanedNodes(usize),

    #[error("Element {element} is indexed at {node} but not stored there")]
    StaleLocation { element: Uuid, node: NodeId },
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    node: Option<SpatialNode>,
}

#[derive(Debug, Clone)]
pub struct Octree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
    locations: HashMap<Uuid, NodeId>,
    settings: OctreeSettings,
    /// Queries owned by nodes that died or were reset; drained by the culler.
    orphaned_queries: Vec<QueryHandle>,
}

impl Octree {
    pub fn new(mut settings: OctreeSettings, center: Vec3) -> Self {
        if settings.min_half_size.is_nan() || settings.min_half_size < MIN_NODE_HALF_SIZE {
            warn!("Octree min half size {} too small, using {}", settings.min_half_size, MIN_NODE_HALF_SIZE);
            settings.min_half_size = MIN_NODE_HALF_SIZE;
        }
        let root_node = SpatialNode::new(center, settings.root_half_size.max(settings.min_half_size), None);
        Self {
            slots: vec![Slot { generation: 0, node: Some(root_node) }],
            free: Vec::new(),
            root: NodeId { index: 0, generation: 0 },
            locations: HashMap::new(),
            settings,
            orphaned_queries: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn settings(&self) -> &OctreeSettings {
        &self.settings
    }

    pub fn get(&self, id: NodeId) -> Option<&SpatialNode> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut SpatialNode> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Node currently holding `element`.
    pub fn node_of(&self, element: &Uuid) -> Option<NodeId> {
        self.locations.get(element).copied()
    }

    pub fn element_bounds(&self, element: &Uuid) -> Option<Aabb> {
        let node = self.get(self.node_of(element)?)?;
        node.elements.iter().find(|e| e.id == *element).map(|e| e.bounds)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.is_some()).count()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|_| NodeId { index: index as u32, generation: slot.generation })
        })
    }

    pub fn take_orphaned_queries(&mut self) -> Vec<QueryHandle> {
        std::mem::take(&mut self.orphaned_queries)
    }

    fn alloc(&mut self, node: SpatialNode) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId { index, generation: slot.generation }
        } else {
            self.slots.push(Slot { generation: 0, node: Some(node) });
            NodeId { index: (self.slots.len() - 1) as u32, generation: 0 }
        }
    }

    fn release(&mut self, id: NodeId) -> Option<SpatialNode> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let mut node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.orphaned_queries.extend(node.reset_occlusion());
        Some(node)
    }

    /// Set `flags` on `id` and reset its occlusion state. Only bounds
    /// dirtiness travels up to the root; ancestors keep their queries.
    pub fn mark_dirty(&mut self, id: NodeId, flags: NodeState) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        node.state |= flags;
        let handles: Vec<QueryHandle> = node.reset_occlusion().collect();
        self.orphaned_queries.extend(handles);

        let mut current = self.get(id).and_then(|node| node.parent);
        while let Some(node_id) = current {
            let Some(node) = self.get_mut(node_id) else {
                break;
            };
            node.state |= NodeState::BOUNDS_DIRTY;
            current = node.parent;
        }
    }

    // =========================================================================
    // Insertion and removal
    // =========================================================================

    pub fn insert(&mut self, id: Uuid, bounds: Aabb) -> Result<NodeId, OctreeError> {
        if self.locations.contains_key(&id) {
            return Err(OctreeError::DuplicateElement(id));
        }
        if bounds.is_empty() || !bounds.min.is_finite() || !bounds.max.is_finite() {
            return Err(OctreeError::InvalidBounds(bounds));
        }

        let center = bounds.center();
        self.grow_root_to_contain(center);

        let radius = bounds.radius();
        let capacity = self.settings.max_capacity.max(1);
        let mut current = self.root;
        loop {
            let node = self.get(current).ok_or(OctreeError::BrokenLink(current))?;
            let parent_full = node
                .parent
                .and_then(|p| self.get(p))
                .is_some_and(|p| p.elements.len() >= capacity);
            let has_room = node.elements.len() < capacity && node.fits(radius);
            let oversized = radius > node.half_size && parent_full;
            let at_floor = node.half_size * 0.5 < self.settings.min_half_size;

            if has_room || oversized || at_floor {
                if oversized && !has_room {
                    trace!("Oversized element {} (r={:.1}) kept at half size {:.1}", id, radius, node.half_size);
                }
                break;
            }

            let octant = node.octant_for(center);
            current = match node.children[octant] {
                Some(child) => child,
                None => {
                    let child = SpatialNode::new(node.child_center(octant), node.half_size * 0.5, Some(current));
                    let child_id = self.alloc(child);
                    if let Some(node) = self.get_mut(current) {
                        node.children[octant] = Some(child_id);
                    }
                    child_id
                }
            };
        }

        let node = self.get_mut(current).ok_or(OctreeError::BrokenLink(current))?;
        node.elements.push(SpatialElement { id, bounds });
        self.locations.insert(id, current);
        self.mark_dirty(current, NodeState::BOUNDS_DIRTY | NodeState::GEOM_DIRTY | NodeState::OBJECT_COUNT_DIRTY);
        Ok(current)
    }

    fn grow_root_to_contain(&mut self, point: Vec3) {
        loop {
            let Some(root) = self.get(self.root) else {
                return;
            };
            if root.cell().contains_point(point) {
                return;
            }
            let half = root.half_size;
            if half * 2.0 > self.settings.max_root_half_size {
                warn!("Octree root at half size {:.0} cannot grow to reach {}; keeping element in root", half, point);
                return;
            }

            // Old root becomes the octant of the new root facing away from `point`.
            let step = Vec3::select(point.cmpge(root.center), Vec3::splat(half), Vec3::splat(-half));
            let new_center = root.center + step;
            let mut new_root = SpatialNode::new(new_center, half * 2.0, None);
            let octant = new_root.octant_for(root.center);
            let old_root = self.root;
            new_root.children[octant] = Some(old_root);
            let new_id = self.alloc(new_root);
            if let Some(old) = self.get_mut(old_root) {
                old.parent = Some(new_id);
            }
            self.root = new_id;
            self.mark_dirty(old_root, NodeState::BOUNDS_DIRTY);
            debug!("Octree root grew to half size {:.0} around {}", half * 2.0, new_center);
        }
    }

    /// Remove an element. Empty nodes linger until `consolidate`.
    pub fn remove(&mut self, id: &Uuid) -> Result<Aabb, OctreeError> {
        let node_id = self.locations.remove(id).ok_or(OctreeError::UnknownElement(*id))?;
        let node = self.get_mut(node_id).ok_or(OctreeError::StaleLocation { element: *id, node: node_id })?;
        let position = node
            .elements
            .iter()
            .position(|e| e.id == *id)
            .ok_or(OctreeError::StaleLocation { element: *id, node: node_id })?;
        let element = node.elements.swap_remove(position);
        self.mark_dirty(node_id, NodeState::BOUNDS_DIRTY | NodeState::GEOM_DIRTY | NodeState::OBJECT_COUNT_DIRTY);
        Ok(element.bounds)
    }

    /// Move or resize an element. Stays in place while its node still fits it.
    pub fn update(&mut self, id: Uuid, bounds: Aabb) -> Result<NodeId, OctreeError> {
        let node_id = self.node_of(&id).ok_or(OctreeError::UnknownElement(id))?;
        if bounds.is_empty() || !bounds.min.is_finite() || !bounds.max.is_finite() {
            return Err(OctreeError::InvalidBounds(bounds));
        }
        let node = self.get_mut(node_id).ok_or(OctreeError::StaleLocation { element: id, node: node_id })?;
        let stays = node.cell().contains_point(bounds.center()) && (node.is_root() || node.fits(bounds.radius()));
        if stays {
            if let Some(element) = node.elements.iter_mut().find(|e| e.id == id) {
                element.bounds = bounds;
                self.mark_dirty(node_id, NodeState::BOUNDS_DIRTY | NodeState::GEOM_DIRTY);
                return Ok(node_id);
            }
        }
        self.remove(&id)?;
        self.insert(id, bounds)
    }

    // =========================================================================
    // Bounds
    // =========================================================================

    /// Recompute bounds below `id` where dirty, clearing the flag. Returns the node bounds.
    pub fn update_bounds(&mut self, id: NodeId) -> Aabb {
        let Some(node) = self.get(id) else {
            return Aabb::empty();
        };
        if !node.state.contains(NodeState::BOUNDS_DIRTY) {
            return node.bounds;
        }
        let children: Vec<NodeId> = node.children().collect();
        let object_bounds = node.elements.iter().fold(Aabb::empty(), |acc, e| acc.union(&e.bounds));

        let mut bounds = object_bounds;
        for child in children {
            bounds = bounds.union(&self.update_bounds(child));
        }

        if let Some(node) = self.get_mut(id) {
            node.object_bounds = object_bounds;
            node.bounds = bounds;
            node.state.remove(NodeState::BOUNDS_DIRTY | NodeState::OBJECT_COUNT_DIRTY);
        }
        bounds
    }

    /// Elements held by `id` and all of its descendants.
    pub fn subtree_element_count(&self, id: NodeId) -> usize {
        let Some(node) = self.get(id) else {
            return 0;
        };
        node.elements.len() + node.children().map(|child| self.subtree_element_count(child)).sum::<usize>()
    }

    // =========================================================================
    // Consolidation
    // =========================================================================

    /// Free empty leaves and fold sparse subtrees back into their ancestor.
    /// Returns the number of nodes freed.
    pub fn consolidate(&mut self) -> usize {
        let freed = self.consolidate_node(self.root);
        if freed > 0 {
            debug!("Octree consolidated, {} nodes freed, {} remain", freed, self.node_count());
        }
        freed
    }

    fn consolidate_node(&mut self, id: NodeId) -> usize {
        let Some(node) = self.get(id) else {
            return 0;
        };
        let children: Vec<(usize, NodeId)> = node
            .children
            .iter()
            .enumerate()
            .filter_map(|(octant, child)| child.map(|c| (octant, c)))
            .collect();

        let mut freed = 0;
        for (octant, child) in children {
            freed += self.consolidate_node(child);
            let Some(child_node) = self.get(child) else {
                continue;
            };
            if child_node.elements.is_empty() && child_node.is_leaf() {
                self.release(child);
                if let Some(node) = self.get_mut(id) {
                    node.children[octant] = None;
                }
                self.mark_dirty(id, NodeState::BOUNDS_DIRTY);
                freed += 1;
            }
        }

        let Some(node) = self.get(id) else {
            return freed;
        };
        if !node.is_leaf() && self.subtree_element_count(id) < self.settings.max_capacity {
            freed += self.collapse_into(id);
        }
        freed
    }

    /// Move every descendant element into `id` and free the descendants.
    fn collapse_into(&mut self, id: NodeId) -> usize {
        let mut stack: Vec<NodeId> = match self.get_mut(id) {
            Some(node) => std::mem::take(&mut node.children).into_iter().flatten().collect(),
            None => return 0,
        };
        let mut moved = Vec::new();
        let mut freed = 0;
        while let Some(child) = stack.pop() {
            if let Some(node) = self.release(child) {
                stack.extend(node.children.iter().flatten().copied());
                moved.extend(node.elements);
                freed += 1;
            }
        }
        for element in &moved {
            self.locations.insert(element.id, id);
        }
        if let Some(node) = self.get_mut(id) {
            node.elements.extend(moved);
        }
        self.mark_dirty(id, NodeState::BOUNDS_DIRTY | NodeState::GEOM_DIRTY | NodeState::OBJECT_COUNT_DIRTY);
        freed
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    /// Structural and bounds checks over the whole tree.
    pub fn check_invariants(&self) -> Result<(), OctreeError> {
        for (element, &node_id) in &self.locations {
            let stored = self
                .get(node_id)
                .is_some_and(|node| node.elements.iter().any(|e| e.id == *element));
            if !stored {
                return Err(OctreeError::StaleLocation { element: *element, node: node_id });
            }
        }

        let mut reached = 0;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = self.get(id).ok_or(OctreeError::BrokenLink(id))?;
            reached += 1;

            for child_id in node.children() {
                let child = self.get(child_id).ok_or(OctreeError::BrokenLink(child_id))?;
                if child.parent != Some(id) {
                    return Err(OctreeError::BrokenLink(child_id));
                }
                if child.is_dirty() && !node.is_dirty() {
                    return Err(OctreeError::DirtyNotPropagated { node: id, child: child_id });
                }
                if !node.is_dirty() && !node.bounds.contains(&child.bounds, CONTAINMENT_EPSILON) {
                    return Err(OctreeError::BoundsViolation {
                        node: id,
                        bounds: node.bounds,
                        what: format!("child {} {}", child_id, child.bounds),
                    });
                }
                stack.push(child_id);
            }

            if !node.is_dirty() {
                for element in &node.elements {
                    if !node.bounds.contains(&element.bounds, CONTAINMENT_EPSILON) {
                        return Err(OctreeError::BoundsViolation {
                            node: id,
                            bounds: node.bounds,
                            what: format!("element {} {}", element.id, element.bounds),
                        });
                    }
                }
            }
        }

        let live = self.node_count();
        if reached != live {
            return Err(OctreeError::OrphanedNodes(live - reached));
        }
        Ok(())
    }

    /// Fatal in debug builds, logged and tolerated in release.
    pub fn validate(&self) {
        if let Err(e) = self.check_invariants() {
            if cfg!(debug_assertions) {
                panic!("octree invariant violated: {e}");
            }
            error!("Octree invariant violated: {}", e);
        }
    }
}
