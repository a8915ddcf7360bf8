use crate::rendering::spatial::PartitionType;
use crate::utils::math::Aabb;
use crate::world::avatar::Avatar;
use crate::world::events::ObjectUpdateEvent;
use glam::Vec3;
use uuid::Uuid;

/// Closed set of drawable object categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Avatar,
    Volume,
    Tree,
    Particle,
    /// Attachment bridge: geometry that rides along with an avatar.
    Bridge,
}

impl ObjectKind {
    /// Octree category the object lives in.
    pub fn partition(&self) -> PartitionType {
        match self {
            ObjectKind::Avatar => PartitionType::Avatar,
            ObjectKind::Volume => PartitionType::Volume,
            ObjectKind::Tree => PartitionType::Tree,
            ObjectKind::Particle => PartitionType::Particle,
            ObjectKind::Bridge => PartitionType::Bridge,
        }
    }
}

/// Capability shared by everything the spatial partitions can hold.
pub trait Renderable {
    fn id(&self) -> Uuid;
    fn kind(&self) -> ObjectKind;
    fn bounds(&self) -> Aabb;

    fn radius(&self) -> f32 {
        self.bounds().radius()
    }

    fn center(&self) -> Vec3 {
        self.bounds().center()
    }
}

/// Non-avatar drawable streamed in from the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneObject {
    pub id: Uuid,
    pub kind: ObjectKind,
    pub position: Vec3,
    pub scale: Vec3,
}

impl SceneObject {
    pub fn new(id: Uuid, kind: ObjectKind, position: Vec3, scale: Vec3) -> Self {
        Self { id, kind, position, scale }
    }

    pub fn apply_update(&mut self, event: &ObjectUpdateEvent) {
        self.kind = event.kind;
        self.position = event.position;
        self.scale = event.scale;
    }
}

impl From<&ObjectUpdateEvent> for SceneObject {
    fn from(event: &ObjectUpdateEvent) -> Self {
        Self::new(event.object_id, event.kind, event.position, event.scale)
    }
}

impl Renderable for SceneObject {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> ObjectKind {
        self.kind
    }

    fn bounds(&self) -> Aabb {
        Aabb::from_center_half_extents(self.position, self.scale * 0.5)
    }
}

impl Renderable for Avatar {
    fn id(&self) -> Uuid {
        Avatar::id(self)
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Avatar
    }

    fn bounds(&self) -> Aabb {
        Avatar::bounds(self)
    }
}
