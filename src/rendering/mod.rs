pub mod backend;
pub mod budget;
pub mod camera;
pub mod impostor;
pub mod lod;
pub mod occlusion;
pub mod spatial;

pub use backend::{DrawCommand, QueryHandle, RecordingBackend, RenderBackend};
pub use budget::FrameBudget;
pub use camera::{Camera, CameraSlot, Frustum, MAX_CAMERAS};
pub use impostor::{AvatarView, ImpostorCapture, ImpostorDecision, ImpostorScheduler, ImpostorState};
pub use lod::{AvatarLodState, LodSelector, VOLUME_DETAIL_LEVELS};
pub use occlusion::OcclusionCuller;
pub use spatial::{CullResult, NodeId, Octree, OctreeError, PartitionType, SpatialPartition};
