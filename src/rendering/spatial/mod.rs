//! Octree spatial partitions, one per drawable category.

pub mod node;
pub mod octree;
pub mod partition;

pub use node::{NodeId, NodeState, OcclusionState, PendingQuery, SpatialElement, SpatialNode};
pub use octree::{Octree, OctreeError};
pub use partition::{CullResult, PartitionType, SpatialPartition};
