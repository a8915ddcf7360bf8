pub mod avatar;
pub mod events;
pub mod object;
pub mod session;
pub mod skeleton;

// Re-export all event types for easier access
pub use events::*;
pub use object::{ObjectKind, Renderable, SceneObject};
pub use session::{FrameReport, SessionError, WorldSession};
pub use skeleton::{SkeletonDefinition, SkeletonError};
