// SLV-Appearance: avatar appearance and scene culling for a Second Life viewer
// Grey until baked, culled until seen

pub mod utils;
pub mod config;
pub mod assets;
pub mod world;
pub mod rendering;

// Re-export commonly used types for convenience
pub use config::{PerformanceProfile, ThreadPoolConfig, ViewerSettings};
pub use world::{FrameReport, SessionError, WorldSession};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
