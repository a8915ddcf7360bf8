pub mod settings;
pub mod concurrency;

// Re-export commonly used types
pub use settings::{
    PerformanceProfile, ViewerSettings, SettingsError,
    AppearanceSettings, OctreeSettings, OcclusionSettings, LodSettings,
    ImpostorSettings, FetchSettings,
    save_settings, load_settings, save_settings_to_path, load_settings_from_path,
};
pub use concurrency::ThreadPoolConfig;
