use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use directories::ProjectDirs;
use serde::{Serialize, Deserialize};
use thiserror::Error;

const SETTINGS_FILE: &str = "appearance.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Settings I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings parse failed: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Settings encode failed: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("No configuration directory available on this platform")]
    NoConfigDir,
}

// =============================================================================
// Performance profiles
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerformanceProfile {
    Low,      // Optimized for low-end hardware
    Balanced, // Default for mid-range systems
    High,     // Maximum quality for high-end hardware
    Custom,   // User-defined granular controls
}

impl Default for PerformanceProfile {
    fn default() -> Self {
        Self::Balanced
    }
}

// =============================================================================
// Subsystem settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppearanceSettings {
    /// Discard level the viewer's own avatar must reach before uploading a bake.
    pub self_min_discard: i32,
    /// Discard level considered good enough for other avatars' local textures.
    pub others_min_discard: i32,
    /// Seconds without usable bake data before the self cache check is re-sent.
    #[serde(with = "duration_secs")]
    pub cache_check_timeout: Duration,
    /// Minimum spacing between two uploads of the same region.
    #[serde(with = "duration_secs")]
    pub min_upload_interval: Duration,
    /// Composite edge size for body regions.
    pub composite_size: u32,
    /// Composite edge size for the eyes region.
    pub eyes_composite_size: u32,
}

impl Default for AppearanceSettings {
    fn default() -> Self {
        Self {
            self_min_discard: 0,
            others_min_discard: 3,
            cache_check_timeout: Duration::from_secs(20),
            min_upload_interval: Duration::from_secs(5),
            composite_size: 512,
            eyes_composite_size: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OctreeSettings {
    /// Elements a node holds before new arrivals are pushed to children.
    pub max_capacity: usize,
    /// Half size of the initial root cell, meters.
    pub root_half_size: f32,
    /// The root never grows past this half size; larger objects stay in the root.
    pub max_root_half_size: f32,
    /// Nodes are never split below this half size.
    pub min_half_size: f32,
    /// Nodes rebuilt per partition per frame.
    pub geometry_rebuild_budget: usize,
}

impl Default for OctreeSettings {
    fn default() -> Self {
        Self {
            max_capacity: 128,
            root_half_size: 256.0,
            max_root_half_size: 4096.0,
            min_half_size: 0.5,
            geometry_rebuild_budget: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcclusionSettings {
    pub enabled: bool,
    /// Nodes closer than this to the eye are never occlusion tested.
    pub near_field_radius: f32,
    /// Slack added around node bounds when issuing a query.
    pub query_padding: f32,
}

impl Default for OcclusionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            near_field_radius: 4.0,
            query_padding: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LodSettings {
    /// User LOD bias slider; multiplies projected pixel area.
    pub lod_bias: f32,
    /// Visible avatars tolerated before pixel area is dampened.
    pub full_quality_avatar_count: u32,
    /// Lower clamp of the crowd dampening factor.
    pub min_crowd_factor: f32,
    /// Volume LOD factor (radius scaling).
    pub volume_lod_factor: f32,
    /// Tangent thresholds separating volume detail levels 0..=3.
    pub volume_detail_thresholds: [f32; 3],
}

impl Default for LodSettings {
    fn default() -> Self {
        Self {
            lod_bias: 1.0,
            full_quality_avatar_count: 10,
            min_crowd_factor: 0.25,
            volume_lod_factor: 1.25,
            volume_detail_thresholds: [0.03, 0.06, 0.24],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpostorSettings {
    pub enabled: bool,
    /// Avatars ranked below this render at full detail.
    pub max_non_impostors: u32,
    /// Update period at or above which an avatar is drawn as an impostor.
    pub impostor_period: u32,
    /// Slowest period for avatars that are not muted.
    pub max_update_period: u32,
    /// Period applied to muted/blocked avatars.
    pub muted_update_period: u32,
    /// Pixel area at which the area term yields the impostor period.
    pub reference_area: f32,
    /// Ranks beyond the nearest band per extra frame of period.
    pub ranks_per_period_step: u32,
    /// Near plane distance of the impostor capture camera.
    pub capture_near_clip: f32,
    /// View angle change (radians) tolerated at `reference_distance`.
    pub angle_threshold: f32,
    pub reference_distance: f32,
    /// Relative camera distance change that invalidates a billboard.
    pub distance_change_ratio: f32,
    /// Absolute extents change (meters) that invalidates a billboard.
    pub extents_tolerance: f32,
    pub max_regenerations_per_frame: usize,
}

impl Default for ImpostorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_non_impostors: 16,
            impostor_period: 2,
            max_update_period: 16,
            muted_update_period: 64,
            reference_area: 256.0 * 512.0 * 0.125,
            ranks_per_period_step: 8,
            capture_near_clip: 0.1,
            angle_threshold: 0.05,
            reference_distance: 32.0,
            distance_change_ratio: 0.1,
            extents_tolerance: 0.05,
            max_regenerations_per_frame: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Worker threads decoding fetched textures. Zero means derive from the CPU count.
    pub decode_threads: usize,
    /// Completion events drained per frame before yielding to rendering.
    pub max_completions_per_frame: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            decode_threads: 0,
            max_completions_per_frame: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerSettings {
    pub profile: PerformanceProfile,
    pub appearance: AppearanceSettings,
    pub octree: OctreeSettings,
    pub occlusion: OcclusionSettings,
    pub lod: LodSettings,
    pub impostor: ImpostorSettings,
    pub fetch: FetchSettings,
}

impl ViewerSettings {
    pub fn for_profile(profile: PerformanceProfile) -> Self {
        let mut settings = Self::default();
        settings.profile = profile;

        match profile {
            PerformanceProfile::Low => {
                settings.lod.lod_bias = 0.5;
                settings.lod.full_quality_avatar_count = 4;
                settings.impostor.max_non_impostors = 4;
                settings.impostor.max_update_period = 32;
                settings.impostor.max_regenerations_per_frame = 2;
                settings.octree.geometry_rebuild_budget = 8;
                settings.fetch.decode_threads = 1;
            }
            PerformanceProfile::Balanced => {}
            PerformanceProfile::High => {
                settings.lod.lod_bias = 2.0;
                settings.lod.full_quality_avatar_count = 24;
                settings.impostor.max_non_impostors = 32;
                settings.impostor.max_update_period = 8;
                settings.impostor.max_regenerations_per_frame = 8;
                settings.octree.geometry_rebuild_budget = 128;
            }
            PerformanceProfile::Custom => {
                // Defaults that the user edits field by field
            }
        }

        settings
    }
}

/// Serialize durations as fractional seconds so the TOML stays hand editable.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

// =============================================================================
// Persistence
// =============================================================================

fn settings_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "slv", "slv-appearance")
        .map(|proj| proj.config_dir().join(SETTINGS_FILE))
}

pub fn save_settings_to_path(settings: &ViewerSettings, path: &Path) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let toml = toml::to_string_pretty(settings)?;
    fs::write(path, toml)?;
    Ok(())
}

pub fn load_settings_from_path(path: &Path) -> Result<ViewerSettings, SettingsError> {
    let data = fs::read_to_string(path)?;
    Ok(toml::from_str::<ViewerSettings>(&data)?)
}

pub fn save_settings(settings: &ViewerSettings) -> Result<(), SettingsError> {
    let path = settings_path().ok_or(SettingsError::NoConfigDir)?;
    save_settings_to_path(settings, &path)
}

/// Load the persisted settings, `None` when absent or unreadable.
pub fn load_settings() -> Option<ViewerSettings> {
    let path = settings_path()?;
    if !path.exists() {
        return None;
    }
    match load_settings_from_path(&path) {
        Ok(settings) => Some(settings),
        Err(e) => {
            tracing::warn!("Ignoring unreadable settings at {:?}: {}", path, e);
            None
        }
    }
}
