//! Detail selection from projected screen area.

use crate::config::LodSettings;
use crate::rendering::budget::FrameBudget;
use crate::rendering::camera::Camera;
use crate::utils::math::projected_sphere_area;
use crate::world::skeleton::{JointMesh, MeshLod, SkeletonDefinition};

/// Number of discrete volume detail levels.
pub const VOLUME_DETAIL_LEVELS: u8 = 4;

/// Mesh variants currently chosen for one avatar, in skeleton mesh order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvatarLodState {
    selections: Vec<Option<usize>>,
    pixel_area: f32,
}

impl AvatarLodState {
    pub fn pixel_area(&self) -> f32 {
        self.pixel_area
    }

    pub fn selections(&self) -> &[Option<usize>] {
        &self.selections
    }

    /// Chosen variant for every mesh that has one.
    pub fn selected_meshes<'a>(&self, skeleton: &'a SkeletonDefinition) -> Vec<(&'a JointMesh, &'a MeshLod)> {
        skeleton_meshes(skeleton)
            .zip(&self.selections)
            .filter_map(|(mesh, selection)| selection.and_then(|i| mesh.lods.get(i)).map(|lod| (mesh, lod)))
            .collect()
    }
}

fn skeleton_meshes(skeleton: &SkeletonDefinition) -> impl Iterator<Item = &JointMesh> {
    skeleton.mesh_joints().flat_map(|(_, joint)| joint.meshes.iter())
}

#[derive(Debug, Clone)]
pub struct LodSelector {
    settings: LodSettings,
}

impl LodSelector {
    pub fn new(settings: LodSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LodSettings {
        &self.settings
    }

    /// Dampening applied when more avatars are visible than render at full quality.
    pub fn crowd_factor(&self, visible_avatars: usize) -> f32 {
        let full = self.settings.full_quality_avatar_count.max(1) as f32;
        let visible = visible_avatars.max(1) as f32;
        (full / visible).clamp(self.settings.min_crowd_factor.clamp(0.0, 1.0), 1.0)
    }

    /// Undamped projected area of a bounding sphere.
    pub fn raw_pixel_area(&self, camera: &Camera, radius: f32, distance: f32) -> f32 {
        projected_sphere_area(radius, distance, camera.pixels_per_meter_at_unit())
    }

    /// Area used for avatar mesh selection. `full_detail` covers the viewer's
    /// own avatar in first person or while editing appearance.
    pub fn avatar_pixel_area(&self, camera: &Camera, radius: f32, distance: f32, full_detail: bool, budget: &FrameBudget) -> f32 {
        if full_detail {
            return f32::MAX;
        }
        self.raw_pixel_area(camera, radius, distance) * self.settings.lod_bias.max(0.0) * self.crowd_factor(budget.visible_avatars())
    }

    /// Finest variant whose threshold the area reaches. `None` below every threshold.
    pub fn select_lod(&self, mesh: &JointMesh, pixel_area: f32) -> Option<usize> {
        mesh.lods.iter().rposition(|lod| lod.min_pixel_area <= pixel_area)
    }

    /// Re-select every mesh of an avatar. Returns the number of meshes that switched variant.
    pub fn update_avatar(&self, skeleton: &SkeletonDefinition, state: &mut AvatarLodState, pixel_area: f32) -> usize {
        let selections: Vec<Option<usize>> = skeleton_meshes(skeleton).map(|mesh| self.select_lod(mesh, pixel_area)).collect();
        let changes = if state.selections.len() == selections.len() {
            state.selections.iter().zip(&selections).filter(|(a, b)| a != b).count()
        } else {
            selections.len()
        };
        state.selections = selections;
        state.pixel_area = pixel_area;
        changes
    }

    /// Discrete detail (0 coarsest ..= 3 finest) for a non-avatar volume.
    pub fn volume_detail(&self, radius: f32, distance: f32) -> u8 {
        let distance = distance.max(0.001);
        let tan_angle = (radius.max(0.0).sqrt() * self.settings.volume_lod_factor / distance * 100.0).round() / 100.0;
        self.settings
            .volume_detail_thresholds
            .iter()
            .position(|&threshold| tan_angle <= threshold)
            .map_or(VOLUME_DETAIL_LEVELS - 1, |i| i as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendering::camera::CameraSlot;
    use crate::world::skeleton::MeshRef;
    use glam::Vec3;

    fn mesh() -> JointMesh {
        JointMesh {
            name: "body".into(),
            region: None,
            lods: [0.0, 100.0, 1000.0]
                .iter()
                .map(|&a| MeshLod { min_pixel_area: a, mesh: MeshRef::new(format!("{a}"), None) })
                .collect(),
        }
    }

    #[test]
    fn test_select_finest_reached_threshold() {
        let selector = LodSelector::new(LodSettings::default());
        let mesh = mesh();
        assert_eq!(selector.select_lod(&mesh, 50.0), Some(0));
        assert_eq!(selector.select_lod(&mesh, 100.0), Some(1));
        assert_eq!(selector.select_lod(&mesh, 1e9), Some(2));
        assert_eq!(selector.select_lod(&mesh, -1.0), None);
    }

    #[test]
    fn test_crowd_factor_is_floor_clamped() {
        let selector = LodSelector::new(LodSettings::default());
        assert_eq!(selector.crowd_factor(1), 1.0);
        assert_eq!(selector.crowd_factor(10), 1.0);
        assert!((selector.crowd_factor(20) - 0.5).abs() < 1e-6);
        assert_eq!(selector.crowd_factor(10_000), 0.25);
    }

    #[test]
    fn test_full_detail_overrides_area() {
        let selector = LodSelector::new(LodSettings::default());
        let camera = Camera::new(CameraSlot::WORLD, Vec3::ZERO, Vec3::X, 1.0, (512, 512));
        let mut budget = FrameBudget::default();
        budget.set_visible_avatars(500);
        budget.finalize();
        assert_eq!(selector.avatar_pixel_area(&camera, 1.0, 200.0, true, &budget), f32::MAX);
        assert!(selector.avatar_pixel_area(&camera, 1.0, 200.0, false, &budget) < 1000.0);
    }

    #[test]
    fn test_update_avatar_counts_changes() {
        let selector = LodSelector::new(LodSettings::default());
        let skeleton = SkeletonDefinition::default();
        let mut state = AvatarLodState::default();
        let first = selector.update_avatar(&skeleton, &mut state, 5000.0);
        assert!(first > 0);
        assert_eq!(selector.update_avatar(&skeleton, &mut state, 5000.0), 0);
        assert!(selector.update_avatar(&skeleton, &mut state, 150.0) > 0);
        assert_eq!(state.selected_meshes(&skeleton).len(), first);
    }

    #[test]
    fn test_volume_detail_drops_with_distance() {
        let selector = LodSelector::new(LodSettings::default());
        assert_eq!(selector.volume_detail(4.0, 5.0), 3);
        assert_eq!(selector.volume_detail(4.0, 20.0), 2);
        assert_eq!(selector.volume_detail(4.0, 60.0), 1);
        assert_eq!(selector.volume_detail(4.0, 200.0), 0);
    }
}
