//! Billboard substitution for distant or numerous avatars.
//!
//! Each visible avatar gets an update period in frames. Avatars at or above
//! the impostor period draw a cached billboard; the billboard is regenerated
//! when the view angle, distance or body extents drift too far from the values
//! it was captured with, a few per frame, stalest first.

use crate::config::ImpostorSettings;
use crate::rendering::backend::RenderBackend;
use crate::rendering::budget::FrameBudget;
use crate::rendering::camera::Camera;
use crate::utils::math::{angle_between, Aabb};
use glam::Vec3;
use std::collections::HashMap;
use tracing::{debug, trace};
use uuid::Uuid;

/// What a billboard was captured from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpostorCapture {
    pub billboard: Uuid,
    /// Unit direction from the camera to the avatar.
    pub view_dir: Vec3,
    pub distance: f32,
    pub extents: Vec3,
    pub frame: u64,
}

/// One visible avatar as seen this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AvatarView {
    pub id: Uuid,
    pub is_self: bool,
    pub muted: bool,
    /// Screen-space visibility rank; the viewer's own avatar is 0.
    pub rank: usize,
    pub pixel_area: f32,
    pub distance: f32,
    pub bounds: Aabb,
}

impl AvatarView {
    pub fn view_dir(&self, camera: &Camera) -> Vec3 {
        (self.bounds.center() - camera.origin).normalize_or_zero()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpostorState {
    pub update_period: u32,
    pub is_impostor: bool,
    pub capture: Option<ImpostorCapture>,
}

/// Per avatar outcome of one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpostorDecision {
    pub id: Uuid,
    pub update_period: u32,
    /// Billboard to draw instead of the skeletal meshes. `None` draws full geometry,
    /// including impostor avatars still waiting for their first capture.
    pub billboard: Option<Uuid>,
    pub regenerated: bool,
}

#[derive(Debug, Clone)]
pub struct ImpostorScheduler {
    settings: ImpostorSettings,
    states: HashMap<Uuid, ImpostorState>,
}

impl ImpostorScheduler {
    pub fn new(settings: ImpostorSettings) -> Self {
        Self {
            settings,
            states: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &ImpostorSettings {
        &self.settings
    }

    pub fn state(&self, id: &Uuid) -> Option<&ImpostorState> {
        self.states.get(id)
    }

    /// Drop billboard state for an avatar that left.
    pub fn forget(&mut self, id: &Uuid) {
        self.states.remove(id);
    }

    /// Frames between full updates of this avatar.
    pub fn update_period(&self, view: &AvatarView) -> u32 {
        let s = &self.settings;
        let min_period = s.impostor_period.max(2);
        if view.muted && !view.is_self {
            return s.muted_update_period.max(min_period);
        }
        if view.is_self || view.rank < s.max_non_impostors as usize {
            return 1;
        }
        if view.distance - view.bounds.radius() < s.capture_near_clip {
            return 1;
        }

        let area_period = (s.reference_area * 4.0 / view.pixel_area.max(1.0)).sqrt();
        let steps = (view.rank - s.max_non_impostors as usize) / s.ranks_per_period_step.max(1) as usize;
        let rank_period = (min_period as usize + steps) as f32;
        let max_period = s.max_update_period.max(min_period);
        (area_period.max(rank_period) as u32).clamp(min_period, max_period)
    }

    /// Normalized overshoot of the worst invalidation rule, if any fires.
    pub fn staleness(&self, capture: &ImpostorCapture, view: &AvatarView, camera: &Camera) -> Option<f32> {
        let s = &self.settings;
        let mut worst: Option<f32> = None;
        let mut consider = |value: f32, limit: f32| {
            if limit > 0.0 && value > limit {
                let score = value / limit;
                worst = Some(worst.map_or(score, |w: f32| w.max(score)));
            }
        };

        let distance_scale = (view.distance / s.reference_distance.max(0.001)).clamp(0.25, 4.0);
        consider(angle_between(view.view_dir(camera), capture.view_dir), s.angle_threshold * distance_scale);

        if capture.distance > 0.0 {
            consider((view.distance - capture.distance).abs() / capture.distance, s.distance_change_ratio);
        }

        let extents_delta = (view.bounds.half_extents() - capture.extents).abs().max_element();
        consider(extents_delta, s.extents_tolerance);

        worst
    }

    /// Decide impostor use for every visible avatar and regenerate stale billboards.
    pub fn schedule(
        &mut self,
        views: &[AvatarView],
        camera: &Camera,
        backend: &mut dyn RenderBackend,
        budget: &mut FrameBudget,
        frame: u64,
    ) -> Vec<ImpostorDecision> {
        let mut decisions = Vec::with_capacity(views.len());
        let mut candidates: Vec<(f32, usize)> = Vec::new();

        for view in views {
            let update_period = self.update_period(view);
            let is_impostor = self.settings.enabled && update_period >= self.settings.impostor_period.max(2);
            let capture = self.states.get(&view.id).and_then(|s| s.capture);
            if is_impostor {
                let stale = match &capture {
                    None => Some(f32::INFINITY),
                    Some(capture) => self.staleness(capture, view, camera),
                };
                if let Some(score) = stale {
                    candidates.push((score, decisions.len()));
                }
            }

            let state = self.states.entry(view.id).or_default();
            state.update_period = update_period;
            state.is_impostor = is_impostor;
            decisions.push(ImpostorDecision {
                id: view.id,
                update_period,
                billboard: None,
                regenerated: false,
            });
        }

        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
        for &(score, index) in candidates.iter().take(self.settings.max_regenerations_per_frame) {
            let view = &views[index];
            let billboard = backend.capture_impostor(view.id, &view.bounds, camera);
            if let Some(state) = self.states.get_mut(&view.id) {
                state.capture = Some(ImpostorCapture {
                    billboard,
                    view_dir: view.view_dir(camera),
                    distance: view.distance,
                    extents: view.bounds.half_extents(),
                    frame,
                });
            }
            decisions[index].regenerated = true;
            budget.record_regeneration();
            trace!("Impostor for {} regenerated (staleness {:.2})", view.id, score);
        }
        if candidates.len() > self.settings.max_regenerations_per_frame {
            debug!(
                "{} stale impostors deferred to later frames",
                candidates.len() - self.settings.max_regenerations_per_frame
            );
        }

        for decision in &mut decisions {
            let Some(state) = self.states.get(&decision.id) else {
                continue;
            };
            if state.is_impostor {
                decision.billboard = state.capture.map(|c| c.billboard);
                if decision.billboard.is_some() {
                    budget.record_impostor();
                }
            }
        }
        decisions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendering::backend::RecordingBackend;
    use crate::rendering::camera::CameraSlot;

    fn view(rank: usize, distance: f32) -> AvatarView {
        let center = Vec3::new(distance, 0.0, 0.0);
        AvatarView {
            id: Uuid::new_v4(),
            is_self: false,
            muted: false,
            rank,
            pixel_area: 500.0,
            distance,
            bounds: Aabb::from_center_half_extents(center, Vec3::new(0.3, 0.3, 0.9)),
        }
    }

    fn camera() -> Camera {
        Camera::new(CameraSlot::WORLD, Vec3::ZERO, Vec3::X, 1.0, (512, 512))
    }

    #[test]
    fn test_nearest_band_and_self_never_impostor() {
        let scheduler = ImpostorScheduler::new(ImpostorSettings::default());
        assert_eq!(scheduler.update_period(&view(3, 50.0)), 1);
        let mut me = view(40, 50.0);
        me.is_self = true;
        assert_eq!(scheduler.update_period(&me), 1);
    }

    #[test]
    fn test_muted_gets_slowest_period() {
        let scheduler = ImpostorScheduler::new(ImpostorSettings::default());
        let mut muted = view(0, 50.0);
        muted.muted = true;
        assert_eq!(scheduler.update_period(&muted), 64);
    }

    #[test]
    fn test_near_clip_bypasses_impostor() {
        let scheduler = ImpostorScheduler::new(ImpostorSettings::default());
        assert_eq!(scheduler.update_period(&view(40, 0.5)), 1);
    }

    #[test]
    fn test_distant_rank_gets_bounded_period() {
        let scheduler = ImpostorScheduler::new(ImpostorSettings::default());
        let period = scheduler.update_period(&view(40, 80.0));
        assert!((2..=16).contains(&period));
    }

    #[test]
    fn test_regenerations_capped_per_frame() {
        let settings = ImpostorSettings { max_regenerations_per_frame: 2, ..ImpostorSettings::default() };
        let mut scheduler = ImpostorScheduler::new(settings);
        let views: Vec<_> = (20..25).map(|rank| view(rank, 60.0)).collect();
        let mut backend = RecordingBackend::new();
        let mut budget = FrameBudget::default();

        let decisions = scheduler.schedule(&views, &camera(), &mut backend, &mut budget, 1);
        assert_eq!(decisions.iter().filter(|d| d.regenerated).count(), 2);
        assert_eq!(decisions.iter().filter(|d| d.billboard.is_some()).count(), 2);
        assert_eq!(budget.regenerations(), 2);

        let decisions = scheduler.schedule(&views, &camera(), &mut backend, &mut budget, 2);
        assert_eq!(decisions.iter().filter(|d| d.billboard.is_some()).count(), 4);
        assert_eq!(backend.captures().len(), 4);
    }

    #[test]
    fn test_capture_stays_fresh_when_nothing_moves() {
        let mut scheduler = ImpostorScheduler::new(ImpostorSettings::default());
        let views = vec![view(30, 60.0)];
        let mut backend = RecordingBackend::new();
        let mut budget = FrameBudget::default();
        scheduler.schedule(&views, &camera(), &mut backend, &mut budget, 1);
        let decisions = scheduler.schedule(&views, &camera(), &mut backend, &mut budget, 2);
        assert!(!decisions[0].regenerated);
        assert!(decisions[0].billboard.is_some());
        assert_eq!(backend.captures().len(), 1);
    }
}
