//! Read-only per-frame camera description used by culling, LOD and impostor decisions.

use crate::utils::math::Aabb;
use glam::{Mat4, Vec3, Vec4};

/// Number of camera slots tracked per spatial node.
pub const MAX_CAMERAS: usize = 4;

/// Index of a camera slot (world view, shadow maps, reflection...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraSlot(usize);

impl CameraSlot {
    pub const WORLD: CameraSlot = CameraSlot(0);

    /// `None` if `index` is outside the tracked range.
    pub fn new(index: usize) -> Option<Self> {
        (index < MAX_CAMERAS).then_some(Self(index))
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Six inward facing planes (left, right, bottom, top, near, far).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Gribb-Hartmann extraction from a view projection matrix.
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let rows = [vp.row(0), vp.row(1), vp.row(2), vp.row(3)];
        let mut planes = [
            rows[3] + rows[0],
            rows[3] - rows[0],
            rows[3] + rows[1],
            rows[3] - rows[1],
            // glam's right handed perspective maps depth to 0..1
            rows[2],
            rows[3] - rows[2],
        ];
        for plane in &mut planes {
            let len = plane.truncate().length();
            if len > 0.0 {
                *plane /= len;
            }
        }
        Self { planes }
    }

    /// Conservative box test: may accept boxes just outside a corner, never
    /// rejects a box that is partly inside.
    pub fn intersects(&self, aabb: &Aabb) -> bool {
        if aabb.is_empty() {
            return false;
        }
        self.planes.iter().all(|plane| {
            let normal = plane.truncate();
            let p = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            normal.dot(p) + plane.w >= 0.0
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub slot: CameraSlot,
    pub origin: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    /// Viewport height in pixels.
    pub viewport_height: u32,
    frustum: Frustum,
}

impl Camera {
    pub fn new(slot: CameraSlot, origin: Vec3, target: Vec3, fov_y: f32, viewport: (u32, u32)) -> Self {
        let forward = (target - origin).try_normalize().unwrap_or(Vec3::X);
        let aspect = viewport.0.max(1) as f32 / viewport.1.max(1) as f32;
        let mut camera = Self {
            slot,
            origin,
            forward,
            // Z up, as the simulator's region coordinates are
            up: Vec3::Z,
            fov_y,
            aspect,
            near: 0.1,
            far: 512.0,
            viewport_height: viewport.1.max(1),
            frustum: Frustum { planes: [Vec4::ZERO; 6] },
        };
        camera.refresh();
        camera
    }

    pub fn with_clip(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self.refresh();
        self
    }

    /// Move the eye point, keeping the view direction.
    pub fn set_origin(&mut self, origin: Vec3) {
        self.origin = origin;
        self.refresh();
    }

    pub fn look_at(&mut self, origin: Vec3, target: Vec3) {
        self.origin = origin;
        self.forward = (target - origin).try_normalize().unwrap_or(self.forward);
        self.refresh();
    }

    fn refresh(&mut self) {
        self.frustum = Frustum::from_view_projection(&self.view_projection());
    }

    pub fn view(&self) -> Mat4 {
        let up = if self.forward.cross(self.up).length_squared() < 1e-6 {
            Vec3::Y
        } else {
            self.up
        };
        Mat4::look_to_rh(self.origin, self.forward, up)
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }

    pub fn frustum(&self) -> &Frustum {
        &self.frustum
    }

    pub fn left(&self) -> Vec3 {
        self.up.cross(self.forward).normalize_or_zero()
    }

    /// Pixels covered by one meter, one meter in front of the eye.
    pub fn pixels_per_meter_at_unit(&self) -> f32 {
        self.viewport_height as f32 / (2.0 * (self.fov_y * 0.5).tan())
    }

    /// Meters covered by one pixel at `distance`.
    pub fn meters_per_pixel(&self, distance: f32) -> f32 {
        distance.max(self.near) / self.pixels_per_meter_at_unit()
    }

    pub fn distance_to(&self, point: Vec3) -> f32 {
        self.origin.distance(point)
    }

    pub fn is_visible(&self, aabb: &Aabb) -> bool {
        self.frustum.intersects(aabb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Camera {
        Camera::new(CameraSlot::WORLD, Vec3::ZERO, Vec3::X, 60f32.to_radians(), (1024, 768))
    }

    #[test]
    fn test_frustum_accepts_ahead_rejects_behind() {
        let camera = camera();
        let ahead = Aabb::from_center_half_extents(Vec3::new(20.0, 0.0, 0.0), Vec3::ONE);
        let behind = Aabb::from_center_half_extents(Vec3::new(-20.0, 0.0, 0.0), Vec3::ONE);
        let beyond_far = Aabb::from_center_half_extents(Vec3::new(600.0, 0.0, 0.0), Vec3::ONE);
        assert!(camera.is_visible(&ahead));
        assert!(!camera.is_visible(&behind));
        assert!(!camera.is_visible(&beyond_far));
        assert!(!camera.is_visible(&Aabb::empty()));
    }

    #[test]
    fn test_pixels_per_meter() {
        let camera = Camera::new(CameraSlot::WORLD, Vec3::ZERO, Vec3::X, std::f32::consts::FRAC_PI_2, (800, 800));
        assert!((camera.pixels_per_meter_at_unit() - 400.0).abs() < 1e-3);
        assert!((camera.meters_per_pixel(400.0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_camera_slots_bounded() {
        assert!(CameraSlot::new(MAX_CAMERAS - 1).is_some());
        assert!(CameraSlot::new(MAX_CAMERAS).is_none());
    }
}
