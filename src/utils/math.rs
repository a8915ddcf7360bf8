use glam::Vec3;
use std::fmt;

/// Axis aligned bounding box in region-local meters.
///
/// Invariant: `min <= max` on every axis for any box built through `new`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

impl Aabb {
    /// Build a box from two corners, sorting components per axis.
    pub fn new(a: Vec3, b: Vec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn from_center_half_extents(center: Vec3, half: Vec3) -> Self {
        let half = half.abs();
        Self {
            min: center - half,
            max: center + half,
        }
    }

    /// Inverted box that any `union` replaces outright.
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        if self.is_empty() {
            Vec3::ZERO
        } else {
            (self.max - self.min) * 0.5
        }
    }

    /// Radius of the sphere enclosing the box.
    pub fn radius(&self) -> f32 {
        self.half_extents().length()
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// True if `other` lies entirely inside this box, with `epsilon` slack.
    pub fn contains(&self, other: &Aabb, epsilon: f32) -> bool {
        if other.is_empty() {
            return true;
        }
        let slack = Vec3::splat(epsilon);
        (other.min + slack).cmpge(self.min).all() && (other.max - slack).cmple(self.max).all()
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Distance from `p` to the closest point of the box (zero inside).
    pub fn distance_to_point(&self, p: Vec3) -> f32 {
        let clamped = p.clamp(self.min, self.max);
        (p - clamped).length()
    }

    pub fn expanded(&self, amount: f32) -> Aabb {
        Aabb {
            min: self.min - Vec3::splat(amount),
            max: self.max + Vec3::splat(amount),
        }
    }
}

impl fmt::Display for Aabb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.2}, {:.2}, {:.2}]-[{:.2}, {:.2}, {:.2}]",
            self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z
        )
    }
}

/// Screen area in pixels covered by a sphere of `radius` at `distance`.
///
/// `pixels_per_meter_at_unit` is the camera's pixel/meter ratio one meter in
/// front of the eye point.
pub fn projected_sphere_area(radius: f32, distance: f32, pixels_per_meter_at_unit: f32) -> f32 {
    let distance = distance.max(radius).max(0.001);
    let pixel_radius = radius * pixels_per_meter_at_unit / distance;
    std::f32::consts::PI * pixel_radius * pixel_radius
}

/// Angle in radians between two directions; zero when either is degenerate.
pub fn angle_between(a: Vec3, b: Vec3) -> f32 {
    let (Some(a), Some(b)) = (a.try_normalize(), b.try_normalize()) else {
        return 0.0;
    };
    a.dot(b).clamp(-1.0, 1.0).acos()
}
