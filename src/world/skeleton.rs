//! Fixed joint hierarchy and per-joint mesh detail lists.
//!
//! Built once at avatar construction from the loader's output and never
//! mutated afterwards.

use crate::world::avatar::BakedRegion;
use glam::{Quat, Vec3};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SkeletonError {
    #[error("Joint {joint} refers to parent {parent} which is not defined before it")]
    BadParent { joint: String, parent: usize },

    #[error("Duplicate joint name {0}")]
    DuplicateJoint(String),

    #[error("Mesh LOD threshold {threshold} for joint {joint} is not a finite non-negative area")]
    BadThreshold { joint: String, threshold: f32 },
}

/// Reference to loaded mesh data, plus the baked region it is textured with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshRef {
    pub name: String,
    pub region: Option<BakedRegion>,
}

impl MeshRef {
    pub fn new(name: impl Into<String>, region: Option<BakedRegion>) -> Self {
        Self { name: name.into(), region }
    }
}

/// One detail variant: used once the projected pixel area reaches `min_pixel_area`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshLod {
    pub min_pixel_area: f32,
    pub mesh: MeshRef,
}

/// A body mesh attached to a joint with its detail variants.
#[derive(Debug, Clone, PartialEq)]
pub struct JointMesh {
    pub name: String,
    pub region: Option<BakedRegion>,
    /// Ascending by `min_pixel_area`.
    pub lods: Vec<MeshLod>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JointDefinition {
    pub name: String,
    pub parent: Option<usize>,
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub pivot: Vec3,
    pub meshes: Vec<JointMesh>,
}

impl JointDefinition {
    pub fn new(name: impl Into<String>, parent: Option<usize>, position: Vec3) -> Self {
        Self {
            name: name.into(),
            parent,
            position,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            pivot: Vec3::ZERO,
            meshes: Vec::new(),
        }
    }

    pub fn with_mesh(mut self, mesh: JointMesh) -> Self {
        self.meshes.push(mesh);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SkeletonDefinition {
    joints: Vec<JointDefinition>,
    by_name: HashMap<String, usize>,
}

impl SkeletonDefinition {
    /// Validate and freeze a joint list. Parents must precede children.
    pub fn new(mut joints: Vec<JointDefinition>) -> Result<Self, SkeletonError> {
        let mut by_name = HashMap::with_capacity(joints.len());
        for (i, joint) in joints.iter_mut().enumerate() {
            if let Some(parent) = joint.parent {
                if parent >= i {
                    return Err(SkeletonError::BadParent { joint: joint.name.clone(), parent });
                }
            }
            for mesh in &mut joint.meshes {
                if let Some(lod) = mesh
                    .lods
                    .iter()
                    .find(|lod| !lod.min_pixel_area.is_finite() || lod.min_pixel_area < 0.0)
                {
                    return Err(SkeletonError::BadThreshold {
                        joint: joint.name.clone(),
                        threshold: lod.min_pixel_area,
                    });
                }
                mesh.lods.sort_by(|a, b| a.min_pixel_area.total_cmp(&b.min_pixel_area));
            }
            if by_name.insert(joint.name.clone(), i).is_some() {
                return Err(SkeletonError::DuplicateJoint(joint.name.clone()));
            }
        }
        Ok(Self { joints, by_name })
    }

    pub fn joints(&self) -> &[JointDefinition] {
        &self.joints
    }

    pub fn joint(&self, index: usize) -> Option<&JointDefinition> {
        self.joints.get(index)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Joints that carry renderable meshes.
    pub fn mesh_joints(&self) -> impl Iterator<Item = (usize, &JointDefinition)> {
        self.joints.iter().enumerate().filter(|(_, joint)| !joint.meshes.is_empty())
    }

    /// Rest-pose position of a joint in avatar space.
    pub fn world_position(&self, index: usize) -> Vec3 {
        let mut position = Vec3::ZERO;
        let mut current = Some(index);
        while let Some(i) = current {
            let Some(joint) = self.joints.get(i) else {
                break;
            };
            position += joint.position;
            current = joint.parent;
        }
        position
    }
}

fn body_mesh(base: &str, region: BakedRegion) -> JointMesh {
    let lods = [(0.0, 3), (100.0, 2), (400.0, 1), (1600.0, 0)]
        .into_iter()
        .map(|(min_pixel_area, level)| MeshLod {
            min_pixel_area,
            mesh: MeshRef::new(format!("{base}_lod{level}"), Some(region)),
        })
        .collect();
    JointMesh {
        name: base.to_string(),
        region: Some(region),
        lods,
    }
}

impl Default for SkeletonDefinition {
    /// Reduced base avatar skeleton with the body meshes attached.
    fn default() -> Self {
        let joints = vec![
            JointDefinition::new("mPelvis", None, Vec3::new(0.0, 0.0, 1.067))
                .with_mesh(body_mesh("lowerBodyMesh", BakedRegion::LowerBody))
                .with_mesh(body_mesh("skirtMesh", BakedRegion::Skirt)),
            JointDefinition::new("mTorso", Some(0), Vec3::new(0.0, 0.0, 0.084)),
            JointDefinition::new("mChest", Some(1), Vec3::new(-0.015, 0.0, 0.205))
                .with_mesh(body_mesh("upperBodyMesh", BakedRegion::UpperBody)),
            JointDefinition::new("mNeck", Some(2), Vec3::new(-0.01, 0.0, 0.251)),
            JointDefinition::new("mHead", Some(3), Vec3::new(0.0, 0.0, 0.076))
                .with_mesh(body_mesh("headMesh", BakedRegion::Head))
                .with_mesh(body_mesh("hairMesh", BakedRegion::Hair)),
            JointDefinition::new("mEyeLeft", Some(4), Vec3::new(0.098, 0.036, 0.079))
                .with_mesh(body_mesh("eyeBallLeftMesh", BakedRegion::Eyes)),
            JointDefinition::new("mEyeRight", Some(4), Vec3::new(0.098, -0.036, 0.079))
                .with_mesh(body_mesh("eyeBallRightMesh", BakedRegion::Eyes)),
            JointDefinition::new("mHipLeft", Some(0), Vec3::new(0.034, 0.127, -0.041)),
            JointDefinition::new("mHipRight", Some(0), Vec3::new(0.034, -0.129, -0.041)),
        ];
        // The table above is well formed; a failure here is a programming error.
        match Self::new(joints) {
            Ok(skeleton) => skeleton,
            Err(e) => panic!("built-in skeleton is invalid: {e}"),
        }
    }
}
