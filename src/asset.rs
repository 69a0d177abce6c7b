use glam::{Quat, Vec2, Vec3};

use crate::anim::BoneFrame;
use crate::tex::DecodedTexture;

/// One joint in the output skeleton, in **world space**.
#[derive(Debug, Clone)]
pub struct Bone {
    pub name: String,
    pub parent_index: i32,
    pub local_position: Vec3,
    pub local_rotation: Quat,
    pub world_position: Vec3,
    pub world_rotation: Quat,
}

#[derive(Debug, Clone, Default)]
pub struct Skeleton {
    pub bones: Vec<Bone>,
}

impl Skeleton {
    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    pub fn find_bone(&self, name: &str) -> Option<usize> {
        self.bones.iter().position(|b| b.name == name)
    }
}

/// One bone influence on a skinned vertex, quantized to a `u8` weight.
/// Unused slots carry `bone_index: 0, weight: 0`; across the full 4-slot
/// array the weights always sum to exactly 255.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkinWeight {
    pub bone_index: u8,
    pub weight: u8,
}

#[derive(Debug, Clone)]
pub struct FinalVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub weights: [SkinWeight; 4],
}

#[derive(Debug, Clone)]
pub struct FinalMesh {
    pub material_index: usize,
    pub vertices: Vec<FinalVertex>,
    /// Triangle list, three indices per triangle, into `vertices`.
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    pub texture: Option<DecodedTexture>,
}

impl Material {
    pub fn default_material(name: impl Into<String>) -> Material {
        Material {
            name: name.into(),
            texture: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnimationTrack {
    pub name: String,
    pub fps: f32,
    pub looping: bool,
    /// `frames[frame_index][bone_index]`, parent-local space.
    pub frames: Vec<Vec<BoneFrame>>,
}

#[derive(Debug, Clone)]
pub enum PhysShape {
    Hull(Vec<Vec3>),
    AxisAlignedBox { min: Vec3, max: Vec3 },
}

#[derive(Debug, Clone)]
pub struct PhysBody {
    pub bone_index: usize,
    pub shapes: Vec<PhysShape>,
}

#[derive(Debug, Clone)]
pub struct PhysJoint {
    pub parent_body: usize,
    pub child_body: usize,
    /// Child frame relative to the parent body, in the parent's local space.
    pub frame1_position: Vec3,
    pub frame1_rotation: Quat,
    pub swing_limit_degrees: f32,
    pub twist_min_degrees: f32,
    pub twist_max_degrees: f32,
}

/// The neutral output of a decode: meshes, skeleton, skinning, keyframe
/// animations, convex collision bodies, and joint constraints. The host
/// adapter consumes this record; it does not know or care which target
/// renderer or physics engine it feeds.
#[derive(Debug, Clone)]
pub struct Asset {
    pub name: String,
    pub skeleton: Skeleton,
    pub meshes: Vec<FinalMesh>,
    pub materials: Vec<Material>,
    pub animations: Vec<AnimationTrack>,
    pub bodies: Vec<PhysBody>,
    pub joints: Vec<PhysJoint>,
}

const PLACEHOLDER_CUBE_POSITIONS: [[f32; 3]; 8] = [
    [-1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [1.0, 1.0, -1.0],
    [-1.0, 1.0, -1.0],
    [-1.0, -1.0, 1.0],
    [1.0, -1.0, 1.0],
    [1.0, 1.0, 1.0],
    [-1.0, 1.0, 1.0],
];

const PLACEHOLDER_CUBE_INDICES: [u32; 36] = [
    0, 2, 1, 0, 3, 2, // back
    4, 5, 6, 4, 6, 7, // front
    0, 1, 5, 0, 5, 4, // bottom
    3, 7, 6, 3, 6, 2, // top
    1, 2, 6, 1, 6, 5, // right
    0, 4, 7, 0, 7, 3, // left
];

impl Asset {
    /// A small magenta cube, emitted whenever a fatal decode failure leaves
    /// no usable geometry to return instead.
    pub fn placeholder(name: impl Into<String>) -> Asset {
        let name = name.into();
        let vertices = PLACEHOLDER_CUBE_POSITIONS
            .iter()
            .map(|p| FinalVertex {
                position: Vec3::from(*p),
                normal: Vec3::from(*p).normalize_or_zero(),
                uv: Vec2::ZERO,
                weights: [SkinWeight::default(); 4],
            })
            .collect();

        Asset {
            name,
            skeleton: Skeleton::default(),
            meshes: vec![FinalMesh {
                material_index: 0,
                vertices,
                indices: PLACEHOLDER_CUBE_INDICES.to_vec(),
            }],
            materials: vec![Material::default_material("placeholder_magenta")],
            animations: Vec::new(),
            bodies: Vec::new(),
            joints: Vec::new(),
        }
    }
}
