use std::collections::HashMap;

use glam::{Quat, Vec3};

use crate::anim::AnimDecoder;
use crate::asset::{
    AnimationTrack, Asset, Bone, FinalMesh, FinalVertex, Material, PhysBody, PhysJoint, PhysShape,
    Skeleton, SkinWeight,
};
use crate::blob::BlobStore;
use crate::error::DecodeError;
use crate::mdl::{MdlBone, MdlModelData, MdlReader};
use crate::phy::{PhyData, PhyReader, PhySolid};
use crate::tex::TexDecoder;
use crate::vtx::{VtxBodyPart, VtxReader};
use crate::vvd::{VvdReader, VvdVertex};

const SEQ_LOOPING: i32 = 0x0001;
const MAX_HULL_VERTICES_BEFORE_AABB: usize = 64;

/// Tracks how far a decode got, purely for diagnostics: a failure at any
/// stage drives the whole decode to a placeholder asset, so nothing here is
/// branched on by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeStage {
    Open,
    HeaderParsed,
    SkeletonReady,
    MeshesReady,
    MaterialsReady,
    AnimsReady,
    PhysicsReady,
}

fn trace_stage(model_path: &str, stage: DecodeStage) {
    log::debug!("{} reached {:?}", model_path, stage);
}

/// Joins MDL + VVD + VTX + PHY + ANI + textures into the neutral `Asset`
/// output. This is the only component that reaches across the other
/// readers' outputs; everything upstream of it is format-local.
pub struct Assembler;

impl Assembler {
    /// Decodes `model_path` against `store`, never failing: a fatal error at
    /// any stage degrades the result to a small placeholder asset. Returns
    /// `None` only on cooperative cancellation via `abort`.
    pub fn decode(store: &dyn BlobStore, model_path: &str, abort: &dyn Fn() -> bool) -> Option<Asset> {
        if abort() {
            return None;
        }

        let mdl = match load_mdl(store, model_path) {
            Ok(mdl) => mdl,
            Err(e) => {
                log::warn!("{} never left {:?}: {}", model_path, DecodeStage::Open, e);
                return Some(Asset::placeholder(model_name(model_path)));
            }
        };
        trace_stage(model_path, DecodeStage::HeaderParsed);

        if abort() {
            return None;
        }

        let skeleton = build_skeleton(&mdl.bones);
        trace_stage(model_path, DecodeStage::SkeletonReady);

        if abort() {
            return None;
        }

        let vvd_vertices = match load_vvd(store, model_path) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("{} stalled after {:?}: {}", model_path, DecodeStage::SkeletonReady, e);
                return Some(Asset::placeholder(mdl.name.clone()));
            }
        };

        let vtx_body_parts = match load_vtx(store, model_path) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("{} stalled after {:?}: {}", model_path, DecodeStage::SkeletonReady, e);
                return Some(Asset::placeholder(mdl.name.clone()));
            }
        };

        if abort() {
            return None;
        }

        let meshes = build_meshes(model_path, &mdl, &vvd_vertices, &vtx_body_parts, !skeleton.is_empty());
        trace_stage(model_path, DecodeStage::MeshesReady);

        if abort() {
            return None;
        }

        let materials = build_materials(store, &mdl);
        trace_stage(model_path, DecodeStage::MaterialsReady);

        if abort() {
            return None;
        }

        let animations = build_animations(store, model_path, &mdl);
        trace_stage(model_path, DecodeStage::AnimsReady);

        if abort() {
            return None;
        }

        let (bodies, joints) = build_physics(store, model_path, &mdl.bones, &skeleton);
        trace_stage(model_path, DecodeStage::PhysicsReady);

        Some(Asset {
            name: mdl.name.clone(),
            skeleton,
            meshes,
            materials,
            animations,
            bodies,
            joints,
        })
    }
}

fn model_name(model_path: &str) -> String {
    std::path::Path::new(model_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(model_path)
        .to_string()
}

fn load_mdl(store: &dyn BlobStore, model_path: &str) -> Result<MdlModelData, DecodeError> {
    let blob = store.read(model_path)?;
    MdlReader::decode(model_path, &blob.data)
}

fn companion_path(model_path: &str, new_extension: &str) -> String {
    match model_path.rsplit_once('.') {
        Some((stem, _)) => format!("{}.{}", stem, new_extension),
        None => format!("{}.{}", model_path, new_extension),
    }
}

fn load_vvd(store: &dyn BlobStore, model_path: &str) -> Result<Vec<VvdVertex>, DecodeError> {
    let path = companion_path(model_path, "vvd");
    let blob = store.read(&path).map_err(|_| DecodeError::MissingCompanion {
        model_path: model_path.to_string(),
        companion: "vvd",
    })?;
    VvdReader::decode(&path, &blob.data)
}

const VTX_VARIANTS: &[&str] = &["dx90.vtx", "dx80.vtx", "sw.vtx"];

fn load_vtx(store: &dyn BlobStore, model_path: &str) -> Result<Vec<VtxBodyPart>, DecodeError> {
    for variant in VTX_VARIANTS {
        let path = companion_path(model_path, variant);
        if let Ok(blob) = store.read(&path) {
            return VtxReader::decode(&path, &blob.data);
        }
    }
    Err(DecodeError::MissingCompanion {
        model_path: model_path.to_string(),
        companion: "vtx",
    })
}

fn load_phy(store: &dyn BlobStore, model_path: &str) -> Option<PhyData> {
    let path = companion_path(model_path, "phy");
    let blob = store.read(&path).ok()?;
    match PhyReader::decode(&path, &blob.data) {
        Ok(data) => Some(data),
        Err(e) => {
            log::warn!("skipping malformed PHY companion for {}: {}", model_path, e);
            None
        }
    }
}

fn load_ani(store: &dyn BlobStore, model_path: &str) -> Option<Vec<u8>> {
    let path = companion_path(model_path, "ani");
    store.read(&path).ok().map(|b| b.data)
}

/// `world[i] = world[parent] . local[i]`, composed in bone order (parents
/// always precede children in the bone table).
fn compute_world_rest(bones: &[MdlBone]) -> Vec<(Vec3, Quat)> {
    let mut world = Vec::with_capacity(bones.len());
    for bone in bones {
        let (pos, rot) = if bone.parent_index >= 0 {
            let (parent_pos, parent_rot) = world[bone.parent_index as usize];
            (parent_pos + parent_rot * bone.position, parent_rot * bone.rotation)
        } else {
            (bone.position, bone.rotation)
        };
        world.push((pos, rot));
    }
    world
}

fn build_skeleton(bones: &[MdlBone]) -> Skeleton {
    let world = compute_world_rest(bones);
    let out = bones
        .iter()
        .zip(world.iter())
        .map(|(bone, (world_position, world_rotation))| Bone {
            name: bone.name.clone(),
            parent_index: bone.parent_index,
            local_position: bone.position,
            local_rotation: bone.rotation,
            world_position: *world_position,
            world_rotation: *world_rotation,
        })
        .collect();
    Skeleton { bones: out }
}

fn quantize_weights(raw: &[(u8, f32)]) -> [SkinWeight; 4] {
    let mut slots = [SkinWeight::default(); 4];
    let used = raw.len().min(4);
    let mut scaled = [0u8; 4];
    for i in 0..used {
        scaled[i] = (raw[i].1 * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    let sum: u32 = scaled.iter().map(|&w| w as u32).sum();
    if used > 0 && sum != 255 {
        let (max_idx, _) = scaled
            .iter()
            .enumerate()
            .take(used)
            .max_by_key(|(_, w)| **w)
            .unwrap();
        let diff = 255i32 - sum as i32;
        scaled[max_idx] = (scaled[max_idx] as i32 + diff).clamp(0, 255) as u8;
    }
    for i in 0..used {
        slots[i] = SkinWeight {
            bone_index: raw[i].0,
            weight: scaled[i],
        };
    }
    slots
}

fn build_meshes(
    path: &str,
    mdl: &MdlModelData,
    vvd_vertices: &[VvdVertex],
    vtx_body_parts: &[VtxBodyPart],
    skinned: bool,
) -> Vec<FinalMesh> {
    let mut out = Vec::new();
    let mut running_vertex_offset: i64 = 0;

    for (bp_idx, mdl_bp) in mdl.body_parts.iter().enumerate() {
        let vtx_bp = vtx_body_parts.get(bp_idx);

        for (m_idx, mdl_model) in mdl_bp.models.iter().enumerate() {
            // `model_base` plays the role of `body-part-start + model-start`
            // combined: a single running accumulator over the full
            // body-part/model tree walked in file order.
            let model_base = running_vertex_offset;
            let vtx_model = vtx_bp.and_then(|bp| bp.models.get(m_idx));

            for (me_idx, mdl_mesh) in mdl_model.meshes.iter().enumerate() {
                let vtx_mesh = match vtx_model.and_then(|m| m.meshes.get(me_idx)) {
                    Some(m) => m,
                    None => {
                        log::warn!(
                            "skipping mesh with no VTX counterpart in {} (body part {}, model {}, mesh {})",
                            path,
                            bp_idx,
                            m_idx,
                            me_idx
                        );
                        continue;
                    }
                };

                let mesh_vertex_base = model_base + mdl_mesh.vertex_index_start as i64;
                let mut dedup: HashMap<i64, u32> = HashMap::new();
                let mut out_vertices: Vec<FinalVertex> = Vec::new();
                let mut out_indices: Vec<u32> = Vec::new();

                for strip_group in &vtx_mesh.strip_groups {
                    for tri in strip_group.indices.chunks(3) {
                        if tri.len() < 3 {
                            continue;
                        }
                        let mut corners = [0u32; 3];
                        let mut ok = true;
                        for (slot, &remap_idx) in corners.iter_mut().zip(tri.iter()) {
                            let remap_value = match strip_group.vertex_remap.get(remap_idx as usize) {
                                Some(v) => *v,
                                None => {
                                    ok = false;
                                    break;
                                }
                            };
                            let abs_vvd_index = mesh_vertex_base + remap_value as i64;
                            let vvd_vertex = match vvd_vertices.get(abs_vvd_index as usize) {
                                Some(v) => v,
                                None => {
                                    ok = false;
                                    break;
                                }
                            };
                            let out_index = *dedup.entry(abs_vvd_index).or_insert_with(|| {
                                let weights = if skinned {
                                    quantize_weights(&vvd_vertex.bone_weights)
                                } else {
                                    [SkinWeight::default(); 4]
                                };
                                out_vertices.push(FinalVertex {
                                    position: vvd_vertex.position,
                                    normal: vvd_vertex.normal,
                                    uv: vvd_vertex.uv,
                                    weights,
                                });
                                (out_vertices.len() - 1) as u32
                            });
                            *slot = out_index;
                        }
                        if !ok {
                            log::warn!("skipping malformed triangle in {} mesh {}/{}/{}", path, bp_idx, m_idx, me_idx);
                            continue;
                        }
                        // Flip winding: output (a, b, c) for source (a, c, b).
                        out_indices.push(corners[0]);
                        out_indices.push(corners[2]);
                        out_indices.push(corners[1]);
                    }
                }

                out.push(FinalMesh {
                    material_index: mdl_mesh.material_index.max(0) as usize,
                    vertices: out_vertices,
                    indices: out_indices,
                });
            }

            running_vertex_offset += mdl_model.num_vertices as i64;
        }
    }

    out
}

fn build_materials(store: &dyn BlobStore, mdl: &MdlModelData) -> Vec<Material> {
    mdl.textures
        .iter()
        .map(|texture| {
            for search_path in &mdl.texture_search_paths {
                let candidate = format!("materials/{}{}.tex", search_path, texture.name);
                if let Ok(blob) = store.read(&candidate) {
                    match TexDecoder::decode(&candidate, &blob.data) {
                        Ok(decoded) => {
                            return Material {
                                name: texture.name.clone(),
                                texture: Some(decoded),
                            }
                        }
                        Err(e) => log::warn!("failed to decode texture {}: {}", candidate, e),
                    }
                }
            }

            let fallback = format!("materials/{}.tex", texture.name);
            if let Ok(blob) = store.read(&fallback) {
                if let Ok(decoded) = TexDecoder::decode(&fallback, &blob.data) {
                    return Material {
                        name: texture.name.clone(),
                        texture: Some(decoded),
                    };
                }
            }

            log::warn!("falling back to default material for texture {}", texture.name);
            Material::default_material(texture.name.clone())
        })
        .collect()
}

fn build_animations(store: &dyn BlobStore, model_path: &str, mdl: &MdlModelData) -> Vec<AnimationTrack> {
    let ani_blob = if mdl.anim_blocks.is_empty() {
        None
    } else {
        load_ani(store, model_path)
    };

    let mdl_bytes = match store.read(model_path) {
        Ok(b) => b.data,
        Err(_) => return Vec::new(),
    };

    let mut out = Vec::new();
    for seq in &mdl.sequences {
        let anim_desc = match mdl.anim_descs.get(seq.anim_desc_index as usize) {
            Some(a) => a,
            None => {
                log::warn!("sequence {} references out-of-range anim desc in {}", seq.label, model_path);
                continue;
            }
        };

        match AnimDecoder::decode_sequence(
            model_path,
            &mdl.bones,
            &mdl_bytes,
            anim_desc,
            &mdl.anim_blocks,
            ani_blob.as_deref(),
        ) {
            Ok(frames) => out.push(AnimationTrack {
                name: seq.label.clone(),
                fps: anim_desc.fps,
                looping: seq.flags & SEQ_LOOPING != 0,
                frames,
            }),
            Err(e) => {
                log::warn!("skipping animation for sequence {} in {}: {}", seq.label, model_path, e);
            }
        }
    }
    out
}

const DEFAULT_BOX_HALF_EXTENT: f32 = 1.0;

fn default_box() -> PhysShape {
    PhysShape::AxisAlignedBox {
        min: Vec3::splat(-DEFAULT_BOX_HALF_EXTENT),
        max: Vec3::splat(DEFAULT_BOX_HALF_EXTENT),
    }
}

fn hull_to_shape(vertices: &[Vec3]) -> PhysShape {
    if vertices.len() > MAX_HULL_VERTICES_BEFORE_AABB {
        let mut min = vertices[0];
        let mut max = vertices[0];
        for v in vertices {
            min = min.min(*v);
            max = max.max(*v);
        }
        PhysShape::AxisAlignedBox { min, max }
    } else {
        PhysShape::Hull(vertices.to_vec())
    }
}

fn solid_bone_index(solid: &PhySolid, bone_count: usize) -> usize {
    solid
        .hulls
        .first()
        .map(|h| h.bone_index.max(0) as usize)
        .filter(|&idx| idx < bone_count)
        .unwrap_or(0)
}

fn build_physics(
    store: &dyn BlobStore,
    model_path: &str,
    bones: &[MdlBone],
    skeleton: &Skeleton,
) -> (Vec<PhysBody>, Vec<PhysJoint>) {
    let phy = match load_phy(store, model_path) {
        Some(p) => p,
        None => return (Vec::new(), Vec::new()),
    };

    if phy.solids.is_empty() {
        return (Vec::new(), Vec::new());
    }

    // Recomputed independently from the skeleton already emitted for
    // skinning, since joint placement needs world-space rest poses too.
    let world_rest = compute_world_rest(bones);

    let mut bodies = Vec::with_capacity(phy.solids.len());
    for solid in &phy.solids {
        let shapes: Vec<PhysShape> = if solid.hulls.is_empty() {
            vec![default_box()]
        } else {
            solid.hulls.iter().map(|h| hull_to_shape(&h.vertices)).collect()
        };
        bodies.push(PhysBody {
            bone_index: solid_bone_index(solid, skeleton.bones.len()),
            shapes,
        });
    }

    let mut body_by_bone: HashMap<usize, usize> = HashMap::new();
    for (body_index, body) in bodies.iter().enumerate() {
        body_by_bone.entry(body.bone_index).or_insert(body_index);
    }

    let mut joints = Vec::new();
    for (child_index, child_body) in bodies.iter().enumerate() {
        let mut ancestor = bones.get(child_body.bone_index).map(|b| b.parent_index);
        let mut parent_index = None;
        while let Some(bone_idx) = ancestor {
            if bone_idx < 0 {
                break;
            }
            if let Some(&candidate) = body_by_bone.get(&(bone_idx as usize)) {
                if candidate != child_index {
                    parent_index = Some(candidate);
                    break;
                }
            }
            ancestor = bones.get(bone_idx as usize).map(|b| b.parent_index);
        }

        let Some(parent_index) = parent_index else { continue };
        let parent_body = &bodies[parent_index];

        let (parent_pos, parent_rot) = world_rest[parent_body.bone_index];
        let (child_pos, child_rot) = world_rest[child_body.bone_index];
        let inv_parent_rot = parent_rot.inverse();

        let constraint = phy
            .constraints
            .iter()
            .find(|c| c.parent_solid == parent_index as i32 && c.child_solid == child_index as i32)
            .or_else(|| {
                phy.constraints.iter().find(|c| {
                    c.parent_solid == parent_body.bone_index as i32
                        && c.child_solid == child_body.bone_index as i32
                })
            });

        let (swing, twist_min, twist_max) = match constraint {
            Some(c) => (c.x_max.abs().max(c.y_max.abs()), c.z_min, c.z_max),
            None => (0.0, 0.0, 0.0),
        };

        joints.push(PhysJoint {
            parent_body: parent_index,
            child_body: child_index,
            frame1_position: inv_parent_rot * (child_pos - parent_pos),
            frame1_rotation: inv_parent_rot * child_rot,
            swing_limit_degrees: swing,
            twist_min_degrees: twist_min,
            twist_max_degrees: twist_max,
        });
    }

    (bodies, joints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdl::BoneFlags;

    fn bone(name: &str, parent: i32, pos: Vec3) -> MdlBone {
        MdlBone {
            name: name.to_string(),
            parent_index: parent,
            position: pos,
            rotation: Quat::IDENTITY,
            rotation_euler: Vec3::ZERO,
            pos_scale: Vec3::ONE,
            rot_scale: Vec3::ONE,
            pose_to_bone: [0.0; 12],
            flags: BoneFlags::empty(),
            surface_prop: String::new(),
            contents: 0,
        }
    }

    #[test]
    fn world_rest_composes_through_parent_chain() {
        let bones = vec![
            bone("root", -1, Vec3::new(1.0, 0.0, 0.0)),
            bone("child", 0, Vec3::new(0.0, 2.0, 0.0)),
        ];
        let world = compute_world_rest(&bones);
        assert_eq!(world[0].0, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(world[1].0, Vec3::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn single_bone_world_rest_equals_local_rest() {
        let bones = vec![bone("root", -1, Vec3::new(3.0, 4.0, 5.0))];
        let skeleton = build_skeleton(&bones);
        assert_eq!(skeleton.bones[0].world_position, skeleton.bones[0].local_position);
    }

    #[test]
    fn weight_quantization_sums_to_255() {
        let raw = vec![(0u8, 0.5f32), (1u8, 0.3), (2u8, 0.2)];
        let quantized = quantize_weights(&raw);
        let sum: u32 = quantized.iter().map(|w| w.weight as u32).sum();
        assert_eq!(sum, 255);
    }

    #[test]
    fn large_hull_becomes_aabb() {
        let verts: Vec<Vec3> = (0..65).map(|i| Vec3::splat(i as f32)).collect();
        let shape = hull_to_shape(&verts);
        assert!(matches!(shape, PhysShape::AxisAlignedBox { .. }));
    }

    #[test]
    fn small_hull_stays_a_hull() {
        let verts: Vec<Vec3> = (0..4).map(|i| Vec3::splat(i as f32)).collect();
        let shape = hull_to_shape(&verts);
        assert!(matches!(shape, PhysShape::Hull(_)));
    }
}
