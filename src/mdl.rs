use std::io::{Cursor, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use bitflags::bitflags;
use glam::{Quat, Vec3};

use crate::error::{DecodeError, DecodeResult};

const MIN_SUPPORTED_VERSION: i32 = 44;
const MAX_SUPPORTED_VERSION: i32 = 49;
const STUDIOHDR2_VERSION: i32 = 48;

bitflags! {
    /// Mirrors the bone record's on-disk `flags` field
    /// (`Jakobg1215-source-wrench::ProcessedBoneFlags`). The decoder does not
    /// branch on these; they are carried through to `Bone` for host
    /// consumption (bone-controller/procedural-bone features that would
    /// otherwise consume them are out of scope).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BoneFlags: i32 {
        const USED_BY_VERTEX = 0x0000_0400;
        const USED_BY_BONE_MERGE = 0x0000_0800;
        const USED_BY_VERTEX_LOD0 = 0x0000_0100;
        const USED_BY_VERTEX_LOD1 = 0x0000_0200;
    }
}

/// Follows a file-relative string offset and reads a NUL-terminated string,
/// preserving exact bytes (decoded lossily only if not valid UTF-8).
pub(crate) fn read_cstr_at(data: &[u8], offset: usize) -> String {
    if offset >= data.len() {
        return String::new();
    }
    let end = data[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| offset + p)
        .unwrap_or(data.len());
    String::from_utf8_lossy(&data[offset..end]).into_owned()
}

fn read_i32_at(data: &[u8], offset: usize) -> DecodeResult<i32> {
    data.get(offset..offset + 4)
        .map(|s| i32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or_else(|| DecodeError::malformed("mdl", "<model>", "offset out of bounds"))
}

#[derive(Debug, Clone)]
pub struct MdlBone {
    pub name: String,
    pub parent_index: i32,
    pub position: Vec3,
    pub rotation: Quat,
    pub rotation_euler: Vec3,
    pub pos_scale: Vec3,
    pub rot_scale: Vec3,
    pub pose_to_bone: [f32; 12],
    pub flags: BoneFlags,
    pub surface_prop: String,
    pub contents: i32,
}

#[derive(Debug, Clone)]
pub struct MdlTexture {
    pub name: String,
    pub flags: i32,
}

#[derive(Debug, Clone)]
pub struct MdlMesh {
    pub material_index: i32,
    pub num_vertices: i32,
    pub vertex_index_start: i32,
}

#[derive(Debug, Clone)]
pub struct MdlModel {
    pub name: String,
    /// Total vertex count of this model inside the VVD pool; body-part and
    /// model vertex-start accumulators advance by this amount once the
    /// model's meshes have all been walked.
    pub num_vertices: i32,
    pub meshes: Vec<MdlMesh>,
}

#[derive(Debug, Clone)]
pub struct MdlBodyPart {
    pub models: Vec<MdlModel>,
}

#[derive(Debug, Clone)]
pub struct MdlIncludeModel {
    pub label: String,
    pub filename: String,
}

#[derive(Debug, Clone, Copy)]
pub struct MdlAnimBlock {
    pub data_start: i32,
    pub data_end: i32,
}

#[derive(Debug, Clone)]
pub struct MdlAnimDesc {
    /// File offset of this record's own start, used to resolve embedded
    /// (anim_block_id == 0) animation streams.
    pub record_offset: usize,
    pub name: String,
    pub fps: f32,
    pub flags: i32,
    pub frame_count: i32,
    pub anim_block_id: i32,
    pub anim_offset: i32,
}

#[derive(Debug, Clone)]
pub struct MdlSequenceDesc {
    pub label: String,
    pub flags: i32,
    pub anim_desc_index: u16,
    pub group_size: [i32; 2],
}

#[derive(Debug, Clone)]
pub struct MdlModelData {
    pub name: String,
    pub version: i32,
    pub surface_prop: String,
    pub mass: f32,
    pub contents: i32,
    pub bones: Vec<MdlBone>,
    pub textures: Vec<MdlTexture>,
    pub texture_search_paths: Vec<String>,
    pub body_parts: Vec<MdlBodyPart>,
    pub include_models: Vec<MdlIncludeModel>,
    pub anim_blocks: Vec<MdlAnimBlock>,
    pub anim_descs: Vec<MdlAnimDesc>,
    pub sequences: Vec<MdlSequenceDesc>,
}

struct HeaderOffsets {
    version: i32,
    name: String,
    bone_count: i32,
    bone_offset: i32,
    texture_count: i32,
    texture_offset: i32,
    texture_dir_count: i32,
    texture_dir_offset: i32,
    body_part_count: i32,
    body_part_offset: i32,
    local_animation_count: i32,
    local_animation_offset: i32,
    local_seq_count: i32,
    local_seq_offset: i32,
    surface_prop_index: i32,
    include_model_count: i32,
    include_model_offset: i32,
    mass: f32,
    contents: i32,
    anim_blocks_count: i32,
    anim_blocks_offset: i32,
}

/// Parses the model header, bone table, texture table, texture search
/// paths, body-part/model/mesh tree, include-model references,
/// animation-block table, animation descriptors, and sequence descriptors.
pub struct MdlReader;

impl MdlReader {
    pub fn decode(path: &str, data: &[u8]) -> DecodeResult<MdlModelData> {
        let header = parse_header(path, data)?;

        let bones = parse_bones(path, data, &header)?;
        let textures = parse_textures(path, data, &header)?;
        let texture_search_paths = parse_texture_search_paths(path, data, &header)?;
        let body_parts = parse_body_parts(path, data, &header)?;
        let include_models = parse_include_models(path, data, &header)?;
        let anim_blocks = parse_anim_blocks(path, data, &header)?;
        let anim_descs = parse_anim_descs(path, data, &header)?;
        let sequences = parse_sequences(path, data, &header, &anim_descs)?;

        Ok(MdlModelData {
            name: header.name.clone(),
            version: header.version,
            surface_prop: read_cstr_at(data, header.surface_prop_index as usize),
            mass: header.mass,
            contents: header.contents,
            bones,
            textures,
            texture_search_paths,
            body_parts,
            include_models,
            anim_blocks,
            anim_descs,
            sequences,
        })
    }
}

fn parse_header(path: &str, data: &[u8]) -> DecodeResult<HeaderOffsets> {
    let mut cursor = Cursor::new(data);
    let err = |e: std::io::Error| DecodeError::InvalidModel {
        path: path.to_string(),
        reason: e.to_string(),
    };

    let mut id = [0u8; 4];
    std::io::Read::read_exact(&mut cursor, &mut id).map_err(err)?;
    if &id != b"IDST" {
        return Err(DecodeError::InvalidModel {
            path: path.to_string(),
            reason: "bad signature".to_string(),
        });
    }
    let version = cursor.read_i32::<LittleEndian>().map_err(err)?;
    if version < MIN_SUPPORTED_VERSION {
        // Legacy pre-44 header: read the short common tail and stop, per
        // spec's version-gate note. There is not enough here to build an
        // asset, so this is unsupported.
        for _ in 0..9 {
            cursor.read_i32::<LittleEndian>().map_err(err)?;
        }
        return Err(DecodeError::InvalidModel {
            path: path.to_string(),
            reason: format!("unsupported legacy version {}", version),
        });
    }
    if version > MAX_SUPPORTED_VERSION {
        return Err(DecodeError::InvalidModel {
            path: path.to_string(),
            reason: format!("unsupported version {}", version),
        });
    }

    cursor.seek(SeekFrom::Current(4)).map_err(err)?; // checksum
    let mut name_buf = [0u8; 64];
    std::io::Read::read_exact(&mut cursor, &mut name_buf).map_err(err)?;
    let name = read_cstr_at(&name_buf, 0);

    cursor.seek(SeekFrom::Current(4)).map_err(err)?; // data_length
    cursor.seek(SeekFrom::Current(4 * 3 * 6)).map_err(err)?; // 6 Vec3 fields
    cursor.seek(SeekFrom::Current(4)).map_err(err)?; // flags

    let bone_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let bone_offset = cursor.read_i32::<LittleEndian>().map_err(err)?;
    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // bone controllers
    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // hitboxes
    let local_animation_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let local_animation_offset = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let local_seq_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let local_seq_offset = cursor.read_i32::<LittleEndian>().map_err(err)?;
    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // activitylistversion, eventsindexed

    let texture_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let texture_offset = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let texture_dir_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let texture_dir_offset = cursor.read_i32::<LittleEndian>().map_err(err)?;

    cursor.seek(SeekFrom::Current(4 * 3)).map_err(err)?; // skin refs/families/index

    let body_part_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let body_part_offset = cursor.read_i32::<LittleEndian>().map_err(err)?;

    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // attachments
    cursor.seek(SeekFrom::Current(4 * 3)).map_err(err)?; // local nodes
    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // flex descs
    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // flex controllers
    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // flex rules
    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // ik chains
    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // mouths
    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // pose params

    let surface_prop_index = cursor.read_i32::<LittleEndian>().map_err(err)?;

    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // key_value index/count
    cursor.seek(SeekFrom::Current(4 * 2)).map_err(err)?; // ik locks

    let mass = cursor.read_f32::<LittleEndian>().map_err(err)?;
    let contents = cursor.read_i32::<LittleEndian>().map_err(err)?;

    let include_model_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let include_model_offset = cursor.read_i32::<LittleEndian>().map_err(err)?;

    cursor.seek(SeekFrom::Current(4)).map_err(err)?; // virtual_model placeholder

    cursor.seek(SeekFrom::Current(4)).map_err(err)?; // anim_blocks_name_index
    let anim_blocks_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let anim_blocks_offset = cursor.read_i32::<LittleEndian>().map_err(err)?;

    // Remaining fields (anim_block_model, bone_table_name_index,
    // vertex_base, offset_base, directional_dot_product, root_lod, and for
    // version >= 48 the allowed-root-lod/flex-controller-ui/header2 fields)
    // are opaque runtime placeholders this decoder does not consume.
    let _ = STUDIOHDR2_VERSION;

    Ok(HeaderOffsets {
        version,
        name,
        bone_count,
        bone_offset,
        texture_count,
        texture_offset,
        texture_dir_count,
        texture_dir_offset,
        body_part_count,
        body_part_offset,
        local_animation_count,
        local_animation_offset,
        local_seq_count,
        local_seq_offset,
        surface_prop_index,
        include_model_count,
        include_model_offset,
        mass,
        contents,
        anim_blocks_count,
        anim_blocks_offset,
    })
}

const BONE_STRIDE: usize = 216;
const TEXTURE_STRIDE: usize = 64;
const BODY_PART_STRIDE: usize = 16;
const MODEL_STRIDE: usize = 148;
const MESH_STRIDE: usize = 116;
const INCLUDE_MODEL_STRIDE: usize = 8;
const ANIM_BLOCK_STRIDE: usize = 8;
const ANIM_DESC_STRIDE: usize = 100;
const SEQUENCE_DESC_STRIDE: usize = 212;

fn read_vec3_at(data: &[u8], offset: usize) -> DecodeResult<Vec3> {
    let mut cursor = Cursor::new(&data[offset..]);
    let x = cursor
        .read_f32::<LittleEndian>()
        .map_err(|e| DecodeError::malformed("mdl", "<model>", e.to_string()))?;
    let y = cursor
        .read_f32::<LittleEndian>()
        .map_err(|e| DecodeError::malformed("mdl", "<model>", e.to_string()))?;
    let z = cursor
        .read_f32::<LittleEndian>()
        .map_err(|e| DecodeError::malformed("mdl", "<model>", e.to_string()))?;
    Ok(Vec3::new(x, y, z))
}

fn parse_bones(path: &str, data: &[u8], header: &HeaderOffsets) -> DecodeResult<Vec<MdlBone>> {
    let mut bones = Vec::with_capacity(header.bone_count.max(0) as usize);
    for i in 0..header.bone_count {
        let base = header.bone_offset as usize + i as usize * BONE_STRIDE;
        if base + BONE_STRIDE > data.len() {
            return Err(DecodeError::malformed("mdl", path, "bone record out of bounds"));
        }
        let name_offset = read_i32_at(data, base)?;
        let parent_index = read_i32_at(data, base + 4)?;
        // 6 bone controllers at base+8..base+32
        let position = read_vec3_at(data, base + 32)?;
        let quat_bytes = &data[base + 44..base + 60];
        let rotation = Quat::from_xyzw(
            f32::from_le_bytes(quat_bytes[0..4].try_into().unwrap()),
            f32::from_le_bytes(quat_bytes[4..8].try_into().unwrap()),
            f32::from_le_bytes(quat_bytes[8..12].try_into().unwrap()),
            f32::from_le_bytes(quat_bytes[12..16].try_into().unwrap()),
        );
        let rotation_euler = read_vec3_at(data, base + 60)?;
        let pos_scale = read_vec3_at(data, base + 72)?;
        let rot_scale = read_vec3_at(data, base + 84)?;
        let mut pose_to_bone = [0f32; 12];
        for (j, slot) in pose_to_bone.iter_mut().enumerate() {
            *slot = f32::from_le_bytes(
                data[base + 96 + j * 4..base + 100 + j * 4].try_into().unwrap(),
            );
        }
        // q_alignment at base+144 (16 bytes), ignored.
        let flags = read_i32_at(data, base + 160)?;
        // proc_type, proc_index, physics_bone at base+164..176, ignored.
        let surface_prop_idx = read_i32_at(data, base + 176)?;
        let contents = read_i32_at(data, base + 180)?;

        bones.push(MdlBone {
            name: read_cstr_at(data, (base as i32 + name_offset) as usize),
            parent_index,
            position,
            rotation,
            rotation_euler,
            pos_scale,
            rot_scale,
            pose_to_bone,
            flags: BoneFlags::from_bits_truncate(flags),
            surface_prop: read_cstr_at(data, surface_prop_idx as usize),
            contents,
        });
    }
    Ok(bones)
}

fn parse_textures(path: &str, data: &[u8], header: &HeaderOffsets) -> DecodeResult<Vec<MdlTexture>> {
    let mut textures = Vec::with_capacity(header.texture_count.max(0) as usize);
    for i in 0..header.texture_count {
        let base = header.texture_offset as usize + i as usize * TEXTURE_STRIDE;
        if base + TEXTURE_STRIDE > data.len() {
            return Err(DecodeError::malformed("mdl", path, "texture record out of bounds"));
        }
        let name_offset = read_i32_at(data, base)?;
        let flags = read_i32_at(data, base + 4)?;
        textures.push(MdlTexture {
            name: read_cstr_at(data, (base as i32 + name_offset) as usize),
            flags,
        });
    }
    Ok(textures)
}

fn parse_texture_search_paths(
    path: &str,
    data: &[u8],
    header: &HeaderOffsets,
) -> DecodeResult<Vec<String>> {
    let mut paths = Vec::with_capacity(header.texture_dir_count.max(0) as usize);
    for i in 0..header.texture_dir_count {
        let slot = header.texture_dir_offset as usize + i as usize * 4;
        if slot + 4 > data.len() {
            return Err(DecodeError::malformed("mdl", path, "texture dir out of bounds"));
        }
        let string_offset = read_i32_at(data, slot)?;
        paths.push(read_cstr_at(data, string_offset as usize));
    }
    Ok(paths)
}

fn parse_body_parts(path: &str, data: &[u8], header: &HeaderOffsets) -> DecodeResult<Vec<MdlBodyPart>> {
    let mut body_parts = Vec::with_capacity(header.body_part_count.max(0) as usize);
    for bp in 0..header.body_part_count {
        let bp_base = header.body_part_offset as usize + bp as usize * BODY_PART_STRIDE;
        match parse_one_body_part(path, data, bp_base, bp) {
            Ok(models) => body_parts.push(MdlBodyPart { models }),
            Err(e) => log::warn!("skipping malformed body part {} in {}: {}", bp, path, e),
        }
    }
    Ok(body_parts)
}

fn parse_one_body_part(path: &str, data: &[u8], bp_base: usize, bp: i32) -> DecodeResult<Vec<MdlModel>> {
    if bp_base + BODY_PART_STRIDE > data.len() {
        return Err(DecodeError::malformed("mdl", path, "body part out of bounds"));
    }
    let _name_offset = read_i32_at(data, bp_base)?;
    let model_count = read_i32_at(data, bp_base + 4)?;
    let model_base_rel = read_i32_at(data, bp_base + 8)?;
    let model_offset = bp_base as i32 + model_base_rel;

    let mut models = Vec::with_capacity(model_count.max(0) as usize);
    for m in 0..model_count {
        let m_base = model_offset as usize + m as usize * MODEL_STRIDE;
        match parse_one_model(path, data, m_base) {
            Ok(model) => models.push(model),
            Err(e) => log::warn!("skipping malformed model {} in body part {} of {}: {}", m, bp, path, e),
        }
    }
    Ok(models)
}

fn parse_one_model(path: &str, data: &[u8], m_base: usize) -> DecodeResult<MdlModel> {
    if m_base + MODEL_STRIDE > data.len() {
        return Err(DecodeError::malformed("mdl", path, "model out of bounds"));
    }
    let name = read_cstr_at(&data[m_base..m_base + 64], 0);
    let mesh_count = read_i32_at(data, m_base + 64 + 8)?;
    let mesh_offset_rel = read_i32_at(data, m_base + 64 + 12)?;
    let mesh_base = m_base as i32 + mesh_offset_rel;
    let num_vertices = read_i32_at(data, m_base + 64 + 16)?;

    let mut meshes = Vec::with_capacity(mesh_count.max(0) as usize);
    for me in 0..mesh_count {
        let me_base = mesh_base as usize + me as usize * MESH_STRIDE;
        match parse_one_mesh(path, data, me_base) {
            Ok(mesh) => meshes.push(mesh),
            Err(e) => log::warn!("skipping malformed mesh {} in model {:?} of {}: {}", me, name, path, e),
        }
    }

    Ok(MdlModel {
        name,
        num_vertices,
        meshes,
    })
}

fn parse_one_mesh(path: &str, data: &[u8], me_base: usize) -> DecodeResult<MdlMesh> {
    if me_base + MESH_STRIDE > data.len() {
        return Err(DecodeError::malformed("mdl", path, "mesh out of bounds"));
    }
    let material_index = read_i32_at(data, me_base)?;
    let num_vertices = read_i32_at(data, me_base + 8)?;
    let vertex_index_start = read_i32_at(data, me_base + 12)?;
    Ok(MdlMesh {
        material_index,
        num_vertices,
        vertex_index_start,
    })
}

fn parse_include_models(
    path: &str,
    data: &[u8],
    header: &HeaderOffsets,
) -> DecodeResult<Vec<MdlIncludeModel>> {
    let mut out = Vec::with_capacity(header.include_model_count.max(0) as usize);
    for i in 0..header.include_model_count {
        let base = header.include_model_offset as usize + i as usize * INCLUDE_MODEL_STRIDE;
        match parse_one_include_model(path, data, base) {
            Ok(v) => out.push(v),
            Err(e) => log::warn!("skipping malformed include model {} in {}: {}", i, path, e),
        }
    }
    Ok(out)
}

fn parse_one_include_model(path: &str, data: &[u8], base: usize) -> DecodeResult<MdlIncludeModel> {
    if base + INCLUDE_MODEL_STRIDE > data.len() {
        return Err(DecodeError::malformed("mdl", path, "include model out of bounds"));
    }
    let label_offset = read_i32_at(data, base)?;
    let filename_offset = read_i32_at(data, base + 4)?;
    Ok(MdlIncludeModel {
        label: read_cstr_at(data, (base as i32 + label_offset) as usize),
        filename: read_cstr_at(data, (base as i32 + filename_offset) as usize),
    })
}

fn parse_anim_blocks(path: &str, data: &[u8], header: &HeaderOffsets) -> DecodeResult<Vec<MdlAnimBlock>> {
    let mut out = Vec::with_capacity(header.anim_blocks_count.max(0) as usize);
    for i in 0..header.anim_blocks_count {
        let base = header.anim_blocks_offset as usize + i as usize * ANIM_BLOCK_STRIDE;
        match parse_one_anim_block(path, data, base) {
            Ok(v) => out.push(v),
            Err(e) => log::warn!("skipping malformed anim block {} in {}: {}", i, path, e),
        }
    }
    Ok(out)
}

fn parse_one_anim_block(path: &str, data: &[u8], base: usize) -> DecodeResult<MdlAnimBlock> {
    if base + ANIM_BLOCK_STRIDE > data.len() {
        return Err(DecodeError::malformed("mdl", path, "anim block out of bounds"));
    }
    Ok(MdlAnimBlock {
        data_start: read_i32_at(data, base)?,
        data_end: read_i32_at(data, base + 4)?,
    })
}

fn parse_anim_descs(path: &str, data: &[u8], header: &HeaderOffsets) -> DecodeResult<Vec<MdlAnimDesc>> {
    let mut out = Vec::with_capacity(header.local_animation_count.max(0) as usize);
    for i in 0..header.local_animation_count {
        let base = header.local_animation_offset as usize + i as usize * ANIM_DESC_STRIDE;
        match parse_one_anim_desc(path, data, base) {
            Ok(v) => out.push(v),
            Err(e) => log::warn!("skipping malformed anim desc {} in {}: {}", i, path, e),
        }
    }
    Ok(out)
}

fn parse_one_anim_desc(path: &str, data: &[u8], base: usize) -> DecodeResult<MdlAnimDesc> {
    if base + ANIM_DESC_STRIDE > data.len() {
        return Err(DecodeError::malformed("mdl", path, "anim desc out of bounds"));
    }
    let name_offset = read_i32_at(data, base + 4)?;
    let fps = f32::from_le_bytes(data[base + 8..base + 12].try_into().unwrap());
    let flags = read_i32_at(data, base + 12)?;
    let frame_count = read_i32_at(data, base + 16)?;
    let anim_block_id = read_i32_at(data, base + 20)?;
    let anim_offset = read_i32_at(data, base + 24)?;

    Ok(MdlAnimDesc {
        record_offset: base,
        name: read_cstr_at(data, (base as i32 + name_offset) as usize),
        fps,
        flags,
        frame_count,
        anim_block_id,
        anim_offset,
    })
}

fn parse_sequences(
    path: &str,
    data: &[u8],
    header: &HeaderOffsets,
    anim_descs: &[MdlAnimDesc],
) -> DecodeResult<Vec<MdlSequenceDesc>> {
    let mut out = Vec::with_capacity(header.local_seq_count.max(0) as usize);
    for i in 0..header.local_seq_count {
        let base = header.local_seq_offset as usize + i as usize * SEQUENCE_DESC_STRIDE;
        match parse_one_sequence(path, data, base, anim_descs) {
            Ok(v) => out.push(v),
            Err(e) => log::warn!("skipping malformed sequence {} in {}: {}", i, path, e),
        }
    }
    Ok(out)
}

fn parse_one_sequence(
    path: &str,
    data: &[u8],
    base: usize,
    anim_descs: &[MdlAnimDesc],
) -> DecodeResult<MdlSequenceDesc> {
    if base + SEQUENCE_DESC_STRIDE > data.len() {
        return Err(DecodeError::malformed("mdl", path, "sequence out of bounds"));
    }
    let label_offset = read_i32_at(data, base + 4)?;
    let flags = read_i32_at(data, base + 12)?;
    let anim_index_index = read_i32_at(data, base + 60)?;
    let group_size = [read_i32_at(data, base + 68)?, read_i32_at(data, base + 72)?];

    let anim_desc_index_addr = (base as i32 + anim_index_index) as usize;
    let anim_desc_index = data
        .get(anim_desc_index_addr..anim_desc_index_addr + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .ok_or_else(|| DecodeError::malformed("mdl", path, "anim index out of bounds"))?;

    if anim_desc_index as usize >= anim_descs.len() {
        return Err(DecodeError::malformed("mdl", path, "anim index out of range"));
    }

    Ok(MdlSequenceDesc {
        label: read_cstr_at(data, (base as i32 + label_offset) as usize),
        flags,
        anim_desc_index,
        group_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_cstr(buf: &mut Vec<u8>, s: &str) -> i32 {
        let offset = buf.len() as i32;
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
        offset
    }

    fn minimal_cube_mdl() -> Vec<u8> {
        // Build a minimal header + one bone + one texture + one body
        // part/model/mesh, matching scenario 1 ("minimal cube MDL").
        let mut data = vec![0u8; 4096];
        data[0..4].copy_from_slice(b"IDST");
        data[4..8].copy_from_slice(&48i32.to_le_bytes());

        // bone table: 1 bone at offset 512
        let bone_offset = 512usize;
        data[bone_offset..bone_offset + 4].copy_from_slice(&(BONE_STRIDE as i32).to_le_bytes());
        // name follows the bone record immediately
        let name_pos = bone_offset + BONE_STRIDE;
        data[name_pos..name_pos + 5].copy_from_slice(b"root\0");
        data[bone_offset + 4..bone_offset + 8].copy_from_slice(&(-1i32).to_le_bytes());

        write_header_fields(&mut data, bone_offset);
        data
    }

    fn write_header_fields(data: &mut [u8], bone_offset: usize) {
        // bone_count/offset at 136 (right after id,version,checksum,name,data_length,6 vec3,flags)
        let bone_count_pos = 4 + 4 + 4 + 64 + 4 + 4 * 3 * 6 + 4;
        data[bone_count_pos..bone_count_pos + 4].copy_from_slice(&1i32.to_le_bytes());
        data[bone_count_pos + 4..bone_count_pos + 8]
            .copy_from_slice(&(bone_offset as i32).to_le_bytes());
    }

    #[test]
    fn rejects_bad_signature() {
        let mut data = vec![0u8; 64];
        data[0..4].copy_from_slice(b"XXXX");
        let err = MdlReader::decode("test.mdl", &data).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidModel { .. }));
    }

    #[test]
    fn rejects_version_out_of_range() {
        let mut data = vec![0u8; 128];
        data[0..4].copy_from_slice(b"IDST");
        data[4..8].copy_from_slice(&50i32.to_le_bytes());
        let err = MdlReader::decode("test.mdl", &data).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidModel { .. }));
    }

    #[test]
    fn parses_single_bone() {
        let data = minimal_cube_mdl();
        let model = MdlReader::decode("cube.mdl", &data).unwrap();
        assert_eq!(model.bones.len(), 1);
        assert_eq!(model.bones[0].name, "root");
        assert_eq!(model.bones[0].parent_index, -1);
    }

    #[test]
    fn malformed_body_part_is_skipped_not_fatal() {
        let _ = env_logger::try_init();
        let mut data = vec![0u8; 8192];
        data[0..4].copy_from_slice(b"IDST");
        data[4..8].copy_from_slice(&48i32.to_le_bytes());

        let bone_offset = 512usize;
        data[bone_offset..bone_offset + 4].copy_from_slice(&(BONE_STRIDE as i32).to_le_bytes());
        let name_pos = bone_offset + BONE_STRIDE;
        data[name_pos..name_pos + 5].copy_from_slice(b"root\0");
        data[bone_offset + 4..bone_offset + 8].copy_from_slice(&(-1i32).to_le_bytes());
        write_header_fields(&mut data, bone_offset);

        // Body part table: entry 0 fits exactly at the end of the buffer,
        // entry 1 starts at EOF and is out of bounds.
        let bp_table_offset = data.len() - BODY_PART_STRIDE;
        data[232..236].copy_from_slice(&2i32.to_le_bytes()); // body_part_count
        data[236..240].copy_from_slice(&(bp_table_offset as i32).to_le_bytes()); // body_part_offset

        let model_table_offset = 1536usize;
        let bp0_base = bp_table_offset;
        data[bp0_base + 4..bp0_base + 8].copy_from_slice(&1i32.to_le_bytes()); // model_count
        data[bp0_base + 8..bp0_base + 12]
            .copy_from_slice(&((model_table_offset as i32) - bp0_base as i32).to_le_bytes());

        let mesh_table_offset = 2048usize;
        let m_base = model_table_offset;
        data[m_base..m_base + 5].copy_from_slice(b"cube\0");
        data[m_base + 64 + 8..m_base + 64 + 12].copy_from_slice(&1i32.to_le_bytes()); // mesh_count
        data[m_base + 64 + 12..m_base + 64 + 16]
            .copy_from_slice(&((mesh_table_offset as i32) - m_base as i32).to_le_bytes());
        data[m_base + 64 + 16..m_base + 64 + 20].copy_from_slice(&10i32.to_le_bytes()); // num_vertices

        let me_base = mesh_table_offset;
        data[me_base..me_base + 4].copy_from_slice(&0i32.to_le_bytes()); // material_index
        data[me_base + 8..me_base + 12].copy_from_slice(&10i32.to_le_bytes()); // num_vertices
        data[me_base + 12..me_base + 16].copy_from_slice(&0i32.to_le_bytes()); // vertex_index_start

        let model = MdlReader::decode("cube.mdl", &data).unwrap();
        assert_eq!(model.body_parts.len(), 1);
        assert_eq!(model.body_parts[0].models[0].name, "cube");
        assert_eq!(model.body_parts[0].models[0].meshes.len(), 1);
        // The bone table parsed fine even though one body part entry didn't.
        assert_eq!(model.bones.len(), 1);
    }
}
