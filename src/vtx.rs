use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{DecodeError, DecodeResult};

fn read_i32(data: &[u8], offset: usize, path: &str) -> DecodeResult<i32> {
    data.get(offset..offset + 4)
        .map(|s| i32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or_else(|| DecodeError::malformed("vtx", path, "offset out of bounds"))
}

fn read_u16(data: &[u8], offset: usize, path: &str) -> DecodeResult<u16> {
    data.get(offset..offset + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .ok_or_else(|| DecodeError::malformed("vtx", path, "offset out of bounds"))
}

#[derive(Debug, Clone)]
pub struct VtxStripGroup {
    /// Mesh-relative VVD indices, one per strip-group vertex.
    pub vertex_remap: Vec<u16>,
    /// Indices into `vertex_remap`.
    pub indices: Vec<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct VtxMesh {
    pub strip_groups: Vec<VtxStripGroup>,
}

#[derive(Debug, Clone, Default)]
pub struct VtxModel {
    pub meshes: Vec<VtxMesh>,
}

#[derive(Debug, Clone, Default)]
pub struct VtxBodyPart {
    pub models: Vec<VtxModel>,
}

const BODY_PART_STRIDE: usize = 8;
const MODEL_STRIDE: usize = 8;
const LOD_STRIDE: usize = 12;
const MESH_STRIDE: usize = 9;
const STRIP_GROUP_STRIDE: usize = 25;
const VERTEX_STRIDE: usize = 9;
const INDEX_STRIDE: usize = 2;

/// Parses the optimized strip tree. Every level's offset is relative to the
/// position of its own stride slot, never to the parent's base — this must
/// never be collapsed into record-end math.
pub struct VtxReader;

impl VtxReader {
    pub fn decode(path: &str, data: &[u8]) -> DecodeResult<Vec<VtxBodyPart>> {
        let mut cursor = Cursor::new(data);
        let err = |e: std::io::Error| DecodeError::malformed("vtx", path, e.to_string());

        let _version = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let _vertex_cache_size = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let _max_bones_per_strip = cursor.read_u16::<LittleEndian>().map_err(err)?;
        let _max_bones_per_tri = cursor.read_u16::<LittleEndian>().map_err(err)?;
        let _max_bones_per_vertex = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let _checksum = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let body_part_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let body_part_offset_field = cursor.position() as i32; // position of the body-part offset field itself
        let body_part_rel = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let body_part_base = body_part_offset_field + body_part_rel;

        let mut body_parts = Vec::with_capacity(body_part_count.max(0) as usize);
        for bp in 0..body_part_count {
            let bp_slot = body_part_base as usize + bp as usize * BODY_PART_STRIDE;
            let model_count = read_i32(data, bp_slot, path)?;
            let model_rel = read_i32(data, bp_slot + 4, path)?;
            let model_base = bp_slot as i32 + 4 + model_rel;

            let mut models = Vec::with_capacity(model_count.max(0) as usize);
            for m in 0..model_count {
                let m_slot = model_base as usize + m as usize * MODEL_STRIDE;
                let lod_count = read_i32(data, m_slot, path)?;
                let lod_rel = read_i32(data, m_slot + 4, path)?;
                let lod_base = m_slot as i32 + 4 + lod_rel;

                // Only LOD 0 (the highest detail) is decoded; other LODs
                // are an explicit non-goal.
                let meshes = if lod_count > 0 {
                    let lod0_slot = lod_base as usize;
                    let mesh_count = read_i32(data, lod0_slot, path)?;
                    let mesh_rel = read_i32(data, lod0_slot + 4, path)?;
                    let mesh_base = lod0_slot as i32 + 4 + mesh_rel;
                    parse_meshes(path, data, mesh_base, mesh_count)?
                } else {
                    Vec::new()
                };

                models.push(VtxModel { meshes });
            }

            body_parts.push(VtxBodyPart { models });
        }

        Ok(body_parts)
    }
}

fn parse_meshes(path: &str, data: &[u8], mesh_base: i32, mesh_count: i32) -> DecodeResult<Vec<VtxMesh>> {
    let mut meshes = Vec::with_capacity(mesh_count.max(0) as usize);
    for me in 0..mesh_count {
        let me_slot = mesh_base as usize + me as usize * MESH_STRIDE;
        let strip_group_count = read_i32(data, me_slot, path)?;
        let strip_group_rel = read_i32(data, me_slot + 4, path)?;
        let strip_group_base = me_slot as i32 + 4 + strip_group_rel;
        let _flags = data
            .get(me_slot + 8)
            .copied()
            .ok_or_else(|| DecodeError::malformed("vtx", path, "mesh flags out of bounds"))?;

        let mut strip_groups = Vec::with_capacity(strip_group_count.max(0) as usize);
        for sg in 0..strip_group_count {
            let sg_slot = strip_group_base as usize + sg as usize * STRIP_GROUP_STRIDE;
            strip_groups.push(parse_strip_group(path, data, sg_slot)?);
        }

        meshes.push(VtxMesh { strip_groups });
    }
    Ok(meshes)
}

fn parse_strip_group(path: &str, data: &[u8], sg_slot: usize) -> DecodeResult<VtxStripGroup> {
    let vertex_count = read_i32(data, sg_slot, path)?;
    let vertex_rel = read_i32(data, sg_slot + 4, path)?;
    let vertex_base = sg_slot as i32 + 4 + vertex_rel;

    let index_count = read_i32(data, sg_slot + 8, path)?;
    let index_rel = read_i32(data, sg_slot + 12, path)?;
    let index_base = sg_slot as i32 + 12 + index_rel;

    // strip table at sg_slot+16..+24 (count, offset) is not consumed: the
    // decoder reads the flattened vertex/index arrays directly.

    let mut vertex_remap = Vec::with_capacity(vertex_count.max(0) as usize);
    for v in 0..vertex_count {
        let v_slot = vertex_base as usize + v as usize * VERTEX_STRIDE;
        // bytes 0..3 bone-weight-index, 3 num-bones, 4..6 mesh-relative VVD
        // index (the only field consumed), 6..9 bone-id.
        let mesh_relative_index = read_u16(data, v_slot + 4, path)?;
        vertex_remap.push(mesh_relative_index);
    }

    let mut indices = Vec::with_capacity(index_count.max(0) as usize);
    for i in 0..index_count {
        let i_slot = index_base as usize + i as usize * INDEX_STRIDE;
        indices.push(read_u16(data, i_slot, path)?);
    }

    Ok(VtxStripGroup {
        vertex_remap,
        indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_i32(buf: &mut Vec<u8>, v: i32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn put_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    #[test]
    fn minimal_cube_strip_group() {
        // Header: version, cache, max_bones_per_strip/tri (u16 each),
        // max_bones_per_vertex, checksum, body_part_count, body_part_offset.
        let mut data = Vec::new();
        put_i32(&mut data, 7); // version
        put_i32(&mut data, 0); // vertex cache size
        put_u16(&mut data, 0);
        put_u16(&mut data, 0);
        put_i32(&mut data, 0);
        put_i32(&mut data, 0); // checksum
        put_i32(&mut data, 1); // body_part_count

        // Every (count, offset) pair below is patched after the full
        // fixed-stride header area is laid out, once every base position
        // is known; the relative offset is always measured from the
        // position of the offset field itself.
        let mut patches: Vec<(usize, usize)> = Vec::new(); // (offset_field_pos, target_pos)

        let body_part_offset_field_pos = data.len();
        put_i32(&mut data, 0);
        let body_part_base = data.len();
        patches.push((body_part_offset_field_pos, body_part_base));

        put_i32(&mut data, 1); // model_count
        let model_offset_field_pos = data.len();
        put_i32(&mut data, 0);
        let model_base = data.len();
        patches.push((model_offset_field_pos, model_base));
        assert_eq!(data.len(), body_part_base + BODY_PART_STRIDE);

        put_i32(&mut data, 1); // lod_count
        let lod_offset_field_pos = data.len();
        put_i32(&mut data, 0);
        let lod_base = data.len();
        patches.push((lod_offset_field_pos, lod_base));
        assert_eq!(data.len(), model_base + MODEL_STRIDE);

        put_i32(&mut data, 1); // mesh_count
        let mesh_offset_field_pos = data.len();
        put_i32(&mut data, 0);
        data.extend_from_slice(&0f32.to_le_bytes()); // switch_point
        let mesh_base = data.len();
        patches.push((mesh_offset_field_pos, mesh_base));
        assert_eq!(data.len(), lod_base + LOD_STRIDE);

        put_i32(&mut data, 1); // strip_group_count
        let sg_offset_field_pos = data.len();
        put_i32(&mut data, 0);
        data.push(0); // flags
        let sg_base = data.len();
        patches.push((sg_offset_field_pos, sg_base));
        assert_eq!(data.len(), mesh_base + MESH_STRIDE);

        put_i32(&mut data, 8); // vertex_count
        let v_offset_field_pos = data.len();
        put_i32(&mut data, 0);
        put_i32(&mut data, 36); // index_count
        let i_offset_field_pos = data.len();
        put_i32(&mut data, 0);
        put_i32(&mut data, 0); // strip_count
        put_i32(&mut data, 0); // strip_offset
        data.push(0); // flags
        assert_eq!(data.len(), sg_base + STRIP_GROUP_STRIDE);

        let v_base = data.len();
        patches.push((v_offset_field_pos, v_base));
        for i in 0..8u16 {
            data.extend_from_slice(&[0u8; 3]); // bone-weight-index
            data.push(0); // num_bones
            put_u16(&mut data, i); // mesh-relative VVD index
            data.extend_from_slice(&[0u8; 3]); // bone-id
        }

        let i_base = data.len();
        patches.push((i_offset_field_pos, i_base));
        for i in 0..36u16 {
            put_u16(&mut data, i % 8);
        }

        for (field_pos, target_pos) in patches {
            let rel = target_pos as i32 - field_pos as i32;
            data[field_pos..field_pos + 4].copy_from_slice(&rel.to_le_bytes());
        }

        let body_parts = VtxReader::decode("cube.vtx", &data).unwrap();
        assert_eq!(body_parts.len(), 1);
        let mesh = &body_parts[0].models[0].meshes[0];
        assert_eq!(mesh.strip_groups[0].vertex_remap.len(), 8);
        assert_eq!(mesh.strip_groups[0].indices.len(), 36);
    }
}
