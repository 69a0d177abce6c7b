use std::io::{Cursor, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use glam::{Vec2, Vec3};
use serde::Deserialize;

use crate::error::{DecodeError, DecodeResult};

const SIGNATURE: &[u8; 4] = b"IDSV";
const SUPPORTED_VERSION: i32 = 4;
const MAX_LOD_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, Deserialize)]
struct RawVertex {
    weights: [f32; 3],
    bones: [u8; 3],
    num_bones: u8,
    position: [f32; 3],
    normal: [f32; 3],
    uv: [f32; 2],
}

#[derive(Debug, Clone, Copy)]
struct FixUp {
    lod: i32,
    source_vertex_id: i32,
    num_vertices: i32,
}

#[derive(Debug, Clone)]
pub struct VvdVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub bone_weights: Vec<(u8, f32)>,
}

/// Parses the vertex pool and applies the LOD fix-up table to produce the
/// canonical LOD-0 vertex array.
pub struct VvdReader;

impl VvdReader {
    pub fn decode(path: &str, data: &[u8]) -> DecodeResult<Vec<VvdVertex>> {
        let mut cursor = Cursor::new(data);
        let err = |e: std::io::Error| DecodeError::malformed("vvd", path, e.to_string());

        let mut signature = [0u8; 4];
        std::io::Read::read_exact(&mut cursor, &mut signature).map_err(err)?;
        if &signature != SIGNATURE {
            return Err(DecodeError::MissingCompanion {
                model_path: path.to_string(),
                companion: "vvd",
            });
        }
        let version = cursor.read_i32::<LittleEndian>().map_err(err)?;
        if version != SUPPORTED_VERSION {
            return Err(DecodeError::malformed(
                "vvd",
                path,
                format!("unsupported version {}", version),
            ));
        }
        cursor.seek(SeekFrom::Current(4)).map_err(err)?; // checksum

        let mut lod_vertex_counts = [0i32; MAX_LOD_COUNT];
        for count in lod_vertex_counts.iter_mut() {
            *count = cursor.read_i32::<LittleEndian>().map_err(err)?;
        }

        let fixup_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let fixup_table_start = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let vertex_data_start = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let _tangent_data_start = cursor.read_i32::<LittleEndian>().map_err(err)?;

        let raw_pool = read_raw_pool(path, data, vertex_data_start as usize)?;

        if fixup_count <= 0 {
            let count = lod_vertex_counts[0].max(0) as usize;
            return Ok(raw_pool
                .into_iter()
                .take(count)
                .map(to_output_vertex)
                .collect());
        }

        let fixups = read_fixups(path, data, fixup_table_start as usize, fixup_count as usize)?;
        let mut out = Vec::new();
        for fixup in fixups {
            if fixup.lod < 0 {
                continue;
            }
            let start = fixup.source_vertex_id as usize;
            let end = start + fixup.num_vertices as usize;
            let slice = raw_pool
                .get(start..end)
                .ok_or_else(|| DecodeError::malformed("vvd", path, "fix-up range out of bounds"))?;
            out.extend(slice.iter().copied().map(to_output_vertex));
        }
        Ok(out)
    }
}

fn to_output_vertex(raw: RawVertex) -> VvdVertex {
    let mut bone_weights = Vec::with_capacity(raw.num_bones as usize);
    for i in 0..(raw.num_bones as usize).min(3) {
        bone_weights.push((raw.bones[i], raw.weights[i]));
    }
    VvdVertex {
        position: Vec3::from(raw.position),
        normal: Vec3::from(raw.normal),
        uv: Vec2::from(raw.uv),
        bone_weights,
    }
}

fn read_raw_pool(path: &str, data: &[u8], start: usize) -> DecodeResult<Vec<RawVertex>> {
    const STRIDE: usize = 48;
    let remaining = data
        .get(start..)
        .ok_or_else(|| DecodeError::malformed("vvd", path, "vertex pool offset out of bounds"))?;
    let count = remaining.len() / STRIDE;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let slice = &remaining[i * STRIDE..(i + 1) * STRIDE];
        let raw: RawVertex = bincode::deserialize(slice)
            .map_err(|e| DecodeError::malformed("vvd", path, e.to_string()))?;
        out.push(raw);
    }
    Ok(out)
}

fn read_fixups(path: &str, data: &[u8], start: usize, count: usize) -> DecodeResult<Vec<FixUp>> {
    const STRIDE: usize = 12;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let base = start + i * STRIDE;
        let slice = data
            .get(base..base + STRIDE)
            .ok_or_else(|| DecodeError::malformed("vvd", path, "fix-up table out of bounds"))?;
        out.push(FixUp {
            lod: i32::from_le_bytes(slice[0..4].try_into().unwrap()),
            source_vertex_id: i32::from_le_bytes(slice[4..8].try_into().unwrap()),
            num_vertices: i32::from_le_bytes(slice[8..12].try_into().unwrap()),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_vertex_bytes(index: i32) -> Vec<u8> {
        let mut v = Vec::with_capacity(48);
        v.extend_from_slice(&[0f32; 3].map(f32::to_le_bytes).concat()); // weights
        v.extend_from_slice(&[0u8; 3]); // bone indices
        v.push(0); // num_bones
        v.extend_from_slice(&[index as f32, 0.0, 0.0].map(f32::to_le_bytes).concat()); // position, tag with index
        v.extend_from_slice(&[0f32; 3].map(f32::to_le_bytes).concat()); // normal
        v.extend_from_slice(&[0f32; 2].map(f32::to_le_bytes).concat()); // uv
        v
    }

    fn build_vvd(pool_len: i32, fixups: &[(i32, i32, i32)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(SIGNATURE);
        data.extend_from_slice(&SUPPORTED_VERSION.to_le_bytes());
        data.extend_from_slice(&0i32.to_le_bytes()); // checksum
        for i in 0..MAX_LOD_COUNT {
            let count = if i == 0 { pool_len } else { 0 };
            data.extend_from_slice(&count.to_le_bytes());
        }
        data.extend_from_slice(&(fixups.len() as i32).to_le_bytes());

        let header_len = 4 + 4 + 4 + 4 * MAX_LOD_COUNT + 4 * 4;
        let fixup_table_start = header_len as i32;
        let vertex_data_start = fixup_table_start + fixups.len() as i32 * 12;

        data.extend_from_slice(&fixup_table_start.to_le_bytes());
        data.extend_from_slice(&vertex_data_start.to_le_bytes());
        data.extend_from_slice(&0i32.to_le_bytes()); // tangent data start

        for (lod, source, count) in fixups {
            data.extend_from_slice(&lod.to_le_bytes());
            data.extend_from_slice(&source.to_le_bytes());
            data.extend_from_slice(&count.to_le_bytes());
        }
        for i in 0..pool_len {
            data.extend_from_slice(&raw_vertex_bytes(i));
        }
        data
    }

    #[test]
    fn no_fixups_takes_lod0_prefix() {
        let data = build_vvd(8, &[]);
        let vertices = VvdReader::decode("cube.vvd", &data).unwrap();
        assert_eq!(vertices.len(), 8);
        for (i, v) in vertices.iter().enumerate() {
            assert_eq!(v.position.x, i as f32);
        }
    }

    #[test]
    fn fixup_table_reorders_vertices() {
        let data = build_vvd(14, &[(0, 10, 4), (0, 2, 3)]);
        let vertices = VvdReader::decode("cube.vvd", &data).unwrap();
        assert_eq!(vertices.len(), 7);
        let indices: Vec<i32> = vertices.iter().map(|v| v.position.x as i32).collect();
        assert_eq!(indices, vec![10, 11, 12, 13, 2, 3, 4]);
    }
}
