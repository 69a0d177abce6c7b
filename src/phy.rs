use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use glam::Vec3;

use crate::error::{DecodeError, DecodeResult};

const METERS_TO_INCHES: f32 = 39.37;
const VPHY_PROLOGUE_EXTRA: i64 = 28;

#[derive(Debug, Clone, Default)]
pub struct ConvexHull {
    pub bone_index: i32,
    pub vertices: Vec<Vec3>,
}

#[derive(Debug, Clone, Default)]
pub struct PhySolid {
    pub hulls: Vec<ConvexHull>,
}

#[derive(Debug, Clone, Copy)]
pub struct RagdollConstraint {
    pub parent_solid: i32,
    pub child_solid: i32,
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
    pub z_min: f32,
    pub z_max: f32,
}

impl Default for RagdollConstraint {
    fn default() -> Self {
        RagdollConstraint {
            parent_solid: -1,
            child_solid: -1,
            x_min: 0.0,
            x_max: 0.0,
            y_min: 0.0,
            y_max: 0.0,
            z_min: 0.0,
            z_max: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PhyData {
    pub solids: Vec<PhySolid>,
    pub constraints: Vec<RagdollConstraint>,
}

struct TriMeshHeader {
    vertex_data_offset: i32,
    bone_index: i32,
    triangle_count: i32,
}

/// Parses the collision solids (convex hulls) and the trailing key/value
/// text section describing ragdoll constraints.
pub struct PhyReader;

impl PhyReader {
    pub fn decode(path: &str, data: &[u8]) -> DecodeResult<PhyData> {
        let mut cursor = Cursor::new(data);
        let err = |e: std::io::Error| DecodeError::malformed("phy", path, e.to_string());

        let _size = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let _id = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let solid_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
        let _checksum = cursor.read_i32::<LittleEndian>().map_err(err)?;

        let mut solids = Vec::with_capacity(solid_count.max(0) as usize);
        for _ in 0..solid_count {
            match parse_solid(path, data, &mut cursor) {
                Ok(solid) => solids.push(solid),
                Err(e) => {
                    log::warn!("skipping malformed PHY solid in {}: {}", path, e);
                }
            }
        }

        let text_start = cursor.position() as usize;
        let constraints = if text_start < data.len() {
            parse_keyvalue_constraints(&data[text_start..])
        } else {
            Vec::new()
        };

        Ok(PhyData { solids, constraints })
    }
}

fn parse_solid(path: &str, data: &[u8], cursor: &mut Cursor<&[u8]>) -> DecodeResult<PhySolid> {
    let err = |e: std::io::Error| DecodeError::malformed("phy", path, e.to_string());

    let data_size = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let solid_start = cursor.position() as i64;
    let solid_end = solid_start + data_size as i64;

    let mut magic = [0u8; 4];
    std::io::Read::read_exact(cursor, &mut magic).map_err(err)?;
    let is_vphy = &magic == b"VPHY";
    if is_vphy {
        std::io::Seek::seek(cursor, std::io::SeekFrom::Current(VPHY_PROLOGUE_EXTRA)).map_err(err)?;
    } else {
        // v37: the 4 bytes just consumed were not a magic, rewind.
        std::io::Seek::seek(cursor, std::io::SeekFrom::Current(-4)).map_err(err)?;
    }

    let mut ivps = [0u8; 4];
    let before_ivps = cursor.position();
    std::io::Read::read_exact(cursor, &mut ivps).map_err(err)?;
    if &ivps != b"IVPS" {
        std::io::Seek::seek(cursor, std::io::SeekFrom::Start(before_ivps)).map_err(err)?;
    }

    let first_header_offset = cursor.position() as i64;
    let first_header = read_trimesh_header(path, data, cursor)?;
    // vertex_data_offset is relative to the start of this mesh's header.
    let vertex_section_start = first_header_offset + first_header.vertex_data_offset as i64;

    let mut hulls = Vec::new();
    let mut mesh_vertex_refs: Vec<(usize, Vec<u16>)> = Vec::new();

    let mut header = first_header;
    loop {
        let mut indices = Vec::new();
        for _ in 0..header.triangle_count {
            let _tri_header = cursor.read_u32::<LittleEndian>().map_err(err)?;
            for _ in 0..3 {
                let corner_lo = cursor.read_u16::<LittleEndian>().map_err(err)?;
                let _corner_hi = cursor.read_u16::<LittleEndian>().map_err(err)?;
                indices.push(corner_lo);
            }
        }
        hulls.push(ConvexHull {
            bone_index: header.bone_index,
            vertices: Vec::new(),
        });
        mesh_vertex_refs.push((hulls.len() - 1, indices));

        if cursor.position() as i64 >= vertex_section_start || cursor.position() as i64 >= solid_end {
            break;
        }
        header = read_trimesh_header(path, data, cursor)?;
    }

    std::io::Seek::seek(cursor, std::io::SeekFrom::Start(vertex_section_start as u64)).map_err(err)?;

    let max_index = mesh_vertex_refs
        .iter()
        .flat_map(|(_, idx)| idx.iter())
        .copied()
        .max()
        .unwrap_or(0);
    let vertex_count = max_index as usize + 1;

    let mut vertices = Vec::with_capacity(vertex_count);
    for _ in 0..vertex_count {
        let x = cursor.read_f32::<LittleEndian>().map_err(err)?;
        let y = cursor.read_f32::<LittleEndian>().map_err(err)?;
        let z = cursor.read_f32::<LittleEndian>().map_err(err)?;
        let _w = cursor.read_f32::<LittleEndian>().map_err(err)?;
        vertices.push(Vec3::new(
            x * METERS_TO_INCHES,
            y * METERS_TO_INCHES,
            z * METERS_TO_INCHES,
        ));
    }

    for (hull_idx, indices) in &mesh_vertex_refs {
        let hull = &mut hulls[*hull_idx];
        for &idx in indices {
            if let Some(v) = vertices.get(idx as usize) {
                hull.vertices.push(*v);
            }
        }
    }

    std::io::Seek::seek(cursor, std::io::SeekFrom::Start(solid_end as u64)).map_err(err)?;

    Ok(PhySolid { hulls })
}

fn read_trimesh_header(
    path: &str,
    _data: &[u8],
    cursor: &mut Cursor<&[u8]>,
) -> DecodeResult<TriMeshHeader> {
    let err = |e: std::io::Error| DecodeError::malformed("phy", path, e.to_string());
    let vertex_data_offset = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let bone_index_minus_one = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let _flags = cursor.read_i32::<LittleEndian>().map_err(err)?;
    let triangle_count = cursor.read_i32::<LittleEndian>().map_err(err)?;
    Ok(TriMeshHeader {
        vertex_data_offset,
        bone_index: bone_index_minus_one + 1,
        triangle_count,
    })
}

/// Parses the key/value text tail for `ragdollconstraint` blocks, using the
/// quote-split convention: a line containing `"` yields
/// `[_, key, _, value, ...]` once split on `"`.
fn parse_keyvalue_constraints(text: &[u8]) -> Vec<RagdollConstraint> {
    let text = String::from_utf8_lossy(text);
    let mut constraints = Vec::new();
    let mut current: Option<RagdollConstraint> = None;

    for line in text.lines() {
        if line.contains("ragdollconstraint") {
            current = Some(RagdollConstraint::default());
            continue;
        }
        if line.trim() == "}" {
            if let Some(c) = current.take() {
                constraints.push(c);
            }
            continue;
        }
        let Some(ref mut c) = current else { continue };
        let parts: Vec<&str> = line.split('"').collect();
        if parts.len() < 4 {
            continue;
        }
        let key = parts[1].to_ascii_lowercase();
        let value = parts[3];
        apply_constraint_field(c, &key, value);
    }

    constraints
}

fn apply_constraint_field(c: &mut RagdollConstraint, key: &str, value: &str) {
    let parsed: f32 = match value.parse() {
        Ok(v) => v,
        Err(_) => return,
    };
    match key {
        "parent" => c.parent_solid = parsed as i32,
        "child" => c.child_solid = parsed as i32,
        "xmin" => c.x_min = parsed,
        "xmax" => c.x_max = parsed,
        "ymin" => c.y_min = parsed,
        "ymax" => c.y_max = parsed,
        "zmin" => c.z_min = parsed,
        "zmax" => c.z_max = parsed,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ragdoll_constraint_parses_fields() {
        let text = br#"
ragdollconstraint
{
"parent" "0"
"child" "1"
"xmax" "30"
"ymax" "45"
"zmin" "-20"
"zmax" "20"
}
"#;
        let constraints = parse_keyvalue_constraints(text);
        assert_eq!(constraints.len(), 1);
        let c = &constraints[0];
        assert_eq!(c.parent_solid, 0);
        assert_eq!(c.child_solid, 1);
        assert_eq!(c.x_max, 30.0);
        assert_eq!(c.y_max, 45.0);
        assert_eq!(c.z_min, -20.0);
        assert_eq!(c.z_max, 20.0);

        let swing = c.x_max.abs().max(c.y_max.abs());
        assert_eq!(swing, 45.0);
        assert_eq!((c.z_min, c.z_max), (-20.0, 20.0));
    }

    #[test]
    fn units_conversion_meters_to_inches() {
        let raw = 1.0f32;
        let converted = raw * METERS_TO_INCHES;
        assert!((converted - 39.37).abs() < 1e-4);
    }
}
