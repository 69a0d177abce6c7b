use glam::{EulerRot, Quat, Vec3};
use half::f16;

use crate::error::{DecodeError, DecodeResult};
use crate::mdl::{MdlAnimBlock, MdlAnimDesc, MdlBone};

const BONE_LIST_TERMINATOR: u8 = 255;

const FLAG_RAWPOS: u8 = 0x01;
const FLAG_RAWROT: u8 = 0x02;
const FLAG_ANIMPOS: u8 = 0x04;
const FLAG_ANIMROT: u8 = 0x08;
#[allow(dead_code)] // carried for fidelity; compose-frame rules are hardcoded per channel type
const FLAG_DELTA: u8 = 0x10;
const FLAG_RAWROT2: u8 = 0x20;

#[derive(Debug, Clone, Copy)]
pub struct BoneFrame {
    pub position: Vec3,
    pub rotation: Quat,
}

enum PositionSource {
    None,
    Raw(Vec<Vec3>),
    Rle { x: Vec<f32>, y: Vec<f32>, z: Vec<f32> },
}

enum RotationSource {
    None,
    RawEuler(Vec<Vec3>),
    RawQuat(Vec<Quat>),
    RleEuler { x: Vec<f32>, y: Vec<f32>, z: Vec<f32> },
}

struct BoneStream {
    bone_index: u8,
    position: PositionSource,
    rotation: RotationSource,
    static_pose: Option<(Vec3, Quat)>,
}

/// Decodes per-bone animation streams for a sequence into parent-local
/// transform frames (`frames[frame][bone]`).
pub struct AnimDecoder;

impl AnimDecoder {
    pub fn decode_sequence(
        path: &str,
        bones: &[MdlBone],
        mdl_data: &[u8],
        anim_desc: &MdlAnimDesc,
        anim_blocks: &[MdlAnimBlock],
        ani_blob: Option<&[u8]>,
    ) -> DecodeResult<Vec<Vec<BoneFrame>>> {
        let frame_count = anim_desc.frame_count.max(1) as usize;

        let (stream_data, stream_start) = if anim_desc.anim_block_id == 0 {
            (mdl_data, anim_desc.record_offset as i64 + anim_desc.anim_offset as i64)
        } else {
            let block = anim_blocks.get(anim_desc.anim_block_id as usize).ok_or_else(|| {
                DecodeError::malformed("anim", path, "anim block id out of range")
            })?;
            let ani = ani_blob.ok_or_else(|| DecodeError::MissingCompanion {
                model_path: path.to_string(),
                companion: "ani",
            })?;
            (ani, block.data_start as i64 + anim_desc.anim_offset as i64)
        };

        let bone_streams = parse_bone_streams(path, bones, stream_data, stream_start as usize, frame_count)?;

        let mut frames = vec![vec![BoneFrame { position: Vec3::ZERO, rotation: Quat::IDENTITY }; bones.len()]; frame_count];

        // Bones with no stream entry keep their rest transform every frame.
        for (bone_index, bone) in bones.iter().enumerate() {
            for frame in frames.iter_mut() {
                frame[bone_index] = BoneFrame {
                    position: bone.position,
                    rotation: bone.rotation,
                };
            }
        }

        for stream in &bone_streams {
            let bone_index = stream.bone_index as usize;
            let bone = match bones.get(bone_index) {
                Some(b) => b,
                None => continue,
            };

            if let Some((pos, rot)) = stream.static_pose {
                for frame in frames.iter_mut() {
                    frame[bone_index] = BoneFrame { position: pos, rotation: rot };
                }
                continue;
            }

            for frame_index in 0..frame_count {
                let position = match &stream.position {
                    PositionSource::None => bone.position,
                    PositionSource::Raw(values) => values[frame_index],
                    PositionSource::Rle { x, y, z } => {
                        bone.position + Vec3::new(x[frame_index], y[frame_index], z[frame_index])
                    }
                };
                let rotation = match &stream.rotation {
                    RotationSource::None => bone.rotation,
                    RotationSource::RawEuler(values) => euler_to_quat(values[frame_index]),
                    RotationSource::RawQuat(values) => values[frame_index],
                    RotationSource::RleEuler { x, y, z } => {
                        let rest = bone.rotation_euler;
                        euler_to_quat(Vec3::new(
                            rest.x + x[frame_index],
                            rest.y + y[frame_index],
                            rest.z + z[frame_index],
                        ))
                    }
                };
                frames[frame_index][bone_index] = BoneFrame { position, rotation };
            }
        }

        Ok(frames)
    }
}

fn euler_to_quat(euler: Vec3) -> Quat {
    Quat::from_euler(EulerRot::ZYX, euler.z, euler.y, euler.x)
}

fn parse_bone_streams(
    path: &str,
    bones: &[MdlBone],
    data: &[u8],
    start: usize,
    frame_count: usize,
) -> DecodeResult<Vec<BoneStream>> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut header_pos = start;

    loop {
        let header = data
            .get(header_pos..header_pos + 4)
            .ok_or_else(|| DecodeError::malformed("anim", path, "bone header out of bounds"))?;
        let bone_index = header[0];
        if bone_index == BONE_LIST_TERMINATOR {
            break;
        }
        if !seen.insert(bone_index) {
            return Err(DecodeError::malformed("anim", path, "duplicate bone index in anim stream"));
        }
        let flags = header[1];
        let next_offset = i16::from_le_bytes([header[2], header[3]]);

        let union_start = header_pos + 4;
        let (pos_scale, rot_scale) = bones
            .get(bone_index as usize)
            .map(|b| (b.pos_scale, b.rot_scale))
            .unwrap_or((Vec3::ONE, Vec3::ONE));
        let stream = parse_bone_union(path, data, union_start, flags, frame_count, pos_scale, rot_scale)?;
        out.push(BoneStream {
            bone_index,
            position: stream.0,
            rotation: stream.1,
            static_pose: stream.2,
        });

        if next_offset == 0 {
            break;
        }
        header_pos = (header_pos as i64 + next_offset as i64) as usize;
    }

    Ok(out)
}

type BoneUnion = (PositionSource, RotationSource, Option<(Vec3, Quat)>);

fn parse_bone_union(
    path: &str,
    data: &[u8],
    union_start: usize,
    flags: u8,
    frame_count: usize,
    pos_scale: Vec3,
    rot_scale: Vec3,
) -> DecodeResult<BoneUnion> {
    let has_anim = flags & (FLAG_ANIMPOS | FLAG_ANIMROT) != 0;
    let has_raw = flags & (FLAG_RAWPOS | FLAG_RAWROT | FLAG_RAWROT2) != 0;

    if has_anim {
        let mut offsets = [0i16; 6];
        for (i, slot) in offsets.iter_mut().enumerate() {
            let at = union_start + i * 2;
            let bytes = data
                .get(at..at + 2)
                .ok_or_else(|| DecodeError::malformed("anim", path, "rle offset table out of bounds"))?;
            *slot = i16::from_le_bytes([bytes[0], bytes[1]]);
        }
        let rle_base = union_start;

        let position = if flags & FLAG_ANIMPOS != 0 {
            PositionSource::Rle {
                x: extract_anim_values(path, data, (rle_base as i64 + offsets[0] as i64) as usize, frame_count, pos_scale.x)?,
                y: extract_anim_values(path, data, (rle_base as i64 + offsets[1] as i64) as usize, frame_count, pos_scale.y)?,
                z: extract_anim_values(path, data, (rle_base as i64 + offsets[2] as i64) as usize, frame_count, pos_scale.z)?,
            }
        } else {
            PositionSource::None
        };

        let rotation = if flags & FLAG_ANIMROT != 0 {
            RotationSource::RleEuler {
                x: extract_anim_values(path, data, (rle_base as i64 + offsets[3] as i64) as usize, frame_count, rot_scale.x)?,
                y: extract_anim_values(path, data, (rle_base as i64 + offsets[4] as i64) as usize, frame_count, rot_scale.y)?,
                z: extract_anim_values(path, data, (rle_base as i64 + offsets[5] as i64) as usize, frame_count, rot_scale.z)?,
            }
        } else {
            RotationSource::None
        };

        return Ok((position, rotation, None));
    }

    if has_raw {
        let mut cursor = union_start;
        let position = if flags & FLAG_RAWPOS != 0 {
            let mut values = Vec::with_capacity(frame_count);
            for _ in 0..frame_count {
                values.push(read_float16_vec3(path, data, cursor)?);
                cursor += 6;
            }
            PositionSource::Raw(values)
        } else {
            PositionSource::None
        };

        let rotation = if flags & FLAG_RAWROT2 != 0 {
            let mut values = Vec::with_capacity(frame_count);
            for _ in 0..frame_count {
                values.push(decode_quaternion64(path, data, cursor)?);
                cursor += 8;
            }
            RotationSource::RawQuat(values)
        } else if flags & FLAG_RAWROT != 0 {
            let mut values = Vec::with_capacity(frame_count);
            for _ in 0..frame_count {
                values.push(read_float16_vec3(path, data, cursor)?);
                cursor += 6;
            }
            RotationSource::RawEuler(values)
        } else {
            RotationSource::None
        };

        return Ok((position, rotation, None));
    }

    // No anim/raw bits: 28-byte static pose (position + quaternion),
    // replicated for every frame.
    let position = read_vec3_f32(path, data, union_start)?;
    let quat_bytes = data
        .get(union_start + 12..union_start + 28)
        .ok_or_else(|| DecodeError::malformed("anim", path, "static pose out of bounds"))?;
    let rotation = Quat::from_xyzw(
        f32::from_le_bytes(quat_bytes[0..4].try_into().unwrap()),
        f32::from_le_bytes(quat_bytes[4..8].try_into().unwrap()),
        f32::from_le_bytes(quat_bytes[8..12].try_into().unwrap()),
        f32::from_le_bytes(quat_bytes[12..16].try_into().unwrap()),
    );
    Ok((PositionSource::None, RotationSource::None, Some((position, rotation))))
}

fn read_vec3_f32(path: &str, data: &[u8], offset: usize) -> DecodeResult<Vec3> {
    let slice = data
        .get(offset..offset + 12)
        .ok_or_else(|| DecodeError::malformed("anim", path, "vec3 out of bounds"))?;
    Ok(Vec3::new(
        f32::from_le_bytes(slice[0..4].try_into().unwrap()),
        f32::from_le_bytes(slice[4..8].try_into().unwrap()),
        f32::from_le_bytes(slice[8..12].try_into().unwrap()),
    ))
}

fn read_float16_vec3(path: &str, data: &[u8], offset: usize) -> DecodeResult<Vec3> {
    let slice = data
        .get(offset..offset + 6)
        .ok_or_else(|| DecodeError::malformed("anim", path, "float16 vec3 out of bounds"))?;
    Ok(Vec3::new(
        decode_float16(u16::from_le_bytes([slice[0], slice[1]])),
        decode_float16(u16::from_le_bytes([slice[2], slice[3]])),
        decode_float16(u16::from_le_bytes([slice[4], slice[5]])),
    ))
}

/// IEEE half decode with saturating NaN -> 0, +-Inf -> +-65504, layered on
/// top of the `half` crate's standard conversion.
pub(crate) fn decode_float16(bits: u16) -> f32 {
    let value = f16::from_bits(bits).to_f32();
    if value.is_nan() {
        0.0
    } else if value.is_infinite() {
        if value.is_sign_positive() { 65504.0 } else { -65504.0 }
    } else {
        value
    }
}

/// `x, y, z` each 21 bits little-endian across the 8 bytes; `w`-sign in the
/// top bit of byte 7.
pub(crate) fn decode_quaternion64(path: &str, data: &[u8], offset: usize) -> DecodeResult<Quat> {
    let slice = data
        .get(offset..offset + 8)
        .ok_or_else(|| DecodeError::malformed("anim", path, "quaternion64 out of bounds"))?;
    let bits = u64::from_le_bytes(slice.try_into().unwrap());

    let raw_x = (bits & 0x1F_FFFF) as i64;
    let raw_y = ((bits >> 21) & 0x1F_FFFF) as i64;
    let raw_z = ((bits >> 42) & 0x1F_FFFF) as i64;
    let w_sign = (bits >> 63) & 1;

    let x = (raw_x - 1_048_576) as f32 / 1_048_576.5;
    let y = (raw_y - 1_048_576) as f32 / 1_048_576.5;
    let z = (raw_z - 1_048_576) as f32 / 1_048_576.5;
    let w_sq = (1.0 - x * x - y * y - z * z).max(0.0);
    let mut w = w_sq.sqrt();
    if w_sign != 0 {
        w = -w;
    }
    Ok(Quat::from_xyzw(x, y, z, w))
}

/// `ExtractAnimValues`: reads `(valid, total)` header pairs followed by
/// `valid` signed 16-bit values scaled by `scale`, replicating the last
/// value for `total - valid` frames, repeated until `frame_count` frames
/// have been produced.
pub(crate) fn extract_anim_values(
    path: &str,
    data: &[u8],
    mut offset: usize,
    frame_count: usize,
    scale: f32,
) -> DecodeResult<Vec<f32>> {
    let mut out = Vec::with_capacity(frame_count);
    while out.len() < frame_count {
        let header = data
            .get(offset..offset + 2)
            .ok_or_else(|| DecodeError::malformed("anim", path, "rle value header out of bounds"))?;
        let valid = header[0] as usize;
        let total = header[1] as usize;
        offset += 2;

        let mut last = 0.0f32;
        for _ in 0..valid {
            let bytes = data
                .get(offset..offset + 2)
                .ok_or_else(|| DecodeError::malformed("anim", path, "rle value out of bounds"))?;
            let raw = i16::from_le_bytes([bytes[0], bytes[1]]);
            offset += 2;
            last = raw as f32 * scale;
            if out.len() < frame_count {
                out.push(last);
            }
        }
        for _ in valid..total {
            if out.len() < frame_count {
                out.push(last);
            }
        }
        if total == 0 {
            // Defensive: a zero-length record would spin forever.
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rle_channel_valid_two_total_five() {
        let mut data = Vec::new();
        data.push(2u8); // valid
        data.push(5u8); // total
        data.extend_from_slice(&100i16.to_le_bytes());
        data.extend_from_slice(&200i16.to_le_bytes());

        let values = extract_anim_values("test", &data, 0, 5, 0.001).unwrap();
        assert_eq!(values, vec![0.1, 0.2, 0.2, 0.2, 0.2]);
    }

    #[test]
    fn float16_saturates_nan_and_inf() {
        let nan_bits = 0x7E00u16; // quiet NaN
        let pos_inf = 0x7C00u16;
        let neg_inf = 0xFC00u16;
        assert_eq!(decode_float16(nan_bits), 0.0);
        assert_eq!(decode_float16(pos_inf), 65504.0);
        assert_eq!(decode_float16(neg_inf), -65504.0);
    }

    #[test]
    fn quaternion64_is_unit_length() {
        // x=y=z=0 (raw = 1048576 each), w-sign clear -> identity-like quat.
        let mut bits: u64 = 0;
        bits |= 1_048_576u64; // x
        bits |= 1_048_576u64 << 21; // y
        bits |= 1_048_576u64 << 42; // z
        let bytes = bits.to_le_bytes();
        let q = decode_quaternion64("test", &bytes, 0).unwrap();
        let len_sq = q.x * q.x + q.y * q.y + q.z * q.z + q.w * q.w;
        assert!((len_sq - 1.0).abs() < 1e-3);
    }

    #[test]
    fn static_pose_replicated_every_frame() {
        let bones = vec![MdlBone {
            name: "root".to_string(),
            parent_index: -1,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            rotation_euler: Vec3::ZERO,
            pos_scale: Vec3::ONE,
            rot_scale: Vec3::ONE,
            pose_to_bone: [0.0; 12],
            flags: crate::mdl::BoneFlags::empty(),
            surface_prop: String::new(),
            contents: 0,
        }];

        // Header: bone 0, flags 0 (static), next_offset 0, followed by a
        // 28-byte static pose of position (1,2,3) + identity quaternion.
        let mut data = Vec::new();
        data.push(0u8); // bone index
        data.push(0u8); // flags
        data.extend_from_slice(&0i16.to_le_bytes()); // next_offset
        data.extend_from_slice(&1.0f32.to_le_bytes());
        data.extend_from_slice(&2.0f32.to_le_bytes());
        data.extend_from_slice(&3.0f32.to_le_bytes());
        data.extend_from_slice(&0.0f32.to_le_bytes()); // qx
        data.extend_from_slice(&0.0f32.to_le_bytes()); // qy
        data.extend_from_slice(&0.0f32.to_le_bytes()); // qz
        data.extend_from_slice(&1.0f32.to_le_bytes()); // qw
        data.push(BONE_LIST_TERMINATOR);
        data.push(0);
        data.extend_from_slice(&0i16.to_le_bytes());

        let anim_desc = MdlAnimDesc {
            record_offset: 0,
            name: "idle".to_string(),
            fps: 30.0,
            flags: 0,
            frame_count: 30,
            anim_block_id: 0,
            anim_offset: 0,
        };

        let frames = AnimDecoder::decode_sequence("test.mdl", &bones, &data, &anim_desc, &[], None).unwrap();
        assert_eq!(frames.len(), 30);
        for frame in &frames {
            assert_eq!(frame[0].position, Vec3::new(1.0, 2.0, 3.0));
            assert_eq!(frame[0].rotation, Quat::IDENTITY);
        }
    }

    #[test]
    fn rle_position_channel_uses_bone_pos_scale() {
        let _ = env_logger::try_init();
        let bones = vec![MdlBone {
            name: "root".to_string(),
            parent_index: -1,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            rotation_euler: Vec3::ZERO,
            pos_scale: Vec3::new(0.1, 1.0, 1.0),
            rot_scale: Vec3::ONE,
            pose_to_bone: [0.0; 12],
            flags: crate::mdl::BoneFlags::empty(),
            surface_prop: String::new(),
            contents: 0,
        }];

        // Header: bone 0, FLAG_ANIMPOS, next_offset 0.
        let mut data = Vec::new();
        data.push(0u8);
        data.push(FLAG_ANIMPOS);
        data.extend_from_slice(&0i16.to_le_bytes());

        // Six RLE offsets, relative to the start of this table: all three
        // position channels point at the same single-value run right after
        // the table; the unused rotation offsets are left at zero.
        data.extend_from_slice(&12i16.to_le_bytes());
        data.extend_from_slice(&12i16.to_le_bytes());
        data.extend_from_slice(&12i16.to_le_bytes());
        data.extend_from_slice(&0i16.to_le_bytes());
        data.extend_from_slice(&0i16.to_le_bytes());
        data.extend_from_slice(&0i16.to_le_bytes());

        // valid=1, total=1, raw=100.
        data.push(1u8);
        data.push(1u8);
        data.extend_from_slice(&100i16.to_le_bytes());

        let anim_desc = MdlAnimDesc {
            record_offset: 0,
            name: "run".to_string(),
            fps: 30.0,
            flags: 0,
            frame_count: 1,
            anim_block_id: 0,
            anim_offset: 0,
        };

        let frames = AnimDecoder::decode_sequence("test.mdl", &bones, &data, &anim_desc, &[], None).unwrap();
        assert_eq!(frames[0][0].position, Vec3::new(10.0, 100.0, 100.0));
    }
}
