use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use image::{ImageBuffer, Rgba};

use crate::error::{DecodeError, DecodeResult};

const SIGNATURE: &[u8; 4] = b"VTF\0";

/// Pixel formats this decoder understands. The full format enum on disk has
/// many more entries (floating point, cube map faces, paletted formats from
/// older versions); anything not listed here is `UnsupportedFormat` per
/// spec — decoding cube maps and float textures is an explicit non-goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    Rgba8888,
    Rgb888,
    Bgr888,
    Bgra8888,
    Dxt1,
    Dxt3,
    Dxt5,
}

impl PixelFormat {
    fn from_wire(value: i32) -> Option<PixelFormat> {
        match value {
            0 => Some(PixelFormat::Rgba8888),
            2 => Some(PixelFormat::Rgb888),
            3 => Some(PixelFormat::Bgr888),
            5 => Some(PixelFormat::Dxt1),
            6 => Some(PixelFormat::Dxt3),
            7 => Some(PixelFormat::Dxt5),
            15 => Some(PixelFormat::Bgra8888),
            _ => None,
        }
    }
}

pub type RgbaImage = ImageBuffer<Rgba<u8>, Vec<u8>>;

#[derive(Debug, Clone)]
pub struct DecodedTexture {
    pub width: u32,
    pub height: u32,
    pub image: RgbaImage,
}

/// Parses a texture blob's header and decodes its largest mip to RGBA8888.
///
/// Mips are stored smallest-first; this decoder walks the mip chain and
/// keeps only the final (largest) one, matching the "largest mip last"
/// selection rule — decoding every LOD below the highest is out of scope.
pub struct TexDecoder;

impl TexDecoder {
    pub fn decode(path: &str, data: &[u8]) -> DecodeResult<DecodedTexture> {
        let mut cursor = Cursor::new(data);

        let mut signature = [0u8; 4];
        cursor
            .read_exact(&mut signature)
            .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))?;
        if &signature != SIGNATURE {
            return Err(DecodeError::UnsupportedFormat {
                path: path.to_string(),
                format: "bad signature".to_string(),
            });
        }

        let _version_major = read_u32(&mut cursor, path)?;
        let _version_minor = read_u32(&mut cursor, path)?;
        let header_size = read_u32(&mut cursor, path)?;
        let width = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))? as u32;
        let height = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))? as u32;
        let _flags = read_u32(&mut cursor, path)?;
        let _frame_count = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))?;
        let _first_frame = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))?;
        cursor
            .seek(SeekFrom::Current(4 + 12 + 4)) // padding, reflectivity vec3, bumpmap scale
            .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))?;
        let format_value = read_i32(&mut cursor, path)?;
        let mip_count = cursor
            .read_u8()
            .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))?;

        let format = PixelFormat::from_wire(format_value).ok_or_else(|| {
            DecodeError::UnsupportedFormat {
                path: path.to_string(),
                format: format!("format id {}", format_value),
            }
        })?;

        cursor
            .seek(SeekFrom::Start(header_size as u64))
            .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))?;

        let image = decode_mip_chain(path, &mut cursor, format, width, height, mip_count)?;

        Ok(DecodedTexture {
            width,
            height,
            image,
        })
    }
}

fn read_u32(cursor: &mut Cursor<&[u8]>, path: &str) -> DecodeResult<u32> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))
}

fn read_i32(cursor: &mut Cursor<&[u8]>, path: &str) -> DecodeResult<i32> {
    cursor
        .read_i32::<LittleEndian>()
        .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))
}

fn mip_dimension(largest: u32, mips_from_largest: u32) -> u32 {
    (largest >> mips_from_largest).max(1)
}

fn decode_mip_chain(
    path: &str,
    cursor: &mut Cursor<&[u8]>,
    format: PixelFormat,
    width: u32,
    height: u32,
    mip_count: u8,
) -> DecodeResult<RgbaImage> {
    if mip_count == 0 {
        return decode_level(path, cursor, format, width, height);
    }

    // Smallest mip first. Skip every level but the last (largest).
    for level in (1..mip_count).rev() {
        let w = mip_dimension(width, level.into());
        let h = mip_dimension(height, level.into());
        skip_level(path, cursor, format, w, h)?;
    }
    decode_level(path, cursor, format, width, height)
}

fn level_byte_size(format: PixelFormat, width: u32, height: u32) -> usize {
    match format {
        PixelFormat::Rgba8888 | PixelFormat::Bgra8888 => (width * height * 4) as usize,
        PixelFormat::Rgb888 | PixelFormat::Bgr888 => (width * height * 3) as usize,
        PixelFormat::Dxt1 => {
            let blocks_x = width.div_ceil(4);
            let blocks_y = height.div_ceil(4);
            (blocks_x * blocks_y * 8) as usize
        }
        PixelFormat::Dxt3 | PixelFormat::Dxt5 => {
            let blocks_x = width.div_ceil(4);
            let blocks_y = height.div_ceil(4);
            (blocks_x * blocks_y * 16) as usize
        }
    }
}

fn skip_level(
    path: &str,
    cursor: &mut Cursor<&[u8]>,
    format: PixelFormat,
    width: u32,
    height: u32,
) -> DecodeResult<()> {
    let size = level_byte_size(format, width, height);
    cursor
        .seek(SeekFrom::Current(size as i64))
        .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))?;
    Ok(())
}

fn decode_level(
    path: &str,
    cursor: &mut Cursor<&[u8]>,
    format: PixelFormat,
    width: u32,
    height: u32,
) -> DecodeResult<RgbaImage> {
    let size = level_byte_size(format, width, height);
    let mut buf = vec![0u8; size];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| DecodeError::malformed("tex", path, e.to_string()))?;

    let mut image = RgbaImage::new(width, height);

    match format {
        PixelFormat::Rgba8888 => {
            for (i, px) in buf.chunks_exact(4).enumerate() {
                let (x, y) = (i as u32 % width, i as u32 / width);
                image.put_pixel(x, y, Rgba([px[0], px[1], px[2], px[3]]));
            }
        }
        PixelFormat::Bgra8888 => {
            for (i, px) in buf.chunks_exact(4).enumerate() {
                let (x, y) = (i as u32 % width, i as u32 / width);
                image.put_pixel(x, y, Rgba([px[2], px[1], px[0], px[3]]));
            }
        }
        PixelFormat::Rgb888 => {
            for (i, px) in buf.chunks_exact(3).enumerate() {
                let (x, y) = (i as u32 % width, i as u32 / width);
                image.put_pixel(x, y, Rgba([px[0], px[1], px[2], 255]));
            }
        }
        PixelFormat::Bgr888 => {
            for (i, px) in buf.chunks_exact(3).enumerate() {
                let (x, y) = (i as u32 % width, i as u32 / width);
                image.put_pixel(x, y, Rgba([px[2], px[1], px[0], 255]));
            }
        }
        PixelFormat::Dxt1 => decode_block_compressed(&mut image, &buf, width, height, decode_dxt1_block),
        PixelFormat::Dxt3 => decode_block_compressed(&mut image, &buf, width, height, decode_dxt3_block),
        PixelFormat::Dxt5 => decode_block_compressed(&mut image, &buf, width, height, decode_dxt5_block),
    }

    Ok(image)
}

fn decode_block_compressed(
    image: &mut RgbaImage,
    buf: &[u8],
    width: u32,
    height: u32,
    decode_block: impl Fn(&[u8]) -> [[u8; 4]; 16],
) {
    let block_size = buf.len() / (width.div_ceil(4) * height.div_ceil(4)).max(1) as usize;
    let blocks_x = width.div_ceil(4);
    let blocks_y = height.div_ceil(4);

    for by in 0..blocks_y {
        for bx in 0..blocks_x {
            let idx = (by * blocks_x + bx) as usize * block_size;
            let block = &buf[idx..idx + block_size];
            let pixels = decode_block(block);
            for py in 0..4u32 {
                for px in 0..4u32 {
                    let x = bx * 4 + px;
                    let y = by * 4 + py;
                    if x < width && y < height {
                        image.put_pixel(x, y, Rgba(pixels[(py * 4 + px) as usize]));
                    }
                }
            }
        }
    }
}

fn unpack_565(c: u16) -> [u8; 3] {
    let r = ((c >> 11) & 0x1F) as u32;
    let g = ((c >> 5) & 0x3F) as u32;
    let b = (c & 0x1F) as u32;
    [
        ((r * 255 + 15) / 31) as u8,
        ((g * 255 + 31) / 63) as u8,
        ((b * 255 + 15) / 31) as u8,
    ]
}

fn lerp_channel(a: u8, b: u8, num: u32, den: u32) -> u8 {
    ((a as u32 * (den - num) + b as u32 * num) / den) as u8
}

fn lerp_rgb(a: [u8; 3], b: [u8; 3], num: u32, den: u32) -> [u8; 3] {
    [
        lerp_channel(a[0], b[0], num, den),
        lerp_channel(a[1], b[1], num, den),
        lerp_channel(a[2], b[2], num, den),
    ]
}

fn decode_dxt1_color_block(block: &[u8]) -> [[u8; 3]; 4] {
    let c0_raw = u16::from_le_bytes([block[0], block[1]]);
    let c1_raw = u16::from_le_bytes([block[2], block[3]]);
    let c0 = unpack_565(c0_raw);
    let c1 = unpack_565(c1_raw);

    if c0_raw > c1_raw {
        [
            c0,
            c1,
            lerp_rgb(c0, c1, 1, 3),
            lerp_rgb(c0, c1, 2, 3),
        ]
    } else {
        [c0, c1, lerp_rgb(c0, c1, 1, 2), [0, 0, 0]]
    }
}

fn decode_dxt1_block(block: &[u8]) -> [[u8; 4]; 16] {
    let palette = decode_dxt1_color_block(block);
    let transparent = u16::from_le_bytes([block[0], block[1]]) <= u16::from_le_bytes([block[2], block[3]]);
    let indices = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);

    let mut out = [[0u8; 4]; 16];
    for i in 0..16 {
        let idx = ((indices >> (i * 2)) & 0x3) as usize;
        let rgb = palette[idx];
        let alpha = if transparent && idx == 3 { 0 } else { 255 };
        out[i] = [rgb[0], rgb[1], rgb[2], alpha];
    }
    out
}

fn decode_dxt3_block(block: &[u8]) -> [[u8; 4]; 16] {
    let alpha_bits = &block[0..8];
    let color_block = &block[8..16];
    let palette = decode_dxt1_color_block(color_block);
    let indices = u32::from_le_bytes([color_block[4], color_block[5], color_block[6], color_block[7]]);

    let mut out = [[0u8; 4]; 16];
    for i in 0..16 {
        let idx = ((indices >> (i * 2)) & 0x3) as usize;
        let rgb = palette[idx];
        let nibble_byte = alpha_bits[i / 2];
        let nibble = if i % 2 == 0 {
            nibble_byte & 0x0F
        } else {
            nibble_byte >> 4
        };
        let alpha = nibble * 17;
        out[i] = [rgb[0], rgb[1], rgb[2], alpha];
    }
    out
}

fn decode_dxt5_alpha(block: &[u8]) -> [u8; 16] {
    let a0 = block[0];
    let a1 = block[1];
    let mut bits: u64 = 0;
    for i in 0..6 {
        bits |= (block[2 + i] as u64) << (8 * i);
    }

    let mut palette = [0u8; 8];
    palette[0] = a0;
    palette[1] = a1;
    if a0 > a1 {
        for i in 1..7 {
            palette[1 + i] = (((7 - i) as u32 * a0 as u32 + i as u32 * a1 as u32) / 7) as u8;
        }
    } else {
        for i in 1..5 {
            palette[1 + i] = (((5 - i) as u32 * a0 as u32 + i as u32 * a1 as u32) / 5) as u8;
        }
        palette[6] = 0;
        palette[7] = 255;
    }

    let mut out = [0u8; 16];
    for i in 0..16 {
        let idx = ((bits >> (i * 3)) & 0x7) as usize;
        out[i] = palette[idx];
    }
    out
}

fn decode_dxt5_block(block: &[u8]) -> [[u8; 4]; 16] {
    let alphas = decode_dxt5_alpha(block);
    let color_block = &block[8..16];
    let palette = decode_dxt1_color_block(color_block);
    let indices = u32::from_le_bytes([color_block[4], color_block[5], color_block[6], color_block[7]]);

    let mut out = [[0u8; 4]; 16];
    for i in 0..16 {
        let idx = ((indices >> (i * 2)) & 0x3) as usize;
        let rgb = palette[idx];
        out[i] = [rgb[0], rgb[1], rgb[2], alphas[i]];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dxt1_equal_endpoints_gives_equal_palette() {
        let block = [0x00u8, 0x00, 0x00, 0x00, 0, 0, 0, 0];
        let palette = decode_dxt1_color_block(&block);
        assert_eq!(palette[0], palette[1]);
        assert_eq!(palette[1], palette[2]);
    }

    #[test]
    fn dxt5_opaque_red_block() {
        // c0 = 0xF800 (pure red 565), c1 = 0x001F (pure blue 565), color
        // indices all 0 -> every texel uses c0.
        let mut block = [0u8; 16];
        block[0] = 255; // a0
        block[1] = 255; // a1
        // alpha indices all zero already from zero-init.
        block[8] = 0x00;
        block[9] = 0xF8; // c0 = 0xF800 little-endian
        block[10] = 0x1F;
        block[11] = 0x00; // c1 = 0x001F
        let pixels = decode_dxt5_block(&block);
        for p in pixels {
            assert_eq!(p, [255, 0, 0, 255]);
        }
    }

    #[test]
    fn decoded_texture_length_matches_dimensions() {
        let mut image = RgbaImage::new(4, 4);
        for y in 0..4 {
            for x in 0..4 {
                image.put_pixel(x, y, Rgba([1, 2, 3, 4]));
            }
        }
        assert_eq!(image.as_raw().len(), 4 * 4 * 4);
    }
}
