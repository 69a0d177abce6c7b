use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::blob::{normalize_path, Blob, BlobStore};
use crate::error::{DecodeError, DecodeResult};

const SIGNATURE: u32 = 0x55AA_1234;
const BODY_IN_DIRECTORY_ARCHIVE: u16 = 0x7FFF;
const ENTRY_TERMINATOR: u16 = 0xFFFF;

#[derive(Debug, Clone)]
struct PkgEntry {
    archive_index: u16,
    entry_offset: u32,
    entry_length: u32,
    preload: Vec<u8>,
}

/// Parses a package directory and maps logical paths to blobs.
///
/// Mirrors `gsparser::wad3::WadArchive::open`'s shape (parse-once,
/// `Vec`/map of entries plus the raw directory bytes kept around for
/// preload/body-in-directory reads) but for the three-level
/// extension/directory/filename string tree described by the package
/// format rather than a flat WAD lump table.
pub struct PkgReader {
    base_dir: PathBuf,
    base_name: String,
    directory_bytes: Vec<u8>,
    directory_end: usize,
    entries: HashMap<String, PkgEntry>,
    archive_files: Mutex<HashMap<u16, PathBuf>>,
}

impl PkgReader {
    /// Opens `dir_path` (the `_dir.pkg`-equivalent directory file) and
    /// parses its string tree into a case-insensitive path map.
    pub fn open<P: AsRef<Path>>(dir_path: P) -> DecodeResult<PkgReader> {
        let dir_path = dir_path.as_ref();
        let file = File::open(dir_path).map_err(|e| DecodeError::InvalidPackage {
            path: dir_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut reader = BufReader::new(file);
        let mut directory_bytes = Vec::new();
        reader
            .read_to_end(&mut directory_bytes)
            .map_err(|e| DecodeError::InvalidPackage {
                path: dir_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let (entries, directory_end) = parse_directory(&directory_bytes, &dir_path.display().to_string())?;

        let base_dir = dir_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let base_name = base_name_of(dir_path);

        Ok(PkgReader {
            base_dir,
            base_name,
            directory_bytes,
            directory_end,
            entries,
            archive_files: Mutex::new(HashMap::new()),
        })
    }

    fn archive_path(&self, index: u16) -> PathBuf {
        self.base_dir
            .join(format!("{}_{:03}.pkg", self.base_name, index))
    }

    fn read_body(&self, index: u16, offset: u32, length: u32) -> DecodeResult<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        if index == BODY_IN_DIRECTORY_ARCHIVE {
            let start = self.directory_end + offset as usize;
            let end = start + length as usize;
            return self
                .directory_bytes
                .get(start..end)
                .map(|s| s.to_vec())
                .ok_or_else(|| {
                    DecodeError::malformed("pkg", &self.base_name, "body range out of bounds")
                });
        }

        let path = self.archive_path(index);
        let mut file = File::open(&path).map_err(|_| DecodeError::NotFound {
            path: path.display().to_string(),
        })?;
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|e| DecodeError::malformed("pkg", path.display().to_string(), e.to_string()))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)
            .map_err(|e| DecodeError::malformed("pkg", path.display().to_string(), e.to_string()))?;

        self.archive_files
            .lock()
            .unwrap()
            .entry(index)
            .or_insert(path);
        Ok(buf)
    }
}

impl BlobStore for PkgReader {
    fn read(&self, path: &str) -> DecodeResult<Blob> {
        let key = normalize_path(path);
        let entry = self
            .entries
            .get(&key)
            .ok_or_else(|| DecodeError::NotFound { path: key.clone() })?;

        let mut data = entry.preload.clone();
        let body = self.read_body(entry.archive_index, entry.entry_offset, entry.entry_length)?;
        data.extend_from_slice(&body);

        Ok(Blob { path: key, data })
    }
}

fn base_name_of(dir_path: &Path) -> String {
    let stem = dir_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("pak01");
    stem.strip_suffix("_dir").unwrap_or(stem).to_string()
}

fn read_cstring(cursor: &mut Cursor<&[u8]>) -> DecodeResult<String> {
    let mut bytes = Vec::new();
    loop {
        let b = cursor
            .read_u8()
            .map_err(|e| DecodeError::malformed("pkg", "<directory>", e.to_string()))?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Returns the parsed entries and the byte offset where the string-tree
/// parse stopped — the base for `BODY_IN_DIRECTORY_ARCHIVE` bodies, which
/// live immediately after the directory's own parsed content rather than
/// at the end of the file that contains it.
fn parse_directory(directory_bytes: &[u8], path: &str) -> DecodeResult<(HashMap<String, PkgEntry>, usize)> {
    let mut cursor = Cursor::new(directory_bytes);

    let signature = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| DecodeError::InvalidPackage {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    if signature != SIGNATURE {
        return Err(DecodeError::InvalidPackage {
            path: path.to_string(),
            reason: format!("bad signature 0x{:08X}", signature),
        });
    }
    let version = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| DecodeError::InvalidPackage {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    let _directory_length = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| DecodeError::InvalidPackage {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    if version >= 2 {
        for _ in 0..4 {
            cursor
                .read_u32::<LittleEndian>()
                .map_err(|e| DecodeError::InvalidPackage {
                    path: path.to_string(),
                    reason: e.to_string(),
                })?;
        }
    }

    let mut entries = HashMap::new();

    loop {
        let extension = read_cstring(&mut cursor)?;
        if extension.is_empty() {
            break;
        }
        loop {
            let directory = read_cstring(&mut cursor)?;
            if directory.is_empty() {
                break;
            }
            loop {
                let filename = read_cstring(&mut cursor)?;
                if filename.is_empty() {
                    break;
                }

                let _crc32 = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|e| DecodeError::malformed("pkg", path, e.to_string()))?;
                let preload_bytes = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|e| DecodeError::malformed("pkg", path, e.to_string()))?;
                let archive_index = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|e| DecodeError::malformed("pkg", path, e.to_string()))?;
                let entry_offset = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|e| DecodeError::malformed("pkg", path, e.to_string()))?;
                let entry_length = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|e| DecodeError::malformed("pkg", path, e.to_string()))?;
                let terminator = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|e| DecodeError::malformed("pkg", path, e.to_string()))?;
                if terminator != ENTRY_TERMINATOR {
                    return Err(DecodeError::malformed(
                        "pkg",
                        path,
                        format!("bad entry terminator 0x{:04X}", terminator),
                    ));
                }

                let mut preload = vec![0u8; preload_bytes as usize];
                cursor
                    .read_exact(&mut preload)
                    .map_err(|e| DecodeError::malformed("pkg", path, e.to_string()))?;

                let full_path = if directory.is_empty() {
                    format!("{}.{}", filename, extension)
                } else {
                    format!("{}/{}.{}", directory, filename, extension)
                };

                entries.insert(
                    normalize_path(&full_path),
                    PkgEntry {
                        archive_index,
                        entry_offset,
                        entry_length,
                        preload,
                    },
                );
            }
        }
    }

    Ok((entries, cursor.position() as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_directory(entries: &[(&str, &str, &str, u16, u32, u32, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SIGNATURE.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes()); // version 1, no extra section sizes
        buf.extend_from_slice(&0u32.to_le_bytes()); // directory length, unused by parser

        for (ext, dir, name, archive_index, offset, length, preload) in entries {
            buf.extend_from_slice(ext.as_bytes());
            buf.push(0);
            buf.extend_from_slice(dir.as_bytes());
            buf.push(0);
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(&0u32.to_le_bytes()); // crc32
            buf.extend_from_slice(&(preload.len() as u16).to_le_bytes());
            buf.extend_from_slice(&archive_index.to_le_bytes());
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&length.to_le_bytes());
            buf.extend_from_slice(&ENTRY_TERMINATOR.to_le_bytes());
            buf.extend_from_slice(preload);

            buf.push(0); // end filename level
            buf.push(0); // end directory level
        }
        buf.push(0); // end extension level

        buf
    }

    #[test]
    fn parses_case_insensitive_path() {
        let data = build_directory(&[(
            "mdl",
            "models/props",
            "barrel",
            BODY_IN_DIRECTORY_ARCHIVE,
            0,
            4,
            b"xxxx",
        )]);
        let (entries, _) = parse_directory(&data, "test.pkg").unwrap();
        assert!(entries.contains_key("models/props/barrel.mdl"));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut data = build_directory(&[]);
        data[0] = 0;
        let err = parse_directory(&data, "test.pkg").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPackage { .. }));
    }

    #[test]
    fn body_in_directory_archive_reads_past_directory_end() {
        let entries = [(
            "mdl",
            "models",
            "cube",
            BODY_IN_DIRECTORY_ARCHIVE,
            0u32,
            3u32,
            &b""[..],
        )];
        let mut data = build_directory(&entries);
        data.extend_from_slice(b"abc");

        let (parsed, directory_end) = parse_directory(&data, "test.pkg").unwrap();
        let entry = parsed.get("models/cube.mdl").unwrap();
        assert_eq!(entry.archive_index, BODY_IN_DIRECTORY_ARCHIVE);
        assert_eq!(entry.entry_length, 3);
        assert_eq!(&data[directory_end..directory_end + 3], b"abc");
    }

    #[test]
    fn open_reads_embedded_body_past_directory_end() {
        let _ = env_logger::try_init();
        use std::io::Write;

        let entries = [(
            "mdl",
            "models",
            "cube",
            BODY_IN_DIRECTORY_ARCHIVE,
            0u32,
            3u32,
            &b""[..],
        )];
        let mut data = build_directory(&entries);
        data.extend_from_slice(b"abc");

        let dir = std::env::temp_dir().join(format!("pkgreader_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let dir_path = dir.join("pak01_dir.pkg");
        let mut file = std::fs::File::create(&dir_path).unwrap();
        file.write_all(&data).unwrap();
        drop(file);

        let reader = PkgReader::open(&dir_path).unwrap();
        let blob = reader.read("models/cube.mdl").unwrap();
        assert_eq!(blob.data, b"abc");

        std::fs::remove_dir_all(&dir).ok();
    }
}
