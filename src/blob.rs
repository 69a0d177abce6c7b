use crate::error::{DecodeError, DecodeResult};

/// An opaque byte array addressed by a normalized path.
///
/// Paths are always lowercase, forward-slash separated; `BlobStore`
/// implementations are responsible for normalizing before storing or
/// looking up a path.
#[derive(Debug, Clone)]
pub struct Blob {
    pub path: String,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Named-blob fetcher abstraction over a package archive (or any other
/// source of named byte blobs). `PkgReader` is the canonical implementation;
/// callers that already have loose files on disk can provide their own.
pub trait BlobStore {
    /// Fetches the bytes addressed by `path`, or `Err(DecodeError::NotFound)`
    /// if no such entry exists. A missing blob is not fatal on its own —
    /// callers decide whether the missing companion degrades the asset to a
    /// placeholder or is simply skipped.
    fn read(&self, path: &str) -> DecodeResult<Blob>;
}

pub(crate) fn normalize_path(path: &str) -> String {
    path.to_ascii_lowercase().replace('\\', "/")
}

/// `BlobStore` over a fixed in-memory map, used by tests and by callers that
/// already have companion files loaded (e.g. read straight off disk rather
/// than out of a PKG archive).
pub struct MemoryBlobStore {
    entries: std::collections::HashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        MemoryBlobStore {
            entries: std::collections::HashMap::new(),
        }
    }

    pub fn insert(&mut self, path: impl Into<String>, data: Vec<u8>) {
        self.entries.insert(normalize_path(&path.into()), data);
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&self, path: &str) -> DecodeResult<Blob> {
        let key = normalize_path(path);
        match self.entries.get(&key) {
            Some(data) => Ok(Blob {
                path: key,
                data: data.clone(),
            }),
            None => Err(DecodeError::NotFound { path: key }),
        }
    }
}
