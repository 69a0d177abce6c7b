//! Decodes Source-engine game assets — models, textures, and animations —
//! into a neutral in-memory representation.
//!
//! The crate is a pure-data pipeline: given a [`blob::BlobStore`] (typically
//! a [`pkg::PkgReader`] over a package archive) and a model path, it parses
//! the seven interrelated binary formats described in each module and joins
//! them into one [`asset::Asset`]. It has no renderer, no host resource
//! manager, and no knowledge of whatever engine ultimately consumes the
//! output — that adaptation is the caller's job.
//!
//! Entry point: [`decode`].

pub mod anim;
pub mod asset;
pub mod assembler;
pub mod blob;
pub mod error;
pub mod mdl;
pub mod phy;
pub mod pkg;
pub mod tex;
pub mod vtx;
pub mod vvd;

pub use asset::Asset;
pub use blob::BlobStore;
pub use error::{DecodeError, DecodeResult};

/// Decodes the model at `model_path` against `store`.
///
/// Never fails outright: a fatal error at any stage (bad MDL signature, a
/// missing VVD/VTX companion) degrades the result to a small placeholder
/// asset rather than propagating, per the decode state machine described in
/// `assembler`. Recoverable errors at a finer grain (one malformed mesh, one
/// animation, one physics solid) are logged and the corresponding unit is
/// simply omitted from the result.
pub fn decode(store: &dyn BlobStore, model_path: &str) -> Asset {
    assembler::Assembler::decode(store, model_path, &|| false)
        .expect("decode without an abort callback never returns None")
}

/// Same as [`decode`], but checks `abort` between top-level stages (header,
/// skeleton, meshes, materials, animations, physics) and returns `None` if
/// it ever reports `true`. Timeouts remain the caller's responsibility;
/// `abort` is purely cooperative.
pub fn decode_cancellable(store: &dyn BlobStore, model_path: &str, abort: &dyn Fn() -> bool) -> Option<Asset> {
    assembler::Assembler::decode(store, model_path, abort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[test]
    fn missing_model_yields_placeholder() {
        let store = MemoryBlobStore::new();
        let asset = decode(&store, "models/props/nonexistent.mdl");
        assert_eq!(asset.name, "nonexistent");
        assert_eq!(asset.meshes.len(), 1);
    }

    #[test]
    fn abort_before_any_work_yields_none() {
        let store = MemoryBlobStore::new();
        let result = decode_cancellable(&store, "models/props/cube.mdl", &|| true);
        assert!(result.is_none());
    }
}
