use thiserror::Error;

/// Everything that can go wrong while decoding a Source-engine asset.
///
/// Most variants are recoverable at a granularity smaller than the whole
/// asset (see the decode state machine in `lib.rs`): a `MalformedTable` in
/// one mesh does not stop the other meshes from being emitted, and a
/// `MissingCompanion` or `InvalidModel` degrades the whole asset to a
/// placeholder rather than propagating.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid package directory in {path}: {reason}")]
    InvalidPackage { path: String, reason: String },

    #[error("blob not found: {path}")]
    NotFound { path: String },

    #[error("invalid model {path}: {reason}")]
    InvalidModel { path: String, reason: String },

    #[error("missing companion file for {model_path}: {companion}")]
    MissingCompanion {
        model_path: String,
        companion: &'static str,
    },

    #[error("malformed table in {stage} at {path}: {reason}")]
    MalformedTable {
        stage: &'static str,
        path: String,
        reason: String,
    },

    #[error("unsupported texture format in {path}: {format}")]
    UnsupportedFormat { path: String, format: String },

    #[error("decode aborted")]
    DecodeAborted,
}

impl DecodeError {
    pub(crate) fn malformed(stage: &'static str, path: impl Into<String>, reason: impl Into<String>) -> Self {
        DecodeError::MalformedTable {
            stage,
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;
