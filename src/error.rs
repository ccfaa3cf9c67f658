//! Typed failures for dataset loading and inference.
//!
//! Most functions return `anyhow::Result`; these variants are attached as the
//! root cause so callers can `downcast_ref::<DataError>()` and decide whether a
//! failure is per-sequence, per-sample or fatal.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("failed to decode image: {0}")]
    ImageDecode(PathBuf),

    #[error("camera '{camera}' missing from sequence '{sequence}'")]
    MissingCamera { sequence: String, camera: String },

    #[error("frame {frame} out of range for '{what}' (len {len})")]
    FrameOutOfRange {
        what: String,
        frame: usize,
        len: usize,
    },

    #[error("malformed annotation {path}: {reason}")]
    MalformedAnnotation { path: PathBuf, reason: String },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("unknown scene graph '{0}'")]
    UnknownSceneGraph(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
