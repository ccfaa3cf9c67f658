//! Pickle-backed readers and writers.
//!
//! Sequence metadata and output artifacts are plain pickles. Per-frame 2D
//! annotation files use the `.npy` extension and may carry an NPY header in
//! front of the pickled payload.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_pickle::{DeOptions, SerOptions, Value};

use crate::error::DataError;

/// Leading bytes of every NPY file.
pub const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Deserializes a whole pickle file into `T`.
pub fn read_pickle<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_pickle::from_slice(&bytes, DeOptions::new().replace_unresolved_globals())
        .with_context(|| format!("Failed to decode pickle {}", path.display()))
}

/// Serializes `value` fully in memory, then writes it in one call.
pub fn write_pickle<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_pickle::to_vec(value, SerOptions::new())
        .with_context(|| format!("Failed to encode pickle for {}", path.display()))?;
    fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

/// Returns the payload after an NPY header, or the input unchanged.
pub fn strip_npy_header(bytes: &[u8]) -> std::result::Result<&[u8], String> {
    if !bytes.starts_with(NPY_MAGIC) {
        return Ok(bytes);
    }
    let major = *bytes.get(6).ok_or("truncated NPY version")?;
    let (len_start, len_size) = match major {
        1 => (8, 2),
        2 | 3 => (8, 4),
        v => return Err(format!("unsupported NPY version {}", v)),
    };
    let len_bytes = bytes
        .get(len_start..len_start + len_size)
        .ok_or("truncated NPY header length")?;
    let header_len = len_bytes
        .iter()
        .rev()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    let payload_start = len_start + len_size + header_len;

    let header = bytes
        .get(len_start + len_size..payload_start)
        .ok_or("truncated NPY header")?;
    let header = String::from_utf8_lossy(header);
    if !header.contains("'|O'") {
        return Err(format!("expected object dtype, got header {}", header.trim()));
    }
    Ok(&bytes[payload_start..])
}

/// First list of dicts found in `value`, searched breadth-first.
///
/// A plain pickled list is returned as is; pickled object arrays keep their
/// elements in a list nested inside the reconstruction state.
fn find_record_list(value: Value) -> Option<Vec<Value>> {
    let mut queue = std::collections::VecDeque::from([value]);
    while let Some(node) = queue.pop_front() {
        match node {
            Value::List(items) if items.iter().all(|v| matches!(v, Value::Dict(_))) => {
                return Some(items);
            }
            Value::List(items) | Value::Tuple(items) => queue.extend(items),
            Value::Dict(map) => queue.extend(map.into_values()),
            _ => {}
        }
    }
    None
}

/// Reads a per-frame annotation file as a list of records.
pub fn read_record_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let malformed = |reason: String| DataError::MalformedAnnotation {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = fs::read(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let payload = strip_npy_header(&bytes).map_err(malformed)?;
    let value = serde_pickle::value_from_slice(payload, DeOptions::new().replace_unresolved_globals())
        .map_err(|e| malformed(e.to_string()))?;
    let items = find_record_list(value).ok_or_else(|| malformed("no record list".to_string()))?;

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_pickle::from_value(item)
                .map_err(|e| anyhow::Error::from(malformed(format!("record {}: {}", i, e))))
        })
        .collect()
}
