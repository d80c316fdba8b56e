//! Raw volume files: little-endian `f32`, x-fastest, no header.
//!
//! The extent is not stored in the file; it comes from the solve description
//! and the file size must match it exactly.

use std::path::Path;

use hmflow_core::{Extent, Volume};

use crate::error::ConfigError;

const VALUE_BYTES: usize = core::mem::size_of::<f32>();

/// Reads a raw volume of the given extent.
pub fn read_volume(path: impl AsRef<Path>, extent: Extent) -> Result<Volume, ConfigError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| ConfigError::read_file(path, e))?;
    decode_volume(&bytes, extent).ok_or_else(|| ConfigError::VolumeSize {
        path: path.to_path_buf(),
        extent,
        expected: extent.field_bytes(),
        actual: bytes.len(),
    })
}

/// Writes a volume as raw little-endian `f32`, creating parent directories.
pub fn write_volume(path: impl AsRef<Path>, volume: &Volume) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
    }
    std::fs::write(path, encode_volume(volume)).map_err(|e| ConfigError::write_file(path, e))
}

/// Decodes raw bytes; `None` if the length does not match `extent`.
pub fn decode_volume(bytes: &[u8], extent: Extent) -> Option<Volume> {
    if bytes.len() != extent.voxels() * VALUE_BYTES {
        return None;
    }
    let values = bytes
        .chunks_exact(VALUE_BYTES)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Volume::from_vec(extent, values)
}

/// Encodes a volume as raw little-endian bytes.
pub fn encode_volume(volume: &Volume) -> Vec<u8> {
    volume
        .as_slice()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}
