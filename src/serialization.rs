//! Serialization support.
//!
//! Two independent layers:
//!
//! - [`StreamSerializable`]: the versioned binary stream format. Each
//!   object starts with a NUL-terminated ASCII tag and a `u16` version;
//!   counts and integers are big-endian, floats are little-endian `f32`.
//!   Objects are self-delimiting, so several can be concatenated in one
//!   stream. Readers reject unknown versions with
//!   [`VelesError::UnsupportedVersion`].
//! - [`Serializable`] (requires the `serde` feature): convenience layer
//!   over serde with binary (bincode) and JSON formats, including file
//!   helpers.

use crate::error::{Result, VelesError};
use std::io::{Read, Write};

#[cfg(feature = "serde")]
use std::fs::File;
#[cfg(feature = "serde")]
use std::io::{BufReader, BufWriter};
#[cfg(feature = "serde")]
use std::path::Path;

#[cfg(feature = "serde")]
use serde::{de::DeserializeOwned, Serialize};

/// Stream format version for SDR objects.
pub const SDR_STREAM_VERSION: u16 = 1;

/// Stream format version for Spatial Pooler objects.
pub const SP_STREAM_VERSION: u16 = 1;

/// Versioned binary stream encoding.
///
/// # Example
///
/// ```rust
/// use veles::serialization::StreamSerializable;
/// use veles::types::Sdr;
///
/// let mut sdr = Sdr::new(&[3, 3]).unwrap();
/// sdr.set_sparse(&[1, 4, 8]).unwrap();
///
/// let bytes = sdr.to_stream_bytes().unwrap();
/// let restored = Sdr::from_stream_bytes(&bytes).unwrap();
/// assert_eq!(sdr, restored);
/// ```
pub trait StreamSerializable: Sized {
    /// Writes this object to the stream.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::IoError`] on write failures.
    fn save_stream<W: Write>(&self, writer: &mut W) -> Result<()>;

    /// Reads one object from the stream.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::IoError`] on read failures,
    /// [`VelesError::UnsupportedVersion`] for an unknown version, and
    /// [`VelesError::SerializationError`] for a malformed stream.
    fn load_stream<R: Read>(reader: &mut R) -> Result<Self>;

    /// Serializes to an in-memory byte vector.
    ///
    /// # Errors
    ///
    /// See [`StreamSerializable::save_stream`].
    fn to_stream_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.save_stream(&mut buffer)?;
        Ok(buffer)
    }

    /// Deserializes from a byte slice.
    ///
    /// # Errors
    ///
    /// See [`StreamSerializable::load_stream`].
    fn from_stream_bytes(mut bytes: &[u8]) -> Result<Self> {
        Self::load_stream(&mut bytes)
    }
}

/// Low-level field encoding shared by the stream implementations.
pub(crate) mod wire {
    use super::{Read, Result, VelesError, Write};

    fn io_err(e: std::io::Error) -> VelesError {
        VelesError::IoError {
            message: e.to_string(),
        }
    }

    pub(crate) fn write_tag<W: Write>(w: &mut W, tag: &str) -> Result<()> {
        w.write_all(tag.as_bytes()).map_err(io_err)?;
        w.write_all(&[0]).map_err(io_err)
    }

    pub(crate) fn read_tag<R: Read>(r: &mut R, expected: &str) -> Result<()> {
        let mut buf = vec![0u8; expected.len() + 1];
        r.read_exact(&mut buf).map_err(io_err)?;
        if &buf[..expected.len()] != expected.as_bytes() || buf[expected.len()] != 0 {
            return Err(VelesError::SerializationError {
                message: format!("expected object tag {expected:?}"),
            });
        }
        Ok(())
    }

    pub(crate) fn write_u8<W: Write>(w: &mut W, value: u8) -> Result<()> {
        w.write_all(&[value]).map_err(io_err)
    }

    pub(crate) fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
        let mut buf = [0u8; 1];
        r.read_exact(&mut buf).map_err(io_err)?;
        Ok(buf[0])
    }

    pub(crate) fn write_u16_be<W: Write>(w: &mut W, value: u16) -> Result<()> {
        w.write_all(&value.to_be_bytes()).map_err(io_err)
    }

    pub(crate) fn read_u16_be<R: Read>(r: &mut R) -> Result<u16> {
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).map_err(io_err)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub(crate) fn write_u32_be<W: Write>(w: &mut W, value: u32) -> Result<()> {
        w.write_all(&value.to_be_bytes()).map_err(io_err)
    }

    pub(crate) fn read_u32_be<R: Read>(r: &mut R) -> Result<u32> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).map_err(io_err)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub(crate) fn write_u64_be<W: Write>(w: &mut W, value: u64) -> Result<()> {
        w.write_all(&value.to_be_bytes()).map_err(io_err)
    }

    pub(crate) fn read_u64_be<R: Read>(r: &mut R) -> Result<u64> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf).map_err(io_err)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub(crate) fn write_f32_le<W: Write>(w: &mut W, value: f32) -> Result<()> {
        w.write_all(&value.to_le_bytes()).map_err(io_err)
    }

    pub(crate) fn read_f32_le<R: Read>(r: &mut R) -> Result<f32> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).map_err(io_err)?;
        Ok(f32::from_le_bytes(buf))
    }

    pub(crate) fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
        w.write_all(bytes).map_err(io_err)
    }

    pub(crate) fn read_bytes<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).map_err(io_err)?;
        Ok(buf)
    }
}

/// Serialization format options for the serde layer.
#[cfg(feature = "serde")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializableFormat {
    /// Fast binary serialization (default).
    #[default]
    Binary,

    /// Human-readable JSON.
    Json,
}

#[cfg(feature = "serde")]
impl std::fmt::Display for SerializableFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializableFormat::Binary => write!(f, "BINARY"),
            SerializableFormat::Json => write!(f, "JSON"),
        }
    }
}

#[cfg(feature = "serde")]
impl std::str::FromStr for SerializableFormat {
    type Err = VelesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "BINARY" | "BIN" => Ok(SerializableFormat::Binary),
            "JSON" => Ok(SerializableFormat::Json),
            _ => Err(VelesError::InvalidParameter {
                name: "format",
                message: format!("unknown format '{s}', expected BINARY or JSON"),
            }),
        }
    }
}

/// Serde-backed serialization with binary and JSON formats.
#[cfg(feature = "serde")]
pub trait Serializable: Serialize + DeserializeOwned + Sized {
    /// Serializes to a byte vector.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::SerializationError`] on encoding failures.
    fn to_bytes(&self, format: SerializableFormat) -> Result<Vec<u8>> {
        match format {
            SerializableFormat::Binary => {
                bincode::serialize(self).map_err(|e| VelesError::SerializationError {
                    message: format!("binary serialization failed: {e}"),
                })
            }
            SerializableFormat::Json => {
                serde_json::to_vec_pretty(self).map_err(|e| VelesError::SerializationError {
                    message: format!("JSON serialization failed: {e}"),
                })
            }
        }
    }

    /// Deserializes from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::SerializationError`] on decoding failures.
    fn from_bytes(bytes: &[u8], format: SerializableFormat) -> Result<Self> {
        match format {
            SerializableFormat::Binary => {
                bincode::deserialize(bytes).map_err(|e| VelesError::SerializationError {
                    message: format!("binary deserialization failed: {e}"),
                })
            }
            SerializableFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| VelesError::SerializationError {
                    message: format!("JSON deserialization failed: {e}"),
                })
            }
        }
    }

    /// Serializes to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::SerializationError`] on encoding failures.
    fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| VelesError::SerializationError {
            message: format!("JSON serialization failed: {e}"),
        })
    }

    /// Deserializes from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::SerializationError`] on decoding failures.
    fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VelesError::SerializationError {
            message: format!("JSON deserialization failed: {e}"),
        })
    }

    /// Serializes into a writer.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::SerializationError`] on encoding failures.
    fn save<W: Write>(&self, writer: W, format: SerializableFormat) -> Result<()> {
        let mut writer = BufWriter::new(writer);
        match format {
            SerializableFormat::Binary => bincode::serialize_into(&mut writer, self)
                .map_err(|e| VelesError::SerializationError {
                    message: format!("binary serialization failed: {e}"),
                }),
            SerializableFormat::Json => serde_json::to_writer_pretty(&mut writer, self)
                .map_err(|e| VelesError::SerializationError {
                    message: format!("JSON serialization failed: {e}"),
                }),
        }
    }

    /// Deserializes from a reader.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::SerializationError`] on decoding failures.
    fn load<R: Read>(reader: R, format: SerializableFormat) -> Result<Self> {
        let mut reader = BufReader::new(reader);
        match format {
            SerializableFormat::Binary => bincode::deserialize_from(&mut reader)
                .map_err(|e| VelesError::SerializationError {
                    message: format!("binary deserialization failed: {e}"),
                }),
            SerializableFormat::Json => serde_json::from_reader(&mut reader)
                .map_err(|e| VelesError::SerializationError {
                    message: format!("JSON deserialization failed: {e}"),
                }),
        }
    }

    /// Saves to a file.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::IoError`] if the file cannot be created.
    fn save_to_file<P: AsRef<Path>>(&self, path: P, format: SerializableFormat) -> Result<()> {
        let file = File::create(path.as_ref()).map_err(|e| VelesError::IoError {
            message: format!("failed to create file: {e}"),
        })?;
        self.save(file, format)
    }

    /// Loads from a file.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::IoError`] if the file cannot be opened.
    fn load_from_file<P: AsRef<Path>>(path: P, format: SerializableFormat) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| VelesError::IoError {
            message: format!("failed to open file: {e}"),
        })?;
        Self::load(file, format)
    }
}

/// Blanket implementation for all serde-capable types.
#[cfg(feature = "serde")]
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Sized {}
