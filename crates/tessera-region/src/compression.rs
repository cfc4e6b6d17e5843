//! Payload compression schemes.
//!
//! The scheme id is stored in the fifth byte of every slot. Bit `0x80` of that
//! byte marks a payload kept in an external file and is not part of the id.

use std::fmt;
use std::io::{self, Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::error::PayloadError;

/// Flag bit on the stored scheme byte marking an externally stored payload.
pub const EXTERNAL_FLAG: u8 = 0x80;

/// Compression applied to a stored chunk payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionScheme {
    None = 0,
    Gzip = 1,
    #[default]
    Zlib = 2,
}

impl CompressionScheme {
    /// Identifier written to disk
    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Look up a scheme by its on-disk identifier.
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Zlib),
            _ => None,
        }
    }

    /// Compress a payload.
    pub fn compress(self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }

    /// Decompress a payload, refusing output larger than `limit` bytes.
    pub fn decompress(self, data: &[u8], limit: usize) -> Result<Vec<u8>, PayloadError> {
        match self {
            Self::None => {
                if data.len() > limit {
                    return Err(PayloadError::TooLarge { limit });
                }
                Ok(data.to_vec())
            }
            Self::Gzip => self.read_bounded(GzDecoder::new(data), limit),
            Self::Zlib => self.read_bounded(ZlibDecoder::new(data), limit),
        }
    }

    fn read_bounded(self, reader: impl Read, limit: usize) -> Result<Vec<u8>, PayloadError> {
        let mut out = Vec::new();
        reader
            .take(limit as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|source| PayloadError::Malformed { scheme: self, source })?;
        if out.len() > limit {
            return Err(PayloadError::TooLarge { limit });
        }
        Ok(out)
    }
}

impl TryFrom<u8> for CompressionScheme {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, u8> {
        Self::from_id(id).ok_or(id)
    }
}

impl fmt::Display for CompressionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "uncompressed",
            Self::Gzip => "gzip",
            Self::Zlib => "zlib",
        })
    }
}
