use async_trait::async_trait;
use bytes::Bytes;

use crate::error::IoError;

/// Trait for random-access byte reads over a slide container.
///
/// This abstraction lets the TIFF and iSyntax parsers work against either a
/// local file or a remote HTTPS range endpoint without downloading the whole
/// container. Implementations must be thread-safe: decode workers issue
/// concurrent reads.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Returns an error if the range is out of bounds or if the read fails.
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError>;

    /// Read an ordered list of `(offset, len)` ranges and return the
    /// concatenated bytes, in request order.
    ///
    /// For a file source this is N positional reads. For a remote source the
    /// whole batch must collapse into a single request so that a wishlist of
    /// tiles costs one round trip.
    async fn read_batch(&self, requests: &[(u64, usize)]) -> Result<Bytes, IoError> {
        let mut out = bytes::BytesMut::with_capacity(requests.iter().map(|r| r.1).sum());
        for &(offset, len) in requests {
            out.extend_from_slice(&self.read_exact_at(offset, len).await?);
        }
        Ok(out.freeze())
    }

    /// Get the total size of the resource in bytes.
    fn size(&self) -> u64;

    /// Get a unique identifier for this resource (for logging and cache keys).
    fn identifier(&self) -> &str;

    /// Whether reads go over the network. The streamer throttles and batches
    /// requests for remote sources.
    fn is_remote(&self) -> bool {
        false
    }
}

#[async_trait]
impl<T: ByteSource + ?Sized> ByteSource for std::sync::Arc<T> {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        (**self).read_exact_at(offset, len).await
    }

    async fn read_batch(&self, requests: &[(u64, usize)]) -> Result<Bytes, IoError> {
        (**self).read_batch(requests).await
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn identifier(&self) -> &str {
        (**self).identifier()
    }

    fn is_remote(&self) -> bool {
        (**self).is_remote()
    }
}

// =============================================================================
// Endian Helper Functions
// =============================================================================
//
// TIFF files can be either little-endian or big-endian, determined by the
// magic bytes at the start of the file. iSyntax binary structures are always
// little-endian. These helpers are used extensively by both parsers.

/// Read a little-endian u16 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 2 bytes.
#[inline]
pub fn read_u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Read a big-endian u16 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 2 bytes.
#[inline]
pub fn read_u16_be(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Read a little-endian u32 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 4 bytes.
#[inline]
pub fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read a big-endian u32 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 4 bytes.
#[inline]
pub fn read_u32_be(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read a little-endian u64 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 8 bytes.
#[inline]
pub fn read_u64_le(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Read a big-endian u64 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 8 bytes.
#[inline]
pub fn read_u64_be(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
