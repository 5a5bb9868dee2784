//! TIFF tag value reading.
//!
//! Values can be stored either inline in the IFD entry (for small values)
//! or at an offset in the file (for larger values like arrays).
//!
//! For array values (like TileOffsets and TileByteCounts), the entire array
//! is fetched in a single range request — essential when the source is a
//! remote range endpoint.

use bytes::Bytes;

use crate::error::TiffError;
use crate::io::ByteSource;

use super::parser::{ByteOrder, IfdEntry, TiffHeader};
use super::tags::FieldType;

// =============================================================================
// ValueReader
// =============================================================================

/// Reads tag values from a TIFF file.
///
/// Combines a [`ByteSource`] with TIFF header information to read values
/// respecting the file's byte order and format.
pub struct ValueReader<'a, S: ByteSource> {
    source: &'a S,
    header: &'a TiffHeader,
}

impl<'a, S: ByteSource> ValueReader<'a, S> {
    /// Create a new ValueReader.
    pub fn new(source: &'a S, header: &'a TiffHeader) -> Self {
        Self { source, header }
    }

    /// Get the byte order from the header.
    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order
    }

    /// Read raw bytes for an IFD entry's value.
    ///
    /// For inline values, returns the bytes from the entry.
    /// For offset values, fetches the bytes from the file.
    pub async fn read_bytes(&self, entry: &IfdEntry) -> Result<Bytes, TiffError> {
        let size = entry
            .value_byte_size()
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if entry.is_inline {
            Ok(Bytes::copy_from_slice(
                &entry.value_offset_bytes[..size as usize],
            ))
        } else {
            let offset = entry.value_offset(self.header.byte_order);
            let bytes = self.source.read_exact_at(offset, size as usize).await?;
            Ok(bytes)
        }
    }

    /// Read a single u32 value from an entry.
    ///
    /// Handles both Short and Long field types, converting as needed.
    pub async fn read_u32(&self, entry: &IfdEntry) -> Result<u32, TiffError> {
        if let Some(value) = entry.inline_u32(self.header.byte_order) {
            return Ok(value);
        }

        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if entry.count != 1 {
            return Err(TiffError::BadTagValue {
                tag: "scalar",
                message: format!("expected count 1, got {}", entry.count),
            });
        }

        let bytes = self.read_bytes(entry).await?;
        let byte_order = self.header.byte_order;

        match field_type {
            FieldType::Short => Ok(byte_order.read_u16(&bytes) as u32),
            FieldType::Long => Ok(byte_order.read_u32(&bytes)),
            _ => Err(TiffError::BadTagValue {
                tag: "scalar",
                message: format!("expected Short or Long, got {:?}", field_type),
            }),
        }
    }

    /// Read an array of u64 values from an entry.
    ///
    /// This is the primary method for reading TileOffsets and TileByteCounts.
    /// Handles Short, Long, and Long8 field types, converting all to u64.
    pub async fn read_u64_array(&self, entry: &IfdEntry) -> Result<Vec<u64>, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        let count = entry.count as usize;
        if count == 0 {
            return Ok(Vec::new());
        }

        let bytes = self.read_bytes(entry).await?;
        Ok(parse_u64_array(
            &bytes,
            count,
            field_type,
            self.header.byte_order,
        ))
    }

    /// Read an array of u32 values from an entry.
    pub async fn read_u32_array(&self, entry: &IfdEntry) -> Result<Vec<u32>, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        let count = entry.count as usize;
        if count == 0 {
            return Ok(Vec::new());
        }

        let bytes = self.read_bytes(entry).await?;
        Ok(parse_u32_array(
            &bytes,
            count,
            field_type,
            self.header.byte_order,
        ))
    }

    /// Read a RATIONAL value as (numerator, denominator).
    ///
    /// Used for XResolution / YResolution.
    pub async fn read_rational(&self, entry: &IfdEntry) -> Result<(u32, u32), TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if field_type != FieldType::Rational {
            return Err(TiffError::BadTagValue {
                tag: "rational",
                message: format!("expected Rational, got {:?}", field_type),
            });
        }

        let bytes = self.read_bytes(entry).await?;
        let byte_order = self.header.byte_order;
        let numerator = byte_order.read_u32(&bytes[0..4]);
        let denominator = byte_order.read_u32(&bytes[4..8]);
        Ok((numerator, denominator))
    }

    /// Read a string value from an entry (ASCII type).
    ///
    /// The string is expected to be null-terminated; the terminator is
    /// stripped from the result.
    pub async fn read_string(&self, entry: &IfdEntry) -> Result<String, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if field_type != FieldType::Ascii {
            return Err(TiffError::BadTagValue {
                tag: "string",
                message: format!("expected Ascii type for string, got {:?}", field_type),
            });
        }

        let bytes = self.read_bytes(entry).await?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let s = String::from_utf8_lossy(&bytes[..end]).into_owned();

        Ok(s)
    }

    /// Read raw bytes from an entry (for UNDEFINED or opaque data).
    ///
    /// This is used for JPEGTables and other binary data.
    pub async fn read_raw_bytes(&self, entry: &IfdEntry) -> Result<Bytes, TiffError> {
        self.read_bytes(entry).await
    }
}

// =============================================================================
// Convenience functions for reading from bytes directly
// =============================================================================

/// Parse an array of u64 values from raw bytes.
pub fn parse_u64_array(
    bytes: &[u8],
    count: usize,
    field_type: FieldType,
    byte_order: ByteOrder,
) -> Vec<u64> {
    let mut values = Vec::with_capacity(count);

    match field_type {
        FieldType::Short => {
            for i in 0..count {
                let offset = i * 2;
                if offset + 2 <= bytes.len() {
                    values.push(byte_order.read_u16(&bytes[offset..]) as u64);
                }
            }
        }
        FieldType::Long => {
            for i in 0..count {
                let offset = i * 4;
                if offset + 4 <= bytes.len() {
                    values.push(byte_order.read_u32(&bytes[offset..]) as u64);
                }
            }
        }
        FieldType::Long8 => {
            for i in 0..count {
                let offset = i * 8;
                if offset + 8 <= bytes.len() {
                    values.push(byte_order.read_u64(&bytes[offset..]));
                }
            }
        }
        _ => {}
    }

    values
}

/// Parse an array of u32 values from raw bytes.
pub fn parse_u32_array(
    bytes: &[u8],
    count: usize,
    field_type: FieldType,
    byte_order: ByteOrder,
) -> Vec<u32> {
    let mut values = Vec::with_capacity(count);

    match field_type {
        FieldType::Short => {
            for i in 0..count {
                let offset = i * 2;
                if offset + 2 <= bytes.len() {
                    values.push(byte_order.read_u16(&bytes[offset..]) as u32);
                }
            }
        }
        FieldType::Long => {
            for i in 0..count {
                let offset = i * 4;
                if offset + 4 <= bytes.len() {
                    values.push(byte_order.read_u32(&bytes[offset..]));
                }
            }
        }
        _ => {}
    }

    values
}

// =============================================================================
// Tests
// =============================================================================
