//! TIFF header and IFD structure parsing.
//!
//! This module handles parsing of TIFF and BigTIFF file headers and the IFD
//! chain, which is the foundation for all subsequent parsing operations.
//!
//! # TIFF Header Structure
//!
//! ## Classic TIFF (8 bytes)
//! ```text
//! Bytes 0-1: Byte order (0x4949 = little-endian "II", 0x4D4D = big-endian "MM")
//! Bytes 2-3: Version (42 = 0x002A)
//! Bytes 4-7: Offset to first IFD (4 bytes)
//! ```
//!
//! ## BigTIFF (16 bytes)
//! ```text
//! Bytes 0-1: Byte order
//! Bytes 2-3: Version (43 = 0x002B)
//! Bytes 4-5: Offset byte size (must be 8)
//! Bytes 6-7: Reserved (must be 0)
//! Bytes 8-15: Offset to first IFD (8 bytes)
//! ```
//!
//! # IFD Structure
//!
//! An IFD is an entry count (u16 / u64), followed by N tag entries
//! (12 / 20 bytes each), followed by the offset of the next IFD
//! (u32 / u64, 0 terminates the chain). Entry values that fit in the
//! value/offset field are stored inline; larger values live at an offset
//! elsewhere in the file.

use crate::error::TiffError;
use crate::io::{read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le};

use super::tags::{FieldType, TiffTag};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes indicating little-endian byte order ("II" for Intel)
const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;

/// Magic bytes indicating big-endian byte order ("MM" for Motorola)
const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;

/// Version number for classic TIFF
const VERSION_TIFF: u16 = 42;

/// Version number for BigTIFF
const VERSION_BIGTIFF: u16 = 43;

/// Size of classic TIFF header in bytes
pub const TIFF_HEADER_SIZE: usize = 8;

/// Size of BigTIFF header in bytes
pub const BIGTIFF_HEADER_SIZE: usize = 16;

// =============================================================================
// ByteOrder
// =============================================================================

/// Byte order (endianness) of a TIFF file.
///
/// TIFF files declare their byte order in the first two bytes of the header.
/// All multi-byte values in the file must be read respecting this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian ("II" = Intel)
    LittleEndian,
    /// Big-endian ("MM" = Motorola)
    BigEndian,
}

impl ByteOrder {
    /// Read a u16 from a byte slice using this byte order.
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            ByteOrder::LittleEndian => read_u16_le(bytes),
            ByteOrder::BigEndian => read_u16_be(bytes),
        }
    }

    /// Read a u32 from a byte slice using this byte order.
    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        match self {
            ByteOrder::LittleEndian => read_u32_le(bytes),
            ByteOrder::BigEndian => read_u32_be(bytes),
        }
    }

    /// Read a u64 from a byte slice using this byte order.
    #[inline]
    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        match self {
            ByteOrder::LittleEndian => read_u64_le(bytes),
            ByteOrder::BigEndian => read_u64_be(bytes),
        }
    }
}

// =============================================================================
// TiffHeader
// =============================================================================

/// Parsed TIFF file header.
///
/// Contains the essential information needed to begin parsing IFDs:
/// - Byte order for reading all subsequent values
/// - Whether this is classic TIFF or BigTIFF (affects entry sizes and widths)
/// - Location of the first IFD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    /// Byte order for all multi-byte values in the file
    pub byte_order: ByteOrder,

    /// Whether this is a BigTIFF file (64-bit offsets)
    pub is_bigtiff: bool,

    /// Offset to the first IFD in the file
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse a TIFF header from raw bytes.
    ///
    /// The input must contain at least 8 bytes for classic TIFF or 16 bytes
    /// for BigTIFF.
    ///
    /// # Errors
    /// - `BadMagic` if byte order bytes are not II or MM
    /// - `BadVersion` if version is not 42 or 43
    /// - `BadOffsetSize` if BigTIFF offset size is not 8
    /// - `TruncatedIfd` if there aren't enough bytes for the header
    /// - `BadIfdOffset` if the first IFD offset is outside the file
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, TiffError> {
        if bytes.len() < TIFF_HEADER_SIZE {
            return Err(TiffError::TruncatedIfd {
                offset: 0,
                required: TIFF_HEADER_SIZE as u64,
            });
        }

        // The byte-order indicator is endianness-symmetric, read as LE
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            _ => return Err(TiffError::BadMagic(magic)),
        };

        let version = byte_order.read_u16(&bytes[2..4]);

        match version {
            VERSION_TIFF => {
                let first_ifd_offset = byte_order.read_u32(&bytes[4..8]) as u64;

                if first_ifd_offset >= file_size {
                    return Err(TiffError::BadIfdOffset(first_ifd_offset));
                }

                Ok(TiffHeader {
                    byte_order,
                    is_bigtiff: false,
                    first_ifd_offset,
                })
            }
            VERSION_BIGTIFF => {
                if bytes.len() < BIGTIFF_HEADER_SIZE {
                    return Err(TiffError::TruncatedIfd {
                        offset: 0,
                        required: BIGTIFF_HEADER_SIZE as u64,
                    });
                }

                let offset_size = byte_order.read_u16(&bytes[4..6]);
                if offset_size != 8 {
                    return Err(TiffError::BadOffsetSize(offset_size));
                }

                // Bytes 6-7 are reserved; not strictly validated

                let first_ifd_offset = byte_order.read_u64(&bytes[8..16]);

                if first_ifd_offset >= file_size {
                    return Err(TiffError::BadIfdOffset(first_ifd_offset));
                }

                Ok(TiffHeader {
                    byte_order,
                    is_bigtiff: true,
                    first_ifd_offset,
                })
            }
            _ => Err(TiffError::BadVersion(version)),
        }
    }

    /// Size of an IFD entry in bytes.
    ///
    /// Classic TIFF: 12 bytes (2 tag + 2 type + 4 count + 4 value/offset)
    /// BigTIFF: 20 bytes (2 tag + 2 type + 8 count + 8 value/offset)
    #[inline]
    pub const fn ifd_entry_size(&self) -> usize {
        if self.is_bigtiff {
            20
        } else {
            12
        }
    }

    /// Size of the entry count field at the start of an IFD.
    #[inline]
    pub const fn ifd_count_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            2
        }
    }

    /// Size of the next-IFD offset field at the end of an IFD.
    #[inline]
    pub const fn ifd_next_offset_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }

    /// Size of the value/offset field in an IFD entry.
    ///
    /// This determines the inline value threshold.
    #[inline]
    pub const fn value_offset_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }
}

// =============================================================================
// IfdEntry
// =============================================================================

/// A single parsed IFD tag entry.
///
/// The entry keeps the raw value/offset bytes so that values can be decoded
/// lazily: small values inline, large values via a follow-up range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdEntry {
    /// Raw 16-bit tag ID (kept even for unrecognized tags)
    pub tag_id: u16,

    /// Decoded field type, `None` if the type code is unknown
    pub field_type: Option<FieldType>,

    /// Raw field type code
    pub field_type_raw: u16,

    /// Number of values of `field_type`
    pub count: u64,

    /// The raw value/offset field (4 bytes classic, 8 bytes BigTIFF)
    pub value_offset_bytes: Vec<u8>,

    /// Whether the value is stored inline in `value_offset_bytes`
    pub is_inline: bool,
}

impl IfdEntry {
    /// Parse one entry from its raw bytes.
    fn parse(bytes: &[u8], header: &TiffHeader) -> Self {
        let bo = header.byte_order;
        let tag_id = bo.read_u16(&bytes[0..2]);
        let field_type_raw = bo.read_u16(&bytes[2..4]);
        let field_type = FieldType::from_u16(field_type_raw);

        let (count, value_bytes) = if header.is_bigtiff {
            (bo.read_u64(&bytes[4..12]), &bytes[12..20])
        } else {
            (bo.read_u32(&bytes[4..8]) as u64, &bytes[8..12])
        };

        let is_inline = field_type
            .map(|ft| ft.fits_inline(count, header.is_bigtiff))
            .unwrap_or(false);

        Self {
            tag_id,
            field_type,
            field_type_raw,
            count,
            value_offset_bytes: value_bytes.to_vec(),
            is_inline,
        }
    }

    /// Total byte size of this entry's value, if the field type is known.
    pub fn value_byte_size(&self) -> Option<u64> {
        self.field_type
            .map(|ft| ft.size_in_bytes() as u64 * self.count)
    }

    /// Interpret the value/offset field as a file offset.
    pub fn value_offset(&self, byte_order: ByteOrder) -> u64 {
        if self.value_offset_bytes.len() == 8 {
            byte_order.read_u64(&self.value_offset_bytes)
        } else {
            byte_order.read_u32(&self.value_offset_bytes) as u64
        }
    }

    /// Read a single inline u32 value, if this entry holds one.
    pub fn inline_u32(&self, byte_order: ByteOrder) -> Option<u32> {
        if !self.is_inline || self.count != 1 {
            return None;
        }
        match self.field_type? {
            FieldType::Byte => Some(self.value_offset_bytes[0] as u32),
            FieldType::Short => Some(byte_order.read_u16(&self.value_offset_bytes) as u32),
            FieldType::Long => Some(byte_order.read_u32(&self.value_offset_bytes)),
            _ => None,
        }
    }

    /// Read a single inline u64 value, if this entry holds one.
    pub fn inline_u64(&self, byte_order: ByteOrder) -> Option<u64> {
        if !self.is_inline || self.count != 1 {
            return None;
        }
        match self.field_type? {
            FieldType::Byte => Some(self.value_offset_bytes[0] as u64),
            FieldType::Short => Some(byte_order.read_u16(&self.value_offset_bytes) as u64),
            FieldType::Long => Some(byte_order.read_u32(&self.value_offset_bytes) as u64),
            FieldType::Long8 => Some(byte_order.read_u64(&self.value_offset_bytes)),
            _ => None,
        }
    }
}

// =============================================================================
// Ifd
// =============================================================================

/// A parsed Image File Directory.
///
/// Holds the tag entries in file order plus the offset of the next IFD in
/// the chain (0 = end of chain).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ifd {
    /// Tag entries in file order
    pub entries: Vec<IfdEntry>,

    /// Offset of the next IFD (0 terminates the chain)
    pub next_ifd_offset: u64,
}

impl Ifd {
    /// An IFD with no entries (useful in tests).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Total byte size of an IFD with `entry_count` entries.
    pub fn calculate_size(entry_count: u64, header: &TiffHeader) -> usize {
        header.ifd_count_size()
            + entry_count as usize * header.ifd_entry_size()
            + header.ifd_next_offset_size()
    }

    /// Parse an IFD from raw bytes covering the count field, all entries,
    /// and the next-IFD offset.
    ///
    /// # Errors
    /// `TruncatedIfd` if the byte slice is shorter than the declared layout.
    pub fn parse(bytes: &[u8], header: &TiffHeader) -> Result<Self, TiffError> {
        let count_size = header.ifd_count_size();
        if bytes.len() < count_size {
            return Err(TiffError::TruncatedIfd {
                offset: 0,
                required: count_size as u64,
            });
        }

        let entry_count = if header.is_bigtiff {
            header.byte_order.read_u64(&bytes[..8])
        } else {
            header.byte_order.read_u16(&bytes[..2]) as u64
        };

        let required = Self::calculate_size(entry_count, header);
        if bytes.len() < required {
            return Err(TiffError::TruncatedIfd {
                offset: 0,
                required: required as u64,
            });
        }

        let entry_size = header.ifd_entry_size();
        let mut entries = Vec::with_capacity(entry_count as usize);
        for i in 0..entry_count as usize {
            let start = count_size + i * entry_size;
            entries.push(IfdEntry::parse(&bytes[start..start + entry_size], header));
        }

        let next_start = count_size + entry_count as usize * entry_size;
        let next_ifd_offset = if header.is_bigtiff {
            header.byte_order.read_u64(&bytes[next_start..next_start + 8])
        } else {
            header.byte_order.read_u32(&bytes[next_start..next_start + 4]) as u64
        };

        Ok(Self {
            entries,
            next_ifd_offset,
        })
    }

    /// Find an entry by tag.
    pub fn get_entry_by_tag(&self, tag: TiffTag) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag_id == tag.as_u16())
    }

    /// Whether this IFD describes a tiled image.
    pub fn is_tiled(&self) -> bool {
        self.get_entry_by_tag(TiffTag::TileWidth).is_some()
            && self.get_entry_by_tag(TiffTag::TileOffsets).is_some()
    }

    /// Whether this IFD describes a strip-organised image.
    pub fn is_striped(&self) -> bool {
        self.get_entry_by_tag(TiffTag::StripOffsets).is_some() && !self.is_tiled()
    }

    fn inline_tag_u32(&self, tag: TiffTag, byte_order: ByteOrder) -> Option<u32> {
        self.get_entry_by_tag(tag)?.inline_u32(byte_order)
    }

    /// Image width in pixels, when stored inline.
    pub fn image_width(&self, byte_order: ByteOrder) -> Option<u32> {
        self.inline_tag_u32(TiffTag::ImageWidth, byte_order)
    }

    /// Image height in pixels, when stored inline.
    pub fn image_height(&self, byte_order: ByteOrder) -> Option<u32> {
        self.inline_tag_u32(TiffTag::ImageLength, byte_order)
    }

    /// Tile width in pixels, when stored inline.
    pub fn tile_width(&self, byte_order: ByteOrder) -> Option<u32> {
        self.inline_tag_u32(TiffTag::TileWidth, byte_order)
    }

    /// Tile height in pixels, when stored inline.
    pub fn tile_height(&self, byte_order: ByteOrder) -> Option<u32> {
        self.inline_tag_u32(TiffTag::TileLength, byte_order)
    }

    /// Compression code, when stored inline.
    pub fn compression(&self, byte_order: ByteOrder) -> Option<u16> {
        self.inline_tag_u32(TiffTag::Compression, byte_order)
            .map(|v| v as u16)
    }

    /// Photometric interpretation code, when stored inline.
    pub fn photometric(&self, byte_order: ByteOrder) -> Option<u16> {
        self.inline_tag_u32(TiffTag::PhotometricInterpretation, byte_order)
            .map(|v| v as u16)
    }

    /// NewSubfileType flags, when stored inline.
    pub fn new_subfile_type(&self, byte_order: ByteOrder) -> Option<u32> {
        self.inline_tag_u32(TiffTag::NewSubfileType, byte_order)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // TiffHeader Parsing Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_tiff_little_endian() {
        let header = [
            0x49, 0x49, // II (little-endian)
            0x2A, 0x00, // Version 42
            0x08, 0x00, 0x00, 0x00, // First IFD offset = 8
        ];

        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert_eq!(result.byte_order, ByteOrder::LittleEndian);
        assert!(!result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 8);
    }

    #[test]
    fn test_parse_tiff_big_endian() {
        let header = [
            0x4D, 0x4D, // MM (big-endian)
            0x00, 0x2A, // Version 42
            0x00, 0x00, 0x00, 0x08, // First IFD offset = 8
        ];

        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert_eq!(result.byte_order, ByteOrder::BigEndian);
        assert!(!result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 8);
    }

    #[test]
    fn test_parse_bigtiff() {
        let header = [
            0x49, 0x49, // II
            0x2B, 0x00, // Version 43 (BigTIFF)
            0x08, 0x00, // Offset size = 8
            0x00, 0x00, // Reserved
            0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // First IFD offset = 16
        ];

        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert!(result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 16);
    }

    #[test]
    fn test_parse_bigtiff_large_offset() {
        let header = [
            0x49, 0x49, 0x2B, 0x00, 0x08, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, // First IFD at 4GB
        ];

        let result = TiffHeader::parse(&header, 10_000_000_000).unwrap();
        assert_eq!(result.first_ifd_offset, 0x0000_0001_0000_0000);
    }

    #[test]
    fn test_parse_invalid_magic() {
        let header = [0x00, 0x00, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00];
        let result = TiffHeader::parse(&header, 1000);
        assert!(matches!(result, Err(TiffError::BadMagic(0x0000))));
    }

    #[test]
    fn test_parse_invalid_version() {
        let header = [0x49, 0x49, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00];
        let result = TiffHeader::parse(&header, 1000);
        assert!(matches!(result, Err(TiffError::BadVersion(0))));
    }

    #[test]
    fn test_parse_bigtiff_invalid_offset_size() {
        let header = [
            0x49, 0x49, 0x2B, 0x00, 0x04, 0x00, 0x00, 0x00, //
            0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let result = TiffHeader::parse(&header, 1000);
        assert!(matches!(result, Err(TiffError::BadOffsetSize(4))));
    }

    #[test]
    fn test_parse_truncated_header() {
        let result = TiffHeader::parse(&[0x49, 0x49, 0x2A, 0x00], 1000);
        assert!(matches!(result, Err(TiffError::TruncatedIfd { .. })));
    }

    #[test]
    fn test_parse_ifd_offset_beyond_file() {
        let header = [0x49, 0x49, 0x2A, 0x00, 0xE8, 0x03, 0x00, 0x00];
        let result = TiffHeader::parse(&header, 500);
        assert!(matches!(result, Err(TiffError::BadIfdOffset(1000))));
    }

    #[test]
    fn test_header_field_sizes() {
        let tiff = TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: false,
            first_ifd_offset: 8,
        };
        assert_eq!(tiff.ifd_entry_size(), 12);
        assert_eq!(tiff.ifd_count_size(), 2);
        assert_eq!(tiff.value_offset_size(), 4);

        let bigtiff = TiffHeader {
            is_bigtiff: true,
            ..tiff
        };
        assert_eq!(bigtiff.ifd_entry_size(), 20);
        assert_eq!(bigtiff.ifd_count_size(), 8);
        assert_eq!(bigtiff.value_offset_size(), 8);
    }

    // -------------------------------------------------------------------------
    // Ifd / IfdEntry Parsing Tests
    // -------------------------------------------------------------------------

    fn tiff_le_header() -> TiffHeader {
        TiffHeader {
            byte_order: ByteOrder::LittleEndian,
            is_bigtiff: false,
            first_ifd_offset: 8,
        }
    }

    /// Build a classic little-endian IFD with the given entries.
    fn build_ifd(entries: &[(u16, u16, u32, [u8; 4])], next: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for &(tag, field_type, count, value) in entries {
            bytes.extend_from_slice(&tag.to_le_bytes());
            bytes.extend_from_slice(&field_type.to_le_bytes());
            bytes.extend_from_slice(&count.to_le_bytes());
            bytes.extend_from_slice(&value);
        }
        bytes.extend_from_slice(&next.to_le_bytes());
        bytes
    }

    #[test]
    fn test_parse_ifd_entries() {
        let bytes = build_ifd(
            &[
                (256, 4, 1, 1024u32.to_le_bytes()), // ImageWidth = 1024 (LONG)
                (257, 3, 1, [0x00, 0x03, 0, 0]),    // ImageLength = 768 (SHORT)
            ],
            4096,
        );

        let header = tiff_le_header();
        let ifd = Ifd::parse(&bytes, &header).unwrap();

        assert_eq!(ifd.entries.len(), 2);
        assert_eq!(ifd.next_ifd_offset, 4096);
        assert_eq!(ifd.image_width(header.byte_order), Some(1024));
        assert_eq!(ifd.image_height(header.byte_order), Some(768));
    }

    #[test]
    fn test_parse_ifd_truncated() {
        let bytes = build_ifd(&[(256, 4, 1, [0, 0, 0, 0])], 0);
        let result = Ifd::parse(&bytes[..bytes.len() - 6], &tiff_le_header());
        assert!(matches!(result, Err(TiffError::TruncatedIfd { .. })));
    }

    #[test]
    fn test_entry_inline_vs_offset() {
        // LONG count 1 = inline; LONG count 4 = offset in classic TIFF
        let bytes = build_ifd(
            &[
                (324, 4, 1, 100u32.to_le_bytes()),
                (324, 4, 4, 2000u32.to_le_bytes()),
            ],
            0,
        );
        let header = tiff_le_header();
        let ifd = Ifd::parse(&bytes, &header).unwrap();

        assert!(ifd.entries[0].is_inline);
        assert!(!ifd.entries[1].is_inline);
        assert_eq!(ifd.entries[1].value_offset(header.byte_order), 2000);
        assert_eq!(ifd.entries[1].value_byte_size(), Some(16));
    }

    #[test]
    fn test_is_tiled_and_striped() {
        let header = tiff_le_header();

        let tiled = Ifd::parse(
            &build_ifd(
                &[
                    (322, 4, 1, 512u32.to_le_bytes()),
                    (324, 4, 1, 100u32.to_le_bytes()),
                ],
                0,
            ),
            &header,
        )
        .unwrap();
        assert!(tiled.is_tiled());
        assert!(!tiled.is_striped());

        let striped = Ifd::parse(
            &build_ifd(&[(273, 4, 1, 100u32.to_le_bytes())], 0),
            &header,
        )
        .unwrap();
        assert!(!striped.is_tiled());
        assert!(striped.is_striped());
    }

    #[test]
    fn test_unknown_tag_kept_raw() {
        let header = tiff_le_header();
        let ifd = Ifd::parse(
            &build_ifd(&[(60000, 4, 1, 7u32.to_le_bytes())], 0),
            &header,
        )
        .unwrap();
        assert_eq!(ifd.entries[0].tag_id, 60000);
        assert_eq!(ifd.entries[0].inline_u32(header.byte_order), Some(7));
    }
}
