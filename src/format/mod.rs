//! Format parsers for Whole Slide Image containers.
//!
//! Three on-disk families are supported natively:
//! - **TIFF / BigTIFF** pyramids of JPEG-compressed tiles ([`tiff`])
//! - **iSyntax** wavelet containers ([`isyntax`])
//! - plain single-level rasters, decoded whole (the *simple* backend)
//!
//! [`detect_format`] classifies a source by magic bytes so `open_image` can
//! pick the right parser without a filename hint.

pub mod isyntax;
pub mod jpeg;
pub mod tiff;

use crate::error::{ImageError, IoError};
use crate::io::ByteSource;

/// Detected container family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideFormat {
    /// TIFF or BigTIFF tiled JPEG pyramid
    Tiff,
    /// Philips iSyntax wavelet container
    Isyntax,
    /// A plain raster image decoded as a single level
    Simple,
}

impl SlideFormat {
    /// Human-readable format name.
    pub const fn name(&self) -> &'static str {
        match self {
            SlideFormat::Tiff => "TIFF",
            SlideFormat::Isyntax => "iSyntax",
            SlideFormat::Simple => "simple image",
        }
    }
}

/// Check whether a byte prefix looks like a TIFF/BigTIFF header.
pub fn is_tiff_header(bytes: &[u8]) -> bool {
    if bytes.len() < 4 {
        return false;
    }
    let ii = bytes[0] == 0x49 && bytes[1] == 0x49;
    let mm = bytes[0] == 0x4D && bytes[1] == 0x4D;
    if !ii && !mm {
        return false;
    }
    let version = if ii {
        u16::from_le_bytes([bytes[2], bytes[3]])
    } else {
        u16::from_be_bytes([bytes[2], bytes[3]])
    };
    version == 42 || version == 43
}

/// Check whether a byte prefix looks like an iSyntax XML header.
pub fn is_isyntax_header(bytes: &[u8]) -> bool {
    // The container opens with an XML declaration or the root DataObject.
    let trimmed: &[u8] = {
        let mut b = bytes;
        while let [first, rest @ ..] = b {
            if first.is_ascii_whitespace() {
                b = rest;
            } else {
                break;
            }
        }
        b
    };
    trimmed.starts_with(b"<?xml") || trimmed.starts_with(b"<DataObject")
}

/// Detect the slide format from the first bytes of the source.
///
/// JPEG and PNG magic map to the simple backend; anything unrecognised is
/// an `UnsupportedFormat` error.
pub async fn detect_format<S: ByteSource>(source: &S) -> Result<SlideFormat, ImageError> {
    let prefix_len = 16usize.min(source.size() as usize);
    if prefix_len < 4 {
        return Err(ImageError::UnsupportedFormat {
            reason: "file too small".to_string(),
        });
    }
    let prefix = source
        .read_exact_at(0, prefix_len)
        .await
        .map_err(|e: IoError| ImageError::Io(e))?;

    if is_tiff_header(&prefix) {
        return Ok(SlideFormat::Tiff);
    }
    if is_isyntax_header(&prefix) {
        return Ok(SlideFormat::Isyntax);
    }
    // Stock raster formats decode through the simple backend
    if prefix.starts_with(&[0xFF, 0xD8]) || prefix.starts_with(b"\x89PNG") {
        return Ok(SlideFormat::Simple);
    }

    Err(ImageError::UnsupportedFormat {
        reason: "unrecognised container magic".to_string(),
    })
}
