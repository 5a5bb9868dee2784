//! JPEG tile stream handling and decoding.
//!
//! WSI TIFF pyramids store *abbreviated* JPEG streams to save space: each
//! tile's payload lacks the quantization (DQT) and Huffman (DHT) tables
//! needed for decoding. The tables are stored once per level in the TIFF's
//! `JPEGTables` tag; before a tile can be decoded its payload must be
//! recombined with those shared tables into one complete stream.
//!
//! The module works on *marker segments*: a JPEG stream is a sequence of
//! `FF xx` markers, most carrying a big-endian length and payload, with the
//! entropy-coded scan data trailing the SOS marker. [`SegmentWalker`]
//! iterates that structure; [`classify_stream`] uses it to decide whether a
//! payload already carries its tables, and [`merge_jpeg_tables`] splices
//! the shared tables in front of an abbreviated payload.
//!
//! A payload of `FF D9` alone (or a zero byte count in the tile table) is
//! an empty/background tile: it decodes to fully transparent pixels with
//! no error.

use bytes::{Bytes, BytesMut};

use crate::error::JpegError;

// =============================================================================
// JPEG Markers
// =============================================================================

/// Start Of Image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// End Of Image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Marker code for Define Quantization Table
pub const MARKER_DQT: u8 = 0xDB;

/// Marker code for Define Huffman Table
pub const MARKER_DHT: u8 = 0xC4;

/// Marker code for Start Of Scan
pub const MARKER_SOS: u8 = 0xDA;

const MARKER_SOI: u8 = 0xD8;
const MARKER_EOI: u8 = 0xD9;
const MARKER_TEM: u8 = 0x01;

/// True for RST0..RST7, which appear inside entropy-coded data.
#[inline]
fn is_restart_marker(code: u8) -> bool {
    (0xD0..=0xD7).contains(&code)
}

// =============================================================================
// Marker segment walking
// =============================================================================

/// One structural piece of a JPEG stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    /// SOI, EOI or TEM: a bare marker with no payload
    Bare(u8),
    /// A marker with a length-prefixed payload (length bytes excluded)
    Tagged { code: u8, payload: &'a [u8] },
    /// Entropy-coded bytes following SOS, up to the next true marker
    ScanData(&'a [u8]),
}

/// Iterator over the marker segments of a JPEG byte stream.
///
/// Stops silently at the first structural inconsistency (truncated length,
/// desynchronised marker): callers treat an incomplete walk as "not the
/// kind of stream I was looking for" rather than an error, because broken
/// payloads surface later as a decoder failure on the real pixels path.
pub(crate) struct SegmentWalker<'a> {
    data: &'a [u8],
    pos: usize,
    in_scan: bool,
}

impl<'a> SegmentWalker<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            in_scan: false,
        }
    }

    /// Consume entropy-coded bytes until a marker that is neither a
    /// stuffed `FF 00` nor a restart.
    fn take_scan_data(&mut self) -> Segment<'a> {
        let start = self.pos;
        let mut at = self.pos;
        let mut stop = self.data.len();
        while at + 1 < self.data.len() {
            if self.data[at] != 0xFF {
                at += 1;
                continue;
            }
            let code = self.data[at + 1];
            if code == 0x00 || is_restart_marker(code) {
                at += 2; // stays inside the scan
                continue;
            }
            stop = at;
            break;
        }
        self.pos = stop;
        self.in_scan = false;
        Segment::ScanData(&self.data[start..stop])
    }
}

impl<'a> Iterator for SegmentWalker<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Segment<'a>> {
        if self.in_scan {
            return Some(self.take_scan_data());
        }

        // Skip optional fill bytes before the marker
        while self.pos + 1 < self.data.len()
            && self.data[self.pos] == 0xFF
            && self.data[self.pos + 1] == 0xFF
        {
            self.pos += 1;
        }

        if self.pos + 1 >= self.data.len() || self.data[self.pos] != 0xFF {
            return None;
        }
        let code = self.data[self.pos + 1];

        match code {
            MARKER_SOI | MARKER_EOI | MARKER_TEM => {
                self.pos += 2;
                Some(Segment::Bare(code))
            }
            code if is_restart_marker(code) => {
                self.pos += 2;
                Some(Segment::Bare(code))
            }
            code => {
                // Length-bearing segment: u16 BE length including itself
                if self.pos + 4 > self.data.len() {
                    return None;
                }
                let declared =
                    u16::from_be_bytes([self.data[self.pos + 2], self.data[self.pos + 3]])
                        as usize;
                if declared < 2 || self.pos + 2 + declared > self.data.len() {
                    return None;
                }
                let payload = &self.data[self.pos + 4..self.pos + 2 + declared];
                self.pos += 2 + declared;
                if code == MARKER_SOS {
                    self.in_scan = true;
                }
                Some(Segment::Tagged { code, payload })
            }
        }
    }
}

// =============================================================================
// Stream classification
// =============================================================================

/// What a tile payload turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `FF D9` alone (or nothing): an empty/background tile
    Empty,
    /// Carries its own DQT/DHT tables; decodable as-is
    Complete,
    /// Reaches the scan without any tables; needs the shared tables
    Abbreviated,
    /// Not recognisably a JPEG stream
    Unknown,
}

/// Check if a payload is an empty-tile stream (`FF D9` only).
#[inline]
pub fn is_empty_stream(data: &[u8]) -> bool {
    data.is_empty() || data == EOI
}

/// Classify a tile payload by walking its marker segments.
pub fn classify_stream(data: &[u8]) -> StreamKind {
    if is_empty_stream(data) {
        return StreamKind::Empty;
    }

    let mut segments = SegmentWalker::new(data);
    if segments.next() != Some(Segment::Bare(MARKER_SOI)) {
        return StreamKind::Unknown;
    }

    for segment in segments {
        match segment {
            Segment::Tagged {
                code: MARKER_DQT | MARKER_DHT,
                ..
            } => return StreamKind::Complete,
            Segment::Tagged {
                code: MARKER_SOS, ..
            } => return StreamKind::Abbreviated,
            _ => {}
        }
    }

    StreamKind::Unknown
}

// =============================================================================
// Table merging
// =============================================================================

/// Splice shared JPEG tables in front of an abbreviated tile payload.
///
/// The tables stream is a complete miniature JPEG (`SOI tables EOI`); the
/// result keeps its SOI and table segments, drops its EOI, drops the
/// tile's SOI, and continues with the tile's frame/scan segments through
/// its EOI: one decodable stream.
pub fn merge_jpeg_tables(tables: &[u8], tile_data: &[u8]) -> Bytes {
    if tables.is_empty() {
        return Bytes::copy_from_slice(tile_data);
    }
    if tile_data.is_empty() {
        return Bytes::new();
    }

    let tables_head = tables.strip_suffix(&EOI).unwrap_or(tables);
    let tile_tail = tile_data.strip_prefix(&SOI).unwrap_or(tile_data);

    let mut merged = BytesMut::with_capacity(tables_head.len() + tile_tail.len());
    merged.extend_from_slice(tables_head);
    merged.extend_from_slice(tile_tail);
    merged.freeze()
}

/// Prepare tile data for decoding, merging tables when the payload needs
/// them. Complete and unrecognised payloads pass through unchanged (the
/// latter fail later, at the decoder, with a proper error).
pub fn prepare_tile_jpeg(tables: Option<&[u8]>, tile_data: &[u8]) -> Bytes {
    match (classify_stream(tile_data), tables) {
        (StreamKind::Abbreviated, Some(tables)) => merge_jpeg_tables(tables, tile_data),
        _ => Bytes::copy_from_slice(tile_data),
    }
}

// =============================================================================
// Tile Decoding
// =============================================================================

/// Decode a JPEG tile payload into a BGRA buffer of `tile_w * tile_h * 4`.
///
/// `valid_w` / `valid_h` bound the region of the tile that lies inside the
/// image; pixels beyond the valid extent (right/bottom edge tiles) are fully
/// transparent. An empty stream leaves the whole tile transparent.
///
/// YCbCr streams are colour-converted by the decoder; the output is packed
/// as B, G, R, A bytes in memory.
pub fn decode_tile_bgra(
    tables: Option<&[u8]>,
    payload: &[u8],
    tile_w: u32,
    tile_h: u32,
    valid_w: u32,
    valid_h: u32,
    out: &mut [u8],
) -> Result<(), JpegError> {
    debug_assert_eq!(out.len(), (tile_w * tile_h * 4) as usize);

    out.fill(0);

    if is_empty_stream(payload) {
        return Ok(());
    }

    let prepared = prepare_tile_jpeg(tables, payload);

    let decoded = image::load_from_memory_with_format(&prepared, image::ImageFormat::Jpeg)
        .map_err(|e| JpegError::Decode(e.to_string()))?;
    let rgb = decoded.to_rgb8();

    let (got_w, got_h) = rgb.dimensions();
    if got_w < valid_w || got_h < valid_h {
        return Err(JpegError::DimensionMismatch {
            got_w,
            got_h,
            tile_w,
            tile_h,
        });
    }

    let src = rgb.as_raw();
    let copy_w = valid_w.min(tile_w) as usize;
    let copy_h = valid_h.min(tile_h) as usize;

    for y in 0..copy_h {
        let src_row = y * got_w as usize * 3;
        let dst_row = y * tile_w as usize * 4;
        for x in 0..copy_w {
            let s = src_row + x * 3;
            let d = dst_row + x * 4;
            out[d] = src[s + 2]; // B
            out[d + 1] = src[s + 1]; // G
            out[d + 2] = src[s]; // R
            out[d + 3] = 255;
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialise one length-bearing segment.
    fn tagged(code: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0xFF, code];
        out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Build a stream from SOI, the given segments, and EOI.
    fn stream(segments: &[Vec<u8>]) -> Vec<u8> {
        let mut out = SOI.to_vec();
        for segment in segments {
            out.extend_from_slice(segment);
        }
        out.extend_from_slice(&EOI);
        out
    }

    /// Encode a solid-colour JPEG through the real encoder.
    fn encode_solid(size: u32, rgb: [u8; 3]) -> Vec<u8> {
        let mut img = image::RgbImage::new(size, size);
        for px in img.pixels_mut() {
            *px = image::Rgb(rgb);
        }
        let mut encoded = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, 92)
            .encode_image(&img)
            .unwrap();
        encoded
    }

    /// Split a complete JPEG into a tables stream and an abbreviated tile
    /// stream, the way a TIFF writer populates JPEGTables.
    fn split_tables(full: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut tables = SOI.to_vec();
        let mut tile = SOI.to_vec();

        for segment in SegmentWalker::new(full) {
            match segment {
                Segment::Bare(MARKER_SOI) | Segment::Bare(MARKER_EOI) => {}
                Segment::Bare(code) => tile.extend_from_slice(&[0xFF, code]),
                Segment::Tagged { code, payload } => {
                    let dest = if code == MARKER_DQT || code == MARKER_DHT {
                        &mut tables
                    } else {
                        &mut tile
                    };
                    dest.extend_from_slice(&tagged(code, payload));
                }
                Segment::ScanData(data) => tile.extend_from_slice(data),
            }
        }

        tables.extend_from_slice(&EOI);
        tile.extend_from_slice(&EOI);
        (tables, tile)
    }

    // -------------------------------------------------------------------------
    // SegmentWalker
    // -------------------------------------------------------------------------

    #[test]
    fn test_walker_yields_segment_structure() {
        let data = stream(&[
            tagged(0xE0, b"JFIF\0"),
            tagged(MARKER_DQT, &[0x00, 1, 2, 3]),
            tagged(MARKER_SOS, &[0x01, 0x01, 0x00]),
            vec![0x12, 0x34, 0xFF, 0x00, 0x56], // entropy data with a stuffed FF
        ]);

        let segments: Vec<Segment<'_>> = SegmentWalker::new(&data).collect();
        assert_eq!(segments.len(), 6);
        assert_eq!(segments[0], Segment::Bare(MARKER_SOI));
        assert!(matches!(segments[1], Segment::Tagged { code: 0xE0, .. }));
        assert!(matches!(
            segments[2],
            Segment::Tagged {
                code: MARKER_DQT,
                payload: &[0x00, 1, 2, 3]
            }
        ));
        assert!(matches!(segments[3], Segment::Tagged { code: MARKER_SOS, .. }));
        assert_eq!(
            segments[4],
            Segment::ScanData(&[0x12, 0x34, 0xFF, 0x00, 0x56])
        );
        assert_eq!(segments[5], Segment::Bare(MARKER_EOI));
    }

    #[test]
    fn test_walker_keeps_restarts_inside_scan() {
        let data = stream(&[
            tagged(MARKER_SOS, &[0x01]),
            vec![0xAA, 0xFF, 0xD3, 0xBB], // RST3 belongs to the scan
        ]);

        let segments: Vec<Segment<'_>> = SegmentWalker::new(&data).collect();
        assert_eq!(segments[2], Segment::ScanData(&[0xAA, 0xFF, 0xD3, 0xBB]));
        assert_eq!(segments[3], Segment::Bare(MARKER_EOI));
    }

    #[test]
    fn test_walker_skips_fill_bytes() {
        let mut data = vec![0xFF, 0xFF, 0xFF]; // fill
        data.extend_from_slice(&SOI);
        let segments: Vec<Segment<'_>> = SegmentWalker::new(&data).collect();
        assert_eq!(segments, vec![Segment::Bare(MARKER_SOI)]);
    }

    #[test]
    fn test_walker_stops_on_truncated_length() {
        let mut data = SOI.to_vec();
        data.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x40, 0x01]); // claims 64, has 1
        let segments: Vec<Segment<'_>> = SegmentWalker::new(&data).collect();
        assert_eq!(segments, vec![Segment::Bare(MARKER_SOI)]);
    }

    #[test]
    fn test_walker_stops_on_desync() {
        let segments: Vec<Segment<'_>> = SegmentWalker::new(b"not a jpeg").collect();
        assert!(segments.is_empty());
    }

    // -------------------------------------------------------------------------
    // classify_stream
    // -------------------------------------------------------------------------

    #[test]
    fn test_classify_empty() {
        assert_eq!(classify_stream(&[]), StreamKind::Empty);
        assert_eq!(classify_stream(&EOI), StreamKind::Empty);
    }

    #[test]
    fn test_classify_complete_on_either_table_kind() {
        let with_dqt = stream(&[tagged(MARKER_DQT, &[0x00; 5])]);
        assert_eq!(classify_stream(&with_dqt), StreamKind::Complete);

        let with_dht = stream(&[tagged(MARKER_DHT, &[0x00; 5])]);
        assert_eq!(classify_stream(&with_dht), StreamKind::Complete);
    }

    #[test]
    fn test_classify_abbreviated_when_scan_precedes_tables() {
        let data = stream(&[
            tagged(0xC0, &[8, 0, 16, 0, 16, 3]), // frame header, no tables
            tagged(MARKER_SOS, &[0x01, 0x01, 0x00]),
            vec![0x55, 0x66],
        ]);
        assert_eq!(classify_stream(&data), StreamKind::Abbreviated);
    }

    #[test]
    fn test_classify_rejects_non_jpeg() {
        assert_eq!(classify_stream(b"<?xml"), StreamKind::Unknown);
        assert_eq!(classify_stream(&[0xFF, 0xDB, 0x00, 0x02]), StreamKind::Unknown);
    }

    #[test]
    fn test_classify_real_encoder_output_is_complete() {
        let encoded = encode_solid(16, [128, 64, 32]);
        assert_eq!(classify_stream(&encoded), StreamKind::Complete);
    }

    // -------------------------------------------------------------------------
    // merge + split round trip
    // -------------------------------------------------------------------------

    #[test]
    fn test_split_then_merge_reproduces_decodable_stream() {
        // Take a real JPEG apart into JPEGTables + abbreviated payload,
        // then merge them back and decode: the pixels must match the
        // original decode exactly.
        let full = encode_solid(16, [200, 100, 50]);
        let (tables, abbreviated) = split_tables(&full);

        assert_eq!(classify_stream(&tables), StreamKind::Complete);
        assert_eq!(classify_stream(&abbreviated), StreamKind::Abbreviated);

        let mut from_merged = vec![0u8; 16 * 16 * 4];
        decode_tile_bgra(Some(&tables), &abbreviated, 16, 16, 16, 16, &mut from_merged)
            .unwrap();

        let mut from_original = vec![0u8; 16 * 16 * 4];
        decode_tile_bgra(None, &full, 16, 16, 16, 16, &mut from_original).unwrap();

        assert_eq!(from_merged, from_original);
    }

    #[test]
    fn test_merged_stream_has_single_soi_and_trailing_eoi() {
        let full = encode_solid(8, [10, 20, 30]);
        let (tables, abbreviated) = split_tables(&full);

        let merged = merge_jpeg_tables(&tables, &abbreviated);
        assert_eq!(&merged[..2], &SOI);
        assert_eq!(&merged[merged.len() - 2..], &EOI);
        assert_eq!(merged.windows(2).filter(|w| *w == SOI).count(), 1);
        assert_eq!(classify_stream(&merged), StreamKind::Complete);
    }

    #[test]
    fn test_merge_degenerate_inputs() {
        let tile = stream(&[tagged(MARKER_SOS, &[0x01])]);

        // No tables: the payload passes through untouched
        assert_eq!(&merge_jpeg_tables(&[], &tile)[..], &tile[..]);
        // No payload: nothing to decode
        assert!(merge_jpeg_tables(&stream(&[]), &[]).is_empty());
    }

    #[test]
    fn test_merge_tolerates_unterminated_tables() {
        // A tables blob without its EOI still splices cleanly
        let mut tables = SOI.to_vec();
        tables.extend_from_slice(&tagged(MARKER_DQT, &[0x00; 4]));
        let tile = stream(&[tagged(MARKER_SOS, &[0x01]), vec![0x77]]);

        let merged = merge_jpeg_tables(&tables, &tile);
        assert_eq!(&merged[..2], &SOI);
        assert_eq!(&merged[merged.len() - 2..], &EOI);
        assert_eq!(classify_stream(&merged), StreamKind::Complete);
    }

    #[test]
    fn test_prepare_leaves_complete_payloads_alone() {
        let full = encode_solid(8, [1, 2, 3]);
        let (tables, _) = split_tables(&full);

        let prepared = prepare_tile_jpeg(Some(&tables), &full);
        assert_eq!(&prepared[..], &full[..]);
    }

    #[test]
    fn test_prepare_merges_only_abbreviated_payloads() {
        let full = encode_solid(8, [1, 2, 3]);
        let (tables, abbreviated) = split_tables(&full);

        let prepared = prepare_tile_jpeg(Some(&tables), &abbreviated);
        assert!(prepared.len() > abbreviated.len());
        assert_eq!(classify_stream(&prepared), StreamKind::Complete);

        // Without tables there is nothing to merge with
        let untouched = prepare_tile_jpeg(None, &abbreviated);
        assert_eq!(&untouched[..], &abbreviated[..]);
    }

    // -------------------------------------------------------------------------
    // decode_tile_bgra
    // -------------------------------------------------------------------------

    #[test]
    fn test_decode_empty_tile_is_transparent() {
        let mut out = vec![0xAAu8; 16 * 16 * 4];
        decode_tile_bgra(None, &EOI, 16, 16, 16, 16, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let mut out = vec![0u8; 16 * 16 * 4];
        let result = decode_tile_bgra(None, b"not a jpeg at all", 16, 16, 16, 16, &mut out);
        assert!(matches!(result, Err(JpegError::Decode(_))));
    }

    #[test]
    fn test_decode_real_jpeg_with_edge_padding() {
        // Decode a 16x16 tile as an edge tile whose valid extent is 10x12:
        // pixels beyond the extent stay transparent.
        let encoded = encode_solid(16, [200, 100, 50]);

        let mut out = vec![0u8; 16 * 16 * 4];
        decode_tile_bgra(None, &encoded, 16, 16, 10, 12, &mut out).unwrap();

        // Inside the valid extent: opaque, red channel dominant
        let inside = &out[0..4];
        assert_eq!(inside[3], 255);
        assert!(inside[2] > 150, "red channel should dominate, got {}", inside[2]);

        // Just right of the valid extent on the first row
        let right = &out[12 * 4..12 * 4 + 4];
        assert_eq!(right, &[0, 0, 0, 0]);

        // First row below the valid extent
        let below = &out[13 * 16 * 4..13 * 16 * 4 + 4];
        assert_eq!(below, &[0, 0, 0, 0]);
    }
}
