use thiserror::Error;

/// I/O errors raised by byte sources (local files or the remote range endpoint)
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// The source ended before the requested range was satisfied
    #[error("short read: requested {requested} bytes at offset {offset}, got {actual}")]
    Short {
        offset: u64,
        requested: u64,
        actual: u64,
    },

    /// Transport-level failure (file system or network)
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Remote request exceeded the read deadline
    #[error("I/O timeout after {seconds} s: {context}")]
    Timeout { seconds: u64, context: String },

    /// Requested range exceeds resource bounds
    #[error("range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },
}

/// Errors that can occur when parsing TIFF files
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    BadMagic(u16),

    /// Invalid TIFF version number
    #[error("invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    BadVersion(u16),

    /// Invalid BigTIFF offset byte size (must be 8)
    #[error("invalid BigTIFF offset byte size: expected 8, got {0}")]
    BadOffsetSize(u16),

    /// The file ended inside a header or IFD
    #[error("truncated IFD: need {required} bytes at offset {offset}")]
    TruncatedIfd { offset: u64, required: u64 },

    /// Invalid IFD offset (points outside the file)
    #[error("invalid IFD offset: {0}")]
    BadIfdOffset(u64),

    /// Required tag is missing from an IFD
    #[error("missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("invalid tag value for {tag}: {message}")]
    BadTagValue { tag: &'static str, message: String },

    /// Only JPEG-compressed tiled pyramids are supported
    #[error("unsupported compression: {0} (only JPEG is supported)")]
    UnsupportedCompression(String),

    /// Only RGB and YCbCr photometric interpretations are supported
    #[error("unsupported photometric interpretation: {0}")]
    UnsupportedPhotometric(u16),

    /// File uses strips instead of tiles
    #[error("unsupported organization: file uses strips instead of tiles")]
    StripOrganization,

    /// TileOffsets and TileByteCounts disagree on the tile count
    #[error("inconsistent tile tables: {offsets} offsets vs {byte_counts} byte counts")]
    InconsistentTileTables { offsets: usize, byte_counts: usize },

    /// Unknown field type in IFD entry
    #[error("unknown field type: {0}")]
    UnknownFieldType(u16),

    /// Serialised metadata stream is malformed
    #[error("malformed metadata stream: {0}")]
    BadMetadataStream(String),
}

/// Errors raised while decoding a JPEG tile payload
#[derive(Debug, Clone, Error)]
pub enum JpegError {
    /// The decoder rejected the stream
    #[error("JPEG decode failed: {0}")]
    Decode(String),

    /// Decoded dimensions do not match the tile geometry
    #[error("decoded size {got_w}x{got_h} does not fit tile {tile_w}x{tile_h}")]
    DimensionMismatch {
        got_w: u32,
        got_h: u32,
        tile_w: u32,
        tile_h: u32,
    },
}

/// Errors raised while parsing the iSyntax container at open time
#[derive(Debug, Clone, Error)]
pub enum IsyntaxError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// XML element nesting exceeded the parser stack
    #[error("XML nesting too deep at byte {0}")]
    XmlTooDeep(u64),

    /// An attribute value overflowed its buffer
    #[error("attribute value overflow in {element}")]
    AttrOverflow { element: String },

    /// The XML header is structurally malformed
    #[error("malformed iSyntax XML header: {0}")]
    MalformedXml(String),

    /// Base64 payload in the header failed to decode
    #[error("bad base64 payload: {0}")]
    BadBase64(String),

    /// Block header table ended mid-record
    #[error("truncated block header table: {got} bytes, record size {record}")]
    TruncatedHeaderTable { got: usize, record: usize },

    /// The seek table tag is missing or its entries are malformed
    #[error("malformed seektable: {0}")]
    MalformedSeektable(String),
}

/// Per-codeblock decode failures; the affected tile renders as background
#[derive(Debug, Clone, Error)]
pub enum CodeblockError {
    /// The serialised Huffman tree is invalid
    #[error("invalid Huffman tree: {0}")]
    BadHuffmanTree(String),

    /// Decompressed byte count does not match the header
    #[error("serialized length mismatch: expected {expected}, got {got}")]
    SerializedLengthMismatch { expected: usize, got: usize },

    /// Bitplane count disagrees with the presence bitmasks
    #[error("bitplane count mismatch: masks promise {expected}, stream holds {got}")]
    BitplaneCountMismatch { expected: usize, got: usize },

    /// A neighbouring tile's coefficients are not resident yet; retry later
    #[error("neighbor coefficients missing for tile ({tile_x}, {tile_y}) at scale {scale}")]
    NeighborMissing { scale: u32, tile_x: u32, tile_y: u32 },
}

/// Errors surfaced by `open_image` and `read_region`
#[derive(Debug, Error)]
pub enum ImageError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// TIFF parsing error
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    /// iSyntax header error
    #[error("iSyntax error: {0}")]
    Isyntax(#[from] IsyntaxError),

    /// JPEG tile error
    #[error("JPEG error: {0}")]
    Jpeg(#[from] JpegError),

    /// Codeblock decode error
    #[error("codeblock error: {0}")]
    Codeblock(#[from] CodeblockError),

    /// The file is not a recognised slide format
    #[error("unsupported format: {reason}")]
    UnsupportedFormat { reason: String },

    /// Requested level does not exist and no fallback is available
    #[error("level {0} does not exist and no lower-resolution level can substitute")]
    LevelUnavailable(u32),

    /// Region coordinates fall outside the level extent
    #[error("region ({x}, {y}) {w}x{h} out of bounds for level {level}")]
    RegionOutOfBounds {
        level: u32,
        x: i64,
        y: i64,
        w: u32,
        h: u32,
    },

    /// The external region reader reported a failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the tile streaming layer
#[derive(Debug, Error)]
pub enum TileError {
    /// The decode task failed; the tile renders as background
    #[error("tile decode failed: {0}")]
    Decode(#[from] ImageError),

    /// The image was closed while the task was queued
    #[error("image closed")]
    ImageClosed,

    /// The work queue was shut down
    #[error("work queue closed")]
    QueueClosed,
}
