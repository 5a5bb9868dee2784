//! iSyntax container support.
//!
//! An iSyntax file is a UTF-8 XML header (terminated by a lone `0x04` byte)
//! followed by a binary payload of wavelet coefficient code-blocks. Tiles
//! are reconstructed, not decoded: code-blocks hold Hulsken-compressed
//! wavelet coefficients that pass through an inverse 5/3 transform, with
//! low-frequency planes cascading down the pyramid from the top scale.
//!
//! Module map:
//! - [`xml`]: incremental XML header scanner
//! - [`container`]: block headers, seek table, chunk grouping
//! - [`hulsken`]: per-code-block entropy decoding
//! - [`idwt`]: stitching, the 5/3 inverse transform, YCoCg recombination
//! - [`image`]: the per-slide engine (first load, tile reconstruction)

pub mod container;
pub mod hulsken;
pub mod idwt;
pub mod image;
pub mod xml;

pub use container::{
    chunk_codeblocks_per_color, Codeblock, DataChunk, IsyntaxContainer, LevelGrid, TileRef,
};
pub use hulsken::{
    absolute_value_block, decompress as hulsken_decompress,
    signed_magnitude_to_twos_complement, HUFFMAN_FAST_BITS,
};
pub use idwt::{
    idwt_2d, recombine_ycocg_to_bgra, transform_channel, ycocg_to_bgr, NeighborCoeffs,
    Neighborhood, IDWT_FIRST_VALID_PIXEL, IDWT_PAD_L, IDWT_PAD_R, PARALLEL_COLS_53,
};
pub use image::IsyntaxImage;
pub use xml::{parse_header, BlockHeaderTemplate, IsyntaxImageType, XmlHeader, XmlImage};
