mod byte_source;
mod file_source;
mod remote_source;
mod segment_cache;

pub use byte_source::{
    read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le, ByteSource,
};
pub use file_source::FileSource;
pub use remote_source::{RemoteCase, RemoteCaseList, RemoteSource, REMOTE_TIMEOUT_SECS};
pub use segment_cache::{SegmentCache, DEFAULT_SEGMENT_SIZE};
