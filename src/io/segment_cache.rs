//! Aligned-segment caching over a byte source.
//!
//! Opening a slide is dominated by small scattered reads: a TIFF open walks
//! the IFD chain entry by entry, an iSyntax open scans the XML header and
//! the seek table. Against a remote range endpoint every one of those reads
//! would be a round trip. This layer reads the source in fixed, aligned
//! segments and keeps the most recently used ones resident, so a header
//! walk touches the wire once per segment instead of once per tag.
//!
//! Bulk data deliberately bypasses the segments: a read at least one
//! segment long (tile payloads, iSyntax chunks, the seek table) goes
//! straight to the source, and `read_batch` passes through untouched —
//! those are one-shot reads that would only churn the resident set.
//!
//! Each segment slot is a [`tokio::sync::OnceCell`]: the first reader runs
//! the fetch, concurrent readers of the same segment wait on the cell, and
//! a failed fetch leaves the cell empty so the next reader retries.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use super::ByteSource;
use crate::error::IoError;

/// Default segment size. Sized so that a whole classic IFD (a few hundred
/// 20-byte entries plus its offset arrays) usually lands in one segment.
pub const DEFAULT_SEGMENT_SIZE: usize = 128 * 1024;

/// Default number of resident segment slots (24MB at the default size).
const DEFAULT_SEGMENT_SLOTS: usize = 192;

/// Segment-granular read cache wrapping any [`ByteSource`].
pub struct SegmentCache<S> {
    source: S,
    segment_size: usize,
    /// Most-recently-used segment slots, keyed by segment index. A slot is
    /// shared with any reader currently waiting on its fetch, so evicting
    /// it never invalidates an in-flight read.
    slots: Mutex<LruCache<u64, Arc<OnceCell<Bytes>>>>,
}

impl<S: ByteSource> SegmentCache<S> {
    /// Wrap a source with the default segment geometry.
    pub fn new(source: S) -> Self {
        Self::with_geometry(source, DEFAULT_SEGMENT_SIZE, DEFAULT_SEGMENT_SLOTS)
    }

    /// Wrap a source with explicit segment size and resident slot count.
    pub fn with_geometry(source: S, segment_size: usize, slot_count: usize) -> Self {
        debug_assert!(segment_size > 0);
        Self {
            source,
            segment_size,
            slots: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(slot_count.max(1)).unwrap(),
            )),
        }
    }

    /// Access the wrapped source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Number of segments currently resident (fetches that completed).
    pub fn resident_segments(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .count()
    }

    /// Get one segment, fetching it at most once across concurrent callers.
    async fn segment(&self, index: u64) -> Result<Bytes, IoError> {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .get_or_insert(index, || Arc::new(OnceCell::new()))
                .clone()
        };

        slot.get_or_try_init(|| self.fetch_segment(index))
            .await
            .cloned()
    }

    /// Read one aligned segment from the source; the final segment of the
    /// file may be shorter than the segment size.
    async fn fetch_segment(&self, index: u64) -> Result<Bytes, IoError> {
        let offset = index * self.segment_size as u64;
        let size = self.source.size();
        if offset >= size {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: self.segment_size as u64,
                size,
            });
        }
        let len = (size - offset).min(self.segment_size as u64) as usize;
        self.source.read_exact_at(offset, len).await
    }
}

#[async_trait]
impl<S: ByteSource + 'static> ByteSource for SegmentCache<S> {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        let size = self.source.size();
        if offset + len as u64 > size {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size,
            });
        }
        if len == 0 {
            return Ok(Bytes::new());
        }

        // Bulk reads (tile payloads, chunks, seek tables) skip the cache:
        // they are read once and would evict the header segments that are
        // actually revisited.
        if len >= self.segment_size {
            return self.source.read_exact_at(offset, len).await;
        }

        let segment_size = self.segment_size as u64;
        let first = offset / segment_size;
        let last = (offset + len as u64 - 1) / segment_size;

        if first == last {
            // Whole request inside one segment: hand out a zero-copy slice
            let segment = self.segment(first).await?;
            let lo = (offset - first * segment_size) as usize;
            return Ok(segment.slice(lo..lo + len));
        }

        // The request straddles segments: intersect each with the request
        // in absolute byte coordinates and stitch the pieces together.
        let mut assembled = BytesMut::with_capacity(len);
        let request_end = offset + len as u64;
        for index in first..=last {
            let segment = self.segment(index).await?;
            let segment_start = index * segment_size;
            let lo = offset.max(segment_start) - segment_start;
            let hi = request_end.min(segment_start + segment.len() as u64) - segment_start;
            assembled.extend_from_slice(&segment[lo as usize..hi as usize]);
        }
        Ok(assembled.freeze())
    }

    async fn read_batch(&self, requests: &[(u64, usize)]) -> Result<Bytes, IoError> {
        // Coalesced wishlist reads are the source's job (one request on the
        // wire); caching them would duplicate megabytes of one-shot data.
        self.source.read_batch(requests).await
    }

    fn size(&self) -> u64 {
        self.source.size()
    }

    fn identifier(&self) -> &str {
        self.source.identifier()
    }

    fn is_remote(&self) -> bool {
        self.source.is_remote()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory source that counts how often it is actually read.
    struct ProbeSource {
        data: Bytes,
        fetches: AtomicUsize,
        fetch_delay: Duration,
    }

    impl ProbeSource {
        fn new(len: usize) -> Self {
            // Deterministic non-repeating pattern
            let data: Vec<u8> = (0..len).map(|i| ((i * 7 + 3) % 251) as u8).collect();
            Self {
                data: Bytes::from(data),
                fetches: AtomicUsize::new(0),
                fetch_delay: Duration::ZERO,
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ByteSource for ProbeSource {
        async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
            let start = offset as usize;
            if start + len > self.data.len() {
                return Err(IoError::RangeOutOfBounds {
                    offset,
                    requested: len as u64,
                    size: self.data.len() as u64,
                });
            }
            Ok(self.data.slice(start..start + len))
        }

        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn identifier(&self) -> &str {
            "probe://segment-cache"
        }
    }

    #[tokio::test]
    async fn test_header_walk_fetches_each_segment_once() {
        // Simulate an IFD walk: many tag-sized reads inside one segment
        let cache = SegmentCache::with_geometry(ProbeSource::new(400), 64, 8);

        for tag in 0..10u64 {
            let entry = cache.read_exact_at(8 + tag * 5, 5).await.unwrap();
            assert_eq!(entry.len(), 5);
        }

        // All reads landed in segment 0: one wire fetch total
        assert_eq!(cache.source().fetches(), 1);
        assert_eq!(cache.resident_segments(), 1);
    }

    #[tokio::test]
    async fn test_straddling_read_assembles_correctly() {
        let cache = SegmentCache::with_geometry(ProbeSource::new(400), 64, 8);

        // 40 bytes starting near a segment boundary: touches segments 0, 1
        let out = cache.read_exact_at(50, 40).await.unwrap();
        assert_eq!(&out[..], &cache.source().data[50..90]);
        assert_eq!(cache.source().fetches(), 2);

        // Re-reading any sub-range of those segments is now free
        let again = cache.read_exact_at(70, 8).await.unwrap();
        assert_eq!(&again[..], &cache.source().data[70..78]);
        assert_eq!(cache.source().fetches(), 2);
    }

    #[tokio::test]
    async fn test_tail_segment_is_short() {
        // 100 bytes with 64-byte segments: segment 1 holds only 36 bytes
        let cache = SegmentCache::with_geometry(ProbeSource::new(100), 64, 8);

        let out = cache.read_exact_at(90, 10).await.unwrap();
        assert_eq!(&out[..], &cache.source().data[90..100]);
    }

    #[tokio::test]
    async fn test_bulk_read_bypasses_segments() {
        let cache = SegmentCache::with_geometry(ProbeSource::new(4096), 64, 8);

        // A payload-sized read goes straight through and caches nothing
        let out = cache.read_exact_at(128, 1000).await.unwrap();
        assert_eq!(out.len(), 1000);
        assert_eq!(cache.source().fetches(), 1);
        assert_eq!(cache.resident_segments(), 0);
    }

    #[tokio::test]
    async fn test_batch_passes_through() {
        let cache = SegmentCache::with_geometry(ProbeSource::new(4096), 64, 8);

        let out = cache.read_batch(&[(0, 3), (512, 3)]).await.unwrap();
        assert_eq!(&out[..3], &cache.source().data[0..3]);
        assert_eq!(&out[3..], &cache.source().data[512..515]);
        assert_eq!(cache.resident_segments(), 0);
    }

    #[tokio::test]
    async fn test_slot_eviction_refetches() {
        // Room for two segments only
        let cache = SegmentCache::with_geometry(ProbeSource::new(400), 64, 2);

        cache.read_exact_at(0, 4).await.unwrap(); // segment 0
        cache.read_exact_at(64, 4).await.unwrap(); // segment 1
        cache.read_exact_at(128, 4).await.unwrap(); // segment 2 evicts 0
        assert_eq!(cache.source().fetches(), 3);

        cache.read_exact_at(70, 4).await.unwrap(); // segment 1 still resident
        assert_eq!(cache.source().fetches(), 3);

        cache.read_exact_at(0, 4).await.unwrap(); // segment 0 must refetch
        assert_eq!(cache.source().fetches(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_readers_share_one_fetch() {
        let mut source = ProbeSource::new(512);
        source.fetch_delay = Duration::from_millis(30);
        let cache = Arc::new(SegmentCache::with_geometry(source, 64, 8));

        // Sixteen tasks race for the same segment; the cell admits one fetch
        let mut tasks = Vec::new();
        for reader in 0..16u64 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.read_exact_at(16 + reader % 4, 8).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.source().fetches(), 1);
    }

    #[tokio::test]
    async fn test_out_of_bounds_rejected_before_caching() {
        let cache = SegmentCache::with_geometry(ProbeSource::new(100), 64, 8);

        let bad = cache.read_exact_at(90, 50).await;
        assert!(matches!(bad, Err(IoError::RangeOutOfBounds { .. })));
        assert_eq!(cache.source().fetches(), 0);

        // An in-bounds read of the same area still works afterwards
        let good = cache.read_exact_at(90, 10).await.unwrap();
        assert_eq!(&good[..], &cache.source().data[90..100]);
    }

    #[tokio::test]
    async fn test_zero_length_read_touches_nothing() {
        let cache = SegmentCache::with_geometry(ProbeSource::new(100), 64, 8);
        let out = cache.read_exact_at(10, 0).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(cache.source().fetches(), 0);
    }
}
