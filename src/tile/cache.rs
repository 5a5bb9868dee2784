//! Cache for decoded BGRA tiles.
//!
//! Keyed by `(image_id, level, tile_x, tile_y)` and bounded by total bytes.
//! Eviction frees the tiles drawn longest ago first, skipping entries whose
//! keep flag is set and keys with a decode in flight. Victim selection runs
//! under the lock; buffer frees happen outside it.
//!
//! In-flight markers give the cache single-flight semantics: any number of
//! concurrent `get_or_decode` calls for one key run the decoder exactly
//! once and share the resulting buffer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ImageError;

/// Default cache capacity: 512MB of decoded pixels.
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 512 * 1024 * 1024;

// =============================================================================
// Key and lookup result
// =============================================================================

/// Identity of one decoded tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCacheKey {
    pub image_id: u64,
    pub level: u32,
    pub tile_x: u32,
    pub tile_y: u32,
}

impl TileCacheKey {
    pub fn new(image_id: u64, level: u32, tile_x: u32, tile_y: u32) -> Self {
        Self {
            image_id,
            level,
            tile_x,
            tile_y,
        }
    }
}

/// Result of a cache probe.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Decoded pixels are resident
    Ready(Bytes),
    /// A decode for this key is running; wait instead of re-decoding
    InFlight,
    /// Nothing resident or in flight
    Missing,
}

// =============================================================================
// Cache internals
// =============================================================================

struct CacheEntry {
    pixels: Bytes,
    time_last_drawn: u64,
    keep: bool,
}

struct CacheState {
    entries: HashMap<TileCacheKey, CacheEntry>,
    in_flight: HashMap<TileCacheKey, Arc<Notify>>,
    total_bytes: usize,
    /// Highest draw timestamp seen; fresh inserts rank as current so they
    /// are not the first eviction victims before their first draw
    last_draw_time: u64,
}

/// Byte-bounded decoded-tile cache with single-flight decode.
pub struct TileCache {
    state: Mutex<CacheState>,
    capacity: usize,
}

impl TileCache {
    /// Create a cache with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY)
    }

    /// Create a cache bounded to `capacity` bytes of pixel data.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                total_bytes: 0,
                last_draw_time: 0,
            }),
            capacity,
        }
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current resident bytes.
    pub fn size(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Number of resident tiles.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds no tiles.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Probe the cache without changing eviction order.
    pub fn lookup(&self, key: &TileCacheKey) -> CacheLookup {
        let state = self.state.lock();
        if let Some(entry) = state.entries.get(key) {
            return CacheLookup::Ready(entry.pixels.clone());
        }
        if state.in_flight.contains_key(key) {
            return CacheLookup::InFlight;
        }
        CacheLookup::Missing
    }

    /// Insert decoded pixels, evicting down to capacity afterwards.
    pub fn insert(&self, key: TileCacheKey, pixels: Bytes, keep: bool) {
        let mut freed = Vec::new();
        {
            let mut state = self.state.lock();
            let size = pixels.len();
            let time_last_drawn = state.last_draw_time;
            if let Some(old) = state.entries.insert(
                key,
                CacheEntry {
                    pixels,
                    time_last_drawn,
                    keep,
                },
            ) {
                state.total_bytes -= old.pixels.len();
                freed.push(old.pixels);
            }
            state.total_bytes += size;
            Self::collect_victims(&mut state, self.capacity, &mut freed);
        }
        drop(freed); // buffers released outside the lock
    }

    /// Record a draw timestamp; newer tiles survive eviction longer.
    pub fn mark_drawn(&self, key: &TileCacheKey, time: u64) {
        let mut state = self.state.lock();
        state.last_draw_time = state.last_draw_time.max(time);
        if let Some(entry) = state.entries.get_mut(key) {
            entry.time_last_drawn = time;
        }
    }

    /// Set or clear the keep flag of a resident tile.
    pub fn mark_keep(&self, key: &TileCacheKey, keep: bool) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.keep = keep;
        }
    }

    /// Claim the in-flight marker. Returns false when another decode
    /// already holds it (the caller should wait, not decode).
    pub fn mark_inflight(&self, key: TileCacheKey) -> bool {
        let mut state = self.state.lock();
        if state.in_flight.contains_key(&key) {
            return false;
        }
        state.in_flight.insert(key, Arc::new(Notify::new()));
        true
    }

    /// Release the in-flight marker and wake waiters.
    pub fn clear_inflight(&self, key: &TileCacheKey) {
        let notify = self.state.lock().in_flight.remove(key);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    /// Drop a specific tile (e.g. when its image closes).
    pub fn remove(&self, key: &TileCacheKey) -> Option<Bytes> {
        let mut state = self.state.lock();
        state.entries.remove(key).map(|entry| {
            state.total_bytes -= entry.pixels.len();
            entry.pixels
        })
    }

    /// Drop every tile belonging to an image.
    pub fn remove_image(&self, image_id: u64) {
        let mut freed = Vec::new();
        {
            let mut state = self.state.lock();
            let keys: Vec<TileCacheKey> = state
                .entries
                .keys()
                .filter(|k| k.image_id == image_id)
                .copied()
                .collect();
            for key in keys {
                if let Some(entry) = state.entries.remove(&key) {
                    state.total_bytes -= entry.pixels.len();
                    freed.push(entry.pixels);
                }
            }
        }
        drop(freed);
    }

    /// Evict oldest-drawn tiles until at most `max_bytes` remain resident.
    pub fn evict_until(&self, max_bytes: usize) {
        let mut freed = Vec::new();
        {
            let mut state = self.state.lock();
            Self::collect_victims(&mut state, max_bytes, &mut freed);
        }
        drop(freed);
    }

    fn collect_victims(state: &mut CacheState, max_bytes: usize, freed: &mut Vec<Bytes>) {
        while state.total_bytes > max_bytes {
            // Oldest draw time among evictable entries
            let victim = state
                .entries
                .iter()
                .filter(|(k, e)| !e.keep && !state.in_flight.contains_key(k))
                .min_by_key(|(_, e)| e.time_last_drawn)
                .map(|(k, _)| *k);

            let Some(key) = victim else { break };
            if let Some(entry) = state.entries.remove(&key) {
                state.total_bytes -= entry.pixels.len();
                freed.push(entry.pixels);
            }
        }
    }

    /// Fetch from cache or decode exactly once.
    ///
    /// Concurrent callers for one key share the leader's result: followers
    /// wait on the in-flight marker and re-probe. A failed decode clears
    /// the marker so the next caller retries.
    pub async fn get_or_decode<F, Fut>(
        self: &Arc<Self>,
        key: TileCacheKey,
        keep: bool,
        decode: F,
    ) -> Result<Bytes, ImageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, ImageError>>,
    {
        // Wait/claim phase: either the tile turns up, or we become the
        // single decoder for this key.
        loop {
            let waiter = {
                let state = self.state.lock();
                if let Some(entry) = state.entries.get(&key) {
                    return Ok(entry.pixels.clone());
                }
                state.in_flight.get(&key).cloned()
            };

            if let Some(notify) = waiter {
                notify.notified().await;
                continue;
            }

            if self.mark_inflight(key) {
                break;
            }
            // Lost the claim race; loop back and wait on the new marker
        }

        // A leader may have finished between the probe and the claim
        if let CacheLookup::Ready(pixels) = self.lookup(&key) {
            self.clear_inflight(&key);
            return Ok(pixels);
        }

        match decode().await {
            Ok(pixels) => {
                let bytes = Bytes::from(pixels);
                self.insert(key, bytes.clone(), keep);
                self.clear_inflight(&key);
                Ok(bytes)
            }
            Err(e) => {
                self.clear_inflight(&key);
                Err(e)
            }
        }
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
