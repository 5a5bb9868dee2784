//! Tile streamer: viewport in, prioritised decode work out.
//!
//! Every viewer frame the streamer receives a read-only [`SceneSnapshot`]
//! and computes the *visible-tile set*: for each scale from coarse to fine,
//! the camera bounds in microns convert to tile index ranges through the
//! level's physical tile extent, clipped to the level and to any crop
//! rectangle. Tiles that are not empty, not cached and not already
//! submitted join a wishlist, prioritised by
//! `base(level) + (1 - centre_distance) * 300` where the base is highest
//! for the most zoomed-in visible level, with a bonus toward whatever the
//! user is looking at.
//!
//! The wishlist is truncated (10 tiles local, 3 remote per frame) and
//! submitted to the worker pool. Remote TIFF tasks are coalesced into
//! range batches and flushed every 5th frame to rate-limit the server.
//! Completions drain under a time budget so the render thread never
//! starves.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use crate::slide::Image;

use super::cache::{CacheLookup, TileCache, TileCacheKey};
use super::queue::{
    default_worker_count, PriorityTaskQueue, TaskKind, TileCompletion, TileTask, WorkerPool,
};
use super::viewport::SceneSnapshot;

/// Max tiles submitted per frame for local sources.
pub const MAX_TILES_TO_LOAD: usize = 10;

/// Max tiles submitted per frame for remote sources.
pub const MAX_TILES_TO_LOAD_REMOTE: usize = 3;

/// Max tiles coalesced into one remote range batch.
pub const TILE_LOAD_BATCH_MAX: usize = 8;

/// Remote batches are flushed once every this many frames.
pub const REMOTE_SUBMIT_FRAME_INTERVAL: u64 = 5;

/// Per-frame completion drain budget.
pub const COMPLETION_DRAIN_BUDGET: Duration = Duration::from_millis(7);

/// Centre-distance priority bonus scale.
const PRIORITY_CENTER_BONUS: f32 = 300.0;

/// Per-level base priority step.
const PRIORITY_LEVEL_STEP: i32 = 100;

/// One wishlist candidate before submission.
struct WishlistEntry {
    level: u32,
    tile_x: u32,
    tile_y: u32,
    priority: i32,
}

/// The streamer: owns the queue, the worker pool and the completion
/// channel; borrows the shared tile cache.
pub struct TileStreamer {
    queue: PriorityTaskQueue,
    pool: WorkerPool,
    cache: Arc<TileCache>,
    completions_rx: mpsc::UnboundedReceiver<TileCompletion>,
    frame_counter: u64,
    /// Remote tiles waiting for the next batch flush, with their claims held
    pending_remote: Vec<(Arc<Image>, u32, u32, u32, i32)>,
    /// Images whose iSyntax first-load has been submitted
    first_load_submitted: HashSet<u64>,
}

impl TileStreamer {
    /// Create a streamer with its own worker pool over a shared cache.
    pub fn new(cache: Arc<TileCache>) -> Self {
        Self::with_worker_count(cache, default_worker_count())
    }

    /// Create a streamer with an explicit worker count.
    pub fn with_worker_count(cache: Arc<TileCache>, worker_count: usize) -> Self {
        let queue = PriorityTaskQueue::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(worker_count, queue.clone(), cache.clone(), tx);

        Self {
            queue,
            pool,
            cache,
            completions_rx: rx,
            frame_counter: 0,
            pending_remote: Vec::new(),
            first_load_submitted: HashSet::new(),
        }
    }

    /// The shared tile cache.
    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    /// Queued (not yet executing) task count.
    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }

    // -------------------------------------------------------------------------
    // Per-frame viewport update
    // -------------------------------------------------------------------------

    /// Feed one frame's viewport: computes and submits the wishlist.
    pub fn set_viewport(&mut self, scene: &SceneSnapshot, image: &Arc<Image>) {
        self.frame_counter += 1;

        if image.is_deleted() {
            return;
        }

        // iSyntax images need the pyramid-top bootstrap before any tile can
        // be reconstructed; submit it once and wait for its completion.
        if !image.first_load_complete() {
            if self.first_load_submitted.insert(image.id()) {
                let _ = self.queue.push(TileTask {
                    image: image.clone(),
                    kind: TaskKind::FirstLoad,
                    priority: i32::MAX,
                    need_gpu: false,
                    need_cache: false,
                });
                debug!(image = image.identifier(), "submitted iSyntax first load");
            }
            return;
        }

        let wishlist = self.build_wishlist(scene, image);
        if wishlist.is_empty() && self.pending_remote.is_empty() {
            return;
        }

        self.submit(wishlist, image);
    }

    /// Compute the prioritised visible-tile wishlist for this frame.
    fn build_wishlist(&self, scene: &SceneSnapshot, image: &Arc<Image>) -> Vec<WishlistEntry> {
        let level_count = image.level_count();
        if level_count == 0 {
            return Vec::new();
        }

        let highest_visible = level_count - 1;
        let mut lowest_visible = scene.zoom.level.clamp(0, highest_visible as i32) as u32;
        // Fall through missing levels to the nearest decodable one
        while lowest_visible > 0 {
            if image
                .level(lowest_visible)
                .map(|l| l.exists)
                .unwrap_or(false)
            {
                break;
            }
            lowest_visible -= 1;
        }

        let bounds = scene.visible_bounds();
        if bounds.width() <= 0.0 || bounds.height() <= 0.0 {
            return Vec::new();
        }
        let (center_x, center_y) = bounds.center();
        let half_diagonal =
            (bounds.width() * bounds.width() + bounds.height() * bounds.height()).sqrt() * 0.5;

        let mut wishlist = Vec::new();

        for level in (lowest_visible..=highest_visible).rev() {
            let Some(level_image) = image.level(level) else {
                continue;
            };
            if !level_image.exists {
                continue;
            }

            let (tile_um_x, tile_um_y) = image.tile_side_in_um(level);
            if tile_um_x <= 0.0 || tile_um_y <= 0.0 {
                continue;
            }

            let tx0 = ((bounds.left as f64 / tile_um_x).floor().max(0.0)) as u32;
            let ty0 = ((bounds.top as f64 / tile_um_y).floor().max(0.0)) as u32;
            let tx1 = ((bounds.right as f64 / tile_um_x).floor().max(0.0) as u32)
                .min(level_image.width_in_tiles.saturating_sub(1));
            let ty1 = ((bounds.bottom as f64 / tile_um_y).floor().max(0.0) as u32)
                .min(level_image.height_in_tiles.saturating_sub(1));
            if tx0 > tx1 || ty0 > ty1 {
                continue;
            }

            let base_priority = (level_count - level) as i32 * PRIORITY_LEVEL_STEP;

            for tile_y in ty0..=ty1 {
                for tile_x in tx0..=tx1 {
                    let Some(tile) = level_image.tile(tile_x, tile_y) else {
                        continue;
                    };
                    if tile.is_empty.load(std::sync::atomic::Ordering::Acquire) {
                        continue;
                    }
                    if tile
                        .is_submitted_for_loading
                        .load(std::sync::atomic::Ordering::Acquire)
                    {
                        continue;
                    }
                    let key = TileCacheKey::new(image.id(), level, tile_x, tile_y);
                    if !matches!(self.cache.lookup(&key), CacheLookup::Missing) {
                        continue;
                    }

                    // Bonus for closeness to the viewport centre
                    let tile_center_x = (tile_x as f64 + 0.5) * tile_um_x;
                    let tile_center_y = (tile_y as f64 + 0.5) * tile_um_y;
                    let dx = tile_center_x as f32 - center_x;
                    let dy = tile_center_y as f32 - center_y;
                    let distance = (dx * dx + dy * dy).sqrt();
                    let normalized = if half_diagonal > 0.0 {
                        (distance / half_diagonal).min(1.0)
                    } else {
                        0.0
                    };
                    let bonus = ((1.0 - normalized) * PRIORITY_CENTER_BONUS) as i32;

                    wishlist.push(WishlistEntry {
                        level,
                        tile_x,
                        tile_y,
                        priority: base_priority + bonus,
                    });
                }
            }
        }

        wishlist.sort_by(|a, b| b.priority.cmp(&a.priority));
        wishlist
    }

    /// Claim and enqueue the top of the wishlist.
    fn submit(&mut self, mut wishlist: Vec<WishlistEntry>, image: &Arc<Image>) {
        let limit = if image.is_remote() {
            MAX_TILES_TO_LOAD_REMOTE
        } else {
            MAX_TILES_TO_LOAD
        };
        wishlist.truncate(limit);

        for entry in wishlist {
            let Some(tile) = image
                .level(entry.level)
                .and_then(|l| l.tile(entry.tile_x, entry.tile_y))
            else {
                continue;
            };

            // The submitted flag is the dedup key; losing the claim means
            // another frame already queued this tile.
            if !tile.try_submit() {
                continue;
            }
            let key = TileCacheKey::new(image.id(), entry.level, entry.tile_x, entry.tile_y);
            self.cache.mark_inflight(key);

            if image.is_remote() {
                self.pending_remote.push((
                    image.clone(),
                    entry.level,
                    entry.tile_x,
                    entry.tile_y,
                    entry.priority,
                ));
            } else {
                let _ = self.queue.push(TileTask {
                    image: image.clone(),
                    kind: TaskKind::Tile {
                        level: entry.level,
                        tile_x: entry.tile_x,
                        tile_y: entry.tile_y,
                    },
                    priority: entry.priority,
                    need_gpu: true,
                    need_cache: true,
                });
            }
        }

        // Remote batches flush on a frame cadence to rate-limit the server
        if !self.pending_remote.is_empty()
            && self.frame_counter % REMOTE_SUBMIT_FRAME_INTERVAL == 0
        {
            self.flush_remote_batch();
        }
    }

    /// Coalesce pending remote tiles into batched tasks, one per image.
    fn flush_remote_batch(&mut self) {
        while !self.pending_remote.is_empty() {
            // Batches never mix images: take the leading run that shares
            // the first entry's image, up to the batch cap.
            let image = self.pending_remote[0].0.clone();
            let mut take = 0;
            while take < self.pending_remote.len()
                && take < TILE_LOAD_BATCH_MAX
                && self.pending_remote[take].0.id() == image.id()
            {
                take += 1;
            }
            let drained: Vec<_> = self.pending_remote.drain(..take).collect();

            let priority = drained.iter().map(|e| e.4).max().unwrap_or(0);
            let coords: Vec<(u32, u32, u32)> =
                drained.iter().map(|e| (e.1, e.2, e.3)).collect();

            debug!(
                image = image.identifier(),
                tiles = coords.len(),
                "flushing remote tile batch"
            );

            let _ = self.queue.push(TileTask {
                image,
                kind: TaskKind::TileBatch(coords),
                priority,
                need_gpu: true,
                need_cache: true,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Completions
    // -------------------------------------------------------------------------

    /// Drain completed tiles under a time budget.
    ///
    /// Stops early when the budget elapses so a flood of completions cannot
    /// starve the caller's render loop; the rest drain next frame.
    pub fn drain_completions(&mut self, budget: Duration) -> Vec<TileCompletion> {
        let deadline = Instant::now() + budget;
        let mut out = Vec::new();

        while Instant::now() < deadline {
            match self.completions_rx.try_recv() {
                Ok(completion) => out.push(completion),
                Err(_) => break,
            }
        }

        out
    }

    /// Record that a cached tile was drawn this frame (drives eviction).
    pub fn mark_drawn(&self, image: &Image, level: u32, tile_x: u32, tile_y: u32, time: u64) {
        let key = TileCacheKey::new(image.id(), level, tile_x, tile_y);
        self.cache.mark_drawn(&key, time);
        if let Some(tile) = image.level(level).and_then(|l| l.tile(tile_x, tile_y)) {
            tile.time_last_drawn
                .store(time, std::sync::atomic::Ordering::Release);
        }
    }

    /// Drop an image's tiles and pending work (image closed).
    pub fn forget_image(&mut self, image: &Image) {
        self.pending_remote.retain(|(i, ..)| i.id() != image.id());
        self.first_load_submitted.remove(&image.id());
        self.cache.remove_image(image.id());
    }

    /// Shut the worker pool down.
    pub async fn shutdown(self) {
        self.pool.join().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
