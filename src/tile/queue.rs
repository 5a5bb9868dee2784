//! Priority work queue and decode worker pool.
//!
//! The streamer pushes [`TileTask`]s; workers pop them highest-priority
//! first (FIFO within a priority), decode through the image dispatcher,
//! feed the tile cache, and push a [`TileCompletion`] onto an unbounded
//! completion channel drained by the viewer side.
//!
//! Completion order is unrelated to submission order; priority is a hint.
//! Cancellation is cooperative: a task re-checks its image's deleted flag
//! on entry and bails out without decoding.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::slide::Image;

use super::cache::{TileCache, TileCacheKey};

/// Upper bound on decode workers regardless of core count.
pub const MAX_THREAD_COUNT: usize = 128;

/// Worker count for this machine: one per logical CPU, capped.
pub fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, MAX_THREAD_COUNT)
}

// =============================================================================
// Tasks and completions
// =============================================================================

/// What a queued task does.
#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Decode one tile
    Tile { level: u32, tile_x: u32, tile_y: u32 },
    /// Decode a batch of tiles with one coalesced range request
    /// (remote TIFF sources)
    TileBatch(Vec<(u32, u32, u32)>),
    /// Run the iSyntax top-chunk bootstrap
    FirstLoad,
}

/// The unit of work handed to the pool.
pub struct TileTask {
    pub image: Arc<Image>,
    pub kind: TaskKind,
    /// Larger runs earlier; a hint, not a guarantee
    pub priority: i32,
    /// Completion should request a GPU upload
    pub need_gpu: bool,
    /// Decoded pixels should stay in the tile cache
    pub need_cache: bool,
}

impl std::fmt::Debug for TileTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileTask")
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("need_gpu", &self.need_gpu)
            .field("need_cache", &self.need_cache)
            .finish()
    }
}

/// Outcome of one tile's decode.
#[derive(Debug)]
pub enum CompletionKind {
    /// Pixels are ready (also resident in the cache if requested)
    Loaded(Bytes),
    /// The backend reported an empty/background tile
    Empty,
    /// The first-load bootstrap finished
    FirstLoadDone,
    /// The image was closed before the task ran
    Cancelled,
    /// Decode failed; the tile renders as background
    Failed(String),
}

/// One entry on the completion queue.
#[derive(Debug)]
pub struct TileCompletion {
    pub image_id: u64,
    pub level: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    pub kind: CompletionKind,
    pub need_gpu: bool,
    pub need_cache: bool,
}

// =============================================================================
// Priority queue
// =============================================================================

struct PrioritizedTask {
    task: TileTask,
    /// Keeps FIFO order among equal priorities
    seq: u64,
}

impl PartialEq for PrioritizedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}

impl Eq for PrioritizedTask {}

impl PartialOrd for PrioritizedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match self.task.priority.cmp(&other.task.priority) {
            // BinaryHeap is a max-heap: reverse seq so earlier wins ties
            CmpOrdering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

struct QueueInner {
    heap: BinaryHeap<PrioritizedTask>,
    next_seq: u64,
    closed: bool,
}

/// Multi-producer priority queue with async pops.
#[derive(Clone)]
pub struct PriorityTaskQueue {
    inner: Arc<Mutex<QueueInner>>,
    notify: Arc<Notify>,
}

impl PriorityTaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Push a task. Returns the task back if the queue is closed.
    pub fn push(&self, task: TileTask) -> Result<(), TileTask> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(task);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(PrioritizedTask { task, seq });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the highest-priority task, waiting when empty.
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<TileTask> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(entry) = inner.heap.pop() {
                    return Some(entry.task);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue and wake every waiting worker.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Queued task count.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Whether no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PriorityTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Worker pool
// =============================================================================

/// Decode workers draining the priority queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    queue: PriorityTaskQueue,
}

impl WorkerPool {
    /// Spawn `worker_count` workers over a queue, cache and completion
    /// channel.
    pub fn spawn(
        worker_count: usize,
        queue: PriorityTaskQueue,
        cache: Arc<TileCache>,
        completions: mpsc::UnboundedSender<TileCompletion>,
    ) -> Self {
        let mut handles = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let queue = queue.clone();
            let cache = cache.clone();
            let completions = completions.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker_index, "decode worker started");
                while let Some(task) = queue.pop().await {
                    run_task(task, &cache, &completions).await;
                }
                debug!(worker_index, "decode worker stopped");
            }));
        }

        Self { handles, queue }
    }

    /// Close the queue; workers exit once it drains.
    pub fn shutdown(&self) {
        self.queue.close();
    }

    /// Close the queue and wait for every worker to finish.
    pub async fn join(mut self) {
        self.queue.close();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Execute one task: cancellation check, decode, cache insert, completion.
async fn run_task(
    task: TileTask,
    cache: &Arc<TileCache>,
    completions: &mpsc::UnboundedSender<TileCompletion>,
) {
    let image = task.image.clone();

    if image.is_deleted() {
        push_cancellations(&task, completions);
        return;
    }

    match &task.kind {
        TaskKind::Tile {
            level,
            tile_x,
            tile_y,
        } => {
            let completion =
                decode_one(&task, &image, cache, *level, *tile_x, *tile_y).await;
            let _ = completions.send(completion);
        }
        TaskKind::TileBatch(coords) => {
            let results = image.decode_tile_batch(coords).await;
            for ((level, tile_x, tile_y), result) in results {
                let kind = match result {
                    Ok(pixels) => {
                        let bytes = Bytes::from(pixels);
                        finish_tile(&task, &image, cache, level, tile_x, tile_y, &bytes);
                        CompletionKind::Loaded(bytes)
                    }
                    Err(e) => {
                        fail_tile(&image, cache, level, tile_x, tile_y);
                        warn!(
                            image = image.identifier(),
                            level, tile_x, tile_y, error = %e,
                            "batched tile decode failed"
                        );
                        CompletionKind::Failed(e.to_string())
                    }
                };
                let _ = completions.send(TileCompletion {
                    image_id: image.id(),
                    level,
                    tile_x,
                    tile_y,
                    kind,
                    need_gpu: task.need_gpu,
                    need_cache: task.need_cache,
                });
            }
        }
        TaskKind::FirstLoad => {
            let kind = match image.ensure_first_load().await {
                Ok(()) => CompletionKind::FirstLoadDone,
                Err(e) => {
                    warn!(image = image.identifier(), error = %e, "first load failed");
                    CompletionKind::Failed(e.to_string())
                }
            };
            let _ = completions.send(TileCompletion {
                image_id: image.id(),
                level: 0,
                tile_x: 0,
                tile_y: 0,
                kind,
                need_gpu: false,
                need_cache: false,
            });
        }
    }
}

async fn decode_one(
    task: &TileTask,
    image: &Arc<Image>,
    cache: &Arc<TileCache>,
    level: u32,
    tile_x: u32,
    tile_y: u32,
) -> TileCompletion {
    let key = TileCacheKey::new(image.id(), level, tile_x, tile_y);

    let kind = match cache.lookup(&key) {
        super::cache::CacheLookup::Ready(pixels) => {
            cache.clear_inflight(&key);
            release_tile_claim(image, level, tile_x, tile_y);
            CompletionKind::Loaded(pixels)
        }
        _ => match image.decode_tile(level, tile_x, tile_y).await {
            Ok(pixels) => {
                let bytes = Bytes::from(pixels);
                finish_tile(task, image, cache, level, tile_x, tile_y, &bytes);
                let is_empty = image
                    .level(level)
                    .and_then(|l| l.tile(tile_x, tile_y))
                    .map(|t| t.is_empty.load(std::sync::atomic::Ordering::Acquire))
                    .unwrap_or(false);
                if is_empty {
                    CompletionKind::Empty
                } else {
                    CompletionKind::Loaded(bytes)
                }
            }
            Err(e) => {
                fail_tile(image, cache, level, tile_x, tile_y);
                warn!(
                    image = image.identifier(),
                    level, tile_x, tile_y, error = %e,
                    "tile decode failed"
                );
                CompletionKind::Failed(e.to_string())
            }
        },
    };

    TileCompletion {
        image_id: image.id(),
        level,
        tile_x,
        tile_y,
        kind,
        need_gpu: task.need_gpu,
        need_cache: task.need_cache,
    }
}

/// Cache the pixels if asked and release the tile's streaming claim.
fn finish_tile(
    task: &TileTask,
    image: &Arc<Image>,
    cache: &Arc<TileCache>,
    level: u32,
    tile_x: u32,
    tile_y: u32,
    pixels: &Bytes,
) {
    let key = TileCacheKey::new(image.id(), level, tile_x, tile_y);
    if task.need_cache {
        cache.insert(key, pixels.clone(), false);
        if let Some(tile) = image.level(level).and_then(|l| l.tile(tile_x, tile_y)) {
            tile.is_cached.store(true, std::sync::atomic::Ordering::Release);
        }
    }
    cache.clear_inflight(&key);
    release_tile_claim(image, level, tile_x, tile_y);
}

/// A failed tile renders as background: mark empty, release claims.
fn fail_tile(
    image: &Arc<Image>,
    cache: &Arc<TileCache>,
    level: u32,
    tile_x: u32,
    tile_y: u32,
) {
    if let Some(tile) = image.level(level).and_then(|l| l.tile(tile_x, tile_y)) {
        tile.is_empty.store(true, std::sync::atomic::Ordering::Release);
    }
    cache.clear_inflight(&TileCacheKey::new(image.id(), level, tile_x, tile_y));
    release_tile_claim(image, level, tile_x, tile_y);
}

fn release_tile_claim(image: &Arc<Image>, level: u32, tile_x: u32, tile_y: u32) {
    if let Some(tile) = image.level(level).and_then(|l| l.tile(tile_x, tile_y)) {
        tile.finish_submit();
    }
}

fn push_cancellations(task: &TileTask, completions: &mpsc::UnboundedSender<TileCompletion>) {
    let coords: Vec<(u32, u32, u32)> = match &task.kind {
        TaskKind::Tile {
            level,
            tile_x,
            tile_y,
        } => vec![(*level, *tile_x, *tile_y)],
        TaskKind::TileBatch(coords) => coords.clone(),
        TaskKind::FirstLoad => vec![(0, 0, 0)],
    };
    for (level, tile_x, tile_y) in coords {
        release_tile_claim(&task.image, level, tile_x, tile_y);
        let _ = completions.send(TileCompletion {
            image_id: task.image.id(),
            level,
            tile_x,
            tile_y,
            kind: CompletionKind::Cancelled,
            need_gpu: task.need_gpu,
            need_cache: task.need_cache,
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
