//! Tile streaming layer.
//!
//! The producer/consumer pipeline between the viewer and the format
//! decoders:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       viewer frame (SceneSnapshot)      │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │             TileStreamer                │
//! │   wishlist → priorities → TileTasks     │
//! └──────┬──────────────────────────┬───────┘
//!        ▼                          ▲
//! ┌─────────────┐   completions ┌───┴──────────┐
//! │ WorkerPool  │──────────────▶│ drain (7 ms) │
//! │ (N decoders)│               └──────────────┘
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │  TileCache  │  byte-bounded, single-flight
//! └─────────────┘
//! ```

mod cache;
mod queue;
mod streamer;
mod viewport;

pub use cache::{CacheLookup, TileCache, TileCacheKey, DEFAULT_TILE_CACHE_CAPACITY};
pub use queue::{
    default_worker_count, CompletionKind, PriorityTaskQueue, TaskKind, TileCompletion,
    TileTask, WorkerPool, MAX_THREAD_COUNT,
};
pub use streamer::{
    TileStreamer, COMPLETION_DRAIN_BUDGET, MAX_TILES_TO_LOAD, MAX_TILES_TO_LOAD_REMOTE,
    REMOTE_SUBMIT_FRAME_INTERVAL, TILE_LOAD_BATCH_MAX,
};
pub use viewport::{Bounds, SceneSnapshot, ZoomState};
