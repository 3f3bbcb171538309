//! Core engine modules - cache, clock, pipeline, player, workers
//!
//! These modules form the playback engine, independent of any host UI.

pub mod cache;
pub mod clock;
pub mod pipeline;
pub mod player;
pub mod thumbs;
pub mod workers;

// Re-exports for convenience
pub use cache::{CacheKey, CacheValue, FrameCache};
pub use clock::{Clock, LoopMode, Playback};
pub use pipeline::Pipeline;
pub use player::{CacheInfo, Player, PlayerCacheOptions, PlayerState};
pub use thumbs::ThumbnailService;
pub use workers::Workers;
