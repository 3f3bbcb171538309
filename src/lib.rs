//! REELA - Editorial timeline playback engine
//!
//! Timelines of image sequences, movie containers and audio, decoded
//! ahead of a steady-clock playhead into a bounded frame cache and
//! published to hosts through observable values. No UI lives here;
//! renderers and audio sinks subscribe to the player's outputs.

// Core engine (cache, clock, pipeline, player, workers)
pub mod core;

// Engine-wide services and data model
pub mod audio;
pub mod context;
pub mod error;
pub mod image;
pub mod io;
pub mod observe;
pub mod path;
pub mod time;
pub mod timeline;

// Re-export commonly used types from core
pub use core::cache::FrameCache;
pub use core::clock::{Clock, LoopMode, Playback};
pub use core::player::{CacheInfo, Player, PlayerCacheOptions, PlayerState};
pub use core::thumbs::{ThumbnailPayload, ThumbnailReply, ThumbnailService};

// Re-export the data model
pub use audio::{Audio, AudioInfo, AudioType};
pub use context::{Context, ContextOptions};
pub use error::{Error, Result};
pub use image::{Image, ImageInfo, PixelType};
pub use observe::{ObservableList, ObservableMap, ObservableValue, OnObserve, Subscription};
pub use path::Path;
pub use time::{RationalTime, TimeRange};
pub use timeline::{Clip, Item, Timeline, Track, TrackKind};
