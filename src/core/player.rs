//! Playback façade over the clock, pipeline, and cache
//!
//! **Why**: Hosts need one object that owns the moving parts of playback
//! (transport clock, read-ahead pipeline, shared frame cache) and exposes a
//! control surface plus observable outputs without dictating a UI loop.
//!
//! **Used by**: embedding applications, driven from a host tick thread
//!
//! # Threading
//!
//! `Player` is single-threaded: controls and [`Player::tick`] run on the
//! host's tick thread, and observer callbacks fire synchronously on that
//! thread in registration order. Decode work happens on the worker pool and
//! only meets this thread through the frame cache, so `tick` never blocks
//! on I/O.
//!
//! # Tick cycle
//!
//! Each `tick(now)` samples the clock, publishes the frame at the current
//! time (or republishes the last committed frame on a cache miss, counting
//! a drop), pushes due audio, advances the pipeline, and refreshes cache
//! statistics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::core::cache::{CacheKey, CacheValue};
use crate::core::clock::{AudioPosition, Clock, LoopMode, Playback};
use crate::core::pipeline::{Pipeline, TickState};
use crate::error::Result;
use crate::io::{AudioData, AudioLayer, Options, VideoData, VideoLayer};
use crate::observe::ObservableValue;
use crate::time::{RationalTime, TimeRange};
use crate::timeline::Timeline;

/// Cadence for the periodic cache statistics log line
const STATS_LOG_PERIOD: Duration = Duration::from_secs(2);

/// Read-ahead tuning for a player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerCacheOptions {
    /// How far past the playhead to fill, in the playback direction
    pub read_ahead: RationalTime,
    /// How far behind the playhead to keep warm
    pub read_behind: RationalTime,
    /// Overrides the shared cache byte budget when set
    pub byte_budget: Option<usize>,
}

impl Default for PlayerCacheOptions {
    fn default() -> Self {
        Self {
            read_ahead: RationalTime::from_seconds(4.0, 1.0),
            read_behind: RationalTime::from_seconds(0.4, 1.0),
            byte_budget: None,
        }
    }
}

/// Serializable snapshot of the transport and audio controls
///
/// Restoring a session is a `serde_json` round-trip plus
/// [`Player::apply_state`]; fields missing from older snapshots fall back
/// to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerState {
    pub playback: Playback,
    pub loop_mode: LoopMode,
    pub current_time: RationalTime,
    pub in_out_range: TimeRange,
    pub speed: f64,
    pub volume: f32,
    pub mute: bool,
    pub channel_mute: Vec<bool>,
    pub audio_offset: RationalTime,
    pub external_time_offset: RationalTime,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            playback: Playback::Stop,
            loop_mode: LoopMode::Loop,
            current_time: RationalTime::default(),
            in_out_range: TimeRange::new(RationalTime::default(), RationalTime::default()),
            speed: 1.0,
            volume: 1.0,
            mute: false,
            channel_mute: Vec::new(),
            audio_offset: RationalTime::default(),
            external_time_offset: RationalTime::default(),
        }
    }
}

/// Cache health published once per tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheInfo {
    pub bytes: usize,
    pub count: usize,
    /// Fraction of the wanted read-ahead window already decoded, 0..1
    pub read_ahead_filled: f64,
    /// Ticks where the playhead moved but the frame was not in cache
    pub dropped_frames: u64,
}

/// Timeline playback engine
///
/// Owns a [`Clock`] for transport, a [`Pipeline`] for read-ahead, and a set
/// of observable outputs. Construction validates the timeline and fails
/// rather than producing a player over a broken edit.
pub struct Player {
    ctx: Arc<Context>,
    timeline: Arc<Timeline>,
    clock: Clock,
    pipeline: Pipeline,
    /// Full timeline extent, for resetting the in/out range
    timeline_range: TimeRange,
    cache_options: PlayerCacheOptions,
    volume: f32,
    mute: bool,
    channel_mute: Vec<bool>,
    audio_offset: RationalTime,
    external_time_offset: RationalTime,
    last_time: Option<RationalTime>,
    /// Time of the last frame that actually composed, to retry misses
    /// while paused without republishing stale frames every tick
    published_video_time: Option<RationalTime>,
    last_video: Option<VideoData>,
    pushed_audio: Vec<CacheKey>,
    dropped_frames: u64,
    last_stats_log: Instant,
    time_subject: ObservableValue<RationalTime>,
    video_subject: ObservableValue<VideoData>,
    audio_subject: ObservableValue<AudioData>,
    playback_subject: ObservableValue<Playback>,
    loop_subject: ObservableValue<LoopMode>,
    speed_subject: ObservableValue<f64>,
    cache_subject: ObservableValue<CacheInfo>,
}

impl Player {
    pub fn new(
        timeline: Timeline,
        ctx: Arc<Context>,
        options: PlayerCacheOptions,
    ) -> Result<Self> {
        timeline.validate()?;
        let timeline = Arc::new(timeline);
        let range = timeline.time_range();
        if let Some(budget) = options.byte_budget {
            ctx.cache().set_max_bytes(budget);
        }
        let now = Instant::now();
        let mut clock = Clock::new(range, timeline.global_rate, now);
        clock.set_audio_master(ctx.audio_master());
        let mut pipeline = Pipeline::new(Arc::clone(&ctx), Arc::clone(&timeline));
        pipeline.set_window(options.read_ahead, options.read_behind);
        info!(
            "player: '{}', {} frames at {} fps",
            timeline.name, range.duration.value, timeline.global_rate
        );
        Ok(Self {
            ctx,
            timeline,
            clock,
            pipeline,
            timeline_range: range,
            cache_options: options,
            volume: 1.0,
            mute: false,
            channel_mute: Vec::new(),
            audio_offset: RationalTime::default(),
            external_time_offset: RationalTime::default(),
            last_time: None,
            published_video_time: None,
            last_video: None,
            pushed_audio: Vec::new(),
            dropped_frames: 0,
            last_stats_log: now,
            time_subject: ObservableValue::new(range.start),
            video_subject: ObservableValue::new(VideoData::default()),
            audio_subject: ObservableValue::new(AudioData::default()),
            playback_subject: ObservableValue::new(Playback::Stop),
            loop_subject: ObservableValue::new(LoopMode::Loop),
            speed_subject: ObservableValue::new(1.0),
            cache_subject: ObservableValue::new(CacheInfo::default()),
        })
    }

    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    // -- transport ---------------------------------------------------------

    pub fn playback(&self) -> Playback {
        self.clock.playback()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.clock.loop_mode()
    }

    pub fn speed(&self) -> f64 {
        self.clock.speed()
    }

    /// Signed playback direction, -1 or 1
    pub fn direction(&self) -> f64 {
        self.clock.direction()
    }

    pub fn is_playing(&self) -> bool {
        self.clock.is_playing()
    }

    pub fn in_out_range(&self) -> TimeRange {
        self.clock.range()
    }

    pub fn set_playback(&mut self, mode: Playback, now: Instant) {
        self.clock.set_playback(mode, now);
        self.playback_subject.set_if_changed(mode);
    }

    pub fn stop(&mut self, now: Instant) {
        self.set_playback(Playback::Stop, now);
    }

    pub fn forward(&mut self, now: Instant) {
        self.set_playback(Playback::Forward, now);
    }

    pub fn reverse(&mut self, now: Instant) {
        self.set_playback(Playback::Reverse, now);
    }

    /// Stop when playing; otherwise resume in the last direction
    pub fn toggle_playback(&mut self, now: Instant) {
        let mode = if self.clock.is_playing() {
            Playback::Stop
        } else if self.clock.direction() < 0.0 {
            Playback::Reverse
        } else {
            Playback::Forward
        };
        self.set_playback(mode, now);
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode, now: Instant) {
        self.clock.set_loop_mode(mode, now);
        self.loop_subject.set_if_changed(mode);
    }

    pub fn set_speed(&mut self, speed: f64, now: Instant) {
        self.clock.set_speed(speed, now);
        self.speed_subject.set_if_changed(self.clock.speed());
    }

    // -- navigation --------------------------------------------------------

    /// Jump to a time, clamped to the in/out range
    ///
    /// Cancels all in-flight reads; the next tick refills around the new
    /// position. Seeking to the current position is a no-op apart from the
    /// (empty) cancel.
    pub fn seek(&mut self, t: RationalTime, now: Instant) {
        self.clock.seek(t, now);
        self.pipeline.cancel_all();
    }

    pub fn start(&mut self, now: Instant) {
        let t = self.clock.range().start;
        self.seek(t, now);
    }

    pub fn end(&mut self, now: Instant) {
        let t = self.clock.range().end_time_inclusive();
        self.seek(t, now);
    }

    /// Step one frame back; wraps to the last frame under `Loop`
    ///
    /// Frame steps keep in-flight reads alive: the window barely moves, so
    /// cancelling would only thrash a warming cache.
    pub fn frame_prev(&mut self, now: Instant) {
        let t = self.clock.tick(now);
        let range = self.clock.range();
        let mut target = t - RationalTime::tick(self.clock.rate());
        if target < range.start {
            target = match self.clock.loop_mode() {
                LoopMode::Loop => range.end_time_inclusive(),
                _ => range.start,
            };
        }
        self.clock.seek(target, now);
    }

    /// Step one frame forward; wraps to the first frame under `Loop`
    pub fn frame_next(&mut self, now: Instant) {
        let t = self.clock.tick(now);
        let range = self.clock.range();
        let mut target = t + RationalTime::tick(self.clock.rate());
        if target > range.end_time_inclusive() {
            target = match self.clock.loop_mode() {
                LoopMode::Loop => range.start,
                _ => range.end_time_inclusive(),
            };
        }
        self.clock.seek(target, now);
    }

    // -- in/out range ------------------------------------------------------

    /// Restrict playback to a sub-range of the timeline
    ///
    /// The range is intersected with the timeline extent; a disjoint range
    /// resets to the full timeline. The playhead is clamped into the result.
    pub fn set_in_out_range(&mut self, range: TimeRange, now: Instant) {
        let range = self
            .timeline_range
            .intersection(&range)
            .unwrap_or(self.timeline_range);
        self.clock.set_range(range, now);
    }

    pub fn reset_in_out_range(&mut self, now: Instant) {
        self.clock.set_range(self.timeline_range, now);
    }

    /// Move the in point to the current frame
    pub fn set_in_point(&mut self, now: Instant) {
        let t = self.clock.tick(now);
        let range = self.clock.range();
        if t < range.end_time_exclusive() {
            self.clock
                .set_range(TimeRange::from_start_end_time(t, range.end_time_exclusive()), now);
        }
    }

    /// Move the out point to the current frame, inclusive
    pub fn set_out_point(&mut self, now: Instant) {
        let t = self.clock.tick(now);
        let range = self.clock.range();
        let end = t + RationalTime::tick(self.clock.rate());
        if end > range.start {
            self.clock
                .set_range(TimeRange::from_start_end_time(range.start, end), now);
        }
    }

    // -- audio -------------------------------------------------------------

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32, now: Instant) {
        self.volume = volume.clamp(0.0, 1.0);
        self.sync_audio_mute(now);
    }

    pub fn muted(&self) -> bool {
        self.mute
    }

    pub fn set_mute(&mut self, mute: bool, now: Instant) {
        self.mute = mute;
        self.sync_audio_mute(now);
    }

    pub fn set_channel_mute(&mut self, channel_mute: Vec<bool>) {
        self.channel_mute = channel_mute;
    }

    /// Shift audio relative to video; positive plays audio later
    pub fn set_audio_offset(&mut self, offset: RationalTime) {
        self.audio_offset = offset;
    }

    /// Hand the clock an audio device position to slave to
    pub fn set_audio_position(&mut self, position: Option<Arc<AudioPosition>>, now: Instant) {
        self.clock.set_audio_position(position, now);
    }

    fn sync_audio_mute(&mut self, now: Instant) {
        // inaudible output means the clock must not slave to the device
        self.clock
            .set_audio_muted(self.mute || self.volume <= 0.0, now);
    }

    // -- rate and sync -----------------------------------------------------

    /// Constant display-side offset, for compensating downstream latency
    ///
    /// The published time and the frames composed for it are shifted by this
    /// amount; the transport itself is unaffected.
    pub fn set_external_time_offset(&mut self, offset: RationalTime) {
        self.external_time_offset = offset;
    }

    // -- cache -------------------------------------------------------------

    pub fn cache_options(&self) -> &PlayerCacheOptions {
        &self.cache_options
    }

    pub fn set_cache_options(&mut self, options: PlayerCacheOptions) {
        self.pipeline.set_window(options.read_ahead, options.read_behind);
        if let Some(budget) = options.byte_budget {
            self.ctx.cache().set_max_bytes(budget);
        }
        self.cache_options = options;
    }

    pub fn cache_info(&self) -> CacheInfo {
        self.cache_subject.get()
    }

    /// Reader options forwarded with every I/O request
    pub fn set_io_options(&mut self, options: Options) {
        self.pipeline.set_io_options(options);
    }

    // -- state snapshots ---------------------------------------------------

    pub fn state(&mut self, now: Instant) -> PlayerState {
        PlayerState {
            playback: self.clock.playback(),
            loop_mode: self.clock.loop_mode(),
            current_time: self.clock.tick(now),
            in_out_range: self.clock.range(),
            speed: self.clock.speed(),
            volume: self.volume,
            mute: self.mute,
            channel_mute: self.channel_mute.clone(),
            audio_offset: self.audio_offset,
            external_time_offset: self.external_time_offset,
        }
    }

    pub fn apply_state(&mut self, state: &PlayerState, now: Instant) {
        self.set_in_out_range(state.in_out_range, now);
        self.seek(state.current_time, now);
        self.set_loop_mode(state.loop_mode, now);
        self.set_speed(state.speed, now);
        self.set_volume(state.volume, now);
        self.set_mute(state.mute, now);
        self.set_channel_mute(state.channel_mute.clone());
        self.set_audio_offset(state.audio_offset);
        self.set_external_time_offset(state.external_time_offset);
        self.set_playback(state.playback, now);
    }

    // -- observables -------------------------------------------------------

    pub fn observe_current_time(&self) -> &ObservableValue<RationalTime> {
        &self.time_subject
    }

    pub fn observe_current_video(&self) -> &ObservableValue<VideoData> {
        &self.video_subject
    }

    pub fn observe_current_audio(&self) -> &ObservableValue<AudioData> {
        &self.audio_subject
    }

    pub fn observe_playback(&self) -> &ObservableValue<Playback> {
        &self.playback_subject
    }

    pub fn observe_loop_mode(&self) -> &ObservableValue<LoopMode> {
        &self.loop_subject
    }

    pub fn observe_speed(&self) -> &ObservableValue<f64> {
        &self.speed_subject
    }

    pub fn observe_cache_info(&self) -> &ObservableValue<CacheInfo> {
        &self.cache_subject
    }

    // -- tick --------------------------------------------------------------

    /// Advance one cycle and return the current time
    pub fn tick(&mut self, now: Instant) -> RationalTime {
        let clock_time = self.clock.tick(now);
        let t = self.effective_time(clock_time);

        // the clock stops itself at the end of the range under Once
        self.playback_subject.set_if_changed(self.clock.playback());

        let changed = self.last_time != Some(t);
        if self.published_video_time != Some(t) {
            match self.compose_frame(t) {
                Some(frame) => {
                    self.published_video_time = Some(t);
                    self.last_video = Some(frame.clone());
                    self.video_subject.set(frame);
                }
                None if changed => {
                    if self.clock.is_playing() {
                        self.dropped_frames += 1;
                    }
                    // keep the viewport on the last committed frame
                    if let Some(stale) = self.last_video.clone() {
                        self.video_subject.set(stale);
                    }
                }
                None => {}
            }
        }
        self.last_time = Some(t);
        self.time_subject.set_if_changed(t);

        self.push_audio(t);

        let metrics = self.pipeline.tick(&TickState {
            current_time: t,
            direction: self.clock.direction(),
            range: self.clock.range(),
            loop_mode: self.clock.loop_mode(),
            audio_offset: self.audio_offset,
        });

        let stats = self.ctx.cache().stats();
        self.cache_subject.set_if_changed(CacheInfo {
            bytes: stats.bytes,
            count: stats.count,
            read_ahead_filled: metrics.read_ahead_filled,
            dropped_frames: self.dropped_frames,
        });

        if now.duration_since(self.last_stats_log) >= STATS_LOG_PERIOD {
            self.last_stats_log = now;
            debug!(
                "player: cache {:.1} MB in {} entries, fill {:.0}%, {} dropped, hit rate {:.0}%",
                stats.bytes as f64 / (1024.0 * 1024.0),
                stats.count,
                metrics.read_ahead_filled * 100.0,
                self.dropped_frames,
                stats.hit_rate() * 100.0,
            );
        }
        t
    }

    /// Apply the external time offset on the display side of the clock
    fn effective_time(&self, t: RationalTime) -> RationalTime {
        if self.external_time_offset.value == 0.0 {
            return t;
        }
        let shifted = t + self.external_time_offset;
        let range = self.clock.range();
        let shifted = match self.clock.loop_mode() {
            LoopMode::Loop => range.wrapped(shifted),
            _ => range.clamped(shifted),
        };
        shifted.rescaled_to(self.clock.rate()).round()
    }

    /// Every video layer at `t` from the cache, or `None` when any primary
    /// image is still missing. A missing B side degrades to no B image.
    fn compose_frame(&mut self, t: RationalTime) -> Option<VideoData> {
        let timeline = Arc::clone(&self.timeline);
        let cache = Arc::clone(self.ctx.cache());
        let mut layers = Vec::new();
        for request in timeline.video_layers_at(t) {
            let key = self.pipeline.key_for(&request.target, request.source_time);
            let image = match cache.get(&key) {
                Some(CacheValue::Video(data)) => {
                    data.layers.into_iter().next().and_then(|layer| layer.image)
                }
                _ => None,
            };
            let image = match image {
                Some(image) => image,
                None => return None,
            };
            let image_b = request.b.as_ref().and_then(|(_, target, time)| {
                let key = self.pipeline.key_for(target, *time);
                match cache.get(&key) {
                    Some(CacheValue::Video(data)) => {
                        data.layers.into_iter().next().and_then(|layer| layer.image)
                    }
                    _ => None,
                }
            });
            layers.push(VideoLayer {
                image: Some(image),
                image_b,
                transition: request.transition,
                transition_value: request.transition_value as f32,
            });
        }
        Some(VideoData { time: t, layers })
    }

    /// Publish the audio second under the playhead when it changes
    ///
    /// Audio only flows during audible forward playback; reverse and
    /// scrubbing stay silent.
    fn push_audio(&mut self, t: RationalTime) {
        if self.clock.playback() != Playback::Forward || self.mute || self.volume <= 0.0 {
            return;
        }
        let timeline = Arc::clone(&self.timeline);
        let cache = Arc::clone(self.ctx.cache());
        let rate = timeline.global_rate;
        let shifted = t.rescaled_to(rate) + self.audio_offset;
        let probe = TimeRange::new(shifted, RationalTime::tick(rate));

        let mut keys = Vec::new();
        let mut layers = Vec::new();
        let mut block_time = None;
        for track in timeline.audio_tracks() {
            for (clip, span) in track.clips_intersecting(&probe, rate) {
                let source = clip.source_time(span.start, shifted);
                let key = self.pipeline.audio_key_for(&clip.media.target, source);
                if let Some(CacheValue::Audio(block)) = cache.get(&key) {
                    if block_time.is_none() {
                        block_time = Some(block.time);
                    }
                    for layer in block.layers {
                        layers.push(self.processed_layer(layer));
                    }
                    keys.push(key);
                }
            }
        }
        if keys.is_empty() || keys == self.pushed_audio {
            return;
        }
        self.pushed_audio = keys;
        let time = block_time.unwrap_or(shifted);
        self.audio_subject.set(AudioData { time, layers });
    }

    /// Volume and channel mutes baked into a copy of the layer's samples
    fn processed_layer(&self, layer: AudioLayer) -> AudioLayer {
        let muting = self.channel_mute.iter().any(|m| *m);
        if self.volume == 1.0 && !muting {
            return layer;
        }
        let audio = layer.audio.map(|audio| {
            let mut processed = (*audio).clone();
            if self.volume != 1.0 {
                processed.apply_gain(self.volume);
            }
            if muting {
                processed.mute_channels(&self.channel_mute);
            }
            Arc::new(processed)
        });
        AudioLayer { audio }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.pipeline.cancel_all();
        // pins in the shared cache outlive the pipeline that set them
        self.ctx.cache().unpin_all();
    }
}
