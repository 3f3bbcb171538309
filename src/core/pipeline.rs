//! Read-ahead pipeline: keeps the cache full of what plays next
//!
//! **Why**: decode latency dwarfs a frame period, so playback only stays
//! smooth when frames are requested well before they are due. Each tick
//! diffs a look-ahead window against the cache and the in-flight set,
//! tops up decoder queues within per-reader caps, and pins the window so
//! eviction cannot eat what is about to be shown.
//!
//! **Used by**: Player tick (single-threaded caller)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::{debug, trace, warn};

use crate::context::Context;
use crate::core::cache::{CacheKey, CacheValue};
use crate::core::clock::LoopMode;
use crate::error::Error;
use crate::io::{self, AudioData, Options, Pending, VideoData};
use crate::path::Path;
use crate::time::{RationalTime, TimeRange};
use crate::timeline::Timeline;

/// Outstanding video requests allowed per reader
const MAX_VIDEO_IN_FLIGHT: usize = 4;
/// Outstanding audio requests allowed per reader
const MAX_AUDIO_IN_FLIGHT: usize = 2;
/// Requests this far outside the window (fraction of its length) get
/// their reader cancelled
const HYSTERESIS: f64 = 0.25;
/// Back-off before retrying a source that failed to open
const OPEN_RETRY: Duration = Duration::from_secs(1);

/// Window fill snapshot returned by [`Pipeline::tick`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FillMetrics {
    /// Distinct frames and audio blocks the current window needs
    pub wanted: usize,
    /// How many of those the cache already holds
    pub cached: usize,
    /// Requests currently queued on readers
    pub in_flight: usize,
    /// `cached / wanted`, 1.0 for an empty window
    pub read_ahead_filled: f64,
}

/// Playhead state sampled by the player for one tick
#[derive(Debug, Clone, Copy)]
pub struct TickState {
    pub current_time: RationalTime,
    /// +1.0 or -1.0; read-ahead extends this way
    pub direction: f64,
    pub range: TimeRange,
    pub loop_mode: LoopMode,
    /// Shift applied to audio request windows
    pub audio_offset: RationalTime,
}

enum Request {
    Video(Pending<VideoData>),
    Audio(Pending<AudioData>),
}

struct InFlight {
    request: Request,
    /// Media target, for per-reader caps and cancellation
    target: String,
    /// Timeline time the request serves, for the hysteresis test
    timeline_time: RationalTime,
}

/// Working state of one planning pass
#[derive(Default)]
struct Plan {
    /// (video, audio) requests outstanding per target
    counts: HashMap<String, (usize, usize)>,
    seen: HashSet<CacheKey>,
    pinned: Vec<CacheKey>,
    wanted: usize,
    have: usize,
    /// Cache over budget with everything pinned; submit nothing
    saturated: bool,
}

/// Per-tick read-ahead around the playhead.
///
/// Owned and driven by the player; never blocks. Completed requests are
/// harvested with zero-timeout polls, missing frames are submitted within
/// per-reader caps, and requests the window has left behind are cancelled
/// through their reader.
pub struct Pipeline {
    ctx: Arc<Context>,
    timeline: Arc<Timeline>,
    io_options: Options,
    read_ahead: RationalTime,
    read_behind: RationalTime,
    in_flight: IndexMap<CacheKey, InFlight>,
    /// target -> fingerprint memo; fingerprinting hashes per call
    fingerprints: HashMap<String, u64>,
    /// Sources that failed to open, with the earliest retry instant
    failed: HashMap<String, Instant>,
}

impl Pipeline {
    pub fn new(ctx: Arc<Context>, timeline: Arc<Timeline>) -> Self {
        Self {
            ctx,
            timeline,
            io_options: Options::new(),
            read_ahead: RationalTime::from_seconds(4.0, 1.0),
            read_behind: RationalTime::from_seconds(0.4, 1.0),
            in_flight: IndexMap::new(),
            fingerprints: HashMap::new(),
            failed: HashMap::new(),
        }
    }

    pub fn set_window(&mut self, read_ahead: RationalTime, read_behind: RationalTime) {
        self.read_ahead = read_ahead;
        self.read_behind = read_behind;
    }

    pub fn set_io_options(&mut self, options: Options) {
        self.io_options = options;
        self.fingerprints.clear();
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Cache key for a media target at a source-domain time. The player
    /// uses the same mapping when assembling frames, so lookups and
    /// submissions always agree.
    pub fn key_for(&mut self, target: &str, source_time: RationalTime) -> CacheKey {
        let fingerprint = match self.fingerprints.get(target) {
            Some(f) => *f,
            None => {
                let f = io::source_fingerprint(&Path::parse(target).full(), &self.io_options);
                self.fingerprints.insert(target.to_string(), f);
                f
            }
        };
        CacheKey::new(fingerprint, source_time)
    }

    /// Key for the whole second of source audio covering `source_time`
    pub fn audio_key_for(&mut self, target: &str, source_time: RationalTime) -> CacheKey {
        let second = source_time.to_seconds().floor();
        self.key_for(target, RationalTime::new(second, 1.0))
    }

    /// One pass of the read-ahead cycle. Harvests completions, plans the
    /// window, submits missing frames, re-pins the window, and cancels
    /// what the window left behind.
    pub fn tick(&mut self, state: &TickState) -> FillMetrics {
        self.harvest();

        let cache = Arc::clone(self.ctx.cache());
        let windows = self.windows(state);
        let mut plan = Plan {
            counts: self.per_target_counts(),
            saturated: cache.stats().bytes > cache.max_bytes(),
            ..Plan::default()
        };

        self.plan_video(&windows, &mut plan);
        self.plan_audio(state, &windows, &mut plan);

        cache.unpin_all();
        cache.pin(&plan.pinned);
        cache.evict();

        self.cancel_stale(&windows);

        FillMetrics {
            wanted: plan.wanted,
            cached: plan.have,
            in_flight: self.in_flight.len(),
            read_ahead_filled: if plan.wanted == 0 {
                1.0
            } else {
                plan.have as f64 / plan.wanted as f64
            },
        }
    }

    /// Cancel everything; used on seeks and at destruction. No request
    /// submitted before this call can deliver a value afterwards.
    pub fn cancel_all(&mut self) {
        let n = self.in_flight.len();
        self.ctx.readers().cancel_all();
        self.in_flight.clear();
        if n > 0 {
            debug!("pipeline: cancelled {} in-flight requests", n);
        }
    }

    /// Poll every pending request once; store completions in the cache.
    /// Cancelled results are absorbed, failures are logged and dropped.
    fn harvest(&mut self) {
        let cache = Arc::clone(self.ctx.cache());
        let mut completed: Vec<(CacheKey, crate::error::Result<CacheValue>)> = Vec::new();

        self.in_flight.retain(|key, entry| match &mut entry.request {
            Request::Video(p) => match p.poll() {
                None => true,
                Some(r) => {
                    completed.push((*key, r.map(CacheValue::Video)));
                    false
                }
            },
            Request::Audio(p) => match p.poll() {
                None => true,
                Some(r) => {
                    completed.push((*key, r.map(CacheValue::Audio)));
                    false
                }
            },
        });

        for (key, result) in completed {
            match result {
                Ok(value) => {
                    let bytes = value.byte_count();
                    cache.put(key, value, bytes);
                }
                Err(Error::Cancelled) => {}
                Err(e) => debug!("pipeline: request for {:?} failed: {}", key, e),
            }
        }
    }

    /// The look-ahead window(s): read-ahead extends in the travel
    /// direction, read-behind trails it, and the loop mode decides what
    /// happens where the window crosses the in/out range.
    fn windows(&self, state: &TickState) -> Vec<TimeRange> {
        let rate = self.timeline.global_rate;
        let t = state.current_time.rescaled_to(rate).value;
        let ahead = self.read_ahead.rescaled_to(rate).value;
        let behind = self.read_behind.rescaled_to(rate).value;
        let (lo, hi) = if state.direction >= 0.0 {
            (t - behind, t + ahead)
        } else {
            (t - ahead, t + behind)
        };

        let range = TimeRange::new(
            state.range.start.rescaled_to(rate),
            state.range.duration.rescaled_to(rate),
        );
        let start = range.start.value;
        let end = range.end_time_exclusive().value;
        let window = span(lo, hi, rate);

        let mut out = Vec::new();
        match state.loop_mode {
            LoopMode::Once => {
                if let Some(w) = window.intersection(&range) {
                    out.push(w);
                }
            }
            LoopMode::Loop => {
                if hi - lo >= end - start {
                    out.push(range);
                } else {
                    if let Some(w) = window.intersection(&range) {
                        out.push(w);
                    }
                    // overflow wraps to the opposite boundary
                    if hi > end {
                        out.push(span(start, (start + (hi - end)).min(end), rate));
                    }
                    if lo < start {
                        out.push(span((end - (start - lo)).max(start), end, rate));
                    }
                }
            }
            LoopMode::PingPong => {
                if let Some(w) = window.intersection(&range) {
                    out.push(w);
                }
                // overflow reflects back inside off the boundary it crossed
                if hi > end {
                    out.push(span((end - (hi - end)).max(start), end, rate));
                }
                if lo < start {
                    out.push(span(start, (start + (start - lo)).min(end), rate));
                }
            }
        }
        out.retain(|w| w.duration.value > 0.0);
        out
    }

    fn plan_video(&mut self, windows: &[TimeRange], plan: &mut Plan) {
        let timeline = Arc::clone(&self.timeline);
        let cache = Arc::clone(self.ctx.cache());
        let rate = timeline.global_rate;

        for window in windows {
            for frame in frame_indices(window, rate) {
                let t = RationalTime::new(frame as f64, rate);
                for layer in timeline.video_layers_at(t) {
                    let mut sides = vec![(layer.target.clone(), layer.source_time)];
                    if let Some((_, b_target, b_time)) = &layer.b {
                        sides.push((b_target.clone(), *b_time));
                    }
                    for (target, source_time) in sides {
                        let key = self.key_for(&target, source_time);
                        if !plan.seen.insert(key) {
                            continue;
                        }
                        plan.pinned.push(key);
                        plan.wanted += 1;
                        if cache.contains(&key) {
                            plan.have += 1;
                            continue;
                        }
                        if plan.saturated || self.in_flight.contains_key(&key) {
                            continue;
                        }
                        let used = plan.counts.entry(target.clone()).or_default();
                        if used.0 >= MAX_VIDEO_IN_FLIGHT {
                            continue;
                        }
                        if self.submit_video(key, &target, source_time, t) {
                            used.0 += 1;
                        }
                    }
                }
            }
        }
    }

    /// Audio analog of the video plan: whole-second source ranges for
    /// every audio clip the (offset-shifted) window touches. Partial
    /// trailing seconds are requested whole; readers clip to the media.
    fn plan_audio(&mut self, state: &TickState, windows: &[TimeRange], plan: &mut Plan) {
        let timeline = Arc::clone(&self.timeline);
        let cache = Arc::clone(self.ctx.cache());
        let rate = timeline.global_rate;

        for window in windows {
            let shifted = TimeRange::new(window.start + state.audio_offset, window.duration);
            for track in timeline.audio_tracks() {
                for (clip, clip_span) in track.clips_intersecting(&shifted, rate) {
                    let Some(overlap) = shifted.intersection(&clip_span) else { continue };
                    let src_lo = clip.source_time(clip_span.start, overlap.start).to_seconds();
                    let src_hi = clip
                        .source_time(clip_span.start, overlap.end_time_exclusive())
                        .to_seconds();
                    let first = src_lo.floor() as i64;
                    let last = ((src_hi - 1e-9).floor() as i64).max(first);
                    for second in first..=last {
                        let target = clip.media.target.clone();
                        let key = self.key_for(&target, RationalTime::new(second as f64, 1.0));
                        if !plan.seen.insert(key) {
                            continue;
                        }
                        plan.pinned.push(key);
                        plan.wanted += 1;
                        if cache.contains(&key) {
                            plan.have += 1;
                            continue;
                        }
                        if plan.saturated || self.in_flight.contains_key(&key) {
                            continue;
                        }
                        let used = plan.counts.entry(target.clone()).or_default();
                        if used.1 >= MAX_AUDIO_IN_FLIGHT {
                            continue;
                        }
                        let src_range = TimeRange::new(
                            RationalTime::from_seconds(second as f64, clip.rate()),
                            RationalTime::from_seconds(1.0, clip.rate()),
                        );
                        if self.submit_audio(key, &target, src_range, overlap.start) {
                            used.1 += 1;
                        }
                    }
                }
            }
        }
    }

    fn submit_video(
        &mut self,
        key: CacheKey,
        target: &str,
        source_time: RationalTime,
        timeline_time: RationalTime,
    ) -> bool {
        if self.open_backoff(target) {
            return false;
        }
        let path = Path::parse(target);
        let options = &self.io_options;
        let result = self
            .ctx
            .readers()
            .with_reader(&path, options, |reader, _| reader.read_video(source_time, options));
        match result {
            Ok(pending) => {
                self.failed.remove(target);
                self.in_flight.insert(
                    key,
                    InFlight {
                        request: Request::Video(pending),
                        target: target.to_string(),
                        timeline_time,
                    },
                );
                trace!("pipeline: requested '{}' @ {}", target, source_time);
                true
            }
            Err(e) => {
                warn!("pipeline: open '{}' failed: {}", target, e);
                self.failed.insert(target.to_string(), Instant::now() + OPEN_RETRY);
                false
            }
        }
    }

    fn submit_audio(
        &mut self,
        key: CacheKey,
        target: &str,
        source_range: TimeRange,
        timeline_time: RationalTime,
    ) -> bool {
        if self.open_backoff(target) {
            return false;
        }
        let path = Path::parse(target);
        let options = &self.io_options;
        let result = self
            .ctx
            .readers()
            .with_reader(&path, options, |reader, _| reader.read_audio(source_range, options));
        match result {
            Ok(pending) => {
                self.failed.remove(target);
                self.in_flight.insert(
                    key,
                    InFlight {
                        request: Request::Audio(pending),
                        target: target.to_string(),
                        timeline_time,
                    },
                );
                true
            }
            Err(e) => {
                warn!("pipeline: open '{}' failed: {}", target, e);
                self.failed.insert(target.to_string(), Instant::now() + OPEN_RETRY);
                false
            }
        }
    }

    fn open_backoff(&self, target: &str) -> bool {
        self.failed.get(target).is_some_and(|until| Instant::now() < *until)
    }

    /// Readers whose pending requests fell outside the grown window get
    /// cancelled whole; survivors are resubmitted by later ticks.
    fn cancel_stale(&mut self, windows: &[TimeRange]) {
        if self.in_flight.is_empty() {
            return;
        }
        let grown: Vec<TimeRange> = windows.iter().map(grow).collect();
        let mut stale: HashSet<String> = HashSet::new();
        for (_, entry) in self.in_flight.iter() {
            let inside = grown.iter().any(|w| w.contains(entry.timeline_time));
            if !inside {
                stale.insert(entry.target.clone());
            }
        }
        if stale.is_empty() {
            return;
        }
        for target in &stale {
            self.ctx.readers().cancel(&Path::parse(target), &self.io_options);
            debug!("pipeline: window left '{}' behind, cancelled", target);
        }
        self.in_flight.retain(|_, entry| !stale.contains(&entry.target));
    }

    fn per_target_counts(&self) -> HashMap<String, (usize, usize)> {
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        for (_, entry) in self.in_flight.iter() {
            let slot = counts.entry(entry.target.clone()).or_default();
            match entry.request {
                Request::Video(_) => slot.0 += 1,
                Request::Audio(_) => slot.1 += 1,
            }
        }
        counts
    }
}

fn span(lo: f64, hi: f64, rate: f64) -> TimeRange {
    TimeRange::from_start_end_time(RationalTime::new(lo, rate), RationalTime::new(hi, rate))
}

fn grow(w: &TimeRange) -> TimeRange {
    let margin = w.duration.value * HYSTERESIS;
    TimeRange::new(
        RationalTime::new(w.start.value - margin, w.start.rate),
        RationalTime::new(w.duration.value + 2.0 * margin, w.duration.rate),
    )
}

/// Frame indices on the global-rate lattice inside the half-open
/// `window`; empty when no lattice point falls inside
fn frame_indices(window: &TimeRange, rate: f64) -> std::ops::RangeInclusive<i64> {
    let first = (window.start.rescaled_to(rate).value - 1e-9).ceil() as i64;
    let last = (window.end_time_exclusive().rescaled_to(rate).value - 1e-6).floor() as i64;
    first..=last
}
