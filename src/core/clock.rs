//! Playback clock: wall time to timeline time
//!
//! **Why**: playback position must be derived, not accumulated. An anchor
//! pair (wall instant, timeline time) makes every sample an exact function
//! of elapsed time, so long sessions cannot drift and seeks are a single
//! re-anchor. Loop handling folds or wraps the raw position in continuous
//! time before quantizing to the frame lattice.
//!
//! **Used by**: Player tick (the only caller of mutating methods)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::time::{RationalTime, TimeRange};

/// Transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Playback {
    Stop,
    Forward,
    Reverse,
}

/// Behavior at the in/out boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopMode {
    /// Clamp at the boundary and stop
    Once,
    /// Wrap to the opposite boundary
    Loop,
    /// Reflect and reverse direction
    PingPong,
}

/// Playback position of an external audio output, counted in samples.
///
/// The host's audio callback calls [`AudioPosition::advance`]; when the
/// clock runs audio-master it derives elapsed time from this counter
/// instead of the steady clock, so video follows the device's true pace.
#[derive(Debug)]
pub struct AudioPosition {
    samples: AtomicU64,
    sample_rate: u32,
}

impl AudioPosition {
    pub fn new(sample_rate: u32) -> Self {
        Self { samples: AtomicU64::new(0), sample_rate }
    }

    pub fn advance(&self, samples: u64) {
        self.samples.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn elapsed_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples() as f64 / self.sample_rate as f64
    }
}

/// Anchored playback clock.
///
/// All mutating calls take `now` explicitly; the player passes
/// `Instant::now()` and tests pass synthetic instants, which keeps every
/// timing scenario deterministic. The clock never sleeps and never reads
/// the wall clock itself.
#[derive(Debug)]
pub struct Clock {
    playback: Playback,
    loop_mode: LoopMode,
    /// Rate multiplier; its sign contributes to the effective direction
    speed: f64,
    /// +1 or -1; kept across Stop and zero speed so resume continues the
    /// same way, flipped by ping-pong reflections
    direction: f64,
    range: TimeRange,
    /// Frame lattice the sampled time is quantized to
    rate: f64,
    anchor_wall: Instant,
    anchor_timeline: RationalTime,
    /// Audio sample count at the last re-anchor
    anchor_audio: u64,
    audio: Option<Arc<AudioPosition>>,
    audio_muted: bool,
    audio_master: bool,
}

impl Clock {
    pub fn new(range: TimeRange, rate: f64, now: Instant) -> Self {
        Self {
            playback: Playback::Stop,
            loop_mode: LoopMode::Loop,
            speed: 1.0,
            direction: 1.0,
            range,
            rate,
            anchor_wall: now,
            anchor_timeline: range.start,
            anchor_audio: 0,
            audio: None,
            audio_muted: true,
            audio_master: false,
        }
    }

    pub fn playback(&self) -> Playback {
        self.playback
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Effective direction of travel: transport direction with the sign
    /// of `speed` folded in. Zero speed reports the preserved direction.
    pub fn direction(&self) -> f64 {
        if self.speed < 0.0 { -self.direction } else { self.direction }
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_playing(&self) -> bool {
        self.playback != Playback::Stop && self.speed != 0.0
    }

    /// Switch transport mode, re-anchoring at the sampled position
    pub fn set_playback(&mut self, mode: Playback, now: Instant) {
        let t = self.tick(now);
        self.re_anchor(t, now);
        self.playback = mode;
        match mode {
            Playback::Forward => self.direction = 1.0,
            Playback::Reverse => self.direction = -1.0,
            Playback::Stop => {}
        }
        debug!("clock: playback {:?} at {}", mode, t);
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode, now: Instant) {
        let t = self.tick(now);
        self.re_anchor(t, now);
        self.loop_mode = mode;
    }

    /// Jump to `t`, clamped into the in/out range. Playback continues.
    pub fn seek(&mut self, t: RationalTime, now: Instant) {
        let clamped = self.range.clamped(t.rescaled_to(self.rate));
        self.re_anchor(clamped, now);
        trace!("clock: seek {} -> {}", t, clamped);
    }

    /// Change the rate multiplier. Zero freezes time like Stop but keeps
    /// the transport mode and direction for resume.
    pub fn set_speed(&mut self, speed: f64, now: Instant) {
        let t = self.tick(now);
        self.re_anchor(t, now);
        self.speed = speed;
    }

    /// Replace the in/out range; the playhead clamps into the new range
    pub fn set_range(&mut self, range: TimeRange, now: Instant) {
        let t = self.tick(now);
        self.range = range;
        self.re_anchor(range.clamped(t), now);
    }

    pub fn set_audio_position(&mut self, audio: Option<Arc<AudioPosition>>, now: Instant) {
        let t = self.tick(now);
        self.audio = audio;
        self.re_anchor(t, now);
    }

    pub fn set_audio_muted(&mut self, muted: bool, now: Instant) {
        if self.audio_muted == muted {
            return;
        }
        let t = self.tick(now);
        self.audio_muted = muted;
        self.re_anchor(t, now);
    }

    pub fn set_audio_master(&mut self, enabled: bool) {
        self.audio_master = enabled;
    }

    /// Current timeline time, quantized to the frame lattice.
    ///
    /// Mutates on two occasions: Once playback crossing a boundary clamps
    /// and transitions to Stop; a ping-pong reflection flips the direction
    /// and re-anchors at the fold point.
    pub fn tick(&mut self, now: Instant) -> RationalTime {
        if self.playback == Playback::Stop || self.speed == 0.0 {
            return self.quantize(self.anchor_timeline);
        }

        let elapsed = self.elapsed_seconds(now);
        let velocity = self.speed * self.direction;
        let raw = self.anchor_timeline + RationalTime::from_seconds(elapsed * velocity, self.rate);

        let resolved = match self.loop_mode {
            LoopMode::Once => {
                let forward = velocity >= 0.0;
                let out_high = forward && raw >= self.range.end_time_exclusive();
                let out_low = !forward && raw < self.range.start;
                if out_high || out_low {
                    let end = self.range.clamped(raw);
                    self.playback = Playback::Stop;
                    self.re_anchor(end, now);
                    debug!("clock: reached {} once, stopping", end);
                    end
                } else {
                    raw
                }
            }
            LoopMode::Loop => self.range.wrapped(raw),
            LoopMode::PingPong => {
                let (folded, flipped) = self.range.folded(raw);
                if flipped {
                    self.direction = -self.direction;
                    self.re_anchor(folded, now);
                    trace!("clock: ping-pong fold at {}", folded);
                }
                folded
            }
        };

        self.quantize(resolved)
    }

    /// Elapsed seconds since the anchor, from the audio counter when it is
    /// the master, otherwise from the steady clock
    fn elapsed_seconds(&self, now: Instant) -> f64 {
        if self.audio_slaved() {
            if let Some(audio) = &self.audio {
                let played = audio.samples().saturating_sub(self.anchor_audio);
                if audio.sample_rate() > 0 {
                    return played as f64 / audio.sample_rate() as f64;
                }
            }
        }
        now.duration_since(self.anchor_wall).as_secs_f64()
    }

    fn audio_slaved(&self) -> bool {
        self.audio_master
            && !self.audio_muted
            && self.audio.is_some()
            && self.playback == Playback::Forward
    }

    fn re_anchor(&mut self, t: RationalTime, now: Instant) {
        self.anchor_timeline = t;
        self.anchor_wall = now;
        if let Some(audio) = &self.audio {
            self.anchor_audio = audio.samples();
        }
    }

    /// Round onto the frame lattice; a result pushed past the last frame
    /// resolves by travel direction (forward takes the wrap target, reverse
    /// stays one frame inside)
    fn quantize(&self, t: RationalTime) -> RationalTime {
        let q = t.rescaled_to(self.rate).round();
        let last = self.range.end_time_inclusive().rescaled_to(self.rate).round();
        if q > last {
            if self.direction() >= 0.0 {
                match self.loop_mode {
                    LoopMode::Loop => self.range.start.rescaled_to(self.rate).round(),
                    LoopMode::Once | LoopMode::PingPong => last,
                }
            } else {
                last
            }
        } else {
            q
        }
    }
}
