//! Rational time values and ranges
//!
//! **Why**: Every subsystem (timeline, cache keys, clock, I/O requests)
//! addresses media by `(value, rate)` pairs instead of float seconds, so a
//! frame at 24 fps stays exactly representable and cache keys stay stable.
//!
//! **Used by**: timeline model, playback clock, pipeline, I/O readers
//!
//! # Conventions
//!
//! - Comparison and arithmetic work in seconds; mixed-rate operands are fine.
//! - `RationalTime::invalid()` is the sentinel for "no time"; it compares
//!   unequal to everything, including itself (NaN semantics).
//! - Ranges are half-open for `contains`/`intersects`, inclusive for
//!   `end_time_inclusive` (the last addressable frame).

use serde::{Deserialize, Serialize};

/// A time value expressed against a rate (frames per second)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RationalTime {
    pub value: f64,
    pub rate: f64,
}

impl RationalTime {
    pub const fn new(value: f64, rate: f64) -> Self {
        Self { value, rate }
    }

    /// Sentinel for "no time"
    pub const fn invalid() -> Self {
        Self { value: f64::NAN, rate: -1.0 }
    }

    pub fn is_valid(&self) -> bool {
        self.rate > 0.0 && !self.value.is_nan() && !self.rate.is_nan()
    }

    /// Time from seconds at the given rate
    pub fn from_seconds(seconds: f64, rate: f64) -> Self {
        Self { value: seconds * rate, rate }
    }

    pub fn to_seconds(&self) -> f64 {
        self.value / self.rate
    }

    /// Same instant expressed at a different rate
    pub fn rescaled_to(&self, rate: f64) -> Self {
        if self.rate == rate {
            return *self;
        }
        Self { value: self.value * rate / self.rate, rate }
    }

    /// Round to the nearest whole frame at this rate
    pub fn round(&self) -> Self {
        Self { value: self.value.round(), rate: self.rate }
    }

    pub fn floor(&self) -> Self {
        Self { value: self.value.floor(), rate: self.rate }
    }

    pub fn ceil(&self) -> Self {
        Self { value: self.value.ceil(), rate: self.rate }
    }

    /// Duration of one frame at this rate
    pub fn tick(rate: f64) -> Self {
        Self { value: 1.0, rate }
    }
}

impl Default for RationalTime {
    fn default() -> Self {
        Self { value: 0.0, rate: 1.0 }
    }
}

impl std::ops::Add for RationalTime {
    type Output = RationalTime;
    fn add(self, rhs: RationalTime) -> RationalTime {
        RationalTime {
            value: self.value + rhs.rescaled_to(self.rate).value,
            rate: self.rate,
        }
    }
}

impl std::ops::Sub for RationalTime {
    type Output = RationalTime;
    fn sub(self, rhs: RationalTime) -> RationalTime {
        RationalTime {
            value: self.value - rhs.rescaled_to(self.rate).value,
            rate: self.rate,
        }
    }
}

impl std::ops::Neg for RationalTime {
    type Output = RationalTime;
    fn neg(self) -> RationalTime {
        RationalTime { value: -self.value, rate: self.rate }
    }
}

impl PartialEq for RationalTime {
    fn eq(&self, other: &Self) -> bool {
        self.to_seconds() == other.to_seconds()
    }
}

impl PartialOrd for RationalTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.to_seconds().partial_cmp(&other.to_seconds())
    }
}

impl std::fmt::Display for RationalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.value, self.rate)
    }
}

/// A span of time: start plus non-negative duration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: RationalTime,
    pub duration: RationalTime,
}

impl TimeRange {
    pub const fn new(start: RationalTime, duration: RationalTime) -> Self {
        Self { start, duration }
    }

    /// Range covering `[start, end)` where `end` is exclusive
    pub fn from_start_end_time(start: RationalTime, end_exclusive: RationalTime) -> Self {
        Self { start, duration: end_exclusive - start }
    }

    pub fn is_valid(&self) -> bool {
        self.start.is_valid() && self.duration.is_valid() && self.duration.value >= 0.0
    }

    /// One past the last frame
    pub fn end_time_exclusive(&self) -> RationalTime {
        self.start + self.duration
    }

    /// The last addressable frame (one tick inside the exclusive end)
    pub fn end_time_inclusive(&self) -> RationalTime {
        self.end_time_exclusive() - RationalTime::tick(self.duration.rate)
    }

    /// Half-open membership test
    pub fn contains(&self, t: RationalTime) -> bool {
        self.start <= t && t < self.end_time_exclusive()
    }

    /// Half-open overlap test
    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.start < other.end_time_exclusive() && other.start < self.end_time_exclusive()
    }

    /// Overlapping part of two ranges, `None` when they do not touch
    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        if !self.intersects(other) {
            return None;
        }
        let start = if self.start > other.start { self.start } else { other.start };
        let end = {
            let a = self.end_time_exclusive();
            let b = other.end_time_exclusive();
            if a < b { a } else { b }
        };
        Some(TimeRange::from_start_end_time(start, end))
    }

    /// Clamp a time into `[start, end_time_inclusive]`
    pub fn clamped(&self, t: RationalTime) -> RationalTime {
        if t < self.start {
            self.start
        } else if t > self.end_time_inclusive() {
            self.end_time_inclusive()
        } else {
            t
        }
    }

    /// Wrap a time into the range, modulo its duration
    ///
    /// Negative-safe: a time one tick before `start` wraps to the last frame.
    /// Zero-duration ranges pin to `start`.
    pub fn wrapped(&self, t: RationalTime) -> RationalTime {
        let d = self.duration.rescaled_to(self.start.rate).value;
        if d <= 0.0 {
            return self.start;
        }
        let off = t.rescaled_to(self.start.rate).value - self.start.value;
        let m = ((off % d) + d) % d;
        RationalTime::new(self.start.value + m, self.start.rate)
    }

    /// Reflect a time into the range, ping-pong style.
    ///
    /// Reflection happens at the last addressable frame, not the exclusive
    /// end: a 10-frame range bounces 8, 9, 8, never visiting 10. Returns
    /// the folded time and `true` when the fold landed on a reversed leg
    /// (odd number of reflections), which callers use to flip direction.
    pub fn folded(&self, t: RationalTime) -> (RationalTime, bool) {
        let span =
            self.end_time_inclusive().rescaled_to(self.start.rate).value - self.start.value;
        if span <= 0.0 {
            return (self.start, false);
        }
        let off = t.rescaled_to(self.start.rate).value - self.start.value;
        let period = 2.0 * span;
        let m = ((off % period) + period) % period;
        if m <= span {
            (RationalTime::new(self.start.value + m, self.start.rate), false)
        } else {
            (RationalTime::new(self.start.value + period - m, self.start.rate), true)
        }
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} +{}]", self.start, self.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt(value: f64, rate: f64) -> RationalTime {
        RationalTime::new(value, rate)
    }

    #[test]
    fn test_rescale() {
        let t = rt(24.0, 24.0);
        let r = t.rescaled_to(48.0);
        assert_eq!(r.value, 48.0);
        assert_eq!(r.rate, 48.0);
        assert_eq!(t, r);
    }

    #[test]
    fn test_mixed_rate_arithmetic() {
        let a = rt(24.0, 24.0);
        let b = rt(30.0, 30.0); // also 1 second
        let sum = a + b;
        assert_eq!(sum.rate, 24.0);
        assert_eq!(sum.value, 48.0);
        assert_eq!((a - b).value, 0.0);
    }

    #[test]
    fn test_ordering_across_rates() {
        assert!(rt(23.0, 24.0) < rt(30.0, 30.0));
        assert!(rt(25.0, 24.0) > rt(30.0, 30.0));
        assert_eq!(rt(12.0, 24.0), rt(15.0, 30.0));
    }

    #[test]
    fn test_invalid_sentinel() {
        let inv = RationalTime::invalid();
        assert!(!inv.is_valid());
        assert!(inv != inv);
        assert!(rt(0.0, 24.0).is_valid());
    }

    #[test]
    fn test_range_membership() {
        let r = TimeRange::new(rt(10.0, 24.0), rt(5.0, 24.0));
        assert!(r.contains(rt(10.0, 24.0)));
        assert!(r.contains(rt(14.0, 24.0)));
        assert!(!r.contains(rt(15.0, 24.0))); // exclusive end
        assert_eq!(r.end_time_inclusive().value, 14.0);
    }

    #[test]
    fn test_intersection() {
        let a = TimeRange::new(rt(0.0, 24.0), rt(10.0, 24.0));
        let b = TimeRange::new(rt(6.0, 24.0), rt(10.0, 24.0));
        let i = a.intersection(&b).unwrap();
        assert_eq!(i.start.value, 6.0);
        assert_eq!(i.duration.value, 4.0);

        let c = TimeRange::new(rt(10.0, 24.0), rt(1.0, 24.0));
        assert!(a.intersection(&c).is_none());
    }

    #[test]
    fn test_clamp() {
        let r = TimeRange::new(rt(0.0, 24.0), rt(10.0, 24.0));
        assert_eq!(r.clamped(rt(-3.0, 24.0)).value, 0.0);
        assert_eq!(r.clamped(rt(12.0, 24.0)).value, 9.0);
        assert_eq!(r.clamped(rt(4.0, 24.0)).value, 4.0);
    }

    #[test]
    fn test_wrap_negative_safe() {
        let r = TimeRange::new(rt(0.0, 24.0), rt(10.0, 24.0));
        assert_eq!(r.wrapped(rt(12.0, 24.0)).value, 2.0);
        assert_eq!(r.wrapped(rt(-1.0, 24.0)).value, 9.0);
        assert_eq!(r.wrapped(rt(9.0, 24.0)).value, 9.0);
        // offset start
        let r2 = TimeRange::new(rt(5.0, 24.0), rt(10.0, 24.0));
        assert_eq!(r2.wrapped(rt(17.0, 24.0)).value, 7.0);
    }

    #[test]
    fn test_fold_reflects_and_flips() {
        let r = TimeRange::new(rt(0.0, 24.0), rt(10.0, 24.0));
        // 8 + 6 overruns: 8, 9 then back down to 4 on the reversed leg
        let (t, rev) = r.folded(rt(14.0, 24.0));
        assert_eq!(t.value, 4.0);
        assert!(rev);
        // a full period (18 = 2 * 9) cancels out; 24 lands forward at 6
        let (t2, rev2) = r.folded(rt(24.0, 24.0));
        assert_eq!(t2.value, 6.0);
        assert!(!rev2);
        // under-run reflects off the start
        let (t3, rev3) = r.folded(rt(-3.0, 24.0));
        assert_eq!(t3.value, 3.0);
        assert!(rev3);
        // the apex itself is still the forward leg
        let (t4, rev4) = r.folded(rt(9.0, 24.0));
        assert_eq!(t4.value, 9.0);
        assert!(!rev4);
    }
}
