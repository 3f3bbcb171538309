//! Byte-budgeted frame cache with LRU eviction and window pinning
//!
//! **Why**: decoded frames are large and decoding is the latency
//! bottleneck. A bounded shared store lets the read-ahead pipeline absorb
//! disk and decoder jitter without unbounded memory growth, while pinning
//! protects the frames inside the current read-ahead window from eviction.
//!
//! **Used by**: Player (frame fetch on tick), Pipeline (storing decode
//! results, pinning the window)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use log::{debug, info, warn};
use lru::LruCache;
use sysinfo::System;

use crate::io::{AudioData, VideoData};
use crate::time::RationalTime;

/// Identity of one cached frame or audio block.
///
/// Time is held as an integer frame index at a millihertz rate so the key
/// is exact under `Eq`/`Hash`; [`RationalTime`] itself carries `f64`s.
/// Callers pass frame-aligned times (the pipeline discretizes the window
/// before building keys), so rounding only collapses float noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Source identity from [`crate::io::source_fingerprint`]
    pub fingerprint: u64,
    /// Frame index at `rate_mhz`
    pub frame: i64,
    /// Sampling rate in millihertz
    pub rate_mhz: u64,
}

impl CacheKey {
    pub fn new(fingerprint: u64, time: RationalTime) -> Self {
        Self {
            fingerprint,
            frame: time.value.round() as i64,
            rate_mhz: (time.rate * 1000.0).round() as u64,
        }
    }

    /// The time this key stands for
    pub fn time(&self) -> RationalTime {
        RationalTime::new(self.frame as f64, self.rate_mhz as f64 / 1000.0)
    }
}

/// Cached payload, one decoded video frame or one audio block
#[derive(Debug, Clone)]
pub enum CacheValue {
    Video(VideoData),
    Audio(AudioData),
}

impl CacheValue {
    pub fn byte_count(&self) -> usize {
        match self {
            CacheValue::Video(v) => v.byte_count(),
            CacheValue::Audio(a) => a.byte_count(),
        }
    }

    pub fn as_video(&self) -> Option<&VideoData> {
        match self {
            CacheValue::Video(v) => Some(v),
            CacheValue::Audio(_) => None,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioData> {
        match self {
            CacheValue::Audio(a) => Some(a),
            CacheValue::Video(_) => None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: CacheValue,
    byte_count: usize,
    pinned: bool,
}

#[derive(Debug)]
struct Inner {
    /// MRU-ordered map; eviction walks from the LRU end
    entries: LruCache<CacheKey, Entry>,
    bytes: usize,
    hits: u64,
    misses: u64,
    /// Latch so the all-pinned overshoot warns once per episode
    over_budget: bool,
}

/// Cache usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub bytes: usize,
    pub count: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Lifetime fraction of `get` calls that hit, 0.0 before any lookup
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shared frame store with LRU eviction, byte and count budgets, and
/// pinning for the read-ahead window.
///
/// All operations take a single internal mutex; `get`/`put` are O(1)
/// amortized, eviction walks the LRU tail skipping pinned entries. When
/// every entry is pinned the new entry is still inserted (temporary
/// overshoot) and the pipeline is expected to unpin before filling
/// further.
#[derive(Debug)]
pub struct FrameCache {
    inner: Mutex<Inner>,
    /// Byte budget, atomic for lock-free updates from settings
    max_bytes: AtomicUsize,
    /// Entry-count budget, `usize::MAX` when unbounded
    max_count: AtomicUsize,
}

impl FrameCache {
    /// Create a cache with the given byte budget and no count bound
    pub fn new(max_bytes: usize) -> Self {
        debug!("FrameCache created: budget={} MB", max_bytes / 1024 / 1024);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
                hits: 0,
                misses: 0,
                over_budget: false,
            }),
            max_bytes: AtomicUsize::new(max_bytes),
            max_count: AtomicUsize::new(usize::MAX),
        }
    }

    /// Create a cache sized from the machine's available memory
    ///
    /// # Arguments
    ///
    /// * `mem_fraction` - fraction of usable memory (e.g. 0.5 = 50%)
    /// * `reserve_gb` - memory left to the system (e.g. 2.0 = 2 GB)
    pub fn with_system_budget(mem_fraction: f64, reserve_gb: f64) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available = sys.available_memory() as usize;
        let reserve = (reserve_gb * 1024.0 * 1024.0 * 1024.0) as usize;
        let usable = available.saturating_sub(reserve);
        let max_bytes = (usable as f64 * mem_fraction) as usize;

        info!(
            "FrameCache init: available={} MB, reserve={} MB, budget={} MB ({}%)",
            available / 1024 / 1024,
            reserve / 1024 / 1024,
            max_bytes / 1024 / 1024,
            (mem_fraction * 100.0) as u32
        );

        Self::new(max_bytes)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes.load(Ordering::Relaxed)
    }

    pub fn set_max_bytes(&self, max_bytes: usize) {
        self.max_bytes.store(max_bytes, Ordering::Relaxed);
        let freed = self.evict();
        debug!(
            "Cache budget updated: {} MB (freed {} MB)",
            max_bytes / 1024 / 1024,
            freed / 1024 / 1024
        );
    }

    pub fn max_count(&self) -> usize {
        self.max_count.load(Ordering::Relaxed)
    }

    pub fn set_max_count(&self, max_count: usize) {
        self.max_count.store(max_count, Ordering::Relaxed);
        self.evict();
    }

    /// Fetch a value, promoting the entry to most-recently-used
    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.entries.get(key) {
            Some(entry) => {
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Check presence without touching LRU order or hit/miss counters
    pub fn contains(&self, key: &CacheKey) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.peek(key).is_some()
    }

    /// Insert a value at the MRU position, then evict down to budget.
    ///
    /// Replacing an existing key keeps its pinned state. Returns `false`
    /// when the cache remains over budget afterwards because every
    /// remaining entry is pinned; the entry is inserted regardless and the
    /// caller should back off until the window is unpinned.
    pub fn put(&self, key: CacheKey, value: CacheValue, byte_count: usize) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let pinned = inner.entries.peek(&key).map(|e| e.pinned).unwrap_or(false);
        if let Some(old) = inner.entries.put(key, Entry { value, byte_count, pinned }) {
            inner.bytes = inner.bytes.saturating_sub(old.byte_count);
        }
        inner.bytes += byte_count;

        self.evict_locked(&mut inner);
        self.check_overshoot(&mut inner)
    }

    /// Remove one entry regardless of pinning
    pub fn remove(&self, key: &CacheKey) -> Option<CacheValue> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.entries.pop(key)?;
        inner.bytes = inner.bytes.saturating_sub(entry.byte_count);
        Some(entry.value)
    }

    /// Protect a set of keys from eviction, in one critical section.
    ///
    /// Keys not present are ignored; they become pinnable once decoded.
    pub fn pin(&self, keys: &[CacheKey]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            if let Some(entry) = inner.entries.peek_mut(key) {
                entry.pinned = true;
            }
        }
    }

    /// Release every pin
    pub fn unpin_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in inner.entries.iter_mut() {
            entry.pinned = false;
        }
    }

    /// Drop unpinned entries from the LRU end until both budgets hold.
    /// Returns the bytes freed.
    pub fn evict(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let freed = self.evict_locked(&mut inner);
        self.check_overshoot(&mut inner);
        freed
    }

    /// Drop all entries, pinned included
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let count = inner.entries.len();
        inner.entries.clear();
        inner.bytes = 0;
        inner.over_budget = false;
        debug!("Cache cleared: {} entries dropped", count);
    }

    /// All keys, MRU first
    pub fn keys(&self) -> Vec<CacheKey> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.iter().map(|(k, _)| *k).collect()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            bytes: inner.bytes,
            count: inner.entries.len(),
            pinned: inner.entries.iter().filter(|(_, e)| e.pinned).count(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    /// One pass from the LRU end collecting unpinned victims until the
    /// byte and count budgets are both satisfied, then pop them.
    fn evict_locked(&self, inner: &mut Inner) -> usize {
        let max_bytes = self.max_bytes.load(Ordering::Relaxed);
        let max_count = self.max_count.load(Ordering::Relaxed);

        let mut freed = 0usize;
        let mut victims: Vec<CacheKey> = Vec::new();
        for (key, entry) in inner.entries.iter().rev() {
            let bytes_ok = inner.bytes - freed <= max_bytes;
            let count_ok = inner.entries.len() - victims.len() <= max_count;
            if bytes_ok && count_ok {
                break;
            }
            if !entry.pinned {
                victims.push(*key);
                freed += entry.byte_count;
            }
        }

        for key in &victims {
            if let Some(entry) = inner.entries.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(entry.byte_count);
            }
        }
        if !victims.is_empty() {
            debug!(
                "LRU evicted {} frames: freed {} MB (usage: {} MB / {} MB)",
                victims.len(),
                freed / 1024 / 1024,
                inner.bytes / 1024 / 1024,
                max_bytes / 1024 / 1024
            );
        }
        freed
    }

    /// Warn once when the budget is exceeded with nothing evictable.
    /// Returns `true` while within budget.
    fn check_overshoot(&self, inner: &mut Inner) -> bool {
        let max_bytes = self.max_bytes.load(Ordering::Relaxed);
        let max_count = self.max_count.load(Ordering::Relaxed);
        let over = inner.bytes > max_bytes || inner.entries.len() > max_count;
        if over && !inner.over_budget {
            warn!(
                "Cache over budget with all entries pinned: {} MB / {} MB, {} entries",
                inner.bytes / 1024 / 1024,
                max_bytes / 1024 / 1024,
                inner.entries.len()
            );
        }
        inner.over_budget = over;
        !over
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Image, ImageInfo, PixelType};
    use std::sync::Arc;

    fn frame(width: usize) -> CacheValue {
        let image = Image::black(ImageInfo::new(width, 1, PixelType::RgbaU8));
        CacheValue::Video(VideoData::new(RationalTime::new(0.0, 24.0), Arc::new(image)))
    }

    fn key(frame: i64) -> CacheKey {
        CacheKey::new(7, RationalTime::new(frame as f64, 24.0))
    }

    #[test]
    fn test_key_quantizes_float_noise() {
        let a = CacheKey::new(1, RationalTime::new(23.000000001, 24.0));
        let b = CacheKey::new(1, RationalTime::new(23.0, 24.0));
        assert_eq!(a, b);
        assert_eq!(a.time().value, 23.0);

        // audio keys at 1 Hz never collide with video keys
        let audio = CacheKey::new(1, RationalTime::new(23.0, 1.0));
        assert_ne!(a, audio);
    }

    #[test]
    fn test_get_put_and_stats() {
        let cache = FrameCache::new(1 << 20);
        let value = frame(4);
        let bytes = value.byte_count();
        assert!(cache.put(key(0), value, bytes));

        assert!(cache.get(&key(0)).is_some());
        assert!(cache.get(&key(1)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.bytes, 16);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_lru_eviction_order() {
        // each frame is 16 bytes; budget fits two
        let cache = FrameCache::new(32);
        for i in 0..2 {
            cache.put(key(i), frame(4), 16);
        }
        // touch frame 0 so frame 1 becomes the LRU victim
        assert!(cache.get(&key(0)).is_some());
        cache.put(key(2), frame(4), 16);

        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
    }

    #[test]
    fn test_pinned_entries_survive_eviction() {
        let cache = FrameCache::new(32);
        cache.put(key(0), frame(4), 16);
        cache.put(key(1), frame(4), 16);
        cache.pin(&[key(0)]);

        cache.put(key(2), frame(4), 16);

        // frame 0 is the LRU end but pinned, frame 1 goes instead
        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
    }

    #[test]
    fn test_all_pinned_overshoots_then_recovers() {
        let cache = FrameCache::new(32);
        cache.put(key(0), frame(4), 16);
        cache.put(key(1), frame(4), 16);
        cache.pin(&[key(0), key(1)]);

        // nothing evictable: inserted anyway, reported over budget
        assert!(!cache.put(key(2), frame(4), 16));
        assert!(cache.contains(&key(2)));
        assert_eq!(cache.stats().bytes, 48);

        cache.unpin_all();
        let freed = cache.evict();
        assert_eq!(freed, 16);
        assert_eq!(cache.stats().bytes, 32);
    }

    #[test]
    fn test_zero_budget_keeps_only_pinned() {
        let cache = FrameCache::new(64);
        cache.put(key(0), frame(4), 16);
        cache.pin(&[key(0)]);
        cache.put(key(1), frame(4), 16);

        cache.set_max_bytes(0);

        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));

        // fresh unpinned inserts are evicted straight away
        cache.put(key(2), frame(4), 16);
        assert!(!cache.contains(&key(2)));
        assert_eq!(cache.stats().count, 1);
    }

    #[test]
    fn test_clear_drops_pinned() {
        let cache = FrameCache::new(64);
        cache.put(key(0), frame(4), 16);
        cache.pin(&[key(0)]);
        cache.clear();

        assert!(!cache.contains(&key(0)));
        assert_eq!(cache.stats().bytes, 0);
        assert_eq!(cache.stats().count, 0);
    }

    #[test]
    fn test_count_budget() {
        let cache = FrameCache::new(1 << 20);
        cache.set_max_count(2);
        for i in 0..3 {
            cache.put(key(i), frame(4), 16);
        }
        assert_eq!(cache.stats().count, 2);
        assert!(!cache.contains(&key(0)));
    }

    #[test]
    fn test_replace_keeps_pin_and_bytes() {
        let cache = FrameCache::new(1 << 20);
        cache.put(key(0), frame(4), 16);
        cache.pin(&[key(0)]);
        cache.put(key(0), frame(8), 32);

        let stats = cache.stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.bytes, 32);
        assert_eq!(stats.pinned, 1);
    }
}
