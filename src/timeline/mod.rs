//! Timeline model
//!
//! **Why**: The playback schedule. Tracks hold contiguous clips and gaps
//! (plus zero-duration transitions between them); queries translate a
//! timeline time into "which media, which source time, which transition
//! blend" without the caller walking the tree.
//!
//! **Used by**: read-ahead pipeline (clip enumeration), player (current
//! item resolution), hosts (flattened views)
//!
//! # Invariants
//!
//! - Items within a track are contiguous and non-overlapping; track
//!   duration is the sum of item durations (transitions take no time).
//! - The tree is immutable after load; every query is `&self`.
//! - Timeline duration equals the longest track.

pub mod parse;

use log::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::path::Path;
use crate::time::{RationalTime, TimeRange};

/// Track flavor; one kind per track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// Reference from a clip to its media on disk
#[derive(Debug, Clone, PartialEq)]
pub struct MediaReference {
    /// Path or sequence pattern (`render.0001.exr` style)
    pub target: String,
    /// Media's own declared range, when the file that produced the timeline
    /// carried one
    pub available_range: Option<TimeRange>,
}

impl MediaReference {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into(), available_range: None }
    }

    /// Decomposed form of `target`
    pub fn path(&self) -> Path {
        Path::parse(&self.target)
    }
}

/// A portion of a media source placed on a track
#[derive(Debug, Clone)]
pub struct Clip {
    pub id: Uuid,
    pub name: String,
    pub media: MediaReference,
    /// Which part of the source plays, in source time
    pub source_range: TimeRange,
}

impl Clip {
    pub fn new(name: impl Into<String>, media: MediaReference, source_range: TimeRange) -> Self {
        Self { id: Uuid::new_v4(), name: name.into(), media, source_range }
    }

    /// Source rate (the clip's native rate)
    pub fn rate(&self) -> f64 {
        self.source_range.start.rate
    }

    /// Translate a track-local offset into source time
    pub fn source_time(&self, track_start: RationalTime, t: RationalTime) -> RationalTime {
        self.source_range.start + (t - track_start).rescaled_to(self.rate())
    }
}

/// Empty track time
#[derive(Debug, Clone)]
pub struct Gap {
    pub id: Uuid,
    pub duration: RationalTime,
}

impl Gap {
    pub fn new(duration: RationalTime) -> Self {
        Self { id: Uuid::new_v4(), duration }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Dissolve,
    Wipe,
}

/// Zero-duration marker between two items; its window overlaps both
#[derive(Debug, Clone)]
pub struct Transition {
    pub id: Uuid,
    pub kind: TransitionKind,
    /// Reach back into the outgoing item
    pub in_offset: RationalTime,
    /// Reach forward into the incoming item
    pub out_offset: RationalTime,
}

impl Transition {
    pub fn new(kind: TransitionKind, in_offset: RationalTime, out_offset: RationalTime) -> Self {
        Self { id: Uuid::new_v4(), kind, in_offset, out_offset }
    }
}

#[derive(Debug, Clone)]
pub enum Item {
    Clip(Clip),
    Gap(Gap),
    Transition(Transition),
}

impl Item {
    /// Track time the item occupies; transitions take none
    pub fn duration(&self) -> RationalTime {
        match self {
            Item::Clip(c) => c.source_range.duration,
            Item::Gap(g) => g.duration,
            Item::Transition(t) => RationalTime::new(0.0, t.in_offset.rate),
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Item::Clip(c) => c.id,
            Item::Gap(g) => g.id,
            Item::Transition(t) => t.id,
        }
    }
}

/// Result of `Track::items_at`
#[derive(Debug, Clone)]
pub struct ItemsAt<'a> {
    /// The clip or gap covering the queried time, with its track range
    pub item: Option<(&'a Item, TimeRange)>,
    /// Transition whose window covers the time, with that window
    pub transition: Option<(&'a Transition, TimeRange)>,
}

/// Ordered items of one kind
#[derive(Debug, Clone)]
pub struct Track {
    pub id: Uuid,
    pub name: String,
    pub kind: TrackKind,
    pub items: Vec<Item>,
}

impl Track {
    pub fn new(name: impl Into<String>, kind: TrackKind) -> Self {
        Self { id: Uuid::new_v4(), name: name.into(), kind, items: Vec::new() }
    }

    /// Sum of item durations at `rate`
    pub fn duration(&self, rate: f64) -> RationalTime {
        let mut total = RationalTime::new(0.0, rate);
        for item in &self.items {
            total = total + item.duration();
        }
        total
    }

    /// Track-time span of the item at `index` (transitions report the
    /// zero-width cut point); `None` past the last item
    pub fn item_range(&self, index: usize, rate: f64) -> Option<TimeRange> {
        let duration = self.items.get(index)?.duration().rescaled_to(rate);
        let mut start = RationalTime::new(0.0, rate);
        for item in self.items.iter().take(index) {
            start = start + item.duration();
        }
        Some(TimeRange::new(start, duration))
    }

    /// Primary resolution query: the covering clip/gap plus any transition
    /// window containing `t`
    pub fn items_at(&self, t: RationalTime, rate: f64) -> ItemsAt<'_> {
        let mut cursor = RationalTime::new(0.0, rate);
        let mut found: Option<(&Item, TimeRange)> = None;

        for item in &self.items {
            match item {
                Item::Transition(_) => continue,
                _ => {
                    let range = TimeRange::new(cursor, item.duration().rescaled_to(rate));
                    if range.contains(t) && found.is_none() {
                        found = Some((item, range));
                    }
                    cursor = range.end_time_exclusive();
                }
            }
        }

        // transitions sit at the cut between their neighbors
        let mut transition = None;
        let mut cut = RationalTime::new(0.0, rate);
        for item in &self.items {
            match item {
                Item::Transition(tr) => {
                    let window = TimeRange::from_start_end_time(
                        cut - tr.in_offset.rescaled_to(rate),
                        cut + tr.out_offset.rescaled_to(rate),
                    );
                    if window.contains(t) {
                        transition = Some((tr, window));
                    }
                }
                _ => cut = cut + item.duration().rescaled_to(rate),
            }
        }

        ItemsAt { item: found, transition }
    }

    /// Clips whose track span intersects `range`, with those spans
    pub fn clips_intersecting(&self, range: &TimeRange, rate: f64) -> Vec<(&Clip, TimeRange)> {
        let mut out = Vec::new();
        let mut cursor = RationalTime::new(0.0, rate);
        for item in &self.items {
            if let Item::Transition(_) = item {
                continue;
            }
            let span = TimeRange::new(cursor, item.duration().rescaled_to(rate));
            if let Item::Clip(c) = item {
                if span.intersects(range) {
                    out.push((c, span));
                }
            }
            cursor = span.end_time_exclusive();
        }
        out
    }

    /// Items neighboring a transition: (outgoing, incoming) clip and their
    /// track spans, when both sides are clips
    fn transition_neighbors(
        &self,
        transition_id: Uuid,
        rate: f64,
    ) -> Option<((&Clip, TimeRange), (&Clip, TimeRange))> {
        let idx = self
            .items
            .iter()
            .position(|i| matches!(i, Item::Transition(t) if t.id == transition_id))?;
        let before = self.items[..idx].iter().rev().find_map(|i| match i {
            Item::Clip(c) => Some(c),
            _ => None,
        })?;
        let after = self.items[idx + 1..].iter().find_map(|i| match i {
            Item::Clip(c) => Some(c),
            _ => None,
        })?;
        let before_idx = self.items.iter().position(|i| i.id() == before.id)?;
        let after_idx = self.items.iter().position(|i| i.id() == after.id)?;
        Some((
            (before, self.item_range(before_idx, rate)?),
            (after, self.item_range(after_idx, rate)?),
        ))
    }
}

/// One video layer resolved at a time: what to decode and how to blend
#[derive(Debug, Clone)]
pub struct LayerRequest {
    pub clip_id: Uuid,
    pub target: String,
    pub source_time: RationalTime,
    /// Companion clip for the B side of a transition
    pub b: Option<(Uuid, String, RationalTime)>,
    pub transition: Option<TransitionKind>,
    /// Progress through the transition window, 0..1
    pub transition_value: f64,
}

/// The timeline: global rate plus a stack of tracks
#[derive(Debug, Clone)]
pub struct Timeline {
    pub id: Uuid,
    pub name: String,
    pub global_rate: f64,
    pub global_start: RationalTime,
    pub tracks: Vec<Track>,
}

impl Timeline {
    pub fn new(name: impl Into<String>, global_rate: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            global_rate,
            global_start: RationalTime::new(0.0, global_rate),
            tracks: Vec::new(),
        }
    }

    /// Load from an editorial interchange JSON document
    pub fn from_file(path: &str) -> Result<Self> {
        parse::from_file(path)
    }

    /// One-clip timeline around a single media path, probed through the
    /// context's plugin registry. Video and audio streams each get a
    /// track; drag-drop convenience for hosts.
    pub fn from_single_media(target: &str, ctx: &crate::context::Context) -> Result<Self> {
        use crate::io::{OPEN_TIMEOUT, Options};

        let path = Path::parse(target);
        let mut reader = ctx.registry().read(&path, &Options::new())?;
        let info = reader.info().wait_timeout(OPEN_TIMEOUT)?;

        let name = if path.base().is_empty() {
            target.to_string()
        } else {
            path.base().trim_end_matches('.').to_string()
        };
        let rate = info
            .video_range
            .map(|r| r.duration.rate)
            .or_else(|| info.audio_range.map(|r| r.duration.rate))
            .unwrap_or(crate::io::sequence::DEFAULT_SEQUENCE_RATE);
        let mut timeline = Timeline::new(name.clone(), rate);

        if let Some(range) = info.video_range.filter(|_| info.video.is_some()) {
            let mut media = MediaReference::new(target);
            media.available_range = Some(range);
            let mut track = Track::new("V1", TrackKind::Video);
            track.items.push(Item::Clip(Clip::new(name.clone(), media, range)));
            timeline.tracks.push(track);
        }
        if let Some(range) = info.audio_range.filter(|_| info.audio.is_some()) {
            let mut media = MediaReference::new(target);
            media.available_range = Some(range);
            let mut track = Track::new("A1", TrackKind::Audio);
            track.items.push(Item::Clip(Clip::new(name, media, range)));
            timeline.tracks.push(track);
        }
        if timeline.tracks.is_empty() {
            return Err(Error::OpenFailed(format!(
                "'{}' reports neither video nor audio",
                target
            )));
        }
        Ok(timeline)
    }

    /// Longest track duration
    pub fn duration(&self) -> RationalTime {
        let mut best = RationalTime::new(0.0, self.global_rate);
        for track in &self.tracks {
            let d = track.duration(self.global_rate);
            if d > best {
                best = d;
            }
        }
        best
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.global_start, self.duration())
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Video)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Audio)
    }

    /// `items_at` on a track by index
    pub fn items_at(&self, track: usize, t: RationalTime) -> Option<ItemsAt<'_>> {
        self.tracks
            .get(track)
            .map(|tr| tr.items_at(t, self.global_rate))
    }

    /// Clip → (media target, source time) at a timeline time
    ///
    /// The clip must belong to this timeline; the translation uses the
    /// clip's track span and `source_range`.
    pub fn media_reference_at(&self, clip_id: Uuid, t: RationalTime) -> Option<(String, RationalTime)> {
        for track in &self.tracks {
            let mut cursor = RationalTime::new(0.0, self.global_rate);
            for item in &track.items {
                if let Item::Transition(_) = item {
                    continue;
                }
                let span = TimeRange::new(cursor, item.duration().rescaled_to(self.global_rate));
                if let Item::Clip(c) = item {
                    if c.id == clip_id {
                        return Some((c.media.target.clone(), c.source_time(span.start, t)));
                    }
                }
                cursor = span.end_time_exclusive();
            }
        }
        None
    }

    /// Per-video-track layer descriptions at a time, bottom track first
    ///
    /// Gaps and empty tracks contribute nothing. Inside a transition window
    /// the layer carries both sides sampled at the same timeline time; the
    /// incoming side may extrapolate before its own start (media handles).
    pub fn video_layers_at(&self, t: RationalTime) -> Vec<LayerRequest> {
        let rate = self.global_rate;
        let mut layers = Vec::new();

        for track in self.video_tracks() {
            let at = track.items_at(t, rate);
            let Some((item, span)) = at.item else { continue };
            let Item::Clip(clip) = item else { continue };

            let mut layer = LayerRequest {
                clip_id: clip.id,
                target: clip.media.target.clone(),
                source_time: clip.source_time(span.start, t),
                b: None,
                transition: None,
                transition_value: 0.0,
            };

            if let Some((tr, window)) = at.transition {
                if let Some(((a, a_span), (b, b_span))) = track.transition_neighbors(tr.id, rate) {
                    // A is the outgoing clip for the whole window, B the
                    // incoming, both sampled at the same timeline time
                    layer.clip_id = a.id;
                    layer.target = a.media.target.clone();
                    layer.source_time = a.source_time(a_span.start, t);
                    layer.b = Some((b.id, b.media.target.clone(), b.source_time(b_span.start, t)));
                    layer.transition = Some(tr.kind);
                    let dur = window.duration.to_seconds();
                    layer.transition_value = if dur > 0.0 {
                        ((t - window.start).to_seconds() / dur).clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                }
            }

            layers.push(layer);
        }
        layers
    }

    /// Collapse video tracks into one: later tracks occlude earlier ones
    /// unless their clip has no media target. Transitions are dropped from
    /// the flattened view (blend windows stay a per-track query).
    pub fn flatten(&self) -> Track {
        // boundaries closer than this many frames collapse into one cut
        const CUT_EPS: f64 = 1e-6;

        let rate = self.global_rate;
        let total = self.duration();
        let mut flat = Track::new("flattened", TrackKind::Video);
        if total.value <= 0.0 {
            return flat;
        }

        // cut points: every item boundary across every video track, kept
        // rational so non-frame-integral items cut where `items_at` cuts
        let mut cuts: Vec<f64> = vec![0.0, total.value];
        for track in self.video_tracks() {
            let mut cursor = RationalTime::new(0.0, rate);
            for item in &track.items {
                if let Item::Transition(_) = item {
                    continue;
                }
                cursor = cursor + item.duration().rescaled_to(rate);
                cuts.push(cursor.value);
            }
        }
        cuts.sort_unstable_by(f64::total_cmp);
        cuts.dedup_by(|a, b| (*a - *b).abs() < CUT_EPS);

        // per span, topmost media-bearing clip wins; sampled at the span
        // midpoint so a boundary the dedup collapsed cannot flip the winner
        let video: Vec<&Track> = self.video_tracks().collect();
        let mut last_clip: Option<Uuid> = None;
        for pair in cuts.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if b - a < CUT_EPS {
                continue;
            }
            let span = TimeRange::new(RationalTime::new(a, rate), RationalTime::new(b - a, rate));
            let mid = RationalTime::new(a + (b - a) * 0.5, rate);

            let mut winner: Option<(&Clip, TimeRange)> = None;
            for track in video.iter().rev() {
                let at = track.items_at(mid, rate);
                if let Some((Item::Clip(c), item_span)) = at.item {
                    if !c.media.target.is_empty() {
                        winner = Some((c, item_span));
                        break;
                    }
                }
            }

            match winner {
                Some((clip, item_span)) => {
                    let extend = last_clip == Some(clip.id);
                    if extend {
                        if let Some(Item::Clip(prev)) = flat.items.last_mut() {
                            prev.source_range.duration =
                                prev.source_range.duration + span.duration.rescaled_to(prev.rate());
                            continue;
                        }
                    }
                    let mut trimmed = clip.clone();
                    trimmed.source_range = TimeRange::new(
                        clip.source_time(item_span.start, span.start),
                        span.duration.rescaled_to(clip.rate()),
                    );
                    flat.items.push(Item::Clip(trimmed));
                    last_clip = Some(clip.id);
                }
                None => {
                    last_clip = None;
                    if let Some(Item::Gap(prev)) = flat.items.last_mut() {
                        prev.duration = prev.duration + span.duration;
                        continue;
                    }
                    flat.items.push(Item::Gap(Gap::new(span.duration)));
                }
            }
        }

        debug!("flatten: {} video tracks -> {} items", video.len(), flat.items.len());
        flat
    }

    /// Structural checks: rates, contiguity typing, clip trims inside
    /// declared media, transition reach
    pub fn validate(&self) -> Result<()> {
        if !(self.global_rate > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "timeline rate must be positive, got {}",
                self.global_rate
            )));
        }
        for track in &self.tracks {
            for (i, item) in track.items.iter().enumerate() {
                match item {
                    Item::Clip(c) => {
                        // an empty media target is allowed: the clip is
                        // transparent and flatten() sees through it
                        if !c.source_range.is_valid() {
                            return Err(Error::InvalidArgument(format!(
                                "clip '{}' has an invalid source range",
                                c.name
                            )));
                        }
                        if let Some(avail) = &c.media.available_range {
                            let trim = c.source_range.duration.to_seconds();
                            if trim > avail.duration.to_seconds() + 1e-9 {
                                return Err(Error::InvalidArgument(format!(
                                    "clip '{}' trims {}s from media providing {}s",
                                    c.name,
                                    trim,
                                    avail.duration.to_seconds()
                                )));
                            }
                        }
                    }
                    Item::Gap(g) => {
                        if !(g.duration.value >= 0.0) {
                            return Err(Error::InvalidArgument(
                                "gap with negative duration".into(),
                            ));
                        }
                    }
                    Item::Transition(tr) => {
                        let prev = track.items[..i].iter().rev().find_map(|it| match it {
                            Item::Transition(_) => None,
                            other => Some(other.duration().to_seconds()),
                        });
                        let next = track.items[i + 1..].iter().find_map(|it| match it {
                            Item::Transition(_) => None,
                            other => Some(other.duration().to_seconds()),
                        });
                        let reach_back = tr.in_offset.to_seconds();
                        let reach_fwd = tr.out_offset.to_seconds();
                        if reach_back < 0.0 || reach_fwd < 0.0 {
                            return Err(Error::InvalidArgument(
                                "transition with negative offset".into(),
                            ));
                        }
                        if prev.map(|d| reach_back > d + 1e-9).unwrap_or(reach_back > 0.0) {
                            return Err(Error::InvalidArgument(
                                "transition reaches past its outgoing item".into(),
                            ));
                        }
                        if next.map(|d| reach_fwd > d + 1e-9).unwrap_or(reach_fwd > 0.0) {
                            return Err(Error::InvalidArgument(
                                "transition reaches past its incoming item".into(),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt(v: f64) -> RationalTime {
        RationalTime::new(v, 24.0)
    }

    fn clip(name: &str, target: &str, start: f64, dur: f64) -> Clip {
        Clip::new(
            name,
            MediaReference::new(target),
            TimeRange::new(rt(start), rt(dur)),
        )
    }

    fn one_track_timeline() -> Timeline {
        let mut tl = Timeline::new("test", 24.0);
        let mut track = Track::new("V1", TrackKind::Video);
        track.items.push(Item::Clip(clip("a", "a.0001.ppm", 0.0, 24.0)));
        track.items.push(Item::Gap(Gap::new(rt(12.0))));
        track.items.push(Item::Clip(clip("b", "b.0001.ppm", 10.0, 24.0)));
        tl.tracks.push(track);
        tl
    }

    #[test]
    fn test_duration_accounting() {
        let tl = one_track_timeline();
        assert_eq!(tl.duration().value, 60.0);
        assert_eq!(tl.time_range().start.value, 0.0);
    }

    #[test]
    fn test_items_at() {
        let tl = one_track_timeline();
        let at = tl.items_at(0, rt(5.0)).unwrap();
        match at.item {
            Some((Item::Clip(c), range)) => {
                assert_eq!(c.name, "a");
                assert_eq!(range.start.value, 0.0);
            }
            _ => panic!("expected clip a"),
        }

        let at = tl.items_at(0, rt(30.0)).unwrap();
        assert!(matches!(at.item, Some((Item::Gap(_), _))));

        let at = tl.items_at(0, rt(40.0)).unwrap();
        match at.item {
            Some((Item::Clip(c), range)) => {
                assert_eq!(c.name, "b");
                assert_eq!(range.start.value, 36.0);
            }
            _ => panic!("expected clip b"),
        }

        // past the end
        let at = tl.items_at(0, rt(60.0)).unwrap();
        assert!(at.item.is_none());
    }

    #[test]
    fn test_media_reference_translation() {
        let tl = one_track_timeline();
        let b_id = match &tl.tracks[0].items[2] {
            Item::Clip(c) => c.id,
            _ => unreachable!(),
        };
        // clip b starts at track 36 with source offset 10
        let (target, src) = tl.media_reference_at(b_id, rt(40.0)).unwrap();
        assert_eq!(target, "b.0001.ppm");
        assert_eq!(src.value, 14.0);
    }

    #[test]
    fn test_video_layers_simple() {
        let tl = one_track_timeline();
        let layers = tl.video_layers_at(rt(2.0));
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].source_time.value, 2.0);
        assert!(layers[0].b.is_none());

        // gap -> no layers
        assert!(tl.video_layers_at(rt(30.0)).is_empty());
    }

    #[test]
    fn test_transition_window_and_value() {
        let mut tl = Timeline::new("tr", 24.0);
        let mut track = Track::new("V1", TrackKind::Video);
        track.items.push(Item::Clip(clip("a", "a.0001.ppm", 0.0, 24.0)));
        track.items.push(Item::Transition(Transition::new(
            TransitionKind::Dissolve,
            rt(6.0),
            rt(6.0),
        )));
        track.items.push(Item::Clip(clip("b", "b.0001.ppm", 0.0, 24.0)));
        tl.tracks.push(track);

        assert!(tl.validate().is_ok());

        // inside the window: A carries clip a, B carries clip b
        let layers = tl.video_layers_at(rt(21.0));
        assert_eq!(layers.len(), 1);
        let l = &layers[0];
        assert_eq!(l.target, "a.0001.ppm");
        let (b_id, b_target, b_src) = l.b.as_ref().unwrap();
        assert_eq!(b_target, "b.0001.ppm");
        assert_ne!(*b_id, l.clip_id);
        // b's track span starts at 24; sampling at 21 extrapolates to -3
        assert_eq!(b_src.value, -3.0);
        assert_eq!(l.transition, Some(TransitionKind::Dissolve));
        // window [18, 30): 21 is a quarter through
        assert!((l.transition_value - 0.25).abs() < 1e-9);

        // after the cut, still inside the window
        let layers = tl.video_layers_at(rt(27.0));
        let l = &layers[0];
        assert_eq!(l.target, "a.0001.ppm");
        assert!((l.transition_value - 0.75).abs() < 1e-9);

        // outside the window: single layer, no B
        let layers = tl.video_layers_at(rt(10.0));
        assert!(layers[0].b.is_none());
    }

    #[test]
    fn test_flatten_occlusion() {
        let mut tl = Timeline::new("f", 24.0);
        let mut v1 = Track::new("V1", TrackKind::Video);
        v1.items.push(Item::Clip(clip("under", "under.0001.ppm", 0.0, 48.0)));
        let mut v2 = Track::new("V2", TrackKind::Video);
        v2.items.push(Item::Gap(Gap::new(rt(12.0))));
        v2.items.push(Item::Clip(clip("over", "over.0001.ppm", 0.0, 12.0)));
        tl.tracks.push(v1);
        tl.tracks.push(v2);

        let flat = tl.flatten();
        // under [0,12), over [12,24), under [24,48)
        assert_eq!(flat.items.len(), 3);
        match &flat.items[0] {
            Item::Clip(c) => {
                assert_eq!(c.name, "under");
                assert_eq!(c.source_range.duration.value, 12.0);
            }
            _ => panic!("expected clip"),
        }
        match &flat.items[1] {
            Item::Clip(c) => {
                assert_eq!(c.name, "over");
                assert_eq!(c.source_range.start.value, 0.0);
            }
            _ => panic!("expected clip"),
        }
        match &flat.items[2] {
            Item::Clip(c) => {
                assert_eq!(c.name, "under");
                // resumes where the occluder ended
                assert_eq!(c.source_range.start.value, 24.0);
                assert_eq!(c.source_range.duration.value, 24.0);
            }
            _ => panic!("expected clip"),
        }
    }

    #[test]
    fn test_flatten_keeps_fractional_cuts() {
        let mut tl = Timeline::new("frac", 24.0);
        let mut v1 = Track::new("V1", TrackKind::Video);
        v1.items.push(Item::Clip(clip("a", "a.0001.ppm", 0.0, 2.5)));
        v1.items.push(Item::Clip(clip("b", "b.0001.ppm", 10.0, 2.5)));
        tl.tracks.push(v1);

        let flat = tl.flatten();
        assert_eq!(flat.items.len(), 2);
        assert_eq!(flat.item_range(0, 24.0).unwrap().duration.value, 2.5);

        // the flattened cut lands where items_at cuts, not on a frame edge
        for (t, name) in [(2.4, "a"), (2.6, "b")] {
            match flat.items_at(rt(t), 24.0).item {
                Some((Item::Clip(c), _)) => assert_eq!(c.name, name),
                _ => panic!("expected a clip at {}", t),
            }
        }
    }

    #[test]
    fn test_item_range_bounds() {
        let tl = one_track_timeline();
        let track = &tl.tracks[0];
        let range = track.item_range(2, 24.0).unwrap();
        assert_eq!(range.start.value, 36.0);
        assert_eq!(range.duration.value, 24.0);
        assert!(track.item_range(3, 24.0).is_none());
    }

    #[test]
    fn test_validate_rejects_overreaching_transition() {
        let mut tl = Timeline::new("bad", 24.0);
        let mut track = Track::new("V1", TrackKind::Video);
        track.items.push(Item::Clip(clip("a", "a.0001.ppm", 0.0, 4.0)));
        track.items.push(Item::Transition(Transition::new(
            TransitionKind::Dissolve,
            rt(10.0), // longer than clip a
            rt(2.0),
        )));
        track.items.push(Item::Clip(clip("b", "b.0001.ppm", 0.0, 24.0)));
        tl.tracks.push(track);
        assert!(matches!(tl.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_rejects_overtrimmed_clip() {
        let mut tl = Timeline::new("bad2", 24.0);
        let mut track = Track::new("V1", TrackKind::Video);
        let mut c = clip("a", "a.0001.ppm", 0.0, 48.0);
        c.media.available_range = Some(TimeRange::new(rt(0.0), rt(24.0)));
        track.items.push(Item::Clip(c));
        tl.tracks.push(track);
        assert!(tl.validate().is_err());
    }

    fn scratch_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("reela_tl_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn small_ctx() -> crate::context::Context {
        crate::context::Context::new(crate::context::ContextOptions {
            worker_threads: 2,
            cache_byte_budget: Some(4 * 1024 * 1024),
            ..crate::context::ContextOptions::default()
        })
    }

    #[test]
    fn test_from_single_media_wraps_sequence() {
        use crate::image::{Image, ImageInfo, PixelType};
        use crate::io::png::PngCodec;
        use crate::io::sequence::Codec as _;

        let dir = scratch_dir();
        let info = ImageInfo::new(2, 2, PixelType::RgbaU8);
        for frame in 1..=6 {
            let file = dir.join(format!("drop.{:04}.png", frame));
            PngCodec.encode(&file.to_string_lossy(), &Image::black(info)).unwrap();
        }
        let target = dir.join("drop.0001.png").to_string_lossy().into_owned();

        let tl = Timeline::from_single_media(&target, &small_ctx()).unwrap();

        assert_eq!(tl.tracks.len(), 1);
        assert_eq!(tl.tracks[0].kind, TrackKind::Video);
        assert_eq!(tl.duration().value, 6.0);
        tl.validate().unwrap();
        match &tl.tracks[0].items[0] {
            Item::Clip(c) => {
                assert_eq!(c.media.target, target);
                assert!(c.media.available_range.is_some());
            }
            other => panic!("expected clip, got {:?}", other),
        }
    }

    #[test]
    fn test_from_single_media_wraps_audio() {
        use crate::audio::{Audio, AudioInfo, AudioType};
        use crate::io::wav;

        let dir = scratch_dir();
        let target = dir.join("mix.wav").to_string_lossy().into_owned();
        let audio = Audio::silence(AudioInfo::new(2, 48000, AudioType::S16), 48000);
        wav::write_file(&target, &audio).unwrap();

        let tl = Timeline::from_single_media(&target, &small_ctx()).unwrap();

        assert_eq!(tl.tracks.len(), 1);
        assert_eq!(tl.tracks[0].kind, TrackKind::Audio);
        assert!((tl.duration().to_seconds() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_from_single_media_missing_file() {
        let result = Timeline::from_single_media("/nonexistent/drop.0001.png", &small_ctx());
        assert!(matches!(result, Err(Error::OpenFailed(_))));
    }

    #[test]
    fn test_from_file_reads_document() {
        let dir = scratch_dir();
        let doc = r#"{
            "OTIO_SCHEMA": "Timeline.1",
            "name": "cut02",
            "tracks": {
                "OTIO_SCHEMA": "Stack.1",
                "children": [
                    {
                        "OTIO_SCHEMA": "Track.1",
                        "name": "V1",
                        "kind": "Video",
                        "children": [
                            {
                                "OTIO_SCHEMA": "Clip.1",
                                "name": "shot",
                                "source_range": {
                                    "start_time": {"value": 0.0, "rate": 24.0},
                                    "duration": {"value": 24.0, "rate": 24.0}
                                },
                                "media_reference": {
                                    "OTIO_SCHEMA": "ExternalReference.1",
                                    "target_url": "/shots/shot.0001.exr"
                                }
                            }
                        ]
                    }
                ]
            }
        }"#;
        let file = dir.join("cut.otio").to_string_lossy().into_owned();
        std::fs::write(&file, doc).unwrap();

        let tl = Timeline::from_file(&file).unwrap();
        assert_eq!(tl.name, "cut02");
        assert_eq!(tl.duration().value, 24.0);
    }
}
