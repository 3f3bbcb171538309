//! Timeline file loading
//!
//! **Why**: Timelines arrive as OTIO-style JSON. The schema is a tree of
//! objects tagged `OTIO_SCHEMA` ("Timeline.1", "Clip.2", ...); walking a
//! `serde_json::Value` keeps us tolerant of version suffixes and fields we
//! do not model.
//!
//! **Used by**: `Timeline::from_file`, hosts embedding timeline JSON

use serde_json::Value;

use crate::error::{Error, Result};
use crate::time::{RationalTime, TimeRange};
use crate::timeline::{
    Clip, Gap, Item, MediaReference, Timeline, Track, TrackKind, Transition, TransitionKind,
};

/// Load a timeline from a `.otio` JSON file
pub fn from_file(path: &str) -> Result<Timeline> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::OpenFailed(format!("{}: {}", path, e)))?;
    let mut timeline = from_json_str(&content)?;
    if timeline.name.is_empty() {
        timeline.name = path.to_string();
    }
    Ok(timeline)
}

pub fn from_json_str(json: &str) -> Result<Timeline> {
    let value: Value = serde_json::from_str(json)?;
    from_json(&value)
}

/// Parse a timeline out of a JSON document. A `SerializableCollection`
/// wrapper yields its first timeline.
pub fn from_json(value: &Value) -> Result<Timeline> {
    let schema = schema_of(value);
    if schema.starts_with("Timeline") {
        parse_timeline(value)
    } else if schema.starts_with("SerializableCollection") {
        let first = value
            .get("children")
            .and_then(|v| v.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| Error::OpenFailed("empty timeline collection".into()))?;
        parse_timeline(first)
    } else {
        Err(Error::OpenFailed(format!(
            "unsupported timeline schema: '{}'",
            schema
        )))
    }
}

fn schema_of(value: &Value) -> &str {
    value.get("OTIO_SCHEMA").and_then(|v| v.as_str()).unwrap_or("")
}

fn parse_timeline(value: &Value) -> Result<Timeline> {
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let global_start = value
        .get("global_start_time")
        .and_then(parse_rational_time);

    let mut tracks = Vec::new();
    if let Some(children) = value
        .get("tracks")
        .and_then(|s| s.get("children"))
        .and_then(|v| v.as_array())
    {
        for (i, track_val) in children.iter().enumerate() {
            if !schema_of(track_val).starts_with("Track") {
                continue;
            }
            tracks.push(parse_track(track_val, i)?);
        }
    }

    // the file carries no explicit frame rate; take it from the start time
    // or the first clip
    let global_rate = global_start
        .map(|t| t.rate)
        .filter(|r| *r > 0.0)
        .or_else(|| {
            tracks.iter().find_map(|t: &Track| {
                t.items.iter().find_map(|i| match i {
                    Item::Clip(c) => Some(c.rate()),
                    _ => None,
                })
            })
        })
        .unwrap_or(24.0);

    let mut timeline = Timeline::new(name, global_rate);
    timeline.global_start =
        global_start.unwrap_or(RationalTime::new(0.0, global_rate));
    timeline.tracks = tracks;
    timeline.validate()?;
    Ok(timeline)
}

fn parse_track(value: &Value, index: usize) -> Result<Track> {
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("Track {}", index + 1));
    let kind = match value.get("kind").and_then(|v| v.as_str()) {
        Some("Audio") => TrackKind::Audio,
        _ => TrackKind::Video,
    };

    let mut track = Track::new(name, kind);
    if let Some(children) = value.get("children").and_then(|v| v.as_array()) {
        for child in children {
            let schema = schema_of(child);
            if schema.starts_with("Clip") {
                track.items.push(Item::Clip(parse_clip(child)?));
            } else if schema.starts_with("Gap") || schema.starts_with("Filler") {
                track.items.push(Item::Gap(parse_gap(child)?));
            } else if schema.starts_with("Transition") {
                track.items.push(Item::Transition(parse_transition(child)?));
            }
            // other schemas (markers, effects) are skipped
        }
    }
    Ok(track)
}

fn parse_clip(value: &Value) -> Result<Clip> {
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let source_range = value
        .get("source_range")
        .and_then(parse_time_range)
        .ok_or_else(|| {
            Error::OpenFailed(format!("clip '{}' has no source_range", name))
        })?;

    // Clip.1 carries media_reference; Clip.2 a media_references dict keyed
    // by active_media_reference_key
    let media_val = value.get("media_reference").or_else(|| {
        let refs = value.get("media_references")?;
        let key = value
            .get("active_media_reference_key")
            .and_then(|v| v.as_str())
            .unwrap_or("DEFAULT_MEDIA");
        refs.get(key).or_else(|| refs.as_object()?.values().next())
    });

    let media = media_val
        .map(parse_media_reference)
        .unwrap_or_else(|| MediaReference::new(""));

    Ok(Clip::new(name, media, source_range))
}

fn parse_media_reference(value: &Value) -> MediaReference {
    let schema = schema_of(value);
    let mut target = String::new();

    if schema.starts_with("ImageSequenceReference") {
        // reassemble one concrete member of the sequence; the path layer
        // rediscovers pattern and padding from it
        let base = value
            .get("target_url_base")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let prefix = value
            .get("name_prefix")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let suffix = value
            .get("name_suffix")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let start = value
            .get("start_frame")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let padding = value
            .get("frame_zero_padding")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .max(0) as usize;
        target = format!(
            "{}{}{:0pad$}{}",
            strip_file_scheme(base),
            prefix,
            start,
            suffix,
            pad = padding
        );
    } else if let Some(url) = value
        .get("target_url")
        .or_else(|| value.get("target"))
        .and_then(|v| v.as_str())
    {
        target = strip_file_scheme(url).to_string();
    }
    // MissingReference and unknown schemas keep an empty target; the clip
    // is treated as transparent

    let mut media = MediaReference::new(target);
    media.available_range = value.get("available_range").and_then(parse_time_range);
    media
}

fn parse_gap(value: &Value) -> Result<Gap> {
    let duration = value
        .get("source_range")
        .and_then(parse_time_range)
        .map(|r| r.duration)
        .or_else(|| {
            value
                .get("duration")
                .and_then(parse_rational_time)
        })
        .ok_or_else(|| Error::OpenFailed("gap has no duration".into()))?;
    Ok(Gap::new(duration))
}

fn parse_transition(value: &Value) -> Result<Transition> {
    let kind = match value.get("transition_type").and_then(|v| v.as_str()) {
        Some(s) if s.to_lowercase().contains("wipe") => TransitionKind::Wipe,
        _ => TransitionKind::Dissolve,
    };
    let in_offset = value
        .get("in_offset")
        .and_then(parse_rational_time)
        .ok_or_else(|| Error::OpenFailed("transition has no in_offset".into()))?;
    let out_offset = value
        .get("out_offset")
        .and_then(parse_rational_time)
        .ok_or_else(|| Error::OpenFailed("transition has no out_offset".into()))?;
    Ok(Transition::new(kind, in_offset, out_offset))
}

fn parse_rational_time(value: &Value) -> Option<RationalTime> {
    Some(RationalTime::new(
        value.get("value")?.as_f64()?,
        value.get("rate")?.as_f64()?,
    ))
}

fn parse_time_range(value: &Value) -> Option<TimeRange> {
    Some(TimeRange::new(
        parse_rational_time(value.get("start_time")?)?,
        parse_rational_time(value.get("duration")?)?,
    ))
}

fn strip_file_scheme(url: &str) -> &str {
    url.strip_prefix("file://").unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "OTIO_SCHEMA": "Timeline.1",
        "name": "cut01",
        "global_start_time": {"OTIO_SCHEMA": "RationalTime.1", "value": 0.0, "rate": 24.0},
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
                            "name": "shot_010",
                            "source_range": {
                                "OTIO_SCHEMA": "TimeRange.1",
                                "start_time": {"value": 10.0, "rate": 24.0},
                                "duration": {"value": 48.0, "rate": 24.0}
                            },
                            "media_reference": {
                                "OTIO_SCHEMA": "ExternalReference.1",
                                "target_url": "file:///shots/shot_010.mov",
                                "available_range": {
                                    "start_time": {"value": 0.0, "rate": 24.0},
                                    "duration": {"value": 100.0, "rate": 24.0}
                                }
                            }
                        },
                        {
                            "OTIO_SCHEMA": "Gap.1",
                            "source_range": {
                                "start_time": {"value": 0.0, "rate": 24.0},
                                "duration": {"value": 12.0, "rate": 24.0}
                            }
                        },
                        {
                            "OTIO_SCHEMA": "Transition.1",
                            "transition_type": "SMPTE_Dissolve",
                            "in_offset": {"value": 0.0, "rate": 24.0},
                            "out_offset": {"value": 6.0, "rate": 24.0}
                        },
                        {
                            "OTIO_SCHEMA": "Clip.2",
                            "name": "shot_020",
                            "source_range": {
                                "start_time": {"value": 0.0, "rate": 24.0},
                                "duration": {"value": 24.0, "rate": 24.0}
                            },
                            "active_media_reference_key": "DEFAULT_MEDIA",
                            "media_references": {
                                "DEFAULT_MEDIA": {
                                    "OTIO_SCHEMA": "ImageSequenceReference.1",
                                    "target_url_base": "/shots/shot_020/",
                                    "name_prefix": "shot_020.",
                                    "name_suffix": ".exr",
                                    "start_frame": 1001,
                                    "frame_zero_padding": 4
                                }
                            }
                        }
                    ]
                },
                {
                    "OTIO_SCHEMA": "Track.1",
                    "name": "A1",
                    "kind": "Audio",
                    "children": [
                        {
                            "OTIO_SCHEMA": "Clip.1",
                            "name": "mix",
                            "source_range": {
                                "start_time": {"value": 0.0, "rate": 24.0},
                                "duration": {"value": 84.0, "rate": 24.0}
                            },
                            "media_reference": {
                                "OTIO_SCHEMA": "ExternalReference.1",
                                "target_url": "/audio/mix.wav"
                            }
                        }
                    ]
                }
            ]
        }
    }"#;

    #[test]
    fn test_parse_full_timeline() {
        let tl = from_json_str(SAMPLE).unwrap();
        assert_eq!(tl.name, "cut01");
        assert_eq!(tl.global_rate, 24.0);
        assert_eq!(tl.tracks.len(), 2);

        let v1 = &tl.tracks[0];
        assert_eq!(v1.kind, TrackKind::Video);
        assert_eq!(v1.items.len(), 4);

        match &v1.items[0] {
            Item::Clip(c) => {
                assert_eq!(c.name, "shot_010");
                // file:// scheme stripped
                assert_eq!(c.media.target, "/shots/shot_010.mov");
                assert_eq!(c.source_range.start.value, 10.0);
                let avail = c.media.available_range.unwrap();
                assert_eq!(avail.duration.value, 100.0);
            }
            _ => panic!("expected clip"),
        }
        assert!(matches!(&v1.items[1], Item::Gap(g) if g.duration.value == 12.0));
        assert!(matches!(
            &v1.items[2],
            Item::Transition(t) if t.kind == TransitionKind::Dissolve
        ));

        match &v1.items[3] {
            Item::Clip(c) => {
                assert_eq!(c.media.target, "/shots/shot_020/shot_020.1001.exr");
                let p = c.media.path();
                assert!(p.is_sequence());
                assert_eq!(p.padding(), 4);
            }
            _ => panic!("expected sequence clip"),
        }

        assert_eq!(tl.tracks[1].kind, TrackKind::Audio);
        // video: 48 + 12 + 24 = 84 frames
        assert_eq!(tl.duration().value, 84.0);
    }

    #[test]
    fn test_parse_collection_wrapper() {
        let wrapped = format!(
            r#"{{"OTIO_SCHEMA": "SerializableCollection.1", "children": [{}]}}"#,
            SAMPLE
        );
        let tl = from_json_str(&wrapped).unwrap();
        assert_eq!(tl.name, "cut01");
    }

    #[test]
    fn test_parse_missing_reference_is_transparent() {
        let json = r#"{
            "OTIO_SCHEMA": "Timeline.1",
            "tracks": {"children": [{
                "OTIO_SCHEMA": "Track.1", "kind": "Video",
                "children": [{
                    "OTIO_SCHEMA": "Clip.1", "name": "offline",
                    "source_range": {
                        "start_time": {"value": 0.0, "rate": 24.0},
                        "duration": {"value": 10.0, "rate": 24.0}
                    },
                    "media_reference": {"OTIO_SCHEMA": "MissingReference.1"}
                }]
            }]}
        }"#;
        let tl = from_json_str(json).unwrap();
        match &tl.tracks[0].items[0] {
            Item::Clip(c) => assert!(c.media.target.is_empty()),
            _ => panic!("expected clip"),
        }
        // transparent clips never win the flattened view
        let flat = tl.flatten();
        assert!(matches!(&flat.items[0], Item::Gap(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_schema() {
        let err = from_json_str(r#"{"OTIO_SCHEMA": "Marker.2"}"#).unwrap_err();
        assert!(matches!(err, Error::OpenFailed(_)));
        assert!(err.to_string().contains("Marker.2"));
    }

    #[test]
    fn test_parse_bad_json_maps_to_open_failed() {
        assert!(matches!(
            from_json_str("{not json"),
            Err(Error::OpenFailed(_))
        ));
    }
}
