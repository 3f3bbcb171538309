//! Image sequence plugin machinery
//!
//! **Why**: All still-image formats behave identically above the codec:
//! map a time to a frame index, open the numbered file, decode on a
//! worker, recover per-frame failures with a tagged black frame. One
//! plugin type parameterized by a [`Codec`] serves every format.
//!
//! **Used by**: png/jpeg/tiff/ppm/exr/sgi/cineon/dpx plugin constructors

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::core::workers::Workers;
use crate::error::{Error, Result};
use crate::image::{Image, ImageInfo};
use crate::io::{
    FileType, IoPlugin, Options, Pending, Reader, ReaderInfo, VideoData, Writer, pending,
};
use crate::path::Path;
use crate::time::{RationalTime, TimeRange};

/// Frame rate assumed for sequences that do not carry one
pub const DEFAULT_SEQUENCE_RATE: f64 = 24.0;

/// Option key overriding the assumed sequence rate
pub const OPTION_SEQUENCE_RATE: &str = "sequenceRate";

/// Pixel codec for one still-image format
pub trait Codec: Send + Sync {
    /// Decode one file into an image
    fn decode(&self, path: &str) -> Result<Image>;

    /// Encode one image to a file; `image` already has a pixel type this
    /// codec declared via `write_info`
    fn encode(&self, path: &str, image: &Image) -> Result<()>;

    /// Nearest writable form of `info`, or `None` if the format is
    /// read-only
    fn write_info(&self, info: &ImageInfo) -> Option<ImageInfo>;
}

/// [`IoPlugin`] for numbered image files (and bare single images)
pub struct SequencePlugin {
    name: &'static str,
    extensions: &'static [&'static str],
    codec: Arc<dyn Codec>,
    workers: Arc<Workers>,
}

impl SequencePlugin {
    pub fn new(
        name: &'static str,
        extensions: &'static [&'static str],
        codec: Arc<dyn Codec>,
        workers: Arc<Workers>,
    ) -> Self {
        Self { name, extensions, codec, workers }
    }
}

fn rate_from(options: &Options) -> f64 {
    options
        .get(OPTION_SEQUENCE_RATE)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|r| *r > 0.0)
        .unwrap_or(DEFAULT_SEQUENCE_RATE)
}

impl IoPlugin for SequencePlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn extensions(&self) -> &[&str] {
        self.extensions
    }

    fn file_type(&self) -> FileType {
        FileType::Sequence
    }

    fn read(&self, path: &Path, options: &Options) -> Result<Box<dyn Reader>> {
        let rate = rate_from(options);
        let (start_frame, end_frame) = path.frame_range()?;
        let range = TimeRange::new(
            RationalTime::new(start_frame as f64, rate),
            RationalTime::new((end_frame - start_frame + 1) as f64, rate),
        );
        Ok(Box::new(SequenceReader {
            path: path.clone(),
            codec: Arc::clone(&self.codec),
            workers: Arc::clone(&self.workers),
            epoch: Arc::new(AtomicU64::new(0)),
            range,
            start_frame,
            rate,
            last_info: Arc::new(Mutex::new(None)),
        }))
    }

    fn write_info(&self, info: &ImageInfo, _options: &Options) -> Option<ImageInfo> {
        self.codec.write_info(info)
    }

    fn write(
        &self,
        path: &Path,
        info: &ImageInfo,
        options: &Options,
    ) -> Result<Box<dyn Writer>> {
        let negotiated = self.codec.write_info(info).ok_or_else(|| {
            Error::InvalidArgument(format!("'{}' cannot write {:?}", self.name, info.pixel_type))
        })?;
        Ok(Box::new(SequenceWriter {
            path: path.clone(),
            codec: Arc::clone(&self.codec),
            info: negotiated,
            rate: rate_from(options),
            last_frame: None,
        }))
    }
}

struct SequenceReader {
    path: Path,
    codec: Arc<dyn Codec>,
    workers: Arc<Workers>,
    /// Bumped by `cancel_requests`; jobs snapshot it at submission
    epoch: Arc<AtomicU64>,
    range: TimeRange,
    start_frame: i64,
    rate: f64,
    /// Shape of the last decoded frame, for sizing substitute frames
    last_info: Arc<Mutex<Option<ImageInfo>>>,
}

impl SequenceReader {
    fn frame_for(&self, time: RationalTime) -> i64 {
        self.start_frame + (time - self.range.start).rescaled_to(self.rate).value.round() as i64
    }
}

impl Reader for SequenceReader {
    fn info(&mut self) -> Pending<ReaderInfo> {
        let (completion, out) = pending();
        let file = self.path.get(self.start_frame);
        let codec = Arc::clone(&self.codec);
        let range = self.range;
        let epoch = Arc::clone(&self.epoch);
        let submitted = epoch.load(Ordering::Relaxed);
        let last_info = Arc::clone(&self.last_info);

        self.workers.execute(move || {
            if epoch.load(Ordering::Relaxed) != submitted {
                return; // dropped completion reads as Cancelled
            }
            let result = codec.decode(&file).map(|image| {
                *last_info.lock().unwrap_or_else(|e| e.into_inner()) = Some(*image.info());
                ReaderInfo {
                    video: Some(*image.info()),
                    video_range: Some(range),
                    audio: None,
                    audio_range: None,
                    tags: image.tags().clone(),
                }
            });
            if epoch.load(Ordering::Relaxed) == submitted {
                completion.complete(result);
            }
        });
        out
    }

    fn read_video(&mut self, time: RationalTime, _options: &Options) -> Pending<VideoData> {
        if !self.range.contains(time) {
            return Pending::ready(Err(Error::OutOfRange(format!(
                "{} at {}",
                self.path,
                time.to_seconds()
            ))));
        }

        let (completion, out) = pending();
        let file = self.path.get(self.frame_for(time));
        let codec = Arc::clone(&self.codec);
        let epoch = Arc::clone(&self.epoch);
        let submitted = epoch.load(Ordering::Relaxed);
        let last_info = Arc::clone(&self.last_info);

        self.workers.execute(move || {
            if epoch.load(Ordering::Relaxed) != submitted {
                return;
            }
            let result = decode_with_recovery(codec.as_ref(), &file, &last_info);
            if epoch.load(Ordering::Relaxed) == submitted {
                completion.complete(result.map(|image| VideoData::new(time, Arc::new(image))));
            }
        });
        out
    }

    fn cancel_requests(&mut self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decode; on failure substitute a black frame of the known shape tagged
/// `ioError`. Errors propagate only while no shape has ever been seen.
fn decode_with_recovery(
    codec: &dyn Codec,
    file: &str,
    last_info: &Mutex<Option<ImageInfo>>,
) -> Result<Image> {
    match codec.decode(file) {
        Ok(mut image) => {
            promote_hdr_tag(&mut image);
            *last_info.lock().unwrap_or_else(|e| e.into_inner()) = Some(*image.info());
            Ok(image)
        }
        Err(e) => {
            let known = *last_info.lock().unwrap_or_else(|e| e.into_inner());
            match known {
                Some(info) => {
                    warn!("substituting black frame for '{}': {}", file, e);
                    let mut image = Image::black(info);
                    image.set_tag("ioError", e.to_string());
                    Ok(image)
                }
                None => Err(e),
            }
        }
    }
}

/// Older pipelines smuggled HDR mastering data through a JSON tag; lift
/// it into the typed slot and keep the tag map for unknown metadata only.
fn promote_hdr_tag(image: &mut Image) {
    if image.hdr().is_some() {
        return;
    }
    let parsed = image
        .tag("hdrData")
        .and_then(|json| serde_json::from_str::<crate::image::HdrData>(json).ok());
    if let Some(hdr) = parsed {
        image.set_hdr(Some(hdr));
        image.remove_tag("hdrData");
    }
}

struct SequenceWriter {
    path: Path,
    codec: Arc<dyn Codec>,
    info: ImageInfo,
    rate: f64,
    last_frame: Option<i64>,
}

impl Writer for SequenceWriter {
    fn write_video(&mut self, time: RationalTime, image: &Image) -> Result<()> {
        let frame = time.rescaled_to(self.rate).value.round() as i64;
        if let Some(last) = self.last_frame {
            if frame <= last {
                return Err(Error::InvalidOrder(format!(
                    "frame {} after frame {}",
                    frame, last
                )));
            }
        }
        let file = self.path.get(frame);
        if image.info().pixel_type == self.info.pixel_type {
            self.codec.encode(&file, image)?;
        } else {
            self.codec.encode(&file, &image.converted(self.info.pixel_type))?;
        }
        self.last_frame = Some(frame);
        Ok(())
    }
}
