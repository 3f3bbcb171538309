//! Movie container plugin (animated GIF)
//!
//! **Why**: Containers decode statefully: frames come off one demux
//! position, so each open file gets its own decoder thread instead of
//! the shared worker pool. Requests queue over a channel; a backward
//! seek reopens the stream and decodes forward again.
//!
//! **Used by**: default plugin registry

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded, unbounded};
use image::AnimationDecoder;
use image::codecs::gif::GifDecoder;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::image::{Image, ImageInfo, PixelBuffer, PixelType};
use crate::io::{
    Completion, FileType, IoPlugin, OPEN_TIMEOUT, Options, Pending, Reader, ReaderInfo, VideoData,
    pending,
};
use crate::path::Path;
use crate::time::{RationalTime, TimeRange};

/// Frame rate assumed when the container carries zero frame delays
pub const DEFAULT_MOVIE_RATE: f64 = 10.0;

/// Option key overriding the container's own frame timing
pub const OPTION_MOVIE_RATE: &str = "movieRate";

pub fn plugin() -> Arc<dyn IoPlugin> {
    Arc::new(MoviePlugin)
}

pub struct MoviePlugin;

impl IoPlugin for MoviePlugin {
    fn name(&self) -> &str {
        "movie"
    }

    fn extensions(&self) -> &[&str] {
        &["gif"]
    }

    fn file_type(&self) -> FileType {
        FileType::Movie
    }

    fn read(&self, path: &Path, options: &Options) -> Result<Box<dyn Reader>> {
        let rate_override = options
            .get(OPTION_MOVIE_RATE)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|r| *r > 0.0);
        Ok(Box::new(MovieReader::open(path.full(), rate_override)?))
    }
}

enum Request {
    Info(Completion<ReaderInfo>),
    Video { time: RationalTime, epoch: u64, done: Completion<VideoData> },
}

/// [`Reader`] backed by a dedicated decoder thread
pub struct MovieReader {
    tx: Option<Sender<Request>>,
    epoch: Arc<AtomicU64>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MovieReader {
    fn open(path: String, rate_override: Option<f64>) -> Result<Self> {
        let (tx, rx) = unbounded::<Request>();
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let epoch = Arc::new(AtomicU64::new(0));
        let thread_epoch = Arc::clone(&epoch);
        let thread_path = path.clone();
        let handle = thread::Builder::new()
            .name("reela-movie".to_string())
            .spawn(move || decoder_thread(thread_path, rate_override, rx, ready_tx, thread_epoch))
            .map_err(|e| Error::OpenFailed(format!("decoder thread: {}", e)))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                debug!("opened movie {}", path);
                Ok(Self { tx: Some(tx), epoch, handle: Some(handle) })
            }
            Ok(Err(e)) => {
                drop(tx);
                let _ = handle.join();
                Err(e)
            }
            // thread keeps probing; dropping tx lets it exit on its own
            Err(_) => Err(Error::OpenFailed(format!(
                "'{}' open timed out after {:?}",
                path, OPEN_TIMEOUT
            ))),
        }
    }
}

impl Reader for MovieReader {
    fn info(&mut self) -> Pending<ReaderInfo> {
        let (done, result) = pending();
        if let Some(tx) = &self.tx {
            let _ = tx.send(Request::Info(done));
        }
        result
    }

    fn read_video(&mut self, time: RationalTime, _options: &Options) -> Pending<VideoData> {
        let (done, result) = pending();
        let epoch = self.epoch.load(Ordering::SeqCst);
        if let Some(tx) = &self.tx {
            let _ = tx.send(Request::Video { time, epoch, done });
        }
        result
    }

    fn cancel_requests(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for MovieReader {
    fn drop(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        // closing the request channel ends the decoder loop
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + Duration::from_millis(500);
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("movie decoder thread did not stop in time");
            }
        }
    }
}

fn decoder_thread(
    path: String,
    rate_override: Option<f64>,
    rx: crossbeam_channel::Receiver<Request>,
    ready_tx: Sender<Result<()>>,
    epoch: Arc<AtomicU64>,
) {
    let mut decoder = match MovieDecoder::open(&path, rate_override) {
        Ok(d) => d,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    while let Ok(request) = rx.recv() {
        match request {
            Request::Info(done) => done.complete(Ok(decoder.info.clone())),
            Request::Video { time, epoch: at, done } => {
                // a stale epoch drops `done`, surfacing Cancelled downstream
                if epoch.load(Ordering::SeqCst) != at {
                    continue;
                }
                let result = decoder.frame_at(time);
                if epoch.load(Ordering::SeqCst) != at {
                    continue;
                }
                done.complete(result.map(|image| VideoData::new(time, image)));
            }
        }
    }
}

/// Stateful GIF stream living on the decoder thread
struct MovieDecoder {
    path: String,
    frames: image::Frames<'static>,
    /// Index the stream will yield next
    next_index: i64,
    last: Option<(i64, Arc<Image>)>,
    rate: f64,
    count: i64,
    shape: ImageInfo,
    info: ReaderInfo,
}

impl MovieDecoder {
    fn open(path: &str, rate_override: Option<f64>) -> Result<Self> {
        // probe pass: shape, timing and the serveable frame count
        let mut probe = open_frames(path)?;
        let first = match probe.next() {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(Error::OpenFailed(format!("'{}' contains no frames", path))),
        };
        let (num, den) = first.delay().numer_denom_ms();
        let delay_ms = if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let rate = rate_override
            .unwrap_or(if delay_ms > 0.0 { 1000.0 / delay_ms } else { DEFAULT_MOVIE_RATE });
        let buffer = first.buffer();
        let shape =
            ImageInfo::new(buffer.width() as usize, buffer.height() as usize, PixelType::RgbaU8);

        let mut count = 1i64;
        for frame in probe {
            if frame.is_err() {
                break;
            }
            count += 1;
        }

        let info = ReaderInfo {
            video: Some(shape),
            video_range: Some(TimeRange::new(
                RationalTime::new(0.0, rate),
                RationalTime::new(count as f64, rate),
            )),
            ..Default::default()
        };
        Ok(Self {
            path: path.to_string(),
            frames: open_frames(path)?,
            next_index: 0,
            last: None,
            rate,
            count,
            shape,
            info,
        })
    }

    fn frame_at(&mut self, time: RationalTime) -> Result<Arc<Image>> {
        let index = time.rescaled_to(self.rate).value.round() as i64;
        if index < 0 || index >= self.count {
            return Err(Error::OutOfRange(format!(
                "frame {} outside 0..{} in {}",
                index, self.count, self.path
            )));
        }
        if let Some((at, image)) = &self.last {
            if *at == index {
                return Ok(Arc::clone(image));
            }
        }
        if index < self.next_index {
            // containers only step forward; restart the stream to seek back
            self.frames = open_frames(&self.path)?;
            self.next_index = 0;
        }

        let mut taken = None;
        while self.next_index <= index {
            self.next_index += 1;
            match self.frames.next() {
                Some(Ok(frame)) => taken = Some(frame),
                Some(Err(e)) => {
                    if self.next_index > index {
                        return Ok(self.substitute(index, e.to_string()));
                    }
                }
                None => return Ok(self.substitute(index, "stream ended early".to_string())),
            }
        }
        let frame = match taken {
            Some(f) => f,
            None => return Ok(self.substitute(index, "frame missing from stream".to_string())),
        };

        let raw = frame.into_buffer();
        let image = Arc::new(Image::from_buffer(
            ImageInfo::new(raw.width() as usize, raw.height() as usize, PixelType::RgbaU8),
            PixelBuffer::U8(raw.into_raw()),
        ));
        self.last = Some((index, Arc::clone(&image)));
        Ok(image)
    }

    /// Tagged black frame standing in for an undecodable one
    fn substitute(&mut self, index: i64, message: String) -> Arc<Image> {
        warn!("substituting black frame {} of {}: {}", index, self.path, message);
        let mut image = Image::black(self.shape);
        image.set_tag("ioError", message);
        let image = Arc::new(image);
        self.last = Some((index, Arc::clone(&image)));
        image
    }
}

fn open_frames(path: &str) -> Result<image::Frames<'static>> {
    let file = File::open(path).map_err(|e| Error::OpenFailed(format!("'{}': {}", path, e)))?;
    let decoder = GifDecoder::new(BufReader::new(file))?;
    Ok(decoder.into_frames())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Frame, Rgba, RgbaImage};

    fn temp_gif(frames: usize) -> String {
        let dir = std::env::temp_dir().join(format!("reela_movie_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("anim.gif").to_string_lossy().into_owned();
        let file = File::create(&path).unwrap();
        let mut encoder = GifEncoder::new(file);
        for i in 0..frames {
            let color = Rgba([40 * i as u8, 10, 200, 255]);
            let buffer = RgbaImage::from_pixel(4, 3, color);
            let frame = Frame::from_parts(buffer, 0, 0, Delay::from_numer_denom_ms(100, 1));
            encoder.encode_frame(frame).unwrap();
        }
        path
    }

    fn wait<T>(p: Pending<T>) -> Result<T> {
        p.wait_timeout(Duration::from_secs(5))
    }

    fn open_reader(path: &str) -> Box<dyn Reader> {
        MoviePlugin.read(&Path::parse(path), &Options::new()).unwrap()
    }

    #[test]
    fn test_info_reports_shape_and_range() {
        let path = temp_gif(5);
        let mut reader = open_reader(&path);

        let info = wait(reader.info()).unwrap();
        let video = info.video.unwrap();
        assert_eq!((video.width, video.height), (4, 3));
        assert_eq!(video.pixel_type, PixelType::RgbaU8);
        let range = info.video_range.unwrap();
        assert_eq!(range.duration.value, 5.0);
        assert_eq!(range.duration.rate, 10.0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reads_frames_in_both_directions() {
        let path = temp_gif(5);
        let mut reader = open_reader(&path);
        let opts = Options::new();

        for index in [2u8, 1, 4] {
            let time = RationalTime::new(index as f64, 10.0);
            let video = wait(reader.read_video(time, &opts)).unwrap();
            let image = video.layers[0].image.as_ref().unwrap();
            assert_eq!(
                &image.buffer().bytes()[..4],
                &[40 * index, 10, 200, 255],
                "frame {}",
                index
            );
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_out_of_range_request() {
        let path = temp_gif(3);
        let mut reader = open_reader(&path);

        let far = RationalTime::new(99.0, 10.0);
        match wait(reader.read_video(far, &Options::new())) {
            Err(Error::OutOfRange(_)) => {}
            other => panic!("expected out of range, got {:?}", other),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_cancel_then_read_again() {
        let path = temp_gif(4);
        let mut reader = open_reader(&path);
        let opts = Options::new();

        let first = reader.read_video(RationalTime::new(3.0, 10.0), &opts);
        reader.cancel_requests();
        let second = reader.read_video(RationalTime::new(1.0, 10.0), &opts);

        assert!(wait(second).is_ok());
        // the first request raced the cancel: either outcome is legal,
        // but it must resolve
        match wait(first) {
            Ok(_) | Err(Error::Cancelled) => {}
            other => panic!("unexpected result {:?}", other),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_open_missing_file() {
        let missing = "/nonexistent/clip.gif";
        match MoviePlugin.read(&Path::parse(missing), &Options::new()) {
            Err(Error::OpenFailed(_)) => {}
            other => panic!("expected open failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_rate_override_option() {
        let path = temp_gif(4);
        let mut options = Options::new();
        options.insert(OPTION_MOVIE_RATE.to_string(), "24".to_string());
        let mut reader = MoviePlugin.read(&Path::parse(&path), &options).unwrap();

        let range = wait(reader.info()).unwrap().video_range.unwrap();
        assert_eq!(range.duration.rate, 24.0);
        std::fs::remove_file(&path).ok();
    }
}
