//! Thumbnail and media info resolver
//!
//! **Why**: browsers and timeline strips want previews without touching
//! playback. Requests sit in a debounce queue before dispatch, so a host
//! scrubbing through candidates can cancel superseded ids before any
//! decode starts. Work runs on one dedicated thread that opens short-lived
//! readers through the plugin registry, never the shared reader pool, so
//! preview churn cannot evict playback readers.
//!
//! **Used by**: host UI layers (media browser, clip strips)

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::image::{Image, ImageInfo, PixelType};
use crate::io::{OPEN_TIMEOUT, Options, ReaderInfo};
use crate::path::Path;
use crate::time::RationalTime;

/// Queue delay between request and dispatch
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);

/// Ticket identifying one request; replies carry it back
pub type RequestId = u64;

/// What a resolved request produced
#[derive(Debug, Clone)]
pub enum ThumbnailPayload {
    Info(ReaderInfo),
    Image(Arc<Image>),
}

/// One harvested result
#[derive(Debug)]
pub struct ThumbnailReply {
    pub id: RequestId,
    pub path: String,
    pub result: Result<ThumbnailPayload>,
}

#[derive(Debug, Clone)]
enum Job {
    Info,
    Thumbnail { time: RationalTime, height: usize },
}

struct Queued {
    id: RequestId,
    path: String,
    job: Job,
    due: Instant,
}

struct Dispatched {
    id: RequestId,
    path: String,
    job: Job,
}

/// Debounced async resolver from (path, time) to preview image or info.
///
/// `request_*` returns immediately with an id; `poll` dispatches due
/// requests and harvests finished ones without blocking. All methods take
/// the caller's `now` so hosts drive it from the same instant they pass
/// to [`Player::tick`](crate::core::player::Player::tick).
pub struct ThumbnailService {
    debounce: Duration,
    next_id: AtomicU64,
    queue: Mutex<Vec<Queued>>,
    in_flight: Mutex<HashSet<RequestId>>,
    cancelled: Arc<Mutex<HashSet<RequestId>>>,
    jobs: Option<Sender<Dispatched>>,
    replies: Receiver<ThumbnailReply>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ThumbnailService {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self::with_debounce(ctx, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(ctx: Arc<Context>, debounce: Duration) -> Self {
        let (jobs_tx, jobs_rx) = unbounded::<Dispatched>();
        let (replies_tx, replies_rx) = unbounded::<ThumbnailReply>();
        let cancelled = Arc::new(Mutex::new(HashSet::new()));
        let thread_cancelled = Arc::clone(&cancelled);
        let handle = thread::Builder::new()
            .name("reela-thumbs".to_string())
            .spawn(move || service_thread(ctx, jobs_rx, replies_tx, thread_cancelled))
            .ok();
        if handle.is_none() {
            warn!("thumbnail thread failed to start; requests will never resolve");
        }
        Self {
            debounce,
            next_id: AtomicU64::new(1),
            queue: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            cancelled,
            jobs: Some(jobs_tx),
            replies: replies_rx,
            handle,
        }
    }

    pub fn request_info(&self, path: &str, now: Instant) -> RequestId {
        self.enqueue(path, Job::Info, now)
    }

    /// Preview of `path` at `time`, scaled to `height` rows with the
    /// source aspect kept
    pub fn request_thumbnail(
        &self,
        path: &str,
        time: RationalTime,
        height: usize,
        now: Instant,
    ) -> RequestId {
        self.enqueue(path, Job::Thumbnail { time, height }, now)
    }

    fn enqueue(&self, path: &str, job: Job, now: Instant) -> RequestId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push(Queued { id, path: path.to_string(), job, due: now + self.debounce });
        id
    }

    /// Drop a request. Queued requests never dispatch; dispatched ones
    /// finish on the worker but their reply is swallowed.
    pub fn cancel(&self, id: RequestId) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = queue.iter().position(|q| q.id == id) {
            queue.remove(at);
            return;
        }
        drop(queue);
        if self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).contains(&id) {
            self.cancelled.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
        }
    }

    pub fn cancel_all(&self) {
        let dropped =
            self.queue.lock().unwrap_or_else(|e| e.into_inner()).drain(..).count();
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let mut cancelled = self.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        cancelled.extend(in_flight.iter().copied());
        if dropped > 0 || !in_flight.is_empty() {
            debug!(
                "thumbnail cancel_all: {} queued dropped, {} in flight suppressed",
                dropped,
                in_flight.len()
            );
        }
    }

    /// Requests not yet harvested (queued plus dispatched)
    pub fn pending_count(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
            + self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0
    }

    /// Dispatch requests whose debounce has elapsed and collect finished
    /// replies. Never blocks.
    pub fn poll(&self, now: Instant) -> Vec<ThumbnailReply> {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let mut held = Vec::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if entry.due > now {
                    held.push(entry);
                    continue;
                }
                self.in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(entry.id);
                if let Some(jobs) = &self.jobs {
                    let _ = jobs.send(Dispatched {
                        id: entry.id,
                        path: entry.path,
                        job: entry.job,
                    });
                }
            }
            *queue = held;
        }

        let mut replies = Vec::new();
        while let Ok(reply) = self.replies.try_recv() {
            self.in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&reply.id);
            if self
                .cancelled
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&reply.id)
            {
                continue;
            }
            replies.push(reply);
        }
        replies
    }
}

impl Drop for ThumbnailService {
    fn drop(&mut self) {
        // closing the job channel ends the worker loop
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + Duration::from_millis(500);
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("thumbnail thread did not stop in time");
            }
        }
    }
}

fn service_thread(
    ctx: Arc<Context>,
    jobs: Receiver<Dispatched>,
    replies: Sender<ThumbnailReply>,
    cancelled: Arc<Mutex<HashSet<RequestId>>>,
) {
    while let Ok(job) = jobs.recv() {
        // a cancelled job still gets a reply so the harvest side can
        // clear its bookkeeping; the reply itself never surfaces
        let skip = cancelled.lock().unwrap_or_else(|e| e.into_inner()).contains(&job.id);
        let result = if skip { Err(Error::Cancelled) } else { resolve(&ctx, &job) };
        if let Err(e) = &result {
            if !e.is_cancelled() {
                debug!("thumbnail request {} for '{}' failed: {}", job.id, job.path, e);
            }
        }
        if replies
            .send(ThumbnailReply { id: job.id, path: job.path, result })
            .is_err()
        {
            break;
        }
    }
}

/// Open, probe or decode, scale. Readers live for one request; the
/// decode itself still runs on the context's worker pool, which this
/// thread is not part of, so waiting here cannot starve it.
fn resolve(ctx: &Arc<Context>, job: &Dispatched) -> Result<ThumbnailPayload> {
    let path = Path::parse(&job.path);
    let options = Options::new();
    let mut reader = ctx.registry().read(&path, &options)?;
    match &job.job {
        Job::Info => {
            let info = reader.info().wait_timeout(OPEN_TIMEOUT)?;
            Ok(ThumbnailPayload::Info(info))
        }
        Job::Thumbnail { time, height } => {
            let video = reader.read_video(*time, &options).wait_timeout(OPEN_TIMEOUT)?;
            let image = video
                .layers
                .first()
                .and_then(|layer| layer.image.as_ref())
                .ok_or_else(|| Error::DecodeFailed("decoded frame has no image".into()))?;
            Ok(ThumbnailPayload::Image(Arc::new(scaled_to_height(image, *height))))
        }
    }
}

/// Bilinear resample to `height` rows, aspect preserved, RGBA 8-bit out.
/// Tags carry over so substituted frames stay identifiable.
fn scaled_to_height(src: &Image, height: usize) -> Image {
    let sw = src.info().width;
    let sh = src.info().height;
    let height = height.max(1);
    let width = ((sw as f64 * height as f64 / sh as f64).round() as usize).max(1);

    let mut dst = Image::new(ImageInfo::new(width, height, PixelType::RgbaU8));
    let mut row_lo = vec![0.0f32; sw * 4];
    let mut row_hi = vec![0.0f32; sw * 4];
    let mut cached_rows = None;
    let mut out = vec![0.0f32; width * 4];

    for dy in 0..height {
        let sy = ((dy as f32 + 0.5) * sh as f32 / height as f32 - 0.5)
            .clamp(0.0, (sh - 1) as f32);
        let y0 = sy.floor() as usize;
        let y1 = (y0 + 1).min(sh - 1);
        let fy = sy - y0 as f32;
        if cached_rows != Some((y0, y1)) {
            src.unpack_row(y0, &mut row_lo);
            src.unpack_row(y1, &mut row_hi);
            cached_rows = Some((y0, y1));
        }
        for dx in 0..width {
            let sx = ((dx as f32 + 0.5) * sw as f32 / width as f32 - 0.5)
                .clamp(0.0, (sw - 1) as f32);
            let x0 = sx.floor() as usize;
            let x1 = (x0 + 1).min(sw - 1);
            let fx = sx - x0 as f32;
            for c in 0..4 {
                let top = row_lo[x0 * 4 + c] * (1.0 - fx) + row_lo[x1 * 4 + c] * fx;
                let bottom = row_hi[x0 * 4 + c] * (1.0 - fx) + row_hi[x1 * 4 + c] * fx;
                out[dx * 4 + c] = top * (1.0 - fy) + bottom * fy;
            }
        }
        dst.pack_row(dy, &out);
    }

    dst.set_tags(src.tags().clone());
    dst
}
