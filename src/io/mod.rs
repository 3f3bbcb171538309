//! I/O plugin layer
//!
//! **Why**: Every media source, from a PNG sequence to a movie container,
//! is reached through the same reader contract: async requests keyed by
//! time, non-blocking polling, cancellation that never leaks a late
//! result. The pipeline and the thumbnail service only ever talk to this
//! surface.
//!
//! **Used by**: read-ahead pipeline, player, thumbnail service
//!
//! # Invariants
//!
//! - A request outside the declared range resolves `Err(OutOfRange)`.
//! - A cancelled request resolves `Err(Cancelled)`; no late value is
//!   delivered after `cancel_requests` returns.
//! - Per-frame decode failures resolve to a black frame tagged `ioError`;
//!   only open failures surface as errors.

pub mod cineon;
pub(crate) mod convert;
pub mod dpx;
pub mod exr;
pub mod jpeg;
pub mod movie;
pub mod png;
pub mod ppm;
pub mod sequence;
pub mod sgi;
pub mod tiff;
pub mod wav;

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use log::{debug, warn};

use crate::audio::{Audio, AudioInfo};
use crate::error::{Error, Result};
use crate::image::{Image, ImageInfo};
use crate::path::Path;
use crate::time::{RationalTime, TimeRange};
use crate::timeline::TransitionKind;

/// Container-open options, ordered so fingerprints are deterministic
pub type Options = BTreeMap<String, String>;

/// Wall timeout for container opens and info probes
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// What a plugin handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Numbered image files played as frames
    Sequence,
    /// Single container with its own demuxer
    Movie,
    /// Audio-only container
    Audio,
}

/// Probed description of a media source
#[derive(Debug, Clone, Default)]
pub struct ReaderInfo {
    pub video: Option<ImageInfo>,
    pub video_range: Option<TimeRange>,
    pub audio: Option<AudioInfo>,
    pub audio_range: Option<TimeRange>,
    pub tags: HashMap<String, String>,
}

/// One video layer of a produced frame; `image_b` carries the incoming
/// side of a transition
#[derive(Debug, Clone, Default)]
pub struct VideoLayer {
    pub image: Option<Arc<Image>>,
    pub image_b: Option<Arc<Image>>,
    pub transition: Option<TransitionKind>,
    pub transition_value: f32,
}

impl VideoLayer {
    pub fn solid(image: Arc<Image>) -> Self {
        Self { image: Some(image), ..Default::default() }
    }

    pub fn byte_count(&self) -> usize {
        self.image.as_ref().map(|i| i.byte_count()).unwrap_or(0)
            + self.image_b.as_ref().map(|i| i.byte_count()).unwrap_or(0)
    }
}

/// A decoded frame at a time
#[derive(Debug, Clone, Default)]
pub struct VideoData {
    pub time: RationalTime,
    pub layers: Vec<VideoLayer>,
}

impl VideoData {
    pub fn new(time: RationalTime, image: Arc<Image>) -> Self {
        Self { time, layers: vec![VideoLayer::solid(image)] }
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn byte_count(&self) -> usize {
        self.layers.iter().map(|l| l.byte_count()).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AudioLayer {
    pub audio: Option<Arc<Audio>>,
}

/// A decoded block of samples starting at a time
#[derive(Debug, Clone, Default)]
pub struct AudioData {
    pub time: RationalTime,
    pub layers: Vec<AudioLayer>,
}

impl AudioData {
    pub fn new(time: RationalTime, audio: Arc<Audio>) -> Self {
        Self { time, layers: vec![AudioLayer { audio: Some(audio) }] }
    }

    pub fn byte_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.audio.as_ref().map(|a| a.byte_count()).unwrap_or(0))
            .sum()
    }
}

/// One-shot async result handle.
///
/// Producers hold the [`Completion`] half; dropping it without completing
/// (a skipped epoch, a drained queue) disconnects the channel and the
/// consumer observes `Err(Cancelled)`. The tick thread only ever calls
/// `poll`, which never blocks.
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

/// Producer half of a [`Pending`]
#[derive(Debug)]
pub struct Completion<T> {
    tx: Sender<Result<T>>,
}

impl<T> Completion<T> {
    pub fn complete(self, result: Result<T>) {
        // the consumer may already have given up; that is fine
        let _ = self.tx.send(result);
    }
}

/// Create a linked producer/consumer pair
pub fn pending<T>() -> (Completion<T>, Pending<T>) {
    let (tx, rx) = bounded(1);
    (Completion { tx }, Pending { rx })
}

impl<T> Pending<T> {
    /// An already-resolved handle
    pub fn ready(result: Result<T>) -> Self {
        let (completion, pending) = pending();
        completion.complete(result);
        pending
    }

    /// Non-blocking check; `Some` consumes the result
    pub fn poll(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::Cancelled)),
        }
    }

    /// Blocking wait, for construction paths only. The tick thread never
    /// calls this.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                Err(Error::OpenFailed(format!("timed out after {:?}", timeout)))
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Error::Cancelled),
        }
    }
}

/// A plugin bound to one media source
pub trait Reader: Send {
    /// Probe the source. Resolves within [`OPEN_TIMEOUT`] or fails.
    fn info(&mut self) -> Pending<ReaderInfo>;

    /// Decode the frame covering `time`
    fn read_video(&mut self, time: RationalTime, options: &Options) -> Pending<VideoData>;

    /// Decode samples covering `range`
    fn read_audio(&mut self, _range: TimeRange, _options: &Options) -> Pending<AudioData> {
        Pending::ready(Err(Error::InvalidArgument(
            "source has no audio".into(),
        )))
    }

    /// Resolve every in-flight request as `Cancelled`. Safe to destroy the
    /// reader afterwards.
    fn cancel_requests(&mut self);
}

/// A plugin writing frames in presentation order
pub trait Writer: Send {
    /// Frames must arrive in presentation order; anything else is
    /// `InvalidOrder`.
    fn write_video(&mut self, time: RationalTime, image: &Image) -> Result<()>;
}

/// A media format handler
pub trait IoPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn extensions(&self) -> &[&str];
    fn file_type(&self) -> FileType;

    fn read(&self, path: &Path, options: &Options) -> Result<Box<dyn Reader>>;

    /// Nearest `ImageInfo` this plugin can write for `info`, or `None`
    /// when it cannot write at all
    fn write_info(&self, _info: &ImageInfo, _options: &Options) -> Option<ImageInfo> {
        None
    }

    fn write(
        &self,
        _path: &Path,
        _info: &ImageInfo,
        _options: &Options,
    ) -> Result<Box<dyn Writer>> {
        Err(Error::InvalidArgument(format!(
            "'{}' does not support writing",
            self.name()
        )))
    }
}

/// Deterministic identity of a (path, options) pair; cache keys and the
/// reader pool both hang off it
pub fn source_fingerprint(path: &str, options: &Options) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    for (k, v) in options {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    hasher.finish()
}

/// Ordered plugin list with extension dispatch
pub struct Registry {
    plugins: Vec<Arc<dyn IoPlugin>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    pub fn add(&mut self, plugin: Arc<dyn IoPlugin>) {
        debug!(
            "registered io plugin '{}' ({:?})",
            plugin.name(),
            plugin.extensions()
        );
        self.plugins.push(plugin);
    }

    /// First plugin claiming the path's extension
    pub fn plugin_for(&self, path: &Path) -> Option<Arc<dyn IoPlugin>> {
        let ext = path.extension();
        self.plugins
            .iter()
            .find(|p| p.extensions().contains(&ext.as_str()))
            .cloned()
    }

    pub fn plugin_named(&self, name: &str) -> Option<Arc<dyn IoPlugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn read(&self, path: &Path, options: &Options) -> Result<Box<dyn Reader>> {
        let plugin = self.plugin_for(path).ok_or_else(|| {
            Error::OpenFailed(format!("no plugin for '{}'", path.full()))
        })?;
        plugin.read(path, options)
    }

    pub fn write(
        &self,
        path: &Path,
        info: &ImageInfo,
        options: &Options,
    ) -> Result<Box<dyn Writer>> {
        let plugin = self.plugin_for(path).ok_or_else(|| {
            Error::OpenFailed(format!("no plugin for '{}'", path.full()))
        })?;
        plugin.write(path, info, options)
    }

    /// Negotiated write format for the target path
    pub fn write_info(
        &self,
        path: &Path,
        info: &ImageInfo,
        options: &Options,
    ) -> Option<ImageInfo> {
        self.plugin_for(path)?.write_info(info, options)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

struct PooledReader {
    reader: Box<dyn Reader>,
    info: Option<ReaderInfo>,
    last_used: Instant,
}

/// One live reader per (path, options), capped and idle-closed.
///
/// The cap bounds open file handles and decoder threads; eviction of the
/// least recently used reader cancels its requests first.
pub struct ReaderPool {
    registry: Arc<Registry>,
    readers: Mutex<lru::LruCache<u64, PooledReader>>,
    idle_timeout: Duration,
}

impl ReaderPool {
    pub fn new(registry: Arc<Registry>, capacity: usize, idle_timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            readers: Mutex::new(lru::LruCache::new(capacity)),
            idle_timeout,
        }
    }

    /// Run `f` against the pooled reader for (path, options), opening one
    /// on first demand. The reader evicted by the insertion (if any) has
    /// its requests cancelled before it drops.
    pub fn with_reader<R>(
        &self,
        path: &Path,
        options: &Options,
        f: impl FnOnce(&mut dyn Reader, &mut Option<ReaderInfo>) -> R,
    ) -> Result<R> {
        let key = source_fingerprint(&path.full(), options);
        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());

        if !readers.contains(&key) {
            let reader = self.registry.read(path, options)?;
            debug!("reader pool: opened '{}'", path.full());
            if let Some((_, mut evicted)) = readers.push(
                key,
                PooledReader { reader, info: None, last_used: Instant::now() },
            ) {
                evicted.reader.cancel_requests();
                debug!("reader pool: evicted least recently used reader");
            }
        }

        let pooled = readers.get_mut(&key).ok_or_else(|| {
            Error::ResourceExhausted("reader pool lost a just-opened reader".into())
        })?;
        pooled.last_used = Instant::now();
        Ok(f(pooled.reader.as_mut(), &mut pooled.info))
    }

    /// Cancel requests on the reader for (path, options), if pooled
    pub fn cancel(&self, path: &Path, options: &Options) {
        let key = source_fingerprint(&path.full(), options);
        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pooled) = readers.get_mut(&key) {
            pooled.reader.cancel_requests();
        }
    }

    /// Cancel requests on every pooled reader
    pub fn cancel_all(&self) {
        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, pooled) in readers.iter_mut() {
            pooled.reader.cancel_requests();
        }
    }

    /// Close readers idle past the timeout
    pub fn close_idle(&self) {
        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let stale: Vec<u64> = readers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_used) > self.idle_timeout)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(mut pooled) = readers.pop(&key) {
                pooled.reader.cancel_requests();
                debug!("reader pool: closed idle reader");
            }
        }
    }

    /// Cancel and drop everything
    pub fn clear(&self) {
        let mut readers = self.readers.lock().unwrap_or_else(|e| e.into_inner());
        if readers.len() > 0 {
            warn!("reader pool: dropping {} open readers", readers.len());
        }
        for (_, pooled) in readers.iter_mut() {
            pooled.reader.cancel_requests();
        }
        readers.clear();
    }

    pub fn len(&self) -> usize {
        self.readers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
