//! Shared engine context: logging, decoder pool, plugin registry, reader
//! pool, and frame cache behind one explicit handle
//!
//! **Why**: process-wide singletons make multi-engine hosts and tests
//! miserable. Everything with global flavor lives here instead, so two
//! players with independent budgets can coexist in one process.
//!
//! **Used by**: Player, Pipeline, Timeline loading, thumbnail service

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::core::cache::FrameCache;
use crate::core::workers::Workers;
use crate::io::{self, Registry, ReaderPool};

/// Tunables fixed at context creation.
///
/// Serializable so hosts can persist them alongside their own settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Decoder pool size; 0 = one thread per logical CPU
    pub worker_threads: usize,
    /// Cache byte budget; `None` derives one from available memory
    pub cache_byte_budget: Option<usize>,
    /// Fraction of available memory used when the budget is derived
    pub cache_memory_fraction: f64,
    /// Memory left to the system when the budget is derived (GB)
    pub cache_reserve_gb: f64,
    /// Open readers kept alive at once
    pub reader_capacity: usize,
    /// Idle readers older than this are closed
    pub reader_idle_timeout_secs: u64,
    /// Derive playback time from audio samples played instead of the
    /// steady clock while unmuted audio is present
    pub audio_master: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            worker_threads: 16,
            cache_byte_budget: None,
            cache_memory_fraction: 0.5,
            cache_reserve_gb: 2.0,
            reader_capacity: 16,
            reader_idle_timeout_secs: 30,
            audio_master: false,
        }
    }
}

/// Engine-wide services shared by players.
///
/// Construction wires the decoder pool into every sequence plugin and
/// sizes the cache; the handle is cheap to clone behind an `Arc`.
pub struct Context {
    options: ContextOptions,
    workers: Arc<Workers>,
    registry: Arc<Registry>,
    readers: ReaderPool,
    cache: Arc<FrameCache>,
}

impl Context {
    pub fn new(options: ContextOptions) -> Self {
        let threads = if options.worker_threads == 0 {
            num_cpus::get()
        } else {
            options.worker_threads
        };
        let workers = Arc::new(Workers::new(threads));

        let mut registry = Registry::new();
        registry.add(io::png::plugin(Arc::clone(&workers)));
        registry.add(io::jpeg::plugin(Arc::clone(&workers)));
        registry.add(io::tiff::plugin(Arc::clone(&workers)));
        registry.add(io::ppm::plugin(Arc::clone(&workers)));
        registry.add(io::exr::plugin(Arc::clone(&workers)));
        registry.add(io::sgi::plugin(Arc::clone(&workers)));
        registry.add(io::cineon::plugin(Arc::clone(&workers)));
        registry.add(io::dpx::plugin(Arc::clone(&workers)));
        registry.add(io::movie::plugin());
        registry.add(io::wav::plugin(Arc::clone(&workers)));
        let registry = Arc::new(registry);

        let cache = match options.cache_byte_budget {
            Some(bytes) => Arc::new(FrameCache::new(bytes)),
            None => Arc::new(FrameCache::with_system_budget(
                options.cache_memory_fraction,
                options.cache_reserve_gb,
            )),
        };

        let readers = ReaderPool::new(
            Arc::clone(&registry),
            options.reader_capacity,
            Duration::from_secs(options.reader_idle_timeout_secs),
        );

        info!(
            "Context created: {} io threads, {} plugins, cache budget {} MB",
            threads,
            registry.len(),
            cache.max_bytes() / 1024 / 1024
        );

        Self { options, workers, registry, readers, cache }
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn workers(&self) -> &Arc<Workers> {
        &self.workers
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn readers(&self) -> &ReaderPool {
        &self.readers
    }

    pub fn cache(&self) -> &Arc<FrameCache> {
        &self.cache
    }

    pub fn audio_master(&self) -> bool {
        self.options.audio_master
    }

    /// Console logging with the given verbosity (respects `RUST_LOG` if
    /// set). Safe to call more than once; later calls are no-ops.
    pub fn init_logging(verbosity: u8) {
        let default_level = match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        let _ = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(default_level),
        )
        .format_timestamp_millis()
        .try_init();
        debug!("Logging initialized (default level: {})", default_level);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(ContextOptions::default())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.readers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_options() -> ContextOptions {
        ContextOptions {
            worker_threads: 2,
            cache_byte_budget: Some(8 * 1024 * 1024),
            ..ContextOptions::default()
        }
    }

    #[test]
    fn test_default_plugins_resolve_extensions() {
        let ctx = Context::new(small_options());
        for (file, plugin) in [
            ("shot.0001.png", "png"),
            ("shot.0001.exr", "exr"),
            ("shot.0001.dpx", "dpx"),
            ("shot.0001.cin", "cineon"),
            ("shot.0001.sgi", "sgi"),
            ("clip.gif", "movie"),
            ("mix.wav", "wav"),
        ] {
            let path = crate::path::Path::parse(file);
            let found = ctx.registry().plugin_for(&path);
            assert_eq!(found.map(|p| p.name().to_string()).as_deref(), Some(plugin));
        }
    }

    #[test]
    fn test_explicit_cache_budget() {
        let ctx = Context::new(small_options());
        assert_eq!(ctx.cache().max_bytes(), 8 * 1024 * 1024);
    }

    #[test]
    fn test_zero_worker_threads_means_auto() {
        let options = ContextOptions { worker_threads: 0, ..small_options() };
        let ctx = Context::new(options);
        assert!(ctx.workers().thread_count() >= 1);
    }

    #[test]
    fn test_options_round_trip_json() {
        let options = small_options();
        let json = serde_json::to_string_pretty(&options).unwrap();
        let back: ContextOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.worker_threads, 2);
        assert_eq!(back.cache_byte_budget, Some(8 * 1024 * 1024));
    }

    #[test]
    fn test_init_logging_idempotent() {
        Context::init_logging(1);
        Context::init_logging(2);
    }
}
