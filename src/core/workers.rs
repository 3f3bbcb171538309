//! Decoder thread pool
//!
//! **Why**: Image sequence reads are embarrassingly parallel; a
//! work-stealing pool keeps every core busy and lets fresh requests
//! overtake stale ones. The epoch counter cancels work that a seek has
//! made pointless before a worker picks it up.
//!
//! **Used by**: sequence/audio readers, thumbnail service

use crossbeam::deque::{Injector, Worker};
use log::{error, trace};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Work-stealing pool with epoch-based cancellation.
///
/// Jobs land in a global injector; idle workers drain it before stealing
/// from each other, so newly submitted work runs first and old scrubbing
/// leftovers age out at the back of the deques.
pub struct Workers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    current_epoch: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl Workers {
    pub fn new(num_threads: usize) -> Self {
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut locals: Vec<Worker<Job>> = Vec::new();
        let mut stealers = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..num_threads {
            let worker: Worker<Job> = Worker::new_fifo();
            stealers.push(worker.stealer());
            locals.push(worker);
        }

        for (worker_id, worker) in locals.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let stealers = stealers.clone();

            let handle = thread::Builder::new()
                .name(format!("reela-io-{}", worker_id))
                .spawn(move || {
                    trace!("io worker {} started", worker_id);

                    loop {
                        // own queue first, then the injector, then steal
                        let job = worker
                            .pop()
                            .or_else(|| injector.steal().success())
                            .or_else(|| stealers.iter().find_map(|s| s.steal().success()));

                        if let Some(job) = job {
                            // a panicking decode must not take the worker down
                            let result = std::panic::catch_unwind(
                                std::panic::AssertUnwindSafe(job),
                            );
                            if let Err(e) = result {
                                error!("io worker {} job panicked: {:?}", worker_id, e);
                            }
                            continue;
                        }

                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        // idle; 1ms sleep instead of a pure yield to keep CPU low
                        thread::sleep(std::time::Duration::from_millis(1));
                    }

                    trace!("io worker {} stopped", worker_id);
                })
                .expect("Failed to spawn io worker thread");

            handles.push(handle);
        }

        trace!("Workers initialized: {} threads (work-stealing)", num_threads);

        Self { injector, handles, current_epoch: Arc::new(AtomicU64::new(0)), shutdown }
    }

    /// Enqueue a job unconditionally.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.injector.push(Box::new(f));
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    /// Invalidate all jobs enqueued under earlier epochs.
    pub fn bump_epoch(&self) -> u64 {
        self.current_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enqueue a job that runs only if `epoch` is still current when a
    /// worker picks it up. A skipped job is simply dropped, so any channel
    /// sender it owns disconnects and the waiting side observes
    /// cancellation.
    pub fn execute_with_epoch<F>(&self, epoch: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current_epoch = Arc::clone(&self.current_epoch);
        let wrapped = move || {
            if current_epoch.load(Ordering::Relaxed) == epoch {
                f();
            }
        };
        self.injector.push(Box::new(wrapped));
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        use std::time::{Duration, Instant};

        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);

        // bounded wait; decode jobs already running may outlive it and die
        // with the process
        let deadline = Instant::now() + Duration::from_millis(500);

        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Worker shutdown timeout reached, exiting anyway");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} io workers stopped", num_threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_jobs_run() {
        let workers = Workers::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            workers.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 16 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_stale_epoch_skipped() {
        let workers = Workers::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        // park the worker so submissions queue up behind it
        let gate = Arc::new(AtomicBool::new(false));
        {
            let gate = Arc::clone(&gate);
            workers.execute(move || {
                while !gate.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            });
        }

        let stale = workers.current_epoch();
        {
            let counter = Arc::clone(&counter);
            workers.execute_with_epoch(stale, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        workers.bump_epoch();
        {
            let counter = Arc::clone(&counter);
            workers.execute_with_epoch(workers.current_epoch(), move || {
                counter.fetch_add(10, Ordering::SeqCst);
            });
        }
        gate.store(true, Ordering::SeqCst);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        // only the current-epoch job ran
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let workers = Workers::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        workers.execute(|| panic!("boom"));
        {
            let counter = Arc::clone(&counter);
            workers.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
