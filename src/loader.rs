//! `AsyncLoader`: a fixed-size worker pool draining a FIFO of read
//! requests into caller-owned destination buffers.

use std::collections::{HashMap as StdHashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use typed_builder::TypedBuilder;

use crate::log::{emit, FacadeLogSink, LogSink, Severity};

use sync::lock;

const BANDWIDTH_WINDOW: usize = 32;

/// A pointer/length pair into a page's pixel buffer, handed to a worker
/// thread for the duration of one read.
///
/// # Safety
/// The caller must guarantee the pointed-to memory stays valid and is
/// not concurrently accessed by anyone else for as long as the request
/// is outstanding — for the engine, this is the page pin taken before
/// [`AsyncLoader::read_async`] is called.
pub struct DestBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the caller of `DestBuffer::new` upholds exclusive access for the
// lifetime of the request; the pointer itself carries no thread affinity.
unsafe impl Send for DestBuffer {}

impl DestBuffer {
    /// # Safety
    /// `ptr` must be valid for `len` bytes of exclusive access until the
    /// request completes.
    #[must_use]
    pub const unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: validity guaranteed by the constructor's contract.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// One outstanding read, built with [`TypedBuilder`] the way
/// multi-field, mostly-defaulted structs are built elsewhere in this
/// crate's configuration types.
#[derive(TypedBuilder)]
pub struct ReadRequest {
    pub file_path: PathBuf,
    pub offset: u64,
    pub size: usize,
    pub dest: DestBuffer,
    #[builder(default, setter(strip_option))]
    pub on_complete: Option<Box<dyn FnOnce(bool, usize) + Send>>,
}

struct Job {
    id: u64,
    request: ReadRequest,
}

#[derive(Clone, Copy)]
enum Slot {
    Pending,
    Done(bool),
}

struct Shared {
    queue: sync::Mutex<VecDeque<Job>>,
    queue_cv: sync::Condvar,
    active: sync::Mutex<StdHashMap<u64, Slot>>,
    completion_cv: sync::Condvar,
    shutting_down: AtomicBool,
    next_id: AtomicU64,
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    total_bytes: AtomicU64,
    bandwidth_window: sync::Mutex<VecDeque<(u64, Duration)>>,
    log: Arc<dyn LogSink>,
}

/// Snapshot of the loader's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoaderStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub total_bytes: u64,
    pub avg_bandwidth_mb_s: f64,
}

/// A pool of worker threads servicing [`ReadRequest`]s submitted via
/// [`read_async`](AsyncLoader::read_async).
pub struct AsyncLoader {
    shared: Arc<Shared>,
    workers: sync::Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::with_log_sink(Arc::new(FacadeLogSink))
    }

    #[must_use]
    pub fn with_log_sink(log: Arc<dyn LogSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: sync::Mutex::new(VecDeque::new()),
                queue_cv: sync::Condvar::new(),
                active: sync::Mutex::new(StdHashMap::new()),
                completion_cv: sync::Condvar::new(),
                shutting_down: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                total: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                total_bytes: AtomicU64::new(0),
                bandwidth_window: sync::Mutex::new(VecDeque::with_capacity(BANDWIDTH_WINDOW)),
                log,
            }),
            workers: sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawns `num_workers` threads named `vtpe-loader-{n}`. Idempotent:
    /// a second call with workers already running is a no-op.
    pub fn init(&self, num_workers: usize) {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return;
        }
        for n in 0..num_workers {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("vtpe-loader-{n}"))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn loader worker thread");
            workers.push(handle);
        }
    }

    /// Enqueues `request` and wakes one idle worker. Returns the
    /// monotonically increasing ID assigned to it.
    pub fn read_async(&self, request: ReadRequest) -> u64 {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.total.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.active).insert(id, Slot::Pending);
        lock(&self.shared.queue).push_back(Job { id, request });
        self.shared.queue_cv.notify_one();
        id
    }

    /// Blocks until `request_id` completes, returning its success status.
    /// An ID that no longer appears in the active set (already observed
    /// and retired by a prior `wait`/`is_complete`) is treated as
    /// successfully complete.
    pub fn wait(&self, request_id: u64) -> bool {
        let mut active = lock(&self.shared.active);
        loop {
            match active.get(&request_id) {
                Some(Slot::Done(ok)) => {
                    let ok = *ok;
                    active.remove(&request_id);
                    return ok;
                }
                Some(Slot::Pending) => {
                    active = match self.shared.completion_cv.wait(active) {
                        Ok(g) => g,
                        Err(p) => p.into_inner(),
                    };
                }
                None => return true,
            }
        }
    }

    /// Blocks until no request remains pending.
    pub fn wait_all(&self) {
        let mut active = lock(&self.shared.active);
        loop {
            if !active.values().any(|s| matches!(s, Slot::Pending)) {
                return;
            }
            active = match self.shared.completion_cv.wait(active) {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
        }
    }

    /// Non-blocking completion check. An untracked ID is reported
    /// complete, matching [`wait`](Self::wait)'s convention.
    #[must_use]
    pub fn is_complete(&self, request_id: u64) -> bool {
        match lock(&self.shared.active).get(&request_id) {
            Some(Slot::Pending) => false,
            Some(Slot::Done(_)) | None => true,
        }
    }

    #[must_use]
    pub fn stats(&self) -> LoaderStats {
        let pending = lock(&self.shared.active)
            .values()
            .filter(|s| matches!(s, Slot::Pending))
            .count() as u64;
        let avg_bandwidth_mb_s = {
            let window = lock(&self.shared.bandwidth_window);
            let total_bytes: u64 = window.iter().map(|(b, _)| b).sum();
            let total_secs: f64 = window.iter().map(|(_, d)| d.as_secs_f64()).sum();
            if total_secs > 0.0 {
                (total_bytes as f64 / (1024.0 * 1024.0)) / total_secs
            } else {
                0.0
            }
        };
        LoaderStats {
            total: self.shared.total.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            pending,
            total_bytes: self.shared.total_bytes.load(Ordering::Relaxed),
            avg_bandwidth_mb_s,
        }
    }

    /// Signals every worker, joins them, and drains all pending and
    /// in-flight bookkeeping.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.queue_cv.notify_all();
        let handles = std::mem::take(&mut *lock(&self.workers));
        for handle in handles {
            let _ = handle.join();
        }
        lock(&self.shared.queue).clear();
        lock(&self.shared.active).clear();
        self.shared.shutting_down.store(false, Ordering::Release);
    }
}

impl Default for AsyncLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(shared: &Arc<Shared>) {
    loop {
        let job = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.shutting_down.load(Ordering::Acquire) {
                    break None;
                }
                queue = match shared.queue_cv.wait(queue) {
                    Ok(g) => g,
                    Err(p) => p.into_inner(),
                };
            }
        };

        let Some(job) = job else {
            return;
        };

        run_job(shared, job);
    }
}

fn run_job(shared: &Arc<Shared>, job: Job) {
    let Job { id, mut request } = job;
    let started = Instant::now();

    let outcome = File::open(&request.file_path).and_then(|mut file| {
        file.seek(SeekFrom::Start(request.offset))?;
        let dest = request.dest.as_mut_slice();
        let want = request.size.min(dest.len());
        let mut read_total = 0usize;
        while read_total < want {
            match file.read(&mut dest[read_total..want]) {
                Ok(0) => break,
                Ok(n) => read_total += n,
                Err(e) => return Err(e),
            }
        }
        Ok(read_total)
    });

    let (success, bytes_read) = match outcome {
        Ok(n) => (n == request.size, n),
        Err(e) => {
            emit!(
                shared.log,
                "IO",
                Severity::Warning,
                "read of {} failed: {e}",
                request.file_path.display()
            );
            (false, 0)
        }
    };

    let elapsed = started.elapsed();

    if success {
        shared.completed.fetch_add(1, Ordering::Relaxed);
    } else {
        shared.failed.fetch_add(1, Ordering::Relaxed);
    }
    shared
        .total_bytes
        .fetch_add(bytes_read as u64, Ordering::Relaxed);

    {
        let mut window = lock(&shared.bandwidth_window);
        if window.len() == BANDWIDTH_WINDOW {
            window.pop_front();
        }
        window.push_back((bytes_read as u64, elapsed));
    }

    if let Some(on_complete) = request.on_complete.take() {
        on_complete(success, bytes_read);
    }

    lock(&shared.active).insert(id, Slot::Done(success));
    shared.completion_cv.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    fn temp_file(contents: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "vtpe-loader-test-{:?}-{}",
            std::thread::current().id(),
            contents.len()
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn reads_full_payload_into_dest() {
        let data = vec![0xABu8; 256];
        let path = temp_file(&data);

        let loader = AsyncLoader::new();
        loader.init(2);

        let mut buf = vec![0u8; 256];
        let dest = unsafe { DestBuffer::new(buf.as_mut_ptr(), buf.len()) };
        let request = ReadRequest::builder()
            .file_path(path.clone())
            .offset(0)
            .size(256)
            .dest(dest)
            .build();
        let id = loader.read_async(request);
        assert!(loader.wait(id));

        loader.shutdown();
        std::fs::remove_file(&path).ok();
        assert_eq!(buf, data);
    }

    #[test]
    fn partial_read_reports_failure() {
        let data = vec![0x11u8; 64];
        let path = temp_file(&data);

        let loader = AsyncLoader::new();
        loader.init(1);

        let mut buf = vec![0u8; 256];
        let dest = unsafe { DestBuffer::new(buf.as_mut_ptr(), buf.len()) };
        let request = ReadRequest::builder()
            .file_path(path.clone())
            .offset(0)
            .size(256)
            .dest(dest)
            .build();
        let id = loader.read_async(request);
        assert!(!loader.wait(id));

        loader.shutdown();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn on_complete_callback_fires() {
        let data = vec![0x22u8; 32];
        let path = temp_file(&data);

        let loader = AsyncLoader::new();
        loader.init(1);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let mut buf = vec![0u8; 32];
        let dest = unsafe { DestBuffer::new(buf.as_mut_ptr(), buf.len()) };
        let request = ReadRequest::builder()
            .file_path(path.clone())
            .offset(0)
            .size(32)
            .dest(dest)
            .on_complete(Box::new(move |ok, n| {
                if ok {
                    seen_clone.store(n, Ordering::SeqCst);
                }
            }))
            .build();
        let id = loader.read_async(request);
        loader.wait_all();
        assert!(loader.is_complete(id));

        loader.shutdown();
        std::fs::remove_file(&path).ok();
        assert_eq!(seen.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn stats_reflect_completed_requests() {
        let data = vec![0x33u8; 128];
        let path = temp_file(&data);

        let loader = AsyncLoader::new();
        loader.init(2);

        let mut buf = vec![0u8; 128];
        let dest = unsafe { DestBuffer::new(buf.as_mut_ptr(), buf.len()) };
        let request = ReadRequest::builder()
            .file_path(path.clone())
            .offset(0)
            .size(128)
            .dest(dest)
            .build();
        let id = loader.read_async(request);
        loader.wait(id);

        let stats = loader.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total_bytes, 128);

        loader.shutdown();
        std::fs::remove_file(&path).ok();
    }
}
