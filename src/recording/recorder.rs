// Async recorder: host-facing surface
//
// The host calls `on_frame_arrived` from its video thread for every frame and
// the control methods from wherever its settings UI lives. All encoding work
// happens on the recorder's own worker thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::config::RecordConfig;
use crate::output::{OutputBackend, OutputError};
use crate::video::{Frame, SharedFrame};

use super::state::{Inner, RecordState, RecorderStats};
use super::worker;

/// Error type for recorder construction
#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Source of host timestamps for `overwrite_timestamp`
pub trait FrameClock: Send + Sync {
    /// Current host time in nanoseconds. Must be non-zero and monotonic.
    fn now_ns(&self) -> u64;
}

/// `Instant`-based clock counting from its creation
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        // Offset by one so the clock never reads as "no timestamp"
        (self.origin.elapsed().as_nanos() as u64).saturating_add(1)
    }
}

/// Construction options for `AsyncRecorder`
pub struct RecorderOptions {
    /// Name used in log lines and the worker thread name
    pub name: String,
    /// Initial state of the recording toggle
    pub enabled: bool,
    pub clock: Arc<dyn FrameClock>,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            name: "asrec".to_string(),
            enabled: true,
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

/// Records a live frame source through an `OutputBackend` on a worker thread
pub struct AsyncRecorder {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
    clock: Arc<dyn FrameClock>,
}

impl AsyncRecorder {
    pub fn new<B: OutputBackend>(backend: B, config: RecordConfig) -> Result<Self, RecordingError> {
        Self::with_options(backend, config, RecorderOptions::default())
    }

    pub fn with_options<B: OutputBackend>(
        backend: B,
        config: RecordConfig,
        options: RecorderOptions,
    ) -> Result<Self, RecordingError> {
        let RecorderOptions {
            name,
            enabled,
            clock,
        } = options;

        log::info!(
            "{}: created, directory={} enabled={}",
            name,
            config.directory.display(),
            enabled
        );

        let inner = Arc::new(Inner::new(name.clone(), config, enabled));
        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name(format!("{}-worker", name))
            .spawn(move || worker::run(worker_inner, backend))?;

        Ok(Self {
            inner,
            worker: Some(worker),
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Frame callback. Copies the frame into the queue when recording and
    /// hands it back untouched so the host pipeline carries on with it.
    pub fn on_frame_arrived<'a>(&self, frame: &'a Frame) -> &'a Frame {
        if !self.inner.is_accepting() || frame.is_empty() {
            return frame;
        }

        let mut copy = frame.clone();
        if let Some(ts) = self.replacement_timestamp(copy.timestamp_ns) {
            copy.timestamp_ns = ts;
        }
        self.enqueue(Arc::new(copy));
        frame
    }

    /// Enqueue a frame the host already shares, without copying its pixels
    /// unless the timestamp has to be rewritten while other holders exist.
    pub fn on_shared_frame(&self, mut frame: SharedFrame) {
        if !self.inner.is_accepting() || frame.is_empty() {
            return;
        }

        if let Some(ts) = self.replacement_timestamp(frame.timestamp_ns) {
            Arc::make_mut(&mut frame).timestamp_ns = ts;
        }
        self.enqueue(frame);
    }

    fn replacement_timestamp(&self, timestamp_ns: u64) -> Option<u64> {
        if timestamp_ns == 0 || self.inner.overwrite_timestamp.load(Ordering::Relaxed) {
            Some(self.clock.now_ns())
        } else {
            None
        }
    }

    fn enqueue(&self, frame: SharedFrame) {
        let mut shared = self.inner.shared.lock();
        // Re-check under the lock: the toggle may have flipped since the fast path
        if !shared.recording || shared.closing {
            return;
        }
        shared.queue.push(frame);
        shared.stats.frames_received += 1;
        self.inner.cond.notify_all();
    }

    /// Turn recording on or off. Enabling throws away any stale backlog and
    /// clears a previous failure.
    pub fn set_enabled(&self, enabled: bool) {
        let mut shared = self.inner.shared.lock();
        if shared.recording == enabled {
            return;
        }

        shared.recording = enabled;
        if enabled {
            let discarded = shared.discard_queue();
            if discarded > 0 {
                log::debug!("{}: discarded {} stale frames", self.inner.name, discarded);
            }
            shared.failed = false;
        }
        self.inner.sync_accepting(&shared);
        log::info!(
            "{}: recording {}",
            self.inner.name,
            if enabled { "enabled" } else { "disabled" }
        );
        self.inner.cond.notify_all();
    }

    /// Replace the configuration. A new destination clears a previous failure
    /// and restarts a live recording; every other field applies in place.
    pub fn update_config(&self, config: RecordConfig) {
        let mut shared = self.inner.shared.lock();
        if shared.config.destination_differs(&config) {
            log::info!(
                "{}: destination changed to {}",
                self.inner.name,
                config.directory.display()
            );
            shared.failed = false;
            shared.need_restart = true;
        }
        self.inner
            .overwrite_timestamp
            .store(config.overwrite_timestamp, Ordering::Relaxed);
        shared.config = config;
        self.inner.cond.notify_all();
    }

    /// Ask the worker to stop and exit without waiting for it. Buffered frames
    /// are released immediately and no new frames are accepted.
    pub fn request_close(&self) {
        let mut shared = self.inner.shared.lock();
        if !shared.closing {
            log::info!("{}: closing", self.inner.name);
        }
        shared.closing = true;
        self.inner.sync_accepting(&shared);
        shared.discard_queue();
        self.inner.cond.notify_all();
    }

    /// Stop recording and wait for the worker thread to exit
    pub fn shutdown(&mut self) {
        self.request_close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{}: worker thread panicked", self.inner.name);
            }
        }
    }

    pub fn state(&self) -> RecordState {
        self.inner.shared.lock().state
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.shared.lock().recording
    }

    pub fn is_failed(&self) -> bool {
        self.inner.shared.lock().failed
    }

    /// The most recent open, start or asynchronous stop error
    pub fn last_error(&self) -> Option<OutputError> {
        self.inner.shared.lock().last_error.clone()
    }

    pub fn queued_frames(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    pub fn stats(&self) -> RecorderStats {
        self.inner.shared.lock().stats.clone()
    }

    pub fn config(&self) -> RecordConfig {
        self.inner.shared.lock().config.clone()
    }
}

impl Drop for AsyncRecorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}
