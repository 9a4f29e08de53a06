// State shared between the control surface, the producer and the worker
//
// Everything here is guarded by one mutex and one condition variable. Any
// change that could let the worker make progress (a pushed frame, a flag flip,
// a stop report from the backend) is followed by a notify.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::config::RecordConfig;
use crate::output::{OutputError, StopEvent, StopEventSink};

use super::queue::FrameQueue;

/// Lifecycle state of the recorder worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// No session, waiting for work
    Idle,
    /// Building a session from the first queued frame
    Starting,
    /// Draining the queue into the session
    Running,
    /// Tearing the session down
    Stopping,
}

/// Counters exposed to the host for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderStats {
    /// Frames accepted into the queue
    pub frames_received: u64,
    /// Queued frames thrown away without being recorded
    pub frames_discarded: u64,
    /// Frames dropped because they arrived before the next slot was due
    pub frames_dropped: u64,
    /// Frames written into a session
    pub frames_written: u64,
    /// Output slots filled, including duplicates
    pub slots_emitted: u64,
    /// Slots filled by repeating a frame to cover a stall
    pub slots_duplicated: u64,
    /// Frames the video stream refused or was unavailable for
    pub write_failures: u64,
    pub sessions_started: u64,
    pub sessions_failed: u64,
}

/// Why the worker left the running state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Shutdown,
    Disabled,
    Restart,
    OutputStopped,
}

impl StopReason {
    /// Buffered frames are only kept across a restart
    pub(crate) fn discards_backlog(&self) -> bool {
        matches!(self, StopReason::Shutdown | StopReason::Disabled)
    }
}

pub(crate) struct Shared {
    pub state: RecordState,
    /// Desired on/off from the host toggle
    pub recording: bool,
    /// Terminal close requested
    pub closing: bool,
    /// Destination changed while a session was live
    pub need_restart: bool,
    /// The last output attempt errored. Cleared by a destination change or an
    /// enable transition only.
    pub failed: bool,
    /// The live session's output halted on its own
    pub output_stopped: bool,
    pub queue: FrameQueue,
    pub config: RecordConfig,
    /// Stop reports not yet applied by the worker
    pub stop_events: Vec<StopEvent>,
    /// Generation of the session currently open, if any
    pub live_generation: Option<u64>,
    pub next_generation: u64,
    pub stats: RecorderStats,
    /// Most recent output error, kept for the host after the session is gone
    pub last_error: Option<OutputError>,
}

impl Shared {
    pub fn new(config: RecordConfig, recording: bool) -> Self {
        Self {
            state: RecordState::Idle,
            recording,
            closing: false,
            need_restart: false,
            failed: false,
            output_stopped: false,
            queue: FrameQueue::new(),
            config,
            stop_events: Vec::new(),
            live_generation: None,
            next_generation: 1,
            stats: RecorderStats::default(),
            last_error: None,
        }
    }

    /// Fold pending stop reports into the flags. Reports for sessions that
    /// are no longer open are discarded.
    pub fn apply_stop_events(&mut self, name: &str) {
        for event in std::mem::take(&mut self.stop_events) {
            if self.live_generation != Some(event.generation) {
                log::debug!(
                    "{}: ignoring stop report for closed session #{}",
                    name,
                    event.generation
                );
                continue;
            }
            if !event.code.is_success() {
                let error = OutputError::AsyncStop(event.code);
                log::warn!("{}: {}", name, error);
                self.failed = true;
                self.stats.sessions_failed += 1;
                self.last_error = Some(error);
            } else {
                log::info!("{}: output stopped", name);
            }
            self.output_stopped = true;
        }
    }

    /// Reason to leave the running state, checked in priority order
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.closing {
            Some(StopReason::Shutdown)
        } else if !self.recording {
            Some(StopReason::Disabled)
        } else if self.need_restart {
            Some(StopReason::Restart)
        } else if self.output_stopped {
            Some(StopReason::OutputStopped)
        } else {
            None
        }
    }

    /// Whether the idle loop may begin a new session
    pub fn can_start(&self) -> bool {
        self.recording && !self.closing && !self.failed
    }

    pub fn discard_queue(&mut self) -> usize {
        let discarded = self.queue.drain_and_discard();
        self.stats.frames_discarded += discarded as u64;
        discarded
    }
}

/// Lock, condition variable and the lock-free mirrors read by the producer
pub(crate) struct Inner {
    pub name: String,
    pub shared: Mutex<Shared>,
    pub cond: Condvar,
    /// Mirror of `recording && !closing` for the producer's fast path
    pub accepting: AtomicBool,
    /// Mirror of `config.overwrite_timestamp`
    pub overwrite_timestamp: AtomicBool,
}

impl Inner {
    pub fn new(name: String, config: RecordConfig, recording: bool) -> Self {
        let overwrite = config.overwrite_timestamp;
        Self {
            name,
            shared: Mutex::new(Shared::new(config, recording)),
            cond: Condvar::new(),
            accepting: AtomicBool::new(recording),
            overwrite_timestamp: AtomicBool::new(overwrite),
        }
    }

    /// Recompute the producer mirror. Call with the lock held.
    pub fn sync_accepting(&self, shared: &Shared) {
        self.accepting
            .store(shared.recording && !shared.closing, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

impl StopEventSink for Inner {
    fn deliver(&self, event: StopEvent) {
        let mut shared = self.shared.lock();
        shared.stop_events.push(event);
        self.cond.notify_all();
    }
}
