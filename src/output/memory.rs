// In-memory output backend
//
// Records everything written to it instead of encoding. Built for the test
// suites: every write is kept until the backend is dropped. Call
// `set_retain_planes(false)` to keep only timing for long runs. A
// `MemoryBackendHandle` shares the backend's state so a test can inject
// faults, trigger asynchronous stops and watch the backend's activity on a
// channel while the recorder owns the backend itself. The channel exists only
// once `events` has been called.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::video::{FrameRate, PlaneMut};

use super::{
    AudioBinding, AudioMixInfo, OutputBackend, OutputError, OutputSettings, OutputStopCode,
    RecordingOutput, Result, StopNotifier, VideoOutputInfo, VideoSink,
};

/// Destination rows are padded to this many bytes so that source and
/// destination line sizes usually differ
pub const ROW_ALIGN: usize = 32;

/// Activity reported by the memory backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    VideoOpened(VideoOutputInfo),
    OutputCreated(OutputSettings),
    /// The output created just before was bound to the host audio mix
    AudioBound(AudioBinding),
    OutputStarted,
    FrameWritten { count: u32, timestamp_ns: u64 },
    OutputForceStopped,
    /// The output halted by itself (see `MemoryBackendHandle::stop_output`)
    OutputStopped(OutputStopCode),
    VideoClosed,
}

/// One `write_frame` call as the backend saw it. `planes` is empty when
/// plane retention is off.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenFrame {
    pub count: u32,
    pub timestamp_ns: u64,
    pub planes: Vec<Vec<u8>>,
    pub linesize: Vec<usize>,
}

#[derive(Default)]
struct MemoryState {
    fail_open: bool,
    fail_create: bool,
    fail_start: bool,
    fail_write: bool,
    /// Drop pixel data after each write, keeping only count and timestamp
    discard_planes: bool,
    write_delay: Option<Duration>,
    opened: Vec<VideoOutputInfo>,
    created: Vec<OutputSettings>,
    audio_bindings: Vec<Option<AudioBinding>>,
    written: Vec<WrittenFrame>,
    live_outputs: usize,
    live_videos: usize,
    /// Notifier of the most recently created output
    notifier: Option<StopNotifier>,
    events: Option<(Sender<BackendEvent>, Receiver<BackendEvent>)>,
}

impl MemoryState {
    fn emit(&self, event: BackendEvent) {
        if let Some((tx, _)) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Shared view of a `MemoryBackend`
#[derive(Clone)]
pub struct MemoryBackendHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackendHandle {
    fn emit(&self, event: BackendEvent) {
        self.state.lock().emit(event);
    }

    /// Reject every following `open_video`
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Reject every following `create_output`
    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    /// Make every following `RecordingOutput::start` fail
    pub fn set_fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    /// Make every following `write_frame` fail
    pub fn set_fail_write(&self, fail: bool) {
        self.state.lock().fail_write = fail;
    }

    /// Sleep this long inside each `write_frame` (a slow encoder)
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.state.lock().write_delay = delay;
    }

    /// Keep the pixel data of every write (the default). Turn off for long
    /// runs that only check timing.
    pub fn set_retain_planes(&self, retain: bool) {
        self.state.lock().discard_planes = !retain;
    }

    /// Stream of backend activity from this call on. Every call returns a
    /// receiver on the same channel, so events go to whichever receiver takes
    /// them first.
    pub fn events(&self) -> Receiver<BackendEvent> {
        let mut state = self.state.lock();
        let (_, rx) = state.events.get_or_insert_with(unbounded);
        rx.clone()
    }

    pub fn opened_streams(&self) -> Vec<VideoOutputInfo> {
        self.state.lock().opened.clone()
    }

    pub fn created_outputs(&self) -> Vec<OutputSettings> {
        self.state.lock().created.clone()
    }

    /// Audio binding of each created output, in creation order
    pub fn audio_bindings(&self) -> Vec<Option<AudioBinding>> {
        self.state.lock().audio_bindings.clone()
    }

    pub fn written_frames(&self) -> Vec<WrittenFrame> {
        self.state.lock().written.clone()
    }

    /// Total slots covered by all writes so far
    pub fn slots_written(&self) -> u64 {
        self.state.lock().written.iter().map(|w| w.count as u64).sum()
    }

    /// Outputs created and not yet released
    pub fn live_outputs(&self) -> usize {
        self.state.lock().live_outputs
    }

    /// Video streams opened and not yet closed
    pub fn live_videos(&self) -> usize {
        self.state.lock().live_videos
    }

    /// Simulate the latest output halting by itself with `code`
    pub fn stop_output(&self, code: OutputStopCode) {
        let notifier = {
            let state = self.state.lock();
            state.emit(BackendEvent::OutputStopped(code));
            state.notifier.clone()
        };
        match notifier {
            Some(notifier) => notifier.notify(code),
            None => log::warn!("memory backend: no output to stop"),
        }
    }
}

/// Output backend that keeps every written frame in memory
pub struct MemoryBackend {
    frame_rate: FrameRate,
    host_audio: Option<AudioMixInfo>,
    handle: MemoryBackendHandle,
}

impl MemoryBackend {
    pub fn new(frame_rate: FrameRate) -> Self {
        Self {
            frame_rate,
            host_audio: None,
            handle: MemoryBackendHandle {
                state: Arc::new(Mutex::new(MemoryState::default())),
            },
        }
    }

    /// Expose a host audio mix so outputs get bound to it
    pub fn with_host_audio(mut self, mix: AudioMixInfo) -> Self {
        self.host_audio = Some(mix);
        self
    }

    pub fn handle(&self) -> MemoryBackendHandle {
        self.handle.clone()
    }
}

pub struct MemoryVideo {
    info: VideoOutputInfo,
    handle: MemoryBackendHandle,
    closed: bool,
}

impl VideoSink for MemoryVideo {
    fn info(&self) -> &VideoOutputInfo {
        &self.info
    }

    fn is_stopped(&self) -> bool {
        self.closed
    }

    fn write_frame(
        &mut self,
        count: u32,
        timestamp_ns: u64,
        fill: &mut dyn FnMut(&mut [PlaneMut<'_>]),
    ) -> Result<()> {
        let delay = {
            let state = self.handle.state.lock();
            if state.fail_write {
                return Err(OutputError::Write("memory backend refused the frame".into()));
            }
            state.write_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let format = self.info.format;
        let mut linesize = Vec::with_capacity(format.plane_count());
        let mut planes = Vec::with_capacity(format.plane_count());
        for plane in 0..format.plane_count() {
            let ls = format
                .plane_min_linesize(plane, self.info.width)
                .next_multiple_of(ROW_ALIGN);
            planes.push(vec![0u8; ls * format.plane_rows(plane, self.info.height)]);
            linesize.push(ls);
        }

        {
            let mut views: Vec<PlaneMut<'_>> = planes
                .iter_mut()
                .zip(&linesize)
                .map(|(data, &ls)| PlaneMut::new(data.as_mut_slice(), ls))
                .collect();
            fill(&mut views);
        }

        let mut state = self.handle.state.lock();
        if state.discard_planes {
            planes = Vec::new();
        }
        state.written.push(WrittenFrame {
            count,
            timestamp_ns,
            planes,
            linesize,
        });
        state.emit(BackendEvent::FrameWritten { count, timestamp_ns });
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.handle.state.lock();
        state.live_videos -= 1;
        state.emit(BackendEvent::VideoClosed);
    }
}

impl Drop for MemoryVideo {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct MemoryOutput {
    handle: MemoryBackendHandle,
}

impl RecordingOutput for MemoryOutput {
    fn start(&mut self) -> Result<()> {
        let state = self.handle.state.lock();
        if state.fail_start {
            return Err(OutputError::OutputStart("memory backend refused to start".into()));
        }
        state.emit(BackendEvent::OutputStarted);
        Ok(())
    }

    fn force_stop(&mut self) {
        self.handle.emit(BackendEvent::OutputForceStopped);
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        self.handle.state.lock().live_outputs -= 1;
    }
}

impl OutputBackend for MemoryBackend {
    type Video = MemoryVideo;
    type Output = MemoryOutput;

    fn host_frame_rate(&self) -> FrameRate {
        self.frame_rate
    }

    fn host_audio(&self) -> Option<AudioMixInfo> {
        self.host_audio
    }

    fn open_video(&mut self, info: &VideoOutputInfo) -> Result<MemoryVideo> {
        {
            let mut state = self.handle.state.lock();
            if state.fail_open {
                return Err(OutputError::StreamOpen(format!(
                    "memory backend rejected {}x{} {:?}",
                    info.width, info.height, info.format
                )));
            }
            state.opened.push(info.clone());
            state.live_videos += 1;
            state.emit(BackendEvent::VideoOpened(info.clone()));
        }
        Ok(MemoryVideo {
            info: info.clone(),
            handle: self.handle.clone(),
            closed: false,
        })
    }

    fn create_output(
        &mut self,
        settings: &OutputSettings,
        _video: &mut MemoryVideo,
        audio: Option<&AudioBinding>,
        stop: StopNotifier,
    ) -> Result<MemoryOutput> {
        {
            let mut state = self.handle.state.lock();
            if state.fail_create {
                return Err(OutputError::OutputCreate(format!(
                    "memory backend cannot write to {}",
                    settings.path.display()
                )));
            }
            state.created.push(settings.clone());
            state.audio_bindings.push(audio.copied());
            state.live_outputs += 1;
            state.notifier = Some(stop);
            state.emit(BackendEvent::OutputCreated(settings.clone()));
            if let Some(binding) = audio {
                state.emit(BackendEvent::AudioBound(*binding));
            }
        }
        Ok(MemoryOutput {
            handle: self.handle.clone(),
        })
    }
}
