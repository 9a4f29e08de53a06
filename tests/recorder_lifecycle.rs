// End-to-end recorder behaviour against the in-memory backend

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use asrec::output::memory::{
    BackendEvent, MemoryBackend, MemoryBackendHandle, MemoryOutput, MemoryVideo,
};
use asrec::output::{AudioBinding, AudioMixInfo, OutputBackend, OutputError, VideoOutputInfo};
use asrec::recording::{AsyncRecorder, FrameClock, RecordState, RecorderOptions};
use asrec::{
    Frame, FrameRate, OutputSettings, OutputStopCode, RecordConfig, SharedFrame, StopNotifier,
    VideoFormat,
};

const RATE: FrameRate = FrameRate::new(30, 1);
const T: u64 = 1_000_000_000;

fn d() -> u64 {
    RATE.frame_interval_ns()
}

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> RecordConfig {
    RecordConfig {
        directory: PathBuf::from("/recordings"),
        ..RecordConfig::default()
    }
}

fn frame(ts: u64) -> Frame {
    let mut f = Frame::new(VideoFormat::I420, 16, 8).with_timestamp(ts);
    f.fill((ts / d() % 251) as u8);
    f
}

fn start(enabled: bool, config: RecordConfig) -> (AsyncRecorder, MemoryBackendHandle) {
    init();
    let backend = MemoryBackend::new(RATE);
    let handle = backend.handle();
    let recorder = AsyncRecorder::with_options(
        backend,
        config,
        RecorderOptions {
            name: "test-source".into(),
            enabled,
            ..RecorderOptions::default()
        },
    )
    .unwrap();
    (recorder, handle)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(2));
    }
}

fn wait_for_event(
    events: &crossbeam_channel::Receiver<BackendEvent>,
    mut wanted: impl FnMut(&BackendEvent) -> bool,
) -> BackendEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) if wanted(&event) => return event,
            Ok(_) => continue,
            Err(e) => panic!("no matching backend event: {}", e),
        }
    }
}

fn assert_fully_stopped(recorder: &AsyncRecorder, handle: &MemoryBackendHandle) {
    assert_eq!(recorder.state(), RecordState::Idle);
    assert_eq!(recorder.queued_frames(), 0);
    assert_eq!(handle.live_outputs(), 0);
    assert_eq!(handle.live_videos(), 0);
}

#[test]
fn test_steady_source_one_slot_per_frame() {
    let (mut recorder, handle) = start(true, config());
    for i in 0..30 {
        recorder.on_frame_arrived(&frame(T + i * d()));
    }

    wait_until("30 slots", || handle.slots_written() == 30);
    let written = handle.written_frames();
    assert_eq!(written.len(), 30);
    assert!(written.iter().all(|w| w.count == 1));
    assert_eq!(written[0].timestamp_ns, T);
    assert_eq!(written[29].timestamp_ns, T + 29 * d());

    let stats = recorder.stats();
    assert_eq!(stats.frames_received, 30);
    assert_eq!(stats.slots_emitted, 30);
    assert_eq!(stats.slots_duplicated, 0);
    assert_eq!(stats.sessions_started, 1);

    recorder.shutdown();
    assert_fully_stopped(&recorder, &handle);
}

#[test]
fn test_stream_described_from_first_frame() {
    let (mut recorder, handle) = start(true, config());
    let first = Frame::new(VideoFormat::Nv12, 320, 180)
        .with_timestamp(T)
        .with_full_range(true);
    recorder.on_frame_arrived(&first);

    wait_until("stream open", || !handle.opened_streams().is_empty());
    let info = &handle.opened_streams()[0];
    assert_eq!((info.width, info.height, info.format), (320, 180, VideoFormat::Nv12));
    assert_eq!(info.frame_rate, RATE);
    assert_eq!(info.cache_size, 16);
    assert_eq!(info.name, "test-source");

    wait_until("output created", || !handle.created_outputs().is_empty());
    let settings = &handle.created_outputs()[0];
    assert!(settings.path.starts_with("/recordings"));
    assert_eq!(settings.path.extension().and_then(|e| e.to_str()), Some("mkv"));
    assert_eq!(settings.video_bitrate_kbps, 2500);

    recorder.shutdown();
}

#[test]
fn test_stall_duplicates_then_resumes() {
    let (mut recorder, handle) = start(true, config());
    for i in 0..10 {
        recorder.on_frame_arrived(&frame(T + i * d()));
    }
    let last = T + 9 * d();
    recorder.on_frame_arrived(&frame(last + 5 * d()));
    recorder.on_frame_arrived(&frame(last + 6 * d()));

    wait_until("12 writes", || handle.written_frames().len() == 12);
    let written = handle.written_frames();
    assert_eq!(written[10].count, 5);
    assert_eq!(written[10].timestamp_ns, last + 5 * d());
    assert_eq!(written[11].count, 1);

    let stats = recorder.stats();
    assert_eq!(stats.slots_emitted, 16);
    assert_eq!(stats.slots_duplicated, 4);
    recorder.shutdown();
}

#[test]
fn test_early_frames_dropped() {
    let (mut recorder, handle) = start(true, config());
    recorder.on_frame_arrived(&frame(T));
    recorder.on_frame_arrived(&frame(T + d() / 3));
    recorder.on_frame_arrived(&frame(T - d()));
    recorder.on_frame_arrived(&frame(T + d()));

    wait_until("two writes", || handle.written_frames().len() == 2);
    wait_until("drops counted", || recorder.stats().frames_dropped == 2);
    assert_eq!(handle.written_frames()[1].timestamp_ns, T + d());
    recorder.shutdown();
}

#[test]
fn test_disable_mid_stream_discards_backlog() {
    let (mut recorder, handle) = start(true, config());
    let events = handle.events();
    handle.set_write_delay(Some(Duration::from_millis(40)));

    let mut held: Vec<Weak<Frame>> = Vec::new();
    for i in 0..8 {
        let f: SharedFrame = Arc::new(frame(T + i * d()));
        held.push(Arc::downgrade(&f));
        recorder.on_shared_frame(f);
    }
    wait_for_event(&events, |e| matches!(e, BackendEvent::FrameWritten { .. }));
    assert!(recorder.queued_frames() >= 5);

    recorder.set_enabled(false);
    wait_until("session closed", || {
        recorder.state() == RecordState::Idle && handle.live_outputs() == 0
    });
    assert_eq!(recorder.queued_frames(), 0);
    assert_eq!(handle.live_videos(), 0);
    assert!(held.iter().all(|w| w.upgrade().is_none()));

    let writes = handle.written_frames().len();
    assert!(writes < 8);
    recorder.on_frame_arrived(&frame(T + 20 * d()));
    sleep(Duration::from_millis(50));
    assert_eq!(handle.written_frames().len(), writes);
    assert_eq!(recorder.queued_frames(), 0);
    assert!(recorder.stats().frames_discarded > 0);

    recorder.shutdown();
}

#[test]
fn test_reenable_starts_fresh_session() {
    let (mut recorder, handle) = start(false, config());
    recorder.on_frame_arrived(&frame(T));
    sleep(Duration::from_millis(20));
    assert!(handle.opened_streams().is_empty());

    recorder.set_enabled(true);
    recorder.on_frame_arrived(&frame(T + 100 * d()));
    wait_until("first write", || handle.written_frames().len() == 1);

    recorder.set_enabled(false);
    wait_until("closed", || handle.live_outputs() == 0);
    recorder.set_enabled(true);
    // First frame of a new session emits one slot however far away it is
    recorder.on_frame_arrived(&frame(T + 500 * d()));
    wait_until("second write", || handle.written_frames().len() == 2);
    let second = &handle.written_frames()[1];
    assert_eq!(second.count, 1);
    assert_eq!(second.timestamp_ns, T + 500 * d());
    assert_eq!(handle.opened_streams().len(), 2);
    recorder.shutdown();
}

#[test]
fn test_start_failure_is_gated() {
    let (mut recorder, handle) = start(true, config());
    handle.set_fail_create(true);

    recorder.on_frame_arrived(&frame(T));
    wait_until("failed", || recorder.is_failed());
    assert_eq!(handle.opened_streams().len(), 1);

    handle.set_fail_create(false);
    for i in 1..20 {
        recorder.on_frame_arrived(&frame(T + i * d()));
    }
    sleep(Duration::from_millis(50));
    assert_eq!(handle.opened_streams().len(), 1, "retried without a settings change");
    assert_eq!(handle.live_videos(), 0);
    assert_eq!(recorder.stats().sessions_failed, 1);
    assert!(matches!(recorder.last_error(), Some(OutputError::OutputCreate(_))));

    recorder.set_enabled(false);
    recorder.set_enabled(true);
    assert!(!recorder.is_failed());
    recorder.on_frame_arrived(&frame(T + 50 * d()));
    wait_until("retry after re-enable", || handle.written_frames().len() == 1);
    assert_eq!(handle.opened_streams().len(), 2);
    recorder.shutdown();
}

#[test]
fn test_unchanged_destination_keeps_failure() {
    let (mut recorder, handle) = start(true, config());
    handle.set_fail_start(true);
    recorder.on_frame_arrived(&frame(T));
    wait_until("failed", || recorder.is_failed());
    handle.set_fail_start(false);

    let mut same_destination = config();
    same_destination.video_bitrate_kbps = 9000;
    same_destination.overwrite_timestamp = true;
    recorder.update_config(same_destination);
    assert!(recorder.is_failed());

    let mut moved = config();
    moved.directory = PathBuf::from("/recordings/elsewhere");
    recorder.update_config(moved);
    assert!(!recorder.is_failed());

    recorder.on_frame_arrived(&frame(T + d()));
    wait_until("restarted", || recorder.stats().sessions_started == 1);
    let created = handle.created_outputs();
    assert!(created.last().unwrap().path.starts_with("/recordings/elsewhere"));
    recorder.shutdown();
}

#[test]
fn test_destination_change_restarts_and_keeps_backlog() {
    let (mut recorder, handle) = start(true, config());
    let events = handle.events();
    recorder.on_frame_arrived(&frame(T));
    wait_for_event(&events, |e| matches!(e, BackendEvent::FrameWritten { .. }));

    let mut mp4 = config();
    mp4.extension = "mp4".into();
    recorder.update_config(mp4);
    wait_for_event(&events, |e| matches!(e, BackendEvent::OutputForceStopped));

    recorder.on_frame_arrived(&frame(T + d()));
    let created = match wait_for_event(&events, |e| matches!(e, BackendEvent::OutputCreated(_))) {
        BackendEvent::OutputCreated(settings) => settings,
        _ => unreachable!(),
    };
    assert_eq!(created.path.extension().and_then(|e| e.to_str()), Some("mp4"));
    wait_until("written into new session", || handle.written_frames().len() == 2);
    assert_eq!(recorder.stats().sessions_started, 2);
    recorder.shutdown();
}

/// Memory backend whose first `create_output` blocks until released and then
/// fails, so settings can change while the worker is inside the call
struct StalledCreateBackend {
    inner: MemoryBackend,
    entered: Sender<PathBuf>,
    release: Receiver<()>,
    stalled: bool,
}

impl OutputBackend for StalledCreateBackend {
    type Video = MemoryVideo;
    type Output = MemoryOutput;

    fn host_frame_rate(&self) -> FrameRate {
        self.inner.host_frame_rate()
    }

    fn open_video(&mut self, info: &VideoOutputInfo) -> asrec::output::Result<MemoryVideo> {
        self.inner.open_video(info)
    }

    fn create_output(
        &mut self,
        settings: &OutputSettings,
        video: &mut MemoryVideo,
        audio: Option<&AudioBinding>,
        stop: StopNotifier,
    ) -> asrec::output::Result<MemoryOutput> {
        if std::mem::take(&mut self.stalled) {
            let _ = self.entered.send(settings.path.clone());
            let _ = self.release.recv();
            return Err(OutputError::OutputCreate(format!(
                "cannot write to {}",
                settings.path.display()
            )));
        }
        self.inner.create_output(settings, video, audio, stop)
    }
}

#[test]
fn test_destination_change_during_failing_create_retries() {
    init();
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let memory = MemoryBackend::new(RATE);
    let handle = memory.handle();
    let backend = StalledCreateBackend {
        inner: memory,
        entered: entered_tx,
        release: release_rx,
        stalled: true,
    };

    let mut bad = config();
    bad.directory = PathBuf::from("/bad");
    let mut recorder = AsyncRecorder::with_options(
        backend,
        bad,
        RecorderOptions {
            name: "stalled-create".into(),
            ..RecorderOptions::default()
        },
    )
    .unwrap();

    recorder.on_frame_arrived(&frame(T));
    let first_path = entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(first_path.starts_with("/bad"));

    let mut good = config();
    good.directory = PathBuf::from("/good");
    recorder.update_config(good);
    release_tx.send(()).unwrap();
    for i in 1..20 {
        recorder.on_frame_arrived(&frame(T + i * d()));
    }

    wait_until("all slots in the new destination", || handle.slots_written() == 20);
    let created = handle.created_outputs();
    assert_eq!(created.len(), 1);
    assert!(created[0].path.starts_with("/good"));
    assert!(!recorder.is_failed());

    let stats = recorder.stats();
    assert_eq!(stats.sessions_failed, 1);
    assert_eq!(stats.sessions_started, 1);
    recorder.shutdown();
    assert_fully_stopped(&recorder, &handle);
}

#[test]
fn test_output_bound_to_host_audio() {
    init();
    let mix = AudioMixInfo { sample_rate: 48_000, channels: 2 };
    let backend = MemoryBackend::new(RATE).with_host_audio(mix);
    let handle = backend.handle();
    let events = handle.events();

    let mut two_tracks = config();
    two_tracks.audio_mixers = 2;
    two_tracks.audio_bitrate_kbps = 192;
    let mut recorder = AsyncRecorder::new(backend, two_tracks).unwrap();
    recorder.on_frame_arrived(&frame(T));

    wait_for_event(&events, |e| matches!(e, BackendEvent::OutputCreated(_)));
    let expected = AudioBinding { mix, tracks: 2, bitrate_kbps: 192 };
    let next = || events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(next(), BackendEvent::AudioBound(expected));
    assert_eq!(next(), BackendEvent::OutputStarted);
    assert_eq!(handle.audio_bindings(), vec![Some(expected)]);

    // No tracks requested: video only
    let mut silent = config();
    silent.audio_mixers = 0;
    silent.directory = PathBuf::from("/silent");
    recorder.update_config(silent);
    recorder.on_frame_arrived(&frame(T + d()));
    wait_until("second output", || handle.created_outputs().len() == 2);
    assert_eq!(handle.audio_bindings()[1], None);
    recorder.shutdown();
}

#[test]
fn test_async_error_stop_marks_failed() {
    let (mut recorder, handle) = start(true, config());
    recorder.on_frame_arrived(&frame(T));
    wait_until("running", || recorder.state() == RecordState::Running);

    handle.stop_output(OutputStopCode::NoSpace);
    wait_until("failed", || recorder.is_failed());
    assert!(matches!(
        recorder.last_error(),
        Some(OutputError::AsyncStop(OutputStopCode::NoSpace))
    ));
    wait_until("closed", || handle.live_outputs() == 0 && handle.live_videos() == 0);

    recorder.on_frame_arrived(&frame(T + d()));
    sleep(Duration::from_millis(50));
    assert_eq!(handle.created_outputs().len(), 1);
    assert_eq!(recorder.state(), RecordState::Idle);
    recorder.shutdown();
}

#[test]
fn test_async_success_stop_restarts() {
    let (mut recorder, handle) = start(true, config());
    let events = handle.events();
    recorder.on_frame_arrived(&frame(T));
    wait_until("running", || recorder.state() == RecordState::Running);

    handle.stop_output(OutputStopCode::Success);
    wait_for_event(&events, |e| matches!(e, BackendEvent::VideoClosed));
    assert!(!recorder.is_failed());

    recorder.on_frame_arrived(&frame(T + d()));
    wait_until("second session", || recorder.stats().sessions_started == 2);
    recorder.shutdown();

    let seen: Vec<BackendEvent> = events.try_iter().collect();
    // The self-stopped output is never force-stopped, only the second one
    assert_eq!(
        seen.iter().filter(|e| matches!(e, BackendEvent::OutputForceStopped)).count(),
        1
    );
}

struct StepClock(AtomicU64);

impl FrameClock for StepClock {
    fn now_ns(&self) -> u64 {
        self.0.fetch_add(RATE.frame_interval_ns(), Ordering::Relaxed)
    }
}

#[test]
fn test_overwrite_timestamp_uses_host_clock() {
    init();
    let backend = MemoryBackend::new(RATE);
    let handle = backend.handle();
    let mut config = config();
    config.overwrite_timestamp = true;
    let mut recorder = AsyncRecorder::with_options(
        backend,
        config,
        RecorderOptions {
            name: "clocked".into(),
            enabled: true,
            clock: Arc::new(StepClock(AtomicU64::new(T))),
        },
    )
    .unwrap();

    // Source timestamps are garbage, the host clock paces the recording
    for _ in 0..5 {
        recorder.on_frame_arrived(&frame(42));
    }
    wait_until("five slots", || handle.slots_written() == 5);
    let stamps: Vec<u64> = handle.written_frames().iter().map(|w| w.timestamp_ns).collect();
    assert_eq!(stamps, (0..5).map(|i| T + i * d()).collect::<Vec<_>>());
    recorder.shutdown();
}

#[test]
fn test_zero_timestamp_replaced() {
    let (mut recorder, handle) = start(true, config());
    recorder.on_frame_arrived(&frame(0));
    wait_until("written", || handle.written_frames().len() == 1);
    assert_ne!(handle.written_frames()[0].timestamp_ns, 0);
    recorder.shutdown();
}

#[test]
fn test_producer_not_blocked_by_slow_output() {
    let (mut recorder, handle) = start(true, config());
    handle.set_write_delay(Some(Duration::from_millis(100)));

    let started = Instant::now();
    for i in 0..10 {
        recorder.on_frame_arrived(&frame(T + i * d()));
    }
    assert!(started.elapsed() < Duration::from_millis(500));
    recorder.shutdown();
}

#[test]
fn test_shutdown_from_every_state() {
    // Idle and disabled
    let (mut recorder, handle) = start(false, config());
    recorder.shutdown();
    assert_fully_stopped(&recorder, &handle);

    // Starting, waiting for a first frame
    let (mut recorder, handle) = start(true, config());
    wait_until("starting", || recorder.state() == RecordState::Starting);
    recorder.shutdown();
    assert_fully_stopped(&recorder, &handle);

    // Running with a backlog behind a slow output
    let (mut recorder, handle) = start(true, config());
    handle.set_write_delay(Some(Duration::from_millis(20)));
    let mut held = Vec::new();
    for i in 0..20 {
        let f: SharedFrame = Arc::new(frame(T + i * d()));
        held.push(Arc::downgrade(&f));
        recorder.on_shared_frame(f);
    }
    wait_until("running", || recorder.state() == RecordState::Running);
    recorder.shutdown();
    assert_fully_stopped(&recorder, &handle);
    assert!(held.iter().all(|w| w.upgrade().is_none()));
    assert!(recorder.stats().frames_discarded > 0);

    // Failed
    let (mut recorder, handle) = start(true, config());
    handle.set_fail_open(true);
    recorder.on_frame_arrived(&frame(T));
    wait_until("failed", || recorder.is_failed());
    recorder.shutdown();
    assert_fully_stopped(&recorder, &handle);
}

#[test]
fn test_request_close_then_drop() {
    let (recorder, handle) = start(true, config());
    recorder.on_frame_arrived(&frame(T));
    wait_until("running", || handle.live_outputs() == 1);

    recorder.request_close();
    recorder.on_frame_arrived(&frame(T + d()));
    assert_eq!(recorder.queued_frames(), 0);
    drop(recorder);
    assert_eq!(handle.live_outputs(), 0);
    assert_eq!(handle.live_videos(), 0);
}

#[test]
fn test_shared_frames_have_other_holders() {
    let (mut recorder, handle) = start(true, config());
    let preview: SharedFrame = Arc::new(frame(T));
    recorder.on_shared_frame(preview.clone());
    wait_until("written", || handle.written_frames().len() == 1);
    wait_until("released by recorder", || Arc::strong_count(&preview) == 1);
    recorder.shutdown();
    assert_eq!(preview.timestamp_ns, T);
}
