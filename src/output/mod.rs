// Output backend contract
//
// The recorder never encodes anything itself. It describes a fixed-rate video
// stream, asks a backend to open it, creates a recording output bound to that
// stream and the host's audio mix, and pushes resampled frames into it.
// Backends report asynchronous stops through a `StopNotifier`.
//
// To add a new backend:
// 1. Implement `VideoSink` for the backend's video stream handle
// 2. Implement `RecordingOutput` for the backend's recording handle
// 3. Implement `OutputBackend` tying both together, returning the host mix
//    from `host_audio` if the backend has one
// 4. Call `StopNotifier::notify` whenever the output halts on its own

pub mod filename;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod memory;

use std::path::PathBuf;
use std::sync::Weak;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::RecordConfig;
use crate::video::{ColorRange, FrameRate, PlaneMut, VideoFormat};

/// Error type for output operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutputError {
    /// The backend rejected the video stream description
    #[error("Failed to open video stream: {0}")]
    StreamOpen(String),

    /// The recording output could not be created (bad path, unknown codec, ...)
    #[error("Failed to create output: {0}")]
    OutputCreate(String),

    /// The recording output was created but refused to start
    #[error("Failed to start output: {0}")]
    OutputStart(String),

    /// The backend stopped the output on its own with an error code
    #[error("Output stopped with error: {0}")]
    AsyncStop(OutputStopCode),

    /// A frame could not be written into the video stream
    #[error("Failed to write frame: {0}")]
    Write(String),
}

pub type Result<T> = std::result::Result<T, OutputError>;

/// Result code reported when an output halts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStopCode {
    Success,
    BadPath,
    ConnectFailed,
    InvalidStream,
    Error,
    Disconnected,
    Unsupported,
    NoSpace,
    EncodeError,
}

impl OutputStopCode {
    /// Map a numeric backend code (0 = success, negative = failure)
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => OutputStopCode::Success,
            -1 => OutputStopCode::BadPath,
            -2 => OutputStopCode::ConnectFailed,
            -3 => OutputStopCode::InvalidStream,
            -5 => OutputStopCode::Disconnected,
            -6 => OutputStopCode::Unsupported,
            -7 => OutputStopCode::NoSpace,
            -8 => OutputStopCode::EncodeError,
            _ => OutputStopCode::Error,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            OutputStopCode::Success => 0,
            OutputStopCode::BadPath => -1,
            OutputStopCode::ConnectFailed => -2,
            OutputStopCode::InvalidStream => -3,
            OutputStopCode::Error => -4,
            OutputStopCode::Disconnected => -5,
            OutputStopCode::Unsupported => -6,
            OutputStopCode::NoSpace => -7,
            OutputStopCode::EncodeError => -8,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == OutputStopCode::Success
    }
}

impl std::fmt::Display for OutputStopCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (code={})", self, self.code())
    }
}

/// Description of the fixed-rate video stream a session records into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoOutputInfo {
    pub name: String,
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    /// Number of frames the backend may keep queued
    pub cache_size: usize,
    pub color_range: ColorRange,
}

impl VideoOutputInfo {
    pub fn frame_interval_ns(&self) -> u64 {
        self.frame_rate.frame_interval_ns()
    }
}

/// Format of the host's mixed audio as the backend exposes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMixInfo {
    pub sample_rate: u32,
    pub channels: u32,
}

/// How a recording output is bound to the host audio mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioBinding {
    pub mix: AudioMixInfo,
    /// Number of audio tracks recorded from the mix
    pub tracks: u32,
    pub bitrate_kbps: u32,
}

impl AudioBinding {
    /// Bind `mix` using the effective `mixers` and `audio_bitrate` values.
    /// `None` when the backend has no mix or no track is requested.
    pub fn for_output(settings: &OutputSettings, mix: Option<AudioMixInfo>) -> Option<Self> {
        let mix = mix?;
        let tracks = settings
            .get_i64("mixers")
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(settings.mixers);
        if tracks == 0 {
            return None;
        }
        let bitrate_kbps = settings
            .get_i64("audio_bitrate")
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(settings.audio_bitrate_kbps);
        Some(Self {
            mix,
            tracks,
            bitrate_kbps,
        })
    }
}

/// Settings handed to the backend when creating a recording output
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    /// Destination file
    pub path: PathBuf,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    /// Number of host audio mixes bound to the output
    pub mixers: u32,
    /// Backend-specific overrides, applied on top of the keys above
    pub overrides: Map<String, Value>,
}

impl OutputSettings {
    /// Build settings from a config snapshot, generating the filename at `now`
    pub fn from_config(config: &RecordConfig, now: &NaiveDateTime) -> Self {
        let path = filename::make_filename(
            &config.directory,
            &config.filename_format,
            &config.extension,
            now,
        );
        Self {
            path,
            video_bitrate_kbps: config.video_bitrate_kbps,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            mixers: config.audio_mixers,
            overrides: config.output_settings.clone(),
        }
    }

    /// Flatten into a single key/value map. Overrides win.
    pub fn to_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("url".into(), Value::String(self.path.to_string_lossy().to_string()));
        data.insert("video_bitrate".into(), Value::from(self.video_bitrate_kbps));
        data.insert("audio_bitrate".into(), Value::from(self.audio_bitrate_kbps));
        data.insert("mixers".into(), Value::from(self.mixers));
        for (key, value) in &self.overrides {
            data.insert(key.clone(), value.clone());
        }
        data
    }

    /// Effective integer value of `key` after overrides
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.to_data().get(key).and_then(Value::as_i64)
    }

    /// Effective string value of `key` after overrides
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.to_data()
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// A halt report from the backend, tagged with the session it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopEvent {
    pub generation: u64,
    pub code: OutputStopCode,
}

/// Receiver side of stop notifications (implemented by the recorder)
pub trait StopEventSink: Send + Sync {
    fn deliver(&self, event: StopEvent);
}

/// Handed to the backend when an output is created. Call `notify` from any
/// thread when the output halts; the event is queued for the worker.
#[derive(Clone)]
pub struct StopNotifier {
    sink: Option<Weak<dyn StopEventSink>>,
    generation: u64,
}

impl StopNotifier {
    pub fn new(sink: Weak<dyn StopEventSink>, generation: u64) -> Self {
        Self {
            sink: Some(sink),
            generation,
        }
    }

    /// A notifier connected to nothing
    pub fn detached() -> Self {
        Self {
            sink: None,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn notify(&self, code: OutputStopCode) {
        let Some(sink) = self.sink.as_ref().and_then(Weak::upgrade) else {
            log::debug!("Stop notification {} dropped: recorder is gone", code);
            return;
        };
        sink.deliver(StopEvent {
            generation: self.generation,
            code,
        });
    }
}

impl std::fmt::Debug for StopNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopNotifier")
            .field("generation", &self.generation)
            .field("connected", &self.sink.is_some())
            .finish()
    }
}

/// An opened fixed-rate video stream
pub trait VideoSink: Send {
    fn info(&self) -> &VideoOutputInfo;

    /// Nominal duration of one output slot in nanoseconds
    fn frame_interval_ns(&self) -> u64 {
        self.info().frame_interval_ns()
    }

    /// Whether the stream can no longer accept frames
    fn is_stopped(&self) -> bool {
        false
    }

    /// Lock `count` consecutive slots ending at `timestamp_ns`, let `fill`
    /// write the pixel data into the destination planes, then commit.
    fn write_frame(
        &mut self,
        count: u32,
        timestamp_ns: u64,
        fill: &mut dyn FnMut(&mut [PlaneMut<'_>]),
    ) -> Result<()>;

    /// Release the stream. Must tolerate being called more than once.
    fn close(&mut self);
}

/// A recording destination bound to a video sink and the host audio mix
pub trait RecordingOutput: Send {
    fn start(&mut self) -> Result<()>;

    /// Stop immediately without waiting for the encoder to drain
    fn force_stop(&mut self);
}

/// Factory for video sinks and recording outputs
pub trait OutputBackend: Send + 'static {
    type Video: VideoSink;
    type Output: RecordingOutput;

    /// Frame rate the host pipeline renders at
    fn host_frame_rate(&self) -> FrameRate;

    /// The host's audio mix, if the backend can record one
    fn host_audio(&self) -> Option<AudioMixInfo> {
        None
    }

    fn open_video(&mut self, info: &VideoOutputInfo) -> Result<Self::Video>;

    /// Create an output recording `video` and, when `audio` is given, the
    /// host mix it describes
    fn create_output(
        &mut self,
        settings: &OutputSettings,
        video: &mut Self::Video,
        audio: Option<&AudioBinding>,
        stop: StopNotifier,
    ) -> Result<Self::Output>;
}
