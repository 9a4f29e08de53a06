// asrec - Asynchronous source recorder
// Library entry point
//
// A host video pipeline hands frames to an `AsyncRecorder` as they arrive. The
// recorder queues them, resamples their timestamps onto the host's fixed frame
// rate and writes them into a recording output on its own worker thread.

pub mod config;
#[cfg(feature = "gstreamer")]
pub mod gstreamer_init;
pub mod output;
pub mod recording;
pub mod video;

pub use config::{ConfigError, RecordConfig};
pub use output::{
    AudioBinding, AudioMixInfo, OutputBackend, OutputError, OutputSettings, OutputStopCode,
    StopNotifier,
};
pub use recording::{AsyncRecorder, RecordState, RecorderOptions, RecorderStats};
pub use video::{Frame, FrameRate, SharedFrame, VideoFormat};

/// Initialize logging from `RUST_LOG`, defaulting to `info`. Safe to call more
/// than once.
pub fn init_logging() {
    init_logging_with("info");
}

/// Like `init_logging` with a different fallback level when `RUST_LOG` is
/// unset. Returns false if a logger was already installed.
pub fn init_logging_with(default_level: &str) -> bool {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .try_init()
        .is_ok()
}
