// Recording pipeline: frame queue, resampler, output session and the worker
// that drives them, behind the `AsyncRecorder` surface.

pub mod queue;
pub mod recorder;
pub mod resample;
pub mod session;
pub mod state;
mod worker;

pub use queue::FrameQueue;
pub use recorder::{AsyncRecorder, FrameClock, MonotonicClock, RecorderOptions, RecordingError};
pub use resample::{Resample, Resampler};
pub use session::{FrameMismatch, OutputSession, SendOutcome};
pub use state::{RecordState, RecorderStats};
