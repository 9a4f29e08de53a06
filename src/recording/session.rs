// One live (video stream, recording output) pair
//
// A session is built from the first queued frame of a recording attempt and
// never reused: every (re)start opens a fresh one. Closing is idempotent and
// also happens on drop, so an early return can't leak backend handles.

use crate::output::{
    AudioBinding, OutputBackend, OutputError, OutputSettings, RecordingOutput, StopNotifier,
    VideoOutputInfo, VideoSink,
};
use crate::video::{copy_frame_planes, Frame, FrameRate};

use super::resample::{Resample, Resampler};

/// Non-fatal mismatch between a frame and the session's stream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameMismatch {
    #[error("frame width mismatch, got {got}, expected {expected}")]
    Width { got: u32, expected: u32 },

    #[error("frame height mismatch, got {got}, expected {expected}")]
    Height { got: u32, expected: u32 },

    #[error("frame format mismatch, got {got:?}, expected {expected:?}")]
    Format {
        got: crate::video::VideoFormat,
        expected: crate::video::VideoFormat,
    },
}

/// Compare a frame against the stream it is about to be written into
pub fn check_frame(frame: &Frame, info: &VideoOutputInfo) -> Vec<FrameMismatch> {
    let mut mismatches = Vec::new();
    if frame.width != info.width {
        mismatches.push(FrameMismatch::Width {
            got: frame.width,
            expected: info.width,
        });
    }
    if frame.height != info.height {
        mismatches.push(FrameMismatch::Height {
            got: frame.height,
            expected: info.height,
        });
    }
    if frame.format != info.format {
        mismatches.push(FrameMismatch::Format {
            got: frame.format,
            expected: info.format,
        });
    }
    mismatches
}

/// Result of pushing one queued frame through a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written into `count` slots
    Written { count: u32 },
    /// Arrived before the next slot was due
    Dropped,
    /// The video stream is stopped or refused the frame
    Failed,
}

pub struct OutputSession<B: OutputBackend> {
    name: String,
    generation: u64,
    video: Option<B::Video>,
    output: Option<B::Output>,
    resampler: Resampler,
    /// The backend reported that the output halted by itself
    stopped: bool,
}

impl<B: OutputBackend> OutputSession<B> {
    /// Describe a fixed-rate stream from `first`'s geometry and the host's
    /// frame rate, and open it.
    pub fn open(
        backend: &mut B,
        first: &Frame,
        host_rate: FrameRate,
        name: &str,
        cache_size: usize,
        generation: u64,
    ) -> Result<Self, OutputError> {
        log::info!(
            "{}: got first frame: width={} height={} format={:?}",
            name,
            first.width,
            first.height,
            first.format
        );

        if host_rate.frame_interval_ns() == 0 {
            return Err(OutputError::StreamOpen(format!(
                "invalid host frame rate {}/{}",
                host_rate.num, host_rate.den
            )));
        }

        let info = VideoOutputInfo {
            name: name.to_string(),
            format: first.format,
            width: first.width,
            height: first.height,
            frame_rate: host_rate,
            cache_size,
            color_range: first.color_range(),
        };

        let video = backend.open_video(&info)?;
        let interval = video.frame_interval_ns();
        log::debug!(
            "{}: video stream open {}x{} @ {:.3} fps, interval={}ns",
            name,
            info.width,
            info.height,
            host_rate.as_f64(),
            interval
        );

        Ok(Self {
            name: name.to_string(),
            generation,
            video: Some(video),
            output: None,
            resampler: Resampler::new(interval),
            stopped: false,
        })
    }

    /// Create the recording output, bind it to the stream and the host audio
    /// mix, and start it
    pub fn start(
        &mut self,
        backend: &mut B,
        settings: &OutputSettings,
        stop: StopNotifier,
    ) -> Result<(), OutputError> {
        let video = self
            .video
            .as_mut()
            .ok_or_else(|| OutputError::OutputCreate("video stream is closed".into()))?;

        log::info!("{}: starting filename={}", self.name, settings.path.display());

        let audio = AudioBinding::for_output(settings, backend.host_audio());
        match &audio {
            Some(binding) => log::debug!(
                "{}: binding {} audio track(s) at {} Hz",
                self.name,
                binding.tracks,
                binding.mix.sample_rate
            ),
            None if settings.mixers > 0 => {
                log::info!("{}: no host audio mix, recording video only", self.name)
            }
            None => {}
        }

        let mut output = backend.create_output(settings, video, audio.as_ref(), stop)?;
        if let Err(e) = output.start() {
            // Never started, so there is nothing to force-stop
            drop(output);
            return Err(e);
        }
        self.output = Some(output);
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn video_info(&self) -> Option<&VideoOutputInfo> {
        self.video.as_ref().map(|v| v.info())
    }

    pub fn last_emitted_ns(&self) -> Option<u64> {
        self.resampler.last_emitted_ns()
    }

    pub fn is_open(&self) -> bool {
        self.video.is_some() || self.output.is_some()
    }

    /// Resample `frame` and copy it into the stream
    pub fn send(&mut self, frame: &Frame) -> SendOutcome {
        let Some(video) = self.video.as_mut() else {
            log::error!("{}: video output is unavailable", self.name);
            return SendOutcome::Failed;
        };
        if video.is_stopped() {
            log::error!("{}: video output is unavailable", self.name);
            return SendOutcome::Failed;
        }

        for mismatch in check_frame(frame, video.info()) {
            log::warn!("{}: {}", self.name, mismatch);
        }

        let (count, timestamp_ns) = match self.resampler.next(frame.timestamp_ns) {
            Resample::Emit { count, timestamp_ns } => (count, timestamp_ns),
            Resample::Drop { timestamp_ns, next_due_ns } => {
                log::warn!(
                    "{}: too many frames received at timestamp={:.3} (next slot at {:.3})",
                    self.name,
                    timestamp_ns as f64 * 1e-9,
                    next_due_ns as f64 * 1e-9
                );
                return SendOutcome::Dropped;
            }
        };

        if count != 1 {
            log::info!(
                "{}: count={} frame.timestamp={:.3} ts={:.3}",
                self.name,
                count,
                frame.timestamp_ns as f64 * 1e-9,
                timestamp_ns as f64 * 1e-9
            );
        }

        let dst_format = video.info().format;
        let dst_height = video.info().height;
        let result = video.write_frame(count, timestamp_ns, &mut |planes| {
            copy_frame_planes(frame, planes, dst_format, dst_height);
        });

        match result {
            Ok(()) => SendOutcome::Written { count },
            Err(e) => {
                log::error!(
                    "{}: {} timestamp={:.3}",
                    self.name,
                    e,
                    frame.timestamp_ns as f64 * 1e-9
                );
                SendOutcome::Failed
            }
        }
    }

    /// The backend halted the output; `close` must not force-stop it again
    pub fn mark_stopped(&mut self) {
        self.stopped = true;
    }

    /// Stop the output if it is still running, then release everything
    pub fn close(&mut self) {
        if let Some(mut output) = self.output.take() {
            log::info!("{}: stopping", self.name);
            if !self.stopped {
                output.force_stop();
            }
            drop(output);
        }
        if let Some(mut video) = self.video.take() {
            video.close();
        }
    }
}

impl<B: OutputBackend> Drop for OutputSession<B> {
    fn drop(&mut self) {
        self.close();
    }
}
