//! GStreamer output backend
//!
//! Each session builds one pipeline:
//!
//! ```text
//! appsrc ! queue ! videoconvert ! <encoder> [! <parser>] ! <muxer> ! filesink
//! ```
//!
//! `open_video` builds the raw half (appsrc to videoconvert) from the stream
//! description, `create_output` appends the encoder half for the destination
//! file and `start` sets the pipeline playing. A bus watcher thread reports
//! errors and end-of-stream through the session's `StopNotifier`.
//!
//! When the backend has a host audio source and the output asks for audio
//! tracks, `create_output` also adds one audio branch per track:
//!
//! ```text
//! <source> ! audioconvert ! audioresample ! capsfilter ! tee
//! tee. ! queue ! <audio encoder> [! <parser>] ! <muxer>
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_audio as gst_audio;
use gstreamer_video as gst_video;

use crate::gstreamer_init::init_gstreamer;
use crate::video::{FrameRate, PlaneMut};

use super::{
    AudioBinding, AudioMixInfo, OutputBackend, OutputError, OutputSettings, OutputStopCode,
    RecordingOutput, Result, StopNotifier, VideoOutputInfo, VideoSink,
};

/// Encoder used when the settings don't name one
pub const DEFAULT_VIDEO_ENCODER: &str = "x264enc";

/// Override key selecting the encoder element
pub const VIDEO_ENCODER_KEY: &str = "video_encoder";

/// Override keys with this prefix are set as encoder properties
/// (`"encoder.speed-preset" = "veryfast"`)
pub const ENCODER_PROPERTY_PREFIX: &str = "encoder.";

/// How long `force_stop` waits for the muxer to finalize the file
const FINALIZE_TIMEOUT_SECS: u64 = 10;

/// Pick the muxer element for a file extension
pub fn muxer_for_extension(extension: &str) -> Option<&'static str> {
    match extension.to_ascii_lowercase().as_str() {
        "mkv" => Some("matroskamux"),
        "mp4" => Some("mp4mux"),
        "mov" => Some("qtmux"),
        "webm" => Some("webmmux"),
        "flv" => Some("flvmux"),
        "ts" => Some("mpegtsmux"),
        _ => None,
    }
}

/// Audio encoder (and parser, if any) that `muxer` accepts
pub fn audio_encoder_for_muxer(muxer: &str) -> (&'static str, Option<&'static str>) {
    match muxer {
        "matroskamux" | "webmmux" => ("opusenc", None),
        _ => ("avenc_aac", Some("aacparse")),
    }
}

/// Bitstream parser that has to sit between `encoder` and the muxer
pub fn parser_for_encoder(encoder: &str) -> Option<&'static str> {
    match encoder {
        "x264enc" | "nvh264enc" | "vaapih264enc" | "qsvh264enc" | "openh264enc" => {
            Some("h264parse")
        }
        "x265enc" | "nvh265enc" | "vaapih265enc" | "qsvh265enc" => Some("h265parse"),
        "av1enc" | "svtav1enc" | "rav1enc" => Some("av1parse"),
        _ => None,
    }
}

/// Translate a bus error into the stop code reported to the recorder
fn stop_code_for_error(error: &gst::glib::Error) -> OutputStopCode {
    if error.matches(gst::ResourceError::NoSpaceLeft) {
        OutputStopCode::NoSpace
    } else if error.matches(gst::ResourceError::OpenWrite)
        || error.matches(gst::ResourceError::NotFound)
        || error.matches(gst::ResourceError::OpenReadWrite)
    {
        OutputStopCode::BadPath
    } else if error.matches(gst::StreamError::Encode) {
        OutputStopCode::EncodeError
    } else if error.matches(gst::StreamError::CodecNotFound)
        || error.matches(gst::StreamError::Format)
        || error.matches(gst::CoreError::MissingPlugin)
    {
        OutputStopCode::Unsupported
    } else {
        OutputStopCode::Error
    }
}

fn make_element(factory: &str) -> std::result::Result<gst::Element, String> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| format!("Failed to create {}: {}", factory, e))
}

/// Element producing the host audio mix
#[derive(Debug, Clone)]
struct HostAudio {
    factory: String,
    mix: AudioMixInfo,
}

/// Records into files through a GStreamer encoding pipeline
pub struct GstBackend {
    frame_rate: FrameRate,
    host_audio: Option<HostAudio>,
}

impl GstBackend {
    /// `frame_rate` is the rate the host renders at, and so the rate every
    /// recording is written at.
    pub fn new(frame_rate: FrameRate) -> Result<Self> {
        init_gstreamer().map_err(OutputError::StreamOpen)?;
        Ok(Self {
            frame_rate,
            host_audio: None,
        })
    }

    /// Record the host mix from a source element (`autoaudiosrc`,
    /// `pulsesrc`, `audiotestsrc`...) converted to `mix`
    pub fn with_host_audio(mut self, factory: &str, mix: AudioMixInfo) -> Self {
        self.host_audio = Some(HostAudio {
            factory: factory.to_string(),
            mix,
        });
        self
    }
}

pub struct GstVideo {
    info: VideoOutputInfo,
    video_info: gst_video::VideoInfo,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    /// Tail of the raw half, where the encoder gets linked
    convert: gst::Element,
    /// Timestamp of the first slot, buffers are stamped relative to it
    base_ns: Option<u64>,
    stopped: Arc<AtomicBool>,
    closed: bool,
}

impl GstVideo {
    fn build(info: &VideoOutputInfo) -> std::result::Result<Self, String> {
        let format = gst_video::VideoFormat::from_string(info.format.gst_format_name());
        if format == gst_video::VideoFormat::Unknown {
            return Err(format!("unsupported format {:?}", info.format));
        }

        let video_info = gst_video::VideoInfo::builder(format, info.width, info.height)
            .fps(gst::Fraction::new(
                info.frame_rate.num as i32,
                info.frame_rate.den as i32,
            ))
            .build()
            .map_err(|e| format!("invalid stream description: {}", e))?;
        let caps = video_info
            .to_caps()
            .map_err(|e| format!("cannot build caps: {}", e))?;

        let pipeline = gst::Pipeline::with_name(&info.name);

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps)
            .format(gst::Format::Time)
            .is_live(true)
            .stream_type(gst_app::AppStreamType::Stream)
            .max_buffers(info.cache_size.max(1) as u64)
            .block(true)
            .build();

        let queue = gst::ElementFactory::make("queue")
            .property("max-size-buffers", info.cache_size.max(1) as u32)
            .property("max-size-time", 0u64)
            .property("max-size-bytes", 0u32)
            .build()
            .map_err(|e| format!("Failed to create queue: {}", e))?;
        let convert = make_element("videoconvert")?;

        pipeline
            .add_many([appsrc.upcast_ref(), &queue, &convert])
            .map_err(|e| format!("Failed to add elements: {}", e))?;
        gst::Element::link_many([appsrc.upcast_ref(), &queue, &convert])
            .map_err(|e| format!("Failed to link elements: {}", e))?;

        Ok(Self {
            info: info.clone(),
            video_info,
            pipeline,
            appsrc,
            convert,
            base_ns: None,
            stopped: Arc::new(AtomicBool::new(false)),
            closed: false,
        })
    }
}

impl VideoSink for GstVideo {
    fn info(&self) -> &VideoOutputInfo {
        &self.info
    }

    fn is_stopped(&self) -> bool {
        self.closed || self.stopped.load(Ordering::Acquire)
    }

    fn write_frame(
        &mut self,
        count: u32,
        timestamp_ns: u64,
        fill: &mut dyn FnMut(&mut [PlaneMut<'_>]),
    ) -> Result<()> {
        let interval = self.info.frame_interval_ns();
        // The buffer covers `count` slots ending at `timestamp_ns`
        let first_slot = timestamp_ns.saturating_sub((count.max(1) as u64 - 1) * interval);
        let base = *self.base_ns.get_or_insert(first_slot);
        let pts = first_slot.saturating_sub(base);

        let mut buffer = gst::Buffer::with_size(self.video_info.size())
            .map_err(|e| OutputError::Write(e.to_string()))?;
        {
            let buffer_ref = buffer
                .get_mut()
                .ok_or_else(|| OutputError::Write("buffer is not writable".into()))?;
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts));
            buffer_ref.set_duration(gst::ClockTime::from_nseconds(interval * count as u64));

            let mut map = buffer_ref
                .map_writable()
                .map_err(|e| OutputError::Write(e.to_string()))?;
            let mut planes = split_planes(
                map.as_mut_slice(),
                self.video_info.offset(),
                self.video_info.stride(),
            );
            fill(&mut planes);
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| OutputError::Write(format!("Failed to push buffer: {:?}", e)))?;
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            log::warn!("{}: failed to release pipeline: {:?}", self.info.name, e);
        }
    }
}

impl Drop for GstVideo {
    fn drop(&mut self) {
        self.close();
    }
}

/// Carve one mapped video buffer into per-plane views
fn split_planes<'a>(data: &'a mut [u8], offsets: &[usize], strides: &[i32]) -> Vec<PlaneMut<'a>> {
    let mut planes = Vec::with_capacity(offsets.len());
    let mut rest = data;
    let mut consumed = 0;
    for (index, &offset) in offsets.iter().enumerate() {
        let end = offsets
            .get(index + 1)
            .copied()
            .unwrap_or(consumed + rest.len());
        let skip = offset.saturating_sub(consumed).min(rest.len());
        let len = end.saturating_sub(offset).min(rest.len() - skip);

        let (_, tail) = std::mem::take(&mut rest).split_at_mut(skip);
        let (plane, tail) = tail.split_at_mut(len);
        rest = tail;
        consumed += skip + len;

        let linesize = strides.get(index).copied().unwrap_or(0).max(0) as usize;
        planes.push(PlaneMut::new(plane, linesize));
    }
    planes
}

pub struct GstOutput {
    name: String,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    /// Live audio source, sent EOS alongside the appsrc when finalizing
    audio_source: Option<gst::Element>,
    stop: StopNotifier,
    stopped: Arc<AtomicBool>,
    watcher: Option<(Sender<()>, JoinHandle<()>)>,
    running: bool,
}

impl GstOutput {
    /// Link the encoder, muxer and sink. Returns the muxer so audio
    /// branches can join it.
    fn build_encoder_half(
        video: &GstVideo,
        settings: &OutputSettings,
    ) -> std::result::Result<gst::Element, String> {
        let extension = settings
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let muxer_name = muxer_for_extension(extension)
            .ok_or_else(|| format!("no muxer for extension {:?}", extension))?;
        let encoder_name = settings
            .get_str(VIDEO_ENCODER_KEY)
            .unwrap_or_else(|| DEFAULT_VIDEO_ENCODER.to_string());

        let encoder = make_element(&encoder_name)?;
        configure_encoder(&encoder, &encoder_name, settings);
        let parser = parser_for_encoder(&encoder_name)
            .map(make_element)
            .transpose()?;
        let muxer = make_element(muxer_name)?;

        ensure_parent_dir(&settings.path)?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", settings.path.to_string_lossy().to_string())
            .property("async", false)
            .property("sync", false)
            .build()
            .map_err(|e| format!("Failed to create filesink: {}", e))?;

        let mut chain = vec![video.convert.clone(), encoder];
        chain.extend(parser);
        chain.push(muxer.clone());
        chain.push(filesink);

        video
            .pipeline
            .add_many(&chain[1..])
            .map_err(|e| format!("Failed to add elements: {}", e))?;
        gst::Element::link_many(&chain)
            .map_err(|e| format!("Failed to link {} to {}: {}", encoder_name, muxer_name, e))?;
        Ok(muxer)
    }

    /// Feed `binding.tracks` encoded copies of the host mix into `muxer`.
    /// Returns the source element.
    fn build_audio_branch(
        pipeline: &gst::Pipeline,
        muxer: &gst::Element,
        source_factory: &str,
        binding: &AudioBinding,
    ) -> std::result::Result<gst::Element, String> {
        let source = make_element(source_factory)?;
        if source.find_property("is-live").is_some() {
            source.set_property("is-live", true);
        }
        let convert = make_element("audioconvert")?;
        let resample = make_element("audioresample")?;
        let caps = gst_audio::AudioInfo::builder(
            gst_audio::AudioFormat::S16le,
            binding.mix.sample_rate,
            binding.mix.channels,
        )
        .build()
        .and_then(|info| info.to_caps())
        .map_err(|e| format!("invalid audio mix description: {}", e))?;
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .map_err(|e| format!("Failed to create capsfilter: {}", e))?;
        let tee = make_element("tee")?;

        let head = [source.clone(), convert, resample, capsfilter, tee.clone()];
        pipeline
            .add_many(&head)
            .map_err(|e| format!("Failed to add audio elements: {}", e))?;
        gst::Element::link_many(&head)
            .map_err(|e| format!("Failed to link {}: {}", source_factory, e))?;

        let muxer_name = muxer
            .factory()
            .map(|f| f.name().to_string())
            .unwrap_or_default();
        let (encoder_name, parser_name) = audio_encoder_for_muxer(&muxer_name);
        for track in 0..binding.tracks {
            let queue = make_element("queue")?;
            let encoder = make_element(encoder_name)?;
            if encoder.find_property("bitrate").is_some() {
                // Both candidates take bits per second
                let bps = binding.bitrate_kbps.saturating_mul(1000);
                encoder.set_property_from_str("bitrate", &bps.to_string());
            }
            let mut branch = vec![tee.clone(), queue, encoder];
            if let Some(parser) = parser_name {
                branch.push(make_element(parser)?);
            }
            pipeline
                .add_many(&branch[1..])
                .map_err(|e| format!("Failed to add audio track {}: {}", track, e))?;
            branch.push(muxer.clone());
            gst::Element::link_many(&branch).map_err(|e| {
                format!("Failed to link audio track {} to {}: {}", track, muxer_name, e)
            })?;
        }
        Ok(source)
    }

    fn shutdown_watcher(&mut self) {
        if let Some((shutdown, handle)) = self.watcher.take() {
            let _ = shutdown.send(());
            if handle.join().is_err() {
                log::error!("{}: bus watcher panicked", self.name);
            }
        }
    }
}

fn configure_encoder(encoder: &gst::Element, encoder_name: &str, settings: &OutputSettings) {
    if let Some(kbps) = settings.get_i64("video_bitrate").filter(|b| *b > 0) {
        if encoder.find_property("bitrate").is_some() {
            encoder.set_property_from_str("bitrate", &kbps.to_string());
        } else {
            log::debug!("{} has no bitrate property", encoder_name);
        }
    }
    if encoder_name == "x264enc" {
        encoder.set_property_from_str("tune", "zerolatency");
    }
    for (key, value) in settings.to_data() {
        let Some(property) = key.strip_prefix(ENCODER_PROPERTY_PREFIX) else {
            continue;
        };
        if encoder.find_property(property).is_none() {
            log::warn!("{} has no property {:?}", encoder_name, property);
            continue;
        }
        let value = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        encoder.set_property_from_str(property, &value);
    }
}

fn ensure_parent_dir(path: &Path) -> std::result::Result<(), String> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .map_err(|e| format!("Cannot create {}: {}", parent.display(), e)),
        _ => Ok(()),
    }
}

/// Watch the pipeline bus until an error, end-of-stream or shutdown
fn watch_bus(
    name: String,
    bus: gst::Bus,
    shutdown: Receiver<()>,
    stop: StopNotifier,
    stopped: Arc<AtomicBool>,
) {
    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }

        let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
            continue;
        };
        match msg.view() {
            gst::MessageView::Error(err) => {
                let code = stop_code_for_error(&err.error());
                log::error!(
                    "{}: pipeline error: {} ({:?})",
                    name,
                    err.error(),
                    err.debug()
                );
                stopped.store(true, Ordering::Release);
                stop.notify(code);
                return;
            }
            gst::MessageView::Eos(..) => {
                log::info!("{}: end of stream", name);
                stopped.store(true, Ordering::Release);
                stop.notify(OutputStopCode::Success);
                return;
            }
            gst::MessageView::Warning(w) => {
                log::warn!("{}: pipeline warning: {}", name, w.error());
            }
            _ => {}
        }
    }
}

impl RecordingOutput for GstOutput {
    fn start(&mut self) -> Result<()> {
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| OutputError::OutputStart("pipeline has no bus".into()))?;

        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| OutputError::OutputStart(format!("Failed to start pipeline: {:?}", e)))?;
        self.running = true;

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let name = self.name.clone();
        let stop = self.stop.clone();
        let stopped = self.stopped.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-bus", self.name))
            .spawn(move || watch_bus(name, bus, shutdown_rx, stop, stopped))
            .map_err(|e| OutputError::OutputStart(format!("Failed to spawn bus watcher: {}", e)))?;
        self.watcher = Some((shutdown_tx, handle));
        Ok(())
    }

    fn force_stop(&mut self) {
        self.shutdown_watcher();
        if !self.running {
            return;
        }
        self.running = false;

        if self.stopped.load(Ordering::Acquire) {
            let _ = self.pipeline.set_state(gst::State::Null);
            return;
        }

        // Let the muxer write its trailer before tearing the pipeline down
        if let Err(e) = self.appsrc.end_of_stream() {
            log::warn!("{}: EOS send failed: {:?}", self.name, e);
        }
        if let Some(source) = &self.audio_source {
            if !source.send_event(gst::event::Eos::new()) {
                log::warn!("{}: audio source ignored EOS", self.name);
            }
        }
        let mut got_eos = false;
        if let Some(bus) = self.pipeline.bus() {
            let timeout = gst::ClockTime::from_seconds(FINALIZE_TIMEOUT_SECS);
            for msg in bus.iter_timed(timeout) {
                match msg.view() {
                    gst::MessageView::Eos(..) => {
                        got_eos = true;
                        break;
                    }
                    gst::MessageView::Error(err) => {
                        log::error!("{}: error during finalization: {}", self.name, err.error());
                        break;
                    }
                    _ => {}
                }
            }
        }
        if !got_eos {
            log::warn!("{}: did not receive EOS, forcing stop", self.name);
        }
        self.stopped.store(true, Ordering::Release);
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for GstOutput {
    fn drop(&mut self) {
        self.shutdown_watcher();
        if self.running {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

impl OutputBackend for GstBackend {
    type Video = GstVideo;
    type Output = GstOutput;

    fn host_frame_rate(&self) -> FrameRate {
        self.frame_rate
    }

    fn host_audio(&self) -> Option<AudioMixInfo> {
        self.host_audio.as_ref().map(|audio| audio.mix)
    }

    fn open_video(&mut self, info: &VideoOutputInfo) -> Result<GstVideo> {
        GstVideo::build(info).map_err(OutputError::StreamOpen)
    }

    fn create_output(
        &mut self,
        settings: &OutputSettings,
        video: &mut GstVideo,
        audio: Option<&AudioBinding>,
        stop: StopNotifier,
    ) -> Result<GstOutput> {
        let muxer =
            GstOutput::build_encoder_half(video, settings).map_err(OutputError::OutputCreate)?;

        let audio_source = match (audio, &self.host_audio) {
            (Some(binding), Some(host)) => Some(
                GstOutput::build_audio_branch(&video.pipeline, &muxer, &host.factory, binding)
                    .map_err(OutputError::OutputCreate)?,
            ),
            _ => None,
        };

        Ok(GstOutput {
            name: video.info.name.clone(),
            pipeline: video.pipeline.clone(),
            appsrc: video.appsrc.clone(),
            audio_source,
            stop,
            stopped: video.stopped.clone(),
            watcher: None,
            running: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_muxer_lookup() {
        assert_eq!(muxer_for_extension("mkv"), Some("matroskamux"));
        assert_eq!(muxer_for_extension("MP4"), Some("mp4mux"));
        assert_eq!(muxer_for_extension("avi"), None);
    }

    #[test]
    fn test_audio_encoder_lookup() {
        assert_eq!(audio_encoder_for_muxer("matroskamux"), ("opusenc", None));
        assert_eq!(audio_encoder_for_muxer("mp4mux"), ("avenc_aac", Some("aacparse")));
    }

    #[test]
    fn test_parser_lookup() {
        assert_eq!(parser_for_encoder("x264enc"), Some("h264parse"));
        assert_eq!(parser_for_encoder("x265enc"), Some("h265parse"));
        assert_eq!(parser_for_encoder("vp8enc"), None);
    }

    #[test]
    fn test_split_planes() {
        let mut data = vec![0u8; 24];
        let planes = split_planes(&mut data, &[0, 16, 20], &[4, 2, 2]);
        assert_eq!(planes.len(), 3);
        assert_eq!(planes[0].data.len(), 16);
        assert_eq!(planes[1].data.len(), 4);
        assert_eq!(planes[2].data.len(), 4);
        assert_eq!(planes[1].linesize, 2);
    }

    #[test]
    fn test_split_planes_with_gap() {
        let mut data = vec![0u8; 10];
        let planes = split_planes(&mut data, &[2], &[4]);
        assert_eq!(planes[0].data.len(), 8);
    }
}
