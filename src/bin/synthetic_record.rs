//! asrec synthetic recorder
//!
//! Feeds a jittery synthetic NV12 source through an `AsyncRecorder` backed by
//! the GStreamer output, to check resampling and file output end to end.
//!
//! Usage:
//!   cargo run --features gstreamer --bin synthetic_record [-- [OPTIONS]]
//!
//! Options:
//!   --config <path>     Load a TOML recorder config (default: built-in defaults)
//!   --dir <path>        Override the output directory
//!   --ext <ext>         Override the file extension (default from config)
//!   --duration <secs>   How long to feed frames (default: 5s)
//!   --source-fps <n>    Nominal source rate (default: 24)
//!   --host-fps <n>      Recording frame rate (default: 30)
//!   --stall <ms>        Pause the source once halfway through for this long
//!   --audio <element>   Record the host mix from this source (e.g. audiotestsrc)
//!   --verbose           Extra debug output

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;

use asrec::gstreamer_init::{gstreamer_info, has_element};
use asrec::output::gst::{GstBackend, DEFAULT_VIDEO_ENCODER};
use asrec::recording::{AsyncRecorder, RecorderOptions};
use asrec::{AudioMixInfo, Frame, FrameRate, RecordConfig, VideoFormat};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 360;
const DEFAULT_DURATION_SECS: u64 = 5;
const AUDIO_MIX: AudioMixInfo = AudioMixInfo {
    sample_rate: 48_000,
    channels: 2,
};

fn arg_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parse_arg<T: std::str::FromStr>(args: &[String], name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match arg_value(args, name) {
        Some(s) => s
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", name, e)),
        None => Ok(default),
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let verbose = args.iter().any(|a| a == "--verbose");
    let log_level = if verbose { "debug" } else { "info" };
    asrec::init_logging_with(log_level);

    let duration_secs: u64 = parse_arg(&args, "--duration", DEFAULT_DURATION_SECS)?;
    let source_fps: u32 = parse_arg(&args, "--source-fps", 24)?;
    let host_fps: u32 = parse_arg(&args, "--host-fps", 30)?;
    let stall_ms: u64 = parse_arg(&args, "--stall", 0)?;
    anyhow::ensure!(source_fps > 0 && host_fps > 0, "frame rates must be positive");

    let mut config = match arg_value(&args, "--config") {
        Some(path) => RecordConfig::load(&PathBuf::from(path))
            .with_context(|| format!("loading config {}", path))?,
        None => RecordConfig::default(),
    };
    if let Some(dir) = arg_value(&args, "--dir") {
        config.directory = PathBuf::from(dir);
    }
    if let Some(ext) = arg_value(&args, "--ext") {
        config.extension = ext.to_string();
    }

    let gst = gstreamer_info();
    anyhow::ensure!(gst.is_available, "GStreamer is not available");
    let encoder = config
        .output_settings
        .get("video_encoder")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_VIDEO_ENCODER)
        .to_string();
    let audio_source = arg_value(&args, "--audio");

    println!("\n=== asrec synthetic recording ===\n");
    println!("  GStreamer: {}", gst.version.as_deref().unwrap_or("unknown"));
    if let Some(path) = &gst.plugin_path {
        println!("  Plugins:   {}", path);
    }
    println!(
        "  Encoder:   {}{}",
        encoder,
        if has_element(&encoder) { "" } else { " (NOT INSTALLED)" }
    );
    println!("  Source:    {}x{} NV12 @ ~{} fps (jittered)", WIDTH, HEIGHT, source_fps);
    if let Some(source) = audio_source {
        println!(
            "  Audio:     {} @ {} Hz x{}",
            source, AUDIO_MIX.sample_rate, AUDIO_MIX.channels
        );
    }
    println!("  Recording: {} fps into {}", host_fps, config.directory.display());
    println!("  Duration:  {}s", duration_secs);
    println!();

    let mut backend = GstBackend::new(FrameRate::new(host_fps, 1)).context("GStreamer backend")?;
    if let Some(source) = audio_source {
        anyhow::ensure!(has_element(source), "audio source {} is not installed", source);
        backend = backend.with_host_audio(source, AUDIO_MIX);
    }
    let mut recorder = AsyncRecorder::with_options(
        backend,
        config,
        RecorderOptions {
            name: "synthetic".to_string(),
            ..RecorderOptions::default()
        },
    )?;

    let interval = Duration::from_nanos(1_000_000_000 / source_fps as u64);
    let start = Instant::now();
    let deadline = start + Duration::from_secs(duration_secs);
    let mut stalled = stall_ms == 0;
    let mut index = 0u32;

    while Instant::now() < deadline {
        let frame = generate_nv12_frame(WIDTH, HEIGHT, index)
            .with_timestamp(start.elapsed().as_nanos() as u64 + 1);
        recorder.on_frame_arrived(&frame);
        index += 1;

        if !stalled && start.elapsed() >= Duration::from_secs(duration_secs) / 2 {
            println!("  Stalling source for {} ms", stall_ms);
            std::thread::sleep(Duration::from_millis(stall_ms));
            stalled = true;
        }
        std::thread::sleep(interval + jitter(index, interval));
    }

    recorder.shutdown();
    let stats = recorder.stats();

    println!("\n  Frames received:   {}", stats.frames_received);
    println!("  Frames written:    {}", stats.frames_written);
    println!("  Frames dropped:    {}", stats.frames_dropped);
    println!("  Slots emitted:     {}", stats.slots_emitted);
    println!("  Slots duplicated:  {}", stats.slots_duplicated);
    println!("  Sessions started:  {}", stats.sessions_started);
    println!("  Sessions failed:   {}", stats.sessions_failed);
    println!();

    if recorder.is_failed() || stats.sessions_started == 0 {
        match recorder.last_error() {
            Some(e) => anyhow::bail!("recording failed: {}", e),
            None => anyhow::bail!("recording failed, see log output"),
        }
    }
    Ok(())
}

/// Up to 40% of an interval of deterministic jitter
fn jitter(index: u32, interval: Duration) -> Duration {
    let phase = ((index as f64) * 0.7).sin().abs();
    interval.mul_f64(0.4 * phase)
}

/// Moving gradient so successive frames differ
fn generate_nv12_frame(width: u32, height: u32, index: u32) -> Frame {
    let mut frame = Frame::new(VideoFormat::Nv12, width, height);
    let w = width as usize;
    let h = height as usize;

    let phase = (index as f64 * 0.05).sin() * 30.0;
    let luma = &mut frame.planes[0];
    for row in 0..h {
        for col in 0..w {
            let horiz = col as f64 / w as f64 * 200.0;
            let vert = row as f64 / h as f64 * 55.0;
            luma[row * w + col] = (horiz + vert + phase).clamp(0.0, 255.0) as u8;
        }
    }

    let uv_phase = (index as f64 * 0.02).cos() * 20.0;
    let uv_linesize = frame.linesize[1];
    let uv_rows = VideoFormat::Nv12.plane_rows(1, height);
    let chroma = &mut frame.planes[1];
    for row in 0..uv_rows {
        for col in (0..uv_linesize).step_by(2) {
            let u = (128.0 + col as f64 / uv_linesize as f64 * 40.0 + uv_phase).clamp(0.0, 255.0);
            let v = (128.0 + row as f64 / uv_rows as f64 * 40.0 - uv_phase).clamp(0.0, 255.0);
            chroma[row * uv_linesize + col] = u as u8;
            chroma[row * uv_linesize + col + 1] = v as u8;
        }
    }
    frame
}
