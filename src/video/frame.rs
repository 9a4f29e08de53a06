// Frame model shared by the producer and the worker
//
// A `Frame` is immutable once it has been copied out of the host pipeline.
// Frames cross the producer -> worker boundary as `SharedFrame` (an `Arc`), so
// the queue, the worker and any other holder (e.g. a preview tee) each own one
// strong reference and the pixel buffers are freed when the last one drops.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A frame shared between pipeline stages. Cloning only bumps the refcount.
pub type SharedFrame = Arc<Frame>;

/// Raw pixel formats the recorder knows the plane layout of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    /// 8-bit planar 4:2:0, three planes
    I420,
    /// 8-bit semi-planar 4:2:0, luma plane + interleaved chroma plane
    Nv12,
    /// 8-bit planar 4:2:2, three planes
    I422,
    /// 8-bit planar 4:4:4, three planes
    I444,
    /// Packed 4:2:2, Y0 U Y1 V
    Yuy2,
    /// Packed 4:2:2, Y0 V Y1 U
    Yvyu,
    /// Packed 4:2:2, U Y0 V Y1
    Uyvy,
    /// Packed 8-bit RGBA
    Rgba,
    /// Packed 8-bit BGRA
    Bgra,
    /// Packed 8-bit BGR with padding byte
    Bgrx,
    /// Packed 24-bit BGR
    Bgr3,
    /// 8-bit greyscale
    Y800,
}

impl VideoFormat {
    /// All known formats (for iteration)
    pub const ALL: &'static [VideoFormat] = &[
        VideoFormat::I420,
        VideoFormat::Nv12,
        VideoFormat::I422,
        VideoFormat::I444,
        VideoFormat::Yuy2,
        VideoFormat::Yvyu,
        VideoFormat::Uyvy,
        VideoFormat::Rgba,
        VideoFormat::Bgra,
        VideoFormat::Bgrx,
        VideoFormat::Bgr3,
        VideoFormat::Y800,
    ];

    /// Number of data planes
    pub fn plane_count(&self) -> usize {
        match self {
            VideoFormat::I420 | VideoFormat::I422 | VideoFormat::I444 => 3,
            VideoFormat::Nv12 => 2,
            _ => 1,
        }
    }

    /// Number of rows stored in `plane` for a frame `height` pixels tall
    pub fn plane_rows(&self, plane: usize, height: u32) -> usize {
        let height = height as usize;
        if plane >= self.plane_count() {
            return 0;
        }
        match (self, plane) {
            (VideoFormat::I420, 1 | 2) | (VideoFormat::Nv12, 1) => height.div_ceil(2),
            _ => height,
        }
    }

    /// Minimum bytes per row of `plane` for a frame `width` pixels wide
    pub fn plane_min_linesize(&self, plane: usize, width: u32) -> usize {
        let width = width as usize;
        if plane >= self.plane_count() {
            return 0;
        }
        match (self, plane) {
            (VideoFormat::I420 | VideoFormat::I422, 1 | 2) => width.div_ceil(2),
            (VideoFormat::Nv12, 1) => width.div_ceil(2) * 2,
            (VideoFormat::I420 | VideoFormat::I422 | VideoFormat::I444 | VideoFormat::Nv12, _) => width,
            (VideoFormat::Yuy2 | VideoFormat::Yvyu | VideoFormat::Uyvy, _) => width.div_ceil(2) * 4,
            (VideoFormat::Rgba | VideoFormat::Bgra | VideoFormat::Bgrx, _) => width * 4,
            (VideoFormat::Bgr3, _) => width * 3,
            (VideoFormat::Y800, _) => width,
        }
    }

    /// GStreamer raw video format string (used in `video/x-raw` caps)
    pub fn gst_format_name(&self) -> &'static str {
        match self {
            VideoFormat::I420 => "I420",
            VideoFormat::Nv12 => "NV12",
            VideoFormat::I422 => "Y42B",
            VideoFormat::I444 => "Y444",
            VideoFormat::Yuy2 => "YUY2",
            VideoFormat::Yvyu => "YVYU",
            VideoFormat::Uyvy => "UYVY",
            VideoFormat::Rgba => "RGBA",
            VideoFormat::Bgra => "BGRA",
            VideoFormat::Bgrx => "BGRx",
            VideoFormat::Bgr3 => "BGR",
            VideoFormat::Y800 => "GRAY8",
        }
    }

    /// Try to parse a format from its GStreamer name
    pub fn from_gst_format_name(name: &str) -> Option<VideoFormat> {
        VideoFormat::ALL
            .iter()
            .copied()
            .find(|f| f.gst_format_name() == name)
    }
}

/// Luma/chroma quantization range of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorRange {
    /// 16-235 (limited / broadcast range)
    Partial,
    /// 0-255
    Full,
}

impl ColorRange {
    pub fn from_full_range(full_range: bool) -> Self {
        if full_range {
            ColorRange::Full
        } else {
            ColorRange::Partial
        }
    }
}

/// Rational frame rate as negotiated by the host pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Nominal frame duration in nanoseconds (truncated, like the host's own
    /// frame clock). Returns 0 for a degenerate rate.
    pub fn frame_interval_ns(&self) -> u64 {
        if self.num == 0 || self.den == 0 {
            return 0;
        }
        (1_000_000_000u128 * self.den as u128 / self.num as u128) as u64
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::new(30, 1)
    }
}

/// One timestamped raw image with its layout metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    /// Per-plane pixel data
    pub planes: Vec<Vec<u8>>,
    /// Per-plane bytes per row (may include padding)
    pub linesize: Vec<usize>,
    /// Presentation timestamp in nanoseconds
    pub timestamp_ns: u64,
    pub full_range: bool,
}

impl Frame {
    /// Allocate a zeroed frame with tightly packed rows
    pub fn new(format: VideoFormat, width: u32, height: u32) -> Self {
        let plane_count = format.plane_count();
        let mut planes = Vec::with_capacity(plane_count);
        let mut linesize = Vec::with_capacity(plane_count);
        for plane in 0..plane_count {
            let ls = format.plane_min_linesize(plane, width);
            planes.push(vec![0u8; ls * format.plane_rows(plane, height)]);
            linesize.push(ls);
        }
        Self {
            format,
            width,
            height,
            planes,
            linesize,
            timestamp_ns: 0,
            full_range: false,
        }
    }

    /// Build a frame from caller-provided planes (e.g. padded rows)
    pub fn from_planes(
        format: VideoFormat,
        width: u32,
        height: u32,
        planes: Vec<Vec<u8>>,
        linesize: Vec<usize>,
    ) -> Self {
        Self {
            format,
            width,
            height,
            planes,
            linesize,
            timestamp_ns: 0,
            full_range: false,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    pub fn with_full_range(mut self, full_range: bool) -> Self {
        self.full_range = full_range;
        self
    }

    /// Fill every byte of every plane with `value`
    pub fn fill(&mut self, value: u8) {
        for plane in &mut self.planes {
            plane.fill(value);
        }
    }

    /// A frame with no pixels is never recorded
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Plane `index` with its line size, if present
    pub fn plane(&self, index: usize) -> Option<(&[u8], usize)> {
        let data = self.planes.get(index)?;
        let linesize = *self.linesize.get(index)?;
        Some((data.as_slice(), linesize))
    }

    pub fn color_range(&self) -> ColorRange {
        ColorRange::from_full_range(self.full_range)
    }
}
