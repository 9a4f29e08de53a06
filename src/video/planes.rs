// Stride-tolerant plane copy
//
// Source and destination rows may be padded differently. Each row copies
// min(src_linesize, dst_linesize) bytes so padding never bleeds into the next
// row, and no copy ever runs past either buffer.

use super::frame::{Frame, VideoFormat};

/// A writable destination plane handed out by a video sink
#[derive(Debug)]
pub struct PlaneMut<'a> {
    pub data: &'a mut [u8],
    pub linesize: usize,
}

impl<'a> PlaneMut<'a> {
    pub fn new(data: &'a mut [u8], linesize: usize) -> Self {
        Self { data, linesize }
    }
}

/// Copy `rows` rows from `src` into `dst`. Returns the number of bytes written.
pub fn copy_plane(
    dst: &mut [u8],
    dst_linesize: usize,
    src: &[u8],
    src_linesize: usize,
    rows: usize,
) -> usize {
    if dst_linesize == src_linesize {
        let len = (dst_linesize * rows).min(dst.len()).min(src.len());
        dst[..len].copy_from_slice(&src[..len]);
        return len;
    }

    let width = src_linesize.min(dst_linesize);
    let mut written = 0;
    for y in 0..rows {
        let s = y * src_linesize;
        let d = y * dst_linesize;
        if s >= src.len() || d >= dst.len() {
            break;
        }
        let len = width.min(src.len() - s).min(dst.len() - d);
        dst[d..d + len].copy_from_slice(&src[s..s + len]);
        written += len;
    }
    written
}

/// Copy every plane of `frame` that also exists in the destination layout.
///
/// Row counts are the smaller of the source's and the destination's so a
/// frame that doesn't match the stream geometry is cropped or under-filled.
pub fn copy_frame_planes(
    frame: &Frame,
    dst: &mut [PlaneMut<'_>],
    dst_format: VideoFormat,
    dst_height: u32,
) -> usize {
    let mut written = 0;
    for (index, plane) in dst.iter_mut().enumerate() {
        let Some((src, src_linesize)) = frame.plane(index) else {
            break;
        };
        let rows = frame
            .format
            .plane_rows(index, frame.height)
            .min(dst_format.plane_rows(index, dst_height));
        written += copy_plane(plane.data, plane.linesize, src, src_linesize, rows);
    }
    written
}
