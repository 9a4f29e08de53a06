// Raw video primitives
//
// Frame layout metadata and the plane copy used when moving a queued frame
// into an output slot. Nothing here decodes or converts pixels.

pub mod frame;
pub mod planes;

pub use frame::{ColorRange, Frame, FrameRate, SharedFrame, VideoFormat};
pub use planes::{copy_frame_planes, copy_plane, PlaneMut};
