// Frame queue between the producer callback and the worker
//
// The queue is not synchronized on its own: it lives inside the recorder's
// shared state and is only touched while holding that lock, so a push, a pop
// and the flag checks that decide whether to wait are one atomic step.

use std::collections::VecDeque;

use crate::video::SharedFrame;

/// Unbounded FIFO of frames in arrival order
#[derive(Debug, Default)]
pub struct FrameQueue {
    frames: VecDeque<SharedFrame>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of one reference to `frame`
    pub fn push(&mut self, frame: SharedFrame) {
        self.frames.push_back(frame);
    }

    /// Hand the oldest frame's reference to the caller
    pub fn pop_front(&mut self) -> Option<SharedFrame> {
        self.frames.pop_front()
    }

    /// Borrow the oldest frame without dequeuing it. The returned clone is an
    /// extra reference; the queue keeps its own.
    pub fn front(&self) -> Option<SharedFrame> {
        self.frames.front().cloned()
    }

    /// Release every queued reference. Returns how many were discarded.
    ///
    /// Frames still held elsewhere stay alive; each one's count drops by
    /// exactly one.
    pub fn drain_and_discard(&mut self) -> usize {
        let count = self.frames.len();
        self.frames.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
