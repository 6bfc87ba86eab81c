use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::frame::Frame;

/// Fixed-capacity ring of the most recent frames for one camera.
///
/// Single appender (the camera's ingest path), many readers (HTTP handlers,
/// diagnostics). Readers receive `Arc<Frame>` handles; the write lock is held
/// only for the queue manipulation itself, so readers never observe a torn
/// frame and never block the appender for long.
#[derive(Debug)]
pub struct FrameRing {
    capacity: usize,
    frames: RwLock<VecDeque<Arc<Frame>>>,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a frame, evicting the oldest when full. Never blocks on readers
    /// beyond the short lock hold; never fails.
    pub fn append(&self, frame: Arc<Frame>) {
        let mut frames = self.frames.write();
        if frames.len() == self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    /// Most recently appended frame, if any.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.frames.read().back().cloned()
    }

    /// The last `k` frames in append order (oldest first). Returns fewer when
    /// the ring holds fewer.
    pub fn snapshot(&self, k: usize) -> Vec<Arc<Frame>> {
        let frames = self.frames.read();
        let skip = frames.len().saturating_sub(k);
        frames.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.read().is_empty()
    }
}
