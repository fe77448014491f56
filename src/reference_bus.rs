use crate::frame::ReferenceFrame;
use crate::queue::DropOldestQueue;
use log::trace;

/// Carries recently played audio from the playback thread to the capture thread for echo cancellation.
///
/// Freshness wins over completeness: on overflow the oldest reference is dropped. An empty bus just
/// means nothing is playing.
#[derive(Default)]
pub struct PlaybackReferenceBus {
    frames: DropOldestQueue<ReferenceFrame>,
}

impl PlaybackReferenceBus {
    pub fn new() -> Self {
        PlaybackReferenceBus { frames: DropOldestQueue::new() }
    }

    pub fn publish(&self, played: &[i16]) {
        if self.frames.push(ReferenceFrame::from_played(played)) {
            trace!("Reference bus full, dropped oldest frame");
        }
    }

    pub fn try_take(&self) -> Option<ReferenceFrame> {
        self.frames.try_pop()
    }

    pub fn clear(&self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }
}
