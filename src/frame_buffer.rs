use crate::frame::Frame;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// The single "current" frame and its annotated twin.
///
/// Written once per cycle by the capture loop, read by any number of
/// consumers. Publishing swaps an `Arc`, so readers observe either the
/// previous or the new frame and never block the writer.
pub struct FrameBuffer {
    current: watch::Sender<Option<Arc<Frame>>>,
    overlay: watch::Sender<Option<Arc<Frame>>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        let (overlay, _) = watch::channel(None);
        Self { current, overlay }
    }

    /// Publish a new frame. Without an overlay the raw frame doubles as the overlay frame.
    pub fn publish(&self, frame: Arc<Frame>, overlay: Option<Arc<Frame>>) {
        trace!("Publishing frame {}", frame.sequence);
        let overlay = overlay.unwrap_or_else(|| Arc::clone(&frame));
        self.overlay.send_replace(Some(overlay));
        self.current.send_replace(Some(frame));
    }

    /// Latest published frame, without waiting
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.current.borrow().clone()
    }

    /// Latest frame with detection boxes drawn, without waiting
    pub fn current_overlay_frame(&self) -> Option<Arc<Frame>> {
        self.overlay.borrow().clone()
    }

    pub fn latest_sequence(&self) -> Option<u64> {
        self.current.borrow().as_ref().map(|f| f.sequence)
    }

    /// Receiver that wakes on every publication of a raw frame
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.current.subscribe()
    }

    /// Receiver that wakes on every publication of an overlay frame
    pub fn subscribe_overlay(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.overlay.subscribe()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
