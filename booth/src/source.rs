use photo_booth_common::frame::FrameHandle;
use std::sync::Arc;
use tokio::sync::watch;

/// Latest-wins slot for the live camera frame.
///
/// There is no queue: publishing replaces whatever frame was there, and
/// readers always see the most recent one. Frames nobody read are dropped.
#[derive(Clone)]
pub struct FrameSource {
    tx: Arc<watch::Sender<Option<Arc<FrameHandle>>>>,
}

impl FrameSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, frame: FrameHandle) {
        self.tx.send_replace(Some(Arc::new(frame)));
    }

    pub fn latest(&self) -> Option<Arc<FrameHandle>> {
        self.tx.borrow().clone()
    }

    /// Resolution of the most recent frame, if the camera has delivered one.
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.tx
            .borrow()
            .as_ref()
            .map(|frame| (frame.width(), frame.height()))
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<FrameHandle>>> {
        self.tx.subscribe()
    }
}

impl Default for FrameSource {
    fn default() -> Self {
        Self::new()
    }
}
