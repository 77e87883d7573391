use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::link::ArtifactLink;

/// Where the capture pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapturePhase {
    #[default]
    Idle,
    /// Digit currently on screen.
    Countdown(u32),
    Capturing,
    Uploading,
    Revealed,
    Failed,
}

impl CapturePhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, CapturePhase::Idle)
    }

    /// The countdown digit, absent outside `Countdown`.
    pub fn countdown(&self) -> Option<u32> {
        match self {
            CapturePhase::Countdown(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for CapturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapturePhase::Idle => write!(f, "idle"),
            CapturePhase::Countdown(n) => write!(f, "countdown({n})"),
            CapturePhase::Capturing => write!(f, "capturing"),
            CapturePhase::Uploading => write!(f, "uploading"),
            CapturePhase::Revealed => write!(f, "revealed"),
            CapturePhase::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of the active (or last) session for UI polling.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    /// 0 before the first trigger.
    pub session_id: u64,
    pub phase: CapturePhase,
    pub link: Option<Arc<ArtifactLink>>,
    /// Set on `Failed` and kept through the following `Idle`.
    pub error: Option<String>,
}

/// One phase transition, broadcast in order.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub session_id: u64,
    pub phase: CapturePhase,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started { session_id: u64 },
    /// A session is already running; the trigger was ignored.
    Rejected { phase: CapturePhase },
}
