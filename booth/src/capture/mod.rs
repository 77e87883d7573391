pub mod coordinator;
pub mod phase;

pub use coordinator::{CaptureCoordinator, CaptureError, LINK_CHROME_ID};
pub use phase::{CaptureEvent, CapturePhase, SessionView, TriggerOutcome};
