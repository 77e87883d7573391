//! Live camera overlay with a countdown capture, upload, and QR handoff.
//!
//! The [`compositor::OverlayCompositor`] renders scene overlays on every
//! tick while the [`capture::CaptureCoordinator`] runs one capture session
//! at a time on its own task. Both share a [`context::BoothContext`].

pub mod camera;
pub mod capture;
pub mod compositor;
pub mod context;
pub mod link;
pub mod snapshot;
pub mod source;
pub mod upload;

pub use capture::{
    CaptureCoordinator, CaptureError, CaptureEvent, CapturePhase, SessionView, TriggerOutcome,
};
pub use compositor::{
    CompositorHandle, OverlayCompositor, OverlayModel, SceneSetup, Sprite, TickError, Transform,
};
pub use context::{BoothContext, ChromeElement};
pub use link::{ArtifactLink, ArtifactLinkPresenter, LinkDerivationError};
pub use snapshot::{EncodedImage, EncodingError, SnapshotEncoder, VisualTree};
pub use source::FrameSource;
pub use upload::{HttpUploadGateway, UploadError, UploadGateway};
