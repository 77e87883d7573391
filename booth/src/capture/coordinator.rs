use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::phase::{CaptureEvent, CapturePhase, SessionView, TriggerOutcome};
use crate::context::{BoothContext, ChromeElement};
use crate::link::{ArtifactLink, ArtifactLinkPresenter, LinkDerivationError};
use crate::snapshot::{EncodingError, SnapshotEncoder};
use crate::upload::{UploadError, UploadGateway};

/// Chrome id the QR code is mounted under while revealed.
pub const LINK_CHROME_ID: &str = "artifact-link";
const LINK_Z_INDEX: i32 = 999;
const LINK_MARGIN_PX: i64 = 16;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("snapshot failed: {0}")]
    Encoding(#[from] EncodingError),
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),
    #[error("link derivation failed: {0}")]
    LinkDerivation(#[from] LinkDerivationError),
    #[error("capture step panicked: {0}")]
    Panicked(String),
}

/// Runs at most one capture session at a time on its own task.
///
/// `trigger` must be called from within a tokio runtime. Nothing here ever
/// touches the render loop; the two only share the [`BoothContext`].
#[derive(Clone)]
pub struct CaptureCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<BoothContext>,
    encoder: SnapshotEncoder,
    gateway: Arc<dyn UploadGateway>,
    presenter: ArtifactLinkPresenter,
    countdown_from: u32,
    tick: Duration,
    session: watch::Sender<SessionView>,
    events: broadcast::Sender<CaptureEvent>,
    dismiss: Notify,
    next_session: AtomicU64,
}

impl CaptureCoordinator {
    pub fn new(ctx: Arc<BoothContext>, gateway: Arc<dyn UploadGateway>) -> Self {
        let capture = &ctx.config().capture;
        let encoder = SnapshotEncoder::new(capture);
        let presenter = ArtifactLinkPresenter::new(
            &ctx.config().link,
            Duration::from_secs(capture.reveal_secs),
        );
        let countdown_from = capture.countdown_from.max(1);
        let tick = Duration::from_millis(capture.countdown_tick_ms.max(1));
        let (session, _) = watch::channel(SessionView::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            gateway = gateway.name(),
            countdown_from,
            tick_ms = tick.as_millis() as u64,
            reveal_secs = capture.reveal_secs,
            "capture coordinator ready"
        );

        Self {
            inner: Arc::new(Inner {
                ctx,
                encoder,
                gateway,
                presenter,
                countdown_from,
                tick,
                session,
                events,
                dismiss: Notify::new(),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    /// Start a session if idle. Any other phase rejects the trigger without
    /// touching the running session.
    pub fn trigger(&self) -> TriggerOutcome {
        let inner = &self.inner;
        let mut outcome = None;
        inner.session.send_if_modified(|view| {
            if !view.phase.is_idle() {
                outcome = Some(TriggerOutcome::Rejected { phase: view.phase });
                return false;
            }
            let session_id = inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
            *view = SessionView {
                session_id,
                phase: CapturePhase::Countdown(inner.countdown_from),
                link: None,
                error: None,
            };
            outcome = Some(TriggerOutcome::Started { session_id });
            true
        });

        match outcome {
            Some(TriggerOutcome::Started { session_id }) => {
                // A fresh session hides whatever link is still up.
                inner.ctx.unmount_chrome(LINK_CHROME_ID);
                inner.emit(session_id, CapturePhase::Countdown(inner.countdown_from));
                info!(session_id, "capture triggered");
                let inner = Arc::clone(inner);
                tokio::spawn(async move { inner.run_session(session_id).await });
                TriggerOutcome::Started { session_id }
            }
            Some(rejected) => {
                debug!(?rejected, "trigger ignored");
                rejected
            }
            None => TriggerOutcome::Rejected {
                phase: inner.session.borrow().phase,
            },
        }
    }

    /// Hide the revealed link now. Returns false when nothing is revealed.
    pub fn dismiss(&self) -> bool {
        if self.phase() != CapturePhase::Revealed {
            return false;
        }
        self.inner.dismiss.notify_waiters();
        true
    }

    pub fn phase(&self) -> CapturePhase {
        self.inner.session.borrow().phase
    }

    pub fn view(&self) -> SessionView {
        self.inner.session.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.inner.session.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn emit(&self, session_id: u64, phase: CapturePhase) {
        // No subscribers is fine.
        let _ = self.events.send(CaptureEvent {
            session_id,
            phase,
            at: Instant::now(),
        });
    }

    fn set_phase(
        &self,
        session_id: u64,
        phase: CapturePhase,
        link: Option<Arc<ArtifactLink>>,
        error: Option<String>,
    ) {
        self.session.send_replace(SessionView {
            session_id,
            phase,
            link,
            error,
        });
        self.emit(session_id, phase);
    }

    async fn run_session(self: Arc<Self>, session_id: u64) {
        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        for remaining in (1..self.countdown_from).rev() {
            ticker.tick().await;
            self.set_phase(session_id, CapturePhase::Countdown(remaining), None, None);
        }
        ticker.tick().await;
        self.set_phase(session_id, CapturePhase::Capturing, None, None);

        // A panicking gateway must not leave the session stuck in Uploading.
        let attempt = AssertUnwindSafe(self.capture_and_upload(session_id))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(CaptureError::Panicked(panic_message(&*payload))));

        // The last failure stays visible on the idle view until the next trigger.
        let failure = match attempt {
            Ok(link) => {
                self.reveal(session_id, link).await;
                None
            }
            Err(e) => {
                error!(session_id, error = %e, "capture session failed");
                let message = e.to_string();
                self.set_phase(session_id, CapturePhase::Failed, None, Some(message.clone()));
                Some(message)
            }
        };

        self.set_phase(session_id, CapturePhase::Idle, None, failure);
        debug!(session_id, "capture session finished");
    }

    async fn capture_and_upload(&self, session_id: u64) -> Result<Arc<ArtifactLink>, CaptureError> {
        let ctx = Arc::clone(&self.ctx);
        let encoder = self.encoder.clone();
        let image = tokio::task::spawn_blocking(move || encoder.capture(&ctx))
            .await
            .map_err(|e| EncodingError::Encode(format!("encode task failed: {e}")))??;

        info!(
            session_id,
            bytes = image.len(),
            width = image.width,
            height = image.height,
            "snapshot captured"
        );
        self.set_phase(session_id, CapturePhase::Uploading, None, None);

        let url = self.gateway.upload(image).await?;
        if url.trim().is_empty() {
            return Err(UploadError::EmptyUrl.into());
        }

        let link = self.presenter.derive(&url)?;
        Ok(Arc::new(link))
    }

    async fn reveal(&self, session_id: u64, link: Arc<ArtifactLink>) {
        let qr = Arc::new(link.qr.clone());
        let feed_width = self
            .ctx
            .frames()
            .resolution()
            .map_or(0, |(w, _)| i64::from(w));
        let x = (feed_width - i64::from(qr.width()) - LINK_MARGIN_PX).max(0);
        self.ctx.mount_chrome(
            ChromeElement::new(LINK_CHROME_ID, qr, x, LINK_MARGIN_PX)
                .with_z_index(LINK_Z_INDEX)
                .capture_ignored(),
        );

        // Register for dismissal before anyone can observe Revealed.
        let dismissed = self.dismiss.notified();
        tokio::pin!(dismissed);
        dismissed.as_mut().enable();

        info!(session_id, url = %link.url, "photo link revealed");
        let expires_at = link.expires_at;
        self.set_phase(session_id, CapturePhase::Revealed, Some(link), None);

        tokio::select! {
            _ = sleep_until(expires_at) => debug!(session_id, "reveal timed out"),
            _ = &mut dismissed => debug!(session_id, "reveal dismissed"),
        }

        if !self.ctx.unmount_chrome(LINK_CHROME_ID) {
            warn!(session_id, "link chrome was already gone");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::EncodedImage;
    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};
    use photo_booth_common::config::Config;
    use photo_booth_common::frame::FrameHandle;
    use std::sync::atomic::AtomicUsize;

    enum Reply {
        Url(&'static str),
        Status(u16),
        Panic,
    }

    struct FakeGateway {
        calls: AtomicUsize,
        reply: Reply,
        delay: Option<Duration>,
    }

    impl FakeGateway {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply,
                delay: None,
            })
        }

        fn delayed(reply: Reply, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply,
                delay: Some(delay),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UploadGateway for FakeGateway {
        async fn upload(&self, image: EncodedImage) -> Result<String, UploadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(!image.is_empty());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.reply {
                Reply::Url(url) => Ok(url.to_string()),
                Reply::Status(code) => Err(UploadError::Status(code)),
                Reply::Panic => panic!("gateway blew up"),
            }
        }
    }

    fn context(with_frame: bool) -> Arc<BoothContext> {
        let ctx = BoothContext::new(Config::default());
        if with_frame {
            ctx.frames().publish(FrameHandle::new(
                RgbaImage::from_pixel(64, 48, Rgba([40, 80, 120, 255])),
                0,
                1,
            ));
        }
        Arc::new(ctx)
    }

    async fn events_until_idle(rx: &mut broadcast::Receiver<CaptureEvent>) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            let done = event.phase.is_idle();
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn phases(events: &[CaptureEvent]) -> Vec<CapturePhase> {
        events.iter().map(|e| e.phase).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_ticks_once_per_second() {
        let gateway = FakeGateway::new(Reply::Url("https://cdn.example/x123"));
        let coordinator = CaptureCoordinator::new(context(true), gateway);
        let mut rx = coordinator.subscribe();

        assert_eq!(
            coordinator.trigger(),
            TriggerOutcome::Started { session_id: 1 }
        );
        assert_eq!(coordinator.phase().countdown(), Some(5));

        let events = events_until_idle(&mut rx).await;
        let expected_countdown: Vec<CapturePhase> =
            (1..=5).rev().map(CapturePhase::Countdown).collect();
        assert_eq!(phases(&events[..5]), expected_countdown);
        assert_eq!(events[5].phase, CapturePhase::Capturing);
        assert_eq!(events[5].phase.countdown(), None);

        for pair in events[..6].windows(2) {
            assert_eq!(pair[1].at - pair[0].at, Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_reveals_link_then_hides_it() {
        let ctx = context(true);
        let gateway = FakeGateway::new(Reply::Url("https://cdn.example/x123"));
        let coordinator = CaptureCoordinator::new(Arc::clone(&ctx), gateway.clone());
        let mut rx = coordinator.subscribe();
        coordinator.trigger();

        let revealed = loop {
            let event = rx.recv().await.unwrap();
            if event.phase == CapturePhase::Revealed {
                break event;
            }
        };

        let view = coordinator.view();
        let link = view.link.expect("revealed view carries the link");
        assert_eq!(link.url, "https://cdn.example/x123");
        let reference = ArtifactLinkPresenter::new(&Config::default().link, Duration::from_secs(7))
            .derive("https://cdn.example/x123")
            .unwrap();
        assert_eq!(link.qr, reference.qr);
        assert!(ctx.is_mounted(LINK_CHROME_ID));
        assert!(ctx.chrome().iter().all(|el| el.capture_ignore));

        let idle = rx.recv().await.unwrap();
        assert_eq!(idle.phase, CapturePhase::Idle);
        assert_eq!(idle.at - revealed.at, Duration::from_secs(7));
        assert!(!ctx.is_mounted(LINK_CHROME_ID));
        assert!(coordinator.view().link.is_none());
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_url_fails_without_reveal() {
        let ctx = context(true);
        let coordinator =
            CaptureCoordinator::new(Arc::clone(&ctx), FakeGateway::new(Reply::Url("")));
        let mut rx = coordinator.subscribe();
        coordinator.trigger();

        let events = events_until_idle(&mut rx).await;
        let seen = phases(&events);
        assert!(seen.contains(&CapturePhase::Failed));
        assert!(!seen.contains(&CapturePhase::Revealed));
        assert_eq!(&seen[seen.len() - 2..], &[CapturePhase::Failed, CapturePhase::Idle]);
        assert!(!ctx.is_mounted(LINK_CHROME_ID));
        let view = coordinator.view();
        assert!(view.phase.is_idle());
        assert!(view.error.unwrap().contains("empty photo URL"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_url_fails_without_reveal() {
        let ctx = context(true);
        let coordinator =
            CaptureCoordinator::new(Arc::clone(&ctx), FakeGateway::new(Reply::Url("not a url")));
        let mut rx = coordinator.subscribe();
        coordinator.trigger();

        let seen = phases(&events_until_idle(&mut rx).await);
        assert!(!seen.contains(&CapturePhase::Revealed));
        assert_eq!(&seen[seen.len() - 2..], &[CapturePhase::Failed, CapturePhase::Idle]);
        assert!(!ctx.is_mounted(LINK_CHROME_ID));
        let error = coordinator.view().error.expect("idle view keeps the failure");
        assert!(error.contains("not a valid http(s) URL"), "{error}");
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_gateway_fails_and_returns_to_idle() {
        let ctx = context(true);
        let gateway = FakeGateway::new(Reply::Panic);
        let coordinator = CaptureCoordinator::new(Arc::clone(&ctx), gateway.clone());
        let mut rx = coordinator.subscribe();
        coordinator.trigger();

        let seen = phases(&events_until_idle(&mut rx).await);
        assert!(seen.contains(&CapturePhase::Uploading));
        assert!(!seen.contains(&CapturePhase::Revealed));
        assert_eq!(&seen[seen.len() - 2..], &[CapturePhase::Failed, CapturePhase::Idle]);
        let error = coordinator.view().error.expect("idle view keeps the failure");
        assert!(error.contains("gateway blew up"), "{error}");

        assert!(matches!(coordinator.trigger(), TriggerOutcome::Started { session_id: 2 }));
        events_until_idle(&mut rx).await;
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_frame_fails_before_upload() {
        let gateway = FakeGateway::new(Reply::Url("https://cdn.example/x123"));
        let coordinator = CaptureCoordinator::new(context(false), gateway.clone());
        let mut rx = coordinator.subscribe();
        coordinator.trigger();

        let seen = phases(&events_until_idle(&mut rx).await);
        assert!(seen.contains(&CapturePhase::Failed));
        assert!(!seen.contains(&CapturePhase::Uploading));
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_status_error_fails() {
        let coordinator =
            CaptureCoordinator::new(context(true), FakeGateway::new(Reply::Status(500)));
        let mut rx = coordinator.subscribe();
        coordinator.trigger();

        let seen = phases(&events_until_idle(&mut rx).await);
        assert_eq!(&seen[seen.len() - 2..], &[CapturePhase::Failed, CapturePhase::Idle]);
        let message = coordinator.view().error.expect("idle view keeps the failure");
        assert!(message.contains("500"), "{message}");

        coordinator.trigger();
        assert!(coordinator.view().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retriggers_while_busy_are_ignored() {
        let gateway = FakeGateway::delayed(
            Reply::Url("https://cdn.example/x123"),
            Duration::from_secs(2),
        );
        let coordinator = CaptureCoordinator::new(context(true), gateway.clone());
        let mut rx = coordinator.subscribe();
        assert!(matches!(coordinator.trigger(), TriggerOutcome::Started { .. }));

        let spammer = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let mut started = 0;
                // Countdown ends at 5s, upload at 7s, reveal at 14s.
                for _ in 0..54 {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    if let TriggerOutcome::Started { .. } = coordinator.trigger() {
                        started += 1;
                    }
                }
                started
            })
        };

        let events = events_until_idle(&mut rx).await;
        assert_eq!(spammer.await.unwrap(), 0);
        assert!(events.iter().all(|e| e.session_id == 1));
        assert_eq!(
            phases(&events),
            vec![
                CapturePhase::Countdown(5),
                CapturePhase::Countdown(4),
                CapturePhase::Countdown(3),
                CapturePhase::Countdown(2),
                CapturePhase::Countdown(1),
                CapturePhase::Capturing,
                CapturePhase::Uploading,
                CapturePhase::Revealed,
                CapturePhase::Idle,
            ]
        );
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn accepts_again_once_idle() {
        let coordinator = CaptureCoordinator::new(
            context(true),
            FakeGateway::new(Reply::Url("https://cdn.example/x123")),
        );
        let mut rx = coordinator.subscribe();
        assert_eq!(
            coordinator.trigger(),
            TriggerOutcome::Started { session_id: 1 }
        );
        assert_eq!(
            coordinator.trigger(),
            TriggerOutcome::Rejected {
                phase: CapturePhase::Countdown(5)
            }
        );

        events_until_idle(&mut rx).await;
        assert!(coordinator.phase().is_idle());
        assert_eq!(
            coordinator.trigger(),
            TriggerOutcome::Started { session_id: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dismiss_hides_link_immediately() {
        let ctx = context(true);
        let coordinator = CaptureCoordinator::new(
            Arc::clone(&ctx),
            FakeGateway::new(Reply::Url("https://cdn.example/x123")),
        );
        let mut rx = coordinator.subscribe();
        assert!(!coordinator.dismiss());
        coordinator.trigger();

        let revealed = loop {
            let event = rx.recv().await.unwrap();
            if event.phase == CapturePhase::Revealed {
                break event;
            }
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(coordinator.dismiss());

        let idle = rx.recv().await.unwrap();
        assert_eq!(idle.phase, CapturePhase::Idle);
        assert_eq!(idle.at - revealed.at, Duration::from_secs(2));
        assert!(!ctx.is_mounted(LINK_CHROME_ID));
    }
}
