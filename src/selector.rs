//! Capture backend selection
//!
//! Walks the backends in preference order and, for each, the capture
//! profiles in preference order. A candidate only wins once it has actually
//! delivered a frame; opening successfully is not enough, plenty of drivers
//! open fine and then never produce a buffer. The frame that proved a
//! candidate is kept in the handle and delivered as the first frame.

use crate::acquisition::pause_until;
use crate::capture::{BackendHandle, CaptureConfig, Frame, SharedBackend};
use crate::error::{CaptureFailure, SelectionAttempt, SelectionFailure};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of probe captures per candidate
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 3;

/// Default spacing between probe captures
pub const DEFAULT_PROBE_SPACING: Duration = Duration::from_millis(100);

/// Shortest accepted spacing between probe captures
pub const MIN_PROBE_SPACING: Duration = Duration::from_millis(10);

/// Something that can produce a working capture handle
#[async_trait]
pub trait SelectBackend: Send + Sync {
    /// Find a backend that delivers frames, or explain why none does.
    ///
    /// Stops early once `cancel` fires; the caller checks the token before
    /// treating a failure as fatal.
    async fn select(&self, cancel: &CancellationToken)
    -> Result<BackendHandle, SelectionFailure>;
}

/// Ranks backends × capture profiles and probes them in order
pub struct BackendSelector {
    backends: Vec<SharedBackend>,
    configs: Vec<CaptureConfig>,
    probe_attempts: u32,
    probe_spacing: Duration,
}

impl BackendSelector {
    /// Selector over `backends` (outer order) and `configs` (inner order)
    pub fn new(backends: Vec<SharedBackend>, configs: Vec<CaptureConfig>) -> Self {
        Self {
            backends,
            configs,
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
            probe_spacing: DEFAULT_PROBE_SPACING,
        }
    }

    /// Override how many captures a candidate gets to prove itself
    pub fn with_probe_attempts(mut self, attempts: u32) -> Self {
        self.probe_attempts = attempts.max(1);
        self
    }

    /// Override the pause between probe captures (at least [`MIN_PROBE_SPACING`])
    pub fn with_probe_spacing(mut self, spacing: Duration) -> Self {
        self.probe_spacing = spacing.max(MIN_PROBE_SPACING);
        self
    }

    /// Number of backend/profile combinations that will be tried
    pub fn candidate_count(&self) -> usize {
        self.backends.len() * self.configs.len()
    }

    async fn probe(
        &self,
        handle: &mut BackendHandle,
        cancel: &CancellationToken,
    ) -> Result<Frame, Vec<CaptureFailure>> {
        let mut failures = Vec::new();

        for attempt in 0..self.probe_attempts {
            if attempt > 0 && !pause_until(Instant::now() + self.probe_spacing, cancel).await {
                break;
            }
            if cancel.is_cancelled() {
                break;
            }

            match handle.acquire().await {
                Ok(frame) => {
                    debug!(
                        backend = handle.backend(),
                        width = frame.width(),
                        height = frame.height(),
                        attempt = attempt + 1,
                        "Probe frame captured"
                    );
                    return Ok(frame);
                }
                Err(failure) => {
                    debug!(
                        backend = handle.backend(),
                        attempt = attempt + 1,
                        reason = %failure,
                        "Probe capture failed"
                    );
                    let give_up = !failure.is_transient();
                    failures.push(failure);
                    if give_up {
                        break;
                    }
                }
            }
        }

        Err(failures)
    }
}

#[async_trait]
impl SelectBackend for BackendSelector {
    async fn select(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, SelectionFailure> {
        let mut attempts = Vec::new();

        for backend in &self.backends {
            for config in &self.configs {
                if cancel.is_cancelled() {
                    debug!(tried = attempts.len(), "Selection cancelled");
                    return Err(SelectionFailure { attempts });
                }

                let label = config.label();
                debug!(backend = backend.name(), config = %label, "Trying capture candidate");

                let source = match backend.open(config).await {
                    Ok(source) => source,
                    Err(failure) => {
                        warn!(backend = backend.name(), config = %label, reason = %failure, "Capture candidate failed to open");
                        attempts.push(SelectionAttempt {
                            backend: backend.name().to_string(),
                            config: label,
                            failure,
                        });
                        continue;
                    }
                };

                let mut handle = BackendHandle::new(backend.name(), config.clone(), source);
                match self.probe(&mut handle, cancel).await {
                    Ok(frame) => {
                        info!(
                            backend = backend.name(),
                            config = %config,
                            rejected = attempts.len(),
                            "Capture backend selected"
                        );
                        handle.hold(frame);
                        return Ok(handle);
                    }
                    Err(failures) => {
                        warn!(
                            backend = backend.name(),
                            config = %label,
                            probes = failures.len(),
                            "Capture candidate opened but produced no usable frame"
                        );
                        handle.release();
                        attempts.extend(failures.into_iter().map(|failure| SelectionAttempt {
                            backend: backend.name().to_string(),
                            config: label.clone(),
                            failure,
                        }));
                    }
                }
            }
        }

        Err(SelectionFailure { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureBackend, CaptureResult, Frame, FrameSource};
    use image::{DynamicImage, GrayImage};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behaviour {
        FailOpen,
        EmptyFrames,
        Frames,
    }

    struct StubBackend {
        name: &'static str,
        behaviour: Behaviour,
        opens: AtomicUsize,
        acquires: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl StubBackend {
        fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name,
                behaviour,
                opens: AtomicUsize::new(0),
                acquires: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    struct StubSource {
        behaviour: Behaviour,
        acquires: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSource for StubSource {
        async fn acquire(&mut self) -> CaptureResult {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::EmptyFrames => Ok(Frame::new(DynamicImage::ImageLuma8(GrayImage::new(0, 0)))),
                _ => Ok(Frame::new(DynamicImage::ImageLuma8(GrayImage::new(8, 8)))),
            }
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CaptureBackend for StubBackend {
        fn name(&self) -> &str {
            self.name
        }

        async fn open(
            &self,
            _config: &CaptureConfig,
        ) -> Result<Box<dyn FrameSource>, CaptureFailure> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::FailOpen => Err(CaptureFailure::OpenFailed("busy".to_string())),
                behaviour => Ok(Box::new(StubSource {
                    behaviour,
                    acquires: Arc::clone(&self.acquires),
                    closes: Arc::clone(&self.closes),
                })),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_selects_first_working_candidate_and_closes_rejects() {
        let a = StubBackend::new("a", Behaviour::FailOpen);
        let b = StubBackend::new("b", Behaviour::EmptyFrames);
        let c = StubBackend::new("c", Behaviour::Frames);

        let selector = BackendSelector::new(
            vec![a.clone(), b.clone(), c.clone()],
            vec![CaptureConfig::embedded()],
        );
        let mut handle = selector.select(&CancellationToken::new()).await.unwrap();

        assert_eq!(handle.backend(), "c");
        assert_eq!(a.closes.load(Ordering::SeqCst), 0, "a failed to open");
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);
        assert_eq!(c.closes.load(Ordering::SeqCst), 0, "selected handle stays open");

        // The frame that won selection comes out first, without a new capture
        assert_eq!(c.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(handle.acquire().await.unwrap().width(), 8);
        assert_eq!(c.acquires.load(Ordering::SeqCst), 1);
        handle.acquire().await.unwrap();
        assert_eq!(c.acquires.load(Ordering::SeqCst), 2);

        drop(handle);
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);
        assert_eq!(c.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_lists_every_failure_in_order() {
        let a = StubBackend::new("a", Behaviour::FailOpen);
        let b = StubBackend::new("b", Behaviour::EmptyFrames);

        let selector = BackendSelector::new(
            vec![a.clone(), b.clone()],
            vec![CaptureConfig::embedded(), CaptureConfig::compatible()],
        );
        let failure = selector
            .select(&CancellationToken::new())
            .await
            .unwrap_err();

        let summary: Vec<(String, String, &str)> = failure
            .attempts
            .iter()
            .map(|a| (a.backend.clone(), a.config.clone(), a.failure.kind()))
            .collect();

        let embedded = CaptureConfig::embedded().label();
        let compatible = CaptureConfig::compatible().label();
        let mut expected = vec![
            ("a".to_string(), embedded.clone(), "open_failed"),
            ("a".to_string(), compatible.clone(), "open_failed"),
        ];
        expected.extend((0..3).map(|_| ("b".to_string(), embedded.clone(), "empty_frame")));
        expected.extend((0..3).map(|_| ("b".to_string(), compatible.clone(), "empty_frame")));
        assert_eq!(summary, expected);

        assert_eq!(a.opens.load(Ordering::SeqCst), 2);
        assert_eq!(b.opens.load(Ordering::SeqCst), 2);
        assert_eq!(b.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_attempts_are_spaced() {
        let b = StubBackend::new("b", Behaviour::EmptyFrames);
        let selector = BackendSelector::new(vec![b], vec![CaptureConfig::embedded()])
            .with_probe_spacing(Duration::from_millis(100));

        let started = tokio::time::Instant::now();
        let _ = selector.select(&CancellationToken::new()).await;
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_selection_stops_between_attempts() {
        let b = StubBackend::new("b", Behaviour::EmptyFrames);
        let selector = BackendSelector::new(
            vec![b.clone()],
            vec![CaptureConfig::embedded(), CaptureConfig::compatible()],
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let failure = selector.select(&cancel).await.unwrap_err();
        assert_eq!(started.elapsed(), Duration::from_millis(10));
        assert_eq!(failure.attempts.len(), 1, "only the first probe ran");
        assert_eq!(b.opens.load(Ordering::SeqCst), 1);
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_opens_nothing() {
        let c = StubBackend::new("c", Behaviour::Frames);
        let selector = BackendSelector::new(vec![c.clone()], vec![CaptureConfig::embedded()]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let failure = selector.select(&cancel).await.unwrap_err();
        assert!(failure.attempts.is_empty());
        assert_eq!(c.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attempt_spacing_has_a_floor() {
        let selector = BackendSelector::new(Vec::new(), Vec::new()).with_probe_spacing(Duration::ZERO);
        assert_eq!(selector.probe_spacing, MIN_PROBE_SPACING);
    }
}
