//! Frame acquisition state machine
//!
//! ```text
//! Uninitialized -> Selecting -> Running <-> Recovering
//!                      |           |            |
//!                      +-------> Stopped <------+
//! ```
//!
//! The loop owns at most one [`BackendHandle`]. A run of consecutive capture
//! failures reaching the threshold releases that handle before a fresh
//! selection is attempted. Sleeps race against cancellation, and selection
//! gives up between candidates once cancelled; calls into a device or child
//! process always run to completion.

use crate::capture::{BackendHandle, CaptureConfig, Frame};
use crate::error::Result;
use crate::metrics;
use crate::selector::SelectBackend;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default consecutive failures tolerated before re-selecting
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 10;

/// Default pause after a failed capture
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_millis(300);

/// Shortest accepted pause after a failed capture
pub const MIN_FAILURE_BACKOFF: Duration = Duration::from_millis(10);

/// Lifecycle of an [`AcquisitionLoop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Nothing has been opened yet
    Uninitialized,
    /// Looking for a working backend
    Selecting,
    /// Delivering frames from the active backend
    Running,
    /// Active backend abandoned, looking for a replacement
    Recovering,
    /// Terminal; no handle is held
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Uninitialized => "uninitialized",
            LoopState::Selecting => "selecting",
            LoopState::Running => "running",
            LoopState::Recovering => "recovering",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Failure handling knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    /// Consecutive failures that trigger re-selection
    pub failure_threshold: u32,
    /// Sleep after each failed capture
    pub failure_backoff: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
        }
    }
}

/// Counters since the loop was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    /// Frames delivered
    pub frames: u64,
    /// Failed captures
    pub failures: u64,
    /// Successful re-selections after a failure streak
    pub reselections: u64,
    /// Current consecutive failure count
    pub streak: u32,
}

/// Drives a selected backend and replaces it when it stops working
pub struct AcquisitionLoop {
    selector: Box<dyn SelectBackend>,
    settings: LoopSettings,
    state: LoopState,
    handle: Option<BackendHandle>,
    stats: LoopStats,
    next_due: Option<Instant>,
    last_frame_at: Option<Instant>,
}

impl AcquisitionLoop {
    /// Loop that selects through `selector` on first use
    pub fn new(selector: impl SelectBackend + 'static, settings: LoopSettings) -> Self {
        Self {
            selector: Box::new(selector),
            settings: LoopSettings {
                failure_threshold: settings.failure_threshold.max(1),
                failure_backoff: settings.failure_backoff.max(MIN_FAILURE_BACKOFF),
            },
            state: LoopState::Uninitialized,
            handle: None,
            stats: LoopStats::default(),
            next_due: None,
            last_frame_at: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Counters so far
    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Name of the backend currently delivering frames
    pub fn active_backend(&self) -> Option<&str> {
        self.handle.as_ref().map(BackendHandle::backend)
    }

    /// Capture profile of the active backend
    pub fn active_config(&self) -> Option<&CaptureConfig> {
        self.handle.as_ref().map(BackendHandle::config)
    }

    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` once the loop has stopped because of cancellation,
    /// and an error when selection or re-selection found nothing usable.
    /// Either way the loop is `Stopped` afterwards and holds no handle.
    pub async fn next_frame(&mut self, cancel: &CancellationToken) -> Result<Option<Frame>> {
        loop {
            if cancel.is_cancelled() {
                self.shutdown();
                return Ok(None);
            }

            match self.state {
                LoopState::Stopped => return Ok(None),
                LoopState::Uninitialized => {
                    debug!("Starting backend selection");
                    self.state = LoopState::Selecting;
                }
                LoopState::Selecting | LoopState::Recovering => {
                    self.select(cancel).await?;
                }
                LoopState::Running => {
                    if let Some(due) = self.next_due {
                        if !pause_until(due, cancel).await {
                            self.shutdown();
                            return Ok(None);
                        }
                    }

                    if let Some(frame) = self.tick(cancel).await {
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    async fn select(&mut self, cancel: &CancellationToken) -> Result<()> {
        let recovering = self.state == LoopState::Recovering;

        let selected = self.selector.select(cancel).await;
        if cancel.is_cancelled() {
            if let Ok(handle) = selected {
                handle.release();
            }
            debug!(state = %self.state, "Selection interrupted by cancellation");
            self.shutdown();
            return Ok(());
        }

        match selected {
            Ok(handle) => {
                if recovering {
                    self.stats.reselections += 1;
                    metrics::record_reselection();
                }
                info!(
                    backend = handle.backend(),
                    config = %handle.config(),
                    recovered = recovering,
                    "Capture backend active"
                );

                self.handle = Some(handle);
                self.stats.streak = 0;
                self.next_due = None;
                self.state = LoopState::Running;
                metrics::record_failure_streak(0);
                Ok(())
            }
            Err(failure) => {
                error!(
                    state = %self.state,
                    attempts = failure.attempts.len(),
                    "No capture backend available"
                );
                self.shutdown();
                Err(failure.into_error())
            }
        }
    }

    /// One capture attempt in the `Running` state
    async fn tick(&mut self, cancel: &CancellationToken) -> Option<Frame> {
        let Some(handle) = self.handle.as_mut() else {
            self.state = LoopState::Selecting;
            return None;
        };

        let started = Instant::now();
        match handle.acquire().await {
            Ok(frame) => {
                self.stats.frames += 1;
                self.stats.streak = 0;
                self.next_due = Some(started + handle.config().frame_interval());

                if let Some(previous) = self.last_frame_at.replace(frame.captured_at) {
                    metrics::record_frame_interval(frame.captured_at.saturating_duration_since(previous));
                }
                metrics::record_capture(handle.backend(), true);
                metrics::record_failure_streak(0);
                Some(frame)
            }
            Err(failure) => {
                self.stats.failures += 1;
                self.stats.streak += 1;
                let streak = self.stats.streak;

                metrics::record_capture(handle.backend(), false);
                metrics::record_failure_streak(u64::from(streak));
                warn!(
                    backend = handle.backend(),
                    streak,
                    threshold = self.settings.failure_threshold,
                    kind = failure.kind(),
                    reason = %failure,
                    "Capture failed"
                );

                if streak >= self.settings.failure_threshold {
                    warn!(streak, "Failure threshold reached, re-selecting capture backend");
                    if let Some(handle) = self.handle.take() {
                        handle.release();
                    }
                    self.next_due = None;
                    self.state = LoopState::Recovering;
                    return None;
                }

                let resume_at = Instant::now() + self.settings.failure_backoff;
                if !pause_until(resume_at, cancel).await {
                    self.shutdown();
                }
                None
            }
        }
    }

    /// Release the active handle and enter `Stopped`
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
        if self.state != LoopState::Stopped {
            debug!(
                frames = self.stats.frames,
                failures = self.stats.failures,
                reselections = self.stats.reselections,
                "Acquisition stopped"
            );
        }
        self.state = LoopState::Stopped;
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleep until `deadline`; false when cancelled first
pub(crate) async fn pause_until(deadline: Instant, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}
