//! Scan pipeline driver
//!
//! Each tick pulls a frame from the [`AcquisitionLoop`], decodes it on the
//! blocking pool, runs every symbol through the debounce engine and hands
//! accepted reports to the sink. In pipelined mode capture runs in its own
//! task and the decoder always works on the freshest frame available.

use crate::acquisition::{AcquisitionLoop, LoopStats};
use crate::capture::{BackendKind, Frame, ReplayBackend, SharedBackend, SubprocessBackend};
use crate::config::QscanConfig;
use crate::debounce::{DebounceEngine, DebounceState};
use crate::error::{Error, Result};
use crate::metrics;
use crate::output::{ReportSink, ScanReport};
use crate::qr::{DecodedSymbol, Decoder, RqrrDecoder};
use crate::selector::BackendSelector;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Log a progress line every this many frames
pub const PROGRESS_INTERVAL: u64 = 30;

/// What a finished run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Frames decoded
    pub frames: u64,
    /// Frames captured but skipped because the decoder was busy
    pub dropped: u64,
    /// Reports delivered to the sink
    pub reports: u64,
    /// Symbols suppressed as repeats
    pub suppressed: u64,
    /// Frames whose decode failed or panicked
    pub decode_errors: u64,
    /// Acquisition counters at shutdown
    pub acquisition: LoopStats,
}

/// Build the configured backends in preference order
pub fn build_backends(config: &QscanConfig) -> Result<Vec<SharedBackend>> {
    let mut backends: Vec<SharedBackend> = Vec::new();

    for kind in &config.capture.backends {
        match kind {
            #[cfg(feature = "camera")]
            BackendKind::V4l2 => {
                backends.push(Arc::new(crate::capture::V4l2Backend::new(
                    config.capture.read_timeout(),
                )));
            }
            #[cfg(not(feature = "camera"))]
            BackendKind::V4l2 => {
                warn!("Built without the camera feature, skipping v4l2 backend");
            }
            BackendKind::Subprocess => {
                let mut backend = SubprocessBackend::new(config.capture.subprocess_timeout());
                if let Some(path) = &config.capture.utility_search_path {
                    backend = backend.with_search_path(path.clone());
                }
                if let Some(root) = &config.capture.scratch_dir {
                    backend = backend.with_scratch_root(root.clone());
                }
                backends.push(Arc::new(backend));
            }
            BackendKind::Replay => {
                let dir = config.capture.replay_dir.as_ref().ok_or_else(|| {
                    Error::Config("capture.replay_dir is required for the replay backend".into())
                })?;
                backends.push(Arc::new(ReplayBackend::new(dir.clone())));
            }
        }
    }

    if backends.is_empty() {
        return Err(Error::Config("No usable capture backends configured".into()));
    }
    Ok(backends)
}

/// Owns the pipeline state for one scanning session
pub struct ScanCoordinator {
    acquisition: Option<AcquisitionLoop>,
    decoder: Arc<dyn Decoder>,
    debounce: DebounceEngine,
    state: DebounceState,
    sink: Arc<dyn ReportSink>,
    pipelined: bool,
    summary: RunSummary,
}

impl ScanCoordinator {
    /// Assemble a coordinator from its parts
    pub fn new(
        acquisition: AcquisitionLoop,
        decoder: Arc<dyn Decoder>,
        debounce: DebounceEngine,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            acquisition: Some(acquisition),
            decoder,
            debounce,
            state: DebounceState::default(),
            sink,
            pipelined: false,
            summary: RunSummary::default(),
        }
    }

    /// Build the full pipeline described by `config`, decoding with rqrr
    pub fn from_config(config: &QscanConfig, sink: Arc<dyn ReportSink>) -> Result<Self> {
        config.validate()?;

        let selector = BackendSelector::new(build_backends(config)?, config.capture_profiles()?)
            .with_probe_attempts(config.scan.probe_attempts)
            .with_probe_spacing(config.scan.probe_spacing());
        let acquisition = AcquisitionLoop::new(selector, config.loop_settings());

        Ok(Self::new(
            acquisition,
            Arc::new(RqrrDecoder::new()),
            DebounceEngine::new(config.debounce_window()),
            sink,
        )
        .pipelined(config.scan.pipelined))
    }

    /// Capture in a separate task, dropping frames while the decoder is busy
    pub fn pipelined(mut self, enabled: bool) -> Self {
        self.pipelined = enabled;
        self
    }

    /// Debounce memory, for inspection
    pub fn debounce_state(&self) -> &DebounceState {
        &self.state
    }

    /// Scan until cancelled.
    ///
    /// Returns an error only for fatal conditions: no backend could be
    /// selected at start, or none could replace a failing one.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunSummary> {
        info!(pipelined = self.pipelined, "Scanning started");
        let result = if self.pipelined {
            self.run_pipelined(cancel).await
        } else {
            self.run_sequential(cancel).await
        };

        if let Some(acquisition) = &self.acquisition {
            self.summary.acquisition = acquisition.stats();
        }
        info!(
            frames = self.summary.frames,
            reports = self.summary.reports,
            suppressed = self.summary.suppressed,
            ok = result.is_ok(),
            "Scanning stopped"
        );
        result.map(|()| self.summary)
    }

    /// Scan until the first accepted report; `None` when cancelled first
    pub async fn scan_once(&mut self, cancel: &CancellationToken) -> Result<Option<ScanReport>> {
        loop {
            let acquisition = self.acquisition_mut()?;
            let Some(frame) = acquisition.next_frame(cancel).await? else {
                return Ok(None);
            };
            let backend = acquisition.active_backend().unwrap_or("unknown").to_string();

            let mut reports = self.process(frame, &backend).await;
            if !reports.is_empty() {
                return Ok(Some(reports.swap_remove(0)));
            }
        }
    }

    fn acquisition_mut(&mut self) -> Result<&mut AcquisitionLoop> {
        self.acquisition
            .as_mut()
            .ok_or_else(|| Error::Other("acquisition loop is owned by a running pipeline".into()))
    }

    async fn run_sequential(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let acquisition = self.acquisition_mut()?;
            let Some(frame) = acquisition.next_frame(cancel).await? else {
                return Ok(());
            };
            let backend = acquisition.active_backend().unwrap_or("unknown").to_string();
            self.process(frame, &backend).await;
        }
    }

    async fn run_pipelined(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut acquisition = self
            .acquisition
            .take()
            .ok_or_else(|| Error::Other("acquisition loop is already running".into()))?;

        let (tx, mut rx) = mpsc::channel::<(Frame, String)>(1);
        let producer_cancel = cancel.clone();
        let producer = tokio::spawn(async move {
            let mut dropped = 0u64;
            let result = loop {
                match acquisition.next_frame(&producer_cancel).await {
                    Ok(Some(frame)) => {
                        let backend = acquisition.active_backend().unwrap_or("unknown").to_string();
                        match tx.try_send((frame, backend)) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                dropped += 1;
                                debug!(dropped, "Decoder busy, frame dropped");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break Ok(()),
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                }
            };
            (acquisition, dropped, result)
        });

        while let Some((frame, backend)) = rx.recv().await {
            self.process(frame, &backend).await;
        }

        let (acquisition, dropped, result) = producer
            .await
            .map_err(|e| Error::Other(format!("capture task failed: {e}")))?;
        self.summary.dropped += dropped;
        self.acquisition = Some(acquisition);
        result
    }

    /// Decode one frame and report whatever survives debouncing
    async fn process(&mut self, frame: Frame, backend: &str) -> Vec<ScanReport> {
        self.summary.frames += 1;

        let started = std::time::Instant::now();
        let decoder = Arc::clone(&self.decoder);
        let image = frame.image;
        let symbols = match tokio::task::spawn_blocking(move || decoder.decode(image.into_luma8()))
            .await
        {
            Ok(Ok(symbols)) => symbols,
            Ok(Err(err)) => {
                debug!(error = %err, "Frame decode failed");
                self.summary.decode_errors += 1;
                Vec::new()
            }
            Err(err) => {
                warn!(error = %err, "Decode task aborted");
                self.summary.decode_errors += 1;
                Vec::new()
            }
        };
        metrics::record_decode(started.elapsed(), symbols.len());

        let reports = self.report_symbols(symbols, Instant::now(), backend);

        if self.summary.frames % PROGRESS_INTERVAL == 0 {
            info!(
                frames = self.summary.frames,
                reports = self.summary.reports,
                backend,
                "Scan progress"
            );
        }
        reports
    }

    /// Debounce `symbols` seen at `now` and emit the accepted ones
    pub fn report_symbols(
        &mut self,
        symbols: Vec<DecodedSymbol>,
        now: Instant,
        backend: &str,
    ) -> Vec<ScanReport> {
        let mut accepted = Vec::new();

        for symbol in symbols {
            if !self.debounce.should_report(&mut self.state, &symbol.payload, now) {
                self.summary.suppressed += 1;
                metrics::record_report(false);
                debug!(payload = %symbol.payload, "Repeat suppressed");
                continue;
            }

            let report = ScanReport::new(symbol, backend, now);
            info!(
                payload = %report.payload,
                symbology = %report.symbology,
                backend,
                "Code scanned"
            );
            if let Err(err) = self.sink.emit(&report) {
                warn!(error = %err, "Report sink failed");
            }
            self.summary.reports += 1;
            metrics::record_report(true);
            accepted.push(report);
        }

        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::LoopSettings;
    use crate::capture::{CaptureBackend, CaptureConfig, CaptureResult, FrameSource};
    use crate::error::CaptureFailure;
    use crate::output::MemorySink;
    use crate::qr::BoundingBox;
    use async_trait::async_trait;
    use image::{DynamicImage, GrayImage};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct BlankCamera;

    struct BlankSource;

    #[async_trait]
    impl FrameSource for BlankSource {
        async fn acquire(&mut self) -> CaptureResult {
            Ok(Frame::new(DynamicImage::ImageLuma8(GrayImage::new(16, 16))))
        }
    }

    #[async_trait]
    impl CaptureBackend for BlankCamera {
        fn name(&self) -> &str {
            "blank"
        }

        async fn open(
            &self,
            _config: &CaptureConfig,
        ) -> std::result::Result<Box<dyn FrameSource>, CaptureFailure> {
            Ok(Box::new(BlankSource))
        }
    }

    /// Returns scripted payload lists per frame, cancelling once exhausted
    struct ScriptedDecoder {
        script: Mutex<VecDeque<Option<Vec<&'static str>>>>,
        cancel: CancellationToken,
    }

    impl Decoder for ScriptedDecoder {
        fn decode(&self, _image: GrayImage) -> Result<Vec<DecodedSymbol>> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Some(payloads)) => Ok(payloads
                    .into_iter()
                    .map(|p| DecodedSymbol::qr(p, BoundingBox::default()))
                    .collect()),
                Some(None) => Err(Error::Decode("damaged symbol".into())),
                None => {
                    self.cancel.cancel();
                    Ok(Vec::new())
                }
            }
        }
    }

    fn coordinator(
        script: Vec<Option<Vec<&'static str>>>,
        cancel: &CancellationToken,
        sink: Arc<MemorySink>,
    ) -> ScanCoordinator {
        let fast = CaptureConfig {
            fps: 100,
            ..CaptureConfig::embedded()
        };
        let selector = BackendSelector::new(vec![Arc::new(BlankCamera)], vec![fast]);
        let acquisition = AcquisitionLoop::new(selector, LoopSettings::default());
        let decoder = ScriptedDecoder {
            script: Mutex::new(script.into()),
            cancel: cancel.clone(),
        };
        ScanCoordinator::new(
            acquisition,
            Arc::new(decoder),
            DebounceEngine::new(Duration::from_secs(2)),
            sink,
        )
    }

    #[test]
    fn test_debounce_across_frames() {
        let sink = Arc::new(MemorySink::new());
        let cancel = CancellationToken::new();
        let mut coordinator = coordinator(vec![], &cancel, sink.clone());

        let t0 = Instant::now();
        let secs = |s: u64| t0 + Duration::from_secs(s);
        let x = || vec![DecodedSymbol::qr("X", BoundingBox::default())];
        let y = || vec![DecodedSymbol::qr("Y", BoundingBox::default())];

        coordinator.report_symbols(x(), secs(0), "test");
        coordinator.report_symbols(x(), secs(1), "test");
        coordinator.report_symbols(Vec::new(), secs(3), "test");
        coordinator.report_symbols(y(), secs(3), "test");

        let reports = sink.reports();
        let seen: Vec<(&str, Instant)> = reports
            .iter()
            .map(|r| (r.payload.as_str(), r.seen_at))
            .collect();
        assert_eq!(seen, vec![("X", secs(0)), ("Y", secs(3))]);
        assert_eq!(coordinator.debounce_state().last_payload.as_deref(), Some("Y"));
    }

    #[tokio::test]
    async fn test_run_reports_until_cancelled() {
        let sink = Arc::new(MemorySink::new());
        let cancel = CancellationToken::new();
        let script = vec![
            Some(vec!["A"]),
            Some(vec!["A"]),
            None,
            Some(vec![]),
            Some(vec!["B", "A"]),
        ];
        let mut coordinator = coordinator(script, &cancel, sink.clone());

        let summary = coordinator.run(&cancel).await.unwrap();
        assert_eq!(sink.payloads(), vec!["A", "B", "A"]);
        assert_eq!(summary.frames, 6);
        assert_eq!(summary.reports, 3);
        assert_eq!(summary.suppressed, 1);
        assert_eq!(summary.decode_errors, 1);
        assert_eq!(summary.acquisition.frames, 6);
    }

    #[tokio::test]
    async fn test_pipelined_run_keeps_capture_order() {
        let sink = Arc::new(MemorySink::new());
        let cancel = CancellationToken::new();
        let script = vec![Some(vec!["A"]), Some(vec!["A"]), Some(vec!["B"])];
        let mut coordinator = coordinator(script, &cancel, sink.clone()).pipelined(true);

        let summary = coordinator.run(&cancel).await.unwrap();
        assert_eq!(sink.payloads(), vec!["A", "B"]);
        assert!(summary.frames >= 4);
        assert!(summary.acquisition.frames >= summary.frames);
    }

    #[tokio::test]
    async fn test_scan_once_returns_first_report() {
        let sink = Arc::new(MemorySink::new());
        let cancel = CancellationToken::new();
        let script = vec![Some(vec![]), Some(vec!["door-42"])];
        let mut coordinator = coordinator(script, &cancel, sink.clone());

        let report = coordinator.scan_once(&cancel).await.unwrap().unwrap();
        assert_eq!(report.payload, "door-42");
        assert_eq!(report.backend, "blank");
        assert_eq!(sink.payloads(), vec!["door-42"]);
    }

    #[tokio::test]
    async fn test_scan_once_cancelled() {
        let sink = Arc::new(MemorySink::new());
        let cancel = CancellationToken::new();
        let mut coordinator = coordinator(vec![Some(vec![])], &cancel, sink.clone());

        assert!(coordinator.scan_once(&cancel).await.unwrap().is_none());
        assert!(sink.reports().is_empty());
    }
}
