//! Lightweight runtime metrics aggregation for the scan pipeline
//!
//! Recording is a no-op until [`enable`] is called, so library users who do
//! not care about metrics pay for nothing beyond an atomic load.

use crate::config::MetricsFormat;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

static METRICS: OnceLock<Arc<MetricsInner>> = OnceLock::new();
static LAST_SNAPSHOT: OnceLock<Mutex<Option<Snapshot>>> = OnceLock::new();

/// Enable periodic metrics emission with the provided interval in seconds.
pub fn enable(interval_secs: u64) {
    let interval = interval_secs.max(5);
    let inner = Arc::clone(METRICS.get_or_init(|| Arc::new(MetricsInner::new(interval))));
    inner.update_interval(interval);
    inner.ensure_task();
}

/// Record the outcome of one capture attempt on `backend`.
pub fn record_capture(backend: &str, success: bool) {
    with_state(|state| {
        let entry = state.per_backend.entry(backend.to_string()).or_default();
        if success {
            state.captures_ok += 1;
            entry.ok += 1;
        } else {
            state.captures_failed += 1;
            entry.failed += 1;
        }
    });
}

/// Record how long decoding a frame took and how many symbols it yielded.
pub fn record_decode(duration: Duration, symbols: usize) {
    with_state(|state| {
        state.decodes += 1;
        state.decode_duration += duration;
        state.symbols += symbols as u64;
    });
}

/// Record a debounce decision.
pub fn record_report(accepted: bool) {
    with_state(|state| {
        if accepted {
            state.reports_accepted += 1;
        } else {
            state.reports_suppressed += 1;
        }
    });
}

/// Record a backend replacement after a failure streak.
pub fn record_reselection() {
    with_state(|state| state.reselections += 1);
}

/// Record the current consecutive capture failure count.
pub fn record_failure_streak(level: u64) {
    with_state(|state| {
        state.failure_streak = level;
        state.failure_streak_peak = state.failure_streak_peak.max(level);
    });
}

/// Record the observed interval between successive frames.
pub fn record_frame_interval(interval: Duration) {
    with_state(|state| {
        state.frame_interval_total += interval;
        state.frame_interval_samples += 1;
        state.frame_interval_max = state.frame_interval_max.max(interval);
        state.last_frame_interval = Some(interval);
    });
}

/// Spawn a lightweight HTTP endpoint that exposes the latest metrics snapshot.
pub fn spawn_http_endpoint(addr: SocketAddr, format: MetricsFormat) -> Result<()> {
    let std_listener = std::net::TcpListener::bind(addr).map_err(Error::Io)?;
    std_listener.set_nonblocking(true).map_err(Error::Io)?;
    let listener = TcpListener::from_std(std_listener).map_err(Error::Io)?;

    tokio::spawn(async move {
        if let Err(err) = run_http_listener(listener, format).await {
            tracing::error!(target: "qscan::metrics", error = %err, "metrics endpoint error");
        }
    });

    Ok(())
}

fn with_state(update: impl FnOnce(&mut MetricsState)) {
    if let Some(inner) = METRICS.get() {
        update(&mut inner.lock());
    }
}

struct MetricsInner {
    state: Mutex<MetricsState>,
    interval_secs: AtomicU64,
    task_spawned: AtomicBool,
}

impl MetricsInner {
    fn new(interval_secs: u64) -> Self {
        Self {
            state: Mutex::new(MetricsState::new()),
            interval_secs: AtomicU64::new(interval_secs.max(5)),
            task_spawned: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_interval(&self, interval_secs: u64) {
        self.interval_secs
            .store(interval_secs.max(5), Ordering::Relaxed);
    }

    fn ensure_task(self: &Arc<Self>) {
        if self
            .task_spawned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let runner = Arc::clone(self);
            tokio::spawn(async move {
                runner.run().await;
            });
        }
    }

    async fn run(self: Arc<Self>) {
        let mut current_secs = self.interval_secs.load(Ordering::Relaxed).max(5);
        loop {
            let mut ticker = time::interval(Duration::from_secs(current_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; skip it so a window is a full interval
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let snapshot = self.lock().snapshot_and_reset();
                store_snapshot(&snapshot);
                log_snapshot(&snapshot);

                let next_secs = self.interval_secs.load(Ordering::Relaxed).max(5);
                if next_secs != current_secs {
                    current_secs = next_secs;
                    break;
                }
            }
        }
    }
}

#[derive(Default)]
struct BackendCounters {
    ok: u64,
    failed: u64,
}

struct MetricsState {
    captures_ok: u64,
    captures_failed: u64,
    per_backend: HashMap<String, BackendCounters>,
    decodes: u64,
    decode_duration: Duration,
    symbols: u64,
    reports_accepted: u64,
    reports_suppressed: u64,
    reselections: u64,
    last_reset: Instant,
    frame_interval_total: Duration,
    frame_interval_samples: u64,
    frame_interval_max: Duration,
    last_frame_interval: Option<Duration>,
    failure_streak: u64,
    failure_streak_peak: u64,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            captures_ok: 0,
            captures_failed: 0,
            per_backend: HashMap::new(),
            decodes: 0,
            decode_duration: Duration::ZERO,
            symbols: 0,
            reports_accepted: 0,
            reports_suppressed: 0,
            reselections: 0,
            last_reset: Instant::now(),
            frame_interval_total: Duration::ZERO,
            frame_interval_samples: 0,
            frame_interval_max: Duration::ZERO,
            last_frame_interval: None,
            failure_streak: 0,
            failure_streak_peak: 0,
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut per_backend: Vec<BackendSnapshot> = self
            .per_backend
            .iter()
            .map(|(backend, counters)| BackendSnapshot {
                backend: backend.clone(),
                ok: counters.ok,
                failed: counters.failed,
            })
            .collect();
        per_backend.sort_by(|a, b| a.backend.cmp(&b.backend));

        let frame_interval_avg = if self.frame_interval_samples > 0 {
            let divisor = u32::try_from(self.frame_interval_samples).unwrap_or(u32::MAX);
            self.frame_interval_total.checked_div(divisor)
        } else {
            None
        };

        Snapshot {
            captures_ok: self.captures_ok,
            captures_failed: self.captures_failed,
            decodes: self.decodes,
            decode_duration: self.decode_duration,
            symbols: self.symbols,
            reports_accepted: self.reports_accepted,
            reports_suppressed: self.reports_suppressed,
            reselections: self.reselections,
            elapsed: self.last_reset.elapsed(),
            per_backend,
            frame_interval_avg,
            frame_interval_max: (self.frame_interval_samples > 0)
                .then_some(self.frame_interval_max),
            last_frame_interval: self.last_frame_interval,
            failure_streak: self.failure_streak,
            failure_streak_peak: self.failure_streak_peak,
        }
    }

    fn snapshot_and_reset(&mut self) -> Snapshot {
        let snapshot = self.snapshot();
        let streak = self.failure_streak;
        *self = Self::new();
        // Streak spans windows; only the peak restarts
        self.failure_streak = streak;
        self.failure_streak_peak = streak;
        snapshot
    }
}

#[derive(Clone)]
struct Snapshot {
    captures_ok: u64,
    captures_failed: u64,
    decodes: u64,
    decode_duration: Duration,
    symbols: u64,
    reports_accepted: u64,
    reports_suppressed: u64,
    reselections: u64,
    elapsed: Duration,
    per_backend: Vec<BackendSnapshot>,
    frame_interval_avg: Option<Duration>,
    frame_interval_max: Option<Duration>,
    last_frame_interval: Option<Duration>,
    failure_streak: u64,
    failure_streak_peak: u64,
}

impl Snapshot {
    fn captures_total(&self) -> u64 {
        self.captures_ok + self.captures_failed
    }

    fn capture_success_ratio(&self) -> f64 {
        match self.captures_total() {
            0 => 0.0,
            total => self.captures_ok as f64 / total as f64,
        }
    }

    fn decode_avg(&self) -> Duration {
        match u32::try_from(self.decodes) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.decode_duration / n,
            Err(_) => self.decode_duration / u32::MAX,
        }
    }
}

#[derive(Clone)]
struct BackendSnapshot {
    backend: String,
    ok: u64,
    failed: u64,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

fn log_snapshot(snapshot: &Snapshot) {
    let success_rate = snapshot.capture_success_ratio() * 100.0;

    info!(
        target: "qscan::metrics",
        interval_secs = snapshot.elapsed.as_secs(),
        captures = snapshot.captures_total(),
        capture_failures = snapshot.captures_failed,
        capture_success_rate = format_args!("{success_rate:.1}%"),
        decode_avg_ms = millis(snapshot.decode_avg()),
        symbols = snapshot.symbols,
        reports = snapshot.reports_accepted,
        suppressed = snapshot.reports_suppressed,
        reselections = snapshot.reselections,
        frame_interval_avg_ms = snapshot.frame_interval_avg.map(millis),
        frame_interval_max_ms = snapshot.frame_interval_max.map(millis),
        failure_streak = snapshot.failure_streak,
        failure_streak_peak = snapshot.failure_streak_peak,
        "Scan metrics window"
    );

    if snapshot.per_backend.len() > 1 {
        let breakdown = snapshot
            .per_backend
            .iter()
            .map(|entry| format!("{}: {} ok / {} err", entry.backend, entry.ok, entry.failed))
            .collect::<Vec<_>>()
            .join(", ");
        info!(target: "qscan::metrics", breakdown, "Per-backend captures");
    }
}

fn store_snapshot(snapshot: &Snapshot) {
    let lock = LAST_SNAPSHOT.get_or_init(|| Mutex::new(None));
    if let Ok(mut guard) = lock.lock() {
        *guard = Some(snapshot.clone());
    }
}

fn latest_snapshot() -> Option<Snapshot> {
    let lock = LAST_SNAPSHOT.get_or_init(|| Mutex::new(None));
    lock.lock().ok().and_then(|guard| guard.clone())
}

async fn run_http_listener(listener: TcpListener, format: MetricsFormat) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(target: "qscan::metrics", error = %err, "metrics accept failed");
                time::sleep(Duration::from_millis(250)).await;
                continue;
            }
        };

        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, format).await {
                tracing::debug!(target: "qscan::metrics", peer = %peer, error = %err, "metrics connection closed");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, format: MetricsFormat) -> Result<()> {
    let mut buffer = [0u8; 1024];
    let _ = stream.read(&mut buffer).await.map_err(Error::Io)?;

    // Before the first window closes, serve the live counters
    let snapshot =
        latest_snapshot().or_else(|| METRICS.get().map(|inner| inner.lock().snapshot()));

    let (status_line, content_type, body) = match snapshot {
        Some(snapshot) => match format {
            MetricsFormat::Json => (
                "HTTP/1.1 200 OK\r\n",
                Some("application/json"),
                serde_json::to_vec(&snapshot_to_http(&snapshot))?,
            ),
            MetricsFormat::Prometheus => (
                "HTTP/1.1 200 OK\r\n",
                Some("text/plain; version=0.0.4"),
                render_prometheus(&snapshot).into_bytes(),
            ),
        },
        None => ("HTTP/1.1 204 No Content\r\n", None, Vec::new()),
    };

    let mut response = Vec::with_capacity(128 + body.len());
    response.extend_from_slice(status_line.as_bytes());
    response.extend_from_slice(b"Connection: close\r\n");
    response.extend_from_slice(b"Cache-Control: no-store\r\n");
    if let Some(content_type) = content_type {
        response.extend_from_slice(b"Content-Type: ");
        response.extend_from_slice(content_type.as_bytes());
        response.extend_from_slice(b"\r\n");
    }
    let length_header = format!("Content-Length: {}\r\n\r\n", body.len());
    response.extend_from_slice(length_header.as_bytes());
    response.extend_from_slice(&body);

    stream.write_all(&response).await.map_err(Error::Io)?;
    stream.shutdown().await.map_err(Error::Io)?;

    Ok(())
}

#[derive(Serialize)]
struct HttpMetrics {
    window_secs: u64,
    captures: CaptureMetrics,
    decode: DecodeMetrics,
    reports: ReportMetrics,
    reselections: u64,
    frame_intervals: Option<FrameIntervalMetrics>,
    failure_streak: StreakMetrics,
    per_backend: Vec<HttpBackendMetrics>,
}

#[derive(Serialize)]
struct CaptureMetrics {
    total: u64,
    ok: u64,
    failed: u64,
    success_rate: f64,
}

#[derive(Serialize)]
struct DecodeMetrics {
    frames: u64,
    symbols: u64,
    avg_latency_ms: f64,
}

#[derive(Serialize)]
struct ReportMetrics {
    accepted: u64,
    suppressed: u64,
}

#[derive(Serialize)]
struct FrameIntervalMetrics {
    avg_ms: f64,
    max_ms: f64,
    last_ms: f64,
}

#[derive(Serialize)]
struct StreakMetrics {
    current: u64,
    peak: u64,
}

#[derive(Serialize)]
struct HttpBackendMetrics {
    backend: String,
    ok: u64,
    failed: u64,
}

fn snapshot_to_http(snapshot: &Snapshot) -> HttpMetrics {
    let frame_intervals = snapshot.frame_interval_avg.map(|avg| FrameIntervalMetrics {
        avg_ms: millis(avg),
        max_ms: millis(snapshot.frame_interval_max.unwrap_or(avg)),
        last_ms: millis(snapshot.last_frame_interval.unwrap_or(avg)),
    });

    HttpMetrics {
        window_secs: snapshot.elapsed.as_secs(),
        captures: CaptureMetrics {
            total: snapshot.captures_total(),
            ok: snapshot.captures_ok,
            failed: snapshot.captures_failed,
            success_rate: snapshot.capture_success_ratio() * 100.0,
        },
        decode: DecodeMetrics {
            frames: snapshot.decodes,
            symbols: snapshot.symbols,
            avg_latency_ms: millis(snapshot.decode_avg()),
        },
        reports: ReportMetrics {
            accepted: snapshot.reports_accepted,
            suppressed: snapshot.reports_suppressed,
        },
        reselections: snapshot.reselections,
        frame_intervals,
        failure_streak: StreakMetrics {
            current: snapshot.failure_streak,
            peak: snapshot.failure_streak_peak,
        },
        per_backend: snapshot
            .per_backend
            .iter()
            .map(|entry| HttpBackendMetrics {
                backend: entry.backend.clone(),
                ok: entry.ok,
                failed: entry.failed,
            })
            .collect(),
    }
}

fn prometheus_metric(output: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    let _ = writeln!(output, "{name} {value}");
}

fn render_prometheus(snapshot: &Snapshot) -> String {
    let mut output = String::new();

    prometheus_metric(
        &mut output,
        "qscan_window_seconds",
        "gauge",
        "Duration of the aggregation window in seconds",
        snapshot.elapsed.as_secs(),
    );
    prometheus_metric(
        &mut output,
        "qscan_captures_total",
        "counter",
        "Capture attempts during the window",
        snapshot.captures_total(),
    );
    prometheus_metric(
        &mut output,
        "qscan_capture_failures_total",
        "counter",
        "Failed capture attempts during the window",
        snapshot.captures_failed,
    );
    prometheus_metric(
        &mut output,
        "qscan_capture_success_ratio",
        "gauge",
        "Capture success ratio for the window",
        format_args!("{:.6}", snapshot.capture_success_ratio()),
    );
    prometheus_metric(
        &mut output,
        "qscan_decode_latency_avg_seconds",
        "gauge",
        "Average time spent decoding a frame",
        format_args!("{:.6}", snapshot.decode_avg().as_secs_f64()),
    );
    prometheus_metric(
        &mut output,
        "qscan_symbols_total",
        "counter",
        "Symbols decoded during the window",
        snapshot.symbols,
    );
    prometheus_metric(
        &mut output,
        "qscan_reports_total",
        "counter",
        "Payloads reported after debouncing",
        snapshot.reports_accepted,
    );
    prometheus_metric(
        &mut output,
        "qscan_reports_suppressed_total",
        "counter",
        "Repeat payloads suppressed by debouncing",
        snapshot.reports_suppressed,
    );
    prometheus_metric(
        &mut output,
        "qscan_reselections_total",
        "counter",
        "Backend re-selections after a failure streak",
        snapshot.reselections,
    );

    if let Some(avg) = snapshot.frame_interval_avg {
        let _ = writeln!(
            &mut output,
            "# HELP qscan_frame_interval_seconds Frame interval statistics"
        );
        let _ = writeln!(&mut output, "# TYPE qscan_frame_interval_seconds gauge");
        let stats = [
            ("avg", Some(avg)),
            ("max", snapshot.frame_interval_max),
            ("last", snapshot.last_frame_interval),
        ];
        for (stat, value) in stats {
            if let Some(value) = value {
                let _ = writeln!(
                    &mut output,
                    "qscan_frame_interval_seconds{{stat=\"{stat}\"}} {:.6}",
                    value.as_secs_f64()
                );
            }
        }
    }

    prometheus_metric(
        &mut output,
        "qscan_failure_streak",
        "gauge",
        "Current consecutive capture failures",
        snapshot.failure_streak,
    );
    prometheus_metric(
        &mut output,
        "qscan_failure_streak_peak",
        "gauge",
        "Longest failure streak within the window",
        snapshot.failure_streak_peak,
    );

    if !snapshot.per_backend.is_empty() {
        let _ = writeln!(
            &mut output,
            "# HELP qscan_captures_by_backend_total Capture attempts by backend"
        );
        let _ = writeln!(&mut output, "# TYPE qscan_captures_by_backend_total counter");
        for entry in &snapshot.per_backend {
            let label = escape_label(&entry.backend);
            let _ = writeln!(
                &mut output,
                "qscan_captures_by_backend_total{{backend=\"{label}\",result=\"success\"}} {}",
                entry.ok
            );
            let _ = writeln!(
                &mut output,
                "qscan_captures_by_backend_total{{backend=\"{label}\",result=\"failure\"}} {}",
                entry.failed
            );
        }
    }

    output
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> MetricsState {
        let mut state = MetricsState::new();
        state.captures_ok = 3;
        state.captures_failed = 1;
        state.per_backend.insert(
            "v4l2".into(),
            BackendCounters { ok: 3, failed: 1 },
        );
        state.decodes = 2;
        state.decode_duration = Duration::from_millis(40);
        state.failure_streak = 4;
        state.failure_streak_peak = 7;
        state
    }

    #[test]
    fn test_reset_keeps_current_streak() {
        let mut state = populated();
        let snapshot = state.snapshot_and_reset();
        assert_eq!(snapshot.failure_streak_peak, 7);
        assert_eq!(snapshot.decode_avg(), Duration::from_millis(20));
        assert_eq!(state.captures_ok, 0);
        assert_eq!(state.failure_streak, 4);
        assert_eq!(state.failure_streak_peak, 4);
    }

    #[test]
    fn test_prometheus_labels() {
        let text = render_prometheus(&populated().snapshot());
        assert!(text.contains("qscan_captures_total 4"));
        assert!(text.contains(
            "qscan_captures_by_backend_total{backend=\"v4l2\",result=\"failure\"} 1"
        ));
        assert!(!text.contains("qscan_frame_interval_seconds"));
    }

    #[test]
    fn test_escape_label() {
        assert_eq!(escape_label("a\"b\\c\n"), "a\\\"b\\\\c\\n");
    }
}
