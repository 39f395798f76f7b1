//! Scan reports and the sinks that deliver them

#[cfg(target_family = "unix")]
pub mod unix;

use crate::error::{Error, Result};
use crate::qr::{BoundingBox, DecodedSymbol};
use chrono::{SecondsFormat, Utc};
use hex::encode as hex_encode;
use serde::Serialize;
use serde_json::{Value, json};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// A payload that passed debouncing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    /// Decoded text
    pub payload: String,
    /// Symbology tag, e.g. `QRCODE`
    pub symbology: String,
    /// Wall-clock time of the report, RFC 3339 UTC
    pub timestamp: String,
    /// Same instant as unix epoch milliseconds
    pub timestamp_ms: i64,
    /// Location of the symbol in the frame
    pub bounds: BoundingBox,
    /// Backend that captured the frame
    pub backend: String,
    /// Monotonic time the debounce decision was made with
    #[serde(skip)]
    pub seen_at: Instant,
}

impl ScanReport {
    /// Build a report for `symbol`, stamped with the current wall-clock time
    pub fn new(symbol: DecodedSymbol, backend: impl Into<String>, seen_at: Instant) -> Self {
        let now = Utc::now();
        Self {
            payload: symbol.payload,
            symbology: symbol.symbology,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            timestamp_ms: now.timestamp_millis(),
            bounds: symbol.bounds,
            backend: backend.into(),
            seen_at,
        }
    }
}

/// Structured representation sent to JSON consumers.
///
/// Adds the payload bytes as hex so binary-ish payloads survive tooling that
/// mangles control characters.
pub fn report_value(report: &ScanReport) -> Value {
    json!({
        "payload": report.payload,
        "payload_hex": hex_encode(report.payload.as_bytes()),
        "byte_length": report.payload.len(),
        "symbology": report.symbology,
        "timestamp": report.timestamp,
        "timestamp_ms": report.timestamp_ms,
        "bounds": {
            "x": report.bounds.x,
            "y": report.bounds.y,
            "width": report.bounds.width,
            "height": report.bounds.height,
        },
        "backend": report.backend,
    })
}

/// Terminal lines for a report
pub fn render_human(report: &ScanReport) -> Vec<String> {
    let mut lines = vec![format!("[{}] {}", report.timestamp, report.symbology)];
    lines.push(format!("  Payload: {}", report.payload));
    if report.payload.chars().any(char::is_control) {
        lines.push(format!("  Hex: {}", hex_encode(report.payload.as_bytes())));
    }
    lines.push(format!(
        "  Bounds: {}x{} at ({}, {})",
        report.bounds.width, report.bounds.height, report.bounds.x, report.bounds.y
    ));
    lines.push(format!("  Backend: {}", report.backend));
    lines
}

/// Destination for accepted reports
pub trait ReportSink: Send + Sync {
    /// Deliver one report; errors are logged by the caller and never stop a scan
    fn emit(&self, report: &ScanReport) -> Result<()>;
}

/// How [`ConsoleSink`] prints reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleFormat {
    /// Multi-line human-readable block
    Human,
    /// One JSON object per line
    Json,
}

/// Prints reports on stdout
#[derive(Debug, Clone, Copy)]
pub struct ConsoleSink {
    format: ConsoleFormat,
}

impl ConsoleSink {
    /// Console sink with the given format
    pub fn new(format: ConsoleFormat) -> Self {
        Self { format }
    }

    /// JSON lines when `json` is set, human-readable blocks otherwise
    pub fn from_flag(json: bool) -> Self {
        Self::new(if json {
            ConsoleFormat::Json
        } else {
            ConsoleFormat::Human
        })
    }
}

impl ReportSink for ConsoleSink {
    fn emit(&self, report: &ScanReport) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        match self.format {
            ConsoleFormat::Json => {
                serde_json::to_writer(&mut out, &report_value(report))?;
                writeln!(out)?;
            }
            ConsoleFormat::Human => {
                for line in render_human(report) {
                    writeln!(out, "{line}")?;
                }
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// Collects reports in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<ScanReport>>,
}

impl MemorySink {
    /// Empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything emitted so far
    pub fn reports(&self) -> Vec<ScanReport> {
        self.reports
            .lock()
            .map(|reports| reports.clone())
            .unwrap_or_default()
    }

    /// Payloads emitted so far, in order
    pub fn payloads(&self) -> Vec<String> {
        self.reports().into_iter().map(|r| r.payload).collect()
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, report: &ScanReport) -> Result<()> {
        self.reports
            .lock()
            .map_err(|_| Error::Other("report collector poisoned".to_string()))?
            .push(report.clone());
        Ok(())
    }
}

/// Delivers every report to each inner sink
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl FanoutSink {
    /// Fan out to nothing yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination
    pub fn push(&mut self, sink: Arc<dyn ReportSink>) {
        self.sinks.push(sink);
    }

    /// Number of destinations
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// True when there are no destinations
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ReportSink for FanoutSink {
    fn emit(&self, report: &ScanReport) -> Result<()> {
        // A broken sink must not starve the others; the first error is returned.
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(err) = sink.emit(report) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
