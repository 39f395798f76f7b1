//! QSCAN - resilient QR code scanning for low-power Linux camera hosts
//!
//! The crate keeps a camera producing frames on hardware that is slow,
//! flaky, or only reachable through a still-capture utility, decodes QR codes
//! in those frames, and reports each newly seen payload once.
//!
//! # Features
//!
//! - **Backend fallback**: V4L2 streaming, external still-capture utilities
//!   and image replay behind one trait, ranked by configuration
//! - **Self-healing acquisition**: failure streaks trigger re-selection
//!   instead of a crash
//! - **Debouncing**: a code held in front of the camera is reported once per
//!   window
//! - **Async-first**: Built on Tokio, decoding runs on the blocking pool
//!
//! # Example
//!
//! ```no_run
//! use qscan::output::ConsoleSink;
//! use qscan::{QscanConfig, ScanCoordinator};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = QscanConfig::load(None)?;
//!     let sink = Arc::new(ConsoleSink::from_flag(false));
//!     let mut scanner = ScanCoordinator::from_config(&config, sink)?;
//!
//!     let cancel = CancellationToken::new();
//!     if let Some(report) = scanner.scan_once(&cancel).await? {
//!         println!("Scanned payload: {}", report.payload);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs, rust_2024_compatibility)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod acquisition;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod output;
pub mod qr;
pub mod selector;

// Re-exports for convenience
pub use acquisition::{AcquisitionLoop, LoopSettings, LoopState, LoopStats};
pub use capture::{
    BackendHandle, BackendKind, CaptureBackend, CaptureConfig, CaptureResult, Frame, FrameSource,
    PixelFormat,
};
pub use config::{
    CameraOptions, CaptureOptions, LogRotation, LoggingOptions, OutputOptions, QscanConfig,
    ScanOptions,
};
pub use coordinator::{RunSummary, ScanCoordinator};
pub use debounce::{DebounceEngine, DebounceState};
pub use error::{CaptureFailure, Error, Result, SelectionAttempt, SelectionFailure};
pub use output::{ReportSink, ScanReport};
pub use qr::{BoundingBox, DecodedSymbol, Decoder, RqrrDecoder};
pub use selector::{BackendSelector, SelectBackend};
