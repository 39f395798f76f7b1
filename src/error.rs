//! Error types for QSCAN operations

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type alias using QSCAN's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for QSCAN operations
#[derive(Error, Debug)]
pub enum Error {
    /// No camera device or capture utility could be found at all
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A single capture attempt failed
    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureFailure),

    /// Every backend/config combination was tried and none produced a frame
    #[error("{0}")]
    Selection(#[from] SelectionFailure),

    /// QR decoding failed on an otherwise valid image
    #[error("Failed to decode QR code: {0}")]
    Decode(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image processing error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Why a capture backend could not deliver a frame.
///
/// Everything except [`CaptureFailure::DeviceUnavailable`] is considered
/// transient and is retried by the acquisition loop.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum CaptureFailure {
    /// No device node or capture utility exists for this backend
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The device exists but could not be opened or configured
    #[error("open failed: {0}")]
    OpenFailed(String),
    /// Reading a frame failed or produced unusable data
    #[error("read failed: {0}")]
    ReadFailed(String),
    /// The backend returned a frame without any pixels
    #[error("empty frame")]
    EmptyFrame,
}

impl CaptureFailure {
    /// Short machine-readable label, used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureFailure::DeviceUnavailable(_) => "device_unavailable",
            CaptureFailure::OpenFailed(_) => "open_failed",
            CaptureFailure::ReadFailed(_) => "read_failed",
            CaptureFailure::EmptyFrame => "empty_frame",
        }
    }

    /// Whether retrying the same backend could plausibly succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, CaptureFailure::DeviceUnavailable(_))
    }
}

/// One rejected candidate during backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionAttempt {
    /// Backend name (e.g. `v4l2`)
    pub backend: String,
    /// Human-readable capture config label (e.g. `320x240@10 mjpeg`)
    pub config: String,
    /// Failure observed for this candidate
    pub failure: CaptureFailure,
}

/// Returned when no backend/config combination produced a usable frame
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionFailure {
    /// Every failure encountered, in the order it happened
    pub attempts: Vec<SelectionAttempt>,
}

impl SelectionFailure {
    /// Map to the fatal error surfaced to the operator.
    ///
    /// A run where nothing was even present is reported as
    /// [`Error::DeviceUnavailable`] rather than a generic selection failure.
    pub fn into_error(self) -> Error {
        if self.all_unavailable() {
            let reasons = self
                .attempts
                .iter()
                .map(|a| format!("{}: {}", a.backend, a.failure))
                .collect::<Vec<_>>()
                .join("; ");
            Error::DeviceUnavailable(reasons)
        } else {
            Error::Selection(self)
        }
    }

    /// True when no candidate had a device or utility to talk to
    pub fn all_unavailable(&self) -> bool {
        !self.attempts.is_empty()
            && self
                .attempts
                .iter()
                .all(|a| matches!(a.failure, CaptureFailure::DeviceUnavailable(_)))
    }
}

impl fmt::Display for SelectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "No capture backends configured");
        }
        write!(
            f,
            "No capture backend produced a frame ({} attempts)",
            self.attempts.len()
        )?;
        for attempt in &self.attempts {
            write!(
                f,
                "\n  - {} [{}]: {}",
                attempt.backend, attempt.config, attempt.failure
            )?;
        }
        Ok(())
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Image(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(format!("JSON error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(backend: &str, failure: CaptureFailure) -> SelectionAttempt {
        SelectionAttempt {
            backend: backend.to_string(),
            config: "320x240@10 mjpeg".to_string(),
            failure,
        }
    }

    #[test]
    fn test_all_unavailable_maps_to_device_unavailable() {
        let failure = SelectionFailure {
            attempts: vec![
                attempt("v4l2", CaptureFailure::DeviceUnavailable("no /dev/video0".into())),
                attempt("subprocess", CaptureFailure::DeviceUnavailable("no tools".into())),
            ],
        };
        assert!(matches!(failure.into_error(), Error::DeviceUnavailable(_)));
    }

    #[test]
    fn test_mixed_failures_stay_selection_errors() {
        let failure = SelectionFailure {
            attempts: vec![
                attempt("v4l2", CaptureFailure::OpenFailed("busy".into())),
                attempt("subprocess", CaptureFailure::DeviceUnavailable("no tools".into())),
            ],
        };
        let err = failure.into_error();
        let message = err.to_string();
        assert!(matches!(err, Error::Selection(_)));
        assert!(message.contains("v4l2 [320x240@10 mjpeg]: open failed: busy"));
        assert!(message.contains("subprocess"));
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(CaptureFailure::EmptyFrame.kind(), "empty_frame");
        assert!(CaptureFailure::ReadFailed("x".into()).is_transient());
        assert!(!CaptureFailure::DeviceUnavailable("x".into()).is_transient());
    }
}
