//! Frame acquisition backends
//!
//! Every way of getting a picture out of the camera (a V4L2 stream, a
//! still-capture utility, a directory of images) implements the same pair of
//! traits so the selector can rank them declaratively:
//!
//! - [`CaptureBackend`] opens a source for one [`CaptureConfig`]
//! - [`FrameSource`] delivers frames until it is closed
//!
//! [`BackendHandle`] wraps the active source and guarantees it is closed
//! exactly once, whichever way it goes out of scope.

mod config;
pub mod replay;
#[cfg(feature = "camera")]
#[cfg_attr(docsrs, doc(cfg(feature = "camera")))]
pub mod stream;
pub mod subprocess;

pub use config::{CaptureConfig, PixelFormat};
pub use replay::ReplayBackend;
#[cfg(feature = "camera")]
pub use stream::{CameraDevice, V4l2Backend, list_devices};
pub use subprocess::{CaptureUtility, SubprocessBackend};

use crate::error::CaptureFailure;
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Instant;

/// Outcome of a single capture attempt
pub type CaptureResult = std::result::Result<Frame, CaptureFailure>;

/// A captured image, owned by the scan tick that produced it
pub struct Frame {
    /// Pixel data
    pub image: DynamicImage,
    /// Monotonic capture time
    pub captured_at: Instant,
}

impl Frame {
    /// Wrap an image captured just now
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
        }
    }

    /// Frame width in pixels
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Frame height in pixels
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// A frame without pixels is treated as a capture failure
    pub fn is_empty(&self) -> bool {
        let (width, height) = self.image.dimensions();
        width == 0 || height == 0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// An opened capture source
#[async_trait]
pub trait FrameSource: Send {
    /// Capture the next frame
    async fn acquire(&mut self) -> CaptureResult;

    /// Release device handles and scratch space
    fn close(&mut self) {}
}

/// Constructor side of a capture mechanism
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Stable backend name used in config files and logs
    fn name(&self) -> &str;

    /// Open a source for the given capture profile
    async fn open(
        &self,
        config: &CaptureConfig,
    ) -> std::result::Result<Box<dyn FrameSource>, CaptureFailure>;
}

/// The currently active source together with the profile it was opened with
pub struct BackendHandle {
    backend: String,
    config: CaptureConfig,
    source: Option<Box<dyn FrameSource>>,
    pending: Option<Frame>,
}

impl BackendHandle {
    /// Take ownership of an opened source
    pub fn new(
        backend: impl Into<String>,
        config: CaptureConfig,
        source: Box<dyn FrameSource>,
    ) -> Self {
        Self {
            backend: backend.into(),
            config,
            source: Some(source),
            pending: None,
        }
    }

    /// Hand out `frame` on the next [`acquire`](Self::acquire) before
    /// touching the source again
    pub fn hold(&mut self, frame: Frame) {
        self.pending = Some(frame);
    }

    /// Name of the backend that opened this source
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Profile the source was opened with
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Capture a frame, rejecting frames without pixels
    pub async fn acquire(&mut self) -> CaptureResult {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }

        let source = self.source.as_mut().ok_or_else(|| {
            CaptureFailure::ReadFailed(format!("{} handle already released", self.backend))
        })?;

        let frame = source.acquire().await?;
        if frame.is_empty() {
            return Err(CaptureFailure::EmptyFrame);
        }
        Ok(frame)
    }

    /// Close the source now instead of waiting for drop
    pub fn release(mut self) {
        self.close_source();
    }

    fn close_source(&mut self) {
        self.pending = None;
        if let Some(mut source) = self.source.take() {
            source.close();
            tracing::debug!(
                backend = %self.backend,
                config = %self.config.label(),
                "Capture source released"
            );
        }
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.close_source();
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("backend", &self.backend)
            .field("config", &self.config.label())
            .field("open", &self.source.is_some())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

/// Capture mechanisms that can be listed in `capture.backends`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Continuous V4L2 streaming
    V4l2,
    /// External still-capture utility per frame
    Subprocess,
    /// Images replayed from a directory
    Replay,
}

impl BackendKind {
    /// Canonical backend name
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::V4l2 => "v4l2",
            BackendKind::Subprocess => "subprocess",
            BackendKind::Replay => "replay",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "v4l2" | "stream" => Ok(BackendKind::V4l2),
            "subprocess" | "still" => Ok(BackendKind::Subprocess),
            "replay" => Ok(BackendKind::Replay),
            other => Err(format!(
                "Unknown capture backend '{other}', expected v4l2, subprocess or replay"
            )),
        }
    }
}

/// Shared, type-erased backend as held by the selector
pub type SharedBackend = Arc<dyn CaptureBackend>;

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        closes: Arc<AtomicUsize>,
        image: DynamicImage,
    }

    #[async_trait]
    impl FrameSource for CountingSource {
        async fn acquire(&mut self) -> CaptureResult {
            Ok(Frame::new(self.image.clone()))
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handle(image: DynamicImage, closes: &Arc<AtomicUsize>) -> BackendHandle {
        BackendHandle::new(
            "test",
            CaptureConfig::default(),
            Box::new(CountingSource {
                closes: Arc::clone(closes),
                image,
            }),
        )
    }

    #[tokio::test]
    async fn test_release_closes_exactly_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = handle(DynamicImage::ImageLuma8(GrayImage::new(4, 4)), &closes);
        handle.release();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_closes_source() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let mut handle = handle(DynamicImage::ImageLuma8(GrayImage::new(4, 4)), &closes);
            assert!(handle.acquire().await.is_ok());
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_frames_are_failures() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut handle = handle(DynamicImage::ImageLuma8(GrayImage::new(0, 0)), &closes);
        assert_eq!(handle.acquire().await.unwrap_err(), CaptureFailure::EmptyFrame);
    }

    #[tokio::test]
    async fn test_held_frame_is_delivered_first() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut handle = handle(DynamicImage::ImageLuma8(GrayImage::new(4, 4)), &closes);
        handle.hold(Frame::new(DynamicImage::ImageLuma8(GrayImage::new(9, 9))));

        assert_eq!(handle.acquire().await.unwrap().width(), 9);
        assert_eq!(handle.acquire().await.unwrap().width(), 4);
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("V4L2".parse::<BackendKind>(), Ok(BackendKind::V4l2));
        assert_eq!("still".parse::<BackendKind>(), Ok(BackendKind::Subprocess));
        assert!("gstreamer".parse::<BackendKind>().is_err());
    }
}
