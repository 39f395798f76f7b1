//! V4L2 streaming capture
//!
//! Keeps a memory-mapped stream open across captures so each tick only
//! dequeues the next buffer. Drivers are free to adjust the requested
//! resolution, format or frame interval; whatever was actually applied is
//! logged and used for decoding.

use super::{CaptureBackend, CaptureConfig, CaptureResult, Frame, FrameSource, PixelFormat};
use crate::error::{CaptureFailure, Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::mem;
use std::path::Path;
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

/// Information about a camera device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraDevice {
    /// Device index (e.g., 0 for /dev/video0)
    pub index: usize,
    /// Device path (e.g., "/dev/video0")
    pub path: String,
    /// Device name as reported by the driver
    pub name: String,
    /// Driver name
    pub driver: String,
    /// Bus information
    pub bus_info: String,
}

/// List V4L2 devices that can capture video
pub fn list_devices() -> Result<Vec<CameraDevice>> {
    let mut devices = Vec::new();

    for index in 0..10 {
        let Ok(dev) = Device::new(index) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            devices.push(CameraDevice {
                index,
                path: format!("/dev/video{index}"),
                name: caps.card,
                driver: caps.driver,
                bus_info: caps.bus,
            });
        }
    }

    if devices.is_empty() {
        return Err(Error::DeviceUnavailable(
            "No V4L2 capture devices found".to_string(),
        ));
    }

    Ok(devices)
}

/// Opens [`V4l2Source`]s
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    read_timeout: Duration,
}

impl V4l2Backend {
    /// Create a backend whose streams give up on a read after `read_timeout`
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &str {
        "v4l2"
    }

    async fn open(
        &self,
        config: &CaptureConfig,
    ) -> std::result::Result<Box<dyn FrameSource>, CaptureFailure> {
        let source = V4l2Source::open(config, self.read_timeout)?;
        Ok(Box::new(source))
    }
}

/// Stream resources; field order makes the stream drop before its device
struct StreamInner {
    stream: MmapStream<'static>,
    _device: Box<Device>,
}

/// Live V4L2 capture stream
pub struct V4l2Source {
    inner: Option<StreamInner>,
    path: String,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl V4l2Source {
    /// Open and configure the device named by `config`
    pub fn open(
        config: &CaptureConfig,
        read_timeout: Duration,
    ) -> std::result::Result<Self, CaptureFailure> {
        let path = config.device_path();
        if !Path::new(&path).exists() {
            return Err(CaptureFailure::DeviceUnavailable(format!(
                "{path} does not exist"
            )));
        }

        let dev = Device::new(config.device_index)
            .map_err(|e| CaptureFailure::OpenFailed(format!("{path}: {e}")))?;

        let caps = dev
            .query_caps()
            .map_err(|e| CaptureFailure::OpenFailed(format!("{path}: query caps: {e}")))?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CaptureFailure::OpenFailed(format!(
                "{path} ({}) is not a capture device",
                caps.card
            )));
        }

        let mut requested = dev
            .format()
            .map_err(|e| CaptureFailure::OpenFailed(format!("{path}: get format: {e}")))?;
        requested.width = config.width;
        requested.height = config.height;
        requested.fourcc = config.format.to_fourcc();

        let applied = dev
            .set_format(&requested)
            .map_err(|e| CaptureFailure::OpenFailed(format!("{path}: set format: {e}")))?;

        let format = PixelFormat::from_fourcc(applied.fourcc).ok_or_else(|| {
            CaptureFailure::OpenFailed(format!(
                "{path}: driver switched to unsupported format {}",
                String::from_utf8_lossy(&applied.fourcc.repr)
            ))
        })?;

        if applied.width != config.width
            || applied.height != config.height
            || format != config.format
        {
            tracing::warn!(
                device = %path,
                requested = %config.label(),
                applied_width = applied.width,
                applied_height = applied.height,
                applied_format = format.as_str(),
                "Driver adjusted capture format"
            );
        }

        // Frame interval is advisory: plenty of UVC and bcm2835 drivers reject it.
        let applied_fps = match dev.params() {
            Ok(mut params) => {
                params.interval = v4l::Fraction::new(1, config.fps.max(1));
                match dev.set_params(&params) {
                    Ok(applied) if applied.interval.numerator > 0 => {
                        Some(applied.interval.denominator / applied.interval.numerator)
                    }
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(device = %path, error = %e, "Frame interval not applied");
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!(device = %path, error = %e, "Stream parameters unavailable");
                None
            }
        };

        // SAFETY: the boxed device is stored next to the stream in StreamInner and
        // outlives it; the stream is declared first so it is dropped first.
        let device = Box::new(dev);
        let static_device: &'static Device =
            unsafe { mem::transmute::<&Device, &'static Device>(device.as_ref()) };

        let buffer_count = config.buffer_count.max(1);
        let mut stream = MmapStream::with_buffers(static_device, Type::VideoCapture, buffer_count)
            .map_err(|e| CaptureFailure::OpenFailed(format!("{path}: create stream: {e}")))?;
        stream.set_timeout(read_timeout);

        tracing::info!(
            device = %path,
            card = %caps.card,
            width = applied.width,
            height = applied.height,
            format = format.as_str(),
            fps = ?applied_fps,
            buffers = buffer_count,
            "V4L2 stream configured"
        );

        Ok(Self {
            inner: Some(StreamInner {
                stream,
                _device: device,
            }),
            path,
            width: applied.width,
            height: applied.height,
            format,
        })
    }
}

impl StreamInner {
    /// Dequeue one buffer and convert it; blocks up to the read timeout
    fn capture(&mut self, path: &str, width: u32, height: u32, format: PixelFormat) -> CaptureResult {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CaptureFailure::ReadFailed(format!("{path}: {e}")))?;

        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Err(CaptureFailure::EmptyFrame);
        }

        format
            .decode(&buf[..used], width, height)
            .map(Frame::new)
            .map_err(CaptureFailure::ReadFailed)
    }
}

#[async_trait]
impl FrameSource for V4l2Source {
    async fn acquire(&mut self) -> CaptureResult {
        let (width, height, format) = (self.width, self.height, self.format);
        let mut inner = self.inner.take().ok_or_else(|| {
            CaptureFailure::ReadFailed(format!("{} stream already closed", self.path))
        })?;

        // The stream travels to the blocking pool and back
        let path = self.path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = inner.capture(&path, width, height, format);
            (inner, result)
        })
        .await;

        match joined {
            Ok((inner, result)) => {
                self.inner = Some(inner);
                result
            }
            Err(e) => Err(CaptureFailure::ReadFailed(format!(
                "{}: capture task failed, stream lost: {e}",
                self.path
            ))),
        }
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            tracing::debug!(device = %self.path, "V4L2 stream closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices() {
        // Only meaningful on hosts with a camera attached
        match list_devices() {
            Ok(devices) => {
                for dev in devices {
                    println!("  - {} at {}", dev.name, dev.path);
                }
            }
            Err(e) => println!("No cameras found (expected on CI): {}", e),
        }
    }

    #[tokio::test]
    async fn test_missing_device_is_unavailable() {
        let config = CaptureConfig {
            device_index: 4242,
            ..CaptureConfig::default()
        };
        let result = V4l2Backend::default().open(&config).await;
        assert!(matches!(
            result,
            Err(CaptureFailure::DeviceUnavailable(_))
        ));
    }
}
