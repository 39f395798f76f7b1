//! Capture configuration and raw buffer conversion

use image::{DynamicImage, GrayImage, ImageBuffer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One capture profile tried by the backend selector.
///
/// Profiles form an ordered preference list; the first one a backend can
/// actually stream with wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Camera device index (e.g., 0 for /dev/video0)
    pub device_index: usize,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Target frames per second, also used to pace the acquisition loop
    pub fps: u32,

    /// Number of V4L2 buffers to keep mapped (1 keeps frames fresh)
    pub buffer_count: u32,

    /// Pixel format requested from streaming devices
    pub format: PixelFormat,

    /// JPEG quality passed to still-capture utilities
    pub quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::embedded()
    }
}

impl CaptureConfig {
    /// Low resolution, low frame rate profile for Pi Zero class hosts
    pub fn embedded() -> Self {
        Self {
            device_index: 0,
            width: 320,
            height: 240,
            fps: 10,
            buffer_count: 1,
            format: PixelFormat::Mjpeg,
            quality: 75,
        }
    }

    /// Preset for webcams that refuse MJPEG or tiny resolutions
    pub fn compatible() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 15,
            buffer_count: 2,
            format: PixelFormat::Yuyv,
            ..Self::embedded()
        }
    }

    /// Device node backing this profile
    pub fn device_path(&self) -> String {
        format!("/dev/video{}", self.device_index)
    }

    /// Minimum spacing between successful captures
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    /// Short label for logs and selection reports
    pub fn label(&self) -> String {
        format!(
            "{}x{}@{} {}",
            self.width,
            self.height,
            self.fps,
            self.format.as_str()
        )
    }
}

impl fmt::Display for CaptureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.label(), self.device_path())
    }
}

/// Pixel format for streaming capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Motion JPEG (compressed, cheapest on USB bandwidth)
    Mjpeg,
    /// YUYV 4:2:2; only the luminance plane is kept
    Yuyv,
    /// RGB24 (uncompressed, high bandwidth)
    Rgb24,
    /// 8-bit greyscale
    Grey,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC code
    #[cfg(feature = "camera")]
    pub fn to_fourcc(self) -> v4l::FourCC {
        match self {
            PixelFormat::Mjpeg => v4l::FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => v4l::FourCC::new(b"YUYV"),
            PixelFormat::Rgb24 => v4l::FourCC::new(b"RGB3"),
            PixelFormat::Grey => v4l::FourCC::new(b"GREY"),
        }
    }

    /// Map a FourCC reported by the driver back to a supported format
    #[cfg(feature = "camera")]
    pub fn from_fourcc(fourcc: v4l::FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    /// Canonical string representation for configuration files
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Yuyv => "yuyv",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Grey => "grey",
        }
    }

    /// Parse from a user-provided string (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mjpeg" | "mjpg" => Some(PixelFormat::Mjpeg),
            "yuyv" => Some(PixelFormat::Yuyv),
            "rgb" | "rgb24" => Some(PixelFormat::Rgb24),
            "grey" | "gray" | "y8" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    /// Turn a raw device buffer into an image.
    ///
    /// YUYV is reduced to its Y samples, which is all the QR decoder needs and
    /// skips a full colour conversion on slow CPUs.
    pub fn decode(self, buf: &[u8], width: u32, height: u32) -> Result<DynamicImage, String> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Mjpeg => {
                image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                    .map_err(|e| format!("MJPEG decode failed: {e}"))
            }
            PixelFormat::Yuyv => {
                if buf.len() < pixels * 2 {
                    return Err(format!(
                        "short YUYV buffer: {} bytes for {}x{}",
                        buf.len(),
                        width,
                        height
                    ));
                }
                let luma: Vec<u8> = buf.iter().step_by(2).take(pixels).copied().collect();
                GrayImage::from_raw(width, height, luma)
                    .map(DynamicImage::ImageLuma8)
                    .ok_or_else(|| "failed to build luma image from YUYV".to_string())
            }
            PixelFormat::Rgb24 => {
                let needed = pixels * 3;
                if buf.len() < needed {
                    return Err(format!("short RGB24 buffer: {} bytes", buf.len()));
                }
                ImageBuffer::from_raw(width, height, buf[..needed].to_vec())
                    .map(DynamicImage::ImageRgb8)
                    .ok_or_else(|| "failed to build RGB image".to_string())
            }
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(format!("short GREY buffer: {} bytes", buf.len()));
                }
                GrayImage::from_raw(width, height, buf[..pixels].to_vec())
                    .map(DynamicImage::ImageLuma8)
                    .ok_or_else(|| "failed to build greyscale image".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_embedded_profile() {
        let config = CaptureConfig::default();
        assert_eq!((config.width, config.height, config.fps), (320, 240, 10));
        assert_eq!(config.buffer_count, 1);
        assert_eq!(config.label(), "320x240@10 mjpeg");
    }

    #[test]
    fn test_frame_interval_from_fps() {
        let mut config = CaptureConfig::compatible();
        assert_eq!(config.frame_interval(), Duration::from_secs(1) / 15);
        config.fps = 0;
        assert_eq!(config.frame_interval(), Duration::from_secs(1));
    }

    #[test]
    #[cfg(feature = "camera")]
    fn test_pixel_format_fourcc() {
        assert_eq!(PixelFormat::Mjpeg.to_fourcc(), v4l::FourCC::new(b"MJPG"));
        assert_eq!(
            PixelFormat::from_fourcc(v4l::FourCC::new(b"YUYV")),
            Some(PixelFormat::Yuyv)
        );
        assert_eq!(PixelFormat::from_fourcc(v4l::FourCC::new(b"H264")), None);
    }

    #[test]
    fn test_pixel_format_parse() {
        assert_eq!(PixelFormat::parse("MJPG"), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::parse("gray"), Some(PixelFormat::Grey));
        assert!(PixelFormat::parse("h264").is_none());
    }

    #[test]
    fn test_yuyv_keeps_luma_plane() {
        // Two pixels: Y0 U Y1 V
        let buf = [10u8, 128, 200, 128];
        let image = PixelFormat::Yuyv.decode(&buf, 2, 1).unwrap();
        let gray = image.to_luma8();
        assert_eq!(gray.as_raw(), &vec![10, 200]);
    }

    #[test]
    fn test_short_buffers_are_rejected() {
        assert!(PixelFormat::Yuyv.decode(&[0u8; 3], 2, 1).is_err());
        assert!(PixelFormat::Rgb24.decode(&[0u8; 5], 2, 1).is_err());
        assert!(PixelFormat::Grey.decode(&[], 1, 1).is_err());
    }
}
