//! QR code decoding
//!
//! The decoder is an external collaborator: it receives a greyscale image
//! and returns whatever symbols it found. [`RqrrDecoder`] is the default,
//! anything implementing [`Decoder`] can replace it.

mod decoder;

pub use decoder::RqrrDecoder;

use crate::error::Result;
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Symbology tag attached to QR results
pub const QR_SYMBOLOGY: &str = "QRCODE";

/// Axis-aligned box around a decoded symbol, in frame pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge
    pub x: u32,
    /// Top edge
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl BoundingBox {
    /// Smallest box containing every corner
    pub fn from_corners(corners: &[(i32, i32)]) -> Self {
        if corners.is_empty() {
            return Self::default();
        }
        let min_x = corners.iter().map(|c| c.0).min().unwrap_or(0).max(0);
        let max_x = corners.iter().map(|c| c.0).max().unwrap_or(0).max(0);
        let min_y = corners.iter().map(|c| c.1).min().unwrap_or(0).max(0);
        let max_y = corners.iter().map(|c| c.1).max().unwrap_or(0).max(0);
        Self {
            x: min_x as u32,
            y: min_y as u32,
            width: (max_x - min_x) as u32,
            height: (max_y - min_y) as u32,
        }
    }
}

/// One symbol found in a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedSymbol {
    /// Payload text (invalid UTF-8 sequences are replaced)
    pub payload: String,
    /// Symbology tag, e.g. `QRCODE`
    pub symbology: String,
    /// Location in the frame
    pub bounds: BoundingBox,
}

impl DecodedSymbol {
    /// A QR symbol with the given payload
    pub fn qr(payload: impl Into<String>, bounds: BoundingBox) -> Self {
        Self {
            payload: payload.into(),
            symbology: QR_SYMBOLOGY.to_string(),
            bounds,
        }
    }
}

/// Image to symbols. Order of the returned symbols is decoder-defined.
pub trait Decoder: Send + Sync {
    /// Decode every symbol in `image`. An image without symbols is `Ok(vec![])`.
    fn decode(&self, image: GrayImage) -> Result<Vec<DecodedSymbol>>;
}
