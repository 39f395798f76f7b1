//! QR code decoder using rqrr

use crate::error::{Error, Result};
use crate::qr::{BoundingBox, DecodedSymbol, Decoder};
use image::GrayImage;

/// QR decoder backed by rqrr
#[derive(Debug, Default, Clone, Copy)]
pub struct RqrrDecoder;

impl RqrrDecoder {
    /// Create a new QR decoder with default settings
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for RqrrDecoder {
    fn decode(&self, image: GrayImage) -> Result<Vec<DecodedSymbol>> {
        let mut prepared = rqrr::PreparedImage::prepare(image);
        let grids = prepared.detect_grids();

        let mut symbols = Vec::with_capacity(grids.len());
        let mut last_error = None;

        for grid in grids {
            let mut raw = Vec::new();
            match grid.decode_to(&mut raw) {
                Ok(meta) => {
                    tracing::trace!(
                        version = ?meta.version,
                        ecc_level = ?meta.ecc_level,
                        length = raw.len(),
                        "Decoded QR grid"
                    );
                    let corners: Vec<(i32, i32)> =
                        grid.bounds.iter().map(|p| (p.x, p.y)).collect();
                    symbols.push(DecodedSymbol::qr(
                        String::from_utf8_lossy(&raw).into_owned(),
                        BoundingBox::from_corners(&corners),
                    ));
                }
                Err(e) => {
                    tracing::debug!("Failed to decode one QR grid: {:?}", e);
                    last_error = Some(e);
                }
            }
        }

        // Grids were found but none of them decoded: that is a decode error, not an empty frame
        if symbols.is_empty() {
            if let Some(e) = last_error {
                return Err(Error::Decode(format!("{e:?}")));
            }
        }

        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use qrcode::QrCode;

    fn render(payload: &str) -> GrayImage {
        QrCode::new(payload.as_bytes())
            .unwrap()
            .render::<Luma<u8>>()
            .min_dimensions(200, 200)
            .build()
    }

    #[test]
    fn test_blank_image_has_no_symbols() {
        let blank = GrayImage::from_pixel(120, 120, Luma([255]));
        assert!(RqrrDecoder::new().decode(blank).unwrap().is_empty());
    }

    #[test]
    fn test_decodes_rendered_code() {
        let symbols = RqrrDecoder::new()
            .decode(render("https://example.org/door/42"))
            .unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].payload, "https://example.org/door/42");
        assert_eq!(symbols[0].symbology, "QRCODE");
        assert!(symbols[0].bounds.width > 0);
    }
}
