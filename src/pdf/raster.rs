//! Signature raster handling: data-URL parsing, format detection and decoding.
//!
//! The browser declares a MIME type in the data URL, but canvases and
//! uploaded files do not always agree with it. Decoding tries the declared
//! codec first and the other supported codec second; only a failure of both
//! is reported.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SignError, SignResult};

/// Raster formats accepted for hand-drawn or uploaded signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    /// The codec tried when the declared one fails.
    pub fn other(self) -> Self {
        match self {
            ImageFormat::Png => ImageFormat::Jpeg,
            ImageFormat::Jpeg => ImageFormat::Png,
        }
    }

    /// Identify the format from the leading magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            image::ImageFormat::Png => Some(ImageFormat::Png),
            image::ImageFormat::Jpeg => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }

    fn codec(self) -> image::ImageFormat {
        match self {
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }
}

/// Encoded image bytes with the format the sender declared.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSignature {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl ImageSignature {
    /// Parse a `data:image/<type>;base64,<payload>` string.
    ///
    /// A JPEG declaration (`image/jpeg` or `image/jpg`) selects JPEG; any other
    /// declaration, or a bare base64 payload, is treated as PNG.
    pub fn from_data_url(data_url: &str) -> SignResult<Self> {
        let (format, payload) = split_data_url(data_url)?;
        Self::decode(format, payload)
    }

    /// Like [`ImageSignature::from_data_url`], but a payload that cannot fit
    /// in `limit` decoded bytes is rejected before it is decoded.
    pub fn from_data_url_within(data_url: &str, limit: usize) -> SignResult<Self> {
        let (format, payload) = split_data_url(data_url)?;
        // Four base64 characters carry at most three bytes.
        let ceiling = payload.len() / 4 * 3;
        if ceiling > limit.saturating_add(2) {
            return Err(SignError::PayloadTooLarge {
                size: ceiling,
                limit,
            });
        }
        let signature = Self::decode(format, payload)?;
        signature.check_size(limit)?;
        Ok(signature)
    }

    fn decode(format: ImageFormat, payload: &str) -> SignResult<Self> {
        let bytes = B64
            .decode(payload.as_bytes())
            .map_err(|e| SignError::InvalidSignatureData(e.to_string()))?;
        Ok(Self { bytes, format })
    }

    /// Reject payloads above `limit` decoded bytes. The limit is inclusive.
    pub fn check_size(&self, limit: usize) -> SignResult<()> {
        check_payload_size(self.bytes.len(), limit)
    }
}

fn split_data_url(data_url: &str) -> SignResult<(ImageFormat, &str)> {
    let trimmed = data_url.trim();
    match trimmed.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest.split_once(',').ok_or_else(|| {
                SignError::InvalidSignatureData("data URL has no payload".to_string())
            })?;
            let mime = header.split(';').next().unwrap_or_default();
            let format = match mime.to_ascii_lowercase().as_str() {
                "image/jpeg" | "image/jpg" => ImageFormat::Jpeg,
                _ => ImageFormat::Png,
            };
            Ok((format, payload))
        }
        None => Ok((ImageFormat::Png, trimmed)),
    }
}

pub fn check_payload_size(size: usize, limit: usize) -> SignResult<()> {
    if size > limit {
        return Err(SignError::PayloadTooLarge { size, limit });
    }
    Ok(())
}

/// Decoded 8-bit samples ready to be written as a PDF image XObject.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// Interleaved RGB samples, `width * height * 3` bytes.
    pub rgb: Vec<u8>,
    /// Alpha channel, present only when some pixel is not fully opaque.
    pub alpha: Option<Vec<u8>>,
    /// The codec that actually decoded the bytes.
    pub format: ImageFormat,
}

impl DecodedImage {
    /// Drawn size in PDF units after scaling the native pixel size.
    pub fn scaled(&self, scale: f64) -> (f64, f64) {
        (f64::from(self.width) * scale, f64::from(self.height) * scale)
    }

    fn from_dynamic(img: DynamicImage, format: ImageFormat) -> Self {
        let (width, height) = img.dimensions();
        let rgba = img.to_rgba8();

        let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
        let mut alpha = Vec::with_capacity(width as usize * height as usize);
        for pixel in rgba.pixels() {
            rgb.extend_from_slice(&pixel.0[..3]);
            alpha.push(pixel.0[3]);
        }
        let alpha = alpha.iter().any(|a| *a != u8::MAX).then_some(alpha);

        Self {
            width,
            height,
            rgb,
            alpha,
            format,
        }
    }
}

/// Decode with the declared codec, falling back to the other one.
pub fn decode_with_fallback(signature: &ImageSignature) -> SignResult<DecodedImage> {
    let declared = signature.format;
    if let Some(actual) = ImageFormat::sniff(&signature.bytes) {
        if actual != declared {
            debug!(?declared, ?actual, "signature image header disagrees with declared type");
        }
    }

    match image::load_from_memory_with_format(&signature.bytes, declared.codec()) {
        Ok(img) => Ok(DecodedImage::from_dynamic(img, declared)),
        Err(first) => {
            let fallback = declared.other();
            warn!(?declared, ?fallback, error = %first, "failed to decode signature image, trying fallback");
            image::load_from_memory_with_format(&signature.bytes, fallback.codec())
                .map(|img| DecodedImage::from_dynamic(img, fallback))
                .map_err(|_| {
                    SignError::UnsupportedImageFormat("not valid JPEG or PNG".to_string())
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, alpha: u8) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([10, 20, 200, alpha]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    #[test]
    fn parses_png_data_url() {
        let bytes = png_bytes(2, 2, 255);
        let url = format!("data:image/png;base64,{}", B64.encode(&bytes));
        let sig = ImageSignature::from_data_url(&url).unwrap();
        assert_eq!(sig.format, ImageFormat::Png);
        assert_eq!(sig.bytes, bytes);
    }

    #[test]
    fn jpg_alias_selects_jpeg() {
        let url = format!("data:image/jpg;base64,{}", B64.encode(b"abc"));
        let sig = ImageSignature::from_data_url(&url).unwrap();
        assert_eq!(sig.format, ImageFormat::Jpeg);
    }

    #[test]
    fn bare_base64_defaults_to_png() {
        let sig = ImageSignature::from_data_url(&B64.encode(b"xyz")).unwrap();
        assert_eq!(sig.format, ImageFormat::Png);
        assert_eq!(sig.bytes, b"xyz");
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = ImageSignature::from_data_url("data:image/png;base64,@@@").unwrap_err();
        assert!(matches!(err, SignError::InvalidSignatureData(_)));
    }

    #[test]
    fn encoded_length_is_checked_before_decoding() {
        for len in [10usize, 11, 12] {
            let url = format!("data:image/png;base64,{}", B64.encode(vec![7u8; len]));
            let sig = ImageSignature::from_data_url_within(&url, len).unwrap();
            assert_eq!(sig.bytes.len(), len);

            let err = ImageSignature::from_data_url_within(&url, len - 1).unwrap_err();
            assert!(matches!(err, SignError::PayloadTooLarge { .. }), "{len}");
        }

        // Oversized garbage is refused without a decode error.
        let url = format!("data:image/png;base64,{}", "@".repeat(4_000));
        let err = ImageSignature::from_data_url_within(&url, 100).unwrap_err();
        assert!(matches!(err, SignError::PayloadTooLarge { size: 3_000, limit: 100 }));
    }

    #[test]
    fn size_limit_is_inclusive() {
        assert!(check_payload_size(7_000_000, 7_000_000).is_ok());
        let err = check_payload_size(7_000_001, 7_000_000).unwrap_err();
        assert!(matches!(
            err,
            SignError::PayloadTooLarge {
                size: 7_000_001,
                limit: 7_000_000
            }
        ));
    }

    #[test]
    fn decodes_declared_format() {
        let sig = ImageSignature {
            bytes: png_bytes(4, 3, 255),
            format: ImageFormat::Png,
        };
        let decoded = decode_with_fallback(&sig).unwrap();
        assert_eq!((decoded.width, decoded.height), (4, 3));
        assert_eq!(decoded.rgb.len(), 4 * 3 * 3);
        assert_eq!(&decoded.rgb[..3], &[10, 20, 200]);
        assert!(decoded.alpha.is_none());
        assert_eq!(decoded.format, ImageFormat::Png);
    }

    #[test]
    fn keeps_alpha_when_transparent() {
        let sig = ImageSignature {
            bytes: png_bytes(2, 2, 0),
            format: ImageFormat::Png,
        };
        let decoded = decode_with_fallback(&sig).unwrap();
        assert_eq!(decoded.alpha, Some(vec![0; 4]));
    }

    #[test]
    fn falls_back_to_the_other_codec() {
        let sig = ImageSignature {
            bytes: jpeg_bytes(5, 5),
            format: ImageFormat::Png,
        };
        let decoded = decode_with_fallback(&sig).unwrap();
        assert_eq!(decoded.format, ImageFormat::Jpeg);
        assert_eq!((decoded.width, decoded.height), (5, 5));
    }

    #[test]
    fn fails_when_neither_codec_decodes() {
        let sig = ImageSignature {
            bytes: b"definitely not an image".to_vec(),
            format: ImageFormat::Jpeg,
        };
        let err = decode_with_fallback(&sig).unwrap_err();
        assert!(matches!(err, SignError::UnsupportedImageFormat(_)));
    }

    #[test]
    fn sniffs_magic_bytes() {
        assert_eq!(ImageFormat::sniff(&png_bytes(1, 1, 255)), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::sniff(&jpeg_bytes(1, 1)), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::sniff(b"%PDF-1.7"), None);
    }

    #[test]
    fn scales_native_size() {
        let sig = ImageSignature {
            bytes: png_bytes(200, 100, 255),
            format: ImageFormat::Png,
        };
        let decoded = decode_with_fallback(&sig).unwrap();
        let (w, h) = decoded.scaled(0.3);
        assert!((w - 60.0).abs() < 1e-9);
        assert!((h - 30.0).abs() < 1e-9);
    }
}
