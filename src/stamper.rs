//! Signature stamping.
//!
//! Loads a PDF, places the signature (rendered text or an image) so its
//! visual centre lands where the signer dropped it, adds a "Signed on"
//! timestamp below it and writes the result as a new file. The source file
//! is never modified.

use std::fmt::Write as _;
use std::marker::PhantomData;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::StampConfig;
use crate::error::{SignError, SignResult};
use crate::pdf::raster::decode_with_fallback;
use crate::pdf::{
    place, ContentExtent, DecodedImage, ImageDraw, ImageSignature, LopdfDocument, PageGeometry,
    PdfPoint, Placement, Rotation, SignableDocument, StandardFont, TextDraw, Viewport, VisualPoint,
};
use crate::storage::UploadsRoot;

/// Typed signature text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSignature {
    pub text: String,
    pub font_size: f64,
}

/// Exactly one signature per stamping operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SignaturePayload {
    Text(TextSignature),
    Image(ImageSignature),
}

impl SignaturePayload {
    /// Build a payload from the optional request fields. An image takes
    /// precedence over text; empty values count as absent. Oversized images
    /// are rejected before their base64 payload is decoded.
    pub fn from_fields(
        text: Option<&str>,
        image_data_url: Option<&str>,
        config: &StampConfig,
    ) -> SignResult<Self> {
        if let Some(url) = image_data_url.filter(|s| !s.trim().is_empty()) {
            let image = ImageSignature::from_data_url_within(url, config.max_image_bytes)?;
            return Ok(SignaturePayload::Image(image));
        }
        match text.filter(|s| !s.trim().is_empty()) {
            Some(text) => Ok(SignaturePayload::Text(TextSignature {
                text: text.to_string(),
                font_size: config.signature_font_size,
            })),
            None => Err(SignError::MissingPayload),
        }
    }
}

/// Where to put a signature.
#[derive(Debug, Clone, PartialEq)]
pub struct StampRequest {
    /// Zero-based page index.
    pub page_index: usize,
    pub viewport: Viewport,
    /// Content centre in viewport pixels.
    pub center: VisualPoint,
    pub payload: SignaturePayload,
}

/// What was drawn, for audit records and callers that want to show it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedStamp {
    pub page: PageGeometry,
    pub placement: Placement,
    pub timestamp_origin: PdfPoint,
    pub timestamp_text: String,
}

/// A stamped document that has not been written anywhere.
#[derive(Debug, Clone)]
pub struct RenderedStamp {
    pub pdf_bytes: Vec<u8>,
    pub applied: AppliedStamp,
}

/// A stamped document persisted under the uploads root.
#[derive(Debug, Clone)]
pub struct StampResult {
    /// Stored path of the new artifact, relative to the uploads root.
    pub new_file_path: String,
    pub pdf_bytes: Vec<u8>,
    pub applied: AppliedStamp,
}

enum Prepared {
    Text(TextSignature),
    Image(DecodedImage),
}

pub struct SignatureStamper<D = LopdfDocument> {
    config: StampConfig,
    uploads: UploadsRoot,
    backend: PhantomData<fn() -> D>,
}

impl<D: SignableDocument> SignatureStamper<D> {
    pub fn new(config: StampConfig, uploads: UploadsRoot) -> Self {
        Self {
            config,
            uploads,
            backend: PhantomData,
        }
    }

    pub fn config(&self) -> &StampConfig {
        &self.config
    }

    pub fn uploads(&self) -> &UploadsRoot {
        &self.uploads
    }

    /// Stamp `document` and write the result as a new file named after
    /// `source_path`. Nothing is written if any validation fails.
    pub fn stamp(
        &self,
        source_path: &str,
        document: &[u8],
        request: &StampRequest,
    ) -> SignResult<StampResult> {
        // Resolve before doing any work so a bad path has no side effects.
        self.uploads.resolve(source_path)?;
        let rendered = self.render(document, request)?;
        let new_file_path = self.uploads.write_signed(source_path, &rendered.pdf_bytes)?;
        info!(
            source = source_path,
            signed = %new_file_path,
            page = request.page_index,
            "stamped signature"
        );

        Ok(StampResult {
            new_file_path,
            pdf_bytes: rendered.pdf_bytes,
            applied: rendered.applied,
        })
    }

    /// Read a stored document and stamp it.
    pub fn stamp_stored(&self, source_path: &str, request: &StampRequest) -> SignResult<StampResult> {
        let document = self.uploads.read(source_path)?;
        self.stamp(source_path, &document, request)
    }

    /// Stamp in memory only.
    pub fn render(&self, document: &[u8], request: &StampRequest) -> SignResult<RenderedStamp> {
        let mut doc = D::load(document)?;
        let applied = self.apply(&mut doc, request)?;
        let pdf_bytes = doc.save()?;
        debug!(len = pdf_bytes.len(), "serialized signed PDF");
        Ok(RenderedStamp { pdf_bytes, applied })
    }

    /// Validate the request against `doc` and draw the signature and
    /// timestamp onto it.
    pub fn apply(&self, doc: &mut D, request: &StampRequest) -> SignResult<AppliedStamp> {
        let page_index = request.page_index;
        let count = doc.page_count();
        if page_index >= count {
            return Err(SignError::InvalidPage {
                index: page_index,
                count,
            });
        }

        let page = doc.page_geometry(page_index)?;
        debug!(
            page_index,
            width = page.width,
            height = page.height,
            rotation = page.rotation.degrees(),
            "target page"
        );

        let viewport = request.viewport;
        if !viewport.is_valid() {
            return Err(SignError::InvalidViewport {
                width: viewport.width,
                height: viewport.height,
            });
        }
        if !request.center.is_finite() {
            return Err(SignError::InvalidPosition {
                x: request.center.x,
                y: request.center.y,
            });
        }

        let placement = match self.prepare(&request.payload)? {
            Prepared::Image(image) => {
                let (width, height) = image.scaled(self.config.image_scale);
                let placement = place(
                    request.center,
                    viewport,
                    &page,
                    ContentExtent::Image { width, height },
                );
                let embedded = doc.embed_image(&image)?;
                doc.draw_image(
                    page_index,
                    &embedded,
                    &ImageDraw {
                        origin: placement.origin,
                        width,
                        height,
                        rotation: placement.rotation,
                    },
                )?;
                placement
            }
            Prepared::Text(signature) => {
                let font = StandardFont::HelveticaBold;
                let width = font.width_of_text_at_size(&signature.text, signature.font_size);
                let placement = place(
                    request.center,
                    viewport,
                    &page,
                    ContentExtent::Text {
                        width,
                        font_size: signature.font_size,
                    },
                );
                let embedded = doc.embed_font(font)?;
                doc.draw_text(
                    page_index,
                    &embedded,
                    &TextDraw {
                        text: &signature.text,
                        origin: placement.origin,
                        size: signature.font_size,
                        color: self.config.signature_color,
                        rotation: placement.rotation,
                    },
                )?;
                placement
            }
        };
        debug!(
            center_x = placement.center.x,
            center_y = placement.center.y,
            origin_x = placement.origin.x,
            origin_y = placement.origin.y,
            "placed signature"
        );

        let timestamp_text = format!("Signed on: {}", self.local_timestamp());
        let timestamp_origin = PdfPoint::new(
            placement.center.x,
            (placement.origin.y - self.config.timestamp_gap).max(self.config.timestamp_min_y),
        );
        let font = doc.embed_font(StandardFont::Helvetica)?;
        doc.draw_text(
            page_index,
            &font,
            &TextDraw {
                text: &timestamp_text,
                origin: timestamp_origin,
                size: self.config.timestamp_font_size,
                color: self.config.timestamp_color,
                rotation: Rotation::Deg0,
            },
        )?;

        Ok(AppliedStamp {
            page,
            placement,
            timestamp_origin,
            timestamp_text,
        })
    }

    fn prepare(&self, payload: &SignaturePayload) -> SignResult<Prepared> {
        match payload {
            SignaturePayload::Text(text) if text.text.trim().is_empty() => {
                Err(SignError::MissingPayload)
            }
            SignaturePayload::Text(text)
                if !(text.font_size.is_finite() && text.font_size > 0.0) =>
            {
                Err(SignError::InvalidSignatureData(format!(
                    "font size must be a positive number, got {}",
                    text.font_size
                )))
            }
            SignaturePayload::Text(text) => Ok(Prepared::Text(text.clone())),
            SignaturePayload::Image(image) => {
                image.check_size(self.config.max_image_bytes)?;
                debug!(format = ?image.format, len = image.bytes.len(), "decoding signature image");
                decode_with_fallback(image).map(Prepared::Image)
            }
        }
    }

    fn local_timestamp(&self) -> String {
        let now = Local::now();
        let mut out = String::new();
        if write!(out, "{}", now.format(&self.config.timestamp_format)).is_err() {
            out.clear();
            out.push_str(&now.to_rfc2822());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::ImageFormat;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum Drawn {
        Image(ImageDraw),
        Text {
            text: String,
            font: StandardFont,
            origin: PdfPoint,
            size: f64,
            color: [f64; 3],
            rotation: Rotation,
        },
    }

    /// Records draw calls instead of producing a PDF.
    struct RecordingDocument {
        pages: Vec<PageGeometry>,
        drawn: Vec<Drawn>,
    }

    impl RecordingDocument {
        fn letter(rotation: Rotation) -> Self {
            Self {
                pages: vec![PageGeometry {
                    width: 612.0,
                    height: 792.0,
                    rotation,
                }],
                drawn: Vec::new(),
            }
        }
    }

    impl SignableDocument for RecordingDocument {
        type Image = (u32, u32);
        type Font = StandardFont;

        fn load(_bytes: &[u8]) -> SignResult<Self> {
            Ok(Self::letter(Rotation::Deg0))
        }

        fn page_count(&self) -> usize {
            self.pages.len()
        }

        fn page_geometry(&self, page_index: usize) -> SignResult<PageGeometry> {
            Ok(self.pages[page_index])
        }

        fn embed_image(&mut self, image: &DecodedImage) -> SignResult<(u32, u32)> {
            Ok((image.width, image.height))
        }

        fn embed_font(&mut self, font: StandardFont) -> SignResult<StandardFont> {
            Ok(font)
        }

        fn draw_image(&mut self, _: usize, _: &(u32, u32), draw: &ImageDraw) -> SignResult<()> {
            self.drawn.push(Drawn::Image(*draw));
            Ok(())
        }

        fn draw_text(&mut self, _: usize, font: &StandardFont, draw: &TextDraw) -> SignResult<()> {
            self.drawn.push(Drawn::Text {
                text: draw.text.to_string(),
                font: *font,
                origin: draw.origin,
                size: draw.size,
                color: draw.color,
                rotation: draw.rotation,
            });
            Ok(())
        }

        fn save(&mut self) -> SignResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn stamper() -> (TempDir, SignatureStamper<RecordingDocument>) {
        let dir = TempDir::new().unwrap();
        let uploads = UploadsRoot::open(dir.path()).unwrap();
        (dir, SignatureStamper::new(StampConfig::default(), uploads))
    }

    fn text_request(text: &str, center: VisualPoint) -> StampRequest {
        StampRequest {
            page_index: 0,
            viewport: Viewport::new(700.0, 990.0),
            center,
            payload: SignaturePayload::Text(TextSignature {
                text: text.to_string(),
                font_size: 22.0,
            }),
        }
    }

    fn png_signature(width: u32, height: u32) -> ImageSignature {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([0, 0, 0, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        ImageSignature {
            bytes: out.into_inner(),
            format: ImageFormat::Png,
        }
    }

    #[test]
    fn centres_bold_text_on_unrotated_page() {
        let (_dir, stamper) = stamper();
        let mut doc = RecordingDocument::letter(Rotation::Deg0);
        let applied = stamper
            .apply(&mut doc, &text_request("Jane Doe", VisualPoint::new(350.0, 495.0)))
            .unwrap();

        let width = StandardFont::HelveticaBold.width_of_text_at_size("Jane Doe", 22.0);
        assert_eq!(applied.placement.center, PdfPoint::new(306.0, 396.0));
        assert_eq!(applied.placement.origin, PdfPoint::new(306.0 - width / 2.0, 396.0 - 11.0));

        match &doc.drawn[0] {
            Drawn::Text {
                text,
                font,
                size,
                color,
                rotation,
                ..
            } => {
                assert_eq!(text, "Jane Doe");
                assert_eq!(*font, StandardFont::HelveticaBold);
                assert_eq!(*size, 22.0);
                assert_eq!(*color, [0.0, 0.0, 0.8]);
                assert_eq!(*rotation, Rotation::Deg0);
            }
            other => panic!("unexpected draw {other:?}"),
        }
    }

    #[test]
    fn timestamp_sits_below_signature() {
        let (_dir, stamper) = stamper();
        let mut doc = RecordingDocument::letter(Rotation::Deg0);
        let applied = stamper
            .apply(&mut doc, &text_request("Jane Doe", VisualPoint::new(350.0, 495.0)))
            .unwrap();

        assert_eq!(applied.timestamp_origin, PdfPoint::new(306.0, 385.0 - 12.0));
        assert!(applied.timestamp_text.starts_with("Signed on: "));
        match &doc.drawn[1] {
            Drawn::Text {
                font,
                size,
                color,
                rotation,
                ..
            } => {
                assert_eq!(*font, StandardFont::Helvetica);
                assert_eq!(*size, 8.0);
                assert_eq!(*color, [0.5, 0.5, 0.5]);
                assert_eq!(*rotation, Rotation::Deg0);
            }
            other => panic!("unexpected draw {other:?}"),
        }
    }

    #[test]
    fn timestamp_is_clamped_to_page_bottom() {
        let (_dir, stamper) = stamper();
        let mut doc = RecordingDocument::letter(Rotation::Deg0);
        let applied = stamper
            .apply(&mut doc, &text_request("Jane Doe", VisualPoint::new(350.0, 985.0)))
            .unwrap();
        assert_eq!(applied.timestamp_origin.y, 5.0);
    }

    #[test]
    fn rotated_text_uses_rotation_specific_origin() {
        let (_dir, stamper) = stamper();
        let mut doc = RecordingDocument::letter(Rotation::Deg90);
        let applied = stamper
            .apply(&mut doc, &text_request("Jane Doe", VisualPoint::new(350.0, 495.0)))
            .unwrap();

        let width = StandardFont::HelveticaBold.width_of_text_at_size("Jane Doe", 22.0);
        assert_eq!(applied.placement.rotation, Rotation::Deg90);
        assert_eq!(applied.placement.origin, PdfPoint::new(306.0 - 11.0, 396.0 - width / 2.0));
    }

    #[test]
    fn image_is_scaled_and_centred() {
        let (_dir, stamper) = stamper();
        let mut doc = RecordingDocument::letter(Rotation::Deg180);
        let request = StampRequest {
            page_index: 0,
            viewport: Viewport::new(700.0, 990.0),
            center: VisualPoint::new(350.0, 495.0),
            payload: SignaturePayload::Image(png_signature(200, 100)),
        };
        let applied = stamper.apply(&mut doc, &request).unwrap();

        match &doc.drawn[0] {
            Drawn::Image(draw) => {
                assert!((draw.width - 60.0).abs() < 1e-9);
                assert!((draw.height - 30.0).abs() < 1e-9);
                assert!((draw.origin.x - 276.0).abs() < 1e-9);
                assert!((draw.origin.y - 381.0).abs() < 1e-9);
                assert_eq!(draw.rotation, Rotation::Deg180);
            }
            other => panic!("unexpected draw {other:?}"),
        }
        assert_eq!(applied.placement.center, PdfPoint::new(306.0, 396.0));
    }

    #[test]
    fn validation_order_and_errors() {
        let (_dir, stamper) = stamper();

        let mut doc = RecordingDocument::letter(Rotation::Deg0);
        let mut request = text_request("Jane", VisualPoint::new(1.0, 1.0));
        request.page_index = 1;
        let err = stamper.apply(&mut doc, &request).unwrap_err();
        assert!(matches!(err, SignError::InvalidPage { index: 1, count: 1 }));

        let mut request = text_request("Jane", VisualPoint::new(1.0, 1.0));
        request.viewport = Viewport::new(0.0, 990.0);
        let err = stamper.apply(&mut doc, &request).unwrap_err();
        assert!(matches!(err, SignError::InvalidViewport { .. }));

        let request = text_request("   ", VisualPoint::new(1.0, 1.0));
        let err = stamper.apply(&mut doc, &request).unwrap_err();
        assert!(matches!(err, SignError::MissingPayload));

        assert!(doc.drawn.is_empty());
    }

    #[test]
    fn non_finite_centre_or_font_size_is_rejected() {
        let (_dir, stamper) = stamper();
        let mut doc = RecordingDocument::letter(Rotation::Deg0);

        for center in [
            VisualPoint::new(f64::NAN, 495.0),
            VisualPoint::new(350.0, f64::INFINITY),
            VisualPoint::new(f64::NEG_INFINITY, f64::NAN),
        ] {
            let err = stamper
                .apply(&mut doc, &text_request("Jane Doe", center))
                .unwrap_err();
            assert!(matches!(err, SignError::InvalidPosition { .. }), "{center:?}");
        }

        for font_size in [f64::NAN, f64::INFINITY, 0.0, -1.0] {
            let mut request = text_request("Jane Doe", VisualPoint::new(350.0, 495.0));
            request.payload = SignaturePayload::Text(TextSignature {
                text: "Jane Doe".to_string(),
                font_size,
            });
            let err = stamper.apply(&mut doc, &request).unwrap_err();
            assert!(matches!(err, SignError::InvalidSignatureData(_)), "{font_size}");
        }

        assert!(doc.drawn.is_empty());
    }

    #[test]
    fn oversized_image_is_rejected_before_decoding() {
        let dir = TempDir::new().unwrap();
        let uploads = UploadsRoot::open(dir.path()).unwrap();
        let signature = png_signature(10, 10);
        let config = StampConfig {
            max_image_bytes: signature.bytes.len() - 1,
            ..StampConfig::default()
        };
        let stamper: SignatureStamper<RecordingDocument> = SignatureStamper::new(config, uploads);

        let mut doc = RecordingDocument::letter(Rotation::Deg0);
        let request = StampRequest {
            page_index: 0,
            viewport: Viewport::new(700.0, 990.0),
            center: VisualPoint::new(10.0, 10.0),
            payload: SignaturePayload::Image(signature),
        };
        let err = stamper.apply(&mut doc, &request).unwrap_err();
        assert!(matches!(err, SignError::PayloadTooLarge { .. }));
        assert!(doc.drawn.is_empty());
    }

    #[test]
    fn payload_from_fields_prefers_image() {
        let config = StampConfig::default();
        let url = "data:image/png;base64,AAAA";
        let payload = SignaturePayload::from_fields(Some("Jane"), Some(url), &config).unwrap();
        assert!(matches!(payload, SignaturePayload::Image(_)));

        let payload = SignaturePayload::from_fields(Some("Jane"), None, &config).unwrap();
        assert_eq!(
            payload,
            SignaturePayload::Text(TextSignature {
                text: "Jane".to_string(),
                font_size: 22.0
            })
        );

        let err = SignaturePayload::from_fields(Some(""), Some(" "), &config).unwrap_err();
        assert!(matches!(err, SignError::MissingPayload));

        let small = StampConfig {
            max_image_bytes: 10,
            ..StampConfig::default()
        };
        // 20 base64 characters decode to at least 13 bytes; not even valid base64.
        let url = format!("data:image/png;base64,{}", "!".repeat(20));
        let err = SignaturePayload::from_fields(None, Some(&url), &small).unwrap_err();
        assert!(matches!(err, SignError::PayloadTooLarge { limit: 10, .. }));
    }
}
