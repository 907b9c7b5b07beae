//! PDF placement and mutation.
//!
//! This module provides:
//! - Visual-to-PDF coordinate mapping under page rotation
//! - Standard font metrics for centring signature text
//! - Signature image decoding with format fallback
//! - The lopdf-backed document capability the stamper draws through

pub mod document;
pub mod fonts;
pub mod geometry;
pub mod raster;

pub use document::{ImageDraw, LopdfDocument, SignableDocument, TextDraw};
pub use fonts::StandardFont;
pub use geometry::{
    draw_origin, map_center_to_pdf, place, visual_fraction_from_pdf, ContentExtent, PageGeometry,
    PdfPoint, Placement, Rotation, Viewport, VisualPoint,
};
pub use raster::{decode_with_fallback, DecodedImage, ImageFormat, ImageSignature};
