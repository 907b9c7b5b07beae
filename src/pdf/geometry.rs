//! Visual-space to PDF-space coordinate mapping.
//!
//! The viewer captures where the user dropped a signature as the content
//! centre in pixels of the rendered (already rotated) page. The PDF content
//! stream is drawn in the unrotated frame, so the point is un-rotated here by
//! the inverse of the page's display rotation.
//!
//! Page rotation is restricted to quadrants, so every transform is a closed
//! case table keyed on [`Rotation`] rather than a trigonometric formula.

use serde::{Deserialize, Serialize};

/// Pixel dimensions of the surface the visual point was captured against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Both dimensions are finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }
}

/// Content centre in viewport pixels, origin top-left.
///
/// Not clamped to the viewport: a signature dragged past the page edge is
/// still placed where it was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisualPoint {
    pub x: f64,
    pub y: f64,
}

impl VisualPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Out-of-viewport values are fine, NaN and infinities are not.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// A point in PDF user space (bottom-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdfPoint {
    pub x: f64,
    pub y: f64,
}

impl PdfPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Display rotation of a page, clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Normalize a stored `/Rotate` value.
    ///
    /// The value is reduced modulo 360 (negative values included). Anything
    /// that is not a quadrant is treated as unrotated.
    pub fn from_degrees(degrees: i64) -> Self {
        match degrees.rem_euclid(360) {
            90 => Rotation::Deg90,
            180 => Rotation::Deg180,
            270 => Rotation::Deg270,
            _ => Rotation::Deg0,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Angle (counter-clockwise degrees) applied to the draw call so the
    /// content reads upright once the viewer rotates the page.
    pub fn draw_angle(self) -> i16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => -90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 90,
        }
    }

    /// `[a b c d]` of the rotation matrix for [`Rotation::draw_angle`].
    pub fn draw_matrix(self) -> [f64; 4] {
        // [cos sin -sin cos]
        match self {
            Rotation::Deg0 => [1.0, 0.0, 0.0, 1.0],
            Rotation::Deg90 => [0.0, -1.0, 1.0, 0.0],
            Rotation::Deg180 => [-1.0, 0.0, 0.0, -1.0],
            Rotation::Deg270 => [0.0, 1.0, -1.0, 0.0],
        }
    }
}

/// Size and display rotation of a target page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageGeometry {
    pub width: f64,
    pub height: f64,
    pub rotation: Rotation,
}

/// Unrotated extent of the content being placed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContentExtent {
    /// Drawn image size in PDF units.
    Image { width: f64, height: f64 },
    /// Text advance width and font size; the box is `width x font_size`.
    Text { width: f64, font_size: f64 },
}

/// Where and how a piece of content lands on the page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    /// PDF-space point the content is visually centred on.
    pub center: PdfPoint,
    /// Origin handed to the draw primitive.
    pub origin: PdfPoint,
    pub rotation: Rotation,
}

/// Map a visual content centre to PDF space.
///
/// `viewport` must already be validated (see [`Viewport::is_valid`]).
pub fn map_center_to_pdf(point: VisualPoint, viewport: Viewport, page: &PageGeometry) -> PdfPoint {
    let pct_x = point.x / viewport.width;
    let pct_y = point.y / viewport.height;
    let (w, h) = (page.width, page.height);

    match page.rotation {
        Rotation::Deg0 => PdfPoint::new(pct_x * w, h - pct_y * h),
        Rotation::Deg90 => PdfPoint::new(pct_y * w, pct_x * h),
        Rotation::Deg180 => PdfPoint::new(w - pct_x * w, pct_y * h),
        Rotation::Deg270 => PdfPoint::new(w - pct_y * w, h - pct_x * h),
    }
}

/// Inverse of [`map_center_to_pdf`]: the viewport fractions `(pct_x, pct_y)`
/// that map onto `point`.
pub fn visual_fraction_from_pdf(point: PdfPoint, page: &PageGeometry) -> (f64, f64) {
    let (w, h) = (page.width, page.height);

    match page.rotation {
        Rotation::Deg0 => (point.x / w, (h - point.y) / h),
        Rotation::Deg90 => (point.y / h, point.x / w),
        Rotation::Deg180 => ((w - point.x) / w, point.y / h),
        Rotation::Deg270 => ((h - point.y) / h, (w - point.x) / w),
    }
}

/// Origin for a draw primitive that rotates around its own origin, chosen so
/// the content's visual centre lands on `center`.
///
/// Images pivot on the same corner they are positioned by, so the origin is
/// the plain half-extent offset. Text pivots on its baseline-left point and
/// needs a per-rotation offset.
pub fn draw_origin(center: PdfPoint, extent: ContentExtent, rotation: Rotation) -> PdfPoint {
    match extent {
        ContentExtent::Image { width, height } => {
            PdfPoint::new(center.x - width / 2.0, center.y - height / 2.0)
        }
        ContentExtent::Text { width, font_size } => match rotation {
            Rotation::Deg0 => PdfPoint::new(center.x - width / 2.0, center.y - font_size / 2.0),
            Rotation::Deg90 => PdfPoint::new(center.x - font_size / 2.0, center.y - width / 2.0),
            Rotation::Deg180 => PdfPoint::new(center.x + width / 2.0, center.y + font_size / 2.0),
            Rotation::Deg270 => PdfPoint::new(center.x + font_size / 2.0, center.y + width / 2.0),
        },
    }
}

/// Map the visual centre and derive the draw origin in one step.
pub fn place(
    point: VisualPoint,
    viewport: Viewport,
    page: &PageGeometry,
    extent: ContentExtent,
) -> Placement {
    let center = map_center_to_pdf(point, viewport, page);
    Placement {
        center,
        origin: draw_origin(center, extent, page.rotation),
        rotation: page.rotation,
    }
}
