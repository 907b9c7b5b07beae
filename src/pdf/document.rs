//! PDF manipulation backend.
//!
//! [`SignableDocument`] is the capability the stamper needs from a PDF
//! library: load, inspect pages, embed images and fonts, draw, serialize.
//! [`LopdfDocument`] implements it on top of lopdf by appending content
//! streams to the target page.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use tracing::warn;

use super::fonts::{encode_win_ansi, StandardFont};
use super::geometry::{PageGeometry, PdfPoint, Rotation};
use super::raster::DecodedImage;
use crate::error::{SignError, SignResult};

/// US Letter, used when a page has no usable `/MediaBox`.
const FALLBACK_PAGE_SIZE: (f64, f64) = (612.0, 792.0);

/// Guard against cyclic `/Parent` chains.
const MAX_TREE_DEPTH: usize = 64;

/// An image draw call. The primitive translates to `origin`, rotates, then
/// scales the unit square to `width x height`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageDraw {
    pub origin: PdfPoint,
    pub width: f64,
    pub height: f64,
    pub rotation: Rotation,
}

/// A text draw call. `origin` is the baseline-left point the text rotates
/// around.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextDraw<'a> {
    pub text: &'a str,
    pub origin: PdfPoint,
    pub size: f64,
    /// RGB, each channel in 0.0-1.0.
    pub color: [f64; 3],
    pub rotation: Rotation,
}

/// The PDF operations the stamper relies on.
pub trait SignableDocument: Sized {
    type Image;
    type Font;

    /// Parse a document. Fails with [`SignError::MalformedDocument`].
    fn load(bytes: &[u8]) -> SignResult<Self>;

    fn page_count(&self) -> usize;

    /// Size and normalized rotation of a zero-based page.
    fn page_geometry(&self, page_index: usize) -> SignResult<PageGeometry>;

    fn embed_image(&mut self, image: &DecodedImage) -> SignResult<Self::Image>;

    fn embed_font(&mut self, font: StandardFont) -> SignResult<Self::Font>;

    fn draw_image(
        &mut self,
        page_index: usize,
        image: &Self::Image,
        draw: &ImageDraw,
    ) -> SignResult<()>;

    fn draw_text(&mut self, page_index: usize, font: &Self::Font, draw: &TextDraw) -> SignResult<()>;

    /// Serialize the document in its current state.
    fn save(&mut self) -> SignResult<Vec<u8>>;
}

/// lopdf-backed [`SignableDocument`].
pub struct LopdfDocument {
    doc: Document,
    /// Page object ids in document order.
    pages: Vec<ObjectId>,
    fonts: HashMap<StandardFont, ObjectId>,
    /// Pages whose original content has been wrapped in `q ... Q`.
    wrapped: HashSet<ObjectId>,
}

impl LopdfDocument {
    pub fn from_document(doc: Document) -> Self {
        // get_pages is keyed by 1-based page number, already in order
        let pages = doc.get_pages().into_values().collect();
        Self {
            doc,
            pages,
            fonts: HashMap::new(),
            wrapped: HashSet::new(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    fn page_id(&self, page_index: usize) -> SignResult<ObjectId> {
        self.pages
            .get(page_index)
            .copied()
            .ok_or(SignError::InvalidPage {
                index: page_index,
                count: self.pages.len(),
            })
    }

    fn resolve<'a>(&'a self, obj: &'a Object) -> Option<&'a Object> {
        match obj {
            Object::Reference(id) => self.doc.get_object(*id).ok(),
            other => Some(other),
        }
    }

    /// Look up an inheritable page attribute, walking `/Parent` links.
    fn inherited_attribute(&self, page_id: ObjectId, key: &[u8]) -> Option<&Object> {
        let mut current = Some(page_id);
        let mut depth = 0;
        while let Some(id) = current {
            if depth > MAX_TREE_DEPTH {
                return None;
            }
            depth += 1;

            let dict = self.doc.get_object(id).and_then(Object::as_dict).ok()?;
            if let Ok(value) = dict.get(key) {
                return self.resolve(value);
            }
            current = dict.get(b"Parent").and_then(Object::as_reference).ok();
        }
        None
    }

    fn media_box_size(&self, page_id: ObjectId) -> Option<(f64, f64)> {
        let arr = self.inherited_attribute(page_id, b"MediaBox")?.as_array().ok()?;
        if arr.len() != 4 {
            return None;
        }
        let llx = get_number(self.resolve(&arr[0])?)?;
        let lly = get_number(self.resolve(&arr[1])?)?;
        let urx = get_number(self.resolve(&arr[2])?)?;
        let ury = get_number(self.resolve(&arr[3])?)?;
        Some(((urx - llx).abs(), (ury - lly).abs()))
    }

    /// The page's effective resource dictionary, resolved to a copy.
    fn effective_resources(&self, page_id: ObjectId) -> Dictionary {
        self.inherited_attribute(page_id, b"Resources")
            .and_then(|obj| obj.as_dict().ok())
            .cloned()
            .unwrap_or_default()
    }

    /// Mutable access to the page's own resource dictionary, materializing
    /// an inherited one on the page first.
    fn page_resources_mut(&mut self, page_id: ObjectId) -> SignResult<&mut Dictionary> {
        let own = self
            .doc
            .get_object(page_id)
            .and_then(Object::as_dict)
            .map_err(|e| SignError::MalformedDocument(e.to_string()))?
            .get(b"Resources")
            .ok()
            .cloned();

        match own {
            Some(Object::Reference(id)) => {
                return self
                    .doc
                    .get_object_mut(id)
                    .and_then(Object::as_dict_mut)
                    .map_err(|e| SignError::MalformedDocument(format!("page resources: {e}")));
            }
            Some(Object::Dictionary(_)) => {}
            _ => {
                let inherited = self.effective_resources(page_id);
                page_dict_mut(&mut self.doc, page_id)?.set("Resources", inherited);
            }
        }

        page_dict_mut(&mut self.doc, page_id)?
            .get_mut(b"Resources")
            .and_then(Object::as_dict_mut)
            .map_err(|e| SignError::MalformedDocument(format!("page resources: {e}")))
    }

    /// Register `target` under a fresh name in the page's `category`
    /// (`/XObject` or `/Font`) resources and return the name.
    fn register_resource(
        &mut self,
        page_id: ObjectId,
        category: &[u8],
        prefix: &str,
        target: ObjectId,
    ) -> SignResult<Vec<u8>> {
        let mut entries = self
            .effective_resources(page_id)
            .get(category)
            .ok()
            .and_then(|obj| self.resolve(obj))
            .and_then(|obj| obj.as_dict().ok())
            .cloned()
            .unwrap_or_default();

        let name = (1..)
            .map(|n| format!("{prefix}{n}").into_bytes())
            .find(|candidate| !entries.has(candidate))
            .unwrap_or_else(|| prefix.as_bytes().to_vec());
        entries.set(name.clone(), Object::Reference(target));

        self.page_resources_mut(page_id)?
            .set(category.to_vec(), Object::Dictionary(entries));
        Ok(name)
    }

    /// Append drawing operations to a page.
    ///
    /// The first append on a page wraps the existing content in `q ... Q` so
    /// any graphics state it leaves behind does not leak into the stamp.
    fn append_content(&mut self, page_id: ObjectId, operations: Vec<Operation>) -> SignResult<()> {
        let mut existing: Vec<Object> = Vec::new();
        let contents = self
            .doc
            .get_object(page_id)
            .and_then(Object::as_dict)
            .map_err(|e| SignError::MalformedDocument(e.to_string()))?
            .get(b"Contents")
            .ok()
            .cloned();
        match contents {
            Some(Object::Reference(id)) => match self.doc.get_object(id) {
                Ok(Object::Array(arr)) => existing = arr.clone(),
                _ => existing.push(Object::Reference(id)),
            },
            Some(Object::Array(arr)) => existing = arr,
            _ => {}
        }

        let mut prefix = Vec::new();
        let mut streams = Vec::with_capacity(existing.len() + 2);
        if self.wrapped.insert(page_id) && !existing.is_empty() {
            let open = self.doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
            streams.push(Object::Reference(open));
            prefix.extend_from_slice(b"\nQ\n");
        }
        streams.extend(existing);

        let mut body = Content { operations }
            .encode()
            .map_err(|e| SignError::SaveFailed(format!("content stream: {e}")))?;
        prefix.append(&mut body);
        let stamp = self.doc.add_object(Stream::new(Dictionary::new(), prefix));
        streams.push(Object::Reference(stamp));

        page_dict_mut(&mut self.doc, page_id)?.set("Contents", Object::Array(streams));
        Ok(())
    }
}

impl SignableDocument for LopdfDocument {
    type Image = ObjectId;
    type Font = ObjectId;

    fn load(bytes: &[u8]) -> SignResult<Self> {
        let doc =
            Document::load_mem(bytes).map_err(|e| SignError::MalformedDocument(e.to_string()))?;
        Ok(Self::from_document(doc))
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_geometry(&self, page_index: usize) -> SignResult<PageGeometry> {
        let page_id = self.page_id(page_index)?;

        let (width, height) = self.media_box_size(page_id).unwrap_or_else(|| {
            warn!(page_index, "page has no usable MediaBox, assuming US Letter");
            FALLBACK_PAGE_SIZE
        });
        let rotate = self
            .inherited_attribute(page_id, b"Rotate")
            .and_then(get_number)
            .unwrap_or(0.0);

        Ok(PageGeometry {
            width,
            height,
            rotation: Rotation::from_degrees(rotate as i64),
        })
    }

    fn embed_image(&mut self, image: &DecodedImage) -> SignResult<ObjectId> {
        let mut dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(image.width),
            "Height" => i64::from(image.height),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
        };

        if let Some(alpha) = &image.alpha {
            let smask = Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => i64::from(image.width),
                    "Height" => i64::from(image.height),
                    "ColorSpace" => "DeviceGray",
                    "BitsPerComponent" => 8,
                    "Filter" => "FlateDecode",
                },
                deflate(alpha)?,
            );
            let smask_id = self.doc.add_object(smask);
            dict.set("SMask", Object::Reference(smask_id));
        }

        let stream = Stream::new(dict, deflate(&image.rgb)?);
        Ok(self.doc.add_object(stream))
    }

    fn embed_font(&mut self, font: StandardFont) -> SignResult<ObjectId> {
        if let Some(id) = self.fonts.get(&font) {
            return Ok(*id);
        }
        let id = self.doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => font.base_font(),
            "Encoding" => "WinAnsiEncoding",
        });
        self.fonts.insert(font, id);
        Ok(id)
    }

    fn draw_image(&mut self, page_index: usize, image: &ObjectId, draw: &ImageDraw) -> SignResult<()> {
        let page_id = self.page_id(page_index)?;
        let name = self.register_resource(page_id, b"XObject", "ImSig", *image)?;
        let [a, b, c, d] = draw.rotation.draw_matrix();

        let operations = vec![
            Operation::new("q", vec![]),
            Operation::new("cm", reals(&[1.0, 0.0, 0.0, 1.0, draw.origin.x, draw.origin.y])),
            Operation::new("cm", reals(&[a, b, c, d, 0.0, 0.0])),
            Operation::new("cm", reals(&[draw.width, 0.0, 0.0, draw.height, 0.0, 0.0])),
            Operation::new("Do", vec![Object::Name(name)]),
            Operation::new("Q", vec![]),
        ];
        self.append_content(page_id, operations)
    }

    fn draw_text(&mut self, page_index: usize, font: &ObjectId, draw: &TextDraw) -> SignResult<()> {
        let page_id = self.page_id(page_index)?;
        let name = self.register_resource(page_id, b"Font", "FSig", *font)?;
        let [a, b, c, d] = draw.rotation.draw_matrix();
        let [r, g, bl] = draw.color;

        let operations = vec![
            Operation::new("q", vec![]),
            Operation::new("BT", vec![]),
            Operation::new("rg", reals(&[r, g, bl])),
            Operation::new("Tf", vec![Object::Name(name), real(draw.size)]),
            Operation::new("Tm", reals(&[a, b, c, d, draw.origin.x, draw.origin.y])),
            Operation::new(
                "Tj",
                vec![Object::String(encode_win_ansi(draw.text), StringFormat::Hexadecimal)],
            ),
            Operation::new("ET", vec![]),
            Operation::new("Q", vec![]),
        ];
        self.append_content(page_id, operations)
    }

    fn save(&mut self) -> SignResult<Vec<u8>> {
        let mut output = Vec::new();
        self.doc
            .save_to(&mut output)
            .map_err(|e| SignError::SaveFailed(e.to_string()))?;
        Ok(output)
    }
}

fn page_dict_mut(doc: &mut Document, page_id: ObjectId) -> SignResult<&mut Dictionary> {
    doc.get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| SignError::MalformedDocument(format!("page dictionary: {e}")))
}

/// Helper to extract a number from a PDF object.
fn get_number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some(*f as f64),
        _ => None,
    }
}

fn real(value: f64) -> Object {
    Object::Real(value as f32)
}

fn reals(values: &[f64]) -> Vec<Object> {
    values.iter().copied().map(real).collect()
}

fn deflate(data: &[u8]) -> SignResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| SignError::SaveFailed(format!("image compression: {e}")))
}
