#![allow(dead_code)]

use std::io::Cursor;

use lopdf::{dictionary, Dictionary, Document, Object, Stream};
use signet_lib::{Account, SigningConfig};
use tempfile::TempDir;

/// A PDF with one page per `(width, height, rotate)` entry.
pub fn pdf_with_pages(pages: &[(i64, i64, i64)]) -> Vec<u8> {
    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();

    let mut kids = Vec::new();
    for (index, &(width, height, rotate)) in pages.iter().enumerate() {
        let text = format!("BT /F1 12 Tf 72 72 Td (Page {}) Tj ET", index + 1);
        let content_id = doc.add_object(Stream::new(Dictionary::new(), text.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), width.into(), height.into()],
            "Rotate" => rotate,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut output = Vec::new();
    doc.save_to(&mut output).unwrap();
    output
}

pub fn letter_pdf() -> Vec<u8> {
    pdf_with_pages(&[(612, 792, 0)])
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 200, 255]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([10, 20, 200]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    use base64::Engine;
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Uploads root in a temp dir holding `name` with `bytes`.
pub fn config_with_upload(name: &str, bytes: &[u8]) -> (TempDir, SigningConfig) {
    let dir = TempDir::new().unwrap();
    let uploads = dir.path().join("uploads");
    std::fs::create_dir_all(&uploads).unwrap();
    std::fs::write(uploads.join(name), bytes).unwrap();
    let config = SigningConfig {
        uploads_root: uploads,
        ..SigningConfig::default()
    };
    (dir, config)
}

pub fn owner() -> Account {
    Account {
        user_id: "owner-1".to_string(),
        name: "Olivia Owner".to_string(),
        email: "olivia@example.com".to_string(),
    }
}

/// Concatenated, decoded content of a page.
pub fn page_content(pdf: &[u8], page_index: usize) -> String {
    let doc = Document::load_mem(pdf).unwrap();
    let page_id = *doc.get_pages().get(&(page_index as u32 + 1)).unwrap();
    String::from_utf8_lossy(&doc.get_page_content(page_id).unwrap()).to_lowercase()
}

/// How WinAnsi text shows up in a content stream.
pub fn hex_text(text: &str) -> String {
    let hex: String = text.bytes().map(|b| format!("{:02x}", b)).collect();
    format!("<{}>", hex)
}
