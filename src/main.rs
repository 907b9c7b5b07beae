// Signet command line
//
// `signet inspect` reports the page geometry of a PDF; `signet stamp` signs a
// document inside the uploads root and prints the new artifact as JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::error;
use tracing_subscriber::EnvFilter;

use signet_lib::pdf::{
    ImageFormat, ImageSignature, LopdfDocument, PageGeometry, PdfPoint, Placement,
    SignableDocument, Viewport, VisualPoint,
};
use signet_lib::{
    document_path_from_arg, SignaturePayload, SignatureStamper, SigningConfig, StampRequest,
    UploadsRoot,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stamps visual signatures onto PDF documents.")]
struct Cli {
    #[arg(short, long, help = "TOML config file. Defaults apply when omitted.")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the size and rotation of every page as JSON.
    Inspect {
        #[arg(help = "PDF path, percent-encoded path or file:// URL.")]
        document: String,
    },
    /// Stamp a signature and write a new signed copy next to the source.
    Stamp {
        #[arg(help = "Stored document path inside the uploads root.")]
        document: String,
        #[arg(short, long, default_value_t = 0, help = "Zero-based page index.")]
        page: usize,
        #[arg(long, value_parser = parse_viewport, help = "Viewer size as WIDTHxHEIGHT, e.g. 700x990.")]
        viewport: Viewport,
        #[arg(long, value_parser = parse_point, help = "Signature centre in viewer pixels as X,Y.")]
        at: VisualPoint,
        #[arg(short, long, conflicts_with = "image", help = "Signature text.")]
        text: Option<String>,
        #[arg(short, long, help = "PNG or JPEG signature image file.")]
        image: Option<PathBuf>,
        #[arg(long, help = "Overrides the configured uploads root.")]
        uploads: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct PageReport {
    index: usize,
    width: f64,
    height: f64,
    rotation: u16,
}

impl PageReport {
    fn new(index: usize, page: PageGeometry) -> Self {
        Self {
            index,
            width: page.width,
            height: page.height,
            rotation: page.rotation.degrees(),
        }
    }
}

#[derive(Serialize)]
struct StampReport {
    new_file_path: String,
    size: usize,
    page: PageReport,
    placement: Placement,
    timestamp_origin: PdfPoint,
    timestamp_text: String,
}

fn parse_viewport(s: &str) -> Result<Viewport, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("Invalid viewport '{}'. Expected WIDTHxHEIGHT, e.g. 700x990", s))?;
    let width = w.trim().parse::<f64>().map_err(|e| format!("Invalid viewport width: {}", e))?;
    let height = h.trim().parse::<f64>().map_err(|e| format!("Invalid viewport height: {}", e))?;
    Ok(Viewport::new(width, height))
}

fn parse_point(s: &str) -> Result<VisualPoint, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("Invalid point '{}'. Expected X,Y, e.g. 350,495", s))?;
    let x = x.trim().parse::<f64>().map_err(|e| format!("Invalid x: {}", e))?;
    let y = y.trim().parse::<f64>().map_err(|e| format!("Invalid y: {}", e))?;
    let point = VisualPoint::new(x, y);
    if !point.is_finite() {
        return Err(format!("Invalid point '{}'. Coordinates must be finite", s));
    }
    Ok(point)
}

fn load_config(path: Option<&Path>) -> Result<SigningConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(SigningConfig::load(path)?),
        None => Ok(SigningConfig::default()),
    }
}

fn inspect(document: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = document_path_from_arg(document);
    let bytes = fs::read(&path)?;
    let doc = LopdfDocument::load(&bytes)?;

    let pages = (0..doc.page_count())
        .map(|index| Ok(PageReport::new(index, doc.page_geometry(index)?)))
        .collect::<Result<Vec<_>, signet_lib::SignError>>()?;
    println!("{}", serde_json::to_string_pretty(&pages)?);
    Ok(())
}

fn image_signature(path: &Path) -> Result<ImageSignature, Box<dyn std::error::Error>> {
    let bytes = fs::read(path)?;
    let declared = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    let format = match declared.as_deref() {
        Some("jpg") | Some("jpeg") => ImageFormat::Jpeg,
        Some("png") => ImageFormat::Png,
        _ => ImageFormat::sniff(&bytes).unwrap_or(ImageFormat::Png),
    };
    Ok(ImageSignature { bytes, format })
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Inspect { document } => inspect(&document),
        Command::Stamp {
            document,
            page,
            viewport,
            at,
            text,
            image,
            uploads,
        } => {
            if let Some(uploads) = uploads {
                config.uploads_root = uploads;
            }
            let payload = match image {
                Some(path) => SignaturePayload::Image(image_signature(&path)?),
                None => SignaturePayload::from_fields(text.as_deref(), None, &config.stamp)?,
            };

            let root = UploadsRoot::open(&config.uploads_root)?;
            let stamper: SignatureStamper = SignatureStamper::new(config.stamp.clone(), root);
            let source = document_path_from_arg(&document);
            let request = StampRequest {
                page_index: page,
                viewport,
                center: at,
                payload,
            };
            let result = stamper.stamp_stored(&source, &request)?;

            let report = StampReport {
                new_file_path: result.new_file_path,
                size: result.pdf_bytes.len(),
                page: PageReport::new(page, result.applied.page),
                placement: result.applied.placement,
                timestamp_origin: result.applied.timestamp_origin,
                timestamp_text: result.applied.timestamp_text,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
