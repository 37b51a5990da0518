//! Document bytes → plain text.
//!
//! PDFs go through `pdf-extract`. When that yields (almost) nothing the
//! document is treated as scanned: each page is rasterised with `pdftoppm`
//! and read back with `tesseract`. Anything that is not a PDF is decoded as
//! UTF-8 text.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("PDF parsing failed: {0}")]
    Pdf(String),

    #[error("OCR failed: {0}")]
    Ocr(String),

    #[error("Could not extract any text from the PDF.")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrSettings {
    /// Below this many trimmed characters the text layer is ignored
    pub min_text_chars: usize,
    pub dpi: u32,
    /// tesseract `-l` value, e.g. `eng` or `eng+deu`
    pub language: String,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            min_text_chars: 100,
            dpi: 300,
            language: "eng".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractProgress {
    OcrStarted { pages: usize },
    OcrPage { page: usize, total: usize },
}

impl ExtractProgress {
    pub fn message(&self) -> String {
        match self {
            Self::OcrStarted { .. } => "Scanned PDF detected, starting OCR...".to_string(),
            Self::OcrPage { page, total } => format!("OCR on page {page}/{total}"),
        }
    }
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn page_count(&self, pdf: &Path) -> Result<usize, ExtractError>;

    /// Text of one page, 1-based.
    async fn ocr_page(&self, pdf: &Path, page: usize) -> Result<String, ExtractError>;
}

/// `pdfinfo` / `pdftoppm` (poppler-utils) plus the `tesseract` CLI.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    dpi: u32,
    language: String,
}

impl TesseractOcr {
    pub fn new(dpi: u32) -> Self {
        Self {
            dpi,
            language: "eng".to_string(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }
}

async fn run_tool(program: &str, args: &[&str]) -> Result<String, ExtractError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| ExtractError::Ocr(format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        return Err(ExtractError::Ocr(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_page_count(pdfinfo: &str) -> Option<usize> {
    pdfinfo
        .lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|v| v.trim().parse().ok())
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn page_count(&self, pdf: &Path) -> Result<usize, ExtractError> {
        let pdf = pdf.to_string_lossy();
        let info = run_tool("pdfinfo", &[&*pdf]).await?;
        parse_page_count(&info)
            .ok_or_else(|| ExtractError::Ocr("pdfinfo reported no page count".to_string()))
    }

    async fn ocr_page(&self, pdf: &Path, page: usize) -> Result<String, ExtractError> {
        let dir = tempfile::tempdir().map_err(|e| ExtractError::Ocr(e.to_string()))?;
        let prefix = dir.path().join("page");
        let image = prefix.with_extension("png");

        let pdf = pdf.to_string_lossy();
        let page_arg = page.to_string();
        let dpi_arg = self.dpi.to_string();
        let prefix_arg = prefix.to_string_lossy();
        run_tool(
            "pdftoppm",
            &[
                "-r",
                &dpi_arg,
                "-f",
                &page_arg,
                "-l",
                &page_arg,
                "-png",
                "-singlefile",
                &*pdf,
                &*prefix_arg,
            ],
        )
        .await?;

        let image_arg = image.to_string_lossy();
        run_tool(
            "tesseract",
            &[&*image_arg, "stdout", "-l", &self.language],
        )
        .await
    }
}

pub type ProgressFn<'a> = &'a (dyn Fn(ExtractProgress) + Send + Sync);

pub struct DocumentExtractor {
    ocr: Box<dyn OcrEngine>,
    settings: OcrSettings,
}

fn looks_like_pdf(filename: &str, bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF") || filename.to_ascii_lowercase().ends_with(".pdf")
}

async fn pdf_text_layer(bytes: Vec<u8>) -> Result<String, ExtractError> {
    // pdf-extract is synchronous and can panic on malformed input.
    tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| ExtractError::Pdf(format!("extractor crashed: {e}")))?
        .map_err(|e| ExtractError::Pdf(e.to_string()))
}

impl DocumentExtractor {
    pub fn new(ocr: Box<dyn OcrEngine>, settings: OcrSettings) -> Self {
        Self { ocr, settings }
    }

    /// Extractor backed by the system `pdftoppm` and `tesseract` binaries.
    pub fn with_tesseract(settings: OcrSettings) -> Self {
        let engine = TesseractOcr::new(settings.dpi).with_language(settings.language.as_str());
        Self::new(Box::new(engine), settings)
    }

    pub async fn extract(
        &self,
        filename: &str,
        bytes: &[u8],
        progress: ProgressFn<'_>,
    ) -> Result<String, ExtractError> {
        if !looks_like_pdf(filename, bytes) {
            let text = String::from_utf8_lossy(bytes).into_owned();
            if text.trim().is_empty() {
                return Err(ExtractError::Empty);
            }
            return Ok(text);
        }

        let text = match pdf_text_layer(bytes.to_vec()).await {
            Ok(text) => text,
            Err(e) => {
                warn!(filename, error = %e, "text layer unreadable, trying OCR");
                String::new()
            }
        };

        let usable = text.trim().chars().count();
        if usable >= self.settings.min_text_chars {
            debug!(filename, chars = usable, "using PDF text layer");
            return Ok(text);
        }

        let ocr_text = self.ocr_document(filename, bytes, progress).await?;
        if ocr_text.trim().is_empty() {
            return Err(ExtractError::Empty);
        }
        Ok(ocr_text)
    }

    async fn ocr_document(
        &self,
        filename: &str,
        bytes: &[u8],
        progress: ProgressFn<'_>,
    ) -> Result<String, ExtractError> {
        let dir = tempfile::tempdir().map_err(|e| ExtractError::Ocr(e.to_string()))?;
        let path: PathBuf = dir.path().join("document.pdf");
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ExtractError::Ocr(e.to_string()))?;

        let pages = self.ocr.page_count(&path).await?;
        info!(filename, pages, "scanned PDF, running OCR");
        progress(ExtractProgress::OcrStarted { pages });

        let mut text = String::new();
        for page in 1..=pages {
            progress(ExtractProgress::OcrPage { page, total: pages });
            let page_text = self.ocr.ocr_page(&path, page).await?;
            text.push_str(&page_text);
            text.push('\n');
        }
        Ok(text)
    }
}
