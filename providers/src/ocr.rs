use crate::errors::ProviderError;
use std::io::Write;

/// Enum-dispatched OCR provider (spec §4.1). Invoked only when the prior
/// PDF converter's output falls below `min_text_chars`.
#[derive(Debug, Clone)]
pub enum Ocr {
    Disabled,
    Tesseract { languages: Vec<String> },
}

impl Ocr {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Ocr::Disabled)
    }

    /// Extracts text from a rasterized page image. Callers are expected to
    /// rasterize PDF pages upstream (the out-of-scope OCR engine contract,
    /// spec §6, takes `(pdf_bytes, languages[])`; this crate's `Tesseract`
    /// variant operates on the already-rasterized bytes it is handed, via a
    /// temp file and the `tesseract` CLI).
    pub fn extract(&self, image_bytes: &[u8]) -> Result<String, ProviderError> {
        match self {
            Ocr::Disabled => Ok(String::new()),
            Ocr::Tesseract { languages } => extract_via_tesseract(image_bytes, languages),
        }
    }
}

fn extract_via_tesseract(image_bytes: &[u8], languages: &[String]) -> Result<String, ProviderError> {
    let mut temp_file = tempfile::Builder::new()
        .suffix(".png")
        .tempfile()
        .map_err(|err| ProviderError::Internal(format!("ocr temp file: {err}")))?;
    temp_file
        .write_all(image_bytes)
        .map_err(|err| ProviderError::Internal(format!("ocr temp file write: {err}")))?;

    let image = rusty_tesseract::Image::from_path(temp_file.path())
        .map_err(|err| ProviderError::BadResponse(format!("ocr could not read image: {err}")))?;

    let lang = if languages.is_empty() {
        "eng".to_string()
    } else {
        languages.join("+")
    };

    let args = rusty_tesseract::Args {
        lang,
        ..rusty_tesseract::Args::default()
    };

    rusty_tesseract::image_to_string(&image, &args)
        .map_err(|err| ProviderError::BadResponse(format!("ocr failed: {err}")))
}
