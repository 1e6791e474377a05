use crate::errors::ProviderError;

/// Enum-dispatched PDF→Markdown converter (spec §4.1). The conversion
/// worker (C5) is responsible for the layout-aware→plain-text cascade; this
/// type only exposes the two variants' individual behavior.
#[derive(Debug, Clone, Copy)]
pub enum PdfToMarkdown {
    /// Preserves page-break structure as Markdown horizontal rules so
    /// downstream chunking keeps page boundaries visible. No distinct
    /// layout-aware PDF crate exists in this workspace's dependency set, so
    /// this wraps the same extractor as `PlainTextExtractor` with
    /// page-aware post-processing — a documented, pragmatic stand-in (see
    /// DESIGN.md).
    LayoutAwareEngine,
    PlainTextExtractor,
}

impl PdfToMarkdown {
    pub fn convert(&self, pdf_bytes: &[u8]) -> Result<String, ProviderError> {
        match self {
            PdfToMarkdown::LayoutAwareEngine => convert_layout_aware(pdf_bytes),
            PdfToMarkdown::PlainTextExtractor => extract_plain_text(pdf_bytes),
        }
    }
}

fn extract_plain_text(pdf_bytes: &[u8]) -> Result<String, ProviderError> {
    pdf_extract::extract_text_from_mem(pdf_bytes)
        .map_err(|err| ProviderError::BadResponse(format!("pdf extraction failed: {err}")))
}

fn convert_layout_aware(pdf_bytes: &[u8]) -> Result<String, ProviderError> {
    let pages = pdf_extract::extract_text_by_pages(pdf_bytes)
        .map_err(|err| ProviderError::BadResponse(format!("pdf extraction failed: {err}")))?;

    let mut markdown = String::new();
    for (index, page) in pages.iter().enumerate() {
        if index > 0 {
            markdown.push_str("\n\n---\n\n");
        }
        markdown.push_str(page.trim());
    }
    Ok(markdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_extractor_rejects_garbage_bytes() {
        let result = PdfToMarkdown::PlainTextExtractor.convert(b"not a pdf");
        assert!(result.is_err());
    }

    #[test]
    fn layout_aware_rejects_garbage_bytes() {
        let result = PdfToMarkdown::LayoutAwareEngine.convert(b"not a pdf");
        assert!(result.is_err());
    }
}
