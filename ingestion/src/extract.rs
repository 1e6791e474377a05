use std::io::Cursor;
use std::path::Path;

use kb_core::error::{ErrorCode, KbError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Markdown,
    Json,
    Pdf,
    Csv,
    Xlsx,
    Docx,
    Unsupported,
}

pub fn detect_content_kind(mime_type: &str, filename: Option<&str>) -> ContentKind {
    let mime = mime_type.split(';').next().unwrap_or("").trim().to_lowercase();
    match mime.as_str() {
        "text/plain" => ContentKind::Text,
        "text/markdown" => ContentKind::Markdown,
        "application/json" => ContentKind::Json,
        "application/pdf" => ContentKind::Pdf,
        "text/csv" => ContentKind::Csv,
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => ContentKind::Xlsx,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ContentKind::Docx,
        _ => detect_from_extension(filename),
    }
}

fn detect_from_extension(filename: Option<&str>) -> ContentKind {
    let Some(name) = filename else {
        return ContentKind::Unsupported;
    };
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "txt" => ContentKind::Text,
        "md" | "markdown" => ContentKind::Markdown,
        "json" => ContentKind::Json,
        "pdf" => ContentKind::Pdf,
        "csv" => ContentKind::Csv,
        "xlsx" => ContentKind::Xlsx,
        "docx" => ContentKind::Docx,
        _ => ContentKind::Unsupported,
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("content is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("csv parsing failed: {0}")]
    Csv(String),
    #[error("xlsx parsing failed: {0}")]
    Xlsx(String),
    #[error("docx parsing failed: {0}")]
    Docx(String),
    #[error("unsupported content kind")]
    Unsupported,
}

impl KbError for ExtractError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::ConversionFailed
    }
}

pub fn extract_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// CSV → GitHub-flavored Markdown pipe table. The first row is treated as
/// the header; cell values containing `|` are escaped so the table doesn't
/// break (spec §6 tabular-conversion rules).
pub fn extract_csv_to_markdown(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(Cursor::new(bytes));

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| ExtractError::Csv(err.to_string()))?;
        rows.push(record.iter().map(escape_cell).collect::<Vec<_>>());
    }

    Ok(render_markdown_table(rows))
}

/// XLSX → Markdown, one table per worksheet, separated by a level-2
/// heading naming the sheet.
pub fn extract_xlsx_to_markdown(bytes: &[u8]) -> Result<String, ExtractError> {
    use calamine::{open_workbook_from_rs, Reader, Xlsx};

    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook: Xlsx<_> =
        open_workbook_from_rs(cursor).map_err(|err| ExtractError::Xlsx(err.to_string()))?;

    let mut markdown = String::new();
    let sheet_names = workbook.sheet_names().to_owned();
    for (index, sheet_name) in sheet_names.iter().enumerate() {
        let Ok(range) = workbook.worksheet_range(sheet_name) else {
            continue;
        };

        if index > 0 {
            markdown.push_str("\n\n");
        }
        markdown.push_str(&format!("## {sheet_name}\n\n"));

        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(|cell| escape_cell(&cell.to_string())).collect())
            .collect();
        markdown.push_str(&render_markdown_table(rows));
    }

    Ok(markdown)
}

/// DOCX → Markdown: paragraph text is extracted in document order and
/// joined with blank lines, approximating prose structure (no distinct
/// heading/style mapping; spec §6 does not require preserving DOCX styles).
pub fn extract_docx_to_markdown(bytes: &[u8]) -> Result<String, ExtractError> {
    let docx = docx_rs::read_docx(bytes).map_err(|err| ExtractError::Docx(err.to_string()))?;

    let mut paragraphs = Vec::new();
    for child in &docx.document.children {
        if let docx_rs::DocumentChild::Paragraph(paragraph) = child {
            let mut text = String::new();
            for paragraph_child in &paragraph.children {
                if let docx_rs::ParagraphChild::Run(run) = paragraph_child {
                    for run_child in &run.children {
                        if let docx_rs::RunChild::Text(t) = run_child {
                            text.push_str(&t.text);
                        }
                    }
                }
            }
            if !text.trim().is_empty() {
                paragraphs.push(text);
            }
        }
    }

    Ok(paragraphs.join("\n\n"))
}

fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', "<br/>")
}

fn render_markdown_table(rows: Vec<Vec<String>>) -> String {
    let Some(header) = rows.first() else {
        return String::new();
    };

    let mut out = String::new();
    out.push_str("| ");
    out.push_str(&header.join(" | "));
    out.push_str(" |\n|");
    out.push_str(&"---|".repeat(header.len()));
    out.push('\n');

    for row in rows.iter().skip(1) {
        out.push_str("| ");
        out.push_str(&row.join(" | "));
        out.push_str(" |\n");
    }

    out
}
