use crate::error::EngineError;
use lopdf::Document as PdfDocument;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::fs;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    PlainText,
    Markdown,
    Docx,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Result<Self, EngineError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Ok(Self::Pdf),
            "txt" => Ok(Self::PlainText),
            "md" | "markdown" => Ok(Self::Markdown),
            "docx" => Ok(Self::Docx),
            _ => Err(EngineError::UnsupportedFileType(format!(
                "{} (supported: pdf, txt, md, docx)",
                path.display()
            ))),
        }
    }
}

pub fn extract_text(path: &Path) -> Result<(DocumentKind, String), EngineError> {
    let kind = DocumentKind::from_path(path)?;

    let text = match kind {
        DocumentKind::Pdf => extract_pdf(path)?,
        DocumentKind::PlainText | DocumentKind::Markdown => fs::read_to_string(path)?,
        DocumentKind::Docx => extract_docx(path)?,
    };

    if text.trim().is_empty() {
        return Err(EngineError::Extraction(format!(
            "no readable text in {}",
            path.display()
        )));
    }

    Ok((kind, text))
}

fn extract_pdf(path: &Path) -> Result<String, EngineError> {
    let document =
        PdfDocument::load(path).map_err(|error| EngineError::Extraction(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| EngineError::Extraction(error.to_string()))?;
        if !text.trim().is_empty() {
            pages.push(text);
        }
    }

    Ok(pages.join("\n\n"))
}

fn extract_docx(path: &Path) -> Result<String, EngineError> {
    let file = fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|error| EngineError::Extraction(format!("not a docx container: {error}")))?;

    let mut document_xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|error| EngineError::Extraction(format!("missing word/document.xml: {error}")))?
        .read_to_string(&mut document_xml)?;

    let mut reader = Reader::from_str(&document_xml);
    let mut text = String::new();
    loop {
        match reader.read_event() {
            Err(error) => {
                return Err(EngineError::Extraction(format!(
                    "malformed docx xml at {}: {error}",
                    reader.buffer_position()
                )))
            }
            Ok(Event::Eof) => break,
            Ok(Event::Text(fragment)) => {
                let piece = fragment
                    .unescape()
                    .map_err(|error| EngineError::Extraction(error.to_string()))?;
                text.push_str(&piece);
            }
            Ok(Event::End(element)) if element.name().as_ref() == b"w:p" => text.push('\n'),
            Ok(_) => {}
        }
    }

    Ok(text)
}
