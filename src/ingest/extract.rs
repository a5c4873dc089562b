use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Reader;
use std::io::{Cursor, Read};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Word,
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("could not read PDF: {0}")]
    Pdf(String),
    #[error("could not read Word document: {0}")]
    Word(String),
}

impl DocumentFormat {
    /// Format from the extension of a storage key or file name.
    pub fn from_path(path: &str) -> Result<Self, ExtractError> {
        let file = path.rsplit('/').next().unwrap_or(path);
        let ext = file
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(DocumentFormat::Pdf),
            "docx" => Ok(DocumentFormat::Word),
            "" => Err(ExtractError::Unsupported("(no extension)".into())),
            other => Err(ExtractError::Unsupported(format!(".{}", other))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Word => "docx",
        }
    }
}

/// Plain text of a document. CPU-bound; run it off the async executor.
pub fn extract_text(format: DocumentFormat, bytes: &[u8]) -> Result<String, ExtractError> {
    match format {
        DocumentFormat::Pdf => {
            let pages = pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
            Ok(pages.join("\n"))
        }
        DocumentFormat::Word => docx_text(bytes),
    }
}

/// Upper bound on the decompressed size of `word/document.xml`.
const MAX_DOCUMENT_XML: u64 = 64 * 1024 * 1024;

fn docx_text(bytes: &[u8]) -> Result<String, ExtractError> {
    docx_text_within(bytes, MAX_DOCUMENT_XML)
}

fn docx_text_within(bytes: &[u8], limit: u64) -> Result<String, ExtractError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Word(e.to_string()))?;
    let mut xml = String::new();
    zip.by_name("word/document.xml")
        .map_err(|_| ExtractError::Word("word/document.xml not found".into()))?
        .take(limit + 1)
        .read_to_string(&mut xml)
        .map_err(|e| ExtractError::Word(e.to_string()))?;
    if xml.len() as u64 > limit {
        return Err(ExtractError::Word(format!(
            "word/document.xml expands beyond {} bytes",
            limit
        )));
    }
    document_xml_text(&xml)
}

/// Walks `word/document.xml`: text runs, tabs and breaks, one line per paragraph.
fn document_xml_text(xml: &str) -> Result<String, ExtractError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);

    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;
    // tab stops inside paragraph properties are layout, not content
    let mut in_props = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match local_name(&e).as_str() {
                "t" => in_text = true,
                "pPr" | "rPr" => in_props += 1,
                _ => {}
            },
            Ok(Event::Empty(e)) => match local_name(&e).as_str() {
                "tab" if in_props == 0 => out.push('\t'),
                "br" | "cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| ExtractError::Word(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match end_name(&e).as_str() {
                "t" => in_text = false,
                "pPr" | "rPr" => in_props = in_props.saturating_sub(1),
                "p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Word(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

// ------------- helpers -------------

fn local_name(tag: &BytesStart<'_>) -> String {
    let full = String::from_utf8_lossy(tag.name().as_ref()).to_string();
    full.rsplit(':').next().unwrap_or(&full).to_string()
}

fn end_name(tag: &BytesEnd<'_>) -> String {
    let full = String::from_utf8_lossy(tag.name().as_ref()).to_string();
    full.rsplit(':').next().unwrap_or(&full).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{docx_bytes, pdf_bytes};

    #[test]
    fn format_comes_from_extension() {
        assert_eq!(DocumentFormat::from_path("modules/c/m-1.PDF").unwrap(), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_path("notes.docx").unwrap(), DocumentFormat::Word);
        assert!(matches!(
            DocumentFormat::from_path("notes.txt"),
            Err(ExtractError::Unsupported(ext)) if ext == ".txt"
        ));
        assert!(DocumentFormat::from_path("modules.v2/README").is_err());
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let bytes = docx_bytes(&["Photosynthesis converts light.", "Chlorophyll &amp; water."]);
        let text = extract_text(DocumentFormat::Word, &bytes).unwrap();
        assert_eq!(text, "Photosynthesis converts light.\nChlorophyll & water.\n");
    }

    #[test]
    fn tabs_and_breaks_are_kept_but_tab_stops_are_not() {
        let xml = r#"<w:document xmlns:w="x"><w:body><w:p><w:pPr><w:tabs><w:tab w:val="left" w:pos="720"/></w:tabs></w:pPr><w:r><w:t>a</w:t><w:tab/><w:t>b</w:t><w:br/><w:t>c</w:t></w:r></w:p></w:body></w:document>"#;
        assert_eq!(document_xml_text(xml).unwrap(), "a\tb\nc\n");
    }

    #[test]
    fn non_zip_bytes_are_not_a_word_document() {
        assert!(matches!(
            extract_text(DocumentFormat::Word, b"plain text"),
            Err(ExtractError::Word(_))
        ));
    }

    #[test]
    fn oversized_document_xml_is_rejected() {
        let bytes = docx_bytes(&[&"x".repeat(4096)]);
        assert!(matches!(docx_text_within(&bytes, 1024), Err(ExtractError::Word(msg)) if msg.contains("expands beyond")));
        assert!(docx_text_within(&bytes, 64 * 1024).is_ok());
    }

    #[test]
    fn pdf_text_is_extracted() {
        let bytes = pdf_bytes(&["Photosynthesis converts light", "Chlorophyll absorbs red light"]);
        let text = extract_text(DocumentFormat::Pdf, &bytes).unwrap();
        assert!(text.contains("Photosynthesis"), "{:?}", text);
        assert!(text.contains("Chlorophyll"), "{:?}", text);
    }

    #[test]
    fn garbage_is_not_a_pdf() {
        assert!(extract_text(DocumentFormat::Pdf, b"%PDF-1.4 this is not really a pdf").is_err());
    }
}
