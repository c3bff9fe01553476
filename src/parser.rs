//! Document text extraction.
//!
//! [`parse_document`] never fails: a missing file, an unsupported extension
//! or a broken document is logged and yields an empty string, which the
//! loader records as "0 chunks from this file".
//!
//! | Extension                     | Reader                                   |
//! |-------------------------------|------------------------------------------|
//! | `.pdf`                        | `pdf-extract`                            |
//! | `.pptx`                       | slide XML (`a:t` runs), in slide order   |
//! | `.docx`                       | `word/document.xml` (`w:t` runs)         |
//! | `.txt` `.md` `.csv` `.json`   | UTF-8 text                               |

use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Upper bound on the decompressed size of one ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Pptx,
    Docx,
    PlainText,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocumentKind::Pdf),
            "pptx" => Some(DocumentKind::Pptx),
            "docx" => Some(DocumentKind::Docx),
            "txt" | "md" | "csv" | "json" => Some(DocumentKind::PlainText),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("Office document extraction failed: {0}")]
    Ooxml(String),
    #[error("text file is not valid UTF-8")]
    Encoding,
}

/// Extract the text of the document at `path`, or `""` if that isn't
/// possible.
pub fn parse_document(path: &Path) -> String {
    if !path.exists() {
        warn!(path = %path.display(), "document not found");
        return String::new();
    }
    let Some(kind) = DocumentKind::from_path(path) else {
        warn!(path = %path.display(), "unsupported document type");
        return String::new();
    };
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read document");
            return String::new();
        }
    };

    match extract_text(&bytes, kind) {
        Ok(text) => {
            info!(path = %path.display(), chars = text.chars().count(), "extracted document text");
            text
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to extract document text");
            String::new()
        }
    }
}

/// Extract text from in-memory document bytes. Output is trimmed.
pub fn extract_text(bytes: &[u8], kind: DocumentKind) -> Result<String, ParseError> {
    let text = match kind {
        DocumentKind::Pdf => {
            pdf_extract::extract_text_from_mem(bytes).map_err(|e| ParseError::Pdf(e.to_string()))?
        }
        DocumentKind::Pptx => extract_pptx(bytes)?,
        DocumentKind::Docx => extract_docx(bytes)?,
        DocumentKind::PlainText => std::str::from_utf8(bytes)
            .map_err(|_| ParseError::Encoding)?
            .to_string(),
    };
    Ok(text.trim().to_string())
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ParseError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ParseError::Ooxml(e.to_string()))
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ParseError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ParseError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ParseError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ParseError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ParseError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    text_runs(&xml)
}

/// Slides in numeric order (`slide2` before `slide10`), separated by a
/// blank line.
fn extract_pptx(bytes: &[u8]) -> Result<String, ParseError> {
    let mut archive = open_archive(bytes)?;
    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = name
                .strip_prefix("ppt/slides/slide")?
                .strip_suffix(".xml")?
                .parse::<u32>()
                .ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    slides.sort();

    let mut pages = Vec::with_capacity(slides.len());
    for (_, name) in slides {
        let xml = read_entry(&mut archive, &name)?;
        let text = text_runs(&xml)?;
        if !text.is_empty() {
            pages.push(text);
        }
    }
    Ok(pages.join("\n\n"))
}

/// Concatenate every `<*:t>` text run. Each paragraph (`<*:p>`) ends with
/// a newline.
fn text_runs(xml: &[u8]) -> Result<String, ParseError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_run = true,
            Ok(Event::Text(t)) if in_run => {
                out.push_str(&t.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_run = false,
                b"p" if !out.is_empty() && !out.ends_with('\n') => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    fn slide(text: &str) -> String {
        format!(
            r#"<p:sld xmlns:p="p" xmlns:a="a"><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sld>"#,
            text
        )
    }

    #[test]
    fn kind_from_extension() {
        assert_eq!(
            DocumentKind::from_path(Path::new("notes.MD")),
            Some(DocumentKind::PlainText)
        );
        assert_eq!(
            DocumentKind::from_path(Path::new("deck.pptx")),
            Some(DocumentKind::Pptx)
        );
        assert_eq!(DocumentKind::from_path(Path::new("image.png")), None);
        assert_eq!(DocumentKind::from_path(Path::new("README")), None);
    }

    #[test]
    fn pptx_slides_in_numeric_order() {
        let s2 = slide("Second");
        let s10 = slide("Tenth");
        let s1 = slide("First &amp; foremost");
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", &s10),
            ("ppt/slides/slide2.xml", &s2),
            ("ppt/slides/slide1.xml", &s1),
            ("ppt/slides/_rels/slide1.xml.rels", "<x/>"),
        ]);
        let text = extract_text(&bytes, DocumentKind::Pptx).unwrap();
        assert_eq!(text, "First & foremost\n\nSecond\n\nTenth");
    }

    #[test]
    fn docx_paragraphs_on_separate_lines() {
        let doc = r#"<w:document xmlns:w="w"><w:body>
            <w:p><w:r><w:t>Cells are</w:t></w:r><w:r><w:t xml:space="preserve"> small.</w:t></w:r></w:p>
            <w:p><w:r><w:t>Mitochondria make ATP.</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let bytes = zip_with(&[("word/document.xml", doc)]);
        let text = extract_text(&bytes, DocumentKind::Docx).unwrap();
        assert_eq!(text, "Cells are small.\nMitochondria make ATP.");
    }

    #[test]
    fn broken_inputs_are_errors() {
        assert!(matches!(
            extract_text(b"not a pdf", DocumentKind::Pdf),
            Err(ParseError::Pdf(_))
        ));
        assert!(matches!(
            extract_text(b"not a zip", DocumentKind::Docx),
            Err(ParseError::Ooxml(_))
        ));
        assert!(matches!(
            extract_text(&[0xff, 0xfe, 0x00], DocumentKind::PlainText),
            Err(ParseError::Encoding)
        ));
    }

    #[test]
    fn parse_document_never_fails() {
        let dir = TempDir::new().unwrap();
        assert_eq!(parse_document(&dir.path().join("missing.txt")), "");

        let png = dir.path().join("figure.png");
        std::fs::write(&png, b"\x89PNG").unwrap();
        assert_eq!(parse_document(&png), "");

        let broken = dir.path().join("broken.pdf");
        std::fs::write(&broken, b"garbage").unwrap();
        assert_eq!(parse_document(&broken), "");

        let txt = dir.path().join("notes.txt");
        std::fs::write(&txt, "  Photosynthesis converts light.  \n").unwrap();
        assert_eq!(parse_document(&txt), "Photosynthesis converts light.");
    }
}
