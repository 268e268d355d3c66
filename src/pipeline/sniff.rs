//! Format detection from magic bytes, structure and declared hints.
//!
//! Declared hints (filename extension, MIME type) are advisory. Magic bytes
//! and archive structure always win: a `.docx` file that is not a ZIP
//! archive containing `word/document.xml` is not trusted, and a `.txt` file
//! that starts with `%PDF-` is a PDF.
//!
//! Among text formats the hint decides, since HTML, Markdown and plain text
//! are all valid UTF-8 and only heuristics separate them otherwise.

use crate::pipeline::input::RawInput;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use tracing::debug;

/// Discrete source format of a [`RawInput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    Pdf,
    Docx,
    Html,
    Markdown,
    PlainText,
    /// No extractor matches. Terminal for this input.
    Unknown,
}

impl FormatTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatTag::Pdf => "pdf",
            FormatTag::Docx => "docx",
            FormatTag::Html => "html",
            FormatTag::Markdown => "markdown",
            FormatTag::PlainText => "plaintext",
            FormatTag::Unknown => "unknown",
        }
    }

    /// Parse a user-supplied name such as `"md"` or `"html"`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pdf" => Some(FormatTag::Pdf),
            "docx" => Some(FormatTag::Docx),
            "html" | "htm" => Some(FormatTag::Html),
            "markdown" | "md" => Some(FormatTag::Markdown),
            "plaintext" | "text" | "txt" => Some(FormatTag::PlainText),
            _ => None,
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const PDF_MAGIC: &[u8] = b"%PDF-";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
/// PDF readers accept the header anywhere in the first kilobyte of a binary
/// file.
const PDF_HEADER_WINDOW: usize = 1024;
/// How much of a text file structural sniffing looks at.
const TEXT_SNIFF_WINDOW: usize = 8 * 1024;

/// Classify `input`. Never fails; returns [`FormatTag::Unknown`] instead.
pub fn sniff(input: &RawInput) -> FormatTag {
    let bytes = input.bytes();
    let hint = hint_of(input);

    let text = as_text(bytes);
    let tag = if is_pdf(bytes, text.is_some()) {
        FormatTag::Pdf
    } else if bytes.starts_with(ZIP_MAGIC) {
        if is_docx_archive(bytes) {
            FormatTag::Docx
        } else {
            FormatTag::Unknown
        }
    } else {
        match text {
            Some(text) => match hint {
                Some(h @ (FormatTag::Html | FormatTag::Markdown | FormatTag::PlainText)) => h,
                _ => sniff_text(text),
            },
            None => FormatTag::Unknown,
        }
    };

    if let Some(h) = hint {
        if h != tag {
            debug!(
                "Format hint {} for '{}' contradicted by content; using {}",
                h,
                input.display_name(),
                tag
            );
        }
    }
    tag
}

/// `%PDF-` at offset 0, or within the header window when the bytes are not
/// text. Prose that merely mentions the header stays text.
fn is_pdf(bytes: &[u8], decodes_as_text: bool) -> bool {
    if bytes.starts_with(PDF_MAGIC) {
        return true;
    }
    if decodes_as_text {
        return false;
    }
    let window = &bytes[..bytes.len().min(PDF_HEADER_WINDOW)];
    window.windows(PDF_MAGIC.len()).any(|w| w == PDF_MAGIC)
}

fn is_docx_archive(bytes: &[u8]) -> bool {
    match zip::ZipArchive::new(Cursor::new(bytes)) {
        Ok(archive) => archive.file_names().any(|n| n == "word/document.xml"),
        Err(_) => false,
    }
}

/// Decode as UTF-8 text, rejecting binary content.
fn as_text(bytes: &[u8]) -> Option<&str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if bytes.contains(&0) {
        return None;
    }
    std::str::from_utf8(bytes).ok()
}

/// Declared format from MIME type first, then filename extension.
fn hint_of(input: &RawInput) -> Option<FormatTag> {
    if let Some(mime) = input.mime() {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        let from_mime = match essence.as_str() {
            "application/pdf" => Some(FormatTag::Pdf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(FormatTag::Docx)
            }
            "text/html" | "application/xhtml+xml" => Some(FormatTag::Html),
            "text/markdown" | "text/x-markdown" => Some(FormatTag::Markdown),
            "text/plain" => Some(FormatTag::PlainText),
            _ => None,
        };
        if from_mime.is_some() {
            return from_mime;
        }
    }
    let name = input.filename()?;
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(FormatTag::Pdf),
        "docx" => Some(FormatTag::Docx),
        "html" | "htm" | "xhtml" => Some(FormatTag::Html),
        "md" | "markdown" | "mdown" | "mkd" => Some(FormatTag::Markdown),
        "txt" | "text" => Some(FormatTag::PlainText),
        _ => None,
    }
}

static RE_HTML_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(<!doctype\s+html|<html[\s>]|<head[\s>]|<body[\s>])").unwrap()
});

static RE_HTML_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<(p|div|h[1-6]|table|ul|ol|article|section|span|a\s+href)[\s>]").unwrap()
});

static RE_MD_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(#{1,6}\s+\S|```|~~~|[-*+]\s+\S|\d+\.\s+\S|>\s|\|.*\|\s*$)|\[[^\]]+\]\([^)]+\)")
        .unwrap()
});

fn sniff_text(text: &str) -> FormatTag {
    let mut end = text.len().min(TEXT_SNIFF_WINDOW);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let head = &text[..end];
    if RE_HTML_START.is_match(head) || RE_HTML_TAG.find_iter(head).count() >= 2 {
        FormatTag::Html
    } else if RE_MD_MARKER.is_match(head) {
        FormatTag::Markdown
    } else {
        FormatTag::PlainText
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn input(bytes: &[u8], name: Option<&str>) -> RawInput {
        RawInput::new(bytes.to_vec(), name.map(String::from), None)
    }

    fn minimal_docx() -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let opts = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", opts).unwrap();
            zip.write_all(b"<w:document/>").unwrap();
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn pdf_magic_wins_over_hint() {
        assert_eq!(sniff(&input(b"%PDF-1.7\n...", Some("notes.txt"))), FormatTag::Pdf);
    }

    #[test]
    fn pdf_header_after_binary_prefix() {
        let mut bytes = vec![0u8, 0xff, 0xfe, 0x01];
        bytes.extend_from_slice(b"%PDF-1.4\n%\xe2\xe3\xcf\xd3");
        assert_eq!(sniff(&input(&bytes, None)), FormatTag::Pdf);
    }

    #[test]
    fn text_mentioning_the_pdf_header_stays_text() {
        let note = b"# PDF internals\n\nEvery file starts with `%PDF-1.7` and a binary comment.\n";
        assert_eq!(sniff(&input(note, Some("notes.md"))), FormatTag::Markdown);
        assert_eq!(sniff(&input(b"hello %PDF- world", Some("a.txt"))), FormatTag::PlainText);
        let mut padded = vec![b' '; 100];
        padded.extend_from_slice(b"%PDF-1.4 is just a string here");
        assert_eq!(sniff(&input(&padded, None)), FormatTag::PlainText);
    }

    #[test]
    fn docx_requires_real_archive() {
        assert_eq!(
            sniff(&input(&minimal_docx(), Some("report.docx"))),
            FormatTag::Docx
        );
        // Named .docx but plain bytes: the name is not trusted.
        assert_eq!(
            sniff(&input(b"just some words", Some("report.docx"))),
            FormatTag::PlainText
        );
        // A ZIP without the Word main part.
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            zip.start_file("data.csv", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"a,b").unwrap();
            zip.finish().unwrap();
        }
        assert_eq!(
            sniff(&input(&buf.into_inner(), Some("fake.docx"))),
            FormatTag::Unknown
        );
    }

    #[test]
    fn truncated_zip_is_unknown() {
        assert_eq!(
            sniff(&input(b"PK\x03\x04garbage", Some("x.docx"))),
            FormatTag::Unknown
        );
    }

    #[test]
    fn binary_is_unknown() {
        assert_eq!(
            sniff(&input(&[0x89, b'P', b'N', b'G', 0, 0, 1], Some("a.png"))),
            FormatTag::Unknown
        );
    }

    #[test]
    fn text_hints_pick_among_text_formats() {
        assert_eq!(sniff(&input(b"# Title", Some("a.txt"))), FormatTag::PlainText);
        assert_eq!(sniff(&input(b"plain words", Some("a.md"))), FormatTag::Markdown);
        assert_eq!(sniff(&input(b"<p>x</p>", Some("a.htm"))), FormatTag::Html);
    }

    #[test]
    fn mime_hint_beats_extension() {
        let i = RawInput::new(
            b"hello".to_vec(),
            Some("a.txt".into()),
            Some("text/markdown; charset=utf-8".into()),
        );
        assert_eq!(sniff(&i), FormatTag::Markdown);
    }

    #[test]
    fn structural_sniffing_without_hint() {
        assert_eq!(
            sniff(&input(b"<!DOCTYPE html><html><body>x</body></html>", None)),
            FormatTag::Html
        );
        assert_eq!(
            sniff(&input(b"<h2>Intro</h2><p>Hello <b>World</b></p>", None)),
            FormatTag::Html
        );
        assert_eq!(
            sniff(&input(b"Intro\n\n## Section\n\n- item", None)),
            FormatTag::Markdown
        );
        assert_eq!(
            sniff(&input(b"Just a sentence.\nAnother one.", None)),
            FormatTag::PlainText
        );
    }

    #[test]
    fn bom_is_tolerated() {
        assert_eq!(
            sniff(&input(b"\xEF\xBB\xBFplain", None)),
            FormatTag::PlainText
        );
    }

    #[test]
    fn format_names_round_trip() {
        for tag in [
            FormatTag::Pdf,
            FormatTag::Docx,
            FormatTag::Html,
            FormatTag::Markdown,
            FormatTag::PlainText,
        ] {
            assert_eq!(FormatTag::from_name(tag.as_str()), Some(tag));
        }
        assert_eq!(FormatTag::from_name("md"), Some(FormatTag::Markdown));
        assert_eq!(FormatTag::from_name("exe"), None);
    }
}
