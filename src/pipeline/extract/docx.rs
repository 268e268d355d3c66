//! DOCX extraction: OOXML parts read from the ZIP container with `zip`,
//! streamed through `quick-xml`.
//!
//! Recovered structure: heading paragraph styles (`Title`, `Heading1..9`),
//! numbered/bulleted paragraphs (as a flat bullet list), run-level bold and
//! italic, hyperlinks resolved through the part relationships, tables and
//! line breaks. The document title comes from `docProps/core.xml`.

use super::{ExtractError, Extracted};
use crate::pipeline::document::{plain_text, Block, BlockKind, Inline, ListItem};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{Cursor, Read};

/// Upper bound on any single XML part read out of the archive.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const MAIN_PART: &str = "word/document.xml";
const RELS_PART: &str = "word/_rels/document.xml.rels";
const CORE_PART: &str = "docProps/core.xml";

/// OLE compound file header: encrypted OOXML is wrapped in one.
const CFB_MAGIC: &[u8] = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1";

pub(crate) fn extract(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    if bytes.starts_with(CFB_MAGIC) {
        return Err(if contains_utf16(bytes, "EncryptionInfo") {
            ExtractError::PasswordProtected
        } else {
            ExtractError::Archive("OLE compound file (legacy .doc), not OOXML".into())
        });
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractError::Archive(e.to_string()))?;

    let main = read_part(&mut archive, MAIN_PART)?
        .ok_or_else(|| ExtractError::Archive(format!("{MAIN_PART} not found")))?;
    let rels = match read_part(&mut archive, RELS_PART)? {
        Some(xml) => hyperlink_targets(&xml)?,
        None => HashMap::new(),
    };
    let title = match read_part(&mut archive, CORE_PART)? {
        Some(xml) => core_title(&xml)?,
        None => None,
    };

    let mut walker = Walker::new(rels);
    walker.run(&main)?;
    Ok(Extracted {
        title,
        blocks: walker.finish(),
    })
}

fn read_part(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<Vec<u8>>, ExtractError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(ExtractError::Archive(e.to_string())),
    };
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Archive(format!("{name}: {e}")))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::TooLarge {
            part: name.to_string(),
            limit: MAX_XML_ENTRY_BYTES,
        });
    }
    Ok(Some(out))
}

fn contains_utf16(haystack: &[u8], needle: &str) -> bool {
    let pattern: Vec<u8> = needle.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    haystack.windows(pattern.len()).any(|w| w == pattern.as_slice())
}

fn xml_err(part: &str, e: impl std::fmt::Display) -> ExtractError {
    ExtractError::Xml {
        part: part.to_string(),
        detail: e.to_string(),
    }
}

fn attr(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// `Id → Target` for hyperlink relationships.
fn hyperlink_targets(xml: &[u8]) -> Result<HashMap<String, String>, ExtractError> {
    let mut map = HashMap::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Relationship" {
                    let is_link = attr(&e, b"Type").is_some_and(|t| t.ends_with("/hyperlink"));
                    if let (true, Some(id), Some(target)) =
                        (is_link, attr(&e, b"Id"), attr(&e, b"Target"))
                    {
                        map.insert(id, target);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err(RELS_PART, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(map)
}

/// Text of `dc:title` in the core properties part.
fn core_title(xml: &[u8]) -> Result<Option<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_title = false;
    let mut title = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"title" => in_title = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"title" => in_title = false,
            Ok(Event::Text(t)) if in_title => {
                title.push_str(&t.unescape().map_err(|e| xml_err(CORE_PART, e))?)
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err(CORE_PART, e)),
            _ => {}
        }
        buf.clear();
    }
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    Ok((!title.is_empty()).then_some(title))
}

/// Heading level for a paragraph style id, if it is a heading style.
fn heading_level(style: &str) -> Option<u8> {
    let s: String = style
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    if s == "title" {
        return Some(1);
    }
    let n: u8 = s.strip_prefix("heading")?.parse().ok()?;
    (n >= 1).then_some(n.min(6))
}

fn on_off(e: &BytesStart<'_>) -> bool {
    !matches!(
        attr(e, b"val").as_deref(),
        Some("0") | Some("false") | Some("off") | Some("none")
    )
}

#[derive(Default)]
struct TableState {
    rows: Vec<Vec<Vec<Inline>>>,
    row: Vec<Vec<Inline>>,
    cell: Vec<Inline>,
}

/// Streaming state over `word/document.xml`.
struct Walker {
    rels: HashMap<String, String>,
    blocks: Vec<Block>,
    list: Vec<ListItem>,
    tables: Vec<TableState>,

    in_paragraph: bool,
    style: Option<String>,
    numbered: bool,
    inlines: Vec<Inline>,

    in_run: bool,
    bold: bool,
    italic: bool,
    in_text: bool,
    link: Option<(Option<String>, Vec<Inline>)>,
}

impl Walker {
    fn new(rels: HashMap<String, String>) -> Self {
        Self {
            rels,
            blocks: Vec::new(),
            list: Vec::new(),
            tables: Vec::new(),
            in_paragraph: false,
            style: None,
            numbered: false,
            inlines: Vec::new(),
            in_run: false,
            bold: false,
            italic: false,
            in_text: false,
            link: None,
        }
    }

    fn run(&mut self, xml: &[u8]) -> Result<(), ExtractError> {
        let mut reader = Reader::from_reader(xml);
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => self.start(&e, false),
                Ok(Event::Empty(e)) => self.start(&e, true),
                Ok(Event::End(e)) => self.end(e.local_name().as_ref()),
                Ok(Event::Text(t)) if self.in_text => {
                    let text = t.unescape().map_err(|e| xml_err(MAIN_PART, e))?;
                    self.push_text(&text);
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(xml_err(MAIN_PART, e)),
                _ => {}
            }
            buf.clear();
        }
        Ok(())
    }

    fn start(&mut self, e: &BytesStart<'_>, empty: bool) {
        match e.local_name().as_ref() {
            b"p" => {
                self.in_paragraph = true;
                self.style = None;
                self.numbered = false;
                self.inlines.clear();
                if empty {
                    self.end(b"p");
                }
            }
            b"pStyle" => self.style = attr(e, b"val"),
            b"numPr" => self.numbered = true,
            b"r" => {
                self.in_run = !empty;
                self.bold = false;
                self.italic = false;
            }
            b"b" if self.in_run => self.bold = on_off(e),
            b"i" if self.in_run => self.italic = on_off(e),
            b"t" => self.in_text = !empty,
            b"tab" if self.in_run => self.push_text(" "),
            b"br" | b"cr" if self.in_run => self.push_inline(Inline::LineBreak),
            b"hyperlink" => {
                let url = attr(e, b"id")
                    .and_then(|id| self.rels.get(&id).cloned())
                    .or_else(|| attr(e, b"anchor").map(|a| format!("#{a}")));
                self.link = Some((url, Vec::new()));
                if empty {
                    self.end(b"hyperlink");
                }
            }
            b"tbl" => {
                self.flush_list();
                self.tables.push(TableState::default());
            }
            b"tr" => {
                if let Some(t) = self.tables.last_mut() {
                    t.row.clear();
                }
            }
            b"tc" => {
                if let Some(t) = self.tables.last_mut() {
                    t.cell.clear();
                }
            }
            _ => {}
        }
    }

    fn end(&mut self, name: &[u8]) {
        match name {
            b"t" => self.in_text = false,
            b"r" => self.in_run = false,
            b"hyperlink" => {
                if let Some((url, content)) = self.link.take() {
                    match url {
                        Some(url) => self.inlines.push(Inline::Link { content, url }),
                        None => self.inlines.extend(content),
                    }
                }
            }
            b"p" => self.end_paragraph(),
            b"tc" => {
                if let Some(t) = self.tables.last_mut() {
                    let cell = std::mem::take(&mut t.cell);
                    t.row.push(cell);
                }
            }
            b"tr" => {
                if let Some(t) = self.tables.last_mut() {
                    let row = std::mem::take(&mut t.row);
                    if !row.is_empty() {
                        t.rows.push(row);
                    }
                }
            }
            b"tbl" => {
                if let Some(done) = self.tables.pop() {
                    match self.tables.last_mut() {
                        // Nested table: flatten into the enclosing cell.
                        Some(outer) => {
                            for row in &done.rows {
                                for cell in row {
                                    append_to_cell(&mut outer.cell, vec![Inline::Text(plain_text(cell))]);
                                }
                            }
                        }
                        None if !done.rows.is_empty() => self
                            .blocks
                            .push(Block::new(BlockKind::Table { rows: done.rows })),
                        None => {}
                    }
                }
            }
            _ => {}
        }
    }

    fn push_text(&mut self, text: &str) {
        let mut inline = Inline::Text(text.to_string());
        if self.italic {
            inline = Inline::Italic(vec![inline]);
        }
        if self.bold {
            inline = Inline::Bold(vec![inline]);
        }
        self.push_inline(inline);
    }

    fn push_inline(&mut self, inline: Inline) {
        match &mut self.link {
            Some((_, content)) => content.push(inline),
            None => self.inlines.push(inline),
        }
    }

    fn end_paragraph(&mut self) {
        self.in_paragraph = false;
        let inlines = std::mem::take(&mut self.inlines);

        if let Some(t) = self.tables.last_mut() {
            append_to_cell(&mut t.cell, inlines);
            return;
        }
        if inlines.is_empty() {
            return;
        }
        if let Some(level) = self.style.as_deref().and_then(heading_level) {
            self.flush_list();
            self.blocks.push(Block::new(BlockKind::Heading {
                level,
                content: inlines,
            }));
        } else if self.numbered {
            self.list.push(ListItem {
                blocks: vec![Block::new(BlockKind::Paragraph(inlines))],
            });
        } else {
            self.flush_list();
            self.blocks.push(Block::new(BlockKind::Paragraph(inlines)));
        }
    }

    fn flush_list(&mut self) {
        if !self.list.is_empty() {
            let items = std::mem::take(&mut self.list);
            self.blocks.push(Block::new(BlockKind::List {
                ordered: false,
                items,
            }));
        }
    }

    fn finish(mut self) -> Vec<Block> {
        self.flush_list();
        self.blocks
    }
}

/// Multiple paragraphs in one cell are joined with a space.
fn append_to_cell(cell: &mut Vec<Inline>, inlines: Vec<Inline>) {
    if inlines.is_empty() {
        return;
    }
    if !cell.is_empty() {
        cell.push(Inline::Text(" ".into()));
    }
    cell.extend(inlines);
}
