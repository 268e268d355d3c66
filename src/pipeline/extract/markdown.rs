//! Markdown extraction from the `pulldown-cmark` event stream.
//!
//! Events are folded into the block tree with an explicit frame stack: every
//! `Start` pushes a frame, every `End` pops one and attaches the finished
//! node to its parent. Raw HTML is dropped. A YAML front-matter block is
//! consumed for its `title:` field only.

use super::text::decode;
use super::{ExtractError, Extracted};
use crate::pipeline::document::{Block, BlockKind, Inline, ListItem, Provenance};
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag};

pub(crate) fn extract(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let text = decode(bytes)?;
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_YAML_STYLE_METADATA_BLOCKS);

    let mut b = Builder::default();
    for (event, range) in Parser::new_ext(&text, options).into_offset_iter() {
        b.event(event, range.start);
    }
    Ok(b.finish())
}

/// One open container on the stack.
enum Frame {
    Paragraph(Vec<Inline>),
    Heading(u8, Vec<Inline>),
    Quote(Vec<Block>),
    List {
        ordered: bool,
        items: Vec<ListItem>,
    },
    /// Tight list items receive inline events directly, without a paragraph.
    Item {
        blocks: Vec<Block>,
        loose: Vec<Inline>,
    },
    Code {
        language: Option<String>,
        code: String,
    },
    Table(Vec<Vec<Vec<Inline>>>),
    Row(Vec<Vec<Inline>>),
    Cell(Vec<Inline>),
    Bold(Vec<Inline>),
    Italic(Vec<Inline>),
    /// Strikethrough has no canonical syntax; its content is kept as-is.
    Transparent(Vec<Inline>),
    Link(String, Vec<Inline>),
    Image(String, String),
    Metadata(String),
    /// Raw HTML blocks and anything else without a canonical rendering.
    Skip,
}

#[derive(Default)]
struct Builder {
    stack: Vec<(Frame, usize)>,
    blocks: Vec<Block>,
    title: Option<String>,
}

impl Builder {
    fn event(&mut self, event: Event<'_>, offset: usize) {
        match event {
            Event::Start(tag) => {
                let frame = match tag {
                    Tag::Paragraph => Frame::Paragraph(Vec::new()),
                    Tag::Heading { level, .. } => Frame::Heading(level as u8, Vec::new()),
                    Tag::BlockQuote(_) => Frame::Quote(Vec::new()),
                    Tag::List(start) => Frame::List {
                        ordered: start.is_some(),
                        items: Vec::new(),
                    },
                    Tag::Item => Frame::Item {
                        blocks: Vec::new(),
                        loose: Vec::new(),
                    },
                    Tag::CodeBlock(kind) => Frame::Code {
                        language: match kind {
                            CodeBlockKind::Fenced(info) => info
                                .split_whitespace()
                                .next()
                                .filter(|l| !l.is_empty())
                                .map(String::from),
                            CodeBlockKind::Indented => None,
                        },
                        code: String::new(),
                    },
                    Tag::Table(_) => Frame::Table(Vec::new()),
                    Tag::TableHead | Tag::TableRow => Frame::Row(Vec::new()),
                    Tag::TableCell => Frame::Cell(Vec::new()),
                    Tag::Emphasis => Frame::Italic(Vec::new()),
                    Tag::Strong => Frame::Bold(Vec::new()),
                    Tag::Strikethrough => Frame::Transparent(Vec::new()),
                    Tag::Link { dest_url, .. } => Frame::Link(dest_url.to_string(), Vec::new()),
                    Tag::Image { dest_url, .. } => Frame::Image(dest_url.to_string(), String::new()),
                    Tag::MetadataBlock(_) => Frame::Metadata(String::new()),
                    _ => Frame::Skip,
                };
                self.stack.push((frame, offset));
            }
            Event::End(_) => {
                if let Some((frame, start)) = self.stack.pop() {
                    self.close(frame, start);
                }
            }
            Event::Text(t) => self.text(&t),
            Event::Code(c) => self.inline(Inline::Code(c.to_string())),
            Event::SoftBreak => self.inline(Inline::Text(" ".into())),
            Event::HardBreak => self.inline(Inline::LineBreak),
            Event::Rule => self.block(Block::at(BlockKind::Rule, Provenance::offset(offset))),
            Event::TaskListMarker(done) => {
                self.inline(Inline::Text(if done { "[x] " } else { "[ ] " }.into()))
            }
            Event::FootnoteReference(label) => self.inline(Inline::Text(format!("[^{}]", &*label))),
            // Html, InlineHtml, math and anything newer carry no canonical meaning.
            _ => {}
        }
    }

    fn text(&mut self, t: &str) {
        match self.stack.last_mut() {
            Some((Frame::Code { code, .. }, _)) => code.push_str(t),
            Some((Frame::Image(_, alt), _)) => alt.push_str(t),
            Some((Frame::Metadata(m), _)) => m.push_str(t),
            Some((Frame::Skip, _)) => {}
            _ => self.inline(Inline::Text(t.to_string())),
        }
    }

    /// Append an inline to the innermost frame that accepts inlines.
    fn inline(&mut self, inline: Inline) {
        match self.stack.last_mut() {
            Some((
                Frame::Paragraph(c)
                | Frame::Heading(_, c)
                | Frame::Cell(c)
                | Frame::Bold(c)
                | Frame::Italic(c)
                | Frame::Transparent(c)
                | Frame::Link(_, c),
                _,
            )) => c.push(inline),
            Some((Frame::Item { loose, .. }, _)) => loose.push(inline),
            Some((Frame::Image(_, alt), _)) => {
                if let Inline::Text(t) = inline {
                    alt.push_str(&t)
                }
            }
            _ => {}
        }
    }

    /// Append a finished block to the innermost block container.
    fn block(&mut self, block: Block) {
        match self.stack.last_mut() {
            Some((Frame::Quote(blocks), _)) => blocks.push(block),
            Some((Frame::Item { blocks, loose }, _)) => {
                if !loose.is_empty() {
                    blocks.push(Block::new(BlockKind::Paragraph(std::mem::take(loose))));
                }
                blocks.push(block);
            }
            Some((Frame::Skip, _)) => {}
            _ => self.blocks.push(block),
        }
    }

    fn close(&mut self, frame: Frame, start: usize) {
        let at = |kind: BlockKind| Block::at(kind, Provenance::offset(start));
        match frame {
            Frame::Paragraph(c) => self.block(at(BlockKind::Paragraph(c))),
            Frame::Heading(level, content) => self.block(at(BlockKind::Heading { level, content })),
            Frame::Quote(blocks) => self.block(at(BlockKind::Quote(blocks))),
            Frame::List { ordered, items } => self.block(at(BlockKind::List { ordered, items })),
            Frame::Item { mut blocks, loose } => {
                if !loose.is_empty() {
                    blocks.push(Block::new(BlockKind::Paragraph(loose)));
                }
                if let Some((Frame::List { items, .. }, _)) = self.stack.last_mut() {
                    items.push(ListItem { blocks });
                }
            }
            Frame::Code { language, code } => self.block(at(BlockKind::CodeBlock { language, code })),
            Frame::Table(rows) => self.block(at(BlockKind::Table { rows })),
            Frame::Row(cells) => {
                if let Some((Frame::Table(rows), _)) = self.stack.last_mut() {
                    rows.push(cells);
                }
            }
            Frame::Cell(content) => {
                if let Some((Frame::Row(cells), _)) = self.stack.last_mut() {
                    cells.push(content);
                }
            }
            Frame::Bold(c) => self.inline(Inline::Bold(c)),
            Frame::Italic(c) => self.inline(Inline::Italic(c)),
            Frame::Transparent(c) => {
                for i in c {
                    self.inline(i);
                }
            }
            Frame::Link(url, content) => self.inline(Inline::Link { content, url }),
            Frame::Image(src, alt) => self.inline(Inline::Image { alt, src }),
            Frame::Metadata(yaml) => {
                if self.title.is_none() {
                    self.title = front_matter_title(&yaml);
                }
            }
            Frame::Skip => {}
        }
    }

    fn finish(mut self) -> Extracted {
        while let Some((frame, start)) = self.stack.pop() {
            self.close(frame, start);
        }
        Extracted {
            title: self.title,
            blocks: self.blocks,
        }
    }
}

/// The `title:` value of a YAML front-matter block, unquoted.
fn front_matter_title(yaml: &str) -> Option<String> {
    yaml.lines().find_map(|line| {
        let value = line.strip_prefix("title:")?.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value)
            .trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}
