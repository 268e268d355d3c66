//! HTML extraction over the `scraper` DOM.
//!
//! The walk distinguishes block elements (flushed as their own blocks) from
//! inline elements (accumulated into the surrounding paragraph). Content
//! with no rendering meaning is dropped outright:
//!
//! - `script`, `style`, `noscript`, `template`, embedded objects and form controls
//! - elements hidden via the `hidden` attribute, `aria-hidden="true"` or inline
//!   `display:none` / `visibility:hidden`
//! - tracking pixels (images with a declared dimension of 0 or 1)
//! - `javascript:` links (their text is kept)

use super::text::decode;
use super::{ExtractError, Extracted};
use crate::pipeline::document::{Block, BlockKind, Inline, ListItem};
use scraper::{ElementRef, Html, Node};

/// Nesting depth past which content is flattened to text.
const MAX_DEPTH: usize = 100;

pub(crate) fn extract(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let text = decode(bytes)?;
    let dom = Html::parse_document(&text);
    let root = dom.root_element();

    let mut title = None;
    let mut blocks = Vec::new();
    for child in root.children() {
        let Some(el) = ElementRef::wrap(child) else {
            continue;
        };
        match el.value().name() {
            "head" => title = head_title(el),
            _ if is_dropped(el) => {}
            _ => collect_blocks(el, 1, &mut blocks),
        }
    }
    Ok(Extracted { title, blocks })
}

fn head_title(head: ElementRef<'_>) -> Option<String> {
    head.children()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "title")
        .map(|t| collapse(&t.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Classification ───────────────────────────────────────────────────────

fn is_dropped(el: ElementRef<'_>) -> bool {
    let v = el.value();
    if matches!(
        v.name(),
        "script"
            | "style"
            | "noscript"
            | "template"
            | "iframe"
            | "svg"
            | "canvas"
            | "object"
            | "embed"
            | "applet"
            | "audio"
            | "video"
            | "source"
            | "track"
            | "map"
            | "button"
            | "input"
            | "select"
            | "textarea"
            | "option"
            | "head"
            | "meta"
            | "link"
            | "base"
    ) {
        return true;
    }
    if v.attr("hidden").is_some() || v.attr("aria-hidden") == Some("true") {
        return true;
    }
    if let Some(style) = v.attr("style") {
        let style: String = style
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        if style.contains("display:none") || style.contains("visibility:hidden") {
            return true;
        }
    }
    v.name() == "img" && is_tracking_pixel(el)
}

fn is_tracking_pixel(img: ElementRef<'_>) -> bool {
    let dim = |name: &str| -> Option<u32> {
        img.value()
            .attr(name)
            .map(|v| v.trim().trim_end_matches("px"))
            .and_then(|v| v.parse().ok())
    };
    match (dim("width"), dim("height")) {
        (Some(w), Some(h)) => w <= 1 && h <= 1,
        (Some(0), None) | (None, Some(0)) => true,
        _ => false,
    }
}

fn is_block(name: &str) -> bool {
    matches!(
        name,
        "h1" | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "p"
            | "ul"
            | "ol"
            | "pre"
            | "blockquote"
            | "table"
            | "hr"
            | "div"
            | "section"
            | "article"
            | "main"
            | "header"
            | "footer"
            | "aside"
            | "nav"
            | "figure"
            | "figcaption"
            | "address"
            | "details"
            | "summary"
            | "dl"
            | "dt"
            | "dd"
            | "fieldset"
            | "form"
            | "hgroup"
            | "center"
            | "body"
            | "li"
            | "caption"
    )
}

// ── Blocks ───────────────────────────────────────────────────────────────

/// Walk the children of a container, turning loose inline runs into
/// paragraphs and block children into their own blocks.
fn collect_blocks(el: ElementRef<'_>, depth: usize, out: &mut Vec<Block>) {
    let mut pending: Vec<Inline> = Vec::new();
    for child in el.children() {
        match child.value() {
            Node::Text(t) => pending.push(Inline::Text(t.to_string())),
            Node::Element(_) => {
                let Some(c) = ElementRef::wrap(child) else {
                    continue;
                };
                if is_dropped(c) {
                    continue;
                }
                if is_block(c.value().name()) {
                    flush(&mut pending, out);
                    block_element(c, depth + 1, out);
                } else {
                    inline_element(c, depth + 1, &mut pending);
                }
            }
            _ => {}
        }
    }
    flush(&mut pending, out);
}

fn flush(pending: &mut Vec<Inline>, out: &mut Vec<Block>) {
    let inlines = std::mem::take(pending);
    if !is_blank(&inlines) {
        out.push(Block::new(BlockKind::Paragraph(inlines)));
    }
}

fn is_blank(inlines: &[Inline]) -> bool {
    inlines.iter().all(|i| match i {
        Inline::Text(t) => t.trim().is_empty(),
        Inline::LineBreak => true,
        Inline::Bold(c) | Inline::Italic(c) => is_blank(c),
        _ => false,
    })
}

fn block_element(el: ElementRef<'_>, depth: usize, out: &mut Vec<Block>) {
    if depth > MAX_DEPTH {
        let text = collapse(&el.text().collect::<String>());
        if !text.is_empty() {
            out.push(Block::paragraph(text));
        }
        return;
    }
    let name = el.value().name();
    match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name[1..].parse().unwrap_or(1);
            out.push(Block::new(BlockKind::Heading {
                level,
                content: inlines_of(el, depth),
            }));
        }
        "p" => {
            let content = inlines_of(el, depth);
            if !is_blank(&content) {
                out.push(Block::new(BlockKind::Paragraph(content)));
            }
        }
        "ul" | "ol" => {
            let items = list_items(el, depth);
            if !items.is_empty() {
                out.push(Block::new(BlockKind::List {
                    ordered: name == "ol",
                    items,
                }));
            }
        }
        "pre" => out.push(Block::new(BlockKind::CodeBlock {
            language: code_language(el),
            code: el.text().collect(),
        })),
        "blockquote" => {
            let mut inner = Vec::new();
            collect_blocks(el, depth, &mut inner);
            if !inner.is_empty() {
                out.push(Block::new(BlockKind::Quote(inner)));
            }
        }
        "table" => table(el, depth, out),
        "hr" => out.push(Block::new(BlockKind::Rule)),
        _ => collect_blocks(el, depth, out),
    }
}

fn list_items(list: ElementRef<'_>, depth: usize) -> Vec<ListItem> {
    let mut items: Vec<ListItem> = Vec::new();
    for child in list.children().filter_map(ElementRef::wrap) {
        if is_dropped(child) {
            continue;
        }
        match child.value().name() {
            "li" => {
                let mut blocks = Vec::new();
                collect_blocks(child, depth + 1, &mut blocks);
                items.push(ListItem { blocks });
            }
            // Nested list directly inside a list: attach to the previous item.
            "ul" | "ol" => {
                let mut blocks = Vec::new();
                block_element(child, depth + 1, &mut blocks);
                match items.last_mut() {
                    Some(last) => last.blocks.extend(blocks),
                    None => items.push(ListItem { blocks }),
                }
            }
            _ => {
                let mut blocks = Vec::new();
                collect_blocks(child, depth + 1, &mut blocks);
                if !blocks.is_empty() {
                    items.push(ListItem { blocks });
                }
            }
        }
    }
    items
}

fn code_language(pre: ElementRef<'_>) -> Option<String> {
    let from_class = |el: ElementRef<'_>| -> Option<String> {
        el.value().attr("class")?.split_whitespace().find_map(|c| {
            c.strip_prefix("language-")
                .or_else(|| c.strip_prefix("lang-"))
                .filter(|l| !l.is_empty())
                .map(String::from)
        })
    };
    from_class(pre).or_else(|| {
        pre.children()
            .filter_map(ElementRef::wrap)
            .find(|c| c.value().name() == "code")
            .and_then(from_class)
    })
}

fn table(el: ElementRef<'_>, depth: usize, out: &mut Vec<Block>) {
    let mut rows: Vec<Vec<Vec<Inline>>> = Vec::new();
    for child in el.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "caption" => {
                let content = inlines_of(child, depth);
                if !is_blank(&content) {
                    out.push(Block::new(BlockKind::Paragraph(content)));
                }
            }
            "thead" | "tbody" | "tfoot" => {
                for tr in child.children().filter_map(ElementRef::wrap) {
                    if tr.value().name() == "tr" {
                        rows.push(row(tr, depth));
                    }
                }
            }
            "tr" => rows.push(row(child, depth)),
            _ => {}
        }
    }
    rows.retain(|r| !r.is_empty());
    if !rows.is_empty() {
        out.push(Block::new(BlockKind::Table { rows }));
    }
}

fn row(tr: ElementRef<'_>, depth: usize) -> Vec<Vec<Inline>> {
    tr.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| matches!(c.value().name(), "td" | "th"))
        .map(|cell| inlines_of(cell, depth + 1))
        .collect()
}

// ── Inlines ──────────────────────────────────────────────────────────────

fn inlines_of(el: ElementRef<'_>, depth: usize) -> Vec<Inline> {
    let mut out = Vec::new();
    for child in el.children() {
        match child.value() {
            Node::Text(t) => out.push(Inline::Text(t.to_string())),
            Node::Element(_) => {
                if let Some(c) = ElementRef::wrap(child) {
                    if !is_dropped(c) {
                        inline_element(c, depth + 1, &mut out);
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn inline_element(el: ElementRef<'_>, depth: usize, out: &mut Vec<Inline>) {
    if depth > MAX_DEPTH {
        out.push(Inline::Text(el.text().collect()));
        return;
    }
    let v = el.value();
    match v.name() {
        "b" | "strong" => out.push(Inline::Bold(inlines_of(el, depth))),
        "i" | "em" | "cite" | "dfn" | "var" => out.push(Inline::Italic(inlines_of(el, depth))),
        "code" | "kbd" | "samp" | "tt" => out.push(Inline::Code(el.text().collect())),
        "br" => out.push(Inline::LineBreak),
        "img" => {
            let src = v.attr("src").unwrap_or("").trim();
            if !src.is_empty() {
                out.push(Inline::Image {
                    alt: v.attr("alt").unwrap_or("").to_string(),
                    src: src.to_string(),
                });
            }
        }
        "a" => {
            let content = inlines_of(el, depth);
            match v.attr("href").map(str::trim) {
                Some(href)
                    if !href.is_empty()
                        && !href.to_ascii_lowercase().starts_with("javascript:") =>
                {
                    out.push(Inline::Link {
                        content,
                        url: href.to_string(),
                    })
                }
                _ => out.extend(content),
            }
        }
        _ => out.extend(inlines_of(el, depth)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(html: &str) -> Vec<BlockKind> {
        extract(html.as_bytes())
            .unwrap()
            .blocks
            .into_iter()
            .map(|b| b.kind)
            .collect()
    }

    fn text(s: &str) -> Inline {
        Inline::Text(s.into())
    }

    #[test]
    fn heading_and_bold_paragraph() {
        let b = blocks("<h2>Intro</h2><p>Hello <b>World</b></p>");
        assert_eq!(
            b,
            vec![
                BlockKind::Heading {
                    level: 2,
                    content: vec![text("Intro")]
                },
                BlockKind::Paragraph(vec![text("Hello "), Inline::Bold(vec![text("World")])]),
            ]
        );
    }

    #[test]
    fn scripts_styles_and_hidden_content_are_dropped() {
        let b = blocks(
            "<html><head><title> My  Page </title><style>p{}</style></head><body>\
             <script>alert(1)</script><p>Keep</p><div hidden>gone</div>\
             <p style=\"display: none\">gone</p><noscript>gone</noscript></body></html>",
        );
        assert_eq!(b, vec![BlockKind::Paragraph(vec![text("Keep")])]);
        let out = extract(b"<title> My  Page </title><p>x</p>").unwrap();
        assert_eq!(out.title.as_deref(), Some("My Page"));
    }

    #[test]
    fn tracking_pixels_are_dropped_real_images_kept() {
        let b = blocks(
            "<p>a<img src=\"https://t.example/p.gif\" width=\"1\" height=\"1\">\
             <img src=\"chart.png\" alt=\"Chart\" width=\"400\"></p>",
        );
        assert_eq!(
            b,
            vec![BlockKind::Paragraph(vec![
                text("a"),
                Inline::Image {
                    alt: "Chart".into(),
                    src: "chart.png".into()
                }
            ])]
        );
    }

    #[test]
    fn javascript_links_keep_text_only() {
        let b = blocks("<p><a href=\"javascript:void(0)\">click</a> <a href=\"/x\">x</a></p>");
        assert_eq!(
            b,
            vec![BlockKind::Paragraph(vec![
                text("click"),
                text(" "),
                Inline::Link {
                    content: vec![text("x")],
                    url: "/x".into()
                }
            ])]
        );
    }

    #[test]
    fn nested_lists() {
        let b = blocks("<ol><li>one<ul><li>inner</li></ul></li><li>two</li></ol>");
        match &b[0] {
            BlockKind::List { ordered, items } => {
                assert!(*ordered);
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].blocks.len(), 2);
                assert!(matches!(
                    items[0].blocks[1].kind,
                    BlockKind::List { ordered: false, .. }
                ));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn pre_keeps_code_verbatim_with_language() {
        let b = blocks("<pre><code class=\"language-rust\">fn main() {\n    x  =  1;\n}</code></pre>");
        assert_eq!(
            b,
            vec![BlockKind::CodeBlock {
                language: Some("rust".into()),
                code: "fn main() {\n    x  =  1;\n}".into()
            }]
        );
    }

    #[test]
    fn tables_collect_rows_and_cells() {
        let b = blocks(
            "<table><thead><tr><th>A</th><th>B</th></tr></thead>\
             <tbody><tr><td>1</td><td><b>2</b></td></tr></tbody></table>",
        );
        match &b[0] {
            BlockKind::Table { rows } => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0], vec![vec![text("A")], vec![text("B")]]);
                assert_eq!(rows[1][1], vec![Inline::Bold(vec![text("2")])]);
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn loose_text_in_containers_becomes_paragraphs() {
        let b = blocks("<div>loose <i>text</i><p>para</p>tail</div>");
        assert_eq!(b.len(), 3);
        assert_eq!(
            b[0],
            BlockKind::Paragraph(vec![text("loose "), Inline::Italic(vec![text("text")])])
        );
    }

    #[test]
    fn deep_nesting_is_flattened_not_overflowed() {
        let depth = 300;
        let html = format!("{}deep{}", "<div>".repeat(depth), "</div>".repeat(depth));
        let b = blocks(&html);
        assert_eq!(b, vec![BlockKind::Paragraph(vec![text("deep")])]);
    }
}
