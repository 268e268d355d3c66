//! Outbound links: extraction from canonical Markdown, and metadata
//! fetching for the extracted targets.

pub mod fetch;

use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use fetch::{FetchConfig, LinkError, LinkFetchResult, LinkFetcher, LinkMetadata};

/// An absolute outbound link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    /// Plain text of the first occurrence.
    pub text: String,
}

/// Absolute `http(s)` link targets in first-seen order, deduplicated by URL.
///
/// Image sources, `#anchor` targets and relative links are skipped.
pub fn extract_links(markdown: &str) -> Vec<Link> {
    let mut out: Vec<Link> = Vec::new();
    let mut seen = HashSet::new();
    let mut open: Option<(String, String)> = None;
    let mut image_depth = 0usize;

    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Link { dest_url, .. }) => {
                open = Some((dest_url.to_string(), String::new()));
            }
            Event::End(TagEnd::Link) => {
                if let Some((url, text)) = open.take() {
                    if is_absolute_http(&url) && seen.insert(url.clone()) {
                        out.push(Link {
                            url,
                            text: text.split_whitespace().collect::<Vec<_>>().join(" "),
                        });
                    }
                }
            }
            Event::Start(Tag::Image { .. }) => image_depth += 1,
            Event::End(TagEnd::Image) => image_depth = image_depth.saturating_sub(1),
            Event::Text(t) | Event::Code(t) => {
                if let Some((_, text)) = open.as_mut() {
                    if image_depth == 0 {
                        text.push_str(&t);
                    }
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if let Some((_, text)) = open.as_mut() {
                    text.push(' ');
                }
            }
            _ => {}
        }
    }
    out
}

fn is_absolute_http(url: &str) -> bool {
    let lower = url.get(..8).unwrap_or(url).to_ascii_lowercase();
    (lower.starts_with("http://") && url.len() > 7) || (lower.starts_with("https://") && url.len() > 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_absolute_links_in_order_once() {
        let md = "See [Rust](https://www.rust-lang.org/) and [docs](http://docs.rs).\n\n\
                  Again [the language](https://www.rust-lang.org/).\n";
        let links = extract_links(md);
        assert_eq!(
            links,
            vec![
                Link {
                    url: "https://www.rust-lang.org/".into(),
                    text: "Rust".into()
                },
                Link {
                    url: "http://docs.rs".into(),
                    text: "docs".into()
                },
            ]
        );
    }

    #[test]
    fn skips_images_anchors_and_relative_targets() {
        let md = "![logo](https://example.com/logo.png) [top](#intro) [next](chapter2.md) [mail](mailto:a@b.c)\n";
        assert!(extract_links(md).is_empty());
    }

    #[test]
    fn angle_bracket_destinations_and_code_text() {
        let md = "[`run` it](<https://example.com/a b>)\n";
        let links = extract_links(md);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url, "https://example.com/a b");
        assert_eq!(links[0].text, "run it");
    }
}
