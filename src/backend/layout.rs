//! Rule-based layout backend.
//!
//! The default pipeline's adapter. Works entirely from the text layer the
//! rasterise stage extracts alongside each page image — no model, no
//! network, fully deterministic. Lines are grouped on blank lines and each
//! group is classified by shape (pipe tables, bullet lists, numbered or
//! all-caps headings, plain paragraphs), then emitted as DocTags for the
//! shared assemble-stage parser.
//!
//! Pages without a text layer (scanned images) produce a single picture
//! placeholder: OCR is an external concern, not this adapter's.

use crate::backend::{check_dimensions, BackendKind, PageBackend, RawPageOutput};
use crate::error::ConvertError;
use crate::options::{PipelineOptions, ResponseFormat};
use crate::pipeline::rasterize::PageImage;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::RangeInclusive;
use tracing::debug;

/// Longest heading line; anything longer is body text.
const MAX_HEADING_CHARS: usize = 80;

static RE_NUMBERED_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+)*\.?\s+\S").unwrap());
static RE_ORDERED_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[.)]\s+").unwrap());

/// Rule-based layout analysis over the extracted text layer.
#[derive(Debug, Default)]
pub struct LayoutBackend;

impl LayoutBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PageBackend for LayoutBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Layout
    }

    fn preferred_resolution(&self) -> u32 {
        // The text layer drives extraction, so raster size barely matters;
        // 2048 keeps retained page images legible.
        2048
    }

    fn accepted_range(&self) -> RangeInclusive<u32> {
        1..=16384
    }

    async fn infer(
        &self,
        page: &PageImage,
        _options: &PipelineOptions,
    ) -> Result<RawPageOutput, ConvertError> {
        check_dimensions(self, page)?;

        let content = match page.text.as_deref() {
            Some(text) => analyse(text, page.index),
            None => {
                debug!(
                    "page {}: no text layer, emitting picture placeholder",
                    page.index + 1
                );
                "<doctag><picture></picture></doctag>".to_string()
            }
        };

        Ok(RawPageOutput {
            format: ResponseFormat::DocTags,
            content,
        })
    }
}

/// Classify the page's line groups and serialise them as DocTags.
fn analyse(text: &str, page_index: usize) -> String {
    let mut out = String::from("<doctag>");

    for (group_idx, group) in line_groups(text).iter().enumerate() {
        if group.iter().all(|l| is_table_line(l)) && group.len() >= 2 {
            emit_table(&mut out, group);
        } else if group.iter().all(|l| is_bullet_line(l)) {
            for line in group {
                emit(&mut out, "list_item", strip_bullet(line));
            }
        } else if group.len() == 1 {
            let line = group[0].trim();
            if page_index == 0 && group_idx == 0 && looks_like_title(line) {
                emit(&mut out, "title", line);
            } else if looks_like_heading(line) {
                emit(&mut out, "section_header", line);
            } else {
                emit(&mut out, "text", line);
            }
        } else {
            emit(&mut out, "text", &group.join(" "));
        }
    }

    out.push_str("</doctag>");
    out
}

/// Split into groups of consecutive non-empty lines.
fn line_groups(text: &str) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
            }
        } else {
            current.push(trimmed.to_string());
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn is_table_line(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_line(line: &str) -> bool {
    is_table_line(line)
        && line
            .trim()
            .chars()
            .all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn is_bullet_line(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("- ")
        || t.starts_with("* ")
        || t.starts_with("• ")
        || RE_ORDERED_ITEM.is_match(t)
}

fn strip_bullet(line: &str) -> &str {
    let t = line.trim_start();
    if let Some(rest) = t
        .strip_prefix("- ")
        .or_else(|| t.strip_prefix("* "))
        .or_else(|| t.strip_prefix("• "))
    {
        return rest.trim_start();
    }
    if let Some(m) = RE_ORDERED_ITEM.find(t) {
        return t[m.end()..].trim_start();
    }
    t
}

fn looks_like_title(line: &str) -> bool {
    line.len() <= MAX_HEADING_CHARS && !line.ends_with('.') && !is_bullet_line(line)
}

fn looks_like_heading(line: &str) -> bool {
    if line.len() > MAX_HEADING_CHARS || line.ends_with('.') {
        return false;
    }
    if RE_NUMBERED_HEADING.is_match(line) && !is_bullet_line(line) {
        return true;
    }
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}

fn emit(out: &mut String, tag: &str, content: &str) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    out.push_str(&escape(content));
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

/// Serialise a pipe-table group as OTSL cells.
fn emit_table(out: &mut String, rows: &[String]) {
    out.push_str("<otsl>");
    for row in rows {
        if is_separator_line(row) {
            continue;
        }
        let trimmed = row.trim().trim_matches('|');
        for cell in trimmed.split('|') {
            out.push_str("<fcel>");
            out.push_str(&escape(cell.trim()));
        }
        out.push_str("<nl>");
    }
    out.push_str("</otsl>");
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;")
}
