//! Assemble stage: parse raw backend output into typed page entities.
//!
//! Two grammars, selected by the pipeline's `response_format`:
//!
//! * **DocTags** — `<doctag><text>…</text><otsl>…</otsl>…</doctag>`, the
//!   structured format emitted by the layout backend and by
//!   document-specialised VLMs. Elements may carry four `<loc_N>` tokens
//!   giving the bounding box in raster pixels.
//! * **Markdown** — free text from general-purpose VLMs, segmented by line
//!   shape (headings, pipe tables, fences, lists, image links).
//!
//! Policy for malformed or unrecognised units: skip the unit, count it, and
//! keep going. One garbled table must not cost the caller the whole page.
//! The count surfaces on [`crate::document::Document::skipped_units`].

use crate::backend::RawPageOutput;
use crate::document::{Block, BlockKind, BoundingBox, Figure, Page, Table};
use crate::options::{PipelineOptions, ResponseFormat};
use crate::pipeline::rasterize::PageImage;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown)?\n(.*)\n```\s*$").unwrap());
static RE_IMAGE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^!\[([^\]]*)\]\(([^)]*)\)$").unwrap());
static RE_LOC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<loc_(\d+)>").unwrap());
static RE_ORDERED_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[.)]\s+").unwrap());

/// Parse one page's raw output into a [`Page`].
///
/// Returns the page plus the number of units skipped as unparseable.
pub(crate) fn assemble_page(
    source: &PageImage,
    raw: &RawPageOutput,
    options: &PipelineOptions,
) -> (Page, usize) {
    let mut page = Page::new(source.index, source.width, source.height);

    let content = normalize(&raw.content);
    let skipped = match raw.format {
        ResponseFormat::DocTags => parse_doctags(&content, &mut page),
        ResponseFormat::Markdown => parse_markdown(&content, &mut page),
    };
    if skipped > 0 {
        debug!(
            "page {}: skipped {} unparseable unit(s)",
            source.index + 1,
            skipped
        );
    }

    if options.generate_picture_images {
        attach_figure_crops(&mut page, source);
    }
    if options.generate_page_images {
        page.image = source.image.clone();
    }

    (page, skipped)
}

/// Cheap text normalisation applied before parsing: VLMs occasionally wrap
/// output in markdown fences despite instructions, and emit CRLF or
/// invisible characters that would confuse line-based segmentation.
fn normalize(input: &str) -> String {
    let s = match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    };
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s = s.replace(['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{2060}'], "");
    s.lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── DocTags grammar ──────────────────────────────────────────────────────

const BLOCK_TAGS: &[(&str, BlockKind)] = &[
    ("title", BlockKind::Title),
    ("section_header", BlockKind::SectionHeader),
    ("text", BlockKind::Paragraph),
    ("list_item", BlockKind::ListItem),
    ("code", BlockKind::Code),
    ("formula", BlockKind::Formula),
];

fn parse_doctags(content: &str, page: &mut Page) -> usize {
    let mut skipped = 0usize;
    let mut rest = content.trim();

    // Optional document wrapper.
    rest = rest.strip_prefix("<doctag>").unwrap_or(rest);
    rest = rest.strip_suffix("</doctag>").unwrap_or(rest);

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if !rest.starts_with('<') {
            // Stray text between elements is a malformed unit.
            skipped += 1;
            rest = match rest.find('<') {
                Some(pos) => &rest[pos..],
                None => "",
            };
            continue;
        }

        match parse_element(rest, page) {
            Ok(remaining) => rest = remaining,
            Err(remaining) => {
                skipped += 1;
                rest = remaining;
            }
        }
    }

    skipped
}

/// Parse one element at the head of `rest`. On success returns the tail
/// after the element; on failure returns a tail past the offending unit.
fn parse_element<'a>(rest: &'a str, page: &mut Page) -> Result<&'a str, &'a str> {
    let tag_end = match rest.find('>') {
        Some(pos) => pos,
        None => return Err(""),
    };
    let tag = &rest[1..tag_end];
    let after_open = &rest[tag_end + 1..];

    if let Some(&(_, kind)) = BLOCK_TAGS.iter().find(|(name, _)| *name == tag) {
        let close = format!("</{tag}>");
        let Some(close_pos) = after_open.find(&close) else {
            return Err(skip_unit(after_open));
        };
        let (bbox, body) = take_loc_tokens(&after_open[..close_pos]);
        page.push_block(Block {
            kind,
            text: unescape(body.trim()),
            bbox,
        });
        return Ok(&after_open[close_pos + close.len()..]);
    }

    match tag {
        "otsl" => {
            let Some(close_pos) = after_open.find("</otsl>") else {
                return Err(skip_unit(after_open));
            };
            let (bbox, body) = take_loc_tokens(&after_open[..close_pos]);
            match parse_otsl(body, bbox) {
                Some(table) => page.push_table(table),
                None => return Err(&after_open[close_pos + "</otsl>".len()..]),
            }
            Ok(&after_open[close_pos + "</otsl>".len()..])
        }
        "picture" => {
            let Some(close_pos) = after_open.find("</picture>") else {
                return Err(skip_unit(after_open));
            };
            let (bbox, body) = take_loc_tokens(&after_open[..close_pos]);
            let caption = body
                .trim()
                .strip_prefix("<caption>")
                .and_then(|c| c.strip_suffix("</caption>"))
                .map(|c| unescape(c.trim()))
                .filter(|c| !c.is_empty());
            page.push_figure(Figure {
                caption,
                bbox,
                image: None,
            });
            Ok(&after_open[close_pos + "</picture>".len()..])
        }
        _ => Err(skip_unit(after_open)),
    }
}

/// Advance past the current unit: to just after the next closing tag, or to
/// the next opening angle bracket when no close is in sight.
fn skip_unit(rest: &str) -> &str {
    if let Some(pos) = rest.find("</") {
        if let Some(end) = rest[pos..].find('>') {
            return &rest[pos + end + 1..];
        }
    }
    match rest.find('<') {
        Some(pos) => &rest[pos..],
        None => "",
    }
}

/// Strip up to four leading `<loc_N>` tokens, building a bounding box when
/// all four are present.
fn take_loc_tokens(body: &str) -> (Option<BoundingBox>, &str) {
    let mut rest = body.trim_start();
    let mut coords = Vec::with_capacity(4);

    while coords.len() < 4 {
        let Some(caps) = RE_LOC.captures(rest) else { break };
        let Ok(v) = caps[1].parse::<f32>() else { break };
        coords.push(v);
        rest = &rest[caps[0].len()..];
    }

    let bbox = (coords.len() == 4).then(|| BoundingBox {
        left: coords[0],
        top: coords[1],
        right: coords[2],
        bottom: coords[3],
    });
    (bbox, rest)
}

/// OTSL table body: `<fcel>`/`<ched>` cells, `<nl>` row breaks. Ragged rows
/// are padded to the widest row so the dense grid invariant holds.
fn parse_otsl(body: &str, bbox: Option<BoundingBox>) -> Option<Table> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    let mut rest = body.trim();
    while !rest.is_empty() {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if let Some(after) = rest.strip_prefix("<nl>") {
            if !current.is_empty() {
                rows.push(std::mem::take(&mut current));
            }
            rest = after;
        } else if let Some(after) = rest
            .strip_prefix("<fcel>")
            .or_else(|| rest.strip_prefix("<ched>"))
        {
            let cell_end = after
                .find(|c| c == '<')
                .unwrap_or(after.len());
            current.push(unescape(after[..cell_end].trim()));
            rest = &after[cell_end..];
        } else {
            // Unknown token inside the table: the whole unit is malformed.
            return None;
        }
    }
    if !current.is_empty() {
        rows.push(current);
    }
    if rows.is_empty() {
        return None;
    }

    let num_cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    let num_rows = rows.len();
    let mut cells = Vec::with_capacity(num_rows * num_cols);
    for mut row in rows {
        row.resize(num_cols, String::new());
        cells.extend(row);
    }

    Some(Table {
        num_rows,
        num_cols,
        cells,
        caption: None,
        bbox,
    })
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<").replace("&amp;", "&")
}

// ── Free-Markdown grammar ────────────────────────────────────────────────

fn parse_markdown(content: &str, page: &mut Page) -> usize {
    let mut skipped = 0usize;
    let lines: Vec<&str> = content.lines().collect();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut i = 0;

    macro_rules! flush_paragraph {
        () => {
            if !paragraph.is_empty() {
                page.push_block(Block {
                    kind: BlockKind::Paragraph,
                    text: paragraph.join(" "),
                    bbox: None,
                });
                paragraph.clear();
            }
        };
    }

    while i < lines.len() {
        let line = lines[i].trim();

        if line.is_empty() {
            flush_paragraph!();
            i += 1;
        } else if let Some(heading) = line.strip_prefix('#') {
            flush_paragraph!();
            let level = 1 + heading.chars().take_while(|&c| c == '#').count();
            let text = heading.trim_start_matches('#').trim();
            page.push_block(Block {
                kind: if level == 1 {
                    BlockKind::Title
                } else {
                    BlockKind::SectionHeader
                },
                text: text.to_string(),
                bbox: None,
            });
            i += 1;
        } else if line.starts_with("```") {
            flush_paragraph!();
            let mut body: Vec<&str> = Vec::new();
            i += 1;
            while i < lines.len() && !lines[i].trim().starts_with("```") {
                body.push(lines[i]);
                i += 1;
            }
            i += 1; // closing fence (or end of input)
            page.push_block(Block {
                kind: BlockKind::Code,
                text: body.join("\n"),
                bbox: None,
            });
        } else if line.starts_with("$$") {
            flush_paragraph!();
            let inline = line.trim_start_matches("$$").trim_end_matches("$$").trim();
            if !inline.is_empty() {
                page.push_block(Block {
                    kind: BlockKind::Formula,
                    text: inline.to_string(),
                    bbox: None,
                });
                i += 1;
            } else {
                let mut body: Vec<&str> = Vec::new();
                i += 1;
                while i < lines.len() && !lines[i].trim().starts_with("$$") {
                    body.push(lines[i].trim());
                    i += 1;
                }
                i += 1;
                page.push_block(Block {
                    kind: BlockKind::Formula,
                    text: body.join(" "),
                    bbox: None,
                });
            }
        } else if is_table_line(line) {
            flush_paragraph!();
            let start = i;
            while i < lines.len() && is_table_line(lines[i].trim()) {
                i += 1;
            }
            match parse_pipe_table(&lines[start..i]) {
                Some(table) => page.push_table(table),
                None => skipped += 1,
            }
        } else if let Some(caps) = RE_IMAGE_LINE.captures(line) {
            flush_paragraph!();
            let caption = caps[1].trim().to_string();
            page.push_figure(Figure {
                caption: (!caption.is_empty()).then_some(caption),
                bbox: None,
                image: None,
            });
            i += 1;
        } else if is_list_line(line) {
            flush_paragraph!();
            page.push_block(Block {
                kind: BlockKind::ListItem,
                text: strip_list_marker(line).to_string(),
                bbox: None,
            });
            i += 1;
        } else {
            paragraph.push(line);
            i += 1;
        }
    }
    flush_paragraph!();

    skipped
}

fn is_table_line(line: &str) -> bool {
    line.len() > 2 && line.starts_with('|') && line.ends_with('|')
}

fn is_separator_line(line: &str) -> bool {
    is_table_line(line) && line.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn is_list_line(line: &str) -> bool {
    line.starts_with("- ") || line.starts_with("* ") || RE_ORDERED_ITEM.is_match(line)
}

fn strip_list_marker(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return rest.trim_start();
    }
    if let Some(m) = RE_ORDERED_ITEM.find(line) {
        return line[m.end()..].trim_start();
    }
    line
}

fn parse_pipe_table(lines: &[&str]) -> Option<Table> {
    let rows: Vec<Vec<String>> = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !is_separator_line(l))
        .map(|l| {
            l.trim_matches('|')
                .split('|')
                .map(|c| c.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect();

    if rows.is_empty() {
        return None;
    }

    let num_cols = rows.iter().map(Vec::len).max()?;
    let num_rows = rows.len();
    let mut cells = Vec::with_capacity(num_rows * num_cols);
    for mut row in rows {
        row.resize(num_cols, String::new());
        cells.extend(row);
    }

    Some(Table {
        num_rows,
        num_cols,
        cells,
        caption: None,
        bbox: None,
    })
}

// ── Figure crops ─────────────────────────────────────────────────────────

/// Crop figure regions out of the page raster when bounding boxes exist.
fn attach_figure_crops(page: &mut Page, source: &PageImage) {
    let Some(ref raster) = source.image else { return };

    for figure in &mut page.figures {
        let Some(bbox) = figure.bbox else { continue };
        let left = bbox.left.max(0.0) as u32;
        let top = bbox.top.max(0.0) as u32;
        let right = (bbox.right as u32).min(source.width);
        let bottom = (bbox.bottom as u32).min(source.height);
        if right > left && bottom > top {
            figure.image = Some(raster.crop_imm(left, top, right - left, bottom - top));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RawPageOutput;
    use crate::document::ItemRef;
    use image::{DynamicImage, RgbaImage};

    fn assemble(format: ResponseFormat, content: &str) -> (Page, usize) {
        let source = PageImage::for_test(0, 512, 512);
        let raw = RawPageOutput {
            format,
            content: content.to_string(),
        };
        assemble_page(&source, &raw, &PipelineOptions::default())
    }

    // ── DocTags ──────────────────────────────────────────────────────────

    #[test]
    fn doctags_blocks_and_reading_order() {
        let (page, skipped) = assemble(
            ResponseFormat::DocTags,
            "<doctag><title>T</title><text>body</text><list_item>li</list_item></doctag>",
        );
        assert_eq!(skipped, 0);
        assert_eq!(page.blocks.len(), 3);
        assert_eq!(page.blocks[0].kind, BlockKind::Title);
        assert_eq!(page.blocks[1].text, "body");
        assert_eq!(
            page.items,
            vec![ItemRef::Block(0), ItemRef::Block(1), ItemRef::Block(2)]
        );
    }

    #[test]
    fn doctags_loc_tokens_become_bbox() {
        let (page, skipped) = assemble(
            ResponseFormat::DocTags,
            "<doctag><text><loc_10><loc_20><loc_110><loc_220>located</text></doctag>",
        );
        assert_eq!(skipped, 0);
        let bbox = page.blocks[0].bbox.unwrap();
        assert_eq!(bbox.left, 10.0);
        assert_eq!(bbox.bottom, 220.0);
        assert_eq!(page.blocks[0].text, "located");
    }

    #[test]
    fn doctags_otsl_table() {
        let (page, skipped) = assemble(
            ResponseFormat::DocTags,
            "<doctag><otsl><fcel>A<fcel>B<nl><fcel>1<nl></otsl></doctag>",
        );
        assert_eq!(skipped, 0);
        assert_eq!(page.tables.len(), 1);
        let t = &page.tables[0];
        assert_eq!((t.num_rows, t.num_cols), (2, 2));
        assert_eq!(t.cell(0, 1), "B");
        assert_eq!(t.cell(1, 1), ""); // ragged row padded
    }

    #[test]
    fn doctags_picture_with_caption() {
        let (page, skipped) = assemble(
            ResponseFormat::DocTags,
            "<doctag><picture><caption>Fig 1</caption></picture><picture></picture></doctag>",
        );
        assert_eq!(skipped, 0);
        assert_eq!(page.figures.len(), 2);
        assert_eq!(page.figures[0].caption.as_deref(), Some("Fig 1"));
        assert!(page.figures[1].caption.is_none());
    }

    #[test]
    fn doctags_unknown_tag_skipped_not_fatal() {
        let (page, skipped) = assemble(
            ResponseFormat::DocTags,
            "<doctag><text>keep</text><mystery>drop</mystery><text>also keep</text></doctag>",
        );
        assert_eq!(skipped, 1);
        assert_eq!(page.blocks.len(), 2);
        assert_eq!(page.blocks[1].text, "also keep");
    }

    #[test]
    fn doctags_unclosed_tag_skipped() {
        let (page, skipped) =
            assemble(ResponseFormat::DocTags, "<doctag><text>never closed</doctag>");
        assert_eq!(skipped, 1);
        assert!(page.blocks.is_empty());
    }

    #[test]
    fn doctags_stray_text_counted() {
        let (page, skipped) = assemble(
            ResponseFormat::DocTags,
            "<doctag>orphan words <text>real</text></doctag>",
        );
        assert_eq!(skipped, 1);
        assert_eq!(page.blocks.len(), 1);
    }

    #[test]
    fn doctags_entities_unescaped() {
        let (page, _) = assemble(
            ResponseFormat::DocTags,
            "<doctag><text>a &lt; b &amp; c</text></doctag>",
        );
        assert_eq!(page.blocks[0].text, "a < b & c");
    }

    // ── Markdown ─────────────────────────────────────────────────────────

    #[test]
    fn markdown_headings_and_paragraphs() {
        let (page, skipped) = assemble(
            ResponseFormat::Markdown,
            "# Top\n\n## Section\n\nA paragraph\nacross lines.\n\nAnother one.",
        );
        assert_eq!(skipped, 0);
        assert_eq!(page.blocks[0].kind, BlockKind::Title);
        assert_eq!(page.blocks[1].kind, BlockKind::SectionHeader);
        assert_eq!(page.blocks[2].text, "A paragraph across lines.");
        assert_eq!(page.blocks[3].text, "Another one.");
    }

    #[test]
    fn markdown_pipe_table() {
        let (page, _) = assemble(
            ResponseFormat::Markdown,
            "| H1 | H2 |\n| --- | --- |\n| a | b |",
        );
        assert_eq!(page.tables.len(), 1);
        let t = &page.tables[0];
        assert_eq!((t.num_rows, t.num_cols), (2, 2));
        assert_eq!(t.cell(1, 0), "a");
    }

    #[test]
    fn markdown_code_fence_and_formula() {
        let (page, _) = assemble(
            ResponseFormat::Markdown,
            "```rust\nlet x = 1;\n```\n\n$$E = mc^2$$",
        );
        assert_eq!(page.blocks[0].kind, BlockKind::Code);
        assert_eq!(page.blocks[0].text, "let x = 1;");
        assert_eq!(page.blocks[1].kind, BlockKind::Formula);
        assert_eq!(page.blocks[1].text, "E = mc^2");
    }

    #[test]
    fn markdown_image_becomes_figure() {
        let (page, _) = assemble(
            ResponseFormat::Markdown,
            "![A chart](chart.png)\n\n![](empty.png)",
        );
        assert_eq!(page.figures.len(), 2);
        assert_eq!(page.figures[0].caption.as_deref(), Some("A chart"));
        assert!(page.figures[1].caption.is_none());
    }

    #[test]
    fn markdown_outer_fences_stripped() {
        let (page, _) = assemble(ResponseFormat::Markdown, "```markdown\n# Inside\n```");
        assert_eq!(page.blocks[0].kind, BlockKind::Title);
        assert_eq!(page.blocks[0].text, "Inside");
    }

    #[test]
    fn markdown_list_items() {
        let (page, _) = assemble(ResponseFormat::Markdown, "- one\n* two\n3. three");
        assert_eq!(page.blocks.len(), 3);
        assert!(page.blocks.iter().all(|b| b.kind == BlockKind::ListItem));
        assert_eq!(page.blocks[2].text, "three");
    }

    // ── Options-driven artefacts ──────────────────────────────────────────

    #[test]
    fn page_image_retained_only_when_requested() {
        let raster = DynamicImage::ImageRgba8(RgbaImage::new(100, 100));
        let source = PageImage::new(0, raster, None);
        let raw = RawPageOutput {
            format: ResponseFormat::DocTags,
            content: "<doctag><text>x</text></doctag>".into(),
        };

        let (plain, _) = assemble_page(&source, &raw, &PipelineOptions::default());
        assert!(plain.image.is_none());

        let keep = PipelineOptions::builder()
            .generate_page_images(true)
            .build()
            .unwrap();
        let (kept, _) = assemble_page(&source, &raw, &keep);
        assert!(kept.image.is_some());
    }

    #[test]
    fn figure_crops_attached_when_requested() {
        let raster = DynamicImage::ImageRgba8(RgbaImage::new(100, 100));
        let source = PageImage::new(0, raster, None);
        let raw = RawPageOutput {
            format: ResponseFormat::DocTags,
            content:
                "<doctag><picture><loc_10><loc_10><loc_50><loc_60></picture></doctag>"
                    .into(),
        };
        let options = PipelineOptions::builder()
            .generate_picture_images(true)
            .build()
            .unwrap();
        let (page, _) = assemble_page(&source, &raw, &options);
        let crop = page.figures[0].image.as_ref().unwrap();
        assert_eq!((crop.width(), crop.height()), (40, 50));
    }
}
