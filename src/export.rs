//! Markdown export: deterministic rendering of a [`Document`].
//!
//! A pure function over the model — no I/O, no mutation, byte-identical
//! output for equal input. Rendering rules are fixed per entity kind so the
//! exporter never needs configuration: pipeline options influence what ends
//! up *in* the model, never how the model is written out.

use crate::document::{Block, BlockKind, Document, Figure, ItemRef, Page, Table};

/// Render the document to Markdown.
///
/// Pages are emitted in order and joined with a blank line; entities within
/// a page follow [`Page::items`] reading order. Tables render as GFM pipe
/// grids, figures as an `<!-- image -->` placeholder plus italic caption.
pub fn export_to_markdown(doc: &Document) -> String {
    let mut parts: Vec<String> = Vec::new();

    for page in &doc.pages {
        let rendered = render_page(page);
        if !rendered.is_empty() {
            parts.push(rendered);
        }
    }

    if parts.is_empty() {
        return String::new();
    }
    let mut out = parts.join("\n\n");
    out.push('\n');
    out
}

fn render_page(page: &Page) -> String {
    let mut parts: Vec<String> = Vec::new();

    for item in &page.items {
        let rendered = match item {
            ItemRef::Block(i) => page.blocks.get(*i).map(render_block),
            ItemRef::Table(i) => page.tables.get(*i).map(render_table),
            ItemRef::Figure(i) => page.figures.get(*i).map(render_figure),
        };
        if let Some(text) = rendered {
            if !text.is_empty() {
                parts.push(text);
            }
        }
    }

    parts.join("\n\n")
}

fn render_block(block: &Block) -> String {
    match block.kind {
        BlockKind::Title => format!("# {}", block.text),
        BlockKind::SectionHeader => format!("## {}", block.text),
        BlockKind::Paragraph => block.text.clone(),
        BlockKind::ListItem => format!("- {}", block.text),
        BlockKind::Code => format!("```\n{}\n```", block.text),
        BlockKind::Formula => format!("$${}$$", block.text),
    }
}

/// GFM pipe table: header row, separator row, body rows. Pipes inside cell
/// text are escaped so cell boundaries stay unambiguous.
fn render_table(table: &Table) -> String {
    if table.num_rows == 0 || table.num_cols == 0 {
        return String::new();
    }

    let mut lines: Vec<String> = Vec::with_capacity(table.num_rows + 2);
    for row in 0..table.num_rows {
        let cells: Vec<String> = (0..table.num_cols)
            .map(|col| table.cell(row, col).replace('|', "\\|"))
            .collect();
        lines.push(format!("| {} |", cells.join(" | ")));
        if row == 0 {
            let sep: Vec<&str> = (0..table.num_cols).map(|_| "---").collect();
            lines.push(format!("| {} |", sep.join(" | ")));
        }
    }

    let mut out = lines.join("\n");
    if let Some(ref caption) = table.caption {
        out.push_str(&format!("\n\n*{}*", caption));
    }
    out
}

fn render_figure(figure: &Figure) -> String {
    match figure.caption {
        Some(ref caption) if !caption.is_empty() => {
            format!("<!-- image -->\n\n*{}*", caption)
        }
        _ => "<!-- image -->".to_string(),
    }
}
