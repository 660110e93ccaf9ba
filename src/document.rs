//! The structured document model produced by a pipeline.
//!
//! A [`Document`] is created fresh per conversion and owned by the caller
//! afterwards — the library keeps no reference. Pages appear in source
//! order; within a page, [`Page::items`] records the backend's reading
//! order across blocks, tables, and figures.
//!
//! Raster images ([`Page::image`], [`Figure::image`]) exist only when the
//! pipeline was configured with `generate_page_images` /
//! `generate_picture_images`; they are skipped during serialisation.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned position of an entity on its page, in rasterised pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

/// Semantic class of a text block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Title,
    SectionHeader,
    Paragraph,
    ListItem,
    Code,
    Formula,
}

/// A contiguous run of text with one semantic class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    pub text: String,
    pub bbox: Option<BoundingBox>,
}

/// A table as a dense row-major cell grid.
///
/// `cells.len() == num_rows * num_cols`; ragged source rows are padded with
/// empty strings during assembly so the grid invariant always holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub num_rows: usize,
    pub num_cols: usize,
    pub cells: Vec<String>,
    pub caption: Option<String>,
    pub bbox: Option<BoundingBox>,
}

impl Table {
    /// Cell text at `(row, col)`, empty string when out of range.
    pub fn cell(&self, row: usize, col: usize) -> &str {
        if row < self.num_rows && col < self.num_cols {
            self.cells
                .get(row * self.num_cols + col)
                .map(String::as_str)
                .unwrap_or("")
        } else {
            ""
        }
    }
}

/// A figure or picture region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Figure {
    pub caption: Option<String>,
    pub bbox: Option<BoundingBox>,
    /// Cropped raster of the figure region; present only when the pipeline
    /// ran with `generate_picture_images` and the backend supplied a bbox.
    #[serde(skip)]
    pub image: Option<DynamicImage>,
}

/// Reading-order reference into one of a page's entity lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemRef {
    Block(usize),
    Table(usize),
    Figure(usize),
}

/// One page of the converted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// 0-indexed ordinal, equal to the page's position in the source input.
    pub index: usize,
    /// Rasterised page width in pixels.
    pub width: u32,
    /// Rasterised page height in pixels.
    pub height: u32,
    pub blocks: Vec<Block>,
    pub tables: Vec<Table>,
    pub figures: Vec<Figure>,
    /// Backend reading order over `blocks`/`tables`/`figures`.
    pub items: Vec<ItemRef>,
    /// Page raster retained when `generate_page_images` is set.
    #[serde(skip)]
    pub image: Option<DynamicImage>,
}

impl Page {
    pub(crate) fn new(index: usize, width: u32, height: u32) -> Self {
        Self {
            index,
            width,
            height,
            blocks: Vec::new(),
            tables: Vec::new(),
            figures: Vec::new(),
            items: Vec::new(),
            image: None,
        }
    }

    pub(crate) fn push_block(&mut self, block: Block) {
        self.items.push(ItemRef::Block(self.blocks.len()));
        self.blocks.push(block);
    }

    pub(crate) fn push_table(&mut self, table: Table) {
        self.items.push(ItemRef::Table(self.tables.len()));
        self.tables.push(table);
    }

    pub(crate) fn push_figure(&mut self, figure: Figure) {
        self.items.push(ItemRef::Figure(self.figures.len()));
        self.figures.push(figure);
    }
}

/// Root of the structured document model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    /// Pages in source order. An empty input yields an empty vector — not
    /// an error.
    pub pages: Vec<Page>,
    /// Units of raw backend output the assemble stage could not parse and
    /// skipped. Degraded-output diagnostic, not silent loss.
    pub skipped_units: usize,
}

impl Document {
    /// Total block count across all pages.
    pub fn num_blocks(&self) -> usize {
        self.pages.iter().map(|p| p.blocks.len()).sum()
    }

    /// Total table count across all pages.
    pub fn num_tables(&self) -> usize {
        self.pages.iter().map(|p| p.tables.len()).sum()
    }

    /// Total figure count across all pages.
    pub fn num_figures(&self) -> usize {
        self.pages.iter().map(|p| p.figures.len()).sum()
    }

    /// Render the document to Markdown. Pure and deterministic; see
    /// [`crate::export::export_to_markdown`].
    pub fn export_to_markdown(&self) -> String {
        crate::export::export_to_markdown(self)
    }

    /// Serialise the model (minus raster images) to a JSON string.
    pub fn to_json(&self) -> Result<String, crate::error::ConvertError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::ConvertError::Internal(format!("JSON export: {e}")))
    }
}
