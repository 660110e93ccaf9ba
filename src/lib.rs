//! # docmill
//!
//! Convert PDFs and page images into a structured document model, then
//! export deterministic Markdown.
//!
//! ```text
//! Input (path / URL / bytes)
//!        |
//!        v
//!   [ rasterize ]  pdfium or the image crate, one raster per page
//!        |
//!        v
//!   [ infer ]      page backend (rule-based layout, or a VLM such as
//!        |         SmolDocling via an LLM provider), bounded concurrency
//!        v
//!   [ assemble ]   DocTags / Markdown parsing into typed pages
//!        |
//!        v
//!   [ finalize ]   Document { pages, blocks, tables, figures }
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use docmill::DocumentConverter;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let converter = DocumentConverter::new();
//! let result = converter.convert("paper.pdf").await?;
//! println!("{}", result.document.export_to_markdown());
//! # Ok(())
//! # }
//! ```
//!
//! By default every format runs a minimal rule-based pipeline. Bind a
//! VLM-backed pipeline to a format when you want model-grade structure
//! recovery:
//!
//! ```rust,no_run
//! use docmill::{BackendKind, DocumentConverter, FormatOption, InputFormat, PipelineOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = PipelineOptions::builder()
//!     .images_scale(0.25)
//!     .build()?;
//! let converter = DocumentConverter::builder()
//!     .format_option(InputFormat::Pdf, FormatOption::new(BackendKind::Vlm, options))
//!     .build();
//! let result = converter.convert("paper.pdf").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Model providers are resolved once per `(repo_id, quantization)` and
//! cached process-wide; see [`clear_provider_cache`] for explicit eviction.

pub mod backend;
pub mod converter;
pub mod document;
pub mod error;
pub mod export;
pub mod format;
pub mod options;
pub mod pipeline;

pub use backend::cache::{clear_provider_cache, provider_cache_len};
pub use backend::{BackendKind, PageBackend, RawPageOutput};
pub use converter::{
    ConversionResult, ConversionStats, DocumentConverter, DocumentConverterBuilder,
    FallbackReport, FormatOption,
};
pub use document::{
    Block, BlockKind, BoundingBox, Document, Figure, ItemRef, Page, Table,
};
pub use error::ConvertError;
pub use export::export_to_markdown;
pub use format::{detect_format, InputFormat};
pub use options::{
    InferenceFramework, PipelineOptions, PipelineOptionsBuilder, ResponseFormat,
    RASTER_BASELINE_PX,
};
pub use pipeline::rasterize::PageImage;
pub use pipeline::{Pipeline, StageTimings};
