//! The conversion pipeline: one input in, one document model out.
//!
//! A [`Pipeline`] binds one backend adapter and one immutable
//! [`PipelineOptions`] to a fixed stage order:
//!
//! ```text
//! input ──▶ rasterize ──▶ infer ──▶ assemble ──▶ finalize
//! (path)    (pdfium /     (backend  (parse raw    (pages →
//!            image)        adapter)  output)       Document)
//! ```
//!
//! Stages run sequentially within one conversion; the infer stage fans out
//! across pages up to `options.concurrency`. A shared cancel flag is checked
//! before each stage — cancellation between stages is prompt, cancellation
//! mid-inference is backend-dependent and not guaranteed.
//!
//! Pipelines are stateless across conversions apart from the backend's
//! process-wide model cache, so one `Pipeline` can serve concurrent calls.

pub(crate) mod assemble;
pub(crate) mod encode;
pub(crate) mod input;
pub mod rasterize;

use crate::backend::{self, BackendKind, PageBackend, RawPageOutput};
use crate::document::Document;
use crate::error::ConvertError;
use crate::format::InputFormat;
use crate::options::PipelineOptions;
use futures::stream::{self, StreamExt};
use rasterize::PageImage;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Wall-clock spent per stage, reported on
/// [`crate::converter::ConversionStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimings {
    pub rasterize_ms: u64,
    pub infer_ms: u64,
}

/// A named, ordered sequence of processing stages bound to one backend
/// adapter and one options value.
pub struct Pipeline {
    backend: Arc<dyn PageBackend>,
    options: PipelineOptions,
}

impl Pipeline {
    /// Build a pipeline for one of the built-in backend kinds.
    pub fn new(kind: BackendKind, options: PipelineOptions) -> Self {
        Self {
            backend: backend::create_backend(kind),
            options,
        }
    }

    /// Build a pipeline around a caller-supplied adapter.
    pub fn with_backend(backend: Arc<dyn PageBackend>, options: PipelineOptions) -> Self {
        Self { backend, options }
    }

    pub fn backend(&self) -> &dyn PageBackend {
        self.backend.as_ref()
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run all four stages against a resolved local input.
    pub async fn execute(
        &self,
        path: &Path,
        format: InputFormat,
        cancel: Option<&AtomicBool>,
    ) -> Result<(Document, StageTimings), ConvertError> {
        check_cancel(cancel, "rasterize")?;

        let rasterize_start = Instant::now();
        let pages = rasterize::rasterize(path, format, &self.options).await?;
        let rasterize_ms = rasterize_start.elapsed().as_millis() as u64;
        info!("rasterised {} page(s) in {}ms", pages.len(), rasterize_ms);

        let (document, infer_ms) = self.process_pages(pages, cancel).await?;
        Ok((
            document,
            StageTimings {
                rasterize_ms,
                infer_ms,
            },
        ))
    }

    /// Stages 2–4: infer, assemble, finalize.
    pub(crate) async fn process_pages(
        &self,
        pages: Vec<PageImage>,
        cancel: Option<&AtomicBool>,
    ) -> Result<(Document, u64), ConvertError> {
        check_cancel(cancel, "infer")?;

        let infer_start = Instant::now();
        let raw_outputs = self.infer_all(&pages).await?;
        let infer_ms = infer_start.elapsed().as_millis() as u64;

        check_cancel(cancel, "assemble")?;

        let mut assembled = Vec::with_capacity(pages.len());
        let mut skipped_units = 0usize;
        for page_image in &pages {
            let raw = raw_outputs
                .get(&page_image.index)
                .ok_or_else(|| ConvertError::Internal("missing inference output".into()))?;
            let (page, skipped) = assemble::assemble_page(page_image, raw, &self.options);
            skipped_units += skipped;
            assembled.push(page);
        }

        check_cancel(cancel, "finalize")?;

        // Source page order, regardless of inference completion order.
        assembled.sort_by_key(|p| p.index);
        debug!(
            "assembled {} page(s), {} skipped unit(s)",
            assembled.len(),
            skipped_units
        );

        Ok((
            Document {
                pages: assembled,
                skipped_units,
            },
            infer_ms,
        ))
    }

    /// Fan the infer stage out across pages, bounded by
    /// `options.concurrency`. Fails with the lowest-page error when any
    /// page fails, so errors are deterministic under concurrency.
    async fn infer_all(
        &self,
        pages: &[PageImage],
    ) -> Result<BTreeMap<usize, RawPageOutput>, ConvertError> {
        let options = &self.options;
        let backend = &self.backend;

        let results: Vec<(usize, Result<RawPageOutput, ConvertError>)> =
            stream::iter(pages.iter().map(|page| async move {
                (page.index, backend.infer(page, options).await)
            }))
            .buffer_unordered(options.concurrency)
            .collect()
            .await;

        let mut outputs = BTreeMap::new();
        let mut first_error: Option<(usize, ConvertError)> = None;
        for (index, result) in results {
            match result {
                Ok(raw) => {
                    outputs.insert(index, raw);
                }
                Err(e) => {
                    if first_error.as_ref().map_or(true, |(i, _)| index < *i) {
                        first_error = Some((index, e));
                    }
                }
            }
        }
        if let Some((_, e)) = first_error {
            return Err(e);
        }
        Ok(outputs)
    }
}

fn check_cancel(cancel: Option<&AtomicBool>, stage: &'static str) -> Result<(), ConvertError> {
    if let Some(flag) = cancel {
        if flag.load(Ordering::Relaxed) {
            return Err(ConvertError::Cancelled { stage });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::PipelineOptions;

    fn layout_pipeline() -> Pipeline {
        Pipeline::new(BackendKind::Layout, PipelineOptions::default())
    }

    fn text_page(index: usize, text: &str) -> PageImage {
        PageImage::from_text(index, 2048, 2048, text)
    }

    #[tokio::test]
    async fn empty_input_yields_zero_page_document() {
        let (doc, _) = layout_pipeline()
            .process_pages(Vec::new(), None)
            .await
            .unwrap();
        assert!(doc.pages.is_empty());
        assert_eq!(doc.skipped_units, 0);
    }

    #[tokio::test]
    async fn three_text_pages_in_source_order() {
        let pages = vec![
            text_page(0, "First page body."),
            text_page(1, "Second page body."),
            text_page(2, "Third page body."),
        ];
        let (doc, _) = layout_pipeline().process_pages(pages, None).await.unwrap();

        assert_eq!(doc.pages.len(), 3);
        for (i, page) in doc.pages.iter().enumerate() {
            assert_eq!(page.index, i);
        }
        assert_eq!(doc.num_tables(), 0);
        assert_eq!(doc.num_figures(), 0);

        let md = doc.export_to_markdown();
        let first = md.find("First page body.").unwrap();
        let second = md.find("Second page body.").unwrap();
        let third = md.find("Third page body.").unwrap();
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn single_page_with_table() {
        let pages = vec![text_page(
            0,
            "Quarterly Figures\n\n| Region | Sales |\n| --- | --- |\n| North | 120 |",
        )];
        let (doc, _) = layout_pipeline().process_pages(pages, None).await.unwrap();

        assert_eq!(doc.pages.len(), 1);
        assert_eq!(doc.pages[0].tables.len(), 1);

        let md = doc.export_to_markdown();
        assert!(md.contains("| Region | Sales |"), "got: {md}");
        assert!(md.contains("| --- | --- |"));
        assert!(md.contains("| North | 120 |"));
    }

    #[tokio::test]
    async fn cancellation_observed_before_infer() {
        let flag = AtomicBool::new(true);
        let err = layout_pipeline()
            .process_pages(vec![text_page(0, "body")], Some(&flag))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Cancelled { stage: "infer" }));
    }

    #[tokio::test]
    async fn conversion_is_deterministic_with_layout_backend() {
        let text = "Report Title\n\nSome body text.\n\n- alpha\n- beta";
        let run = |_: ()| async {
            let (doc, _) = layout_pipeline()
                .process_pages(vec![text_page(0, text)], None)
                .await
                .unwrap();
            doc.export_to_markdown()
        };
        assert_eq!(run(()).await, run(()).await);
    }
}
