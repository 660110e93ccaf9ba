//! The conversion orchestrator.
//!
//! [`DocumentConverter`] owns one pipeline per bound input format plus a
//! default minimal pipeline (rule-based layout backend, default options)
//! for everything else. `convert` detects the input's format, picks the
//! pipeline, and runs it.
//!
//! ## Fallback policy
//!
//! When a *non-default* pipeline fails in the infer or rasterize stage, the
//! same input is retried through the default pipeline exactly once. The
//! retry is never recursive and never silent: a successful fallback is
//! recorded on the result ([`ConversionResult::fallback`], carrying the
//! original error), and a failed one surfaces both errors as
//! [`ConvertError::FallbackFailed`]. Beyond this single attempt the library
//! never re-runs inference on its own — a model call is too expensive to
//! retry speculatively.

use crate::backend::{BackendKind, PageBackend};
use crate::document::Document;
use crate::error::ConvertError;
use crate::format::{self, InputFormat};
use crate::options::PipelineOptions;
use crate::pipeline::{input, Pipeline, StageTimings};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Raster-target drift beyond ±25% of the backend's preferred resolution
/// counts as a mismatch (warned, never fatal).
const RESOLUTION_TOLERANCE: f32 = 0.25;

/// Per-format pipeline binding: which backend runs and with which options.
pub struct FormatOption {
    backend: BackendSpec,
    options: PipelineOptions,
}

enum BackendSpec {
    Kind(BackendKind),
    Custom(Arc<dyn PageBackend>),
}

impl FormatOption {
    /// Bind one of the built-in backend kinds.
    pub fn new(kind: BackendKind, options: PipelineOptions) -> Self {
        Self {
            backend: BackendSpec::Kind(kind),
            options,
        }
    }

    /// Bind a caller-constructed adapter (custom middleware, tests).
    pub fn with_backend(backend: Arc<dyn PageBackend>, options: PipelineOptions) -> Self {
        Self {
            backend: BackendSpec::Custom(backend),
            options,
        }
    }

    fn into_pipeline(self) -> Pipeline {
        match self.backend {
            BackendSpec::Kind(kind) => Pipeline::new(kind, self.options),
            BackendSpec::Custom(backend) => Pipeline::with_backend(backend, self.options),
        }
    }
}

/// Counters and timings for one conversion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionStats {
    pub pages: usize,
    pub blocks: usize,
    pub tables: usize,
    pub figures: usize,
    pub skipped_units: usize,
    pub rasterize_ms: u64,
    pub infer_ms: u64,
    pub total_ms: u64,
    /// The pipeline's raster target drifted from the backend's preferred
    /// resolution. Accuracy warning only; the conversion still ran.
    pub resolution_mismatch: bool,
}

/// Record that the default pipeline salvaged a failed conversion.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackReport {
    /// Display form of the bound pipeline's error.
    pub original_error: String,
}

/// A successful conversion: the document plus execution diagnostics.
#[derive(Debug)]
pub struct ConversionResult {
    pub document: Document,
    pub stats: ConversionStats,
    /// Present when the default pipeline produced this result after the
    /// bound pipeline failed.
    pub fallback: Option<FallbackReport>,
}

/// Converts input documents into [`Document`] models.
///
/// # Example
/// ```rust,no_run
/// use docmill::{BackendKind, DocumentConverter, FormatOption, InputFormat, PipelineOptions};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let options = PipelineOptions::builder()
///     .images_scale(0.25)
///     .repo_id("ds4sd/SmolDocling-256M-preview")
///     .build()?;
///
/// let converter = DocumentConverter::builder()
///     .format_option(InputFormat::Pdf, FormatOption::new(BackendKind::Vlm, options))
///     .build();
///
/// let result = converter.convert("report.pdf").await?;
/// println!("{}", result.document.export_to_markdown());
/// # Ok(())
/// # }
/// ```
pub struct DocumentConverter {
    pipelines: HashMap<InputFormat, Arc<Pipeline>>,
    default_pipeline: Arc<Pipeline>,
    cancel: Option<Arc<AtomicBool>>,
    download_timeout_secs: u64,
}

impl Default for DocumentConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentConverter {
    /// A converter with no bindings: every format runs the default minimal
    /// pipeline.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> DocumentConverterBuilder {
        DocumentConverterBuilder {
            format_options: HashMap::new(),
            cancel: None,
            download_timeout_secs: 120,
        }
    }

    /// Convert a local file or HTTP/HTTPS URL.
    pub async fn convert(
        &self,
        input: impl AsRef<str>,
    ) -> Result<ConversionResult, ConvertError> {
        let total_start = Instant::now();
        let input = input.as_ref();
        info!("starting conversion: {}", input);

        let resolved = input::resolve_input(input, self.download_timeout_secs).await?;
        let path = resolved.path();
        let format = format::detect_format(path)?;
        info!("detected format: {}", format);

        let pipeline = self
            .pipelines
            .get(&format)
            .unwrap_or(&self.default_pipeline);
        let mismatch = check_resolution(pipeline);

        let cancel = self.cancel.as_deref();
        match pipeline.execute(path, format, cancel).await {
            Ok((document, timings)) => Ok(finish(
                document, timings, mismatch, None, total_start,
            )),
            Err(original) => {
                let is_default = Arc::ptr_eq(pipeline, &self.default_pipeline);
                if is_default || !original.is_fallback_eligible() {
                    return Err(original);
                }

                warn!(
                    "bound pipeline failed ({original}); retrying once through the default pipeline"
                );
                match self.default_pipeline.execute(path, format, cancel).await {
                    Ok((document, timings)) => {
                        let mismatch = check_resolution(&self.default_pipeline);
                        Ok(finish(
                            document,
                            timings,
                            mismatch,
                            Some(FallbackReport {
                                original_error: original.to_string(),
                            }),
                            total_start,
                        ))
                    }
                    Err(fallback) => Err(ConvertError::FallbackFailed {
                        original: Box::new(original),
                        fallback: Box::new(fallback),
                    }),
                }
            }
        }
    }

    /// Convert in-memory bytes without the caller touching the filesystem.
    ///
    /// The bytes are written to a managed tempfile that is removed when the
    /// conversion returns.
    pub async fn convert_from_bytes(
        &self,
        bytes: &[u8],
    ) -> Result<ConversionResult, ConvertError> {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new()
            .map_err(|e| ConvertError::Internal(format!("tempfile: {e}")))?;
        tmp.write_all(bytes)
            .map_err(|e| ConvertError::Internal(format!("tempfile write: {e}")))?;
        let path = tmp.path().to_string_lossy().to_string();
        // `tmp` is dropped (and the file deleted) when `convert` returns.
        self.convert(&path).await
    }

    /// Convert and write the Markdown export to `output_path`.
    ///
    /// Atomic write (temp file + rename) so a crash never leaves a partial
    /// export behind.
    pub async fn convert_to_file(
        &self,
        input: impl AsRef<str>,
        output_path: impl AsRef<Path>,
    ) -> Result<ConversionStats, ConvertError> {
        let result = self.convert(input).await?;
        let markdown = result.document.export_to_markdown();
        let path = output_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ConvertError::OutputWriteFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;
        }

        let tmp_path = path.with_extension("md.tmp");
        tokio::fs::write(&tmp_path, &markdown)
            .await
            .map_err(|e| ConvertError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| ConvertError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        Ok(result.stats)
    }
}

/// Warn when the pipeline's raster target drifts from the bound backend's
/// preferred resolution. Returns whether a mismatch was recorded.
fn check_resolution(pipeline: &Pipeline) -> bool {
    let target = pipeline.options().target_edge_px() as f32;
    let preferred = pipeline.backend().preferred_resolution() as f32;
    let ratio = target / preferred;
    if !(1.0 - RESOLUTION_TOLERANCE..=1.0 + RESOLUTION_TOLERANCE).contains(&ratio) {
        warn!(
            "raster target {}px drifts from the {:?} backend's preferred {}px; \
             accuracy may degrade (adjust images_scale)",
            target as u32,
            pipeline.backend().kind(),
            preferred as u32
        );
        return true;
    }
    false
}

fn finish(
    document: Document,
    timings: StageTimings,
    resolution_mismatch: bool,
    fallback: Option<FallbackReport>,
    total_start: Instant,
) -> ConversionResult {
    let stats = ConversionStats {
        pages: document.pages.len(),
        blocks: document.num_blocks(),
        tables: document.num_tables(),
        figures: document.num_figures(),
        skipped_units: document.skipped_units,
        rasterize_ms: timings.rasterize_ms,
        infer_ms: timings.infer_ms,
        total_ms: total_start.elapsed().as_millis() as u64,
        resolution_mismatch,
    };
    info!(
        "conversion complete: {} page(s), {} table(s), {} figure(s), {}ms",
        stats.pages, stats.tables, stats.figures, stats.total_ms
    );
    ConversionResult {
        document,
        stats,
        fallback,
    }
}

/// Builder for [`DocumentConverter`].
pub struct DocumentConverterBuilder {
    format_options: HashMap<InputFormat, FormatOption>,
    cancel: Option<Arc<AtomicBool>>,
    download_timeout_secs: u64,
}

impl DocumentConverterBuilder {
    /// Bind a pipeline to an input format. Unbound formats use the default
    /// minimal pipeline.
    pub fn format_option(mut self, format: InputFormat, option: FormatOption) -> Self {
        self.format_options.insert(format, option);
        self
    }

    /// Shared cooperative-cancellation flag, checked between pipeline
    /// stages of every conversion run through this converter.
    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Timeout for URL-input downloads. Default: 120s.
    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.download_timeout_secs = secs;
        self
    }

    /// Construct the converter; pipelines are built eagerly here.
    pub fn build(self) -> DocumentConverter {
        let pipelines = self
            .format_options
            .into_iter()
            .map(|(format, option)| (format, Arc::new(option.into_pipeline())))
            .collect();

        DocumentConverter {
            pipelines,
            default_pipeline: Arc::new(Pipeline::new(
                BackendKind::Layout,
                PipelineOptions::default(),
            )),
            cancel: self.cancel,
            download_timeout_secs: self.download_timeout_secs,
        }
    }
}
