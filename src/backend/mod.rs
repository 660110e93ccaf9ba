//! Backend adapters: one extraction technology behind one capability trait.
//!
//! The backend set is closed — variants are selected through [`BackendKind`]
//! at pipeline construction time rather than open-ended dynamic registration.
//! Adding a technology means adding a variant and an adapter module:
//!
//! * [`layout`] — rule-based layout analysis over the extracted text layer.
//!   Deterministic, no model, no network.
//! * [`vlm`] — vision-language-model inference through the edgequake-llm
//!   provider layer, with a process-wide model cache ([`cache`]).
//!
//! The contract is page-granular: the pipeline hands the adapter one
//! already-scaled page image and gets back raw output in a declared grammar.
//! Scaling is deliberately the pipeline's job, so adapters can stay stateless
//! and the preferred-resolution check lives in exactly one place (the
//! orchestrator).

pub mod cache;
pub mod layout;
pub mod vlm;

use crate::error::ConvertError;
use crate::options::{PipelineOptions, ResponseFormat};
use crate::pipeline::rasterize::PageImage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Selector for the closed set of backend adapter variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Rule-based layout analysis (default pipeline's backend).
    Layout,
    /// Vision-language model.
    Vlm,
}

/// Raw, backend-specific output for one page, tagged with the grammar the
/// assemble stage must parse it with.
#[derive(Debug, Clone)]
pub struct RawPageOutput {
    pub format: ResponseFormat,
    pub content: String,
}

/// Capability interface over one extraction technology.
///
/// Implementations must be `Send + Sync`: one adapter instance is shared by
/// every conversion running through its pipeline, and page-level `infer`
/// calls may run concurrently. Adapters hold no per-conversion state; the
/// only shared mutable state is the process-wide model cache, which is
/// guarded in [`cache`].
#[async_trait]
pub trait PageBackend: Send + Sync {
    /// Which variant this adapter is.
    fn kind(&self) -> BackendKind;

    /// Longest-edge pixel size this backend performs best at. The
    /// orchestrator warns when the pipeline's raster target drifts from
    /// this; it never fails the conversion.
    fn preferred_resolution(&self) -> u32;

    /// Hard longest-edge limits. Images outside this range fail `infer`
    /// with [`ConvertError::UnsupportedInput`].
    fn accepted_range(&self) -> RangeInclusive<u32> {
        32..=8192
    }

    /// Produce raw structured output for one page.
    ///
    /// The page image must already be scaled by the caller. May lazily load
    /// a model into the process-wide cache on first call (disk or network
    /// I/O); subsequent calls reuse the cached model.
    async fn infer(
        &self,
        page: &PageImage,
        options: &PipelineOptions,
    ) -> Result<RawPageOutput, ConvertError>;
}

/// Instantiate the adapter for a kind.
pub(crate) fn create_backend(kind: BackendKind) -> Arc<dyn PageBackend> {
    match kind {
        BackendKind::Layout => Arc::new(layout::LayoutBackend::new()),
        BackendKind::Vlm => Arc::new(vlm::VlmBackend::new()),
    }
}

/// Shared precondition check: fail with `UnsupportedInput` when the page's
/// longest edge misses the adapter's hard limits.
pub(crate) fn check_dimensions(
    backend: &dyn PageBackend,
    page: &PageImage,
) -> Result<(), ConvertError> {
    let range = backend.accepted_range();
    let edge = page.width.max(page.height);
    if !range.contains(&edge) {
        return Err(ConvertError::UnsupportedInput {
            page: page.index + 1,
            width: page.width,
            height: page.height,
            min: *range.start(),
            max: *range.end(),
            backend: backend.kind(),
        });
    }
    Ok(())
}
