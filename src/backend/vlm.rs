//! Vision-language-model backend.
//!
//! Drives a document-understanding VLM through the edgequake-llm provider
//! layer. Each `infer` sends one chat request: a system instruction
//! (`options.prompt`) plus the page image as a base64 PNG attachment. The
//! provider handle is loaded once per `(repo_id, quantization)` key into the
//! process-wide cache ([`crate::backend::cache`]).
//!
//! There is deliberately no retry loop here: a failed inference surfaces as
//! [`ConvertError::Backend`] and the orchestrator's one-shot fallback is the
//! only recovery path. Generation is temperature-controlled, so output is
//! best-effort reproducible rather than strictly deterministic.

use crate::backend::{cache, check_dimensions, BackendKind, PageBackend, RawPageOutput};
use crate::error::ConvertError;
use crate::options::PipelineOptions;
use crate::pipeline::encode;
use crate::pipeline::rasterize::PageImage;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Vision-language-model adapter.
pub struct VlmBackend {
    /// Pre-built provider, bypassing the model cache. Used by callers that
    /// need custom transport middleware, and by tests.
    provider_override: Option<Arc<dyn LLMProvider>>,
}

impl VlmBackend {
    pub fn new() -> Self {
        Self {
            provider_override: None,
        }
    }

    /// Use a caller-constructed provider instead of the cached one.
    pub fn with_provider(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider_override: Some(provider),
        }
    }

    fn resolve_provider(
        &self,
        options: &PipelineOptions,
    ) -> Result<Arc<dyn LLMProvider>, ConvertError> {
        if let Some(ref provider) = self.provider_override {
            return Ok(Arc::clone(provider));
        }
        cache::provider_for(options)
    }
}

impl Default for VlmBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageBackend for VlmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vlm
    }

    fn preferred_resolution(&self) -> u32 {
        // SmolDocling-class models train at a 512 px longest edge.
        512
    }

    fn accepted_range(&self) -> RangeInclusive<u32> {
        64..=4096
    }

    async fn infer(
        &self,
        page: &PageImage,
        options: &PipelineOptions,
    ) -> Result<RawPageOutput, ConvertError> {
        check_dimensions(self, page)?;
        let page_num = page.index + 1;

        let img = page.image.as_ref().ok_or_else(|| ConvertError::Backend {
            page: page_num,
            detail: "no raster image available for VLM inference".into(),
        })?;

        let image_data = encode::encode_page(img).map_err(|e| ConvertError::Backend {
            page: page_num,
            detail: format!("image encoding failed: {e}"),
        })?;

        let provider = self.resolve_provider(options)?;

        let messages = vec![
            ChatMessage::system(options.prompt.as_str()),
            // The image carries all the content; APIs still require a user turn.
            ChatMessage::user_with_images("", vec![image_data]),
        ];
        let completion = CompletionOptions {
            temperature: Some(options.temperature),
            max_tokens: Some(options.max_tokens),
            ..Default::default()
        };

        let start = Instant::now();
        let response = provider
            .chat(&messages, Some(&completion))
            .await
            .map_err(|e| ConvertError::Backend {
                page: page_num,
                detail: format!("{e}"),
            })?;

        debug!(
            "page {}: {} input tokens, {} output tokens, {:?}",
            page_num,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        Ok(RawPageOutput {
            format: options.response_format,
            content: response.content,
        })
    }
}
