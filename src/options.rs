//! Pipeline configuration.
//!
//! All per-pipeline behaviour is controlled through [`PipelineOptions`],
//! built via [`PipelineOptionsBuilder`]. The value is immutable once
//! constructed and owned by the [`crate::pipeline::Pipeline`] built with it,
//! so two conversions through the same pipeline can never observe different
//! configuration.
//!
//! # Design choice: builder over constructor
//! A dozen-field constructor breaks on every new field. The builder lets
//! callers set only what they care about and rely on documented defaults
//! for the rest; validation happens once, in `build()`.

use crate::error::ConvertError;
use serde::{Deserialize, Serialize};

/// Longest-edge pixel size a page rasterises to at `images_scale = 1.0`.
///
/// `images_scale` multiplies this baseline, so `0.25` targets a 512 px
/// longest edge — the input size expected by small document-understanding
/// VLMs such as SmolDocling.
pub const RASTER_BASELINE_PX: u32 = 2048;

/// Default instruction sent to a VLM backend with each page image.
pub const DEFAULT_PROMPT: &str = "Convert this page to doctags.";

/// Grammar of the raw output a backend produces, and therefore the parser
/// the assemble stage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseFormat {
    /// Structured tag format: `<doctag><text>…</text>…</doctag>`, with
    /// OTSL-style tables. Produced by the layout backend and by
    /// document-specialised VLMs. (default)
    #[default]
    DocTags,
    /// Free Markdown text, segmented heuristically during assembly.
    /// Produced by general-purpose VLMs.
    Markdown,
}

/// Which inference stack serves the model. A load-path tag only: it is logged
/// when a model is first loaded and has no effect on pipeline or orchestrator
/// contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InferenceFramework {
    #[default]
    Transformers,
    Mlx,
}

/// Immutable configuration for one pipeline.
///
/// # Example
/// ```rust
/// use docmill::{PipelineOptions, ResponseFormat};
///
/// let options = PipelineOptions::builder()
///     .images_scale(0.25)
///     .repo_id("ds4sd/SmolDocling-256M-preview")
///     .prompt("Convert this page to doctags.")
///     .response_format(ResponseFormat::DocTags)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Multiplier against [`RASTER_BASELINE_PX`] for the rasterised page's
    /// longest edge. Must be > 0. Default: 1.0.
    ///
    /// The orchestrator compares the resulting size against the bound
    /// backend's preferred resolution and warns on mismatch — the conversion
    /// still runs, but backend accuracy degrades away from the preferred
    /// size.
    pub images_scale: f32,

    /// Hard cap on the rasterised longest edge in pixels. Default: 4096.
    ///
    /// Independent safety net: an A0 poster at a large scale could otherwise
    /// allocate hundreds of megapixels.
    pub max_rendered_pixels: u32,

    /// Which raw-output grammar the assemble stage parses. Default: DocTags.
    pub response_format: ResponseFormat,

    /// Inference stack tag; affects the model load path only. Default: Transformers.
    pub inference_framework: InferenceFramework,

    /// Load a pre-quantised model variant. Part of the model cache key.
    /// Default: false.
    pub quantized: bool,

    /// Load weights in 8-bit precision. Part of the model cache key.
    /// Default: false.
    pub load_in_8bit: bool,

    /// Retain each page's raster image on the document model after assembly.
    /// Memory trade-off only; markdown output is unaffected. Default: false.
    pub generate_page_images: bool,

    /// Retain cropped figure images on the document model (requires figure
    /// bounding boxes from the backend). Default: false.
    pub generate_picture_images: bool,

    /// Model repository identifier for the VLM backend,
    /// e.g. `"ds4sd/SmolDocling-256M-preview"`.
    pub repo_id: String,

    /// Instruction sent alongside each page image to the VLM backend.
    pub prompt: String,

    /// Sampling temperature for generative backends. Low values keep the
    /// model faithful to the page. Default: 0.1.
    pub temperature: f32,

    /// Token budget per page for generative backends. Default: 4096.
    pub max_tokens: usize,

    /// Maximum in-flight backend calls within one conversion. Default: 4.
    pub concurrency: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            images_scale: 1.0,
            max_rendered_pixels: 4096,
            response_format: ResponseFormat::default(),
            inference_framework: InferenceFramework::default(),
            quantized: false,
            load_in_8bit: false,
            generate_page_images: false,
            generate_picture_images: false,
            repo_id: "ds4sd/SmolDocling-256M-preview".to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            temperature: 0.1,
            max_tokens: 4096,
            concurrency: 4,
        }
    }
}

impl PipelineOptions {
    /// Create a new builder for `PipelineOptions`.
    pub fn builder() -> PipelineOptionsBuilder {
        PipelineOptionsBuilder {
            options: Self::default(),
        }
    }

    /// Longest-edge pixel target the rasterise stage aims for with these
    /// options: `RASTER_BASELINE_PX × images_scale`, capped by
    /// `max_rendered_pixels`, floored at 32 px.
    pub fn target_edge_px(&self) -> u32 {
        let scaled = (RASTER_BASELINE_PX as f32 * self.images_scale).round() as u32;
        scaled.clamp(32, self.max_rendered_pixels)
    }
}

/// Builder for [`PipelineOptions`].
#[derive(Debug)]
pub struct PipelineOptionsBuilder {
    options: PipelineOptions,
}

impl PipelineOptionsBuilder {
    pub fn images_scale(mut self, scale: f32) -> Self {
        self.options.images_scale = scale;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.options.max_rendered_pixels = px;
        self
    }

    pub fn response_format(mut self, format: ResponseFormat) -> Self {
        self.options.response_format = format;
        self
    }

    pub fn inference_framework(mut self, framework: InferenceFramework) -> Self {
        self.options.inference_framework = framework;
        self
    }

    pub fn quantized(mut self, v: bool) -> Self {
        self.options.quantized = v;
        self
    }

    pub fn load_in_8bit(mut self, v: bool) -> Self {
        self.options.load_in_8bit = v;
        self
    }

    pub fn generate_page_images(mut self, v: bool) -> Self {
        self.options.generate_page_images = v;
        self
    }

    pub fn generate_picture_images(mut self, v: bool) -> Self {
        self.options.generate_picture_images = v;
        self
    }

    pub fn repo_id(mut self, repo_id: impl Into<String>) -> Self {
        self.options.repo_id = repo_id.into();
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.prompt = prompt.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.options.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.options.max_tokens = n;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.options.concurrency = n.max(1);
        self
    }

    /// Build the options, validating constraints.
    pub fn build(self) -> Result<PipelineOptions, ConvertError> {
        let o = &self.options;
        if !(o.images_scale > 0.0) || !o.images_scale.is_finite() {
            return Err(ConvertError::InvalidConfig(format!(
                "images_scale must be a positive finite number, got {}",
                o.images_scale
            )));
        }
        if o.max_rendered_pixels < 32 {
            return Err(ConvertError::InvalidConfig(format!(
                "max_rendered_pixels must be ≥ 32, got {}",
                o.max_rendered_pixels
            )));
        }
        if o.repo_id.is_empty() {
            return Err(ConvertError::InvalidConfig("repo_id must not be empty".into()));
        }
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let o = PipelineOptions::builder().build().unwrap();
        assert_eq!(o.images_scale, 1.0);
        assert_eq!(o.response_format, ResponseFormat::DocTags);
        assert!(!o.quantized);
        assert_eq!(o.target_edge_px(), RASTER_BASELINE_PX);
    }

    #[test]
    fn rejects_non_positive_scale() {
        assert!(PipelineOptions::builder().images_scale(0.0).build().is_err());
        assert!(PipelineOptions::builder().images_scale(-1.0).build().is_err());
        assert!(PipelineOptions::builder()
            .images_scale(f32::NAN)
            .build()
            .is_err());
    }

    #[test]
    fn target_edge_scales_and_caps() {
        let o = PipelineOptions::builder().images_scale(0.25).build().unwrap();
        assert_eq!(o.target_edge_px(), 512);

        let capped = PipelineOptions::builder()
            .images_scale(8.0)
            .max_rendered_pixels(4096)
            .build()
            .unwrap();
        assert_eq!(capped.target_edge_px(), 4096);

        let floored = PipelineOptions::builder()
            .images_scale(0.001)
            .build()
            .unwrap();
        assert_eq!(floored.target_edge_px(), 32);
    }

    #[test]
    fn rejects_empty_repo_id() {
        assert!(PipelineOptions::builder().repo_id("").build().is_err());
    }

    #[test]
    fn concurrency_floored_at_one() {
        let o = PipelineOptions::builder().concurrency(0).build().unwrap();
        assert_eq!(o.concurrency, 1);
    }
}
