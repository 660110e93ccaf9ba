//! Rasterise stage: split the input into per-page images.
//!
//! PDFs go through pdfium inside `spawn_blocking` — the pdfium C++ library
//! keeps thread-local state and must not run on Tokio worker threads. The
//! page text layer is extracted in the same pass so the rule-based backend
//! never has to reopen the document. Raster images (PNG/JPEG) decode to a
//! single page with no text layer.
//!
//! The longest-edge target comes from
//! [`PipelineOptions::target_edge_px`] (`images_scale` × baseline, capped);
//! raster inputs are only ever scaled down to it, never blown up.

use crate::error::ConvertError;
use crate::format::InputFormat;
use crate::options::PipelineOptions;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// One rasterised source page, as handed to a backend adapter.
#[derive(Debug)]
pub struct PageImage {
    /// 0-indexed position in the source document.
    pub index: usize,
    /// Raster width in pixels.
    pub width: u32,
    /// Raster height in pixels.
    pub height: u32,
    /// The raster itself. Always present for real conversions; optional so
    /// text-only tests need not allocate pixels.
    pub image: Option<DynamicImage>,
    /// Text layer extracted from the source (PDFs with embedded text).
    pub text: Option<String>,
}

impl PageImage {
    pub fn new(index: usize, image: DynamicImage, text: Option<String>) -> Self {
        let (width, height) = (image.width(), image.height());
        Self {
            index,
            width,
            height,
            image: Some(image),
            text,
        }
    }

    /// Page carrying only a text layer.
    pub fn from_text(index: usize, width: u32, height: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            width,
            height,
            image: None,
            text: Some(text.into()),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(index: usize, width: u32, height: u32) -> Self {
        Self {
            index,
            width,
            height,
            image: None,
            text: None,
        }
    }
}

/// Rasterise the input into per-page images.
///
/// A zero-page document yields an empty vector, not an error.
pub(crate) async fn rasterize(
    path: &Path,
    format: InputFormat,
    options: &PipelineOptions,
) -> Result<Vec<PageImage>, ConvertError> {
    let path = path.to_path_buf();
    let target_edge = options.target_edge_px();

    let pages = tokio::task::spawn_blocking(move || match format {
        InputFormat::Pdf => rasterize_pdf_blocking(&path, target_edge),
        InputFormat::Image => rasterize_image_blocking(&path, target_edge),
    })
    .await
    .map_err(|e| ConvertError::Internal(format!("rasterise task panicked: {e}")))??;

    Ok(pages)
}

fn rasterize_pdf_blocking(
    path: &Path,
    target_edge: u32,
) -> Result<Vec<PageImage>, ConvertError> {
    let pdfium = Pdfium::default();

    let document =
        pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| ConvertError::Rasterization {
                page: 0,
                detail: format!("cannot open '{}': {:?}", path.display(), e),
            })?;

    let pages = document.pages();
    let total = pages.len() as usize;
    info!("PDF loaded: {} pages", total);

    let render_config = PdfRenderConfig::new()
        .set_target_width(target_edge as i32)
        .set_maximum_height(target_edge as i32);

    let mut results = Vec::with_capacity(total);
    for index in 0..total {
        let page = pages
            .get(index as u16)
            .map_err(|e| ConvertError::Rasterization {
                page: index + 1,
                detail: format!("{:?}", e),
            })?;

        let bitmap =
            page.render_with_config(&render_config)
                .map_err(|e| ConvertError::Rasterization {
                    page: index + 1,
                    detail: format!("{:?}", e),
                })?;
        let image = bitmap.as_image();

        let text = page.text().ok().map(|t| t.all()).filter(|t| !t.trim().is_empty());

        debug!(
            "rasterised page {} → {}x{} px, text layer: {}",
            index + 1,
            image.width(),
            image.height(),
            text.is_some()
        );

        results.push(PageImage::new(index, image, text));
    }

    Ok(results)
}

fn rasterize_image_blocking(
    path: &Path,
    target_edge: u32,
) -> Result<Vec<PageImage>, ConvertError> {
    let img = image::open(path).map_err(|e| ConvertError::Rasterization {
        page: 1,
        detail: format!("cannot decode '{}': {e}", path.display()),
    })?;

    let edge = img.width().max(img.height());
    let img = if edge > target_edge {
        debug!("downscaling image {}px → {}px longest edge", edge, target_edge);
        img.thumbnail(target_edge, target_edge)
    } else {
        img
    };

    Ok(vec![PageImage::new(0, img, None)])
}
