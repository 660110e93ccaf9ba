//! Error types for the docmill library.
//!
//! All fatal failures funnel into a single [`ConvertError`] enum. Stage-level
//! errors ([`ConvertError::Rasterization`], [`ConvertError::Backend`])
//! propagate up to the orchestrator, which recovers only via the one-shot
//! fallback policy in [`crate::converter`] — there is no automatic retry of
//! inference calls anywhere else. If the fallback attempt also fails, both
//! errors are surfaced together as [`ConvertError::FallbackFailed`] so the
//! original cause is never masked.
//!
//! Partial data never escapes through errors: a failed conversion yields no
//! document. The only place degraded output survives is assembly-stage unit
//! skipping, which is counted on [`crate::document::Document::skipped_units`]
//! rather than reported here.

use std::path::PathBuf;
use thiserror::Error;

use crate::backend::BackendKind;

/// All errors returned by the docmill library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("input file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The input's content and extension match no recognised [`crate::format::InputFormat`].
    #[error("unsupported input format: {detail}")]
    UnsupportedFormat { detail: String },

    // ── Stage errors ──────────────────────────────────────────────────────
    /// The input could not be decoded into page images.
    ///
    /// `page` is 1-indexed; 0 means the failure was document-level
    /// (corrupt header, unreadable stream) rather than page-level.
    #[error("rasterisation failed on page {page}: {detail}")]
    Rasterization { page: usize, detail: String },

    /// A page image fell outside the backend's accepted dimension range.
    ///
    /// Scaling to the backend's preferred resolution is the pipeline's job;
    /// this error means the rasterised image missed the hard limits, not
    /// merely the preferred size (a preferred-size mismatch only warns).
    #[error("{backend:?} backend cannot accept page {page}: {width}x{height}px is outside {min}..={max}px")]
    UnsupportedInput {
        page: usize,
        width: u32,
        height: u32,
        min: u32,
        max: u32,
        backend: BackendKind,
    },

    /// The backend adapter failed while producing raw output for a page.
    #[error("backend inference failed on page {page}: {detail}")]
    Backend { page: usize, detail: String },

    /// Cooperative cancellation was observed between pipeline stages.
    #[error("conversion cancelled before the {stage} stage")]
    Cancelled { stage: &'static str },

    /// Both the bound pipeline and the one-shot default fallback failed.
    ///
    /// The fallback error is appended to — never replaces — the original.
    #[error("conversion failed: {original}; fallback to default pipeline also failed: {fallback}")]
    FallbackFailed {
        original: Box<ConvertError>,
        fallback: Box<ConvertError>,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output Markdown file.
    #[error("failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConvertError {
    /// Whether this error makes the conversion eligible for the one-shot
    /// default-pipeline fallback (stage 2/3 failures only).
    pub(crate) fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            ConvertError::Backend { .. } | ConvertError::Rasterization { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_failed_mentions_both_causes() {
        let e = ConvertError::FallbackFailed {
            original: Box::new(ConvertError::Backend {
                page: 2,
                detail: "provider unreachable".into(),
            }),
            fallback: Box::new(ConvertError::Rasterization {
                page: 0,
                detail: "corrupt stream".into(),
            }),
        };
        let msg = e.to_string();
        assert!(msg.contains("provider unreachable"), "got: {msg}");
        assert!(msg.contains("corrupt stream"), "got: {msg}");
    }

    #[test]
    fn fallback_eligibility() {
        assert!(ConvertError::Backend {
            page: 1,
            detail: "x".into()
        }
        .is_fallback_eligible());
        assert!(ConvertError::Rasterization {
            page: 0,
            detail: "x".into()
        }
        .is_fallback_eligible());
        assert!(!ConvertError::UnsupportedFormat { detail: "x".into() }.is_fallback_eligible());
        assert!(!ConvertError::Cancelled { stage: "infer" }.is_fallback_eligible());
    }

    #[test]
    fn unsupported_input_display() {
        let e = ConvertError::UnsupportedInput {
            page: 3,
            width: 16,
            height: 16,
            min: 64,
            max: 4096,
            backend: BackendKind::Vlm,
        };
        let msg = e.to_string();
        assert!(msg.contains("page 3"));
        assert!(msg.contains("16x16"));
    }
}
