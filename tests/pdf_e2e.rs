//! End-to-end PDF tests.
//!
//! These need the pdfium shared library and real PDF files in
//! `./test_cases/`, and the VLM test additionally makes live provider
//! calls. They are gated behind the `E2E_ENABLED` environment variable so
//! they do not run in CI unless explicitly requested.
//!
//! Run with:
//!   E2E_ENABLED=1 cargo test --test pdf_e2e -- --nocapture

use docmill::{
    BackendKind, DocumentConverter, FormatOption, InputFormat, PipelineOptions,
};
use std::path::PathBuf;

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

/// Skip this test if E2E_ENABLED is not set *or* no PDF file at `path`.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP — set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP — test file not found: {}", p.display());
            return;
        }
        p
    }};
}

/// Basic quality checks on an export.
fn assert_markdown_quality(md: &str, context: &str) {
    assert!(!md.trim().is_empty(), "[{context}] Markdown is empty");
    assert!(
        md.ends_with('\n'),
        "[{context}] Markdown must end with a newline"
    );
    let first_line = md.lines().next().unwrap_or("");
    assert!(
        !first_line.starts_with("```"),
        "[{context}] Output must not start with a code fence, got: {first_line:?}"
    );
    let invisible = ['\u{200B}', '\u{FEFF}', '\u{2060}'];
    for ch in invisible {
        assert!(
            !md.contains(ch),
            "[{context}] Output contains invisible char U+{:04X}",
            ch as u32
        );
    }
}

#[tokio::test]
async fn layout_pipeline_converts_a_real_pdf() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("sample.pdf"));

    let converter = DocumentConverter::new();
    let result = converter.convert(pdf.to_str().unwrap()).await.unwrap();

    assert!(result.stats.pages > 0);
    assert!(result.fallback.is_none());
    assert_markdown_quality(&result.document.export_to_markdown(), "layout/sample.pdf");
}

#[tokio::test]
async fn vlm_pipeline_converts_a_real_pdf() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("sample.pdf"));

    // 0.25 × 2048 baseline matches the VLM adapter's preferred 512px edge.
    let options = PipelineOptions::builder()
        .images_scale(0.25)
        .build()
        .unwrap();
    let converter = DocumentConverter::builder()
        .format_option(InputFormat::Pdf, FormatOption::new(BackendKind::Vlm, options))
        .build();

    let result = converter.convert(pdf.to_str().unwrap()).await.unwrap();
    assert!(result.stats.pages > 0);
    assert!(!result.stats.resolution_mismatch);
    assert_markdown_quality(&result.document.export_to_markdown(), "vlm/sample.pdf");
}

#[tokio::test]
async fn zero_page_pdf_yields_empty_document() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("empty.pdf"));

    let result = DocumentConverter::new()
        .convert(pdf.to_str().unwrap())
        .await
        .unwrap();
    assert_eq!(result.stats.pages, 0);
    assert_eq!(result.document.export_to_markdown(), "");
}
