//! Input format detection.
//!
//! Every input resolves to exactly one [`InputFormat`] or conversion fails
//! with [`ConvertError::UnsupportedFormat`]. Content magic bytes are checked
//! first because extensions lie (a `.pdf` that is really a PNG screenshot is
//! common); the extension is only consulted when the file is too short or its
//! magic is unknown.

use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Classification of an input document's type.
///
/// Used as the key for per-format pipeline bindings on
/// [`crate::converter::DocumentConverter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputFormat {
    /// PDF document (multi-page, carries a text layer when born digital).
    Pdf,
    /// Single-page raster image (PNG, JPEG, or TIFF).
    Image,
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputFormat::Pdf => write!(f, "pdf"),
            InputFormat::Image => write!(f, "image"),
        }
    }
}

/// Classify a byte prefix by magic number.
///
/// Needs at least 8 bytes to recognise PNG; shorter slices can still match
/// PDF and JPEG.
pub(crate) fn detect_from_bytes(prefix: &[u8]) -> Option<InputFormat> {
    if prefix.starts_with(b"%PDF") {
        return Some(InputFormat::Pdf);
    }
    if prefix.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(InputFormat::Image);
    }
    if prefix.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(InputFormat::Image);
    }
    // TIFF, little- and big-endian.
    if prefix.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || prefix.starts_with(&[0x4D, 0x4D, 0x00, 0x2A])
    {
        return Some(InputFormat::Image);
    }
    None
}

fn detect_from_extension(path: &Path) -> Option<InputFormat> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(InputFormat::Pdf),
        "png" | "jpg" | "jpeg" | "tif" | "tiff" => Some(InputFormat::Image),
        _ => None,
    }
}

/// Detect the format of a local file, magic bytes first, extension second.
pub fn detect_format(path: &Path) -> Result<InputFormat, ConvertError> {
    let mut prefix = [0u8; 8];
    let read = match std::fs::File::open(path) {
        Ok(mut f) => f.read(&mut prefix).unwrap_or(0),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ConvertError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
        Err(_) => {
            return Err(ConvertError::FileNotFound {
                path: path.to_path_buf(),
            })
        }
    };

    detect_from_bytes(&prefix[..read])
        .or_else(|| detect_from_extension(path))
        .ok_or_else(|| ConvertError::UnsupportedFormat {
            detail: format!(
                "'{}' matches no known magic bytes or extension",
                path.display()
            ),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn magic_bytes_pdf() {
        assert_eq!(detect_from_bytes(b"%PDF-1.7\n"), Some(InputFormat::Pdf));
    }

    #[test]
    fn magic_bytes_png() {
        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00];
        assert_eq!(detect_from_bytes(&png), Some(InputFormat::Image));
    }

    #[test]
    fn magic_bytes_jpeg() {
        assert_eq!(
            detect_from_bytes(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some(InputFormat::Image)
        );
    }

    #[test]
    fn magic_bytes_tiff_both_endiannesses() {
        assert_eq!(
            detect_from_bytes(&[0x49, 0x49, 0x2A, 0x00]),
            Some(InputFormat::Image)
        );
        assert_eq!(
            detect_from_bytes(&[0x4D, 0x4D, 0x00, 0x2A]),
            Some(InputFormat::Image)
        );
    }

    #[test]
    fn magic_bytes_unknown() {
        assert_eq!(detect_from_bytes("hello világ".as_bytes()), None);
        assert_eq!(detect_from_bytes(&[]), None);
    }

    #[test]
    fn magic_wins_over_extension() {
        let mut f = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        f.write_all(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0]).unwrap();
        assert_eq!(detect_format(f.path()).unwrap(), InputFormat::Image);
    }

    #[test]
    fn extension_fallback_for_short_file() {
        let f = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        assert_eq!(detect_format(f.path()).unwrap(), InputFormat::Pdf);
    }

    #[test]
    fn unknown_format_rejected() {
        let mut f = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        f.write_all(b"plain text, nothing to see").unwrap();
        let err = detect_format(f.path()).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedFormat { .. }));
    }

    #[test]
    fn missing_file() {
        let err = detect_format(Path::new("/nonexistent/doc.pdf")).unwrap_err();
        assert!(matches!(err, ConvertError::FileNotFound { .. }));
    }
}
