use std::fmt::Write;

use crate::assemble::IdentifierCode;

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("Cannot read image file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Non UTF-8 path")]
    NonUtfPath,
    #[error("Invalid image format")]
    NotImage,
    #[error("Unable to process image: {} (errno {})", .0.message, .0.code)]
    OpenCvError(#[from] opencv::Error),
}

/// Everything that can go wrong while reading one sheet.
///
/// Which of these are fatal depends on where they surface: anchor errors end the
/// sheet, bubble and grid errors end a single block, `CodeUnreadable` only costs
/// the identifier.
#[derive(thiserror::Error, Debug)]
pub enum SheetError {
    #[error("OpenCV Error: {} (errno {})", .0.message, .0.code)]
    OpenCvError(#[from] opencv::Error),
    #[error("OCR error: {0}")]
    OcrError(#[from] OcrError),
    #[error("Cannot load sheet image: {0}")]
    Load(#[from] LoadError),
    #[error("No anchor could be located on the sheet")]
    AnchorNotFound,
    #[error("Incomplete markers on page (found {found}, need 4 framing the sheet)")]
    InsufficientMarkers { found: usize },
    #[error("Detected {found} bubbles, need at least {needed} to form a row")]
    NoBubblesDetected { found: usize, needed: usize },
    #[error("Inferred {rows} rows, expected between {min} and {max}")]
    GridShapeMismatch { rows: usize, min: usize, max: usize },
    #[error("Identifier unreadable: only {readable} digit(s) read (got `{partial}`)")]
    CodeUnreadable {
        partial: IdentifierCode,
        readable: usize,
    },
}

/// Wrapper for Tesseract errors that happen at different stages.
#[derive(thiserror::Error, Debug)]
pub enum OcrError {
    #[error("No `{0}` command found. Please install tesseract or point `ocr.tesseract_cmd` at it.")]
    NoTesseract(String),
    #[error("tessdata path is not unicode. somehow.")]
    NoUnicode,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot encode image: {0}")]
    InvalidImage(#[from] opencv::Error),
    #[error("Malformed tesseract TSV output at line {line}")]
    MalformedOutput { line: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReferenceError {
    #[error("Cannot make network request: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("Reference service answered {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum CsvError {
    #[error("Cannot open/write file: {0}")]
    FileOperationFailed(#[from] std::io::Error),
    #[error("Failed to serialize CSV: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("Cannot open/write registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("Registry file is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum DiagnosticsError {
    #[error("Cannot write diagnostic image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot render diagnostic image: {} (errno {})", .0.message, .0.code)]
    OpenCvError(#[from] opencv::Error),
}

impl serde::Serialize for SheetError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

pub fn fmt_error_chain_of(mut err: &dyn std::error::Error) -> String {
    let mut str = err.to_string();
    while let Some(src) = err.source() {
        _ = write!(str, "\n  -> Caused by {src}");
        err = src;
    }
    str
}

#[macro_export]
macro_rules! err_log {
    ($error: expr) => {
        log::error!("{}", $crate::errors::fmt_error_chain_of($error))
    };
}
