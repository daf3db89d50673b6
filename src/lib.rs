pub mod anchor;
pub mod assemble;
pub mod bubbles;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod fill;
pub mod grid;
pub mod image;
pub mod ocr;
pub mod pipeline;
pub mod reference;
pub mod region;
pub mod scoring;
pub mod storage;

pub use assemble::{Alternative, Answer, IdentifierCode};
pub use config::OmrConfig;
pub use errors::SheetError;
pub use pipeline::{compose_pages, SheetOutcome, SheetReader, SheetReport};
pub use scoring::{correct_answers, CorrectionResult};
