//! Audio file I/O and the conversion pipeline for remuestreo.
//!
//! This crate provides:
//! - The [`FileReader`] contract and its WAV / compressed / DSD backends
//!   via [`reader`] and [`dsd`]
//! - The project's own WAV/WAVEX/RF64 writer via [`wav`] (the write side
//!   needs RF64, 64-bit float, metadata, and peak chunks, which go beyond
//!   what the reading library offers)
//! - CSV sample output via [`csv`]
//! - Output-format token resolution and RF64 promotion via [`format`]
//! - The pipeline controller via [`engine`]

pub mod csv;
pub mod dsd;
pub mod engine;
pub mod format;
pub mod metadata;
pub mod reader;
pub mod wav;

pub use engine::{convert, ConversionInfo, ConversionResult, NullReporter, Reporter};
pub use format::{MajorFormat, SubFormat};
pub use metadata::MetaData;
pub use reader::{open_reader, FileReader};
pub use wav::WavWriter;

/// Error type for file I/O and pipeline operations.
///
/// Temp-file failures are special-cased by the controller: it downgrades
/// to direct conversion with a warning instead of aborting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("couldn't open input file '{path}': {reason}")]
    InputOpen { path: String, reason: String },

    #[error("error reading input file: {0}")]
    InputRead(String),

    #[error("couldn't open output file '{path}': {reason}")]
    OutputOpen { path: String, reason: String },

    #[error("error writing output file: {0}")]
    OutputWrite(String),

    #[error("temp file unavailable: {0}")]
    TempFile(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("conversion cancelled")]
    Cancelled,

    #[error(transparent)]
    Rate(#[from] remuestreo_core::RateError),

    #[error("resampler construction failed: {0}")]
    Design(#[from] remuestreo_core::resampler::DesignError),
}

pub type Result<T> = std::result::Result<T, Error>;
