//! Core error types

use thiserror::Error;

/// Errors raised by core image and format operations
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown texture format: {0}")]
    UnknownFormat(String),

    #[error("Pixel data size mismatch: expected {expected} bytes, got {actual}")]
    PixelDataSize { expected: usize, actual: usize },

    #[error("Unsupported raw format {0:?} for this operation")]
    UnsupportedRawFormat(crate::image::RawFormat),

    #[error("Image dimensions out of range: {width}x{height}x{slices}")]
    DimensionsOutOfRange {
        width: u32,
        height: u32,
        slices: u32,
    },

    #[error("Job system is shut down")]
    JobSystemShutDown,
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
