//! Build Errors
//!
//! Error taxonomy of the pipeline: resolution failures happen before any
//! build is attempted; validation failures abort a build before any cache
//! write; backend failures degrade to cache misses; encoder failures are
//! terminal for the build attempt and carry enough context (texture name,
//! failing node) for diagnosis.

use thiserror::Error;

use tephra_cache::CacheError;
use tephra_core::CoreError;

/// Input validation failures. These abort the build before any cache
/// write; an existing cached entry is left untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error(
        "Block ({block_x},{block_y}) aspect ratio changes under power-of-two adjustment: \
         {width}x{height} -> {adjusted_width}x{adjusted_height}"
    )]
    BlockAspectMismatch {
        block_x: u32,
        block_y: u32,
        width: u32,
        height: u32,
        adjusted_width: u32,
        adjusted_height: u32,
    },

    #[error("Blocks disagree on aspect ratio: {0}x{1} vs {2}x{3}")]
    InconsistentBlockAspect(u32, u32, u32, u32),

    #[error("Total pixel count {total} exceeds the supported maximum {max}")]
    OversizedPixelCount { total: u64, max: u64 },

    #[error("Packed chunk size {size} exceeds the offset width limit {max}")]
    ChunkOffsetOverflow { size: u64, max: u64 },

    #[error("Source has no blocks")]
    EmptySource,

    #[error("Layer count mismatch: settings describe {settings} layers, source has {source_layers}")]
    LayerCountMismatch { settings: usize, source_layers: usize },
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum BuildError {
    /// Target format or encoder unavailable; no build is possible
    #[error("No encoder available for format '{format}' (texture '{texture}')")]
    Resolution { texture: String, format: String },

    /// Settings were used before target-format negotiation completed
    #[error("Texture format is unresolved for texture '{texture}'")]
    FormatUnresolved { texture: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Cache backend failure. The orchestrator degrades these to misses
    /// on the query path; they only surface when storing is impossible.
    #[error(transparent)]
    Backend(#[from] CacheError),

    /// Opaque encoder capability failed; terminal for this build attempt
    #[error("Encoder failed in node '{node}' for texture '{texture}': {message}")]
    Encoder {
        texture: String,
        node: String,
        message: String,
    },

    #[error("Build node '{node}' is missing input '{input}'")]
    MissingInput { node: String, input: String },

    #[error("Build graph contains a dependency cycle")]
    GraphCycle,

    #[error("Build was cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for build operations
pub type BuildResult<T> = Result<T, BuildError>;
