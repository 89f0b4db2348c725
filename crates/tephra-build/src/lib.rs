//! # Tephra Build
//!
//! Derived-texture build pipeline:
//! - **Settings**: two-phase resolution of authoring options into
//!   per-layer build settings against a target capability profile
//! - **Keys**: bit-stable cache keys over settings and graph shape
//! - **Graph**: eager DAG of build nodes (linear, tiling, detile, decode)
//! - **Orchestrator**: fetch-first / fetch-or-build cache policy
//! - **Virtual textures**: Morton-ordered tile encoding and chunk packing
//! - **Memory**: phase-max working-set estimation for admission control

pub mod chunk;
pub mod description;
pub mod encoder;
pub mod error;
pub mod graph;
pub mod key;
pub mod memory;
pub mod orchestrator;
pub mod settings;
pub mod source;
pub mod virtual_texture;

pub use chunk::{read_tile, ChunkPacker, EncodedTile, MipTileGrid, TileOffsetTable};
pub use description::{EncodedTextureDescription, EncodedTextureExtendedData};
pub use encoder::{
    BoxMipFilter, EncoderRegistry, MipFilter, TextureEncoder, TextureTiler, UncompressedEncoder,
};
pub use error::{BuildError, BuildResult, ValidationError};
pub use graph::{build_texture_graph, BuildGraph, BuildNode, BuildOutputOptions};
pub use key::{compute_texture_key, StructuredKey, TEXTURE_KEY_FORMAT_VERSION};
pub use memory::{estimate_physical_build, estimate_virtual_texture_build, MemoryEstimate};
pub use orchestrator::{
    BuildOrchestrator, BuildOutcome, BuildRequest, BuildRequestHandle, BuildState,
};
pub use settings::{
    AuthoringSettings, BuildSettings, CompressionClass, EncodeSpeed, SettingsPerLayer,
    SettingsResolver, TargetProfile, TextureEngineParameters,
};
pub use source::{SourceBlock, TextureSource};
pub use virtual_texture::{VirtualTextureBuildOutput, VirtualTextureLayout, VirtualTextureTileBuilder};
