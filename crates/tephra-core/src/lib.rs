//! # Tephra Core
//!
//! Foundation types for the Tephra texture build pipeline:
//! - **Formats**: encoded texture formats as a closed tagged variant
//! - **Images**: raw pixel containers with bordered tile extraction
//! - **Morton**: Z-order indexing for tile layout and chunk packing
//! - **Jobs**: priority thread pool with blocking wait and cancellation

pub mod error;
pub mod format;
pub mod image;
pub mod job;
pub mod morton;

pub use error::{CoreError, CoreResult};
pub use format::{AddressMode, AstcBlock, BcFormat, EtcFormat, FormatName, GammaSpace, TextureFormat};
pub use image::{ImageInfo, RawFormat, RawImage};
pub use job::{CancellationToken, JobHandle, JobPriority, JobSystem};
pub use morton::{morton_decode, morton_encode, MortonIter};
