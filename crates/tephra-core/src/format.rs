//! Texture Formats
//!
//! Encoded (GPU-ready) pixel formats as a closed tagged variant:
//! block-compressed (BC), ASTC, the ETC family, and uncompressed
//! containers. The variant set is fixed at build time; per-variant
//! properties (block dimensions, bytes per block) are table lookups.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::image::RawFormat;

/// Block-compressed (DirectX BC) formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BcFormat {
    /// RGB + 1-bit alpha, 8 bytes per 4x4 block
    Bc1,
    /// RGBA with explicit alpha block
    Bc3,
    /// Single channel
    Bc4,
    /// Two channels (normal maps)
    Bc5,
    /// HDR RGB half-float
    Bc6H,
    /// High-quality RGBA
    Bc7,
}

/// ASTC block footprint in texels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AstcBlock {
    pub width: u8,
    pub height: u8,
}

impl AstcBlock {
    pub const B4X4: Self = Self { width: 4, height: 4 };
    pub const B6X6: Self = Self { width: 6, height: 6 };
    pub const B8X8: Self = Self { width: 8, height: 8 };
}

/// ETC2/EAC family formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EtcFormat {
    Etc2Rgb,
    Etc2Rgba,
    EacR11,
    EacRg11,
}

/// The closed set of encoded texture format variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    BlockCompressed(BcFormat),
    Astc(AstcBlock),
    EtcFamily(EtcFormat),
    Uncompressed(RawFormat),
}

impl TextureFormat {
    /// Block footprint in texels. Uncompressed formats are 1x1.
    pub fn block_dimensions(&self) -> (u32, u32) {
        match self {
            Self::BlockCompressed(_) => (4, 4),
            Self::Astc(block) => (block.width as u32, block.height as u32),
            Self::EtcFamily(_) => (4, 4),
            Self::Uncompressed(_) => (1, 1),
        }
    }

    /// Encoded bytes per block (per texel for uncompressed formats)
    pub fn bytes_per_block(&self) -> u32 {
        match self {
            Self::BlockCompressed(bc) => match bc {
                BcFormat::Bc1 | BcFormat::Bc4 => 8,
                BcFormat::Bc3 | BcFormat::Bc5 | BcFormat::Bc6H | BcFormat::Bc7 => 16,
            },
            Self::Astc(_) => 16,
            Self::EtcFamily(etc) => match etc {
                EtcFormat::Etc2Rgb | EtcFormat::EacR11 => 8,
                EtcFormat::Etc2Rgba | EtcFormat::EacRg11 => 16,
            },
            Self::Uncompressed(raw) => raw.bytes_per_pixel() as u32,
        }
    }

    /// True for uncompressed-container formats whose payload is raw texels
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Uncompressed(_))
    }

    /// True for formats carrying HDR (float) data
    pub fn is_hdr(&self) -> bool {
        match self {
            Self::BlockCompressed(BcFormat::Bc6H) => true,
            Self::Uncompressed(raw) => raw.is_hdr(),
            _ => false,
        }
    }

    /// Encoded size in bytes of one 2D slice at the given dimensions
    pub fn slice_size_bytes(&self, width: u32, height: u32) -> u64 {
        let (bw, bh) = self.block_dimensions();
        let blocks_x = width.div_ceil(bw) as u64;
        let blocks_y = height.div_ceil(bh) as u64;
        blocks_x * blocks_y * self.bytes_per_block() as u64
    }

    /// Stable identifier used by the encoder registry and cache keys
    pub fn name(&self) -> FormatName {
        let name = match self {
            Self::BlockCompressed(bc) => match bc {
                BcFormat::Bc1 => "BC1",
                BcFormat::Bc3 => "BC3",
                BcFormat::Bc4 => "BC4",
                BcFormat::Bc5 => "BC5",
                BcFormat::Bc6H => "BC6H",
                BcFormat::Bc7 => "BC7",
            },
            Self::Astc(block) => {
                return FormatName::new(format!("ASTC_{}x{}", block.width, block.height));
            }
            Self::EtcFamily(etc) => match etc {
                EtcFormat::Etc2Rgb => "ETC2_RGB",
                EtcFormat::Etc2Rgba => "ETC2_RGBA",
                EtcFormat::EacR11 => "EAC_R11",
                EtcFormat::EacRg11 => "EAC_RG11",
            },
            Self::Uncompressed(raw) => raw.name(),
        };
        FormatName::new(name)
    }

    /// Parse a stable identifier back into a format variant
    pub fn from_name(name: &FormatName) -> Result<Self, CoreError> {
        let s = name.as_str();
        let format = match s {
            "BC1" => Self::BlockCompressed(BcFormat::Bc1),
            "BC3" => Self::BlockCompressed(BcFormat::Bc3),
            "BC4" => Self::BlockCompressed(BcFormat::Bc4),
            "BC5" => Self::BlockCompressed(BcFormat::Bc5),
            "BC6H" => Self::BlockCompressed(BcFormat::Bc6H),
            "BC7" => Self::BlockCompressed(BcFormat::Bc7),
            "ETC2_RGB" => Self::EtcFamily(EtcFormat::Etc2Rgb),
            "ETC2_RGBA" => Self::EtcFamily(EtcFormat::Etc2Rgba),
            "EAC_R11" => Self::EtcFamily(EtcFormat::EacR11),
            "EAC_RG11" => Self::EtcFamily(EtcFormat::EacRg11),
            _ => {
                if let Some(rest) = s.strip_prefix("ASTC_") {
                    let mut parts = rest.splitn(2, 'x');
                    let w = parts.next().and_then(|p| p.parse::<u8>().ok());
                    let h = parts.next().and_then(|p| p.parse::<u8>().ok());
                    match (w, h) {
                        (Some(width), Some(height)) => Self::Astc(AstcBlock { width, height }),
                        _ => return Err(CoreError::UnknownFormat(s.to_string())),
                    }
                } else if let Some(raw) = RawFormat::from_name(s) {
                    Self::Uncompressed(raw)
                } else {
                    return Err(CoreError::UnknownFormat(s.to_string()));
                }
            }
        };
        Ok(format)
    }
}

/// Stable name of an encoded texture format
///
/// Build settings carry `Option<FormatName>`: the name stays unset until
/// target-format negotiation completes, and nothing may derive a pixel
/// format before it is populated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatName(String);

impl FormatName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FormatName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FormatName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Gamma space of stored pixel data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum GammaSpace {
    #[default]
    Linear,
    Srgb,
    /// Legacy pow(2.2) gamma kept for old content
    Pow22,
}

/// Edge addressing for sampling outside an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AddressMode {
    #[default]
    Wrap,
    Clamp,
    Mirror,
}

impl AddressMode {
    /// Map a possibly out-of-bounds coordinate into [0, size)
    pub fn resolve(&self, coord: i64, size: u32) -> u32 {
        debug_assert!(size > 0);
        let size = size as i64;
        let wrapped = match self {
            Self::Wrap => coord.rem_euclid(size),
            Self::Clamp => coord.clamp(0, size - 1),
            Self::Mirror => {
                let period = 2 * size;
                let m = coord.rem_euclid(period);
                if m < size {
                    m
                } else {
                    period - 1 - m
                }
            }
        };
        wrapped as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_name_round_trip() {
        let formats = [
            TextureFormat::BlockCompressed(BcFormat::Bc7),
            TextureFormat::Astc(AstcBlock::B6X6),
            TextureFormat::EtcFamily(EtcFormat::Etc2Rgba),
            TextureFormat::Uncompressed(RawFormat::Bgra8),
            TextureFormat::Uncompressed(RawFormat::Rgba16F),
        ];
        for format in formats {
            let name = format.name();
            assert_eq!(TextureFormat::from_name(&name).unwrap(), format);
        }
    }

    #[test]
    fn test_unknown_format_name() {
        assert!(TextureFormat::from_name(&FormatName::from("PVRTC")).is_err());
        assert!(TextureFormat::from_name(&FormatName::from("ASTC_axb")).is_err());
    }

    #[test]
    fn test_block_sizes() {
        let bc1 = TextureFormat::BlockCompressed(BcFormat::Bc1);
        assert_eq!(bc1.block_dimensions(), (4, 4));
        assert_eq!(bc1.bytes_per_block(), 8);
        // 256x256 in BC1: 64x64 blocks * 8 bytes
        assert_eq!(bc1.slice_size_bytes(256, 256), 64 * 64 * 8);
        // Non-multiple-of-block dims round up
        assert_eq!(bc1.slice_size_bytes(1, 1), 8);

        let astc = TextureFormat::Astc(AstcBlock::B6X6);
        assert_eq!(astc.slice_size_bytes(12, 12), 4 * 16);

        let raw = TextureFormat::Uncompressed(RawFormat::Bgra8);
        assert_eq!(raw.slice_size_bytes(16, 16), 16 * 16 * 4);
    }

    #[test]
    fn test_address_mode_resolve() {
        assert_eq!(AddressMode::Wrap.resolve(-1, 8), 7);
        assert_eq!(AddressMode::Wrap.resolve(8, 8), 0);
        assert_eq!(AddressMode::Clamp.resolve(-5, 8), 0);
        assert_eq!(AddressMode::Clamp.resolve(12, 8), 7);
        assert_eq!(AddressMode::Mirror.resolve(-1, 8), 0);
        assert_eq!(AddressMode::Mirror.resolve(8, 8), 7);
        assert_eq!(AddressMode::Mirror.resolve(9, 8), 6);
    }

    #[test]
    fn test_hdr_flags() {
        assert!(TextureFormat::BlockCompressed(BcFormat::Bc6H).is_hdr());
        assert!(TextureFormat::Uncompressed(RawFormat::Rgba16F).is_hdr());
        assert!(!TextureFormat::BlockCompressed(BcFormat::Bc7).is_hdr());
    }
}
