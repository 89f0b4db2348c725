//! Image Containers
//!
//! CPU-side pixel storage used by the build pipeline: raw (unencoded)
//! formats, image descriptions, and owned pixel buffers with bordered
//! sub-rectangle extraction for tile builds.

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::format::{AddressMode, GammaSpace};

/// Unencoded pixel formats the pipeline works in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RawFormat {
    /// Single 8-bit gray channel
    G8,
    /// 8-bit BGRA, the default LDR intermediate
    #[default]
    Bgra8,
    /// 16-bit unsigned normalized RGBA
    Rgba16,
    /// Half-float RGBA, the HDR intermediate
    Rgba16F,
    /// Full-float RGBA
    Rgba32F,
}

impl RawFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::G8 => 1,
            Self::Bgra8 => 4,
            Self::Rgba16 | Self::Rgba16F => 8,
            Self::Rgba32F => 16,
        }
    }

    pub fn is_hdr(&self) -> bool {
        matches!(self, Self::Rgba16F | Self::Rgba32F)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::G8 => "G8",
            Self::Bgra8 => "BGRA8",
            Self::Rgba16 => "RGBA16",
            Self::Rgba16F => "RGBA16F",
            Self::Rgba32F => "RGBA32F",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "G8" => Some(Self::G8),
            "BGRA8" => Some(Self::Bgra8),
            "RGBA16" => Some(Self::Rgba16),
            "RGBA16F" => Some(Self::Rgba16F),
            "RGBA32F" => Some(Self::Rgba32F),
            _ => None,
        }
    }
}

/// Shape of an image without its pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub num_slices: u32,
    pub format: RawFormat,
    pub gamma: GammaSpace,
}

impl ImageInfo {
    pub fn new_2d(width: u32, height: u32, format: RawFormat, gamma: GammaSpace) -> Self {
        Self {
            width,
            height,
            num_slices: 1,
            format,
            gamma,
        }
    }

    /// Total byte size of the pixel data this info describes
    pub fn data_size(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.num_slices as usize
            * self.format.bytes_per_pixel()
    }

    pub fn slice_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Dimension of one mip level of a base dimension, never below 1
#[inline]
pub fn mip_dimension(base: u32, level: u32) -> u32 {
    (base >> level).max(1)
}

/// Number of mips in a full chain down to 1x1
pub fn full_mip_count(width: u32, height: u32) -> u32 {
    let max_dim = width.max(height).max(1);
    32 - max_dim.leading_zeros()
}

/// Round up to the next power of two (identity for powers of two)
pub fn round_up_pow2(value: u32) -> u32 {
    value.max(1).next_power_of_two()
}

/// An owned image: shape plus pixel bytes
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    info: ImageInfo,
    data: Vec<u8>,
}

impl RawImage {
    /// Create an image from existing pixel data
    pub fn from_data(info: ImageInfo, data: Vec<u8>) -> CoreResult<Self> {
        if data.len() != info.data_size() {
            return Err(CoreError::PixelDataSize {
                expected: info.data_size(),
                actual: data.len(),
            });
        }
        Ok(Self { info, data })
    }

    /// Create a zero-filled image
    pub fn new_black(info: ImageInfo) -> Self {
        let data = vec![0u8; info.data_size()];
        Self { info, data }
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn format(&self) -> RawFormat {
        self.info.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    #[inline]
    fn texel_offset(&self, x: u32, y: u32, slice: u32) -> usize {
        debug_assert!(x < self.info.width && y < self.info.height && slice < self.info.num_slices);
        let bpp = self.info.format.bytes_per_pixel();
        ((slice as usize * self.info.height as usize + y as usize) * self.info.width as usize
            + x as usize)
            * bpp
    }

    /// Raw bytes of one texel
    pub fn texel_bytes(&self, x: u32, y: u32, slice: u32) -> &[u8] {
        let offset = self.texel_offset(x, y, slice);
        &self.data[offset..offset + self.info.format.bytes_per_pixel()]
    }

    /// Read one texel as linear-layout RGBA f32 (format-aware)
    pub fn read_texel(&self, x: u32, y: u32, slice: u32) -> [f32; 4] {
        let bytes = self.texel_bytes(x, y, slice);
        match self.info.format {
            RawFormat::G8 => {
                let g = bytes[0] as f32 / 255.0;
                [g, g, g, 1.0]
            }
            RawFormat::Bgra8 => [
                bytes[2] as f32 / 255.0,
                bytes[1] as f32 / 255.0,
                bytes[0] as f32 / 255.0,
                bytes[3] as f32 / 255.0,
            ],
            RawFormat::Rgba16 => {
                let mut out = [0.0f32; 4];
                for (i, value) in out.iter_mut().enumerate() {
                    let v = u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
                    *value = v as f32 / 65535.0;
                }
                out
            }
            RawFormat::Rgba16F => {
                let mut out = [0.0f32; 4];
                for (i, value) in out.iter_mut().enumerate() {
                    let v = f16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
                    *value = v.to_f32();
                }
                out
            }
            RawFormat::Rgba32F => {
                let mut out = [0.0f32; 4];
                for (i, value) in out.iter_mut().enumerate() {
                    *value = f32::from_le_bytes([
                        bytes[i * 4],
                        bytes[i * 4 + 1],
                        bytes[i * 4 + 2],
                        bytes[i * 4 + 3],
                    ]);
                }
                out
            }
        }
    }

    /// Write one texel from linear-layout RGBA f32 (format-aware)
    pub fn write_texel(&mut self, x: u32, y: u32, slice: u32, rgba: [f32; 4]) {
        let offset = self.texel_offset(x, y, slice);
        let bpp = self.info.format.bytes_per_pixel();
        let bytes = &mut self.data[offset..offset + bpp];
        match self.info.format {
            RawFormat::G8 => {
                bytes[0] = (rgba[0].clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
            }
            RawFormat::Bgra8 => {
                bytes[0] = (rgba[2].clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
                bytes[1] = (rgba[1].clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
                bytes[2] = (rgba[0].clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
                bytes[3] = (rgba[3].clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
            }
            RawFormat::Rgba16 => {
                for (i, v) in rgba.iter().enumerate() {
                    let q = (v.clamp(0.0, 1.0) * 65535.0 + 0.5) as u16;
                    bytes[i * 2..i * 2 + 2].copy_from_slice(&q.to_le_bytes());
                }
            }
            RawFormat::Rgba16F => {
                for (i, v) in rgba.iter().enumerate() {
                    bytes[i * 2..i * 2 + 2].copy_from_slice(&f16::from_f32(*v).to_le_bytes());
                }
            }
            RawFormat::Rgba32F => {
                for (i, v) in rgba.iter().enumerate() {
                    bytes[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
                }
            }
        }
    }

    /// Copy out a `width x height` rectangle whose origin may lie outside
    /// the image. Out-of-bounds texels are resolved through the given edge
    /// addressing modes. Used to extract bordered virtual-texture tiles.
    pub fn extract_bordered(
        &self,
        origin_x: i64,
        origin_y: i64,
        width: u32,
        height: u32,
        mode_x: AddressMode,
        mode_y: AddressMode,
    ) -> RawImage {
        let info = ImageInfo {
            width,
            height,
            num_slices: 1,
            format: self.info.format,
            gamma: self.info.gamma,
        };
        let bpp = self.info.format.bytes_per_pixel();
        let mut data = Vec::with_capacity(info.data_size());
        for y in 0..height {
            let src_y = mode_y.resolve(origin_y + y as i64, self.info.height);
            for x in 0..width {
                let src_x = mode_x.resolve(origin_x + x as i64, self.info.width);
                let offset = self.texel_offset(src_x, src_y, 0);
                data.extend_from_slice(&self.data[offset..offset + bpp]);
            }
        }
        RawImage { info, data }
    }

    /// Convert to another raw format through f32 texels. Returns a clone
    /// when the format already matches.
    pub fn convert_to(&self, format: RawFormat) -> RawImage {
        if format == self.info.format {
            return self.clone();
        }
        let info = ImageInfo {
            format,
            ..self.info
        };
        let mut out = RawImage::new_black(info);
        for slice in 0..self.info.num_slices {
            for y in 0..self.info.height {
                for x in 0..self.info.width {
                    out.write_texel(x, y, slice, self.read_texel(x, y, slice));
                }
            }
        }
        out
    }

    /// Nearest-neighbor upscale. Blocks smaller than one tile are scaled up
    /// (never down) so every block contributes at least one full tile.
    pub fn upscale_to(&self, width: u32, height: u32) -> RawImage {
        debug_assert!(width >= self.info.width && height >= self.info.height);
        let info = ImageInfo {
            width,
            height,
            num_slices: self.info.num_slices,
            format: self.info.format,
            gamma: self.info.gamma,
        };
        let bpp = self.info.format.bytes_per_pixel();
        let mut data = Vec::with_capacity(info.data_size());
        for slice in 0..self.info.num_slices {
            for y in 0..height {
                let src_y = (y as u64 * self.info.height as u64 / height as u64) as u32;
                for x in 0..width {
                    let src_x = (x as u64 * self.info.width as u64 / width as u64) as u32;
                    let offset = self.texel_offset(src_x, src_y, slice);
                    data.extend_from_slice(&self.data[offset..offset + bpp]);
                }
            }
        }
        RawImage { info, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(width: u32, height: u32) -> RawImage {
        let info = ImageInfo::new_2d(width, height, RawFormat::Bgra8, GammaSpace::Linear);
        let mut image = RawImage::new_black(info);
        for y in 0..height {
            for x in 0..width {
                let v = ((x + y * width) % 256) as f32 / 255.0;
                image.write_texel(x, y, 0, [v, v, v, 1.0]);
            }
        }
        image
    }

    #[test]
    fn test_mip_dimension() {
        assert_eq!(mip_dimension(256, 0), 256);
        assert_eq!(mip_dimension(256, 8), 1);
        assert_eq!(mip_dimension(256, 12), 1);
        assert_eq!(mip_dimension(100, 1), 50);
    }

    #[test]
    fn test_full_mip_count() {
        assert_eq!(full_mip_count(256, 256), 9);
        assert_eq!(full_mip_count(2048, 1024), 12);
        assert_eq!(full_mip_count(1, 1), 1);
    }

    #[test]
    fn test_texel_round_trip() {
        for format in [
            RawFormat::Bgra8,
            RawFormat::Rgba16,
            RawFormat::Rgba16F,
            RawFormat::Rgba32F,
        ] {
            let info = ImageInfo::new_2d(2, 2, format, GammaSpace::Linear);
            let mut image = RawImage::new_black(info);
            image.write_texel(1, 0, 0, [0.5, 0.25, 1.0, 0.0]);
            let texel = image.read_texel(1, 0, 0);
            assert!((texel[0] - 0.5).abs() < 0.01, "{format:?}: {texel:?}");
            assert!((texel[1] - 0.25).abs() < 0.01);
            assert!((texel[2] - 1.0).abs() < 0.01);
            assert!(texel[3].abs() < 0.01);
        }
    }

    #[test]
    fn test_data_size_validation() {
        let info = ImageInfo::new_2d(4, 4, RawFormat::Bgra8, GammaSpace::Srgb);
        assert!(RawImage::from_data(info, vec![0u8; 64]).is_ok());
        assert!(RawImage::from_data(info, vec![0u8; 63]).is_err());
    }

    #[test]
    fn test_extract_bordered_interior() {
        let image = gradient_image(8, 8);
        let tile = image.extract_bordered(2, 2, 4, 4, AddressMode::Wrap, AddressMode::Wrap);
        assert_eq!(tile.width(), 4);
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(tile.read_texel(x, y, 0), image.read_texel(x + 2, y + 2, 0));
            }
        }
    }

    #[test]
    fn test_extract_bordered_edges() {
        let image = gradient_image(8, 8);

        // Wrap: column -1 comes from column 7
        let tile = image.extract_bordered(-1, 0, 2, 1, AddressMode::Wrap, AddressMode::Wrap);
        assert_eq!(tile.read_texel(0, 0, 0), image.read_texel(7, 0, 0));
        assert_eq!(tile.read_texel(1, 0, 0), image.read_texel(0, 0, 0));

        // Clamp: column -1 repeats column 0
        let tile = image.extract_bordered(-1, 0, 2, 1, AddressMode::Clamp, AddressMode::Clamp);
        assert_eq!(tile.read_texel(0, 0, 0), image.read_texel(0, 0, 0));

        // Mirror: column -1 reflects to column 0, -2 to column 1
        let tile = image.extract_bordered(-2, 0, 2, 1, AddressMode::Mirror, AddressMode::Mirror);
        assert_eq!(tile.read_texel(0, 0, 0), image.read_texel(1, 0, 0));
        assert_eq!(tile.read_texel(1, 0, 0), image.read_texel(0, 0, 0));
    }

    #[test]
    fn test_upscale_preserves_corners() {
        let image = gradient_image(2, 2);
        let scaled = image.upscale_to(8, 8);
        assert_eq!(scaled.read_texel(0, 0, 0), image.read_texel(0, 0, 0));
        assert_eq!(scaled.read_texel(7, 7, 0), image.read_texel(1, 1, 0));
    }
}
