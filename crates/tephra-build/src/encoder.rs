//! Encoder Capabilities
//!
//! The pixel-format encoders are external collaborators: the pipeline
//! sees them only as opaque `encode(image, settings) -> bytes`
//! capabilities behind the [`TextureEncoder`] trait. The registry maps
//! format identifiers to capabilities and is passed by reference into
//! the resolver and orchestrator; there is no process-wide lookup.

use std::sync::Arc;

use ahash::AHashMap;
use thiserror::Error;

use tephra_core::image::mip_dimension;
use tephra_core::{FormatName, ImageInfo, RawFormat, RawImage, TextureFormat};

use crate::description::{EncodedTextureDescription, EncodedTextureExtendedData};
use crate::settings::{BuildSettings, EncodeEffort, MipGenMode};

/// Failure reported by an encoder, tiler, or mip filter capability
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct EncodeError(pub String);

/// Opaque pixel encoder for one target format
pub trait TextureEncoder: Send + Sync {
    /// Format identifier this encoder is registered under
    fn name(&self) -> FormatName;

    /// Concrete output pixel format for the given settings
    fn encoded_format(&self, settings: &BuildSettings) -> TextureFormat;

    /// Uncompressed working format tiles are produced in before encoding
    fn intermediate_format(&self, hdr_source: bool) -> RawFormat {
        if hdr_source {
            RawFormat::Rgba16F
        } else {
            RawFormat::Bgra8
        }
    }

    /// Second resolver pass: encoder-specific quality/effort knobs
    fn finalize_settings(&self, settings: &mut BuildSettings) {
        settings.supports_speed_tiers = false;
        settings.effort = EncodeEffort::Normal;
        settings.rdo_lambda = None;
    }

    /// Encode one image (one mip of one slice, or one bordered tile)
    fn encode_image(
        &self,
        image: &RawImage,
        settings: &BuildSettings,
    ) -> Result<Vec<u8>, EncodeError>;

    /// Decode back to raw pixels. Only encoders with CPU-decodable output
    /// implement this; the default refuses.
    fn decode_image(&self, _data: &[u8], _info: ImageInfo) -> Result<RawImage, EncodeError> {
        Err(EncodeError(format!(
            "format '{}' does not support CPU decode",
            self.name()
        )))
    }

    /// Codec-specific side data stored once per layer in each chunk
    fn codec_payload(&self) -> Vec<u8> {
        Vec::new()
    }

    /// True when encoded payloads are raw texels in a fixed-stride
    /// container, enabling the flat chunk offset table.
    fn is_raw_container(&self) -> bool {
        false
    }
}

/// Platform tiler: converts linear mips into a platform's native swizzled
/// layout and back
pub trait TextureTiler: Send + Sync {
    fn name(&self) -> &str;

    /// Tiling metadata for a texture; must fill per-mip byte sizes
    fn extended_data(
        &self,
        description: &EncodedTextureDescription,
        lod_bias: u32,
    ) -> EncodedTextureExtendedData;

    /// Convert linear mip payloads into the platform layout
    fn tile_mips(
        &self,
        description: &EncodedTextureDescription,
        mips: &[Vec<u8>],
    ) -> Result<Vec<Vec<u8>>, EncodeError>;

    /// Inverse of [`tile_mips`](Self::tile_mips)
    fn detile_mips(
        &self,
        description: &EncodedTextureDescription,
        extended: &EncodedTextureExtendedData,
        mips: &[Vec<u8>],
    ) -> Result<Vec<Vec<u8>>, EncodeError>;
}

/// External mip-filter capability
pub trait MipFilter: Send + Sync {
    /// Generate `num_mips` levels starting from (and including) `top`
    fn generate_chain(
        &self,
        top: &RawImage,
        mode: MipGenMode,
        num_mips: u32,
    ) -> Result<Vec<RawImage>, EncodeError>;
}

/// 2x2 box filter mip generation
pub struct BoxMipFilter;

impl BoxMipFilter {
    fn downsample(source: &RawImage) -> RawImage {
        let width = mip_dimension(source.width(), 1);
        let height = mip_dimension(source.height(), 1);
        let info = ImageInfo {
            width,
            height,
            num_slices: source.info().num_slices,
            format: source.format(),
            gamma: source.info().gamma,
        };
        let mut out = RawImage::new_black(info);
        for slice in 0..info.num_slices {
            for y in 0..height {
                for x in 0..width {
                    let x0 = x * 2;
                    let y0 = y * 2;
                    let x1 = (x0 + 1).min(source.width() - 1);
                    let y1 = (y0 + 1).min(source.height() - 1);
                    let mut acc = [0.0f32; 4];
                    for (sx, sy) in [(x0, y0), (x1, y0), (x0, y1), (x1, y1)] {
                        let texel = source.read_texel(sx, sy, slice);
                        for (a, t) in acc.iter_mut().zip(texel.iter()) {
                            *a += t;
                        }
                    }
                    out.write_texel(x, y, slice, acc.map(|v| v * 0.25));
                }
            }
        }
        out
    }
}

impl MipFilter for BoxMipFilter {
    fn generate_chain(
        &self,
        top: &RawImage,
        mode: MipGenMode,
        num_mips: u32,
    ) -> Result<Vec<RawImage>, EncodeError> {
        let num_mips = match mode {
            MipGenMode::NoMips => 1,
            _ => num_mips.max(1),
        };
        let mut chain = Vec::with_capacity(num_mips as usize);
        chain.push(top.clone());
        for _ in 1..num_mips {
            let next = Self::downsample(chain.last().expect("chain is never empty"));
            chain.push(next);
        }
        Ok(chain)
    }
}

/// Raw-container codec: payload bytes are the texels themselves
pub struct UncompressedEncoder {
    format: RawFormat,
}

impl UncompressedEncoder {
    pub fn new(format: RawFormat) -> Self {
        Self { format }
    }
}

impl TextureEncoder for UncompressedEncoder {
    fn name(&self) -> FormatName {
        FormatName::from(self.format.name())
    }

    fn encoded_format(&self, _settings: &BuildSettings) -> TextureFormat {
        TextureFormat::Uncompressed(self.format)
    }

    fn intermediate_format(&self, hdr_source: bool) -> RawFormat {
        if self.format.is_hdr() || hdr_source {
            RawFormat::Rgba16F
        } else {
            RawFormat::Bgra8
        }
    }

    fn finalize_settings(&self, settings: &mut BuildSettings) {
        // Raw containers have no speed tiers and no rate-distortion knobs
        settings.supports_speed_tiers = false;
        settings.effort = EncodeEffort::Normal;
        settings.rdo_lambda = None;
    }

    fn encode_image(
        &self,
        image: &RawImage,
        settings: &BuildSettings,
    ) -> Result<Vec<u8>, EncodeError> {
        let mut image = std::borrow::Cow::Borrowed(image);
        if image.format() != self.format {
            image = std::borrow::Cow::Owned(image.convert_to(self.format));
        }
        let mut out = image.into_owned().into_data();
        if settings.force_no_alpha_channel {
            force_opaque_alpha(&mut out, self.format);
        }
        Ok(out)
    }

    fn decode_image(&self, data: &[u8], info: ImageInfo) -> Result<RawImage, EncodeError> {
        let info = ImageInfo {
            format: self.format,
            ..info
        };
        RawImage::from_data(info, data.to_vec()).map_err(|e| EncodeError(e.to_string()))
    }

    fn is_raw_container(&self) -> bool {
        true
    }
}

/// Overwrite the alpha channel with full opacity in place
fn force_opaque_alpha(data: &mut [u8], format: RawFormat) {
    match format {
        RawFormat::Bgra8 => {
            for texel in data.chunks_exact_mut(4) {
                texel[3] = 0xFF;
            }
        }
        RawFormat::Rgba16 => {
            for texel in data.chunks_exact_mut(8) {
                texel[6] = 0xFF;
                texel[7] = 0xFF;
            }
        }
        RawFormat::Rgba16F => {
            let one = half::f16::ONE.to_le_bytes();
            for texel in data.chunks_exact_mut(8) {
                texel[6] = one[0];
                texel[7] = one[1];
            }
        }
        RawFormat::Rgba32F => {
            let one = 1.0f32.to_le_bytes();
            for texel in data.chunks_exact_mut(16) {
                texel[12..16].copy_from_slice(&one);
            }
        }
        RawFormat::G8 => {}
    }
}

/// Explicit capability registry: format identifier -> encoder, tiler
/// name -> tiler, plus the mip-filter capability.
pub struct EncoderRegistry {
    encoders: AHashMap<String, Arc<dyn TextureEncoder>>,
    tilers: AHashMap<String, Arc<dyn TextureTiler>>,
    mip_filter: Arc<dyn MipFilter>,
}

impl EncoderRegistry {
    /// Empty registry with the default box mip filter
    pub fn new() -> Self {
        Self {
            encoders: AHashMap::new(),
            tilers: AHashMap::new(),
            mip_filter: Arc::new(BoxMipFilter),
        }
    }

    /// Registry with the in-tree raw-container encoders registered
    pub fn with_default_encoders() -> Self {
        let mut registry = Self::new();
        registry.register_encoder(Arc::new(UncompressedEncoder::new(RawFormat::Bgra8)));
        registry.register_encoder(Arc::new(UncompressedEncoder::new(RawFormat::Rgba16F)));
        registry.register_encoder(Arc::new(UncompressedEncoder::new(RawFormat::G8)));
        registry
    }

    pub fn register_encoder(&mut self, encoder: Arc<dyn TextureEncoder>) {
        self.encoders.insert(encoder.name().as_str().to_string(), encoder);
    }

    pub fn find_encoder(&self, name: &FormatName) -> Option<Arc<dyn TextureEncoder>> {
        self.encoders.get(name.as_str()).cloned()
    }

    pub fn register_tiler(&mut self, tiler: Arc<dyn TextureTiler>) {
        self.tilers.insert(tiler.name().to_string(), tiler);
    }

    pub fn find_tiler(&self, name: &str) -> Option<Arc<dyn TextureTiler>> {
        self.tilers.get(name).cloned()
    }

    pub fn set_mip_filter(&mut self, filter: Arc<dyn MipFilter>) {
        self.mip_filter = filter;
    }

    pub fn mip_filter(&self) -> &Arc<dyn MipFilter> {
        &self.mip_filter
    }
}

impl Default for EncoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tephra_core::GammaSpace;

    fn checker_image(size: u32) -> RawImage {
        let info = ImageInfo::new_2d(size, size, RawFormat::Bgra8, GammaSpace::Linear);
        let mut image = RawImage::new_black(info);
        for y in 0..size {
            for x in 0..size {
                let v = if (x + y) % 2 == 0 { 1.0 } else { 0.0 };
                image.write_texel(x, y, 0, [v, v, v, 1.0]);
            }
        }
        image
    }

    #[test]
    fn test_box_filter_chain_lengths() {
        let chain = BoxMipFilter
            .generate_chain(&checker_image(8), MipGenMode::FromSource, 4)
            .unwrap();
        assert_eq!(chain.len(), 4);
        assert_eq!(chain[0].width(), 8);
        assert_eq!(chain[3].width(), 1);
    }

    #[test]
    fn test_box_filter_averages() {
        let chain = BoxMipFilter
            .generate_chain(&checker_image(2), MipGenMode::FromSource, 2)
            .unwrap();
        // A 2x2 checker averages to mid-gray
        let texel = chain[1].read_texel(0, 0, 0);
        assert!((texel[0] - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_no_mips_mode() {
        let chain = BoxMipFilter
            .generate_chain(&checker_image(8), MipGenMode::NoMips, 4)
            .unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_uncompressed_round_trip() {
        let encoder = UncompressedEncoder::new(RawFormat::Bgra8);
        let image = checker_image(4);
        let settings = BuildSettings::default();
        let encoded = encoder.encode_image(&image, &settings).unwrap();
        assert_eq!(encoded.len(), 4 * 4 * 4);

        let decoded = encoder.decode_image(&encoded, *image.info()).unwrap();
        assert_eq!(decoded.data(), image.data());
    }

    #[test]
    fn test_force_no_alpha() {
        let encoder = UncompressedEncoder::new(RawFormat::Bgra8);
        let info = ImageInfo::new_2d(2, 2, RawFormat::Bgra8, GammaSpace::Linear);
        let mut image = RawImage::new_black(info);
        image.write_texel(0, 0, 0, [0.2, 0.4, 0.6, 0.1]);

        let settings = BuildSettings {
            force_no_alpha_channel: true,
            ..Default::default()
        };
        let encoded = encoder.encode_image(&image, &settings).unwrap();
        for texel in encoded.chunks_exact(4) {
            assert_eq!(texel[3], 0xFF);
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = EncoderRegistry::with_default_encoders();
        assert!(registry.find_encoder(&FormatName::from("BGRA8")).is_some());
        assert!(registry.find_encoder(&FormatName::from("RGBA16F")).is_some());
        assert!(registry.find_encoder(&FormatName::from("BC7")).is_none());
        assert!(registry.find_tiler("console").is_none());
    }

    #[test]
    fn test_default_decode_refuses() {
        struct Opaque;
        impl TextureEncoder for Opaque {
            fn name(&self) -> FormatName {
                FormatName::from("OPAQUE")
            }
            fn encoded_format(&self, _settings: &BuildSettings) -> TextureFormat {
                TextureFormat::Uncompressed(RawFormat::Bgra8)
            }
            fn encode_image(
                &self,
                _image: &RawImage,
                _settings: &BuildSettings,
            ) -> Result<Vec<u8>, EncodeError> {
                Ok(Vec::new())
            }
        }
        let info = ImageInfo::new_2d(1, 1, RawFormat::Bgra8, GammaSpace::Linear);
        assert!(Opaque.decode_image(&[], info).is_err());
    }
}
