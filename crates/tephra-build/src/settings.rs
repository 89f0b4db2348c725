//! Build Settings
//!
//! Per-layer configuration controlling how source pixels become encoded
//! output, and the two-phase resolver that produces it. The first pass
//! resolves everything independent of the chosen encoder; the second
//! pass runs once per layer after the encoder is known and finalizes
//! encoder-specific fields and resolution caps.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use tephra_core::{AddressMode, FormatName, GammaSpace};

use crate::description::{EncodedTextureDescription, EncodedTextureExtendedData};
use crate::encoder::EncoderRegistry;
use crate::source::TextureSource;

/// Color adjustments applied while generating mips
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorAdjustment {
    pub brightness: f32,
    pub brightness_curve: f32,
    pub saturation: f32,
    pub vibrance: f32,
    pub rgb_curve: f32,
    pub hue: f32,
    pub min_alpha: f32,
    pub max_alpha: f32,
}

impl Default for ColorAdjustment {
    fn default() -> Self {
        Self {
            brightness: 1.0,
            brightness_curve: 1.0,
            saturation: 1.0,
            vibrance: 0.0,
            rgb_curve: 1.0,
            hue: 0.0,
            min_alpha: 0.0,
            max_alpha: 1.0,
        }
    }
}

/// Mip chain generation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MipGenMode {
    /// Generate a full chain from the top mip
    #[default]
    FromSource,
    /// Keep mips the source already carries
    LeaveExisting,
    /// Top mip only
    NoMips,
    /// Generate with sharpening, strength 0-10
    Sharpen(u8),
    /// Generate with blur, strength 1-5
    Blur(u8),
}

/// Power-of-two adjustment policy for non-pow2 sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PowerOfTwoMode {
    #[default]
    None,
    PadToPowerOfTwo,
    StretchToPowerOfTwo,
}

/// How much lossy compression the encoder may apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum LossyCompressionAmount {
    #[default]
    Default,
    Lowest,
    Low,
    Medium,
    High,
    Highest,
}

/// Mixing of a composite (detail) texture into the build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompositeTextureMode {
    #[default]
    Disabled,
    /// Modulate the alpha channel from the composite texture's roughness
    RoughnessToAlpha,
}

/// Encode speed tier. Fetch-first queries use the Final variant; the
/// fetch-or-build variant uses Fast, which is always buildable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncodeSpeed {
    #[default]
    Fast,
    Final,
}

/// Encoder effort level, finalized by the encoder second pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncodeEffort {
    Draft,
    #[default]
    Normal,
    Thorough,
}

/// Fully-resolved per-layer build configuration.
///
/// Immutable once constructed; cloned and specialized per layer and per
/// child build. `format_name` stays `None` until target-format
/// negotiation completes; nothing may derive a pixel format before it is
/// populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Negotiated target format; `None` means no build is possible
    pub format_name: Option<FormatName>,
    /// Format the decode build decodes from (the tiling chain's base)
    pub base_format_name: Option<FormatName>,
    /// Platform tiler responsible for this format, if any
    pub tiler: Option<String>,

    pub gamma: GammaSpace,
    pub color_adjustment: ColorAdjustment,
    pub mip_gen: MipGenMode,
    pub mip_sharpening: f32,
    pub downsample_with_average: bool,

    pub pow2_mode: PowerOfTwoMode,
    /// Largest allowed top-mip dimension; 0 means unlimited
    pub max_texture_resolution: u32,
    /// Uniform downscale factor applied before encoding; 1.0 is off
    pub downscale: f32,
    pub lossy_compression_amount: LossyCompressionAmount,

    pub force_alpha_channel: bool,
    pub force_no_alpha_channel: bool,

    pub composite_mode: CompositeTextureMode,
    pub composite_power: f32,

    pub cubemap: bool,
    pub texture_array: bool,
    pub volume: bool,
    pub lod_bias: i32,

    // Virtual texture fields
    pub virtual_streamable: bool,
    pub vt_tile_size: u32,
    pub vt_border_size: u32,
    pub address_mode_x: AddressMode,
    pub address_mode_y: AddressMode,
    pub ycocg_block_scale: bool,

    // Encoder-specific fields, written by the second resolver pass
    pub encode_speed: EncodeSpeed,
    pub effort: EncodeEffort,
    pub rdo_lambda: Option<f32>,
    pub supports_speed_tiers: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            format_name: None,
            base_format_name: None,
            tiler: None,
            gamma: GammaSpace::Linear,
            color_adjustment: ColorAdjustment::default(),
            mip_gen: MipGenMode::FromSource,
            mip_sharpening: 0.0,
            downsample_with_average: false,
            pow2_mode: PowerOfTwoMode::None,
            max_texture_resolution: 0,
            downscale: 1.0,
            lossy_compression_amount: LossyCompressionAmount::Default,
            force_alpha_channel: false,
            force_no_alpha_channel: false,
            composite_mode: CompositeTextureMode::Disabled,
            composite_power: 1.0,
            cubemap: false,
            texture_array: false,
            volume: false,
            lod_bias: 0,
            virtual_streamable: false,
            vt_tile_size: 128,
            vt_border_size: 4,
            address_mode_x: AddressMode::Wrap,
            address_mode_y: AddressMode::Wrap,
            ycocg_block_scale: false,
            encode_speed: EncodeSpeed::Fast,
            effort: EncodeEffort::Normal,
            rdo_lambda: None,
            supports_speed_tiers: false,
        }
    }
}

impl BuildSettings {
    /// Whether resolution produced a buildable configuration
    pub fn can_build(&self) -> bool {
        self.format_name.is_some()
    }

    /// Apply the resolution cap to source top-mip dimensions by halving
    /// until the largest dimension fits. Halving both axes preserves
    /// aspect ratio; depth shrinks only for volumes. Returns the capped
    /// dimensions and the number of halvings applied.
    pub fn apply_resolution_cap(
        &self,
        width: u32,
        height: u32,
        depth: u32,
    ) -> (u32, u32, u32, u32) {
        let cap = self.max_texture_resolution;
        if cap == 0 {
            return (width, height, depth, 0);
        }
        let (mut w, mut h, mut d) = (width, height, depth);
        let mut halvings = 0;
        while w.max(h) > cap {
            w = (w / 2).max(1);
            h = (h / 2).max(1);
            if self.volume {
                d = (d / 2).max(1);
            }
            halvings += 1;
        }
        (w, h, d, halvings)
    }
}

/// Engine-level inputs to the streaming mip-count policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureEngineParameters {
    /// Smallest mips always kept resident rather than streamed
    pub num_inline_mips: u32,
    /// Whether volume textures may stream mips
    pub volume_streaming: bool,
    /// Whether texture arrays may stream mips
    pub array_streaming: bool,
}

impl Default for TextureEngineParameters {
    fn default() -> Self {
        Self {
            num_inline_mips: 7,
            volume_streaming: false,
            array_streaming: true,
        }
    }
}

/// Number of mips that stream (the largest mips), given the resolved
/// description and any tiling extended data. The rest are inline: packed
/// into the mip tail or kept resident.
pub fn num_streaming_mips(
    description: &EncodedTextureDescription,
    extended: Option<&EncodedTextureExtendedData>,
    params: &TextureEngineParameters,
) -> u32 {
    if description.cubemap && !description.texture_array {
        return 0;
    }
    if description.volume && !params.volume_streaming {
        return 0;
    }
    if description.texture_array && !params.array_streaming {
        return 0;
    }
    let tail = extended.map_or(0, |e| e.num_mips_in_tail);
    let non_streaming = params.num_inline_mips.max(tail).min(description.num_mips);
    description.num_mips - non_streaming
}

/// Mip count a build will produce for a source, after the resolution cap
pub fn resolved_mip_count(settings: &BuildSettings, width: u32, height: u32) -> u32 {
    let (w, h, _, _) = settings.apply_resolution_cap(width, height, 1);
    match settings.mip_gen {
        MipGenMode::NoMips => 1,
        _ => tephra_core::image::full_mip_count(w, h),
    }
}

/// User-facing authoring options, before resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoringSettings {
    pub compression: CompressionClass,
    pub srgb: bool,
    pub mip_gen: MipGenMode,
    pub pow2_mode: PowerOfTwoMode,
    /// 0 = unlimited
    pub max_texture_resolution: u32,
    pub lossy_compression_amount: LossyCompressionAmount,
    pub force_alpha_channel: bool,
    pub force_no_alpha_channel: bool,
    pub composite_mode: CompositeTextureMode,
    pub composite_power: f32,
    pub cubemap: bool,
    pub texture_array: bool,
    pub volume: bool,
    pub lod_bias: i32,
    pub virtual_streamable: bool,
    pub vt_tile_size: u32,
    pub vt_border_size: u32,
    pub address_mode_x: AddressMode,
    pub address_mode_y: AddressMode,
    pub color_adjustment: ColorAdjustment,
    pub downscale: f32,
    /// Number of layers this texture authors (VT materials may stack)
    pub num_layers: u32,
}

impl Default for AuthoringSettings {
    fn default() -> Self {
        Self {
            compression: CompressionClass::Default,
            srgb: true,
            mip_gen: MipGenMode::FromSource,
            pow2_mode: PowerOfTwoMode::None,
            max_texture_resolution: 0,
            lossy_compression_amount: LossyCompressionAmount::Default,
            force_alpha_channel: false,
            force_no_alpha_channel: false,
            composite_mode: CompositeTextureMode::Disabled,
            composite_power: 1.0,
            cubemap: false,
            texture_array: false,
            volume: false,
            lod_bias: 0,
            virtual_streamable: false,
            vt_tile_size: 128,
            vt_border_size: 4,
            address_mode_x: AddressMode::Wrap,
            address_mode_y: AddressMode::Wrap,
            color_adjustment: ColorAdjustment::default(),
            downscale: 1.0,
            num_layers: 1,
        }
    }
}

/// Broad compression intent chosen by the author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionClass {
    #[default]
    Default,
    NormalMap,
    Masks,
    Hdr,
    Uncompressed,
}

/// Target platform/format capability query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetProfile {
    pub name: String,
    pub supports_bc: bool,
    pub supports_astc: bool,
    pub supports_etc: bool,
    /// Hardware ceiling on any texture dimension
    pub max_dimension: u32,
    /// Package-size ceiling on one built texture, if any
    pub built_size_budget_bytes: Option<u64>,
    /// Platform tiler required by this target's formats, if any
    pub tiler: Option<String>,
}

impl Default for TargetProfile {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            supports_bc: true,
            supports_astc: false,
            supports_etc: false,
            max_dimension: 16384,
            built_size_budget_bytes: None,
            tiler: None,
        }
    }
}

impl TargetProfile {
    /// Pick the target format name for an authoring intent, or `None`
    /// when this target supports nothing suitable.
    fn pick_format(&self, class: CompressionClass, hdr_source: bool) -> Option<FormatName> {
        let name = match class {
            CompressionClass::Uncompressed => {
                if hdr_source {
                    "RGBA16F"
                } else {
                    "BGRA8"
                }
            }
            CompressionClass::Hdr => {
                if self.supports_bc {
                    "BC6H"
                } else if self.supports_astc {
                    "ASTC_4x4"
                } else {
                    "RGBA16F"
                }
            }
            CompressionClass::NormalMap => {
                if self.supports_bc {
                    "BC5"
                } else if self.supports_etc {
                    "EAC_RG11"
                } else if self.supports_astc {
                    "ASTC_4x4"
                } else {
                    "BGRA8"
                }
            }
            CompressionClass::Masks => {
                if self.supports_bc {
                    "BC7"
                } else if self.supports_astc {
                    "ASTC_4x4"
                } else if self.supports_etc {
                    "ETC2_RGBA"
                } else {
                    "BGRA8"
                }
            }
            CompressionClass::Default => {
                if hdr_source {
                    return self.pick_format(CompressionClass::Hdr, true);
                }
                if self.supports_bc {
                    "BC7"
                } else if self.supports_astc {
                    "ASTC_6x6"
                } else if self.supports_etc {
                    "ETC2_RGBA"
                } else {
                    "BGRA8"
                }
            }
        };
        Some(FormatName::from(name))
    }
}

/// Per-layer resolved settings for one texture
pub type SettingsPerLayer = SmallVec<[BuildSettings; 1]>;

/// Two-phase settings resolver.
///
/// Holds the encoder registry by reference; there is no global format
/// lookup anywhere in the pipeline.
pub struct SettingsResolver<'a> {
    registry: &'a EncoderRegistry,
}

impl<'a> SettingsResolver<'a> {
    pub fn new(registry: &'a EncoderRegistry) -> Self {
        Self { registry }
    }

    /// First pass: everything that does not depend on the chosen encoder
    fn resolve_first_pass(&self, authoring: &AuthoringSettings) -> BuildSettings {
        BuildSettings {
            format_name: None,
            base_format_name: None,
            tiler: None,
            gamma: if authoring.srgb {
                GammaSpace::Srgb
            } else {
                GammaSpace::Linear
            },
            color_adjustment: authoring.color_adjustment.clone(),
            mip_gen: authoring.mip_gen,
            mip_sharpening: match authoring.mip_gen {
                MipGenMode::Sharpen(strength) => strength as f32 / 10.0,
                _ => 0.0,
            },
            downsample_with_average: true,
            pow2_mode: authoring.pow2_mode,
            max_texture_resolution: authoring.max_texture_resolution,
            downscale: authoring.downscale.max(1.0),
            lossy_compression_amount: authoring.lossy_compression_amount,
            force_alpha_channel: authoring.force_alpha_channel,
            force_no_alpha_channel: authoring.force_no_alpha_channel,
            composite_mode: authoring.composite_mode,
            composite_power: authoring.composite_power,
            cubemap: authoring.cubemap,
            texture_array: authoring.texture_array,
            volume: authoring.volume,
            lod_bias: authoring.lod_bias,
            virtual_streamable: authoring.virtual_streamable,
            vt_tile_size: authoring.vt_tile_size,
            vt_border_size: authoring.vt_border_size,
            address_mode_x: authoring.address_mode_x,
            address_mode_y: authoring.address_mode_y,
            ycocg_block_scale: false,
            encode_speed: EncodeSpeed::Fast,
            effort: EncodeEffort::Normal,
            rdo_lambda: None,
            supports_speed_tiers: false,
        }
    }

    /// Resolve one `BuildSettings` per layer for a target and speed tier.
    ///
    /// If the target encoder cannot be found the layer resolves with
    /// `format_name == None`: no build is possible, and callers must
    /// treat it that way rather than crash later.
    pub fn resolve(
        &self,
        source: &TextureSource,
        authoring: &AuthoringSettings,
        target: &TargetProfile,
        speed: EncodeSpeed,
    ) -> SettingsPerLayer {
        let base = self.resolve_first_pass(authoring);
        let num_layers = (authoring.num_layers.max(1) as usize).min(source.num_layers().max(1));

        (0..num_layers)
            .map(|layer| self.resolve_layer(&base, source, authoring, target, speed, layer))
            .collect()
    }

    /// Second pass for one layer, once the encoder is known
    fn resolve_layer(
        &self,
        base: &BuildSettings,
        source: &TextureSource,
        authoring: &AuthoringSettings,
        target: &TargetProfile,
        speed: EncodeSpeed,
        layer: usize,
    ) -> BuildSettings {
        let mut settings = base.clone();
        settings.encode_speed = speed;

        let hdr = source.is_hdr(layer);
        let Some(format_name) = target.pick_format(authoring.compression, hdr) else {
            log::warn!(
                "texture '{}' layer {layer}: target '{}' has no format for {:?}",
                source.name,
                target.name,
                authoring.compression
            );
            return settings;
        };

        let Some(encoder) = self.registry.find_encoder(&format_name) else {
            log::warn!(
                "texture '{}' layer {layer}: no encoder registered for '{format_name}'",
                source.name,
            );
            // Fails closed: format_name stays None and no build happens
            return settings;
        };

        settings.format_name = Some(format_name.clone());
        settings.base_format_name = Some(format_name);
        settings.tiler = target.tiler.clone();

        // Encoder-specific knobs
        encoder.finalize_settings(&mut settings);

        // Hardware ceiling folds into the resolution cap
        if target.max_dimension > 0 {
            settings.max_texture_resolution = if settings.max_texture_resolution == 0 {
                target.max_dimension
            } else {
                settings.max_texture_resolution.min(target.max_dimension)
            };
        }

        // Package-size ceiling: halve the cap until the estimated built
        // size fits, compensating LOD bias so visual degradation matches
        // non-capped textures.
        if let Some(budget) = target.built_size_budget_bytes {
            self.shrink_to_budget(&mut settings, source, budget);
        }

        settings
    }

    fn shrink_to_budget(&self, settings: &mut BuildSettings, source: &TextureSource, budget: u64) {
        let Some(format_name) = settings.format_name.as_ref() else {
            return;
        };
        let Some(encoder) = self.registry.find_encoder(format_name) else {
            return;
        };
        let format = encoder.encoded_format(settings);

        let (source_w, source_h) = source.top_dimensions();
        loop {
            let (w, h, _, _) = settings.apply_resolution_cap(source_w, source_h, 1);
            let num_mips = tephra_core::image::full_mip_count(w, h);
            let description = EncodedTextureDescription::new_2d(w, h, num_mips, format);
            if description.total_size_bytes() <= budget || w.max(h) <= 1 {
                break;
            }
            settings.max_texture_resolution = (w.max(h) / 2).max(1);
            settings.lod_bias += 1;
        }
    }
}
