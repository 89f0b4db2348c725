//! Cache Key Computation
//!
//! Deterministically serializes build settings and the build-graph shape
//! into a content hash. The serialization is a fixed-order little-endian
//! byte stream, so keys are identical across machines and endianness.
//!
//! Every settings field is serialized unconditionally. Changing the
//! meaning, order, or set of serialized fields requires bumping
//! [`TEXTURE_KEY_FORMAT_VERSION`]; there are no conditionally-written
//! fields that keep old keys alive.

use tephra_cache::{CacheKey, ContentHash};
use tephra_core::{AddressMode, GammaSpace};

use crate::settings::{
    BuildSettings, CompositeTextureMode, EncodeEffort, EncodeSpeed, LossyCompressionAmount,
    MipGenMode, PowerOfTwoMode,
};

/// Global texture key version. Bump on any change to the serialized
/// field set or to build semantics that alter output bytes.
pub const TEXTURE_KEY_FORMAT_VERSION: &str = "8F41C2D6A95E4B07B3E18C5F60D92A74";

/// Namespace bucket for texture cache keys
pub const TEXTURE_KEY_BUCKET: &str = "TEXTURE";

/// Fixed-order little-endian byte writer for key serialization
#[derive(Default)]
pub struct KeyWriter {
    buf: Vec<u8>,
}

impl KeyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Floats are written as their IEEE-754 bit pattern
    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Length-prefixed UTF-8
    pub fn write_str(&mut self, v: &str) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn write_opt_str(&mut self, v: Option<&str>) {
        match v {
            Some(s) => {
                self.write_bool(true);
                self.write_str(s);
            }
            None => self.write_bool(false),
        }
    }

    pub fn write_hash(&mut self, v: &ContentHash) {
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn gamma_tag(gamma: GammaSpace) -> u8 {
    match gamma {
        GammaSpace::Linear => 0,
        GammaSpace::Srgb => 1,
        GammaSpace::Pow22 => 2,
    }
}

fn address_tag(mode: AddressMode) -> u8 {
    match mode {
        AddressMode::Wrap => 0,
        AddressMode::Clamp => 1,
        AddressMode::Mirror => 2,
    }
}

fn mip_gen_tag(mode: MipGenMode) -> (u8, u8) {
    match mode {
        MipGenMode::FromSource => (0, 0),
        MipGenMode::LeaveExisting => (1, 0),
        MipGenMode::NoMips => (2, 0),
        MipGenMode::Sharpen(s) => (3, s),
        MipGenMode::Blur(s) => (4, s),
    }
}

/// Serialize one layer's settings into the writer. Field order is part
/// of the key format; append-only changes still require a version bump.
pub fn serialize_settings(writer: &mut KeyWriter, settings: &BuildSettings) {
    let ca = &settings.color_adjustment;
    writer.write_f32(ca.brightness);
    writer.write_f32(ca.brightness_curve);
    writer.write_f32(ca.saturation);
    writer.write_f32(ca.vibrance);
    writer.write_f32(ca.rgb_curve);
    writer.write_f32(ca.hue);
    writer.write_f32(ca.min_alpha);
    writer.write_f32(ca.max_alpha);

    writer.write_f32(settings.mip_sharpening);
    let (mip_tag, mip_arg) = mip_gen_tag(settings.mip_gen);
    writer.write_u8(mip_tag);
    writer.write_u8(mip_arg);
    writer.write_bool(settings.downsample_with_average);

    writer.write_u8(gamma_tag(settings.gamma));
    writer.write_u8(match settings.pow2_mode {
        PowerOfTwoMode::None => 0,
        PowerOfTwoMode::PadToPowerOfTwo => 1,
        PowerOfTwoMode::StretchToPowerOfTwo => 2,
    });
    writer.write_u32(settings.max_texture_resolution);
    writer.write_f32(settings.downscale);
    writer.write_u8(match settings.lossy_compression_amount {
        LossyCompressionAmount::Default => 0,
        LossyCompressionAmount::Lowest => 1,
        LossyCompressionAmount::Low => 2,
        LossyCompressionAmount::Medium => 3,
        LossyCompressionAmount::High => 4,
        LossyCompressionAmount::Highest => 5,
    });

    writer.write_bool(settings.force_alpha_channel);
    writer.write_bool(settings.force_no_alpha_channel);

    writer.write_u8(match settings.composite_mode {
        CompositeTextureMode::Disabled => 0,
        CompositeTextureMode::RoughnessToAlpha => 1,
    });
    writer.write_f32(settings.composite_power);

    writer.write_bool(settings.cubemap);
    writer.write_bool(settings.texture_array);
    writer.write_bool(settings.volume);
    writer.write_i32(settings.lod_bias);

    writer.write_bool(settings.virtual_streamable);
    writer.write_u32(settings.vt_tile_size);
    writer.write_u32(settings.vt_border_size);
    writer.write_u8(address_tag(settings.address_mode_x));
    writer.write_u8(address_tag(settings.address_mode_y));
    writer.write_bool(settings.ycocg_block_scale);

    writer.write_opt_str(settings.format_name.as_ref().map(|n| n.as_str()));
    writer.write_opt_str(settings.base_format_name.as_ref().map(|n| n.as_str()));
    writer.write_opt_str(settings.tiler.as_deref());

    writer.write_u8(match settings.encode_speed {
        EncodeSpeed::Fast => 0,
        EncodeSpeed::Final => 1,
    });
    writer.write_u8(match settings.effort {
        EncodeEffort::Draft => 0,
        EncodeEffort::Normal => 1,
        EncodeEffort::Thorough => 2,
    });
    match settings.rdo_lambda {
        Some(lambda) => {
            writer.write_bool(true);
            writer.write_f32(lambda);
        }
        None => writer.write_bool(false),
    }
    writer.write_bool(settings.supports_speed_tiers);
}

/// Serialized key suffix for a whole per-layer settings array
pub fn compute_settings_suffix(settings_per_layer: &[BuildSettings]) -> Vec<u8> {
    let mut writer = KeyWriter::new();
    writer.write_str(TEXTURE_KEY_FORMAT_VERSION);
    writer.write_u32(settings_per_layer.len() as u32);
    for settings in settings_per_layer {
        serialize_settings(&mut writer, settings);
    }
    writer.finish()
}

/// Key for a plain (single-node) texture build
pub fn compute_texture_key(
    settings_per_layer: &[BuildSettings],
    source_id: &ContentHash,
    composite_id: Option<&ContentHash>,
) -> CacheKey {
    let suffix = compute_settings_suffix(settings_per_layer);
    let mut writer = KeyWriter::new();
    writer.write_u32(suffix.len() as u32);
    writer.write_bytes(&suffix);
    writer.write_hash(source_id);
    match composite_id {
        Some(id) => {
            writer.write_bool(true);
            writer.write_hash(id);
        }
        None => writer.write_bool(false),
    }
    CacheKey::namespaced(TEXTURE_KEY_BUCKET, &writer.finish())
}

/// Key over an entire build dependency chain.
///
/// Folds each dependency node's own definition hash, so the key
/// identifies the whole chain, not just the leaf settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredKey {
    pub build_node: ContentHash,
    pub tiling_node: Option<ContentHash>,
    pub detile_node: Option<ContentHash>,
    pub decode_node: Option<ContentHash>,
    pub source_id: ContentHash,
    pub composite_id: Option<ContentHash>,
}

impl StructuredKey {
    pub fn compute(&self) -> CacheKey {
        let mut writer = KeyWriter::new();
        writer.write_str(TEXTURE_KEY_FORMAT_VERSION);
        writer.write_hash(&self.build_node);
        for node in [&self.tiling_node, &self.detile_node, &self.decode_node] {
            match node {
                Some(hash) => {
                    writer.write_bool(true);
                    writer.write_hash(hash);
                }
                None => writer.write_bool(false),
            }
        }
        writer.write_hash(&self.source_id);
        match &self.composite_id {
            Some(hash) => {
                writer.write_bool(true);
                writer.write_hash(hash);
            }
            None => writer.write_bool(false),
        }
        CacheKey::namespaced(TEXTURE_KEY_BUCKET, &writer.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tephra_core::FormatName;

    fn base_settings() -> BuildSettings {
        BuildSettings {
            format_name: Some(FormatName::from("BGRA8")),
            base_format_name: Some(FormatName::from("BGRA8")),
            ..Default::default()
        }
    }

    fn key_of(settings: &BuildSettings) -> CacheKey {
        compute_texture_key(
            std::slice::from_ref(settings),
            &ContentHash::of(b"source"),
            None,
        )
    }

    #[test]
    fn test_key_is_deterministic() {
        let settings = base_settings();
        assert_eq!(key_of(&settings), key_of(&settings));
    }

    #[test]
    fn test_every_field_affects_the_key() {
        let base = base_settings();
        let base_key = key_of(&base);

        let mutations: Vec<(&str, Box<dyn Fn(&mut BuildSettings)>)> = vec![
            ("brightness", Box::new(|s| s.color_adjustment.brightness = 2.0)),
            ("saturation", Box::new(|s| s.color_adjustment.saturation = 0.5)),
            ("hue", Box::new(|s| s.color_adjustment.hue = 90.0)),
            ("max_alpha", Box::new(|s| s.color_adjustment.max_alpha = 0.9)),
            ("mip_sharpening", Box::new(|s| s.mip_sharpening = 0.5)),
            ("mip_gen", Box::new(|s| s.mip_gen = MipGenMode::NoMips)),
            ("mip_gen_arg", Box::new(|s| s.mip_gen = MipGenMode::Sharpen(4))),
            ("gamma", Box::new(|s| s.gamma = GammaSpace::Srgb)),
            ("pow2_mode", Box::new(|s| s.pow2_mode = PowerOfTwoMode::PadToPowerOfTwo)),
            ("max_resolution", Box::new(|s| s.max_texture_resolution = 512)),
            ("downscale", Box::new(|s| s.downscale = 2.0)),
            (
                "lossy_amount",
                Box::new(|s| s.lossy_compression_amount = LossyCompressionAmount::High),
            ),
            ("force_alpha", Box::new(|s| s.force_alpha_channel = true)),
            ("force_no_alpha", Box::new(|s| s.force_no_alpha_channel = true)),
            (
                "composite_mode",
                Box::new(|s| s.composite_mode = CompositeTextureMode::RoughnessToAlpha),
            ),
            ("composite_power", Box::new(|s| s.composite_power = 2.0)),
            ("cubemap", Box::new(|s| s.cubemap = true)),
            ("texture_array", Box::new(|s| s.texture_array = true)),
            ("volume", Box::new(|s| s.volume = true)),
            ("lod_bias", Box::new(|s| s.lod_bias = 1)),
            ("virtual_streamable", Box::new(|s| s.virtual_streamable = true)),
            ("vt_tile_size", Box::new(|s| s.vt_tile_size = 256)),
            ("vt_border_size", Box::new(|s| s.vt_border_size = 8)),
            ("address_mode_x", Box::new(|s| s.address_mode_x = AddressMode::Clamp)),
            ("address_mode_y", Box::new(|s| s.address_mode_y = AddressMode::Mirror)),
            ("ycocg", Box::new(|s| s.ycocg_block_scale = true)),
            ("format_name", Box::new(|s| s.format_name = Some(FormatName::from("RGBA16F")))),
            ("tiler", Box::new(|s| s.tiler = Some("console".to_string()))),
            ("encode_speed", Box::new(|s| s.encode_speed = EncodeSpeed::Final)),
            ("effort", Box::new(|s| s.effort = EncodeEffort::Thorough)),
            ("rdo_lambda", Box::new(|s| s.rdo_lambda = Some(0.1))),
            ("supports_speed_tiers", Box::new(|s| s.supports_speed_tiers = true)),
        ];

        for (name, mutate) in mutations {
            let mut mutated = base.clone();
            mutate(&mut mutated);
            assert_ne!(
                key_of(&mutated),
                base_key,
                "mutating '{name}' must change the cache key"
            );
        }
    }

    #[test]
    fn test_source_content_affects_key() {
        let settings = base_settings();
        let a = compute_texture_key(
            std::slice::from_ref(&settings),
            &ContentHash::of(b"source-a"),
            None,
        );
        let b = compute_texture_key(
            std::slice::from_ref(&settings),
            &ContentHash::of(b"source-b"),
            None,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_composite_presence_affects_key() {
        let settings = base_settings();
        let source = ContentHash::of(b"source");
        let without = compute_texture_key(std::slice::from_ref(&settings), &source, None);
        let with = compute_texture_key(
            std::slice::from_ref(&settings),
            &source,
            Some(&ContentHash::of(b"composite")),
        );
        assert_ne!(without, with);
    }

    #[test]
    fn test_structured_key_folds_dependency_chain() {
        let base = StructuredKey {
            build_node: ContentHash::of(b"base"),
            tiling_node: None,
            detile_node: None,
            decode_node: None,
            source_id: ContentHash::of(b"src"),
            composite_id: None,
        };
        let mut with_tiling = base.clone();
        with_tiling.tiling_node = Some(ContentHash::of(b"tiling"));
        let mut with_chain = with_tiling.clone();
        with_chain.detile_node = Some(ContentHash::of(b"detile"));

        let keys = [base.compute(), with_tiling.compute(), with_chain.compute()];
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[1], keys[2]);
        assert_ne!(keys[0], keys[2]);
    }

    #[test]
    fn test_layer_count_affects_key() {
        let settings = base_settings();
        let one = compute_texture_key(
            std::slice::from_ref(&settings),
            &ContentHash::of(b"src"),
            None,
        );
        let two = compute_texture_key(
            &[settings.clone(), settings.clone()],
            &ContentHash::of(b"src"),
            None,
        );
        assert_ne!(one, two);
    }
}
