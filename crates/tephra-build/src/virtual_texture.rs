//! Virtual Texture Tile Builder
//!
//! Partitions a (possibly multi-block/UDIM) logical image into
//! fixed-size bordered tiles per mip level, encodes tiles independently
//! (in parallel within a mip), and packs them into size-bounded chunks
//! with a Morton-indexed offset table.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use tephra_core::image::{full_mip_count, round_up_pow2, ImageInfo};
use tephra_core::{CancellationToken, RawImage, TextureFormat};

use crate::chunk::{morton_tiles, ChunkPacker, EncodedTile, MipTileGrid, TileOffsetTable};
use crate::description::EncodedTextureDescription;
use crate::encoder::{EncoderRegistry, TextureEncoder};
use crate::error::{BuildError, BuildResult, ValidationError};
use crate::settings::{BuildSettings, CompositeTextureMode, MipGenMode};
use crate::source::TextureSource;

/// Upper bound on logical image texels; builds beyond this are rejected
/// outright rather than attempted
pub const MAX_LOGICAL_TEXELS: u64 = 1 << 32;

/// Tile layout of a built virtual texture: everything a consumer needs
/// to address tiles without scanning chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualTextureLayout {
    pub tile_size: u32,
    pub border_size: u32,
    pub num_mips: u32,
    /// Mip 0 tile grid
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub layer_formats: Vec<TextureFormat>,
    /// Color sampled outside any resident tile, one per layer: the
    /// single texel of that layer's last mip
    pub layer_fallback_colors: Vec<[f32; 4]>,
    /// Mip bias of each source block relative to the largest block
    pub block_mip_bias: Vec<u32>,
    pub table: TileOffsetTable,
}

/// Result of a virtual-texture build
#[derive(Debug, Clone)]
pub struct VirtualTextureBuildOutput {
    pub description: EncodedTextureDescription,
    pub layout: VirtualTextureLayout,
    pub chunks: Vec<Vec<u8>>,
}

/// Normalized block geometry shared by all layers
struct BlockGeometry {
    /// Power-of-two block cell size; every block is normalized to it
    cell_w: u32,
    cell_h: u32,
    /// Block grid extent
    grid_w: u32,
    grid_h: u32,
    /// Per-block mip bias relative to the cell before normalization
    bias: Vec<u32>,
}

pub struct VirtualTextureTileBuilder<'a> {
    registry: &'a EncoderRegistry,
}

impl<'a> VirtualTextureTileBuilder<'a> {
    pub fn new(registry: &'a EncoderRegistry) -> Self {
        Self { registry }
    }

    /// Build all layers of a virtual texture into packed chunks plus a
    /// Morton-indexed offset table.
    pub fn build(
        &self,
        source: &TextureSource,
        composite: Option<&TextureSource>,
        settings_per_layer: &[BuildSettings],
        token: &CancellationToken,
    ) -> BuildResult<VirtualTextureBuildOutput> {
        source.validate()?;
        if settings_per_layer.len() != source.num_layers() {
            return Err(ValidationError::LayerCountMismatch {
                settings: settings_per_layer.len(),
                source_layers: source.num_layers(),
            }
            .into());
        }

        let base = &settings_per_layer[0];
        let tile_size = base.vt_tile_size;
        let border = base.vt_border_size;

        let geometry = resolve_block_geometry(source, tile_size)?;
        let logical_w = geometry.grid_w as u64 * geometry.cell_w as u64;
        let logical_h = geometry.grid_h as u64 * geometry.cell_h as u64;
        if logical_w * logical_h > MAX_LOGICAL_TEXELS {
            return Err(ValidationError::OversizedPixelCount {
                total: logical_w * logical_h,
                max: MAX_LOGICAL_TEXELS,
            }
            .into());
        }

        // Per-layer mip chains of the whole logical image
        let mut layer_levels: Vec<Vec<RawImage>> = Vec::with_capacity(settings_per_layer.len());
        let mut layer_formats = Vec::new();
        let mut layer_fallback_colors = Vec::new();
        let mut layer_codec_payloads = Vec::new();
        let mut all_layers_raw = true;

        for (layer, settings) in settings_per_layer.iter().enumerate() {
            if token.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            let Some(format_name) = settings.format_name.as_ref() else {
                return Err(BuildError::FormatUnresolved {
                    texture: source.name.clone(),
                });
            };
            let encoder = self.registry.find_encoder(format_name).ok_or_else(|| {
                BuildError::Resolution {
                    texture: source.name.clone(),
                    format: format_name.to_string(),
                }
            })?;

            let mut levels =
                self.compose_level_chain(source, layer, settings, &geometry, encoder.as_ref())?;

            if layer == 0 && settings.composite_mode == CompositeTextureMode::RoughnessToAlpha {
                if let Some(composite) = composite {
                    let composite_levels = self.compose_level_chain(
                        composite,
                        0,
                        settings,
                        &resolve_block_geometry(composite, tile_size)?,
                        encoder.as_ref(),
                    )?;
                    apply_composite(&mut levels, &composite_levels, settings.composite_power);
                }
            }

            let last = levels.last().expect("chain is never empty");
            layer_fallback_colors.push(last.read_texel(0, 0, 0));
            layer_formats.push(encoder.encoded_format(settings));
            layer_codec_payloads.push(encoder.codec_payload());
            all_layers_raw &= encoder.is_raw_container();
            layer_levels.push(levels);
        }

        let num_mips = layer_levels[0].len() as u32;

        // Encode tiles mip by mip; larger mips first so they land in
        // earlier chunks.
        let mut tiles_per_mip: Vec<Vec<EncodedTile>> = Vec::with_capacity(num_mips as usize);
        let mut grids = Vec::with_capacity(num_mips as usize);
        for mip in 0..num_mips {
            if token.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            let level = &layer_levels[0][mip as usize];
            let grid = MipTileGrid {
                width_in_tiles: level.width().div_ceil(tile_size),
                height_in_tiles: level.height().div_ceil(tile_size),
            };
            grids.push(grid);

            let coords = morton_tiles(grid);
            let mut per_coord: Vec<EncodedTile> = coords
                .iter()
                .map(|&(x, y)| EncodedTile {
                    mip,
                    tile_x: x,
                    tile_y: y,
                    layer_payloads: Vec::with_capacity(settings_per_layer.len()),
                })
                .collect();

            for (layer, settings) in settings_per_layer.iter().enumerate() {
                let format_name = settings.format_name.as_ref().expect("checked above");
                let encoder = self
                    .registry
                    .find_encoder(format_name)
                    .expect("checked above");
                let level = &layer_levels[layer][mip as usize];

                // Every tile writes into its own pre-sized slot, so the
                // parallel encode is race-free and placement is
                // deterministic regardless of completion order.
                let payloads: Result<Vec<Vec<u8>>, BuildError> = coords
                    .par_iter()
                    .map(|&(x, y)| {
                        if token.is_cancelled() {
                            return Err(BuildError::Cancelled);
                        }
                        let bordered = level.extract_bordered(
                            x as i64 * tile_size as i64 - border as i64,
                            y as i64 * tile_size as i64 - border as i64,
                            tile_size + 2 * border,
                            tile_size + 2 * border,
                            settings.address_mode_x,
                            settings.address_mode_y,
                        );
                        encoder.encode_image(&bordered, settings).map_err(|e| {
                            BuildError::Encoder {
                                texture: source.name.clone(),
                                node: "VirtualTexture".to_string(),
                                message: e.to_string(),
                            }
                        })
                    })
                    .collect();

                for (tile, payload) in per_coord.iter_mut().zip(payloads?) {
                    tile.layer_payloads.push(payload);
                }
            }
            tiles_per_mip.push(per_coord);
        }

        if token.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let mut packer = ChunkPacker::new(tile_size, settings_per_layer.len() as u32);
        packer.layer_codec_payloads = layer_codec_payloads;
        packer.all_layers_raw = all_layers_raw;
        let (chunks, table) = packer.pack(&tiles_per_mip, &grids)?;

        let description = EncodedTextureDescription {
            top_mip_size_x: logical_w as u32,
            top_mip_size_y: logical_h as u32,
            top_mip_size_z: 1,
            array_size: 1,
            num_mips,
            format: layer_formats[0],
            cubemap: false,
            texture_array: false,
            volume: false,
        };

        Ok(VirtualTextureBuildOutput {
            description,
            layout: VirtualTextureLayout {
                tile_size,
                border_size: border,
                num_mips,
                width_in_tiles: grids[0].width_in_tiles,
                height_in_tiles: grids[0].height_in_tiles,
                layer_formats,
                layer_fallback_colors,
                block_mip_bias: geometry.bias,
                table,
            },
            chunks,
        })
    }

    /// Full-level mip chain of the logical image for one layer: blocks
    /// normalized to the cell size, mosaicked per mip while block data
    /// exists, then the synthesized miptail continues down to 1x1.
    fn compose_level_chain(
        &self,
        source: &TextureSource,
        layer: usize,
        settings: &BuildSettings,
        geometry: &BlockGeometry,
        encoder: &dyn TextureEncoder,
    ) -> BuildResult<Vec<RawImage>> {
        let intermediate = encoder.intermediate_format(source.is_hdr(layer));
        let mip_filter = self.registry.mip_filter();
        let cell_mips = full_mip_count(geometry.cell_w, geometry.cell_h);

        // Per-block chains in the intermediate format
        let mut block_chains = Vec::with_capacity(source.blocks.len());
        for block in &source.blocks {
            let image = &block.layers[layer];
            let mut normalized = image.convert_to(intermediate);
            if normalized.width() != geometry.cell_w || normalized.height() != geometry.cell_h {
                // Upscale only; resolve_block_geometry rejected anything
                // that would need shrinking or an aspect change.
                normalized = normalized.upscale_to(geometry.cell_w, geometry.cell_h);
            }
            let chain = mip_filter
                .generate_chain(&normalized, settings.mip_gen, cell_mips)
                .map_err(|e| BuildError::Encoder {
                    texture: source.name.clone(),
                    node: "MipFilter".to_string(),
                    message: e.to_string(),
                })?;
            block_chains.push(chain);
        }

        // Mosaic the block mips into whole-level images
        let mut levels = Vec::new();
        for mip in 0..cell_mips as usize {
            let block_level = &block_chains[0][mip];
            if source.blocks.len() == 1 {
                levels.push(block_level.clone());
                continue;
            }
            let level_w = geometry.grid_w * block_level.width();
            let level_h = geometry.grid_h * block_level.height();
            let mut level = RawImage::new_black(ImageInfo {
                width: level_w,
                height: level_h,
                num_slices: 1,
                format: intermediate,
                gamma: block_level.info().gamma,
            });
            for (block, chain) in source.blocks.iter().zip(&block_chains) {
                let sub = &chain[mip];
                let origin_x = block.block_x * sub.width();
                let origin_y = block.block_y * sub.height();
                for y in 0..sub.height() {
                    for x in 0..sub.width() {
                        level.write_texel(
                            origin_x + x,
                            origin_y + y,
                            0,
                            sub.read_texel(x, y, 0),
                        );
                    }
                }
            }
            levels.push(level);
        }

        // Miptail: once per-block mips run out, keep filtering the last
        // mosaic (per-block 1x1 texels arranged by block coordinate)
        // until the chain reaches 1x1.
        let last = levels.last().expect("cell chain is never empty");
        if last.width() > 1 || last.height() > 1 {
            let remaining = full_mip_count(last.width(), last.height());
            let tail = mip_filter
                .generate_chain(last, MipGenMode::FromSource, remaining)
                .map_err(|e| BuildError::Encoder {
                    texture: source.name.clone(),
                    node: "MipFilter".to_string(),
                    message: e.to_string(),
                })?;
            levels.extend(tail.into_iter().skip(1));
        }

        Ok(levels)
    }
}

/// Validate and normalize block geometry.
///
/// Every block must keep its aspect ratio under power-of-two adjustment
/// and agree with the others on aspect; a mismatch is a hard build
/// failure because all blocks must share one mip-bias-consistent layout.
fn resolve_block_geometry(source: &TextureSource, tile_size: u32) -> BuildResult<BlockGeometry> {
    let mut cell_w = 0u32;
    let mut cell_h = 0u32;
    let mut grid_w = 0u32;
    let mut grid_h = 0u32;
    let mut pow2_dims = Vec::with_capacity(source.blocks.len());

    for block in &source.blocks {
        let image = &block.layers[0];
        let (w, h) = (image.width(), image.height());
        let (pw, ph) = (round_up_pow2(w), round_up_pow2(h));
        if w as u64 * ph as u64 != h as u64 * pw as u64 {
            return Err(ValidationError::BlockAspectMismatch {
                block_x: block.block_x,
                block_y: block.block_y,
                width: w,
                height: h,
                adjusted_width: pw,
                adjusted_height: ph,
            }
            .into());
        }
        pow2_dims.push((pw, ph));
        cell_w = cell_w.max(pw);
        cell_h = cell_h.max(ph);
        grid_w = grid_w.max(block.block_x + 1);
        grid_h = grid_h.max(block.block_y + 1);
    }

    // Blocks smaller than one tile are upscaled, never downscaled; scale
    // the cell uniformly so the smallest dimension reaches the tile size.
    if cell_w.min(cell_h) < tile_size {
        let factor = round_up_pow2(tile_size.div_ceil(cell_w.min(cell_h)));
        cell_w *= factor;
        cell_h *= factor;
    }

    let mut bias = Vec::with_capacity(pow2_dims.len());
    for (pw, ph) in &pow2_dims {
        // Both are powers of two with pw <= cell_w, so these divide evenly
        let ratio_w = cell_w / pw;
        let ratio_h = cell_h / ph;
        if ratio_w != ratio_h {
            return Err(ValidationError::InconsistentBlockAspect(*pw, *ph, cell_w, cell_h).into());
        }
        bias.push(ratio_w.ilog2());
    }

    Ok(BlockGeometry {
        cell_w,
        cell_h,
        grid_w,
        grid_h,
        bias,
    })
}

/// Modulate layer-0 alpha from the composite texture's luminance
pub(crate) fn apply_composite(levels: &mut [RawImage], composite_levels: &[RawImage], power: f32) {
    for (mip, level) in levels.iter_mut().enumerate() {
        let composite = match composite_levels.get(mip) {
            Some(image) => image,
            None => composite_levels.last().expect("composite chain is never empty"),
        };
        for y in 0..level.height() {
            for x in 0..level.width() {
                let cx = x.min(composite.width() - 1);
                let cy = y.min(composite.height() - 1);
                let c = composite.read_texel(cx, cy, 0);
                let luminance = 0.2126 * c[0] + 0.7152 * c[1] + 0.0722 * c[2];
                let mut texel = level.read_texel(x, y, 0);
                texel[3] = (luminance * power).clamp(0.0, 1.0);
                level.write_texel(x, y, 0, texel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::read_tile;
    use crate::settings::BuildSettings;
    use crate::source::SourceBlock;
    use tephra_core::{FormatName, GammaSpace, RawFormat};

    fn vt_settings(tile_size: u32, border: u32) -> BuildSettings {
        BuildSettings {
            format_name: Some(FormatName::from("BGRA8")),
            base_format_name: Some(FormatName::from("BGRA8")),
            virtual_streamable: true,
            vt_tile_size: tile_size,
            vt_border_size: border,
            ..Default::default()
        }
    }

    fn gradient_source(size: u32) -> TextureSource {
        let info = ImageInfo::new_2d(size, size, RawFormat::Bgra8, GammaSpace::Linear);
        let mut image = RawImage::new_black(info);
        for y in 0..size {
            for x in 0..size {
                image.write_texel(
                    x,
                    y,
                    0,
                    [
                        x as f32 / size as f32,
                        y as f32 / size as f32,
                        0.5,
                        1.0,
                    ],
                );
            }
        }
        TextureSource::new_2d("vt-test", image)
    }

    #[test]
    fn test_256_single_block_mip_and_tile_counts() {
        // 256x256, tile 128, border 4: 9 mips, mip 0 is a 2x2 grid in
        // Morton order, the 1x1 mip yields exactly one tile.
        let registry = EncoderRegistry::with_default_encoders();
        let builder = VirtualTextureTileBuilder::new(&registry);
        let settings = [vt_settings(128, 4)];
        let output = builder
            .build(&gradient_source(256), None, &settings, &CancellationToken::new())
            .unwrap();

        assert_eq!(output.layout.num_mips, 9);
        assert_eq!(output.layout.width_in_tiles, 2);
        assert_eq!(output.layout.height_in_tiles, 2);

        // Morton order of the top mip: (0,0), (1,0), (0,1), (1,1)
        let offsets: Vec<u32> = [(0u32, 0u32), (1, 0), (0, 1), (1, 1)]
            .iter()
            .map(|&(x, y)| output.layout.table.lookup(0, x, y, 0).unwrap().offset)
            .collect();
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));

        // Every smaller mip is a single tile; the last is the 1x1 mip
        for mip in 1..9 {
            let grid = output.layout.table.per_mip[mip as usize].grid;
            assert_eq!((grid.width_in_tiles, grid.height_in_tiles), (1, 1), "mip {mip}");
        }
        assert!(output.layout.table.lookup(8, 0, 0, 0).is_some());
        assert!(output.layout.table.lookup(8, 1, 0, 0).is_none());
    }

    #[test]
    fn test_tile_round_trip_matches_bordered_extraction() {
        let registry = EncoderRegistry::with_default_encoders();
        let builder = VirtualTextureTileBuilder::new(&registry);
        let settings = [vt_settings(128, 4)];
        let source = gradient_source(256);
        let output = builder
            .build(&source, None, &settings, &CancellationToken::new())
            .unwrap();

        // BGRA8 raw container: the payload is the bordered rect itself
        let expected = source.blocks[0].layers[0].extract_bordered(
            128 - 4,
            -4,
            136,
            136,
            settings[0].address_mode_x,
            settings[0].address_mode_y,
        );
        let payload = read_tile(&output.chunks, &output.layout.table, 0, 1, 0, 0).unwrap();
        assert_eq!(payload, expected.data());
    }

    #[test]
    fn test_build_is_idempotent() {
        let registry = EncoderRegistry::with_default_encoders();
        let builder = VirtualTextureTileBuilder::new(&registry);
        let settings = [vt_settings(128, 4)];
        let source = gradient_source(256);
        let token = CancellationToken::new();

        let a = builder.build(&source, None, &settings, &token).unwrap();
        let b = builder.build(&source, None, &settings, &token).unwrap();
        assert_eq!(a.chunks, b.chunks);
        assert_eq!(a.layout, b.layout);
    }

    #[test]
    fn test_multi_block_miptail() {
        // 2x1 blocks of 128: logical 256x128, chain continues past the
        // per-block 1x1 into the synthesized miptail.
        let mut source = gradient_source(128);
        source.blocks.push(SourceBlock {
            block_x: 1,
            block_y: 0,
            layers: vec![source.blocks[0].layers[0].clone()],
        });

        let registry = EncoderRegistry::with_default_encoders();
        let builder = VirtualTextureTileBuilder::new(&registry);
        let settings = [vt_settings(128, 0)];
        let output = builder
            .build(&source, None, &settings, &CancellationToken::new())
            .unwrap();

        assert_eq!(output.description.top_mip_size_x, 256);
        assert_eq!(output.description.top_mip_size_y, 128);
        assert_eq!(output.layout.num_mips, 9);
        assert_eq!(output.layout.block_mip_bias, vec![0, 0]);
        // Top mip: two tiles side by side
        assert_eq!(output.layout.width_in_tiles, 2);
        assert_eq!(output.layout.height_in_tiles, 1);
        // Deepest mip exists and is addressable
        assert!(output.layout.table.lookup(8, 0, 0, 0).is_some());
    }

    #[test]
    fn test_aspect_mismatch_is_hard_failure() {
        let info = ImageInfo::new_2d(100, 60, RawFormat::Bgra8, GammaSpace::Linear);
        let source = TextureSource::new_2d("bad-aspect", RawImage::new_black(info));

        let registry = EncoderRegistry::with_default_encoders();
        let builder = VirtualTextureTileBuilder::new(&registry);
        let settings = [vt_settings(128, 4)];
        let result = builder.build(&source, None, &settings, &CancellationToken::new());
        assert!(matches!(
            result,
            Err(BuildError::Validation(
                ValidationError::BlockAspectMismatch { .. }
            ))
        ));
    }

    #[test]
    fn test_small_block_is_upscaled_to_one_tile() {
        // A 32x32 source with tile size 128 upscales so it still yields
        // one full tile.
        let registry = EncoderRegistry::with_default_encoders();
        let builder = VirtualTextureTileBuilder::new(&registry);
        let settings = [vt_settings(128, 0)];
        let output = builder
            .build(&gradient_source(32), None, &settings, &CancellationToken::new())
            .unwrap();
        assert_eq!(output.description.top_mip_size_x, 128);
        assert_eq!(output.layout.width_in_tiles, 1);
    }

    #[test]
    fn test_fallback_color_is_last_mip_texel() {
        let registry = EncoderRegistry::with_default_encoders();
        let builder = VirtualTextureTileBuilder::new(&registry);
        let settings = [vt_settings(128, 0)];

        // Solid color source: every mip averages to the same color
        let info = ImageInfo::new_2d(128, 128, RawFormat::Bgra8, GammaSpace::Linear);
        let mut image = RawImage::new_black(info);
        for y in 0..128 {
            for x in 0..128 {
                image.write_texel(x, y, 0, [0.25, 0.5, 0.75, 1.0]);
            }
        }
        let source = TextureSource::new_2d("solid", image);
        let output = builder
            .build(&source, None, &settings, &CancellationToken::new())
            .unwrap();

        let fallback = output.layout.layer_fallback_colors[0];
        assert!((fallback[0] - 0.25).abs() < 0.01);
        assert!((fallback[1] - 0.5).abs() < 0.01);
        assert!((fallback[2] - 0.75).abs() < 0.01);
    }

    #[test]
    fn test_cancellation_stops_the_build() {
        let registry = EncoderRegistry::with_default_encoders();
        let builder = VirtualTextureTileBuilder::new(&registry);
        let settings = [vt_settings(128, 4)];
        let token = CancellationToken::new();
        token.cancel();

        let result = builder.build(&gradient_source(256), None, &settings, &token);
        assert!(matches!(result, Err(BuildError::Cancelled)));
    }

    #[test]
    fn test_raw_layers_expose_stride_table() {
        let registry = EncoderRegistry::with_default_encoders();
        let builder = VirtualTextureTileBuilder::new(&registry);
        let settings = [vt_settings(128, 4)];
        let output = builder
            .build(&gradient_source(256), None, &settings, &CancellationToken::new())
            .unwrap();
        // One BGRA8 raw layer: stride table present with offset 0
        assert_eq!(
            output.layout.table.tile_data_offset_per_layer,
            Some(vec![0])
        );
    }
}
