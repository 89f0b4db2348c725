//! Build Memory Estimation
//!
//! Predicts the peak working set of a build for admission control. Pure
//! computation, no allocation. Phases do not overlap in time, so the
//! estimate is the maximum across phases, not the sum.
//!
//! The phase contract is explicit: the source buffer is still resident
//! while the intermediate mip chain is generated (that phase charges
//! both), and the source is released before tile encoding starts (the
//! encode phase charges the intermediate plus encode scratch only).
//!
//! Estimates are scheduling hints. A wrong estimate mis-schedules a
//! build; it must never abort one.

use crate::settings::BuildSettings;
use crate::source::TextureSource;

/// Build phases charged by the estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    /// Source pixels resident, nothing derived yet
    SourceDecompress,
    /// Source plus the intermediate-format mip chain
    IntermediateGeneration,
    /// Intermediate chain plus per-worker encode scratch
    TileEncode,
}

/// Peak working-set estimate for one build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEstimate {
    pub peak_bytes: u64,
    pub peak_phase: BuildPhase,
}

/// Full mip chain of a buffer is bounded by 4/3 of its top level
fn with_mip_chain(top_bytes: u64) -> u64 {
    top_bytes + top_bytes / 3
}

/// HDR intermediates are RGBA16F, LDR are BGRA8
fn intermediate_texel_bytes(hdr: bool) -> u64 {
    if hdr {
        8
    } else {
        4
    }
}

fn source_bytes(source: &TextureSource) -> u64 {
    source
        .blocks
        .iter()
        .flat_map(|b| b.layers.iter())
        .map(|image| image.info().data_size() as u64)
        .sum()
}

fn pick_peak(phases: [(BuildPhase, u64); 3]) -> MemoryEstimate {
    let (peak_phase, peak_bytes) = phases
        .into_iter()
        .max_by_key(|(_, bytes)| *bytes)
        .expect("phase list is non-empty");
    MemoryEstimate {
        peak_bytes,
        peak_phase,
    }
}

/// Estimate for a virtual-texture tile build
pub fn estimate_virtual_texture_build(
    settings_per_layer: &[BuildSettings],
    source: &TextureSource,
    parallelism: usize,
) -> MemoryEstimate {
    let source_size = source_bytes(source);
    let (top_w, top_h) = source.top_dimensions();
    let blocks = source.num_blocks() as u64;

    let mut intermediate = 0u64;
    let mut tile_scratch = 0u64;
    for (layer, settings) in settings_per_layer.iter().enumerate() {
        let texel = intermediate_texel_bytes(source.is_hdr(layer));
        let level0 = top_w as u64 * top_h as u64 * texel * blocks;
        intermediate += with_mip_chain(level0);

        let bordered = settings.vt_tile_size as u64 + 2 * settings.vt_border_size as u64;
        let mut per_tile = bordered * bordered * texel * 2; // input rect + encoded output
        if settings.rdo_lambda.is_some() {
            // Rate-distortion encoders keep a second working copy
            per_tile *= 2;
        }
        tile_scratch = tile_scratch.max(per_tile);
    }
    let encode_scratch = tile_scratch * parallelism.max(1) as u64;

    pick_peak([
        (BuildPhase::SourceDecompress, source_size),
        (
            BuildPhase::IntermediateGeneration,
            source_size + intermediate,
        ),
        (BuildPhase::TileEncode, intermediate + encode_scratch),
    ])
}

/// Estimate for a linear (non-VT) build
pub fn estimate_physical_build(
    settings_per_layer: &[BuildSettings],
    source: &TextureSource,
) -> MemoryEstimate {
    let source_size = source_bytes(source);
    let (top_w, top_h) = source.top_dimensions();

    let settings = settings_per_layer.first();
    let texel = intermediate_texel_bytes(source.is_hdr(0));
    let (capped_w, capped_h) = settings.map_or((top_w, top_h), |s| {
        let (w, h, _, _) = s.apply_resolution_cap(top_w, top_h, 1);
        (w, h)
    });

    let intermediate = with_mip_chain(capped_w as u64 * capped_h as u64 * texel);
    // Encoded output is at most one uncompressed copy of the chain
    let encode_scratch = intermediate;

    pick_peak([
        (BuildPhase::SourceDecompress, source_size),
        (
            BuildPhase::IntermediateGeneration,
            source_size + intermediate,
        ),
        (BuildPhase::TileEncode, intermediate + encode_scratch),
    ])
}
