//! Encoded Texture Description
//!
//! Canonical post-build texture shape, derived from build settings and
//! source dimensions once the real output pixel format is known.

use serde::{Deserialize, Serialize};

use tephra_core::image::mip_dimension;
use tephra_core::TextureFormat;

/// Shape of an encoded texture: dimensions, mip count, pixel format and
/// array/cube/volume flags. Pure data; accessors only derive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedTextureDescription {
    pub top_mip_size_x: u32,
    pub top_mip_size_y: u32,
    /// Depth of the top mip; 1 unless `volume`
    pub top_mip_size_z: u32,
    /// Array entries; 1 for plain textures
    pub array_size: u32,
    pub num_mips: u32,
    pub format: TextureFormat,
    pub cubemap: bool,
    pub texture_array: bool,
    pub volume: bool,
}

impl EncodedTextureDescription {
    pub fn new_2d(width: u32, height: u32, num_mips: u32, format: TextureFormat) -> Self {
        debug_assert!(num_mips >= 1);
        Self {
            top_mip_size_x: width,
            top_mip_size_y: height,
            top_mip_size_z: 1,
            array_size: 1,
            num_mips: num_mips.max(1),
            format,
            cubemap: false,
            texture_array: false,
            volume: false,
        }
    }

    /// Width/height/depth of one mip level
    pub fn mip_size(&self, mip: u32) -> (u32, u32, u32) {
        debug_assert!(mip < self.num_mips);
        (
            mip_dimension(self.top_mip_size_x, mip),
            mip_dimension(self.top_mip_size_y, mip),
            if self.volume {
                mip_dimension(self.top_mip_size_z, mip)
            } else {
                1
            },
        )
    }

    /// Slice count including volume depth at the given mip.
    ///
    /// Volumes shrink in depth per mip; everything else is the flat
    /// array-times-faces count. Not interchangeable with
    /// [`num_slices_no_depth`](Self::num_slices_no_depth).
    pub fn num_slices_with_depth(&self, mip: u32) -> u32 {
        if self.volume {
            mip_dimension(self.top_mip_size_z, mip)
        } else {
            self.num_slices_no_depth()
        }
    }

    /// Slice count ignoring volume depth: array entries times cube faces.
    /// Used where depth is accounted for separately in a mip's byte size.
    pub fn num_slices_no_depth(&self) -> u32 {
        self.array_size * if self.cubemap { 6 } else { 1 }
    }

    /// Encoded byte size of one mip level across all slices
    pub fn mip_size_bytes(&self, mip: u32) -> u64 {
        let (w, h, _) = self.mip_size(mip);
        self.format.slice_size_bytes(w, h) * self.num_slices_with_depth(mip) as u64
    }

    /// Encoded byte size of the whole mip chain
    pub fn total_size_bytes(&self) -> u64 {
        (0..self.num_mips).map(|mip| self.mip_size_bytes(mip)).sum()
    }
}

/// Platform-tiling metadata produced by a tiler step.
///
/// Untiled/linear layouts carry the all-zero tail and tiler fields but
/// must still have correct `mip_sizes_in_bytes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedTextureExtendedData {
    /// Number of smallest mips packed together by the tiler; 0 when untiled
    pub num_mips_in_tail: u32,
    /// Opaque tiler extra data; 0 when untiled
    pub tiler_data: u32,
    /// Byte size of every mip, tiled or not
    pub mip_sizes_in_bytes: Vec<u64>,
}

impl EncodedTextureExtendedData {
    /// Extended data for an untiled layout: zero tail, per-mip sizes filled
    pub fn linear_for(description: &EncodedTextureDescription) -> Self {
        Self {
            num_mips_in_tail: 0,
            tiler_data: 0,
            mip_sizes_in_bytes: (0..description.num_mips)
                .map(|mip| description.mip_size_bytes(mip))
                .collect(),
        }
    }
}
