//! Chunk Packing
//!
//! Packs encoded virtual-texture tiles into size-bounded binary chunks.
//! Tiles are laid out in Morton order per mip so spatially adjacent
//! tiles stay adjacent in memory, which keeps sparse residency streaming
//! reads local. Each chunk carries a fixed header, one codec payload
//! section per layer, then tile payloads in the same Morton order, with
//! an explicit offset table for O(1) random access.

use serde::{Deserialize, Serialize};

use tephra_core::morton::morton_encode;

use crate::error::{BuildResult, ValidationError};

/// Chunk header magic, "VTCH"
pub const CHUNK_MAGIC: u32 = 0x5654_4348;
/// Bump when the chunk binary layout changes
pub const CHUNK_FORMAT_VERSION: u32 = 1;
/// Minimum chunk footprint in texels; chunks only split once they cover
/// at least this much payload
pub const MIN_CHUNK_TEXELS: u64 = 1024 * 1024;

/// Fixed chunk header size: magic, version, layer count, tile count
const HEADER_SIZE: usize = 16;
/// Byte offset of the tile-count field, patched when a chunk closes
const TILE_COUNT_OFFSET: usize = 12;

/// One encoded tile: payloads for every layer at one grid position
#[derive(Debug, Clone)]
pub struct EncodedTile {
    pub mip: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    pub layer_payloads: Vec<Vec<u8>>,
}

/// Tile grid dimensions of one mip level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MipTileGrid {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
}

impl MipTileGrid {
    pub fn num_tiles(&self) -> u32 {
        self.width_in_tiles * self.height_in_tiles
    }
}

/// Location of one tile-layer payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileAddress {
    pub chunk: u32,
    pub offset: u32,
    pub size: u32,
}

/// Per-mip slice of the offset table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MipOffsetData {
    /// Index of this mip's first entry in the flat entry array
    pub first_entry: u32,
    pub grid: MipTileGrid,
}

/// `(mip, tileX, tileY, layer) -> byte address` lookup without scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileOffsetTable {
    pub num_layers: u32,
    pub per_mip: Vec<MipOffsetData>,
    /// Flat entries: `first_entry + (y * width + x) * num_layers + layer`
    pub entries: Vec<TileAddress>,
    /// Fixed per-layer byte offsets inside one tile record. Present only
    /// when every layer uses a raw container codec with a constant
    /// stride, verified against every packed tile.
    pub tile_data_offset_per_layer: Option<Vec<u32>>,
}

impl TileOffsetTable {
    /// O(1) address lookup
    pub fn lookup(&self, mip: u32, tile_x: u32, tile_y: u32, layer: u32) -> Option<TileAddress> {
        let mip_data = self.per_mip.get(mip as usize)?;
        if tile_x >= mip_data.grid.width_in_tiles
            || tile_y >= mip_data.grid.height_in_tiles
            || layer >= self.num_layers
        {
            return None;
        }
        let rank = tile_y * mip_data.grid.width_in_tiles + tile_x;
        let index = mip_data.first_entry + rank * self.num_layers + layer;
        self.entries.get(index as usize).copied()
    }
}

/// Read one tile-layer payload back out of packed chunks
pub fn read_tile<'a>(
    chunks: &'a [Vec<u8>],
    table: &TileOffsetTable,
    mip: u32,
    tile_x: u32,
    tile_y: u32,
    layer: u32,
) -> Option<&'a [u8]> {
    let address = table.lookup(mip, tile_x, tile_y, layer)?;
    let chunk = chunks.get(address.chunk as usize)?;
    chunk.get(address.offset as usize..(address.offset + address.size) as usize)
}

fn ensure_offset_fits(len: u64) -> BuildResult<()> {
    if len > u32::MAX as u64 {
        return Err(ValidationError::ChunkOffsetOverflow {
            size: len,
            max: u32::MAX as u64,
        }
        .into());
    }
    Ok(())
}

/// Packs Morton-ordered tiles into chunks and builds the offset table
pub struct ChunkPacker {
    pub tile_size: u32,
    pub num_layers: u32,
    /// One codec-specific side-data payload per layer
    pub layer_codec_payloads: Vec<Vec<u8>>,
    /// True when every layer's codec is a raw fixed-stride container
    pub all_layers_raw: bool,
    pub min_chunk_texels: u64,
}

struct OpenChunk {
    data: Vec<u8>,
    tile_count: u32,
}

impl ChunkPacker {
    pub fn new(tile_size: u32, num_layers: u32) -> Self {
        Self {
            tile_size,
            num_layers,
            layer_codec_payloads: vec![Vec::new(); num_layers as usize],
            all_layers_raw: false,
            min_chunk_texels: MIN_CHUNK_TEXELS,
        }
    }

    fn min_tiles_per_chunk(&self) -> u32 {
        let tile_texels = self.tile_size as u64 * self.tile_size as u64;
        (self.min_chunk_texels / tile_texels.max(1)).max(1) as u32
    }

    fn open_chunk(&self) -> OpenChunk {
        let mut data = Vec::new();
        data.extend_from_slice(&CHUNK_MAGIC.to_le_bytes());
        data.extend_from_slice(&CHUNK_FORMAT_VERSION.to_le_bytes());
        data.extend_from_slice(&self.num_layers.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // tile count, patched on close
        debug_assert_eq!(data.len(), HEADER_SIZE);
        for payload in &self.layer_codec_payloads {
            data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        }
        for payload in &self.layer_codec_payloads {
            data.extend_from_slice(payload);
        }
        OpenChunk {
            data,
            tile_count: 0,
        }
    }

    fn close_chunk(chunk: &mut OpenChunk) {
        let count = chunk.tile_count.to_le_bytes();
        chunk.data[TILE_COUNT_OFFSET..TILE_COUNT_OFFSET + 4].copy_from_slice(&count);
    }

    /// Pack tiles into chunks.
    ///
    /// `tiles_per_mip[m]` must hold mip `m`'s tiles in Morton order and
    /// `grids[m]` its tile grid. A chunk boundary opens once the tile
    /// count since the last boundary reaches the minimum-tiles threshold,
    /// except while packing the last mip: the smallest mips always share
    /// the final chunk.
    pub fn pack(
        &self,
        tiles_per_mip: &[Vec<EncodedTile>],
        grids: &[MipTileGrid],
    ) -> BuildResult<(Vec<Vec<u8>>, TileOffsetTable)> {
        debug_assert_eq!(tiles_per_mip.len(), grids.len());
        let min_tiles = self.min_tiles_per_chunk();
        let last_mip = tiles_per_mip.len().saturating_sub(1);

        // Pre-size the flat entry array
        let mut per_mip = Vec::with_capacity(grids.len());
        let mut total_entries = 0u64;
        for grid in grids {
            per_mip.push(MipOffsetData {
                first_entry: total_entries as u32,
                grid: *grid,
            });
            total_entries += grid.num_tiles() as u64 * self.num_layers as u64;
        }
        ensure_offset_fits(total_entries)?;
        let mut entries = vec![
            TileAddress {
                chunk: 0,
                offset: 0,
                size: 0
            };
            total_entries as usize
        ];

        // Raw fast path verification state: expected constant stride per layer
        let mut raw_strides: Option<Vec<u32>> = None;
        let mut raw_path_valid = self.all_layers_raw;

        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut current = self.open_chunk();

        for (mip, tiles) in tiles_per_mip.iter().enumerate() {
            let mip_data = per_mip[mip];
            for tile in tiles {
                debug_assert_eq!(tile.mip as usize, mip);
                debug_assert_eq!(tile.layer_payloads.len(), self.num_layers as usize);

                if current.tile_count >= min_tiles && mip < last_mip {
                    Self::close_chunk(&mut current);
                    chunks.push(current.data);
                    current = self.open_chunk();
                }

                let rank =
                    tile.tile_y * mip_data.grid.width_in_tiles + tile.tile_x;
                let entry_base =
                    mip_data.first_entry as usize + rank as usize * self.num_layers as usize;

                for (layer, payload) in tile.layer_payloads.iter().enumerate() {
                    ensure_offset_fits(current.data.len() as u64 + payload.len() as u64)?;
                    entries[entry_base + layer] = TileAddress {
                        chunk: chunks.len() as u32,
                        offset: current.data.len() as u32,
                        size: payload.len() as u32,
                    };
                    current.data.extend_from_slice(payload);
                }
                current.tile_count += 1;

                if raw_path_valid {
                    let strides: Vec<u32> =
                        tile.layer_payloads.iter().map(|p| p.len() as u32).collect();
                    match &raw_strides {
                        None => raw_strides = Some(strides),
                        Some(expected) if *expected != strides => raw_path_valid = false,
                        Some(_) => {}
                    }
                }
            }
        }

        Self::close_chunk(&mut current);
        chunks.push(current.data);

        // The flat per-layer offsets are only exposed when provably
        // correct for every packed tile.
        let tile_data_offset_per_layer = match (raw_path_valid, raw_strides) {
            (true, Some(strides)) => {
                let mut offsets = Vec::with_capacity(strides.len());
                let mut acc = 0u32;
                for stride in &strides {
                    offsets.push(acc);
                    acc += stride;
                }
                Some(offsets)
            }
            _ => None,
        };

        Ok((
            chunks,
            TileOffsetTable {
                num_layers: self.num_layers,
                per_mip,
                entries,
                tile_data_offset_per_layer,
            },
        ))
    }
}

/// Morton-ordered tile coordinates for a grid
pub fn morton_tiles(grid: MipTileGrid) -> Vec<(u32, u32)> {
    let mut coords: Vec<(u32, u32)> =
        tephra_core::morton::MortonIter::new(grid.width_in_tiles, grid.height_in_tiles).collect();
    debug_assert!(coords
        .windows(2)
        .all(|w| morton_encode(w[0].0, w[0].1) < morton_encode(w[1].0, w[1].1)));
    coords.shrink_to_fit();
    coords
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(mip: u32, x: u32, y: u32, layers: u32, fill: u8, size: usize) -> EncodedTile {
        EncodedTile {
            mip,
            tile_x: x,
            tile_y: y,
            layer_payloads: (0..layers)
                .map(|layer| vec![fill.wrapping_add(layer as u8); size])
                .collect(),
        }
    }

    fn tiles_for_grid(mip: u32, grid: MipTileGrid, layers: u32, size: usize) -> Vec<EncodedTile> {
        morton_tiles(grid)
            .into_iter()
            .map(|(x, y)| tile(mip, x, y, layers, (mip * 64 + y * 8 + x) as u8, size))
            .collect()
    }

    #[test]
    fn test_round_trip_by_coordinates() {
        let grids = [
            MipTileGrid {
                width_in_tiles: 2,
                height_in_tiles: 2,
            },
            MipTileGrid {
                width_in_tiles: 1,
                height_in_tiles: 1,
            },
        ];
        let tiles: Vec<Vec<EncodedTile>> = grids
            .iter()
            .enumerate()
            .map(|(mip, grid)| tiles_for_grid(mip as u32, *grid, 2, 64))
            .collect();

        let packer = ChunkPacker::new(128, 2);
        let (chunks, table) = packer.pack(&tiles, &grids).unwrap();

        for (mip, mip_tiles) in tiles.iter().enumerate() {
            for t in mip_tiles {
                for layer in 0..2u32 {
                    let read =
                        read_tile(&chunks, &table, mip as u32, t.tile_x, t.tile_y, layer).unwrap();
                    assert_eq!(read, &t.layer_payloads[layer as usize][..]);
                }
            }
        }
    }

    #[test]
    fn test_lookup_rejects_out_of_bounds() {
        let grids = [MipTileGrid {
            width_in_tiles: 2,
            height_in_tiles: 2,
        }];
        let tiles = [tiles_for_grid(0, grids[0], 1, 16)];
        let packer = ChunkPacker::new(128, 1);
        let (_, table) = packer.pack(&tiles, &grids).unwrap();

        assert!(table.lookup(0, 2, 0, 0).is_none());
        assert!(table.lookup(0, 0, 0, 1).is_none());
        assert!(table.lookup(1, 0, 0, 0).is_none());
    }

    #[test]
    fn test_chunk_boundaries_respect_threshold_and_last_mip() {
        // 4 tiles per chunk; three mips of 16, 4 and 1 tiles
        let grids = [
            MipTileGrid {
                width_in_tiles: 4,
                height_in_tiles: 4,
            },
            MipTileGrid {
                width_in_tiles: 2,
                height_in_tiles: 2,
            },
            MipTileGrid {
                width_in_tiles: 1,
                height_in_tiles: 1,
            },
        ];
        let tiles: Vec<Vec<EncodedTile>> = grids
            .iter()
            .enumerate()
            .map(|(mip, grid)| tiles_for_grid(mip as u32, *grid, 1, 32))
            .collect();

        let mut packer = ChunkPacker::new(64, 1);
        packer.min_chunk_texels = 4 * 64 * 64; // 4 tiles
        let (chunks, table) = packer.pack(&tiles, &grids).unwrap();

        // 16 tiles of mip 0 split into 4 chunks; mips 1 and 2 share the tail
        assert_eq!(chunks.len(), 5);

        // Earlier mips land in earlier chunks
        let mip0_chunk = table.lookup(0, 0, 0, 0).unwrap().chunk;
        let mip2_chunk = table.lookup(2, 0, 0, 0).unwrap().chunk;
        assert!(mip0_chunk < mip2_chunk);

        // The last mip shares the final chunk with mip 1's overflow
        let mip1_chunk = table.lookup(1, 1, 1, 0).unwrap().chunk;
        assert_eq!(mip2_chunk, chunks.len() as u32 - 1);
        assert_eq!(mip1_chunk, mip2_chunk);
    }

    #[test]
    fn test_morton_payload_order_within_chunk() {
        let grid = MipTileGrid {
            width_in_tiles: 4,
            height_in_tiles: 4,
        };
        let tiles = [tiles_for_grid(0, grid, 1, 16)];
        let packer = ChunkPacker::new(128, 1);
        let (_, table) = packer.pack(&tiles, &[grid]).unwrap();

        let mut last_offset = 0;
        for (x, y) in morton_tiles(grid) {
            let address = table.lookup(0, x, y, 0).unwrap();
            assert!(address.offset > last_offset || last_offset == 0);
            last_offset = address.offset;
        }
    }

    #[test]
    fn test_raw_stride_fast_path() {
        let grid = MipTileGrid {
            width_in_tiles: 2,
            height_in_tiles: 2,
        };
        let tiles = [tiles_for_grid(0, grid, 2, 64)];

        let mut packer = ChunkPacker::new(128, 2);
        packer.all_layers_raw = true;
        let (_, table) = packer.pack(&tiles, &[grid]).unwrap();
        assert_eq!(table.tile_data_offset_per_layer, Some(vec![0, 64]));

        // A single deviating tile disables the fast path
        let mut uneven = tiles.clone();
        uneven[0][3].layer_payloads[1] = vec![0; 32];
        let (_, table) = packer.pack(&uneven, &[grid]).unwrap();
        assert_eq!(table.tile_data_offset_per_layer, None);

        // Non-raw codecs never expose it
        let mut packer = ChunkPacker::new(128, 2);
        packer.all_layers_raw = false;
        let (_, table) = packer.pack(&tiles, &[grid]).unwrap();
        assert_eq!(table.tile_data_offset_per_layer, None);
    }

    #[test]
    fn test_offset_overflow_rejected() {
        assert!(ensure_offset_fits(u32::MAX as u64).is_ok());
        assert!(ensure_offset_fits(u32::MAX as u64 + 1).is_err());
    }

    #[test]
    fn test_chunk_header_layout() {
        let grid = MipTileGrid {
            width_in_tiles: 1,
            height_in_tiles: 1,
        };
        let tiles = [tiles_for_grid(0, grid, 1, 8)];
        let mut packer = ChunkPacker::new(128, 1);
        packer.layer_codec_payloads = vec![vec![0xAA, 0xBB]];
        let (chunks, table) = packer.pack(&tiles, &[grid]).unwrap();

        let chunk = &chunks[0];
        assert_eq!(u32::from_le_bytes(chunk[0..4].try_into().unwrap()), CHUNK_MAGIC);
        assert_eq!(
            u32::from_le_bytes(chunk[4..8].try_into().unwrap()),
            CHUNK_FORMAT_VERSION
        );
        assert_eq!(u32::from_le_bytes(chunk[8..12].try_into().unwrap()), 1);
        // Patched tile count
        assert_eq!(u32::from_le_bytes(chunk[12..16].try_into().unwrap()), 1);
        // Codec payload size then bytes
        assert_eq!(u32::from_le_bytes(chunk[16..20].try_into().unwrap()), 2);
        assert_eq!(&chunk[20..22], &[0xAA, 0xBB]);
        // First tile payload begins right after the codec section
        assert_eq!(table.lookup(0, 0, 0, 0).unwrap().offset, 22);
    }
}
