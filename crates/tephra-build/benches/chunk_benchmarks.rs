use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use tephra_build::chunk::{morton_tiles, ChunkPacker, EncodedTile, MipTileGrid};

fn tiles_for(grid: MipTileGrid, payload: usize) -> Vec<EncodedTile> {
    morton_tiles(grid)
        .into_iter()
        .map(|(x, y)| EncodedTile {
            mip: 0,
            tile_x: x,
            tile_y: y,
            layer_payloads: vec![vec![(x ^ y) as u8; payload]],
        })
        .collect()
}

fn bench_pack_large_grid(c: &mut Criterion) {
    let grid = MipTileGrid {
        width_in_tiles: 32,
        height_in_tiles: 32,
    };
    let tiles = [tiles_for(grid, 4096)];
    let packer = ChunkPacker::new(128, 1);

    c.bench_function("pack_32x32_grid", |b| {
        b.iter(|| packer.pack(black_box(&tiles), black_box(&[grid])).unwrap())
    });
}

fn bench_offset_lookup(c: &mut Criterion) {
    let grid = MipTileGrid {
        width_in_tiles: 32,
        height_in_tiles: 32,
    };
    let tiles = [tiles_for(grid, 256)];
    let packer = ChunkPacker::new(128, 1);
    let (_, table) = packer.pack(&tiles, &[grid]).unwrap();

    c.bench_function("offset_table_lookup", |b| {
        b.iter(|| {
            let mut acc = 0u64;
            for y in 0..32 {
                for x in 0..32 {
                    acc += table.lookup(0, black_box(x), black_box(y), 0).unwrap().size as u64;
                }
            }
            acc
        })
    });
}

criterion_group!(benches, bench_pack_large_grid, bench_offset_lookup);
criterion_main!(benches);
