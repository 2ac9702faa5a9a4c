//! Hashing, packing and block codec benchmarks for depot-core

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use depot_core::block::{BlockIndex, StoredBlock};
use depot_core::compression::{CompressionRegistry, ZSTD_DEFAULT};
use depot_core::{create_content_index, Blake3Hasher, ChunkHasher, COMPRESSION_NONE};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

fn bench_hash_operations(c: &mut Criterion) {
    let hasher = Blake3Hasher::new();
    let small = random_bytes(1024);
    let chunk = random_bytes(32 * 1024);

    c.bench_function("hash_chunk_1k", |b| {
        b.iter(|| black_box(hasher.hash_buffer(black_box(&small))))
    });

    c.bench_function("hash_chunk_32k", |b| {
        b.iter(|| black_box(hasher.hash_buffer(black_box(&chunk))))
    });
}

fn bench_packing(c: &mut Criterion) {
    let hasher = Blake3Hasher::new();
    // 100k chunks with every fourth one repeated
    let hashes: Vec<u64> = (0..100_000u64).map(|i| if i % 4 == 0 { 0 } else { i }).collect();
    let sizes: Vec<u32> = (0..100_000u32).map(|i| 16 * 1024 + (i % 97) * 64).collect();

    c.bench_function("create_content_index_100k", |b| {
        b.iter(|| {
            create_content_index(&hasher, black_box(&hashes), black_box(&sizes), 8 << 20, 1024)
                .map(|index| black_box(index.block_count()))
        })
    });
}

fn bench_block_codec(c: &mut Criterion) {
    let hasher = Blake3Hasher::new();
    let registry = CompressionRegistry::with_defaults();
    let data = random_bytes(4 << 20);
    let chunks: Vec<&[u8]> = data.chunks(32 * 1024).collect();
    let index = BlockIndex::new(
        &hasher,
        COMPRESSION_NONE,
        chunks.iter().map(|c| hasher.hash_buffer(c)).collect(),
        chunks.iter().map(|c| c.len() as u32).collect(),
    )
    .unwrap();
    let block = StoredBlock::new(index, data.clone());
    let bytes = block.to_bytes();

    c.bench_function("block_parse_4m", |b| {
        b.iter(|| StoredBlock::from_bytes(&hasher, black_box(&bytes)).map(|b| black_box(b.data.len())))
    });

    c.bench_function("block_compress_zstd_4m", |b| {
        b.iter(|| registry.compress_payload(ZSTD_DEFAULT, black_box(&data)).map(|p| black_box(p.len())))
    });
}

criterion_group!(benches, bench_hash_operations, bench_packing, bench_block_codec);
criterion_main!(benches);
