use criterion::{black_box, criterion_group, criterion_main, Criterion};
use trackid_vecstore::{HNSWConfig, MemoryIndex, VecIndex, HNSW};

fn random_unit_vec(dim: usize, seed: u64) -> Vec<f32> {
    let mut v = Vec::with_capacity(dim);
    let mut state = seed;
    for _ in 0..dim {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        v.push(((state >> 33) as f32) / (u32::MAX as f32) - 0.5);
    }
    v
}

fn filled<I: VecIndex>(idx: I, n: u64, dim: usize) -> I {
    for i in 0..n {
        idx.insert(i, &random_unit_vec(dim, i + 1)).unwrap();
    }
    idx
}

fn bench_search(c: &mut Criterion) {
    let dim = 128;
    let n = 5000;
    let query = random_unit_vec(dim, 424242);

    let hnsw = filled(
        HNSW::new(HNSWConfig {
            dim,
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }),
        n,
        dim,
    );
    c.bench_function("hnsw_search_128d_5k_top10", |b| {
        b.iter(|| black_box(hnsw.search(black_box(&query), 10).unwrap()));
    });

    let exact = filled(MemoryIndex::new(dim), n, dim);
    c.bench_function("exact_search_128d_5k_top10", |b| {
        b.iter(|| black_box(exact.search(black_box(&query), 10).unwrap()));
    });
}

fn bench_compact(c: &mut Criterion) {
    let dim = 64;
    c.bench_function("hnsw_compact_64d_2k_10pct_removed", |b| {
        b.iter_with_setup(
            || {
                let h = filled(
                    HNSW::new(HNSWConfig {
                        dim,
                        m: 16,
                        ef_construction: 100,
                        ef_search: 50,
                    }),
                    2000,
                    dim,
                );
                for i in (0..2000).step_by(10) {
                    h.remove(i).unwrap();
                }
                h
            },
            |h| black_box(h.compact().unwrap()),
        );
    });
}

criterion_group!(benches, bench_search, bench_compact);
criterion_main!(benches);
