//! Sampling and gather kernel throughput benchmarks.
//!
//! Benchmarks the hot per-batch kernels in isolation on a synthetic in-memory
//! graph:
//! - **khop_sweep**: reservoir vs slot-parallel k-hop across fanouts.
//! - **remap**: hash-table dedup + edge mapping on a sampled layer.
//! - **gather**: feature row extraction, with the mock-index mode to keep the
//!   source rows cache-resident and measure the copy loop itself.
//!
//! # Running
//!
//! ```sh
//! cargo bench --bench sampling_throughput
//! ```

use criterion::{BenchmarkId, Criterion, Throughput};
use rand::prelude::*;
use rand::rngs::SmallRng;

use confluence::common::{predict_num_nodes, IdType, Tensor};
use confluence::dataset::csr_from_edges;
use confluence::extractor::Extractor;
use confluence::hashtable::OrderedHashTable;
use confluence::sampling::khop::{sample_khop_parallel, sample_khop_reservoir};

// ============================================================================
// Synthetic graph
// ============================================================================

const NUM_NODE: usize = 200_000;
const AVG_DEGREE: usize = 16;
const BATCH: usize = 4_096;

fn synthetic_graph() -> (Vec<IdType>, Vec<IdType>) {
    let mut rng = SmallRng::seed_from_u64(7);
    let mut edges = Vec::with_capacity(NUM_NODE * AVG_DEGREE);
    for v in 0..NUM_NODE as IdType {
        for _ in 0..rng.random_range(1..AVG_DEGREE * 2) {
            edges.push((v, rng.random_range(0..NUM_NODE as IdType)));
        }
    }
    csr_from_edges(NUM_NODE, edges)
}

fn seed_batch(rng: &mut SmallRng) -> Vec<IdType> {
    (0..BATCH).map(|_| rng.random_range(0..NUM_NODE as IdType)).collect()
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_khop_sweep(c: &mut Criterion) {
    let (indptr, indices) = synthetic_graph();
    let mut rng = SmallRng::seed_from_u64(11);
    let input = seed_batch(&mut rng);

    let mut group = c.benchmark_group("khop_sweep");
    group.noise_threshold(0.05);

    for fanout in [5usize, 10, 25] {
        group.throughput(Throughput::Elements((BATCH * fanout) as u64));
        let mut src = vec![0 as IdType; BATCH * fanout];
        let mut dst = vec![0 as IdType; BATCH * fanout];
        group.bench_with_input(BenchmarkId::new("reservoir", fanout), &fanout, |b, &fanout| {
            let mut seed = 0u64;
            b.iter(|| {
                seed += 1;
                sample_khop_reservoir(&indptr, &indices, &input, fanout, &mut src, &mut dst, seed, 0)
            });
        });
        group.bench_with_input(
            BenchmarkId::new("sample_parallel", fanout),
            &fanout,
            |b, &fanout| {
                let mut seed = 0u64;
                b.iter(|| {
                    seed += 1;
                    sample_khop_parallel(
                        &indptr, &indices, &input, fanout, &mut src, &mut dst, seed, 0,
                    )
                });
            },
        );
    }
    group.finish();
}

fn bench_remap(c: &mut Criterion) {
    let (indptr, indices) = synthetic_graph();
    let mut rng = SmallRng::seed_from_u64(13);
    let input = seed_batch(&mut rng);
    let fanout = 10usize;

    let mut src = vec![0 as IdType; BATCH * fanout];
    let mut dst = vec![0 as IdType; BATCH * fanout];
    let num = sample_khop_reservoir(&indptr, &indices, &input, fanout, &mut src, &mut dst, 3, 0);

    let table = OrderedHashTable::new(predict_num_nodes(BATCH, &[fanout]));
    let mut group = c.benchmark_group("remap");
    group.throughput(Throughput::Elements(num as u64));
    group.bench_function("dedup_and_map_edges", |b| {
        b.iter(|| {
            table.reset();
            table.fill_with_unique(&input).unwrap();
            table.fill_with_duplicates(&dst[..num]).unwrap();
            table.map_edges(&src[..num], &dst[..num]).unwrap()
        });
    });
    group.finish();
}

fn bench_gather(c: &mut Criterion) {
    let dim = 128usize;
    // A modest source table plus mock indexing keeps the benchmark about the
    // copy loop rather than page faults on a giant allocation.
    let rows = 1 << 14;
    let feat = Tensor::from_vec(vec![1.0f32; rows * dim], vec![rows, dim]);
    let mut rng = SmallRng::seed_from_u64(17);
    let index: Vec<IdType> =
        (0..BATCH * 4).map(|_| rng.random_range(0..u32::MAX)).collect();
    let extractor = Extractor::with_mock_bits(14);

    let mut group = c.benchmark_group("gather");
    group.throughput(Throughput::Bytes((index.len() * dim * 4) as u64));
    group.bench_function("feat_rows_f32", |b| {
        b.iter(|| extractor.extract(&feat, &index, dim).unwrap());
    });
    group.finish();
}

// ============================================================================
// Criterion main
// ============================================================================

fn main() {
    let mut criterion = Criterion::default()
        .warm_up_time(std::time::Duration::from_secs(2))
        .measurement_time(std::time::Duration::from_secs(8))
        .configure_from_args();

    bench_khop_sweep(&mut criterion);
    bench_remap(&mut criterion);
    bench_gather(&mut criterion);

    criterion.final_summary();
}
