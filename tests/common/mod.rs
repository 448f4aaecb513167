//! Shared fixtures: synthetic on-disk datasets and base configs.

use rand::prelude::*;
use rand::rngs::SmallRng;
use tempfile::TempDir;

use confluence::common::IdType;
use confluence::config::RunConfig;
use confluence::dataset::{csr_from_edges, DatasetWriter};

/// Random connected-ish digraph with sequential features
/// (`feat[i][j] = i*dim + j`) so gathers can be checked exactly.
pub fn synthetic_dataset(
    num_node: usize,
    avg_degree: usize,
    feat_dim: usize,
    num_train: usize,
    weighted: bool,
) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut rng = SmallRng::seed_from_u64(0xfeed);

    let mut edges: Vec<(IdType, IdType)> = Vec::new();
    for v in 0..num_node as IdType {
        // A ring edge keeps every node's degree positive.
        edges.push((v, (v + 1) % num_node as IdType));
        for _ in 0..rng.random_range(0..avg_degree * 2) {
            edges.push((v, rng.random_range(0..num_node as IdType)));
        }
    }
    let (indptr, indices) = csr_from_edges(num_node, edges);
    let num_edge = indices.len();

    let mut order: Vec<IdType> = (0..num_node as IdType).collect();
    order.shuffle(&mut rng);
    let writer = DatasetWriter {
        indptr,
        indices,
        feat_dim,
        feat: (0..num_node * feat_dim).map(|x| x as f32).collect(),
        num_class: 8,
        label: (0..num_node as i64).map(|v| v % 8).collect(),
        train_set: order[..num_train].to_vec(),
        test_set: order[num_train..num_train + 4].to_vec(),
        valid_set: order[num_train + 4..num_train + 8].to_vec(),
        edge_weights: weighted
            .then(|| (0..num_edge).map(|_| rng.random_range(0.5f32..4.0)).collect()),
    };
    writer.write(dir.path()).expect("write dataset");
    dir
}

pub fn base_config(dir: &TempDir) -> RunConfig {
    RunConfig {
        dataset_path: dir.path().to_string_lossy().into_owned(),
        fanout: vec![3, 2],
        batch_size: 8,
        num_epoch: 2,
        seed: 0xabcd,
        ..RunConfig::default()
    }
}
