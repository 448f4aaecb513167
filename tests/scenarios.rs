//! Concrete end-to-end scenarios on small hand-built graphs.

mod common;

use confluence::common::{IdType, Tensor};
use confluence::config::{CachePolicy, RunConfig, SampleType};
use confluence::dataset::{csr_from_edges, DatasetWriter};
use confluence::engine::Engine;

use common::{base_config, synthetic_dataset};

/// The 6-node path graph 0-1-2-3-4-5 with seed 3 and fanout [2, 2].
fn path_graph_config(dir: &tempfile::TempDir) -> RunConfig {
    let mut edges = Vec::new();
    for v in 0..5 as IdType {
        edges.push((v, v + 1));
        edges.push((v + 1, v));
    }
    let (indptr, indices) = csr_from_edges(6, edges);
    assert_eq!(indptr, vec![0, 1, 3, 5, 7, 9, 10]);
    assert_eq!(indices, vec![1, 0, 2, 1, 3, 2, 4, 3, 5, 4]);

    let feat_dim = 2;
    DatasetWriter {
        indptr,
        indices,
        feat_dim,
        feat: (0..6 * feat_dim).map(|x| x as f32).collect(),
        num_class: 6,
        label: (0..6).collect(),
        train_set: vec![3],
        test_set: vec![0],
        valid_set: vec![5],
        edge_weights: None,
    }
    .write(dir.path())
    .unwrap();

    RunConfig {
        dataset_path: dir.path().to_string_lossy().into_owned(),
        fanout: vec![2, 2],
        batch_size: 1,
        num_epoch: 1,
        ..RunConfig::default()
    }
}

/// Recover global `(neighbor, input)` pairs from a remapped layer.
fn global_edges(row: &Tensor, col: &Tensor, frontier: &[IdType]) -> Vec<(IdType, IdType)> {
    row.as_slice::<IdType>()
        .iter()
        .zip(col.as_slice::<IdType>())
        .map(|(&r, &c)| (frontier[r as usize], frontier[c as usize]))
        .collect()
}

#[test]
fn khop_on_a_path_graph_expands_both_layers() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::init(path_graph_config(&dir)).unwrap();
    engine.sample_once().unwrap();
    let task = engine.next_batch(0, 0).unwrap();

    assert_eq!(task.output_nodes.as_slice::<IdType>(), &[3]);
    let frontier = task.train_input_nodes.get().unwrap();
    let frontier = frontier.as_slice::<IdType>();
    assert_eq!(frontier, &[3, 2, 4, 1, 5], "first-appearance frontier order");

    let graphs = task.train_graphs.get().unwrap();
    assert_eq!(graphs.len(), 2);

    // Seed layer: both of 3's neighbors, since deg(3) = fanout = 2.
    let seed_layer = &graphs[1];
    assert_eq!((seed_layer.num_src, seed_layer.num_dst, seed_layer.num_edge), (3, 1, 2));
    let mut edges = global_edges(&seed_layer.row, &seed_layer.col, frontier);
    edges.sort_unstable();
    assert_eq!(edges, vec![(2, 3), (4, 3)]);

    // Feature layer: every frontier node has degree 2, so all 6 edges land.
    let feat_layer = &graphs[0];
    assert_eq!((feat_layer.num_src, feat_layer.num_dst, feat_layer.num_edge), (5, 3, 6));
    let mut edges = global_edges(&feat_layer.row, &feat_layer.col, frontier);
    edges.sort_unstable();
    assert_eq!(edges, vec![(1, 2), (2, 3), (3, 2), (3, 4), (4, 3), (5, 4)]);

    // Feature round-trip on the path graph fixture.
    let feat = task.train_feat.get().unwrap().as_slice::<f32>().to_vec();
    for (i, &node) in frontier.iter().enumerate() {
        assert_eq!(feat[i * 2], (node * 2) as f32);
        assert_eq!(feat[i * 2 + 1], (node * 2 + 1) as f32);
    }
}

/// Scenario S3: a fixed seed makes weighted k-hop reproducible end to end.
#[test]
fn weighted_khop_is_deterministic_across_runs() {
    let dir = synthetic_dataset(64, 4, 4, 16, true);
    let run = || {
        let config = RunConfig {
            sample_type: SampleType::WeightedKhop,
            num_epoch: 1,
            ..base_config(&dir)
        };
        let mut engine = Engine::init(config).unwrap();
        engine.start().unwrap();
        let mut out = Vec::new();
        for step in 0..engine.steps_per_epoch() {
            let task = engine.next_batch(0, step).unwrap();
            for g in task.train_graphs.get().unwrap() {
                out.push((
                    g.row.as_slice::<IdType>().to_vec(),
                    g.col.as_slice::<IdType>().to_vec(),
                ));
            }
        }
        engine.shutdown();
        out
    };
    assert_eq!(run(), run());
}

/// A cached run must deliver byte-identical features to an uncached one.
#[test]
fn cached_features_match_uncached_features() {
    let dir = synthetic_dataset(64, 4, 4, 16, false);
    let gather = |policy: CachePolicy, percentage: f64| {
        let config = RunConfig {
            cache_policy: policy,
            cache_percentage: percentage,
            num_epoch: 1,
            ..base_config(&dir)
        };
        let mut engine = Engine::init(config).unwrap();
        engine.start().unwrap();
        let mut feats = Vec::new();
        for step in 0..engine.steps_per_epoch() {
            let task = engine.next_batch(0, step).unwrap();
            feats.push(task.train_feat.get().unwrap().as_slice::<f32>().to_vec());
        }
        engine.shutdown();
        feats
    };

    let plain = gather(CachePolicy::None, 0.0);
    for policy in [CachePolicy::ByDegree, CachePolicy::ByHeuristic, CachePolicy::ByPresample] {
        assert_eq!(plain, gather(policy, 0.5), "{policy:?} altered gathered features");
    }
}
