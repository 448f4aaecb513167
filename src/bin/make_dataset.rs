//! Generate a synthetic dataset root in the on-disk training format.
//!
//! Produces a random directed graph with sequential-or-random features and
//! labels, disjoint train/valid/test splits, degree files, and (optionally)
//! alias tables from random edge weights.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin make_dataset -- --out data/synthetic \
//!     --num-node 100000 --avg-degree 16 --feat-dim 128 --num-class 47
//! ```

use std::path::PathBuf;

use clap::Parser;
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use rand::prelude::*;
use rand::rngs::SmallRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use confluence::common::IdType;
use confluence::dataset::{csr_from_edges, DatasetWriter};

#[derive(Parser, Debug)]
#[command(about = "Generate a synthetic graph dataset in the binary training format")]
struct Args {
    /// Output dataset root (created if missing).
    #[arg(long)]
    out: PathBuf,

    #[arg(long, default_value_t = 10_000)]
    num_node: usize,

    /// Average out-degree; per-node degrees are drawn uniformly in
    /// [1, 2*avg).
    #[arg(long, default_value_t = 8)]
    avg_degree: usize,

    #[arg(long, default_value_t = 64)]
    feat_dim: usize,

    #[arg(long, default_value_t = 16)]
    num_class: usize,

    /// Fraction of nodes in the training split; valid and test each take
    /// half of the remainder, capped at 10% apiece.
    #[arg(long, default_value_t = 0.1)]
    train_fraction: f64,

    /// Write `feat[i][j] = i*dim + j` instead of random values, so feature
    /// gathers can be checked exactly.
    #[arg(long, default_value_t = false)]
    sequential_feat: bool,

    /// Also write prob/alias tables built from random edge weights.
    #[arg(long, default_value_t = false)]
    weighted: bool,

    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let mut rng = SmallRng::seed_from_u64(args.seed);

    info!(
        "Generating graph: {} nodes, ~{} avg degree",
        HumanCount(args.num_node as u64),
        args.avg_degree
    );
    let bar = ProgressBar::new(args.num_node as u64).with_style(ProgressStyle::with_template(
        "{bar:40} {human_pos}/{human_len} nodes",
    )?);

    let mut edges: Vec<(IdType, IdType)> = Vec::with_capacity(args.num_node * args.avg_degree);
    for v in 0..args.num_node as IdType {
        let degree = rng.random_range(1..args.avg_degree * 2);
        for _ in 0..degree {
            let mut dst = rng.random_range(0..args.num_node as IdType);
            if dst == v {
                dst = (dst + 1) % args.num_node as IdType;
            }
            edges.push((v, dst));
        }
        bar.inc(1);
    }
    bar.finish();
    let (indptr, indices) = csr_from_edges(args.num_node, edges);
    let num_edge = indices.len();

    let feat: Vec<f32> = if args.sequential_feat {
        (0..args.num_node * args.feat_dim).map(|x| x as f32).collect()
    } else {
        (0..args.num_node * args.feat_dim).map(|_| rng.random::<f32>()).collect()
    };
    let label: Vec<i64> =
        (0..args.num_node).map(|_| rng.random_range(0..args.num_class as i64)).collect();

    // Disjoint splits over a shuffled node permutation.
    let mut order: Vec<IdType> = (0..args.num_node as IdType).collect();
    order.shuffle(&mut rng);
    let num_train = ((args.num_node as f64) * args.train_fraction) as usize;
    let holdout = ((args.num_node - num_train) / 2).min(args.num_node / 10);
    let train_set = order[..num_train].to_vec();
    let valid_set = order[num_train..num_train + holdout].to_vec();
    let test_set = order[num_train + holdout..num_train + 2 * holdout].to_vec();

    let edge_weights = args
        .weighted
        .then(|| (0..num_edge).map(|_| rng.random_range(0.1f32..10.0)).collect());

    let writer = DatasetWriter {
        indptr,
        indices,
        feat_dim: args.feat_dim,
        feat,
        num_class: args.num_class,
        label,
        train_set,
        test_set,
        valid_set,
        edge_weights,
    };
    writer.write(&args.out)?;

    info!(
        "Wrote dataset to {}: {} nodes, {} edges, {} train seeds",
        args.out.display(),
        HumanCount(args.num_node as u64),
        HumanCount(num_edge as u64),
        HumanCount(writer.train_set.len() as u64)
    );
    Ok(())
}
