//! Drive the pipeline over a dataset and print per-batch summary stats.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin sample_once -- --dataset data/synthetic \
//!     --fanout 10 --fanout 10 --batch-size 512 --num-batch 8
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use confluence::config::{CachePolicy, RunArch, RunConfig, SampleType};
use confluence::engine::Engine;

#[derive(Parser, Debug)]
#[command(about = "Run the sampling pipeline for a few batches and print stats")]
struct Args {
    /// Dataset root directory.
    #[arg(long)]
    dataset: PathBuf,

    /// Per-layer fanout, repeated once per layer (feature side first).
    #[arg(long, default_values_t = vec![25usize, 10])]
    fanout: Vec<usize>,

    #[arg(long, default_value_t = 1024)]
    batch_size: usize,

    /// Batches to pull before exiting.
    #[arg(long, default_value_t = 4)]
    num_batch: usize,

    /// Sampling kernel: khop_reservoir, khop_sample_parallel,
    /// weighted_khop, or random_walk.
    #[arg(long, default_value = "khop_reservoir")]
    sample_type: String,

    /// Fraction of feature rows cached by degree.
    #[arg(long, default_value_t = 0.0)]
    cache_percentage: f64,

    #[arg(long, default_value_t = 0x2021_0711)]
    seed: u64,
}

fn parse_sample_type(value: &str) -> SampleType {
    match value {
        "khop_reservoir" => SampleType::KhopReservoir,
        "khop_sample_parallel" => SampleType::KhopSampleParallel,
        "weighted_khop" => SampleType::WeightedKhop,
        "random_walk" => SampleType::RandomWalk,
        other => panic!("unknown sample_type: {other}"),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let config = RunConfig {
        dataset_path: args.dataset.to_string_lossy().into_owned(),
        run_arch: RunArch::Arch0,
        sample_type: parse_sample_type(&args.sample_type),
        fanout: args.fanout.clone(),
        batch_size: args.batch_size,
        num_epoch: 1,
        cache_policy: if args.cache_percentage > 0.0 {
            CachePolicy::ByDegree
        } else {
            CachePolicy::None
        },
        cache_percentage: args.cache_percentage,
        seed: args.seed,
        ..RunConfig::default()
    };

    let mut engine = Engine::init(config)?;
    info!(
        "Dataset: {} classes, feat dim {}, {} steps/epoch",
        engine.num_class(),
        engine.feat_dim(),
        engine.steps_per_epoch()
    );
    engine.start()?;

    let num_batch = (args.num_batch as u64).min(engine.steps_per_epoch());
    for step in 0..num_batch {
        let batch = engine.next_batch(0, step)?;
        let graphs = batch.train_graphs.get().expect("delivered batch has graphs");
        let feat = batch.train_feat.get().expect("delivered batch has features");
        info!(
            "batch {:>3}: seeds={} input_nodes={} feat={:?}",
            step,
            batch.output_nodes.len(),
            batch.train_input_nodes.get().map(|t| t.len()).unwrap_or(0),
            feat.shape(),
        );
        for (layer, g) in graphs.iter().enumerate() {
            info!(
                "  layer {layer}: {} edges, {} src, {} dst",
                g.num_edge, g.num_src, g.num_dst
            );
        }
    }

    engine.shutdown();
    info!("Done.");
    Ok(())
}
