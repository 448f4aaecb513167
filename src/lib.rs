//! Mini-batch subgraph sampling pipeline for GNN training.
//!
//! For every batch of seed nodes the engine draws a fixed-fanout multi-layer
//! neighbor subgraph from a host-resident graph, renumbers the edges into
//! dense per-layer local ids, gathers features and labels for the final
//! frontier, and hands the assembled batch to the trainer with sampling,
//! remapping, extraction, and device copies overlapped across stages.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod cache;
pub mod common;
pub mod config;
pub mod dataset;
pub mod device;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod hashtable;
pub mod memory_queue;
pub mod profiler;
pub mod queue;
pub mod sampling;
pub mod shuffler;

#[cfg(feature = "python")]
mod python;
