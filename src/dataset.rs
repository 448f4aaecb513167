//! On-disk dataset layout: loading via mmap and the writer side used by the
//! preprocessing bin and test fixtures.
//!
//! A dataset root holds `meta.txt` plus flat little-endian binary files:
//!
//! ```text
//! meta.txt        whitespace-separated KEY VALUE lines
//! indptr.bin      (N+1) x u32    CSR row offsets
//! indices.bin     E x u32        CSR neighbor lists
//! feat.bin        N x FEAT_DIM x f32
//! label.bin       N x i64
//! train_set.bin   NUM_TRAIN_SET x u32
//! test_set.bin    NUM_TEST_SET x u32
//! valid_set.bin   NUM_VALID_SET x u32
//! prob_table.bin  E x f32        (optional, weighted sampling)
//! alias_table.bin E x i32        (optional, weighted sampling)
//! in_degrees.bin  N x u32        (optional)
//! out_degrees.bin N x u32        (optional)
//! cache_by_*.bin  N x u32        (optional, precomputed cache rankings)
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::common::{DataType, DeviceKind, IdType, Tensor};
use crate::config::{CachePolicy, RunConfig, SampleType};
use crate::device::{Device, DEFAULT_STREAM};
use crate::error::{Error, Result};

pub const META_FILE: &str = "meta.txt";
pub const INDPTR_FILE: &str = "indptr.bin";
pub const INDICES_FILE: &str = "indices.bin";
pub const FEAT_FILE: &str = "feat.bin";
pub const LABEL_FILE: &str = "label.bin";
pub const TRAIN_SET_FILE: &str = "train_set.bin";
pub const TEST_SET_FILE: &str = "test_set.bin";
pub const VALID_SET_FILE: &str = "valid_set.bin";
pub const PROB_TABLE_FILE: &str = "prob_table.bin";
pub const ALIAS_TABLE_FILE: &str = "alias_table.bin";
pub const IN_DEGREE_FILE: &str = "in_degrees.bin";
pub const OUT_DEGREE_FILE: &str = "out_degrees.bin";

pub const META_NUM_NODE: &str = "NUM_NODE";
pub const META_NUM_EDGE: &str = "NUM_EDGE";
pub const META_FEAT_DIM: &str = "FEAT_DIM";
pub const META_NUM_CLASS: &str = "NUM_CLASS";
pub const META_NUM_TRAIN_SET: &str = "NUM_TRAIN_SET";
pub const META_NUM_TEST_SET: &str = "NUM_TEST_SET";
pub const META_NUM_VALID_SET: &str = "NUM_VALID_SET";

/// File holding the precomputed node ranking for a cache policy, if that
/// policy reads one from disk.
pub fn cache_rank_file(policy: CachePolicy) -> Option<&'static str> {
    match policy {
        CachePolicy::ByPresampleStatic => Some("cache_by_presample.bin"),
        _ => None,
    }
}

// ============================================================================
// Dataset
// ============================================================================

/// The host-resident graph. Read-only after load; shared by every stage
/// without locking.
pub struct Dataset {
    pub num_node: usize,
    pub num_edge: usize,
    pub feat_dim: usize,
    pub num_class: usize,

    pub indptr: Tensor,
    pub indices: Tensor,
    pub prob_table: Option<Tensor>,
    pub alias_table: Option<Tensor>,
    pub in_degrees: Option<Tensor>,
    pub out_degrees: Option<Tensor>,
    /// Precomputed cache ranking, present only for the static policies.
    pub ranking_nodes: Option<Tensor>,

    pub feat: Tensor,
    pub label: Tensor,

    pub train_set: Tensor,
    pub test_set: Tensor,
    pub valid_set: Tensor,
}

fn parse_meta(path: &Path) -> Result<HashMap<String, usize>> {
    let text = std::fs::read_to_string(path)?;
    let mut meta = HashMap::new();
    for line in text.lines() {
        let mut it = line.split_whitespace();
        let (Some(k), Some(v)) = (it.next(), it.next()) else { continue };
        let v: usize = v.parse().map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: bad value for {k}: {v}", path.display()),
            ))
        })?;
        meta.insert(k.to_string(), v);
    }
    Ok(meta)
}

fn meta_get(meta: &HashMap<String, usize>, key: &str, path: &Path) -> Result<usize> {
    meta.get(key).copied().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{}: missing key {key}", path.display()),
        ))
    })
}

impl Dataset {
    /// Load a dataset root. Topology tensors move to the sampler device for
    /// accelerator topologies; the feature and label tables always stay
    /// memory-mapped on the host.
    pub fn load(
        root: &Path,
        config: &RunConfig,
        sampler_device: &Arc<dyn Device>,
    ) -> Result<Dataset> {
        let start = std::time::Instant::now();
        let meta_path = root.join(META_FILE);
        let meta = parse_meta(&meta_path)?;

        let num_node = meta_get(&meta, META_NUM_NODE, &meta_path)?;
        let num_edge = meta_get(&meta, META_NUM_EDGE, &meta_path)?;
        let feat_dim = meta_get(&meta, META_FEAT_DIM, &meta_path)?;
        let num_class = meta_get(&meta, META_NUM_CLASS, &meta_path)?;
        let num_train = meta_get(&meta, META_NUM_TRAIN_SET, &meta_path)?;
        let num_test = meta_get(&meta, META_NUM_TEST_SET, &meta_path)?;
        let num_valid = meta_get(&meta, META_NUM_VALID_SET, &meta_path)?;

        let mmap_id = |file: &str, len: usize| -> Result<Tensor> {
            Tensor::from_mmap(&root.join(file), DataType::I32, vec![len])
        };

        let indptr = mmap_id(INDPTR_FILE, num_node + 1)?;
        let indices = mmap_id(INDICES_FILE, num_edge)?;

        // The sampler reads topology on every layer; keep it resident on the
        // sampler device for the accelerator topologies.
        let (indptr, indices) = if config.sampler_ctx.kind == DeviceKind::Accel {
            (
                indptr.copy_to(sampler_device, DEFAULT_STREAM)?,
                indices.copy_to(sampler_device, DEFAULT_STREAM)?,
            )
        } else {
            (indptr, indices)
        };

        let (prob_table, alias_table) = if config.sample_type == SampleType::WeightedKhop {
            let prob =
                Tensor::from_mmap(&root.join(PROB_TABLE_FILE), DataType::F32, vec![num_edge])?;
            let alias = mmap_id(ALIAS_TABLE_FILE, num_edge)?;
            (Some(prob), Some(alias))
        } else {
            (None, None)
        };

        let optional_ids = |file: &str, len: usize| -> Result<Option<Tensor>> {
            if root.join(file).exists() { Ok(Some(mmap_id(file, len)?)) } else { Ok(None) }
        };
        let in_degrees = optional_ids(IN_DEGREE_FILE, num_node)?;
        let out_degrees = optional_ids(OUT_DEGREE_FILE, num_node)?;
        let ranking_nodes = match cache_rank_file(config.cache_policy) {
            Some(file) => Some(mmap_id(file, num_node)?),
            None => None,
        };

        let feat =
            Tensor::from_mmap(&root.join(FEAT_FILE), DataType::F32, vec![num_node, feat_dim])?;
        let label = Tensor::from_mmap(&root.join(LABEL_FILE), DataType::I64, vec![num_node])?;

        let train_set = mmap_id(TRAIN_SET_FILE, num_train)?;
        let test_set = mmap_id(TEST_SET_FILE, num_test)?;
        let valid_set = mmap_id(VALID_SET_FILE, num_valid)?;

        let dataset = Dataset {
            num_node,
            num_edge,
            feat_dim,
            num_class,
            indptr,
            indices,
            prob_table,
            alias_table,
            in_degrees,
            out_degrees,
            ranking_nodes,
            feat,
            label,
            train_set,
            test_set,
            valid_set,
        };
        dataset.validate(config.sanity_check)?;

        tracing::info!(
            path = %root.display(),
            num_node,
            num_edge,
            feat_dim,
            num_class,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "dataset loaded"
        );
        Ok(dataset)
    }

    /// Check the CSR invariants. The O(E) bounds check on `indices` only
    /// runs under `SANITY_CHECK`.
    fn validate(&self, deep: bool) -> Result<()> {
        let indptr = self.indptr();
        if indptr.len() != self.num_node + 1 {
            return Err(Error::invariant("indptr length != num_node + 1"));
        }
        if indptr[0] != 0 || indptr[self.num_node] as usize != self.num_edge {
            return Err(Error::invariant(format!(
                "indptr endpoints [{}, {}] disagree with num_edge {}",
                indptr[0], indptr[self.num_node], self.num_edge
            )));
        }
        if indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::invariant("indptr is not non-decreasing"));
        }
        if deep {
            let n = self.num_node as IdType;
            if let Some(bad) = self.indices().iter().position(|&v| v >= n) {
                return Err(Error::invariant(format!(
                    "indices[{bad}] = {} out of range [0, {n})",
                    self.indices()[bad]
                )));
            }
        }
        Ok(())
    }

    pub fn indptr(&self) -> &[IdType] {
        self.indptr.as_slice::<IdType>()
    }

    pub fn indices(&self) -> &[IdType] {
        self.indices.as_slice::<IdType>()
    }

    pub fn train_set(&self) -> &[IdType] {
        self.train_set.as_slice::<IdType>()
    }

    pub fn degree(&self, node: IdType) -> usize {
        let indptr = self.indptr();
        (indptr[node as usize + 1] - indptr[node as usize]) as usize
    }
}

// ============================================================================
// Writers
// ============================================================================

fn write_u32s(path: &Path, data: &[u32]) -> std::io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    for &v in data {
        w.write_all(&v.to_le_bytes())?;
    }
    w.flush()
}

fn write_f32s(path: &Path, data: &[f32]) -> std::io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    for &v in data {
        w.write_all(&v.to_le_bytes())?;
    }
    w.flush()
}

fn write_i64s(path: &Path, data: &[i64]) -> std::io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    for &v in data {
        w.write_all(&v.to_le_bytes())?;
    }
    w.flush()
}

/// In-memory dataset staged for writing. Used by `make_dataset` and by the
/// test fixtures that need a real on-disk root.
pub struct DatasetWriter {
    pub indptr: Vec<IdType>,
    pub indices: Vec<IdType>,
    pub feat_dim: usize,
    pub feat: Vec<f32>,
    pub num_class: usize,
    pub label: Vec<i64>,
    pub train_set: Vec<IdType>,
    pub test_set: Vec<IdType>,
    pub valid_set: Vec<IdType>,
    /// Per-edge weights; when present the alias tables are built and written.
    pub edge_weights: Option<Vec<f32>>,
}

impl DatasetWriter {
    pub fn num_node(&self) -> usize {
        self.indptr.len() - 1
    }

    pub fn num_edge(&self) -> usize {
        self.indices.len()
    }

    /// Write every dataset file under `root`.
    pub fn write(&self, root: &Path) -> Result<()> {
        std::fs::create_dir_all(root)?;
        let num_node = self.num_node();

        let mut meta = BufWriter::new(File::create(root.join(META_FILE))?);
        writeln!(meta, "{META_NUM_NODE} {num_node}")?;
        writeln!(meta, "{META_NUM_EDGE} {}", self.num_edge())?;
        writeln!(meta, "{META_FEAT_DIM} {}", self.feat_dim)?;
        writeln!(meta, "{META_NUM_CLASS} {}", self.num_class)?;
        writeln!(meta, "{META_NUM_TRAIN_SET} {}", self.train_set.len())?;
        writeln!(meta, "{META_NUM_TEST_SET} {}", self.test_set.len())?;
        writeln!(meta, "{META_NUM_VALID_SET} {}", self.valid_set.len())?;
        meta.flush()?;

        write_u32s(&root.join(INDPTR_FILE), &self.indptr)?;
        write_u32s(&root.join(INDICES_FILE), &self.indices)?;
        write_f32s(&root.join(FEAT_FILE), &self.feat)?;
        write_i64s(&root.join(LABEL_FILE), &self.label)?;
        write_u32s(&root.join(TRAIN_SET_FILE), &self.train_set)?;
        write_u32s(&root.join(TEST_SET_FILE), &self.test_set)?;
        write_u32s(&root.join(VALID_SET_FILE), &self.valid_set)?;

        let (in_deg, out_deg) = self.degrees();
        write_u32s(&root.join(IN_DEGREE_FILE), &in_deg)?;
        write_u32s(&root.join(OUT_DEGREE_FILE), &out_deg)?;

        if let Some(weights) = &self.edge_weights {
            if weights.len() != self.num_edge() {
                return Err(Error::invariant(format!(
                    "{} edge weights for {} edges",
                    weights.len(),
                    self.num_edge()
                )));
            }
            let (prob, alias) =
                crate::sampling::weighted::build_alias_tables(&self.indptr, weights);
            write_f32s(&root.join(PROB_TABLE_FILE), &prob)?;
            write_u32s(&root.join(ALIAS_TABLE_FILE), &alias)?;
        }
        Ok(())
    }

    fn degrees(&self) -> (Vec<u32>, Vec<u32>) {
        let num_node = self.num_node();
        let mut in_deg = vec![0u32; num_node];
        let mut out_deg = vec![0u32; num_node];
        for v in 0..num_node {
            out_deg[v] = self.indptr[v + 1] - self.indptr[v];
        }
        for &dst in &self.indices {
            in_deg[dst as usize] += 1;
        }
        (in_deg, out_deg)
    }
}

/// Build a CSR from a directed edge list. Edges are sorted in place by
/// source node; isolated trailing nodes get empty ranges.
pub fn csr_from_edges(num_node: usize, mut edges: Vec<(IdType, IdType)>) -> (Vec<IdType>, Vec<IdType>) {
    edges.sort_unstable();
    let mut indptr = Vec::with_capacity(num_node + 1);
    let mut indices = Vec::with_capacity(edges.len());
    indptr.push(0);
    let mut current = 0u32;
    for (src, dst) in edges {
        while current < src {
            indptr.push(indices.len() as IdType);
            current += 1;
        }
        indices.push(dst);
    }
    while indptr.len() <= num_node {
        indptr.push(indices.len() as IdType);
    }
    (indptr, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Context;
    use crate::device::HostDevice;

    /// Tiny 6-node path graph 0-1-2-3-4-5 with sequential features.
    pub(crate) fn path_graph_writer(feat_dim: usize) -> DatasetWriter {
        let num_node = 6usize;
        let mut edges = Vec::new();
        for v in 0..num_node as IdType - 1 {
            edges.push((v, v + 1));
            edges.push((v + 1, v));
        }
        let (indptr, indices) = csr_from_edges(num_node, edges);
        let feat: Vec<f32> = (0..num_node * feat_dim).map(|x| x as f32).collect();
        let label: Vec<i64> = (0..num_node as i64).collect();
        DatasetWriter {
            indptr,
            indices,
            feat_dim,
            feat,
            num_class: num_node,
            label,
            train_set: vec![3],
            test_set: vec![0],
            valid_set: vec![5],
            edge_weights: None,
        }
    }

    #[test]
    fn csr_from_edges_matches_known_path_graph() {
        let w = path_graph_writer(4);
        assert_eq!(w.indptr, vec![0, 1, 3, 5, 7, 9, 10]);
        assert_eq!(w.indices, vec![1, 0, 2, 1, 3, 2, 4, 3, 5, 4]);
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let writer = path_graph_writer(4);
        writer.write(dir.path()).unwrap();

        let config = RunConfig {
            dataset_path: dir.path().to_string_lossy().into_owned(),
            sanity_check: true,
            ..RunConfig::default()
        };
        let device = HostDevice::new(Context::host());
        let ds = Dataset::load(dir.path(), &config, &device).unwrap();

        assert_eq!(ds.num_node, 6);
        assert_eq!(ds.num_edge, 10);
        assert_eq!(ds.indptr(), &writer.indptr[..]);
        assert_eq!(ds.indices(), &writer.indices[..]);
        assert_eq!(ds.train_set(), &[3]);
        assert_eq!(ds.degree(0), 1);
        assert_eq!(ds.degree(3), 2);
        assert_eq!(ds.feat.as_slice::<f32>()[4 * 3], 12.0);
    }

    #[test]
    fn load_rejects_truncated_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = path_graph_writer(4);
        writer.write(dir.path()).unwrap();
        // Corrupt: drop the last 4 bytes of indices.bin.
        let path = dir.path().join(INDICES_FILE);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        let config = RunConfig {
            dataset_path: dir.path().to_string_lossy().into_owned(),
            ..RunConfig::default()
        };
        let device = HostDevice::new(Context::host());
        assert!(matches!(Dataset::load(dir.path(), &config, &device), Err(Error::Io(_))));
    }
}
