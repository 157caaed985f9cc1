//! Graph primitives: COO edge lists, graph bundles and message propagation.
//!
//! Edges are stored as two parallel `u32` lists (`rows` = source,
//! `cols` = target). Messages always flow source → target, so the
//! aggregation at node `i` sums over its incoming edges.
//!
//! ```text
//! out[i] = sum_{(j, i) in E} w_ji * x[j]
//! ```

use std::collections::HashSet;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

// ============================================================================
// EDGE INDEX
// ============================================================================

/// Directed edge list in coordinate format.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EdgeIndex {
    rows: Vec<u32>,
    cols: Vec<u32>,
}

impl EdgeIndex {
    /// Build from parallel source/target lists.
    pub fn new(rows: Vec<u32>, cols: Vec<u32>) -> Result<Self> {
        if rows.len() != cols.len() {
            return Err(Error::Shape(format!(
                "edge index rows ({}) and cols ({}) differ in length",
                rows.len(),
                cols.len()
            )));
        }
        Ok(Self { rows, cols })
    }

    /// Build from `(source, target)` pairs.
    pub fn from_pairs(pairs: &[(u32, u32)]) -> Self {
        let (rows, cols) = pairs.iter().copied().unzip();
        Self { rows, cols }
    }

    /// Undirected cycle `0 - 1 - ... - (n-1) - 0`, both directions stored.
    pub fn cycle(n: usize) -> Self {
        let mut pairs = Vec::with_capacity(2 * n);
        if n > 1 {
            for i in 0..n as u32 {
                let j = (i + 1) % n as u32;
                pairs.push((i, j));
                pairs.push((j, i));
            }
        }
        Self::from_pairs(&pairs)
    }

    pub fn rows(&self) -> &[u32] {
        &self.rows
    }

    pub fn cols(&self) -> &[u32] {
        &self.cols
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate `(source, target)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.rows.iter().copied().zip(self.cols.iter().copied())
    }

    /// Check every endpoint is in `[0, num_nodes)`.
    pub fn validate(&self, num_nodes: usize) -> Result<()> {
        for &node in self.rows.iter().chain(self.cols.iter()) {
            if node as usize >= num_nodes {
                return Err(Error::NodeOutOfRange {
                    node: node as usize,
                    num_nodes,
                });
            }
        }
        Ok(())
    }

    /// Add a self-loop for every node that does not already have one.
    pub fn with_self_loops(&self, num_nodes: usize) -> Self {
        let looped: HashSet<u32> = self
            .pairs()
            .filter(|(s, t)| s == t)
            .map(|(s, _)| s)
            .collect();

        let mut out = self.clone();
        for node in 0..num_nodes as u32 {
            if !looped.contains(&node) {
                out.rows.push(node);
                out.cols.push(node);
            }
        }
        out
    }

    /// In-degree of every node (count of edges whose target is the node).
    pub fn in_degree(&self, num_nodes: usize) -> Vec<f32> {
        let mut deg = vec![0f32; num_nodes];
        for &t in &self.cols {
            deg[t as usize] += 1.0;
        }
        deg
    }

    /// Symmetric edge weights `1/sqrt(deg[src]) * 1/sqrt(deg[dst])`.
    ///
    /// `deg` is the in-degree at the target. A node with zero degree
    /// contributes weight 0 instead of `inf`.
    pub fn symmetric_norm(&self, num_nodes: usize) -> Vec<f32> {
        let inv_sqrt: Vec<f32> = self
            .in_degree(num_nodes)
            .into_iter()
            .map(|d| if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 })
            .collect();

        self.pairs()
            .map(|(s, t)| {
                let w = inv_sqrt[t as usize] * inv_sqrt[s as usize];
                if w.is_finite() {
                    w
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Edge weights `1/deg[dst]`, for mean aggregation.
    pub fn mean_norm(&self, num_nodes: usize) -> Vec<f32> {
        let deg = self.in_degree(num_nodes);
        self.cols
            .iter()
            .map(|&t| {
                let d = deg[t as usize];
                if d > 0.0 {
                    1.0 / d
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Row-major boolean adjacency, `mask[src * n + dst]`.
    pub fn dense_mask(&self, num_nodes: usize) -> Vec<bool> {
        let mut mask = vec![false; num_nodes * num_nodes];
        for (s, t) in self.pairs() {
            mask[s as usize * num_nodes + t as usize] = true;
        }
        mask
    }

    /// Inverse of [`dense_mask`](Self::dense_mask): edges in row-major order.
    pub fn from_dense_mask(num_nodes: usize, mask: &[bool]) -> Result<Self> {
        if mask.len() != num_nodes * num_nodes {
            return Err(Error::DimensionMismatch {
                expected: num_nodes * num_nodes,
                got: mask.len(),
            });
        }
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        for (idx, _) in mask.iter().enumerate().filter(|(_, m)| **m) {
            rows.push((idx / num_nodes) as u32);
            cols.push((idx % num_nodes) as u32);
        }
        Ok(Self { rows, cols })
    }

    /// Source indices as a `u32` tensor.
    pub fn sources(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.rows, self.rows.len(), device)?)
    }

    /// Target indices as a `u32` tensor.
    pub fn targets(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.cols, self.cols.len(), device)?)
    }
}

// ============================================================================
// PROPAGATION
// ============================================================================

/// Weighted scatter-sum of source features into targets.
///
/// # Arguments
/// - `x`: node features, `(N, ...)`
/// - `edges`: edge list, endpoints in `[0, N)`
/// - `weights`: optional per-edge weights, one per edge
///
/// # Returns
/// Tensor shaped like `x`. Nodes with no incoming edge receive zeros.
pub fn propagate(x: &Tensor, edges: &EdgeIndex, weights: Option<&[f32]>) -> Result<Tensor> {
    let zeros = x.zeros_like()?;
    if edges.is_empty() {
        return Ok(zeros);
    }
    let device = x.device();
    let src = edges.sources(device)?;
    let dst = edges.targets(device)?;

    let mut messages = x.index_select(&src, 0)?;
    if let Some(w) = weights {
        if w.len() != edges.len() {
            return Err(Error::DimensionMismatch {
                expected: edges.len(),
                got: w.len(),
            });
        }
        let mut shape = vec![w.len()];
        shape.resize(x.rank(), 1);
        let w = Tensor::from_slice(w, shape, device)?.to_dtype(x.dtype())?;
        messages = messages.broadcast_mul(&w)?;
    }
    Ok(zeros.index_add(&dst, &messages, 0)?)
}

/// GCN propagation `D^{-1/2} A D^{-1/2} X` over the given edges.
pub fn gcn_propagate(x: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
    let n = x.dim(0)?;
    let norm = edges.symmetric_norm(n);
    propagate(x, edges, Some(&norm))
}

// ============================================================================
// DATASETS
// ============================================================================

/// Dataset identity, used only to pick label shaping and masking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    TwitchE,
    Fb100,
    /// Partially labelled: every loss is restricted to the node mask.
    Elliptic,
    /// Any other dataset: log-softmax + NLL on class ids.
    Other(String),
}

impl DatasetKind {
    /// Datasets whose labels are shaped into float (one-hot) targets.
    pub fn uses_float_targets(&self) -> bool {
        matches!(self, Self::TwitchE | Self::Fb100 | Self::Elliptic)
    }

    pub fn requires_mask(&self) -> bool {
        matches!(self, Self::Elliptic)
    }
}

impl FromStr for DatasetKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "twitch-e" => Self::TwitchE,
            "fb100" => Self::Fb100,
            "elliptic" => Self::Elliptic,
            other => Self::Other(other.to_string()),
        })
    }
}

impl Default for DatasetKind {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

// ============================================================================
// GRAPH DATA
// ============================================================================

/// A node-classification graph: features, structure, labels.
#[derive(Debug, Clone)]
pub struct GraphData {
    /// Node features, `(n, d)` f32.
    pub features: Tensor,
    pub edges: EdgeIndex,
    /// Labels, `(n, 1)` class ids or `(n, k)` one-hot, u32.
    pub labels: Tensor,
    /// Indices of labelled nodes.
    pub mask: Option<Vec<u32>>,
    pub dataset: DatasetKind,
}

impl GraphData {
    /// Bundle a graph, checking that features, labels and edges agree on `n`.
    pub fn new(
        features: Tensor,
        edges: EdgeIndex,
        labels: Tensor,
        dataset: DatasetKind,
    ) -> Result<Self> {
        let (n, _) = features.dims2()?;
        let labels = match labels.rank() {
            1 => labels.unsqueeze(1)?,
            2 => labels,
            r => {
                return Err(Error::Shape(format!(
                    "labels must be rank 1 or 2, got rank {r}"
                )))
            }
        };
        if labels.dim(0)? != n {
            return Err(Error::Shape(format!(
                "label rows ({}) must equal node count ({n})",
                labels.dim(0)?
            )));
        }
        edges.validate(n)?;

        Ok(Self {
            features: features.to_dtype(DType::F32)?,
            edges,
            labels: labels.to_dtype(DType::U32)?,
            mask: None,
            dataset,
        })
    }

    /// Restrict losses to the given labelled nodes.
    pub fn with_mask(mut self, mask: Vec<u32>) -> Result<Self> {
        let n = self.num_nodes();
        if let Some(&bad) = mask.iter().find(|&&i| i as usize >= n) {
            return Err(Error::NodeOutOfRange {
                node: bad as usize,
                num_nodes: n,
            });
        }
        self.mask = Some(mask);
        Ok(self)
    }

    pub fn num_nodes(&self) -> usize {
        self.features.dims()[0]
    }

    pub fn num_features(&self) -> usize {
        self.features.dims()[1]
    }

    /// Select labelled rows of `t` when the dataset is masked; otherwise `t`.
    pub fn select_labelled(&self, t: &Tensor) -> Result<Tensor> {
        if !self.dataset.requires_mask() {
            return Ok(t.clone());
        }
        let mask = self.mask.as_ref().ok_or_else(|| {
            Error::Shape("masked dataset requires a node mask".to_string())
        })?;
        let idx = Tensor::from_slice(mask, mask.len(), t.device())?;
        Ok(t.index_select(&idx, 0)?)
    }

    /// Copy of the features with the last `min(count, d)` columns zeroed.
    pub fn features_without_trailing(&self, count: usize) -> Result<Tensor> {
        zero_trailing_columns(&self.features, count)
    }
}

/// Copy of `x` with the last `min(count, d)` columns set to zero.
pub fn zero_trailing_columns(x: &Tensor, count: usize) -> Result<Tensor> {
    let (n, d) = x.dims2()?;
    let k = count.min(d);
    if k == 0 {
        return Ok(x.clone());
    }
    let zeros = Tensor::zeros((n, k), x.dtype(), x.device())?;
    if k == d {
        return Ok(zeros);
    }
    let kept = x.narrow(1, 0, d - k)?;
    Ok(Tensor::cat(&[&kept, &zeros], 1)?.contiguous()?)
}
