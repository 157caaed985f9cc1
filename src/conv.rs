//! Message-passing convolutional layers over [`EdgeIndex`] structure.
//!
//! - [`GcnConv`]: Graph Convolutional Network (Kipf & Welling, 2017)
//! - [`SageConv`]: GraphSAGE with mean aggregation (Hamilton et al., 2017)
//! - [`GatConv`]: Graph Attention Network (Velickovic et al., 2018)
//! - [`GprProp`]: Generalized PageRank propagation (Chien et al., 2021)
//! - [`Gcn2Conv`]: GCNII layer (Chen et al., 2020)
//!
//! # Message Passing Framework
//!
//! ```text
//! h_i^{(l+1)} = UPDATE(h_i^{(l)}, AGGREGATE({MESSAGE(h_j^{(l)}) : j in N(i)}))
//! ```
//!
//! Aggregation is a scatter-sum over incoming edges (see
//! [`propagate`](crate::graph::propagate)), so no dense `N x N` adjacency is
//! ever materialized.

use candle_core::{DType, Tensor, D};
use candle_nn::{linear, linear_no_bias, Init, Linear, Module, VarBuilder};

use crate::error::Result;
use crate::graph::{gcn_propagate, propagate, EdgeIndex};

/// Graph Convolutional Network layer.
///
/// Implements: H' = D^{-1/2} (A + I) D^{-1/2} H W + b
///
/// Self-loops are added for nodes that lack one before normalization.
///
/// # Reference
///
/// Kipf & Welling, "Semi-Supervised Classification with Graph Convolutional
/// Networks", ICLR 2017.
#[derive(Debug, Clone)]
pub struct GcnConv {
    linear: Linear,
    bias: Tensor,
}

impl GcnConv {
    /// Create a new GCN layer.
    ///
    /// # Arguments
    /// - `in_features`: Input feature dimension
    /// - `out_features`: Output feature dimension
    /// - `vb`: Variable builder for parameter initialization
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let linear = linear_no_bias(in_features, out_features, vb.pp("lin"))?;
        let bias = vb.get_with_hints(out_features, "bias", Init::Const(0.))?;
        Ok(Self { linear, bias })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `x`: Node features (N x in_features)
    /// - `edges`: Edge list, self-loops optional
    ///
    /// # Returns
    /// - Node embeddings (N x out_features)
    pub fn forward(&self, x: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        let n = x.dim(0)?;
        let h = self.linear.forward(x)?;
        let looped = edges.with_self_loops(n);
        let out = gcn_propagate(&h, &looped)?;
        Ok(out.broadcast_add(&self.bias)?)
    }
}

/// GraphSAGE layer with mean aggregation.
///
/// h_i' = W_l * mean_{j in N(i)} h_j + W_r * h_i
///
/// # Reference
///
/// Hamilton et al., "Inductive Representation Learning on Large Graphs",
/// NeurIPS 2017.
#[derive(Debug, Clone)]
pub struct SageConv {
    lin_neighbor: Linear,
    lin_self: Linear,
}

impl SageConv {
    /// Create a new GraphSAGE layer.
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let lin_neighbor = linear(in_features, out_features, vb.pp("lin_l"))?;
        let lin_self = linear_no_bias(in_features, out_features, vb.pp("lin_r"))?;
        Ok(Self {
            lin_neighbor,
            lin_self,
        })
    }

    pub fn forward(&self, x: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        let n = x.dim(0)?;
        let norm = edges.mean_norm(n);
        let agg = propagate(x, edges, Some(&norm))?;
        let out = (self.lin_neighbor.forward(&agg)? + self.lin_self.forward(x)?)?;
        Ok(out)
    }
}

/// Graph Attention Network layer.
///
/// Implements attention-weighted aggregation:
/// h_i' = sum_{j in N(i) ∪ {i}} alpha_{ij} W h_j
///
/// Where alpha_{ij} = softmax_j(LeakyReLU(a_src^T W h_j + a_dst^T W h_i)).
/// The softmax runs over the incoming edges of each target node.
///
/// # Reference
///
/// Velickovic et al., "Graph Attention Networks", ICLR 2018.
#[derive(Debug, Clone)]
pub struct GatConv {
    linear: Linear,
    att_src: Tensor,
    att_dst: Tensor,
    bias: Tensor,
    num_heads: usize,
    out_per_head: usize,
    concat: bool,
    negative_slope: f64,
}

impl GatConv {
    /// Create a new GAT layer.
    ///
    /// # Arguments
    /// - `in_features`: Input feature dimension
    /// - `out_features`: Output feature dimension per head
    /// - `num_heads`: Number of attention heads
    /// - `concat`: Concatenate heads (`heads * out`) instead of averaging them
    /// - `vb`: Variable builder
    pub fn new(
        in_features: usize,
        out_features: usize,
        num_heads: usize,
        concat: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let linear = linear_no_bias(in_features, out_features * num_heads, vb.pp("lin"))?;
        let bound = (6.0 / (num_heads + out_features) as f64).sqrt();
        let att_init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let att_src = vb.get_with_hints((1, num_heads, out_features), "att_src", att_init)?;
        let att_dst = vb.get_with_hints((1, num_heads, out_features), "att_dst", att_init)?;
        let bias_dim = if concat {
            out_features * num_heads
        } else {
            out_features
        };
        let bias = vb.get_with_hints(bias_dim, "bias", Init::Const(0.))?;

        Ok(Self {
            linear,
            att_src,
            att_dst,
            bias,
            num_heads,
            out_per_head: out_features,
            concat,
            negative_slope: 0.2,
        })
    }

    pub fn out_dim(&self) -> usize {
        if self.concat {
            self.num_heads * self.out_per_head
        } else {
            self.out_per_head
        }
    }

    /// Forward pass with attention.
    ///
    /// `attention_dropout` is applied to the normalized coefficients and
    /// should be 0 outside training.
    pub fn forward(
        &self,
        x: &Tensor,
        edges: &EdgeIndex,
        attention_dropout: f32,
    ) -> Result<Tensor> {
        let n = x.dim(0)?;
        let device = x.device();
        let edges = edges.with_self_loops(n);
        let src = edges.sources(device)?;
        let dst = edges.targets(device)?;

        // (N, heads, out)
        let h = self
            .linear
            .forward(x)?
            .reshape((n, self.num_heads, self.out_per_head))?;

        // (N, heads)
        let alpha_src = h.broadcast_mul(&self.att_src)?.sum(D::Minus1)?;
        let alpha_dst = h.broadcast_mul(&self.att_dst)?.sum(D::Minus1)?;

        // e_ij per edge: (E, heads)
        let scores = (alpha_src.index_select(&src, 0)? + alpha_dst.index_select(&dst, 0)?)?;
        let scores = scores.maximum(&(&scores * self.negative_slope)?)?;

        // Softmax over incoming edges, shifted by each target's own maximum.
        let shift = target_max(&scores, &edges, n)?.index_select(&dst, 0)?;
        let exp = (&scores - shift)?.exp()?;
        let denom = Tensor::zeros((n, self.num_heads), exp.dtype(), device)?
            .index_add(&dst, &exp, 0)?;
        let mut alpha = (exp / denom.index_select(&dst, 0)?)?;
        if attention_dropout > 0.0 {
            alpha = candle_nn::ops::dropout(&alpha, attention_dropout)?;
        }

        // (E, heads, out)
        let messages = h
            .index_select(&src, 0)?
            .broadcast_mul(&alpha.unsqueeze(2)?)?;
        let out = Tensor::zeros((n, self.num_heads, self.out_per_head), h.dtype(), device)?
            .index_add(&dst, &messages, 0)?;

        let out = if self.concat {
            out.reshape((n, self.num_heads * self.out_per_head))?
        } else {
            out.mean(1)?
        };
        Ok(out.broadcast_add(&self.bias)?)
    }
}

/// Per-target, per-head maximum of edge `scores` `(E, heads)`, detached.
///
/// Every target has at least its self-loop, so each row is finite.
fn target_max(scores: &Tensor, edges: &EdgeIndex, num_nodes: usize) -> Result<Tensor> {
    let (_, heads) = scores.dims2()?;
    let values = scores.detach().to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let mut max = vec![f32::NEG_INFINITY; num_nodes * heads];
    for (row, &t) in values.iter().zip(edges.cols()) {
        for (head, &v) in row.iter().enumerate() {
            let slot = &mut max[t as usize * heads + head];
            *slot = slot.max(v);
        }
    }
    for slot in &mut max {
        if !slot.is_finite() {
            *slot = 0.0;
        }
    }
    let max = Tensor::from_vec(max, (num_nodes, heads), scores.device())?;
    Ok(max.to_dtype(scores.dtype())?)
}

/// PPR coefficients `gamma_k = alpha (1 - alpha)^k`, `gamma_K = (1 - alpha)^K`.
pub fn ppr_coefficients(alpha: f64, k: usize) -> Vec<f32> {
    let mut gammas: Vec<f32> = (0..=k)
        .map(|step| (alpha * (1.0 - alpha).powi(step as i32)) as f32)
        .collect();
    gammas[k] = (1.0 - alpha).powi(k as i32) as f32;
    gammas
}

/// Generalized PageRank propagation with learnable hop weights.
///
/// Z = sum_{k=0}^{K} gamma_k * Â^k H
///
/// # Reference
///
/// Chien et al., "Adaptive Universal Generalized PageRank Graph Neural
/// Network", ICLR 2021.
#[derive(Debug, Clone)]
pub struct GprProp {
    temp: Tensor,
    k: usize,
    alpha: f64,
}

impl GprProp {
    /// Create the propagation with `k` hops. `temp` starts at the PPR values
    /// once the owner writes them (see [`GprProp::initial_coefficients`]).
    pub fn new(k: usize, alpha: f64, vb: VarBuilder) -> Result<Self> {
        let temp = vb.get_with_hints(k + 1, "temp", Init::Const(0.))?;
        Ok(Self { temp, k, alpha })
    }

    pub fn initial_coefficients(&self) -> Vec<f32> {
        ppr_coefficients(self.alpha, self.k)
    }

    pub fn forward(&self, x: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        let n = x.dim(0)?;
        let looped = edges.with_self_loops(n);
        let norm = looped.symmetric_norm(n);

        let mut hidden = x.broadcast_mul(&self.temp.narrow(0, 0, 1)?)?;
        let mut h = x.clone();
        for step in 1..=self.k {
            h = propagate(&h, &looped, Some(&norm))?;
            let gamma = self.temp.narrow(0, step, 1)?;
            hidden = (hidden + h.broadcast_mul(&gamma)?)?;
        }
        Ok(hidden)
    }
}

/// GCNII layer with initial residual and identity mapping.
///
/// ```text
/// P   = (1 - alpha) Â H + alpha H0
/// H'  = (1 - beta) P + beta P W,   beta = ln(lamda / l + 1)
/// ```
///
/// # Reference
///
/// Chen et al., "Simple and Deep Graph Convolutional Networks", ICML 2020.
#[derive(Debug, Clone)]
pub struct Gcn2Conv {
    weight: Tensor,
    alpha: f64,
    beta: f64,
}

impl Gcn2Conv {
    /// # Arguments
    /// - `channels`: Width of both `H` and `H0`
    /// - `alpha`: Initial-residual strength
    /// - `lamda`: Identity-mapping strength
    /// - `layer`: 1-based layer index
    pub fn new(
        channels: usize,
        alpha: f64,
        lamda: f64,
        layer: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bound = (6.0 / (2 * channels) as f64).sqrt();
        let weight = vb.get_with_hints(
            (channels, channels),
            "weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let beta = (lamda / layer.max(1) as f64 + 1.0).ln();
        Ok(Self {
            weight,
            alpha,
            beta,
        })
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn forward(&self, x: &Tensor, x0: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        let n = x.dim(0)?;
        let looped = edges.with_self_loops(n);
        let h = gcn_propagate(x, &looped)?;
        let support = ((h * (1.0 - self.alpha))? + (x0 * self.alpha)?)?;
        let mapped = support.matmul(&self.weight)?;
        Ok(((support * (1.0 - self.beta))? + (mapped * self.beta)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn setup() -> (VarMap, Device) {
        (VarMap::new(), Device::Cpu)
    }

    #[test]
    fn test_gcn_forward_shape() {
        let (varmap, device) = setup();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let gcn = GcnConv::new(8, 4, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (5, 8), &device).unwrap();
        let out = gcn.forward(&x, &EdgeIndex::cycle(5)).unwrap();
        assert_eq!(out.dims(), &[5, 4]);
    }

    #[test]
    fn test_gcn_isolated_nodes_stay_finite() {
        let (varmap, device) = setup();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let gcn = GcnConv::new(3, 2, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (4, 3), &device).unwrap();
        let out = gcn.forward(&x, &EdgeIndex::default()).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_sage_forward_shape() {
        let (varmap, device) = setup();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let sage = SageConv::new(8, 6, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (5, 8), &device).unwrap();
        let out = sage.forward(&x, &EdgeIndex::cycle(5)).unwrap();
        assert_eq!(out.dims(), &[5, 6]);
    }

    #[test]
    fn test_gat_concat_and_mean_shapes() {
        let (varmap, device) = setup();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let hidden = GatConv::new(8, 4, 3, true, vb.pp("hidden")).unwrap();
        let output = GatConv::new(12, 2, 1, false, vb.pp("out")).unwrap();

        let x = Tensor::randn(0f32, 1f32, (5, 8), &device).unwrap();
        let h = hidden.forward(&x, &EdgeIndex::cycle(5), 0.0).unwrap();
        assert_eq!(h.dims(), &[5, 12]);
        assert_eq!(hidden.out_dim(), 12);

        let out = output.forward(&h, &EdgeIndex::cycle(5), 0.0).unwrap();
        assert_eq!(out.dims(), &[5, 2]);
    }

    #[test]
    fn test_gat_attention_on_self_loop_only() {
        // With no edges every node only attends to itself, alpha = 1.
        let (varmap, device) = setup();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let gat = GatConv::new(3, 3, 1, true, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (4, 3), &device).unwrap();
        let out = gat.forward(&x, &EdgeIndex::default(), 0.0).unwrap();
        let expected = gat.linear.forward(&x).unwrap();
        let diff = (out - expected)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_gat_softmax_per_component_scale() {
        // Two components whose scores differ by far more than exp can span.
        let (varmap, device) = setup();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let gat = GatConv::new(3, 3, 1, true, vb).unwrap();

        let x = Tensor::new(
            &[
                [200f32, 200., 200.],
                [200., 200., 200.],
                [-200., -200., -200.],
                [-200., -200., -200.],
            ],
            &device,
        )
        .unwrap();
        let edges = EdgeIndex::from_pairs(&[(0, 1), (1, 0), (2, 3), (3, 2)]);
        let out = gat.forward(&x, &edges, 0.0).unwrap().to_vec2::<f32>().unwrap();
        // Identical rows per component, so attention averages equal messages.
        let expected = gat.linear.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        for (row, want) in out.iter().zip(&expected) {
            for (&o, &w) in row.iter().zip(want) {
                assert!(o.is_finite());
                assert!((o - w).abs() <= 1e-4 * w.abs().max(1.0), "{o} vs {w}");
            }
        }
    }

    #[test]
    fn test_ppr_coefficients() {
        let gammas = ppr_coefficients(0.1, 3);
        assert_eq!(gammas.len(), 4);
        assert_relative_eq!(gammas[0], 0.1, epsilon = 1e-6);
        assert_relative_eq!(gammas[1], 0.09, epsilon = 1e-6);
        assert_relative_eq!(gammas[3], 0.729, epsilon = 1e-6);
    }

    #[test]
    fn test_gpr_forward_shape() {
        let (varmap, device) = setup();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let prop = GprProp::new(4, 0.1, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (5, 3), &device).unwrap();
        let out = prop.forward(&x, &EdgeIndex::cycle(5)).unwrap();
        assert_eq!(out.dims(), &[5, 3]);
    }

    #[test]
    fn test_gcn2_beta_decays_with_depth() {
        let (varmap, device) = setup();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let first = Gcn2Conv::new(4, 0.1, 1.0, 1, vb.pp("c1")).unwrap();
        let fourth = Gcn2Conv::new(4, 0.1, 1.0, 4, vb.pp("c4")).unwrap();
        assert_relative_eq!(first.beta(), 2f64.ln(), epsilon = 1e-12);
        assert!(fourth.beta() < first.beta());

        let x = Tensor::randn(0f32, 1f32, (5, 4), &device).unwrap();
        let out = first.forward(&x, &x, &EdgeIndex::cycle(5)).unwrap();
        assert_eq!(out.dims(), &[5, 4]);
    }
}
