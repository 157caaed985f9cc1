//! Prediction and representation heads on top of node embeddings.

use candle_core::Tensor;
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};
use rand::rngs::StdRng;

use crate::encoder::{EncoderDims, GcnEncoder, GraphEncoder};
use crate::error::Result;
use crate::graph::EdgeIndex;
use crate::params::{Init, ParamGroup};

/// Weights `U(0, 1)`, biases `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, LayerNorm
/// affine back to `(1, 0)`.
fn head_init(name: &str, dims: &[usize], fan_in: impl Fn(&str) -> usize) -> Init {
    let is_norm = name.starts_with("norm.");
    match (name.rsplit('.').next(), is_norm) {
        (Some("weight"), true) => Init::Const(1.0),
        (Some("bias"), true) => Init::Const(0.0),
        (Some("weight"), false) if dims.len() == 2 => Init::Uniform { lo: 0.0, hi: 1.0 },
        _ => Init::fan_in_bias(fan_in(name)),
    }
}

// ============================================================================
// NODE CLASSIFIER
// ============================================================================

/// Two-layer MLP with LayerNorm on the logits.
///
/// `linear(h -> h) -> ReLU -> linear(h -> c) -> LayerNorm(c)`
#[derive(Debug, Clone)]
pub struct NodeClassifier {
    lin1: Linear,
    lin2: Linear,
    norm: LayerNorm,
    in_dim: usize,
    hidden_dim: usize,
    params: ParamGroup,
}

impl NodeClassifier {
    pub fn new(
        in_dim: usize,
        hidden_dim: usize,
        num_classes: usize,
        vb: VarBuilder,
        params: ParamGroup,
    ) -> Result<Self> {
        Ok(Self {
            lin1: linear(in_dim, hidden_dim, vb.pp("lin1"))?,
            lin2: linear(hidden_dim, num_classes, vb.pp("lin2"))?,
            norm: layer_norm(num_classes, 1e-5, vb.pp("norm"))?,
            in_dim,
            hidden_dim,
            params,
        })
    }

    /// Logits `(n, c)` for embeddings `(n, h)`.
    pub fn classify(&self, embedding: &Tensor) -> Result<Tensor> {
        let h = self.lin1.forward(embedding)?.relu()?;
        let logits = self.lin2.forward(&h)?;
        Ok(self.norm.forward(&logits)?)
    }

    pub fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        let (in_dim, hidden_dim) = (self.in_dim, self.hidden_dim);
        self.params.reset_with(rng, |name, dims| {
            head_init(name, dims, |n| if n.starts_with("lin1") { in_dim } else { hidden_dim })
        })
    }

    /// Tie this head to `other`: copy every tensor in place.
    pub fn copy_from(&self, other: &NodeClassifier) -> Result<()> {
        self.params.copy_from(&other.params)
    }

    pub fn params(&self) -> &ParamGroup {
        &self.params
    }
}

// ============================================================================
// FEATURE LEARNER
// ============================================================================

/// Two-layer GCN followed by `tanh`.
///
/// Used for both the irrelevant (environment-specific) and the relevant
/// representation; the two differ only in what their losses push them toward.
#[derive(Debug, Clone)]
pub struct FeatureLearner {
    gcn: GcnEncoder,
}

impl FeatureLearner {
    pub fn new(in_dim: usize, hidden_dim: usize, vb: VarBuilder, params: ParamGroup) -> Result<Self> {
        let dims = EncoderDims {
            in_channels: in_dim,
            hidden_channels: hidden_dim,
            out_channels: hidden_dim,
            num_layers: 2,
            dropout: 0.0,
        };
        Ok(Self {
            gcn: GcnEncoder::new(dims, false, vb, params)?,
        })
    }

    /// Embeddings in `(-1, 1)`, shape `(n, h)`.
    pub fn learn(&self, features: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        Ok(self.gcn.forward_t(features, edges, false)?.tanh()?)
    }

    pub fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        self.gcn.reset_parameters(rng)
    }
}

// ============================================================================
// DECODER
// ============================================================================

/// Two-layer GCN plus LayerNorm, reconstructing `d` input features.
#[derive(Debug, Clone)]
pub struct Decoder {
    gcn: GcnEncoder,
    norm: LayerNorm,
    params: ParamGroup,
}

impl Decoder {
    pub fn new(
        in_dim: usize,
        hidden_dim: usize,
        out_dim: usize,
        vb: VarBuilder,
        params: ParamGroup,
    ) -> Result<Self> {
        let dims = EncoderDims {
            in_channels: in_dim,
            hidden_channels: hidden_dim,
            out_channels: out_dim,
            num_layers: 2,
            dropout: 0.0,
        };
        Ok(Self {
            gcn: GcnEncoder::new(dims, false, vb.pp("gcn"), params.clone())?,
            norm: layer_norm(out_dim, 1e-5, vb.pp("norm"))?,
            params,
        })
    }

    /// Reconstruct features `(n, d)` from concatenated embeddings.
    pub fn decode(&self, embedding: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        let h = self.gcn.forward_t(embedding, edges, false)?;
        Ok(self.norm.forward(&h)?)
    }

    pub fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        // the group covers the GCN and the norm
        self.params.reset_with(rng, crate::params::default_init)
    }
}

// ============================================================================
// ENVIRONMENT CLASSIFIER
// ============================================================================

/// Soft assignment of nodes to `e` environments.
///
/// `linear -> ReLU -> linear -> ReLU`. The output is non-negative but not
/// normalized to a simplex; it is used directly as a gate.
#[derive(Debug, Clone)]
pub struct EnvironmentClassifier {
    lin1: Linear,
    lin2: Linear,
    in_dim: usize,
    hidden_dim: usize,
    params: ParamGroup,
}

impl EnvironmentClassifier {
    pub fn new(
        in_dim: usize,
        hidden_dim: usize,
        num_envs: usize,
        vb: VarBuilder,
        params: ParamGroup,
    ) -> Result<Self> {
        Ok(Self {
            lin1: linear(in_dim, hidden_dim, vb.pp("lin1"))?,
            lin2: linear(hidden_dim, num_envs, vb.pp("lin2"))?,
            in_dim,
            hidden_dim,
            params,
        })
    }

    /// Environment scores `(n, e)`.
    pub fn partition(&self, embedding: &Tensor) -> Result<Tensor> {
        let h = self.lin1.forward(embedding)?.relu()?;
        Ok(self.lin2.forward(&h)?.relu()?)
    }

    pub fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        let (in_dim, hidden_dim) = (self.in_dim, self.hidden_dim);
        self.params.reset_with(rng, |name, dims| {
            head_init(name, dims, |n| if n.starts_with("lin1") { in_dim } else { hidden_dim })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::SeedableRng;

    fn vb(varmap: &VarMap) -> VarBuilder<'static> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_classifier_shape() {
        let varmap = VarMap::new();
        let head = NodeClassifier::new(6, 6, 3, vb(&varmap).pp("head"), ParamGroup::new(&varmap, "head"))
            .unwrap();
        let x = Tensor::randn(0f32, 1f32, (5, 6), &Device::Cpu).unwrap();
        assert_eq!(head.classify(&x).unwrap().dims(), &[5, 3]);
    }

    #[test]
    fn test_classifier_reset_uniform_weights() {
        let varmap = VarMap::new();
        let head = NodeClassifier::new(4, 4, 2, vb(&varmap).pp("head"), ParamGroup::new(&varmap, "head"))
            .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        head.reset_parameters(&mut rng).unwrap();

        let w = head.lin1.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(w.iter().all(|&v| (0.0..1.0).contains(&v)));

        let b = head.lin1.bias().unwrap().to_vec1::<f32>().unwrap();
        assert!(b.iter().all(|&v| v.abs() <= 0.5));

        let gamma = head.norm.weight().to_vec1::<f32>().unwrap();
        assert!(gamma.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_copy_from_makes_heads_agree() {
        let varmap = VarMap::new();
        let a = NodeClassifier::new(4, 4, 2, vb(&varmap).pp("a"), ParamGroup::new(&varmap, "a")).unwrap();
        let b = NodeClassifier::new(4, 4, 2, vb(&varmap).pp("b"), ParamGroup::new(&varmap, "b")).unwrap();
        b.copy_from(&a).unwrap();

        let x = Tensor::randn(0f32, 1f32, (3, 4), &Device::Cpu).unwrap();
        assert_eq!(
            a.classify(&x).unwrap().to_vec2::<f32>().unwrap(),
            b.classify(&x).unwrap().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_feature_learner_is_bounded() {
        let varmap = VarMap::new();
        let learner =
            FeatureLearner::new(5, 8, vb(&varmap).pp("irr"), ParamGroup::new(&varmap, "irr")).unwrap();
        let x = (Tensor::randn(0f32, 1f32, (4, 5), &Device::Cpu).unwrap() * 100.0).unwrap();
        let out = learner.learn(&x, &EdgeIndex::cycle(4)).unwrap();
        assert_eq!(out.dims(), &[4, 8]);
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_decoder_shape() {
        let varmap = VarMap::new();
        let decoder =
            Decoder::new(16, 8, 5, vb(&varmap).pp("dec"), ParamGroup::new(&varmap, "dec")).unwrap();
        let z = Tensor::randn(0f32, 1f32, (4, 16), &Device::Cpu).unwrap();
        assert_eq!(decoder.decode(&z, &EdgeIndex::cycle(4)).unwrap().dims(), &[4, 5]);
    }

    #[test]
    fn test_environment_partition_nonnegative() {
        let varmap = VarMap::new();
        let env = EnvironmentClassifier::new(6, 6, 3, vb(&varmap).pp("env"), ParamGroup::new(&varmap, "env"))
            .unwrap();
        let x = Tensor::randn(0f32, 1f32, (5, 6), &Device::Cpu).unwrap();
        let p = env.partition(&x).unwrap();
        assert_eq!(p.dims(), &[5, 3]);
        let values = p.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| v >= 0.0));
    }
}
