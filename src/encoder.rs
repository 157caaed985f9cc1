//! Multi-layer graph encoders behind one trait.
//!
//! The backbone is one of a closed set of architectures, chosen by
//! [`EncoderKind`]. [`Encoder`] dispatches to the concrete stack; callers only
//! see [`GraphEncoder`].

use candle_core::Tensor;
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};
use rand::rngs::StdRng;

use crate::config::{EncoderKind, InvarianceConfig};
use crate::conv::{GatConv, Gcn2Conv, GcnConv, GprProp, SageConv};
use crate::error::Result;
use crate::graph::EdgeIndex;
use crate::params::{default_init, Init, ParamGroup};

/// A node encoder: features plus structure in, `n x out_dim` embeddings out.
pub trait GraphEncoder {
    /// Encode nodes. Dropout is active only when `train` is set.
    fn forward_t(&self, x: &Tensor, edges: &EdgeIndex, train: bool) -> Result<Tensor>;

    /// Re-initialize every learnable tensor in place.
    fn reset_parameters(&self, rng: &mut StdRng) -> Result<()>;

    fn out_dim(&self) -> usize;
}

/// Layer widths shared by every encoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderDims {
    pub in_channels: usize,
    pub hidden_channels: usize,
    pub out_channels: usize,
    pub num_layers: usize,
    pub dropout: f32,
}

impl EncoderDims {
    fn layer_dims(&self) -> Vec<(usize, usize)> {
        let layers = self.num_layers.max(1);
        (0..layers)
            .map(|i| {
                let input = if i == 0 {
                    self.in_channels
                } else {
                    self.hidden_channels
                };
                let output = if i + 1 == layers {
                    self.out_channels
                } else {
                    self.hidden_channels
                };
                (input, output)
            })
            .collect()
    }
}

fn dropout_t(x: Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        Ok(candle_nn::ops::dropout(&x, p)?)
    } else {
        Ok(x)
    }
}

// ============================================================================
// GCN
// ============================================================================

/// Stacked [`GcnConv`] with optional LayerNorm between layers.
#[derive(Debug, Clone)]
pub struct GcnEncoder {
    convs: Vec<GcnConv>,
    norms: Vec<LayerNorm>,
    dims: EncoderDims,
    params: ParamGroup,
}

impl GcnEncoder {
    pub fn new(dims: EncoderDims, use_norm: bool, vb: VarBuilder, params: ParamGroup) -> Result<Self> {
        let layer_dims = dims.layer_dims();
        let mut convs = Vec::with_capacity(layer_dims.len());
        let mut norms = Vec::new();
        for (i, (input, output)) in layer_dims.iter().enumerate() {
            convs.push(GcnConv::new(*input, *output, vb.pp(format!("convs.{i}")))?);
            if use_norm && i + 1 < layer_dims.len() {
                norms.push(layer_norm(*output, 1e-5, vb.pp(format!("norms.{i}")))?);
            }
        }
        Ok(Self {
            convs,
            norms,
            dims,
            params,
        })
    }
}

impl GraphEncoder for GcnEncoder {
    fn forward_t(&self, x: &Tensor, edges: &EdgeIndex, train: bool) -> Result<Tensor> {
        let last = self.convs.len() - 1;
        let mut h = x.clone();
        for (i, conv) in self.convs.iter().enumerate() {
            h = conv.forward(&h, edges)?;
            if i < last {
                if let Some(norm) = self.norms.get(i) {
                    h = norm.forward(&h)?;
                }
                h = dropout_t(h.relu()?, self.dims.dropout, train)?;
            }
        }
        Ok(h)
    }

    fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        self.params.reset_with(rng, default_init)
    }

    fn out_dim(&self) -> usize {
        self.dims.out_channels
    }
}

// ============================================================================
// SAGE
// ============================================================================

/// Stacked [`SageConv`] with mean aggregation.
#[derive(Debug, Clone)]
pub struct SageEncoder {
    convs: Vec<SageConv>,
    dims: EncoderDims,
    params: ParamGroup,
}

impl SageEncoder {
    pub fn new(dims: EncoderDims, vb: VarBuilder, params: ParamGroup) -> Result<Self> {
        let convs = dims
            .layer_dims()
            .into_iter()
            .enumerate()
            .map(|(i, (input, output))| SageConv::new(input, output, vb.pp(format!("convs.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            convs,
            dims,
            params,
        })
    }
}

impl GraphEncoder for SageEncoder {
    fn forward_t(&self, x: &Tensor, edges: &EdgeIndex, train: bool) -> Result<Tensor> {
        let last = self.convs.len() - 1;
        let mut h = x.clone();
        for (i, conv) in self.convs.iter().enumerate() {
            h = conv.forward(&h, edges)?;
            if i < last {
                h = dropout_t(h.relu()?, self.dims.dropout, train)?;
            }
        }
        Ok(h)
    }

    fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        self.params.reset_with(rng, default_init)
    }

    fn out_dim(&self) -> usize {
        self.dims.out_channels
    }
}

// ============================================================================
// GAT
// ============================================================================

/// Hidden layers concatenate `heads` attention heads; the output layer has one.
#[derive(Debug, Clone)]
pub struct GatEncoder {
    convs: Vec<GatConv>,
    dims: EncoderDims,
    params: ParamGroup,
}

impl GatEncoder {
    pub fn new(dims: EncoderDims, heads: usize, vb: VarBuilder, params: ParamGroup) -> Result<Self> {
        let layers = dims.num_layers.max(1);
        let mut convs = Vec::with_capacity(layers);
        let mut input = dims.in_channels;
        for i in 0..layers {
            let vb = vb.pp(format!("convs.{i}"));
            let conv = if i + 1 == layers {
                GatConv::new(input, dims.out_channels, 1, false, vb)?
            } else {
                GatConv::new(input, dims.hidden_channels, heads, true, vb)?
            };
            input = conv.out_dim();
            convs.push(conv);
        }
        Ok(Self {
            convs,
            dims,
            params,
        })
    }
}

impl GraphEncoder for GatEncoder {
    fn forward_t(&self, x: &Tensor, edges: &EdgeIndex, train: bool) -> Result<Tensor> {
        let last = self.convs.len() - 1;
        let attention_dropout = if train { self.dims.dropout } else { 0.0 };
        let mut h = x.clone();
        for (i, conv) in self.convs.iter().enumerate() {
            h = dropout_t(h, self.dims.dropout, train)?;
            h = conv.forward(&h, edges, attention_dropout)?;
            if i < last {
                h = h.elu(1.0)?;
            }
        }
        Ok(h)
    }

    fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        self.params.reset_with(rng, default_init)
    }

    fn out_dim(&self) -> usize {
        self.dims.out_channels
    }
}

// ============================================================================
// GPR-GNN
// ============================================================================

/// Two-layer MLP followed by [`GprProp`].
#[derive(Debug, Clone)]
pub struct GprEncoder {
    lin1: Linear,
    lin2: Linear,
    prop: GprProp,
    dims: EncoderDims,
    params: ParamGroup,
}

impl GprEncoder {
    pub fn new(
        dims: EncoderDims,
        alpha: f64,
        k: usize,
        vb: VarBuilder,
        params: ParamGroup,
    ) -> Result<Self> {
        let lin1 = linear(dims.in_channels, dims.hidden_channels, vb.pp("lin1"))?;
        let lin2 = linear(dims.hidden_channels, dims.out_channels, vb.pp("lin2"))?;
        let prop = GprProp::new(k, alpha, vb.pp("prop"))?;
        let encoder = Self {
            lin1,
            lin2,
            prop,
            dims,
            params,
        };
        let gammas = encoder.prop.initial_coefficients();
        let temp = Tensor::from_vec(gammas, k + 1, vb.device())?;
        encoder.params.set("prop.temp", &temp)?;
        Ok(encoder)
    }
}

impl GraphEncoder for GprEncoder {
    fn forward_t(&self, x: &Tensor, edges: &EdgeIndex, train: bool) -> Result<Tensor> {
        let h = dropout_t(x.clone(), self.dims.dropout, train)?;
        let h = self.lin1.forward(&h)?.relu()?;
        let h = dropout_t(h, self.dims.dropout, train)?;
        let h = self.lin2.forward(&h)?;
        self.prop.forward(&h, edges)
    }

    fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        let gammas = self.prop.initial_coefficients();
        self.params.reset_with(rng, |name, dims| {
            if name == "prop.temp" {
                Init::Values(gammas.clone())
            } else {
                default_init(name, dims)
            }
        })
    }

    fn out_dim(&self) -> usize {
        self.dims.out_channels
    }
}

// ============================================================================
// GCNII
// ============================================================================

/// Input projection, `num_layers` [`Gcn2Conv`] blocks, output projection.
#[derive(Debug, Clone)]
pub struct Gcn2Encoder {
    input: Linear,
    convs: Vec<Gcn2Conv>,
    output: Linear,
    dims: EncoderDims,
    params: ParamGroup,
}

impl Gcn2Encoder {
    pub fn new(
        dims: EncoderDims,
        alpha: f64,
        lamda: f64,
        vb: VarBuilder,
        params: ParamGroup,
    ) -> Result<Self> {
        let input = linear(dims.in_channels, dims.hidden_channels, vb.pp("lins.0"))?;
        let convs = (1..=dims.num_layers.max(1))
            .map(|layer| {
                Gcn2Conv::new(
                    dims.hidden_channels,
                    alpha,
                    lamda,
                    layer,
                    vb.pp(format!("convs.{}", layer - 1)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let output = linear(dims.hidden_channels, dims.out_channels, vb.pp("lins.1"))?;
        Ok(Self {
            input,
            convs,
            output,
            dims,
            params,
        })
    }
}

impl GraphEncoder for Gcn2Encoder {
    fn forward_t(&self, x: &Tensor, edges: &EdgeIndex, train: bool) -> Result<Tensor> {
        let p = self.dims.dropout;
        let h = dropout_t(x.clone(), p, train)?;
        let x0 = self.input.forward(&h)?.relu()?;
        let mut h = x0.clone();
        for conv in &self.convs {
            h = dropout_t(h, p, train)?;
            h = conv.forward(&h, &x0, edges)?.relu()?;
        }
        let h = dropout_t(h, p, train)?;
        Ok(self.output.forward(&h)?)
    }

    fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        self.params.reset_with(rng, default_init)
    }

    fn out_dim(&self) -> usize {
        self.dims.out_channels
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

/// The configured backbone.
#[derive(Debug, Clone)]
pub enum Encoder {
    Gcn(GcnEncoder),
    Sage(SageEncoder),
    Gat(GatEncoder),
    Gpr(GprEncoder),
    Gcnii(Gcn2Encoder),
}

impl Encoder {
    /// Build the encoder selected by `config.encoder`, mapping
    /// `in_channels` features to `config.hidden_channels`.
    ///
    /// `prefix` must be the path `vb` was pushed to; it names the
    /// parameter group used by [`GraphEncoder::reset_parameters`].
    pub fn from_config(
        config: &InvarianceConfig,
        in_channels: usize,
        vb: VarBuilder,
        params: ParamGroup,
    ) -> Result<Self> {
        let dims = EncoderDims {
            in_channels,
            hidden_channels: config.hidden_channels,
            out_channels: config.hidden_channels,
            num_layers: config.num_layers,
            dropout: config.dropout as f32,
        };
        Ok(match config.encoder {
            EncoderKind::Gcn => Encoder::Gcn(GcnEncoder::new(dims, config.use_norm, vb, params)?),
            EncoderKind::Sage => Encoder::Sage(SageEncoder::new(dims, vb, params)?),
            EncoderKind::Gat => Encoder::Gat(GatEncoder::new(dims, config.gat_heads, vb, params)?),
            EncoderKind::Gpr => Encoder::Gpr(GprEncoder::new(
                dims,
                config.gpr_alpha,
                config.gpr_k,
                vb,
                params,
            )?),
            EncoderKind::Gcnii => Encoder::Gcnii(Gcn2Encoder::new(
                dims,
                config.gcnii_alpha,
                config.gcnii_lamda,
                vb,
                params,
            )?),
        })
    }

    pub fn kind(&self) -> EncoderKind {
        match self {
            Encoder::Gcn(_) => EncoderKind::Gcn,
            Encoder::Sage(_) => EncoderKind::Sage,
            Encoder::Gat(_) => EncoderKind::Gat,
            Encoder::Gpr(_) => EncoderKind::Gpr,
            Encoder::Gcnii(_) => EncoderKind::Gcnii,
        }
    }

    fn inner(&self) -> &dyn GraphEncoder {
        match self {
            Encoder::Gcn(e) => e,
            Encoder::Sage(e) => e,
            Encoder::Gat(e) => e,
            Encoder::Gpr(e) => e,
            Encoder::Gcnii(e) => e,
        }
    }
}

impl GraphEncoder for Encoder {
    fn forward_t(&self, x: &Tensor, edges: &EdgeIndex, train: bool) -> Result<Tensor> {
        self.inner().forward_t(x, edges, train)
    }

    fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        self.inner().reset_parameters(rng)
    }

    fn out_dim(&self) -> usize {
        self.inner().out_dim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::SeedableRng;

    fn build(kind: EncoderKind) -> (Encoder, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = InvarianceConfig::default()
            .with_encoder(kind)
            .with_hidden_channels(8);
        let params = ParamGroup::new(&varmap, "encoder");
        let encoder = Encoder::from_config(&config, 5, vb.pp("encoder"), params).unwrap();
        (encoder, varmap)
    }

    #[test]
    fn test_every_encoder_forward_shape() {
        let x = Tensor::randn(0f32, 1f32, (6, 5), &Device::Cpu).unwrap();
        let edges = EdgeIndex::cycle(6);
        for kind in [
            EncoderKind::Gcn,
            EncoderKind::Sage,
            EncoderKind::Gat,
            EncoderKind::Gpr,
            EncoderKind::Gcnii,
        ] {
            let (encoder, _) = build(kind);
            assert_eq!(encoder.kind(), kind);
            let out = encoder.forward_t(&x, &edges, false).unwrap();
            assert_eq!(out.dims(), &[6, 8], "{kind}");
            assert_eq!(encoder.out_dim(), 8);
        }
    }

    #[test]
    fn test_eval_forward_is_deterministic() {
        let (encoder, _) = build(EncoderKind::Gcn);
        let x = Tensor::randn(0f32, 1f32, (4, 5), &Device::Cpu).unwrap();
        let a = encoder.forward_t(&x, &EdgeIndex::cycle(4), false).unwrap();
        let b = encoder.forward_t(&x, &EdgeIndex::cycle(4), false).unwrap();
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_gpr_reset_restores_ppr() {
        let (encoder, varmap) = build(EncoderKind::Gpr);
        let group = ParamGroup::new(&varmap, "encoder");
        group
            .set("prop.temp", &Tensor::zeros(11, DType::F32, &Device::Cpu).unwrap())
            .unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        encoder.reset_parameters(&mut rng).unwrap();

        let temp = group
            .vars()
            .unwrap()
            .into_iter()
            .find(|(name, _)| name == "prop.temp")
            .map(|(_, v)| v.as_tensor().to_vec1::<f32>().unwrap())
            .unwrap();
        assert!((temp[0] - 0.1).abs() < 1e-6);
    }
}
