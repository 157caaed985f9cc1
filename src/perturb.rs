//! Gradient-guided structure and feature perturbation.
//!
//! Given the gradient of the environment-contrastive loss with respect to a
//! probe (the continuous adjacency or the feature matrix), perturbation:
//!
//! 1. clamps the gradient to `[0, 1]`,
//! 2. applies a softmax down each column,
//! 3. for every row `a`, draws `num_sample` distinct column indices `b`
//!    with probability proportional to `P[a, b]`.
//!
//! In adjacency mode each draw marks the edge `b -> a`; the new adjacency is
//! the original one plus every marked edge that was not already present. In
//! feature mode each draw zeroes feature `b` of node `a`.

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax;
use rand::rngs::StdRng;
use rand::seq::index::sample_weighted;
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::EdgeIndex;

/// `softmax(clamp(grad, 0, 1), dim = 0)` as row-major nested vectors.
pub fn column_probabilities(grad: &Tensor) -> Result<Vec<Vec<f32>>> {
    let clamped = grad.detach().to_dtype(DType::F32)?.clamp(0f32, 1f32)?;
    Ok(softmax(&clamped, 0)?.to_vec2::<f32>()?)
}

/// Draw `num_sample` distinct column indices from every row of `probs`.
///
/// # Errors
///
/// `Sampling` if a row has fewer than `num_sample` columns or its weights
/// are invalid.
pub fn sample_per_row(
    probs: &[Vec<f32>],
    num_sample: usize,
    rng: &mut StdRng,
) -> Result<Vec<Vec<usize>>> {
    probs
        .iter()
        .enumerate()
        .map(|(row, weights)| {
            if num_sample > weights.len() {
                return Err(Error::Sampling(format!(
                    "cannot draw {num_sample} distinct columns from a row of {}",
                    weights.len()
                )));
            }
            let picked = sample_weighted(rng, weights.len(), |i| weights[i], num_sample)
                .map_err(|e| Error::Sampling(format!("row {row}: {e}")))?;
            Ok(picked.into_vec())
        })
        .collect()
}

/// Original adjacency plus the sampled flips over its complement.
///
/// `samples[a]` holds the sampled sources `b` for target `a`; each marks
/// `M[b, a] = 1`. The result is `A ∪ (M ∧ ¬A)` in row-major edge order, so
/// every original edge is kept.
pub fn flip_edges(original: &EdgeIndex, num_nodes: usize, samples: &[Vec<usize>]) -> Result<EdgeIndex> {
    original.validate(num_nodes)?;
    let mut dense = original.dense_mask(num_nodes);
    let mut added = 0usize;
    for (a, sources) in samples.iter().enumerate() {
        for &b in sources {
            if a >= num_nodes || b >= num_nodes {
                return Err(Error::NodeOutOfRange {
                    node: a.max(b),
                    num_nodes,
                });
            }
            let slot = &mut dense[b * num_nodes + a];
            if !*slot {
                *slot = true;
                added += 1;
            }
        }
    }
    debug!(added, original = original.len(), "flipped complement edges");
    EdgeIndex::from_dense_mask(num_nodes, &dense)
}

/// `x` with `x[a, b] = 0` for every sampled `b` in `samples[a]`, detached.
pub fn mask_features(x: &Tensor, samples: &[Vec<usize>]) -> Result<Tensor> {
    let (n, d) = x.dims2()?;
    if samples.len() != n {
        return Err(Error::DimensionMismatch {
            expected: n,
            got: samples.len(),
        });
    }
    let mut mask = vec![1f32; n * d];
    for (a, dims) in samples.iter().enumerate() {
        for &b in dims {
            if b >= d {
                return Err(Error::DimensionMismatch { expected: d, got: b });
            }
            mask[a * d + b] = 0.0;
        }
    }
    let mask = Tensor::from_vec(mask, (n, d), x.device())?.to_dtype(x.dtype())?;
    Ok((x.detach() * mask)?)
}

/// Result of perturbing one environment.
#[derive(Debug, Clone)]
pub enum EnvPerturbation {
    /// `env_adj[i]` was replaced by `edges`.
    Adjacency { env: usize, loss: f32, edges: EdgeIndex },
    /// A masked copy of the features; nothing was persisted.
    Features { env: usize, loss: f32, features: Tensor },
}

impl EnvPerturbation {
    pub fn env(&self) -> usize {
        match self {
            Self::Adjacency { env, .. } | Self::Features { env, .. } => *env,
        }
    }

    /// Contrastive loss value before the perturbation.
    pub fn loss(&self) -> f32 {
        match self {
            Self::Adjacency { loss, .. } | Self::Features { loss, .. } => *loss,
        }
    }
}

/// Everything step 6 produced, one entry per environment.
#[derive(Debug, Clone, Default)]
pub struct PerturbationOutcome {
    pub environments: Vec<EnvPerturbation>,
}

impl PerturbationOutcome {
    /// Mean contrastive loss across environments.
    pub fn mean_loss(&self) -> f32 {
        if self.environments.is_empty() {
            return 0.0;
        }
        let total: f32 = self.environments.iter().map(EnvPerturbation::loss).sum();
        total / self.environments.len() as f32
    }

    /// Perturbed feature matrices, in environment order (feature mode only).
    pub fn perturbed_features(&self) -> Vec<&Tensor> {
        self.environments
            .iter()
            .filter_map(|p| match p {
                EnvPerturbation::Features { features, .. } => Some(features),
                EnvPerturbation::Adjacency { .. } => None,
            })
            .collect()
    }
}
