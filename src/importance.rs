//! Permutation-free feature importance.
//!
//! A column's importance is how much the supervised loss rises when that
//! column is zeroed on every node. Two importance vectors (say, train and
//! test) can then be compared by the overlap of their top-k columns, and a
//! vector can be checked for how much of its top-k falls in the trailing
//! (typically spurious) columns.

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::baseline::Baseline;
use crate::error::{Error, Result};
use crate::graph::{EdgeIndex, GraphData};
use crate::loss::LossCriterion;
use crate::model::InvarianceModel;

/// A model that can score arbitrary features against labels.
pub trait ImportanceModel {
    fn importance_loss(
        &self,
        x: &Tensor,
        y: &Tensor,
        edges: &EdgeIndex,
        graph: &GraphData,
        criterion: LossCriterion,
    ) -> Result<Tensor>;
}

impl ImportanceModel for InvarianceModel {
    fn importance_loss(
        &self,
        x: &Tensor,
        y: &Tensor,
        edges: &EdgeIndex,
        graph: &GraphData,
        criterion: LossCriterion,
    ) -> Result<Tensor> {
        InvarianceModel::importance_loss(self, x, y, edges, graph, criterion)
    }
}

impl ImportanceModel for Baseline {
    fn importance_loss(
        &self,
        x: &Tensor,
        y: &Tensor,
        edges: &EdgeIndex,
        graph: &GraphData,
        criterion: LossCriterion,
    ) -> Result<Tensor> {
        Baseline::importance_loss(self, x, y, edges, graph, criterion)
    }
}

/// Loss increase per feature column when that column is zeroed.
pub fn column_importance<M: ImportanceModel + ?Sized>(
    model: &M,
    graph: &GraphData,
    criterion: LossCriterion,
) -> Result<Vec<f32>> {
    let x = graph.features.detach();
    let (_, d) = x.dims2()?;
    let base = model
        .importance_loss(&x, &graph.labels, &graph.edges, graph, criterion)?
        .to_scalar::<f32>()?;

    let mut importance = Vec::with_capacity(d);
    for col in 0..d {
        let mut keep = vec![1f32; d];
        keep[col] = 0.0;
        let keep = Tensor::from_vec(keep, (1, d), x.device())?.to_dtype(DType::F32)?;
        let zeroed = x.broadcast_mul(&keep)?;
        let loss = model
            .importance_loss(&zeroed, &graph.labels, &graph.edges, graph, criterion)?
            .to_scalar::<f32>()?;
        importance.push(loss - base);
    }
    debug!(columns = d, base, "computed column importance");
    Ok(importance)
}

/// Min-max scale to `[0, 1]`. A constant vector maps to zeros.
pub fn normalize_importance(values: &[f32]) -> Vec<f32> {
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|&v| (v - min) / range).collect()
}

/// Indices of the `k` largest values, largest first.
pub fn top_k_indices(values: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    order.truncate(k);
    order
}

/// Fraction of `a`'s top-k columns that are also in `b`'s top-k.
///
/// # Errors
///
/// `DimensionMismatch` if the vectors differ in length; `Config` if `k` is 0.
pub fn top_k_overlap(a: &[f32], b: &[f32], k: usize) -> Result<f32> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }
    if k == 0 {
        return Err(Error::Config("top-k overlap needs k > 0".to_string()));
    }
    let top_a = top_k_indices(a, k);
    let top_b = top_k_indices(b, k);
    let shared = top_a.iter().filter(|i| top_b.contains(i)).count();
    Ok(shared as f32 / k as f32)
}

/// Fraction of the last `trailing` columns that rank in the top-k.
pub fn trailing_share(values: &[f32], k: usize, trailing: usize) -> f32 {
    let trailing = trailing.min(values.len());
    if trailing == 0 {
        return 0.0;
    }
    let first = values.len() - trailing;
    let hits = top_k_indices(values, k).iter().filter(|&&i| i >= first).count();
    hits as f32 / trailing as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalize_bounds() {
        let n = normalize_importance(&[2.0, -1.0, 5.0]);
        assert_eq!(n, vec![0.5, 0.0, 1.0]);
        assert_eq!(normalize_importance(&[3.0, 3.0]), vec![0.0, 0.0]);
        assert!(normalize_importance(&[]).is_empty());
    }

    #[test]
    fn test_top_k_order() {
        assert_eq!(top_k_indices(&[0.1, 0.9, 0.5, 0.9], 3), vec![1, 3, 2]);
        assert_eq!(top_k_indices(&[1.0], 5), vec![0]);
    }

    #[test]
    fn test_overlap() {
        let a = [0.9, 0.8, 0.1, 0.0];
        let b = [0.9, 0.0, 0.8, 0.1];
        assert_relative_eq!(top_k_overlap(&a, &b, 2).unwrap(), 0.5);
        assert_relative_eq!(top_k_overlap(&a, &a, 3).unwrap(), 1.0);
        assert!(top_k_overlap(&a, &b[..3], 2).is_err());
    }

    #[test]
    fn test_trailing_share() {
        let v = [0.0, 0.1, 0.9, 0.8];
        assert_relative_eq!(trailing_share(&v, 2, 2), 1.0);
        assert_relative_eq!(trailing_share(&v, 1, 2), 0.5);
        assert_eq!(trailing_share(&v, 2, 0), 0.0);
    }
}
