//! Supervised losses and label shaping.
//!
//! Two label regimes exist:
//!
//! - **Class ids** (default): `log_softmax` on the logits, then the criterion
//!   on `y.squeeze(1)`.
//! - **Float targets** (ROC-AUC datasets, or when forced by `rocauc`): single
//!   column labels become one-hot rows; multi-column labels are used as-is.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::error::{Error, Result};

/// Loss applied after label shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossCriterion {
    /// Negative log-likelihood on log-probabilities and `u32` class ids.
    #[default]
    Nll,
    /// Binary cross-entropy on raw logits and float targets of the same shape.
    BceWithLogits,
}

impl LossCriterion {
    /// Mean loss of `input` against `target`.
    pub fn apply(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        match self {
            LossCriterion::Nll => {
                if target.dtype().is_float() {
                    return Err(Error::Shape(
                        "NLL criterion expects integer class ids".to_string(),
                    ));
                }
                Ok(candle_nn::loss::nll(input, target)?)
            }
            LossCriterion::BceWithLogits => {
                if input.dims() != target.dims() {
                    return Err(Error::Shape(format!(
                        "BCE input {:?} and target {:?} differ",
                        input.dims(),
                        target.dims()
                    )));
                }
                bce_with_logits(input, &target.to_dtype(input.dtype())?)
            }
        }
    }
}

/// Numerically stable `mean(max(x, 0) - x*y + log(1 + exp(-|x|)))`.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let softplus = ((logits.abs()?.neg()?.exp()? + 1.0)?).log()?;
    let loss = ((logits.relu()? - (logits * targets)?)? + softplus)?;
    Ok(loss.mean_all()?)
}

/// Largest class id in a `u32` label tensor.
fn max_label(labels: &Tensor) -> Result<u32> {
    Ok(labels.flatten_all()?.max(0)?.to_scalar::<u32>()?)
}

fn check_labels(labels: &Tensor, num_classes: usize) -> Result<()> {
    if labels.elem_count() == 0 {
        return Ok(());
    }
    let label = max_label(labels)?;
    if label as usize >= num_classes {
        return Err(Error::LabelOutOfRange { label, num_classes });
    }
    Ok(())
}

/// `(n, 1)` class ids to `(n, c)` f32 one-hot rows.
pub fn one_hot(labels: &Tensor, num_classes: usize) -> Result<Tensor> {
    check_labels(labels, num_classes)?;
    let classes = Tensor::arange(0u32, num_classes as u32, labels.device())?.unsqueeze(0)?;
    Ok(labels
        .to_dtype(DType::U32)?
        .broadcast_eq(&classes)?
        .to_dtype(DType::F32)?)
}

/// Supervised loss of `pred` (logits, `(n, c)`) against labels `(n, k)`.
///
/// With `float_targets`, single-column labels are one-hot encoded to `c`
/// columns and the criterion sees raw logits. Otherwise the logits pass
/// through `log_softmax` and the labels are squeezed to class ids.
pub fn sup_loss(
    labels: &Tensor,
    pred: &Tensor,
    criterion: LossCriterion,
    float_targets: bool,
) -> Result<Tensor> {
    let (n, c) = pred.dims2()?;
    let (rows, cols) = labels.dims2()?;
    if rows != n {
        return Err(Error::DimensionMismatch {
            expected: n,
            got: rows,
        });
    }

    if float_targets {
        let targets = if cols == 1 {
            one_hot(labels, c)?
        } else {
            labels.to_dtype(DType::F32)?
        };
        criterion.apply(pred, &targets)
    } else {
        if cols != 1 {
            return Err(Error::Shape(format!(
                "class-id labels must have one column, got {cols}"
            )));
        }
        check_labels(labels, c)?;
        let log_probs = log_softmax(pred, D::Minus1)?;
        let target = labels.squeeze(1)?.to_dtype(DType::U32)?;
        criterion.apply(&log_probs, &target)
    }
}

/// Per-node cross-entropy without reduction: `-log_softmax(logits)[i, y_i]`.
///
/// Returns `(n, 1)`.
///
/// # Errors
///
/// `LabelOutOfRange` if any target is outside `[0, c)`.
pub fn ce_per_node(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (n, c) = logits.dims2()?;
    let labels = match labels.rank() {
        1 => labels.unsqueeze(1)?,
        _ => labels.clone(),
    };
    let (rows, cols) = labels.dims2()?;
    if rows != n || cols != 1 {
        return Err(Error::Shape(format!(
            "per-node targets must be ({n}, 1), got ({rows}, {cols})"
        )));
    }
    check_labels(&labels, c)?;
    let log_probs = log_softmax(logits, D::Minus1)?;
    let picked = log_probs.gather(&labels.to_dtype(DType::U32)?.contiguous()?, 1)?;
    Ok(picked.neg()?)
}

/// Cross-entropy of every row against the same class.
pub fn ce_constant_target(logits: &Tensor, class: usize) -> Result<Tensor> {
    let (n, c) = logits.dims2()?;
    if class >= c {
        return Err(Error::LabelOutOfRange {
            label: class as u32,
            num_classes: c,
        });
    }
    let target = Tensor::full(class as u32, n, logits.device())?.contiguous()?;
    Ok(candle_nn::loss::cross_entropy(logits, &target)?)
}

/// Mean squared error.
pub fn mse(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::loss::mse(a, b)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_ce_per_node_matches_manual() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0f32, 0.], [2., 0.]], &device).unwrap();
        let y = Tensor::new(&[[0u32], [1]], &device).unwrap();
        let ce = ce_per_node(&logits, &y).unwrap().to_vec2::<f32>().unwrap();
        assert_relative_eq!(ce[0][0], 2f32.ln(), epsilon = 1e-5);
        let expected = -(1.0 / (1.0 + 2f32.exp())).ln();
        assert_relative_eq!(ce[1][0], expected, epsilon = 1e-5);
    }

    #[test]
    fn test_ce_per_node_rejects_out_of_range() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
        let y = Tensor::new(&[[0u32], [2]], &device).unwrap();
        assert!(matches!(
            ce_per_node(&logits, &y),
            Err(Error::LabelOutOfRange { label: 2, num_classes: 2 })
        ));
    }

    #[test]
    fn test_sup_loss_class_ids_equals_mean_ce() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1f32, (5, 3), &device).unwrap();
        let y = Tensor::new(&[[0u32], [1], [2], [1], [0]], &device).unwrap();
        let nll = scalar(&sup_loss(&y, &logits, LossCriterion::Nll, false).unwrap());
        let ce = scalar(&ce_per_node(&logits, &y).unwrap().mean_all().unwrap());
        assert_relative_eq!(nll, ce, epsilon = 1e-5);
    }

    #[test]
    fn test_one_hot() {
        let device = Device::Cpu;
        let y = Tensor::new(&[[1u32], [0]], &device).unwrap();
        let oh = one_hot(&y, 3).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(oh, vec![vec![0., 1., 0.], vec![1., 0., 0.]]);
    }

    #[test]
    fn test_float_targets_use_bce() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
        let y = Tensor::new(&[[1u32], [0]], &device).unwrap();
        let loss = scalar(&sup_loss(&y, &logits, LossCriterion::BceWithLogits, true).unwrap());
        assert_relative_eq!(loss, 2f32.ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_nll_rejects_float_targets() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
        let y = Tensor::new(&[[1u32], [0]], &device).unwrap();
        assert!(sup_loss(&y, &logits, LossCriterion::Nll, true).is_err());
    }

    #[test]
    fn test_constant_target_ce() {
        let logits = Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap();
        let loss = scalar(&ce_constant_target(&logits, 2).unwrap());
        assert_relative_eq!(loss, 3f32.ln(), epsilon = 1e-5);
        assert!(ce_constant_target(&logits, 3).is_err());
    }
}
