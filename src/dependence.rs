//! Kernel dependence between two representations (HSIC / CKA).
//!
//! For row-aligned `a: (n, h1)` and `b: (n, h2)`:
//!
//! ```text
//! HSIC(K, L) = sum(HKH ∘ HLH),   H = I - 11^T / n
//! CKA(a, b)  = HSIC(K_a, K_b) / sqrt(HSIC(K_a, K_a) * HSIC(K_b, K_b))
//! ```
//!
//! CKA is near 0 for independent representations and 1 for identical ones
//! (up to the kernel's invariances). Every step is differentiable except the
//! bandwidth choice, which is read off detached distances.

use candle_core::{Tensor, D};

use crate::config::DependenceKernel;
use crate::error::{Error, Result};

/// Lower bound on the CKA denominator.
pub const DENOMINATOR_FLOOR: f64 = 1e-12;

/// `H K H` without forming `H`: subtract row and column means, add the grand mean.
pub fn centering(k: &Tensor) -> Result<Tensor> {
    let row_mean = k.mean_keepdim(1)?;
    let col_mean = k.mean_keepdim(0)?;
    let grand = k.mean_all()?;
    Ok(k
        .broadcast_sub(&row_mean)?
        .broadcast_sub(&col_mean)?
        .broadcast_add(&grand)?)
}

/// Squared pairwise distances `|x_i - x_j|^2`, clamped at zero with an
/// exactly zero diagonal.
pub fn pairwise_sq_dists(x: &Tensor) -> Result<Tensor> {
    let n = x.dim(0)?;
    let gram = x.matmul(&x.t()?)?;
    let sq = x.sqr()?.sum_keepdim(1)?;
    let dists = sq
        .broadcast_add(&sq.t()?)?
        .broadcast_sub(&(gram * 2.0)?)?;
    let off_diagonal: Vec<f32> = (0..n * n)
        .map(|k| if k / n == k % n { 0.0 } else { 1.0 })
        .collect();
    let off_diagonal = Tensor::from_vec(off_diagonal, (n, n), x.device())?.to_dtype(x.dtype())?;
    Ok((dists.relu()? * off_diagonal)?)
}

/// Median heuristic: `sqrt(median of the non-zero squared distances)`.
///
/// Falls back to 1 when every distance is zero or the median is not finite.
pub fn median_bandwidth(sq_dists: &Tensor) -> Result<f64> {
    let mut values: Vec<f32> = sq_dists
        .detach()
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .filter(|&v| v != 0.0)
        .collect();
    if values.is_empty() {
        return Ok(1.0);
    }
    values.sort_by(|a, b| a.total_cmp(b));
    // lower median
    let median = values[(values.len() - 1) / 2] as f64;
    let sigma = median.sqrt();
    if sigma.is_finite() && sigma > 0.0 {
        Ok(sigma)
    } else {
        Ok(1.0)
    }
}

pub fn linear_kernel(x: &Tensor) -> Result<Tensor> {
    Ok(x.matmul(&x.t()?)?)
}

/// Gaussian kernel `exp(-|x_i - x_j|^2 / (2 sigma^2))`.
pub fn rbf_kernel(x: &Tensor, sigma: Option<f64>) -> Result<Tensor> {
    let d = pairwise_sq_dists(x)?;
    let sigma = match sigma {
        Some(s) => s,
        None => median_bandwidth(&d)?,
    };
    Ok((d * (-0.5 / (sigma * sigma)))?.exp()?)
}

/// Cubic polynomial kernel `(<x_i, x_j> / h + 1)^3`.
pub fn poly_kernel(x: &Tensor) -> Result<Tensor> {
    let h = x.dim(D::Minus1)?.max(1) as f64;
    let base = ((linear_kernel(x)? / h)? + 1.0)?;
    Ok((base.sqr()? * &base)?)
}

/// Rational-quadratic kernel `(1 + |x_i - x_j|^2 / (2 sigma^2))^-1`.
pub fn rq_kernel(x: &Tensor, sigma: Option<f64>) -> Result<Tensor> {
    let d = pairwise_sq_dists(x)?;
    let sigma = match sigma {
        Some(s) => s,
        None => median_bandwidth(&d)?,
    };
    let base = ((d / (2.0 * sigma * sigma))? + 1.0)?;
    Ok(base.recip()?)
}

/// Gram matrix of `x` under `kernel`.
pub fn gram(x: &Tensor, kernel: DependenceKernel) -> Result<Tensor> {
    match kernel {
        DependenceKernel::Rbf => rbf_kernel(x, None),
        DependenceKernel::Linear => linear_kernel(x),
        DependenceKernel::Poly => poly_kernel(x),
        DependenceKernel::Rq => rq_kernel(x, None),
    }
}

/// Unnormalized HSIC between two Gram matrices.
pub fn hsic(k: &Tensor, l: &Tensor) -> Result<Tensor> {
    Ok((centering(k)? * centering(l)?)?.sum_all()?)
}

/// Centered kernel alignment between two representations.
///
/// # Errors
///
/// `DimensionMismatch` if `a` and `b` have different row counts.
pub fn cka(a: &Tensor, b: &Tensor, kernel: DependenceKernel) -> Result<Tensor> {
    let (na, _) = a.dims2()?;
    let (nb, _) = b.dims2()?;
    if na != nb {
        return Err(Error::DimensionMismatch {
            expected: na,
            got: nb,
        });
    }
    let ka = gram(a, kernel)?;
    let kb = gram(b, kernel)?;
    let cross = hsic(&ka, &kb)?;
    let var_a = hsic(&ka, &ka)?;
    let var_b = hsic(&kb, &kb)?;
    let floor = DENOMINATOR_FLOOR * DENOMINATOR_FLOOR;
    let denom = (var_a * var_b)?.clamp(floor, f64::MAX)?.sqrt()?;
    Ok((cross / denom)?)
}
