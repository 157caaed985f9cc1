//! Named parameter groups over a shared [`VarMap`].
//!
//! Every component builds its layers through a `VarBuilder` rooted at a
//! prefix (`"encoder"`, `"head"`, `"env_heads.0"`, ...). A [`ParamGroup`]
//! addresses the variables under one prefix so a component can be
//! re-initialized, overwritten, or tied to another one in place. Because
//! `Var::set` writes into the storage shared with the layers, no module has to
//! be rebuilt.

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};

use crate::error::{Error, Result};

/// Initialization rule for a single tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Init {
    /// Every entry `U(lo, hi)`.
    Uniform { lo: f32, hi: f32 },
    /// Glorot/Xavier uniform over the last two dimensions.
    Glorot,
    /// Every entry equal to the value.
    Const(f32),
    /// Explicit values in row-major order.
    Values(Vec<f32>),
}

impl Init {
    /// Fan-in bias rule `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    pub fn fan_in_bias(fan_in: usize) -> Self {
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        Init::Uniform {
            lo: -bound,
            hi: bound,
        }
    }

    fn sample(&self, dims: &[usize], rng: &mut StdRng) -> Result<Vec<f32>> {
        let count: usize = dims.iter().product();
        match self {
            Init::Uniform { lo, hi } => uniform(*lo, *hi, count, rng),
            Init::Glorot => {
                let (fan_out, fan_in) = match dims {
                    [.., o, i] => (*o, *i),
                    [o] => (*o, 1),
                    [] => (1, 1),
                };
                let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
                uniform(-bound, bound, count, rng)
            }
            Init::Const(v) => Ok(vec![*v; count]),
            Init::Values(values) => {
                if values.len() != count {
                    return Err(Error::DimensionMismatch {
                        expected: count,
                        got: values.len(),
                    });
                }
                Ok(values.clone())
            }
        }
    }
}

fn uniform(lo: f32, hi: f32, count: usize, rng: &mut StdRng) -> Result<Vec<f32>> {
    if lo == hi {
        return Ok(vec![lo; count]);
    }
    let dist = Uniform::new(lo, hi).map_err(|e| Error::Sampling(e.to_string()))?;
    Ok((0..count).map(|_| dist.sample(rng)).collect())
}

/// Default rule: Glorot for matrices, zero bias, LayerNorm affine `(1, 0)`.
pub fn default_init(name: &str, dims: &[usize]) -> Init {
    let leaf = name.rsplit('.').next().unwrap_or(name);
    match (leaf, dims.len()) {
        ("bias", _) => Init::Const(0.0),
        ("weight", 1) => Init::Const(1.0),
        _ => Init::Glorot,
    }
}

/// The variables of a [`VarMap`] whose names start with `prefix.`.
#[derive(Clone)]
pub struct ParamGroup {
    varmap: VarMap,
    prefix: String,
}

impl std::fmt::Debug for ParamGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamGroup")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ParamGroup {
    pub fn new(varmap: &VarMap, prefix: impl Into<String>) -> Self {
        Self {
            varmap: varmap.clone(),
            prefix: prefix.into(),
        }
    }

    /// Variables in this group as `(name relative to prefix, var)`, sorted.
    pub fn vars(&self) -> Result<Vec<(String, Var)>> {
        let head = format!("{}.", self.prefix);
        let data = self.varmap.data().lock().map_err(|_| Error::Poisoned)?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .filter_map(|(name, var)| {
                name.strip_prefix(&head)
                    .map(|rel| (rel.to_string(), var.clone()))
            })
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Re-initialize every variable, choosing the rule per relative name.
    pub fn reset_with<F>(&self, rng: &mut StdRng, rule: F) -> Result<()>
    where
        F: Fn(&str, &[usize]) -> Init,
    {
        for (name, var) in self.vars()? {
            let dims = var.dims().to_vec();
            let values = rule(&name, &dims).sample(&dims, rng)?;
            let fresh = Tensor::from_vec(values, dims, var.device())?.to_dtype(var.dtype())?;
            var.set(&fresh)?;
        }
        Ok(())
    }

    /// Overwrite one variable by relative name.
    pub fn set(&self, name: &str, value: &Tensor) -> Result<()> {
        let full = format!("{}.{}", self.prefix, name);
        let data = self.varmap.data().lock().map_err(|_| Error::Poisoned)?;
        let var = data
            .get(&full)
            .ok_or_else(|| Error::Config(format!("no parameter named '{full}'")))?;
        var.set(&value.to_dtype(var.dtype())?)?;
        Ok(())
    }

    /// Copy every tensor of `other` into the same-named tensor of `self`.
    pub fn copy_from(&self, other: &ParamGroup) -> Result<()> {
        let source = other.vars()?;
        let target = self.vars()?;
        if source.len() != target.len() {
            return Err(Error::DimensionMismatch {
                expected: target.len(),
                got: source.len(),
            });
        }
        for ((dst_name, dst), (src_name, src)) in target.iter().zip(source.iter()) {
            if dst_name != src_name {
                return Err(Error::Config(format!(
                    "parameter layouts differ: '{dst_name}' vs '{src_name}'"
                )));
            }
            dst.set(&src.as_tensor().detach())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{linear, VarBuilder};
    use rand::SeedableRng;

    #[test]
    fn test_group_filters_by_prefix() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _a = linear(4, 3, vb.pp("head")).unwrap();
        let _b = linear(4, 3, vb.pp("head_extra")).unwrap();

        let group = ParamGroup::new(&varmap, "head");
        let names: Vec<String> = group.vars().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["bias".to_string(), "weight".to_string()]);
    }

    #[test]
    fn test_reset_writes_through_to_layer() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = linear(2, 2, vb.pp("lin")).unwrap();

        let group = ParamGroup::new(&varmap, "lin");
        let mut rng = StdRng::seed_from_u64(0);
        group.reset_with(&mut rng, |_, _| Init::Const(0.5)).unwrap();

        let w = layer.weight().to_vec2::<f32>().unwrap();
        assert!(w.iter().flatten().all(|&v| v == 0.5));
    }

    #[test]
    fn test_uniform_range() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = linear(8, 8, vb.pp("lin")).unwrap();

        let group = ParamGroup::new(&varmap, "lin");
        let mut rng = StdRng::seed_from_u64(7);
        group
            .reset_with(&mut rng, |_, _| Init::Uniform { lo: 0.0, hi: 1.0 })
            .unwrap();
        let w = layer.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(w.iter().all(|&v| (0.0..1.0).contains(&v)));
    }

    #[test]
    fn test_copy_from_ties_groups() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let a = linear(3, 2, vb.pp("a")).unwrap();
        let b = linear(3, 2, vb.pp("b")).unwrap();

        ParamGroup::new(&varmap, "b")
            .copy_from(&ParamGroup::new(&varmap, "a"))
            .unwrap();

        assert_eq!(
            a.weight().to_vec2::<f32>().unwrap(),
            b.weight().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_default_init_rules() {
        assert_eq!(default_init("lin1.bias", &[4]), Init::Const(0.0));
        assert_eq!(default_init("norm.weight", &[4]), Init::Const(1.0));
        assert_eq!(default_init("lin1.weight", &[4, 3]), Init::Glorot);
    }
}
