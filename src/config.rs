//! Hyperparameters for invariance training.
//!
//! Every selector that the training loop branches on is a closed enum, so an
//! unknown encoder, kernel or perturbation name is rejected when the
//! configuration is parsed rather than deep inside a training step.
//!
//! # TOML Structure
//!
//! ```toml
//! encoder = "gcn"
//! hidden_channels = 32
//! num_layers = 2
//! dropout = 0.0
//! num_envs = 3
//! penalty_weight = 1.0
//! beta = 1.0
//! niu = 0.5
//! kernel = "rbf"
//! dependence_target = "xo"
//! variance_mode = "risk"
//! perturbation = "adj"
//! num_sample = 2
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// SELECTORS
// ============================================================================

/// Backbone graph encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// Graph Convolutional Network (Kipf & Welling, 2017).
    Gcn,
    /// GraphSAGE with mean aggregation (Hamilton et al., 2017).
    Sage,
    /// Graph Attention Network (Velickovic et al., 2018).
    Gat,
    /// Generalized PageRank propagation (Chien et al., 2021).
    Gpr,
    /// GCN with initial residual and identity mapping (Chen et al., 2020).
    Gcnii,
}

/// Kernel used by the dependence penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependenceKernel {
    /// Gaussian kernel, bandwidth from the median heuristic.
    Rbf,
    /// Inner-product kernel.
    Linear,
    /// Cubic polynomial kernel.
    Poly,
    /// Rational-quadratic kernel.
    Rq,
}

/// Which pair of representations the dependence penalty compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependenceTarget {
    /// Raw irrelevant vs. invariant embeddings.
    #[serde(rename = "xo")]
    Embeddings,
    /// Pre-logit outputs: main-head logits vs. environment partition.
    #[serde(rename = "o_logs")]
    Logits,
}

/// How the step-5 variance across environments is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarianceMode {
    /// Per-node variance of per-environment cross-entropy, averaged over nodes.
    Ene,
    /// Variance of per-environment mean risk.
    Risk,
}

/// What step 6 perturbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerturbationMode {
    /// Flip edges over the complement of the original adjacency.
    Adj,
    /// Zero out sampled feature dimensions.
    X,
}

macro_rules! selector_names {
    ($ty:ident, $what:literal, { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    other => Err(Error::Config(format!(
                        concat!("unknown ", $what, " '{}' (expected one of: {})"),
                        other,
                        [$($name),+].join(", ")
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($ty::$variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

selector_names!(EncoderKind, "encoder", {
    "gcn" => Gcn,
    "sage" => Sage,
    "gat" => Gat,
    "gpr" => Gpr,
    "gcnii" => Gcnii,
});

selector_names!(DependenceKernel, "kernel", {
    "rbf" => Rbf,
    "linear" => Linear,
    "poly" => Poly,
    "rq" => Rq,
});

selector_names!(DependenceTarget, "dependence target", {
    "xo" => Embeddings,
    "o_logs" => Logits,
});

selector_names!(VarianceMode, "variance mode", {
    "ene" => Ene,
    "risk" => Risk,
});

selector_names!(PerturbationMode, "perturbation mode", {
    "adj" => Adj,
    "x" => X,
});

// ============================================================================
// DEFAULT FUNCTIONS
// ============================================================================

fn default_encoder() -> EncoderKind {
    EncoderKind::Gcn
}

fn default_hidden_channels() -> usize {
    32
}

fn default_num_layers() -> usize {
    2
}

fn default_dropout() -> f64 {
    0.0
}

fn default_use_norm() -> bool {
    true
}

fn default_gat_heads() -> usize {
    4
}

fn default_gpr_alpha() -> f64 {
    0.1
}

fn default_gpr_k() -> usize {
    10
}

fn default_gcnii_alpha() -> f64 {
    0.1
}

fn default_gcnii_lamda() -> f64 {
    1.0
}

fn default_num_envs() -> usize {
    3
}

fn default_penalty_weight() -> f64 {
    1.0
}

fn default_beta() -> f64 {
    1.0
}

fn default_niu() -> f64 {
    1.0
}

fn default_kernel() -> DependenceKernel {
    DependenceKernel::Rbf
}

fn default_dependence_target() -> DependenceTarget {
    DependenceTarget::Embeddings
}

fn default_variance_mode() -> VarianceMode {
    VarianceMode::Risk
}

fn default_perturbation() -> PerturbationMode {
    PerturbationMode::Adj
}

fn default_num_sample() -> usize {
    2
}

fn default_seed() -> u64 {
    42
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_weight_decay() -> f64 {
    5e-4
}

// ============================================================================
// INVARIANCE CONFIG
// ============================================================================

/// Configuration for [`InvarianceModel`](crate::model::InvarianceModel) and
/// its training cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvarianceConfig {
    /// Backbone encoder for the invariant representation.
    #[serde(default = "default_encoder")]
    pub encoder: EncoderKind,

    /// Hidden and embedding width of every encoder and head.
    #[serde(default = "default_hidden_channels")]
    pub hidden_channels: usize,

    /// Number of message-passing layers in the backbone.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Dropout probability in the backbone, range [0, 1).
    #[serde(default = "default_dropout")]
    pub dropout: f64,

    /// LayerNorm between backbone layers (GCN only).
    #[serde(default = "default_use_norm")]
    pub use_norm: bool,

    /// Attention heads in hidden GAT layers.
    #[serde(default = "default_gat_heads")]
    pub gat_heads: usize,

    /// Teleport probability for GPR propagation.
    #[serde(default = "default_gpr_alpha")]
    pub gpr_alpha: f64,

    /// Propagation depth for GPR.
    #[serde(default = "default_gpr_k")]
    pub gpr_k: usize,

    /// Initial-residual strength for GCNII.
    #[serde(default = "default_gcnii_alpha")]
    pub gcnii_alpha: f64,

    /// Identity-mapping strength for GCNII.
    #[serde(default = "default_gcnii_lamda")]
    pub gcnii_lamda: f64,

    /// Number of latent environments `e`.
    #[serde(default = "default_num_envs")]
    pub num_envs: usize,

    /// Weight of the invariance penalty (steps 2 and 5).
    #[serde(default = "default_penalty_weight")]
    pub penalty_weight: f64,

    /// Weight of the variance-across-environments penalty (step 5).
    #[serde(default = "default_beta")]
    pub beta: f64,

    /// Weight of the consistency term in the step-6 contrastive loss.
    #[serde(default = "default_niu")]
    pub niu: f64,

    /// Kernel of the dependence penalty.
    #[serde(default = "default_kernel")]
    pub kernel: DependenceKernel,

    /// Representations compared by the dependence penalty.
    #[serde(default = "default_dependence_target")]
    pub dependence_target: DependenceTarget,

    /// Variance measure used by step 5.
    #[serde(default = "default_variance_mode")]
    pub variance_mode: VarianceMode,

    /// What step 6 perturbs.
    #[serde(default = "default_perturbation")]
    pub perturbation: PerturbationMode,

    /// Edges (or feature dimensions) sampled per node in step 6.
    #[serde(default = "default_num_sample")]
    pub num_sample: usize,

    /// Treat labels as one-hot targets for every dataset (ROC-AUC evaluation).
    #[serde(default)]
    pub rocauc: bool,

    /// Seed for parameter initialization and perturbation sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// AdamW learning rate used by the training cycle.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// AdamW weight decay used by the training cycle.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

impl Default for InvarianceConfig {
    fn default() -> Self {
        Self {
            encoder: default_encoder(),
            hidden_channels: default_hidden_channels(),
            num_layers: default_num_layers(),
            dropout: default_dropout(),
            use_norm: default_use_norm(),
            gat_heads: default_gat_heads(),
            gpr_alpha: default_gpr_alpha(),
            gpr_k: default_gpr_k(),
            gcnii_alpha: default_gcnii_alpha(),
            gcnii_lamda: default_gcnii_lamda(),
            num_envs: default_num_envs(),
            penalty_weight: default_penalty_weight(),
            beta: default_beta(),
            niu: default_niu(),
            kernel: default_kernel(),
            dependence_target: default_dependence_target(),
            variance_mode: default_variance_mode(),
            perturbation: default_perturbation(),
            num_sample: default_num_sample(),
            rocauc: false,
            seed: default_seed(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
        }
    }
}

impl InvarianceConfig {
    pub fn with_encoder(mut self, encoder: EncoderKind) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_hidden_channels(mut self, hidden: usize) -> Self {
        self.hidden_channels = hidden;
        self
    }

    pub fn with_num_layers(mut self, layers: usize) -> Self {
        self.num_layers = layers;
        self
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_num_envs(mut self, num_envs: usize) -> Self {
        self.num_envs = num_envs;
        self
    }

    pub fn with_kernel(mut self, kernel: DependenceKernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_variance_mode(mut self, mode: VarianceMode) -> Self {
        self.variance_mode = mode;
        self
    }

    pub fn with_perturbation(mut self, mode: PerturbationMode) -> Self {
        self.perturbation = mode;
        self
    }

    pub fn with_num_sample(mut self, num_sample: usize) -> Self {
        self.num_sample = num_sample;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a width, depth or count is zero, a
    /// probability is outside its range, or a weight is negative or NaN.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_channels == 0 {
            return Err(Error::Config("hidden_channels must be > 0".to_string()));
        }
        if self.num_layers == 0 {
            return Err(Error::Config("num_layers must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.num_envs == 0 {
            return Err(Error::Config("num_envs must be > 0".to_string()));
        }
        if self.encoder == EncoderKind::Gat && self.gat_heads == 0 {
            return Err(Error::Config("gat_heads must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.gpr_alpha) {
            return Err(Error::Config(format!(
                "gpr_alpha must be in [0, 1], got {}",
                self.gpr_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.gcnii_alpha) {
            return Err(Error::Config(format!(
                "gcnii_alpha must be in [0, 1], got {}",
                self.gcnii_alpha
            )));
        }
        if self.gcnii_lamda <= 0.0 || self.gcnii_lamda.is_nan() {
            return Err(Error::Config("gcnii_lamda must be > 0".to_string()));
        }
        for (name, value) in [
            ("penalty_weight", self.penalty_weight),
            ("beta", self.beta),
            ("niu", self.niu),
            ("weight_decay", self.weight_decay),
        ] {
            if value < 0.0 || value.is_nan() {
                return Err(Error::Config(format!(
                    "{name} must be >= 0 and not NaN, got {value}"
                )));
            }
        }
        if self.learning_rate <= 0.0 || self.learning_rate.is_nan() {
            return Err(Error::Config("learning_rate must be > 0".to_string()));
        }
        if self.num_sample == 0 {
            return Err(Error::Config("num_sample must be > 0".to_string()));
        }
        Ok(())
    }
}
