//! Invariant node classification under distribution shift.
//!
//! `lattix-invariant` trains a graph encoder whose predictions hold up when
//! the environment changes. Environments are never given: they are inferred
//! from an "irrelevant" representation, and the encoder is penalized when its
//! risk varies across them. Per-environment graph structures are grown by
//! gradient-guided edge sampling.
//!
//! # Modules
//!
//! - [`graph`]: edge lists, degree normalization, message passing, labelled graphs
//! - [`conv`]: GCN, GraphSAGE, GAT, GPR and GCNII layers
//! - [`encoder`]: multi-layer encoders behind [`GraphEncoder`]
//! - [`heads`]: classifiers, feature learners, decoder
//! - [`dependence`]: HSIC / CKA dependence penalty
//! - [`loss`]: supervised losses and label shaping
//! - [`perturb`]: gradient-guided edge and feature perturbation
//! - [`model`]: the six-step [`InvarianceModel`]
//! - [`baseline`]: ERM baseline and irrelevant-learner pretraining
//! - [`importance`]: feature importance and top-k comparison
//! - [`training`]: AdamW outer loop
//!
//! # Example
//!
//! ```rust,ignore
//! use candle_core::Device;
//! use lattix_invariant::{InvarianceConfig, InvarianceModel, LossCriterion, Trainer};
//!
//! let config = InvarianceConfig::default().with_num_envs(3);
//! let model = InvarianceModel::new(config, n, c, d, &Device::Cpu)?;
//! let mut trainer = Trainer::new(model, &graph, 1)?;
//! trainer.fit(&graph, LossCriterion::Nll, 100)?;
//! let logits = trainer.model().infer(&graph, false)?;
//! ```

pub mod baseline;
pub mod config;
pub mod conv;
pub mod dependence;
pub mod encoder;
pub mod error;
pub mod graph;
pub mod heads;
pub mod importance;
pub mod loss;
pub mod model;
pub mod params;
pub mod perturb;
pub mod training;

pub use baseline::{Baseline, IrrelevantPretrainer};
pub use config::{
    DependenceKernel, DependenceTarget, EncoderKind, InvarianceConfig, PerturbationMode,
    VarianceMode,
};
pub use encoder::{Encoder, GraphEncoder};
pub use error::{Error, Result};
pub use graph::{DatasetKind, EdgeIndex, GraphData};
pub use importance::ImportanceModel;
pub use loss::LossCriterion;
pub use model::{InvarianceModel, InvarianceTerms, Step, StepOutput, VarianceTerms};
pub use perturb::{EnvPerturbation, PerturbationOutcome};
pub use training::{EpochReport, Trainer};
