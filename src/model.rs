//! Environment-inference and invariance-penalty training model.
//!
//! [`InvarianceModel`] owns every learnable component and runs the six
//! training objectives selected by [`Step`]:
//!
//! | Step | Objective |
//! |------|-----------|
//! | 1 | environment-weighted risk of the per-environment heads |
//! | 2 | main risk plus the weighted gap to every environment head |
//! | 3 | dependence between irrelevant and invariant embeddings, plus reconstruction |
//! | 4 | per-node risk gap weighted by the environment partition |
//! | 5 | step 2 plus the variance of risk across environment adjacencies |
//! | 6 | environment-contrastive perturbation of `env_adj[i]` (or of features) |
//!
//! Steps 5 and 6 read the per-environment adjacencies, which exist only after
//! [`InvarianceModel::initialize_environment_adjacency`].

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::{DependenceTarget, InvarianceConfig, PerturbationMode, VarianceMode};
use crate::dependence::cka;
use crate::encoder::{Encoder, GraphEncoder};
use crate::error::{Error, Result};
use crate::graph::{EdgeIndex, GraphData};
use crate::heads::{Decoder, EnvironmentClassifier, FeatureLearner, NodeClassifier};
use crate::loss::{ce_constant_target, ce_per_node, mse, sup_loss, LossCriterion};
use crate::params::ParamGroup;
use crate::perturb::{
    column_probabilities, flip_edges, mask_features, sample_per_row, EnvPerturbation,
    PerturbationOutcome,
};

/// Feature columns hidden by `infer(graph, partial = true)`.
pub const PARTIAL_TRAILING_COLUMNS: usize = 10;

fn identity(n: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Ok(Tensor::from_vec(data, (n, n), device)?)
}

// ============================================================================
// STEP SELECTION
// ============================================================================

/// One of the six training objectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    EnvironmentRisk,
    Invariance,
    Dependence,
    PartitionPenalty,
    Variance,
    Perturbation,
}

impl Step {
    /// Steps 1 through 5, the gradient-descent objectives.
    pub const OBJECTIVES: [Step; 5] = [
        Step::EnvironmentRisk,
        Step::Invariance,
        Step::Dependence,
        Step::PartitionPenalty,
        Step::Variance,
    ];

    /// 1-based step number.
    pub fn index(self) -> u8 {
        match self {
            Step::EnvironmentRisk => 1,
            Step::Invariance => 2,
            Step::Dependence => 3,
            Step::PartitionPenalty => 4,
            Step::Variance => 5,
            Step::Perturbation => 6,
        }
    }
}

impl TryFrom<u8> for Step {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Step::EnvironmentRisk),
            2 => Ok(Step::Invariance),
            3 => Ok(Step::Dependence),
            4 => Ok(Step::PartitionPenalty),
            5 => Ok(Step::Variance),
            6 => Ok(Step::Perturbation),
            other => Err(Error::Config(format!("unknown step {other} (expected 1-6)"))),
        }
    }
}

/// What a training step returns.
#[derive(Debug, Clone)]
pub enum StepOutput {
    /// Scalar objective (steps 1, 2, 4, 5).
    Loss(Tensor),
    /// Dependence penalty and reconstructed features (step 3).
    WithReconstruction { loss: Tensor, reconstruction: Tensor },
    /// Per-environment perturbation results (step 6).
    Perturbation(PerturbationOutcome),
}

impl StepOutput {
    /// The scalar loss, if the step produced one.
    pub fn loss(&self) -> Option<&Tensor> {
        match self {
            StepOutput::Loss(loss) | StepOutput::WithReconstruction { loss, .. } => Some(loss),
            StepOutput::Perturbation(_) => None,
        }
    }
}

/// The parts of the step-2 objective.
#[derive(Debug, Clone)]
pub struct InvarianceTerms {
    /// Supervised risk of the main head.
    pub main_risk: Tensor,
    /// `mean_i((main_risk - risk_i) * w_i)`.
    pub penalty: Tensor,
    /// `main_risk + penalty_weight * penalty`.
    pub objective: Tensor,
}

/// The parts of the step-5 objective.
#[derive(Debug, Clone)]
pub struct VarianceTerms {
    pub invariance: InvarianceTerms,
    /// Variance of risk across environment adjacencies, never negative.
    pub variance: Tensor,
    /// `invariance.objective + beta * variance`.
    pub objective: Tensor,
}

/// Phase one of a perturbation step: the loss, with its graph still attached.
#[derive(Debug)]
pub struct ContrastiveLoss {
    env: usize,
    loss: Tensor,
    probe: Var,
}

impl ContrastiveLoss {
    pub fn env(&self) -> usize {
        self.env
    }

    pub fn loss(&self) -> &Tensor {
        &self.loss
    }
}

// ============================================================================
// MODEL
// ============================================================================

/// Invariant node classifier with inferred environments.
pub struct InvarianceModel {
    config: InvarianceConfig,
    device: Device,
    varmap: VarMap,
    num_nodes: usize,
    num_classes: usize,
    num_features: usize,
    encoder: Encoder,
    head: NodeClassifier,
    env_heads: Vec<NodeClassifier>,
    env_classifier: EnvironmentClassifier,
    irrelevant: FeatureLearner,
    decoder: Decoder,
    adj_continuous: Var,
    env_adj: Option<Vec<EdgeIndex>>,
    rng: StdRng,
    train: bool,
}

impl std::fmt::Debug for InvarianceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvarianceModel")
            .field("encoder", &self.encoder.kind())
            .field("num_nodes", &self.num_nodes)
            .field("num_classes", &self.num_classes)
            .field("num_features", &self.num_features)
            .field("num_envs", &self.env_heads.len())
            .field("env_adj_initialized", &self.env_adj.is_some())
            .finish()
    }
}

impl InvarianceModel {
    /// Build every component for a graph of `num_nodes` nodes with
    /// `num_features` input features and `num_classes` classes.
    ///
    /// # Errors
    ///
    /// `Config` if the configuration is invalid, a size is zero, or
    /// `num_sample` exceeds what the perturbation mode can draw from.
    pub fn new(
        config: InvarianceConfig,
        num_nodes: usize,
        num_classes: usize,
        num_features: usize,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        if num_nodes == 0 || num_classes == 0 || num_features == 0 {
            return Err(Error::Config(format!(
                "sizes must be > 0 (n = {num_nodes}, c = {num_classes}, d = {num_features})"
            )));
        }
        let limit = match config.perturbation {
            PerturbationMode::Adj => num_nodes,
            PerturbationMode::X => num_features,
        };
        if config.num_sample > limit {
            return Err(Error::Config(format!(
                "num_sample ({}) exceeds {limit} candidates in {} mode",
                config.num_sample, config.perturbation
            )));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let group = |prefix: &str| ParamGroup::new(&varmap, prefix);
        let h = config.hidden_channels;
        let e = config.num_envs;

        let encoder = Encoder::from_config(&config, num_features, vb.pp("encoder"), group("encoder"))?;
        let head = NodeClassifier::new(h, h, num_classes, vb.pp("head"), group("head"))?;
        let env_heads = (0..e)
            .map(|i| {
                let prefix = format!("env_heads.{i}");
                NodeClassifier::new(h, h, num_classes, vb.pp(&prefix), group(&prefix))
            })
            .collect::<Result<Vec<_>>>()?;
        let env_classifier =
            EnvironmentClassifier::new(h, h, e, vb.pp("env_classifier"), group("env_classifier"))?;
        let irrelevant = FeatureLearner::new(num_features, h, vb.pp("irrelevant"), group("irrelevant"))?;
        let decoder = Decoder::new(2 * h, h, num_features, vb.pp("decoder"), group("decoder"))?;
        let adj_continuous = Var::zeros((num_nodes, num_nodes), DType::F32, device)?;
        let rng = StdRng::seed_from_u64(config.seed);

        info!(
            encoder = %config.encoder,
            num_nodes,
            num_classes,
            num_features,
            num_envs = e,
            "built invariance model"
        );

        Ok(Self {
            config,
            device: device.clone(),
            varmap,
            num_nodes,
            num_classes,
            num_features,
            encoder,
            head,
            env_heads,
            env_classifier,
            irrelevant,
            decoder,
            adj_continuous,
            env_adj: None,
            rng,
            train: true,
        })
    }

    pub fn config(&self) -> &InvarianceConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Every learnable tensor; hand `varmap().all_vars()` to an optimizer.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn num_envs(&self) -> usize {
        self.env_heads.len()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn head(&self) -> &NodeClassifier {
        &self.head
    }

    pub fn env_heads(&self) -> &[NodeClassifier] {
        &self.env_heads
    }

    pub fn env_adjacency(&self) -> Option<&[EdgeIndex]> {
        self.env_adj.as_deref()
    }

    /// The continuous adjacency probe (`n x n`).
    pub fn adj_continuous(&self) -> &Tensor {
        self.adj_continuous.as_tensor()
    }

    /// Toggle dropout in the backbone.
    pub fn set_training(&mut self, train: bool) {
        self.train = train;
    }

    pub fn is_training(&self) -> bool {
        self.train
    }

    /// Re-initialize every component from the model's seeded generator.
    pub fn reset_parameters(&mut self) -> Result<()> {
        let rng = &mut self.rng;
        self.encoder.reset_parameters(rng)?;
        self.head.reset_parameters(rng)?;
        self.env_classifier.reset_parameters(rng)?;
        self.irrelevant.reset_parameters(rng)?;
        self.decoder.reset_parameters(rng)?;
        for head in &self.env_heads {
            head.reset_parameters(rng)?;
        }
        debug!("reset parameters");
        Ok(())
    }

    /// Give every environment a copy of the graph's adjacency.
    pub fn initialize_environment_adjacency(&mut self, graph: &GraphData) -> Result<()> {
        self.check_graph(graph)?;
        self.env_adj = Some(vec![graph.edges.clone(); self.num_envs()]);
        info!(
            num_envs = self.num_envs(),
            edges = graph.edges.len(),
            "initialized environment adjacency"
        );
        Ok(())
    }

    /// Run one training step.
    pub fn forward(
        &mut self,
        graph: &GraphData,
        criterion: LossCriterion,
        step: Step,
    ) -> Result<StepOutput> {
        debug!(step = step.index(), "forward");
        match step {
            Step::EnvironmentRisk => Ok(StepOutput::Loss(self.environment_risk(graph, criterion)?)),
            Step::Invariance => Ok(StepOutput::Loss(
                self.invariance_terms(graph, criterion)?.objective,
            )),
            Step::Dependence => {
                let (loss, reconstruction) = self.dependence_and_reconstruction(graph)?;
                Ok(StepOutput::WithReconstruction {
                    loss,
                    reconstruction,
                })
            }
            Step::PartitionPenalty => Ok(StepOutput::Loss(self.partition_penalty(graph)?)),
            Step::Variance => Ok(StepOutput::Loss(
                self.variance_objective(graph, criterion)?.objective,
            )),
            Step::Perturbation => Ok(StepOutput::Perturbation(self.perturb(graph)?)),
        }
    }

    // ------------------------------------------------------------------------
    // Steps 1-5
    // ------------------------------------------------------------------------

    /// Step 1: `mean_i(risk_i * w_i)` with `w` the node-averaged partition.
    pub fn environment_risk(&self, graph: &GraphData, criterion: LossCriterion) -> Result<Tensor> {
        self.check_graph(graph)?;
        let weights = self.mean_partition(graph)?;
        let out = self.embed(&graph.features, &graph.edges)?;
        let risks = self.env_risks(graph, &out, criterion)?;
        Ok((risks * weights)?.mean_all()?)
    }

    /// Step 2, split into its parts.
    pub fn invariance_terms(
        &self,
        graph: &GraphData,
        criterion: LossCriterion,
    ) -> Result<InvarianceTerms> {
        self.check_graph(graph)?;
        let weights = self.mean_partition(graph)?;
        let out = self.embed(&graph.features, &graph.edges)?;
        let main_risk = self.supervised(graph, &self.head.classify(&out)?, criterion)?;
        let risks = self.env_risks(graph, &out, criterion)?;

        let gaps = risks.neg()?.broadcast_add(&main_risk)?;
        let penalty = (gaps * weights)?.mean_all()?;
        let objective = (&main_risk + (&penalty * self.config.penalty_weight)?)?;
        Ok(InvarianceTerms {
            main_risk,
            penalty,
            objective,
        })
    }

    /// Step 3: dependence penalty and reconstruction of the input features.
    pub fn dependence_and_reconstruction(&self, graph: &GraphData) -> Result<(Tensor, Tensor)> {
        self.check_graph(graph)?;
        let env_feature = self.irrelevant.learn(&graph.features, &graph.edges)?;
        let inv_feature = self.embed(&graph.features, &graph.edges)?;
        let joint = Tensor::cat(&[&env_feature, &inv_feature], 1)?;
        let reconstruction = self.decoder.decode(&joint, &graph.edges)?;

        let dependence = match self.config.dependence_target {
            DependenceTarget::Embeddings => cka(&env_feature, &inv_feature, self.config.kernel)?,
            DependenceTarget::Logits => {
                let logits = self.head.classify(&inv_feature)?;
                let partition = self.env_classifier.partition(&env_feature)?;
                cka(&logits, &partition, self.config.kernel)?
            }
        };
        Ok((dependence, reconstruction))
    }

    /// Step 4: `mean_nodes(sum_i (ce_main - ce_i) * partition_i)`.
    pub fn partition_penalty(&self, graph: &GraphData) -> Result<Tensor> {
        self.check_graph(graph)?;
        let irrelevant = self.irrelevant.learn(&graph.features, &graph.edges)?;
        let partition = graph.select_labelled(&self.env_classifier.partition(&irrelevant)?)?;
        let out = self.embed(&graph.features, &graph.edges)?;
        let ce_main = self.node_ce(graph, &self.head.classify(&out)?)?;

        let gaps = self
            .env_heads
            .iter()
            .map(|head| {
                let ce_env = self.node_ce(graph, &head.classify(&out)?)?;
                Ok((&ce_main - ce_env)?)
            })
            .collect::<Result<Vec<_>>>()?;
        let gaps = Tensor::cat(&gaps, 1)?;
        Ok((gaps * partition)?.sum(1)?.mean_all()?)
    }

    /// Step 5, split into its parts.
    ///
    /// # Errors
    ///
    /// `EnvironmentNotInitialized` before
    /// [`initialize_environment_adjacency`](Self::initialize_environment_adjacency).
    pub fn variance_objective(
        &self,
        graph: &GraphData,
        criterion: LossCriterion,
    ) -> Result<VarianceTerms> {
        self.check_graph(graph)?;
        let env_adj = self.env_adj.as_ref().ok_or(Error::EnvironmentNotInitialized)?;

        let outputs = env_adj
            .iter()
            .map(|adj| {
                let out = self.embed(&graph.features, adj)?;
                self.head.classify(&out)
            })
            .collect::<Result<Vec<_>>>()?;

        // unbiased variance is undefined for a single environment
        let variance = if outputs.len() < 2 {
            Tensor::zeros((), DType::F32, &self.device)?
        } else {
            match self.config.variance_mode {
                VarianceMode::Ene => {
                    let ce = outputs
                        .iter()
                        .map(|logits| self.node_ce(graph, logits))
                        .collect::<Result<Vec<_>>>()?;
                    Tensor::cat(&ce, 1)?.var_keepdim(1)?.mean_all()?
                }
                VarianceMode::Risk => {
                    let risks = outputs
                        .iter()
                        .map(|logits| self.supervised(graph, logits, criterion))
                        .collect::<Result<Vec<_>>>()?;
                    Tensor::stack(&risks, 0)?.var(0)?
                }
            }
        };

        let invariance = self.invariance_terms(graph, criterion)?;
        let objective = (&invariance.objective + (&variance * self.config.beta)?)?;
        Ok(VarianceTerms {
            invariance,
            variance,
            objective,
        })
    }

    // ------------------------------------------------------------------------
    // Step 6
    // ------------------------------------------------------------------------

    /// Phase one of perturbing environment `env`.
    ///
    /// Resets the adjacency probe to the identity and computes
    /// `CE(partition, env) + niu * MSE(gnn(probe x, env_adj[env]), gnn(x, A))`.
    /// The probe is `adj_continuous` in adjacency mode and a copy of the
    /// features in feature mode.
    pub fn contrastive_loss(&mut self, graph: &GraphData, env: usize) -> Result<ContrastiveLoss> {
        self.check_graph(graph)?;
        let count = self.num_envs();
        if env >= count {
            return Err(Error::EnvironmentOutOfRange { index: env, count });
        }
        let env_adj = self.env_adj.as_ref().ok_or(Error::EnvironmentNotInitialized)?;
        let adj = &env_adj[env];

        self.adj_continuous
            .set(&identity(self.num_nodes, &self.device)?)?;
        let (x, probe) = match self.config.perturbation {
            PerturbationMode::Adj => (graph.features.clone(), self.adj_continuous.clone()),
            PerturbationMode::X => {
                let x = Var::from_tensor(&graph.features)?;
                (x.as_tensor().clone(), x)
            }
        };

        let probed = self.adj_continuous.as_tensor().matmul(&x)?;
        let env_feature = self.irrelevant.learn(&probed, adj)?;
        let partition = self.env_classifier.partition(&env_feature)?;
        let before = self.embed(&x, &graph.edges)?;
        let now = self.embed(&probed, adj)?;

        let ce = ce_constant_target(&partition, env)?;
        let consistency = mse(&now, &before)?;
        let loss = (ce + (consistency * self.config.niu)?)?;
        Ok(ContrastiveLoss { env, loss, probe })
    }

    /// Phase two: backpropagate and read the probe's gradient.
    pub fn probe_gradient(&self, contrastive: &ContrastiveLoss) -> Result<Tensor> {
        let grads = contrastive.loss.backward()?;
        let grad = match grads.get(contrastive.probe.as_tensor()) {
            Some(grad) => grad.detach(),
            None => contrastive.probe.as_tensor().zeros_like()?,
        };
        Ok(grad)
    }

    /// Perturb one environment.
    ///
    /// Adjacency mode replaces `env_adj[env]` with the original graph plus
    /// sampled complement edges. Feature mode returns a masked feature copy
    /// and leaves the model untouched.
    pub fn perturb_environment(&mut self, graph: &GraphData, env: usize) -> Result<EnvPerturbation> {
        let contrastive = self.contrastive_loss(graph, env)?;
        let grad = self.probe_gradient(&contrastive)?;
        let loss = contrastive.loss.to_scalar::<f32>()?;

        let probs = column_probabilities(&grad)?;
        let samples = sample_per_row(&probs, self.config.num_sample, &mut self.rng)?;

        let outcome = match self.config.perturbation {
            PerturbationMode::Adj => {
                let edges = flip_edges(&graph.edges, self.num_nodes, &samples)?;
                if let Some(env_adj) = self.env_adj.as_mut() {
                    env_adj[env] = edges.clone();
                }
                EnvPerturbation::Adjacency { env, loss, edges }
            }
            PerturbationMode::X => {
                let features = mask_features(&graph.features, &samples)?;
                EnvPerturbation::Features {
                    env,
                    loss,
                    features,
                }
            }
        };
        debug!(env, loss, mode = %self.config.perturbation, "perturbed environment");
        Ok(outcome)
    }

    /// Step 6 over every environment in order.
    pub fn perturb(&mut self, graph: &GraphData) -> Result<PerturbationOutcome> {
        let environments = (0..self.num_envs())
            .map(|env| self.perturb_environment(graph, env))
            .collect::<Result<Vec<_>>>()?;
        Ok(PerturbationOutcome { environments })
    }

    // ------------------------------------------------------------------------
    // Inference
    // ------------------------------------------------------------------------

    /// Logits `(n, c)` without dropout.
    ///
    /// With `partial`, the last `min(10, d)` feature columns of a copy of the
    /// features are zeroed first; `graph` is not modified.
    pub fn infer(&self, graph: &GraphData, partial: bool) -> Result<Tensor> {
        self.check_graph(graph)?;
        let x = if partial {
            graph.features_without_trailing(PARTIAL_TRAILING_COLUMNS)?
        } else {
            graph.features.clone()
        };
        let out = self.encoder.forward_t(&x, &graph.edges, false)?;
        self.head.classify(&out)
    }

    /// Supervised loss of the main head on arbitrary features, labels and edges.
    ///
    /// `graph` supplies the dataset kind and node mask.
    pub fn importance_loss(
        &self,
        x: &Tensor,
        y: &Tensor,
        edges: &EdgeIndex,
        graph: &GraphData,
        criterion: LossCriterion,
    ) -> Result<Tensor> {
        let out = self.encoder.forward_t(x, edges, false)?;
        let logits = self.head.classify(&out)?;
        let logits = graph.select_labelled(&logits)?;
        let labels = graph.select_labelled(y)?;
        sup_loss(&labels, &logits, criterion, self.float_targets(graph))
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn check_graph(&self, graph: &GraphData) -> Result<()> {
        if graph.num_nodes() != self.num_nodes {
            return Err(Error::DimensionMismatch {
                expected: self.num_nodes,
                got: graph.num_nodes(),
            });
        }
        if graph.num_features() != self.num_features {
            return Err(Error::DimensionMismatch {
                expected: self.num_features,
                got: graph.num_features(),
            });
        }
        Ok(())
    }

    fn float_targets(&self, graph: &GraphData) -> bool {
        self.config.rocauc || graph.dataset.uses_float_targets()
    }

    fn embed(&self, x: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        self.encoder.forward_t(x, edges, self.train)
    }

    /// Node-averaged environment partition, shape `(e,)`.
    fn mean_partition(&self, graph: &GraphData) -> Result<Tensor> {
        let irrelevant = self.irrelevant.learn(&graph.features, &graph.edges)?;
        Ok(self.env_classifier.partition(&irrelevant)?.mean(0)?)
    }

    /// Masked supervised loss of `logits` against the graph labels.
    fn supervised(
        &self,
        graph: &GraphData,
        logits: &Tensor,
        criterion: LossCriterion,
    ) -> Result<Tensor> {
        let logits = graph.select_labelled(logits)?;
        let labels = graph.select_labelled(&graph.labels)?;
        sup_loss(&labels, &logits, criterion, self.float_targets(graph))
    }

    /// Masked per-node cross-entropy, `(n', 1)`.
    fn node_ce(&self, graph: &GraphData, logits: &Tensor) -> Result<Tensor> {
        let logits = graph.select_labelled(logits)?;
        let labels = graph.select_labelled(&graph.labels)?;
        ce_per_node(&logits, &labels)
    }

    /// Supervised risk of every environment head, shape `(e,)`.
    fn env_risks(&self, graph: &GraphData, out: &Tensor, criterion: LossCriterion) -> Result<Tensor> {
        let risks = self
            .env_heads
            .iter()
            .map(|head| self.supervised(graph, &head.classify(out)?, criterion))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&risks, 0)?)
    }
}
