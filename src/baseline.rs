//! Comparison models trained without environment inference.
//!
//! - [`Baseline`]: empirical risk minimization with the same encoder and head.
//! - [`IrrelevantPretrainer`]: fits the irrelevant learner to the labels and
//!   reconstructs features from `[irrelevant ‖ relevant ‖ y]`.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::config::InvarianceConfig;
use crate::encoder::{Encoder, GraphEncoder};
use crate::error::{Error, Result};
use crate::graph::{EdgeIndex, GraphData};
use crate::heads::{Decoder, FeatureLearner, NodeClassifier};
use crate::loss::{sup_loss, LossCriterion};
use crate::model::PARTIAL_TRAILING_COLUMNS;
use crate::params::ParamGroup;

fn check_dims(graph: &GraphData, num_nodes: usize, num_features: usize) -> Result<()> {
    if graph.num_nodes() != num_nodes {
        return Err(Error::DimensionMismatch {
            expected: num_nodes,
            got: graph.num_nodes(),
        });
    }
    if graph.num_features() != num_features {
        return Err(Error::DimensionMismatch {
            expected: num_features,
            got: graph.num_features(),
        });
    }
    Ok(())
}

fn masked_loss(
    config: &InvarianceConfig,
    graph: &GraphData,
    labels: &Tensor,
    logits: &Tensor,
    criterion: LossCriterion,
) -> Result<Tensor> {
    let logits = graph.select_labelled(logits)?;
    let labels = graph.select_labelled(labels)?;
    let float_targets = config.rocauc || graph.dataset.uses_float_targets();
    sup_loss(&labels, &logits, criterion, float_targets)
}

// ============================================================================
// ERM BASELINE
// ============================================================================

/// Encoder plus classification head, trained on the plain supervised loss.
pub struct Baseline {
    config: InvarianceConfig,
    varmap: VarMap,
    num_nodes: usize,
    num_features: usize,
    encoder: Encoder,
    head: NodeClassifier,
    rng: StdRng,
    train: bool,
}

impl Baseline {
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
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let h = config.hidden_channels;
        let encoder = Encoder::from_config(
            &config,
            num_features,
            vb.pp("encoder"),
            ParamGroup::new(&varmap, "encoder"),
        )?;
        let head = NodeClassifier::new(h, h, num_classes, vb.pp("head"), ParamGroup::new(&varmap, "head"))?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            varmap,
            num_nodes,
            num_features,
            encoder,
            head,
            rng,
            train: true,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn set_training(&mut self, train: bool) {
        self.train = train;
    }

    /// Re-initialize the encoder. The head keeps its construction-time values.
    pub fn reset_parameters(&mut self) -> Result<()> {
        self.encoder.reset_parameters(&mut self.rng)
    }

    /// Masked supervised loss of the head on the encoder output.
    pub fn loss(&self, graph: &GraphData, criterion: LossCriterion) -> Result<Tensor> {
        check_dims(graph, self.num_nodes, self.num_features)?;
        let out = self.encoder.forward_t(&graph.features, &graph.edges, self.train)?;
        let logits = self.head.classify(&out)?;
        let loss = masked_loss(&self.config, graph, &graph.labels, &logits, criterion)?;
        debug!(loss = loss.to_scalar::<f32>()?, "baseline loss");
        Ok(loss)
    }

    /// Logits `(n, c)` without dropout; `partial` hides the trailing feature columns.
    pub fn infer(&self, graph: &GraphData, partial: bool) -> Result<Tensor> {
        check_dims(graph, self.num_nodes, self.num_features)?;
        let x = if partial {
            graph.features_without_trailing(PARTIAL_TRAILING_COLUMNS)?
        } else {
            graph.features.clone()
        };
        let out = self.encoder.forward_t(&x, &graph.edges, false)?;
        self.head.classify(&out)
    }

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
        masked_loss(&self.config, graph, y, &logits, criterion)
    }
}

// ============================================================================
// IRRELEVANT-LEARNER PRETRAINING
// ============================================================================

/// Pretrains an irrelevant learner to predict labels, alongside a relevant
/// learner and a label-conditioned decoder.
pub struct IrrelevantPretrainer {
    config: InvarianceConfig,
    varmap: VarMap,
    num_nodes: usize,
    num_features: usize,
    irrelevant: FeatureLearner,
    relevant: FeatureLearner,
    decoder: Decoder,
    classifier: NodeClassifier,
    rng: StdRng,
}

impl IrrelevantPretrainer {
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
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let group = |prefix: &str| ParamGroup::new(&varmap, prefix);
        let h = config.hidden_channels;

        let irrelevant = FeatureLearner::new(num_features, h, vb.pp("irrelevant"), group("irrelevant"))?;
        let relevant = FeatureLearner::new(num_features, h, vb.pp("relevant"), group("relevant"))?;
        // one extra input column carries the label
        let decoder = Decoder::new(2 * h + 1, h, num_features, vb.pp("decoder"), group("decoder"))?;
        let classifier = NodeClassifier::new(h, h, num_classes, vb.pp("classifier"), group("classifier"))?;
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            config,
            varmap,
            num_nodes,
            num_features,
            irrelevant,
            relevant,
            decoder,
            classifier,
            rng,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn reset_parameters(&mut self) -> Result<()> {
        let rng = &mut self.rng;
        self.irrelevant.reset_parameters(rng)?;
        self.relevant.reset_parameters(rng)?;
        self.decoder.reset_parameters(rng)?;
        self.classifier.reset_parameters(rng)
    }

    /// Mean supervised loss of the irrelevant classifier, and the features
    /// reconstructed from `[irrelevant ‖ relevant ‖ y]`.
    ///
    /// # Errors
    ///
    /// `Shape` unless the labels are a single column of class ids.
    pub fn forward(&self, graph: &GraphData, criterion: LossCriterion) -> Result<(Tensor, Tensor)> {
        check_dims(graph, self.num_nodes, self.num_features)?;
        let (_, cols) = graph.labels.dims2()?;
        if cols != 1 {
            return Err(Error::Shape(format!(
                "pretraining conditions on one label column, got {cols}"
            )));
        }

        let ir_feature = self.irrelevant.learn(&graph.features, &graph.edges)?;
        let re_feature = self.relevant.learn(&graph.features, &graph.edges)?;
        let y = graph.labels.to_dtype(DType::F32)?;
        let joint = Tensor::cat(&[&ir_feature, &re_feature, &y], 1)?;
        let reconstruction = self.decoder.decode(&joint, &graph.edges)?;

        let logits = self.classifier.classify(&ir_feature)?;
        let loss = masked_loss(&self.config, graph, &graph.labels, &logits, criterion)?;
        Ok((loss, reconstruction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DatasetKind;

    fn graph(n: usize, d: usize) -> GraphData {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (n, d), &device).unwrap();
        let y: Vec<u32> = (0..n as u32).map(|i| i % 3).collect();
        let y = Tensor::from_vec(y, n, &device).unwrap();
        GraphData::new(x, EdgeIndex::cycle(n), y, DatasetKind::default()).unwrap()
    }

    fn config() -> InvarianceConfig {
        InvarianceConfig::default().with_hidden_channels(8)
    }

    #[test]
    fn test_baseline_loss_finite() {
        let g = graph(6, 4);
        let model = Baseline::new(config(), 6, 3, 4, &Device::Cpu).unwrap();
        let loss = model.loss(&g, LossCriterion::Nll).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite() && loss >= 0.0);
    }

    #[test]
    fn test_baseline_rejects_wrong_graph() {
        let g = graph(5, 4);
        let model = Baseline::new(config(), 6, 3, 4, &Device::Cpu).unwrap();
        assert!(matches!(
            model.loss(&g, LossCriterion::Nll),
            Err(Error::DimensionMismatch { expected: 6, got: 5 })
        ));
    }

    #[test]
    fn test_pretrainer_reconstructs_features() {
        let g = graph(6, 4);
        let pre = IrrelevantPretrainer::new(config(), 6, 3, 4, &Device::Cpu).unwrap();
        let (loss, rebuilt) = pre.forward(&g, LossCriterion::Nll).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());
        assert_eq!(rebuilt.dims(), &[6, 4]);
    }
}
