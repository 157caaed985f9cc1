//! Outer training cycle.
//!
//! One epoch runs the perturbation step (every `perturb_every` epochs),
//! then takes one optimizer step on each of the objectives 1 through 5.
//! Step 3 is trained on the dependence penalty plus the mean squared error
//! of the reconstructed features.

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::graph::GraphData;
use crate::loss::{mse, LossCriterion};
use crate::model::{InvarianceModel, Step, StepOutput};

/// Losses recorded for one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    /// `(step, loss)` for every objective trained this epoch, in order.
    pub step_losses: Vec<(Step, f32)>,
    /// Mean contrastive loss, if the perturbation step ran.
    pub perturbation_loss: Option<f32>,
}

impl EpochReport {
    /// Sum of the objective losses.
    pub fn total(&self) -> f32 {
        self.step_losses.iter().map(|(_, loss)| loss).sum()
    }

    pub fn loss(&self, step: Step) -> Option<f32> {
        self.step_losses
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, loss)| *loss)
    }
}

/// AdamW over every parameter of an [`InvarianceModel`].
pub struct Trainer {
    model: InvarianceModel,
    optimizer: AdamW,
    perturb_every: usize,
    history: Vec<EpochReport>,
}

impl Trainer {
    /// Wrap `model`, giving each environment a copy of `graph`'s adjacency.
    ///
    /// # Errors
    ///
    /// `Config` if `perturb_every` is zero.
    pub fn new(mut model: InvarianceModel, graph: &GraphData, perturb_every: usize) -> Result<Self> {
        if perturb_every == 0 {
            return Err(Error::Config("perturb_every must be > 0".to_string()));
        }
        model.initialize_environment_adjacency(graph)?;
        let params = ParamsAdamW {
            lr: model.config().learning_rate,
            weight_decay: model.config().weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(model.varmap().all_vars(), params)?;
        Ok(Self {
            model,
            optimizer,
            perturb_every,
            history: Vec::new(),
        })
    }

    pub fn model(&self) -> &InvarianceModel {
        &self.model
    }

    pub fn into_model(self) -> InvarianceModel {
        self.model
    }

    pub fn history(&self) -> &[EpochReport] {
        &self.history
    }

    /// Run one epoch and record its report.
    pub fn run_epoch(&mut self, graph: &GraphData, criterion: LossCriterion) -> Result<&EpochReport> {
        let epoch = self.history.len();
        self.model.set_training(true);

        let perturbation_loss = if epoch % self.perturb_every == 0 {
            match self.model.forward(graph, criterion, Step::Perturbation)? {
                StepOutput::Perturbation(outcome) => Some(outcome.mean_loss()),
                _ => None,
            }
        } else {
            None
        };

        let mut step_losses = Vec::with_capacity(Step::OBJECTIVES.len());
        for step in Step::OBJECTIVES {
            let loss = self.objective(graph, criterion, step)?;
            self.optimizer.backward_step(&loss)?;
            let value = loss.to_scalar::<f32>()?;
            debug!(epoch, step = step.index(), loss = value, "optimizer step");
            step_losses.push((step, value));
        }

        let report = EpochReport {
            epoch,
            step_losses,
            perturbation_loss,
        };
        info!(
            epoch,
            total = report.total(),
            perturbation = ?report.perturbation_loss,
            "epoch finished"
        );
        self.history.push(report);
        let last = self.history.len() - 1;
        Ok(&self.history[last])
    }

    /// Run `epochs` epochs.
    pub fn fit(&mut self, graph: &GraphData, criterion: LossCriterion, epochs: usize) -> Result<&[EpochReport]> {
        self.fit_with_callback(graph, criterion, epochs, |_| {})
    }

    /// Run `epochs` epochs, calling `callback` after each one.
    pub fn fit_with_callback<F>(
        &mut self,
        graph: &GraphData,
        criterion: LossCriterion,
        epochs: usize,
        mut callback: F,
    ) -> Result<&[EpochReport]>
    where
        F: FnMut(&EpochReport),
    {
        let start = self.history.len();
        for _ in 0..epochs {
            let report = self.run_epoch(graph, criterion)?;
            callback(report);
        }
        Ok(&self.history[start..])
    }

    fn objective(&mut self, graph: &GraphData, criterion: LossCriterion, step: Step) -> Result<Tensor> {
        match self.model.forward(graph, criterion, step)? {
            StepOutput::Loss(loss) => Ok(loss),
            StepOutput::WithReconstruction {
                loss,
                reconstruction,
            } => Ok((loss + mse(&reconstruction, &graph.features)?)?),
            StepOutput::Perturbation(_) => Err(Error::Config(format!(
                "step {} has no scalar objective",
                step.index()
            ))),
        }
    }
}
