// Meta-learning controller (MAML)
//
// Per task:  INIT → ADAPT (ada_steps times) → EVALUATE
//
//   INIT      fork the meta parameters: graph-connected copies of the
//             trainable slots, private copies of the bn buffers
//   ADAPT     forward on the support set (train mode), cross-entropy,
//             gradients w.r.t. the adapted copy, θ' = θ - α ∇L. The update is
//             an ordinary tensor expression, so the query loss stays
//             differentiable w.r.t. the meta parameters through every step.
//   EVALUATE  forward on the query set with the adapted copy
//
// A meta step averages the query losses of a batch of tasks, backpropagates
// once through all inner loops and applies Adam to the meta parameters.
// A task whose loss becomes non-finite is excluded from the batch and logged;
// it is never dropped silently.

use fsl_core::{Backend, DType, Tensor};
use fsl_nn::{cross_entropy_with_labels, logits_accuracy};
use fsl_optim::{Adam, Optimizer};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{classifier, LayerConfig};
use crate::error::{Error, Result};
use crate::executor::{forward, Mode};
use crate::params::ParameterCollection;
use crate::task::Task;

/// Inner-loop step size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepSize {
    /// `ada_lr` for every slot.
    #[default]
    Fixed,
    /// One learnable step size per trainable slot, initialised to `ada_lr`
    /// and trained by the outer loop (Meta-SGD).
    Learned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaSettings {
    pub num_ways: usize,
    /// Inner-loop steps during meta-training.
    pub ada_steps: usize,
    pub ada_lr: f64,
    pub meta_lr: f64,
    pub step_size: StepSize,
    /// Treat inner gradients as constants (FOMAML).
    pub first_order: bool,
    /// Batch-norm mode of the query pass.
    pub query_mode: Mode,
    /// Inner-loop steps for test-time fine-tuning.
    pub finetune_steps: usize,
}

impl Default for MetaSettings {
    fn default() -> Self {
        MetaSettings {
            num_ways: 5,
            ada_steps: 5,
            ada_lr: 0.01,
            meta_lr: 1e-3,
            step_size: StepSize::Fixed,
            first_order: false,
            query_mode: Mode::Train,
            finetune_steps: 10,
        }
    }
}

impl MetaSettings {
    fn validate(&self) -> Result<()> {
        if self.num_ways == 0 {
            return Err(Error::config("num_ways must be positive"));
        }
        if !self.ada_lr.is_finite() || self.ada_lr < 0.0 {
            return Err(Error::config(format!("invalid ada_lr {}", self.ada_lr)));
        }
        if !self.meta_lr.is_finite() || self.meta_lr <= 0.0 {
            return Err(Error::config(format!("invalid meta_lr {}", self.meta_lr)));
        }
        Ok(())
    }
}

/// Result of INIT + ADAPT on one task.
pub struct Adaptation<B: Backend> {
    pub params: ParameterCollection<B>,
    /// Support loss before each inner step.
    pub support_losses: Vec<f64>,
}

/// Query-set result of EVALUATE.
pub struct Evaluation<B: Backend> {
    pub logits: Tensor<B>,
    pub loss: Tensor<B>,
    pub accuracy: f64,
}

pub struct TaskOutcome<B: Backend> {
    pub adaptation: Adaptation<B>,
    pub evaluation: Evaluation<B>,
}

/// Summary of one meta step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaStepReport {
    pub step: u64,
    /// Mean query loss over the included tasks.
    pub query_loss: f64,
    pub query_accuracy: f64,
    pub tasks: usize,
    /// Indices of tasks excluded because their adaptation diverged.
    pub excluded: Vec<usize>,
}

/// How the inner loop treats the graph.
#[derive(Debug, Clone, Copy)]
enum InnerLoop {
    /// Keep the update differentiable w.r.t. the starting parameters;
    /// `first_order` drops the second-order terms.
    Meta { first_order: bool },
    /// Plain fine-tuning: every step starts from fresh leaves.
    Detached,
}

pub struct MetaLearner<B: Backend> {
    settings: MetaSettings,
    config: LayerConfig,
    input_dims: Vec<usize>,
    embed_dim: usize,
    params: ParameterCollection<B>,
    step_sizes: Option<Vec<Tensor<B>>>,
    optimizer: Adam<B>,
}

impl<B: Backend> MetaLearner<B> {
    /// Build a learner over `feature_config` followed by a
    /// `linear [num_ways, embed_dim]` head.
    ///
    /// `input_dims` is a representative `[N, C, H, W]` input; the embedding
    /// width is inferred from it symbolically.
    pub fn new(
        settings: MetaSettings,
        feature_config: &LayerConfig,
        input_dims: &[usize],
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        settings.validate()?;
        let embed_dim = feature_config.embed_dim(input_dims)?;
        let mut config = feature_config.clone();
        config.extend(&classifier(settings.num_ways, embed_dim)?)?;

        let params = ParameterCollection::<B>::initialize(&config, dtype, device)?;
        let step_sizes = match settings.step_size {
            StepSize::Fixed => None,
            StepSize::Learned => Some(
                params
                    .trainable()
                    .iter()
                    .map(|_| Ok(Tensor::<B>::full(1, settings.ada_lr, dtype, device)?.set_variable()))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        let mut optimized = params.trainable();
        if let Some(sizes) = &step_sizes {
            optimized.extend(sizes.iter().cloned());
        }
        let optimizer = Adam::new(optimized, settings.meta_lr);

        info!(
            layers = config.len(),
            slots = params.len(),
            elements = params.num_elements(),
            embed_dim,
            "meta-learner initialised"
        );
        Ok(MetaLearner {
            settings,
            config,
            input_dims: input_dims.to_vec(),
            embed_dim,
            params,
            step_sizes,
            optimizer,
        })
    }

    pub fn settings(&self) -> &MetaSettings {
        &self.settings
    }

    /// Feature config plus classifier.
    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn params(&self) -> &ParameterCollection<B> {
        &self.params
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn input_dims(&self) -> &[usize] {
        &self.input_dims
    }

    pub fn step_sizes(&self) -> Option<&[Tensor<B>]> {
        self.step_sizes.as_deref()
    }

    /// Number of meta steps applied so far.
    pub fn meta_steps(&self) -> u64 {
        self.optimizer.step_count()
    }

    /// Overwrite the meta parameters with the values of `params`.
    pub fn load_params(&self, params: &ParameterCollection<B>) -> Result<()> {
        params.check_layout(self.params.layout())?;
        for (dst, src) in self.params.tensors().iter().zip(params.tensors()) {
            dst.update_data_inplace(&src.to_f64_vec()?)?;
        }
        Ok(())
    }

    /// Run the network with the meta parameters.
    pub fn forward(&self, x: &Tensor<B>, mode: Mode) -> Result<Tensor<B>> {
        forward(&self.config, &self.params, x, mode)
    }

    fn inner_loop(
        &self,
        mut fast: ParameterCollection<B>,
        task: &Task<B>,
        steps: usize,
        how: InnerLoop,
    ) -> Result<Adaptation<B>> {
        let mut support_losses = Vec::with_capacity(steps);
        for step in 0..steps {
            let logits = forward(&self.config, &fast, &task.support_x, Mode::Train)?;
            let loss = cross_entropy_with_labels(&logits, &task.support_y)?;
            let value = loss.to_scalar_f64()?;
            if !value.is_finite() {
                return Err(Error::AdaptationDiverged { step, loss: value });
            }
            debug!(step, loss = value, "inner step");
            support_losses.push(value);

            let grads = loss.backward()?;
            let current = fast.trainable();
            let mut updated = Vec::with_capacity(current.len());
            for (k, theta) in current.iter().enumerate() {
                let g = grads.get_or_zeros(theta)?;
                let g = match how {
                    InnerLoop::Meta { first_order: false } => g,
                    InnerLoop::Meta { first_order: true } | InnerLoop::Detached => g.detach(),
                };
                let delta = match &self.step_sizes {
                    Some(sizes) => match how {
                        InnerLoop::Meta { .. } => g.mul(&sizes[k])?,
                        InnerLoop::Detached => g.mul(&sizes[k].detach())?,
                    },
                    None => g.scale(self.settings.ada_lr)?,
                };
                let next = theta.sub(&delta)?;
                updated.push(match how {
                    InnerLoop::Meta { .. } => next,
                    InnerLoop::Detached => next.detach().set_variable(),
                });
            }
            fast = fast.with_trainable(updated)?;
        }
        Ok(Adaptation {
            params: fast,
            support_losses,
        })
    }

    /// INIT + ADAPT: the adapted copy of the meta parameters for `task`.
    pub fn adapt(&self, task: &Task<B>) -> Result<Adaptation<B>> {
        task.validate(self.settings.num_ways)?;
        let fast = self.params.fork()?;
        self.inner_loop(
            fast,
            task,
            self.settings.ada_steps,
            InnerLoop::Meta {
                first_order: self.settings.first_order,
            },
        )
    }

    /// EVALUATE: query logits, loss and accuracy under `params`.
    pub fn evaluate(&self, params: &ParameterCollection<B>, task: &Task<B>) -> Result<Evaluation<B>> {
        let logits = forward(&self.config, params, &task.query_x, self.settings.query_mode)?;
        let loss = cross_entropy_with_labels(&logits, &task.query_y)?;
        let accuracy = logits_accuracy(&logits, &task.query_y)?;
        Ok(Evaluation {
            logits,
            loss,
            accuracy,
        })
    }

    /// The whole per-task state machine. A non-finite query loss counts as
    /// divergence at step `ada_steps`.
    pub fn task_loss(&self, task: &Task<B>) -> Result<TaskOutcome<B>> {
        let adaptation = self.adapt(task)?;
        let evaluation = self.evaluate(&adaptation.params, task)?;
        let value = evaluation.loss.to_scalar_f64()?;
        if !value.is_finite() {
            return Err(Error::AdaptationDiverged {
                step: self.settings.ada_steps,
                loss: value,
            });
        }
        Ok(TaskOutcome {
            adaptation,
            evaluation,
        })
    }

    /// One outer-loop update over a batch of tasks.
    ///
    /// Diverged tasks are excluded and logged. If every task diverges the
    /// first divergence is returned and the meta parameters are unchanged.
    pub fn meta_train_step(&mut self, tasks: &[Task<B>]) -> Result<MetaStepReport> {
        if tasks.is_empty() {
            return Err(Error::InvalidTask("empty meta-batch".into()));
        }
        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut excluded = Vec::new();
        let mut first_divergence = None;
        for (i, task) in tasks.iter().enumerate() {
            match self.task_loss(task) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_task_local() => {
                    warn!(task = i, error = %e, "excluding task from meta-batch");
                    excluded.push(i);
                    first_divergence.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        if outcomes.is_empty() {
            return Err(first_divergence
                .unwrap_or_else(|| Error::InvalidTask("no task produced a loss".into())));
        }

        let n = outcomes.len() as f64;
        let mut total = outcomes[0].evaluation.loss.clone();
        for outcome in &outcomes[1..] {
            total = total.add(&outcome.evaluation.loss)?;
        }
        let meta_loss = total.scale(1.0 / n)?;
        let query_loss = meta_loss.to_scalar_f64()?;
        let query_accuracy = outcomes.iter().map(|o| o.evaluation.accuracy).sum::<f64>() / n;

        let grads = meta_loss.backward()?;
        self.optimizer.step(&grads)?;

        let adapted: Vec<&ParameterCollection<B>> =
            outcomes.iter().map(|o| &o.adaptation.params).collect();
        self.params.average_buffers_from(&adapted)?;

        let report = MetaStepReport {
            step: self.optimizer.step_count(),
            query_loss,
            query_accuracy,
            tasks: tasks.len(),
            excluded,
        };
        info!(
            step = report.step,
            loss = report.query_loss,
            accuracy = report.query_accuracy,
            excluded = report.excluded.len(),
            "meta step"
        );
        Ok(report)
    }

    /// Test-time adaptation: `finetune_steps` first-order steps on the
    /// support set from a private copy, then the query evaluation.
    /// The meta parameters are never touched.
    pub fn finetune(&self, task: &Task<B>) -> Result<Evaluation<B>> {
        task.validate(self.settings.num_ways)?;
        let fast = self.params.clone_detached()?;
        let adaptation =
            self.inner_loop(fast, task, self.settings.finetune_steps, InnerLoop::Detached)?;
        self.evaluate(&adaptation.params, task)
    }
}
