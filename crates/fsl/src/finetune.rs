// Fine-tuning ProtoNet heads
//
// Per episode the backbone parameters are copied, the copy is trained on the
// support set (support embeddings classified against support prototypes) with
// SGD + momentum, and the query set is classified with the fine-tuned copy.
// The shared backbone is never written.
//
// The auto-lr variant picks the learning rate per episode: each class's
// support examples are split in two halves, every candidate rate fine-tunes
// on the first halves and is scored on the second, and the best-scoring rate
// (smallest on ties) fine-tunes on the full support set.

use fsl_core::{Backend, Tensor};
use fsl_meta::{ParameterCollection, Task};
use fsl_nn::{cross_entropy_with_labels, logits_accuracy};
use fsl_optim::{Optimizer, SGD};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protonet::ProtoNet;

pub const DEFAULT_MOMENTUM: f64 = 0.9;

/// Learning rates tried by [`ProtoNetAutoFinetune`], ascending.
pub const AUTO_LR_CANDIDATES: [f64; 4] = [0.0, 1e-4, 1e-3, 1e-2];

pub struct ProtoNetFinetune<B: Backend> {
    head: ProtoNet<B>,
    ada_steps: usize,
    ada_lr: f64,
    momentum: f64,
}

impl<B: Backend> ProtoNetFinetune<B> {
    pub fn new(head: ProtoNet<B>, ada_steps: usize, ada_lr: f64, momentum: f64) -> Self {
        ProtoNetFinetune {
            head,
            ada_steps,
            ada_lr,
            momentum,
        }
    }

    pub fn head(&self) -> &ProtoNet<B> {
        &self.head
    }

    pub fn ada_steps(&self) -> usize {
        self.ada_steps
    }

    pub fn ada_lr(&self) -> f64 {
        self.ada_lr
    }

    /// A private copy of the backbone parameters after `ada_steps` SGD steps
    /// on the support set of `task`.
    pub fn finetuned_params(&self, task: &Task<B>, lr: f64) -> Result<ParameterCollection<B>> {
        let backbone = self.head.backbone();
        let fast = backbone.params().clone_detached()?;
        let mut opt = SGD::new(fast.trainable(), lr, self.momentum, 0.0);
        for step in 0..self.ada_steps {
            let support_f = backbone.forward_with(&fast, &task.support_x, backbone.mode())?;
            let logits = self.head.classify(&support_f, &task.support_y, &support_f)?;
            let loss = cross_entropy_with_labels(&logits, &task.support_y)?;
            let value = loss.to_scalar_f64()?;
            if !value.is_finite() {
                return Err(fsl_meta::Error::AdaptationDiverged { step, loss: value }.into());
            }
            debug!(step, loss = value, lr, "finetune step");
            let grads = loss.backward()?;
            opt.step(&grads)?;
        }
        Ok(fast)
    }

    /// Query logits after fine-tuning with learning rate `lr`.
    pub fn predict_with_lr(&self, task: &Task<B>, lr: f64) -> Result<Tensor<B>> {
        task.validate(self.head.num_ways())?;
        if self.ada_steps == 0 || lr == 0.0 {
            return self.head.predict(task);
        }
        let fast = self.finetuned_params(task, lr)?;
        let backbone = self.head.backbone();
        self.head
            .logits_from(|x| backbone.forward_with(&fast, x, backbone.mode()), task)
    }

    pub fn predict(&self, task: &Task<B>) -> Result<Tensor<B>> {
        self.predict_with_lr(task, self.ada_lr)
    }
}

pub struct ProtoNetAutoFinetune<B: Backend> {
    inner: ProtoNetFinetune<B>,
    candidates: Vec<f64>,
}

impl<B: Backend> ProtoNetAutoFinetune<B> {
    pub fn new(head: ProtoNet<B>, ada_steps: usize, momentum: f64) -> Self {
        ProtoNetAutoFinetune {
            inner: ProtoNetFinetune::new(head, ada_steps, 0.0, momentum),
            candidates: AUTO_LR_CANDIDATES.to_vec(),
        }
    }

    pub fn head(&self) -> &ProtoNet<B> {
        self.inner.head()
    }

    pub fn candidates(&self) -> &[f64] {
        &self.candidates
    }

    /// Pseudo-support / pseudo-query episode built from the support set, or
    /// `None` when some class has fewer than two shots.
    fn split_support(&self, task: &Task<B>) -> Result<Option<Task<B>>> {
        let groups = task.support_by_class(self.head().num_ways());
        if groups.iter().any(|g| g.len() < 2) {
            return Ok(None);
        }
        let (mut s_idx, mut s_y, mut q_idx, mut q_y) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
        for (class, group) in groups.iter().enumerate() {
            let (first, second) = group.split_at(group.len() / 2);
            s_idx.extend_from_slice(first);
            s_y.extend(std::iter::repeat(class).take(first.len()));
            q_idx.extend_from_slice(second);
            q_y.extend(std::iter::repeat(class).take(second.len()));
        }
        Ok(Some(Task::new(
            task.support_x.index_rows(&s_idx)?,
            s_y,
            task.support_x.index_rows(&q_idx)?,
            q_y,
        )))
    }

    /// The candidate rate with the best pseudo-query accuracy.
    pub fn select_lr(&self, task: &Task<B>) -> Result<f64> {
        task.validate(self.head().num_ways())?;
        let pseudo = match self.split_support(task)? {
            Some(p) => p,
            None => {
                debug!("fewer than two shots for some class, not fine-tuning");
                return Ok(0.0);
            }
        };
        let mut best = (0.0, f64::NEG_INFINITY);
        for &lr in &self.candidates {
            let logits = match self.inner.predict_with_lr(&pseudo, lr) {
                Ok(l) => l,
                Err(Error::Meta(e)) if e.is_task_local() => {
                    warn!(lr, error = %e, "skipping learning rate");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let acc = logits_accuracy(&logits, &pseudo.query_y)?;
            debug!(lr, accuracy = acc, "learning rate candidate");
            if acc > best.1 {
                best = (lr, acc);
            }
        }
        Ok(best.0)
    }

    pub fn predict(&self, task: &Task<B>) -> Result<Tensor<B>> {
        let lr = self.select_lr(task)?;
        debug!(lr, "selected fine-tuning learning rate");
        self.inner.predict_with_lr(task, lr)
    }
}
