// Model factory
//
// `get_model` turns experiment arguments into one of the few-shot models:
//
//   vanilla          ProtoNet over the registry backbone
//   finetune         ProtoNet + per-episode SGD fine-tuning
//   finetune_autolr  ProtoNet + fine-tuning with a per-episode learning rate
//   maml             MetaLearner over conv4_no_classifier
//   resnet           MetaLearner over resnet18_no_head
//
// The prompt-token deploys and data augmentation need transformer internals
// and an image pipeline; they are rejected with UnsupportedDeploy.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use fsl_core::{Backend, DType, Tensor};
use fsl_meta::config::{conv4_no_classifier, resnet18_no_head};
use fsl_meta::{MetaLearner, MetaSettings, Mode, StepSize, Task};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backbone::BackboneRegistry;
use crate::checkpoint;
use crate::error::{Error, Result};
use crate::finetune::{ProtoNetAutoFinetune, ProtoNetFinetune};
use crate::protonet::ProtoNet;

/// Experiment arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArgs {
    /// Backbone architecture name, resolved by the registry.
    pub arch: String,
    pub deploy: String,
    pub num_ways: usize,
    /// Inner-loop steps (MAML) or fine-tuning steps (finetune heads).
    pub ada_steps: usize,
    pub ada_lr: f64,
    pub meta_lr: f64,
    /// Square input resolution.
    pub image_size: usize,
    pub no_pretrain: bool,
    /// Parameter checkpoint applied after construction.
    pub pretrained: Option<PathBuf>,
    pub first_order: bool,
    pub learn_step_size: bool,
    pub query_mode: Mode,
    /// Test-time adaptation steps of the MAML deploys.
    pub finetune_steps: usize,
    pub finetune_momentum: f64,
    pub aug_prob: f64,
    pub aug_types: Vec<String>,
}

impl Default for ModelArgs {
    fn default() -> Self {
        let meta = MetaSettings::default();
        ModelArgs {
            arch: "conv4".into(),
            deploy: "vanilla".into(),
            num_ways: meta.num_ways,
            ada_steps: meta.ada_steps,
            ada_lr: meta.ada_lr,
            meta_lr: meta.meta_lr,
            image_size: 84,
            no_pretrain: false,
            pretrained: None,
            first_order: meta.first_order,
            learn_step_size: false,
            query_mode: meta.query_mode,
            finetune_steps: meta.finetune_steps,
            finetune_momentum: crate::finetune::DEFAULT_MOMENTUM,
            aug_prob: 0.0,
            aug_types: Vec::new(),
        }
    }
}

impl ModelArgs {
    pub fn meta_settings(&self) -> MetaSettings {
        MetaSettings {
            num_ways: self.num_ways,
            ada_steps: self.ada_steps,
            ada_lr: self.ada_lr,
            meta_lr: self.meta_lr,
            step_size: if self.learn_step_size {
                StepSize::Learned
            } else {
                StepSize::Fixed
            },
            first_order: self.first_order,
            query_mode: self.query_mode,
            finetune_steps: self.finetune_steps,
        }
    }

    /// `[1, 3, image_size, image_size]`.
    pub fn input_dims(&self) -> [usize; 4] {
        [1, 3, self.image_size, self.image_size]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deploy {
    Vanilla,
    Finetune,
    FinetuneAutoLr,
    AdaTokens,
    AdaTokensEntMin,
    Maml,
    Resnet,
}

impl Deploy {
    pub const ALL: [Deploy; 7] = [
        Deploy::Vanilla,
        Deploy::Finetune,
        Deploy::FinetuneAutoLr,
        Deploy::AdaTokens,
        Deploy::AdaTokensEntMin,
        Deploy::Maml,
        Deploy::Resnet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Deploy::Vanilla => "vanilla",
            Deploy::Finetune => "finetune",
            Deploy::FinetuneAutoLr => "finetune_autolr",
            Deploy::AdaTokens => "ada_tokens",
            Deploy::AdaTokensEntMin => "ada_tokens_entmin",
            Deploy::Maml => "maml",
            Deploy::Resnet => "resnet",
        }
    }
}

impl fmt::Display for Deploy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Deploy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Deploy::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| Error::UnsupportedDeploy {
                deploy: s.to_string(),
                reason: "unknown deploy method".into(),
            })
    }
}

pub enum FewShotModel<B: Backend> {
    ProtoNet(ProtoNet<B>),
    Finetune(ProtoNetFinetune<B>),
    AutoFinetune(ProtoNetAutoFinetune<B>),
    Meta(MetaLearner<B>),
}

impl<B: Backend> FewShotModel<B> {
    pub fn name(&self) -> &'static str {
        match self {
            FewShotModel::ProtoNet(_) => "protonet",
            FewShotModel::Finetune(_) => "protonet_finetune",
            FewShotModel::AutoFinetune(_) => "protonet_auto_finetune",
            FewShotModel::Meta(_) => "maml",
        }
    }

    /// Query logits `[N_q, num_ways]` for `task`. The MAML variants adapt a
    /// private copy of their meta parameters first.
    pub fn predict(&self, task: &Task<B>) -> Result<Tensor<B>> {
        match self {
            FewShotModel::ProtoNet(m) => m.predict(task),
            FewShotModel::Finetune(m) => m.predict(task),
            FewShotModel::AutoFinetune(m) => m.predict(task),
            FewShotModel::Meta(m) => Ok(m.finetune(task)?.logits),
        }
    }

    pub fn as_meta(&self) -> Option<&MetaLearner<B>> {
        match self {
            FewShotModel::Meta(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_meta_mut(&mut self) -> Option<&mut MetaLearner<B>> {
        match self {
            FewShotModel::Meta(m) => Some(m),
            _ => None,
        }
    }
}

fn meta_learner<B: Backend>(
    args: &ModelArgs,
    features: &fsl_meta::LayerConfig,
    dtype: DType,
    device: &B::Device,
) -> Result<MetaLearner<B>> {
    let learner = MetaLearner::new(args.meta_settings(), features, &args.input_dims(), dtype, device)?;
    if let Some(path) = &args.pretrained {
        checkpoint::load_into(path, learner.params())?;
    }
    Ok(learner)
}

/// Build the model selected by `args.deploy`.
pub fn get_model<B: Backend>(
    args: &ModelArgs,
    registry: &BackboneRegistry<B>,
    dtype: DType,
    device: &B::Device,
) -> Result<FewShotModel<B>> {
    let deploy: Deploy = args.deploy.parse()?;
    let unsupported = |reason: &str| Error::UnsupportedDeploy {
        deploy: deploy.to_string(),
        reason: reason.into(),
    };
    if args.aug_prob > 0.0 && matches!(deploy, Deploy::Finetune | Deploy::FinetuneAutoLr) {
        return Err(unsupported("data augmentation during fine-tuning is not available"));
    }

    let model = match deploy {
        Deploy::Vanilla | Deploy::Finetune | Deploy::FinetuneAutoLr => {
            let head = ProtoNet::new(registry.load(args, dtype, device)?, args.num_ways, dtype, device)?;
            match deploy {
                Deploy::Vanilla => FewShotModel::ProtoNet(head),
                Deploy::Finetune => FewShotModel::Finetune(ProtoNetFinetune::new(
                    head,
                    args.ada_steps,
                    args.ada_lr,
                    args.finetune_momentum,
                )),
                _ => FewShotModel::AutoFinetune(ProtoNetAutoFinetune::new(
                    head,
                    args.ada_steps,
                    args.finetune_momentum,
                )),
            }
        }
        Deploy::AdaTokens | Deploy::AdaTokensEntMin => {
            return Err(unsupported("prompt-token adapters need a transformer backbone"))
        }
        Deploy::Maml => FewShotModel::Meta(meta_learner(args, &conv4_no_classifier(), dtype, device)?),
        Deploy::Resnet => FewShotModel::Meta(meta_learner(args, &resnet18_no_head(), dtype, device)?),
    };
    info!(deploy = %deploy, model = model.name(), "model ready");
    Ok(model)
}
